// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The public IPC service: invoke methods, emit signals, register handlers
//! and (for debugging) monitor the whole bus.
//!
//! Incoming traffic is classified on the event-loop thread, gated by the
//! object-path table and the entitlement check, then handed to the worker
//! queue so user callbacks never run on the bus thread.

use log::*;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bus_protocol::channel::DEFAULT_METHOD_TIMEOUT_MS;
use bus_protocol::{BusAddress, Message, MessageType};

use crate::connection::{BusConnection, HandlerResult};
use crate::entitlements::EntitlementCache;
use crate::reply::{AsyncReplyGetter, AsyncReplySender};
use crate::sender_cache::SenderUidCache;
use crate::worker::HandlerQueue;
use crate::{
    Error, Method, MethodHandler, MonitorHandler, PackageManager, Signal, SignalHandler,
    VariantList,
};

/// One message observed while monitor mode is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEventType {
    MethodCall,
    MethodReturn,
    Signal,
    Error,
}

pub struct MonitorEvent {
    pub event_type: MonitorEventType,
    pub serial: u32,
    pub sender: String,
    pub destination: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub args: VariantList,
}

struct HandlerTables {
    methods: HashMap<String, (Method, MethodHandler)>,
    signals: BTreeMap<u64, (Signal, SignalHandler)>,
    object_paths: HashMap<String, usize>,
    monitor_rules: Vec<String>,
    monitor: Option<MonitorHandler>,
}

struct ServiceInner {
    connection: Arc<BusConnection>,
    address: BusAddress,
    service_name: String,
    default_timeout_ms: i32,
    tables: Mutex<HandlerTables>,
    next_signal_id: AtomicU64,
    running: AtomicBool,
    pool: HandlerQueue,
    entitlements: Mutex<Option<Arc<EntitlementCache>>>,
    sender_uids: Mutex<Option<Arc<SenderUidCache>>>,
    entitlement_check: AtomicBool,
}

/// A service endpoint on the bus: owns one connection, one event-loop thread
/// and one handler worker.
///
/// `start` and `stop` toggle dispatch of incoming traffic; registrations
/// survive the toggling, so a stop/start cycle leaves every handler
/// installed and functioning.
pub struct IpcService {
    inner: Arc<ServiceInner>,
}

impl IpcService {
    /// Connects to the bus at `address` and claims `service_name`.
    /// `default_timeout_ms` applies to method calls invoked with -1; passing
    /// -1 here selects the built-in default.
    pub fn new(
        address: &BusAddress,
        service_name: &str,
        default_timeout_ms: i32,
    ) -> Result<IpcService, Error> {
        if service_name.is_empty() {
            return Err(Error::InvalidArgument("empty service name".into()));
        }

        let connection = BusConnection::connect(address, Some(service_name))?;

        Ok(IpcService {
            inner: Arc::new(ServiceInner {
                connection,
                address: address.clone(),
                service_name: service_name.to_string(),
                default_timeout_ms: if default_timeout_ms < 0 {
                    DEFAULT_METHOD_TIMEOUT_MS
                } else {
                    default_timeout_ms
                },
                tables: Mutex::new(HandlerTables {
                    methods: HashMap::new(),
                    signals: BTreeMap::new(),
                    object_paths: HashMap::new(),
                    monitor_rules: Vec::new(),
                    monitor: None,
                }),
                next_signal_id: AtomicU64::new(1),
                running: AtomicBool::new(false),
                pool: HandlerQueue::new("bus-handlers"),
                entitlements: Mutex::new(None),
                sender_uids: Mutex::new(None),
                entitlement_check: AtomicBool::new(false),
            }),
        })
    }

    /// Like [`IpcService::new`], but also wires up the per-uid entitlement
    /// gate fed from `package_manager`. With `check_needed` false the caches
    /// are maintained but incoming calls are not gated.
    pub fn with_entitlements(
        address: &BusAddress,
        service_name: &str,
        package_manager: Arc<dyn PackageManager>,
        check_needed: bool,
        default_timeout_ms: i32,
    ) -> Result<IpcService, Error> {
        let service = IpcService::new(address, service_name, default_timeout_ms)?;

        let entitlements = Arc::new(EntitlementCache::new(package_manager));
        let sender_uids = SenderUidCache::new(&service, entitlements.clone());

        *service.inner.entitlements.lock().unwrap() = Some(entitlements);
        *service.inner.sender_uids.lock().unwrap() = Some(sender_uids);
        service
            .inner
            .entitlement_check
            .store(check_needed, Ordering::SeqCst);

        Ok(service)
    }

    /// The address this service is connected to.
    pub fn bus_address(&self) -> &BusAddress {
        &self.inner.address
    }

    /// Our unique connection name on the bus.
    pub fn unique_name(&self) -> &str {
        self.inner.connection.unique_name()
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// The sender→uid cache, when entitlement support was set up.
    pub fn sender_uid_cache(&self) -> Option<Arc<SenderUidCache>> {
        self.inner.sender_uids.lock().unwrap().clone()
    }

    /// The entitlement cache, when entitlement support was set up.
    pub fn entitlement_cache(&self) -> Option<Arc<EntitlementCache>> {
        self.inner.entitlements.lock().unwrap().clone()
    }

    /// Invokes `method` and returns a getter for collecting the reply later.
    /// A `timeout_ms` of -1 selects the service default.
    pub fn invoke_method(
        &self,
        method: &Method,
        args: &VariantList,
        timeout_ms: i32,
    ) -> Result<AsyncReplyGetter, Error> {
        if !self.inner.running.load(Ordering::SeqCst) {
            debug!("invoking a method without the service started");
        }
        if !method.is_valid() {
            return Err(Error::InvalidArgument(format!(
                "invalid method: name {}, interface {}, path {}",
                method.name, method.interface, method.object
            )));
        }

        let mut msg =
            Message::method_call(&method.service, &method.object, &method.interface, &method.name);
        msg.set_args(args)?;

        let timeout_ms = if timeout_ms < 0 {
            self.inner.default_timeout_ms
        } else {
            timeout_ms
        };

        let token = self.inner.connection.send_message_with_reply(msg, timeout_ms)?;
        Ok(AsyncReplyGetter::new(&self.inner.connection, token))
    }

    /// Invokes `method` and waits for its reply.
    pub fn invoke_method_sync(
        &self,
        method: &Method,
        args: &VariantList,
        timeout_ms: i32,
    ) -> Result<VariantList, Error> {
        self.invoke_method(method, args, timeout_ms)?.get_reply()
    }

    /// Broadcasts `signal` with the given arguments.
    pub fn emit_signal(&self, signal: &Signal, args: &VariantList) -> Result<(), Error> {
        if !signal.is_valid() {
            return Err(Error::InvalidArgument(format!(
                "invalid signal: name {}, interface {}, path {}",
                signal.name, signal.interface, signal.object
            )));
        }

        let mut msg = Message::signal(&signal.object, &signal.interface, &signal.name);
        msg.set_args(args)?;
        self.inner.connection.send_message_no_reply(msg)
    }

    /// Registers `handler` for incoming calls on `method`, whose service must
    /// be the name this service claimed. At most one handler may exist per
    /// match rule; the returned registration id equals the rule.
    pub fn register_method_handler(
        &self,
        method: &Method,
        handler: MethodHandler,
    ) -> Result<String, Error> {
        if !method.is_valid() {
            return Err(Error::InvalidArgument(format!(
                "invalid method: name {}, interface {}, path {}",
                method.name, method.interface, method.object
            )));
        }
        if method.service != self.inner.service_name {
            return Err(Error::InvalidArgument(format!(
                "method service '{}' is not this service",
                method.service
            )));
        }

        let rule = method.match_rule();
        {
            let mut tables = self.inner.tables.lock().unwrap();
            if tables.methods.contains_key(&rule) {
                return Err(Error::DuplicateHandler(rule));
            }
            register_object_path(&mut tables, &method.object);
            tables
                .methods
                .insert(rule.clone(), (method.clone(), handler));
        }

        // the tables lock must not be held across bus calls, a handler may be
        // dispatched concurrently and it takes the same lock
        if let Err(e) = self.inner.connection.add_match(&rule) {
            error!("failed to add match rule: {e}");

            let mut tables = self.inner.tables.lock().unwrap();
            tables.methods.remove(&rule);
            unregister_object_path(&mut tables, &method.object);
            return Err(e);
        }

        Ok(rule)
    }

    /// Registers `handler` for occurrences of `signal`. Multiple handlers may
    /// subscribe to the same signal; each registration gets a fresh numeric
    /// id and handlers run in registration order.
    pub fn register_signal_handler(
        &self,
        signal: &Signal,
        handler: SignalHandler,
    ) -> Result<String, Error> {
        if !signal.is_valid() {
            return Err(Error::InvalidArgument(format!(
                "invalid signal: name {}, interface {}, path {}",
                signal.name, signal.interface, signal.object
            )));
        }

        self.inner.connection.add_match(&signal.match_rule())?;

        let mut tables = self.inner.tables.lock().unwrap();
        register_object_path(&mut tables, &signal.object);
        let id = self.inner.next_signal_id.fetch_add(1, Ordering::SeqCst);
        tables.signals.insert(id, (signal.clone(), handler));

        Ok(id.to_string())
    }

    /// Removes the registration with `reg_id` (either table) and drops its
    /// match rule and object-path reference.
    ///
    /// Safe to call from any thread except from inside the handler being
    /// unregistered; a handler wanting to unregister itself must post the
    /// call to another thread.
    pub fn unregister_handler(&self, reg_id: &str) -> Result<(), Error> {
        let rule = {
            let mut tables = self.inner.tables.lock().unwrap();

            if let Some((method, _)) = tables.methods.remove(reg_id) {
                unregister_object_path(&mut tables, &method.object);
                method.match_rule()
            } else if let Some((signal, _)) = reg_id
                .parse::<u64>()
                .ok()
                .and_then(|id| tables.signals.remove(&id))
            {
                unregister_object_path(&mut tables, &signal.object);
                signal.match_rule()
            } else {
                return Err(Error::UnknownHandler(reg_id.to_string()));
            }
        };

        if let Err(e) = self.inner.connection.remove_match(&rule) {
            warn!("failed to remove match rule '{rule}': {e}");
        }

        Ok(())
    }

    /// Switches the service into monitor mode: normal dispatch (object-path
    /// filter, entitlement gate, handlers) is short-circuited and every
    /// message seen on the bus is fed to `handler`. Without rules a catch-all
    /// eavesdrop rule is installed.
    pub fn enable_monitor(
        &self,
        match_rules: &[String],
        handler: MonitorHandler,
    ) -> Result<(), Error> {
        let (old_rules, new_rules) = {
            let mut tables = self.inner.tables.lock().unwrap();

            let old_rules = std::mem::take(&mut tables.monitor_rules);

            let mut new_rules = Vec::new();
            if match_rules.is_empty() {
                new_rules.push("eavesdrop=true".to_string());
            } else {
                for rule in match_rules {
                    new_rules.push(format!("eavesdrop=true,{rule}"));
                }
            }

            tables.monitor_rules = new_rules.clone();
            tables.monitor = Some(handler);
            (old_rules, new_rules)
        };

        for rule in &old_rules {
            if let Err(e) = self.inner.connection.remove_match(rule) {
                warn!("failed to remove old monitor rule '{rule}': {e}");
            }
        }
        for rule in &new_rules {
            if let Err(e) = self.inner.connection.add_match(rule) {
                warn!("failed to add monitor rule '{rule}': {e}");
            }
        }

        Ok(())
    }

    /// Leaves monitor mode and restores normal dispatch. Call
    /// [`IpcService::flush`] afterwards to be sure the monitor callback has
    /// quiesced.
    pub fn disable_monitor(&self) -> Result<(), Error> {
        let rules = {
            let mut tables = self.inner.tables.lock().unwrap();
            if tables.monitor.is_none() {
                warn!("not in monitor mode");
                return Err(Error::InvalidArgument("not in monitor mode".into()));
            }
            tables.monitor = None;
            std::mem::take(&mut tables.monitor_rules)
        };

        for rule in &rules {
            if let Err(e) = self.inner.connection.remove_match(rule) {
                warn!("failed to remove monitor rule '{rule}': {e}");
            }
        }

        Ok(())
    }

    /// True when `service_name` currently has an owner on the bus.
    pub fn is_service_available(&self, service_name: &str) -> Result<bool, Error> {
        if !self.inner.running.load(Ordering::SeqCst) {
            debug!("checking service availability without the service started");
        }
        self.inner.connection.name_has_owner(service_name)
    }

    /// Blocks until every handler queued before this call has completed. Do
    /// not call while holding a lock a handler might need.
    pub fn flush(&self) {
        self.inner.pool.sync();
    }

    /// Starts dispatching incoming messages to registered handlers.
    pub fn start(&self) -> bool {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            error!("IPC service already started, start() has no effect");
            return false;
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .connection
            .set_message_filter(Some(Arc::new(move |msg| match weak.upgrade() {
                Some(inner) => handle_incoming(&inner, msg),
                None => HandlerResult::NotHandled(msg),
            })));
        true
    }

    /// Stops dispatching and waits for already-queued handlers to finish.
    pub fn stop(&self) -> bool {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            info!("IPC service not running, stop() has no effect");
            return false;
        }

        self.inner.connection.set_message_filter(None);
        self.inner.pool.sync();
        true
    }
}

impl Drop for IpcService {
    fn drop(&mut self) {
        self.stop();
        self.unregister_all();
        self.inner.connection.disconnect();
    }
}

impl IpcService {
    fn unregister_all(&self) {
        let rules: Vec<String> = {
            let mut tables = self.inner.tables.lock().unwrap();

            let mut rules: Vec<String> =
                tables.methods.values().map(|(m, _)| m.match_rule()).collect();
            rules.extend(tables.signals.values().map(|(s, _)| s.match_rule()));
            rules.extend(tables.monitor_rules.drain(..));

            tables.methods.clear();
            tables.signals.clear();
            tables.object_paths.clear();
            tables.monitor = None;
            rules
        };

        for rule in &rules {
            if let Err(e) = self.inner.connection.remove_match(rule) {
                debug!("failed to remove match rule '{rule}': {e}");
            }
        }
    }
}

fn register_object_path(tables: &mut HandlerTables, path: &str) {
    *tables.object_paths.entry(path.to_string()).or_insert(0) += 1;
}

fn unregister_object_path(tables: &mut HandlerTables, path: &str) {
    match tables.object_paths.get_mut(path) {
        None => error!("object path '{path}' not registered"),
        Some(count) => {
            *count -= 1;
            if *count == 0 {
                tables.object_paths.remove(path);
            }
        }
    }
}

/// Classifies one incoming message and dispatches it. Runs on the event-loop
/// thread.
fn handle_incoming(inner: &Arc<ServiceInner>, msg: Message) -> HandlerResult {
    let monitor = inner.tables.lock().unwrap().monitor.clone();
    if let Some(monitor) = monitor {
        return handle_monitor_event(inner, monitor, &msg);
    }

    let (Some(path), Some(interface), Some(member)) = (
        msg.path.as_deref(),
        msg.interface.as_deref(),
        msg.member.as_deref(),
    ) else {
        return HandlerResult::NotHandled(msg);
    };

    {
        let tables = inner.tables.lock().unwrap();
        if !tables.object_paths.contains_key(path) {
            return HandlerResult::NotHandled(msg);
        }
    }

    match msg.msg_type {
        MessageType::Signal => {
            let signal = Signal::new(path, interface, member);
            handle_signal(inner, &signal, &msg)
        }
        MessageType::MethodCall => {
            let sender = msg.sender.clone().unwrap_or_default();
            if !is_message_allowed(inner, &sender, interface) {
                info!("dropping method call from '{sender}' on '{interface}': not entitled");
                return HandlerResult::Handled;
            }

            let method = Method::new(
                inner.service_name.as_str(),
                path,
                interface,
                member,
            );
            handle_method_call(inner, &method, msg)
        }
        _ => HandlerResult::NotHandled(msg),
    }
}

fn handle_signal(inner: &Arc<ServiceInner>, signal: &Signal, msg: &Message) -> HandlerResult {
    let args = match msg.args() {
        Ok(args) => args,
        Err(e) => {
            error!("unable to parse signal arguments: {e}");
            return HandlerResult::Handled;
        }
    };

    let mut matched = false;
    let tables = inner.tables.lock().unwrap();
    // in id order, which is registration order
    for (_, (registered, handler)) in tables.signals.iter() {
        if registered == signal {
            matched = true;
            let handler = handler.clone();
            let args = args.clone();
            inner.pool.post(move || handler(args));
        }
    }

    if matched {
        HandlerResult::Handled
    } else {
        debug!("no handler registered for signal {}", signal.name);
        HandlerResult::Handled
    }
}

fn handle_method_call(
    inner: &Arc<ServiceInner>,
    method: &Method,
    msg: Message,
) -> HandlerResult {
    let handler = {
        let tables = inner.tables.lock().unwrap();
        tables
            .methods
            .get(&method.match_rule())
            .map(|(_, handler)| handler.clone())
    };

    let Some(handler) = handler else {
        return HandlerResult::NotHandled(msg);
    };

    let args = match msg.args() {
        Ok(args) => args,
        Err(e) => {
            error!("unable to parse method call arguments: {e}");
            return HandlerResult::NotHandled(msg);
        }
    };

    let sender = AsyncReplySender::new(&inner.connection, &msg, args);
    inner.pool.post(move || handler(sender));

    HandlerResult::Handled
}

fn handle_monitor_event(
    inner: &Arc<ServiceInner>,
    monitor: MonitorHandler,
    msg: &Message,
) -> HandlerResult {
    let (event_type, serial, member) = match msg.msg_type {
        MessageType::MethodCall => (
            MonitorEventType::MethodCall,
            msg.serial,
            msg.member.clone(),
        ),
        MessageType::Signal => (MonitorEventType::Signal, msg.serial, msg.member.clone()),
        MessageType::MethodReturn => (
            MonitorEventType::MethodReturn,
            msg.reply_serial.unwrap_or(0),
            None,
        ),
        MessageType::Error => (
            MonitorEventType::Error,
            msg.reply_serial.unwrap_or(0),
            msg.error_name.clone(),
        ),
    };

    let args = match msg.args() {
        Ok(args) => args,
        Err(e) => {
            error!("failed to parse arguments for a monitored message: {e}");
            return HandlerResult::Handled;
        }
    };

    let event = MonitorEvent {
        event_type,
        serial,
        sender: msg.sender.clone().unwrap_or_default(),
        destination: msg.destination.clone().unwrap_or_default(),
        path: msg.path.clone().unwrap_or_default(),
        interface: msg.interface.clone().unwrap_or_default(),
        member: member.unwrap_or_default(),
        args,
    };

    inner.pool.post(move || monitor(event));
    HandlerResult::Handled
}

/// The entitlement gate for incoming method calls.
///
/// Whitelisted interfaces skip the check entirely; otherwise the sender is
/// resolved to a uid (cached per sender name) and the uid's capability map
/// decides.
fn is_message_allowed(inner: &Arc<ServiceInner>, sender: &str, interface: &str) -> bool {
    let entitlements = inner.entitlements.lock().unwrap().clone();
    let sender_uids = inner.sender_uids.lock().unwrap().clone();

    let (Some(entitlements), Some(sender_uids)) = (entitlements, sender_uids) else {
        return true;
    };
    if !inner.entitlement_check.load(Ordering::SeqCst) {
        return true;
    }

    if entitlements.is_interface_whitelisted(interface) {
        return true;
    }

    if sender.is_empty() {
        warn!("method call without a sender name, denying");
        return false;
    }

    let uid = match sender_uids.user_id(sender) {
        Some(uid) => uid,
        None => {
            // resolving the uid costs a round-trip to the daemon, which is
            // why the result is cached against the sender name
            let uid = match inner.connection.get_unix_user(sender) {
                Ok(uid) => uid,
                Err(e) => {
                    warn!("failed to resolve uid of '{sender}': {e}");
                    return false;
                }
            };

            #[cfg(debug_assertions)]
            if uid == 0 {
                debug!("message sent by root in a debug build, skipping the entitlement check");
                return true;
            }

            sender_uids.add_sender_uid(sender, uid);
            uid
        }
    };

    entitlements.is_allowed(uid, &inner.service_name, interface)
}
