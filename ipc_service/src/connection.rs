// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The thread-safe bus connection. Wraps the single-threaded engine, bounces
//! every operation through the event dispatcher, and correlates outbound
//! method calls with their replies by opaque 64-bit tokens.

use log::*;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bus_protocol::channel::{Channel, Dispatched};
use bus_protocol::{
    BusAddress, Message, MessageType, DBUS_INTERFACE, DBUS_PATH, DBUS_SERVICE,
    REQUEST_NAME_FLAG_DO_NOT_QUEUE, REQUEST_NAME_REPLY_PRIMARY_OWNER,
};

use crate::dispatcher::EventDispatcher;
use crate::{process_val, Error, Variant};

/// Upper bound applied in [`BusConnection::get_reply`] on top of the per-call
/// deadline. In normal operation the engine always produces a reply (real or
/// synthesised) well before this; hitting it indicates an engine bug.
const REPLY_SAFETY_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for the administrative calls to the bus daemon itself.
const DAEMON_CALL_TIMEOUT: Duration = Duration::from_secs(25);

/// What the router does when the installed filter declined a message.
pub enum HandlerResult {
    Handled,
    NotHandled(Message),
}

/// The message filter installed by the service facade. Runs on the event-loop
/// thread for every incoming message that is not a tracked reply.
pub type MessageFilter = Arc<dyn Fn(Message) -> HandlerResult + Send + Sync>;

struct ReplyTable {
    map: Mutex<HashMap<u64, Option<Message>>>,
    cond: Condvar,
}

pub struct BusConnection {
    channel: Arc<Mutex<Channel>>,
    dispatcher: EventDispatcher,
    replies: Arc<ReplyTable>,
    routes: Arc<Mutex<HashMap<u32, u64>>>,
    filter: Arc<Mutex<Option<MessageFilter>>>,
    token_counter: Arc<AtomicU64>,
    service_name: Option<String>,
    unique_name: String,
    connected: Mutex<bool>,
}

impl BusConnection {
    /// Opens a private connection to `address`, registers on the bus, and
    /// optionally claims `service_name` with do-not-queue semantics.
    ///
    /// A name that already has an owner is fatal; being granted the name
    /// without primary ownership is only logged. On any failure the
    /// connection is closed and released.
    pub fn connect(
        address: &BusAddress,
        service_name: Option<&str>,
    ) -> Result<Arc<BusConnection>, Error> {
        let mut channel = Channel::open(address)?;

        if let Some(name) = service_name {
            if let Err(e) = reserve_service_name(&mut channel, name) {
                channel.disconnect();
                return Err(e);
            }
        }

        let unique_name = channel.unique_name().to_string();
        let channel = Arc::new(Mutex::new(channel));
        let replies = Arc::new(ReplyTable {
            map: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        });
        let routes = Arc::new(Mutex::new(HashMap::new()));
        let filter: Arc<Mutex<Option<MessageFilter>>> = Arc::new(Mutex::new(None));

        let dispatcher = EventDispatcher::new()?;

        let router = {
            let replies = replies.clone();
            let routes = routes.clone();
            let filter = filter.clone();
            let channel = channel.clone();

            Arc::new(move |item: Dispatched| {
                route_dispatched(item, &replies, &routes, &filter, &channel)
            })
        };

        dispatcher.start(channel.clone(), router)?;

        Ok(Arc::new(BusConnection {
            channel,
            dispatcher,
            replies,
            routes,
            filter,
            token_counter: Arc::new(AtomicU64::new(1)),
            service_name: service_name.map(str::to_string),
            unique_name,
            connected: Mutex::new(true),
        }))
    }

    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    pub fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref()
    }

    /// Installs (or clears) the incoming-message filter, then flushes so the
    /// previous filter cannot run after this returns.
    pub fn set_message_filter(&self, filter: Option<MessageFilter>) {
        *self.filter.lock().unwrap() = filter;
        if self.dispatcher.is_running() {
            let _ = self.flush();
        }
    }

    /// Queues a method call and returns the token its reply will be filed
    /// under. The token must be consumed by [`BusConnection::get_reply`] or
    /// [`BusConnection::cancel_reply`]; disconnecting consumes leftovers.
    pub fn send_message_with_reply(&self, msg: Message, timeout_ms: i32) -> Result<u64, Error> {
        let channel = self.channel.clone();
        let replies = self.replies.clone();
        let routes = self.routes.clone();
        let counter = self.token_counter.clone();

        self.dispatcher.call_in_event_loop(move || {
            let serial = channel.lock().unwrap().send_with_reply(msg, timeout_ms)?;

            let token = counter.fetch_add(1, Ordering::SeqCst);
            replies.map.lock().unwrap().insert(token, None);
            routes.lock().unwrap().insert(serial, token);

            Ok(token)
        })?
    }

    /// Sends a message without tracking a reply (signals, replies, and calls
    /// flagged no-reply-expected).
    pub fn send_message_no_reply(&self, msg: Message) -> Result<(), Error> {
        let channel = self.channel.clone();

        self.dispatcher.call_in_event_loop(move || {
            channel.lock().unwrap().send(msg)?;
            Ok(())
        })?
    }

    /// Blocks until the reply for `token` arrives and hands it over, erasing
    /// the token. A safety bound guards against the engine never completing
    /// the call; when it trips, the token is erased and `Timeout` returned.
    pub fn get_reply(&self, token: u64) -> Result<Message, Error> {
        let deadline = Instant::now() + REPLY_SAFETY_TIMEOUT;
        let mut map = self.replies.map.lock().unwrap();

        loop {
            match map.get(&token) {
                None => {
                    error!("reply token {token} is not in the table");
                    return Err(Error::Bus(format!("unknown reply token {token}")));
                }
                Some(Some(_)) => {
                    if let Some(Some(reply)) = map.remove(&token) {
                        return Ok(reply);
                    }
                }
                Some(None) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        error!(
                            "exceeded the maximum wait for a reply ({}s)",
                            REPLY_SAFETY_TIMEOUT.as_secs()
                        );
                        map.remove(&token);
                        return Err(Error::Timeout);
                    }

                    map = match self.replies.cond.wait_timeout(map, remaining) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            }
        }
    }

    /// Erases the token and releases its reply message if one arrived.
    pub fn cancel_reply(&self, token: u64) -> bool {
        let mut map = self.replies.map.lock().unwrap();
        if map.remove(&token).is_none() {
            error!("reply token {token} is not in the table");
            return false;
        }
        true
    }

    /// True when `name` currently has an owner on the bus.
    pub fn name_has_owner(&self, name: &str) -> Result<bool, Error> {
        let reply = self.daemon_call("NameHasOwner", vec![name.into()])?;
        Ok(process_val::<bool>(&reply.args()?, 0)?)
    }

    /// The unix user id of the peer that owns `name`.
    pub fn get_unix_user(&self, name: &str) -> Result<u32, Error> {
        let reply = self.daemon_call("GetConnectionUnixUser", vec![name.into()])?;
        Ok(process_val::<u32>(&reply.args()?, 0)?)
    }

    pub fn add_match(&self, rule: &str) -> Result<(), Error> {
        self.daemon_call("AddMatch", vec![rule.into()]).map(|_| ())
    }

    pub fn remove_match(&self, rule: &str) -> Result<(), Error> {
        self.daemon_call("RemoveMatch", vec![rule.into()])
            .map(|_| ())
    }

    /// Pushes all queued outbound traffic to the socket.
    pub fn flush(&self) -> Result<(), Error> {
        let channel = self.channel.clone();
        self.dispatcher.call_in_event_loop(move || {
            channel.lock().unwrap().flush_blocking()?;
            Ok(())
        })?
    }

    fn daemon_call(&self, member: &str, args: Vec<Variant>) -> Result<Message, Error> {
        let mut msg = Message::method_call(DBUS_SERVICE, DBUS_PATH, DBUS_INTERFACE, member);
        msg.set_args(&args)?;

        let channel = self.channel.clone();
        let reply = self.dispatcher.call_in_event_loop(move || {
            channel
                .lock()
                .unwrap()
                .blocking_call(msg, DAEMON_CALL_TIMEOUT)
        })??;

        if reply.msg_type == MessageType::Error {
            return Err(Error::Bus(format!(
                "{member} failed: {}",
                reply.error_name.as_deref().unwrap_or("unknown error")
            )));
        }
        Ok(reply)
    }

    /// Stops the dispatcher, removes the filter, releases the claimed name,
    /// closes the connection and consumes every outstanding reply token.
    pub fn disconnect(&self) {
        {
            let mut connected = self.connected.lock().unwrap();
            if !*connected {
                debug!("not connected");
                return;
            }
            *connected = false;
        }

        self.dispatcher.stop();
        *self.filter.lock().unwrap() = None;

        {
            let mut channel = self.channel.lock().unwrap();

            if let Some(name) = &self.service_name {
                let mut msg =
                    Message::method_call(DBUS_SERVICE, DBUS_PATH, DBUS_INTERFACE, "ReleaseName");
                if msg.set_args(&vec![name.as_str().into()]).is_ok() {
                    if let Err(e) = channel.blocking_call(msg, Duration::from_secs(5)) {
                        warn!("failed to release service name: {e}");
                    }
                }
            }

            channel.disconnect();
        }

        let mut map = self.replies.map.lock().unwrap();
        if !map.is_empty() {
            warn!("outstanding replies left over, cleaning up");
            map.clear();
        }
        self.routes.lock().unwrap().clear();
        self.replies.cond.notify_all();
    }
}

impl Drop for BusConnection {
    fn drop(&mut self) {
        if *self.connected.lock().unwrap() {
            error!("connection dropped while still connected, forcing disconnect");
            self.disconnect();
        }
    }
}

fn route_dispatched(
    item: Dispatched,
    replies: &ReplyTable,
    routes: &Mutex<HashMap<u32, u64>>,
    filter: &Mutex<Option<MessageFilter>>,
    channel: &Mutex<Channel>,
) {
    match item {
        Dispatched::Reply {
            call_serial,
            message,
        } => {
            let token = routes.lock().unwrap().remove(&call_serial);
            let Some(token) = token else {
                debug!("reply for serial {call_serial} has no route, dropping");
                return;
            };

            let mut map = replies.map.lock().unwrap();
            match map.get_mut(&token) {
                Some(slot) => {
                    *slot = Some(message);
                    replies.cond.notify_all();
                }
                // cancelled while in flight; release the reply
                None => debug!("reply token {token} was cancelled, dropping reply"),
            }
        }
        Dispatched::Message(message) => {
            let handler = filter.lock().unwrap().clone();
            let outcome = match handler {
                Some(f) => f(message),
                None => {
                    trace!("no handler installed for incoming messages");
                    HandlerResult::NotHandled(message)
                }
            };

            if let HandlerResult::NotHandled(msg) = outcome {
                reply_unknown_method(&msg, channel);
            }
        }
    }
}

/// A method call nobody claimed gets a bus-level UnknownMethod error so the
/// caller fails fast instead of waiting out its timeout.
fn reply_unknown_method(msg: &Message, channel: &Mutex<Channel>) {
    if msg.msg_type != MessageType::MethodCall {
        return;
    }
    if msg.flags & bus_protocol::message::FLAG_NO_REPLY_EXPECTED != 0 {
        return;
    }

    let text = format!(
        "No such method '{}' on interface '{}'",
        msg.member.as_deref().unwrap_or(""),
        msg.interface.as_deref().unwrap_or("")
    );
    let error = Message::error(
        msg.serial,
        msg.sender.as_deref(),
        bus_protocol::ERROR_UNKNOWN_METHOD,
        &text,
    );

    if let Err(e) = channel.lock().unwrap().send(error) {
        debug!("failed to send UnknownMethod reply: {e}");
    }
}

fn reserve_service_name(channel: &mut Channel, name: &str) -> Result<(), Error> {
    let mut msg = Message::method_call(DBUS_SERVICE, DBUS_PATH, DBUS_INTERFACE, "NameHasOwner");
    msg.set_args(&vec![name.into()])?;
    let reply = channel.blocking_call(msg, DAEMON_CALL_TIMEOUT)?;
    if reply.msg_type == MessageType::Error {
        return Err(Error::Bus(format!(
            "error checking for an owner of '{name}': {}",
            reply.error_name.as_deref().unwrap_or("unknown error")
        )));
    }
    if process_val::<bool>(&reply.args()?, 0)? {
        return Err(Error::Bus(format!("bus name '{name}' already reserved")));
    }

    info!("bus name {name} doesn't have an owner, reserving it");

    let mut msg = Message::method_call(DBUS_SERVICE, DBUS_PATH, DBUS_INTERFACE, "RequestName");
    msg.set_args(&vec![
        name.into(),
        Variant::Uint32(REQUEST_NAME_FLAG_DO_NOT_QUEUE),
    ])?;
    let reply = channel.blocking_call(msg, DAEMON_CALL_TIMEOUT)?;
    if reply.msg_type == MessageType::Error {
        return Err(Error::Bus(format!(
            "error requesting bus name '{name}': {}",
            reply.error_name.as_deref().unwrap_or("unknown error")
        )));
    }

    if process_val::<u32>(&reply.args()?, 0)? != REQUEST_NAME_REPLY_PRIMARY_OWNER {
        warn!("primary ownership not granted for bus name {name}");
    } else {
        info!("bus name {name} is now owned by this connection");
    }

    Ok(())
}
