// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Thread-safe IPC service over a message bus.
//!
//! The public surface is [`IpcService`]: invoke methods, emit signals and
//! register handlers from any thread. Internally every bus operation is
//! serialised through a single event-loop thread owned by
//! [`dispatcher::EventDispatcher`]; user callbacks run on a separate FIFO
//! worker so a slow handler can never stall bus traffic.

pub mod connection;
pub mod dispatcher;
pub mod entitlements;
pub mod reply;
pub mod sender_cache;
pub mod service;
pub mod timeouts;
pub mod token;
pub mod watches;
pub mod worker;

use std::fmt;
use std::sync::Arc;

pub use bus_protocol::{
    process_val, BusAddress, DictValue, ObjectPath, UnixFd, Variant, VariantList,
};
pub use connection::BusConnection;
pub use entitlements::{EntitlementCache, PackageManager, PackageMetadata};
pub use reply::{AsyncReplyGetter, AsyncReplySender};
pub use sender_cache::SenderUidCache;
pub use service::{IpcService, MonitorEvent, MonitorEventType};

/// Handler invoked for each incoming call on a registered method. The reply
/// sender must be used to answer the call; dropping it without replying is
/// logged as a protocol error.
pub type MethodHandler = Arc<dyn Fn(AsyncReplySender) + Send + Sync>;

/// Handler invoked for each occurrence of a subscribed signal.
pub type SignalHandler = Arc<dyn Fn(VariantList) + Send + Sync>;

/// Handler receiving every message seen while monitor mode is enabled.
pub type MonitorHandler = Arc<dyn Fn(MonitorEvent) + Send + Sync>;

/// Identity of a remote method: who to call, where, and what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub service: String,
    pub object: String,
    pub interface: String,
    pub name: String,
}

impl Method {
    pub fn new<S: Into<String>>(service: S, object: S, interface: S, name: S) -> Method {
        Method {
            service: service.into(),
            object: object.into(),
            interface: interface.into(),
            name: name.into(),
        }
    }

    /// Object, interface and name must be non-empty; for a method the service
    /// must be too.
    pub fn is_valid(&self) -> bool {
        !self.service.is_empty()
            && !self.object.is_empty()
            && !self.interface.is_empty()
            && !self.name.is_empty()
    }

    /// Canonical match rule selecting calls to this method.
    pub fn match_rule(&self) -> String {
        format!(
            "type='method_call',interface='{}',member='{}',path='{}',destination='{}'",
            self.interface, self.name, self.object, self.service
        )
    }
}

/// Identity of a signal: the emitting object, interface and member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub object: String,
    pub interface: String,
    pub name: String,
}

impl Signal {
    pub fn new<S: Into<String>>(object: S, interface: S, name: S) -> Signal {
        Signal {
            object: object.into(),
            interface: interface.into(),
            name: name.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.object.is_empty() && !self.interface.is_empty() && !self.name.is_empty()
    }

    /// Canonical match rule selecting occurrences of this signal.
    pub fn match_rule(&self) -> String {
        format!(
            "type='signal',interface='{}',member='{}',path='{}'",
            self.interface, self.name, self.object
        )
    }
}

/// The error kinds surfaced by the service.
#[derive(Debug)]
pub enum Error {
    /// A method or signal identity failed validation.
    InvalidArgument(String),

    /// The operation requires a live bus connection.
    NotConnected,

    /// Argument encoding failed; nothing was sent.
    Marshal(String),

    /// A received message body could not be decoded.
    Demarshal(String),

    /// A typed argument extraction saw the wrong variant tag.
    TypeMismatch { index: usize, expected: &'static str },

    /// A method call deadline or an internal safety bound expired.
    Timeout,

    /// A method handler is already registered for the same match rule.
    DuplicateHandler(String),

    /// Unregistration was requested for an id not in either handler table.
    UnknownHandler(String),

    /// The entitlement check rejected an incoming call.
    PermissionDenied,

    /// A bus-level operation failed; carries the underlying detail.
    Bus(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidArgument(e) => write!(f, "Invalid argument: {e}"),
            Self::NotConnected => write!(f, "Not connected to the bus"),
            Self::Marshal(e) => write!(f, "Marshal error: {e}"),
            Self::Demarshal(e) => write!(f, "Demarshal error: {e}"),
            Self::TypeMismatch { index, expected } => {
                write!(f, "Type mismatch: argument {index} is not a {expected}")
            }
            Self::Timeout => write!(f, "Timed out"),
            Self::DuplicateHandler(rule) => {
                write!(f, "A method handler already exists for '{rule}'")
            }
            Self::UnknownHandler(id) => write!(f, "No handler registered with id '{id}'"),
            Self::PermissionDenied => write!(f, "Permission denied"),
            Self::Bus(e) => write!(f, "Bus error: {e}"),
        }
    }
}

impl From<bus_protocol::Error> for Error {
    fn from(e: bus_protocol::Error) -> Error {
        match e {
            bus_protocol::Error::Marshal(m) => Error::Marshal(m),
            bus_protocol::Error::Demarshal(m) => Error::Demarshal(m),
            bus_protocol::Error::TypeMismatch { index, expected } => {
                Error::TypeMismatch { index, expected }
            }
            bus_protocol::Error::Timeout => Error::Timeout,
            bus_protocol::Error::Disconnected => Error::NotConnected,
            other => Error::Bus(other.to_string()),
        }
    }
}
