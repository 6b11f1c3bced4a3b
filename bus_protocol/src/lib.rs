// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

pub mod address;
pub mod auth;
pub mod channel;
pub mod message;
pub mod variant;
pub mod wire;

use std::fmt;
use std::sync::Once;

pub use address::BusAddress;
pub use channel::{Channel, Dispatched, TimerRequest, WatchId, WatchRequest};
pub use message::{Message, MessageType};
pub use variant::{process_val, DictValue, ObjectPath, UnixFd, Variant, VariantList};

/// Only supported major version of the message framing.
pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound on the size of a single message, matching the reference bus
/// daemon's default. Anything larger is treated as a corrupt stream.
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

/// Well known name, object path and interface of the bus daemon itself.
pub const DBUS_SERVICE: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";

/// `RequestName` flag asking the daemon not to queue us behind the current
/// owner of the name.
pub const REQUEST_NAME_FLAG_DO_NOT_QUEUE: u32 = 0x4;

/// `RequestName` reply code for primary ownership.
pub const REQUEST_NAME_REPLY_PRIMARY_OWNER: u32 = 1;

/// Error name used by the daemon (and synthesised locally) when a method call
/// does not receive a reply before its deadline.
pub const ERROR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";

/// Error name synthesised locally when the connection drops with calls still
/// in flight.
pub const ERROR_DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";

/// Error name sent back for a method call that no handler claimed.
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";

/// The possible errors that can arise while encoding, decoding or moving
/// messages over a bus connection.
#[derive(Debug)]
pub enum Error {
    /// An argument list could not be encoded into a message. The partially
    /// built message is discarded, nothing is sent.
    Marshal(String),

    /// A message body could not be decoded back into an argument list.
    Demarshal(String),

    /// A typed extraction was attempted on an argument holding a different
    /// variant tag.
    TypeMismatch { index: usize, expected: &'static str },

    /// A bus address string could not be parsed.
    Address(String),

    /// The authentication exchange with the bus was rejected or garbled.
    Auth(String),

    /// The operation needs a live connection but the bus has gone away.
    Disconnected,

    /// A deadline expired before the peer produced an answer.
    Timeout,

    /// Errors returned by I/O failures.
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Marshal(e) => write!(f, "Marshal error: {e}"),
            Self::Demarshal(e) => write!(f, "Demarshal error: {e}"),
            Self::TypeMismatch { index, expected } => {
                write!(f, "Type mismatch: argument {index} is not a {expected}")
            }
            Self::Address(e) => write!(f, "Bad bus address: {e}"),
            Self::Auth(e) => write!(f, "Authentication failed: {e}"),
            Self::Disconnected => write!(f, "Not connected to the bus"),
            Self::Timeout => write!(f, "Timed out"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Self::Io(std::io::Error::from_raw_os_error(e as i32))
    }
}

static PROCESS_INIT: Once = Once::new();

/// Once-per-process initialisation performed before the first connection is
/// opened.
///
/// A peer closing its end of a stream socket while we still have queued data
/// must surface as `EPIPE` from the write, not as a process-killing SIGPIPE.
pub(crate) fn global_init() {
    PROCESS_INIT.call_once(|| {
        use nix::sys::signal::{signal, SigHandler, Signal};

        // SAFETY: installing SIG_IGN for SIGPIPE does not race with any
        // handler state; it is the conventional process-wide setting for
        // socket writers.
        if let Err(e) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
            log::warn!("failed to ignore SIGPIPE: {e}");
        }
    });
}

/// A "pipe", constructed using socketpair(2), that can be used for testing
/// framing and transport behaviour without a real bus daemon.
pub mod pipe {
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    pub struct Endpoint {
        pub fd: std::os::fd::OwnedFd,
    }

    pub fn pipe() -> std::io::Result<(Endpoint, Endpoint)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;

        Ok((Endpoint { fd: a }, Endpoint { fd: b }))
    }

    impl std::io::Read for Endpoint {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(nix::unistd::read(&self.fd, buf)?)
        }
    }

    impl std::io::Write for Endpoint {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(nix::unistd::write(&self.fd, buf)?)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
