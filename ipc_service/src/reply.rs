// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Per-call handles: the getter consumes the reply of an outbound call, the
//! sender produces the (single) reply to an inbound one.

use log::*;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bus_protocol::{Message, MessageType, ERROR_NO_REPLY};

use crate::connection::BusConnection;
use crate::{Error, VariantList};

/// Handle for collecting the reply to an outbound method call.
///
/// The reply token can be consumed exactly once: either by
/// [`AsyncReplyGetter::get_reply`], or on drop, which cancels the pending
/// reply so the connection never accumulates unclaimed messages.
pub struct AsyncReplyGetter {
    connection: Weak<BusConnection>,
    token: AtomicU64,
}

impl AsyncReplyGetter {
    pub(crate) fn new(connection: &Arc<BusConnection>, token: u64) -> AsyncReplyGetter {
        AsyncReplyGetter {
            connection: Arc::downgrade(connection),
            token: AtomicU64::new(token),
        }
    }

    /// Waits for the reply and parses its arguments.
    ///
    /// A call that timed out on the bus surfaces as [`Error::Timeout`]; any
    /// other error reply as [`Error::Bus`] carrying the error name. Calling
    /// this a second time fails, the token is already consumed.
    pub fn get_reply(&self) -> Result<VariantList, Error> {
        // atomically take the token to avoid races with drop
        let token = self.token.swap(0, Ordering::SeqCst);
        if token == 0 {
            return Err(Error::InvalidArgument("reply already consumed".into()));
        }

        let connection = self.connection.upgrade().ok_or(Error::NotConnected)?;
        let reply = connection.get_reply(token)?;
        drop(connection);

        match reply.msg_type {
            MessageType::MethodReturn => Ok(reply.args()?),
            MessageType::Error => {
                let name = reply.error_name.as_deref().unwrap_or("unknown error");
                let detail = reply
                    .args()
                    .ok()
                    .and_then(|args| match args.first() {
                        Some(crate::Variant::String(s)) => Some(s.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();

                if name == ERROR_NO_REPLY {
                    debug!("method call timed out: {detail}");
                    Err(Error::Timeout)
                } else {
                    error!("error reply while waiting: {name} ({detail})");
                    Err(Error::Bus(name.to_string()))
                }
            }
            other => Err(Error::Bus(format!(
                "invalid message type {other:?} received as a reply"
            ))),
        }
    }
}

impl Drop for AsyncReplyGetter {
    fn drop(&mut self) {
        let token = self.token.swap(0, Ordering::SeqCst);
        if token != 0 {
            if let Some(connection) = self.connection.upgrade() {
                if !connection.cancel_reply(token) {
                    error!("failed to cancel reply for token {token}");
                }
            }
        }
    }
}

/// Handle given to a method handler for answering the inbound call.
///
/// [`AsyncReplySender::send_reply`] works exactly once. Dropping the sender
/// without replying releases the prepared reply message and logs a warning,
/// since leaving a caller without an answer is a protocol error.
pub struct AsyncReplySender {
    connection: Weak<BusConnection>,
    reply: Mutex<Option<Message>>,
    sender_name: String,
    args: VariantList,
    sender_uid: Mutex<Option<u32>>,
}

impl AsyncReplySender {
    pub(crate) fn new(
        connection: &Arc<BusConnection>,
        request: &Message,
        args: VariantList,
    ) -> AsyncReplySender {
        AsyncReplySender {
            connection: Arc::downgrade(connection),
            reply: Mutex::new(Some(Message::method_return(request))),
            sender_name: request.sender.clone().unwrap_or_default(),
            args,
            sender_uid: Mutex::new(None),
        }
    }

    /// The demarshalled arguments of the method call.
    pub fn method_call_args(&self) -> &VariantList {
        &self.args
    }

    /// Marshals `args` into the prepared reply and sends it. Subsequent
    /// calls fail.
    pub fn send_reply(&self, args: &VariantList) -> Result<(), Error> {
        let mut reply = {
            let mut slot = self.reply.lock().unwrap();
            slot.take()
                .ok_or_else(|| Error::InvalidArgument("reply already sent".into()))?
        };

        let connection = self.connection.upgrade().ok_or(Error::NotConnected)?;
        reply.set_args(args)?;
        connection.send_message_no_reply(reply)
    }

    /// The bus-unique name of the calling peer.
    pub fn sender_name(&self) -> &str {
        &self.sender_name
    }

    /// The unix user id of the calling peer, fetched from the bus on first
    /// use and cached.
    pub fn sender_uid(&self) -> Result<u32, Error> {
        let mut cached = self.sender_uid.lock().unwrap();
        if let Some(uid) = *cached {
            return Ok(uid);
        }

        if self.sender_name.is_empty() {
            return Err(Error::InvalidArgument("no sender name stored".into()));
        }

        let connection = self.connection.upgrade().ok_or(Error::NotConnected)?;
        let uid = connection.get_unix_user(&self.sender_name)?;
        *cached = Some(uid);
        Ok(uid)
    }
}

impl Drop for AsyncReplySender {
    fn drop(&mut self) {
        if self.reply.lock().unwrap().is_some() {
            warn!(
                "method call from '{}' dropped without a reply",
                self.sender_name
            );
        }
    }
}
