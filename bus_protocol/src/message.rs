// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The framed message unit exchanged with the bus: a fixed header, a header
//! field array and an aligned body, plus the file descriptors that ride along
//! out of band.

use log::*;

use std::os::fd::OwnedFd;

use crate::variant::VariantList;
use crate::wire::{self, Reader, Writer};
use crate::{Error, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};

/// The four message kinds of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageType {
    fn from_wire(v: u8) -> Option<MessageType> {
        match v {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            MessageType::MethodCall => 1,
            MessageType::MethodReturn => 2,
            MessageType::Error => 3,
            MessageType::Signal => 4,
        }
    }
}

/// Message flag: the caller is not interested in a reply.
pub const FLAG_NO_REPLY_EXPECTED: u8 = 0x1;

// header field codes
const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;
const FIELD_UNIX_FDS: u8 = 9;

/// A decoded (or to-be-sent) bus message.
///
/// The body is kept in its encoded form together with its signature; argument
/// lists are produced on demand by [`Message::args`] and installed by
/// [`Message::set_args`].
#[derive(Debug)]
pub struct Message {
    pub msg_type: MessageType,
    pub flags: u8,
    pub serial: u32,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub signature: String,
    pub body: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

impl Message {
    fn empty(msg_type: MessageType) -> Message {
        Message {
            msg_type,
            flags: 0,
            serial: 0,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            signature: String::new(),
            body: Vec::new(),
            fds: Vec::new(),
        }
    }

    pub fn method_call(service: &str, path: &str, interface: &str, member: &str) -> Message {
        let mut msg = Message::empty(MessageType::MethodCall);
        msg.destination = Some(service.to_string());
        msg.path = Some(path.to_string());
        msg.interface = Some(interface.to_string());
        msg.member = Some(member.to_string());
        msg
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Message {
        let mut msg = Message::empty(MessageType::Signal);
        msg.path = Some(path.to_string());
        msg.interface = Some(interface.to_string());
        msg.member = Some(member.to_string());
        msg
    }

    /// A reply template for `request`, addressed back at its sender.
    pub fn method_return(request: &Message) -> Message {
        let mut msg = Message::empty(MessageType::MethodReturn);
        msg.reply_serial = Some(request.serial);
        msg.destination = request.sender.clone();
        msg
    }

    /// An error reply for the call with serial `reply_serial`. Used both for
    /// wire-bound errors and for errors synthesised locally (timeouts,
    /// disconnect), in which case `destination` is left empty.
    pub fn error(reply_serial: u32, destination: Option<&str>, name: &str, text: &str) -> Message {
        let mut msg = Message::empty(MessageType::Error);
        msg.reply_serial = Some(reply_serial);
        msg.destination = destination.map(str::to_string);
        msg.error_name = Some(name.to_string());
        msg.flags = FLAG_NO_REPLY_EXPECTED;
        match wire::marshal(&vec![text.into()]) {
            Ok(body) => {
                msg.signature = body.signature;
                msg.body = body.data;
            }
            Err(e) => warn!("failed to encode error reply text: {e}"),
        }
        msg
    }

    /// Encodes `args` into the message body, replacing any previous body.
    ///
    /// On failure the message keeps an empty body; nothing partial survives.
    pub fn set_args(&mut self, args: &VariantList) -> Result<(), Error> {
        self.signature = String::new();
        self.body = Vec::new();
        self.fds = Vec::new();

        let body = wire::marshal(args)?;
        self.signature = body.signature;
        self.body = body.data;
        self.fds = body.fds;
        Ok(())
    }

    /// Decodes the body back into an argument list. Descriptor arguments are
    /// duplicated out of the message; the originals close when the message is
    /// dropped.
    pub fn args(&self) -> Result<VariantList, Error> {
        wire::demarshal(&self.body, &self.signature, &self.fds)
    }

    pub fn take_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.fds)
    }

    /// Serialises the message for the wire. The descriptors in
    /// [`Message::fds`] must be sent alongside the returned bytes.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        match self.msg_type {
            MessageType::MethodCall | MessageType::Signal => {
                if self.path.is_none() || self.member.is_none() {
                    return Err(Error::Marshal("message missing path or member".into()));
                }
            }
            MessageType::MethodReturn => {
                if self.reply_serial.is_none() {
                    return Err(Error::Marshal("method return missing reply serial".into()));
                }
            }
            MessageType::Error => {
                if self.reply_serial.is_none() || self.error_name.is_none() {
                    return Err(Error::Marshal("error reply missing serial or name".into()));
                }
            }
        }

        let mut w = Writer::new();
        w.put_u8(b'l');
        w.put_u8(self.msg_type.to_wire());
        w.put_u8(self.flags);
        w.put_u8(PROTOCOL_VERSION);
        w.put_u32(self.body.len() as u32);
        w.put_u32(self.serial);

        // header field array, elements are 8-aligned (byte, variant) pairs
        w.put_u32(0);
        let patch = w.buf.len() - 4;
        let start = w.buf.len();

        if let Some(path) = &self.path {
            w.align(8);
            w.put_u8(FIELD_PATH);
            w.put_signature("o");
            w.put_string(path);
        }
        if let Some(interface) = &self.interface {
            w.align(8);
            w.put_u8(FIELD_INTERFACE);
            w.put_signature("s");
            w.put_string(interface);
        }
        if let Some(member) = &self.member {
            w.align(8);
            w.put_u8(FIELD_MEMBER);
            w.put_signature("s");
            w.put_string(member);
        }
        if let Some(error_name) = &self.error_name {
            w.align(8);
            w.put_u8(FIELD_ERROR_NAME);
            w.put_signature("s");
            w.put_string(error_name);
        }
        if let Some(reply_serial) = self.reply_serial {
            w.align(8);
            w.put_u8(FIELD_REPLY_SERIAL);
            w.put_signature("u");
            w.put_u32(reply_serial);
        }
        if let Some(destination) = &self.destination {
            w.align(8);
            w.put_u8(FIELD_DESTINATION);
            w.put_signature("s");
            w.put_string(destination);
        }
        if let Some(sender) = &self.sender {
            w.align(8);
            w.put_u8(FIELD_SENDER);
            w.put_signature("s");
            w.put_string(sender);
        }
        if !self.signature.is_empty() {
            w.align(8);
            w.put_u8(FIELD_SIGNATURE);
            w.put_signature("g");
            w.put_signature(&self.signature);
        }
        if !self.fds.is_empty() {
            w.align(8);
            w.put_u8(FIELD_UNIX_FDS);
            w.put_signature("u");
            w.put_u32(self.fds.len() as u32);
        }

        let fields_len = w.buf.len() - start;
        w.buf[patch..patch + 4].copy_from_slice(&(fields_len as u32).to_le_bytes());

        w.align(8);
        w.buf.extend_from_slice(&self.body);

        if w.buf.len() > MAX_MESSAGE_SIZE {
            return Err(Error::Marshal("message exceeds maximum size".into()));
        }

        Ok(w.buf)
    }

    /// Total frame length of a message whose first 16 bytes are `header`.
    pub fn required_len(header: &[u8]) -> Result<usize, Error> {
        if header.len() < 16 {
            return Err(Error::Demarshal("header shorter than 16 bytes".into()));
        }
        if header[0] != b'l' {
            return Err(Error::Demarshal(
                "unsupported endianness in message header".into(),
            ));
        }
        if header[3] != PROTOCOL_VERSION {
            return Err(Error::Demarshal(format!(
                "unsupported protocol version {}",
                header[3]
            )));
        }

        let body_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let fields_len =
            u32::from_le_bytes([header[12], header[13], header[14], header[15]]) as usize;

        let header_len = (16 + fields_len + 7) & !7;
        let total = header_len + body_len;
        if total > MAX_MESSAGE_SIZE {
            return Err(Error::Demarshal("message exceeds maximum size".into()));
        }
        Ok(total)
    }

    /// Decodes one complete frame. The frame's descriptors (as counted by its
    /// UNIX_FDS header field) are drained from the front of `fd_pool`.
    pub fn decode(data: &[u8], fd_pool: &mut Vec<OwnedFd>) -> Result<Message, Error> {
        let total = Message::required_len(data)?;
        if data.len() != total {
            return Err(Error::Demarshal("frame length mismatch".into()));
        }

        let msg_type = MessageType::from_wire(data[1])
            .ok_or_else(|| Error::Demarshal(format!("unknown message type {}", data[1])))?;
        let flags = data[2];
        let body_len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
        let serial = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);

        let mut msg = Message::empty(msg_type);
        msg.flags = flags;
        msg.serial = serial;

        let mut unix_fds = 0usize;
        {
            let no_fds: Vec<OwnedFd> = Vec::new();
            let mut r = Reader::new(data, &no_fds);
            r.pos = 12;
            let fields_len = r.get_u32()? as usize;
            let fields_end = 16 + fields_len;

            while r.pos < fields_end {
                r.align(8)?;
                if r.pos >= fields_end {
                    break;
                }
                let code = r.get_u8()?;
                let sig = r.get_signature()?;
                match (code, sig.as_str()) {
                    (FIELD_PATH, "o") => msg.path = Some(r.get_string()?),
                    (FIELD_INTERFACE, "s") => msg.interface = Some(r.get_string()?),
                    (FIELD_MEMBER, "s") => msg.member = Some(r.get_string()?),
                    (FIELD_ERROR_NAME, "s") => msg.error_name = Some(r.get_string()?),
                    (FIELD_REPLY_SERIAL, "u") => msg.reply_serial = Some(r.get_u32()?),
                    (FIELD_DESTINATION, "s") => msg.destination = Some(r.get_string()?),
                    (FIELD_SENDER, "s") => msg.sender = Some(r.get_string()?),
                    (FIELD_SIGNATURE, "g") => msg.signature = r.get_signature()?,
                    (FIELD_UNIX_FDS, "u") => unix_fds = r.get_u32()? as usize,
                    (code, sig) => {
                        // unknown header fields must be tolerated; skip the
                        // value by its declared signature
                        trace!("skipping unknown header field {code} with signature {sig}");
                        skip_basic(&mut r, sig)?;
                    }
                }
            }

            r.align(8)?;
            if r.pos + body_len != data.len() {
                return Err(Error::Demarshal("body length mismatch".into()));
            }
            msg.body = data[r.pos..].to_vec();
        }

        if unix_fds > fd_pool.len() {
            return Err(Error::Demarshal(format!(
                "message references {unix_fds} descriptors but only {} arrived",
                fd_pool.len()
            )));
        }
        msg.fds = fd_pool.drain(..unix_fds).collect();

        Ok(msg)
    }
}

fn skip_basic(r: &mut Reader, sig: &str) -> Result<(), Error> {
    match sig {
        "y" => {
            r.get_u8()?;
        }
        "b" | "u" | "i" | "h" => {
            r.get_u32()?;
        }
        "n" | "q" => {
            r.get_u16()?;
        }
        "x" | "t" => {
            r.get_u64()?;
        }
        "s" | "o" => {
            r.get_string()?;
        }
        "g" => {
            r.get_signature()?;
        }
        other => {
            return Err(Error::Demarshal(format!(
                "cannot skip header field with signature '{other}'"
            )))
        }
    }
    Ok(())
}

/// Splits as many complete frames as possible off the front of `buf`, pairing
/// each with its descriptors from `fds`.
///
/// An undecodable frame poisons the whole stream (descriptor association is
/// lost), so it is returned as an error and the caller should drop the
/// connection.
pub fn drain_frames(buf: &mut Vec<u8>, fds: &mut Vec<OwnedFd>) -> Result<Vec<Message>, Error> {
    let mut out = Vec::new();

    loop {
        if buf.len() < 16 {
            break;
        }
        let need = Message::required_len(&buf[..16])?;
        if buf.len() < need {
            break;
        }
        let frame: Vec<u8> = buf.drain(..need).collect();
        out.push(Message::decode(&frame, fds)?);
    }

    Ok(out)
}
