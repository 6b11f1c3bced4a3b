// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Client for the security-token helper daemon, which speaks its own
//! length-prefixed framing over a unix stream socket (nothing to do with the
//! message bus).
//!
//! A frame is `[length][id][payload]`, where length and id are little-endian
//! var-ints, seven payload bits per byte with the high bit flagging
//! continuation. The length covers the id and payload. Ids are shifted left
//! by one on the wire; a reply's id is the request's id with the low bit set.

use log::*;

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType, UnixAddr};

use crate::Error;

/// The message id that requests (and identifies) a security token.
pub const TOKEN_MESSAGE_ID: u16 = 10;

/// How long to wait for the helper's reply by default.
pub const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(1);

/// Client connection to the token helper. All calls are serialised; on any
/// framing mismatch the socket is closed and reopened so a late reply can
/// never be mistaken for the answer to a newer request.
pub struct SecurityTokenClient {
    socket_path: PathBuf,
    timeout: Duration,
    sock: Mutex<Option<OwnedFd>>,
}

impl SecurityTokenClient {
    pub fn new<P: AsRef<Path>>(socket_path: P, timeout: Option<Duration>) -> SecurityTokenClient {
        SecurityTokenClient {
            socket_path: socket_path.as_ref().to_path_buf(),
            timeout: timeout.unwrap_or(DEFAULT_TOKEN_TIMEOUT),
            sock: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.sock.lock().unwrap().is_some()
    }

    /// Opens the connection to the helper. Must succeed before
    /// [`SecurityTokenClient::get_token`] can be used.
    pub fn open(&self) -> Result<(), Error> {
        let mut sock = self.sock.lock().unwrap();
        open_locked(&mut sock, &self.socket_path)
    }

    pub fn close(&self) {
        let mut sock = self.sock.lock().unwrap();
        *sock = None;
    }

    /// Asks the helper for a token for `bearer_url`. Returns the opaque
    /// token payload.
    pub fn get_token(&self, bearer_url: &str) -> Result<Vec<u8>, Error> {
        let mut sock = self.sock.lock().unwrap();

        let result = match sock.as_ref() {
            None => Err(Error::NotConnected),
            Some(fd) => request_token(fd, bearer_url, self.timeout),
        };

        if result.is_err() && sock.is_some() {
            // a delayed reply left in the socket would answer the wrong
            // request later; start over with a fresh connection
            *sock = None;
            if let Err(e) = open_locked(&mut sock, &self.socket_path) {
                warn!("failed to reopen token helper socket: {e}");
            }
        }

        result
    }
}

fn open_locked(sock: &mut Option<OwnedFd>, path: &Path) -> Result<(), Error> {
    if sock.is_some() {
        warn!("token helper socket is already open");
        return Ok(());
    }

    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(|e| Error::Bus(format!("failed to create token helper socket: {e}")))?;

    let addr = UnixAddr::new(path)
        .map_err(|e| Error::Bus(format!("bad token helper socket path: {e}")))?;
    loop {
        match connect(fd.as_raw_fd(), &addr) {
            Ok(()) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(Error::Bus(format!(
                    "failed to connect to token helper at {}: {e}",
                    path.display()
                )))
            }
        }
    }

    info!("opened connection to token helper at {}", path.display());
    *sock = Some(fd);
    Ok(())
}

fn request_token(fd: &OwnedFd, bearer_url: &str, timeout: Duration) -> Result<Vec<u8>, Error> {
    send_frame(fd, TOKEN_MESSAGE_ID, bearer_url.as_bytes())?;

    let (reply_id, payload) = recv_frame(fd, timeout)?;
    if reply_id != TOKEN_MESSAGE_ID {
        return Err(Error::Bus(format!(
            "invalid reply from token helper (id:{reply_id} length:{})",
            payload.len()
        )));
    }

    Ok(payload)
}

fn send_frame(fd: &OwnedFd, id: u16, payload: &[u8]) -> Result<(), Error> {
    let frame = encode_frame(id, payload);
    let mut rest = frame.as_slice();

    while !rest.is_empty() {
        match nix::unistd::write(fd, rest) {
            Ok(0) => return Err(Error::Bus("token helper closed the socket".into())),
            Ok(n) => rest = &rest[n..],
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::Bus(format!("failed to send token request: {e}"))),
        }
    }
    Ok(())
}

fn recv_frame(fd: &OwnedFd, timeout: Duration) -> Result<(u16, Vec<u8>), Error> {
    let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
    let poll_timeout = PollTimeout::try_from(timeout.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(PollTimeout::MAX);
    match poll(&mut fds, poll_timeout) {
        Ok(0) => {
            warn!("timed out waiting for the token helper reply");
            return Err(Error::Timeout);
        }
        Ok(_) => {}
        Err(Errno::EINTR) => return Err(Error::Timeout),
        Err(e) => return Err(Error::Bus(format!("error polling token helper: {e}"))),
    }

    let mut buffer = [0u8; 2048];
    let read = loop {
        match nix::unistd::read(fd, &mut buffer) {
            Ok(0) => return Err(Error::Bus("token helper closed the socket".into())),
            Ok(n) => break n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::Bus(format!("failed to read token reply: {e}"))),
        }
    };

    decode_frame(&buffer[..read])
}

/// Builds `[length][id << 1][payload]` with var-int length and id fields.
fn encode_frame(id: u16, payload: &[u8]) -> Vec<u8> {
    let shifted = u32::from(id) << 1;
    let id_len = varint_len(shifted);
    let mut frame = Vec::with_capacity(6 + payload.len());

    put_varint(&mut frame, payload.len() as u32 + id_len);
    put_varint(&mut frame, shifted);
    frame.extend_from_slice(payload);
    frame
}

/// Validates and splits a received frame into its id and payload.
fn decode_frame(buf: &[u8]) -> Result<(u16, Vec<u8>), Error> {
    if buf.len() < 2 {
        return Err(Error::Bus(format!(
            "token helper frame too small ({} bytes)",
            buf.len()
        )));
    }

    let mut index = 0;
    let length = get_varint(buf, &mut index)
        .ok_or_else(|| Error::Bus("invalid or truncated frame: length field".into()))?;

    // the length excludes the length field itself
    if length == 0 || (length as usize + index) != buf.len() {
        return Err(Error::Bus("invalid or truncated frame: length mismatch".into()));
    }

    let ident = get_varint(buf, &mut index)
        .ok_or_else(|| Error::Bus("invalid or truncated frame: id field".into()))?;

    // the low wire bit marks a reply; shift it away to recover the id
    let id = ((ident >> 1) & 0xffff) as u16;
    let payload = buf[index..].to_vec();

    debug!(
        "received token helper reply with id {id} and {} payload bytes",
        payload.len()
    );
    Ok((id, payload))
}

fn varint_len(mut value: u32) -> u32 {
    let mut len = 1;
    value >>= 7;
    while value != 0 {
        len += 1;
        value >>= 7;
    }
    len
}

fn put_varint(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn get_varint(buf: &[u8], index: &mut usize) -> Option<u32> {
    let mut value = 0u32;
    let mut shift = 0;

    loop {
        let byte = *buf.get(*index)?;
        *index += 1;
        value |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
        if shift > 28 {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = encode_frame(TOKEN_MESSAGE_ID, b"https://example.com/app");
        let (id, payload) = decode_frame(&frame).unwrap();
        assert_eq!(id, TOKEN_MESSAGE_ID);
        assert_eq!(payload, b"https://example.com/app");
    }

    #[test]
    fn frame_id_is_shifted_on_the_wire() {
        let frame = encode_frame(TOKEN_MESSAGE_ID, b"x");
        // length (1 byte: 1 payload + 1 id byte = 2), then id 10 << 1 = 20
        assert_eq!(frame[0], 2);
        assert_eq!(frame[1], 20);
    }

    #[test]
    fn reply_id_low_bit_is_dropped() {
        // a reply carries the request id shifted left with the low bit set
        let mut frame = Vec::new();
        put_varint(&mut frame, 1 + 5);
        put_varint(&mut frame, (u32::from(TOKEN_MESSAGE_ID) << 1) | 1);
        frame.extend_from_slice(b"token");

        let (id, payload) = decode_frame(&frame).unwrap();
        assert_eq!(id, TOKEN_MESSAGE_ID);
        assert_eq!(payload, b"token");
    }

    #[test]
    fn truncated_frames_are_rejected() {
        assert!(decode_frame(&[]).is_err());
        assert!(decode_frame(&[2]).is_err());

        // length claims more bytes than the frame holds
        let mut frame = Vec::new();
        put_varint(&mut frame, 10);
        put_varint(&mut frame, 20);
        frame.push(b'x');
        assert!(decode_frame(&frame).is_err());
    }

    #[test]
    fn multi_byte_varints() {
        let mut out = Vec::new();
        put_varint(&mut out, 300);
        assert_eq!(out, vec![0xac, 0x02]);

        let mut index = 0;
        assert_eq!(get_varint(&out, &mut index), Some(300));
        assert_eq!(index, 2);
    }
}
