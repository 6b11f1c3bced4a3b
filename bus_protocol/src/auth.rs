// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Client side of the line-based authentication exchange that precedes binary
//! message traffic. Only the EXTERNAL mechanism (uid asserted over unix
//! credentials) is spoken, followed by descriptor-passing negotiation.

use log::*;

use std::os::fd::BorrowedFd;

use crate::Error;

/// Runs the authentication exchange on a freshly connected (still blocking)
/// socket. Returns whether the server agreed to descriptor passing.
pub fn authenticate(fd: BorrowedFd) -> Result<bool, Error> {
    // the protocol opens with a single NUL credential byte
    let uid = nix::unistd::getuid().as_raw();
    let hex_uid = to_hex(uid.to_string().as_bytes());

    write_all(fd, b"\0")?;
    write_all(fd, format!("AUTH EXTERNAL {hex_uid}\r\n").as_bytes())?;

    let line = read_line(fd)?;
    if let Some(rest) = line.strip_prefix("OK ") {
        trace!("authenticated, server guid {rest}");
    } else if line.starts_with("REJECTED") {
        return Err(Error::Auth(format!("mechanism rejected: {line}")));
    } else {
        return Err(Error::Auth(format!("unexpected auth response: {line}")));
    }

    write_all(fd, b"NEGOTIATE_UNIX_FD\r\n")?;
    let line = read_line(fd)?;
    let fd_passing = if line == "AGREE_UNIX_FD" {
        true
    } else {
        debug!("server declined descriptor passing: {line}");
        false
    };

    write_all(fd, b"BEGIN\r\n")?;

    Ok(fd_passing)
}

fn to_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn write_all(fd: BorrowedFd, mut data: &[u8]) -> Result<(), Error> {
    while !data.is_empty() {
        match nix::unistd::write(fd, data) {
            Ok(0) => return Err(Error::Auth("peer closed during handshake".into())),
            Ok(n) => data = &data[n..],
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Reads a single CRLF-terminated line, one byte at a time.
///
/// The exchange is a handful of short lines so the byte-wise read costs
/// nothing, and it guarantees we never consume bytes belonging to the binary
/// stream that follows BEGIN.
fn read_line(fd: BorrowedFd) -> Result<String, Error> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        match nix::unistd::read(fd, &mut byte) {
            Ok(0) => return Err(Error::Auth("peer closed during handshake".into())),
            Ok(_) => {
                if byte[0] == b'\n' {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return String::from_utf8(line)
                        .map_err(|_| Error::Auth("non-UTF-8 auth line".into()));
                }
                if line.len() > 4096 {
                    return Err(Error::Auth("auth line too long".into()));
                }
                line.push(byte[0]);
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
