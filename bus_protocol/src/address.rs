// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::Error;

/// Location of the socket used by the reference system bus daemon.
const SYSTEM_BUS_SOCKET: &str = "/var/run/dbus/system_bus_socket";

/// Where to find a bus: one of the two well known buses, or a free-form
/// `unix:path=<socket>` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusAddress {
    Session,
    System,
    Address(String),
}

impl BusAddress {
    /// Resolves the address down to the unix socket path to connect to.
    ///
    /// The session bus is discovered through the conventional environment
    /// variable; the system bus falls back to the well known socket location.
    pub fn socket_path(&self) -> Result<PathBuf, Error> {
        match self {
            BusAddress::Session => match std::env::var("DBUS_SESSION_BUS_ADDRESS") {
                Ok(addr) => parse_unix_address(&addr),
                Err(_) => Err(Error::Address(
                    "DBUS_SESSION_BUS_ADDRESS is not set".to_string(),
                )),
            },
            BusAddress::System => match std::env::var("DBUS_SYSTEM_BUS_ADDRESS") {
                Ok(addr) => parse_unix_address(&addr),
                Err(_) => Ok(PathBuf::from(SYSTEM_BUS_SOCKET)),
            },
            BusAddress::Address(addr) => parse_unix_address(addr),
        }
    }
}

/// Extracts the socket path from a `unix:path=...` style address.
///
/// Only filesystem unix sockets are supported; the address may carry extra
/// `key=value` parameters separated by commas, which are ignored.
fn parse_unix_address(address: &str) -> Result<PathBuf, Error> {
    let rest = address
        .strip_prefix("unix:")
        .ok_or_else(|| Error::Address(format!("not a unix transport address: '{address}'")))?;

    for param in rest.split(',') {
        if let Some(path) = param.strip_prefix("path=") {
            if path.is_empty() {
                return Err(Error::Address(format!("empty path in address '{address}'")));
            }
            return Ok(PathBuf::from(path));
        }
        if param.strip_prefix("abstract=").is_some() {
            return Err(Error::Address(format!(
                "abstract sockets are not supported: '{address}'"
            )));
        }
    }

    Err(Error::Address(format!(
        "no path parameter in address '{address}'"
    )))
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BusAddress::Session => write!(f, "session"),
            BusAddress::System => write!(f, "system"),
            BusAddress::Address(addr) => write!(f, "{addr}"),
        }
    }
}

impl FromStr for BusAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<BusAddress, Error> {
        match s {
            "session" => Ok(BusAddress::Session),
            "system" => Ok(BusAddress::System),
            other if other.starts_with("unix:") => Ok(BusAddress::Address(other.to_string())),
            other => Err(Error::Address(format!(
                "expected 'session', 'system' or a 'unix:' address, got '{other}'"
            ))),
        }
    }
}
