// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use log::*;

use std::collections::BTreeMap;
use std::fmt;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};

use crate::Error;

/// An owned file descriptor argument.
///
/// Construction always duplicates the caller's descriptor (with close-on-exec
/// set) so the value owns its fd outright: copies duplicate again, and the
/// descriptor is closed exactly once when the last copy is dropped. A failed
/// dup leaves the value in an invalid state rather than owning a stale number.
pub struct UnixFd {
    fd: Option<OwnedFd>,
}

impl UnixFd {
    /// Duplicates `fd` and takes ownership of the duplicate. The caller keeps
    /// (and remains responsible for) the original.
    pub fn new<F: AsFd>(fd: F) -> UnixFd {
        match dup_cloexec(fd.as_fd()) {
            Ok(owned) => UnixFd { fd: Some(owned) },
            Err(e) => {
                error!("failed to dup file descriptor: {e}");
                UnixFd { fd: None }
            }
        }
    }

    /// Wraps an already-owned descriptor without duplicating it.
    pub fn from_owned(fd: OwnedFd) -> UnixFd {
        UnixFd { fd: Some(fd) }
    }

    pub fn invalid() -> UnixFd {
        UnixFd { fd: None }
    }

    pub fn is_valid(&self) -> bool {
        self.fd.is_some()
    }

    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    /// Gives up ownership of the descriptor, leaving this value invalid.
    pub fn take(&mut self) -> Option<OwnedFd> {
        self.fd.take()
    }
}

impl Clone for UnixFd {
    fn clone(&self) -> UnixFd {
        match &self.fd {
            None => UnixFd { fd: None },
            Some(fd) => UnixFd::new(fd),
        }
    }
}

impl PartialEq for UnixFd {
    /// Two fd arguments are considered equal when they refer to the same
    /// underlying file (same device and inode), which holds across dup.
    fn eq(&self, other: &UnixFd) -> bool {
        match (&self.fd, &other.fd) {
            (None, None) => true,
            (Some(a), Some(b)) => {
                match (nix::sys::stat::fstat(a), nix::sys::stat::fstat(b)) {
                    (Ok(sa), Ok(sb)) => sa.st_dev == sb.st_dev && sa.st_ino == sb.st_ino,
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

impl fmt::Debug for UnixFd {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.fd {
            Some(fd) => write!(f, "UnixFd({:?})", fd),
            None => write!(f, "UnixFd(invalid)"),
        }
    }
}

/// Duplicates a descriptor with close-on-exec set on the duplicate.
pub fn dup_cloexec(fd: BorrowedFd) -> nix::Result<OwnedFd> {
    let raw = nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_DUPFD_CLOEXEC(3))?;

    // SAFETY: F_DUPFD_CLOEXEC returned a fresh descriptor that nothing else
    // owns yet.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Hierarchical identifier of an object exposed by a service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectPath(pub String);

impl ObjectPath {
    pub fn new<S: Into<String>>(path: S) -> ObjectPath {
        ObjectPath(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ObjectPath {
    fn from(s: &str) -> ObjectPath {
        ObjectPath(s.to_string())
    }
}

/// The value side of a dictionary entry.
///
/// Deliberately narrower than [`Variant`]: no vectors and no nested
/// dictionaries, so containers can never appear inside a dictionary.
#[derive(Debug, Clone, PartialEq)]
pub enum DictValue {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    UnixFd(UnixFd),
    String(String),
    ObjectPath(ObjectPath),
}

impl DictValue {
    /// Single-character type signature of the contained value.
    pub fn signature(&self) -> &'static str {
        match self {
            DictValue::Bool(_) => "b",
            DictValue::Byte(_) => "y",
            DictValue::Int16(_) => "n",
            DictValue::Uint16(_) => "q",
            DictValue::Int32(_) => "i",
            DictValue::Uint32(_) => "u",
            DictValue::Int64(_) => "x",
            DictValue::Uint64(_) => "t",
            DictValue::UnixFd(_) => "h",
            DictValue::String(_) => "s",
            DictValue::ObjectPath(_) => "o",
        }
    }
}

/// A single argument value.
///
/// The set of supported tags mirrors what the rest of the system actually
/// sends: the basic types, homogeneous vectors of a subset of them, and a
/// string-keyed dictionary of [`DictValue`].
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    UnixFd(UnixFd),
    String(String),
    ObjectPath(ObjectPath),
    ByteArray(Vec<u8>),
    Uint16Array(Vec<u16>),
    Int32Array(Vec<i32>),
    Uint32Array(Vec<u32>),
    Uint64Array(Vec<u64>),
    UnixFdArray(Vec<UnixFd>),
    StringArray(Vec<String>),
    ObjectPathArray(Vec<ObjectPath>),
    Dict(BTreeMap<String, DictValue>),
}

impl Variant {
    /// Wire type signature of this value.
    pub fn signature(&self) -> &'static str {
        match self {
            Variant::Bool(_) => "b",
            Variant::Byte(_) => "y",
            Variant::Int16(_) => "n",
            Variant::Uint16(_) => "q",
            Variant::Int32(_) => "i",
            Variant::Uint32(_) => "u",
            Variant::Int64(_) => "x",
            Variant::Uint64(_) => "t",
            Variant::UnixFd(_) => "h",
            Variant::String(_) => "s",
            Variant::ObjectPath(_) => "o",
            Variant::ByteArray(_) => "ay",
            Variant::Uint16Array(_) => "aq",
            Variant::Int32Array(_) => "ai",
            Variant::Uint32Array(_) => "au",
            Variant::Uint64Array(_) => "at",
            Variant::UnixFdArray(_) => "ah",
            Variant::StringArray(_) => "as",
            Variant::ObjectPathArray(_) => "ao",
            Variant::Dict(_) => "a{sv}",
        }
    }

    /// Human readable name of the tag, used in error reports.
    pub fn tag_name(&self) -> &'static str {
        match self {
            Variant::Bool(_) => "bool",
            Variant::Byte(_) => "byte",
            Variant::Int16(_) => "int16",
            Variant::Uint16(_) => "uint16",
            Variant::Int32(_) => "int32",
            Variant::Uint32(_) => "uint32",
            Variant::Int64(_) => "int64",
            Variant::Uint64(_) => "uint64",
            Variant::UnixFd(_) => "unix fd",
            Variant::String(_) => "string",
            Variant::ObjectPath(_) => "object path",
            Variant::ByteArray(_) => "byte array",
            Variant::Uint16Array(_) => "uint16 array",
            Variant::Int32Array(_) => "int32 array",
            Variant::Uint32Array(_) => "uint32 array",
            Variant::Uint64Array(_) => "uint64 array",
            Variant::UnixFdArray(_) => "unix fd array",
            Variant::StringArray(_) => "string array",
            Variant::ObjectPathArray(_) => "object path array",
            Variant::Dict(_) => "dictionary",
        }
    }
}

/// Argument lists are always ordered sequences of variants.
pub type VariantList = Vec<Variant>;

macro_rules! variant_from {
    ($t:ty, $tag:ident) => {
        impl From<$t> for Variant {
            fn from(v: $t) -> Variant {
                Variant::$tag(v)
            }
        }
    };
}

variant_from!(bool, Bool);
variant_from!(u8, Byte);
variant_from!(i16, Int16);
variant_from!(u16, Uint16);
variant_from!(i32, Int32);
variant_from!(u32, Uint32);
variant_from!(i64, Int64);
variant_from!(u64, Uint64);
variant_from!(UnixFd, UnixFd);
variant_from!(String, String);
variant_from!(ObjectPath, ObjectPath);
variant_from!(Vec<u8>, ByteArray);
variant_from!(Vec<u16>, Uint16Array);
variant_from!(Vec<i32>, Int32Array);
variant_from!(Vec<u32>, Uint32Array);
variant_from!(Vec<u64>, Uint64Array);
variant_from!(Vec<UnixFd>, UnixFdArray);
variant_from!(Vec<String>, StringArray);
variant_from!(Vec<ObjectPath>, ObjectPathArray);
variant_from!(BTreeMap<String, DictValue>, Dict);

impl From<&str> for Variant {
    fn from(v: &str) -> Variant {
        Variant::String(v.to_string())
    }
}

/// Conversion out of a [`Variant`] for a concrete Rust type, used by
/// [`process_val`].
pub trait FromVariant: Sized {
    const EXPECTED: &'static str;

    fn from_variant(v: &Variant) -> Option<Self>;
}

macro_rules! from_variant {
    ($t:ty, $tag:ident, $name:expr) => {
        impl FromVariant for $t {
            const EXPECTED: &'static str = $name;

            fn from_variant(v: &Variant) -> Option<Self> {
                match v {
                    Variant::$tag(value) => Some(value.clone()),
                    _ => None,
                }
            }
        }
    };
}

from_variant!(bool, Bool, "bool");
from_variant!(u8, Byte, "byte");
from_variant!(i16, Int16, "int16");
from_variant!(u16, Uint16, "uint16");
from_variant!(i32, Int32, "int32");
from_variant!(u32, Uint32, "uint32");
from_variant!(i64, Int64, "int64");
from_variant!(u64, Uint64, "uint64");
from_variant!(UnixFd, UnixFd, "unix fd");
from_variant!(String, String, "string");
from_variant!(ObjectPath, ObjectPath, "object path");
from_variant!(Vec<u8>, ByteArray, "byte array");
from_variant!(Vec<u16>, Uint16Array, "uint16 array");
from_variant!(Vec<i32>, Int32Array, "int32 array");
from_variant!(Vec<u32>, Uint32Array, "uint32 array");
from_variant!(Vec<u64>, Uint64Array, "uint64 array");
from_variant!(Vec<UnixFd>, UnixFdArray, "unix fd array");
from_variant!(Vec<String>, StringArray, "string array");
from_variant!(Vec<ObjectPath>, ObjectPathArray, "object path array");
from_variant!(BTreeMap<String, DictValue>, Dict, "dictionary");

/// Extracts the argument at `index` as a `T`.
///
/// Fails with [`Error::TypeMismatch`] when the runtime tag of the argument is
/// not the one `T` maps to, and treats a missing argument the same way.
pub fn process_val<T: FromVariant>(args: &VariantList, index: usize) -> Result<T, Error> {
    let arg = args.get(index).ok_or(Error::TypeMismatch {
        index,
        expected: T::EXPECTED,
    })?;

    T::from_variant(arg).ok_or_else(|| {
        debug!(
            "argument {index} has tag {} but a {} was requested",
            arg.tag_name(),
            T::EXPECTED
        );
        Error::TypeMismatch {
            index,
            expected: T::EXPECTED,
        }
    })
}
