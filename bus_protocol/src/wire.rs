// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Conversion between argument lists and the aligned wire encoding carried in
//! message bodies. File descriptor values are encoded as indexes into the
//! out-of-band descriptor array that travels with the message.

use std::collections::BTreeMap;
use std::os::fd::OwnedFd;

use crate::variant::{dup_cloexec, DictValue, ObjectPath, UnixFd, Variant, VariantList};
use crate::Error;

/// A fully encoded message body plus everything that travels with it.
pub struct MarshalledBody {
    pub data: Vec<u8>,
    pub signature: String,
    pub fds: Vec<OwnedFd>,
}

/// Encodes `args` into a message body.
///
/// On any failure the partially built body is discarded; no partial message
/// ever reaches the wire.
pub fn marshal(args: &VariantList) -> Result<MarshalledBody, Error> {
    let mut w = Writer::new();
    let mut signature = String::new();

    for arg in args {
        signature.push_str(arg.signature());
        w.put_variant_value(arg)?;
    }

    Ok(MarshalledBody {
        data: w.buf,
        signature,
        fds: w.fds,
    })
}

/// Decodes a message body back into an argument list.
///
/// Descriptor values are duplicated (close-on-exec) out of `fds`; the caller
/// keeps ownership of the originals and closes them when the message is
/// released.
pub fn demarshal(data: &[u8], signature: &str, fds: &[OwnedFd]) -> Result<VariantList, Error> {
    let mut r = Reader::new(data, fds);
    let mut args = VariantList::new();
    let mut sig = signature;

    while !sig.is_empty() {
        let (tok, rest) = split_first_type(sig)?;
        args.push(r.read_value(tok)?);
        sig = rest;
    }

    if r.pos != data.len() {
        return Err(Error::Demarshal(format!(
            "{} trailing bytes after arguments",
            data.len() - r.pos
        )));
    }

    Ok(args)
}

/// Splits the leading complete type off a signature string.
fn split_first_type(sig: &str) -> Result<(&str, &str), Error> {
    let bytes = sig.as_bytes();

    match bytes[0] {
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'h' | b's' | b'o' | b'g'
        | b'v' => Ok(sig.split_at(1)),
        b'a' => {
            if sig.len() < 2 {
                return Err(Error::Demarshal("array signature missing element".into()));
            }
            if bytes[1] == b'{' {
                match sig.find('}') {
                    Some(end) => Ok(sig.split_at(end + 1)),
                    None => Err(Error::Demarshal("unterminated dict entry signature".into())),
                }
            } else {
                let (elem, _) = split_first_type(&sig[1..])?;
                Ok(sig.split_at(1 + elem.len()))
            }
        }
        other => Err(Error::Demarshal(format!(
            "unsupported type code '{}'",
            other as char
        ))),
    }
}

/// Natural alignment of a single complete type.
fn alignment_of(tok: &str) -> usize {
    match tok.as_bytes()[0] {
        b'y' | b'g' | b'v' => 1,
        b'n' | b'q' => 2,
        b'b' | b'i' | b'u' | b'h' | b's' | b'o' | b'a' => 4,
        b'x' | b't' | b'{' => 8,
        _ => 1,
    }
}

pub(crate) struct Writer {
    pub(crate) buf: Vec<u8>,
    pub(crate) fds: Vec<OwnedFd>,
}

impl Writer {
    pub(crate) fn new() -> Writer {
        Writer {
            buf: Vec::new(),
            fds: Vec::new(),
        }
    }

    pub(crate) fn align(&mut self, n: usize) {
        while self.buf.len() % n != 0 {
            self.buf.push(0);
        }
    }

    pub(crate) fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn put_u16(&mut self, v: u16) {
        self.align(2);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_i16(&mut self, v: i16) {
        self.align(2);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_u32(&mut self, v: u32) {
        self.align(4);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_i32(&mut self, v: i32) {
        self.align(4);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_u64(&mut self, v: u64) {
        self.align(8);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_i64(&mut self, v: i64) {
        self.align(8);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_bool(&mut self, v: bool) {
        self.put_u32(u32::from(v));
    }

    pub(crate) fn put_string(&mut self, v: &str) {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v.as_bytes());
        self.buf.push(0);
    }

    pub(crate) fn put_signature(&mut self, v: &str) {
        self.put_u8(v.len() as u8);
        self.buf.extend_from_slice(v.as_bytes());
        self.buf.push(0);
    }

    pub(crate) fn put_fd(&mut self, fd: &UnixFd) -> Result<(), Error> {
        let borrowed = fd
            .fd()
            .ok_or_else(|| Error::Marshal("attempting to append invalid file descriptor".into()))?;
        let dup = dup_cloexec(borrowed)
            .map_err(|e| Error::Marshal(format!("failed to dup file descriptor: {e}")))?;

        self.put_u32(self.fds.len() as u32);
        self.fds.push(dup);
        Ok(())
    }

    fn put_primitive_array<T: Copy, F: FnMut(&mut Writer, T)>(
        &mut self,
        values: &[T],
        elem_align: usize,
        mut put: F,
    ) -> Result<(), Error> {
        self.put_u32(0);
        let patch = self.buf.len() - 4;
        self.align(elem_align);
        let start = self.buf.len();

        for v in values {
            put(self, *v);
        }

        let len = self.buf.len() - start;
        self.buf[patch..patch + 4].copy_from_slice(&(len as u32).to_le_bytes());
        Ok(())
    }

    fn put_dict(&mut self, dict: &BTreeMap<String, DictValue>) -> Result<(), Error> {
        self.put_u32(0);
        let patch = self.buf.len() - 4;
        self.align(8);
        let start = self.buf.len();

        for (key, value) in dict {
            self.align(8);
            self.put_string(key);
            self.put_signature(value.signature());
            self.put_dict_value(value)?;
        }

        let len = self.buf.len() - start;
        self.buf[patch..patch + 4].copy_from_slice(&(len as u32).to_le_bytes());
        Ok(())
    }

    fn put_dict_value(&mut self, value: &DictValue) -> Result<(), Error> {
        match value {
            DictValue::Bool(v) => self.put_bool(*v),
            DictValue::Byte(v) => self.put_u8(*v),
            DictValue::Int16(v) => self.put_i16(*v),
            DictValue::Uint16(v) => self.put_u16(*v),
            DictValue::Int32(v) => self.put_i32(*v),
            DictValue::Uint32(v) => self.put_u32(*v),
            DictValue::Int64(v) => self.put_i64(*v),
            DictValue::Uint64(v) => self.put_u64(*v),
            DictValue::UnixFd(v) => self.put_fd(v)?,
            DictValue::String(v) => self.put_string(v),
            DictValue::ObjectPath(v) => self.put_string(v.as_str()),
        }
        Ok(())
    }

    fn put_variant_value(&mut self, arg: &Variant) -> Result<(), Error> {
        match arg {
            Variant::Bool(v) => self.put_bool(*v),
            Variant::Byte(v) => self.put_u8(*v),
            Variant::Int16(v) => self.put_i16(*v),
            Variant::Uint16(v) => self.put_u16(*v),
            Variant::Int32(v) => self.put_i32(*v),
            Variant::Uint32(v) => self.put_u32(*v),
            Variant::Int64(v) => self.put_i64(*v),
            Variant::Uint64(v) => self.put_u64(*v),
            Variant::UnixFd(v) => self.put_fd(v)?,
            Variant::String(v) => self.put_string(v),
            Variant::ObjectPath(v) => self.put_string(v.as_str()),
            Variant::ByteArray(v) => self.put_primitive_array(v, 1, Writer::put_u8)?,
            Variant::Uint16Array(v) => self.put_primitive_array(v, 2, Writer::put_u16)?,
            Variant::Int32Array(v) => self.put_primitive_array(v, 4, Writer::put_i32)?,
            Variant::Uint32Array(v) => self.put_primitive_array(v, 4, Writer::put_u32)?,
            Variant::Uint64Array(v) => self.put_primitive_array(v, 8, Writer::put_u64)?,
            Variant::UnixFdArray(v) => {
                self.put_u32(0);
                let patch = self.buf.len() - 4;
                let start = self.buf.len();
                for fd in v {
                    self.put_fd(fd)?;
                }
                let len = self.buf.len() - start;
                self.buf[patch..patch + 4].copy_from_slice(&(len as u32).to_le_bytes());
            }
            Variant::StringArray(v) => {
                self.put_u32(0);
                let patch = self.buf.len() - 4;
                let start = self.buf.len();
                for s in v {
                    self.put_string(s);
                }
                let len = self.buf.len() - start;
                self.buf[patch..patch + 4].copy_from_slice(&(len as u32).to_le_bytes());
            }
            Variant::ObjectPathArray(v) => {
                self.put_u32(0);
                let patch = self.buf.len() - 4;
                let start = self.buf.len();
                for p in v {
                    self.put_string(p.as_str());
                }
                let len = self.buf.len() - start;
                self.buf[patch..patch + 4].copy_from_slice(&(len as u32).to_le_bytes());
            }
            Variant::Dict(v) => self.put_dict(v)?,
        }
        Ok(())
    }
}

pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pub(crate) pos: usize,
    fds: &'a [OwnedFd],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8], fds: &'a [OwnedFd]) -> Reader<'a> {
        Reader { data, pos: 0, fds }
    }

    pub(crate) fn align(&mut self, n: usize) -> Result<(), Error> {
        while self.pos % n != 0 {
            if self.pos >= self.data.len() {
                return Err(Error::Demarshal("message truncated in padding".into()));
            }
            if self.data[self.pos] != 0 {
                return Err(Error::Demarshal("non-zero padding byte".into()));
            }
            self.pos += 1;
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.pos + n > self.data.len() {
            return Err(Error::Demarshal("message truncated".into()));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn get_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn get_u16(&mut self) -> Result<u16, Error> {
        self.align(2)?;
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn get_i16(&mut self) -> Result<i16, Error> {
        Ok(self.get_u16()? as i16)
    }

    pub(crate) fn get_u32(&mut self) -> Result<u32, Error> {
        self.align(4)?;
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn get_i32(&mut self) -> Result<i32, Error> {
        Ok(self.get_u32()? as i32)
    }

    pub(crate) fn get_u64(&mut self) -> Result<u64, Error> {
        self.align(8)?;
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub(crate) fn get_i64(&mut self) -> Result<i64, Error> {
        Ok(self.get_u64()? as i64)
    }

    pub(crate) fn get_bool(&mut self) -> Result<bool, Error> {
        match self.get_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::Demarshal(format!("invalid boolean value {other}"))),
        }
    }

    pub(crate) fn get_string(&mut self) -> Result<String, Error> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        let s = std::str::from_utf8(bytes)
            .map_err(|_| Error::Demarshal("string is not valid UTF-8".into()))?
            .to_string();
        if self.get_u8()? != 0 {
            return Err(Error::Demarshal("string missing NUL terminator".into()));
        }
        Ok(s)
    }

    pub(crate) fn get_signature(&mut self) -> Result<String, Error> {
        let len = self.get_u8()? as usize;
        let bytes = self.take(len)?;
        let s = std::str::from_utf8(bytes)
            .map_err(|_| Error::Demarshal("signature is not valid UTF-8".into()))?
            .to_string();
        if self.get_u8()? != 0 {
            return Err(Error::Demarshal("signature missing NUL terminator".into()));
        }
        Ok(s)
    }

    pub(crate) fn get_fd(&mut self) -> Result<UnixFd, Error> {
        let index = self.get_u32()? as usize;
        let fd = self
            .fds
            .get(index)
            .ok_or_else(|| Error::Demarshal(format!("fd index {index} out of range")))?;
        Ok(UnixFd::new(fd))
    }

    fn read_value(&mut self, tok: &str) -> Result<Variant, Error> {
        let value = match tok {
            "b" => Variant::Bool(self.get_bool()?),
            "y" => Variant::Byte(self.get_u8()?),
            "n" => Variant::Int16(self.get_i16()?),
            "q" => Variant::Uint16(self.get_u16()?),
            "i" => Variant::Int32(self.get_i32()?),
            "u" => Variant::Uint32(self.get_u32()?),
            "x" => Variant::Int64(self.get_i64()?),
            "t" => Variant::Uint64(self.get_u64()?),
            "h" => Variant::UnixFd(self.get_fd()?),
            "s" => Variant::String(self.get_string()?),
            "o" => Variant::ObjectPath(ObjectPath::new(self.get_string()?)),
            _ if tok.starts_with('a') => self.read_array(&tok[1..])?,
            other => {
                return Err(Error::Demarshal(format!(
                    "unsupported argument signature '{other}'"
                )))
            }
        };
        Ok(value)
    }

    fn read_array(&mut self, elem: &str) -> Result<Variant, Error> {
        let len = self.get_u32()? as usize;
        if len > crate::MAX_MESSAGE_SIZE {
            return Err(Error::Demarshal("array length exceeds message cap".into()));
        }
        self.align(alignment_of(elem))?;
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(Error::Demarshal("array runs past end of message".into()));
        }

        let value = match elem {
            "y" => {
                let bytes = self.take(len)?.to_vec();
                Variant::ByteArray(bytes)
            }
            "q" => {
                let mut v = Vec::new();
                while self.pos < end {
                    v.push(self.get_u16()?);
                }
                Variant::Uint16Array(v)
            }
            "i" => {
                let mut v = Vec::new();
                while self.pos < end {
                    v.push(self.get_i32()?);
                }
                Variant::Int32Array(v)
            }
            "u" => {
                let mut v = Vec::new();
                while self.pos < end {
                    v.push(self.get_u32()?);
                }
                Variant::Uint32Array(v)
            }
            "t" => {
                let mut v = Vec::new();
                while self.pos < end {
                    v.push(self.get_u64()?);
                }
                Variant::Uint64Array(v)
            }
            "h" => {
                let mut v = Vec::new();
                while self.pos < end {
                    v.push(self.get_fd()?);
                }
                Variant::UnixFdArray(v)
            }
            "s" => {
                let mut v = Vec::new();
                while self.pos < end {
                    v.push(self.get_string()?);
                }
                Variant::StringArray(v)
            }
            "o" => {
                let mut v = Vec::new();
                while self.pos < end {
                    v.push(ObjectPath::new(self.get_string()?));
                }
                Variant::ObjectPathArray(v)
            }
            "{sv}" => {
                let mut dict = BTreeMap::new();
                while self.pos < end {
                    self.align(8)?;
                    let key = self.get_string()?;
                    let sig = self.get_signature()?;
                    let value = self.read_dict_value(&sig, 0)?;
                    dict.insert(key, value);
                }
                Variant::Dict(dict)
            }
            other => {
                return Err(Error::Demarshal(format!(
                    "unsupported array element signature '{other}'"
                )))
            }
        };

        if self.pos != end {
            return Err(Error::Demarshal("array element overran its length".into()));
        }

        Ok(value)
    }

    fn read_dict_value(&mut self, sig: &str, depth: usize) -> Result<DictValue, Error> {
        let value = match sig {
            "b" => DictValue::Bool(self.get_bool()?),
            "y" => DictValue::Byte(self.get_u8()?),
            "n" => DictValue::Int16(self.get_i16()?),
            "q" => DictValue::Uint16(self.get_u16()?),
            "i" => DictValue::Int32(self.get_i32()?),
            "u" => DictValue::Uint32(self.get_u32()?),
            "x" => DictValue::Int64(self.get_i64()?),
            "t" => DictValue::Uint64(self.get_u64()?),
            "h" => DictValue::UnixFd(self.get_fd()?),
            "s" => DictValue::String(self.get_string()?),
            "o" => DictValue::ObjectPath(ObjectPath::new(self.get_string()?)),
            "v" => {
                // a peer may wrap the value in a further variant layer; follow
                // it one level only
                if depth > 0 {
                    return Err(Error::Demarshal("nested variant in dictionary value".into()));
                }
                let inner = self.get_signature()?;
                self.read_dict_value(&inner, depth + 1)?
            }
            other => {
                return Err(Error::Demarshal(format!(
                    "unsupported dictionary value signature '{other}'"
                )))
            }
        };
        Ok(value)
    }
}
