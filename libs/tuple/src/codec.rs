// Copyright 2026 Loam Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! MsgPack navigation over raw byte slices.
//!
//! The update engine never materializes untouched subtrees, so it needs to
//! walk records marker by marker, learn the exact byte extent of a value, and
//! predict the encoded size of replacement values without encoding them
//! twice. [`Cursor`] does the walking, [`Writer`] does the second (store)
//! pass, and the `*_size` functions mirror the minimal-encoding choices of
//! `rmp`'s writers so the size pass and the store pass always agree.

use byteorder::{BigEndian, ByteOrder};
use loam_error::{Error, Result};
use rmp::Marker;
use rmpv::Value;

/// A read-only cursor over one MsgPack buffer.
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

// === impl Cursor ===

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn truncated(&self) -> Error {
        Error::IllegalParams(format!("truncated msgpack data at offset {}", self.pos))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(|| self.truncated())?;
        if end > self.buf.len() {
            return Err(self.truncated());
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn take_marker(&mut self) -> Result<Marker> {
        Ok(Marker::from_u8(self.take(1)?[0]))
    }

    pub fn peek_marker(&self) -> Result<Marker> {
        let b = *self.buf.get(self.pos).ok_or_else(|| self.truncated())?;
        Ok(Marker::from_u8(b))
    }

    fn len8(&mut self) -> Result<usize> {
        Ok(usize::from(self.take(1)?[0]))
    }

    fn len16(&mut self) -> Result<usize> {
        Ok(usize::from(BigEndian::read_u16(self.take(2)?)))
    }

    fn len32(&mut self) -> Result<usize> {
        Ok(BigEndian::read_u32(self.take(4)?) as usize)
    }

    /// Read an array header, failing on any other type.
    pub fn read_array_header(&mut self) -> Result<u32> {
        match self.take_marker()? {
            Marker::FixArray(n) => Ok(u32::from(n)),
            Marker::Array16 => Ok(self.len16()? as u32),
            Marker::Array32 => Ok(self.len32()? as u32),
            _ => Err(Error::IllegalParams(format!(
                "expected msgpack array at offset {}",
                self.pos.saturating_sub(1)
            ))),
        }
    }

    /// Read a map header, failing on any other type.
    pub fn read_map_header(&mut self) -> Result<u32> {
        match self.take_marker()? {
            Marker::FixMap(n) => Ok(u32::from(n)),
            Marker::Map16 => Ok(self.len16()? as u32),
            Marker::Map32 => Ok(self.len32()? as u32),
            _ => Err(Error::IllegalParams(format!(
                "expected msgpack map at offset {}",
                self.pos.saturating_sub(1)
            ))),
        }
    }

    /// Read a UTF-8 string, failing on any other type.
    pub fn read_str(&mut self) -> Result<&'a str> {
        let n = match self.take_marker()? {
            Marker::FixStr(n) => usize::from(n),
            Marker::Str8 => self.len8()?,
            Marker::Str16 => self.len16()?,
            Marker::Str32 => self.len32()?,
            _ => {
                return Err(Error::IllegalParams(format!(
                    "expected msgpack string at offset {}",
                    self.pos.saturating_sub(1)
                )))
            }
        };
        core::str::from_utf8(self.take(n)?)
            .map_err(|_| Error::IllegalParams("invalid utf-8 in msgpack string".into()))
    }

    /// Read any integer as `i128`, which covers the full unsigned and signed
    /// 64-bit ranges at once.
    pub fn read_int(&mut self) -> Result<i128> {
        let out = match self.take_marker()? {
            Marker::FixPos(n) => i128::from(n),
            Marker::FixNeg(n) => i128::from(n),
            Marker::U8 => i128::from(self.take(1)?[0]),
            Marker::U16 => i128::from(BigEndian::read_u16(self.take(2)?)),
            Marker::U32 => i128::from(BigEndian::read_u32(self.take(4)?)),
            Marker::U64 => i128::from(BigEndian::read_u64(self.take(8)?)),
            Marker::I8 => i128::from(self.take(1)?[0] as i8),
            Marker::I16 => i128::from(BigEndian::read_i16(self.take(2)?)),
            Marker::I32 => i128::from(BigEndian::read_i32(self.take(4)?)),
            Marker::I64 => i128::from(BigEndian::read_i64(self.take(8)?)),
            _ => {
                return Err(Error::IllegalParams(format!(
                    "expected msgpack integer at offset {}",
                    self.pos.saturating_sub(1)
                )))
            }
        };
        Ok(out)
    }

    /// Skip one value and return the bytes it occupied.
    pub fn skip_value(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        self.skip_one()?;
        Ok(&self.buf[start..self.pos])
    }

    /// Skip `n` values and return the bytes they occupied.
    pub fn skip_values(&mut self, n: u32) -> Result<&'a [u8]> {
        let start = self.pos;
        for _ in 0..n {
            self.skip_one()?;
        }
        Ok(&self.buf[start..self.pos])
    }

    fn skip_one(&mut self) -> Result<()> {
        match self.take_marker()? {
            Marker::FixPos(_)
            | Marker::FixNeg(_)
            | Marker::Null
            | Marker::True
            | Marker::False => {}
            Marker::U8 | Marker::I8 => {
                self.take(1)?;
            }
            Marker::U16 | Marker::I16 => {
                self.take(2)?;
            }
            Marker::U32 | Marker::I32 | Marker::F32 => {
                self.take(4)?;
            }
            Marker::U64 | Marker::I64 | Marker::F64 => {
                self.take(8)?;
            }
            Marker::FixStr(n) => {
                self.take(usize::from(n))?;
            }
            Marker::Str8 | Marker::Bin8 => {
                let n = self.len8()?;
                self.take(n)?;
            }
            Marker::Str16 | Marker::Bin16 => {
                let n = self.len16()?;
                self.take(n)?;
            }
            Marker::Str32 | Marker::Bin32 => {
                let n = self.len32()?;
                self.take(n)?;
            }
            Marker::FixArray(n) => {
                for _ in 0..n {
                    self.skip_one()?;
                }
            }
            Marker::Array16 => {
                let n = self.len16()?;
                for _ in 0..n {
                    self.skip_one()?;
                }
            }
            Marker::Array32 => {
                let n = self.len32()?;
                for _ in 0..n {
                    self.skip_one()?;
                }
            }
            Marker::FixMap(n) => {
                for _ in 0..2 * usize::from(n) {
                    self.skip_one()?;
                }
            }
            Marker::Map16 => {
                let n = self.len16()?;
                for _ in 0..2 * n {
                    self.skip_one()?;
                }
            }
            Marker::Map32 => {
                let n = self.len32()?;
                for _ in 0..2 * n {
                    self.skip_one()?;
                }
            }
            Marker::FixExt1 => {
                self.take(2)?;
            }
            Marker::FixExt2 => {
                self.take(3)?;
            }
            Marker::FixExt4 => {
                self.take(5)?;
            }
            Marker::FixExt8 => {
                self.take(9)?;
            }
            Marker::FixExt16 => {
                self.take(17)?;
            }
            Marker::Ext8 => {
                let n = self.len8()?;
                self.take(n + 1)?;
            }
            Marker::Ext16 => {
                let n = self.len16()?;
                self.take(n + 1)?;
            }
            Marker::Ext32 => {
                let n = self.len32()?;
                self.take(n + 1)?;
            }
            Marker::Reserved => {
                return Err(Error::IllegalParams(format!(
                    "reserved msgpack marker at offset {}",
                    self.pos.saturating_sub(1)
                )))
            }
        }
        Ok(())
    }

    /// Decode one value into an owned [`Value`], advancing the cursor past it.
    pub fn read_value(&mut self) -> Result<Value> {
        let bytes = self.skip_value()?;
        let mut rd = bytes;
        rmpv::decode::read_value(&mut rd)
            .map_err(|e| Error::IllegalParams(format!("malformed msgpack value: {e}")))
    }
}

// === sizes ===

pub fn uint_size(v: u64) -> usize {
    if v < 0x80 {
        1
    } else if v <= 0xff {
        2
    } else if v <= 0xffff {
        3
    } else if v <= 0xffff_ffff {
        5
    } else {
        9
    }
}

pub fn sint_size(v: i64) -> usize {
    if v >= 0 {
        uint_size(v as u64)
    } else if v >= -32 {
        1
    } else if v >= i64::from(i8::MIN) {
        2
    } else if v >= i64::from(i16::MIN) {
        3
    } else if v >= i64::from(i32::MIN) {
        5
    } else {
        9
    }
}

pub fn str_header_size(len: usize) -> usize {
    if len < 32 {
        1
    } else if len < 256 {
        2
    } else if len < 65536 {
        3
    } else {
        5
    }
}

pub fn bin_header_size(len: usize) -> usize {
    if len < 256 {
        2
    } else if len < 65536 {
        3
    } else {
        5
    }
}

/// Array and map headers share thresholds.
pub fn container_header_size(n: u32) -> usize {
    if n < 16 {
        1
    } else if n < 65536 {
        3
    } else {
        5
    }
}

pub fn ext_size(len: usize) -> usize {
    match len {
        1 | 2 | 4 | 8 | 16 => 2 + len,
        _ if len < 256 => 3 + len,
        _ if len < 65536 => 4 + len,
        _ => 6 + len,
    }
}

/// The exact number of bytes `rmpv::encode::write_value` will produce.
pub fn value_size(v: &Value) -> usize {
    match v {
        Value::Nil | Value::Boolean(_) => 1,
        Value::Integer(i) => match (i.as_u64(), i.as_i64()) {
            (Some(u), _) => uint_size(u),
            (None, Some(s)) => sint_size(s),
            (None, None) => 9,
        },
        Value::F32(_) => 5,
        Value::F64(_) => 9,
        Value::String(s) => {
            let n = s.as_bytes().len();
            str_header_size(n) + n
        }
        Value::Binary(b) => bin_header_size(b.len()) + b.len(),
        Value::Array(items) => {
            container_header_size(items.len() as u32)
                + items.iter().map(value_size).sum::<usize>()
        }
        Value::Map(entries) => {
            container_header_size(entries.len() as u32)
                + entries
                    .iter()
                    .map(|(k, v)| value_size(k) + value_size(v))
                    .sum::<usize>()
        }
        Value::Ext(_, data) => ext_size(data.len()),
    }
}

/// Sequential writer over a preallocated output buffer (the store pass).
#[derive(Debug)]
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

// === impl Writer ===

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    fn overflow() -> Error {
        Error::System("update serializer overflowed its size estimate".into())
    }

    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.pos.checked_add(bytes.len()).ok_or_else(Self::overflow)?;
        if end > self.buf.len() {
            return Err(Self::overflow());
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    fn write_byte(&mut self, b: u8) -> Result<()> {
        self.write_raw(&[b])
    }

    fn write_u16(&mut self, v: u16) -> Result<()> {
        self.write_raw(&v.to_be_bytes())
    }

    fn write_u32(&mut self, v: u32) -> Result<()> {
        self.write_raw(&v.to_be_bytes())
    }

    pub fn write_array_header(&mut self, n: u32) -> Result<()> {
        if n < 16 {
            self.write_byte(Marker::FixArray(n as u8).to_u8())
        } else if n < 65536 {
            self.write_byte(Marker::Array16.to_u8())?;
            self.write_u16(n as u16)
        } else {
            self.write_byte(Marker::Array32.to_u8())?;
            self.write_u32(n)
        }
    }

    pub fn write_map_header(&mut self, n: u32) -> Result<()> {
        if n < 16 {
            self.write_byte(Marker::FixMap(n as u8).to_u8())
        } else if n < 65536 {
            self.write_byte(Marker::Map16.to_u8())?;
            self.write_u16(n as u16)
        } else {
            self.write_byte(Marker::Map32.to_u8())?;
            self.write_u32(n)
        }
    }

    pub fn write_str_header(&mut self, len: usize) -> Result<()> {
        if len < 32 {
            self.write_byte(Marker::FixStr(len as u8).to_u8())
        } else if len < 256 {
            self.write_byte(Marker::Str8.to_u8())?;
            self.write_byte(len as u8)
        } else if len < 65536 {
            self.write_byte(Marker::Str16.to_u8())?;
            self.write_u16(len as u16)
        } else {
            self.write_byte(Marker::Str32.to_u8())?;
            self.write_u32(len as u32)
        }
    }

    pub fn write_value(&mut self, v: &Value) -> Result<()> {
        let mut shim = IoShim(self);
        rmpv::encode::write_value(&mut shim, v)
            .map_err(|_| Self::overflow())
    }
}

struct IoShim<'w, 'a>(&'w mut Writer<'a>);

impl std::io::Write for IoShim<'_, '_> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0
            .write_raw(data)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::WriteZero, "buffer full"))?;
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
