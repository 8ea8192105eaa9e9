//! Parameter variants decoded from an instruction payload.
//!
//! Handlers decode a fixed sequence of parameters by chaining [`get_param`]:
//! each call fills one slot and returns the offset right after the bytes it
//! consumed.

use std::fmt;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use luca_nls::{find_terminator, Charset};

use crate::error::{Result, ScriptError};

pub trait Paramter {
    /// Decode from `bytes` at `offset`, returning the offset after the consumed bytes.
    fn decode(&mut self, bytes: &[u8], offset: usize) -> Result<usize>;

    /// Raw bytes consumed by the last successful decode.
    fn size(&self) -> usize;

    fn to_param(&self) -> Param;
}

/// Decode one parameter into `slot` and return the next offset.
#[inline]
pub fn get_param<P: Paramter>(bytes: &[u8], slot: &mut P, offset: usize) -> Result<usize> {
    slot.decode(bytes, offset)
}

fn take(bytes: &[u8], offset: usize, need: usize) -> Result<&[u8]> {
    match offset.checked_add(need) {
        Some(end) if end <= bytes.len() => Ok(&bytes[offset..end]),
        _ => Err(ScriptError::TruncatedInstruction {
            offset,
            need,
            len: bytes.len(),
        }),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LUint16 {
    pub data: u16,
    pub size: usize,
}

impl Paramter for LUint16 {
    fn decode(&mut self, bytes: &[u8], offset: usize) -> Result<usize> {
        let raw = take(bytes, offset, 2)?;
        self.data = LittleEndian::read_u16(raw);
        self.size = 2;
        Ok(offset + 2)
    }

    fn size(&self) -> usize {
        self.size
    }

    fn to_param(&self) -> Param {
        Param::Uint16(self.data)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LUint32 {
    pub data: u32,
    pub size: usize,
}

impl Paramter for LUint32 {
    fn decode(&mut self, bytes: &[u8], offset: usize) -> Result<usize> {
        let raw = take(bytes, offset, 4)?;
        self.data = LittleEndian::read_u32(raw);
        self.size = 4;
        Ok(offset + 4)
    }

    fn size(&self) -> usize {
        self.size
    }

    fn to_param(&self) -> Param {
        Param::Uint32(self.data)
    }
}

/// A charset string.
///
/// With an explicit length the string occupies exactly that many bytes.
/// With length 0 it runs up to a terminator (the charset's own unless one is
/// set with [`LString::with_terminator`]); the terminator counts as consumed.
#[derive(Debug, Clone)]
pub struct LString {
    pub data: String,
    pub size: usize,
    charset: Arc<dyn Charset>,
    len: usize,
    terminator: Option<Vec<u8>>,
}

impl LString {
    pub fn new(charset: Arc<dyn Charset>) -> Self {
        Self {
            data: String::new(),
            size: 0,
            charset,
            len: 0,
            terminator: None,
        }
    }

    pub fn with_len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    pub fn with_terminator(mut self, terminator: impl Into<Vec<u8>>) -> Self {
        self.terminator = Some(terminator.into());
        self
    }
}

impl Paramter for LString {
    fn decode(&mut self, bytes: &[u8], offset: usize) -> Result<usize> {
        if self.len > 0 {
            let raw = take(bytes, offset, self.len)?;
            self.data = self.charset.decode(raw)?;
            self.size = self.len;
            return Ok(offset + self.len);
        }

        let terminator = match &self.terminator {
            Some(t) => t.as_slice(),
            None => self.charset.terminator(),
        };
        let tail = bytes.get(offset..).ok_or(ScriptError::TruncatedInstruction {
            offset,
            need: terminator.len(),
            len: bytes.len(),
        })?;
        let end = find_terminator(tail, terminator).ok_or(ScriptError::TruncatedInstruction {
            offset: bytes.len(),
            need: terminator.len(),
            len: bytes.len(),
        })?;

        self.data = self.charset.decode(&tail[..end])?;
        self.size = end + terminator.len();
        Ok(offset + self.size)
    }

    fn size(&self) -> usize {
        self.size
    }

    fn to_param(&self) -> Param {
        Param::Str(self.data.clone())
    }
}

/// A decoded parameter, as handed to engine hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Uint16(u16),
    Uint32(u32),
    Str(String),
}

impl Param {
    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Param::Uint16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Param::Uint32(v) => Some(*v),
            Param::Uint16(v) => Some(*v as u32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Param::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Uint16(v) => write!(f, "{v}"),
            Param::Uint32(v) => write!(f, "{v}"),
            Param::Str(s) => write!(f, "{s}"),
        }
    }
}

/// Split a payload into little-endian u16 words plus the odd trailing byte, if any.
pub fn all_to_uint16(bytes: &[u8]) -> (Vec<u16>, Option<u8>) {
    let words = bytes.chunks_exact(2).map(LittleEndian::read_u16).collect();
    let trailing = if bytes.len() % 2 == 1 {
        bytes.last().copied()
    } else {
        None
    };
    (words, trailing)
}
