use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;

use crate::error::{Result, ScriptError};

/// Size of the `len:u16, opcode:u8, flag:u8` instruction header.
pub const HEADER_LEN: usize = 4;

/// One decoded instruction.
///
/// `bytes` holds only the payload; the header fields are split out. `pos`
/// is the byte offset of the header within the script file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeLine {
    pub pos: u32,
    pub opcode: u8,
    pub flag: u8,
    pub bytes: Bytes,
}

impl CodeLine {
    pub fn new(pos: u32, opcode: u8, flag: u8, bytes: impl Into<Bytes>) -> Self {
        Self {
            pos,
            opcode,
            flag,
            bytes: bytes.into(),
        }
    }

    /// Encoded length including header and alignment padding.
    pub fn encoded_len(&self) -> usize {
        let len = HEADER_LEN + self.bytes.len();
        len + (len & 1)
    }
}

/// A parsed script file: an ordered list of instructions addressable by offset.
#[derive(Debug, Clone)]
pub struct Script {
    name: Arc<str>,
    codes: Vec<CodeLine>,
}

impl Script {
    /// Split a raw script stream into instructions.
    ///
    /// Each instruction is `len:u16le, opcode:u8, flag:u8` followed by
    /// `len - 4` payload bytes, plus one padding byte when `len` is odd.
    /// A run of zero bytes at the end of the stream is padding and stops
    /// parsing.
    pub fn parse(name: impl Into<Arc<str>>, data: impl Into<Bytes>) -> Result<Self> {
        let name = name.into();
        let data: Bytes = data.into();
        let mut codes = Vec::new();
        let mut off = 0usize;

        while off < data.len() {
            if data[off..].iter().all(|&b| b == 0) {
                log::trace!("{}: zero padding from 0x{:X}", name, off);
                break;
            }

            let pos = off as u32;
            if off + HEADER_LEN > data.len() {
                return Err(ScriptError::BadHeader {
                    pos,
                    len: data.len() - off,
                });
            }

            let len = LittleEndian::read_u16(&data[off..off + 2]) as usize;
            if len < HEADER_LEN || off + len > data.len() {
                return Err(ScriptError::BadHeader { pos, len });
            }

            let opcode = data[off + 2];
            let flag = data[off + 3];
            let payload = data.slice(off + HEADER_LEN..off + len);
            codes.push(CodeLine {
                pos,
                opcode,
                flag,
                bytes: payload,
            });

            off += len + (len & 1);
        }

        log::debug!("{}: parsed {} instruction(s)", name, codes.len());
        Ok(Self { name, codes })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codes(&self) -> &[CodeLine] {
        &self.codes
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CodeLine> {
        self.codes.get(index)
    }

    /// Index of the instruction whose header starts exactly at `pos`.
    pub fn index_of(&self, pos: u32) -> Option<usize> {
        self.codes.binary_search_by_key(&pos, |c| c.pos).ok()
    }

    /// Address of the instruction following `index`, or `None` past the end.
    pub fn fallthrough(&self, index: usize) -> Option<u32> {
        self.codes.get(index + 1).map(|c| c.pos)
    }

    /// Resolve a branch target, failing if it does not land on an instruction.
    pub fn resolve(&self, pos: u32) -> Result<usize> {
        self.index_of(pos)
            .ok_or_else(|| ScriptError::InvalidScriptReference {
                script: self.name.to_string(),
                pos,
            })
    }
}

/// Assembles instruction streams, mostly for tests and tooling.
#[derive(Debug, Default)]
pub struct ScriptBuilder {
    buf: Vec<u8>,
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset the next pushed instruction will land on.
    pub fn cursor(&self) -> u32 {
        self.buf.len() as u32
    }

    /// Append one instruction and return its offset.
    ///
    /// Panics if the payload cannot fit the 16-bit length field.
    pub fn push(&mut self, opcode: u8, payload: &[u8]) -> u32 {
        self.push_with_flag(opcode, 0, payload)
    }

    pub fn push_with_flag(&mut self, opcode: u8, flag: u8, payload: &[u8]) -> u32 {
        let pos = self.cursor();
        let len = HEADER_LEN + payload.len();
        assert!(len <= u16::MAX as usize, "instruction payload too large");

        let mut header = [0u8; 2];
        LittleEndian::write_u16(&mut header, len as u16);
        self.buf.extend_from_slice(&header);
        self.buf.push(opcode);
        self.buf.push(flag);
        self.buf.extend_from_slice(payload);
        if len & 1 == 1 {
            self.buf.push(0);
        }
        pos
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.buf.clone()
    }

    pub fn build(self, name: impl Into<Arc<str>>) -> Result<Script> {
        Script::parse(name, self.buf)
    }
}
