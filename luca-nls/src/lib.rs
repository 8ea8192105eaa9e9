//! luca-nls
//!
//! Text charsets used by LucaSystem scripts. Every charset maps byte sequences
//! to characters and back, and refuses to guess: bytes without a mapping are an
//! error, never a replacement character.

use encoding_rs::{Encoding as RsEncoding, GB18030, GBK, SHIFT_JIS};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CharsetError {
    #[error("cannot decode {bytes:02X?} at offset {offset} as {charset}")]
    Decode {
        charset: String,
        offset: usize,
        bytes: Vec<u8>,
    },

    #[error("character {ch:?} has no mapping in {charset}")]
    Encode { charset: String, ch: char },

    #[error("charset table line {line}: {reason}")]
    Table { line: usize, reason: String },
}

pub type Result<T> = std::result::Result<T, CharsetError>;

pub trait Charset: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Decode the character starting at `offset`, returning it with the number
    /// of bytes it occupies.
    fn decode_char(&self, bytes: &[u8], offset: usize) -> Result<(char, usize)>;

    fn encode_char(&self, ch: char, out: &mut Vec<u8>) -> Result<()>;

    /// Byte sequence ending a string when no explicit length is known.
    fn terminator(&self) -> &[u8] {
        &[0]
    }

    fn decode(&self, bytes: &[u8]) -> Result<String> {
        let mut text = String::with_capacity(bytes.len());
        let mut off = 0;
        while off < bytes.len() {
            let (ch, n) = self.decode_char(bytes, off)?;
            text.push(ch);
            off += n;
        }
        Ok(text)
    }

    fn encode(&self, text: &str) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(text.len());
        for ch in text.chars() {
            self.encode_char(ch, &mut out)?;
        }
        Ok(out)
    }

    /// Decode C-style string: stop at the first terminator.
    fn decode_cstr(&self, bytes: &[u8]) -> Result<String> {
        let end = find_terminator(bytes, self.terminator()).unwrap_or(bytes.len());
        self.decode(&bytes[..end])
    }
}

/// Position of the first terminator in `bytes`. Multi-byte terminators are
/// only matched on their own alignment, so a UTF-16 `00 00` straddling two
/// code units is not mistaken for one.
pub fn find_terminator(bytes: &[u8], terminator: &[u8]) -> Option<usize> {
    let step = terminator.len().max(1);
    (0..bytes.len())
        .step_by(step)
        .find(|&i| bytes[i..].starts_with(terminator))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Utf8,
    ShiftJis,
    Gbk,
    Gb18030,
    /// Called "Unicode" by the engine's own tools.
    Utf16Le,
}

impl Encoding {
    #[inline]
    fn as_encoding_rs(self) -> Option<&'static RsEncoding> {
        match self {
            Encoding::ShiftJis => Some(SHIFT_JIS),
            Encoding::Gbk => Some(GBK),
            Encoding::Gb18030 => Some(GB18030),
            Encoding::Utf8 | Encoding::Utf16Le => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Encoding::Utf8 => "UTF-8",
            Encoding::ShiftJis => "Shift_JIS",
            Encoding::Gbk => "GBK",
            Encoding::Gb18030 => "gb18030",
            Encoding::Utf16Le => "UTF-16LE",
        }
    }

    pub fn charset(self) -> Arc<dyn Charset> {
        Arc::new(Codec::new(self))
    }
}

/// A charset bound to one standard encoding.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    enc: Encoding,
}

impl Codec {
    #[inline]
    pub fn new(enc: Encoding) -> Self {
        Self { enc }
    }

    #[inline]
    pub fn encoding(&self) -> Encoding {
        self.enc
    }

    /// Length of the sequence introduced by the byte at `off`, judged from the
    /// lead byte (and the trail byte for GB18030 four-byte forms).
    fn sequence_len(&self, bytes: &[u8], off: usize) -> usize {
        let lead = bytes[off];
        match self.enc {
            Encoding::Utf8 => match lead {
                0xC0..=0xDF => 2,
                0xE0..=0xEF => 3,
                0xF0..=0xF7 => 4,
                _ => 1,
            },
            Encoding::ShiftJis => match lead {
                0x81..=0x9F | 0xE0..=0xFC => 2,
                _ => 1,
            },
            Encoding::Gbk | Encoding::Gb18030 => match (lead, bytes.get(off + 1)) {
                (0x81..=0xFE, Some(0x30..=0x39)) => 4,
                (0x81..=0xFE, _) => 2,
                _ => 1,
            },
            Encoding::Utf16Le => match bytes.get(off + 1) {
                Some(0xD8..=0xDB) => 4,
                _ => 2,
            },
        }
    }

    fn decode_error(&self, bytes: &[u8], off: usize, n: usize) -> CharsetError {
        let end = (off + n).min(bytes.len());
        CharsetError::Decode {
            charset: self.enc.name().to_string(),
            offset: off,
            bytes: bytes.get(off..end).unwrap_or_default().to_vec(),
        }
    }
}

impl Charset for Codec {
    fn name(&self) -> &str {
        self.enc.name()
    }

    fn decode_char(&self, bytes: &[u8], offset: usize) -> Result<(char, usize)> {
        if offset >= bytes.len() {
            return Err(self.decode_error(bytes, offset, 0));
        }
        let n = self.sequence_len(bytes, offset);
        if offset + n > bytes.len() {
            return Err(self.decode_error(bytes, offset, n));
        }
        let seq = &bytes[offset..offset + n];

        let decoded = match self.enc {
            Encoding::Utf8 => std::str::from_utf8(seq).ok().and_then(|s| s.chars().next()),
            Encoding::Utf16Le => {
                let units = seq
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]));
                let mut chars = char::decode_utf16(units);
                match (chars.next(), chars.next()) {
                    (Some(Ok(ch)), None) => Some(ch),
                    _ => None,
                }
            }
            _ => {
                let enc = self.enc.as_encoding_rs().ok_or_else(|| self.decode_error(bytes, offset, n))?;
                enc.decode_without_bom_handling_and_without_replacement(seq)
                    .and_then(|s| {
                        let mut chars = s.chars();
                        match (chars.next(), chars.next()) {
                            (Some(ch), None) => Some(ch),
                            _ => None,
                        }
                    })
            }
        };

        decoded
            .map(|ch| (ch, n))
            .ok_or_else(|| self.decode_error(bytes, offset, n))
    }

    fn encode_char(&self, ch: char, out: &mut Vec<u8>) -> Result<()> {
        match self.enc {
            Encoding::Utf8 => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
            Encoding::Utf16Le => {
                let mut buf = [0u16; 2];
                for unit in ch.encode_utf16(&mut buf) {
                    out.extend_from_slice(&unit.to_le_bytes());
                }
            }
            _ => {
                let enc = self.enc.as_encoding_rs().ok_or_else(|| CharsetError::Encode {
                    charset: self.enc.name().to_string(),
                    ch,
                })?;
                let mut buf = [0u8; 4];
                let (bytes, _, had_errors) = enc.encode(ch.encode_utf8(&mut buf));
                // several chars can share one byte sequence; only the one it decodes to is encodable
                let round_trips = !had_errors
                    && matches!(self.decode_char(&bytes, 0), Ok((back, n)) if back == ch && n == bytes.len());
                if !round_trips {
                    return Err(CharsetError::Encode {
                        charset: self.enc.name().to_string(),
                        ch,
                    });
                }
                out.extend_from_slice(&bytes);
            }
        }
        Ok(())
    }

    fn terminator(&self) -> &[u8] {
        match self.enc {
            Encoding::Utf16Le => &[0, 0],
            _ => &[0],
        }
    }
}

/// A game-specific charset given as an explicit byte sequence <-> character table.
///
/// Fan translations commonly remap glyph codes, so the table is the only source
/// of truth. Both directions must be unique.
#[derive(Debug, Clone, Default)]
pub struct TableCharset {
    name: String,
    to_char: HashMap<Vec<u8>, char>,
    to_bytes: HashMap<char, Vec<u8>>,
    max_len: usize,
}

impl TableCharset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn insert(&mut self, bytes: Vec<u8>, ch: char) -> Result<()> {
        if bytes.is_empty() {
            return Err(CharsetError::Table {
                line: 0,
                reason: format!("empty byte sequence for {ch:?}"),
            });
        }
        if let Some(prev) = self.to_char.get(&bytes) {
            return Err(CharsetError::Table {
                line: 0,
                reason: format!("{bytes:02X?} already maps to {prev:?}"),
            });
        }
        if let Some(prev) = self.to_bytes.get(&ch) {
            return Err(CharsetError::Table {
                line: 0,
                reason: format!("{ch:?} already maps to {prev:02X?}"),
            });
        }
        self.max_len = self.max_len.max(bytes.len());
        self.to_bytes.insert(ch, bytes.clone());
        self.to_char.insert(bytes, ch);
        Ok(())
    }

    pub fn from_entries(
        name: impl Into<String>,
        entries: impl IntoIterator<Item = (Vec<u8>, char)>,
    ) -> Result<Self> {
        let mut table = Self::new(name);
        for (bytes, ch) in entries {
            table.insert(bytes, ch)?;
        }
        Ok(table)
    }

    /// Parse a `.tbl` file: one `HEX=c` mapping per line, `#` starts a comment line.
    pub fn parse_tbl(name: impl Into<String>, text: &str) -> Result<Self> {
        let mut table = Self::new(name);
        for (i, line) in text.lines().enumerate() {
            let line_no = i + 1;
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let (hex, value) = line.split_once('=').ok_or_else(|| CharsetError::Table {
                line: line_no,
                reason: "missing '='".to_string(),
            })?;
            let bytes = parse_hex(hex.trim()).ok_or_else(|| CharsetError::Table {
                line: line_no,
                reason: format!("bad hex {hex:?}"),
            })?;
            let mut chars = value.chars();
            let ch = match (chars.next(), chars.next()) {
                (Some(ch), None) => ch,
                _ => {
                    return Err(CharsetError::Table {
                        line: line_no,
                        reason: format!("expected one character, got {value:?}"),
                    })
                }
            };
            table.insert(bytes, ch).map_err(|e| match e {
                CharsetError::Table { reason, .. } => CharsetError::Table {
                    line: line_no,
                    reason,
                },
                other => other,
            })?;
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.to_char.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_char.is_empty()
    }

    pub fn chars(&self) -> impl Iterator<Item = char> + '_ {
        self.to_bytes.keys().copied()
    }
}

fn parse_hex(s: &str) -> Option<Vec<u8>> {
    if s.is_empty() || s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

impl Charset for TableCharset {
    fn name(&self) -> &str {
        &self.name
    }

    fn decode_char(&self, bytes: &[u8], offset: usize) -> Result<(char, usize)> {
        let remaining = bytes.len().saturating_sub(offset);
        // longest match first
        for n in (1..=self.max_len.min(remaining)).rev() {
            if let Some(&ch) = self.to_char.get(&bytes[offset..offset + n]) {
                return Ok((ch, n));
            }
        }
        let end = (offset + self.max_len.max(1)).min(bytes.len());
        Err(CharsetError::Decode {
            charset: self.name.clone(),
            offset,
            bytes: bytes.get(offset..end).unwrap_or_default().to_vec(),
        })
    }

    fn encode_char(&self, ch: char, out: &mut Vec<u8>) -> Result<()> {
        let bytes = self.to_bytes.get(&ch).ok_or_else(|| CharsetError::Encode {
            charset: self.name.clone(),
            ch,
        })?;
        out.extend_from_slice(bytes);
        Ok(())
    }
}
