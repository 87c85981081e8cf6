//! Record framing — the on-disk unit of the multiplexed stream format.
//!
//! # On-disk layout (25 bytes, all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      1   tag     codec tag; 0 = stored raw (also the sentinel tag)
//!    1      8   c_len   payload bytes as stored, post encryption   (LE i64)
//!    9      8   u_len   payload bytes once decoded                 (LE i64)
//!   17      8   next    absolute payload offset of the stream's next
//!                       record header, or 0 for the last record    (LE i64)
//!   25      —   payload  c_len bytes
//! ```
//!
//! Each of the N streams opens with a sentinel record (`tag = 0`, all
//! lengths 0); real records are appended in worker completion order, and a
//! record's `next` field is written as 0 and patched exactly once when its
//! successor is placed. Offset 0 always lands inside the sentinel region,
//! so `next = 0` is unambiguous as a chain terminator.
//!
//! # Legacy layout (13 bytes, read-only)
//!
//! Archives from older writers carry `u32` fields instead of `i64`:
//! `[ tag u8 | c_len u32 | u_len u32 | next u32 ]`. The variant is selected
//! by the container version the embedding tool hands us; this writer only
//! ever emits the current layout.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::codec::CodecTag;
use crate::error::EngineError;

/// Byte size of a current-format record header.
pub const HEADER_LEN: u64 = 25;
/// Byte size of a legacy record header.
pub const HEADER_LEN_LEGACY: u64 = 13;
/// Byte offset of the `next` field within a current-format header. A
/// stream's `last_head` always points at this field of its newest record.
pub const NEXT_FIELD_OFFSET: u64 = 17;

/// Which header layout the reader parses. Supplied by the embedding tool
/// from the container version; the writer always emits [`Current`].
///
/// [`Current`]: FormatVersion::Current
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    Current,
    Legacy,
}

impl FormatVersion {
    #[inline]
    pub fn header_len(self) -> u64 {
        match self {
            FormatVersion::Current => HEADER_LEN,
            FormatVersion::Legacy => HEADER_LEN_LEGACY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub tag:   CodecTag,
    pub c_len: u64,
    pub u_len: u64,
    pub next:  u64,
}

impl RecordHeader {
    /// Stream head written at open time; its `next` field is patched by the
    /// stream's first real record.
    pub fn sentinel() -> Self {
        Self { tag: CodecTag::None, c_len: 0, u_len: 0, next: 0 }
    }

    /// Sentinel shape check — `next` may legitimately point at the stream's
    /// first record by the time a reader sees it.
    #[inline]
    pub fn is_sentinel(&self) -> bool {
        self.tag == CodecTag::None && self.c_len == 0 && self.u_len == 0
    }

    /// Entirely-zero header, the signature of the stream-close workaround.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.is_sentinel() && self.next == 0
    }

    /// Emit the current 25-byte layout.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(self.tag as u8)?;
        w.write_i64::<LittleEndian>(self.c_len as i64)?;
        w.write_i64::<LittleEndian>(self.u_len as i64)?;
        w.write_i64::<LittleEndian>(self.next as i64)?;
        Ok(())
    }

    /// Parse one header in the given layout.
    ///
    /// An unknown tag or a negative length/link is a format error; the
    /// caller must not attempt a payload read after a failure here.
    pub fn read_from<R: Read>(r: &mut R, version: FormatVersion) -> Result<Self, EngineError> {
        let tag_raw = r.read_u8()?;
        let (c_len, u_len, next) = match version {
            FormatVersion::Current => {
                let c = r.read_i64::<LittleEndian>()?;
                let u = r.read_i64::<LittleEndian>()?;
                let n = r.read_i64::<LittleEndian>()?;
                if c < 0 || u < 0 || n < 0 {
                    return Err(EngineError::Format(format!(
                        "negative header field (c_len {c}, u_len {u}, next {n})"
                    )));
                }
                (c as u64, u as u64, n as u64)
            }
            FormatVersion::Legacy => {
                let c = r.read_u32::<LittleEndian>()?;
                let u = r.read_u32::<LittleEndian>()?;
                let n = r.read_u32::<LittleEndian>()?;
                (u64::from(c), u64::from(u), u64::from(n))
            }
        };
        let tag = CodecTag::from_u8(tag_raw)
            .ok_or_else(|| EngineError::Format(format!("unknown record tag {tag_raw}")))?;
        Ok(Self { tag, c_len, u_len, next })
    }
}
