//! Codec registry: wire tags, back-end dispatch, and the store-raw policy.
//!
//! # Identity rules
//! Every block carries a one-byte codec tag in its record header. Tag
//! values are frozen; a value is never reused, and readers reject unknown
//! tags outright. Tag 0 (`None`) doubles as the sentinel tag and as the
//! store-raw marker.
//!
//! # Store-raw policy
//! Compression is best-effort on the write path: a back end that fails, or
//! that cannot make the block strictly smaller, leaves the block stored
//! verbatim under tag `None`. Decoding is the opposite — any back-end
//! refusal or a decoded length that disagrees with the record header is
//! fatal, because a half-decoded stream cannot be resynchronized.
//!
//! # The fast-LZ probe
//! The slow coders can burn seconds proving a block incompressible; the
//! fast LZ back end proves it in milliseconds. Before any back end other
//! than `Lz4` runs, a bounded probe compresses a leading window of the
//! block and accepts as soon as one window beats the configured threshold,
//! doubling the window as it advances. Thresholds above 1.0 disable the
//! probe entirely.

use std::io::{self, Read, Write};

use thiserror::Error;
use tracing::{trace, warn};

use crate::config::StreamConfig;
use crate::sizer::STREAM_BUFSIZE_MIN;

// ── Wire tags ────────────────────────────────────────────────────────────────

/// On-disk codec identity. The `u8` value is the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CodecTag {
    /// Stored raw — also the tag carried by every stream sentinel.
    None   = 0,
    /// Fast LZ back end; doubles as the compressibility probe engine.
    Lz4    = 1,
    /// Dictionary coder.
    Lzma   = 2,
    /// Entropy (BWT + Huffman) coder.
    Bzip2  = 3,
    /// FSE/tANS coder.
    Zstd   = 4,
    /// Context-modelling coder.
    Brotli = 5,
}

impl CodecTag {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(CodecTag::None),
            1 => Some(CodecTag::Lz4),
            2 => Some(CodecTag::Lzma),
            3 => Some(CodecTag::Bzip2),
            4 => Some(CodecTag::Zstd),
            5 => Some(CodecTag::Brotli),
            _ => None,
        }
    }

    /// Human-readable name (for diagnostics only — never parsed).
    pub fn name(self) -> &'static str {
        match self {
            CodecTag::None   => "none",
            CodecTag::Lz4    => "lz4",
            CodecTag::Lzma   => "lzma",
            CodecTag::Bzip2  => "bzip2",
            CodecTag::Zstd   => "zstd",
            CodecTag::Brotli => "brotli",
        }
    }

    /// Parse a back-end selection string from the embedding tool.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none"   => Some(CodecTag::None),
            "lz4"    => Some(CodecTag::Lz4),
            "lzma"   => Some(CodecTag::Lzma),
            "bzip2"  => Some(CodecTag::Bzip2),
            "zstd"   => Some(CodecTag::Zstd),
            "brotli" => Some(CodecTag::Brotli),
            _        => None,
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("compression failed: {0}")]
    Compression(String),
    #[error("decompression failed: {0}")]
    Decompression(String),
    /// The decoder produced output but not the amount the record promised.
    #[error("decoded {got} bytes but the record promised {want}")]
    LengthMismatch { got: usize, want: usize },
}

// ── Write path ───────────────────────────────────────────────────────────────

/// Compress one block according to the configured back end.
///
/// Returns the tag actually stored plus the owned payload. The input buffer
/// comes back untouched under tag `None` whenever the back end is `None`,
/// the block is empty, the probe votes incompressible, the codec refuses,
/// or the candidate fails to shrink the block.
pub fn compress_block(s_buf: Vec<u8>, cfg: &StreamConfig) -> (CodecTag, Vec<u8>) {
    let backend = cfg.backend;
    if backend == CodecTag::None || s_buf.is_empty() {
        return (CodecTag::None, s_buf);
    }
    if backend != CodecTag::Lz4 && !lz4_compresses(&s_buf, cfg.threshold) {
        trace!(backend = backend.name(), len = s_buf.len(), "probe vetoed block, storing raw");
        return (CodecTag::None, s_buf);
    }
    match try_backend(backend, &s_buf, cfg.level) {
        Ok((tag, c_buf)) if c_buf.len() < s_buf.len() => {
            trace!(tag = tag.name(), u_len = s_buf.len(), c_len = c_buf.len(), "compressed block");
            (tag, c_buf)
        }
        Ok(_) => {
            trace!(backend = backend.name(), "incompressible block");
            (CodecTag::None, s_buf)
        }
        Err(e) => {
            warn!(backend = backend.name(), error = %e, "back end refused block, storing raw");
            (CodecTag::None, s_buf)
        }
    }
}

fn try_backend(backend: CodecTag, data: &[u8], level: u32) -> Result<(CodecTag, Vec<u8>), CodecError> {
    match backend {
        CodecTag::None => Ok((CodecTag::None, data.to_vec())),
        CodecTag::Lz4 => Ok((CodecTag::Lz4, lz4_compress(data))),
        CodecTag::Lzma => match lzma_compress(data) {
            Ok(buf) => Ok((CodecTag::Lzma, buf)),
            Err(e) if e.kind() == io::ErrorKind::OutOfMemory => {
                // A dictionary coder that cannot allocate its window gets
                // one retry through the entropy coder for this block only.
                warn!("dictionary coder out of memory, retrying block with the entropy coder");
                Ok((CodecTag::Bzip2, bzip2_compress(data, level)?))
            }
            Err(e) => Err(CodecError::Compression(e.to_string())),
        },
        CodecTag::Bzip2 => Ok((CodecTag::Bzip2, bzip2_compress(data, level)?)),
        CodecTag::Zstd => Ok((CodecTag::Zstd, zstd_compress(data, level)?)),
        CodecTag::Brotli => Ok((CodecTag::Brotli, brotli_compress(data, level)?)),
    }
}

// ── Read path ────────────────────────────────────────────────────────────────

/// Decode one payload back to exactly `u_len` bytes.
///
/// Tag `None` passes the payload through. Any decoder error, or output that
/// is not exactly `u_len` bytes, is fatal to the read path.
pub fn decompress_block(tag: CodecTag, payload: Vec<u8>, u_len: usize) -> Result<Vec<u8>, CodecError> {
    let out = match tag {
        CodecTag::None   => payload,
        CodecTag::Lz4    => lz4_decompress(&payload)?,
        CodecTag::Lzma   => lzma_decompress(&payload)?,
        CodecTag::Bzip2  => bzip2_decompress(&payload)?,
        CodecTag::Zstd   => zstd_decompress(&payload)?,
        CodecTag::Brotli => brotli_decompress(&payload)?,
    };
    if out.len() != u_len {
        return Err(CodecError::LengthMismatch { got: out.len(), want: u_len });
    }
    Ok(out)
}

// ── Back ends ────────────────────────────────────────────────────────────────

fn lz4_compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

fn lz4_decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    lz4_flex::decompress_size_prepended(data)
        .map_err(|e| CodecError::Decompression(e.to_string()))
}

fn lzma_compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    lzma_rs::lzma_compress(&mut io::Cursor::new(data), &mut out)?;
    Ok(out)
}

fn lzma_decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    lzma_rs::lzma_decompress(&mut io::Cursor::new(data), &mut out)
        .map_err(|e| CodecError::Decompression(e.to_string()))?;
    Ok(out)
}

fn bzip2_compress(data: &[u8], level: u32) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    let mut enc = bzip2::read::BzEncoder::new(data, bzip2::Compression::new(level.clamp(1, 9)));
    enc.read_to_end(&mut out)
        .map_err(|e| CodecError::Compression(e.to_string()))?;
    Ok(out)
}

fn bzip2_decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    bzip2::read::BzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Decompression(e.to_string()))?;
    Ok(out)
}

fn zstd_compress(data: &[u8], level: u32) -> Result<Vec<u8>, CodecError> {
    zstd::encode_all(data, level as i32).map_err(|e| CodecError::Compression(e.to_string()))
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    zstd::decode_all(data).map_err(|e| CodecError::Decompression(e.to_string()))
}

fn brotli_compress(data: &[u8], level: u32) -> Result<Vec<u8>, CodecError> {
    let quality = level.clamp(0, 11);
    let mut out = Vec::new();
    {
        let mut w = brotli::CompressorWriter::new(&mut out, 4096, quality, 22);
        w.write_all(data)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
    }
    Ok(out)
}

fn brotli_decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    brotli::Decompressor::new(data, 4096)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Decompression(e.to_string()))?;
    Ok(out)
}

// ── Probe ────────────────────────────────────────────────────────────────────

/// Quick incompressibility test with the fast LZ back end.
///
/// Compresses a leading window of the block and succeeds on the first
/// window whose compressed size beats `threshold` × its input size; on a
/// miss it advances past the window, doubling the window size up to the
/// minimum stream buffer, until the block is exhausted.
pub(crate) fn lz4_compresses(data: &[u8], threshold: f64) -> bool {
    if threshold > 1.0 {
        return true;
    }
    let large = STREAM_BUFSIZE_MIN as usize;
    let mut window = if data.len() > 5 * large {
        large
    } else {
        (large / 4096).max(4096)
    };

    let mut offset = 0usize;
    let mut passes = 0u32;
    while offset < data.len() {
        let in_len = window.min(data.len() - offset);
        let c_len = lz4_flex::compress(&data[offset..offset + in_len]).len();
        passes += 1;
        if (c_len as f64) < in_len as f64 * threshold {
            trace!(passes, in_len, c_len, "probe found compressible window");
            return true;
        }
        offset += in_len;
        if window < large {
            window <<= 1;
        }
    }
    trace!(passes, len = data.len(), "probe found no compressible window");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, RngCore, SeedableRng};

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        StdRng::seed_from_u64(0x6d75_7870).fill_bytes(&mut buf);
        buf
    }

    fn cfg(backend: CodecTag) -> StreamConfig {
        StreamConfig { backend, threshold: 0.95, ..StreamConfig::default() }
    }

    #[test]
    fn probe_accepts_uniform_data() {
        assert!(lz4_compresses(&vec![b'x'; 64 * 1024], 0.95));
    }

    #[test]
    fn probe_rejects_random_data() {
        assert!(!lz4_compresses(&random_bytes(128 * 1024), 0.95));
    }

    #[test]
    fn probe_skipped_above_unity() {
        assert!(lz4_compresses(&random_bytes(16 * 1024), 1.5));
    }

    #[test]
    fn random_data_stores_raw() {
        let data = random_bytes(256 * 1024);
        let (tag, out) = compress_block(data.clone(), &cfg(CodecTag::Zstd));
        assert_eq!(tag, CodecTag::None);
        assert_eq!(out, data);
    }

    #[test]
    fn empty_block_stores_raw() {
        let (tag, out) = compress_block(Vec::new(), &cfg(CodecTag::Lzma));
        assert_eq!(tag, CodecTag::None);
        assert!(out.is_empty());
    }

    #[test]
    fn compressible_block_shrinks() {
        let data = b"the quick brown fox jumps over the lazy dog ".repeat(4096);
        for backend in [CodecTag::Lz4, CodecTag::Zstd, CodecTag::Bzip2] {
            let (tag, c_buf) = compress_block(data.clone(), &cfg(backend));
            assert_eq!(tag, backend);
            assert!(c_buf.len() < data.len());
            let back = decompress_block(tag, c_buf, data.len()).unwrap();
            assert_eq!(back, data);
        }
    }

    #[test]
    fn length_mismatch_is_fatal() {
        let err = decompress_block(CodecTag::None, vec![0u8; 10], 5).unwrap_err();
        assert!(matches!(err, CodecError::LengthMismatch { got: 10, want: 5 }));
    }

    #[test]
    fn unknown_tag_values_rejected() {
        assert_eq!(CodecTag::from_u8(6), None);
        assert_eq!(CodecTag::from_u8(2), Some(CodecTag::Lzma));
        assert_eq!(CodecTag::from_name("BZIP2"), Some(CodecTag::Bzip2));
        assert_eq!(CodecTag::from_name("snappy"), None);
    }
}
