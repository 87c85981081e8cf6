//! # muxpack — multiplexed parallel-compression stream engine
//!
//! N logical byte streams multiplex into one archive file: the writer cuts
//! each stream into bounded blocks, compresses the blocks on a ring of
//! worker threads, and appends them in completion order as per-stream
//! chains of linked records; the reader walks each chain, decoding blocks
//! ahead of the consumer, and hands back a linear byte view per stream.
//!
//! Engine guarantees:
//! - per-stream record order, on disk and on delivery, is exactly the
//!   order the producer supplied — a rotating write turn keeps the append
//!   position and the chain links race-free while compression runs in
//!   parallel
//! - every block falls back to raw storage when its back end cannot
//!   shrink it; random data costs only header overhead
//! - all header fields are little-endian; the legacy 13-byte header is
//!   read, never written
//! - each record reaches the descriptor (`fdatasync`) before the write
//!   turn moves on
//! - with key material configured, every block is independently
//!   AES-256-GCM sealed after compression; corruption fails at the block
//!
//! The engine owns nothing global: every handle carries its own ring, so
//! any number of archives can be open at once.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fileio;
pub mod reader;
pub mod record;
pub mod sizer;
pub mod writer;

// Flat re-exports for the most common types.
pub use codec::{CodecError, CodecTag};
pub use config::{ConfigError, StreamConfig};
pub use crypto::{derive_key, BlockCipher, CryptoError, KeyMaterial};
pub use error::EngineError;
pub use reader::StreamReader;
pub use record::{FormatVersion, RecordHeader, HEADER_LEN, HEADER_LEN_LEGACY, NEXT_FIELD_OFFSET};
pub use sizer::STREAM_BUFSIZE_MIN;
pub use writer::StreamWriter;
