//! Engine-level error surface.
//!
//! Producer- and consumer-facing operations return [`EngineError`]; failures
//! inside worker threads are parked in the open handle and surfaced by the
//! driver on the next call, so a broken back end never takes the process
//! down with it.

use std::io;
use thiserror::Error;

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::crypto::CryptoError;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Allocation probe hit its floor, a worker thread could not be spawned,
    /// or the worker ring was torn down underneath the driver.
    #[error("resource exhaustion: {0}")]
    Resource(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Sentinel mismatch, unknown record tag, or a malformed header field.
    #[error("format error: {0}")]
    Format(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Stream index outside `0..num_streams`.
    #[error("stream index {0} out of range")]
    BadStream(usize),
}
