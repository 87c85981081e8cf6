//! Engine configuration, supplied once per open archive by the embedding
//! tool. The engine itself reads no environment and persists nothing
//! beyond the archive payload.

use thiserror::Error;

use crate::codec::CodecTag;
use crate::crypto::KeyMaterial;
use crate::record::FormatVersion;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("compression level {0} outside 1..=9")]
    BadLevel(u32),
    #[error("worker count must be at least 1")]
    NoWorkers,
    #[error("incompressibility threshold {0} must be positive")]
    BadThreshold(f64),
    #[error("stream count must be at least 1")]
    NoStreams,
}

/// Configuration record for one open archive.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Back end applied to every block; `CodecTag::None` stores everything
    /// raw.
    pub backend:   CodecTag,
    /// Compression level, 1 (fast) to 9 (dense). Back ends scale it into
    /// their own ranges.
    pub level:     u32,
    /// Worker ring size, for both compression and prefetch.
    pub workers:   usize,
    /// LZ-probe acceptance ratio: a window compressing below
    /// `threshold × window` marks the block compressible. Values above 1.0
    /// disable the probe.
    pub threshold: f64,
    /// Niceness applied to worker threads (Unix only; best effort).
    pub nice:      i32,
    /// Header layout the reader parses. The writer always emits the
    /// current layout.
    pub format:    FormatVersion,
    /// Block key material; enables per-block authenticated encryption.
    pub key:       Option<KeyMaterial>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            backend:   CodecTag::Zstd,
            level:     3,
            workers:   num_cpus::get().max(1),
            threshold: 1.0,
            nice:      0,
            format:    FormatVersion::Current,
            key:       None,
        }
    }
}

impl StreamConfig {
    /// Reject impossible parameter combinations before any I/O happens.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=9).contains(&self.level) {
            return Err(ConfigError::BadLevel(self.level));
        }
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if !(self.threshold > 0.0) {
            return Err(ConfigError::BadThreshold(self.threshold));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        StreamConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_parameters_are_rejected() {
        let base = StreamConfig::default();
        assert!(StreamConfig { level: 0, ..base.clone() }.validate().is_err());
        assert!(StreamConfig { level: 10, ..base.clone() }.validate().is_err());
        assert!(StreamConfig { workers: 0, ..base.clone() }.validate().is_err());
        assert!(StreamConfig { threshold: 0.0, ..base.clone() }.validate().is_err());
        assert!(StreamConfig { threshold: -0.5, ..base }.validate().is_err());
    }
}
