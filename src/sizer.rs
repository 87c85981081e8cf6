//! Block-size negotiation at open time.
//!
//! Before committing to a block size, the writer probes whether the whole
//! working set — every stream's buffer plus one codec working set — can
//! actually be reserved, shrinking the candidate limit until it can. The
//! probe uses `Vec::try_reserve_exact`, the only way to observe allocator
//! headroom without aborting (infallible `Vec` growth calls
//! `handle_alloc_error` on failure).

use tracing::debug;

use crate::codec::CodecTag;
use crate::error::EngineError;

/// Smallest block the writer will cut.
pub const STREAM_BUFSIZE_MIN: u64 = 256 * 1024;

const TWO_GIB: u64 = 2 * 1024 * 1024 * 1024;
/// Largest dictionary-coder block on 32-bit hosts.
const LZMA_MAX_BLOCK_32: u64 = 300 * 1024 * 1024;

/// Find the largest feasible block size at or below `limit`.
///
/// Returns the negotiated size; fails only when even the smallest working
/// set cannot be reserved.
pub fn probe_block_size(
    limit: u64,
    streams: usize,
    workers: usize,
    backend: CodecTag,
) -> Result<u64, EngineError> {
    let mut limit = limit.max(1);
    if cfg!(target_pointer_width = "32") {
        limit = limit.min(TWO_GIB / 6);
    }

    loop {
        // Working set: one buffer per stream plus codec headroom. 32-bit
        // address spaces get a harsher multiplier.
        let want = if cfg!(target_pointer_width = "32") {
            limit.saturating_mul(3).saturating_mul(streams as u64)
        } else {
            limit.saturating_mul(streams as u64 + 1)
        };
        if try_reserve(want) {
            debug!(bytes = want, limit, "working-set probe succeeded");
            break;
        }
        let next = limit / 10 * 9;
        if next == 0 {
            return Err(EngineError::Resource(format!(
                "cannot reserve even {want} bytes for {streams} stream buffers"
            )));
        }
        limit = next;
    }

    // Round the limit down so that a full ring of in-flight blocks fits,
    // but never below the floor.
    let per_worker = limit.div_ceil(workers as u64);
    let mut bufsize = STREAM_BUFSIZE_MIN.max(limit.min(per_worker));
    if cfg!(target_pointer_width = "32") && backend == CodecTag::Lzma {
        bufsize = bufsize.min(LZMA_MAX_BLOCK_32);
    }
    Ok(bufsize)
}

fn try_reserve(bytes: u64) -> bool {
    let Ok(bytes) = usize::try_from(bytes) else { return false };
    if bytes > isize::MAX as usize {
        return false;
    }
    let mut probe: Vec<u8> = Vec::new();
    probe.try_reserve_exact(bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_limits_floor_at_minimum() {
        let size = probe_block_size(1, 1, 1, CodecTag::Lz4).unwrap();
        assert_eq!(size, STREAM_BUFSIZE_MIN);
    }

    #[test]
    fn limit_divides_across_workers() {
        let size = probe_block_size(8 << 20, 2, 4, CodecTag::Zstd).unwrap();
        assert_eq!(size, 2 << 20);
    }

    #[test]
    fn single_worker_keeps_the_limit() {
        let size = probe_block_size(4 << 20, 1, 1, CodecTag::Zstd).unwrap();
        assert_eq!(size, 4 << 20);
    }
}
