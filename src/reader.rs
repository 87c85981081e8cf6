//! Reader engine: chain walking, prefetch, and in-order delivery.
//!
//! The driver thread owns the descriptor. For each stream it walks the
//! record chain from the stream head, reading headers and payloads
//! sequentially and handing each payload to a short-lived decode thread;
//! the thread's capacity-1 result channel is queued per stream, so popping
//! the queue front and blocking on it delivers decoded buffers in exactly
//! chain order while up to `workers` blocks decode in parallel. The
//! channel transfers buffer ownership back to the driver, which is the
//! whole hand-off protocol — a decode thread that has sent its result is
//! done.
//!
//! Prefetch depth per stream equals the configured worker count; the
//! driver tops the queue up before every delivery, so decode work overlaps
//! the caller's consumption.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver};
use tracing::{debug, trace};

use crate::codec::{decompress_block, CodecTag};
use crate::config::{ConfigError, StreamConfig};
use crate::crypto::BlockCipher;
use crate::error::EngineError;
use crate::fileio::{read_big, seek_to};
use crate::record::RecordHeader;
use crate::writer::set_nice;

type DecodeResult = Result<Vec<u8>, EngineError>;

#[derive(Debug)]
struct InStream {
    /// Currently consumed buffer and its read cursor.
    buf:       Vec<u8>,
    bufp:      usize,
    /// Offset of the next record header to fetch; 0 once the chain ended.
    last_head: u64,
    eos:       bool,
    /// The stream's slice of the worker ring, in chain order.
    pending:   VecDeque<Receiver<DecodeResult>>,
}

/// Multiplexed decompressing reader over one file descriptor.
///
/// Opened at the descriptor's current offset. The reader never modifies
/// the file; the descriptor must not be shared while the reader is open.
#[derive(Debug)]
pub struct StreamReader {
    file:        File,
    cfg:         StreamConfig,
    cipher:      Option<Arc<BlockCipher>>,
    initial_pos: u64,
    total_read:  u64,
    streams:     Vec<InStream>,
}

impl StreamReader {
    /// Open `streams` input streams at the file's current offset and
    /// validate each stream head.
    pub fn open(mut file: File, streams: usize, cfg: StreamConfig) -> Result<Self, EngineError> {
        cfg.validate()?;
        if streams == 0 {
            return Err(ConfigError::NoStreams.into());
        }

        let mut initial_pos = file.stream_position()?;
        let header_len = cfg.format.header_len();
        let mut slots = Vec::with_capacity(streams);

        let mut heads = Vec::with_capacity(streams);
        for _ in 0..streams {
            heads.push(RecordHeader::read_from(&mut file, cfg.format)?);
        }

        // Close workaround: some writers left one stray zeroed header ahead
        // of the real stream heads. An all-zero first header is ambiguous —
        // it is also what a legitimately empty stream 0 looks like — so peek
        // one header further: only a stray produces a sentinel there.
        if heads[0].is_zero() {
            match RecordHeader::read_from(&mut file, cfg.format) {
                Ok(peek) if peek.is_sentinel() => {
                    debug!("enabling stream close workaround");
                    initial_pos += header_len;
                    heads.remove(0);
                    heads.push(peek);
                }
                _ => {
                    // Genuine empty stream 0 (or end of file right after the
                    // heads). Put the cursor back after the real sentinels.
                    file.seek(SeekFrom::Start(initial_pos + streams as u64 * header_len))?;
                }
            }
        }

        let mut total_read = 0u64;
        for (i, hdr) in heads.iter().enumerate() {
            if !hdr.is_sentinel() {
                return Err(EngineError::Format(format!(
                    "stream {i} head is not a sentinel (tag {}, c_len {}, u_len {})",
                    hdr.tag as u8, hdr.c_len, hdr.u_len
                )));
            }
            total_read += header_len;
            slots.push(InStream {
                buf:       Vec::new(),
                bufp:      0,
                last_head: hdr.next,
                // A head that was never patched means the stream has no
                // records at all.
                eos:       hdr.next == 0,
                pending:   VecDeque::with_capacity(cfg.workers),
            });
        }

        debug!(streams, workers = cfg.workers, "opened input streams");
        let cipher = cfg.key.as_ref().map(|k| Arc::new(BlockCipher::new(k)));
        Ok(Self { file, cfg, cipher, initial_pos, total_read, streams: slots })
    }

    /// Copy up to `dst.len()` bytes from one stream.
    ///
    /// Returns the bytes copied; a short count means end of stream.
    pub fn read(&mut self, stream: usize, dst: &mut [u8]) -> Result<usize, EngineError> {
        if stream >= self.streams.len() {
            return Err(EngineError::BadStream(stream));
        }
        let mut copied = 0usize;
        while copied < dst.len() {
            let s = &mut self.streams[stream];
            let avail = s.buf.len() - s.bufp;
            if avail > 0 {
                let n = avail.min(dst.len() - copied);
                dst[copied..copied + n].copy_from_slice(&s.buf[s.bufp..s.bufp + n]);
                s.bufp += n;
                copied += n;
                continue;
            }
            if s.eos && s.pending.is_empty() {
                break;
            }
            self.fill_buffer(stream)?;
            if self.streams[stream].buf.is_empty() {
                break;
            }
        }
        Ok(copied)
    }

    /// True once every record of `stream` has been delivered.
    pub fn at_eos(&self, stream: usize) -> bool {
        self.streams.get(stream).map_or(true, |s| {
            s.eos && s.pending.is_empty() && s.bufp == s.buf.len()
        })
    }

    /// Archive payload bytes read from disk so far, headers included.
    pub fn total_read(&self) -> u64 {
        self.total_read
    }

    /// Let outstanding decode workers finish, then park the descriptor at
    /// the end of consumed input.
    ///
    /// `total_read` counts every record fetched from disk, including
    /// blocks prefetched but never delivered, so the final position is an
    /// upper bound on the bytes actually served to the caller.
    pub fn close(mut self) -> Result<(), EngineError> {
        for s in &mut self.streams {
            while let Some(rx) = s.pending.pop_front() {
                let _ = rx.recv();
            }
        }
        self.file.seek(SeekFrom::Start(self.initial_pos + self.total_read))?;
        debug!(total_read = self.total_read, "closed input streams");
        Ok(())
    }

    /// Refill one stream's consumption buffer, keeping the prefetch queue
    /// as deep as the ring allows before waiting on the next block.
    fn fill_buffer(&mut self, stream: usize) -> Result<(), EngineError> {
        {
            let s = &mut self.streams[stream];
            s.buf = Vec::new();
            s.bufp = 0;
        }

        while !self.streams[stream].eos
            && self.streams[stream].pending.len() < self.cfg.workers
        {
            self.prefetch_one(stream)?;
        }

        let Some(rx) = self.streams[stream].pending.pop_front() else {
            return Ok(()); // stream fully drained
        };
        let buf = rx
            .recv()
            .map_err(|_| EngineError::Resource("decode worker disappeared".into()))??;
        let s = &mut self.streams[stream];
        s.buf = buf;
        s.bufp = 0;
        Ok(())
    }

    /// Read one record for `stream` and hand its payload to a decode
    /// thread.
    fn prefetch_one(&mut self, stream: usize) -> Result<(), EngineError> {
        let last_head = self.streams[stream].last_head;
        seek_to(&self.file, self.initial_pos, last_head)?;
        let hdr = RecordHeader::read_from(&mut &self.file, self.cfg.format)?;
        self.total_read += self.cfg.format.header_len();

        let c_len = usize::try_from(hdr.c_len)
            .map_err(|_| EngineError::Format(format!("record c_len {} exceeds the address space", hdr.c_len)))?;
        let u_len = usize::try_from(hdr.u_len)
            .map_err(|_| EngineError::Format(format!("record u_len {} exceeds the address space", hdr.u_len)))?;

        let mut payload = vec![0u8; c_len];
        read_big(&self.file, &mut payload)?;
        self.total_read += hdr.c_len;

        {
            let s = &mut self.streams[stream];
            s.last_head = hdr.next;
            if hdr.next == 0 {
                s.eos = true;
            }
        }

        trace!(stream, tag = hdr.tag.name(), c_len, u_len, "prefetching record");

        let (tx, rx) = bounded(1);
        let cipher = self.cipher.clone();
        let nice = self.cfg.nice;
        let tag = hdr.tag;
        thread::Builder::new()
            .name(format!("unpack-s{stream}"))
            .spawn(move || {
                set_nice(nice);
                let _ = tx.send(decode_payload(tag, payload, u_len, cipher.as_deref()));
            })
            .map_err(|e| EngineError::Resource(format!("spawning decode worker: {e}")))?;
        self.streams[stream].pending.push_back(rx);
        Ok(())
    }
}

fn decode_payload(
    tag: CodecTag,
    payload: Vec<u8>,
    u_len: usize,
    cipher: Option<&BlockCipher>,
) -> DecodeResult {
    let payload = match cipher {
        Some(cipher) => cipher.open(&payload)?,
        None => payload,
    };
    Ok(decompress_block(tag, payload, u_len)?)
}
