//! Writer engine: per-stream buffering, worker dispatch, and the write
//! turn.
//!
//! # Concurrency scheme
//! Compression is embarrassingly parallel; the file is not. Each flushed
//! block goes to its own worker thread, and file mutation is serialized by
//! a *write turn* — a cursor owning the append position and every stream's
//! tail pointer — that travels worker-to-worker in submission order
//! through a chain of capacity-1 channels. A worker compresses first, then
//! receives the cursor from its predecessor, patches its stream's tail
//! link, appends its record, and forwards the cursor. In-flight workers
//! are bounded by a pre-filled slot channel of ring size; a flush blocks
//! on a free slot exactly when the ring is full.
//!
//! Because the cursor is owned by exactly one worker at any instant, the
//! append position and the tail pointers need no locks, and per-stream
//! record order is submission order by construction.
//!
//! # Failure
//! A worker that fails parks its error in the shared handle and forwards a
//! poisoned cursor; successors skip their writes (the chain must not grow
//! past a hole) and the driver reports the error from the next `write` or
//! from `close`.

use std::fs::File;
use std::io::Seek;
use std::mem;
use std::sync::{Arc, Mutex};
use std::thread;

use byteorder::{LittleEndian, WriteBytesExt};
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, trace};

use crate::codec::{compress_block, CodecTag};
use crate::config::{ConfigError, StreamConfig};
use crate::crypto::BlockCipher;
use crate::error::EngineError;
use crate::fileio::{seek_to, write_big};
use crate::record::{RecordHeader, HEADER_LEN, NEXT_FIELD_OFFSET};
use crate::sizer::probe_block_size;

// ── Write turn ───────────────────────────────────────────────────────────────

/// State owned by whichever worker currently holds the write turn.
struct Cursor {
    /// Next record's offset, relative to `initial_pos`. The only authority
    /// for where a record lands.
    cur_pos:    u64,
    /// Per stream: offset of the `next` field in its newest record.
    last_heads: Vec<u64>,
}

enum Token {
    Live(Cursor),
    /// A predecessor failed; the record chains must not grow past it.
    Poisoned,
}

// ── Shared handle ────────────────────────────────────────────────────────────

struct Shared {
    file:        File,
    initial_pos: u64,
    cfg:         StreamConfig,
    cipher:      Option<BlockCipher>,
    /// First worker error, reported once by the driver.
    error:       Mutex<Option<EngineError>>,
}

impl Shared {
    fn set_error(&self, e: EngineError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(e);
        }
    }

    fn take_error(&self) -> Option<EngineError> {
        self.error.lock().unwrap().take()
    }
}

struct OutStream {
    buf:    Vec<u8>,
    /// Blocks flushed so far, for diagnostics.
    blocks: u64,
}

// ── Public handle ────────────────────────────────────────────────────────────

/// Multiplexed compressing writer over one file descriptor.
///
/// Opened at the descriptor's current offset; the engine seeks freely from
/// there, so the descriptor must not be shared while the writer is open.
/// All state lives in this value — any number of archives may be open
/// concurrently.
///
/// Dropping a writer without [`close`] leaves in-flight workers to finish
/// detached and loses any error they hit; partial stream buffers are
/// discarded. Always close.
///
/// [`close`]: StreamWriter::close
pub struct StreamWriter {
    shared:   Arc<Shared>,
    streams:  Vec<OutStream>,
    bufsize:  usize,
    /// Tail of the token chain — yields the cursor after the newest
    /// worker's turn.
    token_rx: Receiver<Token>,
    slot_rx:  Receiver<()>,
    slot_tx:  Sender<()>,
}

impl StreamWriter {
    /// Open `streams` output streams at the file's current offset.
    ///
    /// Negotiates the block size below `limit` (see [`probe_block_size`]),
    /// writes one sentinel record per stream, and arms the worker ring.
    pub fn open(
        mut file: File,
        streams: usize,
        limit: u64,
        cfg: StreamConfig,
    ) -> Result<Self, EngineError> {
        cfg.validate()?;
        if streams == 0 {
            return Err(ConfigError::NoStreams.into());
        }

        let bufsize = probe_block_size(limit, streams, cfg.workers, cfg.backend)?;
        let bufsize = usize::try_from(bufsize)
            .map_err(|_| EngineError::Resource(format!("block size {bufsize} exceeds the address space")))?;
        let initial_pos = file.stream_position()?;

        // Stream heads. Each sentinel's `next` field is patched later by
        // its stream's first record.
        let mut cur_pos = 0u64;
        let mut last_heads = Vec::with_capacity(streams);
        for _ in 0..streams {
            last_heads.push(cur_pos + NEXT_FIELD_OFFSET);
            RecordHeader::sentinel().write_to(&mut file)?;
            cur_pos += HEADER_LEN;
        }

        debug!(streams, workers = cfg.workers, bufsize, "opened output streams");

        // Pre-filled slot channel: one token per ring slot, so recv() is
        // "wait for a free worker".
        let (slot_tx, slot_rx) = bounded(cfg.workers);
        for _ in 0..cfg.workers {
            let _ = slot_tx.send(());
        }

        // Seed the token chain so the first worker's turn starts at once.
        let (seed_tx, token_rx) = bounded(1);
        let _ = seed_tx.send(Token::Live(Cursor { cur_pos, last_heads }));

        let cipher = cfg.key.as_ref().map(BlockCipher::new);
        let shared = Arc::new(Shared {
            file,
            initial_pos,
            cfg,
            cipher,
            error: Mutex::new(None),
        });
        let streams = (0..streams)
            .map(|_| OutStream { buf: Vec::with_capacity(bufsize), blocks: 0 })
            .collect();

        Ok(Self { shared, streams, bufsize, token_rx, slot_rx, slot_tx })
    }

    /// Append bytes to one stream, flushing a block to the worker ring
    /// every time the stream buffer fills. Blocks while the ring is full.
    pub fn write(&mut self, stream: usize, mut data: &[u8]) -> Result<(), EngineError> {
        if stream >= self.streams.len() {
            return Err(EngineError::BadStream(stream));
        }
        self.check_error()?;
        while !data.is_empty() {
            let room = self.bufsize - self.streams[stream].buf.len();
            let n = room.min(data.len());
            self.streams[stream].buf.extend_from_slice(&data[..n]);
            data = &data[n..];
            if self.streams[stream].buf.len() == self.bufsize {
                self.flush_stream(stream)?;
            }
        }
        Ok(())
    }

    /// Flush any partial buffers, wait for every worker, and surface any
    /// deferred worker failure.
    pub fn close(mut self) -> Result<(), EngineError> {
        for stream in 0..self.streams.len() {
            if !self.streams[stream].buf.is_empty() {
                self.flush_stream(stream)?;
            }
        }

        // The cursor comes home only after the newest worker's turn.
        let token = self
            .token_rx
            .recv()
            .map_err(|_| EngineError::Resource("worker ring disconnected".into()))?;

        // Reclaim every ring slot; a slot returns only when its worker has
        // fully finished.
        for _ in 0..self.shared.cfg.workers {
            self.slot_rx
                .recv()
                .map_err(|_| EngineError::Resource("worker ring disconnected".into()))?;
        }

        if let Some(e) = self.shared.take_error() {
            return Err(e);
        }
        match token {
            Token::Live(cursor) => {
                debug!(bytes = cursor.cur_pos, "closed output streams");
                Ok(())
            }
            Token::Poisoned => Err(EngineError::Format(
                "a worker failed earlier; the error was already reported".into(),
            )),
        }
    }

    fn check_error(&self) -> Result<(), EngineError> {
        match self.shared.take_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Hand the stream's full buffer to a worker and give the producer a
    /// fresh one.
    fn flush_stream(&mut self, stream: usize) -> Result<(), EngineError> {
        // Every in-flight worker holds one slot token.
        self.slot_rx
            .recv()
            .map_err(|_| EngineError::Resource("worker ring disconnected".into()))?;

        let s_buf = mem::replace(&mut self.streams[stream].buf, Vec::with_capacity(self.bufsize));
        self.streams[stream].blocks += 1;
        trace!(stream, len = s_buf.len(), block = self.streams[stream].blocks, "dispatching block");

        // Splice a fresh link into the token chain: this worker takes the
        // cursor from its predecessor and forwards it to whoever is
        // spawned next, or back to close().
        let (token_tx, next_rx) = bounded(1);
        let token_rx = mem::replace(&mut self.token_rx, next_rx);

        let shared = Arc::clone(&self.shared);
        let slot_tx = self.slot_tx.clone();
        thread::Builder::new()
            .name(format!("pack-s{stream}"))
            .spawn(move || compress_worker(shared, stream, s_buf, token_rx, token_tx, slot_tx))
            .map_err(|e| {
                // Give the slot back or close() would wait for it forever.
                let _ = self.slot_tx.send(());
                EngineError::Resource(format!("spawning compression worker: {e}"))
            })?;
        Ok(())
    }
}

// ── Worker body ──────────────────────────────────────────────────────────────

fn compress_worker(
    shared: Arc<Shared>,
    stream: usize,
    s_buf: Vec<u8>,
    token_rx: Receiver<Token>,
    token_tx: Sender<Token>,
    slot_tx: Sender<()>,
) {
    set_nice(shared.cfg.nice);

    let u_len = s_buf.len() as u64;
    let (tag, payload) = compress_block(s_buf, &shared.cfg);

    let sealed = match &shared.cipher {
        Some(cipher) => cipher.seal(&payload).map_err(EngineError::from),
        None => Ok(payload),
    };

    // Take the write turn from the predecessor.
    let token = token_rx.recv().unwrap_or(Token::Poisoned);
    let token = match (token, sealed) {
        (Token::Live(mut cursor), Ok(payload)) => {
            match append_record(&shared, stream, &mut cursor, tag, u_len, &payload) {
                Ok(()) => Token::Live(cursor),
                Err(e) => {
                    shared.set_error(e);
                    Token::Poisoned
                }
            }
        }
        (Token::Live(_), Err(e)) => {
            shared.set_error(e);
            Token::Poisoned
        }
        (Token::Poisoned, _) => Token::Poisoned,
    };
    let _ = token_tx.send(token);
    let _ = slot_tx.send(());
}

/// Link and append one record. Runs entirely inside the write turn.
fn append_record(
    shared: &Shared,
    stream: usize,
    cursor: &mut Cursor,
    tag: CodecTag,
    u_len: u64,
    payload: &[u8],
) -> Result<(), EngineError> {
    let f = &shared.file;

    // Patch the predecessor's `next` field with this record's offset.
    seek_to(f, shared.initial_pos, cursor.last_heads[stream])?;
    {
        let mut w = f;
        w.write_i64::<LittleEndian>(cursor.cur_pos as i64)?;
    }
    cursor.last_heads[stream] = cursor.cur_pos + NEXT_FIELD_OFFSET;

    // Fresh record, terminating its chain until a successor patches it.
    seek_to(f, shared.initial_pos, cursor.cur_pos)?;
    let header = RecordHeader { tag, c_len: payload.len() as u64, u_len, next: 0 };
    {
        let mut w = f;
        header.write_to(&mut w)?;
    }
    cursor.cur_pos += HEADER_LEN;
    write_big(f, payload)?;
    cursor.cur_pos += payload.len() as u64;

    // Durability point: the record is on disk before the turn moves on.
    f.sync_data()?;

    trace!(stream, tag = tag.name(), c_len = payload.len(), u_len, "appended record");
    Ok(())
}

// ── Worker niceness ──────────────────────────────────────────────────────────

#[cfg(unix)]
pub(crate) fn set_nice(nice: i32) {
    if nice == 0 {
        return;
    }
    // On Linux this applies to the calling thread.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
    if rc == -1 {
        tracing::warn!(nice, "unable to set worker niceness");
    }
}

#[cfg(not(unix))]
pub(crate) fn set_nice(_nice: i32) {}
