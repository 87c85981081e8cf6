//! Length-safe file I/O.
//!
//! Every disk transfer is performed in chunks of at most 1 GiB to sidestep
//! 32-bit size-argument defects on historical hosts, and short returns are
//! retried until the full length is moved or the OS reports a real error.
//! There is no silent truncation: a transfer that cannot complete is an
//! `io::Error` naming the byte counts involved.
//!
//! All helpers take `&File` so that worker threads sharing one descriptor
//! through an `Arc` can drive it; callers serialize access themselves (the
//! writer's rotating write turn, the reader's single driver thread).

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Upper bound on a single read/write syscall.
pub const MAX_IO_CHUNK: usize = 1 << 30;

/// Write all of `buf`, chunked and retried.
pub fn write_big(mut f: &File, buf: &[u8]) -> io::Result<()> {
    let mut done = 0usize;
    while done < buf.len() {
        let want = (buf.len() - done).min(MAX_IO_CHUNK);
        match f.write(&buf[done..done + want]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("partial write: asked for {} bytes but wrote {done}", buf.len()),
                ))
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Fill all of `buf`, chunked and retried.
pub fn read_big(mut f: &File, buf: &mut [u8]) -> io::Result<()> {
    let total = buf.len();
    let mut done = 0usize;
    while done < total {
        let want = (total - done).min(MAX_IO_CHUNK);
        match f.read(&mut buf[done..done + want]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("partial read: asked for {total} bytes but got {done}"),
                ))
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Seek to a position within the multiplexed payload. Positions are always
/// relative to the descriptor offset captured at open time; seeks are
/// absolute from there.
pub fn seek_to(mut f: &File, initial_pos: u64, pos: u64) -> io::Result<()> {
    f.seek(SeekFrom::Start(initial_pos + pos))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn roundtrip_through_file() {
        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(&[0u8; 8]).unwrap();
        seek_to(&tmp, 3, 5).unwrap();
        write_big(&tmp, b"hello").unwrap();

        seek_to(&tmp, 0, 8).unwrap();
        let mut back = [0u8; 5];
        read_big(&tmp, &mut back).unwrap();
        assert_eq!(&back, b"hello");
    }

    #[test]
    fn short_read_is_an_error() {
        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(b"abc").unwrap();
        seek_to(&tmp, 0, 0).unwrap();
        let mut buf = [0u8; 8];
        let err = read_big(&tmp, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
