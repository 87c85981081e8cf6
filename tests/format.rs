//! On-disk format checks: chain integrity, link uniqueness, store-raw and
//! size contracts, the legacy header, and the close workaround.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};

use muxpack::codec::decompress_block;
use muxpack::{
    CodecTag, FormatVersion, RecordHeader, StreamConfig, StreamReader, StreamWriter, HEADER_LEN,
};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use tempfile::NamedTempFile;

fn cfg(backend: CodecTag, workers: usize) -> StreamConfig {
    StreamConfig { backend, workers, ..StreamConfig::default() }
}

/// Parse a whole archive: the sentinel `next` links plus every record in
/// file order, keyed by its payload-relative offset.
fn walk_archive(
    tmp: &NamedTempFile,
    streams: u64,
) -> (Vec<u64>, BTreeMap<u64, (RecordHeader, Vec<u8>)>) {
    let mut f = tmp.reopen().unwrap();
    let len = f.metadata().unwrap().len();
    f.seek(SeekFrom::Start(0)).unwrap();

    let mut sentinels = Vec::new();
    for _ in 0..streams {
        let hdr = RecordHeader::read_from(&mut f, FormatVersion::Current).unwrap();
        assert!(hdr.is_sentinel(), "stream head is not a sentinel: {hdr:?}");
        sentinels.push(hdr.next);
    }

    let mut records = BTreeMap::new();
    let mut pos = streams * HEADER_LEN;
    while pos < len {
        let hdr = RecordHeader::read_from(&mut f, FormatVersion::Current).unwrap();
        let mut payload = vec![0u8; hdr.c_len as usize];
        f.read_exact(&mut payload).unwrap();
        records.insert(pos, (hdr, payload));
        pos += HEADER_LEN + hdr.c_len;
    }
    assert_eq!(pos, len, "trailing bytes after the last record");
    (sentinels, records)
}

#[test]
fn chains_are_complete_ordered_and_unique() {
    let tmp = NamedTempFile::new().unwrap();
    const TOTAL: usize = 1 << 20; // per stream
    let pat0: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
    let pat1: Vec<u8> = (0..TOTAL).map(|i| ((i * 11) % 241) as u8).collect();

    let mut w = StreamWriter::open(tmp.reopen().unwrap(), 2, 512 * 1024, cfg(CodecTag::Lz4, 4)).unwrap();
    for i in (0..TOTAL).step_by(64 * 1024) {
        w.write(0, &pat0[i..i + 64 * 1024]).unwrap();
        w.write(1, &pat1[i..i + 64 * 1024]).unwrap();
    }
    w.close().unwrap();

    let (sentinels, records) = walk_archive(&tmp, 2);

    // Following each chain must reproduce the stream exactly and visit
    // every record exactly once across both chains.
    let mut visited = 0usize;
    let mut seen_links: Vec<u64> = Vec::new();
    for (head, want) in sentinels.iter().zip([&pat0, &pat1]) {
        let mut decoded = Vec::with_capacity(TOTAL);
        let mut at = *head;
        while at != 0 {
            let (hdr, payload) = records.get(&at).expect("next link points at no record header");
            decoded.extend_from_slice(
                &decompress_block(hdr.tag, payload.clone(), hdr.u_len as usize).unwrap(),
            );
            visited += 1;
            if hdr.next != 0 {
                seen_links.push(hdr.next);
            }
            at = hdr.next;
        }
        assert_eq!(&decoded, want);
    }
    assert_eq!(visited, records.len(), "records unreachable from any chain");

    // No two records name the same successor.
    seen_links.extend(sentinels.iter().copied().filter(|&n| n != 0));
    let unique: std::collections::BTreeSet<_> = seen_links.iter().copied().collect();
    assert_eq!(unique.len(), seen_links.len(), "duplicate next links");
}

#[test]
fn random_blocks_store_raw_with_exact_overhead() {
    let tmp = NamedTempFile::new().unwrap();
    let mut data = vec![0u8; 1 << 20];
    StdRng::seed_from_u64(99).fill_bytes(&mut data);

    let mut w = StreamWriter::open(tmp.reopen().unwrap(), 1, 512 * 1024, cfg(CodecTag::Bzip2, 2)).unwrap();
    w.write(0, &data).unwrap();
    w.close().unwrap();

    let (_, records) = walk_archive(&tmp, 1);
    assert_eq!(records.len(), 4); // 4 × 256 KiB blocks
    for (hdr, _) in records.values() {
        assert_eq!(hdr.tag, CodecTag::None);
        assert_eq!(hdr.c_len, hdr.u_len);
    }
    // Archive size is input plus header overhead only.
    let expected = HEADER_LEN + 4 * HEADER_LEN + data.len() as u64;
    assert_eq!(tmp.as_file().metadata().unwrap().len(), expected);
}

#[test]
fn compressed_records_shrink() {
    let tmp = NamedTempFile::new().unwrap();
    let data = b"size monotonicity corpus line\n".repeat(35_000);

    let mut w = StreamWriter::open(tmp.reopen().unwrap(), 1, 512 * 1024, cfg(CodecTag::Zstd, 2)).unwrap();
    w.write(0, &data).unwrap();
    w.close().unwrap();

    let (_, records) = walk_archive(&tmp, 1);
    assert!(records.len() > 1);
    for (hdr, _) in records.values() {
        assert_eq!(hdr.tag, CodecTag::Zstd);
        assert!(hdr.c_len < hdr.u_len);
    }
}

#[test]
fn legacy_headers_read_correctly() {
    let data = b"legacy payload ".repeat(2000);
    let compressed = lz4_flex::compress_prepend_size(&data);

    let mut bytes = Vec::new();
    // 13-byte sentinel whose next points at the first record.
    bytes.push(0u8);
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&13u32.to_le_bytes());
    // One lz4 record terminating the chain.
    bytes.push(1u8);
    bytes.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&compressed);

    let tmp = NamedTempFile::new().unwrap();
    tmp.as_file().write_all(&bytes).unwrap();

    let config = StreamConfig { format: FormatVersion::Legacy, ..cfg(CodecTag::Lz4, 2) };
    let mut r = StreamReader::open(tmp.reopen().unwrap(), 1, config).unwrap();
    let mut out = vec![0u8; data.len() + 16];
    let n = r.read(0, &mut out).unwrap();
    assert_eq!(&out[..n], &data[..]);
    assert!(r.at_eos(0));
    r.close().unwrap();
}

#[test]
fn zeroed_leading_header_is_skipped_once() {
    let tmp = NamedTempFile::new().unwrap();
    let data = b"workaround body ".repeat(8_000);

    {
        // A stray all-zero header ahead of the real stream heads.
        let mut f = tmp.reopen().unwrap();
        f.write_all(&[0u8; HEADER_LEN as usize]).unwrap();
        let mut w = StreamWriter::open(f, 1, 1 << 20, cfg(CodecTag::Lz4, 2)).unwrap();
        w.write(0, &data).unwrap();
        w.close().unwrap();
    }

    let mut r = StreamReader::open(tmp.reopen().unwrap(), 1, cfg(CodecTag::Lz4, 2)).unwrap();
    let mut out = vec![0u8; data.len() + 16];
    let n = r.read(0, &mut out).unwrap();
    assert_eq!(&out[..n], &data[..]);
    r.close().unwrap();
}

#[test]
fn total_read_covers_the_whole_payload() {
    let tmp = NamedTempFile::new().unwrap();
    let data: Vec<u8> = (0..600_000usize).map(|i| (i % 256) as u8).collect();

    let mut w = StreamWriter::open(tmp.reopen().unwrap(), 1, 256 * 1024, cfg(CodecTag::Lz4, 2)).unwrap();
    w.write(0, &data).unwrap();
    w.close().unwrap();

    let archive_len = tmp.as_file().metadata().unwrap().len();
    let mut r = StreamReader::open(tmp.reopen().unwrap(), 1, cfg(CodecTag::Lz4, 2)).unwrap();
    let mut out = vec![0u8; data.len()];
    assert_eq!(r.read(0, &mut out).unwrap(), data.len());
    assert_eq!(out, data);
    assert!(r.at_eos(0));
    // Every byte of the payload was fetched: sentinel, headers, payloads.
    assert_eq!(r.total_read(), archive_len);
    r.close().unwrap();
}

#[test]
fn corrupt_sentinel_is_rejected() {
    let tmp = NamedTempFile::new().unwrap();
    let mut bytes = vec![0u8; HEADER_LEN as usize];
    bytes[1] = 1; // nonzero c_len in the stream head
    bytes[17] = 1; // and a nonzero link so the workaround does not trigger
    tmp.as_file().write_all(&bytes).unwrap();

    let err = StreamReader::open(tmp.reopen().unwrap(), 1, cfg(CodecTag::Lz4, 1)).unwrap_err();
    assert!(matches!(err, muxpack::EngineError::Format(_)));
}
