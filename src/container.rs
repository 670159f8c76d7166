//! Container header — fixed prefix carried by every compressed backing file.
//!
//! # On-disk layout (16 bytes, all numeric fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      3   magic     = 1F 5D 89
//!    3      1   codec_id  index into the codec table (§6)
//!    4      4   reserved  zero, written but never interpreted
//!    8      8   size      logical (uncompressed) size, LE u64
//! ```
//!
//! `size == SIZE_UNKNOWN` (`u64::MAX`) is the on-disk sentinel used while a
//! file is mid-write and its final logical size is not yet known — the Rust
//! stand-in for the C `off_t == -1` convention (spec §3).
//!
//! A file whose first three bytes are not `MAGIC` is not a format error at
//! this layer: the caller treats it as raw, uncompressed content and never
//! calls [`read_header`]. `read_header` only returns [`CoreError::BrokenHeader`]
//! when the caller already believes the file carries a container (§4.1).

use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{CoreError, CoreResult};

pub const MAGIC: [u8; 3] = [0x1F, 0x5D, 0x89];
pub const HEADER_SIZE: usize = 16;
pub const SIZE_UNKNOWN: u64 = u64::MAX;

/// Parsed container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub codec_id: u8,
    pub size: u64,
}

/// Peek the first three bytes of `r` and report whether they are the
/// container magic, without disturbing the stream position for callers
/// that pass a `Seek`-able handle (the caller is expected to seek back to
/// 0 itself if it needs to; this just inspects).
pub fn has_magic(buf: &[u8]) -> bool {
    buf.len() >= 3 && buf[0..3] == MAGIC
}

/// Read and validate a container header at the current position (must be
/// offset 0). Returns [`CoreError::BrokenHeader`] if the magic does not
/// match — the caller must only call this once it has established the
/// backing file is expected to carry a container.
pub fn read_header<R: Read>(mut r: R) -> CoreResult<Header> {
    let mut buf = [0u8; HEADER_SIZE];
    r.read_exact(&mut buf).map_err(CoreError::Io)?;

    if buf[0..3] != MAGIC {
        return Err(CoreError::BrokenHeader);
    }
    let codec_id = buf[3];
    let size = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    Ok(Header { codec_id, size })
}

/// Write a container header at offset 0 and leave the stream positioned
/// at the start of the payload (`HEADER_SIZE`).
pub fn write_header<W: Write + Seek>(mut w: W, codec_id: u8, size: u64) -> CoreResult<()> {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0..3].copy_from_slice(&MAGIC);
    buf[3] = codec_id;
    // buf[4..8] reserved, left zero.
    buf[8..16].copy_from_slice(&size.to_le_bytes());

    w.seek(SeekFrom::Start(0)).map_err(CoreError::Io)?;
    w.write_all(&buf).map_err(CoreError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip() {
        let mut buf = Vec::new();
        {
            let mut cur = Cursor::new(&mut buf);
            write_header(&mut cur, 2, 12345).unwrap();
        }
        let hdr = read_header(Cursor::new(&buf)).unwrap();
        assert_eq!(hdr.codec_id, 2);
        assert_eq!(hdr.size, 12345);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = [0u8; HEADER_SIZE];
        let err = read_header(Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, CoreError::BrokenHeader));
    }

    #[test]
    fn unknown_sentinel_round_trips() {
        let mut buf = Vec::new();
        {
            let mut cur = Cursor::new(&mut buf);
            write_header(&mut cur, 0, SIZE_UNKNOWN).unwrap();
        }
        let hdr = read_header(Cursor::new(&buf)).unwrap();
        assert_eq!(hdr.size, SIZE_UNKNOWN);
    }
}
