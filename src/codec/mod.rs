//! Codec Interface (spec §4.2) — a narrow polymorphic contract each
//! supported algorithm implements; the rest of the core only ever consumes
//! [`StreamCodec`]/[`CodecReader`]/[`CodecWriter`].
//!
//! Codec identity on disk is the single `codec_id` byte from the container
//! header (§4.1, §6), indexing the frozen table below. Individual codec
//! *plugins* are named as external collaborators in spec §1 — what lives
//! here are the small number of built-ins the core ships with so the
//! direct I/O engine and background workers have something real to drive
//! against and to test.

mod bzip2_codec;
mod gzip_codec;
mod lzma_codec;
mod null_codec;

use std::fs::File;
use std::io::{Read, Write};

use crate::cancel::CancelToken;
use crate::error::{CoreError, CoreResult};

pub const CODEC_NULL: u8 = 0;
pub const CODEC_BZIP2: u8 = 1;
pub const CODEC_GZIP: u8 = 2;
pub const CODEC_LZO: u8 = 3;
pub const CODEC_LZMA: u8 = 4;

/// Stateless capability table for one codec (§4.2).
pub trait StreamCodec: Send + Sync {
    fn id(&self) -> u8;
    fn name(&self) -> &'static str;

    /// Open a duplicate of the backing fd for incremental decoding.
    fn open_read(&self, fd: File, cancel: CancelToken) -> CoreResult<Box<dyn CodecReader>>;

    /// Open a duplicate of the backing fd for incremental encoding at the
    /// given compression level.
    fn open_write(
        &self,
        fd: File,
        level: i32,
        cancel: CancelToken,
    ) -> CoreResult<Box<dyn CodecWriter>>;

    /// Whole-file compress, used by `do_compress` (§4.4.1).
    fn compress_file(&self, input: &mut File, output: &mut File, level: i32, cancel: &CancelToken) -> CoreResult<()>;

    /// Whole-file decompress, used by `do_decompress` (§4.4.1).
    fn decompress_file(&self, input: &mut File, output: &mut File, cancel: &CancelToken) -> CoreResult<()>;
}

/// An open decode stream (§4.2 `open`/`read`/`close`).
pub trait CodecReader: Send {
    fn read(&mut self, buf: &mut [u8]) -> CoreResult<usize>;
    fn close(self: Box<Self>) -> CoreResult<()>;
}

/// An open encode stream (§4.2 `open`/`write`/`close`).
pub trait CodecWriter: Send {
    fn write(&mut self, buf: &[u8]) -> CoreResult<usize>;
    fn close(self: Box<Self>) -> CoreResult<()>;
}

/// Resolve a `codec_id` byte to a built-in codec.
///
/// Returns [`CoreError::UnavailableCodec`] for ids this build does not
/// implement — `lzo` is recognised as a valid table entry (§6) but its
/// framing helper is explicitly out of the core's scope (§1), so it is
/// never available here. The caller must not fall back to another codec;
/// the spec requires failing hard (mirrored on the teacher's
/// `get_codec_by_uuid`/`UnavailableCodec` contract).
pub fn get_codec(id: u8) -> CoreResult<Box<dyn StreamCodec>> {
    match id {
        CODEC_NULL => Ok(Box::new(null_codec::NullCodec)),
        CODEC_GZIP => Ok(Box::new(gzip_codec::GzipCodec)),
        CODEC_BZIP2 => Ok(Box::new(bzip2_codec::Bzip2Codec)),
        CODEC_LZMA => Ok(Box::new(lzma_codec::LzmaCodec)),
        _ => Err(CoreError::UnavailableCodec(id)),
    }
}

pub fn name_for(id: u8) -> &'static str {
    match id {
        CODEC_NULL => "null",
        CODEC_BZIP2 => "bzip2",
        CODEC_GZIP => "gzip",
        CODEC_LZO => "lzo",
        CODEC_LZMA => "lzma",
        _ => "unknown",
    }
}

/// Copy `input` to `output` in chunks, polling `cancel` between chunks so a
/// whole-file transcode can abort promptly (§4.4.1, §5).
pub(crate) fn copy_with_cancel<R: Read, W: Write>(
    mut input: R,
    mut output: W,
    cancel: &CancelToken,
) -> CoreResult<()> {
    let mut buf = [0u8; 64 * 1024];
    loop {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let n = input.read(&mut buf).map_err(CoreError::Io)?;
        if n == 0 {
            break;
        }
        output.write_all(&buf[..n]).map_err(CoreError::Io)?;
    }
    Ok(())
}
