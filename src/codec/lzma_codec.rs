//! LZMA codec, backed by `xz2`'s streaming `Read`/`Write` wrappers over
//! liblzma. The teacher depends on `lzma-rs` for whole-file LZMA only; it
//! has no incremental encode/decode story, and §4.2 requires a codec to
//! support `open`/`read`/`write` against a live fd, so `xz2` stands in here
//! (see DESIGN.md).

use std::fs::File;
use std::io::{Read, Write};

use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use crate::cancel::CancelToken;
use crate::error::{CoreError, CoreResult};

use super::{copy_with_cancel, CodecReader, CodecWriter, StreamCodec, CODEC_LZMA};

pub struct LzmaCodec;

fn preset(level: i32) -> u32 {
    level.clamp(0, 9) as u32
}

impl StreamCodec for LzmaCodec {
    fn id(&self) -> u8 {
        CODEC_LZMA
    }

    fn name(&self) -> &'static str {
        "lzma"
    }

    fn open_read(&self, fd: File, _cancel: CancelToken) -> CoreResult<Box<dyn CodecReader>> {
        Ok(Box::new(LzmaReader(XzDecoder::new(fd))))
    }

    fn open_write(&self, fd: File, level_: i32, _cancel: CancelToken) -> CoreResult<Box<dyn CodecWriter>> {
        Ok(Box::new(LzmaWriter(Some(XzEncoder::new(fd, preset(level_))))))
    }

    fn compress_file(&self, input: &mut File, output: &mut File, level_: i32, cancel: &CancelToken) -> CoreResult<()> {
        let mut enc = XzEncoder::new(&mut *output, preset(level_));
        copy_with_cancel(&mut *input, &mut enc, cancel)?;
        enc.finish().map_err(CoreError::Io)?;
        Ok(())
    }

    fn decompress_file(&self, input: &mut File, output: &mut File, cancel: &CancelToken) -> CoreResult<()> {
        let mut dec = XzDecoder::new(&mut *input);
        copy_with_cancel(&mut dec, &mut *output, cancel)
    }
}

struct LzmaReader(XzDecoder<File>);

impl CodecReader for LzmaReader {
    fn read(&mut self, buf: &mut [u8]) -> CoreResult<usize> {
        self.0.read(buf).map_err(CoreError::Io)
    }

    fn close(self: Box<Self>) -> CoreResult<()> {
        Ok(())
    }
}

struct LzmaWriter(Option<XzEncoder<File>>);

impl CodecWriter for LzmaWriter {
    fn write(&mut self, buf: &[u8]) -> CoreResult<usize> {
        self.0
            .as_mut()
            .expect("write after close")
            .write(buf)
            .map_err(CoreError::Io)
    }

    fn close(mut self: Box<Self>) -> CoreResult<()> {
        if let Some(enc) = self.0.take() {
            enc.finish().map_err(CoreError::Io)?;
        }
        Ok(())
    }
}
