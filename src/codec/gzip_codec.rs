//! Gzip codec, backed by `flate2`'s streaming `Read`/`Write` wrappers —
//! the same dependency `JohnTheCoolingFan-mtzip` already pulls in for
//! streaming deflate over file handles.

use std::fs::File;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::cancel::CancelToken;
use crate::error::{CoreError, CoreResult};

use super::{copy_with_cancel, CodecReader, CodecWriter, StreamCodec, CODEC_GZIP};

pub struct GzipCodec;

fn level(level: i32) -> Compression {
    Compression::new(level.clamp(0, 9) as u32)
}

impl StreamCodec for GzipCodec {
    fn id(&self) -> u8 {
        CODEC_GZIP
    }

    fn name(&self) -> &'static str {
        "gzip"
    }

    fn open_read(&self, fd: File, _cancel: CancelToken) -> CoreResult<Box<dyn CodecReader>> {
        Ok(Box::new(GzipReader(GzDecoder::new(fd))))
    }

    fn open_write(&self, fd: File, level_: i32, _cancel: CancelToken) -> CoreResult<Box<dyn CodecWriter>> {
        Ok(Box::new(GzipWriter(Some(GzEncoder::new(fd, level(level_))))))
    }

    fn compress_file(&self, input: &mut File, output: &mut File, level_: i32, cancel: &CancelToken) -> CoreResult<()> {
        let mut enc = GzEncoder::new(&mut *output, level(level_));
        copy_with_cancel(&mut *input, &mut enc, cancel)?;
        enc.finish().map_err(CoreError::Io)?;
        Ok(())
    }

    fn decompress_file(&self, input: &mut File, output: &mut File, cancel: &CancelToken) -> CoreResult<()> {
        let mut dec = GzDecoder::new(&mut *input);
        copy_with_cancel(&mut dec, &mut *output, cancel)
    }
}

struct GzipReader(GzDecoder<File>);

impl CodecReader for GzipReader {
    fn read(&mut self, buf: &mut [u8]) -> CoreResult<usize> {
        self.0.read(buf).map_err(CoreError::Io)
    }

    fn close(self: Box<Self>) -> CoreResult<()> {
        Ok(())
    }
}

struct GzipWriter(Option<GzEncoder<File>>);

impl CodecWriter for GzipWriter {
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
