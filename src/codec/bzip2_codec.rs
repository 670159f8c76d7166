//! Bzip2 codec, backed by the `bzip2` crate's streaming `Read`/`Write`
//! wrappers. Pulled in for the same domain (a bzip2 codec sits squarely in
//! this corpus — see the `kassoulet-bz2zstd` decoder in the retrieval pack)
//! even though the teacher repo itself has no bzip2 dependency.

use std::fs::File;
use std::io::{Read, Write};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;

use crate::cancel::CancelToken;
use crate::error::{CoreError, CoreResult};

use super::{copy_with_cancel, CodecReader, CodecWriter, StreamCodec, CODEC_BZIP2};

pub struct Bzip2Codec;

fn level(level: i32) -> Compression {
    Compression::new(level.clamp(1, 9) as u32)
}

impl StreamCodec for Bzip2Codec {
    fn id(&self) -> u8 {
        CODEC_BZIP2
    }

    fn name(&self) -> &'static str {
        "bzip2"
    }

    fn open_read(&self, fd: File, _cancel: CancelToken) -> CoreResult<Box<dyn CodecReader>> {
        Ok(Box::new(Bzip2Reader(BzDecoder::new(fd))))
    }

    fn open_write(&self, fd: File, level_: i32, _cancel: CancelToken) -> CoreResult<Box<dyn CodecWriter>> {
        Ok(Box::new(Bzip2Writer(Some(BzEncoder::new(fd, level(level_))))))
    }

    fn compress_file(&self, input: &mut File, output: &mut File, level_: i32, cancel: &CancelToken) -> CoreResult<()> {
        let mut enc = BzEncoder::new(&mut *output, level(level_));
        copy_with_cancel(&mut *input, &mut enc, cancel)?;
        enc.finish().map_err(CoreError::Io)?;
        Ok(())
    }

    fn decompress_file(&self, input: &mut File, output: &mut File, cancel: &CancelToken) -> CoreResult<()> {
        let mut dec = BzDecoder::new(&mut *input);
        copy_with_cancel(&mut dec, &mut *output, cancel)
    }
}

struct Bzip2Reader(BzDecoder<File>);

impl CodecReader for Bzip2Reader {
    fn read(&mut self, buf: &mut [u8]) -> CoreResult<usize> {
        self.0.read(buf).map_err(CoreError::Io)
    }

    fn close(self: Box<Self>) -> CoreResult<()> {
        Ok(())
    }
}

struct Bzip2Writer(Option<BzEncoder<File>>);

impl CodecWriter for Bzip2Writer {
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
