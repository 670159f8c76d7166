//! The `null` codec (spec §4.2: "always present and simply passes bytes
//! through"). Used for files the policy layer decides not to compress, and
//! as the baseline every other codec is measured against in tests.

use std::fs::File;
use std::io::{Read, Write};

use crate::cancel::CancelToken;
use crate::error::{CoreError, CoreResult};

use super::{copy_with_cancel, CodecReader, CodecWriter, StreamCodec, CODEC_NULL};

pub struct NullCodec;

impl StreamCodec for NullCodec {
    fn id(&self) -> u8 {
        CODEC_NULL
    }

    fn name(&self) -> &'static str {
        "null"
    }

    fn open_read(&self, fd: File, _cancel: CancelToken) -> CoreResult<Box<dyn CodecReader>> {
        Ok(Box::new(NullReader(fd)))
    }

    fn open_write(&self, fd: File, _level: i32, _cancel: CancelToken) -> CoreResult<Box<dyn CodecWriter>> {
        Ok(Box::new(NullWriter(fd)))
    }

    fn compress_file(&self, input: &mut File, output: &mut File, _level: i32, cancel: &CancelToken) -> CoreResult<()> {
        copy_with_cancel(&mut *input, &mut *output, cancel)
    }

    fn decompress_file(&self, input: &mut File, output: &mut File, cancel: &CancelToken) -> CoreResult<()> {
        copy_with_cancel(&mut *input, &mut *output, cancel)
    }
}

struct NullReader(File);

impl CodecReader for NullReader {
    fn read(&mut self, buf: &mut [u8]) -> CoreResult<usize> {
        self.0.read(buf).map_err(CoreError::Io)
    }

    fn close(self: Box<Self>) -> CoreResult<()> {
        Ok(())
    }
}

struct NullWriter(File);

impl CodecWriter for NullWriter {
    fn write(&mut self, buf: &[u8]) -> CoreResult<usize> {
        self.0.write(buf).map_err(CoreError::Io)
    }

    fn close(self: Box<Self>) -> CoreResult<()> {
        Ok(())
    }
}
