//! Error kinds surfaced by the core (spec §7).
//!
//! `CoreError` models the five abstract kinds from the spec plus the two
//! format-decode failures from the container/codec layers. Everything that
//! crosses back into the filesystem-interface adaptor goes through
//! [`CoreError::into_io_error`], which maps onto the errno vocabulary the
//! adaptor expects (`EIO`, `ENOSPC`).

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Header mismatch, or a short codec read before the declared logical EOF.
    #[error("corrupt container: {0}")]
    Corrupt(String),

    /// The container's first three bytes are not the magic, but the caller
    /// already knew (or asserted) that this file was compressed.
    #[error("broken container header")]
    BrokenHeader,

    /// A codec reported an internal failure.
    #[error("codec failure: {0}")]
    CodecFailure(String),

    /// `codec_id` does not resolve to a codec this build can supply.
    #[error("codec {0} is not available in this build")]
    UnavailableCodec(u8),

    /// Underlying backing-store syscall failed.
    #[error("backing-store I/O error: {0}")]
    Io(#[from] io::Error),

    /// Insufficient free space on the backing store.
    #[error("insufficient space on backing store")]
    NoSpace,

    /// Operation aborted because `CANCEL` was observed. Not user-visible —
    /// the caller that requested cancellation proceeds; this is only used
    /// internally to unwind a transform cleanly.
    #[error("operation cancelled")]
    Cancelled,
}

impl CoreError {
    /// Map to the errno vocabulary the filesystem-interface adaptor expects
    /// (§6/§7): `EIO` for corruption/codec/I/O failures, `ENOSPC` for space
    /// exhaustion. `Cancelled` has no upward representation — callers must
    /// not let it escape past the point that issued the cancellation.
    pub fn into_io_error(self) -> io::Error {
        match self {
            CoreError::Io(e) => e,
            CoreError::NoSpace => io::Error::from_raw_os_error(libc::ENOSPC),
            CoreError::Cancelled => io::Error::from_raw_os_error(libc::EINTR),
            _ => io::Error::from_raw_os_error(libc::EIO),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
