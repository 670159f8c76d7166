//! # compressfs-core
//!
//! Core state machinery for a transparent compress-and-dedup filesystem
//! overlay: a self-describing container header, a small set of streaming
//! codecs, the per-file open-table/descriptor bookkeeping that arbitrates
//! concurrent access, the direct I/O engine that drives reads and writes
//! through those codecs, and a background worker that compresses idle
//! files and hard-link-deduplicates identical content.
//!
//! This crate has no `main.rs` and installs no logging subscriber — it is
//! a library consumed by a filesystem-interface adaptor (a FUSE binding or
//! equivalent), which owns the daemon bootstrap, config-file parsing and
//! signal handling. [`CoreContext`] is the single entry point: `mount` it
//! against a backing directory and a [`Config`], then drive it through
//! `open`/`read`/`write`/`close`/`rename`/`unlink`, and `unmount` it when
//! done.

pub mod background;
pub mod cancel;
pub mod codec;
pub mod config;
pub mod container;
pub mod context;
pub mod dedup;
pub mod error;
pub mod io_engine;
pub mod open_table;
pub mod policy;
pub mod record;

pub use background::BackgroundQueue;
pub use cancel::CancelToken;
pub use codec::{get_codec, name_for, CodecReader, CodecWriter, StreamCodec};
pub use config::Config;
pub use container::{Header, SIZE_UNKNOWN};
pub use context::CoreContext;
pub use dedup::{DedupEntry, DedupIndex};
pub use error::{CoreError, CoreResult};
pub use open_table::OpenTable;
pub use record::{AccessMode, Descriptor, FileRecord};
