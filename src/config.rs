//! Tunables the core exposes as a plain data type (spec §9 Open Question:
//! "the fallback heuristic... appears tuned empirically; expose it as a
//! configuration knob"). Parsing this from a config file is the
//! filesystem-interface adaptor's job (§1) — this crate only defines the
//! shape, derived `Serialize`/`Deserialize` so an adaptor can load it from
//! whatever format it likes, the way the teacher derives serde on
//! `FileIndex`/`RecoveryMap`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Files at or above this size (bytes) are eligible for background
    /// compression when their size is known; files whose size isn't yet
    /// known are always eligible (§4.3 purge).
    pub min_filesize_background: u64,

    /// Codec level passed to `open_write`/`compress_file` (§4.4, §4.4.1).
    pub compression_level: i32,

    /// Soft cap on live `FileRecord`s before a purge pass runs (§3 `MAX_OPEN`).
    pub max_open_soft_target: usize,

    /// Whether the background worker runs `do_dedup` after `do_compress`
    /// (§4.5).
    pub dedup_enabled: bool,

    /// Read-path fallback heuristic (§4.4 read path, §9 Open Question):
    /// fall back to whole-file decompression once
    /// `skipped > fallback_skip_ratio * size` AND `size > fallback_min_size`.
    pub fallback_skip_ratio: u64,
    pub fallback_min_size: u64,

    /// Extensions (without the leading dot) the policy layer refuses to
    /// compress — media containers, archives, already-compressed formats
    /// (§4.2).
    pub dontcompress_extensions: Vec<String>,

    /// When `exclude_binary_prefixes` is set, files under any of these
    /// backing-relative path prefixes are never compressed, to avoid
    /// breaking memory-mapped executables (§4.2).
    pub exclude_binary_prefixes: bool,
    pub binary_prefixes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_filesize_background: 8 * 1024,
            compression_level: 6,
            max_open_soft_target: 30,
            dedup_enabled: true,
            fallback_skip_ratio: 3,
            fallback_min_size: 128 * 1024,
            dontcompress_extensions: default_blacklist(),
            exclude_binary_prefixes: true,
            binary_prefixes: vec!["bin/".to_string(), "usr/bin/".to_string(), "usr/sbin/".to_string(), "sbin/".to_string()],
        }
    }
}

fn default_blacklist() -> Vec<String> {
    [
        "gz", "bz2", "xz", "zip", "rar", "7z", "lz", "lzo", "zst", "tgz", "tbz2", "jpg", "jpeg",
        "png", "gif", "mp3", "mp4", "avi", "mkv", "ogg", "flac", "webm", "mov",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
