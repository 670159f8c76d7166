//! Codec-choice policy (spec §4.2, second paragraph): pick a codec for a
//! path, driven by extension plus a "don't compress" blacklist, and an
//! optional exclusion of canonical binary-directory prefixes so
//! memory-mapped executables don't get rewritten under them.

use crate::codec::{CODEC_BZIP2, CODEC_GZIP, CODEC_LZMA};
use crate::config::Config;

/// Choose a codec id for `relative_path` (relative to the backing root),
/// or `None` if the policy says this file must not be compressed
/// (`dontcompress`, spec §3).
pub fn choose_codec(relative_path: &str, config: &Config) -> Option<u8> {
    if config.exclude_binary_prefixes
        && config
            .binary_prefixes
            .iter()
            .any(|p| relative_path.starts_with(p.as_str()))
    {
        return None;
    }

    let ext = extension_of(relative_path);
    if let Some(ext) = &ext {
        if config
            .dontcompress_extensions
            .iter()
            .any(|b| b.eq_ignore_ascii_case(ext))
        {
            return None;
        }
    }

    // A simple extension-driven default: text-ish/unknown extensions get
    // the balanced codec, a couple of well-known compressible formats get
    // steered toward the codecs best suited for them. There is no
    // negotiation here — every choice must resolve through `codec::get_codec`.
    match ext.as_deref() {
        Some("log") | Some("txt") | Some("csv") | Some("json") | Some("xml") => Some(CODEC_BZIP2),
        Some("tar") => Some(CODEC_LZMA),
        None => Some(CODEC_GZIP),
        _ => Some(CODEC_GZIP),
    }
}

fn extension_of(path: &str) -> Option<String> {
    path.rsplit('.')
        .next()
        .filter(|ext| *ext != path)
        .map(|s| s.to_ascii_lowercase())
}
