//! Direct I/O Engine (spec §4.4, §4.4.1): `read`/`write`/`close` on a
//! `(FileRecord, Descriptor)` pair, plus the whole-file transcoding
//! primitives the fallback paths and the background worker share.
//!
//! `read`/`write` are "called under the per-record lock" (§4.4): callers
//! pass in the `MutexGuard` they already hold and get it back, since the
//! fallback paths need to drop and reacquire it around a whole-file
//! transcode exactly like [`crate::record::FileRecord::wait_until_stable`].

use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::Path;
use std::sync::{Arc, MutexGuard};

use crate::cancel::CancelToken;
use crate::codec::{self, CodecReader, CodecWriter};
use crate::config::Config;
use crate::container::{self, SIZE_UNKNOWN};
use crate::dedup::{self, DedupIndex};
use crate::error::{CoreError, CoreResult};
use crate::record::{
    AccessMode, Descriptor, DescriptorHandle, FileRecord, FileRecordInner, CANCEL, COMPRESSING,
    DECOMPRESSING,
};

/// Wait out any in-flight decompression before touching the stream
/// (spec §4.4 "common preamble"), then latch `access_mode` on first use.
fn preamble<'a>(
    record: &'a FileRecord,
    mut guard: MutexGuard<'a, FileRecordInner>,
    mode: AccessMode,
) -> MutexGuard<'a, FileRecordInner> {
    while guard.status & DECOMPRESSING != 0 {
        guard.status |= CANCEL;
        record.cancel.request();
        guard = record.cond.wait(guard).expect("FileRecord cond poisoned");
    }
    if guard.access_mode == AccessMode::Unset {
        guard.access_mode = mode;
    }
    guard
}

fn is_adversarial(guard: &FileRecordInner, desc_offset: u64, off: u64, config: &Config) -> bool {
    match guard.size {
        Some(size) => {
            guard.skipped > config.fallback_skip_ratio.saturating_mul(size)
                && size > config.fallback_min_size
                && off != desc_offset
        }
        None => false,
    }
}

/// `read(rec, desc, buf, n, off)` (spec §4.4 read path).
pub fn read<'a>(
    record: &'a Arc<FileRecord>,
    mut guard: MutexGuard<'a, FileRecordInner>,
    descriptor: &Arc<Descriptor>,
    buf: &mut [u8],
    off: u64,
    abs_path: &Path,
    config: &Config,
) -> (MutexGuard<'a, FileRecordInner>, CoreResult<usize>) {
    guard = preamble(record, guard, AccessMode::Reading);

    let desc_offset = descriptor.state().offset;
    let fallback = guard.access_mode == AccessMode::Writing
        || is_adversarial(&guard, desc_offset, off, config);

    if fallback {
        drop(guard);
        if let Err(e) = do_decompress(record, abs_path, config) {
            let guard = record.lock();
            return (guard, Err(e));
        }
        guard = record.lock();
        guard.size = None;
        guard.skipped = 0;

        let mut state = descriptor.state();
        if let Err(e) = refresh_fd(&mut state, abs_path) {
            return (guard, Err(e));
        }
        let n = match state.fd.read_at(buf, off) {
            Ok(n) => n,
            Err(e) => return (guard, Err(CoreError::Io(e))),
        };
        state.offset = off + n as u64;
        return (guard, Ok(n));
    }

    let result = (|| -> CoreResult<usize> {
        let mut state = descriptor.state();

        if guard.dontcompress {
            let n = state.fd.read_at(buf, off).map_err(CoreError::Io)?;
            state.offset = off + n as u64;
            return Ok(n);
        }

        if off < state.offset {
            if let Some(handle) = state.handle.take() {
                close_handle(handle)?;
            }
            reopen_reader(&mut state, abs_path, record.cancel.clone())?;
            state.offset = 0;
        }

        if state.handle.is_none() {
            reopen_reader(&mut state, abs_path, record.cancel.clone())?;
        }

        if off > state.offset {
            let mut discard = [0u8; 64 * 1024];
            while state.offset < off {
                let want = std::cmp::min(discard.len() as u64, off - state.offset) as usize;
                let n = read_from_handle(&mut state, &mut discard[..want])?;
                if n == 0 {
                    return Err(CoreError::Corrupt("short drain before seek target".into()));
                }
                state.offset += n as u64;
                guard.skipped += n as u64;
            }
        }

        let n = read_from_handle(&mut state, buf)?;
        if n < buf.len() {
            if let Some(size) = guard.size {
                if state.offset + (n as u64) < size {
                    return Err(CoreError::Corrupt("short read before declared size".into()));
                }
            }
        }
        state.offset += n as u64;
        Ok(n)
    })();

    (guard, result)
}

fn read_from_handle(state: &mut crate::record::DescriptorState, buf: &mut [u8]) -> CoreResult<usize> {
    let mut total = 0usize;
    match state.handle.as_mut().expect("handle just ensured present") {
        DescriptorHandle::Reader(r) => {
            while total < buf.len() {
                let n = r.read(&mut buf[total..])?;
                if n == 0 {
                    break;
                }
                total += n;
            }
        }
        DescriptorHandle::Writer(_) => {
            return Err(CoreError::CodecFailure("read on a write descriptor".into()));
        }
    }
    Ok(total)
}

fn reopen_reader(
    state: &mut crate::record::DescriptorState,
    abs_path: &Path,
    cancel: CancelToken,
) -> CoreResult<()> {
    let mut header_buf = [0u8; container::HEADER_SIZE];
    state.fd.read_exact_at(&mut header_buf, 0).map_err(CoreError::Io)?;
    let header = container::read_header(&header_buf[..])?;
    let codec = codec::get_codec(header.codec_id)?;

    let mut payload_dup = File::open(abs_path).map_err(CoreError::Io)?;
    use std::io::{Seek, SeekFrom};
    payload_dup.seek(SeekFrom::Start(container::HEADER_SIZE as u64)).map_err(CoreError::Io)?;

    let reader = codec.open_read(payload_dup, cancel)?;
    state.handle = Some(DescriptorHandle::Reader(reader));
    Ok(())
}

fn close_handle(handle: DescriptorHandle) -> CoreResult<()> {
    match handle {
        DescriptorHandle::Reader(r) => r.close(),
        DescriptorHandle::Writer(w) => w.close(),
    }
}

/// Reopen a descriptor's raw fd against `abs_path`. A whole-file transcode
/// (`do_compress`/`do_decompress`/`do_undedup`) replaces the backing inode
/// via rename; an fd opened before that still sees the old (pre-transcode)
/// inode, so any descriptor surviving a transcode must pick up a fresh one
/// before it touches the file positionally.
fn refresh_fd(state: &mut crate::record::DescriptorState, abs_path: &Path) -> CoreResult<()> {
    if let Some(handle) = state.handle.take() {
        let _ = close_handle(handle);
    }
    state.fd = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(abs_path)
        .map_err(CoreError::Io)?;
    Ok(())
}

/// Rewrite the container header without moving `fd`'s file position — a
/// streaming writer may hold a `try_clone`'d descriptor sharing that
/// position, so this uses `pwrite` (`write_all_at`) rather than seeking.
fn rewrite_header_in_place(fd: &File, codec_id: u8, size: u64) -> CoreResult<()> {
    let mut buf = [0u8; container::HEADER_SIZE];
    buf[0..3].copy_from_slice(&container::MAGIC);
    buf[3] = codec_id;
    buf[8..16].copy_from_slice(&size.to_le_bytes());
    fd.write_all_at(&buf, 0).map_err(CoreError::Io)
}

/// `write(rec, desc, buf, n, off)` (spec §4.4 write path).
pub fn write<'a>(
    record: &'a Arc<FileRecord>,
    mut guard: MutexGuard<'a, FileRecordInner>,
    descriptor: &Arc<Descriptor>,
    buf: &[u8],
    off: u64,
    abs_path: &Path,
    config: &Config,
    dedup_index: &DedupIndex,
) -> (MutexGuard<'a, FileRecordInner>, CoreResult<usize>) {
    guard = preamble(record, guard, AccessMode::Writing);

    if let Ok(meta) = fs::metadata(abs_path) {
        if meta.nlink() >= 2 {
            if let Err(e) = dedup::do_undedup(dedup_index, &record.path, abs_path) {
                return (guard, Err(e));
            }
            guard.deduped = false;
            let mut state = descriptor.state();
            if let Err(e) = refresh_fd(&mut state, abs_path) {
                return (guard, Err(e));
            }
        }
    }

    let desc_offset = descriptor.state().offset;
    let can_stream = guard.access_mode == AccessMode::Writing
        && guard.size == Some(desc_offset)
        && desc_offset == off
        && guard.refcount() == 1;

    if !can_stream {
        drop(guard);
        if let Err(e) = do_decompress(record, abs_path, config) {
            let guard = record.lock();
            return (guard, Err(e));
        }
        guard = record.lock();
        guard.size = None;

        let mut state = descriptor.state();
        if let Err(e) = refresh_fd(&mut state, abs_path) {
            return (guard, Err(e));
        }
        let n = match state.fd.write_at(buf, off) {
            Ok(n) => n,
            Err(e) => return (guard, Err(CoreError::Io(e))),
        };
        return (guard, Ok(n));
    }

    if guard.dontcompress {
        let mut state = descriptor.state();
        let n = match state.fd.write_at(buf, off) {
            Ok(n) => n,
            Err(e) => return (guard, Err(CoreError::Io(e))),
        };
        state.offset = off + n as u64;
        guard.size = Some(state.offset);
        return (guard, Ok(n));
    }

    let result = (|| -> CoreResult<usize> {
        let mut state = descriptor.state();

        if state.handle.is_none() {
            let codec_id = match guard.codec {
                Some(id) => Some(id),
                None => crate::policy::choose_codec(&record.path, config),
            };

            let codec_id = match codec_id {
                Some(id) => id,
                None => {
                    // Policy refuses this path (blacklisted extension or a
                    // mmap-sensitive binary prefix): leave the file raw with
                    // no container and never revisit the decision until the
                    // record goes idle again.
                    guard.dontcompress = true;
                    let n = state.fd.write_at(buf, off).map_err(CoreError::Io)?;
                    state.offset = off + n as u64;
                    guard.size = Some(state.offset);
                    return Ok(n);
                }
            };
            guard.codec = Some(codec_id);

            // Written with `write_at` (pwrite), not `container::write_header`'s
            // seek+write: a streaming writer below holds a `try_clone`'d fd
            // sharing this file's kernel offset, and a seek here would yank
            // that offset out from under its next buffered write.
            rewrite_header_in_place(&state.fd, codec_id, SIZE_UNKNOWN)?;

            let codec = codec::get_codec(codec_id)?;
            let mut dup = state.fd.try_clone().map_err(CoreError::Io)?;
            use std::io::{Seek, SeekFrom};
            dup.seek(SeekFrom::Start(container::HEADER_SIZE as u64)).map_err(CoreError::Io)?;
            let writer = codec.open_write(dup, config.compression_level, record.cancel.clone())?;
            state.handle = Some(DescriptorHandle::Writer(writer));
        }

        let n = match state.handle.as_mut().expect("handle just ensured present") {
            DescriptorHandle::Writer(w) => w.write(buf)?,
            DescriptorHandle::Reader(_) => {
                return Err(CoreError::CodecFailure("write on a read descriptor".into()))
            }
        };
        state.offset += n as u64;
        guard.size = Some(state.offset);

        let codec_id = guard.codec.expect("codec set above");
        rewrite_header_in_place(&state.fd, codec_id, state.offset)?;
        state.fd.seek_end()?;
        Ok(n)
    })();

    (guard, result)
}

/// `direct_close` (spec §4.4): close the codec handle and, if this was the
/// last descriptor, reset transient per-record state and restore the
/// backing file's access/modify times from before the close (a codec
/// flush on close may stamp the mtime, which must not leak to the caller).
pub fn close(record: &Arc<FileRecord>, descriptor: &Arc<Descriptor>, abs_path: &Path) -> CoreResult<()> {
    let stat_before = fs::metadata(abs_path).ok();

    {
        let mut state = descriptor.state();
        if let Some(handle) = state.handle.take() {
            close_handle(handle)?;
        }
    }

    let mut guard = record.lock();
    guard.descriptors.retain(|d| {
        d.upgrade()
            .map(|d| !Arc::ptr_eq(&d, descriptor))
            .unwrap_or(false)
    });

    if guard.is_idle() {
        guard.access_mode = AccessMode::Unset;
        guard.dontcompress = false;
    }
    drop(guard);

    if let Some(stat) = stat_before {
        let _ = dedup::restore_times(abs_path, stat.atime(), stat.mtime());
    }
    Ok(())
}

// ── Whole-file transcoding (spec §4.4.1) ─────────────────────────────────────

/// `do_compress(rec)`.
pub fn do_compress(record: &Arc<FileRecord>, abs_path: &Path, config: &Config) -> CoreResult<()> {
    let codec_id = match record.lock().codec {
        Some(id) => id,
        None => match crate::policy::choose_codec(&record.path, config) {
            Some(id) => id,
            None => {
                // Policy refuses this path; leave it raw rather than wrap it
                // in a null-codec container, which would still shift every
                // byte by `container::HEADER_SIZE`.
                record.lock().dontcompress = true;
                return Ok(());
            }
        },
    };

    {
        let mut guard = record.lock();
        guard.status |= COMPRESSING;
    }

    let outcome = transcode(abs_path, &record.cancel, |tmp_path, cancel| -> CoreResult<()> {
        let codec = codec::get_codec(codec_id)?;
        let mut input = File::open(abs_path).map_err(CoreError::Io)?;
        let mut output = File::create(tmp_path).map_err(CoreError::Io)?;
        container::write_header(&mut output, codec_id, 0)?;
        codec.compress_file(&mut input, &mut output, config.compression_level, cancel)
    });

    let mut guard = record.lock();
    let cancelled = guard.status & CANCEL != 0;
    match outcome {
        Ok(()) if !cancelled => {
            guard.codec = Some(codec_id);
            guard.size = fs::metadata(abs_path).ok().map(|m| m.len());
        }
        _ => {}
    }
    record.clear_status_and_notify(&mut guard, COMPRESSING | CANCEL);
    outcome
}

/// `do_decompress(rec)` — symmetric to `do_compress` (spec §4.4.1).
pub fn do_decompress(record: &Arc<FileRecord>, abs_path: &Path, _config: &Config) -> CoreResult<()> {
    {
        let mut guard = record.lock();
        guard.status |= DECOMPRESSING;
    }

    let codec_id = {
        let guard = record.lock();
        guard.codec
    };

    let outcome = match codec_id {
        None => Ok(()),
        Some(id) => transcode(abs_path, &record.cancel, |tmp_path, cancel| -> CoreResult<()> {
            let codec = codec::get_codec(id)?;
            let mut input = File::open(abs_path).map_err(CoreError::Io)?;
            let header = container::read_header(&mut input)?;
            let _ = header;
            let mut output = File::create(tmp_path).map_err(CoreError::Io)?;
            codec.decompress_file(&mut input, &mut output, cancel)
        }),
    };

    let mut guard = record.lock();
    let cancelled = guard.status & CANCEL != 0;
    match outcome {
        Ok(()) if !cancelled => {
            guard.codec = None;
            guard.size = fs::metadata(abs_path).ok().map(|m| m.len());
        }
        _ => {}
    }
    record.clear_status_and_notify(&mut guard, DECOMPRESSING | CANCEL);
    outcome
}

/// Shared scaffolding: run `body` against a sibling temp file, then
/// atomically rename it over `abs_path`, preserving mode/owner/times.
/// On cancellation or error the temp file is removed and `abs_path` is
/// left untouched. `cancel` must be the caller's `FileRecord::cancel` so a
/// `request()` from another thread is actually observed by the codec's
/// copy loop instead of a token nobody else can reach.
fn transcode(
    abs_path: &Path,
    cancel: &CancelToken,
    body: impl FnOnce(&Path, &CancelToken) -> CoreResult<()>,
) -> CoreResult<()> {
    let tmp_path = abs_path.with_extension(format!("transcode.{}", std::process::id()));

    let result = body(&tmp_path, cancel);

    match result {
        Ok(()) => {
            let meta = fs::metadata(abs_path).map_err(CoreError::Io)?;
            preserve_metadata(&tmp_path, &meta)?;
            fs::rename(&tmp_path, abs_path).map_err(CoreError::Io)?;
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            Err(e)
        }
    }
}

fn preserve_metadata(tmp_path: &Path, meta: &fs::Metadata) -> CoreResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(tmp_path, fs::Permissions::from_mode(meta.mode())).map_err(CoreError::Io)?;
    dedup::restore_times(tmp_path, meta.atime(), meta.mtime()).map_err(CoreError::Io)?;

    let c_path = std::ffi::CString::new(tmp_path.as_os_str().as_encoded_bytes())
        .map_err(|_| CoreError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has interior NUL")))?;
    let rc = unsafe { libc::chown(c_path.as_ptr(), meta.uid(), meta.gid()) };
    if rc != 0 {
        return Err(CoreError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

trait SeekEnd {
    fn seek_end(&mut self) -> CoreResult<()>;
}

impl SeekEnd for File {
    fn seek_end(&mut self) -> CoreResult<()> {
        use std::io::{Seek, SeekFrom};
        self.seek(SeekFrom::End(0)).map_err(CoreError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Descriptor;
    use std::io::Write as _;

    fn open_dup(path: &Path) -> File {
        fs::OpenOptions::new().read(true).write(true).open(path).unwrap()
    }

    #[test]
    fn compress_then_decompress_round_trips_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.txt");
        let original = b"the quick brown fox jumps over the lazy dog, repeatedly, many times over\n".repeat(200);
        fs::write(&path, &original).unwrap();

        let record = FileRecord::new("payload.txt".to_string());
        let config = Config::default();

        do_compress(&record, &path, &config).unwrap();
        assert!(record.lock().codec.is_some());
        let compressed_len = fs::metadata(&path).unwrap().len();
        assert!(compressed_len > 0);

        do_decompress(&record, &path, &config).unwrap();
        assert!(record.lock().codec.is_none());
        let roundtripped = fs::read(&path).unwrap();
        assert_eq!(roundtripped, original);
    }

    #[test]
    fn sequential_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seq.txt");
        fs::write(&path, b"").unwrap();

        let record = FileRecord::new("seq.txt".to_string());
        let config = Config::default();
        let dedup_index = DedupIndex::new();

        let fd = open_dup(&path);
        let descriptor = Descriptor::new(record.clone(), fd);
        record.lock().descriptors.push(Arc::downgrade(&descriptor));
        record.lock().size = Some(0);
        record.lock().access_mode = AccessMode::Writing;

        let payload = b"hello, world";
        let guard = record.lock();
        let (guard, result) = write(&record, guard, &descriptor, payload, 0, &path, &config, &dedup_index);
        result.unwrap();
        drop(guard);

        close(&record, &descriptor, &path).unwrap();

        let fd = open_dup(&path);
        let descriptor = Descriptor::new(record.clone(), fd);
        record.lock().descriptors.push(Arc::downgrade(&descriptor));
        record.lock().access_mode = AccessMode::Unset;

        let mut buf = vec![0u8; payload.len()];
        let guard = record.lock();
        let (_guard, result) = read(&record, guard, &descriptor, &mut buf, 0, &path, &config);
        let n = result.unwrap();
        assert_eq!(&buf[..n], payload);
    }
}
