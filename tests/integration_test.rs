//! End-to-end scenarios exercising a mounted `CoreContext` against a real
//! temp directory with real threads.

use std::os::unix::fs::MetadataExt;
use std::sync::Arc;

use compressfs_core::record::AccessMode;
use compressfs_core::{Config, CoreContext};

fn mount(config: Config) -> (tempfile::TempDir, Arc<CoreContext>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let dir = tempfile::tempdir().unwrap();
    let ctx = CoreContext::mount(dir.path(), config).unwrap();
    (dir, ctx)
}

fn force_streaming_write(ctx: &CoreContext, path: &str) -> Arc<compressfs_core::Descriptor> {
    let descriptor = ctx.open(path).unwrap();
    let record = descriptor.owner();
    let mut guard = record.lock();
    guard.access_mode = AccessMode::Writing;
    guard.size = Some(0);
    drop(guard);
    descriptor
}

/// Scenario 1: sequential write then sequential read.
#[test]
fn sequential_write_then_read() {
    let (dir, ctx) = mount(Config::default());

    let payload: Vec<u8> = (0u16..=255).map(|b| b as u8).collect();
    let descriptor = force_streaming_write(&ctx, "a");
    let n = ctx.write(&descriptor, &payload, 0).unwrap();
    assert_eq!(n, payload.len());
    ctx.close(&descriptor).unwrap();

    let descriptor = ctx.open("a").unwrap();
    let mut buf = vec![0u8; payload.len()];
    let n = ctx.read(&descriptor, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], payload.as_slice());
    ctx.close(&descriptor).unwrap();

    let on_disk = std::fs::read(dir.path().join("a")).unwrap();
    assert_eq!(&on_disk[0..3], &[0x1F, 0x5D, 0x89]);

    ctx.unmount().unwrap();
}

/// Scenario 2: a burst of non-sequential reads past the fallback threshold
/// forces a switch to raw positional reads, and every read — streamed or
/// raw — still returns the correct slice of the original content.
#[test]
fn random_read_triggers_fallback_to_raw_positional() {
    let mut config = Config::default();
    config.min_filesize_background = u64::MAX; // keep the worker out of this test's way
    let (_dir, ctx) = mount(config);

    let size = 256 * 1024usize;
    let mut content = vec![0u8; size];
    for (i, b) in content.iter_mut().enumerate() {
        *b = if i % 2 == 0 { 0xAA } else { 0x55 };
    }

    let descriptor = force_streaming_write(&ctx, "pattern.bin");
    ctx.write(&descriptor, &content, 0).unwrap();
    ctx.close(&descriptor).unwrap();

    let descriptor = ctx.open("pattern.bin").unwrap();

    let mut buf = [0u8; 4096];
    let n = ctx.read(&descriptor, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], &content[0..n]);

    // Stand in for the bookkeeping a long run of non-sequential reads would
    // have accumulated, rather than churning through enough real drains to
    // cross the `skipped > 3 * size` threshold.
    descriptor.owner().lock().skipped = 4 * size as u64;

    let off = 200_000usize;
    let n = ctx.read(&descriptor, &mut buf, off as u64).unwrap();
    assert_eq!(&buf[..n], &content[off..off + n]);

    // Crossing the threshold forces a whole-file decompress to raw, which
    // clears `skipped` and invalidates the cached size.
    let guard = descriptor.owner().lock();
    assert_eq!(guard.skipped, 0);
    assert!(guard.size.is_none());
    drop(guard);

    let n = ctx.read(&descriptor, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], &content[0..n]);

    ctx.close(&descriptor).unwrap();
    ctx.unmount().unwrap();
}

/// Scenario 4: a background compress that observes cancellation mid-stream
/// leaves the backing file untouched, and a `want_stable` open unblocks
/// once the worker clears `COMPRESSING`.
#[test]
fn cancellation_during_background_compression_is_observed() {
    let (dir, ctx) = mount(Config::default());

    // A file already sitting on the backing store raw, never streamed
    // through `write()`, is exactly what the background worker picks up:
    // a record with no codec decided yet.
    let path = "big.log";
    let content: Vec<u8> = (0..10 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(dir.path().join(path), &content).unwrap();

    let record = ctx.open_table.open(path, false);
    ctx.open_table.purge(dir.path(), &ctx.config, &ctx.background, true);

    let start = std::time::Instant::now();
    while record.lock().status & compressfs_core::record::COMPRESSING == 0 {
        assert!(start.elapsed() < std::time::Duration::from_secs(5), "worker never started compressing");
        std::thread::yield_now();
    }

    // want_stable=true requests cancellation and blocks until the worker
    // observes it and clears COMPRESSING.
    let stable = ctx.open_table.open(path, true);
    assert!(Arc::ptr_eq(&stable, &record));
    assert_eq!(stable.lock().status & compressfs_core::record::COMPRESSING, 0);

    // A cancelled compress must never have replaced the original content.
    assert_eq!(std::fs::read(dir.path().join(path)).unwrap(), content);

    ctx.unmount().unwrap();
}

/// Scenario 3: an overwrite on a hard-linked, deduplicated file forces
/// undedup and leaves the sibling untouched.
#[test]
fn overwrite_forces_undedup() {
    let (dir, ctx) = mount(Config::default());

    let content = vec![0x7Au8; 64 * 1024];
    std::fs::write(dir.path().join("x"), &content).unwrap();
    std::fs::write(dir.path().join("y"), &content).unwrap();

    let x_record = ctx.open_table.open("x", false);
    let y_record = ctx.open_table.open("y", false);
    compressfs_core::dedup::do_dedup(&x_record, &ctx.dedup, dir.path(), &dir.path().join("x")).unwrap();
    compressfs_core::dedup::do_dedup(&y_record, &ctx.dedup, dir.path(), &dir.path().join("y")).unwrap();

    assert_eq!(std::fs::metadata(dir.path().join("x")).unwrap().nlink(), 2);
    assert_eq!(std::fs::metadata(dir.path().join("y")).unwrap().nlink(), 2);

    let descriptor = ctx.open("y").unwrap();
    {
        let mut guard = descriptor.owner().lock();
        guard.access_mode = AccessMode::Writing;
        guard.deduped = true;
    }
    ctx.write(&descriptor, b"Z", 0).unwrap();
    ctx.close(&descriptor).unwrap();

    assert_eq!(std::fs::metadata(dir.path().join("x")).unwrap().nlink(), 1);
    assert_eq!(std::fs::metadata(dir.path().join("y")).unwrap().nlink(), 1);
    assert_eq!(std::fs::read(dir.path().join("x")).unwrap(), content);

    let y_after = std::fs::read(dir.path().join("y")).unwrap();
    assert_eq!(y_after[0], b'Z');
    assert_eq!(&y_after[1..], &content[1..]);

    ctx.unmount().unwrap();
}

/// Scenario 5: the dedup index survives an unmount/remount cycle.
#[test]
fn dedup_persists_across_remount() {
    let dir = tempfile::tempdir().unwrap();

    {
        let ctx = CoreContext::mount(dir.path(), Config::default()).unwrap();
        for (name, byte) in [("one", 1u8), ("two", 2u8), ("three", 3u8)] {
            let path = dir.path().join(name);
            std::fs::write(&path, vec![byte; 4096]).unwrap();
            let record = ctx.open_table.open(name, false);
            compressfs_core::dedup::do_dedup(&record, &ctx.dedup, dir.path(), &path).unwrap();
        }
        assert_eq!(ctx.dedup.len(), 3);
        ctx.unmount().unwrap();
    }

    let before_db = dir.path().join(compressfs_core::dedup::DEDUP_DB_FILENAME);
    assert!(before_db.exists(), "unmount should persist the dedup db");

    let ctx = CoreContext::mount(dir.path(), Config::default()).unwrap();
    assert_eq!(ctx.dedup.len(), 3);
    assert!(!before_db.exists(), "mount-time load must delete the on-disk copy");
    ctx.unmount().unwrap();
}

/// Scenario 6: renaming a file while a descriptor is open migrates the
/// descriptor's owning record; subsequent writes on that descriptor are
/// visible under the new name, and the old path's record is deleted with
/// zero refcount.
#[test]
fn rename_through_the_open_table_while_live() {
    let (_dir, ctx) = mount(Config::default());

    let descriptor = force_streaming_write(&ctx, "f");
    ctx.write(&descriptor, b"first half ", 0).unwrap();

    ctx.rename("f", "g").unwrap();

    let old_record = ctx.open_table.find("f");
    assert!(old_record.is_none(), "old path should no longer resolve in the table");

    let new_record = ctx.open_table.find("g").expect("renamed record present");
    assert!(Arc::ptr_eq(&descriptor.owner(), &new_record));

    let offset_before = descriptor.state().offset;
    ctx.write(&descriptor, b"second half", offset_before).unwrap();
    ctx.close(&descriptor).unwrap();

    let on_disk = std::fs::read(_dir.path().join("g")).unwrap();
    assert!(on_disk.len() > 0);
    assert!(!_dir.path().join("f").exists());

    ctx.unmount().unwrap();
}
