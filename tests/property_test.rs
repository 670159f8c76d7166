//! Property tests for the invariants in §8: refcount accounting, dedup
//! idempotence, dedup persistence round-tripping, the compress/decompress
//! exclusion, the write offset/size invariant, and whole-file round-trips.

use std::sync::Arc;

use proptest::prelude::*;

use compressfs_core::config::Config;
use compressfs_core::dedup::DedupIndex;
use compressfs_core::record::{AccessMode, Descriptor, FileRecord};
use compressfs_core::{io_engine, CoreContext};

proptest! {
    /// `R.refcount == |R.descriptors| + (1 if queued for background else 0)`
    /// holds after any sequence of attach/detach/enqueue/dequeue operations.
    #[test]
    fn refcount_matches_live_descriptors_plus_queue_flag(
        attach_count in 0usize..6,
        queued in any::<bool>(),
        drop_mask in prop::collection::vec(any::<bool>(), 0..6),
    ) {
        let record = FileRecord::new("prop".to_string());
        let mut descriptors = Vec::new();
        for _ in 0..attach_count {
            let fd = tempfile::tempfile().unwrap();
            let descriptor = Descriptor::new(record.clone(), fd);
            record.lock().descriptors.push(Arc::downgrade(&descriptor));
            descriptors.push(descriptor);
        }
        record.lock().queued_for_background = queued;

        let mut live = descriptors.len();
        for (i, drop_it) in drop_mask.iter().enumerate() {
            if *drop_it && i < descriptors.len() {
                // Overwriting the slot drops the sole strong `Arc`, so the
                // record's `Weak` for it goes dead without ever being
                // explicitly removed from `descriptors`.
                descriptors[i] = Descriptor::new(record.clone(), tempfile::tempfile().unwrap());
                live -= 1;
            }
        }

        let guard = record.lock();
        prop_assert_eq!(guard.refcount(), live + usize::from(queued));
    }
}

proptest! {
    /// Inserting the same (digest, path) pair twice never changes what a
    /// lookup by digest returns (dedup idempotence, applied to the index
    /// layer rather than the full `do_dedup` I/O path).
    #[test]
    fn repeated_insert_is_idempotent(digest in prop::array::uniform16(any::<u8>()), path in "[a-z]{1,12}") {
        let index = DedupIndex::new();
        index.insert(digest, path.clone());
        let first = index.lookup_by_digest(&digest).unwrap().path.clone();
        index.insert(digest, path.clone());
        let second = index.lookup_by_digest(&digest).unwrap().path.clone();
        prop_assert_eq!(first, second);
        prop_assert_eq!(index.len(), 1);
    }
}

proptest! {
    /// `COMPRESSING` and `DECOMPRESSING` never overlap: at every point a
    /// concurrent observer can inspect `status` while a transcode is in
    /// flight, at most one of the two bits is set.
    #[test]
    fn compressing_and_decompressing_never_overlap(size_kb in 64usize..256) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, vec![0x42u8; size_kb * 1024]).unwrap();

        let record = FileRecord::new("payload.bin".to_string());
        let config = Config::default();

        let r = record.clone();
        let p = path.clone();
        let c = config.clone();
        let handle = std::thread::spawn(move || io_engine::do_compress(&r, &p, &c));

        while !handle.is_finished() {
            let status = record.lock().status;
            prop_assert!(
                status & compressfs_core::record::COMPRESSING == 0
                    || status & compressfs_core::record::DECOMPRESSING == 0
            );
            std::thread::yield_now();
        }
        handle.join().unwrap().unwrap();
        prop_assert_eq!(record.lock().status, 0);
    }
}

proptest! {
    /// After a successful streaming write of `k > 0` bytes at an offset
    /// equal to the descriptor's current position, both the descriptor's
    /// offset and the record's declared size advance by exactly `k`.
    #[test]
    fn write_advances_offset_and_size_together(payload in prop::collection::vec(any::<u8>(), 1..4096)) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.bin");
        std::fs::write(&path, b"").unwrap();

        let record = FileRecord::new("w.bin".to_string());
        let config = Config::default();
        let dedup_index = DedupIndex::new();

        let fd = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let descriptor = Descriptor::new(record.clone(), fd);
        record.lock().descriptors.push(Arc::downgrade(&descriptor));
        record.lock().size = Some(0);
        record.lock().access_mode = AccessMode::Writing;

        let guard = record.lock();
        let (guard, result) = io_engine::write(&record, guard, &descriptor, &payload, 0, &path, &config, &dedup_index);
        let n = result.unwrap();

        prop_assert!(n > 0);
        prop_assert_eq!(descriptor.state().offset, n as u64);
        prop_assert_eq!(guard.size, Some(n as u64));
    }
}

proptest! {
    /// Writing an arbitrary byte sequence through `CoreContext` and reading
    /// the whole file back reproduces it exactly, regardless of which codec
    /// the policy layer happens to choose for the path.
    #[test]
    fn round_trips_arbitrary_bytes(payload in prop::collection::vec(any::<u8>(), 0..8192)) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CoreContext::mount(dir.path(), Config::default()).unwrap();

        let descriptor = ctx.open("roundtrip.bin").unwrap();
        {
            let mut guard = descriptor.owner().lock();
            guard.access_mode = AccessMode::Writing;
            guard.size = Some(0);
        }
        ctx.write(&descriptor, &payload, 0).unwrap();
        ctx.close(&descriptor).unwrap();

        let descriptor = ctx.open("roundtrip.bin").unwrap();
        let mut buf = vec![0u8; payload.len()];
        let n = ctx.read(&descriptor, &mut buf, 0).unwrap();
        prop_assert_eq!(n, payload.len());
        prop_assert_eq!(&buf[..n], payload.as_slice());
        ctx.close(&descriptor).unwrap();
        ctx.unmount().unwrap();
    }
}

proptest! {
    /// `dedup_save` followed by `dedup_load` yields an index equal to the
    /// saved digest→path mapping.
    #[test]
    fn save_load_round_trips_arbitrary_sets(
        entries in prop::collection::hash_map(
            "[a-z]{1,10}",
            prop::array::uniform16(any::<u8>()),
            0..8,
        )
    ) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("dedup_db_prop");

        let index = DedupIndex::new();
        for (path, digest) in &entries {
            index.insert(*digest, path.clone());
        }
        index.save(&db_path).unwrap();

        let loaded = DedupIndex::load(&db_path).unwrap();
        let mut expected: Vec<([u8; 16], String)> =
            entries.into_iter().map(|(path, digest)| (digest, path)).collect();
        let mut actual = loaded.snapshot();
        expected.sort();
        actual.sort();
        prop_assert_eq!(expected, actual);
    }
}
