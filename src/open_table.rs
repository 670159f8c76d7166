//! The Open-File Table (spec §3, §4.3): the single map from backing-relative
//! path to the live `FileRecord` for it, plus the operations (`open`,
//! `delete`, `rename`, `purge`) that keep it coherent under concurrent use.
//!
//! Lock order (spec §5): this table's lock is always acquired before any
//! individual `FileRecord`'s lock.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::background::BackgroundQueue;
use crate::config::Config;
use crate::dedup::{self, DedupIndex};
use crate::record::FileRecord;

pub struct OpenTable {
    entries: Mutex<HashMap<String, Arc<FileRecord>>>,
}

impl OpenTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("open table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `open(path, want_stable)` (spec §4.3): find-or-create the record for
    /// `path`. When `want_stable` is set, block until any in-flight
    /// background compression/decompression has cleared before returning,
    /// requesting cancellation to expedite it.
    pub fn open(&self, path: &str, want_stable: bool) -> Arc<FileRecord> {
        let record = {
            let mut entries = self.entries.lock().expect("open table lock poisoned");
            entries
                .entry(path.to_string())
                .or_insert_with(|| FileRecord::new(path.to_string()))
                .clone()
        };

        if want_stable {
            let guard = record.lock();
            let _guard = record.wait_until_stable(guard);
        }

        record
    }

    pub fn find(&self, path: &str) -> Option<Arc<FileRecord>> {
        self.entries.lock().expect("open table lock poisoned").get(path).cloned()
    }

    /// `delete(record)` (spec §4.3): mark the record's backing file gone.
    /// The record stays in the table (other descriptors may still reference
    /// it) until the next `purge` finds it idle.
    pub fn delete(&self, record: &Arc<FileRecord>) {
        let mut guard = record.lock();
        guard.deleted = true;
        guard.size = None;
    }

    /// `rename(from, to)` (spec §4.3): re-home every live descriptor and
    /// background-queue reference from the record at `from` onto a fresh
    /// record at `to`, then update the dedup index's path binding.
    ///
    /// A record's `path` is immutable once constructed, so rename works by
    /// building the successor record and migrating state onto it rather
    /// than mutating `from`'s path in place.
    pub fn rename(&self, from: &str, to: &str, queue: &BackgroundQueue, dedup: &DedupIndex) {
        let from_record = {
            let mut entries = self.entries.lock().expect("open table lock poisoned");
            match entries.remove(from) {
                Some(r) => r,
                None => return,
            }
        };

        let to_record = FileRecord::new(to.to_string());

        {
            let mut from_guard = from_record.lock();
            let mut to_guard = to_record.lock();

            to_guard.size = from_guard.size;
            to_guard.codec = from_guard.codec;
            to_guard.access_mode = from_guard.access_mode;
            to_guard.dontcompress = from_guard.dontcompress;
            to_guard.deduped = from_guard.deduped;

            for weak in from_guard.descriptors.drain(..) {
                if let Some(descriptor) = weak.upgrade() {
                    descriptor.reparent(to_record.clone());
                    to_guard.descriptors.push(Arc::downgrade(&descriptor));
                }
            }

            if from_guard.queued_for_background {
                to_guard.queued_for_background = true;
                queue.reparent(&from_record, to_record.clone());
            }

            from_guard.deleted = true;
        }

        dedup.rename(from, to);

        let mut entries = self.entries.lock().expect("open table lock poisoned");
        entries.insert(to.to_string(), to_record);
    }

    /// `purge(force)` (spec §4.3): walk every idle record, and for each one
    /// either hand it to the background queue for compression (if the
    /// policy, size threshold, and backing free space all say so) or drop it
    /// from the table. `force` additionally evicts idle records regardless
    /// of the soft open-count target having been reached. `root` is the
    /// mount root, needed to resolve a record's relative path into a real
    /// filesystem path for the free-space check.
    pub fn purge(&self, root: &Path, config: &Config, queue: &BackgroundQueue, force: bool) {
        let candidates: Vec<Arc<FileRecord>> = {
            let entries = self.entries.lock().expect("open table lock poisoned");
            if !force && entries.len() <= config.max_open_soft_target + queue.len() {
                return;
            }
            entries.values().cloned().collect()
        };

        for record in candidates {
            let should_evict = {
                let mut guard = record.lock();
                if !guard.is_idle() || guard.status != 0 {
                    continue;
                }

                if !guard.deleted && !guard.dontcompress && guard.codec.is_none() {
                    if crate::policy::choose_codec(&record.path, config).is_none() {
                        guard.dontcompress = true;
                    } else {
                        let eligible_size = match guard.size {
                            Some(size) => size >= config.min_filesize_background,
                            None => true,
                        };
                        let has_space = match guard.size {
                            Some(size) => dedup::free_space_bytes(&root.join(&record.path))
                                .map(|free| free >= size)
                                .unwrap_or(false),
                            None => true,
                        };
                        if eligible_size && has_space {
                            guard.queued_for_background = true;
                            drop(guard);
                            queue.push(record.clone());
                            continue;
                        }
                    }
                }
                true
            };

            if should_evict {
                let mut entries = self.entries.lock().expect("open table lock poisoned");
                if let Some(current) = entries.get(&record.path) {
                    if Arc::ptr_eq(current, &record) {
                        let still_idle = record.lock().is_idle();
                        if still_idle {
                            entries.remove(&record.path);
                        }
                    }
                }
            }
        }
    }
}

impl Default for OpenTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_is_idempotent_for_same_path() {
        let table = OpenTable::new();
        let a = table.open("foo", false);
        let b = table.open("foo", false);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_paths_get_distinct_records() {
        let table = OpenTable::new();
        let a = table.open("foo", false);
        let b = table.open("bar", false);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn purge_evicts_idle_dontcompress_records() {
        let table = OpenTable::new();
        let queue = BackgroundQueue::new();
        let config = Config::default();

        let record = table.open("foo", false);
        record.lock().dontcompress = true;

        let dir = tempfile::tempdir().unwrap();
        table.purge(dir.path(), &config, &queue, true);
        assert!(table.find("foo").is_none());
    }

    #[test]
    fn rename_moves_the_record() {
        let table = OpenTable::new();
        let queue = BackgroundQueue::new();
        let dedup = DedupIndex::new();

        let from = table.open("old", false);
        from.lock().codec = Some(crate::codec::CODEC_GZIP);

        table.rename("old", "new", &queue, &dedup);

        assert!(table.find("old").is_none());
        let moved = table.find("new").expect("renamed record present");
        assert_eq!(moved.lock().codec, Some(crate::codec::CODEC_GZIP));
    }
}
