//! The background compression queue (spec §4.3 `purge`, §4.5, §9 Design
//! Notes: "a bounded channel plus a small worker pool is the natural Rust
//! shape for the background queue").
//!
//! `BackgroundQueue` itself only holds the work list; the worker loop that
//! drains it lives in [`crate::context::CoreContext`], since draining an
//! entry requires the codec registry, the dedup index and the backing root
//! path together.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::record::FileRecord;

struct BackgroundQueueInner {
    queue: VecDeque<Arc<FileRecord>>,
    shutdown: bool,
}

pub struct BackgroundQueue {
    inner: Mutex<BackgroundQueueInner>,
    cond: Condvar,
}

impl BackgroundQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BackgroundQueueInner {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn push(&self, record: Arc<FileRecord>) {
        let mut guard = self.inner.lock().expect("background queue lock poisoned");
        guard.queue.push_back(record);
        self.cond.notify_one();
    }

    /// Block until an entry is available or [`Self::shutdown`] has been
    /// called, in which case `None` is returned.
    pub fn pop_blocking(&self) -> Option<Arc<FileRecord>> {
        let mut guard = self.inner.lock().expect("background queue lock poisoned");
        loop {
            if let Some(record) = guard.queue.pop_front() {
                return Some(record);
            }
            if guard.shutdown {
                return None;
            }
            guard = self.cond.wait(guard).expect("background queue cond poisoned");
        }
    }

    /// Replace every queued reference to `from` with `to` (spec §4.3
    /// `rename`: the background-queue reference migrates along with the
    /// descriptors).
    pub fn reparent(&self, from: &Arc<FileRecord>, to: Arc<FileRecord>) {
        let mut guard = self.inner.lock().expect("background queue lock poisoned");
        for entry in guard.queue.iter_mut() {
            if Arc::ptr_eq(entry, from) {
                *entry = to.clone();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("background queue lock poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake the worker thread and tell it to stop once the queue drains
    /// (spec §7 `unmount`).
    pub fn shutdown(&self) {
        self.inner.lock().expect("background queue lock poisoned").shutdown = true;
        self.cond.notify_all();
    }
}

impl Default for BackgroundQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop_returns_same_record() {
        let queue = BackgroundQueue::new();
        let record = FileRecord::new("foo".to_string());
        queue.push(record.clone());
        let popped = queue.pop_blocking().unwrap();
        assert!(Arc::ptr_eq(&record, &popped));
    }

    #[test]
    fn shutdown_unblocks_pop() {
        let queue = BackgroundQueue::new();
        queue.shutdown();
        assert!(queue.pop_blocking().is_none());
    }

    #[test]
    fn reparent_swaps_queued_reference() {
        let queue = BackgroundQueue::new();
        let from = FileRecord::new("a".to_string());
        let to = FileRecord::new("b".to_string());
        queue.push(from.clone());
        queue.reparent(&from, to.clone());
        let popped = queue.pop_blocking().unwrap();
        assert!(Arc::ptr_eq(&to, &popped));
    }
}
