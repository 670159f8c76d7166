//! `FileRecord` and `Descriptor` — the per-file and per-open-call state the
//! rest of the core revolves around (spec §3).
//!
//! The Design Notes (§9) describe the record/descriptor relationship as a
//! cyclic reference best modelled as "arena-allocated `FileRecord` values
//! owned by the `OpenTable`, with Descriptors holding stable indices (or
//! weak references)". `Arc<FileRecord>` is the idiomatic Rust realization
//! of that arena: it gives every holder a stable, refcounted handle without
//! an index table to keep in sync. A `Descriptor`'s owning-record reference
//! is itself behind a `Mutex` so `rename` (§4.3) can re-point it atomically.

use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use crate::cancel::CancelToken;
use crate::codec::{CodecReader, CodecWriter};

// ── Status bits (spec §3 `status`) ──────────────────────────────────────────

pub const COMPRESSING: u8 = 0b0001;
pub const DECOMPRESSING: u8 = 0b0010;
pub const DEDUPING: u8 = 0b0100;
pub const CANCEL: u8 = 0b1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Unset,
    Reading,
    Writing,
}

/// Sentinel for "logical size unknown" (spec §3: "the sentinel *unknown*
/// (-1)"). Kept as an `Option<u64>` in Rust; this constant only appears at
/// the container-header boundary (`container::SIZE_UNKNOWN`).
pub type Size = Option<u64>;

static NEXT_DESCRIPTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Everything about a `FileRecord` that lives behind its lock (spec §3).
pub struct FileRecordInner {
    pub size: Size,
    pub codec: Option<u8>,
    pub access_mode: AccessMode,
    pub dontcompress: bool,
    pub deleted: bool,
    pub deduped: bool,
    pub status: u8,
    pub skipped: u64,
    pub descriptors: Vec<Weak<Descriptor>>,
    /// Mirrors the "+1 for the background-queue reference" half of the
    /// refcount invariant (spec §3, §8).
    pub queued_for_background: bool,
}

impl FileRecordInner {
    fn new() -> Self {
        Self {
            size: None,
            codec: None,
            access_mode: AccessMode::Unset,
            dontcompress: false,
            deleted: false,
            deduped: false,
            status: 0,
            skipped: 0,
            descriptors: Vec::new(),
            queued_for_background: false,
        }
    }

    /// `refcount` per spec §3: live descriptors plus the background-queue
    /// reference, if any.
    pub fn refcount(&self) -> usize {
        let live_descriptors = self
            .descriptors
            .iter()
            .filter(|d| d.strong_count() > 0)
            .count();
        live_descriptors + usize::from(self.queued_for_background)
    }

    pub fn is_idle(&self) -> bool {
        self.refcount() == 0
    }
}

/// One backing file's coordination state (spec §3 `FileRecord`).
pub struct FileRecord {
    pub path: String,
    pub path_hash: u32,
    inner: Mutex<FileRecordInner>,
    pub cond: Condvar,
    /// Lock-free mirror of the `CANCEL` status bit for codec `testcancel`
    /// polling (spec §9 Design Notes).
    pub cancel: CancelToken,
}

impl FileRecord {
    pub fn new(path: String) -> Arc<Self> {
        let path_hash = crc32fast::hash(path.as_bytes());
        Arc::new(Self {
            path,
            path_hash,
            inner: Mutex::new(FileRecordInner::new()),
            cond: Condvar::new(),
            cancel: CancelToken::new(),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, FileRecordInner> {
        self.inner.lock().expect("FileRecord lock poisoned")
    }

    /// Block until `COMPRESSING`/`DECOMPRESSING` clear, requesting `CANCEL`
    /// to expedite it (spec §4.3 `open(path, want_stable=true)`). Must be
    /// called with the record lock held; returns with it still held.
    pub fn wait_until_stable<'a>(
        &'a self,
        mut guard: MutexGuard<'a, FileRecordInner>,
    ) -> MutexGuard<'a, FileRecordInner> {
        while guard.status & (COMPRESSING | DECOMPRESSING) != 0 {
            guard.status |= CANCEL;
            self.cancel.request();
            guard = self.cond.wait(guard).expect("FileRecord cond poisoned");
        }
        guard
    }

    /// Clear a status bit and wake every waiter (spec §3 `cond`: "broadcast
    /// whenever `status` loses a bit or `CANCEL` is acknowledged").
    pub fn clear_status_and_notify(&self, guard: &mut MutexGuard<'_, FileRecordInner>, bits: u8) {
        guard.status &= !bits;
        if bits & CANCEL != 0 {
            self.cancel.clear();
        }
        self.cond.notify_all();
    }
}

// ── Descriptor ───────────────────────────────────────────────────────────────

pub enum DescriptorHandle {
    Reader(Box<dyn CodecReader>),
    Writer(Box<dyn CodecWriter>),
}

/// The part of a `Descriptor` the Direct I/O Engine mutates while the
/// owning `FileRecord`'s lock is held (spec §4.4: "called under the
/// per-record lock"). It carries its own (uncontended) mutex purely so the
/// borrow checker has somewhere safe to put it; callers are expected to
/// only ever touch it after locking the owning record.
pub struct DescriptorState {
    pub fd: File,
    pub handle: Option<DescriptorHandle>,
    pub offset: u64,
}

/// One open-call's handle (spec §3 `Descriptor`).
pub struct Descriptor {
    pub id: u64,
    owner: Mutex<Arc<FileRecord>>,
    pub state: Mutex<DescriptorState>,
}

impl Descriptor {
    pub fn new(owner: Arc<FileRecord>, fd: File) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_DESCRIPTOR_ID.fetch_add(1, Ordering::Relaxed),
            owner: Mutex::new(owner),
            state: Mutex::new(DescriptorState {
                fd,
                handle: None,
                offset: 0,
            }),
        })
    }

    pub fn owner(&self) -> Arc<FileRecord> {
        self.owner.lock().expect("descriptor owner lock poisoned").clone()
    }

    /// Re-point this descriptor at a new owning record. Called by
    /// `OpenTable::rename` (spec §4.3) while both records' locks are held.
    pub fn reparent(&self, new_owner: Arc<FileRecord>) {
        *self.owner.lock().expect("descriptor owner lock poisoned") = new_owner;
    }

    pub fn state(&self) -> MutexGuard<'_, DescriptorState> {
        self.state.lock().expect("descriptor state lock poisoned")
    }
}
