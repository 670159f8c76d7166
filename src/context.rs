//! `CoreContext` (spec §9 Design Notes): "isolate behind a single
//! `CoreContext` value created at mount time and torn down at unmount; no
//! ambient globals." This is the crate's single public entry point —
//! everything else (the open table, the background queue, the dedup index,
//! the codec registry, the config) hangs off it.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::background::BackgroundQueue;
use crate::config::Config;
use crate::dedup::{self, DedupIndex};
use crate::error::{CoreError, CoreResult};
use crate::io_engine;
use crate::open_table::OpenTable;
use crate::record::{Descriptor, FileRecord};

pub struct CoreContext {
    root: PathBuf,
    pub config: Arc<Config>,
    pub open_table: OpenTable,
    pub background: Arc<BackgroundQueue>,
    pub dedup: Arc<DedupIndex>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CoreContext {
    /// `mount(root, config)`: load the persisted dedup index (if enabled)
    /// and start the background worker.
    pub fn mount(root: impl Into<PathBuf>, config: Config) -> CoreResult<Arc<Self>> {
        let root = root.into();
        let config = Arc::new(config);

        let dedup = Arc::new(if config.dedup_enabled {
            let db_path = root.join(dedup::DEDUP_DB_FILENAME);
            DedupIndex::load(&db_path).map_err(CoreError::Io)?
        } else {
            DedupIndex::new()
        });

        let background = Arc::new(BackgroundQueue::new());

        let ctx = Arc::new(Self {
            root: root.clone(),
            config: config.clone(),
            open_table: OpenTable::new(),
            background: background.clone(),
            dedup: dedup.clone(),
            worker: Mutex::new(None),
        });

        let handle = thread::spawn(move || worker_loop(background, dedup, config, root));
        *ctx.worker.lock().expect("worker lock poisoned") = Some(handle);

        Ok(ctx)
    }

    /// `unmount()`: force-purge the open table, stop the worker, and — if
    /// dedup is enabled — persist the index (spec §4.5 "rewritten on clean
    /// unmount").
    pub fn unmount(&self) -> CoreResult<()> {
        self.open_table.purge(&self.root, &self.config, &self.background, true);
        self.background.shutdown();
        if let Some(handle) = self.worker.lock().expect("worker lock poisoned").take() {
            let _ = handle.join();
        }
        if self.config.dedup_enabled {
            let db_path = self.root.join(dedup::DEDUP_DB_FILENAME);
            self.dedup.save(&db_path).map_err(CoreError::Io)?;
        }
        Ok(())
    }

    pub fn abs_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// `open(path, want_stable=true)` (spec §4.3) plus a fresh `Descriptor`
    /// against the backing file.
    pub fn open(&self, path: &str) -> CoreResult<Arc<Descriptor>> {
        let record = self.open_table.open(path, true);
        let abs = self.abs_path(path);
        let fd = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&abs)
            .map_err(CoreError::Io)?;
        let descriptor = Descriptor::new(record.clone(), fd);
        record.lock().descriptors.push(Arc::downgrade(&descriptor));
        Ok(descriptor)
    }

    pub fn read(&self, descriptor: &Arc<Descriptor>, buf: &mut [u8], off: u64) -> CoreResult<usize> {
        let record = descriptor.owner();
        let abs = self.abs_path(&record.path);
        let guard = record.lock();
        let (_guard, result) = io_engine::read(&record, guard, descriptor, buf, off, &abs, &self.config);
        result
    }

    pub fn write(&self, descriptor: &Arc<Descriptor>, buf: &[u8], off: u64) -> CoreResult<usize> {
        let record = descriptor.owner();
        let abs = self.abs_path(&record.path);
        let guard = record.lock();
        let (_guard, result) =
            io_engine::write(&record, guard, descriptor, buf, off, &abs, &self.config, &self.dedup);
        result
    }

    /// `direct_close` (spec §4.4), followed by a purge pass so a newly idle
    /// record is either handed to the background queue or evicted.
    pub fn close(&self, descriptor: &Arc<Descriptor>) -> CoreResult<()> {
        let record = descriptor.owner();
        let abs = self.abs_path(&record.path);
        io_engine::close(&record, descriptor, &abs)?;
        self.open_table.purge(&self.root, &self.config, &self.background, false);
        Ok(())
    }

    /// Unlink the backing file and mark its record `delete`d (spec §4.3
    /// `delete`).
    pub fn unlink(&self, path: &str) -> CoreResult<()> {
        if let Some(record) = self.open_table.find(path) {
            self.open_table.delete(&record);
        }
        self.dedup.discard(path);
        let abs = self.abs_path(path);
        fs::remove_file(&abs).map_err(CoreError::Io)
    }

    /// `rename(from, to)` (spec §4.3): move the backing file, then migrate
    /// the open-file-table and dedup-index state onto the new path.
    pub fn rename(&self, from: &str, to: &str) -> CoreResult<()> {
        let abs_from = self.abs_path(from);
        let abs_to = self.abs_path(to);
        fs::rename(&abs_from, &abs_to).map_err(CoreError::Io)?;
        self.open_table.rename(from, to, &self.background, &self.dedup);
        Ok(())
    }
}

/// The single background worker thread (spec §4.5): park on the queue,
/// compress then optionally dedup each idle candidate, release it.
fn worker_loop(queue: Arc<BackgroundQueue>, dedup: Arc<DedupIndex>, config: Arc<Config>, root: PathBuf) {
    while let Some(record) = queue.pop_blocking() {
        let eligible = {
            let guard = record.lock();
            guard.refcount() == 1 && !guard.deleted && guard.codec.is_none()
        };

        if eligible {
            let abs_path = root.join(&record.path);
            match io_engine::do_compress(&record, &abs_path, &config) {
                Ok(()) if config.dedup_enabled => {
                    if let Err(e) = dedup::do_dedup(&record, &dedup, &root, &abs_path) {
                        tracing::warn!(path = %record.path, error = %e, "background dedup failed");
                    }
                }
                Ok(()) => {}
                Err(e) => {
                    tracing::warn!(path = %record.path, error = %e, "background compress failed");
                }
            }
        }

        record.lock().queued_for_background = false;
    }
}
