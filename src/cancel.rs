//! Cooperative cancellation token (spec §5 "Cancellation & timeouts", §9
//! Design Notes: "CANCEL is best modelled as an explicit atomic flag
//! inspected by codec callbacks").
//!
//! A [`CancelToken`] is handed to a codec's streaming/whole-file calls so
//! they can poll it the way the original `testcancel` callback did, without
//! needing a reference back to the owning `FileRecord`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Equivalent to a codec's `testcancel`.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
