//! Versioned render-queue handoff between housekeeping and the callback.
//!
//! Three boxed snapshots circulate: the writer owns the `target` it is
//! building, the reader owns the `rendering` one it is mixing from, and the
//! third sits in the shared `ready` slot. Publishing swaps `target` into
//! `ready`; the reader swaps its `rendering` snapshot with `ready` whenever
//! the published version is newer than its own. Every swap moves ownership
//! of a whole snapshot, so neither side ever sees a list the other is
//! editing, and the reader never drops a context reference: snapshots it
//! gives up are cleared by the writer on its next publish.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use crate::handle::StreamRendering;

/// Most contexts a single stream renders per callback.
pub const MAX_QUEUED_RENDERINGS: usize = 256;

pub type RenderList = heapless::Vec<Arc<dyn StreamRendering>, MAX_QUEUED_RENDERINGS>;

struct Snapshot {
    version: u64,
    entries: RenderList,
}

impl Snapshot {
    fn boxed() -> *mut Snapshot {
        Box::into_raw(Box::new(Snapshot {
            version: 0,
            entries: RenderList::new(),
        }))
    }
}

struct Shared {
    ready: AtomicPtr<Snapshot>,
    /// Version of the snapshot most recently swapped into `ready`.
    published: AtomicU64,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let ready = *self.ready.get_mut();
        if !ready.is_null() {
            // SAFETY: `ready` always holds a pointer from `Box::into_raw`
            // that no other owner refers to once both halves are gone.
            drop(unsafe { Box::from_raw(ready) });
        }
    }
}

/// Create a connected writer/reader pair. The first published version is 1.
pub fn render_queue() -> (QueueWriter, QueueReader) {
    let shared = Arc::new(Shared {
        ready: AtomicPtr::new(Snapshot::boxed()),
        published: AtomicU64::new(0),
    });
    let writer = QueueWriter {
        shared: shared.clone(),
        target: Snapshot::boxed(),
        version: 0,
    };
    let reader = QueueReader {
        shared,
        rendering: Snapshot::boxed(),
    };
    (writer, reader)
}

/// Housekeeping half: builds and publishes snapshots.
pub struct QueueWriter {
    shared: Arc<Shared>,
    /// Owned exclusively by the writer.
    target: *mut Snapshot,
    version: u64,
}

// SAFETY: the writer is the sole owner of `target`; snapshot contents are
// `Send + Sync`.
unsafe impl Send for QueueWriter {}

impl QueueWriter {
    /// The list that the next `publish` makes visible.
    pub fn target_mut(&mut self) -> &mut RenderList {
        // SAFETY: `target` is owned by this writer and never shared until
        // swapped out in `publish`.
        unsafe { &mut (*self.target).entries }
    }

    /// Hand the target to the reader and start a fresh, empty target.
    /// Returns the published version.
    pub fn publish(&mut self) -> u64 {
        self.version += 1;
        // SAFETY: see `target_mut`.
        unsafe { (*self.target).version = self.version };

        let previous = self.shared.ready.swap(self.target, Ordering::AcqRel);
        self.shared.published.store(self.version, Ordering::Release);
        self.target = previous;

        // SAFETY: the swap transferred ownership of `previous` to us; the
        // reader only reaches snapshots through `ready`.
        unsafe { (*self.target).entries.clear() };
        self.version
    }

    /// Last version published.
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl Drop for QueueWriter {
    fn drop(&mut self) {
        // SAFETY: owned exclusively, see `target_mut`.
        drop(unsafe { Box::from_raw(self.target) });
        self.target = ptr::null_mut();
    }
}

/// Callback half: picks up newer snapshots without blocking.
pub struct QueueReader {
    shared: Arc<Shared>,
    /// Owned exclusively by the reader.
    rendering: *mut Snapshot,
}

// SAFETY: the reader is the sole owner of `rendering`; snapshot contents
// are `Send + Sync`.
unsafe impl Send for QueueReader {}

impl QueueReader {
    /// Swap in the newest published snapshot, if any, and return the
    /// contexts to render. One load and at most one atomic swap.
    pub fn acquire(&mut self) -> &[Arc<dyn StreamRendering>] {
        if self.shared.published.load(Ordering::Acquire) > self.version() {
            self.rendering = self.shared.ready.swap(self.rendering, Ordering::AcqRel);
        }
        // SAFETY: `rendering` is owned by this reader.
        unsafe { &(*self.rendering).entries }
    }

    /// Version of the snapshot currently rendered from.
    pub fn version(&self) -> u64 {
        // SAFETY: `rendering` is owned by this reader.
        unsafe { (*self.rendering).version }
    }
}

impl Drop for QueueReader {
    fn drop(&mut self) {
        // SAFETY: owned exclusively, see `acquire`.
        drop(unsafe { Box::from_raw(self.rendering) });
        self.rendering = ptr::null_mut();
    }
}
