//! Pool of reusable PCM byte buffers.
//!
//! Buffers are taken on the caller's or the housekeeping thread and come
//! back through the housekeeping thread. The audio callback only ever moves
//! a buffer it already holds into a ring; it never touches the pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// A pooled byte buffer plus how much of it holds valid PCM.
#[derive(Debug, Default)]
pub struct PcmBuffer {
    data: Vec<u8>,
    filled: usize,
}

impl PcmBuffer {
    pub fn with_len(bytes: usize) -> Self {
        Self {
            data: vec![0; bytes],
            filled: 0,
        }
    }

    /// Usable size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The valid PCM.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    pub fn filled_len(&self) -> usize {
        self.filled
    }

    /// The whole buffer, for writing into.
    pub fn space_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Mark the first `bytes` as valid, clamped to the buffer length.
    pub fn set_filled(&mut self, bytes: usize) {
        self.filled = bytes.min(self.data.len());
    }

    fn reshape(&mut self, bytes: usize) {
        self.data.resize(bytes, 0);
        self.filled = 0;
    }
}

/// A bounded pool of [`PcmBuffer`]s.
///
/// `capacity` caps how many buffers may be out at once; `acquire` fails
/// instead of growing past it. Returned buffers are cached for reuse until
/// [`BufferPool::trim`] drops them.
#[derive(Debug)]
pub struct BufferPool {
    name: &'static str,
    capacity: usize,
    outstanding: AtomicUsize,
    cached: Mutex<Vec<PcmBuffer>>,
}

impl BufferPool {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            outstanding: AtomicUsize::new(0),
            cached: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffers currently handed out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Buffers sitting in the cache.
    pub fn cached(&self) -> usize {
        self.cached.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Take a zeroed-length buffer of exactly `bytes` bytes, or `None` when
    /// `capacity` buffers are already out.
    pub fn acquire(&self, bytes: usize) -> Option<PcmBuffer> {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .ok()?;

        let reused = self
            .cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let mut buffer = reused.unwrap_or_default();
        buffer.reshape(bytes);
        Some(buffer)
    }

    /// Take `count` buffers at once, or none of them.
    pub fn acquire_many(&self, count: usize, bytes: usize) -> Option<Vec<PcmBuffer>> {
        let mut taken = Vec::with_capacity(count);
        for _ in 0..count {
            match self.acquire(bytes) {
                Some(buffer) => taken.push(buffer),
                None => {
                    for buffer in taken {
                        self.release(buffer);
                    }
                    return None;
                }
            }
        }
        Some(taken)
    }

    /// Return a buffer taken from this pool.
    pub fn release(&self, buffer: PcmBuffer) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(buffer);
    }

    /// Drop every cached buffer, returning how many were freed.
    pub fn trim(&self) -> usize {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        let freed = cached.len();
        cached.clear();
        cached.shrink_to_fit();
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_respects_capacity() {
        let pool = BufferPool::new("test", 2);
        let a = pool.acquire(16).unwrap();
        let _b = pool.acquire(16).unwrap();
        assert!(pool.acquire(16).is_none());
        assert_eq!(pool.outstanding(), 2);

        pool.release(a);
        assert_eq!(pool.outstanding(), 1);
        assert!(pool.acquire(16).is_some());
    }

    #[test]
    fn released_buffers_are_reused_and_reshaped() {
        let pool = BufferPool::new("test", 4);
        let mut a = pool.acquire(64).unwrap();
        a.set_filled(64);
        pool.release(a);
        assert_eq!(pool.cached(), 1);

        let b = pool.acquire(8).unwrap();
        assert_eq!(b.len(), 8);
        assert_eq!(b.filled_len(), 0);
        assert_eq!(pool.cached(), 0);
    }

    #[test]
    fn acquire_many_is_all_or_nothing() {
        let pool = BufferPool::new("test", 3);
        let _held = pool.acquire(4).unwrap();
        assert!(pool.acquire_many(3, 4).is_none());
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.acquire_many(2, 4).map(|v| v.len()), Some(2));
        assert_eq!(pool.outstanding(), 3);
    }

    #[test]
    fn trim_frees_cache_only() {
        let pool = BufferPool::new("test", 4);
        let a = pool.acquire(4).unwrap();
        let b = pool.acquire(4).unwrap();
        pool.release(a);
        assert_eq!(pool.trim(), 1);
        assert_eq!(pool.cached(), 0);
        assert_eq!(pool.outstanding(), 1);
        pool.release(b);
    }

    #[test]
    fn set_filled_clamps() {
        let mut buffer = PcmBuffer::with_len(10);
        buffer.set_filled(99);
        assert_eq!(buffer.filled().len(), 10);
    }
}
