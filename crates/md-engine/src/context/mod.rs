//! Playing contexts: one per sound started on the mixer.

mod buffered;
mod looping;
mod streaming;

use std::sync::Arc;

use crate::pool::BufferPool;

pub use buffered::BufferedContext;
pub use looping::LoopingContext;
pub use streaming::StreamingContext;

/// Decode-ahead buffers a streaming context keeps in flight.
pub const DECODE_AHEAD_BUFFERS: usize = 4;

/// Upper bound on decode-ahead depth.
pub const MAX_DECODE_AHEAD: usize = 8;

/// Largest bytes-per-sample of any supported format.
const MAX_BYTES_PER_SAMPLE: usize = 4;

/// Default cap on a single whole-sound buffer.
pub const MAX_FULL_BUFFER_BYTES: usize = 64 << 20;

/// Pools and buffer geometry shared by every context a mixer creates.
#[derive(Clone, Debug)]
pub struct ContextResources {
    /// Fixed-size decode-ahead segments for streaming contexts.
    pub segment_pool: Arc<BufferPool>,
    /// Whole-sound buffers for buffered contexts.
    pub full_pool: Arc<BufferPool>,
    pub decode_ahead: usize,
    pub samples_per_buffer: usize,
    /// Largest buffer a buffered context may decode into.
    pub max_full_bytes: usize,
}

impl ContextResources {
    pub fn new(segment_pool: Arc<BufferPool>, full_pool: Arc<BufferPool>) -> Self {
        Self {
            segment_pool,
            full_pool,
            decode_ahead: DECODE_AHEAD_BUFFERS,
            samples_per_buffer: 4096,
            max_full_bytes: MAX_FULL_BUFFER_BYTES,
        }
    }

    pub fn with_decode_ahead(mut self, buffers: usize) -> Self {
        self.decode_ahead = buffers.clamp(1, MAX_DECODE_AHEAD);
        self
    }

    pub fn with_samples_per_buffer(mut self, samples: usize) -> Self {
        self.samples_per_buffer = samples.max(1);
        self
    }

    pub fn with_max_full_bytes(mut self, bytes: usize) -> Self {
        self.max_full_bytes = bytes;
        self
    }

    /// Size of every segment buffer, large enough for any format.
    pub fn segment_bytes(&self) -> usize {
        self.samples_per_buffer * MAX_BYTES_PER_SAMPLE
    }
}
