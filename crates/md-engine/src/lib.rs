//! Playback core for the mixdown sound mixer.
//!
//! Holds everything that runs on either side of the realtime boundary:
//! the playing contexts and their decode-ahead buffering, the buffer pool
//! they borrow from, the versioned render queue handed from the
//! housekeeping thread to the audio callback, and the per-stream mix that
//! sums every queued context into the device buffer.

mod context;
mod error;
mod handle;
mod pool;
mod registry;
mod render_queue;
mod stream_mixer;
#[cfg(test)]
mod test_support;

pub use context::{
    BufferedContext, ContextResources, LoopingContext, StreamingContext, DECODE_AHEAD_BUFFERS,
    MAX_DECODE_AHEAD, MAX_FULL_BUFFER_BYTES,
};
pub use error::{ContextError, ContextResult};
pub use handle::{
    ContextHost, ContextKey, PlaybackState, PlayingContext, SoundHandle, StreamRendering,
};
pub use pool::{BufferPool, PcmBuffer};
pub use registry::StreamRegistry;
pub use render_queue::{render_queue, QueueReader, QueueWriter, RenderList, MAX_QUEUED_RENDERINGS};
pub use stream_mixer::{StreamMixer, MIX_BUFFER_SAMPLES};
