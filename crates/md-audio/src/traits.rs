//! Backend and device traits.

use md_pcm::{OutputFormat, RenderBlock};

use crate::error::{AudioError, AudioResult};

/// Called from the device's audio thread for every output block.
pub type RenderCallback = Box<dyn FnMut(&mut RenderBlock<'_>) + Send + 'static>;

/// Called, possibly from a backend thread, when a running stream fails.
pub type ErrorCallback = Box<dyn Fn(AudioError) + Send + Sync + 'static>;

/// What a stream should look like.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamRequest {
    pub sample_rate: u32,
    pub channels: u16,
    pub format: OutputFormat,
}

impl StreamRequest {
    pub fn new(sample_rate: u32, channels: u16, format: OutputFormat) -> Self {
        Self {
            sample_rate,
            channels,
            format,
        }
    }
}

/// Something that can open output streams.
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open a stream in the stopped state. `render` runs on the audio
    /// thread once the stream is started.
    fn open_stream(
        &self,
        request: &StreamRequest,
        render: RenderCallback,
        on_error: ErrorCallback,
    ) -> AudioResult<Box<dyn OutputDevice>>;
}

/// One open output stream. Dropping it closes the stream.
pub trait OutputDevice: Send {
    fn request(&self) -> StreamRequest;

    fn start(&mut self) -> AudioResult<()>;

    fn stop(&mut self) -> AudioResult<()>;
}
