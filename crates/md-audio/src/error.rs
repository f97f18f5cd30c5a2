//! Audio backend errors.

/// Errors raised by output backends.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AudioError {
    #[error("No audio output device available")]
    NoDevice,

    #[error("Failed to initialize audio device: {0}")]
    DeviceInit(String),

    #[error("Failed to create audio stream: {0}")]
    StreamCreate(String),

    #[error("Playback error: {0}")]
    Playback(String),

    /// Reported asynchronously by a running stream.
    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Audio device thread is gone")]
    DeviceThread,
}

pub type AudioResult<T> = Result<T, AudioError>;
