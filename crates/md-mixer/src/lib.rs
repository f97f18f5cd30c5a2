//! The mixdown sound mixer.
//!
//! [`Mixer`] opens one [`OutputStream`] per sample rate on the configured
//! backend, hands out playing contexts for sounds, and runs a housekeeping
//! thread that keeps their decode-ahead buffers full and republishes each
//! stream's render queue.
//!
//! ```no_run
//! use std::sync::Arc;
//! use md_mixer::{Mixer, MixerConfig};
//! use md_pcm::{SampleFormat, SineWaveSource};
//!
//! let mixer = Mixer::new(MixerConfig::default()).unwrap();
//! mixer.initialize().unwrap();
//! let tone = Arc::new(SineWaveSource::new(SampleFormat::Mono16, 44100, 44100, 440.0, 0.5));
//! let sound = mixer.play(tone, true, 1.0, false);
//! ```

mod config;
mod error;
mod housekeeping;
mod mixer;
mod stream;
mod wav;

pub use config::{BackendKind, MixerConfig};
pub use error::{ConfigError, ConfigResult, MixerError, MixerResult};
pub use mixer::{Mixer, MixerState};
pub use stream::OutputStream;
pub use wav::{samples_to_wav, write_wav};

// Re-export what callers need to drive the sounds they get back.
pub use md_audio::{AudioBackend, ManualBackend};
pub use md_engine::{
    BufferedContext, LoopingContext, PlaybackState, SoundHandle, StreamingContext,
};
