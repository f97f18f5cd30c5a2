//! Mixer and configuration errors.

use std::path::PathBuf;

use md_audio::AudioError;

use crate::mixer::MixerState;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MixerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("Mixer cannot do that while {0:?}")]
    InvalidState(MixerState),

    #[error("Failed to spawn housekeeping thread: {0}")]
    Thread(#[source] std::io::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
pub type MixerResult<T> = Result<T, MixerError>;
