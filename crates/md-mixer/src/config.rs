//! Mixer configuration, loadable from YAML.
//!
//! Every field has a default, so a config file only needs the keys it
//! changes:
//!
//! ```yaml
//! backend: manual
//! preparing_rates: [48000]
//! output_format: f32
//! ```

use std::path::Path;
use std::time::Duration;

use md_engine::{MAX_DECODE_AHEAD, MAX_FULL_BUFFER_BYTES};
use md_pcm::OutputFormat;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Which output backend the mixer opens streams on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The platform's default output device.
    #[default]
    Cpal,
    /// Streams that only render when pumped by the host.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    pub backend: BackendKind,
    /// Streams opened and started by `initialize`.
    pub preparing_rates: Vec<u32>,
    /// Housekeeping period.
    pub update_quantum_ms: u64,
    /// Minimum gap between two wake signals.
    pub min_signal_interval_ms: u64,
    /// Decode-ahead depth of streaming contexts.
    pub decode_ahead_buffers: usize,
    /// Samples per decode-ahead buffer.
    pub samples_per_buffer: usize,
    /// Segment buffers the mixer may hand out at once.
    pub max_segment_buffers: usize,
    /// Whole-sound buffers the mixer may hand out at once.
    pub max_full_buffers: usize,
    /// Largest single whole-sound buffer, in bytes.
    pub max_full_buffer_bytes: usize,
    pub output_channels: u16,
    #[serde(with = "output_format")]
    pub output_format: OutputFormat,
    /// Re-open attempts after a stream error before giving up on the rate.
    pub stream_retry_limit: u32,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Cpal,
            preparing_rates: vec![44100, 48000],
            update_quantum_ms: 10,
            min_signal_interval_ms: 2,
            decode_ahead_buffers: md_engine::DECODE_AHEAD_BUFFERS,
            samples_per_buffer: 4096,
            max_segment_buffers: 256,
            max_full_buffers: 64,
            max_full_buffer_bytes: MAX_FULL_BUFFER_BYTES,
            output_channels: 2,
            output_format: OutputFormat::I16,
            stream_retry_limit: 3,
        }
    }
}

impl MixerConfig {
    /// Read and validate a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml_str(&text)?;
        log::info!("loaded mixer config from {:?}", path);
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.preparing_rates.contains(&0) {
            return invalid("preparing_rates contains a zero rate".into());
        }
        if self.update_quantum_ms == 0 {
            return invalid("update_quantum_ms must be positive".into());
        }
        if self.min_signal_interval_ms == 0 {
            return invalid("min_signal_interval_ms must be positive".into());
        }
        if self.samples_per_buffer == 0 {
            return invalid("samples_per_buffer must be positive".into());
        }
        if self.max_segment_buffers == 0 || self.max_full_buffers == 0 {
            return invalid("buffer pools need at least one buffer".into());
        }
        if self.max_full_buffer_bytes == 0 {
            return invalid("max_full_buffer_bytes must be positive".into());
        }
        if !(1..=2).contains(&self.output_channels) {
            return invalid(format!(
                "output_channels must be 1 or 2, got {}",
                self.output_channels
            ));
        }
        if self.decode_ahead_buffers == 0
            || self.decode_ahead_buffers > MAX_DECODE_AHEAD
            || self.decode_ahead_buffers > self.max_segment_buffers
        {
            return invalid(format!(
                "decode_ahead_buffers must be within 1..={} and fit in max_segment_buffers ({})",
                MAX_DECODE_AHEAD, self.max_segment_buffers
            ));
        }
        Ok(())
    }

    pub fn update_quantum(&self) -> Duration {
        Duration::from_millis(self.update_quantum_ms)
    }

    pub fn min_signal_interval(&self) -> Duration {
        Duration::from_millis(self.min_signal_interval_ms)
    }

    // --- builders ---

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_preparing_rates(mut self, rates: impl Into<Vec<u32>>) -> Self {
        self.preparing_rates = rates.into();
        self
    }

    pub fn with_update_quantum_ms(mut self, ms: u64) -> Self {
        self.update_quantum_ms = ms;
        self
    }

    pub fn with_min_signal_interval_ms(mut self, ms: u64) -> Self {
        self.min_signal_interval_ms = ms;
        self
    }

    pub fn with_decode_ahead_buffers(mut self, buffers: usize) -> Self {
        self.decode_ahead_buffers = buffers;
        self
    }

    pub fn with_samples_per_buffer(mut self, samples: usize) -> Self {
        self.samples_per_buffer = samples;
        self
    }

    pub fn with_pool_limits(mut self, segment_buffers: usize, full_buffers: usize) -> Self {
        self.max_segment_buffers = segment_buffers;
        self.max_full_buffers = full_buffers;
        self
    }

    pub fn with_max_full_buffer_bytes(mut self, bytes: usize) -> Self {
        self.max_full_buffer_bytes = bytes;
        self
    }

    pub fn with_output(mut self, channels: u16, format: OutputFormat) -> Self {
        self.output_channels = channels;
        self.output_format = format;
        self
    }

    pub fn with_stream_retry_limit(mut self, attempts: u32) -> Self {
        self.stream_retry_limit = attempts;
        self
    }
}

mod output_format {
    use md_pcm::OutputFormat;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(format: &OutputFormat, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(match format {
            OutputFormat::I16 => "i16",
            OutputFormat::F32 => "f32",
        })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<OutputFormat, D::Error> {
        let name = String::deserialize(d)?;
        match name.as_str() {
            "i16" => Ok(OutputFormat::I16),
            "f32" => Ok(OutputFormat::F32),
            other => Err(D::Error::unknown_variant(other, &["i16", "f32"])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- defaults ---

    #[test]
    fn defaults_are_valid() {
        let config = MixerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.preparing_rates, vec![44100, 48000]);
        assert_eq!(config.update_quantum(), Duration::from_millis(10));
        assert_eq!(config.min_signal_interval(), Duration::from_millis(2));
        assert_eq!(config.stream_retry_limit, 3);
    }

    // --- yaml ---

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = MixerConfig::from_yaml_str(
            "backend: manual\npreparing_rates: [22050]\noutput_format: f32\n",
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Manual);
        assert_eq!(config.preparing_rates, vec![22050]);
        assert_eq!(config.output_format, OutputFormat::F32);
        assert_eq!(config.samples_per_buffer, 4096);
        assert_eq!(config.output_channels, 2);
    }

    #[test]
    fn yaml_survives_a_write_and_read() {
        let config = MixerConfig::default()
            .with_backend(BackendKind::Manual)
            .with_output(1, OutputFormat::F32);
        let text = config.to_yaml_string().unwrap();
        assert_eq!(MixerConfig::from_yaml_str(&text).unwrap(), config);
    }

    #[test]
    fn unknown_output_format_is_a_parse_error() {
        let err = MixerConfig::from_yaml_str("output_format: u8\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reads_files_and_reports_missing_ones() {
        let path = std::env::temp_dir().join(format!("md-mixer-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "update_quantum_ms: 5\n").unwrap();
        let config = MixerConfig::load(&path).unwrap();
        assert_eq!(config.update_quantum_ms, 5);
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(
            MixerConfig::load(&path).unwrap_err(),
            ConfigError::Io { .. }
        ));
    }

    // --- validation ---

    #[test]
    fn rejects_zero_quanta_and_rates() {
        let bad = [
            MixerConfig::default().with_update_quantum_ms(0),
            MixerConfig::default().with_min_signal_interval_ms(0),
            MixerConfig::default().with_preparing_rates([44100, 0]),
            MixerConfig::default().with_samples_per_buffer(0),
            MixerConfig::default().with_pool_limits(0, 4),
            MixerConfig::default().with_max_full_buffer_bytes(0),
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))), "{config:?}");
        }
    }

    #[test]
    fn rejects_unsupported_channel_counts() {
        let config = MixerConfig::default().with_output(6, OutputFormat::I16);
        assert!(config.validate().is_err());
    }

    #[test]
    fn decode_ahead_must_fit_the_segment_pool() {
        assert!(MixerConfig::default()
            .with_decode_ahead_buffers(MAX_DECODE_AHEAD + 1)
            .validate()
            .is_err());
        assert!(MixerConfig::default()
            .with_decode_ahead_buffers(4)
            .with_pool_limits(3, 4)
            .validate()
            .is_err());
        assert!(MixerConfig::default()
            .with_decode_ahead_buffers(0)
            .validate()
            .is_err());
    }
}
