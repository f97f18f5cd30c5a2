//! Sample and output formats.

/// Index of a sample frame within a source. One "sample" is one frame
/// across all channels.
pub type SampleNumber = u64;

/// PCM layout produced by a [`SampleSource`](crate::SampleSource).
///
/// 8-bit data is unsigned with silence at 128; 16-bit data is signed
/// little-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    Mono8,
    Stereo8,
    Mono16,
    Stereo16,
}

impl SampleFormat {
    /// Number of interleaved channels.
    pub const fn channels(self) -> u16 {
        match self {
            SampleFormat::Mono8 | SampleFormat::Mono16 => 1,
            SampleFormat::Stereo8 | SampleFormat::Stereo16 => 2,
        }
    }

    /// Bits per channel value.
    pub const fn bits(self) -> u16 {
        match self {
            SampleFormat::Mono8 | SampleFormat::Stereo8 => 8,
            SampleFormat::Mono16 | SampleFormat::Stereo16 => 16,
        }
    }

    /// Bytes occupied by one sample frame.
    pub const fn bytes_per_sample(self) -> usize {
        (self.channels() as usize) * (self.bits() as usize / 8)
    }

    /// Format with the given channel count and bit depth, if supported.
    pub const fn from_layout(channels: u16, bits: u16) -> Option<Self> {
        match (channels, bits) {
            (1, 8) => Some(SampleFormat::Mono8),
            (2, 8) => Some(SampleFormat::Stereo8),
            (1, 16) => Some(SampleFormat::Mono16),
            (2, 16) => Some(SampleFormat::Stereo16),
            _ => None,
        }
    }

    /// Number of whole sample frames that fit in `bytes`.
    pub const fn samples_in(self, bytes: usize) -> usize {
        bytes / self.bytes_per_sample()
    }
}

/// Sample type of a native output stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    #[default]
    I16,
    F32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_layout() {
        assert_eq!(SampleFormat::Mono8.channels(), 1);
        assert_eq!(SampleFormat::Stereo8.bytes_per_sample(), 2);
        assert_eq!(SampleFormat::Mono16.bytes_per_sample(), 2);
        assert_eq!(SampleFormat::Stereo16.bytes_per_sample(), 4);
        assert_eq!(SampleFormat::Stereo16.bits(), 16);
    }

    #[test]
    fn from_layout_rejects_surround() {
        assert_eq!(SampleFormat::from_layout(2, 16), Some(SampleFormat::Stereo16));
        assert_eq!(SampleFormat::from_layout(6, 16), None);
        assert_eq!(SampleFormat::from_layout(1, 24), None);
    }

    #[test]
    fn samples_in_truncates_partial_frames() {
        assert_eq!(SampleFormat::Stereo16.samples_in(10), 2);
        assert_eq!(SampleFormat::Mono8.samples_in(10), 10);
    }
}
