//! Generated test tone.

use core::f32::consts::TAU;

use crate::format::{SampleFormat, SampleNumber};
use crate::source::{Fill, SampleSource, SourceResult};

/// Samples at the end of a bounded tone that ramp linearly to silence.
const FADE_OUT_SAMPLES: u64 = 16;

/// A sine tone, computed on demand for any requested range.
#[derive(Clone, Debug)]
pub struct SineWaveSource {
    format: SampleFormat,
    frequency: u32,
    length: SampleNumber,
    wave_frequency: f32,
    amplitude: f32,
}

impl SineWaveSource {
    /// `length` of 0 makes an endless tone. `amplitude` is clamped to 0..=1.
    pub fn new(
        format: SampleFormat,
        frequency: u32,
        length: SampleNumber,
        wave_frequency: f32,
        amplitude: f32,
    ) -> Self {
        Self {
            format,
            frequency,
            length,
            wave_frequency,
            amplitude: amplitude.clamp(0.0, 1.0),
        }
    }

    /// Normalized value at `n`, in -1..=1.
    pub fn value_at(&self, n: SampleNumber) -> f32 {
        if self.frequency == 0 {
            return 0.0;
        }
        // Phase is reduced per period so large positions keep precision.
        let period = self.frequency as f64 / self.wave_frequency as f64;
        let phase = if period.is_finite() && period > 0.0 {
            let cycles = n as f64 / period;
            (cycles - libm::floor(cycles)) as f32
        } else {
            0.0
        };
        let mut v = self.amplitude * libm::sinf(TAU * phase);
        if self.length > 0 && n + FADE_OUT_SAMPLES >= self.length {
            let remaining = self.length.saturating_sub(n + 1);
            v *= remaining as f32 / FADE_OUT_SAMPLES as f32;
        }
        v
    }
}

impl SampleSource for SineWaveSource {
    fn format(&self) -> SampleFormat {
        self.format
    }

    fn frequency(&self) -> u32 {
        self.frequency
    }

    fn sample_length(&self) -> SampleNumber {
        self.length
    }

    fn fill_sample_data(&self, buf: &mut [u8], start: SampleNumber) -> SourceResult<Fill> {
        let frame = self.format.bytes_per_sample();
        let mut samples = buf.len() / frame;
        if self.length > 0 {
            samples = samples.min(self.length.saturating_sub(start) as usize);
        }

        for (i, out) in buf.chunks_exact_mut(frame).take(samples).enumerate() {
            let v = self.value_at(start + i as u64);
            match self.format.bits() {
                8 => out.fill((v * 127.0 + 128.0) as u8),
                _ => {
                    let bytes = ((v * 32767.0) as i16).to_le_bytes();
                    for pair in out.chunks_exact_mut(2) {
                        pair.copy_from_slice(&bytes);
                    }
                }
            }
        }
        Ok(Fill::new(samples * frame, samples as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_tone_stops_at_length() {
        let sine = SineWaveSource::new(SampleFormat::Mono16, 44100, 100, 441.0, 1.0);
        let mut buf = [0u8; 400];
        let fill = sine.fill_sample_data(&mut buf, 50).unwrap();
        assert_eq!(fill.samples, 50);
        assert!(sine.fill_sample_data(&mut buf, 100).unwrap().is_empty());
    }

    #[test]
    fn endless_tone_fills_whole_buffer() {
        let sine = SineWaveSource::new(SampleFormat::Stereo8, 8000, 0, 100.0, 0.5);
        let mut buf = [0u8; 64];
        let fill = sine.fill_sample_data(&mut buf, 1_000_000).unwrap();
        assert_eq!(fill, Fill::new(64, 32));
    }

    #[test]
    fn quarter_period_peaks() {
        // 100 samples per period: sample 25 sits on the crest.
        let sine = SineWaveSource::new(SampleFormat::Mono16, 44100, 0, 441.0, 1.0);
        assert!((sine.value_at(25) - 1.0).abs() < 1e-4);
        assert!(sine.value_at(0).abs() < 1e-4);
    }

    #[test]
    fn eight_bit_is_unsigned() {
        let sine = SineWaveSource::new(SampleFormat::Mono8, 44100, 0, 441.0, 1.0);
        let mut buf = [0u8; 100];
        sine.fill_sample_data(&mut buf, 0).unwrap();
        assert_eq!(buf[0], 128);
        assert_eq!(buf[25], 255);
        assert_eq!(buf[75], 1);
    }

    #[test]
    fn tail_fades_to_silence() {
        let sine = SineWaveSource::new(SampleFormat::Mono16, 44100, 1000, 441.0, 1.0);
        assert_eq!(sine.value_at(999), 0.0);
        assert!(sine.value_at(990).abs() <= 0.6);
    }
}
