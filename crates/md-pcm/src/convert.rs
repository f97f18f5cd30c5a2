//! Conversion of source PCM into interleaved output blocks.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::format::{OutputFormat, SampleFormat};

/// Volumes closer than this to 0 or 1 take the silent or copy fast path.
pub const VOLUME_EPSILON: f32 = 1e-6;

/// A gain that can be read from the audio callback without locking.
///
/// Stored as the bit pattern of an `f32`. Negative and non-finite values
/// are stored as 0.
#[derive(Debug)]
pub struct Volume(AtomicU32);

impl Volume {
    pub fn new(volume: f32) -> Self {
        Self(AtomicU32::new(sanitize(volume).to_bits()))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, volume: f32) {
        self.0.store(sanitize(volume).to_bits(), Ordering::Relaxed);
    }
}

impl Default for Volume {
    fn default() -> Self {
        Self::new(1.0)
    }
}

fn sanitize(volume: f32) -> f32 {
    if volume.is_finite() {
        volume.max(0.0)
    } else {
        0.0
    }
}

/// Interleaved output samples in the stream's native type.
#[derive(Debug)]
pub enum OutputSamples<'a> {
    I16(&'a mut [i16]),
    F32(&'a mut [f32]),
}

/// One block of interleaved output handed to a renderer.
#[derive(Debug)]
pub struct RenderBlock<'a> {
    samples: OutputSamples<'a>,
    channels: u16,
}

impl<'a> RenderBlock<'a> {
    /// `channels` must be 1 or 2; anything else is treated as stereo.
    pub fn new(samples: OutputSamples<'a>, channels: u16) -> Self {
        let channels = if channels == 1 { 1 } else { 2 };
        Self { samples, channels }
    }

    pub fn i16(samples: &'a mut [i16], channels: u16) -> Self {
        Self::new(OutputSamples::I16(samples), channels)
    }

    pub fn f32(samples: &'a mut [f32], channels: u16) -> Self {
        Self::new(OutputSamples::F32(samples), channels)
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn format(&self) -> OutputFormat {
        match self.samples {
            OutputSamples::I16(_) => OutputFormat::I16,
            OutputSamples::F32(_) => OutputFormat::F32,
        }
    }

    /// Number of whole frames in the block.
    pub fn frames(&self) -> usize {
        let len = match &self.samples {
            OutputSamples::I16(s) => s.len(),
            OutputSamples::F32(s) => s.len(),
        };
        len / self.channels as usize
    }

    pub fn samples(&self) -> &OutputSamples<'a> {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut OutputSamples<'a> {
        &mut self.samples
    }

    /// Zero the whole block.
    pub fn silence(&mut self) {
        self.silence_from(0);
    }

    /// Zero every frame from `frame` to the end.
    pub fn silence_from(&mut self, frame: usize) {
        let start = frame * self.channels as usize;
        match &mut self.samples {
            OutputSamples::I16(s) => {
                if let Some(tail) = s.get_mut(start..) {
                    tail.fill(0);
                }
            }
            OutputSamples::F32(s) => {
                if let Some(tail) = s.get_mut(start..) {
                    tail.fill(0.0);
                }
            }
        }
    }

    /// Convert whole frames of `pcm` into the block starting at output
    /// frame `at`, scaled by `volume`. Returns the number of frames written,
    /// bounded by both the PCM and the room left in the block.
    pub fn write_pcm(&mut self, at: usize, pcm: &[u8], format: SampleFormat, volume: f32) -> usize {
        let frames = format
            .samples_in(pcm.len())
            .min(self.frames().saturating_sub(at));
        if frames == 0 {
            return 0;
        }

        let channels = self.channels as usize;
        let start = at * channels;
        let end = start + frames * channels;
        let gain = Gain::from_volume(volume);

        match &mut self.samples {
            OutputSamples::I16(out) => {
                for (i, slot) in out[start..end].chunks_exact_mut(channels).enumerate() {
                    let (l, r) = read_frame(pcm, format, i);
                    if channels == 1 {
                        slot[0] = gain.apply_i16(downmix(l, r));
                    } else {
                        slot[0] = gain.apply_i16(l);
                        slot[1] = gain.apply_i16(r);
                    }
                }
            }
            OutputSamples::F32(out) => {
                for (i, slot) in out[start..end].chunks_exact_mut(channels).enumerate() {
                    let (l, r) = read_frame(pcm, format, i);
                    if channels == 1 {
                        slot[0] = gain.apply_f32(downmix(l, r));
                    } else {
                        slot[0] = gain.apply_f32(l);
                        slot[1] = gain.apply_f32(r);
                    }
                }
            }
        }
        frames
    }
}

#[derive(Clone, Copy)]
enum Gain {
    Mute,
    Unity,
    Scale(f32),
}

impl Gain {
    fn from_volume(volume: f32) -> Self {
        if volume.abs() < VOLUME_EPSILON {
            Gain::Mute
        } else if (volume - 1.0).abs() < VOLUME_EPSILON {
            Gain::Unity
        } else {
            Gain::Scale(volume)
        }
    }

    #[inline]
    fn apply_i16(self, v: i16) -> i16 {
        match self {
            Gain::Mute => 0,
            Gain::Unity => v,
            Gain::Scale(g) => (v as f32 * g).clamp(-32768.0, 32767.0) as i16,
        }
    }

    #[inline]
    fn apply_f32(self, v: i16) -> f32 {
        match self {
            Gain::Mute => 0.0,
            Gain::Unity => v as f32 / 32768.0,
            Gain::Scale(g) => v as f32 / 32768.0 * g,
        }
    }
}

/// Left and right of frame `i`, widened to 16-bit signed. Mono frames are
/// duplicated.
#[inline]
fn read_frame(pcm: &[u8], format: SampleFormat, i: usize) -> (i16, i16) {
    let at = i * format.bytes_per_sample();
    match format {
        SampleFormat::Mono8 => {
            let v = widen_u8(pcm[at]);
            (v, v)
        }
        SampleFormat::Stereo8 => (widen_u8(pcm[at]), widen_u8(pcm[at + 1])),
        SampleFormat::Mono16 => {
            let v = i16::from_le_bytes([pcm[at], pcm[at + 1]]);
            (v, v)
        }
        SampleFormat::Stereo16 => (
            i16::from_le_bytes([pcm[at], pcm[at + 1]]),
            i16::from_le_bytes([pcm[at + 2], pcm[at + 3]]),
        ),
    }
}

#[inline]
fn widen_u8(b: u8) -> i16 {
    (b as i16 - 128) * 256
}

#[inline]
fn downmix(l: i16, r: i16) -> i16 {
    ((l as i32 + r as i32) / 2) as i16
}
