//! In-memory PCM source.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::format::{SampleFormat, SampleNumber};
use crate::source::{fill_all, Fill, SampleSource, SourceResult};

/// Bytes requested per call while baking another source.
const BAKE_CHUNK_BYTES: usize = 16 * 1024;

/// PCM held entirely in memory. Cloning shares the data.
#[derive(Clone, Debug)]
pub struct MemorySource {
    format: SampleFormat,
    frequency: u32,
    data: Arc<[u8]>,
}

impl MemorySource {
    /// Wrap raw PCM. A trailing partial frame is ignored.
    pub fn new(format: SampleFormat, frequency: u32, data: impl Into<Vec<u8>>) -> Self {
        let mut data = data.into();
        let whole = data.len() - data.len() % format.bytes_per_sample();
        data.truncate(whole);
        Self {
            format,
            frequency,
            data: data.into(),
        }
    }

    /// Interleaved 16-bit samples, one or two channels.
    pub fn from_i16(stereo: bool, frequency: u32, samples: &[i16]) -> Self {
        let format = if stereo {
            SampleFormat::Stereo16
        } else {
            SampleFormat::Mono16
        };
        let data: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self::new(format, frequency, data)
    }

    /// Decode `source` completely into memory.
    ///
    /// Unbounded sources are read until they return no more data. A decode
    /// error is returned as-is; nothing decoded so far is kept.
    pub fn bake(source: &(impl SampleSource + ?Sized)) -> SourceResult<Self> {
        let format = source.format();
        let frame = format.bytes_per_sample();
        let expected = source.sample_length() as usize * frame;
        let mut data = Vec::with_capacity(expected);
        let mut chunk = alloc::vec![0u8; BAKE_CHUNK_BYTES - BAKE_CHUNK_BYTES % frame];
        let mut position: SampleNumber = 0;

        loop {
            let (fill, err) = fill_all(source, &mut chunk, position);
            if let Some(e) = err {
                return Err(e);
            }
            data.extend_from_slice(&chunk[..fill.bytes]);
            position += fill.samples;
            if fill.bytes < chunk.len() {
                break;
            }
        }

        Ok(Self::new(format, source.frequency(), data))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl SampleSource for MemorySource {
    fn format(&self) -> SampleFormat {
        self.format
    }

    fn frequency(&self) -> u32 {
        self.frequency
    }

    fn sample_length(&self) -> SampleNumber {
        self.format.samples_in(self.data.len()) as SampleNumber
    }

    fn fill_sample_data(&self, buf: &mut [u8], start: SampleNumber) -> SourceResult<Fill> {
        let frame = self.format.bytes_per_sample();
        let length = self.sample_length();
        if start >= length {
            return Ok(Fill::NONE);
        }
        let samples = ((length - start) as usize).min(buf.len() / frame);
        let offset = start as usize * frame;
        let bytes = samples * frame;
        buf[..bytes].copy_from_slice(&self.data[offset..offset + bytes]);
        Ok(Fill::new(bytes, samples as u64))
    }
}
