//! Sources and fixtures shared by unit tests.

use std::sync::Arc;

use md_pcm::{Fill, MemorySource, SampleFormat, SampleNumber, SampleSource, SourceError, SourceResult};

use crate::context::ContextResources;
use crate::pool::BufferPool;

pub fn resources(segments: usize, full: usize) -> ContextResources {
    ContextResources::new(
        Arc::new(BufferPool::new("segment", segments)),
        Arc::new(BufferPool::new("full", full)),
    )
    .with_samples_per_buffer(256)
}

/// Mono16 source whose sample `i` has value `i % 30000`.
pub fn ramp(len: usize) -> Arc<dyn SampleSource> {
    let values: Vec<i16> = (0..len).map(|i| (i % 30000) as i16).collect();
    Arc::new(MemorySource::from_i16(false, 44100, &values))
}

/// Mono16 source of `len` copies of `value`.
pub fn constant(value: i16, len: usize) -> Arc<dyn SampleSource> {
    Arc::new(MemorySource::from_i16(false, 44100, &vec![value; len]))
}

/// A ramp that decodes `good` samples and then fails.
pub struct Flaky {
    inner: MemorySource,
    good: u64,
}

impl Flaky {
    pub fn new(len: usize, good: u64) -> Arc<dyn SampleSource> {
        let values: Vec<i16> = (0..len).map(|i| i as i16).collect();
        Arc::new(Self {
            inner: MemorySource::from_i16(false, 44100, &values),
            good,
        })
    }
}

impl SampleSource for Flaky {
    fn format(&self) -> SampleFormat {
        self.inner.format()
    }

    fn frequency(&self) -> u32 {
        self.inner.frequency()
    }

    fn sample_length(&self) -> SampleNumber {
        self.inner.sample_length()
    }

    fn fill_sample_data(&self, buf: &mut [u8], start: SampleNumber) -> SourceResult<Fill> {
        if start >= self.good {
            return Err(SourceError::Decode("corrupt frame".into()));
        }
        let room = ((self.good - start) as usize * 2).min(buf.len());
        self.inner.fill_sample_data(&mut buf[..room], start)
    }
}

/// Stereo16 source that claims `length` samples but has no data.
pub struct Inflated {
    pub length: SampleNumber,
}

impl SampleSource for Inflated {
    fn format(&self) -> SampleFormat {
        SampleFormat::Stereo16
    }

    fn frequency(&self) -> u32 {
        44100
    }

    fn sample_length(&self) -> SampleNumber {
        self.length
    }

    fn fill_sample_data(&self, _buf: &mut [u8], _start: SampleNumber) -> SourceResult<Fill> {
        Ok(Fill::default())
    }
}
