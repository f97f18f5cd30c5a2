//! The sample source contract.

use alloc::string::String;
use alloc::sync::Arc;

use crate::format::{SampleFormat, SampleNumber};

/// Error reported by a source while producing PCM.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The underlying decoder rejected the data.
    #[error("decode error: {0}")]
    Decode(String),
    /// The underlying storage could not be read.
    #[error("read error: {0}")]
    Io(String),
}

pub type SourceResult<T> = Result<T, SourceError>;

/// Amount of PCM written by one `fill_sample_data` call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Fill {
    pub bytes: usize,
    pub samples: u64,
}

impl Fill {
    pub const NONE: Fill = Fill { bytes: 0, samples: 0 };

    pub const fn new(bytes: usize, samples: u64) -> Self {
        Self { bytes, samples }
    }

    pub const fn is_empty(&self) -> bool {
        self.bytes == 0
    }
}

/// A producer of PCM addressed by sample number.
///
/// Sources are stateless from the caller's point of view: the mixer may
/// ask for any range, in any order, as many times as it likes. A fill that
/// writes 0 bytes signals end of data.
pub trait SampleSource: Send + Sync {
    fn format(&self) -> SampleFormat;

    /// Sample rate in Hz.
    fn frequency(&self) -> u32;

    /// Length in samples, or 0 when the source is unbounded.
    fn sample_length(&self) -> SampleNumber;

    /// Write PCM starting at `start` into `buf`, returning how much was
    /// written. Implementations write whole frames only.
    fn fill_sample_data(&self, buf: &mut [u8], start: SampleNumber) -> SourceResult<Fill>;

    fn bytes_per_sample(&self) -> usize {
        self.format().bytes_per_sample()
    }
}

impl<S: SampleSource + ?Sized> SampleSource for Arc<S> {
    fn format(&self) -> SampleFormat {
        (**self).format()
    }

    fn frequency(&self) -> u32 {
        (**self).frequency()
    }

    fn sample_length(&self) -> SampleNumber {
        (**self).sample_length()
    }

    fn fill_sample_data(&self, buf: &mut [u8], start: SampleNumber) -> SourceResult<Fill> {
        (**self).fill_sample_data(buf, start)
    }
}

/// Keep calling `fill_sample_data` until `buf` is full or the source runs
/// dry. A short total means the end of the data was reached.
///
/// An error after some PCM was produced is reported together with what was
/// written so far, so callers can keep the prefix.
pub fn fill_all(
    source: &(impl SampleSource + ?Sized),
    buf: &mut [u8],
    start: SampleNumber,
) -> (Fill, Option<SourceError>) {
    let frame = source.bytes_per_sample();
    let usable = buf.len() - buf.len() % frame;
    let mut total = Fill::NONE;

    while total.bytes < usable {
        match source.fill_sample_data(&mut buf[total.bytes..usable], start + total.samples) {
            Ok(fill) if fill.is_empty() => break,
            Ok(fill) => {
                total.bytes += fill.bytes;
                total.samples += fill.samples;
            }
            Err(e) => return (total, Some(e)),
        }
    }
    (total, None)
}
