//! PCM primitives for the mixdown sound mixer.
//!
//! Everything here is independent of threads and devices: the sample
//! formats a source can produce, the [`SampleSource`] contract the mixer
//! pulls PCM through, conversion of raw PCM into interleaved output
//! blocks, and a few sources that live entirely in memory.
//!
//! Designed to be `no_std` compatible with the `alloc` crate.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod convert;
mod format;
mod loop_hold;
mod memory;
mod sine;
mod source;

pub use convert::{OutputSamples, RenderBlock, Volume, VOLUME_EPSILON};
pub use format::{OutputFormat, SampleFormat, SampleNumber};
pub use loop_hold::LoopHoldSource;
pub use memory::MemorySource;
pub use sine::SineWaveSource;
pub use source::{fill_all, Fill, SampleSource, SourceError, SourceResult};
