//! Per-stream mix: sums every queued context into the device buffer.

use md_pcm::{OutputSamples, RenderBlock};

use crate::render_queue::QueueReader;

/// Samples mixed per pass; larger device blocks are mixed in chunks.
pub const MIX_BUFFER_SAMPLES: usize = 8192;

/// The callback-side state of one output stream.
///
/// Every buffer is allocated up front so that [`StreamMixer::render`]
/// never allocates. Contributions are summed into a wider accumulator
/// (`i32` for 16-bit output, `f32` for float output) and clamped once at
/// the end.
pub struct StreamMixer {
    reader: QueueReader,
    acc_i32: Vec<i32>,
    acc_f32: Vec<f32>,
    scratch_i16: Vec<i16>,
    scratch_f32: Vec<f32>,
}

impl StreamMixer {
    pub fn new(reader: QueueReader) -> Self {
        Self {
            reader,
            acc_i32: vec![0; MIX_BUFFER_SAMPLES],
            acc_f32: vec![0.0; MIX_BUFFER_SAMPLES],
            scratch_i16: vec![0; MIX_BUFFER_SAMPLES],
            scratch_f32: vec![0.0; MIX_BUFFER_SAMPLES],
        }
    }

    /// Version of the render queue the last block was mixed from.
    pub fn queue_version(&self) -> u64 {
        self.reader.version()
    }

    /// Fill `block` with the sum of every queued context.
    ///
    /// With the `alloc_check` feature, any heap allocation made while
    /// mixing aborts the process.
    pub fn render(&mut self, block: &mut RenderBlock<'_>) {
        #[cfg(feature = "alloc_check")]
        assert_no_alloc::assert_no_alloc(|| self.mix(block));
        #[cfg(not(feature = "alloc_check"))]
        self.mix(block);
    }

    fn mix(&mut self, block: &mut RenderBlock<'_>) {
        let channels = block.channels();
        let Self {
            reader,
            acc_i32,
            acc_f32,
            scratch_i16,
            scratch_f32,
        } = self;
        let queue = reader.acquire();

        if queue.is_empty() {
            block.silence();
            return;
        }

        match block.samples_mut() {
            OutputSamples::I16(out) => {
                for chunk in out.chunks_mut(MIX_BUFFER_SAMPLES) {
                    let n = chunk.len();
                    let acc = &mut acc_i32[..n];
                    acc.fill(0);
                    for ctx in queue {
                        let mut scratch = RenderBlock::i16(&mut scratch_i16[..n], channels);
                        if ctx.render_audio(&mut scratch) {
                            for (a, s) in acc.iter_mut().zip(&scratch_i16[..n]) {
                                *a += *s as i32;
                            }
                        }
                    }
                    for (o, a) in chunk.iter_mut().zip(acc.iter()) {
                        *o = (*a).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
                    }
                }
            }
            OutputSamples::F32(out) => {
                for chunk in out.chunks_mut(MIX_BUFFER_SAMPLES) {
                    let n = chunk.len();
                    let acc = &mut acc_f32[..n];
                    acc.fill(0.0);
                    for ctx in queue {
                        let mut scratch = RenderBlock::f32(&mut scratch_f32[..n], channels);
                        if ctx.render_audio(&mut scratch) {
                            for (a, s) in acc.iter_mut().zip(&scratch_f32[..n]) {
                                *a += *s;
                            }
                        }
                    }
                    for (o, a) in chunk.iter_mut().zip(acc.iter()) {
                        *o = a.clamp(-1.0, 1.0);
                    }
                }
            }
        }
    }
}
