//! Buffered playback: the whole sound is decoded once, up front.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use md_pcm::{fill_all, RenderBlock, SampleFormat, SampleNumber, SampleSource, Volume};

use super::ContextResources;
use crate::error::{ContextError, ContextResult};
use crate::handle::{
    Attachment, ContextHost, ContextKey, PlayingContext, SoundHandle, StreamRendering,
};
use crate::pool::{BufferPool, PcmBuffer};

/// Set in the cursor word once a non-looping sound has been fully rendered.
const STREAMED: u64 = 1 << 63;

/// A sound held entirely in one pooled buffer.
///
/// Looping never goes back to the decoder: the read cursor simply wraps.
/// The cursor and the "fully rendered" bit share one atomic word, which
/// the callback advances with a single compare-exchange; a seek that lands
/// in between wins.
pub struct BufferedContext {
    format: SampleFormat,
    frequency: u32,
    data: PcmBuffer,
    length: SampleNumber,
    /// The decode failed partway; looping is disabled.
    truncated: bool,
    pool: Arc<BufferPool>,
    volume: Volume,
    pause_after_finish: bool,
    looping: AtomicBool,
    paused: AtomicBool,
    paused_by_system: AtomicBool,
    finished: AtomicBool,
    cursor: AtomicU64,
    attachment: Attachment,
}

impl BufferedContext {
    /// Decode all of `source` into a buffer from the full pool.
    ///
    /// Fails when the pool is exhausted, or the source has no known length
    /// or one too large for `resources.max_full_bytes`.
    /// A decode error keeps whatever was decoded before it.
    pub fn new(
        source: Arc<dyn SampleSource>,
        start_immediately: bool,
        volume: f32,
        looping: bool,
        pause_after_finish: bool,
        resources: &ContextResources,
    ) -> ContextResult<Arc<Self>> {
        let format = source.format();
        let expected = source.sample_length();
        if expected == 0 {
            return Err(ContextError::UnboundedSource);
        }

        let bytes = usize::try_from(expected)
            .ok()
            .and_then(|samples| samples.checked_mul(format.bytes_per_sample()))
            .filter(|&bytes| bytes <= resources.max_full_bytes)
            .ok_or(ContextError::SoundTooLarge {
                samples: expected,
                limit: resources.max_full_bytes,
            })?;

        let pool = resources.full_pool.clone();
        let mut data = pool
            .acquire(bytes)
            .ok_or(ContextError::PoolExhausted { pool: pool.name() })?;

        let (fill, error) = fill_all(&*source, data.space_mut(), 0);
        if let Some(e) = &error {
            log::warn!(
                "buffered decode stopped at sample {} of {}: {}",
                fill.samples,
                expected,
                e
            );
        }
        data.set_filled(fill.bytes);

        Ok(Arc::new(Self {
            format,
            frequency: source.frequency(),
            data,
            length: fill.samples,
            truncated: error.is_some(),
            pool,
            volume: Volume::new(volume),
            pause_after_finish,
            looping: AtomicBool::new(looping),
            paused: AtomicBool::new(!start_immediately),
            paused_by_system: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            cursor: AtomicU64::new(0),
            attachment: Attachment::default(),
        }))
    }

    /// Decoded length in samples.
    pub fn sample_length(&self) -> SampleNumber {
        self.length
    }

    pub fn is_looping(&self) -> bool {
        !self.truncated && self.looping.load(Ordering::Acquire)
    }

    pub fn set_looping(&self, looping: bool) {
        self.looping.store(looping, Ordering::Release);
    }

    pub fn rewind(&self) -> bool {
        self.seek(0)
    }

    pub fn is_paused_by_system(&self) -> bool {
        self.paused_by_system.load(Ordering::Acquire)
    }
}

impl SoundHandle for BufferedContext {
    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.finished.store(true, Ordering::Release);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        if self.is_finished() {
            return;
        }
        if self.paused.swap(false, Ordering::AcqRel) {
            self.attachment.notify_resumed();
        }
    }

    fn current_position(&self) -> SampleNumber {
        self.cursor.load(Ordering::Acquire) & !STREAMED
    }

    /// Positions past the end wrap when looping and clamp to the end
    /// otherwise.
    fn seek(&self, position: SampleNumber) -> bool {
        if self.is_finished() {
            return false;
        }
        let target = if position < self.length {
            position
        } else if self.is_looping() && self.length > 0 {
            position % self.length
        } else {
            self.length
        };
        self.cursor.store(target, Ordering::Release);
        true
    }

    fn volume(&self) -> f32 {
        self.volume.get()
    }

    fn set_volume(&self, volume: f32) {
        self.volume.set(volume);
    }
}

impl StreamRendering for BufferedContext {
    fn render_audio(&self, block: &mut RenderBlock<'_>) -> bool {
        if self.finished.load(Ordering::Acquire)
            || self.paused.load(Ordering::Acquire)
            || self.paused_by_system.load(Ordering::Acquire)
        {
            return false;
        }
        let word = self.cursor.load(Ordering::Acquire);
        if word & STREAMED != 0 {
            return false;
        }

        let looping = self.is_looping() && self.length > 0;
        let volume = self.volume.get();
        let frame = self.format.bytes_per_sample();
        let pcm = self.data.filled();
        let frames = block.frames();
        let mut position = word;
        let mut written = 0;

        while written < frames {
            if position >= self.length {
                if !looping {
                    break;
                }
                position = 0;
            }
            let n = block.write_pcm(written, &pcm[position as usize * frame..], self.format, volume);
            if n == 0 {
                break;
            }
            written += n;
            position += n as u64;
        }

        let mut next = position;
        if written < frames {
            block.silence_from(written);
            if !looping {
                next |= STREAMED;
            }
        }
        // A seek since `word` was read takes precedence.
        let _ = self
            .cursor
            .compare_exchange(word, next, Ordering::AcqRel, Ordering::Acquire);
        written > 0
    }

    fn is_stopped_rendering(&self) -> bool {
        self.is_finished()
    }

    fn is_paused_rendering(&self) -> bool {
        self.is_paused() || self.is_paused_by_system()
    }

    fn is_high_priority(&self) -> bool {
        true
    }
}

impl PlayingContext for BufferedContext {
    fn frequency(&self) -> u32 {
        self.frequency
    }

    fn update(&self) {
        if self.is_finished() {
            return;
        }
        if self.cursor.load(Ordering::Acquire) & STREAMED != 0 {
            if self.pause_after_finish {
                self.paused.store(true, Ordering::Release);
            } else {
                self.finished.store(true, Ordering::Release);
            }
        }
    }

    /// The decoded buffer goes back to the pool when the context is dropped,
    /// since the callback may still be reading it until then.
    fn release_resources(&self) {}

    fn attach(&self, key: ContextKey, host: Weak<dyn ContextHost>) {
        self.attachment.attach(key, host);
    }

    fn rendering(self: Arc<Self>) -> Arc<dyn StreamRendering> {
        self
    }

    fn pause_by_system(&self) -> bool {
        if self.is_finished() || self.is_paused() {
            return false;
        }
        !self.paused_by_system.swap(true, Ordering::AcqRel)
    }

    fn resume_by_system(&self) {
        self.paused_by_system.store(false, Ordering::Release);
    }
}

impl Drop for BufferedContext {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ramp, resources, Flaky, Inflated};

    fn buffered(len: usize, looping: bool, pause_after_finish: bool) -> Arc<BufferedContext> {
        let res = resources(4, 4);
        BufferedContext::new(ramp(len), true, 1.0, looping, pause_after_finish, &res).unwrap()
    }

    fn render(ctx: &BufferedContext, frames: usize) -> (bool, Vec<i16>) {
        let mut out = vec![0i16; frames];
        let played = ctx.render_audio(&mut RenderBlock::i16(&mut out, 1));
        (played, out)
    }

    // --- Decoding ---

    #[test]
    fn decodes_whole_source() {
        let ctx = buffered(1_000, false, false);
        assert_eq!(ctx.sample_length(), 1_000);
        assert_eq!(ctx.frequency(), 44100);
    }

    #[test]
    fn unbounded_source_is_rejected() {
        let res = resources(4, 4);
        let endless: Arc<dyn SampleSource> = Arc::new(md_pcm::SineWaveSource::new(
            SampleFormat::Mono16,
            44100,
            0,
            440.0,
            0.5,
        ));
        let result = BufferedContext::new(endless, true, 1.0, false, false, &res);
        assert!(matches!(result, Err(ContextError::UnboundedSource)));
    }

    #[test]
    fn overflowing_length_is_rejected() {
        let res = resources(4, 4);
        let liar: Arc<dyn SampleSource> = Arc::new(Inflated { length: u64::MAX / 2 });
        let result = BufferedContext::new(liar, true, 1.0, false, false, &res);
        assert!(matches!(result, Err(ContextError::SoundTooLarge { .. })));
        assert_eq!(res.full_pool.outstanding(), 0);
    }

    #[test]
    fn length_over_the_buffer_cap_is_rejected() {
        let res = resources(4, 4).with_max_full_bytes(4_000);
        let big: Arc<dyn SampleSource> = Arc::new(Inflated { length: 1_001 });
        let result = BufferedContext::new(big, true, 1.0, false, false, &res);
        assert_eq!(
            result.err(),
            Some(ContextError::SoundTooLarge {
                samples: 1_001,
                limit: 4_000
            })
        );

        let fits: Arc<dyn SampleSource> = Arc::new(Inflated { length: 1_000 });
        assert!(BufferedContext::new(fits, true, 1.0, false, false, &res).is_ok());
    }

    #[test]
    fn exhausted_full_pool_fails_and_drop_returns_buffer() {
        let res = resources(4, 1);
        let first = BufferedContext::new(ramp(10), true, 1.0, false, false, &res).unwrap();
        assert!(BufferedContext::new(ramp(10), true, 1.0, false, false, &res).is_err());
        drop(first);
        assert_eq!(res.full_pool.outstanding(), 0);
        assert!(BufferedContext::new(ramp(10), true, 1.0, false, false, &res).is_ok());
    }

    #[test]
    fn failed_decode_keeps_prefix_and_disables_looping() {
        let res = resources(4, 4);
        let ctx = BufferedContext::new(Flaky::new(1_000, 300), true, 1.0, true, false, &res).unwrap();
        assert_eq!(ctx.sample_length(), 300);
        assert!(!ctx.is_looping());

        let (played, out) = render(&ctx, 400);
        assert!(played);
        assert_eq!(out[299], 299);
        assert_eq!(out[300], 0);
        ctx.update();
        assert!(ctx.is_finished());
    }

    // --- Looping ---

    #[test]
    fn looping_wraps_cursor() {
        let ctx = buffered(100, true, false);
        let (_, out) = render(&ctx, 250);
        for (i, &v) in out.iter().enumerate() {
            assert_eq!(v as usize, i % 100);
        }
        assert_eq!(ctx.current_position(), 50);
        ctx.update();
        assert!(!ctx.is_finished());
    }

    #[test]
    fn seek_past_end_normalizes_when_looping() {
        let ctx = buffered(100, true, false);
        assert!(ctx.seek(250));
        assert_eq!(ctx.current_position(), 50);
        assert_eq!(render(&ctx, 1).1[0], 50);
    }

    #[test]
    fn seek_past_end_clamps_when_not_looping() {
        let ctx = buffered(100, false, false);
        assert!(ctx.seek(250));
        assert_eq!(ctx.current_position(), 100);
        assert!(!render(&ctx, 10).0);
        ctx.update();
        assert!(ctx.is_finished());
        assert!(!ctx.seek(0));
    }

    #[test]
    fn turning_looping_off_lets_it_finish() {
        let ctx = buffered(100, true, false);
        render(&ctx, 150);
        ctx.set_looping(false);
        let (_, out) = render(&ctx, 100);
        assert_eq!(out[49], 99);
        assert_eq!(out[50], 0);
        ctx.update();
        assert!(ctx.is_finished());
    }

    // --- End of data ---

    #[test]
    fn finishes_once_rendered() {
        let ctx = buffered(100, false, false);
        render(&ctx, 64);
        ctx.update();
        assert!(!ctx.is_finished());
        render(&ctx, 64);
        ctx.update();
        assert!(ctx.is_finished());
        assert_eq!(ctx.current_position(), 100);
    }

    #[test]
    fn pause_after_finish_holds_at_end_and_rewinds() {
        let ctx = buffered(100, false, true);
        render(&ctx, 128);
        ctx.update();
        assert!(ctx.is_paused());
        assert!(!ctx.is_finished());
        assert_eq!(ctx.current_position(), 100);

        assert!(ctx.rewind());
        ctx.resume();
        assert_eq!(render(&ctx, 3).1, [0, 1, 2]);
    }

    // --- System pause ---

    #[test]
    fn system_pause_is_invisible_to_user_state() {
        let ctx = buffered(1_000, false, false);
        assert!(ctx.pause_by_system());
        assert!(!ctx.pause_by_system());
        assert!(!ctx.is_paused());
        assert!(ctx.is_paused_rendering());
        assert!(!render(&ctx, 10).0);

        ctx.resume_by_system();
        assert!(render(&ctx, 10).0);
    }

    #[test]
    fn system_pause_skips_user_paused() {
        let ctx = buffered(1_000, false, false);
        ctx.pause();
        assert!(!ctx.pause_by_system());
        assert!(ctx.is_paused());
    }

    #[test]
    fn pause_twice_keeps_state() {
        let ctx = buffered(1_000, false, false);
        render(&ctx, 10);
        ctx.pause();
        ctx.pause();
        ctx.update();
        assert!(ctx.is_paused());
        assert_eq!(ctx.current_position(), 10);
    }
}
