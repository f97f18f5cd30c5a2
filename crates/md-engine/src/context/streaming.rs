//! Streaming playback: PCM is decoded a few buffers ahead of the callback.
//!
//! Buffers travel in a loop. The housekeeping thread fills spare buffers
//! and pushes them onto the `queued` ring; the callback converts them into
//! the output and pushes them onto the `spent` ring; the next update moves
//! spent buffers back to the spare list. The pool only sees them again when
//! the context is done.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use arrayvec::ArrayVec;
use md_pcm::{fill_all, RenderBlock, SampleFormat, SampleNumber, SampleSource, Volume};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use super::{ContextResources, MAX_DECODE_AHEAD};
use crate::error::{ContextError, ContextResult};
use crate::handle::{
    Attachment, ContextHost, ContextKey, PlayingContext, SoundHandle, StreamRendering,
};
use crate::pool::{BufferPool, PcmBuffer};

/// A filled buffer and the sample it starts at.
struct Segment {
    start: SampleNumber,
    buffer: PcmBuffer,
}

/// Housekeeping side. Locked by update, seek and resume.
struct Feeder {
    queued: HeapProd<Segment>,
    spent: HeapCons<PcmBuffer>,
    spare: ArrayVec<PcmBuffer, MAX_DECODE_AHEAD>,
    next_sample: SampleNumber,
    released: bool,
}

/// Callback side. The callback only ever `try_lock`s it.
struct Renderer {
    queued: HeapCons<Segment>,
    spent: HeapProd<PcmBuffer>,
    current: Option<Segment>,
    /// Samples of `current` already rendered.
    offset: usize,
}

/// A sound decoded incrementally from its source while it plays.
pub struct StreamingContext {
    source: Arc<dyn SampleSource>,
    format: SampleFormat,
    samples_per_buffer: usize,
    pool: Arc<BufferPool>,
    volume: Volume,
    pause_after_finish: bool,
    paused: AtomicBool,
    finished: AtomicBool,
    /// The source has no more data past what is queued.
    all_queued: AtomicBool,
    /// The callback has rendered everything that was queued.
    all_streamed: AtomicBool,
    position: AtomicU64,
    feeder: Mutex<Feeder>,
    renderer: Mutex<Renderer>,
    attachment: Attachment,
}

impl StreamingContext {
    /// Reserve decode-ahead buffers and, when `start_immediately`, prime
    /// them from the source. Otherwise the context starts paused.
    pub fn new(
        source: Arc<dyn SampleSource>,
        start_immediately: bool,
        volume: f32,
        pause_after_finish: bool,
        resources: &ContextResources,
    ) -> ContextResult<Arc<Self>> {
        Self::build(source, start_immediately, volume, pause_after_finish, resources).map(Arc::new)
    }

    pub(crate) fn build(
        source: Arc<dyn SampleSource>,
        start_immediately: bool,
        volume: f32,
        pause_after_finish: bool,
        resources: &ContextResources,
    ) -> ContextResult<Self> {
        let depth = resources.decode_ahead.clamp(1, MAX_DECODE_AHEAD);
        let pool = resources.segment_pool.clone();
        let buffers = pool
            .acquire_many(depth, resources.segment_bytes())
            .ok_or(ContextError::PoolExhausted { pool: pool.name() })?;

        let (queued_tx, queued_rx) = HeapRb::<Segment>::new(depth).split();
        let (spent_tx, spent_rx) = HeapRb::<PcmBuffer>::new(depth).split();

        let context = Self {
            format: source.format(),
            source,
            samples_per_buffer: resources.samples_per_buffer,
            pool,
            volume: Volume::new(volume),
            pause_after_finish,
            paused: AtomicBool::new(!start_immediately),
            finished: AtomicBool::new(false),
            all_queued: AtomicBool::new(false),
            all_streamed: AtomicBool::new(false),
            position: AtomicU64::new(0),
            feeder: Mutex::new(Feeder {
                queued: queued_tx,
                spent: spent_rx,
                spare: buffers.into_iter().collect(),
                next_sample: 0,
                released: false,
            }),
            renderer: Mutex::new(Renderer {
                queued: queued_rx,
                spent: spent_tx,
                current: None,
                offset: 0,
            }),
            attachment: Attachment::default(),
        };

        if start_immediately {
            context.prime();
        }
        Ok(context)
    }

    pub fn source(&self) -> &Arc<dyn SampleSource> {
        &self.source
    }

    fn lock_feeder(&self) -> MutexGuard<'_, Feeder> {
        self.feeder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_renderer(&self) -> MutexGuard<'_, Renderer> {
        self.renderer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prime(&self) {
        let mut feeder = self.lock_feeder();
        self.refill(&mut feeder);
    }

    /// Move buffers the callback is done with back to the spare list.
    fn collect_spent(&self, feeder: &mut Feeder) {
        while let Some(buffer) = feeder.spent.try_pop() {
            self.keep_spare(feeder, buffer);
        }
    }

    fn keep_spare(&self, feeder: &mut Feeder, buffer: PcmBuffer) {
        if let Err(overflow) = feeder.spare.try_push(buffer) {
            self.pool.release(overflow.element());
        }
    }

    /// Decode into spare buffers until the queue is full or the source ends.
    fn refill(&self, feeder: &mut Feeder) {
        if feeder.released {
            return;
        }
        self.collect_spent(feeder);

        let wanted = self.samples_per_buffer * self.format.bytes_per_sample();
        while !self.all_queued.load(Ordering::Acquire) && feeder.queued.vacant_len() > 0 {
            let Some(mut buffer) = feeder.spare.pop() else {
                break;
            };

            let (fill, error) =
                fill_all(&*self.source, &mut buffer.space_mut()[..wanted], feeder.next_sample);
            if let Some(e) = &error {
                log::warn!(
                    "sound source failed at sample {}, truncating: {}",
                    feeder.next_sample + fill.samples,
                    e
                );
            }
            let last = error.is_some() || fill.bytes < wanted;

            if fill.is_empty() {
                self.keep_spare(feeder, buffer);
            } else {
                buffer.set_filled(fill.bytes);
                let segment = Segment {
                    start: feeder.next_sample,
                    buffer,
                };
                feeder.next_sample += fill.samples;
                if let Err(rejected) = feeder.queued.try_push(segment) {
                    self.keep_spare(feeder, rejected.buffer);
                    break;
                }
            }

            if last {
                self.all_queued.store(true, Ordering::Release);
            }
        }
    }

    /// Drop everything queued and restart fetching at `position` on the
    /// next update. `under_lock` runs while both sides are held.
    pub(crate) fn seek_with(&self, position: SampleNumber, under_lock: impl FnOnce()) {
        let mut feeder = self.lock_feeder();
        let mut renderer = self.lock_renderer();

        if let Some(segment) = renderer.current.take() {
            self.keep_spare(&mut feeder, segment.buffer);
        }
        while let Some(segment) = renderer.queued.try_pop() {
            self.keep_spare(&mut feeder, segment.buffer);
        }
        self.collect_spent(&mut feeder);

        renderer.offset = 0;
        feeder.next_sample = position;
        self.all_queued.store(false, Ordering::Release);
        self.all_streamed.store(false, Ordering::Release);
        self.position.store(position, Ordering::Release);
        under_lock();
    }

    /// Run `f` with the position decoding will continue from, while no
    /// fetch can happen.
    pub(crate) fn with_fetch_position<R>(&self, f: impl FnOnce(SampleNumber) -> R) -> R {
        let feeder = self.lock_feeder();
        f(feeder.next_sample)
    }
}

impl SoundHandle for StreamingContext {
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
            self.prime();
            self.attachment.notify_resumed();
        }
    }

    fn current_position(&self) -> SampleNumber {
        self.position.load(Ordering::Acquire)
    }

    fn seek(&self, position: SampleNumber) -> bool {
        if self.is_finished() {
            return false;
        }
        let length = self.source.sample_length();
        if length > 0 && position >= length {
            self.stop();
            return false;
        }
        self.seek_with(position, || {});
        true
    }

    fn volume(&self) -> f32 {
        self.volume.get()
    }

    fn set_volume(&self, volume: f32) {
        self.volume.set(volume);
    }
}

impl StreamRendering for StreamingContext {
    fn render_audio(&self, block: &mut RenderBlock<'_>) -> bool {
        if self.finished.load(Ordering::Acquire)
            || self.paused.load(Ordering::Acquire)
            || self.all_streamed.load(Ordering::Acquire)
        {
            return false;
        }
        let Ok(mut guard) = self.renderer.try_lock() else {
            return false;
        };
        let renderer = &mut *guard;

        let volume = self.volume.get();
        let frame = self.format.bytes_per_sample();
        let frames = block.frames();
        let mut written = 0;

        while written < frames {
            if renderer.current.is_none() {
                renderer.current = renderer.queued.try_pop();
                renderer.offset = 0;
            }
            let Some(segment) = renderer.current.as_ref() else {
                break;
            };

            let pcm = &segment.buffer.filled()[renderer.offset * frame..];
            let n = block.write_pcm(written, pcm, self.format, volume);
            written += n;
            renderer.offset += n;
            self.position
                .store(segment.start + renderer.offset as u64, Ordering::Release);

            if renderer.offset * frame >= segment.buffer.filled_len() {
                if let Some(done) = renderer.current.take() {
                    // Sized for every buffer this context owns; cannot be full.
                    let _ = renderer.spent.try_push(done.buffer);
                }
            }
            if n == 0 {
                break;
            }
        }

        if written < frames {
            if renderer.current.is_none()
                && self.all_queued.load(Ordering::Acquire)
                && renderer.queued.is_empty()
            {
                self.all_streamed.store(true, Ordering::Release);
            }
            block.silence_from(written);
        }
        written > 0
    }

    fn is_stopped_rendering(&self) -> bool {
        self.is_finished()
    }

    fn is_paused_rendering(&self) -> bool {
        self.is_paused()
    }
}

impl PlayingContext for StreamingContext {
    fn frequency(&self) -> u32 {
        self.source.frequency()
    }

    fn update(&self) {
        if self.is_finished() {
            self.release_resources();
            return;
        }

        let mut feeder = self.lock_feeder();
        self.collect_spent(&mut feeder);

        if self.all_streamed.load(Ordering::Acquire) {
            if self.pause_after_finish {
                self.paused.store(true, Ordering::Release);
            } else {
                self.finished.store(true, Ordering::Release);
                drop(feeder);
                self.release_resources();
            }
            return;
        }

        if !self.is_paused() {
            self.refill(&mut feeder);
        }
    }

    fn release_resources(&self) {
        let mut feeder = self.lock_feeder();
        if feeder.released {
            return;
        }
        let mut renderer = self.lock_renderer();

        if let Some(segment) = renderer.current.take() {
            self.pool.release(segment.buffer);
        }
        while let Some(segment) = renderer.queued.try_pop() {
            self.pool.release(segment.buffer);
        }
        while let Some(buffer) = feeder.spent.try_pop() {
            self.pool.release(buffer);
        }
        for buffer in feeder.spare.drain(..) {
            self.pool.release(buffer);
        }
        feeder.released = true;
    }

    fn attach(&self, key: ContextKey, host: Weak<dyn ContextHost>) {
        self.attachment.attach(key, host);
    }

    fn rendering(self: Arc<Self>) -> Arc<dyn StreamRendering> {
        self
    }
}

impl Drop for StreamingContext {
    fn drop(&mut self) {
        self.release_resources();
    }
}
