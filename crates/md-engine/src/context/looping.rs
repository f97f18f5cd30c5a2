//! Streaming playback that repeats an interval of its source.

use std::sync::{Arc, Weak};

use md_pcm::{LoopHoldSource, RenderBlock, SampleNumber, SampleSource};

use super::{ContextResources, StreamingContext};
use crate::error::{ContextError, ContextResult};
use crate::handle::{ContextHost, ContextKey, PlayingContext, SoundHandle, StreamRendering};

type Hold = LoopHoldSource<Arc<dyn SampleSource>>;

/// A streaming context reading through a [`LoopHoldSource`].
///
/// While looping, [`current_position`](SoundHandle::current_position)
/// keeps counting past `loop_finish`. After [`stop_looping`] it reports the
/// position inside the source instead.
///
/// [`stop_looping`]: LoopingContext::stop_looping
pub struct LoopingContext {
    stream: StreamingContext,
    hold: Arc<Hold>,
}

impl LoopingContext {
    pub fn new(
        source: Arc<dyn SampleSource>,
        loop_start: SampleNumber,
        loop_finish: SampleNumber,
        start_immediately: bool,
        volume: f32,
        resources: &ContextResources,
    ) -> ContextResult<Arc<Self>> {
        if loop_start >= loop_finish {
            return Err(ContextError::InvalidLoop {
                start: loop_start,
                finish: loop_finish,
            });
        }
        let hold = Arc::new(LoopHoldSource::new(source, loop_start, loop_finish, true));
        let stream = StreamingContext::build(
            hold.clone() as Arc<dyn SampleSource>,
            start_immediately,
            volume,
            false,
            resources,
        )?;
        Ok(Arc::new(Self { stream, hold }))
    }

    pub fn loop_interval(&self) -> (SampleNumber, SampleNumber) {
        self.hold.loop_interval()
    }

    pub fn is_looping(&self) -> bool {
        self.hold.is_looping()
    }

    /// Let the current iteration play out and continue into the rest of
    /// the source. Audio already decoded ahead stays queued.
    pub fn stop_looping(&self) {
        self.stream.with_fetch_position(|fetched| {
            let resume_at = self.hold.release_after(fetched);
            log::debug!("loop released; linear playback from unrolled sample {resume_at}");
        });
    }
}

impl SoundHandle for LoopingContext {
    fn is_finished(&self) -> bool {
        self.stream.is_finished()
    }

    fn stop(&self) {
        self.stream.stop();
    }

    fn is_paused(&self) -> bool {
        self.stream.is_paused()
    }

    fn pause(&self) {
        self.stream.pause();
    }

    fn resume(&self) {
        self.stream.resume();
    }

    fn current_position(&self) -> SampleNumber {
        let unrolled = self.stream.current_position();
        if self.hold.is_looping() {
            unrolled
        } else {
            self.hold.map_position(unrolled)
        }
    }

    /// While looping, `position` is unrolled and may lie past the loop.
    /// After the loop was released it is a plain source position.
    fn seek(&self, position: SampleNumber) -> bool {
        if self.is_finished() {
            return false;
        }
        self.stream.seek_with(position, || {
            if !self.hold.is_looping() {
                self.hold.release_all();
            }
        });
        true
    }

    fn volume(&self) -> f32 {
        self.stream.volume()
    }

    fn set_volume(&self, volume: f32) {
        self.stream.set_volume(volume);
    }
}

impl StreamRendering for LoopingContext {
    fn render_audio(&self, block: &mut RenderBlock<'_>) -> bool {
        self.stream.render_audio(block)
    }

    fn is_stopped_rendering(&self) -> bool {
        self.stream.is_stopped_rendering()
    }

    fn is_paused_rendering(&self) -> bool {
        self.stream.is_paused_rendering()
    }
}

impl PlayingContext for LoopingContext {
    fn frequency(&self) -> u32 {
        self.stream.frequency()
    }

    fn update(&self) {
        self.stream.update();
    }

    fn release_resources(&self) {
        self.stream.release_resources();
    }

    fn attach(&self, key: ContextKey, host: Weak<dyn ContextHost>) {
        self.stream.attach(key, host);
    }

    fn rendering(self: Arc<Self>) -> Arc<dyn StreamRendering> {
        self
    }
}
