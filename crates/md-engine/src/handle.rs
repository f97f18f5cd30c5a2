//! Traits shared by every playing context.

use std::sync::{Arc, OnceLock, Weak};

use md_pcm::{RenderBlock, SampleNumber};

slotmap::new_key_type! {
    /// Key of a context in the mixer's tracking table.
    pub struct ContextKey;
}

/// User-visible state of a sound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    Playing,
    Paused,
    Finished,
}

/// Playback control handed to game code for one sound.
pub trait SoundHandle: Send + Sync {
    fn is_finished(&self) -> bool;

    /// Finish the sound. Its buffers go back on the next housekeeping pass.
    fn stop(&self);

    fn is_paused(&self) -> bool;

    fn pause(&self);

    fn resume(&self);

    /// Position of the play head in samples.
    fn current_position(&self) -> SampleNumber;

    /// Move the play head. Returns false if the sound is finished or the
    /// position is past the end.
    fn seek(&self, position: SampleNumber) -> bool;

    fn volume(&self) -> f32;

    /// Negative and non-finite volumes are stored as 0.
    fn set_volume(&self, volume: f32);

    fn state(&self) -> PlaybackState {
        if self.is_finished() {
            PlaybackState::Finished
        } else if self.is_paused() {
            PlaybackState::Paused
        } else {
            PlaybackState::Playing
        }
    }
}

/// The callback-facing side of a context.
pub trait StreamRendering: Send + Sync {
    /// Write this context's next block of audio into `block`.
    ///
    /// Called on the audio callback: must not block, allocate or decode.
    /// Returns false when there was nothing to contribute, in which case
    /// the contents of `block` are unspecified.
    fn render_audio(&self, block: &mut RenderBlock<'_>) -> bool;

    /// Finished or stopped; the stream drops it on its next rebuild.
    fn is_stopped_rendering(&self) -> bool;

    /// Paused for any reason.
    fn is_paused_rendering(&self) -> bool;

    /// High-priority contexts stay strongly held by the stream while paused.
    fn is_high_priority(&self) -> bool {
        false
    }
}

/// Notified when a context needs the mixer's attention.
pub trait ContextHost: Send + Sync {
    /// A paused context was resumed and should be held and queued again.
    fn context_resumed(&self, key: ContextKey);
}

/// Everything the mixer drives on a context from the housekeeping thread.
pub trait PlayingContext: SoundHandle + StreamRendering {
    /// Sample rate of the stream this context renders on.
    fn frequency(&self) -> u32;

    /// Housekeeping step: refill buffers, recycle spent ones, settle state.
    fn update(&self);

    /// Return every pooled buffer this context can give back right now.
    fn release_resources(&self);

    /// Record the tracking key and the host to notify on resume.
    fn attach(&self, key: ContextKey, host: Weak<dyn ContextHost>);

    fn rendering(self: Arc<Self>) -> Arc<dyn StreamRendering>;

    /// Pause on behalf of the system. Returns true if the context was
    /// actually playing and is now held.
    fn pause_by_system(&self) -> bool {
        false
    }

    fn resume_by_system(&self) {}
}

/// Link from a context back to the mixer that tracks it.
#[derive(Default)]
pub(crate) struct Attachment {
    key: OnceLock<ContextKey>,
    host: OnceLock<Weak<dyn ContextHost>>,
}

impl Attachment {
    pub(crate) fn attach(&self, key: ContextKey, host: Weak<dyn ContextHost>) {
        if self.key.set(key).is_err() || self.host.set(host).is_err() {
            log::debug!("context attached twice; keeping the first host");
        }
    }

    pub(crate) fn notify_resumed(&self) {
        if let (Some(key), Some(host)) = (self.key.get(), self.host.get()) {
            if let Some(host) = host.upgrade() {
                host.context_resumed(*key);
            }
        }
    }
}
