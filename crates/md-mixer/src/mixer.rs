//! The mixer: owns the output streams, tracks every playing context and
//! runs the housekeeping thread that keeps them fed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use md_audio::{AudioBackend, CpalBackend, ManualBackend, StreamRequest};
use md_engine::{
    BufferPool, BufferedContext, ContextHost, ContextKey, ContextResources, ContextResult,
    LoopingContext, PlaybackState, PlayingContext, SoundHandle, StreamRendering, StreamingContext,
};
use md_pcm::{SampleNumber, SampleSource};
use slotmap::SlotMap;

use crate::config::{BackendKind, MixerConfig};
use crate::error::{MixerError, MixerResult};
use crate::housekeeping::{self, Wake};
use crate::stream::OutputStream;

/// Lifecycle of a [`Mixer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MixerState {
    Uninitialized,
    Initialized,
    /// In the background: streams stopped, housekeeping parked.
    Suspended,
    ShuttingDown,
    Terminated,
}

/// A context as seen by the mixer: always weakly tracked, strongly held
/// while it is playing.
struct Tracked {
    weak: Weak<dyn PlayingContext>,
    strong: Option<Arc<dyn PlayingContext>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the mixer handle, the housekeeping thread and the
/// contexts (through [`ContextHost`]).
pub(crate) struct MixerShared {
    config: MixerConfig,
    backend: Arc<dyn AudioBackend>,
    resources: ContextResources,
    /// Lock order: state, then streams, then contexts.
    state: Mutex<MixerState>,
    streams: Mutex<BTreeMap<u32, Arc<OutputStream>>>,
    contexts: Mutex<SlotMap<ContextKey, Tracked>>,
    system_paused: Mutex<Vec<Arc<dyn PlayingContext>>>,
    wake: Wake,
    running: AtomicBool,
}

impl MixerShared {
    pub(crate) fn config(&self) -> &MixerConfig {
        &self.config
    }

    pub(crate) fn wake(&self) -> &Wake {
        &self.wake
    }

    pub(crate) fn keep_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn stream(&self, rate: u32) -> Option<Arc<OutputStream>> {
        lock(&self.streams).get(&rate).cloned()
    }

    fn all_streams(&self) -> Vec<Arc<OutputStream>> {
        lock(&self.streams).values().cloned().collect()
    }

    /// The stream for `rate`, opened on first use and started when the
    /// mixer is running. `None` once that rate has permanently failed.
    fn stream_for(&self, rate: u32, state: MixerState) -> Option<Arc<OutputStream>> {
        let mut streams = lock(&self.streams);
        let stream = streams
            .entry(rate)
            .or_insert_with(|| {
                let stream = OutputStream::open(
                    Arc::clone(&self.backend),
                    StreamRequest::new(rate, self.config.output_channels, self.config.output_format),
                    self.config.stream_retry_limit,
                    self.config.update_quantum(),
                );
                if state == MixerState::Initialized {
                    if let Err(e) = stream.start() {
                        log::warn!("failed to start stream at {} Hz: {}", rate, e);
                    }
                }
                stream
            })
            .clone();
        (!stream.is_failed()).then_some(stream)
    }

    fn live_contexts(&self) -> Vec<(ContextKey, Arc<dyn PlayingContext>)> {
        let mut contexts = lock(&self.contexts);
        contexts.retain(|_, tracked| tracked.weak.strong_count() > 0);
        contexts
            .iter()
            .filter_map(|(key, tracked)| tracked.weak.upgrade().map(|c| (key, c)))
            .collect()
    }

    /// Housekeeping step: update every context, then settle how firmly the
    /// mixer holds it.
    pub(crate) fn update_contexts(&self) {
        let live = self.live_contexts();
        for (_, context) in &live {
            context.update();
        }

        let mut finished = 0usize;
        {
            let mut contexts = lock(&self.contexts);
            for (key, context) in &live {
                match context.state() {
                    PlaybackState::Finished => {
                        contexts.remove(*key);
                        finished += 1;
                    }
                    PlaybackState::Paused => {
                        if let Some(tracked) = contexts.get_mut(*key) {
                            tracked.strong = None;
                        }
                    }
                    PlaybackState::Playing => {
                        if let Some(tracked) = contexts.get_mut(*key) {
                            tracked.strong.get_or_insert_with(|| Arc::clone(context));
                        }
                    }
                }
            }
        }
        if finished > 0 {
            log::debug!("{} of {} sounds finished", finished, live.len());
        }
        // Last references to finished contexts may go here, returning their
        // buffers on this thread.
        drop(live);
    }

    pub(crate) fn service_streams(&self, now: Instant) {
        for stream in self.all_streams() {
            stream.service(now);
        }
    }

    pub(crate) fn rebuild_streams(&self) {
        for stream in self.all_streams() {
            stream.rebuild();
        }
    }
}

impl ContextHost for MixerShared {
    fn context_resumed(&self, key: ContextKey) {
        let context = {
            let mut contexts = lock(&self.contexts);
            let Some(tracked) = contexts.get_mut(key) else {
                return;
            };
            let Some(context) = tracked.weak.upgrade() else {
                return;
            };
            tracked.strong.get_or_insert_with(|| Arc::clone(&context));
            context
        };

        if !context.is_high_priority() {
            if let Some(stream) = self.stream(context.frequency()) {
                stream.register(Arc::clone(&context).rendering());
            }
        }
        self.wake.signal();
    }
}

/// Plays sounds on native output streams, one stream per sample rate.
///
/// Nothing plays until [`Mixer::initialize`]. Dropping the mixer shuts it
/// down; contexts still held by callers stay valid but go silent.
pub struct Mixer {
    shared: Arc<MixerShared>,
    housekeeping: Mutex<Option<JoinHandle<()>>>,
}

impl Mixer {
    /// Create a mixer on the backend named by `config`.
    pub fn new(config: MixerConfig) -> MixerResult<Self> {
        let backend: Arc<dyn AudioBackend> = match config.backend {
            BackendKind::Cpal => Arc::new(CpalBackend::new()),
            BackendKind::Manual => Arc::new(ManualBackend::new()),
        };
        Self::with_backend(config, backend)
    }

    /// Create a mixer on an explicit backend, ignoring `config.backend`.
    pub fn with_backend(config: MixerConfig, backend: Arc<dyn AudioBackend>) -> MixerResult<Self> {
        config.validate()?;

        let segment_pool = Arc::new(BufferPool::new("segment", config.max_segment_buffers));
        let full_pool = Arc::new(BufferPool::new("full", config.max_full_buffers));
        let resources = ContextResources::new(segment_pool, full_pool)
            .with_decode_ahead(config.decode_ahead_buffers)
            .with_samples_per_buffer(config.samples_per_buffer)
            .with_max_full_bytes(config.max_full_buffer_bytes);

        Ok(Self {
            shared: Arc::new(MixerShared {
                wake: Wake::new(config.min_signal_interval()),
                config,
                backend,
                resources,
                state: Mutex::new(MixerState::Uninitialized),
                streams: Mutex::new(BTreeMap::new()),
                contexts: Mutex::new(SlotMap::with_key()),
                system_paused: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
            housekeeping: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &MixerConfig {
        &self.shared.config
    }

    pub fn state(&self) -> MixerState {
        *lock(&self.shared.state)
    }

    pub fn is_suspended(&self) -> bool {
        self.state() == MixerState::Suspended
    }

    // --- lifecycle ---

    /// Open and start the preparing-rate streams and start housekeeping.
    pub fn initialize(&self) -> MixerResult<()> {
        let mut state = lock(&self.shared.state);
        if *state != MixerState::Uninitialized {
            return Err(MixerError::InvalidState(*state));
        }

        for &rate in &self.shared.config.preparing_rates {
            if self.shared.stream_for(rate, MixerState::Initialized).is_none() {
                log::warn!("stream at {} Hz is unavailable", rate);
            }
        }
        self.start_housekeeping()?;
        *state = MixerState::Initialized;

        log::info!(
            "mixer initialized on {} backend ({} streams)",
            self.shared.backend.name(),
            lock(&self.shared.streams).len()
        );
        Ok(())
    }

    /// Stop everything and close every stream. Safe to call more than once.
    pub fn shutdown(&self) {
        let mut state = lock(&self.shared.state);
        if matches!(*state, MixerState::ShuttingDown | MixerState::Terminated) {
            return;
        }
        *state = MixerState::ShuttingDown;
        self.stop_housekeeping();

        let live = self.shared.live_contexts();
        for (_, context) in &live {
            context.stop();
        }
        lock(&self.shared.system_paused).clear();
        // Flush pending releases one last time.
        for (_, context) in &live {
            context.update();
            context.release_resources();
        }
        lock(&self.shared.contexts).clear();
        drop(live);

        let streams = std::mem::take(&mut *lock(&self.shared.streams));
        for stream in streams.values() {
            stream.close();
        }
        drop(streams);

        *state = MixerState::Terminated;
        log::info!("mixer shut down");
    }

    fn start_housekeeping(&self) -> MixerResult<()> {
        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("md-housekeeping".into())
            .spawn(move || housekeeping::run(shared));
        match spawned {
            Ok(handle) => {
                *lock(&self.housekeeping) = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                Err(MixerError::Thread(e))
            }
        }
    }

    fn stop_housekeeping(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake.notify();
        if let Some(handle) = lock(&self.housekeeping).take() {
            if handle.join().is_err() {
                log::error!("housekeeping thread panicked");
            }
        }
    }

    /// The app is going to the background.
    ///
    /// Buffered sounds that are playing are held by the system, then
    /// housekeeping is parked and every stream stopped.
    pub fn on_go_to_background(&self) {
        let mut state = lock(&self.shared.state);
        if *state != MixerState::Initialized {
            return;
        }
        *state = MixerState::Suspended;

        let held: Vec<_> = self
            .shared
            .live_contexts()
            .into_iter()
            .map(|(_, context)| context)
            .filter(|context| context.pause_by_system())
            .collect();
        let held_count = held.len();
        lock(&self.shared.system_paused).extend(held);

        self.stop_housekeeping();
        for stream in self.shared.all_streams() {
            if let Err(e) = stream.stop() {
                log::warn!("failed to stop stream at {} Hz: {}", stream.sample_rate(), e);
            }
        }
        log::info!("mixer suspended, {} sounds held", held_count);
    }

    /// The app is back: restart streams, release held sounds and
    /// housekeeping.
    pub fn on_return_from_background(&self) {
        let mut state = lock(&self.shared.state);
        if *state != MixerState::Suspended {
            return;
        }

        for stream in self.shared.all_streams() {
            if let Err(e) = stream.start() {
                log::warn!("failed to restart stream at {} Hz: {}", stream.sample_rate(), e);
            }
        }
        let held = std::mem::take(&mut *lock(&self.shared.system_paused));
        for context in &held {
            context.resume_by_system();
        }
        if let Err(e) = self.start_housekeeping() {
            log::error!("mixer resumed without housekeeping: {}", e);
        }
        *state = MixerState::Initialized;
        log::info!("mixer resumed, {} sounds released", held.len());
    }

    /// Drop cached pool buffers.
    pub fn on_memory_warning(&self) {
        let segments = self.shared.resources.segment_pool.trim();
        let full = self.shared.resources.full_pool.trim();
        log::info!("memory warning: freed {} segment and {} full buffers", segments, full);
    }

    /// Ask housekeeping to run soon. Signals are coalesced.
    pub fn hint_update(&self) {
        self.shared.wake.signal();
    }

    // --- playback ---

    /// Stream `source` through decode-ahead buffers.
    pub fn play(
        &self,
        source: Arc<dyn SampleSource>,
        start_immediately: bool,
        volume: f32,
        pause_after_finish: bool,
    ) -> Option<Arc<StreamingContext>> {
        let rate = source.frequency();
        self.admit("play", rate, |res| {
            StreamingContext::new(source, start_immediately, volume, pause_after_finish, res)
        })
    }

    /// Stream `source`, repeating `[loop_start, loop_finish)` until
    /// [`LoopingContext::stop_looping`].
    pub fn play_looping_sound(
        &self,
        source: Arc<dyn SampleSource>,
        loop_start: SampleNumber,
        loop_finish: SampleNumber,
        start_immediately: bool,
        volume: f32,
    ) -> Option<Arc<LoopingContext>> {
        let rate = source.frequency();
        self.admit("play_looping_sound", rate, |res| {
            LoopingContext::new(source, loop_start, loop_finish, start_immediately, volume, res)
        })
    }

    /// Decode all of `source` up front and play it from memory.
    pub fn play_buffered_sound(
        &self,
        source: Arc<dyn SampleSource>,
        start_immediately: bool,
        volume: f32,
        looping: bool,
        pause_after_finish: bool,
    ) -> Option<Arc<BufferedContext>> {
        let rate = source.frequency();
        self.admit("play_buffered_sound", rate, |res| {
            BufferedContext::new(source, start_immediately, volume, looping, pause_after_finish, res)
        })
    }

    fn admit<C>(
        &self,
        what: &str,
        rate: u32,
        build: impl FnOnce(&ContextResources) -> ContextResult<Arc<C>>,
    ) -> Option<Arc<C>>
    where
        C: PlayingContext + 'static,
    {
        if rate == 0 {
            log::warn!("{}: source has no sample rate", what);
            return None;
        }

        let stream = {
            let state = lock(&self.shared.state);
            match *state {
                MixerState::Initialized | MixerState::Suspended => {}
                other => {
                    log::warn!("{}: mixer is {:?}", what, other);
                    return None;
                }
            }
            match self.shared.stream_for(rate, *state) {
                Some(stream) => stream,
                None => {
                    log::warn!("{}: stream at {} Hz has failed", what, rate);
                    return None;
                }
            }
        };

        let context = match build(&self.shared.resources) {
            Ok(context) => context,
            Err(e) => {
                log::warn!("{}: {}", what, e);
                return None;
            }
        };

        let tracked: Arc<dyn PlayingContext> = context.clone();
        let key = lock(&self.shared.contexts).insert(Tracked {
            weak: Arc::downgrade(&tracked),
            strong: Some(Arc::clone(&tracked)),
        });
        let host = Arc::downgrade(&self.shared) as Weak<dyn ContextHost>;
        context.attach(key, host);
        stream.register(tracked.rendering());

        self.shared.wake.signal();
        Some(context)
    }

    /// Let go of every sound the mixer holds on behalf of nobody: paused
    /// sounds and finished ones stop being held, playing ones keep going.
    pub fn clear_non_managed_sounds(&self) {
        let released: Vec<_> = {
            let mut contexts = lock(&self.shared.contexts);
            let released = contexts
                .values_mut()
                .filter_map(|tracked| tracked.strong.take())
                .collect();
            contexts.retain(|_, tracked| match tracked.weak.upgrade() {
                Some(context) if !context.is_finished() => {
                    if !context.is_paused() {
                        tracked.strong = Some(context);
                    }
                    true
                }
                _ => false,
            });
            released
        };
        log::debug!("cleared holds on {} sounds", released.len());
        drop(released);
    }

    // --- inspection ---

    /// The stream for `rate`, if one was opened.
    pub fn stream(&self, rate: u32) -> Option<Arc<OutputStream>> {
        self.shared.stream(rate)
    }

    pub fn stream_rates(&self) -> Vec<u32> {
        lock(&self.shared.streams).keys().copied().collect()
    }

    /// Sounds the mixer still tracks, held or not.
    pub fn tracked_count(&self) -> usize {
        lock(&self.shared.contexts)
            .values()
            .filter(|tracked| tracked.weak.strong_count() > 0)
            .count()
    }

    /// Sounds the mixer keeps alive on its own.
    pub fn held_count(&self) -> usize {
        lock(&self.shared.contexts)
            .values()
            .filter(|tracked| tracked.strong.is_some())
            .count()
    }

    pub fn resources(&self) -> &ContextResources {
        &self.shared.resources
    }
}

impl Drop for Mixer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use md_pcm::{MemorySource, SampleFormat, SineWaveSource};

    fn manual_mixer(config: MixerConfig) -> (Mixer, ManualBackend) {
        let backend = ManualBackend::new();
        let mixer = Mixer::with_backend(config, Arc::new(backend.clone())).unwrap();
        (mixer, backend)
    }

    fn config() -> MixerConfig {
        MixerConfig::default()
            .with_backend(BackendKind::Manual)
            .with_preparing_rates([44100])
            .with_samples_per_buffer(512)
    }

    fn tone(rate: u32, seconds: u32) -> Arc<dyn SampleSource> {
        Arc::new(SineWaveSource::new(
            SampleFormat::Mono16,
            rate,
            u64::from(rate * seconds),
            440.0,
            0.5,
        ))
    }

    fn settle(mixer: &Mixer) {
        thread::sleep(mixer.config().update_quantum() * 4);
    }

    // --- lifecycle ---

    #[test]
    fn initialize_opens_and_starts_preparing_streams() {
        let (mixer, backend) = manual_mixer(config().with_preparing_rates([44100, 48000]));
        assert_eq!(mixer.state(), MixerState::Uninitialized);
        mixer.initialize().unwrap();

        assert_eq!(mixer.state(), MixerState::Initialized);
        assert_eq!(backend.open_rates(), vec![44100, 48000]);
        assert!(backend.is_running(44100) && backend.is_running(48000));
        assert!(matches!(
            mixer.initialize(),
            Err(MixerError::InvalidState(MixerState::Initialized))
        ));
    }

    #[test]
    fn shutdown_is_idempotent_and_closes_streams() {
        let (mixer, backend) = manual_mixer(config());
        mixer.initialize().unwrap();
        let sound = mixer.play(tone(44100, 1), true, 1.0, false).unwrap();

        mixer.shutdown();
        mixer.shutdown();
        assert_eq!(mixer.state(), MixerState::Terminated);
        assert!(backend.open_rates().is_empty());
        assert!(sound.is_finished());
        assert_eq!(mixer.resources().segment_pool.outstanding(), 0);
    }

    #[test]
    fn play_is_refused_before_initialize_and_after_shutdown() {
        let (mixer, _backend) = manual_mixer(config());
        assert!(mixer.play(tone(44100, 1), true, 1.0, false).is_none());
        mixer.initialize().unwrap();
        mixer.shutdown();
        assert!(mixer.play(tone(44100, 1), true, 1.0, false).is_none());
    }

    // --- playback ---

    #[test]
    fn streams_open_lazily_per_rate() {
        let (mixer, backend) = manual_mixer(config());
        mixer.initialize().unwrap();
        let _sound = mixer.play(tone(22050, 1), true, 1.0, false).unwrap();

        assert_eq!(mixer.stream_rates(), vec![22050, 44100]);
        assert!(backend.is_running(22050));
    }

    #[test]
    fn misuse_returns_none() {
        let (mixer, _backend) = manual_mixer(config());
        mixer.initialize().unwrap();

        assert!(mixer.play_looping_sound(tone(44100, 1), 100, 100, true, 1.0).is_none());
        let endless: Arc<dyn SampleSource> = Arc::new(SineWaveSource::new(
            SampleFormat::Mono16,
            44100,
            0,
            440.0,
            0.5,
        ));
        assert!(mixer.play_buffered_sound(endless, true, 1.0, false, false).is_none());
        let silent_rate: Arc<dyn SampleSource> =
            Arc::new(MemorySource::new(SampleFormat::Mono8, 0, vec![128u8; 16]));
        assert!(mixer.play(silent_rate, true, 1.0, false).is_none());
        assert_eq!(mixer.tracked_count(), 0);
    }

    #[test]
    fn pool_exhaustion_returns_none() {
        let (mixer, _backend) = manual_mixer(config().with_pool_limits(4, 1));
        mixer.initialize().unwrap();

        let first = mixer.play(tone(44100, 1), true, 1.0, false);
        assert!(first.is_some());
        assert!(mixer.play(tone(44100, 1), true, 1.0, false).is_none());

        let buffered = mixer.play_buffered_sound(tone(44100, 1), true, 1.0, false, false);
        assert!(buffered.is_some());
        assert!(mixer
            .play_buffered_sound(tone(44100, 1), true, 1.0, false, false)
            .is_none());
    }

    // --- holding ---

    #[test]
    fn fire_and_forget_sounds_are_held_while_playing() {
        let (mixer, _backend) = manual_mixer(config());
        mixer.initialize().unwrap();
        drop(mixer.play(tone(44100, 5), true, 1.0, false));

        settle(&mixer);
        assert_eq!(mixer.tracked_count(), 1);
        assert_eq!(mixer.held_count(), 1);
    }

    #[test]
    fn paused_sounds_are_only_tracked() {
        let (mixer, _backend) = manual_mixer(config());
        mixer.initialize().unwrap();
        let sound = mixer.play(tone(44100, 5), false, 1.0, false).unwrap();

        settle(&mixer);
        assert_eq!(mixer.held_count(), 0);
        assert_eq!(mixer.tracked_count(), 1);

        sound.resume();
        assert_eq!(mixer.held_count(), 1);
    }

    #[test]
    fn clear_non_managed_releases_paused_sounds() {
        let (mixer, _backend) = manual_mixer(config().with_update_quantum_ms(1000));
        mixer.initialize().unwrap();
        let playing = mixer.play(tone(44100, 5), true, 1.0, false).unwrap();
        let paused = mixer.play(tone(44100, 5), true, 1.0, false).unwrap();
        paused.pause();

        mixer.clear_non_managed_sounds();
        assert_eq!(mixer.held_count(), 1);
        assert_eq!(mixer.tracked_count(), 2);
        assert!(!playing.is_paused());
    }

    // --- background ---

    #[test]
    fn background_stops_streams_and_holds_buffered_sounds() {
        let (mixer, backend) = manual_mixer(config());
        mixer.initialize().unwrap();
        let buffered = mixer
            .play_buffered_sound(tone(44100, 1), true, 1.0, false, false)
            .unwrap();
        let user_paused = mixer
            .play_buffered_sound(tone(44100, 1), false, 1.0, false, false)
            .unwrap();

        mixer.on_go_to_background();
        assert!(mixer.is_suspended());
        assert!(!backend.is_running(44100));
        assert!(buffered.is_paused_by_system());
        assert!(!buffered.is_paused());
        assert!(!user_paused.is_paused_by_system());

        // Allowed while suspended, but nothing starts.
        let late = mixer.play(tone(44100, 1), true, 1.0, false);
        assert!(late.is_some());
        assert!(!backend.is_running(44100));

        mixer.on_return_from_background();
        assert_eq!(mixer.state(), MixerState::Initialized);
        assert!(backend.is_running(44100));
        assert!(!buffered.is_paused_by_system());
        assert!(user_paused.is_paused());
    }

    #[test]
    fn memory_warning_trims_pools() {
        let (mixer, _backend) = manual_mixer(config());
        mixer.initialize().unwrap();
        let sound = mixer.play(tone(44100, 1), true, 1.0, false).unwrap();
        sound.stop();
        settle(&mixer);
        assert!(mixer.resources().segment_pool.cached() > 0);

        mixer.on_memory_warning();
        assert_eq!(mixer.resources().segment_pool.cached(), 0);
        assert_eq!(mixer.resources().segment_pool.outstanding(), 0);
    }
}
