//! One native output stream and the contexts registered on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use md_audio::{AudioBackend, AudioError, AudioResult, OutputDevice, StreamRequest};
use md_engine::{render_queue, StreamMixer, StreamRegistry, StreamRendering};
use md_pcm::RenderBlock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Health {
    Healthy,
    /// `attempts` re-opens have failed; the next one is due at `next_at`.
    Retrying { attempts: u32, next_at: Instant },
    Failed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A device stream at one sample rate.
///
/// The housekeeping thread owns the registry side; the device callback owns
/// the [`StreamMixer`]. They meet only through the render queue.
pub struct OutputStream {
    request: StreamRequest,
    backend: Arc<dyn AudioBackend>,
    mixer: Arc<Mutex<StreamMixer>>,
    registry: Mutex<StreamRegistry>,
    device: Mutex<Option<Box<dyn OutputDevice>>>,
    health: Mutex<Health>,
    started: AtomicBool,
    error_pending: Arc<AtomicBool>,
    retry_limit: u32,
    retry_base: Duration,
}

impl OutputStream {
    /// Create the stream and open its device. An open failure is not
    /// fatal: the stream goes straight into retrying.
    pub fn open(
        backend: Arc<dyn AudioBackend>,
        request: StreamRequest,
        retry_limit: u32,
        retry_base: Duration,
    ) -> Arc<Self> {
        let (writer, reader) = render_queue();
        let stream = Arc::new(Self {
            request,
            backend,
            mixer: Arc::new(Mutex::new(StreamMixer::new(reader))),
            registry: Mutex::new(StreamRegistry::new(writer)),
            device: Mutex::new(None),
            health: Mutex::new(Health::Healthy),
            started: AtomicBool::new(false),
            error_pending: Arc::new(AtomicBool::new(false)),
            retry_limit,
            retry_base,
        });

        match stream.open_device() {
            Ok(device) => {
                log::info!(
                    "opened {} stream at {} Hz",
                    stream.backend.name(),
                    request.sample_rate
                );
                *lock(&stream.device) = Some(device);
            }
            Err(e) => {
                log::warn!("failed to open stream at {} Hz: {}", request.sample_rate, e);
                stream.schedule_retry(0, Instant::now());
            }
        }
        stream
    }

    fn open_device(&self) -> AudioResult<Box<dyn OutputDevice>> {
        let mixer = Arc::clone(&self.mixer);
        let render = Box::new(move |block: &mut RenderBlock<'_>| match mixer.try_lock() {
            Ok(mut mixer) => mixer.render(block),
            Err(_) => block.silence(),
        });

        let pending = Arc::clone(&self.error_pending);
        let rate = self.request.sample_rate;
        let on_error = Box::new(move |e: AudioError| {
            log::warn!("stream at {} Hz reported: {}", rate, e);
            pending.store(true, Ordering::Release);
        });

        self.backend.open_stream(&self.request, render, on_error)
    }

    fn schedule_retry(&self, attempts: u32, now: Instant) {
        let mut health = lock(&self.health);
        if attempts >= self.retry_limit {
            log::error!(
                "giving up on stream at {} Hz after {} attempts",
                self.request.sample_rate,
                attempts
            );
            *health = Health::Failed;
        } else {
            let delay = self.retry_base * 2u32.saturating_pow(attempts);
            *health = Health::Retrying {
                attempts,
                next_at: now + delay,
            };
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.request.sample_rate
    }

    pub fn request(&self) -> StreamRequest {
        self.request
    }

    /// Permanently failed: no more re-opens, and play at this rate fails.
    pub fn is_failed(&self) -> bool {
        *lock(&self.health) == Health::Failed
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Hold `rendering` and publish a queue containing it right away.
    pub fn register(&self, rendering: Arc<dyn StreamRendering>) -> u64 {
        lock(&self.registry).register(rendering)
    }

    /// Rebuild and publish the render queue.
    pub fn rebuild(&self) -> u64 {
        lock(&self.registry).rebuild()
    }

    /// Version of the last published render queue.
    pub fn queue_version(&self) -> u64 {
        lock(&self.registry).version()
    }

    /// Version of the render queue the callback last mixed from.
    pub fn rendered_version(&self) -> u64 {
        lock(&self.mixer).queue_version()
    }

    pub fn is_registered(&self, rendering: &Arc<dyn StreamRendering>) -> bool {
        lock(&self.registry).contains(rendering)
    }

    /// Contexts held strongly by the render queue.
    pub fn active_count(&self) -> usize {
        lock(&self.registry).strong_len()
    }

    pub fn start(&self) -> AudioResult<()> {
        self.started.store(true, Ordering::Release);
        match lock(&self.device).as_mut() {
            Some(device) => device.start(),
            None => Ok(()),
        }
    }

    pub fn stop(&self) -> AudioResult<()> {
        self.started.store(false, Ordering::Release);
        match lock(&self.device).as_mut() {
            Some(device) => device.stop(),
            None => Ok(()),
        }
    }

    /// Housekeeping step: react to device errors and run due re-opens.
    pub fn service(&self, now: Instant) {
        if self.error_pending.swap(false, Ordering::AcqRel) {
            let broken = lock(&self.device).take();
            drop(broken);
            let failed = *lock(&self.health) == Health::Failed;
            if !failed {
                log::warn!("re-opening stream at {} Hz", self.request.sample_rate);
                self.schedule_retry(0, now);
            }
        }

        let Health::Retrying { attempts, next_at } = *lock(&self.health) else {
            return;
        };
        if now < next_at {
            return;
        }

        let attempt = attempts + 1;
        let reopened = self.open_device().and_then(|mut device| {
            if self.is_started() {
                device.start()?;
            }
            Ok(device)
        });
        match reopened {
            Ok(device) => {
                *lock(&self.device) = Some(device);
                *lock(&self.health) = Health::Healthy;
                log::info!(
                    "stream at {} Hz recovered on attempt {}",
                    self.request.sample_rate,
                    attempt
                );
            }
            Err(e) => {
                log::warn!(
                    "attempt {} to re-open stream at {} Hz failed: {}",
                    attempt,
                    self.request.sample_rate,
                    e
                );
                self.schedule_retry(attempt, now);
            }
        }
    }

    /// Drop every registered context and close the device.
    pub fn close(&self) {
        self.started.store(false, Ordering::Release);
        lock(&self.registry).clear();
        let device = lock(&self.device).take();
        if device.is_some() {
            log::info!("closed stream at {} Hz", self.request.sample_rate);
        }
        drop(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use md_audio::ManualBackend;
    use md_pcm::OutputFormat;

    const QUANTUM: Duration = Duration::from_millis(10);

    struct Level(i16);

    impl StreamRendering for Level {
        fn render_audio(&self, block: &mut RenderBlock<'_>) -> bool {
            if let md_pcm::OutputSamples::I16(out) = block.samples_mut() {
                out.fill(self.0);
            }
            true
        }
        fn is_stopped_rendering(&self) -> bool {
            false
        }
        fn is_paused_rendering(&self) -> bool {
            false
        }
    }

    fn open(backend: &ManualBackend, limit: u32) -> Arc<OutputStream> {
        OutputStream::open(
            Arc::new(backend.clone()),
            StreamRequest::new(44100, 2, OutputFormat::I16),
            limit,
            QUANTUM,
        )
    }

    // --- rendering ---

    #[test]
    fn registered_context_reaches_the_device() {
        let backend = ManualBackend::new();
        let stream = open(&backend, 3);
        stream.register(Arc::new(Level(100)));
        assert!(backend.pump_i16(44100, 4).is_none());

        stream.start().unwrap();
        assert_eq!(backend.pump_i16(44100, 4).unwrap(), vec![100; 8]);
        assert_eq!(stream.active_count(), 1);
    }

    #[test]
    fn close_empties_the_queue_and_device() {
        let backend = ManualBackend::new();
        let stream = open(&backend, 3);
        stream.register(Arc::new(Level(1)));
        stream.close();
        assert_eq!(stream.active_count(), 0);
        assert!(backend.open_rates().is_empty());
    }

    // --- recovery ---

    #[test]
    fn stream_error_reopens_and_restarts() {
        let backend = ManualBackend::new();
        let stream = open(&backend, 3);
        stream.register(Arc::new(Level(5)));
        stream.start().unwrap();

        assert!(backend.raise_error(44100, "device unplugged"));
        let t0 = Instant::now();
        stream.service(t0);
        assert!(backend.pump_i16(44100, 1).is_none());

        stream.service(t0 + QUANTUM);
        assert_eq!(backend.open_count(), 2);
        assert!(backend.is_running(44100));
        assert_eq!(backend.pump_i16(44100, 1).unwrap(), vec![5, 5]);
    }

    #[test]
    fn retry_delay_doubles_until_the_limit() {
        let backend = ManualBackend::new();
        backend.fail_next_opens(4);
        let stream = open(&backend, 3);
        assert!(!stream.is_failed());

        let t0 = Instant::now();
        stream.service(t0 + QUANTUM);
        assert!(!stream.is_failed());
        // Second attempt is not due one quantum later.
        stream.service(t0 + QUANTUM * 2);
        assert_eq!(backend.open_count(), 0);
        stream.service(t0 + QUANTUM * 3);
        stream.service(t0 + QUANTUM * 7);
        assert!(stream.is_failed());

        // Failed streams stay failed.
        stream.service(t0 + QUANTUM * 100);
        assert_eq!(backend.open_count(), 0);
    }

    #[test]
    fn initial_open_failure_recovers() {
        let backend = ManualBackend::new();
        backend.fail_next_opens(1);
        let stream = open(&backend, 3);
        stream.start().unwrap();
        assert!(backend.open_rates().is_empty());

        stream.service(Instant::now() + QUANTUM);
        assert_eq!(backend.open_rates(), vec![44100]);
        assert!(backend.is_running(44100));
    }
}
