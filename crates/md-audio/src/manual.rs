//! Host-driven backend.
//!
//! Nothing runs on its own: the owner pumps blocks out of open streams by
//! hand. Used for offline rendering and for tests, which can also inject
//! open failures and asynchronous stream errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use md_pcm::RenderBlock;

use crate::error::{AudioError, AudioResult};
use crate::traits::{AudioBackend, ErrorCallback, OutputDevice, RenderCallback, StreamRequest};

struct ManualStream {
    id: u64,
    request: StreamRequest,
    render: Arc<Mutex<RenderCallback>>,
    on_error: Arc<ErrorCallback>,
    running: Arc<AtomicBool>,
}

#[derive(Default)]
struct ManualState {
    streams: Vec<ManualStream>,
    next_id: u64,
    fail_opens: usize,
    opened: usize,
}

/// A backend whose streams only render when pumped.
#[derive(Clone, Default)]
pub struct ManualBackend {
    state: Arc<Mutex<ManualState>>,
}

impl ManualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` calls to `open_stream` fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.lock().fail_opens = count;
    }

    /// Total successful opens since creation.
    pub fn open_count(&self) -> usize {
        self.lock().opened
    }

    /// Rates of the streams currently open, oldest first.
    pub fn open_rates(&self) -> Vec<u32> {
        self.lock().streams.iter().map(|s| s.request.sample_rate).collect()
    }

    pub fn is_running(&self, rate: u32) -> bool {
        self.lock()
            .streams
            .iter()
            .rev()
            .find(|s| s.request.sample_rate == rate)
            .is_some_and(|s| s.running.load(Ordering::Acquire))
    }

    /// Render into `block` from the newest started stream at `rate`.
    /// Returns false (and leaves `block` alone) if there is none.
    pub fn pump_into(&self, rate: u32, block: &mut RenderBlock<'_>) -> bool {
        let render = {
            let state = self.lock();
            match state
                .streams
                .iter()
                .rev()
                .find(|s| s.request.sample_rate == rate && s.running.load(Ordering::Acquire))
            {
                Some(stream) => Arc::clone(&stream.render),
                None => return false,
            }
        };
        let mut render = render.lock().unwrap_or_else(PoisonError::into_inner);
        (*render)(block);
        true
    }

    /// Pump `frames` frames of interleaved i16 at the stream's channel count.
    pub fn pump_i16(&self, rate: u32, frames: usize) -> Option<Vec<i16>> {
        let channels = self.channels_at(rate)?;
        let mut out = vec![0i16; frames * channels as usize];
        let pumped = self.pump_into(rate, &mut RenderBlock::i16(&mut out, channels));
        pumped.then_some(out)
    }

    pub fn pump_f32(&self, rate: u32, frames: usize) -> Option<Vec<f32>> {
        let channels = self.channels_at(rate)?;
        let mut out = vec![0f32; frames * channels as usize];
        let pumped = self.pump_into(rate, &mut RenderBlock::f32(&mut out, channels));
        pumped.then_some(out)
    }

    /// Deliver an asynchronous stream error to the newest stream at `rate`.
    pub fn raise_error(&self, rate: u32, message: &str) -> bool {
        let on_error = {
            let state = self.lock();
            match state.streams.iter().rev().find(|s| s.request.sample_rate == rate) {
                Some(stream) => Arc::clone(&stream.on_error),
                None => return false,
            }
        };
        (*on_error)(AudioError::Stream(message.to_string()));
        true
    }

    fn channels_at(&self, rate: u32) -> Option<u16> {
        self.lock()
            .streams
            .iter()
            .rev()
            .find(|s| s.request.sample_rate == rate)
            .map(|s| s.request.channels)
    }
}

impl AudioBackend for ManualBackend {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn open_stream(
        &self,
        request: &StreamRequest,
        render: RenderCallback,
        on_error: ErrorCallback,
    ) -> AudioResult<Box<dyn OutputDevice>> {
        let mut state = self.lock();
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(AudioError::StreamCreate(format!(
                "injected open failure at {} Hz",
                request.sample_rate
            )));
        }

        let id = state.next_id;
        state.next_id += 1;
        state.opened += 1;
        let running = Arc::new(AtomicBool::new(false));
        state.streams.push(ManualStream {
            id,
            request: *request,
            render: Arc::new(Mutex::new(render)),
            on_error: Arc::new(on_error),
            running: Arc::clone(&running),
        });

        Ok(Box::new(ManualDevice {
            id,
            request: *request,
            running,
            state: Arc::downgrade(&self.state),
        }))
    }
}

struct ManualDevice {
    id: u64,
    request: StreamRequest,
    running: Arc<AtomicBool>,
    state: Weak<Mutex<ManualState>>,
}

impl OutputDevice for ManualDevice {
    fn request(&self) -> StreamRequest {
        self.request
    }

    fn start(&mut self) -> AudioResult<()> {
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) -> AudioResult<()> {
        self.running.store(false, Ordering::Release);
        Ok(())
    }
}

impl Drop for ManualDevice {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(state) = self.state.upgrade() {
            let removed = {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                state
                    .streams
                    .iter()
                    .position(|s| s.id == self.id)
                    .map(|i| state.streams.remove(i))
            };
            // The render callback may own contexts; drop it outside the lock.
            drop(removed);
        }
    }
}
