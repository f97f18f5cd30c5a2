//! The housekeeping thread and its wake signal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::mixer::MixerShared;

/// Shortest sleep between two passes, even when a pass overran.
const MIN_SLEEP: Duration = Duration::from_millis(1);

const NEVER: u64 = u64::MAX;

/// Condvar wake-up for the housekeeping thread, coalesced so that a burst
/// of signals costs at most one wake per `min_interval`.
pub(crate) struct Wake {
    signalled: Mutex<bool>,
    condvar: Condvar,
    epoch: Instant,
    /// Microseconds since `epoch` of the last wake or pass.
    last_us: AtomicU64,
    min_interval: Duration,
}

impl Wake {
    pub(crate) fn new(min_interval: Duration) -> Self {
        Self {
            signalled: Mutex::new(false),
            condvar: Condvar::new(),
            epoch: Instant::now(),
            last_us: AtomicU64::new(NEVER),
            min_interval,
        }
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Wake the thread unless it was woken or ran within `min_interval`.
    /// Returns whether a wake was sent.
    pub(crate) fn signal(&self) -> bool {
        let now = self.now_us();
        let last = self.last_us.load(Ordering::Acquire);
        if last != NEVER && now.saturating_sub(last) < self.min_interval.as_micros() as u64 {
            return false;
        }
        if self
            .last_us
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.notify();
        true
    }

    /// Wake the thread unconditionally.
    pub(crate) fn notify(&self) {
        *self.signalled.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.condvar.notify_all();
    }

    /// Record a completed pass; it counts as a wake for debouncing.
    pub(crate) fn mark(&self) {
        self.last_us.store(self.now_us(), Ordering::Release);
    }

    /// Sleep for up to `timeout`, returning early on a signal.
    pub(crate) fn wait(&self, timeout: Duration) {
        let guard = self.signalled.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut guard, _) = self
            .condvar
            .wait_timeout_while(guard, timeout, |signalled| !*signalled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard = false;
    }
}

/// Body of the `md-housekeeping` thread.
pub(crate) fn run(shared: Arc<MixerShared>) {
    raise_priority();

    let quantum = shared.config().update_quantum();
    let min_sleep = MIN_SLEEP.min(quantum);
    log::debug!("housekeeping started, quantum {:?}", quantum);

    while shared.keep_running() {
        let started = Instant::now();

        shared.update_contexts();
        shared.service_streams(started);
        shared.wake().mark();

        match quantum.checked_sub(started.elapsed()) {
            Some(rest) if rest >= min_sleep => shared.wake().wait(rest),
            _ => thread::sleep(min_sleep),
        }

        if !shared.keep_running() {
            break;
        }
        shared.rebuild_streams();
    }

    log::debug!("housekeeping stopped");
}

#[cfg(unix)]
fn raise_priority() {
    // SAFETY: sched_param is plain data; it is zeroed, then filled, and only
    // passed by reference for the duration of the call on this thread.
    let rc = unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = libc::sched_get_priority_min(libc::SCHED_RR);
        libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_RR, &param)
    };
    if rc != 0 {
        log::debug!("SCHED_RR not granted (error {}); using default policy", rc);
    }
}

#[cfg(not(unix))]
fn raise_priority() {}
