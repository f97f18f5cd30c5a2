//! Loop-hold adapter: repeats an interval of another source.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::format::{SampleFormat, SampleNumber};
use crate::source::{Fill, SampleSource, SourceResult};

const NEVER: u64 = u64::MAX;

/// Wraps a source so that, while looping, any request at or past
/// `loop_finish` reads from the equivalent position inside
/// `[loop_start, loop_finish)`.
///
/// Positions handed to this adapter are "unrolled": they keep growing
/// across iterations. Once looping is released, the iteration in progress
/// plays out and everything after it continues linearly from
/// `loop_finish` into the rest of the wrapped source.
pub struct LoopHoldSource<S> {
    inner: S,
    loop_start: SampleNumber,
    loop_finish: SampleNumber,
    /// Unrolled position where looping ends, or `NEVER` while looping.
    release_at: AtomicU64,
}

impl<S: SampleSource> LoopHoldSource<S> {
    pub fn new(inner: S, loop_start: SampleNumber, loop_finish: SampleNumber, looping: bool) -> Self {
        Self {
            inner,
            loop_start,
            loop_finish,
            release_at: AtomicU64::new(if looping { NEVER } else { loop_finish }),
        }
    }

    pub fn loop_interval(&self) -> (SampleNumber, SampleNumber) {
        (self.loop_start, self.loop_finish)
    }

    pub fn has_valid_interval(&self) -> bool {
        self.loop_start < self.loop_finish
    }

    pub fn is_looping(&self) -> bool {
        self.release_at.load(Ordering::Acquire) == NEVER
    }

    /// Stop looping at the first iteration boundary at or after
    /// `fetched_until`, so PCM already fetched up to that point stays
    /// valid. Returns the unrolled position where linear playback resumes.
    /// Releasing twice keeps the first boundary.
    pub fn release_after(&self, fetched_until: SampleNumber) -> SampleNumber {
        let boundary = self.boundary_at_or_after(fetched_until);
        match self
            .release_at
            .compare_exchange(NEVER, boundary, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => boundary,
            Err(existing) => existing,
        }
    }

    /// Stop looping and map every position straight onto the source.
    /// Only meaningful once nothing fetched earlier will be played.
    pub fn release_all(&self) {
        self.release_at.store(self.loop_finish, Ordering::Release);
    }

    /// Source position that unrolled position `p` reads from.
    pub fn map_position(&self, p: SampleNumber) -> SampleNumber {
        let release = self.release_at.load(Ordering::Acquire);
        if p >= release {
            self.loop_finish + (p - release)
        } else {
            self.wrap(p)
        }
    }

    fn wrap(&self, p: SampleNumber) -> SampleNumber {
        if p < self.loop_finish || !self.has_valid_interval() {
            return p;
        }
        let span = self.loop_finish - self.loop_start;
        self.loop_start + (p - self.loop_start) % span
    }

    fn boundary_at_or_after(&self, p: SampleNumber) -> SampleNumber {
        if p <= self.loop_finish || !self.has_valid_interval() {
            return self.loop_finish;
        }
        let span = self.loop_finish - self.loop_start;
        let iterations = (p - self.loop_finish).div_ceil(span);
        self.loop_finish + iterations * span
    }

    /// Samples that can be read from `p` before the mapping jumps.
    fn contiguous_run(&self, p: SampleNumber) -> Option<u64> {
        let release = self.release_at.load(Ordering::Acquire);
        if p >= release {
            return None;
        }
        let to_release = (release != NEVER).then(|| release - p);
        let to_wrap = if p < self.loop_finish {
            self.loop_finish - p
        } else {
            self.loop_finish - self.wrap(p)
        };
        Some(match to_release {
            Some(r) => r.min(to_wrap),
            None => to_wrap,
        })
    }
}

impl<S: SampleSource> SampleSource for LoopHoldSource<S> {
    fn format(&self) -> SampleFormat {
        self.inner.format()
    }

    fn frequency(&self) -> u32 {
        self.inner.frequency()
    }

    /// Always 0: the unrolled stream has no fixed length.
    fn sample_length(&self) -> SampleNumber {
        0
    }

    fn fill_sample_data(&self, buf: &mut [u8], start: SampleNumber) -> SourceResult<Fill> {
        if self.is_looping() && !self.has_valid_interval() {
            return Ok(Fill::NONE);
        }

        let frame = self.inner.bytes_per_sample();
        let capacity = (buf.len() / frame) as u64;
        let mut total = Fill::NONE;

        while total.samples < capacity {
            let p = start + total.samples;
            let room = capacity - total.samples;
            let run = self.contiguous_run(p).map_or(room, |r| r.min(room));
            let from = total.bytes;
            let to = from + run as usize * frame;

            let fill = self.inner.fill_sample_data(&mut buf[from..to], self.map_position(p))?;
            if fill.is_empty() {
                break;
            }
            total.bytes += fill.bytes;
            total.samples += fill.samples;
            if fill.samples < run {
                break;
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemorySource;
    use alloc::vec;
    use alloc::vec::Vec;

    /// Mono16 source whose sample `i` has value `i`.
    fn ramp(len: i16) -> MemorySource {
        let values: Vec<i16> = (0..len).collect();
        MemorySource::from_i16(false, 44100, &values)
    }

    fn read(src: &impl SampleSource, start: u64, count: usize) -> Vec<i16> {
        let mut buf = vec![0u8; count * 2];
        let fill = src.fill_sample_data(&mut buf, start).unwrap();
        buf[..fill.bytes]
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    // --- Looping ---

    #[test]
    fn holds_interval_for_ten_periods() {
        let (s, f) = (20u64, 50u64);
        let hold = LoopHoldSource::new(ramp(100), s, f, true);
        let span = f - s;
        let total = (f + 10 * span) as usize;
        let values = read(&hold, 0, total);
        assert_eq!(values.len(), total);
        for p in 0..total as u64 {
            let expected = if p < f { p } else { s + (p - s) % span };
            assert_eq!(values[p as usize] as u64, expected, "position {p}");
        }
    }

    #[test]
    fn reads_starting_mid_loop() {
        let hold = LoopHoldSource::new(ramp(100), 10, 20, true);
        assert_eq!(read(&hold, 57, 5), [17, 18, 19, 10, 11]);
    }

    #[test]
    fn invalid_interval_is_end_of_data_while_looping() {
        let hold = LoopHoldSource::new(ramp(100), 30, 30, true);
        assert!(read(&hold, 0, 8).is_empty());
    }

    #[test]
    fn non_looping_passes_through() {
        let hold = LoopHoldSource::new(ramp(100), 10, 20, false);
        assert!(!hold.is_looping());
        assert_eq!(read(&hold, 18, 4), [18, 19, 20, 21]);
        assert_eq!(read(&hold, 98, 4), [98, 99]);
    }

    #[test]
    fn reports_unbounded_length() {
        let hold = LoopHoldSource::new(ramp(100), 10, 20, true);
        assert_eq!(hold.sample_length(), 0);
    }

    // --- Release ---

    #[test]
    fn release_before_first_wrap_is_identity() {
        let hold = LoopHoldSource::new(ramp(100), 10, 20, true);
        assert_eq!(hold.release_after(5), 20);
        assert_eq!(read(&hold, 15, 10), [15, 16, 17, 18, 19, 20, 21, 22, 23, 24]);
    }

    #[test]
    fn release_finishes_current_iteration_then_continues() {
        let hold = LoopHoldSource::new(ramp(100), 10, 20, true);
        // Fetched up to 43: iteration [40, 50) is kept, linear from 50.
        assert_eq!(hold.release_after(43), 50);
        assert_eq!(read(&hold, 47, 6), [17, 18, 19, 20, 21, 22]);
        assert_eq!(hold.map_position(45), 15);
        assert_eq!(hold.map_position(60), 30);
    }

    #[test]
    fn release_all_is_identity() {
        let hold = LoopHoldSource::new(ramp(100), 10, 20, true);
        hold.release_after(43);
        hold.release_all();
        assert!(!hold.is_looping());
        assert_eq!(read(&hold, 45, 3), [45, 46, 47]);
        assert_eq!(hold.map_position(15), 15);
    }

    #[test]
    fn release_on_boundary_keeps_it() {
        let hold = LoopHoldSource::new(ramp(100), 10, 20, true);
        assert_eq!(hold.release_after(30), 30);
        assert_eq!(hold.release_after(99), 30);
        assert_eq!(read(&hold, 28, 4), [18, 19, 20, 21]);
    }
}
