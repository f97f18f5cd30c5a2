//! The set of contexts registered on one output stream.

use std::sync::{Arc, Weak};

use crate::handle::StreamRendering;
use crate::render_queue::{QueueWriter, MAX_QUEUED_RENDERINGS};

/// Contexts registered on a stream, and the writer that publishes them to
/// its callback.
///
/// Playing contexts are held strongly. Paused ones that are not high
/// priority are demoted to weak references so that dropping every other
/// handle lets them go; they are promoted back if they start playing again.
pub struct StreamRegistry {
    writer: QueueWriter,
    strong: Vec<Arc<dyn StreamRendering>>,
    weak: Vec<Weak<dyn StreamRendering>>,
    overflow_logged: bool,
}

fn same(a: &Arc<dyn StreamRendering>, b: &Arc<dyn StreamRendering>) -> bool {
    Arc::as_ptr(a) as *const u8 == Arc::as_ptr(b) as *const u8
}

impl StreamRegistry {
    pub fn new(writer: QueueWriter) -> Self {
        Self {
            writer,
            strong: Vec::new(),
            weak: Vec::new(),
            overflow_logged: false,
        }
    }

    /// Hold `rendering` strongly and publish a new queue right away.
    /// Registering a context twice keeps one entry.
    pub fn register(&mut self, rendering: Arc<dyn StreamRendering>) -> u64 {
        let target = Arc::as_ptr(&rendering) as *const u8;
        self.weak.retain(|w| w.as_ptr() as *const u8 != target);
        if !self.strong.iter().any(|c| same(c, &rendering)) {
            self.strong.push(rendering);
        }
        self.rebuild()
    }

    /// Drop stopped contexts, demote and promote on pause state, and
    /// publish the resulting queue. Returns the published version.
    pub fn rebuild(&mut self) -> u64 {
        self.strong.retain(|c| !c.is_stopped_rendering());

        let mut i = 0;
        while i < self.strong.len() {
            let c = &self.strong[i];
            if c.is_paused_rendering() && !c.is_high_priority() {
                self.weak.push(Arc::downgrade(c));
                self.strong.swap_remove(i);
            } else {
                i += 1;
            }
        }

        let strong = &mut self.strong;
        self.weak.retain(|w| match w.upgrade() {
            None => false,
            Some(c) if c.is_stopped_rendering() => false,
            Some(c) if !c.is_paused_rendering() => {
                strong.push(c);
                false
            }
            Some(_) => true,
        });

        let target = self.writer.target_mut();
        for c in &self.strong {
            if target.push(c.clone()).is_err() {
                if !self.overflow_logged {
                    log::warn!(
                        "render queue full: {} contexts registered, {} rendered",
                        self.strong.len(),
                        MAX_QUEUED_RENDERINGS
                    );
                    self.overflow_logged = true;
                }
                break;
            }
        }
        self.writer.publish()
    }

    /// Forget every context and publish an empty queue.
    pub fn clear(&mut self) -> u64 {
        self.strong.clear();
        self.weak.clear();
        self.writer.publish()
    }

    pub fn strong_len(&self) -> usize {
        self.strong.len()
    }

    pub fn weak_len(&self) -> usize {
        self.weak.len()
    }

    pub fn version(&self) -> u64 {
        self.writer.version()
    }

    pub fn contains(&self, rendering: &Arc<dyn StreamRendering>) -> bool {
        self.strong.iter().any(|c| same(c, rendering))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_queue::render_queue;
    use md_pcm::RenderBlock;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Fake {
        paused: AtomicBool,
        stopped: AtomicBool,
        high_priority: bool,
    }

    impl StreamRendering for Fake {
        fn render_audio(&self, _block: &mut RenderBlock<'_>) -> bool {
            false
        }
        fn is_stopped_rendering(&self) -> bool {
            self.stopped.load(Ordering::Relaxed)
        }
        fn is_paused_rendering(&self) -> bool {
            self.paused.load(Ordering::Relaxed)
        }
        fn is_high_priority(&self) -> bool {
            self.high_priority
        }
    }

    fn registry() -> (StreamRegistry, crate::QueueReader) {
        let (writer, reader) = render_queue();
        (StreamRegistry::new(writer), reader)
    }

    #[test]
    fn register_publishes_immediately() {
        let (mut reg, mut reader) = registry();
        let fake = Arc::new(Fake::default());
        assert_eq!(reg.register(fake.clone()), 1);
        assert_eq!(reader.acquire().len(), 1);

        reg.register(fake);
        assert_eq!(reg.strong_len(), 1);
        assert_eq!(reader.acquire().len(), 1);
    }

    #[test]
    fn stopped_contexts_are_dropped() {
        let (mut reg, mut reader) = registry();
        let fake = Arc::new(Fake::default());
        reg.register(fake.clone());
        fake.stopped.store(true, Ordering::Relaxed);
        reg.rebuild();
        assert_eq!(reg.strong_len(), 0);
        assert!(reader.acquire().is_empty());
    }

    #[test]
    fn paused_contexts_are_demoted_then_promoted() {
        let (mut reg, mut reader) = registry();
        let fake = Arc::new(Fake::default());
        reg.register(fake.clone());

        fake.paused.store(true, Ordering::Relaxed);
        reg.rebuild();
        assert_eq!((reg.strong_len(), reg.weak_len()), (0, 1));
        assert!(reader.acquire().is_empty());

        fake.paused.store(false, Ordering::Relaxed);
        reg.rebuild();
        assert_eq!((reg.strong_len(), reg.weak_len()), (1, 0));
        assert_eq!(reader.acquire().len(), 1);
    }

    #[test]
    fn demoted_contexts_die_with_their_last_handle() {
        let (mut reg, _reader) = registry();
        let fake = Arc::new(Fake::default());
        reg.register(fake.clone());
        fake.paused.store(true, Ordering::Relaxed);
        reg.rebuild();
        // Two more publishes flush the snapshots still holding it.
        reg.rebuild();
        reg.rebuild();
        let weak = Arc::downgrade(&fake);
        drop(fake);
        assert!(weak.upgrade().is_none());
        reg.rebuild();
        assert_eq!(reg.weak_len(), 0);
    }

    #[test]
    fn high_priority_stays_strong_while_paused() {
        let (mut reg, mut reader) = registry();
        let fake = Arc::new(Fake {
            high_priority: true,
            ..Fake::default()
        });
        fake.paused.store(true, Ordering::Relaxed);
        reg.register(fake);
        assert_eq!(reg.strong_len(), 1);
        assert_eq!(reader.acquire().len(), 1);
    }

    #[test]
    fn versions_increase_by_one_per_publish() {
        let (mut reg, _reader) = registry();
        assert_eq!(reg.rebuild(), 1);
        assert_eq!(reg.rebuild(), 2);
        assert_eq!(reg.clear(), 3);
        assert_eq!(reg.version(), 3);
    }
}
