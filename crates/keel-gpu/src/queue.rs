//! Timeline queues.
//!
//! A [`SubmissionQueue`] pairs a hardware queue with the CPU side of its
//! fence: a counter that only ever increases. Every signal takes the next
//! value, so completion of value `n` implies completion of everything
//! signaled before it on the same queue.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::RecordingContext;
use crate::hal::{CommandBuffer, Queue, QueueKind};

#[derive(Debug)]
pub struct SubmissionQueue {
    raw: Arc<dyn Queue>,
    kind: QueueKind,
    /// Last value handed to the fence. Held while enqueueing so fence values
    /// order exactly with the work they follow.
    last_signaled: Mutex<u64>,
}

impl SubmissionQueue {
    pub fn new(raw: Arc<dyn Queue>) -> Self {
        let kind = raw.kind();
        Self {
            raw,
            kind,
            last_signaled: Mutex::new(0),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Enqueues a signal to the next fence value and returns it.
    pub fn signal(&self) -> u64 {
        let mut last = self.last_signaled.lock();
        *last += 1;
        self.raw.signal(*last);
        *last
    }

    pub fn last_signaled_value(&self) -> u64 {
        *self.last_signaled.lock()
    }

    pub fn completed_value(&self) -> u64 {
        self.raw.completed_value()
    }

    pub fn is_complete(&self, value: u64) -> bool {
        self.raw.completed_value() >= value
    }

    /// Blocks until the fence reaches `value`. Returns at once if it already has.
    pub fn wait_for_value(&self, value: u64) {
        if self.is_complete(value) {
            return;
        }
        log::trace!("{:?} queue: waiting for fence value {value}", self.kind);
        self.raw.wait(value);
    }

    /// Signals and waits, draining all previously submitted work.
    pub fn flush(&self) -> u64 {
        let value = self.signal();
        self.wait_for_value(value);
        value
    }

    /// Closes each context, enqueues them in order and signals once.
    ///
    /// Returns the fence value that marks completion of all of them.
    pub fn submit(&self, contexts: &mut [&mut dyn RecordingContext]) -> u64 {
        let buffers: Vec<Arc<CommandBuffer>> = contexts
            .iter_mut()
            .map(|ctx| {
                debug_assert!(
                    ctx.kind() == self.kind || self.kind == QueueKind::Graphics,
                    "{:?} context submitted to the {:?} queue",
                    ctx.kind(),
                    self.kind
                );
                ctx.close()
            })
            .collect();

        let value = {
            let mut last = self.last_signaled.lock();
            self.raw.execute(&buffers);
            *last += 1;
            self.raw.signal(*last);
            *last
        };

        for ctx in contexts.iter_mut() {
            ctx.mark_submitted(value);
        }
        value
    }

    /// Enqueues a buffer without signaling.
    pub(crate) fn execute_unsignaled(&self, buffer: Arc<CommandBuffer>) {
        let _order = self.last_signaled.lock();
        self.raw.execute(&[buffer]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextState, CopyContext};
    use crate::hal::Backend;
    use crate::hal::soft::{SoftBackend, SoftConfig};

    fn queue(kind: QueueKind) -> Arc<SubmissionQueue> {
        let backend = SoftBackend::new(SoftConfig::default());
        Arc::new(SubmissionQueue::new(backend.create_queue(kind).unwrap()))
    }

    // ── fence values ──────────────────────────────────────────────────────

    #[test]
    fn signal_values_strictly_increase() {
        let q = queue(QueueKind::Graphics);
        let values: Vec<u64> = (0..5).map(|_| q.signal()).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
        assert_eq!(q.last_signaled_value(), 5);
    }

    #[test]
    fn signals_from_many_threads_are_unique() {
        let q = queue(QueueKind::Compute);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || {
                (0..50).map(|_| q.signal()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (1..=200).collect::<Vec<_>>());
    }

    #[test]
    fn flush_completes_everything_signaled() {
        let q = queue(QueueKind::Copy);
        let early = q.signal();
        let last = q.flush();
        assert!(last > early);
        assert!(q.is_complete(early));
        assert!(q.is_complete(last));
    }

    #[test]
    fn wait_on_zero_returns_immediately() {
        let q = queue(QueueKind::Graphics);
        q.wait_for_value(0);
        assert!(q.is_complete(0));
    }

    // ── submission ────────────────────────────────────────────────────────

    #[test]
    fn submit_marks_contexts_with_fence_value() {
        let q = queue(QueueKind::Copy);
        let mut a = CopyContext::new(Arc::clone(&q));
        let mut b = CopyContext::new(Arc::clone(&q));
        a.reset();
        b.reset();

        let value = q.submit(&mut [&mut a, &mut b]);
        assert_eq!(a.state(), ContextState::Submitted);
        assert_eq!(a.last_fence_value(), value);
        assert_eq!(b.last_fence_value(), value);

        q.wait_for_value(value);
        assert!(q.is_complete(value));
    }

    #[test]
    fn later_submission_gets_higher_value() {
        let q = queue(QueueKind::Copy);
        let mut ctx = CopyContext::new(Arc::clone(&q));
        ctx.reset();
        let first = q.submit(&mut [&mut ctx]);
        q.wait_for_value(first);
        ctx.reset();
        let second = q.submit(&mut [&mut ctx]);
        assert!(second > first);
    }
}
