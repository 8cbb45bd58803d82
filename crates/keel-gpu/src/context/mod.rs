//! Command recording contexts.
//!
//! Every context wraps a [`CommandStream`]: a command list in one of four
//! states, plus a batch of pending resource barriers. Barriers accumulate
//! until [`RecordingContext::execute_resource_barriers`] flushes them as one
//! batch.
//!
//! ```text
//! Idle --reset--> Recording --close--> Closed --submit--> Submitted
//!                     ^                                       |
//!                     +------- reset (fence complete) --------+
//! ```

mod compute;
mod copy;
mod graphics;

use std::sync::Arc;

use bytemuck::Pod;

use crate::config::ROOT_CONSTANT_COUNT;
use crate::hal::{Barrier, Command, CommandBuffer, QueueKind, ResourceId, ResourceState};
use crate::queue::SubmissionQueue;

pub use compute::ComputeContext;
pub use copy::CopyContext;
pub use graphics::GraphicsContext;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ContextState {
    Idle,
    Recording,
    Closed,
    Submitted,
}

/// Recording state shared by all context variants.
#[derive(Debug)]
pub struct CommandStream {
    kind: QueueKind,
    queue: Arc<SubmissionQueue>,
    state: ContextState,
    recording: CommandBuffer,
    /// The last closed buffer; the queue may still hold a reference.
    in_flight: Option<Arc<CommandBuffer>>,
    pending: Vec<Barrier>,
    last_fence: u64,
}

impl CommandStream {
    pub(crate) fn new(queue: Arc<SubmissionQueue>, kind: QueueKind) -> Self {
        Self {
            kind,
            queue,
            state: ContextState::Idle,
            recording: CommandBuffer::new(kind),
            in_flight: None,
            pending: Vec::new(),
            last_fence: 0,
        }
    }

    pub(crate) fn record(&mut self, command: Command) {
        debug_assert_eq!(
            self.state,
            ContextState::Recording,
            "recording into a {:?} context",
            self.state
        );
        self.recording.commands.push(command);
    }

    fn reset(&mut self) {
        debug_assert!(
            self.queue.is_complete(self.last_fence),
            "reset while fence value {} is still pending",
            self.last_fence
        );

        self.recording = match self.in_flight.take().map(Arc::try_unwrap) {
            Some(Ok(mut reclaimed)) => {
                reclaimed.commands.clear();
                reclaimed
            }
            Some(Err(_)) => {
                debug_assert!(false, "queue still references the previous command list");
                log::warn!("{:?} command storage still in use; allocating fresh", self.kind);
                CommandBuffer::new(self.kind)
            }
            None => {
                let mut buffer = std::mem::replace(&mut self.recording, CommandBuffer::new(self.kind));
                buffer.commands.clear();
                buffer
            }
        };
        self.pending.clear();
        self.state = ContextState::Recording;
    }

    fn close(&mut self) -> Arc<CommandBuffer> {
        debug_assert_eq!(self.state, ContextState::Recording, "closing a {:?} context", self.state);
        debug_assert!(
            self.pending.is_empty(),
            "closing with {} unflushed barriers",
            self.pending.len()
        );

        let buffer = Arc::new(std::mem::replace(
            &mut self.recording,
            CommandBuffer::new(self.kind),
        ));
        self.in_flight = Some(Arc::clone(&buffer));
        self.state = ContextState::Closed;
        buffer
    }

    pub(crate) fn queue(&self) -> &Arc<SubmissionQueue> {
        &self.queue
    }
}

/// Operations common to graphics, compute and copy contexts.
pub trait RecordingContext {
    fn stream(&self) -> &CommandStream;

    fn stream_mut(&mut self) -> &mut CommandStream;

    fn kind(&self) -> QueueKind {
        self.stream().kind
    }

    fn state(&self) -> ContextState {
        self.stream().state
    }

    /// Reopens the context for recording.
    ///
    /// Valid only once the fence of its last submission has completed.
    fn reset(&mut self) {
        self.stream_mut().reset();
    }

    /// Queues a state transition. Same-state transitions are dropped.
    fn add_resource_barrier(
        &mut self,
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
    ) {
        if before == after {
            return;
        }
        self.stream_mut().pending.push(Barrier::Transition {
            resource,
            before,
            after,
        });
    }

    /// Queues an ordering barrier between storage writes and later accesses.
    fn add_uav_barrier(&mut self, resource: ResourceId) {
        self.stream_mut().pending.push(Barrier::Uav { resource });
    }

    /// Records all pending barriers as one batch.
    fn execute_resource_barriers(&mut self) {
        let stream = self.stream_mut();
        if stream.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut stream.pending);
        stream.record(Command::Barriers(batch));
    }

    fn pending_barriers(&self) -> usize {
        self.stream().pending.len()
    }

    /// Ends recording and returns the list for submission.
    fn close(&mut self) -> Arc<CommandBuffer> {
        self.stream_mut().close()
    }

    fn mark_submitted(&mut self, fence_value: u64) {
        let stream = self.stream_mut();
        debug_assert_eq!(stream.state, ContextState::Closed, "submitting an unclosed context");
        stream.last_fence = fence_value;
        stream.state = ContextState::Submitted;
    }

    /// Fence value of the last submission, `0` if never submitted.
    fn last_fence_value(&self) -> u64 {
        self.stream().last_fence
    }

    /// Commands recorded since the last reset.
    fn recorded(&self) -> &[Command] {
        &self.stream().recording.commands
    }
}

/// Packs a `Pod` value into 32-bit constants.
pub(crate) fn pack_constants<T: Pod>(value: &T) -> Box<[u32]> {
    let bytes = bytemuck::bytes_of(value);
    debug_assert!(bytes.len() % 4 == 0, "constants size {} is not a multiple of 4", bytes.len());
    debug_assert!(
        bytes.len() <= ROOT_CONSTANT_COUNT * 4,
        "constants size {} exceeds {} dwords",
        bytes.len(),
        ROOT_CONSTANT_COUNT
    );
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::Backend;
    use crate::hal::soft::{SoftBackend, SoftConfig};

    fn stream_queue() -> Arc<SubmissionQueue> {
        let backend = SoftBackend::new(SoftConfig::default());
        Arc::new(SubmissionQueue::new(backend.create_queue(QueueKind::Copy).unwrap()))
    }

    // ── barrier batching ──────────────────────────────────────────────────

    #[test]
    fn barriers_flush_as_one_batch() {
        let mut ctx = CopyContext::new(stream_queue());
        ctx.reset();
        for i in 0..5 {
            ctx.add_resource_barrier(ResourceId(i), ResourceState::Common, ResourceState::CopyDest);
        }
        assert_eq!(ctx.pending_barriers(), 5);
        assert!(ctx.recorded().is_empty());

        ctx.execute_resource_barriers();
        let buffer = ctx.close();
        assert_eq!(buffer.barrier_batches(), 1);
        assert_eq!(buffer.barrier_count(), 5);
    }

    #[test]
    fn empty_flush_records_nothing() {
        let mut ctx = CopyContext::new(stream_queue());
        ctx.reset();
        ctx.execute_resource_barriers();
        assert!(ctx.recorded().is_empty());
    }

    #[test]
    fn same_state_transition_is_dropped() {
        let mut ctx = CopyContext::new(stream_queue());
        ctx.reset();
        ctx.add_resource_barrier(ResourceId(1), ResourceState::Common, ResourceState::Common);
        assert_eq!(ctx.pending_barriers(), 0);
    }

    // ── state machine ─────────────────────────────────────────────────────

    #[test]
    fn lifecycle_walks_all_states() {
        let queue = stream_queue();
        let mut ctx = CopyContext::new(Arc::clone(&queue));
        assert_eq!(ctx.state(), ContextState::Idle);
        ctx.reset();
        assert_eq!(ctx.state(), ContextState::Recording);
        let value = queue.submit(&mut [&mut ctx]);
        assert_eq!(ctx.state(), ContextState::Submitted);
        queue.wait_for_value(value);
        ctx.reset();
        assert_eq!(ctx.state(), ContextState::Recording);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "unflushed barriers")]
    fn close_with_pending_barriers_asserts() {
        let mut ctx = CopyContext::new(stream_queue());
        ctx.reset();
        ctx.add_resource_barrier(ResourceId(1), ResourceState::Common, ResourceState::CopyDest);
        ctx.close();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "recording into a Idle context")]
    fn recording_before_reset_asserts() {
        let mut ctx = CopyContext::new(stream_queue());
        ctx.copy_resource(ResourceId(1), ResourceId(2));
    }

    // ── constants ─────────────────────────────────────────────────────────

    #[test]
    fn constants_pack_little_endian_dwords() {
        let packed = pack_constants(&[1u32, 2, 0xFFFF_FFFF]);
        assert_eq!(&*packed, &[1, 2, u32::MAX]);
    }

    #[test]
    fn byte_aligned_constants_pack() {
        let packed = pack_constants(&[1u8, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(&*packed, &[1, 2]);
    }
}
