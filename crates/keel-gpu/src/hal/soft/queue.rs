use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::hal::{CommandBuffer, HalError, HalResult, Queue, QueueKind};

use super::exec;
use super::state::Shared;

/// Timeline fence: a monotonically increasing value with blocking waits.
#[derive(Debug, Default)]
pub(super) struct Fence {
    value: Mutex<u64>,
    reached: Condvar,
}

impl Fence {
    fn set(&self, value: u64) {
        let mut current = self.value.lock();
        if value > *current {
            *current = value;
        }
        self.reached.notify_all();
    }

    fn get(&self) -> u64 {
        *self.value.lock()
    }

    fn wait(&self, value: u64) {
        let mut current = self.value.lock();
        while *current < value {
            self.reached.wait(&mut current);
        }
    }
}

enum Op {
    Execute(Vec<Arc<CommandBuffer>>),
    Signal(u64),
}

/// A queue whose GPU timeline is a dedicated thread.
#[derive(Debug)]
pub struct SoftQueue {
    kind: QueueKind,
    sender: Option<Sender<Op>>,
    fence: Arc<Fence>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Execute(b) => write!(f, "Execute({})", b.len()),
            Op::Signal(v) => write!(f, "Signal({v})"),
        }
    }
}

impl SoftQueue {
    pub(super) fn spawn(kind: QueueKind, shared: Arc<Shared>) -> HalResult<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let fence = Arc::new(Fence::default());
        let timeline_fence = Arc::clone(&fence);

        let worker = std::thread::Builder::new()
            .name(format!("keel-{}-queue", kind_name(kind)))
            .spawn(move || run_timeline(kind, receiver, timeline_fence, shared))
            .map_err(|e| HalError::DeviceCreation(format!("queue thread: {e}")))?;

        log::debug!("{} queue timeline started", kind_name(kind));

        Ok(Self {
            kind,
            sender: Some(sender),
            fence,
            worker: Some(worker),
        })
    }

    fn send(&self, op: Op) {
        let Some(sender) = self.sender.as_ref() else { return };
        if sender.send(op).is_err() {
            log::error!("{} queue timeline is gone; work dropped", kind_name(self.kind));
        }
    }
}

fn run_timeline(kind: QueueKind, receiver: Receiver<Op>, fence: Arc<Fence>, shared: Arc<Shared>) {
    for op in receiver {
        match op {
            Op::Execute(buffers) => {
                for buffer in &buffers {
                    exec::execute(&shared, kind, buffer);
                }
                // References are released before any later signal.
                drop(buffers);
            }
            Op::Signal(value) => fence.set(value),
        }
    }
    log::debug!("{} queue timeline stopped", kind_name(kind));
}

fn kind_name(kind: QueueKind) -> &'static str {
    match kind {
        QueueKind::Graphics => "graphics",
        QueueKind::Compute => "compute",
        QueueKind::Copy => "copy",
    }
}

impl Queue for SoftQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn execute(&self, buffers: &[Arc<CommandBuffer>]) {
        self.send(Op::Execute(buffers.to_vec()));
    }

    fn signal(&self, value: u64) {
        self.send(Op::Signal(value));
    }

    fn completed_value(&self) -> u64 {
        self.fence.get()
    }

    fn wait(&self, value: u64) {
        self.fence.wait(value);
    }
}

impl Drop for SoftQueue {
    fn drop(&mut self) {
        // Closing the channel lets the timeline drain and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("{} queue timeline panicked", kind_name(self.kind));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // ── fence ─────────────────────────────────────────────────────────────

    #[test]
    fn fence_never_moves_backwards() {
        let fence = Fence::default();
        fence.set(5);
        fence.set(3);
        assert_eq!(fence.get(), 5);
    }

    #[test]
    fn fence_wait_wakes_on_signal() {
        let fence = Arc::new(Fence::default());
        let signaller = Arc::clone(&fence);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            signaller.set(2);
        });
        fence.wait(2);
        assert_eq!(fence.get(), 2);
        handle.join().unwrap();
    }

    #[test]
    fn wait_on_reached_value_returns_immediately() {
        let fence = Fence::default();
        fence.set(1);
        fence.wait(0);
        fence.wait(1);
    }
}
