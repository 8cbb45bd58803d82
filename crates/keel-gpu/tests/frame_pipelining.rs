//! The CPU may run at most `FRAMES_IN_FLIGHT` frames ahead of the graphics
//! queue. A gated queue holds completion back so the throttle is observable.

use std::sync::Arc;
use std::time::Duration;

use keel_gpu::hal::soft::{SoftBackend, SoftConfig};
use keel_gpu::hal::{
    Backend, CommandBuffer, CpuHandle, Format, HalResult, HeadlessTarget, HeapId, MappedMemory,
    MemoryClass, PipelineDesc, PipelineId, PresentTarget, Queue, QueueKind, ResourceDesc,
    ResourceId, ResourceState, SwapchainDesc, SwapchainId, TableId, TableKind, ViewDesc,
};
use keel_gpu::{Device, DeviceInit, FRAMES_IN_FLIGHT};
use parking_lot::{Condvar, Mutex};

/// Fence completion the test releases by hand.
#[derive(Debug, Default)]
struct Gate {
    released: Mutex<u64>,
    opened: Condvar,
    waits: Mutex<Vec<u64>>,
}

impl Gate {
    fn release(&self, value: u64) {
        let mut released = self.released.lock();
        *released = (*released).max(value);
        self.opened.notify_all();
    }

    fn block_until(&self, value: u64) {
        let mut released = self.released.lock();
        while *released < value {
            self.opened.wait(&mut released);
        }
    }

    fn waits(&self) -> Vec<u64> {
        self.waits.lock().clone()
    }
}

/// Runs work on a real queue but reports completion no further than the gate.
#[derive(Debug)]
struct GatedQueue {
    inner: Arc<dyn Queue>,
    gate: Arc<Gate>,
}

impl Queue for GatedQueue {
    fn kind(&self) -> QueueKind {
        self.inner.kind()
    }

    fn execute(&self, buffers: &[Arc<CommandBuffer>]) {
        self.inner.execute(buffers);
    }

    fn signal(&self, value: u64) {
        self.inner.signal(value);
    }

    fn completed_value(&self) -> u64 {
        self.inner.completed_value().min(*self.gate.released.lock())
    }

    fn wait(&self, value: u64) {
        self.gate.waits.lock().push(value);
        self.gate.block_until(value);
        self.inner.wait(value);
    }
}

/// Soft backend whose graphics queue is gated.
#[derive(Debug)]
struct GatedBackend {
    inner: SoftBackend,
    gate: Arc<Gate>,
}

impl Backend for GatedBackend {
    fn name(&self) -> &str {
        "gated"
    }

    fn create_heap(&self, class: MemoryClass, size: u64) -> HalResult<HeapId> {
        self.inner.create_heap(class, size)
    }

    fn destroy_heap(&self, heap: HeapId) {
        self.inner.destroy_heap(heap)
    }

    fn create_placed_resource(
        &self,
        heap: HeapId,
        offset: u64,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> HalResult<ResourceId> {
        self.inner.create_placed_resource(heap, offset, desc, initial_state)
    }

    fn create_committed_resource(
        &self,
        class: MemoryClass,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> HalResult<ResourceId> {
        self.inner.create_committed_resource(class, desc, initial_state)
    }

    fn destroy_resource(&self, resource: ResourceId) {
        self.inner.destroy_resource(resource)
    }

    fn map(&self, resource: ResourceId) -> HalResult<MappedMemory> {
        self.inner.map(resource)
    }

    fn descriptor_stride(&self, kind: TableKind) -> u64 {
        self.inner.descriptor_stride(kind)
    }

    fn create_descriptor_table(
        &self,
        kind: TableKind,
        capacity: u32,
    ) -> HalResult<(TableId, CpuHandle)> {
        self.inner.create_descriptor_table(kind, capacity)
    }

    fn write_descriptor(&self, table: TableId, index: u32, view: &ViewDesc) -> HalResult<()> {
        self.inner.write_descriptor(table, index, view)
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> HalResult<PipelineId> {
        self.inner.create_pipeline(desc)
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) {
        self.inner.destroy_pipeline(pipeline)
    }

    fn create_queue(&self, kind: QueueKind) -> HalResult<Arc<dyn Queue>> {
        let inner = self.inner.create_queue(kind)?;
        if kind != QueueKind::Graphics {
            return Ok(inner);
        }
        Ok(Arc::new(GatedQueue {
            inner,
            gate: Arc::clone(&self.gate),
        }))
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        target: Box<dyn PresentTarget>,
    ) -> HalResult<(SwapchainId, Vec<ResourceId>)> {
        self.inner.create_swapchain(desc, target)
    }

    fn resize_swapchain(
        &self,
        swapchain: SwapchainId,
        width: u32,
        height: u32,
    ) -> HalResult<Vec<ResourceId>> {
        self.inner.resize_swapchain(swapchain, width, height)
    }
}

fn gated_device(gate: &Arc<Gate>) -> (Device, HeadlessTarget) {
    let backend = Arc::new(GatedBackend {
        inner: SoftBackend::new(SoftConfig { validation: false }),
        gate: Arc::clone(gate),
    });
    let target = HeadlessTarget::new();
    let device = Device::with_backend(
        backend,
        Box::new(target.clone()),
        16,
        16,
        Format::Rgba8Unorm,
        DeviceInit::default(),
    );
    (device, target)
}

const STEP: Duration = Duration::from_millis(200);

#[test]
fn each_frame_waits_for_the_one_three_back() {
    let gate = Arc::new(Gate::default());
    let (began, frames) = crossbeam_channel::unbounded::<u64>();
    let total = FRAMES_IN_FLIGHT as u64 + 2;

    let worker_gate = Arc::clone(&gate);
    let worker = std::thread::spawn(move || {
        let (mut device, target) = gated_device(&worker_gate);
        for i in 0..total {
            device.begin_frame();
            began.send(i).unwrap();
            device.submit_graphics_context();
            device.present();
            device.end_frame();
        }
        device.flush();
        let fences: Vec<u64> = (0..FRAMES_IN_FLIGHT).map(|s| device.frame_fence_value(s)).collect();
        (fences, target.presented_count())
    });

    for i in 0..FRAMES_IN_FLIGHT as u64 {
        assert_eq!(frames.recv_timeout(STEP).unwrap(), i);
    }
    // Nothing has completed, so the fourth frame cannot begin.
    assert!(frames.recv_timeout(STEP).is_err());
    assert_eq!(gate.waits(), vec![2]);

    // Completing the first frame's end-of-frame value unblocks the fourth.
    gate.release(2);
    assert_eq!(frames.recv_timeout(STEP * 5).unwrap(), 3);

    // The fifth frame reuses the second frame's slot and waits for its value.
    assert!(frames.recv_timeout(STEP).is_err());
    assert_eq!(gate.waits(), vec![2, 4]);
    gate.release(3);
    assert!(frames.recv_timeout(STEP).is_err());
    gate.release(4);
    assert_eq!(frames.recv_timeout(STEP * 5).unwrap(), 4);

    gate.release(u64::MAX);
    let (fences, presented) = worker.join().unwrap();
    assert_eq!(fences, vec![8, 10, 6]);
    assert_eq!(presented, total);
}

#[test]
fn partial_completion_does_not_unblock() {
    let gate = Arc::new(Gate::default());
    let (began, frames) = crossbeam_channel::unbounded::<u64>();

    let worker_gate = Arc::clone(&gate);
    let worker = std::thread::spawn(move || {
        let (mut device, _target) = gated_device(&worker_gate);
        for i in 0..=FRAMES_IN_FLIGHT as u64 {
            device.begin_frame();
            began.send(i).unwrap();
            device.submit_graphics_context();
            device.end_frame();
        }
    });

    for _ in 0..FRAMES_IN_FLIGHT {
        frames.recv_timeout(STEP).unwrap();
    }
    // The first frame's submit completed, but not its end-of-frame signal.
    gate.release(1);
    assert!(frames.recv_timeout(STEP).is_err());

    gate.release(u64::MAX);
    assert_eq!(frames.recv_timeout(STEP * 5).unwrap(), FRAMES_IN_FLIGHT as u64);
    worker.join().unwrap();
}
