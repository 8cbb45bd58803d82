use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::hal::{
    CpuHandle, HeapId, MemoryClass, PipelineDesc, PipelineId, PresentTarget, ResourceDesc,
    ResourceId, ResourceState, SwapchainDesc, SwapchainId, TableId, TableKind, ViewDesc,
};

use super::SoftConfig;

pub(super) struct SoftHeap {
    pub class: MemoryClass,
    pub bytes: Vec<u8>,
}

/// All device memory. One lock covers every heap.
#[derive(Default)]
pub(super) struct Arena {
    pub heaps: HashMap<HeapId, SoftHeap>,
}

impl Arena {
    pub fn read(&self, heap: HeapId, offset: u64, out: &mut [u8]) -> bool {
        let Some(h) = self.heaps.get(&heap) else { return false };
        let start = offset as usize;
        let Some(src) = h.bytes.get(start..start + out.len()) else { return false };
        out.copy_from_slice(src);
        true
    }

    pub fn write(&mut self, heap: HeapId, offset: u64, data: &[u8]) -> bool {
        let Some(h) = self.heaps.get_mut(&heap) else { return false };
        let start = offset as usize;
        let Some(dst) = h.bytes.get_mut(start..start + data.len()) else { return false };
        dst.copy_from_slice(data);
        true
    }

    pub fn fill(&mut self, heap: HeapId, offset: u64, len: u64, pattern: &[u8]) -> bool {
        let Some(h) = self.heaps.get_mut(&heap) else { return false };
        let start = offset as usize;
        let Some(dst) = h.bytes.get_mut(start..start + len as usize) else { return false };
        for chunk in dst.chunks_mut(pattern.len()) {
            chunk.copy_from_slice(&pattern[..chunk.len()]);
        }
        true
    }
}

pub(super) struct SoftResource {
    pub heap: HeapId,
    pub offset: u64,
    pub desc: ResourceDesc,
    pub committed: bool,
    /// State as seen by the most recently executed barrier.
    pub state: ResourceState,
}

pub(super) type Registry = HashMap<ResourceId, SoftResource>;

pub(super) struct SoftTable {
    pub kind: TableKind,
    pub stride: u64,
    pub slots: Vec<Option<ViewDesc>>,
}

impl SoftTable {
    pub fn index_of(&self, handle: CpuHandle) -> u32 {
        ((handle.ptr & 0xFFFF_FFFF) / self.stride) as u32
    }

    pub fn view(&self, index: u32) -> Option<&ViewDesc> {
        self.slots.get(index as usize).and_then(Option::as_ref)
    }
}

pub(super) struct SoftSwapchain {
    pub desc: SwapchainDesc,
    pub buffers: Vec<ResourceId>,
    pub target: Box<dyn PresentTarget>,
}

/// Counters collected while executing command buffers.
#[derive(Debug, Default)]
pub struct SoftStats {
    command_buffers: AtomicU64,
    barrier_batches: AtomicU64,
    transitions: AtomicU64,
    uav_barriers: AtomicU64,
    validation_errors: AtomicU64,
    queue_state_errors: AtomicU64,
    draws: AtomicU64,
    dispatches: AtomicU64,
    copies: AtomicU64,
    presents: AtomicU64,
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct StatsSnapshot {
    pub command_buffers: u64,
    pub barrier_batches: u64,
    pub transitions: u64,
    pub uav_barriers: u64,
    pub validation_errors: u64,
    /// Transitions naming a state the executing queue cannot use; each is
    /// also counted in `validation_errors`.
    pub queue_state_errors: u64,
    pub draws: u64,
    pub dispatches: u64,
    pub copies: u64,
    pub presents: u64,
}

#[derive(Debug, Copy, Clone)]
pub(super) enum Stat {
    CommandBuffer,
    BarrierBatch,
    Transition,
    UavBarrier,
    ValidationError,
    QueueStateError,
    Draw,
    Dispatch,
    Copy,
    Present,
}

impl SoftStats {
    pub(super) fn bump(&self, stat: Stat) {
        let counter = match stat {
            Stat::CommandBuffer => &self.command_buffers,
            Stat::BarrierBatch => &self.barrier_batches,
            Stat::Transition => &self.transitions,
            Stat::UavBarrier => &self.uav_barriers,
            Stat::ValidationError => &self.validation_errors,
            Stat::QueueStateError => &self.queue_state_errors,
            Stat::Draw => &self.draws,
            Stat::Dispatch => &self.dispatches,
            Stat::Copy => &self.copies,
            Stat::Present => &self.presents,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            command_buffers: self.command_buffers.load(Ordering::Relaxed),
            barrier_batches: self.barrier_batches.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            uav_barriers: self.uav_barriers.load(Ordering::Relaxed),
            validation_errors: self.validation_errors.load(Ordering::Relaxed),
            queue_state_errors: self.queue_state_errors.load(Ordering::Relaxed),
            draws: self.draws.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            copies: self.copies.load(Ordering::Relaxed),
            presents: self.presents.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the backend object and its queue timelines.
///
/// Lock order: `swapchains` (never held across others), then `registry`,
/// `tables`, `pipelines`, `arena`.
pub(super) struct Shared {
    pub config: SoftConfig,
    pub arena: Mutex<Arena>,
    pub registry: RwLock<Registry>,
    pub tables: RwLock<HashMap<TableId, SoftTable>>,
    pub pipelines: RwLock<HashMap<PipelineId, PipelineDesc>>,
    pub swapchains: Mutex<HashMap<SwapchainId, SoftSwapchain>>,
    pub stats: SoftStats,
    next_id: AtomicU64,
}

impl Shared {
    pub fn new(config: SoftConfig) -> Self {
        Self {
            config,
            arena: Mutex::new(Arena::default()),
            registry: RwLock::new(HashMap::new()),
            tables: RwLock::new(HashMap::new()),
            pipelines: RwLock::new(HashMap::new()),
            swapchains: Mutex::new(HashMap::new()),
            stats: SoftStats::default(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Table handles carry the table id in the upper 32 bits.
pub(super) fn table_base(table: TableId) -> CpuHandle {
    CpuHandle { ptr: table.0 << 32 }
}

pub(super) fn handle_table(handle: CpuHandle) -> TableId {
    TableId(handle.ptr >> 32)
}
