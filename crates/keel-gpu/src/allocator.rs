//! GPU memory allocator.
//!
//! Small resources are placed into large heap blocks, sub-allocated with
//! `offset_allocator`. Render targets, depth targets and large buffers get
//! dedicated (committed) memory. Upload, constant and readback memory is mapped at
//! creation and stays mapped for the allocation's lifetime.
//!
//! Freed allocations are retired, not destroyed. A retired allocation waits
//! for the next end-of-frame signal on the graphics timeline, which
//! [`Allocator::seal`] stamps on it; [`Allocator::collect`] releases it once
//! that value completes. Signals from other submissions (uploads, flushes on
//! other threads) never stand in for the frame's, since work recorded before
//! the drop may not be submitted yet.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::DeviceInit;
use crate::error::{OrFatal, fatal};
use crate::hal::{Backend, HeapId, MemoryClass, ResourceDesc, ResourceId, ResourceState};
use crate::queue::SubmissionQueue;
use crate::resource::{Allocation, BufferUsage, TextureUsage};

/// Where an allocation's memory came from.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Placement {
    Committed,
    Placed { block: usize, range: Range<u64> },
    /// Owned by the backend, e.g. a swapchain back buffer.
    External,
}

/// One backend heap, sub-allocated by `offset_allocator`.
///
/// The sub-allocator has no notion of alignment, so every range is
/// over-allocated by `align - 1` bytes and its start rounded up.
struct HeapBlock {
    heap: HeapId,
    class: MemoryClass,
    ranges: offset_allocator::Allocator,
    /// Sub-allocator tokens by aligned start offset.
    live: HashMap<u64, offset_allocator::Allocation>,
}

impl std::fmt::Debug for HeapBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapBlock")
            .field("heap", &self.heap)
            .field("class", &self.class)
            .field("live", &self.live.len())
            .finish()
    }
}

impl HeapBlock {
    fn new(heap: HeapId, class: MemoryClass, size: u64) -> Self {
        Self {
            heap,
            class,
            ranges: offset_allocator::Allocator::new(u32::try_from(size).unwrap_or(u32::MAX)),
            live: HashMap::new(),
        }
    }

    /// Carves `size` bytes aligned to `align`, returning the aligned offset.
    fn carve(&mut self, size: u64, align: u64) -> Option<u64> {
        let padded = u32::try_from(size + align.max(1) - 1).ok()?;
        let token = self.ranges.allocate(padded)?;
        let start = u64::from(token.offset).next_multiple_of(align.max(1));
        self.live.insert(start, token);
        Some(start)
    }

    /// Returns the range starting at `range.start` to the sub-allocator.
    fn release(&mut self, range: Range<u64>) {
        match self.live.remove(&range.start) {
            Some(token) => self.ranges.free(token),
            None => log::warn!("release of unknown range {range:?} in {:?}", self.heap),
        }
    }

    fn free_bytes(&self) -> u64 {
        u64::from(self.ranges.storage_report().total_free_space)
    }
}

#[derive(Debug)]
struct Retired {
    resource: ResourceId,
    placement: Placement,
    /// `None` until the end-of-frame signal that follows the drop.
    safe_after: Option<u64>,
}

/// State shared between the allocator and every live allocation.
#[derive(Debug)]
pub struct AllocatorShared {
    backend: Arc<dyn Backend>,
    timeline: Arc<SubmissionQueue>,
    heap_block_size: u64,
    committed_threshold: u64,
    blocks: Mutex<Vec<HeapBlock>>,
    retired: Mutex<Vec<Retired>>,
}

impl AllocatorShared {
    pub(crate) fn retire(&self, resource: ResourceId, placement: Placement) {
        if placement == Placement::External {
            return;
        }
        self.retired.lock().push(Retired {
            resource,
            placement,
            safe_after: None,
        });
    }

    fn release(&self, retired: Retired) {
        self.backend.destroy_resource(retired.resource);
        if let Placement::Placed { block, range } = retired.placement {
            if let Some(b) = self.blocks.lock().get_mut(block) {
                b.release(range);
            }
        }
    }
}

impl Drop for AllocatorShared {
    fn drop(&mut self) {
        for retired in std::mem::take(&mut *self.retired.lock()) {
            self.backend.destroy_resource(retired.resource);
        }
        for block in self.blocks.lock().drain(..) {
            self.backend.destroy_heap(block.heap);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Allocator {
    shared: Arc<AllocatorShared>,
}

impl Allocator {
    /// `timeline` is the queue whose fence gates release of dropped memory.
    pub fn new(backend: Arc<dyn Backend>, timeline: Arc<SubmissionQueue>, init: &DeviceInit) -> Self {
        Self {
            shared: Arc::new(AllocatorShared {
                backend,
                timeline,
                heap_block_size: init.heap_block_size,
                committed_threshold: init.committed_threshold,
                blocks: Mutex::new(Vec::new()),
                retired: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn create_buffer_allocation(&self, usage: BufferUsage, byte_size: u64, name: &str) -> Allocation {
        let size = usage.allocation_size(byte_size);
        let desc = ResourceDesc::buffer(size);
        let dedicated = size >= self.shared.committed_threshold;
        self.allocate(usage.memory_class(), &desc, usage.initial_state(), dedicated, name)
    }

    pub fn create_texture_allocation(
        &self,
        desc: &ResourceDesc,
        usage: TextureUsage,
        name: &str,
    ) -> Allocation {
        self.allocate(
            MemoryClass::Default,
            desc,
            usage.initial_state(),
            usage.is_dedicated(),
            name,
        )
    }

    fn allocate(
        &self,
        class: MemoryClass,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        dedicated: bool,
        name: &str,
    ) -> Allocation {
        let size = desc.allocation_size();
        let (footprint, _) = self.shared.backend.allocation_info(desc);
        let (resource, placement) = if dedicated || footprint > self.shared.heap_block_size {
            let resource = self
                .shared
                .backend
                .create_committed_resource(class, desc, initial_state)
                .or_fatal(&format!("allocating '{name}'"));
            log::debug!("committed allocation '{name}': {size} bytes of {class:?} memory");
            (resource, Placement::Committed)
        } else {
            self.place(class, desc, initial_state, name)
        };

        let mapped = class.is_cpu_visible().then(|| {
            self.shared
                .backend
                .map(resource)
                .or_fatal(&format!("mapping '{name}'"))
        });

        Allocation {
            resource,
            placement,
            mapped,
            size,
            initial_state,
            owner: Arc::clone(&self.shared),
        }
    }

    fn place(
        &self,
        class: MemoryClass,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        name: &str,
    ) -> (ResourceId, Placement) {
        let (size, align) = self.shared.backend.allocation_info(desc);
        let mut blocks = self.shared.blocks.lock();

        let found = blocks
            .iter_mut()
            .enumerate()
            .filter(|(_, b)| b.class == class)
            .find_map(|(i, b)| b.carve(size, align).map(|offset| (i, offset)));

        let (block, offset) = match found {
            Some(hit) => hit,
            None => {
                let heap = self
                    .shared
                    .backend
                    .create_heap(class, self.shared.heap_block_size)
                    .or_fatal(&format!("creating heap block for '{name}'"));
                let mut fresh = HeapBlock::new(heap, class, self.shared.heap_block_size);
                let offset = fresh
                    .carve(size, align)
                    .unwrap_or_else(|| fatal(format_args!("'{name}' does not fit a heap block")));
                blocks.push(fresh);
                (blocks.len() - 1, offset)
            }
        };

        let resource = self
            .shared
            .backend
            .create_placed_resource(blocks[block].heap, offset, desc, initial_state)
            .or_fatal(&format!("placing '{name}'"));

        (
            resource,
            Placement::Placed {
                block,
                range: offset..offset + size,
            },
        )
    }

    /// Wraps a resource the backend owns. Dropping the allocation leaves the
    /// resource alive.
    pub(crate) fn adopt_external(
        &self,
        resource: ResourceId,
        size: u64,
        initial_state: ResourceState,
    ) -> Allocation {
        Allocation {
            resource,
            placement: Placement::External,
            mapped: None,
            size,
            initial_state,
            owner: Arc::clone(&self.shared),
        }
    }

    /// Frees an allocation the caller knows the GPU no longer uses, such as
    /// staging memory whose copy fence has been waited on.
    pub(crate) fn free_now(&self, mut allocation: Allocation) {
        let placement = std::mem::replace(&mut allocation.placement, Placement::External);
        self.shared.release(Retired {
            resource: allocation.resource,
            placement,
            safe_after: Some(0),
        });
    }

    /// Stamps every unsealed retirement with `end_of_frame`, the value the
    /// frame's closing signal will reach. Called right after that signal.
    pub fn seal(&self, end_of_frame: u64) {
        for r in self.shared.retired.lock().iter_mut() {
            r.safe_after.get_or_insert(end_of_frame);
        }
    }

    /// Releases retired memory whose timeline value has completed.
    pub fn collect(&self) -> usize {
        let completed = self.shared.timeline.completed_value();
        let ready: Vec<Retired> = {
            let mut retired = self.shared.retired.lock();
            let (ready, waiting): (Vec<Retired>, Vec<Retired>) = std::mem::take(&mut *retired)
                .into_iter()
                .partition(|r| r.safe_after.is_some_and(|v| v <= completed));
            *retired = waiting;
            ready
        };
        let count = ready.len();
        for r in ready {
            self.shared.release(r);
        }
        count
    }

    /// Releases all retired memory. The caller must have drained every queue.
    pub fn release_all(&self) -> usize {
        let all = std::mem::take(&mut *self.shared.retired.lock());
        let count = all.len();
        for r in all {
            self.shared.release(r);
        }
        count
    }

    pub fn heap_block_count(&self) -> usize {
        self.shared.blocks.lock().len()
    }

    pub fn pending_release_count(&self) -> usize {
        self.shared.retired.lock().len()
    }

    /// Unused bytes across heap blocks of `class`.
    pub fn free_bytes(&self, class: MemoryClass) -> u64 {
        self.shared
            .blocks
            .lock()
            .iter()
            .filter(|b| b.class == class)
            .map(HeapBlock::free_bytes)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::soft::{SoftBackend, SoftConfig};
    use crate::hal::{Format, QueueKind, ResourceFlags};

    fn allocator() -> (Allocator, Arc<SubmissionQueue>) {
        let backend: Arc<dyn Backend> = Arc::new(SoftBackend::new(SoftConfig::default()));
        let queue = Arc::new(SubmissionQueue::new(
            backend.create_queue(QueueKind::Graphics).unwrap(),
        ));
        let init = DeviceInit {
            heap_block_size: 1 << 20,
            committed_threshold: 256 * 1024,
            ..DeviceInit::default()
        };
        (Allocator::new(backend, Arc::clone(&queue), &init), queue)
    }

    fn texture_desc(flags: ResourceFlags) -> ResourceDesc {
        ResourceDesc::Texture2D {
            width: 16,
            height: 16,
            array_size: 1,
            mip_levels: 1,
            format: Format::Rgba8Unorm,
            flags,
        }
    }

    // ── free list ─────────────────────────────────────────────────────────

    #[test]
    fn carve_respects_alignment() {
        let mut block = HeapBlock::new(HeapId(1), MemoryClass::Default, 4096);
        let a = block.carve(10, 256).unwrap();
        let b = block.carve(10, 256).unwrap();
        assert_eq!(a % 256, 0);
        assert_eq!(b % 256, 0);
        assert!(a + 10 <= b || b + 10 <= a);
    }

    #[test]
    fn release_returns_the_whole_block() {
        let mut block = HeapBlock::new(HeapId(1), MemoryClass::Default, 64 * 1024);
        let starts: Vec<u64> = (0..8).map(|_| block.carve(1000, 256).unwrap()).collect();
        assert!(block.free_bytes() < 64 * 1024);
        for start in starts.into_iter().rev() {
            block.release(start..start + 1000);
        }
        assert_eq!(block.free_bytes(), 64 * 1024);
        assert!(block.live.is_empty());
    }

    #[test]
    fn carve_fails_when_full() {
        let mut block = HeapBlock::new(HeapId(1), MemoryClass::Default, 512);
        assert!(block.carve(600, 1).is_none());
    }

    // ── usage mapping ─────────────────────────────────────────────────────

    #[test]
    fn constant_buffers_are_mapped_generic_read() {
        let (alloc, _q) = allocator();
        let a = alloc.create_buffer_allocation(BufferUsage::ConstantBuffer, 64, "cb");
        assert!(a.is_mapped());
        assert_eq!(a.initial_state(), ResourceState::GenericRead);
        assert_eq!(a.size(), 256);
        assert!(!a.is_committed());
    }

    #[test]
    fn index_buffers_are_gpu_local() {
        let (alloc, _q) = allocator();
        let a = alloc.create_buffer_allocation(BufferUsage::IndexBuffer, 64, "ib");
        assert!(!a.is_mapped());
        assert_eq!(a.initial_state(), ResourceState::Common);
    }

    #[test]
    fn large_buffers_are_committed() {
        let (alloc, _q) = allocator();
        let a = alloc.create_buffer_allocation(BufferUsage::StructuredBuffer, 512 * 1024, "big");
        assert!(a.is_committed());
        assert_eq!(alloc.heap_block_count(), 0);
    }

    #[test]
    fn render_targets_are_committed_and_sampled_textures_placed() {
        let (alloc, _q) = allocator();
        let rt = alloc.create_texture_allocation(
            &texture_desc(TextureUsage::RenderTarget.flags()),
            TextureUsage::RenderTarget,
            "rt",
        );
        let tex = alloc.create_texture_allocation(
            &texture_desc(ResourceFlags::default()),
            TextureUsage::Sampled,
            "tex",
        );
        assert!(rt.is_committed());
        assert_eq!(rt.initial_state(), ResourceState::RenderTarget);
        assert!(!tex.is_committed());
        assert_eq!(tex.initial_state(), ResourceState::Common);
    }

    // ── placement ─────────────────────────────────────────────────────────

    #[test]
    fn placed_allocations_never_overlap() {
        let (alloc, _q) = allocator();
        let allocations: Vec<Allocation> = (0..20)
            .map(|i| alloc.create_buffer_allocation(BufferUsage::IndexBuffer, 1000 + i, "ib"))
            .collect();

        let mut ranges: Vec<(usize, Range<u64>)> = allocations
            .iter()
            .filter_map(|a| match &a.placement {
                Placement::Placed { block, range } => Some((*block, range.clone())),
                Placement::Committed | Placement::External => None,
            })
            .collect();
        ranges.sort_by_key(|(b, r)| (*b, r.start));
        for pair in ranges.windows(2) {
            if pair[0].0 == pair[1].0 {
                assert!(pair[0].1.end <= pair[1].1.start);
            }
        }
    }

    #[test]
    fn classes_use_separate_blocks() {
        let (alloc, _q) = allocator();
        let _a = alloc.create_buffer_allocation(BufferUsage::UploadBuffer, 64, "up");
        let _b = alloc.create_buffer_allocation(BufferUsage::IndexBuffer, 64, "ib");
        assert_eq!(alloc.heap_block_count(), 2);
    }

    #[test]
    fn concurrent_allocation_yields_distinct_resources() {
        let (alloc, _q) = allocator();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || {
                    (0..32)
                        .map(|_| alloc.create_buffer_allocation(BufferUsage::UploadBuffer, 512, "up"))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let all: Vec<Allocation> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let mut ids: Vec<_> = all.iter().map(|a| a.resource()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 256);
    }

    // ── deferred release ──────────────────────────────────────────────────

    #[test]
    fn dropped_memory_waits_for_timeline() {
        let (alloc, queue) = allocator();
        let a = alloc.create_buffer_allocation(BufferUsage::UploadBuffer, 1024, "up");
        let free_before = alloc.free_bytes(MemoryClass::Upload);
        drop(a);

        assert_eq!(alloc.pending_release_count(), 1);
        assert_eq!(alloc.collect(), 0);

        alloc.seal(queue.signal());
        queue.flush();
        assert_eq!(alloc.collect(), 1);
        assert_eq!(alloc.pending_release_count(), 0);
        assert!(alloc.free_bytes(MemoryClass::Upload) > free_before);
        assert_eq!(alloc.free_bytes(MemoryClass::Upload), 1 << 20);
    }

    #[test]
    fn unrelated_signals_do_not_release_frame_memory() {
        let (alloc, queue) = allocator();
        drop(alloc.create_buffer_allocation(BufferUsage::IndexBuffer, 64, "frame data"));

        // Another thread's submission signals and completes before the frame
        // that still references the buffer is submitted.
        queue.flush();
        assert_eq!(alloc.collect(), 0);

        let end_of_frame = queue.signal();
        alloc.seal(end_of_frame);
        queue.wait_for_value(end_of_frame);
        assert_eq!(alloc.collect(), 1);
    }

    #[test]
    fn seal_keeps_earlier_stamps() {
        let (alloc, queue) = allocator();
        drop(alloc.create_buffer_allocation(BufferUsage::IndexBuffer, 64, "a"));
        let first = queue.signal();
        alloc.seal(first);
        drop(alloc.create_buffer_allocation(BufferUsage::IndexBuffer, 64, "b"));
        alloc.seal(first + 100);

        queue.wait_for_value(first);
        assert_eq!(alloc.collect(), 1);
        assert_eq!(alloc.pending_release_count(), 1);
    }

    #[test]
    fn free_now_bypasses_retirement() {
        let (alloc, _q) = allocator();
        let a = alloc.create_buffer_allocation(BufferUsage::UploadBuffer, 300, "staging");
        assert!(alloc.free_bytes(MemoryClass::Upload) < 1 << 20);
        alloc.free_now(a);
        assert_eq!(alloc.pending_release_count(), 0);
        assert_eq!(alloc.free_bytes(MemoryClass::Upload), 1 << 20);
    }

    #[test]
    fn release_all_skips_the_wait() {
        let (alloc, _q) = allocator();
        drop(alloc.create_buffer_allocation(BufferUsage::IndexBuffer, 16, "a"));
        drop(alloc.create_buffer_allocation(BufferUsage::IndexBuffer, 16, "b"));
        assert_eq!(alloc.release_all(), 2);
    }

    #[test]
    fn external_memory_is_never_retired() {
        let (alloc, _q) = allocator();
        let a = alloc.adopt_external(ResourceId(77), 4096, ResourceState::PRESENT);
        drop(a);
        assert_eq!(alloc.pending_release_count(), 0);
    }

    #[test]
    fn mapped_memory_round_trips() {
        let (alloc, _q) = allocator();
        let a = alloc.create_buffer_allocation(BufferUsage::ReadbackBuffer, 8, "rb");
        a.update(0, &[9, 8, 7, 6]);
        let mut out = [0u8; 4];
        a.read(0, &mut out);
        assert_eq!(out, [9, 8, 7, 6]);
    }
}
