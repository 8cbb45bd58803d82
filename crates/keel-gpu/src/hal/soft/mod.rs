//! CPU reference device.
//!
//! Heaps are byte vectors, descriptor tables are slot vectors and every
//! queue is a thread draining a channel of command buffers. Barrier
//! declarations are checked against tracked resource states, so the same
//! recording code that would drive a hardware device can be validated here.

mod env;
mod exec;
mod queue;
mod state;

use std::sync::Arc;

use crate::hal::{
    Backend, CpuHandle, HalError, HalResult, HeapId, HostMemory, MappedMemory, MemoryClass,
    PipelineDesc, PipelineId, PresentTarget, Queue, QueueKind, ResourceDesc, ResourceId,
    ResourceState, SwapchainDesc, SwapchainId, TableId, TableKind, ViewDesc,
};

pub use queue::SoftQueue;
pub use state::{SoftStats, StatsSnapshot};

use state::{Shared, SoftHeap, SoftResource, SoftSwapchain, SoftTable, table_base};

#[derive(Debug, Clone)]
pub struct SoftConfig {
    /// Check barrier before-states and pipeline/target formats.
    pub validation: bool,
}

impl Default for SoftConfig {
    fn default() -> Self {
        Self { validation: true }
    }
}

/// The reference device.
pub struct SoftBackend {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SoftBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftBackend")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl SoftBackend {
    pub fn new(config: SoftConfig) -> Self {
        log::info!("reference device created (validation: {})", config.validation);
        Self {
            shared: Arc::new(Shared::new(config)),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// State the timeline last saw for `resource`.
    pub fn resource_state(&self, resource: ResourceId) -> Option<ResourceState> {
        self.shared.registry.read().get(&resource).map(|r| r.state)
    }

    pub fn live_resources(&self) -> usize {
        self.shared.registry.read().len()
    }

    pub fn live_heaps(&self) -> usize {
        self.shared.arena.lock().heaps.len()
    }

    fn insert_heap(&self, class: MemoryClass, size: u64) -> HalResult<HeapId> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size as usize)
            .map_err(|_| HalError::OutOfMemory { size })?;
        bytes.resize(size as usize, 0);

        let id = HeapId(self.shared.next_id());
        self.shared
            .arena
            .lock()
            .heaps
            .insert(id, SoftHeap { class, bytes });
        Ok(id)
    }

    fn insert_resource(&self, resource: SoftResource) -> ResourceId {
        let id = ResourceId(self.shared.next_id());
        self.shared.registry.write().insert(id, resource);
        id
    }

    fn create_back_buffers(&self, desc: &SwapchainDesc) -> HalResult<Vec<ResourceId>> {
        let texture = ResourceDesc::Texture2D {
            width: desc.width.max(1),
            height: desc.height.max(1),
            array_size: 1,
            mip_levels: 1,
            format: desc.format,
            flags: crate::hal::ResourceFlags {
                render_target: true,
                ..Default::default()
            },
        };
        (0..desc.buffer_count)
            .map(|_| {
                self.create_committed_resource(MemoryClass::Default, &texture, ResourceState::PRESENT)
            })
            .collect()
    }
}

/// Mapped view into one heap of the arena.
struct SoftHost {
    shared: Arc<Shared>,
    heap: HeapId,
}

impl HostMemory for SoftHost {
    fn write(&self, offset: u64, data: &[u8]) {
        if !self.shared.arena.lock().write(self.heap, offset, data) {
            log::warn!("write through a stale mapping of {:?}", self.heap);
        }
    }

    fn read(&self, offset: u64, out: &mut [u8]) {
        if !self.shared.arena.lock().read(self.heap, offset, out) {
            log::warn!("read through a stale mapping of {:?}", self.heap);
        }
    }
}

impl Backend for SoftBackend {
    fn name(&self) -> &str {
        "reference"
    }

    fn create_heap(&self, class: MemoryClass, size: u64) -> HalResult<HeapId> {
        let heap = self.insert_heap(class, size)?;
        log::debug!("heap {heap:?} created: {size} bytes of {class:?} memory");
        Ok(heap)
    }

    fn destroy_heap(&self, heap: HeapId) {
        self.shared.arena.lock().heaps.remove(&heap);
    }

    fn create_placed_resource(
        &self,
        heap: HeapId,
        offset: u64,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> HalResult<ResourceId> {
        let size = desc.allocation_size();
        {
            let arena = self.shared.arena.lock();
            let Some(h) = arena.heaps.get(&heap) else {
                return Err(HalError::Unsupported(format!("unknown heap {heap:?}")));
            };
            if offset % desc.placement_alignment() != 0 {
                return Err(HalError::Unsupported(format!(
                    "offset {offset} breaks placement alignment"
                )));
            }
            if offset + size > h.bytes.len() as u64 {
                return Err(HalError::OutOfMemory { size });
            }
        }

        Ok(self.insert_resource(SoftResource {
            heap,
            offset,
            desc: desc.clone(),
            committed: false,
            state: initial_state,
        }))
    }

    fn create_committed_resource(
        &self,
        class: MemoryClass,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> HalResult<ResourceId> {
        let heap = self.insert_heap(class, desc.allocation_size())?;
        Ok(self.insert_resource(SoftResource {
            heap,
            offset: 0,
            desc: desc.clone(),
            committed: true,
            state: initial_state,
        }))
    }

    fn destroy_resource(&self, resource: ResourceId) {
        let removed = self.shared.registry.write().remove(&resource);
        match removed {
            Some(res) if res.committed => {
                self.shared.arena.lock().heaps.remove(&res.heap);
            }
            Some(_) => {}
            None => log::warn!("destroy of unknown resource {resource:?}"),
        }
    }

    fn map(&self, resource: ResourceId) -> HalResult<MappedMemory> {
        let (heap, offset, size) = {
            let registry = self.shared.registry.read();
            let res = registry
                .get(&resource)
                .ok_or(HalError::UnknownResource(resource))?;
            (res.heap, res.offset, res.desc.allocation_size())
        };

        let class = self.shared.arena.lock().heaps.get(&heap).map(|h| h.class);
        match class {
            Some(class) if class.is_cpu_visible() => Ok(MappedMemory::new(
                Arc::new(SoftHost {
                    shared: Arc::clone(&self.shared),
                    heap,
                }),
                offset,
                size,
            )),
            _ => Err(HalError::Unsupported(format!(
                "{resource:?} is not in CPU-visible memory"
            ))),
        }
    }

    fn descriptor_stride(&self, kind: TableKind) -> u64 {
        match kind {
            TableKind::Resource | TableKind::RenderTarget | TableKind::DepthStencil => 32,
            TableKind::Sampler => 16,
        }
    }

    fn create_descriptor_table(
        &self,
        kind: TableKind,
        capacity: u32,
    ) -> HalResult<(TableId, CpuHandle)> {
        let id = TableId(self.shared.next_id());
        let stride = self.descriptor_stride(kind);
        if capacity as u64 * stride > u32::MAX as u64 {
            return Err(HalError::Unsupported(format!(
                "{kind:?} table of {capacity} descriptors"
            )));
        }
        self.shared.tables.write().insert(
            id,
            SoftTable {
                kind,
                stride,
                slots: vec![None; capacity as usize],
            },
        );
        Ok((id, table_base(id)))
    }

    fn write_descriptor(&self, table: TableId, index: u32, view: &ViewDesc) -> HalResult<()> {
        let mut tables = self.shared.tables.write();
        let Some(t) = tables.get_mut(&table) else {
            return Err(HalError::Unsupported(format!("unknown table {table:?}")));
        };
        if view.table_kind() != t.kind {
            return Err(HalError::Unsupported(format!(
                "{:?} view written into a {:?} table",
                view.table_kind(),
                t.kind
            )));
        }
        let slot = t.slots.get_mut(index as usize).ok_or(HalError::InvalidDescriptor {
            kind: t.kind,
            index,
        })?;
        *slot = Some(view.clone());
        Ok(())
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> HalResult<PipelineId> {
        let id = PipelineId(self.shared.next_id());
        self.shared.pipelines.write().insert(id, desc.clone());
        Ok(id)
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) {
        self.shared.pipelines.write().remove(&pipeline);
    }

    fn create_queue(&self, kind: QueueKind) -> HalResult<Arc<dyn Queue>> {
        Ok(Arc::new(SoftQueue::spawn(kind, Arc::clone(&self.shared))?))
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        mut target: Box<dyn PresentTarget>,
    ) -> HalResult<(SwapchainId, Vec<ResourceId>)> {
        let buffers = self.create_back_buffers(desc)?;
        target.resize(desc.width, desc.height);

        let id = SwapchainId(self.shared.next_id());
        self.shared.swapchains.lock().insert(
            id,
            SoftSwapchain {
                desc: *desc,
                buffers: buffers.clone(),
                target,
            },
        );
        Ok((id, buffers))
    }

    fn resize_swapchain(
        &self,
        swapchain: SwapchainId,
        width: u32,
        height: u32,
    ) -> HalResult<Vec<ResourceId>> {
        let (old, desc) = {
            let mut chains = self.shared.swapchains.lock();
            let chain = chains
                .get_mut(&swapchain)
                .ok_or_else(|| HalError::Presentation(format!("unknown {swapchain:?}")))?;
            chain.desc.width = width;
            chain.desc.height = height;
            chain.target.resize(width, height);
            (std::mem::take(&mut chain.buffers), chain.desc)
        };

        for resource in old {
            self.destroy_resource(resource);
        }
        let buffers = self.create_back_buffers(&desc)?;

        if let Some(chain) = self.shared.swapchains.lock().get_mut(&swapchain) {
            chain.buffers.clone_from(&buffers);
        }
        Ok(buffers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{Barrier, Command, CommandBuffer, Format, ResourceFlags};

    fn backend() -> SoftBackend {
        SoftBackend::new(SoftConfig::default())
    }

    // ── memory ────────────────────────────────────────────────────────────

    #[test]
    fn placed_resource_must_fit_heap() {
        let b = backend();
        let heap = b.create_heap(MemoryClass::Default, 1024).unwrap();
        let desc = ResourceDesc::buffer(512);
        assert!(b.create_placed_resource(heap, 512, &desc, ResourceState::Common).is_ok());
        assert!(b.create_placed_resource(heap, 768, &desc, ResourceState::Common).is_err());
    }

    #[test]
    fn default_memory_cannot_be_mapped() {
        let b = backend();
        let r = b
            .create_committed_resource(MemoryClass::Default, &ResourceDesc::buffer(64), ResourceState::Common)
            .unwrap();
        assert!(b.map(r).is_err());
    }

    #[test]
    fn mapped_writes_land_in_heap() {
        let b = backend();
        let r = b
            .create_committed_resource(MemoryClass::Upload, &ResourceDesc::buffer(16), ResourceState::GenericRead)
            .unwrap();
        let mapped = b.map(r).unwrap();
        mapped.write(4, &[1, 2, 3, 4]);
        let mut out = [0u8; 4];
        mapped.read(4, &mut out);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn destroying_committed_resource_frees_heap() {
        let b = backend();
        let r = b
            .create_committed_resource(MemoryClass::Default, &ResourceDesc::buffer(64), ResourceState::Common)
            .unwrap();
        assert_eq!(b.live_heaps(), 1);
        b.destroy_resource(r);
        assert_eq!(b.live_heaps(), 0);
        assert_eq!(b.live_resources(), 0);
    }

    // ── descriptors ───────────────────────────────────────────────────────

    #[test]
    fn descriptor_kind_must_match_table() {
        let b = backend();
        let (table, _) = b.create_descriptor_table(TableKind::Sampler, 4).unwrap();
        let view = ViewDesc::RenderTarget {
            resource: ResourceId(1),
            format: Format::Rgba8Unorm,
            mip_slice: 0,
        };
        assert!(b.write_descriptor(table, 0, &view).is_err());
    }

    #[test]
    fn tables_have_distinct_bases() {
        let b = backend();
        let (_, a) = b.create_descriptor_table(TableKind::Resource, 4).unwrap();
        let (_, c) = b.create_descriptor_table(TableKind::Resource, 4).unwrap();
        assert_ne!(a, c);
    }

    // ── timeline ──────────────────────────────────────────────────────────

    #[test]
    fn queue_executes_then_signals() {
        let b = backend();
        let queue = b.create_queue(QueueKind::Graphics).unwrap();
        let texture = ResourceDesc::Texture2D {
            width: 4,
            height: 4,
            array_size: 1,
            mip_levels: 1,
            format: Format::Rgba8Unorm,
            flags: ResourceFlags::default(),
        };
        let r = b
            .create_committed_resource(MemoryClass::Default, &texture, ResourceState::Common)
            .unwrap();

        let mut cb = CommandBuffer::new(QueueKind::Graphics);
        cb.commands.push(Command::Barriers(vec![Barrier::Transition {
            resource: r,
            before: ResourceState::Common,
            after: ResourceState::CopyDest,
        }]));
        queue.execute(&[Arc::new(cb)]);
        queue.signal(1);
        queue.wait(1);

        assert_eq!(queue.completed_value(), 1);
        assert_eq!(b.resource_state(r), Some(ResourceState::CopyDest));
        assert_eq!(b.stats().validation_errors, 0);
    }

    #[test]
    fn wrong_before_state_is_reported() {
        let b = backend();
        let queue = b.create_queue(QueueKind::Graphics).unwrap();
        let r = b
            .create_committed_resource(MemoryClass::Default, &ResourceDesc::buffer(64), ResourceState::Common)
            .unwrap();

        let mut cb = CommandBuffer::new(QueueKind::Graphics);
        cb.commands.push(Command::Barriers(vec![Barrier::Transition {
            resource: r,
            before: ResourceState::RenderTarget,
            after: ResourceState::Common,
        }]));
        queue.execute(&[Arc::new(cb)]);
        queue.signal(1);
        queue.wait(1);

        assert_eq!(b.stats().validation_errors, 1);
    }

    #[test]
    fn copy_queue_rejects_raster_states() {
        let b = backend();
        let queue = b.create_queue(QueueKind::Copy).unwrap();
        let r = b
            .create_committed_resource(MemoryClass::Default, &ResourceDesc::buffer(64), ResourceState::RenderTarget)
            .unwrap();

        let mut cb = CommandBuffer::new(QueueKind::Copy);
        cb.commands.push(Command::Barriers(vec![
            Barrier::Transition {
                resource: r,
                before: ResourceState::RenderTarget,
                after: ResourceState::CopyDest,
            },
            Barrier::Transition {
                resource: r,
                before: ResourceState::CopyDest,
                after: ResourceState::Common,
            },
        ]));
        queue.execute(&[Arc::new(cb)]);
        queue.signal(1);
        queue.wait(1);

        let stats = b.stats();
        assert_eq!(stats.queue_state_errors, 1);
        assert_eq!(stats.validation_errors, 1);
    }

    #[test]
    fn graphics_queue_runs_copy_buffers_with_any_state() {
        let b = backend();
        let queue = b.create_queue(QueueKind::Graphics).unwrap();
        let r = b
            .create_committed_resource(MemoryClass::Default, &ResourceDesc::buffer(64), ResourceState::RenderTarget)
            .unwrap();

        // Recorded for the copy queue, executed on the graphics timeline.
        let mut cb = CommandBuffer::new(QueueKind::Copy);
        cb.commands.push(Command::Barriers(vec![Barrier::Transition {
            resource: r,
            before: ResourceState::RenderTarget,
            after: ResourceState::CopyDest,
        }]));
        queue.execute(&[Arc::new(cb)]);
        queue.signal(1);
        queue.wait(1);

        assert_eq!(b.stats().queue_state_errors, 0);
    }

    #[test]
    fn queue_kinds_allow_their_states() {
        assert!(QueueKind::Copy.allows(ResourceState::CopySource));
        assert!(!QueueKind::Copy.allows(ResourceState::DepthWrite));
        assert!(QueueKind::Compute.allows(ResourceState::UnorderedAccess));
        assert!(!QueueKind::Compute.allows(ResourceState::RenderTarget));
        assert!(QueueKind::Graphics.allows(ResourceState::IndexBuffer));
    }

    #[test]
    fn queue_releases_buffers_before_signal() {
        let b = backend();
        let queue = b.create_queue(QueueKind::Copy).unwrap();
        let cb = Arc::new(CommandBuffer::new(QueueKind::Copy));
        queue.execute(&[Arc::clone(&cb)]);
        queue.signal(7);
        queue.wait(7);
        assert_eq!(Arc::strong_count(&cb), 1);
    }
}
