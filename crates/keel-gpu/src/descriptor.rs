//! Bindless descriptor tables.
//!
//! Each table is a fixed array of descriptor slots addressed by a stable
//! integer index. Slots are handed out by a bump pointer and are not recycled
//! individually; the whole table may be reset when every index is known dead.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::DeviceInit;
use crate::error::{OrFatal, fatal};
use crate::hal::{Backend, CpuHandle, HalResult, TableId, TableKind, ViewDesc};
use crate::pipeline::BindlessLayout;

pub struct DescriptorTable {
    backend: Arc<dyn Backend>,
    id: TableId,
    kind: TableKind,
    capacity: u32,
    current_offset: u32,
    base: CpuHandle,
    stride: u64,
}

impl std::fmt::Debug for DescriptorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorTable")
            .field("kind", &self.kind)
            .field("capacity", &self.capacity)
            .field("current_offset", &self.current_offset)
            .finish()
    }
}

impl DescriptorTable {
    pub fn new(backend: Arc<dyn Backend>, kind: TableKind, capacity: u32) -> HalResult<Self> {
        let (id, base) = backend.create_descriptor_table(kind, capacity)?;
        let stride = backend.descriptor_stride(kind);
        log::debug!("{kind:?} descriptor table created with {capacity} slots");
        Ok(Self {
            backend,
            id,
            kind,
            capacity,
            current_offset: 0,
            base,
            stride,
        })
    }

    /// Takes the next free slot. Running out of slots is fatal.
    pub fn allocate(&mut self) -> (u32, CpuHandle) {
        if self.current_offset >= self.capacity {
            fatal(format_args!(
                "{:?} descriptor table exhausted ({} slots)",
                self.kind, self.capacity
            ));
        }
        let index = self.current_offset;
        self.current_offset += 1;
        (index, self.handle_from_index(index))
    }

    /// Skips `count` slots so they can be written explicitly later.
    pub fn reserve(&mut self, count: u32) -> Range<u32> {
        let start = self.current_offset;
        if start + count > self.capacity {
            fatal(format_args!(
                "cannot reserve {count} slots in the {:?} table",
                self.kind
            ));
        }
        self.current_offset += count;
        start..self.current_offset
    }

    pub fn handle_from_index(&self, index: u32) -> CpuHandle {
        self.base.offset(index as u64 * self.stride)
    }

    pub fn index_from_handle(&self, handle: CpuHandle) -> u32 {
        debug_assert!(handle.ptr >= self.base.ptr, "handle precedes table base");
        ((handle.ptr - self.base.ptr) / self.stride) as u32
    }

    /// Writes `view` into an already allocated slot.
    pub fn write(&self, index: u32, view: &ViewDesc) {
        debug_assert!(index < self.current_offset, "write to unallocated slot {index}");
        self.backend
            .write_descriptor(self.id, index, view)
            .or_fatal("writing descriptor");
    }

    /// Allocates a slot and writes `view` into it.
    pub fn register(&mut self, view: &ViewDesc) -> u32 {
        let (index, _) = self.allocate();
        self.write(index, view);
        index
    }

    /// Rewinds the bump pointer to the start of the table.
    ///
    /// Indices handed out earlier must no longer be referenced by any
    /// recorded or in-flight work.
    pub fn reset(&mut self) {
        self.current_offset = 0;
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Slots handed out so far.
    pub fn len(&self) -> u32 {
        self.current_offset
    }

    pub fn is_empty(&self) -> bool {
        self.current_offset == 0
    }
}

/// The device's four tables, each behind its registration lock.
#[derive(Debug)]
pub struct DescriptorTables {
    resource: Mutex<DescriptorTable>,
    render_target: Mutex<DescriptorTable>,
    depth_stencil: Mutex<DescriptorTable>,
    sampler: Mutex<DescriptorTable>,
    layout: BindlessLayout,
    /// Base handle and stride per kind, in `TableKind` order.
    handles: [(CpuHandle, u64); 4],
}

fn kind_slot(kind: TableKind) -> usize {
    match kind {
        TableKind::Resource => 0,
        TableKind::RenderTarget => 1,
        TableKind::DepthStencil => 2,
        TableKind::Sampler => 3,
    }
}

impl DescriptorTables {
    pub fn new(backend: &Arc<dyn Backend>, init: &DeviceInit) -> HalResult<Self> {
        let make = |kind| {
            DescriptorTable::new(Arc::clone(backend), kind, init.descriptor_capacity(kind))
        };
        let resource = make(TableKind::Resource)?;
        let render_target = make(TableKind::RenderTarget)?;
        let depth_stencil = make(TableKind::DepthStencil)?;
        let sampler = make(TableKind::Sampler)?;

        let handles = [&resource, &render_target, &depth_stencil, &sampler]
            .map(|t| (t.base, t.stride));
        let layout = BindlessLayout::new(resource.id(), sampler.id());

        Ok(Self {
            resource: Mutex::new(resource),
            render_target: Mutex::new(render_target),
            depth_stencil: Mutex::new(depth_stencil),
            sampler: Mutex::new(sampler),
            layout,
            handles,
        })
    }

    pub fn table(&self, kind: TableKind) -> &Mutex<DescriptorTable> {
        match kind {
            TableKind::Resource => &self.resource,
            TableKind::RenderTarget => &self.render_target,
            TableKind::DepthStencil => &self.depth_stencil,
            TableKind::Sampler => &self.sampler,
        }
    }

    /// Registers `view` in the table its kind belongs to.
    pub fn register(&self, view: &ViewDesc) -> u32 {
        self.table(view.table_kind()).lock().register(view)
    }

    /// Overwrites a slot in place; its index stays valid.
    pub fn rewrite(&self, index: u32, view: &ViewDesc) {
        self.table(view.table_kind()).lock().write(index, view);
    }

    /// Handle of slot `index`, computed without taking the table lock.
    pub fn handle(&self, kind: TableKind, index: u32) -> CpuHandle {
        let (base, stride) = self.handles[kind_slot(kind)];
        base.offset(index as u64 * stride)
    }

    /// Root layout shared by every pipeline of the device.
    pub fn layout(&self) -> BindlessLayout {
        self.layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::soft::{SoftBackend, SoftConfig};
    use crate::hal::{Format, ResourceId};

    fn table(kind: TableKind, capacity: u32) -> DescriptorTable {
        let backend: Arc<dyn Backend> = Arc::new(SoftBackend::new(SoftConfig::default()));
        DescriptorTable::new(backend, kind, capacity).unwrap()
    }

    // ── allocate ──────────────────────────────────────────────────────────

    #[test]
    fn allocate_is_monotonic() {
        let mut t = table(TableKind::Resource, 8);
        let indices: Vec<u32> = (0..8).map(|_| t.allocate().0).collect();
        assert_eq!(indices, (0..8).collect::<Vec<_>>());
        assert_eq!(t.len(), 8);
    }

    #[test]
    #[should_panic(expected = "descriptor table exhausted")]
    fn allocate_past_capacity_is_fatal() {
        let mut t = table(TableKind::Sampler, 2);
        t.allocate();
        t.allocate();
        t.allocate();
    }

    #[test]
    fn reserve_skips_slots() {
        let mut t = table(TableKind::RenderTarget, 8);
        assert_eq!(t.reserve(3), 0..3);
        assert_eq!(t.allocate().0, 3);
    }

    #[test]
    fn reset_restarts_at_zero() {
        let mut t = table(TableKind::DepthStencil, 4);
        t.allocate();
        t.allocate();
        t.reset();
        assert!(t.is_empty());
        assert_eq!(t.allocate().0, 0);
    }

    // ── handles ───────────────────────────────────────────────────────────

    #[test]
    fn handle_index_round_trip_covers_every_slot() {
        for kind in [
            TableKind::Resource,
            TableKind::RenderTarget,
            TableKind::DepthStencil,
            TableKind::Sampler,
        ] {
            let t = table(kind, 100);
            for i in 0..t.capacity() {
                assert_eq!(t.index_from_handle(t.handle_from_index(i)), i);
            }
        }
    }

    #[test]
    fn allocate_returns_matching_handle() {
        let mut t = table(TableKind::Resource, 4);
        t.allocate();
        let (index, handle) = t.allocate();
        assert_eq!(t.index_from_handle(handle), index);
        assert_eq!(handle, t.handle_from_index(1));
    }

    // ── registration ──────────────────────────────────────────────────────

    #[test]
    fn register_routes_by_view_kind() {
        let backend: Arc<dyn Backend> = Arc::new(SoftBackend::new(SoftConfig::default()));
        let tables = DescriptorTables::new(&backend, &DeviceInit::default()).unwrap();
        let rtv = ViewDesc::RenderTarget {
            resource: ResourceId(9),
            format: Format::Rgba8Unorm,
            mip_slice: 0,
        };
        assert_eq!(tables.register(&rtv), 0);
        assert_eq!(tables.register(&rtv), 1);
        assert_eq!(tables.table(TableKind::RenderTarget).lock().len(), 2);
        assert!(tables.table(TableKind::Resource).lock().is_empty());
    }

    #[test]
    fn cached_handles_match_table_handles() {
        let backend: Arc<dyn Backend> = Arc::new(SoftBackend::new(SoftConfig::default()));
        let tables = DescriptorTables::new(&backend, &DeviceInit::default()).unwrap();
        for kind in [TableKind::Resource, TableKind::Sampler, TableKind::DepthStencil] {
            let expected = tables.table(kind).lock().handle_from_index(5);
            assert_eq!(tables.handle(kind, 5), expected);
        }
    }
}
