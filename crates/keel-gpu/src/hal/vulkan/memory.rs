//! Heaps, placed and committed resources, and host mappings.
//!
//! Heaps are `gpu_allocator` allocations; the core sub-allocates them and
//! binds placed resources at `heap offset + range start`. Committed resources
//! get a dedicated allocation each.

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::{AllocationError, MemoryLocation};
use parking_lot::RwLock;

use crate::hal::{
    HalError, HalResult, HeapId, HostMemory, MappedMemory, MemoryClass, ResourceDesc, ResourceId,
    ResourceState, TEXTURE_PLACEMENT_ALIGNMENT,
};

use super::conversion;
use super::state::{LayoutInit, Shared};

/// Persistently mapped bytes of one allocation.
///
/// Closed before the allocation is freed; accesses through a closed window
/// are dropped.
pub(super) struct HostWindow {
    ptr: NonNull<u8>,
    len: u64,
    live: RwLock<bool>,
}

// The pointer targets device memory that outlives every open window.
unsafe impl Send for HostWindow {}
unsafe impl Sync for HostWindow {}

impl HostWindow {
    fn of(allocation: &Allocation) -> Option<Arc<Self>> {
        allocation.mapped_ptr().map(|ptr| {
            Arc::new(Self {
                ptr: ptr.cast(),
                len: allocation.size(),
                live: RwLock::new(true),
            })
        })
    }

    fn close(&self) {
        *self.live.write() = false;
    }

    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }
}

impl HostMemory for HostWindow {
    fn write(&self, offset: u64, data: &[u8]) {
        let live = self.live.read();
        if !*live || offset + data.len() as u64 > self.len {
            log::warn!("write through a stale or short mapping");
            return;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.ptr.as_ptr().add(offset as usize),
                data.len(),
            );
        }
    }

    fn read(&self, offset: u64, out: &mut [u8]) {
        let live = self.live.read();
        if !*live || offset + out.len() as u64 > self.len {
            log::warn!("read through a stale or short mapping");
            return;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(offset as usize),
                out.as_mut_ptr(),
                out.len(),
            );
        }
    }
}

pub(super) struct VkHeap {
    pub class: MemoryClass,
    pub allocation: Allocation,
    pub window: Option<Arc<HostWindow>>,
}

impl VkHeap {
    pub fn free(self, allocator: &mut Option<Allocator>) {
        if let Some(window) = &self.window {
            window.close();
        }
        if let Some(allocator) = allocator.as_mut() {
            if let Err(e) = allocator.free(self.allocation) {
                log::error!("freeing heap memory: {e}");
            }
        }
    }
}

pub(super) enum Handle {
    Buffer(vk::Buffer),
    Image {
        image: vk::Image,
        /// Views written into descriptor tables; they die with the image.
        views: Vec<vk::ImageView>,
    },
}

pub(super) enum Memory {
    Placed { heap: HeapId, offset: u64 },
    Committed {
        allocation: Allocation,
        window: Option<Arc<HostWindow>>,
    },
}

pub(super) struct VkResource {
    pub desc: ResourceDesc,
    pub handle: Handle,
    pub memory: Memory,
}

impl VkResource {
    pub fn buffer(&self) -> Option<vk::Buffer> {
        match self.handle {
            Handle::Buffer(buffer) => Some(buffer),
            Handle::Image { .. } => None,
        }
    }

    pub fn image(&self) -> Option<vk::Image> {
        match self.handle {
            Handle::Image { image, .. } => Some(image),
            Handle::Buffer(_) => None,
        }
    }

    pub fn destroy(self, device: &ash::Device, allocator: &mut Option<Allocator>) {
        unsafe {
            match self.handle {
                Handle::Buffer(buffer) => device.destroy_buffer(buffer, None),
                Handle::Image { image, views } => {
                    for view in views {
                        device.destroy_image_view(view, None);
                    }
                    device.destroy_image(image, None);
                }
            }
        }
        if let Memory::Committed { allocation, window } = self.memory {
            if let Some(window) = window {
                window.close();
            }
            if let Some(allocator) = allocator.as_mut() {
                if let Err(e) = allocator.free(allocation) {
                    log::error!("freeing committed memory: {e}");
                }
            }
        }
    }
}

fn allocation_error(size: u64) -> impl FnOnce(AllocationError) -> HalError {
    move |e| match e {
        AllocationError::OutOfMemory => HalError::OutOfMemory { size },
        other => HalError::Unsupported(format!("allocation failed: {other}")),
    }
}

fn vk_error(what: &'static str) -> impl FnOnce(vk::Result) -> HalError {
    move |e| match e {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            HalError::OutOfMemory { size: 0 }
        }
        other => HalError::Unsupported(format!("{what}: {other}")),
    }
}

/// Memory types usable by buffers, and by buffers and optimal images alike.
pub(super) fn placement_type_bits(device: &ash::Device) -> (u32, u32) {
    let buffer = buffer_requirements(device, 256).memory_type_bits;
    let sampled_formats = [
        crate::hal::Format::Rgba8Unorm,
        crate::hal::Format::Rgba32Float,
        crate::hal::Format::D32Float,
    ];
    let images = sampled_formats.iter().fold(u32::MAX, |bits, &format| {
        let desc = ResourceDesc::Texture2D {
            width: 64,
            height: 64,
            array_size: 1,
            mip_levels: 1,
            format,
            flags: crate::hal::ResourceFlags {
                render_target: !format.is_depth(),
                depth_stencil: format.is_depth(),
                unordered_access: !format.is_depth(),
            },
        };
        bits & requirements(device, &desc).memory_type_bits
    });
    let shared = buffer & images;
    if shared == 0 {
        log::warn!("no memory type holds both buffers and images; heaps follow buffers");
        (buffer, buffer)
    } else {
        (shared, buffer)
    }
}

fn buffer_requirements(device: &ash::Device, size: u64) -> vk::MemoryRequirements {
    let info = conversion::buffer_info(size);
    let query = vk::DeviceBufferMemoryRequirements::default().create_info(&info);
    let mut out = vk::MemoryRequirements2::default();
    unsafe { device.get_device_buffer_memory_requirements(&query, &mut out) };
    out.memory_requirements
}

/// Requirements of a resource that has not been created yet.
pub(super) fn requirements(device: &ash::Device, desc: &ResourceDesc) -> vk::MemoryRequirements {
    match (desc, conversion::image_info(desc)) {
        (ResourceDesc::Buffer { size }, _) => buffer_requirements(device, *size),
        (_, Some(info)) => {
            let query = vk::DeviceImageMemoryRequirements::default().create_info(&info);
            let mut out = vk::MemoryRequirements2::default();
            unsafe { device.get_device_image_memory_requirements(&query, &mut out) };
            out.memory_requirements
        }
        (_, None) => vk::MemoryRequirements::default(),
    }
}

impl Shared {
    /// Size and alignment of `desc` when placed into a heap.
    ///
    /// Buffers and optimal images share heaps, so every placement honours the
    /// buffer/image granularity.
    pub fn allocation_info(&self, desc: &ResourceDesc) -> (u64, u64) {
        let reqs = requirements(&self.device, desc);
        let align = reqs.alignment.max(self.granularity).max(1);
        (reqs.size.next_multiple_of(align), align)
    }

    pub fn create_heap(&self, class: MemoryClass, size: u64) -> HalResult<HeapId> {
        let type_bits = if class.is_cpu_visible() {
            self.buffer_type_bits
        } else {
            self.heap_type_bits
        };
        let requirements = vk::MemoryRequirements {
            size,
            alignment: TEXTURE_PLACEMENT_ALIGNMENT.max(self.granularity),
            memory_type_bits: type_bits,
        };
        let allocation = {
            let mut allocator = self.allocator();
            let allocator = allocator
                .as_mut()
                .ok_or_else(|| HalError::Unsupported("device is shutting down".into()))?;
            allocator
                .allocate(&AllocationCreateDesc {
                    name: "keel heap",
                    requirements,
                    location: conversion::memory_location(class),
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(allocation_error(size))?
        };

        let window = HostWindow::of(&allocation);
        if class.is_cpu_visible() && window.is_none() {
            log::warn!("{class:?} heap of {size} bytes is not host-mapped");
        }
        let id = HeapId(self.next_id());
        self.heaps.lock().insert(
            id,
            VkHeap {
                class,
                allocation,
                window,
            },
        );
        Ok(id)
    }

    pub fn destroy_heap(&self, heap: HeapId) {
        let removed = self.heaps.lock().remove(&heap);
        match removed {
            Some(heap) => heap.free(&mut self.allocator()),
            None => log::warn!("destroy of unknown heap {heap:?}"),
        }
    }

    fn create_handle(&self, desc: &ResourceDesc) -> HalResult<Handle> {
        match conversion::image_info(desc) {
            None => {
                let info = conversion::buffer_info(match desc {
                    ResourceDesc::Buffer { size } => *size,
                    ResourceDesc::Texture2D { .. } => 0,
                });
                let buffer = unsafe { self.device.create_buffer(&info, None) }
                    .map_err(vk_error("creating buffer"))?;
                Ok(Handle::Buffer(buffer))
            }
            Some(info) => {
                let image = unsafe { self.device.create_image(&info, None) }
                    .map_err(vk_error("creating image"))?;
                Ok(Handle::Image {
                    image,
                    views: Vec::new(),
                })
            }
        }
    }

    fn destroy_handle(&self, handle: Handle) {
        unsafe {
            match handle {
                Handle::Buffer(buffer) => self.device.destroy_buffer(buffer, None),
                Handle::Image { image, .. } => self.device.destroy_image(image, None),
            }
        }
    }

    fn bind(&self, handle: &Handle, memory: vk::DeviceMemory, offset: u64) -> HalResult<()> {
        unsafe {
            match *handle {
                Handle::Buffer(buffer) => self.device.bind_buffer_memory(buffer, memory, offset),
                Handle::Image { image, .. } => self.device.bind_image_memory(image, memory, offset),
            }
        }
        .map_err(vk_error("binding memory"))
    }

    fn register(&self, desc: &ResourceDesc, handle: Handle, memory: Memory, state: ResourceState) -> ResourceId {
        let id = ResourceId(self.next_id());
        if let (Handle::Image { image, .. }, Some(format)) = (&handle, desc.format()) {
            self.pending_layouts.lock().push(LayoutInit {
                resource: id,
                image: *image,
                aspect: conversion::aspect(format),
                layout: conversion::layout(state),
            });
        }
        self.resources.write().insert(
            id,
            VkResource {
                desc: desc.clone(),
                handle,
                memory,
            },
        );
        id
    }

    pub fn create_placed_resource(
        &self,
        heap: HeapId,
        offset: u64,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> HalResult<ResourceId> {
        let (size, align) = self.allocation_info(desc);
        let (memory, base) = {
            let heaps = self.heaps.lock();
            let h = heaps
                .get(&heap)
                .ok_or_else(|| HalError::Unsupported(format!("unknown heap {heap:?}")))?;
            if offset % align != 0 {
                return Err(HalError::Unsupported(format!(
                    "offset {offset} breaks placement alignment {align}"
                )));
            }
            if offset + size > h.allocation.size() {
                return Err(HalError::OutOfMemory { size });
            }
            (unsafe { h.allocation.memory() }, h.allocation.offset())
        };

        let handle = self.create_handle(desc)?;
        if let Err(e) = self.bind(&handle, memory, base + offset) {
            self.destroy_handle(handle);
            return Err(e);
        }
        Ok(self.register(desc, handle, Memory::Placed { heap, offset }, initial_state))
    }

    pub fn create_committed_resource(
        &self,
        class: MemoryClass,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> HalResult<ResourceId> {
        let handle = self.create_handle(desc)?;
        let (requirements, scheme) = unsafe {
            match handle {
                Handle::Buffer(buffer) => (
                    self.device.get_buffer_memory_requirements(buffer),
                    AllocationScheme::DedicatedBuffer(buffer),
                ),
                Handle::Image { image, .. } => (
                    self.device.get_image_memory_requirements(image),
                    AllocationScheme::DedicatedImage(image),
                ),
            }
        };

        let allocated = {
            let mut allocator = self.allocator();
            match allocator.as_mut() {
                Some(allocator) => allocator
                    .allocate(&AllocationCreateDesc {
                        name: "keel committed",
                        requirements,
                        location: conversion::memory_location(class),
                        linear: matches!(handle, Handle::Buffer(_)),
                        allocation_scheme: scheme,
                    })
                    .map_err(allocation_error(requirements.size)),
                None => Err(HalError::Unsupported("device is shutting down".into())),
            }
        };
        let allocation = match allocated {
            Ok(allocation) => allocation,
            Err(e) => {
                self.destroy_handle(handle);
                return Err(e);
            }
        };

        if let Err(e) = self.bind(&handle, unsafe { allocation.memory() }, allocation.offset()) {
            self.destroy_handle(handle);
            if let Some(allocator) = self.allocator().as_mut() {
                let _ = allocator.free(allocation);
            }
            return Err(e);
        }
        let window = HostWindow::of(&allocation);
        Ok(self.register(
            desc,
            handle,
            Memory::Committed { allocation, window },
            initial_state,
        ))
    }

    pub fn destroy_resource(&self, resource: ResourceId) {
        let removed = self.resources.write().remove(&resource);
        let Some(removed) = removed else {
            log::warn!("destroy of unknown resource {resource:?}");
            return;
        };
        self.pending_layouts.lock().retain(|init| init.resource != resource);
        removed.destroy(&self.device, &mut self.allocator());
    }

    pub fn map(&self, resource: ResourceId) -> HalResult<MappedMemory> {
        let resources = self.resources.read();
        let res = resources
            .get(&resource)
            .ok_or(HalError::UnknownResource(resource))?;
        let size = res.desc.allocation_size();
        let not_visible = || HalError::Unsupported(format!("{resource:?} is not in CPU-visible memory"));

        let (window, base) = match &res.memory {
            Memory::Placed { heap, offset } => {
                let heaps = self.heaps.lock();
                let heap = heaps.get(heap).ok_or_else(not_visible)?;
                if !heap.class.is_cpu_visible() {
                    return Err(not_visible());
                }
                (heap.window.clone().ok_or_else(not_visible)?, *offset)
            }
            Memory::Committed { window, .. } => (window.clone().ok_or_else(not_visible)?, 0),
        };
        Ok(MappedMemory::new(window, base, size))
    }
}

/// Where committed readback memory is placed for presentation copies.
pub(super) const READBACK_LOCATION: MemoryLocation = MemoryLocation::GpuToCpu;
