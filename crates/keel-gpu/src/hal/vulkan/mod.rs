//! Vulkan 1.3 device.
//!
//! Heaps come from `gpu_allocator`, queues fence with timeline semaphores and
//! barriers go through `vkCmdPipelineBarrier2`. Descriptor tables map onto
//! one update-after-bind set, and root constants onto push constants.
//! Programs reach this device through their WGSL bodies, compiled with naga.
//!
//! There is no surface: frames are copied into host-visible memory and
//! handed to a [`PresentTarget`](crate::hal::PresentTarget) on a worker
//! thread.

mod conversion;
mod descriptors;
mod instance;
mod memory;
mod pipeline;
mod present;
mod queue;
mod record;
mod state;

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};

use crate::hal::{
    Backend, CpuHandle, HalError, HalResult, HeapId, MappedMemory, MemoryClass, PipelineDesc,
    PipelineId, PresentTarget, Queue, QueueKind, ResourceDesc, ResourceId, ResourceState,
    SwapchainDesc, SwapchainId, TableId, TableKind, ViewDesc,
};

pub use descriptors::{PUSH_CONSTANT_BYTES, RESOURCE_SLOTS, SAMPLER_SLOTS};
pub use pipeline::{PRELUDE, compile};
pub use queue::VulkanQueue;

use state::Shared;

#[derive(Debug, Clone)]
pub struct VulkanConfig {
    /// Enables the Khronos validation layer when it is installed.
    pub validation: bool,
}

impl Default for VulkanConfig {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
        }
    }
}

pub struct VulkanBackend {
    shared: Arc<Shared>,
    name: String,
}

impl std::fmt::Debug for VulkanBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBackend")
            .field("name", &self.name)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl VulkanBackend {
    pub fn new(config: VulkanConfig) -> HalResult<Self> {
        let instance = instance::create_instance(config.validation)?;
        let adapter = match instance::select_adapter(&instance.instance) {
            Ok(adapter) => adapter,
            Err(e) => {
                destroy_instance(instance);
                return Err(e);
            }
        };
        let device = match instance::create_device(&instance.instance, &adapter) {
            Ok(device) => device,
            Err(e) => {
                destroy_instance(instance);
                return Err(e);
            }
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: device.clone(),
            physical_device: adapter.physical,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        });
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                destroy_instance(instance);
                return Err(HalError::DeviceCreation(format!("memory allocator: {e}")));
            }
        };
        let bindless = match descriptors::Bindless::new(&device) {
            Ok(bindless) => bindless,
            Err(e) => {
                drop(allocator);
                unsafe { device.destroy_device(None) };
                destroy_instance(instance);
                return Err(e);
            }
        };

        let type_bits = memory::placement_type_bits(&device);
        let queue = unsafe { device.get_device_queue(adapter.family, 0) };
        let name = adapter
            .properties
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        log::info!(
            "Vulkan device '{name}' created (validation: {})",
            instance.debug.is_some()
        );

        Ok(Self {
            shared: Arc::new(Shared::new(
                config, instance, adapter, device, queue, allocator, type_bits, bindless,
            )),
            name,
        })
    }
}

fn destroy_instance(mut instance: instance::Instance) {
    unsafe {
        if let Some((utils, messenger)) = instance.debug.take() {
            utils.destroy_debug_utils_messenger(messenger, None);
        }
        instance.instance.destroy_instance(None);
    }
}

impl Backend for VulkanBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_heap(&self, class: MemoryClass, size: u64) -> HalResult<HeapId> {
        let heap = self.shared.create_heap(class, size)?;
        log::debug!("heap {heap:?} created: {size} bytes of {class:?} memory");
        Ok(heap)
    }

    fn allocation_info(&self, desc: &ResourceDesc) -> (u64, u64) {
        self.shared.allocation_info(desc)
    }

    fn destroy_heap(&self, heap: HeapId) {
        self.shared.destroy_heap(heap);
    }

    fn create_placed_resource(
        &self,
        heap: HeapId,
        offset: u64,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> HalResult<ResourceId> {
        self.shared.create_placed_resource(heap, offset, desc, initial_state)
    }

    fn create_committed_resource(
        &self,
        class: MemoryClass,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> HalResult<ResourceId> {
        self.shared.create_committed_resource(class, desc, initial_state)
    }

    fn destroy_resource(&self, resource: ResourceId) {
        self.shared.destroy_resource(resource);
    }

    fn map(&self, resource: ResourceId) -> HalResult<MappedMemory> {
        self.shared.map(resource)
    }

    fn descriptor_stride(&self, _kind: TableKind) -> u64 {
        descriptors::DESCRIPTOR_STRIDE
    }

    fn create_descriptor_table(
        &self,
        kind: TableKind,
        capacity: u32,
    ) -> HalResult<(TableId, CpuHandle)> {
        self.shared.create_descriptor_table(kind, capacity)
    }

    fn write_descriptor(&self, table: TableId, index: u32, view: &ViewDesc) -> HalResult<()> {
        self.shared.write_descriptor(table, index, view)
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> HalResult<PipelineId> {
        self.shared.create_pipeline(desc)
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) {
        self.shared.destroy_pipeline(pipeline);
    }

    fn create_queue(&self, kind: QueueKind) -> HalResult<Arc<dyn Queue>> {
        Ok(Arc::new(VulkanQueue::new(kind, Arc::clone(&self.shared))?))
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        target: Box<dyn PresentTarget>,
    ) -> HalResult<(SwapchainId, Vec<ResourceId>)> {
        self.shared.create_swapchain(desc, target)
    }

    fn resize_swapchain(
        &self,
        swapchain: SwapchainId,
        width: u32,
        height: u32,
    ) -> HalResult<Vec<ResourceId>> {
        self.shared.resize_swapchain(swapchain, width, height)
    }
}

/// Whether a Vulkan 1.3 device can be opened on this machine.
pub fn is_available() -> bool {
    let Ok(entry) = (unsafe { ash::Entry::load() }) else {
        return false;
    };
    matches!(
        unsafe { entry.try_enumerate_instance_version() },
        Ok(Some(version)) if version >= vk::API_VERSION_1_3
    )
}
