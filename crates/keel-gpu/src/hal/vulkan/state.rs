use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::hal::{HeapId, PipelineId, ResourceId, SwapchainId, TableId};

use super::VulkanConfig;
use super::descriptors::{Bindless, TableSlots};
use super::instance::{Adapter, Instance};
use super::memory::{VkHeap, VkResource};
use super::pipeline::VkPipeline;
use super::present::VkSwapchain;

/// Image whose first layout transition has not been submitted yet.
#[derive(Debug, Copy, Clone)]
pub(super) struct LayoutInit {
    pub resource: ResourceId,
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub layout: vk::ImageLayout,
}

/// State shared by the backend object and its queues.
///
/// Lock order: `swapchains`, then `resources`, `tables`, `pipelines`,
/// `heaps`, `allocator`. `queue` is taken last and never held across
/// another acquisition except `pending_layouts`.
pub(super) struct Shared {
    pub config: VulkanConfig,
    pub instance: Instance,
    pub adapter: Adapter,
    pub device: ash::Device,
    pub queue: Mutex<vk::Queue>,
    /// `None` only while the device is torn down.
    pub allocator: Mutex<Option<gpu_allocator::vulkan::Allocator>>,
    /// Memory types every placed resource kind can live in.
    pub heap_type_bits: u32,
    pub buffer_type_bits: u32,
    pub granularity: u64,
    pub heaps: Mutex<HashMap<HeapId, VkHeap>>,
    pub resources: RwLock<HashMap<ResourceId, VkResource>>,
    pub bindless: Bindless,
    pub tables: RwLock<HashMap<TableId, TableSlots>>,
    pub retired_samplers: Mutex<Vec<vk::Sampler>>,
    pub pipelines: RwLock<HashMap<PipelineId, VkPipeline>>,
    pub swapchains: Mutex<HashMap<SwapchainId, VkSwapchain>>,
    pub pending_layouts: Mutex<Vec<LayoutInit>>,
    next_id: AtomicU64,
}

impl Shared {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: VulkanConfig,
        instance: Instance,
        adapter: Adapter,
        device: ash::Device,
        queue: vk::Queue,
        allocator: gpu_allocator::vulkan::Allocator,
        (heap_type_bits, buffer_type_bits): (u32, u32),
        bindless: Bindless,
    ) -> Self {
        let granularity = adapter.properties.limits.buffer_image_granularity;
        Self {
            config,
            instance,
            adapter,
            device,
            queue: Mutex::new(queue),
            allocator: Mutex::new(Some(allocator)),
            heap_type_bits,
            buffer_type_bits,
            granularity,
            heaps: Mutex::new(HashMap::new()),
            resources: RwLock::new(HashMap::new()),
            bindless,
            tables: RwLock::new(HashMap::new()),
            retired_samplers: Mutex::new(Vec::new()),
            pipelines: RwLock::new(HashMap::new()),
            swapchains: Mutex::new(HashMap::new()),
            pending_layouts: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn allocator(&self) -> MutexGuard<'_, Option<gpu_allocator::vulkan::Allocator>> {
        self.allocator.lock()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("device_wait_idle on teardown: {e}");
            }
        }

        for (_, chain) in self.swapchains.get_mut().drain() {
            chain.shutdown(&self.device, self.allocator.get_mut());
        }
        for (_, pipeline) in self.pipelines.get_mut().drain() {
            unsafe { self.device.destroy_pipeline(pipeline.pipeline, None) };
        }
        for (_, table) in self.tables.get_mut().drain() {
            table.destroy(&self.device);
        }
        for sampler in self.retired_samplers.get_mut().drain(..) {
            unsafe { self.device.destroy_sampler(sampler, None) };
        }
        let leaked: Vec<VkResource> = self.resources.get_mut().drain().map(|(_, r)| r).collect();
        if !leaked.is_empty() {
            log::warn!("{} resources outlived the device", leaked.len());
        }
        for resource in leaked {
            resource.destroy(&self.device, self.allocator.get_mut());
        }
        for (_, heap) in self.heaps.get_mut().drain() {
            heap.free(self.allocator.get_mut());
        }
        self.bindless.destroy(&self.device);

        // The allocator frees its device memory blocks before the device goes.
        drop(self.allocator.get_mut().take());
        unsafe {
            self.device.destroy_device(None);
            if let Some((utils, messenger)) = self.instance.debug.take() {
                utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.instance.destroy_instance(None);
        }
        log::debug!("Vulkan device destroyed");
    }
}

/// Table handles carry the table id in the upper 32 bits.
pub(super) fn table_base(table: TableId) -> crate::hal::CpuHandle {
    crate::hal::CpuHandle { ptr: table.0 << 32 }
}

pub(super) fn handle_slot(handle: crate::hal::CpuHandle, stride: u64) -> (TableId, u32) {
    (TableId(handle.ptr >> 32), ((handle.ptr & 0xffff_ffff) / stride) as u32)
}
