//! Device interface the rendering core is written against.
//!
//! The core never talks to a graphics API directly: heaps, resources,
//! descriptor tables, pipelines and queues all come through [`Backend`] and
//! [`Queue`]. [`vulkan`] drives real hardware; [`soft`] is the CPU
//! reference implementation that tests run against.

mod command;
mod error;
mod format;
mod memory;
mod pipeline;
mod present;
mod shader;
pub mod soft;
mod types;
pub mod vulkan;

use std::fmt::Debug;
use std::sync::Arc;

pub use command::{
    Barrier, Command, CommandBuffer, DrawArgs, IndexFormat, QueueKind, ScissorRect, Viewport,
};
pub use error::{HalError, HalResult};
pub use format::{Format, linear_to_srgb, srgb_to_linear};
pub use memory::{HostMemory, MappedMemory};
pub use pipeline::{ComputePipelineDesc, DepthState, GraphicsPipelineDesc, PipelineDesc};
pub use present::{HeadlessTarget, PresentFrame, PresentTarget, PresentedFrame};
pub use shader::{ComputeProgram, GraphicsProgram, RasterEnv, ShaderEnv, ThreadIds, read_buffer};
pub use types::{
    AddressMode, BUFFER_PLACEMENT_ALIGNMENT, CompareFunc, CpuHandle, Filter, Footprint, HeapId,
    MemoryClass, PipelineId, ResourceDesc, ResourceFlags, ResourceId, ResourceState, SamplerDesc,
    SwapchainId, TEXTURE_PLACEMENT_ALIGNMENT, TableId, TableKind, ViewDesc, full_mip_chain,
    mip_extent,
};

/// A hardware queue with its timeline fence.
///
/// Work and signals execute in the order they were enqueued.
pub trait Queue: Send + Sync + Debug {
    fn kind(&self) -> QueueKind;

    /// Enqueues closed command buffers. The queue drops its references once
    /// the buffers have executed, before any later signal completes.
    fn execute(&self, buffers: &[Arc<CommandBuffer>]);

    /// Enqueues a fence signal to `value` after all previously enqueued work.
    fn signal(&self, value: u64);

    /// Highest value the fence has reached.
    fn completed_value(&self) -> u64;

    /// Blocks the calling thread until the fence reaches `value`.
    fn wait(&self, value: u64);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SwapchainDesc {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub buffer_count: u32,
}

/// Resource, descriptor and queue factory of a device.
pub trait Backend: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn create_heap(&self, class: MemoryClass, size: u64) -> HalResult<HeapId>;

    /// Bytes and offset alignment `desc` needs when placed in a heap.
    fn allocation_info(&self, desc: &ResourceDesc) -> (u64, u64) {
        (desc.allocation_size(), desc.placement_alignment())
    }

    fn destroy_heap(&self, heap: HeapId);

    fn create_placed_resource(
        &self,
        heap: HeapId,
        offset: u64,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> HalResult<ResourceId>;

    /// Creates a resource with its own implicit heap.
    fn create_committed_resource(
        &self,
        class: MemoryClass,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> HalResult<ResourceId>;

    fn destroy_resource(&self, resource: ResourceId);

    /// Maps a CPU-visible resource for its whole lifetime.
    fn map(&self, resource: ResourceId) -> HalResult<MappedMemory>;

    /// Distance in bytes between two consecutive descriptor handles.
    fn descriptor_stride(&self, kind: TableKind) -> u64;

    fn create_descriptor_table(
        &self,
        kind: TableKind,
        capacity: u32,
    ) -> HalResult<(TableId, CpuHandle)>;

    fn write_descriptor(&self, table: TableId, index: u32, view: &ViewDesc) -> HalResult<()>;

    fn create_pipeline(&self, desc: &PipelineDesc) -> HalResult<PipelineId>;

    fn destroy_pipeline(&self, pipeline: PipelineId);

    fn create_queue(&self, kind: QueueKind) -> HalResult<Arc<dyn Queue>>;

    /// Creates the back buffers and binds them to `target`.
    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        target: Box<dyn PresentTarget>,
    ) -> HalResult<(SwapchainId, Vec<ResourceId>)>;

    /// Releases the current back buffers and creates new ones at the given size.
    fn resize_swapchain(
        &self,
        swapchain: SwapchainId,
        width: u32,
        height: u32,
    ) -> HalResult<Vec<ResourceId>>;
}
