//! Swapchain back buffers.
//!
//! Back buffers are ordinary [`Texture`]s whose memory belongs to the
//! backend. Their render-target views live in render-target slots
//! `[0, FRAMES_IN_FLIGHT)`, reserved at creation and rewritten in place on
//! resize, so a back buffer's `rtv_index` never changes.

use std::ops::Range;
use std::sync::Arc;

use crate::allocator::Allocator;
use crate::config::FRAMES_IN_FLIGHT;
use crate::descriptor::DescriptorTables;
use crate::error::OrFatal;
use crate::hal::{
    Backend, Command, CommandBuffer, Format, PresentTarget, QueueKind, ResourceId, ResourceState,
    SwapchainDesc, SwapchainId, TableKind, ViewDesc,
};
use crate::queue::SubmissionQueue;
use crate::resource::{INVALID_INDEX, Texture, TextureDesc, TextureUsage};

#[derive(Debug)]
pub struct Swapchain {
    backend: Arc<dyn Backend>,
    id: SwapchainId,
    queue: Arc<SubmissionQueue>,
    tables: Arc<DescriptorTables>,
    allocator: Allocator,
    format: Format,
    rtv_slots: Range<u32>,
    back_buffers: Vec<Texture>,
    current: usize,
}

impl Swapchain {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        queue: Arc<SubmissionQueue>,
        tables: Arc<DescriptorTables>,
        allocator: Allocator,
        target: Box<dyn PresentTarget>,
        width: u32,
        height: u32,
        format: Format,
    ) -> Self {
        let rtv_slots = tables
            .table(TableKind::RenderTarget)
            .lock()
            .reserve(FRAMES_IN_FLIGHT as u32);

        let desc = SwapchainDesc {
            width: width.max(1),
            height: height.max(1),
            format,
            buffer_count: FRAMES_IN_FLIGHT as u32,
        };
        let (id, resources) = backend
            .create_swapchain(&desc, target)
            .or_fatal("creating swapchain");

        let mut swapchain = Self {
            backend,
            id,
            queue,
            tables,
            allocator,
            format,
            rtv_slots,
            back_buffers: Vec::new(),
            current: 0,
        };
        swapchain.adopt(resources, desc.width, desc.height);
        log::info!("swapchain created: {}x{} {format:?}", desc.width, desc.height);
        swapchain
    }

    /// Wraps backend buffers as textures and points the reserved RTV slots at them.
    fn adopt(&mut self, resources: Vec<ResourceId>, width: u32, height: u32) {
        debug_assert_eq!(resources.len(), self.rtv_slots.len());

        self.back_buffers = resources
            .into_iter()
            .zip(self.rtv_slots.clone())
            .enumerate()
            .map(|(i, (resource, rtv_index))| {
                let desc = TextureDesc::new(TextureUsage::RenderTarget, width, height, self.format)
                    .named(format!("back buffer {i}"));
                let size = desc.resource_desc().allocation_size();

                self.tables.rewrite(
                    rtv_index,
                    &ViewDesc::RenderTarget {
                        resource,
                        format: self.format,
                        mip_slice: 0,
                    },
                );

                Texture {
                    allocation: self.allocator.adopt_external(resource, size, ResourceState::PRESENT),
                    desc,
                    srv_index: INVALID_INDEX,
                    uav_index: INVALID_INDEX,
                    rtv_index,
                    dsv_index: INVALID_INDEX,
                }
            })
            .collect();
        self.current = 0;
    }

    pub fn current_back_buffer_index(&self) -> usize {
        self.current
    }

    pub fn back_buffer(&self) -> &Texture {
        &self.back_buffers[self.current]
    }

    pub fn back_buffers(&self) -> &[Texture] {
        &self.back_buffers
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn size(&self) -> (u32, u32) {
        let bb = self.back_buffer();
        (bb.width(), bb.height())
    }

    /// Queues presentation of the current back buffer on the graphics
    /// timeline and advances to the next one.
    pub(crate) fn present(&mut self) {
        let mut buffer = CommandBuffer::new(QueueKind::Graphics);
        buffer.commands.push(Command::Present {
            swapchain: self.id,
            buffer: self.current as u32,
        });
        self.queue.execute_unsignaled(Arc::new(buffer));
        self.current = (self.current + 1) % self.back_buffers.len();
    }

    /// Recreates the back buffers. Every queue must be drained.
    pub(crate) fn resize(&mut self, width: u32, height: u32) {
        self.back_buffers.clear();
        let resources = self
            .backend
            .resize_swapchain(self.id, width, height)
            .or_fatal("resizing swapchain");
        self.adopt(resources, width, height);
        log::debug!("swapchain resized to {width}x{height}");
    }
}
