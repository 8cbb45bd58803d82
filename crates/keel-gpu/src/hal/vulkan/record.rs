//! Translation of recorded commands into a Vulkan command buffer.
//!
//! Render passes are implicit: rendering begins at the first draw after the
//! targets change and ends before anything that cannot run inside it.

use ash::vk;

use crate::hal::{Barrier, Command, CpuHandle, DrawArgs, QueueKind, ResourceDesc, ResourceId, ScissorRect, Viewport};

use super::conversion;
use super::descriptors::TargetView;
use super::present::PresentCopy;
use super::state::Shared;

enum Bound {
    Buffer(vk::Buffer, u64),
    Image(vk::Image, ResourceDesc),
}

pub(super) struct Recorder<'a> {
    shared: &'a Shared,
    cb: vk::CommandBuffer,
    kind: QueueKind,
    targets: Vec<TargetView>,
    depth: Option<TargetView>,
    scissor: Option<vk::Rect2D>,
    rendering: bool,
    presents: Vec<PresentCopy>,
}

impl<'a> Recorder<'a> {
    pub fn new(shared: &'a Shared, cb: vk::CommandBuffer, kind: QueueKind) -> Self {
        let recorder = Self {
            shared,
            cb,
            kind,
            targets: Vec::new(),
            depth: None,
            scissor: None,
            rendering: false,
            presents: Vec::new(),
        };
        recorder.bind_set();
        recorder
    }

    fn device(&self) -> &ash::Device {
        &self.shared.device
    }

    fn bind_set(&self) {
        let sets = [self.shared.bindless.set];
        for point in [vk::PipelineBindPoint::GRAPHICS, vk::PipelineBindPoint::COMPUTE] {
            unsafe {
                self.device().cmd_bind_descriptor_sets(
                    self.cb,
                    point,
                    self.shared.bindless.pipeline_layout,
                    0,
                    &sets,
                    &[],
                );
            }
        }
    }

    fn lookup(&self, resource: ResourceId) -> Option<Bound> {
        let resources = self.shared.resources.read();
        let res = resources.get(&resource)?;
        match (res.buffer(), res.image()) {
            (Some(buffer), _) => Some(Bound::Buffer(buffer, res.desc.allocation_size())),
            (_, Some(image)) => Some(Bound::Image(image, res.desc.clone())),
            _ => None,
        }
    }

    fn buffer(&self, resource: ResourceId) -> Option<vk::Buffer> {
        match self.lookup(resource)? {
            Bound::Buffer(buffer, _) => Some(buffer),
            Bound::Image(..) => None,
        }
    }

    fn image(&self, resource: ResourceId) -> Option<(vk::Image, ResourceDesc)> {
        match self.lookup(resource)? {
            Bound::Image(image, desc) => Some((image, desc)),
            Bound::Buffer(..) => None,
        }
    }

    pub fn record(&mut self, commands: &[Command]) {
        for command in commands {
            self.command(command);
        }
        self.end_rendering();
    }

    /// Presents recorded so far, to be released by the next signal.
    pub fn finish(mut self) -> Vec<PresentCopy> {
        self.end_rendering();
        std::mem::take(&mut self.presents)
    }

    fn command(&mut self, command: &Command) {
        let shared = self.shared;
        let device = &shared.device;
        let cb = self.cb;
        match command {
            Command::Barriers(barriers) => self.barriers(barriers),
            Command::SetDescriptorTables { .. } => {
                // Set 0 is bound at the start of every command buffer.
            }
            Command::SetPipeline(id) => {
                let pipelines = shared.pipelines.read();
                match pipelines.get(id) {
                    Some(p) => unsafe { device.cmd_bind_pipeline(cb, p.bind_point, p.pipeline) },
                    None => log::warn!("bind of unknown pipeline {id:?}"),
                }
            }
            Command::SetConstants(words) => unsafe {
                device.cmd_push_constants(
                    cb,
                    shared.bindless.pipeline_layout,
                    vk::ShaderStageFlags::ALL,
                    0,
                    bytemuck::cast_slice(words),
                );
            },
            Command::SetIndexBuffer {
                resource, format, ..
            } => match self.buffer(*resource) {
                Some(buffer) => unsafe {
                    device.cmd_bind_index_buffer(cb, buffer, 0, conversion::index_type(*format));
                },
                None => log::warn!("index buffer {resource:?} is not a buffer"),
            },
            Command::SetViewport(viewport) => self.set_viewport(viewport),
            Command::SetScissor(rect) => self.set_scissor(rect),
            Command::SetRenderTargets { targets, depth } => {
                self.end_rendering();
                self.targets = targets.iter().filter_map(|&h| self.target(h)).collect();
                self.depth = depth.and_then(|h| self.target(h));
            }
            Command::ClearRenderTarget { target, color } => {
                self.end_rendering();
                if let Some(view) = self.target(*target) {
                    let clear = vk::ClearValue {
                        color: vk::ClearColorValue { float32: *color },
                    };
                    self.begin(&[(view, Some(clear))], None);
                    self.end_rendering();
                }
            }
            Command::ClearDepthStencil {
                target,
                depth,
                stencil,
            } => {
                self.end_rendering();
                if let Some(view) = self.target(*target) {
                    let clear = vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: *depth,
                            stencil: u32::from(*stencil),
                        },
                    };
                    self.begin(&[], Some((view, Some(clear))));
                    self.end_rendering();
                }
            }
            Command::Draw(args) => self.draw(args),
            Command::Dispatch([x, y, z]) => {
                self.end_rendering();
                unsafe { device.cmd_dispatch(cb, *x, *y, *z) };
            }
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                self.end_rendering();
                if let (Some(s), Some(d)) = (self.buffer(*src), self.buffer(*dst)) {
                    let region = vk::BufferCopy {
                        src_offset: *src_offset,
                        dst_offset: *dst_offset,
                        size: *size,
                    };
                    unsafe { device.cmd_copy_buffer(cb, s, d, &[region]) };
                }
            }
            Command::CopyResource { src, dst } => {
                self.end_rendering();
                self.copy_resource(*src, *dst);
            }
            Command::CopyBufferToTexture {
                src,
                src_offset,
                dst,
                subresource,
            } => {
                self.end_rendering();
                if let (Some(buffer), Some((image, desc))) = (self.buffer(*src), self.image(*dst)) {
                    let region = image_region(&desc, *subresource, *src_offset);
                    unsafe {
                        device.cmd_copy_buffer_to_image(
                            cb,
                            buffer,
                            image,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            &[region],
                        );
                    }
                }
            }
            Command::CopyTextureToBuffer {
                src,
                subresource,
                dst,
                dst_offset,
            } => {
                self.end_rendering();
                if let (Some((image, desc)), Some(buffer)) = (self.image(*src), self.buffer(*dst)) {
                    let region = image_region(&desc, *subresource, *dst_offset);
                    unsafe {
                        device.cmd_copy_image_to_buffer(
                            cb,
                            image,
                            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            buffer,
                            &[region],
                        );
                    }
                }
            }
            Command::Present { swapchain, buffer } => {
                self.end_rendering();
                let copy = PresentCopy {
                    swapchain: *swapchain,
                    buffer: *buffer,
                };
                self.present(copy);
            }
        }
    }

    fn target(&self, handle: CpuHandle) -> Option<TargetView> {
        let view = self.shared.target(handle);
        if view.is_none() {
            log::warn!("empty target slot {handle:?}");
        }
        view
    }

    fn set_viewport(&self, vp: &Viewport) {
        let viewport = vk::Viewport {
            x: vp.x,
            y: vp.y,
            width: vp.width,
            height: vp.height,
            min_depth: vp.min_depth,
            max_depth: vp.max_depth,
        };
        unsafe { self.device().cmd_set_viewport(self.cb, 0, &[viewport]) };
    }

    fn set_scissor(&mut self, rect: &ScissorRect) {
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: rect.left as i32,
                y: rect.top as i32,
            },
            extent: vk::Extent2D {
                width: rect.right.saturating_sub(rect.left),
                height: rect.bottom.saturating_sub(rect.top),
            },
        };
        self.scissor = Some(scissor);
        unsafe { self.device().cmd_set_scissor(self.cb, 0, &[scissor]) };
    }

    fn barriers(&mut self, barriers: &[Barrier]) {
        self.end_rendering();
        let mut memory = Vec::new();
        let mut images = Vec::new();
        for barrier in barriers {
            match *barrier {
                Barrier::Transition {
                    resource,
                    before,
                    after,
                } => {
                    if !self.kind.allows(before) || !self.kind.allows(after) {
                        log::warn!("{:?} queue cannot transition {resource:?} {before:?} -> {after:?}", self.kind);
                    }
                    let (src_stage, src_access) = conversion::scope(before);
                    let (dst_stage, dst_access) = conversion::scope(after);
                    match self.lookup(resource) {
                        Some(Bound::Image(image, desc)) => {
                            let aspect = desc
                                .format()
                                .map_or(vk::ImageAspectFlags::COLOR, conversion::aspect);
                            images.push(
                                vk::ImageMemoryBarrier2::default()
                                    .src_stage_mask(src_stage)
                                    .src_access_mask(src_access)
                                    .dst_stage_mask(dst_stage)
                                    .dst_access_mask(dst_access)
                                    .old_layout(conversion::layout(before))
                                    .new_layout(conversion::layout(after))
                                    .image(image)
                                    .subresource_range(full_range(aspect)),
                            );
                        }
                        Some(Bound::Buffer(..)) => memory.push(
                            vk::MemoryBarrier2::default()
                                .src_stage_mask(src_stage)
                                .src_access_mask(src_access)
                                .dst_stage_mask(dst_stage)
                                .dst_access_mask(dst_access),
                        ),
                        None => log::warn!("barrier on unknown resource {resource:?}"),
                    }
                }
                Barrier::Uav { .. } => memory.push(
                    vk::MemoryBarrier2::default()
                        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                        .src_access_mask(vk::AccessFlags2::SHADER_WRITE)
                        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                        .dst_access_mask(vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE),
                ),
            }
        }
        let dependency = vk::DependencyInfo::default()
            .memory_barriers(&memory)
            .image_memory_barriers(&images);
        unsafe { self.device().cmd_pipeline_barrier2(self.cb, &dependency) };
    }

    /// Starts dynamic rendering. `None` clear values load the attachment.
    fn begin(&mut self, colors: &[(TargetView, Option<vk::ClearValue>)], depth: Option<(TargetView, Option<vk::ClearValue>)>) {
        let attachment = |view: &TargetView, clear: Option<vk::ClearValue>, layout| {
            let info = vk::RenderingAttachmentInfo::default()
                .image_view(view.view)
                .image_layout(layout)
                .store_op(vk::AttachmentStoreOp::STORE);
            match clear {
                Some(value) => info.load_op(vk::AttachmentLoadOp::CLEAR).clear_value(value),
                None => info.load_op(vk::AttachmentLoadOp::LOAD),
            }
        };
        let color_infos: Vec<vk::RenderingAttachmentInfo> = colors
            .iter()
            .map(|(view, clear)| attachment(view, *clear, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL))
            .collect();
        let depth_info = depth
            .as_ref()
            .map(|(view, clear)| attachment(view, *clear, vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL));

        let extent = colors
            .iter()
            .map(|(v, _)| v.extent)
            .chain(depth.as_ref().map(|(v, _)| v.extent))
            .reduce(|a, b| vk::Extent2D {
                width: a.width.min(b.width),
                height: a.height.min(b.height),
            })
            .unwrap_or_default();
        let area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };

        let mut info = vk::RenderingInfo::default()
            .render_area(area)
            .layer_count(1)
            .color_attachments(&color_infos);
        if let Some(depth_info) = depth_info.as_ref() {
            info = info.depth_attachment(depth_info);
        }
        unsafe {
            self.device().cmd_begin_rendering(self.cb, &info);
            if self.scissor.is_none() {
                self.device().cmd_set_scissor(self.cb, 0, &[area]);
            }
        }
        self.rendering = true;
    }

    fn end_rendering(&mut self) {
        if self.rendering {
            unsafe { self.device().cmd_end_rendering(self.cb) };
            self.rendering = false;
        }
    }

    fn draw(&mut self, args: &DrawArgs) {
        if !self.rendering {
            if self.targets.is_empty() && self.depth.is_none() {
                log::warn!("draw without render targets");
                return;
            }
            let colors: Vec<_> = self.targets.iter().map(|t| (*t, None)).collect();
            let depth = self.depth.map(|d| (d, None));
            self.begin(&colors, depth);
        }
        unsafe {
            match args.indexed {
                Some((first_index, base_vertex)) => self.device().cmd_draw_indexed(
                    self.cb,
                    args.vertex_count,
                    args.instance_count,
                    first_index,
                    base_vertex,
                    args.first_instance,
                ),
                None => self.device().cmd_draw(
                    self.cb,
                    args.vertex_count,
                    args.instance_count,
                    args.first_vertex,
                    args.first_instance,
                ),
            }
        }
    }

    fn copy_resource(&self, src: ResourceId, dst: ResourceId) {
        match (self.lookup(src), self.lookup(dst)) {
            (Some(Bound::Buffer(s, s_size)), Some(Bound::Buffer(d, d_size))) => {
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: s_size.min(d_size),
                };
                unsafe { self.device().cmd_copy_buffer(self.cb, s, d, &[region]) };
            }
            (Some(Bound::Image(s, desc)), Some(Bound::Image(d, _))) => {
                let regions: Vec<vk::ImageCopy> = (0..desc.subresource_count())
                    .map(|sub| {
                        let layers = conversion::subresource_layers(&desc, sub);
                        let fp = desc.footprint(sub);
                        vk::ImageCopy {
                            src_subresource: layers,
                            src_offset: vk::Offset3D::default(),
                            dst_subresource: layers,
                            dst_offset: vk::Offset3D::default(),
                            extent: vk::Extent3D {
                                width: fp.width,
                                height: fp.height,
                                depth: 1,
                            },
                        }
                    })
                    .collect();
                unsafe {
                    self.device().cmd_copy_image(
                        self.cb,
                        s,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        d,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &regions,
                    );
                }
            }
            _ => log::warn!("copy between {src:?} and {dst:?} of different kinds"),
        }
    }

    fn present(&mut self, copy: PresentCopy) {
        let Some((back_buffer, readback, width, height)) = self.shared.present_source(copy) else {
            log::warn!("present of unknown {:?}", copy.swapchain);
            return;
        };
        let Some((image, desc)) = self.image(back_buffer) else {
            return;
        };
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: conversion::subresource_layers(&desc, 0),
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
        };
        let host = vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_TRANSFER)
            .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::HOST)
            .dst_access_mask(vk::AccessFlags2::HOST_READ);
        unsafe {
            // Back buffers rest in the present state, whose layout is GENERAL.
            self.device().cmd_copy_image_to_buffer(
                self.cb,
                image,
                vk::ImageLayout::GENERAL,
                readback,
                &[region],
            );
            self.device().cmd_pipeline_barrier2(
                self.cb,
                &vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&host)),
            );
        }
        self.presents.push(copy);
    }
}

pub(super) fn full_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: vk::REMAINING_MIP_LEVELS,
        base_array_layer: 0,
        layer_count: vk::REMAINING_ARRAY_LAYERS,
    }
}

/// Tightly packed copy region of one subresource at `buffer_offset`.
fn image_region(desc: &ResourceDesc, subresource: u32, buffer_offset: u64) -> vk::BufferImageCopy {
    let fp = desc.footprint(subresource);
    vk::BufferImageCopy {
        buffer_offset,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: conversion::subresource_layers(desc, subresource),
        image_offset: vk::Offset3D::default(),
        image_extent: vk::Extent3D {
            width: fp.width,
            height: fp.height,
            depth: 1,
        },
    }
}
