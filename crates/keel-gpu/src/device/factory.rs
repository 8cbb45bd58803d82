//! Resource creation: allocation, descriptor registration and uploads.
//!
//! Descriptor indices are assigned in call order under each table's lock.
//! Uploads go through a staging allocation and a transient copy context, and
//! block until the context's fence completes, so uploads on different threads
//! proceed in parallel. Transfers run on the copy queue unless the resource
//! rests in a state the copy queue cannot name (render and depth targets);
//! those go through the graphics queue instead.

use std::ops::Range;
use std::sync::Arc;

use bytemuck::Pod;

use crate::context::{CopyContext, RecordingContext};
use crate::error::fatal;
use crate::hal::{PipelineDesc, QueueKind, ResourceState, SamplerDesc, TableKind, ViewDesc};
use crate::pipeline::PipelineState;
use crate::queue::SubmissionQueue;
use crate::resource::{
    Allocation, Buffer, BufferDesc, BufferUsage, INVALID_INDEX, Sampler, Texture, TextureDesc,
    TextureUsage,
};

use super::Device;

impl Device {
    /// Creates a buffer holding `data`, sized for at least `desc.element_count` elements.
    pub fn create_buffer<T: Pod>(&self, desc: &BufferDesc, data: &[T]) -> Buffer {
        let stride = std::mem::size_of::<T>() as u32;
        if stride == 0 {
            fatal(format_args!("buffer '{}' has a zero-sized element type", desc.name));
        }
        let element_count = (data.len() as u32).max(desc.element_count);
        let size_in_bytes = stride as u64 * element_count as u64;

        let allocation = self
            .allocator
            .create_buffer_allocation(desc.usage, size_in_bytes, &desc.name);

        let bytes: &[u8] = bytemuck::cast_slice(data);
        if !bytes.is_empty() {
            if allocation.is_mapped() {
                allocation.update(0, bytes);
            } else {
                self.upload_buffer(&allocation, bytes, &desc.name);
            }
        }

        let mut buffer = Buffer {
            usage: desc.usage,
            size_in_bytes,
            stride,
            element_count,
            srv_index: INVALID_INDEX,
            uav_index: INVALID_INDEX,
            cbv_index: INVALID_INDEX,
            name: desc.name.clone(),
            allocation,
        };

        match desc.usage {
            BufferUsage::StructuredBuffer => {
                buffer.srv_index = self.tables.register(&ViewDesc::StructuredBuffer {
                    resource: buffer.resource(),
                    first_element: 0,
                    num_elements: element_count,
                    stride,
                });
            }
            BufferUsage::ConstantBuffer => {
                buffer.cbv_index = self.tables.register(&ViewDesc::ConstantBuffer {
                    resource: buffer.resource(),
                    offset: 0,
                    size: buffer.allocation.size(),
                });
            }
            BufferUsage::UploadBuffer | BufferUsage::IndexBuffer | BufferUsage::ReadbackBuffer => {}
        }

        log::trace!("buffer '{}' created: {size_in_bytes} bytes", buffer.name);
        buffer
    }

    /// Creates a texture, uploading `pixels` into mip 0 of each array slice.
    ///
    /// `pixels` holds tightly packed rows, slice after slice.
    pub fn create_texture(&self, desc: &TextureDesc, pixels: Option<&[u8]>) -> Texture {
        let mut desc = desc.clone();
        desc.mip_levels = desc.resolved_mip_levels();
        if desc.cube {
            desc.array_size = 6;
        }
        desc.array_size = desc.array_size.max(1);

        let allocation = self.allocator.create_texture_allocation(
            &desc.resource_desc(),
            desc.usage,
            &desc.name,
        );
        let mut texture = Texture {
            allocation,
            desc,
            srv_index: INVALID_INDEX,
            uav_index: INVALID_INDEX,
            rtv_index: INVALID_INDEX,
            dsv_index: INVALID_INDEX,
        };
        self.write_texture_views(&mut texture);

        if let Some(pixels) = pixels {
            self.upload_texture(&texture, pixels);
        }

        log::trace!(
            "texture '{}' created: {}x{} {:?}, {} mips",
            texture.desc.name,
            texture.width(),
            texture.height(),
            texture.format(),
            texture.mip_levels()
        );
        texture
    }

    pub fn create_sampler(&self, desc: SamplerDesc) -> Sampler {
        let sampler_index = self.tables.register(&ViewDesc::Sampler(desc));
        Sampler {
            sampler_index,
            desc,
        }
    }

    pub fn create_pipeline_state(&self, desc: impl Into<PipelineDesc>) -> PipelineState {
        PipelineState::create(self.backend.as_ref(), &desc.into())
    }

    /// Registers an extra shader-resource view over `mip_levels` mips starting
    /// at `most_detailed_mip`. The slot is never reclaimed.
    pub fn create_srv(&self, texture: &Texture, most_detailed_mip: u32, mip_levels: u32) -> u32 {
        self.tables
            .register(&mip_range_view(texture, most_detailed_mip, mip_levels))
    }

    /// Registers an extra storage view of one mip. The slot is never reclaimed.
    pub fn create_uav(&self, texture: &Texture, mip: u32) -> u32 {
        self.tables.register(&storage_view(texture, mip))
    }

    /// Sets aside `count` resource-table slots for views that are rewritten
    /// over and over with [`Device::write_srv`] and [`Device::write_uav`].
    pub fn reserve_resource_slots(&self, count: u32) -> Range<u32> {
        self.tables.table(TableKind::Resource).lock().reserve(count)
    }

    /// Points a reserved slot at `mip_levels` mips of `texture`.
    ///
    /// Work that still reads the slot's previous view must have completed.
    pub fn write_srv(&self, index: u32, texture: &Texture, most_detailed_mip: u32, mip_levels: u32) {
        self.tables
            .rewrite(index, &mip_range_view(texture, most_detailed_mip, mip_levels));
    }

    /// Points a reserved slot at a storage view of one mip of `texture`.
    pub fn write_uav(&self, index: u32, texture: &Texture, mip: u32) {
        self.tables.rewrite(index, &storage_view(texture, mip));
    }

    /// Reallocates `texture` at a new size, keeping its descriptor indices.
    ///
    /// Drains the graphics queue first, since in-flight frames may still read
    /// the old views.
    pub fn resize_texture(&self, texture: &mut Texture, width: u32, height: u32) {
        if texture.width() == width && texture.height() == height {
            return;
        }
        self.graphics_queue.flush();

        let mut desc = texture.desc.clone();
        desc.width = width.max(1);
        desc.height = height.max(1);
        desc.mip_levels = desc.resolved_mip_levels();

        let allocation =
            self.allocator
                .create_texture_allocation(&desc.resource_desc(), desc.usage, &desc.name);
        // The old allocation retires here.
        texture.allocation = allocation;
        texture.desc = desc;
        self.write_texture_views(texture);
        log::debug!("texture '{}' resized to {width}x{height}", texture.desc.name);
    }

    /// Copies one subresource back to the CPU as tightly packed rows.
    ///
    /// The texture must rest in its initial state.
    pub fn read_texture(&self, texture: &Texture, mip: u32, slice: u32) -> Vec<u8> {
        let raw = texture.resource_desc();
        let subresource = raw.subresource_index(mip, slice);
        let footprint = raw.footprint(subresource);

        let readback = self.allocator.create_buffer_allocation(
            BufferUsage::ReadbackBuffer,
            footprint.size,
            "texture readback",
        );

        let state = texture.allocation.initial_state();
        let mut ctx = CopyContext::new(Arc::clone(self.transfer_queue(state)));
        ctx.reset();
        ctx.add_resource_barrier(texture.resource(), state, ResourceState::CopySource);
        ctx.execute_resource_barriers();
        ctx.copy_texture_to_buffer(texture.resource(), subresource, readback.resource(), 0);
        ctx.add_resource_barrier(texture.resource(), ResourceState::CopySource, state);
        ctx.execute_resource_barriers();
        self.submit_and_wait(&mut ctx);

        let mut out = vec![0u8; footprint.size as usize];
        readback.read(0, &mut out);
        self.allocator.free_now(readback);
        out
    }

    /// Writes every view the texture's usage calls for. Existing indices are
    /// rewritten in place; missing ones are allocated.
    fn write_texture_views(&self, texture: &mut Texture) {
        let resource = texture.resource();
        let format = texture.format();
        let desc = &texture.desc;

        let srv = ViewDesc::Texture {
            resource,
            format: format.shader_view_format(),
            most_detailed_mip: 0,
            mip_levels: desc.mip_levels,
            first_slice: 0,
            array_size: desc.array_size,
            cube: desc.cube,
        };

        let mut views: Vec<(&mut u32, ViewDesc)> = Vec::with_capacity(2);
        match desc.usage {
            TextureUsage::RenderTarget => {
                views.push((
                    &mut texture.rtv_index,
                    ViewDesc::RenderTarget {
                        resource,
                        format,
                        mip_slice: 0,
                    },
                ));
                views.push((&mut texture.srv_index, srv));
            }
            TextureUsage::DepthStencil { sampled } => {
                views.push((&mut texture.dsv_index, ViewDesc::DepthStencil { resource, format }));
                if sampled {
                    views.push((&mut texture.srv_index, srv));
                }
            }
            TextureUsage::UnorderedAccess => {
                views.push((
                    &mut texture.uav_index,
                    ViewDesc::StorageTexture {
                        resource,
                        format: format.non_srgb(),
                        mip_slice: 0,
                        slice: 0,
                    },
                ));
                views.push((&mut texture.srv_index, srv));
            }
            TextureUsage::Sampled => views.push((&mut texture.srv_index, srv)),
        }

        for (index, view) in views {
            if *index == INVALID_INDEX {
                *index = self.tables.register(&view);
            } else {
                self.tables.rewrite(*index, &view);
            }
        }
    }

    fn upload_buffer(&self, dst: &Allocation, bytes: &[u8], name: &str) {
        let staging = self.allocator.create_buffer_allocation(
            BufferUsage::UploadBuffer,
            bytes.len() as u64,
            &format!("{name} (staging)"),
        );
        staging.update(0, bytes);

        let state = dst.initial_state();
        let mut ctx = CopyContext::new(Arc::clone(self.transfer_queue(state)));
        ctx.reset();
        ctx.add_resource_barrier(dst.resource(), state, ResourceState::CopyDest);
        ctx.execute_resource_barriers();
        ctx.copy_buffer(staging.resource(), 0, dst.resource(), 0, bytes.len() as u64);
        ctx.add_resource_barrier(dst.resource(), ResourceState::CopyDest, state);
        ctx.execute_resource_barriers();
        self.submit_and_wait(&mut ctx);
        self.allocator.free_now(staging);
    }

    fn upload_texture(&self, texture: &Texture, pixels: &[u8]) {
        let raw = texture.resource_desc();
        let slices = texture.desc.array_size;
        let slice_bytes = raw.footprint(0).size;
        let total = slice_bytes * slices as u64;
        if (pixels.len() as u64) < total {
            fatal(format_args!(
                "texture '{}' needs {total} bytes of pixel data, got {}",
                texture.desc.name,
                pixels.len()
            ));
        }

        let staging = self.allocator.create_buffer_allocation(
            BufferUsage::UploadBuffer,
            total,
            &format!("{} (staging)", texture.desc.name),
        );
        staging.update(0, &pixels[..total as usize]);

        let state = texture.allocation.initial_state();
        let mut ctx = CopyContext::new(Arc::clone(self.transfer_queue(state)));
        ctx.reset();
        ctx.add_resource_barrier(texture.resource(), state, ResourceState::CopyDest);
        ctx.execute_resource_barriers();
        for slice in 0..slices {
            ctx.copy_buffer_to_texture(
                staging.resource(),
                slice as u64 * slice_bytes,
                texture.resource(),
                raw.subresource_index(0, slice),
            );
        }
        ctx.add_resource_barrier(texture.resource(), ResourceState::CopyDest, state);
        ctx.execute_resource_barriers();
        self.submit_and_wait(&mut ctx);
        self.allocator.free_now(staging);
    }

    /// Queue for transfers of a resource resting in `state`.
    fn transfer_queue(&self, state: ResourceState) -> &Arc<SubmissionQueue> {
        if QueueKind::Copy.allows(state) {
            &self.copy_queue
        } else {
            &self.graphics_queue
        }
    }

    /// Submits a transient copy context and blocks on its fence. Staging
    /// memory owned by the caller may be dropped afterwards.
    fn submit_and_wait(&self, ctx: &mut CopyContext) {
        let queue = Arc::clone(ctx.queue());
        let value = queue.submit(&mut [ctx as &mut dyn RecordingContext]);
        queue.wait_for_value(value);
    }
}

fn mip_range_view(texture: &Texture, most_detailed_mip: u32, mip_levels: u32) -> ViewDesc {
    ViewDesc::Texture {
        resource: texture.resource(),
        format: texture.format().shader_view_format(),
        most_detailed_mip,
        mip_levels,
        first_slice: 0,
        array_size: texture.desc.array_size,
        cube: false,
    }
}

fn storage_view(texture: &Texture, mip: u32) -> ViewDesc {
    debug_assert_eq!(
        texture.usage(),
        TextureUsage::UnorderedAccess,
        "'{}' does not allow storage views",
        texture.desc.name
    );
    ViewDesc::StorageTexture {
        resource: texture.resource(),
        format: texture.format().non_srgb(),
        mip_slice: mip,
        slice: 0,
    }
}
