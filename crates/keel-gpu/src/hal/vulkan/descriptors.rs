//! The bindless descriptor set and the CPU-side target tables.
//!
//! Every shader-visible slot index is an array element shared by all
//! resource bindings of set 0; the binding a view lands in follows its kind.
//! Render-target and depth tables never reach the GPU: their slots hold the
//! image views dynamic rendering attaches.

use ash::vk;

use crate::hal::{
    CpuHandle, Format, HalError, HalResult, ResourceDesc, ResourceId, TableId, TableKind, ViewDesc,
    mip_extent,
};

use super::conversion;
use super::memory::Handle;
use super::state::{Shared, table_base};

/// Bytes of root constants, pushed as one range visible to every stage.
pub const PUSH_CONSTANT_BYTES: u32 = 256;

/// Array length of every resource binding.
pub const RESOURCE_SLOTS: u32 = 8192;
pub const SAMPLER_SLOTS: u32 = 1024;

/// Binding numbers of set 0; must match `shaders/bindless.wgsl`.
pub mod binding {
    pub const TEXTURES: u32 = 0;
    pub const TEXTURE_ARRAYS: u32 = 1;
    pub const CUBES: u32 = 2;
    pub const STORAGE_RGBA8: u32 = 3;
    pub const STORAGE_RGBA32F: u32 = 4;
    pub const STORAGE_R32F: u32 = 5;
    pub const BUFFERS: u32 = 6;
    pub const SAMPLERS: u32 = 7;
}

/// Binding a storage view of `format` is written into.
pub fn storage_binding(format: Format) -> Option<u32> {
    match format.non_srgb() {
        Format::Rgba8Unorm => Some(binding::STORAGE_RGBA8),
        Format::Rgba32Float => Some(binding::STORAGE_RGBA32F),
        Format::R32Float => Some(binding::STORAGE_R32F),
        _ => None,
    }
}

/// Binding and view type of a sampled texture view.
pub fn texture_binding(array_size: u32, cube: bool) -> (u32, vk::ImageViewType) {
    if cube {
        (binding::CUBES, vk::ImageViewType::CUBE)
    } else if array_size > 1 {
        (binding::TEXTURE_ARRAYS, vk::ImageViewType::TYPE_2D_ARRAY)
    } else {
        (binding::TEXTURES, vk::ImageViewType::TYPE_2D)
    }
}

const BINDINGS: [(u32, vk::DescriptorType, u32); 8] = [
    (binding::TEXTURES, vk::DescriptorType::SAMPLED_IMAGE, RESOURCE_SLOTS),
    (binding::TEXTURE_ARRAYS, vk::DescriptorType::SAMPLED_IMAGE, RESOURCE_SLOTS),
    (binding::CUBES, vk::DescriptorType::SAMPLED_IMAGE, RESOURCE_SLOTS),
    (binding::STORAGE_RGBA8, vk::DescriptorType::STORAGE_IMAGE, RESOURCE_SLOTS),
    (binding::STORAGE_RGBA32F, vk::DescriptorType::STORAGE_IMAGE, RESOURCE_SLOTS),
    (binding::STORAGE_R32F, vk::DescriptorType::STORAGE_IMAGE, RESOURCE_SLOTS),
    (binding::BUFFERS, vk::DescriptorType::STORAGE_BUFFER, RESOURCE_SLOTS),
    (binding::SAMPLERS, vk::DescriptorType::SAMPLER, SAMPLER_SLOTS),
];

pub(super) struct Bindless {
    pub set_layout: vk::DescriptorSetLayout,
    pub pool: vk::DescriptorPool,
    pub set: vk::DescriptorSet,
    pub pipeline_layout: vk::PipelineLayout,
}

impl Bindless {
    pub fn new(device: &ash::Device) -> HalResult<Self> {
        let err = |what: &'static str| move |e: vk::Result| HalError::DeviceCreation(format!("{what}: {e}"));

        let bindings: Vec<vk::DescriptorSetLayoutBinding> = BINDINGS
            .iter()
            .map(|&(binding, ty, count)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(ty)
                    .descriptor_count(count)
                    .stage_flags(vk::ShaderStageFlags::ALL)
            })
            .collect();
        let flags = vec![
            vk::DescriptorBindingFlags::PARTIALLY_BOUND
                | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
                | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING;
            bindings.len()
        ];
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);
        let set_layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(err("bindless set layout"))?;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: 3 * RESOURCE_SLOTS,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: 3 * RESOURCE_SLOTS,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: RESOURCE_SLOTS,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: SAMPLER_SLOTS,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(err("bindless pool"))?;

        let layouts = [set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let set = unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .map_err(err("bindless set"))?[0];

        let push = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::ALL,
            offset: 0,
            size: PUSH_CONSTANT_BYTES,
        };
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&layouts)
            .push_constant_ranges(std::slice::from_ref(&push));
        let pipeline_layout = unsafe { device.create_pipeline_layout(&pipeline_layout_info, None) }
            .map_err(err("bindless pipeline layout"))?;

        Ok(Self {
            set_layout,
            pool,
            set,
            pipeline_layout,
        })
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_pool(self.pool, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

/// An attachable image view held by a render-target or depth slot.
#[derive(Debug, Copy, Clone)]
pub(super) struct TargetView {
    pub view: vk::ImageView,
    pub image: vk::Image,
    pub extent: vk::Extent2D,
    pub format: Format,
}

pub(super) enum TableSlots {
    /// Elements of the bindless resource bindings.
    Resource { capacity: u32 },
    Sampler { slots: Vec<vk::Sampler> },
    Target {
        kind: TableKind,
        slots: Vec<Option<TargetView>>,
    },
}

impl TableSlots {
    fn kind(&self) -> TableKind {
        match self {
            TableSlots::Resource { .. } => TableKind::Resource,
            TableSlots::Sampler { .. } => TableKind::Sampler,
            TableSlots::Target { kind, .. } => *kind,
        }
    }

    fn capacity(&self) -> u32 {
        match self {
            TableSlots::Resource { capacity } => *capacity,
            TableSlots::Sampler { slots } => slots.len() as u32,
            TableSlots::Target { slots, .. } => slots.len() as u32,
        }
    }

    /// Target views are owned by their images.
    pub fn destroy(self, device: &ash::Device) {
        if let TableSlots::Sampler { slots } = self {
            for sampler in slots.into_iter().filter(|s| *s != vk::Sampler::null()) {
                unsafe { device.destroy_sampler(sampler, None) };
            }
        }
    }
}

/// Handle stride of every table.
pub const DESCRIPTOR_STRIDE: u64 = 32;

impl Shared {
    pub fn create_descriptor_table(
        &self,
        kind: TableKind,
        capacity: u32,
    ) -> HalResult<(TableId, CpuHandle)> {
        let mut tables = self.tables.write();
        if kind.is_shader_visible() && tables.values().any(|t| t.kind() == kind) {
            return Err(HalError::Unsupported(format!(
                "a second shader-visible {kind:?} table"
            )));
        }
        let limit = match kind {
            TableKind::Resource => RESOURCE_SLOTS,
            TableKind::Sampler => SAMPLER_SLOTS,
            TableKind::RenderTarget | TableKind::DepthStencil => u32::MAX / DESCRIPTOR_STRIDE as u32,
        };
        if capacity > limit {
            return Err(HalError::Unsupported(format!(
                "{kind:?} table of {capacity} descriptors exceeds {limit}"
            )));
        }

        let slots = match kind {
            TableKind::Resource => TableSlots::Resource { capacity },
            TableKind::Sampler => TableSlots::Sampler {
                slots: vec![vk::Sampler::null(); capacity as usize],
            },
            TableKind::RenderTarget | TableKind::DepthStencil => TableSlots::Target {
                kind,
                slots: vec![None; capacity as usize],
            },
        };
        let id = TableId(self.next_id());
        tables.insert(id, slots);
        Ok((id, table_base(id)))
    }

    /// Creates a view of `resource` and hands it to the image's view list.
    fn create_view(
        &self,
        resource: ResourceId,
        shape: impl FnOnce(&ResourceDesc) -> ViewShape,
        usage: vk::ImageUsageFlags,
    ) -> HalResult<(vk::ImageView, vk::Image, ResourceDesc)> {
        let mut resources = self.resources.write();
        let res = resources
            .get_mut(&resource)
            .ok_or(HalError::UnknownResource(resource))?;
        let desc = res.desc.clone();
        let Handle::Image { image, views } = &mut res.handle else {
            return Err(HalError::Unsupported(format!("{resource:?} is not a texture")));
        };
        let shape = shape(&desc);
        let mut usage_info = vk::ImageViewUsageCreateInfo::default().usage(usage);
        let create_info = vk::ImageViewCreateInfo::default()
            .image(*image)
            .view_type(shape.view_type)
            .format(conversion::format(shape.format))
            .subresource_range(shape.range)
            .push_next(&mut usage_info);
        let view = unsafe { self.device.create_image_view(&create_info, None) }
            .map_err(|e| HalError::Unsupported(format!("creating image view: {e}")))?;
        views.push(view);
        Ok((view, *image, desc))
    }

    fn buffer_of(&self, resource: ResourceId) -> HalResult<vk::Buffer> {
        self.resources
            .read()
            .get(&resource)
            .and_then(|r| r.buffer())
            .ok_or(HalError::UnknownResource(resource))
    }

    pub fn write_descriptor(&self, table: TableId, index: u32, view: &ViewDesc) -> HalResult<()> {
        {
            let tables = self.tables.read();
            let t = tables
                .get(&table)
                .ok_or_else(|| HalError::Unsupported(format!("unknown table {table:?}")))?;
            if view.table_kind() != t.kind() {
                return Err(HalError::Unsupported(format!(
                    "{:?} view written into a {:?} table",
                    view.table_kind(),
                    t.kind()
                )));
            }
            if index >= t.capacity() {
                return Err(HalError::InvalidDescriptor {
                    kind: t.kind(),
                    index,
                });
            }
        }

        match *view {
            ViewDesc::ConstantBuffer {
                resource,
                offset,
                size,
            } => {
                let buffer = self.buffer_of(resource)?;
                self.write_buffer(index, buffer, offset, size)
            }
            ViewDesc::StructuredBuffer {
                resource,
                first_element,
                num_elements,
                stride,
            } => {
                let buffer = self.buffer_of(resource)?;
                let stride = u64::from(stride);
                self.write_buffer(index, buffer, first_element * stride, u64::from(num_elements) * stride)
            }
            ViewDesc::Texture {
                resource,
                format,
                most_detailed_mip,
                mip_levels,
                first_slice,
                array_size,
                cube,
            } => {
                let (slot_binding, view_type) = texture_binding(array_size, cube);
                let (view, _, _) = self.create_view(
                    resource,
                    |desc| {
                        let depth = desc.format().is_some_and(Format::is_depth);
                        let format = if depth { Format::D32Float } else { format };
                        ViewShape {
                            view_type,
                            format,
                            range: vk::ImageSubresourceRange {
                                aspect_mask: conversion::aspect(format),
                                base_mip_level: most_detailed_mip,
                                level_count: mip_levels,
                                base_array_layer: first_slice,
                                layer_count: array_size.max(1),
                            },
                        }
                    },
                    vk::ImageUsageFlags::SAMPLED,
                )?;
                self.write_image(slot_binding, index, vk::DescriptorType::SAMPLED_IMAGE, view);
                Ok(())
            }
            ViewDesc::StorageTexture {
                resource,
                format,
                mip_slice,
                slice,
            } => {
                let slot_binding = storage_binding(format).ok_or_else(|| {
                    HalError::Unsupported(format!("storage views of {format:?}"))
                })?;
                let (view, _, _) = self.create_view(
                    resource,
                    |_| ViewShape {
                        view_type: vk::ImageViewType::TYPE_2D,
                        format: format.non_srgb(),
                        range: vk::ImageSubresourceRange {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            base_mip_level: mip_slice,
                            level_count: 1,
                            base_array_layer: slice,
                            layer_count: 1,
                        },
                    },
                    vk::ImageUsageFlags::STORAGE,
                )?;
                self.write_image(slot_binding, index, vk::DescriptorType::STORAGE_IMAGE, view);
                Ok(())
            }
            ViewDesc::RenderTarget {
                resource,
                format,
                mip_slice,
            } => {
                let (view, image, desc) = self.create_view(
                    resource,
                    |_| target_shape(format, mip_slice),
                    vk::ImageUsageFlags::COLOR_ATTACHMENT,
                )?;
                self.set_target(table, index, view, image, &desc, format, mip_slice);
                Ok(())
            }
            ViewDesc::DepthStencil { resource, format } => {
                let (view, image, desc) = self.create_view(
                    resource,
                    |_| target_shape(format, 0),
                    vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                )?;
                self.set_target(table, index, view, image, &desc, format, 0);
                Ok(())
            }
            ViewDesc::Sampler(ref desc) => {
                let sampler = unsafe { self.device.create_sampler(&conversion::sampler_info(desc), None) }
                    .map_err(|e| HalError::Unsupported(format!("creating sampler: {e}")))?;
                let mut tables = self.tables.write();
                if let Some(TableSlots::Sampler { slots }) = tables.get_mut(&table) {
                    let old = std::mem::replace(&mut slots[index as usize], sampler);
                    if old != vk::Sampler::null() {
                        // May still be referenced by work in flight.
                        self.retired_samplers.lock().push(old);
                    }
                }
                let info = vk::DescriptorImageInfo::default().sampler(sampler);
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(self.bindless.set)
                    .dst_binding(binding::SAMPLERS)
                    .dst_array_element(index)
                    .descriptor_type(vk::DescriptorType::SAMPLER)
                    .image_info(std::slice::from_ref(&info));
                unsafe { self.device.update_descriptor_sets(&[write], &[]) };
                Ok(())
            }
        }
    }

    fn write_buffer(&self, index: u32, buffer: vk::Buffer, offset: u64, range: u64) -> HalResult<()> {
        let info = vk::DescriptorBufferInfo {
            buffer,
            offset,
            range: range.max(4),
        };
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.bindless.set)
            .dst_binding(binding::BUFFERS)
            .dst_array_element(index)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(std::slice::from_ref(&info));
        // Writes into the one set are serialized by the table lock.
        let _tables = self.tables.write();
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    fn write_image(&self, slot_binding: u32, index: u32, ty: vk::DescriptorType, view: vk::ImageView) {
        let info = vk::DescriptorImageInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::GENERAL);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.bindless.set)
            .dst_binding(slot_binding)
            .dst_array_element(index)
            .descriptor_type(ty)
            .image_info(std::slice::from_ref(&info));
        let _tables = self.tables.write();
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
    }

    #[allow(clippy::too_many_arguments)]
    fn set_target(
        &self,
        table: TableId,
        index: u32,
        view: vk::ImageView,
        image: vk::Image,
        desc: &ResourceDesc,
        format: Format,
        mip: u32,
    ) {
        let (width, height) = match *desc {
            ResourceDesc::Texture2D { width, height, .. } => (mip_extent(width, mip), mip_extent(height, mip)),
            ResourceDesc::Buffer { .. } => (1, 1),
        };
        let mut tables = self.tables.write();
        if let Some(TableSlots::Target { slots, .. }) = tables.get_mut(&table) {
            slots[index as usize] = Some(TargetView {
                view,
                image,
                extent: vk::Extent2D { width, height },
                format,
            });
        }
    }

    /// Attachment behind a render-target or depth handle.
    pub fn target(&self, handle: CpuHandle) -> Option<TargetView> {
        let (table, index) = super::state::handle_slot(handle, DESCRIPTOR_STRIDE);
        match self.tables.read().get(&table)? {
            TableSlots::Target { slots, .. } => slots.get(index as usize).copied().flatten(),
            _ => None,
        }
    }
}

/// Type, format and range of an image view about to be created.
struct ViewShape {
    view_type: vk::ImageViewType,
    format: Format,
    range: vk::ImageSubresourceRange,
}

fn target_shape(format: Format, mip: u32) -> ViewShape {
    ViewShape {
        view_type: vk::ImageViewType::TYPE_2D,
        format,
        range: vk::ImageSubresourceRange {
            aspect_mask: conversion::aspect(format),
            base_mip_level: mip,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_views_pick_a_binding_by_format() {
        assert_eq!(storage_binding(Format::Rgba8UnormSrgb), Some(binding::STORAGE_RGBA8));
        assert_eq!(storage_binding(Format::Rgba32Float), Some(binding::STORAGE_RGBA32F));
        assert_eq!(storage_binding(Format::Bgra8Unorm), None);
    }

    #[test]
    fn texture_views_pick_a_binding_by_shape() {
        assert_eq!(texture_binding(1, false).0, binding::TEXTURES);
        assert_eq!(texture_binding(4, false).1, vk::ImageViewType::TYPE_2D_ARRAY);
        assert_eq!(texture_binding(6, true).0, binding::CUBES);
    }

    #[test]
    fn bindings_are_numbered_densely() {
        for (i, (b, _, _)) in BINDINGS.iter().enumerate() {
            assert_eq!(*b, i as u32);
        }
    }
}
