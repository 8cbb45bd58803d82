//! Mapping of device-interface enums onto Vulkan.

use ash::vk;

use crate::hal::{
    AddressMode, CompareFunc, Filter, Format, IndexFormat, MemoryClass, ResourceDesc,
    ResourceState, SamplerDesc,
};

pub fn format(format: Format) -> vk::Format {
    match format {
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::Bgra8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::Rg32Float => vk::Format::R32G32_SFLOAT,
        Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::R32Uint => vk::Format::R32_UINT,
        Format::D32Float => vk::Format::D32_SFLOAT,
    }
}

pub fn aspect(format: Format) -> vk::ImageAspectFlags {
    if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Image layout a resource in `state` is kept in.
///
/// Shader access of every kind shares `GENERAL`, so bindless descriptors
/// never depend on the state a texture currently rests in.
pub fn layout(state: ResourceState) -> vk::ImageLayout {
    match state {
        ResourceState::CopySource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ResourceState::CopyDest => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ResourceState::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ResourceState::DepthWrite => vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        ResourceState::Common
        | ResourceState::GenericRead
        | ResourceState::DepthRead
        | ResourceState::PixelShaderResource
        | ResourceState::NonPixelShaderResource
        | ResourceState::AllShaderResource
        | ResourceState::UnorderedAccess
        | ResourceState::IndexBuffer
        | ResourceState::ConstantBuffer => vk::ImageLayout::GENERAL,
    }
}

/// Pipeline stages and accesses a resource in `state` takes part in.
pub fn scope(state: ResourceState) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    use vk::AccessFlags2 as A;
    use vk::PipelineStageFlags2 as S;
    match state {
        ResourceState::Common => (S::ALL_COMMANDS, A::MEMORY_READ | A::MEMORY_WRITE),
        ResourceState::GenericRead => (S::ALL_COMMANDS, A::MEMORY_READ),
        ResourceState::CopySource => (S::ALL_TRANSFER, A::TRANSFER_READ),
        ResourceState::CopyDest => (S::ALL_TRANSFER, A::TRANSFER_WRITE),
        ResourceState::RenderTarget => (
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
        ),
        ResourceState::DepthWrite => (
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        ResourceState::DepthRead => (
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS | S::FRAGMENT_SHADER,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::SHADER_SAMPLED_READ,
        ),
        ResourceState::PixelShaderResource => (S::FRAGMENT_SHADER, A::SHADER_READ),
        ResourceState::NonPixelShaderResource => {
            (S::VERTEX_SHADER | S::COMPUTE_SHADER, A::SHADER_READ)
        }
        ResourceState::AllShaderResource => (S::ALL_COMMANDS, A::SHADER_READ),
        ResourceState::UnorderedAccess => (S::ALL_COMMANDS, A::SHADER_READ | A::SHADER_WRITE),
        ResourceState::IndexBuffer => (S::INDEX_INPUT, A::INDEX_READ),
        ResourceState::ConstantBuffer => (S::ALL_COMMANDS, A::UNIFORM_READ | A::SHADER_READ),
    }
}

pub fn memory_location(class: MemoryClass) -> gpu_allocator::MemoryLocation {
    match class {
        MemoryClass::Default => gpu_allocator::MemoryLocation::GpuOnly,
        MemoryClass::Upload => gpu_allocator::MemoryLocation::CpuToGpu,
        MemoryClass::Readback => gpu_allocator::MemoryLocation::GpuToCpu,
    }
}

pub fn index_type(format: IndexFormat) -> vk::IndexType {
    match format {
        IndexFormat::Uint16 => vk::IndexType::UINT16,
        IndexFormat::Uint32 => vk::IndexType::UINT32,
    }
}

pub fn compare_op(func: CompareFunc) -> vk::CompareOp {
    match func {
        CompareFunc::Never => vk::CompareOp::NEVER,
        CompareFunc::Less => vk::CompareOp::LESS,
        CompareFunc::Equal => vk::CompareOp::EQUAL,
        CompareFunc::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareFunc::Greater => vk::CompareOp::GREATER,
        CompareFunc::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareFunc::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareFunc::Always => vk::CompareOp::ALWAYS,
    }
}

fn address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Wrap => vk::SamplerAddressMode::REPEAT,
        AddressMode::Mirror => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::Border => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

/// Vulkan only has fixed border colors; the closest one is picked.
fn border_color(color: [f32; 4]) -> vk::BorderColor {
    if color[3] < 0.5 {
        vk::BorderColor::FLOAT_TRANSPARENT_BLACK
    } else if color[0] + color[1] + color[2] < 1.5 {
        vk::BorderColor::FLOAT_OPAQUE_BLACK
    } else {
        vk::BorderColor::FLOAT_OPAQUE_WHITE
    }
}

pub fn sampler_info(desc: &SamplerDesc) -> vk::SamplerCreateInfo<'static> {
    let (filter, mipmap) = match desc.filter {
        Filter::Point => (vk::Filter::NEAREST, vk::SamplerMipmapMode::NEAREST),
        Filter::Linear | Filter::Anisotropic => (vk::Filter::LINEAR, vk::SamplerMipmapMode::LINEAR),
    };
    let anisotropic = desc.filter == Filter::Anisotropic && desc.max_anisotropy > 1;
    let mut info = vk::SamplerCreateInfo::default()
        .mag_filter(filter)
        .min_filter(filter)
        .mipmap_mode(mipmap)
        .address_mode_u(address_mode(desc.address_u))
        .address_mode_v(address_mode(desc.address_v))
        .address_mode_w(address_mode(desc.address_w))
        .mip_lod_bias(desc.mip_lod_bias)
        .anisotropy_enable(anisotropic)
        .max_anisotropy(desc.max_anisotropy.clamp(1, 16) as f32)
        .border_color(border_color(desc.border_color))
        .min_lod(desc.min_lod)
        .max_lod(desc.max_lod.min(vk::LOD_CLAMP_NONE));
    if let Some(func) = desc.comparison {
        info = info.compare_enable(true).compare_op(compare_op(func));
    }
    info
}

/// Every usage a buffer of the device interface may be put to.
pub fn buffer_usage() -> vk::BufferUsageFlags {
    vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST
        | vk::BufferUsageFlags::STORAGE_BUFFER
        | vk::BufferUsageFlags::UNIFORM_BUFFER
        | vk::BufferUsageFlags::INDEX_BUFFER
}

pub fn buffer_info(size: u64) -> vk::BufferCreateInfo<'static> {
    vk::BufferCreateInfo::default()
        .size(size.max(4))
        .usage(buffer_usage())
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
}

/// Create info of a 2D texture, or `None` for buffers.
pub fn image_info(desc: &ResourceDesc) -> Option<vk::ImageCreateInfo<'static>> {
    let ResourceDesc::Texture2D {
        width,
        height,
        array_size,
        mip_levels,
        format: texel_format,
        flags,
    } = *desc
    else {
        return None;
    };

    let mut usage = vk::ImageUsageFlags::SAMPLED
        | vk::ImageUsageFlags::TRANSFER_SRC
        | vk::ImageUsageFlags::TRANSFER_DST;
    if flags.render_target {
        usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if flags.depth_stencil {
        usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if flags.unordered_access {
        usage |= vk::ImageUsageFlags::STORAGE;
    }

    let mut create_flags = vk::ImageCreateFlags::empty();
    // Storage views of sRGB textures use the linear variant.
    if flags.unordered_access && texel_format.is_srgb() {
        create_flags |= vk::ImageCreateFlags::MUTABLE_FORMAT | vk::ImageCreateFlags::EXTENDED_USAGE;
    }
    if array_size % 6 == 0 && width == height {
        create_flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
    }

    Some(
        vk::ImageCreateInfo::default()
            .flags(create_flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(format(texel_format))
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(array_size)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED),
    )
}

/// Mip level and array layer of a subresource index.
pub fn subresource_layers(desc: &ResourceDesc, subresource: u32) -> vk::ImageSubresourceLayers {
    let (mip_levels, texel_format) = match *desc {
        ResourceDesc::Texture2D {
            mip_levels, format, ..
        } => (mip_levels, format),
        ResourceDesc::Buffer { .. } => (1, Format::Rgba8Unorm),
    };
    vk::ImageSubresourceLayers {
        aspect_mask: aspect(texel_format),
        mip_level: subresource % mip_levels,
        base_array_layer: subresource / mip_levels,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::ResourceFlags;

    fn texture(array_size: u32, format: Format, flags: ResourceFlags) -> ResourceDesc {
        ResourceDesc::Texture2D {
            width: 64,
            height: 64,
            array_size,
            mip_levels: 7,
            format,
            flags,
        }
    }

    #[test]
    fn shader_states_share_the_general_layout() {
        for state in [
            ResourceState::Common,
            ResourceState::PixelShaderResource,
            ResourceState::NonPixelShaderResource,
            ResourceState::UnorderedAccess,
        ] {
            assert_eq!(layout(state), vk::ImageLayout::GENERAL, "{state:?}");
        }
        assert_eq!(layout(ResourceState::PRESENT), vk::ImageLayout::GENERAL);
        assert_eq!(layout(ResourceState::CopyDest), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(
            layout(ResourceState::RenderTarget),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn copy_states_stay_in_the_transfer_stage() {
        let (stage, access) = scope(ResourceState::CopySource);
        assert_eq!(stage, vk::PipelineStageFlags2::ALL_TRANSFER);
        assert_eq!(access, vk::AccessFlags2::TRANSFER_READ);
    }

    #[test]
    fn srgb_storage_textures_allow_a_linear_view() {
        let flags = ResourceFlags {
            unordered_access: true,
            ..Default::default()
        };
        let info = image_info(&texture(1, Format::Rgba8UnormSrgb, flags)).unwrap();
        assert!(info.flags.contains(vk::ImageCreateFlags::MUTABLE_FORMAT));
        assert!(info.usage.contains(vk::ImageUsageFlags::STORAGE));

        let plain = image_info(&texture(1, Format::Rgba8Unorm, flags)).unwrap();
        assert!(!plain.flags.contains(vk::ImageCreateFlags::MUTABLE_FORMAT));
    }

    #[test]
    fn six_square_layers_are_cube_compatible() {
        let info = image_info(&texture(6, Format::Rgba8Unorm, ResourceFlags::default())).unwrap();
        assert!(info.flags.contains(vk::ImageCreateFlags::CUBE_COMPATIBLE));
        assert!(image_info(&ResourceDesc::buffer(16)).is_none());
    }

    #[test]
    fn subresources_split_into_mip_and_layer() {
        let desc = texture(2, Format::D32Float, ResourceFlags::default());
        let layers = subresource_layers(&desc, 9);
        assert_eq!((layers.mip_level, layers.base_array_layer), (2, 1));
        assert_eq!(layers.aspect_mask, vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    fn opaque_white_border_maps_to_white() {
        let desc = SamplerDesc {
            address_u: AddressMode::Border,
            border_color: [1.0; 4],
            ..SamplerDesc::default()
        };
        assert_eq!(sampler_info(&desc).border_color, vk::BorderColor::FLOAT_OPAQUE_WHITE);
    }
}
