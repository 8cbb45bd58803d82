//! Buffers, textures and samplers as seen by render code.
//!
//! A resource is its memory allocation plus the descriptor-table indices a
//! shader uses to reach it. Indices that do not apply to a resource hold
//! [`INVALID_INDEX`].

use std::sync::Arc;

use bytemuck::Pod;

use crate::allocator::{AllocatorShared, Placement};
use crate::hal::{
    Format, MappedMemory, MemoryClass, ResourceDesc, ResourceFlags, ResourceId, ResourceState,
    SamplerDesc, full_mip_chain, mip_extent,
};

/// Sentinel for "no descriptor of this kind".
pub const INVALID_INDEX: u32 = u32::MAX;

/// Constant-buffer views must cover a multiple of this many bytes.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// Sole owner of one GPU memory region.
///
/// Dropping an allocation hands the memory back to the allocator, which
/// frees it once the GPU can no longer be using it.
pub struct Allocation {
    pub(crate) resource: ResourceId,
    pub(crate) placement: Placement,
    pub(crate) mapped: Option<MappedMemory>,
    pub(crate) size: u64,
    pub(crate) initial_state: ResourceState,
    pub(crate) owner: Arc<AllocatorShared>,
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("resource", &self.resource)
            .field("placement", &self.placement)
            .field("size", &self.size)
            .field("mapped", &self.mapped.is_some())
            .finish()
    }
}

impl Allocation {
    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn initial_state(&self) -> ResourceState {
        self.initial_state
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    pub fn is_committed(&self) -> bool {
        matches!(self.placement, Placement::Committed)
    }

    /// Copies `data` into CPU-visible memory at `offset`.
    pub fn update(&self, offset: u64, data: &[u8]) {
        debug_assert!(self.mapped.is_some(), "update of an unmapped allocation");
        if let Some(mapped) = &self.mapped {
            mapped.write(offset, data);
        }
    }

    /// Copies CPU-visible memory at `offset` into `out`.
    pub fn read(&self, offset: u64, out: &mut [u8]) {
        debug_assert!(self.mapped.is_some(), "read of an unmapped allocation");
        if let Some(mapped) = &self.mapped {
            mapped.read(offset, out);
        }
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.owner.retire(self.resource, self.placement.clone());
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BufferUsage {
    /// CPU-written staging memory.
    UploadBuffer,
    /// CPU-written, shader-read constants; gets a CBV.
    ConstantBuffer,
    IndexBuffer,
    /// Shader-read array of elements; gets an SRV.
    StructuredBuffer,
    /// GPU-written memory read back by the CPU.
    ReadbackBuffer,
}

impl BufferUsage {
    pub(crate) fn memory_class(self) -> MemoryClass {
        match self {
            BufferUsage::UploadBuffer | BufferUsage::ConstantBuffer => MemoryClass::Upload,
            BufferUsage::IndexBuffer | BufferUsage::StructuredBuffer => MemoryClass::Default,
            BufferUsage::ReadbackBuffer => MemoryClass::Readback,
        }
    }

    pub(crate) fn initial_state(self) -> ResourceState {
        match self {
            BufferUsage::UploadBuffer | BufferUsage::ConstantBuffer => ResourceState::GenericRead,
            BufferUsage::IndexBuffer | BufferUsage::StructuredBuffer => ResourceState::Common,
            BufferUsage::ReadbackBuffer => ResourceState::CopyDest,
        }
    }

    pub(crate) fn allocation_size(self, bytes: u64) -> u64 {
        let bytes = bytes.max(1);
        match self {
            BufferUsage::ConstantBuffer => bytes.next_multiple_of(CONSTANT_BUFFER_ALIGNMENT),
            _ => bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub usage: BufferUsage,
    pub name: String,
    /// Minimum capacity in elements; the initial data may be shorter.
    pub element_count: u32,
}

impl BufferDesc {
    pub fn new(usage: BufferUsage, name: impl Into<String>) -> Self {
        Self {
            usage,
            name: name.into(),
            element_count: 0,
        }
    }

    pub fn with_capacity(mut self, element_count: u32) -> Self {
        self.element_count = element_count;
        self
    }
}

#[derive(Debug)]
pub struct Buffer {
    pub allocation: Allocation,
    pub usage: BufferUsage,
    pub size_in_bytes: u64,
    pub stride: u32,
    pub element_count: u32,
    pub srv_index: u32,
    pub uav_index: u32,
    pub cbv_index: u32,
    pub name: String,
}

impl Buffer {
    pub fn resource(&self) -> ResourceId {
        self.allocation.resource
    }

    /// Overwrites the start of the buffer with `value`.
    pub fn update<T: Pod>(&self, value: &T) {
        self.update_bytes(0, bytemuck::bytes_of(value));
    }

    pub fn update_slice<T: Pod>(&self, first_element: u32, values: &[T]) {
        let offset = first_element as u64 * std::mem::size_of::<T>() as u64;
        self.update_bytes(offset, bytemuck::cast_slice(values));
    }

    pub fn update_bytes(&self, offset: u64, data: &[u8]) {
        self.allocation.update(offset, data);
    }

    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) {
        self.allocation.read(offset, out);
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TextureUsage {
    /// Color target; gets an RTV and an SRV.
    RenderTarget,
    /// Depth target; gets a DSV, plus an SRV when `sampled`.
    DepthStencil { sampled: bool },
    /// Shader-writable; gets a UAV of mip 0 and an SRV.
    UnorderedAccess,
    /// Shader-read only; gets an SRV.
    Sampled,
}

impl TextureUsage {
    pub(crate) fn flags(self) -> ResourceFlags {
        ResourceFlags {
            render_target: matches!(self, TextureUsage::RenderTarget),
            depth_stencil: matches!(self, TextureUsage::DepthStencil { .. }),
            unordered_access: matches!(self, TextureUsage::UnorderedAccess),
        }
    }

    pub(crate) fn initial_state(self) -> ResourceState {
        match self {
            TextureUsage::RenderTarget => ResourceState::RenderTarget,
            TextureUsage::DepthStencil { .. } => ResourceState::DepthWrite,
            TextureUsage::UnorderedAccess | TextureUsage::Sampled => ResourceState::Common,
        }
    }

    pub(crate) fn is_dedicated(self) -> bool {
        matches!(self, TextureUsage::RenderTarget | TextureUsage::DepthStencil { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    pub usage: TextureUsage,
    pub width: u32,
    pub height: u32,
    pub format: Format,
    /// `0` requests the full chain; larger values are clamped to it.
    pub mip_levels: u32,
    /// `6` with `cube` set describes a cube map.
    pub array_size: u32,
    pub cube: bool,
    pub name: String,
}

impl TextureDesc {
    pub fn new(usage: TextureUsage, width: u32, height: u32, format: Format) -> Self {
        Self {
            usage,
            width,
            height,
            format,
            mip_levels: 1,
            array_size: 1,
            cube: false,
            name: String::new(),
        }
    }

    pub fn with_mips(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn cube_map(mut self) -> Self {
        self.array_size = 6;
        self.cube = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Mip count after clamping to the full chain.
    pub fn resolved_mip_levels(&self) -> u32 {
        let full = full_mip_chain(self.width, self.height);
        match self.mip_levels {
            0 => full,
            n => n.min(full),
        }
    }

    /// Backend description, with the mip chain resolved.
    pub fn resource_desc(&self) -> ResourceDesc {
        ResourceDesc::Texture2D {
            width: self.width,
            height: self.height,
            array_size: self.array_size.max(1),
            mip_levels: self.resolved_mip_levels(),
            format: self.format,
            flags: self.usage.flags(),
        }
    }
}

#[derive(Debug)]
pub struct Texture {
    pub allocation: Allocation,
    /// Description with `mip_levels` resolved.
    pub desc: TextureDesc,
    pub srv_index: u32,
    pub uav_index: u32,
    pub rtv_index: u32,
    pub dsv_index: u32,
}

impl Texture {
    pub fn resource(&self) -> ResourceId {
        self.allocation.resource
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn mip_levels(&self) -> u32 {
        self.desc.mip_levels
    }

    pub fn format(&self) -> Format {
        self.desc.format
    }

    pub fn usage(&self) -> TextureUsage {
        self.desc.usage
    }

    pub fn resource_desc(&self) -> ResourceDesc {
        self.desc.resource_desc()
    }

    pub fn mip_size(&self, mip: u32) -> (u32, u32) {
        (mip_extent(self.desc.width, mip), mip_extent(self.desc.height, mip))
    }
}

#[derive(Debug, Clone)]
pub struct Sampler {
    pub sampler_index: u32,
    pub desc: SamplerDesc,
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── usage rules ───────────────────────────────────────────────────────

    #[test]
    fn cpu_written_buffers_live_in_upload_memory() {
        assert_eq!(BufferUsage::ConstantBuffer.memory_class(), MemoryClass::Upload);
        assert_eq!(BufferUsage::UploadBuffer.initial_state(), ResourceState::GenericRead);
        assert_eq!(BufferUsage::IndexBuffer.memory_class(), MemoryClass::Default);
        assert_eq!(BufferUsage::StructuredBuffer.initial_state(), ResourceState::Common);
    }

    #[test]
    fn constant_buffers_round_up_to_view_alignment() {
        assert_eq!(BufferUsage::ConstantBuffer.allocation_size(4), 256);
        assert_eq!(BufferUsage::ConstantBuffer.allocation_size(257), 512);
        assert_eq!(BufferUsage::IndexBuffer.allocation_size(6), 6);
    }

    #[test]
    fn target_textures_start_in_their_target_state() {
        assert_eq!(TextureUsage::RenderTarget.initial_state(), ResourceState::RenderTarget);
        assert_eq!(
            TextureUsage::DepthStencil { sampled: false }.initial_state(),
            ResourceState::DepthWrite
        );
        assert!(TextureUsage::RenderTarget.is_dedicated());
        assert!(!TextureUsage::Sampled.is_dedicated());
    }

    // ── mip clamping ──────────────────────────────────────────────────────

    #[test]
    fn mip_levels_clamp_to_full_chain() {
        let desc = TextureDesc::new(TextureUsage::Sampled, 64, 16, Format::Rgba8Unorm);
        assert_eq!(desc.clone().with_mips(0).resolved_mip_levels(), 7);
        assert_eq!(desc.clone().with_mips(20).resolved_mip_levels(), 7);
        assert_eq!(desc.with_mips(3).resolved_mip_levels(), 3);
    }
}
