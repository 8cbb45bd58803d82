use super::Format;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
        pub struct $name(pub u64);
    };
}

id_type!(
    /// Backend handle of a buffer or texture.
    ResourceId
);
id_type!(
    /// Backend handle of a memory heap.
    HeapId
);
id_type!(
    /// Backend handle of a compiled pipeline.
    PipelineId
);
id_type!(
    /// Backend handle of a descriptor table.
    TableId
);
id_type!(
    /// Backend handle of a swapchain.
    SwapchainId
);

pub const BUFFER_PLACEMENT_ALIGNMENT: u64 = 256;
pub const TEXTURE_PLACEMENT_ALIGNMENT: u64 = 64 * 1024;

/// Residency class of a heap.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MemoryClass {
    /// CPU-writable, GPU-readable.
    Upload,
    /// GPU-local.
    Default,
    /// GPU-writable, CPU-readable.
    Readback,
}

impl MemoryClass {
    pub const fn is_cpu_visible(self) -> bool {
        !matches!(self, MemoryClass::Default)
    }
}

/// Usage state of a resource on the GPU timeline.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ResourceState {
    Common,
    GenericRead,
    CopySource,
    CopyDest,
    RenderTarget,
    DepthWrite,
    DepthRead,
    PixelShaderResource,
    NonPixelShaderResource,
    AllShaderResource,
    UnorderedAccess,
    IndexBuffer,
    ConstantBuffer,
}

impl ResourceState {
    /// Presentation shares its encoding with `Common`.
    pub const PRESENT: ResourceState = ResourceState::Common;
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct ResourceFlags {
    pub render_target: bool,
    pub depth_stencil: bool,
    pub unordered_access: bool,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ResourceDesc {
    Buffer {
        size: u64,
    },
    Texture2D {
        width: u32,
        height: u32,
        array_size: u32,
        mip_levels: u32,
        format: Format,
        flags: ResourceFlags,
    },
}

/// Placement of one subresource inside a texture's linear memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Footprint {
    pub offset: u64,
    pub row_pitch: u64,
    pub width: u32,
    pub height: u32,
    pub size: u64,
}

/// Number of levels in a full chain for the given extent.
pub fn full_mip_chain(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

pub fn mip_extent(extent: u32, mip: u32) -> u32 {
    (extent >> mip).max(1)
}

impl ResourceDesc {
    pub fn buffer(size: u64) -> Self {
        ResourceDesc::Buffer { size }
    }

    pub fn format(&self) -> Option<Format> {
        match self {
            ResourceDesc::Buffer { .. } => None,
            ResourceDesc::Texture2D { format, .. } => Some(*format),
        }
    }

    pub fn subresource_count(&self) -> u32 {
        match self {
            ResourceDesc::Buffer { .. } => 1,
            ResourceDesc::Texture2D {
                array_size,
                mip_levels,
                ..
            } => array_size * mip_levels,
        }
    }

    /// Subresources are ordered mip-major within each array slice.
    pub fn subresource_index(&self, mip: u32, slice: u32) -> u32 {
        match self {
            ResourceDesc::Buffer { .. } => 0,
            ResourceDesc::Texture2D { mip_levels, .. } => mip + slice * mip_levels,
        }
    }

    pub fn footprint(&self, subresource: u32) -> Footprint {
        match *self {
            ResourceDesc::Buffer { size } => Footprint {
                offset: 0,
                row_pitch: size,
                width: size as u32,
                height: 1,
                size,
            },
            ResourceDesc::Texture2D {
                width,
                height,
                mip_levels,
                format,
                ..
            } => {
                let texel = format.bytes_per_texel() as u64;
                let slice = subresource / mip_levels;
                let mip = subresource % mip_levels;

                let slice_size: u64 = (0..mip_levels)
                    .map(|m| {
                        mip_extent(width, m) as u64 * mip_extent(height, m) as u64 * texel
                    })
                    .sum();
                let within: u64 = (0..mip)
                    .map(|m| {
                        mip_extent(width, m) as u64 * mip_extent(height, m) as u64 * texel
                    })
                    .sum();

                let w = mip_extent(width, mip);
                let h = mip_extent(height, mip);
                Footprint {
                    offset: slice as u64 * slice_size + within,
                    row_pitch: w as u64 * texel,
                    width: w,
                    height: h,
                    size: w as u64 * h as u64 * texel,
                }
            }
        }
    }

    /// Required offset alignment when placed inside a heap.
    pub fn placement_alignment(&self) -> u64 {
        match self {
            ResourceDesc::Buffer { .. } => BUFFER_PLACEMENT_ALIGNMENT,
            ResourceDesc::Texture2D { .. } => TEXTURE_PLACEMENT_ALIGNMENT,
        }
    }

    pub fn allocation_size(&self) -> u64 {
        match self {
            ResourceDesc::Buffer { size } => *size,
            ResourceDesc::Texture2D { .. } => {
                let last = self.subresource_count() - 1;
                let fp = self.footprint(last);
                fp.offset + fp.size
            }
        }
    }
}

/// Descriptor table category.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TableKind {
    /// Shader-visible constant buffer, shader resource and storage views.
    Resource,
    RenderTarget,
    DepthStencil,
    /// Shader-visible samplers.
    Sampler,
}

impl TableKind {
    pub const fn is_shader_visible(self) -> bool {
        matches!(self, TableKind::Resource | TableKind::Sampler)
    }
}

/// CPU-side address of a descriptor slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct CpuHandle {
    pub ptr: u64,
}

impl CpuHandle {
    pub const fn offset(self, bytes: u64) -> Self {
        CpuHandle {
            ptr: self.ptr + bytes,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Filter {
    Point,
    Linear,
    Anisotropic,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AddressMode {
    Wrap,
    Mirror,
    Clamp,
    Border,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CompareFunc {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

impl CompareFunc {
    pub fn passes(self, incoming: f32, stored: f32) -> bool {
        match self {
            CompareFunc::Never => false,
            CompareFunc::Less => incoming < stored,
            CompareFunc::Equal => incoming == stored,
            CompareFunc::LessEqual => incoming <= stored,
            CompareFunc::Greater => incoming > stored,
            CompareFunc::NotEqual => incoming != stored,
            CompareFunc::GreaterEqual => incoming >= stored,
            CompareFunc::Always => true,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SamplerDesc {
    pub filter: Filter,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub mip_lod_bias: f32,
    pub max_anisotropy: u32,
    pub comparison: Option<CompareFunc>,
    pub border_color: [f32; 4],
    pub min_lod: f32,
    pub max_lod: f32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: Filter::Linear,
            address_u: AddressMode::Wrap,
            address_v: AddressMode::Wrap,
            address_w: AddressMode::Wrap,
            mip_lod_bias: 0.0,
            max_anisotropy: 1,
            comparison: None,
            border_color: [0.0; 4],
            min_lod: 0.0,
            max_lod: f32::MAX,
        }
    }
}

/// What a descriptor slot describes.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewDesc {
    ConstantBuffer {
        resource: ResourceId,
        offset: u64,
        size: u64,
    },
    StructuredBuffer {
        resource: ResourceId,
        first_element: u64,
        num_elements: u32,
        stride: u32,
    },
    Texture {
        resource: ResourceId,
        format: Format,
        most_detailed_mip: u32,
        mip_levels: u32,
        first_slice: u32,
        array_size: u32,
        cube: bool,
    },
    StorageTexture {
        resource: ResourceId,
        format: Format,
        mip_slice: u32,
        slice: u32,
    },
    RenderTarget {
        resource: ResourceId,
        format: Format,
        mip_slice: u32,
    },
    DepthStencil {
        resource: ResourceId,
        format: Format,
    },
    Sampler(SamplerDesc),
}

impl ViewDesc {
    /// Table a view of this kind must be written into.
    pub fn table_kind(&self) -> TableKind {
        match self {
            ViewDesc::ConstantBuffer { .. }
            | ViewDesc::StructuredBuffer { .. }
            | ViewDesc::Texture { .. }
            | ViewDesc::StorageTexture { .. } => TableKind::Resource,
            ViewDesc::RenderTarget { .. } => TableKind::RenderTarget,
            ViewDesc::DepthStencil { .. } => TableKind::DepthStencil,
            ViewDesc::Sampler(_) => TableKind::Sampler,
        }
    }

    pub fn resource(&self) -> Option<ResourceId> {
        match self {
            ViewDesc::ConstantBuffer { resource, .. }
            | ViewDesc::StructuredBuffer { resource, .. }
            | ViewDesc::Texture { resource, .. }
            | ViewDesc::StorageTexture { resource, .. }
            | ViewDesc::RenderTarget { resource, .. }
            | ViewDesc::DepthStencil { resource, .. } => Some(*resource),
            ViewDesc::Sampler(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tex(width: u32, height: u32, array_size: u32, mip_levels: u32) -> ResourceDesc {
        ResourceDesc::Texture2D {
            width,
            height,
            array_size,
            mip_levels,
            format: Format::Rgba8Unorm,
            flags: ResourceFlags::default(),
        }
    }

    // ── mip chain ─────────────────────────────────────────────────────────

    #[test]
    fn full_chain_counts_levels_down_to_one() {
        assert_eq!(full_mip_chain(512, 512), 10);
        assert_eq!(full_mip_chain(1, 1), 1);
        assert_eq!(full_mip_chain(640, 360), 10);
        assert_eq!(full_mip_chain(3, 1), 2);
    }

    // ── footprints ────────────────────────────────────────────────────────

    #[test]
    fn footprints_pack_mips_then_slices() {
        let desc = tex(4, 4, 2, 3);
        assert_eq!(desc.footprint(0).offset, 0);
        assert_eq!(desc.footprint(1).offset, 64);
        assert_eq!(desc.footprint(2).offset, 80);
        // second slice starts after 64 + 16 + 4 bytes
        assert_eq!(desc.footprint(3).offset, 84);
        assert_eq!(desc.allocation_size(), 168);
    }

    #[test]
    fn footprint_row_pitch_is_tight() {
        let desc = tex(5, 3, 1, 2);
        let fp = desc.footprint(1);
        assert_eq!((fp.width, fp.height), (2, 1));
        assert_eq!(fp.row_pitch, 8);
    }

    #[test]
    fn view_routes_to_table() {
        let v = ViewDesc::DepthStencil {
            resource: ResourceId(1),
            format: Format::D32Float,
        };
        assert_eq!(v.table_kind(), TableKind::DepthStencil);
        assert_eq!(ViewDesc::Sampler(SamplerDesc::default()).table_kind(), TableKind::Sampler);
    }
}
