use super::{CpuHandle, PipelineId, ResourceId, ResourceState, SwapchainId, TableId};

/// Hardware queue family.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Copy,
}

impl QueueKind {
    /// Whether a barrier recorded for this queue may name `state`.
    ///
    /// Copy queues only see the copy states and `Common`; compute queues
    /// cannot touch raster-only states.
    pub fn allows(self, state: ResourceState) -> bool {
        match self {
            QueueKind::Graphics => true,
            QueueKind::Compute => !matches!(
                state,
                ResourceState::RenderTarget
                    | ResourceState::DepthWrite
                    | ResourceState::DepthRead
                    | ResourceState::PixelShaderResource
                    | ResourceState::AllShaderResource
                    | ResourceState::IndexBuffer
            ),
            QueueKind::Copy => matches!(
                state,
                ResourceState::Common | ResourceState::CopySource | ResourceState::CopyDest
            ),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ScissorRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub const fn size(self) -> u64 {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DrawArgs {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
    /// `Some` for indexed draws: `(first_index, base_vertex)`.
    pub indexed: Option<(u32, i32)>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Barrier {
    Transition {
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
    },
    /// Orders storage writes against later storage accesses.
    Uav { resource: ResourceId },
}

/// One recorded GPU command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Barriers(Vec<Barrier>),
    SetDescriptorTables {
        resource: TableId,
        sampler: TableId,
    },
    SetPipeline(PipelineId),
    SetConstants(Box<[u32]>),
    SetIndexBuffer {
        resource: ResourceId,
        size: u64,
        format: IndexFormat,
    },
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    SetRenderTargets {
        targets: Vec<CpuHandle>,
        depth: Option<CpuHandle>,
    },
    ClearRenderTarget {
        target: CpuHandle,
        color: [f32; 4],
    },
    ClearDepthStencil {
        target: CpuHandle,
        depth: f32,
        stencil: u8,
    },
    Draw(DrawArgs),
    Dispatch([u32; 3]),
    CopyBuffer {
        src: ResourceId,
        src_offset: u64,
        dst: ResourceId,
        dst_offset: u64,
        size: u64,
    },
    CopyResource {
        src: ResourceId,
        dst: ResourceId,
    },
    CopyBufferToTexture {
        src: ResourceId,
        src_offset: u64,
        dst: ResourceId,
        subresource: u32,
    },
    CopyTextureToBuffer {
        src: ResourceId,
        subresource: u32,
        dst: ResourceId,
        dst_offset: u64,
    },
    Present {
        swapchain: SwapchainId,
        buffer: u32,
    },
}

/// A closed list of commands, handed to a queue by reference count.
///
/// The recording side reclaims the storage once the queue has dropped its
/// reference.
#[derive(Debug, Clone)]
pub struct CommandBuffer {
    pub kind: QueueKind,
    pub commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn new(kind: QueueKind) -> Self {
        Self {
            kind,
            commands: Vec::new(),
        }
    }

    /// Number of individual transitions and UAV barriers recorded.
    pub fn barrier_count(&self) -> usize {
        self.commands
            .iter()
            .map(|c| match c {
                Command::Barriers(b) => b.len(),
                _ => 0,
            })
            .sum()
    }

    /// Number of barrier submission calls recorded.
    pub fn barrier_batches(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::Barriers(_)))
            .count()
    }
}
