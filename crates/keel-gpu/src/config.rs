use crate::hal::TableKind;
use crate::present::PresenterInit;

/// Number of frames the CPU may record ahead of the GPU.
pub const FRAMES_IN_FLIGHT: usize = 3;

/// Inline 32-bit constants available to every pipeline.
pub const ROOT_CONSTANT_COUNT: usize = 64;

/// Which backend a windowed [`Device`](crate::Device) runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendChoice {
    /// Vulkan when a 1.3 driver is present, otherwise the reference device.
    #[default]
    Auto,
    Vulkan,
    Reference,
}

/// Initialization parameters for a [`Device`](crate::Device).
#[derive(Debug, Clone)]
pub struct DeviceInit {
    /// Label used in log lines.
    pub label: String,

    /// Shader-visible constant-buffer, shader-resource and storage views.
    pub resource_descriptors: u32,

    /// Render-target views, including one per back buffer.
    pub render_target_descriptors: u32,

    pub depth_stencil_descriptors: u32,

    /// Shader-visible samplers.
    pub sampler_descriptors: u32,

    /// Size of each heap block the sub-allocator carves placed resources from.
    pub heap_block_size: u64,

    /// Buffers at or above this size get their own allocation.
    pub committed_threshold: u64,

    /// Worker threads of the upload pool.
    pub upload_threads: usize,

    pub backend: BackendChoice,

    /// Barrier and target-format validation on the reference device, and
    /// the Khronos layer on Vulkan.
    pub validation: bool,

    /// Window surface settings; unused by headless devices.
    pub present: PresenterInit,
}

impl DeviceInit {
    pub fn descriptor_capacity(&self, kind: TableKind) -> u32 {
        match kind {
            TableKind::Resource => self.resource_descriptors,
            TableKind::RenderTarget => self.render_target_descriptors,
            TableKind::DepthStencil => self.depth_stencil_descriptors,
            TableKind::Sampler => self.sampler_descriptors,
        }
    }
}

impl Default for DeviceInit {
    fn default() -> Self {
        Self {
            label: "keel".to_string(),
            resource_descriptors: 1000,
            render_target_descriptors: 64,
            depth_stencil_descriptors: 16,
            sampler_descriptors: 64,
            heap_block_size: 32 * 1024 * 1024,
            committed_threshold: 8 * 1024 * 1024,
            upload_threads: 4,
            backend: BackendChoice::default(),
            validation: cfg!(debug_assertions),
            present: PresenterInit::default(),
        }
    }
}
