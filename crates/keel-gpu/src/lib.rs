//! Keel rendering core.
//!
//! Bindless descriptor tables, a sub-allocating memory allocator, timeline
//! queues and per-frame recording contexts, driven by a `Device` that keeps
//! up to `FRAMES_IN_FLIGHT` frames queued on the GPU.

pub mod allocator;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod hal;
pub mod loader;
pub mod logging;
pub mod mipmap;
pub mod pipeline;
pub mod present;
pub mod queue;
pub mod resource;
pub mod swapchain;

pub use config::{BackendChoice, DeviceInit, FRAMES_IN_FLIGHT};
pub use device::Device;
pub use resource::{
    Allocation, Buffer, BufferDesc, BufferUsage, INVALID_INDEX, Sampler, Texture, TextureDesc,
    TextureUsage,
};
