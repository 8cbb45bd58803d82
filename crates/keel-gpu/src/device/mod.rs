//! The device: queues, allocator, descriptor tables, swapchain and the
//! frame-in-flight protocol that ties them together.
//!
//! One render thread drives the frame:
//!
//! ```text
//! begin_frame -> record into graphics_context() -> submit_graphics_context
//!             -> present -> end_frame
//! ```
//!
//! `end_frame` is the backpressure point: it blocks until the frame recorded
//! `FRAMES_IN_FLIGHT` frames earlier has finished on the GPU.
//!
//! Resource creation (`create_*`) takes `&self` and may run on loader
//! threads concurrently with each other.

mod factory;

use std::sync::Arc;

use anyhow::Context as _;
use parking_lot::{Mutex, MutexGuard};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::allocator::Allocator;
use crate::config::{BackendChoice, DeviceInit, FRAMES_IN_FLIGHT};
use crate::context::{ComputeContext, GraphicsContext, RecordingContext};
use crate::descriptor::DescriptorTables;
use crate::error::OrFatal;
use crate::hal::soft::{SoftBackend, SoftConfig};
use crate::hal::vulkan::{self, VulkanBackend, VulkanConfig};
use crate::hal::{Backend, Format, HeadlessTarget, PresentTarget, QueueKind};
use crate::present::WindowPresenter;
use crate::queue::SubmissionQueue;
use crate::resource::Texture;
use crate::swapchain::Swapchain;

pub struct Device {
    label: String,
    backend: Arc<dyn Backend>,
    graphics_queue: Arc<SubmissionQueue>,
    compute_queue: Arc<SubmissionQueue>,
    copy_queue: Arc<SubmissionQueue>,
    allocator: Allocator,
    tables: Arc<DescriptorTables>,
    swapchain: Swapchain,

    /// One graphics context per frame slot, reset once the slot's fence completes.
    frames: Vec<GraphicsContext>,
    /// Fence value each slot's last frame signaled in `end_frame`.
    frame_fences: [u64; FRAMES_IN_FLIGHT],
    current_frame: usize,
    frame_count: u64,

    compute: Mutex<ComputeContext>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("label", &self.label)
            .field("backend", &self.backend.name())
            .field("current_frame", &self.current_frame)
            .field("frame_fences", &self.frame_fences)
            .finish()
    }
}

impl Device {
    /// Creates a device presenting into `window`, on the backend
    /// `init.backend` selects.
    pub fn new<W>(
        window: Arc<W>,
        width: u32,
        height: u32,
        format: Format,
        init: DeviceInit,
    ) -> anyhow::Result<Self>
    where
        W: HasWindowHandle + HasDisplayHandle + Send + Sync + 'static,
    {
        let presenter = WindowPresenter::new(window, width, height, init.present.clone())
            .context("failed to create window presenter")?;
        let backend = Self::select_backend(&init)?;
        Ok(Self::with_backend(
            backend,
            Box::new(presenter),
            width,
            height,
            format,
            init,
        ))
    }

    fn select_backend(init: &DeviceInit) -> anyhow::Result<Arc<dyn Backend>> {
        let reference = || -> Arc<dyn Backend> {
            Arc::new(SoftBackend::new(SoftConfig {
                validation: init.validation,
            }))
        };
        let vulkan = || {
            VulkanBackend::new(VulkanConfig {
                validation: init.validation,
            })
        };
        Ok(match init.backend {
            BackendChoice::Reference => reference(),
            BackendChoice::Vulkan => Arc::new(vulkan().context("failed to create Vulkan device")?),
            BackendChoice::Auto if vulkan::is_available() => match vulkan() {
                Ok(backend) => Arc::new(backend),
                Err(e) => {
                    log::warn!("Vulkan device unavailable ({e}), using the reference device");
                    reference()
                }
            },
            BackendChoice::Auto => {
                log::info!("no Vulkan 1.3 driver, using the reference device");
                reference()
            }
        })
    }

    /// Creates a device whose frames are kept in memory.
    ///
    /// The returned target shares state with the device's swapchain.
    pub fn headless(width: u32, height: u32, format: Format, init: DeviceInit) -> (Self, HeadlessTarget) {
        let target = HeadlessTarget::new();
        let backend = Arc::new(SoftBackend::new(SoftConfig {
            validation: init.validation,
        }));
        let device = Self::with_backend(
            backend,
            Box::new(target.clone()),
            width,
            height,
            format,
            init,
        );
        (device, target)
    }

    pub fn with_backend(
        backend: Arc<dyn Backend>,
        target: Box<dyn PresentTarget>,
        width: u32,
        height: u32,
        format: Format,
        init: DeviceInit,
    ) -> Self {
        log::info!(
            "creating device '{}' on the {} backend ({FRAMES_IN_FLIGHT} frames in flight)",
            init.label,
            backend.name()
        );

        let queue = |kind| {
            Arc::new(SubmissionQueue::new(
                backend
                    .create_queue(kind)
                    .or_fatal(&format!("creating {kind:?} queue")),
            ))
        };
        let graphics_queue = queue(QueueKind::Graphics);
        let compute_queue = queue(QueueKind::Compute);
        let copy_queue = queue(QueueKind::Copy);

        let tables = Arc::new(
            DescriptorTables::new(&backend, &init).or_fatal("creating descriptor tables"),
        );
        let allocator = Allocator::new(Arc::clone(&backend), Arc::clone(&graphics_queue), &init);

        let swapchain = Swapchain::new(
            Arc::clone(&backend),
            Arc::clone(&graphics_queue),
            Arc::clone(&tables),
            allocator.clone(),
            target,
            width,
            height,
            format,
        );

        let frames = (0..FRAMES_IN_FLIGHT)
            .map(|_| GraphicsContext::new(Arc::clone(&graphics_queue), Arc::clone(&tables)))
            .collect();
        let compute = Mutex::new(ComputeContext::new(Arc::clone(&compute_queue), tables.layout()));

        Self {
            label: init.label,
            backend,
            graphics_queue,
            compute_queue,
            copy_queue,
            allocator,
            tables,
            swapchain,
            frames,
            frame_fences: [0; FRAMES_IN_FLIGHT],
            current_frame: 0,
            frame_count: 0,
            compute,
        }
    }

    // ── frame protocol ────────────────────────────────────────────────────

    /// Opens the current slot's graphics context for recording.
    pub fn begin_frame(&mut self) {
        let slot = self.current_frame;
        // `end_frame` already waited; this covers a caller that skipped it.
        self.graphics_queue.wait_for_value(self.frame_fences[slot]);
        self.frames[slot].reset();
        self.allocator.collect();
    }

    /// The context opened by the last `begin_frame`.
    pub fn graphics_context(&mut self) -> &mut GraphicsContext {
        &mut self.frames[self.current_frame]
    }

    /// Submits the current frame's graphics context and returns its fence value.
    pub fn submit_graphics_context(&mut self) -> u64 {
        let ctx = &mut self.frames[self.current_frame];
        self.graphics_queue.submit(&mut [ctx as &mut dyn RecordingContext])
    }

    /// Presents the current back buffer and advances to the next one.
    pub fn present(&mut self) {
        self.swapchain.present();
    }

    /// Closes the frame: signals, advances the slot, and waits for the new
    /// slot's previous frame to finish.
    pub fn end_frame(&mut self) {
        let value = self.graphics_queue.signal();
        self.allocator.seal(value);
        self.frame_fences[self.current_frame] = value;
        self.current_frame = (self.current_frame + 1) % FRAMES_IN_FLIGHT;
        self.frame_count += 1;

        let wait_for = self.frame_fences[self.current_frame];
        if !self.graphics_queue.is_complete(wait_for) {
            log::trace!("frame {}: throttled on fence value {wait_for}", self.frame_count);
        }
        self.graphics_queue.wait_for_value(wait_for);
        self.allocator.collect();
    }

    /// Resizes the swapchain. Zero-sized requests (a minimized window) are ignored.
    pub fn on_resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 || self.swapchain.size() == (width, height) {
            return;
        }
        log::info!("resizing swapchain to {width}x{height}");
        self.flush();
        self.swapchain.resize(width, height);
    }

    /// Drains every queue and releases all retired memory.
    pub fn flush(&self) {
        self.graphics_queue.flush();
        self.compute_queue.flush();
        self.copy_queue.flush();
        let released = self.allocator.release_all();
        if released > 0 {
            log::debug!("flush released {released} allocations");
        }
    }

    // ── accessors ─────────────────────────────────────────────────────────

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn current_frame_index(&self) -> usize {
        self.current_frame
    }

    /// Fence value stored for frame slot `slot` by its last `end_frame`.
    pub fn frame_fence_value(&self, slot: usize) -> u64 {
        self.frame_fences[slot]
    }

    /// Number of completed `end_frame` calls.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn back_buffer(&self) -> &Texture {
        self.swapchain.back_buffer()
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    /// The shared compute context. Reset it before recording.
    pub fn compute_context(&self) -> MutexGuard<'_, ComputeContext> {
        self.compute.lock()
    }

    pub fn graphics_queue(&self) -> &Arc<SubmissionQueue> {
        &self.graphics_queue
    }

    pub fn compute_queue(&self) -> &Arc<SubmissionQueue> {
        &self.compute_queue
    }

    pub fn copy_queue(&self) -> &Arc<SubmissionQueue> {
        &self.copy_queue
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn descriptor_tables(&self) -> &Arc<DescriptorTables> {
        &self.tables
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.flush();
        log::debug!("device '{}' shut down after {} frames", self.label, self.frame_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CopyContext;
    use crate::hal::{
        ComputePipelineDesc, ComputeProgram, GraphicsPipelineDesc, GraphicsProgram, RasterEnv,
        DrawArgs, ResourceState, SamplerDesc, ShaderEnv, TableKind, ThreadIds, read_buffer,
    };
    use crate::resource::{
        BufferDesc, BufferUsage, INVALID_INDEX, TextureDesc, TextureUsage,
    };
    use bytemuck::{Pod, Zeroable};

    fn device() -> (Device, HeadlessTarget) {
        Device::headless(8, 8, Format::Rgba8Unorm, DeviceInit::default())
    }

    fn clear_back_buffer(device: &mut Device, color: [f32; 4]) {
        let bb = device.back_buffer();
        let (resource, rtv) = (bb.resource(), bb.rtv_index);
        let tables = Arc::clone(device.descriptor_tables());
        let ctx = device.graphics_context();
        ctx.add_resource_barrier(resource, ResourceState::PRESENT, ResourceState::RenderTarget);
        ctx.execute_resource_barriers();
        let handle = tables.handle(TableKind::RenderTarget, rtv);
        ctx.clear_render_target_view(handle, color);
        ctx.add_resource_barrier(resource, ResourceState::RenderTarget, ResourceState::PRESENT);
        ctx.execute_resource_barriers();
    }

    fn run_frame(device: &mut Device, color: [f32; 4]) {
        device.begin_frame();
        clear_back_buffer(device, color);
        device.submit_graphics_context();
        device.present();
        device.end_frame();
    }

    // ── resource registration ─────────────────────────────────────────────

    #[test]
    fn render_target_gets_rtv_and_srv_only() {
        let (device, _) = device();
        let tex = device.create_texture(
            &TextureDesc::new(TextureUsage::RenderTarget, 512, 512, Format::Rgba8Unorm),
            None,
        );
        assert_ne!(tex.rtv_index, INVALID_INDEX);
        assert_ne!(tex.srv_index, INVALID_INDEX);
        assert_eq!(tex.dsv_index, INVALID_INDEX);
        assert_eq!(tex.uav_index, INVALID_INDEX);
        // Back buffers own the first render-target slots.
        assert!(tex.rtv_index >= FRAMES_IN_FLIGHT as u32);
    }

    #[test]
    fn depth_target_gets_srv_only_when_sampled() {
        let (device, _) = device();
        let plain = device.create_texture(
            &TextureDesc::new(TextureUsage::DepthStencil { sampled: false }, 32, 32, Format::D32Float),
            None,
        );
        let sampled = device.create_texture(
            &TextureDesc::new(TextureUsage::DepthStencil { sampled: true }, 32, 32, Format::D32Float),
            None,
        );
        assert_ne!(plain.dsv_index, INVALID_INDEX);
        assert_eq!(plain.srv_index, INVALID_INDEX);
        assert_ne!(sampled.srv_index, INVALID_INDEX);
        assert_eq!(sampled.rtv_index, INVALID_INDEX);
    }

    #[test]
    fn buffers_expose_only_their_view_kind() {
        let (device, _) = device();
        let index = device.create_buffer(
            &BufferDesc::new(BufferUsage::IndexBuffer, "indices"),
            &[0u16, 1, 2],
        );
        let structured = device.create_buffer(
            &BufferDesc::new(BufferUsage::StructuredBuffer, "items"),
            &[1.0f32; 4],
        );
        let constants = device.create_buffer(
            &BufferDesc::new(BufferUsage::ConstantBuffer, "constants"),
            &[7u32],
        );

        assert_eq!(
            (index.srv_index, index.uav_index, index.cbv_index),
            (INVALID_INDEX, INVALID_INDEX, INVALID_INDEX)
        );
        assert_ne!(structured.srv_index, INVALID_INDEX);
        assert_eq!(structured.cbv_index, INVALID_INDEX);
        assert_ne!(constants.cbv_index, INVALID_INDEX);
        assert_eq!(constants.allocation.size(), 256);
    }

    #[test]
    fn descriptor_indices_follow_call_order() {
        let (device, _) = device();
        let a = device.create_sampler(SamplerDesc::default());
        let b = device.create_sampler(SamplerDesc::default());
        assert_eq!(b.sampler_index, a.sampler_index + 1);
    }

    #[test]
    fn cube_maps_get_six_slices() {
        let (device, _) = device();
        let tex = device.create_texture(
            &TextureDesc::new(TextureUsage::Sampled, 4, 4, Format::Rgba8Unorm).cube_map(),
            Some(&[0u8; 4 * 4 * 4 * 6]),
        );
        assert_eq!(tex.desc.array_size, 6);
        assert_ne!(tex.srv_index, INVALID_INDEX);
    }

    // ── uploads ───────────────────────────────────────────────────────────

    #[test]
    fn gpu_local_buffers_are_filled_through_the_copy_queue() {
        let (device, _) = device();
        let data: Vec<u32> = (0..64).collect();
        let buffer = device.create_buffer(
            &BufferDesc::new(BufferUsage::StructuredBuffer, "data"),
            &data,
        );
        let readback = device.create_buffer::<u32>(
            &BufferDesc::new(BufferUsage::ReadbackBuffer, "readback").with_capacity(64),
            &[],
        );

        let mut ctx = CopyContext::new(Arc::clone(device.copy_queue()));
        ctx.reset();
        ctx.copy_buffer(buffer.resource(), 0, readback.resource(), 0, 256);
        let value = device.copy_queue().submit(&mut [&mut ctx as &mut dyn RecordingContext]);
        device.copy_queue().wait_for_value(value);

        let mut out = vec![0u8; 256];
        readback.read_bytes(0, &mut out);
        assert_eq!(bytemuck::cast_slice::<u8, u32>(&out), data.as_slice());
    }

    #[test]
    fn target_uploads_stay_legal_for_their_queue() {
        let backend = Arc::new(SoftBackend::new(SoftConfig { validation: true }));
        let device = Device::with_backend(
            Arc::clone(&backend) as Arc<dyn Backend>,
            Box::new(HeadlessTarget::new()),
            8,
            8,
            Format::Rgba8Unorm,
            DeviceInit {
                validation: true,
                ..DeviceInit::default()
            },
        );

        let pixels: Vec<u8> = (0..4 * 4 * 4).map(|i| i as u8).collect();
        let target = device.create_texture(
            &TextureDesc::new(TextureUsage::RenderTarget, 4, 4, Format::Rgba8Unorm),
            Some(&pixels),
        );
        assert_eq!(device.read_texture(&target, 0, 0), pixels);

        let depth = device.create_texture(
            &TextureDesc::new(
                TextureUsage::DepthStencil { sampled: true },
                4,
                4,
                Format::D32Float,
            ),
            Some(&bytemuck::cast_slice::<f32, u8>(&[0.5f32; 16]).to_vec()),
        );
        assert_eq!(device.read_texture(&depth, 0, 0).len(), 64);

        device.flush();
        let stats = backend.stats();
        assert_eq!(stats.queue_state_errors, 0);
        assert_eq!(stats.validation_errors, 0);
    }

    #[test]
    fn texture_pixels_round_trip() {
        let (device, _) = device();
        let pixels: Vec<u8> = (0..16 * 16 * 4).map(|i| (i % 251) as u8).collect();
        let tex = device.create_texture(
            &TextureDesc::new(TextureUsage::Sampled, 16, 16, Format::Rgba8Unorm),
            Some(&pixels),
        );
        assert_eq!(device.read_texture(&tex, 0, 0), pixels);
    }

    #[test]
    fn staging_memory_is_not_left_pending() {
        let (device, _) = device();
        let _tex = device.create_texture(
            &TextureDesc::new(TextureUsage::Sampled, 8, 8, Format::Rgba8Unorm),
            Some(&[1u8; 8 * 8 * 4]),
        );
        assert_eq!(device.allocator().pending_release_count(), 0);
    }

    #[test]
    fn parallel_creation_yields_unique_indices() {
        let (device, _) = device();
        let indices: Vec<u32> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let device = &device;
                    s.spawn(move || {
                        let tex = device.create_texture(
                            &TextureDesc::new(TextureUsage::Sampled, 8, 8, Format::Rgba8Unorm)
                                .named(format!("tex {i}")),
                            Some(&[i as u8; 8 * 8 * 4]),
                        );
                        tex.srv_index
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), indices.len());
    }

    // ── null-index safety ─────────────────────────────────────────────────

    #[repr(C)]
    #[derive(Debug, Copy, Clone, Pod, Zeroable)]
    struct Indices {
        source: u32,
        target: u32,
    }

    /// Copies texel (0, 0) from `source` into `target`.
    #[derive(Debug)]
    struct CopyTexel;

    impl ComputeProgram for CopyTexel {
        fn thread_group_size(&self) -> [u32; 3] {
            [1, 1, 1]
        }

        fn execute(&self, env: &mut dyn ShaderEnv, _ids: ThreadIds) {
            let (source, target) = (env.constant(0), env.constant(1));
            let texel = env.load(source, 0, 0, 0);
            env.store(target, 0, 0, texel);
        }
    }

    #[test]
    fn invalid_indices_in_constants_do_not_fault() {
        let (device, _) = device();
        let pipeline = device.create_pipeline_state(ComputePipelineDesc {
            name: "copy texel".into(),
            program: Arc::new(CopyTexel),
        });

        let mut ctx = device.compute_context();
        ctx.reset();
        ctx.set_pipeline_state(&pipeline);
        ctx.set_32bit_constants(&Indices {
            source: INVALID_INDEX,
            target: INVALID_INDEX,
        });
        ctx.dispatch(1, 1, 1);
        let value = device.compute_queue().submit(&mut [&mut *ctx as &mut dyn RecordingContext]);
        device.compute_queue().wait_for_value(value);
        assert!(device.compute_queue().is_complete(value));
    }

    // ── drawing ───────────────────────────────────────────────────────────

    /// Fills every pixel of target 0 with the color stored in a constant buffer.
    #[derive(Debug)]
    struct Fill;

    impl GraphicsProgram for Fill {
        fn draw(&self, env: &mut dyn RasterEnv, _args: &DrawArgs) {
            let color: [f32; 4] = read_buffer(&*env, env.constant(0), 0).unwrap_or([0.0; 4]);
            let vp = env.viewport();
            for y in 0..vp.height as u32 {
                for x in 0..vp.width as u32 {
                    env.write_color(0, x, y, color);
                }
            }
        }
    }

    #[test]
    fn draw_reads_constant_buffer_through_bindless_index() {
        let (mut device, target) = device();
        let color = device.create_buffer(
            &BufferDesc::new(BufferUsage::ConstantBuffer, "color"),
            &[[0.0f32, 0.0, 1.0, 1.0]],
        );
        let pipeline = device.create_pipeline_state(GraphicsPipelineDesc {
            name: "fill".into(),
            program: Arc::new(Fill),
            render_target_formats: vec![Format::Rgba8Unorm],
            depth: None,
        });

        device.begin_frame();
        let bb = device.back_buffer();
        let resource = bb.resource();
        let (w, h) = (bb.width(), bb.height());
        let rtv = device.descriptor_tables().handle(TableKind::RenderTarget, bb.rtv_index);
        let ctx = device.graphics_context();
        ctx.add_resource_barrier(resource, ResourceState::PRESENT, ResourceState::RenderTarget);
        ctx.execute_resource_barriers();
        ctx.set_render_target_views(&[rtv], None);
        ctx.set_viewport(crate::hal::Viewport::full(w, h));
        ctx.set_pipeline_state(&pipeline);
        ctx.set_32bit_constants(&color.cbv_index);
        ctx.draw(3);
        ctx.add_resource_barrier(resource, ResourceState::RenderTarget, ResourceState::PRESENT);
        ctx.execute_resource_barriers();
        device.submit_graphics_context();
        device.present();
        device.end_frame();
        device.flush();

        let frame = target.last_frame().unwrap();
        assert!(frame.pixels.chunks(4).all(|p| p == [0, 0, 255, 255]));
    }

    // ── frame protocol ────────────────────────────────────────────────────

    #[test]
    fn frames_cycle_through_slots() {
        let (mut device, target) = device();
        for i in 0..5 {
            assert_eq!(device.current_frame_index(), i % FRAMES_IN_FLIGHT);
            run_frame(&mut device, [1.0, 0.0, 0.0, 1.0]);
        }
        device.flush();

        assert_eq!(device.frame_count(), 5);
        assert_eq!(target.presented_count(), 5);
        let frame = target.last_frame().unwrap();
        assert_eq!(&frame.pixels[..4], &[255, 0, 0, 255]);
    }

    #[test]
    fn each_slot_stores_its_end_of_frame_fence() {
        let (mut device, _) = device();
        for _ in 0..3 {
            run_frame(&mut device, [0.0; 4]);
        }
        // One signal for the submission, one for the end of the frame.
        let fences: Vec<u64> = (0..FRAMES_IN_FLIGHT).map(|s| device.frame_fence_value(s)).collect();
        assert_eq!(fences, vec![2, 4, 6]);
    }

    #[test]
    fn back_buffers_rotate_on_present() {
        let (mut device, _) = device();
        let first = device.swapchain().current_back_buffer_index();
        run_frame(&mut device, [0.0; 4]);
        assert_eq!(device.swapchain().current_back_buffer_index(), (first + 1) % FRAMES_IN_FLIGHT);
    }

    #[test]
    fn dropped_resources_are_released_after_their_frame() {
        let (mut device, _) = device();
        let buffer = device.create_buffer(
            &BufferDesc::new(BufferUsage::UploadBuffer, "transient"),
            &[0u8; 64],
        );
        device.begin_frame();
        drop(buffer);
        assert_eq!(device.allocator().pending_release_count(), 1);
        device.submit_graphics_context();
        device.end_frame();
        device.graphics_queue().flush();
        device.begin_frame();
        assert_eq!(device.allocator().pending_release_count(), 0);
    }

    // ── resize ────────────────────────────────────────────────────────────

    #[test]
    fn resize_keeps_back_buffer_slots() {
        let (mut device, target) = device();
        let before: Vec<u32> = device.swapchain().back_buffers().iter().map(|t| t.rtv_index).collect();
        device.on_resize(20, 10);
        let after: Vec<u32> = device.swapchain().back_buffers().iter().map(|t| t.rtv_index).collect();

        assert_eq!(before, vec![0, 1, 2]);
        assert_eq!(before, after);
        assert_eq!(device.swapchain().size(), (20, 10));
        assert_eq!(target.size(), (20, 10));
        run_frame(&mut device, [0.0, 1.0, 0.0, 1.0]);
        device.flush();
        assert_eq!(target.last_frame().unwrap().width, 20);
    }

    #[test]
    fn zero_sized_resize_is_ignored() {
        let (mut device, _) = device();
        device.on_resize(0, 600);
        assert_eq!(device.swapchain().size(), (8, 8));
    }

    #[test]
    fn resize_texture_rewrites_views_in_place() {
        let (device, _) = device();
        let mut tex = device.create_texture(
            &TextureDesc::new(TextureUsage::RenderTarget, 8, 8, Format::Rgba32Float),
            None,
        );
        let (rtv, srv) = (tex.rtv_index, tex.srv_index);
        let old = tex.resource();

        device.resize_texture(&mut tex, 32, 16);
        assert_eq!((tex.rtv_index, tex.srv_index), (rtv, srv));
        assert_ne!(tex.resource(), old);
        assert_eq!((tex.width(), tex.height()), (32, 16));
    }
}
