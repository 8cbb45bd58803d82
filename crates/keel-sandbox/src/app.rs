use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use keel_gpu::context::RecordingContext;
use keel_gpu::hal::{Format, ResourceState, SamplerDesc, TableKind, Viewport};
use keel_gpu::loader::{TextureRequest, UploadPool};
use keel_gpu::mipmap::MipMapGenerator;
use keel_gpu::pipeline::{GraphicsPipelineDesc, PipelineState};
use keel_gpu::{Device, DeviceInit, Sampler, Texture, TextureDesc, TextureUsage};
use winit::application::ApplicationHandler;
use winit::dpi::{LogicalSize, PhysicalSize};
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow};
use winit::window::{Window, WindowId};

use crate::programs::{
    SceneConstants, ScenePass, TonemapConstants, TonemapPass, checkerboard,
};

const BACK_BUFFER_FORMAT: Format = Format::Rgba8UnormSrgb;
const HDR_FORMAT: Format = Format::Rgba32Float;
const CHECKER_SIZE: u32 = 256;

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub title: String,
    pub initial_size: LogicalSize<f64>,
    pub device: DeviceInit,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            title: "keel sandbox".to_string(),
            initial_size: LogicalSize::new(640.0, 360.0),
            device: DeviceInit::default(),
        }
    }
}

/// Everything that lives as long as the window.
struct Scene {
    // Dropped first: the device flushes its queues before the window goes away.
    device: Device,
    window: Arc<Window>,
    hdr: Texture,
    checker: Texture,
    sampler: Sampler,
    scene_pass: PipelineState,
    tonemap_pass: PipelineState,
    started: Instant,
}

impl Scene {
    fn new(event_loop: &ActiveEventLoop, config: &SandboxConfig) -> Result<Self> {
        let attrs = Window::default_attributes()
            .with_title(config.title.clone())
            .with_inner_size(config.initial_size);
        let window = Arc::new(
            event_loop
                .create_window(attrs)
                .context("failed to create window")?,
        );

        let PhysicalSize { width, height } = window.inner_size();
        let (width, height) = (width.max(1), height.max(1));
        let device = Device::new(
            Arc::clone(&window),
            width,
            height,
            BACK_BUFFER_FORMAT,
            config.device.clone(),
        )
        .context("failed to create device")?;

        let scene_pass = device.create_pipeline_state(GraphicsPipelineDesc {
            name: "scene".into(),
            program: Arc::new(ScenePass),
            render_target_formats: vec![HDR_FORMAT],
            depth: None,
        });
        let tonemap_pass = device.create_pipeline_state(GraphicsPipelineDesc {
            name: "tonemap".into(),
            program: Arc::new(TonemapPass),
            render_target_formats: vec![BACK_BUFFER_FORMAT],
            depth: None,
        });

        let hdr = device.create_texture(
            &TextureDesc::new(TextureUsage::RenderTarget, width, height, HDR_FORMAT)
                .named("hdr target"),
            None,
        );

        let pool = UploadPool::from_init(&config.device)?;
        let mips = MipMapGenerator::new(&device);
        let request = TextureRequest::new(
            TextureDesc::new(
                TextureUsage::Sampled,
                CHECKER_SIZE,
                CHECKER_SIZE,
                Format::Rgba8UnormSrgb,
            )
            .named("checkerboard"),
            checkerboard(CHECKER_SIZE, 16),
        )
        .with_generated_mips();
        let checker = pool
            .load_textures(&device, vec![request], Some(&mips))
            .pop()
            .context("upload pool returned no texture")?;
        let sampler = device.create_sampler(SamplerDesc::default());

        log::info!(
            "sandbox ready: {width}x{height}, checkerboard has {} mips",
            checker.mip_levels()
        );

        Ok(Self {
            device,
            window,
            hdr,
            checker,
            sampler,
            scene_pass,
            tonemap_pass,
            started: Instant::now(),
        })
    }

    fn resize(&mut self, size: PhysicalSize<u32>) {
        if size.width == 0 || size.height == 0 {
            return;
        }
        self.device.on_resize(size.width, size.height);
        self.device
            .resize_texture(&mut self.hdr, size.width, size.height);
    }

    fn render(&mut self) {
        let time = self.started.elapsed().as_secs_f32();
        let scene = SceneConstants {
            checker_srv: self.checker.srv_index,
            sampler: self.sampler.sampler_index,
            time,
            width: self.hdr.width() as f32,
            height: self.hdr.height() as f32,
        };
        let tonemap = TonemapConstants {
            hdr_srv: self.hdr.srv_index,
            exposure: 1.0,
        };

        self.device.begin_frame();

        let back_buffer = self.device.back_buffer();
        let (bb_resource, bb_rtv) = (back_buffer.resource(), back_buffer.rtv_index);
        let (width, height) = (back_buffer.width(), back_buffer.height());
        let bb_view = self
            .device
            .descriptor_tables()
            .handle(TableKind::RenderTarget, bb_rtv);
        let hdr = &self.hdr;

        let ctx = self.device.graphics_context();
        ctx.set_render_target(hdr, None);
        ctx.set_viewport(Viewport::full(hdr.width(), hdr.height()));
        ctx.set_pipeline_state(&self.scene_pass);
        ctx.set_32bit_constants(&scene);
        ctx.draw(3);

        ctx.add_resource_barrier(
            hdr.resource(),
            ResourceState::RenderTarget,
            ResourceState::PixelShaderResource,
        );
        ctx.add_resource_barrier(bb_resource, ResourceState::PRESENT, ResourceState::RenderTarget);
        ctx.execute_resource_barriers();

        ctx.set_render_target_views(&[bb_view], None);
        ctx.set_viewport(Viewport::full(width, height));
        ctx.set_pipeline_state(&self.tonemap_pass);
        ctx.set_32bit_constants(&tonemap);
        ctx.draw(3);

        ctx.add_resource_barrier(bb_resource, ResourceState::RenderTarget, ResourceState::PRESENT);
        ctx.add_resource_barrier(
            hdr.resource(),
            ResourceState::PixelShaderResource,
            ResourceState::RenderTarget,
        );
        ctx.execute_resource_barriers();

        self.device.submit_graphics_context();
        self.device.present();
        self.device.end_frame();
    }
}

pub struct SandboxApp {
    config: SandboxConfig,
    scene: Option<Scene>,
    exit_requested: bool,
}

impl SandboxApp {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            scene: None,
            exit_requested: false,
        }
    }

    fn request_exit(&mut self, event_loop: &ActiveEventLoop) {
        self.exit_requested = true;
        event_loop.exit();
    }
}

impl ApplicationHandler for SandboxApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.scene.is_some() {
            return;
        }

        match Scene::new(event_loop, &self.config) {
            Ok(scene) => {
                scene.window.request_redraw();
                self.scene = Some(scene);
            }
            Err(e) => {
                log::error!("failed to create sandbox: {e:#}");
                self.request_exit(event_loop);
            }
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exit_requested {
            event_loop.exit();
            return;
        }

        event_loop.set_control_flow(ControlFlow::Wait);

        // Continuous redraw; the scene animates.
        if let Some(scene) = &self.scene {
            scene.window.request_redraw();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        let Some(scene) = self.scene.as_mut() else {
            return;
        };
        if scene.window.id() != window_id {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                log::info!(
                    "closing after {} frames",
                    scene.device.frame_count()
                );
                self.scene = None;
                self.request_exit(event_loop);
            }
            WindowEvent::Resized(size) => {
                scene.resize(size);
                scene.window.request_redraw();
            }
            WindowEvent::ScaleFactorChanged { .. } => {
                let size = scene.window.inner_size();
                scene.resize(size);
                scene.window.request_redraw();
            }
            WindowEvent::RedrawRequested => scene.render(),
            _ => {}
        }
    }
}
