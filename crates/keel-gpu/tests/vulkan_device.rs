//! The device on a real Vulkan driver. Every test returns early on machines
//! without a Vulkan 1.3 implementation.

use std::sync::Arc;

use keel_gpu::context::RecordingContext;
use keel_gpu::hal::vulkan::{self, VulkanBackend, VulkanConfig};
use keel_gpu::hal::{Format, HeadlessTarget, ResourceState, TableKind};
use keel_gpu::mipmap::MipMapGenerator;
use keel_gpu::{Device, DeviceInit, TextureDesc, TextureUsage};

fn vulkan_device(width: u32, height: u32) -> Option<(Device, HeadlessTarget)> {
    if !vulkan::is_available() {
        eprintln!("no Vulkan 1.3 driver, skipping");
        return None;
    }
    let backend = match VulkanBackend::new(VulkanConfig { validation: false }) {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            eprintln!("Vulkan device unavailable ({e}), skipping");
            return None;
        }
    };
    let target = HeadlessTarget::new();
    let device = Device::with_backend(
        backend,
        Box::new(target.clone()),
        width,
        height,
        Format::Rgba8Unorm,
        DeviceInit::default(),
    );
    Some((device, target))
}

#[test]
fn texture_pixels_round_trip() {
    let Some((device, _)) = vulkan_device(4, 4) else {
        return;
    };
    let pixels: Vec<u8> = (0..8 * 8 * 4).map(|i| (i % 251) as u8).collect();
    let tex = device.create_texture(
        &TextureDesc::new(TextureUsage::Sampled, 8, 8, Format::Rgba8Unorm),
        Some(&pixels),
    );
    assert_eq!(device.read_texture(&tex, 0, 0), pixels);
}

#[test]
fn cleared_frames_reach_the_target() {
    let Some((mut device, target)) = vulkan_device(8, 8) else {
        return;
    };
    for _ in 0..4 {
        device.begin_frame();
        let bb = device.back_buffer();
        let (resource, rtv) = (bb.resource(), bb.rtv_index);
        let handle = device.descriptor_tables().handle(TableKind::RenderTarget, rtv);
        let ctx = device.graphics_context();
        ctx.add_resource_barrier(resource, ResourceState::PRESENT, ResourceState::RenderTarget);
        ctx.execute_resource_barriers();
        ctx.clear_render_target_view(handle, [0.0, 1.0, 0.0, 1.0]);
        ctx.add_resource_barrier(resource, ResourceState::RenderTarget, ResourceState::PRESENT);
        ctx.execute_resource_barriers();
        device.submit_graphics_context();
        device.present();
        device.end_frame();
    }
    // Dropping the device drains the present worker.
    drop(device);

    assert_eq!(target.presented_count(), 4);
    let frame = target.last_frame().unwrap();
    assert_eq!((frame.width, frame.height), (8, 8));
    assert_eq!(&frame.pixels[..4], &[0, 255, 0, 255]);
}

#[test]
fn mip_chain_is_generated_on_the_gpu() {
    let Some((device, _)) = vulkan_device(4, 4) else {
        return;
    };
    let mips = MipMapGenerator::new(&device);
    let tex = device.create_texture(
        &TextureDesc::new(TextureUsage::UnorderedAccess, 16, 16, Format::Rgba8Unorm).with_mips(5),
        Some(&vec![200u8; 16 * 16 * 4]),
    );
    mips.generate(&device, &tex);
    assert_eq!(device.read_texture(&tex, 2, 0), vec![200u8; 4 * 4 * 4]);
    assert_eq!(device.read_texture(&tex, 4, 0), vec![200u8; 4]);
}
