//! Presentation through host-visible readback copies.
//!
//! A `Present` command copies the back buffer into that buffer's readback
//! memory. Once the graphics queue signals past the copy, the job goes to a
//! worker thread that owns the [`PresentTarget`], waits on the queue's
//! timeline semaphore and hands the pixels over.

use std::ptr::NonNull;
use std::thread::JoinHandle;

use ash::vk;
use crossbeam_channel::{Receiver, Sender};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};

use crate::hal::{
    Format, HalError, HalResult, MemoryClass, PresentFrame, PresentTarget, ResourceDesc,
    ResourceFlags, ResourceId, ResourceState, SwapchainDesc, SwapchainId,
};

use super::conversion;
use super::memory::READBACK_LOCATION;
use super::state::Shared;

/// A `Present` recorded into a command buffer that has not been signaled.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) struct PresentCopy {
    pub swapchain: SwapchainId,
    pub buffer: u32,
}

/// Host-visible copy target of one back buffer.
pub(super) struct Readback {
    pub buffer: vk::Buffer,
    allocation: Allocation,
    ptr: NonNull<u8>,
    len: u64,
}

// The mapped pointer is only dereferenced by the present worker, which is
// drained before the readback memory is freed.
unsafe impl Send for Readback {}

struct HostPtr(NonNull<u8>);

// The readback memory outlives every job: resize and teardown wait for the
// worker before freeing it.
unsafe impl Send for HostPtr {}

enum PresentMsg {
    Frame {
        semaphore: vk::Semaphore,
        value: u64,
        pixels: HostPtr,
        len: usize,
        width: u32,
        height: u32,
        format: Format,
    },
    Resize {
        width: u32,
        height: u32,
        done: Sender<()>,
    },
}

pub(super) struct VkSwapchain {
    pub desc: SwapchainDesc,
    pub back_buffers: Vec<ResourceId>,
    pub readback: Vec<Readback>,
    sender: Option<Sender<PresentMsg>>,
    worker: Option<JoinHandle<()>>,
}

impl VkSwapchain {
    /// Hands a copied frame to the worker once `value` is reached.
    pub fn queue_frame(&self, buffer: u32, semaphore: vk::Semaphore, value: u64) {
        let Some(readback) = self.readback.get(buffer as usize) else {
            log::warn!("present of unknown back buffer {buffer}");
            return;
        };
        let frame = PresentMsg::Frame {
            semaphore,
            value,
            pixels: HostPtr(readback.ptr),
            len: readback.len as usize,
            width: self.desc.width,
            height: self.desc.height,
            format: self.desc.format,
        };
        if let Some(sender) = &self.sender {
            if sender.send(frame).is_err() {
                log::error!("present worker is gone; frame dropped");
            }
        }
    }

    /// Blocks until the worker has presented everything queued so far.
    fn drain(&self, width: u32, height: u32) {
        let (done, finished) = crossbeam_channel::bounded(1);
        let Some(sender) = &self.sender else { return };
        if sender.send(PresentMsg::Resize { width, height, done }).is_ok() {
            let _ = finished.recv();
        }
    }

    fn free_readback(&mut self, device: &ash::Device, allocator: &mut Option<Allocator>) {
        for readback in self.readback.drain(..) {
            unsafe { device.destroy_buffer(readback.buffer, None) };
            if let Some(allocator) = allocator.as_mut() {
                if let Err(e) = allocator.free(readback.allocation) {
                    log::error!("freeing readback memory: {e}");
                }
            }
        }
    }

    /// Stops the worker and frees the readback memory. Back buffers are
    /// ordinary resources and go with the resource table.
    pub fn shutdown(mut self, device: &ash::Device, allocator: &mut Option<Allocator>) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("present worker panicked");
            }
        }
        self.free_readback(device, allocator);
    }
}

fn run_worker(device: ash::Device, mut target: Box<dyn PresentTarget>, jobs: Receiver<PresentMsg>) {
    for job in jobs {
        match job {
            PresentMsg::Frame {
                semaphore,
                value,
                pixels,
                len,
                width,
                height,
                format,
            } => {
                let semaphores = [semaphore];
                let values = [value];
                let wait = vk::SemaphoreWaitInfo::default()
                    .semaphores(&semaphores)
                    .values(&values);
                if let Err(e) = unsafe { device.wait_semaphores(&wait, u64::MAX) } {
                    log::error!("waiting for frame copy: {e}");
                    continue;
                }
                let pixels = unsafe { std::slice::from_raw_parts(pixels.0.as_ptr(), len) };
                let row = width as usize * format.bytes_per_texel() as usize;
                let frame = PresentFrame {
                    width,
                    height,
                    format,
                    pixels: &pixels[..(row * height as usize).min(len)],
                };
                if let Err(e) = target.present(frame) {
                    log::error!("present failed: {e}");
                }
            }
            PresentMsg::Resize {
                width,
                height,
                done,
            } => {
                target.resize(width, height);
                let _ = done.send(());
            }
        }
    }
    log::debug!("present worker stopped");
}

impl Shared {
    fn create_readback(&self, size: u64) -> HalResult<Readback> {
        let info = conversion::buffer_info(size);
        let buffer = unsafe { self.device.create_buffer(&info, None) }
            .map_err(|e| HalError::Presentation(format!("readback buffer: {e}")))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocated = match self.allocator().as_mut() {
            Some(allocator) => allocator
                .allocate(&AllocationCreateDesc {
                    name: "keel present readback",
                    requirements,
                    location: READBACK_LOCATION,
                    linear: true,
                    allocation_scheme: AllocationScheme::DedicatedBuffer(buffer),
                })
                .map_err(|e| HalError::Presentation(format!("readback memory: {e}"))),
            None => Err(HalError::Presentation("device is shutting down".into())),
        };
        let allocation = match allocated {
            Ok(a) => a,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        let ptr = allocation.mapped_ptr().map(|p| p.cast::<u8>());
        match (bound, ptr) {
            (Ok(()), Some(ptr)) => Ok(Readback {
                buffer,
                ptr,
                len: size,
                allocation,
            }),
            (bound, _) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                if let Some(allocator) = self.allocator().as_mut() {
                    let _ = allocator.free(allocation);
                }
                Err(HalError::Presentation(match bound {
                    Err(e) => format!("binding readback memory: {e}"),
                    Ok(()) => "readback memory is not host-mapped".to_string(),
                }))
            }
        }
    }

    fn create_back_buffers(&self, desc: &SwapchainDesc) -> HalResult<(Vec<ResourceId>, Vec<Readback>)> {
        let texture = ResourceDesc::Texture2D {
            width: desc.width.max(1),
            height: desc.height.max(1),
            array_size: 1,
            mip_levels: 1,
            format: desc.format,
            flags: ResourceFlags {
                render_target: true,
                ..Default::default()
            },
        };
        let mut buffers = Vec::new();
        let mut readback = Vec::new();
        for _ in 0..desc.buffer_count {
            buffers.push(self.create_committed_resource(
                MemoryClass::Default,
                &texture,
                ResourceState::PRESENT,
            )?);
            readback.push(self.create_readback(texture.allocation_size())?);
        }
        Ok((buffers, readback))
    }

    pub fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        mut target: Box<dyn PresentTarget>,
    ) -> HalResult<(SwapchainId, Vec<ResourceId>)> {
        let (back_buffers, readback) = self.create_back_buffers(desc)?;
        target.resize(desc.width, desc.height);

        let (sender, jobs) = crossbeam_channel::unbounded();
        let device = self.device.clone();
        let worker = std::thread::Builder::new()
            .name("keel-present".to_string())
            .spawn(move || run_worker(device, target, jobs))
            .map_err(|e| HalError::Presentation(format!("present thread: {e}")))?;

        let id = SwapchainId(self.next_id());
        self.swapchains.lock().insert(
            id,
            VkSwapchain {
                desc: *desc,
                back_buffers: back_buffers.clone(),
                readback,
                sender: Some(sender),
                worker: Some(worker),
            },
        );
        Ok((id, back_buffers))
    }

    /// Every queue must be drained; the worker is drained here.
    pub fn resize_swapchain(
        &self,
        swapchain: SwapchainId,
        width: u32,
        height: u32,
    ) -> HalResult<Vec<ResourceId>> {
        let mut chains = self.swapchains.lock();
        let chain = chains
            .get_mut(&swapchain)
            .ok_or_else(|| HalError::Presentation(format!("unknown {swapchain:?}")))?;
        chain.drain(width, height);

        chain.free_readback(&self.device, &mut self.allocator());
        for resource in std::mem::take(&mut chain.back_buffers) {
            self.destroy_resource(resource);
        }

        chain.desc.width = width;
        chain.desc.height = height;
        let (back_buffers, readback) = self.create_back_buffers(&chain.desc)?;
        chain.back_buffers = back_buffers.clone();
        chain.readback = readback;
        Ok(back_buffers)
    }

    /// Back buffer image and readback buffer of a recorded `Present`.
    pub fn present_source(&self, copy: PresentCopy) -> Option<(ResourceId, vk::Buffer, u32, u32)> {
        let chains = self.swapchains.lock();
        let chain = chains.get(&copy.swapchain)?;
        let i = copy.buffer as usize;
        Some((
            *chain.back_buffers.get(i)?,
            chain.readback.get(i)?.buffer,
            chain.desc.width,
            chain.desc.height,
        ))
    }
}
