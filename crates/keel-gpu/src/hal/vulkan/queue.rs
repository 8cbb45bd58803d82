use std::collections::VecDeque;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::hal::{CommandBuffer, HalError, HalResult, Queue, QueueKind};

use super::present::PresentCopy;
use super::record::{Recorder, full_range};
use super::state::Shared;

/// Command buffers of one queue and the values that release them.
struct Pool {
    pool: vk::CommandPool,
    free: Vec<vk::CommandBuffer>,
    /// Submitted after the last signal.
    unsignaled: Vec<vk::CommandBuffer>,
    retired: VecDeque<(u64, Vec<vk::CommandBuffer>)>,
    presents: Vec<PresentCopy>,
    last_signaled: u64,
}

/// One queue kind of the device interface.
///
/// All kinds submit to the same hardware queue; each owns a timeline
/// semaphore and a command pool.
pub struct VulkanQueue {
    kind: QueueKind,
    shared: Arc<Shared>,
    semaphore: vk::Semaphore,
    pool: Mutex<Pool>,
}

impl std::fmt::Debug for VulkanQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanQueue")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl VulkanQueue {
    pub(super) fn new(kind: QueueKind, shared: Arc<Shared>) -> HalResult<Self> {
        let device = &shared.device;
        let mut timeline = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore = unsafe {
            device.create_semaphore(&vk::SemaphoreCreateInfo::default().push_next(&mut timeline), None)
        }
        .map_err(|e| HalError::DeviceCreation(format!("timeline semaphore: {e}")))?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(shared.adapter.family);
        let pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_semaphore(semaphore, None) };
                return Err(HalError::DeviceCreation(format!("command pool: {e}")));
            }
        };
        log::debug!("{kind:?} queue created on family {}", shared.adapter.family);

        Ok(Self {
            kind,
            semaphore,
            pool: Mutex::new(Pool {
                pool,
                free: Vec::new(),
                unsignaled: Vec::new(),
                retired: VecDeque::new(),
                presents: Vec::new(),
                last_signaled: 0,
            }),
            shared,
        })
    }

    fn completed(&self) -> u64 {
        unsafe { self.shared.device.get_semaphore_counter_value(self.semaphore) }.unwrap_or_else(|e| {
            log::error!("{:?} queue: reading timeline: {e}", self.kind);
            0
        })
    }

    /// Moves command buffers whose signal has completed back to the free list.
    fn reclaim(&self, pool: &mut Pool) {
        let completed = self.completed();
        while pool.retired.front().is_some_and(|(value, _)| *value <= completed) {
            if let Some((_, buffers)) = pool.retired.pop_front() {
                for cb in &buffers {
                    let reset = unsafe {
                        self.shared
                            .device
                            .reset_command_buffer(*cb, vk::CommandBufferResetFlags::empty())
                    };
                    if let Err(e) = reset {
                        log::error!("resetting command buffer: {e}");
                    }
                }
                pool.free.extend(buffers);
            }
        }
    }

    fn acquire(&self, pool: &mut Pool) -> HalResult<vk::CommandBuffer> {
        let cb = match pool.free.pop() {
            Some(cb) => cb,
            None => {
                let info = vk::CommandBufferAllocateInfo::default()
                    .command_pool(pool.pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1);
                unsafe { self.shared.device.allocate_command_buffers(&info) }
                    .map_err(|e| HalError::Unsupported(format!("allocating command buffer: {e}")))?[0]
            }
        };
        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.shared.device.begin_command_buffer(cb, &begin) }
            .map_err(|e| HalError::Unsupported(format!("beginning command buffer: {e}")))?;
        Ok(cb)
    }

    fn end(&self, cb: vk::CommandBuffer) -> HalResult<()> {
        unsafe { self.shared.device.end_command_buffer(cb) }
            .map_err(|e| HalError::Unsupported(format!("ending command buffer: {e}")))
    }

    /// Records the first layout of images created since the last submission.
    fn layout_inits(&self, pool: &mut Pool) -> HalResult<Option<vk::CommandBuffer>> {
        let inits = std::mem::take(&mut *self.shared.pending_layouts.lock());
        if inits.is_empty() {
            return Ok(None);
        }
        let barriers: Vec<vk::ImageMemoryBarrier2> = inits
            .iter()
            .map(|init| {
                vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(vk::PipelineStageFlags2::NONE)
                    .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(init.layout)
                    .image(init.image)
                    .subresource_range(full_range(init.aspect))
            })
            .collect();
        let cb = self.acquire(pool)?;
        unsafe {
            self.shared.device.cmd_pipeline_barrier2(
                cb,
                &vk::DependencyInfo::default().image_memory_barriers(&barriers),
            );
        }
        self.end(cb)?;
        pool.unsignaled.push(cb);
        log::trace!("{} images given their first layout", inits.len());
        Ok(Some(cb))
    }

    /// Submits `buffers`, preceded by pending layout initialization, and
    /// optionally signals `signal` after them.
    fn submit(&self, pool: &mut Pool, buffers: &[vk::CommandBuffer], signal: Option<u64>) -> HalResult<()> {
        let queue = self.shared.queue.lock();
        // Drained under the queue lock so no submission can use an image
        // before its first layout is set.
        let init = self.layout_inits(pool)?;
        let infos: Vec<vk::CommandBufferSubmitInfo> = init
            .into_iter()
            .chain(buffers.iter().copied())
            .map(|cb| vk::CommandBufferSubmitInfo::default().command_buffer(cb))
            .collect();
        let signals: Vec<vk::SemaphoreSubmitInfo> = signal
            .map(|value| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(self.semaphore)
                    .value(value)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .into_iter()
            .collect();
        let submit = vk::SubmitInfo2::default()
            .command_buffer_infos(&infos)
            .signal_semaphore_infos(&signals);
        unsafe {
            self.shared
                .device
                .queue_submit2(*queue, &[submit], vk::Fence::null())
        }
        .map_err(|e| HalError::Unsupported(format!("{:?} submit: {e}", self.kind)))
    }

    fn record(&self, pool: &mut Pool, buffer: &CommandBuffer) -> HalResult<vk::CommandBuffer> {
        let cb = self.acquire(pool)?;
        let mut recorder = Recorder::new(&self.shared, cb, self.kind);
        recorder.record(&buffer.commands);
        pool.presents.extend(recorder.finish());
        self.end(cb)?;
        Ok(cb)
    }
}

impl Queue for VulkanQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Translates and submits at once; no reference to `buffers` is kept.
    fn execute(&self, buffers: &[Arc<CommandBuffer>]) {
        let mut pool = self.pool.lock();
        self.reclaim(&mut pool);

        let mut recorded = Vec::with_capacity(buffers.len());
        for buffer in buffers {
            if buffer.kind != self.kind {
                log::warn!("{:?} commands executed on the {:?} queue", buffer.kind, self.kind);
            }
            match self.record(&mut pool, buffer) {
                Ok(cb) => recorded.push(cb),
                Err(e) => log::error!("{:?} queue: {e}", self.kind),
            }
        }
        if let Err(e) = self.submit(&mut pool, &recorded, None) {
            log::error!("{e}");
        }
        pool.unsignaled.extend(recorded);
    }

    fn signal(&self, value: u64) {
        let mut pool = self.pool.lock();
        if let Err(e) = self.submit(&mut pool, &[], Some(value)) {
            log::error!("{e}");
            return;
        }
        pool.last_signaled = value;
        let done = std::mem::take(&mut pool.unsignaled);
        if !done.is_empty() {
            pool.retired.push_back((value, done));
        }

        let presents = std::mem::take(&mut pool.presents);
        if !presents.is_empty() {
            let chains = self.shared.swapchains.lock();
            for copy in presents {
                match chains.get(&copy.swapchain) {
                    Some(chain) => chain.queue_frame(copy.buffer, self.semaphore, value),
                    None => log::warn!("present to destroyed {:?}", copy.swapchain),
                }
            }
        }
    }

    fn completed_value(&self) -> u64 {
        self.completed()
    }

    fn wait(&self, value: u64) {
        let semaphores = [self.semaphore];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        if let Err(e) = unsafe { self.shared.device.wait_semaphores(&info, u64::MAX) } {
            log::error!("{:?} queue: waiting for {value}: {e}", self.kind);
        }
    }
}

impl Drop for VulkanQueue {
    fn drop(&mut self) {
        {
            let queue = self.shared.queue.lock();
            if let Err(e) = unsafe { self.shared.device.queue_wait_idle(*queue) } {
                log::error!("{:?} queue: wait idle: {e}", self.kind);
            }
        }
        let pool = self.pool.get_mut();
        unsafe {
            self.shared.device.destroy_command_pool(pool.pool, None);
            self.shared.device.destroy_semaphore(self.semaphore, None);
        }
        log::debug!("{:?} queue destroyed at fence value {}", self.kind, pool.last_signaled);
    }
}
