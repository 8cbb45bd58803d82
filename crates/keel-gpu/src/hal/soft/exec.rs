use std::panic::{self, AssertUnwindSafe};

use crate::hal::{
    Barrier, Command, CommandBuffer, CpuHandle, DrawArgs, IndexFormat, PipelineDesc, PipelineId,
    PresentFrame, QueueKind, ResourceId, ScissorRect, TableId, ThreadIds, ViewDesc, Viewport,
};

use super::env::{Env, IndexBinding, Raster, Surface};
use super::state::{Registry, Shared, SoftTable, Stat, handle_table};

/// Bindings live for one command buffer, as on hardware.
#[derive(Default)]
struct ExecState {
    resource_table: Option<TableId>,
    sampler_table: Option<TableId>,
    pipeline: Option<PipelineId>,
    constants: Vec<u32>,
    index: Option<(ResourceId, u64, IndexFormat)>,
    viewport: Option<Viewport>,
    scissor: Option<ScissorRect>,
    targets: Vec<CpuHandle>,
    depth: Option<CpuHandle>,
}

/// Runs `buffer` on a timeline of kind `queue`, which may differ from the
/// kind the buffer was recorded for.
pub(super) fn execute(shared: &Shared, queue: QueueKind, buffer: &CommandBuffer) {
    shared.stats.bump(Stat::CommandBuffer);
    let mut state = ExecState::default();

    for command in &buffer.commands {
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| apply(shared, queue, &mut state, command)));
        if outcome.is_err() {
            log::error!("{:?} timeline faulted executing {}", buffer.kind, command_name(command));
        }
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Barriers(_) => "barriers",
        Command::SetDescriptorTables { .. } => "set-descriptor-tables",
        Command::SetPipeline(_) => "set-pipeline",
        Command::SetConstants(_) => "set-constants",
        Command::SetIndexBuffer { .. } => "set-index-buffer",
        Command::SetViewport(_) => "set-viewport",
        Command::SetScissor(_) => "set-scissor",
        Command::SetRenderTargets { .. } => "set-render-targets",
        Command::ClearRenderTarget { .. } => "clear-render-target",
        Command::ClearDepthStencil { .. } => "clear-depth-stencil",
        Command::Draw(_) => "draw",
        Command::Dispatch(_) => "dispatch",
        Command::CopyBuffer { .. } => "copy-buffer",
        Command::CopyResource { .. } => "copy-resource",
        Command::CopyBufferToTexture { .. } => "copy-buffer-to-texture",
        Command::CopyTextureToBuffer { .. } => "copy-texture-to-buffer",
        Command::Present { .. } => "present",
    }
}

fn apply(shared: &Shared, queue: QueueKind, state: &mut ExecState, command: &Command) {
    match command {
        Command::Barriers(barriers) => apply_barriers(shared, queue, barriers),
        Command::SetDescriptorTables { resource, sampler } => {
            state.resource_table = Some(*resource);
            state.sampler_table = Some(*sampler);
        }
        Command::SetPipeline(id) => state.pipeline = Some(*id),
        Command::SetConstants(values) => {
            state.constants.clear();
            state.constants.extend_from_slice(values);
        }
        Command::SetIndexBuffer {
            resource,
            size,
            format,
        } => state.index = Some((*resource, *size, *format)),
        Command::SetViewport(vp) => state.viewport = Some(*vp),
        Command::SetScissor(rect) => state.scissor = Some(*rect),
        Command::SetRenderTargets { targets, depth } => {
            state.targets.clone_from(targets);
            state.depth = *depth;
        }
        Command::ClearRenderTarget { target, color } => {
            let registry = shared.registry.read();
            let tables = shared.tables.read();
            match resolve_attachment(&registry, &tables, *target) {
                Some(surface) => surface.fill(&mut shared.arena.lock(), *color),
                None => log::warn!("clear of an empty render-target slot {target:?}"),
            }
        }
        Command::ClearDepthStencil { target, depth, .. } => {
            let registry = shared.registry.read();
            let tables = shared.tables.read();
            match resolve_attachment(&registry, &tables, *target) {
                Some(surface) => surface.fill(&mut shared.arena.lock(), [*depth, 0.0, 0.0, 1.0]),
                None => log::warn!("clear of an empty depth-stencil slot {target:?}"),
            }
        }
        Command::Draw(args) => draw(shared, state, args),
        Command::Dispatch(groups) => dispatch(shared, state, *groups),
        Command::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        } => copy_bytes(shared, (*src, *src_offset), (*dst, *dst_offset), Some(*size)),
        Command::CopyResource { src, dst } => copy_bytes(shared, (*src, 0), (*dst, 0), None),
        Command::CopyBufferToTexture {
            src,
            src_offset,
            dst,
            subresource,
        } => {
            let footprint = {
                let registry = shared.registry.read();
                registry.get(dst).map(|r| r.desc.footprint(*subresource))
            };
            match footprint {
                Some(fp) => copy_bytes(shared, (*src, *src_offset), (*dst, fp.offset), Some(fp.size)),
                None => log::warn!("copy into unknown texture {dst:?}"),
            }
        }
        Command::CopyTextureToBuffer {
            src,
            subresource,
            dst,
            dst_offset,
        } => {
            let footprint = {
                let registry = shared.registry.read();
                registry.get(src).map(|r| r.desc.footprint(*subresource))
            };
            match footprint {
                Some(fp) => copy_bytes(shared, (*src, fp.offset), (*dst, *dst_offset), Some(fp.size)),
                None => log::warn!("copy from unknown texture {src:?}"),
            }
        }
        Command::Present { swapchain, buffer } => present(shared, *swapchain, *buffer),
    }
}

fn apply_barriers(shared: &Shared, queue: QueueKind, barriers: &[Barrier]) {
    shared.stats.bump(Stat::BarrierBatch);
    let mut registry = shared.registry.write();

    for barrier in barriers {
        match *barrier {
            Barrier::Transition {
                resource,
                before,
                after,
            } => {
                shared.stats.bump(Stat::Transition);
                let Some(res) = registry.get_mut(&resource) else {
                    log::warn!("transition of unknown resource {resource:?}");
                    shared.stats.bump(Stat::ValidationError);
                    continue;
                };
                if shared.config.validation && !(queue.allows(before) && queue.allows(after)) {
                    log::warn!(
                        "transition of {resource:?} from {before:?} to {after:?} is not legal on a {queue:?} queue"
                    );
                    shared.stats.bump(Stat::QueueStateError);
                    shared.stats.bump(Stat::ValidationError);
                }
                if shared.config.validation && res.state != before {
                    log::warn!(
                        "transition of {resource:?} declares {before:?} but the resource is in {:?}",
                        res.state
                    );
                    shared.stats.bump(Stat::ValidationError);
                }
                res.state = after;
            }
            Barrier::Uav { .. } => shared.stats.bump(Stat::UavBarrier),
        }
    }
}

fn resolve_attachment(
    registry: &Registry,
    tables: &std::collections::HashMap<TableId, SoftTable>,
    handle: CpuHandle,
) -> Option<Surface> {
    let table = tables.get(&handle_table(handle))?;
    match *table.view(table.index_of(handle))? {
        ViewDesc::RenderTarget {
            resource,
            format,
            mip_slice,
        } => Surface::resolve(registry, resource, mip_slice, 0, format),
        ViewDesc::DepthStencil { resource, format } => {
            Surface::resolve(registry, resource, 0, 0, format)
        }
        _ => None,
    }
}

fn draw(shared: &Shared, state: &ExecState, args: &DrawArgs) {
    let registry = shared.registry.read();
    let tables = shared.tables.read();
    let pipelines = shared.pipelines.read();

    let Some(PipelineDesc::Graphics(desc)) = state.pipeline.and_then(|id| pipelines.get(&id)) else {
        log::warn!("draw without a graphics pipeline bound");
        shared.stats.bump(Stat::ValidationError);
        return;
    };

    let targets: Vec<Surface> = state
        .targets
        .iter()
        .filter_map(|h| resolve_attachment(&registry, &tables, *h))
        .collect();
    let depth = state
        .depth
        .and_then(|h| resolve_attachment(&registry, &tables, h));

    if shared.config.validation {
        let bound: Vec<_> = targets.iter().map(|t| t.format).collect();
        if bound != desc.render_target_formats {
            log::warn!(
                "pipeline '{}' expects targets {:?}, bound {:?}",
                desc.name,
                desc.render_target_formats,
                bound
            );
            shared.stats.bump(Stat::ValidationError);
        }
    }

    let viewport = state.viewport.unwrap_or_else(|| {
        targets
            .first()
            .map_or(Viewport::full(0, 0), |t| Viewport::full(t.width, t.height))
    });
    let index = state.index.and_then(|(resource, size, format)| {
        registry.get(&resource).map(|r| IndexBinding {
            heap: r.heap,
            offset: r.offset,
            size: size.min(r.desc.allocation_size()),
            format,
        })
    });

    let mut arena = shared.arena.lock();
    let mut env = Env {
        registry: &registry,
        resources: state.resource_table.and_then(|t| tables.get(&t)),
        samplers: state.sampler_table.and_then(|t| tables.get(&t)),
        arena: &mut arena,
        constants: &state.constants,
        raster: Some(Raster {
            targets,
            depth,
            depth_state: desc.depth.clone(),
            viewport,
            scissor: state.scissor,
            index,
        }),
    };
    desc.program.draw(&mut env, args);
    shared.stats.bump(Stat::Draw);
}

fn dispatch(shared: &Shared, state: &ExecState, groups: [u32; 3]) {
    let registry = shared.registry.read();
    let tables = shared.tables.read();
    let pipelines = shared.pipelines.read();

    let Some(PipelineDesc::Compute(desc)) = state.pipeline.and_then(|id| pipelines.get(&id)) else {
        log::warn!("dispatch without a compute pipeline bound");
        shared.stats.bump(Stat::ValidationError);
        return;
    };

    let [tx, ty, tz] = desc.program.thread_group_size();
    let mut arena = shared.arena.lock();
    let mut env = Env {
        registry: &registry,
        resources: state.resource_table.and_then(|t| tables.get(&t)),
        samplers: state.sampler_table.and_then(|t| tables.get(&t)),
        arena: &mut arena,
        constants: &state.constants,
        raster: None,
    };

    for gz in 0..groups[2] {
        for gy in 0..groups[1] {
            for gx in 0..groups[0] {
                for lz in 0..tz {
                    for ly in 0..ty {
                        for lx in 0..tx {
                            let ids = ThreadIds {
                                dispatch: [gx * tx + lx, gy * ty + ly, gz * tz + lz],
                                group: [gx, gy, gz],
                                local: [lx, ly, lz],
                            };
                            desc.program.execute(&mut env, ids);
                        }
                    }
                }
            }
        }
    }
    shared.stats.bump(Stat::Dispatch);
}

/// Copies `size` bytes (the whole resource when `None`) between resources.
fn copy_bytes(shared: &Shared, src: (ResourceId, u64), dst: (ResourceId, u64), size: Option<u64>) {
    let registry = shared.registry.read();
    let (Some(s), Some(d)) = (registry.get(&src.0), registry.get(&dst.0)) else {
        log::warn!("copy between unknown resources {:?} -> {:?}", src.0, dst.0);
        return;
    };

    let size = match size {
        Some(size) => size,
        None => {
            let (a, b) = (s.desc.allocation_size(), d.desc.allocation_size());
            if a != b {
                log::warn!("copy-resource size mismatch: {a} vs {b} bytes");
                shared.stats.bump(Stat::ValidationError);
                return;
            }
            a
        }
    };
    if src.1 + size > s.desc.allocation_size() || dst.1 + size > d.desc.allocation_size() {
        log::warn!("copy of {size} bytes is out of bounds");
        shared.stats.bump(Stat::ValidationError);
        return;
    }

    let mut staging = vec![0u8; size as usize];
    let mut arena = shared.arena.lock();
    if arena.read(s.heap, s.offset + src.1, &mut staging) {
        arena.write(d.heap, d.offset + dst.1, &staging);
    }
    shared.stats.bump(Stat::Copy);
}

fn present(shared: &Shared, swapchain: crate::hal::SwapchainId, buffer: u32) {
    let (resource, format) = {
        let chains = shared.swapchains.lock();
        let Some(chain) = chains.get(&swapchain) else {
            log::warn!("present on unknown swapchain {swapchain:?}");
            return;
        };
        let Some(resource) = chain.buffers.get(buffer as usize).copied() else { return };
        (resource, chain.desc.format)
    };

    let frame = {
        let registry = shared.registry.read();
        let Some(res) = registry.get(&resource) else { return };
        let fp = res.desc.footprint(0);
        let mut pixels = vec![0u8; fp.size as usize];
        shared
            .arena
            .lock()
            .read(res.heap, res.offset + fp.offset, &mut pixels);
        (fp.width, fp.height, pixels)
    };

    let mut chains = shared.swapchains.lock();
    if let Some(chain) = chains.get_mut(&swapchain) {
        let result = chain.target.present(PresentFrame {
            width: frame.0,
            height: frame.1,
            format,
            pixels: &frame.2,
        });
        if let Err(e) = result {
            log::warn!("{e}");
        }
    }
    shared.stats.bump(Stat::Present);
}
