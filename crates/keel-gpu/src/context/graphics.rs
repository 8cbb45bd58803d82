use std::sync::Arc;

use bytemuck::Pod;

use crate::descriptor::DescriptorTables;
use crate::hal::{
    Command, CpuHandle, DrawArgs, IndexFormat, QueueKind, ResourceId, ScissorRect, TableKind,
    Viewport,
};
use crate::pipeline::{PipelineKind, PipelineState};
use crate::queue::SubmissionQueue;
use crate::resource::{Buffer, BufferUsage, INVALID_INDEX, Texture};

use super::{CommandStream, RecordingContext, pack_constants};

/// Records draws, dispatches and copies for the graphics queue.
#[derive(Debug)]
pub struct GraphicsContext {
    stream: CommandStream,
    tables: Arc<DescriptorTables>,
    pipeline_kind: Option<PipelineKind>,
}

impl GraphicsContext {
    pub fn new(queue: Arc<SubmissionQueue>, tables: Arc<DescriptorTables>) -> Self {
        Self {
            stream: CommandStream::new(queue, QueueKind::Graphics),
            tables,
            pipeline_kind: None,
        }
    }

    pub fn set_pipeline_state(&mut self, pipeline: &PipelineState) {
        self.pipeline_kind = Some(pipeline.kind());
        self.stream.record(Command::SetPipeline(pipeline.id()));
    }

    /// Copies `value` into the inline constants blob.
    pub fn set_32bit_constants<T: Pod>(&mut self, value: &T) {
        self.stream.record(Command::SetConstants(pack_constants(value)));
    }

    pub fn set_index_buffer(&mut self, buffer: &Buffer) {
        debug_assert_eq!(buffer.usage, BufferUsage::IndexBuffer, "'{}' is not an index buffer", buffer.name);
        let format = match buffer.stride {
            2 => IndexFormat::Uint16,
            _ => IndexFormat::Uint32,
        };
        self.stream.record(Command::SetIndexBuffer {
            resource: buffer.resource(),
            size: buffer.size_in_bytes,
            format,
        });
    }

    /// Sets the viewport and a scissor covering it.
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.stream.record(Command::SetViewport(viewport));
        self.stream.record(Command::SetScissor(ScissorRect {
            left: viewport.x.max(0.0) as u32,
            top: viewport.y.max(0.0) as u32,
            right: (viewport.x + viewport.width).max(0.0) as u32,
            bottom: (viewport.y + viewport.height).max(0.0) as u32,
        }));
    }

    pub fn set_scissor(&mut self, rect: ScissorRect) {
        self.stream.record(Command::SetScissor(rect));
    }

    pub fn set_render_target(&mut self, target: &Texture, depth: Option<&Texture>) {
        self.set_render_targets(&[target], depth);
    }

    pub fn set_render_targets(&mut self, targets: &[&Texture], depth: Option<&Texture>) {
        let targets: Vec<CpuHandle> = targets
            .iter()
            .map(|t| {
                debug_assert_ne!(t.rtv_index, INVALID_INDEX, "'{}' has no render-target view", t.desc.name);
                self.tables.handle(TableKind::RenderTarget, t.rtv_index)
            })
            .collect();
        let depth = depth.map(|d| {
            debug_assert_ne!(d.dsv_index, INVALID_INDEX, "'{}' has no depth view", d.desc.name);
            self.tables.handle(TableKind::DepthStencil, d.dsv_index)
        });
        self.set_render_target_views(&targets, depth);
    }

    /// Binds render targets by descriptor handle.
    pub fn set_render_target_views(&mut self, targets: &[CpuHandle], depth: Option<CpuHandle>) {
        self.stream.record(Command::SetRenderTargets {
            targets: targets.to_vec(),
            depth,
        });
    }

    pub fn clear_render_target(&mut self, target: &Texture, color: [f32; 4]) {
        let handle = self.tables.handle(TableKind::RenderTarget, target.rtv_index);
        self.clear_render_target_view(handle, color);
    }

    pub fn clear_render_target_view(&mut self, target: CpuHandle, color: [f32; 4]) {
        self.stream.record(Command::ClearRenderTarget { target, color });
    }

    pub fn clear_depth_stencil(&mut self, depth: &Texture, value: f32, stencil: u8) {
        let target = self.tables.handle(TableKind::DepthStencil, depth.dsv_index);
        self.stream.record(Command::ClearDepthStencil {
            target,
            depth: value,
            stencil,
        });
    }

    pub fn draw(&mut self, vertex_count: u32) {
        self.draw_instanced(vertex_count, 1, 0, 0);
    }

    pub fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.debug_check_pipeline(PipelineKind::Graphics);
        self.stream.record(Command::Draw(DrawArgs {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
            indexed: None,
        }));
    }

    pub fn draw_indexed(&mut self, index_count: u32) {
        self.draw_indexed_instanced(index_count, 1, 0, 0, 0);
    }

    pub fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) {
        self.debug_check_pipeline(PipelineKind::Graphics);
        self.stream.record(Command::Draw(DrawArgs {
            vertex_count: index_count,
            instance_count,
            first_vertex: 0,
            first_instance,
            indexed: Some((first_index, base_vertex)),
        }));
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.debug_check_pipeline(PipelineKind::Compute);
        self.stream.record(Command::Dispatch([x, y, z]));
    }

    pub fn copy_resource(&mut self, src: ResourceId, dst: ResourceId) {
        self.stream.record(Command::CopyResource { src, dst });
    }

    fn debug_check_pipeline(&self, expected: PipelineKind) {
        debug_assert_eq!(
            self.pipeline_kind,
            Some(expected),
            "{expected:?} work recorded with the wrong pipeline bound"
        );
    }
}

impl RecordingContext for GraphicsContext {
    fn stream(&self) -> &CommandStream {
        &self.stream
    }

    fn stream_mut(&mut self) -> &mut CommandStream {
        &mut self.stream
    }

    /// Reopens recording and rebinds the bindless tables.
    fn reset(&mut self) {
        self.stream.reset();
        self.pipeline_kind = None;
        let layout = self.tables.layout();
        self.stream.record(Command::SetDescriptorTables {
            resource: layout.resource_table,
            sampler: layout.sampler_table,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceInit;
    use crate::hal::soft::{SoftBackend, SoftConfig};
    use crate::hal::{Backend, ResourceState};

    fn context() -> GraphicsContext {
        let backend: Arc<dyn Backend> = Arc::new(SoftBackend::new(SoftConfig::default()));
        let queue = Arc::new(SubmissionQueue::new(
            backend.create_queue(QueueKind::Graphics).unwrap(),
        ));
        let tables = Arc::new(DescriptorTables::new(&backend, &DeviceInit::default()).unwrap());
        GraphicsContext::new(queue, tables)
    }

    #[test]
    fn reset_binds_shader_visible_tables_first() {
        let mut ctx = context();
        ctx.reset();
        assert!(matches!(ctx.recorded(), [Command::SetDescriptorTables { .. }]));
    }

    #[test]
    fn viewport_brings_full_scissor() {
        let mut ctx = context();
        ctx.reset();
        ctx.set_viewport(Viewport::full(64, 32));
        let Some(Command::SetScissor(rect)) = ctx.recorded().last() else {
            panic!("expected a scissor");
        };
        assert_eq!((rect.right, rect.bottom), (64, 32));
    }

    #[test]
    fn interleaved_barriers_keep_batches_separate() {
        let mut ctx = context();
        ctx.reset();
        ctx.add_resource_barrier(ResourceId(1), ResourceState::Common, ResourceState::RenderTarget);
        ctx.add_resource_barrier(ResourceId(2), ResourceState::Common, ResourceState::RenderTarget);
        ctx.execute_resource_barriers();
        ctx.add_resource_barrier(ResourceId(1), ResourceState::RenderTarget, ResourceState::Common);
        ctx.execute_resource_barriers();
        let buffer = ctx.close();
        assert_eq!(buffer.barrier_batches(), 2);
        assert_eq!(buffer.barrier_count(), 3);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "wrong pipeline bound")]
    fn draw_without_pipeline_asserts() {
        let mut ctx = context();
        ctx.reset();
        ctx.draw(3);
    }
}
