use std::sync::Arc;

use bytemuck::Pod;

use crate::hal::{Command, QueueKind};
use crate::pipeline::{BindlessLayout, PipelineKind, PipelineState};
use crate::queue::SubmissionQueue;

use super::{CommandStream, RecordingContext, pack_constants};

/// Records dispatches for the compute queue.
#[derive(Debug)]
pub struct ComputeContext {
    stream: CommandStream,
    layout: BindlessLayout,
    has_pipeline: bool,
}

impl ComputeContext {
    pub fn new(queue: Arc<SubmissionQueue>, layout: BindlessLayout) -> Self {
        Self {
            stream: CommandStream::new(queue, QueueKind::Compute),
            layout,
            has_pipeline: false,
        }
    }

    pub fn set_pipeline_state(&mut self, pipeline: &PipelineState) {
        debug_assert_eq!(
            pipeline.kind(),
            PipelineKind::Compute,
            "graphics pipeline '{}' bound on a compute context",
            pipeline.name()
        );
        self.has_pipeline = true;
        self.stream.record(Command::SetPipeline(pipeline.id()));
    }

    pub fn set_32bit_constants<T: Pod>(&mut self, value: &T) {
        self.stream.record(Command::SetConstants(pack_constants(value)));
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        debug_assert!(self.has_pipeline, "dispatch without a compute pipeline");
        self.stream.record(Command::Dispatch([x, y, z]));
    }

    /// Queue this context submits to.
    pub fn queue(&self) -> &Arc<SubmissionQueue> {
        self.stream.queue()
    }
}

impl RecordingContext for ComputeContext {
    fn stream(&self) -> &CommandStream {
        &self.stream
    }

    fn stream_mut(&mut self) -> &mut CommandStream {
        &mut self.stream
    }

    fn reset(&mut self) {
        self.stream.reset();
        self.has_pipeline = false;
        self.stream.record(Command::SetDescriptorTables {
            resource: self.layout.resource_table,
            sampler: self.layout.sampler_table,
        });
    }
}
