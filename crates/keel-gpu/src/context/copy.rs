use std::sync::Arc;

use crate::hal::{Command, QueueKind, ResourceId};
use crate::queue::SubmissionQueue;

use super::{CommandStream, RecordingContext};

/// Records transfers for the copy queue.
///
/// Copy contexts are usually transient: one per upload, dropped once the
/// upload's fence has been waited on.
#[derive(Debug)]
pub struct CopyContext {
    stream: CommandStream,
}

impl CopyContext {
    pub fn new(queue: Arc<SubmissionQueue>) -> Self {
        Self {
            stream: CommandStream::new(queue, QueueKind::Copy),
        }
    }

    pub fn copy_buffer(
        &mut self,
        src: ResourceId,
        src_offset: u64,
        dst: ResourceId,
        dst_offset: u64,
        size: u64,
    ) {
        self.stream.record(Command::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
    }

    /// Copies tightly packed rows from `src` into one texture subresource.
    pub fn copy_buffer_to_texture(
        &mut self,
        src: ResourceId,
        src_offset: u64,
        dst: ResourceId,
        subresource: u32,
    ) {
        self.stream.record(Command::CopyBufferToTexture {
            src,
            src_offset,
            dst,
            subresource,
        });
    }

    pub fn copy_texture_to_buffer(
        &mut self,
        src: ResourceId,
        subresource: u32,
        dst: ResourceId,
        dst_offset: u64,
    ) {
        self.stream.record(Command::CopyTextureToBuffer {
            src,
            subresource,
            dst,
            dst_offset,
        });
    }

    pub fn copy_resource(&mut self, src: ResourceId, dst: ResourceId) {
        self.stream.record(Command::CopyResource { src, dst });
    }

    /// Queue this context submits to.
    pub fn queue(&self) -> &Arc<SubmissionQueue> {
        self.stream.queue()
    }
}

impl RecordingContext for CopyContext {
    fn stream(&self) -> &CommandStream {
        &self.stream
    }

    fn stream_mut(&mut self) -> &mut CommandStream {
        &mut self.stream
    }
}
