//! Pipeline state objects and the shared bindless root layout.

use std::sync::Arc;

use crate::config::ROOT_CONSTANT_COUNT;
use crate::error::OrFatal;
use crate::hal::{Backend, PipelineDesc, PipelineId, TableId};

pub use crate::hal::{ComputePipelineDesc, DepthState, GraphicsPipelineDesc};

/// The one root layout every pipeline uses: an inline constants blob plus
/// the shader-visible resource and sampler tables.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BindlessLayout {
    pub resource_table: TableId,
    pub sampler_table: TableId,
    pub constant_count: usize,
}

impl BindlessLayout {
    pub fn new(resource_table: TableId, sampler_table: TableId) -> Self {
        Self {
            resource_table,
            sampler_table,
            constant_count: ROOT_CONSTANT_COUNT,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PipelineKind {
    Graphics,
    Compute,
}

/// A compiled pipeline. Lives as long as the device.
#[derive(Debug, Clone)]
pub struct PipelineState {
    id: PipelineId,
    kind: PipelineKind,
    name: Arc<str>,
}

impl PipelineState {
    pub(crate) fn create(backend: &dyn Backend, desc: &PipelineDesc) -> Self {
        let id = backend
            .create_pipeline(desc)
            .or_fatal(&format!("creating pipeline '{}'", desc.name()));
        let kind = match desc {
            PipelineDesc::Graphics(_) => PipelineKind::Graphics,
            PipelineDesc::Compute(_) => PipelineKind::Compute,
        };
        log::debug!("{kind:?} pipeline '{}' created", desc.name());
        Self {
            id,
            kind,
            name: Arc::from(desc.name()),
        }
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
