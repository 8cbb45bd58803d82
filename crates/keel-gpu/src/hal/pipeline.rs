use std::sync::Arc;

use super::{CompareFunc, ComputeProgram, Format, GraphicsProgram};

#[derive(Debug, Clone)]
pub struct DepthState {
    pub format: Format,
    pub compare: CompareFunc,
    pub write: bool,
}

#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc {
    pub name: String,
    pub program: Arc<dyn GraphicsProgram>,
    pub render_target_formats: Vec<Format>,
    pub depth: Option<DepthState>,
}

#[derive(Debug, Clone)]
pub struct ComputePipelineDesc {
    pub name: String,
    pub program: Arc<dyn ComputeProgram>,
}

#[derive(Debug, Clone)]
pub enum PipelineDesc {
    Graphics(GraphicsPipelineDesc),
    Compute(ComputePipelineDesc),
}

impl PipelineDesc {
    pub fn name(&self) -> &str {
        match self {
            PipelineDesc::Graphics(d) => &d.name,
            PipelineDesc::Compute(d) => &d.name,
        }
    }
}

impl From<GraphicsPipelineDesc> for PipelineDesc {
    fn from(desc: GraphicsPipelineDesc) -> Self {
        PipelineDesc::Graphics(desc)
    }
}

impl From<ComputePipelineDesc> for PipelineDesc {
    fn from(desc: ComputePipelineDesc) -> Self {
        PipelineDesc::Compute(desc)
    }
}
