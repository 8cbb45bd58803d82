use super::{ResourceId, TableKind};

/// Failures reported by a backend.
#[derive(Debug, thiserror::Error)]
pub enum HalError {
    #[error("out of device memory allocating {size} bytes")]
    OutOfMemory { size: u64 },

    #[error("descriptor slot {index} is out of range for the {kind:?} table")]
    InvalidDescriptor { kind: TableKind, index: u32 },

    #[error("unknown resource {0:?}")]
    UnknownResource(ResourceId),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("presentation failed: {0}")]
    Presentation(String),

    #[error("device creation failed: {0}")]
    DeviceCreation(String),
}

pub type HalResult<T> = Result<T, HalError>;
