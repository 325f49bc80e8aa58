//! Error type shared by the backend.

use thiserror::Error;

/// Hardware object kinds, used to label creation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    RasterizerState,
    DepthStencilState,
    BlendState,
    SamplerState,
    InputLayout,
    Shader,
    Buffer,
    Texture,
    View,
    Query,
    DeferredContext,
    CommandList,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("failed to create {kind:?}: {reason}")]
    CreationFailed { kind: ObjectKind, reason: String },
    #[error("device removed: {0}")]
    DeviceRemoved(String),
    #[error("map failed: {0}")]
    MapFailed(String),
    #[error("unsupported on this hardware: {0}")]
    Unsupported(&'static str),
    #[error("access out of bounds (resource size {size}, access end {end})")]
    OutOfBounds { size: u64, end: u64 },
    #[error("query {index} not ready after polling")]
    QueryNotReady { index: u32 },
}

impl Error {
    pub(crate) fn creation(kind: ObjectKind, reason: impl Into<String>) -> Self {
        Error::CreationFailed {
            kind,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
