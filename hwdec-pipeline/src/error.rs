//! Error types for the decode pipeline

use crate::types::{MemId, SurfaceId};
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Fatal errors reported by a hardware engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The device stopped responding while executing queued work
    #[error("device fault")]
    DeviceFault,

    #[error("null handle passed to {0}")]
    NullHandle(&'static str),

    #[error("engine not initialized")]
    NotInitialized,

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Any other hardware status code
    #[error("{context} failed with status {code}")]
    Failed { code: i32, context: String },
}

/// Frame allocator failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("allocation of {count} surfaces ({bytes} bytes each) failed")]
    OutOfMemory { count: usize, bytes: usize },

    #[error("unknown memory handle {0:?}")]
    UnknownHandle(MemId),

    #[error("invalid surface geometry {width}x{height}")]
    InvalidGeometry { width: u32, height: u32 },
}

/// Output sink failures
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink rejected frame: {0}")]
    Rejected(String),
}

/// Surface bookkeeping violations. These indicate a bug in the caller,
/// never a runtime condition of the hardware.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("release of surface {0} with zero lock count")]
    ReleaseUnlocked(SurfaceId),

    #[error("unknown surface {0}")]
    UnknownSurface(SurfaceId),

    #[error("surface {id} is {actual}, expected {expected}")]
    InvalidTransition {
        id: SurfaceId,
        actual: &'static str,
        expected: &'static str,
    },

    #[error("no pool surface is backed by {0:?}")]
    UnknownHandle(MemId),
}

/// Main error type for the pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("allocator error: {0}")]
    Alloc(#[from] AllocError),

    #[error("output sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("surface pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("bitstream source error: {0}")]
    Source(#[from] std::io::Error),

    /// A transient condition did not clear within the configured bound
    #[error("{what} still pending after {attempts} retries")]
    RetryExhausted { what: &'static str, attempts: u32 },

    /// Nothing is in flight, nothing is awaiting delivery, yet no surface is free
    #[error("no free surface and no in-flight work to wait on")]
    SurfaceStarvation,

    #[error("bitstream ended before a sequence header was found")]
    HeaderNotFound,

    #[error("post-processing needs {required} surfaces, engine offered {offered}")]
    InsufficientSurfaces { required: usize, offered: usize },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("delivery worker: {0}")]
    DeliveryWorker(String),
}

impl PipelineError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        PipelineError::Config(msg.into())
    }

    pub fn worker<S: Into<String>>(msg: S) -> Self {
        PipelineError::DeliveryWorker(msg.into())
    }
}
