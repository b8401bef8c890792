//! Hardware Decode Pipeline - asynchronous surface-pool core
//!
//! Keeps a hardware decode engine's command queue full while output I/O
//! runs at its own pace, without ever exceeding the fixed surface budget.
//!
//! Key pieces:
//! - Arena-backed surface pool with O(1) acquire/release and lock counts
//! - Submission scheduler with busy/realloc/param-change handling and
//!   optional chaining into a post-process stage
//! - In-order output synchronizer with bounded waits
//! - Delivery worker thread decoupling sink latency in render mode

pub mod backend;
pub mod config;
pub mod delivery;
pub mod error;
pub mod pipeline;
pub mod postproc;
pub mod scheduler;
pub mod stats;
pub mod surface_pool;
pub mod synchronizer;
pub mod sysmem;
pub mod types;

pub use backend::{
    Bitstream, BitstreamSource, DecodeEngine, DecodeStatus, FrameAllocator, OutputSink,
    PostProcessStatus, ReadStatus, SessionParams, SyncStatus,
};
pub use config::{DecoderPostProc, PipelineConfig, Playback, PostProcRequest, WorkMode};
pub use delivery::{Delivery, DeliveryWorker, WorkerState};
pub use error::{AllocError, EngineError, PipelineError, PoolError, Result, SinkError};
pub use pipeline::{DecodePipeline, PipelineState, RunStatus, RunSummary};
pub use postproc::PostProcPlan;
pub use scheduler::{Scheduler, SubmitOutcome};
pub use stats::{LatencySummary, PipelineStats, StatsSnapshot};
pub use surface_pool::{Location, PoolCounts, Surface, SurfaceKind, SurfacePool};
pub use synchronizer::{PendingOutput, SyncOutcome, Synchronizer};
pub use sysmem::SystemMemoryAllocator;
pub use types::*;
