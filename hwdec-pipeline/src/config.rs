//! Pipeline configuration

use crate::error::{PipelineError, Result};
use crate::types::PixelFormat;
use std::time::Duration;

/// Default time the producer waits on one completion token before it
/// re-evaluates free surfaces and delivery progress.
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_millis(300);

/// Default bound on consecutive busy retries of one submission
pub const DEFAULT_BUSY_RETRIES: u32 = 1000;

/// Default pause before retrying a busy submission when nothing in flight
/// can be synchronized instead
pub const DEFAULT_BUSY_WAIT: Duration = Duration::from_millis(1);

/// What happens to a frame once its completion is observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkMode {
    /// Release immediately, measure throughput only
    Performance,
    /// Write to the sink on the producer thread
    FileDump,
    /// Queue for the delivery worker thread
    Render,
}

/// Behavior at end of input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Playback {
    /// Drain and stop
    Once,
    /// Restart the source forever (video wall)
    Loop,
    /// Restart the source until the duration has elapsed
    For(Duration),
}

/// Decoder-internal post-processing preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderPostProc {
    Off,
    /// Let the decoder scale/convert when it can
    Auto,
    /// Same as `Auto`; the engine may reject unsupported combinations
    Force,
}

/// Requested output transformation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostProcRequest {
    /// Output picture size, `None` keeps the stream size
    pub output_size: Option<(u32, u32)>,
    /// Output pixel format, `None` keeps the decoder format
    pub output_format: Option<PixelFormat>,
    pub deinterlace: bool,
    pub decoder_postproc: DecoderPostProc,
}

impl Default for PostProcRequest {
    fn default() -> Self {
        Self {
            output_size: None,
            output_format: None,
            deinterlace: false,
            decoder_postproc: DecoderPostProc::Off,
        }
    }
}

/// Decode pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub mode: WorkMode,
    /// Maximum surfaces in flight between submission and completion
    pub async_depth: u16,
    /// Timeout of one synchronizer wait; also the delivery worker's wake
    /// interval
    pub wait_interval: Duration,
    /// Pause between busy retries that cannot synchronize anything
    pub busy_wait: Duration,
    /// Bound on consecutive busy results for one submission
    pub busy_retry_limit: u32,
    /// Deliver frames completed with a device fault instead of failing
    pub soft_robust: bool,
    pub track_latency: bool,
    /// Stop after this many delivered frames
    pub frame_limit: Option<u64>,
    pub playback: Playback,
    /// Render rate cap; also adds `max_fps / 3` smoothing surfaces
    pub max_fps: Option<u16>,
    pub postproc: PostProcRequest,
    /// Pin the delivery worker to this core
    pub delivery_core: Option<usize>,
    /// Log progress every N delivered frames, 0 disables
    pub progress_interval: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: WorkMode::Performance,
            async_depth: 4,
            wait_interval: DEFAULT_WAIT_INTERVAL,
            busy_wait: DEFAULT_BUSY_WAIT,
            busy_retry_limit: DEFAULT_BUSY_RETRIES,
            soft_robust: false,
            track_latency: false,
            frame_limit: None,
            playback: Playback::Once,
            max_fps: None,
            postproc: PostProcRequest::default(),
            delivery_core: None,
            progress_interval: 0,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.async_depth == 0 {
            return Err(PipelineError::config("async_depth must be at least 1"));
        }
        if self.busy_retry_limit == 0 {
            return Err(PipelineError::config("busy_retry_limit must be at least 1"));
        }
        if self.max_fps == Some(0) {
            return Err(PipelineError::config("max_fps must be positive"));
        }
        if let Some((w, h)) = self.postproc.output_size {
            if w == 0 || h == 0 {
                return Err(PipelineError::config(format!(
                    "invalid output size {}x{}",
                    w, h
                )));
            }
        }
        if self.frame_limit == Some(0) {
            return Err(PipelineError::config("frame_limit must be positive"));
        }
        Ok(())
    }

    /// Extra decode surfaces that smooth out render jitter
    pub fn smoothing_margin(&self) -> usize {
        self.max_fps.map(|fps| fps as usize / 3).unwrap_or(0)
    }

    /// Minimum spacing between two rendered frames
    pub fn frame_interval(&self) -> Option<Duration> {
        match (self.mode, self.max_fps) {
            (WorkMode::Render, Some(fps)) => Some(Duration::from_secs(1) / fps as u32),
            _ => None,
        }
    }
}
