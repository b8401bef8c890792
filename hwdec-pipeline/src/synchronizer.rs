//! Completion tracking for submitted work
//!
//! Outputs are waited on strictly in submission order, so completions enter
//! delivery in that order no matter how the hardware finishes them.

use crate::backend::{DecodeEngine, SyncStatus};
use crate::delivery::Delivery;
use crate::error::{EngineError, Result};
use crate::stats::PipelineStats;
use crate::surface_pool::SurfacePool;
use crate::types::{SurfaceId, SyncPoint};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A surface whose output has not been observed complete yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingOutput {
    pub surface: SurfaceId,
    pub sync: SyncPoint,
    pub submitted_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The oldest output completed and was handed to delivery
    Complete(SurfaceId),
    /// The oldest output did not complete within the timeout
    StillPending,
    /// Nothing in flight
    Empty,
}

pub struct Synchronizer {
    in_flight: VecDeque<PendingOutput>,
    soft_robust: bool,
}

impl Synchronizer {
    pub fn new(depth: usize, soft_robust: bool) -> Self {
        Self {
            in_flight: VecDeque::with_capacity(depth),
            soft_robust,
        }
    }

    pub fn push(&mut self, pending: PendingOutput) {
        self.in_flight.push_back(pending);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Forget all in-flight outputs; only valid once the engine is closed
    pub fn clear(&mut self) {
        self.in_flight.clear();
    }

    /// Wait up to `timeout` for the oldest output and hand it to `delivery`
    /// once complete
    pub fn wait(
        &mut self,
        engine: &mut dyn DecodeEngine,
        timeout: Duration,
        pool: &Mutex<SurfacePool>,
        delivery: &mut Delivery,
        stats: &PipelineStats,
    ) -> Result<SyncOutcome> {
        let Some(oldest) = self.in_flight.front().copied() else {
            return Ok(SyncOutcome::Empty);
        };

        match engine.sync(oldest.sync, timeout) {
            Ok(SyncStatus::Complete) => {}
            Ok(SyncStatus::Pending) => {
                log::trace!("surface {} still pending after {:?}", oldest.surface, timeout);
                stats.record_stall();
                return Ok(SyncOutcome::StillPending);
            }
            Err(EngineError::DeviceFault) if self.soft_robust => {
                log::warn!(
                    "device fault on surface {}, delivering possibly corrupt frame",
                    oldest.surface
                );
            }
            Err(e) => return Err(e.into()),
        }

        self.in_flight.pop_front();
        stats.record_synced(Some(oldest.submitted_at));
        delivery.complete(oldest.surface, pool, stats)?;
        Ok(SyncOutcome::Complete(oldest.surface))
    }
}
