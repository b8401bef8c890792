//! Decode submission, optionally chained into the post-process stage

use crate::backend::{Bitstream, DecodeEngine, DecodeStatus, PostProcessStatus};
use crate::error::{PipelineError, PoolError, Result};
use crate::stats::PipelineStats;
use crate::surface_pool::{SurfaceKind, SurfacePool};
use crate::synchronizer::PendingOutput;
use crate::types::SurfaceId;
use parking_lot::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Result of one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A frame will complete on `PendingOutput::sync`
    Output(PendingOutput),
    /// Supply more bitstream; during a flush, nothing is left to output
    MoreData,
    /// Accepted without output, submit again with another surface
    MoreSurface,
    /// Synchronize something, then retry the identical submission
    DeviceBusy,
    /// Stream parameters changed, drain and reinitialize
    IncompatibleParam,
    /// The work surface is too small, reallocate it and retry
    ReallocSurface,
}

/// Issues work against the engine using surfaces reserved from the pool
pub struct Scheduler {
    busy_retry_limit: u32,
    busy_wait: Duration,
}

impl Scheduler {
    pub fn new(busy_retry_limit: u32, busy_wait: Duration) -> Self {
        Self {
            busy_retry_limit,
            busy_wait,
        }
    }

    /// Reserve a free surface the engine no longer references. Surfaces the
    /// engine still holds are rotated to the back of the free set.
    pub fn acquire(
        pool: &mut SurfacePool,
        engine: &dyn DecodeEngine,
        kind: SurfaceKind,
    ) -> Option<SurfaceId> {
        let candidates = match kind {
            SurfaceKind::Decode => pool.free_count(),
            SurfaceKind::Aux => pool.free_aux_count(),
        };

        for _ in 0..candidates {
            let id = match kind {
                SurfaceKind::Decode => pool.acquire_free()?,
                SurfaceKind::Aux => pool.acquire_free_aux()?,
            };
            let mem = pool.surface(id).ok()?.mem;
            if !engine.holds_surface(mem) {
                return Some(id);
            }
            pool.unreserve(id).ok()?;
        }
        None
    }

    /// Submit decode work on the reserved `work` surface. With `aux` set, a
    /// decoded frame is chained into the post-process stage writing to `aux`.
    ///
    /// `work` leaves the reserved state when the engine accepted it, that
    /// is on `Output`, `MoreSurface`, and `MoreData` outside a flush.
    pub fn submit(
        &self,
        engine: &mut dyn DecodeEngine,
        pool: &Mutex<SurfacePool>,
        bitstream: Option<&mut Bitstream>,
        work: SurfaceId,
        aux: Option<SurfaceId>,
        stats: &PipelineStats,
    ) -> Result<SubmitOutcome> {
        let (mem, info) = {
            let pool = pool.lock();
            let surface = pool.surface(work)?;
            (surface.mem, surface.info)
        };
        let flushing = bitstream.is_none();

        let status = engine.decode_async(bitstream, mem, &info)?;
        log::trace!("decode on {} returned {:?}", work, status);

        match status {
            DecodeStatus::Ready { output, sync } => {
                let submitted_at = Instant::now();
                let output = {
                    let mut pool = pool.lock();
                    pool.mark_submitted(work, None)?;
                    // The engine may hand back an earlier surface it had been
                    // holding for reordering
                    let id = pool
                        .find_by_handle(output)
                        .ok_or(PoolError::UnknownHandle(output))?;
                    pool.attach_output(id, sync, submitted_at)?;
                    id
                };

                let pending = PendingOutput {
                    surface: output,
                    sync,
                    submitted_at,
                };
                match aux {
                    None => Ok(SubmitOutcome::Output(pending)),
                    Some(aux) => self.postprocess(engine, pool, pending, aux, stats),
                }
            }
            DecodeStatus::MoreData => {
                if !flushing {
                    pool.lock().mark_submitted(work, None)?;
                }
                Ok(SubmitOutcome::MoreData)
            }
            DecodeStatus::MoreSurface => {
                pool.lock().mark_submitted(work, None)?;
                Ok(SubmitOutcome::MoreSurface)
            }
            DecodeStatus::DeviceBusy => Ok(SubmitOutcome::DeviceBusy),
            DecodeStatus::IncompatibleParam => Ok(SubmitOutcome::IncompatibleParam),
            DecodeStatus::ReallocSurface => Ok(SubmitOutcome::ReallocSurface),
        }
    }

    /// Chain a decoded frame into the post-process stage. The decode surface
    /// is released as soon as the engine accepts the post-process call.
    fn postprocess(
        &self,
        engine: &mut dyn DecodeEngine,
        pool: &Mutex<SurfacePool>,
        decoded: PendingOutput,
        aux: SurfaceId,
        stats: &PipelineStats,
    ) -> Result<SubmitOutcome> {
        let (input, output, output_info) = {
            let pool = pool.lock();
            let out = pool.surface(aux)?;
            (pool.surface(decoded.surface)?.mem, out.mem, out.info)
        };

        let mut attempts = 0;
        loop {
            match engine.postprocess_async(input, output, &output_info)? {
                PostProcessStatus::Ready(sync) => {
                    let mut pool = pool.lock();
                    pool.release(decoded.surface)?;
                    pool.mark_submitted(aux, Some(sync))?;
                    return Ok(SubmitOutcome::Output(PendingOutput {
                        surface: aux,
                        sync,
                        submitted_at: decoded.submitted_at,
                    }));
                }
                // e.g. deinterlacing wants the next field first
                PostProcessStatus::MoreData => {
                    pool.lock().release(decoded.surface)?;
                    return Ok(SubmitOutcome::MoreSurface);
                }
                PostProcessStatus::DeviceBusy => {
                    attempts += 1;
                    stats.record_busy_retry();
                    if attempts >= self.busy_retry_limit {
                        return Err(PipelineError::RetryExhausted {
                            what: "post-process submission",
                            attempts,
                        });
                    }
                    log::debug!("post-process busy, retry {}", attempts);
                    thread::sleep(self.busy_wait);
                }
            }
        }
    }
}
