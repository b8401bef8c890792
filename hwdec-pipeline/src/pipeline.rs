//! Decode pipeline drive loop
//!
//! The producer thread reads input, submits work while free surfaces and
//! pipeline depth allow, and otherwise blocks (bounded) on the oldest
//! in-flight output. End of input and parameter changes both drain the
//! decoder; a parameter change then rebuilds the engine session and the
//! surface pool in place.

use crate::backend::{
    Bitstream, BitstreamSource, DecodeEngine, FrameAllocator, OutputSink, ReadStatus,
    SessionParams,
};
use crate::config::{Playback, PipelineConfig, WorkMode};
use crate::delivery::{Delivery, WorkerState};
use crate::error::{PipelineError, Result};
use crate::postproc::PostProcPlan;
use crate::scheduler::{Scheduler, SubmitOutcome};
use crate::stats::{LatencySummary, PipelineStats, StatsSnapshot};
use crate::surface_pool::{Location, PoolCounts, SurfaceKind, SurfacePool};
use crate::synchronizer::{SyncOutcome, Synchronizer};
use crate::types::{align16, StreamParams, SurfaceId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const BITSTREAM_CAPACITY: usize = 1024 * 1024;

/// Pipeline lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Streaming,
    /// No new submissions until in-flight work completes
    Draining,
    /// Engine session and pool being rebuilt
    Reinitializing,
    Stopped,
}

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    EndOfStream,
    FrameLimit,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub status: RunStatus,
    pub reinitializations: u64,
    pub reallocations: u64,
    pub stats: StatsSnapshot,
    pub latency: Option<LatencySummary>,
}

/// Where the parameters of the next session come from
#[derive(Debug, Clone, Copy)]
enum Reinit {
    /// Parse the sequence header at the front of the bitstream
    Header,
    Params(StreamParams),
}

/// Asynchronous decode pipeline over a fixed surface pool
pub struct DecodePipeline {
    config: PipelineConfig,
    engine: Box<dyn DecodeEngine>,
    allocator: Arc<dyn FrameAllocator>,
    source: Box<dyn BitstreamSource>,
    sink: Option<Box<dyn OutputSink>>,

    pool: Arc<Mutex<SurfacePool>>,
    stats: Arc<PipelineStats>,
    scheduler: Scheduler,
    synchronizer: Synchronizer,
    bitstream: Bitstream,

    session: Option<SessionParams>,
    plan: PostProcPlan,
    state: PipelineState,

    // Surfaces reserved for the next submission
    work: Option<SurfaceId>,
    aux: Option<SurfaceId>,
}

impl DecodePipeline {
    /// Read input until the engine recognizes a sequence header, then open
    /// the engine session and allocate the surface pool.
    ///
    /// `sink` is required in file-dump and render modes and ignored in
    /// performance mode.
    pub fn new(
        config: PipelineConfig,
        engine: Box<dyn DecodeEngine>,
        allocator: Arc<dyn FrameAllocator>,
        source: Box<dyn BitstreamSource>,
        sink: Option<Box<dyn OutputSink>>,
    ) -> Result<Self> {
        config.validate()?;
        if config.mode != WorkMode::Performance && sink.is_none() {
            return Err(PipelineError::config(format!(
                "{:?} mode needs an output sink",
                config.mode
            )));
        }

        let depth = config.async_depth as usize;
        let mut pipeline = DecodePipeline {
            scheduler: Scheduler::new(config.busy_retry_limit, config.busy_wait),
            synchronizer: Synchronizer::new(depth, config.soft_robust),
            stats: Arc::new(PipelineStats::new(config.track_latency)),
            config,
            engine,
            allocator,
            source,
            sink,
            pool: Arc::new(Mutex::new(SurfacePool::empty())),
            bitstream: Bitstream::with_capacity(BITSTREAM_CAPACITY),
            session: None,
            plan: PostProcPlan::None,
            state: PipelineState::Reinitializing,
            work: None,
            aux: None,
        };

        let params = pipeline.read_header()?;
        pipeline.reset(params)?;
        Ok(pipeline)
    }

    /// Tear down the engine session and the pool, then rebuild both for
    /// `stream`. In-flight work must have been drained.
    pub fn reset(&mut self, stream: StreamParams) -> Result<()> {
        self.state = PipelineState::Reinitializing;
        self.engine.close();
        self.release_surfaces();
        self.synchronizer.clear();

        let request = &self.config.postproc;
        let plan = PostProcPlan::resolve(&stream, request);
        let output_info = PostProcPlan::output_info(&stream, request);
        let (decode_info, postproc_info) = match plan {
            PostProcPlan::None => {
                let mut info = stream.frame;
                if let Some(format) = PostProcPlan::decoder_format(&stream, request) {
                    info.fourcc = format.fourcc();
                }
                (info, None)
            }
            PostProcPlan::Internal => (output_info, None),
            PostProcPlan::External => (stream.frame, Some(output_info)),
        };

        let session = SessionParams {
            stream,
            decode_info,
            postproc_info,
            internal_postproc: plan == PostProcPlan::Internal,
            async_depth: self.config.async_depth,
        };

        let (decode_count, aux_count) = self.surface_counts(plan, &session)?;
        self.engine.init(&session)?;

        let decode = self.allocator.allocate(decode_count, &decode_info)?;
        let aux = match postproc_info {
            Some(info) => match self.allocator.allocate(aux_count, &info) {
                Ok(handles) => handles,
                Err(e) => {
                    self.allocator.free(&decode);
                    return Err(e.into());
                }
            },
            None => Vec::new(),
        };

        *self.pool.lock() =
            SurfacePool::new(&decode, decode_info, &aux, postproc_info.unwrap_or_default());

        log::info!(
            "Session ready: {:?} {}x{}, {} decode + {} post-process surfaces, plan {:?}",
            stream.codec,
            stream.frame.crop_w,
            stream.frame.crop_h,
            decode.len(),
            aux.len(),
            plan
        );

        self.session = Some(session);
        self.plan = plan;
        self.state = PipelineState::Streaming;
        Ok(())
    }

    /// Surface counts of the decode and post-process pools
    fn surface_counts(&self, plan: PostProcPlan, session: &SessionParams) -> Result<(usize, usize)> {
        let depth = self.config.async_depth as usize;
        let mut decode = self.engine.query_min_surfaces(session)? + self.config.smoothing_margin();
        let mut aux = 0;

        if plan == PostProcPlan::External {
            let (vpp_in, vpp_out) = self.engine.query_postprocess_surfaces(session)?;
            if vpp_in < depth || vpp_out < depth {
                return Err(PipelineError::InsufficientSurfaces {
                    required: depth,
                    offered: vpp_in.min(vpp_out),
                });
            }
            // Post-process input overlaps with decode output by depth - 1
            decode = decode + vpp_in - depth + 1;
            aux = vpp_out;
            if self.config.mode == WorkMode::Render && depth == 1 {
                aux += 1;
            }
        }

        if decode < depth {
            return Err(PipelineError::InsufficientSurfaces {
                required: depth,
                offered: decode,
            });
        }
        Ok((decode, aux))
    }

    fn release_surfaces(&mut self) {
        self.work = None;
        self.aux = None;
        let mut pool = self.pool.lock();
        let handles = pool.handles();
        if !handles.is_empty() {
            self.allocator.free(&handles);
        }
        *pool = SurfacePool::empty();
    }

    fn read_input(&mut self) -> Result<ReadStatus> {
        self.bitstream.compact();
        let started = Instant::now();
        let status = self.source.read_next(&mut self.bitstream)?;
        self.stats.record_read(started.elapsed());
        Ok(status)
    }

    fn read_header(&mut self) -> Result<StreamParams> {
        loop {
            if let Some(params) = self.engine.decode_header(&mut self.bitstream)? {
                return Ok(params);
            }
            if self.read_input()? == ReadStatus::Eof {
                return Err(PipelineError::HeaderNotFound);
            }
        }
    }

    /// Decode until end of input, frame limit, or timeout. Every completed
    /// frame is delivered before this returns, on success or failure alike.
    pub fn run(&mut self) -> Result<RunSummary> {
        if self.state == PipelineState::Stopped {
            return Err(PipelineError::config("pipeline already ran to completion"));
        }

        self.stats.start();
        let sink = match self.config.mode {
            WorkMode::Performance => None,
            _ => self.sink.take(),
        };
        let mut delivery = Delivery::for_mode(
            &self.config,
            sink,
            self.pool.clone(),
            self.allocator.clone(),
            self.stats.clone(),
        )?;

        let result = self.drive(&mut delivery);
        self.unreserve_current();

        let (sink, worker_error) = delivery.finish(result.is_err());
        let flushed = match sink {
            Some(mut sink) => {
                let flushed = sink.finish();
                self.sink = Some(sink);
                flushed
            }
            None => Ok(()),
        };
        self.state = PipelineState::Stopped;

        let status = result?;
        if let Some(e) = worker_error {
            return Err(e);
        }
        flushed?;

        let stats = self.stats.snapshot();
        let summary = RunSummary {
            status,
            reinitializations: stats.reinitializations,
            reallocations: stats.reallocations,
            stats,
            latency: self.stats.latency_summary(),
        };

        log::info!(
            "Decoding finished ({:?}): {} frames in {:.3} s, {:.2} fps",
            status,
            stats.delivered,
            stats.elapsed.as_secs_f64(),
            stats.fps()
        );
        if let Some(latency) = summary.latency {
            log::info!(
                "Latency: AVG={:.3} ms, MAX={:.3} ms, MIN={:.3} ms",
                latency.avg.as_secs_f64() * 1000.0,
                latency.max.as_secs_f64() * 1000.0,
                latency.min.as_secs_f64() * 1000.0
            );
        }
        Ok(summary)
    }

    fn drive(&mut self, delivery: &mut Delivery) -> Result<RunStatus> {
        let depth = self.config.async_depth as usize;
        let deadline = match self.config.playback {
            Playback::For(duration) => Some(Instant::now() + duration),
            _ => None,
        };

        let mut need_input = true;
        let mut flushing = false;
        let mut reinit: Option<Reinit> = None;
        let mut read_since_reset = false;
        let mut busy_retries = 0u32;
        let mut next_progress = self.config.progress_interval;

        loop {
            if let Some(e) = delivery.take_error() {
                return Err(e);
            }
            self.report_progress(&mut next_progress);

            if let Some(limit) = self.config.frame_limit {
                if self.stats.submitted() >= limit {
                    if reinit.is_some() {
                        log::warn!("Frame limit reached with a reinitialization pending, ignoring it");
                    }
                    log::info!("Frame limit of {} reached", limit);
                    self.drain(delivery)?;
                    return Ok(RunStatus::FrameLimit);
                }
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.drain(delivery)?;
                return Ok(RunStatus::Timeout);
            }

            if need_input && !flushing {
                match self.read_input()? {
                    ReadStatus::Ok => read_since_reset = true,
                    ReadStatus::Eof => {
                        let restart = match self.config.playback {
                            Playback::Once => false,
                            Playback::Loop | Playback::For(_) => read_since_reset,
                        };
                        if restart {
                            log::info!("End of input, restarting source");
                            self.source.reset()?;
                            delivery.request_sink_reset();
                            read_since_reset = false;
                            continue;
                        }
                        log::debug!("End of input, flushing decoder");
                        self.state = PipelineState::Draining;
                        flushing = true;
                    }
                }
                need_input = false;
            }

            {
                let mut pool = self.pool.lock();
                let engine = self.engine.as_ref();
                pool.recycle_used(|mem| engine.holds_surface(mem));
                if self.work.is_none() {
                    self.work = Scheduler::acquire(&mut pool, engine, SurfaceKind::Decode);
                }
                if self.plan == PostProcPlan::External && self.aux.is_none() {
                    self.aux = Scheduler::acquire(&mut pool, engine, SurfaceKind::Aux);
                }
            }

            let aux_missing = self.plan == PostProcPlan::External && self.aux.is_none();
            let work = match self.work {
                Some(work) if !aux_missing && self.synchronizer.in_flight() < depth => work,
                _ => {
                    self.wait_for_room(delivery)?;
                    continue;
                }
            };

            let before = self.bitstream.len();
            let bitstream = if flushing {
                None
            } else {
                Some(&mut self.bitstream)
            };
            let outcome = self.scheduler.submit(
                self.engine.as_mut(),
                &self.pool,
                bitstream,
                work,
                self.aux,
                &self.stats,
            )?;
            self.stats
                .record_bytes(before.saturating_sub(self.bitstream.len()));
            self.refresh_reserved();

            if outcome != SubmitOutcome::DeviceBusy {
                busy_retries = 0;
            }

            match outcome {
                SubmitOutcome::Output(pending) => {
                    self.synchronizer.push(pending);
                    self.stats.record_submitted(self.synchronizer.in_flight());
                }
                SubmitOutcome::MoreSurface => {}
                SubmitOutcome::MoreData if flushing => {
                    self.drain(delivery)?;
                    match reinit.take() {
                        Some(source) => {
                            self.reinitialize(source)?;
                            flushing = false;
                        }
                        None => return Ok(RunStatus::EndOfStream),
                    }
                }
                SubmitOutcome::MoreData => need_input = true,
                SubmitOutcome::DeviceBusy => {
                    busy_retries += 1;
                    self.stats.record_busy_retry();
                    if busy_retries >= self.config.busy_retry_limit {
                        return Err(PipelineError::RetryExhausted {
                            what: "decode submission",
                            attempts: busy_retries,
                        });
                    }
                    log::debug!("device busy, retry {}", busy_retries);
                    if self.synchronizer.is_empty() {
                        thread::sleep(self.config.busy_wait);
                    } else {
                        self.synchronizer.wait(
                            self.engine.as_mut(),
                            self.config.wait_interval,
                            &self.pool,
                            delivery,
                            &self.stats,
                        )?;
                    }
                }
                SubmitOutcome::IncompatibleParam => {
                    log::info!("Stream parameters changed, draining for reinitialization");
                    self.state = PipelineState::Draining;
                    flushing = true;
                    reinit = Some(Reinit::Header);
                }
                SubmitOutcome::ReallocSurface => {
                    if let Err(e) = self.realloc_work_surface(work) {
                        log::warn!("Reallocation of surface {} failed ({}), reinitializing", work, e);
                        self.state = PipelineState::Draining;
                        flushing = true;
                        reinit = Some(Reinit::Params(self.engine.get_params()?));
                    }
                }
            }
        }
    }

    /// No surface or depth available: wait on the oldest output, or on the
    /// delivery worker when everything completed is still queued for it
    fn wait_for_room(&mut self, delivery: &mut Delivery) -> Result<()> {
        let outcome = self.synchronizer.wait(
            self.engine.as_mut(),
            self.config.wait_interval,
            &self.pool,
            delivery,
            &self.stats,
        )?;
        if outcome != SyncOutcome::Empty {
            return Ok(());
        }

        if let Some(worker) = delivery.worker() {
            let seen = worker.progress().count();
            if self.stats.delivered() < self.stats.synced() {
                if worker.state() == WorkerState::Stopped {
                    return Err(PipelineError::worker("delivery thread stopped"));
                }
                worker.progress().wait_past(seen, self.config.wait_interval);
                return Ok(());
            }
        }

        // Nothing in flight and nothing queued for delivery. The worker may
        // have returned surfaces since the last acquisition attempt.
        let engine = self.engine.as_ref();
        let pool = self.pool.lock();
        let usable = |kind: SurfaceKind| {
            pool.iter().any(|s| {
                s.kind == kind
                    && (s.location == Location::Free
                        || (s.location == Location::Used && s.lock_count == 0 && s.sync.is_none()))
                    && !engine.holds_surface(s.mem)
            })
        };
        let decode_ok = self.work.is_some() || usable(SurfaceKind::Decode);
        let aux_ok = self.plan != PostProcPlan::External || self.aux.is_some() || usable(SurfaceKind::Aux);
        if decode_ok && aux_ok {
            Ok(())
        } else {
            Err(PipelineError::SurfaceStarvation)
        }
    }

    /// Synchronize every in-flight output and wait for its delivery
    fn drain(&mut self, delivery: &mut Delivery) -> Result<()> {
        self.state = PipelineState::Draining;
        while !self.synchronizer.is_empty() {
            if let Some(e) = delivery.take_error() {
                return Err(e);
            }
            self.synchronizer.wait(
                self.engine.as_mut(),
                self.config.wait_interval,
                &self.pool,
                delivery,
                &self.stats,
            )?;
        }

        let Some(worker) = delivery.worker() else {
            return Ok(());
        };
        loop {
            let seen = worker.progress().count();
            if self.stats.delivered() >= self.stats.synced() {
                return Ok(());
            }
            if let Some(e) = worker.take_error() {
                return Err(e);
            }
            if worker.state() == WorkerState::Stopped {
                return Err(PipelineError::worker("delivery thread stopped while draining"));
            }
            worker.progress().wait_past(seen, self.config.wait_interval);
        }
    }

    fn reinitialize(&mut self, source: Reinit) -> Result<()> {
        self.state = PipelineState::Reinitializing;
        let params = match source {
            Reinit::Header => self.read_header()?,
            Reinit::Params(params) => params,
        };
        self.reset(params)?;
        self.stats.record_reinitialization();
        Ok(())
    }

    /// Grow the one surface the engine rejected to fit the new stream
    /// geometry, leaving the rest of the pool untouched
    fn realloc_work_surface(&mut self, id: SurfaceId) -> Result<()> {
        let params = self.engine.get_params()?;
        let frame = params.frame;

        let info = {
            let mut pool = self.pool.lock();
            let surface = pool.surface(id)?;
            let mut info = surface.info;
            info.crop_x = frame.crop_x;
            info.crop_y = frame.crop_y;
            info.crop_w = frame.crop_w;
            info.crop_h = frame.crop_h;
            info.width = align16(info.width.max(frame.width));
            info.height = align16(info.height.max(frame.height));

            let mem = self.allocator.realloc_one(surface.mem, &info)?;
            pool.realloc(id, mem, info)?;
            info
        };

        if let Some(session) = self.session.as_mut() {
            session.stream = params;
        }
        self.stats.record_reallocation();
        log::debug!(
            "Reallocated surface {} to {}x{} (crop {}x{})",
            id,
            info.width,
            info.height,
            info.crop_w,
            info.crop_h
        );
        Ok(())
    }

    /// Forget reservations the last submission consumed
    fn refresh_reserved(&mut self) {
        let pool = self.pool.lock();
        let reserved = |id: &SurfaceId| {
            pool.surface(*id)
                .map(|s| s.location == Location::Reserved)
                .unwrap_or(false)
        };
        self.work = self.work.filter(reserved);
        self.aux = self.aux.filter(reserved);
    }

    fn unreserve_current(&mut self) {
        let mut pool = self.pool.lock();
        for id in [self.work.take(), self.aux.take()].into_iter().flatten() {
            if let Err(e) = pool.unreserve(id) {
                log::warn!("could not return surface {}: {}", id, e);
            }
        }
    }

    fn report_progress(&self, next: &mut u64) {
        let interval = self.config.progress_interval;
        if interval == 0 {
            return;
        }
        let delivered = self.stats.delivered();
        if delivered >= *next {
            log::info!(
                "{} frames delivered, {:.2} fps",
                delivered,
                self.stats.snapshot().fps()
            );
            *next = delivered + interval;
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Parameters of the current engine session
    pub fn session(&self) -> Option<&SessionParams> {
        self.session.as_ref()
    }

    pub fn postproc_plan(&self) -> PostProcPlan {
        self.plan
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn frames_submitted(&self) -> u64 {
        self.stats.submitted()
    }

    pub fn frames_delivered(&self) -> u64 {
        self.stats.delivered()
    }

    pub fn total_bytes(&self) -> u64 {
        self.stats.snapshot().bytes
    }

    pub fn latency_series(&self) -> Vec<Duration> {
        self.stats.latency_series()
    }

    pub fn pool_counts(&self) -> PoolCounts {
        self.pool.lock().counts()
    }

    pub fn pool_capacity(&self) -> usize {
        self.pool.lock().capacity()
    }

    /// Visit every surface record, e.g. to inspect geometry
    pub fn with_pool<R>(&self, f: impl FnOnce(&SurfacePool) -> R) -> R {
        let pool = self.pool.lock();
        f(&pool)
    }

    /// Take the sink back after a run
    pub fn take_sink(&mut self) -> Option<Box<dyn OutputSink>> {
        self.sink.take()
    }
}

impl Drop for DecodePipeline {
    fn drop(&mut self) {
        self.engine.close();
        self.release_surfaces();
    }
}
