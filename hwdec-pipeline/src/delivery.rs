//! Frame delivery: discard, inline sink call, or a background worker
//!
//! In render mode the sink (disk write or display present) runs on its own
//! thread so a slow present never starves the engine's command queue. The
//! producer hands completed surfaces over a bounded channel and may block on
//! the "delivery progressed" event when it runs out of free surfaces.

use crate::backend::{FrameAllocator, OutputSink};
use crate::config::{PipelineConfig, WorkMode};
use crate::error::{PipelineError, Result};
use crate::stats::PipelineStats;
use crate::surface_pool::SurfacePool;
use crate::types::{Frame, FrameInfo, MemId, SurfaceId};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Lock a surface for CPU access, hand it to the sink, unlock it
pub fn deliver_to_sink(
    sink: &mut dyn OutputSink,
    allocator: &dyn FrameAllocator,
    surface: SurfaceId,
    mem: MemId,
    info: &FrameInfo,
) -> Result<()> {
    let data = allocator.lock(mem)?;
    let frame = Frame {
        surface,
        mem,
        info,
        data: &data,
    };
    let delivered = sink.deliver(&frame);
    allocator.unlock(mem)?;
    delivered?;
    Ok(())
}

/// Delivery worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle = 0,
    Draining = 1,
    Stopped = 2,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Idle,
            1 => WorkerState::Draining,
            _ => WorkerState::Stopped,
        }
    }
}

/// "Delivery progressed" event
pub struct DeliveryProgress {
    count: Mutex<u64>,
    cond: Condvar,
}

impl DeliveryProgress {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn advance(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_all();
    }

    pub fn count(&self) -> u64 {
        *self.count.lock()
    }

    /// Wait until the count moves past `seen` or `timeout` elapses.
    /// Returns true if progress was made.
    pub fn wait_past(&self, seen: u64, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        if *count == seen {
            self.cond.wait_for(&mut count, timeout);
        }
        *count != seen
    }
}

struct WorkerShared {
    pool: Arc<Mutex<SurfacePool>>,
    allocator: Arc<dyn FrameAllocator>,
    stats: Arc<PipelineStats>,
    progress: DeliveryProgress,
    state: AtomicU8,
    stop: AtomicBool,
    reset_sink: AtomicBool,
    error: Mutex<Option<PipelineError>>,
}

impl WorkerShared {
    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn fail(&self, err: PipelineError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            log::error!("delivery failed: {}", err);
            *slot = Some(err);
        }
    }

    fn failed(&self) -> bool {
        self.error.lock().is_some()
    }
}

/// Background thread draining the ready FIFO into the sink
pub struct DeliveryWorker {
    tx: Option<Sender<SurfaceId>>,
    shared: Arc<WorkerShared>,
    thread_handle: Option<JoinHandle<Box<dyn OutputSink>>>,
}

impl DeliveryWorker {
    /// Spawn the worker; it owns `sink` until [`DeliveryWorker::shutdown`]
    pub fn spawn(
        sink: Box<dyn OutputSink>,
        pool: Arc<Mutex<SurfacePool>>,
        allocator: Arc<dyn FrameAllocator>,
        stats: Arc<PipelineStats>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let (tx, rx) = channel::bounded::<SurfaceId>(config.async_depth as usize);

        let shared = Arc::new(WorkerShared {
            pool,
            allocator,
            stats,
            progress: DeliveryProgress::new(),
            state: AtomicU8::new(WorkerState::Idle as u8),
            stop: AtomicBool::new(false),
            reset_sink: AtomicBool::new(false),
            error: Mutex::new(None),
        });

        let wake_interval = config.wait_interval;
        let frame_interval = config.frame_interval();
        let core = config.delivery_core;
        let worker = shared.clone();

        let thread_handle = thread::Builder::new()
            .name("hwdec-delivery".to_string())
            .spawn(move || {
                let mut sink = sink;
                if let Some(core) = core {
                    pin_to_core(core);
                }
                log::debug!("delivery worker started");

                let mut last_present: Option<Instant> = None;
                loop {
                    worker.set_state(WorkerState::Idle);
                    match rx.recv_timeout(wake_interval) {
                        Ok(id) => {
                            if worker.stop.load(Ordering::Acquire) {
                                break;
                            }
                            worker.set_state(WorkerState::Draining);
                            Self::deliver_one(&worker, sink.as_mut(), id, frame_interval, &mut last_present);
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if worker.stop.load(Ordering::Acquire) {
                                break;
                            }
                        }
                        // Producer dropped the sender after draining
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }

                worker.set_state(WorkerState::Stopped);
                log::info!("Delivery worker exiting");
                sink
            })
            .map_err(|e| PipelineError::worker(format!("failed to spawn delivery thread: {}", e)))?;

        Ok(DeliveryWorker {
            tx: Some(tx),
            shared,
            thread_handle: Some(thread_handle),
        })
    }

    fn deliver_one(
        worker: &WorkerShared,
        sink: &mut dyn OutputSink,
        id: SurfaceId,
        frame_interval: Option<Duration>,
        last_present: &mut Option<Instant>,
    ) {
        let claimed = {
            let mut pool = worker.pool.lock();
            pool.begin_delivery(id)
                .and_then(|_| pool.surface(id).map(|s| (s.mem, s.info)))
        };
        let (mem, info) = match claimed {
            Ok(claimed) => claimed,
            Err(e) => {
                worker.fail(e.into());
                return;
            }
        };

        let started = Instant::now();
        // After a failure surfaces are still recycled so the producer can
        // observe the error instead of starving
        if !worker.failed() {
            if worker.reset_sink.swap(false, Ordering::AcqRel) {
                if let Err(e) = sink.reset() {
                    worker.fail(e.into());
                }
            }

            if let (Some(interval), Some(last)) = (frame_interval, *last_present) {
                let next = last + interval;
                let now = Instant::now();
                if next > now {
                    thread::sleep(next - now);
                }
            }

            if let Err(e) = deliver_to_sink(sink, worker.allocator.as_ref(), id, mem, &info) {
                worker.fail(e);
            }
            *last_present = Some(Instant::now());
        }

        if let Err(e) = worker.pool.lock().release(id) {
            worker.fail(e.into());
        }
        worker.stats.record_delivered(started.elapsed());
        worker.progress.advance();
    }

    /// Queue a surface already marked ready in the pool
    pub fn submit(&self, id: SurfaceId) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| PipelineError::worker("worker already shut down"))?;
        tx.send(id)
            .map_err(|_| PipelineError::worker("delivery thread exited"))
    }

    pub fn progress(&self) -> &DeliveryProgress {
        &self.shared.progress
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// First delivery error, if any
    pub fn take_error(&self) -> Option<PipelineError> {
        self.shared.error.lock().take()
    }

    /// Reset the sink before the next frame it receives
    pub fn request_sink_reset(&self) {
        self.shared.reset_sink.store(true, Ordering::Release);
    }

    /// Stop the worker and take the sink back. Without `abort` all queued
    /// surfaces are delivered first.
    pub fn shutdown(&mut self, abort: bool) -> Option<Box<dyn OutputSink>> {
        if abort {
            self.shared.stop.store(true, Ordering::Release);
        }
        self.tx.take();

        let handle = self.thread_handle.take()?;
        match handle.join() {
            Ok(sink) => Some(sink),
            Err(_) => {
                log::error!("delivery thread panicked");
                None
            }
        }
    }
}

impl Drop for DeliveryWorker {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

fn pin_to_core(core: usize) {
    let pinned = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|c| c.id == core))
        .map(core_affinity::set_for_current)
        .unwrap_or(false);
    if !pinned {
        log::warn!("could not pin delivery worker to core {}", core);
    }
}

/// Where a completed surface goes
pub enum Delivery {
    /// Release immediately
    Discard,
    /// Sink call on the producer thread
    Inline {
        sink: Box<dyn OutputSink>,
        allocator: Arc<dyn FrameAllocator>,
        reset_pending: bool,
    },
    Worker(DeliveryWorker),
}

impl Delivery {
    /// Build the delivery path for `config.mode`
    pub fn for_mode(
        config: &PipelineConfig,
        sink: Option<Box<dyn OutputSink>>,
        pool: Arc<Mutex<SurfacePool>>,
        allocator: Arc<dyn FrameAllocator>,
        stats: Arc<PipelineStats>,
    ) -> Result<Self> {
        match (config.mode, sink) {
            (WorkMode::Performance, _) => Ok(Delivery::Discard),
            (WorkMode::FileDump, Some(sink)) => Ok(Delivery::Inline {
                sink,
                allocator,
                reset_pending: false,
            }),
            (WorkMode::Render, Some(sink)) => Ok(Delivery::Worker(DeliveryWorker::spawn(
                sink, pool, allocator, stats, config,
            )?)),
            (mode, None) => Err(PipelineError::config(format!(
                "{:?} mode needs an output sink",
                mode
            ))),
        }
    }

    /// Hand off a completed surface still marked used in the pool
    pub fn complete(
        &mut self,
        id: SurfaceId,
        pool: &Mutex<SurfacePool>,
        stats: &PipelineStats,
    ) -> Result<()> {
        match self {
            Delivery::Discard => {
                pool.lock().release(id)?;
                stats.record_delivered(Duration::ZERO);
            }
            Delivery::Inline {
                sink,
                allocator,
                reset_pending,
            } => {
                let (mem, info) = {
                    let pool = pool.lock();
                    let surface = pool.surface(id)?;
                    (surface.mem, surface.info)
                };
                if std::mem::take(reset_pending) {
                    sink.reset()?;
                }
                let started = Instant::now();
                let delivered = deliver_to_sink(sink.as_mut(), allocator.as_ref(), id, mem, &info);
                pool.lock().release(id)?;
                delivered?;
                stats.record_delivered(started.elapsed());
            }
            Delivery::Worker(worker) => {
                pool.lock().mark_ready(id)?;
                worker.submit(id)?;
            }
        }
        Ok(())
    }

    /// The source restarted; reset the sink before the next frame
    pub fn request_sink_reset(&mut self) {
        match self {
            Delivery::Discard => {}
            Delivery::Inline { reset_pending, .. } => *reset_pending = true,
            Delivery::Worker(worker) => worker.request_sink_reset(),
        }
    }

    pub fn worker(&self) -> Option<&DeliveryWorker> {
        match self {
            Delivery::Worker(worker) => Some(worker),
            _ => None,
        }
    }

    /// Error raised on the worker thread since the last check
    pub fn take_error(&self) -> Option<PipelineError> {
        self.worker().and_then(|w| w.take_error())
    }

    /// Stop delivery and recover the sink, along with any error the worker
    /// raised while draining
    pub fn finish(self, abort: bool) -> (Option<Box<dyn OutputSink>>, Option<PipelineError>) {
        match self {
            Delivery::Discard => (None, None),
            Delivery::Inline { sink, .. } => (Some(sink), None),
            Delivery::Worker(mut worker) => {
                let sink = worker.shutdown(abort);
                (sink, worker.take_error())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use crate::sysmem::SystemMemoryAllocator;
    use crate::types::{PixelFormat, SyncPoint};

    struct CountingSink {
        seen: Arc<Mutex<Vec<SurfaceId>>>,
        fail: bool,
    }

    impl OutputSink for CountingSink {
        fn deliver(&mut self, frame: &Frame<'_>) -> std::result::Result<(), SinkError> {
            assert!(frame.data.plane(0).is_some());
            if self.fail {
                return Err(SinkError::Rejected("disk full".into()));
            }
            self.seen.lock().push(frame.surface);
            Ok(())
        }
    }

    fn setup(count: usize) -> (Arc<Mutex<SurfacePool>>, Arc<SystemMemoryAllocator>) {
        let allocator = Arc::new(SystemMemoryAllocator::new());
        let info = FrameInfo::new(64, 64, PixelFormat::NV12);
        let handles = allocator.allocate(count, &info).unwrap();
        let pool = SurfacePool::new(&handles, info, &[], info);
        (Arc::new(Mutex::new(pool)), allocator)
    }

    fn submit_all(pool: &Mutex<SurfacePool>, n: usize) -> Vec<SurfaceId> {
        let mut pool = pool.lock();
        (0..n)
            .map(|i| {
                let id = pool.acquire_free().unwrap();
                pool.mark_submitted(id, Some(SyncPoint(i as u64))).unwrap();
                id
            })
            .collect()
    }

    fn render_config() -> PipelineConfig {
        PipelineConfig {
            mode: WorkMode::Render,
            wait_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[test]
    fn test_worker_delivers_in_fifo_order() {
        let (pool, allocator) = setup(4);
        let stats = Arc::new(PipelineStats::new(false));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Box::new(CountingSink { seen: seen.clone(), fail: false });

        let mut delivery = Delivery::for_mode(
            &render_config(),
            Some(sink),
            pool.clone(),
            allocator,
            stats.clone(),
        )
        .unwrap();

        let ids = submit_all(&pool, 4);
        for &id in &ids {
            delivery.complete(id, &pool, &stats).unwrap();
        }

        let (sink, error) = delivery.finish(false);
        assert!(sink.is_some());
        assert!(error.is_none());
        assert_eq!(*seen.lock(), ids);
        assert_eq!(stats.delivered(), 4);
        assert_eq!(pool.lock().free_count(), 4);
    }

    #[test]
    fn test_worker_error_still_recycles() {
        let (pool, allocator) = setup(2);
        let stats = Arc::new(PipelineStats::new(false));
        let sink = Box::new(CountingSink {
            seen: Arc::new(Mutex::new(Vec::new())),
            fail: true,
        });
        let mut worker =
            DeliveryWorker::spawn(sink, pool.clone(), allocator, stats.clone(), &render_config())
                .unwrap();

        for id in submit_all(&pool, 2) {
            pool.lock().mark_ready(id).unwrap();
            worker.submit(id).unwrap();
        }
        worker.shutdown(false);

        assert!(matches!(worker.take_error(), Some(PipelineError::Sink(_))));
        assert_eq!(pool.lock().free_count(), 2);
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_progress_event_times_out() {
        let progress = DeliveryProgress::new();
        assert!(!progress.wait_past(0, Duration::from_millis(5)));
        progress.advance();
        assert!(progress.wait_past(0, Duration::from_millis(5)));
        assert_eq!(progress.count(), 1);
    }

    #[test]
    fn test_inline_delivery_releases_surface() {
        let (pool, allocator) = setup(2);
        let stats = PipelineStats::new(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let config = PipelineConfig {
            mode: WorkMode::FileDump,
            ..Default::default()
        };
        let mut delivery = Delivery::for_mode(
            &config,
            Some(Box::new(CountingSink { seen: seen.clone(), fail: false })),
            pool.clone(),
            allocator,
            Arc::new(PipelineStats::new(false)),
        )
        .unwrap();

        let ids = submit_all(&pool, 1);
        delivery.complete(ids[0], &pool, &stats).unwrap();
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(stats.delivered(), 1);
        assert_eq!(pool.lock().free_count(), 2);
    }

    #[test]
    fn test_sink_required_outside_performance_mode() {
        let (pool, allocator) = setup(1);
        let config = PipelineConfig {
            mode: WorkMode::FileDump,
            ..Default::default()
        };
        let result = Delivery::for_mode(
            &config,
            None,
            pool,
            allocator,
            Arc::new(PipelineStats::new(false)),
        );
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }
}
