//! End-to-end scenarios against the simulated engine

use hwdec_pipeline::{
    AllocError, CodecKind, DecodePipeline, DecoderPostProc, EngineError, FrameAllocator, FrameData,
    FrameInfo, MemId, OutputSink, PipelineConfig, PipelineError, PipelineState, PixelFormat,
    Playback, PostProcPlan, PostProcRequest, RunStatus, SinkError, SystemMemoryAllocator, WorkMode,
};
use hwdec_sim::{
    Collected, CollectingSink, MemorySource, RawWriterSink, SimConfig, SimEngine, SimProbe,
    StreamBuilder,
};
use std::io::{self, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    pipeline: DecodePipeline,
    collected: Option<Collected>,
    probe: Arc<SimProbe>,
}

fn config(mode: WorkMode) -> PipelineConfig {
    PipelineConfig {
        mode,
        wait_interval: Duration::from_millis(5),
        ..Default::default()
    }
}

fn sim(latency_ms: u64) -> SimConfig {
    SimConfig {
        latency: Duration::from_millis(latency_ms),
        ..Default::default()
    }
}

fn avc(frames: usize) -> StreamBuilder {
    StreamBuilder::new(CodecKind::Avc, 320, 240, PixelFormat::NV12).frames(frames)
}

fn assemble(
    config: PipelineConfig,
    sim: SimConfig,
    bytes: Vec<u8>,
    allocator: Arc<dyn FrameAllocator>,
    sink: Option<Box<dyn OutputSink>>,
) -> Result<(DecodePipeline, Arc<SimProbe>), PipelineError> {
    let engine = SimEngine::new(sim, allocator.clone());
    let probe = engine.probe();
    let pipeline = DecodePipeline::new(
        config,
        Box::new(engine),
        allocator,
        Box::new(MemorySource::new(bytes, 100)),
        sink,
    )?;
    Ok((pipeline, probe))
}

fn try_build(
    config: PipelineConfig,
    sim: SimConfig,
    bytes: Vec<u8>,
    sink: Option<CollectingSink>,
) -> Result<Harness, PipelineError> {
    let collected = sink.as_ref().map(|s| s.collected());
    let sink = sink.map(|s| Box::new(s) as Box<dyn OutputSink>);
    let (pipeline, probe) = assemble(
        config,
        sim,
        bytes,
        Arc::new(SystemMemoryAllocator::new()),
        sink,
    )?;
    Ok(Harness {
        pipeline,
        collected,
        probe,
    })
}

fn build(
    config: PipelineConfig,
    sim: SimConfig,
    bytes: Vec<u8>,
    sink: Option<CollectingSink>,
) -> Harness {
    try_build(config, sim, bytes, sink).unwrap()
}

#[test]
fn test_backpressure_stalls_at_depth() {
    let config = PipelineConfig {
        async_depth: 3,
        ..config(WorkMode::Performance)
    };
    let mut h = build(config, sim(30), avc(10).build(), None);
    assert_eq!(h.pipeline.pool_capacity(), 4);

    let summary = h.pipeline.run().unwrap();

    assert_eq!(summary.status, RunStatus::EndOfStream);
    assert_eq!(summary.stats.delivered, 10);
    assert!(summary.stats.stalls > 0, "producer never waited on a pending output");
    assert!(summary.stats.max_in_flight <= 3);
    assert_eq!(h.pipeline.state(), PipelineState::Stopped);
}

#[test]
fn test_param_change_drains_and_reinitializes() {
    let bytes = avc(4).sequence_change(640, 480).frames(6).build();
    let mut h = build(
        config(WorkMode::FileDump),
        sim(2),
        bytes,
        Some(CollectingSink::new()),
    );

    let summary = h.pipeline.run().unwrap();

    assert_eq!(summary.status, RunStatus::EndOfStream);
    assert_eq!(summary.reinitializations, 1);
    assert_eq!(h.probe.inits.load(Ordering::Relaxed), 2);

    let frames = h.collected.unwrap().frames();
    assert_eq!(frames.len(), 10);
    assert_eq!(
        frames.iter().map(|f| f.number).collect::<Vec<_>>(),
        (0..10).collect::<Vec<_>>()
    );
    assert!(frames[..4].iter().all(|f| f.width == 320));
    assert!(frames[4..].iter().all(|f| f.width == 640));

    let session = h.pipeline.session().unwrap();
    assert_eq!(session.stream.frame.crop_w, 640);
}

#[test]
fn test_realloc_touches_single_surface() {
    let bytes = avc(2).oversized_frame(640, 480).frames(7).build();
    let mut h = build(
        config(WorkMode::FileDump),
        sim(2),
        bytes,
        Some(CollectingSink::new()),
    );

    let summary = h.pipeline.run().unwrap();
    assert_eq!(summary.reallocations, 1);
    assert_eq!(summary.reinitializations, 0);
    assert_eq!(summary.stats.delivered, 10);

    let (grown, untouched) = h.pipeline.with_pool(|pool| {
        let grown: Vec<_> = pool.iter().filter(|s| s.info.width != 320).map(|s| s.info).collect();
        let untouched = pool.iter().filter(|s| s.info.width == 320 && s.info.height == 240).count();
        (grown, untouched)
    });
    assert_eq!(grown.len(), 1);
    assert_eq!((grown[0].width, grown[0].height), (640, 480));
    assert_eq!(untouched, h.pipeline.pool_capacity() - 1);

    let frames = h.collected.unwrap().frames();
    assert_eq!(frames[2].width, 640);
}

#[test]
fn test_render_delivers_in_submission_order() {
    let sim = SimConfig {
        latency: Duration::from_millis(3),
        jitter: Duration::from_millis(5),
        reorder_depth: 2,
        min_surfaces: 8,
        ..Default::default()
    };
    let sink = CollectingSink::new().with_delay(Duration::from_millis(1));
    let mut h = build(config(WorkMode::Render), sim, avc(30).build(), Some(sink));

    let summary = h.pipeline.run().unwrap();
    assert_eq!(summary.stats.delivered, 30);
    assert_eq!(h.collected.unwrap().numbers(), (0..30).collect::<Vec<_>>());

    let counts = h.pipeline.pool_counts();
    assert_eq!(counts.total(), h.pipeline.pool_capacity());
    assert_eq!(counts.ready, 0);
    assert_eq!(counts.in_delivery, 0);
    assert!(h.pipeline.take_sink().is_some());
}

#[test]
fn test_render_with_slow_sink_starved_pool() {
    // Every surface ends up queued behind the sink at some point
    let config = PipelineConfig {
        async_depth: 2,
        ..config(WorkMode::Render)
    };
    let sim = SimConfig {
        latency: Duration::from_millis(1),
        min_surfaces: 2,
        ..Default::default()
    };
    let sink = CollectingSink::new().with_delay(Duration::from_millis(8));
    let mut h = build(config, sim, avc(12).build(), Some(sink));

    let summary = h.pipeline.run().unwrap();
    assert_eq!(summary.stats.delivered, 12);
    assert_eq!(h.collected.unwrap().numbers(), (0..12).collect::<Vec<_>>());
}

#[test]
fn test_device_fault_is_fatal_by_default() {
    let sim = SimConfig {
        fault_frame: Some(3),
        ..sim(1)
    };
    let mut h = build(config(WorkMode::Performance), sim, avc(10).build(), None);

    let result = h.pipeline.run();
    assert!(matches!(
        result,
        Err(PipelineError::Engine(EngineError::DeviceFault))
    ));
    assert_eq!(h.pipeline.state(), PipelineState::Stopped);
}

#[test]
fn test_soft_robust_delivers_faulted_frame() {
    let config = PipelineConfig {
        soft_robust: true,
        ..config(WorkMode::FileDump)
    };
    let sim = SimConfig {
        fault_frame: Some(3),
        ..sim(1)
    };
    let mut h = build(config, sim, avc(10).build(), Some(CollectingSink::new()));

    let summary = h.pipeline.run().unwrap();
    assert_eq!(summary.stats.delivered, 10);
    assert!(h.collected.unwrap().numbers().contains(&3));
}

#[test]
fn test_frame_limit_stops_early() {
    let config = PipelineConfig {
        frame_limit: Some(12),
        ..config(WorkMode::Render)
    };
    let mut h = build(config, sim(1), avc(50).build(), Some(CollectingSink::new()));

    let summary = h.pipeline.run().unwrap();
    assert_eq!(summary.status, RunStatus::FrameLimit);
    assert_eq!(summary.stats.delivered, 12);
    assert_eq!(h.collected.unwrap().len(), 12);
}

#[test]
fn test_loop_playback_restarts_source() {
    let config = PipelineConfig {
        playback: Playback::Loop,
        frame_limit: Some(13),
        ..config(WorkMode::FileDump)
    };
    let mut h = build(config, sim(1), avc(5).build(), Some(CollectingSink::new()));

    let summary = h.pipeline.run().unwrap();
    assert_eq!(summary.status, RunStatus::FrameLimit);

    let collected = h.collected.unwrap();
    assert_eq!(
        collected.numbers(),
        vec![0, 1, 2, 3, 4, 0, 1, 2, 3, 4, 0, 1, 2]
    );
    assert!(collected.resets() >= 1);
    assert_eq!(summary.reinitializations, 0);
}

#[test]
fn test_timed_playback() {
    let config = PipelineConfig {
        playback: Playback::For(Duration::from_millis(150)),
        ..config(WorkMode::Performance)
    };
    let mut h = build(config, sim(1), avc(5).build(), None);

    let summary = h.pipeline.run().unwrap();
    assert_eq!(summary.status, RunStatus::Timeout);
    assert!(summary.stats.delivered > 5);
}

#[test]
fn test_external_postprocess_chain() {
    let config = PipelineConfig {
        postproc: PostProcRequest {
            output_size: Some((160, 120)),
            ..Default::default()
        },
        ..config(WorkMode::Render)
    };
    let mut h = build(config, sim(2), avc(10).build(), Some(CollectingSink::new()));
    assert_eq!(h.pipeline.postproc_plan(), PostProcPlan::External);
    // 4 minimum + 4 post-process input - depth 4 + 1
    assert_eq!(h.pipeline.pool_capacity(), 5 + 4);

    let summary = h.pipeline.run().unwrap();
    assert_eq!(summary.stats.delivered, 10);
    assert_eq!(h.probe.postprocessed.load(Ordering::Relaxed), 10);

    let frames = h.collected.unwrap().frames();
    assert!(frames.iter().all(|f| (f.width, f.height) == (160, 120)));
    assert_eq!(
        frames.iter().map(|f| f.number).collect::<Vec<_>>(),
        (0..10).collect::<Vec<_>>()
    );
    let counts = h.pipeline.pool_counts();
    assert_eq!(counts.total(), 9);
    assert_eq!(counts.used_aux, 0);
}

#[test]
fn test_internal_postprocess_for_avc() {
    let config = PipelineConfig {
        postproc: PostProcRequest {
            output_size: Some((160, 120)),
            decoder_postproc: DecoderPostProc::Auto,
            ..Default::default()
        },
        ..config(WorkMode::Performance)
    };
    let mut h = build(config, sim(1), avc(6).build(), None);

    assert_eq!(h.pipeline.postproc_plan(), PostProcPlan::Internal);
    let session = *h.pipeline.session().unwrap();
    assert!(session.internal_postproc);
    assert_eq!(session.decode_info.crop_w, 160);
    assert!(session.postproc_info.is_none());

    let summary = h.pipeline.run().unwrap();
    assert_eq!(summary.stats.delivered, 6);
    assert_eq!(h.probe.postprocessed.load(Ordering::Relaxed), 0);
}

#[test]
fn test_busy_submissions_are_retried() {
    let sim = SimConfig {
        busy_every: Some(3),
        ..sim(1)
    };
    let mut h = build(config(WorkMode::FileDump), sim, avc(9).build(), Some(CollectingSink::new()));

    let summary = h.pipeline.run().unwrap();
    assert_eq!(summary.stats.delivered, 9);
    assert_eq!(h.probe.busy.load(Ordering::Relaxed), 3);
    assert!(summary.stats.busy_retries >= 3);
    assert_eq!(h.collected.unwrap().numbers(), (0..9).collect::<Vec<_>>());
}

#[test]
fn test_sink_failure_stops_render_run() {
    let sink = CollectingSink::new().failing_at(4);
    let mut h = build(config(WorkMode::Render), sim(1), avc(20).build(), Some(sink));

    let result = h.pipeline.run();
    assert!(matches!(
        result,
        Err(PipelineError::Sink(SinkError::Rejected(_)))
    ));
    assert_eq!(h.collected.unwrap().numbers(), vec![0, 1, 2, 3]);
    assert!(h.pipeline.take_sink().is_some());
}

#[test]
fn test_latency_and_byte_statistics() {
    let config = PipelineConfig {
        track_latency: true,
        ..config(WorkMode::Performance)
    };
    let bytes = avc(8).garbage(7).frames(2).build();
    let total = bytes.len() as u64;
    let mut h = build(config, sim(3), bytes, None);

    let summary = h.pipeline.run().unwrap();
    assert_eq!(summary.stats.delivered, 10);
    assert_eq!(h.pipeline.latency_series().len(), 10);

    let latency = summary.latency.unwrap();
    assert_eq!(latency.frames, 10);
    assert!(latency.min > Duration::ZERO);
    assert!(latency.max >= latency.avg && latency.avg >= latency.min);

    // Everything except the initial sequence header goes through decode
    assert!(h.pipeline.total_bytes() > 0);
    assert!(h.pipeline.total_bytes() < total);
    assert_eq!(h.pipeline.frames_submitted(), 10);
}

#[test]
fn test_insufficient_surfaces_rejected() {
    let sim = SimConfig {
        min_surfaces: 2,
        ..Default::default()
    };
    let result = try_build(config(WorkMode::Performance), sim, avc(1).build(), None);
    assert!(matches!(
        result,
        Err(PipelineError::InsufficientSurfaces { required: 4, offered: 2 })
    ));
}

#[test]
fn test_missing_header() {
    let bytes = StreamBuilder::new(CodecKind::Avc, 64, 64, PixelFormat::NV12)
        .build()
        .split_off(16);
    let result = try_build(config(WorkMode::Performance), SimConfig::default(), bytes, None);
    assert!(matches!(result, Err(PipelineError::HeaderNotFound)));
}

#[test]
fn test_sink_required_for_dump_mode() {
    let result = try_build(config(WorkMode::FileDump), SimConfig::default(), avc(1).build(), None);
    assert!(matches!(result, Err(PipelineError::Config(_))));
}

#[test]
fn test_second_run_rejected() {
    let mut h = build(config(WorkMode::Performance), sim(1), avc(2).build(), None);
    h.pipeline.run().unwrap();
    assert!(matches!(h.pipeline.run(), Err(PipelineError::Config(_))));
}

/// System memory that cannot grow a single surface in place
struct NoRealloc(SystemMemoryAllocator);

impl FrameAllocator for NoRealloc {
    fn allocate(&self, count: usize, info: &FrameInfo) -> Result<Vec<MemId>, AllocError> {
        self.0.allocate(count, info)
    }

    fn free(&self, handles: &[MemId]) {
        self.0.free(handles)
    }

    fn lock(&self, handle: MemId) -> Result<FrameData, AllocError> {
        self.0.lock(handle)
    }

    fn unlock(&self, handle: MemId) -> Result<(), AllocError> {
        self.0.unlock(handle)
    }

    fn realloc_one(&self, _handle: MemId, info: &FrameInfo) -> Result<MemId, AllocError> {
        Err(AllocError::OutOfMemory {
            count: 1,
            bytes: info.frame_size(),
        })
    }
}

#[test]
fn test_failed_realloc_falls_back_to_reinit() {
    let sink = CollectingSink::new();
    let collected = sink.collected();
    let bytes = avc(2).oversized_frame(640, 480).frames(7).build();
    let (mut pipeline, probe) = assemble(
        config(WorkMode::FileDump),
        sim(2),
        bytes,
        Arc::new(NoRealloc(SystemMemoryAllocator::new())),
        Some(Box::new(sink)),
    )
    .unwrap();

    let summary = pipeline.run().unwrap();
    assert_eq!(summary.status, RunStatus::EndOfStream);
    assert_eq!(summary.reallocations, 0);
    assert_eq!(summary.reinitializations, 1);
    assert_eq!(probe.inits.load(Ordering::Relaxed), 2);
    assert_eq!(collected.numbers(), (0..10).collect::<Vec<_>>());

    // The new session is sized from the engine's updated parameters
    let session = pipeline.session().unwrap();
    assert_eq!(session.stream.frame.crop_w, 640);
    assert!(pipeline.with_pool(|pool| pool.iter().all(|s| s.info.width == 640)));
}

#[test]
fn test_decode_busy_retry_bound() {
    let config = PipelineConfig {
        busy_retry_limit: 1,
        ..config(WorkMode::Performance)
    };
    let sim = SimConfig {
        busy_every: Some(3),
        ..sim(1)
    };
    let mut h = build(config, sim, avc(9).build(), None);

    let result = h.pipeline.run();
    assert!(matches!(
        result,
        Err(PipelineError::RetryExhausted {
            what: "decode submission",
            attempts: 1
        })
    ));
    assert_eq!(h.probe.busy.load(Ordering::Relaxed), 1);
    assert_eq!(h.pipeline.state(), PipelineState::Stopped);
}

#[test]
fn test_engine_holding_every_surface_starves() {
    let sim = SimConfig {
        reorder_depth: 4,
        min_surfaces: 4,
        ..sim(1)
    };
    let mut h = build(config(WorkMode::Performance), sim, avc(10).build(), None);
    assert_eq!(h.pipeline.pool_capacity(), 4);

    let result = h.pipeline.run();
    assert!(matches!(result, Err(PipelineError::SurfaceStarvation)));
    assert_eq!(h.probe.decoded.load(Ordering::Relaxed), 4);
    assert_eq!(h.pipeline.frames_delivered(), 0);
}

#[test]
fn test_jpeg_decoder_writes_rgb4() {
    let config = PipelineConfig {
        postproc: PostProcRequest {
            output_format: Some(PixelFormat::RGB4),
            ..Default::default()
        },
        ..config(WorkMode::FileDump)
    };
    let bytes = StreamBuilder::new(CodecKind::Jpeg, 320, 240, PixelFormat::NV12)
        .frames(6)
        .build();
    let mut h = build(config, sim(1), bytes, Some(CollectingSink::new()));

    assert_eq!(h.pipeline.postproc_plan(), PostProcPlan::None);
    let session = *h.pipeline.session().unwrap();
    assert_eq!(session.decode_info.format(), Some(PixelFormat::RGB4));
    assert_eq!(session.stream.frame.format(), Some(PixelFormat::NV12));

    h.pipeline.run().unwrap();
    let frames = h.collected.unwrap().frames();
    assert_eq!(frames.len(), 6);
    assert!(frames.iter().all(|f| f.format == Some(PixelFormat::RGB4)));
}

/// Writer whose final flush fails, like a disk filling up
struct FailingFlush;

impl Write for FailingFlush {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Other, "no space left"))
    }
}

#[test]
fn test_sink_flush_error_fails_run() {
    let sink: Box<dyn OutputSink> = Box::new(RawWriterSink::new(FailingFlush));
    let (mut pipeline, _) = assemble(
        config(WorkMode::FileDump),
        sim(1),
        avc(3).build(),
        Arc::new(SystemMemoryAllocator::new()),
        Some(sink),
    )
    .unwrap();

    let result = pipeline.run();
    assert!(matches!(result, Err(PipelineError::Sink(SinkError::Io(_)))));
    assert_eq!(pipeline.frames_delivered(), 3);
    assert!(pipeline.take_sink().is_some());
}
