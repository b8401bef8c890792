//! End-to-end pipeline benchmarks against a zero-latency simulated engine
//!
//! Measures the per-frame bookkeeping cost of the producer loop and the
//! delivery worker hand-off.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hwdec_pipeline::{
    CodecKind, DecodePipeline, OutputSink, PipelineConfig, PixelFormat, SystemMemoryAllocator,
    WorkMode,
};
use hwdec_sim::{CollectingSink, MemorySource, SimConfig, SimEngine, StreamBuilder};
use std::sync::Arc;
use std::time::Duration;

const FRAMES: usize = 200;

fn run_once(mode: WorkMode, stream: &[u8]) -> u64 {
    let allocator = Arc::new(SystemMemoryAllocator::new());
    let engine = SimEngine::new(
        SimConfig {
            latency: Duration::ZERO,
            min_surfaces: 8,
            ..Default::default()
        },
        allocator.clone(),
    );
    let sink: Option<Box<dyn OutputSink>> = match mode {
        WorkMode::Performance => None,
        _ => Some(Box::new(CollectingSink::new())),
    };

    let mut pipeline = DecodePipeline::new(
        PipelineConfig {
            mode,
            ..Default::default()
        },
        Box::new(engine),
        allocator,
        Box::new(MemorySource::new(stream.to_vec(), 4096)),
        sink,
    )
    .unwrap();
    pipeline.run().unwrap().stats.delivered
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_320x240");
    group.throughput(Throughput::Elements(FRAMES as u64));

    let stream = StreamBuilder::new(CodecKind::Avc, 320, 240, PixelFormat::NV12)
        .frames(FRAMES)
        .build();

    for mode in [WorkMode::Performance, WorkMode::FileDump, WorkMode::Render].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{:?}", mode)),
            mode,
            |b, &mode| {
                b.iter(|| black_box(run_once(mode, &stream)));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_decode);
criterion_main!(benches);
