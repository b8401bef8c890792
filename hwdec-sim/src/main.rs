//! Decode a synthetic stream through the pipeline and print statistics
//!
//! Usage: hwdec-sim [frames] [performance|dump|render] [output.yuv]
//!
//! Set RUST_LOG=info (or debug) to see pipeline events.

use anyhow::{bail, Context, Result};
use hwdec_pipeline::{
    CodecKind, DecodePipeline, OutputSink, PipelineConfig, PixelFormat, SystemMemoryAllocator,
    WorkMode,
};
use hwdec_sim::{CollectingSink, MemorySource, RawWriterSink, SimConfig, SimEngine, StreamBuilder};
use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let frames: usize = match args.first() {
        Some(n) => n.parse().with_context(|| format!("invalid frame count {:?}", n))?,
        None => 300,
    };
    let mode = match args.get(1).map(String::as_str) {
        None | Some("performance") => WorkMode::Performance,
        Some("dump") => WorkMode::FileDump,
        Some("render") => WorkMode::Render,
        Some(other) => bail!("unknown mode {:?}", other),
    };

    let sink: Option<Box<dyn OutputSink>> = match (mode, args.get(2)) {
        (WorkMode::Performance, _) => None,
        (_, Some(path)) => {
            let file = File::create(path).with_context(|| format!("creating {}", path))?;
            Some(Box::new(RawWriterSink::new(BufWriter::new(file))))
        }
        (_, None) => Some(Box::new(CollectingSink::new())),
    };

    let stream = StreamBuilder::new(CodecKind::Hevc, 1280, 720, PixelFormat::NV12)
        .frames(frames)
        .build();

    let allocator = Arc::new(SystemMemoryAllocator::new());
    let engine = SimEngine::new(
        SimConfig {
            latency: Duration::from_millis(4),
            jitter: Duration::from_millis(2),
            reorder_depth: 2,
            min_surfaces: 8,
            ..Default::default()
        },
        allocator.clone(),
    );

    let config = PipelineConfig {
        mode,
        track_latency: true,
        max_fps: (mode == WorkMode::Render).then_some(120),
        progress_interval: 100,
        ..Default::default()
    };

    let mut pipeline = DecodePipeline::new(
        config,
        Box::new(engine),
        allocator,
        Box::new(MemorySource::new(stream, 64 * 1024)),
        sink,
    )?;
    let summary = pipeline.run()?;

    println!("status:      {:?}", summary.status);
    println!("frames:      {}", summary.stats.delivered);
    println!("fps:         {:.1}", summary.stats.fps());
    println!("bytes:       {}", summary.stats.bytes);
    println!("stalls:      {}", summary.stats.stalls);
    println!("max depth:   {}", summary.stats.max_in_flight);
    if let Some(latency) = summary.latency {
        println!(
            "latency:     avg {:?}, max {:?}, min {:?}",
            latency.avg, latency.max, latency.min
        );
    }
    Ok(())
}
