//! Scriptable stand-in for a hardware decode engine
//!
//! Decoding a frame packet stamps a [`FrameStamp`] into the first bytes of
//! the work surface. Completion is simulated with a per-operation ready
//! time, so `sync` honors its timeout exactly like a device would.

use crate::stream::{peek_packet, Packet, FLAG_REALLOC};
use bytemuck::{Pod, Zeroable};
use hwdec_pipeline::{
    Bitstream, DecodeEngine, DecodeStatus, EngineError, FrameAllocator, FrameInfo, MemId,
    PixelFormat, PostProcessStatus, SessionParams, StreamParams, SyncPoint, SyncStatus,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Marker written into plane 0 of every decoded surface
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameStamp {
    pub number: u64,
    pub width: u32,
    pub height: u32,
}

impl FrameStamp {
    pub fn read(plane: &[u8]) -> Option<Self> {
        plane
            .get(..size_of::<Self>())
            .map(bytemuck::pod_read_unaligned)
    }

    fn write(&self, plane: &mut [u8]) -> bool {
        match plane.get_mut(..size_of::<Self>()) {
            Some(dst) => {
                dst.copy_from_slice(bytemuck::bytes_of(self));
                true
            }
            None => false,
        }
    }
}

/// Behavior of a simulated engine
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Time from submission to completion
    pub latency: Duration,
    /// Random extra latency, uniformly drawn up to this bound
    pub jitter: Duration,
    /// Frames held back before the first output
    pub reorder_depth: usize,
    pub min_surfaces: usize,
    /// (input, output) surface counts of the post-process stage
    pub postproc_surfaces: (usize, usize),
    /// Report busy once for every Nth frame
    pub busy_every: Option<u64>,
    /// Fail synchronization of this frame with a device fault
    pub fault_frame: Option<u64>,
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(2),
            jitter: Duration::ZERO,
            reorder_depth: 0,
            min_surfaces: 4,
            postproc_surfaces: (4, 4),
            busy_every: None,
            fault_frame: None,
            seed: 0x5eed,
        }
    }
}

/// Counters shared with the test harness after the engine is boxed
#[derive(Debug, Default)]
pub struct SimProbe {
    pub inits: AtomicU64,
    pub decoded: AtomicU64,
    pub postprocessed: AtomicU64,
    pub busy: AtomicU64,
}

struct Operation {
    ready_at: Instant,
    frame: u64,
}

pub struct SimEngine {
    config: SimConfig,
    allocator: Arc<dyn FrameAllocator>,
    probe: Arc<SimProbe>,
    rng: StdRng,

    session: Option<SessionParams>,
    params: Option<StreamParams>,
    reorder: VecDeque<(MemId, u64)>,
    operations: HashMap<u64, Operation>,
    next_sync: u64,
    busy_reported: Option<u64>,
}

impl SimEngine {
    pub fn new(config: SimConfig, allocator: Arc<dyn FrameAllocator>) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            allocator,
            probe: Arc::new(SimProbe::default()),
            session: None,
            params: None,
            reorder: VecDeque::new(),
            operations: HashMap::new(),
            next_sync: 1,
            busy_reported: None,
        }
    }

    pub fn probe(&self) -> Arc<SimProbe> {
        self.probe.clone()
    }

    fn schedule(&mut self, frame: u64) -> SyncPoint {
        let mut latency = self.config.latency;
        if !self.config.jitter.is_zero() {
            let extra = self.rng.gen_range(0..=self.config.jitter.as_micros() as u64);
            latency += Duration::from_micros(extra);
        }

        let token = self.next_sync;
        self.next_sync += 1;
        self.operations.insert(
            token,
            Operation {
                ready_at: Instant::now() + latency,
                frame,
            },
        );
        SyncPoint(token)
    }

    fn stamp(&self, surface: MemId, stamp: &FrameStamp) -> Result<(), EngineError> {
        let mut data = self.allocator.lock(surface).map_err(|e| EngineError::Failed {
            code: -1,
            context: format!("lock of {:?}: {}", surface, e),
        })?;
        let written = data.plane_mut(0).map(|p| stamp.write(p)).unwrap_or(false);
        self.allocator.unlock(surface).map_err(|e| EngineError::Failed {
            code: -1,
            context: format!("unlock of {:?}: {}", surface, e),
        })?;
        if written {
            Ok(())
        } else {
            Err(EngineError::NullHandle("decode_async"))
        }
    }

    fn read_stamp(&self, surface: MemId) -> Result<FrameStamp, EngineError> {
        let data = self.allocator.lock(surface).map_err(|e| EngineError::Failed {
            code: -1,
            context: format!("lock of {:?}: {}", surface, e),
        })?;
        let stamp = data.plane(0).and_then(FrameStamp::read);
        self.allocator.unlock(surface).map_err(|e| EngineError::Failed {
            code: -1,
            context: format!("unlock of {:?}: {}", surface, e),
        })?;
        stamp.ok_or(EngineError::NullHandle("postprocess_async"))
    }

    fn emit(&mut self) -> DecodeStatus {
        match self.reorder.pop_front() {
            Some((output, frame)) => DecodeStatus::Ready {
                output,
                sync: self.schedule(frame),
            },
            None => DecodeStatus::MoreData,
        }
    }
}

impl DecodeEngine for SimEngine {
    fn decode_header(&mut self, bitstream: &mut Bitstream) -> Result<Option<StreamParams>, EngineError> {
        while let Some((packet, len)) = peek_packet(bitstream.remaining()) {
            bitstream.consume(len);
            if let Packet::Sequence(seq) = packet {
                let params = seq
                    .params()
                    .ok_or_else(|| EngineError::Unsupported(format!("sequence {:?}", seq)))?;
                self.params = Some(params);
                return Ok(Some(params));
            }
        }
        Ok(None)
    }

    fn init(&mut self, params: &SessionParams) -> Result<(), EngineError> {
        self.session = Some(*params);
        self.params = Some(params.stream);
        self.reorder.clear();
        self.operations.clear();
        self.probe.inits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&mut self) {
        self.session = None;
        self.reorder.clear();
        self.operations.clear();
    }

    fn query_min_surfaces(&self, _params: &SessionParams) -> Result<usize, EngineError> {
        Ok(self.config.min_surfaces)
    }

    fn query_postprocess_surfaces(&self, _params: &SessionParams) -> Result<(usize, usize), EngineError> {
        Ok(self.config.postproc_surfaces)
    }

    fn decode_async(
        &mut self,
        bitstream: Option<&mut Bitstream>,
        surface: MemId,
        info: &FrameInfo,
    ) -> Result<DecodeStatus, EngineError> {
        let session = self.session.ok_or(EngineError::NotInitialized)?;
        let Some(bitstream) = bitstream else {
            return Ok(self.emit());
        };

        loop {
            let Some((packet, len)) = peek_packet(bitstream.remaining()) else {
                return Ok(DecodeStatus::MoreData);
            };

            match packet {
                Packet::Garbage => bitstream.consume(len),
                Packet::Sequence(seq) => {
                    // A repeated header (looping source) is ignored
                    if seq.params() == Some(session.stream) {
                        bitstream.consume(len);
                    } else {
                        return Ok(DecodeStatus::IncompatibleParam);
                    }
                }
                Packet::Frame { flags, payload } => {
                    if flags & FLAG_REALLOC != 0
                        && (info.width < payload.width || info.height < payload.height)
                    {
                        if let Some(params) = self.params.as_mut() {
                            params.frame = FrameInfo::new(
                                payload.width,
                                payload.height,
                                params.frame.format().unwrap_or(PixelFormat::NV12),
                            );
                        }
                        log::debug!(
                            "sim: frame {} needs {}x{}, surface is {}x{}",
                            payload.number,
                            payload.width,
                            payload.height,
                            info.width,
                            info.height
                        );
                        return Ok(DecodeStatus::ReallocSurface);
                    }

                    if let Some(n) = self.config.busy_every {
                        if n > 0
                            && payload.number % n == n - 1
                            && self.busy_reported != Some(payload.number)
                        {
                            self.busy_reported = Some(payload.number);
                            self.probe.busy.fetch_add(1, Ordering::Relaxed);
                            log::debug!("sim: busy on frame {}", payload.number);
                            return Ok(DecodeStatus::DeviceBusy);
                        }
                    }

                    bitstream.consume(len);
                    self.stamp(
                        surface,
                        &FrameStamp {
                            number: payload.number,
                            width: payload.width,
                            height: payload.height,
                        },
                    )?;
                    self.probe.decoded.fetch_add(1, Ordering::Relaxed);
                    self.reorder.push_back((surface, payload.number));

                    if self.reorder.len() > self.config.reorder_depth {
                        return Ok(self.emit());
                    }
                    return Ok(DecodeStatus::MoreSurface);
                }
            }
        }
    }

    fn postprocess_async(
        &mut self,
        input: MemId,
        output: MemId,
        output_info: &FrameInfo,
    ) -> Result<PostProcessStatus, EngineError> {
        if self.session.is_none() {
            return Err(EngineError::NotInitialized);
        }
        let mut stamp = self.read_stamp(input)?;
        stamp.width = output_info.crop_w;
        stamp.height = output_info.crop_h;
        self.stamp(output, &stamp)?;
        self.probe.postprocessed.fetch_add(1, Ordering::Relaxed);
        Ok(PostProcessStatus::Ready(self.schedule(stamp.number)))
    }

    fn sync(&mut self, sync: SyncPoint, timeout: Duration) -> Result<SyncStatus, EngineError> {
        let op = self.operations.get(&sync.0).ok_or_else(|| EngineError::Failed {
            code: -2,
            context: format!("sync on unknown token {}", sync.0),
        })?;

        let now = Instant::now();
        if op.ready_at > now + timeout {
            thread::sleep(timeout);
            return Ok(SyncStatus::Pending);
        }
        if op.ready_at > now {
            thread::sleep(op.ready_at - now);
        }

        let frame = op.frame;
        self.operations.remove(&sync.0);
        if self.config.fault_frame == Some(frame) {
            log::debug!("sim: injecting device fault on frame {}", frame);
            return Err(EngineError::DeviceFault);
        }
        Ok(SyncStatus::Complete)
    }

    fn get_params(&self) -> Result<StreamParams, EngineError> {
        self.params.ok_or(EngineError::NotInitialized)
    }

    fn holds_surface(&self, surface: MemId) -> bool {
        self.reorder.iter().any(|(mem, _)| *mem == surface)
    }
}
