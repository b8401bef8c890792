//! Collaborator interfaces: hardware engine, frame allocator, output sink
//! and bitstream source
//!
//! The pipeline never talks to a device API directly. Each graphics backend
//! (system memory, D3D, VA-API, ...) is one implementation of these traits,
//! chosen when the pipeline is constructed.

use crate::error::{AllocError, EngineError, SinkError};
use crate::types::{FrameData, FrameInfo, Frame, MemId, StreamParams, SyncPoint};
use std::time::Duration;

/// Growable compressed-data buffer consumed from the front by the engine
#[derive(Debug, Default, Clone)]
pub struct Bitstream {
    data: Vec<u8>,
    offset: usize,
}

impl Bitstream {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            offset: 0,
        }
    }

    /// Unconsumed bytes
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes consumed since the last `clear`
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Mark `n` bytes as consumed
    pub fn consume(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.data.len());
    }

    /// Drop consumed bytes so the buffer does not grow without bound
    pub fn compact(&mut self) {
        if self.offset > 0 {
            self.data.drain(..self.offset);
            self.offset = 0;
        }
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.offset = 0;
    }
}

/// Engine session parameters derived from the stream and configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    pub stream: StreamParams,
    /// Geometry of decode output surfaces
    pub decode_info: FrameInfo,
    /// Output geometry of the post-process stage, when one is configured
    pub postproc_info: Option<FrameInfo>,
    /// Let the decoder apply scaling/color conversion itself
    pub internal_postproc: bool,
    /// Pipeline depth
    pub async_depth: u16,
}

/// Result of a decode submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// Work accepted and a frame will be output to `output`
    Ready { output: MemId, sync: SyncPoint },
    /// Not enough bitstream; at flush, nothing left to output
    MoreData,
    /// Work accepted but no output yet; submit again with another surface
    MoreSurface,
    /// Transient saturation, retry the identical call after a sync
    DeviceBusy,
    /// Stream parameters changed, a full reinitialization is required
    IncompatibleParam,
    /// The work surface is too small for the new stream geometry
    ReallocSurface,
}

/// Result of a post-process submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProcessStatus {
    Ready(SyncPoint),
    MoreData,
    DeviceBusy,
}

/// Result of waiting on a completion token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Complete,
    /// Not observed complete within the timeout
    Pending,
}

/// Hardware decode and post-process engine
pub trait DecodeEngine: Send {
    /// Parse a sequence header from the front of `bitstream`; `Ok(None)`
    /// means more data is needed.
    fn decode_header(&mut self, bitstream: &mut Bitstream)
        -> Result<Option<StreamParams>, EngineError>;

    fn init(&mut self, params: &SessionParams) -> Result<(), EngineError>;

    fn close(&mut self);

    /// Minimum decode surfaces the engine needs for `params`
    fn query_min_surfaces(&self, params: &SessionParams) -> Result<usize, EngineError>;

    /// Suggested (input, output) surface counts of the post-process stage
    fn query_postprocess_surfaces(
        &self,
        params: &SessionParams,
    ) -> Result<(usize, usize), EngineError>;

    /// Submit decode work. `bitstream` is `None` to flush buffered frames.
    fn decode_async(
        &mut self,
        bitstream: Option<&mut Bitstream>,
        surface: MemId,
        info: &FrameInfo,
    ) -> Result<DecodeStatus, EngineError>;

    fn postprocess_async(
        &mut self,
        input: MemId,
        output: MemId,
        output_info: &FrameInfo,
    ) -> Result<PostProcessStatus, EngineError>;

    /// Wait up to `timeout` for the operation behind `sync` to complete
    fn sync(&mut self, sync: SyncPoint, timeout: Duration) -> Result<SyncStatus, EngineError>;

    /// Current stream parameters, queried after a reallocation request
    fn get_params(&self) -> Result<StreamParams, EngineError>;

    /// True while the engine still references `surface` internally
    /// (reordering or reference frames). Such surfaces are not recycled.
    fn holds_surface(&self, _surface: MemId) -> bool {
        false
    }
}

/// Allocator of hardware-addressable frame memory
pub trait FrameAllocator: Send + Sync {
    fn allocate(&self, count: usize, info: &FrameInfo) -> Result<Vec<MemId>, AllocError>;

    fn free(&self, handles: &[MemId]);

    /// Map a surface for CPU access
    fn lock(&self, handle: MemId) -> Result<FrameData, AllocError>;

    fn unlock(&self, handle: MemId) -> Result<(), AllocError>;

    /// Replace the backing memory of one surface with `info` geometry
    fn realloc_one(&self, handle: MemId, info: &FrameInfo) -> Result<MemId, AllocError>;
}

/// Destination of completed frames: a file writer or an on-screen renderer
pub trait OutputSink: Send {
    /// May block, e.g. on display refresh
    fn deliver(&mut self, frame: &Frame<'_>) -> Result<(), SinkError>;

    /// Called before the first frame after the source restarted
    fn reset(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Called once after the last frame of a run, e.g. to flush buffered
    /// output
    fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Ok,
    Eof,
}

/// Supplier of compressed data
pub trait BitstreamSource: Send {
    /// Append the next chunk to `bitstream`
    fn read_next(&mut self, bitstream: &mut Bitstream) -> std::io::Result<ReadStatus>;

    /// Rewind to the start of the stream
    fn reset(&mut self) -> std::io::Result<()>;
}
