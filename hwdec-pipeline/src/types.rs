//! Surface metadata types and handles shared by the pipeline and its backends

use bytemuck::{Pod, Zeroable};
use std::fmt;

/// Pixel format of a surface, stored as a little-endian FourCC code
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    NV12 = u32::from_le_bytes(*b"NV12"), // Semi-planar YUV 4:2:0
    I420 = u32::from_le_bytes(*b"I420"), // Planar YUV 4:2:0
    YUY2 = u32::from_le_bytes(*b"YUY2"), // Packed YUV 4:2:2
    P010 = u32::from_le_bytes(*b"P010"), // Semi-planar YUV 4:2:0 10-bit
    RGB4 = u32::from_le_bytes(*b"RGB4"), // Packed BGRA 8-bit
    Y410 = u32::from_le_bytes(*b"Y410"), // Packed YUV 4:4:4 10-bit
}

impl PixelFormat {
    pub fn from_fourcc(code: u32) -> Option<Self> {
        [
            PixelFormat::NV12,
            PixelFormat::I420,
            PixelFormat::YUY2,
            PixelFormat::P010,
            PixelFormat::RGB4,
            PixelFormat::Y410,
        ]
        .into_iter()
        .find(|f| *f as u32 == code)
    }

    pub fn fourcc(self) -> u32 {
        self as u32
    }

    /// Returns number of planes for this format
    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::I420 => 3,
            PixelFormat::NV12 | PixelFormat::P010 => 2,
            _ => 1,
        }
    }

    /// Bytes per luma sample (per pixel for packed formats)
    pub fn bytes_per_sample(self) -> usize {
        match self {
            PixelFormat::NV12 | PixelFormat::I420 => 1,
            PixelFormat::P010 | PixelFormat::YUY2 => 2,
            PixelFormat::RGB4 | PixelFormat::Y410 => 4,
        }
    }

    /// Row pitch and row count of each plane for a `width` x `height` surface
    pub fn plane_layout(self, width: u32, height: u32) -> [(u32, u32); 4] {
        let w = width;
        let h = height;
        let bps = self.bytes_per_sample() as u32;
        let mut planes = [(0, 0); 4];
        match self {
            PixelFormat::NV12 | PixelFormat::P010 => {
                planes[0] = (w * bps, h);
                planes[1] = (w * bps, h.div_ceil(2));
            }
            PixelFormat::I420 => {
                planes[0] = (w, h);
                planes[1] = (w.div_ceil(2), h.div_ceil(2));
                planes[2] = (w.div_ceil(2), h.div_ceil(2));
            }
            PixelFormat::YUY2 | PixelFormat::RGB4 | PixelFormat::Y410 => {
                planes[0] = (w * bps, h);
            }
        }
        planes
    }

    /// Calculate frame size in bytes
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        self.plane_layout(width, height)
            .iter()
            .map(|(pitch, rows)| *pitch as usize * *rows as usize)
            .sum()
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.fourcc().to_le_bytes();
        write!(f, "{}", String::from_utf8_lossy(&code))
    }
}

/// Picture structure of a decoded frame
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PicStruct {
    Unknown = 0,
    Progressive = 1,
    FieldTff = 2,
    FieldBff = 4,
}

/// Surface geometry. Plain data so backends can pass it across FFI
/// boundaries or stamp it into surface memory unchanged.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub crop_x: u32,
    pub crop_y: u32,
    pub crop_w: u32,
    pub crop_h: u32,
    pub fourcc: u32,    // PixelFormat as u32
    pub pic_struct: u32, // PicStruct as u32
}

impl FrameInfo {
    /// Geometry for a `width` x `height` picture; the allocation is rounded
    /// up to 16-pixel alignment while the crop keeps the visible size.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width: align16(width),
            height: align16(height),
            crop_x: 0,
            crop_y: 0,
            crop_w: width,
            crop_h: height,
            fourcc: format.fourcc(),
            pic_struct: PicStruct::Progressive as u32,
        }
    }

    pub fn format(&self) -> Option<PixelFormat> {
        PixelFormat::from_fourcc(self.fourcc)
    }

    /// True if a surface of this geometry can hold a picture of `other`
    pub fn fits(&self, other: &FrameInfo) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    pub fn frame_size(&self) -> usize {
        self.format()
            .map(|f| f.frame_size(self.width, self.height))
            .unwrap_or(0)
    }
}

pub fn align16(value: u32) -> u32 {
    (value + 15) & !15
}

/// Codec of the elementary stream being decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    Avc,
    Hevc,
    Mpeg2,
    Vc1,
    Jpeg,
    Vp8,
    Vp9,
    Av1,
}

/// Opaque backing-memory handle owned by the allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemId(pub u64);

/// Opaque completion token for one asynchronous hardware operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncPoint(pub u64);

/// Index of a surface record in the pool arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub usize);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stream parameters reported by the engine after parsing a sequence header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub codec: CodecKind,
    pub frame: FrameInfo,
}

/// CPU-visible mapping of a locked surface
#[derive(Debug, Clone, Copy)]
pub struct FrameData {
    pub data: [*mut u8; 4],
    pub pitch: [u32; 4],
    pub rows: [u32; 4],
}

unsafe impl Send for FrameData {}
unsafe impl Sync for FrameData {}

impl FrameData {
    pub fn empty() -> Self {
        Self {
            data: [std::ptr::null_mut(); 4],
            pitch: [0; 4],
            rows: [0; 4],
        }
    }

    /// Read-only view of one plane, `None` for unmapped planes
    pub fn plane(&self, index: usize) -> Option<&[u8]> {
        let ptr = *self.data.get(index)?;
        if ptr.is_null() {
            return None;
        }
        let len = self.pitch[index] as usize * self.rows[index] as usize;
        // Mapping stays valid between the allocator's lock and unlock calls,
        // which bracket every borrow of a FrameData handed to a sink.
        Some(unsafe { std::slice::from_raw_parts(ptr, len) })
    }

    /// Mutable view of one plane, used by backends that fill surfaces
    pub fn plane_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        let ptr = *self.data.get(index)?;
        if ptr.is_null() {
            return None;
        }
        let len = self.pitch[index] as usize * self.rows[index] as usize;
        Some(unsafe { std::slice::from_raw_parts_mut(ptr, len) })
    }
}

/// A completed surface handed to an output sink
#[derive(Debug)]
pub struct Frame<'a> {
    pub surface: SurfaceId,
    pub mem: MemId,
    pub info: &'a FrameInfo,
    pub data: &'a FrameData,
}
