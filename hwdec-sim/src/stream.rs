//! Packetized test bitstream and an in-memory source for it
//!
//! Every packet is a [`PacketHeader`] followed by a fixed-size payload:
//! a [`SequencePayload`] for sequence headers, a [`FramePayload`] for
//! frames. All fields are little-endian plain data.

use bytemuck::{Pod, Zeroable};
use hwdec_pipeline::{
    Bitstream, BitstreamSource, CodecKind, FrameInfo, PixelFormat, ReadStatus, StreamParams,
};
use std::mem::size_of;

pub const PACKET_MAGIC: u32 = u32::from_le_bytes(*b"SIMP");

pub const KIND_SEQUENCE: u32 = 1;
pub const KIND_FRAME: u32 = 2;

/// Frame needs a larger surface than the pool was sized for
pub const FLAG_REALLOC: u32 = 1 << 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PacketHeader {
    pub magic: u32,
    pub kind: u32,
    pub payload_len: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SequencePayload {
    pub codec: u32,
    pub width: u32,
    pub height: u32,
    pub fourcc: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct FramePayload {
    pub number: u64,
    pub width: u32,
    pub height: u32,
    pub reserved: [u32; 2],
}

impl SequencePayload {
    pub fn params(&self) -> Option<StreamParams> {
        let format = PixelFormat::from_fourcc(self.fourcc)?;
        Some(StreamParams {
            codec: codec_from_u32(self.codec)?,
            frame: FrameInfo::new(self.width, self.height, format),
        })
    }
}

pub fn codec_to_u32(codec: CodecKind) -> u32 {
    match codec {
        CodecKind::Avc => 0,
        CodecKind::Hevc => 1,
        CodecKind::Mpeg2 => 2,
        CodecKind::Vc1 => 3,
        CodecKind::Jpeg => 4,
        CodecKind::Vp8 => 5,
        CodecKind::Vp9 => 6,
        CodecKind::Av1 => 7,
    }
}

pub fn codec_from_u32(value: u32) -> Option<CodecKind> {
    Some(match value {
        0 => CodecKind::Avc,
        1 => CodecKind::Hevc,
        2 => CodecKind::Mpeg2,
        3 => CodecKind::Vc1,
        4 => CodecKind::Jpeg,
        5 => CodecKind::Vp8,
        6 => CodecKind::Vp9,
        7 => CodecKind::Av1,
        _ => return None,
    })
}

/// One parsed packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    Sequence(SequencePayload),
    Frame { flags: u32, payload: FramePayload },
    /// Unrecognized bytes, skipped by the engine
    Garbage,
}

/// Parse the packet at the front of `bytes`. Returns the packet and its
/// total length, or `None` if the packet is incomplete.
pub fn peek_packet(bytes: &[u8]) -> Option<(Packet, usize)> {
    let head_len = size_of::<PacketHeader>();
    if bytes.len() < head_len {
        return None;
    }

    let head: PacketHeader = bytemuck::pod_read_unaligned(&bytes[..head_len]);
    if head.magic != PACKET_MAGIC {
        // Resynchronize one byte at a time
        return Some((Packet::Garbage, 1));
    }

    let total = head_len + head.payload_len as usize;
    if bytes.len() < total {
        return None;
    }
    let payload = &bytes[head_len..total];

    let packet = match head.kind {
        KIND_SEQUENCE if payload.len() == size_of::<SequencePayload>() => {
            Packet::Sequence(bytemuck::pod_read_unaligned(payload))
        }
        KIND_FRAME if payload.len() == size_of::<FramePayload>() => Packet::Frame {
            flags: head.flags,
            payload: bytemuck::pod_read_unaligned(payload),
        },
        _ => Packet::Garbage,
    };
    Some((packet, total))
}

/// Builder for test streams
pub struct StreamBuilder {
    bytes: Vec<u8>,
    codec: CodecKind,
    format: PixelFormat,
    width: u32,
    height: u32,
    next_frame: u64,
}

impl StreamBuilder {
    /// Start a stream with a sequence header
    pub fn new(codec: CodecKind, width: u32, height: u32, format: PixelFormat) -> Self {
        let mut builder = Self {
            bytes: Vec::new(),
            codec,
            format,
            width,
            height,
            next_frame: 0,
        };
        builder.push_sequence();
        builder
    }

    fn push_packet(&mut self, kind: u32, flags: u32, payload: &[u8]) {
        let head = PacketHeader {
            magic: PACKET_MAGIC,
            kind,
            payload_len: payload.len() as u32,
            flags,
        };
        self.bytes.extend_from_slice(bytemuck::bytes_of(&head));
        self.bytes.extend_from_slice(payload);
    }

    fn push_sequence(&mut self) {
        let seq = SequencePayload {
            codec: codec_to_u32(self.codec),
            width: self.width,
            height: self.height,
            fourcc: self.format.fourcc(),
        };
        self.push_packet(KIND_SEQUENCE, 0, bytemuck::bytes_of(&seq));
    }

    fn push_frame(&mut self, flags: u32, width: u32, height: u32) {
        let frame = FramePayload {
            number: self.next_frame,
            width,
            height,
            reserved: [0; 2],
        };
        self.next_frame += 1;
        self.push_packet(KIND_FRAME, flags, bytemuck::bytes_of(&frame));
    }

    /// Append `count` frames at the current geometry
    pub fn frames(mut self, count: usize) -> Self {
        for _ in 0..count {
            let (w, h) = (self.width, self.height);
            self.push_frame(0, w, h);
        }
        self
    }

    /// New sequence header with a different geometry. Frames after it
    /// require a full reinitialization.
    pub fn sequence_change(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self.push_sequence();
        self
    }

    /// One frame that does not fit the current surfaces
    pub fn oversized_frame(mut self, width: u32, height: u32) -> Self {
        self.push_frame(FLAG_REALLOC, width, height);
        self
    }

    /// Junk bytes the engine must skip
    pub fn garbage(mut self, len: usize) -> Self {
        self.bytes.extend(std::iter::repeat(0xA5).take(len));
        self
    }

    pub fn frame_count(&self) -> u64 {
        self.next_frame
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}

/// Bitstream source over an in-memory buffer, read in fixed-size chunks
pub struct MemorySource {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
}

impl MemorySource {
    pub fn new(data: Vec<u8>, chunk: usize) -> Self {
        Self {
            data,
            pos: 0,
            chunk: chunk.max(1),
        }
    }
}

impl BitstreamSource for MemorySource {
    fn read_next(&mut self, bitstream: &mut Bitstream) -> std::io::Result<ReadStatus> {
        if self.pos >= self.data.len() {
            return Ok(ReadStatus::Eof);
        }
        let end = (self.pos + self.chunk).min(self.data.len());
        bitstream.extend_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(ReadStatus::Ok)
    }

    fn reset(&mut self) -> std::io::Result<()> {
        self.pos = 0;
        Ok(())
    }
}
