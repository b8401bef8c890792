//! Output sinks for tests and the demo binary

use crate::engine::FrameStamp;
use hwdec_pipeline::{Frame, OutputSink, PixelFormat, SinkError, SurfaceId};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// What a collecting sink saw for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveredFrame {
    pub number: u64,
    pub surface: SurfaceId,
    pub width: u32,
    pub height: u32,
    /// Format of the surface the frame arrived in
    pub format: Option<PixelFormat>,
}

/// Shared view of a [`CollectingSink`]'s history
#[derive(Debug, Clone, Default)]
pub struct Collected {
    frames: Arc<Mutex<Vec<DeliveredFrame>>>,
    resets: Arc<AtomicU64>,
}

impl Collected {
    pub fn frames(&self) -> Vec<DeliveredFrame> {
        self.frames.lock().clone()
    }

    pub fn numbers(&self) -> Vec<u64> {
        self.frames.lock().iter().map(|f| f.number).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }
}

/// Records the stamp of every delivered frame
pub struct CollectingSink {
    collected: Collected,
    delay: Duration,
    fail_at: Option<u64>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self {
            collected: Collected::default(),
            delay: Duration::ZERO,
            fail_at: None,
        }
    }

    /// Block this long in every delivery, like a display waiting for vsync
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Reject the frame with this number
    pub fn failing_at(mut self, number: u64) -> Self {
        self.fail_at = Some(number);
        self
    }

    pub fn collected(&self) -> Collected {
        self.collected.clone()
    }
}

impl Default for CollectingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputSink for CollectingSink {
    fn deliver(&mut self, frame: &Frame<'_>) -> Result<(), SinkError> {
        let stamp = frame
            .data
            .plane(0)
            .and_then(FrameStamp::read)
            .ok_or_else(|| SinkError::Rejected(format!("surface {} is not mapped", frame.surface)))?;

        if self.fail_at == Some(stamp.number) {
            return Err(SinkError::Rejected(format!("frame {}", stamp.number)));
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        self.collected.frames.lock().push(DeliveredFrame {
            number: stamp.number,
            surface: frame.surface,
            width: stamp.width,
            height: stamp.height,
            format: frame.info.format(),
        });
        Ok(())
    }

    fn reset(&mut self) -> Result<(), SinkError> {
        self.collected.resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Writes the visible rows of every plane, e.g. to a raw YUV file
pub struct RawWriterSink<W: Write + Send> {
    writer: W,
    frames: u64,
}

impl<W: Write + Send> RawWriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, frames: 0 }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> OutputSink for RawWriterSink<W> {
    fn deliver(&mut self, frame: &Frame<'_>) -> Result<(), SinkError> {
        let format = frame
            .info
            .format()
            .ok_or_else(|| SinkError::Rejected(format!("unknown fourcc {:#x}", frame.info.fourcc)))?;
        let visible = format.plane_layout(frame.info.crop_w, frame.info.crop_h);

        for (index, (row_bytes, rows)) in visible.into_iter().enumerate() {
            if row_bytes == 0 {
                break;
            }
            let Some(plane) = frame.data.plane(index) else {
                break;
            };
            let pitch = frame.data.pitch[index] as usize;
            for row in 0..rows as usize {
                let start = row * pitch;
                let line = plane
                    .get(start..start + row_bytes as usize)
                    .ok_or_else(|| SinkError::Rejected("plane shorter than crop".into()))?;
                self.writer.write_all(line)?;
            }
        }

        self.frames += 1;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}
