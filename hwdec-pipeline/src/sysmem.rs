//! System-memory frame allocator with alignment for SIMD consumers
//!
//! Backend for software engines and for sinks that read frames on the CPU.
//! Every surface is one contiguous aligned block holding all planes.

use crate::backend::FrameAllocator;
use crate::error::AllocError;
use crate::types::{FrameData, FrameInfo, MemId};
use parking_lot::Mutex;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

const FRAME_ALIGNMENT: usize = 32; // AVX2 requires 32-byte alignment

struct Allocation {
    ptr: *mut u8,
    layout: Layout,
    info: FrameInfo,
    locks: u32,
}

unsafe impl Send for Allocation {}

impl Allocation {
    fn new(info: &FrameInfo) -> Result<Self, AllocError> {
        let size = info.frame_size();
        if size == 0 {
            return Err(AllocError::InvalidGeometry {
                width: info.width,
                height: info.height,
            });
        }

        let layout = Layout::from_size_align(size, FRAME_ALIGNMENT).map_err(|_| {
            AllocError::InvalidGeometry {
                width: info.width,
                height: info.height,
            }
        })?;

        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(AllocError::OutOfMemory { count: 1, bytes: size });
        }

        Ok(Self {
            ptr,
            layout,
            info: *info,
            locks: 0,
        })
    }

    fn map(&self) -> FrameData {
        let mut frame = FrameData::empty();
        let Some(format) = self.info.format() else {
            return frame;
        };

        let mut offset = 0usize;
        for (i, (pitch, rows)) in format
            .plane_layout(self.info.width, self.info.height)
            .into_iter()
            .enumerate()
        {
            if pitch == 0 {
                break;
            }
            // Planes are laid out back to back inside one block
            frame.data[i] = unsafe { self.ptr.add(offset) };
            frame.pitch[i] = pitch;
            frame.rows[i] = rows;
            offset += pitch as usize * rows as usize;
        }
        frame
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }
}

/// Allocator backed by aligned heap blocks
pub struct SystemMemoryAllocator {
    surfaces: Mutex<HashMap<MemId, Allocation>>,
    next_id: AtomicU64,
}

impl SystemMemoryAllocator {
    pub fn new() -> Self {
        Self {
            surfaces: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of live allocations
    pub fn live(&self) -> usize {
        self.surfaces.lock().len()
    }

    /// Geometry a handle was allocated with
    pub fn info(&self, handle: MemId) -> Option<FrameInfo> {
        self.surfaces.lock().get(&handle).map(|a| a.info)
    }

    fn next_handle(&self) -> MemId {
        MemId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SystemMemoryAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAllocator for SystemMemoryAllocator {
    fn allocate(&self, count: usize, info: &FrameInfo) -> Result<Vec<MemId>, AllocError> {
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            blocks.push(Allocation::new(info).map_err(|e| match e {
                AllocError::OutOfMemory { bytes, .. } => AllocError::OutOfMemory { count, bytes },
                other => other,
            })?);
        }

        let mut surfaces = self.surfaces.lock();
        let handles = blocks
            .into_iter()
            .map(|block| {
                let handle = self.next_handle();
                surfaces.insert(handle, block);
                handle
            })
            .collect::<Vec<_>>();

        log::debug!(
            "allocated {} {}x{} surfaces ({} bytes each)",
            count,
            info.width,
            info.height,
            info.frame_size()
        );
        Ok(handles)
    }

    fn free(&self, handles: &[MemId]) {
        let mut surfaces = self.surfaces.lock();
        for handle in handles {
            if let Some(block) = surfaces.remove(handle) {
                if block.locks > 0 {
                    log::warn!("freeing surface {:?} while still mapped", handle);
                }
            }
        }
    }

    fn lock(&self, handle: MemId) -> Result<FrameData, AllocError> {
        let mut surfaces = self.surfaces.lock();
        let block = surfaces
            .get_mut(&handle)
            .ok_or(AllocError::UnknownHandle(handle))?;
        block.locks += 1;
        Ok(block.map())
    }

    fn unlock(&self, handle: MemId) -> Result<(), AllocError> {
        let mut surfaces = self.surfaces.lock();
        let block = surfaces
            .get_mut(&handle)
            .ok_or(AllocError::UnknownHandle(handle))?;
        block.locks = block.locks.saturating_sub(1);
        Ok(())
    }

    fn realloc_one(&self, handle: MemId, info: &FrameInfo) -> Result<MemId, AllocError> {
        let block = Allocation::new(info)?;
        let mut surfaces = self.surfaces.lock();
        if surfaces.remove(&handle).is_none() {
            return Err(AllocError::UnknownHandle(handle));
        }
        let new_handle = self.next_handle();
        surfaces.insert(new_handle, block);
        Ok(new_handle)
    }
}
