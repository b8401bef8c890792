//! Fixed-capacity surface pool
//!
//! Surfaces live in an arena addressed by [`SurfaceId`]. Pool membership
//! (free, used, ready, in delivery) is a per-record location plus free
//! lists for O(1) acquire and release. The total number of records never
//! changes between two reinitializations.

use crate::error::PoolError;
use crate::types::{FrameInfo, MemId, SurfaceId, SyncPoint};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// Which hardware stage a surface belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceKind {
    /// Decode output
    Decode,
    /// Post-process output
    Aux,
}

/// Pool a surface currently belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Free,
    /// Taken from the free set by the producer, not yet submitted
    Reserved,
    /// Submitted to the engine
    Used,
    /// Completed, queued for the sink
    Ready,
    /// Claimed by the delivery worker
    InDelivery,
}

impl Location {
    fn name(self) -> &'static str {
        match self {
            Location::Free => "free",
            Location::Reserved => "reserved",
            Location::Used => "used",
            Location::Ready => "ready",
            Location::InDelivery => "in delivery",
        }
    }
}

/// One hardware-addressable frame buffer and its bookkeeping
#[derive(Debug, Clone)]
pub struct Surface {
    pub id: SurfaceId,
    pub kind: SurfaceKind,
    pub mem: MemId,
    pub info: FrameInfo,
    pub sync: Option<SyncPoint>,
    pub lock_count: u16,
    pub location: Location,
    pub submitted_at: Option<Instant>,
}

/// Per-pool membership counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub free: usize,
    pub reserved: usize,
    pub used: usize,
    pub free_aux: usize,
    pub reserved_aux: usize,
    pub used_aux: usize,
    pub ready: usize,
    pub in_delivery: usize,
}

impl PoolCounts {
    pub fn total(&self) -> usize {
        self.free
            + self.reserved
            + self.used
            + self.free_aux
            + self.reserved_aux
            + self.used_aux
            + self.ready
            + self.in_delivery
    }
}

/// Pool of pre-allocated surfaces, recycled and never individually freed
pub struct SurfacePool {
    surfaces: Vec<Surface>,
    free: VecDeque<SurfaceId>,
    free_aux: VecDeque<SurfaceId>,
    by_handle: HashMap<MemId, SurfaceId>,
    aux_capacity: usize,
}

impl SurfacePool {
    /// Build a pool over allocator handles
    ///
    /// # Arguments
    /// * `decode` - Handles of decode output surfaces
    /// * `decode_info` - Geometry of decode surfaces
    /// * `aux` - Handles of post-process output surfaces, empty when no
    ///   second stage is configured
    /// * `aux_info` - Geometry of post-process surfaces
    pub fn new(decode: &[MemId], decode_info: FrameInfo, aux: &[MemId], aux_info: FrameInfo) -> Self {
        let mut pool = SurfacePool {
            surfaces: Vec::with_capacity(decode.len() + aux.len()),
            free: VecDeque::with_capacity(decode.len()),
            free_aux: VecDeque::with_capacity(aux.len()),
            by_handle: HashMap::with_capacity(decode.len() + aux.len()),
            aux_capacity: aux.len(),
        };

        for &mem in decode {
            let id = pool.push(SurfaceKind::Decode, mem, decode_info);
            pool.free.push_back(id);
        }
        for &mem in aux {
            let id = pool.push(SurfaceKind::Aux, mem, aux_info);
            pool.free_aux.push_back(id);
        }
        pool
    }

    /// Pool with no surfaces, used before the first allocation
    pub fn empty() -> Self {
        Self::new(&[], FrameInfo::default(), &[], FrameInfo::default())
    }

    fn push(&mut self, kind: SurfaceKind, mem: MemId, info: FrameInfo) -> SurfaceId {
        let id = SurfaceId(self.surfaces.len());
        self.surfaces.push(Surface {
            id,
            kind,
            mem,
            info,
            sync: None,
            lock_count: 0,
            location: Location::Free,
            submitted_at: None,
        });
        self.by_handle.insert(mem, id);
        id
    }

    /// Total surfaces, both stages
    pub fn capacity(&self) -> usize {
        self.surfaces.len()
    }

    pub fn aux_capacity(&self) -> usize {
        self.aux_capacity
    }

    pub fn has_aux(&self) -> bool {
        self.aux_capacity > 0
    }

    pub fn surface(&self, id: SurfaceId) -> Result<&Surface, PoolError> {
        self.surfaces.get(id.0).ok_or(PoolError::UnknownSurface(id))
    }

    fn surface_mut(&mut self, id: SurfaceId) -> Result<&mut Surface, PoolError> {
        self.surfaces.get_mut(id.0).ok_or(PoolError::UnknownSurface(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Surface> {
        self.surfaces.iter()
    }

    /// All backing handles, for returning them to the allocator
    pub fn handles(&self) -> Vec<MemId> {
        self.surfaces.iter().map(|s| s.mem).collect()
    }

    /// Take a free decode surface. Never blocks; `None` means the caller
    /// has to synchronize something before retrying.
    pub fn acquire_free(&mut self) -> Option<SurfaceId> {
        let id = self.free.pop_front()?;
        self.surfaces[id.0].location = Location::Reserved;
        Some(id)
    }

    /// Take a free post-process surface
    pub fn acquire_free_aux(&mut self) -> Option<SurfaceId> {
        let id = self.free_aux.pop_front()?;
        self.surfaces[id.0].location = Location::Reserved;
        Some(id)
    }

    /// Hand a reserved surface to the engine. With a completion token the
    /// surface also gains one lock, held until its delivery is released.
    pub fn mark_submitted(
        &mut self,
        id: SurfaceId,
        sync: Option<SyncPoint>,
    ) -> Result<(), PoolError> {
        let surface = self.surface_mut(id)?;
        expect_location(surface, Location::Reserved)?;
        surface.location = Location::Used;
        if let Some(sync) = sync {
            surface.sync = Some(sync);
            surface.lock_count += 1;
            surface.submitted_at = Some(Instant::now());
        }
        Ok(())
    }

    /// Attach a completion token to a surface the engine returned as output.
    /// The output may be a surface submitted earlier than the current one.
    pub fn attach_output(
        &mut self,
        id: SurfaceId,
        sync: SyncPoint,
        submitted_at: Instant,
    ) -> Result<(), PoolError> {
        let surface = self.surface_mut(id)?;
        expect_location(surface, Location::Used)?;
        surface.sync = Some(sync);
        surface.lock_count += 1;
        surface.submitted_at = Some(submitted_at);
        Ok(())
    }

    /// Reverse lookup of an engine-returned handle
    pub fn find_by_handle(&self, mem: MemId) -> Option<SurfaceId> {
        self.by_handle.get(&mem).copied()
    }

    /// Put a reserved surface back without submitting it
    pub fn unreserve(&mut self, id: SurfaceId) -> Result<(), PoolError> {
        let surface = self.surface_mut(id)?;
        expect_location(surface, Location::Reserved)?;
        surface.location = Location::Free;
        let kind = surface.kind;
        self.push_free(kind, id);
        Ok(())
    }

    fn push_free(&mut self, kind: SurfaceKind, id: SurfaceId) {
        match kind {
            SurfaceKind::Decode => self.free.push_back(id),
            SurfaceKind::Aux => self.free_aux.push_back(id),
        }
    }

    /// Completed surface enters the ready FIFO
    pub fn mark_ready(&mut self, id: SurfaceId) -> Result<(), PoolError> {
        let surface = self.surface_mut(id)?;
        expect_location(surface, Location::Used)?;
        if surface.sync.take().is_none() {
            return Err(PoolError::InvalidTransition {
                id,
                actual: "used without completion token",
                expected: "used with completion token",
            });
        }
        surface.location = Location::Ready;
        Ok(())
    }

    /// Delivery worker claims a ready surface
    pub fn begin_delivery(&mut self, id: SurfaceId) -> Result<(), PoolError> {
        let surface = self.surface_mut(id)?;
        expect_location(surface, Location::Ready)?;
        surface.location = Location::InDelivery;
        Ok(())
    }

    /// Drop one lock; at zero the surface returns to its free set
    pub fn release(&mut self, id: SurfaceId) -> Result<(), PoolError> {
        let surface = self.surface_mut(id)?;
        if surface.lock_count == 0 {
            return Err(PoolError::ReleaseUnlocked(id));
        }
        surface.lock_count -= 1;
        if surface.lock_count > 0 {
            return Ok(());
        }

        surface.sync = None;
        surface.submitted_at = None;
        surface.location = Location::Free;
        let kind = surface.kind;
        self.push_free(kind, id);
        Ok(())
    }

    /// Return used surfaces that carry no lock and that the engine no longer
    /// references. Returns the number of surfaces recycled.
    pub fn recycle_used<F>(&mut self, engine_holds: F) -> usize
    where
        F: Fn(MemId) -> bool,
    {
        let mut recycled = 0;
        for surface in self.surfaces.iter_mut() {
            if surface.location == Location::Used
                && surface.lock_count == 0
                && surface.sync.is_none()
                && !engine_holds(surface.mem)
            {
                surface.location = Location::Free;
                match surface.kind {
                    SurfaceKind::Decode => self.free.push_back(surface.id),
                    SurfaceKind::Aux => self.free_aux.push_back(surface.id),
                }
                recycled += 1;
            }
        }
        recycled
    }

    /// Swap the backing memory and geometry of one surface
    pub fn realloc(&mut self, id: SurfaceId, mem: MemId, info: FrameInfo) -> Result<(), PoolError> {
        let surface = self.surface_mut(id)?;
        let old = surface.mem;
        surface.mem = mem;
        surface.info = info;
        self.by_handle.remove(&old);
        self.by_handle.insert(mem, id);
        Ok(())
    }

    pub fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts::default();
        for surface in &self.surfaces {
            let aux = surface.kind == SurfaceKind::Aux;
            match (surface.location, aux) {
                (Location::Free, false) => counts.free += 1,
                (Location::Free, true) => counts.free_aux += 1,
                (Location::Reserved, false) => counts.reserved += 1,
                (Location::Reserved, true) => counts.reserved_aux += 1,
                (Location::Used, false) => counts.used += 1,
                (Location::Used, true) => counts.used_aux += 1,
                (Location::Ready, _) => counts.ready += 1,
                (Location::InDelivery, _) => counts.in_delivery += 1,
            }
        }
        counts
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn free_aux_count(&self) -> usize {
        self.free_aux.len()
    }
}

fn expect_location(surface: &Surface, expected: Location) -> Result<(), PoolError> {
    if surface.location == expected {
        Ok(())
    } else {
        Err(PoolError::InvalidTransition {
            id: surface.id,
            actual: surface.location.name(),
            expected: expected.name(),
        })
    }
}
