//! Throughput and latency statistics
//!
//! Counters are atomics so the delivery worker and the producer can update
//! them without sharing a lock, and readers never block either thread.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Cumulative pipeline statistics
pub struct PipelineStats {
    submitted: AtomicU64,
    synced: AtomicU64,
    delivered: AtomicU64,
    bytes: AtomicU64,
    stalls: AtomicU64,
    busy_retries: AtomicU64,
    reallocations: AtomicU64,
    reinitializations: AtomicU64,
    max_in_flight: AtomicUsize,

    // Nanoseconds spent reading input and inside the sink
    read_ns: AtomicU64,
    deliver_ns: AtomicU64,

    latency_enabled: bool,
    latencies: Mutex<Vec<Duration>>,
    started: Mutex<Option<Instant>>,
}

impl PipelineStats {
    pub fn new(latency_enabled: bool) -> Self {
        Self {
            submitted: AtomicU64::new(0),
            synced: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            stalls: AtomicU64::new(0),
            busy_retries: AtomicU64::new(0),
            reallocations: AtomicU64::new(0),
            reinitializations: AtomicU64::new(0),
            max_in_flight: AtomicUsize::new(0),
            read_ns: AtomicU64::new(0),
            deliver_ns: AtomicU64::new(0),
            latency_enabled,
            latencies: Mutex::new(Vec::new()),
            started: Mutex::new(None),
        }
    }

    /// Start the overall clock if it is not running yet
    pub fn start(&self) {
        self.started.lock().get_or_insert_with(Instant::now);
    }

    pub fn elapsed(&self) -> Duration {
        let started = *self.started.lock();
        started.map(|t| t.elapsed()).unwrap_or_default()
    }

    pub fn record_submitted(&self, in_flight: usize) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.max_in_flight.fetch_max(in_flight, Ordering::Relaxed);
    }

    /// A completion was observed; returns the new synced count
    pub fn record_synced(&self, submitted_at: Option<Instant>) -> u64 {
        if self.latency_enabled {
            if let Some(at) = submitted_at {
                self.latencies.lock().push(at.elapsed());
            }
        }
        self.synced.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn record_delivered(&self, spent: Duration) -> u64 {
        self.deliver_ns
            .fetch_add(spent.as_nanos() as u64, Ordering::Relaxed);
        self.delivered.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn record_read(&self, spent: Duration) {
        self.read_ns.fetch_add(spent.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_busy_retry(&self) {
        self.busy_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reallocation(&self) {
        self.reallocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reinitialization(&self) {
        self.reinitializations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn synced(&self) -> u64 {
        self.synced.load(Ordering::Acquire)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }

    /// Per-frame submit-to-completion latency, in completion order
    pub fn latency_series(&self) -> Vec<Duration> {
        self.latencies.lock().clone()
    }

    pub fn latency_summary(&self) -> Option<LatencySummary> {
        LatencySummary::from_series(&self.latencies.lock())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted(),
            synced: self.synced(),
            delivered: self.delivered(),
            bytes: self.bytes.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            busy_retries: self.busy_retries.load(Ordering::Relaxed),
            reallocations: self.reallocations.load(Ordering::Relaxed),
            reinitializations: self.reinitializations.load(Ordering::Relaxed),
            max_in_flight: self.max_in_flight.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            read_time: Duration::from_nanos(self.read_ns.load(Ordering::Relaxed)),
            deliver_time: Duration::from_nanos(self.deliver_ns.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub synced: u64,
    pub delivered: u64,
    pub bytes: u64,
    pub stalls: u64,
    pub busy_retries: u64,
    pub reallocations: u64,
    pub reinitializations: u64,
    pub max_in_flight: usize,
    pub elapsed: Duration,
    pub read_time: Duration,
    pub deliver_time: Duration,
}

impl StatsSnapshot {
    /// Delivered frames per second of wall time
    pub fn fps(&self) -> f64 {
        rate(self.delivered, self.elapsed)
    }

    /// Frames per second of time spent reading input
    pub fn read_fps(&self) -> f64 {
        rate(self.delivered, self.read_time)
    }

    /// Frames per second of time spent inside the sink
    pub fn deliver_fps(&self) -> f64 {
        rate(self.delivered, self.deliver_time)
    }
}

fn rate(frames: u64, time: Duration) -> f64 {
    let secs = time.as_secs_f64();
    if secs > 0.0 {
        frames as f64 / secs
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    pub frames: usize,
    pub avg: Duration,
    pub max: Duration,
    pub min: Duration,
}

impl LatencySummary {
    pub fn from_series(series: &[Duration]) -> Option<Self> {
        let max = *series.iter().max()?;
        let min = *series.iter().min()?;
        let total: Duration = series.iter().sum();
        Some(Self {
            frames: series.len(),
            avg: total / series.len() as u32,
            max,
            min,
        })
    }
}
