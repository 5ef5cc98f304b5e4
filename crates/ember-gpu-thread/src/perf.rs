//! GPU performance counters.
//!
//! The worker accumulates presents and GPU time locally and publishes the
//! derived numbers through [`PerfShared`]. Recomputation is gated by a
//! single dirty flag either side can raise, so the division work happens
//! at most once per requested update rather than every frame.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

/// Producer-visible side of the counters. Values are `f32` bits so both
/// fields stay lock-free.
pub(crate) struct PerfShared {
    average_gpu_time_bits: AtomicU32,
    gpu_usage_bits: AtomicU32,
    /// Cleared to request a recomputation; the worker sets it back when it
    /// has refreshed the published values.
    updated: AtomicBool,
}

impl PerfShared {
    pub fn new() -> Self {
        Self {
            average_gpu_time_bits: AtomicU32::new(0),
            gpu_usage_bits: AtomicU32::new(0),
            updated: AtomicBool::new(false),
        }
    }

    /// Average GPU time per presented frame, in milliseconds.
    pub fn average_gpu_time(&self) -> f32 {
        f32::from_bits(self.average_gpu_time_bits.load(Ordering::Acquire))
    }

    /// GPU busy percentage over the last update window.
    pub fn gpu_usage(&self) -> f32 {
        f32::from_bits(self.gpu_usage_bits.load(Ordering::Acquire))
    }

    pub fn request_update(&self) {
        self.updated.store(false, Ordering::Release);
    }

    /// Returns true when the caller should recompute, claiming the update.
    pub fn take_update_request(&self) -> bool {
        !self.updated.swap(true, Ordering::AcqRel)
    }

    pub fn publish(&self, average_gpu_time: f32, gpu_usage: f32) {
        self.average_gpu_time_bits
            .store(average_gpu_time.to_bits(), Ordering::Release);
        self.gpu_usage_bits
            .store(gpu_usage.to_bits(), Ordering::Release);
    }
}

/// Worker-local accumulation window.
pub(crate) struct PerfWindow {
    pub last_update: Instant,
    pub presents_since_last_update: u32,
    /// Milliseconds of GPU time accumulated since the last update.
    pub accumulated_gpu_time: f32,
}

impl PerfWindow {
    pub fn new() -> Self {
        Self {
            last_update: Instant::now(),
            presents_since_last_update: 0,
            accumulated_gpu_time: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.last_update = Instant::now();
        self.presents_since_last_update = 0;
        self.accumulated_gpu_time = 0.0;
    }
}
