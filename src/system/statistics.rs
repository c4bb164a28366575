//! Runtime statistics: lock-free counters updated by the lanes and a
//! snapshot recomputed on a fixed interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::points::Sample;
use crate::tracking::TrackingQuality;

/// Point-in-time pipeline summary. Each refresh replaces the previous one.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineSnapshot {
    /// Frames per second since the last statistics reset.
    pub frame_rate: f64,
    /// Mean queue-to-insert latency of extraction jobs, milliseconds.
    pub latency_ms: f64,
    pub points_per_second: f64,
    pub voxel_count: usize,
    pub memory_estimate_bytes: usize,
    pub quality: TrackingQuality,
    pub frames_received: u64,
    pub frames_dropped: u64,
}

#[derive(Debug, Default)]
pub(crate) struct PipelineCounters {
    pub frames_received: AtomicU64,
    pub frames_since_reset: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub points_since_update: AtomicU64,
    pub latency_us_sum: AtomicU64,
    pub latency_samples: AtomicU64,
    /// Extraction jobs queued or running.
    pub pending_extractions: AtomicU64,
    idle_lock: Mutex<()>,
    idle: Condvar,
}

impl PipelineCounters {
    pub fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.frames_since_reset.fetch_add(1, Ordering::Relaxed);
    }

    /// A frame whose queued extraction was refused.
    pub fn record_drop(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        self.finish_extraction();
    }

    pub fn record_queued(&self) {
        self.pending_extractions.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_extraction(&self, new_points: usize, latency: Duration) {
        self.points_since_update
            .fetch_add(new_points as u64, Ordering::Relaxed);
        self.latency_us_sum
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
        self.finish_extraction();
    }

    fn finish_extraction(&self) {
        if self.pending_extractions.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.idle_lock.lock();
            self.idle.notify_all();
        }
    }

    pub fn pending_extractions(&self) -> u64 {
        self.pending_extractions.load(Ordering::Acquire)
    }

    /// Block until no extraction is pending. `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.idle_lock.lock();
        while self.pending_extractions() > 0 {
            if self.idle.wait_until(&mut guard, deadline).timed_out() {
                return self.pending_extractions() == 0;
            }
        }
        true
    }
}

/// Timing state of the statistics lane.
#[derive(Debug)]
pub(crate) struct StatsWindow {
    reset_at: Instant,
    last_update: Instant,
    last_latency_ms: f64,
}

impl StatsWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            reset_at: now,
            last_update: now,
            last_latency_ms: 0.0,
        }
    }

    /// Restart the frame-rate window.
    pub fn reset(&mut self, counters: &PipelineCounters, now: Instant) {
        counters.frames_since_reset.store(0, Ordering::Relaxed);
        counters.points_since_update.store(0, Ordering::Relaxed);
        self.reset_at = now;
        self.last_update = now;
    }

    pub fn update(
        &mut self,
        counters: &PipelineCounters,
        voxel_count: usize,
        quality: TrackingQuality,
        now: Instant,
    ) -> PipelineSnapshot {
        let elapsed = now.saturating_duration_since(self.reset_at).as_secs_f64();
        let frames = counters.frames_since_reset.load(Ordering::Relaxed);
        let frame_rate = if elapsed > 0.0 {
            frames as f64 / elapsed
        } else {
            0.0
        };

        let interval = now.saturating_duration_since(self.last_update).as_secs_f64();
        let points = counters.points_since_update.swap(0, Ordering::Relaxed);
        let points_per_second = if interval > 0.0 {
            points as f64 / interval
        } else {
            0.0
        };
        self.last_update = now;

        let samples = counters.latency_samples.swap(0, Ordering::Relaxed);
        let latency_us = counters.latency_us_sum.swap(0, Ordering::Relaxed);
        if samples > 0 {
            self.last_latency_ms = latency_us as f64 / samples as f64 / 1000.0;
        }

        PipelineSnapshot {
            frame_rate,
            latency_ms: self.last_latency_ms,
            points_per_second,
            voxel_count,
            memory_estimate_bytes: voxel_count * std::mem::size_of::<Sample>(),
            quality,
            frames_received: counters.frames_received.load(Ordering::Relaxed),
            frames_dropped: counters.frames_dropped.load(Ordering::Relaxed),
        }
    }
}
