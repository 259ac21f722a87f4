//! Lock-free pipeline counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every stage of one pipeline.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub frames_observed: AtomicU64,
    pub frames_forwarded: AtomicU64,
    pub stale_dropped: AtomicU64,
    pub interruptions: AtomicU64,
    pub preempted: AtomicU64,
    pub stage_errors: AtomicU64,
    pub timeouts: AtomicU64,
}

impl PipelineMetrics {
    pub fn record_observed(&self) {
        self.frames_observed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self) {
        self.frames_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self, count: usize) {
        self.stale_dropped
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_interruption(&self) {
        self.interruptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preempted(&self) {
        self.preempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, timed_out: bool) {
        self.stage_errors.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn reset(&self) {
        self.frames_observed.store(0, Ordering::Relaxed);
        self.frames_forwarded.store(0, Ordering::Relaxed);
        self.stale_dropped.store(0, Ordering::Relaxed);
        self.interruptions.store(0, Ordering::Relaxed);
        self.preempted.store(0, Ordering::Relaxed);
        self.stage_errors.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_observed: self.frames_observed.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            preempted: self.preempted.load(Ordering::Relaxed),
            stage_errors: self.stage_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub frames_observed: u64,
    pub frames_forwarded: u64,
    /// Frames of cancelled turns dropped before delivery.
    pub stale_dropped: u64,
    pub interruptions: u64,
    /// In-flight stage calls aborted by an interruption.
    pub preempted: u64,
    pub stage_errors: u64,
    pub timeouts: u64,
}
