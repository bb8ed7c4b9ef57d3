//! Counters for a fan-out pipeline

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters updated by a distributor
#[derive(Debug, Default)]
pub struct DeliveryStats {
    frames_accepted: AtomicU64,
    frames_dispatched: AtomicU64,
    deliveries: AtomicU64,
    failed_deliveries: AtomicU64,
    sinks_removed: AtomicU64,
}

/// Point-in-time copy of [`DeliveryStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySnapshot {
    /// Frames enqueued by producers
    pub frames_accepted: u64,
    /// Frames taken off the queue and handed to at least one sink
    pub frames_dispatched: u64,
    /// Successful per-sink deliveries
    pub deliveries: u64,
    /// Per-sink deliveries that returned false, errored or panicked
    pub failed_deliveries: u64,
    /// Sinks dropped from the live set, for any reason
    pub sinks_removed: u64,
}

impl DeliveryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn frame_accepted(&self) {
        self.frames_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_dispatched(&self) {
        self.frames_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivered(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivery_failed(&self) {
        self.failed_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sink_removed(&self) {
        self.sinks_removed.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values
    pub fn snapshot(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            frames_accepted: self.frames_accepted.load(Ordering::Relaxed),
            frames_dispatched: self.frames_dispatched.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            failed_deliveries: self.failed_deliveries.load(Ordering::Relaxed),
            sinks_removed: self.sinks_removed.load(Ordering::Relaxed),
        }
    }
}

impl DeliverySnapshot {
    /// Fraction of per-sink deliveries that failed
    pub fn failure_ratio(&self) -> f64 {
        let total = self.deliveries + self.failed_deliveries;
        if total > 0 {
            self.failed_deliveries as f64 / total as f64
        } else {
            0.0
        }
    }
}
