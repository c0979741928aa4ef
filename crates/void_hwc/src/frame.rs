//! Composition statistics
//!
//! Counters are bumped by the composition thread and the producer-facing
//! API, and read through [`StatsSnapshot`] from any thread.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::NegotiationFailure;
use crate::layer::ReleaseReason;

/// What happened to one frame handed to the composition thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Committed to the hardware
    Composed,
    /// Not shown (window gone, stale layer list or hardware failure)
    Dropped,
}

/// Shared counters
#[derive(Debug, Default)]
pub struct CompositionStats {
    frames_presented: AtomicU64,
    frames_composed: AtomicU64,
    frames_dropped: AtomicU64,
    negotiations: AtomicU64,
    trial_compositions: AtomicU64,
    layer_lists_accepted: AtomicU64,
    layer_lists_rejected: AtomicU64,
    layer_lists_released: AtomicU64,
    buffers_released: AtomicU64,
}

impl CompositionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_present(&self) {
        self.frames_presented.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame(&self, outcome: FrameOutcome) {
        let counter = match outcome {
            FrameOutcome::Composed => &self.frames_composed,
            FrameOutcome::Dropped => &self.frames_dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_negotiation(&self, result: Result<usize, NegotiationFailure>) {
        self.negotiations.fetch_add(1, Ordering::Relaxed);
        let trials = match result {
            Ok(trials) => {
                self.layer_lists_accepted.fetch_add(1, Ordering::Relaxed);
                trials
            }
            Err(NegotiationFailure::NothingAccepted { trials }) => trials,
            Err(NegotiationFailure::ValidationFailed { trial, .. }) => trial,
        };
        self.trial_compositions.fetch_add(trials as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_list_release(&self, reason: ReleaseReason) {
        if let ReleaseReason::Rejected(_) = reason {
            self.layer_lists_rejected.fetch_add(1, Ordering::Relaxed);
        }
        self.layer_lists_released.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_buffer_release(&self) {
        self.buffers_released.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_presented: self.frames_presented.load(Ordering::Relaxed),
            frames_composed: self.frames_composed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            negotiations: self.negotiations.load(Ordering::Relaxed),
            trial_compositions: self.trial_compositions.load(Ordering::Relaxed),
            layer_lists_accepted: self.layer_lists_accepted.load(Ordering::Relaxed),
            layer_lists_rejected: self.layer_lists_rejected.load(Ordering::Relaxed),
            layer_lists_released: self.layer_lists_released.load(Ordering::Relaxed),
            buffers_released: self.buffers_released.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CompositionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Surface buffers handed over by `present`
    pub frames_presented: u64,
    pub frames_composed: u64,
    pub frames_dropped: u64,
    pub negotiations: u64,
    /// Validation calls made while negotiating
    pub trial_compositions: u64,
    pub layer_lists_accepted: u64,
    pub layer_lists_rejected: u64,
    /// Lists handed back to their owner for any reason
    pub layer_lists_released: u64,
    /// `buffer_available` notifications
    pub buffers_released: u64,
}

impl StatsSnapshot {
    /// Fraction of frames that reached the hardware
    pub fn composed_ratio(&self) -> f64 {
        let total = self.frames_composed + self.frames_dropped;
        if total == 0 {
            return 1.0;
        }
        self.frames_composed as f64 / total as f64
    }
}
