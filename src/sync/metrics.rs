//! # Sync Metrics
//!
//! Pass counters and timing for the sync engine.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct SyncMetrics {
    pub total_passes: u64,
    pub successful_passes: u64,
    pub failed_passes: u64,
    /// Triggers folded into an already running pass
    pub coalesced_triggers: u64,
    pub operations_pushed: u64,
    pub operations_failed: u64,
    pub conflicts_resolved: u64,
    pub average_pass_duration: Duration,
    pub last_pass_duration: Option<Duration>,
    last_pass_start: Option<Instant>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pass_start(&mut self) {
        self.last_pass_start = Some(Instant::now());
        self.total_passes += 1;
    }

    pub fn record_pass_success(&mut self, pushed: usize, failed: usize, conflicts: usize) {
        self.operations_pushed += pushed as u64;
        self.operations_failed += failed as u64;
        self.conflicts_resolved += conflicts as u64;

        if let Some(start) = self.last_pass_start.take() {
            let duration = start.elapsed();
            self.last_pass_duration = Some(duration);
            self.successful_passes += 1;

            // Update rolling average
            let total = self.average_pass_duration * (self.successful_passes - 1) as u32 + duration;
            self.average_pass_duration = total / self.successful_passes as u32;
        }
    }

    pub fn record_pass_failure(&mut self) {
        self.last_pass_start = None;
        self.failed_passes += 1;
    }

    pub fn record_coalesced(&mut self) {
        self.coalesced_triggers += 1;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_passes == 0 {
            0.0
        } else {
            self.successful_passes as f64 / self.total_passes as f64
        }
    }
}
