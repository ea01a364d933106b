//! # Sync Scheduler
//!
//! Pass admission and wake-up timing for the sync engine.
//!
//! At most one pass runs at a time. A trigger that arrives while a pass is
//! active does not start a second one; it sets a re-trigger flag that the
//! running pass checks before returning, so the work it asked for happens
//! right after the current pass instead of concurrently with it.

use crate::offline::SyncOperation;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Single-pass admission gate
#[derive(Debug, Default)]
pub struct PassGate {
    active: AtomicBool,
    retrigger: AtomicBool,
}

impl PassGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the gate, or record a re-trigger if a pass is already running
    pub fn try_enter(&self) -> Option<PassGuard<'_>> {
        loop {
            if self
                .active
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.retrigger.store(false, Ordering::SeqCst);
                return Some(PassGuard { gate: self, held: true });
            }
            self.retrigger.store(true, Ordering::SeqCst);
            // The running pass may have released the gate before it could see
            // the flag; in that case take the gate ourselves
            if self.active.load(Ordering::SeqCst) {
                return None;
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Held for the duration of a pass; releases the gate on drop
#[derive(Debug)]
pub struct PassGuard<'a> {
    gate: &'a PassGate,
    held: bool,
}

impl<'a> PassGuard<'a> {
    /// Whether a trigger arrived since the last check; clears the flag
    pub fn take_retrigger(&self) -> bool {
        self.gate.retrigger.swap(false, Ordering::SeqCst)
    }

    /// Hand the gate back at the end of a pass.
    ///
    /// Returns the guard again when a trigger is pending, including one that
    /// races the release itself; the caller then runs another pass.
    pub fn release(mut self) -> Option<PassGuard<'a>> {
        loop {
            if self.take_retrigger() {
                return Some(self);
            }
            self.held = false;
            self.gate.active.store(false, Ordering::SeqCst);
            if !self.gate.retrigger.load(Ordering::SeqCst) {
                return None;
            }
            if self
                .gate
                .active
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                // Another caller entered and owns the pending work
                return None;
            }
            self.held = true;
        }
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if self.held {
            self.gate.active.store(false, Ordering::SeqCst);
        }
    }
}

/// Earliest backoff deadline among `pending`, as a delay from `now`.
///
/// Returns `None` when nothing is backing off, and `Duration::ZERO` when a
/// deadline has already passed.
pub fn next_retry_delay(pending: &[SyncOperation], now: DateTime<Utc>) -> Option<Duration> {
    let earliest = pending.iter().filter_map(|op| op.next_attempt_at).min()?;
    Some((earliest - now).to_std().unwrap_or(Duration::ZERO))
}
