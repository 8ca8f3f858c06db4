//! Acquisition health counters.
//!
//! The scheduler records what happened to every read and switch attempt here;
//! sessions receive the aggregated [`HealthSnapshot`] inside state pushes. The
//! one flag that matters operationally is `switcher_available`: when the
//! switcher goes unreachable the server keeps serving connected clients and
//! retrying the device, and this flag is how the degraded condition stays
//! visible until the hardware comes back.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::measurement::Status;

/// Shared counters updated by the scheduler, read by anyone.
#[derive(Debug)]
pub struct HealthMonitor {
    started: Instant,
    cycles: AtomicU64,
    reads_ok: AtomicU64,
    reads_no_signal: AtomicU64,
    reads_failed: AtomicU64,
    switch_failures: AtomicU64,
    switcher_available: AtomicBool,
}

/// Point-in-time copy of the counters, as pushed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Seconds since the monitor was created.
    pub uptime_secs: u64,
    /// Completed acquisition cycles.
    pub cycles: u64,
    /// Reads that produced a value.
    pub reads_ok: u64,
    /// Reads where the instrument reported no input light.
    pub reads_no_signal: u64,
    /// Reads lost to device faults or timeouts.
    pub reads_failed: u64,
    /// Failed switch selections.
    pub switch_failures: u64,
    /// False while the switcher is in its unreachable/retry state.
    pub switcher_available: bool,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            cycles: AtomicU64::new(0),
            reads_ok: AtomicU64::new(0),
            reads_no_signal: AtomicU64::new(0),
            reads_failed: AtomicU64::new(0),
            switch_failures: AtomicU64::new(0),
            switcher_available: AtomicBool::new(true),
        }
    }

    /// Tally one completed read by its resulting status.
    pub fn record_read(&self, status: Status) {
        let counter = match status {
            Status::Ok => &self.reads_ok,
            Status::NoSignal => &self.reads_no_signal,
            Status::Error => &self.reads_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_switch_failure(&self) {
        self.switch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_switcher_available(&self, available: bool) {
        self.switcher_available.store(available, Ordering::Relaxed);
    }

    pub fn switcher_available(&self) -> bool {
        self.switcher_available.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            cycles: self.cycles.load(Ordering::Relaxed),
            reads_ok: self.reads_ok.load(Ordering::Relaxed),
            reads_no_signal: self.reads_no_signal.load(Ordering::Relaxed),
            reads_failed: self.reads_failed.load(Ordering::Relaxed),
            switch_failures: self.switch_failures.load(Ordering::Relaxed),
            switcher_available: self.switcher_available.load(Ordering::Relaxed),
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}
