//! Controller diagnostics counters
//!
//! Cheap atomics bumped from the hot paths, snapshotted for the
//! `dump-state` surface and the test suite. Resetting clears cycle data;
//! job counters are cumulative since startup.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide controller statistics.
#[derive(Debug, Default)]
pub struct ControllerStats {
    pub jobs_submitted: AtomicU64,
    pub jobs_started: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub jobs_canceled: AtomicU64,
    pub jobs_failed: AtomicU64,

    pub schedule_cycles: AtomicU64,
    pub schedule_cycle_last_us: AtomicU64,
    pub schedule_cycle_max_us: AtomicU64,
    pub schedule_cycle_sum_us: AtomicU64,
    pub schedule_queue_depth: AtomicU64,

    pub agent_runs: AtomicU64,
    pub agent_rpcs_sent: AtomicU64,
    pub agent_no_resp: AtomicU64,
    pub agent_retries: AtomicU64,
    pub retry_queue_depth: AtomicU64,

    pub ping_cycles: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_canceled: u64,
    pub jobs_failed: u64,
    pub schedule_cycles: u64,
    pub schedule_cycle_last_us: u64,
    pub schedule_cycle_max_us: u64,
    pub schedule_cycle_mean_us: u64,
    pub schedule_queue_depth: u64,
    pub agent_runs: u64,
    pub agent_rpcs_sent: u64,
    pub agent_no_resp: u64,
    pub agent_retries: u64,
    pub retry_queue_depth: u64,
    pub ping_cycles: u64,
}

impl ControllerStats {
    pub fn new() -> Self {
        ControllerStats::default()
    }

    /// Record one scheduler pass.
    pub fn record_schedule_cycle(&self, micros: u64, queue_depth: u64) {
        self.schedule_cycles.fetch_add(1, Ordering::Relaxed);
        self.schedule_cycle_last_us.store(micros, Ordering::Relaxed);
        self.schedule_cycle_max_us
            .fetch_max(micros, Ordering::Relaxed);
        self.schedule_cycle_sum_us
            .fetch_add(micros, Ordering::Relaxed);
        self.schedule_queue_depth
            .store(queue_depth, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let cycles = self.schedule_cycles.load(Ordering::Relaxed);
        let sum = self.schedule_cycle_sum_us.load(Ordering::Relaxed);
        StatsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_canceled: self.jobs_canceled.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            schedule_cycles: cycles,
            schedule_cycle_last_us: self.schedule_cycle_last_us.load(Ordering::Relaxed),
            schedule_cycle_max_us: self.schedule_cycle_max_us.load(Ordering::Relaxed),
            schedule_cycle_mean_us: if cycles == 0 { 0 } else { sum / cycles },
            schedule_queue_depth: self.schedule_queue_depth.load(Ordering::Relaxed),
            agent_runs: self.agent_runs.load(Ordering::Relaxed),
            agent_rpcs_sent: self.agent_rpcs_sent.load(Ordering::Relaxed),
            agent_no_resp: self.agent_no_resp.load(Ordering::Relaxed),
            agent_retries: self.agent_retries.load(Ordering::Relaxed),
            retry_queue_depth: self.retry_queue_depth.load(Ordering::Relaxed),
            ping_cycles: self.ping_cycles.load(Ordering::Relaxed),
        }
    }

    /// Clear cycle data; job counters keep their cumulative meaning.
    pub fn reset(&self) {
        self.schedule_cycles.store(0, Ordering::Relaxed);
        self.schedule_cycle_last_us.store(0, Ordering::Relaxed);
        self.schedule_cycle_max_us.store(0, Ordering::Relaxed);
        self.schedule_cycle_sum_us.store(0, Ordering::Relaxed);
        self.schedule_queue_depth.store(0, Ordering::Relaxed);
        self.agent_runs.store(0, Ordering::Relaxed);
        self.agent_rpcs_sent.store(0, Ordering::Relaxed);
        self.agent_no_resp.store(0, Ordering::Relaxed);
        self.agent_retries.store(0, Ordering::Relaxed);
        self.ping_cycles.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_cycle_statistics() {
        let stats = ControllerStats::new();
        stats.record_schedule_cycle(100, 5);
        stats.record_schedule_cycle(300, 2);
        let snap = stats.snapshot();
        assert_eq!(snap.schedule_cycles, 2);
        assert_eq!(snap.schedule_cycle_last_us, 300);
        assert_eq!(snap.schedule_cycle_max_us, 300);
        assert_eq!(snap.schedule_cycle_mean_us, 200);
        assert_eq!(snap.schedule_queue_depth, 2);
    }

    #[test]
    fn reset_keeps_job_counters() {
        let stats = ControllerStats::new();
        stats.jobs_submitted.fetch_add(3, Ordering::Relaxed);
        stats.record_schedule_cycle(50, 1);
        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.jobs_submitted, 3);
        assert_eq!(snap.schedule_cycles, 0);
    }
}
