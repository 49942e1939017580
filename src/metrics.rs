//! Synchronizer counters.
//!
//! Plain atomics, updated by the lifecycle manager and read by the
//! `/metrics` endpoint.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct SyncMetrics {
    cycles_committed: AtomicU64,
    cycles_aborted: AtomicU64,
    posts: AtomicU64,
    post_failures: AtomicU64,
    deletes: AtomicU64,
    delete_failures: AtomicU64,
    start_time: Instant,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub cycles_committed: u64,
    pub cycles_aborted: u64,
    pub posts: u64,
    pub post_failures: u64,
    pub deletes: u64,
    pub delete_failures: u64,
    pub uptime_seconds: u64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self {
            cycles_committed: AtomicU64::new(0),
            cycles_aborted: AtomicU64::new(0),
            posts: AtomicU64::new(0),
            post_failures: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            delete_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn cycle_committed(&self) {
        self.cycles_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cycle_aborted(&self) {
        self.cycles_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn posted(&self) {
        self.posts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn post_failed(&self) {
        self.post_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn deleted(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delete_failed(&self) {
        self.delete_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cycles_committed: self.cycles_committed.load(Ordering::Relaxed),
            cycles_aborted: self.cycles_aborted.load(Ordering::Relaxed),
            posts: self.posts.load(Ordering::Relaxed),
            post_failures: self.post_failures.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            delete_failures: self.delete_failures.load(Ordering::Relaxed),
            uptime_seconds: self.uptime_seconds(),
        }
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable uptime: `42s`, `3m 5s`, `2h 0m 9s`.
pub fn format_uptime(uptime: u64) -> String {
    if uptime < 60 {
        format!("{}s", uptime)
    } else if uptime < 3600 {
        format!("{}m {}s", uptime / 60, uptime % 60)
    } else {
        format!("{}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60)
    }
}
