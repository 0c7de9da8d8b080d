//! Per-package usage accounting and the enqueue rate limiter.
//!
//! Policy rejections are silent to the caller, so these counters are the only
//! place a misbehaving package's history is visible. The rate estimate is a
//! sliding one-second window over admitted enqueues.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Counters for one package. Cheap to clone for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageStats {
    pub posted: u64,
    pub updated: u64,
    pub removed: u64,
    pub over_rate_quota: u64,
    pub over_count_quota: u64,
    pub blocked: u64,
    pub suspended_by_admin: u64,
    pub snoozed_enqueue: u64,
}

#[derive(Debug, Default)]
struct PackageUsage {
    stats: PackageStats,
    enqueue_times: VecDeque<Instant>,
    last_over_rate_log: Option<Instant>,
}

/// Tracks enqueue rate and lifecycle counts per package.
#[derive(Debug)]
pub struct UsageStats {
    packages: HashMap<String, PackageUsage>,
    window: Duration,
}

impl Default for UsageStats {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageStats {
    pub fn new() -> Self {
        Self {
            packages: HashMap::new(),
            window: Duration::from_secs(1),
        }
    }

    fn usage(&mut self, package: &str) -> &mut PackageUsage {
        self.packages.entry(package.to_string()).or_default()
    }

    /// Admitted enqueues per second over the sliding window.
    pub fn enqueue_rate(&mut self, package: &str, now: Instant) -> f32 {
        let window = self.window;
        let usage = self.usage(package);
        while let Some(front) = usage.enqueue_times.front() {
            if now.duration_since(*front) > window {
                usage.enqueue_times.pop_front();
            } else {
                break;
            }
        }
        usage.enqueue_times.len() as f32 / window.as_secs_f32()
    }

    /// Called once an enqueue has been admitted; rejected attempts do not
    /// count against the window.
    pub fn register_enqueued(&mut self, package: &str, now: Instant) {
        self.usage(package).enqueue_times.push_back(now);
    }

    /// Records an over-rate rejection. Returns whether the caller should log
    /// it; log lines themselves are throttled to `log_interval` per package.
    pub fn register_over_rate_quota(
        &mut self,
        package: &str,
        now: Instant,
        log_interval: Duration,
    ) -> bool {
        let usage = self.usage(package);
        usage.stats.over_rate_quota += 1;
        let should_log = usage
            .last_over_rate_log
            .map_or(true, |last| now.duration_since(last) > log_interval);
        if should_log {
            usage.last_over_rate_log = Some(now);
        }
        should_log
    }

    pub fn register_over_count_quota(&mut self, package: &str) {
        self.usage(package).stats.over_count_quota += 1;
    }

    pub fn register_blocked(&mut self, package: &str) {
        self.usage(package).stats.blocked += 1;
    }

    pub fn register_suspended_by_admin(&mut self, package: &str) {
        self.usage(package).stats.suspended_by_admin += 1;
    }

    pub fn register_snoozed_enqueue(&mut self, package: &str) {
        self.usage(package).stats.snoozed_enqueue += 1;
    }

    pub fn register_posted(&mut self, package: &str) {
        self.usage(package).stats.posted += 1;
    }

    pub fn register_updated(&mut self, package: &str) {
        self.usage(package).stats.updated += 1;
    }

    pub fn register_removed(&mut self, package: &str) {
        self.usage(package).stats.removed += 1;
    }

    pub fn snapshot(&self, package: &str) -> PackageStats {
        self.packages
            .get(package)
            .map(|u| u.stats.clone())
            .unwrap_or_default()
    }
}
