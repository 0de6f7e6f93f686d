use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

/// Point-in-time view of a server's disk consumption.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DiskUsage {
    pub used_bytes: u64,
    /// Quota in bytes; 0 means unlimited.
    pub limit_bytes: u64,
    /// Percentage of the quota consumed; absent when unlimited.
    pub percent_used: Option<f64>,
}

/// Tracks bytes consumed under a server root against an optional quota.
///
/// The counter is a live estimate: every mutation records its own signed
/// delta, and two racing writers may briefly over- or under-count. A full
/// recount replaces the counter wholesale and bounds the drift.
#[derive(Debug)]
pub(crate) struct DiskAccountant {
    used_bytes: AtomicI64,
    limit_bytes: AtomicI64,
    check_interval: Duration,
    /// Instant of the last completed recount. Locking the gate serializes
    /// recounts; a caller that loses the race blocks, observes a fresh
    /// timestamp, and reuses the in-flight result instead of rescanning.
    recount_gate: Mutex<Option<Instant>>,
}

impl DiskAccountant {
    pub fn new(limit_bytes: u64, check_interval: Duration) -> Self {
        Self {
            used_bytes: AtomicI64::new(0),
            limit_bytes: AtomicI64::new(limit_bytes as i64),
            check_interval,
            recount_gate: Mutex::new(None),
        }
    }

    /// Current estimate. May be transiently negative while concurrent
    /// deletes race a recount.
    pub fn used(&self) -> i64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> i64 {
        self.limit_bytes.load(Ordering::Acquire)
    }

    pub fn set_limit(&self, limit_bytes: u64) {
        self.limit_bytes.store(limit_bytes as i64, Ordering::Release);
    }

    /// Records the signed size delta of a completed mutation.
    pub fn add(&self, delta: i64) {
        if delta != 0 {
            self.used_bytes.fetch_add(delta, Ordering::AcqRel);
        }
    }

    /// Whether a mutation growing usage by `delta` fits under the quota.
    /// Shrinks and deletions are always admitted.
    pub fn has_space_for(&self, delta: i64) -> bool {
        let limit = self.limit();
        limit == 0 || self.used() + delta <= limit
    }

    /// Remaining headroom under the quota, clamped at zero.
    pub fn headroom(&self) -> i64 {
        let limit = self.limit();
        if limit == 0 {
            i64::MAX
        } else {
            (limit - self.used()).max(0)
        }
    }

    pub fn snapshot(&self) -> DiskUsage {
        let used = self.used().max(0) as u64;
        let limit = self.limit().max(0) as u64;
        DiskUsage {
            used_bytes: used,
            limit_bytes: limit,
            percent_used: (limit > 0).then(|| used as f64 / limit as f64 * 100.0),
        }
    }

    /// Runs `scan` and replaces the counter with its result, unless another
    /// recount completed within the check interval. `force` ignores the
    /// interval but still serializes on the gate. The scan future is only
    /// awaited when a recount actually runs; a failed scan keeps the
    /// previous estimate.
    pub async fn recount_with<F>(&self, force: bool, scan: F) -> Result<()>
    where
        F: Future<Output = Result<u64>>,
    {
        let mut last = self.recount_gate.lock().await;
        if !force {
            if let Some(at) = *last {
                if at.elapsed() < self.check_interval {
                    return Ok(());
                }
            }
        }

        debug!("recalculating disk usage from a full scan");
        let total = scan.await?;
        self.used_bytes.store(total as i64, Ordering::Release);
        *last = Some(Instant::now());
        Ok(())
    }
}
