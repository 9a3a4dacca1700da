use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

use super::SweepReport;

/// Counters since the spillover was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub failed_writes: u64,
    /// Entries that read back but failed to decode.
    pub corrupt_dropped: u64,
    pub sweeps: u64,
    pub swept_expired: u64,
    pub swept_over_budget: u64,
    pub shed_under_pressure: u64,
    pub last_sweep_ms: u64,
}

#[derive(Debug, Default)]
pub(super) struct DiskStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    failed_writes: AtomicU64,
    corrupt_dropped: AtomicU64,
    sweeps: AtomicU64,
    swept_expired: AtomicU64,
    swept_over_budget: AtomicU64,
    shed_under_pressure: AtomicU64,
    last_sweep_ms: AtomicU64,
}

impl DiskStats {
    pub fn record_read(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Relaxed);
    }

    pub fn record_write(&self, ok: bool) {
        let counter = if ok { &self.writes } else { &self.failed_writes };
        counter.fetch_add(1, Relaxed);
    }

    pub fn record_corrupt(&self) {
        self.corrupt_dropped.fetch_add(1, Relaxed);
    }

    pub fn record_sweep(&self, report: &SweepReport, elapsed_ms: u64) {
        self.sweeps.fetch_add(1, Relaxed);
        self.swept_expired
            .fetch_add(report.removed_ttl as u64, Relaxed);
        self.swept_over_budget
            .fetch_add(report.removed_size as u64, Relaxed);
        self.shed_under_pressure
            .fetch_add(report.removed_pressure as u64, Relaxed);
        self.last_sweep_ms.store(elapsed_ms, Relaxed);
    }

    pub fn snapshot(&self) -> DiskStatsSnapshot {
        DiskStatsSnapshot {
            hits: self.hits.load(Relaxed),
            misses: self.misses.load(Relaxed),
            writes: self.writes.load(Relaxed),
            failed_writes: self.failed_writes.load(Relaxed),
            corrupt_dropped: self.corrupt_dropped.load(Relaxed),
            sweeps: self.sweeps.load(Relaxed),
            swept_expired: self.swept_expired.load(Relaxed),
            swept_over_budget: self.swept_over_budget.load(Relaxed),
            shed_under_pressure: self.shed_under_pressure.load(Relaxed),
            last_sweep_ms: self.last_sweep_ms.load(Relaxed),
        }
    }
}
