use super::DiskKey;
use crate::cache::partial_count;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Written longer ago than the age bound.
    Expired,
    /// Oldest writes dropped to get back under the byte cap.
    OverBudget,
    /// Extra shedding requested by a memory pressure signal.
    Pressure,
}

/// Index row as read from the cacache root.
#[derive(Debug, Clone)]
pub struct IndexedDerivative {
    pub key: DiskKey,
    /// Content hash; several keys may point at the same content.
    pub integrity: String,
    pub bytes: u64,
    pub written_ms: u64,
}

/// Bounds for one sweep. Zero `max_age_ms` or `max_bytes` disables that
/// bound.
#[derive(Debug, Clone, Copy)]
pub struct SweepBudget {
    pub now_ms: u64,
    pub max_age_ms: u64,
    pub max_bytes: u64,
    /// Share of the unexpired entries to shed, oldest first. Clamped like
    /// the memory stores: `1..=90`, at least one entry.
    pub shed_percent: Option<u8>,
}

#[derive(Debug, Default)]
pub struct SweepPlan {
    pub victims: Vec<(IndexedDerivative, EvictionReason)>,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl SweepPlan {
    pub fn count(&self, reason: EvictionReason) -> usize {
        self.victims.iter().filter(|(_, r)| *r == reason).count()
    }
}

/// Expired entries go first, then the oldest writes until the byte cap
/// holds. Under pressure the oldest writes keep going until the requested
/// share of the unexpired entries is gone.
pub fn plan_sweep(
    entries: Vec<IndexedDerivative>,
    budget: SweepBudget,
) -> SweepPlan {
    let bytes_before: u64 = entries.iter().map(|e| e.bytes).sum();
    let mut remaining = bytes_before;
    let mut victims = Vec::new();

    let mut live = Vec::with_capacity(entries.len());
    for entry in entries {
        let age = budget.now_ms.saturating_sub(entry.written_ms);
        if budget.max_age_ms > 0 && age > budget.max_age_ms {
            remaining = remaining.saturating_sub(entry.bytes);
            victims.push((entry, EvictionReason::Expired));
        } else {
            live.push(entry);
        }
    }

    let shed_count = budget
        .shed_percent
        .map_or(0, |pct| partial_count(live.len(), pct));
    live.sort_by_key(|e| e.written_ms);
    let mut taken = 0usize;
    for entry in live {
        let reason = if budget.max_bytes > 0 && remaining > budget.max_bytes {
            EvictionReason::OverBudget
        } else if taken < shed_count {
            EvictionReason::Pressure
        } else {
            break;
        };
        taken += 1;
        remaining = remaining.saturating_sub(entry.bytes);
        victims.push((entry, reason));
    }

    SweepPlan {
        victims,
        bytes_before,
        bytes_after: remaining,
    }
}
