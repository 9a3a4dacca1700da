use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use feedmedia_model::RequestKey;
use tokio::time::Instant;

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryRecord {
    pub attempts: u32,
    pub last_attempt_at: Instant,
}

/// Per-key failure bookkeeping.
///
/// Backoff is linear in the attempt count (`attempt * base_delay`) so the
/// worst-case wait stays predictable. Permanently rejected keys live in a
/// separate set that reappearance never clears.
#[derive(Debug)]
pub struct RetryLedger {
    max_attempts: u32,
    base_delay: Duration,
    records: HashMap<RequestKey, RetryRecord>,
    permanent: HashSet<RequestKey>,
}

impl RetryLedger {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            records: HashMap::new(),
            permanent: HashSet::new(),
        }
    }

    pub fn record_failure(&mut self, key: &RequestKey) -> RetryDecision {
        let record = self.records.entry(key.clone()).or_insert(RetryRecord {
            attempts: 0,
            last_attempt_at: Instant::now(),
        });
        record.attempts = record.attempts.saturating_add(1);
        record.last_attempt_at = Instant::now();

        if record.attempts >= self.max_attempts {
            tracing::debug!(
                key = %key,
                attempts = record.attempts,
                "retry budget exhausted"
            );
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry(self.base_delay * record.attempts)
        }
    }

    /// A key became visible again. Resets a non-permanent key's attempt
    /// count; returns whether anything was reset.
    pub fn record_reappearance(&mut self, key: &RequestKey) -> bool {
        if self.permanent.contains(key) {
            return false;
        }
        self.records.remove(key).is_some()
    }

    pub fn mark_permanent(&mut self, key: &RequestKey) {
        self.records.remove(key);
        self.permanent.insert(key.clone());
    }

    pub fn is_permanent(&self, key: &RequestKey) -> bool {
        self.permanent.contains(key)
    }

    /// True once the key has used its whole retry budget.
    pub fn is_exhausted(&self, key: &RequestKey) -> bool {
        self.records
            .get(key)
            .is_some_and(|r| r.attempts >= self.max_attempts)
    }

    pub fn attempts(&self, key: &RequestKey) -> u32 {
        self.records.get(key).map_or(0, |r| r.attempts)
    }

    pub fn permanent_count(&self) -> usize {
        self.permanent.len()
    }

    pub fn record(&self, key: &RequestKey) -> Option<&RetryRecord> {
        self.records.get(key)
    }

    /// Explicit user retry: clears both the attempt count and a permanent
    /// rejection.
    pub fn manual_retry(&mut self, key: &RequestKey) {
        self.records.remove(key);
        if self.permanent.remove(key) {
            tracing::info!(
                key = %key,
                "permanent rejection cleared by manual retry"
            );
        }
    }

    /// Success wipes the key's failure history.
    pub fn clear(&mut self, key: &RequestKey) {
        self.records.remove(key);
    }

    pub fn reset(&mut self) {
        self.records.clear();
        self.permanent.clear();
    }
}
