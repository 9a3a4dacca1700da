use std::{collections::HashMap, sync::Arc, time::Duration};

use feedmedia_model::RequestKey;
use tokio::time::Instant;

use crate::{config::StoreConfig, prepared::PreparedMedia};

/// A value the resource store can hold.
pub trait CachePayload {
    /// Eviction cost, counted against the store's byte budget.
    fn cost(&self) -> u64;

    /// Release any resource the payload pins. Called synchronously right
    /// before the store drops an evicted entry.
    fn release(&mut self) {}
}

impl CachePayload for Arc<PreparedMedia> {
    fn cost(&self) -> u64 {
        self.cost_bytes()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StorePolicy {
    pub max_entries: usize,
    pub max_cost: Option<u64>,
    pub max_age: Option<Duration>,
}

impl From<&StoreConfig> for StorePolicy {
    fn from(config: &StoreConfig) -> Self {
        Self {
            max_entries: config.max_entries.max(1),
            max_cost: config.max_bytes.map(|b| b.as_bytes()),
            max_age: (config.max_age_secs > 0).then(|| config.max_age()),
        }
    }
}

#[derive(Debug)]
struct CacheEntry<P> {
    payload: P,
    cost: u64,
    created_at: Instant,
    last_accessed: Instant,
    /// Logical access clock; breaks ties between equal `last_accessed`.
    access_seq: u64,
}

/// Keyed store of prepared payloads with LRU capacity eviction and an
/// independent TTL sweep.
///
/// Not synchronized: the engine mutates it only from its serial context.
/// [`super::live::LiveHandleCache`] wraps one behind a lock for render paths.
#[derive(Debug)]
pub struct ResourceStore<P> {
    name: &'static str,
    policy: StorePolicy,
    entries: HashMap<RequestKey, CacheEntry<P>>,
    total_cost: u64,
    clock: u64,
}

impl<P: CachePayload> ResourceStore<P> {
    pub fn new(name: &'static str, policy: StorePolicy) -> Self {
        Self {
            name,
            policy,
            entries: HashMap::new(),
            total_cost: 0,
            clock: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_cost(&self) -> u64 {
        self.total_cost
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Read without touching the LRU position.
    pub fn peek(&self, key: &RequestKey) -> Option<&P> {
        self.entries.get(key).map(|e| &e.payload)
    }

    pub fn get(&mut self, key: &RequestKey) -> Option<&P> {
        self.get_mut(key).map(|p| &*p)
    }

    pub fn get_mut(&mut self, key: &RequestKey) -> Option<&mut P> {
        let seq = self.tick();
        let entry = self.entries.get_mut(key)?;
        entry.last_accessed = Instant::now();
        entry.access_seq = seq;
        Some(&mut entry.payload)
    }

    /// Insert or replace `key`, then evict least-recently-used entries until
    /// the store is back within its bounds. Returns the evicted keys.
    ///
    /// A payload that alone exceeds the byte budget is evicted as well.
    pub fn put(&mut self, key: RequestKey, payload: P) -> Vec<RequestKey> {
        let now = Instant::now();
        let seq = self.tick();
        let cost = payload.cost();

        if let Some(mut old) = self.entries.remove(&key) {
            self.total_cost = self.total_cost.saturating_sub(old.cost);
            old.payload.release();
        }

        self.total_cost = self.total_cost.saturating_add(cost);
        self.entries.insert(
            key,
            CacheEntry {
                payload,
                cost,
                created_at: now,
                last_accessed: now,
                access_seq: seq,
            },
        );

        let mut evicted = Vec::new();
        while self.over_capacity() {
            let Some(victim) = self.least_recent() else {
                break;
            };
            self.evict_key(&victim);
            evicted.push(victim);
        }

        if !evicted.is_empty() {
            tracing::debug!(
                store = self.name,
                evicted = evicted.len(),
                entries = self.entries.len(),
                cost = self.total_cost,
                "evicted over capacity"
            );
        }
        evicted
    }

    /// Remove without releasing; ownership of the payload moves to the caller.
    pub fn take(&mut self, key: &RequestKey) -> Option<P> {
        let entry = self.entries.remove(key)?;
        self.total_cost = self.total_cost.saturating_sub(entry.cost);
        Some(entry.payload)
    }

    /// Release and drop one entry.
    pub fn evict_key(&mut self, key: &RequestKey) -> bool {
        match self.entries.remove(key) {
            Some(mut entry) => {
                self.total_cost = self.total_cost.saturating_sub(entry.cost);
                entry.payload.release();
                true
            }
            None => false,
        }
    }

    /// Release and drop every entry matching `predicate`.
    pub fn evict<F>(&mut self, mut predicate: F) -> Vec<RequestKey>
    where
        F: FnMut(&RequestKey, &P) -> bool,
    {
        let victims: Vec<RequestKey> = self
            .entries
            .iter()
            .filter(|(k, e)| predicate(k, &e.payload))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &victims {
            self.evict_key(key);
        }
        victims
    }

    /// Oldest-first eviction of `percentage` of the entries.
    ///
    /// `percentage` is clamped to `1..=90`; at least one entry goes when the
    /// store is non-empty. Returns the number evicted.
    pub fn release_partial(&mut self, percentage: u8) -> usize {
        let n = self.entries.len();
        let count = partial_count(n, percentage);
        if count == 0 {
            return 0;
        }

        let mut order: Vec<(Instant, u64, RequestKey)> = self
            .entries
            .iter()
            .map(|(k, e)| (e.last_accessed, e.access_seq, k.clone()))
            .collect();
        order.sort_unstable_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        for (_, _, key) in order.into_iter().take(count) {
            self.evict_key(&key);
        }

        tracing::info!(
            store = self.name,
            percentage,
            released = count,
            remaining = self.entries.len(),
            "released entries under pressure"
        );
        count
    }

    /// Drop entries created more than `max_age` before `now`.
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let Some(max_age) = self.policy.max_age else {
            return 0;
        };
        let victims: Vec<RequestKey> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                now.saturating_duration_since(e.created_at) > max_age
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in &victims {
            self.evict_key(key);
        }

        if !victims.is_empty() {
            tracing::debug!(
                store = self.name,
                removed = victims.len(),
                "ttl sweep"
            );
        }
        victims.len()
    }

    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        for (_, mut entry) in self.entries.drain() {
            entry.payload.release();
        }
        self.total_cost = 0;
        n
    }

    pub fn keys(&self) -> impl Iterator<Item = &RequestKey> {
        self.entries.keys()
    }

    pub fn values_mut(
        &mut self,
    ) -> impl Iterator<Item = (&RequestKey, &mut P)> {
        self.entries.iter_mut().map(|(k, e)| (k, &mut e.payload))
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn over_capacity(&self) -> bool {
        if self.entries.len() > self.policy.max_entries {
            return true;
        }
        matches!(self.policy.max_cost, Some(max) if self.total_cost > max)
    }

    fn least_recent(&self) -> Option<RequestKey> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| (e.last_accessed, e.access_seq))
            .map(|(k, _)| k.clone())
    }
}

/// `max(1, round(n * p / 100))` with `p` clamped to `1..=90`, or zero for an
/// empty store.
pub fn partial_count(n: usize, percentage: u8) -> usize {
    if n == 0 {
        return 0;
    }
    let p = percentage.clamp(1, 90) as usize;
    ((n * p + 50) / 100).max(1)
}
