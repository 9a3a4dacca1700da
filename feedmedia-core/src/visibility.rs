//! Scroll-window bookkeeping.
//!
//! Derives, for every known item, its zone relative to the current index and
//! turns zone transitions into load requests (on entering the active or
//! preload range) and deferred cancellations (on turning stale). The
//! cancellations are only queued here; the engine drains them in bounded
//! batches on a timer so rapid scrolling cannot produce cancellation storms.

use std::collections::{HashMap, HashSet, VecDeque};

use feedmedia_model::{ItemId, MediaRef, Priority, RequestKey};

use crate::{
    config::VisibilityConfig,
    error::{EngineError, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    /// At the current index.
    Active,
    /// Strictly ahead, within the lookahead.
    Preload { distance: usize },
    /// Beyond the lookahead.
    Ahead,
    /// Just behind the current index, within the stale buffer.
    Retained,
    /// Further behind than the stale buffer.
    Stale,
}

impl Zone {
    /// Load priority for items that should be loading; `None` otherwise.
    pub fn priority(self) -> Option<Priority> {
        match self {
            Zone::Active => Some(Priority::High),
            Zone::Preload { distance: 1 } => Some(Priority::Normal),
            Zone::Preload { .. } => Some(Priority::Low),
            Zone::Ahead | Zone::Retained | Zone::Stale => None,
        }
    }
}

/// A load the window wants started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredLoad {
    pub media: MediaRef,
    pub priority: Priority,
}

/// Side effects of one visibility change.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct VisibilityPlan {
    pub submit: Vec<DesiredLoad>,
    /// Keys that just (re-)entered the loading range.
    pub reappeared: Vec<RequestKey>,
    /// Keys newly queued for deferred cancellation.
    pub queued_cancellations: usize,
}

impl VisibilityPlan {
    fn merge(&mut self, other: VisibilityPlan) {
        self.submit.extend(other.submit);
        self.reappeared.extend(other.reappeared);
        self.queued_cancellations += other.queued_cancellations;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibilitySnapshot {
    pub len: usize,
    pub current_index: Option<usize>,
    pub active: Option<ItemId>,
    pub preload: Vec<ItemId>,
    pub pending_cancellations: usize,
}

#[derive(Debug)]
pub struct VisibilityTracker {
    lookahead: usize,
    stale_buffer: usize,
    items: Vec<ItemId>,
    current: Option<usize>,
    media: HashMap<ItemId, Vec<MediaRef>>,
    zones: HashMap<ItemId, Zone>,
    cancel_queue: VecDeque<RequestKey>,
    cancel_set: HashSet<RequestKey>,
}

impl VisibilityTracker {
    pub fn new(config: &VisibilityConfig) -> Self {
        Self {
            lookahead: config.lookahead,
            stale_buffer: config.stale_buffer,
            items: Vec::new(),
            current: None,
            media: HashMap::new(),
            zones: HashMap::new(),
            cancel_queue: VecDeque::new(),
            cancel_set: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn zone(&self, item: &ItemId) -> Option<Zone> {
        self.zones.get(item).copied()
    }

    pub fn pending_cancellations(&self) -> usize {
        self.cancel_queue.len()
    }

    /// Attach the fetchable resources of one item, replacing any earlier
    /// registration. An item already in the loading range starts loading.
    pub fn register_media(
        &mut self,
        item: ItemId,
        media: Vec<MediaRef>,
    ) -> VisibilityPlan {
        let mut plan = VisibilityPlan::default();
        let zone = self.zones.get(&item).copied();
        self.media.insert(item.clone(), media);

        match zone {
            Some(z) if z.priority().is_some() => {
                self.emit_loads(&item, z, None, &mut plan);
            }
            Some(Zone::Stale) => self.enqueue_cancellations(&item, &mut plan),
            _ => {}
        }
        plan
    }

    /// Replace the item list wholesale (feed refresh).
    ///
    /// The current index follows the previously current item when it is
    /// still present, otherwise resets to the top. Items that disappeared
    /// have their keys queued for cancellation and their registrations
    /// forgotten.
    pub fn set_items(&mut self, items: Vec<ItemId>) -> VisibilityPlan {
        let anchor = self
            .current
            .and_then(|c| self.items.get(c).cloned())
            .and_then(|id| items.iter().position(|i| *i == id));
        let index = anchor.or((!items.is_empty()).then_some(0));
        self.replace(items, index)
    }

    /// Replace the list and move to `index` in one step.
    pub fn set_window(
        &mut self,
        items: Vec<ItemId>,
        index: usize,
    ) -> Result<VisibilityPlan> {
        if index >= items.len() {
            return Err(EngineError::IndexOutOfRange {
                index,
                len: items.len(),
            });
        }
        Ok(self.replace(items, Some(index)))
    }

    /// Move the current index. Out-of-range values are rejected without
    /// touching any state.
    pub fn set_current_index(
        &mut self,
        index: usize,
    ) -> Result<VisibilityPlan> {
        if index >= self.items.len() {
            return Err(EngineError::IndexOutOfRange {
                index,
                len: self.items.len(),
            });
        }
        self.current = Some(index);
        Ok(self.recompute())
    }

    /// Pop up to `max` queued cancellations, skipping keys that are wanted
    /// again by some item in the loading range.
    pub fn drain_cancellations(&mut self, max: usize) -> Vec<RequestKey> {
        let wanted = self.wanted_keys();
        let mut out = Vec::with_capacity(max.min(self.cancel_queue.len()));
        while out.len() < max {
            let Some(key) = self.cancel_queue.pop_front() else {
                break;
            };
            self.cancel_set.remove(&key);
            if !wanted.contains(&key) {
                out.push(key);
            }
        }
        out
    }

    /// Whether any item in the loading range references `key`, and at
    /// which priority.
    pub fn desired(&self, key: &RequestKey) -> Option<DesiredLoad> {
        let mut best: Option<DesiredLoad> = None;
        for (item, zone) in &self.zones {
            let Some(priority) = zone.priority() else {
                continue;
            };
            let Some(media) = self
                .media
                .get(item)
                .and_then(|refs| refs.iter().find(|m| &m.key == key))
            else {
                continue;
            };
            if best.as_ref().is_none_or(|b| priority > b.priority) {
                best = Some(DesiredLoad {
                    media: media.clone(),
                    priority,
                });
            }
        }
        best
    }

    pub fn snapshot(&self) -> VisibilitySnapshot {
        let active = self.current.and_then(|c| self.items.get(c).cloned());
        let preload = match self.current {
            Some(c) => self
                .items
                .iter()
                .skip(c + 1)
                .take(self.lookahead)
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        VisibilitySnapshot {
            len: self.items.len(),
            current_index: self.current,
            active,
            preload,
            pending_cancellations: self.cancel_queue.len(),
        }
    }

    fn replace(
        &mut self,
        items: Vec<ItemId>,
        index: Option<usize>,
    ) -> VisibilityPlan {
        let mut plan = VisibilityPlan::default();
        let keep: HashSet<&ItemId> = items.iter().collect();
        let removed: Vec<ItemId> = self
            .items
            .iter()
            .filter(|id| !keep.contains(id))
            .cloned()
            .collect();
        drop(keep);

        for item in &removed {
            self.enqueue_cancellations(item, &mut plan);
            self.zones.remove(item);
            self.media.remove(item);
        }

        self.items = items;
        self.current = index;
        plan.merge(self.recompute());
        plan
    }

    fn recompute(&mut self) -> VisibilityPlan {
        let mut plan = VisibilityPlan::default();
        let previous = std::mem::take(&mut self.zones);

        let Some(current) = self.current else {
            return plan;
        };

        let mut next = HashMap::with_capacity(self.items.len());
        for (i, item) in self.items.iter().enumerate() {
            next.insert(item.clone(), self.zone_for(i, current));
        }
        self.zones = next;

        let items = self.items.clone();
        for item in &items {
            let zone = self.zones[item];
            let old = previous.get(item).copied();
            if zone.priority().is_some() {
                self.emit_loads(item, zone, old, &mut plan);
            } else if zone == Zone::Stale && old != Some(Zone::Stale) {
                self.enqueue_cancellations(item, &mut plan);
            }
        }
        plan
    }

    fn zone_for(&self, index: usize, current: usize) -> Zone {
        if index == current {
            Zone::Active
        } else if index > current {
            let distance = index - current;
            if distance <= self.lookahead {
                Zone::Preload { distance }
            } else {
                Zone::Ahead
            }
        } else if current - index <= self.stale_buffer {
            Zone::Retained
        } else {
            Zone::Stale
        }
    }

    fn emit_loads(
        &mut self,
        item: &ItemId,
        zone: Zone,
        old: Option<Zone>,
        plan: &mut VisibilityPlan,
    ) {
        let Some(priority) = zone.priority() else {
            return;
        };
        let old_priority = old.and_then(Zone::priority);
        if old_priority == Some(priority) {
            return;
        }
        let Some(refs) = self.media.get(item) else {
            return;
        };
        for media in refs {
            if self.cancel_set.remove(&media.key) {
                self.cancel_queue.retain(|k| k != &media.key);
            }
            if old_priority.is_none() {
                plan.reappeared.push(media.key.clone());
            }
            plan.submit.push(DesiredLoad {
                media: media.clone(),
                priority,
            });
        }
    }

    fn enqueue_cancellations(
        &mut self,
        item: &ItemId,
        plan: &mut VisibilityPlan,
    ) {
        let Some(refs) = self.media.get(item) else {
            return;
        };
        for media in refs {
            if self.cancel_set.insert(media.key.clone()) {
                self.cancel_queue.push_back(media.key.clone());
                plan.queued_cancellations += 1;
            }
        }
    }

    fn wanted_keys(&self) -> HashSet<RequestKey> {
        self.zones
            .iter()
            .filter(|(_, z)| z.priority().is_some())
            .filter_map(|(item, _)| self.media.get(item))
            .flatten()
            .map(|m| m.key.clone())
            .collect()
    }
}
