use std::{cmp::Reverse, collections::BTreeMap};

use feedmedia_model::{Priority, RequestKey};

/// Position in the pending queue: priority descending, then arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueSlot {
    rank: Reverse<Priority>,
    seq: u64,
}

impl QueueSlot {
    pub fn new(priority: Priority, seq: u64) -> Self {
        Self {
            rank: Reverse(priority),
            seq,
        }
    }

    pub fn priority(&self) -> Priority {
        self.rank.0
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// Bounded pending queue with stable FIFO ordering inside a priority.
#[derive(Debug)]
pub struct PendingQueue {
    capacity: usize,
    slots: BTreeMap<QueueSlot, RequestKey>,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Insert first, then trim the lowest-priority tail back to capacity.
    ///
    /// The new entry loses only when its priority is strictly below every
    /// other queued entry; a tie at the tail drops the older neighbour.
    /// Returns the dropped keys.
    pub fn push(
        &mut self,
        key: RequestKey,
        slot: QueueSlot,
    ) -> Vec<RequestKey> {
        self.slots.insert(slot, key);

        let mut dropped = Vec::new();
        while self.slots.len() > self.capacity {
            let mut tail = self.slots.keys().rev();
            let Some(&last) = tail.next() else {
                break;
            };
            let victim = match tail.next() {
                Some(&prev)
                    if last == slot && prev.priority() == slot.priority() =>
                {
                    prev
                }
                _ => last,
            };
            if let Some(key) = self.slots.remove(&victim) {
                dropped.push(key);
            }
        }
        dropped
    }

    pub fn pop(&mut self) -> Option<(QueueSlot, RequestKey)> {
        self.slots.pop_first()
    }

    pub fn peek_priority(&self) -> Option<Priority> {
        self.slots.keys().next().map(QueueSlot::priority)
    }

    pub fn remove(&mut self, slot: &QueueSlot) -> Option<RequestKey> {
        self.slots.remove(slot)
    }

    /// Move an entry to a new slot without capacity checks.
    pub fn reposition(&mut self, from: &QueueSlot, to: QueueSlot) -> bool {
        match self.slots.remove(from) {
            Some(key) => {
                self.slots.insert(to, key);
                true
            }
            None => false,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &RequestKey> {
        self.slots.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> RequestKey {
        RequestKey::new(s)
    }

    #[test]
    fn pops_by_priority_then_fifo() {
        let mut q = PendingQueue::new(10);
        q.push(key("n1"), QueueSlot::new(Priority::Normal, 1));
        q.push(key("h1"), QueueSlot::new(Priority::High, 2));
        q.push(key("n2"), QueueSlot::new(Priority::Normal, 3));
        q.push(key("l1"), QueueSlot::new(Priority::Low, 4));
        q.push(key("h2"), QueueSlot::new(Priority::High, 5));

        let order: Vec<_> =
            std::iter::from_fn(|| q.pop().map(|(_, k)| k)).collect();
        assert_eq!(
            order,
            vec![key("h1"), key("h2"), key("n1"), key("n2"), key("l1")]
        );
    }

    #[test]
    fn overflow_drops_lowest_priority_tail() {
        let mut q = PendingQueue::new(2);
        q.push(key("l1"), QueueSlot::new(Priority::Low, 1));
        q.push(key("n1"), QueueSlot::new(Priority::Normal, 2));
        let dropped = q.push(key("h1"), QueueSlot::new(Priority::High, 3));

        assert_eq!(dropped, vec![key("l1")]);
        assert_eq!(
            q.keys().cloned().collect::<Vec<_>>(),
            vec![key("h1"), key("n1")]
        );
    }

    #[test]
    fn newest_entry_is_not_dropped_for_being_newest() {
        let mut q = PendingQueue::new(2);
        q.push(key("n1"), QueueSlot::new(Priority::Normal, 1));
        q.push(key("n2"), QueueSlot::new(Priority::Normal, 2));
        let dropped = q.push(key("n3"), QueueSlot::new(Priority::Normal, 3));

        assert_eq!(dropped, vec![key("n2")]);
        assert!(q.keys().any(|k| k == &key("n3")));
    }

    #[test]
    fn strictly_lower_newcomer_is_dropped() {
        let mut q = PendingQueue::new(1);
        q.push(key("h1"), QueueSlot::new(Priority::High, 1));
        let dropped = q.push(key("l1"), QueueSlot::new(Priority::Low, 2));
        assert_eq!(dropped, vec![key("l1")]);
    }

    #[test]
    fn reposition_changes_order() {
        let mut q = PendingQueue::new(4);
        let low = QueueSlot::new(Priority::Low, 1);
        q.push(key("a"), low);
        q.push(key("b"), QueueSlot::new(Priority::Normal, 2));
        assert!(q.reposition(&low, QueueSlot::new(Priority::High, 1)));
        assert_eq!(q.pop().map(|(_, k)| k), Some(key("a")));
    }
}
