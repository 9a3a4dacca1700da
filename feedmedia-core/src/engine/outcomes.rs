use std::collections::{HashMap, VecDeque};

use feedmedia_model::{RequestKey, RequestState};

/// Most recent keys kept when nothing else tracks them.
pub(super) const OUTCOME_HISTORY: usize = 1024;

/// Terminal states of keys no longer tracked anywhere else, capped at the
/// `capacity` most recently settled keys.
#[derive(Debug)]
pub(super) struct OutcomeLog {
    capacity: usize,
    states: HashMap<RequestKey, (RequestState, u64)>,
    /// Insertion order. Rows whose sequence no longer matches `states` are
    /// stale and skipped.
    order: VecDeque<(RequestKey, u64)>,
    next_seq: u64,
}

impl OutcomeLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            states: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
        }
    }

    pub fn insert(&mut self, key: RequestKey, state: RequestState) {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.states.insert(key.clone(), (state, seq));
        self.order.push_back((key, seq));

        while self.states.len() > self.capacity {
            let Some((oldest, seq)) = self.order.pop_front() else {
                break;
            };
            if self.is_current(&oldest, seq) {
                self.states.remove(&oldest);
            }
        }
        if self.order.len() > self.capacity * 2 {
            let states = &self.states;
            self.order.retain(|(key, seq)| {
                states.get(key).is_some_and(|(_, current)| current == seq)
            });
        }
    }

    pub fn get(&self, key: &RequestKey) -> Option<RequestState> {
        self.states.get(key).map(|(state, _)| *state)
    }

    pub fn remove(&mut self, key: &RequestKey) {
        self.states.remove(key);
    }

    pub fn clear(&mut self) {
        self.states.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    fn is_current(&self, key: &RequestKey, seq: u64) -> bool {
        self.states.get(key).is_some_and(|(_, current)| *current == seq)
    }
}
