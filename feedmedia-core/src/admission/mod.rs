//! Bounded-concurrency gate with single-flight de-duplication.
//!
//! Owns every in-flight request: `Pending` ones sit in a bounded priority
//! queue, `Active` ones hold a cancellation token shared with their fetch
//! task. A key is tracked at most once, which is what keeps a second
//! executor from ever starting for it.

mod queue;

pub use queue::{PendingQueue, QueueSlot};

use std::collections::HashMap;

use feedmedia_model::{
    LoadProgress, MediaRef, Priority, RequestKey, RequestState,
};
use tokio_util::sync::CancellationToken;

use crate::{config::AdmissionConfig, request::Waiters};

/// Everything needed to (re)admit one key.
#[derive(Debug)]
pub struct Ticket {
    pub media: MediaRef,
    pub priority: Priority,
    pub waiters: Waiters,
}

/// Instruction to start a fetch task.
#[derive(Debug, Clone)]
pub struct Launch {
    pub media: MediaRef,
    pub priority: Priority,
    pub token: CancellationToken,
}

#[derive(Debug)]
pub enum Admission {
    Started(Launch),
    Queued { dropped: Vec<RequestKey> },
    /// Joined an existing pending or active request for the same key.
    Joined,
    /// The key's previous task is still winding down after cancellation;
    /// the ticket is admitted once it reports back.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    Dequeued,
    Signalled,
    NotTracked,
}

/// A tracked key leaving the controller after its task reported back.
#[derive(Debug)]
pub struct Finished {
    pub media: MediaRef,
    pub priority: Priority,
    pub waiters: Waiters,
    /// Cancellation was requested while the task ran; its result must be
    /// discarded.
    pub cancelled: bool,
    pub resubmit: Option<Ticket>,
}

#[derive(Debug)]
enum Phase {
    Pending(QueueSlot),
    Active(CancellationToken),
    /// Signalled; the slot is held until the task reports back.
    Cancelling { resubmit: Option<Ticket> },
}

#[derive(Debug)]
struct Tracked {
    media: MediaRef,
    priority: Priority,
    phase: Phase,
    waiters: Waiters,
}

#[derive(Debug)]
pub struct AdmissionController {
    max_concurrent: usize,
    queue: PendingQueue,
    tracked: HashMap<RequestKey, Tracked>,
    running: usize,
    next_seq: u64,
    under_pressure: bool,
}

impl AdmissionController {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent.max(1),
            queue: PendingQueue::new(config.queue_capacity),
            tracked: HashMap::new(),
            running: 0,
            next_seq: 0,
            under_pressure: false,
        }
    }

    pub fn set_under_pressure(&mut self, under_pressure: bool) {
        self.under_pressure = under_pressure;
    }

    pub fn under_pressure(&self) -> bool {
        self.under_pressure
    }

    /// Fetch tasks currently running, including ones winding down after a
    /// cancellation.
    pub fn active_count(&self) -> usize {
        self.running
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    pub fn is_tracked(&self, key: &RequestKey) -> bool {
        self.tracked.contains_key(key)
    }

    pub fn queued_keys(&self) -> Vec<RequestKey> {
        self.queue.keys().cloned().collect()
    }

    pub fn state(&self, key: &RequestKey) -> Option<RequestState> {
        self.tracked.get(key).map(|t| match &t.phase {
            Phase::Pending(_) => RequestState::Pending,
            Phase::Active(_) => RequestState::Active,
            Phase::Cancelling { resubmit: Some(_) } => RequestState::Pending,
            Phase::Cancelling { resubmit: None } => RequestState::Cancelled,
        })
    }

    /// Admission rules for a key that is not cached or permanently
    /// rejected: join in-flight work, queue under pressure or at the
    /// ceiling, otherwise start.
    pub fn submit(&mut self, ticket: Ticket) -> Admission {
        let key = ticket.media.key.clone();

        if let Some(tracked) = self.tracked.get_mut(&key) {
            let upgraded = ticket.priority > tracked.priority;
            tracked.priority = tracked.priority.elevate(ticket.priority);
            match &mut tracked.phase {
                Phase::Active(_) => {
                    tracked.waiters.merge(ticket.waiters);
                }
                Phase::Pending(slot) => {
                    tracked.waiters.merge(ticket.waiters);
                    if upgraded {
                        let to = QueueSlot::new(tracked.priority, slot.seq());
                        self.queue.reposition(slot, to);
                        *slot = to;
                    }
                }
                Phase::Cancelling { resubmit } => {
                    match resubmit {
                        Some(pending) => {
                            pending.priority =
                                pending.priority.elevate(ticket.priority);
                            pending.waiters.merge(ticket.waiters);
                        }
                        None => *resubmit = Some(ticket),
                    }
                    return Admission::Deferred;
                }
            }
            tracing::trace!(key = %key, "joined in-flight request");
            return Admission::Joined;
        }

        let degraded = self.under_pressure && ticket.priority < Priority::High;
        if !degraded && self.running < self.max_concurrent {
            return Admission::Started(self.activate(ticket));
        }

        let slot = QueueSlot::new(ticket.priority, self.bump_seq());
        self.tracked.insert(
            key.clone(),
            Tracked {
                media: ticket.media,
                priority: ticket.priority,
                phase: Phase::Pending(slot),
                waiters: ticket.waiters,
            },
        );
        let dropped = self.queue.push(key.clone(), slot);
        for dropped_key in &dropped {
            self.tracked.remove(dropped_key);
            tracing::debug!(key = %dropped_key, "dropped from full queue");
        }
        tracing::debug!(
            key = %key,
            degraded,
            queued = self.queue.len(),
            "queued"
        );
        Admission::Queued { dropped }
    }

    /// Admit queued work while headroom exists. Under pressure only
    /// `High` and above leave the queue.
    pub fn drain(&mut self) -> Vec<Launch> {
        let mut launches = Vec::new();
        while self.running < self.max_concurrent {
            let Some(next) = self.queue.peek_priority() else {
                break;
            };
            if self.under_pressure && next < Priority::High {
                break;
            }
            let Some((_, key)) = self.queue.pop() else {
                break;
            };
            let Some(tracked) = self.tracked.remove(&key) else {
                continue;
            };
            launches.push(self.activate(Ticket {
                media: tracked.media,
                priority: tracked.priority,
                waiters: tracked.waiters,
            }));
        }
        launches
    }

    /// The fetch task for `key` reported back. Frees its slot.
    pub fn finish(&mut self, key: &RequestKey) -> Option<Finished> {
        let Tracked {
            media,
            priority,
            phase,
            waiters,
        } = self.tracked.remove(key)?;
        let (cancelled, resubmit) = match phase {
            Phase::Active(_) => (false, None),
            Phase::Cancelling { resubmit } => (true, resubmit),
            pending @ Phase::Pending(_) => {
                // Not running; put it back untouched.
                self.tracked.insert(
                    key.clone(),
                    Tracked {
                        media,
                        priority,
                        phase: pending,
                        waiters,
                    },
                );
                return None;
            }
        };
        self.running = self.running.saturating_sub(1);
        Some(Finished {
            media,
            priority,
            waiters,
            cancelled,
            resubmit,
        })
    }

    /// Pending keys leave the queue at once; active ones are signalled and
    /// stay tracked until their task reports back.
    pub fn cancel(&mut self, key: &RequestKey) -> CancelResult {
        let Some(tracked) = self.tracked.get_mut(key) else {
            return CancelResult::NotTracked;
        };
        match &mut tracked.phase {
            Phase::Pending(slot) => {
                let slot = *slot;
                self.queue.remove(&slot);
                self.tracked.remove(key);
                CancelResult::Dequeued
            }
            Phase::Active(token) => {
                token.cancel();
                tracked.phase = Phase::Cancelling { resubmit: None };
                // Callbacks are dropped with the cancelled request.
                tracked.waiters = Waiters::default();
                CancelResult::Signalled
            }
            Phase::Cancelling { resubmit } => {
                *resubmit = None;
                CancelResult::Signalled
            }
        }
    }

    /// Cancel every pending or active request below `threshold`.
    pub fn cancel_below(
        &mut self,
        threshold: Priority,
    ) -> Vec<(RequestKey, CancelResult)> {
        let victims: Vec<RequestKey> = self
            .tracked
            .iter()
            .filter(|(_, t)| t.priority < threshold)
            .filter(|(_, t)| {
                !matches!(t.phase, Phase::Cancelling { resubmit: None })
            })
            .map(|(k, _)| k.clone())
            .collect();
        victims
            .into_iter()
            .map(|key| {
                let result = self.cancel(&key);
                (key, result)
            })
            .collect()
    }

    pub fn cancel_all(&mut self) -> Vec<(RequestKey, CancelResult)> {
        let keys: Vec<RequestKey> = self.tracked.keys().cloned().collect();
        keys.into_iter()
            .map(|key| {
                let result = self.cancel(&key);
                (key, result)
            })
            .collect()
    }

    pub fn notify_progress(&self, key: &RequestKey, progress: LoadProgress) {
        if let Some(tracked) = self.tracked.get(key)
            && matches!(tracked.phase, Phase::Active(_))
        {
            tracked.waiters.notify_progress(progress);
        }
    }

    fn activate(&mut self, ticket: Ticket) -> Launch {
        let key = ticket.media.key.clone();
        let token = CancellationToken::new();
        self.running += 1;
        self.tracked.insert(
            key.clone(),
            Tracked {
                media: ticket.media.clone(),
                priority: ticket.priority,
                phase: Phase::Active(token.clone()),
                waiters: ticket.waiters,
            },
        );
        tracing::debug!(
            key = %key,
            priority = ?ticket.priority,
            active = self.running,
            "admitted"
        );
        Launch {
            media: ticket.media,
            priority: ticket.priority,
            token,
        }
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}
