//! The engine's serial context.
//!
//! Every bookkeeping structure is owned by [`EngineActor`] and mutated only
//! from its loop. Fetches run as independent tasks and report back through
//! the internal channel, so no lock guards admission, the ledger or the
//! prepared store.

use std::{collections::HashMap, sync::Arc, time::Duration};

use feedmedia_model::{
    ItemId, LoadProgress, MediaRef, Priority, RequestKey, RequestState,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::Instrument;

use super::{
    events::{EngineEvent, EngineStats},
    outcomes::{OUTCOME_HISTORY, OutcomeLog},
};
use crate::{
    admission::{Admission, AdmissionController, CancelResult, Launch, Ticket},
    cache::{DiskSpillover, LiveCacheControl, ResourceStore, StorePolicy},
    config::EngineConfig,
    error::{EngineError, FailureClass, FetchError},
    fetch::{FetchExecutor, FetchOutcome},
    prepared::{LoadSource, PreparedMedia},
    pressure::{
        LifecycleState, PressureGovernor, PressureLevel, PressureResponse,
    },
    request::{LoadOutcome, LoadRequest, Waiters},
    retry::{RetryDecision, RetryLedger},
    visibility::{VisibilityPlan, VisibilitySnapshot, VisibilityTracker},
};

pub(super) type Reply<T> = oneshot::Sender<T>;

/// Messages from [`super::MediaEngine`] handles.
#[derive(Debug)]
pub(super) enum Command {
    Submit(LoadRequest),
    Cancel(RequestKey),
    Retry(RequestKey),
    SetVisibility {
        items: Vec<ItemId>,
        index: usize,
        reply: Reply<Result<(), EngineError>>,
    },
    SetItems(Vec<ItemId>),
    SetCurrentIndex {
        index: usize,
        reply: Reply<Result<(), EngineError>>,
    },
    RegisterMedia {
        item: ItemId,
        media: Vec<MediaRef>,
    },
    Pressure(PressureLevel),
    Lifecycle(LifecycleState),
    Cached {
        key: RequestKey,
        reply: Reply<Option<Arc<PreparedMedia>>>,
    },
    State {
        key: RequestKey,
        reply: Reply<Option<RequestState>>,
    },
    Stats(Reply<EngineStats>),
    Visibility(Reply<VisibilitySnapshot>),
    ClearAll(Reply<()>),
    Shutdown,
}

/// Messages from tasks the actor spawned.
#[derive(Debug)]
pub(super) enum Internal {
    Progress {
        key: RequestKey,
        progress: LoadProgress,
    },
    FetchFinished {
        key: RequestKey,
        outcome: FetchOutcome,
    },
    RetryDue {
        key: RequestKey,
        generation: u64,
    },
}

/// A failed key waiting out its backoff delay.
#[derive(Debug)]
struct Backoff {
    ticket: Ticket,
    generation: u64,
}

pub(super) struct EngineActor {
    config: EngineConfig,
    executor: FetchExecutor,
    disk: Option<Arc<DiskSpillover>>,
    admission: AdmissionController,
    visibility: VisibilityTracker,
    retry: RetryLedger,
    pressure: PressureGovernor,
    prepared: ResourceStore<Arc<PreparedMedia>>,
    live: Vec<Arc<dyn LiveCacheControl>>,
    /// Cleared under memory pressure.
    outcomes: OutcomeLog,
    backoff: HashMap<RequestKey, Backoff>,
    next_generation: u64,
    events: broadcast::Sender<EngineEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl EngineActor {
    pub(super) fn new(
        config: EngineConfig,
        executor: FetchExecutor,
        disk: Option<Arc<DiskSpillover>>,
        live: Vec<Arc<dyn LiveCacheControl>>,
        events: broadcast::Sender<EngineEvent>,
        internal_tx: mpsc::UnboundedSender<Internal>,
    ) -> Self {
        Self {
            admission: AdmissionController::new(&config.admission),
            visibility: VisibilityTracker::new(&config.visibility),
            retry: RetryLedger::new(&config.retry),
            pressure: PressureGovernor::new(&config.pressure),
            prepared: ResourceStore::new(
                "prepared",
                StorePolicy::from(&config.prepared_store),
            ),
            config,
            executor,
            disk,
            live,
            outcomes: OutcomeLog::new(OUTCOME_HISTORY),
            backoff: HashMap::new(),
            next_generation: 0,
            events,
            internal_tx,
        }
    }

    pub(super) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let drain_every = self.config.visibility.cancel_drain_interval();
        let mut drain_tick =
            interval_at(Instant::now() + drain_every, drain_every);
        drain_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let sweep_every = self.config.sweep_interval();
        let mut sweep_tick =
            interval_at(Instant::now() + sweep_every, sweep_every);
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let disk_every =
            Duration::from_secs(self.config.disk.sweep_interval_secs.max(1));
        let mut disk_tick =
            interval_at(Instant::now() + disk_every, disk_every);
        disk_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(
            max_concurrent = self.config.admission.max_concurrent,
            disk = self.disk.is_some(),
            live_caches = self.live.len(),
            "media engine started"
        );

        loop {
            tokio::select! {
                biased;
                Some(msg) = internal.recv() => self.on_internal(msg),
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd).await,
                },
                _ = drain_tick.tick() => self.on_drain_tick(),
                _ = sweep_tick.tick() => self.on_sweep_tick(),
                _ = disk_tick.tick() => self.on_disk_tick(),
            }
        }

        let signalled = self.admission.cancel_all().len();
        self.backoff.clear();
        tracing::debug!(signalled, "media engine stopped");
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Submit(request) => self.submit(request),
            Command::Cancel(key) => self.cancel(key),
            Command::Retry(key) => self.manual_retry(key),
            Command::SetVisibility { items, index, reply } => {
                let result = self
                    .visibility
                    .set_window(items, index)
                    .map(|plan| self.apply_plan(plan));
                let _ = reply.send(result);
            }
            Command::SetItems(items) => {
                let plan = self.visibility.set_items(items);
                self.apply_plan(plan);
            }
            Command::SetCurrentIndex { index, reply } => {
                let result = self
                    .visibility
                    .set_current_index(index)
                    .map(|plan| self.apply_plan(plan));
                let _ = reply.send(result);
            }
            Command::RegisterMedia { item, media } => {
                let plan = self.visibility.register_media(item, media);
                self.apply_plan(plan);
            }
            Command::Pressure(level) => {
                let response = self.pressure.on_pressure(level, Instant::now());
                self.admission.set_under_pressure(true);
                self.apply_pressure(response);
            }
            Command::Lifecycle(state) => {
                let response = self.pressure.on_lifecycle(state);
                self.apply_pressure(response);
            }
            Command::Cached { key, reply } => {
                let _ = reply.send(self.prepared.get(&key).cloned());
            }
            Command::State { key, reply } => {
                let _ = reply.send(self.state_of(&key));
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Visibility(reply) => {
                let _ = reply.send(self.visibility.snapshot());
            }
            Command::ClearAll(reply) => {
                self.clear_all().await;
                let _ = reply.send(());
            }
            // Handled by the loop.
            Command::Shutdown => {}
        }
    }

    fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Progress { key, progress } => {
                self.admission.notify_progress(&key, progress);
            }
            Internal::FetchFinished { key, outcome } => {
                self.on_fetch_finished(key, outcome);
            }
            Internal::RetryDue { key, generation } => {
                self.on_retry_due(key, generation);
            }
        }
    }

    fn submit(&mut self, mut request: LoadRequest) {
        let key = request.media.key.clone();
        if self.retry.is_permanent(&key) {
            tracing::debug!(key = %key, "submit ignored: permanently rejected");
            return;
        }
        if self.prepared.contains(&key) {
            tracing::trace!(key = %key, "submit ignored: already cached");
            return;
        }
        if self.retry.is_exhausted(&key) {
            tracing::debug!(
                key = %key,
                "submit ignored: retry budget exhausted"
            );
            return;
        }

        let waiters = Waiters::from_request(&mut request);
        if let Some(pending) = self.backoff.get_mut(&key) {
            pending.ticket.priority =
                pending.ticket.priority.elevate(request.priority);
            pending.ticket.waiters.merge(waiters);
            tracing::trace!(key = %key, "joined request waiting out backoff");
            return;
        }

        self.admit(Ticket {
            media: request.media,
            priority: request.priority,
            waiters,
        });
    }

    fn admit(&mut self, ticket: Ticket) {
        let key = ticket.media.key.clone();
        match self.admission.submit(ticket) {
            Admission::Started(launch) => {
                self.outcomes.remove(&key);
                self.spawn_fetch(launch);
            }
            Admission::Queued { dropped } => {
                self.outcomes.remove(&key);
                for dropped_key in dropped {
                    self.mark_cancelled(dropped_key);
                }
            }
            Admission::Joined | Admission::Deferred => {}
        }
    }

    fn drain(&mut self) {
        for launch in self.admission.drain() {
            self.spawn_fetch(launch);
        }
    }

    fn spawn_fetch(&self, launch: Launch) {
        let executor = self.executor.clone();
        let tx = self.internal_tx.clone();
        let key = launch.media.key.clone();
        let span = tracing::debug_span!(
            "fetch",
            key = %key,
            priority = ?launch.priority
        );

        tokio::spawn(
            async move {
                let progress_tx = tx.clone();
                let progress_key = key.clone();
                let sink = move |progress: LoadProgress| {
                    let _ = progress_tx.send(Internal::Progress {
                        key: progress_key.clone(),
                        progress,
                    });
                };
                let outcome = executor
                    .execute(&launch.media, &launch.token, &sink)
                    .await;
                let _ = tx.send(Internal::FetchFinished { key, outcome });
            }
            .instrument(span),
        );
    }

    fn on_fetch_finished(&mut self, key: RequestKey, outcome: FetchOutcome) {
        let Some(finished) = self.admission.finish(&key) else {
            tracing::warn!(
                key = %key,
                "fetch reported back for an untracked key"
            );
            return;
        };

        if finished.cancelled {
            tracing::debug!(key = %key, "discarding result of cancelled fetch");
            self.mark_cancelled(key);
            if let Some(ticket) = finished.resubmit {
                self.admit(ticket);
            }
            self.drain();
            return;
        }

        match outcome {
            FetchOutcome::Prepared { media, source } => {
                self.retry.clear(&key);
                let evicted = self.prepared.put(key.clone(), media.clone());
                if !evicted.is_empty() {
                    tracing::debug!(
                        count = evicted.len(),
                        "prepared store evicted LRU entries"
                    );
                }
                if source == LoadSource::Network {
                    self.persist(&key, &media);
                }
                self.outcomes.insert(key.clone(), RequestState::Completed);
                self.emit(EngineEvent::Loaded {
                    key,
                    source,
                });
                finished.waiters.complete(LoadOutcome::Loaded(media));
            }
            FetchOutcome::Failed(err) => {
                let ticket = Ticket {
                    media: finished.media,
                    priority: finished.priority,
                    waiters: finished.waiters,
                };
                self.on_failure(key, err, ticket);
            }
            FetchOutcome::Cancelled => {
                self.mark_cancelled(key);
            }
        }
        self.drain();
    }

    fn on_failure(&mut self, key: RequestKey, err: FetchError, ticket: Ticket) {
        match err.class() {
            FailureClass::Permanent => {
                tracing::warn!(key = %key, err = %err, "permanently rejected");
                self.retry.mark_permanent(&key);
                self.outcomes
                    .insert(key.clone(), RequestState::PermanentlyRejected);
                let reason = err.to_string();
                self.emit(EngineEvent::Rejected {
                    key,
                    reason: reason.clone(),
                });
                ticket.waiters.complete(LoadOutcome::Rejected(reason));
            }
            FailureClass::Transient => {
                let reason = err.to_string();
                match self.retry.record_failure(&key) {
                    RetryDecision::Retry(delay) => {
                        tracing::debug!(
                            key = %key,
                            err = %err,
                            ?delay,
                            "fetch failed; retry scheduled"
                        );
                        self.outcomes.insert(key.clone(), RequestState::Failed);
                        self.emit(EngineEvent::Failed {
                            key: key.clone(),
                            retry_in: Some(delay),
                            reason,
                        });
                        self.schedule_retry(key, ticket, delay);
                    }
                    RetryDecision::GiveUp => {
                        tracing::warn!(
                            key = %key,
                            err = %err,
                            "fetch failed; giving up"
                        );
                        self.outcomes.insert(key.clone(), RequestState::Failed);
                        self.emit(EngineEvent::Failed {
                            key,
                            retry_in: None,
                            reason: reason.clone(),
                        });
                        ticket.waiters.complete(LoadOutcome::GaveUp(reason));
                    }
                }
            }
            FailureClass::Cancelled => self.mark_cancelled(key),
        }
    }

    fn schedule_retry(
        &mut self,
        key: RequestKey,
        ticket: Ticket,
        delay: Duration,
    ) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.backoff.insert(key.clone(), Backoff { ticket, generation });

        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::RetryDue { key, generation });
        });
    }

    fn on_retry_due(&mut self, key: RequestKey, generation: u64) {
        match self.backoff.get(&key) {
            Some(pending) if pending.generation == generation => {}
            _ => return,
        }
        let Some(pending) = self.backoff.remove(&key) else {
            return;
        };
        if self.retry.is_permanent(&key) || self.prepared.contains(&key) {
            return;
        }
        tracing::debug!(
            key = %key,
            attempts = self.retry.attempts(&key),
            "retrying"
        );
        self.admit(pending.ticket);
    }

    fn cancel(&mut self, key: RequestKey) {
        let backed_off = self.backoff.remove(&key).is_some();
        match self.admission.cancel(&key) {
            CancelResult::Dequeued => self.mark_cancelled(key),
            // Reported once the task winds down.
            CancelResult::Signalled => {}
            CancelResult::NotTracked if backed_off => self.mark_cancelled(key),
            CancelResult::NotTracked => {}
        }
    }

    fn manual_retry(&mut self, key: RequestKey) {
        self.retry.manual_retry(&key);
        if matches!(
            self.outcomes.get(&key),
            Some(RequestState::Failed | RequestState::PermanentlyRejected)
        ) {
            self.outcomes.remove(&key);
        }

        if let Some(pending) = self.backoff.remove(&key) {
            tracing::debug!(key = %key, "manual retry skips remaining backoff");
            self.admit(pending.ticket);
            return;
        }
        if let Some(desired) = self.visibility.desired(&key) {
            self.submit(LoadRequest::new(desired.media, desired.priority));
        }
    }

    fn apply_plan(&mut self, plan: VisibilityPlan) {
        for key in &plan.reappeared {
            if self.retry.record_reappearance(key) {
                tracing::debug!(
                    key = %key,
                    "retry count reset on reappearance"
                );
            }
        }
        for desired in plan.submit {
            if self.prepared.contains(&desired.media.key) {
                continue;
            }
            self.submit(LoadRequest::new(desired.media, desired.priority));
        }
        self.emit(EngineEvent::VisibilityChanged(self.visibility.snapshot()));
    }

    fn apply_pressure(&mut self, response: PressureResponse) {
        if let Some(threshold) = response.cancel_below {
            self.cancel_below(threshold);
        }
        if response.clear_bookkeeping {
            self.outcomes.clear();
        }
        if response.release_percent > 0 {
            let pct = response.release_percent;
            self.prepared.release_partial(pct);
            for cache in &self.live {
                cache.release_partial(pct);
            }
            if response.release_disk
                && let Some(disk) = self.disk.clone()
            {
                tokio::spawn(async move {
                    disk.release_partial(pct).await;
                });
            }
        }
        if response.drain_queue {
            self.drain();
        }
        if response.reconcile_live {
            for cache in &self.live {
                cache.reconcile_all();
            }
        }
    }

    fn cancel_below(&mut self, threshold: Priority) {
        let mut cancelled = 0usize;
        for (key, result) in self.admission.cancel_below(threshold) {
            cancelled += 1;
            if result == CancelResult::Dequeued {
                self.mark_cancelled(key);
            }
        }
        let backed_off: Vec<RequestKey> = self
            .backoff
            .iter()
            .filter(|(_, b)| b.ticket.priority < threshold)
            .map(|(k, _)| k.clone())
            .collect();
        for key in backed_off {
            self.backoff.remove(&key);
            self.mark_cancelled(key);
            cancelled += 1;
        }
        if cancelled > 0 {
            tracing::info!(
                ?threshold,
                cancelled,
                "cancelled requests below threshold"
            );
        }
    }

    fn on_drain_tick(&mut self) {
        let batch = self.config.visibility.cancel_batch_size;
        let keys = self.visibility.drain_cancellations(batch);
        if !keys.is_empty() {
            tracing::trace!(
                count = keys.len(),
                "draining deferred cancellations"
            );
        }
        for key in keys {
            self.cancel(key);
        }

        if self.pressure.tick(Instant::now()) {
            self.admission.set_under_pressure(false);
            self.drain();
        }
    }

    fn on_sweep_tick(&mut self) {
        let now = Instant::now();
        let mut swept = self.prepared.sweep_expired(now);
        for cache in &self.live {
            swept += cache.sweep_expired(now);
        }
        if swept > 0 {
            tracing::debug!(swept, "ttl sweep");
        }
    }

    fn on_disk_tick(&self) {
        if let Some(disk) = self.disk.clone() {
            tokio::spawn(async move {
                disk.cleanup_once().await;
            });
        }
    }

    /// Writes the derivative behind the accepted result.
    fn persist(&self, key: &RequestKey, media: &PreparedMedia) {
        let (Some(disk), Some(image)) = (self.disk.clone(), media.as_image())
        else {
            return;
        };
        let key = key.clone();
        let encoded = image.encoded.clone();
        tokio::spawn(async move {
            if let Err(e) = disk.write(&key, &encoded).await {
                tracing::warn!(
                    key = %key,
                    err = %e,
                    "failed to persist derivative"
                );
            }
        });
    }

    async fn clear_all(&mut self) {
        for (key, result) in self.admission.cancel_all() {
            if result == CancelResult::Dequeued {
                self.mark_cancelled(key);
            }
        }
        self.backoff.clear();
        let prepared = self.prepared.clear();
        let mut live = 0;
        for cache in &self.live {
            live += cache.clear();
        }
        self.retry.reset();
        self.outcomes.clear();
        self.pressure.reset();
        self.admission.set_under_pressure(false);
        if let Some(disk) = &self.disk
            && let Err(e) = disk.clear().await
        {
            tracing::warn!(err = %e, "failed to clear disk spillover");
        }
        tracing::info!(prepared, live, "cleared all caches");
    }

    fn mark_cancelled(&mut self, key: RequestKey) {
        self.outcomes.insert(key.clone(), RequestState::Cancelled);
        self.emit(EngineEvent::Cancelled { key });
    }

    fn state_of(&self, key: &RequestKey) -> Option<RequestState> {
        if let Some(state) = self.admission.state(key) {
            return Some(state);
        }
        if self.backoff.contains_key(key) {
            return Some(RequestState::Pending);
        }
        if self.retry.is_permanent(key) {
            return Some(RequestState::PermanentlyRejected);
        }
        if self.prepared.contains(key) {
            return Some(RequestState::Completed);
        }
        self.outcomes.get(key)
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            active: self.admission.active_count(),
            queued: self.admission.queued_count(),
            backing_off: self.backoff.len(),
            prepared_entries: self.prepared.len(),
            prepared_bytes: self.prepared.total_cost(),
            live_entries: self.live.iter().map(|c| c.len()).sum(),
            pending_cancellations: self.visibility.pending_cancellations(),
            permanently_rejected: self.retry.permanent_count(),
            under_pressure: self.pressure.is_under_pressure(),
            disk_usage_bytes: self.disk.as_ref().map(|d| d.usage().as_bytes()),
            disk: self.disk.as_ref().map(|d| d.stats_snapshot()),
        }
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
