//! Public entry point.
//!
//! [`MediaEngine`] is a cheap, cloneable handle onto a single actor task
//! that owns all engine state. Dropping every handle, or calling
//! [`MediaEngine::shutdown`], stops the actor and cancels in-flight fetches.

mod actor;
mod events;
mod outcomes;

pub use events::{EngineEvent, EngineStats};

use std::sync::Arc;

use feedmedia_model::{ItemId, MediaRef, RequestKey, RequestState};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::Instrument;

use actor::{Command, EngineActor};

use crate::{
    cache::{
        DiskSpillover, LiveCacheControl, LiveHandleCache, LiveResource,
        StorePolicy,
    },
    config::EngineConfig,
    error::{EngineError, Result},
    fetch::{FetchExecutor, HttpTransport, MediaTransport},
    prepared::PreparedMedia,
    pressure::{LifecycleState, PressureLevel},
    request::LoadRequest,
    visibility::VisibilitySnapshot,
};

#[derive(Debug, Clone)]
pub struct MediaEngine {
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<EngineEvent>,
}

impl MediaEngine {
    /// Start an engine with an explicit transport and optional disk
    /// spillover. Must be called from within a tokio runtime.
    pub fn start(
        config: EngineConfig,
        transport: Arc<dyn MediaTransport>,
        disk: Option<Arc<DiskSpillover>>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let mut builder = Self::builder(config).transport(transport);
        builder.disk = DiskChoice::Given(disk);
        builder.start()
    }

    pub fn builder(config: EngineConfig) -> MediaEngineBuilder {
        MediaEngineBuilder::new(config)
    }

    /// Submit a load. Malformed requests fail here; everything else is
    /// advisory and may be dropped silently (cached, rejected, exhausted,
    /// or pushed out of a full queue).
    pub fn submit(&self, request: LoadRequest) -> Result<()> {
        request.media.validate()?;
        self.send(Command::Submit(request))
    }

    pub fn cancel(&self, key: &RequestKey) -> Result<()> {
        self.send(Command::Cancel(key.clone()))
    }

    /// Explicit user retry. Clears the key's attempt count and any permanent
    /// rejection; a key still in the visibility window is resubmitted.
    pub fn retry(&self, key: &RequestKey) -> Result<()> {
        self.send(Command::Retry(key.clone()))
    }

    /// Replace the item list and move to `index` in one step.
    pub async fn set_visibility(
        &self,
        items: Vec<ItemId>,
        index: usize,
    ) -> Result<()> {
        self.request(|reply| Command::SetVisibility { items, index, reply })
            .await?
    }

    pub fn set_items(&self, items: Vec<ItemId>) -> Result<()> {
        self.send(Command::SetItems(items))
    }

    /// Rejects an out-of-range index without changing any state.
    pub async fn set_current_index(&self, index: usize) -> Result<()> {
        self.request(|reply| Command::SetCurrentIndex { index, reply })
            .await?
    }

    pub fn register_item_media(
        &self,
        item: ItemId,
        media: Vec<MediaRef>,
    ) -> Result<()> {
        for m in &media {
            m.validate()?;
        }
        self.send(Command::RegisterMedia { item, media })
    }

    /// Platform memory warning; treated as critical pressure.
    pub fn notify_memory_warning(&self) -> Result<()> {
        self.notify_pressure(PressureLevel::Critical)
    }

    pub fn notify_pressure(&self, level: PressureLevel) -> Result<()> {
        self.send(Command::Pressure(level))
    }

    pub fn notify_lifecycle(&self, state: LifecycleState) -> Result<()> {
        self.send(Command::Lifecycle(state))
    }

    /// Prepared payload for `key`, refreshing its LRU position.
    pub async fn cached(
        &self,
        key: &RequestKey,
    ) -> Result<Option<Arc<PreparedMedia>>> {
        let key = key.clone();
        self.request(|reply| Command::Cached { key, reply }).await
    }

    pub async fn state(
        &self,
        key: &RequestKey,
    ) -> Result<Option<RequestState>> {
        let key = key.clone();
        self.request(|reply| Command::State { key, reply }).await
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        self.request(Command::Stats).await
    }

    pub async fn visibility(&self) -> Result<VisibilitySnapshot> {
        self.request(Command::Visibility).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Clear both memory stores, live caches, disk spillover, the retry
    /// ledger and all request bookkeeping.
    pub async fn clear_all(&self) -> Result<()> {
        self.request(Command::ClearAll).await
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).map_err(|_| EngineError::Stopped)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| EngineError::Stopped)
    }
}

#[derive(Debug, Default)]
enum DiskChoice {
    /// Open from `EngineConfig::disk`.
    #[default]
    FromConfig,
    Given(Option<Arc<DiskSpillover>>),
}

#[derive(Debug)]
pub struct MediaEngineBuilder {
    config: EngineConfig,
    transport: Option<Arc<dyn MediaTransport>>,
    disk: DiskChoice,
    live: Vec<Arc<dyn LiveCacheControl>>,
}

impl MediaEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            transport: None,
            disk: DiskChoice::default(),
            live: Vec::new(),
        }
    }

    /// Defaults to [`HttpTransport`] built from `config.fetch`.
    pub fn transport(mut self, transport: Arc<dyn MediaTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn disk(mut self, disk: Arc<DiskSpillover>) -> Self {
        self.disk = DiskChoice::Given(Some(disk));
        self
    }

    pub fn without_disk(mut self) -> Self {
        self.disk = DiskChoice::Given(None);
        self
    }

    /// Put a caller-owned live cache under the engine's sweeps and pressure
    /// handling.
    pub fn live_cache(mut self, cache: Arc<dyn LiveCacheControl>) -> Self {
        self.live.push(cache);
        self
    }

    /// Create a live cache sized by `config.live_store`, register it, and
    /// hand it back for render-path access.
    pub fn new_live_cache<H: LiveResource>(
        &mut self,
        name: &'static str,
    ) -> Arc<LiveHandleCache<H>> {
        let cache = Arc::new(LiveHandleCache::new(
            name,
            StorePolicy::from(&self.config.live_store),
        ));
        self.live.push(cache.clone());
        cache
    }

    pub fn start(self) -> Result<(MediaEngine, JoinHandle<()>)> {
        let Self {
            config,
            transport,
            disk,
            live,
        } = self;
        config.validate()?;

        let transport: Arc<dyn MediaTransport> = match transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&config.fetch)?),
        };
        let disk = match disk {
            DiskChoice::Given(disk) => disk,
            DiskChoice::FromConfig => DiskSpillover::from_config(&config.disk)
                .map_err(|e| EngineError::Disk(e.to_string()))?
                .map(Arc::new),
        };

        let executor =
            FetchExecutor::new(transport, disk.clone(), &config.fetch);
        let (tx, rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let actor = EngineActor::new(
            config,
            executor,
            disk,
            live,
            events.clone(),
            internal_tx,
        );
        let join = tokio::spawn(
            actor
                .run(rx, internal_rx)
                .instrument(tracing::info_span!("media_engine")),
        );

        Ok((MediaEngine { tx, events }, join))
    }
}
