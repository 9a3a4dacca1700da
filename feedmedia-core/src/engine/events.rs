use std::time::Duration;

use feedmedia_model::RequestKey;

use crate::{
    cache::disk::DiskStatsSnapshot, prepared::LoadSource,
    visibility::VisibilitySnapshot,
};

/// Broadcast to every subscriber of [`super::MediaEngine::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Loaded {
        key: RequestKey,
        source: LoadSource,
    },
    /// A transient failure. `retry_in` is `None` once the retry budget is
    /// spent.
    Failed {
        key: RequestKey,
        retry_in: Option<Duration>,
        reason: String,
    },
    /// The resource is not usable media.
    Rejected { key: RequestKey, reason: String },
    /// Cancelled, dropped from a full queue, or discarded after a
    /// cancelled fetch reported back.
    Cancelled { key: RequestKey },
    VisibilityChanged(VisibilitySnapshot),
}

impl EngineEvent {
    pub fn key(&self) -> Option<&RequestKey> {
        match self {
            EngineEvent::Loaded { key, .. }
            | EngineEvent::Failed { key, .. }
            | EngineEvent::Rejected { key, .. }
            | EngineEvent::Cancelled { key } => Some(key),
            EngineEvent::VisibilityChanged(_) => None,
        }
    }
}

/// Point-in-time diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub active: usize,
    pub queued: usize,
    /// Keys waiting out a retry backoff.
    pub backing_off: usize,
    pub prepared_entries: usize,
    pub prepared_bytes: u64,
    pub live_entries: usize,
    pub pending_cancellations: usize,
    pub permanently_rejected: usize,
    pub under_pressure: bool,
    pub disk_usage_bytes: Option<u64>,
    pub disk: Option<DiskStatsSnapshot>,
}
