//! Caller-facing load requests and the callbacks attached to them.

use std::{fmt, sync::Arc};

use feedmedia_model::{LoadProgress, MediaRef, Priority, RequestKey};

use crate::prepared::PreparedMedia;

/// Terminal outcome delivered to result callbacks.
///
/// Cancellation and queue drops never invoke callbacks: submission is
/// advisory and callers re-submit on the next visibility pass.
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    Loaded(Arc<PreparedMedia>),
    /// The resource is not usable media; it will not be retried
    /// automatically.
    Rejected(String),
    /// Transient failures exhausted the retry budget.
    GaveUp(String),
}

pub type ResultCallback = Box<dyn FnOnce(LoadOutcome) + Send + 'static>;
pub type ProgressCallback = Arc<dyn Fn(LoadProgress) + Send + Sync + 'static>;

/// A request to acquire one resource.
///
/// Immutable once submitted; re-submitting the same key creates a new
/// request that joins any in-flight work for that key.
pub struct LoadRequest {
    pub media: MediaRef,
    pub priority: Priority,
    pub on_result: Option<ResultCallback>,
    pub on_progress: Option<ProgressCallback>,
}

impl LoadRequest {
    pub fn new(media: MediaRef, priority: Priority) -> Self {
        Self {
            media,
            priority,
            on_result: None,
            on_progress: None,
        }
    }

    pub fn on_result<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(LoadOutcome) + Send + 'static,
    {
        self.on_result = Some(Box::new(callback));
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(LoadProgress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn key(&self) -> &RequestKey {
        &self.media.key
    }
}

impl fmt::Debug for LoadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadRequest")
            .field("media", &self.media)
            .field("priority", &self.priority)
            .field("on_result", &self.on_result.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// Everyone waiting on one key: the original submitter plus any callers
/// that joined while the key was in flight.
#[derive(Default)]
pub struct Waiters {
    results: Vec<ResultCallback>,
    progress: Vec<ProgressCallback>,
}

impl Waiters {
    pub fn from_request(request: &mut LoadRequest) -> Self {
        let mut waiters = Self::default();
        waiters.results.extend(request.on_result.take());
        waiters.progress.extend(request.on_progress.take());
        waiters
    }

    pub fn merge(&mut self, other: Waiters) {
        self.results.extend(other.results);
        self.progress.extend(other.progress);
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty() && self.progress.is_empty()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn notify_progress(&self, progress: LoadProgress) {
        for callback in &self.progress {
            callback(progress);
        }
    }

    /// Fan the outcome out to every result callback.
    pub fn complete(self, outcome: LoadOutcome) {
        for callback in self.results {
            callback(outcome.clone());
        }
    }
}

impl fmt::Debug for Waiters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiters")
            .field("results", &self.results.len())
            .field("progress", &self.progress.len())
            .finish()
    }
}
