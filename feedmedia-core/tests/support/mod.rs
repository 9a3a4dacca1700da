//! Shared fixtures for engine integration tests.
#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    io::Cursor,
    sync::{Arc, Once},
    time::Duration,
};

use async_trait::async_trait;
use feedmedia_core::{
    EngineConfig, EngineEvent, FetchError, FetchedBody, LoadProgress, MediaRef,
    MediaTransport, ProbeResponse, ProgressSink, RequestKey,
};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use url::Url;

/// One scripted response.
#[derive(Debug, Clone)]
pub enum Reply {
    Body {
        status: u16,
        content_type: Option<String>,
        bytes: Vec<u8>,
    },
    Error(FetchError),
}

impl Reply {
    pub fn png(bytes: Vec<u8>) -> Self {
        Reply::Body {
            status: 200,
            content_type: Some("image/png".into()),
            bytes,
        }
    }

    pub fn status(status: u16) -> Self {
        Reply::Body {
            status,
            content_type: Some("text/plain".into()),
            bytes: Vec::new(),
        }
    }

    pub fn html() -> Self {
        Reply::Body {
            status: 200,
            content_type: Some("text/html; charset=utf-8".into()),
            bytes: b"<!doctype html><title>Not Found</title>".to_vec(),
        }
    }
}

/// Scripted in-memory transport.
///
/// Each URL replays its script in order; the last reply repeats. Unscripted
/// URLs answer 404. When gated, every GET parks until the test adds a
/// permit to the gate.
#[derive(Debug, Default)]
pub struct FakeTransport {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    probes: Mutex<HashMap<String, ProbeResponse>>,
    calls: Mutex<HashMap<String, usize>>,
    gate: Option<Arc<Semaphore>>,
    ignore_cancel: bool,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// GETs wait on the returned semaphore, which starts without permits.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let transport = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (transport, gate)
    }

    /// Keep transferring after cancellation, like a request already on the
    /// wire.
    pub fn ignoring_cancellation(mut self) -> Self {
        self.ignore_cancel = true;
        self
    }

    pub fn script(&self, url: &str, replies: Vec<Reply>) {
        self.scripts
            .lock()
            .insert(url.to_string(), replies.into_iter().collect());
    }

    pub fn probe_ok(&self, url: &str, content_type: &str) {
        self.head_reply(url, 200, Some(content_type));
    }

    pub fn head_reply(
        &self,
        url: &str,
        status: u16,
        content_type: Option<&str>,
    ) {
        self.probes.lock().insert(
            url.to_string(),
            ProbeResponse {
                status,
                content_type: content_type.map(str::to_string),
            },
        );
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    fn next_reply(&self, url: &str) -> Reply {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => {
                queue.front().cloned().unwrap_or(Reply::status(404))
            }
            None => Reply::status(404),
        }
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn get(
        &self,
        locator: &Url,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> Result<FetchedBody, FetchError> {
        let url = locator.as_str().to_string();
        *self.calls.lock().entry(url.clone()).or_default() += 1;

        if let Some(gate) = &self.gate {
            if self.ignore_cancel {
                gate.acquire().await.unwrap().forget();
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(FetchError::Cancelled);
                    }
                    permit = gate.acquire() => permit.unwrap().forget(),
                }
            }
        }

        match self.next_reply(&url) {
            Reply::Body {
                status,
                content_type,
                bytes,
            } => {
                progress(LoadProgress {
                    received: bytes.len() as u64,
                    expected: Some(bytes.len() as u64),
                });
                Ok(FetchedBody {
                    status,
                    content_type,
                    bytes,
                })
            }
            Reply::Error(err) => Err(err),
        }
    }

    async fn probe(
        &self,
        locator: &Url,
    ) -> Result<ProbeResponse, FetchError> {
        Ok(self
            .probes
            .lock()
            .get(locator.as_str())
            .cloned()
            .unwrap_or(ProbeResponse {
                status: 404,
                content_type: None,
            }))
    }
}

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::from_default_env();
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Engine config for tests: no disk, small ceiling, quick cancellation
/// drain.
pub fn test_config(max_concurrent: usize) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.admission.max_concurrent = max_concurrent;
    config.disk.enabled = false;
    config.visibility.cancel_drain_interval_ms = 50;
    config
}

pub fn url_for(key: &str) -> String {
    format!("https://cdn.example.com/media/{key}.png")
}

pub fn image_ref(key: &str) -> MediaRef {
    MediaRef::image(key, Url::parse(&url_for(key)).unwrap())
}

pub fn key(s: &str) -> RequestKey {
    RequestKey::new(s)
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    let img =
        image::RgbImage::from_pixel(width, height, image::Rgb([200, 40, 90]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// Next event matching `pred`. Lagged notices are skipped.
pub async fn wait_for(
    rx: &mut broadcast::Receiver<EngineEvent>,
    pred: impl Fn(&EngineEvent) -> bool,
) -> EngineEvent {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("engine event channel closed")
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(30), wait)
        .await
        .expect("timed out waiting for engine event")
}

/// Waits until every predicate has matched some event, in any order.
pub async fn wait_for_all(
    rx: &mut broadcast::Receiver<EngineEvent>,
    mut preds: Vec<EventPredicate>,
) {
    let wait = async {
        while !preds.is_empty() {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(i) = preds.iter().position(|p| p(&event)) {
                        preds.swap_remove(i);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("engine event channel closed")
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(30), wait)
        .await
        .expect("timed out waiting for engine events")
}

pub type EventPredicate = Box<dyn Fn(&EngineEvent) -> bool + Send>;

pub fn is_loaded(k: &str) -> EventPredicate {
    let k = key(k);
    Box::new(move |e: &EngineEvent| {
        matches!(e, EngineEvent::Loaded { key, .. } if *key == k)
    })
}

pub fn is_cancelled(k: &str) -> EventPredicate {
    let k = key(k);
    Box::new(move |e: &EngineEvent| {
        matches!(e, EngineEvent::Cancelled { key } if *key == k)
    })
}

pub fn is_rejected(k: &str) -> EventPredicate {
    let k = key(k);
    Box::new(move |e: &EngineEvent| {
        matches!(e, EngineEvent::Rejected { key, .. } if *key == k)
    })
}

pub fn is_failed(k: &str) -> EventPredicate {
    let k = key(k);
    Box::new(move |e: &EngineEvent| {
        matches!(e, EngineEvent::Failed { key, .. } if *key == k)
    })
}
