use async_trait::async_trait;
use futures::StreamExt;
use feedmedia_model::LoadProgress;
use reqwest::header::CONTENT_TYPE;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    config::FetchConfig,
    error::{EngineError, FetchError, Result},
};

/// Receives byte-level progress while a body streams in.
pub type ProgressSink = dyn Fn(LoadProgress) + Send + Sync;

// Cap on up-front buffer reservation from an untrusted Content-Length.
const MAX_PREALLOC: u64 = 8 * 1024 * 1024;

/// Response of a full GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBody {
    pub status: u16,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Response of a headers-only probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub content_type: Option<String>,
}

/// Network seam of the engine. Production uses [`HttpTransport`]; tests
/// script replies.
#[async_trait]
pub trait MediaTransport: Send + Sync + std::fmt::Debug {
    /// Fetch the whole body. Implementations must return
    /// [`FetchError::Cancelled`] promptly once `cancel` fires.
    async fn get(
        &self,
        locator: &Url,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> std::result::Result<FetchedBody, FetchError>;

    /// Headers-only request used to resolve video renditions.
    async fn probe(
        &self,
        locator: &Url,
    ) -> std::result::Result<ProbeResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| EngineError::Http(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn content_type_of(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

#[async_trait]
impl MediaTransport for HttpTransport {
    async fn get(
        &self,
        locator: &Url,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> std::result::Result<FetchedBody, FetchError> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            sent = self.client.get(locator.clone()).send() => sent?,
        };

        let status = response.status().as_u16();
        let content_type = content_type_of(response.headers());
        if !response.status().is_success() {
            return Ok(FetchedBody {
                status,
                content_type,
                bytes: Vec::new(),
            });
        }

        let expected = response.content_length();
        let reserve = expected.unwrap_or(0).min(MAX_PREALLOC) as usize;
        let mut bytes = Vec::with_capacity(reserve);
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            bytes.extend_from_slice(&chunk?);
            progress(LoadProgress {
                received: bytes.len() as u64,
                expected,
            });
        }

        tracing::trace!(%locator, status, len = bytes.len(), "body received");
        Ok(FetchedBody {
            status,
            content_type,
            bytes,
        })
    }

    async fn probe(
        &self,
        locator: &Url,
    ) -> std::result::Result<ProbeResponse, FetchError> {
        let response = self.client.head(locator.clone()).send().await?;
        Ok(ProbeResponse {
            status: response.status().as_u16(),
            content_type: content_type_of(response.headers()),
        })
    }
}
