//! Fetch Executor.
//!
//! Runs one load end to end on a spawned task: disk lookup, network
//! transfer, response validation and payload preparation. Cancellation is
//! observed between every stage; a cancelled run never yields a payload.

pub mod derivative;
pub mod transport;
pub mod video;

use std::sync::Arc;

use feedmedia_model::{MediaKind, MediaRef};
use tokio_util::sync::CancellationToken;

pub use derivative::{DerivativeSettings, decode_derivative, prepare_image};
pub use transport::{
    FetchedBody, HttpTransport, MediaTransport, ProbeResponse, ProgressSink,
};

use crate::{
    cache::DiskSpillover,
    config::FetchConfig,
    error::FetchError,
    prepared::{LoadSource, PreparedMedia},
};

/// Terminal result of one executor run.
#[derive(Debug)]
pub enum FetchOutcome {
    Prepared {
        media: Arc<PreparedMedia>,
        source: LoadSource,
    },
    Failed(FetchError),
    Cancelled,
}

impl FetchOutcome {
    fn from_error(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled => FetchOutcome::Cancelled,
            other => FetchOutcome::Failed(other),
        }
    }
}

macro_rules! checkpoint {
    ($cancel:expr) => {
        if $cancel.is_cancelled() {
            return FetchOutcome::Cancelled;
        }
    };
}

#[derive(Debug, Clone)]
pub struct FetchExecutor {
    transport: Arc<dyn MediaTransport>,
    disk: Option<Arc<DiskSpillover>>,
    settings: DerivativeSettings,
}

impl FetchExecutor {
    pub fn new(
        transport: Arc<dyn MediaTransport>,
        disk: Option<Arc<DiskSpillover>>,
        config: &FetchConfig,
    ) -> Self {
        Self {
            transport,
            disk,
            settings: DerivativeSettings::from(config),
        }
    }

    pub async fn execute(
        &self,
        media: &MediaRef,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> FetchOutcome {
        checkpoint!(cancel);
        match media.kind {
            MediaKind::Image => self.load_image(media, cancel, progress).await,
            MediaKind::Video => {
                let transport = self.transport.as_ref();
                let resolved = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return FetchOutcome::Cancelled,
                    resolved = video::resolve(transport, &media.locator) => {
                        resolved
                    }
                };
                match resolved {
                    Ok(asset) => FetchOutcome::Prepared {
                        media: Arc::new(PreparedMedia::Video(asset)),
                        source: LoadSource::Network,
                    },
                    Err(e) => FetchOutcome::from_error(e),
                }
            }
        }
    }

    async fn load_image(
        &self,
        media: &MediaRef,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> FetchOutcome {
        if let Some(prepared) = self.load_from_disk(media).await {
            checkpoint!(cancel);
            return FetchOutcome::Prepared {
                media: prepared,
                source: LoadSource::Disk,
            };
        }
        checkpoint!(cancel);

        let fetched =
            self.transport.get(&media.locator, cancel, progress).await;
        let body = match fetched {
            Ok(body) => body,
            Err(e) => return FetchOutcome::from_error(e),
        };
        if let Err(e) = validate_image_response(&body) {
            return FetchOutcome::Failed(e);
        }
        checkpoint!(cancel);

        let settings = self.settings;
        let bytes = body.bytes;
        let prepared = tokio::task::spawn_blocking(move || {
            prepare_image(&bytes, &settings)
        })
        .await;
        checkpoint!(cancel);

        match prepared {
            Ok(Ok(image)) => FetchOutcome::Prepared {
                media: Arc::new(PreparedMedia::Image(image)),
                source: LoadSource::Network,
            },
            Ok(Err(e)) => FetchOutcome::Failed(e),
            Err(join) => FetchOutcome::Failed(FetchError::Decode(format!(
                "derivative task failed: {join}"
            ))),
        }
    }

    /// Disk hit decoded into a payload. A corrupt entry is dropped and
    /// treated as a miss.
    async fn load_from_disk(
        &self,
        media: &MediaRef,
    ) -> Option<Arc<PreparedMedia>> {
        let disk = self.disk.as_ref()?;
        let bytes = disk.read(&media.key).await?;
        let decoded =
            tokio::task::spawn_blocking(move || decode_derivative(&bytes))
                .await;
        match decoded {
            Ok(Ok(image)) => Some(Arc::new(PreparedMedia::Image(image))),
            Ok(Err(e)) => {
                tracing::warn!(
                    key = %media.key,
                    err = %e,
                    "dropping undecodable disk entry"
                );
                if let Err(e) = disk.drop_corrupt(&media.key).await {
                    tracing::warn!(
                        key = %media.key,
                        err = %e,
                        "failed to drop disk entry"
                    );
                }
                None
            }
            Err(join) => {
                tracing::warn!(
                    key = %media.key,
                    err = %join,
                    "disk decode task failed"
                );
                None
            }
        }
    }
}

/// Status, body and declared type checks that precede decoding. A missing
/// Content-Type is left for the decoder to judge.
pub fn validate_image_response(body: &FetchedBody) -> Result<(), FetchError> {
    if body.status != 200 {
        return Err(FetchError::Status(body.status));
    }
    if body.bytes.is_empty() {
        return Err(FetchError::EmptyBody);
    }
    match body.content_type.as_deref() {
        Some(ct) if !ct.trim().to_ascii_lowercase().starts_with("image/") => {
            Err(FetchError::UnsupportedContentType(ct.to_string()))
        }
        _ => Ok(()),
    }
}
