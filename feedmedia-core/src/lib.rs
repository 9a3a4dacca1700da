//! # feedmedia-core
//!
//! Client-side media acquisition and caching engine for scrolling feeds.
//!
//! ## Overview
//!
//! The engine fetches the images and videos referenced by feed items,
//! prepares them for display or playback, and keeps them under strict
//! resource limits:
//!
//! - **Admission**: bounded concurrency, a bounded priority queue and
//!   single-flight de-duplication per [`RequestKey`]
//! - **Visibility**: scroll-position driven preloading with batched,
//!   rate-limited cancellation of items that scrolled away
//! - **Caching**: an LRU/TTL memory store for prepared payloads, a locked
//!   store for live playback handles, and a `cacache` disk spillover for
//!   image derivatives
//! - **Recovery**: linear backoff for transient failures and permanent
//!   rejection of content that is not media
//! - **Pressure**: graded eviction and cancellation on memory warnings and
//!   lifecycle changes
//!
//! All bookkeeping lives on one actor task; fetches run concurrently and
//! report back to it.
//!
//! ## Examples
//!
//! ```no_run
//! use feedmedia_core::{
//!     EngineConfig, LoadOutcome, LoadRequest, MediaEngine, MediaRef, Priority,
//! };
//!
//! # async fn demo() -> feedmedia_core::Result<()> {
//! let (engine, _join) =
//!     MediaEngine::builder(EngineConfig::default()).start()?;
//!
//! let avatar = MediaRef::parse(
//!     "user:42:avatar",
//!     "https://cdn.example.com/u/42.jpg",
//!     feedmedia_core::MediaKind::Image,
//! )?;
//! engine.submit(LoadRequest::new(avatar, Priority::High).on_result(|outcome| {
//!     if let LoadOutcome::Loaded(media) = outcome {
//!         println!("ready: {} bytes", media.cost_bytes());
//!     }
//! }))?;
//! # Ok(())
//! # }
//! ```

#![allow(missing_docs)]

pub mod admission;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod prepared;
pub mod pressure;
pub mod request;
pub mod retry;
pub mod units;
pub mod visibility;

pub use feedmedia_model::{
    ItemId, LoadProgress, MediaKind, MediaRef, ModelError, Priority, RequestKey,
    RequestState,
};

pub use cache::{
    DiskLimits, DiskSpillover, LiveCacheControl, LiveHandleCache, LiveResource,
};
pub use config::EngineConfig;
pub use engine::{EngineEvent, EngineStats, MediaEngine, MediaEngineBuilder};
pub use error::{ConfigError, EngineError, FailureClass, FetchError, Result};
pub use fetch::{
    FetchedBody, HttpTransport, MediaTransport, ProbeResponse, ProgressSink,
};
pub use prepared::{
    LoadSource, PreparedImage, PreparedMedia, VideoAsset, VideoVariant,
};
pub use pressure::{LifecycleState, PressureLevel};
pub use request::{LoadOutcome, LoadRequest};
pub use units::ByteSize;
pub use visibility::VisibilitySnapshot;
