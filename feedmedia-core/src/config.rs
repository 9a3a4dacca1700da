use std::{path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, units::ByteSize};

/// Global knobs for the media engine.
///
/// Every section carries defaults, so a config file only needs to name the
/// values it overrides.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrency ceiling and queue sizing.
    pub admission: AdmissionConfig,
    /// Scroll window geometry and cancellation batching.
    pub visibility: VisibilityConfig,
    /// Backoff policy for transient failures.
    pub retry: RetryConfig,
    /// Memory store for prepared payloads.
    pub prepared_store: StoreConfig,
    /// Memory store for live playback handles.
    pub live_store: StoreConfig,
    /// On-disk derivative spillover.
    pub disk: DiskConfig,
    /// Network transfer and image derivative settings.
    pub fetch: FetchConfig,
    /// Memory pressure response.
    pub pressure: PressureConfig,
    /// Cadence of the TTL sweep over both memory stores (seconds).
    pub sweep_interval_secs: u64,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionConfig::default(),
            visibility: VisibilityConfig::default(),
            retry: RetryConfig::default(),
            prepared_store: StoreConfig::prepared(),
            live_store: StoreConfig::live(),
            disk: DiskConfig::default(),
            fetch: FetchConfig::default(),
            pressure: PressureConfig::default(),
            sweep_interval_secs: 60,
            event_capacity: 256,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Hard ceiling on concurrently executing fetches.
    pub max_concurrent: usize,
    /// Hard capacity of the pending queue. Lowest-priority tail entries are
    /// dropped beyond it.
    pub queue_capacity: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 6,
            queue_capacity: 64,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VisibilityConfig {
    /// Items ahead of the current index that are preloaded.
    pub lookahead: usize,
    /// Items behind the current index that are kept before turning stale.
    pub stale_buffer: usize,
    /// Cadence of the cancellation drain (ms).
    pub cancel_drain_interval_ms: u64,
    /// Upper bound on cancellations executed per drain.
    pub cancel_batch_size: usize,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            lookahead: 3,
            stale_buffer: 1,
            cancel_drain_interval_ms: 500,
            cancel_batch_size: 8,
        }
    }
}

impl VisibilityConfig {
    pub fn cancel_drain_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_drain_interval_ms.max(1))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts allowed before a key is given up on.
    pub max_attempts: u32,
    /// Backoff unit; the n-th retry waits `n * base_delay_ms`.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_entries: usize,
    /// Optional byte budget across all entries.
    pub max_bytes: Option<ByteSize>,
    /// Entries older than this are swept regardless of access (seconds).
    pub max_age_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::prepared()
    }
}

impl StoreConfig {
    pub const fn prepared() -> Self {
        Self {
            max_entries: 100,
            max_bytes: Some(ByteSize::from_mib(256)),
            max_age_secs: 15 * 60,
        }
    }

    pub const fn live() -> Self {
        Self {
            max_entries: 12,
            max_bytes: None,
            max_age_secs: 5 * 60,
        }
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Set to `false` to run memory-only.
    pub enabled: bool,
    /// Cache root; the platform cache directory when unset.
    pub root: Option<PathBuf>,
    pub max_bytes: ByteSize,
    pub max_age_secs: u64,
    /// Cadence of the background disk sweep (seconds).
    pub sweep_interval_secs: u64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: None,
            max_bytes: ByteSize::from_mib(500),
            max_age_secs: 7 * 24 * 60 * 60,
            sweep_interval_secs: 5 * 60,
        }
    }
}

impl DiskConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Per-request timeout (ms).
    pub request_timeout_ms: u64,
    /// Byte cap for image derivatives.
    pub image_target_bytes: ByteSize,
    /// Quality decrement per re-encode pass.
    pub quality_step: f32,
    /// Lowest quality tried before falling back to downscaling.
    pub quality_floor: f32,
    /// Downscale passes before giving up on an image.
    pub max_downscale_passes: u32,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            image_target_bytes: ByteSize::from_kib(300),
            quality_step: 0.1,
            quality_floor: 0.1,
            max_downscale_passes: 8,
            user_agent: concat!("feedmedia/", env!("CARGO_PKG_VERSION"))
                .to_string(),
        }
    }
}

impl FetchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureConfig {
    /// How long admission stays degraded after the last pressure signal (ms).
    pub cooldown_ms: u64,
    /// Share of memory store entries released on a moderate signal.
    pub moderate_release_percent: u8,
    /// Share of memory store entries released on a critical signal.
    pub critical_release_percent: u8,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 10_000,
            moderate_release_percent: 25,
            critical_release_percent: 50,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            }
        }

        if self.admission.max_concurrent == 0 {
            return Err(invalid("admission.max_concurrent", "must be > 0"));
        }
        if self.prepared_store.max_entries == 0 {
            return Err(invalid("prepared_store.max_entries", "must be > 0"));
        }
        if self.live_store.max_entries == 0 {
            return Err(invalid("live_store.max_entries", "must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be > 0"));
        }
        if self.visibility.cancel_batch_size == 0 {
            return Err(invalid("visibility.cancel_batch_size", "must be > 0"));
        }
        if !(self.fetch.quality_floor > 0.0 && self.fetch.quality_floor <= 1.0)
        {
            return Err(invalid("fetch.quality_floor", "must be in (0, 1]"));
        }
        if !(self.fetch.quality_step > 0.0 && self.fetch.quality_step < 1.0) {
            return Err(invalid("fetch.quality_step", "must be in (0, 1)"));
        }
        if self.fetch.image_target_bytes.is_zero() {
            return Err(invalid("fetch.image_target_bytes", "must be > 0"));
        }
        for (field, pct) in [
            (
                "pressure.moderate_release_percent",
                self.pressure.moderate_release_percent,
            ),
            (
                "pressure.critical_release_percent",
                self.pressure.critical_release_percent,
            ),
        ] {
            if pct == 0 || pct > 100 {
                return Err(invalid(field, "must be in 1..=100"));
            }
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
