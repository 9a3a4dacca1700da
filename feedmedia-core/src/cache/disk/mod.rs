//! Persistent spillover for image derivatives.
//!
//! One `cacache` entry per derivative under a dedicated root, keyed
//! deterministically from the request key. Consulted only after a memory
//! miss. Bounded by total bytes and by entry age; the sweep removes expired
//! entries first, then the oldest writes until the byte budget holds.
//!
//! Content is addressed by hash, so two keys holding identical bytes share
//! one content file. Removing a key only drops the shared content once no
//! other index row refers to it.

mod eviction;
mod stats;

pub use eviction::EvictionReason;
pub use stats::DiskStatsSnapshot;

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use directories::ProjectDirs;
use feedmedia_model::RequestKey;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::{
    config::DiskConfig,
    error::{EngineError, Result},
    units::ByteSize,
};
use eviction::{IndexedDerivative, SweepBudget, plan_sweep};
use stats::DiskStats;

/// Stable on-disk key for a request key. Versioned so a format change can
/// orphan old entries instead of misreading them.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DiskKey(String);

impl DiskKey {
    pub fn for_request(key: &RequestKey) -> Self {
        let digest = Sha256::digest(key.as_str().as_bytes());
        let mut out = String::with_capacity(16 + 64);
        out.push_str("derivatives/v1/");
        out.push_str(&hex::encode(digest));
        Self(out)
    }

    fn from_raw(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DiskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DiskKey").field(&self.0).finish()
    }
}

impl fmt::Display for DiskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiskLimits {
    pub max_bytes: ByteSize,
    pub max_age: Duration,
}

impl From<&DiskConfig> for DiskLimits {
    fn from(config: &DiskConfig) -> Self {
        Self {
            max_bytes: config.max_bytes,
            max_age: config.max_age(),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed_ttl: usize,
    pub removed_size: usize,
    pub removed_pressure: usize,
    pub bytes_after: u64,
}

#[derive(Debug)]
pub struct DiskSpillover {
    root: PathBuf,
    limits: DiskLimits,
    usage_bytes: AtomicU64,
    cleanup_lock: Mutex<()>,
    stats: DiskStats,
}

impl DiskSpillover {
    /// Open (creating if needed) a spillover rooted at `root`.
    pub fn open(
        root: impl Into<PathBuf>,
        limits: DiskLimits,
    ) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let usage = indexed_usage_bytes_sync(&root);
        tracing::debug!(
            root = %root.display(),
            usage = %ByteSize::from_bytes(usage),
            "opened disk spillover"
        );
        Ok(Self {
            root,
            limits,
            usage_bytes: AtomicU64::new(usage),
            cleanup_lock: Mutex::new(()),
            stats: DiskStats::default(),
        })
    }

    /// Open under the platform cache directory.
    pub fn open_default(limits: DiskLimits) -> anyhow::Result<Self> {
        let dirs = ProjectDirs::from("", "feedmedia", "feedmedia")
            .ok_or_else(|| anyhow::anyhow!("Failed to resolve ProjectDirs"))?;
        Self::open(dirs.cache_dir().join("derivatives"), limits)
    }

    /// `None` when the config disables disk spillover.
    pub fn from_config(config: &DiskConfig) -> anyhow::Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let limits = DiskLimits::from(config);
        let disk = match &config.root {
            Some(root) => Self::open(root.clone(), limits)?,
            None => Self::open_default(limits)?,
        };
        Ok(Some(disk))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn usage(&self) -> ByteSize {
        ByteSize::from_bytes(self.usage_bytes.load(Ordering::Relaxed))
    }

    pub fn stats_snapshot(&self) -> DiskStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stored derivative for `key`, if any. Read failures other than a
    /// plain miss are logged and reported as a miss.
    pub async fn read(&self, key: &RequestKey) -> Option<Vec<u8>> {
        let disk_key = DiskKey::for_request(key);
        match cacache::read(&self.root, disk_key.as_str()).await {
            Ok(bytes) => {
                self.stats.record_read(true);
                Some(bytes)
            }
            Err(cacache::Error::EntryNotFound(_, _)) => {
                self.stats.record_read(false);
                None
            }
            Err(e) => {
                self.stats.record_read(false);
                tracing::warn!(
                    key = %key,
                    err = %e,
                    "disk spillover read failed"
                );
                None
            }
        }
    }

    pub async fn write(&self, key: &RequestKey, bytes: &[u8]) -> Result<()> {
        let disk_key = DiskKey::for_request(key);

        let previous = cacache::metadata(&self.root, disk_key.as_str())
            .await
            .ok()
            .flatten();
        if let Some(old) = previous {
            self.remove_indexed(&disk_key, &old.integrity.to_string())
                .await?;
            sub_saturating(&self.usage_bytes, old.size as u64);
        }

        let written =
            cacache::write(&self.root, disk_key.as_str(), bytes).await;
        self.stats.record_write(written.is_ok());
        written.map_err(|e| {
            EngineError::Disk(format!("cacache write failed for {key}: {e}"))
        })?;

        let usage = self
            .usage_bytes
            .fetch_add(bytes.len() as u64, Ordering::Relaxed)
            .saturating_add(bytes.len() as u64);
        let max = self.limits.max_bytes.as_bytes();
        if max > 0 && usage > max {
            self.cleanup_once().await;
        }
        Ok(())
    }

    pub async fn remove(&self, key: &RequestKey) -> Result<bool> {
        let disk_key = DiskKey::for_request(key);
        let meta = match cacache::metadata(&self.root, disk_key.as_str()).await
        {
            Ok(Some(m)) => m,
            Ok(None) => return Ok(false),
            Err(e) => {
                return Err(EngineError::Disk(format!(
                    "cacache metadata failed for {key}: {e}"
                )));
            }
        };
        self.remove_indexed(&disk_key, &meta.integrity.to_string())
            .await?;
        sub_saturating(&self.usage_bytes, meta.size as u64);
        Ok(true)
    }

    /// Remove an entry that read back but would not decode.
    pub async fn drop_corrupt(&self, key: &RequestKey) -> Result<()> {
        self.stats.record_corrupt();
        self.remove(key).await.map(|_| ())
    }

    pub async fn cleanup_once(&self) -> SweepReport {
        self.cleanup_at(unix_ms_now()).await
    }

    /// Sweep as if the wall clock read `now_ms`.
    pub async fn cleanup_at(&self, now_ms: u64) -> SweepReport {
        self.sweep(now_ms, None).await
    }

    /// Regular TTL and byte-cap sweep, then oldest-first removal until
    /// `percentage` of the unexpired entries are gone. The percentage is
    /// clamped to `1..=90` and at least one entry goes when any exist.
    pub async fn release_partial(&self, percentage: u8) -> SweepReport {
        self.sweep(unix_ms_now(), Some(percentage)).await
    }

    async fn sweep(
        &self,
        now_ms: u64,
        shed_percent: Option<u8>,
    ) -> SweepReport {
        let _guard = self.cleanup_lock.lock().await;
        let start = Instant::now();

        let root = self.root.clone();
        let entries = match tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for entry in cacache::index::ls(&root) {
                match entry {
                    Ok(m) => out.push(IndexedDerivative {
                        key: DiskKey::from_raw(m.key),
                        integrity: m.integrity.to_string(),
                        bytes: m.size as u64,
                        written_ms: u128_to_u64(m.time),
                    }),
                    Err(e) => tracing::warn!(
                        err = %e,
                        "disk spillover index ls entry error"
                    ),
                }
            }
            out
        })
        .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(err = %e, "disk spillover index ls join error");
                return SweepReport {
                    bytes_after: self.usage_bytes.load(Ordering::Relaxed),
                    ..SweepReport::default()
                };
            }
        };

        let mut references: HashMap<String, usize> = HashMap::new();
        for entry in &entries {
            *references.entry(entry.integrity.clone()).or_default() += 1;
        }

        let plan = plan_sweep(
            entries,
            SweepBudget {
                now_ms,
                max_age_ms: duration_ms(self.limits.max_age),
                max_bytes: self.limits.max_bytes.as_bytes(),
                shed_percent,
            },
        );

        let mut report = SweepReport::default();
        let mut total_bytes = plan.bytes_before;
        for (victim, reason) in plan.victims {
            let refs = references.entry(victim.integrity.clone()).or_default();
            let shared = *refs > 1;
            if let Err(e) = self.remove_entry(&victim.key, shared).await {
                tracing::warn!(
                    key = %victim.key,
                    err = %e,
                    "disk spillover eviction failed"
                );
                continue;
            }
            *refs = refs.saturating_sub(1);
            total_bytes = total_bytes.saturating_sub(victim.bytes);
            match reason {
                EvictionReason::Expired => report.removed_ttl += 1,
                EvictionReason::OverBudget => report.removed_size += 1,
                EvictionReason::Pressure => report.removed_pressure += 1,
            }
        }

        self.usage_bytes.store(total_bytes, Ordering::Relaxed);
        report.bytes_after = total_bytes;

        let elapsed_ms = duration_ms(start.elapsed());
        self.stats.record_sweep(&report, elapsed_ms);
        let removed =
            report.removed_ttl + report.removed_size + report.removed_pressure;
        if removed > 0 {
            tracing::info!(
                removed_ttl = report.removed_ttl,
                removed_size = report.removed_size,
                removed_pressure = report.removed_pressure,
                usage = %ByteSize::from_bytes(total_bytes),
                elapsed_ms,
                "disk spillover sweep"
            );
        }
        report
    }

    pub async fn clear(&self) -> Result<()> {
        let _guard = self.cleanup_lock.lock().await;
        cacache::clear(&self.root)
            .await
            .map_err(|e| {
                EngineError::Disk(format!("cacache clear failed: {e}"))
            })?;
        self.usage_bytes.store(0, Ordering::Relaxed);
        tracing::info!(root = %self.root.display(), "disk spillover cleared");
        Ok(())
    }

    /// Drop `key`'s index row, and its content unless another row still
    /// points at the same hash.
    async fn remove_indexed(
        &self,
        key: &DiskKey,
        integrity: &str,
    ) -> Result<()> {
        let shared = self.content_shared(key, integrity).await;
        self.remove_entry(key, shared).await
    }

    async fn content_shared(&self, key: &DiskKey, integrity: &str) -> bool {
        let root = self.root.clone();
        let key = key.as_str().to_owned();
        let integrity = integrity.to_owned();
        tokio::task::spawn_blocking(move || {
            cacache::index::ls(&root).filter_map(|m| m.ok()).any(|m| {
                m.key != key && m.integrity.to_string() == integrity
            })
        })
        .await
        // Keeping content we cannot prove unshared only costs disk space.
        .unwrap_or(true)
    }

    async fn remove_entry(&self, key: &DiskKey, shared: bool) -> Result<()> {
        cacache::index::RemoveOpts::new()
            .remove_fully(!shared)
            .remove(&self.root, key.as_str())
            .await
            .map_err(|e| {
                EngineError::Disk(format!(
                    "cacache remove failed for {key}: {e}"
                ))
            })
    }
}

fn indexed_usage_bytes_sync(root: &Path) -> u64 {
    let mut total: u64 = 0;
    for entry in cacache::index::ls(root) {
        match entry {
            Ok(m) => total = total.saturating_add(m.size as u64),
            Err(e) => {
                tracing::warn!(err = %e, "disk spillover index ls entry error")
            }
        }
    }
    total
}

fn sub_saturating(counter: &AtomicU64, sub: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(sub))
    });
}

pub(crate) fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis()
        .min(u128::from(u64::MAX)) as u64
}

fn u128_to_u64(v: u128) -> u64 {
    v.min(u128::from(u64::MAX)) as u64
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}
