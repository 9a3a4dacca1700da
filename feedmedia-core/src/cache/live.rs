use std::fmt;

use feedmedia_model::RequestKey;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::store::{CachePayload, ResourceStore, StorePolicy};

/// A cached object pinning a real OS or decoder resource, such as an active
/// playback pipeline.
pub trait LiveResource: CachePayload + Send + 'static {
    /// Re-validate the underlying resource after the app returns to the
    /// foreground, re-seeking or re-opening it if needed. Returns `false`
    /// when it cannot be recovered and should be evicted.
    fn reconcile(&mut self) -> bool;
}

/// Type-erased control surface used by the pressure governor and sweeps,
/// which have no business knowing the concrete handle type.
pub trait LiveCacheControl: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;
    fn len(&self) -> usize;
    fn release_partial(&self, percentage: u8) -> usize;
    fn sweep_expired(&self, now: Instant) -> usize;
    /// Returns how many entries were dropped as unrecoverable.
    fn reconcile_all(&self) -> usize;
    fn clear(&self) -> usize;
}

/// Live-handle cache.
///
/// Unlike the prepared store it is touched from rendering code as well as
/// the engine's serial context, so the store sits behind a mutex. Closures
/// passed to [`Self::with`] run under the lock; keep them short.
pub struct LiveHandleCache<H> {
    inner: Mutex<ResourceStore<H>>,
}

impl<H: LiveResource> LiveHandleCache<H> {
    pub fn new(name: &'static str, policy: StorePolicy) -> Self {
        Self {
            inner: Mutex::new(ResourceStore::new(name, policy)),
        }
    }

    /// Run `f` against the handle for `key`, refreshing its LRU position.
    pub fn with<R>(
        &self,
        key: &RequestKey,
        f: impl FnOnce(&mut H) -> R,
    ) -> Option<R> {
        let mut guard = self.inner.lock();
        guard.get_mut(key).map(f)
    }

    /// Clone of the handle for `key`, refreshing its LRU position.
    pub fn get(&self, key: &RequestKey) -> Option<H>
    where
        H: Clone,
    {
        self.inner.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.inner.lock().contains(key)
    }

    /// Insert a handle; evicted handles are released before this returns.
    pub fn insert(&self, key: RequestKey, handle: H) -> Vec<RequestKey> {
        self.inner.lock().put(key, handle)
    }

    /// Release and drop the handle for `key`.
    pub fn remove(&self, key: &RequestKey) -> bool {
        self.inner.lock().evict_key(key)
    }

    /// Hand the handle back to the caller without releasing it.
    pub fn take(&self, key: &RequestKey) -> Option<H> {
        self.inner.lock().take(key)
    }
}

impl<H: LiveResource> LiveCacheControl for LiveHandleCache<H> {
    fn name(&self) -> &'static str {
        self.inner.lock().name()
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }

    fn release_partial(&self, percentage: u8) -> usize {
        self.inner.lock().release_partial(percentage)
    }

    fn sweep_expired(&self, now: Instant) -> usize {
        self.inner.lock().sweep_expired(now)
    }

    fn reconcile_all(&self) -> usize {
        let mut guard = self.inner.lock();
        let dead: Vec<RequestKey> = guard
            .values_mut()
            .filter_map(|(key, handle)| {
                (!handle.reconcile()).then(|| key.clone())
            })
            .collect();
        for key in &dead {
            guard.evict_key(key);
        }
        if !dead.is_empty() {
            tracing::info!(
                cache = guard.name(),
                dropped = dead.len(),
                "dropped live handles that failed to reconcile"
            );
        }
        dead.len()
    }

    fn clear(&self) -> usize {
        self.inner.lock().clear()
    }
}

impl<H> fmt::Debug for LiveHandleCache<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveHandleCache").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        time::Duration,
    };

    #[derive(Debug)]
    struct Player {
        open: Arc<AtomicUsize>,
        healthy: Arc<AtomicBool>,
        reseeks: usize,
    }

    impl CachePayload for Player {
        fn cost(&self) -> u64 {
            1
        }

        fn release(&mut self) {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl LiveResource for Player {
        fn reconcile(&mut self) -> bool {
            self.reseeks += 1;
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn player(open: &Arc<AtomicUsize>, healthy: bool) -> Player {
        open.fetch_add(1, Ordering::SeqCst);
        Player {
            open: Arc::clone(open),
            healthy: Arc::new(AtomicBool::new(healthy)),
            reseeks: 0,
        }
    }

    fn cache(max_entries: usize) -> LiveHandleCache<Player> {
        LiveHandleCache::new(
            "players",
            StorePolicy {
                max_entries,
                max_cost: None,
                max_age: Some(Duration::from_secs(300)),
            },
        )
    }

    #[test]
    fn eviction_releases_resource_synchronously() {
        let open = Arc::new(AtomicUsize::new(0));
        let cache = cache(2);
        for i in 0..4 {
            cache.insert(RequestKey::new(format!("v{i}")), player(&open, true));
        }
        // Two handles were evicted and released before insert returned.
        assert_eq!(open.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);

        assert!(cache.remove(&RequestKey::new("v3")));
        assert_eq!(open.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reconcile_drops_unrecoverable_handles() {
        let open = Arc::new(AtomicUsize::new(0));
        let cache = cache(8);
        cache.insert(RequestKey::new("ok"), player(&open, true));
        cache.insert(RequestKey::new("dead"), player(&open, false));

        let control: Arc<dyn LiveCacheControl> = Arc::new(cache);
        assert_eq!(control.reconcile_all(), 1);
        assert_eq!(control.len(), 1);
        assert_eq!(open.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn with_touches_and_mutates_handle() {
        let open = Arc::new(AtomicUsize::new(0));
        let cache = cache(2);
        cache.insert(RequestKey::new("a"), player(&open, true));
        cache.insert(RequestKey::new("b"), player(&open, true));

        let reseeks = cache.with(&RequestKey::new("a"), |p| {
            p.reseeks += 1;
            p.reseeks
        });
        assert_eq!(reseeks, Some(1));

        cache.insert(RequestKey::new("c"), player(&open, true));
        assert!(cache.contains(&RequestKey::new("a")));
        assert!(!cache.contains(&RequestKey::new("b")));
    }

    #[test]
    fn take_skips_release() {
        let open = Arc::new(AtomicUsize::new(0));
        let cache = cache(2);
        cache.insert(RequestKey::new("a"), player(&open, true));
        let handle = cache.take(&RequestKey::new("a")).unwrap();
        assert_eq!(open.load(Ordering::SeqCst), 1);
        drop(handle);
        assert_eq!(cache.len(), 0);
    }
}
