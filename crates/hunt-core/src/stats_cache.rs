//! Read-through cache for dashboard-style usage snapshots.
//!
//! Readers always get the last value immediately. When it is older than the
//! TTL (or absent) exactly one background refresh is started; concurrent
//! readers during that refresh see the old value and do not start another.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::Result;

struct Slot<T> {
    value: Option<T>,
    fetched_at: Option<Instant>,
    refreshing: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheSnapshot<T> {
    pub value: Option<T>,
    pub age: Option<Duration>,
    pub stale: bool,
}

pub struct StatsCache<T> {
    slot: Arc<Mutex<Slot<T>>>,
    ttl: Duration,
}

impl<T> Clone for StatsCache<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            ttl: self.ttl,
        }
    }
}

impl<T> StatsCache<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                value: None,
                fetched_at: None,
                refreshing: false,
            })),
            ttl,
        }
    }

    /// Return the cached value and, if stale, kick off one refresh.
    ///
    /// Outside a tokio runtime the refresh runs inline before returning.
    pub fn get_or_refresh<F>(&self, fetch: F) -> CacheSnapshot<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let start = {
            let mut slot = self.lock();
            let stale = self.is_stale(&slot);
            if stale && !slot.refreshing {
                slot.refreshing = true;
                true
            } else {
                false
            }
        };

        if start {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let slot = self.slot.clone();
                    handle.spawn(async move {
                        let outcome = tokio::task::spawn_blocking(fetch).await;
                        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
                        guard.refreshing = false;
                        match outcome {
                            Ok(Ok(value)) => {
                                guard.value = Some(value);
                                guard.fetched_at = Some(Instant::now());
                                debug!("stats cache refreshed");
                            }
                            Ok(Err(e)) => warn!(error = %e, "stats cache refresh failed"),
                            Err(e) => warn!(error = %e, "stats cache refresh task aborted"),
                        }
                    });
                }
                Err(_) => self.store(fetch()),
            }
        }

        self.snapshot()
    }

    pub fn snapshot(&self) -> CacheSnapshot<T> {
        let slot = self.lock();
        CacheSnapshot {
            value: slot.value.clone(),
            age: slot.fetched_at.map(|t| t.elapsed()),
            stale: self.is_stale(&slot),
        }
    }

    /// Force the next read to refresh.
    pub fn invalidate(&self) {
        self.lock().fetched_at = None;
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock().refreshing
    }

    fn store(&self, outcome: Result<T>) {
        let mut slot = self.lock();
        slot.refreshing = false;
        match outcome {
            Ok(value) => {
                slot.value = Some(value);
                slot.fetched_at = Some(Instant::now());
            }
            Err(e) => warn!(error = %e, "stats cache refresh failed"),
        }
    }

    fn is_stale(&self, slot: &Slot<T>) -> bool {
        slot.fetched_at.map_or(true, |t| t.elapsed() >= self.ttl)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HuntError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn settle<T: Clone + Send + 'static>(cache: &StatsCache<T>) {
        for _ in 0..200 {
            if !cache.is_refreshing() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("refresh never finished");
    }

    #[tokio::test]
    async fn first_read_triggers_background_refresh() {
        let cache = StatsCache::new(Duration::from_secs(60));
        let first = cache.get_or_refresh(|| Ok(7u32));
        assert!(first.stale);
        settle(&cache).await;
        let snap = cache.snapshot();
        assert_eq!(snap.value, Some(7));
        assert!(!snap.stale);
    }

    #[tokio::test]
    async fn concurrent_stale_reads_refresh_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = StatsCache::new(Duration::from_secs(60));
        for _ in 0..5 {
            let calls = calls.clone();
            cache.get_or_refresh(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(30));
                Ok(1u32)
            });
        }
        settle(&cache).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fresh_value_is_not_refetched() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = StatsCache::new(Duration::from_secs(60));
        let fetch = |calls: Arc<AtomicUsize>| {
            move || -> Result<u32> {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(3)
            }
        };
        cache.get_or_refresh(fetch(calls.clone()));
        settle(&cache).await;
        let snap = cache.get_or_refresh(fetch(calls.clone()));
        assert_eq!(snap.value, Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.invalidate();
        cache.get_or_refresh(fetch(calls.clone()));
        settle(&cache).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_value() {
        let cache = StatsCache::new(Duration::from_secs(60));
        cache.get_or_refresh(|| Ok(5u32));
        settle(&cache).await;
        cache.invalidate();
        cache.get_or_refresh(|| Err(HuntError::StoreUnavailable("down".into())));
        settle(&cache).await;
        let snap = cache.snapshot();
        assert_eq!(snap.value, Some(5));
        assert!(snap.stale);
    }

    #[test]
    fn refreshes_inline_without_runtime() {
        let cache = StatsCache::new(Duration::from_secs(60));
        let snap = cache.get_or_refresh(|| Ok("ready".to_string()));
        assert_eq!(snap.value.as_deref(), Some("ready"));
        assert!(!cache.is_refreshing());
    }
}
