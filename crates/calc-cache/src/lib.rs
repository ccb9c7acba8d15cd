//! Keyed memoization for the analytic pipeline: bounded size, soft TTL,
//! approximate LRU eviction, tag-based invalidation and single-flight
//! coalescing of concurrent misses.

pub mod fingerprint;

pub use fingerprint::{data_fingerprint, params_fingerprint};

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;

use drummond_core::{CacheConfig, DrummondError, Interval};

/// Which derived artifact an entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CalcKind {
    Pldot,
    Envelope,
    Lines,
    Zones,
    State,
    Patterns,
    Analysis,
}

impl CalcKind {
    pub fn name(&self) -> &'static str {
        match self {
            CalcKind::Pldot => "pldot",
            CalcKind::Envelope => "envelope",
            CalcKind::Lines => "lines",
            CalcKind::Zones => "zones",
            CalcKind::State => "state",
            CalcKind::Patterns => "patterns",
            CalcKind::Analysis => "analysis",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: CalcKind,
    pub symbol: String,
    pub interval: Interval,
    pub params_fingerprint: String,
    pub data_fingerprint: String,
}

struct CacheEntry {
    value: Arc<dyn Any + Send + Sync>,
    created_at: Instant,
    ttl: Duration,
    cost_ms: u64,
    /// Milliseconds since cache construction; drives approximate LRU.
    last_used: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expired: u64,
    pub time_saved_ms: u64,
}

pub struct CalcCache {
    entries: DashMap<CacheKey, CacheEntry>,
    inflight: DashMap<CacheKey, Arc<Mutex<()>>>,
    max_size: usize,
    default_ttl: Duration,
    epoch: Instant,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
    time_saved_ms: AtomicU64,
}

impl CalcCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
            max_size: config.max_size,
            default_ttl: Duration::from_secs(config.ttl_s),
            epoch: Instant::now(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            time_saved_ms: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Typed lookup. Expired entries are removed and counted as misses.
    pub fn get<T: Send + Sync + 'static>(&self, key: &CacheKey) -> Option<Arc<T>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.created_at.elapsed() > entry.ttl {
                drop(entry);
                self.entries.remove(key);
                self.expired.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            entry.last_used.store(self.now_ms(), Ordering::Relaxed);
            let value = entry.value.clone();
            let cost = entry.cost_ms;
            drop(entry);
            match value.downcast::<T>() {
                Ok(typed) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    self.time_saved_ms.fetch_add(cost, Ordering::Relaxed);
                    Some(typed)
                }
                // Same key, different type: treat as a miss and recompute.
                Err(_) => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            }
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Store a value. `ttl` falls back to the configured default; inserting
    /// over capacity evicts least-recently-used entries.
    pub fn set<T: Send + Sync + 'static>(
        &self,
        key: CacheKey,
        value: Arc<T>,
        ttl: Option<Duration>,
        cost_ms: u64,
    ) {
        let entry = CacheEntry {
            value: value as Arc<dyn Any + Send + Sync>,
            created_at: Instant::now(),
            ttl: ttl.unwrap_or(self.default_ttl),
            cost_ms,
            last_used: AtomicU64::new(self.now_ms()),
        };
        self.entries.insert(key, entry);
        if self.entries.len() > self.max_size {
            self.evict_lru();
        }
    }

    /// Compute-once under concurrency: the first caller for a key computes
    /// and stores, later callers await the stored value.
    pub async fn get_or_compute<T, F>(
        &self,
        key: CacheKey,
        compute: F,
    ) -> Result<Arc<T>, DrummondError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T, DrummondError>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let gate = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = gate.lock().await;

        // A concurrent caller may have finished while we waited.
        if let Some(value) = self.get(&key) {
            drop(guard);
            self.inflight.remove(&key);
            return Ok(value);
        }

        let started = Instant::now();
        let value = match compute() {
            Ok(v) => Arc::new(v),
            Err(e) => {
                drop(guard);
                self.inflight.remove(&key);
                return Err(e);
            }
        };
        let cost_ms = started.elapsed().as_millis() as u64;
        self.set(key.clone(), value.clone(), None, cost_ms);
        drop(guard);
        self.inflight.remove(&key);
        Ok(value)
    }

    fn evict_lru(&self) {
        let over = self.entries.len().saturating_sub(self.max_size);
        if over == 0 {
            return;
        }
        let mut by_age: Vec<(CacheKey, u64)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().last_used.load(Ordering::Relaxed)))
            .collect();
        by_age.sort_by_key(|(_, used)| *used);
        let mut removed = 0u64;
        for (key, _) in by_age.into_iter().take(over) {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        self.evictions.fetch_add(removed, Ordering::Relaxed);
        tracing::debug!(removed, "cache evicted LRU entries");
    }

    /// Drop every entry for a (symbol, interval). Called when new bars are
    /// registered for the pair.
    pub fn invalidate_series(&self, symbol: &str, interval: Interval) -> usize {
        self.invalidate_where(|key| key.symbol == symbol && key.interval == interval)
    }

    pub fn invalidate_kind(&self, kind: CalcKind) -> usize {
        self.invalidate_where(|key| key.kind == kind)
    }

    pub fn invalidate_where<F: Fn(&CacheKey) -> bool>(&self, predicate: F) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !predicate(key));
        before - self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            size: self.entries.len(),
            max_size: self.max_size,
            hits,
            misses,
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            time_saved_ms: self.time_saved_ms.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn key(symbol: &str, data: &str) -> CacheKey {
        CacheKey {
            kind: CalcKind::Pldot,
            symbol: symbol.to_string(),
            interval: Interval::Min30,
            params_fingerprint: "p".to_string(),
            data_fingerprint: data.to_string(),
        }
    }

    fn small_cache(max_size: usize) -> CalcCache {
        CalcCache::new(&CacheConfig { max_size, ttl_s: 300 })
    }

    #[test]
    fn get_after_set_returns_equal_value() {
        let cache = small_cache(10);
        cache.set(key("AAPL", "d1"), Arc::new(vec![1u32, 2, 3]), None, 5);
        let a: Arc<Vec<u32>> = cache.get(&key("AAPL", "d1")).unwrap();
        let b: Arc<Vec<u32>> = cache.get(&key("AAPL", "d1")).unwrap();
        assert_eq!(a, b);
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.time_saved_ms, 10);
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = small_cache(10);
        cache.set(
            key("AAPL", "d1"),
            Arc::new(1u32),
            Some(Duration::ZERO),
            0,
        );
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get::<u32>(&key("AAPL", "d1")).is_none());
        assert_eq!(cache.stats().expired, 1);
    }

    #[test]
    fn eviction_keeps_size_bounded() {
        let cache = small_cache(4);
        for i in 0..10 {
            cache.set(key("AAPL", &format!("d{i}")), Arc::new(i), None, 0);
        }
        assert!(cache.stats().size <= 4);
        assert!(cache.stats().evictions >= 6);
    }

    #[test]
    fn series_invalidation_is_scoped() {
        let cache = small_cache(10);
        cache.set(key("AAPL", "d1"), Arc::new(1u32), None, 0);
        cache.set(key("MSFT", "d1"), Arc::new(2u32), None, 0);
        let removed = cache.invalidate_series("AAPL", Interval::Min30);
        assert_eq!(removed, 1);
        assert!(cache.get::<u32>(&key("AAPL", "d1")).is_none());
        assert!(cache.get::<u32>(&key("MSFT", "d1")).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_flight_computes_once() {
        let cache = Arc::new(small_cache(10));
        let computed = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let computed = Arc::clone(&computed);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(key("AAPL", "d1"), move || {
                        computed.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(10));
                        Ok(42u32)
                    })
                    .await
            }));
        }
        for handle in handles {
            let value = handle.await.unwrap().unwrap();
            assert_eq!(*value, 42);
        }
        assert_eq!(computed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn compute_errors_are_not_cached() {
        let cache = small_cache(10);
        let err = cache
            .get_or_compute::<u32, _>(key("AAPL", "d1"), || {
                Err(DrummondError::Unavailable("vendor down".to_string()))
            })
            .await;
        assert!(err.is_err());
        let ok = cache
            .get_or_compute(key("AAPL", "d1"), || Ok(7u32))
            .await
            .unwrap();
        assert_eq!(*ok, 7);
    }
}
