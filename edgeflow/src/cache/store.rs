//! Tenant-partitioned TTL cache with LRU eviction.

use super::rules::{InvalidationRules, KeyPattern};
use crate::config::CacheConfig;
use crate::context::TenantId;
use crate::core::OperationKey;
use crate::errors::EdgeflowError;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

struct CacheEntry {
    value: Arc<serde_json::Value>,
    created_at: Instant,
    ttl: Duration,
    tick: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<OperationKey, CacheEntry>,
    // tick -> key, oldest first
    recency: BTreeMap<u64, OperationKey>,
    next_tick: u64,
}

impl CacheInner {
    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn touch(&mut self, key: &OperationKey) {
        let tick = self.bump();
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, key.clone());
        }
    }

    fn remove(&mut self, key: &OperationKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }

    fn remove_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&OperationKey) -> bool,
    {
        let doomed: Vec<OperationKey> = self.entries.keys().filter(|k| predicate(*k)).cloned().collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Entries removed to stay within capacity.
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed.
    pub expirations: u64,
    /// Entries removed by patterns or rules.
    pub invalidations: u64,
    /// Current entry count.
    pub entries: usize,
}

impl CacheStats {
    /// Hit ratio in `[0, 1]`, or 0 with no lookups.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// TTL cache keyed by `(tenant, operation, params_hash)`.
///
/// One recency order spans all tenants; eviction removes exactly the least
/// recently used entry. The internal lock is never held while a fetch runs.
pub struct SmartCache {
    inner: Mutex<CacheInner>,
    rules: RwLock<InvalidationRules>,
    capacity: usize,
    default_ttl: Duration,
    counters: Counters,
}

impl SmartCache {
    /// Creates a cache with the default invalidation rules.
    #[must_use]
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            rules: RwLock::new(InvalidationRules::with_defaults()),
            capacity: capacity.max(1),
            default_ttl,
            counters: Counters::default(),
        }
    }

    /// Creates a cache from configuration.
    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity, config.default_ttl())
    }

    /// Replaces the invalidation rules.
    #[must_use]
    pub fn with_rules(self, rules: InvalidationRules) -> Self {
        *self.rules.write() = rules;
        self
    }

    /// Adds an invalidation rule.
    pub fn add_rule<I, P>(&self, trigger: impl Into<String>, patterns: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<KeyPattern>,
    {
        self.rules.write().add_rule(trigger, patterns);
    }

    /// Returns the capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the TTL used when callers pass none.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Returns a live cached value without fetching.
    #[must_use]
    pub fn get(
        &self,
        tenant: &TenantId,
        operation: &str,
        params: &serde_json::Value,
    ) -> Option<Arc<serde_json::Value>> {
        self.get_by_key(&OperationKey::new(tenant, operation, params))
    }

    /// Returns a live cached value for a prebuilt key.
    #[must_use]
    pub fn get_by_key(&self, key: &OperationKey) -> Option<Arc<serde_json::Value>> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let expired = match inner.entries.get(key) {
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            inner.remove(key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(key = %key, "Cache entry expired");
            return None;
        }

        inner.touch(key);
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        inner.entries.get(key).map(|e| Arc::clone(&e.value))
    }

    /// Stores a value, replacing any previous entry.
    pub fn insert(
        &self,
        tenant: &TenantId,
        operation: &str,
        params: &serde_json::Value,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Arc<serde_json::Value> {
        self.insert_by_key(OperationKey::new(tenant, operation, params), value, ttl)
    }

    /// Stores a value under a prebuilt key.
    pub fn insert_by_key(
        &self,
        key: OperationKey,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Arc<serde_json::Value> {
        let value = Arc::new(value);
        let mut inner = self.inner.lock();

        inner.remove(&key);
        let tick = inner.bump();
        inner.recency.insert(tick, key.clone());
        inner.entries.insert(
            key,
            CacheEntry {
                value: Arc::clone(&value),
                created_at: Instant::now(),
                ttl: ttl.unwrap_or(self.default_ttl),
                tick,
            },
        );

        while inner.entries.len() > self.capacity {
            let Some((_, victim)) = inner.recency.pop_first() else {
                break;
            };
            inner.entries.remove(&victim);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(tenant = %victim.tenant(), key = %victim.scoped_key(), "Evicted LRU cache entry");
        }

        value
    }

    /// Returns the cached value or runs `fetch` and caches its result.
    ///
    /// Fetch errors are returned unchanged and never cached.
    ///
    /// # Errors
    ///
    /// Returns whatever `fetch` returns on failure.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        tenant: &TenantId,
        operation: &str,
        params: &serde_json::Value,
        ttl: Option<Duration>,
        fetch: F,
    ) -> Result<Arc<serde_json::Value>, EdgeflowError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, EdgeflowError>>,
    {
        let key = OperationKey::new(tenant, operation, params);
        if let Some(hit) = self.get_by_key(&key) {
            return Ok(hit);
        }

        let value = fetch().await?;
        Ok(self.insert_by_key(key, value, ttl))
    }

    /// Removes this tenant's entries matching `pattern`.
    pub fn invalidate(&self, tenant: &TenantId, pattern: &str) -> usize {
        self.invalidate_pattern(tenant, &KeyPattern::new(pattern))
    }

    fn invalidate_pattern(&self, tenant: &TenantId, pattern: &KeyPattern) -> usize {
        let removed = self
            .inner
            .lock()
            .remove_where(|key| key.tenant() == tenant && pattern.matches(key));

        if removed > 0 {
            self.counters
                .invalidations
                .fetch_add(u64::try_from(removed).unwrap_or(u64::MAX), Ordering::Relaxed);
            tracing::debug!(tenant = %tenant, pattern = %pattern, removed, "Invalidated cache entries");
        }
        removed
    }

    /// Patterns a completed `operation` invalidates.
    #[must_use]
    pub fn invalidation_patterns(&self, operation: &str) -> Vec<KeyPattern> {
        self.rules.read().patterns_for(operation).to_vec()
    }

    /// Applies the invalidation rules for a completed operation.
    pub fn on_operation_completed(&self, operation: &str, tenant: &TenantId) -> usize {
        let patterns = self.invalidation_patterns(operation);
        patterns
            .iter()
            .map(|p| self.invalidate_pattern(tenant, p))
            .sum()
    }

    /// Removes every entry for a tenant.
    pub fn clear_tenant(&self, tenant: &TenantId) -> usize {
        self.inner.lock().remove_where(|key| key.tenant() == tenant)
    }

    /// Removes everything.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
    }

    /// Entry count, including entries whose TTL elapsed but were not yet read.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl Default for SmartCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl fmt::Debug for SmartCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmartCache")
            .field("capacity", &self.capacity)
            .field("default_ttl", &self.default_ttl)
            .field("entries", &self.len())
            .finish()
    }
}
