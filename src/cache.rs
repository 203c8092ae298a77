//! Memoization of resolution results keyed by request fingerprint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::ResolveError;
use crate::proxy_types::{RequestTarget, Upstream};
use crate::resolver::Resolve;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Key/value table whose entries expire a fixed duration after insertion.
pub struct TtlCache<V> {
    items: HashMap<String, Entry<V>>,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            items: HashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.items
            .get(key)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| entry.value.clone())
    }

    pub fn insert(&mut self, key: String, value: V) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.items.insert(key, entry);
    }

    /// Drops expired entries and returns how many were removed.
    pub fn sweep(&mut self) -> usize {
        let now = Instant::now();
        let before = self.items.len();
        self.items.retain(|_, entry| !entry.is_expired(now));
        before - self.items.len()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Wraps a resolver and reuses its successful results per scheme and host.
///
/// Lookups, the wrapped resolution on a miss, and the periodic sweep all run under one lock,
/// so resolutions are serialized process wide.
pub struct CachedResolver<R> {
    inner: R,
    table: Arc<Mutex<TtlCache<Upstream>>>,
    sweeper: Option<JoinHandle<()>>,
}

impl<R: Resolve> CachedResolver<R> {
    /// Must be called from within a tokio runtime, which runs the sweep task.
    pub fn new(inner: R, config: &CacheConfig) -> Self {
        let table = Arc::new(Mutex::new(TtlCache::new(config.item_ttl)));
        let sweeper = (!config.gc_interval.is_zero())
            .then(|| tokio::spawn(sweep(Arc::clone(&table), config.gc_interval)));

        Self {
            inner,
            table,
            sweeper,
        }
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.len()
    }
}

async fn sweep<V: Clone>(table: Arc<Mutex<TtlCache<V>>>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

    loop {
        ticker.tick().await;
        let removed = table.lock().await.sweep();
        debug!(removed, "swept resolution cache");
    }
}

impl<R> Drop for CachedResolver<R> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

#[async_trait]
impl<R: Resolve> Resolve for CachedResolver<R> {
    async fn resolve(&self, target: &RequestTarget) -> Result<Upstream, ResolveError> {
        let key = target.to_string();
        let mut table = self.table.lock().await;

        if let Some(upstream) = table.get(&key) {
            debug!(key = %key, upstream = %upstream, "return value from cache");
            return Ok(upstream);
        }

        debug!(key = %key, "value missing from cache");
        let upstream = self.inner.resolve(target).await?;
        table.insert(key, upstream.clone());

        Ok(upstream)
    }
}
