// src/cache/negative.rs
//! Negative result caching
//!
//! When a path isn't found upstream, we cache the "not found" status so that
//! repeated requests for the same missing artifact short-circuit without a
//! round-trip. This protects unreachable or slow upstreams from being hammered
//! by build tools that probe many candidate paths.

use crate::error::Result;
use crate::repository::{Context, Handler, RepositoryManager, Request, Response, Status};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Negative cache settings for one repository
#[derive(Debug, Clone)]
pub struct NegativeCacheConfig {
    pub enabled: bool,
    /// Time-to-live for entries
    pub ttl: Duration,
    /// Maximum number of entries before least-recently-used eviction
    pub max_entries: usize,
    /// Request attributes that distinguish otherwise identical paths
    pub key_attributes: Vec<String>,
}

impl Default for NegativeCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(15 * 60),
            max_entries: 10_000,
            key_attributes: Vec::new(),
        }
    }
}

/// Fingerprint of a request for negative caching
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NegativeCacheKey {
    pub repository: String,
    pub path: String,
    pub qualifiers: Vec<(String, String)>,
}

/// Cache entry for negative results
#[derive(Debug, Clone)]
struct NegativeEntry {
    status: Status,
    /// When this entry was created
    created_at: Instant,
    /// Number of requests that hit this entry
    hit_count: u64,
}

/// Negative cache for "not found" responses, bounded with LRU eviction
pub struct NegativeCacheFacet {
    config: NegativeCacheConfig,
    entries: Mutex<LruCache<NegativeCacheKey, NegativeEntry>>,
}

impl NegativeCacheFacet {
    pub fn new(config: NegativeCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn config(&self) -> &NegativeCacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Build the cache key for the request being served by `ctx`
    pub fn cache_key(&self, ctx: &Context<'_>) -> NegativeCacheKey {
        self.key_for(ctx.repository().name(), ctx.request())
    }

    /// Build the cache key for `request` against the named repository
    pub fn key_for(&self, repository: &str, request: &Request) -> NegativeCacheKey {
        let qualifiers = self
            .config
            .key_attributes
            .iter()
            .filter_map(|name| {
                request
                    .attribute(name)
                    .map(|value| (name.clone(), value.to_string()))
            })
            .collect();

        NegativeCacheKey {
            repository: repository.to_string(),
            path: request.path.clone(),
            qualifiers,
        }
    }

    /// Cached status for `key`, recording a hit; expired entries are dropped
    pub fn get(&self, key: &NegativeCacheKey) -> Option<Status> {
        let mut entries = self.entries.lock();
        let expired = match entries.get_mut(key) {
            Some(entry) if entry.created_at.elapsed() < self.config.ttl => {
                entry.hit_count += 1;
                return Some(entry.status.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.pop(key);
        }
        None
    }

    /// Remember `status` for `key`
    pub fn put(&self, key: NegativeCacheKey, status: Status) {
        let mut entries = self.entries.lock();
        entries.put(
            key,
            NegativeEntry {
                status,
                created_at: Instant::now(),
                hit_count: 0,
            },
        );
    }

    /// Remove a key from the negative cache (e.g., when it becomes available)
    pub fn invalidate(&self, key: &NegativeCacheKey) {
        self.entries.lock().pop(key);
    }

    /// Drop every entry
    pub fn invalidate_all(&self) {
        self.entries.lock().clear();
    }

    /// Get the number of entries in the cache
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Get cache statistics
    pub fn stats(&self) -> NegativeCacheStats {
        let entries = self.entries.lock();

        let mut total_hits = 0u64;
        let mut expired_count = 0usize;
        let mut active_count = 0usize;

        for (_, entry) in entries.iter() {
            total_hits += entry.hit_count;
            if entry.created_at.elapsed() < self.config.ttl {
                active_count += 1;
            } else {
                expired_count += 1;
            }
        }

        NegativeCacheStats {
            total_entries: entries.len(),
            active_entries: active_count,
            expired_entries: expired_count,
            total_hits,
            capacity: entries.cap().get(),
            ttl_secs: self.config.ttl.as_secs(),
        }
    }

    /// Clean up expired entries
    pub fn cleanup(&self) -> usize {
        let mut entries = self.entries.lock();
        let expired: Vec<NegativeCacheKey> = entries
            .iter()
            .filter(|(_, entry)| entry.created_at.elapsed() >= self.config.ttl)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }
}

/// Statistics for the negative cache
#[derive(Debug, Clone, serde::Serialize)]
pub struct NegativeCacheStats {
    /// Total number of entries (including expired)
    pub total_entries: usize,
    /// Number of active (non-expired) entries
    pub active_entries: usize,
    /// Number of expired entries (pending cleanup)
    pub expired_entries: usize,
    /// Total number of cache hits
    pub total_hits: u64,
    /// Maximum number of entries
    pub capacity: usize,
    /// TTL in seconds
    pub ttl_secs: u64,
}

/// Pipeline stage consulting the repository's [`NegativeCacheFacet`]
///
/// Sits in front of the handler that talks to the origin. Known-missing paths
/// are answered from the cache without calling [`Context::proceed`].
#[derive(Debug, Default)]
pub struct NegativeCacheHandler;

#[async_trait]
impl Handler for NegativeCacheHandler {
    async fn handle(&self, ctx: &mut Context<'_>) -> Result<Response> {
        let repository = Arc::clone(ctx.repository());
        let Some(facet) = repository.negative_cache().filter(|f| f.is_enabled()) else {
            return ctx.proceed().await;
        };

        let method = ctx.request().method;
        if !method.is_read() {
            return ctx.proceed().await;
        }

        let key = facet.cache_key(ctx);

        if ctx.request().is_replication() {
            let response = ctx.proceed().await?;
            if response.is_successful() {
                debug!("Replicated {}; dropping negative entry", key.path);
                facet.invalidate(&key);
            }
            return Ok(response);
        }

        if let Some(status) = facet.get(&key) {
            debug!(
                "Negative cache hit for {} in {}: {}",
                key.path, key.repository, status
            );
            ctx.registry().metrics().record_negative_hit();
            return Ok(Response::new(status));
        }

        let response = ctx.proceed().await?;
        if response.status.is_not_found() {
            debug!("Caching not-found for {} in {}", key.path, key.repository);
            ctx.registry().metrics().record_negative_store();
            facet.put(key, response.status.clone());
        } else if response.is_successful() {
            facet.invalidate(&key);
        }

        Ok(response)
    }
}

/// Background cleanup loop for every repository's negative cache
pub async fn run_cleanup_loop(registry: Arc<RepositoryManager>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        let mut removed = 0;
        for repository in registry.all() {
            if let Some(facet) = repository.negative_cache() {
                removed += facet.cleanup();
            }
        }
        if removed > 0 {
            tracing::debug!("Negative cache cleanup: removed {} expired entries", removed);
        }
    }
}
