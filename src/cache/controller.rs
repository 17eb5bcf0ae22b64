// src/cache/controller.rs

//! Generation-based freshness policy
//!
//! Every piece of cached content carries a [`CacheInfo`] stamped when it was
//! last verified against its origin. The content is stale when its generation
//! no longer matches the controller's, or when it is older than the TTL.
//! Invalidation only bumps the generation, so it costs O(1) regardless of how
//! much content the repository holds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Freshness stamp attached to cached content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    /// When the content was last fetched or verified
    pub last_verified: DateTime<Utc>,
    /// Controller generation at that time
    pub generation: u64,
}

/// Per-repository cache policy
#[derive(Debug)]
pub struct CacheController {
    /// Maximum content age; `None` never expires except by invalidation
    ttl: Option<Duration>,
    generation: AtomicU64,
}

impl CacheController {
    /// Create a controller
    ///
    /// The generation is seeded from the wall clock, so content stamped by a
    /// previous process is treated as stale after a restart.
    pub fn new(ttl: Option<Duration>) -> Self {
        let seed = Utc::now().timestamp_millis().max(0) as u64;
        Self {
            ttl,
            generation: AtomicU64::new(seed),
        }
    }

    /// Create a controller from a TTL in milliseconds, where a negative value never expires
    pub fn from_ttl_millis(ttl_millis: i64) -> Self {
        let ttl = (ttl_millis >= 0).then(|| Duration::from_millis(ttl_millis as u64));
        Self::new(ttl)
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Stamp for content verified right now
    pub fn current(&self) -> CacheInfo {
        CacheInfo {
            last_verified: Utc::now(),
            generation: self.generation(),
        }
    }

    /// Whether content stamped with `info` must be re-fetched
    pub fn is_stale(&self, info: &CacheInfo) -> bool {
        self.is_stale_at(info, Utc::now())
    }

    /// Staleness relative to an explicit clock reading
    pub fn is_stale_at(&self, info: &CacheInfo, now: DateTime<Utc>) -> bool {
        if info.generation != self.generation() {
            return true;
        }

        match self.ttl {
            None => false,
            Some(ttl) => match (now - info.last_verified).to_std() {
                Ok(age) => age > ttl,
                // Stamped in the future (clock skew): treat as fresh
                Err(_) => false,
            },
        }
    }

    /// Invalidate everything stamped so far; returns the new generation
    pub fn invalidate_cache(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Cache invalidated, generation now {}", generation);
        generation
    }
}

impl Default for CacheController {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fresh_then_invalidated() {
        let controller = CacheController::new(Some(Duration::from_secs(60)));
        let info = controller.current();
        assert!(!controller.is_stale(&info));

        controller.invalidate_cache();
        assert!(controller.is_stale(&info));

        // Content re-stamped after invalidation is fresh again
        let refreshed = controller.current();
        assert!(!controller.is_stale(&refreshed));
    }

    #[test]
    fn test_ttl_expiry() {
        let controller = CacheController::new(Some(Duration::from_secs(60)));
        let info = controller.current();

        let later = info.last_verified + chrono::Duration::seconds(59);
        assert!(!controller.is_stale_at(&info, later));

        let exactly = info.last_verified + chrono::Duration::seconds(60);
        assert!(!controller.is_stale_at(&info, exactly));

        let expired = info.last_verified + chrono::Duration::seconds(61);
        assert!(controller.is_stale_at(&info, expired));
    }

    #[test]
    fn test_never_expires_without_invalidation() {
        let controller = CacheController::from_ttl_millis(-1);
        assert_eq!(controller.ttl(), None);

        let info = controller.current();
        let far_future = info.last_verified + chrono::Duration::days(3650);
        assert!(!controller.is_stale_at(&info, far_future));

        controller.invalidate_cache();
        assert!(controller.is_stale_at(&info, info.last_verified));
    }

    #[test]
    fn test_zero_ttl() {
        let controller = CacheController::from_ttl_millis(0);
        let info = controller.current();
        let later = info.last_verified + chrono::Duration::milliseconds(1);
        assert!(controller.is_stale_at(&info, later));
    }

    #[test]
    fn test_concurrent_invalidation() {
        let controller = Arc::new(CacheController::default());
        let start = controller.generation();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let controller = Arc::clone(&controller);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        controller.invalidate_cache();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(controller.generation(), start + 800);
    }
}
