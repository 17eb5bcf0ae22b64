// src/cache/mod.rs
//! Content freshness and negative caching

mod controller;
mod negative;

pub use controller::{CacheController, CacheInfo};
pub use negative::{
    run_cleanup_loop, NegativeCacheConfig, NegativeCacheFacet, NegativeCacheHandler,
    NegativeCacheKey, NegativeCacheStats,
};
