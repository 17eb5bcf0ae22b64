// src/lib.rs

//! Quarry artifact repository core
//!
//! Content is served through named repositories of three kinds:
//!
//! - Hosted: content stored locally
//! - Proxy: content fetched from a remote origin and cached
//! - Group: an ordered list of member repositories resolved first-success
//!
//! Requests flow through each repository's view pipeline. Groups dispatch to
//! members with cycle safety, proxies and groups share a generation-based
//! cache invalidation scheme, and known-missing paths are short-circuited by a
//! negative cache. Background maintenance runs on a keyed single-flight
//! executor, and metadata writes go through a retrying transactional executor
//! over SQLite.

pub mod cache;
pub mod config;
mod error;
pub mod executor;
pub mod group;
pub mod maintenance;
pub mod metrics;
pub mod repository;
pub mod store;
pub mod transaction;

pub use cache::{CacheController, CacheInfo, NegativeCacheConfig, NegativeCacheFacet};
pub use config::QuarryConfig;
pub use error::{Error, Result};
pub use executor::{CancelToken, ConstrainedExecutor, ExecutorConfig, Task, TaskError};
pub use group::{GroupDispatcher, GroupFacet, MembershipDiff};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use repository::{
    Facet, Method, Repository, RepositoryManager, RepositoryType, Request, Response, Status,
};
pub use store::SqliteStore;
pub use transaction::{
    TransactionFailure, Transactional, TransactionalExecutor, TransactionalResource,
};
