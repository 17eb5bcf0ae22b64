// src/maintenance.rs

//! Background maintenance jobs
//!
//! Jobs are [`Task`]s scheduled through the
//! [`ConstrainedExecutor`](crate::executor::ConstrainedExecutor) under a
//! business key, so at most one rebuild per group and one purge per namespace
//! run at any time. Every store mutation runs inside a
//! [`TransactionalExecutor`] unit of work on a blocking worker thread.

use crate::error::{Error, Result};
use crate::executor::{CancelToken, Task, TaskError};
use crate::repository::{RepositoryManager, Request};
use crate::store::SqliteStore;
use crate::transaction::{Transactional, TransactionalExecutor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

/// Store handle shared by maintenance jobs
pub type SharedStore = Arc<Mutex<SqliteStore>>;

/// Default number of entries deleted per purge transaction
pub const DEFAULT_PURGE_BATCH: usize = 500;

/// Policy for maintenance writes: retry lock conflicts
fn write_policy() -> Transactional<Error> {
    Transactional::new().retry_on(Error::is_busy)
}

/// Run `operation` in a transaction on a blocking worker thread
async fn in_transaction<T, F>(
    store: &SharedStore,
    transactions: &Arc<TransactionalExecutor>,
    operation: F,
) -> Result<T>
where
    T: Default + Send + 'static,
    F: FnMut(&mut SqliteStore) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    let transactions = Arc::clone(transactions);
    tokio::task::spawn_blocking(move || {
        let mut store = store.lock();
        transactions
            .run(&write_policy(), &mut *store, operation)
            .map_err(Error::from)
    })
    .await
    .map_err(|e| Error::Worker(e.to_string()))?
}

/// Outcome of an index rebuild
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexReport {
    pub group: String,
    /// Leaf repositories that answered the listing, depth-first in declared order
    pub members: Vec<String>,
    pub paths: usize,
}

/// Rebuild a group's path index from the listings of every leaf beneath it
///
/// Each indexed path maps to the first leaf, in resolution order, that
/// lists it.
pub struct RebuildIndexJob {
    name: String,
    group: String,
    registry: Arc<RepositoryManager>,
    store: SharedStore,
    transactions: Arc<TransactionalExecutor>,
    report: Mutex<Option<IndexReport>>,
}

impl RebuildIndexJob {
    pub fn new(
        group: impl Into<String>,
        registry: Arc<RepositoryManager>,
        store: SharedStore,
        transactions: Arc<TransactionalExecutor>,
    ) -> Self {
        let group = group.into();
        Self {
            name: format!("rebuild index of {group}"),
            group,
            registry,
            store,
            transactions,
            report: Mutex::new(None),
        }
    }

    /// Executor key for a group's rebuild
    pub fn key(group: &str) -> String {
        format!("rebuild-index:{group}")
    }

    /// Store namespace holding a group's index
    pub fn namespace(group: &str) -> String {
        format!("index:{group}")
    }

    pub fn report(&self) -> Option<IndexReport> {
        self.report.lock().clone()
    }
}

#[async_trait]
impl Task for RebuildIndexJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cancel: CancelToken) -> std::result::Result<(), TaskError> {
        let listing = Request::get("/");
        let responses = self.registry.dispatch_leaves(&self.group, &listing).await?;
        cancel.check(0)?;

        let mut index: BTreeMap<String, String> = BTreeMap::new();
        let mut members = Vec::new();
        for (member, response) in responses {
            if !response.is_successful() {
                debug!("{} returned {} for listing", member, response.status);
                continue;
            }
            let Some(payload) = response.payload else {
                continue;
            };
            for path in String::from_utf8_lossy(&payload).lines() {
                let path = path.trim();
                if !path.is_empty() {
                    index
                        .entry(path.to_string())
                        .or_insert_with(|| member.clone());
                }
            }
            members.push(member);
        }

        let entries: Vec<(String, String)> = index.into_iter().collect();
        let paths = entries.len();
        let namespace = Self::namespace(&self.group);
        in_transaction(&self.store, &self.transactions, move |store| {
            store.replace_namespace(&namespace, &entries)
        })
        .await?;

        info!(
            "Rebuilt index of {}: {} paths from {} members",
            self.group,
            paths,
            members.len()
        );
        *self.report.lock() = Some(IndexReport {
            group: self.group.clone(),
            members,
            paths,
        });
        Ok(())
    }
}

/// Outcome of a purge
#[derive(Debug, Clone, Default, Serialize)]
pub struct PurgeReport {
    pub namespace: String,
    pub purged: u64,
    pub batches: u64,
    pub interrupted: bool,
}

/// Delete entries of a namespace last updated before a cutoff
///
/// Works in batches, one transaction per batch, and stops between batches
/// when canceled.
pub struct PurgeStaleJob {
    name: String,
    namespace: String,
    cutoff: DateTime<Utc>,
    batch_size: usize,
    store: SharedStore,
    transactions: Arc<TransactionalExecutor>,
    purged: AtomicU64,
    batches: AtomicU64,
    interrupted: AtomicBool,
}

impl PurgeStaleJob {
    pub fn new(
        namespace: impl Into<String>,
        cutoff: DateTime<Utc>,
        store: SharedStore,
        transactions: Arc<TransactionalExecutor>,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            name: format!("purge {namespace}"),
            namespace,
            cutoff,
            batch_size: DEFAULT_PURGE_BATCH,
            store,
            transactions,
            purged: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            interrupted: AtomicBool::new(false),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Executor key for a namespace's purge
    pub fn key(namespace: &str) -> String {
        format!("purge:{namespace}")
    }

    pub fn report(&self) -> PurgeReport {
        PurgeReport {
            namespace: self.namespace.clone(),
            purged: self.purged.load(Ordering::SeqCst),
            batches: self.batches.load(Ordering::SeqCst),
            interrupted: self.interrupted.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl Task for PurgeStaleJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cancel: CancelToken) -> std::result::Result<(), TaskError> {
        loop {
            if let Err(e) = cancel.check(self.purged.load(Ordering::SeqCst)) {
                self.interrupted.store(true, Ordering::SeqCst);
                return Err(e);
            }

            let namespace = self.namespace.clone();
            let cutoff = self.cutoff;
            let limit = self.batch_size;
            let deleted = in_transaction(&self.store, &self.transactions, move |store| {
                store.purge_older_than(&namespace, cutoff, limit)
            })
            .await?;

            self.purged.fetch_add(deleted as u64, Ordering::SeqCst);
            self.batches.fetch_add(1, Ordering::SeqCst);
            debug!("Purged {} entries from {}", deleted, self.namespace);

            if deleted < self.batch_size {
                break;
            }
        }

        info!(
            "Purged {} entries older than {} from {}",
            self.purged.load(Ordering::SeqCst),
            self.cutoff,
            self.namespace
        );
        Ok(())
    }

    fn on_cancel(&self) {
        debug!("Purge of {} asked to stop", self.namespace);
    }
}
