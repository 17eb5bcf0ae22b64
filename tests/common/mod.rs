// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use quarry::cache::{CacheController, NegativeCacheConfig, NegativeCacheFacet, NegativeCacheHandler};
use quarry::repository::{Context, Handler, HostedHandler, ViewFacet};
use quarry::{
    Facet, GroupDispatcher, GroupFacet, Repository, RepositoryType, Response, Result, Status,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Terminal handler answering from a script, counting how often it is reached
///
/// Once the script runs out, the last response is repeated.
pub struct ScriptedHandler {
    script: Mutex<VecDeque<Response>>,
    last: Mutex<Option<Response>>,
    calls: AtomicUsize,
}

impl ScriptedHandler {
    pub fn new(responses: Vec<Response>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(responses.into()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn status(code: u16) -> Arc<Self> {
        Self::new(vec![Response::new(Status::new(code))])
    }

    pub fn content(bytes: &[u8]) -> Arc<Self> {
        Self::new(vec![Response::ok(bytes.to_vec())])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for ScriptedHandler {
    async fn handle(&self, _ctx: &mut Context<'_>) -> Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        let mut last = self.last.lock();
        if let Some(response) = next {
            *last = Some(response);
        }
        Ok(last.clone().unwrap_or_else(Response::not_found))
    }
}

/// Negative cache settings with a generous TTL
pub fn negative_config() -> NegativeCacheConfig {
    NegativeCacheConfig {
        max_entries: 100,
        ..NegativeCacheConfig::default()
    }
}

/// Proxy-style repository served by `handler` behind a negative cache
pub fn leaf(name: &str, format: &str, handler: Arc<dyn Handler>) -> Repository {
    let view = ViewFacet::new(vec![Arc::new(NegativeCacheHandler), handler]);
    Repository::new(name, format, RepositoryType::Proxy)
        .with_facet(Facet::View(Arc::new(view)))
        .with_facet(Facet::Cache(Arc::new(CacheController::default())))
        .with_facet(Facet::NegativeCache(Arc::new(NegativeCacheFacet::new(
            negative_config(),
        ))))
}

/// Leaf repository with no negative cache
pub fn plain_leaf(name: &str, format: &str, handler: Arc<dyn Handler>) -> Repository {
    Repository::new(name, format, RepositoryType::Hosted)
        .with_facet(Facet::View(Arc::new(ViewFacet::new(vec![handler]))))
        .with_facet(Facet::Cache(Arc::new(CacheController::default())))
}

/// Hosted repository seeded with `files`
pub fn hosted(name: &str, format: &str, files: &[(&str, &[u8])]) -> Repository {
    let handler = HostedHandler::new();
    for (path, bytes) in files {
        handler.put(path, bytes.to_vec());
    }
    plain_leaf(name, format, Arc::new(handler))
}

/// Group repository resolving `members` in order
pub fn group(name: &str, format: &str, members: &[&str]) -> Repository {
    let members = members.iter().map(|m| m.to_string()).collect();
    Repository::new(name, format, RepositoryType::Group)
        .with_facet(Facet::View(Arc::new(ViewFacet::single(GroupDispatcher::new()))))
        .with_facet(Facet::Cache(Arc::new(CacheController::default())))
        .with_facet(Facet::Group(Arc::new(GroupFacet::new(members))))
}
