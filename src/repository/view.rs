// src/repository/view.rs

//! View pipeline - ordered handler chains and the per-request dispatch context
//!
//! A repository's view is a chain of [`Handler`]s. Each handler receives a
//! [`Context`] and either answers the request itself or calls
//! [`Context::proceed`] to hand it to the next handler in the chain.

use super::{RepositoryManager, Request, Response};
use crate::error::Result;
use crate::repository::Repository;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

/// A stage in a repository's request pipeline
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &mut Context<'_>) -> Result<Response>;
}

/// Repositories already visited while serving one inbound request
///
/// Created once per request at the top-level dispatch and shared by every
/// nested group dispatch, so no repository is entered twice.
#[derive(Debug, Default)]
pub struct DispatchedSet {
    seen: HashSet<String>,
    order: Vec<String>,
}

impl DispatchedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a repository; returns false if it was already dispatched
    pub fn mark(&mut self, name: &str) -> bool {
        if self.seen.insert(name.to_string()) {
            self.order.push(name.to_string());
            true
        } else {
            false
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.seen.contains(name)
    }

    /// Visited repositories in dispatch order
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Dispatch state handed to each handler
pub struct Context<'a> {
    registry: &'a RepositoryManager,
    repository: &'a Arc<Repository>,
    request: &'a Request,
    dispatched: &'a mut DispatchedSet,
    handlers: &'a [Arc<dyn Handler>],
    position: usize,
}

impl<'a> Context<'a> {
    /// Context with no handler chain, for driving a repository directly
    pub(crate) fn detached(
        registry: &'a RepositoryManager,
        repository: &'a Arc<Repository>,
        request: &'a Request,
        dispatched: &'a mut DispatchedSet,
    ) -> Self {
        Self {
            registry,
            repository,
            request,
            dispatched,
            handlers: &[],
            position: 0,
        }
    }

    pub fn registry(&self) -> &'a RepositoryManager {
        self.registry
    }

    pub fn repository(&self) -> &'a Arc<Repository> {
        self.repository
    }

    pub fn request(&self) -> &'a Request {
        self.request
    }

    pub fn dispatched(&self) -> &DispatchedSet {
        &*self.dispatched
    }

    pub fn dispatched_mut(&mut self) -> &mut DispatchedSet {
        &mut *self.dispatched
    }

    /// Run the next handler in the chain; an exhausted chain answers 404
    pub async fn proceed(&mut self) -> Result<Response> {
        let Some(handler) = self.handlers.get(self.position).cloned() else {
            trace!("Handler chain of {} exhausted", self.repository.name());
            return Ok(Response::not_found());
        };

        self.position += 1;
        let result = handler.handle(self).await;
        self.position -= 1;
        result
    }

    /// Dispatch to another repository's view, sharing this request's dispatched set
    pub async fn dispatch_to(&mut self, member: &Arc<Repository>) -> Result<Response> {
        let view = member.require_view()?;
        view.dispatch(self.registry, member, self.request, self.dispatched)
            .await
    }
}

/// Ordered handler chain serving a repository
pub struct ViewFacet {
    handlers: Vec<Arc<dyn Handler>>,
}

impl ViewFacet {
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Self {
        Self { handlers }
    }

    /// Build a view from a single handler
    pub fn single(handler: impl Handler + 'static) -> Self {
        Self::new(vec![Arc::new(handler)])
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the chain for `repository`
    pub async fn dispatch(
        &self,
        registry: &RepositoryManager,
        repository: &Arc<Repository>,
        request: &Request,
        dispatched: &mut DispatchedSet,
    ) -> Result<Response> {
        let mut ctx = Context {
            registry,
            repository,
            request,
            dispatched,
            handlers: &self.handlers,
            position: 0,
        };
        ctx.proceed().await
    }
}
