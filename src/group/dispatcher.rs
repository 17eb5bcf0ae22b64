// src/group/dispatcher.rs
//! Group request dispatch
//!
//! Walks a group's members in declared order. Every repository entered while
//! serving one inbound request is recorded in the request's
//! [`DispatchedSet`](crate::repository::DispatchedSet), which nested groups
//! share, so cyclic or diamond-shaped group graphs terminate and no member is
//! dispatched twice.

use crate::error::Result;
use crate::repository::{Context, Handler, Method, Repository, Response};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};

const ALLOWED_METHODS: &[Method] = &[Method::Get, Method::Head];

/// View handler for group repositories
#[derive(Debug, Default)]
pub struct GroupDispatcher;

impl GroupDispatcher {
    pub fn new() -> Self {
        Self
    }

    /// Members of the group served by `ctx`, in declared order
    fn members(ctx: &Context<'_>) -> Result<Vec<Arc<Repository>>> {
        ctx.registry().members(ctx.repository())
    }

    /// Return the first successful or final member response
    ///
    /// Member errors propagate immediately; only unsuccessful responses fall
    /// through to the next member.
    pub async fn first_success(ctx: &mut Context<'_>) -> Result<Response> {
        let group = ctx.repository().name().to_string();
        ctx.dispatched_mut().mark(&group);

        for member in Self::members(ctx)? {
            if !ctx.dispatched_mut().mark(member.name()) {
                trace!("Skipping {} in {}: already dispatched", member.name(), group);
                continue;
            }

            let response = ctx.dispatch_to(&member).await?;
            if response.is_final() || response.is_successful() {
                debug!(
                    "Group {} answered by {} ({})",
                    group,
                    member.name(),
                    response.status
                );
                return Ok(response);
            }
            trace!("Member {} of {} returned {}", member.name(), group, response.status);
        }

        debug!("No member of {} could serve {}", group, ctx.request().path);
        Ok(Response::not_found())
    }

    /// Dispatch to every member not yet visited, keeping declared order
    pub async fn dispatch_all(ctx: &mut Context<'_>) -> Result<Vec<(String, Response)>> {
        let group = ctx.repository().name().to_string();
        ctx.dispatched_mut().mark(&group);

        let mut responses = Vec::new();
        for member in Self::members(ctx)? {
            if !ctx.dispatched_mut().mark(member.name()) {
                continue;
            }
            let response = ctx.dispatch_to(&member).await?;
            responses.push((member.name().to_string(), response));
        }
        Ok(responses)
    }
}

#[async_trait]
impl Handler for GroupDispatcher {
    async fn handle(&self, ctx: &mut Context<'_>) -> Result<Response> {
        let method = ctx.request().method;
        if !method.is_read() {
            return Ok(Response::method_not_allowed(method, ALLOWED_METHODS));
        }
        Self::first_success(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupFacet;
    use crate::repository::{
        DispatchedSet, Facet, HostedHandler, RepositoryManager, RepositoryType, Request, ViewFacet,
    };

    fn hosted(name: &str, files: &[(&str, &[u8])]) -> Repository {
        let handler = HostedHandler::new();
        for (path, bytes) in files {
            handler.put(path, bytes.to_vec());
        }
        Repository::new(name, "maven2", RepositoryType::Hosted)
            .with_facet(Facet::View(Arc::new(ViewFacet::single(handler))))
    }

    fn setup() -> RepositoryManager {
        let registry = RepositoryManager::new();
        registry.add(hosted("a", &[("/x.jar", b"from-a")])).unwrap();
        registry.add(hosted("b", &[("/x.jar", b"from-b")])).unwrap();
        registry
            .add(
                Repository::new("g", "maven2", RepositoryType::Group)
                    .with_facet(Facet::View(Arc::new(ViewFacet::single(GroupDispatcher::new()))))
                    .with_facet(Facet::Group(Arc::new(GroupFacet::new(vec![
                        "a".to_string(),
                        "b".to_string(),
                    ])))),
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_marks_group_and_visited_members() {
        let registry = setup();
        let group = registry.require("g").unwrap();
        let request = Request::get("/missing.jar");
        let mut dispatched = DispatchedSet::new();

        let mut ctx = Context::detached(&registry, &group, &request, &mut dispatched);
        let response = GroupDispatcher::first_success(&mut ctx).await.unwrap();

        assert!(response.status.is_not_found());
        assert_eq!(dispatched.order(), &["g", "a", "b"]);
    }

    #[tokio::test]
    async fn test_skips_already_dispatched_member() {
        let registry = setup();
        let group = registry.require("g").unwrap();
        let request = Request::get("/x.jar");
        let mut dispatched = DispatchedSet::new();
        dispatched.mark("a");

        let mut ctx = Context::detached(&registry, &group, &request, &mut dispatched);
        let response = GroupDispatcher::first_success(&mut ctx).await.unwrap();

        assert_eq!(response.payload.as_deref(), Some(&b"from-b"[..]));
    }

    #[tokio::test]
    async fn test_first_member_wins() {
        let registry = setup();
        let response = registry.dispatch("g", &Request::get("/x.jar")).await.unwrap();
        assert_eq!(response.payload.as_deref(), Some(&b"from-a"[..]));
        assert_eq!(registry.metrics().snapshot().group_hits, 1);
    }

    #[tokio::test]
    async fn test_write_rejected() {
        let registry = setup();
        let response = registry
            .dispatch("g", &Request::put("/x.jar", Vec::new()))
            .await
            .unwrap();
        assert_eq!(response.status.code, 405);
        assert_eq!(registry.metrics().snapshot().group_misses, 0);
    }
}
