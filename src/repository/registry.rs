// src/repository/registry.rs
//! Repository registry
//!
//! Process-wide service owning every configured repository. Constructed at
//! startup and passed by reference to whatever needs to resolve a repository
//! by name. Group membership is validated here, at configuration time, so
//! dispatch never has to reject a cyclic graph.

use super::view::{Context, DispatchedSet};
use super::{Repository, RepositoryType, Request, Response};
use crate::error::{Error, Result};
use crate::group::{GroupDispatcher, MembershipDiff};
use crate::metrics::ServerMetrics;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registry of configured repositories
pub struct RepositoryManager {
    repositories: DashMap<String, Arc<Repository>>,
    metrics: Arc<ServerMetrics>,
    /// Held while a membership change is validated and applied
    membership: Mutex<()>,
}

impl RepositoryManager {
    pub fn new() -> Self {
        Self {
            repositories: DashMap::new(),
            metrics: Arc::new(ServerMetrics::new()),
            membership: Mutex::new(()),
        }
    }

    /// Share an existing metrics collector
    pub fn with_metrics(mut self, metrics: Arc<ServerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    /// Register a repository
    ///
    /// Group members must already be registered, share the group's format and
    /// must not lead back to the group.
    pub fn add(&self, repository: Repository) -> Result<Arc<Repository>> {
        let name = repository.name().to_string();
        let _membership = self.membership.lock();
        if self.repositories.contains_key(&name) {
            return Err(Error::DuplicateRepository(name));
        }

        if let Some(group) = repository.group() {
            self.validate_members(&name, repository.format(), &group.member_names())?;
        }

        let repository = Arc::new(repository);
        match self.repositories.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::DuplicateRepository(name)),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&repository));
                info!("Registered repository {}", repository);
                Ok(repository)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Repository>> {
        self.repositories.get(name).map(|r| Arc::clone(r.value()))
    }

    /// Look up a repository, failing if it is not registered
    pub fn require(&self, name: &str) -> Result<Arc<Repository>> {
        self.get(name)
            .ok_or_else(|| Error::RepositoryNotFound(name.to_string()))
    }

    /// Registered repository names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.repositories.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    /// Every registered repository, sorted by name
    pub fn all(&self) -> Vec<Arc<Repository>> {
        let mut all: Vec<Arc<Repository>> = self
            .repositories
            .iter()
            .map(|r| Arc::clone(r.value()))
            .collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }

    /// Resolve a group's members in declared order
    ///
    /// Members that are no longer registered or whose format differs from the
    /// group's are logged and skipped.
    pub fn members(&self, group: &Repository) -> Result<Vec<Arc<Repository>>> {
        let facet = group
            .group()
            .ok_or_else(|| Error::NotAGroup(group.name().to_string()))?;

        let mut members = Vec::new();
        for name in facet.member_names() {
            let Some(member) = self.get(&name) else {
                warn!("Group {} references missing repository {}", group.name(), name);
                continue;
            };
            if member.format() != group.format() {
                warn!(
                    "Skipping {} in group {}: format {} does not match {}",
                    name,
                    group.name(),
                    member.format(),
                    group.format()
                );
                continue;
            }
            members.push(member);
        }
        Ok(members)
    }

    /// Non-group repositories reachable from `group`, depth-first in declared order
    pub fn leaf_members(&self, group: &str) -> Result<Vec<Arc<Repository>>> {
        let root = self.require(group)?;
        let mut visited = HashSet::new();
        let mut leaves = Vec::new();
        self.collect_leaves(&root, &mut visited, &mut leaves)?;
        Ok(leaves)
    }

    fn collect_leaves(
        &self,
        repository: &Arc<Repository>,
        visited: &mut HashSet<String>,
        leaves: &mut Vec<Arc<Repository>>,
    ) -> Result<()> {
        if !visited.insert(repository.name().to_string()) {
            return Ok(());
        }
        if repository.kind() != RepositoryType::Group {
            leaves.push(Arc::clone(repository));
            return Ok(());
        }
        for member in self.members(repository)? {
            self.collect_leaves(&member, visited, leaves)?;
        }
        Ok(())
    }

    /// Check a proposed member list for `group`
    fn validate_members(&self, group: &str, format: &str, members: &[String]) -> Result<()> {
        for name in members {
            if name == group {
                return Err(Error::CyclicGroup {
                    group: group.to_string(),
                    path: format!("{} -> {}", group, group),
                });
            }

            let member = self.require(name)?;
            if member.format() != format {
                return Err(Error::IncompatibleFormat {
                    group: group.to_string(),
                    member: name.clone(),
                    expected: format.to_string(),
                    found: member.format().to_string(),
                });
            }

            let mut path = vec![group.to_string(), name.clone()];
            if self.leads_to(name, group, &mut path, &mut HashSet::new()) {
                return Err(Error::CyclicGroup {
                    group: group.to_string(),
                    path: path.join(" -> "),
                });
            }
        }
        Ok(())
    }

    /// Depth-first search for `target` through registered group memberships
    fn leads_to(
        &self,
        from: &str,
        target: &str,
        path: &mut Vec<String>,
        visited: &mut HashSet<String>,
    ) -> bool {
        if !visited.insert(from.to_string()) {
            return false;
        }
        let Some(group) = self.get(from).and_then(|r| r.group().cloned()) else {
            return false;
        };

        for member in group.member_names() {
            path.push(member.clone());
            if member == target || self.leads_to(&member, target, path, visited) {
                return true;
            }
            path.pop();
        }
        false
    }

    /// Replace a group's member list
    ///
    /// Any change in membership or ordering invalidates the group, its members
    /// and every group that contains it.
    pub fn update_group_members(
        &self,
        group: &str,
        members: Vec<String>,
    ) -> Result<MembershipDiff> {
        let repository = self.require(group)?;
        let facet = repository
            .group()
            .ok_or_else(|| Error::NotAGroup(group.to_string()))?;

        let diff = {
            let _membership = self.membership.lock();
            self.validate_members(group, repository.format(), &members)?;
            facet.replace_members(members)
        };

        if !diff.is_empty() {
            info!(
                "Group {} membership changed: +{:?} -{:?} reordered {:?}",
                group, diff.added, diff.removed, diff.reordered
            );
            self.invalidate_group_caches(group)?;
            self.invalidate_ancestors(group);
        }
        Ok(diff)
    }

    /// Unregister a repository, dropping it from every group that lists it
    pub fn remove(&self, name: &str) -> Result<Arc<Repository>> {
        let (_, removed) = self
            .repositories
            .remove(name)
            .ok_or_else(|| Error::RepositoryNotFound(name.to_string()))?;

        for repository in self.all() {
            if let Some(group) = repository.group()
                && group.remove_member(name)
            {
                debug!("Removed {} from group {}", name, repository.name());
                self.invalidate_group_caches(repository.name())?;
                self.invalidate_ancestors(repository.name());
            }
        }

        info!("Removed repository {}", removed);
        Ok(removed)
    }

    /// Invalidate a group's caches and cascade into every current member
    pub fn invalidate_group_caches(&self, group: &str) -> Result<()> {
        let repository = self.require(group)?;
        if let Some(negative) = repository.negative_cache() {
            negative.invalidate_all();
        }
        let mut visited = HashSet::new();
        self.invalidate_recursive(&repository, &mut visited)
    }

    fn invalidate_recursive(
        &self,
        repository: &Arc<Repository>,
        visited: &mut HashSet<String>,
    ) -> Result<()> {
        if !visited.insert(repository.name().to_string()) {
            return Ok(());
        }
        if let Some(cache) = repository.cache() {
            cache.invalidate_cache();
        }
        if repository.group().is_some() {
            for member in self.members(repository)? {
                self.invalidate_recursive(&member, visited)?;
            }
        }
        Ok(())
    }

    /// Invalidate the own caches of every group containing `name`, directly or transitively
    fn invalidate_ancestors(&self, name: &str) {
        for repository in self.all() {
            if repository.name() == name || repository.group().is_none() {
                continue;
            }
            let mut path = Vec::new();
            if self.leads_to(repository.name(), name, &mut path, &mut HashSet::new()) {
                debug!("Invalidating ancestor group {}", repository.name());
                if let Some(cache) = repository.cache() {
                    cache.invalidate_cache();
                }
                if let Some(negative) = repository.negative_cache() {
                    negative.invalidate_all();
                }
            }
        }
    }

    /// Drop cached misses for a written path in `name` and every group containing it
    fn forget_missing(&self, name: &str, request: &Request) {
        for repository in self.all() {
            let Some(negative) = repository.negative_cache() else {
                continue;
            };
            let contains = repository.name() == name
                || (repository.group().is_some()
                    && self.leads_to(repository.name(), name, &mut Vec::new(), &mut HashSet::new()));
            if contains {
                debug!("{} written; clearing miss in {}", request.path, repository.name());
                negative.invalidate(&negative.key_for(repository.name(), request));
            }
        }
    }

    /// Serve a request from the named repository
    pub async fn dispatch(&self, name: &str, request: &Request) -> Result<Response> {
        self.metrics.record_request();
        let repository = self.require(name)?;
        let view = repository.require_view()?;

        let mut dispatched = DispatchedSet::new();
        let response = view
            .dispatch(self, &repository, request, &mut dispatched)
            .await?;

        if request.method.is_read() {
            if repository.kind() == RepositoryType::Group {
                if response.is_successful() || response.is_final() {
                    self.metrics.record_group_hit();
                } else {
                    self.metrics.record_group_miss();
                }
            }
        } else if response.is_successful() {
            self.forget_missing(name, request);
        }

        if let Some(payload) = &response.payload {
            self.metrics.record_bytes_served(payload.len() as u64);
        }
        Ok(response.for_method(request.method))
    }

    /// Collect a response from every member of a group, in declared order
    pub async fn dispatch_all(
        &self,
        group: &str,
        request: &Request,
    ) -> Result<Vec<(String, Response)>> {
        self.metrics.record_request();
        let repository = self.require(group)?;
        if repository.group().is_none() {
            return Err(Error::NotAGroup(group.to_string()));
        }

        let mut dispatched = DispatchedSet::new();
        let mut ctx = Context::detached(self, &repository, request, &mut dispatched);
        GroupDispatcher::dispatch_all(&mut ctx).await
    }

    /// Collect a response from every non-group repository reachable from a group
    ///
    /// Nested groups are flattened rather than dispatched through their own
    /// view, so every leaf answers even when an earlier sibling already has.
    pub async fn dispatch_leaves(
        &self,
        group: &str,
        request: &Request,
    ) -> Result<Vec<(String, Response)>> {
        self.metrics.record_request();
        let repository = self.require(group)?;
        if repository.group().is_none() {
            return Err(Error::NotAGroup(group.to_string()));
        }

        let mut dispatched = DispatchedSet::new();
        dispatched.mark(group);
        let mut responses = Vec::new();
        for leaf in self.leaf_members(group)? {
            if !dispatched.mark(leaf.name()) {
                continue;
            }
            let view = leaf.require_view()?;
            let response = view.dispatch(self, &leaf, request, &mut dispatched).await?;
            responses.push((leaf.name().to_string(), response));
        }
        Ok(responses)
    }
}

impl Default for RepositoryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheController, CacheInfo};
    use crate::group::GroupFacet;
    use crate::repository::Facet;

    fn hosted(name: &str, format: &str) -> Repository {
        Repository::new(name, format, RepositoryType::Hosted)
            .with_facet(Facet::Cache(Arc::new(CacheController::default())))
    }

    fn group(name: &str, members: &[&str]) -> Repository {
        let members = members.iter().map(|m| m.to_string()).collect();
        Repository::new(name, "maven2", RepositoryType::Group)
            .with_facet(Facet::Group(Arc::new(GroupFacet::new(members))))
            .with_facet(Facet::Cache(Arc::new(CacheController::default())))
    }

    #[test]
    fn test_add_and_lookup() {
        let registry = RepositoryManager::new();
        registry.add(hosted("releases", "maven2")).unwrap();

        assert!(registry.get("releases").is_some());
        assert!(matches!(
            registry.require("missing"),
            Err(Error::RepositoryNotFound(_))
        ));
        assert!(matches!(
            registry.add(hosted("releases", "maven2")),
            Err(Error::DuplicateRepository(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_and_incompatible_members() {
        let registry = RepositoryManager::new();
        registry.add(hosted("npm-hosted", "npm")).unwrap();

        assert!(matches!(
            registry.add(group("public", &["missing"])),
            Err(Error::RepositoryNotFound(_))
        ));
        assert!(matches!(
            registry.add(group("public", &["npm-hosted"])),
            Err(Error::IncompatibleFormat { .. })
        ));
    }

    #[test]
    fn test_rejects_cycles() {
        let registry = RepositoryManager::new();
        registry.add(hosted("releases", "maven2")).unwrap();
        registry.add(group("a", &["releases"])).unwrap();
        registry.add(group("b", &["a"])).unwrap();

        let err = registry
            .update_group_members("a", vec!["releases".to_string(), "b".to_string()])
            .unwrap_err();
        match err {
            Error::CyclicGroup { group, path } => {
                assert_eq!(group, "a");
                assert_eq!(path, "a -> b -> a");
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(matches!(
            registry.update_group_members("a", vec!["a".to_string()]),
            Err(Error::CyclicGroup { .. })
        ));
        // Rejected updates leave membership untouched
        assert_eq!(
            registry.get("a").unwrap().group().unwrap().member_names(),
            vec!["releases".to_string()]
        );
    }

    #[test]
    fn test_members_skip_incompatible_format() {
        let registry = RepositoryManager::new();
        registry.add(hosted("releases", "maven2")).unwrap();
        let public = registry.add(group("public", &["releases"])).unwrap();

        // Replace the member with a differently formatted repository
        registry.remove("releases").unwrap();
        registry.add(hosted("releases", "npm")).unwrap();
        public
            .group()
            .unwrap()
            .replace_members(vec!["releases".to_string()]);

        assert!(registry.members(&public).unwrap().is_empty());
    }

    #[test]
    fn test_membership_change_invalidates_cascade() {
        let registry = RepositoryManager::new();
        registry.add(hosted("releases", "maven2")).unwrap();
        registry.add(hosted("snapshots", "maven2")).unwrap();
        registry.add(group("internal", &["releases"])).unwrap();
        registry.add(group("public", &["internal"])).unwrap();

        let stamp = |name: &str| registry.get(name).unwrap().cache().unwrap().current();
        let stale = |name: &str, info: CacheInfo| registry.get(name).unwrap().cache().unwrap().is_stale(&info);

        let internal = stamp("internal");
        let releases = stamp("releases");
        let public = stamp("public");
        let snapshots = stamp("snapshots");

        let diff = registry
            .update_group_members(
                "internal",
                vec!["releases".to_string(), "snapshots".to_string()],
            )
            .unwrap();
        assert_eq!(diff.added, vec!["snapshots".to_string()]);

        assert!(stale("internal", internal));
        assert!(stale("releases", releases));
        assert!(stale("snapshots", snapshots));
        assert!(stale("public", public));
    }

    #[test]
    fn test_unchanged_membership_keeps_caches() {
        let registry = RepositoryManager::new();
        registry.add(hosted("releases", "maven2")).unwrap();
        registry.add(group("public", &["releases"])).unwrap();

        let cache = Arc::clone(registry.get("public").unwrap().cache().unwrap());
        let info = cache.current();

        let diff = registry
            .update_group_members("public", vec!["releases".to_string()])
            .unwrap();
        assert!(diff.is_empty());
        assert!(!cache.is_stale(&info));
    }

    #[test]
    fn test_remove_strips_group_membership() {
        let registry = RepositoryManager::new();
        registry.add(hosted("releases", "maven2")).unwrap();
        registry.add(hosted("snapshots", "maven2")).unwrap();
        registry
            .add(group("public", &["releases", "snapshots"]))
            .unwrap();

        registry.remove("releases").unwrap();

        let public = registry.get("public").unwrap();
        assert_eq!(
            public.group().unwrap().member_names(),
            vec!["snapshots".to_string()]
        );
        assert!(matches!(
            registry.remove("releases"),
            Err(Error::RepositoryNotFound(_))
        ));
    }

    #[test]
    fn test_leaf_members_flatten_nested_groups() {
        let registry = RepositoryManager::new();
        registry.add(hosted("a", "maven2")).unwrap();
        registry.add(hosted("b", "maven2")).unwrap();
        registry.add(hosted("c", "maven2")).unwrap();
        registry.add(group("inner", &["b", "a"])).unwrap();
        registry.add(group("outer", &["a", "inner", "c"])).unwrap();

        let leaves: Vec<String> = registry
            .leaf_members("outer")
            .unwrap()
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(leaves, vec!["a", "b", "c"]);
    }
}
