// src/group/mod.rs
//! Group repositories
//!
//! A group is a virtual repository whose content is the first match (or the
//! union, in merge mode) of an ordered list of member repositories. Members
//! are referenced by name and resolved through the registry at dispatch time.

mod dispatcher;

pub use dispatcher::GroupDispatcher;

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;

/// Change in a group's member list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MembershipDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Members present before and after whose relative order changed
    pub reordered: Vec<String>,
}

impl MembershipDiff {
    /// Compare two ordered member lists
    pub fn between(old: &[String], new: &[String]) -> Self {
        let old_set: HashSet<&String> = old.iter().collect();
        let new_set: HashSet<&String> = new.iter().collect();

        let added = new
            .iter()
            .filter(|m| !old_set.contains(m))
            .cloned()
            .collect();
        let removed = old
            .iter()
            .filter(|m| !new_set.contains(m))
            .cloned()
            .collect();

        let kept_old: Vec<&String> = old.iter().filter(|m| new_set.contains(m)).collect();
        let kept_new: Vec<&String> = new.iter().filter(|m| old_set.contains(m)).collect();
        let reordered = kept_old
            .iter()
            .zip(kept_new.iter())
            .filter(|(before, after)| before != after)
            .map(|(_, after)| (*after).clone())
            .collect();

        Self {
            added,
            removed,
            reordered,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.reordered.is_empty()
    }
}

/// Group capability: the ordered member list
#[derive(Debug, Default)]
pub struct GroupFacet {
    members: RwLock<Vec<String>>,
}

impl GroupFacet {
    pub fn new(members: Vec<String>) -> Self {
        Self {
            members: RwLock::new(members),
        }
    }

    /// Member names in declared order
    pub fn member_names(&self) -> Vec<String> {
        self.members.read().clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.read().iter().any(|m| m == name)
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// Swap in a new member list, returning what changed
    pub fn replace_members(&self, members: Vec<String>) -> MembershipDiff {
        let mut current = self.members.write();
        let diff = MembershipDiff::between(&current, &members);
        *current = members;
        diff
    }

    /// Drop a member if present; returns whether the list changed
    pub fn remove_member(&self, name: &str) -> bool {
        let mut current = self.members.write();
        let before = current.len();
        current.retain(|m| m != name);
        current.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_diff_added_removed() {
        let diff = MembershipDiff::between(&names(&["a", "b"]), &names(&["b", "c"]));
        assert_eq!(diff.added, names(&["c"]));
        assert_eq!(diff.removed, names(&["a"]));
        assert!(diff.reordered.is_empty());
    }

    #[test]
    fn test_diff_reordered() {
        let diff = MembershipDiff::between(&names(&["a", "b", "c"]), &names(&["c", "b", "a"]));
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
        assert_eq!(diff.reordered, names(&["c", "a"]));
        assert!(!diff.is_empty());
    }

    #[test]
    fn test_diff_unchanged() {
        let diff = MembershipDiff::between(&names(&["a", "b"]), &names(&["a", "b"]));
        assert!(diff.is_empty());
    }

    #[test]
    fn test_replace_and_remove_members() {
        let facet = GroupFacet::new(names(&["releases", "snapshots"]));
        let diff = facet.replace_members(names(&["snapshots", "releases"]));
        assert!(!diff.is_empty());
        assert_eq!(facet.member_names(), names(&["snapshots", "releases"]));

        assert!(facet.remove_member("releases"));
        assert!(!facet.remove_member("releases"));
        assert_eq!(facet.len(), 1);
    }
}
