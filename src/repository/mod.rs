// src/repository/mod.rs

//! Repository model - identities, capability tables, requests and responses
//!
//! A repository is a name, a format tag and a type (hosted, proxy or group).
//! Behavior is attached through facets: an explicit table mapping a
//! [`FacetKind`] to its implementation, looked up at call time.

mod hosted;
mod proxy;
mod registry;
mod view;

pub use hosted::HostedHandler;
pub use proxy::{HttpUpstream, ProxyHandler, Upstream};
pub use registry::RepositoryManager;
pub use view::{Context, DispatchedSet, Handler, ViewFacet};

use crate::cache::{CacheController, NegativeCacheFacet};
use crate::error::{Error, Result};
use crate::group::GroupFacet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Response attribute a member sets to force the group to accept its response
pub const USE_DISPATCHED_RESPONSE: &str = "group.use-dispatched-response";

/// Request attribute marking a replication write-through request
pub const REPLICATION_REQUEST: &str = "replication";

/// Response attribute listing the methods a 405 response allows
pub const ALLOW: &str = "allow";

/// Request/response attributes
pub type Attributes = BTreeMap<String, String>;

/// Request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Put,
    Post,
    Delete,
}

impl Method {
    /// GET and HEAD are the only methods served by read-only handlers
    pub fn is_read(&self) -> bool {
        matches!(self, Method::Get | Method::Head)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Head => write!(f, "HEAD"),
            Method::Put => write!(f, "PUT"),
            Method::Post => write!(f, "POST"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "PUT" => Ok(Method::Put),
            "POST" => Ok(Method::Post),
            "DELETE" => Ok(Method::Delete),
            other => Err(Error::InvalidRequest(format!("unknown method: {}", other))),
        }
    }
}

/// Response status: a status code plus an optional message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: u16,
    pub message: Option<String>,
}

impl Status {
    pub const OK: u16 = 200;
    pub const CREATED: u16 = 201;
    pub const NO_CONTENT: u16 = 204;
    pub const NOT_FOUND: u16 = 404;
    pub const METHOD_NOT_ALLOWED: u16 = 405;
    pub const BAD_GATEWAY: u16 = 502;
    pub const SERVICE_UNAVAILABLE: u16 = 503;

    pub fn new(code: u16) -> Self {
        Self { code, message: None }
    }

    pub fn with_message(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn ok() -> Self {
        Self::new(Self::OK)
    }

    pub fn not_found() -> Self {
        Self::new(Self::NOT_FOUND)
    }

    /// 2xx
    pub fn is_successful(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_not_found(&self) -> bool {
        self.code == Self::NOT_FOUND
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{} {}", self.code, message),
            None => write!(f, "{}", self.code),
        }
    }
}

/// An inbound content request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub attributes: Attributes,
    pub payload: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: normalize_path(&path.into()),
            attributes: Attributes::new(),
            payload: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::Head, path)
    }

    pub fn put(path: impl Into<String>, payload: Vec<u8>) -> Self {
        let mut request = Self::new(Method::Put, path);
        request.payload = Some(payload);
        request
    }

    /// Set an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Mark this request as a replication write-through
    pub fn replicated(self) -> Self {
        self.with_attribute(REPLICATION_REQUEST, "true")
    }

    pub fn is_replication(&self) -> bool {
        self.attributes
            .get(REPLICATION_REQUEST)
            .is_some_and(|v| v == "true")
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Ensure a leading slash and collapse duplicate separators
fn normalize_path(path: &str) -> String {
    let trailing = path.ends_with('/') && path.len() > 1;
    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() || trailing {
        normalized.push('/');
    }
    normalized
}

/// Response produced by a handler chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub payload: Option<Vec<u8>>,
    pub attributes: Attributes,
}

impl Response {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            payload: None,
            attributes: Attributes::new(),
        }
    }

    pub fn ok(payload: Vec<u8>) -> Self {
        let mut response = Self::new(Status::ok());
        response.payload = Some(payload);
        response
    }

    pub fn not_found() -> Self {
        Self::new(Status::not_found())
    }

    /// 405 listing the allowed methods
    pub fn method_not_allowed(method: Method, allowed: &[Method]) -> Self {
        let allow = allowed
            .iter()
            .map(Method::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let mut response = Self::new(Status::with_message(
            Status::METHOD_NOT_ALLOWED,
            format!("{} not allowed", method),
        ));
        response.attributes.insert(ALLOW.to_string(), allow);
        response
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Ask an enclosing group to return this response even if it is not successful
    pub fn use_as_final(self) -> Self {
        self.with_attribute(USE_DISPATCHED_RESPONSE, "true")
    }

    pub fn is_final(&self) -> bool {
        self.attributes
            .get(USE_DISPATCHED_RESPONSE)
            .is_some_and(|v| v == "true")
    }

    pub fn is_successful(&self) -> bool {
        self.status.is_successful()
    }

    /// Drop the payload for HEAD requests
    pub fn for_method(mut self, method: Method) -> Self {
        if method == Method::Head {
            self.payload = None;
        }
        self
    }
}

/// Repository type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryType {
    Hosted,
    Proxy,
    Group,
}

impl fmt::Display for RepositoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryType::Hosted => write!(f, "hosted"),
            RepositoryType::Proxy => write!(f, "proxy"),
            RepositoryType::Group => write!(f, "group"),
        }
    }
}

impl FromStr for RepositoryType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "hosted" => Ok(RepositoryType::Hosted),
            "proxy" => Ok(RepositoryType::Proxy),
            "group" => Ok(RepositoryType::Group),
            other => Err(Error::Config(format!("unknown repository type: {}", other))),
        }
    }
}

/// Capability kinds a repository can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FacetKind {
    View,
    Cache,
    NegativeCache,
    Group,
}

impl fmt::Display for FacetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FacetKind::View => write!(f, "view"),
            FacetKind::Cache => write!(f, "cache"),
            FacetKind::NegativeCache => write!(f, "negative-cache"),
            FacetKind::Group => write!(f, "group"),
        }
    }
}

/// A capability implementation
#[derive(Clone)]
pub enum Facet {
    View(Arc<ViewFacet>),
    Cache(Arc<CacheController>),
    NegativeCache(Arc<NegativeCacheFacet>),
    Group(Arc<GroupFacet>),
}

impl Facet {
    pub fn kind(&self) -> FacetKind {
        match self {
            Facet::View(_) => FacetKind::View,
            Facet::Cache(_) => FacetKind::Cache,
            Facet::NegativeCache(_) => FacetKind::NegativeCache,
            Facet::Group(_) => FacetKind::Group,
        }
    }
}

/// A configured repository
pub struct Repository {
    name: String,
    format: String,
    kind: RepositoryType,
    facets: HashMap<FacetKind, Facet>,
}

impl Repository {
    pub fn new(name: impl Into<String>, format: impl Into<String>, kind: RepositoryType) -> Self {
        Self {
            name: name.into(),
            format: format.into(),
            kind,
            facets: HashMap::new(),
        }
    }

    /// Attach a facet, replacing any facet of the same kind
    pub fn with_facet(mut self, facet: Facet) -> Self {
        self.facets.insert(facet.kind(), facet);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn kind(&self) -> RepositoryType {
        self.kind
    }

    pub fn facet(&self, kind: FacetKind) -> Option<&Facet> {
        self.facets.get(&kind)
    }

    pub fn view(&self) -> Option<&Arc<ViewFacet>> {
        match self.facets.get(&FacetKind::View) {
            Some(Facet::View(view)) => Some(view),
            _ => None,
        }
    }

    pub fn cache(&self) -> Option<&Arc<CacheController>> {
        match self.facets.get(&FacetKind::Cache) {
            Some(Facet::Cache(cache)) => Some(cache),
            _ => None,
        }
    }

    pub fn negative_cache(&self) -> Option<&Arc<NegativeCacheFacet>> {
        match self.facets.get(&FacetKind::NegativeCache) {
            Some(Facet::NegativeCache(facet)) => Some(facet),
            _ => None,
        }
    }

    pub fn group(&self) -> Option<&Arc<GroupFacet>> {
        match self.facets.get(&FacetKind::Group) {
            Some(Facet::Group(group)) => Some(group),
            _ => None,
        }
    }

    /// Look up the view facet, failing if the repository cannot serve requests
    pub fn require_view(&self) -> Result<&Arc<ViewFacet>> {
        self.view().ok_or_else(|| Error::MissingFacet {
            repository: self.name.clone(),
            kind: FacetKind::View,
        })
    }
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.facets.keys().map(FacetKind::to_string).collect();
        kinds.sort();
        f.debug_struct("Repository")
            .field("name", &self.name)
            .field("format", &self.format)
            .field("kind", &self.kind)
            .field("facets", &kinds)
            .finish()
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.name, self.format, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(Request::get("foo/bar.jar").path, "/foo/bar.jar");
        assert_eq!(Request::get("//foo//bar").path, "/foo/bar");
        assert_eq!(Request::get("").path, "/");
        assert_eq!(Request::get("/org/").path, "/org/");
    }

    #[test]
    fn test_status_classes() {
        assert!(Status::ok().is_successful());
        assert!(Status::new(Status::NO_CONTENT).is_successful());
        assert!(!Status::not_found().is_successful());
        assert!(!Status::new(Status::SERVICE_UNAVAILABLE).is_successful());
    }

    #[test]
    fn test_method_not_allowed_lists_methods() {
        let response = Response::method_not_allowed(Method::Put, &[Method::Get, Method::Head]);
        assert_eq!(response.status.code, Status::METHOD_NOT_ALLOWED);
        assert_eq!(response.attributes.get(ALLOW).unwrap(), "GET, HEAD");
    }

    #[test]
    fn test_head_drops_payload() {
        let response = Response::ok(b"jar".to_vec()).for_method(Method::Head);
        assert!(response.payload.is_none());
        assert!(response.is_successful());
    }

    #[test]
    fn test_final_and_replication_flags() {
        let response = Response::not_found().use_as_final();
        assert!(response.is_final());

        let request = Request::get("/a").replicated();
        assert!(request.is_replication());
        assert!(!Request::get("/a").is_replication());
    }

    #[test]
    fn test_facet_lookup() {
        let repo = Repository::new("maven-releases", "maven2", RepositoryType::Hosted)
            .with_facet(Facet::Cache(Arc::new(CacheController::new(None))));

        assert!(repo.cache().is_some());
        assert!(repo.view().is_none());
        assert!(matches!(
            repo.require_view(),
            Err(Error::MissingFacet { kind: FacetKind::View, .. })
        ));
    }
}
