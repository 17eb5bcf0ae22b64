// src/repository/proxy.rs

//! Proxy repositories - pull-through caching of a remote origin
//!
//! Content fetched from the upstream is kept together with a [`CacheInfo`]
//! stamp from the repository's [`CacheController`](crate::cache::CacheController).
//! Fresh content is served locally; stale content is re-fetched, and served
//! anyway if the upstream is failing.

use super::view::{Context, Handler};
use super::{Method, Request, Response, Status};
use crate::cache::CacheInfo;
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Default timeout for upstream requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum attempts for a failed upstream request
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds, multiplied by the attempt number
const RETRY_DELAY_MS: u64 = 500;

const ALLOWED_METHODS: &[Method] = &[Method::Get, Method::Head];

/// Remote origin of a proxy repository
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Fetch `request` from the origin; transport failures are errors,
    /// HTTP failures are responses
    async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// HTTP origin with retry support
pub struct HttpUpstream {
    client: Client,
    base: Url,
    max_retries: u32,
}

impl HttpUpstream {
    /// Create an upstream rooted at `base_url`
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid remote URL {base_url}: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("quarry/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base,
            max_retries: MAX_RETRIES,
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Resolve a request path against the base URL
    pub fn url_for(&self, path: &str) -> Result<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::InvalidRequest(format!("bad path {path}: {e}")))
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let url = self.url_for(&request.path)?;
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            other => return Ok(Response::method_not_allowed(other, ALLOWED_METHODS)),
        };

        let mut attempt = 0;
        let response = loop {
            attempt += 1;
            match self.client.request(method.clone(), url.clone()).send().await {
                Ok(response) => break response,
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::DownloadError(format!(
                            "Failed to fetch {url} after {attempt} attempts: {e}"
                        )));
                    }
                    warn!("Fetch of {} failed (attempt {}): {}", url, attempt, e);
                    tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64))
                        .await;
                }
            }
        };

        let code = response.status().as_u16();
        debug!("Upstream {} answered {}", url, code);
        let status = match response.status().canonical_reason() {
            Some(reason) if !response.status().is_success() => Status::with_message(code, reason),
            _ => Status::new(code),
        };

        let mut result = Response::new(status);
        if response.status().is_success() && request.method == Method::Get {
            let body = response
                .bytes()
                .await
                .map_err(|e| Error::DownloadError(format!("Failed to read {url}: {e}")))?;
            result.payload = Some(body.to_vec());
        }
        Ok(result)
    }
}

#[derive(Debug, Clone)]
struct CachedContent {
    payload: Vec<u8>,
    info: CacheInfo,
}

/// Terminal handler for proxy repositories
pub struct ProxyHandler {
    upstream: Arc<dyn Upstream>,
    content: DashMap<String, CachedContent>,
}

impl ProxyHandler {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self {
            upstream,
            content: DashMap::new(),
        }
    }

    /// Number of cached paths
    pub fn cached_len(&self) -> usize {
        self.content.len()
    }

    pub fn is_cached(&self, path: &str) -> bool {
        self.content.contains_key(path)
    }

    /// Serve a previously cached copy after an upstream failure
    fn serve_stale(
        &self,
        ctx: &Context<'_>,
        cached: CachedContent,
        reason: &dyn std::fmt::Display,
    ) -> Response {
        warn!(
            "Upstream for {} failed ({}); serving stale {}",
            ctx.repository().name(),
            reason,
            ctx.request().path
        );
        ctx.registry().metrics().record_stale_served();
        Response::ok(cached.payload).for_method(ctx.request().method)
    }
}

#[async_trait]
impl Handler for ProxyHandler {
    async fn handle(&self, ctx: &mut Context<'_>) -> Result<Response> {
        let request = ctx.request();
        if !request.method.is_read() {
            return Ok(Response::method_not_allowed(request.method, ALLOWED_METHODS));
        }

        let controller = ctx.repository().cache().cloned();
        let metrics = Arc::clone(ctx.registry().metrics());
        let cached = self.content.get(&request.path).map(|c| c.value().clone());

        if let (Some(controller), Some(entry)) = (&controller, &cached)
            && !controller.is_stale(&entry.info)
        {
            debug!("Serving cached {} from {}", request.path, ctx.repository().name());
            metrics.record_proxy_cache_hit();
            return Ok(Response::ok(entry.payload.clone()).for_method(request.method));
        }

        metrics.record_upstream_fetch();
        let response = match self.upstream.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                metrics.record_upstream_error();
                return match cached {
                    Some(cached) => Ok(self.serve_stale(ctx, cached, &e)),
                    None => Err(e),
                };
            }
        };

        if response.is_successful() {
            if let (Some(controller), Some(payload)) = (&controller, &response.payload) {
                self.content.insert(
                    request.path.clone(),
                    CachedContent {
                        payload: payload.clone(),
                        info: controller.current(),
                    },
                );
            }
            return Ok(response);
        }

        if response.status.is_not_found() {
            if self.content.remove(&request.path).is_some() {
                info!(
                    "{} no longer exists upstream of {}",
                    request.path,
                    ctx.repository().name()
                );
            }
            return Ok(response);
        }

        match cached {
            Some(cached) => Ok(self.serve_stale(ctx, cached, &response.status)),
            None => Ok(response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheController;
    use crate::repository::{Facet, Repository, RepositoryManager, RepositoryType, ViewFacet};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Upstream answering from a scripted queue, repeating the last answer
    struct Scripted {
        answers: Mutex<Vec<std::result::Result<u16, String>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(answers: Vec<std::result::Result<u16, String>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Upstream for Scripted {
        async fn fetch(&self, request: &Request) -> Result<Response> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let answers = self.answers.lock();
            let answer = answers.get(n).or(answers.last()).cloned();
            match answer {
                Some(Ok(200)) => Ok(Response::ok(format!("v{n}:{}", request.path).into_bytes())),
                Some(Ok(code)) => Ok(Response::new(Status::new(code))),
                Some(Err(msg)) => Err(Error::DownloadError(msg)),
                None => Ok(Response::not_found()),
            }
        }
    }

    fn setup(
        upstream: Arc<Scripted>,
        ttl: Option<Duration>,
    ) -> (RepositoryManager, Arc<ProxyHandler>) {
        let proxy = Arc::new(ProxyHandler::new(upstream));
        let registry = RepositoryManager::new();
        registry
            .add(
                Repository::new("central", "maven2", RepositoryType::Proxy)
                    .with_facet(Facet::Cache(Arc::new(CacheController::new(ttl))))
                    .with_facet(Facet::View(Arc::new(ViewFacet::new(vec![
                        Arc::clone(&proxy) as Arc<dyn Handler>,
                    ])))),
            )
            .unwrap();
        (registry, proxy)
    }

    #[test]
    fn test_url_for() {
        let upstream = HttpUpstream::new("https://repo.example.org/maven2").unwrap();
        assert_eq!(upstream.base().as_str(), "https://repo.example.org/maven2/");
        assert_eq!(
            upstream.url_for("/org/lib/1.0/lib-1.0.jar").unwrap().as_str(),
            "https://repo.example.org/maven2/org/lib/1.0/lib-1.0.jar"
        );
        assert!(HttpUpstream::new("not a url").is_err());
    }

    #[tokio::test]
    async fn test_fresh_content_served_from_cache() {
        let upstream = Scripted::new(vec![Ok(200)]);
        let (registry, _) = setup(Arc::clone(&upstream), None);

        let first = registry.dispatch("central", &Request::get("/a.jar")).await.unwrap();
        let second = registry.dispatch("central", &Request::get("/a.jar")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(upstream.calls(), 1);
        assert_eq!(registry.metrics().snapshot().proxy_cache_hits, 1);
    }

    #[tokio::test]
    async fn test_invalidation_forces_refetch() {
        let upstream = Scripted::new(vec![Ok(200)]);
        let (registry, _) = setup(Arc::clone(&upstream), None);

        registry.dispatch("central", &Request::get("/a.jar")).await.unwrap();
        registry
            .get("central")
            .unwrap()
            .cache()
            .unwrap()
            .invalidate_cache();
        let refetched = registry.dispatch("central", &Request::get("/a.jar")).await.unwrap();

        assert_eq!(upstream.calls(), 2);
        assert_eq!(refetched.payload.unwrap(), b"v1:/a.jar");
    }

    #[tokio::test]
    async fn test_stale_copy_served_when_upstream_fails() {
        let upstream = Scripted::new(vec![Ok(200), Ok(503), Err("connection refused".into())]);
        let (registry, _) = setup(Arc::clone(&upstream), Some(Duration::ZERO));

        let original = registry.dispatch("central", &Request::get("/a.jar")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let during_503 = registry.dispatch("central", &Request::get("/a.jar")).await.unwrap();
        let during_error = registry.dispatch("central", &Request::get("/a.jar")).await.unwrap();

        assert_eq!(during_503.payload, original.payload);
        assert_eq!(during_error.payload, original.payload);
        assert_eq!(registry.metrics().snapshot().stale_served, 2);
    }

    #[tokio::test]
    async fn test_upstream_not_found_drops_cached_copy() {
        let upstream = Scripted::new(vec![Ok(200), Ok(404)]);
        let (registry, proxy) = setup(Arc::clone(&upstream), Some(Duration::ZERO));

        registry.dispatch("central", &Request::get("/a.jar")).await.unwrap();
        assert!(proxy.is_cached("/a.jar"));
        tokio::time::sleep(Duration::from_millis(5)).await;
        let gone = registry.dispatch("central", &Request::get("/a.jar")).await.unwrap();

        assert!(gone.status.is_not_found());
        assert!(!proxy.is_cached("/a.jar"));
        assert_eq!(proxy.cached_len(), 0);
    }

    #[tokio::test]
    async fn test_error_without_cached_copy_propagates() {
        let upstream = Scripted::new(vec![Err("timeout".into())]);
        let (registry, _) = setup(upstream, None);

        let err = registry
            .dispatch("central", &Request::get("/a.jar"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DownloadError(_)));
    }

    #[tokio::test]
    async fn test_rejects_writes() {
        let (registry, _) = setup(Scripted::new(vec![Ok(200)]), None);
        let response = registry
            .dispatch("central", &Request::put("/a.jar", b"x".to_vec()))
            .await
            .unwrap();
        assert_eq!(response.status.code, Status::METHOD_NOT_ALLOWED);
    }
}
