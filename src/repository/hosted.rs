// src/repository/hosted.rs
//! Hosted repositories - content stored locally and served as-is

use super::view::{Context, Handler};
use super::{Method, Response, Status};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::Path;
use tracing::{debug, info};
use walkdir::WalkDir;

const ALLOWED_METHODS: &[Method] = &[Method::Get, Method::Head, Method::Put, Method::Delete];

/// Terminal handler for hosted content
#[derive(Debug, Default)]
pub struct HostedHandler {
    content: DashMap<String, Vec<u8>>,
}

impl HostedHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed content from a directory tree; paths are relative to `root`
    pub fn from_dir(root: &Path) -> Result<Self> {
        let handler = Self::new();
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry
                .map_err(|e| Error::InitError(format!("walking {}: {}", root.display(), e)))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| Error::InitError(e.to_string()))?;
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let bytes = std::fs::read(entry.path())?;
            handler.put(&key, bytes);
        }

        info!("Loaded {} hosted files from {}", handler.len(), root.display());
        Ok(handler)
    }

    fn key(path: &str) -> String {
        format!("/{}", path.trim_start_matches('/'))
    }

    /// Store content, replacing any previous bytes; returns true if newly created
    pub fn put(&self, path: &str, bytes: Vec<u8>) -> bool {
        self.content.insert(Self::key(path), bytes).is_none()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.content.get(&Self::key(path)).map(|c| c.value().clone())
    }

    pub fn delete(&self, path: &str) -> bool {
        self.content.remove(&Self::key(path)).is_some()
    }

    /// Stored paths under `prefix`, sorted
    pub fn list(&self, prefix: &str) -> Vec<String> {
        let prefix = Self::key(prefix);
        let mut paths: Vec<String> = self
            .content
            .iter()
            .filter(|c| c.key().starts_with(&prefix))
            .map(|c| c.key().clone())
            .collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

#[async_trait]
impl Handler for HostedHandler {
    async fn handle(&self, ctx: &mut Context<'_>) -> Result<Response> {
        let request = ctx.request();
        let path = request.path.as_str();

        match request.method {
            Method::Get | Method::Head if path.ends_with('/') => {
                let listing = self.list(path);
                if listing.is_empty() {
                    return Ok(Response::not_found());
                }
                Ok(Response::ok(listing.join("\n").into_bytes()).for_method(request.method))
            }
            Method::Get | Method::Head => match self.get(path) {
                Some(bytes) => Ok(Response::ok(bytes).for_method(request.method)),
                None => Ok(Response::not_found()),
            },
            Method::Put => {
                let bytes = request.payload.clone().unwrap_or_default();
                debug!(
                    "Storing {} ({} bytes) in {}",
                    path,
                    bytes.len(),
                    ctx.repository().name()
                );
                self.put(path, bytes);
                Ok(Response::new(Status::new(Status::CREATED)))
            }
            Method::Delete => {
                if self.delete(path) {
                    Ok(Response::new(Status::new(Status::NO_CONTENT)))
                } else {
                    Ok(Response::not_found())
                }
            }
            other => Ok(Response::method_not_allowed(other, ALLOWED_METHODS)),
        }
    }
}
