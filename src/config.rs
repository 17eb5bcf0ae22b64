// src/config.rs
//! Configuration file parsing for quarry
//!
//! Supports TOML configuration files with the following sections:
//! - [storage] - Root directory and metadata database
//! - [cache] - Default content time-to-live
//! - [negative_cache] - Not-found caching defaults
//! - [executor] - Background task concurrency
//! - [transaction] - Lock conflict retry policy
//! - [[repository]] - Hosted, proxy and group repositories

use crate::cache::{CacheController, NegativeCacheConfig, NegativeCacheFacet, NegativeCacheHandler};
use crate::executor::ExecutorConfig;
use crate::group::{GroupDispatcher, GroupFacet};
use crate::repository::{
    Facet, Handler, HostedHandler, HttpUpstream, ProxyHandler, Repository, RepositoryManager,
    RepositoryType, ViewFacet,
};
use crate::store::{RetryPolicy, SqliteStore};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// TOML configuration file structure
#[derive(Debug, Default, Deserialize)]
pub struct QuarryConfig {
    #[serde(default)]
    pub storage: StorageSection,

    #[serde(default)]
    pub cache: CacheSection,

    #[serde(default)]
    pub negative_cache: NegativeCacheSection,

    #[serde(default)]
    pub executor: ExecutorSection,

    #[serde(default)]
    pub transaction: TransactionSection,

    /// Repositories, in declaration order
    #[serde(default, rename = "repository")]
    pub repositories: Vec<RepositorySection>,
}

/// Storage configuration section
#[derive(Debug, Deserialize)]
pub struct StorageSection {
    /// Root directory for all storage
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Metadata database, relative to the root unless absolute
    #[serde(default = "default_database")]
    pub database: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            root: default_root(),
            database: default_database(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("/var/lib/quarry")
}

fn default_database() -> PathBuf {
    PathBuf::from("metadata/quarry.db")
}

/// Content cache section
#[derive(Debug, Deserialize)]
pub struct CacheSection {
    /// Default time-to-live (e.g., "1h", "never")
    #[serde(default = "default_cache_ttl")]
    pub default_ttl: String,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            default_ttl: default_cache_ttl(),
        }
    }
}

fn default_cache_ttl() -> String {
    "1h".to_string()
}

/// Negative cache section
#[derive(Debug, Deserialize)]
pub struct NegativeCacheSection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Entry time-to-live (e.g., "15m")
    #[serde(default = "default_negative_ttl")]
    pub ttl: String,

    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Request attributes that take part in the cache key
    #[serde(default)]
    pub key_attributes: Vec<String>,

    /// How often expired entries are swept
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: String,
}

impl Default for NegativeCacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: default_negative_ttl(),
            max_entries: default_max_entries(),
            key_attributes: Vec::new(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_negative_ttl() -> String {
    "15m".to_string()
}

fn default_max_entries() -> usize {
    10_000
}

fn default_cleanup_interval() -> String {
    "5m".to_string()
}

/// Background executor section
#[derive(Debug, Deserialize)]
pub struct ExecutorSection {
    /// Maximum task bodies running at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_max_concurrent() -> usize {
    4
}

/// Transaction retry section
#[derive(Debug, Deserialize)]
pub struct TransactionSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between retries, multiplied by the attempt number
    #[serde(default = "default_retry_delay")]
    pub retry_delay: String,
}

impl Default for TransactionSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> String {
    "100ms".to_string()
}

/// One `[[repository]]` entry
#[derive(Debug, Clone, Deserialize)]
pub struct RepositorySection {
    pub name: String,

    /// Content format; group members must share it
    pub format: String,

    /// "hosted", "proxy" or "group"
    #[serde(rename = "type")]
    pub kind: String,

    /// Overrides `[cache] default_ttl`
    #[serde(default)]
    pub ttl: Option<String>,

    /// Upstream base URL (proxy)
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Directory to seed content from (hosted)
    #[serde(default)]
    pub content_dir: Option<PathBuf>,

    /// Member names in resolution order (group)
    #[serde(default)]
    pub members: Vec<String>,

    /// Overrides `[negative_cache] enabled`
    #[serde(default)]
    pub negative_cache: Option<bool>,
}

impl RepositorySection {
    pub fn repository_type(&self) -> Result<RepositoryType> {
        self.kind
            .parse()
            .map_err(|_| anyhow::anyhow!("repository {}: unknown type '{}'", self.name, self.kind))
    }

    pub fn is_group(&self) -> bool {
        matches!(self.repository_type(), Ok(RepositoryType::Group))
    }
}

impl QuarryConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: QuarryConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        parse_ttl(&self.cache.default_ttl).context("Invalid cache.default_ttl")?;
        parse_duration(&self.negative_cache.ttl).context("Invalid negative_cache.ttl")?;
        parse_duration(&self.negative_cache.cleanup_interval)
            .context("Invalid negative_cache.cleanup_interval")?;
        parse_duration(&self.transaction.retry_delay).context("Invalid transaction.retry_delay")?;

        if self.negative_cache.max_entries == 0 {
            anyhow::bail!("negative_cache.max_entries must be greater than 0");
        }
        if self.executor.max_concurrent == 0 {
            anyhow::bail!("executor.max_concurrent must be greater than 0");
        }

        let mut seen = HashSet::new();
        for repo in &self.repositories {
            if repo.name.trim().is_empty() {
                anyhow::bail!("repository name must not be empty");
            }
            if !seen.insert(repo.name.as_str()) {
                anyhow::bail!("repository {} is declared more than once", repo.name);
            }
            if let Some(ttl) = &repo.ttl {
                parse_ttl(ttl).with_context(|| format!("Invalid ttl for repository {}", repo.name))?;
            }

            match repo.repository_type()? {
                RepositoryType::Proxy => {
                    let url = repo.remote_url.as_deref().with_context(|| {
                        format!("proxy repository {} requires remote_url", repo.name)
                    })?;
                    url::Url::parse(url).with_context(|| {
                        format!("Invalid remote_url for repository {}: {}", repo.name, url)
                    })?;
                }
                RepositoryType::Group => {
                    if repo.members.is_empty() {
                        anyhow::bail!("group repository {} requires members", repo.name);
                    }
                }
                RepositoryType::Hosted => {}
            }
        }

        self.check_group_graph()
    }

    /// Members must be declared with the same format, and groups must not
    /// contain themselves
    fn check_group_graph(&self) -> Result<()> {
        let by_name: HashMap<&str, &RepositorySection> = self
            .repositories
            .iter()
            .map(|r| (r.name.as_str(), r))
            .collect();

        for repo in self.repositories.iter().filter(|r| r.is_group()) {
            for member in &repo.members {
                let Some(target) = by_name.get(member.as_str()) else {
                    anyhow::bail!("group {} references unknown repository {}", repo.name, member);
                };
                if target.format != repo.format {
                    anyhow::bail!(
                        "group {} ({}) cannot contain {} ({})",
                        repo.name,
                        repo.format,
                        member,
                        target.format
                    );
                }
            }
        }

        for repo in self.repositories.iter().filter(|r| r.is_group()) {
            let mut path = vec![repo.name.as_str()];
            if let Some(cycle) = find_cycle(&by_name, &repo.name, &mut path) {
                anyhow::bail!("group {} contains itself: {}", repo.name, cycle);
            }
        }
        Ok(())
    }

    /// Path of the metadata database
    pub fn database_path(&self) -> PathBuf {
        if self.storage.database.is_absolute() {
            self.storage.database.clone()
        } else {
            self.storage.root.join(&self.storage.database)
        }
    }

    pub fn default_ttl(&self) -> Result<Option<Duration>> {
        parse_ttl(&self.cache.default_ttl)
    }

    pub fn cleanup_interval(&self) -> Result<Duration> {
        parse_duration(&self.negative_cache.cleanup_interval)
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrent: self.executor.max_concurrent,
        }
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        Ok(RetryPolicy {
            max_retries: self.transaction.max_retries,
            delay: parse_duration(&self.transaction.retry_delay)?,
        })
    }

    /// Negative cache settings for one repository
    pub fn negative_cache_config(&self, repo: &RepositorySection) -> Result<NegativeCacheConfig> {
        Ok(NegativeCacheConfig {
            enabled: repo.negative_cache.unwrap_or(self.negative_cache.enabled),
            ttl: parse_duration(&self.negative_cache.ttl)?,
            max_entries: self.negative_cache.max_entries,
            key_attributes: self.negative_cache.key_attributes.clone(),
        })
    }

    /// Open the metadata store with the configured retry policy
    pub fn open_store(&self) -> Result<SqliteStore> {
        let path = self.database_path();
        let store = SqliteStore::open(&path, "metadata")
            .with_context(|| format!("Failed to open store at {}", path.display()))?;
        Ok(store.with_retry_policy(self.retry_policy()?))
    }

    /// Build a populated registry
    ///
    /// Hosted and proxy repositories are added first, then groups once all of
    /// their members are present, so the registry's own membership checks run
    /// against the full graph.
    pub fn build_registry(&self) -> Result<RepositoryManager> {
        let registry = RepositoryManager::new();

        let (groups, leaves): (Vec<_>, Vec<_>) =
            self.repositories.iter().partition(|r| r.is_group());

        for repo in leaves {
            let repository = self.build_repository(repo)?;
            registry
                .add(repository)
                .with_context(|| format!("Failed to add repository {}", repo.name))?;
        }

        let mut pending: Vec<&RepositorySection> = groups;
        while !pending.is_empty() {
            let (ready, waiting): (Vec<_>, Vec<_>) = pending
                .into_iter()
                .partition(|g| g.members.iter().all(|m| registry.get(m).is_some()));

            if ready.is_empty() {
                // Only unresolvable groups are left; let the registry report why
                let repo = waiting[0];
                registry
                    .add(self.build_repository(repo)?)
                    .with_context(|| format!("Failed to add repository {}", repo.name))?;
                anyhow::bail!("group {} could not be resolved", repo.name);
            }

            for repo in ready {
                registry
                    .add(self.build_repository(repo)?)
                    .with_context(|| format!("Failed to add repository {}", repo.name))?;
            }
            pending = waiting;
        }

        info!("Configured {} repositories", registry.len());
        Ok(registry)
    }

    fn build_repository(&self, repo: &RepositorySection) -> Result<Repository> {
        let kind = repo.repository_type()?;
        let ttl = match &repo.ttl {
            Some(ttl) => parse_ttl(ttl)?,
            None => self.default_ttl()?,
        };

        let terminal: Arc<dyn Handler> = match kind {
            RepositoryType::Hosted => match &repo.content_dir {
                Some(dir) => Arc::new(HostedHandler::from_dir(dir).with_context(|| {
                    format!("Failed to load content for repository {}", repo.name)
                })?),
                None => Arc::new(HostedHandler::new()),
            },
            RepositoryType::Proxy => {
                let url = repo.remote_url.as_deref().with_context(|| {
                    format!("proxy repository {} requires remote_url", repo.name)
                })?;
                let upstream = HttpUpstream::new(url)?;
                Arc::new(ProxyHandler::new(Arc::new(upstream)))
            }
            RepositoryType::Group => Arc::new(GroupDispatcher::new()),
        };

        // Hosted content is authoritative; only upstream and group misses are remembered
        let negative = self.negative_cache_config(repo)?;
        let negative = (kind != RepositoryType::Hosted && negative.enabled).then_some(negative);

        let stages: Vec<Arc<dyn Handler>> = match negative {
            Some(_) => vec![Arc::new(NegativeCacheHandler), terminal],
            None => vec![terminal],
        };
        let mut repository = Repository::new(&repo.name, &repo.format, kind)
            .with_facet(Facet::View(Arc::new(ViewFacet::new(stages))))
            .with_facet(Facet::Cache(Arc::new(CacheController::new(ttl))));

        if let Some(negative) = negative {
            repository = repository
                .with_facet(Facet::NegativeCache(Arc::new(NegativeCacheFacet::new(negative))));
        }
        if kind == RepositoryType::Group {
            repository =
                repository.with_facet(Facet::Group(Arc::new(GroupFacet::new(repo.members.clone()))));
        }

        debug!("Built {} repository {}", kind, repo.name);
        Ok(repository)
    }
}

/// Depth-first search for a path from `name` back to the start of `path`
fn find_cycle<'a>(
    by_name: &HashMap<&'a str, &'a RepositorySection>,
    name: &str,
    path: &mut Vec<&'a str>,
) -> Option<String> {
    let repo = by_name.get(name).copied()?;
    for member in &repo.members {
        let member = member.as_str();
        if member == path[0] {
            let mut cycle = path.clone();
            cycle.push(member);
            return Some(cycle.join(" -> "));
        }
        if path.contains(&member) || !by_name.contains_key(member) {
            continue;
        }
        path.push(member);
        if let Some(cycle) = find_cycle(by_name, member, path) {
            return Some(cycle);
        }
        path.pop();
    }
    None
}

/// Parse a time-to-live; "never" or "-1" means no expiry
pub fn parse_ttl(s: &str) -> Result<Option<Duration>> {
    let trimmed = s.trim();
    if trimmed.eq_ignore_ascii_case("never") || trimmed == "-1" {
        return Ok(None);
    }
    parse_duration(trimmed).map(Some)
}

/// Parse duration string (e.g., "30s", "15m", "1h", "2d", "250ms")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    if let Some(num_str) = s.strip_suffix("ms") {
        let num: u64 = num_str
            .trim()
            .parse()
            .with_context(|| format!("Invalid duration number: {}", num_str))?;
        return Ok(Duration::from_millis(num));
    }

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('d') {
        (n, 24 * 60 * 60)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 60 * 60)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1)
    } else {
        // Assume seconds
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid duration number: {}", num_str))?;

    let secs = num
        .checked_mul(multiplier)
        .with_context(|| format!("Duration too large: {}", s))?;
    Ok(Duration::from_secs(secs))
}
