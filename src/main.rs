// src/main.rs

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use quarry::config::parse_duration;
use quarry::executor::Task;
use quarry::maintenance::{PurgeStaleJob, RebuildIndexJob};
use quarry::{
    ConstrainedExecutor, Method, QuarryConfig, RepositoryManager, RepositoryType, Request,
    TransactionalExecutor,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "quarry")]
#[command(author, version, about = "Group, proxy and hosted artifact repository resolver", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration and print its repositories
    Check {
        /// Path to the TOML configuration
        config: PathBuf,
    },
    /// Resolve a path through a repository
    Resolve {
        config: PathBuf,
        /// Repository to ask
        repository: String,
        /// Artifact path
        path: String,
        /// Send HEAD instead of GET
        #[arg(long)]
        head: bool,
    },
    /// Rebuild a group's path index in the metadata store
    RebuildIndex {
        config: PathBuf,
        /// Group repository
        group: String,
    },
    /// Delete store entries older than a cutoff
    Purge {
        config: PathBuf,
        /// Store namespace (e.g., index:public)
        namespace: String,
        /// Age cutoff (e.g., "30d", "12h")
        #[arg(long, default_value = "30d")]
        older_than: String,
    },
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => cmd_check(&config),
        Commands::Resolve {
            config,
            repository,
            path,
            head,
        } => runtime()?.block_on(cmd_resolve(&config, &repository, &path, head)),
        Commands::RebuildIndex { config, group } => {
            runtime()?.block_on(cmd_rebuild_index(&config, &group))
        }
        Commands::Purge {
            config,
            namespace,
            older_than,
        } => runtime()?.block_on(cmd_purge(&config, &namespace, &older_than)),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

fn cmd_check(path: &Path) -> Result<()> {
    let config = QuarryConfig::load(path)?;
    let registry = config.build_registry()?;

    println!("Configuration OK: {} repositories", registry.len());
    for repository in registry.all() {
        println!(
            "  {} ({}, {})",
            repository.name(),
            repository.kind(),
            repository.format()
        );
        if repository.kind() == RepositoryType::Group {
            let leaves: Vec<String> = registry
                .leaf_members(repository.name())?
                .iter()
                .map(|r| r.name().to_string())
                .collect();
            println!("    members: {}", leaves.join(", "));
        }
    }
    Ok(())
}

async fn cmd_resolve(path: &Path, repository: &str, artifact: &str, head: bool) -> Result<()> {
    let config = QuarryConfig::load(path)?;
    let registry = config.build_registry()?;

    let method = if head { Method::Head } else { Method::Get };
    let request = Request::new(method, artifact);
    info!("{} {} from {}", method, request.path, repository);

    let response = registry.dispatch(repository, &request).await?;
    println!("{}", response.status);
    if let Some(payload) = &response.payload {
        println!("{}", String::from_utf8_lossy(payload));
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&registry.metrics().snapshot())?
    );
    Ok(())
}

struct Maintenance {
    registry: Arc<RepositoryManager>,
    executor: ConstrainedExecutor,
    store: quarry::maintenance::SharedStore,
    transactions: Arc<TransactionalExecutor>,
}

impl Maintenance {
    fn open(path: &Path) -> Result<Self> {
        let config = QuarryConfig::load(path)?;
        let registry = Arc::new(config.build_registry()?);
        let executor = ConstrainedExecutor::current(config.executor_config())?;
        let store = Arc::new(Mutex::new(config.open_store()?));
        Ok(Self {
            registry,
            executor,
            store,
            transactions: Arc::new(TransactionalExecutor::new()),
        })
    }

    /// Schedule under `key` and wait for the executor to drain
    async fn run(&self, key: &str, task: Arc<dyn Task>) -> Result<()> {
        if !self.executor.may_execute(key, task) {
            anyhow::bail!("A task is already running under {}", key);
        }
        self.executor.wait_idle().await;

        let stats = self.executor.statistics();
        if stats.failed > 0 || stats.interrupted > 0 {
            anyhow::bail!("Task under {} did not complete", key);
        }
        Ok(())
    }
}

async fn cmd_rebuild_index(path: &Path, group: &str) -> Result<()> {
    let maintenance = Maintenance::open(path)?;
    let job = Arc::new(RebuildIndexJob::new(
        group,
        Arc::clone(&maintenance.registry),
        Arc::clone(&maintenance.store),
        Arc::clone(&maintenance.transactions),
    ));

    maintenance
        .run(&RebuildIndexJob::key(group), Arc::clone(&job) as Arc<dyn Task>)
        .await?;

    let output = serde_json::json!({
        "index": job.report(),
        "executor": maintenance.executor.statistics(),
        "transactions": maintenance.transactions.stats(),
        "metrics": maintenance.registry.metrics().snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn cmd_purge(path: &Path, namespace: &str, older_than: &str) -> Result<()> {
    let age = parse_duration(older_than).context("Invalid --older-than")?;
    let cutoff = Utc::now() - chrono::Duration::from_std(age).context("--older-than is too large")?;

    let maintenance = Maintenance::open(path)?;
    let job = Arc::new(PurgeStaleJob::new(
        namespace,
        cutoff,
        Arc::clone(&maintenance.store),
        Arc::clone(&maintenance.transactions),
    ));

    maintenance
        .run(&PurgeStaleJob::key(namespace), Arc::clone(&job) as Arc<dyn Task>)
        .await?;

    let output = serde_json::json!({
        "purge": job.report(),
        "executor": maintenance.executor.statistics(),
        "transactions": maintenance.transactions.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
