// src/error.rs

//! Error types shared by the repository engine

use crate::repository::FacetKind;
use thiserror::Error;

/// Errors raised while configuring repositories or serving requests
#[derive(Error, Debug)]
pub enum Error {
    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Repository already exists: {0}")]
    DuplicateRepository(String),

    #[error("Group '{group}' would contain itself: {path}")]
    CyclicGroup { group: String, path: String },

    #[error("Repository '{member}' has format '{found}' but group '{group}' requires '{expected}'")]
    IncompatibleFormat {
        group: String,
        member: String,
        expected: String,
        found: String,
    },

    #[error("Repository '{0}' is not a group")]
    NotAGroup(String),

    #[error("Repository '{repository}' has no {kind} facet")]
    MissingFacet { repository: String, kind: FacetKind },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Download failed: {0}")]
    DownloadError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Initialization failed: {0}")]
    InitError(String),

    #[error("Background worker failed: {0}")]
    Worker(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error is a transient SQLite lock conflict worth retrying
    pub fn is_busy(&self) -> bool {
        match self {
            Error::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
