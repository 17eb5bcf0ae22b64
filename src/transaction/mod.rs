// src/transaction/mod.rs

//! Transactional execution of state-mutating operations
//!
//! Call sites wrap a unit of work with [`TransactionalExecutor::run`] and a
//! [`Transactional`] policy. Per attempt:
//!
//! ```text
//! begin -> operation -> Ok ----------------------------------> commit, return value
//!                    -> Err(e), commit_on(e) ----------------> commit, return e
//!                    -> Err(e) -> rollback -> retry_on(e) && allow_retry -> begin again
//!                                          -> swallow(e) ----> return T::default()
//!                                          -> otherwise -----> return e (+ suppressed)
//! ```
//!
//! Transactions on different resources are independent: an operation may run
//! a nested transaction against another resource without touching its own.
//! A call against a resource that already has an open transaction joins it.

mod scope;

pub use scope::{TransactionScope, TransactionState};

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// A store that supports begin/commit/rollback
pub trait TransactionalResource {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Identity used in logs, to tell resources apart
    fn name(&self) -> &str;

    /// Whether a transaction is currently open
    fn is_active(&self) -> bool;

    fn begin(&mut self) -> Result<(), Self::Error>;

    fn commit(&mut self) -> Result<(), Self::Error>;

    fn rollback(&mut self) -> Result<(), Self::Error>;

    /// Grant another attempt after `error`; `attempts` counts attempts made so far
    ///
    /// Implementations may sleep here to back off.
    fn allow_retry(&mut self, error: &Self::Error, attempts: u32) -> bool;
}

type Matcher<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

/// Error classification for one transactional call
pub struct Transactional<E> {
    commit_on: Vec<Matcher<E>>,
    retry_on: Vec<Matcher<E>>,
    swallow: Vec<Matcher<E>>,
}

impl<E> Transactional<E> {
    /// Policy that rolls back and returns on every error
    pub fn new() -> Self {
        Self {
            commit_on: Vec::new(),
            retry_on: Vec::new(),
            swallow: Vec::new(),
        }
    }

    /// Errors that still commit before being returned
    pub fn commit_on(mut self, matcher: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.commit_on.push(Box::new(matcher));
        self
    }

    /// Errors that restart the transaction, if the resource allows it
    pub fn retry_on(mut self, matcher: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.retry_on.push(Box::new(matcher));
        self
    }

    /// Errors suppressed after rollback
    pub fn swallow(mut self, matcher: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.swallow.push(Box::new(matcher));
        self
    }

    fn commits(&self, error: &E) -> bool {
        self.commit_on.iter().any(|m| m(error))
    }

    fn retries(&self, error: &E) -> bool {
        self.retry_on.iter().any(|m| m(error))
    }

    fn swallows(&self, error: &E) -> bool {
        self.swallow.iter().any(|m| m(error))
    }
}

impl<E> Default for Transactional<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Error returned by a transactional call
///
/// Carries the error that ended the call plus earlier errors from the same
/// call (retried attempts, failed rollbacks).
#[derive(Debug)]
pub struct TransactionFailure<E> {
    error: E,
    suppressed: Vec<E>,
}

impl<E> TransactionFailure<E> {
    pub fn new(error: E) -> Self {
        Self {
            error,
            suppressed: Vec::new(),
        }
    }

    fn with_suppressed(error: E, suppressed: Vec<E>) -> Self {
        Self { error, suppressed }
    }

    pub fn error(&self) -> &E {
        &self.error
    }

    pub fn suppressed(&self) -> &[E] {
        &self.suppressed
    }

    /// Discard suppressed errors
    pub fn into_inner(self) -> E {
        self.error
    }
}

impl<E: fmt::Display> fmt::Display for TransactionFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if !self.suppressed.is_empty() {
            write!(f, " ({} earlier errors suppressed)", self.suppressed.len())?;
        }
        Ok(())
    }
}

impl<E: std::error::Error + 'static> std::error::Error for TransactionFailure<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<TransactionFailure<crate::Error>> for crate::Error {
    fn from(failure: TransactionFailure<crate::Error>) -> Self {
        failure.into_inner()
    }
}

#[derive(Default)]
struct Counters {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    retried: AtomicU64,
    swallowed: AtomicU64,
    joined: AtomicU64,
}

/// Transaction statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransactionStats {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub retried: u64,
    pub swallowed: u64,
    pub joined: u64,
}

/// Runs operations inside transactions
#[derive(Default)]
pub struct TransactionalExecutor {
    counters: Counters,
}

impl TransactionalExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` against `resource` under `policy`
    pub fn run<R, T, F>(
        &self,
        policy: &Transactional<R::Error>,
        resource: &mut R,
        mut operation: F,
    ) -> Result<T, TransactionFailure<R::Error>>
    where
        R: TransactionalResource,
        T: Default,
        F: FnMut(&mut R) -> Result<T, R::Error>,
    {
        if resource.is_active() {
            debug!("Joining active transaction on {}", resource.name());
            self.counters.joined.fetch_add(1, Ordering::Relaxed);
            return operation(resource).map_err(TransactionFailure::new);
        }

        let name = resource.name().to_string();
        let mut suppressed = Vec::new();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let mut scope = TransactionScope::new(&mut *resource);
            if let Err(e) = scope.begin() {
                drop(scope);
                if policy.retries(&e) && resource.allow_retry(&e, attempts) {
                    debug!("Retrying begin on {} after: {}", name, e);
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    suppressed.push(e);
                    continue;
                }
                return Err(TransactionFailure::with_suppressed(e, suppressed));
            }
            self.counters.begun.fetch_add(1, Ordering::Relaxed);

            let (error, from_commit) = match operation(scope.resource()) {
                Ok(value) => match scope.commit() {
                    Ok(()) => {
                        self.counters.committed.fetch_add(1, Ordering::Relaxed);
                        return Ok(value);
                    }
                    Err(e) => (e, true),
                },
                Err(e) => (e, false),
            };

            if !from_commit && policy.commits(&error) {
                return match scope.commit() {
                    Ok(()) => {
                        self.counters.committed.fetch_add(1, Ordering::Relaxed);
                        debug!("Committed {} despite error: {}", name, error);
                        Err(TransactionFailure::with_suppressed(error, suppressed))
                    }
                    Err(commit_error) => {
                        if let Err(e) = scope.rollback() {
                            suppressed.push(e);
                        }
                        self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
                        suppressed.push(error);
                        Err(TransactionFailure::with_suppressed(commit_error, suppressed))
                    }
                };
            }

            if let Err(rollback_error) = scope.rollback() {
                warn!("Rollback of {} failed: {}", name, rollback_error);
                suppressed.push(rollback_error);
            }
            self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
            drop(scope);

            if policy.retries(&error) && resource.allow_retry(&error, attempts) {
                debug!(
                    "Retrying transaction on {} (attempt {}): {}",
                    name,
                    attempts + 1,
                    error
                );
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                suppressed.push(error);
                continue;
            }

            if policy.swallows(&error) {
                debug!("Swallowed error on {}: {}", name, error);
                self.counters.swallowed.fetch_add(1, Ordering::Relaxed);
                return Ok(T::default());
            }

            return Err(TransactionFailure::with_suppressed(error, suppressed));
        }
    }

    pub fn stats(&self) -> TransactionStats {
        let c = &self.counters;
        TransactionStats {
            begun: c.begun.load(Ordering::Relaxed),
            committed: c.committed.load(Ordering::Relaxed),
            rolled_back: c.rolled_back.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            swallowed: c.swallowed.load(Ordering::Relaxed),
            joined: c.joined.load(Ordering::Relaxed),
        }
    }
}
