// src/transaction/scope.rs

//! Begin/commit/rollback state machine for one unit of work
//!
//! ```text
//! IDLE -> ACTIVE -> COMMITTED
//!            \
//!             +--> ROLLED_BACK
//! ```
//!
//! A scope dropped while still `ACTIVE` rolls its resource back, so a panic
//! inside an operation never leaves a transaction open.

use super::TransactionalResource;
use tracing::warn;

/// Transaction lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Active,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Active => "ACTIVE",
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLED_BACK",
        }
    }

    /// Whether the scope has finished
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Guard binding one transaction to a resource
pub struct TransactionScope<'r, R: TransactionalResource> {
    resource: &'r mut R,
    state: TransactionState,
}

impl<'r, R: TransactionalResource> TransactionScope<'r, R> {
    pub fn new(resource: &'r mut R) -> Self {
        Self {
            resource,
            state: TransactionState::Idle,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// The resource the operation runs against
    pub fn resource(&mut self) -> &mut R {
        self.resource
    }

    pub fn begin(&mut self) -> Result<(), R::Error> {
        debug_assert_eq!(self.state, TransactionState::Idle);
        self.resource.begin()?;
        self.state = TransactionState::Active;
        Ok(())
    }

    /// Commit; on failure the scope stays active so it can still be rolled back
    pub fn commit(&mut self) -> Result<(), R::Error> {
        debug_assert_eq!(self.state, TransactionState::Active);
        self.resource.commit()?;
        self.state = TransactionState::Committed;
        Ok(())
    }

    /// Roll back; the scope is finished even if the resource reports an error
    pub fn rollback(&mut self) -> Result<(), R::Error> {
        debug_assert_eq!(self.state, TransactionState::Active);
        self.state = TransactionState::RolledBack;
        self.resource.rollback()
    }
}

impl<R: TransactionalResource> Drop for TransactionScope<'_, R> {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            warn!(
                "Transaction on {} dropped while active, rolling back",
                self.resource.name()
            );
            self.state = TransactionState::RolledBack;
            if let Err(e) = self.resource.rollback() {
                warn!("Rollback of {} failed: {}", self.resource.name(), e);
            }
        }
    }
}
