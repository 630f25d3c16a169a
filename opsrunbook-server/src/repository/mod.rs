//! Durable storage for the runner.
//!
//! `SqliteRepository` implements every store trait the core defines, so a
//! single database file holds packets, plans, the idempotency ledger, the
//! webhook delivery log and per-PR review state.

mod sqlite;

pub use sqlite::SqliteRepository;

use opsrunbook_core::{LedgerError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage error during {operation}: {detail}")]
    Storage { operation: String, detail: String },
    #[error("corrupted {what} in database")]
    Corruption { what: String },
}

impl RepositoryError {
    pub fn storage(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption { what: what.into() }
    }
}

impl From<RepositoryError> for StoreError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::Corruption { what } => StoreError::Corrupted(what),
            other => StoreError::Storage(other.to_string()),
        }
    }
}

impl From<RepositoryError> for LedgerError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::Corruption { what } => LedgerError::Corrupted(what),
            other => LedgerError::Storage(other.to_string()),
        }
    }
}
