//! Error type returned by every store and service call.

use thiserror::Error;

use stockflow_core::{DomainError, ProductId};

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Ledger operation error.
///
/// Carries the typed domain failures unchanged so callers can match on
/// `InsufficientStock` / `Conflict` / `InsufficientLots` / `NoCostData`, plus
/// `Backend` for storage failures that have no domain meaning.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("insufficient stock for product {product_id}")]
    InsufficientStock { product_id: ProductId },

    #[error("insufficient inventory lots for product {product_id}")]
    InsufficientLots { product_id: ProductId },

    #[error("no cost data available for product {product_id}")]
    NoCostData { product_id: ProductId },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl LedgerError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LedgerError::NotFound(_))
    }
}

impl From<DomainError> for LedgerError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => LedgerError::Validation(msg),
            DomainError::InvariantViolation(msg) => LedgerError::InvariantViolation(msg),
            DomainError::InvalidId(msg) => LedgerError::InvalidId(msg),
            DomainError::NotFound => LedgerError::NotFound("resource".to_string()),
            DomainError::Conflict(msg) => LedgerError::Conflict(msg),
            DomainError::InsufficientStock { product_id } => {
                LedgerError::InsufficientStock { product_id }
            }
            DomainError::InsufficientLots { product_id } => {
                LedgerError::InsufficientLots { product_id }
            }
            DomainError::NoCostData { product_id } => LedgerError::NoCostData { product_id },
        }
    }
}

/// In-memory stores map a poisoned lock to a backend failure.
pub(crate) fn poisoned<T>(_: T) -> LedgerError {
    LedgerError::backend("in-memory store lock poisoned")
}

/// Map SQLx errors to `LedgerError`.
///
/// | SQLx error | code | LedgerError |
/// |---|---|---|
/// | unique violation | `23505` | `Conflict` |
/// | check violation | `23514` | `InvariantViolation` |
/// | other database error | any | `Backend` |
/// | `RowNotFound` | n/a | `NotFound` |
/// | pool closed, IO, decode | n/a | `Backend` |
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => LedgerError::Conflict(msg),
                Some("23514") => LedgerError::InvariantViolation(msg),
                _ => LedgerError::Backend(msg),
            }
        }
        sqlx::Error::RowNotFound => LedgerError::NotFound(format!("row not found in {operation}")),
        sqlx::Error::PoolClosed => {
            LedgerError::Backend(format!("connection pool closed in {operation}"))
        }
        other => LedgerError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}
