//! Domain error model.

use thiserror::Error;

use crate::id::ProductId;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, conflicts, stock predicates). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. non-positive quantity).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// An optimistic predicate did not hold (stale version, lock held, counter too low).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Not enough available stock to reserve, commit or remove.
    #[error("insufficient stock for product {product_id}")]
    InsufficientStock { product_id: ProductId },

    /// FIFO consumption ran out of open lots.
    #[error("insufficient inventory lots for product {product_id}")]
    InsufficientLots { product_id: ProductId },

    /// A moving-average product has no cost basis at branch or product level.
    #[error("no cost data available for product {product_id}")]
    NoCostData { product_id: ProductId },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    pub fn insufficient_stock(product_id: ProductId) -> Self {
        Self::InsufficientStock { product_id }
    }
}

/// Reject zero and negative quantities.
pub fn ensure_positive_qty(qty: i64) -> DomainResult<()> {
    if qty <= 0 {
        return Err(DomainError::validation(format!("qty must be > 0 (got {qty})")));
    }
    Ok(())
}

/// `qty * unit` in minor units; `Validation` on overflow.
pub fn checked_amount(qty: i64, unit: i64) -> DomainResult<i64> {
    qty.checked_mul(unit)
        .ok_or_else(|| DomainError::validation(format!("amount overflows: {qty} x {unit}")))
}

/// Sum of amounts; `Validation` on overflow.
pub fn checked_total<I>(amounts: I) -> DomainResult<i64>
where
    I: IntoIterator<Item = i64>,
{
    amounts.into_iter().try_fold(0i64, |acc, amount| {
        acc.checked_add(amount)
            .ok_or_else(|| DomainError::validation("total amount overflows"))
    })
}
