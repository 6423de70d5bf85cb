//! `stockflow-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{AggregateRoot, ExpectedVersion};
pub use error::{checked_amount, checked_total, ensure_positive_qty, DomainError, DomainResult};
pub use id::{
    BranchId, LotId, MovementId, OrderId, OrgId, ProductId, PurchaseOrderId, TransferId,
};
