//! Sales order documents and the commit lock that guards their stock effects.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use stockflow_core::{ExpectedVersion, OrderId, OrgId};
use stockflow_sales::{Order, OrderStatus, StockCommit};

use crate::error::LedgerResult;

pub use in_memory::InMemoryOrderStore;
pub use postgres::PostgresOrderStore;

/// Outcome of trying to take an order's commit lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitLock {
    /// The lock is ours; the order is returned as locked.
    Acquired(Order),
    /// A previous commit already finished; nothing was changed.
    AlreadyCommitted(Order),
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert(&self, order: Order) -> LedgerResult<Order>;

    async fn get(&self, org_id: OrgId, order_id: OrderId) -> LedgerResult<Order>;

    /// Set `stock_commit_in_progress` only if it was false and the order is not
    /// committed. A lock held by someone else is `Conflict`; a status that never
    /// reserved stock is `Validation`.
    async fn lock_for_stock_commit(&self, org_id: OrgId, order_id: OrderId) -> LedgerResult<CommitLock>;

    /// Clear the lock, leaving `stock_committed` false.
    async fn unlock_stock_commit(&self, org_id: OrgId, order_id: OrderId) -> LedgerResult<Order>;

    /// Persist the settlement and flip `stock_committed`, clearing the lock in the
    /// same write. `Conflict` unless the lock is held.
    async fn complete_stock_commit(
        &self,
        org_id: OrgId,
        order_id: OrderId,
        commit: StockCommit,
    ) -> LedgerResult<Order>;

    /// Conditional status write: the order must be at `expected` and not locked.
    async fn update_status(
        &self,
        org_id: OrgId,
        order_id: OrderId,
        expected: ExpectedVersion,
        status: OrderStatus,
        reason: Option<String>,
    ) -> LedgerResult<Order>;
}

#[async_trait]
impl<S> OrderStore for Arc<S>
where
    S: OrderStore + ?Sized,
{
    async fn insert(&self, order: Order) -> LedgerResult<Order> {
        (**self).insert(order).await
    }

    async fn get(&self, org_id: OrgId, order_id: OrderId) -> LedgerResult<Order> {
        (**self).get(org_id, order_id).await
    }

    async fn lock_for_stock_commit(&self, org_id: OrgId, order_id: OrderId) -> LedgerResult<CommitLock> {
        (**self).lock_for_stock_commit(org_id, order_id).await
    }

    async fn unlock_stock_commit(&self, org_id: OrgId, order_id: OrderId) -> LedgerResult<Order> {
        (**self).unlock_stock_commit(org_id, order_id).await
    }

    async fn complete_stock_commit(
        &self,
        org_id: OrgId,
        order_id: OrderId,
        commit: StockCommit,
    ) -> LedgerResult<Order> {
        (**self).complete_stock_commit(org_id, order_id, commit).await
    }

    async fn update_status(
        &self,
        org_id: OrgId,
        order_id: OrderId,
        expected: ExpectedVersion,
        status: OrderStatus,
        reason: Option<String>,
    ) -> LedgerResult<Order> {
        (**self)
            .update_status(org_id, order_id, expected, status, reason)
            .await
    }
}
