//! Authoritative quantity/reserved counters per (org, branch, product).
//!
//! Every mutating call is one atomic conditional read-modify-write: the
//! predicate and the mutation succeed or fail together, and `version` is bumped
//! in the same step. Two racing callers can never jointly push `reserved` above
//! `quantity` or `quantity` below zero; the loser gets a typed error.

pub mod in_memory;
pub mod postgres;
pub mod queries;

use std::sync::Arc;

use async_trait::async_trait;

use stockflow_core::{ExpectedVersion, OrgId};
use stockflow_inventory::{AverageReceipt, StockKey, StockLevel};

use crate::error::LedgerResult;

pub use in_memory::InMemoryStockLedger;
pub use postgres::PostgresStockLedger;
pub use queries::{low_stock, out_of_stock};

#[async_trait]
pub trait StockLedger: Send + Sync {
    async fn get(&self, key: StockKey) -> LedgerResult<Option<StockLevel>>;

    async fn list_by_org(&self, org_id: OrgId) -> LedgerResult<Vec<StockLevel>>;

    /// Add `delta` to `quantity`, creating the level on first use.
    ///
    /// Positive deltas are unconditional. Negative deltas require
    /// `quantity + delta >= reserved` (`InsufficientStock` otherwise).
    async fn adjust(&self, key: StockKey, delta: i64) -> LedgerResult<StockLevel>;

    /// [`StockLedger::adjust`] only if the level is at `expected`
    /// (`Exact(0)` = level does not exist yet); `Conflict` otherwise.
    async fn adjust_at(
        &self,
        key: StockKey,
        delta: i64,
        expected: ExpectedVersion,
    ) -> LedgerResult<StockLevel>;

    /// Add received units, creating the level on first use. With `average`
    /// the branch moving average is recomputed from the quantity it is applied
    /// to, in the same write.
    async fn receive(
        &self,
        key: StockKey,
        qty: i64,
        average: Option<AverageReceipt>,
    ) -> LedgerResult<StockLevel>;

    /// `reserved += qty` if `quantity - reserved >= qty`, else `InsufficientStock`.
    async fn reserve(&self, key: StockKey, qty: i64) -> LedgerResult<StockLevel>;

    /// `reserved -= qty` if `reserved >= qty`, else `Conflict`.
    async fn release(&self, key: StockKey, qty: i64) -> LedgerResult<StockLevel>;

    /// Decrement both counters if `quantity >= qty` and `reserved >= qty`.
    async fn commit(&self, key: StockKey, qty: i64) -> LedgerResult<StockLevel>;

    /// Compensating inverse of `commit`: increment both counters.
    async fn uncommit(&self, key: StockKey, qty: i64) -> LedgerResult<StockLevel>;

    /// Write the branch moving average if the level is at `expected`
    /// (`Exact(0)` = level does not exist yet and is created).
    async fn set_average_cost(
        &self,
        key: StockKey,
        average_cost: i64,
        expected: ExpectedVersion,
    ) -> LedgerResult<StockLevel>;
}

#[async_trait]
impl<S> StockLedger for Arc<S>
where
    S: StockLedger + ?Sized,
{
    async fn get(&self, key: StockKey) -> LedgerResult<Option<StockLevel>> {
        (**self).get(key).await
    }

    async fn list_by_org(&self, org_id: OrgId) -> LedgerResult<Vec<StockLevel>> {
        (**self).list_by_org(org_id).await
    }

    async fn adjust(&self, key: StockKey, delta: i64) -> LedgerResult<StockLevel> {
        (**self).adjust(key, delta).await
    }

    async fn adjust_at(
        &self,
        key: StockKey,
        delta: i64,
        expected: ExpectedVersion,
    ) -> LedgerResult<StockLevel> {
        (**self).adjust_at(key, delta, expected).await
    }

    async fn receive(
        &self,
        key: StockKey,
        qty: i64,
        average: Option<AverageReceipt>,
    ) -> LedgerResult<StockLevel> {
        (**self).receive(key, qty, average).await
    }

    async fn reserve(&self, key: StockKey, qty: i64) -> LedgerResult<StockLevel> {
        (**self).reserve(key, qty).await
    }

    async fn release(&self, key: StockKey, qty: i64) -> LedgerResult<StockLevel> {
        (**self).release(key, qty).await
    }

    async fn commit(&self, key: StockKey, qty: i64) -> LedgerResult<StockLevel> {
        (**self).commit(key, qty).await
    }

    async fn uncommit(&self, key: StockKey, qty: i64) -> LedgerResult<StockLevel> {
        (**self).uncommit(key, qty).await
    }

    async fn set_average_cost(
        &self,
        key: StockKey,
        average_cost: i64,
        expected: ExpectedVersion,
    ) -> LedgerResult<StockLevel> {
        (**self).set_average_cost(key, average_cost, expected).await
    }
}
