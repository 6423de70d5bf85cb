//! Append-only FIFO lot ledger.

pub mod fifo;
pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use stockflow_core::{LotId, OrgId};
use stockflow_inventory::{InventoryLot, NewLot, StockKey};

use crate::error::LedgerResult;

pub use fifo::{consume_lots_fifo, restore_cost_lines};
pub use in_memory::InMemoryLotStore;
pub use postgres::PostgresLotStore;

#[async_trait]
pub trait LotStore: Send + Sync {
    /// Append a lot with `qty_remaining = qty_received`.
    async fn create_lot(&self, lot: NewLot) -> LedgerResult<InventoryLot>;

    async fn get_lot(&self, org_id: OrgId, lot_id: LotId) -> LedgerResult<Option<InventoryLot>>;

    /// Open lot with the smallest `(received_at, id)`; `NotFound` if none is open.
    async fn find_oldest_open(&self, key: StockKey) -> LedgerResult<InventoryLot>;

    /// Lots of one key in FIFO order.
    async fn list_lots(&self, key: StockKey, open_only: bool) -> LedgerResult<Vec<InventoryLot>>;

    /// Sum of `qty_remaining` over the key's open lots.
    async fn open_quantity(&self, key: StockKey) -> LedgerResult<i64>;

    /// `qty_remaining -= qty` only if `qty_remaining >= qty` (`Conflict` otherwise).
    async fn decrement_remaining(
        &self,
        org_id: OrgId,
        lot_id: LotId,
        qty: i64,
    ) -> LedgerResult<InventoryLot>;

    /// Compensating `qty_remaining += qty`, capped by `qty_received`.
    async fn increment_remaining(
        &self,
        org_id: OrgId,
        lot_id: LotId,
        qty: i64,
    ) -> LedgerResult<InventoryLot>;

    /// Remove a lot created by a saga step that is being compensated.
    async fn delete_lot(&self, org_id: OrgId, lot_id: LotId) -> LedgerResult<()>;
}

#[async_trait]
impl<S> LotStore for Arc<S>
where
    S: LotStore + ?Sized,
{
    async fn create_lot(&self, lot: NewLot) -> LedgerResult<InventoryLot> {
        (**self).create_lot(lot).await
    }

    async fn get_lot(&self, org_id: OrgId, lot_id: LotId) -> LedgerResult<Option<InventoryLot>> {
        (**self).get_lot(org_id, lot_id).await
    }

    async fn find_oldest_open(&self, key: StockKey) -> LedgerResult<InventoryLot> {
        (**self).find_oldest_open(key).await
    }

    async fn list_lots(&self, key: StockKey, open_only: bool) -> LedgerResult<Vec<InventoryLot>> {
        (**self).list_lots(key, open_only).await
    }

    async fn open_quantity(&self, key: StockKey) -> LedgerResult<i64> {
        (**self).open_quantity(key).await
    }

    async fn decrement_remaining(
        &self,
        org_id: OrgId,
        lot_id: LotId,
        qty: i64,
    ) -> LedgerResult<InventoryLot> {
        (**self).decrement_remaining(org_id, lot_id, qty).await
    }

    async fn increment_remaining(
        &self,
        org_id: OrgId,
        lot_id: LotId,
        qty: i64,
    ) -> LedgerResult<InventoryLot> {
        (**self).increment_remaining(org_id, lot_id, qty).await
    }

    async fn delete_lot(&self, org_id: OrgId, lot_id: LotId) -> LedgerResult<()> {
        (**self).delete_lot(org_id, lot_id).await
    }
}
