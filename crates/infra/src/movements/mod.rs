//! Append-only stock movement history.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use stockflow_core::{MovementId, OrgId};
use stockflow_inventory::{MovementFilter, StockMovement};

use crate::error::LedgerResult;

pub use in_memory::InMemoryMovementStore;
pub use postgres::PostgresMovementStore;

#[async_trait]
pub trait MovementStore: Send + Sync {
    async fn record(&self, movement: StockMovement) -> LedgerResult<StockMovement>;

    async fn get(&self, org_id: OrgId, movement_id: MovementId) -> LedgerResult<StockMovement>;

    /// Newest first.
    async fn list(&self, org_id: OrgId, filter: &MovementFilter) -> LedgerResult<Vec<StockMovement>>;

    /// Only used to unwind a movement written by a failed saga.
    async fn delete(&self, org_id: OrgId, movement_id: MovementId) -> LedgerResult<()>;
}

#[async_trait]
impl<S> MovementStore for Arc<S>
where
    S: MovementStore + ?Sized,
{
    async fn record(&self, movement: StockMovement) -> LedgerResult<StockMovement> {
        (**self).record(movement).await
    }

    async fn get(&self, org_id: OrgId, movement_id: MovementId) -> LedgerResult<StockMovement> {
        (**self).get(org_id, movement_id).await
    }

    async fn list(&self, org_id: OrgId, filter: &MovementFilter) -> LedgerResult<Vec<StockMovement>> {
        (**self).list(org_id, filter).await
    }

    async fn delete(&self, org_id: OrgId, movement_id: MovementId) -> LedgerResult<()> {
        (**self).delete(org_id, movement_id).await
    }
}
