//! Inter-branch transfer documents. The send and receive locks are the
//! SENDING and RECEIVING statuses themselves.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use stockflow_core::{OrgId, TransferId};
use stockflow_inventory::{StockTransfer, TransferChange, TransferStatus};

use crate::error::LedgerResult;

pub use in_memory::InMemoryTransferStore;
pub use postgres::PostgresTransferStore;

#[async_trait]
pub trait TransferStore: Send + Sync {
    async fn insert(&self, transfer: StockTransfer) -> LedgerResult<StockTransfer>;

    async fn get(&self, org_id: OrgId, transfer_id: TransferId) -> LedgerResult<StockTransfer>;

    /// Newest first, optionally narrowed to one status.
    async fn list(&self, org_id: OrgId, status: Option<TransferStatus>) -> LedgerResult<Vec<StockTransfer>>;

    /// Apply `change` only if the current status is one of `from` (`Conflict` otherwise).
    async fn transition(
        &self,
        org_id: OrgId,
        transfer_id: TransferId,
        from: &[TransferStatus],
        change: TransferChange,
    ) -> LedgerResult<StockTransfer>;
}

#[async_trait]
impl<S> TransferStore for Arc<S>
where
    S: TransferStore + ?Sized,
{
    async fn insert(&self, transfer: StockTransfer) -> LedgerResult<StockTransfer> {
        (**self).insert(transfer).await
    }

    async fn get(&self, org_id: OrgId, transfer_id: TransferId) -> LedgerResult<StockTransfer> {
        (**self).get(org_id, transfer_id).await
    }

    async fn list(&self, org_id: OrgId, status: Option<TransferStatus>) -> LedgerResult<Vec<StockTransfer>> {
        (**self).list(org_id, status).await
    }

    async fn transition(
        &self,
        org_id: OrgId,
        transfer_id: TransferId,
        from: &[TransferStatus],
        change: TransferChange,
    ) -> LedgerResult<StockTransfer> {
        (**self).transition(org_id, transfer_id, from, change).await
    }
}
