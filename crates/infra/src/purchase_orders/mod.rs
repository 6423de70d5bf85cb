//! Purchase order documents. The receive lock is the RECEIVING status itself.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use stockflow_core::{OrgId, PurchaseOrderId};
use stockflow_purchasing::{PurchaseOrder, PurchaseOrderStatus};

use crate::error::LedgerResult;

pub use in_memory::InMemoryPurchaseOrderStore;
pub use postgres::PostgresPurchaseOrderStore;

#[async_trait]
pub trait PurchaseOrderStore: Send + Sync {
    async fn insert(&self, po: PurchaseOrder) -> LedgerResult<PurchaseOrder>;

    async fn get(&self, org_id: OrgId, po_id: PurchaseOrderId) -> LedgerResult<PurchaseOrder>;

    /// Move to `to` only if the current status is one of `from` (`Conflict` otherwise).
    async fn transition_status(
        &self,
        org_id: OrgId,
        po_id: PurchaseOrderId,
        from: &[PurchaseOrderStatus],
        to: PurchaseOrderStatus,
    ) -> LedgerResult<PurchaseOrder>;
}

#[async_trait]
impl<S> PurchaseOrderStore for Arc<S>
where
    S: PurchaseOrderStore + ?Sized,
{
    async fn insert(&self, po: PurchaseOrder) -> LedgerResult<PurchaseOrder> {
        (**self).insert(po).await
    }

    async fn get(&self, org_id: OrgId, po_id: PurchaseOrderId) -> LedgerResult<PurchaseOrder> {
        (**self).get(org_id, po_id).await
    }

    async fn transition_status(
        &self,
        org_id: OrgId,
        po_id: PurchaseOrderId,
        from: &[PurchaseOrderStatus],
        to: PurchaseOrderStatus,
    ) -> LedgerResult<PurchaseOrder> {
        (**self).transition_status(org_id, po_id, from, to).await
    }
}
