use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use stockflow_core::{OrgId, PurchaseOrderId};
use stockflow_purchasing::{PurchaseOrder, PurchaseOrderStatus};

use super::PurchaseOrderStore;
use crate::error::{poisoned, LedgerError, LedgerResult};

#[derive(Debug, Default)]
pub struct InMemoryPurchaseOrderStore {
    inner: RwLock<HashMap<(OrgId, PurchaseOrderId), PurchaseOrder>>,
}

impl InMemoryPurchaseOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn po_not_found(po_id: PurchaseOrderId) -> LedgerError {
    LedgerError::not_found(format!("purchase order {po_id}"))
}

#[async_trait]
impl PurchaseOrderStore for InMemoryPurchaseOrderStore {
    async fn insert(&self, po: PurchaseOrder) -> LedgerResult<PurchaseOrder> {
        let mut map = self.inner.write().map_err(poisoned)?;
        let duplicate = map
            .values()
            .any(|p| p.org_id == po.org_id && (p.id == po.id || p.reference_no == po.reference_no));
        if duplicate {
            return Err(LedgerError::conflict(format!(
                "purchase order {} already exists",
                po.reference_no
            )));
        }
        map.insert((po.org_id, po.id), po.clone());
        Ok(po)
    }

    async fn get(&self, org_id: OrgId, po_id: PurchaseOrderId) -> LedgerResult<PurchaseOrder> {
        let map = self.inner.read().map_err(poisoned)?;
        map.get(&(org_id, po_id))
            .cloned()
            .ok_or_else(|| po_not_found(po_id))
    }

    async fn transition_status(
        &self,
        org_id: OrgId,
        po_id: PurchaseOrderId,
        from: &[PurchaseOrderStatus],
        to: PurchaseOrderStatus,
    ) -> LedgerResult<PurchaseOrder> {
        let mut map = self.inner.write().map_err(poisoned)?;
        let po = map.get_mut(&(org_id, po_id)).ok_or_else(|| po_not_found(po_id))?;
        if !from.contains(&po.status) {
            return Err(LedgerError::conflict(format!(
                "purchase order {} is {}, expected one of {from:?}",
                po.reference_no, po.status
            )));
        }
        po.set_status(to, Utc::now());
        Ok(po.clone())
    }
}
