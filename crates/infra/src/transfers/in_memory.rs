use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use stockflow_core::{OrgId, TransferId};
use stockflow_inventory::{StockTransfer, TransferChange, TransferStatus};

use super::TransferStore;
use crate::error::{poisoned, LedgerError, LedgerResult};

#[derive(Debug, Default)]
pub struct InMemoryTransferStore {
    inner: RwLock<HashMap<(OrgId, TransferId), StockTransfer>>,
}

impl InMemoryTransferStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn transfer_not_found(transfer_id: TransferId) -> LedgerError {
    LedgerError::not_found(format!("transfer {transfer_id}"))
}

#[async_trait]
impl TransferStore for InMemoryTransferStore {
    async fn insert(&self, transfer: StockTransfer) -> LedgerResult<StockTransfer> {
        let mut map = self.inner.write().map_err(poisoned)?;
        let duplicate = map.values().any(|t| {
            t.org_id == transfer.org_id
                && (t.id == transfer.id || t.reference_no == transfer.reference_no)
        });
        if duplicate {
            return Err(LedgerError::conflict(format!(
                "transfer {} already exists",
                transfer.reference_no
            )));
        }
        map.insert((transfer.org_id, transfer.id), transfer.clone());
        Ok(transfer)
    }

    async fn get(&self, org_id: OrgId, transfer_id: TransferId) -> LedgerResult<StockTransfer> {
        let map = self.inner.read().map_err(poisoned)?;
        map.get(&(org_id, transfer_id))
            .cloned()
            .ok_or_else(|| transfer_not_found(transfer_id))
    }

    async fn list(&self, org_id: OrgId, status: Option<TransferStatus>) -> LedgerResult<Vec<StockTransfer>> {
        let map = self.inner.read().map_err(poisoned)?;
        let mut transfers: Vec<StockTransfer> = map
            .values()
            .filter(|t| t.org_id == org_id && status.is_none_or(|s| s == t.status))
            .cloned()
            .collect();
        transfers.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(transfers)
    }

    async fn transition(
        &self,
        org_id: OrgId,
        transfer_id: TransferId,
        from: &[TransferStatus],
        change: TransferChange,
    ) -> LedgerResult<StockTransfer> {
        let mut map = self.inner.write().map_err(poisoned)?;
        let transfer = map
            .get_mut(&(org_id, transfer_id))
            .ok_or_else(|| transfer_not_found(transfer_id))?;
        if !from.contains(&transfer.status) {
            return Err(LedgerError::conflict(format!(
                "transfer {} is {}, expected one of {from:?}",
                transfer.reference_no, transfer.status
            )));
        }
        transfer.apply(change, Utc::now());
        Ok(transfer.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stockflow_core::{BranchId, ProductId};
    use stockflow_inventory::{format_transfer_reference, NewTransfer, TransferLine};

    fn transfer(org: OrgId, n: u64) -> StockTransfer {
        StockTransfer::create(
            NewTransfer {
                org_id: org,
                from_branch_id: BranchId::new(),
                to_branch_id: BranchId::new(),
                lines: vec![TransferLine::new(ProductId::new(), 2)],
                notes: None,
            },
            format_transfer_reference(n),
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn duplicate_reference_is_conflict() {
        let store = InMemoryTransferStore::new();
        let org = OrgId::new();
        store.insert(transfer(org, 1)).await.unwrap();
        assert!(store.insert(transfer(org, 1)).await.unwrap_err().is_conflict());
        store.insert(transfer(OrgId::new(), 1)).await.unwrap();
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let store = InMemoryTransferStore::new();
        let org = OrgId::new();
        let first = store.insert(transfer(org, 1)).await.unwrap();
        store.insert(transfer(org, 2)).await.unwrap();
        store
            .transition(
                org,
                first.id,
                &[TransferStatus::Draft],
                TransferChange::status(TransferStatus::Cancelled),
            )
            .await
            .unwrap();

        assert_eq!(store.list(org, None).await.unwrap().len(), 2);
        let cancelled = store.list(org, Some(TransferStatus::Cancelled)).await.unwrap();
        assert_eq!(cancelled.iter().map(|t| t.id).collect::<Vec<_>>(), vec![first.id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn status_lock_admits_one_sender() {
        let store = Arc::new(InMemoryTransferStore::new());
        let org = OrgId::new();
        let t = store.insert(transfer(org, 1)).await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .transition(
                            org,
                            t.id,
                            &[TransferStatus::Draft],
                            TransferChange::status(TransferStatus::Sending),
                        )
                        .await
                })
            })
            .collect();
        let mut won = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => won += 1,
                Err(err) => assert!(err.is_conflict()),
            }
        }
        assert_eq!(won, 1);
    }
}
