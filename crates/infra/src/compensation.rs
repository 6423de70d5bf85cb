//! Compensation log for multi-document stock sagas.
//!
//! Every forward step that succeeds records its inverse here. On failure the
//! log is replayed newest first; a compensation that itself fails is logged
//! and the rest still run.

use tracing::{debug, error};

use stockflow_core::{LotId, MovementId, OrgId, PurchaseOrderId, TransferId};
use stockflow_inventory::{CostLine, StockKey, TransferChange, TransferStatus};
use stockflow_purchasing::PurchaseOrderStatus;

use crate::error::{LedgerError, LedgerResult};
use crate::lots::{restore_cost_lines, LotStore};
use crate::movements::MovementStore;
use crate::purchase_orders::PurchaseOrderStore;
use crate::stock_ledger::StockLedger;
use crate::stores::LedgerStores;
use crate::transfers::TransferStore;

/// Inverse of one successful forward step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// Undo a reservation.
    ReleaseReservation { key: StockKey, qty: i64 },
    /// Undo a released reservation.
    ReReserve { key: StockKey, qty: i64 },
    /// Undo a reservation commit.
    UncommitStock { key: StockKey, qty: i64 },
    /// Undo an `AdjustStock(delta)` by applying `-delta`.
    ReverseAdjustment { key: StockKey, delta: i64 },
    /// Give back lot quantity consumed into `cost_lines`.
    RestoreLots { org_id: OrgId, cost_lines: Vec<CostLine> },
    /// Remove a lot the saga created.
    RemoveLot { org_id: OrgId, lot_id: LotId },
    /// Put a purchase order back into the status it had before the saga.
    RestorePurchaseOrderStatus {
        org_id: OrgId,
        po_id: PurchaseOrderId,
        from: PurchaseOrderStatus,
        to: PurchaseOrderStatus,
    },
    /// Delete a movement record the saga wrote.
    RemoveMovement { org_id: OrgId, movement_id: MovementId },
    /// Put a transfer back into the status it had before the saga.
    RestoreTransferStatus {
        org_id: OrgId,
        transfer_id: TransferId,
        from: TransferStatus,
        to: TransferStatus,
    },
}

impl Compensation {
    async fn run(&self, stores: &LedgerStores) -> LedgerResult<()> {
        match self {
            Compensation::ReleaseReservation { key, qty } => {
                stores.stock.release(*key, *qty).await.map(drop)
            }
            Compensation::ReReserve { key, qty } => stores.stock.reserve(*key, *qty).await.map(drop),
            Compensation::UncommitStock { key, qty } => {
                stores.stock.uncommit(*key, *qty).await.map(drop)
            }
            Compensation::ReverseAdjustment { key, delta } => {
                stores.stock.adjust(*key, -*delta).await.map(drop)
            }
            Compensation::RestoreLots { org_id, cost_lines } => {
                let failed = restore_cost_lines(stores.lots.as_ref(), *org_id, cost_lines).await;
                if failed == 0 {
                    Ok(())
                } else {
                    Err(LedgerError::backend(format!(
                        "{failed} lot restores failed"
                    )))
                }
            }
            Compensation::RemoveLot { org_id, lot_id } => stores.lots.delete_lot(*org_id, *lot_id).await,
            Compensation::RestorePurchaseOrderStatus {
                org_id,
                po_id,
                from,
                to,
            } => stores
                .purchase_orders
                .transition_status(*org_id, *po_id, &[*from], *to)
                .await
                .map(drop),
            Compensation::RemoveMovement {
                org_id,
                movement_id,
            } => stores.movements.delete(*org_id, *movement_id).await,
            Compensation::RestoreTransferStatus {
                org_id,
                transfer_id,
                from,
                to,
            } => stores
                .transfers
                .transition(*org_id, *transfer_id, &[*from], TransferChange::status(*to))
                .await
                .map(drop),
        }
    }
}

#[derive(Debug, Default)]
pub struct CompensationLog {
    steps: Vec<Compensation>,
}

impl CompensationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, step: Compensation) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every recorded compensation, newest first. Returns how many failed.
    pub async fn compensate(self, stores: &LedgerStores) -> usize {
        let mut failed = 0;
        for step in self.steps.into_iter().rev() {
            match step.run(stores).await {
                Ok(()) => debug!(?step, "compensated"),
                Err(err) => {
                    failed += 1;
                    error!(?step, error = %err, "compensation failed");
                }
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_core::{BranchId, ProductId};

    use crate::config::LedgerConfig;

    #[tokio::test]
    async fn compensations_run_newest_first() {
        let stores = LedgerStores::in_memory(&LedgerConfig::default());
        let key = StockKey::new(OrgId::new(), BranchId::new(), ProductId::new());
        stores.stock.adjust(key, 10).await.unwrap();

        let mut log = CompensationLog::new();
        stores.stock.adjust(key, 5).await.unwrap();
        log.record(Compensation::ReverseAdjustment { key, delta: 5 });
        stores.stock.reserve(key, 12).await.unwrap();
        log.record(Compensation::ReleaseReservation { key, qty: 12 });

        // Reversing the adjustment first would breach reserved <= quantity.
        assert_eq!(log.compensate(&stores).await, 0);

        let level = stores.stock.get(key).await.unwrap().unwrap();
        assert_eq!((level.quantity, level.reserved), (10, 0));
    }

    #[tokio::test]
    async fn failed_compensation_does_not_stop_the_rest() {
        let stores = LedgerStores::in_memory(&LedgerConfig::default());
        let key = StockKey::new(OrgId::new(), BranchId::new(), ProductId::new());
        stores.stock.adjust(key, 4).await.unwrap();

        let mut log = CompensationLog::new();
        log.record(Compensation::ReverseAdjustment { key, delta: 4 });
        log.record(Compensation::ReleaseReservation { key, qty: 3 });

        assert_eq!(log.compensate(&stores).await, 1);
        assert_eq!(stores.stock.get(key).await.unwrap().unwrap().quantity, 0);
    }
}
