//! Purchase order creation and receiving.

use chrono::Utc;
use tracing::{info, instrument, warn};

use stockflow_core::{OrgId, PurchaseOrderId};
use stockflow_inventory::{LotSource, NewLot, StockKey};
use stockflow_purchasing::{format_reference, NewPurchaseOrder, PurchaseOrder, PurchaseOrderStatus};

use crate::catalog::ProductCatalog;
use crate::compensation::{Compensation, CompensationLog};
use crate::config::LedgerConfig;
use crate::costing::CostingEngine;
use crate::counters::{CounterStore, DocumentKind};
use crate::error::LedgerResult;
use crate::lots::LotStore;
use crate::purchase_orders::PurchaseOrderStore;
use crate::stores::LedgerStores;

#[derive(Debug, Clone)]
pub struct ReceivingService {
    stores: LedgerStores,
    costing: CostingEngine,
}

impl ReceivingService {
    pub fn new(stores: LedgerStores, config: &LedgerConfig) -> Self {
        Self {
            costing: CostingEngine::new(stores.clone(), config),
            stores,
        }
    }

    /// Create an OPEN purchase order numbered from the org's PO counter.
    #[instrument(skip(self, input), fields(org_id = %input.org_id, branch_id = %input.branch_id), err)]
    pub async fn create_purchase_order(&self, input: NewPurchaseOrder) -> LedgerResult<PurchaseOrder> {
        let n = self
            .stores
            .counters
            .next(input.org_id, DocumentKind::PurchaseOrder)
            .await?;
        let po = PurchaseOrder::create(input, format_reference(n), Utc::now())?;
        let po = self.stores.purchase_orders.insert(po).await?;
        info!(po_id = %po.id, reference_no = %po.reference_no, "purchase order created");
        Ok(po)
    }

    /// Receive every line of an OPEN or SENT purchase order.
    ///
    /// The move to RECEIVING is the lock: a concurrent second receive gets
    /// `Conflict`. Per line a `PO` lot is created, stock is increased together
    /// with the moving average and the product's last cost is recorded.
    /// A failure undoes the lots and stock increases and restores the original
    /// status; the average and last-cost updates are not undone.
    #[instrument(skip(self), err)]
    pub async fn receive_purchase_order(
        &self,
        org_id: OrgId,
        po_id: PurchaseOrderId,
    ) -> LedgerResult<PurchaseOrder> {
        let original = self.stores.purchase_orders.get(org_id, po_id).await?;
        let po = self
            .stores
            .purchase_orders
            .transition_status(
                org_id,
                po_id,
                &PurchaseOrderStatus::RECEIVABLE,
                PurchaseOrderStatus::Receiving,
            )
            .await?;

        let mut log = CompensationLog::new();
        log.record(Compensation::RestorePurchaseOrderStatus {
            org_id,
            po_id,
            from: PurchaseOrderStatus::Receiving,
            to: original.status,
        });

        let outcome = match self.receive_lines(&po, &mut log).await {
            Ok(()) => {
                self.stores
                    .purchase_orders
                    .transition_status(
                        org_id,
                        po_id,
                        &[PurchaseOrderStatus::Receiving],
                        PurchaseOrderStatus::Received,
                    )
                    .await
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(po) => {
                info!(reference_no = %po.reference_no, lines = po.lines.len(), "purchase order received");
                Ok(po)
            }
            Err(err) => {
                warn!(error = %err, steps = log.len(), "receive failed; compensating");
                log.compensate(&self.stores).await;
                Err(err)
            }
        }
    }

    async fn receive_lines(&self, po: &PurchaseOrder, log: &mut CompensationLog) -> LedgerResult<()> {
        for line in &po.lines {
            let key = StockKey::new(po.org_id, po.branch_id, line.product_id);

            let lot = self
                .stores
                .lots
                .create_lot(
                    NewLot::new(key, LotSource::Po, line.quantity, line.unit_cost)
                        .purchase_order(po.id, po.reference_no.clone()),
                )
                .await?;
            log.record(Compensation::RemoveLot {
                org_id: po.org_id,
                lot_id: lot.id,
            });

            self.costing
                .receive_stock(key, line.quantity, line.unit_cost)
                .await?;
            log.record(Compensation::ReverseAdjustment {
                key,
                delta: line.quantity,
            });

            self.stores
                .catalog
                .set_cost(po.org_id, line.product_id, line.unit_cost)
                .await?;
        }
        Ok(())
    }
}
