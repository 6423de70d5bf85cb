//! Stock movements for customer and supplier returns.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use stockflow_core::{BranchId, OrgId, ProductId};
use stockflow_inventory::{CostLine, InventoryLot, LotSource, NewLot, StockKey};

use crate::compensation::{Compensation, CompensationLog};
use crate::config::{LedgerConfig, RetryPolicy};
use crate::error::{LedgerError, LedgerResult};
use crate::lots::{consume_lots_fifo, LotStore};
use crate::stock_ledger::StockLedger;
use crate::stores::LedgerStores;

/// Goods coming back from a customer, valued at `unit_cost`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerReturnLine {
    pub product_id: ProductId,
    pub quantity: i64,
    pub unit_cost: i64,
}

/// Goods going back to a supplier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierReturnLine {
    pub product_id: ProductId,
    pub quantity: i64,
}

#[derive(Debug, Clone)]
pub struct ReturnsService {
    stores: LedgerStores,
    lot_race_retry: RetryPolicy,
}

impl ReturnsService {
    pub fn new(stores: LedgerStores, config: &LedgerConfig) -> Self {
        Self {
            stores,
            lot_race_retry: config.lot_race_retry.clone(),
        }
    }

    /// One `RETURN` lot and one stock increase per line; all or nothing.
    #[instrument(skip(self, lines), fields(lines = lines.len()), err)]
    pub async fn restock_customer_return(
        &self,
        org_id: OrgId,
        branch_id: BranchId,
        lines: &[CustomerReturnLine],
        reference: &str,
    ) -> LedgerResult<Vec<InventoryLot>> {
        let mut log = CompensationLog::new();
        let mut created = Vec::with_capacity(lines.len());

        for line in lines {
            let key = StockKey::new(org_id, branch_id, line.product_id);
            let step = async {
                let lot = self
                    .stores
                    .lots
                    .create_lot(
                        NewLot::new(key, LotSource::Return, line.quantity, line.unit_cost)
                            .reference(reference),
                    )
                    .await?;
                log.record(Compensation::RemoveLot {
                    org_id,
                    lot_id: lot.id,
                });
                self.stores.stock.adjust(key, line.quantity).await?;
                log.record(Compensation::ReverseAdjustment {
                    key,
                    delta: line.quantity,
                });
                Ok::<_, LedgerError>(lot)
            };

            match step.await {
                Ok(lot) => created.push(lot),
                Err(err) => {
                    warn!(product_id = %line.product_id, error = %err, "customer return failed; compensating");
                    log.compensate(&self.stores).await;
                    return Err(err);
                }
            }
        }

        info!(lots = created.len(), reference, "customer return restocked");
        Ok(created)
    }

    /// Take goods off the shelf and out of the FIFO lots; returns the cost lines
    /// consumed. Removing stock may not dip below what is reserved
    /// (`InsufficientStock`).
    ///
    /// A product with too few lots left keeps its stock decrease and contributes
    /// no cost lines. Any other failure undoes the lines already processed.
    #[instrument(skip(self, lines), fields(lines = lines.len()), err)]
    pub async fn ship_supplier_return(
        &self,
        org_id: OrgId,
        branch_id: BranchId,
        lines: &[SupplierReturnLine],
    ) -> LedgerResult<Vec<CostLine>> {
        let mut log = CompensationLog::new();
        let mut cost_lines = Vec::new();

        for line in lines {
            let key = StockKey::new(org_id, branch_id, line.product_id);
            let step = async {
                self.stores.stock.adjust(key, -line.quantity).await?;
                log.record(Compensation::ReverseAdjustment {
                    key,
                    delta: -line.quantity,
                });

                let consumed = match consume_lots_fifo(
                    self.stores.lots.as_ref(),
                    key,
                    line.quantity,
                    &self.lot_race_retry,
                )
                .await
                {
                    Ok(cogs) => {
                        log.record(Compensation::RestoreLots {
                            org_id,
                            cost_lines: cogs.cost_lines.clone(),
                        });
                        cogs.cost_lines
                    }
                    Err(LedgerError::InsufficientLots { .. }) => {
                        warn!(product_id = %line.product_id, qty = line.quantity, "not enough lots to match supplier return");
                        Vec::new()
                    }
                    Err(err) => return Err(err),
                };
                Ok::<_, LedgerError>(consumed)
            };

            match step.await {
                Ok(lines) => cost_lines.extend(lines),
                Err(err) => {
                    warn!(product_id = %line.product_id, error = %err, "supplier return failed; compensating");
                    log.compensate(&self.stores).await;
                    return Err(err);
                }
            }
        }

        info!(cost_lines = cost_lines.len(), "supplier return shipped");
        Ok(cost_lines)
    }
}
