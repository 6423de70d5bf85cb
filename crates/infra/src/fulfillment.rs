//! Order fulfillment: reservation on create, commit on delivery, cancellation.
//!
//! ```text
//! DRAFT -> PENDING -> CONFIRMED -> SHIPPED -> DELIVERED (stock committed)
//!   \_________\__________\___________\______-> CANCELLED / RETURNED
//! ```
//!
//! Every multi-line operation is a saga over single-document conditional
//! updates; the inverse of each step that succeeded is replayed on failure.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use stockflow_core::{DomainError, ExpectedVersion, OrderId, OrgId, ProductId};
use stockflow_inventory::{LotSource, NewLot, StockKey};
use stockflow_sales::{LineSettlement, NewOrder, Order, OrderStatus, StockCommit};

use crate::compensation::{Compensation, CompensationLog};
use crate::config::LedgerConfig;
use crate::costing::CostingEngine;
use crate::error::{LedgerError, LedgerResult};
use crate::lots::LotStore;
use crate::orders::{CommitLock, OrderStore};
use crate::reservation::ReservationCoordinator;
use crate::stores::LedgerStores;

/// How an order is cancelled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
    /// For a committed order: put the goods back on the shelf as new `RETURN` lots.
    #[serde(default)]
    pub restock: bool,
}

#[derive(Debug, Clone)]
pub struct FulfillmentService {
    stores: LedgerStores,
    reservations: ReservationCoordinator,
    costing: CostingEngine,
}

impl FulfillmentService {
    pub fn new(stores: LedgerStores, config: &LedgerConfig) -> Self {
        Self {
            reservations: ReservationCoordinator::new(stores.stock.clone()),
            costing: CostingEngine::new(stores.clone(), config),
            stores,
        }
    }

    pub fn costing(&self) -> &CostingEngine {
        &self.costing
    }

    pub fn reservations(&self) -> &ReservationCoordinator {
        &self.reservations
    }

    /// Create an order. Non-draft orders reserve every line first; any
    /// shortage releases what was reserved and surfaces `InsufficientStock`.
    #[instrument(skip(self, input), fields(org_id = %input.org_id, branch_id = %input.branch_id), err)]
    pub async fn create_order(&self, input: NewOrder) -> LedgerResult<Order> {
        let order = Order::create(input, Utc::now())?;
        let lines = line_quantities(&order);

        if order.status != OrderStatus::Draft {
            self.reservations
                .reserve_lines(order.org_id, order.branch_id, &lines)
                .await?;
        }

        match self.stores.orders.insert(order.clone()).await {
            Ok(order) => {
                info!(order_id = %order.id, status = %order.status, "order created");
                Ok(order)
            }
            Err(err) => {
                if order.status != OrderStatus::Draft {
                    self.release_quietly(&order, &lines).await;
                }
                Err(err)
            }
        }
    }

    /// DRAFT -> PENDING, reserving the lines under the same rules as create.
    #[instrument(skip(self), err)]
    pub async fn submit_draft(&self, org_id: OrgId, order_id: OrderId) -> LedgerResult<Order> {
        let order = self.stores.orders.get(org_id, order_id).await?;
        if order.status != OrderStatus::Draft {
            return Err(DomainError::validation(format!(
                "order {order_id} is {}, not DRAFT",
                order.status
            ))
            .into());
        }

        let lines = line_quantities(&order);
        self.reservations
            .reserve_lines(org_id, order.branch_id, &lines)
            .await?;

        match self
            .stores
            .orders
            .update_status(
                org_id,
                order_id,
                ExpectedVersion::Exact(order.version),
                OrderStatus::Pending,
                None,
            )
            .await
        {
            Ok(order) => Ok(order),
            Err(err) => {
                self.release_quietly(&order, &lines).await;
                Err(err)
            }
        }
    }

    /// Status change with no stock effect: PENDING -> CONFIRMED, or -> SHIPPED.
    #[instrument(skip(self), err)]
    pub async fn advance(&self, org_id: OrgId, order_id: OrderId, to: OrderStatus) -> LedgerResult<Order> {
        let order = self.stores.orders.get(org_id, order_id).await?;
        order.ensure_can_advance(to)?;
        self.stores
            .orders
            .update_status(org_id, order_id, ExpectedVersion::Exact(order.version), to, None)
            .await
    }

    /// Convert the order's reservations into stock decrements and price them.
    ///
    /// Safe to retry: an order that is already committed comes back unchanged
    /// without touching stock. On failure every committed line and consumed lot
    /// is given back and the commit lock is released, leaving the order
    /// uncommitted and retryable.
    #[instrument(skip(self), err)]
    pub async fn commit_delivery(&self, org_id: OrgId, order_id: OrderId) -> LedgerResult<Order> {
        let order = match self.stores.orders.lock_for_stock_commit(org_id, order_id).await? {
            CommitLock::AlreadyCommitted(order) => {
                info!("order already committed; nothing to do");
                return Ok(order);
            }
            CommitLock::Acquired(order) => order,
        };

        let mut log = CompensationLog::new();
        let outcome = match self.commit_lines(&order, &mut log).await {
            Ok(commit) => {
                self.stores
                    .orders
                    .complete_stock_commit(org_id, order_id, commit)
                    .await
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(committed) => {
                info!(cogs = committed.cogs, profit = committed.profit, "stock committed");
                self.record_sales(&committed).await;
                Ok(committed)
            }
            Err(err) => {
                warn!(error = %err, steps = log.len(), "stock commit failed; compensating");
                log.compensate(&self.stores).await;
                if let Err(unlock) = self.stores.orders.unlock_stock_commit(org_id, order_id).await {
                    error!(error = %unlock, "failed to release stock commit lock");
                }
                Err(err)
            }
        }
    }

    async fn commit_lines(&self, order: &Order, log: &mut CompensationLog) -> LedgerResult<StockCommit> {
        for line in &order.lines {
            let key = StockKey::new(order.org_id, order.branch_id, line.product_id);
            self.reservations.commit(key, line.quantity).await?;
            log.record(Compensation::UncommitStock {
                key,
                qty: line.quantity,
            });
        }

        let mut settled = Vec::with_capacity(order.lines.len());
        let mut cost_lines = Vec::new();
        let mut total_cogs = 0;
        for line in &order.lines {
            let key = StockKey::new(order.org_id, order.branch_id, line.product_id);
            let priced = self.costing.compute_cogs_with_fallback(key, line.quantity).await?;
            // Restore before removing: compensation runs newest first.
            if let Some(lot) = &priced.adjustment_lot {
                log.record(Compensation::RemoveLot {
                    org_id: order.org_id,
                    lot_id: lot.id,
                });
            }
            log.record(Compensation::RestoreLots {
                org_id: order.org_id,
                cost_lines: priced.cogs.cost_lines.clone(),
            });

            settled.push(LineSettlement {
                unit_cost: priced.cogs.unit_cost,
                line_cost: priced.cogs.total_cogs,
            });
            total_cogs += priced.cogs.total_cogs;
            cost_lines.extend(priced.cogs.cost_lines);
        }

        Ok(StockCommit {
            lines: settled,
            cost_lines,
            total_cogs,
        })
    }

    async fn record_sales(&self, order: &Order) {
        for line in &order.lines {
            if let Err(err) = self
                .costing
                .update_moving_average_on_sale(order.org_id, line.product_id, line.quantity)
                .await
            {
                warn!(product_id = %line.product_id, error = %err, "failed to update running quantity");
            }
        }
    }

    /// Cancel or return an order.
    ///
    /// Uncommitted orders release their reservations; committed orders, when
    /// `restock` is set, get one `RETURN` lot per line at the line's unit COGS
    /// plus the matching stock increase. The status is written last and
    /// conditionally; losing that race undoes the stock effects.
    #[instrument(skip(self, request), fields(restock = request.restock), err)]
    pub async fn cancel(&self, org_id: OrgId, order_id: OrderId, request: CancelRequest) -> LedgerResult<Order> {
        let order = self.stores.orders.get(org_id, order_id).await?;
        if order.status.is_terminal() {
            return Ok(order);
        }
        if order.stock_commit_in_progress {
            return Err(LedgerError::conflict(format!(
                "order {order_id} is being committed"
            )));
        }

        let target = order.cancel_target();
        let mut log = CompensationLog::new();
        let outcome = match self.cancel_stock(&order, request.restock, &mut log).await {
            Ok(()) => {
                self.stores
                    .orders
                    .update_status(
                        org_id,
                        order_id,
                        ExpectedVersion::Exact(order.version),
                        target,
                        request.reason,
                    )
                    .await
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(order) => {
                info!(status = %order.status, "order cancelled");
                Ok(order)
            }
            Err(err) => {
                warn!(error = %err, steps = log.len(), "cancel failed; compensating");
                log.compensate(&self.stores).await;
                Err(err)
            }
        }
    }

    async fn cancel_stock(&self, order: &Order, restock: bool, log: &mut CompensationLog) -> LedgerResult<()> {
        if order.holds_reservations() {
            for line in &order.lines {
                let key = StockKey::new(order.org_id, order.branch_id, line.product_id);
                self.reservations.release(key, line.quantity).await?;
                log.record(Compensation::ReReserve {
                    key,
                    qty: line.quantity,
                });
            }
        } else if order.stock_committed && restock {
            for line in &order.lines {
                let key = StockKey::new(order.org_id, order.branch_id, line.product_id);
                let lot = self
                    .stores
                    .lots
                    .create_lot(
                        NewLot::new(key, LotSource::Return, line.quantity, line.restock_unit_cost())
                            .reference(format!("ORDER-{}", order.id)),
                    )
                    .await?;
                log.record(Compensation::RemoveLot {
                    org_id: order.org_id,
                    lot_id: lot.id,
                });
                self.reservations.adjust(key, line.quantity).await?;
                log.record(Compensation::ReverseAdjustment {
                    key,
                    delta: line.quantity,
                });
            }
        }
        Ok(())
    }

    async fn release_quietly(&self, order: &Order, lines: &[(ProductId, i64)]) {
        if let Err(err) = self
            .reservations
            .release_lines(order.org_id, order.branch_id, lines)
            .await
        {
            error!(order_id = %order.id, error = %err, "failed to release reservations");
        }
    }
}

fn line_quantities(order: &Order) -> Vec<(ProductId, i64)> {
    order
        .lines
        .iter()
        .map(|line| (line.product_id, line.quantity))
        .collect()
}
