//! Inter-branch transfer sagas: create, send, receive and cancel.

use chrono::Utc;
use tracing::{info, instrument, warn};

use stockflow_core::{DomainError, OrgId, TransferId};
use stockflow_inventory::{
    format_transfer_reference, validate_transfer_lines, LotSource, MovementKind, MovementReference,
    NewLot, NewTransfer, ReceivedQuantity, StockKey, StockMovement, StockTransfer, TransferChange,
    TransferLine, TransferStatus,
};

use crate::compensation::{Compensation, CompensationLog};
use crate::config::LedgerConfig;
use crate::costing::CostingEngine;
use crate::counters::{CounterStore, DocumentKind};
use crate::error::{LedgerError, LedgerResult};
use crate::lots::LotStore;
use crate::movements::MovementStore;
use crate::stock_ledger::StockLedger;
use crate::stores::LedgerStores;
use crate::transfers::TransferStore;

#[derive(Debug, Clone)]
pub struct TransferService {
    stores: LedgerStores,
    costing: CostingEngine,
}

impl TransferService {
    pub fn new(stores: LedgerStores, config: &LedgerConfig) -> Self {
        Self {
            costing: CostingEngine::new(stores.clone(), config),
            stores,
        }
    }

    /// Create a DRAFT transfer numbered from the org's transfer counter.
    #[instrument(skip(self, input), fields(org_id = %input.org_id, from = %input.from_branch_id, to = %input.to_branch_id), err)]
    pub async fn create_transfer(&self, input: NewTransfer) -> LedgerResult<StockTransfer> {
        let n = self.stores.counters.next(input.org_id, DocumentKind::Transfer).await?;
        let transfer = StockTransfer::create(input, format_transfer_reference(n), Utc::now())?;
        let transfer = self.stores.transfers.insert(transfer).await?;
        info!(transfer_id = %transfer.id, reference_no = %transfer.reference_no, "transfer created");
        Ok(transfer)
    }

    /// Replace the lines and notes of a DRAFT transfer.
    pub async fn update_draft(
        &self,
        org_id: OrgId,
        transfer_id: TransferId,
        lines: Vec<TransferLine>,
        notes: Option<String>,
    ) -> LedgerResult<StockTransfer> {
        validate_transfer_lines(&lines)?;
        let lines = lines
            .into_iter()
            .map(|l| TransferLine::new(l.product_id, l.quantity))
            .collect();
        self.stores
            .transfers
            .transition(
                org_id,
                transfer_id,
                &[TransferStatus::Draft],
                TransferChange::default().lines(lines).notes(notes),
            )
            .await
    }

    pub async fn get_transfer(&self, org_id: OrgId, transfer_id: TransferId) -> LedgerResult<StockTransfer> {
        self.stores.transfers.get(org_id, transfer_id).await
    }

    pub async fn list_transfers(
        &self,
        org_id: OrgId,
        status: Option<TransferStatus>,
    ) -> LedgerResult<Vec<StockTransfer>> {
        self.stores.transfers.list(org_id, status).await
    }

    /// Take every line off the source branch and put the transfer IN_TRANSIT.
    ///
    /// SENDING is the lock. Per line the source stock drops, the cost layers
    /// leaving the source are captured (FIFO lots are consumed) and a
    /// `TRANSFER_OUT` movement is written. A line whose cost cannot be
    /// determined travels without cost layers. Any failure puts everything
    /// back and returns the transfer to DRAFT.
    #[instrument(skip(self), err)]
    pub async fn send_transfer(&self, org_id: OrgId, transfer_id: TransferId) -> LedgerResult<StockTransfer> {
        let transfer = self
            .stores
            .transfers
            .transition(
                org_id,
                transfer_id,
                &[TransferStatus::Draft],
                TransferChange::status(TransferStatus::Sending),
            )
            .await?;

        let mut log = CompensationLog::new();
        log.record(Compensation::RestoreTransferStatus {
            org_id,
            transfer_id,
            from: TransferStatus::Sending,
            to: TransferStatus::Draft,
        });

        let outcome = match self.send_lines(&transfer, &mut log).await {
            Ok(lines) => {
                self.stores
                    .transfers
                    .transition(
                        org_id,
                        transfer_id,
                        &[TransferStatus::Sending],
                        TransferChange::status(TransferStatus::InTransit).lines(lines),
                    )
                    .await
            }
            Err(err) => Err(err),
        };
        self.finish(outcome, log, "sent").await
    }

    async fn send_lines(
        &self,
        transfer: &StockTransfer,
        log: &mut CompensationLog,
    ) -> LedgerResult<Vec<TransferLine>> {
        let mut lines = Vec::with_capacity(transfer.lines.len());
        for line in &transfer.lines {
            let key = transfer.source_key(line.product_id);

            let level = self.stores.stock.adjust(key, -line.quantity).await?;
            log.record(Compensation::ReverseAdjustment {
                key,
                delta: -line.quantity,
            });

            let cost_lines = match self.costing.compute_cogs(key, line.quantity).await {
                Ok(cogs) => {
                    log.record(Compensation::RestoreLots {
                        org_id: transfer.org_id,
                        cost_lines: cogs.cost_lines.clone(),
                    });
                    cogs.cost_lines
                }
                Err(err @ (LedgerError::InsufficientLots { .. } | LedgerError::NoCostData { .. })) => {
                    warn!(product_id = %line.product_id, error = %err, "sending without cost layers");
                    Vec::new()
                }
                Err(err) => return Err(err),
            };
            let sent = TransferLine {
                cost_lines,
                ..line.clone()
            };

            let movement = transfer_movement(
                transfer,
                key,
                MovementKind::TransferOut,
                (level.quantity + line.quantity, level.quantity),
                sent.unit_cost_of(line.quantity),
            )?;
            self.record_movement(transfer, movement, log).await?;
            lines.push(sent);
        }
        Ok(lines)
    }

    /// Book an IN_TRANSIT transfer in at the destination branch.
    ///
    /// `received` overrides the counted quantity per product; unlisted lines
    /// are received in full. Per line with a positive count, `TRANSFER` lots
    /// carry the cost layers over, destination stock rises (folding the cost
    /// into a moving average) and a `TRANSFER_IN` movement is written.
    /// RECEIVING is the lock; a failure puts the transfer back IN_TRANSIT.
    #[instrument(skip(self, received), err)]
    pub async fn receive_transfer(
        &self,
        org_id: OrgId,
        transfer_id: TransferId,
        received: &[ReceivedQuantity],
    ) -> LedgerResult<StockTransfer> {
        let current = self.stores.transfers.get(org_id, transfer_id).await?;
        let lines = current.with_received(received)?;

        let transfer = self
            .stores
            .transfers
            .transition(
                org_id,
                transfer_id,
                &[TransferStatus::InTransit],
                TransferChange::status(TransferStatus::Receiving),
            )
            .await?;

        let mut log = CompensationLog::new();
        log.record(Compensation::RestoreTransferStatus {
            org_id,
            transfer_id,
            from: TransferStatus::Receiving,
            to: TransferStatus::InTransit,
        });

        let mut outcome = Ok(());
        for line in &lines {
            let qty = line.received();
            if qty == 0 {
                continue;
            }
            let key = transfer.destination_key(line.product_id);
            outcome = self.book_in(&transfer, key, line, qty, &mut log).await;
            if outcome.is_err() {
                break;
            }
        }

        let outcome = match outcome {
            Ok(()) => {
                self.stores
                    .transfers
                    .transition(
                        org_id,
                        transfer_id,
                        &[TransferStatus::Receiving],
                        TransferChange::status(TransferStatus::Received).lines(lines),
                    )
                    .await
            }
            Err(err) => Err(err),
        };
        self.finish(outcome, log, "received").await
    }

    /// Cancel a transfer.
    ///
    /// DRAFT is simply cancelled. IN_TRANSIT puts every line back on the
    /// source branch as `TRANSFER` lots at the cost it left with. Cancelling
    /// twice returns the cancelled transfer; a RECEIVED transfer cannot be
    /// cancelled.
    #[instrument(skip(self), err)]
    pub async fn cancel_transfer(
        &self,
        org_id: OrgId,
        transfer_id: TransferId,
        reason: Option<String>,
    ) -> LedgerResult<StockTransfer> {
        let current = self.stores.transfers.get(org_id, transfer_id).await?;
        match current.status {
            TransferStatus::Cancelled => return Ok(current),
            TransferStatus::Received => {
                return Err(DomainError::validation(format!(
                    "transfer {} was already received",
                    current.reference_no
                ))
                .into())
            }
            TransferStatus::Draft => {
                return self
                    .stores
                    .transfers
                    .transition(
                        org_id,
                        transfer_id,
                        &[TransferStatus::Draft],
                        TransferChange::status(TransferStatus::Cancelled).reason(reason),
                    )
                    .await;
            }
            status if status.is_locked() => {
                return Err(LedgerError::conflict(format!(
                    "transfer {} is {status}",
                    current.reference_no
                )))
            }
            _ => {}
        }

        let transfer = self
            .stores
            .transfers
            .transition(
                org_id,
                transfer_id,
                &[TransferStatus::InTransit],
                TransferChange::status(TransferStatus::Cancelled).reason(reason),
            )
            .await?;

        let mut log = CompensationLog::new();
        log.record(Compensation::RestoreTransferStatus {
            org_id,
            transfer_id,
            from: TransferStatus::Cancelled,
            to: TransferStatus::InTransit,
        });

        let mut outcome = Ok(());
        for line in &transfer.lines {
            let key = transfer.source_key(line.product_id);
            outcome = self.book_in(&transfer, key, line, line.quantity, &mut log).await;
            if outcome.is_err() {
                break;
            }
        }
        self.finish(outcome.map(|()| transfer), log, "cancelled").await
    }

    /// Put `qty` units of `line` on the shelf at `key` with their cost layers.
    async fn book_in(
        &self,
        transfer: &StockTransfer,
        key: StockKey,
        line: &TransferLine,
        qty: i64,
        log: &mut CompensationLog,
    ) -> LedgerResult<()> {
        for (layer_qty, unit_cost) in line.cost_layers(qty) {
            let lot = self
                .stores
                .lots
                .create_lot(
                    NewLot::new(key, LotSource::Transfer, layer_qty, unit_cost)
                        .reference(transfer.reference_no.clone()),
                )
                .await?;
            log.record(Compensation::RemoveLot {
                org_id: transfer.org_id,
                lot_id: lot.id,
            });
        }

        let unit_cost = line.unit_cost_of(qty);
        let level = self.costing.receive_transferred(key, qty, unit_cost).await?;
        log.record(Compensation::ReverseAdjustment { key, delta: qty });

        let movement = transfer_movement(
            transfer,
            key,
            MovementKind::TransferIn,
            (level.quantity - qty, level.quantity),
            unit_cost,
        )?;
        self.record_movement(transfer, movement, log).await
    }

    async fn record_movement(
        &self,
        transfer: &StockTransfer,
        movement: StockMovement,
        log: &mut CompensationLog,
    ) -> LedgerResult<()> {
        let movement = self.stores.movements.record(movement).await?;
        log.record(Compensation::RemoveMovement {
            org_id: transfer.org_id,
            movement_id: movement.id,
        });
        Ok(())
    }

    async fn finish(
        &self,
        outcome: LedgerResult<StockTransfer>,
        log: CompensationLog,
        action: &str,
    ) -> LedgerResult<StockTransfer> {
        match outcome {
            Ok(transfer) => {
                info!(reference_no = %transfer.reference_no, lines = transfer.lines.len(), "transfer {action}");
                Ok(transfer)
            }
            Err(err) => {
                warn!(error = %err, steps = log.len(), "transfer not {action}; compensating");
                log.compensate(&self.stores).await;
                Err(err)
            }
        }
    }
}

/// Movement of `kind` taking `key` from `quantities.0` to `quantities.1`.
fn transfer_movement(
    transfer: &StockTransfer,
    key: StockKey,
    kind: MovementKind,
    (previous_quantity, new_quantity): (i64, i64),
    unit_cost: Option<i64>,
) -> LedgerResult<StockMovement> {
    let movement = StockMovement::new(
        key,
        kind,
        previous_quantity,
        new_quantity,
        MovementReference::Transfer {
            transfer_id: transfer.id,
            reference_no: transfer.reference_no.clone(),
        },
        Utc::now(),
    )?
    .notes(transfer.notes.clone());
    Ok(match unit_cost {
        Some(unit_cost) => movement.unit_cost(unit_cost)?,
        None => movement,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_core::{BranchId, ProductId};
    use stockflow_inventory::MovementFilter;
    use stockflow_products::{CostingMethod, NewProduct, Product};

    use crate::catalog::ProductCatalog;

    struct Fixture {
        svc: TransferService,
        stores: LedgerStores,
        org: OrgId,
        north: BranchId,
        south: BranchId,
    }

    impl Fixture {
        fn new() -> Self {
            let config = LedgerConfig::default();
            let stores = LedgerStores::in_memory(&config);
            Self {
                svc: TransferService::new(stores.clone(), &config),
                stores,
                org: OrgId::new(),
                north: BranchId::new(),
                south: BranchId::new(),
            }
        }

        async fn product(&self, method: CostingMethod) -> ProductId {
            let product = Product::create(
                NewProduct {
                    org_id: self.org,
                    sku: format!("SKU-{}", ProductId::new()),
                    name: "Widget".into(),
                    price: 500,
                    cost: 100,
                    costing_method: method,
                },
                Utc::now(),
            )
            .unwrap();
            self.stores.catalog.insert(product).await.unwrap().id
        }

        /// Stock `qty` units at `unit_cost` in the north branch with a matching lot.
        async fn stock_north(&self, product_id: ProductId, qty: i64, unit_cost: i64) {
            let key = StockKey::new(self.org, self.north, product_id);
            self.stores
                .lots
                .create_lot(NewLot::new(key, LotSource::Initial, qty, unit_cost))
                .await
                .unwrap();
            self.stores.stock.adjust(key, qty).await.unwrap();
        }

        async fn draft(&self, lines: Vec<TransferLine>) -> StockTransfer {
            self.svc
                .create_transfer(NewTransfer {
                    org_id: self.org,
                    from_branch_id: self.north,
                    to_branch_id: self.south,
                    lines,
                    notes: Some("restock".into()),
                })
                .await
                .unwrap()
        }

        async fn quantity(&self, branch: BranchId, product_id: ProductId) -> i64 {
            self.stores
                .stock
                .get(StockKey::new(self.org, branch, product_id))
                .await
                .unwrap()
                .map_or(0, |l| l.quantity)
        }
    }

    #[tokio::test]
    async fn transfers_are_numbered_per_org() {
        let fx = Fixture::new();
        let p = fx.product(CostingMethod::Fifo).await;
        let first = fx.draft(vec![TransferLine::new(p, 1)]).await;
        let second = fx.draft(vec![TransferLine::new(p, 1)]).await;
        assert_eq!(first.reference_no, "TRF-000001");
        assert_eq!(second.reference_no, "TRF-000002");
        assert_eq!(first.status, TransferStatus::Draft);
    }

    #[tokio::test]
    async fn send_then_partial_receive_moves_stock_and_cost() {
        let fx = Fixture::new();
        let p = fx.product(CostingMethod::Fifo).await;
        fx.stock_north(p, 10, 40).await;
        let t = fx.draft(vec![TransferLine::new(p, 6)]).await;

        let sent = fx.svc.send_transfer(fx.org, t.id).await.unwrap();
        assert_eq!(sent.status, TransferStatus::InTransit);
        assert!(sent.sent_at.is_some());
        assert_eq!(sent.lines[0].unit_cost_of(6), Some(40));
        assert_eq!(fx.quantity(fx.north, p).await, 4);

        let received = fx
            .svc
            .receive_transfer(fx.org, t.id, &[ReceivedQuantity { product_id: p, quantity: 5 }])
            .await
            .unwrap();
        assert_eq!(received.status, TransferStatus::Received);
        assert_eq!(received.lines[0].received_quantity, Some(5));
        assert_eq!(fx.quantity(fx.south, p).await, 5);

        let south = StockKey::new(fx.org, fx.south, p);
        let lots = fx.stores.lots.list_lots(south, true).await.unwrap();
        assert_eq!(lots.len(), 1);
        assert_eq!((lots[0].source, lots[0].qty_remaining, lots[0].unit_cost), (LotSource::Transfer, 5, 40));
        assert_eq!(lots[0].reference_no.as_deref(), Some(t.reference_no.as_str()));

        let moves = fx.stores.movements.list(fx.org, &MovementFilter::default()).await.unwrap();
        let kinds: Vec<_> = moves.iter().map(|m| (m.kind, m.quantity, m.total_cost)).collect();
        assert!(kinds.contains(&(MovementKind::TransferOut, 6, Some(240))));
        assert!(kinds.contains(&(MovementKind::TransferIn, 5, Some(200))));
    }

    #[tokio::test]
    async fn cancelling_in_transit_restores_the_source() {
        let fx = Fixture::new();
        let p = fx.product(CostingMethod::Fifo).await;
        fx.stock_north(p, 8, 25).await;
        let t = fx.draft(vec![TransferLine::new(p, 8)]).await;
        fx.svc.send_transfer(fx.org, t.id).await.unwrap();
        assert_eq!(fx.quantity(fx.north, p).await, 0);

        let cancelled = fx
            .svc
            .cancel_transfer(fx.org, t.id, Some("truck broke down".into()))
            .await
            .unwrap();
        assert_eq!(cancelled.status, TransferStatus::Cancelled);
        assert_eq!(cancelled.cancellation_reason.as_deref(), Some("truck broke down"));
        assert_eq!(fx.quantity(fx.north, p).await, 8);
        let north = StockKey::new(fx.org, fx.north, p);
        assert_eq!(fx.stores.lots.open_quantity(north).await.unwrap(), 8);

        let again = fx.svc.cancel_transfer(fx.org, t.id, None).await.unwrap();
        assert_eq!(again.version, cancelled.version);
        assert!(fx.svc.receive_transfer(fx.org, t.id, &[]).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn received_transfer_cannot_be_cancelled() {
        let fx = Fixture::new();
        let p = fx.product(CostingMethod::Fifo).await;
        fx.stock_north(p, 2, 10).await;
        let t = fx.draft(vec![TransferLine::new(p, 2)]).await;
        fx.svc.send_transfer(fx.org, t.id).await.unwrap();
        fx.svc.receive_transfer(fx.org, t.id, &[]).await.unwrap();

        let err = fx.svc.cancel_transfer(fx.org, t.id, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[tokio::test]
    async fn failed_send_leaves_source_and_draft_untouched() {
        let fx = Fixture::new();
        let (a, b) = (fx.product(CostingMethod::Fifo).await, fx.product(CostingMethod::Fifo).await);
        fx.stock_north(a, 5, 30).await;
        fx.stock_north(b, 1, 30).await;
        let t = fx.draft(vec![TransferLine::new(a, 5), TransferLine::new(b, 3)]).await;

        let err = fx.svc.send_transfer(fx.org, t.id).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientStock { .. }));

        let back = fx.svc.get_transfer(fx.org, t.id).await.unwrap();
        assert_eq!(back.status, TransferStatus::Draft);
        assert_eq!(fx.quantity(fx.north, a).await, 5);
        let north_a = StockKey::new(fx.org, fx.north, a);
        assert_eq!(fx.stores.lots.open_quantity(north_a).await.unwrap(), 5);
        assert!(fx.stores.movements.list(fx.org, &MovementFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn moving_average_transfer_carries_the_branch_average() {
        let fx = Fixture::new();
        let p = fx.product(CostingMethod::MovingAverage).await;
        let north = StockKey::new(fx.org, fx.north, p);
        fx.svc.costing.receive_stock(north, 10, 80).await.unwrap();
        let t = fx.draft(vec![TransferLine::new(p, 4)]).await;

        fx.svc.send_transfer(fx.org, t.id).await.unwrap();
        fx.svc.receive_transfer(fx.org, t.id, &[]).await.unwrap();

        let south = fx.stores.stock.get(StockKey::new(fx.org, fx.south, p)).await.unwrap().unwrap();
        assert_eq!((south.quantity, south.average_cost), (4, Some(80)));
        let product = fx.stores.catalog.get(fx.org, p).await.unwrap();
        assert_eq!(product.total_quantity, 10);
    }

    #[tokio::test]
    async fn draft_lines_can_change_until_sent() {
        let fx = Fixture::new();
        let p = fx.product(CostingMethod::Fifo).await;
        fx.stock_north(p, 9, 10).await;
        let t = fx.draft(vec![TransferLine::new(p, 1)]).await;

        let updated = fx
            .svc
            .update_draft(fx.org, t.id, vec![TransferLine::new(p, 3)], None)
            .await
            .unwrap();
        assert_eq!(updated.lines[0].quantity, 3);
        assert_eq!(updated.notes.as_deref(), Some("restock"));

        fx.svc.send_transfer(fx.org, t.id).await.unwrap();
        let err = fx
            .svc
            .update_draft(fx.org, t.id, vec![TransferLine::new(p, 4)], None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(fx.svc.list_transfers(fx.org, Some(TransferStatus::InTransit)).await.unwrap().len(), 1);
    }
}
