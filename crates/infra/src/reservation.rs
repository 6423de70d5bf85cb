//! Reservation coordinator: the four counter moves on the stock ledger.

use std::sync::Arc;

use tracing::{debug, error, instrument, warn};

use stockflow_core::{BranchId, OrgId, ProductId};
use stockflow_inventory::{StockKey, StockLevel};

use crate::error::LedgerResult;
use crate::stock_ledger::StockLedger;

/// Each call is one conditional update on one stock level; a losing racer gets
/// a typed error back and nothing changes.
#[derive(Clone)]
pub struct ReservationCoordinator {
    stock: Arc<dyn StockLedger>,
}

impl ReservationCoordinator {
    pub fn new(stock: Arc<dyn StockLedger>) -> Self {
        Self { stock }
    }

    #[instrument(skip(self), fields(branch_id = %key.branch_id, product_id = %key.product_id), err)]
    pub async fn reserve(&self, key: StockKey, qty: i64) -> LedgerResult<StockLevel> {
        let level = self.stock.reserve(key, qty).await?;
        debug!(reserved = level.reserved, quantity = level.quantity, "reserved");
        Ok(level)
    }

    #[instrument(skip(self), fields(branch_id = %key.branch_id, product_id = %key.product_id), err)]
    pub async fn release(&self, key: StockKey, qty: i64) -> LedgerResult<StockLevel> {
        let level = self.stock.release(key, qty).await?;
        debug!(reserved = level.reserved, "released");
        Ok(level)
    }

    #[instrument(skip(self), fields(branch_id = %key.branch_id, product_id = %key.product_id), err)]
    pub async fn commit(&self, key: StockKey, qty: i64) -> LedgerResult<StockLevel> {
        let level = self.stock.commit(key, qty).await?;
        debug!(reserved = level.reserved, quantity = level.quantity, "committed");
        Ok(level)
    }

    #[instrument(skip(self), fields(branch_id = %key.branch_id, product_id = %key.product_id), err)]
    pub async fn uncommit(&self, key: StockKey, qty: i64) -> LedgerResult<StockLevel> {
        let level = self.stock.uncommit(key, qty).await?;
        debug!(reserved = level.reserved, quantity = level.quantity, "uncommitted");
        Ok(level)
    }

    #[instrument(skip(self), fields(branch_id = %key.branch_id, product_id = %key.product_id), err)]
    pub async fn adjust(&self, key: StockKey, delta: i64) -> LedgerResult<StockLevel> {
        let level = self.stock.adjust(key, delta).await?;
        debug!(quantity = level.quantity, "adjusted");
        Ok(level)
    }

    /// Reserve every line or none: on the first failure the lines already
    /// reserved are released newest first and the failure is returned.
    #[instrument(skip(self, lines), fields(lines = lines.len()), err)]
    pub async fn reserve_lines(
        &self,
        org_id: OrgId,
        branch_id: BranchId,
        lines: &[(ProductId, i64)],
    ) -> LedgerResult<()> {
        for (done, (product_id, qty)) in lines.iter().enumerate() {
            let key = StockKey::new(org_id, branch_id, *product_id);
            if let Err(err) = self.stock.reserve(key, *qty).await {
                warn!(%product_id, qty, error = %err, "reservation failed; releasing earlier lines");
                for (product_id, qty) in lines[..done].iter().rev() {
                    let key = StockKey::new(org_id, branch_id, *product_id);
                    if let Err(undo) = self.stock.release(key, *qty).await {
                        error!(%product_id, qty, error = %undo, "failed to release reservation");
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Release every line or none: on failure the lines already released are
    /// reserved again.
    #[instrument(skip(self, lines), fields(lines = lines.len()), err)]
    pub async fn release_lines(
        &self,
        org_id: OrgId,
        branch_id: BranchId,
        lines: &[(ProductId, i64)],
    ) -> LedgerResult<()> {
        for (done, (product_id, qty)) in lines.iter().enumerate() {
            let key = StockKey::new(org_id, branch_id, *product_id);
            if let Err(err) = self.stock.release(key, *qty).await {
                warn!(%product_id, qty, error = %err, "release failed; re-reserving earlier lines");
                for (product_id, qty) in lines[..done].iter().rev() {
                    let key = StockKey::new(org_id, branch_id, *product_id);
                    if let Err(undo) = self.stock.reserve(key, *qty).await {
                        error!(%product_id, qty, error = %undo, "failed to re-reserve");
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ReservationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationCoordinator").finish_non_exhaustive()
    }
}
