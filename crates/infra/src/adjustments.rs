//! Manual stock adjustments and the movement history they write.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use stockflow_core::{ensure_positive_qty, BranchId, DomainError, ExpectedVersion, LotId, OrgId, ProductId};
use stockflow_inventory::{MovementFilter, MovementKind, MovementReference, StockKey, StockLevel, StockMovement};

use crate::compensation::{Compensation, CompensationLog};
use crate::config::{LedgerConfig, RetryPolicy};
use crate::error::{LedgerError, LedgerResult};
use crate::movements::MovementStore;
use crate::stock_ledger::StockLedger;
use crate::stores::LedgerStores;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdjustmentKind {
    Add,
    Remove,
    /// Bring the on-hand quantity to exactly `quantity`.
    Set,
}

/// One product line of an adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdjustment {
    pub product_id: ProductId,
    pub kind: AdjustmentKind,
    pub quantity: i64,
    #[serde(default)]
    pub unit_cost: Option<i64>,
    #[serde(default)]
    pub lot_id: Option<LotId>,
}

impl StockAdjustment {
    pub fn new(product_id: ProductId, kind: AdjustmentKind, quantity: i64) -> Self {
        Self {
            product_id,
            kind,
            quantity,
            unit_cost: None,
            lot_id: None,
        }
    }

    fn validate(&self) -> LedgerResult<()> {
        match self.kind {
            AdjustmentKind::Add | AdjustmentKind::Remove => ensure_positive_qty(self.quantity)?,
            AdjustmentKind::Set if self.quantity < 0 => {
                return Err(DomainError::validation("target quantity must be >= 0").into())
            }
            AdjustmentKind::Set => {}
        }
        if self.unit_cost.is_some_and(|c| c < 0) {
            return Err(DomainError::validation("unit cost must be >= 0").into());
        }
        Ok(())
    }
}

/// A single adjustment or a bulk one; either every line applies or none does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentRequest {
    pub org_id: OrgId,
    pub branch_id: BranchId,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub lines: Vec<StockAdjustment>,
}

#[derive(Debug, Clone)]
pub struct AdjustmentService {
    stores: LedgerStores,
    stock_write_retry: RetryPolicy,
}

impl AdjustmentService {
    pub fn new(stores: LedgerStores, config: &LedgerConfig) -> Self {
        Self {
            stores,
            stock_write_retry: config.stock_write_retry.clone(),
        }
    }

    /// Apply every line of `request`, writing one movement per changed level.
    ///
    /// A `Set` line that already matches is skipped without a movement. When
    /// any line fails, the lines before it are undone and their movements
    /// deleted. Lots are not touched.
    #[instrument(skip(self, request), fields(org_id = %request.org_id, branch_id = %request.branch_id, lines = request.lines.len()), err)]
    pub async fn adjust_stock(&self, request: AdjustmentRequest) -> LedgerResult<Vec<StockMovement>> {
        if request.lines.is_empty() {
            return Err(DomainError::validation("adjustment must have at least one line").into());
        }
        for line in &request.lines {
            line.validate()?;
        }

        let mut log = CompensationLog::new();
        let mut movements = Vec::with_capacity(request.lines.len());
        for line in &request.lines {
            match self.apply_line(&request, line, &mut log).await {
                Ok(Some(movement)) => movements.push(movement),
                Ok(None) => debug!(product_id = %line.product_id, "quantity already at target"),
                Err(err) => {
                    warn!(error = %err, steps = log.len(), "adjustment failed; compensating");
                    log.compensate(&self.stores).await;
                    return Err(err);
                }
            }
        }

        info!(movements = movements.len(), "stock adjusted");
        Ok(movements)
    }

    async fn apply_line(
        &self,
        request: &AdjustmentRequest,
        line: &StockAdjustment,
        log: &mut CompensationLog,
    ) -> LedgerResult<Option<StockMovement>> {
        let key = StockKey::new(request.org_id, request.branch_id, line.product_id);
        let (level, delta) = match line.kind {
            AdjustmentKind::Add => (self.stores.stock.adjust(key, line.quantity).await?, line.quantity),
            AdjustmentKind::Remove => (self.stores.stock.adjust(key, -line.quantity).await?, -line.quantity),
            AdjustmentKind::Set => match self.set_quantity(key, line.quantity).await? {
                Some(applied) => applied,
                None => return Ok(None),
            },
        };
        log.record(Compensation::ReverseAdjustment { key, delta });

        let mut movement = StockMovement::new(
            key,
            MovementKind::adjustment(delta),
            level.quantity - delta,
            level.quantity,
            MovementReference::Adjustment,
            Utc::now(),
        )?
        .lot(line.lot_id)
        .reason(request.reason.clone())
        .notes(request.notes.clone());
        if let Some(unit_cost) = line.unit_cost {
            movement = movement.unit_cost(unit_cost)?;
        }

        let movement = self.stores.movements.record(movement).await?;
        log.record(Compensation::RemoveMovement {
            org_id: request.org_id,
            movement_id: movement.id,
        });
        Ok(Some(movement))
    }

    /// Move the level to `target` with a version-checked delta, re-reading on
    /// a lost race. `None` when the level is already there.
    async fn set_quantity(&self, key: StockKey, target: i64) -> LedgerResult<Option<(StockLevel, i64)>> {
        let mut races = 0u32;
        loop {
            let current = self.stores.stock.get(key).await?;
            let (quantity, version) = current.map_or((0, 0), |l| (l.quantity, l.version));
            let delta = target - quantity;
            if delta == 0 {
                return Ok(None);
            }

            match self
                .stores
                .stock
                .adjust_at(key, delta, ExpectedVersion::Exact(version))
                .await
            {
                Ok(level) => return Ok(Some((level, delta))),
                Err(err) if err.is_conflict() && self.stock_write_retry.should_retry(races) => {
                    races += 1;
                    warn!(%key, attempt = races, "stock level changed under a set; retrying");
                    tokio::time::sleep(self.stock_write_retry.delay_for_attempt(races)).await;
                }
                Err(err) if err.is_conflict() => {
                    return Err(LedgerError::conflict(format!(
                        "setting {key} to {target} lost {} races in a row",
                        races + 1
                    )))
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Movement history for `org_id`, newest first.
    pub async fn list_movements(&self, org_id: OrgId, filter: &MovementFilter) -> LedgerResult<Vec<StockMovement>> {
        self.stores.movements.list(org_id, filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AdjustmentService {
        let config = LedgerConfig::default();
        AdjustmentService::new(LedgerStores::in_memory(&config), &config)
    }

    fn request(org: OrgId, branch: BranchId, lines: Vec<StockAdjustment>) -> AdjustmentRequest {
        AdjustmentRequest {
            org_id: org,
            branch_id: branch,
            reason: Some("cycle count".into()),
            notes: None,
            lines,
        }
    }

    #[tokio::test]
    async fn add_remove_and_set_each_write_a_movement() {
        let svc = service();
        let (org, branch, p) = (OrgId::new(), BranchId::new(), ProductId::new());
        let key = StockKey::new(org, branch, p);

        let mut add = StockAdjustment::new(p, AdjustmentKind::Add, 10);
        add.unit_cost = Some(25);
        let added = svc.adjust_stock(request(org, branch, vec![add])).await.unwrap();
        assert_eq!(
            (added[0].kind, added[0].previous_quantity, added[0].new_quantity, added[0].total_cost),
            (MovementKind::AdjustmentIn, 0, 10, Some(250))
        );

        svc.adjust_stock(request(org, branch, vec![StockAdjustment::new(p, AdjustmentKind::Remove, 4)]))
            .await
            .unwrap();
        let set = svc
            .adjust_stock(request(org, branch, vec![StockAdjustment::new(p, AdjustmentKind::Set, 2)]))
            .await
            .unwrap();
        assert_eq!(
            (set[0].kind, set[0].quantity, set[0].previous_quantity, set[0].new_quantity),
            (MovementKind::AdjustmentOut, 4, 6, 2)
        );
        assert_eq!(set[0].reason.as_deref(), Some("cycle count"));

        assert_eq!(svc.stores.stock.get(key).await.unwrap().unwrap().quantity, 2);
        let history = svc.list_movements(org, &MovementFilter::default()).await.unwrap();
        assert_eq!(history.len(), 3);
    }

    #[tokio::test]
    async fn set_to_current_quantity_is_a_no_op() {
        let svc = service();
        let (org, branch, p) = (OrgId::new(), BranchId::new(), ProductId::new());
        svc.adjust_stock(request(org, branch, vec![StockAdjustment::new(p, AdjustmentKind::Set, 5)]))
            .await
            .unwrap();

        let again = svc
            .adjust_stock(request(org, branch, vec![StockAdjustment::new(p, AdjustmentKind::Set, 5)]))
            .await
            .unwrap();
        assert!(again.is_empty());
        assert_eq!(svc.list_movements(org, &MovementFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failing_line_undoes_the_whole_bulk() {
        let svc = service();
        let (org, branch) = (OrgId::new(), BranchId::new());
        let (a, b) = (ProductId::new(), ProductId::new());
        let key_b = StockKey::new(org, branch, b);
        svc.stores.stock.adjust(key_b, 5).await.unwrap();
        svc.stores.stock.reserve(key_b, 4).await.unwrap();

        let err = svc
            .adjust_stock(request(
                org,
                branch,
                vec![
                    StockAdjustment::new(a, AdjustmentKind::Add, 7),
                    StockAdjustment::new(b, AdjustmentKind::Remove, 3),
                ],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientStock { .. }));

        let level_a = svc.stores.stock.get(StockKey::new(org, branch, a)).await.unwrap().unwrap();
        assert_eq!(level_a.quantity, 0);
        assert_eq!(svc.stores.stock.get(key_b).await.unwrap().unwrap().quantity, 5);
        assert!(svc.list_movements(org, &MovementFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_lines_are_rejected_before_any_write() {
        let svc = service();
        let (org, branch, p) = (OrgId::new(), BranchId::new(), ProductId::new());
        let err = svc
            .adjust_stock(request(
                org,
                branch,
                vec![
                    StockAdjustment::new(p, AdjustmentKind::Add, 3),
                    StockAdjustment::new(ProductId::new(), AdjustmentKind::Set, -1),
                ],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert!(svc.stores.stock.get(StockKey::new(org, branch, p)).await.unwrap().is_none());

        assert!(svc.adjust_stock(request(org, branch, vec![])).await.is_err());
    }
}
