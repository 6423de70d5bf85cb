//! Cost-of-goods computation and moving-average maintenance.

use tracing::{debug, error, info, instrument, warn};

use stockflow_core::{ensure_positive_qty, ExpectedVersion, OrgId, ProductId};
use stockflow_inventory::{
    weighted_average, AverageReceipt, CogsResult, CostLine, InventoryLot, LotSource, NewLot,
    StockKey, StockLevel,
};
use stockflow_products::{CostingMethod, Product};

use crate::catalog::ProductCatalog;
use crate::config::{LedgerConfig, RetryPolicy};
use crate::error::{LedgerError, LedgerResult};
use crate::lots::{consume_lots_fifo, LotStore};
use crate::stock_ledger::StockLedger;
use crate::stores::LedgerStores;

/// Reference stamped on lots created to cover a FIFO shortfall.
pub const ADJUSTMENT_LOT_REF: &str = "AUTO-ADJUST";

/// COGS for one sale line plus the adjustment lot created to price it, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricedLine {
    pub cogs: CogsResult,
    pub adjustment_lot: Option<InventoryLot>,
}

/// Single entry point for pricing sales, dispatching on the product's
/// [`CostingMethod`].
///
/// The branch stock level's `average_cost` is authoritative for moving-average
/// products; `Product::average_cost` is a cached default used when the branch
/// has none.
#[derive(Debug, Clone)]
pub struct CostingEngine {
    stores: LedgerStores,
    lot_race_retry: RetryPolicy,
}

impl CostingEngine {
    pub fn new(stores: LedgerStores, config: &LedgerConfig) -> Self {
        Self {
            stores,
            lot_race_retry: config.lot_race_retry.clone(),
        }
    }

    /// Price `qty` units sold from `key`.
    ///
    /// FIFO consumes lots and reports `unit_cost = total / qty`; moving average
    /// charges one synthetic `AVERAGE` line and touches no lot.
    #[instrument(skip(self), fields(branch_id = %key.branch_id, product_id = %key.product_id), err)]
    pub async fn compute_cogs(&self, key: StockKey, qty: i64) -> LedgerResult<CogsResult> {
        ensure_positive_qty(qty)?;
        let product = self.stores.catalog.get(key.org_id, key.product_id).await?;
        self.compute_for(&product, key, qty).await
    }

    async fn compute_for(&self, product: &Product, key: StockKey, qty: i64) -> LedgerResult<CogsResult> {
        match product.costing_method {
            CostingMethod::Fifo => {
                consume_lots_fifo(self.stores.lots.as_ref(), key, qty, &self.lot_race_retry).await
            }
            CostingMethod::MovingAverage => {
                let average_cost = self.average_cost_of(product, key).await?;
                debug!(average_cost, qty, "charged moving average");
                let line = CostLine::average(key.product_id, qty, average_cost)?;
                Ok(CogsResult::from_lines(vec![line])?)
            }
        }
    }

    /// [`Self::compute_cogs`], covering a FIFO lot shortfall with one
    /// `ADJUSTMENT` lot priced at the product's last cost and retrying once.
    ///
    /// When the retry also fails the adjustment lot is removed again and the
    /// error is returned. On success the caller owns the lot's compensation.
    #[instrument(skip(self), fields(branch_id = %key.branch_id, product_id = %key.product_id), err)]
    pub async fn compute_cogs_with_fallback(&self, key: StockKey, qty: i64) -> LedgerResult<PricedLine> {
        ensure_positive_qty(qty)?;
        let product = self.stores.catalog.get(key.org_id, key.product_id).await?;

        match self.compute_for(&product, key, qty).await {
            Ok(cogs) => Ok(PricedLine {
                cogs,
                adjustment_lot: None,
            }),
            Err(LedgerError::InsufficientLots { .. }) => {
                let open = self.stores.lots.open_quantity(key).await?;
                let shortfall = (qty - open).max(1);
                warn!(qty, open, shortfall, "lots exhausted; creating adjustment lot");
                let lot = self.create_adjustment_lot(key, shortfall, product.cost).await?;

                match self.compute_for(&product, key, qty).await {
                    Ok(cogs) => Ok(PricedLine {
                        cogs,
                        adjustment_lot: Some(lot),
                    }),
                    Err(err) => {
                        if let Err(undo) = self.stores.lots.delete_lot(key.org_id, lot.id).await {
                            error!(lot_id = %lot.id, error = %undo, "failed to remove adjustment lot");
                        }
                        Err(err)
                    }
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Current moving-average cost for `key`: branch level, then the product's
    /// cached average, then the product's last cost. `NoCostData` if all are zero.
    pub async fn current_average_cost(&self, key: StockKey) -> LedgerResult<i64> {
        let product = self.stores.catalog.get(key.org_id, key.product_id).await?;
        self.average_cost_of(&product, key).await
    }

    async fn average_cost_of(&self, product: &Product, key: StockKey) -> LedgerResult<i64> {
        let branch = self
            .stores
            .stock
            .get(key)
            .await?
            .and_then(|level| level.known_average_cost());

        branch
            .or_else(|| (product.average_cost > 0).then_some(product.average_cost))
            .or_else(|| (product.cost > 0).then_some(product.cost))
            .ok_or(LedgerError::NoCostData {
                product_id: key.product_id,
            })
    }

    /// Put `qty` purchased units on the branch shelf at `unit_cost`.
    ///
    /// For moving-average products the quantity increase and the new branch
    /// average are one ledger write, so concurrent receipts cannot both average
    /// against the same pre-receipt quantity. The product's cached average and
    /// running quantity follow.
    #[instrument(skip(self), fields(branch_id = %key.branch_id, product_id = %key.product_id), err)]
    pub async fn receive_stock(&self, key: StockKey, qty: i64, unit_cost: i64) -> LedgerResult<StockLevel> {
        ensure_positive_qty(qty)?;
        let product = self.stores.catalog.get(key.org_id, key.product_id).await?;
        let average = product
            .uses_moving_average()
            .then(|| AverageReceipt::new(unit_cost, product.total_quantity, product.average_cost));

        let level = self.stores.stock.receive(key, qty, average).await?;
        if let Some(average_cost) = average.and(level.average_cost) {
            self.stores
                .catalog
                .record_receipt_average(key.org_id, key.product_id, average_cost, qty)
                .await?;
            debug!(average_cost, quantity = level.quantity, "moving average updated");
        }
        Ok(level)
    }

    /// Put `qty` units moved in from another branch on the shelf.
    ///
    /// A known `unit_cost` is folded into the branch average of a moving-average
    /// product; a branch with no level yet takes it as is. The org-wide product
    /// figures do not change.
    #[instrument(skip(self), fields(branch_id = %key.branch_id, product_id = %key.product_id), err)]
    pub async fn receive_transferred(
        &self,
        key: StockKey,
        qty: i64,
        unit_cost: Option<i64>,
    ) -> LedgerResult<StockLevel> {
        ensure_positive_qty(qty)?;
        let product = self.stores.catalog.get(key.org_id, key.product_id).await?;
        let average = unit_cost
            .filter(|_| product.uses_moving_average())
            .map(|cost| AverageReceipt::new(cost, 0, product.average_cost));
        self.stores.stock.receive(key, qty, average).await
    }

    /// Take sold units off the product's running quantity. The average does not
    /// move on sale. No-op for FIFO products.
    #[instrument(skip(self), err)]
    pub async fn update_moving_average_on_sale(
        &self,
        org_id: OrgId,
        product_id: ProductId,
        sold_qty: i64,
    ) -> LedgerResult<()> {
        ensure_positive_qty(sold_qty)?;
        let product = self.stores.catalog.get(org_id, product_id).await?;
        if product.uses_moving_average() {
            self.stores.catalog.record_sale(org_id, product_id, sold_qty).await?;
        }
        Ok(())
    }

    /// Switch a product to moving-average costing, seeding the average from the
    /// remaining quantity of its open lots (or its last cost when none are open).
    #[instrument(skip(self), fields(branch_id = %key.branch_id, product_id = %key.product_id), err)]
    pub async fn migrate_to_moving_average(&self, key: StockKey) -> LedgerResult<Product> {
        let product = self.stores.catalog.get(key.org_id, key.product_id).await?;
        let open = self.stores.lots.list_lots(key, true).await?;
        let average_cost = weighted_average(open.iter().map(|lot| (lot.qty_remaining, lot.unit_cost)))
            .unwrap_or(product.cost);

        self.stores
            .stock
            .set_average_cost(key, average_cost, ExpectedVersion::Any)
            .await?;
        let product = self
            .stores
            .catalog
            .switch_costing(
                key.org_id,
                key.product_id,
                CostingMethod::MovingAverage,
                Some(average_cost),
            )
            .await?;
        info!(average_cost, open_lots = open.len(), "migrated to moving average");
        Ok(product)
    }

    /// Create the `ADJUSTMENT` lot that covers a FIFO shortfall.
    pub async fn create_adjustment_lot(
        &self,
        key: StockKey,
        qty: i64,
        unit_cost: i64,
    ) -> LedgerResult<InventoryLot> {
        let lot = self
            .stores
            .lots
            .create_lot(NewLot::new(key, LotSource::Adjustment, qty, unit_cost).reference(ADJUSTMENT_LOT_REF))
            .await?;
        debug!(lot_id = %lot.id, qty, unit_cost, "adjustment lot created");
        Ok(lot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stockflow_core::BranchId;
    use stockflow_inventory::LotRef;
    use stockflow_products::NewProduct;

    async fn setup(method: CostingMethod, cost: i64) -> (CostingEngine, StockKey) {
        let config = LedgerConfig::default();
        let stores = LedgerStores::in_memory(&config);
        let org = OrgId::new();
        let product = Product::create(
            NewProduct {
                org_id: org,
                sku: "SKU-1".into(),
                name: "Widget".into(),
                price: 300,
                cost,
                costing_method: method,
            },
            Utc::now(),
        )
        .unwrap();
        let product = stores.catalog.insert(product).await.unwrap();
        let key = StockKey::new(org, BranchId::new(), product.id);
        (CostingEngine::new(stores, &config), key)
    }

    #[tokio::test]
    async fn moving_average_receipts_then_sale() {
        let (engine, key) = setup(CostingMethod::MovingAverage, 0).await;

        engine.receive_stock(key, 10, 100).await.unwrap();
        let level = engine.receive_stock(key, 10, 200).await.unwrap();
        assert_eq!((level.quantity, level.average_cost), (20, Some(150)));

        let cogs = engine.compute_cogs(key, 5).await.unwrap();
        assert_eq!(cogs.total_cogs, 750);
        assert_eq!(cogs.cost_lines.len(), 1);
        assert_eq!(cogs.cost_lines[0].lot_id, LotRef::Average);

        engine.update_moving_average_on_sale(key.org_id, key.product_id, 5).await.unwrap();
        let product = engine.stores.catalog.get(key.org_id, key.product_id).await.unwrap();
        assert_eq!((product.average_cost, product.total_quantity), (150, 15));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn interleaved_receipts_average_over_both() {
        let (engine, key) = setup(CostingMethod::MovingAverage, 0).await;
        let engine = std::sync::Arc::new(engine);

        let tasks: Vec<_> = [100, 200]
            .into_iter()
            .map(|unit_cost| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.receive_stock(key, 10, unit_cost).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let level = engine.stores.stock.get(key).await.unwrap().unwrap();
        assert_eq!((level.quantity, level.average_cost), (20, Some(150)));
        let product = engine.stores.catalog.get(key.org_id, key.product_id).await.unwrap();
        assert_eq!(product.total_quantity, 20);
    }

    #[tokio::test]
    async fn fifo_receipts_leave_average_unset() {
        let (engine, key) = setup(CostingMethod::Fifo, 80).await;
        let level = engine.receive_stock(key, 5, 90).await.unwrap();
        assert_eq!((level.quantity, level.average_cost), (5, None));
        let product = engine.stores.catalog.get(key.org_id, key.product_id).await.unwrap();
        assert_eq!(product.total_quantity, 0);
    }

    #[tokio::test]
    async fn transferred_stock_averages_without_touching_product_totals() {
        let (engine, key) = setup(CostingMethod::MovingAverage, 0).await;
        engine.receive_stock(key, 10, 100).await.unwrap();

        let level = engine.receive_transferred(key, 10, Some(300)).await.unwrap();
        assert_eq!((level.quantity, level.average_cost), (20, Some(200)));
        let level = engine.receive_transferred(key, 5, None).await.unwrap();
        assert_eq!((level.quantity, level.average_cost), (25, Some(200)));

        let product = engine.stores.catalog.get(key.org_id, key.product_id).await.unwrap();
        assert_eq!((product.total_quantity, product.average_cost), (10, 100));
    }

    #[tokio::test]
    async fn average_cost_falls_back_to_product_cost() {
        let (engine, key) = setup(CostingMethod::MovingAverage, 70).await;
        assert_eq!(engine.current_average_cost(key).await.unwrap(), 70);

        let (engine, key) = setup(CostingMethod::MovingAverage, 0).await;
        assert_eq!(
            engine.compute_cogs(key, 1).await.unwrap_err(),
            LedgerError::NoCostData { product_id: key.product_id }
        );
    }

    #[tokio::test]
    async fn fallback_creates_adjustment_lot_for_shortfall() {
        let (engine, key) = setup(CostingMethod::Fifo, 90).await;
        engine
            .stores
            .lots
            .create_lot(NewLot::new(key, LotSource::Po, 3, 100))
            .await
            .unwrap();

        let priced = engine.compute_cogs_with_fallback(key, 5).await.unwrap();
        let lot = priced.adjustment_lot.unwrap();
        assert_eq!((lot.source, lot.qty_received, lot.unit_cost), (LotSource::Adjustment, 2, 90));
        assert_eq!(priced.cogs.total_cogs, 3 * 100 + 2 * 90);
        assert!(priced.cogs.reconciles(5));
    }

    #[tokio::test]
    async fn migration_seeds_average_from_open_lots() {
        let (engine, key) = setup(CostingMethod::Fifo, 10).await;
        for (qty, cost) in [(4, 100), (4, 200)] {
            engine
                .stores
                .lots
                .create_lot(NewLot::new(key, LotSource::Po, qty, cost))
                .await
                .unwrap();
        }

        let product = engine.migrate_to_moving_average(key).await.unwrap();
        assert_eq!(product.costing_method, CostingMethod::MovingAverage);
        assert_eq!(engine.current_average_cost(key).await.unwrap(), 150);
    }
}
