//! Postgres-backed lot ledger.
//!
//! `find_oldest_open` is an ordered range scan over the partial index
//! `inventory_lots_open_fifo` (`qty_remaining > 0`, ordered by `received_at, id`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, FromRow, PgPool, Row};
use tracing::instrument;

use stockflow_core::{
    ensure_positive_qty, BranchId, DomainError, LotId, OrgId, ProductId, PurchaseOrderId,
};
use stockflow_inventory::{InventoryLot, LotSource, NewLot, StockKey};

use super::LotStore;
use crate::error::{map_sqlx_error, LedgerError, LedgerResult};

#[derive(Debug, Clone)]
pub struct PostgresLotStore {
    pool: PgPool,
}

impl PostgresLotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, org_id: OrgId, lot_id: LotId, operation: &str) -> LedgerResult<Option<InventoryLot>> {
        let row = sqlx::query("SELECT * FROM inventory_lots WHERE id = $1 AND org_id = $2")
            .bind(lot_id.as_uuid())
            .bind(org_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        row.map(|r| decode(&r, operation)).transpose()
    }

    async fn update_remaining(
        &self,
        sql: &str,
        org_id: OrgId,
        lot_id: LotId,
        qty: i64,
        operation: &str,
    ) -> LedgerResult<Option<InventoryLot>> {
        let row = sqlx::query(sql)
            .bind(lot_id.as_uuid())
            .bind(org_id.as_uuid())
            .bind(qty)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        row.map(|r| decode(&r, operation)).transpose()
    }
}

fn lot_not_found(lot_id: LotId) -> LedgerError {
    LedgerError::not_found(format!("lot {lot_id}"))
}

#[async_trait]
impl LotStore for PostgresLotStore {
    #[instrument(skip(self, lot), fields(key = %lot.key, source = lot.source.as_str()), err)]
    async fn create_lot(&self, lot: NewLot) -> LedgerResult<InventoryLot> {
        let lot = InventoryLot::create(lot, Utc::now())?;
        let row = sqlx::query(
            r#"
            INSERT INTO inventory_lots (
                id, org_id, branch_id, product_id, source, purchase_order_id, reference_no,
                unit_cost, qty_received, qty_remaining, received_at, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING *
            "#,
        )
        .bind(lot.id.as_uuid())
        .bind(lot.key.org_id.as_uuid())
        .bind(lot.key.branch_id.as_uuid())
        .bind(lot.key.product_id.as_uuid())
        .bind(lot.source.as_str())
        .bind(lot.purchase_order_id.map(uuid::Uuid::from))
        .bind(lot.reference_no.as_deref())
        .bind(lot.unit_cost)
        .bind(lot.qty_received)
        .bind(lot.qty_remaining)
        .bind(lot.received_at)
        .bind(lot.version as i64)
        .bind(lot.created_at)
        .bind(lot.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_lot", e))?;

        decode(&row, "create_lot")
    }

    async fn get_lot(&self, org_id: OrgId, lot_id: LotId) -> LedgerResult<Option<InventoryLot>> {
        self.fetch(org_id, lot_id, "get_lot").await
    }

    async fn find_oldest_open(&self, key: StockKey) -> LedgerResult<InventoryLot> {
        let row = sqlx::query(
            r#"
            SELECT * FROM inventory_lots
            WHERE org_id = $1 AND branch_id = $2 AND product_id = $3 AND qty_remaining > 0
            ORDER BY received_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(key.org_id.as_uuid())
        .bind(key.branch_id.as_uuid())
        .bind(key.product_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_oldest_open_lot", e))?;

        match row {
            Some(row) => decode(&row, "find_oldest_open_lot"),
            None => Err(LedgerError::not_found(format!("open lot for {key}"))),
        }
    }

    async fn list_lots(&self, key: StockKey, open_only: bool) -> LedgerResult<Vec<InventoryLot>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM inventory_lots
            WHERE org_id = $1 AND branch_id = $2 AND product_id = $3
              AND (NOT $4 OR qty_remaining > 0)
            ORDER BY received_at ASC, id ASC
            "#,
        )
        .bind(key.org_id.as_uuid())
        .bind(key.branch_id.as_uuid())
        .bind(key.product_id.as_uuid())
        .bind(open_only)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_lots", e))?;

        rows.iter().map(|r| decode(r, "list_lots")).collect()
    }

    async fn open_quantity(&self, key: StockKey) -> LedgerResult<i64> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(qty_remaining), 0)::BIGINT AS open_quantity
            FROM inventory_lots
            WHERE org_id = $1 AND branch_id = $2 AND product_id = $3 AND qty_remaining > 0
            "#,
        )
        .bind(key.org_id.as_uuid())
        .bind(key.branch_id.as_uuid())
        .bind(key.product_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("open_quantity", e))?;

        row.try_get("open_quantity")
            .map_err(|e| LedgerError::backend(format!("failed to read open_quantity: {e}")))
    }

    #[instrument(skip(self), fields(lot_id = %lot_id), err)]
    async fn decrement_remaining(
        &self,
        org_id: OrgId,
        lot_id: LotId,
        qty: i64,
    ) -> LedgerResult<InventoryLot> {
        ensure_positive_qty(qty)?;
        if let Some(lot) = self
            .update_remaining(
                r#"
                UPDATE inventory_lots
                SET qty_remaining = qty_remaining - $3, version = version + 1, updated_at = now()
                WHERE id = $1 AND org_id = $2 AND qty_remaining >= $3
                RETURNING *
                "#,
                org_id,
                lot_id,
                qty,
                "decrement_lot_remaining",
            )
            .await?
        {
            return Ok(lot);
        }

        match self.fetch(org_id, lot_id, "decrement_lot_remaining").await? {
            None => Err(lot_not_found(lot_id)),
            Some(lot) => Err(LedgerError::conflict(format!(
                "lot {lot_id} has {} remaining, cannot take {qty}",
                lot.qty_remaining
            ))),
        }
    }

    #[instrument(skip(self), fields(lot_id = %lot_id), err)]
    async fn increment_remaining(
        &self,
        org_id: OrgId,
        lot_id: LotId,
        qty: i64,
    ) -> LedgerResult<InventoryLot> {
        ensure_positive_qty(qty)?;
        if let Some(lot) = self
            .update_remaining(
                r#"
                UPDATE inventory_lots
                SET qty_remaining = qty_remaining + $3, version = version + 1, updated_at = now()
                WHERE id = $1 AND org_id = $2 AND qty_remaining + $3 <= qty_received
                RETURNING *
                "#,
                org_id,
                lot_id,
                qty,
                "increment_lot_remaining",
            )
            .await?
        {
            return Ok(lot);
        }

        match self.fetch(org_id, lot_id, "increment_lot_remaining").await? {
            None => Err(lot_not_found(lot_id)),
            Some(lot) => Err(DomainError::invariant(format!(
                "lot {lot_id} would hold {} of {} received",
                lot.qty_remaining + qty,
                lot.qty_received
            ))
            .into()),
        }
    }

    #[instrument(skip(self), fields(lot_id = %lot_id), err)]
    async fn delete_lot(&self, org_id: OrgId, lot_id: LotId) -> LedgerResult<()> {
        let result = sqlx::query("DELETE FROM inventory_lots WHERE id = $1 AND org_id = $2")
            .bind(lot_id.as_uuid())
            .bind(org_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_lot", e))?;

        if result.rows_affected() == 0 {
            return Err(lot_not_found(lot_id));
        }
        Ok(())
    }
}

// SQLx row types

#[derive(Debug)]
struct LotRow {
    id: uuid::Uuid,
    org_id: uuid::Uuid,
    branch_id: uuid::Uuid,
    product_id: uuid::Uuid,
    source: String,
    purchase_order_id: Option<uuid::Uuid>,
    reference_no: Option<String>,
    unit_cost: i64,
    qty_received: i64,
    qty_remaining: i64,
    received_at: DateTime<Utc>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for LotRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(LotRow {
            id: row.try_get("id")?,
            org_id: row.try_get("org_id")?,
            branch_id: row.try_get("branch_id")?,
            product_id: row.try_get("product_id")?,
            source: row.try_get("source")?,
            purchase_order_id: row.try_get("purchase_order_id")?,
            reference_no: row.try_get("reference_no")?,
            unit_cost: row.try_get("unit_cost")?,
            qty_received: row.try_get("qty_received")?,
            qty_remaining: row.try_get("qty_remaining")?,
            received_at: row.try_get("received_at")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<LotRow> for InventoryLot {
    type Error = LedgerError;

    fn try_from(row: LotRow) -> Result<Self, Self::Error> {
        Ok(InventoryLot {
            id: LotId::from_uuid(row.id),
            key: StockKey::new(
                OrgId::from_uuid(row.org_id),
                BranchId::from_uuid(row.branch_id),
                ProductId::from_uuid(row.product_id),
            ),
            source: row.source.parse::<LotSource>()?,
            purchase_order_id: row.purchase_order_id.map(PurchaseOrderId::from_uuid),
            reference_no: row.reference_no,
            unit_cost: row.unit_cost,
            qty_received: row.qty_received,
            qty_remaining: row.qty_remaining,
            received_at: row.received_at,
            version: row.version as u64,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode(row: &PgRow, operation: &str) -> LedgerResult<InventoryLot> {
    LotRow::from_row(row)
        .map_err(|e| LedgerError::backend(format!("failed to decode lot in {operation}: {e}")))?
        .try_into()
}
