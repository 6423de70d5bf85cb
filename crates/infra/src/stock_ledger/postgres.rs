//! Postgres-backed stock ledger.
//!
//! Every mutation is a single `UPDATE … WHERE <predicate> RETURNING *` (or an
//! upsert for the first adjustment) that bumps `version` in the same statement.
//! When no row comes back the predicate failed; a follow-up read only decides
//! which typed error to report and never retries the write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::instrument;

use stockflow_core::{
    ensure_positive_qty, BranchId, DomainError, ExpectedVersion, OrgId, ProductId,
};
use stockflow_inventory::{AverageReceipt, StockKey, StockLevel};

use super::StockLedger;
use crate::error::{map_sqlx_error, LedgerError, LedgerResult};

#[derive(Debug, Clone)]
pub struct PostgresStockLedger {
    pool: PgPool,
    default_min_stock: i64,
}

impl PostgresStockLedger {
    pub fn new(pool: PgPool, default_min_stock: i64) -> Self {
        Self {
            pool,
            default_min_stock,
        }
    }

    async fn fetch(&self, key: StockKey, operation: &str) -> LedgerResult<Option<StockLevel>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM stock_levels
            WHERE org_id = $1 AND branch_id = $2 AND product_id = $3
            "#,
        )
        .bind(key.org_id.as_uuid())
        .bind(key.branch_id.as_uuid())
        .bind(key.product_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        row.map(|r| decode(&r, operation)).transpose()
    }

    /// Run a conditional update on one key; `None` means the predicate failed.
    async fn conditional(
        &self,
        sql: &str,
        key: StockKey,
        amount: i64,
        operation: &str,
    ) -> LedgerResult<Option<StockLevel>> {
        let row = sqlx::query(sql)
            .bind(key.org_id.as_uuid())
            .bind(key.branch_id.as_uuid())
            .bind(key.product_id.as_uuid())
            .bind(amount)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        row.map(|r| decode(&r, operation)).transpose()
    }

    fn not_found(key: StockKey) -> LedgerError {
        LedgerError::not_found(format!("stock level {key}"))
    }
}

#[async_trait]
impl StockLedger for PostgresStockLedger {
    async fn get(&self, key: StockKey) -> LedgerResult<Option<StockLevel>> {
        self.fetch(key, "get_stock_level").await
    }

    async fn list_by_org(&self, org_id: OrgId) -> LedgerResult<Vec<StockLevel>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM stock_levels
            WHERE org_id = $1
            ORDER BY branch_id, product_id
            "#,
        )
        .bind(org_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_stock_levels", e))?;

        rows.iter().map(|r| decode(r, "list_stock_levels")).collect()
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn adjust(&self, key: StockKey, delta: i64) -> LedgerResult<StockLevel> {
        if delta == 0 {
            return Err(DomainError::validation("delta cannot be zero").into());
        }

        if delta > 0 {
            let row = sqlx::query(
                r#"
                INSERT INTO stock_levels
                    (org_id, branch_id, product_id, quantity, reserved, min_stock, version, updated_at)
                VALUES ($1, $2, $3, $4, 0, $5, 1, now())
                ON CONFLICT (org_id, branch_id, product_id) DO UPDATE
                SET quantity = stock_levels.quantity + EXCLUDED.quantity,
                    version = stock_levels.version + 1,
                    updated_at = now()
                RETURNING *
                "#,
            )
            .bind(key.org_id.as_uuid())
            .bind(key.branch_id.as_uuid())
            .bind(key.product_id.as_uuid())
            .bind(delta)
            .bind(self.default_min_stock)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("adjust_stock", e))?;
            return decode(&row, "adjust_stock");
        }

        self.conditional(
            r#"
            UPDATE stock_levels
            SET quantity = quantity + $4, version = version + 1, updated_at = now()
            WHERE org_id = $1 AND branch_id = $2 AND product_id = $3
              AND quantity + $4 >= reserved
            RETURNING *
            "#,
            key,
            delta,
            "adjust_stock",
        )
        .await?
        .ok_or_else(|| DomainError::insufficient_stock(key.product_id).into())
    }

    #[instrument(skip(self), fields(key = %key, expected = ?expected), err)]
    async fn adjust_at(
        &self,
        key: StockKey,
        delta: i64,
        expected: ExpectedVersion,
    ) -> LedgerResult<StockLevel> {
        if delta == 0 {
            return Err(DomainError::validation("delta cannot be zero").into());
        }
        let version = match expected {
            ExpectedVersion::Any => return self.adjust(key, delta).await,
            ExpectedVersion::Exact(version) => version,
        };

        if version == 0 {
            if delta < 0 {
                return Err(DomainError::insufficient_stock(key.product_id).into());
            }
            let row = sqlx::query(
                r#"
                INSERT INTO stock_levels
                    (org_id, branch_id, product_id, quantity, reserved, min_stock, version, updated_at)
                VALUES ($1, $2, $3, $4, 0, $5, 1, now())
                ON CONFLICT (org_id, branch_id, product_id) DO NOTHING
                RETURNING *
                "#,
            )
            .bind(key.org_id.as_uuid())
            .bind(key.branch_id.as_uuid())
            .bind(key.product_id.as_uuid())
            .bind(delta)
            .bind(self.default_min_stock)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("adjust_stock_at", e))?;

            return match row {
                Some(row) => decode(&row, "adjust_stock_at"),
                None => Err(LedgerError::conflict(format!("stock level {key} already exists"))),
            };
        }

        let row = sqlx::query(
            r#"
            UPDATE stock_levels
            SET quantity = quantity + $4, version = version + 1, updated_at = now()
            WHERE org_id = $1 AND branch_id = $2 AND product_id = $3
              AND version = $5 AND quantity + $4 >= reserved
            RETURNING *
            "#,
        )
        .bind(key.org_id.as_uuid())
        .bind(key.branch_id.as_uuid())
        .bind(key.product_id.as_uuid())
        .bind(delta)
        .bind(version as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("adjust_stock_at", e))?;

        if let Some(row) = row {
            return decode(&row, "adjust_stock_at");
        }
        match self.fetch(key, "adjust_stock_at").await? {
            Some(level) if level.version == version => {
                Err(DomainError::insufficient_stock(key.product_id).into())
            }
            _ => Err(LedgerError::conflict(format!(
                "stock level {key} is not at version {version}"
            ))),
        }
    }

    /// One upsert: the conflict arm recomputes the average from the row it
    /// locks, so concurrent receipts each fold in the other's quantity.
    #[instrument(skip(self), fields(key = %key), err)]
    async fn receive(
        &self,
        key: StockKey,
        qty: i64,
        average: Option<AverageReceipt>,
    ) -> LedgerResult<StockLevel> {
        ensure_positive_qty(qty)?;
        if average.is_some_and(|r| r.unit_cost < 0) {
            return Err(DomainError::validation("unit cost must be >= 0").into());
        }
        let first_average = average.map(|r| {
            r.average_after(&StockLevel::empty(key, self.default_min_stock, Utc::now()), qty)
        });

        let row = sqlx::query(
            r#"
            INSERT INTO stock_levels
                (org_id, branch_id, product_id, quantity, reserved, min_stock,
                 average_cost, version, updated_at)
            VALUES ($1, $2, $3, $4, 0, $5, $6, 1, now())
            ON CONFLICT (org_id, branch_id, product_id) DO UPDATE
            SET quantity = stock_levels.quantity + EXCLUDED.quantity,
                average_cost = CASE
                    WHEN $7::bigint IS NULL THEN stock_levels.average_cost
                    ELSE div(
                        GREATEST(stock_levels.quantity, 0)::numeric
                            * COALESCE(NULLIF(stock_levels.average_cost, 0), $8)::numeric
                            + EXCLUDED.quantity::numeric * $7::numeric,
                        (GREATEST(stock_levels.quantity, 0) + EXCLUDED.quantity)::numeric
                    )::bigint
                END,
                version = stock_levels.version + 1,
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(key.org_id.as_uuid())
        .bind(key.branch_id.as_uuid())
        .bind(key.product_id.as_uuid())
        .bind(qty)
        .bind(self.default_min_stock)
        .bind(first_average)
        .bind(average.map(|r| r.unit_cost))
        .bind(average.map_or(0, |r| r.fallback_average))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("receive_stock", e))?;

        decode(&row, "receive_stock")
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn reserve(&self, key: StockKey, qty: i64) -> LedgerResult<StockLevel> {
        ensure_positive_qty(qty)?;
        self.conditional(
            r#"
            UPDATE stock_levels
            SET reserved = reserved + $4, version = version + 1, updated_at = now()
            WHERE org_id = $1 AND branch_id = $2 AND product_id = $3
              AND quantity - reserved >= $4
            RETURNING *
            "#,
            key,
            qty,
            "reserve_stock",
        )
        .await?
        .ok_or_else(|| DomainError::insufficient_stock(key.product_id).into())
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn release(&self, key: StockKey, qty: i64) -> LedgerResult<StockLevel> {
        ensure_positive_qty(qty)?;
        if let Some(level) = self
            .conditional(
                r#"
                UPDATE stock_levels
                SET reserved = reserved - $4, version = version + 1, updated_at = now()
                WHERE org_id = $1 AND branch_id = $2 AND product_id = $3
                  AND reserved >= $4
                RETURNING *
                "#,
                key,
                qty,
                "release_stock",
            )
            .await?
        {
            return Ok(level);
        }

        match self.fetch(key, "release_stock").await? {
            None => Err(Self::not_found(key)),
            Some(level) => Err(LedgerError::conflict(format!(
                "cannot release {qty} from reserved {} for {key}",
                level.reserved
            ))),
        }
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn commit(&self, key: StockKey, qty: i64) -> LedgerResult<StockLevel> {
        ensure_positive_qty(qty)?;
        if let Some(level) = self
            .conditional(
                r#"
                UPDATE stock_levels
                SET quantity = quantity - $4,
                    reserved = reserved - $4,
                    version = version + 1,
                    updated_at = now()
                WHERE org_id = $1 AND branch_id = $2 AND product_id = $3
                  AND quantity >= $4 AND reserved >= $4
                RETURNING *
                "#,
                key,
                qty,
                "commit_stock",
            )
            .await?
        {
            return Ok(level);
        }

        match self.fetch(key, "commit_stock").await? {
            None => Err(Self::not_found(key)),
            Some(level) if level.quantity < qty => {
                Err(DomainError::insufficient_stock(key.product_id).into())
            }
            Some(level) => Err(LedgerError::conflict(format!(
                "cannot commit {qty} with only {} reserved for {key}",
                level.reserved
            ))),
        }
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn uncommit(&self, key: StockKey, qty: i64) -> LedgerResult<StockLevel> {
        ensure_positive_qty(qty)?;
        self.conditional(
            r#"
            UPDATE stock_levels
            SET quantity = quantity + $4,
                reserved = reserved + $4,
                version = version + 1,
                updated_at = now()
            WHERE org_id = $1 AND branch_id = $2 AND product_id = $3
            RETURNING *
            "#,
            key,
            qty,
            "uncommit_stock",
        )
        .await?
        .ok_or_else(|| Self::not_found(key))
    }

    #[instrument(skip(self), fields(key = %key, expected = ?expected), err)]
    async fn set_average_cost(
        &self,
        key: StockKey,
        average_cost: i64,
        expected: ExpectedVersion,
    ) -> LedgerResult<StockLevel> {
        if average_cost < 0 {
            return Err(DomainError::validation("average cost must be >= 0").into());
        }

        let row = match expected {
            ExpectedVersion::Exact(0) => sqlx::query(
                r#"
                INSERT INTO stock_levels
                    (org_id, branch_id, product_id, quantity, reserved, min_stock,
                     average_cost, version, updated_at)
                VALUES ($1, $2, $3, 0, 0, $5, $4, 1, now())
                ON CONFLICT (org_id, branch_id, product_id) DO NOTHING
                RETURNING *
                "#,
            )
            .bind(key.org_id.as_uuid())
            .bind(key.branch_id.as_uuid())
            .bind(key.product_id.as_uuid())
            .bind(average_cost)
            .bind(self.default_min_stock),
            ExpectedVersion::Exact(version) => sqlx::query(
                r#"
                UPDATE stock_levels
                SET average_cost = $4, version = version + 1, updated_at = now()
                WHERE org_id = $1 AND branch_id = $2 AND product_id = $3
                  AND version = $5
                RETURNING *
                "#,
            )
            .bind(key.org_id.as_uuid())
            .bind(key.branch_id.as_uuid())
            .bind(key.product_id.as_uuid())
            .bind(average_cost)
            .bind(version as i64),
            ExpectedVersion::Any => sqlx::query(
                r#"
                INSERT INTO stock_levels
                    (org_id, branch_id, product_id, quantity, reserved, min_stock,
                     average_cost, version, updated_at)
                VALUES ($1, $2, $3, 0, 0, $5, $4, 1, now())
                ON CONFLICT (org_id, branch_id, product_id) DO UPDATE
                SET average_cost = EXCLUDED.average_cost,
                    version = stock_levels.version + 1,
                    updated_at = now()
                RETURNING *
                "#,
            )
            .bind(key.org_id.as_uuid())
            .bind(key.branch_id.as_uuid())
            .bind(key.product_id.as_uuid())
            .bind(average_cost)
            .bind(self.default_min_stock),
        }
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_average_cost", e))?;

        match row {
            Some(row) => decode(&row, "set_average_cost"),
            None => Err(LedgerError::conflict(format!(
                "stock level {key} is not at version {expected:?}"
            ))),
        }
    }
}

// SQLx row types

#[derive(Debug)]
struct StockLevelRow {
    org_id: uuid::Uuid,
    branch_id: uuid::Uuid,
    product_id: uuid::Uuid,
    quantity: i64,
    reserved: i64,
    min_stock: i64,
    average_cost: Option<i64>,
    version: i64,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for StockLevelRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(StockLevelRow {
            org_id: row.try_get("org_id")?,
            branch_id: row.try_get("branch_id")?,
            product_id: row.try_get("product_id")?,
            quantity: row.try_get("quantity")?,
            reserved: row.try_get("reserved")?,
            min_stock: row.try_get("min_stock")?,
            average_cost: row.try_get("average_cost")?,
            version: row.try_get("version")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<StockLevelRow> for StockLevel {
    fn from(row: StockLevelRow) -> Self {
        StockLevel {
            key: StockKey::new(
                OrgId::from_uuid(row.org_id),
                BranchId::from_uuid(row.branch_id),
                ProductId::from_uuid(row.product_id),
            ),
            quantity: row.quantity,
            reserved: row.reserved,
            min_stock: row.min_stock,
            average_cost: row.average_cost,
            version: row.version as u64,
            updated_at: row.updated_at,
        }
    }
}

fn decode(row: &PgRow, operation: &str) -> LedgerResult<StockLevel> {
    use sqlx::FromRow;
    StockLevelRow::from_row(row)
        .map(StockLevel::from)
        .map_err(|e| LedgerError::backend(format!("failed to decode stock level in {operation}: {e}")))
}
