//! Postgres-backed order store.
//!
//! Lines and cost lines are JSONB columns. The commit flags are plain boolean
//! columns so the lock is a single conditional `UPDATE`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, FromRow, PgPool, Row};
use tracing::instrument;

use stockflow_core::{BranchId, ExpectedVersion, OrderId, OrgId};
use stockflow_sales::{Order, OrderStatus, StockCommit};

use super::{CommitLock, OrderStore};
use crate::error::{map_sqlx_error, LedgerError, LedgerResult};

#[derive(Debug, Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, org_id: OrgId, order_id: OrderId, operation: &str) -> LedgerResult<Option<Order>> {
        let row = sqlx::query("SELECT * FROM orders WHERE id = $1 AND org_id = $2")
            .bind(order_id.as_uuid())
            .bind(org_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        row.map(|r| decode(&r, operation)).transpose()
    }

    /// Explain why a conditional write on an order matched no row.
    async fn refused(&self, org_id: OrgId, order_id: OrderId, operation: &str) -> LedgerError {
        match self.fetch(org_id, order_id, operation).await {
            Ok(None) => order_not_found(order_id),
            Ok(Some(order)) if order.stock_commit_in_progress => LedgerError::conflict(format!(
                "order {order_id} is locked by a stock commit"
            )),
            Ok(Some(order)) => LedgerError::conflict(format!(
                "order {order_id} changed concurrently (now version {}, status {})",
                order.version, order.status
            )),
            Err(err) => err,
        }
    }
}

fn order_not_found(order_id: OrderId) -> LedgerError {
    LedgerError::not_found(format!("order {order_id}"))
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> LedgerResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| LedgerError::backend(format!("failed to encode {what}: {e}")))
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn insert(&self, order: Order) -> LedgerResult<Order> {
        let row = sqlx::query(
            r#"
            INSERT INTO orders (
                id, org_id, branch_id, status, lines, total, cogs, profit, cost_lines,
                stock_committed, stock_commit_in_progress, cancellation_reason,
                version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING *
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.org_id.as_uuid())
        .bind(order.branch_id.as_uuid())
        .bind(order.status.as_str())
        .bind(to_json(&order.lines, "order lines")?)
        .bind(order.total)
        .bind(order.cogs)
        .bind(order.profit)
        .bind(to_json(&order.cost_lines, "cost lines")?)
        .bind(order.stock_committed)
        .bind(order.stock_commit_in_progress)
        .bind(order.cancellation_reason.as_deref())
        .bind(order.version as i64)
        .bind(order.created_at)
        .bind(order.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_order", e))?;

        decode(&row, "insert_order")
    }

    async fn get(&self, org_id: OrgId, order_id: OrderId) -> LedgerResult<Order> {
        self.fetch(org_id, order_id, "get_order")
            .await?
            .ok_or_else(|| order_not_found(order_id))
    }

    #[instrument(skip(self), fields(order_id = %order_id), err)]
    async fn lock_for_stock_commit(&self, org_id: OrgId, order_id: OrderId) -> LedgerResult<CommitLock> {
        let committable: Vec<String> = OrderStatus::ALL
            .iter()
            .filter(|s| s.is_committable())
            .map(|s| s.as_str().to_string())
            .collect();

        let row = sqlx::query(
            r#"
            UPDATE orders
            SET stock_commit_in_progress = true, version = version + 1, updated_at = now()
            WHERE id = $1 AND org_id = $2
              AND stock_committed = false
              AND stock_commit_in_progress = false
              AND status = ANY($3)
            RETURNING *
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(org_id.as_uuid())
        .bind(committable)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("lock_for_stock_commit", e))?;

        if let Some(row) = row {
            return Ok(CommitLock::Acquired(decode(&row, "lock_for_stock_commit")?));
        }

        let Some(order) = self.fetch(org_id, order_id, "lock_for_stock_commit").await? else {
            return Err(order_not_found(order_id));
        };
        if order.stock_committed {
            return Ok(CommitLock::AlreadyCommitted(order));
        }
        order.ensure_committable()?;
        Err(self.refused(org_id, order_id, "lock_for_stock_commit").await)
    }

    #[instrument(skip(self), fields(order_id = %order_id), err)]
    async fn unlock_stock_commit(&self, org_id: OrgId, order_id: OrderId) -> LedgerResult<Order> {
        let row = sqlx::query(
            r#"
            UPDATE orders
            SET stock_commit_in_progress = false, version = version + 1, updated_at = now()
            WHERE id = $1 AND org_id = $2 AND stock_commit_in_progress = true
            RETURNING *
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(org_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("unlock_stock_commit", e))?;

        match row {
            Some(row) => decode(&row, "unlock_stock_commit"),
            None => match self.fetch(org_id, order_id, "unlock_stock_commit").await? {
                None => Err(order_not_found(order_id)),
                Some(_) => Err(LedgerError::conflict(format!(
                    "order {order_id} does not hold the commit lock"
                ))),
            },
        }
    }

    #[instrument(skip(self, commit), fields(order_id = %order_id, total_cogs = commit.total_cogs), err)]
    async fn complete_stock_commit(
        &self,
        org_id: OrgId,
        order_id: OrderId,
        commit: StockCommit,
    ) -> LedgerResult<Order> {
        // Lines are immutable after creation; the write below is conditional on the lock.
        let mut order = self.get(org_id, order_id).await?;
        order.apply_commit(commit, Utc::now())?;

        let row = sqlx::query(
            r#"
            UPDATE orders
            SET lines = $3,
                cogs = $4,
                profit = $5,
                cost_lines = $6,
                status = $7,
                stock_committed = true,
                stock_commit_in_progress = false,
                version = version + 1,
                updated_at = now()
            WHERE id = $1 AND org_id = $2
              AND stock_commit_in_progress = true
              AND stock_committed = false
            RETURNING *
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(org_id.as_uuid())
        .bind(to_json(&order.lines, "order lines")?)
        .bind(order.cogs)
        .bind(order.profit)
        .bind(to_json(&order.cost_lines, "cost lines")?)
        .bind(order.status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete_stock_commit", e))?;

        match row {
            Some(row) => decode(&row, "complete_stock_commit"),
            None => Err(self.refused(org_id, order_id, "complete_stock_commit").await),
        }
    }

    #[instrument(skip(self, reason), fields(order_id = %order_id, status = %status), err)]
    async fn update_status(
        &self,
        org_id: OrgId,
        order_id: OrderId,
        expected: ExpectedVersion,
        status: OrderStatus,
        reason: Option<String>,
    ) -> LedgerResult<Order> {
        let row = sqlx::query(
            r#"
            UPDATE orders
            SET status = $3,
                cancellation_reason = COALESCE($4, cancellation_reason),
                version = version + 1,
                updated_at = now()
            WHERE id = $1 AND org_id = $2
              AND stock_commit_in_progress = false
              AND ($5::BIGINT IS NULL OR version = $5)
            RETURNING *
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(org_id.as_uuid())
        .bind(status.as_str())
        .bind(reason)
        .bind(expected.as_option().map(|v| v as i64))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_order_status", e))?;

        match row {
            Some(row) => decode(&row, "update_order_status"),
            None => Err(self.refused(org_id, order_id, "update_order_status").await),
        }
    }
}

// SQLx row types

#[derive(Debug)]
struct OrderRow {
    id: uuid::Uuid,
    org_id: uuid::Uuid,
    branch_id: uuid::Uuid,
    status: String,
    lines: serde_json::Value,
    total: i64,
    cogs: i64,
    profit: i64,
    cost_lines: serde_json::Value,
    stock_committed: bool,
    stock_commit_in_progress: bool,
    cancellation_reason: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for OrderRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OrderRow {
            id: row.try_get("id")?,
            org_id: row.try_get("org_id")?,
            branch_id: row.try_get("branch_id")?,
            status: row.try_get("status")?,
            lines: row.try_get("lines")?,
            total: row.try_get("total")?,
            cogs: row.try_get("cogs")?,
            profit: row.try_get("profit")?,
            cost_lines: row.try_get("cost_lines")?,
            stock_committed: row.try_get("stock_committed")?,
            stock_commit_in_progress: row.try_get("stock_commit_in_progress")?,
            cancellation_reason: row.try_get("cancellation_reason")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<OrderRow> for Order {
    type Error = LedgerError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let decode_err = |what: &str, e: serde_json::Error| {
            LedgerError::backend(format!("failed to decode {what} of order {}: {e}", row.id))
        };
        Ok(Order {
            id: OrderId::from_uuid(row.id),
            org_id: OrgId::from_uuid(row.org_id),
            branch_id: BranchId::from_uuid(row.branch_id),
            status: row.status.parse::<OrderStatus>()?,
            lines: serde_json::from_value(row.lines).map_err(|e| decode_err("lines", e))?,
            total: row.total,
            cogs: row.cogs,
            profit: row.profit,
            cost_lines: serde_json::from_value(row.cost_lines)
                .map_err(|e| decode_err("cost lines", e))?,
            stock_committed: row.stock_committed,
            stock_commit_in_progress: row.stock_commit_in_progress,
            cancellation_reason: row.cancellation_reason,
            version: row.version as u64,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode(row: &PgRow, operation: &str) -> LedgerResult<Order> {
    OrderRow::from_row(row)
        .map_err(|e| LedgerError::backend(format!("failed to decode order in {operation}: {e}")))?
        .try_into()
}
