use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, FromRow, PgPool, Row};
use tracing::instrument;

use stockflow_core::{BranchId, OrgId, PurchaseOrderId};
use stockflow_purchasing::{PurchaseOrder, PurchaseOrderStatus};

use super::PurchaseOrderStore;
use crate::error::{map_sqlx_error, LedgerError, LedgerResult};

#[derive(Debug, Clone)]
pub struct PostgresPurchaseOrderStore {
    pool: PgPool,
}

impl PostgresPurchaseOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn po_not_found(po_id: PurchaseOrderId) -> LedgerError {
    LedgerError::not_found(format!("purchase order {po_id}"))
}

#[async_trait]
impl PurchaseOrderStore for PostgresPurchaseOrderStore {
    async fn insert(&self, po: PurchaseOrder) -> LedgerResult<PurchaseOrder> {
        let lines = serde_json::to_value(&po.lines)
            .map_err(|e| LedgerError::backend(format!("failed to encode purchase lines: {e}")))?;
        let row = sqlx::query(
            r#"
            INSERT INTO purchase_orders (
                id, org_id, branch_id, reference_no, status, lines, total_cost,
                received_at, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(po.id.as_uuid())
        .bind(po.org_id.as_uuid())
        .bind(po.branch_id.as_uuid())
        .bind(&po.reference_no)
        .bind(po.status.as_str())
        .bind(lines)
        .bind(po.total_cost)
        .bind(po.received_at)
        .bind(po.version as i64)
        .bind(po.created_at)
        .bind(po.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_purchase_order", e))?;

        decode(&row, "insert_purchase_order")
    }

    async fn get(&self, org_id: OrgId, po_id: PurchaseOrderId) -> LedgerResult<PurchaseOrder> {
        let row = sqlx::query("SELECT * FROM purchase_orders WHERE id = $1 AND org_id = $2")
            .bind(po_id.as_uuid())
            .bind(org_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_purchase_order", e))?
            .ok_or_else(|| po_not_found(po_id))?;
        decode(&row, "get_purchase_order")
    }

    #[instrument(skip(self, from), fields(po_id = %po_id, to = %to), err)]
    async fn transition_status(
        &self,
        org_id: OrgId,
        po_id: PurchaseOrderId,
        from: &[PurchaseOrderStatus],
        to: PurchaseOrderStatus,
    ) -> LedgerResult<PurchaseOrder> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let row = sqlx::query(
            r#"
            UPDATE purchase_orders
            SET status = $3,
                received_at = CASE WHEN $3 = 'RECEIVED' THEN now() ELSE received_at END,
                version = version + 1,
                updated_at = now()
            WHERE id = $1 AND org_id = $2 AND status = ANY($4)
            RETURNING *
            "#,
        )
        .bind(po_id.as_uuid())
        .bind(org_id.as_uuid())
        .bind(to.as_str())
        .bind(&from)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition_purchase_order", e))?;

        match row {
            Some(row) => decode(&row, "transition_purchase_order"),
            None => {
                let current = self.get(org_id, po_id).await?;
                Err(LedgerError::conflict(format!(
                    "purchase order {} is {}, expected one of {from:?}",
                    current.reference_no, current.status
                )))
            }
        }
    }
}

// SQLx row types

#[derive(Debug)]
struct PurchaseOrderRow {
    id: uuid::Uuid,
    org_id: uuid::Uuid,
    branch_id: uuid::Uuid,
    reference_no: String,
    status: String,
    lines: serde_json::Value,
    total_cost: i64,
    received_at: Option<DateTime<Utc>>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for PurchaseOrderRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(PurchaseOrderRow {
            id: row.try_get("id")?,
            org_id: row.try_get("org_id")?,
            branch_id: row.try_get("branch_id")?,
            reference_no: row.try_get("reference_no")?,
            status: row.try_get("status")?,
            lines: row.try_get("lines")?,
            total_cost: row.try_get("total_cost")?,
            received_at: row.try_get("received_at")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<PurchaseOrderRow> for PurchaseOrder {
    type Error = LedgerError;

    fn try_from(row: PurchaseOrderRow) -> Result<Self, Self::Error> {
        Ok(PurchaseOrder {
            id: PurchaseOrderId::from_uuid(row.id),
            org_id: OrgId::from_uuid(row.org_id),
            branch_id: BranchId::from_uuid(row.branch_id),
            reference_no: row.reference_no,
            status: row.status.parse::<PurchaseOrderStatus>()?,
            lines: serde_json::from_value(row.lines).map_err(|e| {
                LedgerError::backend(format!("failed to decode purchase lines of {}: {e}", row.id))
            })?,
            total_cost: row.total_cost,
            received_at: row.received_at,
            version: row.version as u64,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode(row: &PgRow, operation: &str) -> LedgerResult<PurchaseOrder> {
    PurchaseOrderRow::from_row(row)
        .map_err(|e| {
            LedgerError::backend(format!("failed to decode purchase order in {operation}: {e}"))
        })?
        .try_into()
}
