use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, FromRow, PgPool, Row};

use stockflow_core::{BranchId, LotId, MovementId, OrgId, ProductId, TransferId};
use stockflow_inventory::{MovementFilter, MovementKind, MovementReference, StockKey, StockMovement};

use super::MovementStore;
use crate::error::{map_sqlx_error, LedgerError, LedgerResult};

#[derive(Debug, Clone)]
pub struct PostgresMovementStore {
    pool: PgPool,
}

impl PostgresMovementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn movement_not_found(movement_id: MovementId) -> LedgerError {
    LedgerError::not_found(format!("stock movement {movement_id}"))
}

#[async_trait]
impl MovementStore for PostgresMovementStore {
    async fn record(&self, movement: StockMovement) -> LedgerResult<StockMovement> {
        let (reference_id, reference_no) = match &movement.reference {
            MovementReference::Adjustment => (None, None),
            MovementReference::Transfer {
                transfer_id,
                reference_no,
            } => (Some(uuid::Uuid::from(*transfer_id)), Some(reference_no.as_str())),
        };
        let row = sqlx::query(
            r#"
            INSERT INTO stock_movements (
                id, org_id, branch_id, product_id, kind, quantity, previous_quantity, new_quantity,
                unit_cost, total_cost, reference_type, reference_id, reference_no,
                lot_id, reason, notes, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING *
            "#,
        )
        .bind(movement.id.as_uuid())
        .bind(movement.key.org_id.as_uuid())
        .bind(movement.key.branch_id.as_uuid())
        .bind(movement.key.product_id.as_uuid())
        .bind(movement.kind.as_str())
        .bind(movement.quantity)
        .bind(movement.previous_quantity)
        .bind(movement.new_quantity)
        .bind(movement.unit_cost)
        .bind(movement.total_cost)
        .bind(movement.reference.type_str())
        .bind(reference_id)
        .bind(reference_no)
        .bind(movement.lot_id.map(uuid::Uuid::from))
        .bind(&movement.reason)
        .bind(&movement.notes)
        .bind(movement.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_movement", e))?;

        decode(&row, "record_movement")
    }

    async fn get(&self, org_id: OrgId, movement_id: MovementId) -> LedgerResult<StockMovement> {
        let row = sqlx::query("SELECT * FROM stock_movements WHERE id = $1 AND org_id = $2")
            .bind(movement_id.as_uuid())
            .bind(org_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_movement", e))?
            .ok_or_else(|| movement_not_found(movement_id))?;
        decode(&row, "get_movement")
    }

    async fn list(&self, org_id: OrgId, filter: &MovementFilter) -> LedgerResult<Vec<StockMovement>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM stock_movements
            WHERE org_id = $1
              AND ($2::uuid IS NULL OR branch_id = $2)
              AND ($3::uuid IS NULL OR product_id = $3)
              AND ($4::text IS NULL OR kind = $4)
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(org_id.as_uuid())
        .bind(filter.branch_id.map(uuid::Uuid::from))
        .bind(filter.product_id.map(uuid::Uuid::from))
        .bind(filter.kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_movements", e))?;

        rows.iter().map(|r| decode(r, "list_movements")).collect()
    }

    async fn delete(&self, org_id: OrgId, movement_id: MovementId) -> LedgerResult<()> {
        let result = sqlx::query("DELETE FROM stock_movements WHERE id = $1 AND org_id = $2")
            .bind(movement_id.as_uuid())
            .bind(org_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_movement", e))?;
        if result.rows_affected() == 0 {
            return Err(movement_not_found(movement_id));
        }
        Ok(())
    }
}

// SQLx row types

#[derive(Debug)]
struct MovementRow {
    id: uuid::Uuid,
    org_id: uuid::Uuid,
    branch_id: uuid::Uuid,
    product_id: uuid::Uuid,
    kind: String,
    quantity: i64,
    previous_quantity: i64,
    new_quantity: i64,
    unit_cost: Option<i64>,
    total_cost: Option<i64>,
    reference_type: String,
    reference_id: Option<uuid::Uuid>,
    reference_no: Option<String>,
    lot_id: Option<uuid::Uuid>,
    reason: Option<String>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for MovementRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(MovementRow {
            id: row.try_get("id")?,
            org_id: row.try_get("org_id")?,
            branch_id: row.try_get("branch_id")?,
            product_id: row.try_get("product_id")?,
            kind: row.try_get("kind")?,
            quantity: row.try_get("quantity")?,
            previous_quantity: row.try_get("previous_quantity")?,
            new_quantity: row.try_get("new_quantity")?,
            unit_cost: row.try_get("unit_cost")?,
            total_cost: row.try_get("total_cost")?,
            reference_type: row.try_get("reference_type")?,
            reference_id: row.try_get("reference_id")?,
            reference_no: row.try_get("reference_no")?,
            lot_id: row.try_get("lot_id")?,
            reason: row.try_get("reason")?,
            notes: row.try_get("notes")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<MovementRow> for StockMovement {
    type Error = LedgerError;

    fn try_from(row: MovementRow) -> Result<Self, Self::Error> {
        let reference = match (row.reference_type.as_str(), row.reference_id, row.reference_no) {
            ("ADJUSTMENT", _, _) => MovementReference::Adjustment,
            ("TRANSFER", Some(id), Some(reference_no)) => MovementReference::Transfer {
                transfer_id: TransferId::from_uuid(id),
                reference_no,
            },
            (other, _, _) => {
                return Err(LedgerError::backend(format!(
                    "stock movement {} has malformed reference {other}",
                    row.id
                )))
            }
        };

        Ok(StockMovement {
            id: MovementId::from_uuid(row.id),
            key: StockKey::new(
                OrgId::from_uuid(row.org_id),
                BranchId::from_uuid(row.branch_id),
                ProductId::from_uuid(row.product_id),
            ),
            kind: row.kind.parse::<MovementKind>()?,
            quantity: row.quantity,
            previous_quantity: row.previous_quantity,
            new_quantity: row.new_quantity,
            unit_cost: row.unit_cost,
            total_cost: row.total_cost,
            reference,
            lot_id: row.lot_id.map(LotId::from_uuid),
            reason: row.reason,
            notes: row.notes,
            created_at: row.created_at,
        })
    }
}

fn decode(row: &PgRow, operation: &str) -> LedgerResult<StockMovement> {
    MovementRow::from_row(row)
        .map_err(|e| LedgerError::backend(format!("failed to decode stock movement in {operation}: {e}")))?
        .try_into()
}
