use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, FromRow, PgPool, Row};
use tracing::instrument;

use stockflow_core::{BranchId, OrgId, TransferId};
use stockflow_inventory::{StockTransfer, TransferChange, TransferStatus};

use super::TransferStore;
use crate::error::{map_sqlx_error, LedgerError, LedgerResult};

/// Transfers as rows with JSONB lines.
///
/// A transition reads the row, applies the change in memory and writes it back
/// with `WHERE version = <read version>`; losing that race is `Conflict`.
#[derive(Debug, Clone)]
pub struct PostgresTransferStore {
    pool: PgPool,
}

impl PostgresTransferStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn transfer_not_found(transfer_id: TransferId) -> LedgerError {
    LedgerError::not_found(format!("transfer {transfer_id}"))
}

fn encode_lines(transfer: &StockTransfer) -> LedgerResult<serde_json::Value> {
    serde_json::to_value(&transfer.lines)
        .map_err(|e| LedgerError::backend(format!("failed to encode transfer lines: {e}")))
}

#[async_trait]
impl TransferStore for PostgresTransferStore {
    async fn insert(&self, transfer: StockTransfer) -> LedgerResult<StockTransfer> {
        let lines = encode_lines(&transfer)?;
        let row = sqlx::query(
            r#"
            INSERT INTO stock_transfers (
                id, org_id, reference_no, from_branch_id, to_branch_id, status, lines, notes,
                sent_at, received_at, cancelled_at, cancellation_reason,
                version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING *
            "#,
        )
        .bind(transfer.id.as_uuid())
        .bind(transfer.org_id.as_uuid())
        .bind(&transfer.reference_no)
        .bind(transfer.from_branch_id.as_uuid())
        .bind(transfer.to_branch_id.as_uuid())
        .bind(transfer.status.as_str())
        .bind(lines)
        .bind(&transfer.notes)
        .bind(transfer.sent_at)
        .bind(transfer.received_at)
        .bind(transfer.cancelled_at)
        .bind(&transfer.cancellation_reason)
        .bind(transfer.version as i64)
        .bind(transfer.created_at)
        .bind(transfer.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_transfer", e))?;

        decode(&row, "insert_transfer")
    }

    async fn get(&self, org_id: OrgId, transfer_id: TransferId) -> LedgerResult<StockTransfer> {
        let row = sqlx::query("SELECT * FROM stock_transfers WHERE id = $1 AND org_id = $2")
            .bind(transfer_id.as_uuid())
            .bind(org_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_transfer", e))?
            .ok_or_else(|| transfer_not_found(transfer_id))?;
        decode(&row, "get_transfer")
    }

    async fn list(&self, org_id: OrgId, status: Option<TransferStatus>) -> LedgerResult<Vec<StockTransfer>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM stock_transfers
            WHERE org_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(org_id.as_uuid())
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_transfers", e))?;

        rows.iter().map(|r| decode(r, "list_transfers")).collect()
    }

    #[instrument(skip(self, from, change), fields(transfer_id = %transfer_id, to = ?change.status), err)]
    async fn transition(
        &self,
        org_id: OrgId,
        transfer_id: TransferId,
        from: &[TransferStatus],
        change: TransferChange,
    ) -> LedgerResult<StockTransfer> {
        let mut transfer = self.get(org_id, transfer_id).await?;
        if !from.contains(&transfer.status) {
            return Err(LedgerError::conflict(format!(
                "transfer {} is {}, expected one of {from:?}",
                transfer.reference_no, transfer.status
            )));
        }
        let read_version = transfer.version;
        transfer.apply(change, Utc::now());
        let lines = encode_lines(&transfer)?;

        let row = sqlx::query(
            r#"
            UPDATE stock_transfers
            SET status = $4,
                lines = $5,
                notes = $6,
                sent_at = $7,
                received_at = $8,
                cancelled_at = $9,
                cancellation_reason = $10,
                version = version + 1,
                updated_at = $11
            WHERE id = $1 AND org_id = $2 AND version = $3
            RETURNING *
            "#,
        )
        .bind(transfer_id.as_uuid())
        .bind(org_id.as_uuid())
        .bind(read_version as i64)
        .bind(transfer.status.as_str())
        .bind(lines)
        .bind(&transfer.notes)
        .bind(transfer.sent_at)
        .bind(transfer.received_at)
        .bind(transfer.cancelled_at)
        .bind(&transfer.cancellation_reason)
        .bind(transfer.updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition_transfer", e))?;

        match row {
            Some(row) => decode(&row, "transition_transfer"),
            None => Err(LedgerError::conflict(format!(
                "transfer {} changed concurrently",
                transfer.reference_no
            ))),
        }
    }
}

// SQLx row types

#[derive(Debug)]
struct TransferRow {
    id: uuid::Uuid,
    org_id: uuid::Uuid,
    reference_no: String,
    from_branch_id: uuid::Uuid,
    to_branch_id: uuid::Uuid,
    status: String,
    lines: serde_json::Value,
    notes: Option<String>,
    sent_at: Option<DateTime<Utc>>,
    received_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    cancellation_reason: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for TransferRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TransferRow {
            id: row.try_get("id")?,
            org_id: row.try_get("org_id")?,
            reference_no: row.try_get("reference_no")?,
            from_branch_id: row.try_get("from_branch_id")?,
            to_branch_id: row.try_get("to_branch_id")?,
            status: row.try_get("status")?,
            lines: row.try_get("lines")?,
            notes: row.try_get("notes")?,
            sent_at: row.try_get("sent_at")?,
            received_at: row.try_get("received_at")?,
            cancelled_at: row.try_get("cancelled_at")?,
            cancellation_reason: row.try_get("cancellation_reason")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<TransferRow> for StockTransfer {
    type Error = LedgerError;

    fn try_from(row: TransferRow) -> Result<Self, Self::Error> {
        Ok(StockTransfer {
            id: TransferId::from_uuid(row.id),
            org_id: OrgId::from_uuid(row.org_id),
            reference_no: row.reference_no,
            from_branch_id: BranchId::from_uuid(row.from_branch_id),
            to_branch_id: BranchId::from_uuid(row.to_branch_id),
            status: row.status.parse::<TransferStatus>()?,
            lines: serde_json::from_value(row.lines).map_err(|e| {
                LedgerError::backend(format!("failed to decode transfer lines of {}: {e}", row.id))
            })?,
            notes: row.notes,
            sent_at: row.sent_at,
            received_at: row.received_at,
            cancelled_at: row.cancelled_at,
            cancellation_reason: row.cancellation_reason,
            version: row.version as u64,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode(row: &PgRow, operation: &str) -> LedgerResult<StockTransfer> {
    TransferRow::from_row(row)
        .map_err(|e| LedgerError::backend(format!("failed to decode transfer in {operation}: {e}")))?
        .try_into()
}
