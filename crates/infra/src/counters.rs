//! Per-org document counters for human-readable reference numbers.
//!
//! One atomically incremented counter per (org, document kind); never a
//! max-scan over existing documents.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};

use stockflow_core::OrgId;

use crate::error::{map_sqlx_error, poisoned, LedgerError, LedgerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    PurchaseOrder,
    Transfer,
}

impl DocumentKind {
    pub fn counter_name(&self) -> &'static str {
        match self {
            DocumentKind::PurchaseOrder => "po",
            DocumentKind::Transfer => "transfer",
        }
    }
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment and return the counter; the first call returns 1.
    async fn next(&self, org_id: OrgId, kind: DocumentKind) -> LedgerResult<u64>;
}

#[async_trait]
impl<S> CounterStore for Arc<S>
where
    S: CounterStore + ?Sized,
{
    async fn next(&self, org_id: OrgId, kind: DocumentKind) -> LedgerResult<u64> {
        (**self).next(org_id, kind).await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    inner: RwLock<HashMap<(OrgId, DocumentKind), u64>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn next(&self, org_id: OrgId, kind: DocumentKind) -> LedgerResult<u64> {
        let mut map = self.inner.write().map_err(poisoned)?;
        let value = map.entry((org_id, kind)).or_insert(0);
        *value += 1;
        Ok(*value)
    }
}

#[derive(Debug, Clone)]
pub struct PostgresCounterStore {
    pool: PgPool,
}

impl PostgresCounterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CounterStore for PostgresCounterStore {
    async fn next(&self, org_id: OrgId, kind: DocumentKind) -> LedgerResult<u64> {
        let row = sqlx::query(
            r#"
            INSERT INTO counters (org_id, name, value)
            VALUES ($1, $2, 1)
            ON CONFLICT (org_id, name) DO UPDATE SET value = counters.value + 1
            RETURNING value
            "#,
        )
        .bind(org_id.as_uuid())
        .bind(kind.counter_name())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("next_counter", e))?;

        let value: i64 = row
            .try_get("value")
            .map_err(|e| LedgerError::backend(format!("failed to read counter value: {e}")))?;
        Ok(value as u64)
    }
}
