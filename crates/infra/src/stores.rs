//! Store wiring: the in-memory or Postgres backends behind one bundle.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use crate::catalog::{InMemoryProductCatalog, PostgresProductCatalog, ProductCatalog};
use crate::config::LedgerConfig;
use crate::counters::{CounterStore, InMemoryCounterStore, PostgresCounterStore};
use crate::lots::{InMemoryLotStore, LotStore, PostgresLotStore};
use crate::movements::{InMemoryMovementStore, MovementStore, PostgresMovementStore};
use crate::orders::{InMemoryOrderStore, OrderStore, PostgresOrderStore};
use crate::purchase_orders::{
    InMemoryPurchaseOrderStore, PostgresPurchaseOrderStore, PurchaseOrderStore,
};
use crate::stock_ledger::{InMemoryStockLedger, PostgresStockLedger, StockLedger};
use crate::transfers::{InMemoryTransferStore, PostgresTransferStore, TransferStore};

/// Schema for the Postgres backend.
pub const SCHEMA: &str = include_str!("../migrations/0001_stock_ledger.sql");

/// Every store the ledger services use, as shared trait objects.
#[derive(Clone)]
pub struct LedgerStores {
    pub stock: Arc<dyn StockLedger>,
    pub lots: Arc<dyn LotStore>,
    pub catalog: Arc<dyn ProductCatalog>,
    pub orders: Arc<dyn OrderStore>,
    pub purchase_orders: Arc<dyn PurchaseOrderStore>,
    pub counters: Arc<dyn CounterStore>,
    pub transfers: Arc<dyn TransferStore>,
    pub movements: Arc<dyn MovementStore>,
}

impl LedgerStores {
    pub fn in_memory(config: &LedgerConfig) -> Self {
        Self {
            stock: Arc::new(InMemoryStockLedger::new(config.default_min_stock)),
            lots: Arc::new(InMemoryLotStore::new()),
            catalog: Arc::new(InMemoryProductCatalog::new()),
            orders: Arc::new(InMemoryOrderStore::new()),
            purchase_orders: Arc::new(InMemoryPurchaseOrderStore::new()),
            counters: Arc::new(InMemoryCounterStore::new()),
            transfers: Arc::new(InMemoryTransferStore::new()),
            movements: Arc::new(InMemoryMovementStore::new()),
        }
    }

    pub fn postgres(pool: PgPool, config: &LedgerConfig) -> Self {
        Self {
            stock: Arc::new(PostgresStockLedger::new(pool.clone(), config.default_min_stock)),
            lots: Arc::new(PostgresLotStore::new(pool.clone())),
            catalog: Arc::new(PostgresProductCatalog::new(pool.clone())),
            orders: Arc::new(PostgresOrderStore::new(pool.clone())),
            purchase_orders: Arc::new(PostgresPurchaseOrderStore::new(pool.clone())),
            counters: Arc::new(PostgresCounterStore::new(pool.clone())),
            transfers: Arc::new(PostgresTransferStore::new(pool.clone())),
            movements: Arc::new(PostgresMovementStore::new(pool)),
        }
    }

    /// Postgres when `database_url` is set, in-memory otherwise.
    pub async fn from_config(config: &LedgerConfig) -> anyhow::Result<Self> {
        match config.database_url.as_deref() {
            Some(url) => {
                let pool = connect(url).await?;
                apply_schema(&pool).await?;
                tracing::info!("stock ledger running on postgres");
                Ok(Self::postgres(pool, config))
            }
            None => {
                tracing::info!("stock ledger running on in-memory stores");
                Ok(Self::in_memory(config))
            }
        }
    }
}

impl std::fmt::Debug for LedgerStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStores").finish_non_exhaustive()
    }
}

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    PgPool::connect(database_url)
        .await
        .context("failed to connect to postgres")
}

/// Create the ledger tables and indexes if they do not exist yet.
pub async fn apply_schema(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .context("failed to apply stock ledger schema")?;
    Ok(())
}
