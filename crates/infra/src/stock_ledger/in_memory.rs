use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use stockflow_core::{DomainError, DomainResult, ExpectedVersion, OrgId};
use stockflow_inventory::{AverageReceipt, StockKey, StockLevel};

use super::StockLedger;
use crate::config::DEFAULT_MIN_STOCK;
use crate::error::{poisoned, LedgerError, LedgerResult};

/// What to do when a mutated key has no level yet.
#[derive(Clone, Copy)]
enum Missing {
    Create,
    Fail(fn(&StockKey) -> LedgerError),
}

/// In-memory stock ledger for tests/dev.
///
/// Each operation runs its predicate and mutation on a copy of the level under
/// one write lock and stores the copy only if the predicate held.
#[derive(Debug)]
pub struct InMemoryStockLedger {
    default_min_stock: i64,
    inner: RwLock<HashMap<StockKey, StockLevel>>,
}

impl InMemoryStockLedger {
    pub fn new(default_min_stock: i64) -> Self {
        Self {
            default_min_stock,
            inner: RwLock::new(HashMap::new()),
        }
    }

    fn mutate<F>(&self, key: StockKey, missing: Missing, f: F) -> LedgerResult<StockLevel>
    where
        F: FnOnce(&mut StockLevel) -> DomainResult<()>,
    {
        let mut map = self.inner.write().map_err(poisoned)?;
        let mut level = match (map.get(&key), missing) {
            (Some(existing), _) => existing.clone(),
            (None, Missing::Create) => StockLevel::empty(key, self.default_min_stock, Utc::now()),
            (None, Missing::Fail(err)) => return Err(err(&key)),
        };
        f(&mut level)?;
        level.check_invariants()?;
        map.insert(key, level.clone());
        Ok(level)
    }
}

impl Default for InMemoryStockLedger {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_STOCK)
    }
}

fn level_not_found(key: &StockKey) -> LedgerError {
    LedgerError::not_found(format!("stock level {key}"))
}

fn nothing_to_reserve(key: &StockKey) -> LedgerError {
    DomainError::insufficient_stock(key.product_id).into()
}

#[async_trait]
impl StockLedger for InMemoryStockLedger {
    async fn get(&self, key: StockKey) -> LedgerResult<Option<StockLevel>> {
        let map = self.inner.read().map_err(poisoned)?;
        Ok(map.get(&key).cloned())
    }

    async fn list_by_org(&self, org_id: OrgId) -> LedgerResult<Vec<StockLevel>> {
        let map = self.inner.read().map_err(poisoned)?;
        let mut levels: Vec<StockLevel> = map
            .values()
            .filter(|l| l.key.org_id == org_id)
            .cloned()
            .collect();
        levels.sort_by_key(|l| (l.key.branch_id, l.key.product_id));
        Ok(levels)
    }

    async fn adjust(&self, key: StockKey, delta: i64) -> LedgerResult<StockLevel> {
        self.mutate(key, Missing::Create, |l| l.adjust(delta, Utc::now()))
    }

    async fn adjust_at(
        &self,
        key: StockKey,
        delta: i64,
        expected: ExpectedVersion,
    ) -> LedgerResult<StockLevel> {
        self.mutate(key, Missing::Create, |l| l.adjust_at(delta, expected, Utc::now()))
    }

    async fn receive(
        &self,
        key: StockKey,
        qty: i64,
        average: Option<AverageReceipt>,
    ) -> LedgerResult<StockLevel> {
        self.mutate(key, Missing::Create, |l| l.receive(qty, average, Utc::now()))
    }

    async fn reserve(&self, key: StockKey, qty: i64) -> LedgerResult<StockLevel> {
        self.mutate(key, Missing::Fail(nothing_to_reserve), |l| {
            l.reserve(qty, Utc::now())
        })
    }

    async fn release(&self, key: StockKey, qty: i64) -> LedgerResult<StockLevel> {
        self.mutate(key, Missing::Fail(level_not_found), |l| {
            l.release(qty, Utc::now())
        })
    }

    async fn commit(&self, key: StockKey, qty: i64) -> LedgerResult<StockLevel> {
        self.mutate(key, Missing::Fail(level_not_found), |l| {
            l.commit(qty, Utc::now())
        })
    }

    async fn uncommit(&self, key: StockKey, qty: i64) -> LedgerResult<StockLevel> {
        self.mutate(key, Missing::Fail(level_not_found), |l| {
            l.uncommit(qty, Utc::now())
        })
    }

    async fn set_average_cost(
        &self,
        key: StockKey,
        average_cost: i64,
        expected: ExpectedVersion,
    ) -> LedgerResult<StockLevel> {
        self.mutate(key, Missing::Create, |l| {
            expected.check(l.version)?;
            l.set_average_cost(average_cost, Utc::now())
        })
    }
}
