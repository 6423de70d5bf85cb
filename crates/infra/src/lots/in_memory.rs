use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use stockflow_core::{DomainResult, LotId, OrgId};
use stockflow_inventory::{InventoryLot, NewLot, StockKey};

use super::LotStore;
use crate::error::{poisoned, LedgerError, LedgerResult};

/// In-memory lot ledger for tests/dev. Lots are never removed except by
/// `delete_lot`; depleted lots stay for history.
#[derive(Debug, Default)]
pub struct InMemoryLotStore {
    inner: RwLock<HashMap<LotId, InventoryLot>>,
}

impl InMemoryLotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate<F>(&self, org_id: OrgId, lot_id: LotId, f: F) -> LedgerResult<InventoryLot>
    where
        F: FnOnce(&mut InventoryLot) -> DomainResult<()>,
    {
        let mut map = self.inner.write().map_err(poisoned)?;
        let lot = map
            .get_mut(&lot_id)
            .filter(|l| l.key.org_id == org_id)
            .ok_or_else(|| lot_not_found(lot_id))?;
        let mut next = lot.clone();
        f(&mut next)?;
        *lot = next.clone();
        Ok(next)
    }

    fn fifo_ordered(&self, key: StockKey, open_only: bool) -> LedgerResult<Vec<InventoryLot>> {
        let map = self.inner.read().map_err(poisoned)?;
        let mut lots: Vec<InventoryLot> = map
            .values()
            .filter(|l| l.key == key && (!open_only || l.is_open()))
            .cloned()
            .collect();
        lots.sort_by_key(InventoryLot::fifo_key);
        Ok(lots)
    }
}

fn lot_not_found(lot_id: LotId) -> LedgerError {
    LedgerError::not_found(format!("lot {lot_id}"))
}

#[async_trait]
impl LotStore for InMemoryLotStore {
    async fn create_lot(&self, lot: NewLot) -> LedgerResult<InventoryLot> {
        let lot = InventoryLot::create(lot, Utc::now())?;
        let mut map = self.inner.write().map_err(poisoned)?;
        map.insert(lot.id, lot.clone());
        Ok(lot)
    }

    async fn get_lot(&self, org_id: OrgId, lot_id: LotId) -> LedgerResult<Option<InventoryLot>> {
        let map = self.inner.read().map_err(poisoned)?;
        Ok(map.get(&lot_id).filter(|l| l.key.org_id == org_id).cloned())
    }

    async fn find_oldest_open(&self, key: StockKey) -> LedgerResult<InventoryLot> {
        let map = self.inner.read().map_err(poisoned)?;
        map.values()
            .filter(|l| l.key == key && l.is_open())
            .min_by_key(|l| l.fifo_key())
            .cloned()
            .ok_or_else(|| LedgerError::not_found(format!("open lot for {key}")))
    }

    async fn list_lots(&self, key: StockKey, open_only: bool) -> LedgerResult<Vec<InventoryLot>> {
        self.fifo_ordered(key, open_only)
    }

    async fn open_quantity(&self, key: StockKey) -> LedgerResult<i64> {
        let map = self.inner.read().map_err(poisoned)?;
        Ok(map
            .values()
            .filter(|l| l.key == key)
            .map(|l| l.qty_remaining)
            .sum())
    }

    async fn decrement_remaining(
        &self,
        org_id: OrgId,
        lot_id: LotId,
        qty: i64,
    ) -> LedgerResult<InventoryLot> {
        self.mutate(org_id, lot_id, |l| l.decrement(qty, Utc::now()))
    }

    async fn increment_remaining(
        &self,
        org_id: OrgId,
        lot_id: LotId,
        qty: i64,
    ) -> LedgerResult<InventoryLot> {
        self.mutate(org_id, lot_id, |l| l.increment(qty, Utc::now()))
    }

    async fn delete_lot(&self, org_id: OrgId, lot_id: LotId) -> LedgerResult<()> {
        let mut map = self.inner.write().map_err(poisoned)?;
        match map.get(&lot_id) {
            Some(lot) if lot.key.org_id == org_id => {
                map.remove(&lot_id);
                Ok(())
            }
            _ => Err(lot_not_found(lot_id)),
        }
    }
}
