use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use stockflow_core::{MovementId, OrgId};
use stockflow_inventory::{MovementFilter, StockMovement};

use super::MovementStore;
use crate::error::{poisoned, LedgerError, LedgerResult};

#[derive(Debug, Default)]
pub struct InMemoryMovementStore {
    inner: RwLock<HashMap<(OrgId, MovementId), StockMovement>>,
}

impl InMemoryMovementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn movement_not_found(movement_id: MovementId) -> LedgerError {
    LedgerError::not_found(format!("stock movement {movement_id}"))
}

#[async_trait]
impl MovementStore for InMemoryMovementStore {
    async fn record(&self, movement: StockMovement) -> LedgerResult<StockMovement> {
        let mut map = self.inner.write().map_err(poisoned)?;
        let key = (movement.key.org_id, movement.id);
        if map.contains_key(&key) {
            return Err(LedgerError::conflict(format!(
                "stock movement {} already recorded",
                movement.id
            )));
        }
        map.insert(key, movement.clone());
        Ok(movement)
    }

    async fn get(&self, org_id: OrgId, movement_id: MovementId) -> LedgerResult<StockMovement> {
        let map = self.inner.read().map_err(poisoned)?;
        map.get(&(org_id, movement_id))
            .cloned()
            .ok_or_else(|| movement_not_found(movement_id))
    }

    async fn list(&self, org_id: OrgId, filter: &MovementFilter) -> LedgerResult<Vec<StockMovement>> {
        let map = self.inner.read().map_err(poisoned)?;
        let mut movements: Vec<StockMovement> = map
            .values()
            .filter(|m| m.key.org_id == org_id && filter.matches(m))
            .cloned()
            .collect();
        movements.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(movements)
    }

    async fn delete(&self, org_id: OrgId, movement_id: MovementId) -> LedgerResult<()> {
        let mut map = self.inner.write().map_err(poisoned)?;
        map.remove(&(org_id, movement_id))
            .map(|_| ())
            .ok_or_else(|| movement_not_found(movement_id))
    }
}
