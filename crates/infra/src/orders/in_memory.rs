use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use stockflow_core::{DomainResult, ExpectedVersion, OrderId, OrgId};
use stockflow_sales::{Order, OrderStatus, StockCommit};

use super::{CommitLock, OrderStore};
use crate::error::{poisoned, LedgerError, LedgerResult};

#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    inner: RwLock<HashMap<(OrgId, OrderId), Order>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on a copy of the order under the write lock; keep the copy only on success.
    fn mutate<T, F>(&self, org_id: OrgId, order_id: OrderId, f: F) -> LedgerResult<(Order, T)>
    where
        F: FnOnce(&mut Order) -> DomainResult<T>,
    {
        let mut map = self.inner.write().map_err(poisoned)?;
        let order = map
            .get_mut(&(org_id, order_id))
            .ok_or_else(|| order_not_found(order_id))?;
        let mut next = order.clone();
        let out = f(&mut next)?;
        *order = next.clone();
        Ok((next, out))
    }
}

fn order_not_found(order_id: OrderId) -> LedgerError {
    LedgerError::not_found(format!("order {order_id}"))
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn insert(&self, order: Order) -> LedgerResult<Order> {
        let mut map = self.inner.write().map_err(poisoned)?;
        let key = (order.org_id, order.id);
        if map.contains_key(&key) {
            return Err(LedgerError::conflict(format!("order {} already exists", order.id)));
        }
        map.insert(key, order.clone());
        Ok(order)
    }

    async fn get(&self, org_id: OrgId, order_id: OrderId) -> LedgerResult<Order> {
        let map = self.inner.read().map_err(poisoned)?;
        map.get(&(org_id, order_id))
            .cloned()
            .ok_or_else(|| order_not_found(order_id))
    }

    async fn lock_for_stock_commit(&self, org_id: OrgId, order_id: OrderId) -> LedgerResult<CommitLock> {
        let (order, acquired) =
            self.mutate(org_id, order_id, |o| o.acquire_commit_lock(Utc::now()))?;
        Ok(if acquired {
            CommitLock::Acquired(order)
        } else {
            CommitLock::AlreadyCommitted(order)
        })
    }

    async fn unlock_stock_commit(&self, org_id: OrgId, order_id: OrderId) -> LedgerResult<Order> {
        self.mutate(org_id, order_id, |o| o.release_commit_lock(Utc::now()))
            .map(|(order, _)| order)
    }

    async fn complete_stock_commit(
        &self,
        org_id: OrgId,
        order_id: OrderId,
        commit: StockCommit,
    ) -> LedgerResult<Order> {
        self.mutate(org_id, order_id, |o| o.apply_commit(commit, Utc::now()))
            .map(|(order, _)| order)
    }

    async fn update_status(
        &self,
        org_id: OrgId,
        order_id: OrderId,
        expected: ExpectedVersion,
        status: OrderStatus,
        reason: Option<String>,
    ) -> LedgerResult<Order> {
        self.mutate(org_id, order_id, |o| {
            expected.check(o.version)?;
            o.set_status(status, reason, Utc::now())
        })
        .map(|(order, _)| order)
    }
}
