use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockflow_core::{
    ensure_positive_qty, AggregateRoot, BranchId, DomainError, DomainResult, ExpectedVersion,
    OrgId, ProductId,
};

use crate::cost::moving_average;

/// Identity of a stock level: one counter pair per (org, branch, product).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StockKey {
    pub org_id: OrgId,
    pub branch_id: BranchId,
    pub product_id: ProductId,
}

impl StockKey {
    pub fn new(org_id: OrgId, branch_id: BranchId, product_id: ProductId) -> Self {
        Self {
            org_id,
            branch_id,
            product_id,
        }
    }
}

impl core::fmt::Display for StockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.branch_id, self.product_id)
    }
}

/// Cost of a receipt to fold into the branch moving average.
///
/// The fallbacks stand in for the previous quantity and average when the
/// branch has no level yet, and for the average when the level has none.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AverageReceipt {
    pub unit_cost: i64,
    pub fallback_qty: i64,
    pub fallback_average: i64,
}

impl AverageReceipt {
    pub fn new(unit_cost: i64, fallback_qty: i64, fallback_average: i64) -> Self {
        Self {
            unit_cost,
            fallback_qty,
            fallback_average,
        }
    }

    /// Average after receiving `qty` units into `level`.
    pub fn average_after(&self, level: &StockLevel, qty: i64) -> i64 {
        let (old_qty, old_avg) = if level.version == 0 {
            (self.fallback_qty, self.fallback_average)
        } else {
            (
                level.quantity,
                level.known_average_cost().unwrap_or(self.fallback_average),
            )
        };
        moving_average(old_qty, old_avg, qty, self.unit_cost)
    }
}

/// Authoritative quantity and reservation counters for one [`StockKey`].
///
/// Invariant: `0 <= reserved <= quantity`. Every mutator checks its predicate
/// first and leaves the level untouched when it fails, so a store can run a
/// mutator under one lock (or translate it to one conditional `UPDATE`) and get
/// compare-and-swap semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    #[serde(flatten)]
    pub key: StockKey,
    pub quantity: i64,
    pub reserved: i64,
    pub min_stock: i64,
    /// Branch-level moving-average unit cost (moving-average products only).
    pub average_cost: Option<i64>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl StockLevel {
    /// A level that does not exist yet (version 0). Stores create it lazily.
    pub fn empty(key: StockKey, min_stock: i64, now: DateTime<Utc>) -> Self {
        Self {
            key,
            quantity: 0,
            reserved: 0,
            min_stock,
            average_cost: None,
            version: 0,
            updated_at: now,
        }
    }

    /// Quantity that can still be reserved.
    pub fn available(&self) -> i64 {
        self.quantity - self.reserved
    }

    /// On hand but at or below the reorder threshold.
    pub fn is_low_stock(&self) -> bool {
        self.quantity > 0 && self.quantity <= self.min_stock
    }

    pub fn is_out_of_stock(&self) -> bool {
        self.quantity <= 0
    }

    /// Branch-level average cost, treating zero as "not set".
    pub fn known_average_cost(&self) -> Option<i64> {
        self.average_cost.filter(|c| *c > 0)
    }

    pub fn check_invariants(&self) -> DomainResult<()> {
        if self.quantity < 0 {
            return Err(DomainError::invariant(format!(
                "quantity went negative for {}",
                self.key
            )));
        }
        if self.reserved < 0 || self.reserved > self.quantity {
            return Err(DomainError::invariant(format!(
                "reserved {} outside 0..={} for {}",
                self.reserved,
                self.quantity,
                self.key
            )));
        }
        Ok(())
    }

    /// Add `delta` to quantity. Removing stock may not dip below what is reserved.
    pub fn adjust(&mut self, delta: i64, now: DateTime<Utc>) -> DomainResult<()> {
        if delta == 0 {
            return Err(DomainError::validation("delta cannot be zero"));
        }
        if delta < 0 && self.quantity + delta < self.reserved {
            return Err(DomainError::insufficient_stock(self.key.product_id));
        }
        self.quantity += delta;
        self.touch(now);
        Ok(())
    }

    /// [`StockLevel::adjust`] only if the level is still at `expected`.
    pub fn adjust_at(
        &mut self,
        delta: i64,
        expected: ExpectedVersion,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        expected.check(self.version)?;
        self.adjust(delta, now)
    }

    /// Add `qty` received units and, when `average` is given, fold their cost
    /// into the branch moving average. Both land in one version bump.
    pub fn receive(
        &mut self,
        qty: i64,
        average: Option<AverageReceipt>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        ensure_positive_qty(qty)?;
        let quantity = self
            .quantity
            .checked_add(qty)
            .ok_or_else(|| DomainError::validation(format!("quantity overflows for {}", self.key)))?;
        if let Some(receipt) = average {
            if receipt.unit_cost < 0 {
                return Err(DomainError::validation("unit cost must be >= 0"));
            }
            self.average_cost = Some(receipt.average_after(self, qty));
        }
        self.quantity = quantity;
        self.touch(now);
        Ok(())
    }

    /// Hold `qty` units: requires `quantity - reserved >= qty`.
    pub fn reserve(&mut self, qty: i64, now: DateTime<Utc>) -> DomainResult<()> {
        ensure_positive_qty(qty)?;
        if self.available() < qty {
            return Err(DomainError::insufficient_stock(self.key.product_id));
        }
        self.reserved += qty;
        self.touch(now);
        Ok(())
    }

    /// Drop a hold of `qty` units: requires `reserved >= qty`.
    pub fn release(&mut self, qty: i64, now: DateTime<Utc>) -> DomainResult<()> {
        ensure_positive_qty(qty)?;
        if self.reserved < qty {
            return Err(DomainError::conflict(format!(
                "cannot release {qty} from reserved {} for {}",
                self.reserved,
                self.key
            )));
        }
        self.reserved -= qty;
        self.touch(now);
        Ok(())
    }

    /// Turn a hold into a physical removal: decrements quantity and reserved together.
    pub fn commit(&mut self, qty: i64, now: DateTime<Utc>) -> DomainResult<()> {
        ensure_positive_qty(qty)?;
        if self.quantity < qty {
            return Err(DomainError::insufficient_stock(self.key.product_id));
        }
        if self.reserved < qty {
            return Err(DomainError::conflict(format!(
                "cannot commit {qty} with only {} reserved for {}",
                self.reserved,
                self.key
            )));
        }
        self.quantity -= qty;
        self.reserved -= qty;
        self.touch(now);
        Ok(())
    }

    /// Inverse of [`StockLevel::commit`], used only to compensate a failed commit.
    pub fn uncommit(&mut self, qty: i64, now: DateTime<Utc>) -> DomainResult<()> {
        ensure_positive_qty(qty)?;
        self.quantity += qty;
        self.reserved += qty;
        self.touch(now);
        Ok(())
    }

    pub fn set_average_cost(&mut self, average_cost: i64, now: DateTime<Utc>) -> DomainResult<()> {
        if average_cost < 0 {
            return Err(DomainError::validation("average cost must be >= 0"));
        }
        self.average_cost = Some(average_cost);
        self.touch(now);
        Ok(())
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }
}

impl AggregateRoot for StockLevel {
    type Id = StockKey;

    fn id(&self) -> &Self::Id {
        &self.key
    }

    fn version(&self) -> u64 {
        self.version
    }
}
