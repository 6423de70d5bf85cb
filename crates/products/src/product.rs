use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockflow_core::{AggregateRoot, DomainError, DomainResult, OrgId, ProductId};

/// How cost of goods sold is determined for a product.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CostingMethod {
    /// Consume received lots oldest-first.
    #[default]
    Fifo,
    /// Charge the running weighted-average cost; lots are never touched.
    MovingAverage,
}

impl CostingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CostingMethod::Fifo => "FIFO",
            CostingMethod::MovingAverage => "MOVING_AVERAGE",
        }
    }
}

impl core::fmt::Display for CostingMethod {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for CostingMethod {
    type Err = DomainError;

    /// An empty value means FIFO, matching the unset default.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "" | "FIFO" => Ok(CostingMethod::Fifo),
            "MOVING_AVERAGE" => Ok(CostingMethod::MovingAverage),
            other => Err(DomainError::validation(format!("unknown costing method: {other}"))),
        }
    }
}

/// Catalog record: the fields of a product the cost ledger reads and maintains.
///
/// Money amounts are integers in the smallest currency unit (e.g. cents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub org_id: OrgId,
    pub sku: String,
    pub name: String,
    /// Selling price.
    pub price: i64,
    /// Last known purchase cost (refreshed on every purchase receipt).
    pub cost: i64,
    #[serde(default)]
    pub costing_method: CostingMethod,
    /// Cached product-level moving average. The branch stock level is authoritative.
    #[serde(default)]
    pub average_cost: i64,
    /// Running on-hand counter kept for moving-average products.
    #[serde(default)]
    pub total_quantity: i64,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for registering a product with the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProduct {
    pub org_id: OrgId,
    pub sku: String,
    pub name: String,
    pub price: i64,
    pub cost: i64,
    #[serde(default)]
    pub costing_method: CostingMethod,
}

impl Product {
    pub fn create(input: NewProduct, now: DateTime<Utc>) -> DomainResult<Self> {
        if input.sku.trim().is_empty() {
            return Err(DomainError::validation("sku cannot be empty"));
        }
        if input.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if input.price < 0 || input.cost < 0 {
            return Err(DomainError::validation("price and cost must be >= 0"));
        }

        Ok(Self {
            id: ProductId::new(),
            org_id: input.org_id,
            sku: input.sku.trim().to_string(),
            name: input.name.trim().to_string(),
            price: input.price,
            cost: input.cost,
            costing_method: input.costing_method,
            average_cost: 0,
            total_quantity: 0,
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn uses_moving_average(&self) -> bool {
        self.costing_method == CostingMethod::MovingAverage
    }

    /// Refresh the cached moving average after a receipt of `received_qty` units.
    pub fn record_receipt_average(&mut self, average_cost: i64, received_qty: i64, now: DateTime<Utc>) {
        self.average_cost = average_cost;
        self.total_quantity += received_qty;
        self.touch(now);
    }

    /// Running quantity drops on sale, floored at zero. The average never moves on sale.
    pub fn record_sale(&mut self, sold_qty: i64, now: DateTime<Utc>) {
        self.total_quantity = (self.total_quantity - sold_qty).max(0);
        self.touch(now);
    }

    /// Last purchase cost; the fallback price of adjustment lots.
    pub fn set_cost(&mut self, cost: i64, now: DateTime<Utc>) -> DomainResult<()> {
        if cost < 0 {
            return Err(DomainError::validation("cost must be >= 0"));
        }
        self.cost = cost;
        self.touch(now);
        Ok(())
    }

    pub fn switch_costing(
        &mut self,
        method: CostingMethod,
        average_cost: Option<i64>,
        now: DateTime<Utc>,
    ) {
        self.costing_method = method;
        if let Some(average_cost) = average_cost {
            self.average_cost = average_cost;
        }
        self.touch(now);
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }
}

impl AggregateRoot for Product {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}
