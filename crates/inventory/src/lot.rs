use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockflow_core::{
    ensure_positive_qty, AggregateRoot, DomainError, DomainResult, LotId, PurchaseOrderId,
};

use crate::stock::StockKey;

/// Where a lot's stock came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LotSource {
    Po,
    Initial,
    Transfer,
    Return,
    Adjustment,
    Manual,
}

impl LotSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LotSource::Po => "PO",
            LotSource::Initial => "INITIAL",
            LotSource::Transfer => "TRANSFER",
            LotSource::Return => "RETURN",
            LotSource::Adjustment => "ADJUSTMENT",
            LotSource::Manual => "MANUAL",
        }
    }
}

impl core::str::FromStr for LotSource {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PO" => Ok(LotSource::Po),
            "INITIAL" => Ok(LotSource::Initial),
            "TRANSFER" => Ok(LotSource::Transfer),
            "RETURN" => Ok(LotSource::Return),
            "ADJUSTMENT" => Ok(LotSource::Adjustment),
            "MANUAL" => Ok(LotSource::Manual),
            other => Err(DomainError::validation(format!("unknown lot source: {other}"))),
        }
    }
}

/// Input for appending a lot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLot {
    pub key: StockKey,
    pub source: LotSource,
    pub unit_cost: i64,
    pub qty_received: i64,
    /// FIFO position; defaults to creation time.
    pub received_at: Option<DateTime<Utc>>,
    pub purchase_order_id: Option<PurchaseOrderId>,
    pub reference_no: Option<String>,
}

impl NewLot {
    pub fn new(key: StockKey, source: LotSource, qty_received: i64, unit_cost: i64) -> Self {
        Self {
            key,
            source,
            unit_cost,
            qty_received,
            received_at: None,
            purchase_order_id: None,
            reference_no: None,
        }
    }

    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = Some(at);
        self
    }

    pub fn purchase_order(mut self, id: PurchaseOrderId, reference_no: impl Into<String>) -> Self {
        self.purchase_order_id = Some(id);
        self.reference_no = Some(reference_no.into());
        self
    }

    pub fn reference(mut self, reference_no: impl Into<String>) -> Self {
        self.reference_no = Some(reference_no.into());
        self
    }
}

/// A FIFO batch of received stock.
///
/// `qty_received` never changes after creation. `qty_remaining` only goes down
/// (FIFO consumption) except when a failed consumption is compensated, and is
/// always within `0..=qty_received`. Depleted lots are kept for history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryLot {
    pub id: LotId,
    #[serde(flatten)]
    pub key: StockKey,
    pub source: LotSource,
    pub purchase_order_id: Option<PurchaseOrderId>,
    pub reference_no: Option<String>,
    pub unit_cost: i64,
    pub qty_received: i64,
    pub qty_remaining: i64,
    pub received_at: DateTime<Utc>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InventoryLot {
    pub fn create(input: NewLot, now: DateTime<Utc>) -> DomainResult<Self> {
        ensure_positive_qty(input.qty_received)?;
        if input.unit_cost < 0 {
            return Err(DomainError::validation("unit cost must be >= 0"));
        }
        Ok(Self {
            id: LotId::new(),
            key: input.key,
            source: input.source,
            purchase_order_id: input.purchase_order_id,
            reference_no: input.reference_no,
            unit_cost: input.unit_cost,
            qty_received: input.qty_received,
            qty_remaining: input.qty_received,
            received_at: input.received_at.unwrap_or(now),
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_open(&self) -> bool {
        self.qty_remaining > 0
    }

    pub fn is_depleted(&self) -> bool {
        self.qty_remaining == 0
    }

    /// Consumption order: oldest receipt first, id breaks ties.
    pub fn fifo_key(&self) -> (DateTime<Utc>, LotId) {
        (self.received_at, self.id)
    }

    /// Take `qty` units; fails with `Conflict` when fewer remain.
    pub fn decrement(&mut self, qty: i64, now: DateTime<Utc>) -> DomainResult<()> {
        ensure_positive_qty(qty)?;
        if self.qty_remaining < qty {
            return Err(DomainError::conflict(format!(
                "lot {} has {} remaining, cannot take {qty}",
                self.id, self.qty_remaining
            )));
        }
        self.qty_remaining -= qty;
        self.touch(now);
        Ok(())
    }

    /// Give back `qty` units taken by a consumption that is being rolled back.
    pub fn increment(&mut self, qty: i64, now: DateTime<Utc>) -> DomainResult<()> {
        ensure_positive_qty(qty)?;
        if self.qty_remaining + qty > self.qty_received {
            return Err(DomainError::invariant(format!(
                "lot {} would hold {} of {} received",
                self.id,
                self.qty_remaining + qty,
                self.qty_received
            )));
        }
        self.qty_remaining += qty;
        self.touch(now);
        Ok(())
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }
}

impl AggregateRoot for InventoryLot {
    type Id = LotId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}
