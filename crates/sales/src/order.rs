use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockflow_core::{
    checked_amount, checked_total, ensure_positive_qty, AggregateRoot, BranchId, DomainError,
    DomainResult, OrderId, OrgId, ProductId,
};
use stockflow_inventory::CostLine;

/// Sales order fulfillment lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Draft,
    Pending,
    Confirmed,
    Shipped,
    Delivered,
    Cancelled,
    Returned,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 7] = [
        OrderStatus::Draft,
        OrderStatus::Pending,
        OrderStatus::Confirmed,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
        OrderStatus::Cancelled,
        OrderStatus::Returned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Draft => "DRAFT",
            OrderStatus::Pending => "PENDING",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Shipped => "SHIPPED",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Returned => "RETURNED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Returned)
    }

    /// Statuses a delivery commit may start from.
    pub fn is_committable(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Confirmed | OrderStatus::Shipped | OrderStatus::Delivered
        )
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown order status: {s}")))
    }
}

/// Order line. Prices and costs are in the smallest currency unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub quantity: i64,
    pub unit_price: i64,
    /// Per-unit COGS, set when stock is committed.
    #[serde(default)]
    pub unit_cost: i64,
    /// Total COGS charged for this line, set when stock is committed.
    #[serde(default)]
    pub line_cost: i64,
}

impl OrderLine {
    pub fn new(product_id: ProductId, quantity: i64, unit_price: i64) -> Self {
        Self {
            product_id,
            quantity,
            unit_price,
            unit_cost: 0,
            line_cost: 0,
        }
    }

    pub fn line_total(&self) -> DomainResult<i64> {
        checked_amount(self.quantity, self.unit_price)
    }

    /// Per-unit cost a restocked unit of this line is valued at.
    pub fn restock_unit_cost(&self) -> i64 {
        if self.quantity > 0 {
            self.line_cost / self.quantity
        } else {
            0
        }
    }
}

/// Input for creating an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    pub org_id: OrgId,
    pub branch_id: BranchId,
    pub lines: Vec<OrderLine>,
    /// Draft orders skip reservation.
    #[serde(default)]
    pub draft: bool,
}

/// Costing outcome for one order line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSettlement {
    pub unit_cost: i64,
    pub line_cost: i64,
}

/// Everything a successful delivery commit persists on the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockCommit {
    /// One entry per order line, same order as `Order::lines`.
    pub lines: Vec<LineSettlement>,
    pub cost_lines: Vec<CostLine>,
    pub total_cogs: i64,
}

/// Sales order document with its fulfillment flags.
///
/// `stock_committed` flips false to true once; `stock_commit_in_progress` is the
/// exclusive lock held for the duration of one commit sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub org_id: OrgId,
    pub branch_id: BranchId,
    pub status: OrderStatus,
    pub lines: Vec<OrderLine>,
    pub total: i64,
    #[serde(default)]
    pub cogs: i64,
    #[serde(default)]
    pub profit: i64,
    #[serde(default)]
    pub cost_lines: Vec<CostLine>,
    #[serde(default)]
    pub stock_committed: bool,
    #[serde(default)]
    pub stock_commit_in_progress: bool,
    #[serde(default)]
    pub cancellation_reason: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn create(input: NewOrder, now: DateTime<Utc>) -> DomainResult<Self> {
        if input.lines.is_empty() {
            return Err(DomainError::validation("order must have at least one line"));
        }
        for line in &input.lines {
            ensure_positive_qty(line.quantity)?;
            if line.unit_price < 0 {
                return Err(DomainError::validation("unit price must be >= 0"));
            }
        }

        let lines: Vec<OrderLine> = input
            .lines
            .into_iter()
            .map(|l| OrderLine::new(l.product_id, l.quantity, l.unit_price))
            .collect();
        let total = checked_total(
            lines
                .iter()
                .map(OrderLine::line_total)
                .collect::<DomainResult<Vec<_>>>()?,
        )?;

        Ok(Self {
            id: OrderId::new(),
            org_id: input.org_id,
            branch_id: input.branch_id,
            status: if input.draft {
                OrderStatus::Draft
            } else {
                OrderStatus::Pending
            },
            lines,
            total,
            cogs: 0,
            profit: 0,
            cost_lines: Vec::new(),
            stock_committed: false,
            stock_commit_in_progress: false,
            cancellation_reason: None,
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    /// Whether the order's lines currently hold reservations on the stock ledger.
    pub fn holds_reservations(&self) -> bool {
        !self.stock_committed && !matches!(self.status, OrderStatus::Draft) && !self.status.is_terminal()
    }

    /// Reject a delivery commit from a status that never reserved stock.
    pub fn ensure_committable(&self) -> DomainResult<()> {
        if self.status.is_committable() {
            Ok(())
        } else {
            Err(DomainError::validation(format!(
                "order {} cannot be delivered from status {}",
                self.id, self.status
            )))
        }
    }

    /// Status an order lands in when cancelled.
    pub fn cancel_target(&self) -> OrderStatus {
        if self.stock_committed || matches!(self.status, OrderStatus::Shipped | OrderStatus::Delivered) {
            OrderStatus::Returned
        } else {
            OrderStatus::Cancelled
        }
    }

    /// Check a status change that has no stock effect.
    pub fn ensure_can_advance(&self, to: OrderStatus) -> DomainResult<()> {
        let ok = match to {
            OrderStatus::Confirmed => self.status == OrderStatus::Pending,
            OrderStatus::Shipped => {
                matches!(self.status, OrderStatus::Pending | OrderStatus::Confirmed)
            }
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(DomainError::validation(format!(
                "cannot move order {} from {} to {to}",
                self.id, self.status
            )))
        }
    }

    /// Take the exclusive commit lock.
    ///
    /// `Ok(false)` means the order is already committed and nothing was changed;
    /// a lock held by another commit is `Conflict`.
    pub fn acquire_commit_lock(&mut self, now: DateTime<Utc>) -> DomainResult<bool> {
        if self.stock_committed {
            return Ok(false);
        }
        if self.stock_commit_in_progress {
            return Err(DomainError::conflict(format!(
                "stock commit already in progress for order {}",
                self.id
            )));
        }
        self.ensure_committable()?;
        self.stock_commit_in_progress = true;
        self.touch(now);
        Ok(true)
    }

    /// Drop the commit lock without committing, leaving the order retryable.
    pub fn release_commit_lock(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.stock_commit_in_progress {
            return Err(DomainError::conflict(format!(
                "order {} does not hold the commit lock",
                self.id
            )));
        }
        self.stock_commit_in_progress = false;
        self.touch(now);
        Ok(())
    }

    /// Status change outside the commit path. Refused while a commit holds the lock.
    pub fn set_status(
        &mut self,
        status: OrderStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.stock_commit_in_progress {
            return Err(DomainError::conflict(format!(
                "order {} is being committed",
                self.id
            )));
        }
        self.status = status;
        if reason.is_some() {
            self.cancellation_reason = reason;
        }
        self.touch(now);
        Ok(())
    }

    /// Record a finished commit: line costs, COGS, profit and the committed flag.
    /// Requires the commit lock.
    pub fn apply_commit(&mut self, commit: StockCommit, now: DateTime<Utc>) -> DomainResult<()> {
        if self.stock_committed || !self.stock_commit_in_progress {
            return Err(DomainError::conflict(format!(
                "order {} does not hold the commit lock",
                self.id
            )));
        }
        if commit.lines.len() != self.lines.len() {
            return Err(DomainError::invariant(format!(
                "commit settles {} lines, order {} has {}",
                commit.lines.len(),
                self.id,
                self.lines.len()
            )));
        }
        for (line, settled) in self.lines.iter_mut().zip(commit.lines) {
            line.unit_cost = settled.unit_cost;
            line.line_cost = settled.line_cost;
        }
        self.cogs = commit.total_cogs;
        self.profit = self.total - commit.total_cogs;
        self.cost_lines = commit.cost_lines;
        self.stock_committed = true;
        self.stock_commit_in_progress = false;
        self.status = OrderStatus::Delivered;
        self.touch(now);
        Ok(())
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use stockflow_core::LotId;

    fn new_order(draft: bool, lines: Vec<OrderLine>) -> NewOrder {
        NewOrder {
            org_id: OrgId::new(),
            branch_id: BranchId::new(),
            lines,
            draft,
        }
    }

    #[test]
    fn create_computes_total_and_status() {
        let p = ProductId::new();
        let order = Order::create(
            new_order(false, vec![OrderLine::new(p, 2, 500), OrderLine::new(p, 1, 250)]),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(order.total, 1250);
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(order.holds_reservations());

        let draft = Order::create(new_order(true, vec![OrderLine::new(p, 1, 1)]), Utc::now()).unwrap();
        assert_eq!(draft.status, OrderStatus::Draft);
        assert!(!draft.holds_reservations());
    }

    #[test]
    fn create_rejects_empty_and_zero_qty() {
        assert!(matches!(
            Order::create(new_order(false, vec![]), Utc::now()),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            Order::create(new_order(false, vec![OrderLine::new(ProductId::new(), 0, 1)]), Utc::now()),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn create_rejects_totals_that_overflow() {
        let p = ProductId::new();
        assert!(matches!(
            Order::create(new_order(false, vec![OrderLine::new(p, 3, i64::MAX / 2)]), Utc::now()),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            Order::create(
                new_order(false, vec![OrderLine::new(p, 1, i64::MAX), OrderLine::new(p, 1, 1)]),
                Utc::now()
            ),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn apply_commit_sets_costs_and_profit() {
        let p = ProductId::new();
        let mut order =
            Order::create(new_order(false, vec![OrderLine::new(p, 7, 200)]), Utc::now()).unwrap();
        order.stock_commit_in_progress = true;

        let lot_a = LotId::new();
        let lot_b = LotId::new();
        order
            .apply_commit(
                StockCommit {
                    lines: vec![LineSettlement {
                        unit_cost: 105,
                        line_cost: 740,
                    }],
                    cost_lines: vec![
                        CostLine::from_lot(p, lot_a, 5, 100).unwrap(),
                        CostLine::from_lot(p, lot_b, 2, 120).unwrap(),
                    ],
                    total_cogs: 740,
                },
                Utc::now(),
            )
            .unwrap();

        assert!(order.stock_committed);
        assert!(!order.stock_commit_in_progress);
        assert_eq!(order.status, OrderStatus::Delivered);
        assert_eq!(order.profit, 1400 - 740);
        assert_eq!(order.lines[0].restock_unit_cost(), 105);
        assert_eq!(order.version, 2);
    }

    #[test]
    fn apply_commit_rejects_mismatched_lines() {
        let mut order =
            Order::create(new_order(false, vec![OrderLine::new(ProductId::new(), 1, 1)]), Utc::now())
                .unwrap();
        order.stock_commit_in_progress = true;
        let err = order
            .apply_commit(
                StockCommit {
                    lines: vec![],
                    cost_lines: vec![],
                    total_cogs: 0,
                },
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert!(!order.stock_committed);
    }

    #[test]
    fn commit_lock_is_exclusive_and_idempotent_after_commit() {
        let p = ProductId::new();
        let mut order =
            Order::create(new_order(false, vec![OrderLine::new(p, 1, 10)]), Utc::now()).unwrap();

        assert!(order.acquire_commit_lock(Utc::now()).unwrap());
        assert!(matches!(
            order.acquire_commit_lock(Utc::now()),
            Err(DomainError::Conflict(_))
        ));
        assert!(matches!(
            order.set_status(OrderStatus::Cancelled, None, Utc::now()),
            Err(DomainError::Conflict(_))
        ));

        order.release_commit_lock(Utc::now()).unwrap();
        assert!(order.release_commit_lock(Utc::now()).is_err());

        assert!(order.acquire_commit_lock(Utc::now()).unwrap());
        order
            .apply_commit(
                StockCommit {
                    lines: vec![LineSettlement { unit_cost: 4, line_cost: 4 }],
                    cost_lines: vec![],
                    total_cogs: 4,
                },
                Utc::now(),
            )
            .unwrap();
        let before = order.clone();
        assert!(!order.acquire_commit_lock(Utc::now()).unwrap());
        assert_eq!(order, before);
    }

    #[test]
    fn draft_cannot_take_commit_lock() {
        let mut order =
            Order::create(new_order(true, vec![OrderLine::new(ProductId::new(), 1, 1)]), Utc::now())
                .unwrap();
        assert!(matches!(
            order.acquire_commit_lock(Utc::now()),
            Err(DomainError::Validation(_))
        ));
        assert!(!order.stock_commit_in_progress);
    }

    #[test]
    fn cancel_target_depends_on_shipment() {
        let mut order =
            Order::create(new_order(false, vec![OrderLine::new(ProductId::new(), 1, 1)]), Utc::now())
                .unwrap();
        assert_eq!(order.cancel_target(), OrderStatus::Cancelled);
        order.status = OrderStatus::Shipped;
        assert_eq!(order.cancel_target(), OrderStatus::Returned);
    }

    #[test]
    fn advance_rules() {
        let mut order =
            Order::create(new_order(false, vec![OrderLine::new(ProductId::new(), 1, 1)]), Utc::now())
                .unwrap();
        assert!(order.ensure_can_advance(OrderStatus::Confirmed).is_ok());
        assert!(order.ensure_can_advance(OrderStatus::Delivered).is_err());
        order.status = OrderStatus::Cancelled;
        assert!(order.ensure_can_advance(OrderStatus::Shipped).is_err());
        assert!(order.ensure_committable().is_err());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in OrderStatus::ALL {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        #[test]
        fn profit_is_total_minus_cogs(
            qtys in prop::collection::vec(1i64..50, 1..6),
            price in 0i64..10_000,
            cost in 0i64..10_000,
        ) {
            let p = ProductId::new();
            let lines: Vec<OrderLine> = qtys.iter().map(|q| OrderLine::new(p, *q, price)).collect();
            let mut order = Order::create(new_order(false, lines), Utc::now()).unwrap();
            prop_assert!(order.acquire_commit_lock(Utc::now()).unwrap());

            let settlements: Vec<LineSettlement> = qtys
                .iter()
                .map(|q| LineSettlement { unit_cost: cost, line_cost: q * cost })
                .collect();
            let total_cogs: i64 = settlements.iter().map(|s| s.line_cost).sum();
            order.apply_commit(
                StockCommit { lines: settlements, cost_lines: vec![], total_cogs },
                Utc::now(),
            ).unwrap();

            prop_assert_eq!(order.profit, order.total - total_cogs);
            prop_assert_eq!(order.total, qtys.iter().sum::<i64>() * price);
        }
    }
}
