use serde::{Deserialize, Serialize};

use stockflow_core::{checked_amount, checked_total, DomainError, DomainResult, LotId, ProductId};

/// Lot reference written on a cost line for moving-average charges.
pub const AVERAGE_LOT_REF: &str = "AVERAGE";

/// What a cost line was charged against: a real lot, or the moving average.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum LotRef {
    Lot(LotId),
    Average,
}

impl LotRef {
    pub fn lot_id(&self) -> Option<LotId> {
        match self {
            LotRef::Lot(id) => Some(*id),
            LotRef::Average => None,
        }
    }
}

impl core::fmt::Display for LotRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LotRef::Lot(id) => core::fmt::Display::fmt(id, f),
            LotRef::Average => f.write_str(AVERAGE_LOT_REF),
        }
    }
}

impl From<LotRef> for String {
    fn from(value: LotRef) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for LotRef {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == AVERAGE_LOT_REF {
            return Ok(LotRef::Average);
        }
        Ok(LotRef::Lot(value.parse()?))
    }
}

/// Settlement record: `quantity` units of `product_id` charged at `unit_cost`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostLine {
    pub product_id: ProductId,
    pub lot_id: LotRef,
    pub quantity: i64,
    pub unit_cost: i64,
    pub amount: i64,
}

impl CostLine {
    pub fn from_lot(
        product_id: ProductId,
        lot_id: LotId,
        quantity: i64,
        unit_cost: i64,
    ) -> DomainResult<Self> {
        Ok(Self {
            product_id,
            lot_id: LotRef::Lot(lot_id),
            quantity,
            unit_cost,
            amount: checked_amount(quantity, unit_cost)?,
        })
    }

    pub fn average(product_id: ProductId, quantity: i64, average_cost: i64) -> DomainResult<Self> {
        Ok(Self {
            product_id,
            lot_id: LotRef::Average,
            quantity,
            unit_cost: average_cost,
            amount: checked_amount(quantity, average_cost)?,
        })
    }
}

/// Cost of goods sold for one sale line.
///
/// The cost lines are authoritative; `unit_cost` is `total_cogs / quantity` with
/// integer division, so any remainder stays in the total only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CogsResult {
    pub cost_lines: Vec<CostLine>,
    pub total_cogs: i64,
    pub unit_cost: i64,
}

impl CogsResult {
    pub fn from_lines(cost_lines: Vec<CostLine>) -> DomainResult<Self> {
        let total_cogs = checked_total(cost_lines.iter().map(|l| l.amount))?;
        let quantity: i64 = cost_lines.iter().map(|l| l.quantity).sum();
        let unit_cost = if quantity > 0 { total_cogs / quantity } else { 0 };
        Ok(Self {
            cost_lines,
            total_cogs,
            unit_cost,
        })
    }

    pub fn quantity(&self) -> i64 {
        self.cost_lines.iter().map(|l| l.quantity).sum()
    }

    /// `Σ quantity == qty` and `Σ amount == total_cogs`.
    pub fn reconciles(&self, qty: i64) -> bool {
        self.quantity() == qty && self.cost_lines.iter().map(|l| l.amount).sum::<i64>() == self.total_cogs
    }
}

/// Weighted average after receiving `new_qty` units at `new_unit_cost`.
///
/// `(old_qty*old_avg + new_qty*new_unit_cost) / (old_qty + new_qty)`, integer division.
pub fn moving_average(old_qty: i64, old_avg: i64, new_qty: i64, new_unit_cost: i64) -> i64 {
    let old_qty = old_qty.max(0);
    if old_qty + new_qty <= 0 {
        return new_unit_cost;
    }
    let total_value = i128::from(old_qty) * i128::from(old_avg)
        + i128::from(new_qty) * i128::from(new_unit_cost);
    (total_value / i128::from(old_qty + new_qty)) as i64
}

/// Weighted average of `(qty, unit_cost)` pairs; `None` when no quantity.
pub fn weighted_average<I>(parts: I) -> Option<i64>
where
    I: IntoIterator<Item = (i64, i64)>,
{
    let (value, qty) = parts
        .into_iter()
        .filter(|(q, _)| *q > 0)
        .fold((0i128, 0i64), |(v, q), (qty, cost)| {
            (v + i128::from(qty) * i128::from(cost), q + qty)
        });
    (qty > 0).then(|| (value / i128::from(qty)) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moving_average_weights_by_quantity() {
        let first = moving_average(0, 0, 10, 100);
        assert_eq!(first, 100);
        assert_eq!(moving_average(10, first, 10, 200), 150);
    }

    #[test]
    fn moving_average_with_nothing_on_hand_takes_new_cost() {
        assert_eq!(moving_average(0, 999, 0, 42), 42);
        assert_eq!(moving_average(-3, 999, 4, 42), 42);
    }

    #[test]
    fn from_lines_sums_and_divides() {
        let p = ProductId::new();
        let r = CogsResult::from_lines(vec![
            CostLine::from_lot(p, LotId::new(), 5, 100).unwrap(),
            CostLine::from_lot(p, LotId::new(), 2, 120).unwrap(),
        ])
        .unwrap();
        assert_eq!(r.total_cogs, 740);
        assert_eq!(r.unit_cost, 105);
        assert!(r.reconciles(7));
        assert!(!r.reconciles(8));
    }

    #[test]
    fn lot_ref_serializes_average_marker() {
        let line = CostLine::average(ProductId::new(), 5, 150).unwrap();
        let json = serde_json::to_value(&line).unwrap();
        assert_eq!(json["lot_id"], "AVERAGE");
        assert_eq!(json["amount"], 750);

        let back: CostLine = serde_json::from_value(json).unwrap();
        assert_eq!(back.lot_id, LotRef::Average);
    }

    #[test]
    fn oversized_amounts_are_rejected_not_wrapped() {
        let p = ProductId::new();
        assert!(matches!(
            CostLine::from_lot(p, LotId::new(), i64::MAX / 2, 3),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            CostLine::average(p, 4, i64::MAX / 3),
            Err(DomainError::Validation(_))
        ));

        let big = CostLine::average(p, 1, i64::MAX).unwrap();
        assert!(matches!(
            CogsResult::from_lines(vec![big.clone(), big]),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn weighted_average_ignores_empty_parts() {
        assert_eq!(weighted_average([(0, 500), (4, 100), (4, 200)]), Some(150));
        assert_eq!(weighted_average(Vec::<(i64, i64)>::new()), None);
    }
}
