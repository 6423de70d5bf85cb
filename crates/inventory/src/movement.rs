use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockflow_core::{
    checked_amount, ensure_positive_qty, BranchId, DomainError, DomainResult, LotId, MovementId,
    ProductId, TransferId,
};

use crate::stock::StockKey;

/// Direction and cause of a recorded stock change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementKind {
    AdjustmentIn,
    AdjustmentOut,
    TransferOut,
    TransferIn,
}

impl MovementKind {
    /// Adjustment kind matching the sign of `delta`.
    pub fn adjustment(delta: i64) -> Self {
        if delta < 0 {
            MovementKind::AdjustmentOut
        } else {
            MovementKind::AdjustmentIn
        }
    }

    pub fn is_inbound(&self) -> bool {
        matches!(self, MovementKind::AdjustmentIn | MovementKind::TransferIn)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MovementKind::AdjustmentIn => "ADJUSTMENT_IN",
            MovementKind::AdjustmentOut => "ADJUSTMENT_OUT",
            MovementKind::TransferOut => "TRANSFER_OUT",
            MovementKind::TransferIn => "TRANSFER_IN",
        }
    }
}

impl core::str::FromStr for MovementKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADJUSTMENT_IN" => Ok(MovementKind::AdjustmentIn),
            "ADJUSTMENT_OUT" => Ok(MovementKind::AdjustmentOut),
            "TRANSFER_OUT" => Ok(MovementKind::TransferOut),
            "TRANSFER_IN" => Ok(MovementKind::TransferIn),
            other => Err(DomainError::validation(format!("unknown movement kind: {other}"))),
        }
    }
}

/// Document a movement belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reference_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementReference {
    Adjustment,
    Transfer {
        transfer_id: TransferId,
        reference_no: String,
    },
}

impl MovementReference {
    pub fn type_str(&self) -> &'static str {
        match self {
            MovementReference::Adjustment => "ADJUSTMENT",
            MovementReference::Transfer { .. } => "TRANSFER",
        }
    }
}

/// Append-only record of one stock level change.
///
/// `quantity` is the absolute change; the direction lives in `kind` and must
/// agree with `previous_quantity -> new_quantity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: MovementId,
    #[serde(flatten)]
    pub key: StockKey,
    pub kind: MovementKind,
    pub quantity: i64,
    pub previous_quantity: i64,
    pub new_quantity: i64,
    #[serde(default)]
    pub unit_cost: Option<i64>,
    #[serde(default)]
    pub total_cost: Option<i64>,
    #[serde(flatten)]
    pub reference: MovementReference,
    #[serde(default)]
    pub lot_id: Option<LotId>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StockMovement {
    pub fn new(
        key: StockKey,
        kind: MovementKind,
        previous_quantity: i64,
        new_quantity: i64,
        reference: MovementReference,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let delta = new_quantity
            .checked_sub(previous_quantity)
            .ok_or_else(|| DomainError::validation("movement quantity overflows"))?;
        let quantity = delta
            .checked_abs()
            .ok_or_else(|| DomainError::validation("movement quantity overflows"))?;
        ensure_positive_qty(quantity)?;
        if kind.is_inbound() != (delta > 0) {
            return Err(DomainError::invariant(format!(
                "{} movement cannot go from {previous_quantity} to {new_quantity}",
                kind.as_str()
            )));
        }

        Ok(Self {
            id: MovementId::new(),
            key,
            kind,
            quantity,
            previous_quantity,
            new_quantity,
            unit_cost: None,
            total_cost: None,
            reference,
            lot_id: None,
            reason: None,
            notes: None,
            created_at: now,
        })
    }

    /// Value the movement at `unit_cost` per unit.
    pub fn unit_cost(mut self, unit_cost: i64) -> DomainResult<Self> {
        if unit_cost < 0 {
            return Err(DomainError::validation("unit cost must be >= 0"));
        }
        self.total_cost = Some(checked_amount(self.quantity, unit_cost)?);
        self.unit_cost = Some(unit_cost);
        Ok(self)
    }

    pub fn lot(mut self, lot_id: Option<LotId>) -> Self {
        self.lot_id = lot_id;
        self
    }

    pub fn reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    pub fn notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes;
        self
    }
}

/// Narrows a movement listing; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementFilter {
    pub branch_id: Option<BranchId>,
    pub product_id: Option<ProductId>,
    pub kind: Option<MovementKind>,
}

impl MovementFilter {
    pub fn matches(&self, movement: &StockMovement) -> bool {
        self.branch_id.is_none_or(|b| b == movement.key.branch_id)
            && self.product_id.is_none_or(|p| p == movement.key.product_id)
            && self.kind.is_none_or(|k| k == movement.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_core::OrgId;

    fn key() -> StockKey {
        StockKey::new(OrgId::new(), BranchId::new(), ProductId::new())
    }

    #[test]
    fn quantity_is_absolute_and_cost_is_totalled() {
        let m = StockMovement::new(
            key(),
            MovementKind::AdjustmentOut,
            10,
            7,
            MovementReference::Adjustment,
            Utc::now(),
        )
        .unwrap()
        .unit_cost(40)
        .unwrap();
        assert_eq!((m.quantity, m.unit_cost, m.total_cost), (3, Some(40), Some(120)));
    }

    #[test]
    fn direction_must_match_kind() {
        let err = StockMovement::new(
            key(),
            MovementKind::TransferIn,
            5,
            2,
            MovementReference::Adjustment,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));

        assert!(matches!(
            StockMovement::new(key(), MovementKind::AdjustmentIn, 4, 4, MovementReference::Adjustment, Utc::now()),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn total_cost_overflow_is_rejected() {
        let m = StockMovement::new(
            key(),
            MovementKind::AdjustmentIn,
            0,
            3,
            MovementReference::Adjustment,
            Utc::now(),
        )
        .unwrap();
        assert!(matches!(m.unit_cost(i64::MAX / 2), Err(DomainError::Validation(_))));
    }

    #[test]
    fn wire_shape_flattens_key_and_reference() {
        let transfer_id = TransferId::new();
        let m = StockMovement::new(
            key(),
            MovementKind::TransferOut,
            6,
            2,
            MovementReference::Transfer {
                transfer_id,
                reference_no: "TRF-000001".into(),
            },
            Utc::now(),
        )
        .unwrap();
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["kind"], "TRANSFER_OUT");
        assert_eq!(json["reference_type"], "TRANSFER");
        assert_eq!(json["reference_no"], "TRF-000001");
        assert!(json["branch_id"].is_string());
        assert_eq!("ADJUSTMENT_IN".parse::<MovementKind>().unwrap(), MovementKind::AdjustmentIn);
    }

    #[test]
    fn filter_matches_on_set_fields_only() {
        let k = key();
        let m = StockMovement::new(k, MovementKind::AdjustmentIn, 0, 1, MovementReference::Adjustment, Utc::now())
            .unwrap();
        assert!(MovementFilter::default().matches(&m));
        assert!(MovementFilter {
            product_id: Some(k.product_id),
            ..MovementFilter::default()
        }
        .matches(&m));
        assert!(!MovementFilter {
            kind: Some(MovementKind::TransferIn),
            ..MovementFilter::default()
        }
        .matches(&m));
    }
}
