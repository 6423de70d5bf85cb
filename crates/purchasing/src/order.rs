use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockflow_core::{
    checked_amount, checked_total, ensure_positive_qty, AggregateRoot, BranchId, DomainError,
    DomainResult, OrgId, ProductId, PurchaseOrderId,
};

/// Purchase order status lifecycle.
///
/// `Receiving` is held only while a receive is in flight and doubles as its lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurchaseOrderStatus {
    Open,
    Sent,
    Receiving,
    Received,
    Cancelled,
}

impl PurchaseOrderStatus {
    pub const RECEIVABLE: [PurchaseOrderStatus; 2] =
        [PurchaseOrderStatus::Open, PurchaseOrderStatus::Sent];

    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseOrderStatus::Open => "OPEN",
            PurchaseOrderStatus::Sent => "SENT",
            PurchaseOrderStatus::Receiving => "RECEIVING",
            PurchaseOrderStatus::Received => "RECEIVED",
            PurchaseOrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_receivable(&self) -> bool {
        Self::RECEIVABLE.contains(self)
    }
}

impl core::fmt::Display for PurchaseOrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for PurchaseOrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(PurchaseOrderStatus::Open),
            "SENT" => Ok(PurchaseOrderStatus::Sent),
            "RECEIVING" => Ok(PurchaseOrderStatus::Receiving),
            "RECEIVED" => Ok(PurchaseOrderStatus::Received),
            "CANCELLED" => Ok(PurchaseOrderStatus::Cancelled),
            other => Err(DomainError::validation(format!(
                "unknown purchase order status: {other}"
            ))),
        }
    }
}

/// Human-readable purchase order number for the `n`th order of an org.
pub fn format_reference(n: u64) -> String {
    format!("PO-{n:06}")
}

/// Purchase order line; `unit_cost` is in the smallest currency unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseLine {
    pub product_id: ProductId,
    pub quantity: i64,
    pub unit_cost: i64,
}

impl PurchaseLine {
    pub fn new(product_id: ProductId, quantity: i64, unit_cost: i64) -> Self {
        Self {
            product_id,
            quantity,
            unit_cost,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPurchaseOrder {
    pub org_id: OrgId,
    pub branch_id: BranchId,
    pub lines: Vec<PurchaseLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrder {
    pub id: PurchaseOrderId,
    pub org_id: OrgId,
    pub branch_id: BranchId,
    pub reference_no: String,
    pub status: PurchaseOrderStatus,
    pub lines: Vec<PurchaseLine>,
    pub total_cost: i64,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PurchaseOrder {
    pub fn create(
        input: NewPurchaseOrder,
        reference_no: String,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if input.lines.is_empty() {
            return Err(DomainError::validation(
                "purchase order must have at least one line",
            ));
        }
        for line in &input.lines {
            ensure_positive_qty(line.quantity)?;
            if line.unit_cost < 0 {
                return Err(DomainError::validation("unit cost must be >= 0"));
            }
        }
        let total_cost = checked_total(
            input
                .lines
                .iter()
                .map(|l| checked_amount(l.quantity, l.unit_cost))
                .collect::<DomainResult<Vec<_>>>()?,
        )?;

        Ok(Self {
            id: PurchaseOrderId::new(),
            org_id: input.org_id,
            branch_id: input.branch_id,
            reference_no,
            status: PurchaseOrderStatus::Open,
            lines: input.lines,
            total_cost,
            received_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    /// Apply a status change; `Received` also stamps `received_at`.
    pub fn set_status(&mut self, status: PurchaseOrderStatus, now: DateTime<Utc>) {
        if status == PurchaseOrderStatus::Received {
            self.received_at = Some(now);
        }
        self.status = status;
        self.version += 1;
        self.updated_at = now;
    }
}

impl AggregateRoot for PurchaseOrder {
    type Id = PurchaseOrderId;

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

    fn input(lines: Vec<PurchaseLine>) -> NewPurchaseOrder {
        NewPurchaseOrder {
            org_id: OrgId::new(),
            branch_id: BranchId::new(),
            lines,
        }
    }

    #[test]
    fn create_starts_open_with_total() {
        let p = ProductId::new();
        let po = PurchaseOrder::create(
            input(vec![PurchaseLine::new(p, 10, 100), PurchaseLine::new(p, 2, 50)]),
            format_reference(1),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(po.status, PurchaseOrderStatus::Open);
        assert_eq!(po.total_cost, 1100);
        assert_eq!(po.reference_no, "PO-000001");
        assert!(po.status.is_receivable());
    }

    #[test]
    fn create_rejects_bad_lines() {
        let p = ProductId::new();
        assert!(PurchaseOrder::create(input(vec![]), format_reference(1), Utc::now()).is_err());
        assert!(
            PurchaseOrder::create(input(vec![PurchaseLine::new(p, 0, 1)]), format_reference(1), Utc::now())
                .is_err()
        );
        assert!(
            PurchaseOrder::create(input(vec![PurchaseLine::new(p, 1, -1)]), format_reference(1), Utc::now())
                .is_err()
        );
    }

    #[test]
    fn create_rejects_overflowing_total() {
        let p = ProductId::new();
        let err = PurchaseOrder::create(
            input(vec![PurchaseLine::new(p, 4, i64::MAX / 3)]),
            format_reference(1),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn received_status_stamps_time() {
        let mut po = PurchaseOrder::create(
            input(vec![PurchaseLine::new(ProductId::new(), 1, 1)]),
            format_reference(7),
            Utc::now(),
        )
        .unwrap();
        po.set_status(PurchaseOrderStatus::Receiving, Utc::now());
        assert!(!po.status.is_receivable());
        assert!(po.received_at.is_none());
        po.set_status(PurchaseOrderStatus::Received, Utc::now());
        assert!(po.received_at.is_some());
        assert_eq!(po.version, 3);
    }

    #[test]
    fn status_parses_wire_names() {
        assert_eq!("SENT".parse::<PurchaseOrderStatus>().unwrap(), PurchaseOrderStatus::Sent);
        assert!("sent".parse::<PurchaseOrderStatus>().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

        #[test]
        fn references_are_zero_padded_and_ordered(a in 1u64..999_999, b in 1u64..999_999) {
            let (ra, rb) = (format_reference(a), format_reference(b));
            prop_assert_eq!(ra.len(), 9);
            prop_assert_eq!(a.cmp(&b), ra.cmp(&rb));
        }
    }
}
