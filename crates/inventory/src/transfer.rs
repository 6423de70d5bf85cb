use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockflow_core::{
    ensure_positive_qty, AggregateRoot, BranchId, DomainError, DomainResult, OrgId, ProductId,
    TransferId,
};

use crate::cost::{weighted_average, CostLine};
use crate::stock::StockKey;

/// Inter-branch transfer lifecycle.
///
/// `Sending` and `Receiving` are held only while the matching stock moves are
/// in flight and double as their locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Draft,
    Sending,
    InTransit,
    Receiving,
    Received,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Draft => "DRAFT",
            TransferStatus::Sending => "SENDING",
            TransferStatus::InTransit => "IN_TRANSIT",
            TransferStatus::Receiving => "RECEIVING",
            TransferStatus::Received => "RECEIVED",
            TransferStatus::Cancelled => "CANCELLED",
        }
    }

    /// A saga holds the transfer in this status.
    pub fn is_locked(&self) -> bool {
        matches!(self, TransferStatus::Sending | TransferStatus::Receiving)
    }
}

impl core::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for TransferStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(TransferStatus::Draft),
            "SENDING" => Ok(TransferStatus::Sending),
            "IN_TRANSIT" => Ok(TransferStatus::InTransit),
            "RECEIVING" => Ok(TransferStatus::Receiving),
            "RECEIVED" => Ok(TransferStatus::Received),
            "CANCELLED" => Ok(TransferStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown transfer status: {other}"))),
        }
    }
}

/// Human-readable number for the `n`th transfer of an org.
pub fn format_transfer_reference(n: u64) -> String {
    format!("TRF-{n:06}")
}

/// One product moving between branches.
///
/// `cost_lines` are the cost layers taken off the source when the transfer is
/// sent, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLine {
    pub product_id: ProductId,
    pub quantity: i64,
    #[serde(default)]
    pub received_quantity: Option<i64>,
    #[serde(default)]
    pub cost_lines: Vec<CostLine>,
}

impl TransferLine {
    pub fn new(product_id: ProductId, quantity: i64) -> Self {
        Self {
            product_id,
            quantity,
            received_quantity: None,
            cost_lines: Vec::new(),
        }
    }

    /// Quantity booked in at the destination; the full quantity unless overridden.
    pub fn received(&self) -> i64 {
        self.received_quantity.unwrap_or(self.quantity)
    }

    /// Up to `qty` units of the cost layers as `(quantity, unit_cost)`, oldest first.
    pub fn cost_layers(&self, qty: i64) -> Vec<(i64, i64)> {
        let mut left = qty;
        let mut layers = Vec::new();
        for line in &self.cost_lines {
            if left <= 0 {
                break;
            }
            let take = left.min(line.quantity);
            if take > 0 {
                layers.push((take, line.unit_cost));
                left -= take;
            }
        }
        layers
    }

    /// Weighted unit cost of the first `qty` units; `None` without cost layers.
    pub fn unit_cost_of(&self, qty: i64) -> Option<i64> {
        weighted_average(self.cost_layers(qty))
    }
}

/// Quantity actually counted in at the destination for one product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedQuantity {
    pub product_id: ProductId,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransfer {
    pub org_id: OrgId,
    pub from_branch_id: BranchId,
    pub to_branch_id: BranchId,
    pub lines: Vec<TransferLine>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Non-empty, positive quantities, one line per product.
pub fn validate_transfer_lines(lines: &[TransferLine]) -> DomainResult<()> {
    if lines.is_empty() {
        return Err(DomainError::validation("transfer must have at least one line"));
    }
    let mut seen = HashSet::new();
    for line in lines {
        ensure_positive_qty(line.quantity)?;
        if !seen.insert(line.product_id) {
            return Err(DomainError::validation(format!(
                "product {} appears on more than one transfer line",
                line.product_id
            )));
        }
    }
    Ok(())
}

/// Status change plus the fields that travel with it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransferChange {
    pub status: Option<TransferStatus>,
    pub lines: Option<Vec<TransferLine>>,
    pub notes: Option<String>,
    pub reason: Option<String>,
}

impl TransferChange {
    pub fn status(status: TransferStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn lines(mut self, lines: Vec<TransferLine>) -> Self {
        self.lines = Some(lines);
        self
    }

    pub fn notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes;
        self
    }

    pub fn reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockTransfer {
    pub id: TransferId,
    pub org_id: OrgId,
    pub reference_no: String,
    pub from_branch_id: BranchId,
    pub to_branch_id: BranchId,
    pub status: TransferStatus,
    pub lines: Vec<TransferLine>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancellation_reason: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StockTransfer {
    pub fn create(input: NewTransfer, reference_no: String, now: DateTime<Utc>) -> DomainResult<Self> {
        if input.from_branch_id == input.to_branch_id {
            return Err(DomainError::validation(
                "transfer source and destination must differ",
            ));
        }
        validate_transfer_lines(&input.lines)?;

        Ok(Self {
            id: TransferId::new(),
            org_id: input.org_id,
            reference_no,
            from_branch_id: input.from_branch_id,
            to_branch_id: input.to_branch_id,
            status: TransferStatus::Draft,
            lines: input
                .lines
                .into_iter()
                .map(|l| TransferLine::new(l.product_id, l.quantity))
                .collect(),
            notes: input.notes,
            sent_at: None,
            received_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn source_key(&self, product_id: ProductId) -> StockKey {
        StockKey::new(self.org_id, self.from_branch_id, product_id)
    }

    pub fn destination_key(&self, product_id: ProductId) -> StockKey {
        StockKey::new(self.org_id, self.to_branch_id, product_id)
    }

    /// Lines with `received_quantity` filled in from `received`, defaulting
    /// to the sent quantity. Each override must name a line and stay within
    /// `0..=quantity`.
    pub fn with_received(&self, received: &[ReceivedQuantity]) -> DomainResult<Vec<TransferLine>> {
        for r in received {
            let line = self
                .lines
                .iter()
                .find(|l| l.product_id == r.product_id)
                .ok_or_else(|| {
                    DomainError::validation(format!(
                        "product {} is not on transfer {}",
                        r.product_id, self.reference_no
                    ))
                })?;
            if r.quantity < 0 || r.quantity > line.quantity {
                return Err(DomainError::validation(format!(
                    "received quantity {} outside 0..={} for product {}",
                    r.quantity, line.quantity, r.product_id
                )));
            }
        }

        Ok(self
            .lines
            .iter()
            .map(|line| {
                let quantity = received
                    .iter()
                    .rev()
                    .find(|r| r.product_id == line.product_id)
                    .map_or(line.quantity, |r| r.quantity);
                TransferLine {
                    received_quantity: Some(quantity),
                    ..line.clone()
                }
            })
            .collect())
    }

    /// Apply a change. Entering `InTransit` the first time stamps `sent_at`,
    /// `Received` stamps `received_at` and `Cancelled` records when and why;
    /// leaving `Cancelled` clears both.
    pub fn apply(&mut self, change: TransferChange, now: DateTime<Utc>) {
        if let Some(lines) = change.lines {
            self.lines = lines;
        }
        if change.notes.is_some() {
            self.notes = change.notes;
        }
        if let Some(status) = change.status {
            match status {
                TransferStatus::InTransit if self.sent_at.is_none() => self.sent_at = Some(now),
                TransferStatus::Received => self.received_at = Some(now),
                _ => {}
            }
            if status == TransferStatus::Cancelled {
                self.cancelled_at = Some(now);
                self.cancellation_reason = change.reason;
            } else {
                self.cancelled_at = None;
                self.cancellation_reason = None;
            }
            self.status = status;
        }
        self.version += 1;
        self.updated_at = now;
    }
}

impl AggregateRoot for StockTransfer {
    type Id = TransferId;

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
    use stockflow_core::LotId;

    fn input(lines: Vec<TransferLine>) -> NewTransfer {
        NewTransfer {
            org_id: OrgId::new(),
            from_branch_id: BranchId::new(),
            to_branch_id: BranchId::new(),
            lines,
            notes: None,
        }
    }

    fn transfer(lines: Vec<TransferLine>) -> StockTransfer {
        StockTransfer::create(input(lines), format_transfer_reference(1), Utc::now()).unwrap()
    }

    #[test]
    fn create_starts_as_draft() {
        let p = ProductId::new();
        let t = transfer(vec![TransferLine::new(p, 4)]);
        assert_eq!(t.status, TransferStatus::Draft);
        assert_eq!(t.reference_no, "TRF-000001");
        assert_eq!(t.source_key(p).branch_id, t.from_branch_id);
        assert_eq!(t.destination_key(p).branch_id, t.to_branch_id);
    }

    #[test]
    fn create_rejects_bad_input() {
        let p = ProductId::new();
        let mut same = input(vec![TransferLine::new(p, 1)]);
        same.to_branch_id = same.from_branch_id;
        assert!(StockTransfer::create(same, "TRF-000001".into(), Utc::now()).is_err());

        for lines in [
            vec![],
            vec![TransferLine::new(p, 0)],
            vec![TransferLine::new(p, 1), TransferLine::new(p, 2)],
        ] {
            assert!(matches!(
                StockTransfer::create(input(lines), "TRF-000001".into(), Utc::now()),
                Err(DomainError::Validation(_))
            ));
        }
    }

    #[test]
    fn received_overrides_are_bounded_by_sent_quantity() {
        let (a, b) = (ProductId::new(), ProductId::new());
        let t = transfer(vec![TransferLine::new(a, 5), TransferLine::new(b, 3)]);

        let lines = t
            .with_received(&[ReceivedQuantity { product_id: a, quantity: 4 }])
            .unwrap();
        assert_eq!(lines[0].received_quantity, Some(4));
        assert_eq!(lines[1].received_quantity, Some(3));

        for bad in [
            ReceivedQuantity { product_id: a, quantity: 6 },
            ReceivedQuantity { product_id: a, quantity: -1 },
            ReceivedQuantity { product_id: ProductId::new(), quantity: 1 },
        ] {
            assert!(matches!(t.with_received(&[bad]), Err(DomainError::Validation(_))));
        }
    }

    #[test]
    fn cost_layers_take_oldest_first() {
        let p = ProductId::new();
        let mut line = TransferLine::new(p, 7);
        line.cost_lines = vec![
            CostLine::from_lot(p, LotId::new(), 5, 100).unwrap(),
            CostLine::from_lot(p, LotId::new(), 2, 130).unwrap(),
        ];
        assert_eq!(line.cost_layers(6), vec![(5, 100), (1, 130)]);
        assert_eq!(line.unit_cost_of(7), Some((500 + 260) / 7));
        assert_eq!(TransferLine::new(p, 1).unit_cost_of(1), None);
    }

    #[test]
    fn status_changes_stamp_times_and_reasons() {
        let mut t = transfer(vec![TransferLine::new(ProductId::new(), 1)]);
        t.apply(TransferChange::status(TransferStatus::InTransit), Utc::now());
        let sent_at = t.sent_at;
        assert!(sent_at.is_some());

        t.apply(
            TransferChange::status(TransferStatus::Cancelled).reason(Some("truck broke down".into())),
            Utc::now(),
        );
        assert!(t.cancelled_at.is_some());
        assert_eq!(t.cancellation_reason.as_deref(), Some("truck broke down"));

        t.apply(TransferChange::status(TransferStatus::InTransit), Utc::now());
        assert!(t.cancelled_at.is_none() && t.cancellation_reason.is_none());
        assert_eq!(t.sent_at, sent_at);
        assert_eq!(t.version, 4);
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(serde_json::to_value(TransferStatus::InTransit).unwrap(), "IN_TRANSIT");
        assert_eq!("RECEIVING".parse::<TransferStatus>().unwrap(), TransferStatus::Receiving);
        assert!(TransferStatus::Sending.is_locked());
    }
}
