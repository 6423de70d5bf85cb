//! Inventory domain module.
//!
//! Stock counters, FIFO lots, cost lines, movement records and inter-branch
//! transfers as plain data plus the predicates that guard every mutation.
//! No IO: the stores in `stockflow-infra` run these checks inside their atomic
//! conditional updates.

pub mod cost;
pub mod lot;
pub mod movement;
pub mod stock;
pub mod transfer;

pub use cost::{moving_average, weighted_average, CogsResult, CostLine, LotRef, AVERAGE_LOT_REF};
pub use lot::{InventoryLot, LotSource, NewLot};
pub use movement::{MovementFilter, MovementKind, MovementReference, StockMovement};
pub use stock::{AverageReceipt, StockKey, StockLevel};
pub use transfer::{
    format_transfer_reference, validate_transfer_lines, NewTransfer, ReceivedQuantity,
    StockTransfer, TransferChange, TransferLine, TransferStatus,
};
