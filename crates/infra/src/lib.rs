//! Infrastructure layer: stores, the stock ledger services and configuration.

pub mod adjustments;
pub mod branch_transfers;
pub mod catalog;
pub mod compensation;
pub mod config;
pub mod costing;
pub mod counters;
pub mod error;
pub mod fulfillment;
pub mod lots;
pub mod movements;
pub mod orders;
pub mod purchase_orders;
pub mod receiving;
pub mod reservation;
pub mod returns;
pub mod stock_ledger;
pub mod stores;
pub mod transfers;


pub use adjustments::{AdjustmentKind, AdjustmentRequest, AdjustmentService, StockAdjustment};
pub use branch_transfers::TransferService;
pub use config::{BackoffStrategy, LedgerConfig, RetryPolicy};
pub use costing::CostingEngine;
pub use error::{LedgerError, LedgerResult};
pub use fulfillment::{CancelRequest, FulfillmentService};
pub use receiving::ReceivingService;
pub use reservation::ReservationCoordinator;
pub use returns::ReturnsService;
pub use stores::LedgerStores;
