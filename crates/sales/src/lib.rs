//! Sales order domain module.
//!
//! The order document as the fulfillment state machine sees it: lines, status and
//! the two stock-commit flags. Pure data and transition checks; the saga that
//! moves stock lives in `stockflow-infra`.

pub mod order;

pub use order::{LineSettlement, NewOrder, Order, OrderLine, OrderStatus, StockCommit};
