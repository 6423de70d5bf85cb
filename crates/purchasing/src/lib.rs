//! Purchasing domain module.
//!
//! Purchase orders as the receiving flow sees them: lines with unit costs, the
//! receive lifecycle and reference numbering. No IO.

pub mod order;

pub use order::{
    format_reference, NewPurchaseOrder, PurchaseLine, PurchaseOrder, PurchaseOrderStatus,
};
