//! Products domain module.
//!
//! Only the catalog fields the stock/cost ledger depends on live here: the costing
//! method selector and the cost caches. Pure data and validation, no IO.

pub mod product;

pub use product::{CostingMethod, NewProduct, Product};
