//! Process-wide tracing setup for the stock ledger.

pub mod subscriber;

pub use subscriber::{init, init_for_tests};
