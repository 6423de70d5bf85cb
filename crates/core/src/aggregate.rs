//! Versioned document roots and optimistic concurrency expectations.

use crate::error::{DomainError, DomainResult};

/// Versioned root of a consistency boundary (stock level, lot, order).
///
/// Every mutation of a root is a single conditional update; `version` is bumped
/// in that same step so a writer can detect that it raced someone else.
pub trait AggregateRoot {
    /// Strongly-typed identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the identifier.
    fn id(&self) -> &Self::Id;

    /// Monotonically increasing version of the document.
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for a versioned document.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// Require the document to be at an exact version (0 = does not exist yet).
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }

    /// The expected version as an optional number (`None` for `Any`).
    pub fn as_option(self) -> Option<u64> {
        match self {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v),
        }
    }
}
