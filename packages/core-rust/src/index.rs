//! Modify-index ordering for long-poll change detection.
//!
//! The coordination store returns a monotonically non-decreasing index with
//! every value. The reloader passes the last index it applied as the wait
//! condition of its next poll and compares the observed index against it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque version token returned by the coordination store.
///
/// `ModifyIndex::ZERO` means "nothing observed yet": a poll issued with it
/// returns immediately instead of blocking.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ModifyIndex(u64);

/// How an observed index relates to the last applied one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexChange {
    /// Same index: the long-poll woke on timeout, nothing changed.
    Unchanged,
    /// Strictly newer index: the value may be applied.
    Advanced,
    /// Strictly older index: the store went backwards. Never applied.
    Retrograde,
}

impl ModifyIndex {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Classifies `observed` against `self`, the last applied index.
    #[must_use]
    pub fn classify(self, observed: ModifyIndex) -> IndexChange {
        match observed.cmp(&self) {
            std::cmp::Ordering::Equal => IndexChange::Unchanged,
            std::cmp::Ordering::Greater => IndexChange::Advanced,
            std::cmp::Ordering::Less => IndexChange::Retrograde,
        }
    }
}

impl From<u64> for ModifyIndex {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ModifyIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
