#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction group / generation number.
///
/// A monotonic logical timestamp. Deadlist buckets are keyed by a `Txg`
/// that is an *exclusive* lower bound: bucket `K` collects block references
/// whose birth generation lies in `(K, K_next]`.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Txg(pub u64);

impl fmt::Display for Txg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to an object in the backing store (bucket map, block list, or
/// snapshot record). Opaque to this crate; the store assigns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque transaction context.
///
/// Passed to every mutating store call; represents the unit of atomicity.
/// This core never commits or aborts it, it only performs writes within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tx {
    txg: Txg,
}

impl Tx {
    #[must_use]
    pub fn new(txg: Txg) -> Self {
        Self { txg }
    }

    /// The transaction group this context commits in.
    #[must_use]
    pub fn txg(&self) -> Txg {
        self.txg
    }
}

/// Reference to a freed storage block.
///
/// Carries the birth generation used for deadlist bucket routing and the
/// three size figures tracked by space accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    /// Generation in which the block was born.
    pub birth: Txg,
    /// Allocated (on-disk) size in bytes.
    pub size: u64,
    /// Compressed (physical) size in bytes.
    pub comp: u64,
    /// Uncompressed (logical) size in bytes.
    pub uncomp: u64,
}

/// Aggregate `{used, comp, uncomp}` byte totals.
///
/// Persisted as the deadlist header and computed per block list. Subtraction
/// underflow indicates corrupted accounting and panics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceTotals {
    pub used: u64,
    pub comp: u64,
    pub uncomp: u64,
}

impl SpaceTotals {
    #[must_use]
    pub fn new(used: u64, comp: u64, uncomp: u64) -> Self {
        Self { used, comp, uncomp }
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.used == 0 && self.comp == 0 && self.uncomp == 0
    }

    pub fn add(&mut self, other: SpaceTotals) {
        self.used += other.used;
        self.comp += other.comp;
        self.uncomp += other.uncomp;
    }

    /// Subtract `other`, panicking on underflow (accounting corruption).
    pub fn subtract(&mut self, other: SpaceTotals) {
        assert!(
            self.used >= other.used && self.comp >= other.comp && self.uncomp >= other.uncomp,
            "space accounting underflow: {self:?} - {other:?}"
        );
        self.used -= other.used;
        self.comp -= other.comp;
        self.uncomp -= other.uncomp;
    }

    pub fn add_block(&mut self, bp: &BlockRef) {
        self.used += bp.size;
        self.comp += bp.comp;
        self.uncomp += bp.uncomp;
    }
}
