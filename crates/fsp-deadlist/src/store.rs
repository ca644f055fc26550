//! Persisted-store abstraction the deadlist is built on.
//!
//! The deadlist itself owns no durable state. It drives three collaborator
//! capabilities through [`DeadlistStore`]:
//!
//! - a **bucket map**: a sorted integer-keyed map from generation to block
//!   list object, with a `{used, comp, uncomp}` header record;
//! - **block lists**: append-only lists of [`BlockRef`]s supporting O(1)
//!   enqueue, O(1) sublist splice, and aggregate space accounting;
//! - **snapshot records**: a backward-linked chain used only to regenerate
//!   bucket keys when cloning a legacy deadlist.
//!
//! Every mutating call carries a [`Tx`]; the store is expected to make all
//! writes within one `Tx` atomic. The store also owns one shared, refcounted
//! **canonical empty list**: freshly keyed buckets all point at it until the
//! first insert materializes a private list, which keeps mostly-empty
//! deadlists cheap.

use fsp_error::Result;
use fsp_types::{BlockRef, ObjectId, SpaceTotals, Tx, Txg};

/// What an object id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// Append-only block-reference list.
    BlockList,
    /// Generation-keyed bucket map with a space header.
    BucketMap,
    /// Snapshot chain record.
    Snapshot,
}

/// A link in the snapshot chain, read during legacy deadlist cloning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRecord {
    /// Generation of the previous snapshot (becomes a bucket key).
    pub prev_txg: Txg,
    /// Previous snapshot object, or `None` at the head of the chain.
    pub prev_obj: Option<ObjectId>,
}

/// Backing-store capabilities required by [`Deadlist`](crate::Deadlist).
///
/// All methods take `&self`; implementations provide their own interior
/// locking. Failures indicate store-level corruption or misuse and are
/// treated as fatal by committing callers.
pub trait DeadlistStore {
    fn object_kind(&self, obj: ObjectId) -> Result<ObjectKind>;

    // ── Bucket map + header ─────────────────────────────────────────────────

    fn map_create(&self, tx: &Tx) -> Result<ObjectId>;
    fn map_free(&self, obj: ObjectId, tx: &Tx) -> Result<()>;
    /// All `(key, list)` entries in ascending key order.
    fn map_entries(&self, obj: ObjectId) -> Result<Vec<(Txg, ObjectId)>>;
    fn map_add(&self, obj: ObjectId, key: Txg, list: ObjectId, tx: &Tx) -> Result<()>;
    fn map_update(&self, obj: ObjectId, key: Txg, list: ObjectId, tx: &Tx) -> Result<()>;
    fn map_remove(&self, obj: ObjectId, key: Txg, tx: &Tx) -> Result<()>;
    fn read_header(&self, obj: ObjectId) -> Result<SpaceTotals>;
    fn write_header(&self, obj: ObjectId, totals: SpaceTotals, tx: &Tx) -> Result<()>;

    // ── Block lists ─────────────────────────────────────────────────────────

    fn list_create(&self, tx: &Tx) -> Result<ObjectId>;
    /// Take a reference on the shared canonical empty list and return it.
    fn list_create_empty(&self, tx: &Tx) -> Result<ObjectId>;
    /// Id of the shared canonical empty list.
    fn empty_list_object(&self) -> ObjectId;
    /// Drop one reference on the shared canonical empty list.
    fn release_empty(&self, tx: &Tx) -> Result<()>;
    /// Free a private list and, recursively, its spliced sublists.
    fn list_free(&self, obj: ObjectId, tx: &Tx) -> Result<()>;
    fn list_append(&self, obj: ObjectId, bp: &BlockRef, tx: &Tx) -> Result<()>;
    /// Splice `sub` wholesale into `obj` in O(1); `obj` takes ownership.
    fn list_append_sublist(&self, obj: ObjectId, sub: ObjectId, tx: &Tx) -> Result<()>;
    /// Aggregate totals over the list and all spliced sublists.
    fn list_space(&self, obj: ObjectId) -> Result<SpaceTotals>;
    /// Visit every block reference in the list and its sublists.
    ///
    /// The callback may re-enter the store (e.g. to insert into another
    /// deadlist); implementations must not hold internal locks across it.
    fn list_iterate(
        &self,
        obj: ObjectId,
        f: &mut dyn FnMut(&BlockRef) -> Result<()>,
    ) -> Result<()>;

    // ── Snapshot chain ──────────────────────────────────────────────────────

    /// The snapshot record for `obj`, or `None` if `obj` carries none.
    fn snapshot_record(&self, obj: ObjectId) -> Result<Option<SnapshotRecord>>;
}
