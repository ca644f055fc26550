//! Deferred-free block tracking, bucketed by snapshot boundary.
//!
//! A deadlist records blocks that are no longer referenced by a dataset but
//! cannot be reclaimed yet because earlier snapshots still hold them. Blocks
//! are partitioned into per-snapshot buckets keyed by the transaction group
//! just after the snapshot was taken, so that destroying a snapshot can hand
//! whole buckets to the reclaimer without touching individual entries.
//!
//! Two on-disk shapes exist. The bucketed shape is a key/value map from
//! boundary txg to block-list object, with aggregate space totals cached in
//! the map header. The legacy shape is a single flat block list with no
//! bucketing; range queries against it degrade to a full scan.
//!
//! In memory a bucketed deadlist lazily materializes one of two views, never
//! both. The *tree* view maps each boundary txg to its list object and is
//! needed for mutation. The *cache* view maps each boundary txg to its
//! pre-summed space totals and is enough for read-only range queries. Loading
//! the tree discards the cache, since mutations would make it stale.

#![forbid(unsafe_code)]

mod mem;
mod store;

pub use mem::MemStore;
pub use store::{DeadlistStore, ObjectKind, SnapshotRecord};

use fsp_error::{FspError, Result};
use fsp_types::{BlockRef, ObjectId, SpaceTotals, Tx, Txg};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

// ── internal state ──────────────────────────────────────────────────────────

/// Lazily loaded view of a bucketed deadlist. Tree and cache are mutually
/// exclusive; see the module docs.
#[derive(Debug)]
enum LoadState {
    Unloaded,
    /// Boundary txg to list object, for mutation.
    Tree(BTreeMap<Txg, ObjectId>),
    /// Boundary txg to that bucket's space totals, for range queries.
    Cache(BTreeMap<Txg, SpaceTotals>),
}

#[derive(Debug)]
struct Inner {
    totals: SpaceTotals,
    state: LoadState,
}

enum Mode {
    /// Flat block list, no buckets. Key operations are silent no-ops.
    Legacy,
    Bucketed(Mutex<Inner>),
}

/// An open deadlist handle.
pub struct Deadlist<S: DeadlistStore> {
    store: Arc<S>,
    object: ObjectId,
    mode: Mode,
}

impl<S: DeadlistStore> std::fmt::Debug for Deadlist<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match &self.mode {
            Mode::Legacy => "legacy",
            Mode::Bucketed(_) => "bucketed",
        };
        f.debug_struct("Deadlist")
            .field("object", &self.object)
            .field("mode", &mode)
            .finish()
    }
}

impl<S: DeadlistStore> Deadlist<S> {
    // ── lifecycle ───────────────────────────────────────────────────────────

    /// Open an existing deadlist object. The mode is inferred from the
    /// object's kind; a block list opens in legacy mode.
    pub fn open(store: Arc<S>, object: ObjectId) -> Result<Self> {
        let mode = match store.object_kind(object)? {
            ObjectKind::BlockList => Mode::Legacy,
            ObjectKind::BucketMap => {
                let totals = store.read_header(object)?;
                Mode::Bucketed(Mutex::new(Inner {
                    totals,
                    state: LoadState::Unloaded,
                }))
            }
            ObjectKind::Snapshot => {
                return Err(FspError::WrongObjectKind {
                    object: object.0,
                    expected: "block list or bucket map",
                })
            }
        };
        Ok(Self {
            store,
            object,
            mode,
        })
    }

    /// Allocate a new, empty bucketed deadlist object.
    pub fn allocate(store: &S, tx: &Tx) -> Result<ObjectId> {
        store.map_create(tx)
    }

    /// Free a deadlist object of either shape, including every bucket list.
    pub fn free(store: &S, object: ObjectId, tx: &Tx) -> Result<()> {
        match store.object_kind(object)? {
            ObjectKind::BlockList => store.list_free(object, tx),
            ObjectKind::BucketMap => {
                let empty = store.empty_list_object();
                for (_, list) in store.map_entries(object)? {
                    if list == empty {
                        store.release_empty(tx)?;
                    } else {
                        store.list_free(list, tx)?;
                    }
                }
                store.map_free(object, tx)
            }
            ObjectKind::Snapshot => Err(FspError::WrongObjectKind {
                object: object.0,
                expected: "block list or bucket map",
            }),
        }
    }

    /// Drop the in-memory views. The object itself stays on disk.
    pub fn close(self) {
        debug!(target: "fsp::deadlist", object = self.object.0, "deadlist_close");
    }

    #[must_use]
    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// True when this handle is a flat legacy list.
    #[must_use]
    pub fn is_legacy(&self) -> bool {
        matches!(self.mode, Mode::Legacy)
    }

    // ── view loading ────────────────────────────────────────────────────────

    fn load_tree(&self, inner: &mut Inner) -> Result<()> {
        // A cached view would go stale under the mutation that needs the
        // tree, so drop it before loading.
        if matches!(inner.state, LoadState::Cache(_)) {
            inner.state = LoadState::Unloaded;
        }
        if matches!(inner.state, LoadState::Tree(_)) {
            return Ok(());
        }
        let mut tree = BTreeMap::new();
        for (key, list) in self.store.map_entries(self.object)? {
            tree.insert(key, list);
        }
        debug!(
            target: "fsp::deadlist",
            object = self.object.0,
            buckets = tree.len(),
            "deadlist_tree_loaded"
        );
        inner.state = LoadState::Tree(tree);
        Ok(())
    }

    fn load_cache(&self, inner: &mut Inner) -> Result<()> {
        if !matches!(inner.state, LoadState::Unloaded) {
            return Ok(());
        }
        let empty = self.store.empty_list_object();
        let mut cache = BTreeMap::new();
        for (key, list) in self.store.map_entries(self.object)? {
            let totals = if list == empty {
                SpaceTotals::default()
            } else {
                self.store.list_space(list)?
            };
            cache.insert(key, totals);
        }
        inner.state = LoadState::Cache(cache);
        Ok(())
    }

    /// Discard the tree view, forcing the next mutation to reload it.
    pub fn discard_tree(&self) {
        if let Mode::Bucketed(inner) = &self.mode {
            let mut inner = inner.lock();
            if matches!(inner.state, LoadState::Tree(_)) {
                inner.state = LoadState::Unloaded;
            }
        }
    }

    // ── insertion ───────────────────────────────────────────────────────────

    /// Record one dead block. The block lands in the bucket with the greatest
    /// boundary txg strictly below its birth txg.
    ///
    /// # Panics
    ///
    /// Panics if no bucket boundary lies below the block's birth txg; a
    /// bucketed deadlist always carries a txg-0 bucket, so this indicates
    /// structural corruption.
    pub fn insert(&self, bp: &BlockRef, tx: &Tx) -> Result<()> {
        let Mode::Bucketed(inner) = &self.mode else {
            return self.store.list_append(self.object, bp, tx);
        };
        let mut inner = inner.lock();
        self.load_tree(&mut inner)?;

        inner.totals.add_block(bp);
        self.store.write_header(self.object, inner.totals, tx)?;

        let LoadState::Tree(tree) = &mut inner.state else {
            unreachable!()
        };
        let (&key, &list) = tree
            .range(..bp.birth)
            .next_back()
            .unwrap_or_else(|| panic!("no deadlist bucket below birth txg {}", bp.birth));
        let list = self.materialize_bucket(tree, key, list, tx)?;
        self.store.list_append(list, bp, tx)
    }

    /// Swap the shared empty list for a real one the first time a bucket
    /// takes content.
    fn materialize_bucket(
        &self,
        tree: &mut BTreeMap<Txg, ObjectId>,
        key: Txg,
        list: ObjectId,
        tx: &Tx,
    ) -> Result<ObjectId> {
        if list != self.store.empty_list_object() {
            return Ok(list);
        }
        let real = self.store.list_create(tx)?;
        self.store.release_empty(tx)?;
        self.store.map_update(self.object, key, real, tx)?;
        tree.insert(key, real);
        Ok(real)
    }

    /// Splice an already-built block list into the bucket with the greatest
    /// boundary txg at or below `birth`. The sublist's identity is consumed:
    /// either it becomes the bucket's list or it is appended to one.
    fn insert_sublist(&self, inner: &mut Inner, sub: ObjectId, birth: Txg, tx: &Tx) -> Result<()> {
        if sub == self.store.empty_list_object() {
            return self.store.release_empty(tx);
        }

        let delta = self.store.list_space(sub)?;
        inner.totals.add(delta);
        self.store.write_header(self.object, inner.totals, tx)?;

        let LoadState::Tree(tree) = &mut inner.state else {
            unreachable!()
        };
        let (&key, &list) = tree
            .range(..=birth)
            .next_back()
            .unwrap_or_else(|| panic!("no deadlist bucket at or below txg {birth}"));
        if list == self.store.empty_list_object() {
            self.store.release_empty(tx)?;
            self.store.map_update(self.object, key, sub, tx)?;
            tree.insert(key, sub);
            Ok(())
        } else {
            self.store.list_append_sublist(list, sub, tx)
        }
    }

    // ── bucket boundaries ───────────────────────────────────────────────────

    /// Open a new bucket at boundary `key`. No-op on a legacy deadlist.
    ///
    /// # Panics
    ///
    /// Panics if a bucket with this boundary already exists.
    pub fn add_key(&self, key: Txg, tx: &Tx) -> Result<()> {
        let Mode::Bucketed(inner) = &self.mode else {
            return Ok(());
        };
        let mut inner = inner.lock();
        self.load_tree(&mut inner)?;

        let list = self.store.list_create_empty(tx)?;
        self.store.map_add(self.object, key, list, tx)?;
        let LoadState::Tree(tree) = &mut inner.state else {
            unreachable!()
        };
        let prev = tree.insert(key, list);
        assert!(prev.is_none(), "duplicate deadlist key {key}");
        debug!(target: "fsp::deadlist", object = self.object.0, key = key.0, "deadlist_add_key");
        Ok(())
    }

    /// Remove the bucket at boundary `key`, folding its blocks into the
    /// predecessor bucket. No-op on a legacy deadlist.
    ///
    /// # Panics
    ///
    /// Panics if the key does not exist or has no predecessor bucket.
    pub fn remove_key(&self, key: Txg, tx: &Tx) -> Result<()> {
        let Mode::Bucketed(inner) = &self.mode else {
            return Ok(());
        };
        let mut inner = inner.lock();
        self.load_tree(&mut inner)?;
        let LoadState::Tree(tree) = &mut inner.state else {
            unreachable!()
        };

        let list = tree
            .remove(&key)
            .unwrap_or_else(|| panic!("removing nonexistent deadlist key {key}"));
        let (&prev_key, &prev_list) = tree
            .range(..key)
            .next_back()
            .unwrap_or_else(|| panic!("deadlist key {key} has no predecessor bucket"));

        let empty = self.store.empty_list_object();
        if list == empty {
            self.store.release_empty(tx)?;
        } else if prev_list == empty {
            self.store.release_empty(tx)?;
            self.store.map_update(self.object, prev_key, list, tx)?;
            tree.insert(prev_key, list);
        } else {
            self.store.list_append_sublist(prev_list, list, tx)?;
        }
        self.store.map_remove(self.object, key, tx)?;
        debug!(target: "fsp::deadlist", object = self.object.0, key = key.0, "deadlist_remove_key");
        Ok(())
    }

    // ── space queries ───────────────────────────────────────────────────────

    /// Aggregate totals across every bucket.
    pub fn space(&self) -> Result<SpaceTotals> {
        match &self.mode {
            Mode::Legacy => self.store.list_space(self.object),
            Mode::Bucketed(inner) => Ok(inner.lock().totals),
        }
    }

    /// Totals for blocks with birth txg in `(mintxg, maxtxg]`, i.e. the
    /// blocks that would be reclaimed by destroying the snapshots in that
    /// span. On a legacy deadlist this scans every block.
    pub fn space_range(&self, mintxg: Txg, maxtxg: Txg) -> Result<SpaceTotals> {
        let Mode::Bucketed(inner) = &self.mode else {
            let mut totals = SpaceTotals::default();
            self.store.list_iterate(self.object, &mut |bp| {
                if bp.birth > mintxg && bp.birth <= maxtxg {
                    totals.add_block(bp);
                }
                Ok(())
            })?;
            return Ok(totals);
        };

        let mut inner = inner.lock();
        let mut totals = SpaceTotals::default();

        // Buckets keyed in [mintxg, maxtxg) hold exactly the births in
        // (mintxg, maxtxg]. Prefer whichever view is already resident.
        if let LoadState::Tree(tree) = &inner.state {
            let empty = self.store.empty_list_object();
            for (_, &list) in tree.range(mintxg..maxtxg) {
                if list != empty {
                    totals.add(self.store.list_space(list)?);
                }
            }
            return Ok(totals);
        }
        self.load_cache(&mut inner)?;
        let LoadState::Cache(cache) = &inner.state else {
            unreachable!()
        };
        for (_, &bucket) in cache.range(mintxg..maxtxg) {
            totals.add(bucket);
        }
        Ok(totals)
    }

    // ── bulk operations ─────────────────────────────────────────────────────

    /// Create a new deadlist with this one's bucket boundaries below
    /// `maxtxg`, all buckets empty. For a legacy source the boundaries are
    /// regenerated by walking the snapshot chain starting at `origin`.
    pub fn clone_structure(
        &self,
        maxtxg: Txg,
        origin: Option<ObjectId>,
        tx: &Tx,
    ) -> Result<ObjectId> {
        let newobj = self.store.map_create(tx)?;
        let new_dl = Deadlist::open(Arc::clone(&self.store), newobj)?;

        match &self.mode {
            Mode::Legacy => {
                // The flat list has no boundaries of its own; recover them
                // from the snapshot chain.
                let mut cursor = origin;
                while let Some(snap) = cursor {
                    let Some(rec) = self.store.snapshot_record(snap)? else {
                        return Err(FspError::WrongObjectKind {
                            object: snap.0,
                            expected: "snapshot",
                        });
                    };
                    if rec.prev_txg < maxtxg {
                        new_dl.add_key(rec.prev_txg, tx)?;
                    }
                    cursor = rec.prev_obj;
                }
            }
            Mode::Bucketed(inner) => {
                let mut inner = inner.lock();
                self.load_tree(&mut inner)?;
                let LoadState::Tree(tree) = &inner.state else {
                    unreachable!()
                };
                for (&key, _) in tree.range(..maxtxg) {
                    new_dl.add_key(key, tx)?;
                }
            }
        }
        Ok(newobj)
    }

    /// Fold another deadlist's contents into this one, bucket by bucket,
    /// leaving the source object empty. A flat-list source is merged block
    /// by block through [`Deadlist::insert`].
    ///
    /// # Panics
    ///
    /// Panics when the source is bucketed but this deadlist is legacy; the
    /// flat shape cannot absorb buckets.
    pub fn merge(&self, obj: ObjectId, tx: &Tx) -> Result<()> {
        if self.store.object_kind(obj)? == ObjectKind::BlockList {
            return self
                .store
                .list_iterate(obj, &mut |bp| self.insert(bp, tx));
        }

        let Mode::Bucketed(inner) = &self.mode else {
            panic!("merging a bucketed deadlist into a legacy deadlist");
        };
        let mut inner = inner.lock();
        self.load_tree(&mut inner)?;

        for (key, list) in self.store.map_entries(obj)? {
            self.insert_sublist(&mut inner, list, key, tx)?;
            self.store.map_remove(obj, key, tx)?;
        }
        self.store.write_header(obj, SpaceTotals::default(), tx)?;
        debug!(target: "fsp::deadlist", object = self.object.0, source = obj.0, "deadlist_merge");
        Ok(())
    }

    /// Move every bucket with boundary at or above `mintxg` out of this
    /// deadlist, splicing their blocks into `target`, and subtract the moved
    /// space from this deadlist's totals.
    ///
    /// # Panics
    ///
    /// Panics on a legacy deadlist.
    pub fn move_buckets(&self, target: ObjectId, mintxg: Txg, tx: &Tx) -> Result<()> {
        let Mode::Bucketed(inner) = &self.mode else {
            panic!("moving buckets out of a legacy deadlist");
        };
        let mut inner = inner.lock();
        self.load_tree(&mut inner)?;
        let LoadState::Tree(tree) = &mut inner.state else {
            unreachable!()
        };

        let keys: Vec<Txg> = tree.range(mintxg..).map(|(&k, _)| k).collect();
        let empty = self.store.empty_list_object();
        let mut freed = SpaceTotals::default();
        for key in keys {
            let list = tree.remove(&key).unwrap_or_else(|| unreachable!());
            if list == empty {
                self.store.release_empty(tx)?;
            } else {
                freed.add(self.store.list_space(list)?);
                self.store.list_append_sublist(target, list, tx)?;
            }
            self.store.map_remove(self.object, key, tx)?;
        }
        inner.totals.subtract(freed);
        self.store.write_header(self.object, inner.totals, tx)?;
        Ok(())
    }
}
