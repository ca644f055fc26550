//! In-memory [`DeadlistStore`] for testing and embedding.
//!
//! All state lives behind one `parking_lot::Mutex`, mirroring the testing
//! double pattern used elsewhere in the engine: no durability, no latency,
//! full fidelity to the trait contract (including the shared empty-list
//! refcount and O(1) sublist splicing).

use crate::store::{DeadlistStore, ObjectKind, SnapshotRecord};
use fsp_error::{FspError, Result};
use fsp_types::{BlockRef, ObjectId, SpaceTotals, Tx, Txg};
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
struct MemList {
    blocks: Vec<BlockRef>,
    sublists: Vec<ObjectId>,
}

#[derive(Debug, Clone)]
enum MemObject {
    List(MemList),
    BucketMap {
        header: SpaceTotals,
        entries: BTreeMap<Txg, ObjectId>,
    },
    Snapshot(SnapshotRecord),
}

#[derive(Debug)]
struct MemInner {
    next_object: u64,
    objects: BTreeMap<u64, MemObject>,
    empty_object: ObjectId,
    empty_refs: u64,
}

impl MemInner {
    fn alloc(&mut self, obj: MemObject) -> ObjectId {
        let id = ObjectId(self.next_object);
        self.next_object += 1;
        self.objects.insert(id.0, obj);
        id
    }

    fn list(&self, obj: ObjectId) -> Result<&MemList> {
        match self.objects.get(&obj.0) {
            Some(MemObject::List(list)) => Ok(list),
            Some(_) => Err(FspError::WrongObjectKind {
                object: obj.0,
                expected: "block list",
            }),
            None => Err(FspError::UnknownObject { object: obj.0 }),
        }
    }

    fn list_mut(&mut self, obj: ObjectId) -> Result<&mut MemList> {
        match self.objects.get_mut(&obj.0) {
            Some(MemObject::List(list)) => Ok(list),
            Some(_) => Err(FspError::WrongObjectKind {
                object: obj.0,
                expected: "block list",
            }),
            None => Err(FspError::UnknownObject { object: obj.0 }),
        }
    }

    fn map_mut(&mut self, obj: ObjectId) -> Result<(&mut SpaceTotals, &mut BTreeMap<Txg, ObjectId>)> {
        match self.objects.get_mut(&obj.0) {
            Some(MemObject::BucketMap { header, entries }) => Ok((header, entries)),
            Some(_) => Err(FspError::WrongObjectKind {
                object: obj.0,
                expected: "bucket map",
            }),
            None => Err(FspError::UnknownObject { object: obj.0 }),
        }
    }

    /// Direct blocks plus all spliced sublists, depth-first.
    fn collect_blocks(&self, obj: ObjectId) -> Result<Vec<BlockRef>> {
        let mut out = Vec::new();
        let mut stack = vec![obj];
        while let Some(o) = stack.pop() {
            let list = self.list(o)?;
            out.extend(list.blocks.iter().copied());
            stack.extend(list.sublists.iter().copied());
        }
        Ok(out)
    }
}

/// Heap-backed object store.
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemStore")
            .field("objects", &inner.objects.len())
            .field("empty_refs", &inner.empty_refs)
            .finish()
    }
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        let mut inner = MemInner {
            next_object: 1,
            objects: BTreeMap::new(),
            empty_object: ObjectId(0),
            empty_refs: 0,
        };
        inner.empty_object = inner.alloc(MemObject::List(MemList::default()));
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Create a snapshot chain record (test scaffolding for legacy clones).
    pub fn register_snapshot(&self, prev_txg: Txg, prev_obj: Option<ObjectId>) -> ObjectId {
        self.inner
            .lock()
            .alloc(MemObject::Snapshot(SnapshotRecord { prev_txg, prev_obj }))
    }

    /// Outstanding references on the shared empty list.
    #[must_use]
    pub fn empty_refs(&self) -> u64 {
        self.inner.lock().empty_refs
    }

    /// Number of live objects, the shared empty list included.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.inner.lock().objects.len()
    }
}

impl DeadlistStore for MemStore {
    fn object_kind(&self, obj: ObjectId) -> Result<ObjectKind> {
        match self.inner.lock().objects.get(&obj.0) {
            Some(MemObject::List(_)) => Ok(ObjectKind::BlockList),
            Some(MemObject::BucketMap { .. }) => Ok(ObjectKind::BucketMap),
            Some(MemObject::Snapshot(_)) => Ok(ObjectKind::Snapshot),
            None => Err(FspError::UnknownObject { object: obj.0 }),
        }
    }

    fn map_create(&self, _tx: &Tx) -> Result<ObjectId> {
        Ok(self.inner.lock().alloc(MemObject::BucketMap {
            header: SpaceTotals::default(),
            entries: BTreeMap::new(),
        }))
    }

    fn map_free(&self, obj: ObjectId, _tx: &Tx) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.map_mut(obj)?;
        inner.objects.remove(&obj.0);
        Ok(())
    }

    fn map_entries(&self, obj: ObjectId) -> Result<Vec<(Txg, ObjectId)>> {
        let mut inner = self.inner.lock();
        let (_, entries) = inner.map_mut(obj)?;
        Ok(entries.iter().map(|(&k, &v)| (k, v)).collect())
    }

    fn map_add(&self, obj: ObjectId, key: Txg, list: ObjectId, _tx: &Tx) -> Result<()> {
        let mut inner = self.inner.lock();
        let (_, entries) = inner.map_mut(obj)?;
        if entries.contains_key(&key) {
            return Err(FspError::KeyExists {
                object: obj.0,
                key: key.0,
            });
        }
        entries.insert(key, list);
        Ok(())
    }

    fn map_update(&self, obj: ObjectId, key: Txg, list: ObjectId, _tx: &Tx) -> Result<()> {
        let mut inner = self.inner.lock();
        let (_, entries) = inner.map_mut(obj)?;
        let Some(slot) = entries.get_mut(&key) else {
            return Err(FspError::KeyNotFound {
                object: obj.0,
                key: key.0,
            });
        };
        *slot = list;
        Ok(())
    }

    fn map_remove(&self, obj: ObjectId, key: Txg, _tx: &Tx) -> Result<()> {
        let mut inner = self.inner.lock();
        let (_, entries) = inner.map_mut(obj)?;
        if entries.remove(&key).is_none() {
            return Err(FspError::KeyNotFound {
                object: obj.0,
                key: key.0,
            });
        }
        Ok(())
    }

    fn read_header(&self, obj: ObjectId) -> Result<SpaceTotals> {
        let mut inner = self.inner.lock();
        let (header, _) = inner.map_mut(obj)?;
        Ok(*header)
    }

    fn write_header(&self, obj: ObjectId, totals: SpaceTotals, _tx: &Tx) -> Result<()> {
        let mut inner = self.inner.lock();
        let (header, _) = inner.map_mut(obj)?;
        *header = totals;
        Ok(())
    }

    fn list_create(&self, _tx: &Tx) -> Result<ObjectId> {
        Ok(self.inner.lock().alloc(MemObject::List(MemList::default())))
    }

    fn list_create_empty(&self, _tx: &Tx) -> Result<ObjectId> {
        let mut inner = self.inner.lock();
        inner.empty_refs += 1;
        Ok(inner.empty_object)
    }

    fn empty_list_object(&self) -> ObjectId {
        self.inner.lock().empty_object
    }

    fn release_empty(&self, _tx: &Tx) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.empty_refs == 0 {
            return Err(FspError::Store(
                "empty-list refcount underflow".to_string(),
            ));
        }
        inner.empty_refs -= 1;
        Ok(())
    }

    fn list_free(&self, obj: ObjectId, _tx: &Tx) -> Result<()> {
        let mut inner = self.inner.lock();
        if obj == inner.empty_object {
            return Err(FspError::Store(
                "freeing the shared empty list".to_string(),
            ));
        }
        let mut stack = vec![obj];
        while let Some(o) = stack.pop() {
            inner.list(o)?;
            let Some(MemObject::List(list)) = inner.objects.remove(&o.0) else {
                unreachable!()
            };
            stack.extend(list.sublists);
        }
        Ok(())
    }

    fn list_append(&self, obj: ObjectId, bp: &BlockRef, _tx: &Tx) -> Result<()> {
        let mut inner = self.inner.lock();
        if obj == inner.empty_object {
            return Err(FspError::Store(
                "appending to the shared empty list".to_string(),
            ));
        }
        inner.list_mut(obj)?.blocks.push(*bp);
        Ok(())
    }

    fn list_append_sublist(&self, obj: ObjectId, sub: ObjectId, _tx: &Tx) -> Result<()> {
        let mut inner = self.inner.lock();
        if obj == inner.empty_object || sub == inner.empty_object {
            return Err(FspError::Store(
                "splicing the shared empty list".to_string(),
            ));
        }
        inner.list(sub)?;
        inner.list_mut(obj)?.sublists.push(sub);
        Ok(())
    }

    fn list_space(&self, obj: ObjectId) -> Result<SpaceTotals> {
        let blocks = self.inner.lock().collect_blocks(obj)?;
        let mut totals = SpaceTotals::default();
        for bp in &blocks {
            totals.add_block(bp);
        }
        Ok(totals)
    }

    fn list_iterate(
        &self,
        obj: ObjectId,
        f: &mut dyn FnMut(&BlockRef) -> Result<()>,
    ) -> Result<()> {
        // Collect under the lock, call back outside it: the callback may
        // re-enter the store.
        let blocks = self.inner.lock().collect_blocks(obj)?;
        for bp in &blocks {
            f(bp)?;
        }
        Ok(())
    }

    fn snapshot_record(&self, obj: ObjectId) -> Result<Option<SnapshotRecord>> {
        match self.inner.lock().objects.get(&obj.0) {
            Some(MemObject::Snapshot(rec)) => Ok(Some(*rec)),
            Some(_) => Ok(None),
            None => Err(FspError::UnknownObject { object: obj.0 }),
        }
    }
}
