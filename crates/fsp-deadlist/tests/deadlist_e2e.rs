//! End-to-end deadlist behavior against the in-memory store.

use fsp_deadlist::{Deadlist, DeadlistStore, MemStore};
use fsp_types::{BlockRef, ObjectId, SpaceTotals, Tx, Txg};
use proptest::prelude::*;
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("fsp=debug")
        .with_test_writer()
        .try_init();
}

fn bp(birth: u64, size: u64) -> BlockRef {
    BlockRef {
        birth: Txg(birth),
        size,
        comp: size / 2,
        uncomp: size * 2,
    }
}

/// A bucketed deadlist with boundaries {0, 100, 200}, no content yet.
fn bucketed(store: &Arc<MemStore>, tx: &Tx) -> Deadlist<MemStore> {
    let obj = Deadlist::allocate(store.as_ref(), tx).unwrap();
    let dl = Deadlist::open(Arc::clone(store), obj).unwrap();
    dl.add_key(Txg(0), tx).unwrap();
    dl.add_key(Txg(100), tx).unwrap();
    dl.add_key(Txg(200), tx).unwrap();
    dl
}

fn bucket_for(store: &MemStore, map: ObjectId, key: Txg) -> ObjectId {
    store
        .map_entries(map)
        .unwrap()
        .into_iter()
        .find(|&(k, _)| k == key)
        .map(|(_, list)| list)
        .unwrap()
}

#[test]
fn insert_routes_to_greatest_key_strictly_below_birth() {
    init_tracing();
    let store = Arc::new(MemStore::new());
    let tx = Tx::new(Txg(300));
    let dl = bucketed(&store, &tx);

    // Birth 150 lands in bucket 100; birth exactly 100 lands in bucket 0,
    // since the boundary is an exclusive lower bound.
    dl.insert(&bp(150, 4096), &tx).unwrap();
    dl.insert(&bp(100, 1024), &tx).unwrap();
    dl.insert(&bp(250, 512), &tx).unwrap();

    let b0 = bucket_for(&store, dl.object(), Txg(0));
    let b100 = bucket_for(&store, dl.object(), Txg(100));
    let b200 = bucket_for(&store, dl.object(), Txg(200));
    assert_eq!(store.list_space(b0).unwrap().used, 1024);
    assert_eq!(store.list_space(b100).unwrap().used, 4096);
    assert_eq!(store.list_space(b200).unwrap().used, 512);

    assert_eq!(dl.space().unwrap(), SpaceTotals::new(5632, 2816, 11264));
}

#[test]
fn untouched_buckets_share_the_empty_list() {
    let store = Arc::new(MemStore::new());
    let tx = Tx::new(Txg(300));
    let dl = bucketed(&store, &tx);
    assert_eq!(store.empty_refs(), 3);

    // First insert swaps in a real list and drops one shared reference.
    dl.insert(&bp(150, 4096), &tx).unwrap();
    assert_eq!(store.empty_refs(), 2);
    assert_ne!(
        bucket_for(&store, dl.object(), Txg(100)),
        store.empty_list_object()
    );
    assert_eq!(
        bucket_for(&store, dl.object(), Txg(200)),
        store.empty_list_object()
    );
}

#[test]
fn header_totals_survive_reopen() {
    let store = Arc::new(MemStore::new());
    let tx = Tx::new(Txg(300));
    let dl = bucketed(&store, &tx);
    dl.insert(&bp(150, 4096), &tx).unwrap();
    dl.insert(&bp(250, 512), &tx).unwrap();
    let obj = dl.object();
    let before = dl.space().unwrap();
    dl.close();

    let dl = Deadlist::open(Arc::clone(&store), obj).unwrap();
    assert!(!dl.is_legacy());
    assert_eq!(dl.space().unwrap(), before);
}

#[test]
fn space_range_sums_births_in_half_open_interval() {
    let store = Arc::new(MemStore::new());
    let tx = Tx::new(Txg(300));
    let dl = bucketed(&store, &tx);
    dl.insert(&bp(50, 1), &tx).unwrap();
    dl.insert(&bp(100, 10), &tx).unwrap();
    dl.insert(&bp(150, 100), &tx).unwrap();
    dl.insert(&bp(250, 1000), &tx).unwrap();

    // Tree view is resident after the inserts.
    assert_eq!(dl.space_range(Txg(0), Txg(100)).unwrap().used, 11);
    assert_eq!(dl.space_range(Txg(100), Txg(200)).unwrap().used, 100);
    assert_eq!(dl.space_range(Txg(0), Txg(u64::MAX)).unwrap().used, 1111);

    // Same answers through the cache view after a fresh open.
    let dl = Deadlist::open(Arc::clone(&store), dl.object()).unwrap();
    assert_eq!(dl.space_range(Txg(0), Txg(100)).unwrap().used, 11);
    assert_eq!(dl.space_range(Txg(100), Txg(200)).unwrap().used, 100);
    assert_eq!(dl.space_range(Txg(200), Txg(300)).unwrap().used, 1000);
    assert_eq!(dl.space_range(Txg(300), Txg(400)).unwrap().used, 0);
}

#[test]
fn remove_key_folds_bucket_into_predecessor() {
    let store = Arc::new(MemStore::new());
    let tx = Tx::new(Txg(300));
    let dl = bucketed(&store, &tx);
    dl.insert(&bp(50, 1), &tx).unwrap();
    dl.insert(&bp(150, 100), &tx).unwrap();
    let total = dl.space().unwrap();

    dl.remove_key(Txg(100), &tx).unwrap();

    let keys: Vec<Txg> = store
        .map_entries(dl.object())
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec![Txg(0), Txg(200)]);

    // Totals are unchanged and the merged blocks answer from bucket 0.
    assert_eq!(dl.space().unwrap(), total);
    let b0 = bucket_for(&store, dl.object(), Txg(0));
    assert_eq!(store.list_space(b0).unwrap().used, 101);
}

#[test]
fn remove_key_of_empty_bucket_releases_shared_list() {
    let store = Arc::new(MemStore::new());
    let tx = Tx::new(Txg(300));
    let dl = bucketed(&store, &tx);
    assert_eq!(store.empty_refs(), 3);
    dl.remove_key(Txg(200), &tx).unwrap();
    assert_eq!(store.empty_refs(), 2);
}

#[test]
#[should_panic(expected = "nonexistent deadlist key")]
fn remove_key_panics_on_missing_key() {
    let store = Arc::new(MemStore::new());
    let tx = Tx::new(Txg(300));
    let dl = bucketed(&store, &tx);
    dl.remove_key(Txg(50), &tx).unwrap();
}

#[test]
#[should_panic(expected = "no predecessor bucket")]
fn remove_key_panics_without_predecessor() {
    let store = Arc::new(MemStore::new());
    let tx = Tx::new(Txg(300));
    let dl = bucketed(&store, &tx);
    dl.remove_key(Txg(0), &tx).unwrap();
}

#[test]
fn legacy_mode_scans_and_ignores_keys() {
    let store = Arc::new(MemStore::new());
    let tx = Tx::new(Txg(300));
    let obj = store.list_create(&tx).unwrap();
    let dl = Deadlist::open(Arc::clone(&store), obj).unwrap();
    assert!(dl.is_legacy());

    // Key maintenance is a silent no-op on the flat shape.
    dl.add_key(Txg(100), &tx).unwrap();
    dl.remove_key(Txg(100), &tx).unwrap();

    dl.insert(&bp(50, 1), &tx).unwrap();
    dl.insert(&bp(150, 100), &tx).unwrap();
    dl.insert(&bp(250, 1000), &tx).unwrap();

    assert_eq!(dl.space().unwrap().used, 1101);
    // Full scan: births in (100, 200].
    assert_eq!(dl.space_range(Txg(100), Txg(200)).unwrap().used, 100);
    // The boundary is exclusive below, inclusive above.
    assert_eq!(dl.space_range(Txg(50), Txg(150)).unwrap().used, 100);
    assert_eq!(dl.space_range(Txg(49), Txg(150)).unwrap().used, 101);
}

#[test]
fn clone_structure_copies_boundaries_below_maxtxg() {
    let store = Arc::new(MemStore::new());
    let tx = Tx::new(Txg(300));
    let dl = bucketed(&store, &tx);
    dl.insert(&bp(150, 100), &tx).unwrap();

    let newobj = dl.clone_structure(Txg(200), None, &tx).unwrap();
    let clone = Deadlist::open(Arc::clone(&store), newobj).unwrap();

    let keys: Vec<Txg> = store
        .map_entries(newobj)
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec![Txg(0), Txg(100)]);
    // Structure only, no content.
    assert!(clone.space().unwrap().is_zero());
}

#[test]
fn clone_structure_regenerates_keys_from_snapshot_chain() {
    let store = Arc::new(MemStore::new());
    let tx = Tx::new(Txg(300));
    let obj = store.list_create(&tx).unwrap();
    let dl = Deadlist::open(Arc::clone(&store), obj).unwrap();

    // Chain newest-to-oldest: boundaries 200, 100, 0.
    let s0 = store.register_snapshot(Txg(0), None);
    let s1 = store.register_snapshot(Txg(100), Some(s0));
    let s2 = store.register_snapshot(Txg(200), Some(s1));

    let newobj = dl.clone_structure(Txg(150), Some(s2), &tx).unwrap();
    let keys: Vec<Txg> = store
        .map_entries(newobj)
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec![Txg(0), Txg(100)]);
}

#[test]
fn merge_flat_list_inserts_block_by_block() {
    let store = Arc::new(MemStore::new());
    let tx = Tx::new(Txg(300));
    let dl = bucketed(&store, &tx);

    let flat = store.list_create(&tx).unwrap();
    store.list_append(flat, &bp(50, 1), &tx).unwrap();
    store.list_append(flat, &bp(150, 100), &tx).unwrap();

    dl.merge(flat, &tx).unwrap();
    assert_eq!(dl.space().unwrap().used, 101);
    assert_eq!(dl.space_range(Txg(100), Txg(200)).unwrap().used, 100);
}

#[test]
fn merge_bucketed_source_splices_and_zeroes_it() {
    let store = Arc::new(MemStore::new());
    let tx = Tx::new(Txg(300));
    let dst = bucketed(&store, &tx);
    let src = bucketed(&store, &tx);
    dst.insert(&bp(150, 100), &tx).unwrap();
    src.insert(&bp(150, 7), &tx).unwrap();
    src.insert(&bp(250, 1000), &tx).unwrap();
    let src_obj = src.object();
    src.close();

    dst.merge(src_obj, &tx).unwrap();

    assert_eq!(dst.space().unwrap().used, 1107);
    assert_eq!(dst.space_range(Txg(100), Txg(200)).unwrap().used, 107);
    assert_eq!(dst.space_range(Txg(200), Txg(300)).unwrap().used, 1000);

    // The source is drained: no entries, zeroed header.
    assert!(store.map_entries(src_obj).unwrap().is_empty());
    assert!(store.read_header(src_obj).unwrap().is_zero());
}

#[test]
fn move_buckets_relocates_tail_and_adjusts_totals() {
    let store = Arc::new(MemStore::new());
    let tx = Tx::new(Txg(300));
    let dl = bucketed(&store, &tx);
    dl.insert(&bp(50, 1), &tx).unwrap();
    dl.insert(&bp(150, 100), &tx).unwrap();
    dl.insert(&bp(250, 1000), &tx).unwrap();

    let target = store.list_create(&tx).unwrap();
    dl.move_buckets(target, Txg(100), &tx).unwrap();

    assert_eq!(store.list_space(target).unwrap().used, 1100);
    assert_eq!(dl.space().unwrap().used, 1);
    let keys: Vec<Txg> = store
        .map_entries(dl.object())
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec![Txg(0)]);
}

#[test]
fn discard_tree_then_mutate_reloads_from_store() {
    let store = Arc::new(MemStore::new());
    let tx = Tx::new(Txg(300));
    let dl = bucketed(&store, &tx);
    dl.insert(&bp(150, 100), &tx).unwrap();

    dl.discard_tree();
    dl.insert(&bp(160, 11), &tx).unwrap();
    assert_eq!(dl.space_range(Txg(100), Txg(200)).unwrap().used, 111);
}

#[test]
fn free_releases_empty_references_and_objects() {
    let store = Arc::new(MemStore::new());
    let tx = Tx::new(Txg(300));
    let dl = bucketed(&store, &tx);
    dl.insert(&bp(150, 100), &tx).unwrap();
    let obj = dl.object();
    dl.close();
    assert_eq!(store.empty_refs(), 2);

    let baseline = store.object_count();
    Deadlist::<MemStore>::free(&store, obj, &tx).unwrap();
    assert_eq!(store.empty_refs(), 0);
    // The bucket map and the one real bucket list are both gone.
    assert_eq!(store.object_count(), baseline - 2);
}

proptest! {
    /// Bucketed range queries agree with a brute-force scan of every block,
    /// for arbitrary bucket boundaries and insertion orders.
    #[test]
    fn space_range_matches_full_scan(
        mut boundaries in proptest::collection::btree_set(1_u64..1000, 0..8),
        blocks in proptest::collection::vec((1_u64..1000, 1_u64..4096), 0..64),
        mintxg in 0_u64..1000,
        span in 0_u64..1000,
    ) {
        boundaries.insert(0);
        let maxtxg = mintxg.saturating_add(span);

        let store = Arc::new(MemStore::new());
        let tx = Tx::new(Txg(1000));
        let obj = Deadlist::allocate(store.as_ref(), &tx).unwrap();
        let dl = Deadlist::open(Arc::clone(&store), obj).unwrap();
        for &b in &boundaries {
            dl.add_key(Txg(b), &tx).unwrap();
        }
        for &(birth, size) in &blocks {
            dl.insert(&bp(birth, size), &tx).unwrap();
        }

        let mut expect = SpaceTotals::default();
        for &(birth, size) in &blocks {
            // Bucket routing quantizes a block's birth down to its bucket
            // boundary, so the query sees bucket keys, not raw births.
            let bucket = *boundaries.range(..birth).next_back().unwrap();
            if bucket >= mintxg && bucket < maxtxg {
                expect.add_block(&bp(birth, size));
            }
        }

        // Tree view (resident after inserts), then cache view via reopen.
        prop_assert_eq!(dl.space_range(Txg(mintxg), Txg(maxtxg)).unwrap(), expect);
        let dl = Deadlist::open(Arc::clone(&store), obj).unwrap();
        prop_assert_eq!(dl.space_range(Txg(mintxg), Txg(maxtxg)).unwrap(), expect);
    }
}
