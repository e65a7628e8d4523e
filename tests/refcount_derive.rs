use fxfsr::refcount::derive_refcounts;
use fxfsr::rmap::{RmapOwner, RmapRecord};
use fxfsr::rmap_store::RmapStore;
use fxfsr::xfs::types::GroupNo;

fn file_rmap(ino: u64, start: u32, len: u32) -> RmapRecord {
    RmapRecord {
        start_block: start,
        block_count: len,
        owner: RmapOwner::Inode(ino),
        offset: 0,
        attr_fork: false,
        bmbt_block: false,
        unwritten: false,
    }
}

fn collect(store: &mut RmapStore) -> Vec<(u32, u32, u32)> {
    let derived = derive_refcounts(store).unwrap();
    let mut out = Vec::new();
    let mut cur = derived.records.cursor();
    while let Some(rec) = cur.next().unwrap() {
        out.push((
            rec.rc_startblock.get(),
            rec.rc_blockcount.get(),
            rec.rc_refcount.get(),
        ));
    }
    out
}

#[test]
fn overlapping_rmaps_produce_stepped_refcounts() {
    let mut store = RmapStore::create(GroupNo::Ag(0)).unwrap();
    store.map_raw(file_rmap(100, 10, 5)).unwrap();
    store.map_raw(file_rmap(101, 12, 6)).unwrap();
    store.map_raw(file_rmap(102, 14, 2)).unwrap();

    // Cover heights: 2 on [12,14), 3 on [14,15), 2 on [15,16).
    assert_eq!(collect(&mut store), vec![(12, 2, 2), (14, 1, 3), (15, 1, 2)]);
}

#[test]
fn all_overlapping_inodes_are_marked_shared() {
    let mut store = RmapStore::create(GroupNo::Ag(0)).unwrap();
    store.map_raw(file_rmap(100, 10, 5)).unwrap();
    store.map_raw(file_rmap(101, 12, 6)).unwrap();
    store.map_raw(file_rmap(102, 14, 2)).unwrap();

    let derived = derive_refcounts(&mut store).unwrap();
    let mut shared: Vec<u64> = derived.shared_inodes.into_iter().collect();
    shared.sort_unstable();
    assert_eq!(shared, vec![100, 101, 102]);
}

#[test]
fn disjoint_rmaps_derive_nothing() {
    let mut store = RmapStore::create(GroupNo::Ag(0)).unwrap();
    store.map_raw(file_rmap(100, 10, 5)).unwrap();
    store.map_raw(file_rmap(101, 20, 5)).unwrap();

    assert!(collect(&mut store).is_empty());
}

#[test]
fn unwritten_and_attr_mappings_never_share() {
    let mut store = RmapStore::create(GroupNo::Ag(0)).unwrap();
    store.map_raw(file_rmap(100, 10, 8)).unwrap();
    store
        .map_raw(RmapRecord {
            unwritten: true,
            ..file_rmap(101, 10, 8)
        })
        .unwrap();
    store
        .map_raw(RmapRecord {
            attr_fork: true,
            ..file_rmap(102, 12, 4)
        })
        .unwrap();

    assert!(collect(&mut store).is_empty());
}

#[test]
fn metadata_owners_never_share() {
    let mut store = RmapStore::create(GroupNo::Ag(0)).unwrap();
    store.map_raw(file_rmap(100, 10, 8)).unwrap();
    store
        .map_raw(RmapRecord::metadata(10, 8, RmapOwner::AgMeta))
        .unwrap();

    assert!(collect(&mut store).is_empty());
}

#[test]
fn derived_records_never_overlap_and_stay_above_one() {
    let mut store = RmapStore::create(GroupNo::Ag(0)).unwrap();
    // A pile of mappings with ragged overlap.
    for i in 0..20u64 {
        store
            .map_raw(file_rmap(200 + i, (i * 3) as u32, 10))
            .unwrap();
    }

    let recs = collect(&mut store);
    assert!(!recs.is_empty());
    for w in recs.windows(2) {
        let (s0, l0, _) = w[0];
        let (s1, _, _) = w[1];
        assert!(s0 + l0 <= s1, "refcount records overlap: {w:?}");
    }
    for &(_, len, refcount) in &recs {
        assert!(len >= 1);
        assert!(refcount >= 2);
    }
}

#[test]
fn derivation_is_repeatable() {
    let mut store = RmapStore::create(GroupNo::Ag(0)).unwrap();
    store.map_raw(file_rmap(100, 10, 5)).unwrap();
    store.map_raw(file_rmap(101, 12, 6)).unwrap();

    let first = collect(&mut store);
    let second = collect(&mut store);
    assert_eq!(first, second);
}
