use fxfsr::FxfsrError;
use fxfsr::rmap::{RmapOwner, RmapRecord};
use fxfsr::rmap_store::RmapStore;
use fxfsr::xfs::types::{GroupNo, MAX_EXTENT_LEN};

fn file_rmap(ino: u64, start: u32, len: u32, offset: u64) -> RmapRecord {
    RmapRecord {
        start_block: start,
        block_count: len,
        owner: RmapOwner::Inode(ino),
        offset,
        attr_fork: false,
        bmbt_block: false,
        unwritten: false,
    }
}

#[test]
fn contiguous_same_owner_mappings_merge() {
    let a = file_rmap(100, 10, 5, 0);
    let b = file_rmap(100, 15, 5, 5);
    assert!(a.is_mergeable(&b));
}

#[test]
fn logical_discontinuity_blocks_the_merge() {
    let a = file_rmap(100, 10, 5, 0);
    let b = file_rmap(100, 15, 5, 9);
    assert!(!a.is_mergeable(&b));
}

#[test]
fn flag_mismatch_blocks_the_merge() {
    let a = file_rmap(100, 10, 5, 0);
    let mut b = file_rmap(100, 15, 5, 5);
    b.unwritten = true;
    assert!(!a.is_mergeable(&b));

    let mut c = file_rmap(100, 15, 5, 5);
    c.attr_fork = true;
    assert!(!a.is_mergeable(&c));
}

#[test]
fn merges_never_overflow_the_record_length() {
    let a = file_rmap(100, 0, MAX_EXTENT_LEN as u32 - 1, 0);
    let b = file_rmap(100, MAX_EXTENT_LEN as u32 - 1, 2, MAX_EXTENT_LEN - 1);
    assert!(!a.is_mergeable(&b));
}

#[test]
fn bmbt_blocks_ignore_logical_offsets_when_merging() {
    let mut a = file_rmap(100, 10, 1, 0);
    a.bmbt_block = true;
    let mut b = file_rmap(100, 11, 1, 0);
    b.bmbt_block = true;
    assert!(a.is_mergeable(&b));
}

#[test]
fn metadata_owners_reject_fork_state() {
    let bad = RmapRecord {
        offset: 7,
        ..RmapRecord::metadata(10, 5, RmapOwner::AgMeta)
    };
    assert!(matches!(bad.validate(), Err(FxfsrError::Parse(_))));

    let good = RmapRecord::metadata(10, 5, RmapOwner::Log);
    assert!(good.validate().is_ok());
}

#[test]
fn zero_length_records_are_invalid() {
    let bad = RmapRecord::metadata(10, 0, RmapOwner::AgMeta);
    assert!(bad.validate().is_err());
}

#[test]
fn max_length_records_are_storable() {
    let rec = file_rmap(100, 0, MAX_EXTENT_LEN as u32, 0);
    assert!(rec.validate().is_ok());

    let mut store = RmapStore::create(GroupNo::Ag(0)).unwrap();
    store.map_raw(rec).unwrap();
    assert_eq!(store.len(), 1);
    let got = store.to_vec().unwrap();
    assert_eq!(got[0].block_count as u64, MAX_EXTENT_LEN);
}

#[test]
fn disk_form_round_trips_flags() {
    let mut rec = file_rmap(100, 42, 7, 13);
    rec.unwritten = true;
    rec.attr_fork = true;
    let back = RmapRecord::from_disk(&rec.to_disk());
    assert_eq!(back, rec);

    let meta = RmapRecord::metadata(5, 2, RmapOwner::FsHeaders);
    assert_eq!(RmapRecord::from_disk(&meta.to_disk()), meta);
}

#[test]
fn shareability_rules() {
    assert!(file_rmap(100, 10, 5, 0).is_shareable());
    assert!(!RmapRecord { unwritten: true, ..file_rmap(100, 10, 5, 0) }.is_shareable());
    assert!(!RmapRecord { attr_fork: true, ..file_rmap(100, 10, 5, 0) }.is_shareable());
    assert!(!RmapRecord { bmbt_block: true, ..file_rmap(100, 10, 5, 0) }.is_shareable());
    assert!(!RmapRecord::metadata(10, 5, RmapOwner::AgMeta).is_shareable());
}

#[test]
fn store_merges_adjacent_inserts() {
    let mut store = RmapStore::create(GroupNo::Ag(0)).unwrap();
    store.map_raw(file_rmap(100, 10, 5, 0)).unwrap();
    store.map_raw(file_rmap(100, 15, 5, 5)).unwrap();
    assert_eq!(store.len(), 1);

    let recs = store.to_vec().unwrap();
    assert_eq!(recs[0].start_block, 10);
    assert_eq!(recs[0].block_count, 10);
}

#[test]
fn store_merges_a_gap_filler_on_both_sides() {
    let mut store = RmapStore::create(GroupNo::Ag(0)).unwrap();
    store.map_raw(file_rmap(100, 10, 5, 0)).unwrap();
    store.map_raw(file_rmap(100, 20, 5, 10)).unwrap();
    assert_eq!(store.len(), 2);
    store.map_raw(file_rmap(100, 15, 5, 5)).unwrap();
    assert_eq!(store.len(), 1);

    let recs = store.to_vec().unwrap();
    assert_eq!((recs[0].start_block, recs[0].block_count), (10, 15));
}

#[test]
fn store_iterates_in_key_order_after_many_inserts() {
    let mut store = RmapStore::create(GroupNo::Ag(0)).unwrap();
    // Insert in a scrambled but deterministic order, with gaps so
    // nothing merges.
    for i in 0..2000u32 {
        let start = (i * 7919) % 100_000;
        store
            .map_raw(file_rmap(500 + i as u64, start * 2, 1, 0))
            .unwrap();
    }
    assert_eq!(store.len(), 2000);

    let recs = store.to_vec().unwrap();
    for w in recs.windows(2) {
        assert!(w[0].key() < w[1].key(), "iteration out of order");
    }
}

#[test]
fn store_unmap_removes_exact_records() {
    let mut store = RmapStore::create(GroupNo::Ag(0)).unwrap();
    let rec = file_rmap(100, 10, 5, 0);
    store.map_raw(rec).unwrap();
    assert!(store.unmap(&rec).unwrap());
    assert!(store.is_empty());
    assert!(!store.unmap(&rec).unwrap());
}
