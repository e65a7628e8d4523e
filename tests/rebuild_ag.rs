mod common;

use common::geometry_v4;
use fxfsr::io::bufcache::BufCache;
use fxfsr::io::device::{BlockDev, DevKind};
use fxfsr::mem::slab::Slab;
use fxfsr::ondisk::free_extent;
use fxfsr::rebuild::AgRebuilder;
use fxfsr::rmap::{RmapOwner, RmapRecord};
use fxfsr::rmap_store::RmapStore;
use fxfsr::xfs::agheaders::{XfsAgf, XfsAgi};
use fxfsr::xfs::format::{XfsInobtRec, XfsRefcountRec};
use fxfsr::xfs::geometry::{BtreeKind, FsGeometry};
use fxfsr::xfs::types::GroupNo;
use tempfile::NamedTempFile;

fn empty_image(geo: &FsGeometry) -> NamedTempFile {
    let file = NamedTempFile::new().unwrap();
    file.as_file()
        .set_len(geo.dblocks * geo.block_size as u64)
        .unwrap();
    file
}

/// Incore state for one small AG: fixed headers, one inode chunk, one
/// file extent.
fn populated_store() -> (RmapStore, Vec<XfsInobtRec>) {
    let mut store = RmapStore::create(GroupNo::Ag(0)).unwrap();
    store
        .map_raw(RmapRecord::metadata(0, 1, RmapOwner::FsHeaders))
        .unwrap();
    store
        .map_raw(RmapRecord::metadata(10, 8, RmapOwner::Inodes))
        .unwrap();
    store
        .map_raw(RmapRecord {
            start_block: 50,
            block_count: 4,
            owner: RmapOwner::Inode(500),
            offset: 0,
            attr_fork: false,
            bmbt_block: false,
            unwritten: false,
        })
        .unwrap();

    let chunk = XfsInobtRec {
        ir_startino: 80.into(),
        ir_holemask: 0.into(),
        ir_count: 64,
        ir_freecount: 4,
        ir_free: (0xFu64 << 60).into(),
    };
    (store, vec![chunk])
}

fn parse_leaf_records(geo: &FsGeometry, block: &[u8], kind: BtreeKind) -> Vec<(u32, u32)> {
    let (level, numrecs) =
        fxfsr::xfs::format::parse_short_block(block, geo, kind, 0).unwrap();
    assert_eq!(level, 0);
    let hdr = fxfsr::xfs::format::short_hdr_size(geo.is_v5());
    (0..numrecs as usize)
        .map(|i| {
            let off = hdr + i * 8;
            (
                u32::from_be_bytes(block[off..off + 4].try_into().unwrap()),
                u32::from_be_bytes(block[off + 4..off + 8].try_into().unwrap()),
            )
        })
        .collect()
}

#[test]
fn rebuilt_group_headers_and_trees_are_consistent() {
    let geo = geometry_v4(1, 256);
    let image = empty_image(&geo);
    let dev = BlockDev::open(image.path().to_str().unwrap(), DevKind::Data).unwrap();
    let mut cache = BufCache::new(dev);

    let (mut store, chunks) = populated_store();
    let refcounts: Slab<XfsRefcountRec> = Slab::create("test refcounts").unwrap();
    let rebuilder =
        AgRebuilder::new(&geo, [0u8; 16], 0, false, &mut store, chunks, &refcounts).unwrap();
    let summary = rebuilder.run(&mut cache).unwrap();

    assert_eq!(summary.icount, 64);
    assert_eq!(summary.ifree, 4);
    assert!(summary.lost_blocks.is_empty());
    // 256 blocks minus 13 accounted by the rmap minus the reservations.
    assert_eq!(summary.freeblks, 256 - 13 - 7);

    // AGF reflects the new trees and counters.
    let dev = cache.target();
    let mut sector = vec![0u8; 512];
    dev.read_at(&mut sector, geo.agf_byte_offset(0)).unwrap();
    let agf = XfsAgf::from_buf(&sector, 0).unwrap();
    assert_eq!(agf.agf_freeblks.get() as u64, summary.freeblks);
    assert_eq!(agf.agf_flcount.get(), summary.flcount);
    assert_eq!(agf.agf_bno_level.get(), 1);
    assert_eq!(agf.agf_longest.get(), summary.longest);

    // AGI reflects the inode chunk.
    dev.read_at(&mut sector, geo.agi_byte_offset(0)).unwrap();
    let agi = XfsAgi::from_buf(&sector, 0).unwrap();
    assert_eq!(agi.agi_count.get(), 64);
    assert_eq!(agi.agi_freecount.get(), 4);
    assert_eq!(agi.agi_newino.get(), 80);

    // The bno root holds exactly the free extents, sorted by start.
    let mut block = vec![0u8; 4096];
    dev.read_at(&mut block, (agf.agf_bno_root.get() as u64) << 12)
        .unwrap();
    let recs = parse_leaf_records(&geo, &block, BtreeKind::Bno);
    let total: u64 = recs.iter().map(|&(_, l)| l as u64).sum();
    assert_eq!(total, summary.freeblks);
    for w in recs.windows(2) {
        assert!(w[0].0 + w[0].1 <= w[1].0, "bno records overlap or misordered");
    }

    // The cnt root holds the same extents ordered by length.
    dev.read_at(&mut block, (agf.agf_cnt_root.get() as u64) << 12)
        .unwrap();
    let by_len = parse_leaf_records(&geo, &block, BtreeKind::Cnt);
    for w in by_len.windows(2) {
        assert!(w[0].1 <= w[1].1, "cnt records misordered");
    }
    assert_eq!(by_len.len(), recs.len());

    // The inobt root holds the single chunk.
    dev.read_at(&mut block, (agi.agi_root.get() as u64) << 12)
        .unwrap();
    let (level, numrecs) =
        fxfsr::xfs::format::parse_short_block(&block, &geo, BtreeKind::Ino, 0).unwrap();
    assert_eq!((level, numrecs), (0, 1));
}

#[test]
fn empty_group_is_a_no_op() {
    let geo = geometry_v4(1, 256);
    let image = empty_image(&geo);
    let dev = BlockDev::open(image.path().to_str().unwrap(), DevKind::Data).unwrap();
    let mut cache = BufCache::new(dev);

    let mut zero_geo = geo.clone();
    zero_geo.dblocks = 0;
    let mut store = RmapStore::create(GroupNo::Ag(0)).unwrap();
    let refcounts: Slab<XfsRefcountRec> = Slab::create("test refcounts").unwrap();
    let rebuilder =
        AgRebuilder::new(&zero_geo, [0u8; 16], 0, false, &mut store, Vec::new(), &refcounts)
            .unwrap();
    let summary = rebuilder.run(&mut cache).unwrap();
    assert!(summary.trees.is_empty());
    assert_eq!(summary.freeblks, 0);
}

#[test]
fn a_full_group_cannot_be_rebuilt() {
    let geo = geometry_v4(1, 256);
    let image = empty_image(&geo);
    let dev = BlockDev::open(image.path().to_str().unwrap(), DevKind::Data).unwrap();
    let mut cache = BufCache::new(dev);

    // Every block owned: no free space for the new trees.
    let mut store = RmapStore::create(GroupNo::Ag(0)).unwrap();
    store
        .map_raw(RmapRecord::metadata(0, 256, RmapOwner::FsHeaders))
        .unwrap();
    let refcounts: Slab<XfsRefcountRec> = Slab::create("test refcounts").unwrap();
    let rebuilder =
        AgRebuilder::new(&geo, [0u8; 16], 0, false, &mut store, Vec::new(), &refcounts).unwrap();
    let err = rebuilder.run(&mut cache).unwrap_err();
    match err {
        fxfsr::FxfsrError::AgFull(agno) => assert_eq!(agno, 0),
        other => panic!("expected AgFull, got {other}"),
    }
}

#[test]
fn drained_blocks_land_in_the_free_space_trees() {
    let geo = geometry_v4(1, 256);
    let image = empty_image(&geo);
    let dev = BlockDev::open(image.path().to_str().unwrap(), DevKind::Data).unwrap();
    let mut cache = BufCache::new(dev);

    let (mut store, chunks) = populated_store();
    let refcounts: Slab<XfsRefcountRec> = Slab::create("test refcounts").unwrap();
    let rebuilder =
        AgRebuilder::new(&geo, [0u8; 16], 0, false, &mut store, chunks, &refcounts).unwrap();
    let summary = rebuilder.run(&mut cache).unwrap();

    // Drain two blocks as if they had been lost reservations.
    free_extent(&mut cache, &geo, 0, 4, 2).unwrap();

    let dev = cache.target();
    let mut sector = vec![0u8; 512];
    dev.read_at(&mut sector, geo.agf_byte_offset(0)).unwrap();
    let agf = XfsAgf::from_buf(&sector, 0).unwrap();
    assert_eq!(agf.agf_freeblks.get() as u64, summary.freeblks + 2);

    let mut block = vec![0u8; 4096];
    dev.read_at(&mut block, (agf.agf_bno_root.get() as u64) << 12)
        .unwrap();
    let recs = parse_leaf_records(&geo, &block, BtreeKind::Bno);
    assert!(recs.contains(&(4, 2)), "drained extent missing: {recs:?}");
}
