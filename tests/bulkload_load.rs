use std::collections::HashMap;

use fxfsr::FxfsrError;
use fxfsr::bulkload::{
    BulkSink, BulkSource, LevelLimits, SLACK_DEFAULT, compute_geometry, load,
};
use fxfsr::xfs::types::XfsAgblock;

const LEAF: LevelLimits = LevelLimits { maxrecs: 100, minrecs: 50 };
const NODE: LevelLimits = LevelLimits { maxrecs: 50, minrecs: 25 };

#[test]
fn geometry_with_zero_slack_and_fork_root() {
    let geom = compute_geometry(LEAF, NODE, 0, 0, false, 10_000, Some(50));

    assert_eq!(geom.levels[0].nr_blocks, 100);
    assert_eq!(geom.levels[1].nr_blocks, 2);
    assert_eq!(geom.nr_blocks, 102);
    assert_eq!(geom.height, 3);
    assert_eq!(geom.root_entries, Some(2));
}

#[test]
fn geometry_with_disk_root_counts_the_root_block() {
    let geom = compute_geometry(LEAF, NODE, 0, 0, false, 10_000, None);

    assert_eq!(geom.levels.len(), 3);
    assert_eq!(geom.levels[2].nr_blocks, 1);
    assert_eq!(geom.nr_blocks, 103);
    assert_eq!(geom.height, 3);
    assert_eq!(geom.root_entries, None);
}

#[test]
fn default_slack_targets_the_midpoint_fill() {
    let geom = compute_geometry(LEAF, NODE, SLACK_DEFAULT, SLACK_DEFAULT, false, 10_000, None);
    // (100 + 50) / 2 records per leaf.
    assert_eq!(geom.levels[0].nr_blocks, 10_000u64.div_ceil(75));
}

#[test]
fn low_space_packs_blocks_nearly_full() {
    let geom = compute_geometry(LEAF, NODE, SLACK_DEFAULT, SLACK_DEFAULT, true, 10_000, None);
    assert_eq!(geom.levels[0].nr_blocks, 10_000u64.div_ceil(98));
}

#[test]
fn tiny_record_counts_collapse_to_a_single_block() {
    let geom = compute_geometry(LEAF, NODE, 0, 0, false, 7, None);
    assert_eq!(geom.nr_blocks, 1);
    assert_eq!(geom.height, 1);
}

// ---------------------------------------------------------------------------
// Streaming load against an in-memory sink
// ---------------------------------------------------------------------------

struct SeqSource {
    next: u64,
    count: u64,
}

impl BulkSource for SeqSource {
    fn rec_size(&self) -> usize {
        8
    }

    fn key_size(&self) -> usize {
        8
    }

    fn high_key_off(&self) -> Option<usize> {
        None
    }

    fn next_record(&mut self, rec: &mut [u8], key: &mut [u8]) -> Result<(), FxfsrError> {
        assert!(self.next < self.count, "source overdrawn");
        rec.copy_from_slice(&self.next.to_be_bytes());
        key.copy_from_slice(&self.next.to_be_bytes());
        self.next += 1;
        Ok(())
    }
}

#[derive(Default)]
struct MemBlock {
    level: u16,
    leftsib: Option<XfsAgblock>,
    rightsib: Option<XfsAgblock>,
    recs: Vec<u64>,
    ptrs: Vec<XfsAgblock>,
}

#[derive(Default)]
struct MemSink {
    next_block: XfsAgblock,
    blocks: HashMap<XfsAgblock, MemBlock>,
}

impl BulkSink for MemSink {
    fn claim_block(&mut self) -> Result<XfsAgblock, FxfsrError> {
        let b = self.next_block;
        self.next_block += 1;
        Ok(b)
    }

    fn write_leaf(
        &mut self,
        blkno: XfsAgblock,
        leftsib: Option<XfsAgblock>,
        rightsib: Option<XfsAgblock>,
        recs: &[u8],
        nrecs: usize,
    ) -> Result<(), FxfsrError> {
        let mut block = MemBlock { level: 0, leftsib, rightsib, ..Default::default() };
        for i in 0..nrecs {
            block
                .recs
                .push(u64::from_be_bytes(recs[i * 8..(i + 1) * 8].try_into().unwrap()));
        }
        self.blocks.insert(blkno, block);
        Ok(())
    }

    fn write_node(
        &mut self,
        blkno: XfsAgblock,
        level: u16,
        leftsib: Option<XfsAgblock>,
        rightsib: Option<XfsAgblock>,
        keys: &[u8],
        ptrs: &[XfsAgblock],
        nrecs: usize,
    ) -> Result<(), FxfsrError> {
        let mut block = MemBlock { level, leftsib, rightsib, ..Default::default() };
        for i in 0..nrecs {
            block
                .recs
                .push(u64::from_be_bytes(keys[i * 8..(i + 1) * 8].try_into().unwrap()));
        }
        block.ptrs = ptrs.to_vec();
        self.blocks.insert(blkno, block);
        Ok(())
    }
}

#[test]
fn loaded_tree_iterates_in_input_order() {
    const COUNT: u64 = 10_000;
    let geom = compute_geometry(LEAF, NODE, 0, 0, false, COUNT, None);
    let mut source = SeqSource { next: 0, count: COUNT };
    let mut sink = MemSink::default();

    let result = load(&geom, &mut source, &mut sink).unwrap();
    assert_eq!(result.blocks_written, geom.nr_blocks);
    let root = result.root_block.unwrap();
    assert_eq!(sink.blocks[&root].level as usize, geom.height - 1);

    // Walk the leaf level left to right; leaves are claimed first, so
    // leaf 0 is the leftmost.
    let mut seen = Vec::with_capacity(COUNT as usize);
    let mut blkno = Some(0u32);
    let mut prev: Option<u32> = None;
    while let Some(b) = blkno {
        let block = &sink.blocks[&b];
        assert_eq!(block.level, 0);
        assert_eq!(block.leftsib, prev, "leaf {b} has a broken left link");
        seen.extend_from_slice(&block.recs);
        prev = Some(b);
        blkno = block.rightsib;
    }
    let expect: Vec<u64> = (0..COUNT).collect();
    assert_eq!(seen, expect);
}

#[test]
fn every_block_respects_the_record_bounds() {
    const COUNT: u64 = 10_000;
    let geom = compute_geometry(LEAF, NODE, SLACK_DEFAULT, SLACK_DEFAULT, false, COUNT, None);
    let mut source = SeqSource { next: 0, count: COUNT };
    let mut sink = MemSink::default();
    let result = load(&geom, &mut source, &mut sink).unwrap();
    let root = result.root_block.unwrap();

    for (&blkno, block) in &sink.blocks {
        if blkno == root {
            continue;
        }
        let limits = if block.level == 0 { LEAF } else { NODE };
        assert!(
            block.recs.len() >= limits.minrecs && block.recs.len() <= limits.maxrecs,
            "block {blkno} holds {} records",
            block.recs.len()
        );
    }
}

#[test]
fn node_entries_carry_the_first_key_of_each_child() {
    const COUNT: u64 = 10_000;
    let geom = compute_geometry(LEAF, NODE, 0, 0, false, COUNT, None);
    let mut source = SeqSource { next: 0, count: COUNT };
    let mut sink = MemSink::default();
    load(&geom, &mut source, &mut sink).unwrap();

    for block in sink.blocks.values() {
        if block.level == 0 {
            continue;
        }
        for (key, &child) in block.recs.iter().zip(&block.ptrs) {
            let child_block = &sink.blocks[&child];
            assert_eq!(*key, child_block.recs[0]);
        }
    }
}
