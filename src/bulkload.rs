//! Bulk btree loader: given a sorted record stream and a record count,
//! pre-compute the shape of the finished tree, then stream the records
//! into freshly claimed blocks in one left-to-right pass per level.

use crate::error::FxfsrError;
use crate::xfs::types::XfsAgblock;

/// Fill policy inputs for one level class.
#[derive(Debug, Clone, Copy)]
pub struct LevelLimits {
    pub maxrecs: usize,
    pub minrecs: usize,
}

/// Shape of one level of the finished tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelGeometry {
    pub nr_blocks: u64,
    pub nr_items: u64,
    pub items_per_block: usize,
}

/// Complete shape of the finished tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadGeometry {
    /// Levels, leaves first. The root block is included when the root
    /// lives on disk.
    pub levels: Vec<LevelGeometry>,
    pub height: usize,
    /// Blocks to claim from the reservation pool.
    pub nr_blocks: u64,
    /// Entry count of an externally stored root (inode-fork trees).
    pub root_entries: Option<u64>,
}

/// Slack encoding: negative means "pick the default".
pub const SLACK_DEFAULT: i64 = -1;

/// Records to leave per block under low-space pressure.
const LOW_SPACE_SLACK: usize = 2;

fn items_per_block(limits: LevelLimits, slack: i64, low_space: bool) -> usize {
    let desired = if low_space {
        limits.maxrecs.saturating_sub(LOW_SPACE_SLACK)
    } else if slack < 0 {
        (limits.maxrecs + limits.minrecs) / 2
    } else {
        limits.maxrecs.saturating_sub(slack as usize)
    };
    desired.clamp(limits.minrecs.max(1), limits.maxrecs)
}

/// Compute the block demand of a tree holding `record_count` records.
///
/// `root_limits` of `Some` describes a root stored outside the claimed
/// blocks (an inode-fork root): the build stops as soon as a level's
/// block count fits in it.
pub fn compute_geometry(
    leaf: LevelLimits,
    node: LevelLimits,
    leaf_slack: i64,
    node_slack: i64,
    low_space: bool,
    record_count: u64,
    root_limits: Option<usize>,
) -> LoadGeometry {
    let mut levels = Vec::new();
    let mut nr_blocks = 0u64;
    let mut items = record_count;
    let mut level = 0usize;
    let mut root_entries = None;

    loop {
        let limits = if level == 0 { leaf } else { node };
        let slack = if level == 0 { leaf_slack } else { node_slack };
        let per_block = items_per_block(limits, slack, low_space);
        let blocks = items.div_ceil(per_block as u64).max(1);

        levels.push(LevelGeometry {
            nr_blocks: blocks,
            nr_items: items,
            items_per_block: per_block,
        });
        nr_blocks += blocks;
        level += 1;

        if blocks == 1 {
            break;
        }
        if let Some(root_max) = root_limits {
            if blocks as usize <= root_max {
                // The next level up is the in-fork root.
                root_entries = Some(blocks);
                level += 1;
                break;
            }
        }
        items = blocks;
    }

    LoadGeometry { levels, height: level, nr_blocks, root_entries }
}

/// Sorted record producer for one load. Records and keys move as raw
/// big-endian bytes; keys compare lexicographically.
pub trait BulkSource {
    fn rec_size(&self) -> usize;
    /// Node key size. Overlapping-interval trees store low and high
    /// keys per entry; this is the combined size.
    fn key_size(&self) -> usize;
    /// Byte offset of the high key within a combined key, if any.
    fn high_key_off(&self) -> Option<usize>;
    /// Encode the next record and its (combined) key.
    fn next_record(&mut self, rec: &mut [u8], key: &mut [u8]) -> Result<(), FxfsrError>;
}

/// Block consumer for one load.
pub trait BulkSink {
    /// Take the next pre-reserved block.
    fn claim_block(&mut self) -> Result<XfsAgblock, FxfsrError>;
    /// Emit one finished leaf block.
    fn write_leaf(
        &mut self,
        blkno: XfsAgblock,
        leftsib: Option<XfsAgblock>,
        rightsib: Option<XfsAgblock>,
        recs: &[u8],
        nrecs: usize,
    ) -> Result<(), FxfsrError>;
    /// Emit one finished node block.
    #[allow(clippy::too_many_arguments)]
    fn write_node(
        &mut self,
        blkno: XfsAgblock,
        level: u16,
        leftsib: Option<XfsAgblock>,
        rightsib: Option<XfsAgblock>,
        keys: &[u8],
        ptrs: &[XfsAgblock],
        nrecs: usize,
    ) -> Result<(), FxfsrError>;
    /// Install an externally stored root (inode-fork trees only).
    fn write_root(
        &mut self,
        level: u16,
        keys: &[u8],
        ptrs: &[XfsAgblock],
    ) -> Result<(), FxfsrError> {
        let _ = (level, keys, ptrs);
        Err(FxfsrError::Parse("tree has no external root"))
    }
}

/// Result of a completed load.
#[derive(Debug, Clone)]
pub struct LoadResult {
    /// Root block for on-disk-rooted trees.
    pub root_block: Option<XfsAgblock>,
    pub height: usize,
    pub blocks_written: u64,
}

/// Stream `geom.levels[0].nr_items` records from `source` into the
/// tree, building each level left to right and keying every node entry
/// on the first key of its child.
pub fn load<S: BulkSource, K: BulkSink>(
    geom: &LoadGeometry,
    source: &mut S,
    sink: &mut K,
) -> Result<LoadResult, FxfsrError> {
    let rec_size = source.rec_size();
    let key_size = source.key_size();
    let mut blocks_written = 0u64;

    // ---- Level 0: leaves ----
    let leaf_geom = &geom.levels[0];
    let blknos = claim_level(sink, leaf_geom.nr_blocks)?;
    let mut parent_entries: Vec<(Vec<u8>, XfsAgblock)> = Vec::with_capacity(blknos.len());

    let mut remaining = leaf_geom.nr_items;
    let mut rec_buf = vec![0u8; rec_size];
    let mut key_buf = vec![0u8; key_size];
    for (i, &blkno) in blknos.iter().enumerate() {
        let blocks_left = (blknos.len() - i) as u64;
        let count = remaining.div_ceil(blocks_left) as usize;
        let mut recs = vec![0u8; count * rec_size];
        let mut block_key: Option<Vec<u8>> = None;

        for r in 0..count {
            source.next_record(&mut rec_buf, &mut key_buf)?;
            recs[r * rec_size..(r + 1) * rec_size].copy_from_slice(&rec_buf);
            match &mut block_key {
                None => block_key = Some(key_buf.clone()),
                Some(k) => merge_high_key(k, &key_buf, source.high_key_off()),
            }
        }
        remaining -= count as u64;

        sink.write_leaf(
            blkno,
            (i > 0).then(|| blknos[i - 1]),
            (i + 1 < blknos.len()).then(|| blknos[i + 1]),
            &recs,
            count,
        )?;
        blocks_written += 1;
        parent_entries.push((block_key.unwrap_or_else(|| vec![0u8; key_size]), blkno));
    }

    // ---- Interior levels ----
    let mut level = 1usize;
    let mut entries = parent_entries;
    while level < geom.levels.len() {
        let lvl_geom = &geom.levels[level];
        let blknos = claim_level(sink, lvl_geom.nr_blocks)?;
        let mut next_entries: Vec<(Vec<u8>, XfsAgblock)> = Vec::with_capacity(blknos.len());

        let mut taken = 0usize;
        for (i, &blkno) in blknos.iter().enumerate() {
            let blocks_left = blknos.len() - i;
            let count = (entries.len() - taken).div_ceil(blocks_left);
            let chunk = &entries[taken..taken + count];
            taken += count;

            let mut keys = vec![0u8; count * key_size];
            let mut ptrs = Vec::with_capacity(count);
            let mut block_key: Option<Vec<u8>> = None;
            for (e, (k, p)) in chunk.iter().enumerate() {
                keys[e * key_size..(e + 1) * key_size].copy_from_slice(k);
                ptrs.push(*p);
                match &mut block_key {
                    None => block_key = Some(k.clone()),
                    Some(bk) => merge_high_key(bk, k, source.high_key_off()),
                }
            }

            sink.write_node(
                blkno,
                level as u16,
                (i > 0).then(|| blknos[i - 1]),
                (i + 1 < blknos.len()).then(|| blknos[i + 1]),
                &keys,
                &ptrs,
                count,
            )?;
            blocks_written += 1;
            next_entries.push((block_key.unwrap_or_else(|| vec![0u8; key_size]), blkno));
        }
        entries = next_entries;
        level += 1;
    }

    // ---- Root ----
    if geom.root_entries.is_some() {
        let mut keys = vec![0u8; entries.len() * key_size];
        let mut ptrs = Vec::with_capacity(entries.len());
        for (e, (k, p)) in entries.iter().enumerate() {
            keys[e * key_size..(e + 1) * key_size].copy_from_slice(k);
            ptrs.push(*p);
        }
        sink.write_root(geom.height as u16 - 1, &keys, &ptrs)?;
        return Ok(LoadResult { root_block: None, height: geom.height, blocks_written });
    }

    debug_assert_eq!(entries.len(), 1);
    Ok(LoadResult {
        root_block: Some(entries[0].1),
        height: geom.height,
        blocks_written,
    })
}

fn claim_level<K: BulkSink>(sink: &mut K, n: u64) -> Result<Vec<XfsAgblock>, FxfsrError> {
    let mut blknos = Vec::with_capacity(n as usize);
    for _ in 0..n {
        blknos.push(sink.claim_block()?);
    }
    Ok(blknos)
}

/// Fold a later entry's key into a block's own key: the low part stays
/// (first child wins), the high part takes the lexicographic maximum.
fn merge_high_key(block_key: &mut [u8], entry_key: &[u8], high_off: Option<usize>) {
    if let Some(off) = high_off {
        if entry_key[off..] > block_key[off..] {
            block_key[off..].copy_from_slice(&entry_key[off..]);
        }
    }
}
