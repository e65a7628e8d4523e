//! Per-group rebuild driver: derive free space from the incore rmap,
//! reserve blocks for the new btrees, bulk-load free-space, inode,
//! rmap, and refcount trees, then write the group headers.

use zerocopy::IntoBytes;

use crate::bulkload::{
    BulkSink, BulkSource, LevelLimits, LoadGeometry, SLACK_DEFAULT, compute_geometry, load,
};
use crate::error::FxfsrError;
use crate::io::bufcache::{BufCache, SECTOR_SIZE};
use crate::io::device::BlockDev;
use crate::mem::bitmap::ExtentBitmap;
use crate::mem::slab::Slab;
use crate::rmap::{RmapOwner, RmapRecord};
use crate::rmap_store::RmapStore;
use crate::xfs::agheaders::{
    NULLAGBLOCK, NULLAGINO, XfsAgf, XfsAgi, agfl_max_slots, agfl_read_slots, agfl_write_slots,
};
use crate::xfs::format::{
    XfsAllocRec, XfsInobtRec, XfsRefcountRec, XfsRmapKey, init_short_block, set_numrecs,
    stamp_block_crc,
};
use crate::xfs::geometry::{BtreeGeometry, BtreeKind, FsGeometry};
use crate::xfs::types::{MAX_EXTENT_LEN, XfsAgblock, XfsAgnumber};

/// Convergence iterations before the driver gives up on a stable block
/// demand.
const MAX_PLAN_ITERS: usize = 32;

/// Free-extent fraction below which the loaders switch to compact fill.
const LOW_SPACE_PCT: u64 = 10;

/// One pre-reserved run of blocks for the new trees.
#[derive(Debug, Clone, Copy)]
pub struct BulkReservation {
    pub start: XfsAgblock,
    pub len: u32,
    pub consumed: u32,
}

/// Shape and placement decisions for one group, recomputed until two
/// successive iterations agree.
struct RebuildPlan {
    geoms: Vec<(BtreeKind, LoadGeometry)>,
    /// Blocks the trees will consume.
    tree_blocks: u64,
    /// Reservation leftovers routed to the freelist.
    agfl_blocks: Vec<XfsAgblock>,
    /// Leftovers beyond the freelist, to be drained later.
    lost_blocks: Vec<XfsAgblock>,
    /// Final rmap record list (incore records plus new-tree ownership).
    rmap_records: Vec<RmapRecord>,
    free_extents: Vec<(XfsAgblock, u32)>,
    demand: u64,
}

/// What one rebuilt tree looks like on disk.
#[derive(Debug, Clone, Copy)]
pub struct TreeSummary {
    pub kind: BtreeKind,
    pub root: XfsAgblock,
    pub levels: u32,
    pub blocks: u64,
}

/// Result of rebuilding one group.
#[derive(Debug)]
pub struct AgRebuildSummary {
    pub agno: XfsAgnumber,
    pub trees: Vec<TreeSummary>,
    pub freeblks: u64,
    pub longest: u32,
    pub flcount: u32,
    pub icount: u64,
    pub ifree: u64,
    pub lost_blocks: Vec<XfsAgblock>,
    /// The record set the new rmap btree was loaded from.
    pub rmap_records: Vec<RmapRecord>,
}

/// Rebuilds one allocation group's metadata btrees and headers.
pub struct AgRebuilder<'a> {
    geo: &'a FsGeometry,
    uuid: [u8; 16],
    agno: XfsAgnumber,
    no_modify: bool,
    free: ExtentBitmap,
    reservations: Vec<BulkReservation>,
    reserved_total: u64,
    base_rmaps: Vec<RmapRecord>,
    chunks: Vec<XfsInobtRec>,
    refcounts: Vec<XfsRefcountRec>,
}

impl<'a> AgRebuilder<'a> {
    pub fn new(
        geo: &'a FsGeometry,
        uuid: [u8; 16],
        agno: XfsAgnumber,
        no_modify: bool,
        rmap_store: &mut RmapStore,
        mut chunks: Vec<XfsInobtRec>,
        refcount_slab: &Slab<XfsRefcountRec>,
    ) -> Result<Self, FxfsrError> {
        let base_rmaps = rmap_store.to_vec()?;
        chunks.sort_by_key(|c| c.start_ino());

        // Free space is the complement of everything the rmap claims.
        let ag_size = geo.ag_size(agno) as u64;
        let mut free = ExtentBitmap::new();
        free.set_range(0, ag_size);
        for rec in &base_rmaps {
            free.clear_range(rec.start_block as u64, rec.block_count as u64);
        }

        let mut refcounts = Vec::with_capacity(refcount_slab.len() as usize);
        let mut cur = refcount_slab.cursor();
        while let Some(rec) = cur.next()? {
            refcounts.push(rec);
        }

        Ok(AgRebuilder {
            geo,
            uuid,
            agno,
            no_modify,
            free,
            reservations: Vec::new(),
            reserved_total: 0,
            base_rmaps,
            chunks,
            refcounts,
        })
    }

    fn which_trees(&self) -> Vec<BtreeKind> {
        let mut kinds = vec![BtreeKind::Bno, BtreeKind::Cnt, BtreeKind::Ino];
        if self.geo.has_finobt {
            kinds.push(BtreeKind::Fino);
        }
        if self.geo.has_rmapbt {
            kinds.push(BtreeKind::Rmap);
        }
        if self.geo.has_reflink {
            kinds.push(BtreeKind::Refc);
        }
        kinds
    }

    /// Minimum freelist population for allocator forward progress.
    fn agfl_min(&self) -> u64 {
        let ag_size = self.geo.ag_size(self.agno) as u64;
        let bno = BtreeGeometry::compute(BtreeKind::Bno, self.geo, ag_size);
        let mut need = 2 * bno.maxlevels as u64;
        if self.geo.has_rmapbt {
            let rmap = BtreeGeometry::compute(BtreeKind::Rmap, self.geo, ag_size);
            need += rmap.maxlevels as u64;
        }
        need
    }

    fn free_extents(&self) -> Vec<(XfsAgblock, u32)> {
        let mut out = Vec::new();
        for (start, len) in self.free.extents() {
            let mut s = start;
            let mut l = len;
            while l > MAX_EXTENT_LEN {
                out.push((s as XfsAgblock, MAX_EXTENT_LEN as u32));
                s += MAX_EXTENT_LEN;
                l -= MAX_EXTENT_LEN;
            }
            out.push((s as XfsAgblock, l as u32));
        }
        out
    }

    fn low_space(&self) -> bool {
        let ag_size = self.geo.ag_size(self.agno) as u64;
        self.free.weight() * 100 < ag_size * LOW_SPACE_PCT
    }

    /// Flattened claim order of the reservation list.
    fn reserved_blocks(&self) -> Vec<XfsAgblock> {
        let mut out = Vec::with_capacity(self.reserved_total as usize);
        for r in &self.reservations {
            for i in 0..r.len {
                out.push(r.start + i);
            }
        }
        out
    }

    /// Compute the current plan from the free bitmap and reservations.
    fn plan(&self) -> Result<RebuildPlan, FxfsrError> {
        let low_space = self.low_space();
        let reserved = self.reserved_blocks();
        let agfl_cap = agfl_max_slots(self.geo);

        // First pass without new-tree rmaps to seed the loop below.
        let mut rmap_records = self.base_rmaps.clone();
        let mut geoms;
        let mut tree_blocks;
        let mut agfl_take;
        let mut lost;
        let mut iters = 0;
        loop {
            geoms = Vec::new();
            tree_blocks = 0u64;
            let free_extents = self.free_extents();
            for kind in self.which_trees() {
                let count = match kind {
                    BtreeKind::Bno | BtreeKind::Cnt => free_extents.len() as u64,
                    BtreeKind::Ino => self.chunks.len() as u64,
                    BtreeKind::Fino => {
                        self.chunks.iter().filter(|c| c.ir_freecount > 0).count() as u64
                    }
                    BtreeKind::Rmap => rmap_records.len() as u64,
                    BtreeKind::Refc => self.refcounts.len() as u64,
                };
                let g = BtreeGeometry::compute(kind, self.geo, count.max(1));
                let lg = compute_geometry(
                    LevelLimits { maxrecs: g.leaf_maxrecs, minrecs: g.leaf_minrecs },
                    LevelLimits { maxrecs: g.node_maxrecs, minrecs: g.node_minrecs },
                    SLACK_DEFAULT,
                    SLACK_DEFAULT,
                    low_space,
                    count,
                    None,
                );
                tree_blocks += lg.nr_blocks;
                geoms.push((kind, lg));
            }

            let after_trees = reserved.len() as u64;
            agfl_take = after_trees
                .saturating_sub(tree_blocks)
                .min(agfl_cap as u64) as usize;
            lost = after_trees.saturating_sub(tree_blocks + agfl_take as u64) as usize;

            // New-tree and freelist blocks are owned by the AG; lost
            // blocks are not, they go back to free space later.
            let owned_end = (tree_blocks as usize + agfl_take).min(reserved.len());
            let mut own_ag = ExtentBitmap::new();
            for &b in &reserved[..owned_end] {
                own_ag.set_range(b as u64, 1);
            }
            let mut next_rmaps = self.base_rmaps.clone();
            for (s, l) in own_ag.extents() {
                let mut s = s;
                let mut l = l;
                while l > 0 {
                    let chunk = l.min(MAX_EXTENT_LEN);
                    next_rmaps.push(RmapRecord::metadata(
                        s as XfsAgblock,
                        chunk as u32,
                        RmapOwner::AgMeta,
                    ));
                    s += chunk;
                    l -= chunk;
                }
            }
            next_rmaps.sort();

            iters += 1;
            if next_rmaps.len() == rmap_records.len() || iters >= MAX_PLAN_ITERS {
                rmap_records = next_rmaps;
                break;
            }
            rmap_records = next_rmaps;
        }

        let owned_end = (tree_blocks as usize + agfl_take).min(reserved.len());
        let agfl_blocks = reserved[tree_blocks.min(owned_end as u64) as usize..owned_end].to_vec();
        let lost_blocks = reserved[owned_end..].to_vec();
        debug_assert_eq!(lost_blocks.len(), lost);

        Ok(RebuildPlan {
            demand: tree_blocks + self.agfl_min(),
            geoms,
            tree_blocks,
            agfl_blocks,
            lost_blocks,
            rmap_records,
            free_extents: self.free_extents(),
        })
    }

    /// Take blocks from free space, smallest extents first, recording a
    /// reservation per run.
    fn reserve(&mut self, mut need: u64) -> Result<(), FxfsrError> {
        while need > 0 {
            let Some((start, len)) = self
                .free
                .extents()
                .min_by_key(|&(s, l)| (l, s))
            else {
                return Err(FxfsrError::AgFull(self.agno));
            };
            let take = need.min(len);
            self.free.clear_range(start, take);
            self.reservations.push(BulkReservation {
                start: start as XfsAgblock,
                len: take as u32,
                consumed: 0,
            });
            self.reserved_total += take;
            need -= take;
        }
        Ok(())
    }

    /// Run the convergence loop and rebuild every tree and header of
    /// this group.
    pub fn run(mut self, cache: &mut BufCache<BlockDev>) -> Result<AgRebuildSummary, FxfsrError> {
        if self.geo.ag_size(self.agno) == 0 {
            // Pure-realtime configuration: nothing to rebuild here.
            return Ok(AgRebuildSummary {
                agno: self.agno,
                trees: Vec::new(),
                freeblks: 0,
                longest: 0,
                flcount: 0,
                icount: 0,
                ifree: 0,
                lost_blocks: Vec::new(),
                rmap_records: Vec::new(),
            });
        }

        // Converge on a stable block demand: reserving blocks shrinks
        // free space, which changes the free-space tree inputs.
        let mut plan = self.plan()?;
        let mut prev_demand = u64::MAX;
        let mut iters = 0;
        while plan.demand != prev_demand || self.reserved_total < plan.demand {
            if self.reserved_total < plan.demand {
                self.reserve(plan.demand - self.reserved_total)?;
            }
            prev_demand = plan.demand;
            plan = self.plan()?;
            iters += 1;
            if iters >= MAX_PLAN_ITERS {
                return Err(FxfsrError::NoSpace(
                    "block demand failed to converge for group rebuild",
                ));
            }
        }

        if self.no_modify {
            log::info!(
                "would rebuild AG {} btrees ({} blocks over {} trees)",
                self.agno,
                plan.tree_blocks,
                plan.geoms.len()
            );
        }

        // Bulk-load every tree, claiming reservation blocks in order.
        let reserved = self.reserved_blocks();
        let mut claim_idx = 0usize;
        let mut trees = Vec::new();
        let mut icount = 0u64;
        let mut ifree = 0u64;
        for c in &self.chunks {
            icount += c.ir_count as u64;
            ifree += c.ir_freecount as u64;
        }

        for (kind, lg) in &plan.geoms {
            let summary = self.build_tree(cache, *kind, lg, &plan, &reserved, &mut claim_idx)?;
            trees.push(summary);
        }

        let freeblks = self.free.weight();
        let longest = plan.free_extents.iter().map(|&(_, l)| l).max().unwrap_or(0);

        if !self.no_modify {
            self.write_headers(cache, &trees, &plan, freeblks, longest, icount, ifree)?;
        }

        Ok(AgRebuildSummary {
            agno: self.agno,
            trees,
            freeblks,
            longest,
            flcount: plan.agfl_blocks.len() as u32,
            icount,
            ifree,
            lost_blocks: plan.lost_blocks.clone(),
            rmap_records: plan.rmap_records.clone(),
        })
    }

    fn build_tree(
        &self,
        cache: &mut BufCache<BlockDev>,
        kind: BtreeKind,
        lg: &LoadGeometry,
        plan: &RebuildPlan,
        reserved: &[XfsAgblock],
        claim_idx: &mut usize,
    ) -> Result<TreeSummary, FxfsrError> {
        let g = BtreeGeometry::compute(kind, self.geo, 1);
        let mut sink = AgBtreeSink {
            geo: self.geo,
            uuid: &self.uuid,
            agno: self.agno,
            kind,
            node_maxrecs: g.node_maxrecs,
            cache,
            reserved,
            claim_idx,
            no_modify: self.no_modify,
        };

        let result = match kind {
            BtreeKind::Bno => {
                let mut src = AllocRecSource::new(&plan.free_extents);
                load(lg, &mut src, &mut sink)?
            }
            BtreeKind::Cnt => {
                let mut by_len = plan.free_extents.clone();
                by_len.sort_by_key(|&(s, l)| (l, s));
                let mut src = AllocRecSource::new(&by_len);
                load(lg, &mut src, &mut sink)?
            }
            BtreeKind::Ino => {
                let mut src = InobtSource { chunks: &self.chunks, idx: 0, free_only: false };
                load(lg, &mut src, &mut sink)?
            }
            BtreeKind::Fino => {
                let mut src = InobtSource { chunks: &self.chunks, idx: 0, free_only: true };
                load(lg, &mut src, &mut sink)?
            }
            BtreeKind::Rmap => {
                let mut src = RmapSource { recs: &plan.rmap_records, idx: 0 };
                load(lg, &mut src, &mut sink)?
            }
            BtreeKind::Refc => {
                let mut src = RefcSource { recs: &self.refcounts, idx: 0 };
                load(lg, &mut src, &mut sink)?
            }
        };

        Ok(TreeSummary {
            kind,
            root: result.root_block.expect("per-AG trees root on disk"),
            levels: result.height as u32,
            blocks: result.blocks_written,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn write_headers(
        &self,
        cache: &mut BufCache<BlockDev>,
        trees: &[TreeSummary],
        plan: &RebuildPlan,
        freeblks: u64,
        longest: u32,
        icount: u64,
        ifree: u64,
    ) -> Result<(), FxfsrError> {
        let find = |kind: BtreeKind| trees.iter().find(|t| t.kind == kind).copied();
        let bno = find(BtreeKind::Bno).expect("bno tree always rebuilt");
        let cnt = find(BtreeKind::Cnt).expect("cnt tree always rebuilt");
        let ino = find(BtreeKind::Ino).expect("inobt always rebuilt");
        let fino = find(BtreeKind::Fino);
        let rmap = find(BtreeKind::Rmap);
        let refc = find(BtreeKind::Refc);
        let v5 = self.geo.is_v5();
        let version = 1u32;

        let btreeblks = bno.blocks + cnt.blocks + rmap.map_or(0, |t| t.blocks)
            - (2 + rmap.map_or(0, |_| 1));

        let agf = XfsAgf {
            agf_magicnum: crate::xfs::agheaders::XFS_AGF_MAGIC.into(),
            agf_versionnum: version.into(),
            agf_seqno: self.agno.into(),
            agf_length: self.geo.ag_size(self.agno).into(),
            agf_bno_root: bno.root.into(),
            agf_cnt_root: cnt.root.into(),
            agf_rmap_root: rmap.map_or(0, |t| t.root).into(),
            agf_bno_level: bno.levels.into(),
            agf_cnt_level: cnt.levels.into(),
            agf_rmap_level: rmap.map_or(0, |t| t.levels).into(),
            agf_flfirst: 0.into(),
            agf_fllast: (plan.agfl_blocks.len().saturating_sub(1) as u32).into(),
            agf_flcount: (plan.agfl_blocks.len() as u32).into(),
            agf_freeblks: (freeblks as u32).into(),
            agf_longest: longest.into(),
            agf_btreeblks: (btreeblks as u32).into(),
            agf_uuid: self.uuid,
            agf_rmap_blocks: (rmap.map_or(0, |t| t.blocks) as u32).into(),
            agf_refcount_blocks: (refc.map_or(0, |t| t.blocks) as u32).into(),
            agf_refcount_root: refc.map_or(0, |t| t.root).into(),
            agf_refcount_level: refc.map_or(0, |t| t.levels).into(),
            agf_spare64: [0.into(); 14],
            agf_lsn: 0.into(),
            agf_crc: 0.into(),
            agf_spare2: 0.into(),
        };
        self.write_sector(cache, self.geo.agf_byte_offset(self.agno), |buf| {
            agf.write_to(buf, v5)
        })?;

        let newino = self.chunks.first().map_or(NULLAGINO, |c| c.start_ino());
        let agi = XfsAgi {
            agi_magicnum: crate::xfs::agheaders::XFS_AGI_MAGIC.into(),
            agi_versionnum: version.into(),
            agi_seqno: self.agno.into(),
            agi_length: self.geo.ag_size(self.agno).into(),
            agi_count: (icount as u32).into(),
            agi_root: ino.root.into(),
            agi_level: ino.levels.into(),
            agi_freecount: (ifree as u32).into(),
            agi_newino: newino.into(),
            agi_dirino: NULLAGINO.into(),
            agi_unlinked: [NULLAGINO.into(); 64],
            agi_uuid: self.uuid,
            agi_crc: 0.into(),
            agi_pad32: 0.into(),
            agi_lsn: 0.into(),
            agi_free_root: fino.map_or(0, |t| t.root).into(),
            agi_free_level: fino.map_or(0, |t| t.levels).into(),
            agi_iblocks: (ino.blocks as u32).into(),
            agi_fblocks: (fino.map_or(0, |t| t.blocks) as u32).into(),
        };
        self.write_sector(cache, self.geo.agi_byte_offset(self.agno), |buf| {
            agi.write_to(buf, v5)
        })?;

        self.write_sector(cache, self.geo.agfl_byte_offset(self.agno), |buf| {
            agfl_write_slots(buf, self.geo, self.agno, &self.uuid, &plan.agfl_blocks)
        })?;

        cache.flush()
    }

    fn write_sector(
        &self,
        cache: &mut BufCache<BlockDev>,
        byte_off: u64,
        fill: impl FnOnce(&mut [u8]) -> Result<(), FxfsrError>,
    ) -> Result<(), FxfsrError> {
        let daddr = byte_off / SECTOR_SIZE;
        let buf = cache.get_buf(daddr, self.geo.sect_size as usize)?;
        fill(buf.data_mut())?;
        cache.mark_dirty(daddr);
        cache.relse(daddr);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Record sources
// ---------------------------------------------------------------------------

/// Free extents as alloc records, in whatever order the caller sorted.
struct AllocRecSource<'a> {
    extents: &'a [(XfsAgblock, u32)],
    idx: usize,
}

impl<'a> AllocRecSource<'a> {
    fn new(extents: &'a [(XfsAgblock, u32)]) -> Self {
        AllocRecSource { extents, idx: 0 }
    }
}

impl BulkSource for AllocRecSource<'_> {
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
        let &(start, len) = self
            .extents
            .get(self.idx)
            .ok_or(FxfsrError::Parse("alloc record source exhausted"))?;
        self.idx += 1;
        let r = XfsAllocRec { ar_startblock: start.into(), ar_blockcount: len.into() };
        rec.copy_from_slice(r.as_bytes());
        key.copy_from_slice(r.as_bytes());
        Ok(())
    }
}

/// Inode chunks; `free_only` selects the finobt subset.
struct InobtSource<'a> {
    chunks: &'a [XfsInobtRec],
    idx: usize,
    free_only: bool,
}

impl BulkSource for InobtSource<'_> {
    fn rec_size(&self) -> usize {
        16
    }

    fn key_size(&self) -> usize {
        4
    }

    fn high_key_off(&self) -> Option<usize> {
        None
    }

    fn next_record(&mut self, rec: &mut [u8], key: &mut [u8]) -> Result<(), FxfsrError> {
        while let Some(c) = self.chunks.get(self.idx) {
            self.idx += 1;
            if self.free_only && c.ir_freecount == 0 {
                continue;
            }
            rec.copy_from_slice(c.as_bytes());
            key.copy_from_slice(&c.ir_startino.get().to_be_bytes());
            return Ok(());
        }
        Err(FxfsrError::Parse("inode record source exhausted"))
    }
}

/// Incore rmap records in key order, with low and high node keys.
struct RmapSource<'a> {
    recs: &'a [RmapRecord],
    idx: usize,
}

impl BulkSource for RmapSource<'_> {
    fn rec_size(&self) -> usize {
        24
    }

    fn key_size(&self) -> usize {
        40
    }

    fn high_key_off(&self) -> Option<usize> {
        Some(20)
    }

    fn next_record(&mut self, rec: &mut [u8], key: &mut [u8]) -> Result<(), FxfsrError> {
        let r = self
            .recs
            .get(self.idx)
            .ok_or(FxfsrError::Parse("rmap record source exhausted"))?;
        self.idx += 1;
        let disk = r.to_disk();
        rec.copy_from_slice(disk.as_bytes());

        // Low key: the record's own coordinates. High key: its last
        // mapped block, used by overlapped-interval lookups.
        let low = XfsRmapKey {
            rm_startblock: disk.rm_startblock,
            rm_owner: disk.rm_owner,
            rm_offset: disk.rm_offset,
        };
        let high_off = if r.owner.is_inode() && !r.bmbt_block {
            disk.rm_offset.get() + (r.block_count - 1) as u64
        } else {
            disk.rm_offset.get()
        };
        let high = XfsRmapKey {
            rm_startblock: (r.start_block + r.block_count - 1).into(),
            rm_owner: disk.rm_owner,
            rm_offset: high_off.into(),
        };
        key[0..20].copy_from_slice(low.as_bytes());
        key[20..40].copy_from_slice(high.as_bytes());
        Ok(())
    }
}

/// Derived refcount records (SHARED domain only).
struct RefcSource<'a> {
    recs: &'a [XfsRefcountRec],
    idx: usize,
}

impl BulkSource for RefcSource<'_> {
    fn rec_size(&self) -> usize {
        12
    }

    fn key_size(&self) -> usize {
        4
    }

    fn high_key_off(&self) -> Option<usize> {
        None
    }

    fn next_record(&mut self, rec: &mut [u8], key: &mut [u8]) -> Result<(), FxfsrError> {
        let r = self
            .recs
            .get(self.idx)
            .ok_or(FxfsrError::Parse("refcount record source exhausted"))?;
        self.idx += 1;
        rec.copy_from_slice(r.as_bytes());
        key.copy_from_slice(&r.rc_startblock.get().to_be_bytes());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Block sink
// ---------------------------------------------------------------------------

/// Writes finished btree blocks into the device through the buffer
/// cache, claiming blocks from the group's reservation list.
struct AgBtreeSink<'a> {
    geo: &'a FsGeometry,
    uuid: &'a [u8; 16],
    agno: XfsAgnumber,
    kind: BtreeKind,
    node_maxrecs: usize,
    cache: &'a mut BufCache<BlockDev>,
    reserved: &'a [XfsAgblock],
    claim_idx: &'a mut usize,
    no_modify: bool,
}

impl AgBtreeSink<'_> {
    fn emit(
        &mut self,
        blkno: XfsAgblock,
        level: u16,
        leftsib: Option<XfsAgblock>,
        rightsib: Option<XfsAgblock>,
        fill: impl FnOnce(&FsGeometry, usize, &mut [u8]),
        nrecs: usize,
    ) -> Result<(), FxfsrError> {
        if self.no_modify {
            return Ok(());
        }
        let byte_off = self.geo.ag_block_to_byte(self.agno, blkno);
        let daddr = byte_off / SECTOR_SIZE;
        let block_size = self.geo.block_size as usize;
        let hdr = crate::xfs::format::short_hdr_size(self.geo.is_v5());

        let buf = self.cache.get_buf(daddr, block_size)?;
        let data = buf.data_mut();
        init_short_block(
            data,
            self.geo,
            self.uuid,
            self.kind,
            self.agno,
            daddr,
            level,
            leftsib.unwrap_or(NULLAGBLOCK),
            rightsib.unwrap_or(NULLAGBLOCK),
        )?;
        fill(self.geo, hdr, data);
        set_numrecs(data, nrecs as u16);
        if self.geo.is_v5() {
            stamp_block_crc(data);
        }
        self.cache.mark_dirty(daddr);
        self.cache.relse(daddr);
        Ok(())
    }
}

impl BulkSink for AgBtreeSink<'_> {
    fn claim_block(&mut self) -> Result<XfsAgblock, FxfsrError> {
        let blkno = self
            .reserved
            .get(*self.claim_idx)
            .copied()
            .ok_or(FxfsrError::NoSpace("bulk-load reservation exhausted"))?;
        *self.claim_idx += 1;
        Ok(blkno)
    }

    fn write_leaf(
        &mut self,
        blkno: XfsAgblock,
        leftsib: Option<XfsAgblock>,
        rightsib: Option<XfsAgblock>,
        recs: &[u8],
        nrecs: usize,
    ) -> Result<(), FxfsrError> {
        self.emit(
            blkno,
            0,
            leftsib,
            rightsib,
            |_geo, hdr, data| {
                data[hdr..hdr + recs.len()].copy_from_slice(recs);
            },
            nrecs,
        )
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
        let node_maxrecs = self.node_maxrecs;
        let key_size = if nrecs > 0 { keys.len() / nrecs } else { 0 };
        self.emit(
            blkno,
            level,
            leftsib,
            rightsib,
            |_geo, hdr, data| {
                data[hdr..hdr + keys.len()].copy_from_slice(keys);
                let ptr_base = hdr + node_maxrecs * key_size;
                for (i, p) in ptrs.iter().enumerate() {
                    let off = ptr_base + i * 4;
                    data[off..off + 4].copy_from_slice(&p.to_be_bytes());
                }
            },
            nrecs,
        )
    }
}

// ---------------------------------------------------------------------------
// Post-rebuild fixups
// ---------------------------------------------------------------------------

/// Read back the just-written AGFL, diff it against the blocks the
/// loader already recorded as AG-owned, and report any freelist block
/// the new rmap btree does not describe. The loader places every AGFL
/// block from its own reservations, so a nonempty diff means the
/// written image and the incore state disagree.
pub fn rmap_commit_agbtree_mappings(
    cache: &mut BufCache<BlockDev>,
    geo: &FsGeometry,
    agno: XfsAgnumber,
    summary: &AgRebuildSummary,
    rmap_records: &[RmapRecord],
) -> Result<(), FxfsrError> {
    if summary.flcount == 0 {
        return Ok(());
    }
    let daddr = geo.agfl_byte_offset(agno) / SECTOR_SIZE;
    let buf = cache.read_buf(daddr, geo.sect_size as usize, None)?;
    let slots = agfl_read_slots(buf.data(), geo, agno)?;
    cache.relse(daddr);

    let mut own_ag = ExtentBitmap::new();
    for rec in rmap_records {
        if rec.owner == RmapOwner::AgMeta {
            own_ag.set_range(rec.start_block as u64, rec.block_count as u64);
        }
    }

    for &slot in slots.iter().take(summary.flcount as usize) {
        if slot == NULLAGBLOCK {
            continue;
        }
        if !own_ag.contains(slot as u64) {
            log::warn!(
                "AG {agno}: freelist block {slot} missing from the new rmap btree"
            );
            return Err(FxfsrError::Corrupt {
                what: "freelist block not described by rebuilt rmap",
                agno,
                bno: slot as u64,
            });
        }
    }
    Ok(())
}

