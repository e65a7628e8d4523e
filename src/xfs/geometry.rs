//! Filesystem geometry extracted from the superblock, plus the btree
//! geometry calculator (records per block, maximum tree heights).

use crate::error::FxfsrError;
use crate::xfs::sb::{FormatVersion, XfsDsb};
use crate::xfs::types::{
    GroupNo, XfsAgblock, XfsAgino, XfsAgnumber, XfsFsblock, XfsIno, XfsRgblock,
    XfsRgnumber, XfsRtblock, XfsRtxnum,
};

/// Geometry and feature context extracted from the superblock.
///
/// Threaded explicitly through every subsystem; there is no global
/// filesystem state.
#[derive(Debug, Clone)]
pub struct FsGeometry {
    pub version: FormatVersion,
    pub block_size: u32,
    pub block_log: u8,
    pub sect_size: u16,
    pub sect_log: u8,
    pub ag_count: u32,
    pub ag_blocks: u32,
    pub ag_blk_log: u8,
    pub dblocks: u64,
    pub inode_size: u16,
    pub inode_log: u8,
    pub inodes_per_block: u16,
    pub inop_blog: u8,
    pub root_ino: u64,
    pub log_start: u64,
    pub log_blocks: u32,
    pub imax_pct: u8,
    // Realtime device.
    pub rblocks: u64,
    pub rextents: u64,
    pub rext_size: u32,
    pub rext_log: u8,
    pub rbm_blocks: u32,
    pub rg_count: u32,
    pub rg_extents: u32,
    pub rg_blk_log: u8,
    // Features.
    pub has_ftype: bool,
    pub has_finobt: bool,
    pub has_rmapbt: bool,
    pub has_reflink: bool,
    pub has_nrext64: bool,
    pub has_parent: bool,
    pub has_metadir: bool,
}

impl FsGeometry {
    pub fn from_sb(sb: &XfsDsb) -> Result<Self, FxfsrError> {
        let geo = FsGeometry {
            version: sb.version(),
            block_size: sb.sb_blocksize.get(),
            block_log: sb.sb_blocklog,
            sect_size: sb.sb_sectsize.get(),
            sect_log: sb.sb_sectlog,
            ag_count: sb.sb_agcount.get(),
            ag_blocks: sb.sb_agblocks.get(),
            ag_blk_log: sb.sb_agblklog,
            dblocks: sb.sb_dblocks.get(),
            inode_size: sb.sb_inodesize.get(),
            inode_log: sb.sb_inodelog,
            inodes_per_block: sb.sb_inopblock.get(),
            inop_blog: sb.sb_inopblog,
            root_ino: sb.sb_rootino.get(),
            log_start: sb.sb_logstart.get(),
            log_blocks: sb.sb_logblocks.get(),
            imax_pct: sb.sb_imax_pct,
            rblocks: sb.sb_rblocks.get(),
            rextents: sb.sb_rextents.get(),
            rext_size: sb.sb_rextsize.get(),
            rext_log: sb.sb_rextslog,
            rbm_blocks: sb.sb_rbmblocks.get(),
            rg_count: sb.sb_rgcount.get(),
            rg_extents: sb.sb_rgextents.get(),
            rg_blk_log: sb.sb_rgblklog,
            has_ftype: sb.has_ftype(),
            has_finobt: sb.has_finobt(),
            has_rmapbt: sb.has_rmapbt(),
            has_reflink: sb.has_reflink(),
            has_nrext64: sb.has_nrext64(),
            has_parent: sb.has_parent(),
            has_metadir: sb.has_metadir(),
        };
        if geo.block_size == 0 || !geo.block_size.is_power_of_two() {
            return Err(FxfsrError::Parse("superblock block size is not a power of two"));
        }
        if geo.ag_blocks == 0 && geo.ag_count != 0 {
            return Err(FxfsrError::Parse("superblock AG size is zero"));
        }
        Ok(geo)
    }

    pub fn is_v5(&self) -> bool {
        self.version == FormatVersion::V5
    }

    /// Blocks in a specific AG. The last AG may be short.
    pub fn ag_size(&self, agno: XfsAgnumber) -> XfsAgblock {
        if agno + 1 == self.ag_count {
            (self.dblocks - (agno as u64) * (self.ag_blocks as u64)) as XfsAgblock
        } else {
            self.ag_blocks
        }
    }

    /// Blocks in a specific realtime group.
    pub fn rg_size(&self, rgno: XfsRgnumber) -> XfsRgblock {
        let rg_blocks = self.rg_extents as u64 * self.rext_size as u64;
        if rgno as u64 + 1 == self.rg_count as u64 {
            (self.rblocks - (rgno as u64) * rg_blocks) as XfsRgblock
        } else {
            rg_blocks as XfsRgblock
        }
    }

    pub fn group_size(&self, group: GroupNo) -> u32 {
        match group {
            GroupNo::Ag(agno) => self.ag_size(agno),
            GroupNo::Rtg(rgno) => self.rg_size(rgno),
        }
    }

    /// Convert an absolute inode number to its AG number.
    pub fn ino_to_agno(&self, ino: XfsIno) -> XfsAgnumber {
        (ino >> (self.inop_blog as u64 + self.ag_blk_log as u64)) as XfsAgnumber
    }

    /// Convert an absolute inode number to its AG-relative part.
    pub fn ino_to_agino(&self, ino: XfsIno) -> XfsAgino {
        let mask = (1u64 << (self.inop_blog as u64 + self.ag_blk_log as u64)) - 1;
        (ino & mask) as XfsAgino
    }

    /// Convert AG-relative inode to absolute inode number.
    pub fn agino_to_ino(&self, agno: XfsAgnumber, agino: XfsAgino) -> XfsIno {
        ((agno as u64) << (self.inop_blog as u64 + self.ag_blk_log as u64)) | (agino as u64)
    }

    /// AG block holding an AG-relative inode.
    pub fn agino_to_agblock(&self, agino: XfsAgino) -> XfsAgblock {
        agino >> self.inop_blog
    }

    /// Pack (agno, agblock) into an absolute filesystem block number.
    pub fn agblock_to_fsb(&self, agno: XfsAgnumber, agblock: XfsAgblock) -> XfsFsblock {
        ((agno as u64) << self.ag_blk_log as u64) | agblock as u64
    }

    /// Unpack an absolute filesystem block number into (agno, agblock).
    pub fn fsb_to_agblock(&self, fsblock: XfsFsblock) -> (XfsAgnumber, XfsAgblock) {
        let agno = (fsblock >> self.ag_blk_log as u64) as XfsAgnumber;
        let agblock = (fsblock & ((1u64 << self.ag_blk_log as u64) - 1)) as XfsAgblock;
        (agno, agblock)
    }

    /// Byte offset of an AG-relative block within the data device.
    pub fn ag_block_to_byte(&self, agno: XfsAgnumber, agblock: XfsAgblock) -> u64 {
        let abs_block = (agno as u64) * (self.ag_blocks as u64) + (agblock as u64);
        abs_block << self.block_log as u64
    }

    /// Byte offset of the start of an AG.
    pub fn ag_start_byte(&self, agno: XfsAgnumber) -> u64 {
        (agno as u64) * (self.ag_blocks as u64) * (self.block_size as u64)
    }

    /// Sector offset of the AGF header within its AG (sector 1).
    pub fn agf_byte_offset(&self, agno: XfsAgnumber) -> u64 {
        self.ag_start_byte(agno) + self.sect_size as u64
    }

    /// Sector offset of the AGI header within its AG (sector 2).
    pub fn agi_byte_offset(&self, agno: XfsAgnumber) -> u64 {
        self.ag_start_byte(agno) + 2 * self.sect_size as u64
    }

    /// Sector offset of the AGFL within its AG (sector 3).
    pub fn agfl_byte_offset(&self, agno: XfsAgnumber) -> u64 {
        self.ag_start_byte(agno) + 3 * self.sect_size as u64
    }

    /// Split a realtime device block into (rtgroup, group-relative block).
    pub fn rtb_to_rgblock(&self, rtb: XfsRtblock) -> (XfsRgnumber, XfsRgblock) {
        let rg_blocks = (self.rg_extents as u64 * self.rext_size as u64).max(1);
        ((rtb / rg_blocks) as XfsRgnumber, (rtb % rg_blocks) as XfsRgblock)
    }

    /// Realtime extent containing a realtime device block.
    pub fn rtb_to_rtx(&self, rtb: XfsRtblock) -> XfsRtxnum {
        rtb / self.rext_size.max(1) as u64
    }

    /// First realtime device block of a realtime extent.
    pub fn rtx_to_rtb(&self, rtx: XfsRtxnum) -> XfsRtblock {
        rtx * self.rext_size as u64
    }

    /// Number of allocation-unit blocks for a file: the realtime extent
    /// size for realtime files, otherwise a single block.
    pub fn alloc_unit(&self, is_realtime: bool) -> u64 {
        if is_realtime { self.rext_size as u64 } else { 1 }
    }
}

/// Per-AG btree kinds whose geometry the repair engine computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtreeKind {
    /// Free space by block number.
    Bno,
    /// Free space by extent length.
    Cnt,
    /// Allocated inodes.
    Ino,
    /// Inode chunks with free slots.
    Fino,
    /// Reverse mappings.
    Rmap,
    /// Reference counts.
    Refc,
}

/// Static per-level record capacities for one btree kind.
#[derive(Debug, Clone, Copy)]
pub struct BtreeGeometry {
    pub kind: BtreeKind,
    pub leaf_maxrecs: usize,
    pub leaf_minrecs: usize,
    pub node_maxrecs: usize,
    pub node_minrecs: usize,
    pub maxlevels: usize,
}

/// Short btree block header sizes (V4 / V5).
pub const BTREE_SBLOCK_LEN: usize = 16;
pub const BTREE_SBLOCK_CRC_LEN: usize = 56;

/// On-disk record, key, and pointer sizes per btree kind. Overlapping
/// interval trees (rmap) store a low and a high key per node entry, which
/// is folded into the key size here.
fn rec_key_ptr_sizes(kind: BtreeKind) -> (usize, usize, usize) {
    match kind {
        BtreeKind::Bno | BtreeKind::Cnt => (8, 8, 4),
        BtreeKind::Ino | BtreeKind::Fino => (16, 4, 4),
        BtreeKind::Rmap => (24, 2 * 20, 4),
        BtreeKind::Refc => (12, 4, 4),
    }
}

impl BtreeGeometry {
    /// Compute capacities for `kind` given the filesystem block size.
    /// `max_records` bounds the number of records the tree may ever hold
    /// (e.g. blocks or inodes per AG) and determines `maxlevels`.
    pub fn compute(kind: BtreeKind, geo: &FsGeometry, max_records: u64) -> Self {
        let hdr = if geo.is_v5() { BTREE_SBLOCK_CRC_LEN } else { BTREE_SBLOCK_LEN };
        let blocklen = geo.block_size as usize - hdr;
        let (rec, key, ptr) = rec_key_ptr_sizes(kind);

        let leaf_maxrecs = blocklen / rec;
        let node_maxrecs = blocklen / (key + ptr);
        let geometry = BtreeGeometry {
            kind,
            leaf_maxrecs,
            leaf_minrecs: leaf_maxrecs / 2,
            node_maxrecs,
            node_minrecs: node_maxrecs / 2,
            maxlevels: 0,
        };
        BtreeGeometry {
            maxlevels: geometry.compute_maxlevels(max_records),
            ..geometry
        }
    }

    /// Worst-case height for a tree holding `len` records: every block is
    /// filled to its minimum.
    pub fn compute_maxlevels(&self, len: u64) -> usize {
        if len == 0 {
            return 1;
        }
        let minleaf = self.leaf_minrecs.max(1) as u64;
        let minnode = self.node_minrecs.max(1) as u64;
        let mut level = 1usize;
        let mut maxblocks = len.div_ceil(minleaf);
        while maxblocks > 1 {
            maxblocks = maxblocks.div_ceil(minnode);
            level += 1;
        }
        level
    }

    /// Space one full level-`level` block covers, in records.
    pub fn records_per_block(&self, level: usize) -> usize {
        if level == 0 { self.leaf_maxrecs } else { self.node_maxrecs }
    }
}
