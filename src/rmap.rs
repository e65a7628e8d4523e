//! Incore reverse-mapping records: ownership, flags, merge rules, and
//! the packed on-disk conversion.

use crate::error::FxfsrError;
use crate::xfs::format::{
    XFS_RMAP_OFF_ATTR_FORK, XFS_RMAP_OFF_BMBT_BLOCK, XFS_RMAP_OFF_MASK, XFS_RMAP_OFF_UNWRITTEN,
    XFS_RMAP_OWN_AG, XFS_RMAP_OWN_COW, XFS_RMAP_OWN_FS, XFS_RMAP_OWN_INODES, XFS_RMAP_OWN_LOG,
    XFS_RMAP_OWN_REFC, XFS_RMAP_OWN_UNKNOWN, XfsRmapRec,
};
use crate::xfs::types::{MAX_EXTENT_LEN, XfsAgblock, XfsExtlen, XfsFileoff, XfsIno};

/// Owner of a reverse-mapped extent: an inode, or one of the synthetic
/// metadata owners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RmapOwner {
    Inode(XfsIno),
    /// Fixed filesystem headers (superblock, AGF, AGI, AGFL sectors).
    FsHeaders,
    /// The internal log.
    Log,
    /// Inode chunk blocks.
    Inodes,
    /// Per-AG btree blocks and the AGFL.
    AgMeta,
    /// Refcount btree blocks.
    Refc,
    /// CoW staging extents.
    Cow,
    /// Owner not yet known.
    Unknown,
}

impl RmapOwner {
    pub fn is_inode(&self) -> bool {
        matches!(self, Self::Inode(_))
    }

    /// Owners describing filesystem-internal metadata.
    pub fn is_metadata(&self) -> bool {
        !self.is_inode()
    }

    pub fn to_disk(self) -> u64 {
        match self {
            Self::Inode(ino) => ino,
            Self::FsHeaders => XFS_RMAP_OWN_FS,
            Self::Log => XFS_RMAP_OWN_LOG,
            Self::Inodes => XFS_RMAP_OWN_INODES,
            Self::AgMeta => XFS_RMAP_OWN_AG,
            Self::Refc => XFS_RMAP_OWN_REFC,
            Self::Cow => XFS_RMAP_OWN_COW,
            Self::Unknown => XFS_RMAP_OWN_UNKNOWN,
        }
    }

    pub fn from_disk(owner: u64) -> Self {
        match owner {
            XFS_RMAP_OWN_FS => Self::FsHeaders,
            XFS_RMAP_OWN_LOG => Self::Log,
            XFS_RMAP_OWN_INODES => Self::Inodes,
            XFS_RMAP_OWN_AG => Self::AgMeta,
            XFS_RMAP_OWN_REFC => Self::Refc,
            XFS_RMAP_OWN_COW => Self::Cow,
            XFS_RMAP_OWN_UNKNOWN => Self::Unknown,
            ino => Self::Inode(ino),
        }
    }
}

/// One reverse mapping: physical extent -> (owner, logical offset, state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmapRecord {
    pub start_block: XfsAgblock,
    pub block_count: XfsExtlen,
    pub owner: RmapOwner,
    pub offset: XfsFileoff,
    pub attr_fork: bool,
    pub bmbt_block: bool,
    pub unwritten: bool,
}

impl RmapRecord {
    /// Mapping for a metadata owner: no logical offset, no fork flags.
    pub fn metadata(start_block: XfsAgblock, block_count: XfsExtlen, owner: RmapOwner) -> Self {
        RmapRecord {
            start_block,
            block_count,
            owner,
            offset: 0,
            attr_fork: false,
            bmbt_block: false,
            unwritten: false,
        }
    }

    /// First block past the mapped extent.
    pub fn end(&self) -> u64 {
        self.start_block as u64 + self.block_count as u64
    }

    /// Structural invariants from the data model.
    pub fn validate(&self) -> Result<(), FxfsrError> {
        if self.block_count == 0 {
            return Err(FxfsrError::Parse("rmap record with zero length"));
        }
        if self.block_count as u64 > MAX_EXTENT_LEN {
            return Err(FxfsrError::Parse("rmap record longer than MAX_EXTENT_LEN"));
        }
        if self.owner.is_metadata() && (self.offset != 0 || self.attr_fork) {
            return Err(FxfsrError::Parse("metadata rmap carries fork state"));
        }
        Ok(())
    }

    /// Two rmaps merge iff same owner, physically contiguous, identical
    /// flags, logically contiguous (for non-bmbt inode owners), and the
    /// combined length stays within a single record.
    pub fn is_mergeable(&self, next: &RmapRecord) -> bool {
        if self.owner != next.owner {
            return false;
        }
        if self.end() != next.start_block as u64 {
            return false;
        }
        if self.attr_fork != next.attr_fork
            || self.bmbt_block != next.bmbt_block
            || self.unwritten != next.unwritten
        {
            return false;
        }
        if self.owner.is_inode()
            && !self.bmbt_block
            && self.offset + self.block_count as u64 != next.offset
        {
            return false;
        }
        self.block_count as u64 + next.block_count as u64 <= MAX_EXTENT_LEN
    }

    /// Eligible to contribute to a shared refcount: an inode-owned data
    /// fork mapping with real written blocks.
    pub fn is_shareable(&self) -> bool {
        self.owner.is_inode() && !self.attr_fork && !self.bmbt_block && !self.unwritten
    }

    /// Pack into the on-disk record form (flags into the offset word).
    pub fn to_disk(&self) -> XfsRmapRec {
        let mut off = self.offset & XFS_RMAP_OFF_MASK;
        if self.attr_fork {
            off |= XFS_RMAP_OFF_ATTR_FORK;
        }
        if self.bmbt_block {
            off |= XFS_RMAP_OFF_BMBT_BLOCK;
        }
        if self.unwritten {
            off |= XFS_RMAP_OFF_UNWRITTEN;
        }
        XfsRmapRec {
            rm_startblock: self.start_block.into(),
            rm_blockcount: self.block_count.into(),
            rm_owner: self.owner.to_disk().into(),
            rm_offset: off.into(),
        }
    }

    pub fn from_disk(rec: &XfsRmapRec) -> Self {
        let raw_off = rec.rm_offset.get();
        RmapRecord {
            start_block: rec.rm_startblock.get(),
            block_count: rec.rm_blockcount.get(),
            owner: RmapOwner::from_disk(rec.rm_owner.get()),
            offset: raw_off & XFS_RMAP_OFF_MASK,
            attr_fork: raw_off & XFS_RMAP_OFF_ATTR_FORK != 0,
            bmbt_block: raw_off & XFS_RMAP_OFF_BMBT_BLOCK != 0,
            unwritten: raw_off & XFS_RMAP_OFF_UNWRITTEN != 0,
        }
    }

    /// Sort key matching the on-disk rmap btree order.
    pub fn key(&self) -> (XfsAgblock, u64, u64) {
        (self.start_block, self.owner.to_disk(), self.to_disk().rm_offset.get())
    }
}

impl PartialOrd for RmapRecord {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RmapRecord {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}
