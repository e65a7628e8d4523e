//! Refcount bag: the multiset of reverse mappings currently covering
//! the sweep position during refcount derivation. Backed by an
//! in-memory btree so membership stays logarithmic even when thousands
//! of mappings overlap one block.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};
use zerocopy::byteorder::big_endian::{U32, U64};

use crate::error::FxfsrError;
use crate::mem::xfbtree::{PtrWidth, VisitWhat, XfBtree, XfbRecord};
use crate::rmap::{RmapOwner, RmapRecord};
use crate::xfs::types::XfsIno;

/// Bag member: an rmap interval plus a count of identical intervals.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct RcBagRec {
    pub start_block: U32,
    pub block_count: U32,
    pub owner: U64,
    pub nr: U64,
}

/// Bag key: (start, length, owner).
#[derive(
    FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, PartialEq, Eq, PartialOrd, Ord,
)]
#[repr(C)]
pub struct RcBagKey {
    pub start_block: U32,
    pub block_count: U32,
    pub owner: U64,
}

impl XfbRecord for RcBagRec {
    type Key = RcBagKey;

    fn key(&self) -> RcBagKey {
        RcBagKey {
            start_block: self.start_block,
            block_count: self.block_count,
            owner: self.owner,
        }
    }
}

pub struct RcBag {
    tree: XfBtree<RcBagRec>,
    weight: u64,
}

impl RcBag {
    pub fn create() -> Result<Self, FxfsrError> {
        Ok(RcBag {
            tree: XfBtree::create("refcount bag", 0, PtrWidth::Long)?,
            weight: 0,
        })
    }

    /// Multiset size.
    pub fn count(&self) -> u64 {
        self.weight
    }

    pub fn is_empty(&self) -> bool {
        self.weight == 0
    }

    fn key_for(rmap: &RmapRecord) -> RcBagKey {
        RcBagKey {
            start_block: rmap.start_block.into(),
            block_count: rmap.block_count.into(),
            owner: rmap.owner.to_disk().into(),
        }
    }

    /// Add one rmap to the bag.
    pub fn add(&mut self, rmap: &RmapRecord) -> Result<(), FxfsrError> {
        let key = Self::key_for(rmap);
        if let Some(cur) = self.tree.lookup(crate::mem::xfbtree::LookupOp::Eq, &key)? {
            let mut rec = self.tree.get_rec(&cur)?;
            rec.nr = (rec.nr.get() + 1).into();
            self.tree.update(&cur, &rec)?;
        } else {
            self.tree.insert(&RcBagRec {
                start_block: key.start_block,
                block_count: key.block_count,
                owner: key.owner,
                nr: 1.into(),
            })?;
        }
        self.tree.trans_commit()?;
        self.weight += 1;
        Ok(())
    }

    /// Smallest block number where any bag member ends, if the bag is
    /// nonempty. The next sweep edge candidate.
    pub fn next_edge(&mut self) -> Result<Option<u64>, FxfsrError> {
        let mut min_end: Option<u64> = None;
        self.tree.visit_blocks(VisitWhat::Records, |bytes| {
            let rec = RcBagRec::read_from_bytes(bytes)
                .map_err(|_| FxfsrError::Parse("rcbag record decode failed"))?;
            let end = rec.start_block.get() as u64 + rec.block_count.get() as u64;
            min_end = Some(min_end.map_or(end, |m: u64| m.min(end)));
            Ok(())
        })?;
        Ok(min_end)
    }

    /// Remove every member whose interval ends at `end`.
    pub fn remove_ending_at(&mut self, end: u64) -> Result<(), FxfsrError> {
        let mut doomed = Vec::new();
        self.tree.visit_blocks(VisitWhat::Records, |bytes| {
            let rec = RcBagRec::read_from_bytes(bytes)
                .map_err(|_| FxfsrError::Parse("rcbag record decode failed"))?;
            if rec.start_block.get() as u64 + rec.block_count.get() as u64 == end {
                doomed.push((rec.key(), rec.nr.get()));
            }
            Ok(())
        })?;
        for (key, nr) in doomed {
            self.tree.delete(&key)?;
            self.weight -= nr;
        }
        self.tree.trans_commit()
    }

    /// Inode owners currently in the bag. Nonempty intersection of two
    /// or more marks those inodes as sharing extents.
    pub fn inode_owners(&mut self) -> Result<Vec<XfsIno>, FxfsrError> {
        let mut inos = Vec::new();
        self.tree.visit_blocks(VisitWhat::Records, |bytes| {
            let rec = RcBagRec::read_from_bytes(bytes)
                .map_err(|_| FxfsrError::Parse("rcbag record decode failed"))?;
            if let RmapOwner::Inode(ino) = RmapOwner::from_disk(rec.owner.get()) {
                for _ in 0..rec.nr.get() {
                    inos.push(ino);
                }
            }
            Ok(())
        })?;
        Ok(inos)
    }
}
