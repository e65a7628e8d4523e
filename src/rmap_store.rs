//! Per-group incore reverse-mapping index: an in-memory btree of rmap
//! records fed by the metadata scan, merged on adjacency, and iterated
//! in on-disk key order by the refcount sweep and the rebuild driver.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};
use zerocopy::byteorder::big_endian::{U32, U64};

use crate::error::FxfsrError;
use crate::mem::xfbtree::{LookupOp, PtrWidth, VisitWhat, XfBtree, XfbCursor, XfbRecord};
use crate::rmap::RmapRecord;
use crate::xfs::format::XfsRmapRec;
use crate::xfs::types::GroupNo;

/// Key of the incore rmap index: the on-disk sort order
/// (start block, owner, packed offset).
#[derive(
    FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, PartialEq, Eq, PartialOrd, Ord,
)]
#[repr(C)]
pub struct RmapKey {
    pub start_block: U32,
    pub owner: U64,
    pub offset: U64,
}

impl XfbRecord for XfsRmapRec {
    type Key = RmapKey;

    fn key(&self) -> RmapKey {
        RmapKey {
            start_block: self.rm_startblock,
            owner: self.rm_owner,
            offset: self.rm_offset,
        }
    }
}

/// Incore rmap index for one group.
pub struct RmapStore {
    group: GroupNo,
    tree: XfBtree<XfsRmapRec>,
}

impl RmapStore {
    pub fn create(group: GroupNo) -> Result<Self, FxfsrError> {
        // Owner tag keeps one group's scratch blocks from being read as
        // another's after a bookkeeping bug.
        let tag = ((group.is_realtime() as u64) << 32) | group.index() as u64;
        Ok(RmapStore {
            group,
            tree: XfBtree::create("incore rmap", tag, PtrWidth::Long)?,
        })
    }

    pub fn group(&self) -> GroupNo {
        self.group
    }

    pub fn len(&self) -> u64 {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Insert a mapping, merging it with a mergeable left or right
    /// neighbor. The upsert path for every record the scanner emits.
    pub fn map_raw(&mut self, rec: RmapRecord) -> Result<(), FxfsrError> {
        rec.validate()?;
        let mut rec = rec;

        // Try to merge with the record at or before us.
        if let Some(cur) = self.tree.lookup(LookupOp::Le, &key_of(&rec))? {
            let prev = RmapRecord::from_disk(&self.tree.get_rec(&cur)?);
            if prev.is_mergeable(&rec) {
                self.tree.delete(&key_of(&prev))?;
                rec = RmapRecord { start_block: prev.start_block, block_count: prev.block_count + rec.block_count, offset: prev.offset, ..rec };
            } else if prev.start_block == rec.start_block && prev.owner == rec.owner {
                return Err(FxfsrError::Parse("duplicate rmap for physical extent"));
            }
        }

        // Try to merge with the record after us.
        if let Some(cur) = self.tree.lookup(LookupOp::Ge, &key_of(&rec))? {
            let next = RmapRecord::from_disk(&self.tree.get_rec(&cur)?);
            if rec.is_mergeable(&next) {
                self.tree.delete(&key_of(&next))?;
                rec = RmapRecord { block_count: rec.block_count + next.block_count, ..rec };
            }
        }

        self.tree.insert(&rec.to_disk())?;
        self.tree.trans_commit()
    }

    /// Remove an exact record.
    pub fn unmap(&mut self, rec: &RmapRecord) -> Result<bool, FxfsrError> {
        let found = self.tree.delete(&key_of(rec))?;
        self.tree.trans_commit()?;
        Ok(found)
    }

    /// Cursor over the index in key order.
    pub fn iter_start(&mut self) -> Result<Option<RmapStoreCursor>, FxfsrError> {
        Ok(self.tree.goto_left_edge()?.map(RmapStoreCursor))
    }

    /// Record under the cursor.
    pub fn iter_get(&mut self, cur: &RmapStoreCursor) -> Result<RmapRecord, FxfsrError> {
        Ok(RmapRecord::from_disk(&self.tree.get_rec(&cur.0)?))
    }

    /// Advance; false at the end.
    pub fn iter_next(&mut self, cur: &mut RmapStoreCursor) -> Result<bool, FxfsrError> {
        self.tree.increment(&mut cur.0)
    }

    /// Collect every record in key order.
    pub fn to_vec(&mut self) -> Result<Vec<RmapRecord>, FxfsrError> {
        let mut out = Vec::with_capacity(self.tree.len() as usize);
        self.tree.visit_blocks(VisitWhat::Records, |bytes| {
            let rec = XfsRmapRec::read_from_bytes(bytes)
                .map_err(|_| FxfsrError::Parse("rmap record decode failed"))?;
            out.push(RmapRecord::from_disk(&rec));
            Ok(())
        })?;
        Ok(out)
    }
}

/// Iteration state over a [`RmapStore`].
pub struct RmapStoreCursor(XfbCursor);

fn key_of(rec: &RmapRecord) -> RmapKey {
    rec.to_disk().key()
}
