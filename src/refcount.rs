//! Refcount derivation: sweep the incore rmap index of one group and
//! emit the reference-count records its shared extents imply.

use std::collections::HashSet;

use crate::error::FxfsrError;
use crate::mem::slab::Slab;
use crate::rcbag::RcBag;
use crate::rmap::RmapRecord;
use crate::rmap_store::RmapStore;
use crate::xfs::format::XfsRefcountRec;
use crate::xfs::types::{MAX_REFCOUNT, XfsIno};

/// Outcome of one group's sweep: the refcount records in start order
/// plus every inode seen sharing physical blocks.
pub struct RefcountDerivation {
    pub records: Slab<XfsRefcountRec>,
    pub shared_inodes: HashSet<XfsIno>,
}

/// Sweep-line over the group's shareable rmaps.
///
/// The bag holds every mapping covering the current position. At each
/// edge (a mapping starting or ending) the cover height is compared
/// with the previous span's; spans covered by two or more mappings
/// become refcount records.
pub fn derive_refcounts(store: &mut RmapStore) -> Result<RefcountDerivation, FxfsrError> {
    // The store iterates in (start, owner, offset) order, which is
    // start-block order for the sweep.
    let mut rmaps: Vec<RmapRecord> = store
        .to_vec()?
        .into_iter()
        .filter(|r| r.is_shareable())
        .collect();
    rmaps.sort_by_key(|r| r.start_block);

    let mut out = RefcountDerivation {
        records: Slab::create("derived refcounts")?,
        shared_inodes: HashSet::new(),
    };
    let mut bag = RcBag::create()?;
    let mut next = 0usize;

    while next < rmaps.len() {
        debug_assert!(bag.is_empty());
        // Open a new span at the lowest unprocessed start block.
        let sbno = rmaps[next].start_block as u64;
        while next < rmaps.len() && rmaps[next].start_block as u64 == sbno {
            bag.add(&rmaps[next])?;
            next += 1;
        }
        mark_shared(&mut bag, &mut out.shared_inodes)?;

        let mut cbno = sbno;
        let mut old_height = bag.count();
        loop {
            // The next edge is the nearer of the next unprocessed start
            // and the earliest end inside the bag.
            let bag_edge = bag.next_edge()?.expect("bag is nonempty inside the sweep");
            let nbno = match rmaps.get(next) {
                Some(r) => bag_edge.min(r.start_block as u64),
                None => bag_edge,
            };

            bag.remove_ending_at(nbno)?;
            while next < rmaps.len() && rmaps[next].start_block as u64 == nbno {
                bag.add(&rmaps[next])?;
                next += 1;
            }
            mark_shared(&mut bag, &mut out.shared_inodes)?;

            if bag.count() != old_height {
                if old_height > 1 {
                    emit(&mut out.records, cbno, nbno, old_height)?;
                }
                cbno = nbno;
            }
            if bag.is_empty() {
                break;
            }
            old_height = bag.count();
        }
    }

    log::debug!(
        "{}: derived {} refcount records, {} inodes share blocks",
        store.group(),
        out.records.len(),
        out.shared_inodes.len()
    );
    Ok(out)
}

fn emit(
    records: &mut Slab<XfsRefcountRec>,
    cbno: u64,
    nbno: u64,
    height: u64,
) -> Result<(), FxfsrError> {
    let refcount = height.min(MAX_REFCOUNT) as u32;
    records.push(&XfsRefcountRec {
        rc_startblock: (cbno as u32).into(),
        rc_blockcount: ((nbno - cbno) as u32).into(),
        rc_refcount: refcount.into(),
    })
}

fn mark_shared(bag: &mut RcBag, shared: &mut HashSet<XfsIno>) -> Result<(), FxfsrError> {
    if bag.count() < 2 {
        return Ok(());
    }
    let owners = bag.inode_owners()?;
    if owners.len() >= 2 {
        shared.extend(owners);
    }
    Ok(())
}
