//! Minimal live editor for freshly rebuilt on-disk btrees: record
//! insertion into leaves with room, plus AGF counter maintenance. The
//! bulk loader leaves slack in every block, so the drain of leftover
//! blocks after a rebuild never needs a split; if one ever would, the
//! caller gets an error instead of a corrupted tree.

use crate::error::FxfsrError;
use crate::io::bufcache::{BufCache, SECTOR_SIZE};
use crate::io::device::BlockDev;
use crate::xfs::agheaders::XfsAgf;
use crate::xfs::format::{
    parse_short_block, set_numrecs, short_hdr_size, stamp_block_crc,
};
use crate::xfs::geometry::{BtreeGeometry, BtreeKind, FsGeometry};
use crate::xfs::types::{XfsAgblock, XfsAgnumber};

/// Insert a free extent into both free-space btrees and bump the AGF
/// counters. Adjacent-extent merges are not attempted; the rebuild
/// driver only drains blocks that are not adjacent to free space.
pub fn free_extent(
    cache: &mut BufCache<BlockDev>,
    geo: &FsGeometry,
    agno: XfsAgnumber,
    start: XfsAgblock,
    len: u32,
) -> Result<(), FxfsrError> {
    let agf_daddr = geo.agf_byte_offset(agno) / SECTOR_SIZE;
    let agf = {
        let buf = cache.read_buf(agf_daddr, geo.sect_size as usize, None)?;
        let agf = XfsAgf::from_buf(buf.data(), agno)?;
        cache.relse(agf_daddr);
        agf
    };

    let mut rec = [0u8; 8];
    rec[0..4].copy_from_slice(&start.to_be_bytes());
    rec[4..8].copy_from_slice(&len.to_be_bytes());

    // bno tree: ordered by start block.
    insert_rec(
        cache,
        geo,
        agno,
        BtreeKind::Bno,
        agf.agf_bno_root.get(),
        agf.agf_bno_level.get(),
        &rec,
        |r| u64::from(u32::from_be_bytes(r[0..4].try_into().unwrap())),
    )?;
    // cnt tree: ordered by (length, start).
    insert_rec(
        cache,
        geo,
        agno,
        BtreeKind::Cnt,
        agf.agf_cnt_root.get(),
        agf.agf_cnt_level.get(),
        &rec,
        |r| {
            let s = u32::from_be_bytes(r[0..4].try_into().unwrap()) as u64;
            let l = u32::from_be_bytes(r[4..8].try_into().unwrap()) as u64;
            (l << 32) | s
        },
    )?;

    // AGF counters.
    let buf = cache.read_buf(agf_daddr, geo.sect_size as usize, None)?;
    let mut agf = XfsAgf::from_buf(buf.data(), agno)?;
    agf.agf_freeblks = (agf.agf_freeblks.get() + len).into();
    if len > agf.agf_longest.get() {
        agf.agf_longest = len.into();
    }
    agf.write_to(buf.data_mut(), geo.is_v5())?;
    cache.mark_dirty(agf_daddr);
    cache.relse(agf_daddr);
    cache.write_buf(agf_daddr)?;
    log::debug!("AG {agno}: drained {len} lost blocks at {start} into free space");
    Ok(())
}

/// Descend from the root to the leaf that should hold `rec` (ordered by
/// `sort_key`) and insert it there. Fails with `NoSpace` when the leaf
/// is full.
#[allow(clippy::too_many_arguments)]
fn insert_rec(
    cache: &mut BufCache<BlockDev>,
    geo: &FsGeometry,
    agno: XfsAgnumber,
    kind: BtreeKind,
    root: XfsAgblock,
    nlevels: u32,
    rec: &[u8; 8],
    sort_key: impl Fn(&[u8]) -> u64,
) -> Result<(), FxfsrError> {
    let g = BtreeGeometry::compute(kind, geo, 1);
    let hdr = short_hdr_size(geo.is_v5());
    let block_size = geo.block_size as usize;
    let rec_size = 8usize;
    let key_size = 8usize;
    let new_key = sort_key(rec);

    // Walk down, choosing the last child whose key <= the new key.
    let mut blkno = root;
    for level in (1..nlevels).rev() {
        let daddr = geo.ag_block_to_byte(agno, blkno) / SECTOR_SIZE;
        let buf = cache.read_buf(daddr, block_size, None)?;
        let (blk_level, numrecs) = parse_short_block(buf.data(), geo, kind, agno)?;
        if blk_level as u32 != level {
            cache.relse(daddr);
            return Err(FxfsrError::Parse("free-space btree level mismatch"));
        }
        let maxrecs = (block_size - hdr) / (key_size + 4);
        let ptr_base = hdr + maxrecs * key_size;
        let mut child_idx = 0usize;
        for i in 0..numrecs as usize {
            let koff = hdr + i * key_size;
            if sort_key(&buf.data()[koff..koff + key_size]) <= new_key {
                child_idx = i;
            } else {
                break;
            }
        }
        let poff = ptr_base + child_idx * 4;
        let child = u32::from_be_bytes(buf.data()[poff..poff + 4].try_into().unwrap());
        cache.relse(daddr);
        blkno = child;
    }

    // Leaf insert.
    let daddr = geo.ag_block_to_byte(agno, blkno) / SECTOR_SIZE;
    let buf = cache.read_buf(daddr, block_size, None)?;
    let (_, numrecs) = parse_short_block(buf.data(), geo, kind, agno)?;
    let numrecs = numrecs as usize;
    if numrecs >= g.leaf_maxrecs {
        cache.relse(daddr);
        return Err(FxfsrError::NoSpace("no room in free-space btree leaf"));
    }

    let mut at = numrecs;
    for i in 0..numrecs {
        let off = hdr + i * rec_size;
        if sort_key(&buf.data()[off..off + rec_size]) > new_key {
            at = i;
            break;
        }
    }

    let data = buf.data_mut();
    data.copy_within(hdr + at * rec_size..hdr + numrecs * rec_size, hdr + (at + 1) * rec_size);
    data[hdr + at * rec_size..hdr + (at + 1) * rec_size].copy_from_slice(rec);
    set_numrecs(data, (numrecs + 1) as u16);
    if geo.is_v5() {
        stamp_block_crc(data);
    }
    cache.mark_dirty(daddr);
    cache.relse(daddr);
    cache.write_buf(daddr)
}
