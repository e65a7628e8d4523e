//! Phase-level metadata scan: walk every allocation group, visit each
//! allocated inode's forks and the fixed per-group metadata, and
//! populate the per-group incore reverse-mapping indexes that the
//! refcount derivation and the rebuild driver consume.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use zerocopy::FromBytes;

use crate::error::FxfsrError;
use crate::io::device::BlockDev;
use crate::rmap::{RmapOwner, RmapRecord};
use crate::rmap_store::RmapStore;
use crate::xfs::agheaders::XfsAgi;
use crate::xfs::extent::{Extent, parse_extent_list};
use crate::xfs::format::{XfsInobtRec, parse_short_block};
use crate::xfs::geometry::{BtreeKind, FsGeometry};
use crate::xfs::inode::{
    DinodeInfo, ForkFormat, Inode, InodeFork, XFS_DINODE_FMT_BTREE, XFS_DINODE_FMT_EXTENTS,
    XFS_DINODE_FMT_LOCAL, parse_dinode,
};
use crate::xfs::sb::FormatVersion;
use crate::xfs::types::{GroupNo, XfsAgblock, XfsAgnumber, XfsIno};

/// Bmbt long-form block magics (V4 / V5).
const XFS_BMAP_MAGIC: u32 = 0x424d4150;
const XFS_BMAP3_MAGIC: u32 = 0x424d4133;

/// Workers in the scan pool.
const SCAN_WORKERS: usize = 4;

/// Everything the scan learned, keyed by group.
pub struct ScanResults {
    pub rmap_stores: HashMap<GroupNo, RmapStore>,
    /// Inode chunk records per AG, for the inobt/finobt rebuild.
    pub ino_chunks: HashMap<XfsAgnumber, Vec<XfsInobtRec>>,
    /// Incore inodes for the later verification phases.
    pub inodes: HashMap<XfsIno, Inode>,
    /// Groups whose scan failed, with the failure. The phase driver
    /// decides whether the run continues.
    pub failed_groups: Vec<(GroupNo, FxfsrError)>,
}

/// Scratch accumulated while scanning one AG.
struct AgScan {
    agno: XfsAgnumber,
    rmaps: Vec<RmapRecord>,
    /// Rmaps owned by this AG's inodes but living in another group
    /// (cross-AG extents, realtime extents).
    remote_rmaps: Vec<(GroupNo, RmapRecord)>,
    chunks: Vec<XfsInobtRec>,
    inodes: Vec<Inode>,
}

/// Scan the whole filesystem with a fixed-size worker pool, one task
/// per AG at most.
pub fn scan_filesystem(dev: &BlockDev, geo: &FsGeometry) -> Result<ScanResults, FxfsrError> {
    let ag_limit = std::env::var("FXFSR_MAX_AG")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(geo.ag_count)
        .min(geo.ag_count);

    let results = Mutex::new(ScanResults {
        rmap_stores: HashMap::new(),
        ino_chunks: HashMap::new(),
        inodes: HashMap::new(),
        failed_groups: Vec::new(),
    });
    let next_ag = AtomicU32::new(0);

    std::thread::scope(|scope| {
        let workers = SCAN_WORKERS.min(ag_limit.max(1) as usize);
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let agno = next_ag.fetch_add(1, Ordering::Relaxed);
                    if agno >= ag_limit {
                        break;
                    }
                    match scan_ag(dev, geo, agno) {
                        Ok(scan) => merge_ag(&results, scan),
                        Err(e) => {
                            log::warn!("AG {agno}: scan failed: {e}");
                            results
                                .lock()
                                .unwrap()
                                .failed_groups
                                .push((GroupNo::Ag(agno), e));
                        }
                    }
                }
            });
        }
    });

    let mut results = results.into_inner().unwrap();

    // Make sure every realtime group has a store even if no file mapped
    // into it.
    for rgno in 0..geo.rg_count {
        let group = GroupNo::Rtg(rgno);
        if !results.rmap_stores.contains_key(&group) {
            results.rmap_stores.insert(group, RmapStore::create(group)?);
        }
    }

    log::debug!(
        "scan: {} groups, {} inodes, {} failed groups",
        results.rmap_stores.len(),
        results.inodes.len(),
        results.failed_groups.len()
    );
    Ok(results)
}

/// Fold one AG's scratch into the shared accumulator under the mutex.
fn merge_ag(results: &Mutex<ScanResults>, scan: AgScan) {
    let mut res = results.lock().unwrap();

    let group = GroupNo::Ag(scan.agno);
    let mut routed: Vec<(GroupNo, RmapRecord)> =
        scan.rmaps.into_iter().map(|r| (group, r)).collect();
    routed.extend(scan.remote_rmaps);
    for (target, rec) in routed {
        let store = match res.rmap_stores.entry(target) {
            std::collections::hash_map::Entry::Occupied(o) => o.into_mut(),
            std::collections::hash_map::Entry::Vacant(v) => match RmapStore::create(target) {
                Ok(s) => v.insert(s),
                Err(e) => {
                    res.failed_groups.push((target, e));
                    continue;
                }
            },
        };
        if let Err(e) = store.map_raw(rec) {
            log::warn!("{target}: dropping unmappable rmap: {e}");
        }
    }

    res.ino_chunks.insert(scan.agno, scan.chunks);
    for ino in scan.inodes {
        res.inodes.insert(ino.ino, ino);
    }
}

/// Scan one allocation group.
fn scan_ag(dev: &BlockDev, geo: &FsGeometry, agno: XfsAgnumber) -> Result<AgScan, FxfsrError> {
    let mut scan = AgScan {
        agno,
        rmaps: Vec::new(),
        remote_rmaps: Vec::new(),
        chunks: Vec::new(),
        inodes: Vec::new(),
    };

    // Fixed headers: the four header sectors at the front of the group.
    let hdr_blocks = (4 * geo.sect_size as u32).div_ceil(geo.block_size).max(1);
    scan.rmaps.push(RmapRecord::metadata(0, hdr_blocks, RmapOwner::FsHeaders));

    // Internal log, when it lives in this AG.
    if geo.log_start != 0 {
        let (log_agno, log_agblock) = geo.fsb_to_agblock(geo.log_start);
        if log_agno == agno {
            scan.rmaps.push(RmapRecord::metadata(
                log_agblock,
                geo.log_blocks,
                RmapOwner::Log,
            ));
        }
    }

    // AGI -> inobt walk -> inode chunks.
    let mut sector = vec![0u8; geo.sect_size as usize];
    dev.read_at(&mut sector, geo.agi_byte_offset(agno))?;
    let agi = XfsAgi::from_buf(&sector, agno)?;

    let mut chunks =
        collect_inobt_records(dev, geo, agno, agi.agi_root.get(), agi.agi_level.get())?;
    chunks.sort_by_key(|r| r.start_ino());

    for rec in &chunks {
        emit_chunk_rmaps(geo, rec, &mut scan.rmaps);
        scan_inode_chunk(dev, geo, agno, rec, &mut scan)?;
        scan.chunks.push(*rec);
    }

    Ok(scan)
}

/// Rmaps for the blocks an inode chunk occupies. Sparse chunks only
/// cover the blocks behind populated holemask runs.
fn emit_chunk_rmaps(geo: &FsGeometry, rec: &XfsInobtRec, rmaps: &mut Vec<RmapRecord>) {
    let ipb = geo.inodes_per_block as u32;
    let chunk_block = rec.start_ino() / ipb;
    let holemask = rec.ir_holemask.get();

    if holemask == 0 {
        rmaps.push(RmapRecord::metadata(
            chunk_block,
            (64u32).div_ceil(ipb),
            RmapOwner::Inodes,
        ));
        return;
    }

    // Each holemask bit stands for 4 inodes. Walk runs of populated
    // bits and round them out to block boundaries.
    let mut bit = 0u32;
    while bit < 16 {
        if holemask & (1 << bit) != 0 {
            bit += 1;
            continue;
        }
        let run_start = bit;
        while bit < 16 && holemask & (1 << bit) == 0 {
            bit += 1;
        }
        let ino_start = run_start * 4;
        let ino_end = bit * 4;
        let blk_start = chunk_block + ino_start / ipb;
        let blk_end = chunk_block + ino_end.div_ceil(ipb);
        rmaps.push(RmapRecord::metadata(
            blk_start,
            blk_end - blk_start,
            RmapOwner::Inodes,
        ));
    }
}

/// Walk the inode btree rooted at `root` and collect all chunk records.
///
/// Level-by-level with the child pointers of each level visited in
/// ascending block order, like the original forward-sweep walk.
fn collect_inobt_records(
    dev: &BlockDev,
    geo: &FsGeometry,
    agno: XfsAgnumber,
    root: XfsAgblock,
    nlevels: u32,
) -> Result<Vec<XfsInobtRec>, FxfsrError> {
    // AGI level is 1-based (number of levels); bb_level is 0-based.
    let root_level = nlevels.saturating_sub(1);
    let hdr_size = crate::xfs::format::short_hdr_size(geo.is_v5());
    let block_size = geo.block_size as usize;
    let rec_size = std::mem::size_of::<XfsInobtRec>();

    let mut records = Vec::new();
    let mut current = vec![root];
    for level in (0..=root_level).rev() {
        current.sort_unstable();
        let mut next = Vec::new();
        for &blkno in &current {
            let mut buf = vec![0u8; block_size];
            dev.read_at(&mut buf, geo.ag_block_to_byte(agno, blkno))?;
            let (blk_level, numrecs) = parse_short_block(&buf, geo, BtreeKind::Ino, agno)?;
            if blk_level as u32 != level {
                return Err(FxfsrError::Parse("inobt level mismatch"));
            }
            if level == 0 {
                for i in 0..numrecs as usize {
                    let off = hdr_size + i * rec_size;
                    let rec = XfsInobtRec::read_from_bytes(&buf[off..off + rec_size])
                        .map_err(|_| FxfsrError::Parse("inobt record decode failed"))?;
                    records.push(rec);
                }
            } else {
                // Keys then pointers, laid out on maxrecs boundaries.
                let maxrecs = (block_size - hdr_size) / 8;
                let ptr_base = hdr_size + maxrecs * 4;
                for i in 0..numrecs as usize {
                    let off = ptr_base + i * 4;
                    next.push(u32::from_be_bytes(buf[off..off + 4].try_into().unwrap()));
                }
            }
        }
        current = next;
    }
    Ok(records)
}

/// Read one inode chunk and scan every allocated inode in it.
fn scan_inode_chunk(
    dev: &BlockDev,
    geo: &FsGeometry,
    agno: XfsAgnumber,
    rec: &XfsInobtRec,
    scan: &mut AgScan,
) -> Result<(), FxfsrError> {
    let chunk_block = rec.start_ino() / geo.inodes_per_block as u32;
    let chunk_bytes = 64 * geo.inode_size as usize;
    let mut buf = vec![0u8; chunk_bytes];
    dev.read_at(&mut buf, geo.ag_block_to_byte(agno, chunk_block))?;

    let is_v5 = geo.version == FormatVersion::V5;
    for i in 0..64u32 {
        if rec.is_hole(i) || !rec.is_allocated(i) {
            continue;
        }
        let agino = rec.start_ino() + i;
        let ino = geo.agino_to_ino(agno, agino);
        let off = i as usize * geo.inode_size as usize;
        if off + geo.inode_size as usize > buf.len() {
            break;
        }
        let inode_buf = &buf[off..off + geo.inode_size as usize];

        let info = match parse_dinode(inode_buf, ino, is_v5, geo.has_nrext64, geo.inode_size) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("inode {ino}: unreadable core, skipping: {e}");
                continue;
            }
        };
        scan_inode(dev, geo, inode_buf, &info, scan)?;
    }
    Ok(())
}

/// Visit one inode's forks, emitting rmaps and capturing the incore
/// form.
fn scan_inode(
    dev: &BlockDev,
    geo: &FsGeometry,
    inode_buf: &[u8],
    info: &DinodeInfo,
    scan: &mut AgScan,
) -> Result<(), FxfsrError> {
    let mut inode = Inode::new(info.ino, info.mode);
    inode.size = info.size;
    inode.generation = info.generation;
    inode.nblocks = info.nblocks;
    inode.is_realtime = info.is_realtime;
    inode.is_reflink = info.is_reflink;

    // Data fork.
    let fork_buf = &inode_buf[info.data_fork_offset..info.data_fork_offset + info.data_fork_size];
    let extents = match info.format {
        XFS_DINODE_FMT_LOCAL => {
            inode.data_fork = InodeFork::new(ForkFormat::Local);
            Vec::new()
        }
        XFS_DINODE_FMT_EXTENTS => parse_extent_list(fork_buf, info.nextents)?,
        XFS_DINODE_FMT_BTREE => {
            inode.data_fork = InodeFork::new(ForkFormat::Btree);
            walk_bmbt(dev, geo, fork_buf, info.data_fork_size, info.ino, false, scan)?
        }
        _ => Vec::new(),
    };
    emit_fork_rmaps(geo, info, &extents, false, scan);
    for e in &extents {
        inode.data_fork.map(e.logical_offset, e.start_block, e.block_count, e.is_unwritten);
    }

    // Attr fork.
    if let Some(attr_off) = info.attr_fork_offset {
        let attr_buf = &inode_buf[attr_off..attr_off + info.attr_fork_size];
        let mut attr_fork = InodeFork::new(ForkFormat::Extents);
        let attr_extents = match info.aformat {
            XFS_DINODE_FMT_EXTENTS => parse_extent_list(attr_buf, info.anextents)?,
            XFS_DINODE_FMT_BTREE => {
                attr_fork = InodeFork::new(ForkFormat::Btree);
                walk_bmbt(dev, geo, attr_buf, info.attr_fork_size, info.ino, true, scan)?
            }
            _ => Vec::new(),
        };
        emit_fork_rmaps(geo, info, &attr_extents, true, scan);
        for e in &attr_extents {
            attr_fork.map(e.logical_offset, e.start_block, e.block_count, e.is_unwritten);
        }
        inode.attr_fork = Some(attr_fork);
    }

    scan.inodes.push(inode);
    Ok(())
}

/// Convert one fork's extents to rmap records in the owning groups.
fn emit_fork_rmaps(
    geo: &FsGeometry,
    info: &DinodeInfo,
    extents: &[Extent],
    attr_fork: bool,
    scan: &mut AgScan,
) {
    for e in extents {
        if info.is_realtime && !attr_fork {
            // Data extents of realtime files live on the rt device.
            let (rgno, rgblock) = geo.rtb_to_rgblock(e.start_block);
            scan.remote_rmaps.push((
                GroupNo::Rtg(rgno),
                RmapRecord {
                    start_block: rgblock,
                    block_count: e.block_count as u32,
                    owner: RmapOwner::Inode(info.ino),
                    offset: e.logical_offset,
                    attr_fork: false,
                    bmbt_block: false,
                    unwritten: e.is_unwritten,
                },
            ));
        } else {
            let (e_agno, agblock) = geo.fsb_to_agblock(e.start_block);
            let rec = RmapRecord {
                start_block: agblock,
                block_count: e.block_count as u32,
                owner: RmapOwner::Inode(info.ino),
                offset: e.logical_offset,
                attr_fork,
                bmbt_block: false,
                unwritten: e.is_unwritten,
            };
            if e_agno == scan.agno {
                scan.rmaps.push(rec);
            } else {
                scan.remote_rmaps.push((GroupNo::Ag(e_agno), rec));
            }
        }
    }
}

/// Walk a btree-format fork: collect leaf extents and emit rmaps for
/// the bmbt blocks themselves.
fn walk_bmbt(
    dev: &BlockDev,
    geo: &FsGeometry,
    fork_buf: &[u8],
    fork_size: usize,
    ino: XfsIno,
    attr_fork: bool,
    scan: &mut AgScan,
) -> Result<Vec<Extent>, FxfsrError> {
    if fork_buf.len() < 4 {
        return Err(FxfsrError::Parse("bmbt root too small"));
    }
    let level = u16::from_be_bytes([fork_buf[0], fork_buf[1]]);
    let numrecs = u16::from_be_bytes([fork_buf[2], fork_buf[3]]) as usize;

    if level == 0 {
        return Err(FxfsrError::Parse("btree-format fork with leaf root"));
    }

    // In-inode root: compact layout, maxrecs from the fork size.
    let maxrecs = (fork_size - 4) / 16;
    let ptr_base = 4 + maxrecs * 8;
    let mut extents = Vec::new();
    for i in 0..numrecs {
        let off = ptr_base + i * 8;
        if off + 8 > fork_buf.len() {
            break;
        }
        let child = u64::from_be_bytes(fork_buf[off..off + 8].try_into().unwrap());
        walk_bmbt_block(dev, geo, child, level as u32 - 1, ino, attr_fork, scan, &mut extents)?;
    }
    Ok(extents)
}

#[allow(clippy::too_many_arguments)]
fn walk_bmbt_block(
    dev: &BlockDev,
    geo: &FsGeometry,
    fsblock: u64,
    expected_level: u32,
    ino: XfsIno,
    attr_fork: bool,
    scan: &mut AgScan,
    extents: &mut Vec<Extent>,
) -> Result<(), FxfsrError> {
    let (blk_agno, agblock) = geo.fsb_to_agblock(fsblock);
    let mut buf = vec![0u8; geo.block_size as usize];
    dev.read_at(&mut buf, geo.ag_block_to_byte(blk_agno, agblock))?;

    let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let (want_magic, hdr_size) = match geo.version {
        FormatVersion::V5 => (XFS_BMAP3_MAGIC, 72usize),
        FormatVersion::V4 => (XFS_BMAP_MAGIC, 24usize),
    };
    if magic != want_magic {
        return Err(FxfsrError::BadMagic("bmbt block"));
    }

    let level = u16::from_be_bytes([buf[4], buf[5]]);
    let numrecs = u16::from_be_bytes([buf[6], buf[7]]) as usize;
    if level as u32 != expected_level {
        return Err(FxfsrError::Parse("bmbt level mismatch"));
    }

    // The block itself belongs to the inode's fork as a BMBT block.
    let bmbt_rmap = RmapRecord {
        start_block: agblock,
        block_count: 1,
        owner: RmapOwner::Inode(ino),
        offset: 0,
        attr_fork,
        bmbt_block: true,
        unwritten: false,
    };
    if blk_agno == scan.agno {
        scan.rmaps.push(bmbt_rmap);
    } else {
        scan.remote_rmaps.push((GroupNo::Ag(blk_agno), bmbt_rmap));
    }

    if level == 0 {
        for i in 0..numrecs {
            let off = hdr_size + i * 16;
            if off + 16 > buf.len() {
                break;
            }
            let rec = crate::xfs::extent::XfsBmbtRec::ref_from_prefix(&buf[off..])
                .map_err(|_| FxfsrError::Parse("bmbt leaf record parse failed"))?
                .0;
            extents.push(rec.unpack());
        }
    } else {
        let maxrecs = (geo.block_size as usize - hdr_size) / 16;
        let ptr_base = hdr_size + maxrecs * 8;
        for i in 0..numrecs {
            let off = ptr_base + i * 8;
            if off + 8 > buf.len() {
                break;
            }
            let child = u64::from_be_bytes(buf[off..off + 8].try_into().unwrap());
            walk_bmbt_block(dev, geo, child, expected_level - 1, ino, attr_fork, scan, extents)?;
        }
    }
    Ok(())
}
