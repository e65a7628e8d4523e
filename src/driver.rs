//! Run-level orchestration: open the devices, parse the superblock,
//! drive the repair phases in order, and map the outcome onto the exit
//! contract.

use std::collections::HashMap;

use crate::defer::{
    DeferOps, DeferType, ExtentFreeItem, FinishResult, GroupRefTable, Transaction, WorkItem,
    finish_all,
};
use crate::error::FxfsrError;
use crate::flags::{ExitCode, RepairFlags};
use crate::io::bufcache::BufCache;
use crate::io::device::{BlockDev, DevKind};
use crate::parent::{DirentWalker, PptrAction, PptrScan, PptrSource, apply_actions, verify_all_ags};
use crate::refcount::derive_refcounts;
use crate::rebuild::{AgRebuilder, rmap_commit_agbtree_mappings};
use crate::rmap_store::RmapStore;
use crate::scan::scan_filesystem;
use crate::swapext::{QuotaAdjust, finish_one};
use crate::upgrade::{clear_needs_repair, upgrade_feature};
use crate::xfs::geometry::FsGeometry;
use crate::xfs::inode::Inode;
use crate::xfs::sb::XfsDsb;
use crate::xfs::types::{GroupNo, XfsIno};

/// Deferred-op executor for the repair run: extent frees land in the
/// on-disk free-space trees, rmap updates in the incore stores, swaps
/// in the incore inode table.
pub struct RepairExec<'a> {
    pub cache: &'a mut BufCache<BlockDev>,
    pub geo: &'a FsGeometry,
    pub no_modify: bool,
    pub rmap_stores: &'a mut HashMap<GroupNo, RmapStore>,
    pub inodes: &'a mut HashMap<XfsIno, Inode>,
    pub quota: QuotaAdjust,
}

impl DeferOps for RepairExec<'_> {
    fn create_intent(&mut self, tp: &mut Transaction, kind: DeferType, count: usize) {
        log::trace!(
            "{}: intent for {count} {} items",
            tp.name(),
            kind.name()
        );
    }

    fn finish_item(
        &mut self,
        tp: &mut Transaction,
        item: &mut WorkItem,
    ) -> Result<FinishResult, FxfsrError> {
        match item {
            WorkItem::ExtentFree(ef) => self.finish_extent_free(ef),
            WorkItem::RmapUpdate(ru) => {
                let store = self
                    .rmap_stores
                    .get_mut(&ru.group)
                    .ok_or(FxfsrError::Parse("rmap update for unknown group"))?;
                match ru.op {
                    crate::defer::RmapOp::Map => store.map_raw(ru.rec)?,
                    crate::defer::RmapOp::Unmap => {
                        store.unmap(&ru.rec)?;
                    }
                    crate::defer::RmapOp::Convert => {
                        let mut flipped = ru.rec;
                        flipped.unwritten = !flipped.unwritten;
                        store.unmap(&ru.rec)?;
                        store.map_raw(flipped)?;
                    }
                }
                Ok(FinishResult::Done)
            }
            WorkItem::RefcountUpdate(rc) => {
                // Refcounts are rederived from the rmap index wholesale;
                // individual updates only log their intent.
                log::trace!(
                    "refcount {:?} [{}, +{}) in {}",
                    rc.op,
                    rc.start_block,
                    rc.block_count,
                    rc.group
                );
                Ok(FinishResult::Done)
            }
            WorkItem::BmapUpdate(bu) => {
                let inode = self
                    .inodes
                    .get_mut(&bu.ino)
                    .ok_or(FxfsrError::Parse("bmap update for unknown inode"))?;
                let which = if bu.attr_fork {
                    crate::xfs::inode::WhichFork::Attr
                } else {
                    crate::xfs::inode::WhichFork::Data
                };
                let fork = inode
                    .fork_mut(which)
                    .ok_or(FxfsrError::Parse("bmap update for absent fork"))?;
                match bu.op {
                    crate::defer::BmapOp::Map => {
                        fork.map(bu.offset, bu.start_block, bu.block_count, bu.unwritten);
                        // Follow-on rmap intent stays covered by this
                        // transaction's intent count across the roll.
                        let (agno, agblock) = self.geo.fsb_to_agblock(bu.start_block);
                        tp.defer(WorkItem::RmapUpdate(crate::defer::RmapUpdateItem {
                            group: GroupNo::Ag(agno),
                            op: crate::defer::RmapOp::Map,
                            rec: crate::rmap::RmapRecord {
                                start_block: agblock,
                                block_count: bu.block_count as u32,
                                owner: crate::rmap::RmapOwner::Inode(bu.ino),
                                offset: bu.offset,
                                attr_fork: bu.attr_fork,
                                bmbt_block: false,
                                unwritten: bu.unwritten,
                            },
                        }));
                    }
                    crate::defer::BmapOp::Unmap => {
                        fork.unmap(bu.offset, bu.block_count);
                        let (agno, agblock) = self.geo.fsb_to_agblock(bu.start_block);
                        tp.defer(WorkItem::RmapUpdate(crate::defer::RmapUpdateItem {
                            group: GroupNo::Ag(agno),
                            op: crate::defer::RmapOp::Unmap,
                            rec: crate::rmap::RmapRecord {
                                start_block: agblock,
                                block_count: bu.block_count as u32,
                                owner: crate::rmap::RmapOwner::Inode(bu.ino),
                                offset: bu.offset,
                                attr_fork: bu.attr_fork,
                                bmbt_block: false,
                                unwritten: bu.unwritten,
                            },
                        }));
                    }
                }
                Ok(FinishResult::Done)
            }
            WorkItem::AttrSet(attr) => {
                if attr.remove {
                    log::debug!("inode {}: removing attr", attr.ino);
                } else {
                    log::debug!("inode {}: setting attr ({} bytes)", attr.ino, attr.value.len());
                }
                Ok(FinishResult::Done)
            }
            WorkItem::SwapExt(intent) => {
                // Take both inodes out of the table to hold two
                // exclusive borrows at once.
                let mut ip1 = self
                    .inodes
                    .remove(&intent.ino1)
                    .ok_or(FxfsrError::Parse("swap of unknown inode"))?;
                let Some(mut ip2) = self.inodes.remove(&intent.ino2) else {
                    self.inodes.insert(ip1.ino, ip1);
                    return Err(FxfsrError::Parse("swap of unknown inode"));
                };
                let res = finish_one(intent, &mut ip1, &mut ip2, self.geo, &mut self.quota);
                self.inodes.insert(ip1.ino, ip1);
                self.inodes.insert(ip2.ino, ip2);
                res
            }
        }
    }
}

impl RepairExec<'_> {
    fn finish_extent_free(&mut self, ef: &ExtentFreeItem) -> Result<FinishResult, FxfsrError> {
        match ef.group {
            GroupNo::Ag(agno) => {
                if self.no_modify {
                    log::info!(
                        "would free {} blocks at AG {agno} block {}",
                        ef.block_count,
                        ef.start_block
                    );
                    return Ok(FinishResult::Done);
                }
                crate::ondisk::free_extent(
                    self.cache,
                    self.geo,
                    agno,
                    ef.start_block,
                    ef.block_count as u32,
                )?;
                Ok(FinishResult::Done)
            }
            GroupNo::Rtg(_) => {
                // Realtime frees update the rt bitmap file, owned by a
                // separate transaction per the lock order.
                log::debug!(
                    "{}: freeing {} rt blocks at {}",
                    ef.group,
                    ef.block_count,
                    ef.start_block
                );
                Ok(FinishResult::Done)
            }
        }
    }
}

/// External collaborators for the parent-pointer verify phase: the
/// directory-entry walker, a factory for per-worker attr-fork pptr
/// readers, and the on-disk applier for the repairs the verifier
/// emits. Directory and attr format parsing stay outside the engine.
pub struct ParentVerifyHooks<'a> {
    pub walker: &'a mut dyn DirentWalker,
    pub pptr_source: &'a (dyn Fn() -> Box<dyn PptrSource + Send> + Sync),
    pub apply: &'a mut dyn FnMut(&PptrAction) -> Result<(), FxfsrError>,
}

/// Full repair of a data device image. Returns the exit code the outer
/// shell should report. `parent` supplies the collaborators for the
/// final parent-pointer verify phase; without them that phase is
/// skipped.
pub fn run_repair(
    device_path: &str,
    flags: &RepairFlags,
    parent: Option<ParentVerifyHooks<'_>>,
) -> Result<ExitCode, FxfsrError> {
    let dev = BlockDev::open(device_path, DevKind::Data)?;
    let mut sector = vec![0u8; 4096];
    dev.read_at(&mut sector, 0)?;
    let sb = XfsDsb::from_buf(&sector)?;
    sb.verify_crc(&sector[..sb.sb_sectsize.get() as usize])?;
    let geo = FsGeometry::from_sb(&sb)?;
    let uuid = sb.sb_uuid;

    log::info!(
        "repairing {}: {} AGs of {} blocks, block size {}",
        device_path,
        geo.ag_count,
        geo.ag_blocks,
        geo.block_size
    );

    // Phase 2: feature upgrades run on the quiescent image before any
    // structural repair. Each upgrade starts from the superblock the
    // previous one committed.
    let mut cache = BufCache::new(dev);
    let mut modified = false;
    let mut cur_sb = sb.clone();
    for &request in &flags.add_features {
        match upgrade_feature(&mut cache, &geo, &cur_sb, request, flags.no_modify) {
            Ok(report) => {
                if report.committed {
                    modified = true;
                    let mut sector = vec![0u8; 4096];
                    cache.target().read_at(&mut sector, 0)?;
                    cur_sb = XfsDsb::from_buf(&sector)?;
                }
            }
            Err(e @ FxfsrError::NotSupported(_)) => {
                log::error!("{e}");
                return Ok(ExitCode::Unrepairable);
            }
            Err(e) => return Err(e),
        }
    }

    // Re-read the superblock in case an upgrade moved feature bits.
    let sb = {
        let mut sector = vec![0u8; 4096];
        cache.target().read_at(&mut sector, 0)?;
        XfsDsb::from_buf(&sector)?
    };
    let geo = FsGeometry::from_sb(&sb)?;

    // Log recovery is a collaborator; when it cannot find the tail the
    // outer shell asks us to destroy the log outright.
    if flags.zap_log && geo.log_start != 0 {
        if flags.no_modify {
            log::info!("would zero the internal log");
        } else {
            log::warn!("zeroing the internal log ({} blocks)", geo.log_blocks);
            let zero = vec![0u8; geo.block_size as usize];
            let (log_agno, log_agblock) = geo.fsb_to_agblock(geo.log_start);
            for blk in 0..geo.log_blocks {
                let off = geo.ag_block_to_byte(log_agno, log_agblock + blk);
                cache.target_mut().write_at(&zero, off)?;
            }
            cache.target().flush()?;
            modified = true;
        }
    }

    // Phase 3/4: scan everything into the incore indexes.
    let mut results = scan_filesystem(cache.target(), &geo)?;
    let fatal = results
        .failed_groups
        .iter()
        .any(|(_, e)| e.is_fatal());
    if fatal {
        return Ok(ExitCode::Unrepairable);
    }

    // Phase 5: per-group rebuild.
    let group_refs = GroupRefTable::new();
    let mut lost: Vec<(u32, u32, u32)> = Vec::new();
    let mut icount = 0u64;
    let mut ifree = 0u64;
    let mut fdblocks = 0u64;
    for agno in 0..geo.ag_count {
        let group = GroupNo::Ag(agno);
        let Some(store) = results.rmap_stores.get_mut(&group) else {
            continue;
        };
        let derived = derive_refcounts(store)?;
        let chunks = results.ino_chunks.remove(&agno).unwrap_or_default();

        // Inodes seen sharing blocks get the reflink flag.
        for ino in &derived.shared_inodes {
            if let Some(inode) = results.inodes.get_mut(ino) {
                inode.is_reflink = true;
            }
        }

        let rebuilder = AgRebuilder::new(
            &geo,
            uuid,
            agno,
            flags.no_modify,
            store,
            chunks,
            &derived.records,
        )?;
        match rebuilder.run(&mut cache) {
            Ok(summary) => {
                if !flags.no_modify {
                    rmap_commit_agbtree_mappings(
                        &mut cache,
                        &geo,
                        agno,
                        &summary,
                        &summary.rmap_records,
                    )?;
                }
                icount += summary.icount;
                ifree += summary.ifree;
                fdblocks += summary.freeblks;
                for run in coalesce(&summary.lost_blocks) {
                    lost.push((agno, run.0, run.1));
                }
                modified |= !flags.no_modify;
            }
            Err(e) if !e.is_fatal() => {
                log::error!("AG {agno}: rebuild failed: {e}");
                return Ok(ExitCode::Unrepairable);
            }
            Err(e) => return Err(e),
        }
    }

    // Drain lost blocks back into free space through the normal
    // deferred extent-free path.
    if !lost.is_empty() {
        let mut tp = Transaction::new("drain lost blocks", group_refs.clone());
        for &(agno, start, len) in &lost {
            tp.defer(WorkItem::ExtentFree(ExtentFreeItem {
                group: GroupNo::Ag(agno),
                start_block: start,
                block_count: len as u64,
                skip_discard: true,
            }));
        }
        let mut exec = RepairExec {
            cache: &mut cache,
            geo: &geo,
            no_modify: flags.no_modify,
            rmap_stores: &mut results.rmap_stores,
            inodes: &mut results.inodes,
            quota: QuotaAdjust::default(),
        };
        if let Err(e) = finish_all(&mut tp, &mut exec) {
            // The engine has already unwound the queue.
            log::warn!("lost-block drain failed: {e}");
        }
    }

    // Settle the superblock counters and the needs-repair bit.
    if !flags.no_modify {
        let mut fixed = sb.clone();
        fixed.sb_icount = icount.into();
        fixed.sb_ifree = ifree.into();
        fixed.sb_fdblocks = fdblocks.into();
        let buf = cache.get_buf(0, geo.sect_size as usize)?;
        fixed.write_to(buf.data_mut())?;
        cache.mark_dirty(0);
        cache.relse(0);
        cache.write_buf(0)?;
        clear_needs_repair(&mut cache, &geo, &fixed)?;
        cache.flush()?;
        cache.target().flush()?;
    }

    // Final phase: dirent <-> parent-pointer crosscheck.
    if let Some(hooks) = parent {
        match run_parent_verify(&geo, flags, hooks, &results.inodes) {
            Ok(repaired) => modified |= repaired,
            Err(e) if !e.is_fatal() => {
                log::error!("parent pointer check failed: {e}");
                return Ok(ExitCode::Unrepairable);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(if modified { ExitCode::Repaired } else { ExitCode::Clean })
}

/// Drive both verifier passes: collect every dirent into the per-AG
/// master slabs, then crosscheck each AG's inodes with one worker per
/// AG. Returns whether any on-disk pptr was changed.
fn run_parent_verify(
    geo: &FsGeometry,
    flags: &RepairFlags,
    hooks: ParentVerifyHooks<'_>,
    inodes: &HashMap<XfsIno, Inode>,
) -> Result<bool, FxfsrError> {
    if !geo.has_parent {
        log::debug!("skipping parent pointer check: feature not enabled");
        return Ok(false);
    }

    // Pass 1: dirent scan. The driver owns the scan exclusively here,
    // so no insertion lock is needed.
    let mut pscan = PptrScan::create(geo.ag_count)?;
    hooks.walker.walk(&mut |ent| pscan.add_dirent(geo, ent))?;
    pscan.freeze()?;

    // Pass 2 walks each AG's allocated inodes in ascending order.
    let mut per_ag: HashMap<u32, Vec<XfsIno>> = HashMap::new();
    for &ino in inodes.keys() {
        per_ag.entry(geo.ino_to_agno(ino)).or_default().push(ino);
    }
    for inos in per_ag.values_mut() {
        inos.sort_unstable();
    }

    let outcomes = verify_all_ags(
        geo,
        &pscan,
        |agno| per_ag.get(&agno).cloned().unwrap_or_default(),
        hooks.pptr_source,
    );

    let mut repaired = false;
    let apply = hooks.apply;
    for (agno, outcome) in outcomes {
        let actions = outcome.map_err(|e| {
            log::error!("AG {agno}: parent pointers inconsistent: {e}");
            e
        })?;
        if !actions.is_empty() {
            repaired |= !flags.no_modify;
        }
        apply_actions(&actions, flags.no_modify, &mut *apply)?;
    }
    Ok(repaired)
}

/// Coalesce a sorted block list into (start, len) runs.
fn coalesce(blocks: &[u32]) -> Vec<(u32, u32)> {
    let mut sorted = blocks.to_vec();
    sorted.sort_unstable();
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for &b in &sorted {
        match runs.last_mut() {
            Some((s, l)) if *s + *l == b => *l += 1,
            _ => runs.push((b, 1)),
        }
    }
    runs
}
