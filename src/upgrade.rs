//! Feature upgrade driver: validate that a quiescent filesystem has the
//! space and log headroom for a requested feature, then commit the new
//! superblock (with the needs-repair bit, so an interrupted upgrade is
//! finished on the next run) or abort with no change.

use crate::error::FxfsrError;
use crate::io::bufcache::{BufCache, SECTOR_SIZE};
use crate::io::device::BlockDev;
use crate::xfs::geometry::{BtreeGeometry, BtreeKind, FsGeometry};
use crate::xfs::sb::{
    FormatVersion, XFS_SB_FEAT_INCOMPAT_BIGTIME, XFS_SB_FEAT_INCOMPAT_METADIR,
    XFS_SB_FEAT_INCOMPAT_NEEDSREPAIR, XFS_SB_FEAT_INCOMPAT_NREXT64, XFS_SB_FEAT_INCOMPAT_PARENT,
    XFS_SB_FEAT_RO_COMPAT_FINOBT, XFS_SB_FEAT_RO_COMPAT_INOBTCNT, XFS_SB_FEAT_RO_COMPAT_REFLINK,
    XFS_SB_FEAT_RO_COMPAT_RMAPBT, XfsDsb,
};
use crate::xfs::types::XfsAgnumber;

/// Features the driver can add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureRequest {
    InobtCounts,
    BigTime,
    NrExt64,
    Finobt,
    Reflink,
    Rmapbt,
    ParentPointers,
    MetaDir,
    RtGroups,
}

impl FeatureRequest {
    pub fn name(self) -> &'static str {
        match self {
            Self::InobtCounts => "inode btree counters",
            Self::BigTime => "large timestamps",
            Self::NrExt64 => "64-bit extent counters",
            Self::Finobt => "free inode btree",
            Self::Reflink => "reflink",
            Self::Rmapbt => "reverse mapping btree",
            Self::ParentPointers => "parent pointers",
            Self::MetaDir => "metadata directory",
            Self::RtGroups => "realtime groups",
        }
    }

    fn already_present(self, sb: &XfsDsb) -> bool {
        match self {
            Self::InobtCounts => sb.has_inobtcnt(),
            Self::BigTime => sb.has_bigtime(),
            Self::NrExt64 => sb.has_nrext64(),
            Self::Finobt => sb.has_finobt(),
            Self::Reflink => sb.has_reflink(),
            Self::Rmapbt => sb.has_rmapbt(),
            Self::ParentPointers => sb.has_parent(),
            Self::MetaDir => sb.has_metadir(),
            Self::RtGroups => sb.has_rtgroups(),
        }
    }

    /// Structural prerequisites, checked before any space math.
    fn check_dependencies(self, sb: &XfsDsb) -> Result<(), FxfsrError> {
        if sb.version() != FormatVersion::V5 {
            return Err(FxfsrError::NotSupported(format!(
                "{} requires a V5 filesystem",
                self.name()
            )));
        }
        match self {
            Self::InobtCounts if !sb.has_finobt() => Err(FxfsrError::NotSupported(
                "inode btree counters require the free inode btree".into(),
            )),
            Self::Rmapbt if sb.sb_rblocks.get() > 0 && !sb.has_rtgroups() => {
                Err(FxfsrError::NotSupported(
                    "reverse mapping btree cannot be added with a non-grouped realtime device"
                        .into(),
                ))
            }
            Self::ParentPointers if !sb.has_ftype() => Err(FxfsrError::NotSupported(
                "parent pointers require directory entry ftypes".into(),
            )),
            Self::RtGroups if !sb.has_metadir() => Err(FxfsrError::NotSupported(
                "realtime groups require the metadata directory".into(),
            )),
            Self::RtGroups if sb.sb_rblocks.get() == 0 => Err(FxfsrError::NotSupported(
                "realtime groups require a realtime device".into(),
            )),
            _ => Ok(()),
        }
    }

    fn apply_bits(self, sb: &mut XfsDsb) {
        match self {
            Self::InobtCounts => {
                sb.sb_features_ro_compat =
                    (sb.sb_features_ro_compat.get() | XFS_SB_FEAT_RO_COMPAT_INOBTCNT).into();
            }
            Self::BigTime => {
                sb.sb_features_incompat =
                    (sb.sb_features_incompat.get() | XFS_SB_FEAT_INCOMPAT_BIGTIME).into();
            }
            Self::NrExt64 => {
                sb.sb_features_incompat =
                    (sb.sb_features_incompat.get() | XFS_SB_FEAT_INCOMPAT_NREXT64).into();
            }
            Self::Finobt => {
                sb.sb_features_ro_compat =
                    (sb.sb_features_ro_compat.get() | XFS_SB_FEAT_RO_COMPAT_FINOBT).into();
            }
            Self::Reflink => {
                sb.sb_features_ro_compat =
                    (sb.sb_features_ro_compat.get() | XFS_SB_FEAT_RO_COMPAT_REFLINK).into();
            }
            Self::Rmapbt => {
                sb.sb_features_ro_compat =
                    (sb.sb_features_ro_compat.get() | XFS_SB_FEAT_RO_COMPAT_RMAPBT).into();
            }
            Self::ParentPointers => {
                sb.sb_features_incompat =
                    (sb.sb_features_incompat.get() | XFS_SB_FEAT_INCOMPAT_PARENT).into();
            }
            Self::MetaDir => {
                sb.sb_features_incompat =
                    (sb.sb_features_incompat.get() | XFS_SB_FEAT_INCOMPAT_METADIR).into();
            }
            Self::RtGroups => {
                // Carve the realtime space into groups of whole rt
                // extents; the metadata directory bit is a checked
                // prerequisite, not set here.
                let rext_size = sb.sb_rextsize.get().max(1) as u64;
                let rg_extents = sb
                    .sb_rextents
                    .get()
                    .min(MAX_RTGROUP_BLOCKS / rext_size)
                    .max(1);
                let rg_blocks = rg_extents * rext_size;
                sb.sb_rgextents = (rg_extents as u32).into();
                sb.sb_rgcount =
                    ((sb.sb_rextents.get().div_ceil(rg_extents)) as u32).into();
                sb.sb_rgblklog = (u64::BITS - (rg_blocks - 1).leading_zeros()) as u8;
            }
        }
    }
}

/// Largest number of blocks one realtime group may span.
const MAX_RTGROUP_BLOCKS: u64 = (1 << 31) - 1;

/// Per-AG free-block floor: at least 10% of the group, and for groups
/// in the middle size range an absolute 10 GiB as well.
fn per_group_floor(geo: &FsGeometry, agno: XfsAgnumber) -> u64 {
    let ag_blocks = geo.ag_size(agno) as u64;
    let ten_pct = ag_blocks / 10;
    let ag_bytes = ag_blocks << geo.block_log as u64;
    const GIB: u64 = 1 << 30;
    if ag_bytes > 10 * GIB && ag_bytes < (1 << 40) {
        let abs_floor = (10 * GIB) >> geo.block_log as u64;
        ten_pct.max(abs_floor)
    } else {
        ten_pct
    }
}

/// Dummy per-group reservation a feature's new metadata would take.
fn per_group_reservation(geo: &FsGeometry, request: FeatureRequest) -> u64 {
    let ag_size = geo.ag_blocks as u64;
    match request {
        FeatureRequest::Finobt => {
            BtreeGeometry::compute(BtreeKind::Fino, geo, ag_size).maxlevels as u64 * 2
        }
        FeatureRequest::Rmapbt => {
            BtreeGeometry::compute(BtreeKind::Rmap, geo, ag_size).maxlevels as u64 * 4
        }
        FeatureRequest::Reflink => {
            BtreeGeometry::compute(BtreeKind::Refc, geo, ag_size).maxlevels as u64 * 2
        }
        _ => 8,
    }
}

/// Minimum log size the upgraded filesystem demands, in blocks.
fn min_log_blocks(geo: &FsGeometry, sb: &XfsDsb) -> u64 {
    // The dominant reservation is a full btree split on every tree a
    // transaction can touch; scale the base requirement by the worst
    // maxlevels of the feature set.
    let ag_size = geo.ag_blocks as u64;
    let mut levels = BtreeGeometry::compute(BtreeKind::Bno, geo, ag_size).maxlevels;
    if sb.has_rmapbt() {
        levels = levels.max(BtreeGeometry::compute(BtreeKind::Rmap, geo, ag_size).maxlevels);
    }
    if sb.has_reflink() {
        levels = levels.max(BtreeGeometry::compute(BtreeKind::Refc, geo, ag_size).maxlevels);
    }
    let base = 2048u64;
    base + levels as u64 * 256
}

/// Root inode number the filesystem would choose under `sb`'s feature
/// set: the first inode-aligned block past the fixed AG 0 metadata and
/// the internal log.
fn expected_rootino(geo: &FsGeometry, sb: &XfsDsb) -> u64 {
    let mut first = (4 * geo.sect_size as u64).div_ceil(geo.block_size as u64).max(1);
    first += 2; // free-space roots
    first += 1; // inobt root
    if sb.has_finobt() {
        first += 1;
    }
    if sb.has_rmapbt() {
        first += 1;
    }
    if sb.has_reflink() {
        first += 1;
    }
    if geo.log_start != 0 {
        let (log_agno, log_agblock) = geo.fsb_to_agblock(geo.log_start);
        if log_agno == 0 {
            first = first.max(log_agblock as u64 + geo.log_blocks as u64);
        }
    }
    geo.agino_to_ino(0, (first as u32) << geo.inop_blog)
}

/// Outcome of one upgrade attempt.
#[derive(Debug)]
pub struct UpgradeReport {
    pub request: FeatureRequest,
    pub committed: bool,
}

/// Validate and (unless `no_modify`) commit one feature addition.
pub fn upgrade_feature(
    cache: &mut BufCache<BlockDev>,
    geo: &FsGeometry,
    sb: &XfsDsb,
    request: FeatureRequest,
    no_modify: bool,
) -> Result<UpgradeReport, FxfsrError> {
    if request.already_present(sb) {
        return Err(FxfsrError::NotSupported(format!(
            "filesystem already has {}",
            request.name()
        )));
    }
    request.check_dependencies(sb)?;

    // Snapshot and tentatively install the new superblock.
    let mut candidate = sb.clone();
    request.apply_bits(&mut candidate);

    // Pre-flight 1: the existing log must cover the new minimum.
    let need_log = min_log_blocks(geo, &candidate);
    if (sb.sb_logblocks.get() as u64) < need_log {
        return Err(FxfsrError::NotSupported(format!(
            "log too small to add {}: have {} blocks, need {need_log}",
            request.name(),
            sb.sb_logblocks.get()
        )));
    }

    // Pre-flight 2: the root inode must not move under the new layout.
    let expect = expected_rootino(geo, &candidate);
    if expected_rootino(geo, sb) != expect {
        return Err(FxfsrError::NotSupported(format!(
            "adding {} would relocate the root inode",
            request.name()
        )));
    }

    // Pre-flight 3: every group must absorb its reservation and keep
    // its free-space floor.
    let resv = per_group_reservation(geo, request);
    let mut total_free = 0u64;
    for agno in 0..geo.ag_count {
        let free = read_ag_freeblks(cache, geo, agno)?;
        total_free += free;
        let floor = per_group_floor(geo, agno);
        if free < resv + floor {
            return Err(FxfsrError::NotSupported(format!(
                "not enough space in AG {agno} to add {}",
                request.name()
            )));
        }
    }

    // Pre-flight 4: whole-filesystem free space floors.
    let pct = if request == FeatureRequest::ParentPointers { 25 } else { 10 };
    if total_free * 100 < geo.dblocks * pct {
        return Err(FxfsrError::NotSupported(format!(
            "not enough space to add {}: need {pct}% free",
            request.name()
        )));
    }

    if no_modify {
        log::info!("would add {}", request.name());
        return Ok(UpgradeReport { request, committed: false });
    }

    // Commit: new feature bits plus needs-repair, so an interrupted
    // upgrade is completed on the next run.
    candidate.sb_features_incompat =
        (candidate.sb_features_incompat.get() | XFS_SB_FEAT_INCOMPAT_NEEDSREPAIR).into();
    let buf = cache.get_buf(0, geo.sect_size as usize)?;
    candidate.write_to(buf.data_mut())?;
    cache.mark_dirty(0);
    cache.relse(0);
    cache.write_buf(0)?;
    cache.target().flush()?;

    log::info!("added {}", request.name());
    Ok(UpgradeReport { request, committed: true })
}

/// Clear the needs-repair bit after a successful repair pass.
pub fn clear_needs_repair(
    cache: &mut BufCache<BlockDev>,
    geo: &FsGeometry,
    sb: &XfsDsb,
) -> Result<(), FxfsrError> {
    if !sb.needs_repair() {
        return Ok(());
    }
    let mut fixed = sb.clone();
    fixed.sb_features_incompat =
        (fixed.sb_features_incompat.get() & !XFS_SB_FEAT_INCOMPAT_NEEDSREPAIR).into();
    let buf = cache.get_buf(0, geo.sect_size as usize)?;
    fixed.write_to(buf.data_mut())?;
    cache.mark_dirty(0);
    cache.relse(0);
    cache.write_buf(0)?;
    cache.target().flush()
}

fn read_ag_freeblks(
    cache: &mut BufCache<BlockDev>,
    geo: &FsGeometry,
    agno: XfsAgnumber,
) -> Result<u64, FxfsrError> {
    let daddr = geo.agf_byte_offset(agno) / SECTOR_SIZE;
    let buf = cache.read_buf(daddr, geo.sect_size as usize, None)?;
    let agf = crate::xfs::agheaders::XfsAgf::from_buf(buf.data(), agno)?;
    cache.relse(daddr);
    Ok(agf.agf_freeblks.get() as u64)
}
