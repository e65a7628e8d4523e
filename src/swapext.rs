//! Extent-swap state machine: atomically exchanges ranges of block
//! mappings between two inode forks, restartable at every intermediate
//! state, with realtime allocation-unit alignment and post-operation
//! cleanup.

use std::collections::HashMap;

use crate::defer::FinishResult;
use crate::error::FxfsrError;
use crate::xfs::geometry::FsGeometry;
use crate::xfs::inode::{ForkFormat, Inode, InodeFork, WhichFork};
use crate::xfs::types::{GroupNo, XfsFilblks, XfsFileoff, XfsIno};

// Largest extent counts representable without the wide counters.
const MAX_EXTCNT_DATA_SMALL: u64 = (1 << 31) - 1;
const MAX_EXTCNT_ATTR_SMALL: u64 = (1 << 15) - 1;
const MAX_EXTCNT_DATA_LARGE: u64 = (1 << 48) - 1;

/// Persistent swap-extent intent. Everything needed to resume the
/// exchange after a crash is in here.
#[derive(Debug, Clone)]
pub struct SwapExtIntent {
    pub ino1: XfsIno,
    pub ino2: XfsIno,
    pub group: GroupNo,
    pub start_off1: XfsFileoff,
    pub start_off2: XfsFileoff,
    pub block_count: XfsFilblks,
    pub isize1: u64,
    pub isize2: u64,
    pub which_fork: WhichFork,
    // Flags.
    pub ino1_written: bool,
    pub clear_ino1_reflink: bool,
    pub clear_ino2_reflink: bool,
    pub cvt_ino2_sf: bool,
    pub set_sizes: bool,
    // Op flags.
    pub logged: bool,
    pub nrext64: bool,
}

impl SwapExtIntent {
    pub fn validate(&self) -> Result<(), FxfsrError> {
        if self.which_fork == WhichFork::Cow {
            return Err(FxfsrError::InvalidArgument(
                "cannot swap CoW fork mappings".into(),
            ));
        }
        if self.set_sizes && self.which_fork != WhichFork::Data {
            return Err(FxfsrError::InvalidArgument(
                "size exchange requires the data fork".into(),
            ));
        }
        Ok(())
    }

    pub fn has_more_swap_work(&self) -> bool {
        self.block_count > 0
    }

    pub fn has_postop_work(&self) -> bool {
        self.clear_ino1_reflink || self.clear_ino2_reflink || self.cvt_ino2_sf
    }

    fn advance(&mut self, len: XfsFilblks) {
        self.start_off1 += len;
        self.start_off2 += len;
        self.block_count -= len;
    }
}

/// Block-count deltas per inode, split by data vs realtime counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDelta {
    pub bcount: i64,
    pub rtbcount: i64,
}

/// Quota adjustments accumulated while swapping.
#[derive(Debug, Default)]
pub struct QuotaAdjust {
    deltas: HashMap<XfsIno, QuotaDelta>,
}

impl QuotaAdjust {
    pub fn add(&mut self, ino: XfsIno, is_realtime: bool, blocks: i64) {
        let d = self.deltas.entry(ino).or_default();
        if is_realtime {
            d.rtbcount += blocks;
        } else {
            d.bcount += blocks;
        }
    }

    pub fn delta(&self, ino: XfsIno) -> QuotaDelta {
        self.deltas.get(&ino).copied().unwrap_or_default()
    }
}

/// Skip length for an unwritten/hole window on a multi-block
/// allocation-unit file. Checks both the start-offset alignment and the
/// length alignment against the unit.
fn trim_unwritten_skip(start_off: XfsFileoff, len: XfsFilblks, unit: u64) -> XfsFilblks {
    if unit <= 1 {
        return len;
    }
    let misalign = start_off % unit;
    if misalign != 0 {
        // Align the window: skip only up to the next unit boundary.
        return len.min(unit - misalign);
    }
    // Whole units only.
    len - (len % unit)
}

/// Advance the exchange by one applied mapping pair (plus any skips
/// leading up to it). Returns `Requeue` while work remains.
pub fn finish_one(
    intent: &mut SwapExtIntent,
    ip1: &mut Inode,
    ip2: &mut Inode,
    geo: &FsGeometry,
    quota: &mut QuotaAdjust,
) -> Result<FinishResult, FxfsrError> {
    intent.validate()?;
    let unit = geo.alloc_unit(ip1.is_realtime);

    if intent.has_more_swap_work() {
        swap_one_pair(intent, ip1, ip2, geo, quota, unit)?;
    }

    if !intent.has_more_swap_work() && intent.set_sizes {
        ip1.size = intent.isize1;
        ip2.size = intent.isize2;
        intent.set_sizes = false;
    }

    if !intent.has_more_swap_work() && intent.has_postop_work() {
        run_postop(intent, ip1, ip2);
    }

    if intent.has_more_swap_work() || intent.has_postop_work() {
        return Ok(FinishResult::Requeue);
    }

    // Settle CoW fork attachment to match the final reflink state.
    for ip in [ip1, ip2] {
        if ip.is_reflink {
            if ip.cow_fork.is_none() {
                ip.cow_fork = Some(InodeFork::new(ForkFormat::Extents));
            }
        } else if ip.cow_fork.as_ref().is_some_and(|f| f.extent_count() == 0) {
            ip.cow_fork = None;
        }
    }
    Ok(FinishResult::Done)
}

/// Returns true when a mapping pair was actually exchanged (skips and
/// shared-extent advances alone return false).
fn swap_one_pair(
    intent: &mut SwapExtIntent,
    ip1: &mut Inode,
    ip2: &mut Inode,
    geo: &FsGeometry,
    quota: &mut QuotaAdjust,
    unit: u64,
) -> Result<bool, FxfsrError> {
    while intent.block_count > 0 {
        let fork1 = ip1
            .fork(intent.which_fork)
            .ok_or(FxfsrError::InvalidArgument("fork absent on first inode".into()))?;
        let fork2 = ip2
            .fork(intent.which_fork)
            .ok_or(FxfsrError::InvalidArgument("fork absent on second inode".into()))?;
        let m1 = fork1.lookup(intent.start_off1);
        let m2 = fork2.lookup(intent.start_off2);

        // Unbounded holes past the last mapping report zero length.
        let mut len = intent.block_count;
        if m1.block_count > 0 {
            len = len.min(m1.block_count);
        }
        if m2.block_count > 0 {
            len = len.min(m2.block_count);
        }
        if m1.block_count == 0 && m2.block_count == 0 {
            // Nothing mapped on either side for the rest of the range.
            intent.advance(intent.block_count);
            return Ok(false);
        }

        // Identical physical extents carry nothing to exchange, but a
        // state disagreement means the image is corrupt.
        if m1.start_block.is_some() && m1.start_block == m2.start_block {
            if m1.unwritten != m2.unwritten {
                return Err(FxfsrError::Corrupt {
                    what: "mapping state differs for shared physical extent",
                    agno: intent.group.index(),
                    bno: m1.start_block.unwrap(),
                });
            }
            intent.advance(len);
            continue;
        }

        // Unwritten-skip policy.
        if intent.ino1_written
            && intent.which_fork != WhichFork::Attr
            && (m1.is_hole() || m1.unwritten)
        {
            let skip = trim_unwritten_skip(intent.start_off1, len, unit);
            if skip > 0 {
                intent.advance(skip);
                continue;
            }
        }

        // Exchange whole allocation units only.
        if unit > 1 {
            if intent.start_off1 % unit != 0 || intent.start_off2 % unit != 0 {
                return Err(FxfsrError::Corrupt {
                    what: "realtime mapping misaligned to allocation unit",
                    agno: intent.group.index(),
                    bno: intent.start_off1,
                });
            }
            len -= len % unit;
            if len == 0 {
                return Err(FxfsrError::Corrupt {
                    what: "realtime mapping shorter than allocation unit",
                    agno: intent.group.index(),
                    bno: intent.start_off1,
                });
            }
        }

        // Unmap both sides, then map each mapping at the opposite
        // logical offset.
        let fork1 = ip1.fork_mut(intent.which_fork).unwrap();
        fork1.unmap(intent.start_off1, len);
        if let Some(blk) = m2.start_block {
            fork1.map(intent.start_off1, blk, len, m2.unwritten);
        }
        let fork2 = ip2.fork_mut(intent.which_fork).unwrap();
        fork2.unmap(intent.start_off2, len);
        if let Some(blk) = m1.start_block {
            fork2.map(intent.start_off2, blk, len, m1.unwritten);
        }

        // Quota: real blocks change owners in equal and opposite
        // amounts, on the counter the owning file's realtime flag picks.
        if m1.is_real() {
            quota.add(ip1.ino, ip1.is_realtime, -(len as i64));
            quota.add(ip2.ino, ip2.is_realtime, len as i64);
            ip1.nblocks -= len;
            ip2.nblocks += len;
        }
        if m2.is_real() {
            quota.add(ip2.ino, ip2.is_realtime, -(len as i64));
            quota.add(ip1.ino, ip1.is_realtime, len as i64);
            ip2.nblocks -= len;
            ip1.nblocks += len;
        }

        // Keep every mapping under EOF so log replay cannot see a
        // mapping beyond the inode size.
        if intent.which_fork == WhichFork::Data {
            let end_byte = (intent.start_off1 + len) << geo.block_log as u64;
            if m2.start_block.is_some() && ip1.size < end_byte {
                ip1.size = end_byte;
            }
            let end_byte2 = (intent.start_off2 + len) << geo.block_log as u64;
            if m1.start_block.is_some() && ip2.size < end_byte2 {
                ip2.size = end_byte2;
            }
        }

        intent.advance(len);
        return Ok(true);
    }
    Ok(false)
}

/// Post-operation cleanup once the exchange itself is complete.
fn run_postop(intent: &mut SwapExtIntent, ip1: &mut Inode, ip2: &mut Inode) {
    if intent.cvt_ino2_sf {
        try_fold_shortform(ip2);
        intent.cvt_ino2_sf = false;
    }
    if intent.clear_ino1_reflink {
        log::debug!("clearing reflink flag on inode {}", ip1.ino);
        ip1.is_reflink = false;
        intent.clear_ino1_reflink = false;
    }
    if intent.clear_ino2_reflink {
        log::debug!("clearing reflink flag on inode {}", ip2.ino);
        ip2.is_reflink = false;
        intent.clear_ino2_reflink = false;
    }
}

/// Fold a single-extent directory, attr-leaf, or remote symlink back to
/// shortform once its data fits in the inode literal area.
fn try_fold_shortform(ip: &mut Inode) {
    let eligible = ip.is_dir() || ip.is_symlink() || ip.attr_fork.is_some();
    if !eligible {
        return;
    }
    if ip.data_fork.extent_count() <= 1 && (ip.is_dir() || ip.is_symlink()) {
        ip.data_fork.format = Some(ForkFormat::Local);
    }
    if let Some(attr) = ip.attr_fork.as_mut() {
        if attr.extent_count() <= 1 {
            attr.format = Some(ForkFormat::Local);
        }
    }
}

/// Everything `estimate` reports about a prospective swap.
#[derive(Debug, Clone)]
pub struct SwapExtEstimate {
    /// Mapping pairs that will actually be exchanged.
    pub nr_exchanges: u64,
    pub ip1_bcount_delta: i64,
    pub ip2_bcount_delta: i64,
    /// Block reservation for bmbt and rmapbt growth.
    pub resblks: u64,
    /// The wide extent counters must be enabled for this swap.
    pub nrext64_required: bool,
    /// The reflink flags of the two inodes may simply be exchanged.
    pub can_exchange_reflink: bool,
}

/// Simulate the whole operation against copies of the state.
pub fn estimate(
    intent: &SwapExtIntent,
    ip1: &Inode,
    ip2: &Inode,
    geo: &FsGeometry,
) -> Result<SwapExtEstimate, FxfsrError> {
    intent.validate()?;
    let mut sim = intent.clone();
    let mut sip1 = ip1.clone();
    let mut sip2 = ip2.clone();
    let mut quota = QuotaAdjust::default();

    let unit = geo.alloc_unit(sip1.is_realtime);
    let mut nr_exchanges = 0u64;
    while sim.has_more_swap_work() {
        let before = sim.block_count;
        let swapped = swap_one_pair(&mut sim, &mut sip1, &mut sip2, geo, &mut quota, unit)?;
        if swapped {
            nr_exchanges += 1;
        } else if sim.block_count == before {
            break;
        }
    }

    let (cnt1, cnt2) = match intent.which_fork {
        WhichFork::Data => (sip1.data_fork.extent_count(), sip2.data_fork.extent_count()),
        WhichFork::Attr => (
            sip1.attr_fork.as_ref().map_or(0, |f| f.extent_count()),
            sip2.attr_fork.as_ref().map_or(0, |f| f.extent_count()),
        ),
        WhichFork::Cow => unreachable!("validated above"),
    };

    let small_limit = match intent.which_fork {
        WhichFork::Attr => MAX_EXTCNT_ATTR_SMALL,
        _ => MAX_EXTCNT_DATA_SMALL,
    };
    let nrext64_required = cnt1 > small_limit || cnt2 > small_limit;
    if nrext64_required {
        if !geo.has_nrext64 && intent.which_fork == WhichFork::Attr {
            return Err(FxfsrError::TooManyExtents);
        }
        if cnt1 > MAX_EXTCNT_DATA_LARGE || cnt2 > MAX_EXTCNT_DATA_LARGE {
            return Err(FxfsrError::TooManyExtents);
        }
        if !geo.has_nrext64 {
            return Err(FxfsrError::TooManyExtents);
        }
    }

    // Worst case every exchange splits a bmbt leaf on both files and
    // touches an rmapbt path per side.
    let bmbt_leaf_recs = ((geo.block_size as u64).saturating_sub(72) / 16).max(1);
    let bmbt_blocks = cnt1
        .div_ceil(bmbt_leaf_recs)
        .checked_add(cnt2.div_ceil(bmbt_leaf_recs))
        .ok_or(FxfsrError::NoSpace("bmbt reservation overflow"))?;
    let rmap_blocks = if geo.has_rmapbt {
        nr_exchanges
            .checked_mul(2)
            .ok_or(FxfsrError::NoSpace("rmapbt reservation overflow"))?
    } else {
        0
    };
    let resblks = bmbt_blocks
        .checked_add(rmap_blocks)
        .ok_or(FxfsrError::NoSpace("swap reservation overflow"))?;

    // The common full-file case: both ranges start at zero and cover
    // every mapped block under EOF, so the reflink flags can swap too.
    let blocks1 = ip1.size.div_ceil(geo.block_size as u64);
    let blocks2 = ip2.size.div_ceil(geo.block_size as u64);
    let can_exchange_reflink = intent.which_fork == WhichFork::Data
        && intent.start_off1 == 0
        && intent.start_off2 == 0
        && intent.block_count >= blocks1.max(blocks2);

    Ok(SwapExtEstimate {
        nr_exchanges,
        ip1_bcount_delta: quota.delta(ip1.ino).bcount + quota.delta(ip1.ino).rtbcount,
        ip2_bcount_delta: quota.delta(ip2.ino).bcount + quota.delta(ip2.ino).rtbcount,
        resblks,
        nrext64_required,
        can_exchange_reflink,
    })
}
