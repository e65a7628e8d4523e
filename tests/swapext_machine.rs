mod common;

use common::geometry_v4;
use fxfsr::FxfsrError;
use fxfsr::defer::FinishResult;
use fxfsr::swapext::{QuotaAdjust, SwapExtIntent, estimate, finish_one};
use fxfsr::xfs::inode::{ForkFormat, Inode, InodeFork, WhichFork};
use fxfsr::xfs::types::GroupNo;

fn regular_file(ino: u64) -> Inode {
    let mut ip = Inode::new(ino, 0o100644);
    ip.data_fork = InodeFork::new(ForkFormat::Extents);
    ip
}

fn intent(ino1: u64, ino2: u64, count: u64) -> SwapExtIntent {
    SwapExtIntent {
        ino1,
        ino2,
        group: GroupNo::Ag(0),
        start_off1: 0,
        start_off2: 0,
        block_count: count,
        isize1: 0,
        isize2: 0,
        which_fork: WhichFork::Data,
        ino1_written: false,
        clear_ino1_reflink: false,
        clear_ino2_reflink: false,
        cvt_ino2_sf: false,
        set_sizes: false,
        logged: true,
        nrext64: false,
    }
}

#[test]
fn single_extent_pair_swaps_in_one_call() {
    let geo = geometry_v4(1, 4096);
    let mut ip1 = regular_file(100);
    let mut ip2 = regular_file(101);
    ip1.data_fork.map(0, 1000, 10, false);
    ip2.data_fork.map(0, 2000, 10, false);
    ip1.nblocks = 10;
    ip2.nblocks = 10;

    let mut it = intent(100, 101, 10);
    let mut quota = QuotaAdjust::default();
    let res = finish_one(&mut it, &mut ip1, &mut ip2, &geo, &mut quota).unwrap();

    assert_eq!(res, FinishResult::Done);
    assert_eq!(it.block_count, 0);
    assert_eq!(ip1.data_fork.extents()[0].start_block, 2000);
    assert_eq!(ip2.data_fork.extents()[0].start_block, 1000);
    // Equal and opposite quota movement, net zero.
    assert_eq!(quota.delta(100).bcount, 0);
    assert_eq!(quota.delta(101).bcount, 0);
}

#[test]
fn block_count_decreases_monotonically_across_requeues() {
    let geo = geometry_v4(1, 4096);
    let mut ip1 = regular_file(100);
    let mut ip2 = regular_file(101);
    ip1.data_fork.map(0, 1000, 5, false);
    ip1.data_fork.map(5, 3000, 5, false);
    ip2.data_fork.map(0, 2000, 10, false);

    let mut it = intent(100, 101, 10);
    let mut quota = QuotaAdjust::default();
    let mut last = it.block_count;
    loop {
        let res = finish_one(&mut it, &mut ip1, &mut ip2, &geo, &mut quota).unwrap();
        assert!(it.block_count <= last, "block_count grew");
        last = it.block_count;
        if res == FinishResult::Done {
            break;
        }
    }
    assert_eq!(it.block_count, 0);
    // ip1's two source extents landed in ip2 at the right offsets.
    assert_eq!(ip2.data_fork.extents()[0].start_block, 1000);
    assert_eq!(ip2.data_fork.extents()[1].start_block, 3000);
}

#[test]
fn unwritten_ranges_on_the_first_file_are_skipped() {
    let geo = geometry_v4(1, 4096);
    let mut ip1 = regular_file(100);
    let mut ip2 = regular_file(101);
    // ip1: hole over [0,5), real extent at [5,10).
    ip1.data_fork.map(5, 1000, 5, false);
    ip2.data_fork.map(0, 2000, 10, false);

    let mut it = intent(100, 101, 10);
    it.ino1_written = true;
    let mut quota = QuotaAdjust::default();
    loop {
        if finish_one(&mut it, &mut ip1, &mut ip2, &geo, &mut quota).unwrap()
            == FinishResult::Done
        {
            break;
        }
    }

    // The hole was not exchanged: ip2 keeps [0,5) at 2000.
    assert_eq!(ip2.data_fork.lookup(0).start_block, Some(2000));
    assert_eq!(ip2.data_fork.lookup(5).start_block, Some(1000));
    assert_eq!(ip1.data_fork.lookup(5).start_block, Some(2005));
}

#[test]
fn identical_physical_extents_advance_without_work() {
    let geo = geometry_v4(1, 4096);
    let mut ip1 = regular_file(100);
    let mut ip2 = regular_file(101);
    ip1.data_fork.map(0, 1000, 10, false);
    ip2.data_fork.map(0, 1000, 10, false);

    let mut it = intent(100, 101, 10);
    let mut quota = QuotaAdjust::default();
    let res = finish_one(&mut it, &mut ip1, &mut ip2, &geo, &mut quota).unwrap();
    assert_eq!(res, FinishResult::Done);
    assert_eq!(ip1.data_fork.extents()[0].start_block, 1000);
}

#[test]
fn shared_extent_with_differing_state_is_corruption() {
    let geo = geometry_v4(1, 4096);
    let mut ip1 = regular_file(100);
    let mut ip2 = regular_file(101);
    ip1.data_fork.map(0, 1000, 10, false);
    ip2.data_fork.map(0, 1000, 10, true);

    let mut it = intent(100, 101, 10);
    let mut quota = QuotaAdjust::default();
    let err = finish_one(&mut it, &mut ip1, &mut ip2, &geo, &mut quota).unwrap_err();
    assert!(matches!(err, FxfsrError::Corrupt { .. }));
}

#[test]
fn sizes_are_committed_after_the_last_exchange() {
    let geo = geometry_v4(1, 4096);
    let mut ip1 = regular_file(100);
    let mut ip2 = regular_file(101);
    ip1.data_fork.map(0, 1000, 4, false);
    ip2.data_fork.map(0, 2000, 4, false);
    ip1.size = 4 * 4096;
    ip2.size = 3 * 4096;

    let mut it = intent(100, 101, 4);
    it.set_sizes = true;
    it.isize1 = 3 * 4096;
    it.isize2 = 4 * 4096;
    let mut quota = QuotaAdjust::default();
    loop {
        if finish_one(&mut it, &mut ip1, &mut ip2, &geo, &mut quota).unwrap()
            == FinishResult::Done
        {
            break;
        }
    }
    assert_eq!(ip1.size, 3 * 4096);
    assert_eq!(ip2.size, 4 * 4096);
}

#[test]
fn reflink_flags_are_cleared_in_postop() {
    let geo = geometry_v4(1, 4096);
    let mut ip1 = regular_file(100);
    let mut ip2 = regular_file(101);
    ip1.is_reflink = true;
    ip2.is_reflink = true;
    ip1.data_fork.map(0, 1000, 2, false);
    ip2.data_fork.map(0, 2000, 2, false);

    let mut it = intent(100, 101, 2);
    it.clear_ino1_reflink = true;
    it.clear_ino2_reflink = true;
    let mut quota = QuotaAdjust::default();
    loop {
        if finish_one(&mut it, &mut ip1, &mut ip2, &geo, &mut quota).unwrap()
            == FinishResult::Done
        {
            break;
        }
    }
    assert!(!ip1.is_reflink);
    assert!(!ip2.is_reflink);
    assert!(ip1.cow_fork.is_none());
}

#[test]
fn cow_fork_swaps_are_rejected() {
    let geo = geometry_v4(1, 4096);
    let mut ip1 = regular_file(100);
    let mut ip2 = regular_file(101);
    let mut it = intent(100, 101, 4);
    it.which_fork = WhichFork::Cow;
    let mut quota = QuotaAdjust::default();
    let err = finish_one(&mut it, &mut ip1, &mut ip2, &geo, &mut quota).unwrap_err();
    assert!(matches!(err, FxfsrError::InvalidArgument(_)));
}

#[test]
fn estimate_counts_exchanges_without_touching_state() {
    let geo = geometry_v4(1, 4096);
    let mut ip1 = regular_file(100);
    let mut ip2 = regular_file(101);
    ip1.data_fork.map(0, 1000, 5, false);
    ip1.data_fork.map(5, 3000, 5, false);
    ip2.data_fork.map(0, 2000, 10, false);
    ip1.size = 10 * 4096;
    ip2.size = 10 * 4096;

    let it = intent(100, 101, 10);
    let est = estimate(&it, &ip1, &ip2, &geo).unwrap();

    assert_eq!(est.nr_exchanges, 2);
    assert!(est.can_exchange_reflink);
    assert!(!est.nrext64_required);
    assert!(est.resblks > 0);
    // The simulation ran on copies.
    assert_eq!(ip1.data_fork.extents()[0].start_block, 1000);
}

#[test]
fn realtime_exchange_requires_unit_alignment() {
    let mut geo = geometry_v4(1, 4096);
    geo.rext_size = 4;
    let mut ip1 = regular_file(100);
    let mut ip2 = regular_file(101);
    ip1.is_realtime = true;
    ip2.is_realtime = true;
    // Mapping shorter than one allocation unit.
    ip1.data_fork.map(0, 1000, 2, false);
    ip2.data_fork.map(0, 2000, 2, false);

    let mut it = intent(100, 101, 2);
    let mut quota = QuotaAdjust::default();
    let err = finish_one(&mut it, &mut ip1, &mut ip2, &geo, &mut quota).unwrap_err();
    assert!(matches!(err, FxfsrError::Corrupt { .. }));
}
