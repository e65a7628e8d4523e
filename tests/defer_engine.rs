use fxfsr::FxfsrError;
use fxfsr::defer::{
    DeferOps, DeferType, ExtentFreeItem, FinishResult, GroupRefTable, Transaction, WorkItem,
    cancel_all, finish_all,
};
use fxfsr::swapext::SwapExtIntent;
use fxfsr::xfs::inode::WhichFork;
use fxfsr::xfs::types::GroupNo;

fn free_item(agno: u32, start: u32) -> WorkItem {
    WorkItem::ExtentFree(ExtentFreeItem {
        group: GroupNo::Ag(agno),
        start_block: start,
        block_count: 1,
        skip_discard: false,
    })
}

fn swap_item(agno: u32) -> WorkItem {
    WorkItem::SwapExt(SwapExtIntent {
        ino1: 1,
        ino2: 2,
        group: GroupNo::Ag(agno),
        start_off1: 0,
        start_off2: 0,
        block_count: 0,
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
    })
}

/// Executor that records the order items finish in and can be told to
/// requeue specific items a few times.
#[derive(Default)]
struct RecordingExec {
    finished: Vec<(DeferType, u64)>,
    requeues_left: Vec<(u64, u32)>,
    cancelled: usize,
}

impl RecordingExec {
    fn should_requeue(&mut self, key: u64) -> bool {
        for (k, n) in &mut self.requeues_left {
            if *k == key && *n > 0 {
                *n -= 1;
                return true;
            }
        }
        false
    }
}

impl DeferOps for RecordingExec {
    fn finish_item(
        &mut self,
        _tp: &mut Transaction,
        item: &mut WorkItem,
    ) -> Result<FinishResult, FxfsrError> {
        let key = item.sort_key();
        self.finished.push((item.op_type(), key));
        if self.should_requeue(key) {
            return Ok(FinishResult::Requeue);
        }
        Ok(FinishResult::Done)
    }

    fn cancel_item(&mut self, _item: &mut WorkItem) {
        self.cancelled += 1;
    }
}

#[test]
fn items_of_one_type_run_in_sorted_group_order() {
    let refs = GroupRefTable::new();
    let mut tp = Transaction::new("test", refs);
    tp.defer(free_item(2, 10));
    tp.defer(free_item(0, 20));
    tp.defer(free_item(1, 30));

    let mut exec = RecordingExec::default();
    finish_all(&mut tp, &mut exec).unwrap();

    let groups: Vec<u64> = exec.finished.iter().map(|&(_, g)| g).collect();
    assert_eq!(groups, vec![0, 1, 2]);
    for w in exec.finished.windows(2) {
        assert!(w[0].1 <= w[1].1, "sort order violated: {:?}", exec.finished);
    }
}

#[test]
fn requeued_items_run_again_until_done() {
    let refs = GroupRefTable::new();
    let mut tp = Transaction::new("test", refs);
    tp.defer(free_item(0, 10));

    let mut exec = RecordingExec {
        requeues_left: vec![(0, 2)],
        ..Default::default()
    };
    finish_all(&mut tp, &mut exec).unwrap();

    // Two requeues means three executions.
    assert_eq!(exec.finished.len(), 3);
    assert_eq!(tp.pending_len(), 0);
    assert!(tp.rolls() >= 3);
}

#[test]
fn requeued_swapext_runs_after_everything_else() {
    let refs = GroupRefTable::new();
    let mut tp = Transaction::new("test", refs);
    tp.defer(swap_item(0));
    tp.defer(free_item(1, 10));

    let swap_key = swap_item(0).sort_key();
    let mut exec = RecordingExec {
        requeues_left: vec![(swap_key, 1)],
        ..Default::default()
    };
    finish_all(&mut tp, &mut exec).unwrap();

    let order: Vec<DeferType> = exec.finished.iter().map(|&(t, _)| t).collect();
    assert_eq!(
        order,
        vec![DeferType::SwapExt, DeferType::ExtentFree, DeferType::SwapExt]
    );
}

#[test]
fn intent_count_returns_to_zero() {
    let refs = GroupRefTable::new();
    let mut tp = Transaction::new("test", refs);
    tp.defer(free_item(0, 10));
    tp.defer(free_item(0, 11));

    let mut exec = RecordingExec::default();
    finish_all(&mut tp, &mut exec).unwrap();
    assert_eq!(tp.intent_count(), 0);
}

#[test]
fn cancel_releases_every_group_reference() {
    let refs = GroupRefTable::new();
    let mut tp = Transaction::new("test", refs.clone());
    tp.defer(free_item(0, 10));
    tp.defer(free_item(1, 20));
    assert_eq!(refs.active(GroupNo::Ag(0)), 1);
    assert_eq!(refs.active(GroupNo::Ag(1)), 1);

    let mut exec = RecordingExec::default();
    cancel_all(&mut tp, &mut exec);

    assert_eq!(exec.cancelled, 2);
    assert_eq!(refs.active(GroupNo::Ag(0)), 0);
    assert_eq!(refs.active(GroupNo::Ag(1)), 0);
    assert_eq!(tp.pending_len(), 0);
}

/// Executor whose first item fails; the engine must unwind the rest.
struct FailingExec {
    cancelled: usize,
}

impl DeferOps for FailingExec {
    fn finish_item(
        &mut self,
        _tp: &mut Transaction,
        _item: &mut WorkItem,
    ) -> Result<FinishResult, FxfsrError> {
        Err(FxfsrError::NoSpace("allocator exhausted"))
    }

    fn cancel_item(&mut self, _item: &mut WorkItem) {
        self.cancelled += 1;
    }
}

#[test]
fn a_failed_item_unwinds_the_whole_queue() {
    let refs = GroupRefTable::new();
    let mut tp = Transaction::new("test", refs.clone());
    tp.defer(free_item(0, 10));
    tp.defer(free_item(1, 20));
    tp.defer(free_item(2, 30));

    let mut exec = FailingExec { cancelled: 0 };
    let err = finish_all(&mut tp, &mut exec).unwrap_err();
    assert!(matches!(err, FxfsrError::NoSpace(_)));
    // Every queued item was cancelled, including the failing one.
    assert_eq!(exec.cancelled, 3);
    assert_eq!(tp.pending_len(), 0);
    assert_eq!(refs.active(GroupNo::Ag(1)), 0);
}
