//! Deferred-operation engine: typed work items queued on a transaction,
//! executed in dependency order with intent accounting, requeue
//! semantics, and unwind-on-cancel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::FxfsrError;
use crate::rmap::RmapRecord;
use crate::swapext::SwapExtIntent;
use crate::xfs::types::{GroupNo, XfsFileoff, XfsFilblks, XfsFsblock, XfsIno};

/// Work item types, in scheduling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeferType {
    ExtentFree,
    RmapUpdate,
    RefcountUpdate,
    BmapUpdate,
    AttrSet,
    SwapExt,
}

impl DeferType {
    pub fn name(self) -> &'static str {
        match self {
            Self::ExtentFree => "extent_free",
            Self::RmapUpdate => "rmap_update",
            Self::RefcountUpdate => "refcount_update",
            Self::BmapUpdate => "bmap_update",
            Self::AttrSet => "attr_set",
            Self::SwapExt => "swapext",
        }
    }

    /// Most intents one transaction may carry before an intermediate
    /// roll.
    pub fn max_items(self) -> usize {
        match self {
            Self::ExtentFree => 16,
            Self::RmapUpdate | Self::RefcountUpdate => 16,
            Self::BmapUpdate => 1,
            Self::AttrSet => 1,
            Self::SwapExt => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmapOp {
    Map,
    Unmap,
    Convert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefcountOp {
    Increase,
    Decrease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BmapOp {
    Map,
    Unmap,
}

#[derive(Debug, Clone)]
pub struct ExtentFreeItem {
    pub group: GroupNo,
    pub start_block: u32,
    pub block_count: XfsFilblks,
    pub skip_discard: bool,
}

#[derive(Debug, Clone)]
pub struct RmapUpdateItem {
    pub group: GroupNo,
    pub op: RmapOp,
    pub rec: RmapRecord,
}

#[derive(Debug, Clone)]
pub struct RefcountUpdateItem {
    pub group: GroupNo,
    pub op: RefcountOp,
    pub start_block: u32,
    pub block_count: XfsFilblks,
}

#[derive(Debug, Clone)]
pub struct BmapUpdateItem {
    pub ino: XfsIno,
    pub group: GroupNo,
    pub op: BmapOp,
    pub attr_fork: bool,
    pub offset: XfsFileoff,
    pub start_block: XfsFsblock,
    pub block_count: XfsFilblks,
    pub unwritten: bool,
}

#[derive(Debug, Clone)]
pub struct AttrSetItem {
    pub ino: XfsIno,
    pub group: GroupNo,
    pub remove: bool,
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

/// One deferred work item. The payload carries everything `finish_item`
/// needs; the dispatch is a match on the variant.
#[derive(Debug, Clone)]
pub enum WorkItem {
    ExtentFree(ExtentFreeItem),
    RmapUpdate(RmapUpdateItem),
    RefcountUpdate(RefcountUpdateItem),
    BmapUpdate(BmapUpdateItem),
    AttrSet(AttrSetItem),
    SwapExt(SwapExtIntent),
}

impl WorkItem {
    pub fn op_type(&self) -> DeferType {
        match self {
            Self::ExtentFree(_) => DeferType::ExtentFree,
            Self::RmapUpdate(_) => DeferType::RmapUpdate,
            Self::RefcountUpdate(_) => DeferType::RefcountUpdate,
            Self::BmapUpdate(_) => DeferType::BmapUpdate,
            Self::AttrSet(_) => DeferType::AttrSet,
            Self::SwapExt(_) => DeferType::SwapExt,
        }
    }

    pub fn group(&self) -> GroupNo {
        match self {
            Self::ExtentFree(i) => i.group,
            Self::RmapUpdate(i) => i.group,
            Self::RefcountUpdate(i) => i.group,
            Self::BmapUpdate(i) => i.group,
            Self::AttrSet(i) => i.group,
            Self::SwapExt(i) => i.group,
        }
    }

    /// Items of one type run in this order, so lock acquisition order is
    /// consistent across types.
    pub fn sort_key(&self) -> u64 {
        let g = self.group();
        ((g.is_realtime() as u64) << 32) | g.index() as u64
    }
}

/// Tracks which groups have in-flight deferred work; a group cannot be
/// reclaimed while its count is nonzero.
#[derive(Default, Clone)]
pub struct GroupRefTable {
    counts: Arc<Mutex<HashMap<GroupNo, u64>>>,
}

impl GroupRefTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold(&self, group: GroupNo) -> GroupRef {
        *self.counts.lock().unwrap().entry(group).or_insert(0) += 1;
        GroupRef { table: self.clone(), group }
    }

    pub fn active(&self, group: GroupNo) -> u64 {
        self.counts.lock().unwrap().get(&group).copied().unwrap_or(0)
    }
}

/// Active reference pinning one group.
pub struct GroupRef {
    table: GroupRefTable,
    group: GroupNo,
}

impl GroupRef {
    pub fn group(&self) -> GroupNo {
        self.group
    }
}

impl Drop for GroupRef {
    fn drop(&mut self) {
        let mut counts = self.table.counts.lock().unwrap();
        if let Some(n) = counts.get_mut(&self.group) {
            *n -= 1;
            if *n == 0 {
                counts.remove(&self.group);
            }
        }
    }
}

/// A pending item: payload, its group pin, intent state.
pub struct PendingWork {
    pub item: WorkItem,
    pub group_ref: GroupRef,
    pub intent_logged: bool,
    pub cancelled: bool,
}

/// Result of finishing one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishResult {
    Done,
    /// More work remains; keep the item queued.
    Requeue,
}

/// A repair transaction: a queue of deferred items plus intent
/// accounting across rolls.
pub struct Transaction {
    name: &'static str,
    pending: Vec<PendingWork>,
    intent_count: u64,
    rolls: u64,
    group_refs: GroupRefTable,
}

impl Transaction {
    pub fn new(name: &'static str, group_refs: GroupRefTable) -> Self {
        Transaction {
            name,
            pending: Vec::new(),
            intent_count: 0,
            rolls: 0,
            group_refs,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn rolls(&self) -> u64 {
        self.rolls
    }

    pub fn intent_count(&self) -> u64 {
        self.intent_count
    }

    /// Queue a work item. Callable from `finish_item` via the executor;
    /// new items run after everything already queued for their type.
    pub fn defer(&mut self, item: WorkItem) {
        let group_ref = self.group_refs.hold(item.group());
        self.pending.push(PendingWork {
            item,
            group_ref,
            intent_logged: false,
            cancelled: false,
        });
    }

    /// Roll to a fresh transaction. Per-item cursors die here; items
    /// must reacquire them on their next `finish_item` call.
    fn roll(&mut self) {
        self.rolls += 1;
    }
}

/// Per-type operations the engine drives. Every hook is required; types
/// with nothing to do use the provided no-op defaults.
pub trait DeferOps {
    /// Log an intent covering `count` queued items of `kind`.
    fn create_intent(&mut self, tp: &mut Transaction, kind: DeferType, count: usize) {
        let _ = (tp, kind, count);
    }

    /// Abort a logged intent after a failure.
    fn abort_intent(&mut self, kind: DeferType) {
        let _ = kind;
    }

    /// Log the done item paired with an intent.
    fn create_done(&mut self, tp: &mut Transaction, kind: DeferType) {
        let _ = (tp, kind);
    }

    /// Apply one unit of work. `Err(Again)` is equivalent to
    /// `Ok(Requeue)`.
    fn finish_item(
        &mut self,
        tp: &mut Transaction,
        item: &mut WorkItem,
    ) -> Result<FinishResult, FxfsrError>;

    /// Release payload resources for an unprocessed item.
    fn cancel_item(&mut self, item: &mut WorkItem) {
        let _ = item;
    }

    /// Runs once per type after the last item of that type finished.
    fn finish_cleanup(&mut self, tp: &mut Transaction, kind: DeferType) {
        let _ = (tp, kind);
    }
}

/// Drive every queued item to completion.
///
/// Items of one type are sorted by `sort_key` and run as a batch; the
/// transaction rolls between items. Items the batch requeues go to the
/// back of their type; a requeued `SwapExt` goes to the back of the
/// whole queue so log pressure cannot pile up behind it.
pub fn finish_all<E: DeferOps>(tp: &mut Transaction, exec: &mut E) -> Result<(), FxfsrError> {
    while !tp.pending.is_empty() {
        // Batch = every queued item of the front item's type.
        let kind = tp.pending[0].item.op_type();
        let mut batch: Vec<PendingWork> = Vec::new();
        let mut rest: Vec<PendingWork> = Vec::new();
        for pw in tp.pending.drain(..) {
            if pw.item.op_type() == kind && batch.len() < kind.max_items() {
                batch.push(pw);
            } else {
                rest.push(pw);
            }
        }
        tp.pending = rest;
        batch.sort_by_key(|pw| pw.item.sort_key());

        exec.create_intent(tp, kind, batch.len());
        tp.intent_count += 1;

        let mut failed: Option<FxfsrError> = None;
        let mut batch_iter = batch.into_iter();
        for mut pw in batch_iter.by_ref() {
            if pw.cancelled {
                exec.cancel_item(&mut pw.item);
                continue;
            }
            let res = match exec.finish_item(tp, &mut pw.item) {
                Ok(r) => r,
                Err(FxfsrError::Again) => FinishResult::Requeue,
                Err(e) => {
                    exec.abort_intent(kind);
                    exec.cancel_item(&mut pw.item);
                    failed = Some(e);
                    break;
                }
            };
            match res {
                FinishResult::Done => drop(pw),
                FinishResult::Requeue => {
                    // Follow-on intents queued by this item must stay
                    // covered: the roll below happens with our intent
                    // still counted.
                    if kind == DeferType::SwapExt {
                        tp.pending.push(pw);
                    } else {
                        let at = tp
                            .pending
                            .iter()
                            .rposition(|p| p.item.op_type() == kind)
                            .map(|i| i + 1)
                            .unwrap_or(tp.pending.len());
                        tp.pending.insert(at, pw);
                    }
                }
            }
            tp.roll();
        }

        if let Some(e) = failed {
            // Unwind: cancel the rest of the batch and everything queued.
            for mut pw in batch_iter {
                exec.cancel_item(&mut pw.item);
            }
            cancel_all(tp, exec);
            return Err(e);
        }

        exec.create_done(tp, kind);
        debug_assert!(tp.intent_count > 0);
        tp.intent_count -= 1;
        if !tp.pending.iter().any(|p| p.item.op_type() == kind) {
            exec.finish_cleanup(tp, kind);
        }
    }
    Ok(())
}

/// Cancel a transaction: drop every queued item via `cancel_item`,
/// releasing group references as the pins drop.
pub fn cancel_all<E: DeferOps>(tp: &mut Transaction, exec: &mut E) {
    for mut pw in tp.pending.drain(..) {
        exec.cancel_item(&mut pw.item);
    }
    log::debug!("transaction {} cancelled after {} rolls", tp.name, tp.rolls);
}
