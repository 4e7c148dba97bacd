//! flush 位置
//!
//! 一次 flush 的全部状态：使用的 flush queue、当前 preceder、
//! 本 slum 是否无条件重定位叶子，以及统计。

use super::{FlushQueue, FlushReport};
use crate::{
    error::{Error, ErrorKind, Result},
    jnode::{blocknr_is_fake, JnodeRef, JnodeState},
    txnmgr::{AtomRef, TxnMgr},
};
use std::sync::Arc;

pub(super) struct FlushPos<'a> {
    pub(super) mgr: &'a TxnMgr,
    pub(super) fq: Arc<FlushQueue>,
    /// 最近一次按 parent-first 顺序分配的块号
    pub(super) preceder: u64,
    pub(super) leaf_relocate: bool,
    pub(super) report: FlushReport,
}

impl<'a> FlushPos<'a> {
    pub(super) fn new(mgr: &'a TxnMgr, fq: Arc<FlushQueue>) -> Self {
        Self {
            mgr,
            fq,
            preceder: 0,
            leaf_relocate: false,
            report: FlushReport::default(),
        }
    }

    /// flush queue 当前所属的 atom（融合后会变）
    pub(super) fn atom(&self) -> Result<AtomRef> {
        self.fq
            .atom()
            .ok_or(Error::new(ErrorKind::InvalidState, "Flush queue is detached"))
    }

    fn with_state(&self, node: &JnodeRef, f: impl FnOnce(JnodeState) -> bool) -> bool {
        let Ok(atom) = self.atom() else {
            return false;
        };
        let jg = node.lock();
        let same = jg.atom.as_ref().map_or(false, |a| Arc::ptr_eq(a, &atom));
        same && f(jg.state)
    }

    /// 同一 atom 中的脏节点
    pub(super) fn dirty_in_atom(&self, node: &JnodeRef) -> bool {
        self.with_state(node, |s| {
            s.contains(JnodeState::DIRTY) && !s.contains(JnodeState::HEARD_BANSHEE)
        })
    }

    /// 同一 atom 中尚未决定位置的脏节点
    pub(super) fn flushable(&self, node: &JnodeRef) -> bool {
        self.with_state(node, |s| {
            s.contains(JnodeState::DIRTY)
                && !s.is_decided()
                && !s.intersects(
                    JnodeState::FLUSH_QUEUED | JnodeState::WRITEBACK | JnodeState::HEARD_BANSHEE,
                )
        })
    }

    pub(super) fn budget_left(&self) -> bool {
        self.report.prepped < self.mgr.config.flush_batch
    }
}

/// 块号作为 preceder 使用时的值：假块号不算
pub(super) fn real_blocknr(blocknr: u64) -> u64 {
    if blocknr_is_fake(blocknr) {
        0
    } else {
        blocknr
    }
}
