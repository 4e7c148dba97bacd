//! atom：提交单元
//!
//! atom 持有被捕获的 jnode（按链表分类）和附着的事务句柄。
//! 所有字段由 atom 锁保护，等待阶段变化使用 atom 自带的条件变量。

use super::txnh::TxnhRef;
use crate::{
    blocknr_set::BlocknrSet,
    consts::MAX_TREE_HEIGHT,
    flush::FlushQueue,
    jnode::{JnodeId, JnodeInner, JnodeRef, JnodeState},
};
use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

/// atom 标识，单调递增
pub type AtomId = u64;

/// 共享的 atom 引用
pub type AtomRef = Arc<Atom>;

/// atom 阶段
///
/// 只增不减
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AtomStage {
    /// 刚分配，还没有捕获任何节点或句柄
    Free,
    /// 接受 capture 和 fusion
    CaptureFuse,
    /// 即将提交：接受 fusion，阻塞不融合的竞争 capture
    CaptureWait,
    /// flush 完成，只有提交者在工作
    PreCommit,
    /// 日志已持久，正在原地写回
    PostCommit,
    /// 提交完成
    Done,
    /// 已被融合进其他 atom
    Invalid,
}

impl AtomStage {
    /// 是否已经进入提交（不再接受 capture / fusion）
    pub fn is_committing(self) -> bool {
        self >= AtomStage::PreCommit
    }
}

bitflags! {
    /// atom 标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AtomFlags: u8 {
        /// 要求尽快提交（sync / fsync）
        const FORCE_COMMIT = 0x01;
        /// 上一次提交的日志写失败
        const FAILED       = 0x02;
    }
}

/// jnode 所在的 atom 链表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomList {
    /// 不在任何链表上
    None,
    /// 某一层级的脏链表
    Dirty(u8),
    /// 干净链表（已写出或只被读捕获）
    Clean,
    /// overwrite set
    Overwrite,
    /// 在 flush queue 的 prepped 链表上
    Queued,
    /// 写 I/O 中
    Writeback,
}

/// atom 的可变部分
#[derive(Debug)]
pub struct AtomInner {
    pub(crate) stage: AtomStage,
    pub(crate) flags: AtomFlags,
    /// 正在驱动提交的句柄 id
    pub(crate) committer: Option<u64>,
    /// 按层级的脏链表，下标为树层级
    pub(crate) dirty: Vec<BTreeMap<JnodeId, JnodeRef>>,
    pub(crate) clean: BTreeMap<JnodeId, JnodeRef>,
    pub(crate) ovrwr: BTreeMap<JnodeId, JnodeRef>,
    pub(crate) writeback: BTreeMap<JnodeId, JnodeRef>,
    /// 附着的事务句柄
    pub(crate) txnhs: Vec<TxnhRef>,
    /// 被捕获的节点数，等于各链表长度之和（含 flush queue）
    pub(crate) capture_count: usize,
    /// 提交后释放的块
    pub(crate) delete_set: BlocknrSet,
    /// 原始块 → 漂移块
    pub(crate) wandered_map: BlocknrSet,
    pub(crate) flush_queues: Vec<Arc<FlushQueue>>,
    pub(crate) nr_flushers: u32,
    /// 阻塞在其他 atom 上的附着句柄数
    pub(crate) nr_waiters: u32,
    pub(crate) nr_running_queues: u32,
    /// 为 overwrite 节点预留的日志块数
    pub(crate) log_reserved: u64,
    pub(crate) start: Instant,
    /// 融合后指向吸收本 atom 的 atom
    pub(crate) fused_into: Option<AtomRef>,
}

/// atom
pub struct Atom {
    id: AtomId,
    pub(crate) inner: Mutex<AtomInner>,
    pub(crate) cond: Condvar,
}

impl core::fmt::Debug for Atom {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Atom").field("id", &self.id).finish()
    }
}

impl Atom {
    pub(crate) fn new(id: AtomId) -> AtomRef {
        Arc::new(Self {
            id,
            inner: Mutex::new(AtomInner {
                stage: AtomStage::Free,
                flags: AtomFlags::empty(),
                committer: None,
                dirty: (0..=MAX_TREE_HEIGHT).map(|_| BTreeMap::new()).collect(),
                clean: BTreeMap::new(),
                ovrwr: BTreeMap::new(),
                writeback: BTreeMap::new(),
                txnhs: Vec::new(),
                capture_count: 0,
                delete_set: BlocknrSet::new(),
                wandered_map: BlocknrSet::new(),
                flush_queues: Vec::new(),
                nr_flushers: 0,
                nr_waiters: 0,
                nr_running_queues: 0,
                log_reserved: 0,
                start: Instant::now(),
                fused_into: None,
            }),
            cond: Condvar::new(),
        })
    }

    /// atom id
    pub fn id(&self) -> AtomId {
        self.id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, AtomInner> {
        self.inner.lock()
    }

    /// 当前阶段
    pub fn stage(&self) -> AtomStage {
        self.inner.lock().stage
    }

    /// 被捕获的节点数
    pub fn capture_count(&self) -> usize {
        self.inner.lock().capture_count
    }

    /// 附着的句柄数
    pub fn txnh_count(&self) -> usize {
        self.inner.lock().txnhs.len()
    }

    /// 唤醒所有等待本 atom 的线程
    pub(crate) fn wake_all(&self) {
        self.cond.notify_all();
    }
}

impl AtomInner {
    /// 附着的句柄数
    pub(crate) fn txnh_count(&self) -> usize {
        self.txnhs.len()
    }

    /// 设置阶段（只增不减）
    pub(crate) fn set_stage(&mut self, stage: AtomStage) {
        debug_assert!(stage >= self.stage, "atom stage must not go back");
        if stage > self.stage {
            self.stage = stage;
        }
    }

    /// 存活时间
    pub(crate) fn age(&self) -> Duration {
        self.start.elapsed()
    }

    fn list_mut(&mut self, list: AtomList) -> Option<&mut BTreeMap<JnodeId, JnodeRef>> {
        match list {
            AtomList::Dirty(level) => self.dirty.get_mut(level as usize),
            AtomList::Clean => Some(&mut self.clean),
            AtomList::Overwrite => Some(&mut self.ovrwr),
            AtomList::Writeback => Some(&mut self.writeback),
            AtomList::None | AtomList::Queued => None,
        }
    }

    /// 把节点移到另一个链表
    ///
    /// `Queued` 链表由 flush queue 自己维护，这里只改标记
    pub(crate) fn relink(&mut self, node: &JnodeRef, jg: &mut JnodeInner, to: AtomList) {
        if jg.list == to {
            return;
        }
        let from = jg.list;
        if let Some(map) = self.list_mut(from) {
            map.remove(&node.id());
        }
        if let Some(map) = self.list_mut(to) {
            map.insert(node.id(), node.clone());
        }
        jg.list = to;
    }

    /// 捕获一个节点（调用者已检查节点未被其他 atom 捕获）
    pub(crate) fn attach_jnode(&mut self, atom: &AtomRef, node: &JnodeRef, jg: &mut JnodeInner) {
        debug_assert!(jg.atom.is_none());
        self.open();
        jg.atom = Some(atom.clone());
        self.capture_count += 1;
        let list = if jg.state.contains(JnodeState::DIRTY) {
            AtomList::Dirty(node.level())
        } else {
            AtomList::Clean
        };
        self.relink(node, jg, list);
    }

    /// 附着一个事务句柄
    pub(crate) fn attach_txnh(&mut self, txnh: TxnhRef) {
        debug_assert!(!self.txnhs.iter().any(|t| Arc::ptr_eq(t, &txnh)));
        self.open();
        self.txnhs.push(txnh);
    }

    /// 第一次捕获时从 `Free` 进入 `CaptureFuse`
    fn open(&mut self) {
        if self.stage == AtomStage::Free {
            self.stage = AtomStage::CaptureFuse;
        }
    }

    /// 摘下一个事务句柄
    pub(crate) fn detach_txnh(&mut self, txnh: &TxnhRef) {
        self.txnhs.retain(|t| !Arc::ptr_eq(t, txnh));
    }

    /// 是否有脏节点（任意层级）
    pub(crate) fn has_dirty(&self) -> bool {
        self.dirty.iter().any(|l| !l.is_empty())
    }

    /// 脏节点总数
    pub(crate) fn dirty_count(&self) -> usize {
        self.dirty.iter().map(|l| l.len()).sum()
    }

    /// 从叶子层向上找第一个满足条件的脏节点
    pub(crate) fn first_dirty(&self, mut pred: impl FnMut(&JnodeRef) -> bool) -> Option<JnodeRef> {
        self.dirty
            .iter()
            .flat_map(|l| l.values())
            .find(|n| pred(n))
            .cloned()
    }

    /// 链表中的全部节点（不含 flush queue）
    pub(crate) fn listed_nodes(&self) -> Vec<JnodeRef> {
        self.dirty
            .iter()
            .flat_map(|l| l.values())
            .chain(self.clean.values())
            .chain(self.ovrwr.values())
            .chain(self.writeback.values())
            .cloned()
            .collect()
    }

    /// 各链表长度之和，加上 flush queue 中的节点
    pub(crate) fn counted_nodes(&self) -> usize {
        let listed = self.dirty_count() + self.clean.len() + self.ovrwr.len() + self.writeback.len();
        listed + self.flush_queues.iter().map(|fq| fq.len()).sum::<usize>()
    }

    /// 把另一个 atom 的链表并入（fusion 用）
    pub(crate) fn splice_lists(&mut self, small: &mut AtomInner) {
        for (into, from) in self.dirty.iter_mut().zip(small.dirty.iter_mut()) {
            into.append(from);
        }
        self.clean.append(&mut small.clean);
        self.ovrwr.append(&mut small.ovrwr);
        self.writeback.append(&mut small.writeback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jnode::{JnodeKind, JnodeTable};

    #[test]
    fn test_stage_order() {
        assert!(AtomStage::CaptureFuse < AtomStage::CaptureWait);
        assert!(AtomStage::PreCommit.is_committing());
        assert!(!AtomStage::CaptureWait.is_committing());
        assert!(AtomStage::Done < AtomStage::Invalid);
    }

    #[test]
    fn test_attach_and_relink() {
        let table = JnodeTable::new(512, 4);
        let atom = Atom::new(1);
        assert_eq!(atom.stage(), AtomStage::Free);
        let node = table.jget(JnodeKind::Formatted { level: 2 }, 50);
        let mut ai = atom.lock();
        {
            let mut jg = node.lock();
            jg.state.insert(JnodeState::DIRTY);
            ai.attach_jnode(&atom, &node, &mut jg);
            assert_eq!(jg.list, AtomList::Dirty(2));
        }
        assert_eq!(ai.capture_count, 1);
        assert_eq!(ai.stage, AtomStage::CaptureFuse);
        assert_eq!(ai.dirty[2].len(), 1);
        assert!(ai.has_dirty());

        let mut jg = node.lock();
        ai.relink(&node, &mut jg, AtomList::Overwrite);
        assert!(!ai.has_dirty());
        assert_eq!(ai.ovrwr.len(), 1);
        assert_eq!(ai.counted_nodes(), ai.capture_count);

        crate::jnode::detach_from_atom(&mut ai, &node, &mut jg);
        assert_eq!(ai.capture_count, 0);
        assert!(jg.atom.is_none());
        assert_eq!(ai.counted_nodes(), 0);
    }
}
