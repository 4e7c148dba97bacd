//! jnode：内存中的磁盘块句柄
//!
//! 每个被修改或正在使用的块（格式化树节点、数据块、位图块、日志块）
//! 都由一个 jnode 表示。jnode 以 `Arc` 共享，内部状态由一把短锁保护。
//!
//! # 锁顺序
//!
//! atom 锁 > jnode 锁 > txnh 锁 > flush queue 锁。需要在持有 jnode 锁时
//! 获取 atom 锁的地方，使用 [`crate::txnmgr::lock`] 中的 try-lock-or-backoff 助手。
//!
//! # 计数
//!
//! - `x_count`：外部引用（`acquire` / `release`），降为 0 时节点可以进入空闲缓存
//! - `d_count`：数据 pin 计数，非 0 时数据不能被丢弃

mod kind;
mod state;
mod table;

pub use kind::{JnodeKind, JnodeOps, Mapping};
pub use state::JnodeState;
pub use table::{JnodeKey, JnodeTable};

use crate::{
    consts::FAKE_BLOCKNR_BIT,
    txnmgr::{AtomInner, AtomList, AtomRef},
};
use parking_lot::{Mutex, MutexGuard};
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

/// jnode 唯一标识（进程内单调递增，从不复用）
pub type JnodeId = u64;

/// 共享的 jnode 引用
pub type JnodeRef = Arc<Jnode>;

/// 块号是否为假块号
pub fn blocknr_is_fake(blocknr: u64) -> bool {
    blocknr & FAKE_BLOCKNR_BIT != 0
}

/// jnode 的可变部分
#[derive(Debug)]
pub struct JnodeInner {
    /// 所属 atom
    pub(crate) atom: Option<AtomRef>,
    /// 当前块号（可能是假块号）
    pub(crate) blocknr: u64,
    /// 状态位
    pub(crate) state: JnodeState,
    /// 块数据
    pub(crate) data: Vec<u8>,
    /// 在 atom 的哪个链表上
    pub(crate) list: AtomList,
}

/// jnode
#[derive(Debug)]
pub struct Jnode {
    id: JnodeId,
    kind: JnodeKind,
    pub(crate) inner: Mutex<JnodeInner>,
    x_count: AtomicU32,
    d_count: AtomicU32,
}

impl Jnode {
    pub(crate) fn new(id: JnodeId, kind: JnodeKind, blocknr: u64, state: JnodeState) -> Self {
        Self {
            id,
            kind,
            inner: Mutex::new(JnodeInner {
                atom: None,
                blocknr,
                state,
                data: Vec::new(),
                list: AtomList::None,
            }),
            x_count: AtomicU32::new(0),
            d_count: AtomicU32::new(0),
        }
    }

    /// 唯一标识
    pub fn id(&self) -> JnodeId {
        self.id
    }

    /// 类型
    pub fn kind(&self) -> JnodeKind {
        self.kind
    }

    /// 树层级
    pub fn level(&self) -> u8 {
        self.kind.level()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, JnodeInner> {
        self.inner.lock()
    }

    /// 当前块号
    pub fn blocknr(&self) -> u64 {
        self.inner.lock().blocknr
    }

    /// 状态快照
    pub fn state(&self) -> JnodeState {
        self.inner.lock().state
    }

    /// 是否脏
    pub fn is_dirty(&self) -> bool {
        self.state().contains(JnodeState::DIRTY)
    }

    /// 是否已经做过 relocate / overwrite 决定
    pub fn is_flush_prepped(&self) -> bool {
        self.state().is_flush_prepped()
    }

    /// 所属 atom
    pub fn atom(&self) -> Option<AtomRef> {
        self.inner.lock().atom.clone()
    }

    /// 所属 atom 的 id
    pub fn atom_id(&self) -> Option<u64> {
        self.inner.lock().atom.as_ref().map(|a| a.id())
    }

    /// 是否与 `atom` 属于同一个 atom
    pub fn in_atom(&self, atom: &AtomRef) -> bool {
        self.inner
            .lock()
            .atom
            .as_ref()
            .map_or(false, |a| Arc::ptr_eq(a, atom))
    }

    /// 数据拷贝
    pub fn data(&self) -> Vec<u8> {
        self.inner.lock().data.clone()
    }

    /// 替换数据
    ///
    /// 只修改内存内容，不标脏；修改事务数据应通过 `TxnMgr::dirty`
    pub fn set_data(&self, data: Vec<u8>) {
        let mut inner = self.inner.lock();
        inner.data = data;
        inner.state.insert(JnodeState::LOADED);
    }

    /// 在锁内修改数据
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        let mut inner = self.inner.lock();
        f(&mut inner.data)
    }

    /// 增加外部引用
    pub fn acquire(&self) {
        self.x_count.fetch_add(1, Ordering::AcqRel);
    }

    /// 减少外部引用，返回剩余引用数
    pub(crate) fn put_ref(&self) -> u32 {
        let prev = self.x_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "jnode {} released too often", self.id);
        prev.saturating_sub(1)
    }

    /// 外部引用数
    pub fn x_count(&self) -> u32 {
        self.x_count.load(Ordering::Acquire)
    }

    /// pin 数据
    pub fn pin(&self) {
        self.d_count.fetch_add(1, Ordering::AcqRel);
    }

    /// 取消 pin
    pub fn unpin(&self) {
        let prev = self.d_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    /// 数据 pin 数
    pub fn d_count(&self) -> u32 {
        self.d_count.load(Ordering::Acquire)
    }

    /// 节点是否空闲：无外部引用、无 pin、未被捕获、干净
    pub fn is_idle(&self) -> bool {
        if self.x_count() != 0 || self.d_count() != 0 {
            return false;
        }
        let inner = self.inner.lock();
        inner.atom.is_none() && !inner.state.contains(JnodeState::DIRTY)
    }
}

/// 标脏（调用者持有 atom 锁和 jnode 锁，节点已被该 atom 捕获）
///
/// 幂等。第一次变脏时把节点挂到 atom 对应层级的脏链表上。
///
/// # 返回
///
/// 需要为节点预留一个日志块时返回 `true`（叶子层、非新建、尚未决定位置）
pub(crate) fn mark_dirty_locked(ai: &mut AtomInner, node: &JnodeRef, jg: &mut JnodeInner) -> bool {
    debug_assert!(jg.atom.is_some());
    if jg.state.contains(JnodeState::DIRTY) {
        return false;
    }
    jg.state.insert(JnodeState::DIRTY);

    // 在 flush queue 或写 I/O 中的节点由 flush queue 负责重新挂链表；
    // overwrite 节点一直留在 overwrite 链表上
    if !jg.state.intersects(JnodeState::FLUSH_QUEUED | JnodeState::WRITEBACK | JnodeState::OVWR) {
        ai.relink(node, jg, AtomList::Dirty(node.level()));
    }

    let reserve = node.kind().is_leaf()
        && !jg.state.intersects(JnodeState::CREATED | JnodeState::LOG_RESERVED)
        && !jg.state.is_decided();
    if reserve {
        jg.state.insert(JnodeState::LOG_RESERVED);
    }
    reserve
}

/// 把节点从 atom 中摘下
///
/// 清除所有事务状态位，从链表中移除，atom 指针置空。
/// 提交成功后的 uncapture 和删除都走这里。
pub(crate) fn detach_from_atom(ai: &mut AtomInner, node: &JnodeRef, jg: &mut JnodeInner) {
    ai.relink(node, jg, AtomList::None);
    jg.state.remove(JnodeState::TXN_BITS | JnodeState::DIRTY);
    if jg.atom.take().is_some() {
        ai.capture_count -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_blocknr() {
        assert!(blocknr_is_fake(FAKE_BLOCKNR_BIT | 5));
        assert!(!blocknr_is_fake(5));
    }

    #[test]
    fn test_counts_and_idle() {
        let node = Jnode::new(1, JnodeKind::Formatted { level: 1 }, 10, JnodeState::empty());
        assert!(node.is_idle());
        node.acquire();
        assert!(!node.is_idle());
        assert_eq!(node.put_ref(), 0);
        node.pin();
        assert!(!node.is_idle());
        node.unpin();
        node.inner.lock().state.insert(JnodeState::DIRTY);
        assert!(!node.is_idle());
    }

    #[test]
    fn test_data_access() {
        let node = Jnode::new(2, JnodeKind::LogHead, 1, JnodeState::empty());
        node.set_data(vec![1, 2, 3]);
        assert!(node.state().contains(JnodeState::LOADED));
        node.with_data_mut(|d| d[0] = 9);
        assert_eq!(node.data(), vec![9, 2, 3]);
    }
}
