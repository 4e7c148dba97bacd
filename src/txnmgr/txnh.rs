//! 事务句柄
//!
//! 每个操作开始时创建一个句柄，结束时关闭。句柄在第一次 capture 时
//! 附着到某个 atom 上；关闭 atom 的最后一个句柄可能触发提交。

use super::atom::{AtomId, AtomRef};
use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// 句柄的融合模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    /// 读也会融合（读到其他 atom 的节点时加入或融合）
    ReadFusing,
    /// 只有写才融合
    WriteFusing,
}

bitflags! {
    /// 句柄标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TxnFlags: u8 {
        /// 关闭时等待 atom 提交完成
        const WAIT_COMMIT = 0x01;
        /// 关闭时不触发提交
        const DONT_COMMIT = 0x02;
    }
}

/// 句柄的可变部分
#[derive(Debug)]
pub struct TxnhInner {
    pub(crate) atom: Option<AtomRef>,
    pub(crate) flags: TxnFlags,
    /// 正阻塞在另一个 atom 上（计入所属 atom 的 `nr_waiters`）
    pub(crate) waiting: bool,
}

/// 事务句柄
#[derive(Debug)]
pub struct Txnh {
    id: u64,
    mode: TxnMode,
    pub(crate) inner: Mutex<TxnhInner>,
}

/// 共享的句柄引用
pub type TxnhRef = Arc<Txnh>;

impl Txnh {
    pub(crate) fn new(id: u64, mode: TxnMode, flags: TxnFlags) -> TxnhRef {
        Arc::new(Self {
            id,
            mode,
            inner: Mutex::new(TxnhInner {
                atom: None,
                flags,
                waiting: false,
            }),
        })
    }

    /// 句柄 id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 融合模式
    pub fn mode(&self) -> TxnMode {
        self.mode
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TxnhInner> {
        self.inner.lock()
    }

    /// 所属 atom
    pub fn atom(&self) -> Option<AtomRef> {
        self.inner.lock().atom.clone()
    }

    /// 所属 atom 的 id
    pub fn atom_id(&self) -> Option<AtomId> {
        self.inner.lock().atom.as_ref().map(|a| a.id())
    }

    /// 标志
    pub fn flags(&self) -> TxnFlags {
        self.inner.lock().flags
    }

    /// 设置标志
    pub fn set_flags(&self, flags: TxnFlags) {
        self.inner.lock().flags.insert(flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_handle_is_free() {
        let h = Txnh::new(3, TxnMode::WriteFusing, TxnFlags::empty());
        assert_eq!(h.id(), 3);
        assert!(h.atom().is_none());
        h.set_flags(TxnFlags::WAIT_COMMIT);
        assert!(h.flags().contains(TxnFlags::WAIT_COMMIT));
    }
}
