//! 锁顺序助手
//!
//! atom 锁在外，jnode / txnh 锁在内。但要知道锁哪个 atom，必须先读 jnode
//! 或 txnh 中的 atom 指针。做法：
//!
//! 1. 锁住 jnode（txnh），读出 atom 指针
//! 2. `try_lock` atom，成功则两把锁都已持有
//! 3. 失败则克隆 atom 的 `Arc` 保活，释放内层锁，阻塞获取 atom 锁，
//!    再重新锁内层并确认 atom 指针没变；变了就返回 `Repeat`
//!
//! 调用者提供一个 `Option<AtomRef>` 槽位存放保活引用，返回的守卫借用它。

use super::{
    atom::{AtomInner, AtomRef},
    txnh::{Txnh, TxnhInner},
};
use crate::{
    error::{Error, Result},
    jnode::{Jnode, JnodeInner},
};
use parking_lot::MutexGuard;
use std::sync::Arc;

/// 持有 atom 指针的对象（jnode、txnh）
pub(crate) trait AtomHolder {
    type Inner;

    fn lock_inner(&self) -> MutexGuard<'_, Self::Inner>;

    fn atom_of(inner: &Self::Inner) -> Option<&AtomRef>;
}

impl AtomHolder for Jnode {
    type Inner = JnodeInner;

    fn lock_inner(&self) -> MutexGuard<'_, JnodeInner> {
        self.lock()
    }

    fn atom_of(inner: &JnodeInner) -> Option<&AtomRef> {
        inner.atom.as_ref()
    }
}

impl AtomHolder for Txnh {
    type Inner = TxnhInner;

    fn lock_inner(&self) -> MutexGuard<'_, TxnhInner> {
        self.lock()
    }

    fn atom_of(inner: &TxnhInner) -> Option<&AtomRef> {
        inner.atom.as_ref()
    }
}

/// 同时持有的 atom 锁和内层锁
pub(crate) struct Locked<'a, H: AtomHolder> {
    /// atom 锁；对象未被捕获时为 `None`
    pub(crate) atom: Option<MutexGuard<'a, AtomInner>>,
    /// 内层锁
    pub(crate) inner: MutexGuard<'a, H::Inner>,
}

/// 按锁顺序锁住对象所属的 atom 和对象本身
///
/// 对象未被捕获时只返回内层锁；持有内层锁期间它不会被捕获。
pub(crate) fn lock_with_atom<'a, H: AtomHolder>(
    holder: &'a H,
    keep: &'a mut Option<AtomRef>,
) -> Result<Locked<'a, H>> {
    let inner = holder.lock_inner();
    let Some(atom) = H::atom_of(&inner).cloned() else {
        return Ok(Locked { atom: None, inner });
    };
    let atom: &'a AtomRef = keep.insert(atom);
    // try_lock 不会阻塞，可以在持有内层锁时尝试
    if let Some(ag) = atom.inner.try_lock() {
        return Ok(Locked { atom: Some(ag), inner });
    }
    drop(inner);
    let ag = atom.inner.lock();
    let inner = holder.lock_inner();
    if !H::atom_of(&inner).map_or(false, |a| Arc::ptr_eq(a, atom)) {
        log::trace!("[TXN] atom {} changed under us", atom.id());
        return Err(Error::repeat());
    }
    Ok(Locked { atom: Some(ag), inner })
}

/// 锁住 atom 本身并确认它仍然有效（未被融合）
///
/// 被融合的 atom 返回 `Repeat`
pub(crate) fn lock_valid(atom: &AtomRef) -> Result<MutexGuard<'_, AtomInner>> {
    let ag = atom.inner.lock();
    if ag.stage == super::AtomStage::Invalid {
        return Err(Error::repeat());
    }
    Ok(ag)
}

/// 沿融合链找到当前仍然有效的 atom
pub(crate) fn resolve(atom: &AtomRef) -> AtomRef {
    let mut cur = atom.clone();
    loop {
        let next = {
            let ag = cur.inner.lock();
            if ag.stage == super::AtomStage::Invalid {
                ag.fused_into.clone()
            } else {
                None
            }
        };
        match next {
            Some(n) => cur = n,
            None => return cur,
        }
    }
}

/// 两个 atom 是否为同一个
pub(crate) fn same_atom(a: Option<&AtomRef>, b: Option<&AtomRef>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        jnode::{JnodeKind, JnodeTable},
        txnmgr::{atom::Atom, txnh::TxnMode, TxnFlags},
    };

    #[test]
    fn test_lock_uncaptured() {
        let table = JnodeTable::new(512, 4);
        let node = table.jget(JnodeKind::Formatted { level: 1 }, 9);
        let mut keep = None;
        let locked = lock_with_atom(&*node, &mut keep).unwrap();
        assert!(locked.atom.is_none());
    }

    #[test]
    fn test_lock_captured_txnh() {
        let atom = Atom::new(7);
        let h = Txnh::new(1, TxnMode::WriteFusing, TxnFlags::empty());
        h.lock().atom = Some(atom.clone());
        let mut keep = None;
        let locked = lock_with_atom(&*h, &mut keep).unwrap();
        assert!(locked.atom.is_some());
        assert!(locked.inner.atom.is_some());
    }

    #[test]
    fn test_lock_valid_rejects_fused_atom() {
        let atom = Atom::new(8);
        assert!(lock_valid(&atom).is_ok());
        atom.lock().stage = crate::txnmgr::AtomStage::Invalid;
        assert!(lock_valid(&atom).unwrap_err().is_repeat());
    }

    #[test]
    fn test_resolve_follows_fusion() {
        let small = Atom::new(3);
        let large = Atom::new(4);
        assert!(Arc::ptr_eq(&resolve(&small), &small));
        {
            let mut g = small.lock();
            g.stage = crate::txnmgr::AtomStage::Invalid;
            g.fused_into = Some(large.clone());
        }
        assert!(Arc::ptr_eq(&resolve(&small), &large));
    }

    #[test]
    fn test_same_atom() {
        let a = Atom::new(1);
        let b = Atom::new(2);
        assert!(same_atom(Some(&a), Some(&a.clone())));
        assert!(!same_atom(Some(&a), Some(&b)));
        assert!(!same_atom(None, Some(&a)));
    }
}
