//! Capture 协议
//!
//! 给定节点和调用者的事务句柄，归结为六种情况之一：
//!
//! | 节点 atom | 句柄 atom | 结果 |
//! |-----------|-----------|------|
//! | A         | A         | (a) 已在同一 atom |
//! | A         | 无        | (b) 句柄加入 A |
//! | 无        | A         | (c) 节点加入 A |
//! | A         | B         | (d) fusion：引用少的并入引用多的 |
//! | 无        | 无        | (e) 新建 atom |
//! | 无（读）  | 任意      | (f) 纯读不捕获 |
//!
//! 不能不阻塞地继续时，线程在相应 atom 上等待，然后返回 `Repeat`，
//! 由外层循环从头再来。

use super::{
    atom::{AtomFlags, AtomInner, AtomRef, AtomStage},
    lock::{lock_valid, lock_with_atom, resolve, same_atom},
    txnh::{TxnMode, TxnhRef},
    TxnMgr,
};
use crate::{
    error::{retry, Error, ErrorKind, Result},
    jnode::{JnodeRef, JnodeState},
};
use bitflags::bitflags;
use parking_lot::MutexGuard;
use std::sync::Arc;

/// 请求的锁模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// 读
    Read,
    /// 写
    Write,
}

bitflags! {
    /// capture 选项
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CaptureFlags: u8 {
        /// 需要等待时返回 `WouldBlock` 而不是阻塞
        const NONBLOCKING = 0x01;
    }
}

/// capture 决定的动作
enum Action {
    /// 什么都不做
    Done,
    /// 在第 i 个 atom 上等待
    Wait(usize),
    /// 句柄加入节点的 atom
    AssignTxnh,
    /// 节点加入句柄的 atom
    AssignNode,
    /// 两个 atom 融合
    Fuse,
    /// 新建 atom
    Create,
    /// 读锁跳过 capture
    Missed,
}

impl TxnMgr {
    /// 捕获节点
    ///
    /// 内部的重试不会返回给调用者
    ///
    /// # 错误
    ///
    /// - `WouldBlock` - 指定了 `NONBLOCKING` 且需要等待
    /// - `Io` - 节点或句柄所属的 atom 提交失败
    pub fn try_capture(
        &self,
        txnh: &TxnhRef,
        node: &JnodeRef,
        mode: LockMode,
        flags: CaptureFlags,
    ) -> Result<()> {
        retry(|| self.capture_once(txnh, node, mode, flags))
    }

    /// 一次 capture 尝试，可能返回 `Repeat`
    pub(crate) fn capture_once(
        &self,
        txnh: &TxnhRef,
        node: &JnodeRef,
        mode: LockMode,
        flags: CaptureFlags,
    ) -> Result<()> {
        let na = node.atom();
        let ta = txnh.atom();

        // 按 id 顺序锁住涉及的 atom
        let mut atoms: Vec<AtomRef> = na.iter().chain(ta.iter()).cloned().collect();
        atoms.sort_by_key(|a| a.id());
        atoms.dedup_by(|a, b| Arc::ptr_eq(a, b));
        let mut guards: Vec<MutexGuard<'_, AtomInner>> = atoms.iter().map(|a| a.lock()).collect();
        if guards.iter().any(|g| g.stage == AtomStage::Invalid) {
            return Err(Error::repeat());
        }

        let mut jg = node.lock();
        let mut tg = txnh.lock();
        if !opt_eq(jg.atom.as_ref(), na.as_ref()) || !opt_eq(tg.atom.as_ref(), ta.as_ref()) {
            return Err(Error::repeat());
        }
        let index_of = |a: &Option<AtomRef>| {
            a.as_ref()
                .and_then(|a| atoms.iter().position(|x| Arc::ptr_eq(x, a)))
        };
        let ni = index_of(&na);
        let ti = index_of(&ta);

        let action = decide(&guards, txnh.mode(), node, ni, ti, mode)?;
        match action {
            Action::Done => Ok(()),
            Action::Missed => {
                jg.state.insert(JnodeState::MISSED);
                Ok(())
            }
            Action::Wait(target) => {
                if flags.contains(CaptureFlags::NONBLOCKING) {
                    return Err(Error::new(ErrorKind::WouldBlock, "Capture would block"));
                }
                let own = ti.filter(|&t| t != target);
                if let Some(t) = own {
                    tg.waiting = true;
                    guards[t].nr_waiters += 1;
                    atoms[t].wake_all();
                }
                drop(tg);
                drop(jg);
                let mut g = guards.swap_remove(target);
                drop(guards);
                log::trace!(
                    "[TXN] txnh {} waits on atom {} ({:?})",
                    txnh.id(),
                    atoms[target].id(),
                    g.stage
                );
                atoms[target].cond.wait(&mut g);
                drop(g);
                if own.is_some() {
                    self.clear_waiting(txnh);
                }
                Err(Error::repeat())
            }
            Action::AssignTxnh => {
                let n = ni.ok_or(Error::repeat())?;
                tg.atom = Some(atoms[n].clone());
                guards[n].attach_txnh(txnh.clone());
                log::trace!("[TXN] txnh {} joins atom {}", txnh.id(), atoms[n].id());
                Ok(())
            }
            Action::AssignNode => {
                let t = ti.ok_or(Error::repeat())?;
                guards[t].attach_jnode(&atoms[t], node, &mut jg);
                Ok(())
            }
            Action::Create => {
                drop(tg);
                drop(jg);
                drop(guards);
                let atom = self.new_atom();
                let mut ai = atom.lock();
                let mut jg = node.lock();
                let mut tg = txnh.lock();
                // 锁释放期间节点或句柄可能已被捕获
                if jg.atom.is_some() || tg.atom.is_some() {
                    drop(tg);
                    drop(jg);
                    ai.set_stage(AtomStage::Done);
                    drop(ai);
                    self.unregister_atom(atom.id());
                    return Err(Error::repeat());
                }
                ai.attach_jnode(&atom, node, &mut jg);
                tg.atom = Some(atom.clone());
                ai.attach_txnh(txnh.clone());
                Ok(())
            }
            Action::Fuse => {
                drop(tg);
                drop(jg);
                let (Some(n), Some(t)) = (ni, ti) else {
                    return Err(Error::repeat());
                };
                let refs = |g: &AtomInner| g.txnh_count() + g.capture_count;
                let (rn, rt) = (refs(&*guards[n]), refs(&*guards[t]));
                // 引用少的并入引用多的；相等时新的并入旧的
                let (large, small) = if rn > rt || (rn == rt && atoms[n].id() < atoms[t].id()) {
                    (n, t)
                } else {
                    (t, n)
                };
                let (lg, sg) = pair_mut(&mut guards, large, small);
                self.fuse(&atoms[large], lg, &atoms[small], sg);
                // 再来一次，这次落在情况 (a)
                Err(Error::repeat())
            }
        }
    }

    /// 清除句柄的等待标记，递减其当前 atom 的等待计数
    fn clear_waiting(&self, txnh: &TxnhRef) {
        let res = retry(|| {
            let mut keep = None;
            let locked = lock_with_atom(&**txnh, &mut keep)?;
            let mut tg = locked.inner;
            if tg.waiting {
                tg.waiting = false;
                if let Some(mut ai) = locked.atom {
                    ai.nr_waiters = ai.nr_waiters.saturating_sub(1);
                }
            }
            Ok(())
        });
        debug_assert!(res.is_ok());
    }

    /// 把 `small` 并入 `large`（两个 atom 都已加锁）
    pub(crate) fn fuse(
        &self,
        large_ref: &AtomRef,
        large: &mut AtomInner,
        small_ref: &AtomRef,
        small: &mut AtomInner,
    ) {
        debug_assert!(!large.stage.is_committing() && !small.stage.is_committing());
        log::debug!(
            "[TXN] fuse atom {} ({} handles, {} nodes) into atom {} ({} handles, {} nodes)",
            small_ref.id(),
            small.txnh_count(),
            small.capture_count,
            large_ref.id(),
            large.txnh_count(),
            large.capture_count
        );

        for node in small.listed_nodes() {
            node.lock().atom = Some(large_ref.clone());
        }
        for fq in core::mem::take(&mut small.flush_queues) {
            fq.set_atom(large_ref);
            for node in fq.prepped_nodes() {
                node.lock().atom = Some(large_ref.clone());
            }
            large.flush_queues.push(fq);
        }
        for txnh in core::mem::take(&mut small.txnhs) {
            txnh.lock().atom = Some(large_ref.clone());
            large.txnhs.push(txnh);
        }

        large.splice_lists(small);
        large.capture_count += core::mem::take(&mut small.capture_count);
        large.delete_set.merge_from(&mut small.delete_set);
        large.wandered_map.merge_from(&mut small.wandered_map);
        large.nr_waiters += core::mem::take(&mut small.nr_waiters);
        large.nr_flushers += core::mem::take(&mut small.nr_flushers);
        large.nr_running_queues += core::mem::take(&mut small.nr_running_queues);
        large.log_reserved += core::mem::take(&mut small.log_reserved);
        large.flags |= small.flags & AtomFlags::FORCE_COMMIT;
        if large.committer.is_none() {
            large.committer = small.committer.take();
        }
        if small.start < large.start {
            large.start = small.start;
        }
        let stage = large.stage.max(small.stage);
        large.set_stage(stage);
        small.set_stage(AtomStage::Invalid);
        small.fused_into = Some(large_ref.clone());
        debug_assert_eq!(large.counted_nodes(), large.capture_count);

        self.unregister_atom(small_ref.id());
        small_ref.wake_all();
        large_ref.wake_all();
    }

    /// 把节点捕获进 `atom` 并标脏
    ///
    /// flush 重定位子节点后，父节点中的指针变了，父节点必须随同一个 atom 提交。
    /// 节点属于另一个 atom 时两者融合；对方已在提交时等它完成。
    pub(crate) fn capture_into(&self, atom: &AtomRef, node: &JnodeRef) -> Result<()> {
        retry(|| {
            let mine = resolve(atom);
            if let Some(theirs) = node.atom() {
                if !Arc::ptr_eq(&theirs, &mine) {
                    return self.fuse_for_flush(&mine, &theirs, node);
                }
            }
            let mut ai = lock_valid(&mine)?;
            let mut jg = node.lock();
            match jg.atom.as_ref() {
                None => ai.attach_jnode(&mine, node, &mut jg),
                Some(a) if Arc::ptr_eq(a, &mine) => {}
                Some(_) => return Err(Error::repeat()),
            }
            self.mark_dirty_reserving(&mut ai, node, &mut jg);
            Ok(())
        })
    }

    /// `capture_into` 的融合分支，总是以 `Repeat` 结束
    fn fuse_for_flush(&self, mine: &AtomRef, theirs: &AtomRef, node: &JnodeRef) -> Result<()> {
        let (mut gm, mut gt) = if mine.id() < theirs.id() {
            let a = mine.lock();
            (a, theirs.lock())
        } else {
            let b = theirs.lock();
            (mine.lock(), b)
        };
        if gm.stage == AtomStage::Invalid || gt.stage == AtomStage::Invalid || !node.in_atom(theirs) {
            return Err(Error::repeat());
        }
        if gt.stage.is_committing() {
            drop(gm);
            log::trace!("[TXN] flush of atom {} waits for atom {}", mine.id(), theirs.id());
            theirs.cond.wait(&mut gt);
            return Err(Error::repeat());
        }
        if gm.stage.is_committing() {
            return Err(Error::new(ErrorKind::InvalidState, "Flushed atom is already committing"));
        }
        let rm = gm.txnh_count() + gm.capture_count;
        let rt = gt.txnh_count() + gt.capture_count;
        if rm >= rt {
            self.fuse(mine, &mut gm, theirs, &mut gt);
        } else {
            self.fuse(theirs, &mut gt, mine, &mut gm);
        }
        Err(Error::repeat())
    }

    /// 死锁规避：阻塞在节点锁上之前，先与锁持有者的 atom 融合
    ///
    /// 读锁时跳过 capture 的节点（`MISSED`）之后需要真正 capture 时，
    /// 持有节点锁的线程可能属于一个即将阻塞在本 atom 上的 atom。
    /// 先融合可以打破这种循环等待。
    pub fn fuse_with_lock_owners(&self, txnh: &TxnhRef, owners: &[TxnhRef]) -> Result<usize> {
        let mut fused = 0;
        for owner in owners {
            if Arc::ptr_eq(owner, txnh) {
                continue;
            }
            let done = retry(|| {
                let (Some(mine), Some(theirs)) = (txnh.atom(), owner.atom()) else {
                    return Ok(false);
                };
                if Arc::ptr_eq(&mine, &theirs) {
                    return Ok(false);
                }
                let (first, second) = if mine.id() < theirs.id() {
                    (&mine, &theirs)
                } else {
                    (&theirs, &mine)
                };
                let mut g1 = first.lock();
                let mut g2 = second.lock();
                if g1.stage == AtomStage::Invalid || g2.stage == AtomStage::Invalid {
                    return Err(Error::repeat());
                }
                if !same_atom(txnh.atom().as_ref(), Some(&mine))
                    || !same_atom(owner.atom().as_ref(), Some(&theirs))
                {
                    return Err(Error::repeat());
                }
                // 正在提交的 atom 不会阻塞在我们身上
                if g1.stage.is_committing() || g2.stage.is_committing() {
                    return Ok(false);
                }
                let r1 = g1.txnh_count() + g1.capture_count;
                let r2 = g2.txnh_count() + g2.capture_count;
                if r1 >= r2 {
                    self.fuse(first, &mut g1, second, &mut g2);
                } else {
                    self.fuse(second, &mut g2, first, &mut g1);
                }
                Ok(true)
            })?;
            fused += usize::from(done);
        }
        Ok(fused)
    }
}

/// 根据当前状态决定动作（所有相关锁已持有）
fn decide(
    guards: &[MutexGuard<'_, AtomInner>],
    txn_mode: TxnMode,
    node: &JnodeRef,
    ni: Option<usize>,
    ti: Option<usize>,
    mode: LockMode,
) -> Result<Action> {
    // 句柄所属 atom 已失败或正在提交
    if let Some(t) = ti {
        let g = &guards[t];
        if g.flags.contains(AtomFlags::FAILED) {
            return Err(Error::new(ErrorKind::Io, "Transaction failed to commit"));
        }
        if g.stage.is_committing() {
            return Ok(Action::Wait(t));
        }
    }

    if mode == LockMode::Read {
        let Some(n) = ni else {
            return Ok(Action::Done);
        };
        if txn_mode == TxnMode::WriteFusing {
            // 写操作读锁非叶子节点：不捕获，标记为 missed
            if !node.kind().is_leaf() {
                return Ok(Action::Missed);
            }
            return Ok(Action::Done);
        }
        // 读不需要等提交
        if guards[n].stage.is_committing() {
            return Ok(Action::Done);
        }
    }

    if let Some(n) = ni {
        let g = &guards[n];
        if g.stage.is_committing() {
            if g.flags.contains(AtomFlags::FAILED) {
                return Err(Error::new(ErrorKind::Io, "Node belongs to a failed transaction"));
            }
            return Ok(Action::Wait(n));
        }
    }

    Ok(match (ni, ti) {
        (Some(n), Some(t)) if n == t => Action::Done,
        (Some(n), None) => {
            if guards[n].stage == AtomStage::CaptureWait {
                Action::Wait(n)
            } else {
                Action::AssignTxnh
            }
        }
        (None, Some(_)) => Action::AssignNode,
        (Some(_), Some(_)) => Action::Fuse,
        (None, None) => Action::Create,
    })
}

fn opt_eq(a: Option<&AtomRef>, b: Option<&AtomRef>) -> bool {
    match (a, b) {
        (None, None) => true,
        _ => same_atom(a, b),
    }
}

/// 同时可变借用切片中的两个不同元素
fn pair_mut<'s, 'g>(
    guards: &'s mut [MutexGuard<'g, AtomInner>],
    a: usize,
    b: usize,
) -> (&'s mut AtomInner, &'s mut AtomInner) {
    debug_assert_ne!(a, b);
    if a < b {
        let (lo, hi) = guards.split_at_mut(b);
        (&mut *lo[a], &mut *hi[0])
    } else {
        let (lo, hi) = guards.split_at_mut(a);
        (&mut *hi[0], &mut *lo[b])
    }
}
