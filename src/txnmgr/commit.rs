//! 提交
//!
//! # 流程
//!
//! 1. 关闭句柄时判断 atom 是否应该提交（强制、太老、太大）
//! 2. 提交者把 atom 推进到 `CaptureWait`，等其他非等待句柄都关闭
//! 3. 反复 flush 直到没有脏节点和写 I/O，进入 `PreCommit`
//! 4. 持有 journal 锁：提交前钩子（commit bitmap、位图块、super 节点），
//!    写 wandering log，翻转 journal header
//! 5. `PostCommit`：原地写回，更新 footer
//! 6. `Done`：释放 delete set，摘下所有节点和句柄，唤醒等待者
//!
//! 第 4 步在 header 写之前失败时回滚钩子，atom 标记 `FAILED`，数据保持脏，
//! 下次提交重试；越过提交点之后的失败会中止整个文件系统，需要重新挂载 replay。

use super::{
    atom::{AtomFlags, AtomInner, AtomRef, AtomStage},
    lock::{lock_with_atom, resolve},
    txnh::{TxnFlags, TxnMode, TxnhRef},
    TxnMgr,
};
use crate::{
    balloc::BlockRange,
    blocknr_set::BlocknrItem,
    consts::FIRST_BITMAP_BLOCK,
    error::{retry, Error, ErrorKind, Result},
    flush::{self, FlushReport},
    jnode::{self, JnodeKind, JnodeRef, JnodeState},
    wander::{release_log_blocks, write_logs, write_tx_back, CommitHandle, CommitStats, OverwriteEntry},
};
use parking_lot::MutexGuard;
use std::sync::{atomic::Ordering, Arc};

fn aborted_error() -> Error {
    Error::new(ErrorKind::Io, "File system aborted after a failed write-back")
}

fn failed_error() -> Error {
    Error::new(ErrorKind::Io, "Transaction failed to commit")
}

/// 提交前钩子做过的修改，失败时据此回滚
#[derive(Default)]
struct HookUndo {
    relocated: Vec<u64>,
    deleted: Vec<u64>,
    /// 钩子捕获进 atom 的位图 / super 节点
    captured: Vec<JnodeRef>,
    bitmaps: Vec<u64>,
}

/// atom 能否由新的提交者接手：还没进入提交，或上次日志写失败
fn can_commit(ai: &AtomInner) -> bool {
    ai.stage < AtomStage::PreCommit
        || (ai.stage == AtomStage::PreCommit && ai.flags.contains(AtomFlags::FAILED))
}

/// 把句柄从 atom 摘下（调用者持有 atom 锁）
fn detach_txnh_locked(ai: &mut AtomInner, txnh: &TxnhRef) {
    ai.detach_txnh(txnh);
    let mut tg = txnh.lock();
    tg.atom = None;
    if tg.waiting {
        tg.waiting = false;
        ai.nr_waiters = ai.nr_waiters.saturating_sub(1);
    }
}

impl TxnMgr {
    /// 关闭事务句柄
    ///
    /// 句柄的 atom 应该提交时由本线程提交（或等待正在提交的线程）
    pub(crate) fn close_txnh(&self, txnh: &TxnhRef) -> Result<()> {
        retry(|| self.close_once(txnh))
    }

    fn should_commit(&self, ai: &AtomInner, flags: TxnFlags) -> bool {
        if flags.contains(TxnFlags::DONT_COMMIT) {
            return false;
        }
        flags.contains(TxnFlags::WAIT_COMMIT)
            || ai.flags.contains(AtomFlags::FORCE_COMMIT)
            || ai.age() > self.config.atom_max_age
            || ai.capture_count > self.config.atom_max_size
    }

    fn close_once(&self, txnh: &TxnhRef) -> Result<()> {
        let mut keep = None;
        let locked = lock_with_atom(&**txnh, &mut keep)?;
        let (Some(mut ai), tg) = (locked.atom, locked.inner) else {
            return Ok(());
        };
        let Some(atom) = tg.atom.clone() else {
            return Err(Error::repeat());
        };
        let flags = tg.flags;
        drop(tg);
        if ai.stage == AtomStage::Invalid {
            return Err(Error::repeat());
        }

        let should = self.should_commit(&ai, flags);
        let mine = ai.committer.map_or(true, |c| c == txnh.id());
        if should && mine && can_commit(&ai) {
            ai.committer = Some(txnh.id());
            if ai.stage < AtomStage::CaptureWait {
                ai.set_stage(AtomStage::CaptureWait);
                log::debug!("[TXN] atom {} enters CaptureWait", atom.id());
            }
            if flags.contains(TxnFlags::WAIT_COMMIT) {
                ai.flags.insert(AtomFlags::FORCE_COMMIT);
            }
            drop(ai);
            return self.commit_atom(txnh, &atom);
        }

        detach_txnh_locked(&mut ai, txnh);
        drop(ai);
        atom.wake_all();
        if should && flags.contains(TxnFlags::WAIT_COMMIT) {
            return self.wait_finished(&atom);
        }
        log::trace!("[TXN] txnh {} closed", txnh.id());
        Ok(())
    }

    /// 等待 atom（或融合后的 atom）提交结束
    ///
    /// # 错误
    ///
    /// - `Io` - 提交失败且没有人继续提交
    pub(crate) fn wait_finished(&self, atom: &AtomRef) -> Result<()> {
        let mut cur = atom.clone();
        loop {
            let next = {
                let mut ai = cur.lock();
                loop {
                    if ai.stage == AtomStage::Invalid {
                        break ai.fused_into.clone();
                    }
                    if ai.stage >= AtomStage::Done {
                        return Ok(());
                    }
                    if ai.flags.contains(AtomFlags::FAILED) && ai.committer.is_none() {
                        return Err(failed_error());
                    }
                    cur.cond.wait(&mut ai);
                }
            };
            match next {
                Some(n) => cur = n,
                None => return Ok(()),
            }
        }
    }

    /// flusher 退出：沿融合链递减 `nr_flushers`
    fn flusher_done(&self, atom: &AtomRef) {
        let mut cur = atom.clone();
        loop {
            let next = {
                let mut ai = cur.lock();
                if ai.stage == AtomStage::Invalid {
                    ai.fused_into.clone()
                } else {
                    ai.nr_flushers = ai.nr_flushers.saturating_sub(1);
                    None
                }
            };
            match next {
                Some(n) => cur = n,
                None => {
                    cur.wake_all();
                    return;
                }
            }
        }
    }

    /// 以 flusher 身份对 atom 做一次 flush
    fn run_flusher(&self, atom: &AtomRef) -> Result<FlushReport> {
        let res = flush::flush_atom(self, atom);
        self.flusher_done(atom);
        res
    }

    /// 放弃提交：清除提交者，摘下句柄
    fn abandon_commit(&self, txnh: &TxnhRef, atom: &AtomRef, ai: &mut AtomInner, fail: bool) {
        if fail {
            ai.flags.insert(AtomFlags::FAILED);
        }
        if ai.committer == Some(txnh.id()) {
            ai.committer = None;
        }
        detach_txnh_locked(ai, txnh);
        atom.wake_all();
    }

    /// 驱动 atom 提交，`txnh` 已登记为提交者
    fn commit_atom(&self, txnh: &TxnhRef, atom: &AtomRef) -> Result<()> {
        log::debug!("[TXN] txnh {} commits atom {}", txnh.id(), atom.id());
        let Some(atom) = retry(|| self.commit_prepare(txnh))? else {
            return Ok(());
        };
        self.commit_write(txnh, &atom)
    }

    /// 第一阶段：等句柄、flush，直到 `PreCommit`
    ///
    /// 返回 `None` 表示由别的提交者完成了提交
    fn commit_prepare(&self, txnh: &TxnhRef) -> Result<Option<AtomRef>> {
        let mut keep = None;
        let locked = lock_with_atom(&**txnh, &mut keep)?;
        let (Some(mut ai), tg) = (locked.atom, locked.inner) else {
            return Ok(None);
        };
        let Some(atom) = tg.atom.clone() else {
            return Err(Error::repeat());
        };
        drop(tg);
        if ai.stage == AtomStage::Invalid {
            return Err(Error::repeat());
        }

        if ai.committer.map_or(false, |c| c != txnh.id()) {
            // 融合进了一个已经有提交者的 atom
            detach_txnh_locked(&mut ai, txnh);
            drop(ai);
            atom.wake_all();
            return self.wait_finished(&atom).map(|_| None);
        }
        ai.committer = Some(txnh.id());
        if self.is_aborted() {
            self.abandon_commit(txnh, &atom, &mut ai, true);
            return Err(aborted_error());
        }
        if ai.stage == AtomStage::PreCommit {
            ai.flags.remove(AtomFlags::FAILED);
            return Ok(Some(atom));
        }
        if ai.stage > AtomStage::PreCommit {
            return Err(Error::new(ErrorKind::InvalidState, "Atom is past commit"));
        }

        if ai.txnh_count() > ai.nr_waiters as usize + 1 {
            log::trace!(
                "[TXN] atom {} waits for {} open handles",
                atom.id(),
                ai.txnh_count() - 1
            );
            atom.cond.wait(&mut ai);
            return Err(Error::repeat());
        }
        if ai.has_dirty() {
            ai.nr_flushers += 1;
            drop(ai);
            if let Err(e) = self.run_flusher(&atom) {
                log::warn!("[TXN] flush of atom {} failed: {}", atom.id(), e);
                let current = resolve(&atom);
                let mut ai = current.lock();
                self.abandon_commit(txnh, &current, &mut ai, false);
                return Err(e);
            }
            return Err(Error::repeat());
        }
        if ai.nr_flushers > 0
            || ai.nr_running_queues > 0
            || !ai.flush_queues.is_empty()
            || !ai.writeback.is_empty()
        {
            atom.cond.wait(&mut ai);
            return Err(Error::repeat());
        }
        ai.set_stage(AtomStage::PreCommit);
        log::debug!(
            "[TXN] atom {} PreCommit: {} nodes, {} overwrite",
            atom.id(),
            ai.capture_count,
            ai.ovrwr.len()
        );
        Ok(Some(atom))
    }

    /// 第二阶段：日志写和写回，持有 journal 锁
    fn commit_write(&self, txnh: &TxnhRef, atom: &AtomRef) -> Result<()> {
        let mut journal = self.journal.lock();
        let modified = {
            let ai = atom.lock();
            !ai.ovrwr.is_empty()
                || !ai.delete_set.is_empty()
                || ai
                    .listed_nodes()
                    .iter()
                    .any(|n| n.state().contains(JnodeState::RELOC))
        };
        if !modified {
            drop(journal);
            self.finish_commit(atom, None, CommitStats::default());
            return Ok(());
        }

        let undo = match self.pre_commit_hook(atom) {
            Ok(undo) => undo,
            Err((undo, e)) => {
                self.rollback_hook(atom, &undo);
                let mut ai = atom.lock();
                self.abandon_commit(txnh, atom, &mut ai, true);
                return Err(e);
            }
        };

        let mut ch = {
            let ai = atom.lock();
            let overwrite: Vec<OverwriteEntry> = ai
                .ovrwr
                .values()
                .map(|n| {
                    n.pin();
                    OverwriteEntry {
                        node: n.clone(),
                        original: n.blocknr(),
                        data: n.data(),
                    }
                })
                .collect();
            let counters = self.oids.snapshot(self.alloc.committed_free_blocks());
            CommitHandle::new(atom.id(), overwrite, counters, ai.log_reserved)
        };

        if let Err(e) = write_logs(&self.dev, &self.alloc, &mut journal, &mut ch) {
            unpin_all(&ch);
            if !ch.past_commit_point() {
                log::warn!("[TXN] atom {}: log write failed before commit point: {}", atom.id(), e);
                release_log_blocks(&self.alloc, &mut ch, true);
                self.rollback_hook(atom, &undo);
                let mut ai = atom.lock();
                self.abandon_commit(txnh, atom, &mut ai, true);
                return Err(e);
            }
            log::error!("[TXN] atom {}: journal header write failed: {}", atom.id(), e);
            self.aborted.store(true, Ordering::Release);
            let mut ai = atom.lock();
            self.abandon_commit(txnh, atom, &mut ai, true);
            return Err(e);
        }

        atom.lock().set_stage(AtomStage::PostCommit);
        let wandered = ch
            .wandered_map
            .items()
            .into_iter()
            .filter_map(|item| match item {
                BlocknrItem::Pair(a, b) => Some((a, b)),
                BlocknrItem::Single(_) => None,
            })
            .collect();
        let tx_id = ch.tx_id;
        let tx_head = ch.tx_head().unwrap_or(0);
        let res = write_tx_back(&self.dev, &self.alloc, &mut journal, &mut ch);
        unpin_all(&ch);
        if let Err(e) = res {
            log::error!("[TXN] atom {}: write-back failed, replay needed: {}", atom.id(), e);
            self.aborted.store(true, Ordering::Release);
            let mut ai = atom.lock();
            self.abandon_commit(txnh, atom, &mut ai, true);
            return Err(e);
        }
        drop(journal);

        let stats = CommitStats {
            atom_id: atom.id(),
            tx_id,
            tx_head,
            overwrite: ch.overwrite.iter().map(|e| e.original).collect(),
            relocated: undo.relocated.clone(),
            wandered,
            deleted: undo.deleted.clone(),
        };
        self.finish_commit(atom, Some(ch.used_reserved), stats);
        Ok(())
    }

    /// 提交前钩子
    ///
    /// 把重定位和删除写入 commit bitmap，被修改的位图块和 super 节点
    /// 作为 overwrite 节点捕获进 atom
    fn pre_commit_hook(&self, atom: &AtomRef) -> core::result::Result<HookUndo, (HookUndo, Error)> {
        let mut undo = HookUndo::default();
        let (relocated, deleted) = {
            let ai = atom.lock();
            let relocated: Vec<u64> = ai
                .listed_nodes()
                .iter()
                .filter(|n| n.state().contains(JnodeState::RELOC))
                .map(|n| n.blocknr())
                .collect();
            let deleted: Vec<u64> = ai
                .delete_set
                .items()
                .into_iter()
                .filter_map(|item| match item {
                    BlocknrItem::Single(b) => Some(b),
                    BlocknrItem::Pair(..) => None,
                })
                .collect();
            (relocated, deleted)
        };
        for &b in &relocated {
            if let Err(e) = self.alloc.commit_alloc(BlockRange::single(b)) {
                return Err((undo, e));
            }
            undo.relocated.push(b);
        }
        for &b in &deleted {
            if let Err(e) = self.alloc.commit_dealloc(b) {
                return Err((undo, e));
            }
            undo.deleted.push(b);
        }

        for (blk, data) in self.alloc.take_dirty_bitmaps() {
            undo.bitmaps.push(blk);
            let kind = JnodeKind::Bitmap {
                index: blk - FIRST_BITMAP_BLOCK,
            };
            if let Err(e) = self.log_node(atom, kind, blk, data, &mut undo) {
                return Err((undo, e));
            }
        }

        let counters = self.oids.snapshot(self.alloc.committed_free_blocks());
        if let Some((blk, data)) = self.layout.log_super(&*self.tree, &counters) {
            if let Err(e) = self.log_node(atom, JnodeKind::LogHead, blk, data, &mut undo) {
                return Err((undo, e));
            }
        }
        log::debug!(
            "[TXN] atom {} pre-commit: {} relocated, {} deleted, {} bitmap blocks",
            atom.id(),
            undo.relocated.len(),
            undo.deleted.len(),
            undo.bitmaps.len()
        );
        Ok(undo)
    }

    /// 撤销提交前钩子
    fn rollback_hook(&self, atom: &AtomRef, undo: &HookUndo) {
        for &b in &undo.relocated {
            if let Err(e) = self.alloc.commit_dealloc(b) {
                log::warn!("[TXN] rollback of relocated block {:#x} failed: {}", b, e);
            }
        }
        for &b in &undo.deleted {
            if let Err(e) = self.alloc.commit_alloc(BlockRange::single(b)) {
                log::warn!("[TXN] rollback of deleted block {:#x} failed: {}", b, e);
            }
        }
        self.alloc.redirty_bitmaps(undo.bitmaps.iter().copied());
        let mut ai = atom.lock();
        for node in &undo.captured {
            let mut jg = node.lock();
            jnode::detach_from_atom(&mut ai, node, &mut jg);
        }
        drop(ai);
        for node in &undo.captured {
            self.jnodes.park(node.clone());
        }
    }

    /// 把位图块或 super 块作为 overwrite 节点捕获进 atom
    fn log_node(
        &self,
        atom: &AtomRef,
        kind: JnodeKind,
        blk: u64,
        data: Vec<u8>,
        undo: &mut HookUndo,
    ) -> Result<()> {
        let node = self.jnodes.jget(kind, blk);
        node.set_data(data);
        let res = capture_overwrite(atom, &node);
        if let Ok(true) = res {
            undo.captured.push(node.clone());
        }
        // atom 持有节点，不再需要查找得到的引用
        self.jnodes.release(node);
        res.map(|_| ())
    }

    /// 提交收尾：摘下节点和句柄，释放 delete set 和多余的预留
    fn finish_commit(&self, atom: &AtomRef, used_reserved: Option<u64>, mut stats: CommitStats) {
        stats.atom_id = atom.id();
        let (nodes, deleted) = {
            let mut ai = atom.lock();
            let nodes = ai.listed_nodes();
            for node in &nodes {
                let mut jg = node.lock();
                jg.state.remove(JnodeState::CREATED);
                jnode::detach_from_atom(&mut ai, node, &mut jg);
            }
            let mut deleted = Vec::new();
            let _ = ai.delete_set.iterate(
                |item| {
                    if let BlocknrItem::Single(b) = item {
                        deleted.push(b);
                    }
                    Ok(())
                },
                true,
            );
            let unused = ai.log_reserved.saturating_sub(used_reserved.unwrap_or(0));
            self.alloc.ungrab(unused);
            ai.log_reserved = 0;
            ai.wandered_map.clear();
            ai.set_stage(AtomStage::Done);
            ai.committer = None;
            for t in core::mem::take(&mut ai.txnhs) {
                let mut tg = t.lock();
                tg.atom = None;
                tg.waiting = false;
            }
            ai.nr_waiters = 0;
            (nodes, deleted)
        };
        atom.wake_all();
        self.unregister_atom(atom.id());

        // footer 已持久，被删除的块可以重用了
        for &b in &deleted {
            if let Err(e) = self.alloc.release_deferred(b) {
                log::warn!("[TXN] releasing deleted block {:#x} failed: {}", b, e);
            }
        }
        for node in nodes {
            self.jnodes.park(node);
        }
        log::info!(
            "[TXN] atom {} committed: tx {}, {} overwrite, {} relocated, {} deleted",
            atom.id(),
            stats.tx_id,
            stats.overwrite.len(),
            stats.relocated.len(),
            deleted.len()
        );
        *self.last_commit.lock() = Some(stats);
    }

    /// 强制提交所有 atom（sync）
    ///
    /// 返回遇到的第一个错误，但会尝试所有 atom
    pub fn commit_all(&self) -> Result<()> {
        let mut first_err = None;
        for atom in self.atoms() {
            if let Err(e) = self.force_commit(&atom) {
                log::warn!("[TXN] sync of atom {} failed: {}", atom.id(), e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn force_commit(&self, atom: &AtomRef) -> Result<()> {
        let txnh = self.new_txnh(TxnMode::WriteFusing, TxnFlags::WAIT_COMMIT);
        let atom = retry(|| {
            let current = resolve(atom);
            let mut ai = current.lock();
            if ai.stage == AtomStage::Invalid {
                return Err(Error::repeat());
            }
            if ai.stage >= AtomStage::Done {
                return Ok(None);
            }
            ai.flags.insert(AtomFlags::FORCE_COMMIT);
            if ai.committer.is_some() {
                drop(ai);
                return self.wait_finished(&current).map(|_| None);
            }
            if !can_commit(&ai) {
                return Err(Error::new(ErrorKind::InvalidState, "Atom is past commit"));
            }
            txnh.lock().atom = Some(current.clone());
            ai.attach_txnh(txnh.clone());
            ai.committer = Some(txnh.id());
            if ai.stage < AtomStage::CaptureWait {
                ai.set_stage(AtomStage::CaptureWait);
            }
            Ok(Some(current.clone()))
        })?;
        match atom {
            Some(atom) => self.commit_atom(&txnh, &atom),
            None => Ok(()),
        }
    }

    /// 内存压力下 flush 一个 atom
    ///
    /// 选一个还没进入提交、有脏节点、flusher 未满的 atom 做一次 flush。
    /// 没有合适的 atom 时返回 `None`。
    pub fn flush_some_atom(&self) -> Result<Option<FlushReport>> {
        let picked = self.atoms().into_iter().find_map(|atom| {
            let mut ai = atom.lock();
            let ok = ai.stage < AtomStage::PreCommit
                && ai.has_dirty()
                && ai.nr_flushers < self.config.atom_max_flushers;
            if ok {
                ai.nr_flushers += 1;
                drop(ai);
                Some(atom)
            } else {
                None
            }
        });
        let Some(atom) = picked else {
            return Ok(None);
        };
        log::debug!("[FLUSH] flushing atom {} under memory pressure", atom.id());
        self.run_flusher(&atom).map(Some)
    }
}

/// 把日志类节点作为 overwrite 节点捕获进 atom
///
/// 返回节点是否是新捕获的
fn capture_overwrite(atom: &AtomRef, node: &JnodeRef) -> Result<bool> {
    let mut ai: MutexGuard<'_, AtomInner> = atom.lock();
    let mut jg = node.lock();
    let fresh = match jg.atom.as_ref() {
        None => {
            ai.attach_jnode(atom, node, &mut jg);
            true
        }
        Some(a) if Arc::ptr_eq(a, atom) => false,
        Some(_) => {
            return Err(Error::new(ErrorKind::InvalidState, "Log node held by another atom"));
        }
    };
    jg.state.insert(JnodeState::DIRTY | JnodeState::OVWR);
    ai.relink(node, &mut jg, super::AtomList::Overwrite);
    Ok(fresh)
}

fn unpin_all(ch: &CommitHandle) {
    for entry in &ch.overwrite {
        entry.node.unpin();
    }
}
