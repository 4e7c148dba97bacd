//! Flush queue
//!
//! 已决定重定位的节点在这里累积，等待批量写出。flush 引擎只做决定，
//! 写 I/O 的提交和完成统计都在这里。
//!
//! 锁顺序：atom > jnode > flush queue。

use crate::{
    block::BlockDev,
    error::{retry, Error, ErrorKind, Result},
    jnode::{JnodeInner, JnodeRef, JnodeState},
    txnmgr::{lock_valid, AtomInner, AtomList, AtomRef},
};
use parking_lot::{Mutex, MutexGuard};
use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

static NEXT_FQ_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct FqInner {
    atom: Option<AtomRef>,
    /// 等待写出的节点
    prepped: Vec<JnodeRef>,
    /// 已提交写 I/O 的节点
    submitted: Vec<JnodeRef>,
    /// 写失败的块号
    failed: BTreeSet<u64>,
    nr_submitted: usize,
    nr_errors: usize,
    /// 是否计入了 atom 的 `nr_running_queues`
    running: bool,
}

/// Flush queue
pub struct FlushQueue {
    id: u64,
    inner: Mutex<FqInner>,
}

impl core::fmt::Debug for FlushQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FlushQueue").field("id", &self.id).finish()
    }
}

impl FlushQueue {
    /// 创建 flush queue 并挂到 atom 上（调用者持有 atom 锁）
    pub(crate) fn attach(atom: &AtomRef, ai: &mut AtomInner) -> Arc<Self> {
        let fq = Arc::new(Self {
            id: NEXT_FQ_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(FqInner {
                atom: Some(atom.clone()),
                ..Default::default()
            }),
        });
        ai.flush_queues.push(fq.clone());
        log::trace!("[FLUSH] fq {} attached to atom {}", fq.id, atom.id());
        fq
    }

    /// queue id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// prepped 链表上的节点数
    pub fn len(&self) -> usize {
        self.inner.lock().prepped.len()
    }

    /// prepped 链表是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 成功提交的写块数
    pub fn nr_submitted(&self) -> usize {
        self.inner.lock().nr_submitted
    }

    /// 所属 atom
    pub(crate) fn atom(&self) -> Option<AtomRef> {
        self.inner.lock().atom.clone()
    }

    /// fusion 时改写所属 atom
    pub(crate) fn set_atom(&self, atom: &AtomRef) {
        self.inner.lock().atom = Some(atom.clone());
    }

    /// prepped 节点快照（fusion 改写 jnode 的 atom 指针用）
    pub(crate) fn prepped_nodes(&self) -> Vec<JnodeRef> {
        self.inner.lock().prepped.clone()
    }

    /// 把一个已决定重定位的节点放进队列
    ///
    /// 调用者持有 atom 锁和 jnode 锁。节点离开脏 / 干净链表，
    /// 打上 `FLUSH_QUEUED`，不再被 flush 扫描看到。
    pub(crate) fn queue_locked(&self, ai: &mut AtomInner, node: &JnodeRef, jg: &mut JnodeInner) {
        debug_assert!(jg.state.contains(JnodeState::RELOC));
        if jg.state.intersects(JnodeState::FLUSH_QUEUED | JnodeState::WRITEBACK) {
            return;
        }
        jg.state.insert(JnodeState::FLUSH_QUEUED);
        ai.relink(node, jg, AtomList::Queued);
        self.inner.lock().prepped.push(node.clone());
    }

    /// 锁住队列所属的 atom，处理 fusion 竞争
    fn lock_atom<'a>(
        &self,
        keep: &'a mut Option<AtomRef>,
    ) -> Result<(&'a AtomRef, MutexGuard<'a, AtomInner>)> {
        let atom = self
            .atom()
            .ok_or(Error::new(ErrorKind::InvalidState, "Flush queue is detached"))?;
        let atom: &'a AtomRef = keep.insert(atom);
        let ag = lock_valid(atom)?;
        let same = self
            .inner
            .lock()
            .atom
            .as_ref()
            .map_or(false, |a| Arc::ptr_eq(a, atom));
        if !same {
            return Err(Error::repeat());
        }
        Ok((atom, ag))
    }

    /// 提交所有 prepped 节点的写 I/O
    ///
    /// 相邻块合并成一次写。返回时节点处于 `WRITEBACK`，
    /// 需要再调用 [`finish`](Self::finish)。
    pub fn write(&self, dev: &BlockDev, one_stream: bool) -> Result<usize> {
        let batch = retry(|| {
            let mut keep = None;
            let (atom, mut ai) = self.lock_atom(&mut keep)?;
            if one_stream && ai.nr_running_queues > 0 {
                atom.cond.wait(&mut ai);
                return Err(Error::repeat());
            }
            Ok(self.start_writeback(&mut ai))
        })?;

        let count = batch.len();
        if count == 0 {
            return Ok(0);
        }
        let result = dev.write_batch(batch);
        let mut inner = self.inner.lock();
        inner.nr_submitted += count - result.failed_blocks.len();
        inner.failed.extend(result.failed_blocks.iter().copied());
        if !result.is_ok() {
            log::warn!(
                "[FLUSH] fq {}: {} of {} blocks failed to write",
                self.id,
                result.failed_blocks.len(),
                count
            );
        }
        log::debug!("[FLUSH] fq {} submitted {} blocks", self.id, count);
        Ok(count)
    }

    /// 把 prepped 节点转为写 I/O 中，返回要写的块（调用者持有 atom 锁）
    fn start_writeback(&self, ai: &mut AtomInner) -> Vec<(u64, Vec<u8>)> {
        let prepped = core::mem::take(&mut self.inner.lock().prepped);
        let mut batch = Vec::with_capacity(prepped.len());
        let mut submitted = Vec::with_capacity(prepped.len());
        for node in prepped {
            let mut jg = node.lock();
            jg.state.remove(JnodeState::FLUSH_QUEUED);
            // 排队后被删除的节点不再属于 atom
            if jg.atom.is_none() || jg.state.contains(JnodeState::HEARD_BANSHEE) {
                continue;
            }
            jg.state.remove(JnodeState::DIRTY);
            jg.state.insert(JnodeState::WRITEBACK);
            ai.relink(&node, &mut jg, AtomList::Writeback);
            batch.push((jg.blocknr, jg.data.clone()));
            drop(jg);
            submitted.push(node);
        }
        let mut inner = self.inner.lock();
        if !submitted.is_empty() && !inner.running {
            inner.running = true;
            ai.nr_running_queues += 1;
        }
        inner.submitted.extend(submitted);
        batch
    }

    /// 等待写完成，把节点放回 atom 的干净或脏链表，并把队列从 atom 摘下
    ///
    /// # 返回
    ///
    /// 写失败的节点数。失败的节点重新标脏，保持 `RELOC`，下次 flush 重写。
    pub fn finish(&self) -> Result<usize> {
        retry(|| {
            let mut keep = None;
            let (atom, mut ai) = self.lock_atom(&mut keep)?;
            let (submitted, failed, running) = {
                let mut inner = self.inner.lock();
                (
                    core::mem::take(&mut inner.submitted),
                    core::mem::take(&mut inner.failed),
                    core::mem::replace(&mut inner.running, false),
                )
            };
            let mut errors = 0;
            for node in submitted {
                let mut jg = node.lock();
                if jg.atom.is_none() {
                    continue;
                }
                jg.state.remove(JnodeState::WRITEBACK);
                if failed.contains(&jg.blocknr) {
                    jg.state.insert(JnodeState::DIRTY);
                    errors += 1;
                }
                let to = if jg.state.contains(JnodeState::DIRTY) {
                    AtomList::Dirty(node.level())
                } else {
                    AtomList::Clean
                };
                ai.relink(&node, &mut jg, to);
            }
            if running {
                ai.nr_running_queues -= 1;
            }
            let leftover = !self.inner.lock().prepped.is_empty();
            if !leftover {
                ai.flush_queues.retain(|fq| fq.id != self.id);
                self.inner.lock().atom = None;
            }
            self.inner.lock().nr_errors += errors;
            atom.wake_all();
            if errors > 0 {
                log::error!("[FLUSH] fq {}: {} write errors", self.id, errors);
            }
            Ok(errors)
        })
    }

    /// 累计的写错误数
    pub fn nr_errors(&self) -> usize {
        self.inner.lock().nr_errors
    }
}
