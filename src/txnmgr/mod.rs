//! 事务管理器
//!
//! 负责 atom 的创建、capture / fusion、提交驱动。
//!
//! # 组件
//!
//! - [`atom`]：atom 结构和阶段机
//! - [`txnh`]：事务句柄
//! - [`lock`]：try-lock-or-backoff 锁助手
//! - `capture`：capture 的六种情况和 fusion
//! - `commit`：提交流程、`commit_all`、`flush_some_atom`
//!
//! # 锁顺序
//!
//! 树锁 > atom 锁 > jnode 锁 > txnh 锁 > flush queue 锁。
//! 提交时的 journal 锁在 atom 锁之外。
//! atom 注册表、块分配器、jnode 表的锁都是叶子锁。

pub mod atom;
pub mod txnh;
pub(crate) mod lock;
mod capture;
mod commit;
mod config;

pub use atom::{Atom, AtomFlags, AtomId, AtomInner, AtomList, AtomRef, AtomStage};
pub use capture::{CaptureFlags, LockMode};
pub use config::TxnConfig;
pub use txnh::{TxnFlags, TxnMode, Txnh, TxnhRef};

pub(crate) use lock::{lock_valid, resolve};

use crate::{
    balloc::BlockAllocator,
    block::BlockDev,
    blocknr_set::BlocknrSetEntry,
    error::{retry, Error, ErrorKind, Result},
    jnode::{self, blocknr_is_fake, JnodeInner, JnodeRef, JnodeState, JnodeTable},
    layout::{LayoutHook, OidAllocator},
    tree::TreeLayer,
    wander::{CommitStats, JournalState},
};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

/// 事务管理器
pub struct TxnMgr {
    pub(crate) config: TxnConfig,
    pub(crate) dev: Arc<BlockDev>,
    pub(crate) alloc: Arc<BlockAllocator>,
    pub(crate) jnodes: Arc<JnodeTable>,
    pub(crate) tree: Arc<dyn TreeLayer>,
    pub(crate) layout: Arc<dyn LayoutHook>,
    pub(crate) oids: Arc<OidAllocator>,
    /// atom 注册表（叶子锁）
    atoms: Mutex<BTreeMap<AtomId, AtomRef>>,
    next_atom_id: AtomicU64,
    next_txnh_id: AtomicU64,
    /// 提交串行化：同一时刻只有一个 atom 在写日志
    pub(crate) journal: Mutex<JournalState>,
    /// 日志已提交但原地写回失败，之后的提交都拒绝，需要重新挂载 replay
    pub(crate) aborted: AtomicBool,
    pub(crate) last_commit: Mutex<Option<CommitStats>>,
}

/// 创建 [`TxnMgr`] 需要的协作者
pub struct TxnMgrParts {
    /// 块设备
    pub dev: Arc<BlockDev>,
    /// 块分配器
    pub alloc: Arc<BlockAllocator>,
    /// jnode 表
    pub jnodes: Arc<JnodeTable>,
    /// 树
    pub tree: Arc<dyn TreeLayer>,
    /// 磁盘布局钩子
    pub layout: Arc<dyn LayoutHook>,
    /// 对象 id 计数器
    pub oids: Arc<OidAllocator>,
    /// 挂载时的 journal 状态
    pub journal: JournalState,
}

impl TxnMgr {
    /// 创建事务管理器
    pub fn new(config: TxnConfig, parts: TxnMgrParts) -> Arc<Self> {
        Arc::new(Self {
            config,
            dev: parts.dev,
            alloc: parts.alloc,
            jnodes: parts.jnodes,
            tree: parts.tree,
            layout: parts.layout,
            oids: parts.oids,
            atoms: Mutex::new(BTreeMap::new()),
            next_atom_id: AtomicU64::new(1),
            next_txnh_id: AtomicU64::new(1),
            journal: Mutex::new(parts.journal),
            aborted: AtomicBool::new(false),
            last_commit: Mutex::new(None),
        })
    }

    /// 配置
    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    /// 块设备
    pub fn dev(&self) -> &Arc<BlockDev> {
        &self.dev
    }

    /// 块分配器
    pub fn allocator(&self) -> &Arc<BlockAllocator> {
        &self.alloc
    }

    /// jnode 表
    pub fn jnodes(&self) -> &Arc<JnodeTable> {
        &self.jnodes
    }

    /// 树
    pub fn tree(&self) -> &Arc<dyn TreeLayer> {
        &self.tree
    }

    /// 开始一个事务句柄
    pub fn begin(self: &Arc<Self>, mode: TxnMode) -> TxnHandle {
        self.begin_with(mode, TxnFlags::empty())
    }

    /// 开始一个带标志的事务句柄
    pub fn begin_with(self: &Arc<Self>, mode: TxnMode, flags: TxnFlags) -> TxnHandle {
        let id = self.next_txnh_id.fetch_add(1, Ordering::Relaxed);
        TxnHandle {
            mgr: self.clone(),
            txnh: Txnh::new(id, mode, flags),
            closed: false,
        }
    }

    pub(crate) fn new_txnh(&self, mode: TxnMode, flags: TxnFlags) -> TxnhRef {
        Txnh::new(self.next_txnh_id.fetch_add(1, Ordering::Relaxed), mode, flags)
    }

    /// 分配并登记一个新 atom
    pub(crate) fn new_atom(&self) -> AtomRef {
        let atom = Atom::new(self.next_atom_id.fetch_add(1, Ordering::Relaxed));
        self.atoms.lock().insert(atom.id(), atom.clone());
        log::debug!("[TXN] atom {} created", atom.id());
        atom
    }

    pub(crate) fn unregister_atom(&self, id: AtomId) {
        self.atoms.lock().remove(&id);
    }

    /// 注册表快照
    pub fn atoms(&self) -> Vec<AtomRef> {
        self.atoms.lock().values().cloned().collect()
    }

    /// 按 id 查找 atom
    pub fn atom(&self, id: AtomId) -> Option<AtomRef> {
        self.atoms.lock().get(&id).cloned()
    }

    /// 最近一次提交的统计
    pub fn last_commit(&self) -> Option<CommitStats> {
        self.last_commit.lock().clone()
    }

    /// journal 状态快照
    pub fn journal_state(&self) -> JournalState {
        *self.journal.lock()
    }

    /// 修改节点：捕获到句柄的 atom 并标脏
    ///
    /// 节点还没有 atom 时会创建 atom
    pub fn dirty(&self, txnh: &TxnhRef, node: &JnodeRef) -> Result<()> {
        retry(|| {
            self.capture_once(txnh, node, LockMode::Write, CaptureFlags::empty())?;
            let mut keep = None;
            let locked = lock::lock_with_atom(&**node, &mut keep)?;
            let (Some(mut ai), mut jg) = (locked.atom, locked.inner) else {
                return Err(Error::repeat());
            };
            if !lock::same_atom(jg.atom.as_ref(), txnh.atom().as_ref()) {
                return Err(Error::repeat());
            }
            self.mark_dirty_reserving(&mut ai, node, &mut jg);
            Ok(())
        })
    }

    /// 标脏，需要时为 overwrite 预留一个日志块（调用者持有 atom 锁和 jnode 锁）
    pub(crate) fn mark_dirty_reserving(&self, ai: &mut AtomInner, node: &JnodeRef, jg: &mut JnodeInner) {
        if jnode::mark_dirty_locked(ai, node, jg) {
            match self.alloc.grab(1) {
                Ok(()) => ai.log_reserved += 1,
                Err(_) => {
                    jg.state.remove(JnodeState::LOG_RESERVED);
                    log::warn!("[TXN] no space to reserve log block for jnode {}", node.id());
                }
            }
        }
    }

    /// 删除节点
    ///
    /// 节点被捕获后打上 `HEARD_BANSHEE`，真实块号进入 atom 的 delete set
    /// （本事务重定位得到的新块直接释放），然后从 atom 摘下
    pub fn delete_node(&self, txnh: &TxnhRef, node: &JnodeRef) -> Result<()> {
        self.try_capture(txnh, node, LockMode::Write, CaptureFlags::empty())?;
        self.discard(node)
    }

    /// 从所属 atom 中删除一个已捕获的节点
    pub(crate) fn discard(&self, node: &JnodeRef) -> Result<()> {
        let mut prealloc = None;
        retry(|| {
            if prealloc.is_none() {
                prealloc = Some(BlocknrSetEntry::new_boxed());
            }
            let mut keep = None;
            let locked = lock::lock_with_atom(&**node, &mut keep)?;
            let (Some(mut ai), mut jg) = (locked.atom, locked.inner) else {
                return Err(Error::new(ErrorKind::InvalidState, "Deleted node is not captured"));
            };
            if jg.state.contains(JnodeState::WRITEBACK) {
                return Err(Error::new(ErrorKind::Busy, "Node is under writeback"));
            }
            jg.state.insert(JnodeState::HEARD_BANSHEE);
            let blocknr = jg.blocknr;
            if !blocknr_is_fake(blocknr) {
                if jg.state.contains(JnodeState::RELOC) {
                    // 本事务分配的块从未提交，直接还给 working bitmap
                    self.alloc.dealloc(crate::balloc::BlockRange::single(blocknr))?;
                } else {
                    ai.delete_set.add_single(blocknr, &mut prealloc)?;
                }
            }
            jnode::detach_from_atom(&mut ai, node, &mut jg);
            log::debug!("[TXN] jnode {} deleted (block {:#x})", node.id(), blocknr);
            Ok(())
        })?;
        self.jnodes.forget(node);
        Ok(())
    }

    /// 是否已因写回失败而中止
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

/// 事务句柄（RAII）
///
/// 显式调用 [`close`](Self::close) 可以得到提交错误；
/// 直接 drop 时也会关闭句柄，错误只写日志。
pub struct TxnHandle {
    mgr: Arc<TxnMgr>,
    txnh: TxnhRef,
    closed: bool,
}

impl TxnHandle {
    /// 底层句柄
    pub fn txnh(&self) -> &TxnhRef {
        &self.txnh
    }

    /// 所属 atom 的 id
    pub fn atom_id(&self) -> Option<AtomId> {
        self.txnh.atom_id()
    }

    /// 捕获节点
    pub fn capture(&self, node: &JnodeRef, mode: LockMode, flags: CaptureFlags) -> Result<()> {
        self.mgr.try_capture(&self.txnh, node, mode, flags)
    }

    /// 修改节点
    pub fn dirty(&self, node: &JnodeRef) -> Result<()> {
        self.mgr.dirty(&self.txnh, node)
    }

    /// 关闭句柄时要求提交
    pub fn request_commit(&self) {
        self.txnh.set_flags(TxnFlags::WAIT_COMMIT);
    }

    /// 关闭句柄；可能触发提交
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.mgr.close_txnh(&self.txnh)
    }
}

impl Drop for TxnHandle {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.mgr.close_txnh(&self.txnh) {
                log::warn!("[TXN] closing handle {} failed: {}", self.txnh.id(), e);
            }
        }
    }
}
