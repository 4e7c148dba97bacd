//! 事务文件系统

use crate::{
    balloc::BlockAllocator,
    block::BlockDev,
    consts::LEAF_LEVEL,
    error::{Error, ErrorKind, Result},
    flush::FlushReport,
    jnode::{JnodeKind, JnodeRef, JnodeTable},
    layout::{self, DiskLayout, FormatSuper, OidAllocator},
    tree::{MemTree, TreeLayer},
    txnmgr::{TxnConfig, TxnHandle, TxnMgr, TxnMgrParts, TxnMode},
    wander::{self, CommitStats, ReplayReport},
};
use std::sync::Arc;

/// 文件系统统计信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsStats {
    /// 块大小（字节）
    pub block_size: u32,
    /// 总块数
    pub blocks_total: u64,
    /// 空闲块数（含已预留）
    pub blocks_free: u64,
    /// 已提交状态下的空闲块数
    pub blocks_free_committed: u64,
    /// 存活对象数
    pub nr_files: u64,
    /// 下一个对象 id
    pub next_oid: u64,
    /// 活动 atom 数
    pub atoms: usize,
    /// 树高
    pub tree_height: u8,
}

/// 事务文件系统
pub struct TxnFs {
    mgr: Arc<TxnMgr>,
    tree: Arc<MemTree>,
    oids: Arc<OidAllocator>,
    replay: ReplayReport,
}

impl TxnFs {
    /// 在设备上创建空文件系统
    pub fn format(dev: &BlockDev) -> Result<FormatSuper> {
        layout::format(dev)
    }

    /// 挂载文件系统
    ///
    /// 先 replay 未写回的事务，再读 super block、位图和树
    ///
    /// # 错误
    ///
    /// - `Corrupted` - 日志或 super block 损坏
    /// - `Io` - 设备读写失败
    pub fn mount(dev: Arc<BlockDev>, config: TxnConfig) -> Result<Self> {
        let replay = wander::replay(&dev)?;
        let layout = DiskLayout::new(dev.block_size(), dev.total_blocks());
        let sb = layout.read_super(&dev)?;
        let alloc = Arc::new(BlockAllocator::load(&dev)?);
        if alloc.free_blocks() != replay.counters.free_blocks {
            log::warn!(
                "[LAYOUT] footer says {} free blocks, bitmap has {}",
                replay.counters.free_blocks,
                alloc.free_blocks()
            );
        }
        // footer 指向的 tx head 不进 commit bitmap，下一次 footer 翻转前不能重用
        if replay.journal.last_flushed != 0 {
            alloc.claim(replay.journal.last_flushed)?;
        }
        let jnodes = Arc::new(JnodeTable::new(dev.block_size(), config.jnode_cache_size));
        let tree = Arc::new(MemTree::load(&dev, &jnodes, sb.root_block, sb.tree_height)?);
        let oids = Arc::new(OidAllocator::new(
            replay.counters.next_oid,
            replay.counters.nr_files,
        ));
        let mgr = TxnMgr::new(
            config,
            TxnMgrParts {
                dev,
                alloc,
                jnodes,
                tree: tree.clone(),
                layout: Arc::new(layout),
                oids: oids.clone(),
                journal: replay.journal,
            },
        );
        log::info!(
            "[LAYOUT] mounted: {} transactions replayed, root {:#x}, height {}",
            replay.replayed,
            sb.root_block,
            sb.tree_height
        );
        Ok(Self { mgr, tree, oids, replay })
    }

    /// 事务管理器
    pub fn txn_mgr(&self) -> &Arc<TxnMgr> {
        &self.mgr
    }

    /// 树
    pub fn tree(&self) -> &Arc<MemTree> {
        &self.tree
    }

    /// 挂载时的 replay 结果
    pub fn replay_report(&self) -> &ReplayReport {
        &self.replay
    }

    /// 开始一个事务句柄
    pub fn begin_handle(&self, mode: TxnMode) -> TxnHandle {
        self.mgr.begin(mode)
    }

    /// 在句柄下修改节点：先 capture，改内容，再确认节点仍是脏的
    ///
    /// 第二次标脏覆盖内存压力 flush 在修改期间写出节点的情况
    fn modify<T>(&self, h: &TxnHandle, node: &JnodeRef, f: impl FnOnce() -> Result<T>) -> Result<T> {
        h.dirty(node)?;
        let out = f()?;
        h.dirty(node)?;
        Ok(out)
    }

    /// 修改节点（只标脏，不改内容）
    pub fn dirty(&self, h: &TxnHandle, node: &JnodeRef) -> Result<()> {
        h.dirty(node)
    }

    /// 新建根节点
    ///
    /// 空树的第一个根可以是任意层级；之后的新根必须比树高大一，旧根成为它的子节点
    pub fn new_root(&self, h: &TxnHandle, level: u8) -> Result<JnodeRef> {
        if level < LEAF_LEVEL {
            return Err(Error::new(ErrorKind::InvalidInput, "Tree level starts at 1"));
        }
        let node = self.mgr.jnodes().create(JnodeKind::Formatted { level });
        self.modify(h, &node, || self.tree.set_root(&node))?;
        log::debug!("[TREE] new root jnode {} at level {}", node.id(), level);
        Ok(node)
    }

    /// 在父节点末尾新建一个格式化子节点
    ///
    /// # 错误
    ///
    /// - `NoSpace` - 父节点已满
    /// - `InvalidInput` - 父节点是叶子
    pub fn new_child(&self, h: &TxnHandle, parent: &JnodeRef) -> Result<JnodeRef> {
        if parent.level() <= LEAF_LEVEL {
            return Err(Error::new(ErrorKind::InvalidInput, "Leaf cannot have children"));
        }
        let child = self.mgr.jnodes().create(JnodeKind::Formatted {
            level: parent.level() - 1,
        });
        self.modify(h, parent, || self.tree.append_child(parent, &child))?;
        h.dirty(&child)?;
        Ok(child)
    }

    /// 插入或替换叶子 item
    pub fn insert_item(&self, h: &TxnHandle, leaf: &JnodeRef, key: u64, payload: &[u8]) -> Result<()> {
        self.modify(h, leaf, || self.tree.insert_leaf_item(leaf, key, payload))
    }

    /// 删除叶子 item，返回是否存在
    pub fn remove_item(&self, h: &TxnHandle, leaf: &JnodeRef, key: u64) -> Result<bool> {
        self.modify(h, leaf, || self.tree.remove_leaf_item(leaf, key))
    }

    /// 在 twig 节点末尾追加一个 `count` 块的 extent，返回新建的数据节点
    pub fn append_extent(
        &self,
        h: &TxnHandle,
        twig: &JnodeRef,
        oid: u64,
        first_index: u64,
        count: usize,
    ) -> Result<Vec<JnodeRef>> {
        let units: Vec<JnodeRef> = (0..count as u64)
            .map(|i| {
                self.mgr.jnodes().create(JnodeKind::Unformatted {
                    oid,
                    index: first_index + i,
                })
            })
            .collect();
        self.modify(h, twig, || self.tree.append_extent(twig, oid, first_index, &units))?;
        for u in &units {
            h.dirty(u)?;
        }
        Ok(units)
    }

    /// 写数据节点的内容（不足一块补零）
    pub fn write_data(&self, h: &TxnHandle, node: &JnodeRef, data: &[u8]) -> Result<()> {
        if !node.kind().is_unformatted() {
            return Err(Error::new(ErrorKind::InvalidInput, "Not a data node"));
        }
        let bs = self.mgr.dev().block_size() as usize;
        if data.len() > bs {
            return Err(Error::new(ErrorKind::InvalidInput, "Data exceeds block size"));
        }
        self.modify(h, node, || {
            let mut buf = data.to_vec();
            buf.resize(bs, 0);
            node.set_data(buf);
            Ok(())
        })
    }

    /// 读节点内容，需要时从磁盘加载
    pub fn read_node(&self, node: &JnodeRef) -> Result<Vec<u8>> {
        self.mgr.jnodes().load(node, self.mgr.dev())?;
        Ok(node.data())
    }

    /// 删除没有子节点的节点
    ///
    /// 先从父节点摘下（父节点随同一事务提交），再把块放进 delete set
    pub fn delete_node(&self, h: &TxnHandle, node: &JnodeRef) -> Result<()> {
        if self.tree.leftmost_child(node).is_some() {
            return Err(Error::new(ErrorKind::InvalidInput, "Node still has children"));
        }
        if let Some(parent) = self.tree.parent(node) {
            h.dirty(&parent)?;
            h.dirty(node)?;
            self.tree.remove(node)?;
            h.dirty(&parent)?;
        } else {
            h.dirty(node)?;
            self.tree.remove(node)?;
        }
        self.mgr.delete_node(h.txnh(), node)
    }

    /// 分配对象 id
    pub fn allocate_oid(&self) -> u64 {
        self.oids.allocate_oid()
    }

    /// 释放对象 id
    pub fn release_oid(&self, oid: u64) {
        self.oids.release_oid(oid)
    }

    /// 强制提交所有 atom
    pub fn sync(&self) -> Result<()> {
        self.mgr.commit_all()
    }

    /// 内存压力下 flush 一个 atom
    pub fn flush_some(&self) -> Result<Option<FlushReport>> {
        self.mgr.flush_some_atom()
    }

    /// 最近一次提交的统计
    pub fn last_commit(&self) -> Option<CommitStats> {
        self.mgr.last_commit()
    }

    /// 统计信息
    pub fn stats(&self) -> FsStats {
        let alloc = self.mgr.allocator();
        FsStats {
            block_size: self.mgr.dev().block_size(),
            blocks_total: self.mgr.dev().total_blocks(),
            blocks_free: alloc.free_blocks(),
            blocks_free_committed: alloc.committed_free_blocks(),
            nr_files: self.oids.nr_files(),
            next_oid: self.oids.next_oid(),
            atoms: self.mgr.atoms().len(),
            tree_height: self.tree.height(),
        }
    }

    /// 卸载：提交所有 atom
    pub fn unmount(self) -> Result<()> {
        self.sync()?;
        log::info!("[LAYOUT] unmounted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{block::MemDevice, jnode::JnodeState};

    fn mount(mem: &MemDevice) -> TxnFs {
        let dev = Arc::new(BlockDev::new(mem.clone()).unwrap());
        TxnFs::mount(dev, TxnConfig::default()).unwrap()
    }

    fn fresh() -> (MemDevice, TxnFs) {
        let mem = MemDevice::new(512, 1024);
        TxnFs::format(&BlockDev::new(mem.clone()).unwrap()).unwrap();
        let fs = mount(&mem);
        (mem, fs)
    }

    #[test]
    fn test_build_commit_remount() {
        let (mem, fs) = fresh();
        let h = fs.begin_handle(TxnMode::WriteFusing);
        let root = fs.new_root(&h, 2).unwrap();
        let leaf = fs.new_child(&h, &root).unwrap();
        fs.insert_item(&h, &leaf, 7, b"seven").unwrap();
        fs.insert_item(&h, &leaf, 3, b"three").unwrap();
        h.request_commit();
        h.close().unwrap();

        assert!(fs.txn_mgr().atoms().is_empty());
        assert!(!leaf.state().contains(JnodeState::DIRTY));
        let stats = fs.last_commit().unwrap();
        assert_eq!(stats.relocated.len(), 2);
        drop(fs);

        let fs = mount(&mem);
        assert_eq!(fs.replay_report().replayed, 0);
        assert_eq!(fs.tree().height(), 2);
        assert_eq!(
            fs.tree().all_leaf_items(),
            vec![(3, b"three".to_vec()), (7, b"seven".to_vec())]
        );
    }

    #[test]
    fn test_oid_counters_survive_remount() {
        let (mem, fs) = fresh();
        let first = fs.allocate_oid();
        fs.allocate_oid();
        fs.release_oid(first);
        let h = fs.begin_handle(TxnMode::WriteFusing);
        let root = fs.new_root(&h, 1).unwrap();
        fs.insert_item(&h, &root, 1, b"x").unwrap();
        h.close().unwrap();
        fs.sync().unwrap();
        let next = fs.stats().next_oid;
        drop(fs);

        let fs = mount(&mem);
        assert_eq!(fs.stats().next_oid, next);
        assert_eq!(fs.stats().nr_files, 1);
    }

    #[test]
    fn test_extent_data_roundtrip() {
        let (mem, fs) = fresh();
        let h = fs.begin_handle(TxnMode::WriteFusing);
        let root = fs.new_root(&h, 2).unwrap();
        let oid = fs.allocate_oid();
        let units = fs.append_extent(&h, &root, oid, 0, 2).unwrap();
        fs.write_data(&h, &units[1], b"payload").unwrap();
        h.request_commit();
        h.close().unwrap();
        let blk = units[1].blocknr();
        assert_eq!(&mem.peek(blk)[..7], b"payload");
        drop(fs);

        let fs = mount(&mem);
        let root = fs.tree().root().unwrap();
        let data = fs.tree().leftmost_child(&root).unwrap();
        assert_eq!(data.kind(), JnodeKind::Unformatted { oid, index: 0 });
        let second = fs.tree().right_neighbor(&data).unwrap();
        assert_eq!(&fs.read_node(&second).unwrap()[..7], b"payload");
    }

    #[test]
    fn test_delete_node_frees_block_after_commit() {
        let (_mem, fs) = fresh();
        let h = fs.begin_handle(TxnMode::WriteFusing);
        let root = fs.new_root(&h, 2).unwrap();
        let a = fs.new_child(&h, &root).unwrap();
        let b = fs.new_child(&h, &root).unwrap();
        fs.insert_item(&h, &a, 1, &[1u8; 300]).unwrap();
        fs.insert_item(&h, &b, 2, &[2u8; 300]).unwrap();
        h.request_commit();
        h.close().unwrap();
        let old = b.blocknr();
        assert!(fs.txn_mgr().allocator().is_committed(old));

        let h = fs.begin_handle(TxnMode::WriteFusing);
        fs.delete_node(&h, &b).unwrap();
        h.request_commit();
        h.close().unwrap();

        let alloc = fs.txn_mgr().allocator();
        assert!(!alloc.is_committed(old));
        assert!(!alloc.is_allocated(old));
        assert!(fs.last_commit().unwrap().deleted.contains(&old));
        assert_eq!(fs.tree().all_leaf_items().len(), 1);
    }

    #[test]
    fn test_delete_rejects_node_with_children() {
        let (_mem, fs) = fresh();
        let h = fs.begin_handle(TxnMode::WriteFusing);
        let root = fs.new_root(&h, 2).unwrap();
        fs.new_child(&h, &root).unwrap();
        assert_eq!(
            fs.delete_node(&h, &root).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_leaf_cannot_have_children() {
        let (_mem, fs) = fresh();
        let h = fs.begin_handle(TxnMode::WriteFusing);
        let root = fs.new_root(&h, 1).unwrap();
        assert_eq!(fs.new_child(&h, &root).unwrap_err().kind(), ErrorKind::InvalidInput);
    }
}
