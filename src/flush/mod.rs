//! Flush / 分配引擎
//!
//! 为 atom 中的脏节点决定最终位置，使叶子从左到右扫描时块号尽量递增
//! （parent-first 顺序）：
//!
//! 1. 从一个脏节点出发向左、向右扫描同一 atom 的连续脏节点（slum）
//! 2. 从 slum 左边界向上，先分配未决定的祖先
//! 3. 向右 squeeze-and-allocate，见 `squalloc`
//! 4. 每个节点的 relocate / overwrite 决定见 `relocate`
//!
//! 重定位的节点在 [`FlushQueue`] 中累积，一次 flush 结束时批量写出。
//! 覆盖写的节点留在 atom 的 overwrite 链表上，由提交时的 wandering log 写出。

mod pos;
mod queue;
mod relocate;
mod scan;
mod squalloc;

pub use queue::FlushQueue;

use crate::{
    error::{retry, Error, ErrorKind, Result},
    jnode::{JnodeRef, JnodeState},
    txnmgr::{lock_valid, resolve, AtomRef, TxnMgr},
};
use pos::FlushPos;
use std::sync::Arc;

/// 一次 flush 的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// 做出决定的节点数
    pub prepped: usize,
    /// 重定位的节点数
    pub relocated: usize,
    /// 覆盖写的节点数
    pub overwritten: usize,
    /// squeeze 移动的 item 数
    pub squeezed: usize,
    /// 被 squeeze 清空并删除的节点数
    pub deleted: usize,
    /// 提交写 I/O 的块数
    pub written: usize,
    /// 节点预算用完，还有脏节点
    pub budget_exhausted: bool,
}

/// 对 atom 做一次 flush
///
/// 处理到没有未决定的脏节点或预算用完为止，然后写出 flush queue 并等待完成。
/// atom 在 flush 过程中被融合时，继续处理融合后的 atom。
///
/// # 错误
///
/// - `Io` - 有块写失败（失败的节点保持脏，下次 flush 重写）
/// - `NoSpace` - 新建节点分配不到块
pub(crate) fn flush_atom(mgr: &TxnMgr, atom: &AtomRef) -> Result<FlushReport> {
    let fq = retry(|| {
        let current = resolve(atom);
        let mut ai = lock_valid(&current)?;
        Ok(FlushQueue::attach(&current, &mut ai))
    })?;
    let mut pos = FlushPos::new(mgr, fq.clone());
    let res = run(&mut pos);

    // 已经排队的节点无论如何都要写出
    let written = fq.write(&mgr.dev, mgr.config.write_one_stream);
    let errors = fq.finish()?;
    res?;
    pos.report.written = written?;
    if errors > 0 {
        return Err(Error::new(ErrorKind::Io, "Flush write failed"));
    }
    log::debug!(
        "[FLUSH] atom {}: {} prepped ({} relocated, {} overwrite), {} written",
        atom.id(),
        pos.report.prepped,
        pos.report.relocated,
        pos.report.overwritten,
        pos.report.written
    );
    Ok(pos.report)
}

fn run(pos: &mut FlushPos<'_>) -> Result<()> {
    while pos.budget_left() {
        let Some(start) = pick_start(pos)? else {
            return Ok(());
        };
        flush_from(pos, start)?;
    }
    pos.report.budget_exhausted = pick_start(pos)?.is_some();
    Ok(())
}

/// 从叶子层向上找第一个还要处理的脏节点
fn pick_start(pos: &FlushPos<'_>) -> Result<Option<JnodeRef>> {
    retry(|| {
        let atom = pos.atom()?;
        let ai = lock_valid(&atom)?;
        Ok(ai.first_dirty(|n| {
            !n.state().intersects(
                JnodeState::FLUSH_QUEUED | JnodeState::WRITEBACK | JnodeState::HEARD_BANSHEE,
            )
        }))
    })
}

fn flush_from(pos: &mut FlushPos<'_>, start: JnodeRef) -> Result<()> {
    if start.state().is_decided() {
        return relocate::requeue(pos, &start);
    }
    let tree = pos.mgr.tree.clone();
    let linked = start.kind().in_tree()
        && (tree.parent(&start).is_some() || tree.root().map_or(false, |r| Arc::ptr_eq(&r, &start)));
    if !linked {
        return relocate::allocate_detached(pos, &start);
    }

    let scan = scan::scan_slum(pos, &start);
    pos.leaf_relocate = scan.total() >= pos.mgr.config.relocate_threshold;
    if pos.leaf_relocate {
        log::debug!(
            "[FLUSH] slum of {} nodes at jnode {}: relocating leaves",
            scan.total(),
            scan.leftmost.id()
        );
    }
    squalloc::alloc_ancestors(pos, &scan.leftmost)?;
    let preceder = relocate::preceder_for(pos, &scan.leftmost);
    relocate::allocate_node(pos, &scan.leftmost, preceder)?;
    squalloc::squalloc(pos, scan.leftmost)
}

#[cfg(test)]
mod tests {
    use crate::{
        block::{BlockDev, MemDevice},
        fs::TxnFs,
        jnode::{blocknr_is_fake, JnodeState},
        tree::TreeLayer,
        txnmgr::{TxnConfig, TxnMode},
    };
    use std::sync::Arc;

    fn fs_with(config: TxnConfig) -> TxnFs {
        let mem = MemDevice::new(512, 2048);
        let dev = Arc::new(BlockDev::new(mem).unwrap());
        TxnFs::format(&dev).unwrap();
        TxnFs::mount(dev, config).unwrap()
    }

    /// 每个叶子放一个大 item，squeeze 挪不动
    const BIG: [u8; 300] = [0xab; 300];

    #[test]
    fn test_parent_first_order() {
        let fs = fs_with(TxnConfig::default());
        let h = fs.begin_handle(TxnMode::WriteFusing);
        let root = fs.new_root(&h, 2).unwrap();
        let leaves: Vec<_> = (0..3).map(|_| fs.new_child(&h, &root).unwrap()).collect();
        for (i, leaf) in leaves.iter().enumerate() {
            fs.insert_item(&h, leaf, i as u64, &BIG).unwrap();
        }

        let report = fs.flush_some().unwrap().unwrap();
        assert_eq!(report.relocated, 4);
        assert_eq!(report.squeezed, 0);
        assert!(!report.budget_exhausted);

        let mut prev = root.blocknr();
        assert!(!blocknr_is_fake(prev));
        for leaf in &leaves {
            assert!(leaf.blocknr() > prev);
            prev = leaf.blocknr();
        }
        assert!(leaves.iter().all(|l| l.state().contains(JnodeState::RELOC)));
        h.close().unwrap();
    }

    #[test]
    fn test_close_block_is_overwritten() {
        let fs = fs_with(TxnConfig::default());
        let h = fs.begin_handle(TxnMode::WriteFusing);
        let root = fs.new_root(&h, 2).unwrap();
        let a = fs.new_child(&h, &root).unwrap();
        let b = fs.new_child(&h, &root).unwrap();
        fs.insert_item(&h, &a, 1, &BIG).unwrap();
        fs.insert_item(&h, &b, 2, &BIG).unwrap();
        h.request_commit();
        h.close().unwrap();
        let (root_blk, b_blk) = (root.blocknr(), b.blocknr());

        let h = fs.begin_handle(TxnMode::WriteFusing);
        fs.dirty(&h, &root).unwrap();
        fs.insert_item(&h, &b, 3, b"small").unwrap();
        let report = fs.flush_some().unwrap().unwrap();
        assert_eq!(report.overwritten, 2);
        assert_eq!(report.relocated, 0);
        assert!(b.state().contains(JnodeState::OVWR));
        h.request_commit();
        h.close().unwrap();

        assert_eq!(b.blocknr(), b_blk);
        assert_eq!(root.blocknr(), root_blk);
        let stats = fs.last_commit().unwrap();
        assert!(stats.overwrite.contains(&b_blk));
        assert!(stats.wandered.iter().any(|&(orig, _)| orig == b_blk));
    }

    #[test]
    fn test_far_block_is_relocated() {
        let config = TxnConfig {
            relocate_distance: 0,
            ..TxnConfig::default()
        };
        let fs = fs_with(config);
        let h = fs.begin_handle(TxnMode::WriteFusing);
        let root = fs.new_root(&h, 2).unwrap();
        let a = fs.new_child(&h, &root).unwrap();
        let b = fs.new_child(&h, &root).unwrap();
        fs.insert_item(&h, &a, 1, &BIG).unwrap();
        fs.insert_item(&h, &b, 2, &BIG).unwrap();
        h.request_commit();
        h.close().unwrap();
        let old = b.blocknr();

        let h = fs.begin_handle(TxnMode::WriteFusing);
        fs.dirty(&h, &root).unwrap();
        fs.insert_item(&h, &b, 3, b"small").unwrap();
        h.request_commit();
        h.close().unwrap();

        assert_ne!(b.blocknr(), old);
        let stats = fs.last_commit().unwrap();
        assert!(stats.relocated.contains(&b.blocknr()));
        assert!(stats.deleted.contains(&old));
        let alloc = fs.txn_mgr().allocator();
        assert!(alloc.is_committed(b.blocknr()));
        assert!(!alloc.is_committed(old));
    }

    #[test]
    fn test_clean_parent_forces_overwrite() {
        let config = TxnConfig {
            relocate_distance: 0,
            ..TxnConfig::default()
        };
        let fs = fs_with(config);
        let h = fs.begin_handle(TxnMode::WriteFusing);
        let root = fs.new_root(&h, 2).unwrap();
        let a = fs.new_child(&h, &root).unwrap();
        let b = fs.new_child(&h, &root).unwrap();
        fs.insert_item(&h, &a, 1, &BIG).unwrap();
        fs.insert_item(&h, &b, 2, &BIG).unwrap();
        h.request_commit();
        h.close().unwrap();
        let old = b.blocknr();

        // 父节点没有被修改，不能重定位
        let h = fs.begin_handle(TxnMode::WriteFusing);
        fs.insert_item(&h, &b, 3, b"small").unwrap();
        h.request_commit();
        h.close().unwrap();
        assert_eq!(b.blocknr(), old);
        assert!(fs.last_commit().unwrap().overwrite.contains(&old));
    }

    #[test]
    fn test_large_slum_relocates_leaves() {
        let config = TxnConfig {
            relocate_threshold: 2,
            ..TxnConfig::default()
        };
        let fs = fs_with(config);
        let h = fs.begin_handle(TxnMode::WriteFusing);
        let root = fs.new_root(&h, 2).unwrap();
        let a = fs.new_child(&h, &root).unwrap();
        let b = fs.new_child(&h, &root).unwrap();
        fs.insert_item(&h, &a, 1, &BIG).unwrap();
        fs.insert_item(&h, &b, 2, &BIG).unwrap();
        h.request_commit();
        h.close().unwrap();
        let (old_a, old_b) = (a.blocknr(), b.blocknr());

        let h = fs.begin_handle(TxnMode::WriteFusing);
        fs.dirty(&h, &root).unwrap();
        fs.insert_item(&h, &a, 3, b"x").unwrap();
        fs.insert_item(&h, &b, 4, b"y").unwrap();
        let report = fs.flush_some().unwrap().unwrap();
        assert_eq!(report.relocated, 2);
        assert_eq!(report.overwritten, 1);
        h.close().unwrap();
        assert_ne!(a.blocknr(), old_a);
        assert_ne!(b.blocknr(), old_b);
        assert!(a.blocknr() < b.blocknr());
    }

    #[test]
    fn test_squeeze_deletes_emptied_leaf() {
        let fs = fs_with(TxnConfig::default());
        let h = fs.begin_handle(TxnMode::WriteFusing);
        let root = fs.new_root(&h, 2).unwrap();
        let a = fs.new_child(&h, &root).unwrap();
        let b = fs.new_child(&h, &root).unwrap();
        fs.insert_item(&h, &a, 1, b"one").unwrap();
        fs.insert_item(&h, &b, 2, b"two").unwrap();

        let report = fs.flush_some().unwrap().unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.squeezed, 1);
        assert!(!fs.tree().contains(&b));
        assert!(b.state().contains(JnodeState::HEARD_BANSHEE));
        assert_eq!(fs.tree().leaf_items(&a).len(), 2);
        assert!(fs.tree().right_neighbor(&a).is_none());
        h.close().unwrap();
        fs.sync().unwrap();
        assert_eq!(fs.tree().all_leaf_items().len(), 2);
    }

    #[test]
    fn test_budget_is_reported() {
        let config = TxnConfig {
            flush_batch: 2,
            ..TxnConfig::default()
        };
        let fs = fs_with(config);
        let h = fs.begin_handle(TxnMode::WriteFusing);
        let root = fs.new_root(&h, 2).unwrap();
        for i in 0..3 {
            let leaf = fs.new_child(&h, &root).unwrap();
            fs.insert_item(&h, &leaf, i, &BIG).unwrap();
        }
        let report = fs.flush_some().unwrap().unwrap();
        assert_eq!(report.prepped, 2);
        assert!(report.budget_exhausted);

        // 剩下两个叶子；重定位让已写出的根又变脏
        let report = fs.flush_some().unwrap().unwrap();
        assert_eq!(report.prepped, 2);
        assert!(report.budget_exhausted);

        let report = fs.flush_some().unwrap().unwrap();
        assert_eq!(report.prepped, 0);
        assert_eq!(report.written, 1);
        assert!(!report.budget_exhausted);
        assert!(fs.flush_some().unwrap().is_none());
        h.close().unwrap();
    }
}
