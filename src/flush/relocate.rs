//! relocate / overwrite 决定
//!
//! 规则（按顺序）：
//!
//! 1. 新建节点总是重定位
//! 2. 不在树中的节点和根节点覆盖写
//! 3. 父节点不是同一 atom 中的脏节点时覆盖写，flush 不会弄脏已经处理过的父节点
//! 4. 本 slum 足够大时叶子层无条件重定位
//! 5. 没有 preceder 时重定位
//! 6. 与 preceder 的距离不超过 `relocate_distance` 时覆盖写，否则在 preceder 之后分配新块
//!
//! 覆盖写的节点进入 atom 的 overwrite 链表，由 wandering log 写出；
//! 重定位的节点进入 flush queue，旧块号进入 delete set，父节点指针随之更新。

use super::pos::{real_blocknr, FlushPos};
use crate::{
    balloc::BlockRange,
    blocknr_set::BlocknrSetEntry,
    error::{retry, Result},
    jnode::{JnodeRef, JnodeState},
    txnmgr::{lock::lock_with_atom, AtomList},
};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Overwrite,
    Relocate { hint: u64 },
}

/// 按 parent-first 顺序，节点的默认 preceder：左边的兄弟，没有时为父节点
pub(super) fn preceder_for(pos: &FlushPos<'_>, node: &JnodeRef) -> u64 {
    let tree = &pos.mgr.tree;
    let Some(parent) = tree.parent(node) else {
        return 0;
    };
    match tree.left_neighbor(node) {
        Some(left) if tree.parent(&left).map_or(false, |p| Arc::ptr_eq(&p, &parent)) => {
            real_blocknr(left.blocknr())
        }
        _ => real_blocknr(parent.blocknr()),
    }
}

fn decide(pos: &FlushPos<'_>, node: &JnodeRef, preceder: u64) -> Decision {
    let tree = &pos.mgr.tree;
    let cfg = pos.mgr.config;
    let state = node.state();
    let hint = preceder + 1;
    if state.contains(JnodeState::CREATED) {
        return Decision::Relocate { hint };
    }
    let parent = tree.parent(node);
    let is_root = tree.root().map_or(false, |r| Arc::ptr_eq(&r, node));
    if !node.kind().in_tree() || is_root {
        return Decision::Overwrite;
    }
    let Some(parent) = parent else {
        return Decision::Overwrite;
    };
    if !pos.dirty_in_atom(&parent) {
        return Decision::Overwrite;
    }
    if pos.leaf_relocate && node.kind().is_leaf() {
        return Decision::Relocate { hint };
    }
    if preceder == 0 {
        return Decision::Relocate { hint };
    }
    if node.blocknr().abs_diff(preceder) <= cfg.relocate_distance {
        Decision::Overwrite
    } else {
        Decision::Relocate { hint }
    }
}

/// 为节点做 relocate / overwrite 决定
///
/// 已经决定过的节点只更新 preceder（脏的重定位节点重新排队）
pub(super) fn allocate_node(pos: &mut FlushPos<'_>, node: &JnodeRef, preceder: u64) -> Result<()> {
    if !pos.flushable(node) {
        requeue(pos, node)?;
        let b = real_blocknr(node.blocknr());
        if b != 0 {
            pos.preceder = b;
        }
        return Ok(());
    }
    match decide(pos, node, preceder) {
        Decision::Overwrite => overwrite(pos, node)?,
        Decision::Relocate { hint } => {
            let created = node.state().contains(JnodeState::CREATED);
            match pos.mgr.alloc.alloc_near(hint, 1, false) {
                Ok(range) => relocate(pos, node, range.start)?,
                Err(e) if created => return Err(e),
                Err(_) => {
                    log::warn!(
                        "[FLUSH] no block near {:#x} for jnode {}, keeping it in place",
                        hint,
                        node.id()
                    );
                    overwrite(pos, node)?;
                }
            }
        }
    }
    pos.report.prepped += 1;
    let b = real_blocknr(node.blocknr());
    if b != 0 {
        pos.preceder = b;
    }
    Ok(())
}

/// 已决定重定位、又被弄脏的节点重新进入 flush queue
pub(super) fn requeue(pos: &mut FlushPos<'_>, node: &JnodeRef) -> Result<()> {
    let atom = pos.atom()?;
    let queued = retry(|| {
        let mut keep = None;
        let locked = lock_with_atom(&**node, &mut keep)?;
        let (Some(mut ai), mut jg) = (locked.atom, locked.inner) else {
            return Ok(false);
        };
        let mine = jg.atom.as_ref().map_or(false, |a| Arc::ptr_eq(a, &atom));
        let s = jg.state;
        if !mine
            || !s.contains(JnodeState::RELOC | JnodeState::DIRTY)
            || s.intersects(JnodeState::FLUSH_QUEUED | JnodeState::WRITEBACK | JnodeState::HEARD_BANSHEE)
        {
            return Ok(false);
        }
        pos.fq.queue_locked(&mut ai, node, &mut jg);
        Ok(true)
    })?;
    if queued {
        log::trace!("[FLUSH] jnode {} re-queued at {:#x}", node.id(), node.blocknr());
    }
    Ok(())
}

fn overwrite(pos: &mut FlushPos<'_>, node: &JnodeRef) -> Result<()> {
    let mgr = pos.mgr;
    retry(|| {
        let mut keep = None;
        let locked = lock_with_atom(&**node, &mut keep)?;
        let (Some(mut ai), mut jg) = (locked.atom, locked.inner) else {
            return Ok(());
        };
        jg.state.insert(JnodeState::OVWR);
        if !jg.state.contains(JnodeState::LOG_RESERVED) && mgr.alloc.grab(1).is_ok() {
            jg.state.insert(JnodeState::LOG_RESERVED);
            ai.log_reserved += 1;
        }
        ai.relink(node, &mut jg, AtomList::Overwrite);
        Ok(())
    })?;
    pos.report.overwritten += 1;
    log::trace!("[FLUSH] jnode {} overwrite at {:#x}", node.id(), node.blocknr());
    Ok(())
}

fn relocate(pos: &mut FlushPos<'_>, node: &JnodeRef, new_blocknr: u64) -> Result<()> {
    let mgr = pos.mgr;
    let fq = pos.fq.clone();
    let mut prealloc = None;
    let old = retry(|| {
        if prealloc.is_none() {
            prealloc = Some(BlocknrSetEntry::new_boxed());
        }
        let mut keep = None;
        let locked = lock_with_atom(&**node, &mut keep)?;
        let (Some(mut ai), mut jg) = (locked.atom, locked.inner) else {
            return Ok(None);
        };
        let old = jg.blocknr;
        if real_blocknr(old) != 0 {
            ai.delete_set.add_single(old, &mut prealloc)?;
        }
        jg.blocknr = new_blocknr;
        jg.state.insert(JnodeState::RELOC);
        jg.state.remove(JnodeState::CREATED);
        fq.queue_locked(&mut ai, node, &mut jg);
        Ok(Some(old))
    });
    let old = match old {
        Ok(Some(old)) => old,
        Ok(None) => {
            // 节点已离开 atom
            mgr.alloc.dealloc(BlockRange::single(new_blocknr))?;
            return Ok(());
        }
        Err(e) => {
            let _ = mgr.alloc.dealloc(BlockRange::single(new_blocknr));
            return Err(e);
        }
    };

    mgr.jnodes.rehash(node, old, new_blocknr);
    mgr.tree.update_pointer(node)?;
    if let Some(parent) = mgr.tree.parent(node) {
        let atom = pos.atom()?;
        mgr.capture_into(&atom, &parent)?;
    }
    pos.report.relocated += 1;
    log::trace!(
        "[FLUSH] jnode {} relocated {:#x} -> {:#x}",
        node.id(),
        old,
        new_blocknr
    );
    Ok(())
}

/// 不在树中的节点（位图、日志类、孤立节点）单独决定
pub(super) fn allocate_detached(pos: &mut FlushPos<'_>, node: &JnodeRef) -> Result<()> {
    let hint = pos.mgr.alloc.first_data_block();
    if real_blocknr(node.blocknr()) == 0 {
        let range = pos.mgr.alloc.alloc_near(hint, 1, false)?;
        relocate(pos, node, range.start)?;
    } else {
        overwrite(pos, node)?;
    }
    pos.report.prepped += 1;
    Ok(())
}
