//! squeeze-and-allocate
//!
//! 从 slum 左边界出发向右推进：把右邻居的内容挤进当前节点，
//! 再为右邻居分配位置，然后前进一步。
//!
//! 状态：
//!
//! - `OnLeaf`：当前是格式化叶子，叶子之间尽量多地合并 item
//! - `OnInternal`：当前是上层节点，一次移动一个单元，移动了子树指针就先分配子树
//! - `OnEpoint`：当前是 extent 指向的数据节点，只分配不挤压
//! - `EndOfTwig`：右邻居在另一个父节点下，先挤压两个父节点
//! - `ToTwig`：进入新的父节点，先按 parent-first 分配它的祖先

use super::{
    pos::FlushPos,
    relocate::{allocate_node, preceder_for},
};
use crate::{
    consts::LEAF_LEVEL,
    error::Result,
    jnode::JnodeRef,
    tree::SqueezeResult,
};
use std::sync::Arc;

#[derive(Debug)]
enum Squalloc {
    OnLeaf(JnodeRef),
    OnInternal(JnodeRef),
    OnEpoint(JnodeRef),
    EndOfTwig { left: JnodeRef, right: JnodeRef },
    ToTwig(JnodeRef),
}

fn state_for(node: JnodeRef) -> Squalloc {
    if node.kind().is_unformatted() {
        Squalloc::OnEpoint(node)
    } else if node.level() == LEAF_LEVEL {
        Squalloc::OnLeaf(node)
    } else {
        Squalloc::OnInternal(node)
    }
}

/// 按 parent-first 顺序分配节点的所有未决定祖先（从上往下）
pub(super) fn alloc_ancestors(pos: &mut FlushPos<'_>, node: &JnodeRef) -> Result<()> {
    let Some(parent) = pos.mgr.tree.parent(node) else {
        return Ok(());
    };
    if !pos.flushable(&parent) {
        return Ok(());
    }
    alloc_ancestors(pos, &parent)?;
    let preceder = preceder_for(pos, &parent);
    allocate_node(pos, &parent, preceder)
}

fn same_parent(pos: &FlushPos<'_>, a: &JnodeRef, b: &JnodeRef) -> bool {
    let tree = &pos.mgr.tree;
    match (tree.parent(a), tree.parent(b)) {
        (Some(x), Some(y)) => Arc::ptr_eq(&x, &y),
        (None, None) => true,
        _ => false,
    }
}

/// 把 `right` 挤进 `left`，直到挤不动
fn squeeze_pair(pos: &mut FlushPos<'_>, left: &JnodeRef, right: &JnodeRef) -> Result<()> {
    if !left.kind().is_formatted() || !right.kind().is_formatted() || left.level() != right.level() {
        return Ok(());
    }
    if !pos.dirty_in_atom(left) || !pos.dirty_in_atom(right) {
        return Ok(());
    }
    let tree = pos.mgr.tree.clone();
    // 删除右节点会修改它的父节点
    let allow_delete = tree.parent(right).map_or(false, |p| pos.dirty_in_atom(&p));
    loop {
        match tree.squeeze(left, right, allow_delete)? {
            SqueezeResult::Nothing => return Ok(()),
            SqueezeResult::Moved { items } => pos.report.squeezed += items,
            SqueezeResult::SubtreeMoved(child) => {
                pos.report.squeezed += 1;
                // 子树现在挂在已分配的 left 下面，先处理它
                let saved = pos.preceder;
                let preceder = preceder_for(pos, &child);
                allocate_node(pos, &child, preceder)?;
                pos.preceder = saved;
                if tree.parent(right).is_none() {
                    // 最后一棵子树移走后右节点已从树中摘下
                    pos.report.deleted += 1;
                    log::debug!("[FLUSH] jnode {} emptied by subtree move", right.id());
                    pos.mgr.discard(right)?;
                    return Ok(());
                }
            }
            SqueezeResult::RightEmptied => {
                pos.report.squeezed += 1;
                pos.report.deleted += 1;
                log::debug!("[FLUSH] jnode {} emptied by squeeze", right.id());
                pos.mgr.discard(right)?;
                return Ok(());
            }
        }
    }
}

/// 下一个要处理的右邻居
fn next_right(pos: &FlushPos<'_>, cur: &JnodeRef) -> Option<JnodeRef> {
    pos.mgr.tree.right_neighbor(cur).filter(|r| pos.flushable(r))
}

fn arrive(pos: &mut FlushPos<'_>, node: JnodeRef) -> Result<Squalloc> {
    let preceder = pos.preceder;
    allocate_node(pos, &node, preceder)?;
    Ok(state_for(node))
}

fn step_right(pos: &mut FlushPos<'_>, cur: JnodeRef, right: JnodeRef) -> Result<Squalloc> {
    if same_parent(pos, &cur, &right) {
        arrive(pos, right)
    } else {
        Ok(Squalloc::EndOfTwig { left: cur, right })
    }
}

/// 从已分配的 `start` 出发沿同层向右推进
pub(super) fn squalloc(pos: &mut FlushPos<'_>, start: JnodeRef) -> Result<()> {
    let mut state = state_for(start);
    loop {
        if !pos.budget_left() {
            pos.report.budget_exhausted = true;
            return Ok(());
        }
        state = match state {
            Squalloc::OnLeaf(cur) | Squalloc::OnInternal(cur) => {
                if let Some(right) = pos.mgr.tree.right_neighbor(&cur) {
                    squeeze_pair(pos, &cur, &right)?;
                }
                match next_right(pos, &cur) {
                    Some(right) => step_right(pos, cur, right)?,
                    None => return Ok(()),
                }
            }
            Squalloc::OnEpoint(cur) => match next_right(pos, &cur) {
                Some(right) => step_right(pos, cur, right)?,
                None => return Ok(()),
            },
            Squalloc::EndOfTwig { left, right } => {
                let tree = pos.mgr.tree.clone();
                if let (Some(lp), Some(rp)) = (tree.parent(&left), tree.parent(&right)) {
                    if !Arc::ptr_eq(&lp, &rp) {
                        squeeze_pair(pos, &lp, &rp)?;
                    }
                }
                if !pos.flushable(&right) && !pos.dirty_in_atom(&right) {
                    // 右邻居在挤压中被处理掉了
                    match next_right(pos, &left) {
                        Some(r) => Squalloc::EndOfTwig { left, right: r },
                        None => return Ok(()),
                    }
                } else if same_parent(pos, &left, &right) {
                    arrive(pos, right)?
                } else {
                    Squalloc::ToTwig(right)
                }
            }
            Squalloc::ToTwig(right) => {
                alloc_ancestors(pos, &right)?;
                arrive(pos, right)?
            }
        };
    }
}
