//! slum 扫描
//!
//! 从起点沿同层邻居向左、向右数连续的可 flush 节点，数量受 `scan_maxnodes` 限制。

use super::pos::FlushPos;
use crate::jnode::JnodeRef;

/// 扫描结果
#[derive(Debug)]
pub(super) struct Scan {
    /// slum 的左边界
    pub(super) leftmost: JnodeRef,
    /// 起点左边的节点数
    pub(super) left: usize,
    /// 起点右边的节点数
    pub(super) right: usize,
}

impl Scan {
    pub(super) fn total(&self) -> usize {
        self.left + self.right + 1
    }
}

fn walk(pos: &FlushPos<'_>, start: &JnodeRef, right: bool, limit: usize) -> (JnodeRef, usize) {
    let tree = &pos.mgr.tree;
    let mut cur = start.clone();
    let mut count = 0;
    while count < limit {
        let next = if right {
            tree.right_neighbor(&cur)
        } else {
            tree.left_neighbor(&cur)
        };
        match next {
            Some(n) if pos.flushable(&n) => {
                cur = n;
                count += 1;
            }
            _ => break,
        }
    }
    (cur, count)
}

/// 确定 slum 范围
///
/// 左边数到的节点已经够多时不再向右扫描
pub(super) fn scan_slum(pos: &FlushPos<'_>, start: &JnodeRef) -> Scan {
    let cfg = pos.mgr.config;
    let (leftmost, left) = walk(pos, start, false, cfg.scan_maxnodes);
    let right = if left + 1 < cfg.relocate_threshold {
        walk(pos, start, true, cfg.scan_maxnodes).1
    } else {
        0
    };
    log::trace!(
        "[FLUSH] slum around jnode {}: {} left, {} right",
        start.id(),
        left,
        right
    );
    Scan { leftmost, left, right }
}
