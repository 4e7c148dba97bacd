//! 树层协作接口
//!
//! flush 引擎只通过 [`TreeLayer`] 看树：父节点、同层邻居、最左子节点、
//! 节点内的单元，以及把右邻居内容挤进左节点的 squeeze 原语。
//! 键比较、节点分裂、item 内容解释都在实现方内部。
//!
//! 叶子层（层级 1）同时包含格式化叶节点和 extent 指向的非格式化数据节点，
//! 它们按键序排成一排，邻居关系跨越两种节点。
//!
//! 实现方的锁在 atom 锁之外：调用 [`TreeLayer`] 的方法时不能持有
//! atom / jnode 锁。

mod mem;
mod node;

pub use mem::MemTree;
pub use node::{NodeItem, NODE_HEADER_SIZE};

use crate::{error::Result, jnode::JnodeRef};

/// 节点中的一个 item（flush 视角）
#[derive(Debug, Clone)]
pub enum TreeItem {
    /// 指向格式化子节点的指针
    Internal(JnodeRef),
    /// extent：一串非格式化数据节点
    Extent(Vec<JnodeRef>),
    /// 叶子 item，不含子节点
    Leaf,
}

/// squeeze 的结果
#[derive(Debug, Clone)]
pub enum SqueezeResult {
    /// 左节点放不下任何东西
    Nothing,
    /// 移动了若干 item，右节点仍非空
    Moved {
        /// 移动的 item 数
        items: usize,
    },
    /// 移动了一个子树指针，移动到此为止
    ///
    /// 右节点因此变空且允许删除时，它同时已从树中摘下
    SubtreeMoved(JnodeRef),
    /// 右节点被清空并从树中删除
    RightEmptied,
}

/// 树层
pub trait TreeLayer: Send + Sync {
    /// 根节点
    fn root(&self) -> Option<JnodeRef>;

    /// 树高（空树为 0）
    fn height(&self) -> u8;

    /// 父节点；根没有父节点
    fn parent(&self, node: &JnodeRef) -> Option<JnodeRef>;

    /// 同层左邻居
    fn left_neighbor(&self, node: &JnodeRef) -> Option<JnodeRef>;

    /// 同层右邻居
    fn right_neighbor(&self, node: &JnodeRef) -> Option<JnodeRef>;

    /// 最左子节点（格式化或非格式化）
    fn leftmost_child(&self, node: &JnodeRef) -> Option<JnodeRef>;

    /// 节点的 item
    fn items(&self, node: &JnodeRef) -> Vec<TreeItem>;

    /// 子节点在父节点所有单元中的位置（extent 的每个数据块算一个单元）
    fn child_position(&self, parent: &JnodeRef, child: &JnodeRef) -> Option<usize>;

    /// 把 `right` 的内容尽量挤进 `left`
    ///
    /// 叶子层尽可能多地移动 item；上层一次移动一个单元，移动了子树指针就停下，
    /// 让调用者先处理被移动的子树。`allow_delete` 为假时右节点不会被删除。
    fn squeeze(&self, left: &JnodeRef, right: &JnodeRef, allow_delete: bool) -> Result<SqueezeResult>;

    /// 子节点块号变了，更新父节点（或根位置）中的指针
    fn update_pointer(&self, child: &JnodeRef) -> Result<()>;
}
