//! jnode 类型
//!
//! 不同类型的 jnode 在以下几个方面行为不同，由 [`JnodeOps`] 描述：
//!
//! - `mapping`：所属的地址空间（哪一棵树 / 哪个对象）
//! - `index`：地址空间中的下标
//! - `init`：新建时数据如何初始化
//! - `clone`：生成同类型的新节点（重定位时不需要，删除重建时使用）

use crate::consts::LEAF_LEVEL;

/// jnode 所在的地址空间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Mapping {
    /// 树节点，按块号索引
    Tree,
    /// 对象数据，按 (oid, 页号) 索引
    Object(u64),
    /// 位图块
    Bitmap,
    /// 日志和格式相关的固定块
    Log,
    /// 内嵌在其他元数据中的节点
    Inline(u64),
}

/// jnode 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JnodeKind {
    /// 格式化的树节点
    Formatted {
        /// 树层级（叶子为 1）
        level: u8,
    },
    /// 非格式化数据节点（extent 指向的数据块）
    Unformatted {
        /// 所属对象
        oid: u64,
        /// 对象内页号
        index: u64,
    },
    /// 位图块
    Bitmap {
        /// 位图块序号
        index: u64,
    },
    /// 日志头类节点（format super block、wander record）
    LogHead,
    /// 内嵌节点
    Inline {
        /// 所属对象
        oid: u64,
    },
}

/// 因类型而异的操作
pub trait JnodeOps {
    /// 地址空间
    fn mapping(&self) -> Mapping;
    /// 地址空间中的下标；`blocknr` 是当前块号
    fn index(&self, blocknr: u64) -> u64;
    /// 初始化一个新节点的数据
    fn init(&self, block_size: usize) -> Vec<u8>;
    /// 同类型的新节点类型
    fn clone_kind(&self) -> JnodeKind;
}

impl JnodeOps for JnodeKind {
    fn mapping(&self) -> Mapping {
        match *self {
            JnodeKind::Formatted { .. } => Mapping::Tree,
            JnodeKind::Unformatted { oid, .. } => Mapping::Object(oid),
            JnodeKind::Bitmap { .. } => Mapping::Bitmap,
            JnodeKind::LogHead => Mapping::Log,
            JnodeKind::Inline { oid } => Mapping::Inline(oid),
        }
    }

    fn index(&self, blocknr: u64) -> u64 {
        match *self {
            JnodeKind::Unformatted { index, .. } => index,
            JnodeKind::Bitmap { index } => index,
            JnodeKind::Inline { .. } => 0,
            JnodeKind::Formatted { .. } | JnodeKind::LogHead => blocknr,
        }
    }

    fn init(&self, block_size: usize) -> Vec<u8> {
        let mut data = vec![0u8; block_size];
        // 格式化节点的第一个字节是层级，空节点也要能被解析
        if let JnodeKind::Formatted { level } = *self {
            data[0] = level;
        }
        data
    }

    fn clone_kind(&self) -> JnodeKind {
        *self
    }
}

impl JnodeKind {
    /// 在 atom 脏链表中使用的层级
    ///
    /// 非格式化节点和叶子同层，其余非树节点都归到叶子层
    pub fn level(&self) -> u8 {
        match *self {
            JnodeKind::Formatted { level } => level,
            _ => LEAF_LEVEL,
        }
    }

    /// 是否为格式化树节点
    pub fn is_formatted(&self) -> bool {
        matches!(self, JnodeKind::Formatted { .. })
    }

    /// 是否为非格式化数据节点
    pub fn is_unformatted(&self) -> bool {
        matches!(self, JnodeKind::Unformatted { .. })
    }

    /// 是否为叶子层节点（格式化叶子或数据节点）
    pub fn is_leaf(&self) -> bool {
        match *self {
            JnodeKind::Formatted { level } => level == LEAF_LEVEL,
            JnodeKind::Unformatted { .. } => true,
            _ => false,
        }
    }

    /// 是否属于树（flush 引擎会处理的节点）
    pub fn in_tree(&self) -> bool {
        self.is_formatted() || self.is_unformatted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_ops() {
        let leaf = JnodeKind::Formatted { level: 1 };
        assert_eq!(leaf.mapping(), Mapping::Tree);
        assert_eq!(leaf.index(77), 77);
        assert_eq!(leaf.init(16)[0], 1);
        assert!(leaf.is_leaf() && leaf.in_tree());

        let unf = JnodeKind::Unformatted { oid: 9, index: 3 };
        assert_eq!(unf.mapping(), Mapping::Object(9));
        assert_eq!(unf.index(1234), 3);
        assert_eq!(unf.level(), LEAF_LEVEL);

        let bm = JnodeKind::Bitmap { index: 2 };
        assert!(!bm.in_tree());
        assert_eq!(bm.clone_kind(), bm);
        assert_eq!(JnodeKind::Inline { oid: 5 }.mapping(), Mapping::Inline(5));
        assert_eq!(JnodeKind::LogHead.init(8), vec![0u8; 8]);
    }
}
