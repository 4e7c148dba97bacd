//! jnode 状态位

use bitflags::bitflags;

bitflags! {
    /// jnode 状态标志
    ///
    /// 事务相关的位（`DIRTY` 以外）在节点离开 atom 时全部清除
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct JnodeState: u16 {
        /// 内容已修改
        const DIRTY         = 0x0001;
        /// 本事务中决定重定位（写到新块）
        const RELOC         = 0x0002;
        /// 本事务中决定原地覆盖（经由 wandering log）
        const OVWR          = 0x0004;
        /// 新创建，块号是假块号
        const CREATED       = 0x0008;
        /// 在 flush queue 的 prepped 链表上
        const FLUSH_QUEUED  = 0x0010;
        /// 写 I/O 进行中
        const WRITEBACK     = 0x0020;
        /// 等待删除
        const HEARD_BANSHEE = 0x0040;
        /// 读锁时跳过了 capture，之后需要检查锁持有者
        const MISSED        = 0x0080;
        /// 已为 overwrite 预留了一个日志块
        const LOG_RESERVED  = 0x0100;
        /// 数据已从磁盘加载或已初始化
        const LOADED        = 0x0200;
    }
}

impl JnodeState {
    /// 离开 atom 时清除的位
    pub const TXN_BITS: JnodeState = JnodeState::RELOC
        .union(JnodeState::OVWR)
        .union(JnodeState::FLUSH_QUEUED)
        .union(JnodeState::WRITEBACK)
        .union(JnodeState::MISSED)
        .union(JnodeState::LOG_RESERVED);

    /// 是否已经做过 relocate / overwrite 决定
    ///
    /// 干净的节点也视为 prepped：它不需要 flush
    pub fn is_flush_prepped(self) -> bool {
        !self.contains(JnodeState::DIRTY) || self.intersects(JnodeState::RELOC | JnodeState::OVWR)
    }

    /// 是否已经决定了位置（relocate 或 overwrite 之一）
    pub fn is_decided(self) -> bool {
        self.intersects(JnodeState::RELOC | JnodeState::OVWR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_prepped_predicate() {
        assert!(JnodeState::empty().is_flush_prepped());
        assert!(!JnodeState::DIRTY.is_flush_prepped());
        assert!((JnodeState::DIRTY | JnodeState::RELOC).is_flush_prepped());
        assert!((JnodeState::DIRTY | JnodeState::OVWR).is_flush_prepped());
        assert!(!(JnodeState::DIRTY | JnodeState::CREATED).is_flush_prepped());
    }

    #[test]
    fn test_txn_bits_keep_dirty() {
        let s = JnodeState::DIRTY | JnodeState::RELOC | JnodeState::WRITEBACK | JnodeState::CREATED;
        let cleared = s - JnodeState::TXN_BITS;
        assert_eq!(cleared, JnodeState::DIRTY | JnodeState::CREATED);
    }
}
