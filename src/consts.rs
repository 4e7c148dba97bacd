//! 常量定义
//!
//! 这个模块包含了：
//! - 磁盘布局相关常量（固定块位置、magic 字符串）
//! - wandering log 磁盘结构大小
//! - 树层级常量
//! - 可调参数的默认值

//=============================================================================
// 基础常量
//=============================================================================

/// 最小块大小（512 字节）
///
/// 必须能放下 tx head 和至少一个 wander 条目
pub const MIN_BLOCK_SIZE: u32 = 512;

/// 最大块大小（65536 字节）
pub const MAX_BLOCK_SIZE: u32 = 65536;

/// 假块号标志位
///
/// 新创建、尚未分配磁盘位置的节点使用带此位的块号。
pub const FAKE_BLOCKNR_BIT: u64 = 1 << 63;

//=============================================================================
// 磁盘布局
//=============================================================================

/// 保留块（永不分配，也保证 0 可以作为 wander 条目的终止标记）
pub const RESERVED_BLOCK: u64 = 0;

/// 格式 super block 位置
pub const FORMAT_SUPER_BLOCK: u64 = 1;

/// Journal header 位置
pub const JOURNAL_HEADER_BLOCK: u64 = 2;

/// Journal footer 位置
pub const JOURNAL_FOOTER_BLOCK: u64 = 3;

/// 第一个位图块位置
pub const FIRST_BITMAP_BLOCK: u64 = 4;

/// 格式 super block magic
pub const FORMAT_MAGIC: &[u8; 8] = b"CoWFs001";

/// 格式 super block 有效内容大小（字节）
pub const FORMAT_SUPER_SIZE: usize = 56;

/// mkfs 后第一个可分配的对象 id
pub const FIRST_OID: u64 = 0x10000;

//=============================================================================
// Wandering log
//=============================================================================

/// Transaction head magic
pub const TX_HEADER_MAGIC: &[u8; 8] = b"TxMagic4";

/// Wander record magic
pub const WANDER_RECORD_MAGIC: &[u8; 8] = b"LogMagc4";

/// Journal header 大小（字节）
pub const JOURNAL_HEADER_SIZE: usize = 8;

/// Journal footer 大小（字节）
pub const JOURNAL_FOOTER_SIZE: usize = 32;

/// Transaction head 大小（字节）
pub const TX_HEADER_SIZE: usize = 64;

/// Wander record 头部大小（字节）
pub const WANDER_RECORD_HEADER_SIZE: usize = 32;

/// 单个 wander 条目 `{original, wandered}` 大小（字节）
pub const WANDER_ENTRY_SIZE: usize = 16;

//=============================================================================
// 树层级
//=============================================================================

/// 叶子层（格式化叶节点和非格式化数据节点都挂在这一层的脏链表上）
pub const LEAF_LEVEL: u8 = 1;

/// Twig 层（含 extent 的层）
pub const TWIG_LEVEL: u8 = 2;

/// 树的最大高度
pub const MAX_TREE_HEIGHT: u8 = 8;

//=============================================================================
// 默认可调参数
//=============================================================================

/// atom 捕获节点数超过此值时应该提交
pub const DEFAULT_ATOM_MAX_SIZE: usize = 4096;

/// atom 存活超过此秒数时应该提交
pub const DEFAULT_ATOM_MAX_AGE_SECS: u64 = 600;

/// 每个 atom 的并发 flusher 上限
pub const DEFAULT_ATOM_MAX_FLUSHERS: u32 = 1;

/// 脏区大小达到此值时无条件重定位叶节点
pub const DEFAULT_RELOCATE_THRESHOLD: usize = 64;

/// 与 preceder 距离在此范围内时保持原位置（overwrite）
pub const DEFAULT_RELOCATE_DISTANCE: u64 = 64;

/// 左/右扫描的节点数上限
pub const DEFAULT_SCAN_MAXNODES: usize = 10000;

/// 单次 flush 调用的节点预算
pub const DEFAULT_FLUSH_BATCH: usize = 2048;

/// 空闲 jnode 驻留缓存容量
pub const DEFAULT_JNODE_CACHE_SIZE: usize = 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_structure_sizes() {
        // tx head: magic(8) id(8) total(4) pad(4) prev(8) next(8) free(8) files(8) oid(8)
        assert_eq!(TX_HEADER_SIZE, 8 + 8 + 4 + 4 + 8 + 8 + 8 + 8 + 8);
        // wander record: magic(8) id(8) total(4) serial(4) next(8)
        assert_eq!(WANDER_RECORD_HEADER_SIZE, 8 + 8 + 4 + 4 + 8);
        assert!(TX_HEADER_SIZE <= MIN_BLOCK_SIZE as usize);
    }

    #[test]
    fn test_fixed_blocks_are_distinct() {
        let fixed = [
            RESERVED_BLOCK,
            FORMAT_SUPER_BLOCK,
            JOURNAL_HEADER_BLOCK,
            JOURNAL_FOOTER_BLOCK,
            FIRST_BITMAP_BLOCK,
        ];
        for (i, a) in fixed.iter().enumerate() {
            for b in &fixed[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
