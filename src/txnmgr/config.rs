//! 事务管理器配置

use crate::consts::*;
use std::time::Duration;

/// 事务管理器和 flush 引擎的可调参数
#[derive(Debug, Clone, Copy)]
pub struct TxnConfig {
    /// capture_count 超过此值时 atom 应该提交
    pub atom_max_size: usize,
    /// atom 存活超过此时间时应该提交
    pub atom_max_age: Duration,
    /// 每个 atom 的并发 flusher 上限
    pub atom_max_flushers: u32,
    /// 脏区节点数达到此值时无条件重定位叶子
    pub relocate_threshold: usize,
    /// 与 preceder 的距离不超过此值时保持原位置
    pub relocate_distance: u64,
    /// 左右扫描的节点数上限
    pub scan_maxnodes: usize,
    /// 单次 flush 的节点预算
    pub flush_batch: usize,
    /// 每个 atom 同时只允许一个 flush queue 在写
    pub write_one_stream: bool,
    /// 空闲 jnode 缓存容量
    pub jnode_cache_size: usize,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            atom_max_size: DEFAULT_ATOM_MAX_SIZE,
            atom_max_age: Duration::from_secs(DEFAULT_ATOM_MAX_AGE_SECS),
            atom_max_flushers: DEFAULT_ATOM_MAX_FLUSHERS,
            relocate_threshold: DEFAULT_RELOCATE_THRESHOLD,
            relocate_distance: DEFAULT_RELOCATE_DISTANCE,
            scan_maxnodes: DEFAULT_SCAN_MAXNODES,
            flush_batch: DEFAULT_FLUSH_BATCH,
            write_one_stream: false,
            jnode_cache_size: DEFAULT_JNODE_CACHE_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = TxnConfig::default();
        assert_eq!(c.atom_max_size, 4096);
        assert_eq!(c.atom_max_age, Duration::from_secs(600));
        assert_eq!(c.relocate_threshold, 64);
        assert_eq!(c.relocate_distance, 64);
        assert!(!c.write_one_stream);
    }
}
