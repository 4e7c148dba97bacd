//! Wandering log
//!
//! 写前日志：overwrite set 的每个节点先写到一个临时的“漂移”位置，
//! 再由 journal header 的一次写标记提交，之后才写回原位置。
//!
//! # 提交步骤
//!
//! 1. 收集 overwrite set，pin 住数据
//! 2. 计算需要的 wander record 数（加一个 tx head）
//! 3. 为 record 和每个漂移位置分配空闲块
//! 4. 构造 `original → wandered` 映射，写进 record；tx head 另外记录
//!    前一个事务和计数器快照
//! 5. 写 record 和漂移副本，等待完成
//! 6. 更新 journal header（提交点）
//! 7. 把 overwrite set 写回原位置，等待完成
//! 8. 更新 journal footer（写回完成点）
//! 9. 释放 record 和漂移块
//!
//! 1–6 在 [`write_logs`]，7–9 在 [`write_tx_back`]。挂载时的恢复见 [`replay`]。

pub mod format;
mod commit;
mod replay;

pub(crate) use commit::{release_log_blocks, write_logs, write_tx_back};
pub use replay::{replay, ReplayReport};

use crate::{blocknr_set::BlocknrSet, jnode::JnodeRef, layout::SuperCounters, txnmgr::AtomId};

/// Journal 相关错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalError {
    /// tx head magic 不匹配
    BadTxMagic,
    /// wander record magic 不匹配
    BadRecordMagic,
    /// 事务链断裂（prev_tx 走不到 last_flushed，或块号越界）
    BrokenChain,
    /// record 数量、序号或事务 id 与 tx head 不符
    RecordCount,
    /// 日志块长度不足
    Truncated,
    /// 无法为日志分配块
    NoSpace,
    /// 日志 I/O 失败
    IoError,
}

/// 内存中的 journal 指针
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalState {
    /// header 中的最近提交
    pub last_committed: u64,
    /// footer 中的最近写回
    pub last_flushed: u64,
    /// 下一个事务 id
    pub next_tx_id: u64,
}

impl Default for JournalState {
    fn default() -> Self {
        Self {
            last_committed: 0,
            last_flushed: 0,
            next_tx_id: 1,
        }
    }
}

/// overwrite set 中的一项
#[derive(Debug, Clone)]
pub struct OverwriteEntry {
    /// 节点（已 pin）
    pub node: JnodeRef,
    /// 原位置
    pub original: u64,
    /// 提交时的数据快照
    pub data: Vec<u8>,
}

/// 一次提交的工作状态
#[derive(Debug)]
pub struct CommitHandle {
    /// 提交的 atom
    pub atom_id: AtomId,
    /// overwrite set
    pub overwrite: Vec<OverwriteEntry>,
    /// 计数器快照
    pub counters: SuperCounters,
    /// 可以从预留中扣除的块数
    pub reserved: u64,
    pub(crate) used_reserved: u64,
    /// tx head 和 wander record 的块号（第一个是 tx head）
    pub(crate) tx_blocks: Vec<u64>,
    /// 与 `overwrite` 一一对应的漂移位置
    pub(crate) wandered: Vec<u64>,
    /// `original → wandered`
    pub(crate) wandered_map: BlocknrSet,
    pub(crate) tx_id: u64,
    /// 已尝试写 journal header：之后的失败不能回滚
    pub(crate) header_attempted: bool,
}

impl CommitHandle {
    /// 创建提交状态
    pub fn new(atom_id: AtomId, overwrite: Vec<OverwriteEntry>, counters: SuperCounters, reserved: u64) -> Self {
        Self {
            atom_id,
            overwrite,
            counters,
            reserved,
            used_reserved: 0,
            tx_blocks: Vec::new(),
            wandered: Vec::new(),
            wandered_map: BlocknrSet::new(),
            tx_id: 0,
            header_attempted: false,
        }
    }

    /// tx head 块号
    pub fn tx_head(&self) -> Option<u64> {
        self.tx_blocks.first().copied()
    }

    /// 是否已经越过提交点（journal header 写入已开始）
    pub fn past_commit_point(&self) -> bool {
        self.header_attempted
    }
}

/// 一次成功提交的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitStats {
    /// 提交的 atom
    pub atom_id: AtomId,
    /// 事务 id（没有写日志时为 0）
    pub tx_id: u64,
    /// tx head 块号
    pub tx_head: u64,
    /// overwrite set 的原位置
    pub overwrite: Vec<u64>,
    /// 重定位后的新块号
    pub relocated: Vec<u64>,
    /// `(original, wandered)`
    pub wandered: Vec<(u64, u64)>,
    /// 释放的块
    pub deleted: Vec<u64>,
}
