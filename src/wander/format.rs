//! Wandering log 磁盘格式
//!
//! 所有字段小端序。
//!
//! ```text
//! journal header (块 2)      journal footer (块 3)
//! 0  last_committed u64      0   last_flushed u64
//!                            8   free_blocks  u64
//!                            16  nr_files     u64
//!                            24  next_oid     u64
//!
//! tx head                    wander record
//! 0  magic "TxMagic4"        0   magic "LogMagc4"
//! 8  id          u64         8   id          u64
//! 16 total       u32         16  total       u32
//! 20 (pad)       u32         20  serial      u32
//! 24 prev_tx     u64         24  next_block  u64
//! 32 next_block  u64         32  {original u64, wandered u64} ...
//! 40 free_blocks u64
//! 48 nr_files    u64
//! 56 next_oid    u64
//! ```
//!
//! wander record 的条目数组以 `original == 0` 结束（块 0 永不分配）。

use super::JournalError;
use crate::{
    consts::{
        JOURNAL_FOOTER_SIZE, JOURNAL_HEADER_SIZE, TX_HEADER_MAGIC, TX_HEADER_SIZE,
        WANDER_ENTRY_SIZE, WANDER_RECORD_HEADER_SIZE, WANDER_RECORD_MAGIC,
    },
    layout::SuperCounters,
};
use byteorder::{ByteOrder, LittleEndian};

/// 每个 wander record 能放的条目数
pub fn entries_per_record(block_size: usize) -> usize {
    (block_size - WANDER_RECORD_HEADER_SIZE) / WANDER_ENTRY_SIZE
}

/// 存放 `entries` 个条目需要的 wander record 数（不含 tx head）
pub fn records_needed(entries: usize, block_size: usize) -> usize {
    let per = entries_per_record(block_size);
    (entries + per - 1) / per
}

fn check_len(buf: &[u8], need: usize) -> Result<(), JournalError> {
    if buf.len() < need {
        return Err(JournalError::Truncated);
    }
    Ok(())
}

fn put_counters(buf: &mut [u8], c: &SuperCounters) {
    LittleEndian::write_u64(&mut buf[0..8], c.free_blocks);
    LittleEndian::write_u64(&mut buf[8..16], c.nr_files);
    LittleEndian::write_u64(&mut buf[16..24], c.next_oid);
}

fn get_counters(buf: &[u8]) -> SuperCounters {
    SuperCounters {
        free_blocks: LittleEndian::read_u64(&buf[0..8]),
        nr_files: LittleEndian::read_u64(&buf[8..16]),
        next_oid: LittleEndian::read_u64(&buf[16..24]),
    }
}

/// Journal header：最近一次提交的 tx head 位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    /// 最近提交的 tx head 块号（0 表示从未提交）
    pub last_committed: u64,
}

impl JournalHeader {
    /// 序列化为一整块
    pub fn encode(&self, block_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; block_size];
        LittleEndian::write_u64(&mut buf[0..8], self.last_committed);
        buf
    }

    /// 解析
    pub fn decode(buf: &[u8]) -> Result<Self, JournalError> {
        check_len(buf, JOURNAL_HEADER_SIZE)?;
        Ok(Self {
            last_committed: LittleEndian::read_u64(&buf[0..8]),
        })
    }
}

/// Journal footer：最近一次写回完成的 tx head 位置和稳定的计数器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalFooter {
    /// 最近写回完成的 tx head 块号
    pub last_flushed: u64,
    /// 已提交的计数器
    pub counters: SuperCounters,
}

impl JournalFooter {
    /// 序列化为一整块
    pub fn encode(&self, block_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; block_size];
        LittleEndian::write_u64(&mut buf[0..8], self.last_flushed);
        put_counters(&mut buf[8..32], &self.counters);
        buf
    }

    /// 解析
    pub fn decode(buf: &[u8]) -> Result<Self, JournalError> {
        check_len(buf, JOURNAL_FOOTER_SIZE)?;
        Ok(Self {
            last_flushed: LittleEndian::read_u64(&buf[0..8]),
            counters: get_counters(&buf[8..32]),
        })
    }
}

/// Transaction head：事务的第一个日志块
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxHead {
    /// 事务 id
    pub id: u64,
    /// 日志块总数（含 tx head）
    pub total: u32,
    /// 前一个事务的 tx head
    pub prev_tx: u64,
    /// 第一个 wander record（没有时为 0）
    pub next_block: u64,
    /// 提交时的计数器
    pub counters: SuperCounters,
}

impl TxHead {
    /// 序列化为一整块
    pub fn encode(&self, block_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; block_size];
        buf[0..8].copy_from_slice(TX_HEADER_MAGIC);
        LittleEndian::write_u64(&mut buf[8..16], self.id);
        LittleEndian::write_u32(&mut buf[16..20], self.total);
        LittleEndian::write_u64(&mut buf[24..32], self.prev_tx);
        LittleEndian::write_u64(&mut buf[32..40], self.next_block);
        put_counters(&mut buf[40..64], &self.counters);
        buf
    }

    /// 解析并校验 magic
    pub fn decode(buf: &[u8]) -> Result<Self, JournalError> {
        check_len(buf, TX_HEADER_SIZE)?;
        if &buf[0..8] != TX_HEADER_MAGIC {
            return Err(JournalError::BadTxMagic);
        }
        Ok(Self {
            id: LittleEndian::read_u64(&buf[8..16]),
            total: LittleEndian::read_u32(&buf[16..20]),
            prev_tx: LittleEndian::read_u64(&buf[24..32]),
            next_block: LittleEndian::read_u64(&buf[32..40]),
            counters: get_counters(&buf[40..64]),
        })
    }
}

/// Wander record：`{original, wandered}` 条目的载体
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WanderRecord {
    /// 所属事务 id
    pub id: u64,
    /// 事务的日志块总数
    pub total: u32,
    /// 在事务中的序号（tx head 为 0，record 从 1 开始）
    pub serial: u32,
    /// 下一个 record（最后一个为 0）
    pub next_block: u64,
    /// `(original, wandered)`
    pub entries: Vec<(u64, u64)>,
}

impl WanderRecord {
    /// 序列化为一整块
    pub fn encode(&self, block_size: usize) -> Vec<u8> {
        debug_assert!(self.entries.len() <= entries_per_record(block_size));
        let mut buf = vec![0u8; block_size];
        buf[0..8].copy_from_slice(WANDER_RECORD_MAGIC);
        LittleEndian::write_u64(&mut buf[8..16], self.id);
        LittleEndian::write_u32(&mut buf[16..20], self.total);
        LittleEndian::write_u32(&mut buf[20..24], self.serial);
        LittleEndian::write_u64(&mut buf[24..32], self.next_block);
        for (i, (original, wandered)) in self.entries.iter().enumerate() {
            let off = WANDER_RECORD_HEADER_SIZE + i * WANDER_ENTRY_SIZE;
            LittleEndian::write_u64(&mut buf[off..off + 8], *original);
            LittleEndian::write_u64(&mut buf[off + 8..off + 16], *wandered);
        }
        buf
    }

    /// 解析并校验 magic
    pub fn decode(buf: &[u8]) -> Result<Self, JournalError> {
        check_len(buf, WANDER_RECORD_HEADER_SIZE)?;
        if &buf[0..8] != WANDER_RECORD_MAGIC {
            return Err(JournalError::BadRecordMagic);
        }
        let mut entries = Vec::new();
        for i in 0..entries_per_record(buf.len()) {
            let off = WANDER_RECORD_HEADER_SIZE + i * WANDER_ENTRY_SIZE;
            let original = LittleEndian::read_u64(&buf[off..off + 8]);
            if original == 0 {
                break;
            }
            entries.push((original, LittleEndian::read_u64(&buf[off + 8..off + 16])));
        }
        Ok(Self {
            id: LittleEndian::read_u64(&buf[8..16]),
            total: LittleEndian::read_u32(&buf[16..20]),
            serial: LittleEndian::read_u32(&buf[20..24]),
            next_block: LittleEndian::read_u64(&buf[24..32]),
            entries,
        })
    }
}
