//! 格式 super block
//!
//! 固定在 [`FORMAT_SUPER_BLOCK`](crate::consts::FORMAT_SUPER_BLOCK)。
//! 每次提交时作为 overwrite set 的一员写日志，树根位置和计数器随之持久化。
//!
//! ```text
//! 0   magic        [u8; 8]  "CoWFs001"
//! 8   block_size   u32
//! 12  tree_height  u8
//! 13  (pad)        [u8; 3]
//! 16  total_blocks u64
//! 24  root_block   u64
//! 32  free_blocks  u64
//! 40  nr_files     u64
//! 48  next_oid     u64
//! ```

use super::SuperCounters;
use crate::{
    consts::{FORMAT_MAGIC, FORMAT_SUPER_SIZE},
    error::{Error, ErrorKind, Result},
};
use byteorder::{ByteOrder, LittleEndian};

/// 格式 super block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatSuper {
    /// 块大小
    pub block_size: u32,
    /// 设备总块数
    pub total_blocks: u64,
    /// 树根块号（空树为 0）
    pub root_block: u64,
    /// 树高（空树为 0）
    pub tree_height: u8,
    /// 已提交的计数器
    pub counters: SuperCounters,
}

impl FormatSuper {
    /// 序列化为一整块
    pub fn encode(&self, block_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; block_size];
        buf[0..8].copy_from_slice(FORMAT_MAGIC);
        LittleEndian::write_u32(&mut buf[8..12], self.block_size);
        buf[12] = self.tree_height;
        LittleEndian::write_u64(&mut buf[16..24], self.total_blocks);
        LittleEndian::write_u64(&mut buf[24..32], self.root_block);
        LittleEndian::write_u64(&mut buf[32..40], self.counters.free_blocks);
        LittleEndian::write_u64(&mut buf[40..48], self.counters.nr_files);
        LittleEndian::write_u64(&mut buf[48..56], self.counters.next_oid);
        buf
    }

    /// 从块内容解析
    ///
    /// # 错误
    ///
    /// - `Corrupted` - magic 不匹配
    /// - `InvalidInput` - 缓冲区太短
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FORMAT_SUPER_SIZE {
            return Err(Error::new(ErrorKind::InvalidInput, "Super block buffer too small"));
        }
        if &buf[0..8] != FORMAT_MAGIC {
            return Err(Error::new(ErrorKind::Corrupted, "Bad format super block magic"));
        }
        Ok(Self {
            block_size: LittleEndian::read_u32(&buf[8..12]),
            tree_height: buf[12],
            total_blocks: LittleEndian::read_u64(&buf[16..24]),
            root_block: LittleEndian::read_u64(&buf[24..32]),
            counters: SuperCounters {
                free_blocks: LittleEndian::read_u64(&buf[32..40]),
                nr_files: LittleEndian::read_u64(&buf[40..48]),
                next_oid: LittleEndian::read_u64(&buf[48..56]),
            },
        })
    }
}
