//! 磁盘布局
//!
//! ```text
//! 块 0        保留（永不分配）
//! 块 1        格式 super block
//! 块 2        journal header
//! 块 3        journal footer
//! 块 4..      位图块
//! 其后        数据块（树节点、数据、wander record、漂移块）
//! ```
//!
//! [`LayoutHook`] 让布局在每次提交时把 super block 作为一个合成节点
//! 加入 overwrite set。

mod oid;
mod super_block;

pub use oid::OidAllocator;
pub use super_block::FormatSuper;

use crate::{
    balloc::{bitmap_block_count, bitmap_blocknr, BlockAllocator},
    block::BlockDev,
    consts::{FIRST_OID, FORMAT_SUPER_BLOCK, JOURNAL_FOOTER_BLOCK, JOURNAL_HEADER_BLOCK, RESERVED_BLOCK},
    error::{Error, ErrorKind, Result},
    tree::TreeLayer,
    wander::format::{JournalFooter, JournalHeader},
};

/// 随提交持久化的计数器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SuperCounters {
    /// 提交后的空闲块数
    pub free_blocks: u64,
    /// 存活对象数
    pub nr_files: u64,
    /// 下一个对象 id
    pub next_oid: u64,
}

/// 磁盘布局插件
pub trait LayoutHook: Send + Sync {
    /// 每次提交调用一次，返回要写日志的合成 super 节点 `(块号, 内容)`
    fn log_super(&self, tree: &dyn TreeLayer, counters: &SuperCounters) -> Option<(u64, Vec<u8>)>;
}

/// 默认布局
#[derive(Debug, Clone, Copy)]
pub struct DiskLayout {
    block_size: u32,
    total_blocks: u64,
}

impl DiskLayout {
    /// 创建布局描述
    pub fn new(block_size: u32, total_blocks: u64) -> Self {
        Self { block_size, total_blocks }
    }

    /// 读取并校验 super block
    pub fn read_super(&self, dev: &BlockDev) -> Result<FormatSuper> {
        let sb = FormatSuper::decode(&dev.read_block(FORMAT_SUPER_BLOCK)?)?;
        if sb.block_size != self.block_size || sb.total_blocks != self.total_blocks {
            log::error!(
                "[LAYOUT] super block geometry {}x{} does not match device {}x{}",
                sb.total_blocks,
                sb.block_size,
                self.total_blocks,
                self.block_size
            );
            return Err(Error::new(ErrorKind::Corrupted, "Super block geometry mismatch"));
        }
        Ok(sb)
    }
}

impl LayoutHook for DiskLayout {
    fn log_super(&self, tree: &dyn TreeLayer, counters: &SuperCounters) -> Option<(u64, Vec<u8>)> {
        let sb = FormatSuper {
            block_size: self.block_size,
            total_blocks: self.total_blocks,
            root_block: tree.root().map_or(0, |r| r.blocknr()),
            tree_height: tree.height(),
            counters: *counters,
        };
        Some((FORMAT_SUPER_BLOCK, sb.encode(self.block_size as usize)))
    }
}

/// 在设备上创建空文件系统
///
/// 写入 super block、空的 journal header / footer 和初始位图
///
/// # 错误
///
/// - `NoSpace` - 设备放不下固定区域
pub fn format(dev: &BlockDev) -> Result<FormatSuper> {
    let bs = dev.block_size();
    let total = dev.total_blocks();
    let alloc = BlockAllocator::new(total, bs);
    if alloc.first_data_block() >= total {
        return Err(Error::new(ErrorKind::NoSpace, "Device too small for layout"));
    }
    let counters = SuperCounters {
        free_blocks: alloc.free_blocks(),
        nr_files: 0,
        next_oid: FIRST_OID,
    };
    let sb = FormatSuper {
        block_size: bs,
        total_blocks: total,
        root_block: 0,
        tree_height: 0,
        counters,
    };
    let bsz = bs as usize;
    dev.write_block(RESERVED_BLOCK, &vec![0u8; bsz])?;
    dev.write_block(FORMAT_SUPER_BLOCK, &sb.encode(bsz))?;
    dev.write_block(JOURNAL_HEADER_BLOCK, &JournalHeader { last_committed: 0 }.encode(bsz))?;
    dev.write_block(
        JOURNAL_FOOTER_BLOCK,
        &JournalFooter { last_flushed: 0, counters }.encode(bsz),
    )?;
    let image = alloc.commit_image();
    for idx in 0..bitmap_block_count(total, bs) {
        let off = idx as usize * bsz;
        dev.write_block(bitmap_blocknr(idx), &image[off..off + bsz])?;
    }
    dev.flush_and_wait()?;
    log::info!(
        "[LAYOUT] formatted {} blocks of {} bytes, {} free",
        total,
        bs,
        counters.free_blocks
    );
    Ok(sb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDevice;

    #[test]
    fn test_format_and_read_back() {
        let dev = BlockDev::new(MemDevice::new(512, 256)).unwrap();
        let sb = format(&dev).unwrap();
        let layout = DiskLayout::new(512, 256);
        assert_eq!(layout.read_super(&dev).unwrap(), sb);
        assert_eq!(sb.counters.next_oid, FIRST_OID);

        let alloc = BlockAllocator::load(&dev).unwrap();
        assert_eq!(alloc.free_blocks(), sb.counters.free_blocks);
        assert!(alloc.is_committed(FORMAT_SUPER_BLOCK));
    }

    #[test]
    fn test_geometry_mismatch() {
        let dev = BlockDev::new(MemDevice::new(512, 256)).unwrap();
        format(&dev).unwrap();
        let err = DiskLayout::new(512, 128).read_super(&dev).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupted);
    }

    #[test]
    fn test_format_too_small() {
        let dev = BlockDev::new(MemDevice::new(512, 4)).unwrap();
        assert_eq!(format(&dev).unwrap_err().kind(), ErrorKind::NoSpace);
    }
}
