//! 块分配功能
//!
//! 对应事务管理器消费的 `grab(count)` / `alloc_near(hint, count)` / `dealloc(range)`

use super::helpers::*;
use crate::{
    bitmap,
    error::{Error, ErrorKind, Result},
};
use parking_lot::Mutex;

/// 一段连续块
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockRange {
    /// 起始块号
    pub start: u64,
    /// 块数
    pub len: u64,
}

impl BlockRange {
    /// 单个块
    pub fn single(start: u64) -> Self {
        Self { start, len: 1 }
    }

    /// 结束块号（不包含）
    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

pub(super) struct AllocInner {
    /// working bitmap：1 表示已用
    pub(super) working: Vec<u8>,
    /// commit bitmap
    pub(super) commit: Vec<u8>,
    /// working bitmap 中的空闲块数
    pub(super) free: u64,
    /// 已预留（grab）但尚未分配的块数
    pub(super) grabbed: u64,
    /// commit bitmap 被修改过的位图块序号
    pub(super) dirty_bitmaps: std::collections::BTreeSet<u64>,
}

/// 块分配器
///
/// 内部锁是叶子锁：持有它时不会再获取 atom / jnode / txnh 锁。
pub struct BlockAllocator {
    pub(super) inner: Mutex<AllocInner>,
    block_size: u32,
    total_blocks: u64,
    first_data_block: u64,
}

impl BlockAllocator {
    /// 创建全空的分配器
    ///
    /// 布局的固定区域（保留块、super、journal header/footer、位图块）标记为已用
    pub fn new(total_blocks: u64, block_size: u32) -> Self {
        let bytes = (bitmap_block_count(total_blocks, block_size) * u64::from(block_size)) as usize;
        let mut map = vec![0u8; bytes];
        let first = first_data_block(total_blocks, block_size).min(total_blocks);
        // 固定区域在范围内，不会失败
        let _ = bitmap::set_range(&mut map, 0, first);
        // 超出设备的尾部位也标记为已用
        let _ = bitmap::set_range(&mut map, total_blocks, bytes as u64 * 8 - total_blocks);
        Self {
            inner: Mutex::new(AllocInner {
                working: map.clone(),
                commit: map,
                free: total_blocks - first,
                grabbed: 0,
                dirty_bitmaps: Default::default(),
            }),
            block_size,
            total_blocks,
            first_data_block: first,
        }
    }

    /// 块大小
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// 设备总块数
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// 第一个可分配的块
    pub fn first_data_block(&self) -> u64 {
        self.first_data_block
    }

    /// working bitmap 中的空闲块数（包含已预留部分）
    pub fn free_blocks(&self) -> u64 {
        self.inner.lock().free
    }

    /// 已预留块数
    pub fn grabbed_blocks(&self) -> u64 {
        self.inner.lock().grabbed
    }

    /// commit bitmap 中的空闲块数
    pub fn committed_free_blocks(&self) -> u64 {
        let inner = self.inner.lock();
        bitmap::count_zeros(&inner.commit, 0, self.total_blocks)
    }

    /// 块在 working bitmap 中是否已用
    pub fn is_allocated(&self, blk: u64) -> bool {
        bitmap::test_bit(&self.inner.lock().working, blk)
    }

    /// 块在 commit bitmap 中是否已用
    pub fn is_committed(&self, blk: u64) -> bool {
        bitmap::test_bit(&self.inner.lock().commit, blk)
    }

    /// 预留 `count` 块
    ///
    /// 预留不指定位置，只保证之后的 `alloc_near(.., from_grabbed = true)` 有空间
    pub fn grab(&self, count: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.free - inner.grabbed < count {
            log::warn!(
                "[BALLOC] grab {} failed: free={} grabbed={}",
                count,
                inner.free,
                inner.grabbed
            );
            return Err(Error::new(ErrorKind::NoSpace, "No free blocks to grab"));
        }
        inner.grabbed += count;
        Ok(())
    }

    /// 归还预留
    pub fn ungrab(&self, count: u64) {
        let mut inner = self.inner.lock();
        inner.grabbed = inner.grabbed.saturating_sub(count);
    }

    /// 在 `hint` 附近分配最多 `count` 个连续块
    ///
    /// 返回的区间可能比 `count` 短，调用者需要循环。
    ///
    /// # 查找顺序
    ///
    /// 1. `hint` 本身
    /// 2. `hint` 之后同一个 64 块窗口内
    /// 3. `hint` 之后直到设备末尾
    /// 4. 从第一个数据块回绕到 `hint`
    ///
    /// `from_grabbed` 为真时从预留中扣除，否则要求未预留的空闲块
    pub fn alloc_near(&self, hint: u64, count: u64, from_grabbed: bool) -> Result<BlockRange> {
        if count == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "Zero-length allocation"));
        }
        let mut inner = self.inner.lock();
        let usable = if from_grabbed {
            inner.free
        } else {
            inner.free - inner.grabbed
        };
        if usable == 0 {
            return Err(Error::new(ErrorKind::NoSpace, "No free blocks available"));
        }
        let count = count.min(usable);

        let goal = hint.clamp(self.first_data_block, self.total_blocks.saturating_sub(1));
        let found = find_near(&inner.working, goal, self.first_data_block, self.total_blocks)
            .ok_or(Error::new(ErrorKind::NoSpace, "No free blocks available"))?;
        let len = bitmap::zero_run_len(&inner.working, found, self.total_blocks, count);

        bitmap::set_range(&mut inner.working, found, len)?;
        inner.free -= len;
        if from_grabbed {
            inner.grabbed = inner.grabbed.saturating_sub(len);
        }
        log::trace!("[BALLOC] alloc_near hint={:#x} -> {:#x}+{}", hint, found, len);
        Ok(BlockRange { start: found, len })
    }

    /// 把区间还给 working bitmap
    pub fn dealloc(&self, range: BlockRange) -> Result<()> {
        if range.start < self.first_data_block || range.end() > self.total_blocks {
            return Err(Error::new(ErrorKind::InvalidInput, "Dealloc outside data area"));
        }
        let mut inner = self.inner.lock();
        for blk in range.start..range.end() {
            if !bitmap::test_bit(&inner.working, blk) {
                log::error!("[BALLOC] double free of block {:#x}", blk);
                return Err(Error::new(ErrorKind::InvalidState, "Block already free"));
            }
        }
        bitmap::clear_range(&mut inner.working, range.start, range.len)?;
        inner.free += range.len;
        log::trace!("[BALLOC] dealloc {:#x}+{}", range.start, range.len);
        Ok(())
    }

    /// 在 working bitmap 中占住指定的块
    ///
    /// 块已经是已用时返回 `false`。只动 working bitmap，不影响提交的空闲计数。
    pub fn claim(&self, blk: u64) -> Result<bool> {
        if blk < self.first_data_block || blk >= self.total_blocks {
            return Err(Error::new(ErrorKind::InvalidInput, "Claim outside data area"));
        }
        let mut inner = self.inner.lock();
        if bitmap::test_bit(&inner.working, blk) {
            return Ok(false);
        }
        bitmap::set_range(&mut inner.working, blk, 1)?;
        inner.free -= 1;
        Ok(true)
    }
}

/// 按分配顺序查找第一个空闲块
fn find_near(map: &[u8], goal: u64, first: u64, total: u64) -> Option<u64> {
    if !bitmap::test_bit(map, goal) {
        return Some(goal);
    }
    let window_end = ((goal + 64) & !63).min(total);
    if let Some(blk) = bitmap::find_first_zero(map, goal + 1, window_end) {
        return Some(blk);
    }
    bitmap::find_first_zero(map, window_end, total).or_else(|| bitmap::find_first_zero(map, first, goal))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> BlockAllocator {
        // 512 字节块，1024 块：固定区域 0..5
        BlockAllocator::new(1024, 512)
    }

    #[test]
    fn test_fixed_area_reserved() {
        let a = allocator();
        assert_eq!(a.first_data_block(), 5);
        assert_eq!(a.free_blocks(), 1019);
        for blk in 0..5 {
            assert!(a.is_allocated(blk));
            assert!(a.is_committed(blk));
        }
        assert!(!a.is_allocated(5));
    }

    #[test]
    fn test_alloc_near_prefers_hint() {
        let a = allocator();
        let r = a.alloc_near(100, 1, false).unwrap();
        assert_eq!(r, BlockRange::single(100));
        let r = a.alloc_near(100, 1, false).unwrap();
        assert_eq!(r.start, 101);
        assert!(a.is_allocated(100));
        assert!(!a.is_committed(100));
    }

    #[test]
    fn test_alloc_near_run_and_wrap() {
        let a = allocator();
        let r = a.alloc_near(1020, 10, false).unwrap();
        assert_eq!(r, BlockRange { start: 1020, len: 4 });
        // 末尾已满，回绕到数据区开头
        let r = a.alloc_near(1020, 1, false).unwrap();
        assert_eq!(r.start, 5);
    }

    #[test]
    fn test_grab_accounting() {
        let a = BlockAllocator::new(16, 512);
        // 固定区域 0..5，剩 11 块
        a.grab(10).unwrap();
        assert!(a.grab(2).is_err());
        // 未预留的空闲块只剩 1 个
        assert_eq!(a.alloc_near(6, 5, false).unwrap().len, 1);
        assert!(a.alloc_near(6, 1, false).is_err());
        let r = a.alloc_near(6, 3, true).unwrap();
        assert_eq!(r.len, 3);
        assert_eq!(a.grabbed_blocks(), 7);
        a.ungrab(7);
        assert_eq!(a.grabbed_blocks(), 0);
    }

    #[test]
    fn test_dealloc_and_double_free() {
        let a = allocator();
        let r = a.alloc_near(50, 2, false).unwrap();
        let before = a.free_blocks();
        a.dealloc(r).unwrap();
        assert_eq!(a.free_blocks(), before + 2);
        assert_eq!(a.dealloc(r).unwrap_err().kind(), ErrorKind::InvalidState);
        assert!(a.dealloc(BlockRange::single(2)).is_err());
    }

    #[test]
    fn test_claim_hides_block_from_allocation() {
        let a = allocator();
        let first = a.first_data_block();
        let before = a.free_blocks();
        assert!(a.claim(first).unwrap());
        assert!(!a.claim(first).unwrap());
        assert_eq!(a.free_blocks(), before - 1);
        assert!(!a.is_committed(first));
        assert_eq!(a.alloc_near(first, 1, false).unwrap().start, first + 1);
        assert!(a.claim(1).is_err());
    }
}
