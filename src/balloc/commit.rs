//! commit bitmap 维护
//!
//! atom 提交前调用：把本 atom 的新分配和 delete set 写入 commit bitmap，
//! 返回被修改的位图块，由调用者作为 overwrite set 的一部分写日志。

use super::{alloc::BlockAllocator, helpers::*, BlockRange};
use crate::{
    bitmap,
    block::BlockDev,
    error::{Error, ErrorKind, Result},
};

impl BlockAllocator {
    /// 从设备加载位图
    ///
    /// working 和 commit 两张位图都初始化为磁盘上的内容
    pub fn load(dev: &BlockDev) -> Result<Self> {
        let bs = dev.block_size();
        let total = dev.total_blocks();
        let alloc = Self::new(total, bs);
        {
            let mut inner = alloc.inner.lock();
            let per = bs as usize;
            for idx in 0..bitmap_block_count(total, bs) {
                let off = idx as usize * per;
                dev.read_block_into(bitmap_blocknr(idx), &mut inner.commit[off..off + per])?;
            }
            // 固定区域必须是已用
            for blk in 0..alloc.first_data_block() {
                if !bitmap::test_bit(&inner.commit, blk) {
                    log::error!("[BALLOC] metadata block {} marked free on disk", blk);
                    return Err(Error::new(ErrorKind::Corrupted, "Bitmap marks metadata free"));
                }
            }
            inner.working = inner.commit.clone();
            inner.free = bitmap::count_zeros(&inner.working, 0, total);
        }
        log::info!(
            "[BALLOC] loaded {} bitmap blocks, {} free",
            bitmap_block_count(total, bs),
            alloc.free_blocks()
        );
        Ok(alloc)
    }

    /// 把新分配的区间写入 commit bitmap
    pub fn commit_alloc(&self, range: BlockRange) -> Result<()> {
        let mut inner = self.inner.lock();
        bitmap::set_range(&mut inner.commit, range.start, range.len)?;
        let bs = self.block_size();
        for idx in bitmap_index_of(range.start, bs)..=bitmap_index_of(range.end() - 1, bs) {
            inner.dirty_bitmaps.insert(idx);
        }
        Ok(())
    }

    /// 把释放的块写入 commit bitmap
    ///
    /// working bitmap 不变，块直到 [`release_deferred`](Self::release_deferred) 才能重用
    pub fn commit_dealloc(&self, blk: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        bitmap::clear_bit(&mut inner.commit, blk)?;
        inner.dirty_bitmaps.insert(bitmap_index_of(blk, self.block_size()));
        Ok(())
    }

    /// footer 更新之后，把 delete set 中的块还给 working bitmap
    pub fn release_deferred(&self, blk: u64) -> Result<()> {
        self.dealloc(BlockRange::single(blk))
    }

    /// 取出被修改的位图块：`(磁盘块号, 内容)`
    ///
    /// 调用后脏集合清空。提交失败时调用 [`redirty_bitmaps`](Self::redirty_bitmaps) 放回。
    pub fn take_dirty_bitmaps(&self) -> Vec<(u64, Vec<u8>)> {
        let mut inner = self.inner.lock();
        let per = self.block_size() as usize;
        let dirty = core::mem::take(&mut inner.dirty_bitmaps);
        dirty
            .into_iter()
            .map(|idx| {
                let off = idx as usize * per;
                (bitmap_blocknr(idx), inner.commit[off..off + per].to_vec())
            })
            .collect()
    }

    /// 把位图块重新标脏
    pub fn redirty_bitmaps(&self, blocknrs: impl IntoIterator<Item = u64>) {
        let mut inner = self.inner.lock();
        for blk in blocknrs {
            inner.dirty_bitmaps.insert(blk - crate::consts::FIRST_BITMAP_BLOCK);
        }
    }

    /// 是否有待写的位图块
    pub fn has_dirty_bitmaps(&self) -> bool {
        !self.inner.lock().dirty_bitmaps.is_empty()
    }

    /// commit bitmap 的整体内容（mkfs 写盘用）
    pub fn commit_image(&self) -> Vec<u8> {
        self.inner.lock().commit.clone()
    }
}
