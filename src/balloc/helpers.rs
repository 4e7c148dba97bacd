//! 块分配辅助函数：块号与位图块之间的换算

use crate::consts::FIRST_BITMAP_BLOCK;

/// 每个位图块覆盖的块数
pub fn blocks_per_bitmap(block_size: u32) -> u64 {
    u64::from(block_size) * 8
}

/// 覆盖 `total_blocks` 需要的位图块数
pub fn bitmap_block_count(total_blocks: u64, block_size: u32) -> u64 {
    let per = blocks_per_bitmap(block_size);
    (total_blocks + per - 1) / per
}

/// 块号所在的位图块序号
pub fn bitmap_index_of(blk: u64, block_size: u32) -> u64 {
    blk / blocks_per_bitmap(block_size)
}

/// 位图块序号对应的磁盘块号
pub fn bitmap_blocknr(index: u64) -> u64 {
    FIRST_BITMAP_BLOCK + index
}

/// 第一个数据块（布局中固定区域之后）
pub fn first_data_block(total_blocks: u64, block_size: u32) -> u64 {
    FIRST_BITMAP_BLOCK + bitmap_block_count(total_blocks, block_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_math() {
        assert_eq!(blocks_per_bitmap(512), 4096);
        assert_eq!(bitmap_block_count(4096, 512), 1);
        assert_eq!(bitmap_block_count(4097, 512), 2);
        assert_eq!(bitmap_index_of(4095, 512), 0);
        assert_eq!(bitmap_index_of(4096, 512), 1);
        assert_eq!(bitmap_blocknr(1), FIRST_BITMAP_BLOCK + 1);
        assert_eq!(first_data_block(1024, 512), FIRST_BITMAP_BLOCK + 1);
    }
}
