//! Bitmap 操作实现
//!
//! 位索引使用 `u64`，与块号同宽。查找时整字节跳过全满 / 全空的字节。

use crate::error::{Error, ErrorKind, Result};

/// 测试位图中某一位是否被设置
///
/// 越界的位视为已设置（不可分配）
pub fn test_bit(bitmap: &[u8], index: u64) -> bool {
    let byte_index = (index / 8) as usize;
    if byte_index >= bitmap.len() {
        return true;
    }
    (bitmap[byte_index] & (1 << (index % 8))) != 0
}

/// 设置位图中的某一位
pub fn set_bit(bitmap: &mut [u8], index: u64) -> Result<()> {
    let byte_index = (index / 8) as usize;
    if byte_index >= bitmap.len() {
        return Err(Error::new(ErrorKind::InvalidInput, "Bitmap index out of range"));
    }
    bitmap[byte_index] |= 1 << (index % 8);
    Ok(())
}

/// 清除位图中的某一位
pub fn clear_bit(bitmap: &mut [u8], index: u64) -> Result<()> {
    let byte_index = (index / 8) as usize;
    if byte_index >= bitmap.len() {
        return Err(Error::new(ErrorKind::InvalidInput, "Bitmap index out of range"));
    }
    bitmap[byte_index] &= !(1 << (index % 8));
    Ok(())
}

/// 设置 `[start, start + count)` 范围内的所有位
pub fn set_range(bitmap: &mut [u8], start: u64, count: u64) -> Result<()> {
    for i in start..start + count {
        set_bit(bitmap, i)?;
    }
    Ok(())
}

/// 清除 `[start, start + count)` 范围内的所有位
pub fn clear_range(bitmap: &mut [u8], start: u64, count: u64) -> Result<()> {
    for i in start..start + count {
        clear_bit(bitmap, i)?;
    }
    Ok(())
}

/// 在 `[start, end)` 中查找第一个空闲位
///
/// 对应 lwext4 的 `ext4_bmap_bit_find_clr()`，全满的字节整体跳过
pub fn find_first_zero(bitmap: &[u8], start: u64, end: u64) -> Option<u64> {
    let end = end.min(bitmap.len() as u64 * 8);
    let mut i = start;
    while i < end {
        if i % 8 == 0 && bitmap[(i / 8) as usize] == 0xFF {
            i += 8;
            continue;
        }
        if !test_bit(bitmap, i) {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// 从 `start` 开始连续空闲位的长度，最多统计 `max` 位，不超过 `end`
pub fn zero_run_len(bitmap: &[u8], start: u64, end: u64, max: u64) -> u64 {
    let end = end.min(bitmap.len() as u64 * 8);
    let mut len = 0;
    while start + len < end && len < max && !test_bit(bitmap, start + len) {
        len += 1;
    }
    len
}

/// 统计 `[start, end)` 范围内空闲的位数
pub fn count_zeros(bitmap: &[u8], start: u64, end: u64) -> u64 {
    let end = end.min(bitmap.len() as u64 * 8);
    let mut count = 0;
    let mut i = start;
    while i < end {
        if i % 8 == 0 && i + 8 <= end {
            count += u64::from(bitmap[(i / 8) as usize].count_zeros());
            i += 8;
            continue;
        }
        if !test_bit(bitmap, i) {
            count += 1;
        }
        i += 1;
    }
    count
}
