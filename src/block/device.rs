//! 块设备核心类型

use crate::error::{Error, ErrorKind, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// 块设备接口
///
/// 实现此 trait 以提供底层块设备访问。地址以逻辑块为单位。
///
/// # 示例
///
/// ```rust,ignore
/// use cowfs_core::{BlockDevice, Result};
///
/// struct MyDevice {
///     // ...
/// }
///
/// impl BlockDevice for MyDevice {
///     fn block_size(&self) -> u32 {
///         4096
///     }
///
///     fn total_blocks(&self) -> u64 {
///         1000000
///     }
///
///     fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize> {
///         Ok(count as usize * 4096)
///     }
///
///     fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize> {
///         Ok(count as usize * 4096)
///     }
/// }
/// ```
pub trait BlockDevice: Send {
    /// 逻辑块大小（通常 4096）
    fn block_size(&self) -> u32;

    /// 总块数
    fn total_blocks(&self) -> u64;

    /// 读取连续块
    ///
    /// # 参数
    ///
    /// * `lba` - 起始逻辑块地址
    /// * `count` - 要读取的块数
    /// * `buf` - 目标缓冲区（大小至少为 count * block_size）
    ///
    /// # 返回
    ///
    /// 成功返回实际读取的字节数
    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize>;

    /// 写入连续块
    ///
    /// # 参数
    ///
    /// * `lba` - 起始逻辑块地址
    /// * `count` - 要写入的块数
    /// * `buf` - 源缓冲区（大小至少为 count * block_size）
    ///
    /// # 返回
    ///
    /// 成功返回实际写入的字节数
    fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize>;

    /// 刷新设备缓存，返回时之前的写入都已持久
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// 是否只读
    fn is_read_only(&self) -> bool {
        false
    }
}

/// 块设备包装器
///
/// 在设备外加一把锁，供 flush queue、commit writer、replay 多线程共享，
/// 并统计读写次数。
///
/// 对应 lwext4 的 `ext4_block_dev_lock/unlock` API：这里锁由包装器自己持有。
pub struct BlockDev {
    /// 底层设备
    device: Mutex<Box<dyn BlockDevice>>,
    /// 块大小
    block_size: u32,
    /// 总块数
    total_blocks: u64,
    /// 物理读取次数
    read_count: AtomicU64,
    /// 物理写入次数（按设备调用计）
    write_count: AtomicU64,
    /// 写入的块数
    blocks_written: AtomicU64,
}

impl BlockDev {
    /// 创建新的块设备包装器
    pub fn new(device: impl BlockDevice + 'static) -> Result<Self> {
        let block_size = device.block_size();
        if !(crate::consts::MIN_BLOCK_SIZE..=crate::consts::MAX_BLOCK_SIZE).contains(&block_size)
            || !block_size.is_power_of_two()
        {
            return Err(Error::new(ErrorKind::InvalidInput, "Unsupported block size"));
        }
        let total_blocks = device.total_blocks();
        Ok(Self {
            device: Mutex::new(Box::new(device)),
            block_size,
            total_blocks,
            read_count: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
            blocks_written: AtomicU64::new(0),
        })
    }

    /// 获取逻辑块大小
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// 获取总块数
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// 物理读取次数
    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    /// 物理写入次数（每次设备调用计一次，合并后的连续写只算一次）
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    /// 写入的块总数
    pub fn blocks_written(&self) -> u64 {
        self.blocks_written.load(Ordering::Relaxed)
    }

    fn check_range(&self, lba: u64, count: u64) -> Result<()> {
        if count == 0 || lba.checked_add(count).map_or(true, |end| end > self.total_blocks) {
            return Err(Error::new(ErrorKind::InvalidInput, "Block range outside device"));
        }
        Ok(())
    }

    /// 读取单个块
    pub fn read_block(&self, lba: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size as usize];
        self.read_block_into(lba, &mut buf)?;
        Ok(buf)
    }

    /// 读取单个块到调用者缓冲区
    pub fn read_block_into(&self, lba: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(lba, 1)?;
        if buf.len() < self.block_size as usize {
            return Err(Error::new(ErrorKind::InvalidInput, "buffer too small for block"));
        }
        self.read_count.fetch_add(1, Ordering::Relaxed);
        self.device.lock().read_blocks(lba, 1, buf)?;
        Ok(())
    }

    /// 写入连续块
    ///
    /// `buf` 长度必须是块大小的整数倍
    pub fn write_blocks(&self, lba: u64, buf: &[u8]) -> Result<()> {
        let bs = self.block_size as usize;
        if buf.is_empty() || buf.len() % bs != 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "Write buffer not block aligned"));
        }
        let count = (buf.len() / bs) as u64;
        self.check_range(lba, count)?;
        self.write_count.fetch_add(1, Ordering::Relaxed);
        let mut dev = self.device.lock();
        if dev.is_read_only() {
            return Err(Error::new(ErrorKind::InvalidState, "Device is read only"));
        }
        dev.write_blocks(lba, count as u32, buf)?;
        self.blocks_written.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    /// 写入单个块
    pub fn write_block(&self, lba: u64, buf: &[u8]) -> Result<()> {
        self.write_blocks(lba, &buf[..self.block_size as usize])
    }

    /// 刷新设备并等待完成
    ///
    /// 提交协议里的每个持久化屏障都调用它
    pub fn flush_and_wait(&self) -> Result<()> {
        self.device.lock().flush()
    }
}

impl core::fmt::Debug for BlockDev {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockDev")
            .field("block_size", &self.block_size)
            .field("total_blocks", &self.total_blocks)
            .field("read_count", &self.read_count())
            .field("write_count", &self.write_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDevice;

    #[test]
    fn test_rejects_bad_block_size() {
        assert!(BlockDev::new(MemDevice::new(1000, 16)).is_err());
        assert!(BlockDev::new(MemDevice::new(256, 16)).is_err());
        assert!(BlockDev::new(MemDevice::new(4096, 16)).is_ok());
    }

    #[test]
    fn test_read_write_roundtrip() {
        let dev = BlockDev::new(MemDevice::new(512, 8)).unwrap();
        let data = vec![0xABu8; 1024];
        dev.write_blocks(3, &data).unwrap();
        assert_eq!(dev.read_block(3).unwrap(), vec![0xAB; 512]);
        assert_eq!(dev.read_block(4).unwrap(), vec![0xAB; 512]);
        assert_eq!(dev.read_block(5).unwrap(), vec![0; 512]);
        assert_eq!(dev.write_count(), 1);
        assert_eq!(dev.blocks_written(), 2);
    }

    #[test]
    fn test_range_checks() {
        let dev = BlockDev::new(MemDevice::new(512, 8)).unwrap();
        assert!(dev.read_block(8).is_err());
        assert!(dev.write_blocks(7, &[0u8; 1024]).is_err());
        assert!(dev.write_blocks(0, &[0u8; 100]).is_err());
    }
}
