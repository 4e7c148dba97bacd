//! 内存块设备
//!
//! 多个 `MemDevice` 克隆共享同一份存储，测试可以在文件系统持有设备的同时
//! 注入写失败、取出磁盘镜像，模拟崩溃后重新挂载。

use super::BlockDevice;
use crate::error::{Error, ErrorKind, Result};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug)]
struct MemState {
    data: Vec<u8>,
    /// 成功写入的块数
    written: u64,
    /// 再允许写入多少块，之后所有写都失败
    write_budget: Option<u64>,
    flushes: u64,
}

/// 内存块设备
#[derive(Debug, Clone)]
pub struct MemDevice {
    block_size: u32,
    total_blocks: u64,
    state: Arc<Mutex<MemState>>,
}

impl MemDevice {
    /// 创建全零设备
    pub fn new(block_size: u32, total_blocks: u64) -> Self {
        Self::from_image(block_size, vec![0u8; block_size as usize * total_blocks as usize])
    }

    /// 从磁盘镜像创建设备
    pub fn from_image(block_size: u32, image: Vec<u8>) -> Self {
        let total_blocks = (image.len() / block_size.max(1) as usize) as u64;
        Self {
            block_size,
            total_blocks,
            state: Arc::new(Mutex::new(MemState {
                data: image,
                written: 0,
                write_budget: None,
                flushes: 0,
            })),
        }
    }

    /// 取出当前磁盘镜像
    pub fn image(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }

    /// 再成功写入 `blocks` 块之后，所有写入都失败
    ///
    /// 跨越边界的多块写只落盘前面一部分，模拟撕裂写
    pub fn fail_after(&self, blocks: u64) {
        self.state.lock().write_budget = Some(blocks);
    }

    /// 取消写失败注入
    pub fn heal(&self) {
        self.state.lock().write_budget = None;
    }

    /// 成功写入的块总数
    pub fn blocks_written(&self) -> u64 {
        self.state.lock().written
    }

    /// flush 调用次数
    pub fn flush_count(&self) -> u64 {
        self.state.lock().flushes
    }

    /// 直接读取一块（不经过文件系统）
    pub fn peek(&self, lba: u64) -> Vec<u8> {
        let bs = self.block_size as usize;
        let off = lba as usize * bs;
        self.state.lock().data[off..off + bs].to_vec()
    }

    /// 直接写入一块（不经过文件系统，也不消耗写预算）
    pub fn poke(&self, lba: u64, buf: &[u8]) {
        let bs = self.block_size as usize;
        let off = lba as usize * bs;
        self.state.lock().data[off..off + bs].copy_from_slice(&buf[..bs]);
    }
}

impl BlockDevice for MemDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize> {
        let bs = self.block_size as usize;
        let len = count as usize * bs;
        let off = lba as usize * bs;
        let st = self.state.lock();
        if off + len > st.data.len() || buf.len() < len {
            return Err(Error::new(ErrorKind::InvalidInput, "read beyond device"));
        }
        buf[..len].copy_from_slice(&st.data[off..off + len]);
        Ok(len)
    }

    fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize> {
        let bs = self.block_size as usize;
        let off = lba as usize * bs;
        let mut st = self.state.lock();
        if off + count as usize * bs > st.data.len() || buf.len() < count as usize * bs {
            return Err(Error::new(ErrorKind::InvalidInput, "write beyond device"));
        }
        let allowed = match st.write_budget {
            Some(budget) => budget.min(u64::from(count)),
            None => u64::from(count),
        };
        let n = allowed as usize * bs;
        st.data[off..off + n].copy_from_slice(&buf[..n]);
        st.written += allowed;
        if let Some(budget) = st.write_budget.as_mut() {
            *budget -= allowed;
        }
        if allowed < u64::from(count) {
            return Err(Error::new(ErrorKind::Io, "injected write failure"));
        }
        Ok(n)
    }

    fn flush(&mut self) -> Result<()> {
        self.state.lock().flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_storage() {
        let dev = MemDevice::new(512, 4);
        let mut writer = dev.clone();
        writer.write_blocks(1, 1, &[5u8; 512]).unwrap();
        assert_eq!(dev.peek(1), vec![5u8; 512]);
        assert_eq!(dev.blocks_written(), 1);
        writer.flush().unwrap();
        assert_eq!(dev.flush_count(), 1);
    }

    #[test]
    fn test_torn_write() {
        let mut dev = MemDevice::new(512, 8);
        dev.fail_after(1);
        let err = dev.write_blocks(2, 2, &[7u8; 1024]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(dev.peek(2), vec![7u8; 512]);
        assert_eq!(dev.peek(3), vec![0u8; 512]);

        dev.heal();
        dev.write_blocks(3, 1, &[8u8; 512]).unwrap();
        assert_eq!(dev.peek(3), vec![8u8; 512]);
    }

    #[test]
    fn test_image_roundtrip() {
        let dev = MemDevice::new(512, 4);
        dev.poke(2, &[3u8; 512]);
        let copy = MemDevice::from_image(512, dev.image());
        assert_eq!(copy.total_blocks(), 4);
        assert_eq!(copy.peek(2), vec![3u8; 512]);
    }
}
