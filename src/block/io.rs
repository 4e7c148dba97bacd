//! 批量块写
//!
//! flush queue 和 wandering log 都先把要写的块收集起来，按块号排序后
//! 合并成连续区间，每个区间一次设备写。

use super::BlockDev;

/// 一段连续的待写块
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRun {
    /// 起始块号
    pub start: u64,
    /// 数据（块大小的整数倍）
    pub data: Vec<u8>,
}

impl WriteRun {
    /// 区间包含的块数
    pub fn blocks(&self, block_size: usize) -> u64 {
        (self.data.len() / block_size) as u64
    }
}

/// 批量写的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// 提交的设备写次数
    pub submitted: usize,
    /// 写失败的块号
    pub failed_blocks: Vec<u64>,
}

impl BatchResult {
    /// 是否全部成功
    pub fn is_ok(&self) -> bool {
        self.failed_blocks.is_empty()
    }
}

/// 把 `(块号, 数据)` 合并成连续区间
///
/// 重复的块号保留最后一次出现的数据
pub fn coalesce_runs(mut blocks: Vec<(u64, Vec<u8>)>) -> Vec<WriteRun> {
    blocks.sort_by_key(|(blk, _)| *blk);
    let mut runs: Vec<WriteRun> = Vec::new();
    let mut last: Option<u64> = None;
    for (blk, data) in blocks {
        match runs.last_mut() {
            Some(run) if last == Some(blk) => {
                // 同一块出现两次：覆盖最后一块
                let bs = data.len();
                let off = run.data.len() - bs;
                run.data[off..].copy_from_slice(&data);
            }
            Some(run) if last.map(|l| l + 1) == Some(blk) => {
                run.data.extend_from_slice(&data);
            }
            _ => runs.push(WriteRun { start: blk, data }),
        }
        last = Some(blk);
    }
    runs
}

impl BlockDev {
    /// 提交一批写
    ///
    /// 不会在第一个错误处停下：剩下的区间照常提交，错误按块计数返回，
    /// 由调用者（flush queue / commit）决定如何处理。
    pub fn write_batch(&self, blocks: Vec<(u64, Vec<u8>)>) -> BatchResult {
        let bs = self.block_size() as usize;
        let mut result = BatchResult::default();
        for run in coalesce_runs(blocks) {
            result.submitted += 1;
            if let Err(e) = self.write_blocks(run.start, &run.data) {
                log::error!(
                    "[BIO] write of {} blocks at {:#x} failed: {}",
                    run.blocks(bs),
                    run.start,
                    e
                );
                result
                    .failed_blocks
                    .extend(run.start..run.start + run.blocks(bs));
            }
        }
        result
    }
}
