//! 挂载时的日志恢复
//!
//! header 指向最近提交的事务，footer 指向最近写回完成的事务。两者不同时，
//! 沿 tx head 的 `prev_tx` 从 header 往回走到 footer，再从最老的未写回事务
//! 开始逐个重放：把漂移副本拷回原位置，然后推进 footer。
//!
//! 重放是幂等的：中途崩溃后再重放一次，结果相同。

use super::{
    format::{JournalFooter, JournalHeader, TxHead, WanderRecord},
    JournalError, JournalState,
};
use crate::{
    block::BlockDev,
    consts::{JOURNAL_FOOTER_BLOCK, JOURNAL_HEADER_BLOCK},
    error::Result,
    layout::SuperCounters,
};

/// 恢复结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    /// 重放的事务数
    pub replayed: usize,
    /// 拷回原位置的块数
    pub blocks: usize,
    /// 恢复后的 journal 指针
    pub journal: JournalState,
    /// 恢复后 footer 中的计数器
    pub counters: SuperCounters,
}

/// 读取并校验一个事务的全部 wander 条目
fn read_entries(dev: &BlockDev, head: &TxHead) -> Result<Vec<(u64, u64)>> {
    let total_blocks = dev.total_blocks();
    let mut entries = Vec::new();
    let mut cur = head.next_block;
    for serial in 1..head.total {
        if cur == 0 || cur >= total_blocks {
            log::error!("[REPLAY] tx {}: record {} missing", head.id, serial);
            return Err(JournalError::RecordCount.into());
        }
        let rec = WanderRecord::decode(&dev.read_block(cur)?)?;
        if rec.id != head.id || rec.serial != serial || rec.total != head.total {
            log::error!(
                "[REPLAY] tx {}: record at {:#x} is id {} serial {}/{}",
                head.id,
                cur,
                rec.id,
                rec.serial,
                rec.total
            );
            return Err(JournalError::RecordCount.into());
        }
        for &(original, wandered) in &rec.entries {
            if original >= total_blocks || wandered >= total_blocks {
                return Err(JournalError::BrokenChain.into());
            }
        }
        entries.extend(rec.entries);
        cur = rec.next_block;
    }
    if cur != 0 {
        return Err(JournalError::RecordCount.into());
    }
    Ok(entries)
}

/// 重放一个事务，返回拷贝的块数
fn replay_tx(dev: &BlockDev, head_blk: u64, head: &TxHead) -> Result<usize> {
    let bs = dev.block_size() as usize;
    let entries = read_entries(dev, head)?;
    let mut batch = Vec::with_capacity(entries.len());
    for &(original, wandered) in &entries {
        batch.push((original, dev.read_block(wandered)?));
    }
    let res = dev.write_batch(batch);
    if !res.is_ok() {
        return Err(JournalError::IoError.into());
    }
    dev.flush_and_wait()?;
    dev.write_block(
        JOURNAL_FOOTER_BLOCK,
        &JournalFooter {
            last_flushed: head_blk,
            counters: head.counters,
        }
        .encode(bs),
    )?;
    dev.flush_and_wait()?;
    log::info!(
        "[REPLAY] tx {} at {:#x}: {} blocks restored",
        head.id,
        head_blk,
        entries.len()
    );
    Ok(entries.len())
}

/// 恢复未写回的事务
///
/// # 错误
///
/// - `Corrupted` - tx head / wander record magic 不匹配，或事务链断裂
/// - `Io` - 设备读写失败
pub fn replay(dev: &BlockDev) -> Result<ReplayReport> {
    let header = JournalHeader::decode(&dev.read_block(JOURNAL_HEADER_BLOCK)?)?;
    let footer = JournalFooter::decode(&dev.read_block(JOURNAL_FOOTER_BLOCK)?)?;

    if header.last_committed == footer.last_flushed {
        let next_tx_id = if header.last_committed == 0 {
            1
        } else {
            // 旧版本的映像里 footer 指向的块可能已被重用
            dev.read_block(header.last_committed)
                .ok()
                .and_then(|buf| TxHead::decode(&buf).ok())
                .map_or(1, |h| h.id + 1)
        };
        log::debug!("[REPLAY] journal clean (last tx {:#x})", header.last_committed);
        return Ok(ReplayReport {
            replayed: 0,
            blocks: 0,
            journal: JournalState {
                last_committed: header.last_committed,
                last_flushed: footer.last_flushed,
                next_tx_id,
            },
            counters: footer.counters,
        });
    }

    // 从 header 往回走到 footer
    let mut chain = Vec::new();
    let mut cur = header.last_committed;
    loop {
        if cur == 0 || cur >= dev.total_blocks() || chain.len() as u64 > dev.total_blocks() {
            log::error!(
                "[REPLAY] chain from {:#x} never reaches {:#x}",
                header.last_committed,
                footer.last_flushed
            );
            return Err(JournalError::BrokenChain.into());
        }
        let head = TxHead::decode(&dev.read_block(cur)?)?;
        let prev = head.prev_tx;
        chain.push((cur, head));
        if prev == footer.last_flushed {
            break;
        }
        cur = prev;
    }
    log::info!("[REPLAY] {} unflushed transactions", chain.len());

    let mut blocks = 0;
    let mut counters = footer.counters;
    let mut last_id = 0;
    for (head_blk, head) in chain.iter().rev() {
        blocks += replay_tx(dev, *head_blk, head)?;
        counters = head.counters;
        last_id = head.id;
    }
    Ok(ReplayReport {
        replayed: chain.len(),
        blocks,
        journal: JournalState {
            last_committed: header.last_committed,
            last_flushed: header.last_committed,
            next_tx_id: last_id + 1,
        },
        counters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        balloc::BlockAllocator,
        block::MemDevice,
        error::ErrorKind,
        jnode::{JnodeKind, JnodeTable},
        layout::format,
        wander::{write_logs, write_tx_back, CommitHandle, OverwriteEntry},
    };

    fn committed_tx(
        dev: &BlockDev,
        alloc: &BlockAllocator,
        journal: &mut JournalState,
        table: &JnodeTable,
        fill: u8,
    ) -> CommitHandle {
        let overwrite = [200u64, 201]
            .iter()
            .map(|&b| OverwriteEntry {
                node: table.jget(JnodeKind::Formatted { level: 1 }, b),
                original: b,
                data: vec![fill; 512],
            })
            .collect();
        let counters = SuperCounters { free_blocks: fill as u64, nr_files: 0, next_oid: 9 };
        let mut ch = CommitHandle::new(1, overwrite, counters, 0);
        write_logs(dev, alloc, journal, &mut ch).unwrap();
        ch
    }

    #[test]
    fn test_clean_journal() {
        let dev = BlockDev::new(MemDevice::new(512, 256)).unwrap();
        format(&dev).unwrap();
        let report = replay(&dev).unwrap();
        assert_eq!(report.replayed, 0);
        assert_eq!(report.journal, JournalState::default());
    }

    #[test]
    fn test_replay_after_header_only() {
        let mem = MemDevice::new(512, 512);
        let dev = BlockDev::new(mem.clone()).unwrap();
        format(&dev).unwrap();
        let alloc = BlockAllocator::load(&dev).unwrap();
        let table = JnodeTable::new(512, 4);
        let mut journal = JournalState::default();

        // 第一个事务完整写回，第二个只到 header
        let mut ch = committed_tx(&dev, &alloc, &mut journal, &table, 1);
        write_tx_back(&dev, &alloc, &mut journal, &mut ch).unwrap();
        committed_tx(&dev, &alloc, &mut journal, &table, 2);
        assert_eq!(mem.peek(200), vec![1u8; 512]);

        let report = replay(&dev).unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.blocks, 2);
        assert_eq!(report.counters.free_blocks, 2);
        assert_eq!(mem.peek(200), vec![2u8; 512]);
        assert_eq!(mem.peek(201), vec![2u8; 512]);

        // 第二次挂载没有事情可做
        let again = replay(&dev).unwrap();
        assert_eq!(again.replayed, 0);
        assert_eq!(again.journal.last_flushed, report.journal.last_flushed);
    }

    #[test]
    fn test_replay_walks_several_transactions() {
        let mem = MemDevice::new(512, 512);
        let dev = BlockDev::new(mem.clone()).unwrap();
        format(&dev).unwrap();
        let alloc = BlockAllocator::load(&dev).unwrap();
        let table = JnodeTable::new(512, 4);
        let mut journal = JournalState::default();
        committed_tx(&dev, &alloc, &mut journal, &table, 3);
        committed_tx(&dev, &alloc, &mut journal, &table, 4);

        let report = replay(&dev).unwrap();
        assert_eq!(report.replayed, 2);
        // 新的事务最后重放
        assert_eq!(mem.peek(200), vec![4u8; 512]);
        assert_eq!(report.journal.next_tx_id, 3);
    }

    #[test]
    fn test_corrupted_record_halts_replay() {
        let mem = MemDevice::new(512, 512);
        let dev = BlockDev::new(mem.clone()).unwrap();
        format(&dev).unwrap();
        let alloc = BlockAllocator::load(&dev).unwrap();
        let table = JnodeTable::new(512, 4);
        let mut journal = JournalState::default();
        let ch = committed_tx(&dev, &alloc, &mut journal, &table, 5);
        mem.poke(ch.tx_blocks[1], &vec![0xEEu8; 512]);

        let err = replay(&dev).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupted);
        // 原位置没有被部分写
        assert_eq!(mem.peek(200), vec![0u8; 512]);
    }
}
