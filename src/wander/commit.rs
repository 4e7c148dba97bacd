//! 日志提交写
//!
//! 调用者持有 journal 锁（提交串行化），本模块只负责 I/O 顺序和日志块的分配释放。

use super::{
    format::{entries_per_record, records_needed, JournalFooter, JournalHeader, TxHead, WanderRecord},
    CommitHandle, JournalError, JournalState,
};
use crate::{
    balloc::{BlockAllocator, BlockRange},
    block::BlockDev,
    consts::{JOURNAL_FOOTER_BLOCK, JOURNAL_HEADER_BLOCK},
    error::{Error, Result},
};

/// 为日志分配 `count` 块，优先使用预留
fn alloc_log_blocks(alloc: &BlockAllocator, ch: &mut CommitHandle, count: usize) -> Result<Vec<u64>> {
    let mut blocks = Vec::with_capacity(count);
    let mut hint = alloc.first_data_block();
    while blocks.len() < count {
        let want = (count - blocks.len()) as u64;
        let reserved_left = ch.reserved - ch.used_reserved;
        let range = if reserved_left > 0 {
            let r = alloc.alloc_near(hint, want.min(reserved_left), true)?;
            ch.used_reserved += r.len;
            r
        } else {
            alloc.alloc_near(hint, want, false)?
        };
        blocks.extend(range.start..range.end());
        hint = range.end();
    }
    Ok(blocks)
}

/// 释放本次提交分配的日志块
///
/// 成功提交后在 footer 更新之后调用；提交失败且未越过提交点时也调用，
/// 同时把用掉的预留还回去，atom 重试时还能用。
pub(crate) fn release_log_blocks(alloc: &BlockAllocator, ch: &mut CommitHandle, restore_grab: bool) {
    for blk in ch.tx_blocks.drain(..).chain(ch.wandered.drain(..)) {
        if let Err(e) = alloc.dealloc(BlockRange::single(blk)) {
            log::warn!("[WANDER] failed to release log block {:#x}: {}", blk, e);
        }
    }
    if restore_grab && ch.used_reserved > 0 {
        if alloc.grab(ch.used_reserved).is_err() {
            log::warn!("[WANDER] could not restore {} reserved blocks", ch.used_reserved);
        }
    }
    ch.used_reserved = 0;
    ch.wandered_map.clear();
}

/// 提交步骤 2–6：写日志并翻转 journal header
///
/// 返回时事务已提交（header 持久）。出错时 `ch.past_commit_point()`
/// 说明失败发生在 header 写之前还是之后。
pub(crate) fn write_logs(
    dev: &BlockDev,
    alloc: &BlockAllocator,
    journal: &mut JournalState,
    ch: &mut CommitHandle,
) -> Result<()> {
    let bs = dev.block_size() as usize;
    let n = ch.overwrite.len();
    let total = records_needed(n, bs) + 1;

    let mut blocks = alloc_log_blocks(alloc, ch, total + n).map_err(|e| {
        log::warn!("[WANDER] cannot allocate {} log blocks: {}", total + n, e);
        Error::from(JournalError::NoSpace)
    })?;
    ch.wandered = blocks.split_off(total);
    ch.tx_blocks = blocks;
    ch.tx_id = journal.next_tx_id;
    journal.next_tx_id += 1;

    let pairs: Vec<(u64, u64)> = ch
        .overwrite
        .iter()
        .zip(ch.wandered.iter())
        .map(|(e, &w)| (e.original, w))
        .collect();
    for &(original, wandered) in &pairs {
        ch.wandered_map.insert_pair(original, wandered);
    }

    let head_blk = ch.tx_blocks[0];
    let head = TxHead {
        id: ch.tx_id,
        total: total as u32,
        prev_tx: journal.last_committed,
        next_block: ch.tx_blocks.get(1).copied().unwrap_or(0),
        counters: ch.counters,
    };
    let mut batch = Vec::with_capacity(total + n);
    batch.push((head_blk, head.encode(bs)));
    for (i, chunk) in pairs.chunks(entries_per_record(bs)).enumerate() {
        let serial = i + 1;
        let record = WanderRecord {
            id: ch.tx_id,
            total: total as u32,
            serial: serial as u32,
            next_block: ch.tx_blocks.get(serial + 1).copied().unwrap_or(0),
            entries: chunk.to_vec(),
        };
        batch.push((ch.tx_blocks[serial], record.encode(bs)));
    }
    for (entry, &wandered) in ch.overwrite.iter().zip(ch.wandered.iter()) {
        batch.push((wandered, entry.data.clone()));
    }

    let res = dev.write_batch(batch);
    if !res.is_ok() {
        log::error!(
            "[WANDER] tx {}: {} log blocks failed to write",
            ch.tx_id,
            res.failed_blocks.len()
        );
        return Err(JournalError::IoError.into());
    }
    dev.flush_and_wait()?;

    // 提交点
    ch.header_attempted = true;
    dev.write_block(
        JOURNAL_HEADER_BLOCK,
        &JournalHeader { last_committed: head_blk }.encode(bs),
    )?;
    dev.flush_and_wait()?;
    journal.last_committed = head_blk;
    log::info!(
        "[WANDER] tx {} committed: head {:#x}, {} records, {} overwrite blocks",
        ch.tx_id,
        head_blk,
        total - 1,
        n
    );
    Ok(())
}

/// 提交步骤 7–9：原地写回、更新 footer、释放日志块
///
/// 本事务的 tx head 保持已用，直到下一个事务的 footer 持久；
/// 上一个事务留下的 tx head 在这里释放。
pub(crate) fn write_tx_back(
    dev: &BlockDev,
    alloc: &BlockAllocator,
    journal: &mut JournalState,
    ch: &mut CommitHandle,
) -> Result<()> {
    let bs = dev.block_size() as usize;
    let head_blk = ch
        .tx_head()
        .ok_or(Error::from(JournalError::BrokenChain))?;
    let batch: Vec<(u64, Vec<u8>)> = ch
        .overwrite
        .iter()
        .map(|e| (e.original, e.data.clone()))
        .collect();
    let res = dev.write_batch(batch);
    if !res.is_ok() {
        log::error!(
            "[WANDER] tx {}: {} in-place writes failed",
            ch.tx_id,
            res.failed_blocks.len()
        );
        return Err(JournalError::IoError.into());
    }
    dev.flush_and_wait()?;

    dev.write_block(
        JOURNAL_FOOTER_BLOCK,
        &JournalFooter {
            last_flushed: head_blk,
            counters: ch.counters,
        }
        .encode(bs),
    )?;
    dev.flush_and_wait()?;
    let prev_head = std::mem::replace(&mut journal.last_flushed, head_blk);

    // footer 持久之后日志块才能重用。footer 指向的 tx head 要留到下一次
    // footer 翻转：它被重用的话，下一个事务提交后 header 和 footer 会相等
    ch.tx_blocks.retain(|&blk| blk != head_blk);
    if prev_head != 0 && prev_head != head_blk {
        if let Err(e) = alloc.dealloc(BlockRange::single(prev_head)) {
            log::warn!("[WANDER] failed to release tx head {:#x}: {}", prev_head, e);
        }
    }
    let wandered = ch.wandered_map.items();
    release_log_blocks(alloc, ch, false);
    log::debug!(
        "[WANDER] tx {} written back, {} wandered blocks released",
        ch.tx_id,
        wandered.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::MemDevice,
        jnode::{JnodeKind, JnodeTable},
        layout::{format, SuperCounters},
        wander::OverwriteEntry,
    };

    fn setup() -> (MemDevice, BlockDev, BlockAllocator) {
        let mem = MemDevice::new(512, 512);
        let dev = BlockDev::new(mem.clone()).unwrap();
        format(&dev).unwrap();
        let alloc = BlockAllocator::load(&dev).unwrap();
        (mem, dev, alloc)
    }

    fn entries(table: &JnodeTable, blocks: &[u64]) -> Vec<OverwriteEntry> {
        blocks
            .iter()
            .map(|&b| OverwriteEntry {
                node: table.jget(JnodeKind::Formatted { level: 1 }, b),
                original: b,
                data: vec![b as u8; 512],
            })
            .collect()
    }

    #[test]
    fn test_commit_sequence() {
        let (mem, dev, alloc) = setup();
        let table = JnodeTable::new(512, 4);
        let free_before = alloc.free_blocks();
        let counters = SuperCounters { free_blocks: 7, nr_files: 1, next_oid: 2 };
        let mut ch = CommitHandle::new(1, entries(&table, &[100, 101]), counters, 0);
        let mut journal = JournalState::default();

        write_logs(&dev, &alloc, &mut journal, &mut ch).unwrap();
        let head = ch.tx_head().unwrap();
        assert_eq!(journal.last_committed, head);
        // tx head + 1 record + 2 wandered copies
        assert_eq!(alloc.free_blocks(), free_before - 4);
        assert_eq!(ch.wandered_map.pairs(), 2);
        // 原位置还没写
        assert_eq!(mem.peek(100), vec![0u8; 512]);
        assert_eq!(mem.peek(ch.wandered[0]), vec![100u8; 512]);

        write_tx_back(&dev, &alloc, &mut journal, &mut ch).unwrap();
        assert_eq!(mem.peek(100), vec![100u8; 512]);
        assert_eq!(journal.last_flushed, head);
        // footer 指向的 tx head 还占着
        assert_eq!(alloc.free_blocks(), free_before - 1);
        assert!(alloc.is_allocated(head));
        let footer = JournalFooter::decode(&mem.peek(JOURNAL_FOOTER_BLOCK)).unwrap();
        assert_eq!(footer.counters, counters);
    }

    #[test]
    fn test_flushed_tx_head_is_not_reused_by_next_tx() {
        let (_mem, dev, alloc) = setup();
        let table = JnodeTable::new(512, 4);
        let free_before = alloc.free_blocks();
        let mut journal = JournalState::default();
        let mut heads = Vec::new();
        for id in 1..=3 {
            let mut ch = CommitHandle::new(id, entries(&table, &[100]), SuperCounters::default(), 0);
            write_logs(&dev, &alloc, &mut journal, &mut ch).unwrap();
            let head = ch.tx_head().unwrap();
            // 新事务的 tx head 不能落在 footer 还指着的块上
            assert_ne!(head, journal.last_flushed);
            write_tx_back(&dev, &alloc, &mut journal, &mut ch).unwrap();
            heads.push(head);
        }
        assert_ne!(heads[0], heads[1]);
        assert_ne!(heads[1], heads[2]);
        assert!(!alloc.is_allocated(heads[1]));
        assert!(alloc.is_allocated(heads[2]));
        assert_eq!(alloc.free_blocks(), free_before - 1);
    }

    #[test]
    fn test_log_write_failure_before_header() {
        let (mem, dev, alloc) = setup();
        let table = JnodeTable::new(512, 4);
        let mut ch = CommitHandle::new(1, entries(&table, &[100]), SuperCounters::default(), 0);
        let mut journal = JournalState::default();
        mem.fail_after(1);
        let err = write_logs(&dev, &alloc, &mut journal, &mut ch).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
        assert!(!ch.past_commit_point());
        assert_eq!(journal.last_committed, 0);
        let header = JournalHeader::decode(&mem.peek(JOURNAL_HEADER_BLOCK)).unwrap();
        assert_eq!(header.last_committed, 0);
    }

    #[test]
    fn test_reserved_blocks_are_consumed_first() {
        let (_mem, dev, alloc) = setup();
        let table = JnodeTable::new(512, 4);
        alloc.grab(2).unwrap();
        let mut ch = CommitHandle::new(1, entries(&table, &[100, 101]), SuperCounters::default(), 2);
        let mut journal = JournalState::default();
        write_logs(&dev, &alloc, &mut journal, &mut ch).unwrap();
        assert_eq!(ch.used_reserved, 2);
        assert_eq!(alloc.grabbed_blocks(), 0);
    }
}
