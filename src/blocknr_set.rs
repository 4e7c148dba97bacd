//! 块号集合
//!
//! atom 的 delete set（提交后释放的块）和 wandered map（原始块 → 漂移块）
//! 都用它表示。
//!
//! # 结构
//!
//! 集合是若干定长条目组成的链表。每个条目是一个共享数组：
//! 单块号从数组头部向后放，块号对从数组尾部向前放，两端相遇时条目满。
//!
//! ```text
//! entries: [ s0 s1 s2 ... | free | ... b1 a1 b0 a0 ]
//!            nr_singles ->          <- nr_pairs * 2
//! ```
//!
//! 新条目插在链表头部，只有头部条目可能不满（合并之后除外）。
//! 集合不保证顺序，也不去重；重复条目由使用方容忍。

use crate::error::{Error, Result};
use std::collections::VecDeque;

/// 每个条目的槽位数
pub const BLOCKNR_SET_ENTRIES: usize = 14;

/// 集合中的一项
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlocknrItem {
    /// 单个块号
    Single(u64),
    /// 块号对（例如 原始块, 漂移块）
    Pair(u64, u64),
}

/// 定长条目
#[derive(Debug, Clone)]
pub struct BlocknrSetEntry {
    nr_singles: usize,
    nr_pairs: usize,
    entries: [u64; BLOCKNR_SET_ENTRIES],
}

impl Default for BlocknrSetEntry {
    fn default() -> Self {
        Self {
            nr_singles: 0,
            nr_pairs: 0,
            entries: [0; BLOCKNR_SET_ENTRIES],
        }
    }
}

impl BlocknrSetEntry {
    /// 分配一个空条目
    ///
    /// 调用者在不持有 atom 锁时预分配，再带着它重试插入
    pub fn new_boxed() -> Box<Self> {
        Box::default()
    }

    /// 已用槽位
    fn used(&self) -> usize {
        self.nr_singles + 2 * self.nr_pairs
    }

    /// 剩余槽位
    fn avail(&self) -> usize {
        BLOCKNR_SET_ENTRIES - self.used()
    }

    fn single(&self, i: usize) -> u64 {
        self.entries[i]
    }

    fn pair(&self, i: usize) -> (u64, u64) {
        let at = BLOCKNR_SET_ENTRIES - 2 * (i + 1);
        (self.entries[at], self.entries[at + 1])
    }

    fn push_single(&mut self, a: u64) {
        debug_assert!(self.avail() >= 1);
        self.entries[self.nr_singles] = a;
        self.nr_singles += 1;
    }

    fn push_pair(&mut self, a: u64, b: u64) {
        debug_assert!(self.avail() >= 2);
        let at = BLOCKNR_SET_ENTRIES - 2 * (self.nr_pairs + 1);
        self.entries[at] = a;
        self.entries[at + 1] = b;
        self.nr_pairs += 1;
    }

    fn is_empty(&self) -> bool {
        self.used() == 0
    }
}

/// 块号集合
#[derive(Debug, Default)]
pub struct BlocknrSet {
    entries: VecDeque<Box<BlocknrSetEntry>>,
}

impl BlocknrSet {
    /// 创建空集合
    pub fn new() -> Self {
        Self::default()
    }

    /// 集合是否为空
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_empty())
    }

    /// 条目（分配单元）个数
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// 单块号个数
    pub fn singles(&self) -> usize {
        self.entries.iter().map(|e| e.nr_singles).sum()
    }

    /// 块号对个数
    pub fn pairs(&self) -> usize {
        self.entries.iter().map(|e| e.nr_pairs).sum()
    }

    /// 确保头部条目至少有 `need` 个空槽
    ///
    /// 没有空间且没有预分配条目时返回 `Repeat`：调用者应释放锁，
    /// 调用 [`BlocknrSetEntry::new_boxed`]，再重试。
    fn reserve(&mut self, need: usize, prealloc: &mut Option<Box<BlocknrSetEntry>>) -> Result<()> {
        if self.entries.front().map_or(false, |e| e.avail() >= need) {
            return Ok(());
        }
        match prealloc.take() {
            Some(entry) => {
                debug_assert!(entry.is_empty());
                self.entries.push_front(entry);
                Ok(())
            }
            None => Err(Error::repeat()),
        }
    }

    /// 加入单个块号，需要新条目时可能返回 `Repeat`
    pub fn add_single(&mut self, a: u64, prealloc: &mut Option<Box<BlocknrSetEntry>>) -> Result<()> {
        self.reserve(1, prealloc)?;
        if let Some(head) = self.entries.front_mut() {
            head.push_single(a);
        }
        Ok(())
    }

    /// 加入块号对，需要新条目时可能返回 `Repeat`
    pub fn add_pair(
        &mut self,
        a: u64,
        b: u64,
        prealloc: &mut Option<Box<BlocknrSetEntry>>,
    ) -> Result<()> {
        self.reserve(2, prealloc)?;
        if let Some(head) = self.entries.front_mut() {
            head.push_pair(a, b);
        }
        Ok(())
    }

    /// 加入单个块号，必要时直接分配条目
    pub fn insert_single(&mut self, a: u64) {
        let mut prealloc = Some(BlocknrSetEntry::new_boxed());
        // 有预分配条目时 add_single 不会失败
        let _ = self.add_single(a, &mut prealloc);
    }

    /// 加入块号对，必要时直接分配条目
    pub fn insert_pair(&mut self, a: u64, b: u64) {
        let mut prealloc = Some(BlocknrSetEntry::new_boxed());
        let _ = self.add_pair(a, b, &mut prealloc);
    }

    /// 把 `from` 并入 `self`，`from` 变为空
    ///
    /// 两个头部条目都不满时，如果能放得下，先把 `from` 的头部条目
    /// 拷进 `self` 的头部条目，避免浪费空间；其余条目整体拼接。
    pub fn merge_from(&mut self, from: &mut BlocknrSet) {
        let mut taken = core::mem::take(&mut from.entries);
        if let (Some(into_head), Some(from_head)) = (self.entries.front_mut(), taken.front()) {
            if into_head.avail() >= from_head.used() {
                for i in 0..from_head.nr_singles {
                    into_head.push_single(from_head.single(i));
                }
                for i in 0..from_head.nr_pairs {
                    let (a, b) = from_head.pair(i);
                    into_head.push_pair(a, b);
                }
                taken.pop_front();
            }
        }
        // 插入只看头部条目，from 剩下的条目接在后面
        self.entries.extend(taken);
    }

    /// 访问所有单块号和块号对
    ///
    /// `delete` 为真时每个条目访问完就释放，结束后集合为空。
    /// 访问函数返回错误时立即停止；已经访问完的条目在 `delete` 模式下已释放。
    pub fn iterate<F>(&mut self, mut visit: F, delete: bool) -> Result<()>
    where
        F: FnMut(BlocknrItem) -> Result<()>,
    {
        if !delete {
            for entry in &self.entries {
                visit_entry(entry, &mut visit)?;
            }
            return Ok(());
        }
        while let Some(entry) = self.entries.pop_front() {
            if let Err(e) = visit_entry(&entry, &mut visit) {
                self.entries.push_front(entry);
                return Err(e);
            }
        }
        Ok(())
    }

    /// 收集所有项（测试和调试用）
    pub fn items(&self) -> Vec<BlocknrItem> {
        let mut out = Vec::new();
        for entry in &self.entries {
            let _ = visit_entry(entry, &mut |item| {
                out.push(item);
                Ok(())
            });
        }
        out
    }

    /// 清空集合
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn visit_entry<F>(entry: &BlocknrSetEntry, visit: &mut F) -> Result<()>
where
    F: FnMut(BlocknrItem) -> Result<()>,
{
    for i in 0..entry.nr_singles {
        visit(BlocknrItem::Single(entry.single(i)))?;
    }
    for i in 0..entry.nr_pairs {
        let (a, b) = entry.pair(i);
        visit(BlocknrItem::Pair(a, b))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;

    fn sorted(mut v: Vec<BlocknrItem>) -> Vec<BlocknrItem> {
        v.sort();
        v
    }

    #[test]
    fn test_add_requires_prealloc_when_full() {
        let mut set = BlocknrSet::new();
        let mut none = None;
        let err = set.add_single(1, &mut none).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Repeat);

        let mut prealloc = Some(BlocknrSetEntry::new_boxed());
        set.add_single(1, &mut prealloc).unwrap();
        assert!(prealloc.is_none());

        // 同一条目还有空间，不需要预分配
        set.add_pair(2, 3, &mut none).unwrap();
        assert_eq!(set.entry_count(), 1);
    }

    #[test]
    fn test_singles_and_pairs_share_entry() {
        let mut set = BlocknrSet::new();
        for i in 0..4 {
            set.insert_single(i);
        }
        for i in 0..5 {
            set.insert_pair(100 + i, 200 + i);
        }
        // 4 + 5*2 = 14 槽位，正好一个条目
        assert_eq!(set.entry_count(), 1);
        set.insert_single(99);
        assert_eq!(set.entry_count(), 2);
        assert_eq!(set.singles(), 5);
        assert_eq!(set.pairs(), 5);
    }

    #[test]
    fn test_merge_fuses_partial_heads() {
        let mut a = BlocknrSet::new();
        let mut b = BlocknrSet::new();
        a.insert_single(1);
        a.insert_pair(2, 3);
        b.insert_single(4);

        b.merge_from(&mut a);
        assert!(a.is_empty());
        assert_eq!(b.entry_count(), 1);
        assert_eq!(
            sorted(b.items()),
            vec![
                BlocknrItem::Single(1),
                BlocknrItem::Single(4),
                BlocknrItem::Pair(2, 3)
            ]
        );
    }

    #[test]
    fn test_iterate_delete_empties_set() {
        let mut set = BlocknrSet::new();
        for i in 0..40 {
            set.insert_single(i);
        }
        let mut seen = 0;
        set.iterate(
            |_| {
                seen += 1;
                Ok(())
            },
            true,
        )
        .unwrap();
        assert_eq!(seen, 40);
        assert!(set.is_empty());
        assert_eq!(set.entry_count(), 0);
    }

    #[test]
    fn test_iterate_stops_on_error() {
        let mut set = BlocknrSet::new();
        set.insert_single(7);
        set.insert_single(8);
        let res = set.iterate(|_| Err(Error::new(ErrorKind::Io, "visitor failed")), true);
        assert!(res.is_err());
        // 失败的条目保留
        assert_eq!(set.singles(), 2);
    }

    fn apply(set: &mut BlocknrSet, ops: &[(bool, u64, u64)]) -> Vec<BlocknrItem> {
        let mut expected = Vec::new();
        for &(pair, a, b) in ops {
            if pair {
                set.insert_pair(a, b);
                expected.push(BlocknrItem::Pair(a, b));
            } else {
                set.insert_single(a);
                expected.push(BlocknrItem::Single(a));
            }
        }
        expected
    }

    proptest! {
        #[test]
        fn prop_iterate_visits_exactly_added(ops in proptest::collection::vec((any::<bool>(), any::<u64>(), any::<u64>()), 0..200)) {
            let mut set = BlocknrSet::new();
            let expected = apply(&mut set, &ops);
            let mut seen = Vec::new();
            set.iterate(|item| { seen.push(item); Ok(()) }, false).unwrap();
            prop_assert_eq!(sorted(seen), sorted(expected));
        }

        #[test]
        fn prop_merge_is_union(
            left in proptest::collection::vec((any::<bool>(), any::<u64>(), any::<u64>()), 0..100),
            right in proptest::collection::vec((any::<bool>(), any::<u64>(), any::<u64>()), 0..100),
        ) {
            let mut a = BlocknrSet::new();
            let mut b = BlocknrSet::new();
            let mut expected = apply(&mut a, &left);
            expected.extend(apply(&mut b, &right));

            b.merge_from(&mut a);
            prop_assert!(a.is_empty());
            prop_assert_eq!(sorted(b.items()), sorted(expected));
        }
    }
}
