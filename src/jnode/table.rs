//! jnode 表
//!
//! 按键查找 jnode，保证同一个块在内存中只有一个 jnode。
//!
//! 表本身只持有弱引用；被 atom 捕获的节点由 atom 链表持有，
//! 外部正在使用的节点由调用者持有。没有任何引用、干净且未被捕获的节点
//! 放进 LRU 空闲缓存（相当于"页面驻留"），被驱逐时释放。

use super::{blocknr_is_fake, Jnode, JnodeKind, JnodeOps, JnodeRef, JnodeState, Mapping};
use crate::{
    block::BlockDev,
    consts::FAKE_BLOCKNR_BIT,
    error::Result,
};
use lru::LruCache;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

/// jnode 查找键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JnodeKey {
    /// 树节点和日志块：按块号
    Block(u64),
    /// 数据页：按 (oid, 页号)
    Page {
        /// 对象
        oid: u64,
        /// 页号
        index: u64,
    },
    /// 位图块：按位图序号
    Bitmap(u64),
    /// 内嵌节点：按对象
    Inline(u64),
}

impl JnodeKey {
    /// 由类型和块号得到键
    pub fn of(kind: JnodeKind, blocknr: u64) -> Self {
        let index = kind.index(blocknr);
        match kind.mapping() {
            Mapping::Tree | Mapping::Log => JnodeKey::Block(index),
            Mapping::Object(oid) => JnodeKey::Page { oid, index },
            Mapping::Bitmap => JnodeKey::Bitmap(index),
            Mapping::Inline(oid) => JnodeKey::Inline(oid),
        }
    }
}

struct TableInner {
    map: HashMap<JnodeKey, Weak<Jnode>>,
    idle: LruCache<JnodeKey, JnodeRef>,
}

/// jnode 表
pub struct JnodeTable {
    block_size: usize,
    next_id: AtomicU64,
    next_fake: AtomicU64,
    inner: Mutex<TableInner>,
}

impl JnodeTable {
    /// 创建 jnode 表
    ///
    /// # 参数
    ///
    /// * `block_size` - 块大小
    /// * `cache_size` - 空闲缓存容量
    pub fn new(block_size: u32, cache_size: usize) -> Self {
        Self {
            block_size: block_size as usize,
            next_id: AtomicU64::new(1),
            next_fake: AtomicU64::new(1),
            inner: Mutex::new(TableInner {
                map: HashMap::new(),
                idle: LruCache::new(NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN)),
            }),
        }
    }

    /// 块大小
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// 分配一个假块号
    pub fn next_fake_blocknr(&self) -> u64 {
        FAKE_BLOCKNR_BIT | self.next_fake.fetch_add(1, Ordering::Relaxed)
    }

    fn alloc_node(&self, kind: JnodeKind, blocknr: u64, state: JnodeState) -> JnodeRef {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(Jnode::new(id, kind, blocknr, state))
    }

    /// 查找 jnode，不存在时返回 `None`
    ///
    /// 找到的节点引用数加一，调用者用完后调用 [`release`](Self::release)
    pub fn jlookup(&self, key: JnodeKey) -> Option<JnodeRef> {
        let mut inner = self.inner.lock();
        let node = match inner.map.get(&key).and_then(Weak::upgrade) {
            Some(node) => node,
            None => {
                inner.map.remove(&key);
                return None;
            }
        };
        inner.idle.pop(&key);
        node.acquire();
        Some(node)
    }

    /// 查找或创建 jnode
    ///
    /// 新建的节点还没有数据，需要 [`load`](Self::load)
    pub fn jget(&self, kind: JnodeKind, blocknr: u64) -> JnodeRef {
        let key = JnodeKey::of(kind, blocknr);
        if let Some(node) = self.jlookup(key) {
            return node;
        }
        let mut inner = self.inner.lock();
        // 加锁期间可能已被其他线程创建
        if let Some(node) = inner.map.get(&key).and_then(Weak::upgrade) {
            inner.idle.pop(&key);
            node.acquire();
            return node;
        }
        let node = self.alloc_node(kind, blocknr, JnodeState::empty());
        inner.map.insert(key, Arc::downgrade(&node));
        node.acquire();
        node
    }

    /// 创建一个新节点：假块号，`CREATED`，数据已初始化
    pub fn create(&self, kind: JnodeKind) -> JnodeRef {
        let blocknr = self.next_fake_blocknr();
        let node = self.alloc_node(kind, blocknr, JnodeState::CREATED | JnodeState::LOADED);
        node.inner.lock().data = kind.init(self.block_size);
        self.inner
            .lock()
            .map
            .insert(JnodeKey::of(kind, blocknr), Arc::downgrade(&node));
        node.acquire();
        node
    }

    /// 加载节点数据
    ///
    /// 已加载或假块号的节点不读盘
    pub fn load(&self, node: &JnodeRef, dev: &BlockDev) -> Result<()> {
        let blocknr = {
            let inner = node.lock();
            if inner.state.contains(JnodeState::LOADED) {
                return Ok(());
            }
            inner.blocknr
        };
        let data = if blocknr_is_fake(blocknr) {
            node.kind().init(self.block_size)
        } else {
            dev.read_block(blocknr)?
        };
        let mut inner = node.lock();
        if !inner.state.contains(JnodeState::LOADED) {
            inner.data = data;
            inner.state.insert(JnodeState::LOADED);
        }
        Ok(())
    }

    /// 节点块号变化后更新键
    pub fn rehash(&self, node: &JnodeRef, old_blocknr: u64, new_blocknr: u64) {
        let old_key = JnodeKey::of(node.kind(), old_blocknr);
        let new_key = JnodeKey::of(node.kind(), new_blocknr);
        if old_key == new_key {
            return;
        }
        let mut inner = self.inner.lock();
        inner.map.remove(&old_key);
        inner.idle.pop(&old_key);
        inner.map.insert(new_key, Arc::downgrade(node));
        log::trace!("[JNODE] rehash {:?} -> {:?}", old_key, new_key);
    }

    /// 释放一个引用
    ///
    /// 最后一个引用释放时，空闲节点进入 LRU 缓存；
    /// 驱逐出的节点如果没有其他持有者就被销毁
    pub fn release(&self, node: JnodeRef) {
        if node.put_ref() != 0 || !node.is_idle() {
            return;
        }
        let key = JnodeKey::of(node.kind(), node.blocknr());
        let deleted = node.state().contains(JnodeState::HEARD_BANSHEE);
        let evicted = {
            let mut inner = self.inner.lock();
            if deleted {
                inner.map.remove(&key);
                None
            } else {
                inner.idle.push(key, node)
            }
        };
        if let Some((old_key, old)) = evicted {
            if old_key != key {
                log::trace!("[JNODE] evict {:?}", old_key);
            }
            drop(old);
        }
    }

    /// 提交完成后，把没有外部引用的节点放进空闲缓存
    pub fn park(&self, node: JnodeRef) {
        if !node.is_idle() {
            return;
        }
        let key = JnodeKey::of(node.kind(), node.blocknr());
        let evicted = self.inner.lock().idle.push(key, node);
        drop(evicted);
    }

    /// 从表中删除节点（节点被删除时）
    pub fn forget(&self, node: &JnodeRef) {
        let key = JnodeKey::of(node.kind(), node.blocknr());
        let mut inner = self.inner.lock();
        inner.idle.pop(&key);
        if inner
            .map
            .get(&key)
            .map_or(false, |w| w.as_ptr() == Arc::as_ptr(node))
        {
            inner.map.remove(&key);
        }
    }

    /// 空闲缓存中的节点数
    pub fn idle_count(&self) -> usize {
        self.inner.lock().idle.len()
    }

    /// 表中仍然存活的节点数
    pub fn live_count(&self) -> usize {
        self.inner
            .lock()
            .map
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDevice;

    #[test]
    fn test_jget_returns_same_node() {
        let table = JnodeTable::new(512, 4);
        let a = table.jget(JnodeKind::Formatted { level: 1 }, 100);
        let b = table.jget(JnodeKind::Formatted { level: 1 }, 100);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.x_count(), 2);
        let c = table.jget(JnodeKind::Unformatted { oid: 1, index: 100 }, 0);
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(table.live_count(), 2);
    }

    #[test]
    fn test_idle_cache_keeps_node_resident() {
        let table = JnodeTable::new(512, 2);
        let a = table.jget(JnodeKind::Formatted { level: 1 }, 10);
        let id = a.id();
        table.release(a);
        assert_eq!(table.idle_count(), 1);
        let again = table.jlookup(JnodeKey::Block(10)).unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(table.idle_count(), 0);
        table.release(again);

        // 容量为 2，第三个空闲节点把最旧的挤出去
        for blk in [11, 12] {
            let n = table.jget(JnodeKind::Formatted { level: 1 }, blk);
            table.release(n);
        }
        assert_eq!(table.idle_count(), 2);
        assert!(table.jlookup(JnodeKey::Block(10)).is_none());
    }

    #[test]
    fn test_create_and_rehash() {
        let table = JnodeTable::new(512, 4);
        let n = table.create(JnodeKind::Formatted { level: 2 });
        let fake = n.blocknr();
        assert!(blocknr_is_fake(fake));
        assert!(n.state().contains(JnodeState::CREATED));
        assert_eq!(n.data()[0], 2);
        assert_eq!(n.data().len(), 512);

        n.inner.lock().blocknr = 77;
        table.rehash(&n, fake, 77);
        let found = table.jlookup(JnodeKey::Block(77)).unwrap();
        assert!(Arc::ptr_eq(&found, &n));
        assert!(table.jlookup(JnodeKey::Block(fake)).is_none());
    }

    #[test]
    fn test_load_reads_device() {
        let mem = MemDevice::new(512, 64);
        mem.poke(20, &[0xAB; 512]);
        let dev = BlockDev::new(mem).unwrap();
        let table = JnodeTable::new(512, 4);
        let n = table.jget(JnodeKind::Formatted { level: 1 }, 20);
        table.load(&n, &dev).unwrap();
        assert_eq!(n.data()[0], 0xAB);
        assert_eq!(dev.read_count(), 1);
        // 第二次不读盘
        table.load(&n, &dev).unwrap();
        assert_eq!(dev.read_count(), 1);
    }
}
