//! 内存参考树
//!
//! 一个足够完整的 [`TreeLayer`] 实现：格式化节点保存 item 列表，
//! 每次结构变化后把节点内容按磁盘格式渲染进 jnode 数据，
//! 挂载时可以从磁盘重新读回。
//!
//! 不做键分裂和平衡：结构由调用者通过 `set_root` / `append_child` /
//! `append_extent` 搭建，flush 时的 squeeze 会改变内容分布。

use super::{
    node::{decode_node, encode_node, NodeItem, NODE_HEADER_SIZE},
    SqueezeResult, TreeItem, TreeLayer,
};
use crate::{
    block::BlockDev,
    consts::{LEAF_LEVEL, TWIG_LEVEL},
    error::{Error, ErrorKind, Result},
    jnode::{JnodeId, JnodeKind, JnodeRef, JnodeTable},
};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Item {
    Leaf { key: u64, payload: Vec<u8> },
    Internal(JnodeId),
    Extent { oid: u64, first_index: u64, units: Vec<JnodeId> },
}

impl Item {
    fn encoded_len(&self) -> usize {
        match self {
            Item::Leaf { payload, .. } => 1 + 8 + 2 + payload.len(),
            Item::Internal(_) => 1 + 8,
            Item::Extent { units, .. } => 1 + 8 + 8 + 2 + 8 * units.len(),
        }
    }

    fn units(&self) -> &[JnodeId] {
        match self {
            Item::Leaf { .. } => &[],
            Item::Internal(c) => core::slice::from_ref(c),
            Item::Extent { units, .. } => units,
        }
    }
}

#[derive(Debug)]
struct Entry {
    node: JnodeRef,
    parent: Option<JnodeId>,
    items: Vec<Item>,
}

#[derive(Debug, Default)]
struct TreeState {
    entries: HashMap<JnodeId, Entry>,
    root: Option<JnodeId>,
    height: u8,
}

fn not_in_tree() -> Error {
    Error::new(ErrorKind::NotFound, "Node is not in the tree")
}

impl TreeState {
    fn entry(&self, id: JnodeId) -> Result<&Entry> {
        self.entries.get(&id).ok_or_else(not_in_tree)
    }

    fn entry_mut(&mut self, id: JnodeId) -> Result<&mut Entry> {
        self.entries.get_mut(&id).ok_or_else(not_in_tree)
    }

    fn node(&self, id: JnodeId) -> Option<JnodeRef> {
        self.entries.get(&id).map(|e| e.node.clone())
    }

    fn units(&self, id: JnodeId) -> Vec<JnodeId> {
        self.entries
            .get(&id)
            .map(|e| e.items.iter().flat_map(|i| i.units().iter().copied()).collect())
            .unwrap_or_default()
    }

    fn used(&self, id: JnodeId) -> usize {
        NODE_HEADER_SIZE
            + self
                .entries
                .get(&id)
                .map_or(0, |e| e.items.iter().map(Item::encoded_len).sum())
    }

    /// 同层邻居，必要时跨越父节点
    fn side(&self, id: JnodeId, right: bool) -> Option<JnodeId> {
        let parent = self.entries.get(&id)?.parent?;
        let units = self.units(parent);
        let pos = units.iter().position(|&u| u == id)?;
        if right && pos + 1 < units.len() {
            return Some(units[pos + 1]);
        }
        if !right && pos > 0 {
            return Some(units[pos - 1]);
        }
        let mut p = self.side(parent, right)?;
        loop {
            let u = self.units(p);
            let pick = if right { u.first() } else { u.last() };
            if let Some(&x) = pick {
                return Some(x);
            }
            p = self.side(p, right)?;
        }
    }

    /// 把节点内容按磁盘格式写进 jnode
    fn render(&self, id: JnodeId, block_size: usize) -> Result<()> {
        let e = self.entry(id)?;
        if !e.node.kind().is_formatted() {
            return Ok(());
        }
        let blocknr = |c: &JnodeId| self.entries.get(c).map_or(0, |ce| ce.node.blocknr());
        let items: Vec<NodeItem> = e
            .items
            .iter()
            .map(|item| match item {
                Item::Leaf { key, payload } => NodeItem::Leaf {
                    key: *key,
                    payload: payload.clone(),
                },
                Item::Internal(c) => NodeItem::Internal { child: blocknr(c) },
                Item::Extent { oid, first_index, units } => NodeItem::Extent {
                    oid: *oid,
                    first_index: *first_index,
                    blocks: units.iter().map(blocknr).collect(),
                },
            })
            .collect();
        e.node.set_data(encode_node(e.node.level(), &items, block_size)?);
        Ok(())
    }

    /// 把节点从父节点中摘下（不删除它自己的表项）
    fn unlink(&mut self, id: JnodeId, block_size: usize) -> Result<Option<JnodeId>> {
        let parent = self.entry(id)?.parent;
        let Some(p) = parent else {
            if self.root == Some(id) {
                self.root = None;
                self.height = 0;
            }
            return Ok(None);
        };
        let pe = self.entry_mut(p)?;
        let mut idx = 0;
        while idx < pe.items.len() {
            match &mut pe.items[idx] {
                Item::Internal(c) if *c == id => {
                    pe.items.remove(idx);
                    break;
                }
                Item::Extent { oid, first_index, units } => {
                    if let Some(pos) = units.iter().position(|&u| u == id) {
                        let (oid, first) = (*oid, *first_index);
                        let tail = units.split_off(pos + 1);
                        units.pop();
                        let head_empty = units.is_empty();
                        if !tail.is_empty() {
                            let rest = Item::Extent {
                                oid,
                                first_index: first + pos as u64 + 1,
                                units: tail,
                            };
                            pe.items.insert(idx + 1, rest);
                        }
                        if head_empty {
                            pe.items.remove(idx);
                        }
                        break;
                    }
                }
                _ => {}
            }
            idx += 1;
        }
        self.render(p, block_size)?;
        Ok(Some(p))
    }

    /// 删除节点及其子树的表项
    fn forget_subtree(&mut self, id: JnodeId) {
        for child in self.units(id) {
            self.forget_subtree(child);
        }
        self.entries.remove(&id);
    }

    fn set_parent(&mut self, ids: &[JnodeId], parent: JnodeId) {
        for id in ids {
            if let Some(e) = self.entries.get_mut(id) {
                e.parent = Some(parent);
            }
        }
    }
}

/// 内存参考树
#[derive(Debug)]
pub struct MemTree {
    block_size: usize,
    state: Mutex<TreeState>,
}

impl MemTree {
    /// 创建空树
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            state: Mutex::new(TreeState::default()),
        }
    }

    /// 从磁盘读入整棵树
    ///
    /// # 错误
    ///
    /// - `Corrupted` - 节点格式错误或层级不符
    pub fn load(dev: &BlockDev, table: &JnodeTable, root_block: u64, height: u8) -> Result<Self> {
        let tree = Self::new(dev.block_size() as usize);
        if root_block == 0 {
            return Ok(tree);
        }
        let mut st = tree.state.lock();
        let root = load_node(&mut st, dev, table, root_block, height, None)?;
        st.root = Some(root);
        st.height = height;
        log::info!(
            "[TREE] loaded {} nodes, root {:#x}, height {}",
            st.entries.len(),
            root_block,
            height
        );
        drop(st);
        Ok(tree)
    }

    fn check_formatted(node: &JnodeRef) -> Result<()> {
        if !node.kind().is_formatted() {
            return Err(Error::new(ErrorKind::InvalidInput, "Node is not a formatted node"));
        }
        Ok(())
    }

    /// 设置根节点
    ///
    /// 空树直接设为根；否则新根的层级必须比树高大一，旧根成为它的第一个子节点
    pub fn set_root(&self, node: &JnodeRef) -> Result<()> {
        Self::check_formatted(node)?;
        let mut st = self.state.lock();
        if st.entries.contains_key(&node.id()) {
            return Err(Error::new(ErrorKind::InvalidInput, "Node already in tree"));
        }
        let mut items = Vec::new();
        if let Some(old) = st.root {
            if node.level() != st.height + 1 {
                return Err(Error::new(ErrorKind::InvalidInput, "New root must grow the tree by one"));
            }
            items.push(Item::Internal(old));
        }
        let id = node.id();
        st.entries.insert(
            id,
            Entry {
                node: node.clone(),
                parent: None,
                items,
            },
        );
        if let Some(old) = st.root {
            st.set_parent(&[old], id);
        }
        st.root = Some(id);
        st.height = node.level();
        st.render(id, self.block_size)
    }

    /// 在父节点末尾追加一个格式化子节点
    ///
    /// # 错误
    ///
    /// - `NoSpace` - 父节点已满
    /// - `InvalidInput` - 层级不符
    pub fn append_child(&self, parent: &JnodeRef, child: &JnodeRef) -> Result<()> {
        Self::check_formatted(parent)?;
        Self::check_formatted(child)?;
        if parent.level() <= LEAF_LEVEL || child.level() + 1 != parent.level() {
            return Err(Error::new(ErrorKind::InvalidInput, "Child level does not fit parent"));
        }
        let mut st = self.state.lock();
        st.entry(parent.id())?;
        if st.entries.contains_key(&child.id()) {
            return Err(Error::new(ErrorKind::InvalidInput, "Node already in tree"));
        }
        if st.used(parent.id()) + Item::Internal(0).encoded_len() > self.block_size {
            return Err(Error::new(ErrorKind::NoSpace, "Parent node is full"));
        }
        st.entries.insert(
            child.id(),
            Entry {
                node: child.clone(),
                parent: Some(parent.id()),
                items: Vec::new(),
            },
        );
        st.entry_mut(parent.id())?.items.push(Item::Internal(child.id()));
        st.render(child.id(), self.block_size)?;
        st.render(parent.id(), self.block_size)
    }

    /// 在 twig 节点末尾追加一个 extent
    pub fn append_extent(&self, twig: &JnodeRef, oid: u64, first_index: u64, units: &[JnodeRef]) -> Result<()> {
        Self::check_formatted(twig)?;
        if twig.level() != TWIG_LEVEL || units.is_empty() || units.iter().any(|u| !u.kind().is_unformatted()) {
            return Err(Error::new(ErrorKind::InvalidInput, "Extent must hold data nodes under a twig"));
        }
        let mut st = self.state.lock();
        st.entry(twig.id())?;
        let item = Item::Extent {
            oid,
            first_index,
            units: units.iter().map(|u| u.id()).collect(),
        };
        if st.used(twig.id()) + item.encoded_len() > self.block_size {
            return Err(Error::new(ErrorKind::NoSpace, "Twig node is full"));
        }
        for u in units {
            st.entries.insert(
                u.id(),
                Entry {
                    node: u.clone(),
                    parent: Some(twig.id()),
                    items: Vec::new(),
                },
            );
        }
        st.entry_mut(twig.id())?.items.push(item);
        st.render(twig.id(), self.block_size)
    }

    /// 插入或替换一个叶子 item（按键排序）
    pub fn insert_leaf_item(&self, leaf: &JnodeRef, key: u64, payload: &[u8]) -> Result<()> {
        if leaf.kind() != (JnodeKind::Formatted { level: LEAF_LEVEL }) {
            return Err(Error::new(ErrorKind::InvalidInput, "Not a formatted leaf"));
        }
        let mut st = self.state.lock();
        let used = st.used(leaf.id());
        let bs = self.block_size;
        let e = st.entry_mut(leaf.id())?;
        let pos = e.items.iter().position(|i| matches!(i, Item::Leaf { key: k, .. } if *k >= key));
        let item = Item::Leaf { key, payload: payload.to_vec() };
        let replaced = pos.filter(|&p| matches!(&e.items[p], Item::Leaf { key: k, .. } if *k == key));
        let old_len = replaced.map_or(0, |p| e.items[p].encoded_len());
        if used - old_len + item.encoded_len() > bs {
            return Err(Error::new(ErrorKind::NoSpace, "Leaf node is full"));
        }
        match (replaced, pos) {
            (Some(p), _) => e.items[p] = item,
            (None, Some(p)) => e.items.insert(p, item),
            (None, None) => e.items.push(item),
        }
        st.render(leaf.id(), bs)
    }

    /// 删除一个叶子 item
    pub fn remove_leaf_item(&self, leaf: &JnodeRef, key: u64) -> Result<bool> {
        let mut st = self.state.lock();
        let e = st.entry_mut(leaf.id())?;
        let before = e.items.len();
        e.items.retain(|i| !matches!(i, Item::Leaf { key: k, .. } if *k == key));
        let removed = e.items.len() != before;
        if removed {
            st.render(leaf.id(), self.block_size)?;
        }
        Ok(removed)
    }

    /// 叶子节点的 item
    pub fn leaf_items(&self, leaf: &JnodeRef) -> Vec<(u64, Vec<u8>)> {
        let st = self.state.lock();
        st.entries
            .get(&leaf.id())
            .map(|e| {
                e.items
                    .iter()
                    .filter_map(|i| match i {
                        Item::Leaf { key, payload } => Some((*key, payload.clone())),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 按树序收集所有叶子 item
    pub fn all_leaf_items(&self) -> Vec<(u64, Vec<u8>)> {
        let st = self.state.lock();
        let mut out = Vec::new();
        let mut stack: Vec<JnodeId> = st.root.into_iter().collect();
        while let Some(id) = stack.pop() {
            let Some(e) = st.entries.get(&id) else { continue };
            for item in &e.items {
                if let Item::Leaf { key, payload } = item {
                    out.push((*key, payload.clone()));
                }
            }
            stack.extend(st.units(id).into_iter().rev());
        }
        out
    }

    /// 按树序收集某一层的格式化节点
    pub fn nodes_at_level(&self, level: u8) -> Vec<JnodeRef> {
        let st = self.state.lock();
        let mut out = Vec::new();
        let mut stack: Vec<JnodeId> = st.root.into_iter().collect();
        while let Some(id) = stack.pop() {
            let Some(e) = st.entries.get(&id) else { continue };
            if e.node.kind().is_unformatted() {
                continue;
            }
            if e.node.level() == level {
                out.push(e.node.clone());
                continue;
            }
            stack.extend(st.units(id).into_iter().rev());
        }
        out
    }

    /// 节点是否在树中
    pub fn contains(&self, node: &JnodeRef) -> bool {
        self.state.lock().entries.contains_key(&node.id())
    }

    /// 树中节点数（含数据节点）
    pub fn node_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// 从树中删除节点及其子树，返回原父节点
    pub fn remove(&self, node: &JnodeRef) -> Result<Option<JnodeRef>> {
        let mut st = self.state.lock();
        let parent = st.unlink(node.id(), self.block_size)?;
        st.forget_subtree(node.id());
        Ok(parent.and_then(|p| st.node(p)))
    }
}

fn load_node(
    st: &mut TreeState,
    dev: &BlockDev,
    table: &JnodeTable,
    blocknr: u64,
    level: u8,
    parent: Option<JnodeId>,
) -> Result<JnodeId> {
    if level == 0 || blocknr == 0 || blocknr >= dev.total_blocks() {
        return Err(Error::new(ErrorKind::Corrupted, "Bad tree pointer"));
    }
    let node = table.jget(JnodeKind::Formatted { level }, blocknr);
    table.load(&node, dev)?;
    let (disk_level, disk_items) = decode_node(&node.data())?;
    if disk_level != level {
        log::error!("[TREE] node {:#x} has level {}, expected {}", blocknr, disk_level, level);
        return Err(Error::new(ErrorKind::Corrupted, "Tree level mismatch"));
    }
    let id = node.id();
    st.entries.insert(
        id,
        Entry {
            node,
            parent,
            items: Vec::new(),
        },
    );
    let mut items = Vec::with_capacity(disk_items.len());
    for item in disk_items {
        items.push(match item {
            NodeItem::Leaf { key, payload } => Item::Leaf { key, payload },
            NodeItem::Internal { child } => {
                Item::Internal(load_node(st, dev, table, child, level - 1, Some(id))?)
            }
            NodeItem::Extent { oid, first_index, blocks } => {
                let mut units = Vec::with_capacity(blocks.len());
                for (i, b) in blocks.into_iter().enumerate() {
                    let kind = JnodeKind::Unformatted {
                        oid,
                        index: first_index + i as u64,
                    };
                    let u = table.jget(kind, b);
                    table.load(&u, dev)?;
                    units.push(u.id());
                    st.entries.insert(
                        u.id(),
                        Entry {
                            node: u,
                            parent: Some(id),
                            items: Vec::new(),
                        },
                    );
                }
                Item::Extent { oid, first_index, units }
            }
        });
    }
    st.entry_mut(id)?.items = items;
    Ok(id)
}

impl TreeLayer for MemTree {
    fn root(&self) -> Option<JnodeRef> {
        let st = self.state.lock();
        st.root.and_then(|r| st.node(r))
    }

    fn height(&self) -> u8 {
        self.state.lock().height
    }

    fn parent(&self, node: &JnodeRef) -> Option<JnodeRef> {
        let st = self.state.lock();
        st.entries.get(&node.id())?.parent.and_then(|p| st.node(p))
    }

    fn left_neighbor(&self, node: &JnodeRef) -> Option<JnodeRef> {
        let st = self.state.lock();
        st.side(node.id(), false).and_then(|n| st.node(n))
    }

    fn right_neighbor(&self, node: &JnodeRef) -> Option<JnodeRef> {
        let st = self.state.lock();
        st.side(node.id(), true).and_then(|n| st.node(n))
    }

    fn leftmost_child(&self, node: &JnodeRef) -> Option<JnodeRef> {
        let st = self.state.lock();
        st.units(node.id()).first().and_then(|&c| st.node(c))
    }

    fn items(&self, node: &JnodeRef) -> Vec<TreeItem> {
        let st = self.state.lock();
        let Some(e) = st.entries.get(&node.id()) else {
            return Vec::new();
        };
        e.items
            .iter()
            .map(|item| match item {
                Item::Leaf { .. } => TreeItem::Leaf,
                Item::Internal(c) => st.node(*c).map_or(TreeItem::Leaf, TreeItem::Internal),
                Item::Extent { units, .. } => {
                    TreeItem::Extent(units.iter().filter_map(|u| st.node(*u)).collect())
                }
            })
            .collect()
    }

    fn child_position(&self, parent: &JnodeRef, child: &JnodeRef) -> Option<usize> {
        self.state
            .lock()
            .units(parent.id())
            .iter()
            .position(|&u| u == child.id())
    }

    fn squeeze(&self, left: &JnodeRef, right: &JnodeRef, allow_delete: bool) -> Result<SqueezeResult> {
        if !left.kind().is_formatted() || !right.kind().is_formatted() || left.level() != right.level() {
            return Ok(SqueezeResult::Nothing);
        }
        let (l, r) = (left.id(), right.id());
        let bs = self.block_size;
        let mut st = self.state.lock();
        if !st.entries.contains_key(&l) || !st.entries.contains_key(&r) {
            return Ok(SqueezeResult::Nothing);
        }

        let mut moved = 0;
        let mut subtree = None;
        while subtree.is_none() {
            let free = bs - st.used(l);
            let Some(first) = st.entry(r)?.items.first().cloned() else {
                break;
            };
            let first_len = first.encoded_len();
            match first {
                Item::Leaf { .. } | Item::Internal(_) if first_len > free => break,
                Item::Leaf { .. } => {
                    let item = st.entry_mut(r)?.items.remove(0);
                    st.entry_mut(l)?.items.push(item);
                    moved += 1;
                }
                Item::Internal(c) => {
                    let item = st.entry_mut(r)?.items.remove(0);
                    st.entry_mut(l)?.items.push(item);
                    st.set_parent(&[c], l);
                    subtree = Some(c);
                }
                Item::Extent { oid, first_index, units } => {
                    let whole = first_len <= free;
                    let fit = if whole {
                        units.len()
                    } else {
                        free.saturating_sub(Item::Extent { oid, first_index, units: Vec::new() }.encoded_len()) / 8
                    };
                    if fit == 0 {
                        break;
                    }
                    let moving: Vec<JnodeId> = units[..fit].to_vec();
                    {
                        let re = st.entry_mut(r)?;
                        if whole {
                            re.items.remove(0);
                        } else if let Item::Extent { first_index: fi, units: us, .. } = &mut re.items[0] {
                            us.drain(..fit);
                            *fi += fit as u64;
                        }
                    }
                    st.set_parent(&moving, l);
                    st.entry_mut(l)?.items.push(Item::Extent {
                        oid,
                        first_index,
                        units: moving,
                    });
                    moved += 1;
                    if !whole {
                        break;
                    }
                }
            }
        }

        if moved == 0 && subtree.is_none() {
            return Ok(SqueezeResult::Nothing);
        }
        st.render(l, bs)?;
        let emptied = st.entry(r)?.items.is_empty();
        let deleted = emptied && allow_delete;
        if deleted {
            st.unlink(r, bs)?;
            st.entries.remove(&r);
        } else {
            st.render(r, bs)?;
        }
        log::trace!(
            "[TREE] squeeze {} <- {}: {} items, subtree {:?}, right {}",
            l,
            r,
            moved,
            subtree,
            if deleted { "deleted" } else { "kept" }
        );
        Ok(match subtree.and_then(|c| st.node(c)) {
            Some(c) => SqueezeResult::SubtreeMoved(c),
            None if deleted => SqueezeResult::RightEmptied,
            None => SqueezeResult::Moved { items: moved },
        })
    }

    fn update_pointer(&self, child: &JnodeRef) -> Result<()> {
        let st = self.state.lock();
        let parent = st.entry(child.id())?.parent;
        if let Some(p) = parent {
            st.render(p, self.block_size)?;
        }
        Ok(())
    }
}
