//! 格式化节点的磁盘格式
//!
//! ```text
//! 0  level     u8
//! 1  magic     u8   'N'
//! 2  nr_items  u16
//! 4  (reserved)
//! 8  items ...
//! ```
//!
//! 每个 item 以一个字节的类型开头：
//!
//! - `0` 叶子 item：`key u64, len u16, payload`
//! - `1` 指针：`child u64`
//! - `2` extent：`oid u64, first_index u64, nr u16, blocknr u64 * nr`

use crate::error::{Error, ErrorKind, Result};
use byteorder::{ByteOrder, LittleEndian};

/// 节点头大小
pub const NODE_HEADER_SIZE: usize = 8;

const NODE_MAGIC: u8 = b'N';

const TAG_LEAF: u8 = 0;
const TAG_INTERNAL: u8 = 1;
const TAG_EXTENT: u8 = 2;

/// 磁盘上的 item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeItem {
    /// 叶子 item
    Leaf {
        /// 键
        key: u64,
        /// 内容
        payload: Vec<u8>,
    },
    /// 子节点指针
    Internal {
        /// 子节点块号
        child: u64,
    },
    /// extent
    Extent {
        /// 所属对象
        oid: u64,
        /// 第一个数据块的页号
        first_index: u64,
        /// 数据块块号
        blocks: Vec<u64>,
    },
}

impl NodeItem {
    /// 编码后的字节数
    pub fn encoded_len(&self) -> usize {
        match self {
            NodeItem::Leaf { payload, .. } => 1 + 8 + 2 + payload.len(),
            NodeItem::Internal { .. } => 1 + 8,
            NodeItem::Extent { blocks, .. } => 1 + 8 + 8 + 2 + 8 * blocks.len(),
        }
    }
}

/// 编码节点
///
/// # 错误
///
/// - `NoSpace` - 放不进一个块
pub fn encode_node(level: u8, items: &[NodeItem], block_size: usize) -> Result<Vec<u8>> {
    let used = NODE_HEADER_SIZE + items.iter().map(NodeItem::encoded_len).sum::<usize>();
    if used > block_size || items.len() > u16::MAX as usize {
        return Err(Error::new(ErrorKind::NoSpace, "Node content exceeds block"));
    }
    let mut buf = vec![0u8; block_size];
    buf[0] = level;
    buf[1] = NODE_MAGIC;
    LittleEndian::write_u16(&mut buf[2..4], items.len() as u16);
    let mut off = NODE_HEADER_SIZE;
    for item in items {
        match item {
            NodeItem::Leaf { key, payload } => {
                buf[off] = TAG_LEAF;
                LittleEndian::write_u64(&mut buf[off + 1..off + 9], *key);
                LittleEndian::write_u16(&mut buf[off + 9..off + 11], payload.len() as u16);
                buf[off + 11..off + 11 + payload.len()].copy_from_slice(payload);
            }
            NodeItem::Internal { child } => {
                buf[off] = TAG_INTERNAL;
                LittleEndian::write_u64(&mut buf[off + 1..off + 9], *child);
            }
            NodeItem::Extent { oid, first_index, blocks } => {
                buf[off] = TAG_EXTENT;
                LittleEndian::write_u64(&mut buf[off + 1..off + 9], *oid);
                LittleEndian::write_u64(&mut buf[off + 9..off + 17], *first_index);
                LittleEndian::write_u16(&mut buf[off + 17..off + 19], blocks.len() as u16);
                for (i, b) in blocks.iter().enumerate() {
                    let p = off + 19 + i * 8;
                    LittleEndian::write_u64(&mut buf[p..p + 8], *b);
                }
            }
        }
        off += item.encoded_len();
    }
    Ok(buf)
}

fn corrupted() -> Error {
    Error::new(ErrorKind::Corrupted, "Malformed tree node")
}

/// 解码节点，返回 `(层级, items)`
pub fn decode_node(buf: &[u8]) -> Result<(u8, Vec<NodeItem>)> {
    if buf.len() < NODE_HEADER_SIZE || buf[1] != NODE_MAGIC {
        return Err(corrupted());
    }
    let level = buf[0];
    let nr = LittleEndian::read_u16(&buf[2..4]) as usize;
    let mut items = Vec::with_capacity(nr);
    let mut off = NODE_HEADER_SIZE;
    let need = |off: usize, len: usize| if off + len <= buf.len() { Ok(()) } else { Err(corrupted()) };
    for _ in 0..nr {
        need(off, 1)?;
        let item = match buf[off] {
            TAG_LEAF => {
                need(off, 11)?;
                let key = LittleEndian::read_u64(&buf[off + 1..off + 9]);
                let len = LittleEndian::read_u16(&buf[off + 9..off + 11]) as usize;
                need(off + 11, len)?;
                NodeItem::Leaf {
                    key,
                    payload: buf[off + 11..off + 11 + len].to_vec(),
                }
            }
            TAG_INTERNAL => {
                need(off, 9)?;
                NodeItem::Internal {
                    child: LittleEndian::read_u64(&buf[off + 1..off + 9]),
                }
            }
            TAG_EXTENT => {
                need(off, 19)?;
                let nr_blocks = LittleEndian::read_u16(&buf[off + 17..off + 19]) as usize;
                need(off + 19, nr_blocks * 8)?;
                NodeItem::Extent {
                    oid: LittleEndian::read_u64(&buf[off + 1..off + 9]),
                    first_index: LittleEndian::read_u64(&buf[off + 9..off + 17]),
                    blocks: (0..nr_blocks)
                        .map(|i| {
                            let p = off + 19 + i * 8;
                            LittleEndian::read_u64(&buf[p..p + 8])
                        })
                        .collect(),
                }
            }
            _ => return Err(corrupted()),
        };
        off += item.encoded_len();
        items.push(item);
    }
    Ok((level, items))
}
