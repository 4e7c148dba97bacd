//! cowfs_core: 写时复制 B 树文件系统的崩溃一致性核心
//!
//! 这个库实现：
//! - **事务管理器**：atom、事务句柄、capture / fusion 协议、提交状态机
//! - **flush / 分配引擎**：parent-first 顺序的 squeeze-and-allocate，
//!   逐节点决定重定位还是原地覆盖
//! - **wandering log**：提交写（漂移副本、journal header / footer）和挂载时 replay
//!
//! 一批被修改的内存节点要么完整提交到磁盘，要么完全没有效果；
//! 并发操作可以融合进同一个提交单元。
//!
//! # 示例
//!
//! ```rust,ignore
//! use cowfs_core::{BlockDev, MemDevice, TxnConfig, TxnFs, TxnMode};
//! use std::sync::Arc;
//!
//! fn main() -> cowfs_core::Result<()> {
//!     let dev = Arc::new(BlockDev::new(MemDevice::new(4096, 1 << 16))?);
//!     TxnFs::format(&dev)?;
//!     let fs = TxnFs::mount(dev, TxnConfig::default())?;
//!
//!     let h = fs.begin_handle(TxnMode::WriteFusing);
//!     let root = fs.new_root(&h, 2)?;
//!     let leaf = fs.new_child(&h, &root)?;
//!     fs.insert_item(&h, &leaf, 1, b"hello")?;
//!     h.request_commit();
//!     h.close()?;
//!
//!     fs.unmount()
//! }
//! ```
//!
//! # 模块结构
//!
//! - [`error`] - 错误类型定义
//! - [`consts`] - 常量定义
//! - [`block`] - 块设备抽象、批量 I/O、内存设备
//! - [`bitmap`] / [`balloc`] - 位图和块分配器
//! - [`blocknr_set`] - 块号集合（delete set、漂移映射）
//! - [`jnode`] - 内存中的磁盘块句柄
//! - [`txnmgr`] - 事务管理器
//! - [`flush`] - flush / 分配引擎和 flush queue
//! - [`tree`] - 树层接口和内存参考树
//! - [`wander`] - wandering log
//! - [`layout`] - 磁盘布局和 mkfs
//! - [`fs`] - 文件系统高级 API

#![deny(unsafe_code)]
#![warn(missing_docs)]

// ===== 核心模块 =====

/// 错误处理
pub mod error;

/// 常量定义
pub mod consts;

/// 块设备抽象
pub mod block;

/// 位图操作
pub mod bitmap;

/// 块分配
pub mod balloc;

/// 块号集合
pub mod blocknr_set;

/// jnode
pub mod jnode;

/// 事务管理器
pub mod txnmgr;

/// flush 引擎
pub mod flush;

/// 树层
pub mod tree;

/// Wandering log
pub mod wander;

/// 磁盘布局
pub mod layout;

/// 文件系统高级 API
pub mod fs;

// ===== 公共导出 =====

// 错误处理
pub use error::{Error, ErrorKind, Result};

// 块设备
pub use block::{BlockDev, BlockDevice, MemDevice};

// 块分配
pub use balloc::{BlockAllocator, BlockRange};

// 块号集合
pub use blocknr_set::{BlocknrItem, BlocknrSet};

// jnode
pub use jnode::{JnodeKind, JnodeRef, JnodeState, JnodeTable};

// 事务管理器
pub use txnmgr::{
    AtomId, AtomStage, CaptureFlags, LockMode, TxnConfig, TxnFlags, TxnHandle, TxnMgr, TxnMgrParts, TxnMode,
};

// flush
pub use flush::{FlushQueue, FlushReport};

// 树
pub use tree::{MemTree, SqueezeResult, TreeItem, TreeLayer};

// Wandering log
pub use wander::{replay, CommitStats, JournalError, JournalState, ReplayReport};

// 布局
pub use layout::{format, DiskLayout, FormatSuper, LayoutHook, SuperCounters};

// 文件系统
pub use fs::{FsStats, TxnFs};
