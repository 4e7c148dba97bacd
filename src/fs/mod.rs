//! 文件系统高级 API
//!
//! [`TxnFs`] 把事务管理器、内存树和磁盘布局组装在一起：
//!
//! - 挂载：replay 日志，加载位图和树，恢复计数器
//! - 操作：开始句柄、修改节点（先 capture 再改内容）、删除节点、请求提交
//! - 同步：强制提交所有 atom
//!
//! # 示例
//!
//! ```rust,ignore
//! use cowfs_core::{BlockDev, MemDevice, TxnConfig, TxnFs, TxnMode};
//!
//! let dev = Arc::new(BlockDev::new(MemDevice::new(4096, 1 << 16))?);
//! TxnFs::format(&dev)?;
//! let fs = TxnFs::mount(dev, TxnConfig::default())?;
//!
//! let h = fs.begin_handle(TxnMode::WriteFusing);
//! let root = fs.new_root(&h, 2)?;
//! let leaf = fs.new_child(&h, &root)?;
//! fs.insert_item(&h, &leaf, 42, b"hello")?;
//! h.request_commit();
//! h.close()?;
//! ```

mod txnfs;

pub use txnfs::{FsStats, TxnFs};
