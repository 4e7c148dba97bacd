//! 位图操作
//!
//! 块分配器的 working / commit 位图都用这里的函数操作。

mod ops;

pub use ops::*;
