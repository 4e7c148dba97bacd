//! 物理块分配模块
//!
//! 分配器维护两张位图：
//!
//! - **working bitmap**：分配立即可见，flush 重定位、wander 块都从这里分配
//! - **commit bitmap**：已经（或即将随当前 atom）持久化的状态
//!
//! 提交前 atom 把自己的重定位结果和 delete set 写进 commit bitmap，
//! 被修改的位图块作为 `Bitmap` 类 jnode 进入 overwrite set 一起写日志。
//! delete set 里的块直到 journal footer 更新之后才还给 working bitmap。

pub mod helpers;
pub mod alloc;
pub mod commit;

pub use helpers::*;
pub use alloc::*;
