//! 块设备抽象
//!
//! block/device.rs 定义设备接口 `BlockDevice` 以及多线程共享的包装器 `BlockDev`

//! block/io.rs 提供批量写：把连续块号合并成一次设备写，并统计提交数/错误数

//! block/mem.rs 是内存设备，可以注入写失败来模拟崩溃

mod device;
mod io;
mod mem;

pub use device::{BlockDevice, BlockDev};
pub use io::{coalesce_runs, BatchResult, WriteRun};
pub use mem::MemDevice;
