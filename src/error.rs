//! 错误类型定义
//!
//! 提供事务管理器、flush 引擎和 wandering log 的错误类型。
//!
//! 重试类错误（[`ErrorKind::Repeat`]）只在 capture / flush / commit 内部循环中使用，
//! 不会越过这些入口函数返回给调用者。

use core::fmt;

/// 操作错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: &'static str,
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// I/O 错误
    Io,
    /// 无效参数
    InvalidInput,
    /// 磁盘结构损坏（replay 时 magic 不匹配等）
    Corrupted,
    /// 对象不存在
    NotFound,
    /// 空间不足
    NoSpace,
    /// 内存（jnode / atom）分配失败
    NoMemory,
    /// 设备忙
    Busy,
    /// 无效状态
    InvalidState,
    /// 需要重试（锁竞争、fusion 竞争、死锁规避）
    Repeat,
    /// 非阻塞 capture 无法继续
    WouldBlock,
}

impl Error {
    /// 创建新错误
    pub const fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self { kind, message }
    }

    /// 重试信号
    pub const fn repeat() -> Self {
        Self::new(ErrorKind::Repeat, "operation must be repeated")
    }

    /// 获取错误类型
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 获取错误消息
    pub const fn message(&self) -> &'static str {
        self.message
    }

    /// 是否为重试信号
    pub fn is_repeat(&self) -> bool {
        self.kind == ErrorKind::Repeat
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

// Journal error conversion
impl From<crate::wander::JournalError> for Error {
    fn from(err: crate::wander::JournalError) -> Self {
        use crate::wander::JournalError;
        match err {
            JournalError::BadTxMagic => Error::new(ErrorKind::Corrupted, "Bad transaction head magic"),
            JournalError::BadRecordMagic => Error::new(ErrorKind::Corrupted, "Bad wander record magic"),
            JournalError::BrokenChain => Error::new(ErrorKind::Corrupted, "Broken transaction chain"),
            JournalError::RecordCount => Error::new(ErrorKind::Corrupted, "Wander record count mismatch"),
            JournalError::Truncated => Error::new(ErrorKind::Corrupted, "Journal block truncated"),
            JournalError::NoSpace => Error::new(ErrorKind::NoSpace, "No space for wander records"),
            JournalError::IoError => Error::new(ErrorKind::Io, "Journal I/O error"),
        }
    }
}

/// Result 类型别名
pub type Result<T> = core::result::Result<T, Error>;

/// 把 `Repeat` 折叠成循环：闭包返回 `Repeat` 时重新执行
///
/// capture 和 commit 的重试约定都通过它实现，调用点不用各自写循环。
pub(crate) fn retry<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    loop {
        match op() {
            Err(e) if e.is_repeat() => {
                log::trace!("[RETRY] {}", e.message());
                continue;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::new(ErrorKind::NoSpace, "No free blocks available");
        assert_eq!(format!("{}", err), "NoSpace: No free blocks available");
        assert_eq!(err.kind(), ErrorKind::NoSpace);
    }

    #[test]
    fn test_retry_loops_until_done() {
        let mut attempts = 0;
        let res = retry(|| {
            attempts += 1;
            if attempts < 3 {
                Err(Error::repeat())
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(res, Ok(3));
    }

    #[test]
    fn test_retry_passes_real_errors() {
        let res: Result<()> = retry(|| Err(Error::new(ErrorKind::Io, "disk gone")));
        assert_eq!(res.unwrap_err().kind(), ErrorKind::Io);
    }
}
