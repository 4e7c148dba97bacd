//! 对象 id 分配

use super::SuperCounters;
use parking_lot::Mutex;

#[derive(Debug)]
struct OidState {
    next_oid: u64,
    nr_files: u64,
}

/// 对象 id 计数器
///
/// 提交时取快照写入 tx head 和 journal footer，挂载时恢复
#[derive(Debug)]
pub struct OidAllocator {
    state: Mutex<OidState>,
}

impl OidAllocator {
    /// 从已提交的计数器恢复
    pub fn new(next_oid: u64, nr_files: u64) -> Self {
        Self {
            state: Mutex::new(OidState { next_oid, nr_files }),
        }
    }

    /// 分配一个新对象 id
    pub fn allocate_oid(&self) -> u64 {
        let mut st = self.state.lock();
        let oid = st.next_oid;
        st.next_oid += 1;
        st.nr_files += 1;
        oid
    }

    /// 释放对象 id（id 不会复用）
    pub fn release_oid(&self, oid: u64) {
        let mut st = self.state.lock();
        debug_assert!(oid < st.next_oid);
        st.nr_files = st.nr_files.saturating_sub(1);
    }

    /// 下一个将要分配的 id
    pub fn next_oid(&self) -> u64 {
        self.state.lock().next_oid
    }

    /// 存活对象数
    pub fn nr_files(&self) -> u64 {
        self.state.lock().nr_files
    }

    /// 与 `free_blocks` 组成提交快照
    pub fn snapshot(&self, free_blocks: u64) -> SuperCounters {
        let st = self.state.lock();
        SuperCounters {
            free_blocks,
            nr_files: st.nr_files,
            next_oid: st.next_oid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_release() {
        let oids = OidAllocator::new(100, 0);
        assert_eq!(oids.allocate_oid(), 100);
        assert_eq!(oids.allocate_oid(), 101);
        assert_eq!(oids.nr_files(), 2);
        oids.release_oid(100);
        assert_eq!(oids.nr_files(), 1);
        assert_eq!(oids.next_oid(), 102);
        let snap = oids.snapshot(55);
        assert_eq!(snap, SuperCounters { free_blocks: 55, nr_files: 1, next_oid: 102 });
    }
}
