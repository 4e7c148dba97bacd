//! atom 融合和 capture 互斥

use cowfs_core::{
    AtomStage, BlockDev, CaptureFlags, ErrorKind, JnodeRef, LockMode, MemDevice, TxnConfig, TxnFs,
    TxnMode,
};
use std::{sync::Arc, thread, time::Duration};

/// 格式化、挂载，提交一个有 `leaves` 个空叶子的两层树
fn fs_with_leaves(leaves: usize) -> (TxnFs, Vec<JnodeRef>) {
    let mem = MemDevice::new(4096, 1024);
    TxnFs::format(&BlockDev::new(mem.clone()).unwrap()).unwrap();
    let fs = TxnFs::mount(Arc::new(BlockDev::new(mem).unwrap()), TxnConfig::default()).unwrap();
    let h = fs.begin_handle(TxnMode::WriteFusing);
    let root = fs.new_root(&h, 2).unwrap();
    let nodes = (0..leaves).map(|_| fs.new_child(&h, &root).unwrap()).collect();
    h.request_commit();
    h.close().unwrap();
    assert!(fs.txn_mgr().atoms().is_empty());
    (fs, nodes)
}

#[test]
fn test_smaller_atom_fuses_into_larger() {
    let (fs, leaves) = fs_with_leaves(14);

    // A1：两个句柄，三个节点
    let h1 = fs.begin_handle(TxnMode::WriteFusing);
    let h2 = fs.begin_handle(TxnMode::WriteFusing);
    fs.dirty(&h1, &leaves[0]).unwrap();
    fs.dirty(&h1, &leaves[1]).unwrap();
    fs.dirty(&h2, &leaves[0]).unwrap();
    fs.dirty(&h2, &leaves[2]).unwrap();
    let a1 = h1.atom_id().unwrap();
    assert_eq!(h2.atom_id(), Some(a1));

    // A2：一个句柄，十个节点
    let h3 = fs.begin_handle(TxnMode::WriteFusing);
    for leaf in &leaves[3..13] {
        fs.dirty(&h3, leaf).unwrap();
    }
    let a2 = h3.atom_id().unwrap();
    assert_ne!(a1, a2);
    let mgr = fs.txn_mgr();
    assert_eq!(mgr.atom(a1).unwrap().capture_count(), 3);
    assert_eq!(mgr.atom(a2).unwrap().capture_count(), 10);

    // 争同一个节点
    fs.dirty(&h3, &leaves[13]).unwrap();
    fs.dirty(&h1, &leaves[13]).unwrap();

    assert!(mgr.atom(a1).is_none());
    let atom = mgr.atom(a2).unwrap();
    assert_eq!(atom.capture_count(), 3 + 10 + 1);
    assert_eq!(atom.txnh_count(), 3);
    assert_eq!(h1.atom_id(), Some(a2));
    assert_eq!(h2.atom_id(), Some(a2));
    for leaf in &leaves {
        assert_eq!(leaf.atom_id(), Some(a2));
    }

    h1.close().unwrap();
    h2.close().unwrap();
    h3.request_commit();
    h3.close().unwrap();

    let stats = fs.last_commit().unwrap();
    assert_eq!(stats.atom_id, a2);
    for leaf in &leaves {
        assert!(stats.overwrite.contains(&leaf.blocknr()));
        assert!(leaf.atom().is_none());
    }
}

#[test]
fn test_read_capture_does_not_fuse() {
    let (fs, leaves) = fs_with_leaves(2);
    let w = fs.begin_handle(TxnMode::WriteFusing);
    fs.dirty(&w, &leaves[0]).unwrap();
    let r = fs.begin_handle(TxnMode::WriteFusing);
    fs.dirty(&r, &leaves[1]).unwrap();

    // 只写融合的句柄读别人的叶子，不融合
    r.capture(&leaves[0], LockMode::Read, CaptureFlags::empty()).unwrap();
    assert_ne!(w.atom_id(), r.atom_id());
    assert_eq!(fs.txn_mgr().atoms().len(), 2);

    // 读融合的句柄会加入
    let rf = fs.begin_handle(TxnMode::ReadFusing);
    rf.capture(&leaves[0], LockMode::Read, CaptureFlags::empty()).unwrap();
    assert_eq!(rf.atom_id(), w.atom_id());
    drop((w, r, rf));
}

#[test]
fn test_node_belongs_to_one_atom() {
    let (fs, leaves) = fs_with_leaves(3);
    let handles: Vec<_> = (0..3).map(|_| fs.begin_handle(TxnMode::WriteFusing)).collect();
    for (h, leaf) in handles.iter().zip(&leaves) {
        fs.dirty(h, leaf).unwrap();
    }
    assert_eq!(fs.txn_mgr().atoms().len(), 3);

    // 每个句柄都去写同一个节点，最后只剩一个 atom
    for h in &handles {
        fs.dirty(h, &leaves[1]).unwrap();
        assert_eq!(leaves[1].atom_id(), h.atom_id());
    }
    let atoms = fs.txn_mgr().atoms();
    assert_eq!(atoms.len(), 1);
    assert_eq!(atoms[0].capture_count(), 3);
    for leaf in &leaves {
        assert_eq!(leaf.atom_id(), Some(atoms[0].id()));
    }
}

#[test]
fn test_commit_waits_for_open_handles() {
    let (fs, leaves) = fs_with_leaves(2);
    let base_atom = fs.last_commit().unwrap().atom_id;
    let h1 = fs.begin_handle(TxnMode::WriteFusing);
    let h2 = fs.begin_handle(TxnMode::WriteFusing);
    fs.dirty(&h1, &leaves[0]).unwrap();
    fs.dirty(&h2, &leaves[0]).unwrap();
    fs.dirty(&h2, &leaves[1]).unwrap();
    let id = h1.atom_id().unwrap();
    let atom = fs.txn_mgr().atom(id).unwrap();

    let committer = thread::spawn(move || {
        h1.request_commit();
        h1.close()
    });
    thread::sleep(Duration::from_millis(100));

    // h2 还开着，提交停在 CaptureWait
    assert_eq!(atom.stage(), AtomStage::CaptureWait);
    assert_eq!(fs.last_commit().unwrap().atom_id, base_atom);

    // 没有 atom 的句柄不能不阻塞地加入
    let late = fs.begin_handle(TxnMode::WriteFusing);
    let err = late
        .capture(&leaves[1], LockMode::Write, CaptureFlags::NONBLOCKING)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WouldBlock);
    late.close().unwrap();

    h2.close().unwrap();
    committer.join().unwrap().unwrap();
    assert_eq!(atom.stage(), AtomStage::Done);
    assert_eq!(fs.last_commit().unwrap().atom_id, id);
    assert!(fs.txn_mgr().atoms().is_empty());
}

#[test]
fn test_fuse_with_lock_owners() {
    let (fs, leaves) = fs_with_leaves(3);
    let handles: Vec<_> = (0..3).map(|_| fs.begin_handle(TxnMode::WriteFusing)).collect();
    for (h, leaf) in handles.iter().zip(&leaves) {
        fs.dirty(h, leaf).unwrap();
    }
    let mgr = fs.txn_mgr();
    let owners: Vec<_> = handles.iter().map(|h| h.txnh().clone()).collect();

    // 自己和已经同一个 atom 的持有者不算
    assert_eq!(mgr.fuse_with_lock_owners(handles[0].txnh(), &owners).unwrap(), 2);
    assert_eq!(mgr.atoms().len(), 1);
    assert_eq!(mgr.fuse_with_lock_owners(handles[0].txnh(), &owners).unwrap(), 0);
    let id = handles[0].atom_id();
    assert!(handles.iter().all(|h| h.atom_id() == id));
    assert_eq!(mgr.atoms()[0].capture_count(), 3);
}
