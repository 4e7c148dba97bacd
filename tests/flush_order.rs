//! flush 顺序和重定位决定

use cowfs_core::{BlockDev, JnodeRef, MemDevice, TreeLayer, TxnConfig, TxnFs, TxnMode};
use std::sync::Arc;

const BIG: [u8; 300] = [0x5a; 300];

fn mount(mem: &MemDevice, config: TxnConfig) -> TxnFs {
    TxnFs::mount(Arc::new(BlockDev::new(mem.clone()).unwrap()), config).unwrap()
}

fn fresh(config: TxnConfig) -> (MemDevice, TxnFs) {
    let mem = MemDevice::new(512, 2048);
    TxnFs::format(&BlockDev::new(mem.clone()).unwrap()).unwrap();
    let fs = mount(&mem, config);
    (mem, fs)
}

#[test]
fn test_parents_allocated_before_children() {
    let (mem, fs) = fresh(TxnConfig::default());
    let h = fs.begin_handle(TxnMode::WriteFusing);
    let root = fs.new_root(&h, 3).unwrap();
    for t in 0..2u64 {
        let twig = fs.new_child(&h, &root).unwrap();
        for l in 0..2u64 {
            let leaf = fs.new_child(&h, &twig).unwrap();
            // 两个 item 放不进一个块，叶子之间挤不动
            fs.insert_item(&h, &leaf, t * 10 + l, &BIG).unwrap();
        }
    }
    h.request_commit();
    h.close().unwrap();

    // 挤压可能把右边的 twig 并掉，只检查最终的树
    let tree = fs.tree();
    let stats = fs.last_commit().unwrap();
    assert_eq!(stats.relocated.len(), tree.node_count());
    for level in 1..=2u8 {
        for node in tree.nodes_at_level(level) {
            let parent = tree.parent(&node).unwrap();
            assert!(
                parent.blocknr() < node.blocknr(),
                "parent {:#x} child {:#x}",
                parent.blocknr(),
                node.blocknr()
            );
        }
    }
    let leaves: Vec<JnodeRef> = tree.nodes_at_level(1);
    assert_eq!(leaves.len(), 4);
    for pair in leaves.windows(2) {
        assert!(pair[0].blocknr() < pair[1].blocknr());
    }
    drop(fs);

    let fs = mount(&mem, TxnConfig::default());
    assert_eq!(fs.tree().height(), 3);
    let keys: Vec<u64> = fs.tree().all_leaf_items().into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![0, 1, 10, 11]);
}

#[test]
fn test_close_leaf_keeps_its_block() {
    let (mem, fs) = fresh(TxnConfig::default());
    let h = fs.begin_handle(TxnMode::WriteFusing);
    let root = fs.new_root(&h, 2).unwrap();
    let leaf = fs.new_child(&h, &root).unwrap();
    fs.insert_item(&h, &leaf, 1, b"one").unwrap();
    h.request_commit();
    h.close().unwrap();
    let (root_blk, leaf_blk) = (root.blocknr(), leaf.blocknr());

    // 少量脏叶子，离 preceder 很近：原地覆盖
    let h = fs.begin_handle(TxnMode::WriteFusing);
    fs.dirty(&h, &root).unwrap();
    fs.insert_item(&h, &leaf, 2, b"two").unwrap();
    h.request_commit();
    h.close().unwrap();

    let stats = fs.last_commit().unwrap();
    assert!(stats.relocated.is_empty());
    assert!(stats.overwrite.contains(&leaf_blk));
    assert!(stats.overwrite.contains(&root_blk));
    assert!(stats.wandered.iter().any(|&(orig, _)| orig == leaf_blk));
    assert_eq!(leaf.blocknr(), leaf_blk);
    assert_eq!(root.blocknr(), root_blk);
    drop(fs);

    let fs = mount(&mem, TxnConfig::default());
    let root = fs.tree().root().unwrap();
    assert_eq!(root.blocknr(), root_blk);
    assert_eq!(fs.tree().leftmost_child(&root).unwrap().blocknr(), leaf_blk);
    assert_eq!(
        fs.tree().all_leaf_items(),
        vec![(1, b"one".to_vec()), (2, b"two".to_vec())]
    );
}

#[test]
fn test_relocated_leaf_frees_old_block() {
    let config = TxnConfig {
        relocate_distance: 0,
        ..TxnConfig::default()
    };
    let (mem, fs) = fresh(config);
    let h = fs.begin_handle(TxnMode::WriteFusing);
    let root = fs.new_root(&h, 2).unwrap();
    let leaf = fs.new_child(&h, &root).unwrap();
    fs.insert_item(&h, &leaf, 1, b"one").unwrap();
    h.request_commit();
    h.close().unwrap();
    let old = leaf.blocknr();

    let h = fs.begin_handle(TxnMode::WriteFusing);
    fs.dirty(&h, &root).unwrap();
    fs.insert_item(&h, &leaf, 2, b"two").unwrap();
    h.request_commit();
    h.close().unwrap();

    let new = leaf.blocknr();
    assert_ne!(new, old);
    let stats = fs.last_commit().unwrap();
    assert_eq!(stats.relocated, vec![new]);
    assert!(stats.deleted.contains(&old));
    let alloc = fs.txn_mgr().allocator();
    assert!(alloc.is_committed(new));
    assert!(!alloc.is_committed(old));
    drop(fs);

    let fs = mount(&mem, config);
    let root = fs.tree().root().unwrap();
    assert_eq!(fs.tree().leftmost_child(&root).unwrap().blocknr(), new);
    assert_eq!(fs.tree().all_leaf_items().len(), 2);
}
