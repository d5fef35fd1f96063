//! Split-and-rebalance boundary behavior on tiny pages: a 512-byte page
//! holds exactly seven of the entries used here, so one more insert must
//! either donate to a sibling or split.

use tempfile::tempdir;

use marten::{Db, DbConfig, Tree};

const VALUE_LEN: usize = 57; // key 3 + headers 2 + value 57 + slot 2 = 64 bytes

fn open(name: &str) -> (tempfile::TempDir, Db, Tree) {
    let tmp = tempdir().unwrap();
    let db = Db::open(DbConfig::new(tmp.path().join(name)).page_size(512)).unwrap();
    let tree = db.index("t").unwrap();
    (tmp, db, tree)
}

fn fill_value(tag: u8) -> Vec<u8> {
    vec![tag; VALUE_LEN]
}

/// Seven entries fill the root leaf; the eighth lands past the end and
/// takes the ascending-load fast path: a right sibling holding only it.
fn split_once(tree: &Tree) {
    for i in 0..7u8 {
        tree.put(format!("a{i}0").as_bytes(), &fill_value(i)).unwrap();
    }
    let stats = tree.verify().unwrap();
    assert_eq!(stats.leaf_count, 1);

    tree.put(b"z00", &fill_value(9)).unwrap();
    let stats = tree.verify().unwrap();
    assert_eq!(stats.leaf_count, 2, "eighth insert splits the root leaf");
    assert_eq!(stats.depth, 2);
}

#[test]
fn mid_leaf_insert_rebalances_into_roomy_sibling() {
    let (_tmp, _db, tree) = open("rebalance.mtdb");
    split_once(&tree);

    // left leaf is full, right sibling holds one entry; an insert in the
    // middle of the left leaf moves its tail entries right instead of
    // splitting
    tree.put(b"a55", &fill_value(5)).unwrap();
    let stats = tree.verify().unwrap();
    assert_eq!(stats.leaf_count, 2, "rebalance avoided the split");
    assert_eq!(stats.entry_count, 9);
}

#[test]
fn right_edge_insert_splits_even_with_roomy_sibling() {
    let (_tmp, _db, tree) = open("edge.mtdb");
    split_once(&tree);

    // "a80" sorts after every key in the full left leaf but before the
    // separator, so it lands at the leaf's right edge. Donating entries
    // rightward cannot help an edge insert; a split is required.
    tree.put(b"a80", &fill_value(8)).unwrap();
    let stats = tree.verify().unwrap();
    assert_eq!(stats.leaf_count, 3, "edge insert must split");
    assert_eq!(stats.entry_count, 9);
}

#[test]
fn full_sibling_forces_split() {
    let (_tmp, _db, tree) = open("fullsib.mtdb");
    split_once(&tree);

    // fill the right sibling to seven entries as well
    for i in 1..7u8 {
        tree.put(format!("z{i}0").as_bytes(), &fill_value(i)).unwrap();
    }
    let stats = tree.verify().unwrap();
    assert_eq!(stats.leaf_count, 2);

    // both leaves full: the mid-leaf insert that previously rebalanced now
    // has nowhere to donate
    tree.put(b"a55", &fill_value(5)).unwrap();
    let stats = tree.verify().unwrap();
    assert_eq!(stats.leaf_count, 3);
    assert_eq!(stats.entry_count, 15);
}

#[test]
fn replace_with_larger_value_survives_full_leaf() {
    let (_tmp, _db, tree) = open("grow.mtdb");
    for i in 0..7u8 {
        tree.put(format!("a{i}0").as_bytes(), &fill_value(i)).unwrap();
    }
    // growing one value in a full leaf retires the entry and re-inserts,
    // splitting if necessary
    tree.put(b"a30", &vec![b'G'; VALUE_LEN * 2]).unwrap();
    assert_eq!(tree.get(b"a30").unwrap().unwrap(), vec![b'G'; VALUE_LEN * 2]);
    let stats = tree.verify().unwrap();
    assert_eq!(stats.entry_count, 7);
}
