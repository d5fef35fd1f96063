use tempfile::tempdir;

use marten::{Db, DbConfig};

fn key(i: u32) -> Vec<u8> {
    format!("c{i:03}").into_bytes()
}

#[test]
fn deleting_everything_collapses_the_root() {
    let tmp = tempdir().unwrap();
    let db = Db::open(DbConfig::new(tmp.path().join("collapse.mtdb")).page_size(512)).unwrap();
    let tree = db.index("t").unwrap();

    // enough sequential entries for a two-level tree with several leaves
    let count = 21;
    for i in 0..count {
        tree.put(&key(i), &vec![b'v'; 57]).unwrap();
    }
    let stats = tree.verify().unwrap();
    assert!(stats.depth >= 2, "load should have split the root");
    assert!(stats.leaf_count >= 3);

    // a cursor left open across the collapse must keep working
    let mut cursor = tree.cursor();
    let first = cursor.first().unwrap().unwrap();
    assert_eq!(first.0, key(0));

    let mut txn = db.begin().unwrap();
    for i in 0..count {
        assert!(tree.delete(&mut txn, &key(i)).unwrap());
    }
    txn.commit().unwrap();

    let stats = tree.verify().unwrap();
    assert_eq!(stats.entry_count, 0);
    assert_eq!(stats.depth, 1, "root collapsed back to a single leaf");
    assert_eq!(stats.leaf_count, 1);
    assert_eq!(stats.internal_count, 0);

    // the stale cursor observes an empty tree, not an error
    assert!(cursor.next().unwrap().is_none());
    assert!(cursor.first().unwrap().is_none());

    // the tree remains usable
    tree.put(b"again", b"alive").unwrap();
    assert_eq!(tree.get(b"again").unwrap().unwrap(), b"alive");
}

#[test]
fn partial_deletes_keep_survivors_reachable() {
    let tmp = tempdir().unwrap();
    let db = Db::open(DbConfig::new(tmp.path().join("partial.mtdb")).page_size(512)).unwrap();
    let tree = db.index("t").unwrap();

    for i in 0..21 {
        tree.put(&key(i), &vec![b'v'; 57]).unwrap();
    }
    // empty out the middle leaves only
    let mut txn = db.begin().unwrap();
    for i in 5..16 {
        tree.delete(&mut txn, &key(i)).unwrap();
    }
    txn.commit().unwrap();

    let stats = tree.verify().unwrap();
    assert_eq!(stats.entry_count, 10);
    for i in 0..21 {
        let expected = !(5..16).contains(&i);
        assert_eq!(tree.get(&key(i)).unwrap().is_some(), expected);
    }
}
