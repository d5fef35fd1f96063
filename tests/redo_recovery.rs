use std::collections::BTreeMap;

use tempfile::tempdir;

use marten::{Db, DbConfig};

fn key(i: u32) -> Vec<u8> {
    format!("r{i:04}").into_bytes()
}

/// The page file never sees the data before the simulated crash, so the
/// reopened state is produced purely by replaying the redo log — and must
/// equal the directly written state.
#[test]
fn replay_after_crash_equals_direct_writes() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("crash.mtdb");
    let mut expected = BTreeMap::new();

    {
        let db = Db::open(DbConfig::new(&path).page_size(512)).unwrap();
        let tree = db.index("t").unwrap();
        for i in 0..200 {
            let value = format!("value-{i}").into_bytes();
            tree.put(&key(i), &value).unwrap();
            expected.insert(key(i), value);
        }
        for i in (0..200).step_by(3) {
            tree.remove(&key(i)).unwrap();
            expected.remove(&key(i));
        }

        // a rolled-back transaction leaves no trace after replay
        let mut txn = db.begin().unwrap();
        tree.store(&mut txn, b"phantom", b"nope").unwrap();
        txn.rollback().unwrap();

        // dropping without close(): no checkpoint, dirty pages are lost
        drop(db);
    }

    let db = Db::open(DbConfig::new(&path)).unwrap();
    let tree = db.index("t").unwrap();
    assert_eq!(tree.get(b"phantom").unwrap(), None);

    let mut scanned = BTreeMap::new();
    let mut cursor = tree.cursor();
    let mut entry = cursor.first().unwrap();
    while let Some((k, v)) = entry {
        scanned.insert(k, v);
        entry = cursor.next().unwrap();
    }
    assert_eq!(scanned, expected);
    tree.verify().unwrap();
}

#[test]
fn clean_close_reopens_without_replay_work() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("clean.mtdb");

    {
        let db = Db::open(DbConfig::new(&path)).unwrap();
        let tree = db.index("t").unwrap();
        for i in 0..50 {
            tree.put(&key(i), b"persisted").unwrap();
        }
        db.close().unwrap();
    }

    let db = Db::open(DbConfig::new(&path)).unwrap();
    let tree = db.index("t").unwrap();
    for i in 0..50 {
        assert_eq!(tree.get(&key(i)).unwrap().unwrap(), b"persisted");
    }
    tree.verify().unwrap();
}

#[test]
fn checkpoint_then_crash_replays_only_the_tail() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("tail.mtdb");

    {
        let db = Db::open(DbConfig::new(&path)).unwrap();
        let tree = db.index("t").unwrap();
        for i in 0..50 {
            tree.put(&key(i), b"base").unwrap();
        }
        db.checkpoint().unwrap();
        for i in 50..80 {
            tree.put(&key(i), b"tail").unwrap();
        }
        drop(db);
    }

    let db = Db::open(DbConfig::new(&path)).unwrap();
    let tree = db.index("t").unwrap();
    for i in 0..50 {
        assert_eq!(tree.get(&key(i)).unwrap().unwrap(), b"base");
    }
    for i in 50..80 {
        assert_eq!(tree.get(&key(i)).unwrap().unwrap(), b"tail");
    }
}

#[test]
fn second_index_survives_recovery() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("multi.mtdb");

    {
        let db = Db::open(DbConfig::new(&path)).unwrap();
        let first = db.index("first").unwrap();
        let second = db.index("second").unwrap();
        first.put(b"k", b"in-first").unwrap();
        second.put(b"k", b"in-second").unwrap();
        drop(db);
    }

    let db = Db::open(DbConfig::new(&path)).unwrap();
    assert_eq!(
        db.index("first").unwrap().get(b"k").unwrap().unwrap(),
        b"in-first"
    );
    assert_eq!(
        db.index("second").unwrap().get(b"k").unwrap().unwrap(),
        b"in-second"
    );
}
