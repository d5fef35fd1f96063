use tempfile::tempdir;

use marten::{Db, DbConfig, Error, UpgradeRule};

#[test]
fn store_find_replace_delete_roundtrip() {
    let tmp = tempdir().unwrap();
    let db = Db::open(DbConfig::new(tmp.path().join("rt.mtdb"))).unwrap();
    let tree = db.index("t").unwrap();

    tree.put(b"k", b"v").unwrap();
    assert_eq!(tree.get(b"k").unwrap().unwrap(), b"v");
    tree.put(b"k", b"v2").unwrap();
    assert_eq!(tree.get(b"k").unwrap().unwrap(), b"v2");
    assert!(tree.remove(b"k").unwrap());
    assert_eq!(tree.get(b"k").unwrap(), None);
}

#[test]
fn rollback_restores_previous_state() {
    let tmp = tempdir().unwrap();
    let db = Db::open(DbConfig::new(tmp.path().join("rb.mtdb"))).unwrap();
    let tree = db.index("t").unwrap();
    tree.put(b"stable", b"before").unwrap();

    let mut txn = db.begin().unwrap();
    tree.store(&mut txn, b"stable", b"changed").unwrap();
    tree.store(&mut txn, b"fresh", b"inserted").unwrap();
    assert!(tree.delete(&mut txn, b"stable").unwrap());
    txn.rollback().unwrap();

    assert_eq!(tree.get(b"stable").unwrap().unwrap(), b"before");
    assert_eq!(tree.get(b"fresh").unwrap(), None);
    tree.verify().unwrap();
}

#[test]
fn uncommitted_delete_ghosts_until_commit() {
    let tmp = tempdir().unwrap();
    let db = Db::open(DbConfig::new(tmp.path().join("ghost.mtdb"))).unwrap();
    let tree = db.index("t").unwrap();
    tree.put(b"doomed", b"value").unwrap();

    let mut txn = db.begin().unwrap();
    assert!(tree.delete(&mut txn, b"doomed").unwrap());

    // the ghost still occupies its slot but reads as absent
    assert_eq!(tree.get(b"doomed").unwrap(), None);
    let stats = tree.verify().unwrap();
    assert_eq!(stats.entry_count, 0);

    txn.commit().unwrap();
    assert_eq!(tree.get(b"doomed").unwrap(), None);
}

#[test]
fn shared_lock_blocks_writer_until_release() {
    let tmp = tempdir().unwrap();
    let db = Db::open(DbConfig::new(tmp.path().join("rr.mtdb"))).unwrap();
    let tree = db.index("t").unwrap();
    tree.put(b"row", b"v").unwrap();

    let mut reader = db.begin().unwrap();
    assert_eq!(tree.load(&mut reader, b"row").unwrap().unwrap(), b"v");

    let mut writer = db.begin().unwrap();
    writer.set_lock_timeout_nanos(50_000_000);
    assert!(matches!(
        tree.store(&mut writer, b"row", b"w"),
        Err(Error::LockTimeout)
    ));
    drop(writer);

    reader.commit().unwrap();
    tree.put(b"row", b"w").unwrap();
    assert_eq!(tree.get(b"row").unwrap().unwrap(), b"w");
}

#[test]
fn lenient_rule_lets_sole_reader_write() {
    let tmp = tempdir().unwrap();
    let db = Db::open(DbConfig::new(tmp.path().join("lenient.mtdb"))).unwrap();
    let tree = db.index("t").unwrap();
    tree.put(b"row", b"v").unwrap();

    let mut txn = db.begin().unwrap();
    assert_eq!(tree.load(&mut txn, b"row").unwrap().unwrap(), b"v");
    // sole shared holder upgrades under the default lenient rule
    tree.store(&mut txn, b"row", b"mine").unwrap();
    txn.commit().unwrap();
    assert_eq!(tree.get(b"row").unwrap().unwrap(), b"mine");
}

#[test]
fn strict_rule_refuses_read_then_write() {
    let tmp = tempdir().unwrap();
    let db = Db::open(
        DbConfig::new(tmp.path().join("strict.mtdb")).upgrade_rule(UpgradeRule::Strict),
    )
    .unwrap();
    let tree = db.index("t").unwrap();
    tree.put(b"row", b"v").unwrap();

    let mut txn = db.begin().unwrap();
    assert_eq!(tree.load(&mut txn, b"row").unwrap().unwrap(), b"v");
    assert!(matches!(
        tree.store(&mut txn, b"row", b"mine"),
        Err(Error::IllegalUpgrade)
    ));
}

#[test]
fn key_size_limit_is_exact() {
    let tmp = tempdir().unwrap();
    let db = Db::open(DbConfig::new(tmp.path().join("keymax.mtdb")).page_size(4096)).unwrap();
    let tree = db.index("t").unwrap();

    // ((4096 - 12) / 2 - 22) bytes is the largest accepted key
    let max = 2020;
    let big = vec![b'k'; max];
    tree.put(&big, b"fits").unwrap();
    assert_eq!(tree.get(&big).unwrap().unwrap(), b"fits");

    let too_big = vec![b'k'; max + 1];
    assert!(matches!(
        tree.put(&too_big, b"nope"),
        Err(Error::KeyTooLarge { .. })
    ));
}

#[test]
fn oversized_values_are_rejected() {
    let tmp = tempdir().unwrap();
    let db = Db::open(DbConfig::new(tmp.path().join("valmax.mtdb")).page_size(512)).unwrap();
    let tree = db.index("t").unwrap();
    assert!(matches!(
        tree.put(b"k", &vec![b'v'; 4096]),
        Err(Error::ValueTooLarge { .. })
    ));
}

#[test]
fn committed_transaction_rejects_further_use() {
    let tmp = tempdir().unwrap();
    let db = Db::open(DbConfig::new(tmp.path().join("state.mtdb"))).unwrap();
    let tree = db.index("t").unwrap();

    let mut txn = db.begin().unwrap();
    tree.store(&mut txn, b"k", b"v").unwrap();
    let id = txn.id();
    txn.commit().unwrap();
    assert!(id > 0);

    // a fresh transaction is required afterwards
    let mut txn = db.begin().unwrap();
    assert_eq!(tree.load(&mut txn, b"k").unwrap().unwrap(), b"v");
    txn.commit().unwrap();
}

#[test]
fn scoped_locks_release_on_exit() {
    let tmp = tempdir().unwrap();
    let db = Db::open(DbConfig::new(tmp.path().join("scope.mtdb"))).unwrap();
    let tree = db.index("t").unwrap();
    tree.put(b"inner", b"v").unwrap();

    let mut holder = db.begin().unwrap();
    holder.scope_enter().unwrap();
    assert_eq!(tree.load(&mut holder, b"inner").unwrap().unwrap(), b"v");
    holder.scope_exit().unwrap();

    // the scope released the shared lock, so a writer proceeds at once
    let mut writer = db.begin().unwrap();
    writer.set_lock_timeout_nanos(50_000_000);
    tree.store(&mut writer, b"inner", b"w").unwrap();
    writer.commit().unwrap();
}

#[test]
fn drop_index_closes_live_handles() {
    let tmp = tempdir().unwrap();
    let db = Db::open(DbConfig::new(tmp.path().join("dropidx.mtdb"))).unwrap();
    let tree = db.index("t").unwrap();
    tree.put(b"k", b"v").unwrap();

    db.drop_index("t").unwrap();
    assert!(matches!(tree.get(b"k"), Err(Error::ClosedIndex)));

    // the name can be reused for a fresh, empty index
    let tree = db.index("t").unwrap();
    assert_eq!(tree.get(b"k").unwrap(), None);
}
