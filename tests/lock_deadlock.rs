use std::sync::{Arc, Barrier};
use std::thread;

use tempfile::tempdir;

use marten::{Db, DbConfig, Error};

#[test]
fn crossing_writers_produce_one_deadlock_victim() {
    let tmp = tempdir().unwrap();
    let db = Db::open(DbConfig::new(tmp.path().join("dl.mtdb"))).unwrap();
    let tree = db.index("t").unwrap();
    tree.put(b"a", b"0").unwrap();
    tree.put(b"b", b"0").unwrap();

    let barrier = Arc::new(Barrier::new(2));

    // A takes "a" then wants "b" with a 500ms timeout: the designated
    // victim once the cycle closes.
    let victim = {
        let db = db.clone();
        let tree = tree.clone();
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            let mut txn = db.begin().unwrap();
            txn.set_lock_timeout_nanos(500_000_000);
            tree.store(&mut txn, b"a", b"from-A").unwrap();
            barrier.wait();
            let result = tree.store(&mut txn, b"b", b"from-A");
            drop(txn); // rollback releases "a" either way
            result
        })
    };

    // B takes "b" then wants "a", waiting long enough to survive the
    // victim's reset.
    let survivor = {
        let db = db.clone();
        let tree = tree.clone();
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            let mut txn = db.begin().unwrap();
            txn.set_lock_timeout_nanos(5_000_000_000);
            tree.store(&mut txn, b"b", b"from-B").unwrap();
            barrier.wait();
            tree.store(&mut txn, b"a", b"from-B")?;
            txn.commit()
        })
    };

    let victim_result = victim.join().unwrap();
    let survivor_result = survivor.join().unwrap();

    match victim_result {
        Err(Error::Deadlock { cycle, .. }) => assert!(!cycle.is_empty()),
        other => panic!("expected deadlock for the short-timeout writer, got {other:?}"),
    }
    survivor_result.unwrap();
    assert_eq!(tree.get(b"a").unwrap().unwrap(), b"from-B");
    assert_eq!(tree.get(b"b").unwrap().unwrap(), b"from-B");
}

#[test]
fn lock_wait_times_out_without_cycle() {
    let tmp = tempdir().unwrap();
    let db = Db::open(DbConfig::new(tmp.path().join("to.mtdb"))).unwrap();
    let tree = db.index("t").unwrap();
    tree.put(b"row", b"0").unwrap();

    let mut holder = db.begin().unwrap();
    tree.store(&mut holder, b"row", b"held").unwrap();

    let mut blocked = db.begin().unwrap();
    blocked.set_lock_timeout_nanos(100_000_000);
    match tree.store(&mut blocked, b"row", b"nope") {
        Err(Error::LockTimeout) => {}
        other => panic!("expected LockTimeout, got {other:?}"),
    }
}

#[test]
fn interrupt_surfaces_as_lock_interrupted() {
    let tmp = tempdir().unwrap();
    let db = Db::open(DbConfig::new(tmp.path().join("int.mtdb"))).unwrap();
    let tree = db.index("t").unwrap();
    tree.put(b"row", b"0").unwrap();

    let mut holder = db.begin().unwrap();
    tree.store(&mut holder, b"row", b"held").unwrap();

    let mut blocked = db.begin().unwrap();
    blocked.set_lock_timeout_nanos(-1);
    let interrupter = blocked.interrupter();
    let poker = thread::spawn(move || {
        thread::sleep(std::time::Duration::from_millis(100));
        interrupter.interrupt();
    });

    match tree.store(&mut blocked, b"row", b"nope") {
        Err(Error::LockInterrupted) => {}
        other => panic!("expected LockInterrupted, got {other:?}"),
    }
    poker.join().unwrap();
}
