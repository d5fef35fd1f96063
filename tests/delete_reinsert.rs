use tempfile::tempdir;

use marten::{Db, DbConfig};

fn key(i: u32) -> Vec<u8> {
    format!("key-{i:04}").into_bytes()
}

#[test]
fn interleaved_delete_and_reinsert() {
    let tmp = tempdir().unwrap();
    let db = Db::open(DbConfig::new(tmp.path().join("mix.mtdb")).page_size(512)).unwrap();
    let tree = db.index("mix").unwrap();

    for i in 0..100 {
        tree.put(&key(i), format!("orig{i}").as_bytes()).unwrap();
    }
    for i in (0..100).step_by(2) {
        assert!(tree.remove(&key(i)).unwrap());
    }
    // store odd keys twice with different values; the newest wins
    for i in (1..100).step_by(2) {
        tree.put(&key(i), format!("first{i}").as_bytes()).unwrap();
        tree.put(&key(i), format!("v{i}").as_bytes()).unwrap();
    }

    for i in 0..100 {
        let found = tree.get(&key(i)).unwrap();
        if i % 2 == 0 {
            assert_eq!(found, None, "even key {i} should be gone");
        } else {
            assert_eq!(found.unwrap(), format!("v{i}").into_bytes());
        }
    }

    let stats = tree.verify().unwrap();
    assert_eq!(stats.entry_count, 50);
}

#[test]
fn remove_of_absent_key_reports_false() {
    let tmp = tempdir().unwrap();
    let db = Db::open(DbConfig::new(tmp.path().join("absent.mtdb"))).unwrap();
    let tree = db.index("t").unwrap();
    tree.put(b"present", b"x").unwrap();
    assert!(!tree.remove(b"missing").unwrap());
    assert!(tree.remove(b"present").unwrap());
    assert!(!tree.remove(b"present").unwrap());
}
