use tempfile::tempdir;

use marten::{Db, DbConfig};

fn key(i: usize) -> Vec<u8> {
    format!("k{i:03}").into_bytes()
}

fn value() -> Vec<u8> {
    vec![b'v'; 100]
}

fn scan_all(tree: &marten::Tree) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut cursor = tree.cursor();
    let mut entry = cursor.first().unwrap();
    while let Some((k, v)) = entry {
        out.push((k, v));
        entry = cursor.next().unwrap();
    }
    out
}

#[test]
fn ascending_bulk_load_scans_in_order() {
    let tmp = tempdir().unwrap();
    let db = Db::open(DbConfig::new(tmp.path().join("asc.mtdb")).page_size(4096)).unwrap();
    let tree = db.index("bulk").unwrap();

    for i in 0..1000 {
        tree.put(&key(i), &value()).unwrap();
    }

    let entries = scan_all(&tree);
    assert_eq!(entries.len(), 1000);
    for (i, (k, v)) in entries.iter().enumerate() {
        assert_eq!(k, &key(i));
        assert_eq!(v, &value());
    }

    let stats = tree.verify().unwrap();
    assert_eq!(stats.entry_count, 1000);
    assert!(stats.depth >= 2);

    // an ascending load seals each leaf nearly full: every leaf except the
    // last still-open one has only a bounded remainder
    for available in &stats.leaf_available[..stats.leaf_available.len() - 1] {
        assert!(
            *available <= 512,
            "sealed leaf has {available} free bytes"
        );
    }
}

#[test]
fn descending_bulk_load_matches_ascending_order() {
    let tmp = tempdir().unwrap();
    let db = Db::open(DbConfig::new(tmp.path().join("desc.mtdb")).page_size(4096)).unwrap();
    let tree = db.index("bulk").unwrap();

    for i in (0..1000).rev() {
        tree.put(&key(i), &value()).unwrap();
    }

    let entries = scan_all(&tree);
    assert_eq!(entries.len(), 1000);
    for (i, (k, _)) in entries.iter().enumerate() {
        assert_eq!(k, &key(i));
    }
    tree.verify().unwrap();
}

#[test]
fn random_order_load_scans_sorted() {
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    let tmp = tempdir().unwrap();
    let db = Db::open(DbConfig::new(tmp.path().join("rand.mtdb")).page_size(4096)).unwrap();
    let tree = db.index("bulk").unwrap();

    let mut order: Vec<usize> = (0..1000).collect();
    order.shuffle(&mut rand::rngs::StdRng::seed_from_u64(42));
    for i in order {
        tree.put(&key(i), &value()).unwrap();
    }

    let entries = scan_all(&tree);
    assert_eq!(entries.len(), 1000);
    for (i, (k, _)) in entries.iter().enumerate() {
        assert_eq!(k, &key(i));
    }
    tree.verify().unwrap();
}
