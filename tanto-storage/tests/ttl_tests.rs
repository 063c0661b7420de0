//! TTL expiry through the sweeper thread. These tests sleep across real
//! second boundaries, so budgets allow for sweep granularity.

use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use tanto_storage::{Db, DbOptions};

fn b(s: &str) -> Bytes {
    Bytes::from(s.to_string())
}

#[test]
fn test_entry_expires() {
    let dir = TempDir::new().unwrap();
    let db = Db::open("ttldb", dir.path(), &DbOptions::default()).unwrap();

    db.set(b("ttl-key"), b("ttl-val"), 1);
    assert_eq!(db.get(b"ttl-key").unwrap(), b("ttl-val"));

    thread::sleep(Duration::from_millis(2500));
    assert!(db.get(b"ttl-key").is_none(), "entry survived its TTL");
    assert_eq!(db.entry_count(), 0);

    db.close().unwrap();
}

#[test]
fn test_no_ttl_never_expires() {
    let dir = TempDir::new().unwrap();
    let db = Db::open("keepdb", dir.path(), &DbOptions::default()).unwrap();

    db.set(b("keep"), b("v"), 0);
    thread::sleep(Duration::from_millis(2200));
    assert_eq!(db.get(b"keep").unwrap(), b("v"));

    db.close().unwrap();
}

#[test]
fn test_overwrite_clears_old_membership() {
    let dir = TempDir::new().unwrap();
    let db = Db::open("overwrite", dir.path(), &DbOptions::default()).unwrap();

    db.set(b("k"), b("v1"), 1);
    assert_eq!(db.ttl_index().membership_count(), 1);

    // overwrite with no TTL: the old membership must go away and the entry
    // must outlive the original deadline
    db.set(b("k"), b("v2"), 0);
    assert_eq!(db.ttl_index().membership_count(), 0);

    thread::sleep(Duration::from_millis(2200));
    assert_eq!(db.get(b"k").unwrap(), b("v2"));

    db.close().unwrap();
}

#[test]
fn test_increment_with_zero_ttl_clears_expiry() {
    let dir = TempDir::new().unwrap();
    let db = Db::open("incrttl", dir.path(), &DbOptions::default()).unwrap();

    db.set(b("n"), b("1"), 1);
    assert!(db.increment(b("n"), b("1"), 0));
    assert_eq!(db.ttl_index().membership_count(), 0);

    thread::sleep(Duration::from_millis(2200));
    assert_eq!(db.get(b"n").unwrap(), b("2"));

    db.close().unwrap();
}

#[test]
fn test_delete_removes_membership() {
    let dir = TempDir::new().unwrap();
    let db = Db::open("delttl", dir.path(), &DbOptions::default()).unwrap();

    db.set(b("k"), b("v"), 60);
    assert_eq!(db.ttl_index().membership_count(), 1);
    assert!(db.delete(b"k"));
    assert_eq!(db.ttl_index().membership_count(), 0);

    db.close().unwrap();
}

#[test]
fn test_expiry_survives_many_keys() {
    let dir = TempDir::new().unwrap();
    let db = Db::open("manyttl", dir.path(), &DbOptions::default()).unwrap();

    for i in 0..200 {
        db.set(b(&format!("short:{i}")), b("x"), 1);
        db.set(b(&format!("long:{i}")), b("y"), 600);
    }
    assert_eq!(db.entry_count(), 400);

    thread::sleep(Duration::from_millis(2500));
    assert_eq!(db.entry_count(), 200, "only the short-TTL half expired");
    for i in 0..200 {
        assert!(db.get(format!("long:{i}").as_bytes()).is_some());
        assert!(db.get(format!("short:{i}").as_bytes()).is_none());
    }

    db.close().unwrap();
}
