//! Byte-range lock manager tests: POSIX conflict and split semantics,
//! shared against exclusive modes, and owner-level cleanup.

use nfs4_mamont::state::lock_manager::{LockHolder, LockManager};

fn holder(client: u64, name: &[u8]) -> LockHolder {
    LockHolder { client_id: client, owner: name.to_vec() }
}

#[test]
fn shared_locks_coexist_but_exclusive_conflicts() {
    let locks = LockManager::new();
    let fh = b"file";
    let a = holder(1, b"a");
    let b = holder(1, b"b");

    locks.try_lock(fh, &a, false, 0, 100).expect("shared A");
    locks.try_lock(fh, &b, false, 50, 100).expect("shared B overlaps");

    // An exclusive request overlapping either is denied with the holder.
    let c = holder(2, b"c");
    let conflict = locks.try_lock(fh, &c, true, 60, 10).expect_err("exclusive conflict");
    assert!(!conflict.exclusive);

    // Outside the held ranges the exclusive lock goes through.
    locks.try_lock(fh, &c, true, 500, 10).expect("disjoint exclusive");
    let conflict = locks.try_lock(fh, &a, false, 505, 1).expect_err("shared vs exclusive");
    assert!(conflict.exclusive);
    assert_eq!(conflict.offset, 500);
}

#[test]
fn unlock_splits_held_ranges() {
    let locks = LockManager::new();
    let fh = b"file";
    let a = holder(1, b"a");

    locks.try_lock(fh, &a, true, 0, 100).expect("lock");
    // Carving the middle leaves two residual ranges.
    locks.unlock(fh, &a, 40, 20);
    assert_eq!(locks.held_count(), 2);

    let b = holder(1, b"b");
    locks.try_lock(fh, &b, true, 45, 5).expect("hole is free");
    assert!(locks.try_lock(fh, &b, true, 30, 5).is_err());
    assert!(locks.try_lock(fh, &b, true, 65, 5).is_err());

    // Unlocking ranges nobody holds is a no-op.
    locks.unlock(fh, &a, 4000, 50);
    locks.unlock(b"other-file", &a, 0, 10);
    assert_eq!(locks.held_count(), 3);
}

#[test]
fn same_owner_upgrades_in_place() {
    let locks = LockManager::new();
    let fh = b"file";
    let a = holder(1, b"a");

    locks.try_lock(fh, &a, false, 0, 100).expect("shared");
    // The owner's own overlapping range never conflicts; it is replaced.
    locks.try_lock(fh, &a, true, 25, 50).expect("upgrade");
    assert_eq!(locks.held_count(), 3);

    // Another owner sees the exclusive middle but the shared edges.
    let b = holder(2, b"b");
    assert!(locks.try_lock(fh, &b, false, 30, 5).is_err());
    locks.try_lock(fh, &b, false, 0, 10).expect("shared edge");
}

#[test]
fn eof_length_reaches_everything_after_offset() {
    let locks = LockManager::new();
    let fh = b"file";
    let a = holder(1, b"a");
    locks.try_lock(fh, &a, true, 1000, u64::MAX).expect("to EOF");

    let b = holder(2, b"b");
    assert!(locks.try_lock(fh, &b, false, u64::MAX - 5, 5).is_err());
    locks.try_lock(fh, &b, false, 0, 1000).expect("before the range");
}

#[test]
fn test_lock_reports_without_acquiring() {
    let locks = LockManager::new();
    let fh = b"file";
    let a = holder(1, b"a");
    locks.try_lock(fh, &a, true, 0, 10).expect("lock");

    let b = holder(2, b"b");
    let conflict = locks.test_lock(fh, &b, false, 5, 1).expect("conflict");
    assert_eq!(conflict.holder, a);
    assert!(locks.test_lock(fh, &b, false, 50, 1).is_none());
    // Probing never created state for B.
    assert_eq!(locks.held_count(), 1);
}

#[test]
fn owner_and_client_release() {
    let locks = LockManager::new();
    let a1 = holder(1, b"a");
    let a2 = holder(1, b"b");
    let b1 = holder(2, b"a");

    locks.try_lock(b"f1", &a1, true, 0, 10).expect("lock");
    locks.try_lock(b"f2", &a1, true, 0, 10).expect("lock");
    locks.try_lock(b"f1", &a2, true, 50, 10).expect("lock");
    locks.try_lock(b"f3", &b1, true, 0, 10).expect("lock");

    assert!(locks.holder_has_locks(&a1));
    locks.release_holder(&a1);
    assert!(!locks.holder_has_locks(&a1));
    assert_eq!(locks.held_count(), 2);

    locks.release_client(1);
    assert_eq!(locks.held_count(), 1);
    assert!(locks.holder_has_locks(&b1));
}
