//! # TRB Integration Tests
//!
//! Transactional semantics end to end: visibility inside and outside a
//! transaction, rollback restoring the pre-transaction state, slot reuse
//! across commit/rollback cycles, and snapshot reads concurrent with an
//! active writer.

use rand::rngs::StdRng;
use rand::{seq::SliceRandom, SeedableRng};
use std::thread;
use tridex::Tree;

fn key(n: u64) -> [u8; 8] {
    n.to_be_bytes()
}

#[test]
fn commit_then_rollback_scenario() {
    let tree = Tree::new();

    let mut txn = tree.begin();
    for k in [0u64, 2, 4, 6, 8, 10] {
        txn.insert(&key(k), &key(k));
    }
    txn.commit();

    let mut txn = tree.begin();
    for k in [1u64, 3, 5, 7, 9] {
        txn.insert(&key(k), &key(k));
    }

    assert_eq!(txn.get(&key(3)).as_deref(), Some(&key(3)[..]));
    assert_eq!(tree.get(&key(3)), None, "uncommitted insert is invisible");
    assert_eq!(txn.get(&key(4)).as_deref(), Some(&key(4)[..]));

    txn.rollback();

    assert_eq!(tree.get(&key(3)), None);
    assert_eq!(tree.get(&key(4)).as_deref(), Some(&key(4)[..]));
    for k in [0u64, 2, 6, 8, 10] {
        assert_eq!(tree.get(&key(k)).as_deref(), Some(&key(k)[..]));
    }
    for k in [1u64, 5, 7, 9] {
        assert_eq!(tree.get(&key(k)), None);
    }
}

#[test]
fn large_permuted_commit() {
    let mut keys: Vec<u64> = (0..50_000).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(42));

    let tree = Tree::new();
    let mut txn = tree.begin();
    for &k in &keys {
        txn.insert(&key(k), &key(k * 3));
    }
    txn.commit();

    for &k in &keys {
        assert_eq!(tree.get(&key(k)).as_deref(), Some(&key(k * 3)[..]));
    }
    assert_eq!(tree.get(&key(50_000)), None);
}

#[test]
fn transaction_sees_pre_transaction_state() {
    let tree = Tree::new();
    let mut txn = tree.begin();
    txn.insert(b"base", b"committed");
    txn.commit();

    let mut txn = tree.begin();
    assert_eq!(txn.get(b"base").as_deref(), Some(&b"committed"[..]));
    txn.insert(b"base", b"overwritten");
    assert_eq!(txn.get(b"base").as_deref(), Some(&b"overwritten"[..]));
    txn.rollback();

    assert_eq!(tree.get(b"base").as_deref(), Some(&b"committed"[..]));
}

#[test]
fn alternating_commit_rollback_cycles() {
    let tree = Tree::new();

    for round in 0..50u64 {
        let mut txn = tree.begin();
        txn.insert(&key(round), &key(round));
        txn.commit();

        let mut txn = tree.begin();
        txn.insert(&key(1_000 + round), b"scratch");
        txn.insert(&key(round), b"scribble");
        txn.rollback();
    }

    for round in 0..50u64 {
        assert_eq!(tree.get(&key(round)).as_deref(), Some(&key(round)[..]));
        assert_eq!(tree.get(&key(1_000 + round)), None);
    }
}

#[test]
fn rolled_back_slots_are_reused() {
    let tree = Tree::new();
    let mut txn = tree.begin();
    for k in 0..64u64 {
        txn.insert(&key(k), &key(k));
    }
    txn.commit();

    let mut txn = tree.begin();
    txn.insert(&key(64), &key(64));
    txn.commit();

    // Thousands of aborted transactions must not grow the committed state:
    // every rollback returns its slots and its appended bytes.
    for round in 0..5_000u64 {
        let mut txn = tree.begin();
        txn.insert(&key(round % 64), &key(round));
        txn.insert(&key(100_000 + round), &key(round));
        txn.rollback();
    }

    for k in 0..=64u64 {
        assert_eq!(tree.get(&key(k)).as_deref(), Some(&key(k)[..]));
    }
    assert_eq!(tree.get(&key(100_000)), None);
}

#[test]
fn readers_concurrent_with_writer_see_snapshot() {
    let tree = Tree::new();
    let mut txn = tree.begin();
    for k in 0..100u64 {
        txn.insert(&key(k), b"v1");
    }
    txn.commit();

    thread::scope(|scope| {
        let tree_ref = &tree;
        let reader = scope.spawn(move || {
            for _ in 0..1_000 {
                for k in (0..100u64).step_by(7) {
                    // Readers on the committed root never observe the
                    // writer's in-flight values.
                    assert_eq!(tree_ref.get(&key(k)).as_deref(), Some(&b"v1"[..]));
                }
            }
        });

        let mut txn = tree.begin();
        for k in 0..100u64 {
            txn.insert(&key(k), b"v2");
        }
        reader.join().unwrap();
        txn.commit();
    });

    for k in 0..100u64 {
        assert_eq!(tree.get(&key(k)).as_deref(), Some(&b"v2"[..]));
    }
}

#[test]
fn empty_keys_and_values() {
    let tree = Tree::new();
    let mut txn = tree.begin();
    txn.insert(b"", b"empty-key");
    txn.insert(b"empty-value", b"");
    txn.commit();

    assert_eq!(tree.get(b"").as_deref(), Some(&b"empty-key"[..]));
    assert_eq!(tree.get(b"empty-value").as_deref(), Some(&b""[..]));
}
