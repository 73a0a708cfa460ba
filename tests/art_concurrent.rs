//! # ART Integration Tests
//!
//! End-to-end coverage for the concurrent adaptive radix tree: sequential
//! semantics (last put wins, deletes are final), structural transitions
//! across all node types, and multi-threaded workloads where readers run
//! against concurrent writers.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::sync::{Arc, Barrier};
use std::thread;
use tridex::Art;

#[test]
fn last_put_wins() {
    let art = Art::new();
    for round in 0..5u8 {
        for k in 0..100u8 {
            art.put(&[k], &[k, round]);
        }
    }
    for k in 0..100u8 {
        assert_eq!(art.get(&[k]), Some(&[k, 4][..]));
    }
}

#[test]
fn delete_then_get_is_absent() {
    let art = Art::new();
    for k in 0..200u8 {
        art.put(&[7, k], &[k]);
    }
    for k in 0..200u8 {
        art.delete(&[7, k]);
        assert_eq!(art.get(&[7, k]), None);
    }
    for k in 0..200u8 {
        assert_eq!(art.get(&[7, k]), None, "deletes are final");
    }
}

#[test]
fn randomized_keys_roundtrip() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut keys: Vec<Vec<u8>> = (0..20_000)
        .map(|_| {
            let len = rng.gen_range(1..=24);
            let mut key = vec![0u8; len];
            rng.fill_bytes(&mut key);
            key
        })
        .collect();
    keys.sort();
    keys.dedup();

    let art = Art::new();
    for key in &keys {
        art.put(key, key);
    }
    for key in &keys {
        assert_eq!(art.get(key), Some(key.as_slice()));
    }
}

#[test]
fn compression_after_deletes() {
    let art = Art::new();
    let keys: &[&[u8]] = &[
        &[2, 1],
        &[1, 2],
        &[1, 2, 5],
        &[1, 2, 3, 7],
        &[1, 2, 3, 4, 5],
        &[1, 2, 3, 4, 6],
    ];
    for key in keys {
        art.put(key, key);
    }

    art.delete(&[1, 2, 3, 7]);
    art.delete(&[1, 2, 5]);
    assert_eq!(art.get(&[1, 2, 3, 4, 5]), Some(&[1, 2, 3, 4, 5][..]));
    assert_eq!(art.get(&[1, 2, 3, 4, 6]), Some(&[1, 2, 3, 4, 6][..]));

    art.delete(&[2, 1]);
    art.delete(&[1, 2, 3, 4, 5]);
    art.delete(&[1, 2]);
    assert_eq!(art.get(&[1, 2, 3, 4, 6]), Some(&[1, 2, 3, 4, 6][..]));
    for gone in [&[2, 1][..], &[1, 2, 5], &[1, 2, 3, 7], &[1, 2, 3, 4, 5], &[1, 2]] {
        assert_eq!(art.get(gone), None);
    }
}

#[test]
fn empty_and_null_key_share_identity() {
    let art = Art::new();
    art.put(&[], b"a");
    art.put(b"", b"b");
    assert_eq!(art.get(&[]), Some(&b"b"[..]));
    assert_eq!(art.get(b""), Some(&b"b"[..]));
}

#[test]
fn concurrent_disjoint_writers() {
    const THREADS: usize = 8;
    const KEYS_PER_THREAD: u32 = 4_000;

    let art = Arc::new(Art::new());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let art = Arc::clone(&art);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..KEYS_PER_THREAD {
                    let key = [t as u8, (i >> 8) as u8, i as u8];
                    art.put(&key, &key);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for t in 0..THREADS {
        for i in 0..KEYS_PER_THREAD {
            let key = [t as u8, (i >> 8) as u8, i as u8];
            assert_eq!(art.get(&key), Some(&key[..]));
        }
    }
}

#[test]
fn concurrent_readers_see_consistent_values() {
    const WRITER_ROUNDS: u32 = 2_000;

    let art = Arc::new(Art::new());
    for k in 0..64u8 {
        art.put(&[k], &[k, 0, 0]);
    }

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let art = Arc::clone(&art);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(0xbeef);
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    let k = rng.gen_range(0..64u8);
                    // The key is never deleted, so a lookup must succeed and
                    // return one of the values some writer actually wrote.
                    let v = art.get(&[k]).expect("key is always present");
                    assert_eq!(v[0], k);
                }
            })
        })
        .collect();

    for round in 0..WRITER_ROUNDS {
        for k in 0..64u8 {
            art.put(&[k], &[k, (round >> 8) as u8, round as u8]);
        }
    }
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }

    let last = WRITER_ROUNDS - 1;
    for k in 0..64u8 {
        assert_eq!(art.get(&[k]), Some(&[k, (last >> 8) as u8, last as u8][..]));
    }
}

#[test]
fn concurrent_put_delete_interleaving() {
    const THREADS: usize = 6;

    let art = Arc::new(Art::new());
    let barrier = Arc::new(Barrier::new(THREADS));

    // Each thread owns a key range; it inserts everything, then deletes the
    // odd keys, so the final state is determined per thread regardless of
    // the cross-thread interleaving.
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let art = Arc::clone(&art);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..2_000u32 {
                    let key = [t as u8, (i >> 8) as u8, i as u8];
                    art.put(&key, &key);
                    if i % 2 == 1 {
                        art.delete(&key);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for t in 0..THREADS {
        for i in 0..2_000u32 {
            let key = [t as u8, (i >> 8) as u8, i as u8];
            let expected = if i % 2 == 0 { Some(&key[..]) } else { None };
            assert_eq!(art.get(&key), expected, "thread {t} key {i}");
        }
    }
}
