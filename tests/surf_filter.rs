//! # SuRF Integration Tests
//!
//! End-to-end coverage for the succinct range filter: the no-false-negative
//! guarantee, range queries, iterator order and inversion, and
//! marshal/unmarshal equivalence. Most tests run at two bits-per-key hints
//! so both the dense-heavy and the fully-sparse layouts are exercised.

use tridex::{Builder, Surf, SuffixType};

const HINTS: &[usize] = &[1, 1000];

fn value_of(i: usize) -> [u8; 4] {
    (i as u32).to_be_bytes()
}

fn build(keys: &[&[u8]], suffix: SuffixType, hash_len: u32, real_len: u32, hint: usize) -> Surf {
    let mut builder = Builder::new(4, suffix, hash_len, real_len).unwrap();
    for (i, key) in keys.iter().enumerate() {
        builder.add(key, &value_of(i)).unwrap();
    }
    builder.finish(hint)
}

fn word_keys() -> Vec<&'static [u8]> {
    let mut keys: Vec<&[u8]> = vec![
        b"aaa", b"aab", b"abc", b"ax", b"b", b"bcd", b"bce", b"bcf", b"care", b"career",
        b"careful", b"cart", b"dog", b"dzzz", b"x",
    ];
    keys.sort();
    keys
}

#[test]
fn no_false_negatives() {
    let keys = word_keys();
    for &hint in HINTS {
        for (suffix, hl, rl) in [
            (SuffixType::None, 0, 0),
            (SuffixType::Hash, 8, 0),
            (SuffixType::Real, 0, 8),
            (SuffixType::Mixed, 4, 4),
        ] {
            let surf = build(&keys, suffix, hl, rl, hint);
            for (i, key) in keys.iter().enumerate() {
                let got = surf.get(key);
                assert_eq!(
                    got,
                    Some(&value_of(i)[..]),
                    "key {key:?} suffix {suffix:?} hint {hint}"
                );
            }
        }
    }
}

#[test]
fn definite_misses_are_rejected() {
    let keys = word_keys();
    for &hint in HINTS {
        let surf = build(&keys, SuffixType::Real, 0, 16, hint);
        // Absent labels on the trie path are definite misses.
        assert_eq!(surf.get(b"zebra"), None);
        assert_eq!(surf.get(b"aq"), None);
        assert_eq!(surf.get(b"carp"), None);
        // "carefxy" reaches the leaf storing "careful", whose real suffix
        // bits ("ul") disprove it.
        assert_eq!(surf.get(b"carefxy"), None);
    }
}

#[test]
fn mixed_suffix_single_key() {
    let surf = {
        let mut builder = Builder::new(2, SuffixType::Mixed, 2, 2).unwrap();
        builder.add(&[1, 2, 3, 4, 5, 6, 7, 8, 9], &[1, 2]).unwrap();
        builder.finish(16)
    };
    assert_eq!(surf.get(&[1, 2, 3, 4, 5, 6, 7, 8, 9]), Some(&[1, 2][..]));
}

#[test]
fn range_queries() {
    let keys: Vec<&[u8]> = vec![&[1], &[1, 1], &[1, 1, 1], &[2], &[2, 2]];
    for &hint in HINTS {
        let surf = build(&keys, SuffixType::Real, 0, 8, hint);

        assert!(surf.has_range(&[0], &[1, 1]), "hint {hint}");
        assert!(!surf.has_range(&[3], &[4]), "hint {hint}");
        assert!(surf.has_range(&[2, 1], &[3]));
        assert!(surf.has_range(&[1, 1, 1], &[1, 2]));
        assert!(!surf.has_range(&[2, 3], &[2, 5]));
    }
}

#[test]
fn range_over_word_keys() {
    let keys = word_keys();
    for &hint in HINTS {
        let surf = build(&keys, SuffixType::Real, 0, 16, hint);
        assert!(surf.has_range(b"a", b"b"));
        assert!(surf.has_range(b"dog", b"dog\x00"), "left edge inclusive");
        assert!(surf.has_range(b"e", b"z"));
        assert!(!surf.has_range(b"e", b"w"));
    }
}

#[test]
fn iterator_yields_truncated_keys_in_order() {
    let keys = word_keys();
    for &hint in HINTS {
        let surf = build(&keys, SuffixType::Real, 0, 16, hint);
        let mut it = surf.iter();

        let mut seen: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        it.seek_to_first();
        while it.valid() {
            let key = it.key().to_vec();
            let value = it.value().to_vec();
            seen.push((key, value));
            it.next();
        }

        assert_eq!(seen.len(), keys.len(), "hint {hint}");
        for (i, (trunc, value)) in seen.iter().enumerate() {
            assert!(
                keys[i].starts_with(trunc),
                "position {i}: {trunc:?} is not a prefix of {:?}",
                keys[i]
            );
            assert_eq!(value, &value_of(i), "value order tracks key order");
        }
        for pair in seen.windows(2) {
            assert!(pair[0].0 < pair[1].0, "ascending truncated keys");
        }
    }
}

#[test]
fn iterator_backward_matches_forward() {
    let keys = word_keys();
    for &hint in HINTS {
        let surf = build(&keys, SuffixType::Real, 0, 16, hint);
        let mut it = surf.iter();

        let mut forward = Vec::new();
        it.seek_to_first();
        while it.valid() {
            forward.push(it.key().to_vec());
            it.next();
        }

        let mut backward = Vec::new();
        it.seek_to_last();
        while it.valid() {
            backward.push(it.key().to_vec());
            it.prev();
        }
        backward.reverse();

        assert_eq!(forward, backward, "hint {hint}");
    }
}

#[test]
fn next_then_prev_returns_to_the_same_position() {
    let keys = word_keys();
    for &hint in HINTS {
        let surf = build(&keys, SuffixType::Real, 0, 16, hint);

        for skip in 0..keys.len() - 1 {
            let mut it = surf.iter();
            it.seek_to_first();
            for _ in 0..skip {
                it.next();
            }
            assert!(it.valid());
            let here = it.key().to_vec();

            it.next();
            assert!(it.valid(), "position {skip} has a successor");
            it.prev();
            assert!(it.valid());
            assert_eq!(it.key(), &here[..], "hint {hint} position {skip}");
        }
    }
}

#[test]
fn seek_lands_on_smallest_key_not_less_than_target() {
    let keys = word_keys();
    for &hint in HINTS {
        let surf = build(&keys, SuffixType::Real, 0, 16, hint);
        let mut it = surf.iter();

        // Between "b" and "bcd".
        it.seek(b"baa");
        assert!(it.valid());
        assert!(b"bcd".starts_with(it.key()));

        // Before everything.
        it.seek(b"A");
        assert!(it.valid());
        assert!(b"aaa".starts_with(it.key()));

        // Past everything.
        it.seek(b"zzzz");
        assert!(!it.valid());

        // Exact key present: seek may report a potential exact match.
        let fp = it.seek(b"dog");
        assert!(it.valid());
        assert!(fp, "landing on 'dog' is a potential exact match");
    }
}

#[test]
fn marshal_unmarshal_preserves_behavior() {
    let keys = word_keys();
    for &hint in HINTS {
        for (suffix, hl, rl) in [
            (SuffixType::None, 0, 0),
            (SuffixType::Hash, 8, 0),
            (SuffixType::Real, 0, 16),
            (SuffixType::Mixed, 4, 8),
        ] {
            let surf = build(&keys, suffix, hl, rl, hint);
            let bytes = surf.marshal();
            assert_eq!(bytes.len(), surf.marshal_size());
            assert_eq!(bytes.len() % 8, 0, "output is 8-byte aligned");

            let decoded = Surf::unmarshal(&bytes).unwrap();
            for key in &keys {
                assert_eq!(decoded.get(key), surf.get(key));
            }
            for probe in [&b"aa"[..], b"bb", b"nope", b"career", b"cart", b"zz"] {
                assert_eq!(decoded.get(probe), surf.get(probe), "probe {probe:?}");
            }

            let mut a = surf.iter();
            let mut b = decoded.iter();
            a.seek_to_first();
            b.seek_to_first();
            while a.valid() {
                assert!(b.valid());
                assert_eq!(a.key(), b.key());
                assert_eq!(a.value(), b.value());
                a.next();
                b.next();
            }
            assert!(!b.valid());

            assert_eq!(decoded.marshal(), bytes, "re-marshal is byte-identical");
        }
    }
}

#[test]
fn write_to_matches_marshal() {
    let keys = word_keys();
    let surf = build(&keys, SuffixType::Mixed, 4, 4, 100);
    let mut out = Vec::new();
    surf.write_to(&mut out).unwrap();
    assert_eq!(out, surf.marshal());
}

#[test]
fn unmarshal_rejects_truncation() {
    let keys = word_keys();
    let surf = build(&keys, SuffixType::Real, 0, 16, 100);
    let bytes = surf.marshal();
    assert!(Surf::unmarshal(&bytes[..2]).is_err());
    assert!(Surf::unmarshal(&bytes[..bytes.len() / 2]).is_err());
}

#[test]
fn empty_filter() {
    let builder = Builder::new(0, SuffixType::None, 0, 0).unwrap();
    let surf = builder.finish(10);
    assert_eq!(surf.get(b"anything"), None);
    assert!(!surf.has_range(b"a", b"z"));
    let mut it = surf.iter();
    assert!(!it.seek(b"a"));
    assert!(!it.valid());
}

#[test]
fn large_sorted_key_set() {
    let mut keys: Vec<Vec<u8>> = (0u32..5_000).map(|i| (i * 7919).to_be_bytes().to_vec()).collect();
    keys.sort();
    keys.dedup();

    for &hint in HINTS {
        let mut builder = Builder::new(4, SuffixType::Real, 0, 16).unwrap();
        for (i, key) in keys.iter().enumerate() {
            builder.add(key, &value_of(i)).unwrap();
        }
        let surf = builder.finish(hint);

        for (i, key) in keys.iter().enumerate() {
            assert_eq!(surf.get(key), Some(&value_of(i)[..]), "hint {hint}");
        }

        let mut it = surf.iter();
        it.seek_to_first();
        let mut count = 0;
        while it.valid() {
            count += 1;
            it.next();
        }
        assert_eq!(count, keys.len());
    }
}
