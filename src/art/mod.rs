//! # ART: Concurrent Adaptive Radix Tree
//!
//! An ordered byte-key map whose node type adapts to fan-out (4, 16, 48,
//! 256 children) and whose readers run lock-free under optimistic
//! version-based synchronization, after "The ART of Practical
//! Synchronization" (Leis et al., DaMoN 2016).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Art (get / put / delete restart loops) │
//! ├─────────────────────────────────────────┤
//! │  descent state machines     (tree.rs)   │
//! ├────────────────────┬────────────────────┤
//! │ optimistic version │ adaptive nodes     │
//! │ lock     (lock.rs) │ + leaves (node.rs) │
//! └────────────────────┴────────────────────┘
//! ```
//!
//! Readers validate a per-node version counter after every read and restart
//! from the root on interference; writers upgrade the counter to a write
//! lock with compare-and-swap and hold it only across the local mutation.
//! Keys that are strict prefixes of other keys store their value in the
//! covering node's *prefix leaf* slot; the empty key is valid and lives in
//! the root's prefix leaf.
//!
//! ## Memory Reclamation
//!
//! Readers hold no locks, so a node replaced by a grown, shrunken, or split
//! copy cannot be freed while they might still dereference it. Writers push
//! every unlinked allocation onto a retired list instead; `Drop` frees the
//! retired list plus everything still reachable from the root. Replaced
//! interior nodes are retired shallowly — their children and prefix leaf
//! live on under the replacement. The cost is that memory for superseded
//! entries is held until the tree is dropped.
//!
//! ## Thread Safety
//!
//! `Art` is `Send + Sync`; all operations take `&self`. Values returned by
//! `get` borrow the tree and stay valid until it drops, even if the key is
//! concurrently overwritten or deleted.

mod lock;
mod node;
mod tree;

use node::{free_shallow, free_subtree, NodeHeader, NodeRef};
use parking_lot::Mutex;
use std::sync::atomic::AtomicPtr;

/// Concurrent adaptive radix tree over byte keys.
pub struct Art {
    dummy: NodeHeader,
    root: AtomicPtr<u8>,
    retired: Mutex<Vec<NodeRef>>,
}

unsafe impl Send for Art {}
unsafe impl Sync for Art {}

impl Default for Art {
    fn default() -> Self {
        Self::new()
    }
}

impl Art {
    pub fn new() -> Art {
        Art {
            dummy: NodeHeader::dummy(),
            root: AtomicPtr::new(NodeRef::alloc_node4().raw()),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Returns the value most recently put under `key`. The borrow stays
    /// valid until the tree drops, even across concurrent writes.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        loop {
            if let Some(result) = self.search_once(key) {
                return result;
            }
            std::hint::spin_loop();
        }
    }

    /// Inserts `key`, replacing any existing value.
    pub fn put(&self, key: &[u8], value: &[u8]) {
        loop {
            if self.insert_once(key, value) {
                return;
            }
            std::hint::spin_loop();
        }
    }

    /// Removes `key`; a no-op when absent.
    pub fn delete(&self, key: &[u8]) {
        loop {
            if self.remove_once(key) {
                return;
            }
            std::hint::spin_loop();
        }
    }

    pub(crate) fn retire(&self, node: NodeRef) {
        self.retired.lock().push(node);
    }
}

impl Drop for Art {
    fn drop(&mut self) {
        unsafe {
            free_subtree(NodeRef::from_raw(*self.root.get_mut()));
            for node in self.retired.get_mut().drain(..) {
                free_shallow(node);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_and_check(art: &Art, keys: &[&[u8]]) {
        for key in keys {
            art.put(key, key);
        }
        for key in keys {
            assert_eq!(art.get(key), Some(*key), "key {key:?}");
        }
    }

    #[test]
    fn basic_put_get_delete() {
        let art = Art::new();
        art.put(b"hello", b"world");
        assert_eq!(art.get(b"hello"), Some(&b"world"[..]));

        art.delete(b"foobar");
        assert_eq!(art.get(b"hello"), Some(&b"world"[..]));

        art.delete(b"hello");
        assert_eq!(art.get(b"hello"), None);
    }

    #[test]
    fn overwrite_returns_latest() {
        let art = Art::new();
        art.put(b"k", b"one");
        art.put(b"k", b"two");
        assert_eq!(art.get(b"k"), Some(&b"two"[..]));
    }

    #[test]
    fn prefix_leaf_keys() {
        let art = Art::new();
        let keys: &[&[u8]] = &[
            &[1],
            &[1, 2, 3, 4],
            &[1, 2],
            &[1, 2, 3, 4, 5],
            &[1, 2, 3],
            &[2, 3, 4],
            &[2, 3, 5],
            &[2, 3],
            &[3, 1],
            &[3, 2, 3, 7, 5],
            &[3, 2, 3, 4, 5],
            &[3, 2],
        ];
        put_and_check(&art, keys);
    }

    #[test]
    fn empty_key_is_the_null_key() {
        let art = Art::new();
        art.put(b"", b"a");
        assert_eq!(art.get(b""), Some(&b"a"[..]));
        art.put(b"", b"b");
        assert_eq!(art.get(b""), Some(&b"b"[..]));
        art.delete(b"");
        assert_eq!(art.get(b""), None);
    }

    #[test]
    fn expand_leaves_with_long_common_prefixes() {
        let art = Art::new();
        let keys: &[&[u8]] = &[
            b"abcdefghijklmn",
            b"abcdefghijklmnopq",
            b"abcdefg",
            b"abcdefghijklmn123",
            b"abcdefghijklmo123",
            b"deanthropomorphic",
            b"deanthropomorphism",
            b"deanthropomorphization",
            b"deanthropomorphize",
        ];
        put_and_check(&art, keys);
    }

    #[test]
    fn grow_through_every_node_type() {
        let art = Art::new();
        let mut keys = Vec::new();
        for b in 0..=255u8 {
            keys.push(vec![9, b]);
        }
        for key in &keys {
            art.put(key, key);
        }
        for key in &keys {
            assert_eq!(art.get(key), Some(key.as_slice()));
        }
    }

    #[test]
    fn shrink_through_every_node_type() {
        let art = Art::new();
        let mut keys = Vec::new();
        for b in 0..=255u8 {
            keys.push(vec![9, b]);
        }
        for key in &keys {
            art.put(key, key);
        }
        for key in &keys[4..] {
            art.delete(key);
        }
        for key in &keys[..4] {
            assert_eq!(art.get(key), Some(key.as_slice()));
        }
        for key in &keys[4..] {
            assert_eq!(art.get(key), None);
        }
    }

    #[test]
    fn delete_missing_key_is_a_noop() {
        let art = Art::new();
        art.put(&[1, 2, 3], b"v");
        art.delete(&[1, 2, 4]);
        art.delete(&[1, 2]);
        art.delete(&[1, 2, 3, 4]);
        assert_eq!(art.get(&[1, 2, 3]), Some(&b"v"[..]));
    }

    #[test]
    fn compression_scenario() {
        let art = Art::new();
        let keys: &[&[u8]] = &[
            &[2, 1],
            &[1, 2],
            &[1, 2, 5],
            &[1, 2, 3, 7],
            &[1, 2, 3, 4, 5],
            &[1, 2, 3, 4, 6],
        ];
        put_and_check(&art, keys);

        art.delete(&[1, 2, 3, 7]);
        art.delete(&[1, 2, 5]);
        assert_eq!(art.get(&[1, 2, 3, 4, 5]), Some(&[1, 2, 3, 4, 5][..]));
        assert_eq!(art.get(&[1, 2, 3, 4, 6]), Some(&[1, 2, 3, 4, 6][..]));

        art.delete(&[2, 1]);
        art.delete(&[1, 2, 3, 4, 5]);
        art.delete(&[1, 2]);
        assert_eq!(art.get(&[1, 2, 3, 4, 6]), Some(&[1, 2, 3, 4, 6][..]));
        assert_eq!(art.get(&[1, 2, 3, 4, 5]), None);
        assert_eq!(art.get(&[1, 2]), None);
        assert_eq!(art.get(&[2, 1]), None);
    }

    #[test]
    fn long_prefixes_split_past_the_inline_word() {
        let art = Art::new();
        // Shared 12-byte prefix forces prefix_len > 8, then a split inside
        // the overflowed region.
        let a = b"aaaaaaaaaaaaXone";
        let b = b"aaaaaaaaaaaaYtwo";
        let c = b"aaaaaaaaaaZthree";
        art.put(a, b"1");
        art.put(b, b"2");
        art.put(c, b"3");
        assert_eq!(art.get(a), Some(&b"1"[..]));
        assert_eq!(art.get(b), Some(&b"2"[..]));
        assert_eq!(art.get(c), Some(&b"3"[..]));
        assert_eq!(art.get(b"aaaaaaaaaaaa"), None);
    }

    #[test]
    fn values_survive_overwrite_of_their_key() {
        let art = Art::new();
        art.put(b"k", b"old");
        let old = art.get(b"k").unwrap();
        art.put(b"k", b"new");
        assert_eq!(old, b"old", "retired leaf stays readable until drop");
        assert_eq!(art.get(b"k"), Some(&b"new"[..]));
    }
}
