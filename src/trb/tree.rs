//! # Transactional Copy-on-Write Red-Black Tree
//!
//! An ordered byte-key map with transactional commit/rollback. Every
//! mutating step allocates fresh node slots instead of rewriting live ones,
//! so the committed root always names an immutable snapshot.
//!
//! ## Transaction Flow
//!
//! ```text
//! begin()  snapshot root address + data-store tail
//! insert() append record, rebuild the path root-to-leaf copy-on-write,
//!          rebalance bottom-up, remember the new (uncommitted) root
//! commit() fold heap bitmaps, publish the new root
//! rollback() restore heap bitmaps, truncate the data store to the snapshot
//! ```
//!
//! Within a transaction, a node already copied this transaction is *dirty*
//! and may be rewritten in place; everything else is copied on first touch.
//! Balancing therefore allocates replacement interior nodes and frees the
//! obsolete ones rather than rotating in place.
//!
//! ## Concurrency
//!
//! At most one writer: `begin` holds a mutex for the transaction's lifetime.
//! Readers resolve the committed root from an atomic and take a short read
//! guard on the heap/store per operation; copy-on-write guarantees the nodes
//! they traverse are never mutated underneath them. Dropping a `Txn` without
//! committing rolls it back.

use super::heap::{NodeAddr, NodeHeap};
use super::store::{DataAddr, DataStore};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

/// Heap-resident tree node. The colour rides in the high bits of the child
/// addresses, not in the node itself.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Node {
    pub(crate) left: NodeAddr,
    pub(crate) right: NodeAddr,
    pub(crate) data: DataAddr,
}

impl Node {
    pub(crate) const NULL: Node = Node {
        left: NodeAddr::NULL,
        right: NodeAddr::NULL,
        data: DataAddr::ZERO,
    };
}

struct TreeInner {
    heap: NodeHeap,
    store: DataStore,
}

/// Transactional copy-on-write red-black tree over byte keys.
pub struct Tree {
    inner: RwLock<TreeInner>,
    root: AtomicU64,
    writer: Mutex<()>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Tree {
        Tree {
            inner: RwLock::new(TreeInner {
                heap: NodeHeap::new(),
                store: DataStore::new(),
            }),
            root: AtomicU64::new(NodeAddr::NULL.bits()),
            writer: Mutex::new(()),
        }
    }

    /// Looks up `key` in the committed snapshot.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let root = NodeAddr::from_bits(self.root.load(Ordering::Acquire));
        self.inner.read().get(root, key)
    }

    /// Starts a transaction. Blocks until any active writer finishes.
    pub fn begin(&self) -> Txn<'_> {
        let guard = self.writer.lock();
        let inner = self.inner.read();
        Txn {
            tree: self,
            _writer: guard,
            root: NodeAddr::from_bits(self.root.load(Ordering::Acquire)),
            tail: inner.store.tail(),
            finished: false,
        }
    }
}

impl TreeInner {
    fn get(&self, root: NodeAddr, key: &[u8]) -> Option<Vec<u8>> {
        let mut curr = root;
        while !curr.is_null() {
            let node = *self.heap.node(curr);
            match key.cmp(self.store.key(node.data)) {
                std::cmp::Ordering::Less => curr = node.left,
                std::cmp::Ordering::Greater => curr = node.right,
                std::cmp::Ordering::Equal => return Some(self.store.value(node.data).to_vec()),
            }
        }
        None
    }

    /// Post-order copy-on-write insert: rebuilds the path bottom-up and
    /// returns the replacement subtree root. `true` when a new key was added
    /// (the only case that can unbalance the subtree).
    fn insert(&mut self, addr: NodeAddr, key: &[u8], data: DataAddr) -> (NodeAddr, bool) {
        if !addr.is_null() {
            let node = *self.heap.node(addr);
            let cmp = key.cmp(self.store.key(node.data));
            let new_addr = self.heap.node_for_update(addr);
            return match cmp {
                std::cmp::Ordering::Less => {
                    let (new_left, is_new) = self.insert(node.left, key, data);
                    self.heap.node_mut(new_addr).left = new_left;
                    if is_new {
                        (self.balance(new_addr), is_new)
                    } else {
                        (new_addr, is_new)
                    }
                }
                std::cmp::Ordering::Greater => {
                    let (new_right, is_new) = self.insert(node.right, key, data);
                    self.heap.node_mut(new_addr).right = new_right;
                    if is_new {
                        (self.balance(new_addr), is_new)
                    } else {
                        (new_addr, is_new)
                    }
                }
                std::cmp::Ordering::Equal => {
                    self.heap.node_mut(new_addr).data = data;
                    (new_addr, false)
                }
            };
        }

        let mut new_addr = self.heap.alloc_node();
        *self.heap.node_mut(new_addr) = Node {
            left: NodeAddr::NULL,
            right: NodeAddr::NULL,
            data,
        };
        new_addr.set_red(true);
        (new_addr, true)
    }

    /// Rewrites the red-red grandchild configurations (LL, LR, RL, RR) into
    /// a red parent with two black children. No-op on red nodes; the caller
    /// blackens the root.
    fn balance(&mut self, addr: NodeAddr) -> NodeAddr {
        if addr.is_red() {
            return addr;
        }
        let node = *self.heap.node(addr);

        if !node.left.is_null() && node.left.is_red() {
            let left = *self.heap.node(node.left);

            if !left.left.is_null() && left.left.is_red() {
                let mut n_addr = self.heap.node_for_update(addr);

                let mut new_right_addr = self.heap.alloc_node();
                *self.heap.node_mut(new_right_addr) = Node {
                    left: left.right,
                    right: node.right,
                    data: node.data,
                };
                new_right_addr.set_red(false);

                let mut new_left_addr = self.heap.node_for_update(left.left);
                new_left_addr.set_red(false);
                self.heap.free_node(node.left);

                *self.heap.node_mut(n_addr) = Node {
                    left: new_left_addr,
                    right: new_right_addr,
                    data: left.data,
                };
                n_addr.set_red(true);
                return n_addr;
            }

            if !left.right.is_null() && left.right.is_red() {
                let mut n_addr = self.heap.node_for_update(addr);
                let left_right = *self.heap.node(left.right);

                let mut new_right_addr = self.heap.alloc_node();
                *self.heap.node_mut(new_right_addr) = Node {
                    left: left_right.right,
                    right: node.right,
                    data: node.data,
                };
                new_right_addr.set_red(false);

                let left_right_addr = left.right;
                let mut new_left_addr = self.heap.node_for_update(node.left);
                self.heap.node_mut(new_left_addr).right = left_right.left;
                new_left_addr.set_red(false);
                self.heap.free_node(left_right_addr);

                *self.heap.node_mut(n_addr) = Node {
                    left: new_left_addr,
                    right: new_right_addr,
                    data: left_right.data,
                };
                n_addr.set_red(true);
                return n_addr;
            }
        }

        if !node.right.is_null() && node.right.is_red() {
            let right = *self.heap.node(node.right);

            if !right.left.is_null() && right.left.is_red() {
                let mut n_addr = self.heap.node_for_update(addr);
                let right_left = *self.heap.node(right.left);

                let mut new_left_addr = self.heap.alloc_node();
                *self.heap.node_mut(new_left_addr) = Node {
                    left: node.left,
                    right: right_left.left,
                    data: node.data,
                };
                new_left_addr.set_red(false);

                let right_left_addr = right.left;
                let mut new_right_addr = self.heap.node_for_update(node.right);
                self.heap.node_mut(new_right_addr).left = right_left.right;
                new_right_addr.set_red(false);
                self.heap.free_node(right_left_addr);

                *self.heap.node_mut(n_addr) = Node {
                    left: new_left_addr,
                    right: new_right_addr,
                    data: right_left.data,
                };
                n_addr.set_red(true);
                return n_addr;
            }

            if !right.right.is_null() && right.right.is_red() {
                let mut n_addr = self.heap.node_for_update(addr);

                let mut new_left_addr = self.heap.alloc_node();
                *self.heap.node_mut(new_left_addr) = Node {
                    left: node.left,
                    right: right.left,
                    data: node.data,
                };
                new_left_addr.set_red(false);

                let mut new_right_addr = self.heap.node_for_update(right.right);
                new_right_addr.set_red(false);
                self.heap.free_node(node.right);

                *self.heap.node_mut(n_addr) = Node {
                    left: new_left_addr,
                    right: new_right_addr,
                    data: right.data,
                };
                n_addr.set_red(true);
                return n_addr;
            }
        }

        addr
    }
}

/// Handle to an in-flight transaction. Commit and rollback consume the
/// handle; dropping it uncommitted rolls back.
pub struct Txn<'t> {
    tree: &'t Tree,
    _writer: MutexGuard<'t, ()>,
    root: NodeAddr,
    tail: DataAddr,
    finished: bool,
}

impl Txn<'_> {
    /// Inserts or replaces `key`. Visible to `Txn::get` immediately, to
    /// `Tree::get` only after commit.
    ///
    /// # Panics
    ///
    /// Panics when `key.len() + val.len()` exceeds
    /// [`DataStore::max_record_size`].
    pub fn insert(&mut self, key: &[u8], val: &[u8]) {
        assert!(
            key.len() + val.len() <= DataStore::max_record_size(),
            "record of {} bytes exceeds chunk capacity",
            key.len() + val.len(),
        );

        let mut inner = self.tree.inner.write();
        let data = inner.store.append(key, val);
        let (mut new_root, _) = inner.insert(self.root, key, data);
        new_root.set_red(false);
        self.root = new_root;
    }

    /// Looks up `key` in this transaction's view: uncommitted inserts first,
    /// then the snapshot taken at `begin`.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.tree.inner.read().get(self.root, key)
    }

    pub fn commit(mut self) {
        let mut inner = self.tree.inner.write();
        inner.heap.commit();
        self.tree.root.store(self.root.bits(), Ordering::Release);
        self.finished = true;
    }

    pub fn rollback(mut self) {
        self.rollback_inner();
    }

    fn rollback_inner(&mut self) {
        let mut inner = self.tree.inner.write();
        inner.heap.rollback();
        inner.store.truncate(self.tail);
        self.finished = true;
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback_inner();
        }
    }
}
