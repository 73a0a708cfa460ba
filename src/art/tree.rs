//! # Descent State Machines
//!
//! Search, insert, and remove over the node layer, each written as a single
//! descent that either finishes or reports a conflict; the facade in
//! `mod.rs` restarts conflicted descents from the root.
//!
//! ## Lock Coupling
//!
//! Descent holds two read-versions: the current node's and its parent's.
//! Each step revalidates the parent before trusting anything derived from
//! the current node. Mutations upgrade the current node (and, for
//! structural changes — prefix splits, grow, shrink — also the parent) to a
//! write lock via compare-and-swap on the saved read-version; a lost race
//! surfaces as a failed upgrade and the operation restarts.
//!
//! Nodes replaced by a grown or shrunken copy unlock with the obsolete
//! marker and are pushed on the tree's retired list; see `mod.rs` for the
//! reclamation story.

use super::node::{Leaf, NodeHeader, NodeRef, MAX_PREFIX_LEN};
use super::Art;
use std::sync::atomic::{AtomicPtr, Ordering};

impl Art {
    /// One lock-free search descent. `None` restarts; `Some(result)` is the
    /// answer.
    pub(crate) fn search_once<'t>(&'t self, key: &[u8]) -> Option<Option<&'t [u8]>> {
        let key_len = key.len() as u32;
        let mut parent: &NodeHeader = &self.dummy;
        let mut parent_version = parent.wait_unlock();
        let mut curr = NodeRef::from_raw(self.root.load(Ordering::Acquire));
        let mut depth = 0u32;

        loop {
            let hdr = unsafe { curr.header::<'t>() };
            let version = hdr.read_lock()?;
            if !parent.read_unlock(parent_version) {
                return None;
            }

            depth = match hdr.check_prefix(key, depth) {
                Some(d) => d,
                None => return hdr.read_unlock(version).then_some(None),
            };

            let next = if depth == key_len {
                NodeRef::from_leaf(hdr.prefix_leaf())
            } else if depth < key_len {
                unsafe { curr.find_child(key[depth as usize]).0 }
            } else {
                NodeRef::null()
            };

            if !hdr.check(version) {
                return None;
            }

            if next.is_null() {
                return Some(None);
            }

            if unsafe { next.is_leaf() } {
                let leaf = unsafe { next.leaf::<'t>() };
                return Some(leaf.matches(key).then(|| leaf.value()));
            }

            depth += 1;
            parent = hdr;
            parent_version = version;
            curr = next;
        }
    }

    /// One insert descent; `false` restarts.
    pub(crate) fn insert_once(&self, key: &[u8], value: &[u8]) -> bool {
        let key_len = key.len() as u32;
        let mut parent: &NodeHeader = &self.dummy;
        let mut parent_version = parent.wait_unlock();
        let mut node_loc: &AtomicPtr<u8> = &self.root;
        let mut curr = NodeRef::from_raw(self.root.load(Ordering::Acquire));
        let mut depth = 0u32;

        loop {
            let hdr = unsafe { curr.header::<'_>() };
            let version = match hdr.read_lock() {
                Some(v) => v,
                None => return false,
            };

            let (mismatch, full_key) =
                match self.prefix_mismatch(curr, key, depth, parent, version, parent_version) {
                    Some(m) => m,
                    None => return false,
                };

            // Split this node: the key diverges inside its compressed prefix.
            if mismatch != hdr.prefix_len() {
                if !parent.upgrade_to_write(parent_version) {
                    return false;
                }
                if !hdr.upgrade_to_write_or_release(version, parent) {
                    return false;
                }

                unsafe {
                    curr.insert_split_prefix(key, full_key, value, depth, mismatch, node_loc);
                }

                hdr.write_unlock();
                parent.write_unlock();
                return true;
            }
            depth += hdr.prefix_len();

            if depth == key_len {
                if !hdr.upgrade_to_write(version) {
                    return false;
                }
                if !parent.read_unlock_or_release(parent_version, hdr) {
                    return false;
                }

                let old = hdr.swap_prefix_leaf(Leaf::alloc(key, value));

                hdr.write_unlock();
                if !old.is_null() {
                    self.retire(NodeRef::from_leaf(old));
                }
                return true;
            }

            let (next, next_loc, _) = unsafe { curr.find_child(key[depth as usize]) };
            if !hdr.check(version) {
                return false;
            }

            // No child on this byte: insert directly, growing if needed.
            if next.is_null() {
                if hdr.is_full() {
                    if !parent.upgrade_to_write(parent_version) {
                        return false;
                    }
                    if !hdr.upgrade_to_write_or_release(version, parent) {
                        return false;
                    }

                    let leaf = NodeRef::from_leaf(Leaf::alloc(key, value));
                    unsafe { curr.grow_and_insert(key[depth as usize], leaf, node_loc) };

                    hdr.write_unlock_obsolete();
                    parent.write_unlock();
                    self.retire(curr);
                } else {
                    if !hdr.upgrade_to_write(version) {
                        return false;
                    }
                    if !parent.read_unlock_or_release(parent_version, hdr) {
                        return false;
                    }

                    let leaf = NodeRef::from_leaf(Leaf::alloc(key, value));
                    unsafe { curr.insert_child(key[depth as usize], leaf) };

                    hdr.write_unlock();
                }
                return true;
            }

            if !parent.read_unlock(parent_version) {
                return false;
            }

            if unsafe { next.is_leaf() } {
                if !hdr.upgrade_to_write(version) {
                    return false;
                }

                let slot = next_loc.unwrap_or_else(|| unreachable!("child without slot"));
                let retired = unsafe { next.update_or_expand(key, value, depth + 1, slot) };

                hdr.write_unlock();
                if let Some(old) = retired {
                    self.retire(old);
                }
                return true;
            }

            depth += 1;
            parent = hdr;
            parent_version = version;
            node_loc = next_loc.unwrap_or_else(|| unreachable!("child without slot"));
            curr = next;
        }
    }

    /// One remove descent; `false` restarts. A validated read that finds no
    /// matching key completes the delete.
    pub(crate) fn remove_once(&self, key: &[u8]) -> bool {
        let key_len = key.len() as u32;
        let mut parent: &NodeHeader = &self.dummy;
        let mut parent_version = parent.wait_unlock();
        let mut node_loc: &AtomicPtr<u8> = &self.root;
        let mut curr = NodeRef::from_raw(self.root.load(Ordering::Acquire));
        let mut depth = 0u32;

        loop {
            let hdr = unsafe { curr.header::<'_>() };
            let version = match hdr.read_lock() {
                Some(v) => v,
                None => return false,
            };
            if !parent.read_unlock(parent_version) {
                return false;
            }

            depth = match hdr.check_prefix(key, depth) {
                Some(d) => d,
                None => return hdr.read_unlock(version),
            };

            // Remove the prefix leaf, possibly compressing a one-way node.
            if depth == key_len {
                let prefix_leaf = hdr.prefix_leaf();
                if !hdr.check(version) {
                    return false;
                }
                if prefix_leaf.is_null() || !unsafe { (*prefix_leaf).matches(key) } {
                    return hdr.read_unlock(version);
                }

                if hdr.should_compress(parent.tag()) {
                    if !parent.upgrade_to_write(parent_version) {
                        return false;
                    }
                    if !hdr.upgrade_to_write_or_release(version, parent) {
                        return false;
                    }

                    let ok = unsafe { curr.compress_child(0, node_loc) };

                    if ok {
                        hdr.write_unlock_obsolete();
                    } else {
                        hdr.write_unlock();
                    }
                    parent.write_unlock();
                    if ok {
                        self.retire(curr);
                        self.retire(NodeRef::from_leaf(prefix_leaf));
                    }
                    return ok;
                }

                if !hdr.upgrade_to_write(version) {
                    return false;
                }
                let old = hdr.swap_prefix_leaf(std::ptr::null_mut());
                hdr.write_unlock();
                if !old.is_null() {
                    self.retire(NodeRef::from_leaf(old));
                }
                return true;
            }

            if depth > key_len {
                return hdr.read_unlock(version);
            }

            let (next, next_loc, pos) = unsafe { curr.find_child(key[depth as usize]) };
            if !hdr.check(version) {
                return false;
            }

            if next.is_null() {
                return true;
            }

            if unsafe { next.is_leaf() } {
                if !unsafe { next.leaf::<'_>() }.matches(key) {
                    return hdr.read_unlock(version);
                }

                if hdr.should_shrink(parent.tag()) {
                    if !parent.upgrade_to_write(parent_version) {
                        return false;
                    }
                    if !hdr.upgrade_to_write_or_release(version, parent) {
                        return false;
                    }

                    let ok = unsafe { curr.remove_child_and_shrink(key[depth as usize], node_loc) };

                    if ok {
                        hdr.write_unlock_obsolete();
                    } else {
                        hdr.write_unlock();
                    }
                    parent.write_unlock();
                    if ok {
                        self.retire(curr);
                        self.retire(next);
                    }
                    return ok;
                }

                if !hdr.upgrade_to_write(version) {
                    return false;
                }
                unsafe { curr.remove_child(pos) };
                hdr.write_unlock();
                self.retire(next);
                return true;
            }

            depth += 1;
            parent = hdr;
            parent_version = version;
            node_loc = next_loc.unwrap_or_else(|| unreachable!("child without slot"));
            curr = next;
        }
    }

    /// Length of the match between `key` and this node's prefix, and the
    /// full key loaded from a descendant leaf when the prefix overflows the
    /// inline word. `None` restarts.
    fn prefix_mismatch<'t>(
        &'t self,
        node: NodeRef,
        key: &[u8],
        depth: u32,
        parent: &NodeHeader,
        version: u64,
        parent_version: u64,
    ) -> Option<(u32, Option<&'t [u8]>)> {
        let hdr = unsafe { node.header::<'t>() };
        let prefix_len = hdr.prefix_len();

        if prefix_len <= MAX_PREFIX_LEN {
            let limit = (key.len() as u32 - depth).min(prefix_len);
            let mut idx = 0;
            while idx < limit {
                if hdr.prefix_byte(idx) != key[(depth + idx) as usize] {
                    break;
                }
                idx += 1;
            }
            return Some((idx, None));
        }

        // The inline word holds only the first 8 bytes; fetch a descendant
        // leaf's key for the rest, revalidating until a clean copy lands.
        let mut full_key: Option<&[u8]> = None;
        loop {
            if !hdr.check(version) || !parent.check(parent_version) {
                return None;
            }
            if let Some(fk) = full_key {
                let limit = (key.len() as u32).min(depth + prefix_len);
                let mut i = depth;
                while i < limit {
                    if key[i as usize] != fk[i as usize] {
                        break;
                    }
                    i += 1;
                }
                return Some((i - depth, Some(fk)));
            }
            full_key = self.full_key(node, version);
        }
    }

    /// Key of some leaf below `node`, read under lock coupling. `None` when
    /// a version check failed mid-walk.
    fn full_key<'t>(&'t self, node: NodeRef, version: u64) -> Option<&'t [u8]> {
        let mut curr = node;
        let mut version = version;
        loop {
            let hdr = unsafe { curr.header::<'t>() };
            let prefix_leaf = hdr.prefix_leaf();
            if !prefix_leaf.is_null() {
                let leaf = unsafe { &*prefix_leaf };
                if !hdr.read_unlock(version) {
                    return None;
                }
                return Some(leaf.key());
            }

            let next = unsafe { curr.first_child() };
            if !hdr.check(version) {
                return None;
            }
            if next.is_null() {
                return None;
            }

            if unsafe { next.is_leaf() } {
                let leaf = unsafe { next.leaf::<'t>() };
                if !hdr.read_unlock(version) {
                    return None;
                }
                return Some(leaf.key());
            }

            let next_version = unsafe { next.header::<'t>() }.read_lock()?;
            curr = next;
            version = next_version;
        }
    }
}
