//! # Adaptive Node Variants
//!
//! The tree's nodes are a tagged family sharing a common header:
//!
//! ```text
//! Tag      Payload
//! -------  ------------------------------------------------------------
//! Node4    4 key bytes + 4 child pointers, parallel arrays
//! Node16   16 key bytes + 16 child pointers
//! Node48   256-entry byte→slot index (0 = empty, else slot+1) + 48 slots
//! Node256  direct 256-entry child table
//! Leaf     owned key and value byte slices
//! Dummy    sentinel parent of the root, header only
//! ```
//!
//! The tag is the first byte of every variant (`repr(C)`, header first), so
//! descent reads the tag through an untyped pointer before choosing a view.
//! Leaves share only that first byte with interior nodes.
//!
//! ## Field Atomicity
//!
//! Readers run lock-free and validate afterwards, so every header and slot
//! field a reader may race on is an atomic. Payload fields (key arrays,
//! counts, prefix word) use `Relaxed` ordering — the version protocol in
//! `lock.rs` supplies the happens-before edges, and validation discards any
//! torn combination of values. Child and prefix-leaf *pointers* use
//! `Release` stores and `Acquire` loads so a published node's initialization
//! is visible before the pointer is dereferenced.
//!
//! ## Prefix Word
//!
//! The compressed prefix holds up to 8 bytes packed little-endian into one
//! `u64` with the unused tail zeroed, so a prefix check is a single 64-bit
//! compare. `prefix_len` may exceed 8; the overflow bytes are reconstructed
//! from a descendant leaf when they matter.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering};

pub(crate) const MAX_PREFIX_LEN: u32 = 8;

pub(crate) const NODE16_MIN_SIZE: u8 = 4;
pub(crate) const NODE48_MIN_SIZE: u8 = 13;
pub(crate) const NODE256_MIN_SIZE: u8 = 38;

const NODE48_EMPTY_SLOTS: u64 = 0xffff_0000_0000_0000;
const NODE48_GROW_SLOTS: u64 = 0xffff_ffff_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum NodeTag {
    Node4 = 1,
    Node16 = 2,
    Node48 = 3,
    Node256 = 4,
    Leaf = 5,
    Dummy = 6,
}

impl NodeTag {
    fn from_byte(b: u8) -> NodeTag {
        match b {
            1 => NodeTag::Node4,
            2 => NodeTag::Node16,
            3 => NodeTag::Node48,
            4 => NodeTag::Node256,
            5 => NodeTag::Leaf,
            6 => NodeTag::Dummy,
            _ => unreachable!("corrupt node tag {b}"),
        }
    }
}

/// Common header of every interior node (and the dummy sentinel). The tag
/// byte must stay first so leaves and interior nodes are distinguishable
/// through an untyped pointer.
#[repr(C)]
pub(crate) struct NodeHeader {
    tag: u8,
    num_children: AtomicU8,
    prefix_len: AtomicU32,
    pub(crate) version: AtomicU64,
    prefix_leaf: AtomicPtr<Leaf>,
    prefix: AtomicU64,
}

impl NodeHeader {
    fn new(tag: NodeTag) -> NodeHeader {
        NodeHeader {
            tag: tag as u8,
            num_children: AtomicU8::new(0),
            prefix_len: AtomicU32::new(0),
            version: AtomicU64::new(0),
            prefix_leaf: AtomicPtr::new(ptr::null_mut()),
            prefix: AtomicU64::new(0),
        }
    }

    pub(crate) fn dummy() -> NodeHeader {
        NodeHeader::new(NodeTag::Dummy)
    }

    pub(crate) fn tag(&self) -> NodeTag {
        NodeTag::from_byte(self.tag)
    }

    pub(crate) fn num_children(&self) -> u8 {
        self.num_children.load(Ordering::Relaxed)
    }

    fn set_num_children(&self, n: u8) {
        self.num_children.store(n, Ordering::Relaxed);
    }

    pub(crate) fn prefix_len(&self) -> u32 {
        self.prefix_len.load(Ordering::Relaxed)
    }

    pub(crate) fn set_prefix(&self, word: u64, len: u32) {
        self.prefix.store(word, Ordering::Relaxed);
        self.prefix_len.store(len, Ordering::Relaxed);
    }

    pub(crate) fn prefix_word(&self) -> u64 {
        self.prefix.load(Ordering::Relaxed)
    }

    pub(crate) fn prefix_byte(&self, idx: u32) -> u8 {
        (self.prefix_word() >> (8 * idx)) as u8
    }

    pub(crate) fn prefix_leaf(&self) -> *mut Leaf {
        self.prefix_leaf.load(Ordering::Acquire)
    }

    /// Replaces the prefix leaf, returning the previous one.
    pub(crate) fn swap_prefix_leaf(&self, leaf: *mut Leaf) -> *mut Leaf {
        self.prefix_leaf.swap(leaf, Ordering::AcqRel)
    }

    /// Consumes the compressed prefix at `depth`: the new depth on a match
    /// of the inline prefix word, `None` on mismatch or key exhaustion.
    /// Compares at most 8 bytes; overflow bytes are rechecked at the leaf.
    pub(crate) fn check_prefix(&self, key: &[u8], depth: u32) -> Option<u32> {
        let prefix_len = self.prefix_len();
        if prefix_len == 0 {
            return Some(depth);
        }
        let next = depth + prefix_len;
        if (key.len() as u32) < next {
            return None;
        }

        let n = prefix_len.min(MAX_PREFIX_LEN) as usize;
        let mut buf = [0u8; 8];
        buf[..n].copy_from_slice(&key[depth as usize..depth as usize + n]);
        if u64::from_le_bytes(buf) == self.prefix_word() {
            Some(next)
        } else {
            None
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        match self.tag() {
            NodeTag::Node4 => self.num_children() == 4,
            NodeTag::Node16 => self.num_children() == 16,
            NodeTag::Node48 => self.num_children() == 48,
            NodeTag::Node256 => false,
            _ => unreachable!("leaf nodes hold no children"),
        }
    }

    pub(crate) fn should_shrink(&self, parent_tag: NodeTag) -> bool {
        match self.tag() {
            NodeTag::Node4 => {
                if parent_tag == NodeTag::Dummy {
                    return false;
                }
                if self.prefix_leaf().is_null() {
                    self.num_children() <= 2
                } else {
                    self.num_children() <= 1
                }
            }
            NodeTag::Node16 => self.num_children() <= NODE16_MIN_SIZE,
            NodeTag::Node48 => self.num_children() <= NODE48_MIN_SIZE,
            // num_children wraps at 256, and a Node256 never has zero
            // children, so 0 reads as 256.
            NodeTag::Node256 => {
                let n = self.num_children();
                n > 0 && n <= NODE256_MIN_SIZE
            }
            _ => unreachable!("leaf nodes never shrink"),
        }
    }

    pub(crate) fn should_compress(&self, parent_tag: NodeTag) -> bool {
        self.tag() == NodeTag::Node4 && self.num_children() == 1 && parent_tag != NodeTag::Dummy
    }
}

/// Packs up to 8 bytes little-endian with a zeroed tail.
pub(crate) fn make_prefix_word(bytes: &[u8]) -> u64 {
    let n = bytes.len().min(MAX_PREFIX_LEN as usize);
    let mut buf = [0u8; 8];
    buf[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(buf)
}

/// Terminal node: an owned key/value pair. Shares only the leading tag byte
/// with [`NodeHeader`].
#[repr(C)]
pub(crate) struct Leaf {
    tag: u8,
    key: Box<[u8]>,
    value: Box<[u8]>,
}

impl Leaf {
    pub(crate) fn alloc(key: &[u8], value: &[u8]) -> *mut Leaf {
        Box::into_raw(Box::new(Leaf {
            tag: NodeTag::Leaf as u8,
            key: key.into(),
            value: value.into(),
        }))
    }

    pub(crate) fn key(&self) -> &[u8] {
        &self.key
    }

    pub(crate) fn value(&self) -> &[u8] {
        &self.value
    }

    pub(crate) fn matches(&self, key: &[u8]) -> bool {
        *self.key == *key
    }
}

#[repr(C)]
pub(crate) struct Node4 {
    hdr: NodeHeader,
    keys: [AtomicU8; 4],
    children: [AtomicPtr<u8>; 4],
}

#[repr(C)]
pub(crate) struct Node16 {
    hdr: NodeHeader,
    keys: [AtomicU8; 16],
    children: [AtomicPtr<u8>; 16],
}

#[repr(C)]
pub(crate) struct Node48 {
    hdr: NodeHeader,
    index: [AtomicU8; 256],
    children: [AtomicPtr<u8>; 48],
    slots: AtomicU64,
}

#[repr(C)]
pub(crate) struct Node256 {
    hdr: NodeHeader,
    children: [AtomicPtr<u8>; 256],
}

fn null_children<const N: usize>() -> [AtomicPtr<u8>; N] {
    std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut()))
}

fn zero_keys<const N: usize>() -> [AtomicU8; N] {
    std::array::from_fn(|_| AtomicU8::new(0))
}

impl Node48 {
    /// Claims the lowest free slot. Bit `47 - i` of the bitmap marks slot
    /// `i` allocated; the top 16 bits are a permanent sentinel.
    fn alloc_slot(&self) -> usize {
        let slots = self.slots.load(Ordering::Relaxed);
        let idx = ((!slots).leading_zeros() - 16) as usize;
        self.slots
            .store(slots | 1 << (47 - idx), Ordering::Relaxed);
        idx
    }

    fn free_slot(&self, idx: usize) {
        let slots = self.slots.load(Ordering::Relaxed);
        self.slots
            .store(slots & !(1 << (47 - idx)), Ordering::Relaxed);
    }
}

/// Untyped node handle; the pointee's first byte is its tag. All accessor
/// methods are unsafe sugar over that contract: the caller asserts the
/// handle came from this tree and the tree is still alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeRef {
    ptr: *mut u8,
}

impl NodeRef {
    pub(crate) fn null() -> NodeRef {
        NodeRef {
            ptr: ptr::null_mut(),
        }
    }

    pub(crate) fn from_raw(ptr: *mut u8) -> NodeRef {
        NodeRef { ptr }
    }

    pub(crate) fn from_leaf(leaf: *mut Leaf) -> NodeRef {
        NodeRef {
            ptr: leaf as *mut u8,
        }
    }

    pub(crate) fn raw(self) -> *mut u8 {
        self.ptr
    }

    pub(crate) fn is_null(self) -> bool {
        self.ptr.is_null()
    }

    pub(crate) unsafe fn tag(self) -> NodeTag {
        NodeTag::from_byte(*self.ptr)
    }

    pub(crate) unsafe fn is_leaf(self) -> bool {
        self.tag() == NodeTag::Leaf
    }

    pub(crate) unsafe fn header<'a>(self) -> &'a NodeHeader {
        &*(self.ptr as *const NodeHeader)
    }

    pub(crate) unsafe fn leaf<'a>(self) -> &'a Leaf {
        &*(self.ptr as *const Leaf)
    }

    pub(crate) fn alloc_node4() -> NodeRef {
        NodeRef {
            ptr: Box::into_raw(Box::new(Node4 {
                hdr: NodeHeader::new(NodeTag::Node4),
                keys: zero_keys(),
                children: null_children(),
            })) as *mut u8,
        }
    }

    fn alloc_node16() -> NodeRef {
        NodeRef {
            ptr: Box::into_raw(Box::new(Node16 {
                hdr: NodeHeader::new(NodeTag::Node16),
                keys: zero_keys(),
                children: null_children(),
            })) as *mut u8,
        }
    }

    fn alloc_node48() -> NodeRef {
        let node = Box::new(Node48 {
            hdr: NodeHeader::new(NodeTag::Node48),
            index: zero_keys(),
            children: null_children(),
            slots: AtomicU64::new(NODE48_EMPTY_SLOTS),
        });
        NodeRef {
            ptr: Box::into_raw(node) as *mut u8,
        }
    }

    fn alloc_node256() -> NodeRef {
        NodeRef {
            ptr: Box::into_raw(Box::new(Node256 {
                hdr: NodeHeader::new(NodeTag::Node256),
                children: null_children(),
            })) as *mut u8,
        }
    }

    unsafe fn n4<'a>(self) -> &'a Node4 {
        &*(self.ptr as *const Node4)
    }

    unsafe fn n16<'a>(self) -> &'a Node16 {
        &*(self.ptr as *const Node16)
    }

    unsafe fn n48<'a>(self) -> &'a Node48 {
        &*(self.ptr as *const Node48)
    }

    unsafe fn n256<'a>(self) -> &'a Node256 {
        &*(self.ptr as *const Node256)
    }

    /// Looks up the child for `byte`: the child handle, the slot holding it
    /// (for relinking), and the removal position.
    pub(crate) unsafe fn find_child<'a>(
        self,
        byte: u8,
    ) -> (NodeRef, Option<&'a AtomicPtr<u8>>, usize) {
        match self.tag() {
            NodeTag::Node4 => {
                let n = self.n4::<'a>();
                let count = n.hdr.num_children() as usize;
                for i in 0..count.min(4) {
                    if n.keys[i].load(Ordering::Relaxed) == byte {
                        let slot = &n.children[i];
                        return (NodeRef::from_raw(slot.load(Ordering::Acquire)), Some(slot), i);
                    }
                }
            }
            NodeTag::Node16 => {
                let n = self.n16::<'a>();
                let count = n.hdr.num_children() as usize;
                for i in 0..count.min(16) {
                    if n.keys[i].load(Ordering::Relaxed) == byte {
                        let slot = &n.children[i];
                        return (NodeRef::from_raw(slot.load(Ordering::Acquire)), Some(slot), i);
                    }
                }
            }
            NodeTag::Node48 => {
                let n = self.n48::<'a>();
                let idx = n.index[byte as usize].load(Ordering::Relaxed);
                if idx > 0 {
                    let slot = &n.children[idx as usize - 1];
                    return (
                        NodeRef::from_raw(slot.load(Ordering::Acquire)),
                        Some(slot),
                        byte as usize,
                    );
                }
            }
            NodeTag::Node256 => {
                let n = self.n256::<'a>();
                let slot = &n.children[byte as usize];
                return (
                    NodeRef::from_raw(slot.load(Ordering::Acquire)),
                    Some(slot),
                    byte as usize,
                );
            }
            _ => {}
        }

        (NodeRef::null(), None, 0)
    }

    /// First child in slot order; used only to reach some descendant leaf.
    pub(crate) unsafe fn first_child(self) -> NodeRef {
        match self.tag() {
            NodeTag::Node4 => NodeRef::from_raw(self.n4().children[0].load(Ordering::Acquire)),
            NodeTag::Node16 => NodeRef::from_raw(self.n16().children[0].load(Ordering::Acquire)),
            NodeTag::Node48 => {
                let n = self.n48();
                for i in 0..256 {
                    let idx = n.index[i].load(Ordering::Relaxed);
                    if idx > 0 {
                        return NodeRef::from_raw(
                            n.children[idx as usize - 1].load(Ordering::Acquire),
                        );
                    }
                }
                NodeRef::null()
            }
            NodeTag::Node256 => {
                let n = self.n256();
                for child in &n.children {
                    let ptr = child.load(Ordering::Acquire);
                    if !ptr.is_null() {
                        return NodeRef::from_raw(ptr);
                    }
                }
                NodeRef::null()
            }
            _ => NodeRef::null(),
        }
    }

    /// Inserts a child into a node with spare capacity. Caller holds the
    /// node's write lock.
    pub(crate) unsafe fn insert_child(self, byte: u8, child: NodeRef) {
        match self.tag() {
            NodeTag::Node4 => {
                let n = self.n4();
                let i = n.hdr.num_children() as usize;
                n.keys[i].store(byte, Ordering::Relaxed);
                n.children[i].store(child.raw(), Ordering::Release);
                n.hdr.set_num_children(i as u8 + 1);
            }
            NodeTag::Node16 => {
                let n = self.n16();
                let i = n.hdr.num_children() as usize;
                n.keys[i].store(byte, Ordering::Relaxed);
                n.children[i].store(child.raw(), Ordering::Release);
                n.hdr.set_num_children(i as u8 + 1);
            }
            NodeTag::Node48 => {
                let n = self.n48();
                let pos = n.alloc_slot();
                n.children[pos].store(child.raw(), Ordering::Release);
                n.index[byte as usize].store(pos as u8 + 1, Ordering::Relaxed);
                n.hdr.set_num_children(n.hdr.num_children() + 1);
            }
            NodeTag::Node256 => {
                let n = self.n256();
                n.children[byte as usize].store(child.raw(), Ordering::Release);
                n.hdr
                    .set_num_children(n.hdr.num_children().wrapping_add(1));
            }
            _ => unreachable!("leaf nodes hold no children"),
        }
    }

    /// Removes the child at `pos` (array index for Node4/16, key byte for
    /// Node48/256). Caller holds the write lock.
    pub(crate) unsafe fn remove_child(self, pos: usize) {
        match self.tag() {
            NodeTag::Node4 => {
                let n = self.n4();
                let count = n.hdr.num_children() as usize;
                for i in pos..count - 1 {
                    n.keys[i].store(n.keys[i + 1].load(Ordering::Relaxed), Ordering::Relaxed);
                    n.children[i].store(n.children[i + 1].load(Ordering::Acquire), Ordering::Release);
                }
                n.hdr.set_num_children(count as u8 - 1);
                n.children[count - 1].store(ptr::null_mut(), Ordering::Release);
            }
            NodeTag::Node16 => {
                let n = self.n16();
                let count = n.hdr.num_children() as usize;
                for i in pos..count - 1 {
                    n.keys[i].store(n.keys[i + 1].load(Ordering::Relaxed), Ordering::Relaxed);
                    n.children[i].store(n.children[i + 1].load(Ordering::Acquire), Ordering::Release);
                }
                n.hdr.set_num_children(count as u8 - 1);
                n.children[count - 1].store(ptr::null_mut(), Ordering::Release);
            }
            NodeTag::Node48 => {
                let n = self.n48();
                let slot = n.index[pos].load(Ordering::Relaxed) as usize - 1;
                n.index[pos].store(0, Ordering::Relaxed);
                n.children[slot].store(ptr::null_mut(), Ordering::Release);
                n.free_slot(slot);
                n.hdr.set_num_children(n.hdr.num_children() - 1);
            }
            NodeTag::Node256 => {
                let n = self.n256();
                n.children[pos].store(ptr::null_mut(), Ordering::Release);
                n.hdr
                    .set_num_children(n.hdr.num_children().wrapping_sub(1));
            }
            _ => unreachable!("leaf nodes hold no children"),
        }
    }

    unsafe fn copy_header_from(self, src: &NodeHeader) {
        let dst = self.header::<'_>();
        dst.set_num_children(src.num_children());
        dst.set_prefix(src.prefix_word(), src.prefix_len());
        dst.prefix_leaf.store(src.prefix_leaf(), Ordering::Release);
    }

    /// Materializes the next-larger node type, copies this node's children
    /// and header, inserts the new child, and installs the replacement at
    /// `node_loc`. Caller holds write locks on this node and its parent and
    /// obsoletes this node afterwards.
    pub(crate) unsafe fn grow_and_insert(self, byte: u8, child: NodeRef, node_loc: &AtomicPtr<u8>) {
        match self.tag() {
            NodeTag::Node4 => {
                let n = self.n4();
                let new_node = NodeRef::alloc_node16();
                let n16 = new_node.n16();
                for i in 0..4 {
                    n16.keys[i].store(n.keys[i].load(Ordering::Relaxed), Ordering::Relaxed);
                    n16.children[i].store(n.children[i].load(Ordering::Acquire), Ordering::Release);
                }
                new_node.copy_header_from(&n.hdr);
                new_node.insert_child(byte, child);
                node_loc.store(new_node.raw(), Ordering::Release);
            }
            NodeTag::Node16 => {
                let n = self.n16();
                let new_node = NodeRef::alloc_node48();
                let n48 = new_node.n48();
                for i in 0..16 {
                    n48.children[i].store(n.children[i].load(Ordering::Acquire), Ordering::Release);
                    n48.index[n.keys[i].load(Ordering::Relaxed) as usize]
                        .store(i as u8 + 1, Ordering::Relaxed);
                }
                n48.slots.store(NODE48_GROW_SLOTS, Ordering::Relaxed);
                new_node.copy_header_from(&n.hdr);
                new_node.insert_child(byte, child);
                node_loc.store(new_node.raw(), Ordering::Release);
            }
            NodeTag::Node48 => {
                let n = self.n48();
                let new_node = NodeRef::alloc_node256();
                let n256 = new_node.n256();
                for i in 0..256 {
                    let idx = n.index[i].load(Ordering::Relaxed);
                    if idx > 0 {
                        n256.children[i].store(
                            n.children[idx as usize - 1].load(Ordering::Acquire),
                            Ordering::Release,
                        );
                    }
                }
                new_node.copy_header_from(&n.hdr);
                new_node.insert_child(byte, child);
                node_loc.store(new_node.raw(), Ordering::Release);
            }
            _ => unreachable!("Node256 never grows"),
        }
    }

    /// Removes the child keyed by `byte` and installs the shrunken
    /// replacement at `node_loc`. Returns `false` only when a Node4
    /// compression fails to lock the surviving child; the caller restarts.
    pub(crate) unsafe fn remove_child_and_shrink(
        self,
        byte: u8,
        node_loc: &AtomicPtr<u8>,
    ) -> bool {
        match self.tag() {
            NodeTag::Node4 => {
                let n = self.n4();
                let prefix_leaf = n.hdr.prefix_leaf();
                if !prefix_leaf.is_null() {
                    node_loc.store(prefix_leaf as *mut u8, Ordering::Release);
                    return true;
                }

                if n.hdr.num_children() == 1 {
                    node_loc.store(NodeRef::alloc_node4().raw(), Ordering::Release);
                    return true;
                }

                if n.keys[0].load(Ordering::Relaxed) == byte {
                    self.compress_child(1, node_loc)
                } else {
                    self.compress_child(0, node_loc)
                }
            }
            NodeTag::Node16 => {
                let n = self.n16();
                let new_node = NodeRef::alloc_node4();
                let n4 = new_node.n4();
                let mut idx = 0;
                for i in 0..n.hdr.num_children() as usize {
                    let k = n.keys[i].load(Ordering::Relaxed);
                    if k != byte {
                        n4.keys[idx].store(k, Ordering::Relaxed);
                        n4.children[idx]
                            .store(n.children[i].load(Ordering::Acquire), Ordering::Release);
                        idx += 1;
                    }
                }
                new_node.copy_header_from(&n.hdr);
                n4.hdr.set_num_children(NODE16_MIN_SIZE - 1);
                node_loc.store(new_node.raw(), Ordering::Release);
                true
            }
            NodeTag::Node48 => {
                let n = self.n48();
                let new_node = NodeRef::alloc_node16();
                let n16 = new_node.n16();
                let mut idx = 0;
                for i in 0..256 {
                    let slot = n.index[i].load(Ordering::Relaxed);
                    if i != byte as usize && slot != 0 {
                        n16.keys[idx].store(i as u8, Ordering::Relaxed);
                        n16.children[idx].store(
                            n.children[slot as usize - 1].load(Ordering::Acquire),
                            Ordering::Release,
                        );
                        idx += 1;
                    }
                }
                new_node.copy_header_from(&n.hdr);
                n16.hdr.set_num_children(NODE48_MIN_SIZE - 1);
                node_loc.store(new_node.raw(), Ordering::Release);
                true
            }
            NodeTag::Node256 => {
                let n = self.n256();
                let new_node = NodeRef::alloc_node48();
                let n48 = new_node.n48();
                for i in 0..256 {
                    let child = n.children[i].load(Ordering::Acquire);
                    if i != byte as usize && !child.is_null() {
                        let pos = n48.alloc_slot();
                        n48.index[i].store(pos as u8 + 1, Ordering::Relaxed);
                        n48.children[pos].store(child, Ordering::Release);
                    }
                }
                new_node.copy_header_from(&n.hdr);
                n48.hdr.set_num_children(NODE256_MIN_SIZE - 1);
                node_loc.store(new_node.raw(), Ordering::Release);
                true
            }
            _ => unreachable!("leaf nodes never shrink"),
        }
    }

    /// Replaces this single-way Node4 by its child at `idx`, folding the
    /// edge byte and this node's prefix into the child's prefix. Fails when
    /// the interior child cannot be locked.
    pub(crate) unsafe fn compress_child(self, idx: usize, node_loc: &AtomicPtr<u8>) -> bool {
        let n = self.n4();
        let child = NodeRef::from_raw(n.children[idx].load(Ordering::Acquire));
        if !child.is_leaf() {
            let child_hdr = child.header::<'_>();
            if !child_hdr.write_lock() {
                return false;
            }
            let n_prefix_len = n.hdr.prefix_len();
            let mut merged = [0u8; 8];
            let mut len = n_prefix_len.min(MAX_PREFIX_LEN);
            merged[..len as usize].copy_from_slice(&n.hdr.prefix_word().to_le_bytes()[..len as usize]);
            if len < MAX_PREFIX_LEN {
                merged[len as usize] = n.keys[idx].load(Ordering::Relaxed);
                len += 1;
            }
            if len < MAX_PREFIX_LEN {
                let sub = child_hdr.prefix_len().min(MAX_PREFIX_LEN - len);
                let child_bytes = child_hdr.prefix_word().to_le_bytes();
                merged[len as usize..(len + sub) as usize]
                    .copy_from_slice(&child_bytes[..sub as usize]);
                len += sub;
            }

            let new_len = child_hdr.prefix_len() + n_prefix_len + 1;
            child_hdr.set_prefix(make_prefix_word(&merged[..len.min(MAX_PREFIX_LEN) as usize]), new_len);
            child_hdr.write_unlock();
        }
        node_loc.store(child.raw(), Ordering::Release);
        true
    }

    /// Replaces a leaf whose key matched (returning the retired leaf), or
    /// expands it into a Node4 holding both the old leaf and the new key.
    /// Caller holds the parent's write lock; `node_loc` is the leaf's slot.
    pub(crate) unsafe fn update_or_expand(
        self,
        key: &[u8],
        value: &[u8],
        depth: u32,
        node_loc: &AtomicPtr<u8>,
    ) -> Option<NodeRef> {
        let l = self.leaf::<'_>();
        if l.matches(key) {
            node_loc.store(Leaf::alloc(key, value) as *mut u8, Ordering::Release);
            return Some(self);
        }

        let lkey = l.key();
        let key_len = key.len() as u32;
        let lkey_len = lkey.len() as u32;
        let limit = key_len.min(lkey_len);
        let mut miss_pos = depth;
        while miss_pos < limit && lkey[miss_pos as usize] == key[miss_pos as usize] {
            miss_pos += 1;
        }

        let new_node = NodeRef::alloc_node4();
        let hdr = new_node.header::<'_>();
        hdr.set_prefix(
            make_prefix_word(&key[depth as usize..miss_pos as usize]),
            miss_pos - depth,
        );

        if miss_pos == lkey_len {
            hdr.swap_prefix_leaf(self.ptr as *mut Leaf);
        } else {
            new_node.insert_child(lkey[miss_pos as usize], self);
        }
        if miss_pos == key_len {
            hdr.swap_prefix_leaf(Leaf::alloc(key, value));
        } else {
            new_node.insert_child(
                key[miss_pos as usize],
                NodeRef::from_leaf(Leaf::alloc(key, value)),
            );
        }
        node_loc.store(new_node.raw(), Ordering::Release);
        None
    }

    /// Splits this node's compressed prefix at `mismatch`: a fresh Node4
    /// takes the matching head, this node keeps the tail, and the new key's
    /// leaf hangs off the fresh node. Caller holds write locks on this node
    /// and its parent. `full_key` supplies prefix bytes past the inline 8.
    pub(crate) unsafe fn insert_split_prefix(
        self,
        key: &[u8],
        full_key: Option<&[u8]>,
        value: &[u8],
        depth: u32,
        mismatch: u32,
        node_loc: &AtomicPtr<u8>,
    ) {
        let hdr = self.header::<'_>();
        let new_node = NodeRef::alloc_node4();
        let new_hdr = new_node.header::<'_>();

        let split_depth = depth + mismatch;
        if key.len() as u32 == split_depth {
            new_hdr.swap_prefix_leaf(Leaf::alloc(key, value));
        } else {
            new_node.insert_child(
                key[split_depth as usize],
                NodeRef::from_leaf(Leaf::alloc(key, value)),
            );
        }

        let head_bytes = mismatch.min(MAX_PREFIX_LEN);
        let head_mask = if head_bytes >= MAX_PREFIX_LEN {
            u64::MAX
        } else {
            (1u64 << (8 * head_bytes)) - 1
        };
        new_hdr.set_prefix(hdr.prefix_word() & head_mask, mismatch);

        let old_len = hdr.prefix_len();
        let tail_len = old_len - mismatch - 1;
        let (edge, tail_word) = if old_len <= MAX_PREFIX_LEN {
            let edge = hdr.prefix_byte(mismatch);
            let tail_word = if mismatch + 1 >= MAX_PREFIX_LEN {
                0
            } else {
                hdr.prefix_word() >> (8 * (mismatch + 1))
            };
            (edge, tail_word)
        } else {
            let full_key = full_key.unwrap_or_else(|| unreachable!("long prefix without full key"));
            let edge = full_key[split_depth as usize];
            let off = (split_depth + 1) as usize;
            let take = (tail_len.min(MAX_PREFIX_LEN)) as usize;
            (edge, make_prefix_word(&full_key[off..off + take]))
        };

        new_node.insert_child(edge, self);
        hdr.set_prefix(tail_word, tail_len);

        node_loc.store(new_node.raw(), Ordering::Release);
    }
}

/// Frees a node and everything reachable from it. Only called from `Drop`,
/// with the tree quiesced.
pub(crate) unsafe fn free_subtree(node: NodeRef) {
    if node.is_null() {
        return;
    }
    match node.tag() {
        NodeTag::Leaf => {
            drop(Box::from_raw(node.raw() as *mut Leaf));
        }
        NodeTag::Node4 => {
            let n = Box::from_raw(node.raw() as *mut Node4);
            free_prefix_leaf(&n.hdr);
            for child in &n.children {
                free_subtree(NodeRef::from_raw(child.load(Ordering::Relaxed)));
            }
        }
        NodeTag::Node16 => {
            let n = Box::from_raw(node.raw() as *mut Node16);
            free_prefix_leaf(&n.hdr);
            for child in &n.children {
                free_subtree(NodeRef::from_raw(child.load(Ordering::Relaxed)));
            }
        }
        NodeTag::Node48 => {
            let n = Box::from_raw(node.raw() as *mut Node48);
            free_prefix_leaf(&n.hdr);
            for child in &n.children {
                free_subtree(NodeRef::from_raw(child.load(Ordering::Relaxed)));
            }
        }
        NodeTag::Node256 => {
            let n = Box::from_raw(node.raw() as *mut Node256);
            free_prefix_leaf(&n.hdr);
            for child in &n.children {
                free_subtree(NodeRef::from_raw(child.load(Ordering::Relaxed)));
            }
        }
        NodeTag::Dummy => unreachable!("dummy is never allocated"),
    }
}

unsafe fn free_prefix_leaf(hdr: &NodeHeader) {
    let leaf = hdr.prefix_leaf();
    if !leaf.is_null() {
        drop(Box::from_raw(leaf));
    }
}

/// Frees only this allocation: the leaf itself, or an interior node whose
/// children and prefix leaf live on under its replacement.
pub(crate) unsafe fn free_shallow(node: NodeRef) {
    match node.tag() {
        NodeTag::Leaf => drop(Box::from_raw(node.raw() as *mut Leaf)),
        NodeTag::Node4 => drop(Box::from_raw(node.raw() as *mut Node4)),
        NodeTag::Node16 => drop(Box::from_raw(node.raw() as *mut Node16)),
        NodeTag::Node48 => drop(Box::from_raw(node.raw() as *mut Node48)),
        NodeTag::Node256 => drop(Box::from_raw(node.raw() as *mut Node256)),
        NodeTag::Dummy => unreachable!("dummy is never allocated"),
    }
}
