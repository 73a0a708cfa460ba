//! # LOUDS-Dense Levels
//!
//! Bitmap encoding for the trie levels above the cutoff. Each node owns 256
//! label bits and 256 has-child bits plus one is-prefix bit:
//!
//! ```text
//! labels[node*256 + byte]    byte present in node
//! hasChild[node*256 + byte]  present byte descends to a child
//! isPrefix[node]             a stored key terminates inside this node
//! ```
//!
//! `rank` over the has-child bitmap yields child node ids, so descent is two
//! bitmap probes and one rank per level. When descent leaves the dense
//! levels, queries hand the reached node id to the sparse encoding.
//!
//! The dense iterator tracks a per-level position stack. Its completion
//! flags record whether a search, leftmost, or rightmost walk terminated
//! within the dense levels; when one is false the iterator exports a handoff
//! node id for the sparse iterator to resume from.

use super::builder::{Builder, DENSE_FANOUT};
use super::suffix::SuffixVector;
use super::vectors::{pad_segment, RankVector, ValueVector, RANK_DENSE_BLOCK_SIZE};
use super::SeekCmp;
use eyre::{ensure, eyre, Result};
use smallvec::SmallVec;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Outcome of a dense-level lookup.
pub(crate) enum DenseGet<'s> {
    Found(&'s [u8]),
    Missing,
    /// Key consumed all dense levels; continue at this sparse node id.
    Descend(u32),
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct DenseHeader {
    height: U32,
}

#[derive(Debug, Default)]
pub(crate) struct LoudsDense {
    height: u32,
    label_vec: RankVector,
    has_child_vec: RankVector,
    is_prefix_vec: RankVector,
    suffixes: SuffixVector,
    pub(crate) values: ValueVector,
}

impl LoudsDense {
    pub(crate) fn from_builder(builder: &Builder) -> LoudsDense {
        let height = builder.sparse_start_level;
        let hu = height as usize;

        let label_parts: Vec<(&[u64], u32)> = builder.dense_levels[..hu]
            .iter()
            .map(|dl| (dl.labels.as_slice(), dl.labels.len() as u32 * 64))
            .collect();
        let has_child_parts: Vec<(&[u64], u32)> = builder.dense_levels[..hu]
            .iter()
            .map(|dl| (dl.has_child.as_slice(), dl.has_child.len() as u32 * 64))
            .collect();
        let is_prefix_parts: Vec<(&[u64], u32)> = builder.dense_levels[..hu]
            .iter()
            .zip(&builder.levels[..hu])
            .map(|(dl, lb)| (dl.is_prefix.as_slice(), lb.node_count))
            .collect();

        let suffix_parts: Vec<(&[u64], u32)> = builder.levels[..hu]
            .iter()
            .map(|lb| (lb.suffixes.as_slice(), lb.suffix_count * builder.suffix_len()))
            .collect();
        let value_parts: Vec<&[u8]> = builder.levels[..hu]
            .iter()
            .map(|lb| lb.values.as_slice())
            .collect();

        LoudsDense {
            height,
            label_vec: RankVector::new(RANK_DENSE_BLOCK_SIZE, &label_parts),
            has_child_vec: RankVector::new(RANK_DENSE_BLOCK_SIZE, &has_child_parts),
            is_prefix_vec: RankVector::new(RANK_DENSE_BLOCK_SIZE, &is_prefix_parts),
            suffixes: SuffixVector::new(
                builder.suffix_type,
                builder.hash_suffix_len,
                builder.real_suffix_len,
                &suffix_parts,
            ),
            values: ValueVector::new(&value_parts, builder.value_size),
        }
    }

    pub(crate) fn height(&self) -> u32 {
        self.height
    }

    pub(crate) fn get(&self, key: &[u8]) -> DenseGet<'_> {
        let mut node_id = 0u32;
        for level in 0..self.height {
            let mut pos = node_id * DENSE_FANOUT;
            if level as usize >= key.len() {
                if self.is_prefix_vec.is_set(node_id) {
                    let val_pos = self.suffix_pos(pos, true);
                    if self.suffixes.check_equality(val_pos, key, level + 1) {
                        return DenseGet::Found(self.values.get(val_pos));
                    }
                }
                return DenseGet::Missing;
            }
            pos += key[level as usize] as u32;

            if !self.label_vec.is_set(pos) {
                return DenseGet::Missing;
            }

            if !self.has_child_vec.is_set(pos) {
                let val_pos = self.suffix_pos(pos, false);
                if self.suffixes.check_equality(val_pos, key, level + 1) {
                    return DenseGet::Found(self.values.get(val_pos));
                }
                return DenseGet::Missing;
            }

            node_id = self.child_node_id(pos);
        }

        DenseGet::Descend(node_id)
    }

    fn child_node_id(&self, pos: u32) -> u32 {
        self.has_child_vec.rank(pos)
    }

    fn suffix_pos(&self, pos: u32, is_prefix: bool) -> u32 {
        let node_id = pos / DENSE_FANOUT;
        let mut suffix_pos = self.label_vec.rank(pos) - self.has_child_vec.rank(pos)
            + self.is_prefix_vec.rank(node_id)
            - 1;

        // A prefix key shares its node with a leaf at label 0; without the
        // adjustment the rank arithmetic lands on that leaf's suffix.
        if is_prefix && self.label_vec.is_set(pos) && !self.has_child_vec.is_set(pos) {
            suffix_pos -= 1;
        }
        suffix_pos
    }

    fn next_pos(&self, pos: u32) -> u32 {
        pos.wrapping_add(self.label_vec.distance_to_next_set_bit(pos))
    }

    fn prev_pos(&self, pos: u32) -> (u32, bool) {
        let dist = self.label_vec.distance_to_prev_set_bit(pos);
        if pos <= dist {
            return (0, true);
        }
        (pos - dist, false)
    }

    pub(crate) fn mem_size(&self) -> usize {
        size_of::<Self>()
            + self.label_vec.mem_size()
            + self.has_child_vec.mem_size()
            + self.is_prefix_vec.mem_size()
            + self.suffixes.mem_size()
    }

    fn raw_marshal_size(&self) -> usize {
        4 + self.label_vec.marshal_size()
            + self.has_child_vec.marshal_size()
            + self.is_prefix_vec.marshal_size()
            + self.suffixes.marshal_size()
    }

    pub(crate) fn marshal_size(&self) -> usize {
        super::bits::align8(self.raw_marshal_size())
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        let start = out.len();
        let header = DenseHeader {
            height: U32::new(self.height),
        };
        out.extend_from_slice(header.as_bytes());
        self.label_vec.write_to(out);
        self.has_child_vec.write_to(out);
        self.is_prefix_vec.write_to(out);
        self.suffixes.write_to(out);
        pad_segment(out, start);
    }

    pub(crate) fn unmarshal(buf: &[u8]) -> Result<(LoudsDense, &[u8])> {
        ensure!(buf.len() >= 4, "dense header truncated");
        let header = DenseHeader::ref_from_bytes(&buf[..4])
            .map_err(|e| eyre!("failed to parse dense header: {e:?}"))?;

        let mut rest = &buf[4..];
        let (label_vec, r) = RankVector::unmarshal(rest)?;
        rest = r;
        let (has_child_vec, r) = RankVector::unmarshal(rest)?;
        rest = r;
        let (is_prefix_vec, r) = RankVector::unmarshal(rest)?;
        rest = r;
        let (suffixes, r) = SuffixVector::unmarshal(rest)?;
        rest = r;

        let consumed = super::bits::align8(buf.len() - rest.len());
        ensure!(buf.len() >= consumed, "dense block padding truncated");
        Ok((
            LoudsDense {
                height: header.height.get(),
                label_vec,
                has_child_vec,
                is_prefix_vec,
                suffixes,
                values: ValueVector::default(),
            },
            &buf[consumed..],
        ))
    }
}

pub(crate) struct DenseIter<'s> {
    pub(crate) valid: bool,
    pub(crate) search_comp: bool,
    pub(crate) left_comp: bool,
    pub(crate) right_comp: bool,
    ld: &'s LoudsDense,
    pub(crate) send_out_node_id: u32,
    key_len: u32,
    key_buf: SmallVec<[u8; 16]>,
    pos_in_trie: SmallVec<[u32; 16]>,
    at_prefix_key: bool,
}

impl<'s> DenseIter<'s> {
    pub(crate) fn new(ld: &'s LoudsDense) -> DenseIter<'s> {
        let mut key_buf = SmallVec::new();
        key_buf.resize(ld.height as usize, 0);
        let mut pos_in_trie = SmallVec::new();
        pos_in_trie.resize(ld.height as usize, 0);
        DenseIter {
            valid: false,
            search_comp: false,
            left_comp: false,
            right_comp: false,
            ld,
            send_out_node_id: 0,
            key_len: 0,
            key_buf,
            pos_in_trie,
            at_prefix_key: false,
        }
    }

    pub(crate) fn height(&self) -> u32 {
        self.ld.height
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.search_comp && self.left_comp && self.right_comp
    }

    pub(crate) fn reset(&mut self) {
        self.valid = false;
        self.key_len = 0;
        self.at_prefix_key = false;
    }

    fn set_all_flags(&mut self, search: bool, left: bool, right: bool) {
        self.valid = true;
        self.search_comp = search;
        self.left_comp = left;
        self.right_comp = right;
    }

    fn append(&mut self, pos: u32) {
        self.key_buf[self.key_len as usize] = (pos % DENSE_FANOUT) as u8;
        self.pos_in_trie[self.key_len as usize] = pos;
        self.key_len += 1;
    }

    fn set(&mut self, level: u32, pos: u32) {
        self.key_buf[level as usize] = (pos % DENSE_FANOUT) as u8;
        self.pos_in_trie[level as usize] = pos;
    }

    pub(crate) fn key(&self) -> &[u8] {
        let mut len = self.key_len;
        if self.at_prefix_key {
            len -= 1;
        }
        &self.key_buf[..len as usize]
    }

    pub(crate) fn value(&self) -> &[u8] {
        let val_pos = self
            .ld
            .suffix_pos(self.pos_in_trie[self.key_len as usize - 1], self.at_prefix_key);
        self.ld.values.get(val_pos)
    }

    /// Marks the dense cursor as a pass-through for a filter with no dense
    /// levels: valid but incomplete, so validity and keys defer to the
    /// sparse cursor and exhaustion invalidates normally.
    pub(crate) fn mark_sparse_only(&mut self) {
        self.send_out_node_id = 0;
        self.set_all_flags(true, false, false);
    }

    pub(crate) fn next(&mut self) {
        if self.ld.height == 0 {
            self.valid = false;
            return;
        }
        if self.at_prefix_key {
            self.at_prefix_key = false;
            self.move_to_left_most_key();
            return;
        }

        let mut pos = self.pos_in_trie[self.key_len as usize - 1];
        let mut next_pos = self.ld.next_pos(pos);

        while next_pos / DENSE_FANOUT > pos / DENSE_FANOUT {
            self.key_len -= 1;
            if self.key_len == 0 {
                self.valid = false;
                return;
            }
            pos = self.pos_in_trie[self.key_len as usize - 1];
            next_pos = self.ld.next_pos(pos);
        }
        self.set(self.key_len - 1, next_pos);
        self.move_to_left_most_key();
    }

    pub(crate) fn prev(&mut self) {
        if self.ld.height == 0 {
            self.valid = false;
            return;
        }
        if self.at_prefix_key {
            self.at_prefix_key = false;
            self.key_len -= 1;
        }
        let mut pos = self.pos_in_trie[self.key_len as usize - 1];
        let (mut prev_pos, mut out) = self.ld.prev_pos(pos);
        if out {
            self.valid = false;
            return;
        }

        while prev_pos / DENSE_FANOUT < pos / DENSE_FANOUT {
            let node_id = pos / DENSE_FANOUT;
            if self.ld.is_prefix_vec.is_set(node_id) {
                self.at_prefix_key = true;
                self.set_all_flags(true, true, true);
                return;
            }

            self.key_len -= 1;
            if self.key_len == 0 {
                self.valid = false;
                return;
            }
            pos = self.pos_in_trie[self.key_len as usize - 1];
            (prev_pos, out) = self.ld.prev_pos(pos);
            if out {
                self.valid = false;
                return;
            }
        }
        self.set(self.key_len - 1, prev_pos);
        self.move_to_right_most_key();
    }

    /// Positions at the smallest key ≥ `key` within the dense levels.
    /// Returns `true` when the landing position may still equal the key.
    pub(crate) fn seek(&mut self, key: &[u8]) -> bool {
        let mut node_id = 0u32;
        for level in 0..self.ld.height {
            let mut pos = node_id * DENSE_FANOUT;
            if level as usize >= key.len() {
                self.append(self.ld.next_pos(pos.wrapping_sub(1)));
                if self.ld.is_prefix_vec.is_set(node_id) {
                    self.at_prefix_key = true;
                    self.set_all_flags(true, true, true);
                } else {
                    // The leftmost walk sets its own flags, including a
                    // sparse handoff when the subtree continues below.
                    self.move_to_left_most_key();
                }
                return true;
            }

            pos += key[level as usize] as u32;
            self.append(pos);

            if !self.ld.label_vec.is_set(pos) {
                self.next();
                return false;
            }

            if !self.ld.has_child_vec.is_set(pos) {
                return self.compare_suffix_greater_than(key, pos, level + 1);
            }

            node_id = self.ld.child_node_id(pos);
        }

        self.send_out_node_id = node_id;
        self.set_all_flags(false, true, true);
        true
    }

    pub(crate) fn move_to_left_most_key(&mut self) {
        let mut level = self.key_len - 1;
        let mut pos = self.pos_in_trie[level as usize];
        if !self.ld.has_child_vec.is_set(pos) {
            self.set_all_flags(true, true, true);
            return;
        }

        while level < self.ld.height - 1 {
            let node_id = self.ld.child_node_id(pos);
            if self.ld.is_prefix_vec.is_set(node_id) {
                self.append(self.ld.next_pos((node_id * DENSE_FANOUT).wrapping_sub(1)));
                self.at_prefix_key = true;
                self.set_all_flags(true, true, true);
                return;
            }

            pos = self.ld.next_pos((node_id * DENSE_FANOUT).wrapping_sub(1));
            self.append(pos);

            if !self.ld.has_child_vec.is_set(pos) {
                self.set_all_flags(true, true, true);
                return;
            }

            level += 1;
        }
        self.send_out_node_id = self.ld.child_node_id(pos);
        self.set_all_flags(true, false, true);
    }

    pub(crate) fn move_to_right_most_key(&mut self) {
        let mut level = self.key_len - 1;
        let mut pos = self.pos_in_trie[level as usize];
        if !self.ld.has_child_vec.is_set(pos) {
            self.set_all_flags(true, true, true);
            return;
        }

        while level < self.ld.height - 1 {
            let node_id = self.ld.child_node_id(pos);
            let (p, out) = self.ld.prev_pos((node_id + 1) * DENSE_FANOUT);
            if out {
                self.valid = false;
                return;
            }
            pos = p;
            self.append(pos);

            if !self.ld.has_child_vec.is_set(pos) {
                self.set_all_flags(true, true, true);
                return;
            }

            level += 1;
        }
        self.send_out_node_id = self.ld.child_node_id(pos);
        self.set_all_flags(true, true, false);
    }

    pub(crate) fn set_to_first_in_root(&mut self) {
        if self.ld.label_vec.is_set(0) {
            self.pos_in_trie[0] = 0;
            self.key_buf[0] = 0;
        } else {
            self.pos_in_trie[0] = self.ld.next_pos(0);
            self.key_buf[0] = self.pos_in_trie[0] as u8;
        }
        self.key_len += 1;
    }

    pub(crate) fn set_to_last_in_root(&mut self) {
        let (pos, _) = self.ld.prev_pos(DENSE_FANOUT);
        self.pos_in_trie[0] = pos;
        self.key_buf[0] = pos as u8;
        self.key_len += 1;
    }

    fn compare_suffix_greater_than(&mut self, key: &[u8], pos: u32, level: u32) -> bool {
        let cmp = self
            .ld
            .suffixes
            .compare(key, self.ld.suffix_pos(pos, false), level);
        if cmp == super::suffix::SuffixCmp::Less {
            self.next();
            return false;
        }
        self.set_all_flags(true, true, true);
        cmp == super::suffix::SuffixCmp::CouldBePositive
    }

    pub(crate) fn compare(&self, key: &[u8]) -> SeekCmp {
        if self.at_prefix_key && self.key_len - 1 < key.len() as u32 {
            return SeekCmp::Less;
        }
        let it_key = self.key();
        if it_key.len() > key.len() {
            return SeekCmp::Greater;
        }
        match it_key.cmp(&key[..it_key.len()]) {
            std::cmp::Ordering::Less => SeekCmp::Less,
            std::cmp::Ordering::Greater => SeekCmp::Greater,
            std::cmp::Ordering::Equal => {
                if self.is_complete() {
                    let suffix_pos = self
                        .ld
                        .suffix_pos(self.pos_in_trie[self.key_len as usize - 1], self.at_prefix_key);
                    self.ld.suffixes.compare(key, suffix_pos, self.key_len).into()
                } else {
                    SeekCmp::Equal
                }
            }
        }
    }
}
