//! # LOUDS-Sparse Levels
//!
//! Byte-list encoding for the trie levels below the cutoff. Each slot holds
//! one label byte, one has-child bit, and one louds bit (1 = first slot of a
//! node):
//!
//! ```text
//! child node id  = rank(hasChild, pos) + denseChildCount
//! first slot of node n = select(louds, n + 1 - denseNodeCount)
//! node size      = distance from first slot to the next louds bit
//! ```
//!
//! Node ids continue the dense numbering, so a dense lookup that exhausts
//! its levels hands its node id straight to [`LoudsSparse::get`].

use super::builder::{Builder, LABEL_TERMINATOR};
use super::labels::LabelVector;
use super::suffix::{SuffixCmp, SuffixVector};
use super::vectors::{
    pad_segment, RankVector, SelectVector, ValueVector, RANK_SPARSE_BLOCK_SIZE,
};
use super::SeekCmp;
use eyre::{ensure, eyre, Result};
use smallvec::SmallVec;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct SparseHeader {
    height: U32,
    start_level: U32,
    dense_node_count: U32,
    dense_child_count: U32,
}

#[derive(Debug, Default)]
pub(crate) struct LoudsSparse {
    height: u32,
    start_level: u32,
    dense_node_count: u32,
    dense_child_count: u32,

    label_vec: LabelVector,
    has_child_vec: RankVector,
    louds_vec: SelectVector,
    suffixes: SuffixVector,
    pub(crate) values: ValueVector,
}

impl LoudsSparse {
    pub(crate) fn from_builder(builder: &Builder) -> LoudsSparse {
        let height = builder.tree_height();
        let start_level = builder.sparse_start_level;
        let su = start_level as usize;
        let hu = height as usize;

        let dense_node_count: u32 = builder.levels[..su].iter().map(|l| l.node_count).sum();
        let dense_child_count = if start_level != 0 {
            dense_node_count + builder.levels[su].node_count - 1
        } else {
            0
        };

        let label_parts: Vec<&[u8]> = builder.levels[su..hu]
            .iter()
            .map(|l| l.labels.as_slice())
            .collect();
        let has_child_parts: Vec<(&[u64], u32)> = builder.levels[su..hu]
            .iter()
            .map(|l| (l.has_child.as_slice(), l.labels.len() as u32))
            .collect();
        let louds_parts: Vec<(&[u64], u32)> = builder.levels[su..hu]
            .iter()
            .map(|l| (l.louds.as_slice(), l.labels.len() as u32))
            .collect();
        let suffix_parts: Vec<(&[u64], u32)> = builder.levels[su..hu]
            .iter()
            .map(|l| (l.suffixes.as_slice(), l.suffix_count * builder.suffix_len()))
            .collect();
        let value_parts: Vec<&[u8]> = builder.levels[su..hu]
            .iter()
            .map(|l| l.values.as_slice())
            .collect();

        LoudsSparse {
            height,
            start_level,
            dense_node_count,
            dense_child_count,
            label_vec: LabelVector::new(&label_parts),
            has_child_vec: RankVector::new(RANK_SPARSE_BLOCK_SIZE, &has_child_parts),
            louds_vec: SelectVector::new(&louds_parts),
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

    pub(crate) fn get(&self, key: &[u8], node_id: u32) -> Option<&[u8]> {
        let mut node_id = node_id;
        let mut pos = self.first_label_pos(node_id);
        let mut level = self.start_level;
        while (level as usize) < key.len() {
            let (found_pos, ok) =
                self.label_vec
                    .search(key[level as usize], pos, self.node_size(pos));
            if !ok {
                return None;
            }
            pos = found_pos;

            if !self.has_child_vec.is_set(pos) {
                let val_pos = self.suffix_pos(pos);
                if self.suffixes.check_equality(val_pos, key, level + 1) {
                    return Some(self.values.get(val_pos));
                }
                return None;
            }

            node_id = self.child_node_id(pos);
            pos = self.first_label_pos(node_id);
            level += 1;
        }

        if self.label_vec.label(pos) == LABEL_TERMINATOR && !self.has_child_vec.is_set(pos) {
            let val_pos = self.suffix_pos(pos);
            if self.suffixes.check_equality(val_pos, key, level + 1) {
                return Some(self.values.get(val_pos));
            }
        }
        None
    }

    fn suffix_pos(&self, pos: u32) -> u32 {
        pos - self.has_child_vec.rank(pos)
    }

    fn first_label_pos(&self, node_id: u32) -> u32 {
        self.louds_vec.select(node_id + 1 - self.dense_node_count)
    }

    fn last_label_pos(&self, node_id: u32) -> u32 {
        let next_rank = node_id + 2 - self.dense_node_count;
        if next_rank > self.louds_vec.num_ones() {
            return self.louds_vec.num_bits() - 1;
        }
        self.louds_vec.select(next_rank) - 1
    }

    fn child_node_id(&self, pos: u32) -> u32 {
        self.has_child_vec.rank(pos) + self.dense_child_count
    }

    fn node_size(&self, pos: u32) -> u32 {
        // The probe runs off the bit vector (distance 0) when the last node
        // ends exactly at a word boundary; the node still spans to the end.
        match self.louds_vec.distance_to_next_set_bit(pos) {
            0 => self.louds_vec.num_bits() - pos,
            d => d,
        }
    }

    fn is_end_of_node(&self, pos: u32) -> bool {
        pos == self.louds_vec.num_bits() - 1 || self.louds_vec.is_set(pos + 1)
    }

    pub(crate) fn mem_size(&self) -> usize {
        size_of::<Self>()
            + self.label_vec.mem_size()
            + self.has_child_vec.mem_size()
            + self.louds_vec.mem_size()
            + self.suffixes.mem_size()
    }

    fn raw_marshal_size(&self) -> usize {
        16 + self.label_vec.marshal_size()
            + self.has_child_vec.marshal_size()
            + self.louds_vec.marshal_size()
            + self.suffixes.marshal_size()
    }

    pub(crate) fn marshal_size(&self) -> usize {
        super::bits::align8(self.raw_marshal_size())
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        let start = out.len();
        let header = SparseHeader {
            height: U32::new(self.height),
            start_level: U32::new(self.start_level),
            dense_node_count: U32::new(self.dense_node_count),
            dense_child_count: U32::new(self.dense_child_count),
        };
        out.extend_from_slice(header.as_bytes());
        self.label_vec.write_to(out);
        self.has_child_vec.write_to(out);
        self.louds_vec.write_to(out);
        self.suffixes.write_to(out);
        pad_segment(out, start);
    }

    pub(crate) fn unmarshal(buf: &[u8]) -> Result<(LoudsSparse, &[u8])> {
        ensure!(buf.len() >= 16, "sparse header truncated");
        let header = SparseHeader::ref_from_bytes(&buf[..16])
            .map_err(|e| eyre!("failed to parse sparse header: {e:?}"))?;

        let mut rest = &buf[16..];
        let (label_vec, r) = LabelVector::unmarshal(rest)?;
        rest = r;
        let (has_child_vec, r) = RankVector::unmarshal(rest)?;
        rest = r;
        let (louds_vec, r) = SelectVector::unmarshal(rest)?;
        rest = r;
        let (suffixes, r) = SuffixVector::unmarshal(rest)?;
        rest = r;

        let consumed = super::bits::align8(buf.len() - rest.len());
        ensure!(buf.len() >= consumed, "sparse block padding truncated");
        Ok((
            LoudsSparse {
                height: header.height.get(),
                start_level: header.start_level.get(),
                dense_node_count: header.dense_node_count.get(),
                dense_child_count: header.dense_child_count.get(),
                label_vec,
                has_child_vec,
                louds_vec,
                suffixes,
                values: ValueVector::default(),
            },
            &buf[consumed..],
        ))
    }
}

pub(crate) struct SparseIter<'s> {
    pub(crate) valid: bool,
    at_terminator: bool,
    ls: &'s LoudsSparse,
    start_level: u32,
    pub(crate) start_node_id: u32,
    key_len: u32,
    key_buf: SmallVec<[u8; 16]>,
    pos_in_trie: SmallVec<[u32; 16]>,
}

impl<'s> SparseIter<'s> {
    pub(crate) fn new(ls: &'s LoudsSparse) -> SparseIter<'s> {
        let depth = (ls.height - ls.start_level) as usize;
        let mut key_buf = SmallVec::new();
        key_buf.resize(depth, 0);
        let mut pos_in_trie = SmallVec::new();
        pos_in_trie.resize(depth, 0);
        SparseIter {
            valid: false,
            at_terminator: false,
            ls,
            start_level: ls.start_level,
            start_node_id: 0,
            key_len: 0,
            key_buf,
            pos_in_trie,
        }
    }

    pub(crate) fn height(&self) -> u32 {
        self.ls.height
    }

    pub(crate) fn reset(&mut self) {
        self.valid = false;
        self.key_len = 0;
        self.at_terminator = false;
    }

    fn append(&mut self, label: u8, pos: u32) {
        self.key_buf[self.key_len as usize] = label;
        self.pos_in_trie[self.key_len as usize] = pos;
        self.key_len += 1;
    }

    fn set(&mut self, level: u32, pos: u32) {
        self.key_buf[level as usize] = self.ls.label_vec.label(pos);
        self.pos_in_trie[level as usize] = pos;
    }

    pub(crate) fn key(&self) -> &[u8] {
        let mut len = self.key_len;
        if self.at_terminator {
            len -= 1;
        }
        &self.key_buf[..len as usize]
    }

    pub(crate) fn value(&self) -> &[u8] {
        let val_pos = self.ls.suffix_pos(self.pos_in_trie[self.key_len as usize - 1]);
        self.ls.values.get(val_pos)
    }

    pub(crate) fn next(&mut self) {
        self.at_terminator = false;
        let mut pos = self.pos_in_trie[self.key_len as usize - 1] + 1;

        while pos >= self.ls.louds_vec.num_bits() || self.ls.louds_vec.is_set(pos) {
            self.key_len -= 1;
            if self.key_len == 0 {
                self.valid = false;
                return;
            }
            pos = self.pos_in_trie[self.key_len as usize - 1] + 1;
        }
        self.set(self.key_len - 1, pos);
        self.move_to_left_most_key();
    }

    pub(crate) fn prev(&mut self) {
        self.at_terminator = false;
        let mut pos = self.pos_in_trie[self.key_len as usize - 1];
        if pos == 0 {
            self.valid = false;
            return;
        }

        while self.ls.louds_vec.is_set(pos) {
            self.key_len -= 1;
            if self.key_len == 0 {
                self.valid = false;
                return;
            }
            pos = self.pos_in_trie[self.key_len as usize - 1];
        }
        self.set(self.key_len - 1, pos - 1);
        self.move_to_right_most_key();
    }

    /// Positions at the smallest key ≥ `key` within the sparse levels,
    /// starting from the handoff node. Returns `true` when the landing
    /// position may still equal the key.
    pub(crate) fn seek(&mut self, key: &[u8]) -> bool {
        let mut node_id = self.start_node_id;
        let mut pos = self.ls.first_label_pos(node_id);

        let mut level = self.start_level;
        while (level as usize) < key.len() {
            let node_size = self.ls.node_size(pos);
            let (found_pos, ok) = self
                .ls
                .label_vec
                .search(key[level as usize], pos, node_size);
            if !ok {
                self.move_to_left_in_next_subtrie(found_pos, node_size, key[level as usize]);
                return false;
            }
            pos = found_pos;
            self.append(key[level as usize], pos);

            if !self.ls.has_child_vec.is_set(pos) {
                return self.compare_suffix_greater_than(key, pos, level + 1);
            }

            node_id = self.ls.child_node_id(pos);
            pos = self.ls.first_label_pos(node_id);
            level += 1;
        }

        if self.ls.label_vec.label(pos) == LABEL_TERMINATOR
            && !self.ls.has_child_vec.is_set(pos)
            && !self.ls.is_end_of_node(pos)
        {
            self.append(LABEL_TERMINATOR, pos);
            self.at_terminator = true;
            self.valid = true;
            return false;
        }

        if key.len() <= level as usize {
            self.move_to_left_most_key();
            return false;
        }

        self.valid = true;
        true
    }

    pub(crate) fn move_to_left_most_key(&mut self) {
        if self.key_len == 0 {
            let pos = self.ls.first_label_pos(self.start_node_id);
            let label = self.ls.label_vec.label(pos);
            self.append(label, pos);
        }

        let mut level = self.key_len - 1;
        let mut pos = self.pos_in_trie[level as usize];
        let label = self.ls.label_vec.label(pos);

        if !self.ls.has_child_vec.is_set(pos) {
            if label == LABEL_TERMINATOR && !self.ls.is_end_of_node(pos) {
                self.at_terminator = true;
            }
            self.valid = true;
            return;
        }

        while level < self.ls.height {
            let node_id = self.ls.child_node_id(pos);
            pos = self.ls.first_label_pos(node_id);
            let label = self.ls.label_vec.label(pos);

            if !self.ls.has_child_vec.is_set(pos) {
                self.append(label, pos);
                if label == LABEL_TERMINATOR && !self.ls.is_end_of_node(pos) {
                    self.at_terminator = true;
                }
                self.valid = true;
                return;
            }
            self.append(label, pos);
            level += 1;
        }
        unreachable!("trie walk exceeded its height");
    }

    pub(crate) fn move_to_right_most_key(&mut self) {
        if self.key_len == 0 {
            let pos = self.ls.last_label_pos(self.start_node_id);
            let label = self.ls.label_vec.label(pos);
            self.append(label, pos);
        }

        let mut level = self.key_len - 1;
        let mut pos = self.pos_in_trie[level as usize];
        let label = self.ls.label_vec.label(pos);

        if !self.ls.has_child_vec.is_set(pos) {
            if label == LABEL_TERMINATOR && !self.ls.is_end_of_node(pos) {
                self.at_terminator = true;
            }
            self.valid = true;
            return;
        }

        while level < self.ls.height {
            let node_id = self.ls.child_node_id(pos);
            pos = self.ls.last_label_pos(node_id);
            let label = self.ls.label_vec.label(pos);

            if !self.ls.has_child_vec.is_set(pos) {
                self.append(label, pos);
                if label == LABEL_TERMINATOR && !self.ls.is_end_of_node(pos) {
                    self.at_terminator = true;
                }
                self.valid = true;
                return;
            }
            self.append(label, pos);
            level += 1;
        }
        unreachable!("trie walk exceeded its height");
    }

    pub(crate) fn set_to_first_in_root(&mut self) {
        self.pos_in_trie[0] = 0;
        self.key_buf[0] = self.ls.label_vec.label(0);
    }

    pub(crate) fn set_to_last_in_root(&mut self) {
        self.pos_in_trie[0] = self.ls.last_label_pos(0);
        self.key_buf[0] = self.ls.label_vec.label(self.pos_in_trie[0]);
    }

    fn move_to_left_in_next_subtrie(&mut self, pos: u32, node_size: u32, label: u8) {
        let (pos, ok) = self.ls.label_vec.search_greater_than(label, pos, node_size);
        self.append(self.ls.label_vec.label(pos), pos);
        if ok {
            self.move_to_left_most_key();
        } else {
            self.next();
        }
    }

    fn compare_suffix_greater_than(&mut self, key: &[u8], pos: u32, level: u32) -> bool {
        let cmp = self.ls.suffixes.compare(key, self.ls.suffix_pos(pos), level);
        if cmp == SuffixCmp::Less {
            self.next();
            return false;
        }
        self.valid = true;
        cmp == SuffixCmp::CouldBePositive
    }

    pub(crate) fn compare(&self, key: &[u8]) -> SeekCmp {
        // The subtraction wraps when the probe key ends above the sparse
        // levels; a terminator position always orders below such a key.
        if self.at_terminator
            && self.key_len - 1 < (key.len() as u32).wrapping_sub(self.start_level)
        {
            return SeekCmp::Less;
        }
        if self.start_level as usize >= key.len() {
            return SeekCmp::Greater;
        }
        let it_key = self.key();
        let key_tail = &key[self.start_level as usize..];
        if it_key.len() > key_tail.len() {
            return SeekCmp::Greater;
        }
        match it_key.cmp(&key_tail[..it_key.len()]) {
            std::cmp::Ordering::Less => SeekCmp::Less,
            std::cmp::Ordering::Greater => SeekCmp::Greater,
            std::cmp::Ordering::Equal => {
                let suffix_pos = self.ls.suffix_pos(self.pos_in_trie[self.key_len as usize - 1]);
                self.ls.suffixes.compare(key_tail, suffix_pos, self.key_len).into()
            }
        }
    }
}
