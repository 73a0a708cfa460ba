//! # Filter Builder
//!
//! Streams strictly increasing keys into per-level LOUDS-Sparse buffers,
//! then (at finish) chooses the dense/sparse cutoff and materializes the
//! dense bitmaps for the levels above it.
//!
//! ## Buffering
//!
//! The builder holds exactly one pending key. Each `add` compares the new
//! key against the pending one and emits trie bytes for the pending key up
//! to the first distinguishing byte; the remainder of the pending key
//! becomes its suffix. `finish` flushes the last pending key against an
//! empty comparand.
//!
//! When two adjacent keys coincide up to a full key, the shorter one is
//! represented by the reserved terminator label `0xFF` with its has-child
//! bit clear.
//!
//! ## Per-Level State
//!
//! Every level grows a label byte list, has-child and louds bit vectors, a
//! packed suffix stream, a value byte stream, and a node count, all in
//! lockstep — one [`LevelBuf`] per level.
//!
//! ## Cutoff Selection
//!
//! Descending from the deepest level, the builder estimates the serialized
//! size of "dense above, sparse below" and picks the deepest cutoff whose
//! total fits `total_count * bits_per_key_hint` bits.

use super::bits::{read_bit, set_bit, WORD_SIZE};
use super::suffix::{construct_suffix, SuffixType};
use super::Surf;
use eyre::{ensure, Result};

/// Reserved in-node terminator label.
pub(crate) const LABEL_TERMINATOR: u8 = 0xFF;

pub(crate) const DENSE_FANOUT: u32 = 256;

/// One level's worth of builder state; all vectors grow in lockstep.
#[derive(Debug, Default)]
pub(crate) struct LevelBuf {
    pub(crate) labels: Vec<u8>,
    pub(crate) has_child: Vec<u64>,
    pub(crate) louds: Vec<u64>,
    pub(crate) suffixes: Vec<u64>,
    pub(crate) suffix_count: u32,
    pub(crate) values: Vec<u8>,
    pub(crate) node_count: u32,
    last_is_terminator: bool,
}

/// Dense bitmaps for one level above the cutoff, 256 label/has-child bits
/// per node plus one is-prefix bit per node.
#[derive(Debug, Default)]
pub(crate) struct DenseLevel {
    pub(crate) labels: Vec<u64>,
    pub(crate) has_child: Vec<u64>,
    pub(crate) is_prefix: Vec<u64>,
}

/// Builds a [`Surf`] from strictly increasing keys.
pub struct Builder {
    pub(crate) sparse_start_level: u32,
    pub(crate) value_size: u32,
    pub(crate) total_count: usize,

    pub(crate) suffix_type: SuffixType,
    pub(crate) hash_suffix_len: u32,
    pub(crate) real_suffix_len: u32,

    pub(crate) levels: Vec<LevelBuf>,
    pub(crate) dense_levels: Vec<DenseLevel>,

    pending_key: Vec<u8>,
    pending_value: Vec<u8>,
}

impl Builder {
    /// `value_size` bytes of each added value are stored per key. Suffix
    /// lengths are normalized to the suffix type; together they must fit in
    /// one 64-bit word.
    pub fn new(
        value_size: u32,
        suffix_type: SuffixType,
        hash_suffix_len: u32,
        real_suffix_len: u32,
    ) -> Result<Builder> {
        let (hash_suffix_len, real_suffix_len) = match suffix_type {
            SuffixType::Hash => (hash_suffix_len, 0),
            SuffixType::Real => (0, real_suffix_len),
            SuffixType::Mixed => (hash_suffix_len, real_suffix_len),
            SuffixType::None => (0, 0),
        };
        ensure!(
            hash_suffix_len + real_suffix_len <= 64,
            "suffix of {} bits exceeds 64",
            hash_suffix_len + real_suffix_len
        );
        ensure!(
            suffix_type == SuffixType::None || hash_suffix_len + 7 <= 64,
            "hash suffix of {hash_suffix_len} bits exceeds the fingerprint window"
        );

        Ok(Builder {
            sparse_start_level: 0,
            value_size,
            total_count: 0,
            suffix_type,
            hash_suffix_len,
            real_suffix_len,
            levels: Vec::new(),
            dense_levels: Vec::new(),
            pending_key: Vec::new(),
            pending_value: Vec::new(),
        })
    }

    /// Adds a key/value pair. Keys must arrive in strictly increasing
    /// byte-lexicographic order; the empty key is unrepresentable.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        ensure!(
            self.pending_key.as_slice() < key,
            "key {key:?} is not strictly greater than the previous key {:?}",
            self.pending_key
        );
        ensure!(
            value.len() >= self.value_size as usize,
            "value of {} bytes is shorter than the configured width {}",
            value.len(),
            self.value_size
        );

        self.total_count += 1;
        self.process_pending_key(key);
        self.pending_key.clear();
        self.pending_key.extend_from_slice(key);
        self.pending_value.clear();
        self.pending_value.extend_from_slice(value);
        Ok(())
    }

    /// Flushes the last key, picks the dense/sparse cutoff from the
    /// bits-per-key hint, and assembles the immutable filter.
    pub fn finish(mut self, bits_per_key_hint: usize) -> Surf {
        self.process_pending_key(&[]);
        self.determine_cutoff_level(bits_per_key_hint);
        self.build_dense();
        Surf::from_builder(&self)
    }

    fn process_pending_key(&mut self, curr: &[u8]) {
        if self.pending_key.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_key);
        let level = self.skip_common_prefix(&pending);
        let level = self.insert_key_until_unique(&pending, curr, level);
        self.insert_suffix(&pending, level);
        self.insert_value(level);
        self.pending_key = pending;
    }

    fn skip_common_prefix(&mut self, key: &[u8]) -> u32 {
        let mut level = 0u32;
        while (level as usize) < key.len() && self.is_char_common_prefix(key[level as usize], level)
        {
            let pos = self.num_items(level) - 1;
            set_bit(&mut self.levels[level as usize].has_child, pos);
            level += 1;
        }
        level
    }

    fn is_char_common_prefix(&self, c: u8, level: u32) -> bool {
        level < self.tree_height()
            && !self.levels[level as usize].last_is_terminator
            && Some(&c) == self.levels[level as usize].labels.last()
    }

    fn insert_key_until_unique(&mut self, key: &[u8], next_key: &[u8], level: u32) -> u32 {
        let mut level = level;
        let is_start_of_node = self.is_level_empty(level);

        self.insert_byte(key[level as usize], level, is_start_of_node, false);
        level += 1;

        if level as usize > next_key.len() || key[..level as usize] != next_key[..level as usize] {
            return level;
        }

        while (level as usize) < key.len()
            && (level as usize) < next_key.len()
            && key[level as usize] == next_key[level as usize]
        {
            self.insert_byte(key[level as usize], level, true, false);
            level += 1;
        }

        if (level as usize) < key.len() {
            self.insert_byte(key[level as usize], level, true, false);
        } else {
            self.insert_byte(LABEL_TERMINATOR, level, true, true);
        }
        level + 1
    }

    fn insert_byte(&mut self, c: u8, level: u32, is_start_of_node: bool, is_term: bool) {
        if level >= self.tree_height() {
            self.add_level();
        }

        if level > 0 {
            let pos = self.num_items(level - 1) - 1;
            set_bit(&mut self.levels[level as usize - 1].has_child, pos);
        }

        let buf = &mut self.levels[level as usize];
        buf.labels.push(c);
        if is_start_of_node {
            let pos = buf.labels.len() as u32 - 1;
            set_bit(&mut buf.louds, pos);
            buf.node_count += 1;
        }
        buf.last_is_terminator = is_term;

        self.move_to_next_item_slot(level);
    }

    fn move_to_next_item_slot(&mut self, level: u32) {
        if self.num_items(level) % WORD_SIZE == 0 {
            let buf = &mut self.levels[level as usize];
            buf.has_child.push(0);
            buf.louds.push(0);
        }
    }

    fn add_level(&mut self) {
        let mut buf = LevelBuf::default();
        buf.has_child.push(0);
        buf.louds.push(0);
        self.levels.push(buf);
    }

    fn insert_suffix(&mut self, key: &[u8], level: u32) {
        if level >= self.tree_height() {
            self.add_level();
        }
        let suffix = construct_suffix(
            key,
            level,
            self.suffix_type,
            self.real_suffix_len,
            self.hash_suffix_len,
        );

        let suffix_len = self.suffix_len();
        if suffix_len == 0 {
            return;
        }
        let buf = &mut self.levels[level as usize - 1];
        let pos = buf.suffix_count * suffix_len;
        if pos as usize == buf.suffixes.len() * WORD_SIZE as usize {
            buf.suffixes.push(0);
        }
        let word_id = (pos / WORD_SIZE) as usize;
        let offset = pos % WORD_SIZE;
        let remain = WORD_SIZE - offset;
        if suffix_len <= remain {
            buf.suffixes[word_id] += suffix << (remain - suffix_len);
        } else {
            buf.suffixes[word_id] += suffix >> (suffix_len - remain);
            buf.suffixes
                .push(suffix << (WORD_SIZE - (suffix_len - remain)));
        }
        buf.suffix_count += 1;
    }

    fn insert_value(&mut self, level: u32) {
        let value = &self.pending_value[..self.value_size as usize];
        self.levels[level as usize - 1].values.extend_from_slice(value);
    }

    fn determine_cutoff_level(&mut self, bits_per_key_hint: usize) {
        let height = self.tree_height();
        if height == 0 {
            return;
        }

        let size_hint = (self.total_count * bits_per_key_hint) as u64;
        let suffix_size = self.total_count as u64 * self.suffix_len() as u64;
        let mut level = height - 1;
        while level > 0 {
            let size =
                self.dense_size_no_suffix(level) + self.sparse_size_no_suffix(level) + suffix_size;
            if size <= size_hint {
                break;
            }
            level -= 1;
        }
        self.sparse_start_level = level;
    }

    fn dense_size_no_suffix(&self, level: u32) -> u64 {
        let mut total = 0u64;
        for l in 0..level as usize {
            total += 2 * DENSE_FANOUT as u64 * self.levels[l].node_count as u64;
            if l > 0 {
                total += self.levels[l - 1].node_count as u64;
            }
        }
        total
    }

    fn sparse_size_no_suffix(&self, level: u32) -> u64 {
        self.levels[level as usize..]
            .iter()
            .map(|l| 10 * l.labels.len() as u64)
            .sum()
    }

    fn build_dense(&mut self) {
        for level in 0..self.sparse_start_level {
            self.dense_levels.push(self.init_dense_level(level));
            if self.num_items(level) == 0 {
                continue;
            }

            let mut node_id = 0u32;
            if self.is_terminator(level, 0) {
                set_bit(&mut self.dense_levels[level as usize].is_prefix, 0);
            } else {
                self.set_label_and_has_child(level, node_id, 0);
            }

            for pos in 1..self.num_items(level) {
                if self.is_start_of_node(level, pos) {
                    node_id += 1;
                    if self.is_terminator(level, pos) {
                        set_bit(&mut self.dense_levels[level as usize].is_prefix, node_id);
                        continue;
                    }
                }
                self.set_label_and_has_child(level, node_id, pos);
            }
        }
    }

    fn init_dense_level(&self, level: u32) -> DenseLevel {
        let node_count = self.levels[level as usize].node_count;
        let vec_len = (node_count * (DENSE_FANOUT / WORD_SIZE)) as usize;
        let prefix_len = node_count.div_ceil(WORD_SIZE) as usize;
        DenseLevel {
            labels: vec![0; vec_len],
            has_child: vec![0; vec_len],
            is_prefix: vec![0; prefix_len],
        }
    }

    fn set_label_and_has_child(&mut self, level: u32, node_id: u32, pos: u32) {
        let label = self.levels[level as usize].labels[pos as usize];
        let bit = node_id * DENSE_FANOUT + label as u32;
        set_bit(&mut self.dense_levels[level as usize].labels, bit);
        if read_bit(&self.levels[level as usize].has_child, pos) {
            set_bit(&mut self.dense_levels[level as usize].has_child, bit);
        }
    }

    fn is_start_of_node(&self, level: u32, pos: u32) -> bool {
        read_bit(&self.levels[level as usize].louds, pos)
    }

    fn is_terminator(&self, level: u32, pos: u32) -> bool {
        let buf = &self.levels[level as usize];
        buf.labels[pos as usize] == LABEL_TERMINATOR && !read_bit(&buf.has_child, pos)
    }

    pub(crate) fn suffix_len(&self) -> u32 {
        self.hash_suffix_len + self.real_suffix_len
    }

    pub(crate) fn tree_height(&self) -> u32 {
        self.levels.len() as u32
    }

    fn num_items(&self, level: u32) -> u32 {
        self.levels[level as usize].labels.len() as u32
    }

    fn is_level_empty(&self, level: u32) -> bool {
        level >= self.tree_height() || self.levels[level as usize].labels.is_empty()
    }
}
