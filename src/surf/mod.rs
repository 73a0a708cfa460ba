//! # SuRF: Succinct Range Filter
//!
//! An immutable, approximate trie over sorted byte keys. Membership and
//! range queries may report false positives (tunable via per-key suffix
//! bits) but never false negatives; stored keys are not recoverable.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │       Surf (get / has_range / iter)        │
//! ├─────────────────────┬──────────────────────┤
//! │ LOUDS-Dense levels  │ LOUDS-Sparse levels  │
//! │ 256-bit bitmaps per │ label byte lists +   │
//! │ node, rank descent  │ rank/select descent  │
//! ├─────────────────────┴──────────────────────┤
//! │ suffix vector │ value vector │ label vector│
//! ├────────────────────────────────────────────┤
//! │  bit vector + rank / select acceleration   │
//! └────────────────────────────────────────────┘
//! ```
//!
//! The top of the trie (up to a cutoff chosen from a bits-per-key hint) uses
//! the dense bitmap encoding for speed; the remainder uses the sparse byte
//! list encoding for size. Node ids are numbered level by level across both
//! encodings, so a dense descent that runs off the dense levels resumes in
//! the sparse levels with the same id.
//!
//! ## Construction and Queries
//!
//! [`Builder`] consumes strictly increasing keys and truncates each to its
//! shortest distinguishing prefix plus a configurable suffix. Queries walk
//! the dense levels, then the sparse levels; iterators are composites of a
//! dense and a sparse cursor with an explicit handoff node id.
//!
//! ## Serialization
//!
//! `marshal`/`write_to` emit the little-endian, 8-byte-aligned segment
//! layout (dense block, sparse block, then the two value vectors);
//! `unmarshal` validates segment headers and copies payloads out of the
//! caller's buffer.
//!
//! ## Module Organization
//!
//! - `bits`: broadword primitives (MSB-first addressing, select64)
//! - `vectors`: bit / rank / select / value vectors
//! - `labels`: sparse label byte store
//! - `suffix`: suffix construction, equality, three-valued compare
//! - `builder`: sorted-stream trie construction and cutoff selection
//! - `dense`, `sparse`: the two level encodings and their iterators

mod bits;
mod builder;
mod dense;
mod labels;
mod sparse;
mod suffix;
mod vectors;

pub use builder::Builder;
pub use suffix::SuffixType;

use dense::{DenseGet, DenseIter, LoudsDense};
use eyre::Result;
use sparse::{LoudsSparse, SparseIter};
use suffix::SuffixCmp;
use vectors::ValueVector;

/// Ordering of an iterator position against a probe key. Suffix bits cannot
/// always decide, so alongside the strict orderings there is `Ambiguous`
/// ("could be equal") and `Equal` ("byte-equal so far, undecided").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SeekCmp {
    Less,
    Ambiguous,
    Greater,
    Equal,
}

impl From<SuffixCmp> for SeekCmp {
    fn from(cmp: SuffixCmp) -> SeekCmp {
        match cmp {
            SuffixCmp::Less => SeekCmp::Less,
            SuffixCmp::CouldBePositive => SeekCmp::Ambiguous,
            SuffixCmp::Greater => SeekCmp::Greater,
        }
    }
}

/// Succinct range filter over a sorted key set. Built by [`Builder`],
/// immutable afterwards, freely shareable across threads.
#[derive(Debug, Default)]
pub struct Surf {
    ld: LoudsDense,
    ls: LoudsSparse,
}

impl Surf {
    pub(crate) fn from_builder(builder: &Builder) -> Surf {
        Surf {
            ld: LoudsDense::from_builder(builder),
            ls: LoudsSparse::from_builder(builder),
        }
    }

    /// Approximate lookup: `Some(value)` when `key` may be present (the
    /// value is authoritative for true positives), `None` when it is
    /// definitely absent.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        match self.ld.get(key) {
            DenseGet::Found(value) => Some(value),
            DenseGet::Missing => None,
            DenseGet::Descend(node_id) => self.ls.get(key, node_id),
        }
    }

    /// True when some stored key may lie in `[start, end)`. Never a false
    /// negative; suffix ambiguity is treated as "inside".
    pub fn has_range(&self, start: &[u8], end: &[u8]) -> bool {
        if self.ld.height() == 0 && self.ls.height() == 0 {
            return false;
        }
        let mut it = self.iter();
        it.dense_iter.seek(start);
        if !it.dense_iter.valid {
            return false;
        }
        if !it.dense_iter.is_complete() {
            if !it.dense_iter.search_comp {
                it.pass_to_sparse();
                it.sparse_iter.seek(start);
                if !it.sparse_iter.valid {
                    it.incr_dense_iter();
                }
            } else if !it.dense_iter.left_comp {
                it.pass_to_sparse();
                it.sparse_iter.move_to_left_most_key();
            }
        }

        if !it.valid() {
            return false;
        }
        matches!(it.compare(end), SeekCmp::Less | SeekCmp::Ambiguous)
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            dense_iter: DenseIter::new(&self.ld),
            sparse_iter: SparseIter::new(&self.ls),
            key_buf: Vec::new(),
        }
    }

    /// Approximate in-memory footprint in bytes.
    pub fn mem_size(&self) -> usize {
        size_of::<Self>() + self.ld.mem_size() + self.ls.mem_size()
    }

    /// Exact size of [`Surf::marshal`]'s output.
    pub fn marshal_size(&self) -> usize {
        self.ld.marshal_size()
            + self.ls.marshal_size()
            + self.ld.values.marshal_size()
            + self.ls.values.marshal_size()
    }

    /// Serializes the filter: dense block, sparse block, then the dense and
    /// sparse value vectors, every segment little-endian and padded to 8
    /// bytes.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.marshal_size());
        self.ld.write_to(&mut out);
        self.ls.write_to(&mut out);
        self.ld.values.write_to(&mut out);
        self.ls.values.write_to(&mut out);
        out
    }

    /// Streams [`Surf::marshal`] into `w`.
    pub fn write_to<W: std::io::Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&self.marshal())
    }

    /// Reconstructs a filter from [`Surf::marshal`] output. Segment headers
    /// are validated; payload bits are trusted.
    pub fn unmarshal(buf: &[u8]) -> Result<Surf> {
        let (mut ld, rest) = LoudsDense::unmarshal(buf)?;
        let (mut ls, rest) = LoudsSparse::unmarshal(rest)?;
        let (ld_values, rest) = ValueVector::unmarshal(rest)?;
        let (ls_values, _) = ValueVector::unmarshal(rest)?;
        ld.values = ld_values;
        ls.values = ls_values;
        Ok(Surf { ld, ls })
    }
}

/// Ordered cursor over the filter's truncated keys: a dense cursor chained
/// to a sparse cursor through a handoff node id.
pub struct Iter<'s> {
    dense_iter: DenseIter<'s>,
    sparse_iter: SparseIter<'s>,
    key_buf: Vec<u8>,
}

impl Iter<'_> {
    pub fn valid(&self) -> bool {
        self.dense_iter.valid && (self.dense_iter.is_complete() || self.sparse_iter.valid)
    }

    /// The truncated key at the current position: a prefix of the stored
    /// key's bytes, in ascending order across positions.
    ///
    /// The iterator must be valid.
    pub fn key(&mut self) -> &[u8] {
        self.key_buf.clear();
        self.key_buf.extend_from_slice(self.dense_iter.key());
        if !self.dense_iter.is_complete() {
            self.key_buf.extend_from_slice(self.sparse_iter.key());
        }
        &self.key_buf
    }

    /// The value at the current position. The iterator must be valid.
    pub fn value(&self) -> &[u8] {
        if self.dense_iter.is_complete() {
            return self.dense_iter.value();
        }
        self.sparse_iter.value()
    }

    pub fn next(&mut self) {
        if self.incr_sparse_iter() {
            return;
        }
        self.incr_dense_iter();
    }

    pub fn prev(&mut self) {
        if self.decr_sparse_iter() {
            return;
        }
        self.decr_dense_iter();
    }

    /// Positions at the smallest stored key ≥ `key`. Returns `true` when
    /// the landing position may equal `key` exactly; `false` means it moved
    /// strictly past it (or off the end — check [`Iter::valid`]).
    pub fn seek(&mut self, key: &[u8]) -> bool {
        self.reset();

        if self.sparse_iter.height() == 0 && self.dense_iter.height() == 0 {
            return false;
        }

        let fp = self.dense_iter.seek(key);
        if !self.dense_iter.valid || self.dense_iter.is_complete() {
            return fp;
        }

        if !self.dense_iter.search_comp {
            self.pass_to_sparse();
            let fp = self.sparse_iter.seek(key);
            if !self.sparse_iter.valid {
                self.incr_dense_iter();
            }
            fp
        } else if !self.dense_iter.left_comp {
            self.pass_to_sparse();
            self.sparse_iter.move_to_left_most_key();
            fp
        } else {
            unreachable!("dense seek left no handoff");
        }
    }

    pub fn seek_to_first(&mut self) {
        self.reset();
        if self.dense_iter.height() > 0 {
            self.dense_iter.set_to_first_in_root();
            self.dense_iter.move_to_left_most_key();
            if self.dense_iter.left_comp {
                return;
            }
            self.pass_to_sparse();
            self.sparse_iter.move_to_left_most_key();
        } else if self.sparse_iter.height() > 0 {
            self.dense_iter.mark_sparse_only();
            self.sparse_iter.set_to_first_in_root();
            self.sparse_iter.move_to_left_most_key();
        }
    }

    pub fn seek_to_last(&mut self) {
        self.reset();
        if self.dense_iter.height() > 0 {
            self.dense_iter.set_to_last_in_root();
            self.dense_iter.move_to_right_most_key();
            if self.dense_iter.right_comp {
                return;
            }
            self.pass_to_sparse();
            self.sparse_iter.move_to_right_most_key();
        } else if self.sparse_iter.height() > 0 {
            self.dense_iter.mark_sparse_only();
            self.sparse_iter.set_to_last_in_root();
            self.sparse_iter.move_to_right_most_key();
        }
    }

    pub fn reset(&mut self) {
        self.dense_iter.reset();
        self.sparse_iter.reset();
    }

    fn pass_to_sparse(&mut self) {
        self.sparse_iter.start_node_id = self.dense_iter.send_out_node_id;
    }

    fn incr_dense_iter(&mut self) -> bool {
        if !self.dense_iter.valid {
            return false;
        }

        self.dense_iter.next();
        if !self.dense_iter.valid {
            return false;
        }
        if self.dense_iter.left_comp {
            return true;
        }

        self.pass_to_sparse();
        self.sparse_iter.move_to_left_most_key();
        true
    }

    fn incr_sparse_iter(&mut self) -> bool {
        if !self.sparse_iter.valid {
            return false;
        }
        self.sparse_iter.next();
        self.sparse_iter.valid
    }

    fn decr_dense_iter(&mut self) -> bool {
        if !self.dense_iter.valid {
            return false;
        }

        self.dense_iter.prev();
        if !self.dense_iter.valid {
            return false;
        }
        if self.dense_iter.right_comp {
            return true;
        }

        self.pass_to_sparse();
        self.sparse_iter.move_to_right_most_key();
        true
    }

    fn decr_sparse_iter(&mut self) -> bool {
        if !self.sparse_iter.valid {
            return false;
        }
        self.sparse_iter.prev();
        self.sparse_iter.valid
    }

    fn compare(&self, key: &[u8]) -> SeekCmp {
        let cmp = self.dense_iter.compare(key);
        if self.dense_iter.is_complete() || cmp != SeekCmp::Equal {
            return cmp;
        }
        self.sparse_iter.compare(key)
    }
}
