//! # Succinct Bit and Value Vectors
//!
//! The storage layer of the filter: a plain bit vector plus the rank, select,
//! and value vectors layered on top of it.
//!
//! ## Construction
//!
//! Builders accumulate bits level by level; `BitVector::new` concatenates the
//! per-level word arrays into one contiguous MSB-first bit stream, shifting
//! across word boundaries so no level is padded.
//!
//! ## Acceleration Structures
//!
//! - **Rank**: a 32-bit running total per block (64-bit blocks for the dense
//!   levels, 512-bit blocks for the sparse levels); `rank(pos)` is one table
//!   load plus a popcount over the remainder of the block.
//! - **Select**: the position of every 64th set bit is sampled into a lookup
//!   table; `select(k)` resumes from the nearest sample and advances by
//!   popcount, finishing with a broadword in-word select.
//!
//! ## Serialization
//!
//! Every vector marshals as a little-endian header struct followed by its raw
//! word/byte payload, padded to an 8-byte boundary. Unmarshal validates the
//! headers and copies the payloads out of the caller's buffer; the resulting
//! vector owns its storage.

use super::bits::{align8, popcount_block, read_bit, select64, WORD_SIZE};
use eyre::{ensure, eyre, Result};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub(crate) const RANK_DENSE_BLOCK_SIZE: u32 = 64;
pub(crate) const RANK_SPARSE_BLOCK_SIZE: u32 = 512;

const SELECT_SAMPLE_INTERVAL: u32 = 64;

/// `(words, bit count)` pairs, one per builder level, concatenated in order.
pub(crate) type BitParts<'a> = &'a [(&'a [u64], u32)];

pub(crate) fn write_words(out: &mut Vec<u8>, words: &[u64]) {
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
}

fn write_u32s(out: &mut Vec<u8>, vals: &[u32]) {
    for v in vals {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

pub(crate) fn read_words(buf: &[u8], n_words: usize) -> Result<Vec<u64>> {
    ensure!(
        buf.len() >= n_words * 8,
        "bit payload truncated: {} < {}",
        buf.len(),
        n_words * 8
    );
    Ok(buf[..n_words * 8]
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

fn read_u32s(buf: &[u8], n: usize) -> Result<Vec<u32>> {
    ensure!(
        buf.len() >= n * 4,
        "lookup table truncated: {} < {}",
        buf.len(),
        n * 4
    );
    Ok(buf[..n * 4]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

/// Pads `out` with zeros to an 8-byte boundary relative to `start`.
pub(crate) fn pad_segment(out: &mut Vec<u8>, start: usize) {
    let raw = out.len() - start;
    out.resize(start + align8(raw), 0);
}

#[derive(Debug, Default, Clone)]
pub(crate) struct BitVector {
    num_bits: u32,
    bits: Vec<u64>,
}

impl BitVector {
    pub(crate) fn words_for(num_bits: u32) -> usize {
        num_bits.div_ceil(WORD_SIZE) as usize
    }

    /// Concatenates per-level bit runs into one contiguous vector, shifting
    /// across word boundaries.
    pub(crate) fn new(parts: BitParts) -> BitVector {
        let num_bits: u32 = parts.iter().map(|p| p.1).sum();
        let mut bits = vec![0u64; Self::words_for(num_bits)];

        let mut word_id = 0usize;
        let mut bit_shift = 0u32;
        for &(words, nbits) in parts {
            if nbits == 0 {
                continue;
            }

            let n_complete = (nbits / WORD_SIZE) as usize;
            for word in words.iter().take(n_complete) {
                bits[word_id] |= word >> bit_shift;
                word_id += 1;
                if bit_shift > 0 {
                    bits[word_id] |= word << (WORD_SIZE - bit_shift);
                }
            }

            let remain = nbits % WORD_SIZE;
            if remain > 0 {
                let last = words[n_complete];
                bits[word_id] |= last >> bit_shift;
                if bit_shift + remain <= WORD_SIZE {
                    bit_shift = (bit_shift + remain) % WORD_SIZE;
                    if bit_shift == 0 {
                        word_id += 1;
                    }
                } else {
                    word_id += 1;
                    bits[word_id] |= last << (WORD_SIZE - bit_shift);
                    bit_shift = bit_shift + remain - WORD_SIZE;
                }
            }
        }

        BitVector { num_bits, bits }
    }

    pub(crate) fn from_raw(num_bits: u32, bits: Vec<u64>) -> BitVector {
        BitVector { num_bits, bits }
    }

    pub(crate) fn num_bits(&self) -> u32 {
        self.num_bits
    }

    pub(crate) fn words(&self) -> &[u64] {
        &self.bits
    }

    fn num_words(&self) -> usize {
        Self::words_for(self.num_bits)
    }

    /// Size of the serialized word payload in bytes.
    pub(crate) fn bits_size(&self) -> usize {
        self.num_words() * 8
    }

    pub(crate) fn is_set(&self, pos: u32) -> bool {
        read_bit(&self.bits, pos)
    }

    /// Distance from `pos` to the next set bit. The position arithmetic
    /// deliberately wraps: iterators enter a node by probing `first_slot - 1`,
    /// which is `u32::MAX` for the root.
    pub(crate) fn distance_to_next_set_bit(&self, pos: u32) -> u32 {
        let mut distance = 1u32;
        let probe = pos.wrapping_add(1);
        let mut word_off = (probe / WORD_SIZE) as usize;
        let bits_off = probe % WORD_SIZE;

        if word_off >= self.bits.len() {
            return 0;
        }

        let test_bits = self.bits[word_off] << bits_off;
        if test_bits > 0 {
            return distance + test_bits.leading_zeros();
        }

        let num_words = self.num_words();
        if word_off == num_words - 1 {
            return self.num_bits.wrapping_sub(pos);
        }
        distance += WORD_SIZE - bits_off;

        while word_off < num_words - 1 {
            word_off += 1;
            let test_bits = self.bits[word_off];
            if test_bits > 0 {
                return distance + test_bits.leading_zeros();
            }
            distance += WORD_SIZE;
        }

        if word_off == num_words - 1 && self.num_bits % WORD_SIZE != 0 {
            distance -= WORD_SIZE - self.num_bits % WORD_SIZE;
        }

        distance
    }

    /// Distance from `pos` back to the previous set bit; 0 when `pos` is 0.
    pub(crate) fn distance_to_prev_set_bit(&self, pos: u32) -> u32 {
        if pos == 0 {
            return 0;
        }
        let mut distance = 1u32;
        let mut word_off = ((pos - 1) / WORD_SIZE) as usize;
        let bits_off = (pos - 1) % WORD_SIZE;

        let test_bits = self.bits[word_off] >> (WORD_SIZE - 1 - bits_off);
        if test_bits > 0 {
            return distance + test_bits.trailing_zeros();
        }
        distance += bits_off + 1;

        while word_off > 0 {
            word_off -= 1;
            let test_bits = self.bits[word_off];
            if test_bits > 0 {
                return distance + test_bits.trailing_zeros();
            }
            distance += WORD_SIZE;
        }
        distance
    }
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct RankHeader {
    num_bits: U32,
    block_size: U32,
}

/// Bit vector with a per-block rank lookup table.
#[derive(Debug, Default, Clone)]
pub(crate) struct RankVector {
    bv: BitVector,
    block_size: u32,
    rank_lut: Vec<u32>,
}

impl RankVector {
    pub(crate) fn new(block_size: u32, parts: BitParts) -> RankVector {
        let bv = BitVector::new(parts);
        let word_per_blk = block_size / WORD_SIZE;
        let nblks = bv.num_bits() / block_size + 1;
        let mut rank_lut = vec![0u32; nblks as usize];

        let mut total_rank = 0;
        for i in 0..nblks - 1 {
            rank_lut[i as usize] = total_rank;
            total_rank += popcount_block(bv.words(), i * word_per_blk, block_size);
        }
        rank_lut[(nblks - 1) as usize] = total_rank;

        RankVector {
            bv,
            block_size,
            rank_lut,
        }
    }

    pub(crate) fn num_bits(&self) -> u32 {
        self.bv.num_bits()
    }

    pub(crate) fn is_set(&self, pos: u32) -> bool {
        self.bv.is_set(pos)
    }

    pub(crate) fn distance_to_next_set_bit(&self, pos: u32) -> u32 {
        self.bv.distance_to_next_set_bit(pos)
    }

    pub(crate) fn distance_to_prev_set_bit(&self, pos: u32) -> u32 {
        self.bv.distance_to_prev_set_bit(pos)
    }

    /// Number of set bits in positions `[0, pos]`.
    pub(crate) fn rank(&self, pos: u32) -> u32 {
        let word_per_blk = self.block_size / WORD_SIZE;
        let block_off = pos / self.block_size;
        let bits_off = pos % self.block_size;

        self.rank_lut[block_off as usize]
            + popcount_block(self.bv.words(), block_off * word_per_blk, bits_off + 1)
    }

    fn lut_size(&self) -> usize {
        ((self.bv.num_bits() / self.block_size + 1) * 4) as usize
    }

    pub(crate) fn mem_size(&self) -> usize {
        size_of::<Self>() + self.bv.bits_size() + self.lut_size()
    }

    fn raw_marshal_size(&self) -> usize {
        8 + self.bv.bits_size() + self.lut_size()
    }

    pub(crate) fn marshal_size(&self) -> usize {
        align8(self.raw_marshal_size())
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        let start = out.len();
        let header = RankHeader {
            num_bits: U32::new(self.bv.num_bits()),
            block_size: U32::new(self.block_size),
        };
        out.extend_from_slice(header.as_bytes());
        write_words(out, self.bv.words());
        write_u32s(out, &self.rank_lut);
        pad_segment(out, start);
    }

    pub(crate) fn unmarshal(buf: &[u8]) -> Result<(RankVector, &[u8])> {
        ensure!(buf.len() >= 8, "rank vector header truncated");
        let header = RankHeader::ref_from_bytes(&buf[..8])
            .map_err(|e| eyre!("failed to parse rank vector header: {e:?}"))?;
        let num_bits = header.num_bits.get();
        let block_size = header.block_size.get();
        ensure!(
            block_size == RANK_DENSE_BLOCK_SIZE || block_size == RANK_SPARSE_BLOCK_SIZE,
            "invalid rank block size: {block_size}"
        );

        let mut cursor = 8;
        let n_words = BitVector::words_for(num_bits);
        let bits = read_words(&buf[cursor..], n_words)?;
        cursor += n_words * 8;

        let n_lut = (num_bits / block_size + 1) as usize;
        let rank_lut = read_u32s(&buf[cursor..], n_lut)?;
        cursor = align8(cursor + n_lut * 4);
        ensure!(buf.len() >= cursor, "rank vector payload truncated");

        Ok((
            RankVector {
                bv: BitVector::from_raw(num_bits, bits),
                block_size,
                rank_lut,
            },
            &buf[cursor..],
        ))
    }
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct SelectHeader {
    num_bits: U32,
    num_ones: U32,
}

/// Bit vector with sampled select acceleration: the position of every 64th
/// set bit is recorded, and queries resume from the nearest sample.
#[derive(Debug, Default, Clone)]
pub(crate) struct SelectVector {
    bv: BitVector,
    num_ones: u32,
    select_lut: Vec<u32>,
}

impl SelectVector {
    pub(crate) fn new(parts: BitParts) -> SelectVector {
        let bv = BitVector::new(parts);

        let mut lut = vec![0u32];
        let mut sampled_ones = SELECT_SAMPLE_INTERVAL;
        let mut ones_upto_word = 0u32;
        for (i, w) in bv.words().iter().enumerate() {
            let ones = w.count_ones();
            while sampled_ones <= ones_upto_word + ones {
                let diff = sampled_ones - ones_upto_word;
                lut.push(i as u32 * WORD_SIZE + select64(*w, diff));
                sampled_ones += SELECT_SAMPLE_INTERVAL;
            }
            ones_upto_word += ones;
        }

        SelectVector {
            bv,
            num_ones: ones_upto_word,
            select_lut: lut,
        }
    }

    pub(crate) fn num_bits(&self) -> u32 {
        self.bv.num_bits()
    }

    pub(crate) fn num_ones(&self) -> u32 {
        self.num_ones
    }

    pub(crate) fn is_set(&self, pos: u32) -> bool {
        self.bv.is_set(pos)
    }

    pub(crate) fn distance_to_next_set_bit(&self, pos: u32) -> u32 {
        self.bv.distance_to_next_set_bit(pos)
    }

    /// Position of the `rank`-th set bit; `rank` is one-based, the position
    /// zero-based. Sample 0 is pinned to position 0, which holds for the
    /// louds vector because slot 0 always starts a node.
    pub(crate) fn select(&self, rank: u32) -> u32 {
        let lut_idx = rank / SELECT_SAMPLE_INTERVAL;
        let mut rank_left = rank % SELECT_SAMPLE_INTERVAL;
        if lut_idx == 0 {
            rank_left -= 1;
        }

        let pos = self.select_lut[lut_idx as usize];
        if rank_left == 0 {
            return pos;
        }

        let mut word_off = pos / WORD_SIZE;
        let mut bits_off = pos % WORD_SIZE;
        if bits_off == WORD_SIZE - 1 {
            word_off += 1;
            bits_off = 0;
        } else {
            bits_off += 1;
        }

        let mut w = self.bv.words()[word_off as usize] << bits_off >> bits_off;
        let mut ones = w.count_ones();
        while ones < rank_left {
            word_off += 1;
            w = self.bv.words()[word_off as usize];
            rank_left -= ones;
            ones = w.count_ones();
        }

        word_off * WORD_SIZE + select64(w, rank_left)
    }

    fn lut_size(&self) -> usize {
        ((self.num_ones / SELECT_SAMPLE_INTERVAL + 1) * 4) as usize
    }

    pub(crate) fn mem_size(&self) -> usize {
        size_of::<Self>() + self.bv.bits_size() + self.lut_size()
    }

    fn raw_marshal_size(&self) -> usize {
        8 + self.bv.bits_size() + self.lut_size()
    }

    pub(crate) fn marshal_size(&self) -> usize {
        align8(self.raw_marshal_size())
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        let start = out.len();
        let header = SelectHeader {
            num_bits: U32::new(self.bv.num_bits()),
            num_ones: U32::new(self.num_ones),
        };
        out.extend_from_slice(header.as_bytes());
        write_words(out, self.bv.words());
        write_u32s(out, &self.select_lut);
        pad_segment(out, start);
    }

    pub(crate) fn unmarshal(buf: &[u8]) -> Result<(SelectVector, &[u8])> {
        ensure!(buf.len() >= 8, "select vector header truncated");
        let header = SelectHeader::ref_from_bytes(&buf[..8])
            .map_err(|e| eyre!("failed to parse select vector header: {e:?}"))?;
        let num_bits = header.num_bits.get();
        let num_ones = header.num_ones.get();

        let mut cursor = 8;
        let n_words = BitVector::words_for(num_bits);
        let bits = read_words(&buf[cursor..], n_words)?;
        cursor += n_words * 8;

        let n_lut = (num_ones / SELECT_SAMPLE_INTERVAL + 1) as usize;
        let select_lut = read_u32s(&buf[cursor..], n_lut)?;
        cursor = align8(cursor + n_lut * 4);
        ensure!(buf.len() >= cursor, "select vector payload truncated");

        Ok((
            SelectVector {
                bv: BitVector::from_raw(num_bits, bits),
                num_ones,
                select_lut,
            },
            &buf[cursor..],
        ))
    }
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct ValueHeader {
    num_bytes: U32,
    value_size: U32,
}

/// Fixed-width values in trie order, indexed by the same rank that locates a
/// key's suffix.
#[derive(Debug, Default, Clone)]
pub(crate) struct ValueVector {
    bytes: Vec<u8>,
    value_size: u32,
}

impl ValueVector {
    pub(crate) fn new(parts: &[&[u8]], value_size: u32) -> ValueVector {
        let mut bytes = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
        for part in parts {
            bytes.extend_from_slice(part);
        }
        ValueVector { bytes, value_size }
    }

    pub(crate) fn get(&self, pos: u32) -> &[u8] {
        let off = (pos * self.value_size) as usize;
        &self.bytes[off..off + self.value_size as usize]
    }

    pub(crate) fn mem_size(&self) -> usize {
        size_of::<Self>() + self.bytes.len()
    }

    fn raw_marshal_size(&self) -> usize {
        8 + self.bytes.len()
    }

    pub(crate) fn marshal_size(&self) -> usize {
        align8(self.raw_marshal_size())
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        let start = out.len();
        let header = ValueHeader {
            num_bytes: U32::new(self.bytes.len() as u32),
            value_size: U32::new(self.value_size),
        };
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.bytes);
        pad_segment(out, start);
    }

    pub(crate) fn unmarshal(buf: &[u8]) -> Result<(ValueVector, &[u8])> {
        ensure!(buf.len() >= 8, "value vector header truncated");
        let header = ValueHeader::ref_from_bytes(&buf[..8])
            .map_err(|e| eyre!("failed to parse value vector header: {e:?}"))?;
        let num_bytes = header.num_bytes.get() as usize;
        let value_size = header.value_size.get();

        let cursor = align8(8 + num_bytes);
        ensure!(buf.len() >= 8 + num_bytes, "value vector payload truncated");
        let bytes = buf[8..8 + num_bytes].to_vec();
        ensure!(buf.len() >= cursor, "value vector padding truncated");

        Ok((ValueVector { bytes, value_size }, &buf[cursor..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surf::bits::set_bit;

    fn bv_from_positions(num_bits: u32, ones: &[u32]) -> Vec<u64> {
        let mut words = vec![0u64; BitVector::words_for(num_bits)];
        for &pos in ones {
            set_bit(&mut words, pos);
        }
        words
    }

    #[test]
    fn bit_vector_concatenates_levels() {
        let level0 = bv_from_positions(3, &[0, 2]);
        let level1 = bv_from_positions(70, &[0, 69]);
        let parts: Vec<(&[u64], u32)> = vec![(&level0, 3), (&level1, 70)];
        let bv = BitVector::new(&parts);

        assert_eq!(bv.num_bits(), 73);
        assert!(bv.is_set(0));
        assert!(!bv.is_set(1));
        assert!(bv.is_set(2));
        assert!(bv.is_set(3), "level 1 bit 0 lands at position 3");
        assert!(bv.is_set(72), "level 1 bit 69 lands at position 72");
        assert!(!bv.is_set(71));
    }

    #[test]
    fn distance_to_next_set_bit() {
        let words = bv_from_positions(100, &[5, 64, 99]);
        let parts: Vec<(&[u64], u32)> = vec![(&words, 100)];
        let bv = BitVector::new(&parts);

        assert_eq!(bv.distance_to_next_set_bit(0), 5);
        assert_eq!(bv.distance_to_next_set_bit(5), 59);
        assert_eq!(bv.distance_to_next_set_bit(64), 35);
        assert_eq!(bv.distance_to_next_set_bit(4294967295), 6, "wraps for root entry");
    }

    #[test]
    fn distance_to_prev_set_bit() {
        let words = bv_from_positions(100, &[5, 64, 99]);
        let parts: Vec<(&[u64], u32)> = vec![(&words, 100)];
        let bv = BitVector::new(&parts);

        assert_eq!(bv.distance_to_prev_set_bit(0), 0);
        assert_eq!(bv.distance_to_prev_set_bit(6), 1);
        assert_eq!(bv.distance_to_prev_set_bit(64), 59);
        assert_eq!(bv.distance_to_prev_set_bit(99), 35);
    }

    #[test]
    fn rank_counts_inclusive_prefix() {
        let ones = [0u32, 3, 64, 128, 600];
        let words = bv_from_positions(601, &ones);
        let parts: Vec<(&[u64], u32)> = vec![(&words, 601)];

        for block_size in [RANK_DENSE_BLOCK_SIZE, RANK_SPARSE_BLOCK_SIZE] {
            let rv = RankVector::new(block_size, &parts);
            assert_eq!(rv.rank(0), 1);
            assert_eq!(rv.rank(2), 1);
            assert_eq!(rv.rank(3), 2);
            assert_eq!(rv.rank(63), 2);
            assert_eq!(rv.rank(64), 3);
            assert_eq!(rv.rank(599), 4);
            assert_eq!(rv.rank(600), 5);
        }
    }

    #[test]
    fn select_inverts_rank() {
        let ones: Vec<u32> = (0..300).map(|i| i * 3).collect();
        let words = bv_from_positions(1000, &ones);
        let parts: Vec<(&[u64], u32)> = vec![(&words, 1000)];
        let sv = SelectVector::new(&parts);

        assert_eq!(sv.num_ones(), 300);
        for (i, &pos) in ones.iter().enumerate() {
            assert_eq!(sv.select(i as u32 + 1), pos, "select({})", i + 1);
        }
    }

    #[test]
    fn rank_vector_roundtrip() {
        let words = bv_from_positions(100, &[1, 50, 99]);
        let parts: Vec<(&[u64], u32)> = vec![(&words, 100)];
        let rv = RankVector::new(RANK_SPARSE_BLOCK_SIZE, &parts);

        let mut buf = Vec::new();
        rv.write_to(&mut buf);
        assert_eq!(buf.len(), rv.marshal_size());

        let (decoded, rest) = RankVector::unmarshal(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded.num_bits(), 100);
        for pos in 0..100 {
            assert_eq!(decoded.rank(pos), rv.rank(pos));
            assert_eq!(decoded.is_set(pos), rv.is_set(pos));
        }
    }

    #[test]
    fn select_vector_roundtrip() {
        let ones: Vec<u32> = (0..200).map(|i| i * 5).collect();
        let words = bv_from_positions(1000, &ones);
        let parts: Vec<(&[u64], u32)> = vec![(&words, 1000)];
        let sv = SelectVector::new(&parts);

        let mut buf = Vec::new();
        sv.write_to(&mut buf);
        assert_eq!(buf.len(), sv.marshal_size());

        let (decoded, rest) = SelectVector::unmarshal(&buf).unwrap();
        assert!(rest.is_empty());
        for rank in 1..=200 {
            assert_eq!(decoded.select(rank), sv.select(rank));
        }
    }

    #[test]
    fn value_vector_roundtrip() {
        let parts: Vec<&[u8]> = vec![b"aabb", b"ccdd"];
        let vv = ValueVector::new(&parts, 2);
        assert_eq!(vv.get(0), b"aa");
        assert_eq!(vv.get(3), b"dd");

        let mut buf = Vec::new();
        vv.write_to(&mut buf);
        assert_eq!(buf.len(), vv.marshal_size());

        let (decoded, rest) = ValueVector::unmarshal(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded.get(1), b"bb");
        assert_eq!(decoded.get(2), b"cc");
    }

    #[test]
    fn unmarshal_rejects_truncated_buffers() {
        let words = bv_from_positions(100, &[1, 50, 99]);
        let parts: Vec<(&[u64], u32)> = vec![(&words, 100)];
        let rv = RankVector::new(RANK_DENSE_BLOCK_SIZE, &parts);

        let mut buf = Vec::new();
        rv.write_to(&mut buf);
        assert!(RankVector::unmarshal(&buf[..4]).is_err());
        assert!(RankVector::unmarshal(&buf[..12]).is_err());
    }
}
