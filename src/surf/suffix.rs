//! # Suffix Vector
//!
//! Per-key suffix bits appended to the trie to cut false positives. Three
//! encodings:
//!
//! - `Hash`: a fingerprint window of the whole key
//! - `Real`: the next `real_len` bits of the key past its branching depth
//! - `Mixed`: hash bits concatenated ahead of real bits
//!
//! Suffixes are packed back to back in a bit vector, `hash_len + real_len`
//! bits each, at most 64 bits total. For `Real` suffixes, a key too short to
//! supply the requested bits stores all zeros, which reads as "no suffix
//! information" rather than a mismatch.
//!
//! Ordering queries use [`SuffixCmp`]: hash bits say nothing about order, so
//! a comparison that cannot prove strict inequality answers
//! `CouldBePositive` and range callers treat the key as possibly present.

use super::bits::{align8, WORD_SIZE};
use super::vectors::{pad_segment, read_words, write_words, BitParts, BitVector};
use eyre::{ensure, eyre, Result};
use xxhash_rust::xxh3::xxh3_64;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

const HASH_SHIFT: u32 = 7;

/// Suffix encoding selector. The discriminants are the on-wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SuffixType {
    #[default]
    None = 0,
    Hash = 1,
    Real = 2,
    Mixed = 3,
}

impl SuffixType {
    fn from_byte(b: u8) -> Option<SuffixType> {
        match b {
            0 => Some(SuffixType::None),
            1 => Some(SuffixType::Hash),
            2 => Some(SuffixType::Real),
            3 => Some(SuffixType::Mixed),
            _ => None,
        }
    }
}

/// Three-valued suffix comparison: stored suffix bits can prove strict
/// inequality, but equality of the stored window only means the key *could*
/// be there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SuffixCmp {
    Less,
    CouldBePositive,
    Greater,
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct SuffixHeader {
    num_bits: U32,
    suffix_type: u8,
    hash_len: U32,
    real_len: U32,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct SuffixVector {
    bv: BitVector,
    suffix_type: SuffixType,
    hash_len: u32,
    real_len: u32,
}

impl SuffixVector {
    pub(crate) fn new(
        suffix_type: SuffixType,
        hash_len: u32,
        real_len: u32,
        parts: BitParts,
    ) -> SuffixVector {
        SuffixVector {
            bv: BitVector::new(parts),
            suffix_type,
            hash_len,
            real_len,
        }
    }

    fn suffix_len(&self) -> u32 {
        self.hash_len + self.real_len
    }

    /// True when the stored suffix does not rule out `key`; `level` is the
    /// depth just past the key's last trie byte.
    pub(crate) fn check_equality(&self, idx: u32, key: &[u8], level: u32) -> bool {
        if self.suffix_type == SuffixType::None {
            return true;
        }
        if idx * self.suffix_len() >= self.bv.num_bits() {
            return false;
        }

        let suffix = self.read(idx);
        if self.suffix_type == SuffixType::Real {
            if suffix == 0 {
                return true;
            }
            let klen = key.len() as u32;
            if klen < level || (klen - level) * 8 < self.real_len {
                return false;
            }
        }
        suffix
            == construct_suffix(
                key,
                level,
                self.suffix_type,
                self.real_len,
                self.hash_len,
            )
    }

    /// Orders `key` against the stored suffix at `idx`. Hash bits carry no
    /// order, so only real bits can produce `Less`/`Greater`.
    pub(crate) fn compare(&self, key: &[u8], idx: u32, level: u32) -> SuffixCmp {
        if idx * self.suffix_len() >= self.bv.num_bits()
            || self.suffix_type == SuffixType::None
            || self.suffix_type == SuffixType::Hash
        {
            return SuffixCmp::CouldBePositive;
        }

        let mut suffix = self.read(idx);
        if self.suffix_type == SuffixType::Mixed {
            suffix &= (1u64 << self.real_len) - 1;
        }
        let expected = construct_real_suffix(key, level, self.real_len);

        if suffix == 0 && expected == 0 {
            SuffixCmp::CouldBePositive
        } else if suffix == 0 || suffix < expected {
            SuffixCmp::Less
        } else if suffix == expected {
            SuffixCmp::CouldBePositive
        } else {
            SuffixCmp::Greater
        }
    }

    fn read(&self, idx: u32) -> u64 {
        let suffix_len = self.suffix_len();
        let bit_pos = idx * suffix_len;
        let word_off = (bit_pos / WORD_SIZE) as usize;
        let bits_off = bit_pos % WORD_SIZE;

        let words = self.bv.words();
        let mut result = (words[word_off] << bits_off) >> (WORD_SIZE - suffix_len);
        if bits_off + suffix_len > WORD_SIZE {
            result += words[word_off + 1] >> (2 * WORD_SIZE - bits_off - suffix_len);
        }
        result
    }

    pub(crate) fn mem_size(&self) -> usize {
        size_of::<Self>() + self.bv.bits_size()
    }

    fn raw_marshal_size(&self) -> usize {
        13 + self.bv.bits_size()
    }

    pub(crate) fn marshal_size(&self) -> usize {
        align8(self.raw_marshal_size())
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        let start = out.len();
        let header = SuffixHeader {
            num_bits: U32::new(self.bv.num_bits()),
            suffix_type: self.suffix_type as u8,
            hash_len: U32::new(self.hash_len),
            real_len: U32::new(self.real_len),
        };
        out.extend_from_slice(header.as_bytes());
        write_words(out, self.bv.words());
        pad_segment(out, start);
    }

    pub(crate) fn unmarshal(buf: &[u8]) -> Result<(SuffixVector, &[u8])> {
        ensure!(buf.len() >= 13, "suffix vector header truncated");
        let header = SuffixHeader::ref_from_bytes(&buf[..13])
            .map_err(|e| eyre!("failed to parse suffix vector header: {e:?}"))?;
        let num_bits = header.num_bits.get();
        let suffix_type = SuffixType::from_byte(header.suffix_type)
            .ok_or_else(|| eyre!("invalid suffix type: {}", header.suffix_type))?;

        let n_words = BitVector::words_for(num_bits);
        let bits = read_words(&buf[13..], n_words)?;

        let cursor = align8(13 + n_words * 8);
        ensure!(buf.len() >= cursor, "suffix vector padding truncated");
        Ok((
            SuffixVector {
                bv: BitVector::from_raw(num_bits, bits),
                suffix_type,
                hash_len: header.hash_len.get(),
                real_len: header.real_len.get(),
            },
            &buf[cursor..],
        ))
    }
}

pub(crate) fn construct_suffix(
    key: &[u8],
    level: u32,
    suffix_type: SuffixType,
    real_len: u32,
    hash_len: u32,
) -> u64 {
    match suffix_type {
        SuffixType::Hash => construct_hash_suffix(key, hash_len),
        SuffixType::Real => construct_real_suffix(key, level, real_len),
        SuffixType::Mixed => {
            let hs = construct_hash_suffix(key, hash_len);
            let rs = construct_real_suffix(key, level, real_len);
            (hs << real_len) | rs
        }
        SuffixType::None => 0,
    }
}

fn construct_hash_suffix(key: &[u8], hash_len: u32) -> u64 {
    if hash_len == 0 {
        return 0;
    }
    let mut fp = xxh3_64(key);
    fp <<= WORD_SIZE - hash_len - HASH_SHIFT;
    fp >>= WORD_SIZE - hash_len;
    fp
}

fn construct_real_suffix(key: &[u8], level: u32, real_len: u32) -> u64 {
    let klen = key.len() as u32;
    if klen < level || (klen - level) * 8 < real_len {
        return 0;
    }

    let level = level as usize;
    let mut suffix = 0u64;
    let nbytes = (real_len / 8) as usize;
    if nbytes > 0 {
        suffix += key[level] as u64;
        for i in 1..nbytes {
            suffix <<= 8;
            suffix += key[level + i] as u64;
        }
    }

    let off = real_len % 8;
    if off > 0 {
        suffix <<= off;
        suffix += (key[level + nbytes] >> (8 - off)) as u64;
    }

    suffix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surf::bits::set_bit;

    fn single_key_vector(
        suffix_type: SuffixType,
        hash_len: u32,
        real_len: u32,
        key: &[u8],
        level: u32,
    ) -> SuffixVector {
        let suffix_len = hash_len + real_len;
        let suffix = construct_suffix(key, level, suffix_type, real_len, hash_len);
        let mut words = vec![0u64; 1];
        for bit in 0..suffix_len {
            if suffix & (1 << (suffix_len - 1 - bit)) != 0 {
                set_bit(&mut words, bit);
            }
        }
        let parts: Vec<(&[u64], u32)> = vec![(&words, suffix_len)];
        SuffixVector::new(suffix_type, hash_len, real_len, &parts)
    }

    #[test]
    fn real_suffix_takes_bits_past_the_branch() {
        // 0xAB = 1010_1011; 12 bits from level 1: 0xAB then high nibble of 0xCD.
        let key = [0x01, 0xAB, 0xCD];
        assert_eq!(construct_real_suffix(&key, 1, 12), 0xABC);
        assert_eq!(construct_real_suffix(&key, 1, 16), 0xABCD);
        assert_eq!(construct_real_suffix(&key, 1, 3), 0b101);
        assert_eq!(construct_real_suffix(&key, 3, 8), 0, "key exhausted");
    }

    #[test]
    fn check_equality_real() {
        let key = [1u8, 2, 3, 4];
        let sv = single_key_vector(SuffixType::Real, 0, 16, &key, 2);

        assert!(sv.check_equality(0, &key, 2));
        assert!(!sv.check_equality(0, &[1u8, 2, 9, 9], 2));
        assert!(!sv.check_equality(0, &[1u8, 2], 2), "too short to match");
        assert!(!sv.check_equality(1, &key, 2), "index out of stored range");
    }

    #[test]
    fn check_equality_hash_and_mixed() {
        let key = [9u8, 8, 7, 6, 5];
        for (ty, hl, rl) in [(SuffixType::Hash, 8, 0), (SuffixType::Mixed, 4, 8)] {
            let sv = single_key_vector(ty, hl, rl, &key, 1);
            assert!(sv.check_equality(0, &key, 1));
        }
    }

    #[test]
    fn zero_real_suffix_is_ambiguous() {
        let key = [1u8];
        let sv = single_key_vector(SuffixType::Real, 0, 16, &key, 1);
        // Key exhausted at the branch: stored suffix is zero, nothing to disprove.
        assert!(sv.check_equality(0, &key, 1));
        assert!(sv.check_equality(0, &[1u8, 200], 1));
        assert_eq!(sv.compare(&[1u8], 0, 1), SuffixCmp::CouldBePositive);
    }

    #[test]
    fn compare_orders_real_bits() {
        let key = [1u8, 50];
        let sv = single_key_vector(SuffixType::Real, 0, 8, &key, 1);

        assert_eq!(sv.compare(&[1u8, 10], 0, 1), SuffixCmp::Greater);
        assert_eq!(sv.compare(&[1u8, 50], 0, 1), SuffixCmp::CouldBePositive);
        assert_eq!(sv.compare(&[1u8, 90], 0, 1), SuffixCmp::Less);
    }

    #[test]
    fn compare_is_ambiguous_for_hash() {
        let key = [1u8, 50];
        let sv = single_key_vector(SuffixType::Hash, 8, 0, &key, 1);
        assert_eq!(sv.compare(&[1u8, 90], 0, 1), SuffixCmp::CouldBePositive);
    }

    #[test]
    fn roundtrip() {
        let key = [3u8, 1, 4, 1, 5];
        let sv = single_key_vector(SuffixType::Mixed, 6, 10, &key, 2);

        let mut buf = Vec::new();
        sv.write_to(&mut buf);
        assert_eq!(buf.len(), sv.marshal_size());

        let (decoded, rest) = SuffixVector::unmarshal(&buf).unwrap();
        assert!(rest.is_empty());
        assert!(decoded.check_equality(0, &key, 2));
        assert_eq!(decoded.read(0), sv.read(0));
    }

    #[test]
    fn unmarshal_rejects_bad_type() {
        let key = [1u8, 2];
        let sv = single_key_vector(SuffixType::Real, 0, 8, &key, 1);
        let mut buf = Vec::new();
        sv.write_to(&mut buf);
        buf[4] = 9;
        assert!(SuffixVector::unmarshal(&buf).is_err());
    }
}
