//! # Sparse Label Vector
//!
//! Concatenated per-node label bytes for the LOUDS-Sparse levels. A node's
//! labels are contiguous and sorted, with the reserved terminator byte `0xFF`
//! allowed only in the first slot. Lookups scan the node's byte range; the
//! fan-out is at most 256, so linear and binary scans are both cheap.

use super::bits::align8;
use super::builder::LABEL_TERMINATOR;
use eyre::{ensure, eyre, Result};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct LabelHeader {
    num_bytes: U32,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct LabelVector {
    labels: Vec<u8>,
}

impl LabelVector {
    /// Concatenates per-level label streams, with one trailing zero byte so
    /// node-boundary probes never index past the end.
    pub(crate) fn new(parts: &[&[u8]]) -> LabelVector {
        let mut labels = Vec::with_capacity(parts.iter().map(|p| p.len()).sum::<usize>() + 1);
        for part in parts {
            labels.extend_from_slice(part);
        }
        labels.push(0);
        LabelVector { labels }
    }

    pub(crate) fn label(&self, pos: u32) -> u8 {
        self.labels[pos as usize]
    }

    /// Scans the `size` labels starting at `start` for `k`, skipping a
    /// leading terminator. Returns `(start, false)` when absent.
    pub(crate) fn search(&self, k: u8, start: u32, size: u32) -> (u32, bool) {
        let (mut from, mut size) = (start, size);
        if size > 1 && self.labels[from as usize] == LABEL_TERMINATOR {
            from += 1;
            size -= 1;
        }

        let end = (from + size).min(self.labels.len() as u32);
        match self.labels[from as usize..end as usize]
            .iter()
            .position(|&l| l == k)
        {
            Some(i) => (from + i as u32, true),
            None => (start, false),
        }
    }

    /// First label strictly greater than `label` within the node; when none
    /// exists, returns the node's last slot and `false`.
    pub(crate) fn search_greater_than(&self, label: u8, pos: u32, size: u32) -> (u32, bool) {
        let (mut pos, mut size) = (pos, size);
        if size > 1 && self.labels[pos as usize] == LABEL_TERMINATOR {
            pos += 1;
            size -= 1;
        }

        let node = &self.labels[pos as usize..(pos + size) as usize];
        match node.partition_point(|&l| l <= label) {
            i if i as u32 == size => (pos + size - 1, false),
            i => (pos + i as u32, true),
        }
    }

    pub(crate) fn mem_size(&self) -> usize {
        size_of::<Self>() + self.labels.len()
    }

    fn raw_marshal_size(&self) -> usize {
        4 + self.labels.len()
    }

    pub(crate) fn marshal_size(&self) -> usize {
        align8(self.raw_marshal_size())
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        let start = out.len();
        let header = LabelHeader {
            num_bytes: U32::new(self.labels.len() as u32),
        };
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.labels);
        super::vectors::pad_segment(out, start);
    }

    pub(crate) fn unmarshal(buf: &[u8]) -> Result<(LabelVector, &[u8])> {
        ensure!(buf.len() >= 4, "label vector header truncated");
        let header = LabelHeader::ref_from_bytes(&buf[..4])
            .map_err(|e| eyre!("failed to parse label vector header: {e:?}"))?;
        let num_bytes = header.num_bytes.get() as usize;

        ensure!(
            buf.len() >= 4 + num_bytes,
            "label vector payload truncated: {} < {}",
            buf.len(),
            4 + num_bytes
        );
        let labels = buf[4..4 + num_bytes].to_vec();

        let cursor = align8(4 + num_bytes);
        ensure!(buf.len() >= cursor, "label vector padding truncated");
        Ok((LabelVector { labels }, &buf[cursor..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_within_node() {
        let parts: Vec<&[u8]> = vec![&[2, 5, 9], &[1, 7]];
        let lv = LabelVector::new(&parts);

        assert_eq!(lv.search(5, 0, 3), (1, true));
        assert_eq!(lv.search(9, 0, 3), (2, true));
        assert_eq!(lv.search(6, 0, 3), (0, false));
        assert_eq!(lv.search(7, 3, 2), (4, true));
    }

    #[test]
    fn search_skips_leading_terminator() {
        let parts: Vec<&[u8]> = vec![&[LABEL_TERMINATOR, 4, 8]];
        let lv = LabelVector::new(&parts);

        assert_eq!(lv.search(4, 0, 3), (1, true));
        assert_eq!(lv.search(LABEL_TERMINATOR, 0, 3), (0, false));
    }

    #[test]
    fn search_greater_than_lands_on_next_label() {
        let parts: Vec<&[u8]> = vec![&[2, 5, 9]];
        let lv = LabelVector::new(&parts);

        assert_eq!(lv.search_greater_than(1, 0, 3), (0, true));
        assert_eq!(lv.search_greater_than(2, 0, 3), (1, true));
        assert_eq!(lv.search_greater_than(5, 0, 3), (2, true));
        assert_eq!(lv.search_greater_than(9, 0, 3), (2, false));
    }

    #[test]
    fn roundtrip() {
        let parts: Vec<&[u8]> = vec![&[1, 2, 3], &[200, 255]];
        let lv = LabelVector::new(&parts);

        let mut buf = Vec::new();
        lv.write_to(&mut buf);
        assert_eq!(buf.len(), lv.marshal_size());

        let (decoded, rest) = LabelVector::unmarshal(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded.label(0), 1);
        assert_eq!(decoded.label(4), 255);
        assert_eq!(decoded.label(5), 0, "trailing sentinel survives");
    }
}
