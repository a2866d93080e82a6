//! Index entry records
//!
//! On a page every entry is stored as
//! `[flags: u8][mbr: 32 bytes][payload_len: u16 LE][payload]`.
//! Leaf payloads are the row locator; node pointer payloads are the child
//! page id as a little-endian u64.

use std::cmp::Ordering;

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

use crate::comparator::CompareFn;
use crate::error::{Error, PageId, Result};
use crate::mbr::{Mbr, MBR_ENCODED_SIZE};

/// Bytes in a record before its payload
pub const RECORD_HEADER_SIZE: usize = 1 + MBR_ENCODED_SIZE + 2;

/// Payload size of a node pointer
pub const CHILD_PTR_SIZE: usize = 8;

bitflags! {
    /// Per-record flag bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordFlags: u8 {
        /// Payload is a child page id
        const NODE_PTR = 0x01;
        /// First record of the leftmost page of a non-leaf level
        const MIN_REC = 0x02;
    }
}

/// Entry of an R-tree page
#[derive(Debug, Clone, PartialEq)]
pub enum IndexEntry {
    /// Row entry on a leaf page
    Leaf {
        /// Bounding box of the indexed geometry
        mbr: Mbr,
        /// Opaque row locator
        payload: Vec<u8>,
    },
    /// Directory entry on a branch page
    NodePtr {
        /// Union of every MBR below `child`
        mbr: Mbr,
        /// Child page
        child: PageId,
    },
}

impl IndexEntry {
    /// Leaf entry for a row
    pub fn leaf(mbr: Mbr, payload: impl Into<Vec<u8>>) -> Self {
        IndexEntry::Leaf { mbr, payload: payload.into() }
    }

    /// Directory entry for a child page
    pub fn node_ptr(mbr: Mbr, child: PageId) -> Self {
        IndexEntry::NodePtr { mbr, child }
    }

    /// Bounding box of the entry
    pub fn mbr(&self) -> &Mbr {
        match self {
            IndexEntry::Leaf { mbr, .. } | IndexEntry::NodePtr { mbr, .. } => mbr,
        }
    }

    /// Child page of a directory entry
    pub fn child(&self) -> Option<PageId> {
        match self {
            IndexEntry::NodePtr { child, .. } => Some(*child),
            IndexEntry::Leaf { .. } => None,
        }
    }

    /// Row locator of a leaf entry
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            IndexEntry::Leaf { payload, .. } => Some(payload),
            IndexEntry::NodePtr { .. } => None,
        }
    }

    /// Whether this is a directory entry
    pub fn is_node_ptr(&self) -> bool {
        matches!(self, IndexEntry::NodePtr { .. })
    }

    /// Same entry with a different bounding box
    pub fn with_mbr(&self, mbr: Mbr) -> Self {
        match self {
            IndexEntry::Leaf { payload, .. } => IndexEntry::Leaf { mbr, payload: payload.clone() },
            IndexEntry::NodePtr { child, .. } => IndexEntry::NodePtr { mbr, child: *child },
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            IndexEntry::Leaf { payload, .. } => payload.len(),
            IndexEntry::NodePtr { .. } => CHILD_PTR_SIZE,
        }
    }

    /// Encoded size of the record, slot excluded
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload_len()
    }

    /// Encode the record with the given flags
    ///
    /// `NODE_PTR` is derived from the variant and need not be passed.
    pub fn encode(&self, flags: RecordFlags) -> Result<Vec<u8>> {
        let payload_len = self.payload_len();
        if payload_len > u16::MAX as usize {
            return Err(Error::InvalidParameter("row locator longer than 65535 bytes"));
        }
        let mut flags = flags - RecordFlags::NODE_PTR;
        if self.is_node_ptr() {
            flags |= RecordFlags::NODE_PTR;
        }

        let mut buf = vec![0u8; self.encoded_len()];
        buf[0] = flags.bits();
        self.mbr().encode_into(&mut buf[1..1 + MBR_ENCODED_SIZE]);
        let at = 1 + MBR_ENCODED_SIZE;
        LittleEndian::write_u16(&mut buf[at..at + 2], payload_len as u16);
        let body = &mut buf[RECORD_HEADER_SIZE..];
        match self {
            IndexEntry::Leaf { payload, .. } => body.copy_from_slice(payload),
            IndexEntry::NodePtr { child, .. } => LittleEndian::write_u64(body, child.0),
        }
        Ok(buf)
    }

    /// Decode a record and its flags
    pub fn decode(buf: &[u8]) -> Result<(IndexEntry, RecordFlags)> {
        let len = record_len(buf)?;
        let flags = RecordFlags::from_bits_truncate(buf[0]);
        let mbr = Mbr::decode(&buf[1..1 + MBR_ENCODED_SIZE])?;
        let body = &buf[RECORD_HEADER_SIZE..len];
        let entry = if flags.contains(RecordFlags::NODE_PTR) {
            if body.len() != CHILD_PTR_SIZE {
                return Err(Error::Decoding(
                    format!("node pointer payload of {} bytes", body.len()).into(),
                ));
            }
            IndexEntry::NodePtr { mbr, child: PageId(LittleEndian::read_u64(body)) }
        } else {
            IndexEntry::Leaf { mbr, payload: body.to_vec() }
        };
        Ok((entry, flags))
    }

    /// Order entries by MBR, then by row locator or child id
    pub fn sort_cmp(&self, other: &IndexEntry, cmp: CompareFn) -> Ordering {
        self.mbr().sort_cmp(other.mbr()).then_with(|| match (self, other) {
            (IndexEntry::Leaf { payload: a, .. }, IndexEntry::Leaf { payload: b, .. }) => cmp(a, b),
            (IndexEntry::NodePtr { child: a, .. }, IndexEntry::NodePtr { child: b, .. }) => a.cmp(b),
            (IndexEntry::Leaf { .. }, IndexEntry::NodePtr { .. }) => Ordering::Less,
            (IndexEntry::NodePtr { .. }, IndexEntry::Leaf { .. }) => Ordering::Greater,
        })
    }

    /// Whether `other` is the same record, ignoring flags
    pub fn same_record(&self, other: &IndexEntry) -> bool {
        match (self, other) {
            (IndexEntry::NodePtr { child: a, .. }, IndexEntry::NodePtr { child: b, .. }) => a == b,
            _ => self == other,
        }
    }
}

/// Length of the record at the start of `buf`
pub fn record_len(buf: &[u8]) -> Result<usize> {
    if buf.len() < RECORD_HEADER_SIZE {
        return Err(Error::Decoding("truncated record header".into()));
    }
    let at = 1 + MBR_ENCODED_SIZE;
    let len = RECORD_HEADER_SIZE + LittleEndian::read_u16(&buf[at..at + 2]) as usize;
    if buf.len() < len {
        return Err(Error::Decoding(format!("record of {} bytes truncated to {}", len, buf.len()).into()));
    }
    Ok(len)
}

/// Bounding box of an encoded record without decoding the payload
pub fn record_mbr(buf: &[u8]) -> Result<Mbr> {
    if buf.len() < RECORD_HEADER_SIZE {
        return Err(Error::Decoding("truncated record header".into()));
    }
    Mbr::decode(&buf[1..1 + MBR_ENCODED_SIZE])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::{Comparator, LexicographicComparator};

    #[test]
    fn test_leaf_record() {
        let entry = IndexEntry::leaf(Mbr::rect(0.0, 0.0, 1.0, 1.0), b"row-7".to_vec());
        let buf = entry.encode(RecordFlags::empty()).unwrap();
        assert_eq!(buf.len(), RECORD_HEADER_SIZE + 5);
        assert_eq!(record_len(&buf).unwrap(), buf.len());
        let (decoded, flags) = IndexEntry::decode(&buf).unwrap();
        assert_eq!(decoded, entry);
        assert!(flags.is_empty());
    }

    #[test]
    fn test_node_ptr_record() {
        let entry = IndexEntry::node_ptr(Mbr::rect(-5.0, -5.0, 5.0, 5.0), PageId(42));
        // NODE_PTR is set from the variant even when the caller omits it
        let buf = entry.encode(RecordFlags::MIN_REC).unwrap();
        let (decoded, flags) = IndexEntry::decode(&buf).unwrap();
        assert_eq!(decoded.child(), Some(PageId(42)));
        assert_eq!(flags, RecordFlags::NODE_PTR | RecordFlags::MIN_REC);
        assert_eq!(record_mbr(&buf).unwrap(), *entry.mbr());
    }

    #[test]
    fn test_truncated_record() {
        let entry = IndexEntry::leaf(Mbr::point(1.0, 2.0), vec![9u8; 10]);
        let buf = entry.encode(RecordFlags::empty()).unwrap();
        assert!(IndexEntry::decode(&buf[..buf.len() - 1]).is_err());
        assert!(record_len(&buf[..4]).is_err());
    }

    #[test]
    fn test_sort_cmp() {
        let cmp = LexicographicComparator::compare;
        let a = IndexEntry::leaf(Mbr::rect(0.0, 0.0, 1.0, 1.0), b"b".to_vec());
        let b = IndexEntry::leaf(Mbr::rect(0.0, 0.0, 1.0, 1.0), b"a".to_vec());
        let c = IndexEntry::leaf(Mbr::rect(1.0, 0.0, 2.0, 1.0), b"a".to_vec());
        assert_eq!(a.sort_cmp(&b, cmp), Ordering::Greater);
        assert_eq!(b.sort_cmp(&c, cmp), Ordering::Less);
        assert_eq!(a.sort_cmp(&a, cmp), Ordering::Equal);
    }

    #[test]
    fn test_same_record_ignores_mbr_for_pointers() {
        let a = IndexEntry::node_ptr(Mbr::rect(0.0, 0.0, 1.0, 1.0), PageId(3));
        let b = a.with_mbr(Mbr::rect(0.0, 0.0, 9.0, 9.0));
        assert!(a.same_record(&b));
        let leaf = IndexEntry::leaf(Mbr::point(0.0, 0.0), vec![1]);
        assert!(!leaf.same_record(&leaf.with_mbr(Mbr::point(1.0, 1.0))));
    }
}
