//! Immutable B+Trees over fixed width records, built bottom-up from sorted input.
//!
//! ## File layout
//!
//! ```text
//! block 0         header
//! blocks 1..=L    leaves, in key order, filled to capacity
//! next blocks     internal level 1, then level 2, ... each contiguous
//! last block      root (a leaf when the tree has a single leaf)
//! ```
//!
//! Leaf block:     `[kind=0][0][count: u16 LE][key value]*`
//! Internal block: `[kind=1][level][count: u16 LE][first key of child, child block: u64 LE]*`
//!
//! Duplicate keys are allowed; lookups return the first match and
//! [`BPlusTree::get_all`] every match.

pub mod block;
pub mod packer;

use crate::error::IndexBuildError;
use memmap2::Mmap;
use std::{fs::File, ops::Range, path::Path};

pub use block::{BlockStorage, FileBlockStorage, MemBlockStorage};
pub use packer::{pack_into_tree, PackedTree};

pub const MAGIC: [u8; 4] = *b"BPT1";
pub const DEFAULT_BLOCK_SIZE: usize = 8192;
pub const MIN_BLOCK_SIZE: usize = 64;

const BLOCK_HEADER: usize = 4;
const CHILD_PTR: usize = std::mem::size_of::<u64>();
const KIND_LEAF: u8 = 0;
const KIND_INTERNAL: u8 = 1;
const NO_ROOT: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    pub key_len: usize,
    pub value_len: usize,
}

impl RecordLayout {
    pub fn new(key_len: usize, value_len: usize) -> Self {
        Self { key_len, value_len }
    }

    pub fn record_width(&self) -> usize {
        self.key_len + self.value_len
    }

    pub fn leaf_capacity(&self, block_size: usize) -> usize {
        (block_size.saturating_sub(BLOCK_HEADER) / self.record_width().max(1)).min(u16::MAX as usize)
    }

    pub fn internal_capacity(&self, block_size: usize) -> usize {
        (block_size.saturating_sub(BLOCK_HEADER) / (self.key_len + CHILD_PTR)).min(u16::MAX as usize)
    }

    /// Both block kinds must hold at least two entries for the tree to narrow each level.
    pub fn check_block_size(&self, block_size: usize) -> Result<(), IndexBuildError> {
        if block_size < MIN_BLOCK_SIZE || self.leaf_capacity(block_size) < 2 || self.internal_capacity(block_size) < 2 {
            return Err(IndexBuildError::BlockTooSmall { block_size, record_width: self.record_width() });
        }
        Ok(())
    }
}

/// Shape of a packed tree, as stored in the header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeHeader {
    pub block_size: usize,
    pub layout: RecordLayout,
    pub records: u64,
    pub first_leaf: u64,
    pub leaf_count: u64,
    pub root: Option<u64>,
    pub height: u32,
}

impl TreeHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut block = vec![0; self.block_size];
        let mut w = &mut block[..];
        let mut put = |bytes: &[u8]| {
            let (head, tail) = std::mem::take(&mut w).split_at_mut(bytes.len());
            head.copy_from_slice(bytes);
            w = tail;
        };

        put(&MAGIC);
        put(&(self.block_size as u32).to_le_bytes());
        put(&(self.layout.key_len as u32).to_le_bytes());
        put(&(self.layout.value_len as u32).to_le_bytes());
        put(&self.records.to_le_bytes());
        put(&self.first_leaf.to_le_bytes());
        put(&self.leaf_count.to_le_bytes());
        put(&self.root.unwrap_or(NO_ROOT).to_le_bytes());
        put(&self.height.to_le_bytes());

        block
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, IndexBuildError> {
        let corrupt = |what: &str| IndexBuildError::Corrupt(what.to_owned());

        if bytes.len() < 52 || bytes[..4] != MAGIC {
            return Err(corrupt("bad magic"));
        }

        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let u64_at = |at: usize| {
            let mut b = [0; 8];
            b.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(b)
        };

        let root = u64_at(40);
        let header = Self {
            block_size: u32_at(4) as usize,
            layout: RecordLayout::new(u32_at(8) as usize, u32_at(12) as usize),
            records: u64_at(16),
            first_leaf: u64_at(24),
            leaf_count: u64_at(32),
            root: (root != NO_ROOT).then_some(root),
            height: u32_at(48),
        };

        header.layout.check_block_size(header.block_size).map_err(|_| corrupt("inconsistent block size"))?;
        Ok(header)
    }
}

/// Read side of a packed tree over a complete file image.
pub struct BPlusTree<D = Mmap> {
    data: D,
    header: TreeHeader,
}

impl BPlusTree<Mmap> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, IndexBuildError> {
        let file = File::open(path)?;
        let data = unsafe { Mmap::map(&file)? };
        Self::from_bytes(data)
    }
}

impl<D: AsRef<[u8]>> BPlusTree<D> {
    pub fn from_bytes(data: D) -> Result<Self, IndexBuildError> {
        let header = TreeHeader::decode(data.as_ref())?;

        let blocks = (data.as_ref().len() / header.block_size) as u64;
        let leaves_end = header.first_leaf.checked_add(header.leaf_count);
        if !matches!(leaves_end, Some(end) if end <= blocks) || matches!(header.root, Some(root) if root >= blocks) {
            return Err(IndexBuildError::Corrupt("tree extends past end of file".to_owned()));
        }

        Ok(Self { data, header })
    }

    pub fn header(&self) -> &TreeHeader {
        &self.header
    }

    pub fn layout(&self) -> RecordLayout {
        self.header.layout
    }

    pub fn len(&self) -> u64 {
        self.header.records
    }

    pub fn is_empty(&self) -> bool {
        self.header.records == 0
    }

    fn block(&self, id: u64) -> Result<&[u8], IndexBuildError> {
        let bs = self.header.block_size;
        usize::try_from(id)
            .ok()
            .and_then(|id| id.checked_mul(bs))
            .and_then(|start| self.data.as_ref().get(start..start.checked_add(bs)?))
            .ok_or_else(|| IndexBuildError::Corrupt(format!("block {id} out of range")))
    }

    /// Entries of a block of the expected kind.
    fn entries(&self, id: u64, kind: u8, width: usize) -> Result<&[u8], IndexBuildError> {
        let block = self.block(id)?;
        if block[0] != kind {
            return Err(IndexBuildError::Corrupt(format!("block {id} has kind {}, expected {kind}", block[0])));
        }

        let count = u16::from_le_bytes([block[2], block[3]]) as usize;
        if count == 0 && kind == KIND_INTERNAL {
            return Err(IndexBuildError::Corrupt(format!("internal block {id} has no children")));
        }

        block
            .get(BLOCK_HEADER..BLOCK_HEADER + count * width)
            .ok_or_else(|| IndexBuildError::Corrupt(format!("block {id} entry count overflows block")))
    }

    fn leaf(&self, id: u64) -> Result<&[u8], IndexBuildError> {
        self.entries(id, KIND_LEAF, self.header.layout.record_width())
    }

    /// Position of the first record whose key is `>= key`.
    fn lower_bound(&self, key: &[u8]) -> Result<Cursor, IndexBuildError> {
        let Some(mut id) = self.header.root else {
            return Ok(Cursor::end(&self.header));
        };

        let k = self.header.layout.key_len;

        for _ in 1..self.header.height {
            let entry_width = k + CHILD_PTR;
            let entries = self.entries(id, KIND_INTERNAL, entry_width)?;
            let entry = |i: usize| &entries[i * entry_width..(i + 1) * entry_width];

            // last child whose first key is strictly below `key`: equal keys may start in it
            let below = partition_point(entries.len() / entry_width, |i| &entry(i)[..k] < key);
            let chosen = entry(below.saturating_sub(1));

            let mut child = [0; CHILD_PTR];
            child.copy_from_slice(&chosen[k..]);
            id = u64::from_le_bytes(child);
        }

        let records = self.leaf(id)?;
        let width = self.header.layout.record_width().max(1);
        let pos = partition_point(records.len() / width, |i| &records[i * width..i * width + k] < key);

        let mut cursor = Cursor { leaf: id, pos };
        cursor.normalize(self)?;
        Ok(cursor)
    }

    /// Value of the first record with this key.
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>, IndexBuildError> {
        let cursor = self.lower_bound(key)?;
        match (RangeIter { tree: self, cursor, high: None }).next() {
            Some(Ok((found, value))) if found == key => Ok(Some(value)),
            Some(Err(e)) => Err(e),
            _ => Ok(None),
        }
    }

    /// Values of every record with this key.
    pub fn get_all<'a>(
        &'a self,
        key: &'a [u8],
    ) -> Result<impl Iterator<Item = Result<&'a [u8], IndexBuildError>> + 'a, IndexBuildError> {
        let cursor = self.lower_bound(key)?;

        Ok(RangeIter { tree: self, cursor, high: None }
            .take_while(move |found| !matches!(found, Ok((k, _)) if *k != key))
            .map(|found| found.map(|(_, value)| value)))
    }

    /// Records with `low <= key < high`, in key order.
    pub fn range<'a>(&'a self, keys: Range<&'a [u8]>) -> Result<RangeIter<'a, D>, IndexBuildError> {
        let cursor = self.lower_bound(keys.start)?;
        Ok(RangeIter { tree: self, cursor, high: Some(keys.end) })
    }

    pub fn iter(&self) -> RangeIter<'_, D> {
        let first = Cursor { leaf: self.header.first_leaf, pos: 0 };
        let cursor = if self.header.leaf_count == 0 { Cursor::end(&self.header) } else { first };
        RangeIter { tree: self, cursor, high: None }
    }
}

fn partition_point(len: usize, pred: impl Fn(usize) -> bool) -> usize {
    let (mut lo, mut hi) = (0, len);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    leaf: u64,
    pos: usize,
}

impl Cursor {
    fn end(header: &TreeHeader) -> Self {
        Cursor { leaf: header.first_leaf + header.leaf_count, pos: 0 }
    }

    fn is_end(&self, header: &TreeHeader) -> bool {
        self.leaf >= header.first_leaf + header.leaf_count
    }

    /// Move past exhausted leaves.
    fn normalize<D: AsRef<[u8]>>(&mut self, tree: &BPlusTree<D>) -> Result<(), IndexBuildError> {
        let width = tree.header.layout.record_width().max(1);
        while !self.is_end(&tree.header) {
            let records = tree.leaf(self.leaf)?;
            if self.pos < records.len() / width {
                break;
            }
            self.leaf += 1;
            self.pos = 0;
        }
        Ok(())
    }
}

pub struct RangeIter<'a, D> {
    tree: &'a BPlusTree<D>,
    cursor: Cursor,
    high: Option<&'a [u8]>,
}

impl<'a, D: AsRef<[u8]>> Iterator for RangeIter<'a, D> {
    type Item = Result<(&'a [u8], &'a [u8]), IndexBuildError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.is_end(&self.tree.header) {
            return None;
        }

        let layout = self.tree.header.layout;
        let width = layout.record_width();

        let records = match self.tree.leaf(self.cursor.leaf) {
            Ok(leaf) => leaf,
            Err(e) => {
                self.cursor = Cursor::end(&self.tree.header);
                return Some(Err(e));
            },
        };

        let record = &records[self.cursor.pos * width..(self.cursor.pos + 1) * width];
        let (key, value) = record.split_at(layout.key_len);

        if matches!(self.high, Some(high) if key >= high) {
            self.cursor = Cursor::end(&self.tree.header);
            return None;
        }

        self.cursor.pos += 1;
        if let Err(e) = self.cursor.normalize(self.tree) {
            self.cursor = Cursor::end(&self.tree.header);
            return Some(Err(e));
        }

        Some(Ok((key, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacities() {
        let layout = RecordLayout::new(16, 8);
        assert_eq!(layout.leaf_capacity(4096), (4096 - 4) / 24);
        assert_eq!(layout.internal_capacity(4096), (4096 - 4) / 24);
        assert!(layout.check_block_size(4096).is_ok());
        assert!(matches!(layout.check_block_size(48), Err(IndexBuildError::BlockTooSmall { .. })));

        let key_only = RecordLayout::new(24, 0);
        assert_eq!(key_only.leaf_capacity(64), 2);
        assert_eq!(key_only.internal_capacity(64), 1);
        assert!(key_only.check_block_size(64).is_err());
        assert!(key_only.check_block_size(128).is_ok());
    }

    #[test]
    fn header_round_trip() {
        let header = TreeHeader {
            block_size: 256,
            layout: RecordLayout::new(16, 8),
            records: 1234,
            first_leaf: 1,
            leaf_count: 130,
            root: Some(140),
            height: 3,
        };

        assert_eq!(TreeHeader::decode(&header.encode()).unwrap(), header);

        let empty = TreeHeader { root: None, records: 0, leaf_count: 0, height: 0, ..header };
        assert_eq!(TreeHeader::decode(&empty.encode()).unwrap(), empty);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(BPlusTree::from_bytes(vec![0u8; 256]), Err(IndexBuildError::Corrupt(_))));
    }
}
