//! Bottom-up packing of sorted records into a tree file.
//!
//! Leaves are written in one pass, each filled to capacity. Every internal
//! level is then built by reading back the first key of each block of the
//! level below, until a single block remains. That block is the root.

use super::{BlockStorage, RecordLayout, TreeHeader, BLOCK_HEADER, CHILD_PTR, KIND_INTERNAL, KIND_LEAF};
use crate::{error::IndexBuildError, sort::SortRecord};
use std::ops::Range;
use tracing::debug;

/// Result of a completed packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedTree {
    pub header: TreeHeader,
    pub blocks: u64,
}

struct BlockBuilder {
    block: Vec<u8>,
    count: usize,
    capacity: usize,
}

impl BlockBuilder {
    fn new(block_size: usize, kind: u8, level: u8, capacity: usize) -> Self {
        let mut block = vec![0; block_size];
        block[0] = kind;
        block[1] = level;
        Self { block, count: 0, capacity }
    }

    fn is_full(&self) -> bool {
        self.count == self.capacity
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn push(&mut self, width: usize, parts: &[&[u8]]) {
        if self.count == 0 {
            self.block[BLOCK_HEADER..].fill(0);
        }

        let mut at = BLOCK_HEADER + self.count * width;
        for part in parts {
            self.block[at..at + part.len()].copy_from_slice(part);
            at += part.len();
        }
        self.count += 1;
    }

    /// Finished block bytes; resets the builder for the next block.
    fn take(&mut self) -> &[u8] {
        self.block[2..4].copy_from_slice(&(self.count as u16).to_le_bytes());
        self.count = 0;
        &self.block
    }
}

/// Pack sorted `records` into `storage`, which must be empty.
///
/// Keys must be non-decreasing and every record must match `layout`.
pub fn pack_into_tree<I, E, S>(records: I, layout: RecordLayout, storage: &mut S) -> Result<PackedTree, E>
where
    I: IntoIterator<Item = Result<SortRecord, E>>,
    E: From<IndexBuildError> + From<std::io::Error>,
    S: BlockStorage,
{
    let block_size = storage.block_size();
    layout.check_block_size(block_size)?;

    // header goes in last, once the shape is known
    storage.write_block(0, &vec![0; block_size])?;

    let first_leaf = storage.block_count();
    let (leaves, record_count) = write_leaves(records, layout, storage)?;

    let mut header = TreeHeader {
        block_size,
        layout,
        records: record_count,
        first_leaf,
        leaf_count: leaves.end - leaves.start,
        root: None,
        height: 0,
    };

    if !leaves.is_empty() {
        let mut level = leaves;
        let mut height = 1u32;

        while level.end - level.start > 1 {
            level = write_internal_level(level, height as u8, layout, storage)?;
            height += 1;
        }

        header.root = Some(level.start);
        header.height = height;
    }

    storage.write_block(0, &header.encode())?;
    storage.sync()?;

    debug!(records = record_count, leaves = header.leaf_count, height = header.height, "packed tree");

    Ok(PackedTree { header, blocks: storage.block_count() })
}

fn write_leaves<I, E, S>(records: I, layout: RecordLayout, storage: &mut S) -> Result<(Range<u64>, u64), E>
where
    I: IntoIterator<Item = Result<SortRecord, E>>,
    E: From<IndexBuildError> + From<std::io::Error>,
    S: BlockStorage,
{
    let block_size = storage.block_size();
    let width = layout.record_width();
    let start = storage.block_count();

    let mut leaf = BlockBuilder::new(block_size, KIND_LEAF, 0, layout.leaf_capacity(block_size));
    let mut prev_key: Option<Vec<u8>> = None;
    let mut count = 0u64;

    for record in records {
        let (key, value) = record?;

        if key.len() != layout.key_len || value.len() != layout.value_len {
            return Err(IndexBuildError::RecordWidth {
                expected: width,
                found: key.len() + value.len(),
            }
            .into());
        }

        if matches!(&prev_key, Some(prev) if key < *prev) {
            return Err(IndexBuildError::UnsortedInput { position: count }.into());
        }

        if leaf.is_full() {
            let id = storage.block_count();
            storage.write_block(id, leaf.take())?;
        }

        leaf.push(width, &[&key, &value]);
        prev_key = Some(key);
        count += 1;
    }

    if !leaf.is_empty() {
        let id = storage.block_count();
        storage.write_block(id, leaf.take())?;
    }

    Ok((start..storage.block_count(), count))
}

/// Write the level above `children`, returning its block range.
fn write_internal_level<S: BlockStorage>(
    children: Range<u64>,
    level: u8,
    layout: RecordLayout,
    storage: &mut S,
) -> Result<Range<u64>, std::io::Error> {
    let block_size = storage.block_size();
    let k = layout.key_len;
    let width = k + CHILD_PTR;
    let start = storage.block_count();

    let mut node = BlockBuilder::new(block_size, KIND_INTERNAL, level, layout.internal_capacity(block_size));
    let mut child_block = vec![0; block_size];

    for child in children {
        storage.read_block(child, &mut child_block)?;
        let first_key = &child_block[BLOCK_HEADER..BLOCK_HEADER + k];

        if node.is_full() {
            let id = storage.block_count();
            storage.write_block(id, node.take())?;
        }

        node.push(width, &[first_key, &child.to_le_bytes()]);
    }

    if !node.is_empty() {
        let id = storage.block_count();
        storage.write_block(id, node.take())?;
    }

    Ok(start..storage.block_count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bptree::{BPlusTree, FileBlockStorage, MemBlockStorage};
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn record(key: u64, value: u64) -> Result<SortRecord, IndexBuildError> {
        Ok((key.to_be_bytes().to_vec(), value.to_be_bytes().to_vec()))
    }

    fn pack(records: Vec<Result<SortRecord, IndexBuildError>>, block_size: usize) -> BPlusTree<Vec<u8>> {
        let mut storage = MemBlockStorage::new(block_size);
        pack_into_tree(records, RecordLayout::new(8, 8), &mut storage).unwrap();
        BPlusTree::from_bytes(storage.into_bytes()).unwrap()
    }

    #[test]
    fn empty_input() {
        let tree = pack(vec![], 64);
        assert!(tree.is_empty());
        assert_eq!(tree.header().root, None);
        assert_eq!(tree.iter().count(), 0);
        assert_eq!(tree.get(&7u64.to_be_bytes()).unwrap(), None);
    }

    #[test]
    fn single_leaf_tree_is_its_own_root() {
        let tree = pack((0..3).map(|i| record(i * 2, i)).collect(), 64);
        assert_eq!(tree.header().height, 1);
        assert_eq!(tree.header().root, Some(1));
        assert_eq!(tree.get(&4u64.to_be_bytes()).unwrap(), Some(&2u64.to_be_bytes()[..]));
        assert_eq!(tree.get(&3u64.to_be_bytes()).unwrap(), None);
    }

    #[test]
    fn corrupt_internal_blocks_are_errors() {
        let mut storage = MemBlockStorage::new(64);
        let header = pack_into_tree((0..7).map(|i| record(i, i)), RecordLayout::new(8, 8), &mut storage).unwrap().header;
        assert_eq!(header.height, 2);
        let root = header.root.unwrap() as usize * 64;
        let image = storage.into_bytes();

        let mut empty_root = image.clone();
        empty_root[root + 2..root + 4].copy_from_slice(&0u16.to_le_bytes());
        let tree = BPlusTree::from_bytes(empty_root).unwrap();
        assert!(matches!(tree.get(&3u64.to_be_bytes()), Err(IndexBuildError::Corrupt(_))));

        let mut wild_child = image;
        wild_child[root + 12..root + 20].copy_from_slice(&u64::MAX.to_le_bytes());
        let tree = BPlusTree::from_bytes(wild_child).unwrap();
        assert!(matches!(tree.get(&0u64.to_be_bytes()), Err(IndexBuildError::Corrupt(_))));
    }

    #[test]
    fn lookups_across_levels() {
        // 64 byte blocks hold 3 records per leaf and 3 children per internal node
        let n = 500u64;
        let tree = pack((0..n).map(|i| record(i * 10, i)).collect(), 64);

        assert_eq!(tree.len(), n);
        assert!(tree.header().height >= 5);
        assert_eq!(tree.header().leaf_count, (n + 2) / 3);

        for i in 0..n {
            let found = tree.get(&(i * 10).to_be_bytes()).unwrap();
            assert_eq!(found, Some(&i.to_be_bytes()[..]), "key {}", i * 10);
            assert_eq!(tree.get(&(i * 10 + 5).to_be_bytes()).unwrap(), None);
        }

        let all: Vec<_> = tree.iter().map(|r| r.unwrap().0.to_vec()).collect();
        assert_eq!(all.len() as u64, n);
        assert!(all.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn duplicates_spanning_leaves() {
        let mut records = vec![record(1, 0)];
        records.extend((0..10).map(|i| record(5, i)));
        records.push(record(9, 0));

        let tree = pack(records, 64);
        let values: Vec<_> = tree
            .get_all(&5u64.to_be_bytes())
            .unwrap()
            .map(|v| u64::from_be_bytes(v.unwrap().try_into().unwrap()))
            .collect();
        assert_eq!(values, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn range_scan() {
        let tree = pack((0..100).map(|i| record(i, i)).collect(), 128);
        let low = 17u64.to_be_bytes();
        let high = 42u64.to_be_bytes();
        let keys: Vec<_> = tree
            .range(&low[..]..&high[..])
            .unwrap()
            .map(|r| u64::from_be_bytes(r.unwrap().0.try_into().unwrap()))
            .collect();
        assert_eq!(keys, (17..42).collect::<Vec<_>>());
    }

    #[test]
    fn random_keys_from_file() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut keys: Vec<u64> = (0..2000).map(|_| rng.gen_range(0..1_000_000)).collect();
        keys.sort_unstable();
        keys.dedup();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("random.bpt");
        let mut storage = FileBlockStorage::create(&path, 256).unwrap();
        let packed =
            pack_into_tree(keys.iter().map(|&k| record(k, !k)), RecordLayout::new(8, 8), &mut storage).unwrap();
        drop(storage);

        assert_eq!(std::fs::metadata(&path).unwrap().len(), packed.blocks * 256);

        let tree = BPlusTree::open(&path).unwrap();
        for &k in &keys {
            assert_eq!(tree.get(&k.to_be_bytes()).unwrap(), Some(&(!k).to_be_bytes()[..]));
        }
        assert_eq!(tree.get(&1_000_001u64.to_be_bytes()).unwrap(), None);
    }

    #[test]
    fn rejects_unsorted_input() {
        let mut storage = MemBlockStorage::new(64);
        let err = pack_into_tree(vec![record(2, 0), record(1, 0)], RecordLayout::new(8, 8), &mut storage).unwrap_err();
        assert!(matches!(err, IndexBuildError::UnsortedInput { position: 1 }));
    }

    #[test]
    fn rejects_wrong_width() {
        let mut storage = MemBlockStorage::new(64);
        let records = vec![Ok((vec![1; 8], vec![0; 4]))];
        let err = pack_into_tree(records, RecordLayout::new(8, 8), &mut storage).unwrap_err();
        assert!(matches!(err, IndexBuildError::RecordWidth { expected: 16, found: 12 }));
    }
}
