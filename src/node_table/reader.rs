use super::{ContentHasher, Md5ContentHasher, NODES_FILE_NAME, NODE_INDEX_FILE_NAME, NODE_INDEX_LAYOUT};
use crate::{
    bptree::BPlusTree,
    error::{BuildError, IndexBuildError},
    object_file::ObjectFileReader,
    rdf::{codec, Term, TermId},
};
use std::path::Path;

/// A finished node table: term lookup by id and id lookup by term.
pub struct NodeTable<H = Md5ContentHasher> {
    objects: ObjectFileReader,
    index: BPlusTree,
    hasher: H,
}

impl NodeTable<Md5ContentHasher> {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, BuildError> {
        Self::open_with_hasher(dir, Md5ContentHasher)
    }
}

impl<H: ContentHasher> NodeTable<H> {
    /// Open with the hasher the table was built with.
    pub fn open_with_hasher<P: AsRef<Path>>(dir: P, hasher: H) -> Result<Self, BuildError> {
        let dir = dir.as_ref();
        let objects = ObjectFileReader::open(dir.join(NODES_FILE_NAME))?;
        let index = BPlusTree::open(dir.join(NODE_INDEX_FILE_NAME))?;

        if index.layout() != NODE_INDEX_LAYOUT {
            return Err(IndexBuildError::Corrupt(format!("unexpected node index layout {:?}", index.layout())).into());
        }

        Ok(Self { objects, index, hasher })
    }

    /// Number of distinct terms.
    pub fn len(&self) -> u64 {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn term(&self, id: TermId) -> Result<Term, BuildError> {
        Ok(codec::decode(self.objects.read(id.0)?)?)
    }

    /// Id of `term`, if it is in the table.
    ///
    /// Every id stored under the term's hash is a candidate; the first whose
    /// stored encoding matches byte for byte is the answer.
    pub fn id_of(&self, term: &Term) -> Result<Option<TermId>, BuildError> {
        let encoded = codec::encode_to_vec(term);
        let hash = self.hasher.hash(&encoded);

        for candidate in self.index.get_all(&hash)? {
            let id = TermId::from_be_slice(candidate?)
                .ok_or_else(|| IndexBuildError::Corrupt("node index value is not a term id".to_owned()))?;

            if self.objects.read(id.0)? == encoded.as_slice() {
                return Ok(Some(id));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    #[test]
    fn missing_table() {
        let dir = tempfile::tempdir().unwrap();
        assert!(NodeTable::open(dir.path()).is_err());
    }

    #[test]
    fn rejects_foreign_tree_layout() {
        use crate::{
            bptree::{pack_into_tree, FileBlockStorage, RecordLayout},
            object_file::ObjectFile,
        };

        let dir = tempfile::tempdir().unwrap();
        ObjectFile::create(dir.path().join(NODES_FILE_NAME)).unwrap().close().unwrap();

        let mut storage = FileBlockStorage::create(dir.path().join(NODE_INDEX_FILE_NAME), 256).unwrap();
        let records: Vec<Result<_, IndexBuildError>> = vec![Ok((vec![0; 24], Vec::new()))];
        pack_into_tree(records, RecordLayout::new(24, 0), &mut storage).unwrap();
        drop(storage);

        assert!(matches!(NodeTable::open(dir.path()), Err(BuildError::Index(IndexBuildError::Corrupt(_)))));
    }

    #[test]
    fn term_out_of_range() {
        use crate::{
            node_table::{NodeTableBuilder, NodeTableOptions},
            progress::NullProgressMonitor,
            rdf::StatementRecord,
        };

        let dir = tempfile::tempdir().unwrap();
        let options = NodeTableOptions {
            sort: crate::sort::SortConfig { spill_dir: dir.path().to_owned(), ..Default::default() },
            ..Default::default()
        };
        let mut builder = NodeTableBuilder::create(dir.path(), options, NullProgressMonitor::default()).unwrap();
        builder.add(&StatementRecord::triple(Term::uri("s"), Term::uri("p"), Term::uri("o"))).unwrap();
        builder.finish(&mut (), |_| Ok(())).unwrap();

        let table = NodeTable::open(dir.path()).unwrap();
        assert_eq!(table.len(), 3);
        assert!(matches!(table.term(TermId(1 << 40)), Err(BuildError::Store(StoreError::OutOfRange { .. }))));
        assert!(matches!(table.term(TermId(u64::MAX)), Err(BuildError::Store(StoreError::OutOfRange { .. }))));
    }
}
