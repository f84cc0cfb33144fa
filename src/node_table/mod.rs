//! Node table construction.
//!
//! Every distinct term gets a [`TermId`]: the offset of its encoding in the
//! object file. The builder makes three passes through the external sort:
//!
//! 1. every term occurrence is encoded and sorted as
//!    `(encoding, statement seq || slot)`;
//! 2. walking that order, the first occurrence of each distinct encoding is
//!    appended to the object file, and every occurrence is forwarded as
//!    `(statement seq || slot, id)`;
//! 3. sorting those by statement regroups the ids into coded tuples in input
//!    order.
//!
//! Distinctness is decided by the exact encoded bytes. The content hash only
//! keys the `node2id` index, where colliding terms sit side by side.

pub mod hash;
pub mod reader;

use crate::{
    bptree::{pack_into_tree, FileBlockStorage, PackedTree, RecordLayout, DEFAULT_BLOCK_SIZE},
    error::{BuildError, Phase},
    loader::AbortSignal,
    object_file::ObjectFile,
    progress::ProgressMonitor,
    rdf::{codec, CodedTuple, StatementRecord, TermId},
    sort::{SortConfig, SortedBag},
    stats::StatisticsCollector,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, info_span};

pub use hash::{BucketHasher, ContentHash, ContentHasher, Md5ContentHasher, CONTENT_HASH_LEN};
pub use reader::NodeTable;

pub const NODES_FILE_NAME: &str = "nodes.dat";
pub const NODE_INDEX_FILE_NAME: &str = "node2id.bpt";

pub const DEFAULT_ABORT_CHECK_INTERVAL: u64 = 1_000;

const SLOT_GRAPH: u8 = 0;
const SLOT_SUBJECT: u8 = 1;
const SLOT_PREDICATE: u8 = 2;
const SLOT_OBJECT: u8 = 3;

const OCCURRENCE_KEY_LEN: usize = 9;

/// Layout of the `node2id` index: content hash to big-endian id.
pub const NODE_INDEX_LAYOUT: RecordLayout = RecordLayout { key_len: CONTENT_HASH_LEN, value_len: TermId::WIDTH };

fn occurrence_key(statement: u64, slot: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(OCCURRENCE_KEY_LEN);
    key.extend_from_slice(&statement.to_be_bytes());
    key.push(slot);
    key
}

fn split_occurrence_key(key: &[u8]) -> Option<(u64, usize)> {
    if key.len() != OCCURRENCE_KEY_LEN || key[8] > SLOT_OBJECT {
        return None;
    }

    let mut seq = [0; 8];
    seq.copy_from_slice(&key[..8]);
    Some((u64::from_be_bytes(seq), key[8] as usize))
}

#[derive(Debug, Clone)]
pub struct NodeTableOptions {
    pub sort: SortConfig,
    pub block_size: usize,
    pub abort: AbortSignal,
    pub abort_check_interval: u64,
}

impl Default for NodeTableOptions {
    fn default() -> Self {
        Self {
            sort: SortConfig::default(),
            block_size: DEFAULT_BLOCK_SIZE,
            abort: AbortSignal::default(),
            abort_check_interval: DEFAULT_ABORT_CHECK_INTERVAL,
        }
    }
}

impl NodeTableOptions {
    /// Fails with [`BuildError::Aborted`] when the signal is raised, checked every `abort_check_interval` records.
    pub fn check_abort(&self, phase: Phase, processed: u64) -> Result<(), BuildError> {
        if processed % self.abort_check_interval.max(1) == 0 && self.abort.is_aborted() {
            return Err(BuildError::Aborted { phase, processed });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NodeTableSummary {
    pub statements: u64,
    pub triples: u64,
    pub quads: u64,
    pub terms: u64,
    pub occurrences: u64,
    pub object_bytes: u64,
    pub hash_index: PackedTree,
}

pub struct NodeTableBuilder<M, H = Md5ContentHasher> {
    dir: PathBuf,
    options: NodeTableOptions,
    objects: ObjectFile,
    occurrences: SortedBag,
    hasher: H,
    progress: M,
    scratch: Vec<u8>,
    statements: u64,
}

impl<M: ProgressMonitor> NodeTableBuilder<M, Md5ContentHasher> {
    pub fn create(dir: &Path, options: NodeTableOptions, progress: M) -> Result<Self, BuildError> {
        Self::with_hasher(dir, options, progress, Md5ContentHasher)
    }
}

impl<M: ProgressMonitor, H: ContentHasher> NodeTableBuilder<M, H> {
    /// Start a node table in `dir`, which must not already hold one.
    pub fn with_hasher(dir: &Path, options: NodeTableOptions, mut progress: M, hasher: H) -> Result<Self, BuildError> {
        let objects = ObjectFile::create(dir.join(NODES_FILE_NAME))?;
        let occurrences = SortedBag::new("term occurrences", options.sort.clone());

        progress.start();

        Ok(Self {
            dir: dir.to_owned(),
            options,
            objects,
            occurrences,
            hasher,
            progress,
            scratch: Vec::new(),
            statements: 0,
        })
    }

    /// Statements added so far.
    pub fn statements(&self) -> u64 {
        self.statements
    }

    pub fn add(&mut self, record: &StatementRecord) -> Result<(), BuildError> {
        let seq = self.statements;
        self.options.check_abort(Phase::Ingest, seq)?;
        self.add_occurrences(seq, record).map_err(|e| e.during(Phase::Ingest, seq))?;

        self.statements += 1;
        self.progress.tick();
        Ok(())
    }

    fn add_occurrences(&mut self, seq: u64, record: &StatementRecord) -> Result<(), BuildError> {
        let slots = [
            (SLOT_GRAPH, record.graph.as_ref()),
            (SLOT_SUBJECT, Some(&record.subject)),
            (SLOT_PREDICATE, Some(&record.predicate)),
            (SLOT_OBJECT, Some(&record.object)),
        ];

        for (slot, term) in slots {
            let Some(term) = term else { continue };

            self.scratch.resize(codec::max_encoded_size(term), 0);
            let len = codec::encode(term, &mut self.scratch)?;
            self.occurrences.add(self.scratch[..len].to_vec(), occurrence_key(seq, slot))?;
        }

        Ok(())
    }

    /// Run the remaining passes. Every statement is handed to `sink` as a coded
    /// tuple, in input order, after being recorded in `stats`.
    pub fn finish<C, F>(mut self, stats: &mut C, mut sink: F) -> Result<NodeTableSummary, BuildError>
    where
        C: StatisticsCollector + ?Sized,
        F: FnMut(CodedTuple) -> Result<(), BuildError>,
    {
        self.progress.finish();

        let Self { dir, options, mut objects, mut occurrences, hasher, statements, .. } = self;
        let occurrence_count = occurrences.len();

        let mut assigned = SortedBag::new("assigned ids", options.sort.clone());
        let mut hashes = SortedBag::new("term hashes", options.sort.clone()).with_value_order(|a, b| a.cmp(b));

        let mut processed = 0;
        let terms = {
            let _span = info_span!("assign_ids", occurrences = occurrence_count).entered();
            assign_ids(&options, &mut occurrences, &mut objects, &hasher, &mut assigned, &mut hashes, &mut processed)
                .map_err(|e| e.during(Phase::AssignIds, processed))?
        };
        occurrences.close();

        let object_bytes = objects.len();
        objects.close().map_err(|e| BuildError::from(e).during(Phase::AssignIds, processed))?;
        info!(terms, occurrences = occurrence_count, object_bytes, "assigned term ids");

        let mut processed = 0;
        let (triples, quads) = {
            let _span = info_span!("reassemble", statements).entered();
            reassemble(&options, &mut assigned, stats, &mut sink, &mut processed)
                .map_err(|e| e.during(Phase::Reassemble, processed))?
        };
        assigned.close();

        if triples + quads != statements {
            return Err(BuildError::Reassembly { statement: triples + quads }.during(Phase::Reassemble, processed));
        }
        info!(triples, quads, "reassembled coded tuples");

        let mut processed = 0;
        let hash_index = {
            let _span = info_span!("hash_index", terms).entered();
            pack_hash_index(&options, &dir, &mut hashes, &mut processed)
                .map_err(|e| e.during(Phase::HashIndex, processed))?
        };
        hashes.close();

        Ok(NodeTableSummary {
            statements,
            triples,
            quads,
            terms,
            occurrences: occurrence_count,
            object_bytes,
            hash_index,
        })
    }
}

fn assign_ids<H: ContentHasher>(
    options: &NodeTableOptions,
    occurrences: &mut SortedBag,
    objects: &mut ObjectFile,
    hasher: &H,
    assigned: &mut SortedBag,
    hashes: &mut SortedBag,
    processed: &mut u64,
) -> Result<u64, BuildError> {
    let mut terms = 0;
    let mut current: Option<(Vec<u8>, TermId)> = None;

    for record in occurrences.iter()? {
        options.check_abort(Phase::AssignIds, *processed)?;
        let (encoded, occurrence) = record?;

        let known = current.as_ref().filter(|(prev, _)| *prev == encoded).map(|(_, id)| *id);
        let id = match known {
            Some(id) => id,
            None => {
                let id = TermId(objects.append(&encoded)?);
                hashes.add(hasher.hash(&encoded).to_vec(), id.to_be_bytes().to_vec())?;
                current = Some((encoded, id));
                terms += 1;
                id
            },
        };

        assigned.add(occurrence, id.to_be_bytes().to_vec())?;
        *processed += 1;
    }

    Ok(terms)
}

fn coded_tuple(statement: u64, slots: [Option<TermId>; 4]) -> Result<CodedTuple, BuildError> {
    match slots {
        [None, Some(s), Some(p), Some(o)] => Ok(CodedTuple::Triple([s, p, o])),
        [Some(g), Some(s), Some(p), Some(o)] => Ok(CodedTuple::Quad([g, s, p, o])),
        _ => Err(BuildError::Reassembly { statement }),
    }
}

fn reassemble<C, F>(
    options: &NodeTableOptions,
    assigned: &mut SortedBag,
    stats: &mut C,
    sink: &mut F,
    processed: &mut u64,
) -> Result<(u64, u64), BuildError>
where
    C: StatisticsCollector + ?Sized,
    F: FnMut(CodedTuple) -> Result<(), BuildError>,
{
    let (mut triples, mut quads) = (0, 0);
    let mut pending: Option<(u64, [Option<TermId>; 4])> = None;

    let mut emit = |statement: u64, slots: [Option<TermId>; 4]| -> Result<(), BuildError> {
        // statements are numbered densely from zero; a gap means one was lost
        if statement != triples + quads {
            return Err(BuildError::Reassembly { statement: triples + quads });
        }

        let tuple = coded_tuple(statement, slots)?;
        let [s, p, o] = tuple.spo();
        stats.record(tuple.graph(), s, p, o);

        match tuple {
            CodedTuple::Triple(_) => triples += 1,
            CodedTuple::Quad(_) => quads += 1,
        }

        sink(tuple)
    };

    for record in assigned.iter()? {
        options.check_abort(Phase::Reassemble, *processed)?;
        let (key, value) = record?;

        let (statement, slot) = split_occurrence_key(&key).ok_or(BuildError::Reassembly { statement: *processed })?;
        let id = TermId::from_be_slice(&value).ok_or(BuildError::Reassembly { statement })?;

        match &mut pending {
            Some((seq, slots)) if *seq == statement => slots[slot] = Some(id),
            _ => {
                if let Some((seq, slots)) = pending.take() {
                    emit(seq, slots)?;
                }
                let mut slots = [None; 4];
                slots[slot] = Some(id);
                pending = Some((statement, slots));
            },
        }

        *processed += 1;
    }

    if let Some((seq, slots)) = pending {
        emit(seq, slots)?;
    }

    Ok((triples, quads))
}

fn pack_hash_index(
    options: &NodeTableOptions,
    dir: &Path,
    hashes: &mut SortedBag,
    processed: &mut u64,
) -> Result<PackedTree, BuildError> {
    let mut storage = FileBlockStorage::create(dir.join(NODE_INDEX_FILE_NAME), options.block_size)?;

    let records = hashes.iter()?.map(|record| -> Result<_, BuildError> {
        options.check_abort(Phase::HashIndex, *processed)?;
        *processed += 1;
        Ok(record?)
    });

    let packed = pack_into_tree(records, NODE_INDEX_LAYOUT, &mut storage)?;
    debug!(blocks = packed.blocks, height = packed.header.height, "packed node index");
    Ok(packed)
}
