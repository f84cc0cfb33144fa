//! A complete bulk load: statements in, a published store directory out.
//!
//! The store is built in `<location>.partial` and renamed to `<location>` only
//! once every file is written and synced. On any failure the partial
//! directory is removed, so a location either holds a finished store or
//! does not exist.
//!
//! Store layout:
//!
//! ```text
//! nodes.dat      encoded terms, offset = term id
//! node2id.bpt    content hash -> term id
//! SPO.bpt ...    one tuple index per configured order
//! stats.opt      usage counts
//! manifest.txt   record counts
//! ```

use crate::{
    bptree::{pack_into_tree, BPlusTree, FileBlockStorage, RecordLayout},
    config::{LoaderConfig, TupleOrder},
    error::{BuildError, IndexBuildError, ParseError, Phase},
    node_table::{NodeTable, NodeTableBuilder, NodeTableOptions, NodeTableSummary},
    progress::LogProgressMonitor,
    rdf::{blank_nodes::BlankNodeAllocator, input_file_iter, parser::send_statement_file, StatementRecord},
    sort::{SortConfig, SortedBag},
    stats::{StatsCollector, StatsMeta, STATS_FILE_NAME},
};
use std::{
    ffi::OsString,
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, info, info_span, warn};

pub const PARTIAL_SUFFIX: &str = "partial";
/// Present in every partial build directory this loader creates.
pub const PARTIAL_MARKER_FILE_NAME: &str = ".bulk-load-partial";
pub const MANIFEST_FILE_NAME: &str = "manifest.txt";
pub const TUPLE_INDEX_FILE_EXTENSION: &str = "bpt";

const STATEMENT_CHANNEL_BOUND: usize = 16 * 1024;

/// Cooperative cancellation for a running build.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub fn partial_location(location: &Path) -> PathBuf {
    let mut name = location.file_name().map(OsString::from).unwrap_or_default();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    location.with_file_name(name)
}

pub fn tuple_index_path(location: &Path, order: &TupleOrder) -> PathBuf {
    location.join(format!("{}.{}", order.name(), TUPLE_INDEX_FILE_EXTENSION))
}

/// A build directory that is deleted unless published.
struct PartialDir {
    path: PathBuf,
    published: bool,
}

impl PartialDir {
    fn create(location: &Path) -> Result<Self, BuildError> {
        let path = partial_location(location);

        if path.exists() {
            if !path.join(PARTIAL_MARKER_FILE_NAME).is_file() {
                return Err(BuildError::ForeignPartial(path));
            }
            warn!(path = %path.display(), "removing leftover partial build");
            fs::remove_dir_all(&path)?;
        }

        fs::create_dir_all(&path)?;
        let partial = Self { path, published: false };
        File::create(partial.path.join(PARTIAL_MARKER_FILE_NAME))?;
        Ok(partial)
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn publish(mut self, location: &Path) -> io::Result<()> {
        fs::remove_file(self.path.join(PARTIAL_MARKER_FILE_NAME))?;
        fs::rename(&self.path, location)?;
        self.published = true;
        Ok(())
    }
}

impl Drop for PartialDir {
    fn drop(&mut self) {
        if self.published {
            return;
        }

        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed partial build"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove partial build"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSummary {
    pub order: String,
    pub records: u64,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct LoadSummary {
    pub location: PathBuf,
    pub files: usize,
    pub node_table: NodeTableSummary,
    pub indexes: Vec<IndexSummary>,
    pub elapsed: Duration,
}

/// Sorted, de-duplicated tuple keys for one ordering.
struct TupleIndexBuilder {
    order: TupleOrder,
    keys: SortedBag,
}

impl TupleIndexBuilder {
    fn new(order: TupleOrder, sort: SortConfig) -> Self {
        Self { order, keys: SortedBag::new("tuple index", sort).distinct() }
    }

    fn build(mut self, dir: &Path, options: &NodeTableOptions, processed: &mut u64) -> Result<IndexSummary, BuildError> {
        let mut storage = FileBlockStorage::create(tuple_index_path(dir, &self.order), options.block_size)?;

        let records = self.keys.iter()?.map(|record| -> Result<_, BuildError> {
            options.check_abort(Phase::TupleIndexes, *processed)?;
            *processed += 1;
            Ok(record?)
        });

        let packed = pack_into_tree(records, RecordLayout::new(self.order.key_len(), 0), &mut storage)?;

        info!(
            order = %self.order,
            records = packed.header.records,
            height = packed.header.height,
            "packed tuple index"
        );

        Ok(IndexSummary { order: self.order.name().to_owned(), records: packed.header.records, height: packed.header.height })
    }
}

/// All input files below `inputs`, each directory walked in path order.
pub fn discover_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, BuildError> {
    let mut files = Vec::new();
    for input in inputs {
        for entry in input_file_iter(input) {
            files.push(entry.map_err(io::Error::from)?.into_path());
        }
    }
    Ok(files)
}

fn unix_timestamp() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

fn sync_file(bw: BufWriter<File>) -> io::Result<()> {
    bw.into_inner().map_err(io::IntoInnerError::into_error)?.sync_all()
}

pub struct Loader {
    config: LoaderConfig,
    run_id: String,
    abort: AbortSignal,
}

impl Loader {
    /// `run_id` scopes blank node labels: two loads with the same run id and inputs produce identical stores.
    pub fn new(config: LoaderConfig, run_id: impl Into<String>) -> Self {
        Self { config, run_id: run_id.into(), abort: AbortSignal::new() }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Handle to cancel a running load from another thread.
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Load every n-triples/n-quads file found under `inputs` into a new store at `location`.
    pub fn load(&self, location: &Path, inputs: &[PathBuf]) -> Result<LoadSummary, BuildError> {
        let files = discover_inputs(inputs)?;
        let file_count = files.len();
        info!(files = file_count, "discovered input files");

        let allocator = BlankNodeAllocator::new(&self.run_id);

        let mut summary = std::thread::scope(|s| {
            let (tx, rx) = mpsc::sync_channel::<Result<StatementRecord, ParseError>>(STATEMENT_CHANNEL_BOUND);

            let reader = s.spawn(move || {
                for file in &files {
                    let scope = allocator.scope(&file.to_string_lossy());

                    match send_statement_file(file, &scope, &tx) {
                        Ok(statements) => debug!(file = %file.display(), statements, "parsed input file"),
                        Err(ParseError::Disconnected) => break,
                        Err(e) => {
                            warn!(file = %file.display(), error = %e, "failed to parse input file");
                            let _ = tx.send(Err(e));
                            break;
                        },
                    }
                }
            });

            let result = self.load_statements(location, rx.into_iter().map(|statement| statement.map_err(BuildError::from)));

            if let Err(panic) = reader.join() {
                std::panic::resume_unwind(panic);
            }

            result
        })?;

        summary.files = file_count;
        Ok(summary)
    }

    /// Build a new store at `location` from already parsed statements.
    pub fn load_statements<I>(&self, location: &Path, statements: I) -> Result<LoadSummary, BuildError>
    where
        I: IntoIterator<Item = Result<StatementRecord, BuildError>>,
    {
        let started = Instant::now();
        let _span = info_span!("load", location = %location.display(), run = %self.run_id).entered();

        if location.exists() {
            return Err(BuildError::LocationExists(location.to_owned()));
        }

        let partial = PartialDir::create(location)?;
        let (node_table, indexes) = match self.build_into(partial.path(), statements) {
            Ok(built) => built,
            Err(e) => {
                if e.is_aborted() {
                    warn!(error = %e, "load aborted");
                }
                return Err(e);
            },
        };

        partial.publish(location).map_err(|e| BuildError::from(e).during(Phase::Publish, node_table.statements))?;

        let elapsed = started.elapsed();
        info!(
            statements = node_table.statements,
            terms = node_table.terms,
            indexes = indexes.len(),
            secs = elapsed.as_secs_f64(),
            "published store"
        );

        Ok(LoadSummary { location: location.to_owned(), files: 0, node_table, indexes, elapsed })
    }

    fn build_into<I>(&self, dir: &Path, statements: I) -> Result<(NodeTableSummary, Vec<IndexSummary>), BuildError>
    where
        I: IntoIterator<Item = Result<StatementRecord, BuildError>>,
    {
        let config = &self.config;
        let options = config.node_table_options(self.abort.clone());

        let mut progress = LogProgressMonitor::new("statements", config.progress.tick_interval);
        let mut builder = NodeTableBuilder::create(dir, options.clone(), &mut progress)?;

        {
            let _span = info_span!("ingest").entered();
            for statement in statements {
                let statement = statement.map_err(|e| e.during(Phase::Ingest, builder.statements()))?;
                builder.add(&statement)?;
            }
        }

        let mut indexes: Vec<_> = config
            .index
            .triple_orders
            .iter()
            .chain(&config.index.quad_orders)
            .map(|order| TupleIndexBuilder::new(order.clone(), options.sort.clone()))
            .collect();

        let mut stats = StatsCollector::default();
        let node_table = builder.finish(&mut stats, |tuple| {
            for index in indexes.iter_mut().filter(|index| index.order.arity() == tuple.arity()) {
                index.keys.add(index.order.key(&tuple), Vec::new())?;
            }
            Ok(())
        })?;

        let mut built = Vec::with_capacity(indexes.len());
        {
            let _span = info_span!("tuple_indexes", count = indexes.len()).entered();
            for index in indexes {
                let mut processed = 0;
                let summary =
                    index.build(dir, &options, &mut processed).map_err(|e| e.during(Phase::TupleIndexes, processed))?;
                built.push(summary);
            }
        }

        if config.build.stats {
            self.write_stats(dir, &stats).map_err(|e| e.during(Phase::Publish, stats.count()))?;
        }

        write_manifest(dir, &self.run_id, &node_table, &built).map_err(|e| BuildError::from(e).during(Phase::Publish, 0))?;

        Ok((node_table, built))
    }

    fn write_stats(&self, dir: &Path, stats: &StatsCollector) -> Result<(), BuildError> {
        let table = NodeTable::open(dir)?;
        let mut out = BufWriter::new(File::create(dir.join(STATS_FILE_NAME))?);

        let meta = StatsMeta { timestamp: unix_timestamp(), run_id: &self.run_id };
        stats.write_to(&mut out, &meta, |id| Ok::<_, BuildError>(table.term(id)?.to_string()))?;

        sync_file(out)?;
        Ok(())
    }
}

fn write_manifest(dir: &Path, run_id: &str, node_table: &NodeTableSummary, indexes: &[IndexSummary]) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(dir.join(MANIFEST_FILE_NAME))?);

    writeln!(out, "run_id = {run_id:?}")?;
    writeln!(out, "statements = {}", node_table.statements)?;
    writeln!(out, "triples = {}", node_table.triples)?;
    writeln!(out, "quads = {}", node_table.quads)?;
    writeln!(out, "terms = {}", node_table.terms)?;
    writeln!(out, "object_bytes = {}", node_table.object_bytes)?;
    for index in indexes {
        writeln!(out, "index.{} = {}", index.order, index.records)?;
    }

    sync_file(out)
}

/// Write every statement of the store at `location` as n-triples / n-quads text,
/// triples first, each in primary index order. Returns the number of statements.
pub fn dump<W: Write>(location: &Path, out: &mut W) -> Result<u64, BuildError> {
    let table = NodeTable::open(location)?;
    let mut written = 0;

    for (name, required) in [("SPO", true), ("GSPO", false)] {
        let order = TupleOrder::parse(name)?;
        let path = tuple_index_path(location, &order);

        if !path.exists() {
            if required {
                return Err(BuildError::MissingIndex(name.to_owned()));
            }
            continue;
        }

        let tree = BPlusTree::open(&path)?;
        for record in tree.iter() {
            let (key, _) = record?;
            let tuple = order
                .tuple(key)
                .ok_or_else(|| IndexBuildError::Corrupt(format!("{name} key of {} bytes", key.len())))?;

            let [s, p, o] = tuple.spo();
            write!(out, "{} {} {}", table.term(s)?, table.term(p)?, table.term(o)?)?;
            if let Some(g) = tuple.graph() {
                write!(out, " {}", table.term(g)?)?;
            }
            writeln!(out, " .")?;

            written += 1;
        }
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_location_is_a_sibling() {
        assert_eq!(partial_location(Path::new("/data/store")), PathBuf::from("/data/store.partial"));
        assert_eq!(partial_location(Path::new("db")), PathBuf::from("db.partial"));
    }

    #[test]
    fn abort_signal_is_shared() {
        let signal = AbortSignal::new();
        let clone = signal.clone();
        assert!(!signal.is_aborted());
        clone.abort();
        assert!(signal.is_aborted());
    }

    #[test]
    fn partial_dir_is_removed_unless_published() {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("store");

        let partial = PartialDir::create(&location).unwrap();
        assert!(partial_location(&location).is_dir());
        drop(partial);
        assert!(!partial_location(&location).exists());

        let partial = PartialDir::create(&location).unwrap();
        fs::write(partial.path().join("file"), b"x").unwrap();
        partial.publish(&location).unwrap();
        assert!(location.join("file").is_file());
        assert!(!location.join(PARTIAL_MARKER_FILE_NAME).exists());
        assert!(!partial_location(&location).exists());
    }

    #[test]
    fn leftover_partial_dir_is_replaced_only_if_ours() {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("store");
        let leftover = partial_location(&location);

        fs::create_dir(&leftover).unwrap();
        fs::write(leftover.join("precious"), b"x").unwrap();
        assert!(matches!(PartialDir::create(&location), Err(BuildError::ForeignPartial(_))));
        assert!(leftover.join("precious").is_file());

        fs::write(leftover.join(PARTIAL_MARKER_FILE_NAME), b"").unwrap();
        let partial = PartialDir::create(&location).unwrap();
        assert!(!leftover.join("precious").exists());
        assert!(leftover.join(PARTIAL_MARKER_FILE_NAME).is_file());
        drop(partial);
        assert!(!leftover.exists());
    }
}
