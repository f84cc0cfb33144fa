use std::{fmt, io};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed term encoding: {0}")]
    Malformed(String),
    #[error("encode buffer too small: need at least {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("offset {offset} is out of range (object file length {len})")]
    OutOfRange { offset: u64, len: u64 },
    #[error("offset {offset} refers to an aborted write")]
    Abandoned { offset: u64 },
    #[error("another write is already in progress at offset {offset}")]
    WriteInProgress { offset: u64 },
    #[error("write of {len} bytes exceeds its reservation of {capacity} bytes")]
    Overflow { len: usize, capacity: usize },
    #[error("object file I/O error")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SortEngineError {
    #[error("failed to spill sort run")]
    SpillFailed(#[source] io::Error),
    #[error("records cannot be added once merging has started")]
    AlreadyMerging,
    #[error("failed to read sort run")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum IndexBuildError {
    #[error("input is not sorted: record {position} has a key lower than its predecessor")]
    UnsortedInput { position: u64 },
    #[error("record width mismatch: expected {expected} bytes, got {found}")]
    RecordWidth { expected: usize, found: usize },
    #[error("block size {block_size} cannot hold two records of {record_width} bytes")]
    BlockTooSmall { block_size: usize, record_width: usize },
    #[error("corrupt index file: {0}")]
    Corrupt(String),
    #[error("index I/O error")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("syntax error")]
    Syntax(#[from] rio_turtle::TurtleError),
    #[error("unsupported input: {0}")]
    Unsupported(&'static str),
    #[error("statement consumer hung up")]
    Disconnected,
    #[error("failed to read input")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Ingest,
    AssignIds,
    Reassemble,
    HashIndex,
    TupleIndexes,
    Publish,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Ingest => "ingest",
            Phase::AssignIds => "identifier assignment",
            Phase::Reassemble => "statement reassembly",
            Phase::HashIndex => "hash index packing",
            Phase::TupleIndexes => "tuple index build",
            Phase::Publish => "publish",
        };

        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sort(#[from] SortEngineError),
    #[error(transparent)]
    Index(#[from] IndexBuildError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("statement source failed")]
    Source(#[from] ParseError),
    #[error("{} already exists; bulk loads only create new locations", .0.display())]
    LocationExists(std::path::PathBuf),
    #[error("{} was not created by a bulk load; refusing to remove it", .0.display())]
    ForeignPartial(std::path::PathBuf),
    #[error("no index for the primary order {0} in this location")]
    MissingIndex(String),
    #[error("statement {statement} is missing a term after reassembly")]
    Reassembly { statement: u64 },
    #[error("build aborted during {phase} after {processed} records")]
    Aborted { phase: Phase, processed: u64 },
    #[error("{phase} failed after {processed} records")]
    InPhase {
        phase: Phase,
        processed: u64,
        #[source]
        source: Box<BuildError>,
    },
    #[error("build I/O error")]
    Io(#[from] io::Error),
}

impl BuildError {
    /// Attach the phase and progress counter, unless the error already carries them.
    pub fn during(self, phase: Phase, processed: u64) -> Self {
        match self {
            e @ (BuildError::Aborted { .. } | BuildError::InPhase { .. }) => e,
            e => BuildError::InPhase { phase, processed, source: Box::new(e) },
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, BuildError::Aborted { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}", path.display())]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse TOML config")]
    Parse(#[from] toml::de::Error),
    #[error("invalid tuple order {0:?}: expected a permutation of SPO or GSPO")]
    TupleOrder(String),
    #[error("config error: {0}")]
    Invalid(String),
}
