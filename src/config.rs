//! Loader tunables, loadable from a TOML file. Every field has a default:
//!
//! ```toml
//! [sort]
//! threshold = { records = 1000000 }   # or { bytes = 268435456 }
//! spill_dir = "/var/tmp"
//! parallel = true
//!
//! [index]
//! block_size = 8192
//! triple_orders = ["SPO", "POS", "OSP"]
//! quad_orders = ["GSPO", "GPOS", "GOSP", "SPOG", "POSG", "OSPG"]
//!
//! [progress]
//! tick_interval = 50000
//!
//! [build]
//! abort_check_interval = 1000
//! stats = true
//! run_id = "2024-01-01"
//! ```

use crate::{
    bptree::{RecordLayout, DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE},
    error::ConfigError,
    loader::AbortSignal,
    node_table::{NodeTableOptions, DEFAULT_ABORT_CHECK_INTERVAL, NODE_INDEX_LAYOUT},
    progress::DEFAULT_TICK_INTERVAL,
    rdf::{CodedTuple, TermId},
    sort::{SortConfig, SpillThreshold},
};
use serde::Deserialize;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

/// A tuple index ordering such as `SPO` or `GPOS`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct TupleOrder {
    name: String,
    /// For each key position, the index into the canonical tuple (`spo` or `gspo`).
    positions: Vec<usize>,
}

impl TupleOrder {
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        let name = name.to_ascii_uppercase();
        let canonical = if name.len() == 4 { "GSPO" } else { "SPO" };

        let mut positions = Vec::with_capacity(name.len());
        for c in name.chars() {
            match canonical.find(c) {
                Some(pos) if !positions.contains(&pos) => positions.push(pos),
                _ => return Err(ConfigError::TupleOrder(name)),
            }
        }

        if positions.len() != canonical.len() {
            return Err(ConfigError::TupleOrder(name));
        }

        Ok(Self { name, positions })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.positions.len()
    }

    /// The canonical order of this arity: `SPO` or `GSPO`.
    pub fn is_primary(&self) -> bool {
        self.positions.iter().enumerate().all(|(i, pos)| i == *pos)
    }

    pub fn key_len(&self) -> usize {
        self.arity() * TermId::WIDTH
    }

    /// Index key for `tuple`, which must have this order's arity.
    pub fn key(&self, tuple: &CodedTuple) -> Vec<u8> {
        let ids = tuple.ids();
        let mut key = Vec::with_capacity(self.key_len());
        for pos in &self.positions {
            key.extend_from_slice(&ids[*pos].to_be_bytes());
        }
        key
    }

    /// Inverse of [`TupleOrder::key`].
    pub fn tuple(&self, key: &[u8]) -> Option<CodedTuple> {
        if key.len() != self.key_len() {
            return None;
        }

        let mut ids = [TermId(0); 4];
        for (chunk, pos) in key.chunks_exact(TermId::WIDTH).zip(&self.positions) {
            ids[*pos] = TermId::from_be_slice(chunk)?;
        }

        Some(match self.arity() {
            3 => CodedTuple::Triple([ids[0], ids[1], ids[2]]),
            _ => CodedTuple::Quad(ids),
        })
    }
}

impl TryFrom<String> for TupleOrder {
    type Error = ConfigError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::parse(&name)
    }
}

impl std::str::FromStr for TupleOrder {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::parse(name)
    }
}

impl fmt::Display for TupleOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn orders(names: &[&str]) -> Vec<TupleOrder> {
    names.iter().filter_map(|name| TupleOrder::parse(name).ok()).collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SortSettings {
    pub threshold: SpillThreshold,
    pub spill_dir: Option<PathBuf>,
    pub parallel: bool,
}

impl Default for SortSettings {
    fn default() -> Self {
        Self { threshold: SpillThreshold::default(), spill_dir: None, parallel: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexSettings {
    pub block_size: usize,
    pub triple_orders: Vec<TupleOrder>,
    pub quad_orders: Vec<TupleOrder>,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            triple_orders: orders(&["SPO", "POS", "OSP"]),
            quad_orders: orders(&["GSPO", "GPOS", "GOSP", "SPOG", "POSG", "OSPG"]),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProgressSettings {
    pub tick_interval: u64,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self { tick_interval: DEFAULT_TICK_INTERVAL }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildSettings {
    pub abort_check_interval: u64,
    pub stats: bool,
    pub run_id: Option<String>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self { abort_check_interval: DEFAULT_ABORT_CHECK_INTERVAL, stats: true, run_id: None }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    pub sort: SortSettings,
    pub index: IndexSettings,
    pub progress: ProgressSettings,
    pub build: BuildSettings,
}

impl LoaderConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: LoaderConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_owned(), source })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.index.block_size < MIN_BLOCK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "index.block_size must be at least {MIN_BLOCK_SIZE} (got {})",
                self.index.block_size
            )));
        }

        // the node index and quad indexes have the widest entries
        for layout in [NODE_INDEX_LAYOUT, RecordLayout::new(4 * TermId::WIDTH, 0)] {
            layout
                .check_block_size(self.index.block_size)
                .map_err(|e| ConfigError::Invalid(format!("index.block_size: {e}")))?;
        }

        for (key, list, arity) in [("triple_orders", &self.index.triple_orders, 3), ("quad_orders", &self.index.quad_orders, 4)] {
            if let Some(order) = list.iter().find(|order| order.arity() != arity) {
                return Err(ConfigError::Invalid(format!("index.{key} contains {order}, which is not {arity} terms wide")));
            }
            if !list.iter().any(TupleOrder::is_primary) {
                return Err(ConfigError::Invalid(format!("index.{key} must include the primary order")));
            }
        }

        if matches!(self.sort.threshold, SpillThreshold::Records(0) | SpillThreshold::Bytes(0)) {
            return Err(ConfigError::Invalid("sort.threshold must be positive".to_owned()));
        }

        Ok(())
    }

    pub fn sort_config(&self) -> SortConfig {
        SortConfig {
            threshold: self.sort.threshold,
            spill_dir: self.sort.spill_dir.clone().unwrap_or_else(std::env::temp_dir),
            parallel: self.sort.parallel,
        }
    }

    pub fn node_table_options(&self, abort: AbortSignal) -> NodeTableOptions {
        NodeTableOptions {
            sort: self.sort_config(),
            block_size: self.index.block_size,
            abort,
            abort_check_interval: self.build.abort_check_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = LoaderConfig::from_toml_str("").unwrap();
        assert_eq!(config.index.block_size, 8192);
        assert_eq!(config.sort.threshold, SpillThreshold::Records(1_000_000));
        assert_eq!(config.progress.tick_interval, 50_000);
        assert_eq!(config.build.abort_check_interval, 1_000);
        assert!(config.build.stats);
        assert_eq!(config.index.triple_orders.iter().map(TupleOrder::name).collect::<Vec<_>>(), ["SPO", "POS", "OSP"]);
        assert_eq!(config.index.quad_orders.len(), 6);
    }

    #[test]
    fn parses_full_file() {
        let config = LoaderConfig::from_toml_str(
            r#"
            [sort]
            threshold = { bytes = 4096 }
            spill_dir = "/scratch"
            parallel = false

            [index]
            block_size = 512
            triple_orders = ["spo", "OPS"]
            quad_orders = ["GSPO"]

            [build]
            run_id = "fixed"
            stats = false
            "#,
        )
        .unwrap();

        assert_eq!(config.sort.threshold, SpillThreshold::Bytes(4096));
        assert_eq!(config.sort_config().spill_dir, PathBuf::from("/scratch"));
        assert!(!config.sort.parallel);
        assert_eq!(config.index.block_size, 512);
        assert_eq!(config.index.triple_orders[1].name(), "OPS");
        assert_eq!(config.build.run_id.as_deref(), Some("fixed"));
        assert!(!config.build.stats);
    }

    #[test]
    fn rejects_bad_values() {
        for toml in [
            "[index]\nblock_size = 16",
            "[index]\nblock_size = 64",
            "[index]\ntriple_orders = [\"POS\"]",
            "[index]\ntriple_orders = [\"SPOO\"]",
            "[index]\nquad_orders = [\"SPO\"]",
            "[sort]\nthreshold = { records = 0 }",
            "[sort]\nunknown = 1",
        ] {
            assert!(LoaderConfig::from_toml_str(toml).is_err(), "{toml}");
        }
    }

    #[test]
    fn tuple_order_keys() {
        let pos = TupleOrder::parse("POS").unwrap();
        let tuple = CodedTuple::Triple([TermId(1), TermId(2), TermId(3)]);
        let key = pos.key(&tuple);

        assert_eq!(key.len(), 24);
        assert_eq!(&key[..8], &2u64.to_be_bytes());
        assert_eq!(&key[16..], &1u64.to_be_bytes());
        assert_eq!(pos.tuple(&key), Some(tuple));
        assert!(!pos.is_primary());

        let gosp = TupleOrder::parse("GOSP").unwrap();
        let quad = CodedTuple::Quad([TermId(9), TermId(1), TermId(2), TermId(3)]);
        assert_eq!(gosp.tuple(&gosp.key(&quad)), Some(quad));
        assert!(TupleOrder::parse("GSPO").unwrap().is_primary());

        for bad in ["SP", "SPP", "GSPX", "GGPO", "SPOGX"] {
            assert!(TupleOrder::parse(bad).is_err(), "{bad}");
        }
    }
}
