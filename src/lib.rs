pub mod bptree;
pub mod config;
pub mod error;
pub mod loader;
pub mod node_table;
pub mod object_file;
pub mod progress;
pub mod rdf;
pub mod sort;
pub mod stats;

pub use config::LoaderConfig;
pub use error::BuildError;
pub use loader::{dump, AbortSignal, LoadSummary, Loader};
pub use node_table::{NodeTable, NodeTableBuilder};
