//! Usage counts for query planning, persisted as an s-expression:
//!
//! ```text
//! (stats
//!   (meta
//!     (timestamp 1700000000)
//!     (run@ "run-1")
//!     (count 3))
//!   (<http://example.org/p> 3)
//!   (graphs
//!     (<http://example.org/g> 1)))
//! ```

use crate::rdf::TermId;
use std::{
    collections::HashMap,
    hash::BuildHasherDefault,
    io::{self, Write},
};

pub const STATS_FILE_NAME: &str = "stats.opt";

type CountMap = HashMap<TermId, u64, BuildHasherDefault<ahash::AHasher>>;

/// Receives one call per coded tuple.
pub trait StatisticsCollector {
    fn record(&mut self, graph: Option<TermId>, subject: TermId, predicate: TermId, object: TermId);
}

impl<C: StatisticsCollector + ?Sized> StatisticsCollector for &mut C {
    fn record(&mut self, graph: Option<TermId>, subject: TermId, predicate: TermId, object: TermId) {
        (**self).record(graph, subject, predicate, object)
    }
}

/// Discards everything.
impl StatisticsCollector for () {
    fn record(&mut self, _: Option<TermId>, _: TermId, _: TermId, _: TermId) {}
}

#[derive(Debug, Default, Clone)]
pub struct StatsCollector {
    count: u64,
    predicates: CountMap,
    graphs: CountMap,
}

impl StatisticsCollector for StatsCollector {
    fn record(&mut self, graph: Option<TermId>, _subject: TermId, predicate: TermId, _object: TermId) {
        self.count += 1;
        *self.predicates.entry(predicate).or_default() += 1;
        if let Some(graph) = graph {
            *self.graphs.entry(graph).or_default() += 1;
        }
    }
}

fn sorted(counts: &CountMap) -> Vec<(TermId, u64)> {
    let mut entries: Vec<_> = counts.iter().map(|(id, n)| (*id, *n)).collect();
    entries.sort_unstable();
    entries
}

#[derive(Debug, Clone)]
pub struct StatsMeta<'a> {
    pub timestamp: u64,
    pub run_id: &'a str,
}

impl StatsCollector {
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn predicate_count(&self, predicate: TermId) -> u64 {
        self.predicates.get(&predicate).copied().unwrap_or(0)
    }

    pub fn graph_count(&self, graph: TermId) -> u64 {
        self.graphs.get(&graph).copied().unwrap_or(0)
    }

    pub fn predicates(&self) -> Vec<(TermId, u64)> {
        sorted(&self.predicates)
    }

    pub fn graphs(&self) -> Vec<(TermId, u64)> {
        sorted(&self.graphs)
    }

    /// Write the stats file, rendering term ids with `render`. Entries are in term id order.
    pub fn write_to<W, F, E>(&self, out: &mut W, meta: &StatsMeta<'_>, mut render: F) -> Result<(), E>
    where
        W: Write,
        F: FnMut(TermId) -> Result<String, E>,
        E: From<io::Error>,
    {
        writeln!(out, "(stats")?;
        writeln!(out, "  (meta")?;
        writeln!(out, "    (timestamp {})", meta.timestamp)?;
        writeln!(out, "    (run@ \"{}\")", meta.run_id.escape_default())?;
        write!(out, "    (count {}))", self.count)?;

        for (predicate, n) in self.predicates() {
            write!(out, "\n  ({} {})", render(predicate)?, n)?;
        }

        if !self.graphs.is_empty() {
            write!(out, "\n  (graphs")?;
            for (graph, n) in self.graphs() {
                write!(out, "\n    ({} {})", render(graph)?, n)?;
            }
            write!(out, ")")?;
        }

        writeln!(out, ")")?;
        Ok(())
    }
}
