//! External sort over byte key/value records.
//!
//! Records accumulate in memory until the spill threshold is reached, then the
//! buffer is sorted (on the rayon pool when `parallel` is set) and written out
//! as a run. [`SortedBag::iter`] sorts whatever is still buffered and k-way
//! merges it with every spilled run. The merge itself is single threaded, so
//! the output order never depends on scheduling.
//!
//! Order: key bytes, then the optional value comparator, then insertion order.

pub mod merge;
pub mod run_file;

use crate::error::SortEngineError;
use merge::{KWayMerge, MemorySource, Source};
use rayon::slice::ParallelSliceMut;
use run_file::{RunReader, SpilledRun};
use serde::Deserialize;
use std::{cmp::Ordering, path::PathBuf};

pub type SortRecord = (Vec<u8>, Vec<u8>);

/// Secondary ordering on values for records with equal keys.
pub type ValueComparator = fn(&[u8], &[u8]) -> Ordering;

/// Approximate heap overhead of one buffered record: two `Vec` headers.
const RECORD_OVERHEAD: usize = 2 * std::mem::size_of::<Vec<u8>>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpillThreshold {
    /// Spill once this many records are buffered.
    Records(usize),
    /// Spill once the estimated buffer size reaches this many bytes.
    Bytes(usize),
}

impl Default for SpillThreshold {
    fn default() -> Self {
        SpillThreshold::Records(1_000_000)
    }
}

#[derive(Debug, Clone)]
pub struct SortConfig {
    pub threshold: SpillThreshold,
    pub spill_dir: PathBuf,
    pub parallel: bool,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self { threshold: SpillThreshold::default(), spill_dir: std::env::temp_dir(), parallel: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Accumulating,
    Merging,
}

pub struct SortedBag {
    name: &'static str,
    config: SortConfig,
    value_cmp: Option<ValueComparator>,
    distinct: bool,
    state: State,
    buffer: Vec<SortRecord>,
    buffered_bytes: usize,
    runs: Vec<SpilledRun>,
    total: u64,
}

impl SortedBag {
    pub fn new(name: &'static str, config: SortConfig) -> Self {
        Self {
            name,
            config,
            value_cmp: None,
            distinct: false,
            state: State::Accumulating,
            buffer: Vec::new(),
            buffered_bytes: 0,
            runs: Vec::new(),
            total: 0,
        }
    }

    #[must_use]
    pub fn with_value_order(mut self, cmp: ValueComparator) -> Self {
        self.value_cmp = Some(cmp);
        self
    }

    /// Drop records equal (key and value) to the record emitted just before them.
    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Records added so far.
    pub fn len(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn spilled_runs(&self) -> usize {
        self.runs.len()
    }

    pub fn add(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), SortEngineError> {
        if self.state != State::Accumulating {
            return Err(SortEngineError::AlreadyMerging);
        }

        self.buffered_bytes += key.len() + value.len() + RECORD_OVERHEAD;
        self.buffer.push((key, value));
        self.total += 1;

        let over = match self.config.threshold {
            SpillThreshold::Records(max) => self.buffer.len() >= max.max(1),
            SpillThreshold::Bytes(max) => self.buffered_bytes >= max.max(1),
        };

        if over {
            self.spill()?;
        }

        Ok(())
    }

    fn sort_buffer(&mut self) {
        let value_cmp = self.value_cmp;
        let cmp = move |a: &SortRecord, b: &SortRecord| compare(value_cmp, a, b);

        // both sorts are stable: equal records keep insertion order
        if self.config.parallel {
            self.buffer.par_sort_by(cmp);
        } else {
            self.buffer.sort_by(cmp);
        }
    }

    fn spill(&mut self) -> Result<(), SortEngineError> {
        self.sort_buffer();

        let run = run_file::write_run(&self.config.spill_dir, &self.buffer).map_err(SortEngineError::SpillFailed)?;

        tracing::debug!(
            bag = self.name,
            run = self.runs.len(),
            records = run.records(),
            bytes = run.bytes(),
            "spilled sort run"
        );

        self.runs.push(run);
        self.buffer.clear();
        self.buffered_bytes = 0;
        Ok(())
    }

    /// Switch to merging and return the globally sorted stream. Only callable once.
    pub fn iter(&mut self) -> Result<SortedIter, SortEngineError> {
        if self.state != State::Accumulating {
            return Err(SortEngineError::AlreadyMerging);
        }
        self.state = State::Merging;

        self.sort_buffer();

        let mut sources = Vec::with_capacity(self.runs.len() + 1);
        for run in self.runs.drain(..) {
            sources.push(Source::Run(RunReader::open(run)?));
        }
        sources.push(Source::Memory(MemorySource::new(std::mem::take(&mut self.buffer))));
        self.buffered_bytes = 0;

        tracing::debug!(bag = self.name, records = self.total, sources = sources.len(), "merging sort runs");

        let value_cmp = self.value_cmp;
        let cmp: MergeCmp = Box::new(move |a: &SortRecord, b: &SortRecord| compare(value_cmp, a, b));
        let merge = KWayMerge::new(sources, cmp);

        Ok(SortedIter { merge, distinct: self.distinct, last: None })
    }

    /// Discard buffered records and delete all spilled runs.
    pub fn close(self) {}
}

fn compare(value_cmp: Option<ValueComparator>, a: &SortRecord, b: &SortRecord) -> Ordering {
    a.0.cmp(&b.0).then_with(|| match value_cmp {
        Some(cmp) => cmp(&a.1, &b.1),
        None => Ordering::Equal,
    })
}

type MergeCmp = Box<dyn Fn(&SortRecord, &SortRecord) -> Ordering + Send>;

/// Sorted output of a [`SortedBag`]. Dropping it deletes the remaining runs.
pub struct SortedIter {
    merge: KWayMerge<Source, MergeCmp>,
    distinct: bool,
    last: Option<SortRecord>,
}

impl Iterator for SortedIter {
    type Item = Result<SortRecord, SortEngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let record = match self.merge.next_record() {
                Ok(Some(record)) => record,
                Ok(None) => return None,
                Err(e) => return Some(Err(e.into())),
            };

            if !self.distinct {
                return Some(Ok(record));
            }

            if self.last.as_ref() == Some(&record) {
                continue;
            }

            self.last = Some(record.clone());
            return Some(Ok(record));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn config(dir: &std::path::Path, threshold: SpillThreshold, parallel: bool) -> SortConfig {
        SortConfig { threshold, spill_dir: dir.to_owned(), parallel }
    }

    fn collect(bag: &mut SortedBag) -> Vec<SortRecord> {
        bag.iter().unwrap().map(Result::unwrap).collect()
    }

    fn random_records(rng: &mut SmallRng, n: usize) -> Vec<SortRecord> {
        (0..n)
            .map(|i| {
                let key_len = rng.gen_range(0..6);
                let key = (0..key_len).map(|_| rng.gen_range(b'a'..=b'f')).collect();
                (key, (i as u64).to_be_bytes().to_vec())
            })
            .collect()
    }

    fn check_sorted_permutation(input: &[SortRecord], output: &[SortRecord]) {
        assert_eq!(input.len(), output.len());
        assert!(output.windows(2).all(|w| w[0].0 <= w[1].0), "output is not sorted by key");

        let mut expected = input.to_vec();
        let mut actual = output.to_vec();
        expected.sort();
        actual.sort();
        assert_eq!(expected, actual, "output is not a permutation of the input");
    }

    #[test]
    fn spills_preserve_every_record() {
        let threshold = 100;

        for factor in [1, 5, 50] {
            for parallel in [false, true] {
                let dir = tempfile::tempdir().unwrap();
                let mut rng = SmallRng::seed_from_u64(factor as u64);
                let input = random_records(&mut rng, threshold * factor);

                let mut bag = SortedBag::new("test", config(dir.path(), SpillThreshold::Records(threshold), parallel));
                for (k, v) in &input {
                    bag.add(k.clone(), v.clone()).unwrap();
                }

                assert_eq!(bag.spilled_runs(), factor);
                let output = collect(&mut bag);
                check_sorted_permutation(&input, &output);
            }
        }
    }

    #[test]
    fn equal_keys_keep_insertion_order_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut bag = SortedBag::new("test", config(dir.path(), SpillThreshold::Records(3), true));

        for i in 0u32..20 {
            let key = if i % 2 == 0 { b"even".to_vec() } else { b"odd".to_vec() };
            bag.add(key, i.to_be_bytes().to_vec()).unwrap();
        }

        let output = collect(&mut bag);
        let evens: Vec<_> = output.iter().filter(|(k, _)| k == b"even").map(|(_, v)| v.clone()).collect();
        let expected: Vec<_> = (0u32..20).step_by(2).map(|i| i.to_be_bytes().to_vec()).collect();
        assert_eq!(evens, expected);
    }

    #[test]
    fn value_comparator_breaks_ties() {
        let dir = tempfile::tempdir().unwrap();
        let mut bag = SortedBag::new("test", config(dir.path(), SpillThreshold::Records(2), false))
            .with_value_order(|a, b| b.cmp(a));

        for v in [b"1", b"3", b"2"] {
            bag.add(b"k".to_vec(), v.to_vec()).unwrap();
        }

        let values: Vec<_> = collect(&mut bag).into_iter().map(|(_, v)| v).collect();
        assert_eq!(values, vec![b"3".to_vec(), b"2".to_vec(), b"1".to_vec()]);
    }

    #[test]
    fn byte_threshold_spills() {
        let dir = tempfile::tempdir().unwrap();
        let mut bag = SortedBag::new("test", config(dir.path(), SpillThreshold::Bytes(1024), true));

        for i in 0u64..200 {
            bag.add(i.to_be_bytes().to_vec(), vec![0; 32]).unwrap();
        }

        assert!(bag.spilled_runs() > 0);
        assert_eq!(collect(&mut bag).len(), 200);
    }

    #[test]
    fn distinct_drops_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let mut bag = SortedBag::new("test", config(dir.path(), SpillThreshold::Records(2), false)).distinct();

        for k in [b"b", b"a", b"b", b"a", b"c", b"b"] {
            bag.add(k.to_vec(), Vec::new()).unwrap();
        }

        let keys: Vec<_> = collect(&mut bag).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn add_after_iter_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let mut bag = SortedBag::new("test", config(dir.path(), SpillThreshold::Records(10), false));
        bag.add(b"a".to_vec(), Vec::new()).unwrap();

        let _iter = bag.iter().unwrap();
        assert!(matches!(bag.add(b"b".to_vec(), Vec::new()), Err(SortEngineError::AlreadyMerging)));
        assert!(matches!(bag.iter(), Err(SortEngineError::AlreadyMerging)));
    }

    #[test]
    fn runs_are_deleted_after_use() {
        let dir = tempfile::tempdir().unwrap();
        let mut bag = SortedBag::new("test", config(dir.path(), SpillThreshold::Records(4), false));
        for i in 0u8..20 {
            bag.add(vec![i], Vec::new()).unwrap();
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 5);

        let iter = bag.iter().unwrap();
        assert_eq!(iter.count(), 20);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let mut unread = SortedBag::new("test", config(dir.path(), SpillThreshold::Records(4), false));
        for i in 0u8..20 {
            unread.add(vec![i], Vec::new()).unwrap();
        }
        unread.close();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn spill_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        let mut bag = SortedBag::new("test", config(&missing, SpillThreshold::Records(1), false));

        assert!(matches!(bag.add(b"a".to_vec(), Vec::new()), Err(SortEngineError::SpillFailed(_))));
    }
}
