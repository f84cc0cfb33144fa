//! K-way merge of sorted sources.
//!
//! A manual min-heap over source indices. Records are compared through the
//! sources' current heads so nothing is cloned into the heap. Ties between
//! sources go to the lower source index, which keeps the merge stable when
//! sources are ordered oldest first.

use super::{run_file::RunReader, SortRecord};
use std::{cmp::Ordering, io};

pub trait MergeSource {
    fn peek(&self) -> Option<&SortRecord>;

    /// Take the current record and move to the next one.
    fn pop(&mut self) -> io::Result<Option<SortRecord>>;
}

impl MergeSource for RunReader {
    fn peek(&self) -> Option<&SortRecord> {
        RunReader::peek(self)
    }

    fn pop(&mut self) -> io::Result<Option<SortRecord>> {
        RunReader::pop(self)
    }
}

/// The unspilled tail of a sort, already sorted.
pub struct MemorySource {
    records: std::vec::IntoIter<SortRecord>,
    current: Option<SortRecord>,
}

impl MemorySource {
    pub fn new(records: Vec<SortRecord>) -> Self {
        let mut records = records.into_iter();
        let current = records.next();
        Self { records, current }
    }
}

impl MergeSource for MemorySource {
    fn peek(&self) -> Option<&SortRecord> {
        self.current.as_ref()
    }

    fn pop(&mut self) -> io::Result<Option<SortRecord>> {
        let next = self.records.next();
        Ok(std::mem::replace(&mut self.current, next))
    }
}

pub enum Source {
    Run(RunReader),
    Memory(MemorySource),
}

impl MergeSource for Source {
    fn peek(&self) -> Option<&SortRecord> {
        match self {
            Source::Run(run) => run.peek(),
            Source::Memory(mem) => mem.peek(),
        }
    }

    fn pop(&mut self) -> io::Result<Option<SortRecord>> {
        match self {
            Source::Run(run) => run.pop(),
            Source::Memory(mem) => mem.pop(),
        }
    }
}

pub struct KWayMerge<T: MergeSource, F: Fn(&SortRecord, &SortRecord) -> Ordering> {
    heap: Vec<usize>,
    sources: Vec<T>,
    cmp: F,
}

impl<T: MergeSource, F: Fn(&SortRecord, &SortRecord) -> Ordering> KWayMerge<T, F> {
    pub fn new(sources: Vec<T>, cmp: F) -> Self {
        let heap = (0..sources.len()).filter(|&ix| sources[ix].peek().is_some()).collect();
        let mut me = Self { heap, sources, cmp };

        if me.heap.len() > 1 {
            for pos in (0..me.heap.len() / 2).rev() {
                me.sift_down(pos);
            }
        }

        me
    }

    fn less(&self, i: usize, j: usize) -> bool {
        let (a, b) = (self.heap[i], self.heap[j]);

        match (self.sources[a].peek(), self.sources[b].peek()) {
            (Some(ra), Some(rb)) => match (self.cmp)(ra, rb) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => a < b,
            },
            // exhausted sources never stay in the heap
            _ => a < b,
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }

            let right = left + 1;
            let smallest = if right < len && self.less(right, left) { right } else { left };

            if !self.less(smallest, pos) {
                break;
            }

            self.heap.swap(pos, smallest);
            pos = smallest;
        }
    }

    pub fn next_record(&mut self) -> io::Result<Option<SortRecord>> {
        let Some(&top) = self.heap.first() else {
            return Ok(None);
        };

        let record = self.sources[top].pop()?;

        if self.sources[top].peek().is_none() {
            let last = self.heap.len() - 1;
            self.heap.swap(0, last);
            self.heap.pop();
        }

        if !self.heap.is_empty() {
            self.sift_down(0);
        }

        Ok(record)
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(k: &str, v: &str) -> SortRecord {
        (k.as_bytes().to_vec(), v.as_bytes().to_vec())
    }

    fn drain<F: Fn(&SortRecord, &SortRecord) -> Ordering>(mut merge: KWayMerge<MemorySource, F>) -> Vec<SortRecord> {
        let mut out = Vec::new();
        while let Some(r) = merge.next_record().unwrap() {
            out.push(r);
        }
        out
    }

    #[test]
    fn merges_in_key_order() {
        let sources = vec![
            MemorySource::new(vec![rec("a", "0"), rec("d", "0"), rec("g", "0")]),
            MemorySource::new(vec![]),
            MemorySource::new(vec![rec("b", "1"), rec("e", "1")]),
            MemorySource::new(vec![rec("c", "2"), rec("f", "2"), rec("h", "2"), rec("i", "2")]),
        ];

        let keys: Vec<_> = drain(KWayMerge::new(sources, |a, b| a.0.cmp(&b.0))).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, b"abcdefghi".iter().map(|b| vec![*b]).collect::<Vec<_>>());
    }

    #[test]
    fn ties_prefer_earlier_sources() {
        let sources = vec![
            MemorySource::new(vec![rec("k", "first"), rec("k", "second")]),
            MemorySource::new(vec![rec("k", "third")]),
            MemorySource::new(vec![rec("a", "zero"), rec("k", "fourth")]),
        ];

        let values: Vec<_> = drain(KWayMerge::new(sources, |a, b| a.0.cmp(&b.0)))
            .into_iter()
            .map(|(_, v)| String::from_utf8(v).unwrap())
            .collect();

        assert_eq!(values, ["zero", "first", "second", "third", "fourth"]);
    }
}
