//! Spilled sort runs.
//!
//! A run is a temporary file of `[key_len: u32 LE][key][value_len: u32 LE][value]`
//! records in sorted order. The file is deleted when the run (or the reader
//! consuming it) is dropped.

use super::SortRecord;
use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    path::Path,
};
use tempfile::NamedTempFile;

const READ_BUFFER_SIZE: usize = 64 * 1024;

pub struct SpilledRun {
    file: NamedTempFile,
    records: u64,
    bytes: u64,
}

impl SpilledRun {
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

fn write_len_prefixed<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "sort record part exceeds 4 GiB"))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(bytes)
}

/// Write already sorted `records` to a new temporary file in `dir`.
pub fn write_run(dir: &Path, records: &[SortRecord]) -> io::Result<SpilledRun> {
    let mut file = tempfile::Builder::new().prefix("sort-run-").suffix(".tmp").tempfile_in(dir)?;
    let mut bytes = 0;

    {
        let mut bw = BufWriter::new(file.as_file_mut());
        for (key, value) in records {
            write_len_prefixed(&mut bw, key)?;
            write_len_prefixed(&mut bw, value)?;
            bytes += (8 + key.len() + value.len()) as u64;
        }
        bw.flush()?;
    }

    Ok(SpilledRun { file, records: records.len() as u64, bytes })
}

/// Forward-only reader over one spilled run.
pub struct RunReader {
    _file: NamedTempFile,
    reader: BufReader<File>,
    remaining: u64,
    current: Option<SortRecord>,
}

impl RunReader {
    pub fn open(run: SpilledRun) -> io::Result<Self> {
        let reader = BufReader::with_capacity(READ_BUFFER_SIZE, run.file.reopen()?);
        let mut me = Self { _file: run.file, reader, remaining: run.records, current: None };
        me.load_next()?;
        Ok(me)
    }

    fn read_part(&mut self) -> io::Result<Vec<u8>> {
        let mut len = [0; 4];
        self.reader.read_exact(&mut len)?;
        let mut part = vec![0; u32::from_le_bytes(len) as usize];
        self.reader.read_exact(&mut part)?;
        Ok(part)
    }

    fn load_next(&mut self) -> io::Result<()> {
        self.current = if self.remaining == 0 {
            None
        } else {
            self.remaining -= 1;
            let key = self.read_part()?;
            let value = self.read_part()?;
            Some((key, value))
        };

        Ok(())
    }

    pub fn peek(&self) -> Option<&SortRecord> {
        self.current.as_ref()
    }

    pub fn pop(&mut self) -> io::Result<Option<SortRecord>> {
        let current = self.current.take();
        if current.is_some() {
            self.load_next()?;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_round_trip_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), Vec::new()),
            (Vec::new(), b"empty key".to_vec()),
        ];

        let run = write_run(dir.path(), &records).unwrap();
        assert_eq!(run.records(), 3);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        let mut reader = RunReader::open(run).unwrap();
        let mut out = Vec::new();
        while let Some(rec) = reader.pop().unwrap() {
            out.push(rec);
        }
        assert_eq!(out, records);

        drop(reader);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
