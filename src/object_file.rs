//! Append-only object file holding the encoded terms of a node table.
//!
//! Layout: a sequence of `[len: u32 LE][bytes]` records. The offset of a record's
//! length prefix is its identity. An aborted reservation still consumes an
//! offset: it is written as a bare `u32::MAX` marker so offsets are never reused.

use crate::error::StoreError;
use memmap2::Mmap;
use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

const LEN_PREFIX: usize = std::mem::size_of::<u32>();
const ABORTED_MARKER: u32 = u32::MAX;

/// A reserved write of up to `capacity` bytes. Fill `buffer_mut()`, then `set_len`.
#[derive(Debug)]
pub struct WriteHandle {
    offset: u64,
    buf: Vec<u8>,
    len: usize,
}

impl WriteHandle {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn set_len(&mut self, len: usize) {
        self.len = len;
    }
}

pub struct ObjectFile {
    path: PathBuf,
    writer: BufWriter<File>,
    reader: File,
    len: u64,
    pending: Option<u64>,
    unflushed: bool,
}

impl ObjectFile {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_owned();
        let writer = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let reader = File::open(&path)?;

        Ok(Self { path, writer: BufWriter::new(writer), reader, len: 0, pending: None, unflushed: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes committed so far, including aborted markers.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn allocate_write(&mut self, max_size: usize) -> Result<WriteHandle, StoreError> {
        if let Some(offset) = self.pending {
            return Err(StoreError::WriteInProgress { offset });
        }

        self.pending = Some(self.len);
        Ok(WriteHandle { offset: self.len, buf: vec![0; max_size], len: 0 })
    }

    /// Persist the handle's first `len` bytes and return their offset.
    pub fn complete_write(&mut self, handle: WriteHandle) -> Result<u64, StoreError> {
        self.release(&handle)?;

        let capacity = handle.buf.len().min(ABORTED_MARKER as usize - 1);
        if handle.len > capacity {
            self.write_abort_marker()?;
            return Err(StoreError::Overflow { len: handle.len, capacity });
        }

        let len = handle.len as u32;

        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(&handle.buf[..handle.len])?;
        self.len += (LEN_PREFIX + handle.len) as u64;
        self.unflushed = true;

        Ok(handle.offset)
    }

    pub fn abort_write(&mut self, handle: WriteHandle) -> Result<(), StoreError> {
        self.release(&handle)?;
        self.write_abort_marker()
    }

    /// Convenience: reserve, copy and complete in one call.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64, StoreError> {
        let mut handle = self.allocate_write(bytes.len())?;
        handle.buffer_mut().copy_from_slice(bytes);
        handle.set_len(bytes.len());
        self.complete_write(handle)
    }

    fn release(&mut self, handle: &WriteHandle) -> Result<(), StoreError> {
        match self.pending.take() {
            Some(offset) if offset == handle.offset => Ok(()),
            Some(offset) => {
                self.pending = Some(offset);
                Err(StoreError::WriteInProgress { offset })
            },
            None => Err(StoreError::OutOfRange { offset: handle.offset, len: self.len }),
        }
    }

    fn write_abort_marker(&mut self) -> Result<(), StoreError> {
        self.writer.write_all(&ABORTED_MARKER.to_le_bytes())?;
        self.len += LEN_PREFIX as u64;
        self.unflushed = true;
        Ok(())
    }

    pub fn read(&mut self, offset: u64) -> Result<Vec<u8>, StoreError> {
        if offset >= self.len {
            return Err(StoreError::OutOfRange { offset, len: self.len });
        }

        if self.unflushed {
            self.writer.flush()?;
            self.unflushed = false;
        }

        let mut prefix = [0; LEN_PREFIX];
        self.reader.seek(SeekFrom::Start(offset))?;
        self.reader.read_exact(&mut prefix)?;

        let len = u32::from_le_bytes(prefix);
        if len == ABORTED_MARKER {
            return Err(StoreError::Abandoned { offset });
        }

        if offset + (LEN_PREFIX as u64) + u64::from(len) > self.len {
            return Err(StoreError::OutOfRange { offset, len: self.len });
        }

        let mut bytes = vec![0; len as usize];
        self.reader.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    pub fn sync(&mut self) -> Result<(), StoreError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.unflushed = false;
        Ok(())
    }

    pub fn close(mut self) -> Result<(), StoreError> {
        self.sync()
    }
}

/// Read-only, memory mapped view of a finished object file.
pub struct ObjectFileReader {
    data: Option<Mmap>,
}

impl ObjectFileReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let file = File::open(path)?;

        // mapping a zero length file fails on some platforms
        let data = if file.metadata()?.len() == 0 { None } else { Some(unsafe { Mmap::map(&file)? }) };

        Ok(Self { data })
    }

    fn bytes(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }

    pub fn len(&self) -> u64 {
        self.bytes().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    pub fn read(&self, offset: u64) -> Result<&[u8], StoreError> {
        let data = self.bytes();
        let out_of_range = || StoreError::OutOfRange { offset, len: data.len() as u64 };

        let start = usize::try_from(offset).map_err(|_| out_of_range())?;
        let body = start.checked_add(LEN_PREFIX).ok_or_else(out_of_range)?;
        let prefix = data.get(start..body).ok_or_else(out_of_range)?;

        let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        if len == ABORTED_MARKER {
            return Err(StoreError::Abandoned { offset });
        }

        let end = body.checked_add(len as usize).ok_or_else(out_of_range)?;
        data.get(body..end).ok_or_else(out_of_range)
    }
}
