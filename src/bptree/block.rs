use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

/// Fixed size block storage the packer writes a tree into.
pub trait BlockStorage {
    fn block_size(&self) -> usize;

    /// Number of blocks written so far; the next block id to append.
    fn block_count(&self) -> u64;

    /// Write a full block. `block` must be `block_size()` bytes and `id <= block_count()`.
    fn write_block(&mut self, id: u64, block: &[u8]) -> io::Result<()>;

    fn read_block(&mut self, id: u64, block: &mut [u8]) -> io::Result<()>;

    fn sync(&mut self) -> io::Result<()>;
}

fn check_write(id: u64, len: usize, block_size: usize, count: u64) -> io::Result<()> {
    if len != block_size {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("block of {len} bytes, expected {block_size}")));
    }
    if id > count {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("block {id} written past end ({count} blocks)")));
    }
    Ok(())
}

fn check_read(id: u64, count: u64) -> io::Result<()> {
    if id >= count {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, format!("block {id} not written ({count} blocks)")));
    }
    Ok(())
}

pub struct FileBlockStorage {
    path: PathBuf,
    block_size: usize,
    writer: BufWriter<File>,
    count: u64,
    /// Block id the file cursor sits at.
    cursor: u64,
}

impl FileBlockStorage {
    pub fn create<P: AsRef<Path>>(path: P, block_size: usize) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(&path)?;

        Ok(Self { path, block_size, writer: BufWriter::with_capacity(16 * block_size, file), count: 0, cursor: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn seek_to(&mut self, id: u64) -> io::Result<()> {
        if self.cursor != id {
            self.writer.seek(SeekFrom::Start(id * self.block_size as u64))?;
            self.cursor = id;
        }
        Ok(())
    }
}

impl BlockStorage for FileBlockStorage {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.count
    }

    fn write_block(&mut self, id: u64, block: &[u8]) -> io::Result<()> {
        check_write(id, block.len(), self.block_size, self.count)?;

        self.seek_to(id)?;
        self.writer.write_all(block)?;
        self.cursor += 1;
        self.count = self.count.max(id + 1);
        Ok(())
    }

    fn read_block(&mut self, id: u64, block: &mut [u8]) -> io::Result<()> {
        check_read(id, self.count)?;

        self.writer.flush()?;
        let file = self.writer.get_mut();
        file.seek(SeekFrom::Start(id * self.block_size as u64))?;
        file.read_exact(block)?;
        self.cursor = id + 1;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }
}

/// Block storage backed by a byte vector.
#[derive(Debug, Clone)]
pub struct MemBlockStorage {
    block_size: usize,
    data: Vec<u8>,
}

impl MemBlockStorage {
    pub fn new(block_size: usize) -> Self {
        Self { block_size, data: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl BlockStorage for MemBlockStorage {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        (self.data.len() / self.block_size) as u64
    }

    fn write_block(&mut self, id: u64, block: &[u8]) -> io::Result<()> {
        check_write(id, block.len(), self.block_size, self.block_count())?;

        let start = id as usize * self.block_size;
        if start == self.data.len() {
            self.data.extend_from_slice(block);
        } else {
            self.data[start..start + self.block_size].copy_from_slice(block);
        }
        Ok(())
    }

    fn read_block(&mut self, id: u64, block: &mut [u8]) -> io::Result<()> {
        check_read(id, self.block_count())?;

        let start = id as usize * self.block_size;
        block.copy_from_slice(&self.data[start..start + self.block_size]);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}
