#![forbid(unsafe_code)]
//! Block device abstraction.
//!
//! A device is a fixed-size array of equal-sized blocks. The filesystem
//! opens one device at mount and owns it for its lifetime; all metadata and
//! data I/O below the host API goes through `read_block`/`write_block`.

use efs_error::{EfsError, Result};
use efs_types::BlockNumber;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::trace;

/// Fixed-size block I/O.
pub trait BlockDevice {
    /// Read block `block` in full. The returned buffer is exactly
    /// `block_size()` bytes.
    fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>>;

    /// Write block `block` in full. `data` must be exactly `block_size()`
    /// bytes.
    fn write_block(&mut self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn flush(&mut self) -> Result<()>;

    /// Block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;
}

fn out_of_range(block: BlockNumber, count: u64) -> EfsError {
    EfsError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("block {block} out of range (device has {count} blocks)"),
    ))
}

fn check_len(data: &[u8], block_size: u32) -> Result<()> {
    if data.len() != block_size as usize {
        return Err(EfsError::InvalidArgument(
            "write_block buffer length must equal the block size",
        ));
    }
    Ok(())
}

// ── File-backed device ──────────────────────────────────────────────────────

/// Block device backed by a host file, using positioned reads and writes.
#[derive(Debug)]
pub struct FileBlockDevice {
    file: File,
    block_size: u32,
    block_count: u64,
}

impl FileBlockDevice {
    /// Open an existing image read-write. The file length must be a multiple
    /// of `block_size`.
    pub fn open(path: impl AsRef<Path>, block_size: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if block_size == 0 || len % u64::from(block_size) != 0 {
            return Err(EfsError::InvalidArgument(
                "image length is not a multiple of the block size",
            ));
        }
        Ok(Self {
            file,
            block_size,
            block_count: len / u64::from(block_size),
        })
    }

    /// Create (or truncate) an image of `block_count` blocks, zero-filled.
    pub fn create(path: impl AsRef<Path>, block_size: u32, block_count: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let len = block_count
            .checked_mul(u64::from(block_size))
            .ok_or(EfsError::InvalidArgument("image size overflows u64"))?;
        file.set_len(len)?;
        Ok(Self {
            file,
            block_size,
            block_count,
        })
    }

    fn byte_offset(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(out_of_range(block, self.block_count));
        }
        block
            .to_byte_offset(self.block_size)
            .ok_or_else(|| out_of_range(block, self.block_count))
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
        let offset = self.byte_offset(block)?;
        let mut buf = vec![0_u8; self.block_size as usize];
        self.file.read_exact_at(&mut buf, offset)?;
        trace!(target: "efs::block", block = block.0, "read");
        Ok(buf)
    }

    fn write_block(&mut self, block: BlockNumber, data: &[u8]) -> Result<()> {
        check_len(data, self.block_size)?;
        let offset = self.byte_offset(block)?;
        self.file.write_all_at(data, offset)?;
        trace!(target: "efs::block", block = block.0, "write");
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

// ── In-memory device ────────────────────────────────────────────────────────

/// Block device held entirely in memory. Used by unit tests and by the
/// formatter's dry-run mode.
#[derive(Debug, Clone)]
pub struct MemBlockDevice {
    block_size: u32,
    blocks: Vec<Vec<u8>>,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_size: u32, block_count: u64) -> Self {
        let blocks = (0..block_count)
            .map(|_| vec![0_u8; block_size as usize])
            .collect();
        Self { block_size, blocks }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
        let count = self.blocks.len() as u64;
        usize::try_from(block.0)
            .ok()
            .and_then(|idx| self.blocks.get(idx))
            .cloned()
            .ok_or_else(|| out_of_range(block, count))
    }

    fn write_block(&mut self, block: BlockNumber, data: &[u8]) -> Result<()> {
        check_len(data, self.block_size)?;
        let count = self.blocks.len() as u64;
        let slot = usize::try_from(block.0)
            .ok()
            .and_then(|idx| self.blocks.get_mut(idx))
            .ok_or_else(|| out_of_range(block, count))?;
        slot.copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.blocks.len() as u64
    }
}
