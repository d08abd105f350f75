#![forbid(unsafe_code)]
//! The mounted filesystem engine.
//!
//! `FileSystem` owns the block device and the cached superblock and group
//! descriptors for its lifetime. Inodes are read and written on demand.
//! Every mutating host-API call persists dirty allocator state in the order
//! bitmap → group descriptor → superblock and flushes the device before
//! returning.

mod fd;
mod file;
mod ops;
mod path;

pub use efs_block::{BlockDevice, FileBlockDevice, MemBlockDevice};
pub use efs_dir::DirEntryInfo;
pub use efs_error::{EfsError, Result};
pub use efs_ondisk::{Inode, Superblock};
pub use efs_types::{
    FIRST_FD, InodeNumber, O_APPEND, O_CREAT, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY, ROOT_INO,
};
pub use fd::{FdTable, OpenFile};
pub use ops::{FileKind, FileStat};

use efs_alloc::{FsGeometry, GroupStats, bitmap_count_free, bitmap_set};
use efs_ondisk::GroupDesc;
use efs_types::{
    BlockNumber, GROUP_DESC_SIZE, GROUP_DESC_TABLE_OFFSET, GroupNumber, INODE_SIZE, S_IFDIR,
    SUPERBLOCK_SIZE, inode_to_group,
};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

// ── Format options ──────────────────────────────────────────────────────────

/// Geometry knobs for `format` / `init_filesystem`.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            blocks_per_group: 8192,
            inodes_per_group: 2048,
        }
    }
}

/// Free-space report for `df`.
#[derive(Debug, Clone, Serialize)]
pub struct DfReport {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
}

// ── FileSystem ──────────────────────────────────────────────────────────────

/// A mounted ExtentFS image.
pub struct FileSystem {
    dev: Box<dyn BlockDevice>,
    sb: Superblock,
    geo: FsGeometry,
    groups: Vec<GroupStats>,
    fds: FdTable,
    cwd: InodeNumber,
    cwd_path: String,
}

impl FileSystem {
    // ── Mount ───────────────────────────────────────────────────────────

    /// Mount an image from an already-open block device.
    pub fn mount(dev: Box<dyn BlockDevice>) -> Result<Self> {
        let block0 = dev.read_block(BlockNumber(0))?;
        let sb = Superblock::unpack(&block0[..SUPERBLOCK_SIZE])
            .map_err(|e| EfsError::corrupt_at(0, &e))?;
        if sb.block_size != dev.block_size() {
            return Err(EfsError::InvalidArgument(
                "device block size does not match the superblock",
            ));
        }
        if sb.fs_size_blocks > dev.block_count() {
            return Err(EfsError::Corrupt {
                block: 0,
                detail: "superblock claims more blocks than the device holds".into(),
            });
        }

        let geo = FsGeometry::from_superblock(&sb)?;
        let groups = load_group_descs(dev.as_ref(), &sb)?;
        info!(
            target: "efs::core",
            blocks = sb.fs_size_blocks,
            groups = groups.len(),
            "mounted"
        );
        Ok(Self {
            dev,
            sb,
            geo,
            groups,
            fds: FdTable::new(),
            cwd: ROOT_INO,
            cwd_path: "/".to_owned(),
        })
    }

    /// Open and mount an image file. The block size is probed from the
    /// superblock before the block device is constructed.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        use std::io::Read;
        let mut probe = [0_u8; SUPERBLOCK_SIZE];
        fs::File::open(path.as_ref())?.read_exact(&mut probe)?;
        let sb = Superblock::unpack(&probe).map_err(|e| EfsError::corrupt_at(0, &e))?;
        let dev = FileBlockDevice::open(path, sb.block_size)?;
        Self::mount(Box::new(dev))
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    #[must_use]
    pub fn df(&self) -> DfReport {
        DfReport {
            block_size: self.sb.block_size,
            total_blocks: self.sb.fs_size_blocks,
            free_blocks: self.sb.free_blocks_count,
            total_inodes: self.sb.total_inodes,
            free_inodes: self.sb.free_inodes_count,
        }
    }

    pub(crate) fn now(&self) -> u32 {
        efs_inode::unix_now()
    }

    pub(crate) fn hint_for(&self, ino: InodeNumber) -> GroupNumber {
        inode_to_group(ino, self.geo.inodes_per_group)
    }

    // ── Inode access ────────────────────────────────────────────────────

    pub(crate) fn read_inode(&self, ino: InodeNumber) -> Result<Inode> {
        efs_inode::read_inode(self.dev.as_ref(), &self.geo, &self.groups, ino)
    }

    pub(crate) fn write_inode(&mut self, ino: InodeNumber, inode: &Inode) -> Result<()> {
        efs_inode::write_inode(self.dev.as_mut(), &self.geo, &self.groups, ino, inode)
    }

    // ── Allocator state persistence ─────────────────────────────────────

    /// Write the group descriptor table and superblock back, deriving the
    /// superblock free counts from the per-group counts, then flush.
    pub(crate) fn commit(&mut self) -> Result<()> {
        self.sb.free_blocks_count = self
            .groups
            .iter()
            .map(|g| u64::from(g.free_blocks))
            .sum();
        self.sb.free_inodes_count = self
            .groups
            .iter()
            .map(|g| u64::from(g.free_inodes))
            .sum();

        let mut meta =
            Vec::with_capacity(SUPERBLOCK_SIZE + self.groups.len() * GROUP_DESC_SIZE);
        meta.extend_from_slice(&self.sb.pack());
        for gs in &self.groups {
            meta.extend_from_slice(&gs.to_desc().pack());
        }
        patch_bytes(self.dev.as_mut(), 0, &meta)?;
        self.dev.flush()?;
        debug!(
            target: "efs::core",
            free_blocks = self.sb.free_blocks_count,
            free_inodes = self.sb.free_inodes_count,
            "commit"
        );
        Ok(())
    }

    /// Flush without metadata changes (host API `flush`).
    pub fn sync(&mut self) -> Result<()> {
        self.commit()
    }

    // ── Invariant verification (used by tests and `info`) ───────────────

    /// Re-derive free counts from the bitmaps and confirm they match the
    /// group descriptors and superblock.
    pub fn verify_allocator_invariants(&self) -> Result<()> {
        let mut block_sum = 0_u64;
        let mut inode_sum = 0_u64;
        for gs in &self.groups {
            // Unusable trailing slivers carry zeroed descriptors.
            if gs.block_bitmap_block.0 == 0 {
                continue;
            }
            let blocks_in_group = self.geo.blocks_in_group(gs.group);
            let block_bitmap = self.dev.read_block(gs.block_bitmap_block)?;
            let free_blocks = bitmap_count_free(&block_bitmap, blocks_in_group);
            if free_blocks != gs.free_blocks {
                return Err(EfsError::Corrupt {
                    block: gs.block_bitmap_block.0,
                    detail: format!(
                        "group {}: bitmap has {free_blocks} free blocks, descriptor says {}",
                        gs.group, gs.free_blocks
                    ),
                });
            }
            let inode_bitmap = self.dev.read_block(gs.inode_bitmap_block)?;
            let free_inodes = bitmap_count_free(&inode_bitmap, self.geo.inodes_per_group);
            if free_inodes != gs.free_inodes {
                return Err(EfsError::Corrupt {
                    block: gs.inode_bitmap_block.0,
                    detail: format!(
                        "group {}: bitmap has {free_inodes} free inodes, descriptor says {}",
                        gs.group, gs.free_inodes
                    ),
                });
            }
            block_sum += u64::from(free_blocks);
            inode_sum += u64::from(free_inodes);
        }
        if block_sum != self.sb.free_blocks_count || inode_sum != self.sb.free_inodes_count {
            return Err(EfsError::Corrupt {
                block: 0,
                detail: format!(
                    "superblock counts ({}, {}) disagree with group sums ({block_sum}, {inode_sum})",
                    self.sb.free_blocks_count, self.sb.free_inodes_count
                ),
            });
        }
        Ok(())
    }
}

// ── Metadata layout helpers ─────────────────────────────────────────────────

/// Read the descriptor table (which may spill past block 0) into stats.
fn load_group_descs(dev: &dyn BlockDevice, sb: &Superblock) -> Result<Vec<GroupStats>> {
    let group_count = sb.group_count() as usize;
    let bytes_needed = GROUP_DESC_TABLE_OFFSET + group_count * GROUP_DESC_SIZE;
    let block_size = sb.block_size as usize;
    let blocks_needed = bytes_needed.div_ceil(block_size);

    let mut table = Vec::with_capacity(blocks_needed * block_size);
    for b in 0..blocks_needed {
        table.extend_from_slice(&dev.read_block(BlockNumber(b as u64))?);
    }

    let mut groups = Vec::with_capacity(group_count);
    for g in 0..group_count {
        let offset = GROUP_DESC_TABLE_OFFSET + g * GROUP_DESC_SIZE;
        let desc = GroupDesc::unpack(&table[offset..offset + GROUP_DESC_SIZE])
            .map_err(|e| EfsError::corrupt_at((offset / block_size) as u64, &e))?;
        groups.push(GroupStats::from_desc(
            GroupNumber(u32::try_from(g).unwrap_or(u32::MAX)),
            &desc,
        ));
    }
    Ok(groups)
}

/// Read-modify-write an arbitrary byte range onto the device.
fn patch_bytes(dev: &mut dyn BlockDevice, offset: u64, bytes: &[u8]) -> Result<()> {
    let block_size = u64::from(dev.block_size());
    let mut written = 0_usize;
    while written < bytes.len() {
        let pos = offset + written as u64;
        let block = BlockNumber(pos / block_size);
        #[allow(clippy::cast_possible_truncation)]
        let within = (pos % block_size) as usize;
        let chunk = (block_size as usize - within).min(bytes.len() - written);

        let mut data = dev.read_block(block)?;
        data[within..within + chunk].copy_from_slice(&bytes[written..written + chunk]);
        dev.write_block(block, &data)?;
        written += chunk;
    }
    Ok(())
}

// ── Format ──────────────────────────────────────────────────────────────────

/// Write a fresh filesystem onto `dev` and mount it. Lays out the
/// superblock and descriptor table, per-group bitmaps and inode tables,
/// and the root directory (inode 2).
pub fn format(dev: Box<dyn BlockDevice>, opts: &FormatOptions) -> Result<FileSystem> {
    let mut dev = dev;
    let block_size = opts.block_size;
    if dev.block_size() != block_size {
        return Err(EfsError::InvalidArgument(
            "device block size does not match format options",
        ));
    }
    if opts.blocks_per_group > block_size * 8 || opts.inodes_per_group > block_size * 8 {
        return Err(EfsError::InvalidArgument(
            "group bitmap must fit a single block",
        ));
    }

    let fs_size_blocks = dev.block_count();
    let group_count = fs_size_blocks.div_ceil(u64::from(opts.blocks_per_group));
    let gdt_bytes = GROUP_DESC_TABLE_OFFSET + usize::try_from(group_count).unwrap_or(0) * GROUP_DESC_SIZE;
    let first_data_block =
        u32::try_from(gdt_bytes.div_ceil(block_size as usize)).unwrap_or(u32::MAX);

    let inode_table_blocks =
        (u64::from(opts.inodes_per_group) * INODE_SIZE as u64).div_ceil(u64::from(block_size));
    let meta_blocks = 2 + inode_table_blocks;

    // Smallest viable image: metadata plus at least one data block in group 0.
    let min_blocks = u64::from(first_data_block) + meta_blocks + 1;
    if fs_size_blocks <= min_blocks {
        return Err(EfsError::InvalidArgument("image too small to format"));
    }

    let zero_block = vec![0_u8; block_size as usize];
    let mut groups: Vec<GroupStats> = Vec::new();
    let mut total_inodes = 0_u64;

    for g in 0..group_count {
        let group = GroupNumber(u32::try_from(g).unwrap_or(u32::MAX));
        let start = u64::from(first_data_block) + g * u64::from(opts.blocks_per_group);
        let blocks_in_group = fs_size_blocks
            .saturating_sub(start)
            .min(u64::from(opts.blocks_per_group));

        // A trailing sliver too small for its own metadata stays unusable:
        // zeroed descriptor, zero free counts.
        if blocks_in_group <= meta_blocks {
            groups.push(GroupStats {
                group,
                free_blocks: 0,
                free_inodes: 0,
                block_bitmap_block: BlockNumber(0),
                inode_bitmap_block: BlockNumber(0),
                inode_table_block: BlockNumber(0),
            });
            continue;
        }

        let block_bitmap_block = BlockNumber(start);
        let inode_bitmap_block = BlockNumber(start + 1);
        let inode_table_block = BlockNumber(start + 2);

        // Block bitmap: metadata blocks used, everything past the group's
        // real extent unallocatable.
        let mut block_bitmap = zero_block.clone();
        for bit in 0..meta_blocks {
            bitmap_set(&mut block_bitmap, u32::try_from(bit).unwrap_or(u32::MAX));
        }
        for bit in blocks_in_group..u64::from(block_size) * 8 {
            bitmap_set(&mut block_bitmap, u32::try_from(bit).unwrap_or(u32::MAX));
        }
        dev.write_block(block_bitmap_block, &block_bitmap)?;

        // Inode bitmap: group 0 reserves inode 1 (convention) and inode 2
        // (root); everything past inodes_per_group is unallocatable.
        let mut inode_bitmap = zero_block.clone();
        let mut reserved_inodes = 0_u32;
        if g == 0 {
            bitmap_set(&mut inode_bitmap, 0);
            bitmap_set(&mut inode_bitmap, 1);
            reserved_inodes = 2;
        }
        for bit in opts.inodes_per_group..block_size * 8 {
            bitmap_set(&mut inode_bitmap, bit);
        }
        dev.write_block(inode_bitmap_block, &inode_bitmap)?;

        // Inode table starts zeroed.
        for b in 0..inode_table_blocks {
            dev.write_block(BlockNumber(inode_table_block.0 + b), &zero_block)?;
        }

        total_inodes += u64::from(opts.inodes_per_group);
        groups.push(GroupStats {
            group,
            free_blocks: u32::try_from(blocks_in_group - meta_blocks).unwrap_or(0),
            free_inodes: opts.inodes_per_group - reserved_inodes,
            block_bitmap_block,
            inode_bitmap_block,
            inode_table_block,
        });
    }

    let sb = Superblock {
        fs_size_blocks,
        block_size,
        blocks_per_group: opts.blocks_per_group,
        inodes_per_group: opts.inodes_per_group,
        total_inodes,
        free_blocks_count: groups.iter().map(|g| u64::from(g.free_blocks)).sum(),
        free_inodes_count: groups.iter().map(|g| u64::from(g.free_inodes)).sum(),
        first_data_block,
    };
    let geo = FsGeometry::from_superblock(&sb)?;

    let mut fs = FileSystem {
        dev,
        sb,
        geo,
        groups,
        fds: FdTable::new(),
        cwd: ROOT_INO,
        cwd_path: "/".to_owned(),
    };

    // Root directory: inode 2, links 2 (`.` and its own `..`).
    let now = fs.now();
    let mut root = efs_inode::init_inode(S_IFDIR | 0o755, 0, 0, 2, now);
    let hint = fs.hint_for(ROOT_INO);
    efs_dir::init_directory(
        fs.dev.as_mut(),
        &fs.geo,
        &mut fs.groups,
        hint,
        &mut root,
        ROOT_INO,
        ROOT_INO,
    )?;
    fs.write_inode(ROOT_INO, &root)?;
    fs.commit()?;
    info!(
        target: "efs::core",
        blocks = fs.sb.fs_size_blocks,
        groups = fs.groups.len(),
        "formatted"
    );
    Ok(fs)
}

/// Format the image file at `path` in place (its current length fixes the
/// filesystem size) and return the mounted filesystem.
pub fn init_filesystem(path: impl AsRef<Path>, opts: &FormatOptions) -> Result<FileSystem> {
    let len = fs::metadata(path.as_ref())?.len();
    if len % u64::from(opts.block_size) != 0 {
        return Err(EfsError::InvalidArgument(
            "image length is not a multiple of the block size",
        ));
    }
    let dev = FileBlockDevice::open(path, opts.block_size)?;
    format(Box::new(dev), opts)
}
