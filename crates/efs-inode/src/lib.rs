#![forbid(unsafe_code)]
//! Inode table I/O.
//!
//! Inode records are 88 bytes and the table is tightly packed, so a record
//! can straddle a block boundary; reads and writes stitch across the two
//! enclosing blocks when needed.

use efs_alloc::{FsGeometry, GroupStats};
use efs_block::BlockDevice;
use efs_error::{EfsError, Result};
use efs_ondisk::{ExtentNode, Inode};
use efs_types::{
    BlockNumber, EXTENT_ROOT_MAX_ENTRIES, EXTENT_ROOT_SIZE, INODE_SIZE, InodeNumber,
    inode_index_in_group, inode_to_group,
};
use std::time::{SystemTime, UNIX_EPOCH};

// ── Location ────────────────────────────────────────────────────────────────

/// On-disk position of an inode record within its group's table.
#[derive(Debug, Clone, Copy)]
pub struct InodeLocation {
    pub block: BlockNumber,
    pub byte_offset: usize,
}

/// Compute the disk location of an inode record.
pub fn locate_inode(
    ino: InodeNumber,
    geo: &FsGeometry,
    groups: &[GroupStats],
) -> Result<InodeLocation> {
    if !ino.is_valid() || u64::from(ino.0) > geo.total_inodes {
        return Err(EfsError::Corrupt {
            block: 0,
            detail: format!("inode {ino} out of range"),
        });
    }
    let group = inode_to_group(ino, geo.inodes_per_group);
    let gs = groups
        .get(group.0 as usize)
        .ok_or_else(|| EfsError::Corrupt {
            block: 0,
            detail: format!("inode {ino} belongs to a missing group"),
        })?;
    let index = inode_index_in_group(ino, geo.inodes_per_group);
    let byte_in_table = u64::from(index) * INODE_SIZE as u64;
    let block = BlockNumber(gs.inode_table_block.0 + byte_in_table / u64::from(geo.block_size));
    #[allow(clippy::cast_possible_truncation)]
    let byte_offset = (byte_in_table % u64::from(geo.block_size)) as usize;
    Ok(InodeLocation { block, byte_offset })
}

// ── Read / write ────────────────────────────────────────────────────────────

/// Read and parse an inode record.
pub fn read_inode(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    groups: &[GroupStats],
    ino: InodeNumber,
) -> Result<Inode> {
    let loc = locate_inode(ino, geo, groups)?;
    let block_size = geo.block_size as usize;

    let raw = if loc.byte_offset + INODE_SIZE <= block_size {
        let block = dev.read_block(loc.block)?;
        block[loc.byte_offset..loc.byte_offset + INODE_SIZE].to_vec()
    } else {
        let first = dev.read_block(loc.block)?;
        let second = dev.read_block(BlockNumber(loc.block.0 + 1))?;
        let head = block_size - loc.byte_offset;
        let mut raw = Vec::with_capacity(INODE_SIZE);
        raw.extend_from_slice(&first[loc.byte_offset..]);
        raw.extend_from_slice(&second[..INODE_SIZE - head]);
        raw
    };

    Inode::unpack(&raw).map_err(|e| EfsError::corrupt_at(loc.block.0, &e))
}

/// Serialize an inode and patch it into the table.
pub fn write_inode(
    dev: &mut dyn BlockDevice,
    geo: &FsGeometry,
    groups: &[GroupStats],
    ino: InodeNumber,
    inode: &Inode,
) -> Result<()> {
    let loc = locate_inode(ino, geo, groups)?;
    let block_size = geo.block_size as usize;
    let raw = inode.pack();

    if loc.byte_offset + INODE_SIZE <= block_size {
        let mut block = dev.read_block(loc.block)?;
        block[loc.byte_offset..loc.byte_offset + INODE_SIZE].copy_from_slice(&raw);
        dev.write_block(loc.block, &block)?;
    } else {
        let head = block_size - loc.byte_offset;
        let mut first = dev.read_block(loc.block)?;
        first[loc.byte_offset..].copy_from_slice(&raw[..head]);
        dev.write_block(loc.block, &first)?;

        let next = BlockNumber(loc.block.0 + 1);
        let mut second = dev.read_block(next)?;
        second[..INODE_SIZE - head].copy_from_slice(&raw[head..]);
        dev.write_block(next, &second)?;
    }
    Ok(())
}

// ── Construction ────────────────────────────────────────────────────────────

/// The 48-byte window of an empty inline extent root (depth 0, 0 entries).
#[must_use]
pub fn empty_extent_root() -> [u8; EXTENT_ROOT_SIZE] {
    let mut window = [0_u8; EXTENT_ROOT_SIZE];
    let node = ExtentNode::empty_leaf(EXTENT_ROOT_MAX_ENTRIES);
    // Packing an empty leaf into a 48-byte window cannot fail.
    node.pack_into(&mut window).ok();
    window
}

/// A freshly initialized inode: all timestamps set to `now`, an empty extent
/// root, and the link count the caller will adjust for directory entries.
#[must_use]
pub fn init_inode(mode: u32, uid: u32, gid: u32, links_count: u32, now: u32) -> Inode {
    Inode {
        mode,
        uid,
        gid,
        size: 0,
        links_count,
        atime: now,
        ctime: now,
        mtime: now,
        flags: 0,
        extent_root: empty_extent_root(),
    }
}

/// Current wall-clock time as seconds since the epoch, saturating at u32.
#[must_use]
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}
