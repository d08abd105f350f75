#![forbid(unsafe_code)]
//! Block and inode allocation.
//!
//! First-fit bitmap allocation with group rotation: scanning starts at a
//! hint group and wraps through all groups. Within a group the lowest clear
//! bit wins. These functions mutate the on-disk bitmap and the in-memory
//! `GroupStats`; persisting the matching group descriptor and superblock
//! counts is the caller's job (bitmap first, then descriptor, then
//! superblock).

use efs_block::BlockDevice;
use efs_error::{EfsError, Result};
use efs_ondisk::{GroupDesc, Superblock};
use efs_types::{BlockNumber, GroupNumber, InodeNumber};
use tracing::debug;

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0_u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_zeros();
    }

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 0 {
                free += 1;
            }
        }
    }

    free
}

/// Find the lowest free (zero) bit among the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32) -> Option<u32> {
    (0..count).find(|&idx| !bitmap_get(bitmap, idx))
}

// ── Filesystem geometry ─────────────────────────────────────────────────────

/// Cached filesystem geometry needed by the allocator and everything above.
#[derive(Debug, Clone)]
pub struct FsGeometry {
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub fs_size_blocks: u64,
    pub total_inodes: u64,
    pub first_data_block: u32,
    pub group_count: u32,
}

impl FsGeometry {
    /// Derive geometry from a parsed superblock.
    pub fn from_superblock(sb: &Superblock) -> Result<Self> {
        let geo = Self {
            block_size: sb.block_size,
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: sb.inodes_per_group,
            fs_size_blocks: sb.fs_size_blocks,
            total_inodes: sb.total_inodes,
            first_data_block: sb.first_data_block,
            group_count: sb.group_count(),
        };
        if geo.blocks_per_group > geo.block_size * 8 || geo.inodes_per_group > geo.block_size * 8 {
            return Err(EfsError::Corrupt {
                block: 0,
                detail: "group bitmap does not fit a single block".into(),
            });
        }
        Ok(geo)
    }

    /// Blocks occupied by one group's inode table.
    #[must_use]
    pub fn inode_table_blocks(&self) -> u64 {
        (u64::from(self.inodes_per_group) * efs_types::INODE_SIZE as u64)
            .div_ceil(u64::from(self.block_size))
    }

    /// First block of a group.
    #[must_use]
    pub fn group_start_block(&self, group: GroupNumber) -> BlockNumber {
        BlockNumber(
            u64::from(self.first_data_block)
                + u64::from(group.0) * u64::from(self.blocks_per_group),
        )
    }

    /// Number of blocks actually present in a group (the last group of an
    /// image is usually shorter; a trailing descriptor past the image end
    /// covers zero blocks).
    #[must_use]
    pub fn blocks_in_group(&self, group: GroupNumber) -> u32 {
        let start = self.group_start_block(group).0;
        let remaining = self.fs_size_blocks.saturating_sub(start);
        u32::try_from(remaining.min(u64::from(self.blocks_per_group))).unwrap_or(0)
    }

    /// Absolute block number for a group-relative block index.
    #[must_use]
    pub fn group_block_to_absolute(&self, group: GroupNumber, rel: u32) -> BlockNumber {
        BlockNumber(self.group_start_block(group).0 + u64::from(rel))
    }

    /// Convert an absolute block number to (group, relative index).
    pub fn absolute_to_group_block(&self, block: BlockNumber) -> Result<(GroupNumber, u32)> {
        let rel = block
            .0
            .checked_sub(u64::from(self.first_data_block))
            .ok_or_else(|| EfsError::Corrupt {
                block: block.0,
                detail: "block below the first data block".into(),
            })?;
        #[allow(clippy::cast_possible_truncation)]
        let group = (rel / u64::from(self.blocks_per_group)) as u32;
        #[allow(clippy::cast_possible_truncation)]
        let offset = (rel % u64::from(self.blocks_per_group)) as u32;
        if group >= self.group_count {
            return Err(EfsError::Corrupt {
                block: block.0,
                detail: "block beyond the last group".into(),
            });
        }
        Ok((GroupNumber(group), offset))
    }
}

// ── Group stats ─────────────────────────────────────────────────────────────

/// In-memory mirror of one group descriptor.
#[derive(Debug, Clone)]
pub struct GroupStats {
    pub group: GroupNumber,
    pub free_blocks: u32,
    pub free_inodes: u32,
    pub block_bitmap_block: BlockNumber,
    pub inode_bitmap_block: BlockNumber,
    pub inode_table_block: BlockNumber,
}

impl GroupStats {
    #[must_use]
    pub fn from_desc(group: GroupNumber, desc: &GroupDesc) -> Self {
        Self {
            group,
            free_blocks: desc.free_blocks_count,
            free_inodes: desc.free_inodes_count,
            block_bitmap_block: BlockNumber(desc.block_bitmap_block),
            inode_bitmap_block: BlockNumber(desc.inode_bitmap_block),
            inode_table_block: BlockNumber(desc.inode_table_block),
        }
    }

    /// The on-disk descriptor reflecting current counts.
    #[must_use]
    pub fn to_desc(&self) -> GroupDesc {
        GroupDesc {
            block_bitmap_block: self.block_bitmap_block.0,
            inode_bitmap_block: self.inode_bitmap_block.0,
            inode_table_block: self.inode_table_block.0,
            free_blocks_count: self.free_blocks,
            free_inodes_count: self.free_inodes,
        }
    }
}

/// Rotation order: `hint`, `hint + 1`, …, wrapping over all groups.
fn rotation(hint: GroupNumber, group_count: u32) -> impl Iterator<Item = GroupNumber> {
    let start = if group_count == 0 { 0 } else { hint.0 % group_count };
    (0..group_count).map(move |step| GroupNumber((start + step) % group_count))
}

// ── Block allocation ────────────────────────────────────────────────────────

/// Allocate one block, first-fit, starting the group scan at `hint`.
pub fn alloc_block(
    dev: &mut dyn BlockDevice,
    geo: &FsGeometry,
    groups: &mut [GroupStats],
    hint: GroupNumber,
) -> Result<BlockNumber> {
    for group in rotation(hint, geo.group_count) {
        let gidx = group.0 as usize;
        let Some(gs) = groups.get(gidx) else {
            continue;
        };
        if gs.free_blocks == 0 {
            continue;
        }

        let bitmap_block = gs.block_bitmap_block;
        let mut bitmap = dev.read_block(bitmap_block)?;
        let Some(rel) = bitmap_find_free(&bitmap, geo.blocks_in_group(group)) else {
            // Count said free, bitmap disagrees.
            return Err(EfsError::Corrupt {
                block: bitmap_block.0,
                detail: format!("group {group} free_blocks_count disagrees with bitmap"),
            });
        };

        bitmap_set(&mut bitmap, rel);
        dev.write_block(bitmap_block, &bitmap)?;
        groups[gidx].free_blocks -= 1;

        let block = geo.group_block_to_absolute(group, rel);
        debug!(target: "efs::alloc", group = group.0, block = block.0, "alloc_block");
        return Ok(block);
    }

    Err(EfsError::NoSpace)
}

/// Return a block to its group's bitmap.
pub fn free_block(
    dev: &mut dyn BlockDevice,
    geo: &FsGeometry,
    groups: &mut [GroupStats],
    block: BlockNumber,
) -> Result<()> {
    let (group, rel) = geo.absolute_to_group_block(block)?;
    let gidx = group.0 as usize;
    let gs = groups.get(gidx).ok_or_else(|| EfsError::Corrupt {
        block: block.0,
        detail: "free_block: group out of range".into(),
    })?;

    let bitmap_block = gs.block_bitmap_block;
    let mut bitmap = dev.read_block(bitmap_block)?;
    if !bitmap_get(&bitmap, rel) {
        return Err(EfsError::Corrupt {
            block: block.0,
            detail: "double free of block".into(),
        });
    }
    bitmap_clear(&mut bitmap, rel);
    dev.write_block(bitmap_block, &bitmap)?;
    groups[gidx].free_blocks += 1;
    debug!(target: "efs::alloc", group = group.0, block = block.0, "free_block");
    Ok(())
}

// ── Inode allocation ────────────────────────────────────────────────────────

/// Allocate an inode number. For directories the placement hint prefers the
/// group with the most free blocks among those with a free inode; files
/// first-fit from `hint`.
pub fn alloc_inode(
    dev: &mut dyn BlockDevice,
    geo: &FsGeometry,
    groups: &mut [GroupStats],
    hint: GroupNumber,
    is_dir: bool,
) -> Result<InodeNumber> {
    let target = if is_dir {
        groups
            .iter()
            .filter(|gs| gs.free_inodes > 0)
            .max_by_key(|gs| gs.free_blocks)
            .map(|gs| gs.group)
            .unwrap_or(hint)
    } else {
        hint
    };

    for group in rotation(target, geo.group_count) {
        let gidx = group.0 as usize;
        let Some(gs) = groups.get(gidx) else {
            continue;
        };
        if gs.free_inodes == 0 {
            continue;
        }

        let bitmap_block = gs.inode_bitmap_block;
        let mut bitmap = dev.read_block(bitmap_block)?;
        let Some(rel) = bitmap_find_free(&bitmap, geo.inodes_per_group) else {
            return Err(EfsError::Corrupt {
                block: bitmap_block.0,
                detail: format!("group {group} free_inodes_count disagrees with bitmap"),
            });
        };

        bitmap_set(&mut bitmap, rel);
        dev.write_block(bitmap_block, &bitmap)?;
        groups[gidx].free_inodes -= 1;

        let ino = InodeNumber(group.0 * geo.inodes_per_group + rel + 1);
        debug!(target: "efs::alloc", group = group.0, ino = ino.0, "alloc_inode");
        return Ok(ino);
    }

    Err(EfsError::NoSpace)
}

/// Return an inode number to its group's bitmap.
pub fn free_inode(
    dev: &mut dyn BlockDevice,
    geo: &FsGeometry,
    groups: &mut [GroupStats],
    ino: InodeNumber,
) -> Result<()> {
    if !ino.is_valid() {
        return Err(EfsError::InvalidArgument("inode 0 cannot be freed"));
    }
    let group = efs_types::inode_to_group(ino, geo.inodes_per_group);
    let rel = efs_types::inode_index_in_group(ino, geo.inodes_per_group);
    let gidx = group.0 as usize;
    let gs = groups.get(gidx).ok_or_else(|| EfsError::Corrupt {
        block: 0,
        detail: format!("free_inode: inode {ino} out of range"),
    })?;

    let bitmap_block = gs.inode_bitmap_block;
    let mut bitmap = dev.read_block(bitmap_block)?;
    if !bitmap_get(&bitmap, rel) {
        return Err(EfsError::Corrupt {
            block: bitmap_block.0,
            detail: format!("double free of inode {ino}"),
        });
    }
    bitmap_clear(&mut bitmap, rel);
    dev.write_block(bitmap_block, &bitmap)?;
    groups[gidx].free_inodes += 1;
    debug!(target: "efs::alloc", group = group.0, ino = ino.0, "free_inode");
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
