#![forbid(unsafe_code)]
//! Fixed-layout little-endian codec for every on-disk record.
//!
//! Every record has a hand-rolled `pack`/`unpack` pair over explicit byte
//! offsets; `pack(unpack(bytes)) == bytes` holds for all valid inputs.
//! Unpacking validates magics and internal consistency and fails with
//! `ParseError` on anything malformed.

use efs_types::{
    DIR_ENTRY_HEADER_SIZE, EXTENT_ENTRY_SIZE, EXTENT_HEADER_SIZE, EXTENT_MAGIC, EXTENT_ROOT_SIZE,
    GROUP_DESC_SIZE, INODE_SIZE, ParseError, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, SUPERBLOCK_SIZE,
    align4, ensure_slice, read_fixed, read_le_u16, read_le_u32, read_le_u64,
};
use serde::{Deserialize, Serialize};

/// Byte span of the superblock covered by its checksum.
const SUPERBLOCK_CSUM_SPAN: usize = 52;

// ── Superblock ──────────────────────────────────────────────────────────────

/// Global filesystem header at block 0.
///
/// `inodes_per_group` is stored on disk as a u64 (the checksum span is 52
/// bytes) but always fits a u32 in practice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub fs_size_blocks: u64,
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub total_inodes: u64,
    pub free_blocks_count: u64,
    pub free_inodes_count: u64,
    pub first_data_block: u32,
}

impl Superblock {
    /// Serialize to the 56-byte on-disk form, computing the CRC32 checksum
    /// over the leading 52 bytes.
    #[must_use]
    pub fn pack(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = [0_u8; SUPERBLOCK_SIZE];
        buf[0x00..0x08].copy_from_slice(&self.fs_size_blocks.to_le_bytes());
        buf[0x08..0x0C].copy_from_slice(&self.block_size.to_le_bytes());
        buf[0x0C..0x10].copy_from_slice(&self.blocks_per_group.to_le_bytes());
        buf[0x10..0x18].copy_from_slice(&u64::from(self.inodes_per_group).to_le_bytes());
        buf[0x18..0x20].copy_from_slice(&self.total_inodes.to_le_bytes());
        buf[0x20..0x28].copy_from_slice(&self.free_blocks_count.to_le_bytes());
        buf[0x28..0x30].copy_from_slice(&self.free_inodes_count.to_le_bytes());
        buf[0x30..0x34].copy_from_slice(&self.first_data_block.to_le_bytes());
        let checksum = crc32fast::hash(&buf[..SUPERBLOCK_CSUM_SPAN]);
        buf[0x34..0x38].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Parse from the on-disk form, validating the CRC32 checksum.
    pub fn unpack(data: &[u8]) -> Result<Self, ParseError> {
        let region = ensure_slice(data, 0, SUPERBLOCK_SIZE)?;

        let stored = read_le_u32(region, 0x34)?;
        let computed = crc32fast::hash(&region[..SUPERBLOCK_CSUM_SPAN]);
        if stored != computed {
            return Err(ParseError::ChecksumMismatch {
                expected: computed,
                actual: stored,
            });
        }

        let inodes_per_group = read_le_u64(region, 0x10)?;
        let inodes_per_group =
            u32::try_from(inodes_per_group).map_err(|_| ParseError::InvalidField {
                field: "inodes_per_group",
                reason: "exceeds u32",
            })?;

        let sb = Self {
            fs_size_blocks: read_le_u64(region, 0x00)?,
            block_size: read_le_u32(region, 0x08)?,
            blocks_per_group: read_le_u32(region, 0x0C)?,
            inodes_per_group,
            total_inodes: read_le_u64(region, 0x18)?,
            free_blocks_count: read_le_u64(region, 0x20)?,
            free_inodes_count: read_le_u64(region, 0x28)?,
            first_data_block: read_le_u32(region, 0x30)?,
        };
        sb.validate_geometry()?;
        Ok(sb)
    }

    /// Sanity checks on mount: a zeroed or garbage superblock with a
    /// coincidentally-valid checksum must not get further.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if !self.block_size.is_power_of_two() || self.block_size < 512 {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be a power of two >= 512",
            });
        }
        if self.blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "blocks_per_group",
                reason: "cannot be zero",
            });
        }
        if self.inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "inodes_per_group",
                reason: "cannot be zero",
            });
        }
        if u64::from(self.first_data_block) >= self.fs_size_blocks {
            return Err(ParseError::InvalidField {
                field: "first_data_block",
                reason: "at or beyond image end",
            });
        }
        Ok(())
    }

    /// Number of block groups (and group descriptors).
    #[must_use]
    pub fn group_count(&self) -> u32 {
        u32::try_from(
            self.fs_size_blocks
                .div_ceil(u64::from(self.blocks_per_group)),
        )
        .unwrap_or(u32::MAX)
    }
}

// ── Group descriptor ────────────────────────────────────────────────────────

/// Per-group metadata: bitmap/table locations and free counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDesc {
    pub block_bitmap_block: u64,
    pub inode_bitmap_block: u64,
    pub inode_table_block: u64,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
}

impl GroupDesc {
    #[must_use]
    pub fn pack(&self) -> [u8; GROUP_DESC_SIZE] {
        let mut buf = [0_u8; GROUP_DESC_SIZE];
        buf[0x00..0x08].copy_from_slice(&self.block_bitmap_block.to_le_bytes());
        buf[0x08..0x10].copy_from_slice(&self.inode_bitmap_block.to_le_bytes());
        buf[0x10..0x18].copy_from_slice(&self.inode_table_block.to_le_bytes());
        buf[0x18..0x1C].copy_from_slice(&self.free_blocks_count.to_le_bytes());
        buf[0x1C..0x20].copy_from_slice(&self.free_inodes_count.to_le_bytes());
        buf
    }

    pub fn unpack(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            block_bitmap_block: read_le_u64(data, 0x00)?,
            inode_bitmap_block: read_le_u64(data, 0x08)?,
            inode_table_block: read_le_u64(data, 0x10)?,
            free_blocks_count: read_le_u32(data, 0x18)?,
            free_inodes_count: read_le_u32(data, 0x1C)?,
        })
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// 88-byte inode record. The trailing 48 bytes hold the inline extent-tree
/// root (or, for fast symlinks, the raw target path bytes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub links_count: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub flags: u32,
    #[serde(with = "serde_extent_root")]
    pub extent_root: [u8; EXTENT_ROOT_SIZE],
}

mod serde_extent_root {
    use super::EXTENT_ROOT_SIZE;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8; EXTENT_ROOT_SIZE], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(v)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<[u8; EXTENT_ROOT_SIZE], D::Error> {
        let bytes = <Vec<u8>>::deserialize(d)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("extent_root must be 48 bytes"))
    }
}

impl Inode {
    /// A fully zeroed record, as freed inode slots appear on disk.
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            links_count: 0,
            atime: 0,
            ctime: 0,
            mtime: 0,
            flags: 0,
            extent_root: [0_u8; EXTENT_ROOT_SIZE],
        }
    }

    #[must_use]
    pub fn pack(&self) -> [u8; INODE_SIZE] {
        let mut buf = [0_u8; INODE_SIZE];
        #[allow(clippy::cast_possible_truncation)]
        let size_lo = self.size as u32;
        let size_hi = (self.size >> 32) as u32;
        buf[0x00..0x04].copy_from_slice(&self.mode.to_le_bytes());
        buf[0x04..0x08].copy_from_slice(&self.uid.to_le_bytes());
        buf[0x08..0x0C].copy_from_slice(&self.gid.to_le_bytes());
        buf[0x0C..0x10].copy_from_slice(&size_lo.to_le_bytes());
        buf[0x10..0x14].copy_from_slice(&size_hi.to_le_bytes());
        buf[0x14..0x18].copy_from_slice(&self.links_count.to_le_bytes());
        buf[0x18..0x1C].copy_from_slice(&self.atime.to_le_bytes());
        buf[0x1C..0x20].copy_from_slice(&self.ctime.to_le_bytes());
        buf[0x20..0x24].copy_from_slice(&self.mtime.to_le_bytes());
        buf[0x24..0x28].copy_from_slice(&self.flags.to_le_bytes());
        buf[0x28..INODE_SIZE].copy_from_slice(&self.extent_root);
        buf
    }

    pub fn unpack(data: &[u8]) -> Result<Self, ParseError> {
        let region = ensure_slice(data, 0, INODE_SIZE)?;
        let size_lo = u64::from(read_le_u32(region, 0x0C)?);
        let size_hi = u64::from(read_le_u32(region, 0x10)?);
        Ok(Self {
            mode: read_le_u32(region, 0x00)?,
            uid: read_le_u32(region, 0x04)?,
            gid: read_le_u32(region, 0x08)?,
            size: size_lo | (size_hi << 32),
            links_count: read_le_u32(region, 0x14)?,
            atime: read_le_u32(region, 0x18)?,
            ctime: read_le_u32(region, 0x1C)?,
            mtime: read_le_u32(region, 0x20)?,
            flags: read_le_u32(region, 0x24)?,
            extent_root: read_fixed::<EXTENT_ROOT_SIZE>(region, 0x28)?,
        })
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    /// Fast symlinks keep the target inline in `extent_root`; there is no
    /// extent tree to walk or free for them.
    #[must_use]
    pub fn is_fast_symlink(&self) -> bool {
        self.is_symlink() && self.size as usize <= EXTENT_ROOT_SIZE
    }
}

// ── Extent tree records ─────────────────────────────────────────────────────

/// 12-byte header shared by the inline root and every node block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentHeader {
    pub entries: u16,
    pub max_entries: u16,
    pub depth: u16,
}

impl ExtentHeader {
    #[must_use]
    pub fn pack(&self) -> [u8; EXTENT_HEADER_SIZE] {
        let mut buf = [0_u8; EXTENT_HEADER_SIZE];
        buf[0x00..0x02].copy_from_slice(&EXTENT_MAGIC.to_le_bytes());
        buf[0x02..0x04].copy_from_slice(&self.entries.to_le_bytes());
        buf[0x04..0x06].copy_from_slice(&self.max_entries.to_le_bytes());
        buf[0x06..0x08].copy_from_slice(&self.depth.to_le_bytes());
        // bytes 8..12 reserved, zero
        buf
    }

    pub fn unpack(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u16(data, 0x00)?;
        if magic != EXTENT_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXTENT_MAGIC),
                actual: u64::from(magic),
            });
        }
        let header = Self {
            entries: read_le_u16(data, 0x02)?,
            max_entries: read_le_u16(data, 0x04)?,
            depth: read_le_u16(data, 0x06)?,
        };
        if header.entries > header.max_entries {
            return Err(ParseError::InvalidField {
                field: "entries",
                reason: "entries exceed max_entries",
            });
        }
        Ok(header)
    }
}

/// Leaf entry: a run of `block_count` logically and physically contiguous
/// blocks. The physical start is 48-bit, split hi16/lo32 on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentLeaf {
    pub logical_block: u32,
    pub block_count: u16,
    pub start_hi: u16,
    pub start_lo: u32,
}

impl ExtentLeaf {
    #[must_use]
    pub fn new(logical_block: u32, block_count: u16, start_block: u64) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        Self {
            logical_block,
            block_count,
            start_hi: (start_block >> 32) as u16,
            start_lo: start_block as u32,
        }
    }

    #[must_use]
    pub fn start_block(&self) -> u64 {
        (u64::from(self.start_hi) << 32) | u64::from(self.start_lo)
    }

    /// First logical block past this extent.
    #[must_use]
    pub fn logical_end(&self) -> u32 {
        self.logical_block + u32::from(self.block_count)
    }

    #[must_use]
    pub fn pack(&self) -> [u8; EXTENT_ENTRY_SIZE] {
        let mut buf = [0_u8; EXTENT_ENTRY_SIZE];
        buf[0x00..0x04].copy_from_slice(&self.logical_block.to_le_bytes());
        buf[0x04..0x06].copy_from_slice(&self.block_count.to_le_bytes());
        buf[0x06..0x08].copy_from_slice(&self.start_hi.to_le_bytes());
        buf[0x08..0x0C].copy_from_slice(&self.start_lo.to_le_bytes());
        buf
    }

    pub fn unpack(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            logical_block: read_le_u32(data, 0x00)?,
            block_count: read_le_u16(data, 0x04)?,
            start_hi: read_le_u16(data, 0x06)?,
            start_lo: read_le_u32(data, 0x08)?,
        })
    }
}

/// Index entry: points at the child node covering logical blocks
/// `>= logical_block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentIndex {
    pub logical_block: u32,
    pub child_block: u64,
}

impl ExtentIndex {
    #[must_use]
    pub fn pack(&self) -> [u8; EXTENT_ENTRY_SIZE] {
        let mut buf = [0_u8; EXTENT_ENTRY_SIZE];
        buf[0x00..0x04].copy_from_slice(&self.logical_block.to_le_bytes());
        buf[0x04..0x0C].copy_from_slice(&self.child_block.to_le_bytes());
        buf
    }

    pub fn unpack(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            logical_block: read_le_u32(data, 0x00)?,
            child_block: read_le_u64(data, 0x04)?,
        })
    }
}

/// Entries of one extent node: leaves at depth 0, indexes above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtentEntries {
    Leaves(Vec<ExtentLeaf>),
    Indexes(Vec<ExtentIndex>),
}

impl ExtentEntries {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Leaves(v) => v.len(),
            Self::Indexes(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A decoded extent node (inline root or whole-block node).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentNode {
    pub max_entries: u16,
    pub depth: u16,
    pub entries: ExtentEntries,
}

/// Entry capacity of a node occupying a whole block.
#[must_use]
pub fn block_node_capacity(block_size: u32) -> u16 {
    let cap = (block_size as usize - EXTENT_HEADER_SIZE) / EXTENT_ENTRY_SIZE;
    u16::try_from(cap).unwrap_or(u16::MAX)
}

impl ExtentNode {
    /// An empty depth-0 node with the given capacity.
    #[must_use]
    pub fn empty_leaf(max_entries: u16) -> Self {
        Self {
            max_entries,
            depth: 0,
            entries: ExtentEntries::Leaves(Vec::new()),
        }
    }

    /// Decode a node from its byte window (48-byte inline root or a whole
    /// node block).
    pub fn unpack(data: &[u8]) -> Result<Self, ParseError> {
        let header = ExtentHeader::unpack(data)?;
        let count = usize::from(header.entries);

        let capacity = (data.len().saturating_sub(EXTENT_HEADER_SIZE)) / EXTENT_ENTRY_SIZE;
        if usize::from(header.max_entries) > capacity {
            return Err(ParseError::InvalidField {
                field: "max_entries",
                reason: "exceeds node window capacity",
            });
        }

        let entries = if header.depth == 0 {
            let mut leaves = Vec::with_capacity(count);
            for idx in 0..count {
                let base = EXTENT_HEADER_SIZE + idx * EXTENT_ENTRY_SIZE;
                leaves.push(ExtentLeaf::unpack(ensure_slice(
                    data,
                    base,
                    EXTENT_ENTRY_SIZE,
                )?)?);
            }
            ExtentEntries::Leaves(leaves)
        } else {
            let mut indexes = Vec::with_capacity(count);
            for idx in 0..count {
                let base = EXTENT_HEADER_SIZE + idx * EXTENT_ENTRY_SIZE;
                indexes.push(ExtentIndex::unpack(ensure_slice(
                    data,
                    base,
                    EXTENT_ENTRY_SIZE,
                )?)?);
            }
            ExtentEntries::Indexes(indexes)
        };

        Ok(Self {
            max_entries: header.max_entries,
            depth: header.depth,
            entries,
        })
    }

    /// Encode into `out` (zero-padding the tail). `out` must be large enough
    /// for `max_entries` entries.
    pub fn pack_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        let needed =
            EXTENT_HEADER_SIZE + usize::from(self.max_entries) * EXTENT_ENTRY_SIZE;
        if out.len() < needed {
            return Err(ParseError::InsufficientData {
                needed,
                offset: 0,
                actual: out.len(),
            });
        }
        let count = u16::try_from(self.entries.len()).map_err(|_| ParseError::InvalidField {
            field: "entries",
            reason: "entry count exceeds u16",
        })?;
        if count > self.max_entries {
            return Err(ParseError::InvalidField {
                field: "entries",
                reason: "entries exceed max_entries",
            });
        }

        out.fill(0);
        let header = ExtentHeader {
            entries: count,
            max_entries: self.max_entries,
            depth: self.depth,
        };
        out[..EXTENT_HEADER_SIZE].copy_from_slice(&header.pack());

        match &self.entries {
            ExtentEntries::Leaves(leaves) => {
                for (idx, leaf) in leaves.iter().enumerate() {
                    let base = EXTENT_HEADER_SIZE + idx * EXTENT_ENTRY_SIZE;
                    out[base..base + EXTENT_ENTRY_SIZE].copy_from_slice(&leaf.pack());
                }
            }
            ExtentEntries::Indexes(indexes) => {
                for (idx, index) in indexes.iter().enumerate() {
                    let base = EXTENT_HEADER_SIZE + idx * EXTENT_ENTRY_SIZE;
                    out[base..base + EXTENT_ENTRY_SIZE].copy_from_slice(&index.pack());
                }
            }
        }
        Ok(())
    }

    /// First logical block covered by this node (minimum key of the subtree).
    #[must_use]
    pub fn first_logical(&self) -> Option<u32> {
        match &self.entries {
            ExtentEntries::Leaves(v) => v.first().map(|l| l.logical_block),
            ExtentEntries::Indexes(v) => v.first().map(|i| i.logical_block),
        }
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= usize::from(self.max_entries)
    }
}

// ── Directory entries ───────────────────────────────────────────────────────

/// Variable-length directory record. `entry_len` is the total on-disk span
/// of the record including padding; the last record in a block extends its
/// `entry_len` to the block end. A record with `inode_num == 0` is a
/// tombstone and is skipped by all scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub inode_num: u32,
    pub entry_len: u32,
    pub file_type: u8,
    pub name: Vec<u8>,
}

/// Minimum record length able to hold a name of `name_len` bytes.
#[must_use]
pub fn dir_record_len(name_len: usize) -> usize {
    align4(DIR_ENTRY_HEADER_SIZE + name_len)
}

impl DirEntry {
    /// Minimum on-disk span of this record.
    #[must_use]
    pub fn min_len(&self) -> usize {
        dir_record_len(self.name.len())
    }

    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    /// Parse the record starting at `offset`, validating that `entry_len`
    /// keeps the record inside the block and holds the name.
    pub fn parse_at(block: &[u8], offset: usize) -> Result<Self, ParseError> {
        let inode_num = read_le_u32(block, offset)?;
        let entry_len = read_le_u32(block, offset + 4)?;
        let name_len = read_le_u32(block, offset + 8)?;
        let file_type = ensure_slice(block, offset + 12, 1)?[0];

        let entry_len_usize = entry_len as usize;
        let name_len_usize = name_len as usize;
        if entry_len_usize < DIR_ENTRY_HEADER_SIZE || entry_len_usize % 4 != 0 {
            return Err(ParseError::InvalidField {
                field: "entry_len",
                reason: "below header size or unaligned",
            });
        }
        let end = offset
            .checked_add(entry_len_usize)
            .ok_or(ParseError::InvalidField {
                field: "entry_len",
                reason: "overflow",
            })?;
        if end > block.len() {
            return Err(ParseError::InvalidField {
                field: "entry_len",
                reason: "record extends past block end",
            });
        }
        if DIR_ENTRY_HEADER_SIZE + name_len_usize > entry_len_usize {
            return Err(ParseError::InvalidField {
                field: "name_len",
                reason: "name extends past entry_len",
            });
        }

        let name_start = offset + DIR_ENTRY_HEADER_SIZE;
        let name = block[name_start..name_start + name_len_usize].to_vec();
        Ok(Self {
            inode_num,
            entry_len,
            file_type,
            name,
        })
    }

    /// Write this record at `offset`, zeroing its padding.
    pub fn write_at(&self, block: &mut [u8], offset: usize) -> Result<(), ParseError> {
        let entry_len = self.entry_len as usize;
        let end = offset
            .checked_add(entry_len)
            .ok_or(ParseError::InvalidField {
                field: "entry_len",
                reason: "overflow",
            })?;
        if end > block.len() || entry_len < DIR_ENTRY_HEADER_SIZE + self.name.len() {
            return Err(ParseError::InvalidField {
                field: "entry_len",
                reason: "record does not fit its span",
            });
        }
        let name_len = u32::try_from(self.name.len()).map_err(|_| ParseError::InvalidField {
            field: "name_len",
            reason: "name exceeds u32",
        })?;

        block[offset..end].fill(0);
        block[offset..offset + 4].copy_from_slice(&self.inode_num.to_le_bytes());
        block[offset + 4..offset + 8].copy_from_slice(&self.entry_len.to_le_bytes());
        block[offset + 8..offset + 12].copy_from_slice(&name_len.to_le_bytes());
        block[offset + 12] = self.file_type;
        // offset + 13 reserved, zero
        let name_start = offset + DIR_ENTRY_HEADER_SIZE;
        block[name_start..name_start + self.name.len()].copy_from_slice(&self.name);
        Ok(())
    }
}

/// Walk every record in a directory data block, tombstones included.
/// Yields `(offset, entry)` pairs in on-disk order.
pub fn dir_block_records(block: &[u8]) -> Result<Vec<(usize, DirEntry)>, ParseError> {
    let mut records = Vec::new();
    let mut offset = 0_usize;
    while offset + DIR_ENTRY_HEADER_SIZE <= block.len() {
        let entry = DirEntry::parse_at(block, offset)?;
        let span = entry.entry_len as usize;
        records.push((offset, entry));
        offset += span;
    }
    if offset != block.len() {
        return Err(ParseError::InvalidField {
            field: "entry_len",
            reason: "records do not tile the block",
        });
    }
    Ok(records)
}
