#![forbid(unsafe_code)]
//! Directory layer.
//!
//! A directory's file data is a sequence of variable-length records packed
//! into whole blocks; records never span a block boundary and the last
//! record of each block stretches its `entry_len` to the block end. Removal
//! folds a record into its predecessor, or tombstones it (`inode_num = 0`)
//! when it is first in its block; tombstones are skipped by every scan and
//! never reused, so listing order stays insertion order.

use efs_alloc::{FsGeometry, GroupStats};
use efs_block::BlockDevice;
use efs_error::{EfsError, Result};
use efs_ondisk::{DirEntry, Inode, dir_block_records, dir_record_len};
use efs_types::{BlockNumber, FT_DIRECTORY, GroupNumber, InodeNumber};

/// One live directory entry, as surfaced by `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub ino: InodeNumber,
    pub file_type: u8,
    pub name: Vec<u8>,
}

impl DirEntryInfo {
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Longest accepted entry name: a record must fit a block alongside the
/// block's mandatory first record.
#[must_use]
pub fn max_name_len(block_size: u32) -> usize {
    block_size as usize - dir_record_len(1) - efs_types::DIR_ENTRY_HEADER_SIZE
}

// ── Block access ────────────────────────────────────────────────────────────

fn dir_block_count(inode: &Inode, block_size: u32) -> u32 {
    u32::try_from(inode.size / u64::from(block_size)).unwrap_or(u32::MAX)
}

fn dir_block(dev: &dyn BlockDevice, inode: &Inode, logical: u32) -> Result<(BlockNumber, Vec<u8>)> {
    let Some((physical, _run)) = efs_extent::search(dev, &inode.extent_root, logical)? else {
        return Err(EfsError::Corrupt {
            block: 0,
            detail: format!("directory block {logical} has no extent mapping"),
        });
    };
    let block = BlockNumber(physical);
    let data = dev.read_block(block)?;
    Ok((block, data))
}

// ── Lookup / list ───────────────────────────────────────────────────────────

/// Find `name`, returning its inode number.
pub fn lookup(dev: &dyn BlockDevice, inode: &Inode, name: &[u8]) -> Result<Option<InodeNumber>> {
    let block_size = dev.block_size();
    for logical in 0..dir_block_count(inode, block_size) {
        let (block, data) = dir_block(dev, inode, logical)?;
        let records = dir_block_records(&data).map_err(|e| EfsError::corrupt_at(block.0, &e))?;
        for (_, entry) in records {
            if entry.inode_num != 0 && entry.name == name {
                return Ok(Some(InodeNumber(entry.inode_num)));
            }
        }
    }
    Ok(None)
}

/// All live entries in on-disk order, `.` and `..` included.
pub fn list(dev: &dyn BlockDevice, inode: &Inode) -> Result<Vec<DirEntryInfo>> {
    let block_size = dev.block_size();
    let mut out = Vec::new();
    for logical in 0..dir_block_count(inode, block_size) {
        let (block, data) = dir_block(dev, inode, logical)?;
        let records = dir_block_records(&data).map_err(|e| EfsError::corrupt_at(block.0, &e))?;
        for (_, entry) in records {
            if entry.inode_num != 0 {
                out.push(DirEntryInfo {
                    ino: InodeNumber(entry.inode_num),
                    file_type: entry.file_type,
                    name: entry.name,
                });
            }
        }
    }
    Ok(out)
}

/// Whether the directory holds nothing besides `.` and `..`.
pub fn is_empty(dev: &dyn BlockDevice, inode: &Inode) -> Result<bool> {
    Ok(list(dev, inode)?
        .iter()
        .all(|e| e.name == b"." || e.name == b".."))
}

// ── Insert ──────────────────────────────────────────────────────────────────

/// Add an entry. Existing blocks are scanned for slack behind their last
/// record; when none fits, the directory grows by one block.
pub fn insert(
    dev: &mut dyn BlockDevice,
    geo: &FsGeometry,
    groups: &mut [GroupStats],
    hint: GroupNumber,
    inode: &mut Inode,
    name: &[u8],
    child: InodeNumber,
    file_type: u8,
) -> Result<()> {
    let block_size = dev.block_size();
    if name.is_empty() || name.contains(&b'/') || name.len() > max_name_len(block_size) {
        return Err(EfsError::InvalidArgument("invalid directory entry name"));
    }
    if lookup(dev, inode, name)?.is_some() {
        return Err(EfsError::Exists(String::from_utf8_lossy(name).into_owned()));
    }

    let needed = dir_record_len(name.len());
    let entry_for = |entry_len: u32| DirEntry {
        inode_num: child.0,
        entry_len,
        file_type,
        name: name.to_vec(),
    };

    for logical in 0..dir_block_count(inode, block_size) {
        let (block, mut data) = dir_block(dev, inode, logical)?;
        let records = dir_block_records(&data).map_err(|e| EfsError::corrupt_at(block.0, &e))?;
        let Some((last_offset, last)) = records.into_iter().next_back() else {
            continue;
        };

        let last_min = last.min_len();
        let slack = last.entry_len as usize - last_min;
        if slack < needed {
            continue;
        }

        let mut shrunk = last;
        shrunk.entry_len = u32::try_from(last_min).unwrap_or(0);
        shrunk
            .write_at(&mut data, last_offset)
            .map_err(|e| EfsError::corrupt_at(block.0, &e))?;
        entry_for(u32::try_from(slack).unwrap_or(0))
            .write_at(&mut data, last_offset + last_min)
            .map_err(|e| EfsError::corrupt_at(block.0, &e))?;
        dev.write_block(block, &data)?;
        return Ok(());
    }

    // No room anywhere: grow by one block holding the single record.
    let logical = dir_block_count(inode, block_size);
    let physical = efs_extent::append_block(dev, geo, groups, hint, &mut inode.extent_root, logical)?;
    let mut data = vec![0_u8; block_size as usize];
    entry_for(block_size)
        .write_at(&mut data, 0)
        .map_err(|e| EfsError::corrupt_at(physical.0, &e))?;
    dev.write_block(physical, &data)?;
    inode.size += u64::from(block_size);
    Ok(())
}

// ── Remove ──────────────────────────────────────────────────────────────────

/// Remove an entry by name, returning the inode it pointed to. `.` and `..`
/// are not removable.
pub fn remove(dev: &mut dyn BlockDevice, inode: &mut Inode, name: &[u8]) -> Result<InodeNumber> {
    if name == b"." || name == b".." {
        return Err(EfsError::InvalidArgument("cannot remove . or .."));
    }
    let block_size = dev.block_size();

    for logical in 0..dir_block_count(inode, block_size) {
        let (block, mut data) = dir_block(dev, inode, logical)?;
        let records = dir_block_records(&data).map_err(|e| EfsError::corrupt_at(block.0, &e))?;

        let mut previous: Option<(usize, DirEntry)> = None;
        for (offset, entry) in records {
            if entry.inode_num != 0 && entry.name == name {
                let child = InodeNumber(entry.inode_num);
                if let Some((prev_offset, mut prev)) = previous {
                    prev.entry_len += entry.entry_len;
                    prev.write_at(&mut data, prev_offset)
                        .map_err(|e| EfsError::corrupt_at(block.0, &e))?;
                } else {
                    let tombstone = DirEntry {
                        inode_num: 0,
                        entry_len: entry.entry_len,
                        file_type: 0,
                        name: Vec::new(),
                    };
                    tombstone
                        .write_at(&mut data, offset)
                        .map_err(|e| EfsError::corrupt_at(block.0, &e))?;
                }
                dev.write_block(block, &data)?;
                return Ok(child);
            }
            previous = Some((offset, entry));
        }
    }

    Err(EfsError::NotFound(
        String::from_utf8_lossy(name).into_owned(),
    ))
}

// ── Initialization ──────────────────────────────────────────────────────────

/// Lay out a fresh directory: one data block holding `.` and `..`.
pub fn init_directory(
    dev: &mut dyn BlockDevice,
    geo: &FsGeometry,
    groups: &mut [GroupStats],
    hint: GroupNumber,
    inode: &mut Inode,
    self_ino: InodeNumber,
    parent_ino: InodeNumber,
) -> Result<()> {
    let block_size = dev.block_size();
    let physical = efs_extent::append_block(dev, geo, groups, hint, &mut inode.extent_root, 0)?;

    let mut data = vec![0_u8; block_size as usize];
    let dot_len = dir_record_len(1);
    let dot = DirEntry {
        inode_num: self_ino.0,
        entry_len: u32::try_from(dot_len).unwrap_or(0),
        file_type: FT_DIRECTORY,
        name: b".".to_vec(),
    };
    let dotdot = DirEntry {
        inode_num: parent_ino.0,
        entry_len: block_size - u32::try_from(dot_len).unwrap_or(0),
        file_type: FT_DIRECTORY,
        name: b"..".to_vec(),
    };
    dot.write_at(&mut data, 0)
        .map_err(|e| EfsError::corrupt_at(physical.0, &e))?;
    dotdot
        .write_at(&mut data, dot_len)
        .map_err(|e| EfsError::corrupt_at(physical.0, &e))?;
    dev.write_block(physical, &data)?;
    inode.size = u64::from(block_size);
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use efs_alloc::bitmap_set;
    use efs_block::MemBlockDevice;
    use efs_inode::init_inode;
    use efs_types::{FT_REGULAR, FT_SYMLINK, S_IFDIR};

    fn make_world() -> (MemBlockDevice, FsGeometry, Vec<GroupStats>) {
        let geo = FsGeometry {
            block_size: 4096,
            blocks_per_group: 8191,
            inodes_per_group: 2048,
            fs_size_blocks: 8192,
            total_inodes: 2048,
            first_data_block: 1,
            group_count: 1,
        };
        let mut dev = MemBlockDevice::new(4096, geo.fs_size_blocks);
        let mut bitmap = vec![0_u8; 4096];
        for bit in 0..46 {
            bitmap_set(&mut bitmap, bit);
        }
        dev.write_block(BlockNumber(1), &bitmap).unwrap();
        let groups = vec![GroupStats {
            group: GroupNumber(0),
            free_blocks: geo.blocks_per_group - 46,
            free_inodes: geo.inodes_per_group,
            block_bitmap_block: BlockNumber(1),
            inode_bitmap_block: BlockNumber(2),
            inode_table_block: BlockNumber(3),
        }];
        (dev, geo, groups)
    }

    fn make_dir(
        dev: &mut MemBlockDevice,
        geo: &FsGeometry,
        groups: &mut [GroupStats],
    ) -> Inode {
        let mut inode = init_inode(S_IFDIR | 0o755, 0, 0, 2, 0);
        init_directory(
            dev,
            geo,
            groups,
            GroupNumber(0),
            &mut inode,
            InodeNumber(2),
            InodeNumber(2),
        )
        .unwrap();
        inode
    }

    #[test]
    fn fresh_directory_has_dot_entries() {
        let (mut dev, geo, mut groups) = make_world();
        let inode = make_dir(&mut dev, &geo, &mut groups);

        let entries = list(&dev, &inode).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, b".");
        assert_eq!(entries[0].ino, InodeNumber(2));
        assert_eq!(entries[1].name, b"..");
        assert_eq!(entries[1].ino, InodeNumber(2));
        assert!(is_empty(&dev, &inode).unwrap());
    }

    #[test]
    fn insert_lookup_remove_round_trip() {
        let (mut dev, geo, mut groups) = make_world();
        let mut inode = make_dir(&mut dev, &geo, &mut groups);

        insert(
            &mut dev,
            &geo,
            &mut groups,
            GroupNumber(0),
            &mut inode,
            b"hello.txt",
            InodeNumber(12),
            FT_REGULAR,
        )
        .unwrap();
        assert_eq!(
            lookup(&dev, &inode, b"hello.txt").unwrap(),
            Some(InodeNumber(12))
        );
        assert!(!is_empty(&dev, &inode).unwrap());

        let removed = remove(&mut dev, &mut inode, b"hello.txt").unwrap();
        assert_eq!(removed, InodeNumber(12));
        assert_eq!(lookup(&dev, &inode, b"hello.txt").unwrap(), None);
        assert!(is_empty(&dev, &inode).unwrap());
    }

    #[test]
    fn insert_rejects_duplicates_and_bad_names() {
        let (mut dev, geo, mut groups) = make_world();
        let mut inode = make_dir(&mut dev, &geo, &mut groups);

        insert(
            &mut dev,
            &geo,
            &mut groups,
            GroupNumber(0),
            &mut inode,
            b"x",
            InodeNumber(3),
            FT_REGULAR,
        )
        .unwrap();
        assert!(matches!(
            insert(
                &mut dev,
                &geo,
                &mut groups,
                GroupNumber(0),
                &mut inode,
                b"x",
                InodeNumber(4),
                FT_REGULAR,
            ),
            Err(EfsError::Exists(_))
        ));
        for bad in [&b""[..], &b"a/b"[..]] {
            assert!(matches!(
                insert(
                    &mut dev,
                    &geo,
                    &mut groups,
                    GroupNumber(0),
                    &mut inode,
                    bad,
                    InodeNumber(4),
                    FT_REGULAR,
                ),
                Err(EfsError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn listing_keeps_insertion_order_across_removals() {
        let (mut dev, geo, mut groups) = make_world();
        let mut inode = make_dir(&mut dev, &geo, &mut groups);

        for i in 0..20 {
            let name = format!("file{i:02}");
            insert(
                &mut dev,
                &geo,
                &mut groups,
                GroupNumber(0),
                &mut inode,
                name.as_bytes(),
                InodeNumber(100 + i),
                FT_REGULAR,
            )
            .unwrap();
        }
        for i in (0..20).step_by(2) {
            let name = format!("file{i:02}");
            remove(&mut dev, &mut inode, name.as_bytes()).unwrap();
        }

        let names: Vec<String> = list(&dev, &inode)
            .unwrap()
            .into_iter()
            .filter(|e| e.name != b"." && e.name != b"..")
            .map(|e| e.name_str())
            .collect();
        let expected: Vec<String> = (0..20)
            .filter(|i| i % 2 == 1)
            .map(|i| format!("file{i:02}"))
            .collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn removing_first_entry_of_a_block_leaves_a_tombstone() {
        let (mut dev, geo, mut groups) = make_world();
        let mut inode = make_dir(&mut dev, &geo, &mut groups);

        // "." is first but protected; fill one block exactly, then force a
        // second block whose first entry we remove.
        let mut count = 0;
        while inode.size == 4096 {
            let name = format!("pad{count:04}");
            insert(
                &mut dev,
                &geo,
                &mut groups,
                GroupNumber(0),
                &mut inode,
                name.as_bytes(),
                InodeNumber(100),
                FT_REGULAR,
            )
            .unwrap();
            count += 1;
        }
        assert_eq!(inode.size, 8192);

        // The entry that spilled into block 1 is first in its block.
        let spilled = format!("pad{:04}", count - 1);
        remove(&mut dev, &mut inode, spilled.as_bytes()).unwrap();
        assert_eq!(lookup(&dev, &inode, spilled.as_bytes()).unwrap(), None);

        // A follow-up insert still works and lands after the tombstone.
        insert(
            &mut dev,
            &geo,
            &mut groups,
            GroupNumber(0),
            &mut inode,
            b"after",
            InodeNumber(200),
            FT_SYMLINK,
        )
        .unwrap();
        assert_eq!(
            lookup(&dev, &inode, b"after").unwrap(),
            Some(InodeNumber(200))
        );
    }

    #[test]
    fn growth_allocates_new_blocks() {
        let (mut dev, geo, mut groups) = make_world();
        let mut inode = make_dir(&mut dev, &geo, &mut groups);
        let free_before = groups[0].free_blocks;

        for i in 0..300 {
            let name = format!("some-longer-file-name-{i:05}");
            insert(
                &mut dev,
                &geo,
                &mut groups,
                GroupNumber(0),
                &mut inode,
                name.as_bytes(),
                InodeNumber(10 + i),
                FT_REGULAR,
            )
            .unwrap();
        }

        assert!(inode.size > 4096);
        assert!(groups[0].free_blocks < free_before);
        for i in [0, 150, 299] {
            let name = format!("some-longer-file-name-{i:05}");
            assert_eq!(
                lookup(&dev, &inode, name.as_bytes()).unwrap(),
                Some(InodeNumber(10 + i))
            );
        }
    }
}
