#![forbid(unsafe_code)]
//! Per-inode extent B+ tree.
//!
//! The tree maps logical block numbers to physical runs. Its root lives in
//! the inode's 48-byte window (capacity 3); once the root overflows it is
//! promoted and interior/leaf nodes occupy whole data blocks. Growth is
//! always at the rightmost edge: the file layer appends one block at a time
//! and adjacent physical allocations coalesce into a single leaf.

use efs_alloc::{FsGeometry, GroupStats};
use efs_block::BlockDevice;
use efs_error::{EfsError, Result};
use efs_ondisk::{ExtentEntries, ExtentIndex, ExtentLeaf, ExtentNode, block_node_capacity};
use efs_types::{BlockNumber, EXTENT_ROOT_MAX_ENTRIES, EXTENT_ROOT_SIZE, GroupNumber};
use tracing::debug;

/// The inline root window inside an inode.
pub type RootWindow = [u8; EXTENT_ROOT_SIZE];

// ── Node I/O helpers ────────────────────────────────────────────────────────

fn read_node(dev: &dyn BlockDevice, block: BlockNumber, expected_depth: u16) -> Result<ExtentNode> {
    let buf = dev.read_block(block)?;
    let node = ExtentNode::unpack(&buf).map_err(|e| EfsError::corrupt_at(block.0, &e))?;
    if node.depth != expected_depth {
        return Err(EfsError::Corrupt {
            block: block.0,
            detail: format!(
                "extent node depth {} does not match parent (expected {expected_depth})",
                node.depth
            ),
        });
    }
    Ok(node)
}

fn write_node(dev: &mut dyn BlockDevice, block: BlockNumber, node: &ExtentNode) -> Result<()> {
    let mut buf = vec![0_u8; dev.block_size() as usize];
    node.pack_into(&mut buf)?;
    dev.write_block(block, &buf)
}

fn parse_root(window: &RootWindow) -> Result<ExtentNode> {
    ExtentNode::unpack(window).map_err(|e| EfsError::Corrupt {
        block: 0,
        detail: format!("inline extent root: {e}"),
    })
}

fn store_root(window: &mut RootWindow, node: &ExtentNode) -> Result<()> {
    node.pack_into(window)?;
    Ok(())
}

fn indexes(node: &ExtentNode) -> Result<&Vec<ExtentIndex>> {
    match &node.entries {
        ExtentEntries::Indexes(v) => Ok(v),
        ExtentEntries::Leaves(_) => Err(EfsError::Corrupt {
            block: 0,
            detail: "extent node with depth > 0 holds leaves".into(),
        }),
    }
}

fn leaves(node: &ExtentNode) -> Result<&Vec<ExtentLeaf>> {
    match &node.entries {
        ExtentEntries::Leaves(v) => Ok(v),
        ExtentEntries::Indexes(_) => Err(EfsError::Corrupt {
            block: 0,
            detail: "extent node with depth 0 holds indexes".into(),
        }),
    }
}

// ── Search ──────────────────────────────────────────────────────────────────

/// Resolve `logical` to `(physical_block, run_remaining)`.
///
/// `run_remaining` is how many blocks starting at `logical` are physically
/// contiguous within the selected extent. Returns `None` when `logical` is
/// past the tree's coverage (end of file; holes are never created).
pub fn search(
    dev: &dyn BlockDevice,
    root: &RootWindow,
    logical: u32,
) -> Result<Option<(u64, u32)>> {
    let mut node = parse_root(root)?;

    while node.depth > 0 {
        let idx = indexes(&node)?;
        let pos = idx.partition_point(|e| e.logical_block <= logical);
        if pos == 0 {
            return Ok(None);
        }
        let child = BlockNumber(idx[pos - 1].child_block);
        node = read_node(dev, child, node.depth - 1)?;
    }

    let lv = leaves(&node)?;
    let pos = lv.partition_point(|e| e.logical_block <= logical);
    if pos == 0 {
        return Ok(None);
    }
    let leaf = lv[pos - 1];
    if logical >= leaf.logical_end() {
        return Ok(None);
    }
    let within = logical - leaf.logical_block;
    Ok(Some((
        leaf.start_block() + u64::from(within),
        u32::from(leaf.block_count) - within,
    )))
}

/// First logical block past the tree's coverage (0 for an empty tree).
pub fn coverage_end(dev: &dyn BlockDevice, root: &RootWindow) -> Result<u32> {
    let mut node = parse_root(root)?;
    while node.depth > 0 {
        let idx = indexes(&node)?;
        let Some(last) = idx.last() else {
            return Ok(0);
        };
        node = read_node(dev, BlockNumber(last.child_block), node.depth - 1)?;
    }
    Ok(leaves(&node)?.last().map_or(0, ExtentLeaf::logical_end))
}

// ── Walk ────────────────────────────────────────────────────────────────────

/// Visit every leaf in logical order.
pub fn walk(
    dev: &dyn BlockDevice,
    root: &RootWindow,
    visit: &mut dyn FnMut(&ExtentLeaf) -> Result<()>,
) -> Result<()> {
    let node = parse_root(root)?;
    walk_node(dev, &node, visit)
}

fn walk_node(
    dev: &dyn BlockDevice,
    node: &ExtentNode,
    visit: &mut dyn FnMut(&ExtentLeaf) -> Result<()>,
) -> Result<()> {
    match &node.entries {
        ExtentEntries::Leaves(lv) => {
            for leaf in lv {
                visit(leaf)?;
            }
        }
        ExtentEntries::Indexes(idx) => {
            for entry in idx {
                let child = read_node(dev, BlockNumber(entry.child_block), node.depth - 1)?;
                walk_node(dev, &child, visit)?;
            }
        }
    }
    Ok(())
}

/// Every block occupied by a non-root tree node, in descent order.
pub fn node_blocks(dev: &dyn BlockDevice, root: &RootWindow) -> Result<Vec<BlockNumber>> {
    let mut blocks = Vec::new();
    let node = parse_root(root)?;
    collect_node_blocks(dev, &node, &mut blocks)?;
    Ok(blocks)
}

fn collect_node_blocks(
    dev: &dyn BlockDevice,
    node: &ExtentNode,
    out: &mut Vec<BlockNumber>,
) -> Result<()> {
    if let ExtentEntries::Indexes(idx) = &node.entries {
        for entry in idx {
            let block = BlockNumber(entry.child_block);
            out.push(block);
            let child = read_node(dev, block, node.depth - 1)?;
            collect_node_blocks(dev, &child, out)?;
        }
    }
    Ok(())
}

// ── Rightmost insertion ─────────────────────────────────────────────────────

struct SpineLevel {
    /// `None` for the inline root.
    block: Option<BlockNumber>,
    node: ExtentNode,
}

/// The rightmost root-to-leaf path.
fn load_rightmost_spine(dev: &dyn BlockDevice, root: &RootWindow) -> Result<Vec<SpineLevel>> {
    let mut spine = vec![SpineLevel {
        block: None,
        node: parse_root(root)?,
    }];
    loop {
        let current = &spine[spine.len() - 1].node;
        if current.depth == 0 {
            return Ok(spine);
        }
        let idx = indexes(current)?;
        let Some(last) = idx.last() else {
            return Err(EfsError::Corrupt {
                block: spine[spine.len() - 1].block.map_or(0, |b| b.0),
                detail: "interior extent node with no children".into(),
            });
        };
        let child_block = BlockNumber(last.child_block);
        let node = read_node(dev, child_block, current.depth - 1)?;
        spine.push(SpineLevel {
            block: Some(child_block),
            node,
        });
    }
}

fn push_entry(node: &mut ExtentNode, entry: Entry) {
    match (&mut node.entries, entry) {
        (ExtentEntries::Leaves(v), Entry::Leaf(leaf)) => v.push(leaf),
        (ExtentEntries::Indexes(v), Entry::Index(index)) => v.push(index),
        _ => unreachable!("entry kind always matches node depth on the spine"),
    }
}

#[derive(Debug, Clone, Copy)]
enum Entry {
    Leaf(ExtentLeaf),
    Index(ExtentIndex),
}

fn write_spine_level(
    dev: &mut dyn BlockDevice,
    root: &mut RootWindow,
    level: &SpineLevel,
) -> Result<()> {
    match level.block {
        Some(block) => write_node(dev, block, &level.node),
        None => store_root(root, &level.node),
    }
}

/// Insert a leaf whose logical key is at or beyond the current coverage end,
/// splitting full spine nodes and promoting the root as needed.
fn insert_rightmost(
    dev: &mut dyn BlockDevice,
    geo: &FsGeometry,
    groups: &mut [GroupStats],
    hint: GroupNumber,
    root: &mut RootWindow,
    leaf: ExtentLeaf,
) -> Result<()> {
    let mut spine = load_rightmost_spine(dev, root)?;
    let block_cap = block_node_capacity(geo.block_size);
    let mut carry = Entry::Leaf(leaf);

    while let Some(mut level) = spine.pop() {
        if !level.node.is_full() {
            push_entry(&mut level.node, carry);
            write_spine_level(dev, root, &level)?;
            // Ancestors are untouched: their rightmost keys still cover the
            // subtree, and index keys are subtree minima.
            return Ok(());
        }

        if level.block.is_some() {
            // Full interior or leaf block: split off a right sibling.
            let sibling_block = efs_alloc::alloc_block(dev, geo, groups, hint)?;
            let keep = level.node.entries.len().div_ceil(2);
            let mut sibling = ExtentNode {
                max_entries: block_cap,
                depth: level.node.depth,
                entries: match &mut level.node.entries {
                    ExtentEntries::Leaves(v) => ExtentEntries::Leaves(v.split_off(keep)),
                    ExtentEntries::Indexes(v) => ExtentEntries::Indexes(v.split_off(keep)),
                },
            };
            push_entry(&mut sibling, carry);
            let sibling_first = sibling.first_logical().ok_or_else(|| EfsError::Corrupt {
                block: sibling_block.0,
                detail: "split produced an empty sibling".into(),
            })?;

            write_node(dev, sibling_block, &sibling)?;
            write_spine_level(dev, root, &level)?;
            debug!(
                target: "efs::extent",
                depth = level.node.depth,
                sibling = sibling_block.0,
                "node split"
            );

            carry = Entry::Index(ExtentIndex {
                logical_block: sibling_first,
                child_block: sibling_block.0,
            });
            continue;
        }

        // Full inline root: promote. Two children take the root's three
        // entries plus the carried entry, and the root gains a level.
        let left_block = efs_alloc::alloc_block(dev, geo, groups, hint)?;
        let right_block = efs_alloc::alloc_block(dev, geo, groups, hint)?;
        let keep = level.node.entries.len().div_ceil(2);

        let mut right = ExtentNode {
            max_entries: block_cap,
            depth: level.node.depth,
            entries: match &mut level.node.entries {
                ExtentEntries::Leaves(v) => ExtentEntries::Leaves(v.split_off(keep)),
                ExtentEntries::Indexes(v) => ExtentEntries::Indexes(v.split_off(keep)),
            },
        };
        push_entry(&mut right, carry);
        let left = ExtentNode {
            max_entries: block_cap,
            depth: level.node.depth,
            entries: level.node.entries,
        };

        let left_first = left.first_logical().ok_or_else(|| EfsError::Corrupt {
            block: left_block.0,
            detail: "promotion produced an empty left child".into(),
        })?;
        let right_first = right.first_logical().ok_or_else(|| EfsError::Corrupt {
            block: right_block.0,
            detail: "promotion produced an empty right child".into(),
        })?;

        write_node(dev, left_block, &left)?;
        write_node(dev, right_block, &right)?;

        let promoted = ExtentNode {
            max_entries: EXTENT_ROOT_MAX_ENTRIES,
            depth: level.node.depth + 1,
            entries: ExtentEntries::Indexes(vec![
                ExtentIndex {
                    logical_block: left_first,
                    child_block: left_block.0,
                },
                ExtentIndex {
                    logical_block: right_first,
                    child_block: right_block.0,
                },
            ]),
        };
        store_root(root, &promoted)?;
        debug!(
            target: "efs::extent",
            new_depth = promoted.depth,
            left = left_block.0,
            right = right_block.0,
            "root promoted"
        );
        return Ok(());
    }

    unreachable!("spine always contains the root")
}

// ── Append ──────────────────────────────────────────────────────────────────

/// Allocate one physical block for logical block `logical` and record it in
/// the tree. `logical` must equal the current end of coverage; the tree
/// extends the rightmost leaf instead of adding an entry when the new block
/// is physically adjacent.
pub fn append_block(
    dev: &mut dyn BlockDevice,
    geo: &FsGeometry,
    groups: &mut [GroupStats],
    hint: GroupNumber,
    root: &mut RootWindow,
    logical: u32,
) -> Result<BlockNumber> {
    let end = coverage_end(dev, root)?;
    if logical != end {
        return Err(EfsError::InvalidArgument(
            "extent append must start at the end of coverage",
        ));
    }

    let physical = efs_alloc::alloc_block(dev, geo, groups, hint)?;

    // Coalesce with the rightmost leaf when physically contiguous.
    let mut spine = load_rightmost_spine(dev, root)?;
    let deepest = spine.len() - 1;
    let mut coalesced = false;
    if let ExtentEntries::Leaves(lv) = &mut spine[deepest].node.entries {
        if let Some(last) = lv.last_mut() {
            if last.logical_end() == logical
                && last.start_block() + u64::from(last.block_count) == physical.0
                && last.block_count < u16::MAX
            {
                *last =
                    ExtentLeaf::new(last.logical_block, last.block_count + 1, last.start_block());
                coalesced = true;
            }
        }
    }
    if coalesced {
        write_spine_level(dev, root, &spine[deepest])?;
        return Ok(physical);
    }

    insert_rightmost(
        dev,
        geo,
        groups,
        hint,
        root,
        ExtentLeaf::new(logical, 1, physical.0),
    )?;
    Ok(physical)
}

// ── Truncate ────────────────────────────────────────────────────────────────

/// Discard all coverage at or beyond `new_end` logical blocks, freeing the
/// physical runs and every tree node, then rebuild the tree from the
/// surviving leaves. Returns the number of data blocks freed.
pub fn truncate_to(
    dev: &mut dyn BlockDevice,
    geo: &FsGeometry,
    groups: &mut [GroupStats],
    hint: GroupNumber,
    root: &mut RootWindow,
    new_end: u32,
) -> Result<u64> {
    if coverage_end(dev, root)? <= new_end {
        return Ok(0);
    }

    let mut all = Vec::new();
    walk(dev, root, &mut |leaf| {
        all.push(*leaf);
        Ok(())
    })?;
    let old_nodes = node_blocks(dev, root)?;

    let mut survivors = Vec::new();
    let mut freed = 0_u64;
    for leaf in all {
        if leaf.logical_block >= new_end {
            for i in 0..u64::from(leaf.block_count) {
                efs_alloc::free_block(dev, geo, groups, BlockNumber(leaf.start_block() + i))?;
            }
            freed += u64::from(leaf.block_count);
        } else if leaf.logical_end() > new_end {
            let keep = new_end - leaf.logical_block;
            for i in u64::from(keep)..u64::from(leaf.block_count) {
                efs_alloc::free_block(dev, geo, groups, BlockNumber(leaf.start_block() + i))?;
            }
            freed += u64::from(leaf.block_count) - u64::from(keep);
            #[allow(clippy::cast_possible_truncation)]
            survivors.push(ExtentLeaf::new(
                leaf.logical_block,
                keep as u16,
                leaf.start_block(),
            ));
        } else {
            survivors.push(leaf);
        }
    }

    for block in old_nodes {
        efs_alloc::free_block(dev, geo, groups, block)?;
    }

    // Rebuild from the survivors. Re-insertion needs at most as many node
    // blocks as were just freed, so it cannot hit NoSpace here.
    let empty = ExtentNode::empty_leaf(EXTENT_ROOT_MAX_ENTRIES);
    store_root(root, &empty)?;
    for leaf in survivors {
        insert_rightmost(dev, geo, groups, hint, root, leaf)?;
    }

    debug!(target: "efs::extent", new_end, freed, "truncate");
    Ok(freed)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use efs_alloc::bitmap_set;
    use efs_block::MemBlockDevice;
    use world::*;

    /// Small single-group world: block 0 superblock, bitmap at 1, inode
    /// bitmap at 2, inode table 3..=46, data from 47.
    mod world {
        use super::*;

        pub const META_END: u32 = 47;

        pub fn make_geometry() -> FsGeometry {
            FsGeometry {
                block_size: 4096,
                blocks_per_group: 8191,
                inodes_per_group: 2048,
                fs_size_blocks: 8192,
                total_inodes: 2048,
                first_data_block: 1,
                group_count: 1,
            }
        }

        pub fn make_world() -> (MemBlockDevice, FsGeometry, Vec<GroupStats>) {
            let geo = make_geometry();
            let mut dev = MemBlockDevice::new(4096, geo.fs_size_blocks);
            let mut bitmap = vec![0_u8; 4096];
            for bit in 0..META_END - 1 {
                bitmap_set(&mut bitmap, bit);
            }
            dev.write_block(BlockNumber(1), &bitmap).unwrap();
            let groups = vec![GroupStats {
                group: GroupNumber(0),
                free_blocks: geo.blocks_per_group - (META_END - 1),
                free_inodes: geo.inodes_per_group,
                block_bitmap_block: BlockNumber(1),
                inode_bitmap_block: BlockNumber(2),
                inode_table_block: BlockNumber(3),
            }];
            (dev, geo, groups)
        }

        pub fn empty_root() -> RootWindow {
            let mut window = [0_u8; EXTENT_ROOT_SIZE];
            ExtentNode::empty_leaf(EXTENT_ROOT_MAX_ENTRIES)
                .pack_into(&mut window)
                .unwrap();
            window
        }

        /// Burn one block so the next data allocation is not contiguous.
        pub fn burn_block(
            dev: &mut MemBlockDevice,
            geo: &FsGeometry,
            groups: &mut [GroupStats],
        ) -> BlockNumber {
            efs_alloc::alloc_block(dev, geo, groups, GroupNumber(0)).unwrap()
        }
    }

    #[test]
    fn empty_tree_has_no_coverage() {
        let (dev, _geo, _groups) = make_world();
        let root = empty_root();
        assert_eq!(coverage_end(&dev, &root).unwrap(), 0);
        assert_eq!(search(&dev, &root, 0).unwrap(), None);
    }

    #[test]
    fn append_and_search_single_block() {
        let (mut dev, geo, mut groups) = make_world();
        let mut root = empty_root();

        let phys = append_block(&mut dev, &geo, &mut groups, GroupNumber(0), &mut root, 0).unwrap();
        assert_eq!(coverage_end(&dev, &root).unwrap(), 1);
        assert_eq!(search(&dev, &root, 0).unwrap(), Some((phys.0, 1)));
        assert_eq!(search(&dev, &root, 1).unwrap(), None);
    }

    #[test]
    fn contiguous_appends_coalesce_into_one_leaf() {
        let (mut dev, geo, mut groups) = make_world();
        let mut root = empty_root();

        let first =
            append_block(&mut dev, &geo, &mut groups, GroupNumber(0), &mut root, 0).unwrap();
        for logical in 1..10 {
            append_block(
                &mut dev,
                &geo,
                &mut groups,
                GroupNumber(0),
                &mut root,
                logical,
            )
            .unwrap();
        }

        let mut leaf_count = 0;
        walk(&dev, &root, &mut |leaf| {
            leaf_count += 1;
            assert_eq!(leaf.logical_block, 0);
            assert_eq!(leaf.block_count, 10);
            assert_eq!(leaf.start_block(), first.0);
            Ok(())
        })
        .unwrap();
        assert_eq!(leaf_count, 1);
        assert_eq!(search(&dev, &root, 7).unwrap(), Some((first.0 + 7, 3)));
    }

    #[test]
    fn append_rejects_non_end_logical() {
        let (mut dev, geo, mut groups) = make_world();
        let mut root = empty_root();
        append_block(&mut dev, &geo, &mut groups, GroupNumber(0), &mut root, 0).unwrap();
        assert!(matches!(
            append_block(&mut dev, &geo, &mut groups, GroupNumber(0), &mut root, 5),
            Err(EfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn fragmented_appends_promote_root() {
        let (mut dev, geo, mut groups) = make_world();
        let mut root = empty_root();

        // Burn a block between appends so leaves never coalesce.
        for logical in 0..5 {
            append_block(
                &mut dev,
                &geo,
                &mut groups,
                GroupNumber(0),
                &mut root,
                logical,
            )
            .unwrap();
            burn_block(&mut dev, &geo, &mut groups);
        }

        let node = ExtentNode::unpack(&root).unwrap();
        assert_eq!(node.depth, 1, "root should have promoted past 3 leaves");

        for logical in 0..5 {
            let hit = search(&dev, &root, logical).unwrap();
            assert!(hit.is_some(), "logical {logical} must resolve");
        }
        assert_eq!(search(&dev, &root, 5).unwrap(), None);
    }

    #[test]
    fn heavy_fragmentation_grows_to_depth_two() {
        let (mut dev, geo, mut groups) = make_world();
        let mut root = empty_root();

        let mut phys_of = Vec::new();
        for logical in 0..700 {
            let phys = append_block(
                &mut dev,
                &geo,
                &mut groups,
                GroupNumber(0),
                &mut root,
                logical,
            )
            .unwrap();
            phys_of.push(phys.0);
            burn_block(&mut dev, &geo, &mut groups);
        }

        let node = ExtentNode::unpack(&root).unwrap();
        assert_eq!(node.depth, 2);

        for (logical, &phys) in phys_of.iter().enumerate() {
            let hit = search(&dev, &root, u32::try_from(logical).unwrap()).unwrap();
            assert_eq!(hit, Some((phys, 1)));
        }

        // Leaves stay sorted, unique, and non-overlapping.
        let mut prev_end = 0_u32;
        walk(&dev, &root, &mut |leaf| {
            assert!(leaf.logical_block >= prev_end);
            prev_end = leaf.logical_end();
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn truncate_frees_tail_and_is_idempotent() {
        let (mut dev, geo, mut groups) = make_world();
        let mut root = empty_root();
        for logical in 0..10 {
            append_block(
                &mut dev,
                &geo,
                &mut groups,
                GroupNumber(0),
                &mut root,
                logical,
            )
            .unwrap();
        }
        let free_before = groups[0].free_blocks;

        let freed = truncate_to(&mut dev, &geo, &mut groups, GroupNumber(0), &mut root, 4).unwrap();
        assert_eq!(freed, 6);
        assert_eq!(groups[0].free_blocks, free_before + 6);
        assert_eq!(coverage_end(&dev, &root).unwrap(), 4);
        assert!(search(&dev, &root, 3).unwrap().is_some());
        assert_eq!(search(&dev, &root, 4).unwrap(), None);

        let freed = truncate_to(&mut dev, &geo, &mut groups, GroupNumber(0), &mut root, 4).unwrap();
        assert_eq!(freed, 0);
        assert_eq!(groups[0].free_blocks, free_before + 6);
    }

    #[test]
    fn truncate_to_zero_restores_all_blocks() {
        let (mut dev, geo, mut groups) = make_world();
        let initial_free = groups[0].free_blocks;
        let mut root = empty_root();

        for logical in 0..50 {
            append_block(
                &mut dev,
                &geo,
                &mut groups,
                GroupNumber(0),
                &mut root,
                logical,
            )
            .unwrap();
            if logical % 2 == 0 {
                burn_block(&mut dev, &geo, &mut groups);
            }
        }
        let burned = 25;

        truncate_to(&mut dev, &geo, &mut groups, GroupNumber(0), &mut root, 0).unwrap();
        assert_eq!(groups[0].free_blocks, initial_free - burned);
        assert_eq!(coverage_end(&dev, &root).unwrap(), 0);
        let node = ExtentNode::unpack(&root).unwrap();
        assert_eq!(node.depth, 0);
        assert!(node.entries.is_empty());
    }

    #[test]
    fn truncate_collapses_promoted_root_back_inline() {
        let (mut dev, geo, mut groups) = make_world();
        let mut root = empty_root();
        for logical in 0..8 {
            append_block(
                &mut dev,
                &geo,
                &mut groups,
                GroupNumber(0),
                &mut root,
                logical,
            )
            .unwrap();
            burn_block(&mut dev, &geo, &mut groups);
        }
        assert_eq!(ExtentNode::unpack(&root).unwrap().depth, 1);

        truncate_to(&mut dev, &geo, &mut groups, GroupNumber(0), &mut root, 2).unwrap();
        let node = ExtentNode::unpack(&root).unwrap();
        assert_eq!(node.depth, 0, "two leaves fit the inline root again");
        assert_eq!(coverage_end(&dev, &root).unwrap(), 2);
        assert!(node_blocks(&dev, &root).unwrap().is_empty());
    }

    #[test]
    fn truncate_splits_straddling_leaf() {
        let (mut dev, geo, mut groups) = make_world();
        let mut root = empty_root();
        for logical in 0..10 {
            append_block(
                &mut dev,
                &geo,
                &mut groups,
                GroupNumber(0),
                &mut root,
                logical,
            )
            .unwrap();
        }
        // One coalesced leaf of 10; cut it at 7.
        let freed = truncate_to(&mut dev, &geo, &mut groups, GroupNumber(0), &mut root, 7).unwrap();
        assert_eq!(freed, 3);
        let mut seen = Vec::new();
        walk(&dev, &root, &mut |leaf| {
            seen.push((leaf.logical_block, leaf.block_count));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![(0, 7)]);
    }
}
