//! Byte-granular file I/O over the extent tree.
//!
//! Reads clamp to the file size and walk physical runs. Writes overlay
//! existing blocks in place and allocate through the extent tree for the
//! tail; any gap between the old size and the write offset is materialized
//! as explicit zeros, so stale block contents never become visible. There
//! are no holes.

use crate::FileSystem;
use efs_error::{EfsError, Result};
use efs_ondisk::Inode;
use efs_types::{BlockNumber, InodeNumber};

impl FileSystem {
    // ── Read ────────────────────────────────────────────────────────────

    /// Read up to `len` bytes at `offset`, clamped to the file size.
    pub(crate) fn read_file_at(&self, inode: &Inode, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset >= inode.size {
            return Ok(Vec::new());
        }
        let len = u64::try_from(len)
            .map(|l| l.min(inode.size - offset))
            .unwrap_or(inode.size - offset);
        let block_size = u64::from(self.sb.block_size);

        let mut out = Vec::with_capacity(usize::try_from(len).unwrap_or(0));
        let mut pos = offset;
        let end = offset + len;
        while pos < end {
            let logical = u32::try_from(pos / block_size)
                .map_err(|_| EfsError::InvalidArgument("offset beyond addressable blocks"))?;
            #[allow(clippy::cast_possible_truncation)]
            let within = (pos % block_size) as usize;
            #[allow(clippy::cast_possible_truncation)]
            let chunk = ((block_size - within as u64).min(end - pos)) as usize;

            let Some((physical, _run)) = efs_extent::search(
                self.dev.as_ref(),
                &inode.extent_root,
                logical,
            )?
            else {
                return Err(EfsError::Corrupt {
                    block: 0,
                    detail: format!("logical block {logical} inside file size has no extent"),
                });
            };
            let data = self.dev.read_block(BlockNumber(physical))?;
            out.extend_from_slice(&data[within..within + chunk]);
            pos += chunk as u64;
        }
        Ok(out)
    }

    // ── Write ───────────────────────────────────────────────────────────

    /// Write `data` at `offset`, overlaying existing blocks and extending
    /// the file as needed. Updates `size`, `mtime`, and `ctime`; the caller
    /// persists the inode.
    pub(crate) fn write_file_at(
        &mut self,
        ino: InodeNumber,
        inode: &mut Inode,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(EfsError::InvalidArgument("write range overflows u64"))?;
        let block_size = u64::from(self.sb.block_size);
        if end.div_ceil(block_size) > u64::from(u32::MAX) {
            return Err(EfsError::InvalidArgument("file exceeds addressable blocks"));
        }

        let old_size = inode.size;
        let old_coverage_blocks =
            efs_extent::coverage_end(self.dev.as_ref(), &inode.extent_root)?;
        let old_coverage = u64::from(old_coverage_blocks) * block_size;

        if let Err(err) = self.ensure_coverage(ino, inode, end, Some((offset, end))) {
            // Return any blocks grabbed before the failure so the size and
            // the free counts both stay at the last successful state.
            self.rollback_coverage(ino, inode, old_coverage_blocks);
            return Err(err);
        }

        // Zero-fill the gap between the old size and the write offset where
        // it falls inside previously allocated blocks (fresh blocks come
        // back zeroed from ensure_coverage).
        if offset > old_size {
            let gap_end = offset.min(old_coverage);
            if gap_end > old_size {
                self.zero_range(inode, old_size, gap_end)?;
            }
        }

        self.overlay(inode, offset, data)?;

        let now = self.now();
        inode.size = inode.size.max(end);
        inode.mtime = now;
        inode.ctime = now;
        Ok(data.len())
    }

    // ── Truncate ────────────────────────────────────────────────────────

    /// Shrink or grow the file to `new_size`. Shrinking frees excess
    /// extents; growing materializes zeros.
    pub(crate) fn truncate_file(
        &mut self,
        ino: InodeNumber,
        inode: &mut Inode,
        new_size: u64,
    ) -> Result<()> {
        let block_size = u64::from(self.sb.block_size);
        let old_size = inode.size;

        if new_size < old_size {
            let keep = u32::try_from(new_size.div_ceil(block_size))
                .map_err(|_| EfsError::InvalidArgument("size beyond addressable blocks"))?;
            let hint = self.hint_for(ino);
            efs_extent::truncate_to(
                self.dev.as_mut(),
                &self.geo,
                &mut self.groups,
                hint,
                &mut inode.extent_root,
                keep,
            )?;
            inode.size = new_size;
        } else if new_size > old_size {
            let old_coverage_blocks =
                efs_extent::coverage_end(self.dev.as_ref(), &inode.extent_root)?;
            let old_coverage = u64::from(old_coverage_blocks) * block_size;
            if let Err(err) = self.ensure_coverage(ino, inode, new_size, None) {
                self.rollback_coverage(ino, inode, old_coverage_blocks);
                return Err(err);
            }
            let gap_end = new_size.min(old_coverage);
            if gap_end > old_size {
                self.zero_range(inode, old_size, gap_end)?;
            }
            inode.size = new_size;
        }

        let now = self.now();
        inode.mtime = now;
        inode.ctime = now;
        Ok(())
    }

    /// Release every data block and tree node of an inode being deleted.
    pub(crate) fn free_file_contents(&mut self, ino: InodeNumber, inode: &mut Inode) -> Result<()> {
        if inode.is_fast_symlink() {
            return Ok(());
        }
        let hint = self.hint_for(ino);
        efs_extent::truncate_to(
            self.dev.as_mut(),
            &self.geo,
            &mut self.groups,
            hint,
            &mut inode.extent_root,
            0,
        )?;
        Ok(())
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    /// Extend the extent tree so it covers `end_bytes`. Fresh blocks that
    /// the caller's data span `[from, to)` will not fully overwrite are
    /// zeroed on allocation.
    fn ensure_coverage(
        &mut self,
        ino: InodeNumber,
        inode: &mut Inode,
        end_bytes: u64,
        data_span: Option<(u64, u64)>,
    ) -> Result<()> {
        let block_size = u64::from(self.sb.block_size);
        let needed = end_bytes.div_ceil(block_size);
        let current = u64::from(efs_extent::coverage_end(
            self.dev.as_ref(),
            &inode.extent_root,
        )?);
        if needed <= current {
            return Ok(());
        }

        let hint = self.hint_for(ino);
        let zero_block = vec![0_u8; self.sb.block_size as usize];
        for logical in current..needed {
            let physical = efs_extent::append_block(
                self.dev.as_mut(),
                &self.geo,
                &mut self.groups,
                hint,
                &mut inode.extent_root,
                u32::try_from(logical)
                    .map_err(|_| EfsError::InvalidArgument("file exceeds addressable blocks"))?,
            )?;

            let block_start = logical * block_size;
            let block_end = block_start + block_size;
            let fully_overwritten = data_span
                .is_some_and(|(from, to)| from <= block_start && to >= block_end);
            if !fully_overwritten {
                self.dev.write_block(physical, &zero_block)?;
            }
        }
        Ok(())
    }

    /// Best-effort release of blocks appended by a failed extension.
    fn rollback_coverage(&mut self, ino: InodeNumber, inode: &mut Inode, keep_blocks: u32) {
        let hint = self.hint_for(ino);
        let _ = efs_extent::truncate_to(
            self.dev.as_mut(),
            &self.geo,
            &mut self.groups,
            hint,
            &mut inode.extent_root,
            keep_blocks,
        );
    }

    /// Write zeros across `[from, to)`, which must lie within the tree's
    /// current coverage.
    fn zero_range(&mut self, inode: &Inode, from: u64, to: u64) -> Result<()> {
        let block_size = u64::from(self.sb.block_size);
        let mut pos = from;
        while pos < to {
            let logical = u32::try_from(pos / block_size)
                .map_err(|_| EfsError::InvalidArgument("offset beyond addressable blocks"))?;
            #[allow(clippy::cast_possible_truncation)]
            let within = (pos % block_size) as usize;
            #[allow(clippy::cast_possible_truncation)]
            let chunk = ((block_size - within as u64).min(to - pos)) as usize;

            let Some((physical, _run)) = efs_extent::search(
                self.dev.as_ref(),
                &inode.extent_root,
                logical,
            )?
            else {
                return Err(EfsError::Corrupt {
                    block: 0,
                    detail: format!("zero-fill target block {logical} has no extent"),
                });
            };
            let block = BlockNumber(physical);
            let mut data = self.dev.read_block(block)?;
            data[within..within + chunk].fill(0);
            self.dev.write_block(block, &data)?;
            pos += chunk as u64;
        }
        Ok(())
    }

    /// Copy `data` over the (already covered) range starting at `offset`.
    fn overlay(&mut self, inode: &Inode, offset: u64, data: &[u8]) -> Result<()> {
        let block_size = u64::from(self.sb.block_size);
        let mut written = 0_usize;
        while written < data.len() {
            let pos = offset + written as u64;
            let logical = u32::try_from(pos / block_size)
                .map_err(|_| EfsError::InvalidArgument("offset beyond addressable blocks"))?;
            #[allow(clippy::cast_possible_truncation)]
            let within = (pos % block_size) as usize;
            #[allow(clippy::cast_possible_truncation)]
            let chunk = ((block_size - within as u64).min((data.len() - written) as u64)) as usize;

            let Some((physical, _run)) = efs_extent::search(
                self.dev.as_ref(),
                &inode.extent_root,
                logical,
            )?
            else {
                return Err(EfsError::Corrupt {
                    block: 0,
                    detail: format!("write target block {logical} has no extent"),
                });
            };
            let block = BlockNumber(physical);
            if chunk == block_size as usize {
                self.dev
                    .write_block(block, &data[written..written + chunk])?;
            } else {
                let mut buf = self.dev.read_block(block)?;
                buf[within..within + chunk].copy_from_slice(&data[written..written + chunk]);
                self.dev.write_block(block, &buf)?;
            }
            written += chunk;
        }
        Ok(())
    }
}
