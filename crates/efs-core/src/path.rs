//! Path resolution.
//!
//! Walks path components through the directory layer, dereferencing
//! symbolic links with a depth counter (`MAX_SYMLINK_DEPTH`). `.` and `..`
//! resolve through the on-disk entries every directory carries; `..` at the
//! root maps back to the root. The final component follows symlinks only
//! when the caller asks (`stat` vs `lstat`).

use crate::FileSystem;
use efs_error::{EfsError, Result};
use efs_ondisk::Inode;
use efs_types::{InodeNumber, MAX_SYMLINK_DEPTH, ROOT_INO};

impl FileSystem {
    // ── Public entry points ─────────────────────────────────────────────

    /// Resolve a path to an inode number.
    pub(crate) fn resolve(&self, path: &str, follow_last: bool) -> Result<InodeNumber> {
        if path.is_empty() {
            return Err(EfsError::NotFound(String::new()));
        }
        let mut depth = 0;
        self.walk_from(self.cwd, path, follow_last, &mut depth)
    }

    /// Resolve the parent directory of `path` and return it together with
    /// the final component. Creation and removal targets must have a plain
    /// name as their final component.
    pub(crate) fn resolve_parent(&self, path: &str) -> Result<(InodeNumber, String)> {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(EfsError::InvalidArgument(
                "path has no final component",
            ));
        }
        let (dir_part, name) = match trimmed.rfind('/') {
            Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
            None => ("", trimmed),
        };
        if name.is_empty() || name == "." || name == ".." {
            return Err(EfsError::InvalidArgument(
                "path has no usable final component",
            ));
        }

        let mut depth = 0;
        let parent = if dir_part.is_empty() {
            if path.starts_with('/') {
                ROOT_INO
            } else {
                self.cwd
            }
        } else {
            self.walk_from(self.cwd, dir_part, true, &mut depth)?
        };

        if !self.read_inode(parent)?.is_dir() {
            return Err(EfsError::NotDirectory(dir_part.to_owned()));
        }
        Ok((parent, name.to_owned()))
    }

    /// The target string of a symlink inode.
    pub(crate) fn read_link_target(&self, inode: &Inode) -> Result<String> {
        if !inode.is_symlink() {
            return Err(EfsError::InvalidArgument("not a symbolic link"));
        }
        let len = usize::try_from(inode.size)
            .map_err(|_| EfsError::InvalidArgument("symlink target too long"))?;
        let bytes = if inode.is_fast_symlink() {
            inode.extent_root[..len].to_vec()
        } else {
            self.read_file_at(inode, 0, len)?
        };
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    // ── Walker ──────────────────────────────────────────────────────────

    fn walk_from(
        &self,
        base: InodeNumber,
        path: &str,
        follow_last: bool,
        depth: &mut u32,
    ) -> Result<InodeNumber> {
        let mut current = if path.starts_with('/') { ROOT_INO } else { base };
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();

        for (i, component) in components.iter().enumerate() {
            let last = i == components.len() - 1;
            let dir_inode = self.read_inode(current)?;
            if !dir_inode.is_dir() {
                return Err(EfsError::NotDirectory(path.to_owned()));
            }

            let child = efs_dir::lookup(self.dev.as_ref(), &dir_inode, component.as_bytes())?
                .ok_or_else(|| EfsError::NotFound(path.to_owned()))?;
            let child_inode = self.read_inode(child)?;

            if child_inode.is_symlink() && (!last || follow_last) {
                *depth += 1;
                if *depth > MAX_SYMLINK_DEPTH {
                    return Err(EfsError::SymlinkLoop(path.to_owned()));
                }
                let target = self.read_link_target(&child_inode)?;
                // Relative targets resolve from the symlink's directory.
                current = self.walk_from(current, &target, true, depth)?;
            } else {
                current = child;
            }
        }
        Ok(current)
    }

    // ── Textual cwd tracking ────────────────────────────────────────────

    /// The absolute path string the working directory would have after
    /// `chdir(path)`, computed textually (`.` dropped, `..` popping, root's
    /// `..` staying at root).
    pub(crate) fn joined_cwd_path(&self, path: &str) -> String {
        let mut parts: Vec<String> = if path.starts_with('/') {
            Vec::new()
        } else {
            self.cwd_path
                .split('/')
                .filter(|c| !c.is_empty())
                .map(str::to_owned)
                .collect()
        };
        for component in path.split('/').filter(|c| !c.is_empty()) {
            match component {
                "." => {}
                ".." => {
                    parts.pop();
                }
                other => parts.push(other.to_owned()),
            }
        }
        if parts.is_empty() {
            "/".to_owned()
        } else {
            format!("/{}", parts.join("/"))
        }
    }
}
