//! Host API: open/read/write/close, namespace operations, and metadata.
//!
//! Every mutating call ends with `commit()`, which persists descriptor and
//! superblock counts and flushes the device. Deletion is deferred while an
//! unlinked inode is still held by open descriptors and happens on the last
//! `close`.

use crate::fd::OpenFile;
use crate::{DirEntryInfo, FileSystem};
use efs_error::{EfsError, Result};
use efs_ondisk::Inode;
use efs_types::{
    FAST_SYMLINK_MAX, FT_DIRECTORY, FT_REGULAR, FT_SYMLINK, InodeNumber, O_ACCMODE, O_APPEND,
    O_CREAT, O_RDONLY, O_TRUNC, O_WRONLY, ROOT_INO, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG,
};
use serde::Serialize;
use tracing::debug;

/// What an inode is, as reported by `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

/// Metadata snapshot returned by `stat` / `lstat`.
#[derive(Debug, Clone, Serialize)]
pub struct FileStat {
    pub ino: u32,
    pub kind: FileKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub links_count: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
}

fn kind_of(inode: &Inode) -> Result<FileKind> {
    match inode.mode & S_IFMT {
        S_IFREG => Ok(FileKind::Regular),
        S_IFDIR => Ok(FileKind::Directory),
        S_IFLNK => Ok(FileKind::Symlink),
        _ => Err(EfsError::Corrupt {
            block: 0,
            detail: format!("inode mode {:#o} has an unknown file type", inode.mode),
        }),
    }
}

fn file_type_byte(inode: &Inode) -> u8 {
    if inode.is_dir() {
        FT_DIRECTORY
    } else if inode.is_symlink() {
        FT_SYMLINK
    } else {
        FT_REGULAR
    }
}

impl FileSystem {
    // ── Open / close ────────────────────────────────────────────────────

    /// Open a file, creating it when `O_CREAT` is set and the final
    /// component is absent, truncating when `O_TRUNC` is set.
    pub fn openf(&mut self, path: &str, flags: u32, mode: u32) -> Result<u32> {
        if flags & O_ACCMODE == O_ACCMODE {
            return Err(EfsError::InvalidArgument("invalid access mode"));
        }

        let ino = match self.resolve(path, true) {
            Ok(ino) => {
                let mut inode = self.read_inode(ino)?;
                if inode.is_dir() && flags & O_ACCMODE != O_RDONLY {
                    return Err(EfsError::IsDirectory(path.to_owned()));
                }
                if flags & O_TRUNC != 0 && flags & O_ACCMODE != O_RDONLY && inode.is_regular() {
                    self.truncate_file(ino, &mut inode, 0)?;
                    self.write_inode(ino, &inode)?;
                    self.commit()?;
                }
                ino
            }
            Err(EfsError::NotFound(_)) if flags & O_CREAT != 0 => {
                let (parent, name) = self.resolve_parent(path)?;
                let ino = self.create_child(
                    parent,
                    &name,
                    S_IFREG | (mode & 0o7777),
                    FT_REGULAR,
                    1,
                )?;
                self.commit()?;
                ino
            }
            Err(err) => return Err(err),
        };

        let fd = self.fds.insert(OpenFile {
            ino,
            flags,
            pos: 0,
        });
        debug!(target: "efs::ops", fd, ino = ino.0, "openf");
        Ok(fd)
    }

    /// Close a descriptor. The last close of an unlinked inode frees its
    /// data and inode record.
    pub fn close(&mut self, fd: u32) -> Result<()> {
        let open = self.fds.remove(fd)?;
        let mut inode = self.read_inode(open.ino)?;
        // `mode == 0` means the record was already freed through another
        // path while this descriptor was open.
        if inode.links_count == 0 && inode.mode != 0 && self.fds.open_count(open.ino) == 0 {
            self.delete_inode(open.ino, &mut inode)?;
            self.commit()?;
        }
        Ok(())
    }

    // ── Read / write / truncate ─────────────────────────────────────────

    /// Read up to `len` bytes. With `offset = None` the descriptor position
    /// is used and advanced; an explicit offset leaves it untouched.
    pub fn read(&mut self, fd: u32, len: usize, offset: Option<u64>) -> Result<Vec<u8>> {
        let open = self.fds.get(fd)?.clone();
        if open.flags & O_ACCMODE == O_WRONLY {
            return Err(EfsError::InvalidArgument("descriptor not open for reading"));
        }
        let inode = self.read_inode(open.ino)?;
        if inode.is_dir() {
            return Err(EfsError::IsDirectory(format!("fd {fd}")));
        }
        let pos = offset.unwrap_or(open.pos);
        let data = self.read_file_at(&inode, pos, len)?;
        if offset.is_none() {
            self.fds.get_mut(fd)?.pos = pos + data.len() as u64;
        }
        Ok(data)
    }

    /// Write `data`. With `offset = None` the descriptor position is used
    /// and advanced (or the end of file under `O_APPEND`).
    pub fn write(&mut self, fd: u32, data: &[u8], offset: Option<u64>) -> Result<usize> {
        let open = self.fds.get(fd)?.clone();
        if open.flags & O_ACCMODE == O_RDONLY {
            return Err(EfsError::InvalidArgument("descriptor not open for writing"));
        }
        let mut inode = self.read_inode(open.ino)?;
        if inode.is_dir() {
            return Err(EfsError::IsDirectory(format!("fd {fd}")));
        }

        let pos = offset.unwrap_or(if open.flags & O_APPEND != 0 {
            inode.size
        } else {
            open.pos
        });
        let written = match self.write_file_at(open.ino, &mut inode, pos, data) {
            Ok(n) => n,
            Err(err) => {
                // Allocator state already rolled back; keep counts durable.
                self.commit()?;
                return Err(err);
            }
        };
        self.write_inode(open.ino, &inode)?;
        if offset.is_none() {
            self.fds.get_mut(fd)?.pos = pos + written as u64;
        }
        self.commit()?;
        Ok(written)
    }

    /// Set the file length through an open descriptor.
    pub fn ftruncate(&mut self, fd: u32, new_size: u64) -> Result<()> {
        let open = self.fds.get(fd)?.clone();
        if open.flags & O_ACCMODE == O_RDONLY {
            return Err(EfsError::InvalidArgument("descriptor not open for writing"));
        }
        let mut inode = self.read_inode(open.ino)?;
        if inode.is_dir() {
            return Err(EfsError::IsDirectory(format!("fd {fd}")));
        }
        self.truncate_file(open.ino, &mut inode, new_size)?;
        self.write_inode(open.ino, &inode)?;
        self.commit()
    }

    // ── Namespace: files and links ──────────────────────────────────────

    /// Remove a name. The inode is freed when its link count reaches zero
    /// and no descriptor still refers to it.
    pub fn unlink(&mut self, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        let mut parent_inode = self.read_inode(parent)?;
        let child = efs_dir::lookup(self.dev.as_ref(), &parent_inode, name.as_bytes())?
            .ok_or_else(|| EfsError::NotFound(path.to_owned()))?;
        let mut child_inode = self.read_inode(child)?;
        if child_inode.is_dir() {
            return Err(EfsError::IsDirectory(path.to_owned()));
        }

        efs_dir::remove(self.dev.as_mut(), &mut parent_inode, name.as_bytes())?;
        let now = self.now();
        parent_inode.mtime = now;
        parent_inode.ctime = now;
        self.write_inode(parent, &parent_inode)?;

        child_inode.links_count -= 1;
        child_inode.ctime = now;
        if child_inode.links_count == 0 && self.fds.open_count(child) == 0 {
            self.delete_inode(child, &mut child_inode)?;
        } else {
            self.write_inode(child, &child_inode)?;
        }
        self.commit()
    }

    /// Create a hard link to an existing file. Directories cannot be hard
    /// linked.
    pub fn link(&mut self, existing: &str, new_path: &str) -> Result<()> {
        let src = self.resolve(existing, true)?;
        let mut src_inode = self.read_inode(src)?;
        if src_inode.is_dir() {
            return Err(EfsError::IsDirectory(existing.to_owned()));
        }

        let (parent, name) = self.resolve_parent(new_path)?;
        let mut parent_inode = self.read_inode(parent)?;
        let hint = self.hint_for(parent);
        efs_dir::insert(
            self.dev.as_mut(),
            &self.geo,
            &mut self.groups,
            hint,
            &mut parent_inode,
            name.as_bytes(),
            src,
            file_type_byte(&src_inode),
        )?;
        let now = self.now();
        parent_inode.mtime = now;
        parent_inode.ctime = now;
        self.write_inode(parent, &parent_inode)?;

        src_inode.links_count += 1;
        src_inode.ctime = now;
        self.write_inode(src, &src_inode)?;
        self.commit()
    }

    /// Create a symbolic link at `link_path` pointing at `target`. Targets
    /// up to 48 bytes are stored inline in the inode.
    pub fn symlink(&mut self, target: &str, link_path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(link_path)?;
        let mut parent_inode = self.read_inode(parent)?;
        if efs_dir::lookup(self.dev.as_ref(), &parent_inode, name.as_bytes())?.is_some() {
            return Err(EfsError::Exists(link_path.to_owned()));
        }

        let hint = self.hint_for(parent);
        let ino = efs_alloc::alloc_inode(
            self.dev.as_mut(),
            &self.geo,
            &mut self.groups,
            hint,
            false,
        )?;
        let now = self.now();
        let mut inode = efs_inode::init_inode(S_IFLNK | 0o777, 0, 0, 1, now);

        let bytes = target.as_bytes();
        if bytes.len() <= FAST_SYMLINK_MAX {
            inode.extent_root = [0_u8; FAST_SYMLINK_MAX];
            inode.extent_root[..bytes.len()].copy_from_slice(bytes);
            inode.size = bytes.len() as u64;
        } else {
            self.write_file_at(ino, &mut inode, 0, bytes)?;
        }
        self.write_inode(ino, &inode)?;

        efs_dir::insert(
            self.dev.as_mut(),
            &self.geo,
            &mut self.groups,
            hint,
            &mut parent_inode,
            name.as_bytes(),
            ino,
            FT_SYMLINK,
        )?;
        parent_inode.mtime = now;
        parent_inode.ctime = now;
        self.write_inode(parent, &parent_inode)?;
        self.commit()
    }

    // ── Namespace: directories ──────────────────────────────────────────

    /// Create a directory with `.` and `..` entries.
    pub fn mkdir(&mut self, path: &str, mode: u32) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        self.create_child(parent, &name, S_IFDIR | (mode & 0o7777), FT_DIRECTORY, 2)?;
        self.commit()
    }

    /// Remove an empty directory.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        let mut parent_inode = self.read_inode(parent)?;
        let child = efs_dir::lookup(self.dev.as_ref(), &parent_inode, name.as_bytes())?
            .ok_or_else(|| EfsError::NotFound(path.to_owned()))?;
        if child == ROOT_INO {
            return Err(EfsError::InvalidArgument("cannot remove the root directory"));
        }
        let mut child_inode = self.read_inode(child)?;
        if !child_inode.is_dir() {
            return Err(EfsError::NotDirectory(path.to_owned()));
        }
        if !efs_dir::is_empty(self.dev.as_ref(), &child_inode)? {
            return Err(EfsError::NotEmpty(path.to_owned()));
        }

        efs_dir::remove(self.dev.as_mut(), &mut parent_inode, name.as_bytes())?;
        let now = self.now();
        parent_inode.links_count -= 1; // the child's `..`
        parent_inode.mtime = now;
        parent_inode.ctime = now;
        self.write_inode(parent, &parent_inode)?;

        self.delete_inode(child, &mut child_inode)?;
        self.commit()
    }

    /// Remove a directory tree depth-first.
    pub fn rmdir_recursive(&mut self, path: &str) -> Result<()> {
        let ino = self.resolve(path, false)?;
        let inode = self.read_inode(ino)?;
        if !inode.is_dir() {
            return Err(EfsError::NotDirectory(path.to_owned()));
        }

        let base = path.trim_end_matches('/');
        for entry in efs_dir::list(self.dev.as_ref(), &inode)? {
            if entry.name == b"." || entry.name == b".." {
                continue;
            }
            let child_path = format!("{base}/{}", entry.name_str());
            if entry.file_type == FT_DIRECTORY {
                self.rmdir_recursive(&child_path)?;
            } else {
                self.unlink(&child_path)?;
            }
        }
        self.rmdir(path)
    }

    /// List a directory in on-disk (insertion) order, `.` and `..` first.
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntryInfo>> {
        let ino = self.resolve(path, true)?;
        let inode = self.read_inode(ino)?;
        if !inode.is_dir() {
            return Err(EfsError::NotDirectory(path.to_owned()));
        }
        efs_dir::list(self.dev.as_ref(), &inode)
    }

    // ── Metadata ────────────────────────────────────────────────────────

    /// Metadata of the inode `path` resolves to, following a final symlink.
    pub fn stat(&self, path: &str) -> Result<FileStat> {
        let ino = self.resolve(path, true)?;
        self.stat_inode(ino)
    }

    /// Like `stat`, but a final symlink is reported rather than followed.
    pub fn lstat(&self, path: &str) -> Result<FileStat> {
        let ino = self.resolve(path, false)?;
        self.stat_inode(ino)
    }

    /// Target string of the symlink at `path`.
    pub fn read_link(&self, path: &str) -> Result<String> {
        let ino = self.resolve(path, false)?;
        let inode = self.read_inode(ino)?;
        self.read_link_target(&inode)
    }

    /// Replace the permission bits.
    pub fn chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        let ino = self.resolve(path, true)?;
        let mut inode = self.read_inode(ino)?;
        inode.mode = (inode.mode & S_IFMT) | (mode & 0o7777);
        inode.ctime = self.now();
        self.write_inode(ino, &inode)?;
        self.commit()
    }

    /// Set the owner fields.
    pub fn chown(&mut self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let ino = self.resolve(path, true)?;
        let mut inode = self.read_inode(ino)?;
        inode.uid = uid;
        inode.gid = gid;
        inode.ctime = self.now();
        self.write_inode(ino, &inode)?;
        self.commit()
    }

    // ── Working directory ───────────────────────────────────────────────

    /// Change the working directory.
    pub fn chdir(&mut self, path: &str) -> Result<()> {
        let ino = self.resolve(path, true)?;
        if !self.read_inode(ino)?.is_dir() {
            return Err(EfsError::NotDirectory(path.to_owned()));
        }
        self.cwd_path = self.joined_cwd_path(path);
        self.cwd = ino;
        Ok(())
    }

    /// The absolute path of the working directory.
    #[must_use]
    pub fn getcwd(&self) -> &str {
        &self.cwd_path
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Allocate and initialize a child inode (regular file or directory)
    /// and insert it into `parent`.
    fn create_child(
        &mut self,
        parent: InodeNumber,
        name: &str,
        mode: u32,
        file_type: u8,
        links: u32,
    ) -> Result<InodeNumber> {
        let mut parent_inode = self.read_inode(parent)?;
        if efs_dir::lookup(self.dev.as_ref(), &parent_inode, name.as_bytes())?.is_some() {
            return Err(EfsError::Exists(name.to_owned()));
        }

        let is_dir = mode & S_IFMT == S_IFDIR;
        let parent_hint = self.hint_for(parent);
        let ino = efs_alloc::alloc_inode(
            self.dev.as_mut(),
            &self.geo,
            &mut self.groups,
            parent_hint,
            is_dir,
        )?;
        let now = self.now();
        let mut inode = efs_inode::init_inode(mode, 0, 0, links, now);

        if is_dir {
            let hint = self.hint_for(ino);
            efs_dir::init_directory(
                self.dev.as_mut(),
                &self.geo,
                &mut self.groups,
                hint,
                &mut inode,
                ino,
                parent,
            )?;
        }
        self.write_inode(ino, &inode)?;

        efs_dir::insert(
            self.dev.as_mut(),
            &self.geo,
            &mut self.groups,
            parent_hint,
            &mut parent_inode,
            name.as_bytes(),
            ino,
            file_type,
        )?;
        if is_dir {
            parent_inode.links_count += 1; // the child's `..`
        }
        parent_inode.mtime = now;
        parent_inode.ctime = now;
        self.write_inode(parent, &parent_inode)?;
        debug!(target: "efs::ops", ino = ino.0, name, "created");
        Ok(ino)
    }

    /// Free an inode's data, its tree nodes, its bitmap bit, and zero the
    /// record.
    fn delete_inode(&mut self, ino: InodeNumber, inode: &mut Inode) -> Result<()> {
        self.free_file_contents(ino, inode)?;
        efs_alloc::free_inode(self.dev.as_mut(), &self.geo, &mut self.groups, ino)?;
        self.write_inode(ino, &Inode::zeroed())?;
        debug!(target: "efs::ops", ino = ino.0, "deleted");
        Ok(())
    }

    fn stat_inode(&self, ino: InodeNumber) -> Result<FileStat> {
        let inode = self.read_inode(ino)?;
        Ok(FileStat {
            ino: ino.0,
            kind: kind_of(&inode)?,
            mode: inode.mode,
            uid: inode.uid,
            gid: inode.gid,
            size: inode.size,
            links_count: inode.links_count,
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
        })
    }
}
