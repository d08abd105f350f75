//! Process-scoped file descriptor table.

use efs_error::{EfsError, Result};
use efs_types::{FIRST_FD, InodeNumber};
use std::collections::BTreeMap;

/// One open handle: inode reference, access flags, and the current byte
/// position for offset-less reads and writes.
#[derive(Debug, Clone)]
pub struct OpenFile {
    pub ino: InodeNumber,
    pub flags: u32,
    pub pos: u64,
}

/// Integer descriptors starting at 3; 0-2 are reserved by convention.
#[derive(Debug, Default)]
pub struct FdTable {
    entries: BTreeMap<u32, OpenFile>,
    next: u32,
}

impl FdTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next: FIRST_FD,
        }
    }

    pub fn insert(&mut self, open: OpenFile) -> u32 {
        let fd = self.next;
        self.next += 1;
        self.entries.insert(fd, open);
        fd
    }

    pub fn get(&self, fd: u32) -> Result<&OpenFile> {
        self.entries.get(&fd).ok_or(EfsError::BadDescriptor(fd))
    }

    pub fn get_mut(&mut self, fd: u32) -> Result<&mut OpenFile> {
        self.entries.get_mut(&fd).ok_or(EfsError::BadDescriptor(fd))
    }

    pub fn remove(&mut self, fd: u32) -> Result<OpenFile> {
        self.entries.remove(&fd).ok_or(EfsError::BadDescriptor(fd))
    }

    /// How many descriptors currently refer to `ino`.
    #[must_use]
    pub fn open_count(&self, ino: InodeNumber) -> usize {
        self.entries.values().filter(|o| o.ino == ino).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_start_at_three_and_are_not_reused() {
        let mut table = FdTable::new();
        let a = table.insert(OpenFile {
            ino: InodeNumber(5),
            flags: 0,
            pos: 0,
        });
        let b = table.insert(OpenFile {
            ino: InodeNumber(5),
            flags: 0,
            pos: 0,
        });
        assert_eq!(a, 3);
        assert_eq!(b, 4);
        assert_eq!(table.open_count(InodeNumber(5)), 2);

        table.remove(a).unwrap();
        let c = table.insert(OpenFile {
            ino: InodeNumber(9),
            flags: 0,
            pos: 0,
        });
        assert_eq!(c, 5);
        assert!(matches!(table.get(a), Err(EfsError::BadDescriptor(3))));
    }
}
