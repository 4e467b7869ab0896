//! Inode references.
//!
//! There is no disk behind the process core. The cache only tracks which paths are referenced
//! and how often, which is what a process's current directory needs.

use core::fmt::Display;

use alloc::string::String;

use crate::param::{MAXPATH, NINODE};
use crate::spinlock::SpinLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    OutOfInode,
    OutOfFile,
    /// Not an absolute path.
    Resolve,
    NameTooLong,
}

impl Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FsError::OutOfInode => write!(f, "out of inodes"),
            FsError::OutOfFile => write!(f, "out of files"),
            FsError::Resolve => write!(f, "cannot resolve path"),
            FsError::NameTooLong => write!(f, "path too long"),
        }
    }
}

#[derive(Debug)]
struct InodeMeta {
    ref_count: usize,
    path: String,
}

impl InodeMeta {
    const EMPTY: Self = Self {
        ref_count: 0,
        path: String::new(),
    };
}

/// In-memory inode handle, an index into the [`Icache`]. Owns one reference.
#[derive(Debug, PartialEq, Eq)]
pub struct Inode {
    id: usize,
}

#[derive(Debug)]
pub struct Icache {
    inodes: SpinLock<[InodeMeta; NINODE]>,
}

impl Icache {
    pub const fn new() -> Self {
        Self {
            inodes: SpinLock::new([InodeMeta::EMPTY; NINODE], "icache"),
        }
    }

    /// Looks up the inode for `path` and returns a new reference to it.
    pub fn namei(&self, path: &str) -> Result<Inode, FsError> {
        if !path.starts_with('/') {
            err!(FsError::Resolve);
        }
        if path.len() > MAXPATH {
            err!(FsError::NameTooLong);
        }

        let mut inodes = self.inodes.lock();

        // Is the inode already in the cache?
        let mut empty = None;
        for (id, inode) in inodes.iter_mut().enumerate() {
            if inode.ref_count > 0 && inode.path == path {
                inode.ref_count += 1;
                return Ok(Inode { id });
            }
            if empty.is_none() && inode.ref_count == 0 {
                empty = Some(id);
            }
        }

        // Recycle an inode entry.
        let Some(id) = empty else {
            err!(FsError::OutOfInode);
        };

        inodes[id].ref_count = 1;
        inodes[id].path.clear();
        inodes[id].path.push_str(path);
        Ok(Inode { id })
    }

    /// Increments the reference count.
    pub fn dup(&self, inode: &Inode) -> Inode {
        let meta = &mut self.inodes.lock()[inode.id];
        assert!(meta.ref_count >= 1, "idup");
        meta.ref_count += 1;
        Inode { id: inode.id }
    }

    /// Drops a reference to an in-memory inode.
    pub fn put(&self, inode: Inode) {
        let meta = &mut self.inodes.lock()[inode.id];
        assert!(meta.ref_count >= 1, "iput");
        meta.ref_count -= 1;
    }

    pub fn ref_count(&self, inode: &Inode) -> usize {
        self.inodes.lock()[inode.id].ref_count
    }

    pub fn path(&self, inode: &Inode) -> String {
        self.inodes.lock()[inode.id].path.clone()
    }
}

impl Default for Icache {
    fn default() -> Self {
        Self::new()
    }
}
