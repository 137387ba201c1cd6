//! Directory entries served through the virtual filesystem

use std::time::SystemTime;

/// Kind of a served entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory (native or synthetic)
    Directory,
}

/// A `stat`-like view of one entry
#[derive(Debug, Clone)]
pub struct Entry {
    /// Entry name (the last virtual path segment)
    pub name: String,
    /// File or directory
    pub kind: EntryKind,
    /// Size in bytes; zero for directories
    pub size: u64,
    /// Last modification time, when the filesystem provides one
    pub modified: Option<SystemTime>,
    /// Whether the effective mount access allows writing here
    pub writable: bool,
    /// True for entries manufactured from child mount points; their
    /// permission bits come from the mount, never the filesystem
    pub synthetic: bool,
}

impl Entry {
    /// A synthetic directory entry for a child mount or virtual directory
    pub fn synthetic_dir(name: impl Into<String>, writable: bool) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Directory,
            size: 0,
            modified: None,
            writable,
            synthetic: true,
        }
    }

    /// Whether the entry is a directory
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

impl Entry {
    /// Build an entry from filesystem metadata
    pub fn from_metadata(name: impl Into<String>, meta: &std::fs::Metadata, writable: bool) -> Self {
        Self {
            name: name.into(),
            kind: if meta.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            },
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified: meta.modified().ok(),
            writable,
            synthetic: false,
        }
    }
}
