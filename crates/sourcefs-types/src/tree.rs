use serde::{Deserialize, Serialize};

use crate::hash::Hash;

/// Kind of object a tree entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeEntryKind {
    /// Regular file.
    File,
    /// Regular file with the executable bit set.
    Executable,
    /// Symbolic link.
    Symlink,
    /// Subdirectory.
    Directory,
}

/// A single named entry in a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Entry name within the directory.
    pub name: String,
    /// Hash of the object the entry points at.
    pub hash: Hash,
    /// What the entry is.
    pub kind: TreeEntryKind,
}

impl TreeEntry {
    /// Creates an entry.
    pub fn new(name: impl Into<String>, hash: Hash, kind: TreeEntryKind) -> Self {
        TreeEntry {
            name: name.into(),
            hash,
            kind,
        }
    }

    /// Returns true if the entry names a subdirectory.
    pub fn is_directory(&self) -> bool {
        self.kind == TreeEntryKind::Directory
    }
}

/// A directory manifest: an ordered list of named entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    id: Hash,
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// Creates a tree from its id and entries.
    pub fn new(id: Hash, entries: Vec<TreeEntry>) -> Self {
        Tree { id, entries }
    }

    /// The content hash this tree was fetched under.
    pub fn id(&self) -> &Hash {
        &self.id
    }

    /// The tree's entries in manifest order.
    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    /// Looks up an entry by name.
    pub fn entry(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true for an empty directory.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
