use serde::{Deserialize, Serialize};

use crate::hash::Hash;

/// A file's contents, addressed by its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    id: Hash,
    data: Vec<u8>,
}

impl Blob {
    /// Creates a blob from its id and contents.
    pub fn new(id: Hash, data: Vec<u8>) -> Self {
        Blob { id, data }
    }

    /// The content hash this blob was fetched under.
    pub fn id(&self) -> &Hash {
        &self.id
    }

    /// The raw file contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size of the contents in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true for an empty file.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consumes the blob, returning the contents.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}
