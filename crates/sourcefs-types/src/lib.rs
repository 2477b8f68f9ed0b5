#![warn(missing_docs)]

//! SourceFS shared data model.
//!
//! Content-addressed object identities and payloads exchanged between the
//! FUSE layer and the backing store. No I/O lives here.

/// Blob payloads and identity.
pub mod blob;
/// Content hashes and proxy hashes.
pub mod hash;
/// Import priority levels.
pub mod priority;
/// Tree (directory manifest) payloads.
pub mod tree;

pub use blob::Blob;
pub use hash::{Hash, HashParseError, ProxyHash, ProxyHashDecodeError};
pub use priority::ImportPriority;
pub use tree::{Tree, TreeEntry, TreeEntryKind};
