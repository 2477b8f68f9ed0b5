//! Filesystem semantics contract.
//!
//! The channel invokes the dispatcher purely through this trait, one method
//! per opcode family. Every method defaults to "function not implemented",
//! so a dispatcher only overrides the families it supports. Methods return
//! reply payloads typed as the wire structs they encode to; errors are raw
//! errno values converted to negative reply status by the channel.

use std::ffi::OsString;
use std::fmt;

use async_trait::async_trait;

use crate::proto::{
    AttrOut, BmapIn, CreateIn, EntryOut, FlushIn, ForgetOne, FsyncIn, GetattrIn, MkdirIn,
    MknodIn, OpenIn, OpenOut, ReadIn, ReleaseIn, SetattrIn, SetxattrIn, StatfsOut, WriteIn,
};
use crate::request::RequestInfo;

/// A POSIX errno carried from the dispatcher to the reply writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    /// Function not implemented.
    pub const NOSYS: Errno = Errno(libc::ENOSYS);
    /// No such file or directory.
    pub const NOENT: Errno = Errno(libc::ENOENT);
    /// Invalid argument.
    pub const INVAL: Errno = Errno(libc::EINVAL);
    /// Interrupted by the kernel.
    pub const INTR: Errno = Errno(libc::EINTR);
    /// Generic I/O failure.
    pub const IO: Errno = Errno(libc::EIO);
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

impl From<std::io::Error> for Errno {
    fn from(err: std::io::Error) -> Self {
        Errno(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

/// Result type for dispatcher methods.
pub type DispatchResult<T> = std::result::Result<T, Errno>;

/// Reply to getxattr/listxattr, which are two-phase: the kernel first asks
/// for the value size, then for the value itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XattrReply {
    /// Size probe answer (request had `size == 0`).
    Size(u32),
    /// The attribute value (or packed name list for listxattr).
    Data(Vec<u8>),
}

/// Pluggable implementer of filesystem semantics per opcode family.
#[allow(unused_variables)]
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Called once after INIT completes or a takeover finishes.
    async fn initialized(&self) {}

    /// Called when the kernel tears the session down.
    async fn destroy(&self) {}

    /// Looks up a directory entry by name.
    async fn lookup(&self, req: &RequestInfo, parent: u64, name: OsString) -> DispatchResult<EntryOut> {
        Err(Errno::NOSYS)
    }

    /// Reply-less reference-count drops, batched n-way.
    async fn forget(&self, req: &RequestInfo, targets: Vec<ForgetOne>) {}

    /// Reads inode attributes.
    async fn getattr(&self, req: &RequestInfo, ino: u64, args: GetattrIn) -> DispatchResult<AttrOut> {
        Err(Errno::NOSYS)
    }

    /// Changes inode attributes; `args.valid` masks the fields to apply.
    async fn setattr(&self, req: &RequestInfo, ino: u64, args: SetattrIn) -> DispatchResult<AttrOut> {
        Err(Errno::NOSYS)
    }

    /// Reads a symlink target.
    async fn readlink(&self, req: &RequestInfo, ino: u64) -> DispatchResult<Vec<u8>> {
        Err(Errno::NOSYS)
    }

    /// Creates a symlink.
    async fn symlink(
        &self,
        req: &RequestInfo,
        parent: u64,
        name: OsString,
        target: OsString,
    ) -> DispatchResult<EntryOut> {
        Err(Errno::NOSYS)
    }

    /// Creates a device node or regular file.
    async fn mknod(
        &self,
        req: &RequestInfo,
        parent: u64,
        name: OsString,
        args: MknodIn,
    ) -> DispatchResult<EntryOut> {
        Err(Errno::NOSYS)
    }

    /// Creates a directory.
    async fn mkdir(
        &self,
        req: &RequestInfo,
        parent: u64,
        name: OsString,
        args: MkdirIn,
    ) -> DispatchResult<EntryOut> {
        Err(Errno::NOSYS)
    }

    /// Removes a file.
    async fn unlink(&self, req: &RequestInfo, parent: u64, name: OsString) -> DispatchResult<()> {
        Err(Errno::NOSYS)
    }

    /// Removes an empty directory.
    async fn rmdir(&self, req: &RequestInfo, parent: u64, name: OsString) -> DispatchResult<()> {
        Err(Errno::NOSYS)
    }

    /// Renames an entry, possibly across directories.
    async fn rename(
        &self,
        req: &RequestInfo,
        parent: u64,
        name: OsString,
        newparent: u64,
        newname: OsString,
    ) -> DispatchResult<()> {
        Err(Errno::NOSYS)
    }

    /// Creates a hard link.
    async fn link(
        &self,
        req: &RequestInfo,
        ino: u64,
        newparent: u64,
        newname: OsString,
    ) -> DispatchResult<EntryOut> {
        Err(Errno::NOSYS)
    }

    /// Opens a file, returning a file handle.
    async fn open(&self, req: &RequestInfo, ino: u64, args: OpenIn) -> DispatchResult<OpenOut> {
        Err(Errno::NOSYS)
    }

    /// Reads file data.
    async fn read(&self, req: &RequestInfo, ino: u64, args: ReadIn) -> DispatchResult<Vec<u8>> {
        Err(Errno::NOSYS)
    }

    /// Writes file data, returning the number of bytes accepted.
    async fn write(
        &self,
        req: &RequestInfo,
        ino: u64,
        args: WriteIn,
        data: Vec<u8>,
    ) -> DispatchResult<u32> {
        Err(Errno::NOSYS)
    }

    /// Reports filesystem statistics.
    async fn statfs(&self, req: &RequestInfo, ino: u64) -> DispatchResult<StatfsOut> {
        Err(Errno::NOSYS)
    }

    /// Releases an open file handle.
    async fn release(&self, req: &RequestInfo, ino: u64, args: ReleaseIn) -> DispatchResult<()> {
        Err(Errno::NOSYS)
    }

    /// Flushes dirty file state to stable storage.
    async fn fsync(&self, req: &RequestInfo, ino: u64, args: FsyncIn) -> DispatchResult<()> {
        Err(Errno::NOSYS)
    }

    /// Sets an extended attribute.
    async fn setxattr(
        &self,
        req: &RequestInfo,
        ino: u64,
        name: OsString,
        value: Vec<u8>,
        args: SetxattrIn,
    ) -> DispatchResult<()> {
        Err(Errno::NOSYS)
    }

    /// Reads an extended attribute (or its size when `size == 0`).
    async fn getxattr(
        &self,
        req: &RequestInfo,
        ino: u64,
        name: OsString,
        size: u32,
    ) -> DispatchResult<XattrReply> {
        Err(Errno::NOSYS)
    }

    /// Lists extended attribute names (or their packed size).
    async fn listxattr(&self, req: &RequestInfo, ino: u64, size: u32) -> DispatchResult<XattrReply> {
        Err(Errno::NOSYS)
    }

    /// Removes an extended attribute.
    async fn removexattr(&self, req: &RequestInfo, ino: u64, name: OsString) -> DispatchResult<()> {
        Err(Errno::NOSYS)
    }

    /// Flushes at close of a file descriptor.
    async fn flush(&self, req: &RequestInfo, ino: u64, args: FlushIn) -> DispatchResult<()> {
        Err(Errno::NOSYS)
    }

    /// Opens a directory, returning a directory handle.
    async fn opendir(&self, req: &RequestInfo, ino: u64, args: OpenIn) -> DispatchResult<OpenOut> {
        Err(Errno::NOSYS)
    }

    /// Returns packed dirents, built with [`crate::proto::DirentBuf`].
    async fn readdir(&self, req: &RequestInfo, ino: u64, args: ReadIn) -> DispatchResult<Vec<u8>> {
        Err(Errno::NOSYS)
    }

    /// Releases an open directory handle.
    async fn releasedir(&self, req: &RequestInfo, ino: u64, args: ReleaseIn) -> DispatchResult<()> {
        Err(Errno::NOSYS)
    }

    /// Flushes directory state to stable storage.
    async fn fsyncdir(&self, req: &RequestInfo, ino: u64, args: FsyncIn) -> DispatchResult<()> {
        Err(Errno::NOSYS)
    }

    /// Checks file access permissions.
    async fn access(&self, req: &RequestInfo, ino: u64, mask: u32) -> DispatchResult<()> {
        Err(Errno::NOSYS)
    }

    /// Atomically creates and opens a file.
    async fn create(
        &self,
        req: &RequestInfo,
        parent: u64,
        name: OsString,
        args: CreateIn,
    ) -> DispatchResult<(EntryOut, OpenOut)> {
        Err(Errno::NOSYS)
    }

    /// Maps a file block to a device block (block-device filesystems).
    async fn bmap(&self, req: &RequestInfo, ino: u64, args: BmapIn) -> DispatchResult<u64> {
        Err(Errno::NOSYS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::InHeader;
    use crate::request::RequestContext;
    use std::sync::Arc;

    struct NullDispatcher;

    #[async_trait]
    impl Dispatcher for NullDispatcher {}

    fn req() -> RequestInfo {
        RequestInfo::new(Arc::new(RequestContext::new(InHeader::default())))
    }

    #[tokio::test]
    async fn test_default_methods_return_nosys() {
        let dispatcher = NullDispatcher;
        let req = req();

        let result = dispatcher.lookup(&req, 1, OsString::from("x")).await;
        assert_eq!(result.unwrap_err(), Errno::NOSYS);

        let result = dispatcher.read(&req, 1, ReadIn::default()).await;
        assert_eq!(result.unwrap_err(), Errno::NOSYS);

        let result = dispatcher.statfs(&req, 1).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_default_forget_is_a_no_op() {
        let dispatcher = NullDispatcher;
        dispatcher.forget(&req(), vec![ForgetOne::default()]).await;
    }

    #[test]
    fn test_errno_from_io_error() {
        let err = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(Errno::from(err), Errno(libc::EACCES));

        let err = std::io::Error::other("no raw errno");
        assert_eq!(Errno::from(err), Errno::IO);
    }

    #[test]
    fn test_errno_constants() {
        assert_eq!(Errno::NOSYS.0, libc::ENOSYS);
        assert_eq!(Errno::INTR.0, libc::EINTR);
    }
}
