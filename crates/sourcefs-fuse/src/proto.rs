//! FUSE ABI wire codec.
//!
//! Fixed-layout little-endian records matching the kernel's `fuse.h` for
//! protocol 7.x. The channel must be bit-exact here: every struct below is
//! `#[repr(C)]`, padding-free, and mirrors the kernel layout field for
//! field. Decoding is a size-checked unaligned read; encoding is a plain
//! byte view of the struct.

// Struct and field names mirror fuse.h; the kernel header is the doc.
#![allow(missing_docs)]

use std::ffi::{OsStr, OsString};
use std::mem;
use std::os::unix::ffi::OsStrExt;

use crate::error::ChannelError;

/// Protocol major version this channel implements.
pub const KERNEL_VERSION: u32 = 7;
/// Protocol minor version this channel implements.
pub const KERNEL_MINOR_VERSION: u32 = 31;
/// Inode number of the filesystem root.
pub const ROOT_ID: u64 = 1;

/// The kernel may send writes up to `max_write` plus one header page;
/// reads below this floor risk truncating requests.
pub const MIN_READ_BUFFER: usize = 128 * 1024;
/// Room for the request header and opcode payload ahead of write data.
pub const HEADER_ROOM: usize = 4096;

// Opcodes, numbered per fuse.h.
pub const FUSE_LOOKUP: u32 = 1;
pub const FUSE_FORGET: u32 = 2;
pub const FUSE_GETATTR: u32 = 3;
pub const FUSE_SETATTR: u32 = 4;
pub const FUSE_READLINK: u32 = 5;
pub const FUSE_SYMLINK: u32 = 6;
pub const FUSE_MKNOD: u32 = 8;
pub const FUSE_MKDIR: u32 = 9;
pub const FUSE_UNLINK: u32 = 10;
pub const FUSE_RMDIR: u32 = 11;
pub const FUSE_RENAME: u32 = 12;
pub const FUSE_LINK: u32 = 13;
pub const FUSE_OPEN: u32 = 14;
pub const FUSE_READ: u32 = 15;
pub const FUSE_WRITE: u32 = 16;
pub const FUSE_STATFS: u32 = 17;
pub const FUSE_RELEASE: u32 = 18;
pub const FUSE_FSYNC: u32 = 20;
pub const FUSE_SETXATTR: u32 = 21;
pub const FUSE_GETXATTR: u32 = 22;
pub const FUSE_LISTXATTR: u32 = 23;
pub const FUSE_REMOVEXATTR: u32 = 24;
pub const FUSE_FLUSH: u32 = 25;
pub const FUSE_INIT: u32 = 26;
pub const FUSE_OPENDIR: u32 = 27;
pub const FUSE_READDIR: u32 = 28;
pub const FUSE_RELEASEDIR: u32 = 29;
pub const FUSE_FSYNCDIR: u32 = 30;
pub const FUSE_ACCESS: u32 = 34;
pub const FUSE_CREATE: u32 = 35;
pub const FUSE_INTERRUPT: u32 = 36;
pub const FUSE_BMAP: u32 = 37;
pub const FUSE_DESTROY: u32 = 38;
pub const FUSE_BATCH_FORGET: u32 = 42;

// Notification codes carried in the reply header's error field.
pub const FUSE_NOTIFY_INVAL_INODE: i32 = 2;
pub const FUSE_NOTIFY_INVAL_ENTRY: i32 = 3;

// INIT capability flags.
pub const FUSE_ASYNC_READ: u32 = 1 << 0;
pub const FUSE_POSIX_LOCKS: u32 = 1 << 1;
pub const FUSE_ATOMIC_O_TRUNC: u32 = 1 << 3;
pub const FUSE_EXPORT_SUPPORT: u32 = 1 << 4;
pub const FUSE_BIG_WRITES: u32 = 1 << 5;
pub const FUSE_DONT_MASK: u32 = 1 << 6;
pub const FUSE_AUTO_INVAL_DATA: u32 = 1 << 12;
pub const FUSE_ASYNC_DIO: u32 = 1 << 15;
pub const FUSE_PARALLEL_DIROPS: u32 = 1 << 18;
pub const FUSE_MAX_PAGES: u32 = 1 << 22;
pub const FUSE_CACHE_SYMLINKS: u32 = 1 << 23;

// fuse_setattr_in::valid bits.
pub const FATTR_MODE: u32 = 1 << 0;
pub const FATTR_UID: u32 = 1 << 1;
pub const FATTR_GID: u32 = 1 << 2;
pub const FATTR_SIZE: u32 = 1 << 3;
pub const FATTR_ATIME: u32 = 1 << 4;
pub const FATTR_MTIME: u32 = 1 << 5;
pub const FATTR_FH: u32 = 1 << 6;
pub const FATTR_ATIME_NOW: u32 = 1 << 7;
pub const FATTR_MTIME_NOW: u32 = 1 << 8;
pub const FATTR_LOCKOWNER: u32 = 1 << 9;
pub const FATTR_CTIME: u32 = 1 << 10;

// Older kernels expect truncated INIT replies.
pub const COMPAT_INIT_OUT_SIZE: usize = 8;
pub const COMPAT_22_INIT_OUT_SIZE: usize = 24;

/// Marker for padding-free `#[repr(C)]` protocol structs.
///
/// # Safety
///
/// Implementors must be plain integer records with no padding bytes and no
/// invalid bit patterns, so that a byte copy in either direction is sound.
pub unsafe trait Wire: Copy {}

/// Reads one wire struct off the front of `bytes`, returning the rest.
pub fn read_struct<T: Wire>(bytes: &[u8]) -> Option<(T, &[u8])> {
    if bytes.len() < mem::size_of::<T>() {
        return None;
    }
    // Size is checked above; Wire guarantees any bit pattern is valid.
    let value = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) };
    Some((value, &bytes[mem::size_of::<T>()..]))
}

/// Views a wire struct as raw reply bytes.
pub fn struct_bytes<T: Wire>(value: &T) -> &[u8] {
    // Wire guarantees no padding, so every byte is initialized.
    unsafe {
        std::slice::from_raw_parts((value as *const T).cast::<u8>(), mem::size_of::<T>())
    }
}

/// Request header preceding every kernel request.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct InHeader {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub padding: u32,
}

/// Reply header preceding every reply and notification.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutHeader {
    pub len: u32,
    pub error: i32,
    pub unique: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct InitIn {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct InitOut {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
    pub max_background: u16,
    pub congestion_threshold: u16,
    pub max_write: u32,
    pub time_gran: u32,
    pub max_pages: u16,
    pub map_alignment: u16,
    pub unused: [u32; 8],
}

/// Inode attributes as the kernel caches them.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Attr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub padding: u32,
}

/// Reply body for lookup-family operations.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryOut {
    pub nodeid: u64,
    pub generation: u64,
    pub entry_valid: u64,
    pub attr_valid: u64,
    pub entry_valid_nsec: u32,
    pub attr_valid_nsec: u32,
    pub attr: Attr,
}

/// Reply body for getattr and setattr.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AttrOut {
    pub attr_valid: u64,
    pub attr_valid_nsec: u32,
    pub dummy: u32,
    pub attr: Attr,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GetattrIn {
    pub getattr_flags: u32,
    pub dummy: u32,
    pub fh: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SetattrIn {
    pub valid: u32,
    pub padding: u32,
    pub fh: u64,
    pub size: u64,
    pub lock_owner: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub unused4: u32,
    pub uid: u32,
    pub gid: u32,
    pub unused5: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MknodIn {
    pub mode: u32,
    pub rdev: u32,
    pub umask: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MkdirIn {
    pub mode: u32,
    pub umask: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RenameIn {
    pub newdir: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkIn {
    pub oldnodeid: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenIn {
    pub flags: u32,
    pub unused: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateIn {
    pub flags: u32,
    pub mode: u32,
    pub umask: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOut {
    pub fh: u64,
    pub open_flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub read_flags: u32,
    pub lock_owner: u64,
    pub flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub write_flags: u32,
    pub lock_owner: u64,
    pub flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOut {
    pub size: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ReleaseIn {
    pub fh: u64,
    pub flags: u32,
    pub release_flags: u32,
    pub lock_owner: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushIn {
    pub fh: u64,
    pub unused: u32,
    pub padding: u32,
    pub lock_owner: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FsyncIn {
    pub fh: u64,
    pub fsync_flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SetxattrIn {
    pub size: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GetxattrIn {
    pub size: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GetxattrOut {
    pub size: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessIn {
    pub mask: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ForgetIn {
    pub nlookup: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ForgetOne {
    pub nodeid: u64,
    pub nlookup: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchForgetIn {
    pub count: u32,
    pub dummy: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct InterruptIn {
    pub unique: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BmapIn {
    pub block: u64,
    pub blocksize: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BmapOut {
    pub block: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Kstatfs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
    pub padding: u32,
    pub spare: [u32; 6],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct StatfsOut {
    pub st: Kstatfs,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifyInvalInodeOut {
    pub ino: u64,
    pub off: i64,
    pub len: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifyInvalEntryOut {
    pub parent: u64,
    pub namelen: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct DirentHeader {
    ino: u64,
    off: u64,
    namelen: u32,
    kind: u32,
}

unsafe impl Wire for InHeader {}
unsafe impl Wire for OutHeader {}
unsafe impl Wire for InitIn {}
unsafe impl Wire for InitOut {}
unsafe impl Wire for Attr {}
unsafe impl Wire for EntryOut {}
unsafe impl Wire for AttrOut {}
unsafe impl Wire for GetattrIn {}
unsafe impl Wire for SetattrIn {}
unsafe impl Wire for MknodIn {}
unsafe impl Wire for MkdirIn {}
unsafe impl Wire for RenameIn {}
unsafe impl Wire for LinkIn {}
unsafe impl Wire for OpenIn {}
unsafe impl Wire for CreateIn {}
unsafe impl Wire for OpenOut {}
unsafe impl Wire for ReadIn {}
unsafe impl Wire for WriteIn {}
unsafe impl Wire for WriteOut {}
unsafe impl Wire for ReleaseIn {}
unsafe impl Wire for FlushIn {}
unsafe impl Wire for FsyncIn {}
unsafe impl Wire for SetxattrIn {}
unsafe impl Wire for GetxattrIn {}
unsafe impl Wire for GetxattrOut {}
unsafe impl Wire for AccessIn {}
unsafe impl Wire for ForgetIn {}
unsafe impl Wire for ForgetOne {}
unsafe impl Wire for BatchForgetIn {}
unsafe impl Wire for InterruptIn {}
unsafe impl Wire for BmapIn {}
unsafe impl Wire for BmapOut {}
unsafe impl Wire for Kstatfs {}
unsafe impl Wire for StatfsOut {}
unsafe impl Wire for NotifyInvalInodeOut {}
unsafe impl Wire for NotifyInvalEntryOut {}
unsafe impl Wire for DirentHeader {}

/// Splits one raw kernel request into its header and opcode payload.
pub fn split_request(buf: &[u8]) -> Result<(InHeader, &[u8]), ChannelError> {
    let (header, payload) = read_struct::<InHeader>(buf).ok_or_else(|| {
        ChannelError::ProtocolViolation(format!("request shorter than header: {}", buf.len()))
    })?;
    if header.len as usize != buf.len() {
        return Err(ChannelError::ProtocolViolation(format!(
            "header length {} does not match read size {}",
            header.len,
            buf.len()
        )));
    }
    Ok((header, payload))
}

/// Parses a single NUL-terminated name from a payload.
pub fn parse_name(payload: &[u8]) -> Option<OsString> {
    let nul = payload.iter().position(|&b| b == 0)?;
    Some(OsStr::from_bytes(&payload[..nul]).to_os_string())
}

/// Parses two consecutive NUL-terminated names (rename, symlink).
pub fn parse_two_names(payload: &[u8]) -> Option<(OsString, OsString)> {
    let first_nul = payload.iter().position(|&b| b == 0)?;
    let first = OsStr::from_bytes(&payload[..first_nul]).to_os_string();
    let rest = &payload[first_nul + 1..];
    let second = parse_name(rest)?;
    Some((first, second))
}

/// Encodes the reply header for `payload_len` bytes of body.
pub fn encode_out_header(unique: u64, error: i32, payload_len: usize) -> OutHeader {
    OutHeader {
        len: (mem::size_of::<OutHeader>() + payload_len) as u32,
        error,
        unique,
    }
}

/// Human-readable opcode name for logging.
pub fn opcode_name(opcode: u32) -> &'static str {
    match opcode {
        FUSE_LOOKUP => "lookup",
        FUSE_FORGET => "forget",
        FUSE_GETATTR => "getattr",
        FUSE_SETATTR => "setattr",
        FUSE_READLINK => "readlink",
        FUSE_SYMLINK => "symlink",
        FUSE_MKNOD => "mknod",
        FUSE_MKDIR => "mkdir",
        FUSE_UNLINK => "unlink",
        FUSE_RMDIR => "rmdir",
        FUSE_RENAME => "rename",
        FUSE_LINK => "link",
        FUSE_OPEN => "open",
        FUSE_READ => "read",
        FUSE_WRITE => "write",
        FUSE_STATFS => "statfs",
        FUSE_RELEASE => "release",
        FUSE_FSYNC => "fsync",
        FUSE_SETXATTR => "setxattr",
        FUSE_GETXATTR => "getxattr",
        FUSE_LISTXATTR => "listxattr",
        FUSE_REMOVEXATTR => "removexattr",
        FUSE_FLUSH => "flush",
        FUSE_INIT => "init",
        FUSE_OPENDIR => "opendir",
        FUSE_READDIR => "readdir",
        FUSE_RELEASEDIR => "releasedir",
        FUSE_FSYNCDIR => "fsyncdir",
        FUSE_ACCESS => "access",
        FUSE_CREATE => "create",
        FUSE_INTERRUPT => "interrupt",
        FUSE_BMAP => "bmap",
        FUSE_DESTROY => "destroy",
        FUSE_BATCH_FORGET => "batch_forget",
        _ => "unknown",
    }
}

/// Builder for a readdir reply: dirents packed with 8-byte alignment.
#[derive(Default)]
pub struct DirentBuf {
    buf: Vec<u8>,
    max_size: usize,
}

impl DirentBuf {
    /// Creates a builder bounded by the kernel's requested size.
    pub fn new(max_size: usize) -> Self {
        DirentBuf {
            buf: Vec::with_capacity(max_size.min(MIN_READ_BUFFER)),
            max_size,
        }
    }

    /// Appends one entry. Returns false (leaving the buffer unchanged)
    /// once the entry would overflow the kernel's size, which signals the
    /// caller to stop and resume from `offset` next time.
    pub fn push(&mut self, ino: u64, offset: u64, kind: u32, name: &OsStr) -> bool {
        let name = name.as_bytes();
        let unpadded = mem::size_of::<DirentHeader>() + name.len();
        let padded = (unpadded + 7) & !7;
        if self.buf.len() + padded > self.max_size {
            return false;
        }
        let header = DirentHeader {
            ino,
            off: offset,
            namelen: name.len() as u32,
            kind,
        };
        self.buf.extend_from_slice(struct_bytes(&header));
        self.buf.extend_from_slice(name);
        self.buf.resize(self.buf.len() + (padded - unpadded), 0);
        true
    }

    /// Returns true when no entries fit.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finishes the reply payload.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
