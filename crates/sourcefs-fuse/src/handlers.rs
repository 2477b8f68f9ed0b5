//! Opcode handler table.
//!
//! The single place opcode semantics are listed: a static table mapping
//! each opcode to its payload parser and dispatcher invocation, all with
//! one shared signature. Adding an opcode means adding one table row.
//! INIT, DESTROY, and INTERRUPT are session-level and handled directly by
//! the channel, not listed here.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::dispatcher::{DispatchResult, Dispatcher, Errno, XattrReply};
use crate::proto::{self, struct_bytes, Wire};
use crate::request::RequestInfo;

/// An assembled reply payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    /// Success with no payload.
    Empty,
    /// A single contiguous payload.
    Data(Vec<u8>),
    /// Multiple payload segments written with one gathered write.
    Segments(Vec<Vec<u8>>),
}

/// Future returned by a handler invocation.
pub type HandlerFuture = Pin<Box<dyn Future<Output = DispatchResult<ReplyBody>> + Send>>;

/// Shared invocation signature: dispatcher, request context, raw payload.
pub type InvokeFn = fn(Arc<dyn Dispatcher>, RequestInfo, Vec<u8>) -> HandlerFuture;

/// One table row.
pub struct HandlerEntry {
    /// The opcode this row serves.
    pub opcode: u32,
    /// Name used in logs.
    pub name: &'static str,
    /// False for the forget family, which must never be replied to.
    pub expects_reply: bool,
    /// Parses the payload and invokes the dispatcher.
    pub invoke: InvokeFn,
}

fn parse<T: Wire>(payload: &[u8]) -> DispatchResult<(T, &[u8])> {
    proto::read_struct(payload).ok_or(Errno::INVAL)
}

fn name_arg(payload: &[u8]) -> DispatchResult<OsString> {
    proto::parse_name(payload).ok_or(Errno::INVAL)
}

fn reply_struct<T: Wire>(value: &T) -> ReplyBody {
    ReplyBody::Data(struct_bytes(value).to_vec())
}

fn xattr_reply(reply: XattrReply) -> ReplyBody {
    match reply {
        XattrReply::Size(size) => reply_struct(&proto::GetxattrOut { size, padding: 0 }),
        XattrReply::Data(data) => ReplyBody::Data(data),
    }
}

fn invoke_lookup(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let name = name_arg(&payload)?;
        let entry = d.lookup(&req, req.nodeid(), name).await?;
        Ok(reply_struct(&entry))
    })
}

fn invoke_forget(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, _) = parse::<proto::ForgetIn>(&payload)?;
        let target = proto::ForgetOne {
            nodeid: req.nodeid(),
            nlookup: args.nlookup,
        };
        d.forget(&req, vec![target]).await;
        Ok(ReplyBody::Empty)
    })
}

fn invoke_batch_forget(
    d: Arc<dyn Dispatcher>,
    req: RequestInfo,
    payload: Vec<u8>,
) -> HandlerFuture {
    Box::pin(async move {
        let (args, mut rest) = parse::<proto::BatchForgetIn>(&payload)?;
        let mut targets = Vec::with_capacity(args.count as usize);
        for _ in 0..args.count {
            let (one, tail) = parse::<proto::ForgetOne>(rest)?;
            targets.push(one);
            rest = tail;
        }
        d.forget(&req, targets).await;
        Ok(ReplyBody::Empty)
    })
}

fn invoke_getattr(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, _) = parse::<proto::GetattrIn>(&payload)?;
        let attr = d.getattr(&req, req.nodeid(), args).await?;
        Ok(reply_struct(&attr))
    })
}

fn invoke_setattr(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, _) = parse::<proto::SetattrIn>(&payload)?;
        let attr = d.setattr(&req, req.nodeid(), args).await?;
        Ok(reply_struct(&attr))
    })
}

fn invoke_readlink(d: Arc<dyn Dispatcher>, req: RequestInfo, _payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let target = d.readlink(&req, req.nodeid()).await?;
        Ok(ReplyBody::Data(target))
    })
}

fn invoke_symlink(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (name, target) = proto::parse_two_names(&payload).ok_or(Errno::INVAL)?;
        let entry = d.symlink(&req, req.nodeid(), name, target).await?;
        Ok(reply_struct(&entry))
    })
}

fn invoke_mknod(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, rest) = parse::<proto::MknodIn>(&payload)?;
        let name = name_arg(rest)?;
        let entry = d.mknod(&req, req.nodeid(), name, args).await?;
        Ok(reply_struct(&entry))
    })
}

fn invoke_mkdir(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, rest) = parse::<proto::MkdirIn>(&payload)?;
        let name = name_arg(rest)?;
        let entry = d.mkdir(&req, req.nodeid(), name, args).await?;
        Ok(reply_struct(&entry))
    })
}

fn invoke_unlink(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let name = name_arg(&payload)?;
        d.unlink(&req, req.nodeid(), name).await?;
        Ok(ReplyBody::Empty)
    })
}

fn invoke_rmdir(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let name = name_arg(&payload)?;
        d.rmdir(&req, req.nodeid(), name).await?;
        Ok(ReplyBody::Empty)
    })
}

fn invoke_rename(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, rest) = parse::<proto::RenameIn>(&payload)?;
        let (name, newname) = proto::parse_two_names(rest).ok_or(Errno::INVAL)?;
        d.rename(&req, req.nodeid(), name, args.newdir, newname)
            .await?;
        Ok(ReplyBody::Empty)
    })
}

fn invoke_link(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, rest) = parse::<proto::LinkIn>(&payload)?;
        let newname = name_arg(rest)?;
        let entry = d.link(&req, args.oldnodeid, req.nodeid(), newname).await?;
        Ok(reply_struct(&entry))
    })
}

fn invoke_open(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, _) = parse::<proto::OpenIn>(&payload)?;
        let open = d.open(&req, req.nodeid(), args).await?;
        Ok(reply_struct(&open))
    })
}

fn invoke_read(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, _) = parse::<proto::ReadIn>(&payload)?;
        let data = d.read(&req, req.nodeid(), args).await?;
        Ok(ReplyBody::Data(data))
    })
}

fn invoke_write(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, rest) = parse::<proto::WriteIn>(&payload)?;
        if rest.len() < args.size as usize {
            return Err(Errno::INVAL);
        }
        let data = rest[..args.size as usize].to_vec();
        let written = d.write(&req, req.nodeid(), args, data).await?;
        Ok(reply_struct(&proto::WriteOut {
            size: written,
            padding: 0,
        }))
    })
}

fn invoke_statfs(d: Arc<dyn Dispatcher>, req: RequestInfo, _payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let out = d.statfs(&req, req.nodeid()).await?;
        Ok(reply_struct(&out))
    })
}

fn invoke_release(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, _) = parse::<proto::ReleaseIn>(&payload)?;
        d.release(&req, req.nodeid(), args).await?;
        Ok(ReplyBody::Empty)
    })
}

fn invoke_fsync(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, _) = parse::<proto::FsyncIn>(&payload)?;
        d.fsync(&req, req.nodeid(), args).await?;
        Ok(ReplyBody::Empty)
    })
}

fn invoke_setxattr(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, rest) = parse::<proto::SetxattrIn>(&payload)?;
        let name = name_arg(rest)?;
        let value_start = name.len() + 1;
        let value_end = value_start + args.size as usize;
        if rest.len() < value_end {
            return Err(Errno::INVAL);
        }
        let value = rest[value_start..value_end].to_vec();
        d.setxattr(&req, req.nodeid(), name, value, args).await?;
        Ok(ReplyBody::Empty)
    })
}

fn invoke_getxattr(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, rest) = parse::<proto::GetxattrIn>(&payload)?;
        let name = name_arg(rest)?;
        let reply = d.getxattr(&req, req.nodeid(), name, args.size).await?;
        Ok(xattr_reply(reply))
    })
}

fn invoke_listxattr(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, _) = parse::<proto::GetxattrIn>(&payload)?;
        let reply = d.listxattr(&req, req.nodeid(), args.size).await?;
        Ok(xattr_reply(reply))
    })
}

fn invoke_removexattr(
    d: Arc<dyn Dispatcher>,
    req: RequestInfo,
    payload: Vec<u8>,
) -> HandlerFuture {
    Box::pin(async move {
        let name = name_arg(&payload)?;
        d.removexattr(&req, req.nodeid(), name).await?;
        Ok(ReplyBody::Empty)
    })
}

fn invoke_flush(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, _) = parse::<proto::FlushIn>(&payload)?;
        d.flush(&req, req.nodeid(), args).await?;
        Ok(ReplyBody::Empty)
    })
}

fn invoke_opendir(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, _) = parse::<proto::OpenIn>(&payload)?;
        let open = d.opendir(&req, req.nodeid(), args).await?;
        Ok(reply_struct(&open))
    })
}

fn invoke_readdir(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, _) = parse::<proto::ReadIn>(&payload)?;
        let dirents = d.readdir(&req, req.nodeid(), args).await?;
        Ok(ReplyBody::Data(dirents))
    })
}

fn invoke_releasedir(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, _) = parse::<proto::ReleaseIn>(&payload)?;
        d.releasedir(&req, req.nodeid(), args).await?;
        Ok(ReplyBody::Empty)
    })
}

fn invoke_fsyncdir(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, _) = parse::<proto::FsyncIn>(&payload)?;
        d.fsyncdir(&req, req.nodeid(), args).await?;
        Ok(ReplyBody::Empty)
    })
}

fn invoke_access(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, _) = parse::<proto::AccessIn>(&payload)?;
        d.access(&req, req.nodeid(), args.mask).await?;
        Ok(ReplyBody::Empty)
    })
}

fn invoke_create(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, rest) = parse::<proto::CreateIn>(&payload)?;
        let name = name_arg(rest)?;
        let (entry, open) = d.create(&req, req.nodeid(), name, args).await?;
        Ok(ReplyBody::Segments(vec![
            struct_bytes(&entry).to_vec(),
            struct_bytes(&open).to_vec(),
        ]))
    })
}

fn invoke_bmap(d: Arc<dyn Dispatcher>, req: RequestInfo, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let (args, _) = parse::<proto::BmapIn>(&payload)?;
        let block = d.bmap(&req, req.nodeid(), args).await?;
        Ok(reply_struct(&proto::BmapOut { block }))
    })
}

/// The handler table, in opcode order.
pub static HANDLERS: &[HandlerEntry] = &[
    HandlerEntry { opcode: proto::FUSE_LOOKUP, name: "lookup", expects_reply: true, invoke: invoke_lookup },
    HandlerEntry { opcode: proto::FUSE_FORGET, name: "forget", expects_reply: false, invoke: invoke_forget },
    HandlerEntry { opcode: proto::FUSE_GETATTR, name: "getattr", expects_reply: true, invoke: invoke_getattr },
    HandlerEntry { opcode: proto::FUSE_SETATTR, name: "setattr", expects_reply: true, invoke: invoke_setattr },
    HandlerEntry { opcode: proto::FUSE_READLINK, name: "readlink", expects_reply: true, invoke: invoke_readlink },
    HandlerEntry { opcode: proto::FUSE_SYMLINK, name: "symlink", expects_reply: true, invoke: invoke_symlink },
    HandlerEntry { opcode: proto::FUSE_MKNOD, name: "mknod", expects_reply: true, invoke: invoke_mknod },
    HandlerEntry { opcode: proto::FUSE_MKDIR, name: "mkdir", expects_reply: true, invoke: invoke_mkdir },
    HandlerEntry { opcode: proto::FUSE_UNLINK, name: "unlink", expects_reply: true, invoke: invoke_unlink },
    HandlerEntry { opcode: proto::FUSE_RMDIR, name: "rmdir", expects_reply: true, invoke: invoke_rmdir },
    HandlerEntry { opcode: proto::FUSE_RENAME, name: "rename", expects_reply: true, invoke: invoke_rename },
    HandlerEntry { opcode: proto::FUSE_LINK, name: "link", expects_reply: true, invoke: invoke_link },
    HandlerEntry { opcode: proto::FUSE_OPEN, name: "open", expects_reply: true, invoke: invoke_open },
    HandlerEntry { opcode: proto::FUSE_READ, name: "read", expects_reply: true, invoke: invoke_read },
    HandlerEntry { opcode: proto::FUSE_WRITE, name: "write", expects_reply: true, invoke: invoke_write },
    HandlerEntry { opcode: proto::FUSE_STATFS, name: "statfs", expects_reply: true, invoke: invoke_statfs },
    HandlerEntry { opcode: proto::FUSE_RELEASE, name: "release", expects_reply: true, invoke: invoke_release },
    HandlerEntry { opcode: proto::FUSE_FSYNC, name: "fsync", expects_reply: true, invoke: invoke_fsync },
    HandlerEntry { opcode: proto::FUSE_SETXATTR, name: "setxattr", expects_reply: true, invoke: invoke_setxattr },
    HandlerEntry { opcode: proto::FUSE_GETXATTR, name: "getxattr", expects_reply: true, invoke: invoke_getxattr },
    HandlerEntry { opcode: proto::FUSE_LISTXATTR, name: "listxattr", expects_reply: true, invoke: invoke_listxattr },
    HandlerEntry { opcode: proto::FUSE_REMOVEXATTR, name: "removexattr", expects_reply: true, invoke: invoke_removexattr },
    HandlerEntry { opcode: proto::FUSE_FLUSH, name: "flush", expects_reply: true, invoke: invoke_flush },
    HandlerEntry { opcode: proto::FUSE_OPENDIR, name: "opendir", expects_reply: true, invoke: invoke_opendir },
    HandlerEntry { opcode: proto::FUSE_READDIR, name: "readdir", expects_reply: true, invoke: invoke_readdir },
    HandlerEntry { opcode: proto::FUSE_RELEASEDIR, name: "releasedir", expects_reply: true, invoke: invoke_releasedir },
    HandlerEntry { opcode: proto::FUSE_FSYNCDIR, name: "fsyncdir", expects_reply: true, invoke: invoke_fsyncdir },
    HandlerEntry { opcode: proto::FUSE_ACCESS, name: "access", expects_reply: true, invoke: invoke_access },
    HandlerEntry { opcode: proto::FUSE_CREATE, name: "create", expects_reply: true, invoke: invoke_create },
    HandlerEntry { opcode: proto::FUSE_BMAP, name: "bmap", expects_reply: true, invoke: invoke_bmap },
    HandlerEntry { opcode: proto::FUSE_BATCH_FORGET, name: "batch_forget", expects_reply: false, invoke: invoke_batch_forget },
];

/// Looks up the handler for an opcode.
pub fn handler_for(opcode: u32) -> Option<&'static HandlerEntry> {
    HANDLERS.iter().find(|entry| entry.opcode == opcode)
}
