#![warn(missing_docs)]

//! SourceFS FUSE kernel channel.
//!
//! Owns the kernel device descriptor and speaks the FUSE wire protocol
//! over it: a pool of worker threads decodes requests, routes them through
//! a pluggable [`Dispatcher`], and writes replies with gathered writes.
//! Supports graceful-restart takeover of an already-negotiated session.

/// Channel lifecycle, worker pool, reply writer, invalidations.
pub mod channel;
/// Negotiated connection info and channel configuration.
pub mod conn;
/// Filesystem semantics contract invoked per opcode.
pub mod dispatcher;
/// Error types and result handling.
pub mod error;
/// Opcode handler table.
pub mod handlers;
/// FUSE ABI structs, opcodes, and payload parsing.
pub mod proto;
/// In-flight request registry and cancellation contexts.
pub mod request;

pub use channel::{FuseChannel, TakenDevice};
pub use conn::{validate_config, ChannelConfig, ConnInfo};
pub use dispatcher::{DispatchResult, Dispatcher, Errno, XattrReply};
pub use error::{ChannelError, Result};
pub use request::RequestInfo;
