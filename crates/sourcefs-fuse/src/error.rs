use thiserror::Error;

/// Errors surfaced by the kernel channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("kernel closed the session")]
    KernelClosed,

    #[error("write to fuse device failed: {0}")]
    WriteFailed(#[source] std::io::Error),

    #[error("session is already initialized")]
    AlreadyInitialized,

    #[error("session is not initialized")]
    NotInitialized,

    #[error("fuse device was already stolen")]
    DeviceStolen,

    #[error("session complete future was already taken")]
    CompleteFutureTaken,

    #[error("invalid channel configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;
