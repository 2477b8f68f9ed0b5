//! Negotiated connection state and channel configuration.

use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, Result};
use crate::proto;

/// Capability flags this channel understands and is willing to enable.
pub const SUPPORTED_FLAGS: u32 = proto::FUSE_ASYNC_READ
    | proto::FUSE_ATOMIC_O_TRUNC
    | proto::FUSE_BIG_WRITES
    | proto::FUSE_AUTO_INVAL_DATA
    | proto::FUSE_ASYNC_DIO
    | proto::FUSE_PARALLEL_DIROPS
    | proto::FUSE_CACHE_SYMLINKS;

/// Connection parameters negotiated once at INIT (or handed over during a
/// graceful-restart takeover). Immutable after initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnInfo {
    /// Negotiated protocol major version.
    pub major: u32,
    /// Negotiated protocol minor version.
    pub minor: u32,
    /// Read-ahead window granted to the kernel.
    pub max_readahead: u32,
    /// Capability flags both sides agreed on.
    pub flags: u32,
    /// Maximum number of backgrounded kernel requests.
    pub max_background: u16,
    /// Kernel congestion threshold.
    pub congestion_threshold: u16,
    /// Largest write payload the kernel may send.
    pub max_write: u32,
}

impl ConnInfo {
    /// Builds the INIT reply body carrying this negotiated state.
    pub fn to_init_out(self) -> proto::InitOut {
        proto::InitOut {
            major: self.major,
            minor: self.minor,
            max_readahead: self.max_readahead,
            flags: self.flags,
            max_background: self.max_background,
            congestion_threshold: self.congestion_threshold,
            max_write: self.max_write,
            time_gran: 1,
            max_pages: ((self.max_write + 4095) / 4096) as u16,
            map_alignment: 0,
            unused: [0; 8],
        }
    }

    /// How many bytes of the INIT reply body the kernel expects for the
    /// negotiated minor version. Old kernels reject full-size replies.
    pub fn init_out_size(self) -> usize {
        if self.minor < 5 {
            proto::COMPAT_INIT_OUT_SIZE
        } else if self.minor < 23 {
            proto::COMPAT_22_INIT_OUT_SIZE
        } else {
            std::mem::size_of::<proto::InitOut>()
        }
    }
}

/// Configuration for the kernel channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Number of device reader threads.
    pub worker_threads: usize,
    /// Largest write payload to advertise at INIT.
    pub max_write: u32,
    /// Read-ahead window to grant the kernel.
    pub max_readahead: u32,
    /// Maximum number of backgrounded kernel requests.
    pub max_background: u16,
    /// Kernel congestion threshold.
    pub congestion_threshold: u16,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            worker_threads: 4,
            max_write: 128 * 1024,
            max_readahead: 128 * 1024,
            max_background: 16,
            congestion_threshold: 16,
        }
    }
}

/// Validates a channel configuration.
pub fn validate_config(config: &ChannelConfig) -> Result<()> {
    if config.worker_threads == 0 {
        return Err(ChannelError::InvalidConfig(
            "worker_threads must be >= 1".to_string(),
        ));
    }
    if config.max_write < 4096 {
        return Err(ChannelError::InvalidConfig(
            "max_write must be >= 4096".to_string(),
        ));
    }
    Ok(())
}

/// Negotiates connection parameters from the kernel's INIT request.
///
/// Chooses the minimum of the two sides' protocol versions and the
/// intersection of capability flags.
pub fn negotiate(init: &proto::InitIn, config: &ChannelConfig) -> Result<ConnInfo> {
    if init.major != proto::KERNEL_VERSION {
        return Err(ChannelError::ProtocolViolation(format!(
            "unsupported kernel protocol major version {}",
            init.major
        )));
    }
    Ok(ConnInfo {
        major: proto::KERNEL_VERSION.min(init.major),
        minor: proto::KERNEL_MINOR_VERSION.min(init.minor),
        max_readahead: init.max_readahead.min(config.max_readahead),
        flags: init.flags & SUPPORTED_FLAGS,
        max_background: config.max_background,
        congestion_threshold: config.congestion_threshold,
        max_write: config.max_write,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel_init(minor: u32, flags: u32) -> proto::InitIn {
        proto::InitIn {
            major: 7,
            minor,
            max_readahead: 1 << 20,
            flags,
        }
    }

    #[test]
    fn test_negotiate_takes_minimum_minor() {
        let config = ChannelConfig::default();

        let conn = negotiate(&kernel_init(19, 0), &config).unwrap();
        assert_eq!(conn.minor, 19);

        let conn = negotiate(&kernel_init(99, 0), &config).unwrap();
        assert_eq!(conn.minor, proto::KERNEL_MINOR_VERSION);
    }

    #[test]
    fn test_negotiate_intersects_flags() {
        let config = ChannelConfig::default();
        let offered = SUPPORTED_FLAGS | proto::FUSE_POSIX_LOCKS | proto::FUSE_DONT_MASK;
        let conn = negotiate(&kernel_init(31, offered), &config).unwrap();
        assert_eq!(conn.flags, SUPPORTED_FLAGS);
        assert_eq!(conn.flags & proto::FUSE_POSIX_LOCKS, 0);
    }

    #[test]
    fn test_negotiate_rejects_wrong_major() {
        let config = ChannelConfig::default();
        let init = proto::InitIn {
            major: 6,
            minor: 8,
            max_readahead: 0,
            flags: 0,
        };
        assert!(matches!(
            negotiate(&init, &config),
            Err(ChannelError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_negotiate_clamps_readahead() {
        let config = ChannelConfig {
            max_readahead: 64 * 1024,
            ..Default::default()
        };
        let conn = negotiate(&kernel_init(31, 0), &config).unwrap();
        assert_eq!(conn.max_readahead, 64 * 1024);
    }

    #[test]
    fn test_init_out_size_tracks_minor_version() {
        let mut conn = negotiate(&kernel_init(31, 0), &ChannelConfig::default()).unwrap();
        assert_eq!(conn.init_out_size(), std::mem::size_of::<proto::InitOut>());

        conn.minor = 22;
        assert_eq!(conn.init_out_size(), proto::COMPAT_22_INIT_OUT_SIZE);

        conn.minor = 4;
        assert_eq!(conn.init_out_size(), proto::COMPAT_INIT_OUT_SIZE);
    }

    #[test]
    fn test_init_out_carries_negotiated_values() {
        let config = ChannelConfig::default();
        let conn = negotiate(&kernel_init(31, SUPPORTED_FLAGS), &config).unwrap();
        let out = conn.to_init_out();
        assert_eq!(out.major, 7);
        assert_eq!(out.minor, 31);
        assert_eq!(out.max_write, config.max_write);
        assert_eq!(out.max_pages, 32);
    }

    #[test]
    fn test_validate_config_rejects_zero_workers() {
        let config = ChannelConfig {
            worker_threads: 0,
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_config_rejects_tiny_max_write() {
        let config = ChannelConfig {
            max_write: 1024,
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_config_accepts_defaults() {
        assert!(validate_config(&ChannelConfig::default()).is_ok());
    }
}
