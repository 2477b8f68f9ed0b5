use std::fmt;

use serde::{Deserialize, Serialize};

/// Priority of an import request.
/// Higher priorities are dequeued first; ties break FIFO.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum ImportPriority {
    /// Background work - prefetch sweeps, cache warming.
    Low = 0,
    /// Ordinary imports triggered by filesystem activity.
    Normal = 1,
    /// Imports a user-visible operation is blocked on.
    High = 2,
}

impl ImportPriority {
    /// The default priority for imports.
    pub const fn normal() -> Self {
        ImportPriority::Normal
    }
}

impl Default for ImportPriority {
    fn default() -> Self {
        ImportPriority::normal()
    }
}

impl fmt::Display for ImportPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportPriority::Low => write!(f, "low"),
            ImportPriority::Normal => write!(f, "normal"),
            ImportPriority::High => write!(f, "high"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(ImportPriority::Low < ImportPriority::Normal);
        assert!(ImportPriority::Normal < ImportPriority::High);
    }

    #[test]
    fn test_default_is_normal() {
        assert_eq!(ImportPriority::default(), ImportPriority::normal());
    }

    #[test]
    fn test_display() {
        assert_eq!(ImportPriority::High.to_string(), "high");
        assert_eq!(ImportPriority::Normal.to_string(), "normal");
        assert_eq!(ImportPriority::Low.to_string(), "low");
    }
}
