//! Unified error type for the EmberOS kernel
//!
//! Every fallible core operation returns [`KernelResult`]. The variants
//! mirror the failure classes the subsystems actually surface; anything
//! outside this set is an invariant violation and panics instead.

use core::fmt;

/// Kernel error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// An allocator ran out of memory
    OutOfMemory { requested: usize },
    /// A caller passed an argument outside the operation's domain
    InvalidArgument { what: &'static str },
    /// The named resource does not exist
    NotFound { what: &'static str },
    /// The named resource already exists
    AlreadyExists { what: &'static str },
    /// A directory operation was applied to a non-directory node
    NotADirectory,
    /// A file operation was applied to a directory node
    IsADirectory,
    /// A bounded wait expired
    Timeout { operation: &'static str },
    /// The operation is not permitted on this object
    Permission { operation: &'static str },
    /// A device reported an error
    Hardware { device: &'static str, code: u32 },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory: requested {} bytes", requested)
            }
            Self::InvalidArgument { what } => write!(f, "invalid argument: {}", what),
            Self::NotFound { what } => write!(f, "not found: {}", what),
            Self::AlreadyExists { what } => write!(f, "already exists: {}", what),
            Self::NotADirectory => write!(f, "not a directory"),
            Self::IsADirectory => write!(f, "is a directory"),
            Self::Timeout { operation } => write!(f, "timeout during {}", operation),
            Self::Permission { operation } => write!(f, "permission denied for {}", operation),
            Self::Hardware { device, code } => {
                write!(f, "hardware error on {}: code {:#x}", device, code)
            }
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn display_carries_context() {
        let e = KernelError::Hardware {
            device: "nvme0",
            code: 0x4002,
        };
        assert_eq!(format!("{}", e), "hardware error on nvme0: code 0x4002");

        let e = KernelError::OutOfMemory { requested: 4096 };
        assert!(format!("{}", e).contains("4096"));
    }
}
