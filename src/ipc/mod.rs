//! Mach-style Inter-Process Communication
//!
//! All communication happens through ports. The pieces, leaf first:
//!
//! - [`message`]: the user-visible wire format (header, descriptors, trailer)
//! - [`kmsg`]: the kernel-held form of a message and its copy-in/copy-out
//! - [`mqueue`]: the FIFO of kernel messages owned by a port
//! - [`port`] / [`pset`]: ports, port sets and their membership protocol
//! - [`mach_msg`]: the combined send/receive entry point
//!
//! Names are per-space and translated by an [`space::IpcSpace`]
//! collaborator; kernel objects are identified by address only.

use core::fmt;

use thiserror::Error;

pub mod entry;
pub mod kmsg;
pub mod mach_msg;
pub mod message;
pub mod mqueue;
pub mod notify;
pub mod port;
pub mod pset;
pub mod right;
pub mod space;

pub use kmsg::IpcKmsg;
pub use port::Port;
pub use pset::PortSet;
pub use right::{MsgTypeName, PortRight, RightKind};

// ============================================================================
// Port names
// ============================================================================

/// Port name type (like Mach's mach_port_name_t)
///
/// A name only means something inside the space that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PortName(u32);

impl PortName {
    /// MACH_PORT_NULL
    pub const NULL: Self = Self(0);
    /// MACH_PORT_DEAD
    pub const DEAD: Self = Self(u32::MAX);

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn is_dead(self) -> bool {
        self == Self::DEAD
    }

    /// Neither null nor dead
    pub fn is_valid(self) -> bool {
        !self.is_null() && !self.is_dead()
    }
}

impl fmt::Display for PortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// IPC error kinds
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    #[error("invalid capability")]
    InvalidCapability,

    #[error("invalid memory region")]
    InvalidMemory,

    #[error("malformed message header or descriptor")]
    InvalidHeader,

    #[error("scatter list does not fit the message")]
    InvalidScatterList,

    #[error("message smaller than its header")]
    MessageTooSmall,

    #[error("message larger than the receive buffer")]
    TooLarge,

    #[error("operation would block")]
    WouldBlock,

    #[error("operation timed out")]
    TimedOut,

    #[error("operation interrupted")]
    Interrupted,

    #[error("port or port set is dead")]
    ObjectDied,

    #[error("port is not in a port set")]
    NotInSet,

    #[error("port is already in a port set")]
    AlreadyInSet,

    #[error("resource exhausted")]
    ResourceExhausted,

    #[error("message queue full")]
    QueueFull,
}

impl IpcError {
    /// Conditions a caller may simply try again after
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            IpcError::WouldBlock | IpcError::TimedOut | IpcError::Interrupted | IpcError::QueueFull
        )
    }
}

/// Result type for IPC operations
pub type IpcResult<T> = Result<T, IpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_name_states() {
        assert!(PortName::NULL.is_null());
        assert!(PortName::DEAD.is_dead());
        assert!(!PortName::DEAD.is_valid());
        assert!(PortName::from_raw(0x103).is_valid());
        assert_eq!(PortName::from_raw(0x103).to_string(), "0x103");
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(IpcError::TimedOut.is_retryable());
        assert!(IpcError::Interrupted.is_retryable());
        assert!(!IpcError::ObjectDied.is_retryable());
        assert!(!IpcError::InvalidCapability.is_retryable());
    }
}
