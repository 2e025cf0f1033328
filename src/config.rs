//! IPC configuration
//!
//! Tunables a Mach kernel hard-wires into `ipc_init()` are
//! collected here so a space (and every port it allocates) can be set up
//! with an explicit policy.

use crate::ipc::message::TrailerLevel;

// ============================================================================
// Compile-time limits
// ============================================================================

/// Maximum readiness consumers registered on one port set
pub const MAX_READINESS_CONSUMERS: usize = 8;

/// Default maximum size of a single message (header + body)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Default maximum number of names in one space
pub const DEFAULT_SPACE_LIMIT: usize = 65536;

/// Default maximum number of regions in one address map
pub const DEFAULT_REGION_LIMIT: usize = 4096;

/// Trailer delivered when a receive does not ask for a level
pub const DEFAULT_TRAILER: TrailerLevel = TrailerLevel::Sender;

// ============================================================================
// Policies
// ============================================================================

/// Capacity policy of a port's message queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueLimit {
    /// Always accept (best effort, the historical behaviour)
    #[default]
    Unbounded,
    /// Accept at most `n` buffered messages; senders block or fail beyond that
    Bounded(usize),
}

impl QueueLimit {
    /// Whether a queue currently holding `len` messages may accept another
    #[inline]
    pub fn admits(self, len: usize) -> bool {
        match self {
            QueueLimit::Unbounded => true,
            QueueLimit::Bounded(n) => len < n,
        }
    }
}

/// What happens to messages still queued when their port is destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeadMessagePolicy {
    /// Destroy them, releasing every right and region they carry
    #[default]
    Discard,
    /// Like `Discard`, but a message carrying a send-once reply right first
    /// turns that right into a send-once notification on the reply port
    NotifyReply,
}

// ============================================================================
// IpcConfig
// ============================================================================

/// Configuration for a space and the ports it allocates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcConfig {
    pub queue_limit: QueueLimit,
    pub dead_message_policy: DeadMessagePolicy,
    /// Copy-in rejects larger messages with `ResourceExhausted`
    pub max_message_size: usize,
    /// Upper bound on names in a `SimpleSpace`
    pub space_limit: usize,
    /// Upper bound on regions in a `SimpleMap`
    pub region_limit: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            queue_limit: QueueLimit::Unbounded,
            dead_message_policy: DeadMessagePolicy::Discard,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            space_limit: DEFAULT_SPACE_LIMIT,
            region_limit: DEFAULT_REGION_LIMIT,
        }
    }
}

impl IpcConfig {
    pub fn with_queue_limit(mut self, limit: QueueLimit) -> Self {
        self.queue_limit = limit;
        self
    }

    pub fn with_dead_message_policy(mut self, policy: DeadMessagePolicy) -> Self {
        self.dead_message_policy = policy;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_space_limit(mut self, limit: usize) -> Self {
        self.space_limit = limit;
        self
    }

    pub fn with_region_limit(mut self, limit: usize) -> Self {
        self.region_limit = limit;
        self
    }
}
