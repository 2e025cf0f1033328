//! IPC Notifications - Kernel-generated messages and readiness signalling
//!
//! Based on Mach4 ipc/ipc_notify.c
//!
//! Two kinds of notification live here:
//!
//! - Mach notification message ids, used for the header-only messages the
//!   kernel synthesises (send-once notifications for dead reply rights,
//!   the port-destroyed notice returned to a receiver whose port died).
//! - The readiness bridge: an external event multiplexer (the kqueue
//!   EVFILT_MACHPORT analogue) registers a [`ReadinessConsumer`] on a port
//!   set and is told when a member gains a message.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::pset::PortSet;
use super::IpcResult;

// ============================================================================
// Notification Types
// ============================================================================

/// Types of port notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum NotifyType {
    /// A name's right was deleted
    PortDeleted = 0x0041,
    /// A receive right was destroyed
    PortDestroyed = 0x0045,
    /// No more send rights exist
    NoSenders = 0x0046,
    /// A send-once right was destroyed unused
    SendOnce = 0x0047,
    /// A send right's port died
    DeadName = 0x0048,
}

impl NotifyType {
    /// Get message ID for this notification type
    pub fn msg_id(self) -> i32 {
        self as i32
    }

    pub fn from_msg_id(id: i32) -> Option<Self> {
        match id {
            0x0041 => Some(Self::PortDeleted),
            0x0045 => Some(Self::PortDestroyed),
            0x0046 => Some(Self::NoSenders),
            0x0047 => Some(Self::SendOnce),
            0x0048 => Some(Self::DeadName),
            _ => None,
        }
    }
}

// ============================================================================
// Readiness bridge
// ============================================================================

/// Receiver of edge-triggered "port set has a message" signals
///
/// Callbacks run with no IPC locks held but on the signalling thread, so
/// they must not block. Re-entering the IPC core from a callback is
/// allowed.
pub trait ReadinessConsumer: Send + Sync {
    /// A member of the set gained a deliverable message
    fn ready(&self);

    /// The set was destroyed; no further `ready` calls will follow
    fn closed(&self) {}
}

/// Register `consumer` for readiness signals from `set`
pub fn register_readiness_consumer(
    set: &PortSet,
    consumer: Arc<dyn ReadinessConsumer>,
) -> IpcResult<()> {
    set.register_readiness_consumer(consumer)
}

/// A latch consumer: records that a signal arrived until taken
#[derive(Debug, Default)]
pub struct ReadyLatch {
    ready: AtomicBool,
    closed: AtomicBool,
    signals: AtomicUsize,
}

impl ReadyLatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Consume the pending edge, if any
    pub fn take(&self) -> bool {
        self.ready.swap(false, Ordering::AcqRel)
    }

    /// Total signals seen
    pub fn signals(&self) -> usize {
        self.signals.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl ReadinessConsumer for ReadyLatch {
    fn ready(&self) {
        self.signals.fetch_add(1, Ordering::AcqRel);
        self.ready.store(true, Ordering::Release);
    }

    fn closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
