//! IPC Rights - Kernel-held port capabilities
//!
//! Based on Mach4 ipc/ipc_right.c
//!
//! A [`PortRight`] is the kernel-side form of a capability while it is
//! not sitting in any space: inside a message in flight, or on its way
//! between a space and a message. It owns one port reference and one
//! unit of the port's send / send-once count, and gives both back exactly
//! once when dropped. Dropping a receive right destroys the port.

use std::fmt;
use std::sync::Arc;

use super::port::Port;
use super::{IpcError, IpcResult};

// ============================================================================
// Right Types for Message Passing
// ============================================================================

/// Message type names - how a right appears in a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgTypeName {
    /// Move receive right
    MoveReceive = 16,
    /// Move send right
    MoveSend = 17,
    /// Move send-once right
    MoveSendOnce = 18,
    /// Copy send right
    CopySend = 19,
    /// Make send right (from receive)
    MakeSend = 20,
    /// Make send-once right (from receive)
    MakeSendOnce = 21,
}

impl MsgTypeName {
    /// Convert from u32
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            16 => Some(MsgTypeName::MoveReceive),
            17 => Some(MsgTypeName::MoveSend),
            18 => Some(MsgTypeName::MoveSendOnce),
            19 => Some(MsgTypeName::CopySend),
            20 => Some(MsgTypeName::MakeSend),
            21 => Some(MsgTypeName::MakeSendOnce),
            _ => None,
        }
    }

    /// Check if this type name moves the right (vs copies)
    pub fn is_move(&self) -> bool {
        matches!(
            self,
            MsgTypeName::MoveReceive | MsgTypeName::MoveSend | MsgTypeName::MoveSendOnce
        )
    }

    /// Check if this creates a new right from receive
    pub fn is_make(&self) -> bool {
        matches!(self, MsgTypeName::MakeSend | MsgTypeName::MakeSendOnce)
    }

    /// The kind of right this disposition produces in the message
    pub fn result_kind(&self) -> RightKind {
        match self {
            MsgTypeName::MoveReceive => RightKind::Receive,
            MsgTypeName::MoveSend | MsgTypeName::CopySend | MsgTypeName::MakeSend => {
                RightKind::Send
            }
            MsgTypeName::MoveSendOnce | MsgTypeName::MakeSendOnce => RightKind::SendOnce,
        }
    }
}

/// Kinds of port right a task can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RightKind {
    Send,
    SendOnce,
    /// Only one per port
    Receive,
}

impl RightKind {
    /// The type name a receiver sees for a right of this kind
    pub fn received_type(self) -> MsgTypeName {
        match self {
            RightKind::Send => MsgTypeName::MoveSend,
            RightKind::SendOnce => MsgTypeName::MoveSendOnce,
            RightKind::Receive => MsgTypeName::MoveReceive,
        }
    }

    /// The move disposition that takes a right of this kind back out of a space
    pub fn move_disposition(self) -> MsgTypeName {
        self.received_type()
    }
}

// ============================================================================
// PortRight
// ============================================================================

/// One counted capability on a port
pub struct PortRight {
    port: Arc<Port>,
    kind: RightKind,
}

impl PortRight {
    /// Wrap a port reference the caller already holds
    ///
    /// The send / send-once count must already account for this right.
    pub(crate) fn adopt(port: Arc<Port>, kind: RightKind) -> Self {
        Self { port, kind }
    }

    /// Mint a new send right
    pub fn new_send(port: &Arc<Port>) -> Self {
        port.reference();
        port.srights_inc();
        Self::adopt(port.clone(), RightKind::Send)
    }

    /// Mint a new send-once right
    pub fn new_send_once(port: &Arc<Port>) -> Self {
        port.reference();
        port.sorights_inc();
        Self::adopt(port.clone(), RightKind::SendOnce)
    }

    pub fn port(&self) -> &Arc<Port> {
        &self.port
    }

    pub fn kind(&self) -> RightKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.port.is_active()
    }

    /// Produce a new right from this one per a copy or make disposition
    ///
    /// `CopySend` needs a send right, `MakeSend`/`MakeSendOnce` need the
    /// receive right. Move dispositions are the space's business and are
    /// rejected here.
    pub fn derive(&self, disposition: MsgTypeName) -> IpcResult<PortRight> {
        if !self.port.is_active() {
            return Err(IpcError::InvalidCapability);
        }
        match (disposition, self.kind) {
            (MsgTypeName::CopySend, RightKind::Send) => Ok(Self::new_send(&self.port)),
            (MsgTypeName::MakeSend, RightKind::Receive) => Ok(Self::new_send(&self.port)),
            (MsgTypeName::MakeSendOnce, RightKind::Receive) => Ok(Self::new_send_once(&self.port)),
            _ => Err(IpcError::InvalidCapability),
        }
    }

    /// Whether this and `other` name the same port
    pub fn same_port(&self, other: &Arc<Port>) -> bool {
        Arc::ptr_eq(&self.port, other)
    }
}

impl Drop for PortRight {
    fn drop(&mut self) {
        match self.kind {
            RightKind::Send => self.port.srights_dec(),
            RightKind::SendOnce => self.port.sorights_dec(),
            RightKind::Receive => self.port.destroy(),
        }
        self.port.release();
    }
}

impl fmt::Debug for PortRight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortRight")
            .field("port", &Arc::as_ptr(&self.port))
            .field("kind", &self.kind)
            .finish()
    }
}
