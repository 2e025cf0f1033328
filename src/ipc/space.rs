//! IPC Space - Per-task IPC capability namespace
//!
//! Based on Mach4 ipc/ipc_space.h and ipc/ipc_right.c
//!
//! The IPC core only ever talks to a space through the [`IpcSpace`]
//! trait: turning a (name, disposition) pair into a kernel-held
//! [`PortRight`] on copy-in, installing a right under a fresh name on
//! copy-out, and finding the port or port set a receive names.
//!
//! [`SimpleSpace`] is a table-backed implementation of that contract with
//! Mach's naming rules: receive and send rights for one port share a
//! name (send rights counted in user references), every send-once right
//! gets a name of its own, and port sets have names too.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use spin::Mutex;

use crate::config::IpcConfig;

use super::entry::{IpcEntryTable, IpcObject};
use super::port::Port;
use super::pset::PortSet;
use super::right::{MsgTypeName, PortRight, RightKind};
use super::{IpcError, IpcResult, PortName};

/// Space ID type - newtype for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SpaceId(pub u64);

/// What a receive names
#[derive(Debug, Clone)]
pub enum ReceiveTarget {
    Port(Arc<Port>),
    PortSet(Arc<PortSet>),
}

// ============================================================================
// IpcSpace - the capability lookup contract
// ============================================================================

/// Name <-> right translation for one task
pub trait IpcSpace: Send + Sync {
    /// Produce a kernel right from `name` per `disposition`
    ///
    /// Move dispositions take the right out of the space; copy and make
    /// dispositions leave it in place. Fails with `InvalidCapability` if
    /// the name is unknown, dead, or holds the wrong kind of right.
    fn resolve_name(&self, name: PortName, disposition: MsgTypeName) -> IpcResult<PortRight>;

    /// Whether `resolve_name(name, disposition)` would succeed, without
    /// touching the space
    fn check_name(&self, name: PortName, disposition: MsgTypeName) -> IpcResult<()>;

    /// Install `right` under a name and return it
    ///
    /// A right for a dead port is consumed and yields `PortName::DEAD`.
    fn insert_name(&self, right: PortRight) -> IpcResult<PortName>;

    /// The port or port set a receive on `name` waits on
    fn lookup_receive(&self, name: PortName) -> IpcResult<ReceiveTarget>;

    /// The name under which this space holds the receive right for `port`
    fn receive_name(&self, port: &Arc<Port>) -> Option<PortName>;
}

// ============================================================================
// SimpleSpace
// ============================================================================

/// Next space ID counter
static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(1);

/// Table-backed IPC space
#[derive(Debug)]
pub struct SimpleSpace {
    /// Unique space identifier
    id: SpaceId,

    active: AtomicBool,

    config: IpcConfig,

    /// Entry table
    table: Mutex<IpcEntryTable>,
}

impl SimpleSpace {
    /// Create a new IPC space
    pub fn new() -> Arc<Self> {
        Self::with_config(IpcConfig::default())
    }

    pub fn with_config(config: IpcConfig) -> Arc<Self> {
        Arc::new(Self {
            id: SpaceId(NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed)),
            active: AtomicBool::new(true),
            config,
            table: Mutex::new(IpcEntryTable::new(config.space_limit)),
        })
    }

    /// Get space ID
    #[inline]
    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    fn check_active(&self) -> IpcResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(IpcError::ObjectDied)
        }
    }

    /// Number of names in use
    pub fn name_count(&self) -> usize {
        self.table.lock().active_count()
    }

    // ========================================================================
    // mach_port_* style operations
    // ========================================================================

    /// Create a port and name its receive right (mach_port_allocate)
    pub fn allocate_receive(&self) -> IpcResult<PortName> {
        self.check_active()?;
        self.insert_name(Port::allocate_receive_with(&self.config))
    }

    /// Create a port set and name it
    pub fn allocate_port_set(&self) -> IpcResult<PortName> {
        self.check_active()?;
        let set = PortSet::allocate();
        let result = self.table.lock().alloc(IpcObject::PortSet(set.clone()), 0);
        if result.is_err() {
            set.destroy();
        }
        result
    }

    /// Add a send right to the name holding a receive right
    pub fn make_send(&self, name: PortName) -> IpcResult<PortName> {
        let right = self.resolve_name(name, MsgTypeName::MakeSend)?;
        self.insert_name(right)
    }

    /// Drop one user reference (mach_port_deallocate)
    ///
    /// Applies to send, send-once and dead names. A receive right has to
    /// go through [`SimpleSpace::destroy`].
    pub fn deallocate(&self, name: PortName) -> IpcResult<()> {
        let garbage = {
            let mut table = self.table.lock();
            let entry = table.lookup_mut(name).ok_or(IpcError::InvalidCapability)?;
            match entry.object() {
                IpcObject::SendOnce(_) => Some(table.dealloc(name)?),
                IpcObject::Port {
                    receive,
                    send: Some(_),
                } => {
                    let last_name_ref = receive.is_none() && entry.urefs() <= 1;
                    if last_name_ref {
                        Some(table.dealloc(name)?)
                    } else if entry.remove_urefs(1)? {
                        take_send(entry.object_mut()).map(|right| IpcObject::Port {
                            receive: None,
                            send: Some(right),
                        })
                    } else {
                        None
                    }
                }
                _ => return Err(IpcError::InvalidCapability),
            }
        };
        drop(garbage);
        Ok(())
    }

    /// Remove a name and every right it holds (mach_port_destroy)
    ///
    /// Destroying a receive right destroys the port; destroying a port set
    /// name destroys the set.
    pub fn destroy(&self, name: PortName) -> IpcResult<()> {
        let object = self.table.lock().dealloc(name)?;
        dispose(object);
        Ok(())
    }

    /// Move the port named `port_name` into the set `set_name`, or out of
    /// any set when `set_name` is null (mach_port_move_member)
    pub fn move_member(&self, port_name: PortName, set_name: PortName) -> IpcResult<()> {
        let port = match self.lookup_receive(port_name)? {
            ReceiveTarget::Port(port) => port,
            ReceiveTarget::PortSet(_) => return Err(IpcError::InvalidCapability),
        };
        if set_name.is_null() {
            return PortSet::move_port(&port, None);
        }
        let set = self
            .port_set(set_name)
            .ok_or(IpcError::InvalidCapability)?;
        PortSet::move_port(&port, Some(&set))
    }

    /// User references of the send right under `name`
    pub fn urefs(&self, name: PortName) -> Option<u16> {
        self.table.lock().lookup(name).map(|entry| entry.urefs())
    }

    /// Entry type bits of `name` (MACH_PORT_TYPE_*)
    pub fn entry_type(&self, name: PortName) -> Option<u32> {
        self.table.lock().lookup(name).map(|entry| entry.entry_type())
    }

    /// The port named by `name`, whatever right is held
    pub fn port(&self, name: PortName) -> Option<Arc<Port>> {
        self.table
            .lock()
            .lookup(name)
            .and_then(|entry| entry.object().port().cloned())
    }

    pub fn port_set(&self, name: PortName) -> Option<Arc<PortSet>> {
        match self.table.lock().lookup(name)?.object() {
            IpcObject::PortSet(set) => Some(set.clone()),
            _ => None,
        }
    }

    /// Tear the space down, destroying every right it holds
    pub fn terminate(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let objects = self.table.lock().drain();
        debug!("space {:?} terminated, {} name(s) released", self.id, objects.len());
        objects.into_iter().for_each(dispose);
    }
}

impl Drop for SimpleSpace {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Take the send right out of an entry that keeps its receive right
fn take_send(object: &mut IpcObject) -> Option<PortRight> {
    match object {
        IpcObject::Port { send, .. } => send.take(),
        _ => None,
    }
}

/// Release what a name held, outside the table lock
fn dispose(object: IpcObject) {
    if let IpcObject::PortSet(set) = object {
        set.destroy();
    }
}

impl IpcSpace for SimpleSpace {
    fn resolve_name(&self, name: PortName, disposition: MsgTypeName) -> IpcResult<PortRight> {
        self.check_active()?;
        let mut garbage = None;
        let result = {
            let mut table = self.table.lock();
            let entry = table.lookup_mut(name).ok_or(IpcError::InvalidCapability)?;

            match (disposition, entry.object_mut()) {
                (MsgTypeName::MakeSend | MsgTypeName::MakeSendOnce, IpcObject::Port { receive: Some(receive), .. }) => {
                    receive.derive(disposition)
                }
                (MsgTypeName::CopySend, IpcObject::Port { send: Some(send), .. }) => {
                    send.derive(disposition)
                }
                (MsgTypeName::MoveSend, IpcObject::Port { send: Some(send), receive }) => {
                    let keeps_name = receive.is_some();
                    if !send.is_active() {
                        Err(IpcError::InvalidCapability)
                    } else if entry.urefs() > 1 {
                        entry.remove_urefs(1)?;
                        match entry.object() {
                            IpcObject::Port { send: Some(send), .. } => {
                                send.derive(MsgTypeName::CopySend)
                            }
                            _ => Err(IpcError::InvalidCapability),
                        }
                    } else if keeps_name {
                        entry.remove_urefs(1)?;
                        take_send(entry.object_mut()).ok_or(IpcError::InvalidCapability)
                    } else {
                        match table.dealloc(name)? {
                            IpcObject::Port {
                                send: Some(right), ..
                            } => Ok(right),
                            other => {
                                garbage = Some(other);
                                Err(IpcError::InvalidCapability)
                            }
                        }
                    }
                }
                (MsgTypeName::MoveReceive, IpcObject::Port { receive, send }) if receive.is_some() => {
                    if send.is_some() {
                        receive.take().ok_or(IpcError::InvalidCapability)
                    } else {
                        match table.dealloc(name)? {
                            IpcObject::Port {
                                receive: Some(right),
                                ..
                            } => Ok(right),
                            other => {
                                garbage = Some(other);
                                Err(IpcError::InvalidCapability)
                            }
                        }
                    }
                }
                (MsgTypeName::MoveSendOnce, IpcObject::SendOnce(right)) => {
                    if right.is_active() {
                        match table.dealloc(name)? {
                            IpcObject::SendOnce(right) => Ok(right),
                            other => {
                                garbage = Some(other);
                                Err(IpcError::InvalidCapability)
                            }
                        }
                    } else {
                        Err(IpcError::InvalidCapability)
                    }
                }
                _ => Err(IpcError::InvalidCapability),
            }
        };
        drop(garbage);

        let right = result?;
        if disposition == MsgTypeName::MoveReceive {
            // A receive right in flight belongs to no set.
            let _ = PortSet::move_port(right.port(), None);
        }
        Ok(right)
    }

    fn check_name(&self, name: PortName, disposition: MsgTypeName) -> IpcResult<()> {
        self.check_active()?;
        let table = self.table.lock();
        let entry = table.lookup(name).ok_or(IpcError::InvalidCapability)?;
        let usable = match (disposition, entry.object()) {
            (
                MsgTypeName::MakeSend | MsgTypeName::MakeSendOnce | MsgTypeName::MoveReceive,
                IpcObject::Port {
                    receive: Some(receive),
                    ..
                },
            ) => receive.is_active(),
            (
                MsgTypeName::CopySend | MsgTypeName::MoveSend,
                IpcObject::Port {
                    send: Some(send), ..
                },
            ) => send.is_active(),
            (MsgTypeName::MoveSendOnce, IpcObject::SendOnce(right)) => right.is_active(),
            _ => false,
        };
        if usable {
            Ok(())
        } else {
            Err(IpcError::InvalidCapability)
        }
    }

    fn insert_name(&self, right: PortRight) -> IpcResult<PortName> {
        self.check_active()?;
        if !right.is_active() {
            return Ok(PortName::DEAD);
        }

        let mut surplus = None;
        let result = {
            let mut table = self.table.lock();
            let existing = match right.kind() {
                RightKind::SendOnce => None,
                _ => table.find_port(right.port()),
            };

            match existing {
                Some(name) => {
                    let entry = table.lookup_mut(name).ok_or(IpcError::InvalidCapability)?;
                    let kind = right.kind();
                    match (kind, entry.object_mut()) {
                        (RightKind::Send, IpcObject::Port { send: Some(_), .. }) => {
                            // Merged: the extra send right becomes a user reference.
                            surplus = Some(right);
                            entry.add_urefs(1).map(|_| name)
                        }
                        (RightKind::Send, IpcObject::Port { send: slot @ None, .. }) => {
                            *slot = Some(right);
                            entry.add_urefs(1).map(|_| name)
                        }
                        (RightKind::Receive, IpcObject::Port { receive: slot @ None, .. }) => {
                            *slot = Some(right);
                            Ok(name)
                        }
                        _ => {
                            surplus = Some(right);
                            Err(IpcError::InvalidCapability)
                        }
                    }
                }
                None => {
                    let (object, urefs) = match right.kind() {
                        RightKind::SendOnce => (IpcObject::SendOnce(right), 0),
                        RightKind::Send => (
                            IpcObject::Port {
                                receive: None,
                                send: Some(right),
                            },
                            1,
                        ),
                        RightKind::Receive => (
                            IpcObject::Port {
                                receive: Some(right),
                                send: None,
                            },
                            0,
                        ),
                    };
                    table.alloc(object, urefs)
                }
            }
        };
        drop(surplus);
        result
    }

    fn lookup_receive(&self, name: PortName) -> IpcResult<ReceiveTarget> {
        self.check_active()?;
        let table = self.table.lock();
        match table.lookup(name).map(|entry| entry.object()) {
            Some(IpcObject::Port {
                receive: Some(receive),
                ..
            }) => Ok(ReceiveTarget::Port(receive.port().clone())),
            Some(IpcObject::PortSet(set)) => Ok(ReceiveTarget::PortSet(set.clone())),
            _ => Err(IpcError::InvalidCapability),
        }
    }

    fn receive_name(&self, port: &Arc<Port>) -> Option<PortName> {
        let table = self.table.lock();
        let name = table.find_port(port)?;
        table
            .lookup(name)
            .filter(|entry| entry.has_receive())
            .map(|_| name)
    }
}
