//! IPC Entry - Port name to capability translation
//!
//! Based on Mach4 ipc/ipc_entry.h
//! Each ipc_entry records a capability (port right) in a task's IPC space.
//! Entries are stored in a table indexed by the low bits of the port name;
//! the high byte of the name is the entry's generation, so a stale name
//! stops resolving once its entry is reused.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::port::Port;
use super::pset::PortSet;
use super::right::PortRight;
use super::{IpcError, IpcResult, PortName};

/// Entry bits field type
pub type IpcEntryBits = u32;

// ============================================================================
// Entry Bits Constants (from Mach4 ipc_entry.h)
// ============================================================================

/// Mask for user references (16 bits)
pub const IE_BITS_UREFS_MASK: u32 = 0x0000_FFFF;

/// Extract user references from bits
#[inline]
pub const fn ie_bits_urefs(bits: IpcEntryBits) -> u16 {
    (bits & IE_BITS_UREFS_MASK) as u16
}

/// Mask for capability type (5 bits)
pub const IE_BITS_TYPE_MASK: u32 = 0x001F_0000;

/// Extract type from bits
#[inline]
pub const fn ie_bits_type(bits: IpcEntryBits) -> u32 {
    bits & IE_BITS_TYPE_MASK
}

/// Mask for generation number (8 bits)
pub const IE_BITS_GEN_MASK: u32 = 0xFF00_0000;

/// Extract generation from bits
#[inline]
pub const fn ie_bits_gen(bits: IpcEntryBits) -> u32 {
    bits & IE_BITS_GEN_MASK
}

/// One generation increment
pub const IE_BITS_GEN_ONE: u32 = 0x0100_0000;

/// Table index part of a name
pub const NAME_INDEX_MASK: u32 = !IE_BITS_GEN_MASK;

// ============================================================================
// Port Right Types (shifted into IE_BITS_TYPE position)
// ============================================================================

/// Send right
pub const MACH_PORT_TYPE_SEND: u32 = 0x0001_0000;

/// Receive right
pub const MACH_PORT_TYPE_RECEIVE: u32 = 0x0002_0000;

/// Send-once right
pub const MACH_PORT_TYPE_SEND_ONCE: u32 = 0x0004_0000;

/// Port set
pub const MACH_PORT_TYPE_PORT_SET: u32 = 0x0008_0000;

/// Dead name (port was destroyed)
pub const MACH_PORT_TYPE_DEAD_NAME: u32 = 0x0010_0000;

// ============================================================================
// IPC Object - what an entry names
// ============================================================================

/// The rights recorded under one name
pub enum IpcObject {
    /// Free entry
    None,
    /// Receive and/or send rights for one port, merged under one name
    Port {
        receive: Option<PortRight>,
        send: Option<PortRight>,
    },
    /// A send-once right; each gets a name of its own
    SendOnce(PortRight),
    PortSet(Arc<PortSet>),
}

impl IpcObject {
    /// Check if this is a null/empty object
    pub fn is_none(&self) -> bool {
        matches!(self, IpcObject::None)
    }

    /// The port named, if any
    pub fn port(&self) -> Option<&Arc<Port>> {
        match self {
            IpcObject::Port { receive, send } => receive
                .as_ref()
                .or(send.as_ref())
                .map(|right| right.port()),
            IpcObject::SendOnce(right) => Some(right.port()),
            _ => None,
        }
    }

    /// Type bits derived from the rights held
    fn type_bits(&self) -> u32 {
        match self {
            IpcObject::None => 0,
            IpcObject::PortSet(_) => MACH_PORT_TYPE_PORT_SET,
            IpcObject::SendOnce(right) if !right.is_active() => MACH_PORT_TYPE_DEAD_NAME,
            IpcObject::SendOnce(_) => MACH_PORT_TYPE_SEND_ONCE,
            IpcObject::Port { receive, send } => {
                let mut bits = 0;
                if receive.is_some() {
                    bits |= MACH_PORT_TYPE_RECEIVE;
                }
                match send {
                    Some(right) if receive.is_none() && !right.is_active() => {
                        bits |= MACH_PORT_TYPE_DEAD_NAME
                    }
                    Some(_) => bits |= MACH_PORT_TYPE_SEND,
                    None => {}
                }
                bits
            }
        }
    }
}

impl fmt::Debug for IpcObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcObject::None => f.write_str("None"),
            IpcObject::Port { receive, send } => f
                .debug_struct("Port")
                .field("receive", &receive.is_some())
                .field("send", &send.is_some())
                .field("port", &self.port().map(Arc::as_ptr))
                .finish(),
            IpcObject::SendOnce(right) => f.debug_tuple("SendOnce").field(right).finish(),
            IpcObject::PortSet(set) => f.debug_tuple("PortSet").field(&Arc::as_ptr(set)).finish(),
        }
    }
}

// ============================================================================
// IPC Entry - A single capability record
// ============================================================================

/// IPC Entry - records a single capability in a task's IPC space
///
/// From Mach4:
/// - ie_bits: generation and send urefs (the type is derived from the
///   rights actually held)
/// - ie_object: the port rights or port set
/// - ie_next: free list link for free entries
#[derive(Debug)]
pub struct IpcEntry {
    /// generation | urefs
    bits: IpcEntryBits,

    /// The IPC object this entry refers to
    object: IpcObject,

    /// For free entries: next free index
    next_free: u32,
}

impl IpcEntry {
    /// Create a free entry pointing to next free index
    fn new_free(next_free: u32) -> Self {
        Self {
            bits: 0,
            object: IpcObject::None,
            next_free,
        }
    }

    /// Check if this entry is free (no capability)
    #[inline]
    pub fn is_free(&self) -> bool {
        self.object.is_none()
    }

    /// Get the capability type
    #[inline]
    pub fn entry_type(&self) -> u32 {
        self.object.type_bits()
    }

    /// Get user reference count of the send right
    #[inline]
    pub fn urefs(&self) -> u16 {
        ie_bits_urefs(self.bits)
    }

    /// Get generation number
    #[inline]
    pub fn generation(&self) -> u32 {
        ie_bits_gen(self.bits)
    }

    /// Get the IPC object
    pub fn object(&self) -> &IpcObject {
        &self.object
    }

    pub fn object_mut(&mut self) -> &mut IpcObject {
        &mut self.object
    }

    fn set_urefs(&mut self, urefs: u16) {
        self.bits = (self.bits & !IE_BITS_UREFS_MASK) | urefs as u32;
    }

    /// Add user references
    pub fn add_urefs(&mut self, delta: u16) -> IpcResult<()> {
        let urefs = self
            .urefs()
            .checked_add(delta)
            .ok_or(IpcError::ResourceExhausted)?;
        self.set_urefs(urefs);
        Ok(())
    }

    /// Remove user references, returns true when none remain
    pub fn remove_urefs(&mut self, delta: u16) -> IpcResult<bool> {
        let urefs = self
            .urefs()
            .checked_sub(delta)
            .ok_or(IpcError::InvalidCapability)?;
        self.set_urefs(urefs);
        Ok(urefs == 0)
    }

    /// Check if entry has send right
    #[inline]
    pub fn has_send(&self) -> bool {
        self.entry_type() & MACH_PORT_TYPE_SEND != 0
    }

    /// Check if entry has receive right
    #[inline]
    pub fn has_receive(&self) -> bool {
        self.entry_type() & MACH_PORT_TYPE_RECEIVE != 0
    }

    /// Check if entry has send-once right
    #[inline]
    pub fn has_send_once(&self) -> bool {
        self.entry_type() & MACH_PORT_TYPE_SEND_ONCE != 0
    }

    /// Check if entry is a dead name
    #[inline]
    pub fn is_dead_name(&self) -> bool {
        self.entry_type() & MACH_PORT_TYPE_DEAD_NAME != 0
    }
}

// ============================================================================
// Entry Table - Dynamic array of entries
// ============================================================================

/// Initial table size (number of entries)
pub const IPC_ENTRY_TABLE_MIN: usize = 16;

/// Entry table with free list management
///
/// A reverse map from port address to name (the ipc_hash of Mach4)
/// lets receive and send rights for one port share a name.
#[derive(Debug)]
pub struct IpcEntryTable {
    /// The entries array; index 0 is never handed out
    entries: Vec<IpcEntry>,

    /// Index of first free entry (0 = free list empty)
    free_head: u32,

    /// Number of active (non-free) entries
    active_count: usize,

    /// Upper bound on the number of entries
    limit: usize,

    /// Port address -> name of its merged receive/send entry
    reverse: HashMap<usize, PortName>,
}

#[inline]
fn port_key(port: &Port) -> usize {
    port as *const Port as usize
}

impl IpcEntryTable {
    /// Create a new entry table holding at most `limit` names
    pub fn new(limit: usize) -> Self {
        let limit = limit.clamp(1, NAME_INDEX_MASK as usize - 1);
        let mut table = Self {
            entries: vec![IpcEntry::new_free(0)],
            free_head: 0,
            active_count: 0,
            limit,
            reverse: HashMap::new(),
        };
        table.grow_to(IPC_ENTRY_TABLE_MIN.min(limit + 1));
        table
    }

    /// Get table size
    #[inline]
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Get number of active entries
    #[inline]
    pub fn active_count(&self) -> usize {
        self.active_count
    }

    fn index_of(&self, name: PortName) -> Option<usize> {
        if !name.is_valid() {
            return None;
        }
        let raw = name.as_raw();
        let index = (raw & NAME_INDEX_MASK) as usize;
        let entry = self.entries.get(index)?;
        if index == 0 || entry.is_free() || entry.generation() != ie_bits_gen(raw) {
            return None;
        }
        Some(index)
    }

    /// Look up an entry by name (index + generation check)
    pub fn lookup(&self, name: PortName) -> Option<&IpcEntry> {
        self.index_of(name).map(|index| &self.entries[index])
    }

    /// Look up an entry mutably
    pub fn lookup_mut(&mut self, name: PortName) -> Option<&mut IpcEntry> {
        self.index_of(name).map(|index| &mut self.entries[index])
    }

    /// Record `object` under a fresh name
    pub fn alloc(&mut self, object: IpcObject, urefs: u16) -> IpcResult<PortName> {
        if self.free_head == 0 {
            self.grow()?;
        }

        let index = self.free_head as usize;
        let entry = &mut self.entries[index];
        self.free_head = entry.next_free;

        let name = PortName::from_raw(index as u32 | entry.generation());
        if let IpcObject::Port { .. } = object {
            if let Some(port) = object.port() {
                self.reverse.insert(port_key(port), name);
            }
        }
        entry.object = object;
        entry.next_free = 0;
        entry.set_urefs(urefs);

        self.active_count += 1;
        Ok(name)
    }

    /// Free a name, handing back what it held
    ///
    /// The caller drops the returned rights once it no longer holds the
    /// space lock.
    pub fn dealloc(&mut self, name: PortName) -> IpcResult<IpcObject> {
        let index = self.index_of(name).ok_or(IpcError::InvalidCapability)?;
        let entry = &mut self.entries[index];

        let object = core::mem::replace(&mut entry.object, IpcObject::None);
        if let (IpcObject::Port { .. }, Some(port)) = (&object, object.port()) {
            self.reverse.remove(&port_key(port));
        }

        // Bump the generation so the old name goes stale.
        entry.bits = ie_bits_gen(entry.bits).wrapping_add(IE_BITS_GEN_ONE) & IE_BITS_GEN_MASK;
        entry.next_free = self.free_head;
        self.free_head = index as u32;
        self.active_count -= 1;
        Ok(object)
    }

    /// Grow the table to accommodate more entries
    fn grow(&mut self) -> IpcResult<()> {
        let old_size = self.entries.len();
        let new_size = (old_size * 2).min(self.limit + 1);
        if new_size <= old_size {
            return Err(IpcError::ResourceExhausted);
        }
        self.grow_to(new_size);
        Ok(())
    }

    fn grow_to(&mut self, new_size: usize) {
        let old_size = self.entries.len();
        for i in old_size..new_size {
            let next = if i + 1 < new_size {
                (i + 1) as u32
            } else {
                self.free_head
            };
            self.entries.push(IpcEntry::new_free(next));
        }
        if new_size > old_size {
            self.free_head = old_size as u32;
        }
    }

    /// Name under which this space holds receive/send rights for `port`
    pub fn find_port(&self, port: &Port) -> Option<PortName> {
        self.reverse.get(&port_key(port)).copied()
    }

    /// Iterate over all active entries
    pub fn iter_active(&self) -> impl Iterator<Item = (PortName, &IpcEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.is_free())
            .map(|(index, entry)| (PortName::from_raw(index as u32 | entry.generation()), entry))
    }

    /// Empty the table, returning every object it held
    pub fn drain(&mut self) -> Vec<IpcObject> {
        let names: Vec<PortName> = self.iter_active().map(|(name, _)| name).collect();
        names
            .into_iter()
            .filter_map(|name| self.dealloc(name).ok())
            .collect()
    }
}

impl Default for IpcEntryTable {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_SPACE_LIMIT)
    }
}
