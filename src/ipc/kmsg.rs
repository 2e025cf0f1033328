//! IPC Kernel Message - Internal message representation
//!
//! Based on Mach4 ipc/ipc_kmsg.h/c
//! Kernel messages are the internal representation of Mach messages
//! as they pass through the kernel.
//!
//! Copy-in turns a task's wire-format message into an [`IpcKmsg`] whose
//! header and body hold real [`PortRight`]s and pinned [`VmMapCopy`]s;
//! copy-out does the reverse against the receiving task. Every right and
//! region is owned by exactly one place at a time, so discarding a
//! message at any point is just dropping it.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use log::{debug, trace, warn};
use thiserror::Error;

use crate::task::IpcTask;
use crate::vm::{VmAddress, VmMapCopy};

use super::message::{
    CopyOption, MsgBits, MsgDescriptor, MsgHeader, MsgTrailer, UserMessage, HEADER_SIZE,
};
use super::notify::NotifyType;
use super::port::Port;
use super::right::{MsgTypeName, PortRight, RightKind};
use super::{IpcError, IpcResult, PortName};

// ============================================================================
// Errors
// ============================================================================

/// Which part of a message a copy-in or copy-out error concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Header layout or size
    Header,
    Destination,
    Reply,
    /// A right carried in the body
    Body,
    /// Out-of-line memory
    Memory,
    /// Descriptor type, disposition or copy option
    Type,
}

/// A copy-in / copy-out failure
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{error} ({fault:?})")]
pub struct KmsgError {
    pub error: IpcError,
    pub fault: Fault,
}

impl KmsgError {
    pub fn new(error: IpcError, fault: Fault) -> Self {
        Self { error, fault }
    }
}

impl From<IpcError> for KmsgError {
    fn from(error: IpcError) -> Self {
        Self::new(error, Fault::Body)
    }
}

fn at(fault: Fault) -> impl Fn(IpcError) -> KmsgError {
    move |error| KmsgError::new(error, fault)
}

// ============================================================================
// Kernel message
// ============================================================================

/// Kernel form of the message header
#[derive(Debug, Default)]
pub struct KmsgHeader {
    /// Bits as copied in: dispositions replaced by the resulting right types
    pub bits: MsgBits,
    /// Size of header + body on the wire
    pub size: u32,
    /// Destination right
    pub remote: Option<PortRight>,
    /// Reply right
    pub local: Option<PortRight>,
    pub id: i32,
}

/// Kernel form of one body descriptor
#[derive(Debug)]
pub enum KmsgDescriptor {
    Port {
        /// `None` for a null or dead name
        right: Option<PortRight>,
        /// Type the receiver sees
        disposition: MsgTypeName,
    },
    OutOfLine {
        copy: VmMapCopy,
        deallocate: bool,
        volatile: bool,
    },
    OolPorts {
        rights: Vec<Option<PortRight>>,
        disposition: MsgTypeName,
        deallocate: bool,
    },
}

impl KmsgDescriptor {
    fn is_port(&self) -> bool {
        matches!(self, KmsgDescriptor::Port { .. })
    }
}

/// Kernel message structure
#[derive(Debug, Default)]
pub struct IpcKmsg {
    header: KmsgHeader,
    descriptors: Vec<KmsgDescriptor>,
    /// Inline data after the descriptors
    inline: Vec<u8>,
    trailer: MsgTrailer,
}

impl IpcKmsg {
    /// Allocate an empty kernel message able to hold `size` bytes
    pub fn alloc(size: usize) -> IpcResult<Box<Self>> {
        if size > u32::MAX as usize {
            return Err(IpcError::ResourceExhausted);
        }
        let mut inline = Vec::new();
        inline
            .try_reserve(size.saturating_sub(HEADER_SIZE))
            .map_err(|_| IpcError::ResourceExhausted)?;
        Ok(Box::new(Self {
            header: KmsgHeader {
                size: HEADER_SIZE as u32,
                ..KmsgHeader::default()
            },
            inline,
            ..Self::default()
        }))
    }

    /// Header-only kernel notification sent on `dest`
    pub fn notification(dest: PortRight, kind: NotifyType) -> Box<Self> {
        Box::new(Self {
            header: KmsgHeader {
                bits: MsgBits::new(dest.kind().received_type() as u32, 0),
                size: HEADER_SIZE as u32,
                remote: Some(dest),
                local: None,
                id: kind.msg_id(),
            },
            trailer: MsgTrailer::kernel(),
            ..Self::default()
        })
    }

    pub fn header(&self) -> &KmsgHeader {
        &self.header
    }

    pub fn id(&self) -> i32 {
        self.header.id
    }

    pub fn set_id(&mut self, id: i32) {
        self.header.id = id;
    }

    pub fn descriptors(&self) -> &[KmsgDescriptor] {
        &self.descriptors
    }

    pub fn inline(&self) -> &[u8] {
        &self.inline
    }

    pub fn set_inline(&mut self, data: &[u8]) {
        self.inline.clear();
        self.inline.extend_from_slice(data);
        self.header.size = (HEADER_SIZE + self.body_size()) as u32;
    }

    pub fn trailer(&self) -> &MsgTrailer {
        &self.trailer
    }

    pub fn set_seqno(&mut self, seqno: u32) {
        self.trailer.seqno = seqno;
    }

    pub fn set_context(&mut self, context: u64) {
        self.trailer.context = context;
    }

    /// Destination port
    pub fn destination(&self) -> Option<&Arc<Port>> {
        self.header.remote.as_ref().map(PortRight::port)
    }

    pub fn set_destination(&mut self, dest: PortRight) {
        self.header.bits = MsgBits::new(
            dest.kind().received_type() as u32,
            self.header.bits.local(),
        )
        .with_complex(self.header.bits.is_complex());
        self.header.remote = Some(dest);
    }

    pub fn set_reply(&mut self, reply: PortRight) {
        self.header.bits = MsgBits::new(
            self.header.bits.remote(),
            reply.kind().received_type() as u32,
        )
        .with_complex(self.header.bits.is_complex());
        self.header.local = Some(reply);
    }

    /// Take the reply right if it is a send-once right
    pub fn take_send_once_reply(&mut self) -> Option<PortRight> {
        match &self.header.local {
            Some(right) if right.kind() == RightKind::SendOnce => self.header.local.take(),
            _ => None,
        }
    }

    /// Append a port descriptor carrying `right`
    ///
    /// `disposition` is how the right was obtained; the receiver sees the
    /// type of the right itself.
    pub fn push_port_right(&mut self, right: PortRight, disposition: MsgTypeName) {
        debug_assert_eq!(disposition.result_kind(), right.kind());
        let received = right.kind().received_type();
        self.descriptors.push(KmsgDescriptor::Port {
            right: Some(right),
            disposition: received,
        });
        self.header.bits = self.header.bits.with_complex(true);
        self.header.size = (HEADER_SIZE + self.body_size()) as u32;
    }

    fn body_size(&self) -> usize {
        let descriptors: usize = self
            .descriptors
            .iter()
            .map(|d| match d {
                KmsgDescriptor::Port { .. } => super::message::PORT_DESCRIPTOR_SIZE,
                _ => super::message::OOL_DESCRIPTOR_SIZE,
            })
            .sum();
        let count = if self.descriptors.is_empty() {
            0
        } else {
            super::message::BODY_COUNT_SIZE
        };
        count + descriptors + super::message::round_msg(self.inline.len())
    }

    /// Bytes the header and body take in a receive buffer
    pub fn copyout_size(&self) -> usize {
        self.header.size as usize
    }

    /// Whether the body carries out-of-line memory or port arrays
    pub fn has_out_of_line(&self) -> bool {
        self.descriptors.iter().any(|d| !d.is_port())
    }

    // ========================================================================
    // Copy-in
    // ========================================================================

    /// Build a kernel message from `bytes` in `task`'s context
    ///
    /// On failure nothing is left behind: rights already taken from the
    /// space are released and the sender's memory is not deallocated.
    pub fn copyin(bytes: &[u8], task: &IpcTask) -> Result<Box<Self>, KmsgError> {
        if bytes.len() > task.config.max_message_size {
            return Err(KmsgError::new(IpcError::ResourceExhausted, Fault::Body));
        }
        let raw = MsgHeader::decode(bytes).map_err(at(Fault::Header))?;
        let size = raw.size as usize;
        if size < HEADER_SIZE || size % super::message::MSG_ALIGNMENT != 0 {
            return Err(KmsgError::new(IpcError::MessageTooSmall, Fault::Header));
        }
        if size != bytes.len() {
            return Err(KmsgError::new(IpcError::InvalidHeader, Fault::Header));
        }
        let msg = UserMessage::decode(bytes).map_err(|error| match error {
            IpcError::InvalidHeader => KmsgError::new(error, Fault::Type),
            _ => KmsgError::new(error, Fault::Body),
        })?;

        let mut kmsg = Self::alloc(size).map_err(at(Fault::Body))?;
        kmsg.copyin_header(&msg.header, task)?;
        let deallocations = kmsg.copyin_body(&msg.descriptors, task)?;
        kmsg.inline = msg.inline;
        kmsg.header.size = raw.size;
        kmsg.header.bits = kmsg.header.bits.with_complex(!kmsg.descriptors.is_empty());
        kmsg.trailer = MsgTrailer {
            seqno: 0,
            sender: task.sec_token,
            audit: task.audit_token,
            context: 0,
        };

        // Only now that nothing can fail does the sender lose its memory.
        for (address, size) in deallocations {
            if let Err(err) = task.map.deallocate(address, size) {
                warn!(
                    "deallocate of sent region {:#x}+{} failed: {}",
                    address, size, err
                );
            }
        }

        trace!(
            "copied in message id {} ({} bytes, {} descriptors)",
            kmsg.header.id,
            size,
            kmsg.descriptors.len()
        );
        Ok(kmsg)
    }

    fn copyin_header(&mut self, header: &MsgHeader, task: &IpcTask) -> Result<(), KmsgError> {
        let dest_disp = send_disposition(header.bits.remote())
            .ok_or(KmsgError::new(IpcError::InvalidHeader, Fault::Header))?;
        let reply_disp = if header.local.is_null() && header.bits.local() == 0 {
            None
        } else {
            Some(
                send_disposition(header.bits.local())
                    .ok_or(KmsgError::new(IpcError::InvalidHeader, Fault::Header))?,
            )
        };

        if !header.remote.is_valid() {
            return Err(KmsgError::new(IpcError::InvalidCapability, Fault::Destination));
        }
        let reply_disp = reply_disp.filter(|_| header.local.is_valid());
        // The reply is vetted before the destination is taken out of the space.
        if let Some(disp) = reply_disp {
            task.space
                .check_name(header.local, disp)
                .map_err(at(Fault::Reply))?;
        }
        let dest = task
            .space
            .resolve_name(header.remote, dest_disp)
            .map_err(at(Fault::Destination))?;

        let reply = match reply_disp {
            Some(disp) => match task.space.resolve_name(header.local, disp) {
                Ok(reply) => Some(reply),
                Err(err) => {
                    // Same name moved twice: hand the destination back.
                    if dest_disp.is_move() {
                        if let Err(err) = task.space.insert_name(dest) {
                            warn!("could not restore destination right: {}", err);
                        }
                    }
                    return Err(KmsgError::new(err, Fault::Reply));
                }
            },
            None => None,
        };

        // Vouchers are not carried.
        self.header.bits = MsgBits::new(
            dest.kind().received_type() as u32,
            reply.as_ref().map_or(0, |r| r.kind().received_type() as u32),
        );
        self.header.remote = Some(dest);
        self.header.local = reply;
        self.header.id = header.id;
        Ok(())
    }

    /// Copy in every descriptor; returns the source ranges to deallocate
    fn copyin_body(
        &mut self,
        descriptors: &[MsgDescriptor],
        task: &IpcTask,
    ) -> Result<Vec<(VmAddress, usize)>, KmsgError> {
        let mut deallocations = Vec::new();
        self.descriptors.reserve(descriptors.len());

        for desc in descriptors {
            let kdesc = match *desc {
                MsgDescriptor::Port { name, disposition } => {
                    let disp = MsgTypeName::from_u32(disposition as u32)
                        .ok_or(KmsgError::new(IpcError::InvalidHeader, Fault::Type))?;
                    let right = self.copyin_right(name, disp, task)?;
                    KmsgDescriptor::Port {
                        right,
                        disposition: disp.result_kind().received_type(),
                    }
                }
                MsgDescriptor::OutOfLine {
                    address,
                    size,
                    deallocate,
                    copy,
                    volatile,
                } => {
                    check_send_copy(copy)?;
                    let pinned = task
                        .map
                        .pin_region(address, size as usize)
                        .map_err(at(Fault::Memory))?;
                    if deallocate && size > 0 {
                        deallocations.push((address, size as usize));
                    }
                    KmsgDescriptor::OutOfLine {
                        copy: pinned,
                        deallocate,
                        volatile,
                    }
                }
                MsgDescriptor::OolPorts {
                    address,
                    count,
                    deallocate,
                    copy,
                    disposition,
                } => {
                    check_send_copy(copy)?;
                    let disp = MsgTypeName::from_u32(disposition as u32)
                        .ok_or(KmsgError::new(IpcError::InvalidHeader, Fault::Type))?;
                    let len = (count as usize)
                        .checked_mul(4)
                        .ok_or(KmsgError::new(IpcError::InvalidMemory, Fault::Memory))?;
                    let names = task
                        .map
                        .pin_region(address, len)
                        .map_err(at(Fault::Memory))?;
                    let mut rights = Vec::with_capacity(count as usize);
                    for chunk in names.as_bytes().chunks_exact(4) {
                        let name = PortName::from_raw(u32::from_le_bytes([
                            chunk[0], chunk[1], chunk[2], chunk[3],
                        ]));
                        rights.push(self.copyin_right(name, disp, task)?);
                    }
                    if deallocate && len > 0 {
                        deallocations.push((address, len));
                    }
                    KmsgDescriptor::OolPorts {
                        rights,
                        disposition: disp.result_kind().received_type(),
                        deallocate,
                    }
                }
            };
            self.descriptors.push(kdesc);
        }
        Ok(deallocations)
    }

    /// Resolve one body right; null and dead names carry no right
    fn copyin_right(
        &self,
        name: PortName,
        disposition: MsgTypeName,
        task: &IpcTask,
    ) -> Result<Option<PortRight>, KmsgError> {
        if !name.is_valid() {
            return Ok(None);
        }
        if disposition == MsgTypeName::MoveReceive {
            // A port cannot carry its own receive right.
            if let (Some(dest), Ok(super::space::ReceiveTarget::Port(port))) =
                (self.destination(), task.space.lookup_receive(name))
            {
                if Arc::ptr_eq(dest, &port) {
                    return Err(KmsgError::new(IpcError::InvalidCapability, Fault::Body));
                }
            }
        }
        task.space
            .resolve_name(name, disposition)
            .map(Some)
            .map_err(at(Fault::Body))
    }

    // ========================================================================
    // Scatter list
    // ========================================================================

    /// Check a receive scatter list against this message's body
    ///
    /// Port descriptors on either side are skipped; the remaining entries
    /// pair up in order. Extra scatter entries are ignored and extra body
    /// entries fall back to allocation.
    pub fn check_scatter(&self, scatter: &[MsgDescriptor]) -> Result<(), KmsgError> {
        if scatter.is_empty() {
            if self.has_out_of_line() {
                return Err(KmsgError::new(IpcError::InvalidScatterList, Fault::Memory));
            }
            return Ok(());
        }

        let mut slots = scatter
            .iter()
            .filter(|d| !matches!(d, MsgDescriptor::Port { .. }));
        for desc in self.descriptors.iter().filter(|d| !d.is_port()) {
            let Some(slot) = slots.next() else { break };
            match (desc, slot) {
                (
                    KmsgDescriptor::OutOfLine { copy, .. },
                    MsgDescriptor::OutOfLine {
                        size,
                        copy: option,
                        ..
                    },
                ) => {
                    if *option == CopyOption::Overwrite && (*size as usize) < copy.len() {
                        return Err(KmsgError::new(IpcError::InvalidScatterList, Fault::Memory));
                    }
                }
                (
                    KmsgDescriptor::OolPorts { rights, .. },
                    MsgDescriptor::OolPorts {
                        count,
                        copy: option,
                        ..
                    },
                ) => {
                    if *option == CopyOption::Overwrite && (*count as usize) < rights.len() {
                        return Err(KmsgError::new(IpcError::InvalidScatterList, Fault::Memory));
                    }
                }
                _ => return Err(KmsgError::new(IpcError::InvalidScatterList, Fault::Type)),
            }
        }
        Ok(())
    }

    // ========================================================================
    // Copy-out
    // ========================================================================

    /// Deliver this message into `task`
    ///
    /// The header is reversed for the receiver: `remote` names the reply
    /// right and `local` the destination. On failure every name and
    /// region installed so far is withdrawn, the message is destroyed,
    /// and the header produced by [`IpcKmsg::copyout_dest`] is returned
    /// alongside the error.
    pub fn copyout(
        self: Box<Self>,
        task: &IpcTask,
        scatter: Option<&[MsgDescriptor]>,
    ) -> Result<(UserMessage, MsgTrailer), (KmsgError, MsgHeader)> {
        let mut kmsg = self;
        let mut undo = CopyoutUndo::default();
        match kmsg.copyout_parts(task, scatter, &mut undo) {
            Ok(msg) => {
                let trailer = kmsg.trailer;
                destroy(kmsg);
                Ok((msg, trailer))
            }
            Err(err) => {
                debug!(
                    "copyout of message id {} failed ({}), rolling back",
                    kmsg.header.id, err
                );
                undo.rollback(task);
                Err((err, kmsg.copyout_dest(task)))
            }
        }
    }

    fn copyout_parts(
        &mut self,
        task: &IpcTask,
        scatter: Option<&[MsgDescriptor]>,
        undo: &mut CopyoutUndo,
    ) -> Result<UserMessage, KmsgError> {
        let dest_type = self.header.bits.remote();
        let local = match self.header.remote.as_ref() {
            Some(dest) => match task.space.receive_name(dest.port()) {
                Some(name) => name,
                None => {
                    // Copy the destination right out as a right of its own.
                    let right = self.header.remote.take();
                    match right {
                        Some(right) => undo.insert(task, right, Fault::Header)?,
                        None => PortName::NULL,
                    }
                }
            },
            None => PortName::NULL,
        };
        let reply_type = self.header.bits.local();
        let remote = match self.header.local.take() {
            Some(reply) => undo.insert(task, reply, Fault::Reply)?,
            None => PortName::NULL,
        };

        let mut slots = scatter
            .unwrap_or(&[])
            .iter()
            .filter(|d| !matches!(d, MsgDescriptor::Port { .. }));
        let mut descriptors = Vec::with_capacity(self.descriptors.len());
        for desc in self.descriptors.drain(..) {
            let slot = if desc.is_port() { None } else { slots.next() };
            descriptors.push(copyout_descriptor(desc, task, slot, Some(&mut *undo))?);
        }

        let header = MsgHeader {
            bits: MsgBits::new(reply_type, dest_type).with_complex(!descriptors.is_empty()),
            size: self.header.size,
            remote,
            local,
            voucher: PortName::NULL,
            id: self.header.id,
        };
        Ok(UserMessage {
            header,
            descriptors,
            inline: core::mem::take(&mut self.inline),
        })
    }

    /// Header-only result for a receive whose copy-out failed
    ///
    /// `local` names the receive right for the destination (or is dead if
    /// the port died); everything else in the message is destroyed.
    pub fn copyout_dest(self: Box<Self>, task: &IpcTask) -> MsgHeader {
        let mut kmsg = self;
        let (local, local_type) = match kmsg.header.remote.take() {
            Some(dest) => {
                let name = match task.space.receive_name(dest.port()) {
                    Some(name) => name,
                    None if dest.is_active() => PortName::NULL,
                    None => PortName::DEAD,
                };
                (name, dest.kind().received_type() as u32)
            }
            None => (PortName::NULL, kmsg.header.bits.remote()),
        };
        let header = MsgHeader {
            bits: MsgBits::new(0, local_type),
            size: HEADER_SIZE as u32,
            remote: PortName::NULL,
            local,
            voucher: PortName::NULL,
            id: kmsg.header.id,
        };
        destroy(kmsg);
        header
    }

    /// Hand a message that could not be queued back to its sender
    ///
    /// Rights and memory are copied out into the sender's own space and
    /// map without reversing the header. Best effort: whatever cannot be
    /// installed is destroyed and reads as null.
    pub fn copyout_pseudo(self: Box<Self>, task: &IpcTask) -> UserMessage {
        let mut kmsg = self;
        let dest_type = kmsg.header.bits.remote();
        let reply_type = kmsg.header.bits.local();
        let remote = kmsg
            .header
            .remote
            .take()
            .map_or(PortName::NULL, |right| pseudo_insert(task, right));
        let local = kmsg
            .header
            .local
            .take()
            .map_or(PortName::NULL, |right| pseudo_insert(task, right));

        let descriptors: Vec<MsgDescriptor> = kmsg
            .descriptors
            .drain(..)
            .map(|desc| {
                let placeholder = placeholder_for(&desc);
                copyout_descriptor(desc, task, None, None).unwrap_or(placeholder)
            })
            .collect();

        let header = MsgHeader {
            bits: MsgBits::new(dest_type, reply_type).with_complex(!descriptors.is_empty()),
            size: kmsg.header.size,
            remote,
            local,
            voucher: PortName::NULL,
            id: kmsg.header.id,
        };
        let inline = core::mem::take(&mut kmsg.inline);
        destroy(kmsg);
        UserMessage {
            header,
            descriptors,
            inline,
        }
    }

    /// Minimal message reported to a receiver whose port died
    pub fn dead_notification(local: PortName) -> (MsgHeader, MsgTrailer) {
        let header = MsgHeader {
            bits: MsgBits::new(0, 0),
            size: HEADER_SIZE as u32,
            remote: PortName::NULL,
            local,
            voucher: PortName::NULL,
            id: NotifyType::PortDestroyed.msg_id(),
        };
        (header, MsgTrailer::kernel())
    }
}

/// Dispositions allowed for header rights
fn send_disposition(raw: u32) -> Option<MsgTypeName> {
    MsgTypeName::from_u32(raw).filter(|d| *d != MsgTypeName::MoveReceive)
}

fn check_send_copy(copy: CopyOption) -> Result<(), KmsgError> {
    match copy {
        CopyOption::Physical | CopyOption::Virtual => Ok(()),
        _ => Err(KmsgError::new(IpcError::InvalidHeader, Fault::Type)),
    }
}

fn pseudo_insert(task: &IpcTask, right: PortRight) -> PortName {
    task.space.insert_name(right).unwrap_or(PortName::NULL)
}

fn placeholder_for(desc: &KmsgDescriptor) -> MsgDescriptor {
    match desc {
        KmsgDescriptor::Port { disposition, .. } => {
            MsgDescriptor::port(PortName::NULL, *disposition as u32)
        }
        KmsgDescriptor::OutOfLine { volatile, .. } => MsgDescriptor::OutOfLine {
            address: 0,
            size: 0,
            deallocate: false,
            copy: CopyOption::Allocate,
            volatile: *volatile,
        },
        KmsgDescriptor::OolPorts { disposition, .. } => MsgDescriptor::OolPorts {
            address: 0,
            count: 0,
            deallocate: false,
            copy: CopyOption::Allocate,
            disposition: *disposition as u8,
        },
    }
}

/// Copy one descriptor out, optionally into a scatter slot
fn copyout_descriptor(
    desc: KmsgDescriptor,
    task: &IpcTask,
    slot: Option<&MsgDescriptor>,
    mut undo: Option<&mut CopyoutUndo>,
) -> Result<MsgDescriptor, KmsgError> {
    match desc {
        KmsgDescriptor::Port { right, disposition } => {
            let name = match right {
                Some(right) => insert_right(task, right, &mut undo)?,
                None => PortName::NULL,
            };
            Ok(MsgDescriptor::port(name, disposition as u32))
        }
        KmsgDescriptor::OutOfLine {
            copy,
            deallocate,
            volatile,
        } => {
            let (address, option) = place_region(task, &copy, slot, &mut undo)?;
            Ok(MsgDescriptor::OutOfLine {
                address,
                size: copy.len() as u32,
                deallocate,
                copy: option,
                volatile,
            })
        }
        KmsgDescriptor::OolPorts {
            rights,
            disposition,
            deallocate,
        } => {
            let count = rights.len() as u32;
            let mut names = Vec::with_capacity(rights.len() * 4);
            for right in rights {
                let name = match right {
                    Some(right) => insert_right(task, right, &mut undo)?,
                    None => PortName::NULL,
                };
                names.extend_from_slice(&name.as_raw().to_le_bytes());
            }
            let array = VmMapCopy::from_bytes(names);
            let (address, option) = place_region(task, &array, slot, &mut undo)?;
            Ok(MsgDescriptor::OolPorts {
                address,
                count,
                deallocate,
                copy: option,
                disposition: disposition as u8,
            })
        }
    }
}

fn insert_right(
    task: &IpcTask,
    right: PortRight,
    undo: &mut Option<&mut CopyoutUndo>,
) -> Result<PortName, KmsgError> {
    match undo {
        Some(undo) => undo.insert(task, right, Fault::Body),
        None => task.space.insert_name(right).map_err(at(Fault::Body)),
    }
}

/// Map a region, or overwrite the scatter slot's region
fn place_region(
    task: &IpcTask,
    copy: &VmMapCopy,
    slot: Option<&MsgDescriptor>,
    undo: &mut Option<&mut CopyoutUndo>,
) -> Result<(VmAddress, CopyOption), KmsgError> {
    let overwrite = match slot {
        Some(MsgDescriptor::OutOfLine {
            address,
            copy: CopyOption::Overwrite,
            ..
        })
        | Some(MsgDescriptor::OolPorts {
            address,
            copy: CopyOption::Overwrite,
            ..
        }) => Some(*address),
        _ => None,
    };

    if let Some(address) = overwrite {
        let prior = task
            .map
            .overwrite_region(address, copy)
            .map_err(at(Fault::Memory))?;
        if let Some(undo) = undo {
            undo.overwritten.push((address, prior));
        }
        return Ok((address, CopyOption::Overwrite));
    }

    if copy.is_empty() {
        return Ok((0, CopyOption::Allocate));
    }
    let address = task.map.map_region(copy).map_err(at(Fault::Memory))?;
    if let Some(undo) = undo {
        undo.mapped.push((address, copy.len()));
    }
    Ok((address, CopyOption::Allocate))
}

// ============================================================================
// Copy-out rollback
// ============================================================================

/// What a copy-out installed so far, so it can be withdrawn
#[derive(Default)]
struct CopyoutUndo {
    names: Vec<(PortName, RightKind)>,
    mapped: Vec<(VmAddress, usize)>,
    overwritten: Vec<(VmAddress, VmMapCopy)>,
}

impl CopyoutUndo {
    fn insert(
        &mut self,
        task: &IpcTask,
        right: PortRight,
        fault: Fault,
    ) -> Result<PortName, KmsgError> {
        let kind = right.kind();
        let name = task.space.insert_name(right).map_err(at(fault))?;
        if name.is_valid() {
            self.names.push((name, kind));
        }
        Ok(name)
    }

    fn rollback(self, task: &IpcTask) {
        let (names, mapped, overwritten) = (self.names.len(), self.mapped.len(), self.overwritten.len());

        for (address, prior) in self.overwritten.into_iter().rev() {
            if let Err(err) = task.map.overwrite_region(address, &prior) {
                warn!("restoring overwritten region {:#x} failed: {}", address, err);
            }
        }
        for (address, size) in self.mapped.into_iter().rev() {
            if let Err(err) = task.map.unmap_region(address, size) {
                warn!("unmapping region {:#x} failed: {}", address, err);
            }
        }
        for (name, kind) in self.names.into_iter().rev() {
            match task.space.resolve_name(name, kind.move_disposition()) {
                // The withdrawn right goes down with the message.
                Ok(right) => drop(right),
                Err(err) => warn!("withdrawing name {} failed: {}", name, err),
            }
        }
        debug!(
            "copyout rollback: {} name(s), {} mapping(s), {} overwrite(s) undone",
            names, mapped, overwritten
        );
    }
}

impl fmt::Debug for CopyoutUndo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyoutUndo")
            .field("names", &self.names)
            .field("mapped", &self.mapped)
            .field("overwritten", &self.overwritten.len())
            .finish()
    }
}

// ============================================================================
// Deferred destruction
// ============================================================================

/// Messages waiting to be destroyed by this thread
#[derive(Default)]
struct Reaper {
    queue: VecDeque<Box<IpcKmsg>>,
    reaping: bool,
}

thread_local! {
    static REAPER: RefCell<Reaper> = RefCell::new(Reaper::default());
}

/// Destroy a message, releasing every right and region it still holds
pub fn destroy(kmsg: Box<IpcKmsg>) {
    destroy_all(std::iter::once(kmsg));
}

/// Destroy a batch of messages
///
/// Destroying a message can destroy a port whose queue holds more
/// messages. Those are queued on this thread and destroyed by the
/// outermost call in a loop instead of recursively.
pub fn destroy_all<I>(kmsgs: I)
where
    I: IntoIterator<Item = Box<IpcKmsg>>,
{
    let kmsgs: Vec<Box<IpcKmsg>> = kmsgs.into_iter().collect();
    let owner = REAPER.try_with(|reaper| {
        let mut reaper = reaper.borrow_mut();
        reaper.queue.extend(kmsgs);
        !core::mem::replace(&mut reaper.reaping, true)
    });

    match owner {
        Ok(true) => {
            while let Some(kmsg) = REAPER
                .try_with(|reaper| reaper.borrow_mut().queue.pop_front())
                .ok()
                .flatten()
            {
                drop(kmsg);
            }
            let _ = REAPER.try_with(|reaper| reaper.borrow_mut().reaping = false);
        }
        // An outer call on this thread is already draining the queue.
        Ok(false) => {}
        // Thread teardown: nothing was queued, the batch was dropped in place.
        Err(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::MsgDescriptor;
    use crate::ipc::mqueue::MsgWait;
    use crate::ipc::space::{IpcSpace, SimpleSpace};
    use crate::vm::SimpleMap;

    const MAKE_SEND: u32 = MsgTypeName::MakeSend as u32;
    const COPY_SEND: u32 = MsgTypeName::CopySend as u32;
    const MOVE_SEND: u32 = MsgTypeName::MoveSend as u32;
    const MAKE_SEND_ONCE: u32 = MsgTypeName::MakeSendOnce as u32;

    fn task() -> (IpcTask, Arc<SimpleSpace>, Arc<SimpleMap>) {
        IpcTask::simple()
    }

    #[test]
    fn test_copyin_simple_message() {
        let (task, space, _) = task();
        let dest = space.allocate_receive().unwrap();
        let msg = UserMessage::new(MsgHeader::new(dest, MAKE_SEND, 100)).with_inline(b"hello!");
        let kmsg = IpcKmsg::copyin(&msg.encode(), &task).unwrap();

        assert_eq!(kmsg.id(), 100);
        assert_eq!(kmsg.copyout_size(), msg.encoded_len());
        assert_eq!(&kmsg.inline()[..6], b"hello!");
        assert_eq!(kmsg.trailer().sender, task.sec_token);
        assert_eq!(kmsg.destination().map(|p| p.send_rights()), Some(1));
    }

    #[test]
    fn test_copyin_rejects_bad_destination() {
        let (task, _, _) = task();
        let msg = UserMessage::new(MsgHeader::new(PortName::from_raw(0x42), COPY_SEND, 1));
        let err = IpcKmsg::copyin(&msg.encode(), &task).unwrap_err();
        assert_eq!(err, KmsgError::new(IpcError::InvalidCapability, Fault::Destination));

        let msg = UserMessage::new(MsgHeader::new(PortName::from_raw(0x42), 16, 1));
        let err = IpcKmsg::copyin(&msg.encode(), &task).unwrap_err();
        assert_eq!(err.fault, Fault::Header);
    }

    #[test]
    fn test_copyin_size_errors() {
        let (task, space, _) = task();
        let dest = space.allocate_receive().unwrap();
        let mut bytes = UserMessage::new(MsgHeader::new(dest, MAKE_SEND, 1)).encode();
        bytes[4] = 20;
        assert_eq!(
            IpcKmsg::copyin(&bytes, &task).unwrap_err().error,
            IpcError::MessageTooSmall
        );
        assert_eq!(
            IpcKmsg::copyin(&bytes[..10], &task).unwrap_err().error,
            IpcError::MessageTooSmall
        );
    }

    #[test]
    fn test_bad_reply_keeps_moved_destination() {
        let (task, space, _) = task();
        let dest = space.allocate_receive().unwrap();
        space.make_send(dest).unwrap();
        let port = space.port(dest).unwrap();

        let msg = UserMessage::new(
            MsgHeader::new(dest, MOVE_SEND, 1).with_reply(PortName::from_raw(0x9999), COPY_SEND),
        );
        let err = IpcKmsg::copyin(&msg.encode(), &task).unwrap_err();
        assert_eq!(err, KmsgError::new(IpcError::InvalidCapability, Fault::Reply));
        assert_eq!(space.urefs(dest), Some(1));
        assert_eq!(port.send_rights(), 1);

        // One user reference cannot be moved out twice.
        let msg = UserMessage::new(MsgHeader::new(dest, MOVE_SEND, 2).with_reply(dest, MOVE_SEND));
        let err = IpcKmsg::copyin(&msg.encode(), &task).unwrap_err();
        assert_eq!(err.fault, Fault::Reply);
        assert_eq!(space.urefs(dest), Some(1));
        assert_eq!(port.send_rights(), 1);
    }

    #[test]
    fn test_partial_copyin_releases_rights() {
        let (task, space, _) = task();
        let dest = space.allocate_receive().unwrap();
        let carried = space.allocate_receive().unwrap();
        let carried_port = space.port(carried).unwrap();

        let msg = UserMessage::new(MsgHeader::new(dest, MAKE_SEND, 1))
            .with_descriptor(MsgDescriptor::port(carried, MAKE_SEND))
            .with_descriptor(MsgDescriptor::out_of_line(0xdead_0000, 8, true));
        let err = IpcKmsg::copyin(&msg.encode(), &task).unwrap_err();
        assert_eq!(err, KmsgError::new(IpcError::InvalidMemory, Fault::Memory));
        assert_eq!(carried_port.send_rights(), 0);
        assert_eq!(space.port(dest).unwrap().send_rights(), 0);
    }

    #[test]
    fn test_deallocate_applies_after_success() {
        let (task, space, map) = task();
        let dest = space.allocate_receive().unwrap();
        let addr = map.allocate(b"payload!").unwrap();
        let msg = UserMessage::new(MsgHeader::new(dest, MAKE_SEND, 1))
            .with_descriptor(MsgDescriptor::out_of_line(addr, 8, true));
        let kmsg = IpcKmsg::copyin(&msg.encode(), &task).unwrap();
        assert!(!map.is_mapped(addr));
        assert!(kmsg.has_out_of_line());
    }

    #[test]
    fn test_cannot_send_own_receive_right() {
        let (task, space, _) = task();
        let dest = space.allocate_receive().unwrap();
        let msg = UserMessage::new(MsgHeader::new(dest, MAKE_SEND, 1))
            .with_descriptor(MsgDescriptor::port(dest, MsgTypeName::MoveReceive as u32));
        let err = IpcKmsg::copyin(&msg.encode(), &task).unwrap_err();
        assert_eq!(err, KmsgError::new(IpcError::InvalidCapability, Fault::Body));
        assert!(space.port(dest).unwrap().is_active());
    }

    #[test]
    fn test_copyout_reverses_header() {
        let (sender, sspace, _) = task();
        let (receiver, rspace, _) = task();
        let dest = rspace.allocate_receive().unwrap();
        let dest_port = rspace.port(dest).unwrap();
        let remote = sspace.insert_name(PortRight::new_send(&dest_port)).unwrap();
        let reply = sspace.allocate_receive().unwrap();

        let msg = UserMessage::new(MsgHeader::new(remote, COPY_SEND, 7).with_reply(reply, MAKE_SEND_ONCE));
        let kmsg = IpcKmsg::copyin(&msg.encode(), &sender).unwrap();
        let (out, _) = kmsg.copyout(&receiver, None).unwrap();

        assert_eq!(out.header.local, dest);
        assert_eq!(out.header.bits.local(), MsgTypeName::MoveSend as u32);
        assert_eq!(out.header.bits.remote(), MsgTypeName::MoveSendOnce as u32);
        assert!(rspace.port(out.header.remote).is_some());
        assert_eq!(out.header.id, 7);
    }

    #[test]
    fn test_check_scatter() {
        let (task, space, map) = task();
        let dest = space.allocate_receive().unwrap();
        let addr = map.allocate(&[1u8; 32]).unwrap();
        let msg = UserMessage::new(MsgHeader::new(dest, MAKE_SEND, 1))
            .with_descriptor(MsgDescriptor::out_of_line(addr, 32, false));
        let kmsg = IpcKmsg::copyin(&msg.encode(), &task).unwrap();

        let small = MsgDescriptor::OutOfLine {
            address: 0,
            size: 16,
            deallocate: false,
            copy: CopyOption::Overwrite,
            volatile: false,
        };
        assert_eq!(
            kmsg.check_scatter(&[small]).unwrap_err(),
            KmsgError::new(IpcError::InvalidScatterList, Fault::Memory)
        );
        assert_eq!(
            kmsg.check_scatter(&[MsgDescriptor::ool_ports(0, 8, MAKE_SEND, false)])
                .unwrap_err()
                .fault,
            Fault::Type
        );
        assert!(kmsg.check_scatter(&[]).is_err());
        assert!(kmsg
            .check_scatter(&[MsgDescriptor::out_of_line(0, 0, false)])
            .is_ok());
    }

    #[test]
    fn test_pseudo_receive_returns_rights() {
        let (task, space, _) = task();
        let dest = space.allocate_receive().unwrap();
        space.make_send(dest).unwrap();
        let msg = UserMessage::new(MsgHeader::new(dest, MsgTypeName::MoveSend as u32, 3));
        let kmsg = IpcKmsg::copyin(&msg.encode(), &task).unwrap();
        assert_eq!(space.urefs(dest), Some(0));

        let back = kmsg.copyout_pseudo(&task);
        assert_eq!(back.header.remote, dest);
        assert_eq!(space.urefs(dest), Some(1));
    }

    #[test]
    fn test_nested_destroy_is_iterative() {
        // A chain of ports, each queued message carrying the next receive right.
        let head = Port::allocate_receive();
        let mut tail = head.port().clone();
        for _ in 0..1000 {
            let next = Port::allocate_receive();
            let port = next.port().clone();
            let mut kmsg = IpcKmsg::alloc(0).unwrap();
            kmsg.push_port_right(next, MsgTypeName::MoveReceive);
            tail.enqueue(kmsg, MsgWait::NoWait).unwrap();
            tail = port;
        }
        drop(head);
        assert!(!tail.is_active());
    }

    #[test]
    fn test_dead_notification() {
        let (header, trailer) = IpcKmsg::dead_notification(PortName::from_raw(5));
        assert_eq!(header.id, 0x45);
        assert_eq!(header.local, PortName::from_raw(5));
        assert_eq!(trailer.sender, MsgTrailer::kernel().sender);
    }
}
