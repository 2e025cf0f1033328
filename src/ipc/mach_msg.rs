//! Mach Message System Call
//!
//! Based on Mach4 ipc/mach_msg.c by CMU (1987-1991)
//!
//! This module implements the mach_msg() system call, which is the fundamental
//! IPC primitive in Mach. It handles both message sending and receiving in
//! a single system call for efficiency.
//!
//! ## Options
//!
//! The mach_msg() call supports several options:
//! - MACH_SEND_MSG: Send a message
//! - MACH_RCV_MSG: Receive a message
//! - MACH_SEND_TIMEOUT / MACH_RCV_TIMEOUT: Bound the blocking phase
//! - MACH_SEND_INTERRUPT / MACH_RCV_INTERRUPT: Report interruption instead
//!   of retrying
//! - MACH_RCV_OVERWRITE: Receive out-of-line data into a scatter list
//!
//! ## Combined Send/Receive
//!
//! When both SEND and RCV are specified, the message is sent first,
//! then a response is received (RPC optimization). A failed receive phase
//! never sends again.

use core::fmt;
use core::time::Duration;

use log::{debug, trace};
use spin::Mutex;

use crate::config::DEFAULT_TRAILER;
use crate::task::IpcTask;

use super::kmsg::{self, Fault, IpcKmsg, KmsgError};
use super::message::{
    round_msg, MsgBits, MsgDescriptor, MsgHeader, MsgTrailer, TrailerLevel, UserMessage,
    HEADER_SIZE,
};
use super::mqueue::MsgWait;
use super::space::ReceiveTarget;
use super::{IpcError, IpcResult, PortName};

// ============================================================================
// Message Option Flags
// ============================================================================

/// Send a message
pub const MACH_SEND_MSG: u32 = 0x0000_0001;

/// Receive a message
pub const MACH_RCV_MSG: u32 = 0x0000_0002;

/// Send/receive timeout is specified
pub const MACH_SEND_TIMEOUT: u32 = 0x0000_0010;
pub const MACH_RCV_TIMEOUT: u32 = 0x0000_0100;

/// Interruptible operation
pub const MACH_SEND_INTERRUPT: u32 = 0x0000_0040;
pub const MACH_RCV_INTERRUPT: u32 = 0x0000_0400;

/// Scatter out-of-line data into caller-supplied regions
pub const MACH_RCV_OVERWRITE: u32 = 0x0000_1000;

const RCV_TRAILER_SHIFT: u32 = 24;
const RCV_TRAILER_MASK: u32 = 0xf << RCV_TRAILER_SHIFT;

/// Trailer elements requested by a receive (MACH_RCV_TRAILER_ELEMENTS)
pub const fn mach_rcv_trailer_elements(elements: u32) -> u32 {
    (elements & 0xf) << RCV_TRAILER_SHIFT
}

// ============================================================================
// Message Return Codes
// ============================================================================

/// Operation successful
pub const MACH_MSG_SUCCESS: i32 = 0;

/// Invalid data (message, buffer, etc.)
pub const MACH_SEND_INVALID_DATA: i32 = 0x1000_0002;
/// Invalid destination port
pub const MACH_SEND_INVALID_DEST: i32 = 0x1000_0003;
/// Operation timed out
pub const MACH_SEND_TIMED_OUT: i32 = 0x1000_0004;
/// Operation interrupted
pub const MACH_SEND_INTERRUPTED: i32 = 0x1000_0007;
/// Message shorter than a header, or misaligned
pub const MACH_SEND_MSG_TOO_SMALL: i32 = 0x1000_0008;
/// Invalid reply port
pub const MACH_SEND_INVALID_REPLY: i32 = 0x1000_0009;
/// Invalid port right in the body
pub const MACH_SEND_INVALID_RIGHT: i32 = 0x1000_000a;
/// Invalid out-of-line memory
pub const MACH_SEND_INVALID_MEMORY: i32 = 0x1000_000c;
/// Resource shortage
pub const MACH_SEND_NO_BUFFER: i32 = 0x1000_000d;
/// Message too large
pub const MACH_SEND_TOO_LARGE: i32 = 0x1000_000e;
/// Invalid descriptor type, disposition or copy option
pub const MACH_SEND_INVALID_TYPE: i32 = 0x1000_000f;
/// Invalid header
pub const MACH_SEND_INVALID_HEADER: i32 = 0x1000_0010;

/// Invalid receive name
pub const MACH_RCV_INVALID_NAME: i32 = 0x1000_4002;
/// Operation timed out
pub const MACH_RCV_TIMED_OUT: i32 = 0x1000_4003;
/// Message too large for buffer
pub const MACH_RCV_TOO_LARGE: i32 = 0x1000_4004;
/// Operation interrupted
pub const MACH_RCV_INTERRUPTED: i32 = 0x1000_4005;
/// Port died during receive
pub const MACH_RCV_PORT_DIED: i32 = 0x1000_4009;
/// Port is a member of a set
pub const MACH_RCV_IN_SET: i32 = 0x1000_400a;
/// Header copy-out failed
pub const MACH_RCV_HEADER_ERROR: i32 = 0x1000_400b;
/// Body copy-out failed
pub const MACH_RCV_BODY_ERROR: i32 = 0x1000_400c;
/// Scatter list type does not match the message
pub const MACH_RCV_INVALID_TYPE: i32 = 0x1000_400d;
/// Scatter region too small
pub const MACH_RCV_SCATTER_SMALL: i32 = 0x1000_400e;

/// Special bits qualifying header/body errors
pub const MACH_MSG_MASK: i32 = 0x0000_3e00;
pub const MACH_MSG_IPC_SPACE: i32 = 0x0000_2000;
pub const MACH_MSG_VM_SPACE: i32 = 0x0000_1000;
pub const MACH_MSG_IPC_KERNEL: i32 = 0x0000_0800;
pub const MACH_MSG_VM_KERNEL: i32 = 0x0000_0400;

const SEND_ERROR_BASE: i32 = 0x1000_0000;
const RCV_ERROR_BASE: i32 = 0x1000_4000;
const ERROR_BASE_MASK: i32 = !0x3fff;

// ============================================================================
// mach_msg Options
// ============================================================================

/// Options for mach_msg operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachMsgOptions {
    /// Option flags
    pub flags: u32,
    /// Send timeout (if MACH_SEND_TIMEOUT set)
    pub send_timeout: Duration,
    /// Receive timeout (if MACH_RCV_TIMEOUT set)
    pub rcv_timeout: Duration,
}

impl MachMsgOptions {
    /// Options from raw flags
    pub fn from_raw(flags: u32) -> Self {
        Self {
            flags,
            send_timeout: Duration::ZERO,
            rcv_timeout: Duration::ZERO,
        }
    }

    /// Create options for send only
    pub fn send() -> Self {
        Self::from_raw(MACH_SEND_MSG)
    }

    /// Create options for receive only
    pub fn receive() -> Self {
        Self::from_raw(MACH_RCV_MSG | mach_rcv_trailer_elements(DEFAULT_TRAILER as u32))
    }

    /// Create options for send+receive (RPC)
    pub fn rpc() -> Self {
        Self::from_raw(
            MACH_SEND_MSG | MACH_RCV_MSG | mach_rcv_trailer_elements(DEFAULT_TRAILER as u32),
        )
    }

    /// Add send timeout
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.flags |= MACH_SEND_TIMEOUT;
        self.send_timeout = timeout;
        self
    }

    /// Add receive timeout
    pub fn with_rcv_timeout(mut self, timeout: Duration) -> Self {
        self.flags |= MACH_RCV_TIMEOUT;
        self.rcv_timeout = timeout;
        self
    }

    pub fn with_trailer(mut self, level: TrailerLevel) -> Self {
        self.flags = (self.flags & !RCV_TRAILER_MASK) | mach_rcv_trailer_elements(level as u32);
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags |= flags;
        self
    }

    pub fn should_send(&self) -> bool {
        (self.flags & MACH_SEND_MSG) != 0
    }

    pub fn should_receive(&self) -> bool {
        (self.flags & MACH_RCV_MSG) != 0
    }

    fn has(&self, flag: u32) -> bool {
        (self.flags & flag) != 0
    }

    /// Trailer level a receive appends
    pub fn trailer(&self) -> TrailerLevel {
        TrailerLevel::from_elements((self.flags & RCV_TRAILER_MASK) >> RCV_TRAILER_SHIFT)
    }

    fn send_wait(&self) -> MsgWait {
        if self.has(MACH_SEND_TIMEOUT) {
            MsgWait::timeout(self.send_timeout)
        } else {
            MsgWait::Forever
        }
    }

    fn rcv_wait(&self) -> MsgWait {
        if self.has(MACH_RCV_TIMEOUT) {
            MsgWait::timeout(self.rcv_timeout)
        } else {
            MsgWait::Forever
        }
    }
}

impl Default for MachMsgOptions {
    fn default() -> Self {
        Self::from_raw(0)
    }
}

// ============================================================================
// Message Return Type
// ============================================================================

/// Return value from mach_msg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachMsgReturn(pub i32);

impl MachMsgReturn {
    pub const SUCCESS: Self = Self(MACH_MSG_SUCCESS);

    pub fn is_success(self) -> bool {
        self.0 == MACH_MSG_SUCCESS
    }

    /// Code with the special bits stripped
    pub fn base(self) -> i32 {
        self.0 & !MACH_MSG_MASK
    }

    /// MACH_MSG_IPC_SPACE / MACH_MSG_VM_SPACE / ... bits
    pub fn special_bits(self) -> i32 {
        self.0 & MACH_MSG_MASK
    }

    pub fn is_send_error(self) -> bool {
        (self.base() & ERROR_BASE_MASK) == SEND_ERROR_BASE
    }

    pub fn is_rcv_error(self) -> bool {
        (self.base() & ERROR_BASE_MASK) == RCV_ERROR_BASE
    }

    /// Get error name for debugging
    pub fn name(self) -> &'static str {
        match self.base() {
            MACH_MSG_SUCCESS => "SUCCESS",
            MACH_SEND_INVALID_DATA => "SEND_INVALID_DATA",
            MACH_SEND_INVALID_DEST => "SEND_INVALID_DEST",
            MACH_SEND_TIMED_OUT => "SEND_TIMED_OUT",
            MACH_SEND_INTERRUPTED => "SEND_INTERRUPTED",
            MACH_SEND_MSG_TOO_SMALL => "SEND_MSG_TOO_SMALL",
            MACH_SEND_INVALID_REPLY => "SEND_INVALID_REPLY",
            MACH_SEND_INVALID_RIGHT => "SEND_INVALID_RIGHT",
            MACH_SEND_INVALID_MEMORY => "SEND_INVALID_MEMORY",
            MACH_SEND_NO_BUFFER => "SEND_NO_BUFFER",
            MACH_SEND_TOO_LARGE => "SEND_TOO_LARGE",
            MACH_SEND_INVALID_TYPE => "SEND_INVALID_TYPE",
            MACH_SEND_INVALID_HEADER => "SEND_INVALID_HEADER",
            MACH_RCV_INVALID_NAME => "RCV_INVALID_NAME",
            MACH_RCV_TIMED_OUT => "RCV_TIMED_OUT",
            MACH_RCV_TOO_LARGE => "RCV_TOO_LARGE",
            MACH_RCV_INTERRUPTED => "RCV_INTERRUPTED",
            MACH_RCV_PORT_DIED => "RCV_PORT_DIED",
            MACH_RCV_IN_SET => "RCV_IN_SET",
            MACH_RCV_HEADER_ERROR => "RCV_HEADER_ERROR",
            MACH_RCV_BODY_ERROR => "RCV_BODY_ERROR",
            MACH_RCV_INVALID_TYPE => "RCV_INVALID_TYPE",
            MACH_RCV_SCATTER_SMALL => "RCV_SCATTER_SMALL",
            _ => "UNKNOWN",
        }
    }

    /// Send-side code for a copy-in or enqueue failure
    pub fn for_send(err: KmsgError) -> Self {
        let code = match (err.error, err.fault) {
            (IpcError::InvalidCapability, Fault::Destination) => MACH_SEND_INVALID_DEST,
            (IpcError::InvalidCapability, Fault::Reply) => MACH_SEND_INVALID_REPLY,
            (IpcError::InvalidCapability, _) => MACH_SEND_INVALID_RIGHT,
            (IpcError::ObjectDied, _) => MACH_SEND_INVALID_DEST,
            (IpcError::InvalidMemory, _) => MACH_SEND_INVALID_MEMORY,
            (IpcError::InvalidHeader, Fault::Type) => MACH_SEND_INVALID_TYPE,
            (IpcError::InvalidHeader, _) => MACH_SEND_INVALID_HEADER,
            (IpcError::MessageTooSmall, _) => MACH_SEND_MSG_TOO_SMALL,
            (IpcError::TooLarge, _) => MACH_SEND_TOO_LARGE,
            (IpcError::ResourceExhausted, _) => MACH_SEND_NO_BUFFER,
            (IpcError::QueueFull | IpcError::TimedOut | IpcError::WouldBlock, _) => {
                MACH_SEND_TIMED_OUT
            }
            (IpcError::Interrupted, _) => MACH_SEND_INTERRUPTED,
            _ => MACH_SEND_INVALID_DATA,
        };
        Self(code)
    }

    /// Receive-side code for a dequeue, scatter or copy-out failure
    pub fn for_receive(err: KmsgError) -> Self {
        let code = match (err.error, err.fault) {
            (IpcError::InvalidScatterList, Fault::Type) => MACH_RCV_INVALID_TYPE,
            (IpcError::InvalidScatterList, _) => MACH_RCV_SCATTER_SMALL,
            (IpcError::TooLarge, _) => MACH_RCV_TOO_LARGE,
            (IpcError::TimedOut | IpcError::WouldBlock, _) => MACH_RCV_TIMED_OUT,
            (IpcError::Interrupted, _) => MACH_RCV_INTERRUPTED,
            (IpcError::ObjectDied, _) => MACH_RCV_PORT_DIED,
            (_, Fault::Memory) => MACH_RCV_BODY_ERROR | MACH_MSG_VM_SPACE,
            (_, Fault::Body) => MACH_RCV_BODY_ERROR | MACH_MSG_IPC_SPACE,
            (_, _) => MACH_RCV_HEADER_ERROR | MACH_MSG_IPC_SPACE,
        };
        Self(code)
    }
}

impl Default for MachMsgReturn {
    fn default() -> Self {
        Self::SUCCESS
    }
}

impl From<i32> for MachMsgReturn {
    fn from(code: i32) -> Self {
        Self(code)
    }
}

impl fmt::Display for MachMsgReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#x})", self.name(), self.0)
    }
}

// ============================================================================
// Message Buffer
// ============================================================================

/// Caller-side buffer for mach_msg
///
/// Holds the message to send and receives the reply in place. `capacity`
/// plays the role of the receive size: a pending message plus its trailer
/// must fit in it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsgBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl MsgBuffer {
    /// Empty buffer able to receive `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            capacity,
        }
    }

    /// Buffer holding an encoded message, sized to it
    pub fn from_message(msg: &UserMessage) -> Self {
        let data = msg.encode();
        let capacity = data.len();
        Self { data, capacity }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Replace the contents with `msg`, keeping the capacity
    pub fn set_message(&mut self, msg: &UserMessage) {
        self.data = msg.encode();
    }

    pub fn header(&self) -> IpcResult<MsgHeader> {
        MsgHeader::decode(&self.data)
    }

    /// The message part (header + body)
    pub fn message(&self) -> IpcResult<UserMessage> {
        let size = self.header()?.size as usize;
        let bytes = self.data.get(..size).ok_or(IpcError::MessageTooSmall)?;
        UserMessage::decode(bytes)
    }

    /// The trailer appended by a receive
    pub fn trailer(&self) -> IpcResult<(MsgTrailer, TrailerLevel)> {
        let size = round_msg(self.header()?.size as usize);
        let bytes = self.data.get(size..).ok_or(IpcError::MessageTooSmall)?;
        MsgTrailer::decode(bytes)
    }

    /// Bytes of the message to send
    fn send_bytes(&self) -> &[u8] {
        match self.header() {
            Ok(header) => self.data.get(..header.size as usize).unwrap_or(&self.data),
            Err(_) => &self.data,
        }
    }

    fn write_received(&mut self, msg: &UserMessage, trailer: &MsgTrailer, level: TrailerLevel) {
        let mut data = msg.encode();
        data.resize(round_msg(data.len()), 0);
        trailer.encode_into(level, &mut data);
        self.data = data;
    }

    fn write_header(&mut self, header: &MsgHeader) {
        self.data = header.encode();
    }

    fn write_header_and_trailer(
        &mut self,
        header: &MsgHeader,
        trailer: &MsgTrailer,
        level: TrailerLevel,
    ) {
        let mut data = header.encode();
        trailer.encode_into(level, &mut data);
        self.data = data;
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Statistics for mach_msg operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MachMsgStats {
    /// Total send operations
    pub sends: u64,
    /// Total receive operations
    pub receives: u64,
    /// Combined send+receive (RPC)
    pub rpcs: u64,
    /// Send and receive timeouts
    pub timeouts: u64,
    /// Failed phases other than timeouts and too-large probes
    pub errors: u64,
    /// Receives that found the buffer too small
    pub too_large: u64,
}

const ZERO_STATS: MachMsgStats = MachMsgStats {
    sends: 0,
    receives: 0,
    rpcs: 0,
    timeouts: 0,
    errors: 0,
    too_large: 0,
};

static STATS: Mutex<MachMsgStats> = Mutex::new(ZERO_STATS);

/// Get mach_msg statistics
pub fn stats() -> MachMsgStats {
    *STATS.lock()
}

pub fn reset_stats() {
    *STATS.lock() = ZERO_STATS;
}

fn record(ret: MachMsgReturn) {
    let mut stats = STATS.lock();
    match ret.base() {
        MACH_MSG_SUCCESS => {}
        MACH_SEND_TIMED_OUT | MACH_RCV_TIMED_OUT => stats.timeouts += 1,
        MACH_RCV_TOO_LARGE => stats.too_large += 1,
        _ => stats.errors += 1,
    }
}

// ============================================================================
// mach_msg Implementation
// ============================================================================

/// The mach_msg system call
///
/// This is the main IPC primitive. It can:
/// - Send the message in `buf` (MACH_SEND_MSG)
/// - Receive on `rcv_name` into `buf` (MACH_RCV_MSG)
/// - Send then receive (both flags - RPC optimization)
///
/// `scatter` is only consulted with MACH_RCV_OVERWRITE. When the receive
/// fails with TooLarge or a dead port, `buf` still holds the header (and
/// for a dead port the trailer) describing the outcome.
pub fn mach_msg(
    task: &IpcTask,
    buf: &mut MsgBuffer,
    options: MachMsgOptions,
    rcv_name: PortName,
    scatter: Option<&[MsgDescriptor]>,
) -> MachMsgReturn {
    if options.should_send() && options.should_receive() {
        STATS.lock().rpcs += 1;
    }

    if options.should_send() {
        STATS.lock().sends += 1;
        let ret = send_phase(task, buf, &options);
        record(ret);
        if !ret.is_success() {
            return ret;
        }
    }

    if options.should_receive() {
        STATS.lock().receives += 1;
        let ret = receive_phase(task, buf, &options, rcv_name, scatter);
        record(ret);
        return ret;
    }

    MachMsgReturn::SUCCESS
}

/// Send the message in `buf` with default options
pub fn mach_msg_send(task: &IpcTask, buf: &mut MsgBuffer) -> MachMsgReturn {
    mach_msg(task, buf, MachMsgOptions::send(), PortName::NULL, None)
}

/// Receive on `rcv_name` into `buf` with default options
pub fn mach_msg_receive(task: &IpcTask, buf: &mut MsgBuffer, rcv_name: PortName) -> MachMsgReturn {
    mach_msg(task, buf, MachMsgOptions::receive(), rcv_name, None)
}

fn send_phase(task: &IpcTask, buf: &mut MsgBuffer, options: &MachMsgOptions) -> MachMsgReturn {
    let mut kmsg = match IpcKmsg::copyin(buf.send_bytes(), task) {
        Ok(kmsg) => kmsg,
        Err(err) => {
            debug!("mach_msg send: copyin failed: {}", err);
            return MachMsgReturn::for_send(err);
        }
    };
    let Some(port) = kmsg.destination().cloned() else {
        kmsg::destroy(kmsg);
        return MachMsgReturn(MACH_SEND_INVALID_DEST);
    };

    let id = kmsg.id();
    let wait = options.send_wait();
    loop {
        match port.enqueue(kmsg, wait) {
            Ok(()) => {
                trace!("mach_msg send: id {} queued", id);
                return MachMsgReturn::SUCCESS;
            }
            Err((IpcError::Interrupted, returned)) if !options.has(MACH_SEND_INTERRUPT) => {
                kmsg = returned;
            }
            Err((IpcError::ObjectDied, returned)) => {
                kmsg::destroy(returned);
                return MachMsgReturn(MACH_SEND_INVALID_DEST);
            }
            Err((error, returned)) => {
                // The sender gets its message back instead of losing it.
                debug!("mach_msg send: id {} not queued ({}), pseudo-receive", id, error);
                let msg = returned.copyout_pseudo(task);
                buf.set_message(&msg);
                return MachMsgReturn::for_send(KmsgError::new(error, Fault::Destination));
            }
        }
    }
}

/// What the receive probe saw in a message it refused
#[derive(Debug, Default)]
struct Refusal {
    needed: usize,
    id: i32,
    fault: Option<Fault>,
}

fn receive_phase(
    task: &IpcTask,
    buf: &mut MsgBuffer,
    options: &MachMsgOptions,
    rcv_name: PortName,
    scatter: Option<&[MsgDescriptor]>,
) -> MachMsgReturn {
    let target = match task.space.lookup_receive(rcv_name) {
        Ok(target) => target,
        Err(_) => return MachMsgReturn(MACH_RCV_INVALID_NAME),
    };
    let level = options.trailer();
    let scatter = if options.has(MACH_RCV_OVERWRITE) {
        Some(scatter.unwrap_or(&[]))
    } else {
        None
    };
    let capacity = buf.capacity();
    let wait = options.rcv_wait();

    let mut refusal = Refusal::default();
    let mut probe = |kmsg: &IpcKmsg| -> IpcResult<()> {
        let needed = kmsg.copyout_size() + level.size();
        if needed > capacity {
            refusal = Refusal {
                needed,
                id: kmsg.id(),
                fault: None,
            };
            return Err(IpcError::TooLarge);
        }
        if let Some(scatter) = scatter {
            if let Err(err) = kmsg.check_scatter(scatter) {
                refusal.fault = Some(err.fault);
                return Err(err.error);
            }
        }
        Ok(())
    };

    let result = loop {
        let result = match &target {
            ReceiveTarget::Port(port) => port.dequeue(wait, &mut probe),
            ReceiveTarget::PortSet(set) => set.dequeue(wait, &mut probe),
        };
        match result {
            Err(IpcError::Interrupted) if !options.has(MACH_RCV_INTERRUPT) => continue,
            other => break other,
        }
    };

    let kmsg = match result {
        Ok(kmsg) => kmsg,
        Err(IpcError::TooLarge) => {
            trace!(
                "mach_msg receive: id {} needs {} bytes, buffer has {}",
                refusal.id,
                refusal.needed,
                capacity
            );
            let header = MsgHeader {
                bits: MsgBits::default(),
                size: refusal.needed as u32,
                remote: PortName::NULL,
                local: rcv_name,
                voucher: PortName::NULL,
                id: refusal.id,
            };
            if capacity >= HEADER_SIZE {
                buf.write_header(&header);
            }
            return MachMsgReturn(MACH_RCV_TOO_LARGE);
        }
        Err(IpcError::ObjectDied) => {
            let (header, trailer) = IpcKmsg::dead_notification(rcv_name);
            buf.write_header_and_trailer(&header, &trailer, level);
            return MachMsgReturn(MACH_RCV_PORT_DIED);
        }
        Err(error) => {
            let fault = refusal.fault.unwrap_or(Fault::Header);
            return MachMsgReturn::for_receive(KmsgError::new(error, fault));
        }
    };

    match kmsg.copyout(task, scatter) {
        Ok((msg, trailer)) => {
            trace!(
                "mach_msg receive: id {} seqno {} on {}",
                msg.header.id,
                trailer.seqno,
                rcv_name
            );
            buf.write_received(&msg, &trailer, level);
            MachMsgReturn::SUCCESS
        }
        Err((err, header)) => {
            debug!("mach_msg receive: copyout failed: {}", err);
            buf.write_header(&header);
            MachMsgReturn::for_receive(err)
        }
    }
}
