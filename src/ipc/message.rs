//! Mach message wire format
//!
//! Based on Mach4 mach/message.h
//!
//! This is the only place that knows byte offsets. Everything above works
//! on [`UserMessage`] (names and addresses, as a task sees them) or on the
//! kernel form in [`super::kmsg`].
//!
//! ## Layout (little endian)
//!
//! ```text
//! header   bits:u32 size:u32 remote:u32 local:u32 voucher:u32 id:i32   24 bytes
//! body     count:u32 then `count` descriptors          (complex messages only)
//! inline   remaining bytes up to header.size
//! trailer  at round_msg(header.size), receive side only
//! ```
//!
//! Port descriptors are 12 bytes, out-of-line and out-of-line-ports
//! descriptors are 16 bytes. The descriptor type always lives in byte 11.

use core::fmt;

use super::{IpcError, IpcResult, PortName};

// ============================================================================
// Sizes and bits
// ============================================================================

/// Size of the fixed header
pub const HEADER_SIZE: usize = 24;

/// Size of the body descriptor count
pub const BODY_COUNT_SIZE: usize = 4;

/// Size of a port descriptor
pub const PORT_DESCRIPTOR_SIZE: usize = 12;

/// Size of an out-of-line or out-of-line-ports descriptor
pub const OOL_DESCRIPTOR_SIZE: usize = 16;

/// Message sizes and trailer offsets are multiples of this
pub const MSG_ALIGNMENT: usize = 4;

/// Round a message size up to the trailer boundary
#[inline]
pub const fn round_msg(size: usize) -> usize {
    (size + MSG_ALIGNMENT - 1) & !(MSG_ALIGNMENT - 1)
}

/// Message bits (msgh_bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgBits(pub u32);

impl MsgBits {
    /// Remote port type mask
    pub const REMOTE_MASK: u32 = 0x0000_001f;
    /// Local port type mask
    pub const LOCAL_MASK: u32 = 0x0000_1f00;
    /// Voucher port type mask
    pub const VOUCHER_MASK: u32 = 0x001f_0000;
    /// Complex message (has descriptors)
    pub const COMPLEX: u32 = 0x8000_0000;

    pub fn new(remote: u32, local: u32) -> Self {
        Self((remote & Self::REMOTE_MASK) | ((local << 8) & Self::LOCAL_MASK))
    }

    /// Raw disposition of the remote (destination) port
    pub fn remote(self) -> u32 {
        self.0 & Self::REMOTE_MASK
    }

    /// Raw disposition of the local (reply) port
    pub fn local(self) -> u32 {
        (self.0 & Self::LOCAL_MASK) >> 8
    }

    pub fn voucher(self) -> u32 {
        (self.0 & Self::VOUCHER_MASK) >> 16
    }

    pub fn is_complex(self) -> bool {
        (self.0 & Self::COMPLEX) != 0
    }

    pub fn with_complex(self, complex: bool) -> Self {
        if complex {
            Self(self.0 | Self::COMPLEX)
        } else {
            Self(self.0 & !Self::COMPLEX)
        }
    }
}

impl fmt::Display for MsgBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remote={} local={}", self.remote(), self.local())?;
        if self.voucher() != 0 {
            write!(f, " voucher={}", self.voucher())?;
        }
        if self.is_complex() {
            f.write_str(" complex")?;
        }
        Ok(())
    }
}

// ============================================================================
// Header
// ============================================================================

/// Message header (mach_msg_header_t)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgHeader {
    pub bits: MsgBits,
    /// Size of header + body in bytes (trailer excluded)
    pub size: u32,
    /// Destination on send, reply port on receive
    pub remote: PortName,
    /// Reply port on send, destination on receive
    pub local: PortName,
    pub voucher: PortName,
    /// Application-defined operation id
    pub id: i32,
}

impl MsgHeader {
    /// Header for a simple message to `remote`
    pub fn new(remote: PortName, remote_disposition: u32, id: i32) -> Self {
        Self {
            bits: MsgBits::new(remote_disposition, 0),
            size: HEADER_SIZE as u32,
            remote,
            local: PortName::NULL,
            voucher: PortName::NULL,
            id,
        }
    }

    /// Attach a reply port
    pub fn with_reply(mut self, local: PortName, local_disposition: u32) -> Self {
        self.local = local;
        self.bits = MsgBits(
            (self.bits.0 & !MsgBits::LOCAL_MASK) | ((local_disposition << 8) & MsgBits::LOCAL_MASK),
        );
        self
    }

    /// Decode a header from the start of `bytes`
    pub fn decode(bytes: &[u8]) -> IpcResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(IpcError::MessageTooSmall);
        }
        Ok(Self {
            bits: MsgBits(read_u32(bytes, 0)),
            size: read_u32(bytes, 4),
            remote: PortName::from_raw(read_u32(bytes, 8)),
            local: PortName::from_raw(read_u32(bytes, 12)),
            voucher: PortName::from_raw(read_u32(bytes, 16)),
            id: read_u32(bytes, 20) as i32,
        })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.bits.0.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.remote.as_raw().to_le_bytes());
        out.extend_from_slice(&self.local.as_raw().to_le_bytes());
        out.extend_from_slice(&self.voucher.as_raw().to_le_bytes());
        out.extend_from_slice(&self.id.to_le_bytes());
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE);
        self.encode_into(&mut out);
        out
    }
}

// ============================================================================
// Descriptors
// ============================================================================

/// Descriptor type tag (byte 11 of every descriptor)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DescriptorType {
    Port = 0,
    OutOfLine = 1,
    OolPorts = 2,
    OutOfLineVolatile = 3,
}

impl DescriptorType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Port),
            1 => Some(Self::OutOfLine),
            2 => Some(Self::OolPorts),
            3 => Some(Self::OutOfLineVolatile),
            _ => None,
        }
    }

    /// Encoded size of a descriptor of this type
    pub fn wire_size(self) -> usize {
        match self {
            Self::Port => PORT_DESCRIPTOR_SIZE,
            _ => OOL_DESCRIPTOR_SIZE,
        }
    }
}

/// Out-of-line copy strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CopyOption {
    Physical = 0,
    Virtual = 1,
    /// Receive side: let the kernel choose the address
    Allocate = 2,
    /// Receive side: write into the caller-supplied scatter region
    Overwrite = 3,
}

impl CopyOption {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Physical),
            1 => Some(Self::Virtual),
            2 => Some(Self::Allocate),
            3 => Some(Self::Overwrite),
            _ => None,
        }
    }
}

/// One body descriptor as the task sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgDescriptor {
    Port {
        name: PortName,
        /// Raw `MsgTypeName` value
        disposition: u8,
    },
    OutOfLine {
        address: u64,
        size: u32,
        deallocate: bool,
        copy: CopyOption,
        volatile: bool,
    },
    OolPorts {
        /// Address of a `count`-long array of u32 port names
        address: u64,
        count: u32,
        deallocate: bool,
        copy: CopyOption,
        disposition: u8,
    },
}

impl MsgDescriptor {
    pub fn port(name: PortName, disposition: u32) -> Self {
        MsgDescriptor::Port {
            name,
            disposition: disposition as u8,
        }
    }

    pub fn out_of_line(address: u64, size: u32, deallocate: bool) -> Self {
        MsgDescriptor::OutOfLine {
            address,
            size,
            deallocate,
            copy: CopyOption::Virtual,
            volatile: false,
        }
    }

    pub fn ool_ports(address: u64, count: u32, disposition: u32, deallocate: bool) -> Self {
        MsgDescriptor::OolPorts {
            address,
            count,
            deallocate,
            copy: CopyOption::Virtual,
            disposition: disposition as u8,
        }
    }

    pub fn descriptor_type(&self) -> DescriptorType {
        match self {
            MsgDescriptor::Port { .. } => DescriptorType::Port,
            MsgDescriptor::OutOfLine { volatile: false, .. } => DescriptorType::OutOfLine,
            MsgDescriptor::OutOfLine { volatile: true, .. } => DescriptorType::OutOfLineVolatile,
            MsgDescriptor::OolPorts { .. } => DescriptorType::OolPorts,
        }
    }

    pub fn wire_size(&self) -> usize {
        self.descriptor_type().wire_size()
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let ty = self.descriptor_type() as u32;
        match *self {
            MsgDescriptor::Port { name, disposition } => {
                out.extend_from_slice(&name.as_raw().to_le_bytes());
                out.extend_from_slice(&0u32.to_le_bytes());
                let word = ((disposition as u32) << 16) | (ty << 24);
                out.extend_from_slice(&word.to_le_bytes());
            }
            MsgDescriptor::OutOfLine {
                address,
                size,
                deallocate,
                copy,
                ..
            } => {
                out.extend_from_slice(&address.to_le_bytes());
                let word = (deallocate as u32) | ((copy as u32) << 8) | (ty << 24);
                out.extend_from_slice(&word.to_le_bytes());
                out.extend_from_slice(&size.to_le_bytes());
            }
            MsgDescriptor::OolPorts {
                address,
                count,
                deallocate,
                copy,
                disposition,
            } => {
                out.extend_from_slice(&address.to_le_bytes());
                let word = (deallocate as u32)
                    | ((copy as u32) << 8)
                    | ((disposition as u32) << 16)
                    | (ty << 24);
                out.extend_from_slice(&word.to_le_bytes());
                out.extend_from_slice(&count.to_le_bytes());
            }
        }
    }

    /// Decode one descriptor; returns it and its encoded size
    fn decode(bytes: &[u8]) -> IpcResult<(Self, usize)> {
        if bytes.len() < PORT_DESCRIPTOR_SIZE {
            return Err(IpcError::MessageTooSmall);
        }
        let ty = DescriptorType::from_raw(bytes[11]).ok_or(IpcError::InvalidHeader)?;
        let size = ty.wire_size();
        if bytes.len() < size {
            return Err(IpcError::MessageTooSmall);
        }

        let desc = match ty {
            DescriptorType::Port => MsgDescriptor::Port {
                name: PortName::from_raw(read_u32(bytes, 0)),
                disposition: bytes[10],
            },
            DescriptorType::OutOfLine | DescriptorType::OutOfLineVolatile => {
                MsgDescriptor::OutOfLine {
                    address: read_u64(bytes, 0),
                    deallocate: bytes[8] != 0,
                    copy: CopyOption::from_raw(bytes[9]).ok_or(IpcError::InvalidHeader)?,
                    volatile: ty == DescriptorType::OutOfLineVolatile,
                    size: read_u32(bytes, 12),
                }
            }
            DescriptorType::OolPorts => MsgDescriptor::OolPorts {
                address: read_u64(bytes, 0),
                deallocate: bytes[8] != 0,
                copy: CopyOption::from_raw(bytes[9]).ok_or(IpcError::InvalidHeader)?,
                disposition: bytes[10],
                count: read_u32(bytes, 12),
            },
        };
        Ok((desc, size))
    }
}

// ============================================================================
// User message
// ============================================================================

/// A complete message in its task-visible form
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserMessage {
    pub header: MsgHeader,
    pub descriptors: Vec<MsgDescriptor>,
    /// Inline data following the descriptors
    pub inline: Vec<u8>,
}

impl UserMessage {
    pub fn new(header: MsgHeader) -> Self {
        Self {
            header,
            descriptors: Vec::new(),
            inline: Vec::new(),
        }
    }

    pub fn with_descriptor(mut self, desc: MsgDescriptor) -> Self {
        self.descriptors.push(desc);
        self
    }

    pub fn with_inline(mut self, data: &[u8]) -> Self {
        self.inline.extend_from_slice(data);
        self
    }

    pub fn is_complex(&self) -> bool {
        !self.descriptors.is_empty()
    }

    /// Encoded size of header + body, inline data padded to the alignment
    pub fn encoded_len(&self) -> usize {
        let body = if self.is_complex() {
            BODY_COUNT_SIZE + self.descriptors.iter().map(|d| d.wire_size()).sum::<usize>()
        } else {
            0
        };
        HEADER_SIZE + body + round_msg(self.inline.len())
    }

    /// Encode, fixing up `size` and the complex bit to match the contents
    pub fn encode(&self) -> Vec<u8> {
        let len = self.encoded_len();
        let mut header = self.header;
        header.size = len as u32;
        header.bits = header.bits.with_complex(self.is_complex());

        let mut out = Vec::with_capacity(len);
        header.encode_into(&mut out);
        if self.is_complex() {
            out.extend_from_slice(&(self.descriptors.len() as u32).to_le_bytes());
            for desc in &self.descriptors {
                desc.encode_into(&mut out);
            }
        }
        out.extend_from_slice(&self.inline);
        out.resize(len, 0);
        out
    }

    /// Decode and validate a message occupying exactly `bytes`
    pub fn decode(bytes: &[u8]) -> IpcResult<Self> {
        let header = MsgHeader::decode(bytes)?;
        let size = header.size as usize;
        if size < HEADER_SIZE || size % MSG_ALIGNMENT != 0 {
            return Err(IpcError::MessageTooSmall);
        }
        if size != bytes.len() {
            return Err(IpcError::InvalidHeader);
        }

        let mut body = &bytes[HEADER_SIZE..];
        let mut descriptors = Vec::new();
        if header.bits.is_complex() {
            if body.len() < BODY_COUNT_SIZE {
                return Err(IpcError::MessageTooSmall);
            }
            let count = read_u32(body, 0) as usize;
            if count == 0 {
                return Err(IpcError::InvalidHeader);
            }
            body = &body[BODY_COUNT_SIZE..];
            descriptors.reserve(count.min(body.len() / PORT_DESCRIPTOR_SIZE));
            for _ in 0..count {
                let (desc, used) = MsgDescriptor::decode(body)?;
                descriptors.push(desc);
                body = &body[used..];
            }
        }

        Ok(Self {
            header,
            descriptors,
            inline: body.to_vec(),
        })
    }
}

// ============================================================================
// Trailer
// ============================================================================

/// Trailer format 0
pub const TRAILER_FORMAT_0: u32 = 0;

/// How much of the trailer a receiver asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u32)]
pub enum TrailerLevel {
    /// type + size
    #[default]
    Null = 0,
    /// + sequence number
    Seqno = 1,
    /// + security token
    Sender = 2,
    /// + audit token
    Audit = 3,
    /// + port context
    Context = 4,
}

impl TrailerLevel {
    /// Level from the MACH_RCV_TRAILER_ELEMENTS field; larger values clamp
    pub fn from_elements(elements: u32) -> Self {
        match elements {
            0 => Self::Null,
            1 => Self::Seqno,
            2 => Self::Sender,
            3 => Self::Audit,
            _ => Self::Context,
        }
    }

    /// Encoded size in bytes
    pub fn size(self) -> usize {
        match self {
            Self::Null => 8,
            Self::Seqno => 12,
            Self::Sender => 20,
            Self::Audit => 52,
            Self::Context => 60,
        }
    }
}

/// Sender security token (security_token_t)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecurityToken(pub [u32; 2]);

impl SecurityToken {
    pub const KERNEL: Self = Self([0, 0]);
}

/// Sender audit token (audit_token_t)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuditToken(pub [u32; 8]);

impl AuditToken {
    pub const KERNEL: Self = Self([0; 8]);
}

/// Receive-side trailer (mach_msg_max_trailer_t)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgTrailer {
    pub seqno: u32,
    pub sender: SecurityToken,
    pub audit: AuditToken,
    pub context: u64,
}

impl MsgTrailer {
    /// Trailer of a kernel-generated message
    pub fn kernel() -> Self {
        Self {
            seqno: 0,
            sender: SecurityToken::KERNEL,
            audit: AuditToken::KERNEL,
            context: 0,
        }
    }

    pub fn encode_into(&self, level: TrailerLevel, out: &mut Vec<u8>) {
        out.extend_from_slice(&TRAILER_FORMAT_0.to_le_bytes());
        out.extend_from_slice(&(level.size() as u32).to_le_bytes());
        if level >= TrailerLevel::Seqno {
            out.extend_from_slice(&self.seqno.to_le_bytes());
        }
        if level >= TrailerLevel::Sender {
            for word in self.sender.0 {
                out.extend_from_slice(&word.to_le_bytes());
            }
        }
        if level >= TrailerLevel::Audit {
            for word in self.audit.0 {
                out.extend_from_slice(&word.to_le_bytes());
            }
        }
        if level >= TrailerLevel::Context {
            out.extend_from_slice(&self.context.to_le_bytes());
        }
    }

    /// Decode a trailer; fields beyond its recorded size read as zero
    pub fn decode(bytes: &[u8]) -> IpcResult<(Self, TrailerLevel)> {
        if bytes.len() < TrailerLevel::Null.size() {
            return Err(IpcError::MessageTooSmall);
        }
        let size = read_u32(bytes, 4) as usize;
        let level = [
            TrailerLevel::Context,
            TrailerLevel::Audit,
            TrailerLevel::Sender,
            TrailerLevel::Seqno,
            TrailerLevel::Null,
        ]
        .into_iter()
        .find(|l| l.size() == size)
        .ok_or(IpcError::InvalidHeader)?;
        if bytes.len() < size {
            return Err(IpcError::MessageTooSmall);
        }

        let mut trailer = Self::default();
        if level >= TrailerLevel::Seqno {
            trailer.seqno = read_u32(bytes, 8);
        }
        if level >= TrailerLevel::Sender {
            trailer.sender = SecurityToken([read_u32(bytes, 12), read_u32(bytes, 16)]);
        }
        if level >= TrailerLevel::Audit {
            for (i, word) in trailer.audit.0.iter_mut().enumerate() {
                *word = read_u32(bytes, 20 + 4 * i);
            }
        }
        if level >= TrailerLevel::Context {
            trailer.context = read_u64(bytes, 52);
        }
        Ok((trailer, level))
    }
}

// ============================================================================
// Helpers
// ============================================================================

#[inline]
pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

#[inline]
pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(word)
}
