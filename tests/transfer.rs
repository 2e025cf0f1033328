//! Right and memory transfer through mach_msg
//!
//! Round trips of port rights and out-of-line regions between two tasks,
//! full rollback when the receiving space or map refuses part of a
//! message, the too-large probe, scatter receives and pseudo-receive.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mach_ipc::config::{IpcConfig, QueueLimit};
use mach_ipc::ipc::mach_msg::{
    mach_msg, mach_msg_receive, mach_msg_send, MachMsgOptions, MachMsgReturn, MsgBuffer,
    MACH_MSG_IPC_SPACE, MACH_MSG_VM_SPACE, MACH_RCV_BODY_ERROR, MACH_RCV_INVALID_TYPE,
    MACH_RCV_OVERWRITE, MACH_RCV_SCATTER_SMALL, MACH_RCV_TOO_LARGE, MACH_SEND_INVALID_REPLY,
    MACH_SEND_INVALID_RIGHT, MACH_SEND_TIMED_OUT,
};
use mach_ipc::ipc::message::{
    CopyOption, MsgDescriptor, MsgHeader, UserMessage, HEADER_SIZE,
};
use mach_ipc::ipc::space::{IpcSpace, ReceiveTarget, SimpleSpace};
use mach_ipc::ipc::{MsgTypeName, Port, PortRight};
use mach_ipc::vm::{SimpleMap, VmAddress, VmMap, VmMapCopy};
use mach_ipc::{IpcError, IpcResult, IpcTask, PortName};

const MAKE_SEND: u32 = MsgTypeName::MakeSend as u32;
const MOVE_SEND: u32 = MsgTypeName::MoveSend as u32;
const COPY_SEND: u32 = MsgTypeName::CopySend as u32;

// ════════════════════════════════════════════════════════════
// Failing collaborators
// ════════════════════════════════════════════════════════════

/// Succeed `budget` more times, then fail
struct Budget(AtomicUsize);

impl Budget {
    fn new(n: usize) -> Self {
        Self(AtomicUsize::new(n))
    }

    fn spend(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// A space that runs out of names after a few inserts
struct FailingSpace {
    inner: Arc<SimpleSpace>,
    inserts: Budget,
}

impl IpcSpace for FailingSpace {
    fn resolve_name(&self, name: PortName, disposition: MsgTypeName) -> IpcResult<PortRight> {
        self.inner.resolve_name(name, disposition)
    }

    fn check_name(&self, name: PortName, disposition: MsgTypeName) -> IpcResult<()> {
        self.inner.check_name(name, disposition)
    }

    fn insert_name(&self, right: PortRight) -> IpcResult<PortName> {
        if !self.inserts.spend() {
            return Err(IpcError::ResourceExhausted);
        }
        self.inner.insert_name(right)
    }

    fn lookup_receive(&self, name: PortName) -> IpcResult<ReceiveTarget> {
        self.inner.lookup_receive(name)
    }

    fn receive_name(&self, port: &Arc<Port>) -> Option<PortName> {
        self.inner.receive_name(port)
    }
}

/// A map that runs out of room after a few mappings
struct FailingMap {
    inner: Arc<SimpleMap>,
    maps: Budget,
}

impl VmMap for FailingMap {
    fn pin_region(&self, address: VmAddress, size: usize) -> IpcResult<VmMapCopy> {
        self.inner.pin_region(address, size)
    }

    fn deallocate(&self, address: VmAddress, size: usize) -> IpcResult<()> {
        self.inner.deallocate(address, size)
    }

    fn map_region(&self, copy: &VmMapCopy) -> IpcResult<VmAddress> {
        if !self.maps.spend() {
            return Err(IpcError::InvalidMemory);
        }
        self.inner.map_region(copy)
    }

    fn overwrite_region(&self, address: VmAddress, copy: &VmMapCopy) -> IpcResult<VmMapCopy> {
        self.inner.overwrite_region(address, copy)
    }

    fn unmap_region(&self, address: VmAddress, size: usize) -> IpcResult<()> {
        self.inner.unmap_region(address, size)
    }
}

// ════════════════════════════════════════════════════════════
// Fixture
// ════════════════════════════════════════════════════════════

/// A sender and a receiver task; the sender holds a send right to `dest`
struct Pair {
    sender: IpcTask,
    sspace: Arc<SimpleSpace>,
    smap: Arc<SimpleMap>,
    receiver: IpcTask,
    rspace: Arc<SimpleSpace>,
    rmap: Arc<SimpleMap>,
    /// Receive name in the receiver
    dest: PortName,
    /// Send name in the sender
    remote: PortName,
}

impl Pair {
    fn new() -> Self {
        Self::with_config(IpcConfig::default())
    }

    fn with_config(config: IpcConfig) -> Self {
        let (sender, sspace, smap) = IpcTask::with_config(config);
        let (receiver, rspace, rmap) = IpcTask::with_config(config);
        let dest = rspace.allocate_receive().unwrap();
        let port = rspace.port(dest).unwrap();
        let remote = sspace.insert_name(PortRight::new_send(&port)).unwrap();
        Self {
            sender,
            sspace,
            smap,
            receiver,
            rspace,
            rmap,
            dest,
            remote,
        }
    }

    fn dest_port(&self) -> Arc<Port> {
        self.rspace.port(self.dest).unwrap()
    }

    /// Sender-side receive rights plus the matching port objects
    fn carried_ports(&self, n: usize) -> Vec<(PortName, Arc<Port>)> {
        (0..n)
            .map(|_| {
                let name = self.sspace.allocate_receive().unwrap();
                (name, self.sspace.port(name).unwrap())
            })
            .collect()
    }

    fn send(&self, msg: &UserMessage) -> MachMsgReturn {
        let mut buf = MsgBuffer::from_message(msg);
        mach_msg_send(&self.sender, &mut buf)
    }

    /// Receiver task whose space or map is swapped for a failing one
    fn receiver_with(&self, space: Option<usize>, map: Option<usize>) -> IpcTask {
        let space: Arc<dyn IpcSpace> = match space {
            Some(n) => Arc::new(FailingSpace {
                inner: self.rspace.clone(),
                inserts: Budget::new(n),
            }),
            None => self.rspace.clone(),
        };
        let map: Arc<dyn VmMap> = match map {
            Some(n) => Arc::new(FailingMap {
                inner: self.rmap.clone(),
                maps: Budget::new(n),
            }),
            None => self.rmap.clone(),
        };
        IpcTask::new(space, map, IpcConfig::default())
    }
}

fn payload(i: usize, len: usize) -> Vec<u8> {
    (0..len).map(|b| (b * 7 + i) as u8).collect()
}

// ════════════════════════════════════════════════════════════
// Round trip
// ════════════════════════════════════════════════════════════

#[test]
fn rights_and_regions_round_trip() {
    const N: usize = 3;
    const M: usize = 2;
    let pair = Pair::new();
    let carried = pair.carried_ports(N);

    let mut msg = UserMessage::new(MsgHeader::new(pair.remote, MOVE_SEND, 500))
        .with_inline(b"round trip");
    for (name, _) in &carried {
        msg = msg.with_descriptor(MsgDescriptor::port(*name, MAKE_SEND));
    }
    let mut regions = Vec::new();
    for i in 0..M {
        let data = payload(i, 100 + i * 1000);
        let addr = pair.smap.allocate(&data).unwrap();
        msg = msg.with_descriptor(MsgDescriptor::out_of_line(addr, data.len() as u32, true));
        regions.push((addr, data));
    }

    assert!(pair.send(&msg).is_success());
    // The moved destination right left the sender; deallocated regions too.
    assert!(pair.sspace.port(pair.remote).is_none());
    for (addr, _) in &regions {
        assert!(!pair.smap.is_mapped(*addr));
    }

    let mut buf = MsgBuffer::new(4096);
    assert!(mach_msg_receive(&pair.receiver, &mut buf, pair.dest).is_success());
    let received = buf.message().unwrap();
    assert_eq!(received.header.id, 500);
    assert_eq!(received.header.local, pair.dest);
    assert_eq!(&received.inline[..10], b"round trip");
    assert_eq!(received.descriptors.len(), N + M);

    for (desc, (_, port)) in received.descriptors[..N].iter().zip(&carried) {
        let MsgDescriptor::Port { name, disposition } = *desc else {
            panic!("expected a port descriptor, got {:?}", desc);
        };
        assert_eq!(disposition as u32, MOVE_SEND);
        assert!(Arc::ptr_eq(&pair.rspace.port(name).unwrap(), port));
        assert_eq!(port.send_rights(), 1);
    }
    for (desc, (_, data)) in received.descriptors[N..].iter().zip(&regions) {
        let MsgDescriptor::OutOfLine { address, size, .. } = *desc else {
            panic!("expected an out-of-line descriptor, got {:?}", desc);
        };
        assert_eq!(size as usize, data.len());
        assert_eq!(&pair.rmap.read(address, data.len()).unwrap(), data);
    }
    assert_eq!(pair.rmap.region_count(), M);
}

#[test]
fn ool_port_array_round_trip() {
    let pair = Pair::new();
    let carried = pair.carried_ports(4);
    let names: Vec<u8> = carried
        .iter()
        .flat_map(|(name, _)| name.as_raw().to_le_bytes())
        .collect();
    let array = pair.smap.allocate(&names).unwrap();

    let msg = UserMessage::new(MsgHeader::new(pair.remote, MOVE_SEND, 1))
        .with_descriptor(MsgDescriptor::ool_ports(array, 4, MAKE_SEND, false));
    assert!(pair.send(&msg).is_success());
    assert!(pair.smap.is_mapped(array));

    let mut buf = MsgBuffer::new(1024);
    assert!(mach_msg_receive(&pair.receiver, &mut buf, pair.dest).is_success());
    let received = buf.message().unwrap();
    let MsgDescriptor::OolPorts { address, count, .. } = received.descriptors[0] else {
        panic!("expected an ool ports descriptor");
    };
    assert_eq!(count, 4);
    let bytes = pair.rmap.read(address, 16).unwrap();
    for (chunk, (_, port)) in bytes.chunks_exact(4).zip(&carried) {
        let name = PortName::from_raw(u32::from_le_bytes(chunk.try_into().unwrap()));
        assert!(Arc::ptr_eq(&pair.rspace.port(name).unwrap(), port));
    }
}

// ════════════════════════════════════════════════════════════
// Rollback
// ════════════════════════════════════════════════════════════

#[test]
fn failed_name_insert_rolls_back_everything() {
    let pair = Pair::new();
    let carried = pair.carried_ports(3);
    let data = payload(1, 64);
    let addr = pair.smap.allocate(&data).unwrap();

    // Receiver-side region the scatter list overwrites.
    let target = pair.rmap.allocate(&[0xaa; 128]).unwrap();

    let mut msg = UserMessage::new(MsgHeader::new(pair.remote, MOVE_SEND, 77))
        .with_descriptor(MsgDescriptor::out_of_line(addr, 64, false))
        .with_descriptor(MsgDescriptor::out_of_line(addr, 32, false));
    for (name, _) in &carried {
        msg = msg.with_descriptor(MsgDescriptor::port(*name, MAKE_SEND));
    }
    assert!(pair.send(&msg).is_success());

    let scatter = [MsgDescriptor::OutOfLine {
        address: target,
        size: 128,
        deallocate: false,
        copy: CopyOption::Overwrite,
        volatile: false,
    }];
    let receiver = pair.receiver_with(Some(2), None);
    let names_before = pair.rspace.name_count();
    let regions_before = pair.rmap.region_count();

    let mut buf = MsgBuffer::new(4096);
    let options = MachMsgOptions::receive().with_flags(MACH_RCV_OVERWRITE);
    let ret = mach_msg(&receiver, &mut buf, options, pair.dest, Some(&scatter));
    assert_eq!(ret, MachMsgReturn(MACH_RCV_BODY_ERROR | MACH_MSG_IPC_SPACE));

    // Nothing from the message stays installed.
    assert_eq!(pair.rspace.name_count(), names_before);
    assert_eq!(pair.rmap.region_count(), regions_before);
    assert_eq!(pair.rmap.read(target, 128).unwrap(), vec![0xaa; 128]);
    for (_, port) in &carried {
        assert_eq!(port.send_rights(), 0);
        assert!(port.is_active());
    }

    // The header still names the receive right and keeps the id.
    let header = buf.header().unwrap();
    assert_eq!(header.local, pair.dest);
    assert_eq!(header.id, 77);
    assert_eq!(header.size as usize, HEADER_SIZE);
    assert_eq!(pair.dest_port().message_count(), 0);
}

#[test]
fn failed_mapping_rolls_back_everything() {
    let pair = Pair::new();
    let carried = pair.carried_ports(2);
    let mut msg = UserMessage::new(MsgHeader::new(pair.remote, MOVE_SEND, 78));
    for (name, _) in &carried {
        msg = msg.with_descriptor(MsgDescriptor::port(*name, MAKE_SEND));
    }
    for i in 0..3 {
        let addr = pair.smap.allocate(&payload(i, 40)).unwrap();
        msg = msg.with_descriptor(MsgDescriptor::out_of_line(addr, 40, false));
    }
    assert!(pair.send(&msg).is_success());

    let receiver = pair.receiver_with(None, Some(1));
    let names_before = pair.rspace.name_count();
    let mut buf = MsgBuffer::new(4096);
    let ret = mach_msg_receive(&receiver, &mut buf, pair.dest);
    assert_eq!(ret, MachMsgReturn(MACH_RCV_BODY_ERROR | MACH_MSG_VM_SPACE));

    assert_eq!(pair.rspace.name_count(), names_before);
    assert_eq!(pair.rmap.region_count(), 0);
    for (_, port) in &carried {
        assert_eq!(port.send_rights(), 0);
    }
    assert_eq!(buf.header().unwrap().id, 78);
}

#[test]
fn failed_copyin_keeps_sender_state() {
    let pair = Pair::new();
    let carried = pair.carried_ports(1);
    let data = payload(3, 48);
    let addr = pair.smap.allocate(&data).unwrap();

    let msg = UserMessage::new(MsgHeader::new(pair.remote, COPY_SEND, 2))
        .with_descriptor(MsgDescriptor::out_of_line(addr, 48, true))
        .with_descriptor(MsgDescriptor::port(carried[0].0, MAKE_SEND))
        .with_descriptor(MsgDescriptor::port(PortName::from_raw(0x7777), MOVE_SEND));
    assert_eq!(pair.send(&msg), MachMsgReturn(MACH_SEND_INVALID_RIGHT));

    // Memory and the sender's names are where they were; the carried
    // right made on the way in is gone again.
    assert_eq!(pair.sspace.urefs(pair.remote), Some(1));
    assert_eq!(pair.smap.read(addr, 48).unwrap(), data);
    assert_eq!(carried[0].1.send_rights(), 0);
    assert_eq!(pair.dest_port().message_count(), 0);
    assert_eq!(pair.dest_port().send_rights(), 1);
}

#[test]
fn bad_reply_keeps_moved_destination() {
    let pair = Pair::new();
    let msg = UserMessage::new(
        MsgHeader::new(pair.remote, MOVE_SEND, 3).with_reply(PortName::from_raw(0x9999), COPY_SEND),
    );
    assert_eq!(pair.send(&msg), MachMsgReturn(MACH_SEND_INVALID_REPLY));

    assert_eq!(pair.sspace.urefs(pair.remote), Some(1));
    assert_eq!(pair.dest_port().send_rights(), 1);
    assert_eq!(pair.dest_port().message_count(), 0);

    // The right is still usable.
    let msg = UserMessage::new(MsgHeader::new(pair.remote, MOVE_SEND, 4));
    assert!(pair.send(&msg).is_success());
    assert_eq!(pair.dest_port().message_count(), 1);
}

// ════════════════════════════════════════════════════════════
// Too-large probe
// ════════════════════════════════════════════════════════════

#[test]
fn too_large_then_retry_is_byte_exact() {
    let pair = Pair::new();
    let carried = pair.carried_ports(1);
    let data = payload(9, 300);
    let addr = pair.smap.allocate(&data).unwrap();
    let inline = payload(4, 120);

    let msg = UserMessage::new(MsgHeader::new(pair.remote, MOVE_SEND, 1234))
        .with_descriptor(MsgDescriptor::port(carried[0].0, MAKE_SEND))
        .with_descriptor(MsgDescriptor::out_of_line(addr, 300, false))
        .with_inline(&inline);
    assert!(pair.send(&msg).is_success());

    let mut small = MsgBuffer::new(HEADER_SIZE + 8);
    assert_eq!(
        mach_msg_receive(&pair.receiver, &mut small, pair.dest),
        MachMsgReturn(MACH_RCV_TOO_LARGE)
    );
    let needed = small.header().unwrap().size as usize;
    assert!(needed > msg.encoded_len());
    // Nothing was consumed or installed by the probe.
    assert_eq!(pair.dest_port().message_count(), 1);
    assert_eq!(carried[0].1.send_rights(), 1);
    assert_eq!(pair.rmap.region_count(), 0);

    let mut buf = MsgBuffer::new(needed);
    assert!(mach_msg_receive(&pair.receiver, &mut buf, pair.dest).is_success());
    assert_eq!(buf.bytes().len(), needed);
    let received = buf.message().unwrap();
    assert_eq!(received.header.id, 1234);
    assert_eq!(received.inline, inline);
    let MsgDescriptor::OutOfLine { address, size, .. } = received.descriptors[1] else {
        panic!("expected an out-of-line descriptor");
    };
    assert_eq!(pair.rmap.read(address, size as usize).unwrap(), data);
}

// ════════════════════════════════════════════════════════════
// Scatter receive
// ════════════════════════════════════════════════════════════

fn send_one_region(pair: &Pair, len: usize) -> Vec<u8> {
    let data = payload(5, len);
    let addr = pair.smap.allocate(&data).unwrap();
    let msg = UserMessage::new(MsgHeader::new(pair.remote, MOVE_SEND, 3))
        .with_descriptor(MsgDescriptor::out_of_line(addr, len as u32, false));
    assert!(pair.send(&msg).is_success());
    data
}

#[test]
fn overwrite_receive_fills_scatter_region() {
    let pair = Pair::new();
    let data = send_one_region(&pair, 64);
    let target = pair.rmap.allocate(&[0; 64]).unwrap();
    let scatter = [MsgDescriptor::OutOfLine {
        address: target,
        size: 64,
        deallocate: false,
        copy: CopyOption::Overwrite,
        volatile: false,
    }];

    let mut buf = MsgBuffer::new(512);
    let options = MachMsgOptions::receive().with_flags(MACH_RCV_OVERWRITE);
    assert!(mach_msg(&pair.receiver, &mut buf, options, pair.dest, Some(&scatter)).is_success());

    let received = buf.message().unwrap();
    let MsgDescriptor::OutOfLine { address, copy, .. } = received.descriptors[0] else {
        panic!("expected an out-of-line descriptor");
    };
    assert_eq!(address, target);
    assert_eq!(copy, CopyOption::Overwrite);
    assert_eq!(pair.rmap.read(target, 64).unwrap(), data);
    assert_eq!(pair.rmap.region_count(), 1);
}

#[test]
fn scatter_errors_leave_message_queued() {
    let pair = Pair::new();
    send_one_region(&pair, 64);
    let options = MachMsgOptions::receive().with_flags(MACH_RCV_OVERWRITE);

    let small = [MsgDescriptor::OutOfLine {
        address: 0,
        size: 16,
        deallocate: false,
        copy: CopyOption::Overwrite,
        volatile: false,
    }];
    let mut buf = MsgBuffer::new(512);
    assert_eq!(
        mach_msg(&pair.receiver, &mut buf, options, pair.dest, Some(&small)),
        MachMsgReturn(MACH_RCV_SCATTER_SMALL)
    );
    assert_eq!(
        mach_msg(&pair.receiver, &mut buf, options, pair.dest, Some(&[])),
        MachMsgReturn(MACH_RCV_SCATTER_SMALL)
    );

    let wrong = [MsgDescriptor::ool_ports(0, 4, MAKE_SEND, false)];
    assert_eq!(
        mach_msg(&pair.receiver, &mut buf, options, pair.dest, Some(&wrong)),
        MachMsgReturn(MACH_RCV_INVALID_TYPE)
    );
    assert_eq!(pair.dest_port().message_count(), 1);

    assert!(mach_msg_receive(&pair.receiver, &mut buf, pair.dest).is_success());
}

// ════════════════════════════════════════════════════════════
// Pseudo-receive
// ════════════════════════════════════════════════════════════

#[test]
fn full_queue_hands_message_back() {
    let pair = Pair::with_config(IpcConfig::default().with_queue_limit(QueueLimit::Bounded(1)));
    // Fill the queue; the sender keeps its destination right.
    let filler = UserMessage::new(MsgHeader::new(pair.remote, COPY_SEND, 0));
    assert!(pair.send(&filler).is_success());

    let carried = pair.carried_ports(1);
    pair.sspace.make_send(carried[0].0).unwrap();
    let data = payload(2, 80);
    let addr = pair.smap.allocate(&data).unwrap();
    let msg = UserMessage::new(MsgHeader::new(pair.remote, COPY_SEND, 9))
        .with_descriptor(MsgDescriptor::port(carried[0].0, MOVE_SEND))
        .with_descriptor(MsgDescriptor::out_of_line(addr, 80, true));

    let mut buf = MsgBuffer::from_message(&msg);
    let options = MachMsgOptions::send().with_send_timeout(std::time::Duration::ZERO);
    let ret = mach_msg(&pair.sender, &mut buf, options, PortName::NULL, None);
    assert_eq!(ret, MachMsgReturn(MACH_SEND_TIMED_OUT));

    let returned = buf.message().unwrap();
    assert_eq!(returned.header.id, 9);
    assert_eq!(returned.header.remote, pair.remote);
    // The moved send right is back under its old name.
    let MsgDescriptor::Port { name, .. } = returned.descriptors[0] else {
        panic!("expected a port descriptor");
    };
    assert_eq!(name, carried[0].0);
    assert_eq!(pair.sspace.urefs(name), Some(1));
    // The region was deallocated on copy-in and mapped back on return.
    let MsgDescriptor::OutOfLine { address, .. } = returned.descriptors[1] else {
        panic!("expected an out-of-line descriptor");
    };
    assert!(!pair.smap.is_mapped(addr) || address == addr);
    assert_eq!(pair.smap.read(address, 80).unwrap(), data);
    assert_eq!(pair.dest_port().message_count(), 1);
}
