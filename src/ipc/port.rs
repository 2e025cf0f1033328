//! Port implementation - the fundamental IPC primitive
//!
//! Based on Mach4 ipc/ipc_port.c
//!
//! A port is identified by its kernel address, never by a name. It owns
//! one message queue and holds an uncounted back-reference to the port
//! set it belongs to, if any. The back-reference is only changed while
//! the port lock is held, and only together with the set's member list
//! (see [`super::pset`]).

use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, trace, warn};
use spin::Mutex;

use crate::config::{DeadMessagePolicy, IpcConfig, QueueLimit};
use crate::kern::sched_prim::{current_waiter, WaitResult};

use super::kmsg::{self, IpcKmsg};
use super::mqueue::{IpcMqueue, MsgWait};
use super::notify::NotifyType;
use super::pset::PortSet;
use super::right::{PortRight, RightKind};
use super::{IpcError, IpcResult};

/// State protected by the port lock
#[derive(Debug)]
pub(crate) struct PortInner {
    pub(crate) active: bool,
    pub(crate) mqueue: IpcMqueue,
    /// Set this port belongs to; valid only while listed in that set
    pub(crate) pset: Option<Weak<PortSet>>,
}

impl PortInner {
    /// Whether the back-reference names `set`
    pub(crate) fn in_set(&self, set: &PortSet) -> bool {
        self.pset
            .as_ref()
            .is_some_and(|weak| ptr::eq(weak.as_ptr(), set))
    }
}

/// A Mach-style port
#[derive(Debug)]
pub struct Port {
    /// Kernel references (rights, set membership, transient holders)
    refs: AtomicUsize,
    pub(crate) inner: Mutex<PortInner>,
    /// Send right reference count
    srights: AtomicU32,
    /// Send-once right count
    sorights: AtomicU32,
    /// Receiver-chosen value reported in the trailer
    context: AtomicU64,
    policy: DeadMessagePolicy,
}

impl Port {
    /// Create an active port with one reference held by the caller
    pub fn create() -> Arc<Self> {
        Self::create_with(&IpcConfig::default())
    }

    pub fn create_with(config: &IpcConfig) -> Arc<Self> {
        Arc::new(Self {
            refs: AtomicUsize::new(1),
            inner: Mutex::new(PortInner {
                active: true,
                mqueue: IpcMqueue::new(config.queue_limit),
                pset: None,
            }),
            srights: AtomicU32::new(0),
            sorights: AtomicU32::new(0),
            context: AtomicU64::new(0),
            policy: config.dead_message_policy,
        })
    }

    /// Create a port and hand back its receive right
    ///
    /// The right adopts the creation reference; dropping it destroys the
    /// port.
    pub fn allocate_receive() -> PortRight {
        Self::allocate_receive_with(&IpcConfig::default())
    }

    pub fn allocate_receive_with(config: &IpcConfig) -> PortRight {
        PortRight::adopt(Self::create_with(config), RightKind::Receive)
    }

    // ========================================================================
    // Reference counting
    // ========================================================================

    pub fn reference(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference; the last one deactivates the port
    pub fn release(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "port reference count underflow");
        if prev == 1 {
            self.destroy();
        }
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn srights_inc(&self) {
        self.srights.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn srights_dec(&self) {
        self.srights.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn sorights_inc(&self) {
        self.sorights.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn sorights_dec(&self) {
        self.sorights.fetch_sub(1, Ordering::AcqRel);
    }

    /// Outstanding send rights
    pub fn send_rights(&self) -> u32 {
        self.srights.load(Ordering::Acquire)
    }

    /// Outstanding send-once rights
    pub fn send_once_rights(&self) -> u32 {
        self.sorights.load(Ordering::Acquire)
    }

    // ========================================================================
    // Attributes
    // ========================================================================

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    pub fn context(&self) -> u64 {
        self.context.load(Ordering::Acquire)
    }

    pub fn set_context(&self, context: u64) {
        self.context.store(context, Ordering::Release);
    }

    /// The set this port currently belongs to
    pub fn pset(&self) -> Option<Arc<PortSet>> {
        self.inner.lock().pset.as_ref().and_then(Weak::upgrade)
    }

    /// Number of buffered messages
    pub fn message_count(&self) -> usize {
        self.inner.lock().mqueue.len()
    }

    /// Threads blocked receiving directly on this port
    pub fn receiver_count(&self) -> usize {
        self.inner.lock().mqueue.receiver_count()
    }

    /// Sequence number the next message will carry
    pub fn seqno(&self) -> u32 {
        self.inner.lock().mqueue.seqno()
    }

    pub fn set_seqno(&self, seqno: u32) {
        self.inner.lock().mqueue.set_seqno(seqno);
    }

    pub fn queue_limit(&self) -> QueueLimit {
        self.inner.lock().mqueue.limit()
    }

    /// Change the queue limit; blocked senders re-check it
    pub fn set_queue_limit(&self, limit: QueueLimit) {
        self.inner.lock().mqueue.set_limit(limit);
    }

    // ========================================================================
    // Send side
    // ========================================================================

    /// Queue a message on this port
    ///
    /// If the port belongs to a set, the set's receivers and readiness
    /// consumers are signalled once the port lock is dropped. A bounded
    /// queue that is full blocks per `wait`. On failure the message is
    /// handed back untouched.
    pub fn enqueue(
        &self,
        kmsg: Box<IpcKmsg>,
        wait: MsgWait,
    ) -> Result<(), (IpcError, Box<IpcKmsg>)> {
        let mut kmsg = kmsg;
        loop {
            let mut inner = self.inner.lock();
            if !inner.active {
                return Err((IpcError::ObjectDied, kmsg));
            }

            match inner.mqueue.enqueue(kmsg) {
                Ok(seqno) => {
                    let pset = inner.pset.as_ref().and_then(Weak::upgrade);
                    drop(inner);
                    trace!("port {:p}: queued message seqno {}", self, seqno);
                    if let Some(set) = pset {
                        set.signal_ready();
                    }
                    return Ok(());
                }
                Err((err, returned)) => {
                    kmsg = returned;
                    if !wait.may_block() {
                        return Err((err, kmsg));
                    }
                    let waiter = current_waiter();
                    inner.mqueue.wait_send(&waiter);
                    drop(inner);

                    match waiter.block(wait.deadline()) {
                        // Space opened up, or the port died: re-check.
                        WaitResult::Normal | WaitResult::Abnormal => continue,
                        WaitResult::TimedOut => {
                            self.inner.lock().mqueue.cancel_wait(&waiter);
                            return Err((IpcError::TimedOut, kmsg));
                        }
                        WaitResult::Interrupted => {
                            self.inner.lock().mqueue.cancel_wait(&waiter);
                            return Err((IpcError::Interrupted, kmsg));
                        }
                    }
                }
            }
        }
    }

    // ========================================================================
    // Receive side
    // ========================================================================

    /// Take the oldest message
    ///
    /// `probe` inspects the head under the port lock first; if it fails,
    /// the message stays queued and the probe's error is returned. This is
    /// how a too-small receive buffer is reported without losing data.
    ///
    /// `Interrupted` is only returned from a blocked wait, before any
    /// message is taken; a receive is never interrupted part way.
    pub fn dequeue<F>(&self, wait: MsgWait, mut probe: F) -> IpcResult<Box<IpcKmsg>>
    where
        F: FnMut(&IpcKmsg) -> IpcResult<()>,
    {
        loop {
            let mut inner = self.inner.lock();
            if !inner.active {
                return Err(IpcError::ObjectDied);
            }

            if let Some(kmsg) = take_head(&mut inner, self.context(), &mut probe) {
                return kmsg;
            }

            if !wait.may_block() {
                return Err(IpcError::WouldBlock);
            }
            let waiter = current_waiter();
            inner.mqueue.wait_receive(&waiter);
            drop(inner);

            match waiter.block(wait.deadline()) {
                WaitResult::Normal | WaitResult::Abnormal => continue,
                WaitResult::TimedOut => {
                    self.inner.lock().mqueue.cancel_wait(&waiter);
                    return Err(IpcError::TimedOut);
                }
                WaitResult::Interrupted => {
                    self.inner.lock().mqueue.cancel_wait(&waiter);
                    return Err(IpcError::Interrupted);
                }
            }
        }
    }

    /// Non-blocking dequeue on behalf of a set receiver
    ///
    /// Returns `None` when the port is empty, dead, or no longer a member
    /// of `set`.
    pub(crate) fn try_dequeue_member<F>(
        &self,
        set: &PortSet,
        probe: &mut F,
    ) -> Option<IpcResult<Box<IpcKmsg>>>
    where
        F: FnMut(&IpcKmsg) -> IpcResult<()>,
    {
        let mut inner = self.inner.lock();
        if !inner.active || !inner.in_set(set) {
            return None;
        }
        take_head(&mut inner, self.context(), probe)
    }

    // ========================================================================
    // Destruction
    // ========================================================================

    /// Deactivate the port (ipc_port_destroy)
    ///
    /// Marks it dead, detaches it from its set, wakes every waiter with an
    /// abnormal result and disposes of buffered messages per the port's
    /// dead-message policy. Idempotent.
    pub fn destroy(&self) {
        {
            let mut inner = self.inner.lock();
            if !inner.active {
                return;
            }
            inner.active = false;
        }

        loop {
            let weak = self.inner.lock().pset.clone();
            let Some(weak) = weak else { break };
            match weak.upgrade() {
                Some(set) => {
                    // NotInSet means a concurrent move got there first.
                    let _ = set.remove(self);
                }
                None => {
                    let mut inner = self.inner.lock();
                    if inner.pset.as_ref().is_some_and(|w| w.ptr_eq(&weak)) {
                        inner.pset = None;
                    }
                }
            }
        }

        let flushed = {
            let mut inner = self.inner.lock();
            inner.mqueue.wakeup_all(WaitResult::Abnormal);
            inner.mqueue.flush()
        };
        debug!(
            "port {:p} destroyed, {} queued message(s) flushed",
            self,
            flushed.len()
        );
        self.dispose_dead_messages(flushed);
    }

    fn dispose_dead_messages(&self, flushed: Vec<Box<IpcKmsg>>) {
        if self.policy == DeadMessagePolicy::NotifyReply {
            for mut kmsg in flushed {
                if let Some(reply) = kmsg.take_send_once_reply() {
                    let port = reply.port().clone();
                    let notice = IpcKmsg::notification(reply, NotifyType::SendOnce);
                    if let Err((err, notice)) = port.enqueue(notice, MsgWait::NoWait) {
                        warn!("send-once notification to {:p} dropped: {}", port, err);
                        kmsg::destroy(notice);
                    }
                }
                kmsg::destroy(kmsg);
            }
        } else {
            kmsg::destroy_all(flushed);
        }
    }
}

/// Probe and pop the head of a locked port's queue
fn take_head<F>(
    inner: &mut PortInner,
    context: u64,
    probe: &mut F,
) -> Option<IpcResult<Box<IpcKmsg>>>
where
    F: FnMut(&IpcKmsg) -> IpcResult<()>,
{
    let head = inner.mqueue.first()?;
    if let Err(err) = probe(head) {
        return Some(Err(err));
    }
    let mut kmsg = inner.mqueue.dequeue()?;
    kmsg.set_context(context);
    trace!("dequeued message seqno {}", kmsg.trailer().seqno);
    Some(Ok(kmsg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::MsgTypeName;
    use std::thread;
    use std::time::Duration;

    fn accept(_: &IpcKmsg) -> IpcResult<()> {
        Ok(())
    }

    fn message(id: i32) -> Box<IpcKmsg> {
        let mut kmsg = IpcKmsg::alloc(0).unwrap();
        kmsg.set_id(id);
        kmsg
    }

    #[test]
    fn test_create_and_release() {
        let port = Port::create();
        assert!(port.is_active());
        assert_eq!(port.ref_count(), 1);
        port.reference();
        port.release();
        assert!(port.is_active());
        port.release();
        assert!(!port.is_active());
    }

    #[test]
    fn test_fifo_with_context() {
        let receive = Port::allocate_receive();
        let port = receive.port().clone();
        port.set_context(0xfeed);
        port.enqueue(message(1), MsgWait::NoWait).unwrap();
        port.enqueue(message(2), MsgWait::NoWait).unwrap();
        assert_eq!(port.message_count(), 2);

        let first = port.dequeue(MsgWait::NoWait, accept).unwrap();
        let second = port.dequeue(MsgWait::NoWait, accept).unwrap();
        assert_eq!((first.id(), second.id()), (1, 2));
        assert!(first.trailer().seqno < second.trailer().seqno);
        assert_eq!(first.trailer().context, 0xfeed);
        assert_eq!(
            port.dequeue(MsgWait::NoWait, accept).unwrap_err(),
            IpcError::WouldBlock
        );
    }

    #[test]
    fn test_probe_failure_leaves_message() {
        let receive = Port::allocate_receive();
        let port = receive.port();
        port.enqueue(message(7), MsgWait::NoWait).unwrap();
        let err = port
            .dequeue(MsgWait::NoWait, |_| Err(IpcError::TooLarge))
            .unwrap_err();
        assert_eq!(err, IpcError::TooLarge);
        assert_eq!(port.message_count(), 1);
        assert_eq!(port.dequeue(MsgWait::NoWait, accept).unwrap().id(), 7);
    }

    #[test]
    fn test_receive_times_out() {
        let receive = Port::allocate_receive();
        let err = receive
            .port()
            .dequeue(MsgWait::timeout(Duration::from_millis(10)), accept)
            .unwrap_err();
        assert_eq!(err, IpcError::TimedOut);
    }

    #[test]
    fn test_blocked_receiver_sees_port_death() {
        let receive = Port::allocate_receive();
        let port = receive.port().clone();
        let handle = thread::spawn(move || port.dequeue(MsgWait::Forever, accept).map(|k| k.id()));
        thread::sleep(Duration::from_millis(20));
        drop(receive);
        assert_eq!(handle.join().unwrap().unwrap_err(), IpcError::ObjectDied);
    }

    #[test]
    fn test_send_to_dead_port_returns_message() {
        let receive = Port::allocate_receive();
        let port = receive.port().clone();
        drop(receive);
        let (err, kmsg) = port.enqueue(message(3), MsgWait::NoWait).unwrap_err();
        assert_eq!(err, IpcError::ObjectDied);
        assert_eq!(kmsg.id(), 3);
    }

    #[test]
    fn test_bounded_queue_blocks_sender() {
        let config = IpcConfig::default().with_queue_limit(QueueLimit::Bounded(1));
        let receive = Port::allocate_receive_with(&config);
        let port = receive.port().clone();
        port.enqueue(message(1), MsgWait::NoWait).unwrap();

        let (err, _) = port.enqueue(message(2), MsgWait::NoWait).unwrap_err();
        assert_eq!(err, IpcError::QueueFull);
        let (err, _) = port
            .enqueue(message(2), MsgWait::timeout(Duration::from_millis(10)))
            .unwrap_err();
        assert_eq!(err, IpcError::TimedOut);

        let sender = {
            let port = port.clone();
            thread::spawn(move || port.enqueue(message(2), MsgWait::Forever).is_ok())
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(port.dequeue(MsgWait::NoWait, accept).unwrap().id(), 1);
        assert!(sender.join().unwrap());
        assert_eq!(port.dequeue(MsgWait::Forever, accept).unwrap().id(), 2);
    }

    #[test]
    fn test_destroy_releases_queued_rights() {
        let receive = Port::allocate_receive();
        let other = Port::allocate_receive();
        let carried = other.derive(MsgTypeName::MakeSend).unwrap();
        assert_eq!(other.port().send_rights(), 1);

        let mut kmsg = message(9);
        kmsg.push_port_right(carried, MsgTypeName::MoveSend);
        receive.port().enqueue(kmsg, MsgWait::NoWait).unwrap();

        drop(receive);
        assert_eq!(other.port().send_rights(), 0);
    }

    #[test]
    fn test_notify_reply_policy() {
        let config =
            IpcConfig::default().with_dead_message_policy(DeadMessagePolicy::NotifyReply);
        let receive = Port::allocate_receive_with(&config);
        let reply = Port::allocate_receive();

        let mut kmsg = message(5);
        kmsg.set_reply(reply.derive(MsgTypeName::MakeSendOnce).unwrap());
        receive.port().enqueue(kmsg, MsgWait::NoWait).unwrap();
        drop(receive);

        let notice = reply.port().dequeue(MsgWait::NoWait, accept).unwrap();
        assert_eq!(notice.id(), NotifyType::SendOnce.msg_id());
        drop(notice);
        assert_eq!(reply.port().send_once_rights(), 0);
    }
}
