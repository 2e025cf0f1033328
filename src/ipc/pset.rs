//! IPC Port Sets - Collections of ports for multiplexed receive
//!
//! Based on Mach4 ipc/ipc_pset.c
//! Port sets allow receiving from multiple ports with a single receive.
//!
//! ## Architecture
//!
//! A port set aggregates the message queues of its member ports. A thread
//! receiving on the set takes the first message found on any member; no
//! per-member fairness is promised.
//!
//! Key concepts from Mach4:
//! - A port can be in at most one port set at a time
//! - The set holds a counted reference on each member; the member points
//!   back at the set without one
//! - Membership changes lock the port and the set(s) together, in address
//!   order (see [`crate::kern::lock`])
//! - Destroying a set detaches its members; it never destroys them
//!
//! A receiver on the set first queues itself and asserts its wait, then
//! scans the members. An enqueue on a member after the scan always finds
//! the waiter and wakes it, so no message can slip between the scan and
//! the block.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use spin::Mutex;

use crate::config::MAX_READINESS_CONSUMERS;
use crate::kern::lock::{lock_pair, lock_triple, Backoff};
use crate::kern::sched_prim::{current_waiter, event_from_addr, WaitEvent, WaitQueue, WaitResult, Waiter};

use super::kmsg::IpcKmsg;
use super::mqueue::MsgWait;
use super::notify::ReadinessConsumer;
use super::port::Port;
use super::{IpcError, IpcResult};

type ConsumerList = heapless::Vec<Arc<dyn ReadinessConsumer>, MAX_READINESS_CONSUMERS>;

/// Member key: the port's kernel address
#[inline]
fn port_key(port: &Port) -> usize {
    port as *const Port as usize
}

/// State protected by the set lock
#[derive(Debug)]
pub(crate) struct PsetInner {
    active: bool,
    members: HashMap<usize, Arc<Port>>,
}

/// A port set
pub struct PortSet {
    refs: AtomicUsize,
    inner: Mutex<PsetInner>,
    /// Threads blocked receiving on the set
    waiters: Mutex<WaitQueue>,
    /// Readiness consumers (knotes)
    consumers: Mutex<ConsumerList>,
}

impl PortSet {
    /// Allocate an active, empty set with one reference held by the caller
    pub fn allocate() -> Arc<Self> {
        Arc::new(Self {
            refs: AtomicUsize::new(1),
            inner: Mutex::new(PsetInner {
                active: true,
                members: HashMap::new(),
            }),
            waiters: Mutex::new(WaitQueue::new()),
            consumers: Mutex::new(ConsumerList::new()),
        })
    }

    fn event(&self) -> WaitEvent {
        event_from_addr(self)
    }

    // ========================================================================
    // Reference counting
    // ========================================================================

    pub fn reference(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference; the last one deactivates the set
    pub fn release(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "port set reference count underflow");
        if prev == 1 {
            self.deactivate();
        }
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    pub fn member_count(&self) -> usize {
        self.inner.lock().members.len()
    }

    /// Whether `port` is currently listed
    pub fn contains(&self, port: &Port) -> bool {
        self.inner.lock().members.contains_key(&port_key(port))
    }

    /// Snapshot of the current members
    pub fn members(&self) -> Vec<Arc<Port>> {
        self.inner.lock().members.values().cloned().collect()
    }

    /// Threads currently queued to receive on the set
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Add a memberless, active port (ipc_pset_add)
    ///
    /// If the port already holds messages, set receivers are signalled
    /// once both locks are dropped.
    pub fn add(self: &Arc<Self>, port: &Arc<Port>) -> IpcResult<()> {
        let has_messages = {
            let (mut pi, mut si) = lock_pair(&port.inner, &self.inner);
            if !pi.active || !si.active {
                return Err(IpcError::ObjectDied);
            }
            if pi.pset.is_some() {
                return Err(IpcError::AlreadyInSet);
            }
            pi.pset = Some(Arc::downgrade(self));
            si.members.insert(port_key(port), port.clone());
            port.reference();
            self.reference();
            !pi.mqueue.is_empty()
        };

        debug!("port {:p} added to set {:p}", Arc::as_ptr(port), Arc::as_ptr(self));
        if has_messages {
            self.signal_ready();
        }
        Ok(())
    }

    /// Remove a member (ipc_pset_remove)
    ///
    /// Fails with `NotInSet` unless the port's back-reference names this
    /// set. The membership references are dropped after the locks.
    pub fn remove(&self, port: &Port) -> IpcResult<()> {
        let member = {
            let (mut pi, mut si) = lock_pair(&port.inner, &self.inner);
            if !pi.in_set(self) {
                return Err(IpcError::NotInSet);
            }
            pi.pset = None;
            si.members.remove(&port_key(port))
        };

        debug!("port {:p} removed from set {:p}", port, self);
        if let Some(member) = member {
            member.release();
            self.release();
        }
        Ok(())
    }

    /// Move `port` into `dest`, or out of any set if `dest` is `None`
    ///
    /// The port's current set is re-read until the move linearizes against
    /// concurrent moves. Moving a port that is in no set to `None` reports
    /// `NotInSet`. Buffered messages on the port signal the destination.
    pub fn move_port(port: &Arc<Port>, dest: Option<&Arc<PortSet>>) -> IpcResult<()> {
        let mut backoff = Backoff::new();
        loop {
            let current = port.pset();
            let outcome = match (current.as_ref(), dest) {
                (None, None) => return Err(IpcError::NotInSet),
                (Some(old), Some(new)) if Arc::ptr_eq(old, new) => return Ok(()),
                (None, Some(new)) => new.add(port),
                (Some(old), None) => old.remove(port),
                (Some(old), Some(new)) => Self::transfer(port, old, new),
            };
            match outcome {
                // Another move relocated the port in the meantime.
                Err(IpcError::AlreadyInSet) | Err(IpcError::NotInSet) => backoff.snooze(),
                other => return other,
            }
        }
    }

    /// Relocate a member of `old` into `new` under all three locks
    fn transfer(port: &Arc<Port>, old: &Arc<PortSet>, new: &Arc<PortSet>) -> IpcResult<()> {
        let has_messages = {
            let (mut pi, mut oi, mut ni) = lock_triple(&port.inner, &old.inner, &new.inner);
            if !pi.in_set(old) {
                return Err(IpcError::NotInSet);
            }
            if !pi.active || !ni.active {
                return Err(IpcError::ObjectDied);
            }
            let key = port_key(port);
            // The membership reference travels with the port.
            if oi.members.remove(&key).is_none() {
                port.reference();
            }
            ni.members.insert(key, port.clone());
            pi.pset = Some(Arc::downgrade(new));
            new.reference();
            !pi.mqueue.is_empty()
        };

        debug!(
            "port {:p} moved from set {:p} to set {:p}",
            Arc::as_ptr(port),
            Arc::as_ptr(old),
            Arc::as_ptr(new)
        );
        old.release();
        if has_messages {
            new.signal_ready();
        }
        Ok(())
    }

    // ========================================================================
    // Destruction
    // ========================================================================

    /// Destroy the set and release the caller's reference (ipc_pset_destroy)
    ///
    /// Members are detached, not destroyed; their queued messages stay on
    /// them.
    pub fn destroy(&self) {
        self.deactivate();
        self.release();
    }

    /// Mark the set dead and detach its members; returns how many were detached
    fn deactivate(&self) -> usize {
        {
            let mut si = self.inner.lock();
            if !si.active {
                return 0;
            }
            si.active = false;
        }

        // Never block on a member lock while holding the set lock: a
        // concurrent move may hold the member and want the set.
        let mut backoff = Backoff::new();
        let mut detached = 0usize;
        loop {
            let mut si = self.inner.lock();
            let first = si.members.iter().next().map(|(k, p)| (*k, p.clone()));
            let Some((key, port)) = first else { break };

            let Some(mut pi) = port.inner.try_lock() else {
                drop(si);
                backoff.snooze();
                continue;
            };
            if pi.in_set(self) {
                pi.pset = None;
            }
            drop(pi);
            let member = si.members.remove(&key);
            drop(si);

            if member.is_some() {
                port.release();
                self.release();
                detached += 1;
            }
        }

        let woken = self
            .waiters
            .lock()
            .wakeup_all(self.event(), WaitResult::Abnormal);
        let consumers = core::mem::replace(&mut *self.consumers.lock(), ConsumerList::new());
        for consumer in &consumers {
            consumer.closed();
        }
        debug!(
            "port set {:p} destroyed: {} member(s) detached, {} receiver(s) woken",
            self, detached, woken
        );
        detached
    }

    // ========================================================================
    // Readiness
    // ========================================================================

    /// A member gained a message: wake one receiver and every consumer
    ///
    /// Takes only leaf locks, so it may be called with or without the set
    /// lock held. Consumer callbacks run after every lock is dropped.
    pub fn signal_ready(&self) {
        self.waiters.lock().wakeup_one(self.event(), WaitResult::Normal);
        let consumers = self.consumers.lock().clone();
        for consumer in &consumers {
            consumer.ready();
        }
    }

    /// Register an edge-triggered readiness consumer
    ///
    /// Signalled immediately if a member already holds a message.
    pub fn register_readiness_consumer(
        &self,
        consumer: Arc<dyn ReadinessConsumer>,
    ) -> IpcResult<()> {
        let members = {
            let si = self.inner.lock();
            if !si.active {
                return Err(IpcError::ObjectDied);
            }
            self.consumers
                .lock()
                .push(consumer.clone())
                .map_err(|_| IpcError::ResourceExhausted)?;
            si.members.values().cloned().collect::<Vec<_>>()
        };

        if members.iter().any(|port| port.message_count() > 0) {
            consumer.ready();
        }
        Ok(())
    }

    /// Remove a previously registered consumer; false if it was not found
    pub fn unregister_readiness_consumer(&self, consumer: &Arc<dyn ReadinessConsumer>) -> bool {
        let target = Arc::as_ptr(consumer) as *const ();
        let mut consumers = self.consumers.lock();
        let before = consumers.len();
        consumers.retain(|c| Arc::as_ptr(c) as *const () != target);
        consumers.len() != before
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    // ========================================================================
    // Receive
    // ========================================================================

    /// Take a message from any member
    ///
    /// Blocking semantics match [`Port::dequeue`]; the set dying wakes
    /// receivers with `ObjectDied`. `probe` is applied to each candidate
    /// head and a failure leaves that message queued. An interrupt only
    /// lands while blocked, so `Interrupted` never follows a taken message.
    pub fn dequeue<F>(&self, wait: MsgWait, mut probe: F) -> IpcResult<Box<IpcKmsg>>
    where
        F: FnMut(&IpcKmsg) -> IpcResult<()>,
    {
        let waiter = current_waiter();
        let event = self.event();
        loop {
            if wait.may_block() {
                self.waiters.lock().enqueue(waiter.clone());
                waiter.assert_wait(event, true);
            }

            let members = {
                let si = self.inner.lock();
                if !si.active {
                    drop(si);
                    self.retract(&waiter, wait);
                    return Err(IpcError::ObjectDied);
                }
                si.members.values().cloned().collect::<Vec<_>>()
            };

            let found = members
                .iter()
                .find_map(|port| port.try_dequeue_member(self, &mut probe));
            if let Some(result) = found {
                self.retract(&waiter, wait);
                trace!("set {:p}: receive found a member message", self);
                return result;
            }

            if !wait.may_block() {
                return Err(IpcError::WouldBlock);
            }
            match waiter.block(wait.deadline()) {
                WaitResult::Normal | WaitResult::Abnormal => continue,
                WaitResult::TimedOut => {
                    self.waiters.lock().remove(&waiter);
                    return Err(IpcError::TimedOut);
                }
                WaitResult::Interrupted => {
                    self.waiters.lock().remove(&waiter);
                    return Err(IpcError::Interrupted);
                }
            }
        }
    }

    /// Withdraw an asserted wait that turned out not to be needed
    ///
    /// A wakeup consumed in the meantime is handed to the next receiver.
    fn retract(&self, waiter: &Arc<Waiter>, wait: MsgWait) {
        if !wait.may_block() {
            return;
        }
        self.waiters.lock().remove(waiter);
        if waiter.clear_wait() == Some(WaitResult::Normal) {
            self.waiters.lock().wakeup_one(self.event(), WaitResult::Normal);
        }
    }
}

impl Drop for PortSet {
    fn drop(&mut self) {
        // A set dropped without `destroy` still lets go of its members.
        let members = core::mem::take(&mut self.inner.get_mut().members);
        for port in members.into_values() {
            {
                let mut pi = port.inner.lock();
                if pi.in_set(self) {
                    pi.pset = None;
                }
            }
            port.release();
        }
    }
}

impl core::fmt::Debug for PortSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PortSet")
            .field("addr", &(self as *const Self))
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::notify::ReadyLatch;
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
    fn test_add_remove_restores_refs() {
        let set = PortSet::allocate();
        let receive = Port::allocate_receive();
        let port = receive.port().clone();
        let set_refs = set.ref_count();
        let port_refs = port.ref_count();

        set.add(&port).unwrap();
        assert!(set.contains(&port));
        assert!(port.pset().is_some());
        assert_eq!(set.add(&port).unwrap_err(), IpcError::AlreadyInSet);

        set.remove(&port).unwrap();
        assert!(port.pset().is_none());
        assert_eq!(set.member_count(), 0);
        assert_eq!(set.ref_count(), set_refs);
        assert_eq!(port.ref_count(), port_refs);
        assert_eq!(set.remove(&port).unwrap_err(), IpcError::NotInSet);
    }

    #[test]
    fn test_deactivate_counts_real_detaches() {
        let set = PortSet::allocate();
        let a = Port::allocate_receive();
        let b = Port::allocate_receive();
        set.add(a.port()).unwrap();
        set.add(b.port()).unwrap();

        assert_eq!(set.deactivate(), 2);
        assert!(a.port().pset().is_none());
        assert!(b.port().pset().is_none());
        assert_eq!(set.deactivate(), 0);
        set.release();
    }

    #[test]
    fn test_move_between_sets() {
        let a = PortSet::allocate();
        let b = PortSet::allocate();
        let receive = Port::allocate_receive();
        let port = receive.port().clone();

        assert_eq!(
            PortSet::move_port(&port, None).unwrap_err(),
            IpcError::NotInSet
        );
        PortSet::move_port(&port, Some(&a)).unwrap();
        PortSet::move_port(&port, Some(&a)).unwrap();
        PortSet::move_port(&port, Some(&b)).unwrap();
        assert!(!a.contains(&port));
        assert!(b.contains(&port));
        assert_eq!(a.ref_count(), 1);
        assert_eq!(b.ref_count(), 2);

        PortSet::move_port(&port, None).unwrap();
        assert!(port.pset().is_none());
        assert_eq!(b.ref_count(), 1);
    }

    #[test]
    fn test_receive_from_any_member() {
        let set = PortSet::allocate();
        let p1 = Port::allocate_receive();
        let p2 = Port::allocate_receive();
        set.add(p1.port()).unwrap();
        set.add(p2.port()).unwrap();

        p2.port().enqueue(message(2), MsgWait::NoWait).unwrap();
        assert_eq!(set.dequeue(MsgWait::NoWait, accept).unwrap().id(), 2);
        assert_eq!(
            set.dequeue(MsgWait::NoWait, accept).unwrap_err(),
            IpcError::WouldBlock
        );
    }

    #[test]
    fn test_blocked_receiver_woken_by_member_send() {
        let set = PortSet::allocate();
        let receive = Port::allocate_receive();
        set.add(receive.port()).unwrap();

        let receiver = {
            let set = set.clone();
            thread::spawn(move || set.dequeue(MsgWait::Forever, accept).map(|k| k.id()))
        };
        thread::sleep(Duration::from_millis(20));
        receive.port().enqueue(message(42), MsgWait::NoWait).unwrap();
        assert_eq!(receiver.join().unwrap().unwrap(), 42);
        assert_eq!(set.waiter_count(), 0);
    }

    #[test]
    fn test_destroy_detaches_members() {
        let set = PortSet::allocate();
        let receive = Port::allocate_receive();
        let port = receive.port().clone();
        set.add(&port).unwrap();
        port.enqueue(message(1), MsgWait::NoWait).unwrap();
        let refs = port.ref_count();

        let latch = ReadyLatch::new();
        set.register_readiness_consumer(latch.clone()).unwrap();
        assert!(latch.take());

        set.destroy();
        assert!(!set.is_active());
        assert!(latch.is_closed());
        assert!(port.is_active());
        assert!(port.pset().is_none());
        assert_eq!(port.ref_count(), refs - 1);
        assert_eq!(port.dequeue(MsgWait::NoWait, accept).unwrap().id(), 1);
        assert_eq!(
            set.dequeue(MsgWait::NoWait, accept).unwrap_err(),
            IpcError::ObjectDied
        );
    }

    #[test]
    fn test_destroy_wakes_blocked_receiver() {
        let set = PortSet::allocate();
        let receiver = {
            let set = set.clone();
            thread::spawn(move || set.dequeue(MsgWait::Forever, accept).map(|k| k.id()))
        };
        thread::sleep(Duration::from_millis(20));
        set.destroy();
        assert_eq!(receiver.join().unwrap().unwrap_err(), IpcError::ObjectDied);
    }

    #[test]
    fn test_port_death_leaves_set() {
        let set = PortSet::allocate();
        let receive = Port::allocate_receive();
        set.add(receive.port()).unwrap();
        drop(receive);
        assert_eq!(set.member_count(), 0);
        assert_eq!(set.ref_count(), 1);
    }

    #[test]
    fn test_consumer_limit_and_unregister() {
        let set = PortSet::allocate();
        let mut latches = Vec::new();
        for _ in 0..MAX_READINESS_CONSUMERS {
            let latch: Arc<dyn ReadinessConsumer> = ReadyLatch::new();
            set.register_readiness_consumer(latch.clone()).unwrap();
            latches.push(latch);
        }
        assert_eq!(
            set.register_readiness_consumer(ReadyLatch::new())
                .unwrap_err(),
            IpcError::ResourceExhausted
        );
        assert!(set.unregister_readiness_consumer(&latches[0]));
        assert!(!set.unregister_readiness_consumer(&latches[0]));
        assert_eq!(set.consumer_count(), MAX_READINESS_CONSUMERS - 1);
    }

    #[test]
    fn test_dropped_set_releases_members() {
        let receive = Port::allocate_receive();
        let port = receive.port().clone();
        let refs = port.ref_count();
        {
            let set = PortSet::allocate();
            set.add(&port).unwrap();
            assert_eq!(port.ref_count(), refs + 1);
        }
        assert_eq!(port.ref_count(), refs);
        assert!(port.pset().is_none());
    }
}
