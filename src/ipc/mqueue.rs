//! IPC Message Queue - Port message queue management
//!
//! Based on Mach4 ipc/ipc_mqueue.c
//! Each port has a message queue for pending messages.
//!
//! The queue itself never blocks: it lives inside its port's lock and only
//! records waiters. Blocking happens in the port (or port set) after the
//! lock is dropped, using the asserted-wait protocol of
//! [`crate::kern::sched_prim`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::QueueLimit;
use crate::kern::sched_prim::{event_from_addr, WaitEvent, WaitQueue, WaitResult, Waiter};

use super::kmsg::IpcKmsg;
use super::IpcError;

// ============================================================================
// Blocking policy
// ============================================================================

/// How long a send or receive may block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgWait {
    /// Fail with WouldBlock / QueueFull instead of blocking
    NoWait,
    /// Block until this instant, then fail with TimedOut
    Deadline(Instant),
    /// Block until the operation completes, the object dies, or the
    /// thread is interrupted
    Forever,
}

impl MsgWait {
    /// Policy for a relative timeout; zero means do not block
    pub fn timeout(timeout: Duration) -> Self {
        if timeout.is_zero() {
            return MsgWait::NoWait;
        }
        match Instant::now().checked_add(timeout) {
            Some(deadline) => MsgWait::Deadline(deadline),
            None => MsgWait::Forever,
        }
    }

    pub fn deadline(self) -> Option<Instant> {
        match self {
            MsgWait::Deadline(deadline) => Some(deadline),
            _ => None,
        }
    }

    pub fn may_block(self) -> bool {
        !matches!(self, MsgWait::NoWait)
    }
}

// ============================================================================
// Message Queue
// ============================================================================

/// Message queue for a port
///
/// From Mach4:
/// - Messages are stored in a FIFO queue
/// - Each message gets the next sequence number when it is queued
/// - Threads can wait for messages (receive) or for space (send)
#[derive(Debug)]
pub struct IpcMqueue {
    /// Message queue (FIFO)
    messages: VecDeque<Box<IpcKmsg>>,

    /// Sequence number the next enqueued message receives
    seqno: u32,

    limit: QueueLimit,

    /// Threads waiting for messages (receivers)
    receivers: WaitQueue,

    /// Threads waiting for space (senders, bounded queues only)
    senders: WaitQueue,
}

impl IpcMqueue {
    /// Create a new message queue
    pub fn new(limit: QueueLimit) -> Self {
        Self {
            messages: VecDeque::new(),
            seqno: 1,
            limit,
            receivers: WaitQueue::new(),
            senders: WaitQueue::new(),
        }
    }

    /// Event both wait queues block on
    pub fn event(&self) -> WaitEvent {
        event_from_addr(self)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Check if queue is full
    pub fn is_full(&self) -> bool {
        !self.limit.admits(self.messages.len())
    }

    pub fn limit(&self) -> QueueLimit {
        self.limit
    }

    /// Change the capacity policy, waking senders that may now fit
    pub fn set_limit(&mut self, limit: QueueLimit) {
        self.limit = limit;
        if !self.is_full() {
            let event = self.event();
            self.senders.wakeup_all(event, WaitResult::Normal);
        }
    }

    /// Sequence number the next message will get
    pub fn seqno(&self) -> u32 {
        self.seqno
    }

    pub fn set_seqno(&mut self, seqno: u32) {
        self.seqno = seqno;
    }

    // ========================================================================
    // Send Operations
    // ========================================================================

    /// Append a message, stamping its sequence number
    ///
    /// Wakes the oldest waiting receiver. On a full bounded queue the
    /// message is handed back with `QueueFull`.
    pub fn enqueue(&mut self, mut kmsg: Box<IpcKmsg>) -> Result<u32, (IpcError, Box<IpcKmsg>)> {
        if self.is_full() {
            return Err((IpcError::QueueFull, kmsg));
        }

        let seqno = self.seqno;
        self.seqno = self.seqno.wrapping_add(1);
        kmsg.set_seqno(seqno);
        self.messages.push_back(kmsg);

        let event = self.event();
        self.receivers.wakeup_one(event, WaitResult::Normal);
        Ok(seqno)
    }

    // ========================================================================
    // Receive Operations
    // ========================================================================

    /// Oldest message, without removing it
    pub fn first(&self) -> Option<&IpcKmsg> {
        self.messages.front().map(|kmsg| &**kmsg)
    }

    /// Remove the oldest message, waking a blocked sender if space opened up
    pub fn dequeue(&mut self) -> Option<Box<IpcKmsg>> {
        let kmsg = self.messages.pop_front()?;
        if matches!(self.limit, QueueLimit::Bounded(_)) {
            let event = self.event();
            self.senders.wakeup_one(event, WaitResult::Normal);
        }
        Some(kmsg)
    }

    /// Drain every buffered message
    ///
    /// The caller destroys them after dropping the port lock.
    pub fn flush(&mut self) -> Vec<Box<IpcKmsg>> {
        self.messages.drain(..).collect()
    }

    // ========================================================================
    // Waiters
    // ========================================================================

    /// Queue `waiter` as a receiver and assert its wait
    pub fn wait_receive(&mut self, waiter: &Arc<Waiter>) {
        self.receivers.enqueue(waiter.clone());
        waiter.assert_wait(self.event(), true);
    }

    /// Queue `waiter` as a blocked sender and assert its wait
    pub fn wait_send(&mut self, waiter: &Arc<Waiter>) {
        self.senders.enqueue(waiter.clone());
        waiter.assert_wait(self.event(), true);
    }

    /// Forget a waiter that gave up (timeout or interrupt)
    pub fn cancel_wait(&mut self, waiter: &Arc<Waiter>) {
        self.receivers.remove(waiter);
        self.senders.remove(waiter);
    }

    /// Wake every waiter, e.g. because the port died
    pub fn wakeup_all(&mut self, result: WaitResult) -> usize {
        let event = self.event();
        self.receivers.wakeup_all(event, result) + self.senders.wakeup_all(event, result)
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }
}
