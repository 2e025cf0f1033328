//! Scheduling Primitives - Wait/Wakeup and Event Management
//!
//! Based on Mach4 kern/sched_prim.h/c
//! Provides thread blocking, wakeup, and event-based synchronization for
//! hosted threads.
//!
//! The Mach protocol is kept: a thread first *asserts* a wait on an event,
//! then (after dropping its object locks) *blocks*. A wakeup that arrives
//! between the two is not lost because it flips the asserted wait to
//! `Woken` and `block` returns immediately.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::types::ThreadId;

// ============================================================================
// Wait Results
// ============================================================================

/// Result of a wait operation (from Mach4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum WaitResult {
    /// Thread was awakened normally
    Normal = 0,
    /// Thread was awakened abnormally (the awaited object went away)
    Abnormal = 1,
    /// Thread was interrupted
    Interrupted = 2,
    /// Wait timed out
    TimedOut = 3,
}

// ============================================================================
// Wait Event
// ============================================================================

/// Event that threads can wait on
/// In Mach, this is typically a pointer cast to an integer
pub type WaitEvent = u64;

/// Special value indicating no event
pub const EVENT_NULL: WaitEvent = 0;

/// Convert an object address to a wait event
#[inline]
pub fn event_from_addr<T: ?Sized>(addr: &T) -> WaitEvent {
    addr as *const T as *const () as usize as WaitEvent
}

// ============================================================================
// Waiter
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Idle,
    Waiting { event: WaitEvent, interruptible: bool },
    Woken(WaitResult),
}

#[derive(Debug)]
struct WaiterState {
    wait: WaitState,
    /// An interrupt that arrived while the thread was not interruptibly waiting
    interrupt_pending: bool,
}

/// Per-thread wait state
///
/// One `Waiter` exists per OS thread; wait queues hold `Arc<Waiter>`
/// handles to it.
#[derive(Debug)]
pub struct Waiter {
    thread_id: ThreadId,
    state: Mutex<WaiterState>,
    wakeup: Condvar,
}

impl Waiter {
    fn new(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            state: Mutex::new(WaiterState {
                wait: WaitState::Idle,
                interrupt_pending: false,
            }),
            wakeup: Condvar::new(),
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Declare that this thread is about to wait on `event`
    ///
    /// A pending interrupt is consumed here and turns the wait into an
    /// immediate `Interrupted` wakeup.
    pub fn assert_wait(&self, event: WaitEvent, interruptible: bool) {
        let mut st = self.state.lock();
        if interruptible && st.interrupt_pending {
            st.interrupt_pending = false;
            st.wait = WaitState::Woken(WaitResult::Interrupted);
        } else {
            st.wait = WaitState::Waiting {
                event,
                interruptible,
            };
        }
    }

    /// Wake this thread if it is waiting on `event`
    ///
    /// Returns false when the thread already left the wait (woken by
    /// someone else, timed out, or never asserted it).
    pub fn wakeup(&self, event: WaitEvent, result: WaitResult) -> bool {
        let mut st = self.state.lock();
        match st.wait {
            WaitState::Waiting { event: e, .. } if e == event => {
                st.wait = WaitState::Woken(result);
                self.wakeup.notify_one();
                true
            }
            _ => false,
        }
    }

    /// Interrupt this thread
    ///
    /// Delivered immediately to an interruptible wait, otherwise left
    /// pending for the next one. Returns true if delivered immediately.
    pub fn interrupt(&self) -> bool {
        let mut st = self.state.lock();
        match st.wait {
            WaitState::Waiting {
                interruptible: true,
                ..
            } => {
                st.wait = WaitState::Woken(WaitResult::Interrupted);
                self.wakeup.notify_one();
                true
            }
            _ => {
                st.interrupt_pending = true;
                false
            }
        }
    }

    /// Block until woken or until `deadline` passes
    pub fn block(&self, deadline: Option<Instant>) -> WaitResult {
        let mut st = self.state.lock();
        loop {
            match st.wait {
                WaitState::Woken(result) => {
                    st.wait = WaitState::Idle;
                    return result;
                }
                WaitState::Idle => return WaitResult::Normal,
                WaitState::Waiting { .. } => match deadline {
                    None => self.wakeup.wait(&mut st),
                    Some(deadline) => {
                        let timed_out = self.wakeup.wait_until(&mut st, deadline).timed_out();
                        if timed_out && matches!(st.wait, WaitState::Waiting { .. }) {
                            st.wait = WaitState::Idle;
                            return WaitResult::TimedOut;
                        }
                    }
                },
            }
        }
    }

    /// Abandon an asserted wait without blocking
    ///
    /// Returns the wakeup result if one was delivered in the meantime, so
    /// the caller can pass a consumed wakeup on to another waiter. An
    /// interrupt delivered in the meantime is put back as pending.
    pub fn clear_wait(&self) -> Option<WaitResult> {
        let mut st = self.state.lock();
        match core::mem::replace(&mut st.wait, WaitState::Idle) {
            WaitState::Woken(WaitResult::Interrupted) => {
                st.interrupt_pending = true;
                None
            }
            WaitState::Woken(result) => Some(result),
            _ => None,
        }
    }

    /// Whether an interrupt is waiting to be delivered
    pub fn interrupt_pending(&self) -> bool {
        self.state.lock().interrupt_pending
    }
}

// ============================================================================
// Wait Queue
// ============================================================================

/// FIFO queue of threads waiting on one object
#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: VecDeque<Arc<Waiter>>,
}

impl WaitQueue {
    /// Create a new wait queue
    pub const fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    /// Add a waiter at the tail (no-op if already queued)
    pub fn enqueue(&mut self, waiter: Arc<Waiter>) {
        if !self.waiters.iter().any(|w| Arc::ptr_eq(w, &waiter)) {
            self.waiters.push_back(waiter);
        }
    }

    /// Remove a specific waiter
    pub fn remove(&mut self, waiter: &Arc<Waiter>) -> bool {
        match self.waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Wake the oldest thread still waiting on `event`
    ///
    /// Stale entries (threads that timed out or were interrupted) are
    /// discarded on the way.
    pub fn wakeup_one(&mut self, event: WaitEvent, result: WaitResult) -> bool {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.wakeup(event, result) {
                return true;
            }
        }
        false
    }

    /// Wake every queued thread waiting on `event`
    pub fn wakeup_all(&mut self, event: WaitEvent, result: WaitResult) -> usize {
        self.waiters
            .drain(..)
            .filter(|w| w.wakeup(event, result))
            .count()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

// ============================================================================
// Thread registry
// ============================================================================

/// Live threads, for interruption by id
static THREADS: spin::Once<spin::Mutex<BTreeMap<ThreadId, Weak<Waiter>>>> = spin::Once::new();

fn threads() -> &'static spin::Mutex<BTreeMap<ThreadId, Weak<Waiter>>> {
    THREADS.call_once(|| spin::Mutex::new(BTreeMap::new()))
}

struct ThreadSlot {
    waiter: Arc<Waiter>,
}

impl ThreadSlot {
    fn register() -> Self {
        let waiter = Arc::new(Waiter::new(ThreadId::new()));
        threads()
            .lock()
            .insert(waiter.thread_id, Arc::downgrade(&waiter));
        Self { waiter }
    }
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        threads().lock().remove(&self.waiter.thread_id);
    }
}

thread_local! {
    static CURRENT: ThreadSlot = ThreadSlot::register();
}

/// The calling thread's waiter
pub fn current_waiter() -> Arc<Waiter> {
    CURRENT.with(|slot| slot.waiter.clone())
}

/// The calling thread's id
pub fn current_thread() -> ThreadId {
    CURRENT.with(|slot| slot.waiter.thread_id)
}

/// Interrupt a thread (the hosted analogue of a delivered signal)
///
/// Returns false if no live thread has this id.
pub fn thread_interrupt(thread_id: ThreadId) -> bool {
    let waiter = threads().lock().get(&thread_id).and_then(Weak::upgrade);
    match waiter {
        Some(waiter) => {
            waiter.interrupt();
            true
        }
        None => false,
    }
}
