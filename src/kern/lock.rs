//! Locking Primitives
//!
//! Based on Mach4 kern/lock.h/c by Avadis Tevanian, Jr. and Michael Wayne Young
//!
//! Every IPC object (port, port set) carries one `spin::Mutex`. Operations
//! that touch two or three objects at once must acquire them in a single
//! global order, which here is the address of the lock itself. The helpers
//! below are the only place that ordering is spelled out.
//!
//! Provides:
//! - `lock_pair` / `lock_triple`: address-ordered multi-object locking
//! - `Backoff`: bounded spin-then-yield for try-lock retry loops

use spin::{Mutex, MutexGuard};

// ============================================================================
// Lock ordering
// ============================================================================

/// Stable ordering key of a lock: its address
#[inline]
pub fn lock_addr<T: ?Sized>(lock: &Mutex<T>) -> usize {
    lock as *const Mutex<T> as *const () as usize
}

/// Acquire two object locks in address order
///
/// The guards are returned in argument order regardless of which lock was
/// taken first. `a` and `b` must be distinct locks.
pub fn lock_pair<'a, A, B>(
    a: &'a Mutex<A>,
    b: &'a Mutex<B>,
) -> (MutexGuard<'a, A>, MutexGuard<'a, B>) {
    debug_assert_ne!(lock_addr(a), lock_addr(b), "lock_pair on a single lock");

    if lock_addr(a) < lock_addr(b) {
        let ga = a.lock();
        let gb = b.lock();
        (ga, gb)
    } else {
        let gb = b.lock();
        let ga = a.lock();
        (ga, gb)
    }
}

/// Acquire one lock of type `A` and two of type `B` in address order
///
/// Used by port-set `move`, which holds the port and both the old and new
/// set at once. All three locks must be distinct.
pub fn lock_triple<'a, A, B>(
    a: &'a Mutex<A>,
    x: &'a Mutex<B>,
    y: &'a Mutex<B>,
) -> (MutexGuard<'a, A>, MutexGuard<'a, B>, MutexGuard<'a, B>) {
    debug_assert_ne!(lock_addr(x), lock_addr(y), "lock_triple on a single set");

    let swapped = lock_addr(y) < lock_addr(x);
    let (lo, hi) = if swapped { (y, x) } else { (x, y) };
    let key = lock_addr(a);

    let (ga, glo, ghi) = if key < lock_addr(lo) {
        let ga = a.lock();
        let glo = lo.lock();
        let ghi = hi.lock();
        (ga, glo, ghi)
    } else if key < lock_addr(hi) {
        let glo = lo.lock();
        let ga = a.lock();
        let ghi = hi.lock();
        (ga, glo, ghi)
    } else {
        let glo = lo.lock();
        let ghi = hi.lock();
        let ga = a.lock();
        (ga, glo, ghi)
    };

    if swapped {
        (ga, ghi, glo)
    } else {
        (ga, glo, ghi)
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Spin limit (as a power of two) before yielding the CPU
const SPIN_LIMIT: u32 = 6;

/// Exponential backoff for try-lock retry loops
///
/// Spins `2^step` times for the first few attempts, then yields to the
/// OS scheduler so a preempted lock holder can make progress.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self { step: 0 }
    }

    /// Back off once
    pub fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                core::hint::spin_loop();
            }
            self.step += 1;
        } else {
            std::thread::yield_now();
        }
    }

    /// Number of times `snooze` has been called while still spinning
    pub fn attempts(&self) -> u32 {
        self.step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_pair_returns_in_argument_order() {
        let a = Mutex::new(1u32);
        let b = Mutex::new("b");
        {
            let (ga, gb) = lock_pair(&a, &b);
            assert_eq!(*ga, 1);
            assert_eq!(*gb, "b");
        }
        let (gb, ga) = lock_pair(&b, &a);
        assert_eq!(*ga, 1);
        assert_eq!(*gb, "b");
    }

    #[test]
    fn test_lock_triple_returns_in_argument_order() {
        let a = Mutex::new(0u8);
        let x = Mutex::new(1u32);
        let y = Mutex::new(2u32);
        let (ga, gx, gy) = lock_triple(&a, &x, &y);
        assert_eq!((*ga, *gx, *gy), (0, 1, 2));
        drop((ga, gx, gy));
        let (ga, gy, gx) = lock_triple(&a, &y, &x);
        assert_eq!((*ga, *gx, *gy), (0, 1, 2));
    }

    #[test]
    fn test_opposite_order_callers_do_not_deadlock() {
        let a = Arc::new(Mutex::new(0u64));
        let b = Arc::new(Mutex::new(0u64));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let a = a.clone();
                let b = b.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        if i % 2 == 0 {
                            let (mut ga, mut gb) = lock_pair(&*a, &*b);
                            *ga += 1;
                            *gb += 1;
                        } else {
                            let (mut gb, mut ga) = lock_pair(&*b, &*a);
                            *ga += 1;
                            *gb += 1;
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*a.lock(), 4000);
        assert_eq!(*b.lock(), 4000);
    }

    #[test]
    fn test_backoff_eventually_yields() {
        let mut backoff = Backoff::new();
        for _ in 0..(SPIN_LIMIT + 4) {
            backoff.snooze();
        }
        assert_eq!(backoff.attempts(), SPIN_LIMIT + 1);
    }
}
