//! Kern subsystem - Core kernel primitives
//!
//! Based on Mach4 kern/ directory
//! Contains the lock ordering helpers and the wait/wakeup primitives the
//! IPC layer blocks on.

pub mod lock;
pub mod sched_prim;
