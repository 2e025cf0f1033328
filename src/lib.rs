//! mach_ipc - Mach-style port IPC core
//!
//! This crate implements the message-passing heart of a Mach kernel:
//! kernel messages with typed bodies, per-port message queues, reference
//! counted ports and port sets, and the combined send/receive `mach_msg`
//! entry point.
//!
//! The per-process name space and the address map are collaborators
//! reached through the [`ipc::space::IpcSpace`] and [`vm::VmMap`] traits.
//! Reference implementations of both ([`ipc::space::SimpleSpace`] and
//! [`vm::SimpleMap`]) are provided so the core can be driven end to end.

// IPC routines return a kernel message back to the caller on failure
#![allow(clippy::result_large_err)]
// Large enum variants are expected for kernel message descriptors
#![allow(clippy::large_enum_variant)]
// Wire constants keep the Mach spelling of their bit layout
#![allow(clippy::identity_op)]
// Objects are built through Arc-returning constructors
#![allow(clippy::new_without_default)]

// Core types
pub mod types;

pub mod config;
pub mod ipc;
pub mod kern;
pub mod task;
pub mod vm;

pub use config::IpcConfig;
pub use ipc::{IpcError, IpcResult, PortName};
pub use task::IpcTask;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "mach_ipc";
