//! # xedbg-core
//!
//! Execution control and debugging for a guest PowerPC emulator.
//!
//! This crate provides the pieces a debugger frontend drives:
//! - A function registry that resolves guest addresses to translated functions
//! - A global Running/Paused/Stepping state machine
//! - Per-thread debug records (contexts, stacks, suspension)
//! - Guest and host breakpoints, installed through the code generation backend
//! - Host and guest instruction stepping, stepping to an address, over a
//!   branch, or to the next safe point
//!
//! ## Collaborators
//!
//! The recompiler, guest memory, stack walker, modules and guest threads are
//! reached through the traits in [`backend`], [`stack`], [`function`] and
//! [`thread`]. The `sim` feature (on by default) provides an in-memory
//! implementation of all of them.

pub mod backend;
pub mod breakpoints;
pub mod config;
pub mod error;
pub mod events;
pub mod fence;
pub mod function;
pub mod ppc;
pub mod prelude;
pub mod processor;
pub mod registry;
#[cfg(feature = "sim")]
pub mod sim;
pub mod stack;
pub mod thread;
pub mod types;

// Re-export commonly used types
pub use error::{DebugError, DebugResult};
pub use processor::{ExecutionState, Processor};
