//! # Types
//!
//! Value types shared by every part of the subsystem.
//!
//! Guest and host addresses, thread identifiers, register snapshots and the
//! stack frames captured when execution pauses. None of these types carry
//! behavior beyond small accessors; the interesting logic lives in the
//! processor and its collaborators.

pub mod address;
pub mod context;
pub mod stack;
pub mod thread;

// Re-export all public types
pub use address::{GuestAddress, HostAddress, INSTRUCTION_WIDTH};
pub use context::{ConditionField, GuestContext, HostContext};
pub use stack::{CapturedStack, FrameLocation, ResolvedFrame, ThreadFrame};
pub use thread::{NativeThreadHandle, ThreadId};
