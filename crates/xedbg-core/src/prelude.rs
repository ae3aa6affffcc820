//! Common module for library exports

pub use crate::breakpoints::builder::BreakpointBuilder;
pub use crate::breakpoints::{BreakpointAddress, BreakpointId, BreakpointInfo, BreakpointKind, TrapSite};
pub use crate::config::ProcessorConfig;
pub use crate::error::{DebugError, DebugResult};
pub use crate::events::{ChannelListener, DebugEvent, DebugListener};
pub use crate::function::{Export, Function, Module, ModuleKind};
pub use crate::processor::{ExecutionState, Processor, TrapOutcome};
pub use crate::thread::{GuestThread, ThreadDebugInfo, ThreadState};
pub use crate::types::{GuestAddress, GuestContext, HostAddress, HostContext, ThreadId};
