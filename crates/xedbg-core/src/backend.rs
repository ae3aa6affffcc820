//! Code generation backend and guest memory interfaces.
//!
//! Both are implemented outside this crate (the in-memory machine under
//! `sim` is the exception) and are only ever called with the debug lock held
//! or from the stepping engine.

use crate::breakpoints::Breakpoint;
use crate::function::Function;
use crate::thread::ThreadDebugInfo;
use crate::types::{GuestAddress, HostAddress};

/// Code generation backend.
pub trait Backend: Send + Sync
{
    /// Patch a trap for `breakpoint` into translated code.
    ///
    /// Guest breakpoints pass the resolved function to patch; host breakpoints
    /// pass `None`. Returns `false` when the trap could not be placed.
    fn install_breakpoint(&self, breakpoint: &Breakpoint, function: Option<&Function>) -> bool;

    /// Remove a trap previously placed by [`install_breakpoint`](Self::install_breakpoint).
    fn uninstall_breakpoint(&self, breakpoint: &Breakpoint, function: Option<&Function>) -> bool;

    /// Host address the thread reaches after executing the host instruction at `current`.
    fn calculate_next_host_instruction(&self, thread: &ThreadDebugInfo, current: HostAddress) -> HostAddress;

    /// Whether guest register state is fully written back at `address`.
    fn is_synchronization_point(&self, address: GuestAddress) -> bool;
}

/// Guest memory access.
pub trait Memory: Send + Sync
{
    /// Translate `address` and load a big-endian 32-bit word.
    ///
    /// Returns `None` for unmapped addresses.
    fn load_u32(&self, address: GuestAddress) -> Option<u32>;
}
