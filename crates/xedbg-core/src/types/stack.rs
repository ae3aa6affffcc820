//! Stack frame types.

use std::sync::Arc;

use super::{GuestAddress, HostAddress, HostContext};
use crate::function::Function;

/// Raw result of a stack capture: host program counters, innermost first,
/// plus the register state they were unwound from.
#[derive(Debug, Clone, Default)]
pub struct CapturedStack
{
    /// Host program counters, innermost first.
    pub host_pcs: Vec<HostAddress>,
    /// Register state at the innermost frame.
    pub context: HostContext,
}

/// What a host program counter was resolved to.
#[derive(Debug, Clone)]
pub enum FrameLocation
{
    /// Translated guest code.
    Guest
    {
        /// Function containing the frame, when the resolver knows it.
        function: Option<Arc<Function>>,
        /// Guest program counter, or zero when the host pc does not map to an
        /// instruction boundary (prologues, thunk stubs).
        guest_pc: GuestAddress,
    },
    /// Host runtime code.
    Host
    {
        /// Start of the host symbol.
        symbol: HostAddress,
        /// Raw (possibly mangled) symbol name.
        name: String,
    },
}

/// A host frame after symbolization.
#[derive(Debug, Clone)]
pub struct ResolvedFrame
{
    /// Host program counter of the frame.
    pub host_pc: HostAddress,
    /// Guest or host location.
    pub location: FrameLocation,
}

/// Frame as stored in a thread's debug record.
///
/// Guest frames carry the guest function and program counter; host frames
/// carry a demangled symbol name and leave the guest fields empty.
#[derive(Debug, Clone)]
pub struct ThreadFrame
{
    /// Host program counter.
    pub host_pc: HostAddress,
    /// Start of the host function (host frames) or zero.
    pub host_function_address: HostAddress,
    /// Guest program counter (zero when unknown or for host frames).
    pub guest_pc: GuestAddress,
    /// Start of the guest function (zero for host frames).
    pub guest_function_address: GuestAddress,
    /// Guest function, for guest frames.
    pub guest_function: Option<Arc<Function>>,
    /// Display name.
    pub name: String,
}

impl ThreadFrame
{
    /// Whether the frame belongs to guest code.
    pub fn is_guest(&self) -> bool
    {
        self.guest_function.is_some() || !self.guest_pc.is_zero()
    }
}
