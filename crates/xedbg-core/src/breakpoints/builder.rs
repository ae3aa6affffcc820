//! # Breakpoint Builder
//!
//! Fluent construction of breakpoints before they are handed to the processor.

use std::sync::Arc;

use crate::breakpoints::{Breakpoint, BreakpointAddress, BreakpointHit, BreakpointKind, HitCallback};
use crate::types::{GuestAddress, HostAddress};

/// Builder for configuring a breakpoint.
///
/// ## Example
///
/// ```rust
/// use xedbg_core::breakpoints::builder::BreakpointBuilder;
/// use xedbg_core::types::GuestAddress;
///
/// let bp = BreakpointBuilder::guest(GuestAddress::new(0x8200_0010))
///     .with_callback(|hit| println!("thread {} hit {}", hit.thread, hit.address))
///     .build();
/// assert!(bp.is_enabled());
/// ```
pub struct BreakpointBuilder
{
    address: BreakpointAddress,
    kind: BreakpointKind,
    callback: Option<HitCallback>,
    enabled: bool,
}

impl std::fmt::Debug for BreakpointBuilder
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("BreakpointBuilder")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("callback", &self.callback.is_some())
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl BreakpointBuilder
{
    /// Create a builder for a breakpoint keyed on a guest program counter.
    ///
    /// ## Parameters
    ///
    /// - `address`: Guest address of the instruction to trap on.
    pub fn guest(address: GuestAddress) -> Self
    {
        Self::new(BreakpointAddress::Guest(address))
    }

    /// Create a builder for a breakpoint keyed on a host code address.
    ///
    /// ## Parameters
    ///
    /// - `address`: Host address of the instruction to trap on.
    pub fn host(address: HostAddress) -> Self
    {
        Self::new(BreakpointAddress::Host(address))
    }

    fn new(address: BreakpointAddress) -> Self
    {
        Self {
            address,
            kind: BreakpointKind::User,
            callback: None,
            enabled: true,
        }
    }

    /// Set the breakpoint kind (defaults to [`BreakpointKind::User`]).
    #[must_use]
    pub fn with_kind(mut self, kind: BreakpointKind) -> Self
    {
        self.kind = kind;
        self
    }

    /// Run `callback` (outside the debug lock) every time the breakpoint fires.
    #[must_use]
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&BreakpointHit) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Whether the breakpoint starts enabled (default `true`).
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self
    {
        self.enabled = enabled;
        self
    }

    /// Finish the breakpoint.
    #[must_use]
    pub fn build(self) -> Arc<Breakpoint>
    {
        Arc::new(Breakpoint::new(self.address, self.kind, self.callback, self.enabled))
    }
}
