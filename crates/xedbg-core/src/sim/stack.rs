use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{PoisonError, RwLock, Weak};

use super::{export_host_address, guest_pc_for, SimThread, HOST_EXPORT_BASE, HOST_EXPORT_STRIDE};
use crate::stack::StackWalker;
use crate::types::{CapturedStack, FrameLocation, HostAddress, HostContext, NativeThreadHandle, ResolvedFrame};

/// Legacy Rust mangling of `xboxkrnl::<export>`, the way host export
/// implementations show up in a native symbol table.
pub fn mangle_export_symbol(export: &str) -> String
{
    let mut symbol = String::from("_ZN");
    for segment in ["xboxkrnl", export] {
        let _ = write!(symbol, "{}{segment}", segment.len());
    }
    symbol.push_str("17h5b0d6c4e8a9f2d31E");
    symbol
}

/// Stack walker over [`SimThread`] call stacks.
#[derive(Debug, Default)]
pub struct SimStackWalker
{
    threads: RwLock<HashMap<NativeThreadHandle, Weak<SimThread>>>,
    exports: RwLock<HashMap<u32, String>>,
}

impl SimStackWalker
{
    /// Create a walker that knows no threads.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Make a thread's stack visible to the walker.
    pub fn register_thread(&self, handle: NativeThreadHandle, thread: Weak<SimThread>)
    {
        self.threads.write().unwrap_or_else(PoisonError::into_inner).insert(handle, thread);
    }

    /// Name the host implementation of export `ordinal`.
    pub fn register_export(&self, ordinal: u32, name: &str)
    {
        self.exports.write().unwrap_or_else(PoisonError::into_inner).insert(ordinal, name.to_string());
    }

    fn export_symbol(&self, host_pc: HostAddress) -> Option<(HostAddress, String)>
    {
        let offset = host_pc.value().checked_sub(HOST_EXPORT_BASE)?;
        let ordinal = u32::try_from(offset / HOST_EXPORT_STRIDE).ok()?;
        let exports = self.exports.read().unwrap_or_else(PoisonError::into_inner);
        let name = exports.get(&ordinal)?;
        Some((export_host_address(ordinal), mangle_export_symbol(name)))
    }
}

impl StackWalker for SimStackWalker
{
    fn capture_stack_trace(
        &self,
        thread: NativeThreadHandle,
        max_frames: usize,
        override_context: Option<&HostContext>,
    ) -> Option<CapturedStack>
    {
        let thread = self.threads.read().unwrap_or_else(PoisonError::into_inner).get(&thread)?.upgrade()?;
        let mut captured = thread.capture_stack(max_frames);
        if let Some(context) = override_context {
            captured.context = context.clone();
        }
        Some(captured)
    }

    fn resolve_stack(&self, frames: &[HostAddress]) -> Vec<ResolvedFrame>
    {
        frames
            .iter()
            .map(|&host_pc| {
                let location = if let Some(guest_pc) = guest_pc_for(host_pc) {
                    FrameLocation::Guest {
                        function: None,
                        guest_pc,
                    }
                } else if let Some((symbol, name)) = self.export_symbol(host_pc) {
                    FrameLocation::Host { symbol, name }
                } else {
                    FrameLocation::Host {
                        symbol: host_pc,
                        name: format!("{host_pc}"),
                    }
                };
                ResolvedFrame { host_pc, location }
            })
            .collect()
    }
}
