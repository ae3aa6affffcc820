//! Host stack walking.
//!
//! The walker captures host program counters for a thread and symbolizes
//! them into guest functions or host symbols. Host symbol names arrive raw
//! and are demangled here with `rustc_demangle` before they are stored.

use rustc_demangle::try_demangle;

use crate::types::{CapturedStack, HostAddress, HostContext, NativeThreadHandle, ResolvedFrame};

/// Default maximum number of frames captured per thread.
pub const MAX_STACK_FRAMES: usize = 64;

/// Host stack unwinder.
pub trait StackWalker: Send + Sync
{
    /// Capture up to `max_frames` host program counters for a thread.
    ///
    /// When `override_context` is given, unwinding starts from it instead of
    /// the thread's sampled register state (used for the thread that trapped,
    /// whose live registers belong to the trap handler).
    fn capture_stack_trace(
        &self,
        thread: NativeThreadHandle,
        max_frames: usize,
        override_context: Option<&HostContext>,
    ) -> Option<CapturedStack>;

    /// Map host program counters to guest functions or host symbols.
    fn resolve_stack(&self, frames: &[HostAddress]) -> Vec<ResolvedFrame>;
}

/// Human-readable form of a host symbol name.
///
/// Rust symbols (legacy and v0 mangling) are demangled without their hash
/// suffix; anything else is returned unchanged.
///
/// ## Example
///
/// ```rust
/// use xedbg_core::stack::demangle_symbol;
///
/// assert_eq!(demangle_symbol("_ZN4core3ptr13drop_in_place17h0123456789abcdefE"), "core::ptr::drop_in_place");
/// assert_eq!(demangle_symbol("KeWaitForSingleObject"), "KeWaitForSingleObject");
/// ```
pub fn demangle_symbol(raw: &str) -> String
{
    match try_demangle(raw) {
        Ok(demangled) => format!("{demangled:#}"),
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_demangle_legacy_symbol_drops_hash()
    {
        assert_eq!(
            demangle_symbol("_ZN8xboxkrnl14ke_wait_single17h1111111111111111E"),
            "xboxkrnl::ke_wait_single"
        );
    }

    #[test]
    fn test_plain_symbol_is_unchanged()
    {
        assert_eq!(demangle_symbol("NtWaitForSingleObjectEx"), "NtWaitForSingleObjectEx");
    }
}
