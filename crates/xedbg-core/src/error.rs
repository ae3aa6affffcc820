//! # Error Types
//!
//! Error handling for the execution control subsystem.
//!
//! Two kinds of failure exist:
//!
//! 1. **Expected failures** are returned as [`DebugError`] values. Resolving an
//!    address outside every loaded module, a module that refuses to declare a
//!    function, or asking for a step while the process is running all fall in
//!    this bucket.
//! 2. **Protocol violations** indicate a corrupted debugger invariant (a thread
//!    trying to step itself, a trap on a thread nobody registered). These are
//!    logged and then abort through [`protocol_violation`].

use std::fmt;

use thiserror::Error;

use crate::processor::ExecutionState;
use crate::types::{GuestAddress, ThreadId};

/// Why the registry could not produce a function for an address.
///
/// This value is cached in the registry entry, so it must be cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveFailure
{
    /// No loaded module claims the address.
    NotInModule,
    /// The owning module refused to declare a function at the address.
    DeclareFailed(String),
    /// The function was declared but could not be defined (compiled/linked).
    DefineFailed(String),
}

impl fmt::Display for ResolveFailure
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::NotInModule => f.write_str("address is not inside any loaded module"),
            Self::DeclareFailed(reason) => write!(f, "declare failed: {reason}"),
            Self::DefineFailed(reason) => write!(f, "define failed: {reason}"),
        }
    }
}

/// Main error type for debugger operations
///
/// ## Error Categories
///
/// 1. **Resolution errors**: ResolveFailed
/// 2. **State errors**: InvalidState, UnknownThread, NotGuestCode, NoStackFrames
/// 3. **Breakpoint errors**: BreakpointInstallFailed
/// 4. **Stepping errors**: StepTimedOut, NoSafePoint, MemoryAccess
/// 5. **Collaborator errors**: ThreadControl, Module
/// 6. **Session errors**: InvalidSessionSignature, UnsupportedSessionVersion, Io
#[derive(Error, Debug)]
pub enum DebugError
{
    /// The registry could not resolve a function at the address.
    ///
    /// The failure is cached: asking again returns the same reason without
    /// consulting any module.
    #[error("Failed to resolve function at {address}: {reason}")]
    ResolveFailed
    {
        /// Guest address that was requested
        address: GuestAddress,
        /// Cached failure reason
        reason: ResolveFailure,
    },

    /// The thread has no debug record (never created, or already destroyed).
    #[error("Unknown thread {0}")]
    UnknownThread(ThreadId),

    /// The operation is not legal in the current execution state.
    ///
    /// Stepping is only legal while paused; pausing is not legal while stepping.
    #[error("Operation requires execution state {expected:?}, current state is {actual:?}")]
    InvalidState
    {
        /// State the operation needs
        expected: ExecutionState,
        /// State the processor is in
        actual: ExecutionState,
    },

    /// No frames were captured for the thread.
    #[error("No stack frames captured for thread {0}")]
    NoStackFrames(ThreadId),

    /// The innermost frame of the thread is not guest code.
    #[error("Thread {0} is not executing guest code")]
    NotGuestCode(ThreadId),

    /// The backend refused to install a breakpoint.
    #[error("Failed to install breakpoint at {0}")]
    BreakpointInstallFailed(String),

    /// The thread did not reach the requested address within the configured timeout.
    #[error("Thread {thread} did not reach {address} in time")]
    StepTimedOut
    {
        /// Thread that was being stepped
        thread: ThreadId,
        /// Address it was stepping to
        address: GuestAddress,
    },

    /// An instruction word could not be read from guest memory.
    #[error("Failed to read guest memory at {0}")]
    MemoryAccess(GuestAddress),

    /// No synchronization point was found within the scan limit.
    #[error("No safe point found after {start} within {limit} instructions")]
    NoSafePoint
    {
        /// Address the scan started from
        start: GuestAddress,
        /// Number of instructions inspected
        limit: usize,
    },

    /// A guest thread refused to be suspended or resumed.
    #[error("Thread control failed for thread {thread}: {reason}")]
    ThreadControl
    {
        /// Thread that failed
        thread: ThreadId,
        /// Details from the thread implementation
        reason: String,
    },

    /// A module reported an error while declaring or defining a function.
    #[error("Module error: {0}")]
    Module(String),

    /// A saved session did not start with the processor signature.
    #[error("Invalid session signature: {0:02x?}")]
    InvalidSessionSignature([u8; 4]),

    /// A saved session was written by an unknown format version.
    #[error("Unsupported session version {0}")]
    UnsupportedSessionVersion(u32),

    /// I/O error while saving or restoring a session.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for `Result<T, DebugError>`
///
/// ```rust
/// use xedbg_core::error::DebugResult;
/// fn foo() -> DebugResult<()>
/// {
///     Ok(())
/// }
/// ```
pub type DebugResult<T> = std::result::Result<T, DebugError>;

/// Log and abort on a broken debugger invariant.
///
/// Release builds use `panic = "abort"`, so this never unwinds through a
/// guest thread there.
#[track_caller]
#[cold]
pub fn protocol_violation(message: &str) -> !
{
    let location = std::panic::Location::caller();
    tracing::error!(%location, "debugger protocol violation: {message}");
    panic!("debugger protocol violation: {message}");
}
