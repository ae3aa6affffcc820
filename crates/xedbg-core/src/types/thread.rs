//! Thread identifiers.

use std::fmt;

/// Guest thread identifier
///
/// Assigned by the kernel emulation when a guest thread is created and used
/// as the key of the thread debug table.
///
/// ## Example
///
/// ```rust
/// use xedbg_core::types::ThreadId;
///
/// let thread = ThreadId::from(7);
/// assert_eq!(thread.raw(), 7);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

impl ThreadId
{
    /// Get the raw `u32` representation of the thread identifier
    pub const fn raw(self) -> u32
    {
        self.0
    }
}

impl From<u32> for ThreadId
{
    fn from(value: u32) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "#{}", self.0)
    }
}

/// Handle of the host OS thread backing a guest thread.
///
/// The stack walker uses it to sample native register state. Its meaning is
/// defined by whoever implements [`GuestThread`](crate::thread::GuestThread).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeThreadHandle(pub u64);

impl NativeThreadHandle
{
    /// Get the raw handle value.
    pub const fn raw(self) -> u64
    {
        self.0
    }
}
