//! Guest and host address types.

use std::fmt;
use std::ops::{Add, Sub};

/// Width of every guest instruction in bytes.
pub const INSTRUCTION_WIDTH: u32 = 4;

/// Strongly typed guest (emulated) address
///
/// The guest is a 32-bit big-endian PowerPC machine, so every guest address
/// fits in a `u32`. Keeping guest and host addresses in distinct newtypes
/// prevents passing a translated host code pointer where a guest program
/// counter is expected (and vice versa).
///
/// ## Example
///
/// ```rust
/// use xedbg_core::types::GuestAddress;
///
/// let pc = GuestAddress::new(0x8200_0000);
/// assert_eq!(pc.next_instruction().value(), 0x8200_0004);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct GuestAddress(u32);

impl GuestAddress
{
    /// The null guest address, used as a "no address" sentinel by frames.
    pub const ZERO: Self = GuestAddress(0);

    /// Create a new guest address.
    pub const fn new(value: u32) -> Self
    {
        GuestAddress(value)
    }

    /// Get the raw `u32` value of this address.
    pub const fn value(self) -> u32
    {
        self.0
    }

    /// Whether this is the null sentinel.
    pub const fn is_zero(self) -> bool
    {
        self.0 == 0
    }

    /// Address of the instruction following this one (`pc + 4`), wrapping at 4 GiB.
    #[must_use]
    pub const fn next_instruction(self) -> Self
    {
        GuestAddress(self.0.wrapping_add(INSTRUCTION_WIDTH))
    }

    /// Add a signed displacement, wrapping like the hardware does.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn offset(self, displacement: i32) -> Self
    {
        GuestAddress(self.0.wrapping_add(displacement as u32))
    }
}

impl From<u32> for GuestAddress
{
    fn from(value: u32) -> Self
    {
        GuestAddress(value)
    }
}

impl From<GuestAddress> for u32
{
    fn from(address: GuestAddress) -> Self
    {
        address.0
    }
}

impl fmt::Display for GuestAddress
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:08x}", self.0)
    }
}

impl Add<u32> for GuestAddress
{
    type Output = GuestAddress;

    fn add(self, rhs: u32) -> Self::Output
    {
        GuestAddress(self.0.wrapping_add(rhs))
    }
}

impl Sub<u32> for GuestAddress
{
    type Output = GuestAddress;

    fn sub(self, rhs: u32) -> Self::Output
    {
        GuestAddress(self.0.wrapping_sub(rhs))
    }
}

/// Strongly typed host address
///
/// Points into translated host code (or host runtime code such as export
/// thunks). Host-addressed breakpoints and host stack frames use it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HostAddress(u64);

impl HostAddress
{
    /// The null host address.
    pub const ZERO: Self = HostAddress(0);

    /// Create a new host address.
    pub const fn new(value: u64) -> Self
    {
        HostAddress(value)
    }

    /// Get the raw `u64` value of this address.
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Add an offset, checking for overflow.
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(HostAddress)
    }
}

impl From<u64> for HostAddress
{
    fn from(value: u64) -> Self
    {
        HostAddress(value)
    }
}

impl From<HostAddress> for u64
{
    fn from(address: HostAddress) -> Self
    {
        address.0
    }
}

impl fmt::Display for HostAddress
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl Add<u64> for HostAddress
{
    type Output = HostAddress;

    fn add(self, rhs: u64) -> Self::Output
    {
        HostAddress(self.0.wrapping_add(rhs))
    }
}
