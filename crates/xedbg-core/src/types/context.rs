//! Guest and host register snapshots.

use super::{GuestAddress, HostAddress};

/// One 4-bit field of the condition register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConditionField
{
    /// Less than
    pub lt: bool,
    /// Greater than
    pub gt: bool,
    /// Equal
    pub eq: bool,
    /// Summary overflow
    pub so: bool,
}

impl ConditionField
{
    /// Field value for a signed comparison of `a` against `b`.
    #[must_use]
    pub fn compare(a: i64, b: i64) -> Self
    {
        Self {
            lt: a < b,
            gt: a > b,
            eq: a == b,
            so: false,
        }
    }

    const fn bits(self) -> u32
    {
        ((self.lt as u32) << 3) | ((self.gt as u32) << 2) | ((self.eq as u32) << 1) | (self.so as u32)
    }
}

/// Guest-visible PowerPC register state.
///
/// Only the registers the branch decoder and the stack walker care about are
/// modelled. The condition register is kept packed the way the hardware
/// stores it: bit 0 is the most significant bit, field 0 occupies bits 0..4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestContext
{
    /// General purpose registers r0..r31
    pub gpr: [u64; 32],
    /// Link register
    pub lr: u64,
    /// Count register
    pub ctr: u64,
    /// Condition register (packed)
    pub cr: u32,
    /// Fixed-point exception register
    pub xer: u32,
}

impl Default for GuestContext
{
    fn default() -> Self
    {
        Self {
            gpr: [0; 32],
            lr: 0,
            ctr: 0,
            cr: 0,
            xer: 0,
        }
    }
}

impl GuestContext
{
    /// Read condition register bit `bi` (0 = most significant).
    #[must_use]
    pub const fn cr_bit(&self, bi: u32) -> bool
    {
        (self.cr >> (31 - (bi & 0x1F))) & 1 != 0
    }

    /// Read condition register field `field` (0..8).
    #[must_use]
    pub const fn cr_field(&self, field: u32) -> ConditionField
    {
        let nibble = (self.cr >> (28 - 4 * (field & 0x7))) & 0xF;
        ConditionField {
            lt: nibble & 0x8 != 0,
            gt: nibble & 0x4 != 0,
            eq: nibble & 0x2 != 0,
            so: nibble & 0x1 != 0,
        }
    }

    /// Overwrite condition register field `field` (0..8).
    pub fn set_cr_field(&mut self, field: u32, value: ConditionField)
    {
        let shift = 28 - 4 * (field & 0x7);
        self.cr = (self.cr & !(0xF << shift)) | (value.bits() << shift);
    }

    /// Branch target held in the link register (low 32 bits).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn link_target(&self) -> GuestAddress
    {
        GuestAddress::new(self.lr as u32)
    }

    /// Branch target held in the count register (low 32 bits).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn count_target(&self) -> GuestAddress
    {
        GuestAddress::new(self.ctr as u32)
    }
}

/// Host register state of the OS thread running guest code.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostContext
{
    /// Host program counter
    pub pc: HostAddress,
    /// Host stack pointer
    pub sp: u64,
    /// Flags register
    pub flags: u64,
    /// Integer registers
    pub gpr: [u64; 16],
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_cr_bit_numbering_is_msb_first()
    {
        let mut ctx = GuestContext::default();
        ctx.set_cr_field(0, ConditionField { lt: true, ..Default::default() });
        assert!(ctx.cr_bit(0));
        assert!(!ctx.cr_bit(1));
        assert_eq!(ctx.cr, 0x8000_0000);

        ctx.set_cr_field(7, ConditionField { so: true, ..Default::default() });
        assert!(ctx.cr_bit(31));
        assert_eq!(ctx.cr, 0x8000_0001);
    }

    #[test]
    fn test_set_cr_field_replaces_previous_value()
    {
        let mut ctx = GuestContext::default();
        ctx.set_cr_field(6, ConditionField::compare(1, 2));
        assert!(ctx.cr_field(6).lt);
        ctx.set_cr_field(6, ConditionField::compare(2, 2));
        assert_eq!(ctx.cr_field(6), ConditionField { eq: true, ..Default::default() });
        // bit 26 is cr6[eq]
        assert!(ctx.cr_bit(26));
    }
}
