//! # PowerPC Branch Decoding
//!
//! Just enough of the PowerPC instruction set to predict control flow:
//! classify the instruction at a guest address, evaluate the condition of a
//! conditional branch against a register snapshot, and produce the successor
//! addresses the stepping engine must cover.
//!
//! ## Branch forms
//!
//! | Form | Opcode | Fields | Target |
//! |------|--------|--------|--------|
//! | I    | 18     | LI, AA, LK | `sext(LI << 2)` (+ pc when AA = 0) |
//! | B    | 16     | BO, BI, BD, AA, LK | `sext(BD << 2)` (+ pc when AA = 0) |
//! | XL   | 19/16  | BO, BI, LK | link register (`bclr`, `blr`) |
//! | XL   | 19/528 | BO, BI, LK | count register (`bcctr`, `bctr`) |
//!
//! ## BO field
//!
//! - `0x10`: ignore the condition register bit
//! - `0x08`: branch when the condition register bit is set (otherwise clear)
//! - `0x04`: do not decrement/test the count register
//! - `0x02`: branch when the decremented count register is zero (otherwise non-zero)
//!
//! `bcctr` never decrements the count register regardless of BO.

use smallvec::SmallVec;

use crate::types::{GuestAddress, GuestContext};

/// Primary opcode of `b`/`ba`/`bl`/`bla`.
pub const OPCODE_BRANCH: u32 = 18;
/// Primary opcode of `bc` and its variants.
pub const OPCODE_BRANCH_CONDITIONAL: u32 = 16;
/// Primary opcode of the XL-form group (`bclr`, `bcctr`, `isync`, ...).
pub const OPCODE_XL: u32 = 19;
/// Extended opcode of `bclr` within the XL group.
pub const XO_BCLR: u32 = 16;
/// Extended opcode of `bcctr` within the XL group.
pub const XO_BCCTR: u32 = 528;
/// Extended opcode of `isync` within the XL group.
pub const XO_ISYNC: u32 = 150;

/// `blr`
pub const BLR: u32 = 0x4E80_0020;
/// `bctr`
pub const BCTR: u32 = 0x4E80_0420;
/// `sync`
pub const SYNC: u32 = 0x7C00_04AC;
/// `isync`
pub const ISYNC: u32 = 0x4C00_012C;
/// `eieio`
pub const EIEIO: u32 = 0x7C00_06AC;
/// `nop` (`ori r0, r0, 0`)
pub const NOP: u32 = 0x6000_0000;

const BO_IGNORE_CONDITION: u32 = 0x10;
const BO_CONDITION_TRUE: u32 = 0x08;
const BO_IGNORE_COUNT: u32 = 0x04;
const BO_COUNT_ZERO: u32 = 0x02;

/// Where a branch goes when taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind
{
    /// I-form: always taken, target encoded in the instruction.
    Immediate
    {
        /// Absolute target
        target: GuestAddress,
    },
    /// B-form: target encoded in the instruction, taken when BO/BI allow.
    Conditional
    {
        /// BO field
        bo: u32,
        /// BI field
        bi: u32,
        /// Absolute target
        target: GuestAddress,
    },
    /// XL-form `bclr`: target is the link register.
    ToLink
    {
        /// BO field
        bo: u32,
        /// BI field
        bi: u32,
    },
    /// XL-form `bcctr`: target is the count register.
    ToCount
    {
        /// BO field
        bo: u32,
        /// BI field
        bi: u32,
    },
}

/// A decoded branch instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Branch
{
    /// Address of the branch itself.
    pub address: GuestAddress,
    /// Raw instruction word.
    pub word: u32,
    /// Branch form and operands.
    pub kind: BranchKind,
    /// LK bit: the branch writes the return address into the link register.
    pub link: bool,
}

/// Classification of an instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction
{
    /// Any branch form.
    Branch(Branch),
    /// Anything else; execution falls through to the next word.
    Other
    {
        /// Primary opcode
        opcode: u32,
        /// Raw word
        word: u32,
    },
}

impl Instruction
{
    /// Returns the branch, if this is one.
    pub const fn as_branch(&self) -> Option<&Branch>
    {
        match self {
            Self::Branch(branch) => Some(branch),
            Self::Other { .. } => None,
        }
    }
}

/// Primary opcode of a word (top six bits).
pub const fn primary_opcode(word: u32) -> u32
{
    word >> 26
}

/// Extended opcode of an X/XL-form word (bits 21..30).
pub const fn extended_opcode(word: u32) -> u32
{
    (word >> 1) & 0x3FF
}

#[allow(clippy::cast_possible_wrap)]
const fn sign_extend(value: u32, bits: u32) -> i32
{
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// Decode the instruction `word` located at `address`.
///
/// ## Example
///
/// ```rust
/// use xedbg_core::ppc::{decode, BranchKind, Instruction};
/// use xedbg_core::types::GuestAddress;
///
/// // b +0x10
/// let insn = decode(GuestAddress::new(0x8200_0000), 0x4800_0010);
/// let Instruction::Branch(branch) = insn else { panic!("not a branch") };
/// assert_eq!(branch.kind, BranchKind::Immediate { target: GuestAddress::new(0x8200_0010) });
/// ```
pub fn decode(address: GuestAddress, word: u32) -> Instruction
{
    let opcode = primary_opcode(word);
    let absolute = word & 0x2 != 0;
    let link = word & 0x1 != 0;
    let bo = (word >> 21) & 0x1F;
    let bi = (word >> 16) & 0x1F;

    let kind = match opcode {
        OPCODE_BRANCH => {
            let displacement = sign_extend(word & 0x03FF_FFFC, 26);
            let target = if absolute {
                GuestAddress::ZERO.offset(displacement)
            } else {
                address.offset(displacement)
            };
            BranchKind::Immediate { target }
        }
        OPCODE_BRANCH_CONDITIONAL => {
            let displacement = sign_extend(word & 0xFFFC, 16);
            let target = if absolute {
                GuestAddress::ZERO.offset(displacement)
            } else {
                address.offset(displacement)
            };
            BranchKind::Conditional { bo, bi, target }
        }
        OPCODE_XL => match extended_opcode(word) {
            XO_BCLR => BranchKind::ToLink { bo, bi },
            XO_BCCTR => BranchKind::ToCount { bo, bi },
            _ => return Instruction::Other { opcode, word },
        },
        _ => return Instruction::Other { opcode, word },
    };

    Instruction::Branch(Branch {
        address,
        word,
        kind,
        link,
    })
}

/// Whether the word is one of the storage/context synchronizing instructions.
pub const fn is_synchronizing_instruction(word: u32) -> bool
{
    matches!(word, SYNC | ISYNC | EIEIO)
}

impl Branch
{
    fn fields(&self) -> Option<(u32, u32)>
    {
        match self.kind {
            BranchKind::Immediate { .. } => None,
            BranchKind::Conditional { bo, bi, .. } | BranchKind::ToLink { bo, bi } | BranchKind::ToCount { bo, bi } => {
                Some((bo, bi))
            }
        }
    }

    /// Whether executing the branch decrements the count register.
    pub fn decrements_count(&self) -> bool
    {
        match self.kind {
            BranchKind::Immediate { .. } | BranchKind::ToCount { .. } => false,
            BranchKind::Conditional { bo, .. } | BranchKind::ToLink { bo, .. } => bo & BO_IGNORE_COUNT == 0,
        }
    }

    /// Whether the branch is taken regardless of register state.
    pub fn is_unconditional(&self) -> bool
    {
        match self.fields() {
            None => true,
            Some((bo, _)) => bo & BO_IGNORE_CONDITION != 0 && !self.decrements_count(),
        }
    }

    /// Whether the target comes from a register rather than the encoding.
    pub const fn is_indirect(&self) -> bool
    {
        matches!(self.kind, BranchKind::ToLink { .. } | BranchKind::ToCount { .. })
    }

    /// Evaluate the branch condition against `ctx` as it is before the branch executes.
    pub fn is_taken(&self, ctx: &GuestContext) -> bool
    {
        let Some((bo, bi)) = self.fields() else {
            return true;
        };

        #[allow(clippy::cast_possible_truncation)]
        let count_ok = if self.decrements_count() {
            let decremented = (ctx.ctr as u32).wrapping_sub(1);
            if bo & BO_COUNT_ZERO != 0 {
                decremented == 0
            } else {
                decremented != 0
            }
        } else {
            true
        };

        let condition_ok = if bo & BO_IGNORE_CONDITION != 0 {
            true
        } else {
            ctx.cr_bit(bi) == (bo & BO_CONDITION_TRUE != 0)
        };

        count_ok && condition_ok
    }

    /// Target of the branch when taken.
    ///
    /// Register targets are the raw values of LR or CTR in `ctx`.
    pub fn target(&self, ctx: &GuestContext) -> GuestAddress
    {
        match self.kind {
            BranchKind::Immediate { target } | BranchKind::Conditional { target, .. } => target,
            BranchKind::ToLink { .. } => ctx.link_target(),
            BranchKind::ToCount { .. } => ctx.count_target(),
        }
    }

    /// Target encoded in the instruction, `None` for register branches.
    pub const fn static_target(&self) -> Option<GuestAddress>
    {
        match self.kind {
            BranchKind::Immediate { target } | BranchKind::Conditional { target, .. } => Some(target),
            BranchKind::ToLink { .. } | BranchKind::ToCount { .. } => None,
        }
    }

    /// Address of the next instruction when the branch is not taken.
    pub const fn fallthrough(&self) -> GuestAddress
    {
        self.address.next_instruction()
    }

    /// Address execution continues at after this branch, given `ctx`.
    pub fn next_pc(&self, ctx: &GuestContext) -> GuestAddress
    {
        if self.is_taken(ctx) {
            self.target(ctx)
        } else {
            self.fallthrough()
        }
    }

    /// Every address the branch can reach, taken target first.
    ///
    /// Unconditional branches have exactly one successor. Conditional branches
    /// have two unless the target happens to be the fallthrough.
    pub fn successors(&self, ctx: &GuestContext) -> SmallVec<[GuestAddress; 2]>
    {
        let mut out = SmallVec::new();
        let target = self.target(ctx);
        out.push(target);
        if !self.is_unconditional() && target != self.fallthrough() {
            out.push(self.fallthrough());
        }
        out
    }

    /// Simplified mnemonic for display.
    pub fn mnemonic(&self) -> String
    {
        let absolute = self.word & 0x2 != 0;
        let base = match self.kind {
            BranchKind::Immediate { .. } => "b",
            BranchKind::Conditional { .. } => "bc",
            BranchKind::ToLink { .. } if self.is_unconditional() => "blr",
            BranchKind::ToLink { .. } => "bclr",
            BranchKind::ToCount { .. } if self.is_unconditional() => "bctr",
            BranchKind::ToCount { .. } => "bcctr",
        };
        let mut mnemonic = base.to_string();
        if self.link {
            mnemonic.push('l');
        }
        if absolute && !self.is_indirect() {
            mnemonic.push('a');
        }
        mnemonic
    }
}

/// Predict the guest program counter after executing `word` at `address`.
///
/// Non-branch instructions always continue at `address + 4`.
pub fn next_guest_pc(address: GuestAddress, word: u32, ctx: &GuestContext) -> GuestAddress
{
    match decode(address, word) {
        Instruction::Branch(branch) => branch.next_pc(ctx),
        Instruction::Other { .. } => address.next_instruction(),
    }
}

/// Encoders for the handful of instructions test programs and the in-memory
/// machine need.
pub mod encode
{
    use crate::types::GuestAddress;

    #[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
    fn displacement(from: GuestAddress, to: GuestAddress) -> u32
    {
        (to.value().wrapping_sub(from.value()) as i32) as u32
    }

    /// `b`/`bl` from `from` to `to`.
    pub fn b(from: GuestAddress, to: GuestAddress, link: bool) -> u32
    {
        (super::OPCODE_BRANCH << 26) | (displacement(from, to) & 0x03FF_FFFC) | u32::from(link)
    }

    /// `bc bo, bi, to` located at `from`.
    pub fn bc(bo: u32, bi: u32, from: GuestAddress, to: GuestAddress) -> u32
    {
        (super::OPCODE_BRANCH_CONDITIONAL << 26)
            | ((bo & 0x1F) << 21)
            | ((bi & 0x1F) << 16)
            | (displacement(from, to) & 0xFFFC)
    }

    /// `bclr bo, bi`
    pub const fn bclr(bo: u32, bi: u32) -> u32
    {
        (super::OPCODE_XL << 26) | ((bo & 0x1F) << 21) | ((bi & 0x1F) << 16) | (super::XO_BCLR << 1)
    }

    /// `bcctr bo, bi`
    pub const fn bcctr(bo: u32, bi: u32) -> u32
    {
        (super::OPCODE_XL << 26) | ((bo & 0x1F) << 21) | ((bi & 0x1F) << 16) | (super::XO_BCCTR << 1)
    }

    /// `addi rt, ra, simm` (`li rt, simm` when `ra` is 0)
    #[allow(clippy::cast_sign_loss)]
    pub const fn addi(rt: u32, ra: u32, simm: i16) -> u32
    {
        (14 << 26) | ((rt & 0x1F) << 21) | ((ra & 0x1F) << 16) | (simm as u16 as u32)
    }

    /// `cmpwi crf, ra, simm`
    #[allow(clippy::cast_sign_loss)]
    pub const fn cmpwi(crf: u32, ra: u32, simm: i16) -> u32
    {
        (11 << 26) | ((crf & 0x7) << 23) | ((ra & 0x1F) << 16) | (simm as u16 as u32)
    }

    const fn spr_field(spr: u32) -> u32
    {
        ((spr & 0x1F) << 16) | (((spr >> 5) & 0x1F) << 11)
    }

    /// `mtlr rs`
    pub const fn mtlr(rs: u32) -> u32
    {
        (31 << 26) | ((rs & 0x1F) << 21) | spr_field(8) | (467 << 1)
    }

    /// `mtctr rs`
    pub const fn mtctr(rs: u32) -> u32
    {
        (31 << 26) | ((rs & 0x1F) << 21) | spr_field(9) | (467 << 1)
    }

    /// `mflr rt`
    pub const fn mflr(rt: u32) -> u32
    {
        (31 << 26) | ((rt & 0x1F) << 21) | spr_field(8) | (339 << 1)
    }
}
