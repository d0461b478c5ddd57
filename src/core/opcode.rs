//! The Ngaro instruction set.
//!
//! Opcodes 0 through 30 are the base set shared by every Retro image. The
//! extended set (explicit CALL plus float arithmetic, conversions and
//! comparison jumps) is only dispatched when the instance was configured
//! with `extended_ops`; otherwise those cell values keep their base-set
//! meaning of "call this address".
//!
//! Mnemonics follow the reference assembler; the engine never looks at
//! them, only the assembler and the disassembler do.

use std::str::FromStr;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum_macros::{Display as StrumDisplay, EnumString};

use super::cell::Cell;

/// Opcodes of the virtual machine. The discriminant is the value stored in
/// a memory cell; the order below is binary compatibility, do not reorder.
#[derive(
    StrumDisplay, EnumString, TryFromPrimitive, IntoPrimitive,
    Clone, Copy, Eq, PartialEq, Debug, Hash,
)]
#[repr(u8)]
#[strum(serialize_all = "lowercase")]
pub enum Opcode {
    Nop = 0,
    Lit,
    Dup,
    Drop,
    Swap,
    Push,
    Pop,
    Loop,
    Jump,
    #[strum(serialize = ";")]
    Return,
    #[strum(serialize = ">jump")]
    GtJump,
    #[strum(serialize = "<jump")]
    LtJump,
    #[strum(serialize = "!jump")]
    NeJump,
    #[strum(serialize = "=jump")]
    EqJump,
    #[strum(serialize = "@")]
    Fetch,
    #[strum(serialize = "!")]
    Store,
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "/mod")]
    Dimod,
    And,
    Or,
    Xor,
    #[strum(serialize = "<<")]
    Shl,
    #[strum(serialize = ">>")]
    Shr,
    #[strum(serialize = "0;")]
    ZeroExit,
    #[strum(serialize = "1+")]
    Inc,
    #[strum(serialize = "1-")]
    Dec,
    In,
    Out,
    Wait,

    // Extended set, gated behind VmConfig::extended_ops.
    Call,
    #[strum(serialize = "f+")]
    FAdd,
    #[strum(serialize = "f-")]
    FSub,
    #[strum(serialize = "f*")]
    FMul,
    #[strum(serialize = "f/")]
    FDiv,
    #[strum(serialize = ">f")]
    Itof,
    #[strum(serialize = "f>")]
    Ftoi,
    #[strum(serialize = "f>jump")]
    FGtJump,
    #[strum(serialize = "f<jump")]
    FLtJump,
    #[strum(serialize = "f!jump")]
    FNeJump,
    #[strum(serialize = "f=jump")]
    FEqJump,
}

impl Opcode {
    /// The cell value that encodes this opcode.
    #[inline]
    pub fn code(self) -> Cell {
        u8::from(self) as Cell
    }

    /// Decode a cell into an opcode. Returns `None` for every cell value
    /// that is not a known opcode (such values are call targets).
    #[inline]
    pub fn from_cell(c: Cell) -> Option<Opcode> {
        u8::try_from(c).ok().and_then(|b| Opcode::try_from(b).ok())
    }

    /// Look up an assembler mnemonic.
    pub fn from_mnemonic(s: &str) -> Option<Opcode> {
        Opcode::from_str(s).ok()
    }

    /// True for opcodes past the base set of the specification.
    #[inline]
    pub fn is_extended(self) -> bool {
        self.code() > Opcode::Wait.code()
    }

    /// True when the opcode reads an inline operand from the next cell.
    pub fn has_operand(self) -> bool {
        matches!(
            self,
            Opcode::Lit
                | Opcode::Loop
                | Opcode::Jump
                | Opcode::GtJump
                | Opcode::LtJump
                | Opcode::NeJump
                | Opcode::EqJump
                | Opcode::Call
                | Opcode::FGtJump
                | Opcode::FLtJump
                | Opcode::FNeJump
                | Opcode::FEqJump
        )
    }
}
