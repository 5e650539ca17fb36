//! AArch64 instruction operands.
//!
//! The constructors here reject operands no AArch64 instruction could encode. Whether a given
//! instruction can encode a well-formed operand (e.g. an offset's alignment for a particular
//! access width) is checked when the instruction is pushed to the assembler.

use super::{asm::LabelIdx, reg::Reg};
use std::{ffi::c_void, fmt, str::FromStr};

/// The most negative load/store offset: the unscaled (`ldur`/`stur`) form's lower bound.
pub const MIN_MEM_OFF: i32 = -256;
/// The most positive load/store offset: the largest 8-byte aligned unsigned scaled offset.
pub const MAX_MEM_OFF: i32 = 4095 * 8;
/// The largest absolute offset of a scaled-index-base operand: it must fit `add`'s `imm12`.
pub const MAX_SIB_OFF: i32 = 4095;

/// A memory operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mem {
    /// `[base, #off]`
    BaseOff { base: Reg, off: i32 },
    /// `[base + index * scale + off]`
    Sib {
        base: Reg,
        index: Reg,
        scale: u8,
        off: i32,
    },
    /// `[base, #off]!`: `base` is updated before the access.
    PreIndex { base: Reg, off: i32 },
    /// `[base], #off`: `base` is updated after the access.
    PostIndex { base: Reg, off: i32 },
}

impl Mem {
    pub fn base(&self) -> Reg {
        match self {
            Mem::BaseOff { base, .. }
            | Mem::Sib { base, .. }
            | Mem::PreIndex { base, .. }
            | Mem::PostIndex { base, .. } => *base,
        }
    }
}

/// An instruction operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Imm(i64),
    /// A raw machine address. Unlike [Operand::Imm], moving one into a register always takes the
    /// same number of instructions.
    ImmPtr(usize),
    Mem(Mem),
    Label(LabelIdx),
}

pub fn imm(v: i64) -> Operand {
    Operand::Imm(v)
}

pub fn imm_ptr(p: *const c_void) -> Operand {
    Operand::ImmPtr(p.addr())
}

/// The register named `name`.
///
/// # Panics
///
/// If there is no such register.
pub fn reg(name: &str) -> Operand {
    match Reg::from_str(name) {
        Ok(r) => Operand::Reg(r),
        Err(_) => panic!("Unknown AArch64 register '{name}'"),
    }
}

fn check_base(base: Reg) {
    if base.is_float() || base == Reg::Xzr {
        panic!("{base} can't be used as a base register");
    }
}

/// `[base, #off]`.
///
/// # Panics
///
/// If `off` is outside `MIN_MEM_OFF..=MAX_MEM_OFF` or `base` isn't a general purpose register.
pub fn ptr(base: Reg, off: i32) -> Operand {
    check_base(base);
    if !(MIN_MEM_OFF..=MAX_MEM_OFF).contains(&off) {
        panic!("Memory offset {off} is out of range");
    }
    Operand::Mem(Mem::BaseOff { base, off })
}

/// `[base + index * scale + off]`.
///
/// # Panics
///
/// If `scale` isn't 1, 2, 4, or 8, if `|off| > MAX_SIB_OFF`, or if the registers aren't usable.
pub fn sib(base: Reg, index: Reg, scale: u8, off: i32) -> Operand {
    check_base(base);
    if !index.is_gp() || index == Reg::Sp {
        panic!("{index} can't be used as an index register");
    }
    if !matches!(scale, 1 | 2 | 4 | 8) {
        panic!("Invalid scale {scale}");
    }
    if off.unsigned_abs() > MAX_SIB_OFF.unsigned_abs() {
        panic!("Scaled-index-base offset {off} is out of range");
    }
    Operand::Mem(Mem::Sib {
        base,
        index,
        scale,
        off,
    })
}

/// `[base, #off]!`. Single register accesses take offsets in -256..=255; pair accesses take
/// multiples of 8 in -512..=504.
pub fn pre(base: Reg, off: i32) -> Operand {
    check_base(base);
    if !(-512..=504).contains(&off) {
        panic!("Pre-index offset {off} is out of range");
    }
    Operand::Mem(Mem::PreIndex { base, off })
}

/// `[base], #off`. See [pre] for the offset ranges.
pub fn post(base: Reg, off: i32) -> Operand {
    check_base(base);
    if !(-512..=504).contains(&off) {
        panic!("Post-index offset {off} is out of range");
    }
    Operand::Mem(Mem::PostIndex { base, off })
}

pub fn label(l: LabelIdx) -> Operand {
    Operand::Label(l)
}

impl From<Reg> for Operand {
    fn from(r: Reg) -> Self {
        Operand::Reg(r)
    }
}

impl fmt::Display for Mem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mem::BaseOff { base, off: 0 } => write!(f, "[{base}]"),
            Mem::BaseOff { base, off } => write!(f, "[{base}, #{off}]"),
            Mem::Sib {
                base,
                index,
                scale,
                off,
            } => {
                write!(f, "[{base}, {index}")?;
                if *scale != 1 {
                    write!(f, ", lsl #{}", scale.trailing_zeros())?;
                }
                if *off != 0 {
                    write!(f, ", #{off}")?;
                }
                write!(f, "]")
            }
            Mem::PreIndex { base, off } => write!(f, "[{base}, #{off}]!"),
            Mem::PostIndex { base, off } => write!(f, "[{base}], #{off}"),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{r}"),
            Operand::Imm(v) => write!(f, "#{v}"),
            Operand::ImmPtr(p) => write!(f, "#0x{p:x}"),
            Operand::Mem(m) => write!(f, "{m}"),
            Operand::Label(l) => write!(f, "l{}", l.index()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct() {
        assert_eq!(reg("x3"), Operand::Reg(Reg::X3));
        assert_eq!(imm(-5), Operand::Imm(-5));
        assert_eq!(imm_ptr(0x1234 as *const c_void), Operand::ImmPtr(0x1234));
        assert_eq!(
            ptr(Reg::X29, 16),
            Operand::Mem(Mem::BaseOff {
                base: Reg::X29,
                off: 16
            })
        );
        assert_eq!(ptr(Reg::Sp, MIN_MEM_OFF).to_string(), "[sp, #-256]");
        assert_eq!(ptr(Reg::X0, 0).to_string(), "[x0]");
        assert_eq!(sib(Reg::X1, Reg::X2, 8, 0).to_string(), "[x1, x2, lsl #3]");
        assert_eq!(sib(Reg::X1, Reg::X2, 1, -8).to_string(), "[x1, x2, #-8]");
        assert_eq!(pre(Reg::Sp, -16).to_string(), "[sp, #-16]!");
        assert_eq!(post(Reg::Sp, 16).to_string(), "[sp], #16");
        assert_eq!(imm_ptr(0xbeef as *const c_void).to_string(), "#0xbeef");
    }

    #[test]
    #[should_panic(expected = "Unknown AArch64 register 'x32'")]
    fn unknown_reg() {
        reg("x32");
    }

    #[test]
    #[should_panic(expected = "Invalid scale 3")]
    fn bad_scale() {
        sib(Reg::X0, Reg::X1, 3, 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn bad_sib_off() {
        sib(Reg::X0, Reg::X1, 1, 4096);
    }

    #[test]
    #[should_panic(expected = "Scaled-index-base offset -2147483648 is out of range")]
    fn min_sib_off() {
        sib(Reg::X0, Reg::X1, 1, i32::MIN);
    }

    #[test]
    fn sib_off_limits() {
        sib(Reg::X0, Reg::X1, 1, MAX_SIB_OFF);
        sib(Reg::X0, Reg::X1, 1, -MAX_SIB_OFF);
    }

    #[test]
    #[should_panic(expected = "Memory offset -264 is out of range")]
    fn bad_ptr_off() {
        ptr(Reg::X0, -264);
    }

    #[test]
    #[should_panic(expected = "Memory offset 32768 is out of range")]
    fn bad_ptr_off_hi() {
        ptr(Reg::X0, 32768);
    }

    #[test]
    #[should_panic(expected = "can't be used as a base register")]
    fn float_base() {
        ptr(Reg::V0, 0);
    }
}
