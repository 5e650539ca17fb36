//! The AArch64 assembler.
//!
//! Users push an [Op] with [Operand]s; the assembler validates the operands and lowers the
//! combination to one or more [Inst]s, each of which is exactly one 32-bit machine word. Some ops
//! are pseudo-ops: for example `mov x0, #imm` becomes a `movz`/`movk` sequence, and an `add` with
//! an immediate too big for `imm12` goes via the assembler temporary [TMP].
//!
//! Branches to labels are resolved by [Asm::assemble].

use super::{
    operand::{Mem, Operand},
    reg::Reg,
};
use crate::compile::CompilationError;
use index_vec::IndexVec;
use std::{fmt, str::FromStr};
use strum::{Display, EnumString};

/// The assembler temporary. It is clobbered by some pseudo-ops, so must never be used to hold
/// values across an [Asm::push].
pub const TMP: Reg = Reg::X17;

index_vec::define_index_type! {
    pub struct LabelIdx = u32;
}

/// The mnemonics the backend uses.
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Op {
    Mov,
    Movz,
    Movk,
    Add,
    Sub,
    Cmp,
    And,
    Orr,
    Eor,
    Ldr,
    Str,
    Ldrw,
    Strw,
    Ldrb,
    Strb,
    Ldp,
    Stp,
    Fldrs,
    Fldrd,
    Fstrs,
    Fstrd,
    Fmov,
    B,
    #[strum(serialize = "b.eq")]
    BEq,
    #[strum(serialize = "b.ne")]
    BNe,
    #[strum(serialize = "b.hs")]
    BHs,
    #[strum(serialize = "b.lo")]
    BLo,
    #[strum(serialize = "b.mi")]
    BMi,
    #[strum(serialize = "b.pl")]
    BPl,
    #[strum(serialize = "b.hi")]
    BHi,
    #[strum(serialize = "b.ls")]
    BLs,
    #[strum(serialize = "b.ge")]
    BGe,
    #[strum(serialize = "b.lt")]
    BLt,
    #[strum(serialize = "b.gt")]
    BGt,
    #[strum(serialize = "b.le")]
    BLe,
    Bl,
    Blr,
    Br,
    Cbz,
    Cbnz,
    Ret,
    Nop,
}

impl Op {
    /// If this is a conditional branch, return its condition.
    pub fn cond(self) -> Option<Cond> {
        Some(match self {
            Op::BEq => Cond::Eq,
            Op::BNe => Cond::Ne,
            Op::BHs => Cond::Hs,
            Op::BLo => Cond::Lo,
            Op::BMi => Cond::Mi,
            Op::BPl => Cond::Pl,
            Op::BHi => Cond::Hi,
            Op::BLs => Cond::Ls,
            Op::BGe => Cond::Ge,
            Op::BLt => Cond::Lt,
            Op::BGt => Cond::Gt,
            Op::BLe => Cond::Le,
            _ => return None,
        })
    }
}

/// Resolve `mnemonic` (case insensitively) to an [Op].
///
/// # Panics
///
/// If `mnemonic` isn't part of the backend's vocabulary.
pub fn as_op(mnemonic: &str) -> Op {
    match Op::from_str(mnemonic) {
        Ok(op) => op,
        Err(_) => panic!("Unknown AArch64 mnemonic '{mnemonic}'"),
    }
}

/// A condition code.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum Cond {
    Eq = 0,
    Ne = 1,
    Hs = 2,
    Lo = 3,
    Mi = 4,
    Pl = 5,
    Hi = 8,
    Ls = 9,
    Ge = 10,
    Lt = 11,
    Gt = 12,
    Le = 13,
}

/// The width of a single register load or store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Width {
    /// 64-bit general purpose.
    X,
    /// 32-bit general purpose.
    W,
    /// 8-bit general purpose.
    B,
    /// 32-bit float.
    S,
    /// 64-bit float.
    D,
}

impl Width {
    pub fn size(self) -> i32 {
        match self {
            Width::X | Width::D => 8,
            Width::W | Width::S => 4,
            Width::B => 1,
        }
    }

    fn is_float(self) -> bool {
        matches!(self, Width::S | Width::D)
    }

    /// The base encodings of the `(unsigned offset, unscaled offset, register offset)` store
    /// forms. Setting bit 22 turns each into the corresponding load.
    fn bases(self) -> (u32, u32, u32) {
        match self {
            Width::X => (0xF9000000, 0xF8000000, 0xF8206800),
            Width::W => (0xB9000000, 0xB8000000, 0xB8206800),
            Width::B => (0x39000000, 0x38000000, 0x38206800),
            Width::S => (0xBD000000, 0xBC000000, 0xBC206800),
            Width::D => (0xFD000000, 0xFC000000, 0xFC206800),
        }
    }

    fn reg_name(self, r: Reg) -> String {
        match self {
            Width::X => r.to_string(),
            Width::W | Width::B => format!("w{}", r.num()),
            Width::S => r.s_name(),
            Width::D => r.d_name(),
        }
    }
}

/// How a single register load or store addresses memory relative to its base register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddrMode {
    /// A non-negative byte offset which is a multiple of the access size.
    UImm(i32),
    /// A byte offset in -256..=255.
    Unscaled(i32),
    /// `base + index`, with `index` shifted by the access size if `shift` is true.
    RegOff { index: Reg, shift: bool },
    Pre(i32),
    Post(i32),
}

/// How a pair load or store addresses memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairMode {
    Offset,
    Pre,
    Post,
}

/// The data-processing ops with a shifted register form.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum AluOp {
    Add,
    Sub,
    And,
    Orr,
    Eor,
}

/// A single AArch64 machine instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inst {
    /// `add`/`sub` with `imm12`, optionally shifted left by 12. `rd` and `rn` may be `sp`.
    AddSubImm {
        sub: bool,
        rd: Reg,
        rn: Reg,
        imm12: u32,
        lsl12: bool,
    },
    /// `add`/`sub` with an extended (`uxtx`) register. `rd` and `rn` may be `sp`.
    AddSubExt { sub: bool, rd: Reg, rn: Reg, rm: Reg },
    /// Shifted register data processing. Register 31 is `xzr`.
    Alu { op: AluOp, rd: Reg, rn: Reg, rm: Reg },
    CmpReg { rn: Reg, rm: Reg },
    /// `cmp` with an extended (`uxtx`) register. `rn` may be `sp`.
    CmpExt { rn: Reg, rm: Reg },
    CmpImm { rn: Reg, imm12: u32 },
    Movz { rd: Reg, imm16: u32, hw: u32 },
    Movk { rd: Reg, imm16: u32, hw: u32 },
    Ldst {
        load: bool,
        width: Width,
        rt: Reg,
        base: Reg,
        mode: AddrMode,
    },
    Pair {
        load: bool,
        rt: Reg,
        rt2: Reg,
        base: Reg,
        off: i32,
        mode: PairMode,
    },
    /// Float register to float register.
    Fmov { rd: Reg, rn: Reg, single: bool },
    /// General purpose register to float register.
    FmovToFp { rd: Reg, rn: Reg },
    /// Float register to general purpose register.
    FmovFromFp { rd: Reg, rn: Reg },
    B(LabelIdx),
    BCond(Cond, LabelIdx),
    Bl(LabelIdx),
    Cbz { nz: bool, rt: Reg, target: LabelIdx },
    Blr(Reg),
    Br(Reg),
    Ret,
    Nop,
}

impl Inst {
    /// Encode this instruction, which is at instruction index `pos`.
    fn encode(
        &self,
        pos: usize,
        labels: &IndexVec<LabelIdx, Option<usize>>,
    ) -> Result<u32, CompilationError> {
        // Return the word delta from `pos` to `l`, checking that it fits in `bits` signed bits.
        let delta = |l: LabelIdx, bits: u32| -> Result<u32, CompilationError> {
            let target = labels[l].ok_or_else(|| {
                CompilationError::InternalError(format!("Label l{} never attached", l.index()))
            })?;
            let d = i64::try_from(target).unwrap() - i64::try_from(pos).unwrap();
            let lim = 1i64 << (bits - 1);
            if d < -lim || d >= lim {
                return Err(CompilationError::LimitExceeded(format!(
                    "Branch to l{} spans {d} instructions",
                    l.index()
                )));
            }
            Ok(u32::try_from(d & ((1 << bits) - 1)).unwrap())
        };

        Ok(match *self {
            Inst::AddSubImm {
                sub,
                rd,
                rn,
                imm12,
                lsl12,
            } => {
                let base = if sub { 0xD1000000 } else { 0x91000000 };
                base | u32::from(lsl12) << 22 | imm12 << 10 | rn.num() << 5 | rd.num()
            }
            Inst::AddSubExt { sub, rd, rn, rm } => {
                let base = if sub { 0xCB206000 } else { 0x8B206000 };
                base | rm.num() << 16 | rn.num() << 5 | rd.num()
            }
            Inst::Alu { op, rd, rn, rm } => {
                let base = match op {
                    AluOp::Add => 0x8B000000,
                    AluOp::Sub => 0xCB000000,
                    AluOp::And => 0x8A000000,
                    AluOp::Orr => 0xAA000000,
                    AluOp::Eor => 0xCA000000,
                };
                base | rm.num() << 16 | rn.num() << 5 | rd.num()
            }
            Inst::CmpReg { rn, rm } => 0xEB00001F | rm.num() << 16 | rn.num() << 5,
            Inst::CmpExt { rn, rm } => 0xEB20601F | rm.num() << 16 | rn.num() << 5,
            Inst::CmpImm { rn, imm12 } => 0xF100001F | imm12 << 10 | rn.num() << 5,
            Inst::Movz { rd, imm16, hw } => 0xD2800000 | hw << 21 | imm16 << 5 | rd.num(),
            Inst::Movk { rd, imm16, hw } => 0xF2800000 | hw << 21 | imm16 << 5 | rd.num(),
            Inst::Ldst {
                load,
                width,
                rt,
                base,
                mode,
            } => {
                let (uimm, unscaled, regoff) = width.bases();
                let ld = u32::from(load) << 22;
                let imm9 = |off: i32| u32::try_from(off & 0x1FF).unwrap() << 12;
                let w = match mode {
                    AddrMode::UImm(off) => uimm | u32::try_from(off / width.size()).unwrap() << 10,
                    AddrMode::Unscaled(off) => unscaled | imm9(off),
                    AddrMode::Pre(off) => unscaled | imm9(off) | 0xC00,
                    AddrMode::Post(off) => unscaled | imm9(off) | 0x400,
                    AddrMode::RegOff { index, shift } => {
                        regoff | index.num() << 16 | u32::from(shift) << 12
                    }
                };
                w | ld | base.num() << 5 | rt.num()
            }
            Inst::Pair {
                load,
                rt,
                rt2,
                base,
                off,
                mode,
            } => {
                let w = match (rt.is_float(), mode) {
                    (false, PairMode::Offset) => 0xA9000000,
                    (false, PairMode::Pre) => 0xA9800000,
                    (false, PairMode::Post) => 0xA8800000,
                    (true, PairMode::Offset) => 0x6D000000,
                    (true, PairMode::Pre) => 0x6D800000,
                    (true, PairMode::Post) => 0x6C800000,
                };
                let imm7 = u32::try_from((off / 8) & 0x7F).unwrap();
                w | u32::from(load) << 22
                    | imm7 << 15
                    | rt2.num() << 10
                    | base.num() << 5
                    | rt.num()
            }
            Inst::Fmov { rd, rn, single } => {
                let base = if single { 0x1E204000 } else { 0x1E604000 };
                base | rn.num() << 5 | rd.num()
            }
            Inst::FmovToFp { rd, rn } => 0x9E670000 | rn.num() << 5 | rd.num(),
            Inst::FmovFromFp { rd, rn } => 0x9E660000 | rn.num() << 5 | rd.num(),
            Inst::B(l) => 0x14000000 | delta(l, 26)?,
            Inst::Bl(l) => 0x94000000 | delta(l, 26)?,
            Inst::BCond(cond, l) => 0x54000000 | delta(l, 19)? << 5 | cond as u32,
            Inst::Cbz { nz, rt, target } => {
                let base = if nz { 0xB5000000 } else { 0xB4000000 };
                base | delta(target, 19)? << 5 | rt.num()
            }
            Inst::Blr(rn) => 0xD63F0000 | rn.num() << 5,
            Inst::Br(rn) => 0xD61F0000 | rn.num() << 5,
            Inst::Ret => 0xD65F03C0,
            Inst::Nop => 0xD503201F,
        })
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let l = |l: &LabelIdx| format!("l{}", l.index());
        match self {
            Inst::AddSubImm {
                sub: false,
                rd,
                rn,
                imm12: 0,
                lsl12: false,
            } if *rd == Reg::Sp || *rn == Reg::Sp => write!(f, "mov {rd}, {rn}"),
            Inst::AddSubImm {
                sub,
                rd,
                rn,
                imm12,
                lsl12,
            } => {
                let op = if *sub { "sub" } else { "add" };
                write!(f, "{op} {rd}, {rn}, #{imm12}")?;
                if *lsl12 {
                    write!(f, ", lsl #12")?;
                }
                Ok(())
            }
            Inst::AddSubExt { sub, rd, rn, rm } => {
                let op = if *sub { "sub" } else { "add" };
                write!(f, "{op} {rd}, {rn}, {rm}")
            }
            Inst::Alu {
                op: AluOp::Orr,
                rd,
                rn: Reg::Xzr,
                rm,
            } => write!(f, "mov {rd}, {rm}"),
            Inst::Alu { op, rd, rn, rm } => write!(f, "{op} {rd}, {rn}, {rm}"),
            Inst::CmpReg { rn, rm } | Inst::CmpExt { rn, rm } => write!(f, "cmp {rn}, {rm}"),
            Inst::CmpImm { rn, imm12 } => write!(f, "cmp {rn}, #{imm12}"),
            Inst::Movz { rd, imm16, hw } | Inst::Movk { rd, imm16, hw } => {
                let op = if matches!(self, Inst::Movz { .. }) {
                    "movz"
                } else {
                    "movk"
                };
                write!(f, "{op} {rd}, #0x{imm16:x}")?;
                if *hw != 0 {
                    write!(f, ", lsl #{}", hw * 16)?;
                }
                Ok(())
            }
            Inst::Ldst {
                load,
                width,
                rt,
                base,
                mode,
            } => {
                let unscaled = matches!(mode, AddrMode::Unscaled(_));
                let op = match (load, unscaled) {
                    (true, false) => "ldr",
                    (true, true) => "ldur",
                    (false, false) => "str",
                    (false, true) => "stur",
                };
                let suffix = if *width == Width::B { "b" } else { "" };
                write!(f, "{op}{suffix} {}, ", width.reg_name(*rt))?;
                match mode {
                    AddrMode::UImm(0) | AddrMode::Unscaled(0) => write!(f, "[{base}]"),
                    AddrMode::UImm(off) | AddrMode::Unscaled(off) => {
                        write!(f, "[{base}, #{off}]")
                    }
                    AddrMode::RegOff { index, shift } => {
                        write!(f, "[{base}, {index}")?;
                        if *shift {
                            write!(f, ", lsl #{}", width.size().trailing_zeros())?;
                        }
                        write!(f, "]")
                    }
                    AddrMode::Pre(off) => write!(f, "[{base}, #{off}]!"),
                    AddrMode::Post(off) => write!(f, "[{base}], #{off}"),
                }
            }
            Inst::Pair {
                load,
                rt,
                rt2,
                base,
                off,
                mode,
            } => {
                let op = if *load { "ldp" } else { "stp" };
                let (rt, rt2) = if rt.is_float() {
                    (rt.d_name(), rt2.d_name())
                } else {
                    (rt.to_string(), rt2.to_string())
                };
                match mode {
                    PairMode::Offset => write!(f, "{op} {rt}, {rt2}, [{base}, #{off}]"),
                    PairMode::Pre => write!(f, "{op} {rt}, {rt2}, [{base}, #{off}]!"),
                    PairMode::Post => write!(f, "{op} {rt}, {rt2}, [{base}], #{off}"),
                }
            }
            Inst::Fmov {
                rd,
                rn,
                single: true,
            } => write!(f, "fmov {}, {}", rd.s_name(), rn.s_name()),
            Inst::Fmov { rd, rn, .. } => write!(f, "fmov {}, {}", rd.d_name(), rn.d_name()),
            Inst::FmovToFp { rd, rn } => write!(f, "fmov {}, {rn}", rd.d_name()),
            Inst::FmovFromFp { rd, rn } => write!(f, "fmov {rd}, {}", rn.d_name()),
            Inst::B(t) => write!(f, "b {}", l(t)),
            Inst::BCond(c, t) => write!(f, "b.{c} {}", l(t)),
            Inst::Bl(t) => write!(f, "bl {}", l(t)),
            Inst::Cbz { nz, rt, target } => {
                write!(f, "{} {rt}, {}", if *nz { "cbnz" } else { "cbz" }, l(target))
            }
            Inst::Blr(r) => write!(f, "blr {r}"),
            Inst::Br(r) => write!(f, "br {r}"),
            Inst::Ret => write!(f, "ret"),
            Inst::Nop => write!(f, "nop"),
        }
    }
}

/// An in-progress sequence of AArch64 instructions.
#[derive(Debug, Default)]
pub struct Asm {
    insts: Vec<Inst>,
    /// The instruction index each label is attached to. New labels start as `None`.
    labels: IndexVec<LabelIdx, Option<usize>>,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new free-floating label: it is attached only when [Self::attach_label] is called.
    pub fn mk_label(&mut self) -> LabelIdx {
        self.labels.push(None)
    }

    /// Attach `l` to the next instruction pushed.
    ///
    /// # Panics
    ///
    /// If `l` is already attached.
    pub fn attach_label(&mut self, l: LabelIdx) {
        assert!(self.labels[l].is_none(), "Label l{} attached twice", l.index());
        self.labels[l] = Some(self.insts.len());
    }

    /// The instruction index `l` is attached to, if it has been attached.
    pub fn label_pos(&self, l: LabelIdx) -> Option<usize> {
        self.labels[l]
    }

    pub fn insts(&self) -> &[Inst] {
        &self.insts
    }

    /// How many bytes of code have been pushed so far?
    pub fn len(&self) -> usize {
        self.insts.len() * 4
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// Push `op` with operands `ops`, lowering it to machine instructions.
    ///
    /// # Panics
    ///
    /// If `ops` are not valid operands for `op`, or can't be encoded.
    pub fn push(&mut self, op: Op, ops: &[Operand]) {
        use Operand as O;
        match (op, ops) {
            (Op::Mov, [O::Reg(rd), O::Reg(rn)]) | (Op::Fmov, [O::Reg(rd), O::Reg(rn)]) => {
                self.mov_reg(op, *rd, *rn)
            }
            (Op::Mov, [O::Reg(rd), O::Imm(v)]) => self.mov_imm(*rd, *v as u64, false),
            (Op::Mov, [O::Reg(rd), O::ImmPtr(p)]) => self.mov_imm(*rd, *p as u64, true),
            (Op::Movz | Op::Movk, [O::Reg(rd), O::Imm(v)]) => self.movzk(op, *rd, *v, 0),
            (Op::Movz | Op::Movk, [O::Reg(rd), O::Imm(v), O::Imm(shift)]) => {
                self.movzk(op, *rd, *v, *shift)
            }
            (Op::Add | Op::Sub, [O::Reg(rd), O::Reg(rn), O::Reg(rm)]) => {
                self.add_sub_reg(op == Op::Sub, *rd, *rn, *rm)
            }
            (Op::Add | Op::Sub, [O::Reg(rd), O::Reg(rn), O::Imm(v)]) => {
                self.add_sub_imm(op == Op::Sub, *rd, *rn, *v)
            }
            (Op::And | Op::Orr | Op::Eor, [O::Reg(rd), O::Reg(rn), O::Reg(rm)]) => {
                let alu = match op {
                    Op::And => AluOp::And,
                    Op::Orr => AluOp::Orr,
                    _ => AluOp::Eor,
                };
                self.check_gp(op, &[*rd, *rn, *rm]);
                self.insts.push(Inst::Alu {
                    op: alu,
                    rd: *rd,
                    rn: *rn,
                    rm: *rm,
                });
            }
            (Op::Cmp, [O::Reg(Reg::Sp), O::Reg(rm)]) => {
                self.check_gp(op, &[*rm]);
                self.insts.push(Inst::CmpExt {
                    rn: Reg::Sp,
                    rm: *rm,
                });
            }
            (Op::Cmp, [O::Reg(rn), O::Reg(rm)]) => {
                self.check_gp(op, &[*rn, *rm]);
                self.insts.push(Inst::CmpReg { rn: *rn, rm: *rm });
            }
            (Op::Cmp, [O::Reg(rn), O::Imm(v)]) => match u32::try_from(*v) {
                Ok(imm12) if imm12 < 4096 => {
                    if !rn.is_gp() || *rn == Reg::Xzr {
                        self.bad_operands(op, ops);
                    }
                    self.insts.push(Inst::CmpImm { rn: *rn, imm12 });
                }
                _ => {
                    self.check_gp(op, &[*rn]);
                    assert_ne!(*rn, TMP);
                    self.mov_imm(TMP, *v as u64, false);
                    self.insts.push(Inst::CmpReg { rn: *rn, rm: TMP });
                }
            },
            (
                Op::Ldr
                | Op::Str
                | Op::Ldrw
                | Op::Strw
                | Op::Ldrb
                | Op::Strb
                | Op::Fldrs
                | Op::Fldrd
                | Op::Fstrs
                | Op::Fstrd,
                [O::Reg(rt), O::Mem(m)],
            ) => self.ldst(op, *rt, *m),
            (Op::Ldp | Op::Stp, [O::Reg(rt), O::Reg(rt2), O::Mem(m)]) => {
                self.pair(op, *rt, *rt2, *m)
            }
            (Op::B, [O::Label(l)]) => self.insts.push(Inst::B(*l)),
            (Op::Bl, [O::Label(l)]) => self.insts.push(Inst::Bl(*l)),
            (_, [O::Label(l)]) if op.cond().is_some() => {
                self.insts.push(Inst::BCond(op.cond().unwrap(), *l))
            }
            (Op::Cbz | Op::Cbnz, [O::Reg(rt), O::Label(l)]) => {
                self.check_gp(op, &[*rt]);
                self.insts.push(Inst::Cbz {
                    nz: op == Op::Cbnz,
                    rt: *rt,
                    target: *l,
                });
            }
            (Op::Blr | Op::Br, [O::Reg(rn)]) => {
                self.check_gp(op, &[*rn]);
                self.insts.push(if op == Op::Blr {
                    Inst::Blr(*rn)
                } else {
                    Inst::Br(*rn)
                });
            }
            (Op::Ret, []) | (Op::Ret, [O::Reg(Reg::X30)]) => self.insts.push(Inst::Ret),
            (Op::Nop, []) => self.insts.push(Inst::Nop),
            _ => self.bad_operands(op, ops),
        }
    }

    fn bad_operands(&self, op: Op, ops: &[Operand]) -> ! {
        panic!(
            "Invalid operands for {op}: {}",
            ops.iter()
                .map(|x| x.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }

    /// Check that `regs` are all general purpose registers other than `sp`.
    fn check_gp(&self, op: Op, regs: &[Reg]) {
        for r in regs {
            if !r.is_gp() || *r == Reg::Sp {
                panic!("{op} can't use register {r}");
            }
        }
    }

    fn mov_reg(&mut self, op: Op, rd: Reg, rn: Reg) {
        let inst = match (rd.is_float(), rn.is_float()) {
            (false, false) if op == Op::Mov => {
                if rd == Reg::Sp || rn == Reg::Sp {
                    Inst::AddSubImm {
                        sub: false,
                        rd,
                        rn,
                        imm12: 0,
                        lsl12: false,
                    }
                } else {
                    Inst::Alu {
                        op: AluOp::Orr,
                        rd,
                        rn: Reg::Xzr,
                        rm: rn,
                    }
                }
            }
            (true, true) => Inst::Fmov {
                rd,
                rn,
                single: false,
            },
            (true, false) if rn != Reg::Sp => Inst::FmovToFp { rd, rn },
            (false, true) if rd != Reg::Sp => Inst::FmovFromFp { rd, rn },
            _ => self.bad_operands(op, &[Operand::Reg(rd), Operand::Reg(rn)]),
        };
        self.insts.push(inst);
    }

    /// Move the 64-bit value `v` into `rd`. If `fixed` is true, always use four instructions.
    fn mov_imm(&mut self, rd: Reg, v: u64, fixed: bool) {
        self.check_gp(Op::Mov, &[rd]);
        let hws = (0..4u32)
            .map(|hw| (hw, u32::try_from((v >> (hw * 16)) & 0xFFFF).unwrap()))
            .filter(|(hw, imm16)| fixed || *imm16 != 0 || (*hw == 0 && v == 0))
            .collect::<Vec<_>>();
        for (i, (hw, imm16)) in hws.into_iter().enumerate() {
            self.insts.push(if i == 0 {
                Inst::Movz { rd, imm16, hw }
            } else {
                Inst::Movk { rd, imm16, hw }
            });
        }
    }

    fn movzk(&mut self, op: Op, rd: Reg, v: i64, shift: i64) {
        self.check_gp(op, &[rd]);
        let (imm16, hw) = match (u32::try_from(v), shift) {
            (Ok(imm16), 0 | 16 | 32 | 48) if imm16 <= 0xFFFF => {
                (imm16, u32::try_from(shift / 16).unwrap())
            }
            _ => panic!("Can't encode {op} #{v}, lsl #{shift}"),
        };
        self.insts.push(if op == Op::Movz {
            Inst::Movz { rd, imm16, hw }
        } else {
            Inst::Movk { rd, imm16, hw }
        });
    }

    fn add_sub_reg(&mut self, sub: bool, rd: Reg, rn: Reg, rm: Reg) {
        for r in [rd, rn, rm] {
            if !r.is_gp() {
                panic!("add/sub can't use register {r}");
            }
        }
        if rm == Reg::Sp {
            panic!("add/sub can't use sp as its second source");
        }
        if rd == Reg::Sp || rn == Reg::Sp {
            self.insts.push(Inst::AddSubExt { sub, rd, rn, rm });
        } else {
            let op = if sub { AluOp::Sub } else { AluOp::Add };
            self.insts.push(Inst::Alu { op, rd, rn, rm });
        }
    }

    fn add_sub_imm(&mut self, mut sub: bool, rd: Reg, rn: Reg, v: i64) {
        for r in [rd, rn] {
            if !r.is_gp() || r == Reg::Xzr {
                panic!("add/sub can't use register {r} with an immediate");
            }
        }
        if v < 0 {
            sub = !sub;
        }
        let v = v.unsigned_abs();
        if v < 4096 {
            let imm12 = u32::try_from(v).unwrap();
            self.insts.push(Inst::AddSubImm {
                sub,
                rd,
                rn,
                imm12,
                lsl12: false,
            });
        } else if v & 0xFFF == 0 && v >> 12 < 4096 {
            let imm12 = u32::try_from(v >> 12).unwrap();
            self.insts.push(Inst::AddSubImm {
                sub,
                rd,
                rn,
                imm12,
                lsl12: true,
            });
        } else {
            assert_ne!(rn, TMP, "add/sub with a large immediate can't read {TMP}");
            self.mov_imm(TMP, v, false);
            self.add_sub_reg(sub, rd, rn, TMP);
        }
    }

    fn ldst(&mut self, op: Op, rt: Reg, m: Mem) {
        let (load, width) = match op {
            Op::Ldr => (true, Width::X),
            Op::Str => (false, Width::X),
            Op::Ldrw => (true, Width::W),
            Op::Strw => (false, Width::W),
            Op::Ldrb => (true, Width::B),
            Op::Strb => (false, Width::B),
            Op::Fldrs => (true, Width::S),
            Op::Fstrs => (false, Width::S),
            Op::Fldrd => (true, Width::D),
            Op::Fstrd => (false, Width::D),
            _ => unreachable!(),
        };
        if width.is_float() != rt.is_float() || rt == Reg::Sp {
            panic!("{op} can't use register {rt}");
        }
        let size = width.size();
        let (base, mode) = match m {
            Mem::BaseOff { base, off } => {
                if off >= 0 && off % size == 0 && off / size < 4096 {
                    (base, AddrMode::UImm(off))
                } else if (-256..=255).contains(&off) {
                    (base, AddrMode::Unscaled(off))
                } else {
                    panic!("Offset {off} can't be encoded for {op}");
                }
            }
            Mem::Sib {
                base,
                index,
                scale,
                off,
            } => {
                let scale = i32::from(scale);
                if scale != 1 && scale != size {
                    panic!("Scale {scale} can't be encoded for {op}");
                }
                let shift = scale != 1 && size != 1;
                if off == 0 {
                    (base, AddrMode::RegOff { index, shift })
                } else {
                    if base == TMP || index == TMP || (!load && rt == TMP) {
                        panic!("{op} with an offset scaled-index-base operand can't use {TMP}");
                    }
                    self.add_sub_imm(false, TMP, base, i64::from(off));
                    (TMP, AddrMode::RegOff { index, shift })
                }
            }
            Mem::PreIndex { base, off } | Mem::PostIndex { base, off } => {
                if !(-256..=255).contains(&off) {
                    panic!("Offset {off} can't be encoded for {op}");
                }
                if matches!(m, Mem::PreIndex { .. }) {
                    (base, AddrMode::Pre(off))
                } else {
                    (base, AddrMode::Post(off))
                }
            }
        };
        self.insts.push(Inst::Ldst {
            load,
            width,
            rt,
            base,
            mode,
        });
    }

    fn pair(&mut self, op: Op, rt: Reg, rt2: Reg, m: Mem) {
        if rt.is_float() != rt2.is_float() || rt == Reg::Sp || rt2 == Reg::Sp {
            panic!("{op} can't use registers {rt} and {rt2}");
        }
        let (base, off, mode) = match m {
            Mem::BaseOff { base, off } => (base, off, PairMode::Offset),
            Mem::PreIndex { base, off } => (base, off, PairMode::Pre),
            Mem::PostIndex { base, off } => (base, off, PairMode::Post),
            Mem::Sib { .. } => panic!("{op} can't use a scaled-index-base operand"),
        };
        if off % 8 != 0 || !(-512..=504).contains(&off) {
            panic!("Offset {off} can't be encoded for {op}");
        }
        self.insts.push(Inst::Pair {
            load: op == Op::Ldp,
            rt,
            rt2,
            base,
            off,
            mode,
        });
    }

    /// Resolve labels and produce little-endian machine code.
    pub fn assemble(&self) -> Result<Vec<u8>, CompilationError> {
        let mut out = Vec::with_capacity(self.len());
        for (pos, inst) in self.insts.iter().enumerate() {
            out.extend_from_slice(&inst.encode(pos, &self.labels)?.to_le_bytes());
        }
        Ok(out)
    }

    /// Render the instructions as text, one machine instruction per line, with `lN:` lines
    /// marking where labels are attached.
    pub fn disassemble(&self) -> String {
        let mut attached = self
            .labels
            .iter_enumerated()
            .filter_map(|(l, pos)| pos.map(|pos| (pos, l)))
            .collect::<Vec<_>>();
        attached.sort();
        let mut out = Vec::new();
        let mut next = attached.iter().peekable();
        for pos in 0..=self.insts.len() {
            while let Some((_, l)) = next.next_if(|(lpos, _)| *lpos == pos) {
                out.push(format!("l{}:", l.index()));
            }
            if let Some(inst) = self.insts.get(pos) {
                out.push(inst.to_string());
            }
        }
        out.join("\n")
    }
}
