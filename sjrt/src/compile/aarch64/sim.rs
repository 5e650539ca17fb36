//! A symbolic AArch64 machine for testing emitted code.
//!
//! Registers and memory words hold [Val]s: concrete integers, opaque symbols, or unknowns.
//! Addresses must be concrete. Memory is a map from address to [Val] with no notion of access
//! width, which suffices for code that only moves whole values around.

use super::{
    asm::{AddrMode, AluOp, Asm, Cond, Inst, PairMode, Width},
    reg::Reg,
};
use std::collections::HashMap;
use strum::EnumCount;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Val {
    Unknown,
    Int(i64),
    Sym(u32),
}

impl Val {
    pub(crate) fn int(self) -> Option<i64> {
        match self {
            Val::Int(x) => Some(x),
            _ => None,
        }
    }
}

/// Why [Machine::run] stopped.
#[derive(Debug, PartialEq)]
pub(crate) enum Stop {
    /// At a `blr`/`br`/`bl` to this target. Running again continues after the call.
    Call(Val),
    Ret,
}

pub(crate) struct Machine {
    regs: HashMap<Reg, Val>,
    mem: HashMap<i64, Val>,
    /// The operands of the last comparison, if both were concrete.
    flags: Option<(i64, i64)>,
    pc: usize,
}

impl Machine {
    pub(crate) fn new(sp: i64) -> Self {
        let mut m = Self {
            regs: HashMap::new(),
            mem: HashMap::new(),
            flags: None,
            pc: 0,
        };
        m.set_reg(Reg::Sp, Val::Int(sp));
        m
    }

    pub(crate) fn reg(&self, r: Reg) -> Val {
        if r == Reg::Xzr {
            return Val::Int(0);
        }
        self.regs.get(&r).copied().unwrap_or(Val::Unknown)
    }

    pub(crate) fn set_reg(&mut self, r: Reg, v: Val) {
        if r != Reg::Xzr {
            self.regs.insert(r, v);
        }
    }

    pub(crate) fn load(&self, addr: i64) -> Val {
        self.mem.get(&addr).copied().unwrap_or(Val::Unknown)
    }

    pub(crate) fn store(&mut self, addr: i64, v: Val) {
        self.mem.insert(addr, v);
    }

    /// Start executing from instruction `pc` on the next [Self::run].
    pub(crate) fn set_pc(&mut self, pc: usize) {
        self.pc = pc;
    }

    /// Every register.
    pub(crate) fn all_regs() -> impl Iterator<Item = Reg> {
        (0..Reg::COUNT).map(|i| Reg::from_repr(u8::try_from(i).unwrap()).unwrap())
    }

    /// Forget the registers an AAPCS64 callee may clobber.
    pub(crate) fn clobber_caller_saved(&mut self) {
        for r in Self::all_regs() {
            let n = r.num();
            let clobbered = if r.is_float() {
                !(8..=15).contains(&n)
            } else {
                n <= 18 || r == Reg::X30
            };
            if clobbered && r != Reg::Sp && r != Reg::Xzr {
                self.set_reg(r, Val::Unknown);
            }
        }
    }

    fn addr(&self, base: Reg) -> i64 {
        self.reg(base)
            .int()
            .unwrap_or_else(|| panic!("{base} doesn't hold an address"))
    }

    fn arith(&self, a: Val, b: Val, f: fn(i64, i64) -> i64) -> Val {
        match (a, b) {
            (Val::Int(a), Val::Int(b)) => Val::Int(f(a, b)),
            _ => Val::Unknown,
        }
    }

    fn cond(&self, c: Cond) -> bool {
        let (a, b) = self.flags.expect("Branch on unknown flags");
        let (ua, ub) = (a as u64, b as u64);
        match c {
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::Hs => ua >= ub,
            Cond::Lo => ua < ub,
            Cond::Hi => ua > ub,
            Cond::Ls => ua <= ub,
            Cond::Ge => a >= b,
            Cond::Lt => a < b,
            Cond::Gt => a > b,
            Cond::Le => a <= b,
            Cond::Mi => a.wrapping_sub(b) < 0,
            Cond::Pl => a.wrapping_sub(b) >= 0,
        }
    }

    fn jump(&mut self, asm: &Asm, l: super::asm::LabelIdx) {
        self.pc = asm.label_pos(l).expect("Branch to an unattached label");
    }

    /// Execute `asm` from where the machine last stopped until it calls out or returns.
    pub(crate) fn run(&mut self, asm: &Asm) -> Stop {
        loop {
            let inst = asm
                .insts()
                .get(self.pc)
                .unwrap_or_else(|| panic!("Fell off the end of the code"))
                .clone();
            self.pc += 1;
            match inst {
                Inst::AddSubImm {
                    sub,
                    rd,
                    rn,
                    imm12,
                    lsl12,
                } => {
                    let v = i64::from(imm12) << if lsl12 { 12 } else { 0 };
                    let f = if sub { i64::wrapping_sub } else { i64::wrapping_add };
                    self.set_reg(rd, self.arith(self.reg(rn), Val::Int(v), f));
                }
                Inst::AddSubExt { sub, rd, rn, rm } => {
                    let f = if sub { i64::wrapping_sub } else { i64::wrapping_add };
                    self.set_reg(rd, self.arith(self.reg(rn), self.reg(rm), f));
                }
                Inst::Alu {
                    op: AluOp::Orr,
                    rd,
                    rn: Reg::Xzr,
                    rm,
                } => self.set_reg(rd, self.reg(rm)),
                Inst::Alu { op, rd, rn, rm } => {
                    let f: fn(i64, i64) -> i64 = match op {
                        AluOp::Add => i64::wrapping_add,
                        AluOp::Sub => i64::wrapping_sub,
                        AluOp::And => |a, b| a & b,
                        AluOp::Orr => |a, b| a | b,
                        AluOp::Eor => |a, b| a ^ b,
                    };
                    self.set_reg(rd, self.arith(self.reg(rn), self.reg(rm), f));
                }
                Inst::CmpReg { rn, rm } | Inst::CmpExt { rn, rm } => {
                    self.flags = self.reg(rn).int().zip(self.reg(rm).int());
                }
                Inst::CmpImm { rn, imm12 } => {
                    self.flags = self.reg(rn).int().map(|a| (a, i64::from(imm12)));
                }
                Inst::Movz { rd, imm16, hw } => {
                    self.set_reg(rd, Val::Int(i64::from(imm16) << (hw * 16)));
                }
                Inst::Movk { rd, imm16, hw } => {
                    let v = match self.reg(rd) {
                        Val::Int(x) => {
                            let sh = hw * 16;
                            Val::Int((x & !(0xFFFF << sh)) | (i64::from(imm16) << sh))
                        }
                        _ => Val::Unknown,
                    };
                    self.set_reg(rd, v);
                }
                Inst::Ldst {
                    load,
                    width,
                    rt,
                    base,
                    mode,
                } => {
                    let b = self.addr(base);
                    let (addr, wb) = match mode {
                        AddrMode::UImm(o) | AddrMode::Unscaled(o) => (b + i64::from(o), None),
                        AddrMode::Pre(o) => (b + i64::from(o), Some(b + i64::from(o))),
                        AddrMode::Post(o) => (b, Some(b + i64::from(o))),
                        AddrMode::RegOff { index, shift } => {
                            let sh = if shift {
                                width.size().trailing_zeros()
                            } else {
                                0
                            };
                            (b + (self.addr(index) << sh), None)
                        }
                    };
                    if width != Width::X && width != Width::D && load && !rt.is_float() {
                        // Narrow integer loads zero extend: we can't model that symbolically.
                        self.set_reg(rt, Val::Unknown);
                    } else if load {
                        self.set_reg(rt, self.load(addr));
                    } else {
                        self.store(addr, self.reg(rt));
                    }
                    if let Some(x) = wb {
                        self.set_reg(base, Val::Int(x));
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
                    let b = self.addr(base);
                    let o = i64::from(off);
                    let (addr, wb) = match mode {
                        PairMode::Offset => (b + o, None),
                        PairMode::Pre => (b + o, Some(b + o)),
                        PairMode::Post => (b, Some(b + o)),
                    };
                    if load {
                        self.set_reg(rt, self.load(addr));
                        self.set_reg(rt2, self.load(addr + 8));
                    } else {
                        self.store(addr, self.reg(rt));
                        self.store(addr + 8, self.reg(rt2));
                    }
                    if let Some(x) = wb {
                        self.set_reg(base, Val::Int(x));
                    }
                }
                Inst::Fmov { rd, rn, .. }
                | Inst::FmovToFp { rd, rn }
                | Inst::FmovFromFp { rd, rn } => self.set_reg(rd, self.reg(rn)),
                Inst::B(l) => self.jump(asm, l),
                Inst::BCond(c, l) => {
                    if self.cond(c) {
                        self.jump(asm, l);
                    }
                }
                Inst::Cbz { nz, rt, target } => {
                    let v = self.reg(rt).int().expect("cbz on an unknown value");
                    if (v == 0) != nz {
                        self.jump(asm, target);
                    }
                }
                Inst::Bl(l) => {
                    let target = Val::Int(i64::try_from(asm.label_pos(l).unwrap()).unwrap());
                    self.set_reg(Reg::X30, Val::Unknown);
                    return Stop::Call(target);
                }
                Inst::Blr(r) | Inst::Br(r) => {
                    let target = self.reg(r);
                    self.set_reg(Reg::X30, Val::Unknown);
                    return Stop::Call(target);
                }
                Inst::Ret => return Stop::Ret,
                Inst::Nop => (),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        super::{
            asm::Op,
            operand::{imm, post, pre, ptr},
        },
        *,
    };

    #[test]
    fn frame_record_round_trip() {
        let mut asm = Asm::new();
        asm.push(Op::Stp, &[Reg::X29.into(), Reg::X30.into(), pre(Reg::Sp, -16)]);
        asm.push(Op::Mov, &[Reg::X29.into(), Reg::Sp.into()]);
        asm.push(Op::Sub, &[Reg::Sp.into(), Reg::Sp.into(), imm(0x12340)]);
        asm.push(Op::Mov, &[Reg::X0.into(), Reg::X1.into()]);
        asm.push(Op::Str, &[Reg::X0.into(), ptr(Reg::Sp, 8)]);
        asm.push(Op::Mov, &[Reg::Sp.into(), Reg::X29.into()]);
        asm.push(Op::Ldp, &[Reg::X29.into(), Reg::X30.into(), post(Reg::Sp, 16)]);
        asm.push(Op::Ret, &[]);

        let mut m = Machine::new(0x100000);
        m.set_reg(Reg::X1, Val::Sym(1));
        m.set_reg(Reg::X29, Val::Sym(2));
        m.set_reg(Reg::X30, Val::Sym(3));
        assert_eq!(m.run(&asm), Stop::Ret);
        assert_eq!(m.reg(Reg::X0), Val::Sym(1));
        assert_eq!(m.load(0x100000 - 16 - 0x12340 + 8), Val::Sym(1));
        assert_eq!(m.reg(Reg::Sp), Val::Int(0x100000));
        assert_eq!(m.reg(Reg::X29), Val::Sym(2));
        assert_eq!(m.reg(Reg::X30), Val::Sym(3));
    }
}
