//! Stack frames.
//!
//! A [Frame] describes the stack frame of one piece of JITted code, and emits the code that
//! builds and tears it down. There are two kinds of frame:
//!
//!   * a *ccall* frame belongs to a call stub: it is entered under the internal convention and
//!     calls a foreign function under AAPCS64.
//!   * a non-ccall frame belongs to a function body entered from native code under AAPCS64. The
//!     body expects its arguments where the internal convention puts them, so the frame contains
//!     a *home* area standing in for the internal caller-reserved area.
//!
//! After the prologue a frame looks like this (higher addresses first):
//!
//! ```text
//! x29 + 16 ..        the caller's area: internal (ccall) or AAPCS64 (non-ccall) stack arguments
//! x29                saved x29, x30
//! x29 - 8 * (i + 1)  reserved register save slots
//!                    (padding)
//! sp + home          home area (non-ccall only)
//!                    pointer-spill slots (ccall only)
//! sp + out           local slots
//! sp + 0             outgoing AAPCS64 stack arguments (ccall only)
//! ```

use super::{
    asm::{Asm, LabelIdx, Op, TMP},
    operand::{imm, label, post, pre, ptr, Operand},
    reg::Reg,
    FOREIGN, STACK_ALIGN, WORD,
};
use crate::{
    compile::{
        abi::{classify_func, FloatKind, FunctionLayout, ParamLoc, Parameter},
        parmove::{self, Loc, Move, MoveKind},
        CompilationError,
    },
    config::Config,
};
use sjsmp::{StackMap, StackMapBuilder};
use std::sync::{Arc, OnceLock};

/// The registers a non-ccall frame must preserve for its native caller.
static CALLEE_SAVED: [Reg; 18] = [
    Reg::X19,
    Reg::X20,
    Reg::X21,
    Reg::X22,
    Reg::X23,
    Reg::X24,
    Reg::X25,
    Reg::X26,
    Reg::X27,
    Reg::X28,
    Reg::V8,
    Reg::V9,
    Reg::V10,
    Reg::V11,
    Reg::V12,
    Reg::V13,
    Reg::V14,
    Reg::V15,
];

// Frame sizes are rounded to `STACK_ALIGN` but built from whole words.
static_assertions::const_assert!(STACK_ALIGN % WORD == 0);

/// Scratch registers for breaking parallel move cycles.
const CYCLE_SCRATCH_INT: Reg = Reg::X16;
const CYCLE_SCRATCH_FLOAT: Reg = Reg::V30;
/// Scratch register for float memory-to-memory moves. Integer ones go through [TMP].
const MEM_SCRATCH_FLOAT: Reg = Reg::V31;

/// The registers a frame saves in its prologue and restores before returning. A ccall frame
/// saves nothing: AAPCS64 callees preserve x19-x28 and d8-d15 themselves.
pub fn reserved_regs(ccall: bool) -> &'static [Reg] {
    if ccall {
        &[]
    } else {
        &CALLEE_SAVED
    }
}

fn off(x: usize) -> i32 {
    i32::try_from(x).unwrap()
}

fn move_kind(float: FloatKind) -> MoveKind {
    match float {
        FloatKind::None => MoveKind::Int,
        FloatKind::F32 => MoveKind::F32,
        FloatKind::F64 => MoveKind::F64,
    }
}

fn loc_operand(l: Loc<Reg>) -> Operand {
    match l {
        Loc::Reg(r) => Operand::Reg(r),
        Loc::Stack { base, off } => ptr(base, off),
    }
}

#[derive(Debug)]
pub struct Frame {
    /// The internal convention layout.
    layout: Arc<FunctionLayout<Reg>>,
    /// The same signature classified against AAPCS64.
    foreign: FunctionLayout<Reg>,
    locals: Vec<bool>,
    ccall: bool,
    guard_off: u32,
    /// Indices into `layout.args()` of the register-resident pointer arguments a ccall frame
    /// parks in pointer-spill slots.
    ptr_spills: Vec<usize>,
    /// The size of the outgoing argument area.
    out: usize,
    /// The size of the home area.
    home: usize,
    reserved: &'static [Reg],
    size: usize,
    arg_ptrs: OnceLock<StackMap>,
    local_ptrs: OnceLock<StackMap>,
}

impl Frame {
    /// Create a frame for code with the signature of `layout` and a local slot for each element
    /// of `locals`, where `true` marks a slot which holds a pointer.
    ///
    /// Fails if the signature can't be passed under AAPCS64.
    pub fn new(
        cfg: &Config,
        layout: Arc<FunctionLayout<Reg>>,
        locals: &[bool],
        ccall: bool,
    ) -> Result<Self, CompilationError> {
        let foreign = classify_func(&FOREIGN, layout.fty())?;
        let ptr_spills = if ccall {
            layout
                .args()
                .iter()
                .enumerate()
                .filter(|(_, p)| p.in_register() && p.is_pointer)
                .map(|(i, _)| i)
                .collect()
        } else {
            Vec::new()
        };
        let out = if ccall { foreign.stack_arg_size() } else { 0 };
        let home = if ccall { 0 } else { layout.fp() };
        let reserved = reserved_regs(ccall);
        let size = (16
            + out
            + WORD * (locals.len() + ptr_spills.len())
            + home
            + WORD * reserved.len())
        .next_multiple_of(STACK_ALIGN);
        Ok(Self {
            layout,
            foreign,
            locals: locals.to_vec(),
            ccall,
            guard_off: cfg.stack_guard_off,
            ptr_spills,
            out,
            home,
            reserved,
            size,
            arg_ptrs: OnceLock::new(),
            local_ptrs: OnceLock::new(),
        })
    }

    pub fn layout(&self) -> &Arc<FunctionLayout<Reg>> {
        &self.layout
    }

    /// The signature's AAPCS64 classification.
    pub fn foreign_layout(&self) -> &FunctionLayout<Reg> {
        &self.foreign
    }

    pub fn ccall(&self) -> bool {
        self.ccall
    }

    /// The total size of the frame in bytes, including the frame record.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The offset from `sp` of the first local slot: [Self::local_ptrs] starts here.
    pub fn locals_off(&self) -> usize {
        self.out
    }

    fn home_off(&self) -> usize {
        self.out + WORD * (self.locals.len() + self.ptr_spills.len())
    }

    /// The layout the code is entered with.
    fn entry_layout(&self) -> &FunctionLayout<Reg> {
        if self.ccall {
            &self.layout
        } else {
            &self.foreign
        }
    }

    /// Where the internal convention puts `p` from the point of view of the code using this
    /// frame.
    fn internal_loc(&self, p: &Parameter<Reg>) -> Loc<Reg> {
        match p.loc {
            ParamLoc::Reg { reg, .. } => Loc::Reg(reg),
            ParamLoc::Stack(mem) if self.ccall => Loc::Stack {
                base: Reg::X29,
                off: off(16 + mem),
            },
            ParamLoc::Stack(mem) => Loc::Stack {
                base: Reg::Sp,
                off: off(self.home_off() + mem),
            },
        }
    }

    /// Where AAPCS64 puts the argument `p`: in the outgoing area for a ccall frame, in the
    /// native caller's area otherwise.
    fn foreign_arg_loc(&self, p: &Parameter<Reg>) -> Loc<Reg> {
        match p.loc {
            ParamLoc::Reg { reg, .. } => Loc::Reg(reg),
            ParamLoc::Stack(mem) if self.ccall => Loc::Stack {
                base: Reg::Sp,
                off: off(mem),
            },
            ParamLoc::Stack(mem) => Loc::Stack {
                base: Reg::X29,
                off: off(16 + mem),
            },
        }
    }

    /// The location of component `i` of the internal convention arguments.
    pub fn argv(&self, i: usize) -> Operand {
        loc_operand(self.internal_loc(&self.layout.args()[i]))
    }

    /// The location of component `i` of the internal convention return values.
    pub fn retv(&self, i: usize) -> Operand {
        loc_operand(self.internal_loc(&self.layout.rets()[i]))
    }

    /// The save slot of reserved register `i`.
    pub fn resv(&self, i: usize) -> Operand {
        assert!(i < self.reserved.len());
        ptr(Reg::X29, -off(WORD * (i + 1)))
    }

    /// Local slot `i`.
    pub fn localv(&self, i: usize) -> Operand {
        assert!(i < self.locals.len());
        ptr(Reg::Sp, off(self.out + WORD * i))
    }

    fn ptr_spill_slot(&self, j: usize) -> Operand {
        ptr(Reg::Sp, off(self.out + WORD * (self.locals.len() + j)))
    }

    /// The pointer map of the caller's area, one bit per word from the entry `sp`. Only
    /// stack-resident arguments and return values can be marked: pointers passed in registers
    /// are covered by [Self::local_ptrs] once the prologue has run.
    pub fn arg_ptrs(&self) -> &StackMap {
        self.arg_ptrs.get_or_init(|| {
            let entry = self.entry_layout();
            let offs = entry
                .args()
                .iter()
                .chain(entry.rets())
                .filter(|p| p.is_pointer)
                .filter_map(|p| p.mem())
                .map(|mem| u32::try_from(mem).unwrap())
                .collect::<Vec<_>>();
            // Pointer components are always word aligned.
            StackMap::from_offsets(entry.fp() / WORD, &offs).unwrap()
        })
    }

    /// The pointer map of the frame from [Self::locals_off]: the user's local slots, then any
    /// pointer-spill slots, then any home area.
    pub fn local_ptrs(&self) -> &StackMap {
        self.local_ptrs.get_or_init(|| {
            let mut b = StackMapBuilder::new();
            for is_ptr in &self.locals {
                b.add_field(*is_ptr);
            }
            b.add_fields(self.ptr_spills.len(), true);
            if !self.ccall {
                let base = b.len() * WORD;
                b.add_fields(self.home / WORD, false);
                for p in self.layout.args().iter().chain(self.layout.rets()) {
                    if let (true, Some(mem)) = (p.is_pointer, p.mem()) {
                        b.set_ptr_at(u32::try_from(base + mem).unwrap()).unwrap();
                    }
                }
            }
            b.build()
        })
    }

    fn stack_check(&self, asm: &mut Asm, grow: LabelIdx, need: usize) {
        asm.push(
            Op::Ldr,
            &[
                Reg::X16.into(),
                ptr(Reg::X28, i32::try_from(self.guard_off).unwrap()),
            ],
        );
        asm.push(Op::Mov, &[TMP.into(), Operand::ImmPtr(need)]);
        // `sp - need` must not wrap.
        asm.push(Op::Cmp, &[Reg::Sp.into(), TMP.into()]);
        asm.push(Op::BLo, &[label(grow)]);
        asm.push(Op::Sub, &[TMP.into(), Reg::Sp.into(), TMP.into()]);
        asm.push(Op::Cmp, &[TMP.into(), Reg::X16.into()]);
        asm.push(Op::BLs, &[label(grow)]);
    }

    /// Emit a check that the stack has room for this frame plus `max_stack` bytes, branching to
    /// `grow` if it doesn't. Must be emitted before the prologue.
    pub fn emit_stack_check(
        &self,
        asm: &mut Asm,
        grow: LabelIdx,
        max_stack: usize,
    ) -> Result<(), CompilationError> {
        let need = self.size.checked_add(max_stack).ok_or_else(|| {
            CompilationError::LimitExceeded(format!("stack budget {max_stack} is too large"))
        })?;
        self.stack_check(asm, grow, need);
        Ok(())
    }

    /// How many bytes of code does [Self::emit_stack_check] emit?
    pub fn stack_check_text_size(&self) -> usize {
        let mut asm = Asm::new();
        let grow = asm.mk_label();
        self.stack_check(&mut asm, grow, self.size);
        asm.len()
    }

    pub fn emit_prologue(&self, asm: &mut Asm) -> Result<(), CompilationError> {
        asm.push(Op::Stp, &[Reg::X29.into(), Reg::X30.into(), pre(Reg::Sp, -16)]);
        asm.push(Op::Mov, &[Reg::X29.into(), Reg::Sp.into()]);
        if self.size > 16 {
            asm.push(
                Op::Sub,
                &[
                    Reg::Sp.into(),
                    Reg::Sp.into(),
                    imm(i64::try_from(self.size - 16).unwrap()),
                ],
            );
        }
        self.save_or_restore(asm, false);
        for (j, i) in self.ptr_spills.iter().enumerate() {
            let reg = self.layout.args()[*i].reg().unwrap();
            asm.push(Op::Str, &[reg.into(), self.ptr_spill_slot(j)]);
        }
        Ok(())
    }

    fn save_or_restore(&self, asm: &mut Asm, restore: bool) {
        let (pair_op, op) = if restore {
            (Op::Ldp, Op::Ldr)
        } else {
            (Op::Stp, Op::Str)
        };
        for (chunk, regs) in self.reserved.chunks(2).enumerate() {
            let i = chunk * 2;
            match regs {
                // The higher-numbered reserved slot is at the lower address.
                [a, b] => asm.push(
                    pair_op,
                    &[(*b).into(), (*a).into(), ptr(Reg::X29, -off(WORD * (i + 2)))],
                ),
                [a] if a.is_float() => {
                    let op = if restore { Op::Fldrd } else { Op::Fstrd };
                    asm.push(op, &[(*a).into(), self.resv(i)])
                }
                [a] => asm.push(op, &[(*a).into(), self.resv(i)]),
                _ => unreachable!(),
            }
        }
    }

    /// Reload the registers the prologue saved.
    pub fn emit_restore_regs(&self, asm: &mut Asm) -> Result<(), CompilationError> {
        self.save_or_restore(asm, true);
        Ok(())
    }

    pub fn emit_epilogue(&self, asm: &mut Asm) -> Result<(), CompilationError> {
        asm.push(Op::Mov, &[Reg::Sp.into(), Reg::X29.into()]);
        asm.push(Op::Ldp, &[Reg::X29.into(), Reg::X30.into(), post(Reg::Sp, 16)]);
        asm.push(Op::Ret, &[]);
        Ok(())
    }

    /// Move the arguments from where the caller put them to where the callee expects them: from
    /// internal to AAPCS64 positions in a ccall frame, the other way around otherwise.
    pub fn emit_exchange_args(&self, asm: &mut Asm) -> Result<(), CompilationError> {
        // Both layouts decompose the same types, so their parameters pair up one to one.
        let moves = self
            .layout
            .args()
            .iter()
            .zip(self.foreign.args())
            .filter(|(p, _)| p.size() > 0)
            .map(|(int, fgn)| {
                let (int_loc, fgn_loc) = (self.internal_loc(int), self.foreign_arg_loc(fgn));
                let kind = move_kind(int.float);
                if self.ccall {
                    Move::new(int_loc, fgn_loc, kind)
                } else {
                    Move::new(fgn_loc, int_loc, kind)
                }
            })
            .collect::<Vec<_>>();
        emit_moves(asm, &moves);
        Ok(())
    }

    /// Move the return values: from AAPCS64 to internal positions in a ccall frame, the other way
    /// around otherwise. Fails if AAPCS64 can't return them all in registers.
    pub fn emit_exchange_rets(&self, asm: &mut Asm) -> Result<(), CompilationError> {
        let mut moves = Vec::new();
        for (int, fgn) in self.layout.rets().iter().zip(self.foreign.rets()) {
            if int.size() == 0 {
                continue;
            }
            let fgn_loc = match fgn.reg() {
                Some(r) => Loc::Reg(r),
                None => {
                    return Err(CompilationError::LimitExceeded(format!(
                        "{} returns more values than fit in {} return registers",
                        self.layout.fty(),
                        FOREIGN.name
                    )))
                }
            };
            let int_loc = self.internal_loc(int);
            let kind = move_kind(int.float);
            moves.push(if self.ccall {
                Move::new(fgn_loc, int_loc, kind)
            } else {
                Move::new(int_loc, fgn_loc, kind)
            });
        }
        emit_moves(asm, &moves);
        Ok(())
    }

    fn grow_stack(&self, asm: &mut Asm, entry: LabelIdx, addr: usize) {
        let regs = self
            .entry_layout()
            .args()
            .iter()
            .filter_map(|p| p.reg())
            .collect::<Vec<_>>();
        let area = (WORD * regs.len()).next_multiple_of(STACK_ALIGN);
        let slot = |i: usize| ptr(Reg::Sp, off(WORD * i));

        asm.push(Op::Stp, &[Reg::X29.into(), Reg::X30.into(), pre(Reg::Sp, -16)]);
        asm.push(Op::Mov, &[Reg::X29.into(), Reg::Sp.into()]);
        if area > 0 {
            asm.push(
                Op::Sub,
                &[Reg::Sp.into(), Reg::Sp.into(), imm(i64::try_from(area).unwrap())],
            );
        }
        for (i, r) in regs.iter().enumerate() {
            let op = if r.is_float() { Op::Fstrd } else { Op::Str };
            asm.push(op, &[(*r).into(), slot(i)]);
        }
        asm.push(Op::Mov, &[Reg::X16.into(), Operand::ImmPtr(addr)]);
        asm.push(Op::Blr, &[Reg::X16.into()]);
        for (i, r) in regs.iter().enumerate() {
            let op = if r.is_float() { Op::Fldrd } else { Op::Ldr };
            asm.push(op, &[(*r).into(), slot(i)]);
        }
        asm.push(Op::Mov, &[Reg::Sp.into(), Reg::X29.into()]);
        asm.push(Op::Ldp, &[Reg::X29.into(), Reg::X30.into(), post(Reg::Sp, 16)]);
        asm.push(Op::B, &[label(entry)]);
    }

    /// Emit the out-of-line path taken when the stack check fails: save the entry convention's
    /// register arguments, call the growth routine at `addr`, reload them, and retry from
    /// `entry`.
    pub fn emit_grow_stack(
        &self,
        asm: &mut Asm,
        entry: LabelIdx,
        addr: usize,
    ) -> Result<(), CompilationError> {
        self.grow_stack(asm, entry, addr);
        Ok(())
    }

    /// How many bytes of code does [Self::emit_grow_stack] emit?
    pub fn grow_stack_text_size(&self) -> usize {
        let mut asm = Asm::new();
        let entry = asm.mk_label();
        self.grow_stack(&mut asm, entry, 0);
        asm.len()
    }
}

fn cycle_scratch(kind: MoveKind) -> Reg {
    match kind {
        MoveKind::Int => CYCLE_SCRATCH_INT,
        MoveKind::F32 | MoveKind::F64 => CYCLE_SCRATCH_FLOAT,
    }
}

/// Sequence the parallel `moves` and emit them.
fn emit_moves(asm: &mut Asm, moves: &[Move<Reg>]) {
    for m in parmove::resolve(moves, cycle_scratch) {
        let (load, store) = match m.kind {
            MoveKind::Int => (Op::Ldr, Op::Str),
            MoveKind::F32 => (Op::Fldrs, Op::Fstrs),
            MoveKind::F64 => (Op::Fldrd, Op::Fstrd),
        };
        match (m.src, m.dst) {
            (Loc::Reg(s), Loc::Reg(d)) => {
                let op = if m.kind == MoveKind::Int {
                    Op::Mov
                } else {
                    Op::Fmov
                };
                asm.push(op, &[d.into(), s.into()]);
            }
            (Loc::Stack { .. }, Loc::Reg(d)) => asm.push(load, &[d.into(), loc_operand(m.src)]),
            (Loc::Reg(s), Loc::Stack { .. }) => asm.push(store, &[s.into(), loc_operand(m.dst)]),
            (Loc::Stack { .. }, Loc::Stack { .. }) => {
                let tmp = if m.kind == MoveKind::Int {
                    TMP
                } else {
                    MEM_SCRATCH_FLOAT
                };
                asm.push(load, &[tmp.into(), loc_operand(m.src)]);
                asm.push(store, &[tmp.into(), loc_operand(m.dst)]);
            }
        }
    }
}
