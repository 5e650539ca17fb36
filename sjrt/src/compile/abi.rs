//! Argument classification and function layouts.
//!
//! A [CallConv] describes how a calling convention passes values. Classifying a function type
//! against a convention produces a [FunctionLayout]: one [Parameter] per scalar component of each
//! argument and return value, each either in a register or at a byte offset in the
//! caller-reserved stack area. This module knows nothing about any particular architecture: it is
//! generic over the register type `R`.
//!
//! The caller-reserved area of a layout is arranged as:
//!
//! ```text
//! 0                  stack-resident arguments, in declared order
//! stack_arg_size     spill slots for register-resident arguments (if the convention has them)
//! arg_size           stack-resident return values, in declared order
//! fp                 (end, word aligned)
//! ```

use super::{abs_stack::AbstractStack, CompilationError};
use crate::ty::{FloatTy, FuncTy, Ty};
use std::fmt;

/// How a calling convention passes values.
#[derive(Debug)]
pub struct CallConv<R: 'static> {
    pub name: &'static str,
    pub int_args: &'static [R],
    pub float_args: &'static [R],
    pub int_rets: &'static [R],
    pub float_rets: &'static [R],
    /// The size of a stack slot in bytes.
    pub word: usize,
    /// Does the caller reserve a spill slot for each register-resident argument?
    pub spill_slots: bool,
    /// If a multi-component value is passed on the stack, are the remaining integer registers
    /// forfeited?
    pub exhaust_on_spill: bool,
    /// Multi-component values larger than this many bytes are passed by reference, which this
    /// backend does not support.
    pub by_ref_above: Option<usize>,
}

/// Which register class (if any) a parameter is passed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FloatKind {
    None,
    F32,
    F64,
}

impl FloatKind {
    fn of(ty: &Ty) -> Self {
        match ty {
            Ty::Float(FloatTy::Single) => FloatKind::F32,
            Ty::Float(FloatTy::Double) => FloatKind::F64,
            _ => FloatKind::None,
        }
    }
}

/// Where a parameter lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParamLoc<R> {
    /// In register `reg`. `spill` is the offset of the caller-reserved spill slot, if the
    /// convention has them.
    Reg { reg: R, spill: Option<usize> },
    /// At this byte offset in the caller-reserved area.
    Stack(usize),
}

/// One scalar component of an argument or return value.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter<R> {
    /// The index of the declared argument / return value this is part of.
    pub val: usize,
    pub loc: ParamLoc<R>,
    pub is_pointer: bool,
    pub float: FloatKind,
    /// The component's type. For a zero-sized value, this is the value's type.
    pub ty: Ty,
}

impl<R: Copy> Parameter<R> {
    pub fn in_register(&self) -> bool {
        matches!(self.loc, ParamLoc::Reg { .. })
    }

    pub fn reg(&self) -> Option<R> {
        match self.loc {
            ParamLoc::Reg { reg, .. } => Some(reg),
            ParamLoc::Stack(_) => None,
        }
    }

    /// The stack offset of this parameter, if it is stack-resident.
    pub fn mem(&self) -> Option<usize> {
        match self.loc {
            ParamLoc::Reg { .. } => None,
            ParamLoc::Stack(off) => Some(off),
        }
    }

    pub fn spill(&self) -> Option<usize> {
        match self.loc {
            ParamLoc::Reg { spill, .. } => spill,
            ParamLoc::Stack(_) => None,
        }
    }

    pub fn size(&self) -> usize {
        self.ty.size()
    }
}

/// The classification of a function type against a calling convention. Layouts are immutable.
#[derive(Debug)]
pub struct FunctionLayout<R> {
    conv: &'static str,
    fty: FuncTy,
    args: Vec<Parameter<R>>,
    rets: Vec<Parameter<R>>,
    stack_arg_size: usize,
    spill_size: usize,
    arg_size: usize,
    fp: usize,
}

impl<R: Copy> FunctionLayout<R> {
    pub fn fty(&self) -> &FuncTy {
        &self.fty
    }

    /// The name of the calling convention this layout was classified against.
    pub fn conv(&self) -> &'static str {
        self.conv
    }

    pub fn args(&self) -> &[Parameter<R>] {
        &self.args
    }

    pub fn rets(&self) -> &[Parameter<R>] {
        &self.rets
    }

    /// The sum of the argument sizes in declared order, each stack-resident argument rounded up
    /// to a whole number of stack slots.
    pub fn arg_size(&self) -> usize {
        self.arg_size
    }

    /// The size of the stack-resident arguments alone.
    pub fn stack_arg_size(&self) -> usize {
        self.stack_arg_size
    }

    /// The size of the spill slots for register-resident arguments. They start at
    /// [Self::stack_arg_size] in the caller-reserved area.
    pub fn spill_size(&self) -> usize {
        self.spill_size
    }

    /// The size of the whole caller-reserved area.
    pub fn fp(&self) -> usize {
        self.fp
    }
}

impl<R: fmt::Display + Copy> fmt::Display for FunctionLayout<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}: fp={}", self.conv, self.fty, self.fp)?;
        for (kind, params) in [("arg", &self.args), ("ret", &self.rets)] {
            for p in params {
                write!(f, "  {kind}{} {}: ", p.val, p.ty)?;
                match p.loc {
                    ParamLoc::Reg { reg, spill: Some(s) } => write!(f, "{reg} (spill {s})")?,
                    ParamLoc::Reg { reg, spill: None } => write!(f, "{reg}")?,
                    ParamLoc::Stack(off) => write!(f, "[{off}]")?,
                }
                writeln!(f, "{}", if p.is_pointer { " ptr" } else { "" })?;
            }
        }
        Ok(())
    }
}

/// Classify the function type `ty` against `conv`. Fails with
/// [CompilationError::InternalError] if `ty` is not a [Ty::Func].
pub fn new_function_layout<R: Copy>(
    conv: &'static CallConv<R>,
    ty: &Ty,
) -> Result<FunctionLayout<R>, CompilationError> {
    match ty {
        Ty::Func(fty) => classify_func(conv, fty),
        _ => Err(CompilationError::InternalError(format!(
            "can't build a function layout for non-function type {ty}"
        ))),
    }
}

pub(crate) fn classify_func<R: Copy>(
    conv: &'static CallConv<R>,
    fty: &FuncTy,
) -> Result<FunctionLayout<R>, CompilationError> {
    let mut stack = AbstractStack::default();
    let mut args = classify(conv, conv.int_args, conv.float_args, &fty.args, &mut stack)?;
    let stack_arg_size = stack.align(conv.word);
    if conv.spill_slots {
        for p in args.iter_mut() {
            if let ParamLoc::Reg { spill, .. } = &mut p.loc {
                *spill = Some(stack.slot(conv.word, conv.word));
            }
        }
    }
    let spill_size = stack.size() - stack_arg_size;
    let arg_size = fty
        .args
        .iter()
        .enumerate()
        .map(|(val, ty)| {
            let on_stack = args.iter().any(|p| p.val == val && !p.in_register());
            if on_stack {
                ty.size().next_multiple_of(conv.word)
            } else {
                ty.size()
            }
        })
        .sum();
    let rets = classify(conv, conv.int_rets, conv.float_rets, &fty.rets, &mut stack)?;
    let fp = stack.align(conv.word);
    Ok(FunctionLayout {
        conv: conv.name,
        fty: fty.clone(),
        args,
        rets,
        stack_arg_size,
        spill_size,
        arg_size,
        fp,
    })
}

/// Assign each value in `tys` to registers from `int_regs` / `float_regs` or to a slot in `stack`.
/// A value is never split: either all of its components go in registers or all go on the stack.
fn classify<R: Copy>(
    conv: &CallConv<R>,
    int_regs: &[R],
    float_regs: &[R],
    tys: &[Ty],
    stack: &mut AbstractStack,
) -> Result<Vec<Parameter<R>>, CompilationError> {
    let mut icur = 0;
    let mut fcur = 0;
    let mut params = Vec::with_capacity(tys.len());
    for (val, ty) in tys.iter().enumerate() {
        let comps = ty.components()?;
        if comps.is_empty() {
            params.push(Parameter {
                val,
                loc: ParamLoc::Stack(stack.size()),
                is_pointer: false,
                float: FloatKind::None,
                ty: ty.clone(),
            });
            continue;
        }
        if let Some(limit) = conv.by_ref_above {
            if comps.len() > 1 && ty.size() > limit {
                return Err(CompilationError::Unsupported(format!(
                    "{ty} is passed by reference in the {} calling convention",
                    conv.name
                )));
            }
        }

        let nfloat = comps
            .iter()
            .filter(|c| FloatKind::of(&c.ty) != FloatKind::None)
            .count();
        let nint = comps.len() - nfloat;
        if icur + nint <= int_regs.len() && fcur + nfloat <= float_regs.len() {
            for c in comps {
                let float = FloatKind::of(&c.ty);
                let reg = if float == FloatKind::None {
                    icur += 1;
                    int_regs[icur - 1]
                } else {
                    fcur += 1;
                    float_regs[fcur - 1]
                };
                params.push(Parameter {
                    val,
                    loc: ParamLoc::Reg { reg, spill: None },
                    is_pointer: c.ty.is_pointer(),
                    float,
                    ty: c.ty,
                });
            }
        } else {
            if conv.exhaust_on_spill && comps.len() > 1 {
                icur = int_regs.len();
            }
            let base = stack.slot(ty.size(), conv.word);
            for c in comps {
                params.push(Parameter {
                    val,
                    loc: ParamLoc::Stack(base + c.off),
                    is_pointer: c.ty.is_pointer(),
                    float: FloatKind::of(&c.ty),
                    ty: c.ty,
                });
            }
        }
    }
    Ok(params)
}
