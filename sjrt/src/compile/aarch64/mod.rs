//! The AArch64 backend.
//!
//! Two calling conventions meet here:
//!
//!   * the *internal* convention used between JITted functions: integers and pointers in
//!     `x0`..`x15`, floats in `v0`..`v15`, return values in the same registers, and a
//!     caller-reserved spill slot for every register-resident argument.
//!   * the *foreign* convention, AAPCS64: integers in `x0`..`x7`, floats in `v0`..`v7`, returns
//!     in `x0`..`x1` / `v0`..`v3`, no spill slots.
//!
//! Both conventions assume `x28` holds the current thread state, whose stack limit the stack
//! check reads. `x16`/`x17` and `v30`/`v31` are never used to pass values: they are the
//! backend's scratch registers.

use super::{
    abi::{CallConv, FunctionLayout},
    layout_cache::LayoutCache,
    ArchConsts, Backend, CompilationError,
};
use crate::{
    config::Config,
    log::{Log, Verbosity},
    ty::Ty,
};
use std::sync::Arc;

pub mod asm;
pub mod callc;
pub mod frame;
pub mod operand;
pub mod reg;
#[cfg(test)]
mod sim;

use asm::Op;
use frame::Frame;
use reg::Reg;

/// The size of a general purpose register, a pointer, and a stack slot.
pub const WORD: usize = 8;
/// `sp` must always be aligned to this many bytes.
pub const STACK_ALIGN: usize = 16;

#[rustfmt::skip]
const INTERNAL_INT: &[Reg] = &[
    Reg::X0, Reg::X1, Reg::X2, Reg::X3, Reg::X4, Reg::X5, Reg::X6, Reg::X7, Reg::X8, Reg::X9,
    Reg::X10, Reg::X11, Reg::X12, Reg::X13, Reg::X14, Reg::X15,
];
#[rustfmt::skip]
const INTERNAL_FLOAT: &[Reg] = &[
    Reg::V0, Reg::V1, Reg::V2, Reg::V3, Reg::V4, Reg::V5, Reg::V6, Reg::V7, Reg::V8, Reg::V9,
    Reg::V10, Reg::V11, Reg::V12, Reg::V13, Reg::V14, Reg::V15,
];

/// The convention JITted code uses between its own functions.
pub static INTERNAL: CallConv<Reg> = CallConv {
    name: "internal",
    int_args: INTERNAL_INT,
    float_args: INTERNAL_FLOAT,
    int_rets: INTERNAL_INT,
    float_rets: INTERNAL_FLOAT,
    word: WORD,
    spill_slots: true,
    exhaust_on_spill: false,
    by_ref_above: None,
};

/// The platform C convention.
pub static FOREIGN: CallConv<Reg> = CallConv {
    name: "aapcs64",
    int_args: &[Reg::X0, Reg::X1, Reg::X2, Reg::X3, Reg::X4, Reg::X5, Reg::X6, Reg::X7],
    float_args: &[Reg::V0, Reg::V1, Reg::V2, Reg::V3, Reg::V4, Reg::V5, Reg::V6, Reg::V7],
    int_rets: &[Reg::X0, Reg::X1],
    float_rets: &[Reg::V0, Reg::V1, Reg::V2, Reg::V3],
    word: WORD,
    spill_slots: false,
    exhaust_on_spill: true,
    by_ref_above: Some(16),
};

/// The AArch64 backend. One instance is shared by every thread generating code.
pub struct Aarch64 {
    cfg: Config,
    log: Log,
    layouts: LayoutCache<Reg>,
}

impl Aarch64 {
    pub fn new(cfg: Config, log: Log) -> Self {
        Self {
            cfg,
            log,
            layouts: LayoutCache::new(&INTERNAL),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// How many distinct signatures have been classified so far.
    pub fn layouts_classified(&self) -> usize {
        self.layouts.classified()
    }
}

impl Backend for Aarch64 {
    type Reg = Reg;
    type Op = Op;
    type Frame = Frame;

    fn consts(&self) -> ArchConsts {
        ArchConsts {
            ptr_size: WORD,
            ptr_align: WORD,
            int_regs: INTERNAL.int_args.len(),
            float_regs: INTERNAL.float_args.len(),
            stack_align: STACK_ALIGN,
        }
    }

    fn op(&self, mnemonic: &str) -> Op {
        asm::as_op(mnemonic)
    }

    fn function_layout(&self, ty: &Ty) -> Result<Arc<FunctionLayout<Reg>>, CompilationError> {
        let Ty::Func(fty) = ty else {
            return Err(CompilationError::InternalError(format!(
                "layout requested for non-function type {ty}"
            )));
        };
        self.layouts
            .get(fty, |l| {
                if self.log.enabled(Verbosity::Layout) {
                    self.log
                        .log(Verbosity::Layout, &format!("new function layout:\n{l}"))
                }
            })
            .inspect_err(|e| {
                self.log
                    .log(Verbosity::Warning, &format!("can't lay out {fty}: {e}"))
            })
    }

    fn new_frame(
        &self,
        layout: Arc<FunctionLayout<Reg>>,
        locals: &[bool],
        ccall: bool,
    ) -> Result<Frame, CompilationError> {
        Frame::new(&self.cfg, layout, locals, ccall).inspect_err(|e| {
            self.log
                .log(Verbosity::Warning, &format!("can't create frame: {e}"))
        })
    }

    fn call_c(
        &self,
        addr: usize,
        frame: &Frame,
        max_stack: usize,
    ) -> Result<Vec<u8>, CompilationError> {
        match callc::call_c(&self.cfg, addr, frame, max_stack) {
            Ok(code) => {
                self.log.log(
                    Verbosity::Stub,
                    &format!(
                        "call stub for {addr:#x} {}: {} bytes",
                        frame.layout().fty(),
                        code.len()
                    ),
                );
                Ok(code)
            }
            Err(e) => {
                self.log.log(
                    Verbosity::Error,
                    &format!("call stub for {addr:#x} failed: {e}"),
                );
                Err(e)
            }
        }
    }
}
