//! Call stubs: calling foreign functions from JITted code.
//!
//! A stub is entered under the internal convention with a ccall [Frame]. It moves the arguments
//! to where AAPCS64 expects them, calls the foreign function, and moves the results back:
//!
//! ```text
//! entry:  stack check            (b.ls grow)
//!         prologue               (register pointer arguments parked in stack-mapped slots)
//!         internal -> AAPCS64 arguments
//!         mov x16, #addr
//!         blr x16
//!         AAPCS64 -> internal return values
//!         epilogue
//! grow:   save arguments, call the growth routine, reload arguments, b entry
//! ```
//!
//! While the foreign function runs, every pointer argument is either in an AAPCS64 argument
//! location or in a slot covered by the frame's stack maps.

use super::{
    asm::{Asm, Op},
    frame::Frame,
    operand::Operand,
    reg::Reg,
};
use crate::{compile::CompilationError, config::Config, log};

/// Build the stub which calls the foreign function at `addr` with the signature of `frame`,
/// assuming the function needs at most `max_stack` bytes of stack (or the configured default,
/// if that is larger).
pub fn build_stub(
    cfg: &Config,
    addr: usize,
    frame: &Frame,
    max_stack: usize,
) -> Result<Asm, CompilationError> {
    if !frame.ccall() {
        return Err(CompilationError::InternalError(format!(
            "call stub for {} built with a non-ccall frame",
            frame.layout().fty()
        )));
    }
    let mut asm = Asm::new();
    let entry = asm.mk_label();
    let grow = asm.mk_label();

    asm.attach_label(entry);
    frame.emit_stack_check(&mut asm, grow, max_stack.max(cfg.default_max_stack))?;
    frame.emit_prologue(&mut asm)?;
    frame.emit_exchange_args(&mut asm)?;
    asm.push(Op::Mov, &[Reg::X16.into(), Operand::ImmPtr(addr)]);
    asm.push(Op::Blr, &[Reg::X16.into()]);
    frame.emit_exchange_rets(&mut asm)?;
    frame.emit_restore_regs(&mut asm)?;
    frame.emit_epilogue(&mut asm)?;

    asm.attach_label(grow);
    frame.emit_grow_stack(&mut asm, entry, cfg.growth_routine)?;
    Ok(asm)
}

/// Synthesise the machine code of a call stub: see [build_stub].
pub(crate) fn call_c(
    cfg: &Config,
    addr: usize,
    frame: &Frame,
    max_stack: usize,
) -> Result<Vec<u8>, CompilationError> {
    let asm = build_stub(cfg, addr, frame, max_stack)?;
    if log::should_log_asm() {
        log::log_asm(&format!(
            "--- Begin call stub {addr:#x} {} ---\n{}\n--- End call stub ---",
            frame.layout().fty(),
            asm.disassemble()
        ));
    }
    asm.assemble()
}
