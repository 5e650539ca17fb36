//! Code generation for the ABI bridge.
//!
//! The architecture-independent parts (argument classification, function layouts and their
//! cache, parallel move resolution) live directly in this module; each supported architecture
//! provides an implementation of [Backend].

use crate::{
    config::Config,
    log::Log,
    ty::{FuncTy, Ty},
};
use std::{error::Error, sync::Arc};
use strum::Display;
use thiserror::Error;

pub mod aarch64;
pub mod abi;
mod abs_stack;
pub(crate) mod layout_cache;
pub mod parmove;

use abi::FunctionLayout;

/// A failure to produce code.
#[derive(Error, Debug, PartialEq)]
pub enum CompilationError {
    /// There is no backend for this architecture. Higher layers should fall back to a non-JIT
    /// implementation.
    #[error("No JIT backend available for {0}")]
    NotAvailable(Arch),
    /// A value kind this backend can't pass, detected when a function layout is built.
    #[error("Unsupported by this backend: {0}")]
    Unsupported(String),
    /// An encoding limit was exceeded (e.g. a branch is too far from its target).
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),
    /// The backend has been used incorrectly: this is probably a bug in the caller.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// An instruction set architecture.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum Arch {
    Aarch64,
    X86_64,
    Riscv64,
    Other,
}

impl Arch {
    /// The architecture this process is running on.
    pub fn host() -> Self {
        if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else if cfg!(target_arch = "x86_64") {
            Arch::X86_64
        } else if cfg!(target_arch = "riscv64") {
            Arch::Riscv64
        } else {
            Arch::Other
        }
    }
}

/// Per-architecture constants the codec generator needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArchConsts {
    pub ptr_size: usize,
    pub ptr_align: usize,
    /// How many integer registers the internal calling convention passes values in.
    pub int_regs: usize,
    /// How many float registers the internal calling convention passes values in.
    pub float_regs: usize,
    pub stack_align: usize,
}

/// The capabilities every architecture backend provides.
pub trait Backend: Send + Sync {
    type Reg: Copy;
    type Op;
    type Frame;

    fn consts(&self) -> ArchConsts;

    /// Resolve `mnemonic` to an opcode.
    ///
    /// # Panics
    ///
    /// If `mnemonic` is not part of this backend's vocabulary.
    fn op(&self, mnemonic: &str) -> Self::Op;

    /// Return the (cached) internal calling convention layout of the function type `ty`. Fails
    /// with [CompilationError::InternalError] if `ty` is not a [Ty::Func].
    fn function_layout(&self, ty: &Ty) -> Result<Arc<FunctionLayout<Self::Reg>>, CompilationError>;

    /// Create a frame for a function body (`ccall == false`) or a foreign call stub (`ccall ==
    /// true`) with the signature of `layout` and local slots marked as pointers by `locals`.
    fn new_frame(
        &self,
        layout: Arc<FunctionLayout<Self::Reg>>,
        locals: &[bool],
        ccall: bool,
    ) -> Result<Self::Frame, CompilationError>;

    /// Synthesise a stub which calls the foreign function at `addr` from code using the internal
    /// calling convention. `max_stack` is how much stack the foreign function may use.
    fn call_c(
        &self,
        addr: usize,
        frame: &Self::Frame,
        max_stack: usize,
    ) -> Result<Vec<u8>, CompilationError>;
}

/// Return the backend for `arch`, or [CompilationError::NotAvailable] if there isn't one.
pub fn backend_for(
    arch: Arch,
    cfg: Config,
    log: Log,
) -> Result<Arc<aarch64::Aarch64>, CompilationError> {
    match arch {
        Arch::Aarch64 => Ok(Arc::new(aarch64::Aarch64::new(cfg, log))),
        _ => Err(CompilationError::NotAvailable(arch)),
    }
}

/// Return the backend for the host, configured from the environment.
pub fn default_backend(growth_routine: usize) -> Result<Arc<aarch64::Aarch64>, Box<dyn Error>> {
    let cfg = Config::from_env(growth_routine)?;
    let log = Log::new()?;
    Ok(backend_for(Arch::host(), cfg, log)?)
}

/// Make a function type from argument and return types. Mostly useful for tests.
pub fn func_ty(args: &[Ty], rets: &[Ty]) -> Ty {
    Ty::Func(FuncTy::new(args.to_vec(), rets.to_vec()))
}
