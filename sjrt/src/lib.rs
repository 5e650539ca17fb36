//! The ABI bridge between a serialization engine's JITted codecs and the rest of the process.
//!
//! Codecs are JITted functions which call each other under an internal calling convention, and
//! call into (and are called from) native code under the platform's C convention. This crate
//! classifies function signatures against both conventions, lays out the stack frames of JITted
//! code (including the pointer maps a garbage collector needs to scan them), and synthesises the
//! stubs which call foreign functions. Only AArch64 is supported: everywhere else
//! [compile::backend_for] reports [compile::CompilationError::NotAvailable].

#![allow(clippy::upper_case_acronyms)]

pub mod compile;
pub mod config;
pub mod log;
pub mod ty;

pub use self::compile::{backend_for, default_backend, Backend, CompilationError};
pub use self::config::Config;
pub use sjsmp::StackMap;

// Backends and frames are shared between code generating threads.
static_assertions::assert_impl_all!(compile::aarch64::Aarch64: Send, Sync);
static_assertions::assert_impl_all!(compile::aarch64::frame::Frame: Send, Sync);
