//! Type descriptors.
//!
//! The codec generator describes the values it passes around with [Ty]s. This backend only needs
//! to know the machine-level shape of a value: its size, its alignment, and which of its words are
//! pointers the garbage collector must trace.

use crate::compile::CompilationError;
use smallvec::{smallvec, SmallVec};
use std::fmt;

/// The width of a floating point value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FloatTy {
    Single,
    Double,
}

/// A value type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Ty {
    Bool,
    /// An integer of the given bit width, which must be one of 8, 16, 32, or 64.
    Int(u32),
    Float(FloatTy),
    /// A pointer the garbage collector traces.
    Ptr,
    /// A machine address the garbage collector ignores.
    RawPtr,
    /// A string: `(ptr, len)`.
    Str,
    /// A slice: `(ptr, len, cap)`.
    Slice,
    /// An interface value: `(type word, data ptr)`. Both words are traced.
    Iface,
    /// A function value: a single traced pointer.
    Func(FuncTy),
    Struct(Vec<Ty>),
    Array(Box<Ty>, usize),
}

/// A function signature. This is the key under which function layouts are cached, so it must
/// hash structurally.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FuncTy {
    pub args: Vec<Ty>,
    pub rets: Vec<Ty>,
}

impl FuncTy {
    pub fn new(args: Vec<Ty>, rets: Vec<Ty>) -> Self {
        Self { args, rets }
    }
}

/// One machine-word (or smaller) scalar part of a value, at byte offset `off` from the start of
/// that value.
#[derive(Clone, Debug, PartialEq)]
pub struct Component {
    pub off: usize,
    /// One of [Ty::Bool], [Ty::Int], [Ty::Float], [Ty::Ptr], or [Ty::RawPtr].
    pub ty: Ty,
}

impl Component {
    fn new(off: usize, ty: Ty) -> Self {
        Self { off, ty }
    }
}

impl Ty {
    /// The size of this type in bytes.
    ///
    /// # Panics
    ///
    /// If this is an [Ty::Int] of a width other than 8, 16, 32, or 64, or if the size doesn't
    /// fit in a `usize` (see [Self::checked_size]).
    pub fn size(&self) -> usize {
        self.checked_size().unwrap_or_else(|e| panic!("{e}"))
    }

    /// The size of this type in bytes, or [CompilationError::LimitExceeded] if it doesn't fit in
    /// a `usize`.
    ///
    /// # Panics
    ///
    /// If this is an [Ty::Int] of a width other than 8, 16, 32, or 64.
    pub fn checked_size(&self) -> Result<usize, CompilationError> {
        let too_big = || CompilationError::LimitExceeded(format!("{self} is too large"));
        Ok(match self {
            Ty::Bool => 1,
            Ty::Int(bitw) => match bitw {
                8 | 16 | 32 | 64 => usize::try_from(*bitw / 8).unwrap(),
                _ => panic!("Integers of width {bitw} are not supported"),
            },
            Ty::Float(FloatTy::Single) => 4,
            Ty::Float(FloatTy::Double) => 8,
            Ty::Ptr | Ty::RawPtr | Ty::Func(_) => 8,
            Ty::Str | Ty::Iface => 16,
            Ty::Slice => 24,
            Ty::Struct(fields) => {
                let mut off: usize = 0;
                for f in fields {
                    off = off
                        .checked_next_multiple_of(f.align())
                        .and_then(|x| x.checked_add(f.checked_size().ok()?))
                        .ok_or_else(too_big)?;
                }
                off.checked_next_multiple_of(self.align())
                    .ok_or_else(too_big)?
            }
            Ty::Array(elem, n) => elem
                .checked_size()?
                .checked_mul(*n)
                .ok_or_else(too_big)?,
        })
    }

    /// The alignment of this type in bytes.
    pub fn align(&self) -> usize {
        match self {
            Ty::Bool => 1,
            Ty::Int(_) | Ty::Float(_) => self.size(),
            Ty::Ptr | Ty::RawPtr | Ty::Func(_) | Ty::Str | Ty::Iface | Ty::Slice => 8,
            Ty::Struct(fields) => fields.iter().map(|f| f.align()).max().unwrap_or(1),
            Ty::Array(elem, _) => elem.align(),
        }
    }

    /// Does a value of this (scalar) type hold a traced pointer?
    pub fn is_pointer(&self) -> bool {
        matches!(self, Ty::Ptr | Ty::Func(_))
    }

    /// Decompose a value of this type into its scalar components. Zero-sized values have no
    /// components.
    ///
    /// Returns [CompilationError::Unsupported] for non-empty structs and arrays, which this
    /// backend does not know how to pass.
    pub fn components(&self) -> Result<SmallVec<[Component; 3]>, CompilationError> {
        Ok(match self {
            Ty::Bool | Ty::Int(_) | Ty::Float(_) | Ty::Ptr | Ty::RawPtr => {
                smallvec![Component::new(0, self.clone())]
            }
            Ty::Func(_) => smallvec![Component::new(0, Ty::Ptr)],
            Ty::Str => smallvec![Component::new(0, Ty::Ptr), Component::new(8, Ty::Int(64))],
            Ty::Slice => smallvec![
                Component::new(0, Ty::Ptr),
                Component::new(8, Ty::Int(64)),
                Component::new(16, Ty::Int(64))
            ],
            Ty::Iface => smallvec![Component::new(0, Ty::Ptr), Component::new(8, Ty::Ptr)],
            Ty::Struct(_) | Ty::Array(_, _) => {
                if self.checked_size()? == 0 {
                    SmallVec::new()
                } else {
                    return Err(CompilationError::Unsupported(format!(
                        "aggregate value of type {self}"
                    )));
                }
            }
        })
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Bool => write!(f, "bool"),
            Ty::Int(bitw) => write!(f, "i{bitw}"),
            Ty::Float(FloatTy::Single) => write!(f, "f32"),
            Ty::Float(FloatTy::Double) => write!(f, "f64"),
            Ty::Ptr => write!(f, "ptr"),
            Ty::RawPtr => write!(f, "rawptr"),
            Ty::Str => write!(f, "str"),
            Ty::Slice => write!(f, "slice"),
            Ty::Iface => write!(f, "iface"),
            Ty::Func(fty) => write!(f, "{fty}"),
            Ty::Struct(fields) => write!(
                f,
                "{{{}}}",
                fields
                    .iter()
                    .map(|x| x.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Ty::Array(elem, n) => write!(f, "[{elem}; {n}]"),
        }
    }
}

impl fmt::Display for FuncTy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |tys: &[Ty]| {
            tys.iter()
                .map(|x| x.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(f, "func({}) -> ({})", join(&self.args), join(&self.rets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(Ty::Bool.size(), 1);
        assert_eq!(Ty::Int(8).size(), 1);
        assert_eq!(Ty::Int(32).size(), 4);
        assert_eq!(Ty::Int(64).size(), 8);
        assert_eq!(Ty::Float(FloatTy::Single).size(), 4);
        assert_eq!(Ty::Str.size(), 16);
        assert_eq!(Ty::Slice.size(), 24);
        assert_eq!(Ty::Func(FuncTy::new(vec![], vec![])).size(), 8);
        assert_eq!(Ty::Struct(vec![]).size(), 0);
        assert_eq!(Ty::Struct(vec![Ty::Bool, Ty::Int(64), Ty::Bool]).size(), 24);
        assert_eq!(Ty::Struct(vec![Ty::Int(16), Ty::Bool]).size(), 4);
        assert_eq!(Ty::Array(Box::new(Ty::Int(32)), 3).size(), 12);
        assert_eq!(Ty::Array(Box::new(Ty::Str), 0).size(), 0);
    }

    #[test]
    fn oversized() {
        let huge = Ty::Array(Box::new(Ty::Int(64)), usize::MAX / 4);
        assert!(matches!(
            huge.checked_size(),
            Err(CompilationError::LimitExceeded(_))
        ));
        assert!(matches!(
            huge.components(),
            Err(CompilationError::LimitExceeded(_))
        ));
        let s = Ty::Struct(vec![Ty::Array(Box::new(Ty::Int(8)), usize::MAX), Ty::Int(64)]);
        assert!(matches!(
            s.checked_size(),
            Err(CompilationError::LimitExceeded(_))
        ));
        assert_eq!(Ty::Array(Box::new(Ty::Int(64)), 4).checked_size(), Ok(32));
    }

    #[test]
    fn aligns() {
        assert_eq!(Ty::Bool.align(), 1);
        assert_eq!(Ty::Int(16).align(), 2);
        assert_eq!(Ty::Struct(vec![]).align(), 1);
        assert_eq!(Ty::Struct(vec![Ty::Bool, Ty::Float(FloatTy::Double)]).align(), 8);
        assert_eq!(Ty::Array(Box::new(Ty::Int(32)), 0).align(), 4);
    }

    #[test]
    #[should_panic(expected = "Integers of width 12 are not supported")]
    fn bad_int_width() {
        Ty::Int(12).size();
    }

    #[test]
    fn components() {
        let c = Ty::Str.components().unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!((c[0].off, &c[0].ty), (0, &Ty::Ptr));
        assert_eq!((c[1].off, &c[1].ty), (8, &Ty::Int(64)));

        let c = Ty::Iface.components().unwrap();
        assert!(c.iter().all(|x| x.ty.is_pointer()));

        let c = Ty::Func(FuncTy::new(vec![Ty::Ptr], vec![])).components().unwrap();
        assert_eq!(c[0].ty, Ty::Ptr);

        assert!(Ty::Struct(vec![]).components().unwrap().is_empty());
        assert!(Ty::Struct(vec![Ty::Struct(vec![])])
            .components()
            .unwrap()
            .is_empty());
        assert!(Ty::RawPtr.components().unwrap()[0].ty != Ty::Ptr);
    }

    #[test]
    fn unsupported_aggregates() {
        match Ty::Struct(vec![Ty::Int(64)]).components() {
            Err(CompilationError::Unsupported(s)) => assert_eq!(s, "aggregate value of type {i64}"),
            x => panic!("{x:?}"),
        }
        assert!(matches!(
            Ty::Array(Box::new(Ty::Ptr), 2).components(),
            Err(CompilationError::Unsupported(_))
        ));
    }

    #[test]
    fn display() {
        let fty = FuncTy::new(vec![Ty::Int(64), Ty::Ptr], vec![Ty::Str]);
        assert_eq!(fty.to_string(), "func(i64, ptr) -> (str)");
        assert_eq!(
            Ty::Array(Box::new(Ty::Float(FloatTy::Single)), 4).to_string(),
            "[f32; 4]"
        );
    }
}
