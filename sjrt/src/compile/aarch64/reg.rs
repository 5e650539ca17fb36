//! AArch64 registers.

use strum::{Display, EnumCount, EnumString, FromRepr};

/// An AArch64 register. General purpose registers are always used in their 64-bit (`x`) form;
/// SIMD/FP registers are named `v` here and displayed as `s` or `d` according to how an
/// instruction uses them.
#[repr(u8)]
#[derive(
    Clone, Copy, Debug, Display, EnumCount, EnumString, FromRepr, Hash, PartialEq, Eq, PartialOrd, Ord,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Reg {
    X0, X1, X2, X3, X4, X5, X6, X7, X8, X9, X10, X11, X12, X13, X14, X15, X16, X17, X18, X19,
    X20, X21, X22, X23, X24, X25, X26, X27, X28,
    #[strum(to_string = "x29", serialize = "fp")]
    X29,
    #[strum(to_string = "x30", serialize = "lr")]
    X30,
    Sp,
    Xzr,
    V0, V1, V2, V3, V4, V5, V6, V7, V8, V9, V10, V11, V12, V13, V14, V15, V16, V17, V18, V19,
    V20, V21, V22, V23, V24, V25, V26, V27, V28, V29, V30, V31,
}

impl Reg {
    /// Is this a SIMD/FP register?
    pub fn is_float(self) -> bool {
        self >= Reg::V0
    }

    /// Is this a general purpose register (including `sp` and `xzr`)?
    pub fn is_gp(self) -> bool {
        !self.is_float()
    }

    /// The 5-bit register number used in instruction encodings. `sp` and `xzr` share 31: which
    /// one an encoding means depends on the instruction.
    pub fn num(self) -> u32 {
        let r = self as u32;
        match self {
            Reg::Sp | Reg::Xzr => 31,
            _ if self.is_float() => r - Reg::V0 as u32,
            _ => r,
        }
    }

    /// Return the `i`th general purpose register.
    ///
    /// # Panics
    ///
    /// If `i > 30`.
    pub fn x(i: u32) -> Self {
        assert!(i <= 30);
        Reg::from_repr(u8::try_from(i).unwrap()).unwrap()
    }

    /// Return the `i`th SIMD/FP register.
    ///
    /// # Panics
    ///
    /// If `i > 31`.
    pub fn v(i: u32) -> Self {
        assert!(i <= 31);
        Reg::from_repr(u8::try_from(i).unwrap() + Reg::V0 as u8).unwrap()
    }

    /// This register's name when an instruction uses it as a 32-bit float.
    pub fn s_name(self) -> String {
        format!("s{}", self.num())
    }

    /// This register's name when an instruction uses it as a 64-bit float.
    pub fn d_name(self) -> String {
        format!("d{}", self.num())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn names() {
        assert_eq!(Reg::from_str("x0").unwrap(), Reg::X0);
        assert_eq!(Reg::from_str("X17").unwrap(), Reg::X17);
        assert_eq!(Reg::from_str("fp").unwrap(), Reg::X29);
        assert_eq!(Reg::from_str("lr").unwrap(), Reg::X30);
        assert_eq!(Reg::from_str("sp").unwrap(), Reg::Sp);
        assert_eq!(Reg::from_str("v31").unwrap(), Reg::V31);
        assert!(Reg::from_str("x31").is_err());
        assert_eq!(Reg::X29.to_string(), "x29");
        assert_eq!(Reg::V3.to_string(), "v3");
        assert_eq!(Reg::V3.d_name(), "d3");
        assert_eq!(Reg::COUNT, 65);
    }

    #[test]
    fn numbers() {
        for i in 0..=30 {
            assert_eq!(Reg::x(i).num(), i);
            assert!(Reg::x(i).is_gp());
        }
        for i in 0..=31 {
            assert_eq!(Reg::v(i).num(), i);
            assert!(Reg::v(i).is_float());
        }
        assert_eq!(Reg::Sp.num(), 31);
        assert_eq!(Reg::Xzr.num(), 31);
        assert!(Reg::Sp.is_gp());
    }
}
