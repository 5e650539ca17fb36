//! Backend configuration.

use std::{env, error::Error};

/// The largest offset an 8-byte `ldr` can reach with an unsigned immediate.
const MAX_GUARD_OFF: u32 = 4095 * 8;

/// How the generated code interacts with the host runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// The byte offset of the stack limit in the thread state block pointed to by `x28`.
    pub stack_guard_off: u32,
    /// The address of the runtime routine which grows the current stack.
    pub growth_routine: usize,
    /// A lower bound on how much stack every foreign callee is assumed to need.
    pub default_max_stack: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_guard_off: 16,
            growth_routine: 0,
            default_max_stack: 0,
        }
    }
}

impl Config {
    /// Create a configuration for the stack growth routine at `growth_routine`, overriding the
    /// defaults with `SJ_STACK_GUARD_OFF` and `SJ_MAX_STACK` if they are set.
    pub fn from_env(growth_routine: usize) -> Result<Self, Box<dyn Error>> {
        Self::from_vars(
            growth_routine,
            env::var("SJ_STACK_GUARD_OFF").ok().as_deref(),
            env::var("SJ_MAX_STACK").ok().as_deref(),
        )
    }

    fn from_vars(
        growth_routine: usize,
        guard_off: Option<&str>,
        max_stack: Option<&str>,
    ) -> Result<Self, Box<dyn Error>> {
        let mut cfg = Config {
            growth_routine,
            ..Config::default()
        };
        if let Some(s) = guard_off {
            let off = s
                .parse::<u32>()
                .map_err(|e| format!("Invalid SJ_STACK_GUARD_OFF '{s}': {e}"))?;
            if off % 8 != 0 || off > MAX_GUARD_OFF {
                return Err(format!(
                    "SJ_STACK_GUARD_OFF must be a multiple of 8 no greater than {MAX_GUARD_OFF}"
                )
                .into());
            }
            cfg.stack_guard_off = off;
        }
        if let Some(s) = max_stack {
            cfg.default_max_stack = s
                .parse::<usize>()
                .map_err(|e| format!("Invalid SJ_MAX_STACK '{s}': {e}"))?;
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::from_vars(0x1234, None, None).unwrap();
        assert_eq!(cfg.growth_routine, 0x1234);
        assert_eq!(cfg.stack_guard_off, Config::default().stack_guard_off);
        assert_eq!(cfg.default_max_stack, 0);
    }

    #[test]
    fn overrides() {
        let cfg = Config::from_vars(0, Some("24"), Some("1024")).unwrap();
        assert_eq!(cfg.stack_guard_off, 24);
        assert_eq!(cfg.default_max_stack, 1024);
    }

    #[test]
    fn bad_values() {
        assert!(Config::from_vars(0, Some("12"), None).is_err());
        assert!(Config::from_vars(0, Some("40000"), None).is_err());
        assert!(Config::from_vars(0, Some("-8"), None).is_err());
        assert!(Config::from_vars(0, None, Some("lots")).is_err());
    }
}
