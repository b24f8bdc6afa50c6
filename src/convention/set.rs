//! # Register sets
//!
//! Sets of registers a hook must leave untouched

use std::fmt;
use std::hash::{Hash, Hasher};
use std::iter::FromIterator;
use std::marker::PhantomData;
use std::ops::BitOr;
use std::str::FromStr;

use crate::error::HookError;

use super::{Register, RegisterFile, VectorRegister};

/// Set of general purpose registers to preserve across a hook
pub type RegisterSet = Set<Register>;
/// Set of vector registers to preserve across a hook.
///
/// Only the low 128 bits (the `xmm` view) are saved. The upper halves of `ymm`/`zmm` registers
/// are volatile under SysV as well, so a hook using AVX must not touch them, or the caller must
/// not keep values there across the call.
pub type VectorRegisterSet = Set<VectorRegister>;

/// A set over one register family.
///
/// [`Set::ALL`] is a sentinel. It is only expanded against the ABI's volatile list when the set is
/// resolved or queried, so the same value means "every volatile register" on every platform.
/// Equality compares the selected registers, so `ALL == ALL.resolve()`.
#[derive(Clone, Copy)]
pub struct Set<R> {
    /// One bit per hardware encoding
    bits: u16,
    /// Sentinel for every volatile register
    all: bool,
    /// Register family
    _file: PhantomData<R>,
}

impl<R: RegisterFile> Set<R> {
    /// Preserve nothing
    pub const NONE: Self = Self::from_bits(0, false);
    /// Preserve every volatile register of the ABI
    pub const ALL: Self = Self::from_bits(0, true);

    /// Internal constructor
    const fn from_bits(bits: u16, all: bool) -> Self {
        Self {
            bits,
            all,
            _file: PhantomData,
        }
    }

    /// Bitmask of the ABI's volatile registers
    fn volatile_bits() -> u16 {
        R::VOLATILE
            .iter()
            .fold(0, |bits, r| bits | 1 << r.index())
    }

    /// Effective bitmask, with the sentinel expanded
    fn effective_bits(&self) -> u16 {
        if self.all {
            self.bits | Self::volatile_bits()
        } else {
            self.bits
        }
    }

    /// Whether this is the [`Set::ALL`] sentinel
    pub fn is_all(&self) -> bool {
        self.all
    }

    /// Whether no register is selected
    pub fn is_empty(&self) -> bool {
        self.effective_bits() == 0
    }

    /// Number of selected registers
    pub fn len(&self) -> usize {
        self.effective_bits().count_ones() as usize
    }

    /// Membership test
    pub fn contains(&self, reg: R) -> bool {
        self.effective_bits() & (1 << reg.index()) != 0
    }

    /// Adds a register
    pub fn with(self, reg: R) -> Self {
        Self::from_bits(self.bits | 1 << reg.index(), self.all)
    }

    /// Union of two sets
    pub fn union(self, other: Self) -> Self {
        Self::from_bits(self.bits | other.bits, self.all || other.all)
    }

    /// Expands the [`Set::ALL`] sentinel into the registers it stands for
    pub fn resolve(&self) -> Self {
        Self::from_bits(self.effective_bits(), false)
    }

    /// Selected registers in canonical (hardware encoding) order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = R> + Clone {
        let bits = self.effective_bits();
        (0..16u8)
            .filter(move |i| bits & (1 << i) != 0)
            .filter_map(R::from_index)
    }
}

impl<R: RegisterFile> Default for Set<R> {
    fn default() -> Self {
        Self::NONE
    }
}

impl<R: RegisterFile> PartialEq for Set<R> {
    fn eq(&self, other: &Self) -> bool {
        self.effective_bits() == other.effective_bits()
    }
}

impl<R: RegisterFile> Eq for Set<R> {}

impl<R: RegisterFile> Hash for Set<R> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.effective_bits().hash(state);
    }
}

impl<R: RegisterFile> BitOr for Set<R> {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl<R: RegisterFile> From<R> for Set<R> {
    fn from(reg: R) -> Self {
        Self::NONE.with(reg)
    }
}

impl<R: RegisterFile> From<&[R]> for Set<R> {
    fn from(regs: &[R]) -> Self {
        regs.iter().copied().collect()
    }
}

impl<R: RegisterFile, const N: usize> From<[R; N]> for Set<R> {
    fn from(regs: [R; N]) -> Self {
        regs.into_iter().collect()
    }
}

impl<R: RegisterFile> FromIterator<R> for Set<R> {
    fn from_iter<I: IntoIterator<Item = R>>(iter: I) -> Self {
        iter.into_iter().fold(Self::NONE, Self::with)
    }
}

impl<R: RegisterFile + fmt::Display> fmt::Debug for Set<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.all && self.bits == 0 {
            return f.write_str("ALL");
        }
        f.debug_set().entries(self.iter().map(|r| r.to_string())).finish()
    }
}

impl<R: RegisterFile + fmt::Display> fmt::Display for Set<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.all && self.bits == 0 {
            return f.write_str("all");
        }
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<_> = self.iter().map(|r| r.to_string()).collect();
        f.write_str(&names.join(","))
    }
}

/// Parses `all`, `none`, or a comma separated list of register names
impl<R> FromStr for Set<R>
where
    R: RegisterFile + FromStr<Err = HookError>,
{
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self::ALL);
        }
        if s.is_empty() || s.eq_ignore_ascii_case("none") {
            return Ok(Self::NONE);
        }
        s.split(',')
            .map(|name| {
                let name = name.trim();
                if name.eq_ignore_ascii_case("all") || name.eq_ignore_ascii_case("none") {
                    Err(HookError::InvalidRegister(name.to_owned()))
                } else {
                    name.parse::<R>()
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::convention::{VOLATILE, VOLATILE_VECTOR};

    #[test]
    /// The sentinel expands to the ABI's volatile list and nothing else
    fn test_all_expands_to_volatile() {
        let all = RegisterSet::ALL;
        assert!(all.is_all());
        assert_eq!(all.iter().collect::<Vec<_>>(), VOLATILE);
        assert_eq!(all.len(), VOLATILE.len());
        assert!(!all.contains(Register::Rbx));
        assert!(!all.resolve().is_all());
        assert_eq!(all.resolve().iter().collect::<Vec<_>>(), VOLATILE);

        assert_eq!(
            VectorRegisterSet::ALL.iter().collect::<Vec<_>>(),
            VOLATILE_VECTOR
        );
    }

    #[test]
    /// Sets are equal when they select the same registers, sentinel or not
    fn test_eq_resolved() {
        assert_eq!(RegisterSet::ALL, RegisterSet::ALL.resolve());
        assert_eq!(VectorRegisterSet::ALL, VectorRegisterSet::ALL.resolve());
        assert_eq!(RegisterSet::ALL, VOLATILE.iter().copied().collect::<RegisterSet>());
        assert_ne!(RegisterSet::ALL, RegisterSet::NONE);

        let hashes: HashSet<_> = [RegisterSet::ALL, RegisterSet::ALL.resolve()].into();
        assert_eq!(hashes.len(), 1);
    }

    #[test]
    /// NONE is empty and is the default
    fn test_none() {
        assert!(RegisterSet::NONE.is_empty());
        assert_eq!(RegisterSet::default(), RegisterSet::NONE);
        assert_eq!(RegisterSet::NONE.iter().count(), 0);
    }

    #[test]
    /// Iteration is canonical regardless of insertion order
    fn test_canonical_order() {
        let set = RegisterSet::from([Register::R11, Register::Rax, Register::Rdi, Register::Rcx]);
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            [Register::Rax, Register::Rcx, Register::Rdi, Register::R11]
        );
        assert_eq!(
            set.iter().rev().collect::<Vec<_>>(),
            [Register::R11, Register::Rdi, Register::Rcx, Register::Rax]
        );
    }

    #[test]
    /// Union keeps both sides and the sentinel
    fn test_union() {
        let a = RegisterSet::from(Register::Rax);
        let b = RegisterSet::from(Register::R12);
        let both = a | b;
        assert!(both.contains(Register::Rax));
        assert!(both.contains(Register::R12));
        assert_eq!(both.len(), 2);

        // explicit non-volatile registers survive a union with the sentinel
        let wide = RegisterSet::ALL | b;
        assert!(wide.contains(Register::R12));
        assert_eq!(wide.len(), VOLATILE.len() + 1);
    }

    #[test]
    /// Sets parse from configuration strings
    fn test_parse() {
        assert_eq!("all".parse::<RegisterSet>().unwrap(), RegisterSet::ALL);
        assert_eq!("None".parse::<VectorRegisterSet>().unwrap(), VectorRegisterSet::NONE);
        let set: RegisterSet = "r10, rax".parse().unwrap();
        assert_eq!(set, RegisterSet::from([Register::Rax, Register::R10]));
        assert_eq!(set.to_string(), "rax,r10");

        let vectors: VectorRegisterSet = "xmm5,xmm0".parse().unwrap();
        assert_eq!(vectors.to_string(), "xmm0,xmm5");
    }

    #[test]
    /// Malformed sets are configuration errors
    fn test_parse_malformed() {
        assert!("rax,all".parse::<RegisterSet>().is_err());
        assert!("rax,rsp".parse::<RegisterSet>().is_err());
        assert!("rax,,rcx".parse::<RegisterSet>().is_err());
        assert!("xmm0,rax".parse::<VectorRegisterSet>().is_err());
    }
}
