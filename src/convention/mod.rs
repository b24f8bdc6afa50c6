//! # Convention
//!
//! Register names and the calling-convention facts the emitter needs
//!
//! ## Supported calling conventions
//!
//! The ABI is picked at compile time from the target OS.
//!
//! System V AMD64 (everything except Windows):
//! - volatile registers: rax, rcx, rdx, rsi, rdi, r8, r9, r10, r11, xmm0-xmm15
//! - nonvolatile registers: rbx, rbp, rsp, r12, r13, r14, r15
//! - 16-byte aligned at `call`, no shadow space
//!
//! Microsoft x64:
//! - volatile registers: rax, rcx, rdx, r8, r9, r10, r11, xmm0-xmm5
//! - nonvolatile registers: rbx, rbp, rdi, rsi, rsp, r12, r13, r14, r15, xmm6-xmm15
//! - 16-byte aligned at `call`, 32 bytes of shadow space reserved by the caller
//!
//! An optimizer that sees the whole program may keep a value in a volatile register across a call
//! once it knows the callee leaves it alone. A hook inserted at such a call site has to put those
//! registers back, which is what [`RegisterSet`] and [`VectorRegisterSet`] describe.

use std::fmt;
use std::str::FromStr;

use crate::error::HookError;

pub mod set;
pub mod sysv;
pub mod win64;

pub use set::{RegisterSet, VectorRegisterSet};

#[cfg(not(windows))]
pub use sysv as abi;
#[cfg(windows)]
pub use win64 as abi;

/// Volatile general purpose registers of the current ABI, in canonical order
pub const VOLATILE: &[Register] = abi::VOLATILE;
/// Volatile vector registers of the current ABI, in canonical order
pub const VOLATILE_VECTOR: &[VectorRegister] = abi::VOLATILE_VECTOR;
/// Stack space the caller must reserve for the callee before a `call`
pub const SHADOW_SPACE: i32 = abi::SHADOW_SPACE;
/// Required alignment of `rsp` at a `call` instruction
pub const STACK_ALIGNMENT: usize = 16;

/// A register family with a fixed hardware numbering
pub trait RegisterFile: Copy + Eq + fmt::Debug + 'static {
    /// Registers of this family that are volatile under the current ABI
    const VOLATILE: &'static [Self];

    /// Hardware encoding of the register
    fn index(self) -> u8;
    /// Looks up a register by hardware encoding
    fn from_index(index: u8) -> Option<Self>;
}

/// General purpose registers, numbered by their hardware encoding.
///
/// `rsp` is deliberately absent: the save area lives on the stack.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Register {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

/// Names indexed by hardware encoding
const GPR_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15",
];

impl Register {
    /// Lowercase assembler name
    pub fn name(self) -> &'static str {
        GPR_NAMES[self as usize]
    }
}

impl RegisterFile for Register {
    const VOLATILE: &'static [Self] = VOLATILE;

    fn index(self) -> u8 {
        self as u8
    }

    fn from_index(index: u8) -> Option<Self> {
        Some(match index {
            0 => Self::Rax,
            1 => Self::Rcx,
            2 => Self::Rdx,
            3 => Self::Rbx,
            5 => Self::Rbp,
            6 => Self::Rsi,
            7 => Self::Rdi,
            8 => Self::R8,
            9 => Self::R9,
            10 => Self::R10,
            11 => Self::R11,
            12 => Self::R12,
            13 => Self::R13,
            14 => Self::R14,
            15 => Self::R15,
            _ => return None,
        })
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Register {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        GPR_NAMES
            .iter()
            .position(|n| *n == name)
            .and_then(|i| Self::from_index(i as u8))
            .ok_or_else(|| HookError::InvalidRegister(s.trim().to_owned()))
    }
}

/// SSE registers, numbered by their hardware encoding
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum VectorRegister {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
    Xmm8 = 8,
    Xmm9 = 9,
    Xmm10 = 10,
    Xmm11 = 11,
    Xmm12 = 12,
    Xmm13 = 13,
    Xmm14 = 14,
    Xmm15 = 15,
}

/// Every vector register, indexed by hardware encoding
const XMM: [VectorRegister; 16] = [
    VectorRegister::Xmm0,
    VectorRegister::Xmm1,
    VectorRegister::Xmm2,
    VectorRegister::Xmm3,
    VectorRegister::Xmm4,
    VectorRegister::Xmm5,
    VectorRegister::Xmm6,
    VectorRegister::Xmm7,
    VectorRegister::Xmm8,
    VectorRegister::Xmm9,
    VectorRegister::Xmm10,
    VectorRegister::Xmm11,
    VectorRegister::Xmm12,
    VectorRegister::Xmm13,
    VectorRegister::Xmm14,
    VectorRegister::Xmm15,
];

impl RegisterFile for VectorRegister {
    const VOLATILE: &'static [Self] = VOLATILE_VECTOR;

    fn index(self) -> u8 {
        self as u8
    }

    fn from_index(index: u8) -> Option<Self> {
        XMM.get(index as usize).copied()
    }
}

impl fmt::Display for VectorRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xmm{}", *self as u8)
    }
}

impl FromStr for VectorRegister {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        trimmed
            .to_ascii_lowercase()
            .strip_prefix("xmm")
            .and_then(|n| n.parse::<u8>().ok())
            .and_then(Self::from_index)
            .ok_or_else(|| HookError::InvalidRegister(trimmed.to_owned()))
    }
}
