//! # System V
//!
//! Calling convention facts for the System V AMD64 ABI

use super::{Register, VectorRegister};

/// Registers a callee is free to clobber
pub const VOLATILE: &[Register] = &[
    Register::Rax,
    Register::Rcx,
    Register::Rdx,
    Register::Rsi,
    Register::Rdi,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
];

/// Every xmm register is caller-saved
pub const VOLATILE_VECTOR: &[VectorRegister] = &super::XMM;

/// No shadow space; the red zone is dead at a call site because `call` itself writes below `rsp`
pub const SHADOW_SPACE: i32 = 0;
