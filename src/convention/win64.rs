//! # Win64
//!
//! Calling convention facts for the Microsoft x64 ABI

use super::{Register, VectorRegister};

/// Registers a callee is free to clobber
pub const VOLATILE: &[Register] = &[
    Register::Rax,
    Register::Rcx,
    Register::Rdx,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
];

/// xmm0-xmm5 are caller-saved, xmm6-xmm15 belong to the callee
pub const VOLATILE_VECTOR: &[VectorRegister] = &[
    VectorRegister::Xmm0,
    VectorRegister::Xmm1,
    VectorRegister::Xmm2,
    VectorRegister::Xmm3,
    VectorRegister::Xmm4,
    VectorRegister::Xmm5,
];

/// Home space for the four register arguments
pub const SHADOW_SPACE: i32 = 32;
