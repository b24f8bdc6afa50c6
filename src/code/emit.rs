//! Save/restore fragments for registers that must survive an inserted call
//!
//! The prolog reserves a stack frame and stores every selected register into it, the epilog loads
//! them back in reverse order and releases the frame. Only `rsp` relative addressing is used, so no
//! register has to be sacrificed as scratch, and `lea` keeps the flags intact.
//!
//! Vector registers are saved through their 128-bit `xmm` view only. Upper `ymm`/`zmm` lanes are
//! not preserved.

use iced_x86::code_asm::{
    self as asm, ptr, qword_ptr, xmmword_ptr, AsmRegister64, AsmRegisterXmm, CodeAssembler,
};

use crate::convention::{
    Register, RegisterSet, VectorRegister, VectorRegisterSet, SHADOW_SPACE, STACK_ALIGNMENT,
};
use crate::error::Result;

use super::CodeBuffer;

/// Bytes reserved per general purpose register
const GPR_SLOT: i32 = 8;
/// Bytes reserved per vector register
const XMM_SLOT: i32 = 16;

/// One register's place in the save area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// General purpose register at `rsp + offset`
    Gpr(Register, i32),
    /// Vector register at `rsp + offset`
    Vector(VectorRegister, i32),
}

/// A matched prolog/epilog pair.
///
/// The two fragments only make sense together, bracketing the same inserted code.
#[derive(Debug, Clone)]
pub struct NonVolatilePatch {
    /// Saves the registers
    prolog: CodeBuffer,
    /// Restores the registers
    epilog: CodeBuffer,
    /// Save order
    slots: Vec<Slot>,
    /// Stack adjustment made by the prolog
    frame: i32,
}

impl NonVolatilePatch {
    /// Generates the fragments for the given sets. [`RegisterSet::ALL`] expands to the ABI's
    /// volatile registers here.
    pub fn new(registers: RegisterSet, vectors: VectorRegisterSet) -> Result<Self> {
        let slots = layout(registers, vectors);
        if slots.is_empty() {
            return Ok(Self {
                prolog: CodeBuffer::new(),
                epilog: CodeBuffer::new(),
                slots,
                frame: 0,
            });
        }
        let frame = frame_size(&slots);

        let mut prolog = CodeAssembler::new(64)?;
        prolog.lea(asm::rsp, ptr(asm::rsp - frame))?;
        for slot in &slots {
            match *slot {
                Slot::Gpr(reg, offset) => prolog.mov(qword_ptr(asm::rsp + offset), gpr(reg))?,
                Slot::Vector(reg, offset) => {
                    prolog.movdqu(xmmword_ptr(asm::rsp + offset), xmm(reg))?
                }
            }
        }

        let mut epilog = CodeAssembler::new(64)?;
        for slot in slots.iter().rev() {
            match *slot {
                Slot::Gpr(reg, offset) => epilog.mov(gpr(reg), qword_ptr(asm::rsp + offset))?,
                Slot::Vector(reg, offset) => {
                    epilog.movdqu(xmm(reg), xmmword_ptr(asm::rsp + offset))?
                }
            }
        }
        epilog.lea(asm::rsp, ptr(asm::rsp + frame))?;

        log::debug!(
            "non-volatile patch: {} registers, {} vector registers, frame {frame:#x}",
            registers.len(),
            vectors.len()
        );

        // only rsp relative operands, so any ip will do
        Ok(Self {
            prolog: prolog.assemble(0)?.into(),
            epilog: epilog.assemble(0)?.into(),
            slots,
            frame,
        })
    }

    /// Fragment that saves the registers
    pub fn prolog(&self) -> &CodeBuffer {
        &self.prolog
    }

    /// Fragment that restores the registers
    pub fn epilog(&self) -> &CodeBuffer {
        &self.epilog
    }

    /// Splits into `(prolog, epilog)`
    pub fn into_parts(self) -> (CodeBuffer, CodeBuffer) {
        (self.prolog, self.epilog)
    }

    /// Registers in the order the prolog saves them. The epilog restores them in reverse.
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Bytes the prolog subtracts from `rsp`, and the epilog adds back
    pub fn frame_size(&self) -> i32 {
        self.frame
    }

    /// Wraps `code` between the prolog and the epilog
    pub fn bracket(&self, code: CodeBuffer) -> CodeBuffer {
        self.prolog.clone().append(code).append(self.epilog.clone())
    }
}

/// Assigns save slots. Registers are saved in canonical order, general purpose first.
/// Vector slots come first in memory so they stay 16-byte aligned.
fn layout(registers: RegisterSet, vectors: VectorRegisterSet) -> Vec<Slot> {
    let vectors: Vec<_> = vectors.iter().collect();
    let gpr_base = vectors.len() as i32 * XMM_SLOT;
    let mut slots: Vec<_> = registers
        .iter()
        .enumerate()
        .map(|(i, reg)| Slot::Gpr(reg, gpr_base + i as i32 * GPR_SLOT))
        .collect();
    slots.extend(
        vectors
            .into_iter()
            .enumerate()
            .map(|(i, reg)| Slot::Vector(reg, i as i32 * XMM_SLOT)),
    );
    slots
}

/// Size of the save area, keeping `rsp` aligned for the call it brackets
fn frame_size(slots: &[Slot]) -> i32 {
    let raw: i32 = slots
        .iter()
        .map(|slot| match slot {
            Slot::Gpr(..) => GPR_SLOT,
            Slot::Vector(..) => XMM_SLOT,
        })
        .sum();
    let align = STACK_ALIGNMENT as i32;
    (raw + align - 1) / align * align
}

/// Calls `hook` from anywhere in the address space, reserving the ABI's shadow space around it
pub fn dispatch(hook: u64) -> Result<CodeBuffer> {
    let mut code = CodeBuffer::new();
    if SHADOW_SPACE == 0 {
        code.call_abs(hook);
        return Ok(code);
    }
    let mut reserve = CodeAssembler::new(64)?;
    reserve.lea(asm::rsp, ptr(asm::rsp - SHADOW_SPACE))?;
    let mut release = CodeAssembler::new(64)?;
    release.lea(asm::rsp, ptr(asm::rsp + SHADOW_SPACE))?;
    code.push(&reserve.assemble(0)?)
        .call_abs(hook)
        .push(&release.assemble(0)?);
    Ok(code)
}

/// Maps a register to its assembler operand
fn gpr(reg: Register) -> AsmRegister64 {
    match reg {
        Register::Rax => asm::rax,
        Register::Rcx => asm::rcx,
        Register::Rdx => asm::rdx,
        Register::Rbx => asm::rbx,
        Register::Rbp => asm::rbp,
        Register::Rsi => asm::rsi,
        Register::Rdi => asm::rdi,
        Register::R8 => asm::r8,
        Register::R9 => asm::r9,
        Register::R10 => asm::r10,
        Register::R11 => asm::r11,
        Register::R12 => asm::r12,
        Register::R13 => asm::r13,
        Register::R14 => asm::r14,
        Register::R15 => asm::r15,
    }
}

/// Maps a vector register to its assembler operand
fn xmm(reg: VectorRegister) -> AsmRegisterXmm {
    match reg {
        VectorRegister::Xmm0 => asm::xmm0,
        VectorRegister::Xmm1 => asm::xmm1,
        VectorRegister::Xmm2 => asm::xmm2,
        VectorRegister::Xmm3 => asm::xmm3,
        VectorRegister::Xmm4 => asm::xmm4,
        VectorRegister::Xmm5 => asm::xmm5,
        VectorRegister::Xmm6 => asm::xmm6,
        VectorRegister::Xmm7 => asm::xmm7,
        VectorRegister::Xmm8 => asm::xmm8,
        VectorRegister::Xmm9 => asm::xmm9,
        VectorRegister::Xmm10 => asm::xmm10,
        VectorRegister::Xmm11 => asm::xmm11,
        VectorRegister::Xmm12 => asm::xmm12,
        VectorRegister::Xmm13 => asm::xmm13,
        VectorRegister::Xmm14 => asm::xmm14,
        VectorRegister::Xmm15 => asm::xmm15,
    }
}
