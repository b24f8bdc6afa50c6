//! # Code
//!
//! Relocatable machine code buffers, and the generators that fill them
//!
//! A [`CodeBuffer`] is built up from fragments and only turned into executable bytes by
//! [`CodeBuffer::finalize_at`], once every relative branch it contains can be resolved.

use std::ops::Deref;

use crate::error::{HookError, Result};

pub mod emit;
pub mod relocate;
pub mod x64;

/// Where a rel32 field points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Fixed address, resolved once the load address is known
    Absolute(u64),
    /// Offset inside the same buffer
    Offset(usize),
    /// Start of whatever is appended after this buffer
    Next,
}

/// A rel32 field that still needs a displacement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Offset of the 4 displacement bytes. The branch's next instruction starts right after them.
    pub offset: usize,
    /// Branch destination
    pub target: Target,
}

/// Growable machine code with pending relocations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeBuffer {
    /// Raw instruction bytes, rel32 fields zeroed until finalized
    bytes: Vec<u8>,
    /// Pending rel32 fields
    relocations: Vec<Relocation>,
    /// Intended load address, if already known
    address: Option<u64>,
}

impl CodeBuffer {
    /// Creates an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags the buffer with the address it will be loaded at
    pub fn at(mut self, address: u64) -> Self {
        self.address = Some(address);
        self
    }

    /// Intended load address
    pub fn address(&self) -> Option<u64> {
        self.address
    }

    /// Number of bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer holds no code
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Unresolved bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Pending relocations
    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    /// Appends position independent bytes
    pub fn push(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// Appends an instruction ending in a rel32 field pointing at `target`
    pub fn push_rel32(&mut self, opcode: &[u8], target: Target) -> &mut Self {
        self.bytes.extend_from_slice(opcode);
        self.relocations.push(Relocation {
            offset: self.bytes.len(),
            target,
        });
        self.bytes.extend_from_slice(&[0; 4]);
        self
    }

    /// `jmp rel32`
    pub fn jmp(&mut self, target: Target) -> &mut Self {
        self.push_rel32(&[x64::JMP_REL32], target)
    }

    /// `call rel32`
    pub fn call(&mut self, target: Target) -> &mut Self {
        self.push_rel32(&[x64::CALL_REL32], target)
    }

    /// Jump that reaches any address
    pub fn jmp_abs(&mut self, target: u64) -> &mut Self {
        self.push(&x64::jmp_abs(target))
    }

    /// Call that reaches any address
    pub fn call_abs(&mut self, target: u64) -> &mut Self {
        self.push(&x64::call_abs(target))
    }

    /// NOP padding
    pub fn nop(&mut self, len: usize) -> &mut Self {
        self.push(&x64::nops(len))
    }

    /// Concatenates `next` after this buffer.
    ///
    /// Branches of `self` aimed at [`Target::Next`] now land on the first byte of `next`, and the
    /// internal offsets of `next` are shifted to their new position.
    pub fn append(mut self, next: CodeBuffer) -> Self {
        let base = self.bytes.len();
        for reloc in &mut self.relocations {
            if reloc.target == Target::Next {
                reloc.target = Target::Offset(base);
            }
        }
        self.relocations
            .extend(next.relocations.into_iter().map(|reloc| Relocation {
                offset: reloc.offset + base,
                target: match reloc.target {
                    Target::Offset(offset) => Target::Offset(offset + base),
                    target => target,
                },
            }));
        self.bytes.extend(next.bytes);
        self
    }

    /// Concatenates `prev` before this buffer.
    ///
    /// The result loads at `prev`'s address, or `prev.len()` bytes before this buffer's, so code
    /// already placed by its tag stays where it was.
    pub fn prefix(self, prev: CodeBuffer) -> Self {
        let shifted = self
            .address
            .map(|address| address.wrapping_sub(prev.len() as u64));
        let mut code = prev.append(self);
        code.address = code.address.or(shifted);
        code
    }

    /// Resolves every relocation against the tagged load address
    pub fn finalize(&self) -> Result<Finalized> {
        match self.address {
            Some(address) => self.finalize_at(address),
            None => match self
                .relocations
                .iter()
                .find(|r| matches!(r.target, Target::Absolute(_)))
            {
                // without absolute targets the code is position independent
                None => self.finalize_at(0),
                Some(reloc) => Err(HookError::UnresolvedRelocation(reloc.offset)),
            },
        }
    }

    /// Resolves every relocation for code loaded at `address`
    pub fn finalize_at(&self, address: u64) -> Result<Finalized> {
        let mut bytes = self.bytes.clone();
        for reloc in &self.relocations {
            let next = address.wrapping_add(reloc.offset as u64 + 4);
            let target = match reloc.target {
                Target::Absolute(target) => target,
                Target::Offset(offset) => address.wrapping_add(offset as u64),
                Target::Next => return Err(HookError::UnresolvedRelocation(reloc.offset)),
            };
            let disp = x64::rel32(next, target).ok_or(HookError::OutOfRange {
                from: next,
                to: target,
            })?;
            bytes[reloc.offset..reloc.offset + 4].copy_from_slice(&disp.to_le_bytes());
        }
        Ok(Finalized { address, bytes })
    }
}

impl From<Vec<u8>> for CodeBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            ..Self::default()
        }
    }
}

impl From<&[u8]> for CodeBuffer {
    fn from(bytes: &[u8]) -> Self {
        bytes.to_vec().into()
    }
}

/// Fully relocated code for one load address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalized {
    /// Address the code was resolved for
    address: u64,
    /// Executable bytes
    bytes: Vec<u8>,
}

impl Finalized {
    /// Address the code must be copied to
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Executable bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl Deref for Finalized {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}
