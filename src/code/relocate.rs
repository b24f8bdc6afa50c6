//! Moves the instructions a patch overwrites to a new address
//!
//! The displaced instructions are decoded once, then re-encoded with iced's `BlockEncoder` at the
//! address they will run from, so relative branches and `rip` relative operands still reach the
//! same targets.

use std::slice;

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderError, DecoderOptions, Instruction,
    InstructionBlock,
};

use crate::error::{HookError, Result};

/// Upper bound on how much one instruction can grow when re-encoded far away
/// (`jcc` over `jmp [rip]` plus its 8-byte literal, rounded up)
const MAX_GROWTH: usize = 24;

/// Whole instructions covering a patch region
#[derive(Debug, Clone)]
pub struct Displaced {
    /// Where the instructions originally live
    address: u64,
    /// Original bytes
    bytes: Vec<u8>,
    /// Decoded instructions
    instructions: Vec<Instruction>,
}

impl Displaced {
    /// Decodes the `len` bytes at `address`
    ///
    /// # Safety
    ///
    /// `address` must be readable for `len` bytes
    pub unsafe fn read(address: usize, len: usize) -> Result<Self> {
        let bytes = slice::from_raw_parts(address as *const u8, len);
        Self::decode(bytes, address as u64)
    }

    /// Decodes `bytes` as if they were located at `address`.
    ///
    /// Every byte must belong to a whole instruction: a region that ends inside an instruction
    /// cannot be moved.
    pub fn decode(bytes: &[u8], address: u64) -> Result<Self> {
        let mut decoder = Decoder::with_ip(64, bytes, address, DecoderOptions::NONE);
        let mut instructions = Vec::new();
        let mut covered = 0;
        let mut instr = Instruction::default();
        while decoder.can_decode() {
            decoder.decode_out(&mut instr);
            if instr.is_invalid() {
                return Err(match decoder.last_error() {
                    DecoderError::NoMoreBytes => HookError::SplitInstruction {
                        address: address as usize,
                        len: bytes.len(),
                        covered,
                    },
                    _ => HookError::Decode(address as usize + covered),
                });
            }
            covered += instr.len();
            instructions.push(instr);
        }
        Ok(Self {
            address,
            bytes: bytes.to_vec(),
            instructions,
        })
    }

    /// Original location
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Number of displaced bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing was displaced
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Original bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decoded instructions
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Destination of the first instruction, if it is a direct near call
    pub fn call_target(&self) -> Option<u64> {
        self.instructions
            .first()
            .filter(|instr| instr.is_call_near())
            .map(Instruction::near_branch_target)
    }

    /// Destination of the displaced code when it is nothing but one direct call.
    ///
    /// Calling that destination has the same effect as running the displaced code as a function.
    pub fn lone_call_target(&self) -> Option<u64> {
        match self.instructions.len() {
            1 => self.call_target(),
            _ => None,
        }
    }

    /// Most bytes [`Displaced::encode`] can produce
    pub fn max_encoded_len(&self) -> usize {
        self.bytes.len() + self.instructions.len() * MAX_GROWTH
    }

    /// Re-encodes the instructions to run from `ip`
    pub fn encode(&self, ip: u64) -> Result<Vec<u8>> {
        if ip == self.address {
            return Ok(self.bytes.clone());
        }
        let block = InstructionBlock::new(&self.instructions, ip);
        let encoded = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)?;
        Ok(encoded.code_buffer)
    }
}

#[cfg(test)]
mod tests {
    use iced_x86::Mnemonic;

    use super::*;

    /// call 0x2000 (from 0x1000); mov eax, 1
    const CALL_THEN_MOV: [u8; 10] = [0xe8, 0xfb, 0x0f, 0x00, 0x00, 0xb8, 0x01, 0x00, 0x00, 0x00];

    #[test]
    /// The displaced call still reaches its original destination after moving
    fn test_relocated_call() {
        let displaced = Displaced::decode(&CALL_THEN_MOV, 0x1000).unwrap();
        assert_eq!(displaced.instructions().len(), 2);
        assert_eq!(displaced.call_target(), Some(0x2000));

        let moved = displaced.encode(0x5000).unwrap();
        assert!(moved.len() <= displaced.max_encoded_len());
        let again = Displaced::decode(&moved, 0x5000).unwrap();
        assert_eq!(again.call_target(), Some(0x2000));
        assert_eq!(again.instructions()[1].mnemonic(), Mnemonic::Mov);
    }

    #[test]
    /// Only a region holding a single direct call can stand in for its destination
    fn test_lone_call_target() {
        let lone = Displaced::decode(&CALL_THEN_MOV[..5], 0x1000).unwrap();
        assert_eq!(lone.lone_call_target(), Some(0x2000));

        let both = Displaced::decode(&CALL_THEN_MOV, 0x1000).unwrap();
        assert_eq!(both.lone_call_target(), None);

        let mov = Displaced::decode(&CALL_THEN_MOV[5..], 0x1005).unwrap();
        assert_eq!(mov.call_target(), None);
        assert_eq!(mov.lone_call_target(), None);
    }

    #[test]
    /// A far move turns the relative call into an absolute one without losing the target
    fn test_relocated_call_far() {
        let displaced = Displaced::decode(&CALL_THEN_MOV[..5], 0x1000).unwrap();
        let far = 0x7f00_0000_0000;
        let moved = displaced.encode(far).unwrap();
        assert!(moved.len() <= displaced.max_encoded_len());
        // the literal trails the instructions, so only the call itself is decoded
        let call = Decoder::with_ip(64, &moved, far, DecoderOptions::NONE).decode();
        assert_eq!(call.mnemonic(), Mnemonic::Call);
        assert!(call.is_ip_rel_memory_operand());
        let literal = (call.ip_rel_memory_address() - far) as usize;
        assert_eq!(
            u64::from_le_bytes(moved[literal..literal + 8].try_into().unwrap()),
            0x2000
        );
    }

    #[test]
    /// rip relative operands keep pointing at the same data
    fn test_relocated_rip_relative() {
        // lea rax, [rip + 0x10]
        let lea = [0x48, 0x8d, 0x05, 0x10, 0x00, 0x00, 0x00];
        let displaced = Displaced::decode(&lea, 0x1000).unwrap();
        assert_eq!(displaced.call_target(), None);
        let moved = displaced.encode(0x3000).unwrap();
        let again = Displaced::decode(&moved, 0x3000).unwrap();
        assert_eq!(again.instructions()[0].ip_rel_memory_address(), 0x1017);
    }

    #[test]
    /// Regions ending inside an instruction are rejected with the whole-instruction length
    fn test_split_instruction() {
        assert!(matches!(
            Displaced::decode(&CALL_THEN_MOV[..4], 0x1000),
            Err(HookError::SplitInstruction { covered: 0, len: 4, .. })
        ));
        assert!(matches!(
            Displaced::decode(&CALL_THEN_MOV[..7], 0x1000),
            Err(HookError::SplitInstruction { covered: 5, len: 7, .. })
        ));
    }

    #[test]
    /// Invalid encodings are reported at the offending address
    fn test_invalid_instruction() {
        // push es does not exist in 64-bit mode
        assert!(matches!(
            Displaced::decode(&[0x90, 0x06, 0x90], 0x1000),
            Err(HookError::Decode(0x1001))
        ));
    }

    #[test]
    /// Encoding in place is a copy
    fn test_encode_in_place() {
        let displaced = Displaced::decode(&CALL_THEN_MOV, 0x1000).unwrap();
        assert_eq!(displaced.encode(0x1000).unwrap(), CALL_THEN_MOV);
    }
}
