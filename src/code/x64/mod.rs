//! Raw x86-64 encodings for the control transfers a hook needs

/// Length of `jmp rel32`
pub const JMP_REL_LEN: usize = 5;
/// Length of `call rel32`
pub const CALL_REL_LEN: usize = 5;
/// Length of [`jmp_abs`]: `jmp [rip + 0]` followed by the target
pub const JMP_ABS_LEN: usize = 6 + 8;
/// Length of [`call_abs`]: `call [rip + 2]`, `jmp short +8`, then the target
pub const CALL_ABS_LEN: usize = 6 + 2 + 8;

/// Opcode of `jmp rel32`
pub const JMP_REL32: u8 = 0xe9;
/// Opcode of `call rel32`
pub const CALL_REL32: u8 = 0xe8;
/// `ret`
pub const RET: u8 = 0xc3;
/// Length of [`lea_rsp`]
pub const LEA_RSP_LEN: usize = 5;

/// `lea rsp, [rsp + delta]`, moving the stack pointer without touching the flags
pub fn lea_rsp(delta: i8) -> [u8; LEA_RSP_LEN] {
    [0x48, 0x8d, 0x64, 0x24, delta as u8]
}

/// Generates an absolute jump to a specified address and returns bytecode
pub fn jmp_abs(target: u64) -> [u8; JMP_ABS_LEN] {
    let mut code = [0u8; JMP_ABS_LEN];
    code[..6].copy_from_slice(&[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
    code[6..].copy_from_slice(&target.to_le_bytes());
    code
}

/// Generates an absolute call that works from any address.
///
/// The return address lands on a short jump that skips the literal.
pub fn call_abs(target: u64) -> [u8; CALL_ABS_LEN] {
    let mut code = [0u8; CALL_ABS_LEN];
    code[..8].copy_from_slice(&[0xff, 0x15, 0x02, 0x00, 0x00, 0x00, 0xeb, 0x08]);
    code[8..].copy_from_slice(&target.to_le_bytes());
    code
}

/// Displacement of a rel32 branch whose next instruction starts at `next`, if it fits
pub fn rel32(next: u64, target: u64) -> Option<i32> {
    i32::try_from(target.wrapping_sub(next) as i64).ok()
}

/// Encodes a `jmp rel32` placed at `from`
pub fn jmp_rel(from: u64, to: u64) -> Option<[u8; JMP_REL_LEN]> {
    branch_rel(JMP_REL32, from, to)
}

/// Encodes a `call rel32` placed at `from`
pub fn call_rel(from: u64, to: u64) -> Option<[u8; CALL_REL_LEN]> {
    branch_rel(CALL_REL32, from, to)
}

/// Shared encoding of the one-byte-opcode rel32 branches
fn branch_rel(opcode: u8, from: u64, to: u64) -> Option<[u8; 5]> {
    let disp = rel32(from.wrapping_add(5), to)?;
    let mut code = [opcode, 0, 0, 0, 0];
    code[1..].copy_from_slice(&disp.to_le_bytes());
    Some(code)
}

/// Recommended multi-byte NOP forms, indexed by length - 1
const NOPS: [&[u8]; 9] = [
    &[0x90],
    &[0x66, 0x90],
    &[0x0f, 0x1f, 0x00],
    &[0x0f, 0x1f, 0x40, 0x00],
    &[0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x0f, 0x1f, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

/// Padding of exactly `len` bytes using as few instructions as possible
pub fn nops(len: usize) -> Vec<u8> {
    let mut code = Vec::with_capacity(len);
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(NOPS.len());
        code.extend_from_slice(NOPS[n - 1]);
        remaining -= n;
    }
    code
}
