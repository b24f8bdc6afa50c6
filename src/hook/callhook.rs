//! # Call Hook
//!
//! Redirects a call site through a trampoline that runs a hook first, while keeping chosen
//! registers intact across the hook.
//!
//! The trampoline runs, in order:
//!
//! 1. the prolog saving the selected registers
//! 2. an absolute call to the hook
//! 3. the epilog restoring them
//! 4. the instructions the redirect overwrote, re-encoded for their new address
//! 5. a jump back to the first byte after the patched region
//!
//! followed by a callable copy of the displaced instructions that ends in `ret`, which is what
//! install hands back as the original. When the displaced code is a single direct call, the call's
//! destination is handed back instead and no copy is emitted.
//!
//! The hook is therefore invoked right before the original call, with the caller's stack pointer,
//! and the original call still happens afterwards. Unwinding through a trampoline is not
//! supported.

use crate::alloc::{self, proximity::ProximityError};
use crate::code::emit::{dispatch, NonVolatilePatch};
use crate::code::relocate::Displaced;
use crate::code::x64::{self, JMP_ABS_LEN};
use crate::code::{CodeBuffer, Target};
use crate::convention::{RegisterSet, VectorRegisterSet, SHADOW_SPACE};
use crate::error::{HookError, Result};
use crate::patcher::byte::{BytePatcher, WriteStrategy};
use crate::patcher::mem::{to_mut, PermissionWrapper};
use crate::patcher::{PatchGuard, Patcher};

use super::length::PatchLength;
use super::registry::{self, PatchRecord};
use super::{Hook, HookGuard};

/// Builder for register-preserving call hooks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallHook {
    /// Registers kept intact across the hook
    registers: RegisterSet,
    /// Vector registers kept intact across the hook
    vectors: VectorRegisterSet,
    /// Bytes overwritten at the call site
    patch_len: PatchLength,
}

impl CallHook {
    /// Creates a hook that preserves nothing and patches a single `call rel32`
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the general purpose registers to preserve
    pub fn registers(mut self, registers: RegisterSet) -> Self {
        self.registers = registers;
        self
    }

    /// Sets the vector registers to preserve
    pub fn vectors(mut self, vectors: VectorRegisterSet) -> Self {
        self.vectors = vectors;
        self
    }

    /// Sets how many bytes are replaced at the call site
    pub fn patch_len(mut self, patch_len: PatchLength) -> Self {
        self.patch_len = patch_len;
        self
    }
}

unsafe impl Hook for CallHook {
    type Error = HookError;
    type Guard<'a> = CallHookGuard
    where
        Self: 'a;

    /// Hooks the call site at `source` so that `destination` runs before it
    unsafe fn hook(
        &self,
        source: *const u8,
        destination: *const u8,
    ) -> Result<Self::Guard<'_>, Self::Error> {
        let original = install(
            source,
            destination as *const (),
            self.registers,
            self.vectors,
            self.patch_len,
        )?;
        Ok(CallHookGuard {
            address: source as usize,
            original: original as usize,
            active: true,
        })
    }
}

/// Guard for an installed call hook. Dropping it uninstalls the hook.
#[derive(Debug)]
pub struct CallHookGuard {
    /// Patched call site
    address: usize,
    /// Callable original
    original: usize,
    /// Whether dropping still has to uninstall
    active: bool,
}

impl CallHookGuard {
    /// Patched call site
    pub fn address(&self) -> *const u8 {
        self.address as *const u8
    }

    /// Callable original: calling it has the effect of the instructions the hook displaced
    pub fn original(&self) -> *const () {
        self.original as *const ()
    }

    /// Keeps the hook installed for the rest of the process
    pub fn leak(mut self) -> *const () {
        self.active = false;
        self.original()
    }
}

unsafe impl HookGuard for CallHookGuard {
    type Error = HookError;

    fn unhook(mut self) -> Result<(), Self::Error> {
        self.active = false;
        // Safety: the guard only exists for a hook this crate installed at `address`
        unsafe { uninstall(self.address as *const u8) }
    }
}

impl Drop for CallHookGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        // Safety: the guard only exists for a hook this crate installed at `address`
        if let Err(e) = unsafe { uninstall(self.address as *const u8) } {
            log::error!("failed to uninstall call hook at {:#x}: {e}", self.address);
        }
    }
}

/// Installs a hook at `address`, returning a callable original.
///
/// Calling the returned pointer as an argument-less C function has the effect of the displaced
/// instructions, so a hook can run the replaced call itself. For a lone direct call it is the
/// call's destination. Otherwise it is a copy of the displaced instructions ending in `ret`, run
/// with 8 bytes (plus shadow space) of extra stack, so those instructions must not read the
/// caller's frame through `rsp`.
///
/// # Safety
///
/// - `address` must point at `len` bytes of executable code made of whole instructions
/// - `rsp` must be 16-byte aligned whenever execution reaches `address`
/// - no branch may target a byte strictly inside the patched region
/// - `hook` must be a function following the platform's C calling convention, taking no arguments
/// - unless the redirect fits in one aligned 8-byte word, no thread may execute the region while
///   it is written
pub unsafe fn install(
    address: *const u8,
    hook: *const (),
    registers: RegisterSet,
    vectors: VectorRegisterSet,
    len: PatchLength,
) -> Result<*const ()> {
    install_with(
        address,
        hook,
        registers,
        vectors,
        len,
        false,
        BytePatcher::new(),
    )
}

/// Stack the callable original reserves before running the displaced instructions: realignment
/// after its own return address, and shadow space for any call among them
const CALLABLE_FRAME: i8 = 8 + SHADOW_SPACE as i8;

/// [`install`], with the trampoline placed anywhere when `far` is set and the redirect written
/// through `patcher`
///
/// # Safety
///
/// See [`install`]
unsafe fn install_with(
    address: *const u8,
    hook: *const (),
    registers: RegisterSet,
    vectors: VectorRegisterSet,
    len: PatchLength,
    far: bool,
    patcher: BytePatcher,
) -> Result<*const ()> {
    let site = address as usize..address as usize + len.get();
    let hook = hook as usize;

    let mut registry = registry::lock();
    registry.check(&site, hook)?;

    let displaced = Displaced::read(site.start, len.get())?;
    let saver = NonVolatilePatch::new(registers, vectors)?;
    let body = saver.bracket(dispatch(hook as u64)?);

    let lone_call = displaced.lone_call_target();
    let callable_len = match lone_call {
        Some(_) => 0,
        None => displaced.max_encoded_len() + 2 * x64::LEA_RSP_LEN + 1,
    };
    let reserve = body.len() + displaced.max_encoded_len() + JMP_ABS_LEN + callable_len;
    if far && !len.allows_absolute() {
        return Err(HookError::PatchTooSmall {
            len: len.get(),
            min: PatchLength::ABSOLUTE.get(),
        });
    }
    let (mut memory, near) = if far {
        (alloc::allocate_executable_anywhere(reserve)?, false)
    } else {
        match alloc::allocate_executable(site.start, reserve) {
            Ok(memory) => (memory, true),
            Err(ProximityError::OutOfMemory) if len.allows_absolute() => {
                log::warn!(
                    "no memory within branch reach of {:#x}, using an absolute redirect",
                    site.start
                );
                (alloc::allocate_executable_anywhere(reserve)?, false)
            }
            Err(e) => return Err(e.into()),
        }
    };

    let trampoline = memory.address();
    let continuation = trampoline + body.len();
    let relocated = displaced.encode(continuation as u64)?;
    let resume = continuation + relocated.len();

    let mut code = body.append(CodeBuffer::from(relocated));
    match x64::jmp_rel(resume as u64, site.end as u64) {
        Some(_) => code.jmp(Target::Absolute(site.end as u64)),
        None => code.jmp_abs(site.end as u64),
    };
    let original = match lone_call {
        Some(target) => target as usize,
        None => {
            let entry = trampoline + code.len();
            let copy = displaced.encode((entry + x64::LEA_RSP_LEN) as u64)?;
            code.push(&x64::lea_rsp(-CALLABLE_FRAME))
                .push(&copy)
                .push(&x64::lea_rsp(CALLABLE_FRAME))
                .push(&[x64::RET]);
            entry
        }
    };
    let code = code.finalize_at(trampoline as u64)?;
    if code.len() > memory.len() {
        return Err(HookError::TrampolineOverflow {
            needed: code.len(),
            reserved: memory.len(),
        });
    }
    memory[..code.len()].copy_from_slice(&code);
    log::debug!(
        "trampoline for {:#x} at {trampoline:#x}: {} bytes, continuation at {continuation:#x}, \
         original at {original:#x}",
        site.start,
        code.len()
    );

    let mut redirect = if near {
        x64::jmp_rel(site.start as u64, trampoline as u64)
            .ok_or(HookError::OutOfRange {
                from: site.start as u64 + x64::JMP_REL_LEN as u64,
                to: trampoline as u64,
            })?
            .to_vec()
    } else {
        x64::jmp_abs(trampoline as u64).to_vec()
    };
    redirect.extend(x64::nops(len.get() - redirect.len()));

    // nothing is written to the call site before this point
    let patch = PermissionWrapper::new(patcher).patch(to_mut(address), &redirect)?;
    if patch.inner().strategy() == WriteStrategy::Quiescent {
        log::debug!(
            "redirect at {:#x} straddles an aligned word and was copied non-atomically",
            site.start
        );
    }

    let trampoline = trampoline..trampoline + code.len();
    memory.retire();
    log::info!(
        "hooked {:#x} -> {hook:#x} ({} registers, {} vector registers saved)",
        site.start,
        registers.resolve().len(),
        vectors.resolve().len()
    );
    registry.insert(PatchRecord {
        site,
        trampoline,
        original,
        hook,
        call_target: displaced.call_target().map(|target| target as usize),
        registers,
        vectors,
        patch,
    });
    Ok(original as *const ())
}

/// Restores the original bytes at `address`.
///
/// The trampoline stays allocated, since a thread may still be running inside it.
///
/// # Safety
///
/// Same atomicity precondition as [`install`]
pub unsafe fn uninstall(address: *const u8) -> Result<()> {
    let address = address as usize;
    let mut registry = registry::lock();
    let mut record = registry.remove(address)?;
    if let Err(e) = record.patch.restore() {
        registry.insert(record);
        return Err(e.into());
    }
    registry.retire(record.trampoline.clone());
    log::info!("unhooked {address:#x}");
    Ok(())
}

/// Whether a hook is installed at exactly `address`
pub fn is_patched(address: *const u8) -> bool {
    registry::lock().get(address as usize).is_some()
}

/// Destination of the direct call displaced by the hook at `address`
pub fn original_call_target(address: *const u8) -> Option<*const ()> {
    registry::lock()
        .get(address as usize)
        .and_then(|record| record.call_target)
        .map(|target| target as *const ())
}
