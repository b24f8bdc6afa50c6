//! # callhook
//!
//! Register-preserving call-site hooks for optimized x86-64 binaries.
//!
//! A whole-program optimizer may keep values in volatile registers across a call once it has
//! proven the callee leaves them alone. Redirecting such a call to new code breaks that promise.
//! This crate patches a call site to run a hook first, and saves and restores the registers the
//! caller names around it, so the surrounding code never notices.
//!
//! ```no_run
//! use callhook::{install_call_hook, RegisterSet, VectorRegisterSet};
//!
//! extern "C" fn on_call() {}
//!
//! # let call_site = std::ptr::null::<u8>();
//! let registers: RegisterSet = "r10, r11".parse().unwrap();
//! let original = unsafe {
//!     install_call_hook(call_site, on_call as *const (), registers, VectorRegisterSet::NONE, 5)
//! }
//! .unwrap();
//! ```
//!
//! Modules:
//! - [`convention`]: registers, register sets and ABI facts
//! - [`code`]: relocatable code buffers, the save/restore emitter and instruction relocation
//! - [`patcher`]: writing code in place, with permission changes and atomic publication
//! - [`alloc`]: executable memory close to a call site
//! - [`hook`]: the call hook itself and the registry of installed hooks

#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]

#[cfg(not(target_arch = "x86_64"))]
compile_error!("callhook only supports x86_64");

pub mod alloc;
pub mod code;
pub mod convention;
pub mod error;
pub mod hook;
pub mod patcher;

pub use code::CodeBuffer;
pub use convention::{Register, RegisterSet, VectorRegister, VectorRegisterSet};
pub use error::{ErrorKind, HookError, Result};
pub use hook::{CallHook, CallHookGuard, PatchLength};

/// Redirects the call site at `address` through `hook`, keeping `registers` and `vectors` intact.
///
/// `min_patch_len` bytes are replaced and must end on an instruction boundary. Returns a callable
/// original: calling it as an argument-less C function has the effect of the replaced instructions,
/// so a hook can still perform the original call.
///
/// # Safety
///
/// See [`hook::callhook::install`]
pub unsafe fn install_call_hook(
    address: *const u8,
    hook: *const (),
    registers: RegisterSet,
    vectors: VectorRegisterSet,
    min_patch_len: usize,
) -> Result<*const ()> {
    let len = PatchLength::new(min_patch_len)?;
    hook::callhook::install(address, hook, registers, vectors, len)
}

/// Removes the hook at `address`, restoring the original bytes
///
/// # Safety
///
/// See [`hook::callhook::uninstall`]
pub unsafe fn uninstall_call_hook(address: *const u8) -> Result<()> {
    hook::callhook::uninstall(address)
}

/// Whether a hook is installed at exactly `address`
pub fn is_patched(address: *const u8) -> bool {
    hook::callhook::is_patched(address)
}

/// Destination of the direct call replaced by the hook at `address`, for hooks that want to
/// perform the original call themselves
pub fn original_call_target(address: *const u8) -> Option<*const ()> {
    hook::callhook::original_call_target(address)
}

/// Generates a matched `(prolog, epilog)` pair saving and restoring the given registers.
///
/// Code placed between the two may clobber the selected registers freely. `NONE`/`NONE` gives two
/// empty buffers.
pub fn make_non_volatile_patch(
    registers: RegisterSet,
    vectors: VectorRegisterSet,
) -> Result<(CodeBuffer, CodeBuffer)> {
    code::emit::NonVolatilePatch::new(registers, vectors).map(|patch| patch.into_parts())
}
