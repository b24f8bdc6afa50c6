//! # Hook
//!
//! This module covers hooks, which redirect execution from one location to another

pub mod callhook;
pub mod length;
pub mod registry;

pub use callhook::{CallHook, CallHookGuard};
pub use length::PatchLength;

/// Trait for hooks
///
/// # Safety
///
/// Hooks are inherently unsafe; it is up to the hook to document what makes a location hookable
pub unsafe trait Hook {
    /// Errors that could happen during a hook
    type Error;
    /// Hook guard to allow functions to be automatically unhooked when the guard goes out of scope
    type Guard<'a>: HookGuard + 'a
    where
        Self: 'a;

    /// Creates a hook which redirects `source` to `destination`.
    ///
    /// # Safety
    ///
    /// - Both `source` and `destination` must be valid pointers
    /// - `destination` must be valid executable code
    unsafe fn hook(
        &self,
        source: *const u8,
        destination: *const u8,
    ) -> Result<Self::Guard<'_>, Self::Error>;
}

/// Guard for a currently active hook
///
/// # Safety
///
/// Must ensure that the guard fully unhooks whether dropped or unhooked via `unhook`
pub unsafe trait HookGuard: Sized {
    /// Errors that could happen while unhooking
    type Error;

    /// Manually unhooks the hook rather than letting the guard go out of scope
    fn unhook(self) -> Result<(), Self::Error>;
}
