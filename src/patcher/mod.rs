//! # Patch
//!
//! This module covers patchers, which are used to overwrite and restore locations in memory

pub mod byte;
pub mod mem;

/// All patchers save state from where they patched and are able to revert on-command
///
/// # Safety
///
/// Patchers are inherently unsafe. The implementor must ensure that the implementation of `patch` works correctly and is properly documented for avoiding undefined behavior
pub unsafe trait Patcher {
    /// Error type that can occur when patching
    type Error;
    /// Guard type for the patcher. When this guard is dropped, the location should be restored.
    type Guard<'a>: PatchGuard + 'a
    where
        Self: 'a;

    /// Patches a given location.
    ///
    /// A failed patch leaves the location exactly as it was.
    ///
    /// # Safety
    ///
    /// This function is intended to be used on arbitrary memory addresses, but must be valid for the supplied patcher
    unsafe fn patch<'a>(
        &'a self,
        target: *mut u8,
        patch: &[u8],
    ) -> Result<Self::Guard<'a>, Self::Error>;
}

/// Guard for a patch
///
/// # Safety
///
/// Guard must fully unpatch the location when dropped, even if `restore` is not called, unless
/// it was abandoned
pub unsafe trait PatchGuard: Sized {
    /// Error type that can occur when restoring
    type Error;

    /// Restores the original value of a patch. Restoring twice is a no-op.
    fn restore(&mut self) -> Result<(), Self::Error>;

    /// Whether the patch is still in place
    fn is_active(&self) -> bool;

    /// Gives up on the patch: it stays in place and dropping the guard no longer touches memory
    fn abandon(&mut self);

    /// Address of the patch
    fn location(&self) -> usize;

    /// Bytes that were at the location before patching
    fn original(&self) -> &[u8];
}
