//! This module contains a patcher which adjusts memory permissions to patch read-only code

use region::Protection;
use thiserror::Error;

use super::byte::WriteError;
use super::{PatchGuard, Patcher};

/// Errors when using permission patching
#[derive(Debug, Error)]
pub enum PermissionError<E> {
    /// Error when setting memory protections
    #[error("Error setting memory protections")]
    ProtectionError(#[from] region::Error),
    /// Custom error type from the underlying patcher
    #[error("{0}")]
    CustomError(E),
}
impl From<WriteError> for PermissionError<WriteError> {
    fn from(e: WriteError) -> Self {
        Self::CustomError(e)
    }
}

/// This struct wraps patchers to allow them to write to memory that's normally unwritable.
/// It achieves this result by making the target pages read-write-execute, triggering the patch, and then reverting the permissions.
///
/// The pages stay executable for the whole write, so threads running code elsewhere on the same page do not fault.
///
/// # Safety
///
/// `PermissionWrapper` relies on the size of the patch value to determine how many pages to change write permissions,
/// pairing `PermissionWrapper` with a patcher that writes more memory than the size of the patch is undefined behavior.
///
/// The `*mut u8` **MUST** be memory not tracked by Rust, or ensured that reading from and writing to data tracked by Rust will not trigger undefined behavior.
pub struct PermissionWrapper<P: Patcher> {
    /// Underlying patcher.
    patcher: P,
}
impl<P: Patcher> PermissionWrapper<P> {
    /// Creates a new PermissionWrapper
    pub fn new(patcher: P) -> Self {
        Self { patcher }
    }
}

/// Converts a const pointer to a mutable pointer to be passed into our [`Patcher::patch`] implementation.
///
/// # Safety
///
/// **THIS FUNCTION DOES NOT CHANGE MEMORY PERMISSIONS.**
///
/// This function should **ONLY** be called in conjunction with our [`Patcher::patch`] implementation, which properly changes the memory permissions.
pub unsafe fn to_mut<T>(ptr: *const T) -> *mut T {
    ptr as _
}

unsafe impl<P> Patcher for PermissionWrapper<P>
where
    P: Patcher,
    PermissionError<P::Error>: From<P::Error>,
{
    type Error = PermissionError<P::Error>;
    type Guard<'a> = PermissionWrapperGuard<P::Guard<'a>> where Self: 'a;

    unsafe fn patch<'a>(
        &'a self,
        location: *mut u8,
        patch: &[u8],
    ) -> Result<Self::Guard<'a>, Self::Error> {
        // the handle puts the old protection back when it goes out of scope
        let _handle =
            region::protect_with_handle(location, patch.len(), Protection::READ_WRITE_EXECUTE)?;
        self.patcher
            .patch(location, patch)
            .map(|g| PermissionWrapperGuard::guard(g, location as usize, patch.len()))
            .map_err(Into::into)
    }
}

/// Permission guard for the underlying patch guard
#[derive(Debug)]
pub struct PermissionWrapperGuard<G: PatchGuard> {
    /// Underlying patch guard for the wrapped patcher
    guard: G,
    /// Location of the patch
    location: usize,
    /// Length of the patch
    len: usize,
}
impl<G: PatchGuard> PermissionWrapperGuard<G> {
    /// Wrap a patcher's guard. Restoring goes through the same permission dance as patching
    fn guard(guard: G, location: usize, len: usize) -> Self {
        Self {
            guard,
            location,
            len,
        }
    }

    /// Underlying guard
    pub fn inner(&self) -> &G {
        &self.guard
    }
}
unsafe impl<G: PatchGuard> PatchGuard for PermissionWrapperGuard<G> {
    type Error = PermissionError<G::Error>;

    fn restore(&mut self) -> Result<(), Self::Error> {
        if !self.guard.is_active() {
            return Ok(());
        }
        // Safety: the pages were made writable once already to construct the guard
        let _handle = unsafe {
            region::protect_with_handle(
                self.location as *const u8,
                self.len,
                Protection::READ_WRITE_EXECUTE,
            )?
        };
        self.guard.restore().map_err(PermissionError::CustomError)
    }

    fn is_active(&self) -> bool {
        self.guard.is_active()
    }

    fn abandon(&mut self) {
        self.guard.abandon();
    }

    fn location(&self) -> usize {
        self.location
    }

    fn original(&self) -> &[u8] {
        self.guard.original()
    }
}

impl<G: PatchGuard> Drop for PermissionWrapperGuard<G> {
    fn drop(&mut self) {
        if !self.guard.is_active() {
            return;
        }
        // Safety: the pages were made writable once already to construct the guard
        let handle = unsafe {
            region::protect_with_handle(
                self.location as *const u8,
                self.len,
                Protection::READ_WRITE_EXECUTE,
            )
        };
        match handle {
            Ok(_handle) => {
                if self.guard.restore().is_err() {
                    log::error!("failed to restore patch at {:#x}", self.location);
                }
            }
            Err(e) => {
                log::error!(
                    "failed to unprotect {:#x} for restoring, leaving the patch: {e}",
                    self.location
                );
                // the inner guard would write to pages we could not make writable
                self.guard.abandon();
            }
        }
    }
}
