//! This module contains a byte patcher
//!
//! Code is patched while other threads may be running it. When the patch fits inside one naturally
//! aligned 8-byte word the new bytes are published with a single atomic store, so a concurrent
//! instruction fetch sees either all old or all new bytes. Wider or straddling patches are plain
//! copies, and the caller must make sure no thread executes the region meanwhile.

use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use super::{PatchGuard, Patcher};

/// Errors raised by [`BytePatcher`]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// Memory did not hold the written bytes afterwards
    #[error("bytes at {0:#x} did not read back as written")]
    Mismatch(usize),
}

/// How a write was published
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    /// One aligned 8-byte store
    Atomic,
    /// Byte copy; the region must be quiescent
    Quiescent,
}

/// Size of the atomic store
const WORD: usize = 8;

/// Writes `bytes` to `location`, atomically when the span allows it
///
/// # Safety
///
/// `location` must be valid and writable for `bytes.len()` bytes, and the aligned word around a
/// short patch must be readable and writable
pub unsafe fn write(location: *mut u8, bytes: &[u8]) -> WriteStrategy {
    let address = location as usize;
    let word_start = address & !(WORD - 1);
    if bytes.is_empty() || address + bytes.len() > word_start + WORD {
        ptr::copy_nonoverlapping(bytes.as_ptr(), location, bytes.len());
        return WriteStrategy::Quiescent;
    }

    // Safety: the word is aligned, and lies in the same page as `location`
    let word = &*(word_start as *const AtomicU64);
    let offset = address - word_start;
    let mut current = word.load(Ordering::Acquire);
    loop {
        let mut splice = current.to_ne_bytes();
        splice[offset..offset + bytes.len()].copy_from_slice(bytes);
        match word.compare_exchange_weak(
            current,
            u64::from_ne_bytes(splice),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return WriteStrategy::Atomic,
            Err(actual) => current = actual,
        }
    }
}

/// Publishes bytes at a location, the signature of [`write`]
pub type Writer = unsafe fn(*mut u8, &[u8]) -> WriteStrategy;

/// Writes with `writer` and checks that the bytes stuck
///
/// # Safety
///
/// See [`write`]
unsafe fn write_verified(
    writer: Writer,
    location: *mut u8,
    bytes: &[u8],
) -> Result<WriteStrategy, WriteError> {
    let strategy = writer(location, bytes);
    if slice::from_raw_parts(location, bytes.len()) == bytes {
        Ok(strategy)
    } else {
        Err(WriteError::Mismatch(location as usize))
    }
}

/// Patcher for patching memory locations with byte arrays.
#[derive(Clone, Copy)]
pub struct BytePatcher {
    /// Publishes the patch
    writer: Writer,
}
impl BytePatcher {
    /// Creates a new [`BytePatcher`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a patcher that publishes patches through `writer`.
    ///
    /// Verification and restores are unchanged: a patch that does not read back is undone with
    /// [`write`].
    pub fn with_writer(writer: Writer) -> Self {
        Self { writer }
    }
}
impl Default for BytePatcher {
    fn default() -> Self {
        Self::with_writer(write)
    }
}
unsafe impl Patcher for BytePatcher {
    type Error = WriteError;
    type Guard<'a> = BytePatchGuard;

    unsafe fn patch<'a>(
        &'a self,
        location: *mut u8,
        patch: &[u8],
    ) -> Result<Self::Guard<'a>, Self::Error> {
        BytePatchGuard::patch(self.writer, location, patch)
    }
}
/// Guard for byte-patches
///
/// See [`BytePatcher`].
#[derive(Debug)]
pub struct BytePatchGuard {
    /// Original data from `location`
    original: Vec<u8>,
    /// Location of the patch
    location: usize,
    /// How the patch was published
    strategy: WriteStrategy,
    /// Whether the original data is back in place
    restored: bool,
}
impl BytePatchGuard {
    /// Patches a location, returning a guard for unpatching
    ///
    /// # Safety
    ///
    /// `location` must be a valid pointer
    unsafe fn patch(writer: Writer, location: *mut u8, patch: &[u8]) -> Result<Self, WriteError> {
        // Safety: caller must pass in a `location` pointer that is valid for the full length of the patch
        let original = slice::from_raw_parts(location, patch.len()).to_vec();

        // Safety: caller must ensure that `location` is writable
        match write_verified(writer, location, patch) {
            Ok(strategy) => Ok(Self {
                original,
                location: location as usize,
                strategy,
                restored: false,
            }),
            Err(e) => {
                // put back whatever we may have changed
                write(location, &original);
                Err(e)
            }
        }
    }

    /// How the patch was published
    pub fn strategy(&self) -> WriteStrategy {
        self.strategy
    }
}
unsafe impl PatchGuard for BytePatchGuard {
    type Error = WriteError;

    fn restore(&mut self) -> Result<(), Self::Error> {
        if self.restored {
            return Ok(());
        }
        // Safety: creator must pass in a `location` pointer that is valid and writable for the full length of the patch
        unsafe { write_verified(write, self.location as *mut u8, &self.original)? };
        self.restored = true;
        Ok(())
    }

    fn is_active(&self) -> bool {
        !self.restored
    }

    fn abandon(&mut self) {
        self.restored = true;
    }

    fn location(&self) -> usize {
        self.location
    }

    fn original(&self) -> &[u8] {
        &self.original
    }
}
impl Drop for BytePatchGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            log::error!("failed to restore patch: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::slice;

    use crate::patcher::byte::{write, BytePatcher, WriteError, WriteStrategy};
    use crate::patcher::{PatchGuard, Patcher};

    /// Writer that drops the last byte of every patch
    unsafe fn torn(location: *mut u8, bytes: &[u8]) -> WriteStrategy {
        write(location, &bytes[..bytes.len().saturating_sub(1)])
    }

    /// Buffer with a known alignment
    #[repr(C, align(8))]
    struct Aligned([u8; 16]);

    #[test]
    /// Test patch and revert functionality
    fn test_patch() {
        let mut vec = vec![1u8, 2, 3, 4];
        let ptr = vec.as_mut_ptr();
        let size = vec.len();

        // sanity check
        assert_eq!(unsafe { slice::from_raw_parts(ptr, size) }, [1, 2, 3, 4]);

        // get our patcher to test
        let patcher = BytePatcher::new();

        // patch the vec's data
        let mut patch = unsafe { patcher.patch(ptr, &[4, 3, 2, 1]).unwrap() };

        // make sure the data was actually changed
        assert_eq!(unsafe { slice::from_raw_parts(ptr, size) }, [4, 3, 2, 1]);
        assert_eq!(patch.original(), [1, 2, 3, 4]);
        assert!(patch.is_active());

        // restore the patch
        patch.restore().unwrap();
        assert!(!patch.is_active());

        // make sure the patch was restored
        assert_eq!(unsafe { slice::from_raw_parts(ptr, size) }, [1, 2, 3, 4]);

        // restoring again is harmless
        patch.restore().unwrap();
        drop(patch);
        assert_eq!(unsafe { slice::from_raw_parts(ptr, size) }, [1, 2, 3, 4]);
    }

    #[test]
    /// Dropping the guard restores the original bytes
    fn test_drop_restores() {
        let mut vec = vec![1u8, 2, 3, 4];
        let ptr = vec.as_mut_ptr();

        let patch = unsafe { BytePatcher::new().patch(ptr, &[9, 9]).unwrap() };
        assert_eq!(unsafe { slice::from_raw_parts(ptr, 4) }, [9, 9, 3, 4]);
        drop(patch);
        assert_eq!(unsafe { slice::from_raw_parts(ptr, 4) }, [1, 2, 3, 4]);
    }

    #[test]
    /// Tests a partial patch of a block to ensure we're not overwriting outside the patch area
    fn test_partial_patch() {
        let mut vec = vec![1u8, 2, 3, 4];
        let ptr = vec.as_mut_ptr();
        let size = vec.len();

        // get our patcher to test
        let patcher = BytePatcher::new();

        // patch the vec's data
        let patch = unsafe { patcher.patch(ptr.add(1), &[5, 5]).unwrap() };

        // make sure the data was actually changed
        assert_eq!(unsafe { slice::from_raw_parts(ptr, size) }, [1, 5, 5, 4]);

        // restore the patch
        drop(patch);

        // make sure the patch was restored
        assert_eq!(unsafe { slice::from_raw_parts(ptr, size) }, [1, 2, 3, 4]);
    }

    #[test]
    /// A redirect inside one aligned word is published atomically, neighbours untouched
    fn test_atomic_strategy() {
        let mut buf = Aligned([0xcc; 16]);
        let ptr = buf.0.as_mut_ptr();

        let patch = unsafe { BytePatcher::new().patch(ptr.add(1), &[0xe9, 1, 2, 3, 4]).unwrap() };
        assert_eq!(patch.strategy(), WriteStrategy::Atomic);
        assert_eq!(
            unsafe { slice::from_raw_parts(ptr, 8) },
            [0xcc, 0xe9, 1, 2, 3, 4, 0xcc, 0xcc]
        );
        drop(patch);
        assert_eq!(unsafe { slice::from_raw_parts(ptr, 16) }, [0xcc; 16]);
    }

    #[test]
    /// A patch straddling two words falls back to a plain copy
    fn test_quiescent_strategy() {
        let mut buf = Aligned([0; 16]);
        let ptr = buf.0.as_mut_ptr();

        let patch = unsafe { BytePatcher::new().patch(ptr.add(5), &[1, 2, 3, 4, 5]).unwrap() };
        assert_eq!(patch.strategy(), WriteStrategy::Quiescent);
        assert_eq!(
            unsafe { slice::from_raw_parts(ptr.add(5), 5) },
            [1, 2, 3, 4, 5]
        );
    }

    #[test]
    /// A patch that does not read back is undone before the error is returned
    fn test_mismatch_rolls_back() {
        let mut buf = Aligned([0xcc; 16]);
        let ptr = buf.0.as_mut_ptr();

        let patcher = BytePatcher::with_writer(torn);
        for (offset, patch) in [(1, &[0xe9, 1, 2, 3, 4][..]), (5, &[1, 2, 3, 4, 5, 6, 7][..])] {
            let e = unsafe { patcher.patch(ptr.add(offset), patch) }.unwrap_err();
            assert_eq!(e, WriteError::Mismatch(ptr as usize + offset));
            assert_eq!(unsafe { slice::from_raw_parts(ptr, 16) }, [0xcc; 16]);
        }
    }

    #[test]
    /// An abandoned patch stays in place after the guard is gone
    fn test_abandon() {
        let mut vec = vec![1u8, 2, 3, 4];
        let ptr = vec.as_mut_ptr();

        let mut patch = unsafe { BytePatcher::new().patch(ptr, &[7, 7]).unwrap() };
        patch.abandon();
        assert!(!patch.is_active());
        patch.restore().unwrap();
        drop(patch);
        assert_eq!(unsafe { slice::from_raw_parts(ptr, 4) }, [7, 7, 3, 4]);
    }
}
