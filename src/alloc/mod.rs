//! Allocates executable buffers for trampolines
//!
//! Trampolines must usually sit within a rel32 branch of the code they patch, so the near pool
//! only hands out memory inside [`DETOUR_RANGE`] of the requested origin. The far pool is used
//! when the patch is large enough for an absolute jump.
//!
//! Adapted from detour-rs: https://github.com/darfink/detour-rs

use lazy_static::lazy_static;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};

use self::proximity::ProximityError;

pub mod proximity;
pub mod search;

/// A thread-safe memory pool for allocating chunks close to addresses.
pub struct ThreadAllocator(Mutex<proximity::ProximityAllocator>);

impl ThreadAllocator {
    /// Creates a new proximity memory allocator.
    pub fn new(max_distance: usize) -> Self {
        ThreadAllocator(Mutex::new(proximity::ProximityAllocator {
            max_distance,
            pools: Vec::new(),
        }))
    }

    /// Allocates read-, write- & executable memory close to `origin`.
    pub fn allocate(&self, origin: usize, size: usize) -> Result<ExecutableMemory, ProximityError> {
        // pools stay consistent even if a holder panicked
        let mut allocator = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        allocator
            .allocate(origin, size)
            .map(|data| ExecutableMemory { data })
    }
}

/// A handle for allocated proximity memory.
///
/// Dropping the handle returns the memory to its pool. Code that may still be executing must be
/// [retired](ExecutableMemory::retire) instead.
pub struct ExecutableMemory {
    /// Actual allocation where the executable code resides
    data: proximity::Allocation,
}

impl ExecutableMemory {
    /// Start of the allocation
    pub fn address(&self) -> usize {
        self.data.as_ptr() as usize
    }

    /// Gives up the handle without ever reusing the memory, returning its address
    pub fn retire(self) -> usize {
        let address = self.address();
        mem::forget(self);
        address
    }
}

impl Deref for ExecutableMemory {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data.deref()
    }
}

impl DerefMut for ExecutableMemory {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.deref_mut()
    }
}

/// The furthest distance between a target and its detour (2 GiB).
pub const DETOUR_RANGE: usize = 0x8000_0000;

lazy_static! {
    /// Pools within branch reach of their users
    static ref POOL: ThreadAllocator = ThreadAllocator::new(DETOUR_RANGE);
    /// Pools placed anywhere
    static ref FAR_POOL: ThreadAllocator = ThreadAllocator::new(usize::MAX);
}

/// Allocates an executable buffer within [`DETOUR_RANGE`] of `origin`
///
/// Note: When the executable buffer returns, the buffer's data is undefined, but valid u8 values
pub fn allocate_executable(origin: usize, size: usize) -> Result<ExecutableMemory, ProximityError> {
    POOL.allocate(origin, size)
}

/// Allocates an executable buffer at any address
pub fn allocate_executable_anywhere(size: usize) -> Result<ExecutableMemory, ProximityError> {
    FAR_POOL.allocate(0, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Allocated memory can be written and run
    fn test_executable() {
        let origin = test_executable as usize;
        let mut memory = allocate_executable(origin, 16).unwrap();
        assert!(memory.address().abs_diff(origin) < DETOUR_RANGE);

        // mov eax, 42; ret
        memory[..6].copy_from_slice(&[0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3]);
        let f: extern "C" fn() -> u32 = unsafe { mem::transmute(memory.as_ptr()) };
        assert_eq!(f(), 42);
    }

    #[test]
    /// Retired memory is never handed out again
    fn test_retire() {
        let origin = test_retire as usize;
        let retired = allocate_executable(origin, 32).unwrap().retire();
        for _ in 0..8 {
            let memory = allocate_executable(origin, 32).unwrap();
            assert_ne!(memory.address(), retired);
        }
    }

    #[test]
    fn test_anywhere() {
        let memory = allocate_executable_anywhere(64).unwrap();
        assert_eq!(memory.len(), 64);
    }
}
