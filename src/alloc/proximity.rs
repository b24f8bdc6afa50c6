//! Proximity allocator
//!
//! Adapted from detour-rs: https://github.com/darfink/detour-rs

use std::ops::Range;
use std::slice;

use slice_pool::sync::{SliceBox, SlicePool};
use thiserror::Error;

use super::search as region_search;

/// Defines the allocation type.
pub type Allocation = SliceBox<u8>;

/// Smallest pool that is mapped, in pages
const POOL_PAGES: usize = 4;

/// Errors that occur while creating proximity allocations
#[derive(Debug, Error)]
pub enum ProximityError {
    /// Ran out of memory within an acceptable proximity to the allocation location
    #[error("Ran out of memory within an acceptable proximity to the allocation location")]
    OutOfMemory,
    /// Error while memmapping a region
    #[error("{0}")]
    MmapError(mmap::MapError),
    /// Error while querying a memory region
    #[error("{0}")]
    RegionError(region::Error),
}

/// Shared instance containing all pools
pub struct ProximityAllocator {
    /// Max distance away from the origin that the pool can be. `usize::MAX` places pools anywhere
    pub max_distance: usize,
    /// Memory pools used for allocations. Pools are never unmapped.
    pub pools: Vec<SlicePool<u8>>,
}

impl ProximityAllocator {
    /// Allocates a slice in an eligible memory map.
    pub fn allocate(&mut self, origin: usize, size: usize) -> Result<Allocation, ProximityError> {
        // every byte of the allocation has to stay in reach, not just its start
        let reach = self.max_distance.saturating_sub(size);
        let memory_range = (origin.saturating_sub(reach))..(origin.saturating_add(reach));

        // Check if an existing pool can handle the allocation request
        self.allocate_memory(&memory_range, size).or_else(|e| {
            if !matches!(e, ProximityError::OutOfMemory) {
                // make sure the error is that the pool is out of memory
                return Err(e);
            }
            // ... otherwise allocate a pool within the memory range
            self.allocate_pool(&memory_range, origin, size)
                .and_then(|pool| {
                    // Use the newly allocated pool for the request
                    let allocation = pool.alloc(size).ok_or(ProximityError::OutOfMemory)?;
                    self.pools.push(pool);
                    Ok(allocation)
                })
        })
    }

    /// Allocates a chunk using any of the existing pools.
    fn allocate_memory(
        &mut self,
        range: &Range<usize>,
        size: usize,
    ) -> Result<Allocation, ProximityError> {
        // Returns true if the pool's memory is within the range
        let is_pool_in_range = |pool: &SlicePool<u8>| {
            let lower = pool.as_ptr() as usize;
            let upper = lower + pool.len();
            range.contains(&lower) && range.contains(&(upper - 1))
        };

        // Tries to allocate a slice within any eligible pool
        self.pools
            .iter_mut()
            .filter_map(|pool| {
                if is_pool_in_range(pool) {
                    pool.alloc(size)
                } else {
                    None
                }
            })
            .next()
            .ok_or(ProximityError::OutOfMemory)
    }

    /// Allocates a new pool close to `origin`.
    fn allocate_pool(
        &mut self,
        range: &Range<usize>,
        origin: usize,
        size: usize,
    ) -> Result<SlicePool<u8>, ProximityError> {
        let page_size = region::page::size();
        let pool_size = size.div_ceil(page_size).max(POOL_PAGES) * page_size;

        if self.max_distance == usize::MAX {
            return Self::map_pool(None, pool_size);
        }

        // Pools found before the origin grow towards it, so they end on the free page
        let after = region_search::after(origin, Some(range.clone()));
        let before = region_search::before(origin, Some(range.clone())).map(|result| {
            result.map(|page| (page + page_size).saturating_sub(pool_size))
        });

        // Try to allocate after the specified address first (mostly because
        // macOS cannot allocate memory before the process's address).
        after
            .chain(before)
            .find_map(|result| match result {
                Ok(address) => {
                    let fits = range.contains(&address)
                        && range.contains(&(address + pool_size - 1))
                        && region_search::is_free(address, pool_size).unwrap_or(false);
                    if fits {
                        Self::map_pool(Some(address), pool_size).ok().map(Ok)
                    } else {
                        None
                    }
                }
                Err(error) => Some(Err(ProximityError::RegionError(error))),
            })
            .unwrap_or(Err(ProximityError::OutOfMemory))
    }

    /// Maps a read-, write- & executable pool, at `address` when given.
    fn map_pool(address: Option<usize>, size: usize) -> Result<SlicePool<u8>, ProximityError> {
        let mut options = vec![
            mmap::MapOption::MapReadable,
            mmap::MapOption::MapWritable,
            mmap::MapOption::MapExecutable,
        ];
        if let Some(address) = address {
            options.push(mmap::MapOption::MapAddr(address as *const u8));
        }

        let map = mmap::MemoryMap::new(size, &options).map_err(|e| match e {
            mmap::MapError::ErrNoMem => ProximityError::OutOfMemory,
            e => ProximityError::MmapError(e),
        })?;
        log::debug!("mapped {} byte pool at {:p}", map.len(), map.data());
        Ok(SlicePool::new(SliceableMemoryMap(map)))
    }
}

/// A wrapper for making a memory map compatible with `SlicePool`.
struct SliceableMemoryMap(mmap::MemoryMap);

impl SliceableMemoryMap {
    /// Get a slice of the memory map
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.0.data(), self.0.len()) }
    }

    /// Get a mutable slice of the memory map
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.0.data(), self.0.len()) }
    }
}

impl AsRef<[u8]> for SliceableMemoryMap {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for SliceableMemoryMap {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

unsafe impl Send for SliceableMemoryMap {}
unsafe impl Sync for SliceableMemoryMap {}
