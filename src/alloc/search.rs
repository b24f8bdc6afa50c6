//! Searches memory for unmapped pages close to a specified address
//!
//! Adapted from detour-rs: https://github.com/darfink/detour-rs

use std::ops::Range;

/// Returns an iterator for free pages after the specified address.
pub fn after(
    origin: usize,
    range: Option<Range<usize>>,
) -> impl Iterator<Item = Result<usize, region::Error>> {
    FreeRegionIter::new(origin, range, SearchDirection::After)
}

/// Returns an iterator for free pages before the specified address.
pub fn before(
    origin: usize,
    range: Option<Range<usize>>,
) -> impl Iterator<Item = Result<usize, region::Error>> {
    FreeRegionIter::new(origin, range, SearchDirection::Before)
}

/// Whether every page touched by `address..address + size` is unmapped
pub fn is_free(address: usize, size: usize) -> Result<bool, region::Error> {
    let page_size = region::page::size();
    let start = region::page::floor(address as *const ()) as usize;
    let Some(end) = address.checked_add(size) else {
        return Ok(false);
    };
    for page in (start..end).step_by(page_size) {
        match region::query(page as *const ()) {
            Ok(_) => return Ok(false),
            Err(region::Error::UnmappedRegion) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[allow(clippy::missing_docs_in_private_items)]
/// Direction for the region search.
enum SearchDirection {
    Before,
    After,
}

/// An iterator searching for free pages.
struct FreeRegionIter {
    /// Range we're iterating over
    range: Range<usize>,
    /// Direction we're searching
    search: SearchDirection,
    /// Current page in the search
    current: usize,
}

impl FreeRegionIter {
    /// Creates a new iterator for free pages.
    fn new(origin: usize, range: Option<Range<usize>>, search: SearchDirection) -> Self {
        FreeRegionIter {
            range: range.unwrap_or(0..usize::MAX),
            current: region::page::floor(origin as *const ()) as usize,
            search,
        }
    }

    /// Steps `current` to `next`, ending the search when the address space runs out
    fn advance(&mut self, next: Option<usize>) {
        self.current = next.unwrap_or(0);
    }
}

impl Iterator for FreeRegionIter {
    type Item = Result<usize, region::Error>;

    /// Returns the closest free page for the current address.
    fn next(&mut self) -> Option<Self::Item> {
        let page_size = region::page::size();

        while self.current > 0 && self.range.contains(&self.current) {
            match region::query(self.current as *const ()) {
                Ok(region) => {
                    let next = match self.search {
                        SearchDirection::Before => {
                            region.as_range().start.checked_sub(page_size)
                        }
                        SearchDirection::After => Some(region.as_range().end),
                    };
                    self.advance(next);
                }
                Err(error) => {
                    // Check whether the page is free, otherwise return the error
                    let result = match error {
                        region::Error::UnmappedRegion => Ok(self.current),
                        inner => Err(inner),
                    };

                    // Adjust the offset for repeated calls.
                    let next = match self.search {
                        SearchDirection::Before => self.current.checked_sub(page_size),
                        SearchDirection::After => self.current.checked_add(page_size),
                    };
                    self.advance(next);

                    return Some(result);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Some mapped code to search around
    fn origin() -> usize {
        origin as usize
    }

    #[test]
    /// Candidates are page aligned, unmapped and on the requested side
    fn test_search_directions() {
        let origin = origin();
        let page_size = region::page::size();

        let after = after(origin, None).next().unwrap().unwrap();
        assert!(after > origin);
        assert_eq!(after % page_size, 0);
        assert!(is_free(after, page_size).unwrap());

        let before = before(origin, None).next().unwrap().unwrap();
        assert!(before < origin);
        assert_eq!(before % page_size, 0);
        assert!(is_free(before, page_size).unwrap());
    }

    #[test]
    /// The search never leaves its range
    fn test_search_range() {
        let origin = origin();
        let range = origin..origin + 1;
        assert!(after(origin, Some(range)).next().is_none());
    }

    #[test]
    /// Mapped code is never reported free
    fn test_is_free_mapped() {
        assert!(!is_free(origin(), 1).unwrap());
        assert!(!is_free(usize::MAX - 4, 16).unwrap());
    }
}
