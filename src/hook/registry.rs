//! Process-wide record of installed call hooks
//!
//! Installing and uninstalling hold the registry lock from the first check to the last write, so
//! two threads can never patch overlapping code at the same time.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lazy_static::lazy_static;

use crate::convention::{RegisterSet, VectorRegisterSet};
use crate::error::{HookError, Result};
use crate::patcher::byte::BytePatchGuard;
use crate::patcher::mem::PermissionWrapperGuard;

/// Everything known about one patched call site
#[derive(Debug)]
pub struct PatchRecord {
    /// Patched bytes at the call site
    pub site: Range<usize>,
    /// Generated code, never freed
    pub trampoline: Range<usize>,
    /// Callable original handed back by install
    pub original: usize,
    /// Called before the original instructions
    pub hook: usize,
    /// Destination of the displaced direct call
    pub call_target: Option<usize>,
    /// Registers saved around the hook
    pub registers: RegisterSet,
    /// Vector registers saved around the hook
    pub vectors: VectorRegisterSet,
    /// Puts the original bytes back
    pub patch: PermissionWrapperGuard<BytePatchGuard>,
}

/// Installed patches and the trampolines of removed ones
#[derive(Debug, Default)]
pub struct Registry {
    /// Live patches by site address
    records: BTreeMap<usize, PatchRecord>,
    /// Trampolines of uninstalled patches, still executable
    retired: Vec<Range<usize>>,
}

lazy_static! {
    /// Every hook installed in the process
    static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry::default());
}

/// Locks the registry
pub fn lock() -> MutexGuard<'static, Registry> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether two half open ranges share a byte
fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}

impl Registry {
    /// Rejects a patch of `site` calling `hook` that would conflict with existing patches
    pub fn check(&self, site: &Range<usize>, hook: usize) -> Result<()> {
        if self.records.contains_key(&site.start) {
            return Err(HookError::AlreadyPatched(site.start));
        }

        for record in self.records.values() {
            if overlaps(site, &record.site) || overlaps(site, &record.trampoline) {
                return Err(HookError::OverlappingPatch {
                    address: site.start,
                    existing: record.site.start,
                });
            }
        }
        if let Some(trampoline) = self.retired.iter().find(|t| overlaps(site, t)) {
            return Err(HookError::OverlappingPatch {
                address: site.start,
                existing: trampoline.start,
            });
        }

        let reenters = site.contains(&hook)
            || self
                .records
                .values()
                .any(|record| record.site.contains(&hook) || record.trampoline.contains(&hook))
            || self.retired.iter().any(|t| t.contains(&hook));
        if reenters {
            return Err(HookError::RecursiveHook {
                address: site.start,
                hook,
            });
        }
        Ok(())
    }

    /// Records an installed patch
    pub fn insert(&mut self, record: PatchRecord) {
        self.records.insert(record.site.start, record);
    }

    /// Takes the record for `address` out of the registry
    pub fn remove(&mut self, address: usize) -> Result<PatchRecord> {
        self.records
            .remove(&address)
            .ok_or(HookError::NotPatched(address))
    }

    /// Keeps a removed trampoline's range around for conflict checks
    pub fn retire(&mut self, trampoline: Range<usize>) {
        self.retired.push(trampoline);
    }

    /// Looks up the record for `address`
    pub fn get(&self, address: usize) -> Option<&PatchRecord> {
        self.records.get(&address)
    }

    /// Number of live patches
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is patched
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
