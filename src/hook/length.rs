//! Validated patch lengths

use std::fmt::{self, Display};

use crate::code::x64::{JMP_ABS_LEN, JMP_REL_LEN};
use crate::error::{HookError, Result};

/// Number of bytes a hook overwrites at its call site
///
/// Always large enough for a `jmp rel32`. The region must also end on an instruction boundary,
/// which can only be checked against the target code at install time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PatchLength(usize);

impl PatchLength {
    /// Smallest redirect, a `jmp rel32`
    pub const MIN: PatchLength = PatchLength(JMP_REL_LEN);
    /// Room for a redirect that reaches any address
    pub const ABSOLUTE: PatchLength = PatchLength(JMP_ABS_LEN);

    /// Validates a length
    pub fn new(len: usize) -> Result<Self> {
        if len < Self::MIN.0 {
            return Err(HookError::PatchTooSmall {
                len,
                min: Self::MIN.0,
            });
        }
        Ok(Self(len))
    }

    /// Length in bytes
    pub fn get(self) -> usize {
        self.0
    }

    /// Whether an absolute redirect fits
    pub fn allows_absolute(self) -> bool {
        self >= Self::ABSOLUTE
    }
}

impl Default for PatchLength {
    fn default() -> Self {
        Self::MIN
    }
}

impl TryFrom<usize> for PatchLength {
    type Error = HookError;

    fn try_from(len: usize) -> Result<Self> {
        Self::new(len)
    }
}

impl From<PatchLength> for usize {
    fn from(len: PatchLength) -> usize {
        len.0
    }
}

impl Display for PatchLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", self.0)
    }
}
