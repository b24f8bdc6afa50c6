//! # Error
//!
//! Every failure the crate reports goes through [`HookError`]

use iced_x86::IcedError;
use thiserror::Error;

use crate::alloc::proximity::ProximityError;
use crate::patcher::byte::WriteError;
use crate::patcher::mem::PermissionError;

/// Result type used throughout the crate
pub type Result<T, E = HookError> = std::result::Result<T, E>;

/// Broad classification of a [`HookError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The caller asked for something that cannot be encoded or is inconsistent
    Configuration,
    /// The target bytes could not be decoded or re-encoded
    Encoding,
    /// Memory protections could not be changed, or the write did not stick
    Permission,
    /// No executable memory could be found for a trampoline
    Allocation,
    /// The location is already patched
    Reentrancy,
}

/// Errors raised while building or installing a hook
#[derive(Debug, Error)]
pub enum HookError {
    /// Patch length cannot hold the smallest redirect
    #[error("patch length {len} is too small to encode a control transfer (minimum {min})")]
    PatchTooSmall {
        /// Requested length
        len: usize,
        /// Smallest encodable redirect
        min: usize,
    },
    /// Patch length ends in the middle of an instruction
    #[error("patch of {len} bytes at {address:#x} splits an instruction ({covered} bytes are covered by whole instructions)")]
    SplitInstruction {
        /// Target address
        address: usize,
        /// Requested length
        len: usize,
        /// Length covered by the decoded instructions
        covered: usize,
    },
    /// Register name could not be parsed, or a set mixes a keyword with names
    #[error("invalid register `{0}`")]
    InvalidRegister(String),
    /// The patch region intersects a region that is already patched
    #[error("patch region at {address:#x} overlaps the patch installed at {existing:#x}")]
    OverlappingPatch {
        /// Requested address
        address: usize,
        /// Address of the existing patch
        existing: usize,
    },
    /// The hook would run code that the patch itself replaces or generates
    #[error("hook {hook:#x} re-enters patched code for {address:#x}")]
    RecursiveHook {
        /// Requested address
        address: usize,
        /// Hook address
        hook: usize,
    },
    /// A relocation still points at an unknown successor
    #[error("relocation at offset {0} has no successor to resolve against")]
    UnresolvedRelocation(usize),
    /// A relative branch cannot reach its target
    #[error("branch from {from:#x} to {to:#x} does not fit in a rel32 displacement")]
    OutOfRange {
        /// Address of the next instruction
        from: u64,
        /// Branch target
        to: u64,
    },
    /// The target bytes are not valid instructions
    #[error("invalid instruction at {0:#x}")]
    Decode(usize),
    /// Error from the instruction encoder
    #[error("{0}")]
    Encode(#[from] IcedError),
    /// Error when setting memory protections
    #[error("error setting memory protections: {0}")]
    Protection(#[from] region::Error),
    /// Memory did not read back as written
    #[error("patched bytes at {0:#x} did not read back as written")]
    VerifyFailed(usize),
    /// No reachable memory for the trampoline
    #[error("{0}")]
    Allocation(#[from] ProximityError),
    /// Generated code is larger than the memory reserved for it
    #[error("trampoline needs {needed} bytes but only {reserved} were reserved")]
    TrampolineOverflow {
        /// Bytes generated
        needed: usize,
        /// Bytes allocated
        reserved: usize,
    },
    /// The location already carries a patch
    #[error("{0:#x} is already patched")]
    AlreadyPatched(usize),
    /// No patch is recorded for the location
    #[error("{0:#x} is not patched")]
    NotPatched(usize),
}

impl HookError {
    /// Classifies the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PatchTooSmall { .. }
            | Self::SplitInstruction { .. }
            | Self::InvalidRegister(_)
            | Self::OverlappingPatch { .. }
            | Self::RecursiveHook { .. }
            | Self::UnresolvedRelocation(_)
            | Self::NotPatched(_) => ErrorKind::Configuration,
            Self::OutOfRange { .. } | Self::Decode(_) | Self::Encode(_) => ErrorKind::Encoding,
            Self::Protection(_) | Self::VerifyFailed(_) => ErrorKind::Permission,
            Self::Allocation(_) | Self::TrampolineOverflow { .. } => ErrorKind::Allocation,
            Self::AlreadyPatched(_) => ErrorKind::Reentrancy,
        }
    }
}

impl From<PermissionError<WriteError>> for HookError {
    fn from(e: PermissionError<WriteError>) -> Self {
        match e {
            PermissionError::ProtectionError(e) => Self::Protection(e),
            PermissionError::CustomError(WriteError::Mismatch(address)) => {
                Self::VerifyFailed(address)
            }
        }
    }
}
