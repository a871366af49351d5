//! Structured error types for crashscope
//!
//! Using thiserror for automatic Display implementation and error chaining.
//!
//! The split matters to the resolution cascade: [`ReadError`] means target
//! memory could not be observed and aborts the current step, while every
//! other [`SymbolError`] variant is an expected per-backend outcome that the
//! cascade logs and falls through.

use super::types::ProcessHandle;
use std::path::PathBuf;
use thiserror::Error;

/// Failure of the remote memory read primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// The target returned fewer bytes than requested. `got` lets callers
    /// distinguish a truncated mapping from no access at all.
    #[error("short read at {addr:#x}: {got} of {wanted} bytes")]
    Short { addr: u64, wanted: usize, got: usize },

    /// The address is not mapped (or not readable) in the target.
    #[error("unreadable address {addr:#x}")]
    Unmapped { addr: u64 },
}

/// Failure of a symbol backend or of session bookkeeping.
#[derive(Error, Debug)]
pub enum SymbolError {
    /// Target memory could not be read. Fatal to the current resolution.
    #[error(transparent)]
    Read(#[from] ReadError),

    /// The on-disk binary has no usable debug information. Expected and
    /// common; triggers cascade fallthrough.
    #[error("{path}: no symbols ({reason})", path = .path.display())]
    NoSymbols { path: PathBuf, reason: String },

    /// A binary structure did not parse as expected (bad magic, counts out
    /// of bounds, truncated directory).
    #[error("malformed image in {what}: {reason}")]
    MalformedImage { what: String, reason: String },

    /// No OS symbol service was injected, or it failed to come up.
    #[error("symbol service unavailable")]
    ServiceUnavailable,

    /// One initialize/cleanup pair brackets one session; a second
    /// initialize against the same target is a caller bug.
    #[error("symbol service already initialized for {0}")]
    AlreadyInitialized(ProcessHandle),

    #[error(transparent)]
    Dwarf(#[from] gimli::Error),

    #[error(transparent)]
    Object(#[from] object::read::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SymbolError {
    /// True when the error must abort resolution instead of letting the
    /// cascade try the next backend.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Read(_))
    }
}
