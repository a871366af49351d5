//! Newtypes shared across the engine

use std::fmt;

/// Opaque handle identifying one target process.
///
/// The engine never interprets the value; it only keys per-process state
/// (symbol-service sessions, module caches) and is echoed into callbacks so
/// collaborators can map it back to whatever their OS uses for a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessHandle(pub u64);

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target:{:#x}", self.0)
    }
}

/// Pointer width of the target process.
///
/// The reference calling convention is 32-bit, but nothing in the engine
/// assumes it; frame walking reads words of this size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WordWidth {
    /// 32-bit target
    Four,
    /// 64-bit target
    #[default]
    Eight,
}

impl WordWidth {
    /// Word size in bytes.
    #[must_use]
    pub fn bytes(self) -> u64 {
        match self {
            Self::Four => 4,
            Self::Eight => 8,
        }
    }
}
