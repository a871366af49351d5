//! Domain model for crashscope
//!
//! Core types and errors shared by every component:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

pub use errors::{ReadError, SymbolError};
pub use types::{ProcessHandle, WordWidth};
