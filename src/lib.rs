//! # Crashscope - Post-Mortem Symbol Resolution and Stack Unwinding
//!
//! Crashscope turns raw instruction addresses in a crashed (or suspended)
//! foreign process into human-meaningful function names, source files and line
//! numbers, and reconstructs the chain of call frames that led there. It is
//! built for adverse conditions: the target may carry no debug information,
//! the OS symbol service may be missing or fail per-module, modules may be
//! relocated away from their link-time base, and every byte of target state
//! must come through a remote memory read rather than direct access.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    Stack Unwinder                        │
//! │   OS-assisted step  ──or──  manual frame-pointer chain   │
//! └───────────────────────┬──────────────────────────────────┘
//!                         │ per frame
//!                         ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │               Symbol Resolution Cascade                  │
//! │                (+ per-module cache)                      │
//! │                                                          │
//! │  ┌────────────┐   ┌─────────────┐   ┌───────────────┐    │
//! │  │ Object-    │──▶│ OS symbol   │──▶│ Export-table  │    │
//! │  │ file DWARF │   │ service     │   │ fallback      │    │
//! │  └────────────┘   └─────────────┘   └───────────────┘    │
//! └───────────────────────┬──────────────────────────────────┘
//!                         │
//!                         ▼
//!               ┌───────────────────┐
//!               │  Remote memory    │
//!               │  reader           │
//!               └───────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`memory`]: The remote memory read primitive every other component goes
//!   through, plus a snapshot-backed implementation for captured dumps.
//! - [`demangle`]: Toolchain name demangling (Rust and Itanium C++ manglings);
//!   failure falls back to the raw name and is never an error.
//! - [`resolve`]: The three-backend resolution cascade and the per-module
//!   symbol cache. Backends: on-disk DWARF (`addr2line`), the injected OS
//!   symbol service, and a PE export-directory scan of the live image.
//! - [`service`]: The OS symbol service capability trait and the scoped
//!   per-process session that brackets initialize/cleanup.
//! - [`unwind`]: The frame-by-frame stack unwinder with OS-assisted and
//!   manual frame-pointer-chain strategies.
//! - [`modules`]: Contracts for the external module tracker plus a simple
//!   ordered implementation.
//! - [`domain`]: Core types (process handles, word widths) and errors.
//!
//! ## Key Concepts
//!
//! - **Relocation delta**: difference between a module's load address and its
//!   link-time image base; applied once, before any lookup.
//! - **Displacement**: byte distance between a queried address and the start
//!   of the symbol that matched it.
//! - **Frame pointer chain**: each frame stores the previous frame's address
//!   at a fixed offset; the manual unwinder walks that list.
//!
//! Diagnostics go through the `log` facade; the embedding tool picks the
//! filter level. Verbosity never changes resolution outcomes.

pub mod demangle;
pub mod domain;
pub mod memory;
pub mod modules;
pub mod resolve;
pub mod service;
pub mod unwind;

pub use domain::errors::{ReadError, SymbolError};
pub use domain::types::{ProcessHandle, WordWidth};
pub use memory::{BufferMemory, ProcessMemory};
pub use modules::{Module, ModuleMap, ModuleTracker};
pub use resolve::{Resolver, SymbolInfo, SymbolSource};
pub use service::{ServiceLine, ServiceSession, ServiceSymbol, SymbolService};
pub use unwind::{Frame, RawFrame, RegisterContext, UnwindOptions, UnwindSession, Unwinder};
