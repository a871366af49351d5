//! OS symbol service capability
//!
//! The OS-maintained debug-information service (the dbghelp-style engine that
//! knows PDB-equivalent symbol data and can walk frames with unwind tables)
//! is optional equipment. Instead of probing for it on every call, the
//! embedder resolves it once and injects it as an implementation of
//! [`SymbolService`]; a target without one simply injects nothing and the
//! engine degrades cleanly.
//!
//! [`ServiceSession`] is the per-process symbol context: it pairs exactly one
//! `initialize` with exactly one `cleanup` (on drop, so every exit path is
//! covered) and carries the compensating line-probe behavior the service
//! needs for non-exact line queries.

use crate::demangle::bounded;
use crate::domain::errors::SymbolError;
use crate::domain::types::ProcessHandle;
use crate::memory::ProcessMemory;
use crate::unwind::RawFrame;
use log::debug;
use std::path::PathBuf;

/// How far [`ServiceSession::find_line_probed`] walks backwards, in one-byte
/// steps, before giving up. The service only matches line-table entries
/// exactly after its first hit in a module, so without this probe most
/// secondary line lookups in a frame sequence would spuriously fail.
pub const LINE_PROBE_LIMIT: u64 = 100;

/// Symbol match returned by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSymbol {
    /// Raw (possibly mangled) name.
    pub name: String,
    /// Bytes between the queried address and the symbol's start.
    pub displacement: u64,
}

/// Line match returned by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLine {
    pub file: PathBuf,
    pub line: u32,
}

/// Capability object for an OS-provided symbol service.
///
/// All methods take the target handle explicitly; implementations keep
/// whatever per-process state their OS requires, keyed by that handle.
pub trait SymbolService {
    /// Bring the service up for `target`. Must be paired with exactly one
    /// [`cleanup`](Self::cleanup); initializing an already-initialized
    /// target must fail with [`SymbolError::AlreadyInitialized`].
    fn initialize(&self, target: ProcessHandle) -> Result<(), SymbolError>;

    /// Release per-process service state.
    fn cleanup(&self, target: ProcessHandle);

    /// Symbol owning `addr`, with displacement from its start.
    fn find_symbol(&self, target: ProcessHandle, addr: u64) -> Option<ServiceSymbol>;

    /// Source line at exactly `addr`. Callers wanting tolerant matching go
    /// through [`ServiceSession::find_line_probed`].
    fn find_line(&self, target: ProcessHandle, addr: u64) -> Option<ServiceLine>;

    /// Service-side demangler for names this service produced.
    fn demangle(&self, mangled: &str) -> Option<String>;

    /// One OS-assisted unwind step: given the current frame, produce the
    /// caller's frame using the service's unwind tables, reading target
    /// state through `memory` only.
    fn unwind_step(
        &self,
        target: ProcessHandle,
        memory: &dyn ProcessMemory,
        frame: &RawFrame,
    ) -> Option<RawFrame>;
}

/// Scoped initialize/cleanup bracket for one target process.
///
/// Owning a `ServiceSession` is the proof that the service is up for that
/// target; dropping it runs cleanup, including on early termination paths.
pub struct ServiceSession<'a> {
    service: &'a dyn SymbolService,
    target: ProcessHandle,
}

impl<'a> ServiceSession<'a> {
    /// Initialize the service for `target`.
    ///
    /// # Errors
    /// Whatever the service reports, notably
    /// [`SymbolError::AlreadyInitialized`] on a double bracket.
    pub fn initialize(
        service: &'a dyn SymbolService,
        target: ProcessHandle,
    ) -> Result<Self, SymbolError> {
        service.initialize(target)?;
        debug!("symbol service initialized for {target}");
        Ok(Self { service, target })
    }

    #[must_use]
    pub fn target(&self) -> ProcessHandle {
        self.target
    }

    /// Symbol lookup with the service demangler applied.
    ///
    /// Returns the display name (demangled when the service managed it, raw
    /// otherwise, always bounded), the demangle-success flag, and the
    /// displacement.
    pub fn find_symbol(&self, addr: u64) -> Option<(String, bool, u64)> {
        let sym = self.service.find_symbol(self.target, addr)?;
        match self.service.demangle(&sym.name) {
            Some(demangled) => Some((bounded(demangled), true, sym.displacement)),
            None => Some((bounded(sym.name), false, sym.displacement)),
        }
    }

    /// Line lookup with the bounded backward probe.
    ///
    /// Walks back from `addr` one byte at a time, up to [`LINE_PROBE_LIMIT`]
    /// steps, until the service matches a line-table entry; the probe offset
    /// is reported as the displacement when nonzero. Exhausting the budget
    /// is a miss.
    pub fn find_line_probed(&self, addr: u64) -> Option<(ServiceLine, u64)> {
        for disp in 0..LINE_PROBE_LIMIT {
            let Some(probe) = addr.checked_sub(disp) else { break };
            if let Some(line) = self.service.find_line(self.target, probe) {
                if disp != 0 {
                    debug!("line for {addr:#x} found {disp} bytes back");
                }
                return Some((line, disp));
            }
        }
        None
    }

    /// One OS-assisted unwind step. See [`SymbolService::unwind_step`].
    pub fn unwind_step(&self, memory: &dyn ProcessMemory, frame: &RawFrame) -> Option<RawFrame> {
        self.service.unwind_step(self.target, memory, frame)
    }
}

impl Drop for ServiceSession<'_> {
    fn drop(&mut self) {
        self.service.cleanup(self.target);
        debug!("symbol service cleaned up for {}", self.target);
    }
}
