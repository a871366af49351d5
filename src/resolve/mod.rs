//! Symbol resolution cascade and per-module symbol cache
//!
//! Three backends, tried in fixed order: on-disk debug info (richest, gives
//! lines), the OS symbol service (partial/public symbols), and the export
//! table scraped from the live image (name only, but present in any
//! well-formed dynamic library). First success wins. Whichever backend
//! answers for a module is remembered in a per-module cache, so the other
//! frames of an unwind skip straight to it instead of re-opening the file.
//!
//! A backend's internal failure (bad format, no symbols, malformed export
//! directory) is logged and falls through to the next backend; only a remote
//! read failure aborts, since no backend can proceed without target memory.

pub mod exports;
pub mod object_file;

use crate::domain::errors::SymbolError;
use crate::domain::types::ProcessHandle;
use crate::memory::ProcessMemory;
use crate::modules::{Module, ModuleTracker};
use crate::service::{ServiceSession, SymbolService};
use crate::unwind::RawFrame;
use log::{debug, warn};
use object_file::ObjectSymbols;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::rc::Rc;

/// Which backend produced a [`SymbolInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolSource {
    /// On-disk object file debug information.
    DebugInfo,
    /// OS symbol service.
    Service,
    /// Export-table scan of the live image.
    Export,
}

/// Result of a successful symbol lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    /// Display name: demangled when demangling succeeded, raw otherwise.
    pub name: String,
    /// Whether `name` was successfully demangled.
    pub demangled: bool,
    pub file: Option<PathBuf>,
    pub line: Option<u32>,
    /// Bytes between the queried address and the matched symbol's start.
    pub displacement: u64,
    pub source: SymbolSource,
}

/// Opened symbol state for one module: which backend answered first, plus
/// that backend's state where it has any. Created at most once per module
/// per process lifetime and reused read-only afterwards.
enum SymbolHandle {
    DebugInfo(ObjectSymbols),
    Service,
    Export,
    Unavailable,
}

/// The symbol resolution cascade.
///
/// Holds the per-module symbol cache and the per-target symbol-service
/// sessions. Single-threaded by design; embedders serving several targets
/// concurrently give each its own `Resolver`.
pub struct Resolver<'a> {
    tracker: &'a dyn ModuleTracker,
    memory: &'a dyn ProcessMemory,
    service: Option<&'a dyn SymbolService>,
    sessions: RefCell<HashMap<ProcessHandle, ServiceSession<'a>>>,
    /// Targets whose service initialization failed this session; the
    /// service backend stays disabled for them until the session ends.
    failed_targets: RefCell<HashSet<ProcessHandle>>,
    cache: RefCell<HashMap<(ProcessHandle, u64), Rc<SymbolHandle>>>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        tracker: &'a dyn ModuleTracker,
        memory: &'a dyn ProcessMemory,
        service: Option<&'a dyn SymbolService>,
    ) -> Self {
        Self {
            tracker,
            memory,
            service,
            sessions: RefCell::new(HashMap::new()),
            failed_targets: RefCell::new(HashSet::new()),
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Resolve `addr` in `target` to a symbol, trying backends in priority
    /// order and caching the winner per module.
    ///
    /// `Ok(None)` when no module owns the address or no backend matched.
    ///
    /// # Errors
    /// Only remote read failures surface; every backend-internal failure is
    /// cascade fallthrough.
    pub fn resolve(
        &self,
        target: ProcessHandle,
        addr: u64,
    ) -> Result<Option<SymbolInfo>, SymbolError> {
        let Some(module) = self.tracker.module_containing(target, addr) else {
            debug!("{addr:#x}: no owning module");
            return Ok(None);
        };

        let key = (target, module.base);
        let cached = self.cache.borrow().get(&key).cloned();
        if let Some(handle) = cached {
            return self.lookup_cached(&handle, target, &module, addr);
        }

        let (handle, info) = self.first_resolution(target, &module, addr)?;
        self.cache.borrow_mut().insert(key, handle);
        Ok(info)
    }

    /// First query against a module: run the full cascade and record which
    /// backend answered.
    fn first_resolution(
        &self,
        target: ProcessHandle,
        module: &Module,
        addr: u64,
    ) -> Result<(Rc<SymbolHandle>, Option<SymbolInfo>), SymbolError> {
        // 1. Object-file debug info
        if let Some(path) = self.tracker.file_path_of(target, module) {
            match ObjectSymbols::open(&path, module.base, module.link_base) {
                Ok(obj) => match obj.lookup(addr) {
                    Ok(Some(info)) => {
                        return Ok((Rc::new(SymbolHandle::DebugInfo(obj)), Some(info)));
                    }
                    Ok(None) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => debug!("{}: debug lookup failed: {e}", path.display()),
                },
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => debug!("{e}"),
            }
        }

        // 2. OS symbol service
        if let Some(info) = self.service_lookup(target, addr) {
            return Ok((Rc::new(SymbolHandle::Service), Some(info)));
        }

        // 3. Export table of the live image
        match exports::find_export(self.memory, module, addr) {
            Ok(Some(info)) => return Ok((Rc::new(SymbolHandle::Export), Some(info))),
            Ok(None) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => debug!("export scan of {:#x} failed: {e}", module.base),
        }

        debug!("no symbols for module at {:#x}", module.base);
        Ok((Rc::new(SymbolHandle::Unavailable), None))
    }

    /// Repeat query against a module whose backend is already known.
    fn lookup_cached(
        &self,
        handle: &SymbolHandle,
        target: ProcessHandle,
        module: &Module,
        addr: u64,
    ) -> Result<Option<SymbolInfo>, SymbolError> {
        let result = match handle {
            SymbolHandle::DebugInfo(obj) => obj.lookup(addr),
            SymbolHandle::Service => Ok(self.service_lookup(target, addr)),
            SymbolHandle::Export => exports::find_export(self.memory, module, addr),
            SymbolHandle::Unavailable => Ok(None),
        };
        match result {
            Err(e) if !e.is_fatal() => {
                debug!("cached backend missed {addr:#x}: {e}");
                Ok(None)
            }
            other => other,
        }
    }

    /// Symbol + line lookup through the service session, demangled by the
    /// service's demangler. The line probe's offset wins over the symbol
    /// displacement when the probe had to walk backwards.
    fn service_lookup(&self, target: ProcessHandle, addr: u64) -> Option<SymbolInfo> {
        self.with_session(target, |session| {
            let (name, demangled, sym_disp) = session.find_symbol(addr)?;
            let (file, line, displacement) = match session.find_line_probed(addr) {
                Some((line, 0)) => (Some(line.file), Some(line.line), sym_disp),
                Some((line, probe)) => (Some(line.file), Some(line.line), probe),
                None => (None, None, sym_disp),
            };
            Some(SymbolInfo {
                name,
                demangled,
                file,
                line,
                displacement,
                source: SymbolSource::Service,
            })
        })
        .flatten()
    }

    fn with_session<T>(
        &self,
        target: ProcessHandle,
        f: impl FnOnce(&ServiceSession<'a>) -> T,
    ) -> Option<T> {
        if !self.ensure_session(target) {
            return None;
        }
        let sessions = self.sessions.borrow();
        sessions.get(&target).map(f)
    }

    /// Initialize the service session for `target` once; a failed
    /// initialization disables the service backend for this target until
    /// [`end_session`](Self::end_session).
    fn ensure_session(&self, target: ProcessHandle) -> bool {
        if self.sessions.borrow().contains_key(&target) {
            return true;
        }
        if self.failed_targets.borrow().contains(&target) {
            return false;
        }
        let Some(service) = self.service else {
            self.failed_targets.borrow_mut().insert(target);
            return false;
        };
        match ServiceSession::initialize(service, target) {
            Ok(session) => {
                self.sessions.borrow_mut().insert(target, session);
                true
            }
            Err(e) => {
                warn!("symbol service initialization failed for {target}: {e}");
                self.failed_targets.borrow_mut().insert(target);
                false
            }
        }
    }

    /// Bring the service up for `target` if possible. Called by the
    /// unwinder at session start; the result selects the unwind mode.
    pub fn service_ready(&self, target: ProcessHandle) -> bool {
        self.ensure_session(target)
    }

    /// One OS-assisted unwind step through the target's service session.
    pub fn unwind_step(
        &self,
        target: ProcessHandle,
        memory: &dyn ProcessMemory,
        frame: &RawFrame,
    ) -> Option<RawFrame> {
        let sessions = self.sessions.borrow();
        sessions.get(&target).and_then(|s| s.unwind_step(memory, frame))
    }

    /// End the unwind session for `target`: runs the service cleanup and
    /// re-arms a previously failed initialization for the next session.
    pub fn end_session(&self, target: ProcessHandle) {
        self.sessions.borrow_mut().remove(&target);
        self.failed_targets.borrow_mut().remove(&target);
    }
}
