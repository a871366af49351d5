//! Module tracking contracts
//!
//! Enumerating which modules a target has loaded belongs to the surrounding
//! tool; the engine only needs to ask "which module owns this address" and
//! "where is its on-disk file". [`ModuleTracker`] is that contract, and
//! [`ModuleMap`] is a straightforward ordered implementation for embedders
//! that already have the module list in hand.

use crate::domain::types::ProcessHandle;
use std::path::{Path, PathBuf};

/// A binary image loaded in a target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Module {
    /// Address the image is actually loaded at.
    pub base: u64,
    /// Link-time image base. Zero means "ask the on-disk file", which is the
    /// common case for position-independent ELF images.
    pub link_base: u64,
    /// Size of the mapped image in bytes.
    pub size: u64,
}

impl Module {
    /// Whether `addr` falls inside this image's `[base, base + size)` range.
    /// Safe for modules mapped at the very end of the address space.
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.size
    }

    /// Relocation delta: how far the image moved from its link-time base.
    /// Wrapping arithmetic so a downward relocation round-trips exactly.
    #[must_use]
    pub fn relocation_delta(&self, link_base: u64) -> u64 {
        self.base.wrapping_sub(link_base)
    }
}

/// External collaborator that knows the target's loaded modules.
pub trait ModuleTracker {
    /// Module owning `addr` in `target`, if any. Implementations must be
    /// deterministic when listings overlap; ordering by (process, base
    /// address) and taking the first match is the expected discipline.
    fn module_containing(&self, target: ProcessHandle, addr: u64) -> Option<Module>;

    /// On-disk path of the module's binary, when one exists.
    fn file_path_of(&self, target: ProcessHandle, module: &Module) -> Option<PathBuf>;
}

/// Ordered in-memory [`ModuleTracker`].
///
/// Entries are kept sorted by (process, base address) so lookups against
/// overlapping listings resolve deterministically.
#[derive(Debug, Default)]
pub struct ModuleMap {
    entries: Vec<(ProcessHandle, Module, PathBuf)>,
}

impl ModuleMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, target: ProcessHandle, module: Module, path: impl AsRef<Path>) {
        self.entries.push((target, module, path.as_ref().to_path_buf()));
        self.entries.sort_by_key(|(t, m, _)| (*t, m.base));
    }
}

impl ModuleTracker for ModuleMap {
    fn module_containing(&self, target: ProcessHandle, addr: u64) -> Option<Module> {
        self.entries
            .iter()
            .find(|(t, m, _)| *t == target && m.contains(addr))
            .map(|(_, m, _)| *m)
    }

    fn file_path_of(&self, target: ProcessHandle, module: &Module) -> Option<PathBuf> {
        self.entries
            .iter()
            .find(|(t, m, _)| *t == target && m.base == module.base)
            .map(|(_, _, p)| p.clone())
    }
}
