//! Object-file symbol backend
//!
//! Richest of the three backends: opens the module's on-disk binary, loads
//! its DWARF line tables into an `addr2line` context, and answers address
//! queries with function, file and line. Relocated modules are handled by
//! recording the load delta once at open and translating every queried
//! run-time address back to link-time coordinates before any table lookup.
//!
//! Most modules in a real target have no debug information at all, so open
//! failures here are the expected path, not an incident.

use crate::demangle::demangle;
use crate::domain::errors::SymbolError;
use addr2line::Context;
use gimli::{EndianRcSlice, RunTimeEndian};
use log::debug;
use object::{Object, ObjectSection};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use super::{SymbolInfo, SymbolSource};

/// Opened symbol state for one module: the DWARF context plus the relocation
/// delta that maps run-time addresses back onto it.
pub struct ObjectSymbols {
    ctx: Context<EndianRcSlice<RunTimeEndian>>,
    /// `load_base - link_base`, wrapping. Applied to every lookup.
    delta: u64,
    path: PathBuf,
}

impl ObjectSymbols {
    /// Open `path` and load its debug information.
    ///
    /// `load_base` is where the image actually sits in the target;
    /// `link_base` is its link-time image base, with zero meaning "take it
    /// from the file". The relocation delta is fixed here, before any
    /// lookup; querying un-adjusted tables against a relocated module would
    /// silently return wrong symbols.
    ///
    /// # Errors
    /// [`SymbolError::NoSymbols`] for a binary without debug info (common),
    /// parse/IO errors for files that are not usable object files.
    pub fn open(path: &Path, load_base: u64, link_base: u64) -> Result<Self, SymbolError> {
        let data = fs::read(path)?;
        let obj = object::File::parse(&*data)?;

        let has_debug_info = obj
            .section_by_name(".debug_info")
            .and_then(|s| s.uncompressed_data().ok())
            .is_some_and(|d| !d.is_empty());
        if !has_debug_info {
            return Err(SymbolError::NoSymbols {
                path: path.to_path_buf(),
                reason: "missing .debug_info".into(),
            });
        }

        let endian =
            if obj.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

        let load_section =
            |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
                let data = obj
                    .section_by_name(id.name())
                    .and_then(|section| section.uncompressed_data().ok())
                    .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
                Ok(EndianRcSlice::new(Rc::from(&*data), endian))
            };

        let dwarf = gimli::Dwarf::load(&load_section)?;
        let ctx = Context::from_dwarf(dwarf)?;

        let link_base = if link_base != 0 { link_base } else { obj.relative_address_base() };
        let delta = load_base.wrapping_sub(link_base);
        if delta != 0 {
            debug!(
                "{}: adjusting addresses from {link_base:#x} to {load_base:#x} (delta {delta:#x})",
                path.display()
            );
        }

        Ok(Self { ctx, delta, path: path.to_path_buf() })
    }

    /// Function and source line owning the run-time address `addr`.
    ///
    /// A match with an empty function name or line zero is a miss: line 0 is
    /// how the tables spell "no reliable match", not "line zero".
    ///
    /// # Errors
    /// DWARF evaluation errors; the cascade treats them as fallthrough.
    pub fn lookup(&self, addr: u64) -> Result<Option<SymbolInfo>, SymbolError> {
        let probe = addr.wrapping_sub(self.delta);

        let Some(location) = self.ctx.find_location(probe)? else {
            debug!("{}: no line info for {addr:#x}", self.path.display());
            return Ok(None);
        };
        let line = location.line.unwrap_or(0);
        if line == 0 {
            return Ok(None);
        }
        let file = location.file.map(PathBuf::from);

        // Innermost inline frames come first; the concrete function owning
        // the address is the last one.
        let mut raw_name = None;
        let mut frames = self.ctx.find_frames(probe).skip_all_loads()?;
        while let Some(frame) = frames.next()? {
            if let Some(func) = frame.function {
                if let Ok(name) = func.raw_name() {
                    raw_name = Some(name.into_owned());
                }
            }
        }
        let Some(raw_name) = raw_name.filter(|n| !n.is_empty()) else {
            return Ok(None);
        };

        let (name, demangled) = demangle(&raw_name);
        Ok(Some(SymbolInfo {
            name,
            demangled,
            file,
            line: Some(line),
            displacement: 0,
            source: SymbolSource::DebugInfo,
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Stable address anchor inside this test module. Never inlined so the
    /// function genuinely owns its address range in the line tables.
    #[inline(never)]
    pub(crate) fn probe_anchor() -> u64 {
        std::hint::black_box(0xc0de)
    }

    /// Lowest mapped address of the running test executable, from
    /// /proc/self/maps. PIE executables link at base zero, so this is also
    /// the relocation delta.
    pub(crate) fn load_base_of_current_exe() -> Option<(PathBuf, u64)> {
        let exe = std::env::current_exe().ok()?;
        let exe_str = exe.to_str()?;
        let maps = fs::read_to_string("/proc/self/maps").ok()?;
        let mut base: Option<u64> = None;
        for line in maps.lines() {
            if line.ends_with(exe_str) {
                let start = u64::from_str_radix(line.split('-').next()?, 16).ok()?;
                base = Some(base.map_or(start, |b| b.min(start)));
            }
        }
        base.map(|b| (exe, b))
    }

    #[test]
    fn test_lookup_in_own_executable() {
        let Some((exe, base)) = load_base_of_current_exe() else {
            // No /proc on this platform; nothing to assert against.
            return;
        };
        let addr = probe_anchor as usize as u64;

        let syms = ObjectSymbols::open(&exe, base, 0).expect("test binary has debug info");
        let info = syms.lookup(addr).unwrap().expect("anchor should resolve");

        assert!(info.name.contains("probe_anchor"), "got {}", info.name);
        assert!(info.line.unwrap() > 0);
        assert!(info.file.unwrap().to_string_lossy().contains("object_file"));
        assert_eq!(info.source, SymbolSource::DebugInfo);
    }

    #[test]
    fn test_relocation_delta_is_load_minus_link() {
        let Some((exe, base)) = load_base_of_current_exe() else {
            return;
        };
        let addr = probe_anchor as usize as u64;
        let shift = 0x10_0000u64;

        let at_real_base = ObjectSymbols::open(&exe, base, 0).unwrap();
        let shifted = ObjectSymbols::open(&exe, base + shift, 0).unwrap();

        let a = at_real_base.lookup(addr).unwrap().unwrap();
        let b = shifted.lookup(addr + shift).unwrap().unwrap();
        assert_eq!(a.name, b.name);
        assert_eq!(a.line, b.line);
    }

    #[test]
    fn test_binary_without_debug_info_reports_no_symbols() {
        use std::io::Write;

        // A minimal but well-formed 64-bit little-endian ELF header with no
        // sections at all.
        let mut elf = vec![0u8; 64];
        elf[..4].copy_from_slice(b"\x7fELF");
        elf[4] = 2; // ELFCLASS64
        elf[5] = 1; // little endian
        elf[6] = 1; // EV_CURRENT
        elf[16] = 2; // ET_EXEC
        elf[18] = 0x3e; // EM_X86_64
        elf[20] = 1; // version
        elf[52] = 64; // e_ehsize
        elf[54] = 56; // e_phentsize
        elf[58] = 64; // e_shentsize

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&elf).unwrap();

        let err = ObjectSymbols::open(file.path(), 0x1000, 0).err().unwrap();
        assert!(matches!(err, SymbolError::NoSymbols { .. }), "got {err}");
    }

    #[test]
    fn test_garbage_file_is_not_an_object() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definitely not an object file").unwrap();

        let err = ObjectSymbols::open(file.path(), 0x1000, 0).err().unwrap();
        assert!(!err.is_fatal());
    }
}
