//! Export-table symbol backend
//!
//! Last resort when a module has neither on-disk debug info nor OS-service
//! symbols: any well-formed dynamic library still carries a PE export
//! directory, so the nearest exported function at or below an address gives
//! at least a name. The directory is parsed out of the *live* image through
//! the remote memory reader, not from the on-disk file, so it is valid at
//! the module's actual load address.
//!
//! Every count and offset pulled from target memory is validated before it
//! is trusted: reads must complete in full, and entry counts are capped
//! before any allocation or scan. A corrupt image yields a malformed-image
//! error, never a wild read.

use crate::demangle::MAX_SYM_NAME;
use crate::domain::errors::{ReadError, SymbolError};
use crate::memory::ProcessMemory;
use crate::modules::Module;
use log::debug;

use super::{SymbolInfo, SymbolSource};

const DOS_MAGIC: u16 = 0x5a4d; // "MZ"
const E_LFANEW_OFFSET: u64 = 0x3c;
const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
const OPT_MAGIC_PE32: u16 = 0x10b;
const OPT_MAGIC_PE32_PLUS: u16 = 0x20b;
const SECTION_HEADER_SIZE: u64 = 40;
const EXPORT_SECTION_NAME: &[u8; 8] = b".edata\0\0";

/// Upper bound on export-directory entry counts. The counts come straight
/// from target memory and size the scan, so they must be bounded before use.
pub const MAX_EXPORT_ENTRIES: u32 = 65_536;

fn malformed(what: &str, reason: impl Into<String>) -> SymbolError {
    SymbolError::MalformedImage { what: what.into(), reason: reason.into() }
}

/// Nearest exported symbol at or below `addr` in `module`'s live image.
///
/// Name only: exports carry no file or line, and export names are typically
/// plain C names, so no demangling is applied. `Ok(None)` when the image has
/// no export directory or no export sits at or below the address.
///
/// # Errors
/// [`SymbolError::Read`] when target memory is unreadable (fatal to the
/// caller's step); [`SymbolError::MalformedImage`] for structures that do
/// not validate (cascade fallthrough).
pub fn find_export(
    memory: &dyn ProcessMemory,
    module: &Module,
    addr: u64,
) -> Result<Option<SymbolInfo>, SymbolError> {
    let base = module.base;

    if memory.read_u16(base)? != DOS_MAGIC {
        return Err(malformed("DOS header", "bad magic"));
    }
    let e_lfanew = u64::from(memory.read_u32(base + E_LFANEW_OFFSET)?);
    let nt = base + e_lfanew;
    if memory.read_u32(nt)? != PE_SIGNATURE {
        return Err(malformed("NT headers", "bad PE signature"));
    }

    // IMAGE_FILE_HEADER follows the signature; the optional header follows
    // that, with the section table after it.
    let number_of_sections = memory.read_u16(nt + 6)?;
    let size_of_optional = u64::from(memory.read_u16(nt + 20)?);
    let optional = nt + 24;
    let sections = optional + size_of_optional;

    let data_dir_offset = match memory.read_u16(optional)? {
        OPT_MAGIC_PE32 => 96,
        OPT_MAGIC_PE32_PLUS => 112,
        other => return Err(malformed("optional header", format!("bad magic {other:#x}"))),
    };

    // Export directory: the explicit data-directory entry when present,
    // else a section literally named for exports.
    let mut export_rva = if size_of_optional >= data_dir_offset + 8 {
        u64::from(memory.read_u32(optional + data_dir_offset)?)
    } else {
        0
    };
    if export_rva == 0 {
        for i in 0..u64::from(number_of_sections) {
            let header = sections + i * SECTION_HEADER_SIZE;
            let mut name = [0u8; 8];
            memory.read_exact(header, &mut name)?;
            if &name == EXPORT_SECTION_NAME {
                export_rva = u64::from(memory.read_u32(header + 12)?);
                break;
            }
        }
    }
    if export_rva == 0 {
        debug!("{base:#x}: no export directory");
        return Ok(None);
    }

    let dir = base + export_rva;
    let number_of_functions = memory.read_u32(dir + 20)?;
    let number_of_names = memory.read_u32(dir + 24)?;
    if number_of_functions > MAX_EXPORT_ENTRIES || number_of_names > MAX_EXPORT_ENTRIES {
        return Err(malformed(
            "export directory",
            format!("entry counts out of bounds ({number_of_functions}/{number_of_names})"),
        ));
    }
    let functions = base + u64::from(memory.read_u32(dir + 28)?);
    let names = base + u64::from(memory.read_u32(dir + 32)?);

    // Parallel scan of the function-RVA and name-RVA arrays, keeping the
    // greatest exported address that does not exceed the query.
    let entries = u64::from(number_of_functions.min(number_of_names));
    let mut nearest: Option<(u64, u64)> = None;
    for j in 0..entries {
        let func_rva = memory.read_u32(functions + j * 4)?;
        if func_rva == 0 {
            continue; // unused export slot
        }
        let func_addr = base + u64::from(func_rva);
        if func_addr <= addr && nearest.is_none_or(|(best, _)| func_addr > best) {
            let name_rva = memory.read_u32(names + j * 4)?;
            nearest = Some((func_addr, base + u64::from(name_rva)));
        }
    }
    let Some((func_addr, name_addr)) = nearest else {
        return Ok(None);
    };

    let name = read_name(memory, name_addr)?;
    if name.is_empty() {
        return Ok(None);
    }
    Ok(Some(SymbolInfo {
        name,
        demangled: false,
        file: None,
        line: None,
        displacement: addr - func_addr,
        source: SymbolSource::Export,
    }))
}

/// Read a NUL-terminated name, truncated to [`MAX_SYM_NAME`]. A read failure
/// mid-string keeps the prefix already fetched; a failure on the first byte
/// propagates.
fn read_name(memory: &dyn ProcessMemory, addr: u64) -> Result<String, ReadError> {
    let mut bytes = Vec::new();
    for offset in 0..MAX_SYM_NAME as u64 {
        let mut byte = [0u8; 1];
        match memory.read_exact(addr + offset, &mut byte) {
            Ok(()) if byte[0] == 0 => break,
            Ok(()) => bytes.push(byte[0]),
            Err(e) if bytes.is_empty() => return Err(e),
            Err(_) => break,
        }
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
