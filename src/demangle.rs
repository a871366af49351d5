//! Toolchain name demangling
//!
//! Resolved names from the object-file backend arrive compiler-mangled.
//! [`demangle`] tries the Rust mangling first, then the Itanium C++ scheme.
//! Failure is not an error: the raw name is returned unchanged and the caller
//! keeps going. Names sourced from the OS symbol service go through that
//! service's own demangler instead (see `service`), never through this one.

use log::debug;

/// Upper bound on a demangled display name, matching the largest symbol
/// buffer the engine hands to any backend.
pub const MAX_SYM_NAME: usize = 4096;

/// Demangle a compiler-mangled symbol name.
///
/// Returns the display name and whether demangling succeeded. On failure the
/// display name is the input, unchanged, and the flag is `false`; callers
/// must never fail a lookup on account of it.
#[must_use]
pub fn demangle(mangled: &str) -> (String, bool) {
    if let Ok(sym) = rustc_demangle::try_demangle(mangled) {
        return (bounded(format!("{sym:#}")), true);
    }
    if let Ok(sym) = cpp_demangle::Symbol::new(mangled) {
        if let Ok(out) = sym.demangle(&cpp_demangle::DemangleOptions::default()) {
            return (bounded(out), true);
        }
    }
    debug!("demangle: leaving {mangled:?} as-is");
    (mangled.to_string(), false)
}

/// Truncate to [`MAX_SYM_NAME`] without splitting a UTF-8 sequence.
pub(crate) fn bounded(mut name: String) -> String {
    if name.len() > MAX_SYM_NAME {
        let mut end = MAX_SYM_NAME;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_name_falls_back_unchanged() {
        let (name, ok) = demangle("main");
        assert_eq!(name, "main");
        assert!(!ok);
    }

    #[test]
    fn test_cpp_mangled_name() {
        let (name, ok) = demangle("_ZNSt6vectorIiSaIiEE9push_backERKi");
        assert!(ok);
        assert!(name.contains("push_back"), "got {name}");
    }

    #[test]
    fn test_rust_mangled_name() {
        let (name, ok) = demangle("_ZN4core3ptr13drop_in_place17h1c559152b3d2fd07E");
        assert!(ok);
        assert_eq!(name, "core::ptr::drop_in_place");
    }

    #[test]
    fn test_bounded_truncates_on_char_boundary() {
        let long = "é".repeat(MAX_SYM_NAME); // 2 bytes per char
        let out = bounded(long);
        assert!(out.len() <= MAX_SYM_NAME);
        assert!(out.ends_with('é'));
    }
}
