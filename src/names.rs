//! Symbol name normalization
//!
//! Callee and function names are compared against annotation sets after
//! demangling and after dropping compiler-generated clone suffixes such as
//! `.constprop.0` or `.isra.3`.

use std::borrow::Cow;

/// Demangle a Rust or C++ symbol; plain C names come back unchanged
pub fn demangle(name: &str) -> Cow<'_, str> {
    addr2line::demangle_auto(Cow::Borrowed(name), None)
}

/// Keep everything before the first `.`
pub fn strip_suffix(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

/// Demangle, then strip clone suffixes
pub fn normalize(name: &str) -> String {
    strip_suffix(&demangle(name)).to_string()
}
