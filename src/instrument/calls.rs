//! Direct call classification

/// Callees that are compiler bookkeeping rather than program behaviour
pub const SKIPPED_CALL_PREFIXES: [&str; 9] = [
    "llvm.lifetime",
    "llvm.dbg",
    "llvm.objectsize",
    "llvm.expect",
    "llvm.trap",
    "llvm.ubsan",
    "llvm.assume",
    "__asan_load",
    "__asan_store",
];

const DAX_ACCESS: &str = "dax_direct_access";

const USER_COPY_NT: [&str; 2] = ["__copy_from_user_inatomic_nocache", "__copy_user_nocache"];

const USER_COPY: [&str; 18] = [
    "__copy_from_user_inatomic",
    "__copy_from_user",
    "__copy_to_user_inatomic",
    "__copy_to_user",
    "_copy_from_user",
    "_copy_to_user",
    "copy_from_user",
    "copy_to_user",
    "copy_in_user",
    "strncpy_from_unsafe",
    "__strncpy_from_user",
    "strncpy_from_user",
    "__arch_copy_from_user",
    "__arch_copy_to_user",
    "raw_copy_in_user",
    "copy_user_enhanced_fast_string",
    "copy_user_generic_string",
    "copy_user_generic_unrolled",
];

const USER_READ: [&str; 2] = ["__get_user", "get_user"];

const RAW_TRANSFER: [&str; 4] = ["memcpy", "memmove", "__memcpy_mcsafe", "strncpy"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    /// Maps a persistent-memory device window
    DaxAccess,
    UserCopyNonTemporal,
    UserCopy,
    /// Single-value user reads; not traced
    UserRead,
    RawTransfer,
    RawSet,
    StringCompare,
    CentralizedFlush,
    Other,
}

impl CallClass {
    pub fn is_user_copy(self) -> bool {
        matches!(self, CallClass::UserCopy | CallClass::UserCopyNonTemporal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Acquire,
    Release,
}

pub fn is_skipped_callee(name: &str) -> bool {
    SKIPPED_CALL_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// User-space copy helpers, as passed to uaccess asm alternatives
pub fn is_user_copy_helper(name: &str) -> bool {
    USER_COPY.contains(&name) || USER_COPY_NT.contains(&name)
}

/// Classify a normalized callee name
pub fn classify_call(name: &str, flush_helpers: &[String]) -> CallClass {
    if name == DAX_ACCESS {
        CallClass::DaxAccess
    } else if USER_COPY_NT.contains(&name) {
        CallClass::UserCopyNonTemporal
    } else if USER_COPY.contains(&name) {
        CallClass::UserCopy
    } else if USER_READ.contains(&name) {
        CallClass::UserRead
    } else if RAW_TRANSFER.contains(&name) {
        CallClass::RawTransfer
    } else if name == "memset" {
        CallClass::RawSet
    } else if name == "strncmp" {
        CallClass::StringCompare
    } else if flush_helpers.iter().any(|helper| helper == name) {
        CallClass::CentralizedFlush
    } else {
        CallClass::Other
    }
}

pub fn lock_kind(name: &str) -> Option<LockKind> {
    if name.starts_with("mutex_lock") || name.contains("spin_lock") {
        Some(LockKind::Acquire)
    } else if name.starts_with("mutex_unlock") || name.contains("spin_unlock") {
        Some(LockKind::Release)
    } else {
        None
    }
}
