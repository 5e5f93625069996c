//! Address classification
//!
//! Decides which addresses are recorded: user-space addresses are never
//! dereferenced, and in `persistent_only` mode events outside the
//! persistent-memory window announced by `dax_direct_access` are skipped.

use super::record::StructClass;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// Size of one device page
pub const PAGE_SIZE: u64 = 4096;

/// Addresses below this belong to user space
pub const USER_SPACE_LIMIT: u64 = 0x8000_0000_0000_0000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Record DRAM and persistent memory alike
    #[default]
    All,
    /// Record only accesses inside the persistent-memory window
    PersistentOnly,
}

/// Persistent-memory window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmRange {
    pub start: u64,
    pub end: u64,
}

impl PmRange {
    /// Window of `pages` device pages at `base`; `None` if it is empty or
    /// starts at address zero
    pub fn from_pages(base: u64, pages: u64) -> Option<Self> {
        let len = pages.checked_mul(PAGE_SIZE)?;
        if base == 0 || len == 0 {
            return None;
        }
        Some(Self {
            start: base,
            end: base.saturating_add(len),
        })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Whether `[addr, addr + size)` lies inside the window
    pub fn contains(&self, addr: u64, size: u64) -> bool {
        addr >= self.start
            && addr
                .checked_add(size)
                .is_some_and(|end| end <= self.end)
    }
}

#[derive(Debug)]
pub struct AddressFilter {
    mode: FilterMode,
    user_space_limit: u64,
    range: RwLock<Option<PmRange>>,
}

impl AddressFilter {
    pub fn new(mode: FilterMode, user_space_limit: u64) -> Self {
        Self {
            mode,
            user_space_limit,
            range: RwLock::new(None),
        }
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn set_range(&self, range: Option<PmRange>) {
        if let Ok(mut current) = self.range.write() {
            *current = range;
        }
    }

    pub fn range(&self) -> Option<PmRange> {
        self.range.read().ok().and_then(|range| *range)
    }

    pub fn is_user_space(&self, addr: u64) -> bool {
        addr < self.user_space_limit
    }

    pub fn is_persistent(&self, addr: u64, size: u64) -> bool {
        self.range()
            .is_some_and(|range| range.contains(addr, size))
    }

    /// Whether an event touching `[addr, addr + size)` is recorded
    pub fn passes(&self, addr: u64, size: u64) -> bool {
        match self.mode {
            FilterMode::All => true,
            FilterMode::PersistentOnly => self.is_persistent(addr, size),
        }
    }

    /// Struct pointers are classified even when every address is recorded
    pub fn classify_struct(&self, ptr: u64, size: u64) -> StructClass {
        match self.range() {
            None => StructClass::Unknown,
            Some(range) if range.contains(ptr, size) => StructClass::Persistent,
            Some(_) => StructClass::Dram,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_from_pages() {
        let range = PmRange::from_pages(0x1000, 2).unwrap();
        assert_eq!(range.end, 0x3000);
        assert_eq!(range.len(), 8192);
        assert!(range.contains(0x1000, 8192));
        assert!(!range.contains(0x1000, 8193));
        assert!(!range.contains(0xfff, 1));
        assert!(!range.contains(u64::MAX, 2));
        assert!(PmRange::from_pages(0, 2).is_none());
        assert!(PmRange::from_pages(0x1000, 0).is_none());
    }

    #[test]
    fn test_user_space_check() {
        let filter = AddressFilter::new(FilterMode::All, USER_SPACE_LIMIT);
        assert!(filter.is_user_space(0x7fff_ffff_f000));
        assert!(!filter.is_user_space(0xffff_8880_0000_0000));
    }

    #[test]
    fn test_persistent_only_mode() {
        let filter = AddressFilter::new(FilterMode::PersistentOnly, USER_SPACE_LIMIT);
        assert!(!filter.passes(0x1000, 8));
        filter.set_range(PmRange::from_pages(0x1000, 1));
        assert!(filter.passes(0x1000, 8));
        assert!(!filter.passes(0x2000, 8));

        let all = AddressFilter::new(FilterMode::All, USER_SPACE_LIMIT);
        assert!(all.passes(0x2000, 8));
    }

    #[test]
    fn test_struct_classification() {
        let filter = AddressFilter::new(FilterMode::All, USER_SPACE_LIMIT);
        assert_eq!(filter.classify_struct(0x1000, 64), StructClass::Unknown);
        filter.set_range(PmRange::from_pages(0x1000, 1));
        assert_eq!(filter.classify_struct(0x1000, 64), StructClass::Persistent);
        assert_eq!(filter.classify_struct(0x9000, 64), StructClass::Dram);
        filter.set_range(None);
        assert_eq!(filter.classify_struct(0x1000, 64), StructClass::Unknown);
    }
}
