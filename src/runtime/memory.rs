//! Address spaces the runtime reads stored values from

use super::filter::PAGE_SIZE;
use fnv::FnvHashMap;
use std::sync::RwLock;

/// Source of the bytes captured for stored-value records
pub trait AddressSpace: Send + Sync {
    /// Fill `buf` with the bytes starting at `addr`; `false` if they cannot
    /// be read
    fn read_into(&self, addr: u64, buf: &mut [u8]) -> bool;

    /// Copy `len` bytes starting at `addr`; `None` if they cannot be read
    /// or the buffer cannot be allocated
    fn read(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len).ok()?;
        buf.resize(len, 0);
        self.read_into(addr, &mut buf).then_some(buf)
    }
}

/// The calling process's own memory
///
/// Used by the C ABI, where addresses come from instrumented code running
/// in the same address space. Only [`LiveMemory::new`] creates one, and it
/// is `unsafe`:
///
/// ```compile_fail
/// use pmtrace::runtime::LiveMemory;
///
/// let memory = LiveMemory::new();
/// ```
#[derive(Debug, Clone, Copy)]
pub struct LiveMemory {
    _private: (),
}

impl LiveMemory {
    /// # Safety
    ///
    /// Every non-null address later handed to a runtime built over this
    /// value must be readable for the size passed alongside it, for the
    /// duration of the call. Instrumented code satisfies this by passing
    /// the address it is about to access (or has just accessed) together
    /// with the access size.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl AddressSpace for LiveMemory {
    fn read_into(&self, addr: u64, buf: &mut [u8]) -> bool {
        if addr == 0 {
            return false;
        }
        if buf.is_empty() {
            return true;
        }
        let Ok(addr) = usize::try_from(addr) else {
            return false;
        };
        // SAFETY: readable for `buf.len()` bytes per the contract of
        // `LiveMemory::new`; `buf` is a distinct owned allocation.
        unsafe { std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len()) };
        true
    }
}

type Page = Box<[u8; PAGE_SIZE as usize]>;

/// Sparse simulated memory; bytes never written read as zero
#[derive(Debug, Default)]
pub struct SimMemory {
    pages: RwLock<FnvHashMap<u64, Page>>,
}

impl SimMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, addr: u64, bytes: &[u8]) {
        let Ok(mut pages) = self.pages.write() else {
            return;
        };
        for (i, byte) in bytes.iter().enumerate() {
            let at = addr.wrapping_add(i as u64);
            let page = pages
                .entry(at / PAGE_SIZE)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE as usize]));
            page[(at % PAGE_SIZE) as usize] = *byte;
        }
    }

    pub fn fill(&self, addr: u64, value: u8, len: usize) {
        self.write(addr, &vec![value; len]);
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        let mut buf = [0u8; 8];
        if !self.read_into(addr, &mut buf) {
            return 0;
        }
        u64::from_le_bytes(buf)
    }

    pub fn write_u64(&self, addr: u64, value: u64) {
        self.write(addr, &value.to_le_bytes());
    }

    /// Number of pages touched by writes
    pub fn resident_pages(&self) -> usize {
        self.pages.read().map(|pages| pages.len()).unwrap_or(0)
    }
}

impl AddressSpace for SimMemory {
    fn read_into(&self, addr: u64, buf: &mut [u8]) -> bool {
        let Ok(pages) = self.pages.read() else {
            return false;
        };
        for (i, byte) in buf.iter_mut().enumerate() {
            let at = addr.wrapping_add(i as u64);
            *byte = pages
                .get(&(at / PAGE_SIZE))
                .map_or(0, |page| page[(at % PAGE_SIZE) as usize]);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_memory_roundtrip_across_pages() {
        let mem = SimMemory::new();
        let addr = PAGE_SIZE * 3 - 2;
        mem.write(addr, &[1, 2, 3, 4]);
        assert_eq!(mem.read(addr, 4), Some(vec![1, 2, 3, 4]));
        assert_eq!(mem.resident_pages(), 2);
    }

    #[test]
    fn test_sim_memory_unwritten_reads_zero() {
        let mem = SimMemory::new();
        assert_eq!(mem.read(0x5000, 3), Some(vec![0, 0, 0]));
        assert_eq!(mem.read_u64(0x9000), 0);
        mem.write_u64(0x9000, 0xdead_beef);
        assert_eq!(mem.read_u64(0x9000), 0xdead_beef);
    }

    #[test]
    fn test_live_memory_reads_own_buffer() {
        let data = [9u8, 8, 7];
        let addr = data.as_ptr() as u64;
        let memory = unsafe { LiveMemory::new() };
        assert_eq!(memory.read(addr, 3), Some(vec![9, 8, 7]));
        assert_eq!(memory.read(0, 3), None);
    }

    #[test]
    fn test_unallocatable_read_is_none() {
        let mem = SimMemory::new();
        assert_eq!(mem.read(0x1000, usize::MAX), None);
        assert_eq!(mem.resident_pages(), 0);
    }
}
