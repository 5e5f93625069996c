//! Per-category instrumentation counters

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Counter {
    Load,
    Store,
    Fence,
    Xchg,
    Rmw,
    MemSet,
    MemTransfer,
    Select,
    StructGep,
    AsmFlush,
    AsmFence,
    AsmXchg,
    AsmCas,
    AsmMemsetNt,
    AsmCrc32,
    AsmUserCopy,
    AsmUnknown,
    UserCopy,
    RawTransfer,
    RawSet,
    StringCompare,
    CentralizedFlush,
    DaxAccess,
    LockFence,
    CallBracket,
    Function,
    AnnotatedFunction,
    StructValue,
    ModuleInit,
    ModuleExit,
}

impl Counter {
    pub fn label(self) -> &'static str {
        match self {
            Counter::Load => "load",
            Counter::Store => "store",
            Counter::Fence => "fence",
            Counter::Xchg => "cmpxchg",
            Counter::Rmw => "atomicrmw",
            Counter::MemSet => "memset",
            Counter::MemTransfer => "memtransfer",
            Counter::Select => "select",
            Counter::StructGep => "struct-gep",
            Counter::AsmFlush => "asm-flush",
            Counter::AsmFence => "asm-fence",
            Counter::AsmXchg => "asm-xchg",
            Counter::AsmCas => "asm-cas",
            Counter::AsmMemsetNt => "asm-movnti",
            Counter::AsmCrc32 => "asm-crc32",
            Counter::AsmUserCopy => "asm-uaccess",
            Counter::AsmUnknown => "asm-unknown",
            Counter::UserCopy => "uaccess-call",
            Counter::RawTransfer => "memcpy-call",
            Counter::RawSet => "memset-call",
            Counter::StringCompare => "strncmp-call",
            Counter::CentralizedFlush => "central-flush",
            Counter::DaxAccess => "dax-access",
            Counter::LockFence => "lock-fence",
            Counter::CallBracket => "call",
            Counter::Function => "function",
            Counter::AnnotatedFunction => "annotated-func",
            Counter::StructValue => "struct-value",
            Counter::ModuleInit => "module-init",
            Counter::ModuleExit => "module-exit",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentStats {
    counts: BTreeMap<Counter, u64>,
}

impl InstrumentStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&mut self, counter: Counter) {
        *self.counts.entry(counter).or_insert(0) += 1;
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counts.get(&counter).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn merge(&mut self, other: &InstrumentStats) {
        for (counter, count) in &other.counts {
            *self.counts.entry(*counter).or_insert(0) += count;
        }
    }

    /// Print a summary table to stderr
    pub fn print_summary(&self) {
        if self.counts.is_empty() {
            eprintln!("No instructions instrumented.");
            return;
        }

        let mut sorted: Vec<_> = self.counts.iter().collect();
        sorted.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));

        eprintln!("    count category");
        eprintln!("--------- ----------------");
        for (counter, count) in sorted {
            eprintln!("{:>9} {}", count, counter.label());
        }
        eprintln!("--------- ----------------");
        eprintln!("{:>9} total", self.total());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_and_merge() {
        let mut a = InstrumentStats::new();
        a.bump(Counter::Load);
        a.bump(Counter::Load);
        a.bump(Counter::Store);

        let mut b = InstrumentStats::new();
        b.bump(Counter::Store);
        b.merge(&a);

        assert_eq!(b.get(Counter::Load), 2);
        assert_eq!(b.get(Counter::Store), 2);
        assert_eq!(b.get(Counter::Fence), 0);
        assert_eq!(b.total(), 4);
    }

    #[test]
    fn test_print_summary_empty() {
        InstrumentStats::new().print_summary();
    }
}
