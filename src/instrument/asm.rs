//! Inline assembly idiom table
//!
//! Kernel file systems reach persistence primitives through a handful of
//! inline assembly snippets. Rules are tried in order; the first match wins.

use regex::Regex;

/// Clobber list of `asm volatile("" ::: "memory")`
pub const COMPILER_BARRIER_CLOBBERS: &str = "~{memory},~{dirflag},~{fpsr},~{flags}";

/// Argument count of the double-word compare-and-swap shape
pub const DOUBLE_CAS_ARGS: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsmIdiom {
    /// Cache-line write-back of the first operand
    Flush,
    Fence,
    /// Atomic exchange of the first operand with the second
    Exchange,
    /// Double-word compare-and-swap, 16 bytes
    CompareExchange,
    /// Non-temporal store of a register to the first operand
    NonTemporalStore,
    /// CRC32 over `bytes` at the first operand
    Crc32 { bytes: u64 },
    Unknown,
}

#[derive(Debug)]
pub struct AsmClassifier {
    rules: Vec<(Regex, AsmIdiom)>,
    crc32: Regex,
}

impl AsmClassifier {
    pub fn new() -> Result<Self, regex::Error> {
        let rules = [
            (r"(clflush|xsaveopt)\s+\$0", AsmIdiom::Flush),
            (r"[ms]fence", AsmIdiom::Fence),
            (r"xchg[ql]\s+\$0,\s*\$1", AsmIdiom::Exchange),
            (r"cmpxchg", AsmIdiom::CompareExchange),
            (r"movnti\s+%rax", AsmIdiom::NonTemporalStore),
        ]
        .into_iter()
        .map(|(pattern, idiom)| Ok((Regex::new(pattern)?, idiom)))
        .collect::<Result<Vec<_>, regex::Error>>()?;

        Ok(Self {
            rules,
            crc32: Regex::new(r"crc32([qb])")?,
        })
    }

    /// Classify one inline asm call with `arg_count` call arguments
    pub fn classify(&self, asm: &str, constraints: &str, arg_count: usize) -> AsmIdiom {
        if asm.is_empty() && constraints == COMPILER_BARRIER_CLOBBERS {
            return AsmIdiom::Fence;
        }

        for (pattern, idiom) in &self.rules {
            if pattern.is_match(asm) {
                return match idiom {
                    AsmIdiom::CompareExchange if arg_count != DOUBLE_CAS_ARGS => {
                        AsmIdiom::Unknown
                    }
                    other => *other,
                };
            }
        }

        match self.crc32.captures(asm).and_then(|c| c.get(1)) {
            Some(width) if width.as_str() == "q" => AsmIdiom::Crc32 { bytes: 8 },
            Some(_) => AsmIdiom::Crc32 { bytes: 1 },
            None => AsmIdiom::Unknown,
        }
    }
}

/// Text recorded for unrecognised asm
pub fn describe_unknown(asm: &str, constraints: &str) -> String {
    format!("{constraints} | {asm}").replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(asm: &str, constraints: &str, args: usize) -> AsmIdiom {
        AsmClassifier::new().unwrap().classify(asm, constraints, args)
    }

    #[test]
    fn test_flush_variants() {
        assert_eq!(classify("clflush $0", "+m,~{dirflag}", 1), AsmIdiom::Flush);
        assert_eq!(
            classify(".byte 0x66; xsaveopt $0", "+m,~{dirflag}", 1),
            AsmIdiom::Flush
        );
    }

    #[test]
    fn test_fences() {
        assert_eq!(classify("mfence", "~{memory}", 0), AsmIdiom::Fence);
        assert_eq!(classify("sfence", "~{memory}", 0), AsmIdiom::Fence);
        assert_eq!(classify("", COMPILER_BARRIER_CLOBBERS, 0), AsmIdiom::Fence);
        assert_eq!(classify("", "~{memory}", 0), AsmIdiom::Unknown);
    }

    #[test]
    fn test_exchange_and_cas() {
        assert_eq!(classify("xchgq $0,$1", "=r,=*m", 2), AsmIdiom::Exchange);
        assert_eq!(classify("xchgl $0,$1", "=r,=*m", 2), AsmIdiom::Exchange);
        assert_eq!(
            classify("lock; cmpxchg16b $1", "=*m", DOUBLE_CAS_ARGS),
            AsmIdiom::CompareExchange
        );
        assert_eq!(classify("lock; cmpxchg16b $1", "=*m", 4), AsmIdiom::Unknown);
    }

    #[test]
    fn test_nt_store_and_crc() {
        assert_eq!(
            classify("movnti %rax, $0", "=*m", 3),
            AsmIdiom::NonTemporalStore
        );
        assert_eq!(
            classify("crc32q $1, $0", "=r", 2),
            AsmIdiom::Crc32 { bytes: 8 }
        );
        assert_eq!(
            classify("crc32b $1, $0", "=r", 2),
            AsmIdiom::Crc32 { bytes: 1 }
        );
        assert_eq!(classify("rdtsc", "=A", 0), AsmIdiom::Unknown);
    }

    #[test]
    fn test_describe_unknown() {
        assert_eq!(
            describe_unknown("1:\n\tstac\n", "~{memory}"),
            "~{memory} | 1: \tstac "
        );
    }
}
