//! Trace event records and their text rendering
//!
//! One event renders to one line:
//!
//! ```text
//!        7,     4242, store          , id:       12, ptr: 0xffff888000001000, size:        8.
//! ```
//!
//! Every field before `id:` has a fixed width so the stream can be sorted
//! and diffed with ordinary text tools.

use std::fmt::Write as _;

/// Default cap on one rendered line, newline included
pub const MAX_RECORD_LEN: usize = 512;

/// Text printed for a missing string argument
const NULL_TEXT: &str = "(null)";

/// Byte-sized memory events sharing the `ptr, size` layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Load,
    Store,
    Xchg,
    Rmw,
    Memset,
    /// Source side of a memory transfer
    TransferLoad,
    /// Destination side of a memory transfer
    TransferStore,
    AsmXchg,
    AsmCas,
    AsmMemsetNt,
    CentralizedFlush,
}

impl AccessKind {
    pub fn label(self) -> &'static str {
        match self {
            AccessKind::Load => "load",
            AccessKind::Store => "store",
            AccessKind::Xchg => "xchg",
            AccessKind::Rmw => "rmw",
            AccessKind::Memset => "memset",
            AccessKind::TransferLoad => "memtransLoad",
            AccessKind::TransferStore => "memtransStore",
            AccessKind::AsmXchg => "asmxchg",
            AccessKind::AsmCas => "cas",
            AccessKind::AsmMemsetNt => "asmmemsetnt",
            AccessKind::CentralizedFlush => "centflush",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceKind {
    /// Explicit fence instruction or fence asm
    Asm,
    /// Implied by an atomic or a lock operation
    Implicit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCopyKind {
    Load,
    Store,
    NonTemporalLoad,
    NonTemporalStore,
}

impl UserCopyKind {
    pub fn label(self) -> &'static str {
        match self {
            UserCopyKind::Load => "uaccessLoad",
            UserCopyKind::Store => "uaccessStore",
            UserCopyKind::NonTemporalLoad => "uaccessNTLoad",
            UserCopyKind::NonTemporalStore => "uaccessNTStore",
        }
    }
}

/// Where a struct pointer points, relative to the persistent-memory window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructClass {
    Persistent,
    Dram,
    /// The window is not known yet
    Unknown,
}

impl StructClass {
    pub fn label(self) -> &'static str {
        match self {
            StructClass::Persistent => "PMStructPtr",
            StructClass::Dram => "DRAMStructPtr",
            StructClass::Unknown => "UKStructPtr",
        }
    }
}

/// Category-specific payload of one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Access {
        kind: AccessKind,
        id: u32,
        ptr: u64,
        size: u64,
    },
    AsmFlush {
        id: u32,
        ptr: u64,
    },
    Fence {
        kind: FenceKind,
        id: u32,
    },
    UnknownAsm {
        id: u32,
        caller: String,
        file: Option<String>,
        line: u32,
        asm: String,
    },
    Function {
        boundary: Boundary,
        id: u32,
        ptr: u64,
        name: String,
    },
    Select {
        id: u32,
        flag: u64,
    },
    Call {
        boundary: Boundary,
        id: u32,
        caller: String,
        callee: String,
        file: Option<String>,
        line: u32,
    },
    UserCopy {
        kind: UserCopyKind,
        id: u32,
        from: u64,
        to: u64,
        size: u64,
    },
    DaxDevInfo {
        start: u64,
        end: u64,
        size_mib: u64,
    },
    StructPtr {
        class: StructClass,
        id: u32,
        type_name: String,
        ptr: u64,
        idx: u32,
        size: u64,
    },
    DbgStore {
        id: u32,
        type_name: String,
        ptr: u64,
        size: u64,
    },
}

impl TraceEvent {
    /// Category label, the third column of the event line
    pub fn label(&self) -> &'static str {
        match self {
            TraceEvent::Access { kind, .. } => kind.label(),
            TraceEvent::AsmFlush { .. } => "asmFlush",
            TraceEvent::Fence {
                kind: FenceKind::Asm,
                ..
            } => "asmFence",
            TraceEvent::Fence {
                kind: FenceKind::Implicit,
                ..
            } => "impFence",
            TraceEvent::UnknownAsm { .. } => "ukasm",
            TraceEvent::Function {
                boundary: Boundary::Start,
                ..
            } => "startFunc",
            TraceEvent::Function {
                boundary: Boundary::End,
                ..
            } => "endFunc",
            TraceEvent::Select { .. } => "select",
            TraceEvent::Call {
                boundary: Boundary::Start,
                ..
            } => "startCall",
            TraceEvent::Call {
                boundary: Boundary::End,
                ..
            } => "endCall",
            TraceEvent::UserCopy { kind, .. } => kind.label(),
            TraceEvent::DaxDevInfo { .. } => "DaxDevInfo",
            TraceEvent::StructPtr { class, .. } => class.label(),
            TraceEvent::DbgStore { .. } => "dbgStore",
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            TraceEvent::Access { id, .. }
            | TraceEvent::AsmFlush { id, .. }
            | TraceEvent::Fence { id, .. }
            | TraceEvent::UnknownAsm { id, .. }
            | TraceEvent::Function { id, .. }
            | TraceEvent::Select { id, .. }
            | TraceEvent::Call { id, .. }
            | TraceEvent::UserCopy { id, .. }
            | TraceEvent::StructPtr { id, .. }
            | TraceEvent::DbgStore { id, .. } => *id,
            TraceEvent::DaxDevInfo { .. } => 0,
        }
    }

    /// Everything after the label, including the trailing `.`
    fn write_fields(&self, out: &mut String) {
        let id = self.id();
        // Writing into a String cannot fail
        let _ = match self {
            TraceEvent::Access { ptr, size, .. } => {
                write!(out, "id: {id:>8}, ptr: {ptr:#x}, size: {size:>8}.")
            }
            TraceEvent::AsmFlush { ptr, .. } => write!(out, "id: {id:>8}, ptr: {ptr:#x}."),
            TraceEvent::Fence { .. } => write!(out, "id: {id:>8}."),
            TraceEvent::UnknownAsm {
                caller,
                file,
                line,
                asm,
                ..
            } => write!(
                out,
                "id: {id:>8}, caller: {caller}, fname: {}, line: {line}, asm: {asm}.",
                file.as_deref().unwrap_or(NULL_TEXT)
            ),
            TraceEvent::Function { ptr, name, .. } => {
                write!(out, "id: {id:>8}, ptr: {ptr:#x}, fn: {name}.")
            }
            TraceEvent::Select { flag, .. } => write!(out, "id: {id:>8}, flag: {flag}."),
            TraceEvent::Call {
                caller,
                callee,
                file,
                line,
                ..
            } => write!(
                out,
                "id: {id:>8}, caller: {caller}, callee: {callee}, fname: {}, line: {line}.",
                file.as_deref().unwrap_or(NULL_TEXT)
            ),
            TraceEvent::UserCopy { from, to, size, .. } => write!(
                out,
                "id: {id:>8}, from: {from:#x}, to: {to:#x}, size: {size:>8}."
            ),
            TraceEvent::DaxDevInfo {
                start,
                end,
                size_mib,
            } => write!(out, "id: {id:>8}, {start:#x}, {end:#x}, {size_mib}."),
            TraceEvent::StructPtr {
                type_name,
                ptr,
                idx,
                size,
                ..
            } => write!(
                out,
                "id: {id:>8}, type: {type_name:<15}, ptr: {ptr:#x}, idx: {idx:>4}, size: {size:>8}."
            ),
            TraceEvent::DbgStore {
                type_name,
                ptr,
                size,
                ..
            } => write!(
                out,
                "id: {id:>8}, type: {type_name:<15}, ptr: {ptr:#x}, size: {size:>8}."
            ),
        };
    }
}

/// Source position attached to load, store, fence and struct events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: Option<String>,
    pub line: u32,
    pub col: u32,
    pub code: Option<String>,
}

/// One entry of the event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub seq: u64,
    /// Id of the thread that produced the event
    pub pid: i32,
    pub event: TraceEvent,
    /// Rendered as a second line with the same sequence number
    pub location: Option<SourceLocation>,
}

impl EventRecord {
    pub fn new(seq: u64, pid: i32, event: TraceEvent) -> Self {
        Self {
            seq,
            pid,
            event,
            location: None,
        }
    }

    pub fn with_location(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    fn prefix(&self) -> String {
        format!("{:>8}, {:>8}, ", self.seq, self.pid)
    }

    /// Render to bytes; each line is cut to `max_len` bytes
    pub fn render(&self, max_len: usize) -> Vec<u8> {
        let mut line = self.prefix();
        let _ = write!(line, "{:<15}, ", self.event.label());
        self.event.write_fields(&mut line);
        line.push('\n');

        let mut out = cap_line(line, max_len);
        if let Some(loc) = &self.location {
            let mut second = self.prefix();
            let _ = writeln!(
                second,
                "\t\tfile: {}, line {}, col: {}, code: {}.",
                loc.file.as_deref().unwrap_or("NULL"),
                loc.line,
                loc.col,
                loc.code.as_deref().unwrap_or("NULL")
            );
            out.extend(cap_line(second, max_len));
        }
        out
    }
}

/// Truncate to at most `max_len` bytes on a character boundary, keeping a
/// trailing newline
fn cap_line(mut line: String, max_len: usize) -> Vec<u8> {
    if max_len > 0 && line.len() > max_len {
        let mut cut = max_len - 1;
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        line.truncate(cut);
        line.push('\n');
    }
    line.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(event: TraceEvent) -> String {
        String::from_utf8(EventRecord::new(7, 42, event).render(MAX_RECORD_LEN)).unwrap()
    }

    #[test]
    fn test_access_line() {
        let line = render(TraceEvent::Access {
            kind: AccessKind::Store,
            id: 12,
            ptr: 0xffff_8880_0000_1000,
            size: 8,
        });
        assert_eq!(
            line,
            "       7,       42, store          , id:       12, ptr: 0xffff888000001000, size:        8.\n"
        );
    }

    #[test]
    fn test_fence_labels() {
        assert!(render(TraceEvent::Fence {
            kind: FenceKind::Asm,
            id: 1
        })
        .contains("asmFence       , id:        1.\n"));
        assert!(render(TraceEvent::Fence {
            kind: FenceKind::Implicit,
            id: 1
        })
        .contains("impFence"));
    }

    #[test]
    fn test_call_with_missing_file() {
        let line = render(TraceEvent::Call {
            boundary: Boundary::Start,
            id: 3,
            caller: "nova_write".into(),
            callee: "memcpy".into(),
            file: None,
            line: 0,
        });
        assert!(line.ends_with(
            "startCall      , id:        3, caller: nova_write, callee: memcpy, fname: (null), line: 0.\n"
        ));
    }

    #[test]
    fn test_struct_and_dax_lines() {
        let line = render(TraceEvent::StructPtr {
            class: StructClass::Persistent,
            id: 5,
            type_name: "nova_inode".into(),
            ptr: 0x1000,
            idx: 2,
            size: 128,
        });
        assert!(line.contains(
            "PMStructPtr    , id:        5, type: nova_inode     , ptr: 0x1000, idx:    2, size:      128."
        ));

        let line = render(TraceEvent::DaxDevInfo {
            start: 0x1000,
            end: 0x3000,
            size_mib: 0,
        });
        assert!(line.contains("DaxDevInfo     , id:        0, 0x1000, 0x3000, 0.\n"));
    }

    #[test]
    fn test_long_line_capped_with_newline() {
        let record = EventRecord::new(
            1,
            1,
            TraceEvent::UnknownAsm {
                id: 1,
                caller: "f".into(),
                file: None,
                line: 1,
                asm: "x".repeat(2000),
            },
        );
        let bytes = record.render(MAX_RECORD_LEN);
        assert_eq!(bytes.len(), MAX_RECORD_LEN);
        assert_eq!(bytes.last(), Some(&b'\n'));
    }

    #[test]
    fn test_multibyte_line_capped_on_char_boundary() {
        let record = EventRecord::new(
            1,
            1,
            TraceEvent::UnknownAsm {
                id: 1,
                caller: "nova_write".into(),
                file: None,
                line: 1,
                asm: "é".repeat(300),
            },
        );
        for max_len in [MAX_RECORD_LEN, MAX_RECORD_LEN - 1, 64, 2] {
            let bytes = record.render(max_len);
            assert!(bytes.len() <= max_len);
            assert_eq!(bytes.last(), Some(&b'\n'));
            let text = String::from_utf8(bytes).unwrap();
            assert_eq!(text.lines().count(), 1);
        }
    }

    #[test]
    fn test_location_second_line() {
        let record = EventRecord::new(
            9,
            1,
            TraceEvent::Access {
                kind: AccessKind::Load,
                id: 1,
                ptr: 0x10,
                size: 4,
            },
        )
        .with_location(SourceLocation {
            file: Some("inode.c".into()),
            line: 10,
            col: 3,
            code: None,
        });
        let text = String::from_utf8(record.render(MAX_RECORD_LEN)).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[1],
            "       9,        1, \t\tfile: inode.c, line 10, col: 3, code: NULL."
        );
    }
}
