use super::record::{AccessKind, StructClass, UserCopyKind};
use super::*;
use std::fs;
use tempfile::TempDir;

const KERNEL: u64 = 0xffff_8880_0000_0000;

fn setup(configure: impl FnOnce(&mut RuntimeConfig)) -> (TempDir, TraceRuntime<SimMemory>) {
    let dir = TempDir::new().unwrap();
    let mut config = RuntimeConfig::in_dir(dir.path());
    configure(&mut config);
    let runtime = TraceRuntime::new(config, SimMemory::new());
    (dir, runtime)
}

fn enabled() -> (TempDir, TraceRuntime<SimMemory>) {
    let (dir, runtime) = setup(|_| {});
    runtime.init_all();
    (dir, runtime)
}

fn labels(events: &[EventRecord]) -> Vec<&'static str> {
    events.iter().map(|e| e.event.label()).collect()
}

#[test]
fn test_uninitialized_runtime_ignores_calls() {
    let (_dir, runtime) = setup(|_| {});
    assert_eq!(runtime.phase(), Phase::Uninitialized);
    assert_eq!(runtime.acquire_sequence(1), INVALID_SEQUENCE);
    runtime.load(1, KERNEL, 8, SourceLocation::default());
    assert!(runtime.take_pending_events().is_empty());
}

#[test]
fn test_init_is_idempotent() {
    let (_dir, runtime) = enabled();
    assert_eq!(runtime.phase(), Phase::Enabled);
    assert_eq!(runtime.acquire_sequence(5), FIRST_SEQUENCE);
    runtime.init_all();
    assert_eq!(runtime.acquire_sequence(1), 6);
}

#[test]
fn test_store_pre_and_post_image() {
    let (_dir, runtime) = enabled();
    runtime.memory().write_u64(KERNEL, 0x1111);

    let seq = runtime.acquire_sequence(1);
    runtime.old_store_value(seq, KERNEL, 8, 0);
    runtime.memory().write_u64(KERNEL, 0x2222);
    runtime.store(seq, 4, KERNEL, 8, SourceLocation::default());

    let values = runtime.take_pending_values();
    assert_eq!(values.len(), 2);
    assert_eq!(values[0].seq, seq + OLD_VALUE_OFFSET);
    assert_eq!(values[0].bytes, 0x1111u64.to_le_bytes());
    assert_eq!(values[1].seq, seq);
    assert_eq!(values[1].bytes, 0x2222u64.to_le_bytes());

    let events = runtime.take_pending_events();
    assert_eq!(labels(&events), vec!["store"]);
    assert_eq!(events[0].seq, seq);
}

#[test]
fn test_invalid_sequence_drops_silently() {
    let (_dir, runtime) = enabled();
    runtime.store(INVALID_SEQUENCE, 1, KERNEL, 8, SourceLocation::default());
    runtime.old_store_value(INVALID_SEQUENCE, KERNEL, 8, 0);
    assert!(runtime.take_pending_events().is_empty());
    assert!(runtime.take_pending_values().is_empty());
}

#[test]
fn test_memtransfer_uses_two_sequences() {
    let (_dir, runtime) = enabled();
    let seq = runtime.acquire_sequence(2);
    runtime.old_store_value(seq, KERNEL, 16, 1);
    runtime.memtransfer(seq, 9, KERNEL, KERNEL + 0x100, 16);

    let events = runtime.take_pending_events();
    assert_eq!(labels(&events), vec!["memtransLoad", "memtransStore"]);
    assert_eq!(events[0].seq, seq);
    assert_eq!(events[1].seq, seq + 1);
    assert!(matches!(
        events[0].event,
        TraceEvent::Access { kind: AccessKind::TransferLoad, ptr, .. } if ptr == KERNEL + 0x100
    ));

    let values = runtime.take_pending_values();
    assert_eq!(values[0].seq, seq + 1 + OLD_VALUE_OFFSET);
    assert_eq!(values[1].seq, seq + 1);
}

#[test]
fn test_uaccess_to_user_space_not_traced() {
    let (_dir, runtime) = enabled();
    let seq = runtime.acquire_sequence(2);
    runtime.uaccess(seq, 1, 0x7fff_0000, KERNEL, 8);
    assert!(runtime.take_pending_events().is_empty());

    let seq = runtime.acquire_sequence(2);
    runtime.uaccess_nt(seq, 2, KERNEL, 0x7fff_0000, 8);
    let events = runtime.take_pending_events();
    assert_eq!(labels(&events), vec!["uaccessNTLoad", "uaccessNTStore"]);
    assert!(matches!(
        events[1].event,
        TraceEvent::UserCopy { kind: UserCopyKind::NonTemporalStore, .. }
    ));
    assert_eq!(runtime.take_pending_values().len(), 1);
}

#[test]
fn test_user_space_values_skipped() {
    let (_dir, runtime) = enabled();
    let seq = runtime.acquire_sequence(1);
    runtime.store(seq, 1, 0x1000, 8, SourceLocation::default());
    assert_eq!(runtime.take_pending_events().len(), 1);
    assert!(runtime.take_pending_values().is_empty());
}

#[test]
fn test_oversized_value_dropped() {
    let (_dir, runtime) = setup(|c| c.max_value_len = 16);
    runtime.init_all();
    let seq = runtime.acquire_sequence(1);
    assert!(!runtime.record_value(seq, KERNEL, 17));
    assert!(runtime.record_value(seq, KERNEL, 16));
    assert_eq!(runtime.stats().oversized_values, 1);
}

#[test]
fn test_unallocatable_value_dropped_and_counted() {
    let (_dir, runtime) = setup(|c| {
        c.max_value_len = u64::MAX;
        c.user_space_limit = 0;
    });
    runtime.init_all();
    let seq = runtime.acquire_sequence(1);
    assert!(!runtime.record_value(seq, 0x1000, 1 << 63));

    let stats = runtime.stats();
    assert_eq!(stats.alloc_failures, 1);
    assert_eq!(stats.unreadable_values, 0);
    assert!(runtime.take_pending_values().is_empty());

    // later values still go through
    assert!(runtime.record_value(seq, 0x1000, 8));
}

#[test]
fn test_open_failure_degrades_to_errored() {
    let (_dir, runtime) = setup(|c| c.event_path = "/nonexistent/dir/trace".into());
    runtime.init_all();
    assert_eq!(runtime.phase(), Phase::Errored);

    let seq = runtime.acquire_sequence(1);
    assert_eq!(seq, FIRST_SEQUENCE);
    assert!(!runtime.record_event(seq, TraceEvent::Select { id: 1, flag: 0 }));
    assert!(runtime.stats().errored_drops >= 1);

    runtime.destroy_all(1);
    assert_eq!(runtime.phase(), Phase::Disabled);
}

#[test]
fn test_errored_hook_counts_one_drop() {
    let (_dir, runtime) = setup(|c| c.event_path = "/nonexistent/dir/trace".into());
    runtime.init_all();
    assert_eq!(runtime.phase(), Phase::Errored);

    let seq = runtime.acquire_sequence(1);
    runtime.store(seq, 1, KERNEL, 8, SourceLocation::default());
    assert_eq!(runtime.stats().errored_drops, 1);

    let seq = runtime.acquire_sequence(2);
    runtime.memtransfer(seq, 2, KERNEL, KERNEL + 0x100, 16);
    assert_eq!(runtime.stats().errored_drops, 2);
    assert!(runtime.take_pending_events().is_empty());
    assert!(runtime.take_pending_values().is_empty());
}

#[test]
fn test_destroy_with_zero_code_keeps_tracing() {
    let (_dir, runtime) = enabled();
    runtime.destroy_all(0);
    assert_eq!(runtime.phase(), Phase::Enabled);
}

#[test]
fn test_destroy_flushes_and_disables() {
    let (dir, runtime) = enabled();
    runtime.asm_fence(3);
    runtime.select(4, 1);
    runtime.destroy_all(1);
    assert_eq!(runtime.phase(), Phase::Disabled);
    assert_eq!(runtime.acquire_sequence(1), INVALID_SEQUENCE);

    let text = fs::read_to_string(dir.path().join("pmtrace.func.trace")).unwrap();
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("asmFence"));
    assert!(lines[1].ends_with("select         , id:        4, flag: 1."));

    let stats = runtime.stats();
    assert_eq!(stats.flushed_events, 2);

    // second teardown is a no-op
    runtime.destroy_all(1);
    assert_eq!(runtime.stats().flushed_events, 2);
}

#[test]
fn test_reinit_after_destroy_truncates() {
    let (dir, runtime) = enabled();
    runtime.asm_fence(1);
    runtime.destroy_all(1);
    runtime.init_all();
    assert_eq!(runtime.phase(), Phase::Enabled);
    assert_eq!(runtime.acquire_sequence(1), FIRST_SEQUENCE);
    runtime.destroy_all(1);
    let text = fs::read_to_string(dir.path().join("pmtrace.func.trace")).unwrap();
    assert!(text.is_empty());
}

#[test]
fn test_reinit_discards_stale_records() {
    let (dir, runtime) = enabled();
    runtime.destroy_all(1);

    // left behind by a hook that raced the teardown drain
    let stale = EventRecord::new(3, 1, TraceEvent::Select { id: 7, flag: 1 });
    assert!(runtime.events.push(stale));
    assert!(runtime.values.push(StoredValue {
        seq: 3,
        bytes: vec![1, 2],
    }));

    runtime.init_all();
    assert_eq!(runtime.stats().stale_discarded, 2);
    runtime.select(8, 0);
    runtime.destroy_all(1);

    let events = crate::trace_reader::read_event_file(dir.path().join("pmtrace.func.trace")).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].seq, FIRST_SEQUENCE);
    assert_eq!(events[0].id, Some(8));
    let values = crate::trace_reader::read_value_file(dir.path().join("pmtrace.storevalue.trace")).unwrap();
    assert!(values.is_empty());
}

#[test]
fn test_multibyte_asm_text_reads_back() {
    let (dir, runtime) = enabled();
    runtime.asm_unknown(1, "nova_write", None, 1, &"é".repeat(300));
    runtime.destroy_all(1);

    let events = crate::trace_reader::read_event_file(dir.path().join("pmtrace.func.trace")).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].label, "ukasm");
}

#[test]
fn test_flush_all_reports_counts() {
    let (dir, runtime) = enabled();
    let seq = runtime.acquire_sequence(1);
    runtime.memset(seq, 2, KERNEL, 4);
    let report = runtime.flush_all();
    assert_eq!(report.events_written, 1);
    assert_eq!(report.values_written, 1);
    assert_eq!(report.failed, 0);
    let values = fs::read(dir.path().join("pmtrace.storevalue.trace")).unwrap();
    assert_eq!(values.len(), 16 + 4);
}

#[test]
fn test_dax_access_sets_window() {
    let (_dir, runtime) = setup(|c| c.address_filter = FilterMode::PersistentOnly);
    runtime.init_all();

    runtime.load(1, KERNEL, 8, SourceLocation::default());
    assert!(runtime.take_pending_events().is_empty());

    runtime.dax_access(0, KERNEL, 512);
    runtime.load(1, KERNEL, 8, SourceLocation::default());
    runtime.load(2, KERNEL + 512 * 4096, 8, SourceLocation::default());
    let events = runtime.take_pending_events();
    assert_eq!(labels(&events), vec!["DaxDevInfo", "load"]);
    assert_eq!(
        events[0].event,
        TraceEvent::DaxDevInfo {
            start: KERNEL,
            end: KERNEL + 512 * 4096,
            size_mib: 2,
        }
    );
}

#[test]
fn test_struct_pointer_classification() {
    let (_dir, runtime) = enabled();
    let loc = SourceLocation::default;
    runtime.struct_ptr(1, KERNEL, 0, 64, "nova_inode", loc());
    runtime.dax_access(0, KERNEL, 1);
    runtime.struct_ptr(2, KERNEL, 0, 64, "nova_inode", loc());
    runtime.struct_ptr(3, KERNEL + 0x10000, 0, 64, "nova_inode", loc());

    let classes: Vec<_> = runtime
        .take_pending_events()
        .into_iter()
        .filter_map(|e| match e.event {
            TraceEvent::StructPtr { class, .. } => Some(class),
            _ => None,
        })
        .collect();
    assert_eq!(
        classes,
        vec![
            StructClass::Unknown,
            StructClass::Persistent,
            StructClass::Dram
        ]
    );
}

#[test]
fn test_source_locations_only_when_enabled() {
    let loc = SourceLocation {
        file: Some("file.c".into()),
        line: 3,
        col: 1,
        code: None,
    };

    let (_dir, runtime) = enabled();
    runtime.load(1, KERNEL, 8, loc.clone());
    assert!(runtime.take_pending_events()[0].location.is_none());

    let (_dir, runtime) = setup(|c| c.emit_source_locations = true);
    runtime.init_all();
    runtime.load(1, KERNEL, 8, loc.clone());
    assert_eq!(runtime.take_pending_events()[0].location, Some(loc));
}

#[test]
fn test_unknown_asm_text_truncated() {
    let (_dir, runtime) = enabled();
    runtime.asm_unknown(1, "f", None, 0, &"nop;".repeat(200));
    match &runtime.take_pending_events()[0].event {
        TraceEvent::UnknownAsm { asm, .. } => assert_eq!(asm.len(), MAX_ASM_TEXT),
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn test_bounded_buffer_accounting() {
    let (_dir, runtime) = setup(|c| c.buffer = BufferPolicy::Bounded { capacity: 10 });
    runtime.init_all();
    for id in 0..100 {
        runtime.implicit_fence(id);
    }
    let report = runtime.flush_all();
    let stats = runtime.stats();
    assert_eq!(report.events_written, 10);
    assert_eq!(stats.dropped_events(), 90);
    assert_eq!(report.events_written + stats.dropped_events(), 100);
}

#[test]
fn test_concurrent_sequences_distinct() {
    let (_dir, runtime) = enabled();
    let mut all: Vec<u64> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    (0..500)
                        .map(|_| runtime.acquire_sequence(2))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });
    all.sort_unstable();
    assert_eq!(all.len(), 4000);
    assert!(all.windows(2).all(|w| w[1] - w[0] == 2));
    assert_eq!(runtime.stats().next_sequence, 8001);
}
