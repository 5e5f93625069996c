//! C ABI lifecycle tests
//!
//! The C entry points share one process-wide runtime configured from
//! `PMTRACE_CONFIG` on first use, so every test here runs serially and the
//! config file lives for the whole test binary.

use pmtrace::runtime::ffi::{self, CONFIG_ENV};
use pmtrace::runtime::Phase;
use pmtrace::trace_reader;
use serial_test::serial;
use std::ffi::{c_void, CString};
use std::fs;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::OnceLock;
use tempfile::TempDir;

static OUTPUT: OnceLock<TempDir> = OnceLock::new();

/// Point the global runtime at a temp directory; values are captured from
/// every address so stack variables can stand in for kernel memory
fn output_dir() -> &'static Path {
    OUTPUT
        .get_or_init(|| {
            let dir = TempDir::new().unwrap();
            let config = dir.path().join("runtime.toml");
            let events = dir.path().join("ffi.func.trace");
            let values = dir.path().join("ffi.storevalue.trace");
            fs::write(
                &config,
                format!(
                    "event_path = {:?}\nvalue_path = {:?}\nuser_space_limit = 0\nemit_source_locations = true\n",
                    events.display().to_string(),
                    values.display().to_string()
                ),
            )
            .unwrap();
            std::env::set_var(CONFIG_ENV, &config);
            dir
        })
        .path()
}

fn event_path() -> PathBuf {
    output_dir().join("ffi.func.trace")
}

fn value_path() -> PathBuf {
    output_dir().join("ffi.storevalue.trace")
}

#[test]
#[serial]
fn test_store_through_c_abi() {
    output_dir();
    ffi::trace_init_all();
    assert_eq!(ffi::phase(), Phase::Enabled);

    let file = CString::new("inode.c").unwrap();
    let code = CString::new("pi->i_size = size;").unwrap();
    let mut slot: u64 = 5;
    let addr = ptr::addr_of!(slot).cast::<c_void>();

    let seq = ffi::trace_acquire_sequence(1);
    unsafe { ffi::trace_old_store_value(seq, addr, 8, 0) };
    slot = std::hint::black_box(9);
    unsafe {
        ffi::trace_store_inst(seq, 12, addr, 8, 11, 14, file.as_ptr(), code.as_ptr());
    }
    assert_eq!(slot, 9);
    ffi::trace_destroy_all(1);
    assert_eq!(ffi::phase(), Phase::Disabled);

    let events = trace_reader::read_event_file(event_path()).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].label, "store");
    assert_eq!(events[0].id, Some(12));
    assert_eq!(
        events[0].location.as_deref(),
        Some("file: inode.c, line 11, col: 14, code: pi->i_size = size;.")
    );

    let values = trace_reader::read_value_file(value_path()).unwrap();
    assert_eq!(values.len(), 2);
    assert!(trace_reader::is_old_value(values[0].seq));
    assert_eq!(values[0].bytes, 5u64.to_le_bytes());
    assert_eq!(values[1].seq, seq);
    assert_eq!(values[1].bytes, 9u64.to_le_bytes());
}

#[test]
#[serial]
fn test_null_strings_recorded_as_missing() {
    output_dir();
    ffi::trace_init_all();
    unsafe {
        ffi::trace_start_func(3, ptr::null(), ptr::null());
        ffi::trace_fence_inst(4, 0, 0, ptr::null(), ptr::null());
        ffi::trace_start_calls(5, ptr::null(), ptr::null(), ptr::null(), 0);
        ffi::trace_dax_access(6, ptr::null(), 16);
    }
    ffi::trace_destroy_all(1);

    let events = trace_reader::read_event_file(event_path()).unwrap();
    let labels: Vec<&str> = events.iter().map(|e| e.label.as_str()).collect();
    assert_eq!(labels, ["startFunc", "asmFence", "startCall"]);
    assert!(events[2].fields.contains("fname: (null)"));
}

#[test]
#[serial]
fn test_value_hooks_capture_live_memory() {
    output_dir();
    ffi::trace_init_all();
    let before = ffi::stats().flushed_values;
    let buf = [7u8; 16];
    let mut dest = [0u8; 16];
    let seq = ffi::trace_acquire_sequence(2);
    unsafe {
        ffi::trace_old_store_value(seq, dest.as_ptr().cast(), 16, 1);
        dest.copy_from_slice(&buf);
        ffi::trace_memtransfer_inst(seq, 30, dest.as_ptr().cast(), buf.as_ptr().cast(), 16);
    }
    ffi::trace_destroy_all(1);
    assert_eq!(ffi::stats().flushed_values - before, 2);

    let values = trace_reader::read_value_file(value_path()).unwrap();
    assert_eq!(values.len(), 2);
    assert_eq!(values[0].bytes, [0u8; 16]);
    assert_eq!(values[1].seq, seq + 1);
    assert_eq!(values[1].bytes, [7u8; 16]);
}

#[test]
#[serial]
fn test_init_exit_code_zero_keeps_tracing() {
    output_dir();
    ffi::trace_init_all();
    ffi::trace_destroy_all(0);
    assert_eq!(ffi::phase(), Phase::Enabled);
    assert_ne!(ffi::trace_acquire_sequence(1), pmtrace::runtime::INVALID_SEQUENCE);

    ffi::trace_destroy_all(1);
    ffi::trace_destroy_all(1);
    assert_eq!(ffi::phase(), Phase::Disabled);
    assert_eq!(
        ffi::trace_acquire_sequence(1),
        pmtrace::runtime::INVALID_SEQUENCE
    );
}
