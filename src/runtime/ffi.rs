//! C ABI of the trace runtime
//!
//! Instrumented code calls these symbols directly; the names and argument
//! orders match the hook declarations the instrumentation engine emits.
//! All calls go to one process-wide [`TraceRuntime`] over [`LiveMemory`],
//! configured on first use from the TOML file named by `PMTRACE_CONFIG`
//! (defaults when unset or unreadable).
//!
//! # Safety
//!
//! String arguments must be null or point to NUL-terminated strings; a null
//! string is recorded as missing. Entry points that capture a stored value
//! are `unsafe`: their address arguments must be readable for the size
//! passed with them, which holds for the address and size of the access the
//! instrumented code performs.
//!
//! ```compile_fail
//! pmtrace::runtime::ffi::trace_xchg_inst(1, 1, std::ptr::null(), 8);
//! ```

#![allow(clippy::missing_safety_doc)]

use super::config::RuntimeConfig;
use super::memory::LiveMemory;
use super::record::SourceLocation;
use super::sequence::Phase;
use super::{RuntimeStats, TraceRuntime};
use std::borrow::Cow;
use std::ffi::{c_char, c_long, c_ulong, c_void, CStr};
use std::sync::OnceLock;

/// Environment variable naming the runtime config file
pub const CONFIG_ENV: &str = "PMTRACE_CONFIG";

static RUNTIME: OnceLock<TraceRuntime<LiveMemory>> = OnceLock::new();

fn load_config() -> RuntimeConfig {
    let Some(path) = std::env::var_os(CONFIG_ENV) else {
        return RuntimeConfig::default();
    };
    match RuntimeConfig::from_toml(&path) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "falling back to default runtime config");
            RuntimeConfig::default()
        }
    }
}

fn runtime() -> &'static TraceRuntime<LiveMemory> {
    RUNTIME.get_or_init(|| {
        // SAFETY: the runtime is only reachable through the entry points
        // below, and those that capture values are `unsafe` with the
        // readability contract of `LiveMemory::new`.
        let memory = unsafe { LiveMemory::new() };
        TraceRuntime::new(load_config(), memory)
    })
}

/// Lifecycle phase of the process-wide runtime
pub fn phase() -> Phase {
    runtime().phase()
}

/// Counters of the process-wide runtime
pub fn stats() -> RuntimeStats {
    runtime().stats()
}

fn addr(ptr: *const c_void) -> u64 {
    ptr as usize as u64
}

unsafe fn text<'a>(ptr: *const c_char) -> Option<Cow<'a, str>> {
    if ptr.is_null() {
        None
    } else {
        // SAFETY: non-null strings are NUL-terminated per the module contract
        Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy())
    }
}

unsafe fn text_or_empty<'a>(ptr: *const c_char) -> Cow<'a, str> {
    unsafe { text(ptr) }.unwrap_or(Cow::Borrowed(""))
}

unsafe fn location(line: i32, col: i32, file: *const c_char, code: *const c_char) -> SourceLocation {
    SourceLocation {
        file: unsafe { text(file) }.map(Cow::into_owned),
        line: line.max(0) as u32,
        col: col.max(0) as u32,
        code: unsafe { text(code) }.map(Cow::into_owned),
    }
}

// ---- lifecycle and sequencing ---------------------------------------------

#[no_mangle]
pub extern "C" fn trace_init_all() {
    runtime().init_all();
}

#[no_mangle]
pub extern "C" fn trace_destroy_all(exit_code: i32) {
    runtime().destroy_all(exit_code);
}

#[no_mangle]
pub extern "C" fn trace_acquire_sequence(count: u64) -> u64 {
    runtime().acquire_sequence(count)
}

#[no_mangle]
pub unsafe extern "C" fn trace_old_store_value(seq: u64, ptr: *const c_void, size: u64, shift: u64) {
    runtime().old_store_value(seq, addr(ptr), size, shift);
}

// ---- functions and calls ----------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn trace_start_func(id: u32, func: *const c_void, name: *const c_char) {
    runtime().start_func(id, addr(func), &unsafe { text_or_empty(name) });
}

#[no_mangle]
pub unsafe extern "C" fn trace_end_func(id: u32, func: *const c_void, name: *const c_char) {
    runtime().end_func(id, addr(func), &unsafe { text_or_empty(name) });
}

#[no_mangle]
pub unsafe extern "C" fn trace_start_calls(
    id: u32,
    caller: *const c_char,
    callee: *const c_char,
    file: *const c_char,
    line: u32,
) {
    let (caller, callee, file) = unsafe { (text_or_empty(caller), text_or_empty(callee), text(file)) };
    runtime().start_call(id, &caller, &callee, file.as_deref(), line);
}

#[no_mangle]
pub unsafe extern "C" fn trace_end_calls(
    id: u32,
    caller: *const c_char,
    callee: *const c_char,
    file: *const c_char,
    line: u32,
) {
    let (caller, callee, file) = unsafe { (text_or_empty(caller), text_or_empty(callee), text(file)) };
    runtime().end_call(id, &caller, &callee, file.as_deref(), line);
}

// ---- memory accesses --------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn trace_load_inst(
    id: u32,
    ptr: *const c_void,
    size: u64,
    line: i32,
    col: i32,
    file: *const c_char,
    code: *const c_char,
) {
    let loc = unsafe { location(line, col, file, code) };
    runtime().load(id, addr(ptr), size, loc);
}

#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn trace_store_inst(
    seq: u64,
    id: u32,
    ptr: *const c_void,
    size: u64,
    line: i32,
    col: i32,
    file: *const c_char,
    code: *const c_char,
) {
    let loc = unsafe { location(line, col, file, code) };
    runtime().store(seq, id, addr(ptr), size, loc);
}

#[no_mangle]
pub unsafe extern "C" fn trace_fence_inst(
    id: u32,
    line: i32,
    col: i32,
    file: *const c_char,
    code: *const c_char,
) {
    let loc = unsafe { location(line, col, file, code) };
    runtime().fence(id, loc);
}

#[no_mangle]
pub unsafe extern "C" fn trace_xchg_inst(seq: u64, id: u32, ptr: *const c_void, size: u64) {
    runtime().xchg(seq, id, addr(ptr), size);
}

#[no_mangle]
pub unsafe extern "C" fn trace_rmw_inst(seq: u64, id: u32, ptr: *const c_void, size: u64) {
    runtime().rmw(seq, id, addr(ptr), size);
}

#[no_mangle]
pub unsafe extern "C" fn trace_memset_inst(seq: u64, id: u32, ptr: *const c_void, size: u64) {
    runtime().memset(seq, id, addr(ptr), size);
}

#[no_mangle]
pub unsafe extern "C" fn trace_memtransfer_inst(
    seq: u64,
    id: u32,
    dest: *const c_void,
    src: *const c_void,
    size: u64,
) {
    runtime().memtransfer(seq, id, addr(dest), addr(src), size);
}

#[no_mangle]
pub extern "C" fn trace_select_inst(id: u32, flag: u64) {
    runtime().select(id, flag);
}

// ---- inline assembly and fences ---------------------------------------------

#[no_mangle]
pub extern "C" fn trace_inline_asm_flush(id: u32, ptr: *const c_void) {
    runtime().asm_flush(id, addr(ptr));
}

#[no_mangle]
pub extern "C" fn trace_inline_asm_fence(id: u32) {
    runtime().asm_fence(id);
}

#[no_mangle]
pub extern "C" fn trace_implicit_fence(id: u32) {
    runtime().implicit_fence(id);
}

#[no_mangle]
pub unsafe extern "C" fn trace_inline_asm_xchglq(seq: u64, id: u32, ptr: *const c_void, size: u64) {
    runtime().asm_xchg(seq, id, addr(ptr), size);
}

#[no_mangle]
pub unsafe extern "C" fn trace_inline_asm_cas(seq: u64, id: u32, ptr: *const c_void, size: u64) {
    runtime().asm_cas(seq, id, addr(ptr), size);
}

#[no_mangle]
pub unsafe extern "C" fn trace_inline_asm_memsetnt(seq: u64, id: u32, ptr: *const c_void, size: u64) {
    runtime().asm_memset_nt(seq, id, addr(ptr), size);
}

#[no_mangle]
pub unsafe extern "C" fn trace_inline_asm_unknown(
    id: u32,
    caller: *const c_char,
    file: *const c_char,
    line: u32,
    asm: *const c_char,
) {
    let (caller, file, asm) = unsafe { (text_or_empty(caller), text(file), text_or_empty(asm)) };
    runtime().asm_unknown(id, &caller, file.as_deref(), line, &asm);
}

// ---- kernel helpers ---------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn trace_uaccess_calls(
    seq: u64,
    id: u32,
    to: *const c_void,
    from: *const c_void,
    size: c_ulong,
) {
    runtime().uaccess(seq, id, addr(to), addr(from), u64::from(size));
}

#[no_mangle]
pub unsafe extern "C" fn trace_uaccess_nt_calls(
    seq: u64,
    id: u32,
    to: *const c_void,
    from: *const c_void,
    size: c_ulong,
) {
    runtime().uaccess_nt(seq, id, addr(to), addr(from), u64::from(size));
}

#[no_mangle]
pub extern "C" fn trace_centralized_flush(seq: u64, id: u32, ptr: *const c_void, size: u32) {
    runtime().centralized_flush(seq, id, addr(ptr), size);
}

/// `base` is the out-parameter `dax_direct_access` filled in
#[no_mangle]
pub unsafe extern "C" fn trace_dax_access(id: u32, base: *const *mut c_void, pages: c_long) {
    if base.is_null() || pages <= 0 {
        return;
    }
    // SAFETY: `base` is the non-null out-parameter of the traced call
    let start = unsafe { *base };
    runtime().dax_access(id, addr(start), pages as u64);
}

// ---- structs ----------------------------------------------------------------

#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn trace_unknown_struct_ptr_inst(
    id: u32,
    ptr: *const c_void,
    idx: u32,
    size: u64,
    type_name: *const c_char,
    line: i32,
    col: i32,
    file: *const c_char,
    code: *const c_char,
) {
    let type_name = unsafe { text_or_empty(type_name) };
    let loc = unsafe { location(line, col, file, code) };
    runtime().struct_ptr(id, addr(ptr), idx, size, &type_name, loc);
}

#[no_mangle]
pub unsafe extern "C" fn trace_dbg_var_store(
    id: u32,
    ptr: *const c_void,
    type_name: *const c_char,
    size: u64,
) {
    let type_name = unsafe { text_or_empty(type_name) };
    runtime().dbg_var_store(id, addr(ptr), &type_name, size);
}
