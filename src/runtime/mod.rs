//! Trace recording runtime
//!
//! Receives the hook calls the instrumentation engine inserted and turns
//! them into two streams:
//!
//! - the event stream, one text line per event ([`record::EventRecord`]),
//! - the stored-value stream, `u64 seq | u64 len | bytes` records holding
//!   pre- and post-images of every store-like event.
//!
//! The hot path never performs I/O. Records wait in lock-free pending
//! buffers until `init_all`, `destroy_all` or an explicit `flush_all`
//! writes them out. Four independent critical sections exist: the
//! sequencer, the two pending buffers, and each file's offset. The
//! lifecycle lock (`sinks`) is only taken by init, teardown and flush.
//!
//! # Example
//!
//! ```
//! use pmtrace::runtime::{RuntimeConfig, TraceRuntime};
//! use pmtrace::runtime::memory::SimMemory;
//! use pmtrace::runtime::record::SourceLocation;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let config = RuntimeConfig { user_space_limit: 0, ..RuntimeConfig::in_dir(dir.path()) };
//! let runtime = TraceRuntime::new(config, SimMemory::new());
//!
//! runtime.init_all();
//! let seq = runtime.acquire_sequence(1);
//! runtime.old_store_value(seq, 0x1000, 8, 0);
//! runtime.memory().write_u64(0x1000, 42);
//! runtime.store(seq, 1, 0x1000, 8, SourceLocation::default());
//! runtime.destroy_all(1);
//!
//! let events = std::fs::read_to_string(dir.path().join("pmtrace.func.trace")).unwrap();
//! assert!(events.contains("store"));
//! ```

pub mod buffer;
pub mod config;
pub mod ffi;
pub mod filter;
pub mod memory;
pub mod record;
pub mod sequence;
pub mod sink;

pub use buffer::{BufferPolicy, BufferStats, PendingBuffer};
pub use config::{ConfigError, RuntimeConfig, MAX_VALUE_LEN};
pub use filter::{AddressFilter, FilterMode, PmRange};
pub use memory::{AddressSpace, LiveMemory, SimMemory};
pub use record::{EventRecord, SourceLocation, TraceEvent};
pub use sequence::{Phase, FIRST_SEQUENCE, INVALID_SEQUENCE, OLD_VALUE_OFFSET};

use record::{AccessKind, Boundary, FenceKind, UserCopyKind};
use sequence::{old_value_sequence, Sequencer};
use sink::Sinks;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Unknown asm text longer than this is cut
pub const MAX_ASM_TEXT: usize = 400;

/// Bytes a cache-line flush covers
const CACHE_LINE: u64 = 64;

/// Captured bytes waiting to be written to the value stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub seq: u64,
    pub bytes: Vec<u8>,
}

/// Outcome of one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub events_written: u64,
    pub values_written: u64,
    /// Records lost to write errors or a missing output file
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Diagnostics {
    oversized_values: AtomicU64,
    unreadable_values: AtomicU64,
    /// Value buffers that could not be allocated
    alloc_failures: AtomicU64,
    /// Hook calls refused because the runtime is errored
    errored_drops: AtomicU64,
    /// Records left pending by a previous session, discarded on re-init
    stale_discarded: AtomicU64,
    flushed_events: AtomicU64,
    flushed_values: AtomicU64,
    failed_writes: AtomicU64,
}

/// Snapshot of runtime counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuntimeStats {
    pub phase: Phase,
    pub next_sequence: u64,
    pub events: BufferStats,
    pub values: BufferStats,
    pub oversized_values: u64,
    pub unreadable_values: u64,
    pub alloc_failures: u64,
    pub errored_drops: u64,
    pub stale_discarded: u64,
    pub flushed_events: u64,
    pub flushed_values: u64,
    pub failed_writes: u64,
}

impl RuntimeStats {
    /// Events lost for any reason other than filtering
    pub fn dropped_events(&self) -> u64 {
        self.events.total_dropped
    }
}

/// Id of the calling thread, recorded in every event
fn current_tid() -> i32 {
    nix::unistd::gettid().as_raw()
}

/// Runtime state: sequencer, filter, pending buffers and output files
#[derive(Debug)]
pub struct TraceRuntime<M: AddressSpace> {
    config: RuntimeConfig,
    memory: M,
    sequencer: Sequencer,
    filter: AddressFilter,
    events: PendingBuffer<EventRecord>,
    values: PendingBuffer<StoredValue>,
    /// Lifecycle lock; `Some` while output files are open
    sinks: Mutex<Option<Sinks>>,
    diagnostics: Diagnostics,
}

impl<M: AddressSpace> TraceRuntime<M> {
    pub fn new(config: RuntimeConfig, memory: M) -> Self {
        Self {
            filter: AddressFilter::new(config.address_filter, config.user_space_limit),
            events: PendingBuffer::new(config.buffer),
            values: PendingBuffer::new(config.buffer),
            sequencer: Sequencer::new(),
            sinks: Mutex::new(None),
            diagnostics: Diagnostics::default(),
            config,
            memory,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn filter(&self) -> &AddressFilter {
        &self.filter
    }

    pub fn phase(&self) -> Phase {
        self.sequencer.phase()
    }

    // ---- lifecycle --------------------------------------------------------

    /// Open both output files and enable tracing
    ///
    /// A no-op while already enabled or errored. If a file cannot be opened
    /// the runtime enters [`Phase::Errored`]: sequencing continues, nothing
    /// is recorded.
    pub fn init_all(&self) {
        let Ok(mut sinks) = self.sinks.lock() else {
            tracing::error!("runtime lifecycle lock poisoned");
            return;
        };
        if self.sequencer.phase().is_active() {
            tracing::info!("trace runtime already initialized");
            return;
        }

        let stale = (self.events.clear() + self.values.clear()) as u64;
        if stale > 0 {
            self.diagnostics
                .stale_discarded
                .fetch_add(stale, Ordering::Relaxed);
            tracing::warn!(stale, "discarding records left from the previous session");
        }
        self.filter.set_range(None);
        match Sinks::open(&self.config.event_path, &self.config.value_path) {
            Ok(opened) => {
                *sinks = Some(opened);
                self.sequencer.start(Phase::Enabled);
                tracing::info!(
                    events = %self.config.event_path.display(),
                    values = %self.config.value_path.display(),
                    "trace runtime initialized"
                );
            }
            Err(err) => {
                *sinks = None;
                self.sequencer.start(Phase::Errored);
                tracing::error!(error = %err, "cannot open trace output, tracing degraded");
            }
        }
    }

    /// Flush, close and disable
    ///
    /// `exit_code == 0` means the module never finished loading and nothing
    /// is torn down. Idempotent.
    pub fn destroy_all(&self, exit_code: i32) {
        if exit_code == 0 {
            tracing::info!("module init returned 0, trace runtime kept");
            return;
        }
        let Ok(mut sinks) = self.sinks.lock() else {
            tracing::error!("runtime lifecycle lock poisoned");
            return;
        };
        if !self.sequencer.phase().is_active() {
            tracing::info!("trace runtime not enabled, nothing to tear down");
            return;
        }

        let report = self.flush_locked(sinks.as_ref());
        if let Some(opened) = sinks.as_ref() {
            for file in [&opened.events, &opened.values] {
                if let Err(err) = file.sync() {
                    tracing::warn!(path = %file.path().display(), error = %err, "sync failed");
                }
            }
        }
        *sinks = None;
        self.filter.set_range(None);
        self.sequencer.set_phase(Phase::Disabled);
        tracing::info!(
            events = report.events_written,
            values = report.values_written,
            failed = report.failed,
            "trace runtime torn down"
        );
    }

    /// Write every pending record to the output files
    pub fn flush_all(&self) -> FlushReport {
        match self.sinks.lock() {
            Ok(sinks) => self.flush_locked(sinks.as_ref()),
            Err(_) => {
                tracing::error!("runtime lifecycle lock poisoned");
                FlushReport::default()
            }
        }
    }

    /// Flush with the lifecycle lock already held by the caller
    fn flush_locked(&self, sinks: Option<&Sinks>) -> FlushReport {
        let mut report = FlushReport::default();
        let Some(sinks) = sinks else {
            report.failed = (self.events.clear() + self.values.clear()) as u64;
            self.diagnostics
                .failed_writes
                .fetch_add(report.failed, Ordering::Relaxed);
            return report;
        };

        let pending_events = self.events.drain();
        tracing::debug!(count = pending_events.len(), "flushing event buffer");
        for event in pending_events {
            match sinks
                .events
                .write_record(&event.render(self.config.max_record_len))
            {
                Ok(()) => report.events_written += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(seq = event.seq, error = %err, "event write failed");
                }
            }
        }

        let pending_values = self.values.drain();
        tracing::debug!(count = pending_values.len(), "flushing value buffer");
        for value in pending_values {
            match sinks.values.write_value(value.seq, &value.bytes) {
                Ok(()) => report.values_written += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(seq = value.seq, error = %err, "value write failed");
                }
            }
        }

        let d = &self.diagnostics;
        d.flushed_events
            .fetch_add(report.events_written, Ordering::Relaxed);
        d.flushed_values
            .fetch_add(report.values_written, Ordering::Relaxed);
        d.failed_writes.fetch_add(report.failed, Ordering::Relaxed);
        report
    }

    // ---- core operations --------------------------------------------------

    /// Reserve `count` sequence numbers, returning the first
    pub fn acquire_sequence(&self, count: u64) -> u64 {
        self.sequencer.acquire(count)
    }

    /// Whether records can be accepted; counts the drop when errored
    fn accepting(&self) -> bool {
        match self.sequencer.phase() {
            Phase::Enabled => true,
            Phase::Errored => {
                self.diagnostics
                    .errored_drops
                    .fetch_add(1, Ordering::Relaxed);
                false
            }
            Phase::Uninitialized | Phase::Disabled => false,
        }
    }

    /// Queue one event; returns `false` if it was dropped
    pub fn record_event(&self, seq: u64, event: TraceEvent) -> bool {
        self.record_event_at(seq, event, None)
    }

    fn record_event_at(
        &self,
        seq: u64,
        event: TraceEvent,
        location: Option<SourceLocation>,
    ) -> bool {
        if seq >= INVALID_SEQUENCE || !self.accepting() {
            return false;
        }
        self.push_event(seq, event, location)
    }

    /// Queue one event of a hook that already passed [`Self::accepting`]
    fn push_event(&self, seq: u64, event: TraceEvent, location: Option<SourceLocation>) -> bool {
        let mut record = EventRecord::new(seq, current_tid(), event);
        record.location = location.filter(|_| self.config.emit_source_locations);
        let accepted = self.events.push(record);
        if !accepted {
            let dropped = self.events.stats().total_dropped;
            if dropped.is_power_of_two() {
                tracing::warn!(seq, dropped, "event buffer full, events dropped");
            }
        }
        accepted
    }

    /// Queue the `len` bytes at `addr` under `seq`; returns `false` if the
    /// value was not recorded
    pub fn record_value(&self, seq: u64, addr: u64, len: u64) -> bool {
        if seq >= INVALID_SEQUENCE || self.filter.is_user_space(addr) || !self.accepting() {
            return false;
        }
        self.capture_value(seq, addr, len)
    }

    /// Copy and queue a value for a hook that already passed
    /// [`Self::accepting`] and the user-space check
    fn capture_value(&self, seq: u64, addr: u64, len: u64) -> bool {
        if len > self.config.max_value_len {
            self.diagnostics
                .oversized_values
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(seq, len, max = self.config.max_value_len, "stored value too large, dropped");
            return false;
        }
        let buffer = usize::try_from(len).ok().and_then(|len| {
            let mut bytes = Vec::new();
            bytes.try_reserve_exact(len).ok()?;
            bytes.resize(len, 0);
            Some(bytes)
        });
        let Some(mut bytes) = buffer else {
            self.diagnostics
                .alloc_failures
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(seq, len, "cannot allocate stored value, dropped");
            return false;
        };
        if !self.memory.read_into(addr, &mut bytes) {
            self.diagnostics
                .unreadable_values
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(seq, addr, len, "stored value unreadable");
            return false;
        }
        let accepted = self.values.push(StoredValue { seq, bytes });
        if !accepted {
            let dropped = self.values.stats().total_dropped;
            if dropped.is_power_of_two() {
                tracing::warn!(seq, dropped, "value buffer full, values dropped");
            }
        }
        accepted
    }

    /// Capture the pre-image of a store-like event at
    /// `seq + shift + OLD_VALUE_OFFSET`
    pub fn old_store_value(&self, seq: u64, addr: u64, size: u64, shift: u64) {
        if seq >= INVALID_SEQUENCE || !self.filter.passes(addr, size) {
            return;
        }
        self.record_value(old_value_sequence(seq, shift), addr, size);
    }

    /// Set the persistent-memory window and log it as a `DaxDevInfo` event
    pub fn record_address_range(&self, base: u64, page_count: u64) {
        let seq = self.acquire_sequence(1);
        if seq == INVALID_SEQUENCE {
            return;
        }
        let range = PmRange::from_pages(base, page_count);
        self.filter.set_range(range);
        let len = page_count.saturating_mul(filter::PAGE_SIZE);
        tracing::info!(base, end = base.saturating_add(len), len, "persistent memory window");
        self.record_event(
            seq,
            TraceEvent::DaxDevInfo {
                start: base,
                end: base.saturating_add(len),
                size_mib: len / (1024 * 1024),
            },
        );
    }

    pub fn stats(&self) -> RuntimeStats {
        let d = &self.diagnostics;
        RuntimeStats {
            phase: self.sequencer.phase(),
            next_sequence: self.sequencer.peek(),
            events: self.events.stats(),
            values: self.values.stats(),
            oversized_values: d.oversized_values.load(Ordering::Relaxed),
            unreadable_values: d.unreadable_values.load(Ordering::Relaxed),
            alloc_failures: d.alloc_failures.load(Ordering::Relaxed),
            errored_drops: d.errored_drops.load(Ordering::Relaxed),
            stale_discarded: d.stale_discarded.load(Ordering::Relaxed),
            flushed_events: d.flushed_events.load(Ordering::Relaxed),
            flushed_values: d.flushed_values.load(Ordering::Relaxed),
            failed_writes: d.failed_writes.load(Ordering::Relaxed),
        }
    }

    // ---- hook entry points ------------------------------------------------

    /// Event that takes its own sequence number
    fn sequenced(&self, event: TraceEvent, location: Option<SourceLocation>) {
        let seq = self.acquire_sequence(1);
        self.record_event_at(seq, event, location);
    }

    /// Event whose sequence number was reserved before the write, plus its
    /// post-image
    fn store_like(
        &self,
        kind: AccessKind,
        seq: u64,
        id: u32,
        ptr: u64,
        size: u64,
        location: Option<SourceLocation>,
    ) {
        if seq >= INVALID_SEQUENCE || !self.filter.passes(ptr, size) || !self.accepting() {
            return;
        }
        self.push_event(seq, TraceEvent::Access { kind, id, ptr, size }, location);
        if !self.filter.is_user_space(ptr) {
            self.capture_value(seq, ptr, size);
        }
    }

    pub fn load(&self, id: u32, ptr: u64, size: u64, location: SourceLocation) {
        let seq = self.acquire_sequence(1);
        if seq == INVALID_SEQUENCE || !self.filter.passes(ptr, size) {
            return;
        }
        let event = TraceEvent::Access {
            kind: AccessKind::Load,
            id,
            ptr,
            size,
        };
        self.record_event_at(seq, event, Some(location));
    }

    pub fn store(&self, seq: u64, id: u32, ptr: u64, size: u64, location: SourceLocation) {
        self.store_like(AccessKind::Store, seq, id, ptr, size, Some(location));
    }

    /// Fence instructions are recorded like fence asm
    pub fn fence(&self, id: u32, _location: SourceLocation) {
        self.asm_fence(id);
    }

    pub fn xchg(&self, seq: u64, id: u32, ptr: u64, size: u64) {
        self.store_like(AccessKind::Xchg, seq, id, ptr, size, None);
    }

    pub fn rmw(&self, seq: u64, id: u32, ptr: u64, size: u64) {
        self.store_like(AccessKind::Rmw, seq, id, ptr, size, None);
    }

    pub fn memset(&self, seq: u64, id: u32, ptr: u64, size: u64) {
        self.store_like(AccessKind::Memset, seq, id, ptr, size, None);
    }

    /// Source read at `seq`, destination write at `seq + 1`
    pub fn memtransfer(&self, seq: u64, id: u32, dest: u64, src: u64, size: u64) {
        if seq >= INVALID_SEQUENCE {
            return;
        }
        let (read, write) = (self.filter.passes(src, size), self.filter.passes(dest, size));
        if !(read || write) || !self.accepting() {
            return;
        }
        if read {
            let event = TraceEvent::Access {
                kind: AccessKind::TransferLoad,
                id,
                ptr: src,
                size,
            };
            self.push_event(seq, event, None);
        }
        if write {
            let event = TraceEvent::Access {
                kind: AccessKind::TransferStore,
                id,
                ptr: dest,
                size,
            };
            self.push_event(seq + 1, event, None);
            if !self.filter.is_user_space(dest) {
                self.capture_value(seq + 1, dest, size);
            }
        }
    }

    pub fn asm_flush(&self, id: u32, ptr: u64) {
        let seq = self.acquire_sequence(1);
        if seq == INVALID_SEQUENCE || !self.filter.passes(ptr, CACHE_LINE) {
            return;
        }
        self.record_event(seq, TraceEvent::AsmFlush { id, ptr });
    }

    pub fn asm_fence(&self, id: u32) {
        self.sequenced(
            TraceEvent::Fence {
                kind: FenceKind::Asm,
                id,
            },
            None,
        );
    }

    /// Fence implied by an atomic or a lock operation
    pub fn implicit_fence(&self, id: u32) {
        self.sequenced(
            TraceEvent::Fence {
                kind: FenceKind::Implicit,
                id,
            },
            None,
        );
    }

    pub fn asm_xchg(&self, seq: u64, id: u32, ptr: u64, size: u64) {
        self.store_like(AccessKind::AsmXchg, seq, id, ptr, size, None);
    }

    pub fn asm_cas(&self, seq: u64, id: u32, ptr: u64, size: u64) {
        self.store_like(AccessKind::AsmCas, seq, id, ptr, size, None);
    }

    pub fn asm_memset_nt(&self, seq: u64, id: u32, ptr: u64, size: u64) {
        self.store_like(AccessKind::AsmMemsetNt, seq, id, ptr, size, None);
    }

    pub fn asm_unknown(&self, id: u32, caller: &str, file: Option<&str>, line: u32, asm: &str) {
        self.sequenced(
            TraceEvent::UnknownAsm {
                id,
                caller: caller.to_string(),
                file: file.map(str::to_string),
                line,
                asm: asm.chars().take(MAX_ASM_TEXT).collect(),
            },
            None,
        );
    }

    pub fn start_func(&self, id: u32, ptr: u64, name: &str) {
        self.function_boundary(Boundary::Start, id, ptr, name);
    }

    pub fn end_func(&self, id: u32, ptr: u64, name: &str) {
        self.function_boundary(Boundary::End, id, ptr, name);
    }

    fn function_boundary(&self, boundary: Boundary, id: u32, ptr: u64, name: &str) {
        self.sequenced(
            TraceEvent::Function {
                boundary,
                id,
                ptr,
                name: name.to_string(),
            },
            None,
        );
    }

    pub fn select(&self, id: u32, flag: u64) {
        self.sequenced(TraceEvent::Select { id, flag }, None);
    }

    pub fn start_call(&self, id: u32, caller: &str, callee: &str, file: Option<&str>, line: u32) {
        self.call_boundary(Boundary::Start, id, caller, callee, file, line);
    }

    pub fn end_call(&self, id: u32, caller: &str, callee: &str, file: Option<&str>, line: u32) {
        self.call_boundary(Boundary::End, id, caller, callee, file, line);
    }

    fn call_boundary(
        &self,
        boundary: Boundary,
        id: u32,
        caller: &str,
        callee: &str,
        file: Option<&str>,
        line: u32,
    ) {
        self.sequenced(
            TraceEvent::Call {
                boundary,
                id,
                caller: caller.to_string(),
                callee: callee.to_string(),
                file: file.map(str::to_string),
                line,
            },
            None,
        );
    }

    /// Copy between user and kernel memory: read at `seq`, write at
    /// `seq + 1`. Copies to user space are not traced.
    pub fn uaccess(&self, seq: u64, id: u32, to: u64, from: u64, size: u64) {
        self.user_copy(UserCopyKind::Load, UserCopyKind::Store, seq, id, to, from, size);
    }

    pub fn uaccess_nt(&self, seq: u64, id: u32, to: u64, from: u64, size: u64) {
        self.user_copy(
            UserCopyKind::NonTemporalLoad,
            UserCopyKind::NonTemporalStore,
            seq,
            id,
            to,
            from,
            size,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn user_copy(
        &self,
        load: UserCopyKind,
        store: UserCopyKind,
        seq: u64,
        id: u32,
        to: u64,
        from: u64,
        size: u64,
    ) {
        if seq >= INVALID_SEQUENCE || self.filter.is_user_space(to) {
            return;
        }
        let (read, write) = (self.filter.passes(from, size), self.filter.passes(to, size));
        if !(read || write) || !self.accepting() {
            return;
        }
        if read {
            let event = TraceEvent::UserCopy {
                kind: load,
                id,
                from,
                to,
                size,
            };
            self.push_event(seq, event, None);
        }
        if write {
            let event = TraceEvent::UserCopy {
                kind: store,
                id,
                from,
                to,
                size,
            };
            self.push_event(seq + 1, event, None);
            self.capture_value(seq + 1, to, size);
        }
    }

    /// Whole-buffer flush helper; no value is captured
    pub fn centralized_flush(&self, seq: u64, id: u32, ptr: u64, size: u32) {
        let size = u64::from(size);
        if seq >= INVALID_SEQUENCE || !self.filter.passes(ptr, size) {
            return;
        }
        let event = TraceEvent::Access {
            kind: AccessKind::CentralizedFlush,
            id,
            ptr,
            size,
        };
        self.record_event(seq, event);
    }

    /// `dax_direct_access` returned `page_count` pages mapped at `base`
    pub fn dax_access(&self, _id: u32, base: u64, page_count: u64) {
        self.record_address_range(base, page_count);
    }

    /// Pointer into an annotated struct, classified against the
    /// persistent-memory window
    pub fn struct_ptr(
        &self,
        id: u32,
        ptr: u64,
        idx: u32,
        size: u64,
        type_name: &str,
        location: SourceLocation,
    ) {
        let class = self.filter.classify_struct(ptr, size);
        self.sequenced(
            TraceEvent::StructPtr {
                class,
                id,
                type_name: type_name.to_string(),
                ptr,
                idx,
                size,
            },
            Some(location),
        );
    }

    /// Value held by a variable of an annotated struct type
    pub fn dbg_var_store(&self, id: u32, ptr: u64, type_name: &str, size: u64) {
        self.sequenced(
            TraceEvent::DbgStore {
                id,
                type_name: type_name.to_string(),
                ptr,
                size,
            },
            None,
        );
    }

    /// Pending events, oldest first; drains the buffer
    pub fn take_pending_events(&self) -> Vec<EventRecord> {
        self.events.drain()
    }

    /// Pending stored values, oldest first; drains the buffer
    pub fn take_pending_values(&self) -> Vec<StoredValue> {
        self.values.drain()
    }
}

#[cfg(test)]
mod tests;
