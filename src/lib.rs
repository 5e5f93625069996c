//! pmtrace - crash-consistency execution tracing for persistent-memory file systems
//!
//! This library provides the instrumentation engine that rewrites a kernel
//! module so every memory access, fence and call relevant to crash
//! consistency reports itself, and the runtime that records those reports as
//! a totally ordered event stream plus a stream of stored values.

pub mod annotation;
pub mod cli;
pub mod instrument;
pub mod ir;
pub mod layout;
pub mod names;
pub mod numbering;
pub mod runtime;
pub mod sim;
pub mod trace_reader;
