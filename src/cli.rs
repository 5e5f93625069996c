//! CLI argument parsing for pmtrace

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pmtrace")]
#[command(version)]
#[command(
    about = "Crash-consistency trace instrumentation and recording for persistent-memory file systems",
    long_about = None
)]
pub struct Cli {
    /// Enable debug tracing output (to stderr)
    #[arg(long = "debug", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Assign stable program point ids to a module
    Number(NumberArgs),

    /// Remove the numbering table from a module
    Strip(ModuleIo),

    /// Insert runtime hook calls into a module
    Instrument(InstrumentArgs),

    /// Execute a module against the trace runtime and write both trace files
    Simulate(SimulateArgs),

    /// Print the records of a stored-value file
    DecodeValues(DecodeArgs),

    /// Re-order an event file by sequence number
    SortTrace(SortArgs),
}

/// Input module and optional output path (stdout when omitted)
#[derive(Args, Debug)]
pub struct ModuleIo {
    /// Module in IR JSON form
    #[arg(value_name = "MODULE")]
    pub input: PathBuf,

    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct NumberArgs {
    #[command(flatten)]
    pub io: ModuleIo,

    /// Annotation file listing runtime tracing functions (repeatable)
    #[arg(long = "runtime-list", value_name = "FILE")]
    pub runtime_lists: Vec<PathBuf>,

    /// Write `id:file:line` for every program point
    #[arg(long = "dump-sources", value_name = "FILE")]
    pub dump_sources: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct InstrumentArgs {
    #[command(flatten)]
    pub io: ModuleIo,

    /// Engine configuration (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Annotation file listing runtime tracing functions (repeatable)
    #[arg(long = "runtime-list", value_name = "FILE")]
    pub runtime_lists: Vec<PathBuf>,

    /// Annotation file listing file-system functions (repeatable)
    #[arg(long = "function-list", value_name = "FILE")]
    pub function_lists: Vec<PathBuf>,

    /// Annotation file listing tracked struct types (repeatable)
    #[arg(long = "struct-list", value_name = "FILE")]
    pub struct_lists: Vec<PathBuf>,

    /// Struct layout dump from the source analyzer
    #[arg(long = "struct-layout", value_name = "FILE")]
    pub struct_layout: Option<PathBuf>,

    /// Print per-category instrumentation counts to stderr
    #[arg(long = "stats")]
    pub stats: bool,
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Module in IR JSON form, usually instrumented
    #[arg(value_name = "MODULE")]
    pub input: PathBuf,

    /// Runtime configuration (TOML)
    #[arg(short = 'c', long = "runtime-config", value_name = "FILE")]
    pub runtime_config: Option<PathBuf>,

    /// Write pmtrace.func.trace and pmtrace.storevalue.trace here
    #[arg(long = "out-dir", value_name = "DIR")]
    pub out_dir: Option<PathBuf>,

    /// Function to run, as `name` or `name:arg,arg` (repeatable, in order;
    /// defaults to init_module then cleanup_module)
    #[arg(long = "call", value_name = "CALL")]
    pub calls: Vec<String>,

    /// Struct layout dump; overrides computed struct sizes and offsets
    #[arg(long = "struct-layout", value_name = "FILE")]
    pub struct_layout: Option<PathBuf>,

    /// Abort after this many executed instructions
    #[arg(long = "max-steps", value_name = "N", default_value = "10000000")]
    pub max_steps: u64,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Stored-value file
    #[arg(value_name = "FILE")]
    pub input: PathBuf,

    /// Print every byte instead of the first 32
    #[arg(long = "full")]
    pub full: bool,

    /// Only print pre-image records
    #[arg(long = "old-only")]
    pub old_only: bool,
}

#[derive(Args, Debug)]
pub struct SortArgs {
    /// Event file
    #[arg(value_name = "FILE")]
    pub input: PathBuf,

    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Report missing sequence ranges to stderr
    #[arg(long = "gaps")]
    pub gaps: bool,
}

/// Parse a `--call` argument: `name` or `name:1,2,0x10`
pub fn parse_call(text: &str) -> Result<(String, Vec<u64>), String> {
    let (name, args) = match text.split_once(':') {
        Some((name, args)) => (name, args),
        None => (text, ""),
    };
    if name.is_empty() {
        return Err(format!("empty function name in `{text}`"));
    }
    let args = args
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(|a| {
            let parsed = match a.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => a.parse::<u64>(),
            };
            parsed.map_err(|_| format!("invalid argument `{a}` in `{text}`"))
        })
        .collect::<Result<_, _>>()?;
    Ok((name.to_string(), args))
}
