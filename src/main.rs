use anyhow::{Context, Result};
use clap::Parser;
use pmtrace::annotation::AnnotationSet;
use pmtrace::cli::{
    self, Cli, Command, DecodeArgs, InstrumentArgs, ModuleIo, NumberArgs, SimulateArgs, SortArgs,
};
use pmtrace::instrument::{InstrumentConfig, Instrumenter};
use pmtrace::ir::Module;
use pmtrace::layout::{DataLayout, StructLayoutDump};
use pmtrace::numbering::{self, NumberingOptions};
use pmtrace::runtime::memory::SimMemory;
use pmtrace::runtime::{RuntimeConfig, TraceRuntime};
use pmtrace::sim::{SimConfig, Simulator};
use pmtrace::trace_reader;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Functions run by `simulate` when no `--call` is given
const DEFAULT_CALLS: [&str; 2] = ["init_module", "cleanup_module"];

/// Bytes of each value printed by `decode-values` without `--full`
const PREVIEW_BYTES: usize = 32;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_module(path: &Path) -> Result<Module> {
    Module::from_path(path).with_context(|| format!("Failed to load module {}", path.display()))
}

fn write_module(module: &Module, output: Option<&Path>) -> Result<()> {
    let json = module.to_json_string()?;
    match output {
        Some(path) => fs::write(path, json + "\n")
            .with_context(|| format!("Failed to write module {}", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}

fn run_number(args: NumberArgs) -> Result<()> {
    let mut module = load_module(&args.io.input)?;
    let runtime_funcs = AnnotationSet::from_files(&args.runtime_lists);
    let options = NumberingOptions {
        dump_sources: args.dump_sources,
    };
    let report = numbering::number_module(&mut module, &runtime_funcs, &options)?;
    eprintln!(
        "numbered {} program points in {} blocks",
        report.points, report.blocks
    );
    write_module(&module, args.io.output.as_deref())
}

fn run_strip(io: ModuleIo) -> Result<()> {
    let mut module = load_module(&io.input)?;
    if !numbering::strip_numbering(&mut module) {
        eprintln!("module `{}` was not numbered", module.name);
    }
    write_module(&module, io.output.as_deref())
}

fn run_instrument(args: InstrumentArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => InstrumentConfig::from_toml(path)?,
        None => InstrumentConfig::default(),
    };
    config.runtime_function_lists.extend(args.runtime_lists);
    config.function_lists.extend(args.function_lists);
    config.struct_lists.extend(args.struct_lists);
    if args.struct_layout.is_some() {
        config.struct_layout = args.struct_layout;
    }

    let mut module = load_module(&args.io.input)?;
    if module.numbering.is_none() {
        let runtime_funcs = AnnotationSet::from_files(&config.runtime_function_lists);
        let report =
            numbering::number_module(&mut module, &runtime_funcs, &NumberingOptions::default())?;
        tracing::info!(points = report.points, "module was not numbered, numbered it first");
    }

    let mut engine = Instrumenter::new(config)?;
    let stats = engine
        .run(&mut module)
        .with_context(|| format!("Failed to instrument module `{}`", module.name))?;
    if args.stats {
        stats.print_summary();
    }
    write_module(&module, args.io.output.as_deref())
}

fn run_simulate(args: SimulateArgs) -> Result<()> {
    let module = load_module(&args.input)?;
    let mut config = match &args.runtime_config {
        Some(path) => RuntimeConfig::from_toml(path)?,
        None => RuntimeConfig::in_dir("."),
    };
    if let Some(dir) = &args.out_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
        let located = RuntimeConfig::in_dir(dir);
        config.event_path = located.event_path;
        config.value_path = located.value_path;
    }

    let calls: Vec<(String, Vec<u64>)> = if args.calls.is_empty() {
        DEFAULT_CALLS
            .iter()
            .filter(|name| module.function(name).is_some())
            .map(|name| (name.to_string(), Vec::new()))
            .collect()
    } else {
        args.calls
            .iter()
            .map(|call| cli::parse_call(call).map_err(anyhow::Error::msg))
            .collect::<Result<Vec<_>>>()?
    };
    if calls.is_empty() {
        anyhow::bail!(
            "Module `{}` has no init_module or cleanup_module; choose functions with --call",
            module.name
        );
    }

    let runtime = TraceRuntime::new(config, SimMemory::new());
    let sim_config = SimConfig {
        max_steps: args.max_steps,
        ..Default::default()
    };
    let mut sim = Simulator::new(&module, &runtime, sim_config);
    if let Some(path) = &args.struct_layout {
        let mut layout = DataLayout::for_module(&module);
        layout.apply_dump(&StructLayoutDump::from_path(path)?);
        sim = sim.with_layout(layout);
    }
    for (name, call_args) in &calls {
        let result = sim
            .call(name, call_args)
            .with_context(|| format!("Simulation of `{name}` failed"))?;
        eprintln!("{name} returned {result}");
    }

    let report = runtime.flush_all();
    let stats = runtime.stats();
    eprintln!(
        "executed {} instructions; events written: {}, values written: {}, dropped: {}, phase: {:?}",
        sim.steps(),
        stats.flushed_events,
        stats.flushed_values,
        stats.dropped_events() + stats.values.total_dropped + report.failed,
        stats.phase
    );
    Ok(())
}

fn run_decode(args: DecodeArgs) -> Result<()> {
    let values = trace_reader::read_value_file(&args.input)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for value in values.iter().filter(|v| !args.old_only || trace_reader::is_old_value(v.seq)) {
        let shown = if args.full {
            &value.bytes[..]
        } else {
            &value.bytes[..value.bytes.len().min(PREVIEW_BYTES)]
        };
        let more = if shown.len() < value.bytes.len() { "..." } else { "" };
        let kind = if trace_reader::is_old_value(value.seq) { "old" } else { "new" };
        writeln!(
            out,
            "{:>14} {} {:>8} {}{}",
            trace_reader::base_sequence(value.seq),
            kind,
            value.bytes.len(),
            hex::encode(shown),
            more
        )?;
    }
    eprintln!("{} records", values.len());
    Ok(())
}

fn run_sort(args: SortArgs) -> Result<()> {
    let mut events = trace_reader::read_event_file(&args.input)?;
    trace_reader::sort_by_sequence(&mut events);
    let text: String = events.iter().map(|e| e.to_lines()).collect();
    match &args.output {
        Some(path) => fs::write(path, text)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => print!("{text}"),
    }
    if args.gaps {
        let gaps = trace_reader::find_gaps(events.iter().map(|e| e.seq));
        for (start, end) in &gaps {
            eprintln!("gap: {start}..{end}");
        }
        eprintln!("{} gaps", gaps.len());
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    match args.command {
        Command::Number(a) => run_number(a),
        Command::Strip(io) => run_strip(io),
        Command::Instrument(a) => run_instrument(a),
        Command::Simulate(a) => run_simulate(a),
        Command::DecodeValues(a) => run_decode(a),
        Command::SortTrace(a) => run_sort(a),
    }
}
