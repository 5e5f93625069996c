//! Instrumentation engine
//!
//! Rewrites a numbered module so that every memory access, fence and call
//! relevant to crash consistency reports itself to the trace runtime.
//!
//! Per function the engine works in fixed phases:
//!
//! 1. build the struct declaration map from debug intrinsics (read-only
//!    afterwards),
//! 2. visit every original instruction once and splice hook calls around it,
//! 3. visit call sites again for lock fences and start/end call brackets,
//! 4. track values that debug info ties to an annotated struct,
//! 5. bracket the function with entry/exit events, and wrap the module
//!    init/exit functions with runtime setup and teardown.
//!
//! Store-like events reserve their sequence number *before* the access
//! executes (`trace_acquire_sequence`), so the pre-image and the post-image
//! share one position in the global order even when another CPU traces in
//! between.

pub mod asm;
pub mod calls;
pub mod config;
pub mod debug_types;
pub mod hooks;
pub mod stats;

pub use config::{CentralizedFlushConfig, InstrumentConfig};
pub use hooks::Hook;
pub use stats::{Counter, InstrumentStats};

use crate::annotation::AnnotationSet;
use crate::ir::{
    Arg, Callee, Function, InstKind, Instruction, Module, Operand, TraceCall, Type, ValueId,
};
use crate::layout::{source_struct_name, DataLayout, LayoutError, StructLayoutDump};
use crate::names;
use crate::numbering::{NumberingError, ProgramPoints};
use asm::{AsmClassifier, AsmIdiom};
use calls::{CallClass, LockKind};
use debug_types::StructDeclMap;
use std::collections::HashSet;
use thiserror::Error;

/// Index used when a struct GEP does not have the `base, 0, field` shape
pub const UNKNOWN_FIELD_INDEX: i64 = 9999;

/// Source snippets passed to the runtime are cut to this many characters
pub const MAX_SOURCE_SNIPPET: usize = 100;

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error(transparent)]
    Numbering(#[from] NumberingError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("invalid asm idiom pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("cannot find a return instruction in `{function}`")]
    MissingReturn { function: String },

    #[error("cannot resolve flush length for `{callee}` called from `{caller}`")]
    UnresolvedFlushSize { caller: String, callee: String },

    #[error("`{callee}` in `{function}` needs {expected} arguments, found {found}")]
    OperandShape {
        function: String,
        callee: String,
        expected: usize,
        found: usize,
    },
}

pub type Result<T> = std::result::Result<T, InstrumentError>;

/// Hook calls to place around one instruction
#[derive(Debug, Default)]
struct Splice {
    before: Vec<Instruction>,
    after: Vec<Instruction>,
}

/// Rebuild every block of `func`, splicing what `visit` returns around each
/// instruction that was present when the walk started
fn rewrite_blocks<F>(func: &mut Function, mut visit: F) -> Result<()>
where
    F: FnMut(&Instruction) -> Result<Splice>,
{
    for block in &mut func.blocks {
        let original = std::mem::take(&mut block.insts);
        let mut rewritten = Vec::with_capacity(original.len());
        for inst in original {
            let splice = visit(&inst)?;
            rewritten.extend(splice.before);
            rewritten.push(inst);
            rewritten.extend(splice.after);
        }
        block.insts = rewritten;
    }
    Ok(())
}

fn insert_before(func: &mut Function, target: ValueId, insts: Vec<Instruction>) -> bool {
    for block in &mut func.blocks {
        if let Some(pos) = block.insts.iter().position(|i| i.id == target) {
            block.insts.splice(pos..pos, insts);
            return true;
        }
    }
    false
}

/// Hands out value ids above everything already in the module
#[derive(Debug)]
struct ValueAllocator {
    next: u32,
}

impl ValueAllocator {
    fn new(module: &Module) -> Self {
        Self {
            next: module.max_value_id() + 1,
        }
    }

    fn next(&mut self) -> ValueId {
        let id = ValueId(self.next);
        self.next += 1;
        id
    }
}

fn int_bits(ty: &Type) -> u32 {
    match ty {
        Type::Int { bits } => *bits,
        _ => 64,
    }
}

/// The instrumentation engine
///
/// # Example
///
/// ```
/// use pmtrace::annotation::AnnotationSet;
/// use pmtrace::instrument::{InstrumentConfig, Instrumenter};
/// use pmtrace::ir::Module;
/// use pmtrace::numbering::{number_module, NumberingOptions};
///
/// let mut module = Module { name: "empty".into(), ..Default::default() };
/// number_module(&mut module, &AnnotationSet::new(), &NumberingOptions::default()).unwrap();
///
/// let mut engine = Instrumenter::new(InstrumentConfig::default()).unwrap();
/// let stats = engine.run(&mut module).unwrap();
/// assert_eq!(stats.total(), 0);
/// ```
#[derive(Debug)]
pub struct Instrumenter {
    config: InstrumentConfig,
    runtime_funcs: AnnotationSet,
    fs_funcs: AnnotationSet,
    structs: AnnotationSet,
    layout_dump: Option<StructLayoutDump>,
    asm: AsmClassifier,
    visited: HashSet<String>,
}

impl Instrumenter {
    /// Load the annotation files and struct layout dump named by `config`
    pub fn new(config: InstrumentConfig) -> Result<Self> {
        let runtime_funcs = AnnotationSet::from_files(&config.runtime_function_lists);
        let fs_funcs = AnnotationSet::from_files(&config.function_lists);
        let structs = AnnotationSet::from_files(&config.struct_lists);
        let layout_dump = config
            .struct_layout
            .as_ref()
            .map(StructLayoutDump::from_path)
            .transpose()?;
        Self::with_sets(config, runtime_funcs, fs_funcs, structs).map(|mut engine| {
            engine.layout_dump = layout_dump;
            engine
        })
    }

    /// Build an engine from in-memory annotation sets
    pub fn with_sets(
        config: InstrumentConfig,
        runtime_funcs: AnnotationSet,
        fs_funcs: AnnotationSet,
        structs: AnnotationSet,
    ) -> Result<Self> {
        tracing::debug!(
            runtime = runtime_funcs.len(),
            functions = fs_funcs.len(),
            structs = structs.len(),
            "annotation sets loaded"
        );
        Ok(Self {
            config,
            runtime_funcs,
            fs_funcs,
            structs,
            layout_dump: None,
            asm: AsmClassifier::new()?,
            visited: HashSet::new(),
        })
    }

    pub fn with_layout_dump(mut self, dump: StructLayoutDump) -> Self {
        self.layout_dump = Some(dump);
        self
    }

    /// Instrument every defined function of `module`
    ///
    /// The module must carry a numbering table. Hook declarations are added
    /// to the module's externals.
    pub fn run(&mut self, module: &mut Module) -> Result<InstrumentStats> {
        let points = ProgramPoints::from_module(module)?;
        let mut layout = DataLayout::for_module(module);
        if let Some(dump) = &self.layout_dump {
            layout.apply_dump(dump);
        }
        for hook in Hook::ALL {
            module.declare_external(hook.symbol(), hook.signature());
        }

        let mut values = ValueAllocator::new(module);
        let mut stats = InstrumentStats::new();

        for func in &mut module.functions {
            if func.is_declaration() || func.is_intrinsic() {
                continue;
            }
            let demangled = names::demangle(&func.name).into_owned();
            if self.runtime_funcs.contains(&demangled) {
                continue;
            }
            let first_visit = self.visited.insert(demangled.clone());

            let mut pass = FunctionPass {
                engine: &*self,
                points: &points,
                layout: &layout,
                values: &mut values,
                stats: &mut stats,
                function: demangled,
                caller: names::normalize(&func.name),
            };
            pass.run(func, first_visit)?;
        }

        tracing::info!(
            module = %module.name,
            instrumented = stats.total(),
            "instrumentation finished"
        );
        Ok(stats)
    }
}

/// State for instrumenting one function
struct FunctionPass<'a> {
    engine: &'a Instrumenter,
    points: &'a ProgramPoints,
    layout: &'a DataLayout,
    values: &'a mut ValueAllocator,
    stats: &'a mut InstrumentStats,
    /// Demangled name, used for entry/exit events
    function: String,
    /// Demangled and suffix-stripped name, used for call events
    caller: String,
}

impl FunctionPass<'_> {
    fn run(&mut self, func: &mut Function, first_visit: bool) -> Result<()> {
        let decls = StructDeclMap::build(func);

        rewrite_blocks(func, |inst| self.visit_instruction(inst))?;
        rewrite_blocks(func, |inst| self.visit_call_site(inst))?;
        if !decls.is_empty() {
            rewrite_blocks(func, |inst| Ok(self.track_struct_value(inst, &decls)))?;
        }
        if first_visit {
            self.instrument_entry_exit(func)?;
        }
        Ok(())
    }

    fn hook(&mut self, hook: Hook, args: Vec<Operand>) -> Instruction {
        debug_assert_eq!(args.len(), hook.arity(), "{hook:?}");
        Instruction::new(self.values.next(), InstKind::Trace(TraceCall { hook, args }))
    }

    /// `trace_acquire_sequence(count)` and the operand holding its result
    fn acquire(&mut self, count: i64) -> (Instruction, Operand) {
        let call = self.hook(Hook::AcquireSequence, vec![Operand::i64(count)]);
        let seq = Operand::value(call.id);
        (call, seq)
    }

    fn old_value(&mut self, seq: &Operand, ptr: &Operand, size: &Operand, shift: i64) -> Instruction {
        self.hook(
            Hook::OldStoreValue,
            vec![seq.clone(), ptr.clone(), size.clone(), Operand::i64(shift)],
        )
    }

    fn id_of(&self, inst: &Instruction) -> Operand {
        Operand::i32(i64::from(self.points.id_of(inst.id).unwrap_or(0)))
    }

    /// `line, col, file, code` for hooks that carry a source location
    fn debug_args(inst: &Instruction) -> [Operand; 4] {
        match &inst.loc {
            Some(loc) => [
                Operand::i32(i64::from(loc.line)),
                Operand::i32(i64::from(loc.col)),
                if loc.file.is_empty() {
                    Operand::Null
                } else {
                    Operand::str(loc.file.as_str())
                },
                match &loc.source {
                    Some(code) => Operand::str(code.chars().take(MAX_SOURCE_SNIPPET).collect::<String>()),
                    None => Operand::Null,
                },
            ],
            None => [Operand::i32(0), Operand::i32(0), Operand::Null, Operand::Null],
        }
    }

    fn file_and_line(inst: &Instruction) -> (Operand, Operand) {
        let [line, _, file, _] = Self::debug_args(inst);
        (file, line)
    }

    fn size_of(&self, ty: &Type) -> Operand {
        Operand::i64(self.layout.store_size(ty) as i64)
    }

    /// Zero-extend an integer operand to 64 bits
    fn widen(&mut self, value: &Operand, from_bits: u32, prelude: &mut Vec<Instruction>) -> Operand {
        if from_bits >= 64 {
            return value.clone();
        }
        match value {
            Operand::Int { value, .. } => Operand::i64(value & ((1i64 << from_bits) - 1)),
            Operand::Value { .. } => {
                let zext = Instruction::new(
                    self.values.next(),
                    InstKind::ZExt {
                        value: value.clone(),
                        from_bits,
                        to_bits: 64,
                    },
                );
                let wide = Operand::value(zext.id);
                prelude.push(zext);
                wide
            }
            other => other.clone(),
        }
    }

    fn require_args(&self, callee: &str, args: &[Arg], expected: usize) -> Result<()> {
        if args.len() < expected {
            return Err(InstrumentError::OperandShape {
                function: self.function.clone(),
                callee: callee.to_string(),
                expected,
                found: args.len(),
            });
        }
        Ok(())
    }

    /// Sequence-reserving write: acquire, pre-image before; `trace` after
    fn sequenced_write(
        &mut self,
        count: i64,
        shift: i64,
        dest: &Operand,
        size: &Operand,
        mut prelude: Vec<Instruction>,
        trace: impl FnOnce(&mut Self, Operand) -> Vec<Instruction>,
    ) -> Splice {
        let (acquire, seq) = self.acquire(count);
        prelude.push(acquire);
        let old = self.old_value(&seq, dest, size, shift);
        prelude.push(old);
        Splice {
            before: prelude,
            after: trace(self, seq),
        }
    }

    fn fenced(&mut self, id: &Operand, call: Instruction) -> Vec<Instruction> {
        let before = self.hook(Hook::ImplicitFence, vec![id.clone()]);
        let after = self.hook(Hook::ImplicitFence, vec![id.clone()]);
        vec![before, call, after]
    }

    // ---- first pass -------------------------------------------------------

    fn visit_instruction(&mut self, inst: &Instruction) -> Result<Splice> {
        let id = self.id_of(inst);
        let splice = match &inst.op {
            InstKind::Load { ptr, ty } => {
                self.stats.bump(Counter::Load);
                let size = self.size_of(ty);
                let [line, col, file, code] = Self::debug_args(inst);
                Splice {
                    before: vec![self.hook(
                        Hook::LoadInst,
                        vec![id, ptr.clone(), size, line, col, file, code],
                    )],
                    after: vec![],
                }
            }
            InstKind::Store { ptr, ty, .. } => {
                self.stats.bump(Counter::Store);
                let size = self.size_of(ty);
                let [line, col, file, code] = Self::debug_args(inst);
                self.sequenced_write(1, 0, ptr, &size, vec![], |pass, seq| {
                    vec![pass.hook(
                        Hook::StoreInst,
                        vec![seq, id, ptr.clone(), size.clone(), line, col, file, code],
                    )]
                })
            }
            InstKind::Fence => {
                self.stats.bump(Counter::Fence);
                let [line, col, file, code] = Self::debug_args(inst);
                Splice {
                    before: vec![self.hook(Hook::FenceInst, vec![id, line, col, file, code])],
                    after: vec![],
                }
            }
            InstKind::CmpXchg { ptr, ty, .. } | InstKind::AtomicRmw { ptr, ty, .. } => {
                let (hook, counter) = if matches!(inst.op, InstKind::CmpXchg { .. }) {
                    (Hook::XchgInst, Counter::Xchg)
                } else {
                    (Hook::RmwInst, Counter::Rmw)
                };
                self.stats.bump(counter);
                let size = self.size_of(ty);
                self.sequenced_write(1, 0, ptr, &size, vec![], |pass, seq| {
                    let call = pass.hook(hook, vec![seq, id.clone(), ptr.clone(), size.clone()]);
                    pass.fenced(&id, call)
                })
            }
            InstKind::MemSet { dest, len, .. } => {
                self.stats.bump(Counter::MemSet);
                self.sequenced_write(1, 0, dest, len, vec![], |pass, seq| {
                    vec![pass.hook(Hook::MemsetInst, vec![seq, id, dest.clone(), len.clone()])]
                })
            }
            InstKind::MemTransfer { dest, src, len, .. } => {
                self.stats.bump(Counter::MemTransfer);
                self.sequenced_write(2, 1, dest, len, vec![], |pass, seq| {
                    vec![pass.hook(
                        Hook::MemtransferInst,
                        vec![seq, id, dest.clone(), src.clone(), len.clone()],
                    )]
                })
            }
            InstKind::Select {
                cond, cond_bits, ..
            } => {
                self.stats.bump(Counter::Select);
                let mut before = Vec::new();
                let flag = self.widen(cond, *cond_bits, &mut before);
                before.push(self.hook(Hook::SelectInst, vec![id, flag]));
                Splice {
                    before,
                    after: vec![],
                }
            }
            InstKind::GetElementPtr {
                base,
                source_ty: Type::Struct { name },
                indices,
            } => self.visit_struct_gep(inst, id, base, name, indices),
            InstKind::Call {
                callee: Callee::InlineAsm { asm, constraints },
                args,
                ..
            } => self.visit_inline_asm(inst, id, asm, constraints, args)?,
            InstKind::Call {
                callee: Callee::Direct { name },
                args,
                ..
            } => self.visit_direct_call(inst, id, name, args)?,
            _ => Splice::default(),
        };
        Ok(splice)
    }

    fn visit_struct_gep(
        &mut self,
        inst: &Instruction,
        id: Operand,
        base: &Operand,
        name: &str,
        indices: &[Operand],
    ) -> Splice {
        let short = source_struct_name(name);
        if !self.engine.structs.contains(short) {
            return Splice::default();
        }
        self.stats.bump(Counter::StructGep);

        let index = match indices {
            [_, Operand::Int { value, .. }] => Operand::i32(*value),
            [_, field] => field.clone(),
            _ => Operand::i32(UNKNOWN_FIELD_INDEX),
        };
        let size = Operand::i64(self.layout.struct_size(name).unwrap_or(0) as i64);
        let [line, col, file, code] = Self::debug_args(inst);
        Splice {
            before: vec![],
            after: vec![self.hook(
                Hook::UnknownStructPtr,
                vec![
                    id,
                    base.clone(),
                    index,
                    size,
                    Operand::str(short),
                    line,
                    col,
                    file,
                    code,
                ],
            )],
        }
    }

    fn visit_inline_asm(
        &mut self,
        inst: &Instruction,
        id: Operand,
        asm_text: &str,
        constraints: &str,
        args: &[Arg],
    ) -> Result<Splice> {
        let idiom = self.engine.asm.classify(asm_text, constraints, args.len());
        let splice = match idiom {
            AsmIdiom::Flush => {
                self.require_args("asm flush", args, 1)?;
                self.stats.bump(Counter::AsmFlush);
                Splice {
                    before: vec![self.hook(Hook::AsmFlush, vec![id, args[0].value.clone()])],
                    after: vec![],
                }
            }
            AsmIdiom::Fence => {
                self.stats.bump(Counter::AsmFence);
                Splice {
                    before: vec![self.hook(Hook::AsmFence, vec![id])],
                    after: vec![],
                }
            }
            AsmIdiom::Exchange => {
                self.require_args("asm xchg", args, 2)?;
                self.stats.bump(Counter::AsmXchg);
                let ptr = args[0].value.clone();
                let size = self.size_of(&args[1].ty);
                self.sequenced_write(1, 0, &ptr, &size, vec![], |pass, seq| {
                    let call = pass.hook(Hook::AsmXchg, vec![seq, id.clone(), ptr.clone(), size.clone()]);
                    pass.fenced(&id, call)
                })
            }
            AsmIdiom::CompareExchange => {
                self.stats.bump(Counter::AsmCas);
                let ptr = args[0].value.clone();
                let size = Operand::i64(16);
                self.sequenced_write(1, 0, &ptr, &size, vec![], |pass, seq| {
                    let call = pass.hook(Hook::AsmCas, vec![seq, id.clone(), ptr.clone(), size.clone()]);
                    pass.fenced(&id, call)
                })
            }
            AsmIdiom::NonTemporalStore => {
                self.require_args("asm movnti", args, 3)?;
                self.stats.bump(Counter::AsmMemsetNt);
                let ptr = args[0].value.clone();
                let size = args[2].value.clone();
                self.sequenced_write(1, 0, &ptr, &size, vec![], |pass, seq| {
                    vec![pass.hook(Hook::AsmMemsetNt, vec![seq, id, ptr.clone(), size.clone()])]
                })
            }
            AsmIdiom::Crc32 { bytes } => match args.first() {
                Some(arg) if arg.ty.is_ptr() => {
                    self.stats.bump(Counter::AsmCrc32);
                    let [line, col, file, code] = Self::debug_args(inst);
                    Splice {
                        before: vec![],
                        after: vec![self.hook(
                            Hook::LoadInst,
                            vec![
                                id,
                                arg.value.clone(),
                                Operand::i64(bytes as i64),
                                line,
                                col,
                                file,
                                code,
                            ],
                        )],
                    }
                }
                _ => Splice::default(),
            },
            AsmIdiom::Unknown => self.visit_unknown_asm(inst, id, asm_text, constraints, args)?,
        };
        Ok(splice)
    }

    fn visit_unknown_asm(
        &mut self,
        inst: &Instruction,
        id: Operand,
        asm_text: &str,
        constraints: &str,
        args: &[Arg],
    ) -> Result<Splice> {
        // Leading helper-function operands mark a uaccess alternative
        let mut helpers = 0;
        for arg in args {
            if let Some(name) = arg.value.as_func() {
                if calls::is_user_copy_helper(&names::normalize(name)) {
                    helpers += 1;
                } else {
                    break;
                }
            }
        }

        if helpers > 0 {
            self.require_args("uaccess asm", args, helpers + 3)?;
            self.stats.bump(Counter::AsmUserCopy);
            return Ok(self.user_copy(
                Hook::UaccessCall,
                id,
                &args[helpers],
                &args[helpers + 1],
                &args[helpers + 2],
            ));
        }

        self.stats.bump(Counter::AsmUnknown);
        let (file, line) = Self::file_and_line(inst);
        Ok(Splice {
            before: vec![self.hook(
                Hook::AsmUnknown,
                vec![
                    id,
                    Operand::str(self.caller.as_str()),
                    file,
                    line,
                    Operand::str(asm::describe_unknown(asm_text, constraints)),
                ],
            )],
            after: vec![],
        })
    }

    /// Copy between user and kernel space: source read at `seq`,
    /// destination write at `seq + 1`
    fn user_copy(&mut self, hook: Hook, id: Operand, to: &Arg, from: &Arg, size: &Arg) -> Splice {
        let mut prelude = Vec::new();
        let size = self.widen(&size.value, int_bits(&size.ty), &mut prelude);
        let to = to.value.clone();
        let from = from.value.clone();
        self.sequenced_write(2, 1, &to, &size, prelude, |pass, seq| {
            vec![pass.hook(hook, vec![seq, id, to.clone(), from.clone(), size.clone()])]
        })
    }

    fn visit_direct_call(
        &mut self,
        inst: &Instruction,
        id: Operand,
        raw_name: &str,
        args: &[Arg],
    ) -> Result<Splice> {
        if inst.is_debug_or_pseudo() {
            return Ok(Splice::default());
        }
        let demangled = names::demangle(raw_name);
        if calls::is_skipped_callee(&demangled) {
            return Ok(Splice::default());
        }
        let callee = names::strip_suffix(&demangled);
        if self.engine.runtime_funcs.contains(callee) {
            return Ok(Splice::default());
        }

        let class = calls::classify_call(callee, &self.engine.config.centralized_flush.helpers);
        let splice = match class {
            CallClass::DaxAccess => {
                self.require_args(callee, args, 4)?;
                self.stats.bump(Counter::DaxAccess);
                Splice {
                    before: vec![],
                    after: vec![self.hook(
                        Hook::DaxAccess,
                        vec![id, args[3].value.clone(), Operand::value(inst.id)],
                    )],
                }
            }
            CallClass::UserCopy | CallClass::UserCopyNonTemporal => {
                self.require_args(callee, args, 3)?;
                self.stats.bump(Counter::UserCopy);
                let hook = if class == CallClass::UserCopyNonTemporal {
                    Hook::UaccessNtCall
                } else {
                    Hook::UaccessCall
                };
                self.user_copy(hook, id, &args[0], &args[1], &args[2])
            }
            CallClass::UserRead | CallClass::Other => Splice::default(),
            CallClass::RawTransfer => {
                self.require_args(callee, args, 3)?;
                self.stats.bump(Counter::RawTransfer);
                let mut prelude = Vec::new();
                let len = self.widen(&args[2].value, int_bits(&args[2].ty), &mut prelude);
                let dest = args[0].value.clone();
                let src = args[1].value.clone();
                self.sequenced_write(2, 1, &dest, &len, prelude, |pass, seq| {
                    vec![pass.hook(
                        Hook::MemtransferInst,
                        vec![seq, id, dest.clone(), src.clone(), len.clone()],
                    )]
                })
            }
            CallClass::RawSet => {
                self.require_args(callee, args, 3)?;
                self.stats.bump(Counter::RawSet);
                let mut prelude = Vec::new();
                let len = self.widen(&args[2].value, int_bits(&args[2].ty), &mut prelude);
                let dest = args[0].value.clone();
                self.sequenced_write(1, 0, &dest, &len, prelude, |pass, seq| {
                    vec![pass.hook(Hook::MemsetInst, vec![seq, id, dest.clone(), len.clone()])]
                })
            }
            CallClass::StringCompare => {
                self.require_args(callee, args, 3)?;
                self.stats.bump(Counter::StringCompare);
                let mut before = Vec::new();
                let len = self.widen(&args[2].value, int_bits(&args[2].ty), &mut before);
                for side in &args[..2] {
                    let [line, col, file, code] = Self::debug_args(inst);
                    before.push(self.hook(
                        Hook::LoadInst,
                        vec![id.clone(), side.value.clone(), len.clone(), line, col, file, code],
                    ));
                }
                Splice {
                    before,
                    after: vec![],
                }
            }
            CallClass::CentralizedFlush => {
                self.require_args(callee, args, 1)?;
                self.stats.bump(Counter::CentralizedFlush);
                let size = match args.get(1) {
                    Some(arg) => arg.value.clone(),
                    None => self
                        .engine
                        .config
                        .centralized_flush
                        .size_by_caller
                        .get(&self.caller)
                        .map(|size| Operand::i32(i64::from(*size)))
                        .ok_or_else(|| InstrumentError::UnresolvedFlushSize {
                            caller: self.caller.clone(),
                            callee: callee.to_string(),
                        })?,
                };
                let (acquire, seq) = self.acquire(1);
                let flush = self.hook(
                    Hook::CentralizedFlush,
                    vec![seq, id, args[0].value.clone(), size],
                );
                Splice {
                    before: vec![acquire, flush],
                    after: vec![],
                }
            }
        };
        Ok(splice)
    }

    // ---- second pass ------------------------------------------------------

    fn visit_call_site(&mut self, inst: &Instruction) -> Result<Splice> {
        let InstKind::Call {
            callee: Callee::Direct { name },
            ..
        } = &inst.op
        else {
            return Ok(Splice::default());
        };
        if inst.is_debug_or_pseudo() {
            return Ok(Splice::default());
        }
        let demangled = names::demangle(name);
        if calls::is_skipped_callee(&demangled) {
            return Ok(Splice::default());
        }
        let callee = names::strip_suffix(&demangled).to_string();
        if self.engine.runtime_funcs.contains(&callee) {
            return Ok(Splice::default());
        }

        let id = self.id_of(inst);
        let (file, line) = Self::file_and_line(inst);
        let bracket_args = vec![
            id.clone(),
            Operand::str(self.caller.as_str()),
            Operand::str(callee.as_str()),
            file,
            line,
        ];

        let mut splice = Splice::default();
        let lock = calls::lock_kind(&callee);
        if lock == Some(LockKind::Acquire) {
            self.stats.bump(Counter::LockFence);
            splice.before.push(self.hook(Hook::ImplicitFence, vec![id.clone()]));
        }
        self.stats.bump(Counter::CallBracket);
        splice
            .before
            .push(self.hook(Hook::StartCall, bracket_args.clone()));
        splice.after.push(self.hook(Hook::EndCall, bracket_args));
        if lock == Some(LockKind::Release) {
            self.stats.bump(Counter::LockFence);
            splice.after.push(self.hook(Hook::ImplicitFence, vec![id]));
        }
        Ok(splice)
    }

    // ---- struct value tracking -------------------------------------------

    fn track_struct_value(&mut self, inst: &Instruction, decls: &StructDeclMap) -> Splice {
        let annotated = |value: Option<ValueId>| {
            value
                .and_then(|v| decls.get(v))
                .filter(|decl| self.engine.structs.contains(&decl.name))
                .cloned()
        };

        let (decl, traced, mut after) = match &inst.op {
            InstKind::Phi { .. } | InstKind::Trace(_) => return Splice::default(),
            InstKind::Store { ptr, value, ty } => {
                let Some(decl) = annotated(ptr.as_value()) else {
                    return Splice::default();
                };
                match value {
                    _ if ty.is_ptr() => (decl, value.clone(), Vec::new()),
                    Operand::Int { .. } => {
                        let cast = Instruction::new(
                            self.values.next(),
                            InstKind::IntToPtr {
                                value: value.clone(),
                            },
                        );
                        (decl, Operand::value(cast.id), vec![cast])
                    }
                    _ => return Splice::default(),
                }
            }
            InstKind::Load { ptr, ty } => {
                let Some(decl) = annotated(ptr.as_value()).or_else(|| annotated(Some(inst.id)))
                else {
                    return Splice::default();
                };
                if !ty.is_ptr() {
                    return Splice::default();
                }
                (decl, Operand::value(inst.id), Vec::new())
            }
            _ => {
                let Some(decl) = annotated(Some(inst.id)) else {
                    return Splice::default();
                };
                if !inst.result_type().is_ptr() {
                    return Splice::default();
                }
                (decl, Operand::value(inst.id), Vec::new())
            }
        };

        self.stats.bump(Counter::StructValue);
        let id = self.id_of(inst);
        after.push(self.hook(
            Hook::DbgVarStore,
            vec![
                id,
                traced,
                Operand::str(decl.name.as_str()),
                Operand::i64(decl.size_bytes() as i64),
            ],
        ));
        Splice {
            before: vec![],
            after,
        }
    }

    // ---- entry / exit -----------------------------------------------------

    fn instrument_entry_exit(&mut self, func: &mut Function) -> Result<()> {
        let Some(entry) = func.blocks.first() else {
            return Ok(());
        };
        let Some(first) = entry.insts.iter().find(|i| !i.is_phi()).map(|i| i.id) else {
            tracing::warn!(function = %self.function, "entry block has no insertion point");
            return Ok(());
        };
        let ret = find_return(func).ok_or_else(|| InstrumentError::MissingReturn {
            function: self.function.clone(),
        })?;
        let ret_value = ret.1;
        let ret = ret.0;

        self.stats.bump(Counter::Function);
        if self.engine.fs_funcs.contains(&self.caller) {
            self.stats.bump(Counter::AnnotatedFunction);
        }

        let block_id = self
            .points
            .block_id(&func.name, &entry.label)
            .unwrap_or(0);
        let func_args = vec![
            Operand::i32(i64::from(block_id)),
            Operand::func(func.name.as_str()),
            Operand::str(self.function.as_str()),
        ];

        let mut prologue = Vec::new();
        let mut epilogue = vec![self.hook(Hook::EndFunc, func_args.clone())];
        if self.function == self.engine.config.module_init_symbol {
            self.stats.bump(Counter::ModuleInit);
            prologue.push(self.hook(Hook::InitAll, vec![]));
            let code = ret_value.unwrap_or_else(|| Operand::i32(0));
            epilogue.push(self.hook(Hook::DestroyAll, vec![code]));
        } else if self.function == self.engine.config.module_exit_symbol {
            self.stats.bump(Counter::ModuleExit);
            epilogue.push(self.hook(Hook::DestroyAll, vec![Operand::i32(1)]));
        }
        prologue.push(self.hook(Hook::StartFunc, func_args));

        insert_before(func, first, prologue);
        insert_before(func, ret, epilogue);
        Ok(())
    }
}

/// Return instruction of `func` and the value it returns
///
/// The last block is checked first, then every block in order.
fn find_return(func: &Function) -> Option<(ValueId, Option<Operand>)> {
    let as_return = |inst: &Instruction| match &inst.op {
        InstKind::Ret { value } => Some((inst.id, value.clone())),
        _ => None,
    };
    func.blocks
        .last()
        .and_then(|b| b.insts.last())
        .and_then(as_return)
        .or_else(|| {
            func.blocks
                .iter()
                .filter_map(|b| b.insts.last())
                .find_map(as_return)
        })
}
