//! Module simulator
//!
//! Executes an instrumented module against [`SimMemory`] and forwards every
//! hook call to a [`TraceRuntime`], the same calls a kernel build of the
//! module would make through the C ABI. Integers and pointers are both
//! carried as `u64`; loads and stores are little-endian.
//!
//! External functions the module only declares are emulated when the
//! traced code depends on their effect (`memcpy`, user copies,
//! `dax_direct_access`, ...). Anything else returns 0.

use crate::instrument::calls::{classify_call, CallClass};
use crate::instrument::Hook;
use crate::ir::{
    Callee, Function, InstKind, Instruction, Module, Operand, RmwOp, TraceCall, Type, ValueId,
};
use crate::layout::DataLayout;
use crate::names;
use crate::runtime::filter::PAGE_SIZE;
use crate::runtime::memory::SimMemory;
use crate::runtime::record::SourceLocation;
use crate::runtime::{AddressSpace, TraceRuntime};
use fnv::FnvHashMap;
use std::collections::HashMap;
use thiserror::Error;

/// Longest C string read back from simulated memory
const MAX_C_STRING: usize = 4096;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("no function `{0}` in module")]
    UnknownFunction(String),

    #[error("`{function}` called with {found} arguments, expects {expected}")]
    Arity {
        function: String,
        expected: usize,
        found: usize,
    },

    #[error("`{function}`: use of undefined value {value}")]
    UndefinedValue { function: String, value: ValueId },

    #[error("`{function}`: no block `{label}`")]
    UnknownBlock { function: String, label: String },

    #[error("`{function}`: block `{block}` has no terminator")]
    MissingTerminator { function: String, block: String },

    #[error("`{function}`: phi has no incoming value for `{from}`")]
    PhiMismatch { function: String, from: String },

    #[error("`{function}`: reached unreachable")]
    Unreachable { function: String },

    #[error("`{function}`: cannot execute `{opcode}`")]
    Unsupported { function: String, opcode: String },

    #[error("`{function}`: invalid getelementptr into {ty:?}")]
    BadGep { function: String, ty: Type },

    #[error("hook {hook:?} called with {found} arguments, expects {expected}")]
    HookArity {
        hook: Hook,
        expected: usize,
        found: usize,
    },

    #[error("step limit of {0} instructions exceeded")]
    StepLimit(u64),

    #[error("call depth limit of {0} exceeded")]
    CallDepth(usize),
}

pub type Result<T> = std::result::Result<T, SimError>;

/// Limits and address-space layout of a simulation
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    pub max_steps: u64,
    pub max_call_depth: usize,
    /// First stack address handed out by `alloca`
    pub stack_base: u64,
    /// Where the simulated DAX device is mapped
    pub dax_base: u64,
    pub dax_pages: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            max_steps: 10_000_000,
            max_call_depth: 256,
            stack_base: 0xffff_8880_0000_0000,
            dax_base: 0xffff_c900_0000_0000,
            dax_pages: 512,
        }
    }
}

/// Base of interned string constants
const RODATA_BASE: u64 = 0xffff_ffff_8200_0000;
/// Base of the fake function addresses
const TEXT_BASE: u64 = 0xffff_ffff_8100_0000;

fn mask(value: u64, bits: u32) -> u64 {
    if bits >= 64 {
        value
    } else {
        value & ((1u64 << bits) - 1)
    }
}

fn to_le(value: u64, size: usize) -> Vec<u8> {
    let mut bytes = value.to_le_bytes().to_vec();
    bytes.resize(size, 0);
    bytes
}

fn from_le(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(buf)
}

/// Values of one activation
struct Frame<'f> {
    function: &'f Function,
    values: FnvHashMap<ValueId, u64>,
}

impl Frame<'_> {
    fn name(&self) -> String {
        self.function.name.clone()
    }
}

/// Interpreter over a module and a runtime
pub struct Simulator<'a> {
    module: &'a Module,
    runtime: &'a TraceRuntime<SimMemory>,
    layout: DataLayout,
    config: SimConfig,
    stack_top: u64,
    rodata_top: u64,
    strings: HashMap<String, u64>,
    func_addrs: HashMap<String, u64>,
    steps: u64,
    depth: usize,
}

impl<'a> Simulator<'a> {
    pub fn new(module: &'a Module, runtime: &'a TraceRuntime<SimMemory>, config: SimConfig) -> Self {
        let func_addrs = module
            .functions
            .iter()
            .map(|f| f.name.clone())
            .chain(module.externals.keys().cloned())
            .enumerate()
            .map(|(idx, name)| (name, TEXT_BASE + idx as u64 * 16))
            .collect();
        Self {
            module,
            runtime,
            layout: DataLayout::for_module(module),
            config,
            stack_top: config.stack_base,
            rodata_top: RODATA_BASE,
            strings: HashMap::new(),
            func_addrs,
            steps: 0,
            depth: 0,
        }
    }

    pub fn with_layout(mut self, layout: DataLayout) -> Self {
        self.layout = layout;
        self
    }

    fn memory(&self) -> &SimMemory {
        self.runtime.memory()
    }

    /// Instructions executed so far
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Reserve `size` bytes of zeroed stack, 16-byte aligned
    pub fn alloc(&mut self, size: u64) -> u64 {
        let addr = self.stack_top;
        self.stack_top += size.max(1).div_ceil(16) * 16;
        addr
    }

    fn intern(&mut self, text: &str) -> u64 {
        if let Some(addr) = self.strings.get(text) {
            return *addr;
        }
        let addr = self.rodata_top;
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        self.memory().write(addr, &bytes);
        self.rodata_top += (bytes.len() as u64).div_ceil(8) * 8;
        self.strings.insert(text.to_string(), addr);
        addr
    }

    fn read_c_string(&self, addr: u64) -> Option<String> {
        if addr == 0 {
            return None;
        }
        let mut bytes = Vec::new();
        for offset in 0..MAX_C_STRING as u64 {
            let byte = self.memory().read(addr + offset, 1)?.first().copied()?;
            if byte == 0 {
                break;
            }
            bytes.push(byte);
        }
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn function_at(&self, addr: u64) -> Option<&str> {
        self.func_addrs
            .iter()
            .find(|(_, a)| **a == addr)
            .map(|(name, _)| name.as_str())
    }

    /// Run `name` with `args` and return its result (0 for `void`)
    ///
    /// `name` must be defined or declared by the module.
    pub fn call(&mut self, name: &str, args: &[u64]) -> Result<u64> {
        if self.module.function(name).is_none() && !self.module.externals.contains_key(name) {
            return Err(SimError::UnknownFunction(name.to_string()));
        }
        self.invoke(name, args)
    }

    fn invoke(&mut self, name: &str, args: &[u64]) -> Result<u64> {
        let Some(function) = self.module.function(name).filter(|f| !f.is_declaration()) else {
            return self.call_external(name, args);
        };
        if function.params.len() != args.len() {
            return Err(SimError::Arity {
                function: name.to_string(),
                expected: function.params.len(),
                found: args.len(),
            });
        }
        if self.depth >= self.config.max_call_depth {
            return Err(SimError::CallDepth(self.config.max_call_depth));
        }

        let values = function
            .params
            .iter()
            .zip(args)
            .map(|(p, v)| (p.id, *v))
            .collect();
        let mut frame = Frame { function, values };

        self.depth += 1;
        let saved_stack = self.stack_top;
        let result = self.execute(&mut frame);
        self.stack_top = saved_stack;
        self.depth -= 1;
        result
    }

    fn execute(&mut self, frame: &mut Frame<'a>) -> Result<u64> {
        let function = frame.function;
        let mut block_idx = 0;
        let mut previous: Option<&str> = None;

        loop {
            let Some(block) = function.blocks.get(block_idx) else {
                return Err(SimError::UnknownBlock {
                    function: frame.name(),
                    label: format!("#{block_idx}"),
                });
            };

            // phis read their inputs before any of them is assigned
            let mut incoming = Vec::new();
            for inst in block.insts.iter().take_while(|i| i.is_phi()) {
                let InstKind::Phi { incoming: edges } = &inst.op else {
                    continue;
                };
                let from = previous.unwrap_or("");
                let edge = edges.iter().find(|e| e.block == from).ok_or_else(|| {
                    SimError::PhiMismatch {
                        function: frame.name(),
                        from: from.to_string(),
                    }
                })?;
                incoming.push((inst.id, self.operand(frame, &edge.value)?));
            }
            frame.values.extend(incoming);

            let mut next = None;
            for inst in block.insts.iter().skip_while(|i| i.is_phi()) {
                self.tick()?;
                match self.step(frame, inst)? {
                    Flow::Next => {}
                    Flow::Jump(label) => {
                        next = Some(label);
                        break;
                    }
                    Flow::Return(value) => return Ok(value),
                }
            }

            let Some(label) = next else {
                return Err(SimError::MissingTerminator {
                    function: frame.name(),
                    block: block.label.clone(),
                });
            };
            block_idx = function
                .block_index(label)
                .ok_or_else(|| SimError::UnknownBlock {
                    function: frame.name(),
                    label: label.to_string(),
                })?;
            previous = Some(block.label.as_str());
        }
    }

    fn tick(&mut self) -> Result<()> {
        self.steps += 1;
        if self.steps > self.config.max_steps {
            return Err(SimError::StepLimit(self.config.max_steps));
        }
        Ok(())
    }

    fn operand(&mut self, frame: &Frame<'_>, op: &Operand) -> Result<u64> {
        Ok(match op {
            Operand::Value { id } => {
                *frame
                    .values
                    .get(id)
                    .ok_or_else(|| SimError::UndefinedValue {
                        function: frame.name(),
                        value: *id,
                    })?
            }
            Operand::Int { value, bits } => mask(*value as u64, *bits),
            Operand::Null => 0,
            Operand::Str { value } => self.intern(value),
            Operand::Func { name } => self.func_addrs.get(name).copied().unwrap_or(0),
        })
    }

    fn string_operand(&mut self, frame: &Frame<'_>, op: &Operand) -> Result<Option<String>> {
        match op {
            Operand::Str { value } => Ok(Some(value.clone())),
            Operand::Null => Ok(None),
            other => {
                let addr = self.operand(frame, other)?;
                Ok(self.read_c_string(addr))
            }
        }
    }

    fn load(&self, addr: u64, size: u64) -> u64 {
        self.memory()
            .read(addr, size.min(8) as usize)
            .map_or(0, |bytes| from_le(&bytes))
    }

    fn store(&self, addr: u64, value: u64, size: u64) {
        self.memory().write(addr, &to_le(value, size as usize));
    }

    fn copy(&self, dest: u64, src: u64, len: u64) {
        if let Some(bytes) = self.memory().read(src, len as usize) {
            self.memory().write(dest, &bytes);
        }
    }

    fn step(&mut self, frame: &mut Frame<'a>, inst: &'a Instruction) -> Result<Flow<'a>> {
        let result = match &inst.op {
            InstKind::Phi { .. } => return Ok(Flow::Next),
            InstKind::Alloca { ty } => {
                let size = self.layout.alloc_size(ty);
                let addr = self.alloc(size);
                self.memory().fill(addr, 0, size as usize);
                Some(addr)
            }
            InstKind::Load { ptr, ty } => {
                let addr = self.operand(frame, ptr)?;
                Some(self.load(addr, self.layout.store_size(ty)))
            }
            InstKind::Store { ptr, value, ty } => {
                let addr = self.operand(frame, ptr)?;
                let value = self.operand(frame, value)?;
                self.store(addr, value, self.layout.store_size(ty));
                None
            }
            InstKind::Fence | InstKind::DbgDeclare { .. } | InstKind::DbgValue { .. } => None,
            InstKind::CmpXchg {
                ptr,
                expected,
                new,
                ty,
            } => {
                let addr = self.operand(frame, ptr)?;
                let size = self.layout.store_size(ty);
                let expected = self.operand(frame, expected)?;
                let new = self.operand(frame, new)?;
                let old = self.load(addr, size);
                if old == expected {
                    self.store(addr, new, size);
                }
                Some(old)
            }
            InstKind::AtomicRmw { op, ptr, value, ty } => {
                let addr = self.operand(frame, ptr)?;
                let size = self.layout.store_size(ty);
                let value = self.operand(frame, value)?;
                let old = self.load(addr, size);
                let new = match op {
                    RmwOp::Xchg => value,
                    RmwOp::Add => old.wrapping_add(value),
                    RmwOp::Sub => old.wrapping_sub(value),
                    RmwOp::And => old & value,
                    RmwOp::Or => old | value,
                    RmwOp::Xor => old ^ value,
                };
                self.store(addr, new, size);
                Some(old)
            }
            InstKind::MemSet {
                dest, value, len, ..
            } => {
                let dest = self.operand(frame, dest)?;
                let value = self.operand(frame, value)?;
                let len = self.operand(frame, len)?;
                self.memory().fill(dest, value as u8, len as usize);
                None
            }
            InstKind::MemTransfer { dest, src, len, .. } => {
                let dest = self.operand(frame, dest)?;
                let src = self.operand(frame, src)?;
                let len = self.operand(frame, len)?;
                self.copy(dest, src, len);
                None
            }
            InstKind::Select {
                cond,
                then_value,
                else_value,
                ..
            } => {
                let chosen = if self.operand(frame, cond)? & 1 == 1 {
                    then_value
                } else {
                    else_value
                };
                Some(self.operand(frame, chosen)?)
            }
            InstKind::GetElementPtr {
                base,
                source_ty,
                indices,
            } => Some(self.gep(frame, base, source_ty, indices)?),
            InstKind::Call { callee, args, .. } => {
                let values = args
                    .iter()
                    .map(|arg| self.operand(frame, &arg.value))
                    .collect::<Result<Vec<_>>>()?;
                match callee {
                    Callee::Direct { name } => Some(self.invoke(name, &values)?),
                    Callee::Indirect { target } => {
                        let addr = self.operand(frame, target)?;
                        let name = self
                            .function_at(addr)
                            .map(str::to_string)
                            .ok_or_else(|| SimError::UnknownFunction(format!("{addr:#x}")))?;
                        Some(self.invoke(&name, &values)?)
                    }
                    // asm bodies are opaque; their effect is what the hooks report
                    Callee::InlineAsm { .. } => Some(0),
                }
            }
            InstKind::ZExt {
                value, from_bits, ..
            } => Some(mask(self.operand(frame, value)?, *from_bits)),
            InstKind::IntToPtr { value } => Some(self.operand(frame, value)?),
            InstKind::Br { dest } => return Ok(Flow::Jump(dest)),
            InstKind::CondBr {
                cond,
                then_dest,
                else_dest,
            } => {
                let taken = if self.operand(frame, cond)? & 1 == 1 {
                    then_dest
                } else {
                    else_dest
                };
                return Ok(Flow::Jump(taken));
            }
            InstKind::Ret { value } => {
                let value = match value {
                    Some(op) => self.operand(frame, op)?,
                    None => 0,
                };
                return Ok(Flow::Return(value));
            }
            InstKind::Unreachable => {
                return Err(SimError::Unreachable {
                    function: frame.name(),
                })
            }
            InstKind::Other { opcode } => {
                return Err(SimError::Unsupported {
                    function: frame.name(),
                    opcode: opcode.clone(),
                })
            }
            InstKind::Trace(call) => self.dispatch(frame, call)?,
        };
        if let Some(value) = result {
            frame.values.insert(inst.id, value);
        }
        Ok(Flow::Next)
    }

    fn gep(
        &mut self,
        frame: &Frame<'_>,
        base: &Operand,
        source_ty: &Type,
        indices: &[Operand],
    ) -> Result<u64> {
        let mut addr = self.operand(frame, base)?;
        let Some((first, rest)) = indices.split_first() else {
            return Ok(addr);
        };
        let first = self.operand(frame, first)? as i64;
        addr = addr.wrapping_add((first.wrapping_mul(self.layout.alloc_size(source_ty) as i64)) as u64);

        let mut ty = source_ty.clone();
        for index in rest {
            let idx = self.operand(frame, index)?;
            let bad = || SimError::BadGep {
                function: frame.name(),
                ty: ty.clone(),
            };
            let next = match &ty {
                Type::Struct { name } => {
                    let field = self
                        .module
                        .struct_type(name)
                        .and_then(|s| s.fields.get(idx as usize))
                        .cloned()
                        .ok_or_else(bad)?;
                    let offset = self
                        .layout
                        .field_offset(name, idx as usize)
                        .ok_or_else(bad)?;
                    addr = addr.wrapping_add(offset);
                    field
                }
                Type::Array { elem, .. } => {
                    let step = self.layout.alloc_size(elem) as i64;
                    addr = addr.wrapping_add((idx as i64).wrapping_mul(step) as u64);
                    (**elem).clone()
                }
                _ => return Err(bad()),
            };
            ty = next;
        }
        Ok(addr)
    }

    /// Emulate a function the module only declares
    fn call_external(&mut self, name: &str, args: &[u64]) -> Result<u64> {
        let normalized = names::normalize(name);
        let arg = |i: usize| args.get(i).copied().unwrap_or(0);
        let class = classify_call(&normalized, &[]);
        let result = match class {
            CallClass::RawTransfer if normalized == "strncpy" => {
                let (dest, src, n) = (arg(0), arg(1), arg(2));
                let text = self.read_c_string(src).unwrap_or_default();
                let mut bytes = text.into_bytes();
                bytes.resize(n as usize, 0);
                self.memory().write(dest, &bytes);
                dest
            }
            CallClass::RawTransfer => {
                self.copy(arg(0), arg(1), arg(2));
                arg(0)
            }
            CallClass::RawSet => {
                self.memory().fill(arg(0), arg(1) as u8, arg(2) as usize);
                arg(0)
            }
            _ if class.is_user_copy() => {
                self.copy(arg(0), arg(1), arg(2));
                0
            }
            CallClass::DaxAccess => self.dax_direct_access(arg(1), arg(2), arg(3)),
            _ if normalized.starts_with("llvm.memcpy") || normalized.starts_with("llvm.memmove") => {
                self.copy(arg(0), arg(1), arg(2));
                0
            }
            _ => {
                tracing::debug!(callee = name, "external call returns 0");
                0
            }
        };
        Ok(result)
    }

    /// Map `nr_pages` device pages starting at `pgoff`, writing the kernel
    /// address into `*kaddr`
    fn dax_direct_access(&self, pgoff: u64, nr_pages: u64, kaddr: u64) -> u64 {
        if pgoff >= self.config.dax_pages {
            return 0;
        }
        let base = self.config.dax_base + pgoff * PAGE_SIZE;
        if kaddr != 0 {
            self.store(kaddr, base, 8);
        }
        nr_pages.min(self.config.dax_pages - pgoff)
    }

    /// Forward a hook call to the runtime
    fn dispatch(&mut self, frame: &Frame<'_>, call: &TraceCall) -> Result<Option<u64>> {
        let hook = call.hook;
        if call.args.len() != hook.arity() {
            return Err(SimError::HookArity {
                hook,
                expected: hook.arity(),
                found: call.args.len(),
            });
        }
        let a = &call.args;
        let mut v = Vec::with_capacity(a.len());
        for op in a {
            v.push(self.operand(frame, op)?);
        }
        let rt = self.runtime;
        let id = |i: usize| v[i] as u32;

        match hook {
            Hook::AcquireSequence => return Ok(Some(rt.acquire_sequence(v[0]))),
            Hook::OldStoreValue => rt.old_store_value(v[0], v[1], v[2], v[3]),
            Hook::InitAll => rt.init_all(),
            Hook::DestroyAll => rt.destroy_all(v[0] as i32),
            Hook::StartFunc | Hook::EndFunc => {
                let name = self.string_operand(frame, &a[2])?.unwrap_or_default();
                if hook == Hook::StartFunc {
                    rt.start_func(id(0), v[1], &name);
                } else {
                    rt.end_func(id(0), v[1], &name);
                }
            }
            Hook::UnknownStructPtr => {
                let type_name = self.string_operand(frame, &a[4])?.unwrap_or_default();
                let loc = self.location(frame, &v[5..7], &a[7..9])?;
                rt.struct_ptr(id(0), v[1], v[2] as u32, v[3], &type_name, loc);
            }
            Hook::DbgVarStore => {
                let type_name = self.string_operand(frame, &a[2])?.unwrap_or_default();
                rt.dbg_var_store(id(0), v[1], &type_name, v[3]);
            }
            Hook::LoadInst => {
                let loc = self.location(frame, &v[3..5], &a[5..7])?;
                rt.load(id(0), v[1], v[2], loc);
            }
            Hook::StoreInst => {
                let loc = self.location(frame, &v[4..6], &a[6..8])?;
                rt.store(v[0], id(1), v[2], v[3], loc);
            }
            Hook::FenceInst => {
                let loc = self.location(frame, &v[1..3], &a[3..5])?;
                rt.fence(id(0), loc);
            }
            Hook::XchgInst => rt.xchg(v[0], id(1), v[2], v[3]),
            Hook::RmwInst => rt.rmw(v[0], id(1), v[2], v[3]),
            Hook::MemsetInst => rt.memset(v[0], id(1), v[2], v[3]),
            Hook::MemtransferInst => rt.memtransfer(v[0], id(1), v[2], v[3], v[4]),
            Hook::SelectInst => rt.select(id(0), v[1]),
            Hook::AsmFlush => rt.asm_flush(id(0), v[1]),
            Hook::AsmFence => rt.asm_fence(id(0)),
            Hook::ImplicitFence => rt.implicit_fence(id(0)),
            Hook::AsmXchg => rt.asm_xchg(v[0], id(1), v[2], v[3]),
            Hook::AsmCas => rt.asm_cas(v[0], id(1), v[2], v[3]),
            Hook::AsmMemsetNt => rt.asm_memset_nt(v[0], id(1), v[2], v[3]),
            Hook::AsmUnknown => {
                let caller = self.string_operand(frame, &a[1])?.unwrap_or_default();
                let file = self.string_operand(frame, &a[2])?;
                let asm = self.string_operand(frame, &a[4])?.unwrap_or_default();
                rt.asm_unknown(id(0), &caller, file.as_deref(), v[3] as u32, &asm);
            }
            Hook::StartCall | Hook::EndCall => {
                let caller = self.string_operand(frame, &a[1])?.unwrap_or_default();
                let callee = self.string_operand(frame, &a[2])?.unwrap_or_default();
                let file = self.string_operand(frame, &a[3])?;
                if hook == Hook::StartCall {
                    rt.start_call(id(0), &caller, &callee, file.as_deref(), v[4] as u32);
                } else {
                    rt.end_call(id(0), &caller, &callee, file.as_deref(), v[4] as u32);
                }
            }
            Hook::UaccessCall => rt.uaccess(v[0], id(1), v[2], v[3], v[4]),
            Hook::UaccessNtCall => rt.uaccess_nt(v[0], id(1), v[2], v[3], v[4]),
            Hook::DaxAccess => {
                let pages = v[2] as i64;
                if v[1] != 0 && pages > 0 {
                    let base = self.load(v[1], 8);
                    rt.dax_access(id(0), base, pages as u64);
                }
            }
            Hook::CentralizedFlush => rt.centralized_flush(v[0], id(1), v[2], v[3] as u32),
        }
        Ok(None)
    }

    /// `line, col` values and `file, code` operands of a located hook
    fn location(
        &mut self,
        frame: &Frame<'_>,
        line_col: &[u64],
        file_code: &[Operand],
    ) -> Result<SourceLocation> {
        Ok(SourceLocation {
            file: self.string_operand(frame, &file_code[0])?,
            line: line_col[0] as u32,
            col: line_col[1] as u32,
            code: self.string_operand(frame, &file_code[1])?,
        })
    }
}

enum Flow<'a> {
    Next,
    Jump(&'a str),
    Return(u64),
}
