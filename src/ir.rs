//! Front-end IR model
//!
//! The instrumentation engine never touches a concrete compiler IR. A front
//! end lowers each translation unit into this closed instruction model and
//! hands it over as JSON; the engine rewrites it and hands it back. Every
//! instruction that produces or names a value carries a module-unique
//! [`ValueId`], which is what the numbering table and the debug-type
//! declaration map key on.

use crate::instrument::hooks::Hook;
use crate::numbering::NumberingTable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IrError {
    #[error("cannot read module {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed module JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Module-unique SSA value identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Type {
    #[default]
    Void,
    Int {
        bits: u32,
    },
    Float {
        bits: u32,
    },
    Ptr,
    Array {
        elem: Box<Type>,
        len: u64,
    },
    Struct {
        name: String,
    },
}

impl Type {
    pub fn int(bits: u32) -> Self {
        Type::Int { bits }
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self, Type::Ptr)
    }

    pub fn struct_name(&self) -> Option<&str> {
        match self {
            Type::Struct { name } => Some(name),
            _ => None,
        }
    }
}

/// Instruction operand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operand {
    Value { id: ValueId },
    Int { value: i64, bits: u32 },
    Null,
    /// Pointer to a global NUL-terminated string
    Str { value: String },
    /// Address of a function
    Func { name: String },
}

impl Operand {
    pub fn value(id: ValueId) -> Self {
        Operand::Value { id }
    }

    pub fn i32(value: i64) -> Self {
        Operand::Int { value, bits: 32 }
    }

    pub fn i64(value: i64) -> Self {
        Operand::Int { value, bits: 64 }
    }

    pub fn str(value: impl Into<String>) -> Self {
        Operand::Str {
            value: value.into(),
        }
    }

    pub fn func(name: impl Into<String>) -> Self {
        Operand::Func { name: name.into() }
    }

    pub fn as_value(&self) -> Option<ValueId> {
        match self {
            Operand::Value { id } => Some(*id),
            _ => None,
        }
    }

    pub fn as_func(&self) -> Option<&str> {
        match self {
            Operand::Func { name } => Some(name),
            _ => None,
        }
    }
}

/// Source position attached to an instruction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugLoc {
    pub line: u32,
    pub col: u32,
    pub file: String,
    /// Source text of the line, when the front end recorded it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiTag {
    StructureType,
    UnionType,
    ClassType,
    EnumerationType,
    ArrayType,
    PointerType,
    Typedef,
    Member,
    ConstType,
    VolatileType,
    BaseType,
    SubroutineType,
}

impl DiTag {
    pub fn is_composite(self) -> bool {
        matches!(
            self,
            DiTag::StructureType
                | DiTag::UnionType
                | DiTag::ClassType
                | DiTag::EnumerationType
                | DiTag::ArrayType
        )
    }

    pub fn is_derived(self) -> bool {
        matches!(
            self,
            DiTag::PointerType
                | DiTag::Typedef
                | DiTag::Member
                | DiTag::ConstType
                | DiTag::VolatileType
        )
    }
}

/// Debug-info type of a source variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiType {
    pub tag: DiTag,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size_bits: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<Box<DiType>>,
}

impl DiType {
    pub fn structure(name: impl Into<String>, size_bits: u64) -> Self {
        Self {
            tag: DiTag::StructureType,
            name: name.into(),
            size_bits,
            base: None,
        }
    }

    pub fn derived(tag: DiTag, base: DiType) -> Self {
        Self {
            tag,
            name: String::new(),
            size_bits: 64,
            base: Some(Box::new(base)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntrinsicFlavor {
    #[default]
    Plain,
    ElementAtomic,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RmwOp {
    Xchg,
    Add,
    Sub,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Callee {
    Direct { name: String },
    Indirect { target: Operand },
    InlineAsm { asm: String, constraints: String },
}

/// Typed call argument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arg {
    pub value: Operand,
    #[serde(default)]
    pub ty: Type,
}

impl Arg {
    pub fn new(value: Operand, ty: Type) -> Self {
        Self { value, ty }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhiIncoming {
    pub block: String,
    pub value: Operand,
}

/// Call to one of the runtime tracing entry points
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceCall {
    pub hook: Hook,
    pub args: Vec<Operand>,
}

fn default_cond_bits() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstKind {
    Phi {
        incoming: Vec<PhiIncoming>,
    },
    Alloca {
        ty: Type,
    },
    Load {
        ptr: Operand,
        ty: Type,
    },
    Store {
        ptr: Operand,
        value: Operand,
        ty: Type,
    },
    Fence,
    CmpXchg {
        ptr: Operand,
        expected: Operand,
        new: Operand,
        ty: Type,
    },
    AtomicRmw {
        op: RmwOp,
        ptr: Operand,
        value: Operand,
        ty: Type,
    },
    MemSet {
        dest: Operand,
        value: Operand,
        len: Operand,
        #[serde(default)]
        flavor: IntrinsicFlavor,
    },
    MemTransfer {
        dest: Operand,
        src: Operand,
        len: Operand,
        #[serde(default)]
        flavor: IntrinsicFlavor,
    },
    Select {
        cond: Operand,
        #[serde(default = "default_cond_bits")]
        cond_bits: u32,
        then_value: Operand,
        else_value: Operand,
    },
    GetElementPtr {
        base: Operand,
        source_ty: Type,
        indices: Vec<Operand>,
    },
    Call {
        callee: Callee,
        #[serde(default)]
        args: Vec<Arg>,
        #[serde(default)]
        ret: Type,
    },
    DbgDeclare {
        address: Operand,
        var: DiType,
    },
    DbgValue {
        value: Operand,
        var: DiType,
    },
    ZExt {
        value: Operand,
        from_bits: u32,
        to_bits: u32,
    },
    IntToPtr {
        value: Operand,
    },
    Br {
        dest: String,
    },
    CondBr {
        cond: Operand,
        then_dest: String,
        else_dest: String,
    },
    Ret {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Operand>,
    },
    Unreachable,
    Other {
        opcode: String,
    },
    Trace(TraceCall),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: ValueId,
    pub op: InstKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loc: Option<DebugLoc>,
}

impl Instruction {
    pub fn new(id: ValueId, op: InstKind) -> Self {
        Self { id, op, loc: None }
    }

    pub fn with_loc(mut self, loc: DebugLoc) -> Self {
        self.loc = Some(loc);
        self
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.op, InstKind::Phi { .. })
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self.op,
            InstKind::Br { .. } | InstKind::CondBr { .. } | InstKind::Ret { .. } | InstKind::Unreachable
        )
    }

    pub fn is_return(&self) -> bool {
        matches!(self.op, InstKind::Ret { .. })
    }

    pub fn is_trace(&self) -> bool {
        matches!(self.op, InstKind::Trace(_))
    }

    /// Debug intrinsics never produce machine code
    pub fn is_debug_or_pseudo(&self) -> bool {
        match &self.op {
            InstKind::DbgDeclare { .. } | InstKind::DbgValue { .. } => true,
            InstKind::Call {
                callee: Callee::Direct { name },
                ..
            } => name.starts_with("llvm.dbg.") || name.starts_with("llvm.pseudoprobe"),
            _ => false,
        }
    }

    /// Type of the value this instruction defines, if any
    pub fn result_type(&self) -> Type {
        match &self.op {
            InstKind::Alloca { .. }
            | InstKind::GetElementPtr { .. }
            | InstKind::IntToPtr { .. } => Type::Ptr,
            InstKind::Load { ty, .. } | InstKind::CmpXchg { ty, .. } | InstKind::AtomicRmw { ty, .. } => {
                ty.clone()
            }
            InstKind::ZExt { to_bits, .. } => Type::int(*to_bits),
            InstKind::Call { ret, .. } => ret.clone(),
            InstKind::Trace(call) => call.hook.signature().ret,
            _ => Type::Void,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub label: String,
    #[serde(default)]
    pub insts: Vec<Instruction>,
}

impl BasicBlock {
    pub fn new(label: impl Into<String>, insts: Vec<Instruction>) -> Self {
        Self {
            label: label.into(),
            insts,
        }
    }

    pub fn terminator(&self) -> Option<&Instruction> {
        self.insts.last().filter(|inst| inst.is_terminator())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub id: ValueId,
    pub ty: Type,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default)]
    pub ret: Type,
    /// Empty for external declarations
    #[serde(default)]
    pub blocks: Vec<BasicBlock>,
}

impl Function {
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn is_intrinsic(&self) -> bool {
        self.name.starts_with("llvm.")
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.blocks.iter().flat_map(|block| block.insts.iter())
    }

    pub fn block_index(&self, label: &str) -> Option<usize> {
        self.blocks.iter().position(|block| block.label == label)
    }
}

/// Aggregate type definition, named the way the front end names it
/// (`struct.nova_inode`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<Type>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub params: Vec<Type>,
    #[serde(default)]
    pub ret: Type,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default)]
    pub structs: Vec<StructType>,
    #[serde(default)]
    pub functions: Vec<Function>,
    /// External symbols the module calls but does not define
    #[serde(default)]
    pub externals: BTreeMap<String, Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numbering: Option<NumberingTable>,
}

impl Module {
    pub fn from_json_str(json: &str) -> Result<Self, IrError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, IrError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| IrError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String, IrError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn struct_type(&self, name: &str) -> Option<&StructType> {
        self.structs.iter().find(|s| s.name == name)
    }

    pub fn declare_external(&mut self, name: impl Into<String>, signature: Signature) {
        self.externals.entry(name.into()).or_insert(signature);
    }

    /// Largest value id used by a parameter or instruction
    pub fn max_value_id(&self) -> u32 {
        self.functions
            .iter()
            .flat_map(|f| {
                f.params
                    .iter()
                    .map(|p| p.id.0)
                    .chain(f.instructions().map(|i| i.id.0))
            })
            .max()
            .unwrap_or(0)
    }
}
