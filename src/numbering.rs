//! Stable program point numbering
//!
//! Every instrumentable instruction gets a positive id, assigned once per
//! module in function, block, instruction order. The ids are what runtime
//! events carry in their `id:` field, so post-processing can map an event
//! back to a source location. The table lives inside the module so later
//! passes (and later runs) see the same ids.
//!
//! Blocks are numbered as well; function entry/exit events use the id of
//! the entry block.

use crate::annotation::AnnotationSet;
use crate::ir::{Callee, InstKind, Instruction, Module, ValueId};
use crate::names;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Program points above this count still get numbered, with a warning
pub const MAX_PROGRAM_POINTS: u32 = 2_000_000;

#[derive(Debug, Error)]
pub enum NumberingError {
    #[error("module `{0}` is already numbered")]
    AlreadyNumbered(String),

    #[error("module `{0}` has no numbering table")]
    NotNumbered(String),

    #[error("program point id 0 is reserved (instruction {0})")]
    ZeroId(ValueId),

    #[error("instruction {0} numbered twice")]
    DuplicateInstruction(ValueId),

    #[error("program point id {0} assigned twice")]
    DuplicateId(u32),

    #[error("cannot write id dump {path}: {source}")]
    Dump {
        path: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointEntry {
    pub inst: ValueId,
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub function: String,
    pub block: String,
    pub id: u32,
}

/// Numbering persisted inside the module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberingTable {
    pub points: Vec<PointEntry>,
    #[serde(default)]
    pub blocks: Vec<BlockEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct NumberingOptions {
    /// Write `id:file:line` for every program point
    pub dump_sources: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumberingReport {
    pub points: u32,
    pub blocks: u32,
}

/// Whether `inst` is a program point
///
/// Calls into the runtime tracing library are never numbered.
pub fn is_program_point(inst: &Instruction, runtime_funcs: &AnnotationSet) -> bool {
    match &inst.op {
        InstKind::Load { .. }
        | InstKind::Store { .. }
        | InstKind::Fence
        | InstKind::CmpXchg { .. }
        | InstKind::AtomicRmw { .. }
        | InstKind::GetElementPtr { .. }
        | InstKind::Select { .. }
        | InstKind::MemSet { .. }
        | InstKind::MemTransfer { .. }
        | InstKind::DbgDeclare { .. }
        | InstKind::DbgValue { .. } => true,
        InstKind::Call { callee, .. } => match callee {
            Callee::Direct { name } => !runtime_funcs.contains(&names::normalize(name)),
            Callee::Indirect { .. } | Callee::InlineAsm { .. } => true,
        },
        _ => false,
    }
}

/// Assign program point and block ids to a module that has none yet
pub fn number_module(
    module: &mut Module,
    runtime_funcs: &AnnotationSet,
    options: &NumberingOptions,
) -> Result<NumberingReport, NumberingError> {
    if module.numbering.is_some() {
        return Err(NumberingError::AlreadyNumbered(module.name.clone()));
    }

    let mut table = NumberingTable::default();
    let mut sources = Vec::new();
    let mut next_point: u32 = 1;
    let mut next_block: u32 = 1;

    for func in &module.functions {
        for block in &func.blocks {
            table.blocks.push(BlockEntry {
                function: func.name.clone(),
                block: block.label.clone(),
                id: next_block,
            });
            next_block += 1;

            for inst in block.insts.iter().filter(|i| is_program_point(i, runtime_funcs)) {
                table.points.push(PointEntry {
                    inst: inst.id,
                    id: next_point,
                });
                if options.dump_sources.is_some() {
                    sources.push(match &inst.loc {
                        Some(loc) => format!("{}:{}:{}", next_point, loc.file, loc.line),
                        None => format!("{next_point}:NA:0"),
                    });
                }
                next_point += 1;
            }
        }
    }

    let report = NumberingReport {
        points: next_point - 1,
        blocks: next_block - 1,
    };
    if report.points > MAX_PROGRAM_POINTS {
        tracing::warn!(
            module = %module.name,
            points = report.points,
            max = MAX_PROGRAM_POINTS,
            "program point count exceeds the supported maximum"
        );
    }

    if let Some(path) = &options.dump_sources {
        write_dump(path, &sources).map_err(|source| NumberingError::Dump {
            path: path.display().to_string(),
            source,
        })?;
    }

    module.numbering = Some(table);
    tracing::info!(
        module = %module.name,
        points = report.points,
        blocks = report.blocks,
        "numbered module"
    );
    Ok(report)
}

fn write_dump(path: &Path, lines: &[String]) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for line in lines {
        writeln!(out, "{line}")?;
    }
    out.flush()
}

/// Drop the numbering table; returns whether one was present
pub fn strip_numbering(module: &mut Module) -> bool {
    module.numbering.take().is_some()
}

/// O(1) lookups over a module's numbering table
#[derive(Debug, Clone, Default)]
pub struct ProgramPoints {
    by_inst: FnvHashMap<ValueId, u32>,
    by_id: FnvHashMap<u32, ValueId>,
    blocks: FnvHashMap<(String, String), u32>,
}

impl ProgramPoints {
    pub fn from_module(module: &Module) -> Result<Self, NumberingError> {
        let table = module
            .numbering
            .as_ref()
            .ok_or_else(|| NumberingError::NotNumbered(module.name.clone()))?;
        Self::from_table(table)
    }

    pub fn from_table(table: &NumberingTable) -> Result<Self, NumberingError> {
        let mut points = Self::default();
        for entry in &table.points {
            if entry.id == 0 {
                return Err(NumberingError::ZeroId(entry.inst));
            }
            if points.by_inst.insert(entry.inst, entry.id).is_some() {
                return Err(NumberingError::DuplicateInstruction(entry.inst));
            }
            if points.by_id.insert(entry.id, entry.inst).is_some() {
                return Err(NumberingError::DuplicateId(entry.id));
            }
        }
        for entry in &table.blocks {
            points
                .blocks
                .insert((entry.function.clone(), entry.block.clone()), entry.id);
        }
        Ok(points)
    }

    pub fn id_of(&self, inst: ValueId) -> Option<u32> {
        self.by_inst.get(&inst).copied()
    }

    pub fn instruction_of(&self, id: u32) -> Option<ValueId> {
        self.by_id.get(&id).copied()
    }

    pub fn block_id(&self, function: &str, block: &str) -> Option<u32> {
        self.blocks
            .get(&(function.to_string(), block.to_string()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
