//! Target type sizes and the struct layout dump
//!
//! The engine needs store sizes for every traced access and allocation sizes
//! for annotated structs. Sizes follow the x86-64 natural-alignment rules;
//! when the source analyzer produced a struct layout dump, its sizes and
//! member offsets win over the computed ones.
//!
//! Dump format, one record per line:
//!
//! ```text
//! nova_inode,1024,128
//! __le16,i_rsvd,16,2,0,0,0,0
//! u8,valid,8,1,16,2,0,0
//! ```
//!
//! A three-field line opens a struct (`name,total_bits,total_bytes`); each
//! eight-field line that follows is a member
//! (`type,name,size_bits,size_bytes,offset_bits,offset_bytes,is_pointer,is_array`).

use crate::ir::{Module, StructType, Type};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const POINTER_BYTES: u64 = 8;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("cannot read struct layout dump {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("struct layout dump line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberLayout {
    pub type_name: String,
    pub name: String,
    pub size_bits: u64,
    pub size_bytes: u64,
    pub offset_bits: u64,
    pub offset_bytes: u64,
    pub is_pointer: bool,
    pub is_array: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub name: String,
    pub size_bits: u64,
    pub size_bytes: u64,
    pub members: Vec<MemberLayout>,
}

/// Parsed struct layout dump, keyed by source-level struct name
#[derive(Debug, Clone, Default)]
pub struct StructLayoutDump {
    layouts: BTreeMap<String, StructLayout>,
}

fn parse_u64(field: &str, line: usize, what: &str) -> Result<u64, LayoutError> {
    field.trim().parse().map_err(|_| LayoutError::Malformed {
        line,
        reason: format!("invalid {what} `{field}`"),
    })
}

fn parse_flag(field: &str, line: usize) -> Result<bool, LayoutError> {
    match field.trim() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(LayoutError::Malformed {
            line,
            reason: format!("invalid flag `{other}`"),
        }),
    }
}

impl StructLayoutDump {
    pub fn parse(text: &str) -> Result<Self, LayoutError> {
        let mut layouts = BTreeMap::new();
        let mut current: Option<StructLayout> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let fields: Vec<&str> = raw.split(',').collect();
            match fields.len() {
                3 => {
                    if let Some(done) = current.take() {
                        layouts.insert(done.name.clone(), done);
                    }
                    current = Some(StructLayout {
                        name: fields[0].trim().to_string(),
                        size_bits: parse_u64(fields[1], line, "struct size")?,
                        size_bytes: parse_u64(fields[2], line, "struct size")?,
                        members: Vec::new(),
                    });
                }
                8 => {
                    let owner = current.as_mut().ok_or_else(|| LayoutError::Malformed {
                        line,
                        reason: "member line before any struct header".to_string(),
                    })?;
                    owner.members.push(MemberLayout {
                        type_name: fields[0].trim().to_string(),
                        name: fields[1].trim().to_string(),
                        size_bits: parse_u64(fields[2], line, "member size")?,
                        size_bytes: parse_u64(fields[3], line, "member size")?,
                        offset_bits: parse_u64(fields[4], line, "member offset")?,
                        offset_bytes: parse_u64(fields[5], line, "member offset")?,
                        is_pointer: parse_flag(fields[6], line)?,
                        is_array: parse_flag(fields[7], line)?,
                    });
                }
                n => {
                    return Err(LayoutError::Malformed {
                        line,
                        reason: format!("expected 3 or 8 fields, found {n}"),
                    })
                }
            }
        }
        if let Some(done) = current {
            layouts.insert(done.name.clone(), done);
        }

        Ok(Self { layouts })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LayoutError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| LayoutError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn get(&self, name: &str) -> Option<&StructLayout> {
        self.layouts.get(name)
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
struct StructInfo {
    size: u64,
    align: u64,
    offsets: Vec<u64>,
}

/// Size and alignment oracle for the module's types
#[derive(Debug, Clone, Default)]
pub struct DataLayout {
    structs: HashMap<String, StructInfo>,
}

/// Strip the front end's `struct.` / `union.` prefix
pub fn source_struct_name(ir_name: &str) -> &str {
    ir_name
        .strip_prefix("struct.")
        .or_else(|| ir_name.strip_prefix("union."))
        .unwrap_or(ir_name)
}

fn align_to(value: u64, align: u64) -> u64 {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

impl DataLayout {
    pub fn for_module(module: &Module) -> Self {
        let defs: HashMap<&str, &StructType> =
            module.structs.iter().map(|s| (s.name.as_str(), s)).collect();
        let mut layout = Self::default();
        let mut visiting = HashSet::new();
        for def in &module.structs {
            layout.compute_struct(&def.name, &defs, &mut visiting);
        }
        layout
    }

    fn compute_struct(
        &mut self,
        name: &str,
        defs: &HashMap<&str, &StructType>,
        visiting: &mut HashSet<String>,
    ) {
        if self.structs.contains_key(name) || !visiting.insert(name.to_string()) {
            return;
        }
        let Some(def) = defs.get(name) else {
            return;
        };

        for field in &def.fields {
            self.compute_nested(field, defs, visiting);
        }

        let mut offset = 0;
        let mut max_align = 1;
        let mut offsets = Vec::with_capacity(def.fields.len());
        for field in &def.fields {
            let align = self.align(field);
            offset = align_to(offset, align);
            offsets.push(offset);
            offset += self.alloc_size(field);
            max_align = max_align.max(align);
        }
        self.structs.insert(
            name.to_string(),
            StructInfo {
                size: align_to(offset, max_align),
                align: max_align,
                offsets,
            },
        );
        visiting.remove(name);
    }

    fn compute_nested(
        &mut self,
        ty: &Type,
        defs: &HashMap<&str, &StructType>,
        visiting: &mut HashSet<String>,
    ) {
        match ty {
            Type::Struct { name } => self.compute_struct(name, defs, visiting),
            Type::Array { elem, .. } => self.compute_nested(elem, defs, visiting),
            _ => {}
        }
    }

    /// Replace computed sizes and offsets with the analyzer's
    pub fn apply_dump(&mut self, dump: &StructLayoutDump) {
        for (name, info) in self.structs.iter_mut() {
            let Some(found) = dump.get(source_struct_name(name)) else {
                continue;
            };
            info.size = found.size_bytes;
            if found.members.len() == info.offsets.len() {
                info.offsets = found.members.iter().map(|m| m.offset_bytes).collect();
            }
        }
        for (name, found) in &dump.layouts {
            let key = format!("struct.{name}");
            self.structs.entry(key).or_insert_with(|| StructInfo {
                size: found.size_bytes,
                align: 8,
                offsets: found.members.iter().map(|m| m.offset_bytes).collect(),
            });
        }
    }

    /// Bytes written by a store of `ty`
    pub fn store_size(&self, ty: &Type) -> u64 {
        match ty {
            Type::Void => 0,
            Type::Int { bits } | Type::Float { bits } => u64::from(*bits).div_ceil(8),
            Type::Ptr => POINTER_BYTES,
            Type::Array { elem, len } => self.alloc_size(elem) * len,
            Type::Struct { name } => self.struct_size(name).unwrap_or(0),
        }
    }

    /// Store size rounded up to the type's alignment
    pub fn alloc_size(&self, ty: &Type) -> u64 {
        align_to(self.store_size(ty), self.align(ty))
    }

    pub fn align(&self, ty: &Type) -> u64 {
        match ty {
            Type::Void => 1,
            Type::Int { bits } | Type::Float { bits } => {
                u64::from(*bits).div_ceil(8).max(1).next_power_of_two().min(8)
            }
            Type::Ptr => POINTER_BYTES,
            Type::Array { elem, .. } => self.align(elem),
            Type::Struct { name } => self.structs.get(name).map_or(1, |s| s.align),
        }
    }

    pub fn struct_size(&self, name: &str) -> Option<u64> {
        self.structs.get(name).map(|s| s.size)
    }

    pub fn field_offset(&self, name: &str, index: usize) -> Option<u64> {
        self.structs.get(name)?.offsets.get(index).copied()
    }
}
