//! Struct debug-type declaration map
//!
//! Built once per function from `dbg.declare` / `dbg.value` before any
//! instruction is inserted, then only read.

use crate::ir::{DiTag, DiType, Function, InstKind, Operand, ValueId};
use fnv::FnvHashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructDecl {
    pub name: String,
    pub size_bits: u64,
}

impl StructDecl {
    pub fn size_bytes(&self) -> u64 {
        self.size_bits / 8
    }
}

#[derive(Debug, Clone, Default)]
pub struct StructDeclMap {
    decls: FnvHashMap<ValueId, StructDecl>,
}

/// Struct type a variable holds or points to
///
/// Pointer and typedef chains are followed down to their base; anything
/// other than a structure yields `None`.
pub fn struct_of(var: &DiType) -> Option<&DiType> {
    if var.tag.is_composite() {
        return (var.tag == DiTag::StructureType).then_some(var);
    }
    if !var.tag.is_derived() {
        return None;
    }

    let is_link = |ty: &DiType| matches!(ty.tag, DiTag::PointerType | DiTag::Typedef);
    let mut derived = var;
    while is_link(derived) {
        match derived.base.as_deref() {
            Some(base) if base.tag.is_derived() => derived = base,
            _ => break,
        }
    }

    if !is_link(derived) {
        return None;
    }
    derived
        .base
        .as_deref()
        .filter(|base| base.tag == DiTag::StructureType)
}

impl StructDeclMap {
    pub fn build(func: &Function) -> Self {
        let mut map = Self::default();
        for inst in func.instructions() {
            let (operand, var) = match &inst.op {
                InstKind::DbgDeclare { address, var } => (address, var),
                InstKind::DbgValue { value, var } => (value, var),
                _ => continue,
            };
            let Operand::Value { id } = operand else {
                continue;
            };
            if let Some(ty) = struct_of(var) {
                map.decls.insert(
                    *id,
                    StructDecl {
                        name: ty.name.clone(),
                        size_bits: ty.size_bits,
                    },
                );
            }
        }
        map
    }

    pub fn get(&self, value: ValueId) -> Option<&StructDecl> {
        self.decls.get(&value)
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BasicBlock, Instruction};

    fn inode() -> DiType {
        DiType::structure("nova_inode", 1024)
    }

    #[test]
    fn test_struct_of_direct_and_through_pointers() {
        assert_eq!(struct_of(&inode()).map(|t| t.name.as_str()), Some("nova_inode"));

        let ptr = DiType::derived(DiTag::PointerType, inode());
        assert_eq!(struct_of(&ptr).map(|t| t.name.as_str()), Some("nova_inode"));

        let typedef_ptr = DiType::derived(
            DiTag::Typedef,
            DiType::derived(DiTag::PointerType, inode()),
        );
        assert_eq!(
            struct_of(&typedef_ptr).map(|t| t.name.as_str()),
            Some("nova_inode")
        );
    }

    #[test]
    fn test_struct_of_rejects_other_shapes() {
        let base = DiType {
            tag: DiTag::BaseType,
            name: "int".into(),
            size_bits: 32,
            base: None,
        };
        assert!(struct_of(&base).is_none());
        assert!(struct_of(&DiType::derived(DiTag::PointerType, base)).is_none());

        let union = DiType {
            tag: DiTag::UnionType,
            name: "u".into(),
            size_bits: 64,
            base: None,
        };
        assert!(struct_of(&union).is_none());

        let const_ptr = DiType::derived(
            DiTag::PointerType,
            DiType::derived(DiTag::ConstType, inode()),
        );
        assert!(struct_of(&const_ptr).is_none());
    }

    #[test]
    fn test_build_from_debug_intrinsics() {
        let func = Function {
            name: "f".into(),
            blocks: vec![BasicBlock::new(
                "entry",
                vec![
                    Instruction::new(
                        ValueId(10),
                        InstKind::DbgDeclare {
                            address: Operand::value(ValueId(1)),
                            var: DiType::derived(DiTag::PointerType, inode()),
                        },
                    ),
                    Instruction::new(
                        ValueId(11),
                        InstKind::DbgValue {
                            value: Operand::i64(3),
                            var: inode(),
                        },
                    ),
                ],
            )],
            ..Default::default()
        };
        let map = StructDeclMap::build(&func);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(ValueId(1)).map(StructDecl::size_bytes), Some(128));
    }
}
