//! Runtime entry points the engine inserts calls to
//!
//! Symbol names and argument order are the C ABI exported by
//! [`crate::runtime::ffi`]. `i32` ids are program point ids, `i64` values are
//! sequence numbers, sizes and flags, `ptr` values are addresses or C
//! strings.

use crate::ir::{Signature, Type};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    AcquireSequence,
    OldStoreValue,
    InitAll,
    DestroyAll,
    StartFunc,
    EndFunc,
    UnknownStructPtr,
    DbgVarStore,
    LoadInst,
    StoreInst,
    FenceInst,
    XchgInst,
    RmwInst,
    MemsetInst,
    MemtransferInst,
    SelectInst,
    AsmFlush,
    AsmFence,
    AsmXchg,
    AsmCas,
    AsmMemsetNt,
    AsmUnknown,
    ImplicitFence,
    StartCall,
    EndCall,
    UaccessCall,
    UaccessNtCall,
    DaxAccess,
    CentralizedFlush,
}

enum P {
    I32,
    I64,
    Ptr,
}

impl Hook {
    pub const ALL: [Hook; 29] = [
        Hook::AcquireSequence,
        Hook::OldStoreValue,
        Hook::InitAll,
        Hook::DestroyAll,
        Hook::StartFunc,
        Hook::EndFunc,
        Hook::UnknownStructPtr,
        Hook::DbgVarStore,
        Hook::LoadInst,
        Hook::StoreInst,
        Hook::FenceInst,
        Hook::XchgInst,
        Hook::RmwInst,
        Hook::MemsetInst,
        Hook::MemtransferInst,
        Hook::SelectInst,
        Hook::AsmFlush,
        Hook::AsmFence,
        Hook::AsmXchg,
        Hook::AsmCas,
        Hook::AsmMemsetNt,
        Hook::AsmUnknown,
        Hook::ImplicitFence,
        Hook::StartCall,
        Hook::EndCall,
        Hook::UaccessCall,
        Hook::UaccessNtCall,
        Hook::DaxAccess,
        Hook::CentralizedFlush,
    ];

    /// Exported runtime symbol
    pub fn symbol(self) -> &'static str {
        match self {
            Hook::AcquireSequence => "trace_acquire_sequence",
            Hook::OldStoreValue => "trace_old_store_value",
            Hook::InitAll => "trace_init_all",
            Hook::DestroyAll => "trace_destroy_all",
            Hook::StartFunc => "trace_start_func",
            Hook::EndFunc => "trace_end_func",
            Hook::UnknownStructPtr => "trace_unknown_struct_ptr_inst",
            Hook::DbgVarStore => "trace_dbg_var_store",
            Hook::LoadInst => "trace_load_inst",
            Hook::StoreInst => "trace_store_inst",
            Hook::FenceInst => "trace_fence_inst",
            Hook::XchgInst => "trace_xchg_inst",
            Hook::RmwInst => "trace_rmw_inst",
            Hook::MemsetInst => "trace_memset_inst",
            Hook::MemtransferInst => "trace_memtransfer_inst",
            Hook::SelectInst => "trace_select_inst",
            Hook::AsmFlush => "trace_inline_asm_flush",
            Hook::AsmFence => "trace_inline_asm_fence",
            Hook::AsmXchg => "trace_inline_asm_xchglq",
            Hook::AsmCas => "trace_inline_asm_cas",
            Hook::AsmMemsetNt => "trace_inline_asm_memsetnt",
            Hook::AsmUnknown => "trace_inline_asm_unknown",
            Hook::ImplicitFence => "trace_implicit_fence",
            Hook::StartCall => "trace_start_calls",
            Hook::EndCall => "trace_end_calls",
            Hook::UaccessCall => "trace_uaccess_calls",
            Hook::UaccessNtCall => "trace_uaccess_nt_calls",
            Hook::DaxAccess => "trace_dax_access",
            Hook::CentralizedFlush => "trace_centralized_flush",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Hook> {
        Self::ALL.into_iter().find(|hook| hook.symbol() == symbol)
    }

    fn params(self) -> &'static [P] {
        use P::{I32, I64, Ptr};
        match self {
            Hook::AcquireSequence => &[I64],
            Hook::OldStoreValue => &[I64, Ptr, I64, I64],
            Hook::InitAll => &[],
            Hook::DestroyAll => &[I32],
            Hook::StartFunc | Hook::EndFunc => &[I32, Ptr, Ptr],
            Hook::UnknownStructPtr => &[I32, Ptr, I32, I64, Ptr, I32, I32, Ptr, Ptr],
            Hook::DbgVarStore => &[I32, Ptr, Ptr, I64],
            Hook::LoadInst => &[I32, Ptr, I64, I32, I32, Ptr, Ptr],
            Hook::StoreInst => &[I64, I32, Ptr, I64, I32, I32, Ptr, Ptr],
            Hook::FenceInst => &[I32, I32, I32, Ptr, Ptr],
            Hook::XchgInst
            | Hook::RmwInst
            | Hook::MemsetInst
            | Hook::AsmXchg
            | Hook::AsmCas
            | Hook::AsmMemsetNt => &[I64, I32, Ptr, I64],
            Hook::MemtransferInst | Hook::UaccessCall | Hook::UaccessNtCall => {
                &[I64, I32, Ptr, Ptr, I64]
            }
            Hook::SelectInst => &[I32, I64],
            Hook::AsmFlush => &[I32, Ptr],
            Hook::AsmFence | Hook::ImplicitFence => &[I32],
            Hook::AsmUnknown => &[I32, Ptr, Ptr, I32, Ptr],
            Hook::StartCall | Hook::EndCall => &[I32, Ptr, Ptr, Ptr, I32],
            Hook::DaxAccess => &[I32, Ptr, I64],
            Hook::CentralizedFlush => &[I64, I32, Ptr, I32],
        }
    }

    pub fn arity(self) -> usize {
        self.params().len()
    }

    pub fn signature(self) -> Signature {
        let params = self
            .params()
            .iter()
            .map(|p| match p {
                P::I32 => Type::int(32),
                P::I64 => Type::int(64),
                P::Ptr => Type::Ptr,
            })
            .collect();
        let ret = match self {
            Hook::AcquireSequence => Type::int(64),
            _ => Type::Void,
        };
        Signature { params, ret }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbols_round_trip() {
        for hook in Hook::ALL {
            assert_eq!(Hook::from_symbol(hook.symbol()), Some(hook));
            assert!(hook.symbol().starts_with("trace_"));
        }
        assert_eq!(Hook::from_symbol("printk"), None);
    }

    #[test]
    fn test_acquire_returns_sequence() {
        let sig = Hook::AcquireSequence.signature();
        assert_eq!(sig.params, vec![Type::int(64)]);
        assert_eq!(sig.ret, Type::int(64));
        assert_eq!(Hook::StoreInst.arity(), 8);
        assert_eq!(Hook::InitAll.signature().ret, Type::Void);
    }
}
