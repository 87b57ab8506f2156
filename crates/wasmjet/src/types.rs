//! Type descriptions shared by modules, runtime objects and resolvers.

use anyhow::{bail, Result};
use std::fmt;

pub use wasmjet_runtime::ValType;

/// A function signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncType {
    params: Box<[ValType]>,
    results: Box<[ValType]>,
}

impl FuncType {
    pub fn new(
        params: impl IntoIterator<Item = ValType>,
        results: impl IntoIterator<Item = ValType>,
    ) -> Self {
        Self {
            params: params.into_iter().collect(),
            results: results.into_iter().collect(),
        }
    }

    pub fn params(&self) -> &[ValType] {
        &self.params
    }

    pub fn results(&self) -> &[ValType] {
        &self.results
    }

    pub(crate) fn from_wasmparser(ty: &wasmparser::FuncType) -> Result<Self> {
        let params = ty
            .params()
            .iter()
            .map(|t| convert_val_type(*t))
            .collect::<Result<Vec<_>>>()?;
        let results = ty
            .results()
            .iter()
            .map(|t| convert_val_type(*t))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(params, results))
    }
}

impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, types: &[ValType]) -> fmt::Result {
            f.write_str("(")?;
            for (i, ty) in types.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{ty}")?;
            }
            f.write_str(")")
        }
        list(f, &self.params)?;
        f.write_str(" -> ")?;
        list(f, &self.results)
    }
}

/// Limits of a linear memory, in pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub initial: u32,
    pub maximum: Option<u32>,
    pub shared: bool,
}

/// Limits of a funcref table, in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableType {
    pub initial: u32,
    pub maximum: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalType {
    pub content: ValType,
    pub mutable: bool,
}

/// Kind of an importable or exportable object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternKind {
    Func,
    Memory,
    Table,
    Global,
}

impl fmt::Display for ExternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExternKind::Func => "function",
            ExternKind::Memory => "memory",
            ExternKind::Table => "table",
            ExternKind::Global => "global",
        })
    }
}

/// The type of an import or export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternType {
    Func(FuncType),
    Memory(MemoryType),
    Table(TableType),
    Global(GlobalType),
}

impl ExternType {
    pub fn kind(&self) -> ExternKind {
        match self {
            ExternType::Func(_) => ExternKind::Func,
            ExternType::Memory(_) => ExternKind::Memory,
            ExternType::Table(_) => ExternKind::Table,
            ExternType::Global(_) => ExternKind::Global,
        }
    }
}

impl fmt::Display for ExternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternType::Func(ty) => write!(f, "func {ty}"),
            ExternType::Memory(ty) => match ty.maximum {
                Some(max) => write!(f, "memory {}..{max}", ty.initial),
                None => write!(f, "memory {}..", ty.initial),
            },
            ExternType::Table(ty) => match ty.maximum {
                Some(max) => write!(f, "table {}..{max}", ty.initial),
                None => write!(f, "table {}..", ty.initial),
            },
            ExternType::Global(ty) if ty.mutable => write!(f, "global mut {}", ty.content),
            ExternType::Global(ty) => write!(f, "global {}", ty.content),
        }
    }
}

/// Whether limits `(initial, maximum)` of an actual object satisfy the
/// limits an import declares.
pub(crate) fn limits_match(
    actual_initial: u32,
    actual_max: Option<u32>,
    expected_initial: u32,
    expected_max: Option<u32>,
) -> bool {
    if actual_initial < expected_initial {
        return false;
    }
    match (actual_max, expected_max) {
        (_, None) => true,
        (Some(actual), Some(expected)) => actual <= expected,
        (None, Some(_)) => false,
    }
}

pub(crate) fn convert_val_type(ty: wasmparser::ValType) -> Result<ValType> {
    Ok(match ty {
        wasmparser::ValType::I32 => ValType::I32,
        wasmparser::ValType::I64 => ValType::I64,
        wasmparser::ValType::F32 => ValType::F32,
        wasmparser::ValType::F64 => ValType::F64,
        other => bail!("unsupported value type {other:?}"),
    })
}
