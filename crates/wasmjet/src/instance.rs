//! Linked module instances and the objects they export.

use crate::codegen::CodeObject;
use crate::compartment::Compartment;
use crate::error::InvokeError;
use crate::func::Func;
use crate::types::{ExternType, GlobalType, MemoryType, TableType};
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use wasmjet_runtime::{Global, Memory, Table, Value};

/// What an instance keeps alive on behalf of its compiled code.
///
/// Compiled code holds raw addresses of every object listed here, so the
/// compartment owns this until it is dropped itself.
#[derive(Debug)]
pub(crate) struct InstanceData {
    pub code: CodeObject,
    pub memories: Vec<Arc<Memory>>,
    pub tables: Vec<Arc<Table>>,
    pub globals: Vec<Arc<Global>>,
}

/// A linear memory owned by a compartment.
#[derive(Debug, Clone)]
pub struct MemoryRef {
    pub(crate) memory: Arc<Memory>,
    /// Declared limits.
    pub(crate) ty: MemoryType,
    pub(crate) compartment: u64,
}

impl MemoryRef {
    /// Declared type, with the current size as the initial size.
    pub fn ty(&self) -> MemoryType {
        MemoryType {
            initial: self.memory.size(),
            ..self.ty
        }
    }
}

impl Deref for MemoryRef {
    type Target = Memory;

    fn deref(&self) -> &Memory {
        &self.memory
    }
}

/// A function table owned by a compartment.
#[derive(Debug, Clone)]
pub struct TableRef {
    pub(crate) table: Arc<Table>,
    pub(crate) ty: TableType,
    pub(crate) compartment: u64,
}

impl TableRef {
    pub fn ty(&self) -> TableType {
        TableType {
            initial: self.table.size(),
            ..self.ty
        }
    }
}

impl Deref for TableRef {
    type Target = Table;

    fn deref(&self) -> &Table {
        &self.table
    }
}

/// A global owned by a compartment.
#[derive(Debug, Clone)]
pub struct GlobalRef {
    pub(crate) global: Arc<Global>,
    pub(crate) compartment: u64,
}

impl GlobalRef {
    pub fn ty(&self) -> GlobalType {
        GlobalType {
            content: self.global.ty(),
            mutable: self.global.is_mutable(),
        }
    }
}

impl Deref for GlobalRef {
    type Target = Global;

    fn deref(&self) -> &Global {
        &self.global
    }
}

/// Any object that can be imported or exported.
#[derive(Debug, Clone)]
pub enum Extern {
    Func(Func),
    Memory(MemoryRef),
    Table(TableRef),
    Global(GlobalRef),
}

impl Extern {
    pub fn ty(&self) -> ExternType {
        match self {
            Extern::Func(func) => ExternType::Func(func.ty().clone()),
            Extern::Memory(memory) => ExternType::Memory(memory.ty()),
            Extern::Table(table) => ExternType::Table(table.ty()),
            Extern::Global(global) => ExternType::Global(global.ty()),
        }
    }

    pub fn into_func(self) -> Option<Func> {
        match self {
            Extern::Func(func) => Some(func),
            _ => None,
        }
    }

    pub fn into_memory(self) -> Option<MemoryRef> {
        match self {
            Extern::Memory(memory) => Some(memory),
            _ => None,
        }
    }

    pub fn into_table(self) -> Option<TableRef> {
        match self {
            Extern::Table(table) => Some(table),
            _ => None,
        }
    }

    pub fn into_global(self) -> Option<GlobalRef> {
        match self {
            Extern::Global(global) => Some(global),
            _ => None,
        }
    }
}

impl From<Func> for Extern {
    fn from(func: Func) -> Self {
        Extern::Func(func)
    }
}

impl From<MemoryRef> for Extern {
    fn from(memory: MemoryRef) -> Self {
        Extern::Memory(memory)
    }
}

impl From<TableRef> for Extern {
    fn from(table: TableRef) -> Self {
        Extern::Table(table)
    }
}

impl From<GlobalRef> for Extern {
    fn from(global: GlobalRef) -> Self {
        Extern::Global(global)
    }
}

/// A linked, compiled module.
///
/// Holds its compartment alive, and with it every object its code refers
/// to.
#[derive(Clone)]
pub struct Instance {
    pub(crate) name: String,
    pub(crate) compartment: Compartment,
    pub(crate) exports: HashMap<String, Extern>,
}

impl Instance {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compartment(&self) -> &Compartment {
        &self.compartment
    }

    pub fn export(&self, name: &str) -> Option<Extern> {
        self.exports.get(name).cloned()
    }

    pub fn exports(&self) -> impl Iterator<Item = (&str, &Extern)> + '_ {
        self.exports.iter().map(|(name, ext)| (name.as_str(), ext))
    }

    pub fn func(&self, name: &str) -> Option<Func> {
        self.export(name)?.into_func()
    }

    pub fn memory(&self, name: &str) -> Option<MemoryRef> {
        self.export(name)?.into_memory()
    }

    pub fn table(&self, name: &str) -> Option<TableRef> {
        self.export(name)?.into_table()
    }

    pub fn global(&self, name: &str) -> Option<GlobalRef> {
        self.export(name)?.into_global()
    }

    /// Call the exported function `name`.
    pub fn invoke(&self, name: &str, args: &[Value]) -> Result<Vec<Value>, InvokeError> {
        let func = self
            .func(name)
            .ok_or_else(|| InvokeError::NotAFunction(name.to_string()))?;
        func.call(args)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut exports: Vec<&str> = self.exports.keys().map(String::as_str).collect();
        exports.sort_unstable();
        f.debug_struct("Instance")
            .field("name", &self.name)
            .field("compartment", &self.compartment.id())
            .field("exports", &exports)
            .finish()
    }
}
