//! Decoded, validated WebAssembly modules.
//!
//! This module wraps the `wasmparser` crate: a binary is validated once and
//! then decoded into a [`Module`], an immutable description shared by every
//! instance created from it.

use crate::types::{
    convert_val_type, ExternKind, ExternType, FuncType, GlobalType, MemoryType, TableType,
};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use wasmjet_runtime::ValType;
use wasmparser::{
    ExternalKind, KnownCustom, Name, Parser, Payload, TypeRef, Validator, WasmFeatures,
};

/// Proposals accepted by the validator. Operators outside the set the code
/// generator supports are rejected at compile time.
pub(crate) fn features() -> WasmFeatures {
    WasmFeatures::default() | WasmFeatures::THREADS
}

/// A constant initializer expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ConstExpr {
    I32(i32),
    I64(i64),
    F32(u32),
    F64(u64),
    GlobalGet(u32),
    RefFunc(u32),
    RefNull,
}

#[derive(Debug, Clone)]
pub(crate) struct Import {
    pub module: String,
    pub name: String,
    pub ty: ImportType,
}

#[derive(Debug, Clone)]
pub(crate) enum ImportType {
    /// Index into the type section.
    Func(u32),
    Memory(MemoryType),
    Table(TableType),
    Global(GlobalType),
}

#[derive(Debug, Clone)]
pub(crate) struct FunctionBody {
    /// Declared locals, excluding parameters.
    pub locals: Vec<ValType>,
    /// Raw operator bytes, decoded again by the code generator.
    pub code: Vec<u8>,
    /// Offset of `code` in the original binary.
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct GlobalDef {
    pub ty: GlobalType,
    pub init: ConstExpr,
}

#[derive(Debug, Clone)]
pub(crate) struct Export {
    pub name: String,
    pub kind: ExternKind,
    pub index: u32,
}

/// An active element segment. `None` items are null references.
#[derive(Debug, Clone)]
pub(crate) struct ElementSegment {
    pub table_index: u32,
    pub offset: ConstExpr,
    pub items: Vec<Option<u32>>,
}

/// An active data segment.
#[derive(Debug, Clone)]
pub(crate) struct DataSegment {
    pub memory_index: u32,
    pub offset: ConstExpr,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
pub(crate) struct ModuleInner {
    pub name: Option<String>,
    pub types: Vec<FuncType>,
    pub imports: Vec<Import>,
    /// Type index of every function, imported functions first.
    pub functions: Vec<u32>,
    pub bodies: Vec<FunctionBody>,
    /// Locally defined memories (imports come first in the index space).
    pub memories: Vec<MemoryType>,
    pub tables: Vec<TableType>,
    pub globals: Vec<GlobalDef>,
    pub exports: Vec<Export>,
    pub elements: Vec<ElementSegment>,
    pub data: Vec<DataSegment>,
    pub start: Option<u32>,
    pub function_names: HashMap<u32, String>,
    pub num_imported_funcs: u32,
    pub num_imported_memories: u32,
    pub num_imported_tables: u32,
    pub num_imported_globals: u32,
}

/// A validated WebAssembly module. Cheap to clone; may be instantiated any
/// number of times.
#[derive(Debug, Clone)]
pub struct Module {
    pub(crate) inner: Arc<ModuleInner>,
}

impl Module {
    /// Validate and decode a binary module.
    pub fn from_binary(bytes: &[u8]) -> Result<Module> {
        Validator::new_with_features(features())
            .validate_all(bytes)
            .context("module failed validation")?;
        let inner = parse_module(bytes).context("failed to decode module")?;
        tracing::debug!(
            name = inner.name.as_deref().unwrap_or("<anonymous>"),
            functions = inner.functions.len(),
            imports = inner.imports.len(),
            exports = inner.exports.len(),
            "decoded module"
        );
        Ok(Module {
            inner: Arc::new(inner),
        })
    }

    /// Assemble a module from the text format.
    pub fn from_text(text: &str) -> Result<Module> {
        let bytes = wat::parse_str(text).context("failed to parse text module")?;
        Self::from_binary(&bytes)
    }

    /// Load a `.wasm` or `.wat` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Module> {
        let path = path.as_ref();
        let bytes =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let bytes = wat::parse_bytes(&bytes)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Self::from_binary(&bytes)
    }

    /// Module name from the name section.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Imports in declaration order as `(module, name, type)`.
    pub fn imports(&self) -> impl Iterator<Item = (&str, &str, ExternType)> + '_ {
        self.inner.imports.iter().map(|import| {
            (
                import.module.as_str(),
                import.name.as_str(),
                self.import_type(&import.ty),
            )
        })
    }

    /// Exports in declaration order as `(name, type)`.
    pub fn exports(&self) -> impl Iterator<Item = (&str, ExternType)> + '_ {
        self.inner
            .exports
            .iter()
            .map(|export| (export.name.as_str(), self.export_type(export)))
    }

    /// Name of function `index` from the name section.
    pub fn function_name(&self, index: u32) -> Option<&str> {
        self.inner.function_names.get(&index).map(String::as_str)
    }

    pub fn function_names(&self) -> &HashMap<u32, String> {
        &self.inner.function_names
    }

    /// Signature of function `index`.
    pub fn func_type(&self, index: u32) -> Option<&FuncType> {
        let type_index = *self.inner.functions.get(index as usize)?;
        self.inner.types.get(type_index as usize)
    }

    pub(crate) fn import_type(&self, ty: &ImportType) -> ExternType {
        match ty {
            ImportType::Func(type_index) => {
                ExternType::Func(self.inner.types[*type_index as usize].clone())
            }
            ImportType::Memory(ty) => ExternType::Memory(*ty),
            ImportType::Table(ty) => ExternType::Table(*ty),
            ImportType::Global(ty) => ExternType::Global(*ty),
        }
    }

    fn export_type(&self, export: &Export) -> ExternType {
        let inner = &self.inner;
        let index = export.index;
        match export.kind {
            ExternKind::Func => ExternType::Func(
                self.func_type(index)
                    .cloned()
                    .unwrap_or_else(|| FuncType::new([], [])),
            ),
            ExternKind::Memory => ExternType::Memory(
                self.nth_import(ExternKind::Memory, index)
                    .and_then(|ty| match ty {
                        ImportType::Memory(ty) => Some(*ty),
                        _ => None,
                    })
                    .unwrap_or_else(|| {
                        inner.memories[(index - inner.num_imported_memories) as usize]
                    }),
            ),
            ExternKind::Table => ExternType::Table(
                self.nth_import(ExternKind::Table, index)
                    .and_then(|ty| match ty {
                        ImportType::Table(ty) => Some(*ty),
                        _ => None,
                    })
                    .unwrap_or_else(|| inner.tables[(index - inner.num_imported_tables) as usize]),
            ),
            ExternKind::Global => ExternType::Global(
                self.nth_import(ExternKind::Global, index)
                    .and_then(|ty| match ty {
                        ImportType::Global(ty) => Some(*ty),
                        _ => None,
                    })
                    .unwrap_or_else(|| {
                        inner.globals[(index - inner.num_imported_globals) as usize].ty
                    }),
            ),
        }
    }

    /// The `n`th import of the given kind, if `n` falls in the import range.
    fn nth_import(&self, kind: ExternKind, n: u32) -> Option<&ImportType> {
        self.inner
            .imports
            .iter()
            .map(|import| &import.ty)
            .filter(|ty| import_kind(ty) == kind)
            .nth(n as usize)
    }
}

pub(crate) fn import_kind(ty: &ImportType) -> ExternKind {
    match ty {
        ImportType::Func(_) => ExternKind::Func,
        ImportType::Memory(_) => ExternKind::Memory,
        ImportType::Table(_) => ExternKind::Table,
        ImportType::Global(_) => ExternKind::Global,
    }
}

fn eval_const_expr(expr: wasmparser::ConstExpr) -> Result<ConstExpr> {
    let mut reader = expr.get_operators_reader();
    let op = reader.read().context("reading const expr operator")?;
    Ok(match op {
        wasmparser::Operator::I32Const { value } => ConstExpr::I32(value),
        wasmparser::Operator::I64Const { value } => ConstExpr::I64(value),
        wasmparser::Operator::F32Const { value } => ConstExpr::F32(value.bits()),
        wasmparser::Operator::F64Const { value } => ConstExpr::F64(value.bits()),
        wasmparser::Operator::GlobalGet { global_index } => ConstExpr::GlobalGet(global_index),
        wasmparser::Operator::RefFunc { function_index } => ConstExpr::RefFunc(function_index),
        wasmparser::Operator::RefNull { .. } => ConstExpr::RefNull,
        other => bail!("unsupported constant expression operator: {other:?}"),
    })
}

fn memory_type(ty: &wasmparser::MemoryType) -> Result<MemoryType> {
    if ty.memory64 {
        bail!("64-bit memories are not supported");
    }
    if ty.page_size_log2.is_some() {
        bail!("custom page sizes are not supported");
    }
    Ok(MemoryType {
        initial: ty.initial as u32,
        maximum: ty.maximum.map(|m| m as u32),
        shared: ty.shared,
    })
}

fn table_type(ty: &wasmparser::TableType) -> Result<TableType> {
    if ty.element_type != wasmparser::RefType::FUNCREF {
        bail!("only funcref tables are supported");
    }
    if ty.table64 {
        bail!("64-bit tables are not supported");
    }
    Ok(TableType {
        initial: ty.initial as u32,
        maximum: ty.maximum.map(|m| m as u32),
    })
}

fn global_type(ty: &wasmparser::GlobalType) -> Result<GlobalType> {
    Ok(GlobalType {
        content: convert_val_type(ty.content_type)?,
        mutable: ty.mutable,
    })
}

/// Parse an active element segment, or return None for passive/declared
/// segments, which have no effect at instantiation.
fn parse_element_segment(element: wasmparser::Element) -> Result<Option<ElementSegment>> {
    let wasmparser::ElementKind::Active {
        table_index,
        offset_expr,
    } = element.kind
    else {
        return Ok(None);
    };
    let offset = eval_const_expr(offset_expr)?;
    let mut items = Vec::new();
    match element.items {
        wasmparser::ElementItems::Functions(funcs) => {
            for func in funcs {
                items.push(Some(func.context("reading element func index")?));
            }
        }
        wasmparser::ElementItems::Expressions(_, exprs) => {
            for expr in exprs {
                match eval_const_expr(expr.context("reading element expression")?)? {
                    ConstExpr::RefFunc(index) => items.push(Some(index)),
                    ConstExpr::RefNull => items.push(None),
                    other => bail!("unsupported element expression {other:?}"),
                }
            }
        }
    }
    Ok(Some(ElementSegment {
        table_index: table_index.unwrap_or(0),
        offset,
        items,
    }))
}

fn parse_data_segment(data: wasmparser::Data) -> Result<Option<DataSegment>> {
    match data.kind {
        wasmparser::DataKind::Active {
            memory_index,
            offset_expr,
        } => Ok(Some(DataSegment {
            memory_index,
            offset: eval_const_expr(offset_expr)?,
            data: data.data.to_vec(),
        })),
        // Passive segments are only reachable through memory.init.
        wasmparser::DataKind::Passive => Ok(None),
    }
}

fn parse_code_entry(body: wasmparser::FunctionBody) -> Result<FunctionBody> {
    let mut locals = Vec::new();
    for local in body.get_locals_reader().context("getting locals reader")? {
        let (count, ty) = local.context("reading local")?;
        let ty = convert_val_type(ty)?;
        locals.extend(std::iter::repeat_n(ty, count as usize));
    }

    let operators = body
        .get_operators_reader()
        .context("getting operators reader")?;
    let mut reader = operators.get_binary_reader();
    let offset = reader.original_position();
    let remaining = reader.bytes_remaining();
    let code = reader
        .read_bytes(remaining)
        .context("reading body bytes")?
        .to_vec();

    Ok(FunctionBody {
        locals,
        code,
        offset,
    })
}

fn parse_name_section(reader: wasmparser::NameSectionReader, module: &mut ModuleInner) {
    for subsection in reader {
        // The name section is advisory; a malformed one is ignored.
        let Ok(subsection) = subsection else {
            tracing::warn!("ignoring malformed name section");
            return;
        };
        match subsection {
            Name::Module { name, .. } => module.name = Some(name.to_string()),
            Name::Function(names) => {
                for naming in names.into_iter().flatten() {
                    module
                        .function_names
                        .insert(naming.index, naming.name.to_string());
                }
            }
            _ => {}
        }
    }
}

/// Decode an already validated binary.
fn parse_module(bytes: &[u8]) -> Result<ModuleInner> {
    let mut module = ModuleInner::default();
    let mut defined_func_types: Vec<u32> = Vec::new();

    for payload in Parser::new(0).parse_all(bytes) {
        match payload.context("parsing wasm payload")? {
            Payload::TypeSection(reader) => {
                for rec_group in reader {
                    let rec_group = rec_group.context("reading rec group")?;
                    for sub_type in rec_group.types() {
                        match &sub_type.composite_type.inner {
                            wasmparser::CompositeInnerType::Func(ty) => {
                                module.types.push(FuncType::from_wasmparser(ty)?)
                            }
                            _ => bail!("only function types are supported"),
                        }
                    }
                }
            }

            Payload::ImportSection(reader) => {
                for import in reader {
                    let import = import.context("reading import")?;
                    let ty = match import.ty {
                        TypeRef::Func(type_index) => {
                            module.num_imported_funcs += 1;
                            module.functions.push(type_index);
                            ImportType::Func(type_index)
                        }
                        TypeRef::Memory(ty) => {
                            module.num_imported_memories += 1;
                            ImportType::Memory(memory_type(&ty)?)
                        }
                        TypeRef::Table(ty) => {
                            module.num_imported_tables += 1;
                            ImportType::Table(table_type(&ty)?)
                        }
                        TypeRef::Global(ty) => {
                            module.num_imported_globals += 1;
                            ImportType::Global(global_type(&ty)?)
                        }
                        TypeRef::Tag(_) => bail!("tag imports are not supported"),
                    };
                    module.imports.push(Import {
                        module: import.module.to_string(),
                        name: import.name.to_string(),
                        ty,
                    });
                }
            }

            Payload::FunctionSection(reader) => {
                for type_index in reader {
                    let type_index = type_index.context("reading function type index")?;
                    defined_func_types.push(type_index);
                    module.functions.push(type_index);
                }
            }

            Payload::TableSection(reader) => {
                for table in reader {
                    let table = table.context("reading table type")?;
                    if !matches!(table.init, wasmparser::TableInit::RefNull) {
                        bail!("table initializer expressions are not supported");
                    }
                    module.tables.push(table_type(&table.ty)?);
                }
            }

            Payload::MemorySection(reader) => {
                for memory in reader {
                    let memory = memory.context("reading memory type")?;
                    module.memories.push(memory_type(&memory)?);
                }
            }

            Payload::GlobalSection(reader) => {
                for global in reader {
                    let global = global.context("reading global")?;
                    module.globals.push(GlobalDef {
                        ty: global_type(&global.ty)?,
                        init: eval_const_expr(global.init_expr)?,
                    });
                }
            }

            Payload::ExportSection(reader) => {
                for export in reader {
                    let export = export.context("reading export")?;
                    let kind = match export.kind {
                        ExternalKind::Func => ExternKind::Func,
                        ExternalKind::Table => ExternKind::Table,
                        ExternalKind::Memory => ExternKind::Memory,
                        ExternalKind::Global => ExternKind::Global,
                        ExternalKind::Tag => bail!("tag exports are not supported"),
                    };
                    module.exports.push(Export {
                        name: export.name.to_string(),
                        kind,
                        index: export.index,
                    });
                }
            }

            Payload::StartSection { func, .. } => module.start = Some(func),

            Payload::ElementSection(reader) => {
                for element in reader {
                    let element = element.context("reading element segment")?;
                    if let Some(segment) = parse_element_segment(element)? {
                        module.elements.push(segment);
                    }
                }
            }

            Payload::DataSection(reader) => {
                for data in reader {
                    let data = data.context("reading data segment")?;
                    if let Some(segment) = parse_data_segment(data)? {
                        module.data.push(segment);
                    }
                }
            }

            Payload::CodeSectionEntry(body) => {
                if module.bodies.len() >= defined_func_types.len() {
                    bail!("more function bodies than declared functions");
                }
                module.bodies.push(parse_code_entry(body)?);
            }

            Payload::CustomSection(reader) => {
                if let KnownCustom::Name(names) = reader.as_known() {
                    parse_name_section(names, &mut module);
                }
            }

            _ => {}
        }
    }

    Ok(module)
}
