//! Compartments and module instantiation.
//!
//! A compartment owns every runtime object created in it: memories, tables,
//! globals, the compiled code of each instance and every host function stub.
//! Instances in the same compartment link to each other directly; compiled
//! code refers to its imports by raw address, so nothing a compartment owns
//! is released before the compartment itself.

use crate::codegen::{GlobalEnv, InstanceEnv, MemoryEnv};
use crate::engine::Engine;
use crate::error::{ImportError, ImportErrorKind, InstantiationError, InvokeError};
use crate::func::{Func, HostFuncData};
use crate::instance::{Extern, GlobalRef, Instance, InstanceData, MemoryRef, TableRef};
use crate::module::{ConstExpr, Module, ModuleInner};
use crate::types::{limits_match, ExternKind, ExternType, GlobalType, MemoryType, TableType};
use crate::resolver::Resolver;
use anyhow::anyhow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use wasmjet_runtime::platform::Mutex;
use wasmjet_runtime::{
    FuncRef, Global, Memory, MemoryPlan, RuntimeError, Table, TablePlan, TrapReason, Value,
    MAX_WASM_PAGES,
};

static NEXT_COMPARTMENT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct CompartmentInner {
    pub id: u64,
    pub engine: Engine,
    pub instances: Mutex<Vec<Arc<InstanceData>>>,
    pub host_funcs: Mutex<Vec<HostFuncData>>,
}

impl Drop for CompartmentInner {
    fn drop(&mut self) {
        tracing::debug!(id = self.id, "dropping compartment");
    }
}

/// An isolation domain grouping instances that may reference each other's
/// objects directly. Cheap to clone.
#[derive(Clone)]
pub struct Compartment {
    pub(crate) inner: Arc<CompartmentInner>,
}

/// Imports of one instance after linking, per kind, in index order.
#[derive(Default)]
struct Imports {
    funcs: Vec<Func>,
    memories: Vec<MemoryRef>,
    tables: Vec<TableRef>,
    globals: Vec<GlobalRef>,
}

impl Compartment {
    pub fn new(engine: &Engine) -> Compartment {
        let id = NEXT_COMPARTMENT_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(id, "created compartment");
        Compartment {
            inner: Arc::new(CompartmentInner {
                id,
                engine: engine.clone(),
                instances: Mutex::new(Vec::new()),
                host_funcs: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Allocate a memory of type `ty` in this compartment.
    pub fn create_memory(&self, ty: MemoryType) -> Result<MemoryRef, RuntimeError> {
        let config = self.engine().config();
        let guarded = config.guard_page_elision && cfg!(target_pointer_width = "64");
        let maximum = ty.maximum.unwrap_or(if guarded {
            MAX_WASM_PAGES
        } else {
            config.default_max_memory_pages.max(ty.initial)
        });
        let memory = Memory::new(MemoryPlan {
            initial: ty.initial,
            maximum,
            guarded,
            shared: ty.shared,
        })?;
        Ok(MemoryRef {
            memory: Arc::new(memory),
            ty,
            compartment: self.id(),
        })
    }

    /// Allocate a table of type `ty`, all slots null.
    pub fn create_table(&self, ty: TableType) -> Result<TableRef, RuntimeError> {
        let maximum = ty.maximum.unwrap_or(
            self.engine()
                .config()
                .default_max_table_elements
                .max(ty.initial),
        );
        let table = Table::new(TablePlan {
            initial: ty.initial,
            maximum,
        })?;
        Ok(TableRef {
            table: Arc::new(table),
            ty,
            compartment: self.id(),
        })
    }

    pub fn create_global(&self, ty: GlobalType, init: Value) -> Result<GlobalRef, RuntimeError> {
        let global = Global::new(ty.content, ty.mutable, init)?;
        Ok(GlobalRef {
            global: Arc::new(global),
            compartment: self.id(),
        })
    }

    /// Link, allocate, compile and initialize `module`.
    pub fn instantiate(
        &self,
        module: &Module,
        resolver: &dyn Resolver,
    ) -> Result<Instance, InstantiationError> {
        let name = module.name().unwrap_or("module").to_string();
        self.instantiate_named(module, &name, resolver)
    }

    /// Like [`Compartment::instantiate`], naming the instance in trap call
    /// stacks.
    pub fn instantiate_named(
        &self,
        module: &Module,
        name: &str,
        resolver: &dyn Resolver,
    ) -> Result<Instance, InstantiationError> {
        let info = &*module.inner;
        tracing::debug!(
            instance = name,
            imports = info.imports.len(),
            functions = info.bodies.len(),
            "instantiating"
        );

        let imports = self.link(module, resolver)?;

        let mut memories = imports.memories;
        for &ty in &info.memories {
            memories.push(self.create_memory(ty)?);
        }
        let mut tables = imports.tables;
        for &ty in &info.tables {
            tables.push(self.create_table(ty)?);
        }
        let mut globals = imports.globals;
        for def in &info.globals {
            let init = eval_global_init(def.init, &globals)?;
            globals.push(self.create_global(def.ty, init)?);
        }

        let engine = self.engine();
        let env = InstanceEnv {
            module: info,
            name,
            type_ids: info.types.iter().map(|ty| engine.type_id(ty)).collect(),
            imported_funcs: imports.funcs.iter().map(Func::code_ptr).collect(),
            memories: memories
                .iter()
                .map(|m| MemoryEnv {
                    memory: Arc::as_ptr(&m.memory),
                    definition: m.definition_ptr(),
                    base: m.base(),
                    elide_bounds_checks: m.is_guarded(),
                })
                .collect(),
            tables: tables.iter().map(|t| t.definition_ptr()).collect(),
            globals: globals
                .iter()
                .map(|g| GlobalEnv {
                    ty: g.ty().content,
                    slot: g.slot_ptr(),
                })
                .collect(),
        };
        let code = engine
            .compiler()
            .compile_instance(&env)
            .map_err(InstantiationError::Compile)?;

        let mut funcs = imports.funcs;
        for i in 0..info.bodies.len() {
            let index = info.num_imported_funcs + i as u32;
            let type_index = info.functions[index as usize];
            let func_name = module
                .function_name(index)
                .map(str::to_string)
                .unwrap_or_else(|| format!("func{index}"));
            funcs.push(Func::from_code(
                &self.inner,
                info.types[type_index as usize].clone(),
                code.function(i),
                code.trampoline(type_index as usize),
                format!("{name}!{func_name}"),
            ));
        }
        let data = Arc::new(InstanceData {
            code,
            memories: memories.iter().map(|m| Arc::clone(&m.memory)).collect(),
            tables: tables.iter().map(|t| Arc::clone(&t.table)).collect(),
            globals: globals.iter().map(|g| Arc::clone(&g.global)).collect(),
        });

        // Nothing has been written yet if this fails, so `data` can go.
        initialize_segments(info, &funcs, &memories, &tables, &globals)?;

        let exports = info
            .exports
            .iter()
            .map(|export| {
                let index = export.index as usize;
                let ext = match export.kind {
                    ExternKind::Func => Extern::Func(funcs[index].clone()),
                    ExternKind::Memory => Extern::Memory(memories[index].clone()),
                    ExternKind::Table => Extern::Table(tables[index].clone()),
                    ExternKind::Global => Extern::Global(globals[index].clone()),
                };
                (export.name.clone(), ext)
            })
            .collect::<HashMap<_, _>>();

        if let Some(start) = info.start {
            tracing::debug!(instance = name, start, "running start function");
            if let Err(err) = funcs[start as usize].call(&[]) {
                // Applied element segments may have put this instance's code
                // into tables that outlive it.
                if !info.elements.is_empty() {
                    self.inner.instances.lock().push(data);
                }
                return Err(match err {
                    InvokeError::Trap(trap) => InstantiationError::Start(trap),
                    other => InstantiationError::Compile(anyhow!(other)),
                });
            }
        }
        self.inner.instances.lock().push(data);

        tracing::info!(instance = name, exports = exports.len(), "instantiated module");
        Ok(Instance {
            name: name.to_string(),
            compartment: self.clone(),
            exports,
        })
    }

    /// Resolve every import, collecting all failures before giving up.
    fn link(&self, module: &Module, resolver: &dyn Resolver) -> Result<Imports, InstantiationError> {
        let mut imports = Imports::default();
        let mut errors = Vec::new();
        for import in &module.inner.imports {
            let expected = module.import_type(&import.ty);
            let linked = match resolver.resolve(self, &import.module, &import.name, &expected) {
                Some(ext) => self.check_import(ext, &expected, &import.module, &import.name),
                None => Err(ImportErrorKind::Unresolved),
            };
            match linked {
                Ok(Extern::Func(func)) => imports.funcs.push(func),
                Ok(Extern::Memory(memory)) => imports.memories.push(memory),
                Ok(Extern::Table(table)) => imports.tables.push(table),
                Ok(Extern::Global(global)) => imports.globals.push(global),
                Err(kind) => {
                    tracing::debug!(module = %import.module, name = %import.name, %kind, "import failed");
                    errors.push(ImportError {
                        module: import.module.clone(),
                        name: import.name.clone(),
                        kind,
                    });
                }
            }
        }
        if errors.is_empty() {
            Ok(imports)
        } else {
            Err(InstantiationError::Link(errors))
        }
    }

    /// Check a resolved object against the import's declared type. A
    /// function from another compartment is wrapped so calls re-enter
    /// through [`Func::call`].
    fn check_import(
        &self,
        ext: Extern,
        expected: &ExternType,
        module: &str,
        name: &str,
    ) -> Result<Extern, ImportErrorKind> {
        let found = ext.ty();
        if found.kind() != expected.kind() {
            return Err(ImportErrorKind::KindMismatch {
                expected: expected.kind(),
                found: found.kind(),
            });
        }
        let mismatch = || ImportErrorKind::TypeMismatch {
            expected: expected.clone(),
            found: found.clone(),
        };
        match (ext, expected) {
            (Extern::Func(func), ExternType::Func(ty)) => {
                if func.ty() != ty {
                    return Err(mismatch());
                }
                if func.compartment_id() == self.id() {
                    return Ok(Extern::Func(func));
                }
                self.wrap_foreign(func, module, name).map(Extern::Func)
            }
            (Extern::Memory(memory), ExternType::Memory(ty)) => {
                if memory.compartment != self.id() {
                    return Err(ImportErrorKind::ForeignCompartment);
                }
                let actual = memory.ty();
                if actual.shared != ty.shared
                    || !limits_match(actual.initial, actual.maximum, ty.initial, ty.maximum)
                {
                    return Err(mismatch());
                }
                Ok(Extern::Memory(memory))
            }
            (Extern::Table(table), ExternType::Table(ty)) => {
                if table.compartment != self.id() {
                    return Err(ImportErrorKind::ForeignCompartment);
                }
                let actual = table.ty();
                if !limits_match(actual.initial, actual.maximum, ty.initial, ty.maximum) {
                    return Err(mismatch());
                }
                Ok(Extern::Table(table))
            }
            (Extern::Global(global), ExternType::Global(ty)) => {
                if global.compartment != self.id() {
                    return Err(ImportErrorKind::ForeignCompartment);
                }
                if global.ty() != *ty {
                    return Err(mismatch());
                }
                Ok(Extern::Global(global))
            }
            _ => Err(mismatch()),
        }
    }

    fn wrap_foreign(&self, func: Func, module: &str, name: &str) -> Result<Func, ImportErrorKind> {
        let ty = func.ty().clone();
        let stub_name = format!("{module}.{name}");
        Func::wrap_host_named(self, &stub_name, ty, move |args| {
            func.call(args).map_err(|err| match err {
                InvokeError::Trap(trap) => trap.reason,
                _ => TrapReason::Unreachable,
            })
        })
        .map_err(|err| {
            tracing::warn!(import = %stub_name, "cannot wrap foreign function: {err:#}");
            ImportErrorKind::ForeignCompartment
        })
    }
}

impl std::fmt::Debug for Compartment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compartment")
            .field("id", &self.inner.id)
            .field("instances", &self.inner.instances.lock().len())
            .field("host_funcs", &self.inner.host_funcs.lock().len())
            .finish()
    }
}

fn eval_global_init(expr: ConstExpr, globals: &[GlobalRef]) -> Result<Value, InstantiationError> {
    Ok(match expr {
        ConstExpr::I32(v) => Value::I32(v),
        ConstExpr::I64(v) => Value::I64(v),
        ConstExpr::F32(bits) => Value::F32(f32::from_bits(bits)),
        ConstExpr::F64(bits) => Value::F64(f64::from_bits(bits)),
        ConstExpr::GlobalGet(index) => globals
            .get(index as usize)
            .map(|g| g.get())
            .ok_or_else(|| {
                InstantiationError::Compile(anyhow!("global.get {index} out of range"))
            })?,
        ConstExpr::RefFunc(_) | ConstExpr::RefNull => {
            return Err(InstantiationError::Compile(anyhow!(
                "reference-typed globals are not supported"
            )))
        }
    })
}

/// Evaluate a segment offset expression.
fn eval_offset(expr: ConstExpr, globals: &[GlobalRef]) -> Result<u64, InstantiationError> {
    match eval_global_init(expr, globals)? {
        Value::I32(v) => Ok(v as u32 as u64),
        other => Err(InstantiationError::Compile(anyhow!(
            "segment offset must be an i32, got {}",
            other.ty()
        ))),
    }
}

/// Bounds-check every active segment, then copy them in order.
fn initialize_segments(
    info: &ModuleInner,
    funcs: &[Func],
    memories: &[MemoryRef],
    tables: &[TableRef],
    globals: &[GlobalRef],
) -> Result<(), InstantiationError> {
    let mut element_offsets = Vec::with_capacity(info.elements.len());
    for (segment, elem) in info.elements.iter().enumerate() {
        let offset = eval_offset(elem.offset, globals)?;
        let len = elem.items.len() as u64;
        let size = tables[elem.table_index as usize].size() as u64;
        if offset + len > size {
            return Err(InstantiationError::SegmentOutOfBounds {
                kind: ExternKind::Table,
                segment,
                offset,
                len,
                size,
            });
        }
        element_offsets.push(offset);
    }
    let mut data_offsets = Vec::with_capacity(info.data.len());
    for (segment, data) in info.data.iter().enumerate() {
        let offset = eval_offset(data.offset, globals)?;
        let len = data.data.len() as u64;
        let size = memories[data.memory_index as usize].byte_len() as u64;
        if offset + len > size {
            return Err(InstantiationError::SegmentOutOfBounds {
                kind: ExternKind::Memory,
                segment,
                offset,
                len,
                size,
            });
        }
        data_offsets.push(offset);
    }

    for (elem, offset) in info.elements.iter().zip(element_offsets) {
        let entries: Vec<FuncRef> = elem
            .items
            .iter()
            .map(|item| match item {
                Some(index) => funcs[*index as usize].func_ref(),
                None => FuncRef::NULL,
            })
            .collect();
        tables[elem.table_index as usize]
            .init_elements(offset as u32, &entries)
            .map_err(|reason| InstantiationError::Compile(anyhow!("element segment: {reason}")))?;
    }
    for (data, offset) in info.data.iter().zip(data_offsets) {
        memories[data.memory_index as usize]
            .init_data(offset as usize, &data.data)
            .map_err(|reason| InstantiationError::Compile(anyhow!("data segment: {reason}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::resolver::MapResolver;
    use crate::types::FuncType;
    use wasmjet_runtime::ValType;

    fn compartment() -> Compartment {
        Compartment::new(&Engine::new(EngineConfig::default()).unwrap())
    }

    #[test]
    fn compartment_ids_are_unique() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        assert_ne!(Compartment::new(&engine).id(), Compartment::new(&engine).id());
    }

    #[test]
    fn unbounded_memory_gets_engine_ceiling() {
        let engine = Engine::new(EngineConfig {
            guard_page_elision: false,
            default_max_memory_pages: 4,
            ..EngineConfig::default()
        })
        .unwrap();
        let compartment = Compartment::new(&engine);
        let memory = compartment
            .create_memory(MemoryType {
                initial: 1,
                maximum: None,
                shared: false,
            })
            .unwrap();
        assert_eq!(memory.maximum(), 4);
        assert!(!memory.is_guarded());
        assert_eq!(memory.ty().maximum, None);
    }

    #[test]
    fn global_init_from_imported_global() {
        let compartment = compartment();
        let imported = compartment
            .create_global(
                GlobalType {
                    content: ValType::I64,
                    mutable: false,
                },
                Value::I64(99),
            )
            .unwrap();
        let value = eval_global_init(ConstExpr::GlobalGet(0), &[imported]).unwrap();
        assert_eq!(value, Value::I64(99));
        assert_eq!(
            eval_global_init(ConstExpr::F32(1.5f32.to_bits()), &[]).unwrap(),
            Value::F32(1.5)
        );
    }

    #[test]
    fn link_reports_every_failure() {
        let compartment = compartment();
        let module = Module::from_text(
            r#"(module
                (import "env" "missing" (func))
                (import "env" "g" (global i32))
                (import "env" "f" (func (param i32))))"#,
        )
        .unwrap();
        let mut resolver = MapResolver::new();
        let g = compartment
            .create_global(
                GlobalType {
                    content: ValType::I64,
                    mutable: false,
                },
                Value::I64(0),
            )
            .unwrap();
        resolver.define("env", "g", g);
        let f = Func::wrap_host(&compartment, FuncType::new([], []), |_| Ok(vec![])).unwrap();
        resolver.define("env", "f", f);

        match compartment.instantiate(&module, &resolver) {
            Err(InstantiationError::Link(errors)) => {
                assert_eq!(errors.len(), 3);
                assert_eq!(errors[0].kind, ImportErrorKind::Unresolved);
                assert!(matches!(errors[1].kind, ImportErrorKind::TypeMismatch { .. }));
                assert!(matches!(errors[2].kind, ImportErrorKind::TypeMismatch { .. }));
            }
            other => panic!("expected link errors, got {other:?}"),
        }
    }

    fn instance_count(compartment: &Compartment) -> usize {
        compartment.inner.instances.lock().len()
    }

    #[test]
    fn failed_instantiation_is_not_retained() {
        let compartment = compartment();
        let oob_data =
            Module::from_text(r#"(module (memory 1) (data (i32.const 65535) "ab"))"#).unwrap();
        assert!(matches!(
            compartment.instantiate(&oob_data, &MapResolver::new()),
            Err(InstantiationError::SegmentOutOfBounds { .. })
        ));
        assert_eq!(instance_count(&compartment), 0);

        let trapping_start =
            Module::from_text(r#"(module (func $boom (unreachable)) (start $boom))"#).unwrap();
        assert!(matches!(
            compartment.instantiate(&trapping_start, &MapResolver::new()),
            Err(InstantiationError::Start(_))
        ));
        assert_eq!(instance_count(&compartment), 0);

        let ok = Module::from_text(r#"(module (func (export "f")))"#).unwrap();
        compartment.instantiate(&ok, &MapResolver::new()).unwrap();
        assert_eq!(instance_count(&compartment), 1);
    }

    #[test]
    fn trapping_start_keeps_code_referenced_by_tables() {
        let compartment = compartment();
        let lib = compartment
            .instantiate(
                &Module::from_text(r#"(module (table (export "table") 1 funcref))"#).unwrap(),
                &MapResolver::new(),
            )
            .unwrap();
        let mut resolver = MapResolver::new();
        resolver.define("env", "table", lib.table("table").unwrap());
        let module = Module::from_text(
            r#"(module
                (import "env" "table" (table 1 funcref))
                (elem (i32.const 0) $seven)
                (func $seven (result i32) (i32.const 7))
                (func $boom (unreachable))
                (start $boom))"#,
        )
        .unwrap();
        assert!(matches!(
            compartment.instantiate(&module, &resolver),
            Err(InstantiationError::Start(_))
        ));
        assert_eq!(instance_count(&compartment), 2);
        assert!(!lib.table("table").unwrap().get(0).unwrap().is_null());
    }

    #[test]
    fn imported_globals_are_shared_with_guest_code() {
        let compartment = compartment();
        let scale = compartment
            .create_global(
                GlobalType {
                    content: ValType::F64,
                    mutable: true,
                },
                Value::F64(1.5),
            )
            .unwrap();
        let mut resolver = MapResolver::new();
        resolver.define("env", "scale", scale.clone());
        let instance = compartment
            .instantiate(
                &Module::from_text(
                    r#"(module
                        (import "env" "scale" (global $scale (mut f64)))
                        (func (export "double_scale") (result f64)
                          (global.set $scale (f64.mul (global.get $scale) (f64.const 2)))
                          (global.get $scale)))"#,
                )
                .unwrap(),
                &resolver,
            )
            .unwrap();
        assert_eq!(instance.invoke("double_scale", &[]).unwrap(), [Value::F64(3.0)]);
        assert_eq!(scale.get(), Value::F64(3.0));
    }

    #[test]
    fn foreign_memory_is_rejected() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let home = Compartment::new(&engine);
        let away = Compartment::new(&engine);
        let memory = away
            .create_memory(MemoryType {
                initial: 1,
                maximum: Some(1),
                shared: false,
            })
            .unwrap();
        let module = Module::from_text(r#"(module (import "env" "mem" (memory 1)))"#).unwrap();
        let mut resolver = MapResolver::new();
        resolver.define("env", "mem", memory);
        match home.instantiate(&module, &resolver) {
            Err(InstantiationError::Link(errors)) => {
                assert_eq!(errors[0].kind, ImportErrorKind::ForeignCompartment);
            }
            other => panic!("expected link error, got {other:?}"),
        }
    }
}
