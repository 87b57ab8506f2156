//! The engine: configuration, the native code generator and the registry of
//! function types shared by every compartment created from it.

use crate::codegen::Compiler;
use crate::config::EngineConfig;
use crate::types::FuncType;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use wasmjet_runtime::platform::{self, Mutex};

/// Interns function types into small ids. Equal ids mean identical
/// signatures, which is all `call_indirect` compares at run time.
///
/// Id 0 is never handed out; table slots use it for null.
#[derive(Debug, Default)]
pub(crate) struct TypeRegistry {
    ids: HashMap<FuncType, u32>,
}

impl TypeRegistry {
    pub fn intern(&mut self, ty: &FuncType) -> u32 {
        if let Some(&id) = self.ids.get(ty) {
            return id;
        }
        let id = self.ids.len() as u32 + 1;
        self.ids.insert(ty.clone(), id);
        id
    }
}

#[derive(Debug)]
pub(crate) struct EngineInner {
    pub config: EngineConfig,
    pub compiler: Compiler,
    types: Mutex<TypeRegistry>,
}

/// Shared compilation context. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine for the host machine and install the process-wide
    /// fault handlers.
    pub fn new(config: EngineConfig) -> Result<Self> {
        platform::init();
        let compiler = Compiler::new(&config)?;
        tracing::debug!(?config, "created engine");
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                compiler,
                types: Mutex::new(TypeRegistry::default()),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Engine-wide id of a function type.
    pub(crate) fn type_id(&self, ty: &FuncType) -> u32 {
        self.inner.types.lock().intern(ty)
    }

    pub(crate) fn compiler(&self) -> &Compiler {
        &self.inner.compiler
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmjet_runtime::ValType;

    #[test]
    fn type_ids_are_structural() {
        let mut registry = TypeRegistry::default();
        let a = registry.intern(&FuncType::new([ValType::I32], [ValType::I32]));
        let b = registry.intern(&FuncType::new([ValType::I64], []));
        let c = registry.intern(&FuncType::new([ValType::I32], [ValType::I32]));
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(a, c);
        assert_eq!(registry.ids.len(), 2);
    }

    #[test]
    fn engine_clones_share_types() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let clone = engine.clone();
        let ty = FuncType::new([], [ValType::F64]);
        assert_eq!(engine.type_id(&ty), clone.type_id(&ty));
        assert!(Arc::ptr_eq(&engine.inner, &clone.inner));
    }
}
