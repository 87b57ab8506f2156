//! Function instances: compiled guest functions and host functions.

use crate::codegen::{CodeObject, Trampoline};
use crate::compartment::{Compartment, CompartmentInner};
use crate::error::InvokeError;
use crate::types::FuncType;
use anyhow::{Context as _, Result};
use std::fmt;
use std::sync::Arc;
use wasmjet_runtime::libcalls::HostContext;
use wasmjet_runtime::{FuncRef, TrapReason, Value};

/// A host function together with its compiled stub.
///
/// The stub has the context's address baked in, so both are dropped
/// together with the compartment that owns them.
pub(crate) struct HostFuncData {
    pub code: CodeObject,
    pub context: Box<HostContext>,
}

pub(crate) struct FuncInner {
    ty: FuncType,
    type_id: u32,
    code: *const u8,
    trampoline: Trampoline,
    name: String,
    /// Owns the code `code` points into.
    compartment: Arc<CompartmentInner>,
}

// SAFETY: `code` and `trampoline` point at finalized machine code that is
// never written again and lives as long as `compartment`.
unsafe impl Send for FuncInner {}
// SAFETY: see above.
unsafe impl Sync for FuncInner {}

/// A callable function: a signature paired with a native entry point.
/// Cheap to clone.
#[derive(Clone)]
pub struct Func {
    pub(crate) inner: Arc<FuncInner>,
}

impl Func {
    pub(crate) fn from_code(
        compartment: &Arc<CompartmentInner>,
        ty: FuncType,
        code: *const u8,
        trampoline: Trampoline,
        name: String,
    ) -> Self {
        let type_id = compartment.engine.type_id(&ty);
        Self {
            inner: Arc::new(FuncInner {
                ty,
                type_id,
                code,
                trampoline,
                name,
                compartment: Arc::clone(compartment),
            }),
        }
    }

    /// Wrap a Rust closure as a function living in `compartment`.
    pub fn wrap_host<F>(compartment: &Compartment, ty: FuncType, func: F) -> Result<Func>
    where
        F: Fn(&[Value]) -> Result<Vec<Value>, TrapReason> + Send + Sync + 'static,
    {
        Self::wrap_host_named(compartment, "host", ty, func)
    }

    /// Like [`Func::wrap_host`], naming the function in trap call stacks.
    pub fn wrap_host_named<F>(
        compartment: &Compartment,
        name: &str,
        ty: FuncType,
        func: F,
    ) -> Result<Func>
    where
        F: Fn(&[Value]) -> Result<Vec<Value>, TrapReason> + Send + Sync + 'static,
    {
        let context = Box::new(HostContext {
            name: name.to_string(),
            params: ty.params().to_vec(),
            results: ty.results().to_vec(),
            func: Box::new(func),
        });
        let code = compartment
            .engine()
            .compiler()
            .compile_host(&ty, &*context)
            .with_context(|| format!("compiling host function '{name}'"))?;
        let entry = code.function(0);
        let trampoline = code.trampoline(0);
        compartment
            .inner
            .host_funcs
            .lock()
            .push(HostFuncData { code, context });
        tracing::debug!(name, %ty, "wrapped host function");
        Ok(Self::from_code(
            &compartment.inner,
            ty,
            entry,
            trampoline,
            name.to_string(),
        ))
    }

    pub fn ty(&self) -> &FuncType {
        &self.inner.ty
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Call the function with `args`, under trap protection.
    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>, InvokeError> {
        crate::invoke::invoke(self, args)
    }

    pub(crate) fn code_ptr(&self) -> *const u8 {
        self.inner.code
    }

    pub(crate) fn trampoline(&self) -> Trampoline {
        self.inner.trampoline
    }

    pub(crate) fn compartment_id(&self) -> u64 {
        self.inner.compartment.id
    }

    /// Table entry referring to this function.
    pub(crate) fn func_ref(&self) -> FuncRef {
        FuncRef::new(self.inner.type_id, self.inner.code)
    }
}

impl fmt::Debug for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Func")
            .field("name", &self.inner.name)
            .field("ty", &self.inner.ty)
            .field("compartment", &self.inner.compartment.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use wasmjet_runtime::ValType;

    fn compartment() -> Compartment {
        Compartment::new(&Engine::new(EngineConfig::default()).unwrap())
    }

    #[test]
    fn host_function_round_trip() {
        let compartment = compartment();
        let func = Func::wrap_host(
            &compartment,
            FuncType::new([ValType::I32, ValType::I32], [ValType::I32]),
            |args| match args {
                [Value::I32(a), Value::I32(b)] => Ok(vec![Value::I32(a.wrapping_mul(*b))]),
                _ => Err(TrapReason::Unreachable),
            },
        )
        .unwrap();
        assert_eq!(
            func.call(&[Value::I32(6), Value::I32(7)]).unwrap(),
            vec![Value::I32(42)]
        );
    }

    #[test]
    fn host_function_multi_value() {
        let compartment = compartment();
        let func = Func::wrap_host(
            &compartment,
            FuncType::new([ValType::I64], [ValType::I64, ValType::F32, ValType::I32]),
            |args| {
                let v = args[0].as_i64().unwrap_or(0);
                Ok(vec![Value::I64(v + 1), Value::F32(1.5), Value::I32(-1)])
            },
        )
        .unwrap();
        assert_eq!(
            func.call(&[Value::I64(41)]).unwrap(),
            vec![Value::I64(42), Value::F32(1.5), Value::I32(-1)]
        );
    }

    #[test]
    fn host_trap_is_reported() {
        let compartment = compartment();
        let func = Func::wrap_host_named(
            &compartment,
            "boom",
            FuncType::new([], []),
            |_| Err(TrapReason::IntegerDivideByZeroOrOverflow),
        )
        .unwrap();
        let err = func.call(&[]).unwrap_err();
        assert_eq!(
            err.trap().unwrap().reason,
            TrapReason::IntegerDivideByZeroOrOverflow
        );
    }

    #[test]
    fn same_signature_same_type_id() {
        let compartment = compartment();
        let ty = FuncType::new([ValType::F64], [ValType::F64]);
        let a = Func::wrap_host(&compartment, ty.clone(), |args| Ok(args.to_vec())).unwrap();
        let b = Func::wrap_host(&compartment, ty, |args| Ok(args.to_vec())).unwrap();
        assert_eq!(a.func_ref().type_id, b.func_ref().type_id);
        assert_ne!(a.code_ptr(), b.code_ptr());
        assert_eq!(a.func_ref().type_id, a.inner.type_id);
    }
}
