//! Import resolution.
//!
//! A [`Resolver`] maps `(module, name, expected type)` to an object. The
//! instantiator checks kinds and types of whatever comes back, so resolvers
//! only need to find candidates. Resolvers compose: a tuple `(a, b)` asks
//! `a` first and falls back to `b`.

use crate::compartment::Compartment;
use crate::func::Func;
use crate::instance::{Extern, Instance};
use crate::types::{ExternType, FuncType};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use wasmjet_runtime::libcalls::HostFn;
use wasmjet_runtime::platform::Mutex;
use wasmjet_runtime::{TrapReason, Value};

pub trait Resolver {
    /// Find the object imported as `module.name`. `compartment` is where the
    /// importing instance lives; resolvers that create objects create them
    /// there.
    fn resolve(
        &self,
        compartment: &Compartment,
        module: &str,
        name: &str,
        ty: &ExternType,
    ) -> Option<Extern>;
}

impl<R: Resolver + ?Sized> Resolver for &R {
    fn resolve(
        &self,
        compartment: &Compartment,
        module: &str,
        name: &str,
        ty: &ExternType,
    ) -> Option<Extern> {
        (**self).resolve(compartment, module, name, ty)
    }
}

impl<A: Resolver, B: Resolver> Resolver for (A, B) {
    fn resolve(
        &self,
        compartment: &Compartment,
        module: &str,
        name: &str,
        ty: &ExternType,
    ) -> Option<Extern> {
        self.0
            .resolve(compartment, module, name, ty)
            .or_else(|| self.1.resolve(compartment, module, name, ty))
    }
}

/// Resolves nothing. Enough for modules without imports.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullResolver;

impl Resolver for NullResolver {
    fn resolve(&self, _: &Compartment, _: &str, _: &str, _: &ExternType) -> Option<Extern> {
        None
    }
}

/// Explicit registry of objects keyed by module and name.
#[derive(Debug, Clone, Default)]
pub struct MapResolver {
    entries: HashMap<(String, String), Extern>,
}

impl MapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, module: &str, name: &str, ext: impl Into<Extern>) -> &mut Self {
        self.entries
            .insert((module.to_string(), name.to_string()), ext.into());
        self
    }
}

impl Resolver for MapResolver {
    fn resolve(&self, _: &Compartment, module: &str, name: &str, _: &ExternType) -> Option<Extern> {
        self.entries
            .get(&(module.to_string(), name.to_string()))
            .cloned()
    }
}

/// Resolves `module.name` to export `name` of the instance registered as
/// `module`.
#[derive(Debug, Clone, Default)]
pub struct InstanceResolver {
    instances: HashMap<String, Instance>,
}

impl InstanceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: &str, instance: Instance) -> &mut Self {
        self.instances.insert(module.to_string(), instance);
        self
    }
}

impl Resolver for InstanceResolver {
    fn resolve(&self, _: &Compartment, module: &str, name: &str, _: &ExternType) -> Option<Extern> {
        self.instances.get(module)?.export(name)
    }
}

struct Intrinsic {
    ty: FuncType,
    func: Arc<HostFn>,
}

fn intrinsics() -> &'static Mutex<HashMap<(String, String), Intrinsic>> {
    static INTRINSICS: OnceLock<Mutex<HashMap<(String, String), Intrinsic>>> = OnceLock::new();
    INTRINSICS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a process-wide host function that [`IntrinsicResolver`] hands
/// out as `module.name`. Replaces any earlier registration.
pub fn register_intrinsic<F>(module: &str, name: &str, ty: FuncType, func: F)
where
    F: Fn(&[Value]) -> Result<Vec<Value>, TrapReason> + Send + Sync + 'static,
{
    tracing::debug!(module, name, %ty, "registered intrinsic");
    intrinsics().lock().insert(
        (module.to_string(), name.to_string()),
        Intrinsic {
            ty,
            func: Arc::new(func),
        },
    );
}

/// Resolves functions from the process-wide intrinsic registry. Each
/// resolution compiles a fresh stub in the importing compartment.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntrinsicResolver;

impl Resolver for IntrinsicResolver {
    fn resolve(
        &self,
        compartment: &Compartment,
        module: &str,
        name: &str,
        _: &ExternType,
    ) -> Option<Extern> {
        let (ty, func) = {
            let registry = intrinsics().lock();
            let intrinsic = registry.get(&(module.to_string(), name.to_string()))?;
            (intrinsic.ty.clone(), Arc::clone(&intrinsic.func))
        };
        let label = format!("{module}.{name}");
        match Func::wrap_host_named(compartment, &label, ty, move |args| func(args)) {
            Ok(func) => Some(Extern::Func(func)),
            Err(err) => {
                tracing::warn!(intrinsic = %label, "cannot instantiate intrinsic: {err:#}");
                None
            }
        }
    }
}

/// Falls back to synthesized stand-ins for imports the wrapped resolver
/// cannot find: functions that trap when called, and fresh memories,
/// tables and globals of the declared type.
///
/// Meant for debugging and fuzzing; a stubbed module is not guaranteed to
/// behave as intended.
#[derive(Debug, Clone, Default)]
pub struct StubResolver<R> {
    inner: R,
}

impl<R: Resolver> StubResolver<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    fn stub(&self, compartment: &Compartment, module: &str, name: &str, ty: &ExternType) -> Option<Extern> {
        let label = format!("{module}.{name}");
        let stub = match ty {
            ExternType::Func(ty) => Func::wrap_host_named(compartment, &label, ty.clone(), |_| {
                Err(TrapReason::Unreachable)
            })
            .map(Extern::Func),
            ExternType::Memory(ty) => compartment
                .create_memory(*ty)
                .map(Extern::Memory)
                .map_err(Into::into),
            ExternType::Table(ty) => compartment
                .create_table(*ty)
                .map(Extern::Table)
                .map_err(Into::into),
            ExternType::Global(ty) => compartment
                .create_global(*ty, Value::default_for(ty.content))
                .map(Extern::Global)
                .map_err(Into::into),
        };
        match stub {
            Ok(ext) => {
                tracing::warn!(import = %label, ty = %ty, "stubbed unresolved import");
                Some(ext)
            }
            Err(err) => {
                tracing::warn!(import = %label, "cannot stub import: {err:#}");
                None
            }
        }
    }
}

impl<R: Resolver> Resolver for StubResolver<R> {
    fn resolve(
        &self,
        compartment: &Compartment,
        module: &str,
        name: &str,
        ty: &ExternType,
    ) -> Option<Extern> {
        self.inner
            .resolve(compartment, module, name, ty)
            .or_else(|| self.stub(compartment, module, name, ty))
    }
}
