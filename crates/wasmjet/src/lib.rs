//! wasmjet: a WebAssembly JIT execution engine.
//!
//! Modules are decoded and validated by [`Module`], linked against a
//! [`Resolver`] and compiled to native code by [`Compartment::instantiate`],
//! then called through [`Func::call`] / [`Instance::invoke`]. Guest code runs
//! directly on the calling thread; traps and hardware faults inside it come
//! back as a [`Trap`] with the guest call stack.
//!
//! # Example
//! ```no_run
//! use wasmjet::{Compartment, Engine, EngineConfig, Module, NullResolver, Value};
//!
//! let engine = Engine::new(EngineConfig::default())?;
//! let module = Module::from_text(
//!     r#"(module (func (export "add") (param i32 i32) (result i32)
//!         local.get 0 local.get 1 i32.add))"#,
//! )?;
//! let compartment = Compartment::new(&engine);
//! let instance = compartment.instantiate(&module, &NullResolver)?;
//! assert_eq!(instance.invoke("add", &[Value::I32(2), Value::I32(3)])?, [Value::I32(5)]);
//! # Ok::<(), anyhow::Error>(())
//! ```

mod codegen;
mod compartment;
mod config;
mod engine;
mod error;
mod func;
mod instance;
mod invoke;
mod module;
mod resolver;
mod types;

pub use compartment::Compartment;
pub use config::{EngineConfig, OptLevel};
pub use engine::Engine;
pub use error::{ImportError, ImportErrorKind, ImportErrors, InstantiationError, InvokeError};
pub use func::Func;
pub use instance::{Extern, GlobalRef, Instance, MemoryRef, TableRef};
pub use invoke::invoke;
pub use module::Module;
pub use resolver::{
    register_intrinsic, InstanceResolver, IntrinsicResolver, MapResolver, NullResolver, Resolver,
    StubResolver,
};
pub use types::{ExternKind, ExternType, FuncType, GlobalType, MemoryType, TableType, ValType};

pub use wasmjet_runtime::{platform, CallStack, Frame, Trap, TrapReason, Value};
