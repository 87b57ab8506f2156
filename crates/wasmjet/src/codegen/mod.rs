//! Native code generation.
//!
//! Every instance gets its own JIT code object holding the machine code of
//! its defined functions plus one entry trampoline per signature. Compiled
//! code reaches runtime objects (memories, tables, globals, libcalls) through
//! absolute addresses baked in at compile time, which is why compilation
//! happens after the instance's runtime objects have been allocated.
//!
//! Calling convention of compiled functions: the native default call
//! convention with Wasm parameters mapped one to one. A function with at
//! most one result returns it in registers; a function with more results
//! takes a trailing pointer to a results area with one 8-byte slot per
//! result instead.

mod calls;
mod emitter;
mod memory;
mod numeric;
mod translate;

use crate::config::EngineConfig;
use crate::module::ModuleInner;
use crate::types::FuncType;
use anyhow::{anyhow, Context as _, Result};
use cranelift_codegen::ir::{
    types, AbiParam, InstBuilder, MemFlags, Signature, StackSlotData, StackSlotKind,
    Type, UserFuncName, Value,
};
use cranelift_codegen::isa::OwnedTargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module as _};
use emitter::FunctionEmitter;
use wasmjet_runtime::libcalls::HostContext;
use wasmjet_runtime::{registry, Memory, MemoryDefinition, TableDefinition, ValType};

/// Signature of an entry trampoline: `fn(callee, values)`.
///
/// Arguments are read from `values`, then results are written back over
/// them, one 8-byte slot per value.
pub(crate) type Trampoline = unsafe extern "C" fn(callee: *const u8, values: *mut u64);

/// A linear memory as seen by compiled code.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MemoryEnv {
    pub memory: *const Memory,
    pub definition: *const MemoryDefinition,
    pub base: *mut u8,
    /// Accesses may skip inline bounds checks.
    pub elide_bounds_checks: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct GlobalEnv {
    pub ty: ValType,
    pub slot: *mut u64,
}

/// Everything about a linked instance that compiled code depends on.
pub(crate) struct InstanceEnv<'a> {
    pub module: &'a ModuleInner,
    /// Prefix used to symbolicate this instance's functions.
    pub name: &'a str,
    /// Engine-wide signature id of each entry in the type section.
    pub type_ids: Vec<u32>,
    /// Code pointers of imported functions, in import order.
    pub imported_funcs: Vec<*const u8>,
    pub memories: Vec<MemoryEnv>,
    pub tables: Vec<*const TableDefinition>,
    pub globals: Vec<GlobalEnv>,
}

impl InstanceEnv<'_> {
    pub fn func_type(&self, func_index: u32) -> &FuncType {
        let type_index = self.module.functions[func_index as usize];
        &self.module.types[type_index as usize]
    }

    pub fn num_imported_funcs(&self) -> u32 {
        self.module.num_imported_funcs
    }
}

/// Machine code owned by one instance or host function.
///
/// Dropping it unregisters the code from the symbolication registry and
/// releases the executable memory, so it must outlive every call into it.
pub(crate) struct CodeObject {
    module: Option<JITModule>,
    /// Entry points of the compiled functions, in definition order.
    functions: Vec<*const u8>,
    /// Entry trampolines, one per compiled signature.
    trampolines: Vec<*const u8>,
    registered: Vec<usize>,
}

// SAFETY: after finalization the code object is only read; the raw pointers
// refer to executable memory owned by `module`.
unsafe impl Send for CodeObject {}
// SAFETY: see above.
unsafe impl Sync for CodeObject {}

impl CodeObject {
    pub fn function(&self, index: usize) -> *const u8 {
        self.functions[index]
    }

    pub fn trampoline(&self, index: usize) -> Trampoline {
        // SAFETY: every entry was compiled with the trampoline signature.
        unsafe { std::mem::transmute::<*const u8, Trampoline>(self.trampolines[index]) }
    }
}

impl Drop for CodeObject {
    fn drop(&mut self) {
        for start in self.registered.drain(..) {
            registry::unregister_function(start);
        }
        if let Some(module) = self.module.take() {
            // SAFETY: the owner guarantees no frame can return into this code.
            unsafe { module.free_memory() };
        }
    }
}

impl std::fmt::Debug for CodeObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeObject")
            .field("functions", &self.functions.len())
            .field("trampolines", &self.trampolines.len())
            .finish()
    }
}

pub(crate) struct Compiler {
    isa: OwnedTargetIsa,
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler")
            .field("triple", &self.isa.triple().to_string())
            .finish()
    }
}

impl Compiler {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let mut flags = settings::builder();
        flags
            .set("opt_level", config.opt_level.as_setting())
            .context("setting opt_level")?;
        // Frame pointers let the fault layer walk guest frames.
        flags
            .set("preserve_frame_pointers", "true")
            .context("setting preserve_frame_pointers")?;
        flags
            .set("enable_probestack", "true")
            .context("setting enable_probestack")?;
        flags
            .set("probestack_strategy", "inline")
            .context("setting probestack_strategy")?;
        flags.set("is_pic", "false").context("setting is_pic")?;
        flags
            .set("use_colocated_libcalls", "false")
            .context("setting use_colocated_libcalls")?;

        let isa_builder = cranelift_native::builder()
            .map_err(|msg| anyhow!("host machine is not supported: {msg}"))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flags))
            .context("building target ISA")?;
        tracing::debug!(triple = %isa.triple(), opt_level = %config.opt_level, "created compiler");
        Ok(Self { isa })
    }

    pub fn pointer_type(&self) -> Type {
        self.isa.pointer_type()
    }

    /// Native signature of a Wasm function of type `ty`.
    pub fn wasm_signature(&self, ty: &FuncType) -> Signature {
        let mut sig = Signature::new(self.isa.default_call_conv());
        sig.params
            .extend(ty.params().iter().map(|&p| AbiParam::new(ir_type(p))));
        if ty.results().len() <= 1 {
            sig.returns
                .extend(ty.results().iter().map(|&r| AbiParam::new(ir_type(r))));
        } else {
            sig.params.push(AbiParam::new(self.pointer_type()));
        }
        sig
    }

    fn trampoline_signature(&self) -> Signature {
        let ptr = self.pointer_type();
        let mut sig = Signature::new(self.isa.default_call_conv());
        sig.params.push(AbiParam::new(ptr));
        sig.params.push(AbiParam::new(ptr));
        sig
    }

    fn new_module(&self) -> JITModule {
        let builder =
            JITBuilder::with_isa(self.isa.clone(), cranelift_module::default_libcall_names());
        JITModule::new(builder)
    }

    /// Compile every defined function of an instance, plus one trampoline
    /// per entry of its type section.
    pub fn compile_instance(&self, env: &InstanceEnv) -> Result<CodeObject> {
        let module_info = env.module;
        let mut jit = self.new_module();
        let mut fb_ctx = FunctionBuilderContext::new();
        let mut ctx = jit.make_context();

        let num_imported = env.num_imported_funcs();
        let mut func_ids = Vec::with_capacity(module_info.bodies.len());
        for i in 0..module_info.bodies.len() as u32 {
            let index = num_imported + i;
            let sig = self.wasm_signature(env.func_type(index));
            let id = jit
                .declare_function(&format!("func{index}"), Linkage::Local, &sig)
                .with_context(|| format!("declaring function {index}"))?;
            func_ids.push(id);
        }

        let mut sizes = Vec::with_capacity(func_ids.len());
        for (i, body) in module_info.bodies.iter().enumerate() {
            let index = num_imported + i as u32;
            let ty = env.func_type(index);
            ctx.func.signature = self.wasm_signature(ty);
            ctx.func.name = UserFuncName::user(0, index);
            {
                let builder = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);
                let emitter = FunctionEmitter::new(self, env, &mut jit, &func_ids, builder, ty);
                emitter
                    .translate(body)
                    .with_context(|| format!("translating function {index}"))?;
            }
            jit.define_function(func_ids[i], &mut ctx)
                .map_err(|e| anyhow!("{e:?}"))
                .with_context(|| format!("compiling function {index}"))?;
            sizes.push(code_size(&ctx));
            tracing::trace!(index, size = sizes[i], "compiled function");
            jit.clear_context(&mut ctx);
        }

        let mut trampoline_ids = Vec::with_capacity(module_info.types.len());
        for (i, ty) in module_info.types.iter().enumerate() {
            let id = self.define_trampoline(&mut jit, &mut ctx, &mut fb_ctx, ty, i)?;
            trampoline_ids.push(id);
        }

        jit.finalize_definitions()
            .map_err(|e| anyhow!("{e:?}"))
            .context("finalizing instance code")?;

        let functions: Vec<*const u8> = func_ids
            .iter()
            .map(|&id| jit.get_finalized_function(id))
            .collect();
        let trampolines = trampoline_ids
            .iter()
            .map(|&id| jit.get_finalized_function(id))
            .collect();

        let mut registered = Vec::with_capacity(functions.len());
        for (i, (&ptr, &size)) in functions.iter().zip(&sizes).enumerate() {
            let index = num_imported + i as u32;
            let func_name = module_info
                .function_names
                .get(&index)
                .cloned()
                .unwrap_or_else(|| format!("func{index}"));
            registry::register_function(ptr as usize, size, format!("{}!{func_name}", env.name));
            registered.push(ptr as usize);
        }

        tracing::debug!(
            instance = env.name,
            functions = functions.len(),
            "compiled instance"
        );
        Ok(CodeObject {
            module: Some(jit),
            functions,
            trampolines,
            registered,
        })
    }

    /// Compile the native-ABI stub and trampoline for a host function.
    ///
    /// `context` must stay alive for as long as the returned code does.
    pub fn compile_host(&self, ty: &FuncType, context: *const HostContext) -> Result<CodeObject> {
        let mut jit = self.new_module();
        let mut fb_ctx = FunctionBuilderContext::new();
        let mut ctx = jit.make_context();

        let sig = self.wasm_signature(ty);
        let stub_id = jit
            .declare_function("host_stub", Linkage::Local, &sig)
            .context("declaring host stub")?;
        ctx.func.signature = sig;
        {
            let builder = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);
            calls::build_host_stub(self, builder, ty, context);
        }
        jit.define_function(stub_id, &mut ctx)
            .map_err(|e| anyhow!("{e:?}"))
            .context("compiling host stub")?;
        let size = code_size(&ctx);
        jit.clear_context(&mut ctx);

        let trampoline_id = self.define_trampoline(&mut jit, &mut ctx, &mut fb_ctx, ty, 0)?;
        jit.finalize_definitions()
            .map_err(|e| anyhow!("{e:?}"))
            .context("finalizing host stub")?;

        let stub = jit.get_finalized_function(stub_id);
        let trampoline = jit.get_finalized_function(trampoline_id);
        // SAFETY: the caller keeps `context` alive with the code.
        let name = unsafe { (*context).name.clone() };
        registry::register_function(stub as usize, size, format!("host!{name}"));
        Ok(CodeObject {
            module: Some(jit),
            functions: vec![stub],
            trampolines: vec![trampoline],
            registered: vec![stub as usize],
        })
    }

    fn define_trampoline(
        &self,
        jit: &mut JITModule,
        ctx: &mut Context,
        fb_ctx: &mut FunctionBuilderContext,
        ty: &FuncType,
        index: usize,
    ) -> Result<FuncId> {
        let sig = self.trampoline_signature();
        let id = jit
            .declare_function(&format!("trampoline{index}"), Linkage::Local, &sig)
            .with_context(|| format!("declaring trampoline {index}"))?;
        ctx.func.signature = sig;
        {
            let builder = FunctionBuilder::new(&mut ctx.func, fb_ctx);
            self.build_trampoline(builder, ty);
        }
        jit.define_function(id, ctx)
            .map_err(|e| anyhow!("{e:?}"))
            .with_context(|| format!("compiling trampoline for {ty}"))?;
        jit.clear_context(ctx);
        Ok(id)
    }

    /// Load the arguments from the values array, call the target with the
    /// native signature and store the results back.
    fn build_trampoline(&self, mut builder: FunctionBuilder, ty: &FuncType) {
        let ptr = self.pointer_type();
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        builder.seal_block(entry);

        let (callee, values) = {
            let params = builder.block_params(entry);
            (params[0], params[1])
        };

        let mut args: Vec<Value> = ty
            .params()
            .iter()
            .enumerate()
            .map(|(i, &p)| load_slot(&mut builder, p, values, slot_offset(i)))
            .collect();
        let ret_area = (ty.results().len() > 1).then(|| {
            let area = results_area(&mut builder, ptr, ty.results().len());
            args.push(area);
            area
        });

        let sig_ref = builder.import_signature(self.wasm_signature(ty));
        let call = builder.ins().call_indirect(sig_ref, callee, &args);
        let results: Vec<Value> = match ret_area {
            Some(area) => ty
                .results()
                .iter()
                .enumerate()
                .map(|(i, &r)| {
                    builder
                        .ins()
                        .load(ir_type(r), MemFlags::trusted(), area, slot_offset(i))
                })
                .collect(),
            None => builder.inst_results(call).to_vec(),
        };
        for (i, (&value, &r)) in results.iter().zip(ty.results()).enumerate() {
            store_slot(&mut builder, r, value, values, slot_offset(i));
        }
        builder.ins().return_(&[]);
        builder.finalize();
    }
}

fn code_size(ctx: &Context) -> usize {
    ctx.compiled_code()
        .map(|code| code.code_info().total_size as usize)
        .unwrap_or(0)
}

pub(crate) fn ir_type(ty: ValType) -> Type {
    match ty {
        ValType::I32 => types::I32,
        ValType::I64 => types::I64,
        ValType::F32 => types::F32,
        ValType::F64 => types::F64,
    }
}

pub(crate) fn slot_offset(index: usize) -> i32 {
    (index * 8) as i32
}

/// Stack area with one 8-byte slot per value.
pub(crate) fn results_area(builder: &mut FunctionBuilder, ptr: Type, count: usize) -> Value {
    let slot = builder.create_sized_stack_slot(StackSlotData::new(
        StackSlotKind::ExplicitSlot,
        (count.max(1) * 8) as u32,
        3,
    ));
    builder.ins().stack_addr(ptr, slot, 0)
}

/// Read a value slot. Slots hold the zero-extended bit pattern of the value.
pub(crate) fn load_slot(
    builder: &mut FunctionBuilder,
    ty: ValType,
    base: Value,
    offset: i32,
) -> Value {
    let bits = builder
        .ins()
        .load(types::I64, MemFlags::trusted(), base, offset);
    match ty {
        ValType::I64 => bits,
        ValType::F64 => builder.ins().bitcast(types::F64, MemFlags::new(), bits),
        ValType::I32 => builder.ins().ireduce(types::I32, bits),
        ValType::F32 => {
            let low = builder.ins().ireduce(types::I32, bits);
            builder.ins().bitcast(types::F32, MemFlags::new(), low)
        }
    }
}

/// Write a value slot, zero-extending narrow values.
pub(crate) fn store_slot(
    builder: &mut FunctionBuilder,
    ty: ValType,
    value: Value,
    base: Value,
    offset: i32,
) {
    let bits = match ty {
        ValType::I64 => value,
        ValType::F64 => builder.ins().bitcast(types::I64, MemFlags::new(), value),
        ValType::I32 => builder.ins().uextend(types::I64, value),
        ValType::F32 => {
            let low = builder.ins().bitcast(types::I32, MemFlags::new(), value);
            builder.ins().uextend(types::I64, low)
        }
    };
    builder
        .ins()
        .store(MemFlags::trusted(), bits, base, offset);
}
