//! Direct, imported and indirect calls, plus the host-call stub.

use super::emitter::FunctionEmitter;
use super::{ir_type, load_slot, results_area, slot_offset, store_slot, Compiler};
use crate::types::FuncType;
use anyhow::{anyhow, Result};
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, AbiParam, Inst, InstBuilder, MemFlags, Signature, Value};
use cranelift_frontend::FunctionBuilder;
use wasmjet_runtime::libcalls::{self, HostContext};
use wasmjet_runtime::{FuncRef, TableDefinition, TrapReason};

impl FunctionEmitter<'_, '_> {
    pub(super) fn translate_call(&mut self, function_index: u32) -> Result<()> {
        let env = self.env;
        let ty = env.func_type(function_index);
        let mut args = self.popn(ty.params().len())?;
        let ret_area = self.push_ret_area(ty, &mut args);

        let call = if function_index < self.env.num_imported_funcs() {
            let target = env.imported_funcs[function_index as usize];
            let sig = self
                .builder
                .import_signature(self.compiler.wasm_signature(ty));
            let callee = self.address(target as usize);
            self.builder.ins().call_indirect(sig, callee, &args)
        } else {
            let func_ref = self.local_func_ref(function_index);
            self.builder.ins().call(func_ref, &args)
        };
        self.push_call_results(ty, call, ret_area);
        Ok(())
    }

    /// `call_indirect`: bounds-check the index, compare the entry's type id
    /// with the expected one and call through the stored pointer.
    pub(super) fn translate_call_indirect(&mut self, type_index: u32, table_index: u32) -> Result<()> {
        let env = self.env;
        let definition = *env
            .tables
            .get(table_index as usize)
            .ok_or_else(|| anyhow!("table index {table_index} out of range"))?;
        let ty = env
            .module
            .types
            .get(type_index as usize)
            .ok_or_else(|| anyhow!("type index {type_index} out of range"))?;
        let expected = env.type_ids[type_index as usize];

        let index = self.pop()?;
        let mut args = self.popn(ty.params().len())?;

        let ptr = self.ptr;
        let flags = MemFlags::trusted();
        let definition = self.address(definition as usize);
        let len = self.builder.ins().load(
            types::I32,
            flags,
            definition,
            TableDefinition::LENGTH_OFFSET,
        );
        self.trap_if_cmp(
            IntCC::UnsignedGreaterThanOrEqual,
            index,
            len,
            TrapReason::TableOutOfBounds,
        );

        let base = self
            .builder
            .ins()
            .load(ptr, flags, definition, TableDefinition::BASE_OFFSET);
        let index = self.builder.ins().uextend(ptr, index);
        let offset = self.builder.ins().imul_imm(index, FuncRef::SIZE as i64);
        let entry = self.builder.ins().iadd(base, offset);

        let type_id = self
            .builder
            .ins()
            .load(types::I32, flags, entry, FuncRef::TYPE_ID_OFFSET);
        self.trap_if_null(type_id);
        let expected = self.iconst(types::I32, expected as i64);
        self.trap_if_cmp(
            IntCC::NotEqual,
            type_id,
            expected,
            TrapReason::IndirectCallSignatureMismatch,
        );
        let callee = self
            .builder
            .ins()
            .load(ptr, flags, entry, FuncRef::FUNC_PTR_OFFSET);

        let ret_area = self.push_ret_area(ty, &mut args);
        let sig = self
            .builder
            .import_signature(self.compiler.wasm_signature(ty));
        let call = self.builder.ins().call_indirect(sig, callee, &args);
        self.push_call_results(ty, call, ret_area);
        Ok(())
    }

    fn trap_if_null(&mut self, type_id: Value) {
        let zero = self.iconst(types::I32, 0);
        self.trap_if_cmp(IntCC::Equal, type_id, zero, TrapReason::UndefinedElement);
    }

    /// Append a results area to `args` when `ty` returns several values.
    fn push_ret_area(&mut self, ty: &FuncType, args: &mut Vec<Value>) -> Option<Value> {
        if ty.results().len() <= 1 {
            return None;
        }
        let area = results_area(&mut self.builder, self.ptr, ty.results().len());
        args.push(area);
        Some(area)
    }

    fn push_call_results(&mut self, ty: &FuncType, call: Inst, ret_area: Option<Value>) {
        match ret_area {
            Some(area) => {
                for (i, &result) in ty.results().iter().enumerate() {
                    let value = self.builder.ins().load(
                        ir_type(result),
                        MemFlags::trusted(),
                        area,
                        slot_offset(i),
                    );
                    self.push(value);
                }
            }
            None => {
                let results = self.builder.inst_results(call).to_vec();
                self.stack.extend(results);
            }
        }
    }
}

/// Body of the native-ABI stub for a host function: spill the arguments
/// into value slots, call [`libcalls::wasmjet_host_call`] and either raise
/// the returned trap code or hand the results back.
pub(super) fn build_host_stub(
    compiler: &Compiler,
    mut builder: FunctionBuilder,
    ty: &FuncType,
    context: *const HostContext,
) {
    let ptr = compiler.pointer_type();
    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    builder.seal_block(entry);
    let params = builder.block_params(entry).to_vec();

    let slot_count = ty.params().len().max(ty.results().len());
    let slots = results_area(&mut builder, ptr, slot_count);
    for (i, &param) in ty.params().iter().enumerate() {
        store_slot(&mut builder, param, params[i], slots, slot_offset(i));
    }

    let mut call_sig = Signature::new(builder.func.signature.call_conv);
    call_sig.params.push(AbiParam::new(ptr));
    call_sig.params.push(AbiParam::new(ptr));
    call_sig.returns.push(AbiParam::new(types::I32));
    let call_sig = builder.import_signature(call_sig);
    let host_call = builder
        .ins()
        .iconst(ptr, libcalls::wasmjet_host_call as *const () as usize as i64);
    let context = builder.ins().iconst(ptr, context as usize as i64);
    let call = builder
        .ins()
        .call_indirect(call_sig, host_call, &[context, slots]);
    let status = builder.inst_results(call)[0];

    let trap = builder.create_block();
    builder.append_block_param(trap, types::I32);
    builder.set_cold_block(trap);
    let done = builder.create_block();
    builder.ins().brif(status, trap, &[status], done, &[]);
    builder.seal_block(trap);
    builder.seal_block(done);

    builder.switch_to_block(trap);
    let code = builder.block_params(trap)[0];
    let mut raise_sig = Signature::new(builder.func.signature.call_conv);
    raise_sig.params.push(AbiParam::new(types::I32));
    let raise_sig = builder.import_signature(raise_sig);
    let raise = builder
        .ins()
        .iconst(ptr, libcalls::wasmjet_raise_trap as *const () as usize as i64);
    builder.ins().call_indirect(raise_sig, raise, &[code]);
    builder
        .ins()
        .trap(cranelift_codegen::ir::TrapCode::unwrap_user(1));

    builder.switch_to_block(done);
    let results: Vec<Value> = ty
        .results()
        .iter()
        .enumerate()
        .map(|(i, &r)| load_slot(&mut builder, r, slots, slot_offset(i)))
        .collect();
    if results.len() > 1 {
        let ret_area = params[ty.params().len()];
        for (i, &value) in results.iter().enumerate() {
            builder
                .ins()
                .store(MemFlags::trusted(), value, ret_area, slot_offset(i));
        }
        builder.ins().return_(&[]);
    } else {
        builder.ins().return_(&results);
    }
    builder.finalize();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use cranelift_codegen::ir::{Function, UserFuncName};
    use cranelift_codegen::settings;
    use cranelift_frontend::FunctionBuilderContext;
    use wasmjet_runtime::ValType;

    fn verify_stub(ty: FuncType) {
        let compiler = Compiler::new(&EngineConfig::default()).unwrap();
        let sig = compiler.wasm_signature(&ty);
        let mut func = Function::with_name_signature(UserFuncName::user(0, 0), sig);
        let mut fb_ctx = FunctionBuilderContext::new();
        let builder = FunctionBuilder::new(&mut func, &mut fb_ctx);
        build_host_stub(&compiler, builder, &ty, std::ptr::null());
        let flags = settings::Flags::new(settings::builder());
        cranelift_codegen::verify_function(&func, &flags).unwrap();
    }

    #[test]
    fn host_stub_without_values_verifies() {
        verify_stub(FuncType::new([], []));
    }

    #[test]
    fn host_stub_single_result_verifies() {
        verify_stub(FuncType::new([ValType::I32, ValType::F64], [ValType::F32]));
    }

    #[test]
    fn host_stub_multi_result_verifies() {
        verify_stub(FuncType::new([ValType::I64], [ValType::I32, ValType::I64, ValType::F64]));
    }
}
