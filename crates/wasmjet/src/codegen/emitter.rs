//! Per-function emission state: operand stack, control stack, locals and
//! the shared trap blocks.

use super::{ir_type, Compiler, InstanceEnv};
use crate::module::FunctionBody;
use crate::types::FuncType;
use anyhow::{bail, Context as _, Result};
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{self, types, Block, InstBuilder, MemFlags, TrapCode, Type, Value};
use cranelift_frontend::{FunctionBuilder, Variable};
use cranelift_jit::JITModule;
use cranelift_module::{FuncId, Module as _};
use std::collections::HashMap;
use wasmjet_runtime::{libcalls, TrapReason, ValType};
use wasmparser::{BinaryReader, BlockType};

/// Kind of a structured control construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlKind {
    /// The implicit outermost frame; its merge block returns.
    Function,
    Block,
    Loop,
    /// An `if` whose `else` has not been seen.
    IfThen,
    IfElse,
}

#[derive(Debug)]
pub(crate) struct ControlFrame {
    pub kind: ControlKind,
    /// Destination of a branch to this frame: the loop header for loops,
    /// the merge block otherwise.
    pub branch_target: Block,
    /// Where control continues after `end`. Its params are the results.
    pub merge: Block,
    /// Alternate arm of an `if`, taking the block params.
    pub else_block: Option<Block>,
    pub n_params: usize,
    pub n_results: usize,
    /// Operand stack height below this frame's params.
    pub stack_height: usize,
    /// Some branch targets the merge block.
    pub exit_branched: bool,
    /// For `IfElse`: the then arm fell through to the merge block.
    pub then_reachable: bool,
}

impl ControlFrame {
    /// Number of values a branch to this frame carries.
    pub fn branch_arity(&self) -> usize {
        match self.kind {
            ControlKind::Loop => self.n_params,
            _ => self.n_results,
        }
    }
}

pub(crate) struct FunctionEmitter<'a, 'b> {
    pub compiler: &'a Compiler,
    pub env: &'a InstanceEnv<'a>,
    pub jit: &'a mut JITModule,
    pub func_ids: &'a [FuncId],
    pub builder: FunctionBuilder<'b>,
    pub ptr: Type,
    pub ty: &'a FuncType,
    pub stack: Vec<Value>,
    pub control: Vec<ControlFrame>,
    /// Whether the code being translated can execute.
    pub reachable: bool,
    /// Number of constructs opened while unreachable and not yet closed.
    pub unreachable_depth: u32,
    locals: Vec<ValType>,
    /// Results area of a multi-value function.
    ret_area: Option<Value>,
    trap_blocks: HashMap<u32, Block>,
    status_trap_block: Option<Block>,
    func_refs: HashMap<u32, ir::FuncRef>,
    raise_sig: Option<ir::SigRef>,
}

impl<'a, 'b> FunctionEmitter<'a, 'b> {
    pub fn new(
        compiler: &'a Compiler,
        env: &'a InstanceEnv<'a>,
        jit: &'a mut JITModule,
        func_ids: &'a [FuncId],
        builder: FunctionBuilder<'b>,
        ty: &'a FuncType,
    ) -> Self {
        Self {
            compiler,
            env,
            jit,
            func_ids,
            builder,
            ptr: compiler.pointer_type(),
            ty,
            stack: Vec::new(),
            control: Vec::new(),
            reachable: true,
            unreachable_depth: 0,
            locals: Vec::new(),
            ret_area: None,
            trap_blocks: HashMap::new(),
            status_trap_block: None,
            func_refs: HashMap::new(),
            raise_sig: None,
        }
    }

    /// Translate `body` and finalize the function.
    pub fn translate(mut self, body: &FunctionBody) -> Result<()> {
        let entry = self.builder.create_block();
        self.builder.append_block_params_for_function_params(entry);
        self.builder.switch_to_block(entry);
        self.builder.seal_block(entry);

        self.declare_locals(entry, &body.locals);

        let ty = self.ty;
        let exit = self.block_with_params(ty.results());
        self.control.push(ControlFrame {
            kind: ControlKind::Function,
            branch_target: exit,
            merge: exit,
            else_block: None,
            n_params: 0,
            n_results: self.ty.results().len(),
            stack_height: 0,
            exit_branched: false,
            then_reachable: false,
        });

        let mut reader =
            BinaryReader::new_features(&body.code, body.offset, crate::module::features());
        while !reader.eof() {
            let offset = reader.original_position();
            let op = reader
                .read_operator()
                .with_context(|| format!("reading operator at offset {offset:#x}"))?;
            if self.reachable {
                self.translate_operator(&op)
                    .with_context(|| format!("at offset {offset:#x}"))?;
            } else {
                self.translate_unreachable_operator(&op)?;
            }
            if self.control.is_empty() {
                break;
            }
        }
        if !self.control.is_empty() {
            bail!("function body ended inside a block");
        }

        self.fill_trap_blocks();
        self.builder.finalize();
        Ok(())
    }

    fn declare_locals(&mut self, entry: Block, declared: &[ValType]) {
        let params = self.builder.block_params(entry).to_vec();
        let func_ty = self.ty;
        let n_params = func_ty.params().len();
        for (i, &ty) in func_ty.params().iter().enumerate() {
            let var = Variable::from_u32(i as u32);
            self.builder.declare_var(var, ir_type(ty));
            self.builder.def_var(var, params[i]);
            self.locals.push(ty);
        }
        if func_ty.results().len() > 1 {
            self.ret_area = Some(params[n_params]);
        }
        for &ty in declared {
            let var = Variable::from_u32(self.locals.len() as u32);
            self.builder.declare_var(var, ir_type(ty));
            let zero = self.zero(ty);
            self.builder.def_var(var, zero);
            self.locals.push(ty);
        }
    }

    pub fn local(&self, index: u32) -> Result<(Variable, ValType)> {
        let ty = *self
            .locals
            .get(index as usize)
            .ok_or_else(|| anyhow::anyhow!("local index {index} out of range"))?;
        Ok((Variable::from_u32(index), ty))
    }

    pub fn zero(&mut self, ty: ValType) -> Value {
        match ty {
            ValType::I32 => self.builder.ins().iconst(types::I32, 0),
            ValType::I64 => self.builder.ins().iconst(types::I64, 0),
            ValType::F32 => self.builder.ins().f32const(0.0),
            ValType::F64 => self.builder.ins().f64const(0.0),
        }
    }

    /// Integer constant of type `ty`. 32-bit immediates are stored
    /// zero-extended.
    pub fn iconst(&mut self, ty: Type, value: i64) -> Value {
        let value = if ty == types::I32 {
            value as u32 as i64
        } else {
            value
        };
        self.builder.ins().iconst(ty, value)
    }

    pub fn address(&mut self, addr: usize) -> Value {
        let ptr = self.ptr;
        self.builder.ins().iconst(ptr, addr as i64)
    }

    pub fn block_with_params(&mut self, params: &[ValType]) -> Block {
        let block = self.builder.create_block();
        for &ty in params {
            self.builder.append_block_param(block, ir_type(ty));
        }
        block
    }

    pub fn block_type(&self, ty: BlockType) -> Result<(Vec<ValType>, Vec<ValType>)> {
        Ok(match ty {
            BlockType::Empty => (vec![], vec![]),
            BlockType::Type(t) => (vec![], vec![crate::types::convert_val_type(t)?]),
            BlockType::FuncType(index) => {
                let ty = self
                    .env
                    .module
                    .types
                    .get(index as usize)
                    .ok_or_else(|| anyhow::anyhow!("block type {index} out of range"))?;
                (ty.params().to_vec(), ty.results().to_vec())
            }
        })
    }

    // ── operand stack ──

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| anyhow::anyhow!("stack underflow"))
    }

    pub fn pop2(&mut self) -> Result<(Value, Value)> {
        let b = self.pop()?;
        let a = self.pop()?;
        Ok((a, b))
    }

    pub fn popn(&mut self, n: usize) -> Result<Vec<Value>> {
        if n > self.stack.len() {
            bail!("stack underflow: need {n} values, have {}", self.stack.len());
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    pub fn peekn(&self, n: usize) -> Result<&[Value]> {
        if n > self.stack.len() {
            bail!("stack underflow: need {n} values, have {}", self.stack.len());
        }
        Ok(&self.stack[self.stack.len() - n..])
    }

    // ── control stack ──

    /// Index of the frame `depth` levels out from the innermost one.
    pub fn frame_index(&self, depth: u32) -> Result<usize> {
        (self.control.len())
            .checked_sub(1)
            .and_then(|top| top.checked_sub(depth as usize))
            .ok_or_else(|| anyhow::anyhow!("branch depth {depth} out of range"))
    }

    /// Resolve a branch target, recording that the frame's exit is used.
    pub fn branch_target(&mut self, depth: u32) -> Result<(Block, usize)> {
        let index = self.frame_index(depth)?;
        let frame = &mut self.control[index];
        if frame.kind != ControlKind::Loop {
            frame.exit_branched = true;
        }
        Ok((frame.branch_target, frame.branch_arity()))
    }

    pub fn jump(&mut self, block: Block, args: &[Value]) {
        self.builder.ins().jump(block, args);
    }

    /// Jump to the target of a branch of `depth`, carrying the top values.
    pub fn branch(&mut self, depth: u32) -> Result<()> {
        let (target, arity) = self.branch_target(depth)?;
        let args = self.peekn(arity)?.to_vec();
        self.jump(target, &args);
        self.reachable = false;
        Ok(())
    }

    pub fn push_frame(
        &mut self,
        kind: ControlKind,
        branch_target: Block,
        merge: Block,
        else_block: Option<Block>,
        n_params: usize,
        n_results: usize,
    ) {
        let stack_height = self.stack.len() - n_params.min(self.stack.len());
        self.control.push(ControlFrame {
            kind,
            branch_target,
            merge,
            else_block,
            n_params,
            n_results,
            stack_height,
            exit_branched: false,
            then_reachable: false,
        });
    }

    pub fn translate_else(&mut self) -> Result<()> {
        let frame = self
            .control
            .last_mut()
            .ok_or_else(|| anyhow::anyhow!("else without if"))?;
        if frame.kind != ControlKind::IfThen {
            bail!("else without matching if");
        }
        let merge = frame.merge;
        let n_results = frame.n_results;
        let else_block = frame
            .else_block
            .take()
            .ok_or_else(|| anyhow::anyhow!("if frame without else block"))?;
        let height = frame.stack_height;
        frame.kind = ControlKind::IfElse;
        frame.then_reachable = self.reachable;

        if self.reachable {
            let args = self.peekn(n_results)?.to_vec();
            self.jump(merge, &args);
        }
        self.stack.truncate(height);
        self.builder.switch_to_block(else_block);
        let params = self.builder.block_params(else_block).to_vec();
        self.stack.extend(params);
        self.reachable = true;
        Ok(())
    }

    pub fn translate_end(&mut self) -> Result<()> {
        let frame = self
            .control
            .pop()
            .ok_or_else(|| anyhow::anyhow!("end without open block"))?;

        if self.reachable {
            let args = self.peekn(frame.n_results)?.to_vec();
            self.jump(frame.merge, &args);
        }
        let mut merge_reachable = self.reachable || frame.exit_branched;
        match frame.kind {
            ControlKind::IfThen => {
                // A missing else arm passes its params straight through.
                if let Some(else_block) = frame.else_block {
                    self.builder.switch_to_block(else_block);
                    let params = self.builder.block_params(else_block).to_vec();
                    self.jump(frame.merge, &params);
                    merge_reachable = true;
                }
            }
            ControlKind::IfElse => merge_reachable |= frame.then_reachable,
            ControlKind::Loop => self.builder.seal_block(frame.branch_target),
            ControlKind::Function | ControlKind::Block => {}
        }
        self.builder.seal_block(frame.merge);
        self.stack.truncate(frame.stack_height);

        self.reachable = merge_reachable;
        if !merge_reachable {
            return Ok(());
        }
        self.builder.switch_to_block(frame.merge);
        let results = self.builder.block_params(frame.merge).to_vec();
        if frame.kind == ControlKind::Function {
            self.emit_return(&results);
            self.reachable = false;
        } else {
            self.stack.extend(results);
        }
        Ok(())
    }

    fn emit_return(&mut self, results: &[Value]) {
        match self.ret_area {
            Some(area) => {
                for (i, &value) in results.iter().enumerate() {
                    self.builder
                        .ins()
                        .store(MemFlags::trusted(), value, area, super::slot_offset(i));
                }
                self.builder.ins().return_(&[]);
            }
            None => {
                self.builder.ins().return_(results);
            }
        }
    }

    /// Skip an operator in dead code, tracking nesting so the `else`/`end`
    /// that closes the dead region is still found.
    fn translate_unreachable_operator(&mut self, op: &wasmparser::Operator) -> Result<()> {
        use wasmparser::Operator;
        match op {
            Operator::Block { .. } | Operator::Loop { .. } | Operator::If { .. } => {
                self.unreachable_depth += 1;
            }
            Operator::Else if self.unreachable_depth == 0 => self.translate_else()?,
            Operator::End if self.unreachable_depth == 0 => self.translate_end()?,
            Operator::End => self.unreachable_depth -= 1,
            _ => {}
        }
        Ok(())
    }

    // ── traps ──

    fn raise_signature(&mut self) -> ir::SigRef {
        if let Some(sig) = self.raise_sig {
            return sig;
        }
        let mut sig = ir::Signature::new(self.builder.func.signature.call_conv);
        sig.params.push(ir::AbiParam::new(types::I32));
        let sig = self.builder.import_signature(sig);
        self.raise_sig = Some(sig);
        sig
    }

    /// Emit the trap sequence for a dynamic trap code and terminate the
    /// current block.
    fn emit_raise(&mut self, code: Value) {
        let sig = self.raise_signature();
        let callee = self.address(libcalls::wasmjet_raise_trap as *const () as usize);
        self.builder.ins().call_indirect(sig, callee, &[code]);
        self.builder.ins().trap(TrapCode::unwrap_user(1));
    }

    /// Trap unconditionally; the current block ends.
    pub fn trap(&mut self, reason: TrapReason) {
        let code = self.iconst(types::I32, reason.code() as i64);
        self.emit_raise(code);
    }

    fn trap_block(&mut self, reason: TrapReason) -> Block {
        let code = reason.code();
        if let Some(&block) = self.trap_blocks.get(&code) {
            return block;
        }
        let block = self.builder.create_block();
        self.builder.set_cold_block(block);
        self.trap_blocks.insert(code, block);
        block
    }

    /// Continue in a fresh block when `cond` is zero, trap otherwise.
    pub fn trap_if(&mut self, cond: Value, reason: TrapReason) {
        let trap = self.trap_block(reason);
        let next = self.builder.create_block();
        self.builder.ins().brif(cond, trap, &[], next, &[]);
        self.builder.seal_block(next);
        self.builder.switch_to_block(next);
    }

    /// Trap with `status` as the code when it is non-zero.
    pub fn trap_if_status(&mut self, status: Value) {
        let trap = match self.status_trap_block {
            Some(block) => block,
            None => {
                let block = self.builder.create_block();
                self.builder.append_block_param(block, types::I32);
                self.builder.set_cold_block(block);
                self.status_trap_block = Some(block);
                block
            }
        };
        let next = self.builder.create_block();
        self.builder.ins().brif(status, trap, &[status], next, &[]);
        self.builder.seal_block(next);
        self.builder.switch_to_block(next);
    }

    /// Trap if `a cc b`.
    pub fn trap_if_cmp(&mut self, cc: IntCC, a: Value, b: Value, reason: TrapReason) {
        let cond = self.builder.ins().icmp(cc, a, b);
        self.trap_if(cond, reason);
    }

    fn fill_trap_blocks(&mut self) {
        let mut blocks: Vec<(u32, Block)> = self.trap_blocks.drain().collect();
        blocks.sort_by_key(|&(code, _)| code);
        for (code, block) in blocks {
            self.builder.switch_to_block(block);
            self.builder.seal_block(block);
            let code = self.iconst(types::I32, code as i64);
            self.emit_raise(code);
        }
        if let Some(block) = self.status_trap_block.take() {
            self.builder.switch_to_block(block);
            self.builder.seal_block(block);
            let code = self.builder.block_params(block)[0];
            self.emit_raise(code);
        }
    }

    // ── calls ──

    /// Reference to a function defined in this instance.
    pub fn local_func_ref(&mut self, func_index: u32) -> ir::FuncRef {
        if let Some(&func_ref) = self.func_refs.get(&func_index) {
            return func_ref;
        }
        let defined = (func_index - self.env.num_imported_funcs()) as usize;
        let func_ref = self
            .jit
            .declare_func_in_func(self.func_ids[defined], self.builder.func);
        self.func_refs.insert(func_index, func_ref);
        func_ref
    }
}
