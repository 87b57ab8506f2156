//! Operator dispatch: control flow, locals, globals and constants here;
//! arithmetic, memory and calls in their own modules.

use super::emitter::{ControlKind, FunctionEmitter};
use super::numeric::{BinOp, Conversion, UnOp};
use super::{load_slot, store_slot};
use anyhow::{bail, Result};
use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::immediates::{Ieee32, Ieee64};
use cranelift_codegen::ir::{types, Block, InstBuilder, JumpTableData, Value};
use std::collections::HashMap;
use wasmjet_runtime::TrapReason;
use wasmparser::Operator;

impl FunctionEmitter<'_, '_> {
    pub(super) fn translate_operator(&mut self, op: &Operator) -> Result<()> {
        match *op {
            // ── control ──
            Operator::Nop => {}
            Operator::Unreachable => {
                self.trap(TrapReason::Unreachable);
                self.reachable = false;
            }
            Operator::Block { blockty } => {
                let (params, results) = self.block_type(blockty)?;
                let merge = self.block_with_params(&results);
                self.push_frame(
                    ControlKind::Block,
                    merge,
                    merge,
                    None,
                    params.len(),
                    results.len(),
                );
            }
            Operator::Loop { blockty } => {
                let (params, results) = self.block_type(blockty)?;
                let header = self.block_with_params(&params);
                let merge = self.block_with_params(&results);
                let args = self.popn(params.len())?;
                self.jump(header, &args);
                self.builder.switch_to_block(header);
                let header_params = self.builder.block_params(header).to_vec();
                self.stack.extend(header_params);
                self.push_frame(
                    ControlKind::Loop,
                    header,
                    merge,
                    None,
                    params.len(),
                    results.len(),
                );
            }
            Operator::If { blockty } => {
                let cond = self.pop()?;
                let (params, results) = self.block_type(blockty)?;
                let then_block = self.builder.create_block();
                let else_block = self.block_with_params(&params);
                let merge = self.block_with_params(&results);
                let args = self.peekn(params.len())?.to_vec();
                self.builder
                    .ins()
                    .brif(cond, then_block, &[], else_block, &args);
                self.builder.seal_block(then_block);
                self.builder.seal_block(else_block);
                self.builder.switch_to_block(then_block);
                self.push_frame(
                    ControlKind::IfThen,
                    merge,
                    merge,
                    Some(else_block),
                    params.len(),
                    results.len(),
                );
            }
            Operator::Else => self.translate_else()?,
            Operator::End => self.translate_end()?,
            Operator::Br { relative_depth } => self.branch(relative_depth)?,
            Operator::BrIf { relative_depth } => {
                let cond = self.pop()?;
                let (target, arity) = self.branch_target(relative_depth)?;
                let args = self.peekn(arity)?.to_vec();
                let next = self.builder.create_block();
                self.builder.ins().brif(cond, target, &args, next, &[]);
                self.builder.seal_block(next);
                self.builder.switch_to_block(next);
            }
            Operator::BrTable { ref targets } => {
                let index = self.pop()?;
                let mut depths = Vec::with_capacity(targets.len() as usize);
                for depth in targets.targets() {
                    depths.push(depth?);
                }
                self.translate_br_table(index, &depths, targets.default())?;
            }
            Operator::Return => {
                let depth = (self.control.len() - 1) as u32;
                self.branch(depth)?;
            }
            Operator::Call { function_index } => self.translate_call(function_index)?,
            Operator::CallIndirect {
                type_index,
                table_index,
            } => self.translate_call_indirect(type_index, table_index)?,

            // ── parametric ──
            Operator::Drop => {
                self.pop()?;
            }
            Operator::Select | Operator::TypedSelect { .. } => {
                let cond = self.pop()?;
                let (a, b) = self.pop2()?;
                let value = self.builder.ins().select(cond, a, b);
                self.push(value);
            }

            // ── variables ──
            Operator::LocalGet { local_index } => {
                let (var, _) = self.local(local_index)?;
                let value = self.builder.use_var(var);
                self.push(value);
            }
            Operator::LocalSet { local_index } => {
                let (var, _) = self.local(local_index)?;
                let value = self.pop()?;
                self.builder.def_var(var, value);
            }
            Operator::LocalTee { local_index } => {
                let (var, _) = self.local(local_index)?;
                let value = *self
                    .stack
                    .last()
                    .ok_or_else(|| anyhow::anyhow!("stack underflow"))?;
                self.builder.def_var(var, value);
            }
            Operator::GlobalGet { global_index } => {
                let global = self.global(global_index)?;
                let slot = self.address(global.slot as usize);
                let value = load_slot(&mut self.builder, global.ty, slot, 0);
                self.push(value);
            }
            Operator::GlobalSet { global_index } => {
                let global = self.global(global_index)?;
                let value = self.pop()?;
                let slot = self.address(global.slot as usize);
                store_slot(&mut self.builder, global.ty, value, slot, 0);
            }

            // ── constants ──
            Operator::I32Const { value } => {
                let v = self.iconst(types::I32, value as i64);
                self.push(v);
            }
            Operator::I64Const { value } => {
                let v = self.iconst(types::I64, value);
                self.push(v);
            }
            Operator::F32Const { value } => {
                let v = self.builder.ins().f32const(Ieee32::with_bits(value.bits()));
                self.push(v);
            }
            Operator::F64Const { value } => {
                let v = self.builder.ins().f64const(Ieee64::with_bits(value.bits()));
                self.push(v);
            }

            // ── i32 ──
            Operator::I32Eqz => self.eqz()?,
            Operator::I32Eq => self.icmp(IntCC::Equal)?,
            Operator::I32Ne => self.icmp(IntCC::NotEqual)?,
            Operator::I32LtS => self.icmp(IntCC::SignedLessThan)?,
            Operator::I32LtU => self.icmp(IntCC::UnsignedLessThan)?,
            Operator::I32GtS => self.icmp(IntCC::SignedGreaterThan)?,
            Operator::I32GtU => self.icmp(IntCC::UnsignedGreaterThan)?,
            Operator::I32LeS => self.icmp(IntCC::SignedLessThanOrEqual)?,
            Operator::I32LeU => self.icmp(IntCC::UnsignedLessThanOrEqual)?,
            Operator::I32GeS => self.icmp(IntCC::SignedGreaterThanOrEqual)?,
            Operator::I32GeU => self.icmp(IntCC::UnsignedGreaterThanOrEqual)?,
            Operator::I32Clz => self.unop(UnOp::Clz)?,
            Operator::I32Ctz => self.unop(UnOp::Ctz)?,
            Operator::I32Popcnt => self.unop(UnOp::Popcnt)?,
            Operator::I32Add => self.binop(BinOp::Add)?,
            Operator::I32Sub => self.binop(BinOp::Sub)?,
            Operator::I32Mul => self.binop(BinOp::Mul)?,
            Operator::I32DivS => self.binop(BinOp::DivS)?,
            Operator::I32DivU => self.binop(BinOp::DivU)?,
            Operator::I32RemS => self.binop(BinOp::RemS)?,
            Operator::I32RemU => self.binop(BinOp::RemU)?,
            Operator::I32And => self.binop(BinOp::And)?,
            Operator::I32Or => self.binop(BinOp::Or)?,
            Operator::I32Xor => self.binop(BinOp::Xor)?,
            Operator::I32Shl => self.binop(BinOp::Shl)?,
            Operator::I32ShrS => self.binop(BinOp::ShrS)?,
            Operator::I32ShrU => self.binop(BinOp::ShrU)?,
            Operator::I32Rotl => self.binop(BinOp::Rotl)?,
            Operator::I32Rotr => self.binop(BinOp::Rotr)?,

            // ── i64 ──
            Operator::I64Eqz => self.eqz()?,
            Operator::I64Eq => self.icmp(IntCC::Equal)?,
            Operator::I64Ne => self.icmp(IntCC::NotEqual)?,
            Operator::I64LtS => self.icmp(IntCC::SignedLessThan)?,
            Operator::I64LtU => self.icmp(IntCC::UnsignedLessThan)?,
            Operator::I64GtS => self.icmp(IntCC::SignedGreaterThan)?,
            Operator::I64GtU => self.icmp(IntCC::UnsignedGreaterThan)?,
            Operator::I64LeS => self.icmp(IntCC::SignedLessThanOrEqual)?,
            Operator::I64LeU => self.icmp(IntCC::UnsignedLessThanOrEqual)?,
            Operator::I64GeS => self.icmp(IntCC::SignedGreaterThanOrEqual)?,
            Operator::I64GeU => self.icmp(IntCC::UnsignedGreaterThanOrEqual)?,
            Operator::I64Clz => self.unop(UnOp::Clz)?,
            Operator::I64Ctz => self.unop(UnOp::Ctz)?,
            Operator::I64Popcnt => self.unop(UnOp::Popcnt)?,
            Operator::I64Add => self.binop(BinOp::Add)?,
            Operator::I64Sub => self.binop(BinOp::Sub)?,
            Operator::I64Mul => self.binop(BinOp::Mul)?,
            Operator::I64DivS => self.binop(BinOp::DivS)?,
            Operator::I64DivU => self.binop(BinOp::DivU)?,
            Operator::I64RemS => self.binop(BinOp::RemS)?,
            Operator::I64RemU => self.binop(BinOp::RemU)?,
            Operator::I64And => self.binop(BinOp::And)?,
            Operator::I64Or => self.binop(BinOp::Or)?,
            Operator::I64Xor => self.binop(BinOp::Xor)?,
            Operator::I64Shl => self.binop(BinOp::Shl)?,
            Operator::I64ShrS => self.binop(BinOp::ShrS)?,
            Operator::I64ShrU => self.binop(BinOp::ShrU)?,
            Operator::I64Rotl => self.binop(BinOp::Rotl)?,
            Operator::I64Rotr => self.binop(BinOp::Rotr)?,

            // ── f32 / f64 ──
            Operator::F32Eq | Operator::F64Eq => self.fcmp(FloatCC::Equal)?,
            Operator::F32Ne | Operator::F64Ne => self.fcmp(FloatCC::NotEqual)?,
            Operator::F32Lt | Operator::F64Lt => self.fcmp(FloatCC::LessThan)?,
            Operator::F32Gt | Operator::F64Gt => self.fcmp(FloatCC::GreaterThan)?,
            Operator::F32Le | Operator::F64Le => self.fcmp(FloatCC::LessThanOrEqual)?,
            Operator::F32Ge | Operator::F64Ge => self.fcmp(FloatCC::GreaterThanOrEqual)?,
            Operator::F32Abs | Operator::F64Abs => self.unop(UnOp::Abs)?,
            Operator::F32Neg | Operator::F64Neg => self.unop(UnOp::Neg)?,
            Operator::F32Sqrt | Operator::F64Sqrt => self.unop(UnOp::Sqrt)?,
            Operator::F32Ceil | Operator::F64Ceil => self.unop(UnOp::Ceil)?,
            Operator::F32Floor | Operator::F64Floor => self.unop(UnOp::Floor)?,
            Operator::F32Trunc | Operator::F64Trunc => self.unop(UnOp::Trunc)?,
            Operator::F32Nearest | Operator::F64Nearest => self.unop(UnOp::Nearest)?,
            Operator::F32Add | Operator::F64Add => self.binop(BinOp::FAdd)?,
            Operator::F32Sub | Operator::F64Sub => self.binop(BinOp::FSub)?,
            Operator::F32Mul | Operator::F64Mul => self.binop(BinOp::FMul)?,
            Operator::F32Div | Operator::F64Div => self.binop(BinOp::FDiv)?,
            Operator::F32Min | Operator::F64Min => self.binop(BinOp::FMin)?,
            Operator::F32Max | Operator::F64Max => self.binop(BinOp::FMax)?,
            Operator::F32Copysign | Operator::F64Copysign => self.binop(BinOp::Copysign)?,

            // ── conversions ──
            Operator::I32WrapI64 => self.convert(Conversion::Wrap)?,
            Operator::I64ExtendI32S => self.convert(Conversion::ExtendS(types::I64))?,
            Operator::I64ExtendI32U => self.convert(Conversion::ExtendU)?,
            Operator::I32TruncF32S | Operator::I32TruncF64S => {
                self.convert(Conversion::Trunc(types::I32, true))?
            }
            Operator::I32TruncF32U | Operator::I32TruncF64U => {
                self.convert(Conversion::Trunc(types::I32, false))?
            }
            Operator::I64TruncF32S | Operator::I64TruncF64S => {
                self.convert(Conversion::Trunc(types::I64, true))?
            }
            Operator::I64TruncF32U | Operator::I64TruncF64U => {
                self.convert(Conversion::Trunc(types::I64, false))?
            }
            Operator::I32TruncSatF32S | Operator::I32TruncSatF64S => {
                self.convert(Conversion::TruncSat(types::I32, true))?
            }
            Operator::I32TruncSatF32U | Operator::I32TruncSatF64U => {
                self.convert(Conversion::TruncSat(types::I32, false))?
            }
            Operator::I64TruncSatF32S | Operator::I64TruncSatF64S => {
                self.convert(Conversion::TruncSat(types::I64, true))?
            }
            Operator::I64TruncSatF32U | Operator::I64TruncSatF64U => {
                self.convert(Conversion::TruncSat(types::I64, false))?
            }
            Operator::F32ConvertI32S | Operator::F32ConvertI64S => {
                self.convert(Conversion::FromInt(types::F32, true))?
            }
            Operator::F32ConvertI32U | Operator::F32ConvertI64U => {
                self.convert(Conversion::FromInt(types::F32, false))?
            }
            Operator::F64ConvertI32S | Operator::F64ConvertI64S => {
                self.convert(Conversion::FromInt(types::F64, true))?
            }
            Operator::F64ConvertI32U | Operator::F64ConvertI64U => {
                self.convert(Conversion::FromInt(types::F64, false))?
            }
            Operator::F32DemoteF64 => self.convert(Conversion::Demote)?,
            Operator::F64PromoteF32 => self.convert(Conversion::Promote)?,
            Operator::I32ReinterpretF32 => self.convert(Conversion::Reinterpret(types::I32))?,
            Operator::I64ReinterpretF64 => self.convert(Conversion::Reinterpret(types::I64))?,
            Operator::F32ReinterpretI32 => self.convert(Conversion::Reinterpret(types::F32))?,
            Operator::F64ReinterpretI64 => self.convert(Conversion::Reinterpret(types::F64))?,
            Operator::I32Extend8S => self.convert(Conversion::SignExtend(types::I8))?,
            Operator::I32Extend16S => self.convert(Conversion::SignExtend(types::I16))?,
            Operator::I64Extend8S => self.convert(Conversion::SignExtend(types::I8))?,
            Operator::I64Extend16S => self.convert(Conversion::SignExtend(types::I16))?,
            Operator::I64Extend32S => self.convert(Conversion::SignExtend(types::I32))?,

            ref other => {
                if !self.translate_memory_operator(other)? {
                    bail!("unsupported operator: {other:?}");
                }
            }
        }
        Ok(())
    }

    fn global(&self, index: u32) -> Result<super::GlobalEnv> {
        self.env
            .globals
            .get(index as usize)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("global index {index} out of range"))
    }

    /// `br_table`. Targets with values go through one forwarding block per
    /// distinct depth since jump table entries cannot carry arguments.
    fn translate_br_table(&mut self, index: Value, depths: &[u32], default: u32) -> Result<()> {
        let arity = {
            let (_, arity) = self.branch_target(default)?;
            arity
        };

        if arity == 0 {
            let mut entries = Vec::with_capacity(depths.len());
            for &depth in depths {
                let (target, _) = self.branch_target(depth)?;
                entries.push(self.builder.func.dfg.block_call(target, &[]));
            }
            let (default_target, _) = self.branch_target(default)?;
            let default_call = self.builder.func.dfg.block_call(default_target, &[]);
            let table = self
                .builder
                .create_jump_table(JumpTableData::new(default_call, &entries));
            self.builder.ins().br_table(index, table);
        } else {
            let mut edges: HashMap<u32, Block> = HashMap::new();
            let mut order = Vec::new();
            let mut edge_for = |this: &mut Self, depth: u32| {
                *edges.entry(depth).or_insert_with(|| {
                    order.push(depth);
                    this.builder.create_block()
                })
            };
            let mut entries = Vec::with_capacity(depths.len());
            for &depth in depths {
                let edge = edge_for(self, depth);
                entries.push(self.builder.func.dfg.block_call(edge, &[]));
            }
            let default_edge = edge_for(self, default);
            let default_call = self.builder.func.dfg.block_call(default_edge, &[]);
            let table = self
                .builder
                .create_jump_table(JumpTableData::new(default_call, &entries));
            self.builder.ins().br_table(index, table);

            let args = self.peekn(arity)?.to_vec();
            for depth in order {
                let edge = edges[&depth];
                self.builder.switch_to_block(edge);
                self.builder.seal_block(edge);
                let (target, _) = self.branch_target(depth)?;
                self.jump(target, &args);
            }
        }
        self.reachable = false;
        Ok(())
    }
}
