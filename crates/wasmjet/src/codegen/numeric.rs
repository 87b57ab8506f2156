//! Integer and float arithmetic, comparisons and conversions.

use super::emitter::FunctionEmitter;
use anyhow::{bail, Result};
use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{types, AbiParam, InstBuilder, MemFlags, Signature, Type, Value};
use wasmjet_runtime::{ops, TrapReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    DivS,
    DivU,
    RemS,
    RemU,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
    Rotl,
    Rotr,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FMin,
    FMax,
    Copysign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnOp {
    Clz,
    Ctz,
    Popcnt,
    Abs,
    Neg,
    Sqrt,
    Ceil,
    Floor,
    Trunc,
    Nearest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Conversion {
    /// i64 to i32.
    Wrap,
    ExtendS(Type),
    ExtendU,
    /// Trapping float-to-int into the given type; `true` when signed.
    Trunc(Type, bool),
    TruncSat(Type, bool),
    /// Int-to-float into the given type; `true` when signed.
    FromInt(Type, bool),
    Demote,
    Promote,
    Reinterpret(Type),
    /// Sign-extend the low bits of the given width in place.
    SignExtend(Type),
}

impl FunctionEmitter<'_, '_> {
    fn value_type(&self, value: Value) -> Type {
        self.builder.func.dfg.value_type(value)
    }

    fn bool_to_i32(&mut self, flag: Value) -> Value {
        self.builder.ins().uextend(types::I32, flag)
    }

    pub(super) fn eqz(&mut self) -> Result<()> {
        let value = self.pop()?;
        let ty = self.value_type(value);
        let zero = self.iconst(ty, 0);
        let flag = self.builder.ins().icmp(IntCC::Equal, value, zero);
        let result = self.bool_to_i32(flag);
        self.push(result);
        Ok(())
    }

    pub(super) fn icmp(&mut self, cc: IntCC) -> Result<()> {
        let (a, b) = self.pop2()?;
        let flag = self.builder.ins().icmp(cc, a, b);
        let result = self.bool_to_i32(flag);
        self.push(result);
        Ok(())
    }

    pub(super) fn fcmp(&mut self, cc: FloatCC) -> Result<()> {
        let (a, b) = self.pop2()?;
        let flag = self.builder.ins().fcmp(cc, a, b);
        let result = self.bool_to_i32(flag);
        self.push(result);
        Ok(())
    }

    pub(super) fn unop(&mut self, op: UnOp) -> Result<()> {
        let v = self.pop()?;
        let result = match op {
            UnOp::Clz => self.builder.ins().clz(v),
            UnOp::Ctz => self.builder.ins().ctz(v),
            UnOp::Popcnt => self.builder.ins().popcnt(v),
            UnOp::Abs => self.builder.ins().fabs(v),
            UnOp::Neg => self.builder.ins().fneg(v),
            UnOp::Sqrt => self.builder.ins().sqrt(v),
            UnOp::Ceil | UnOp::Floor | UnOp::Trunc | UnOp::Nearest => {
                let helper = float_helper_unary(op, self.value_type(v) == types::F64);
                self.call_float_helper(helper, &[v])
            }
        };
        self.push(result);
        Ok(())
    }

    pub(super) fn binop(&mut self, op: BinOp) -> Result<()> {
        let (a, b) = self.pop2()?;
        let result = match op {
            BinOp::Add => self.builder.ins().iadd(a, b),
            BinOp::Sub => self.builder.ins().isub(a, b),
            BinOp::Mul => self.builder.ins().imul(a, b),
            BinOp::DivS | BinOp::DivU | BinOp::RemS | BinOp::RemU => self.divide(op, a, b),
            BinOp::And => self.builder.ins().band(a, b),
            BinOp::Or => self.builder.ins().bor(a, b),
            BinOp::Xor => self.builder.ins().bxor(a, b),
            BinOp::Shl | BinOp::ShrS | BinOp::ShrU | BinOp::Rotl | BinOp::Rotr => {
                let bits = self.value_type(a).bits() as i64;
                let amount = self.builder.ins().band_imm(b, bits - 1);
                let ins = self.builder.ins();
                match op {
                    BinOp::Shl => ins.ishl(a, amount),
                    BinOp::ShrS => ins.sshr(a, amount),
                    BinOp::ShrU => ins.ushr(a, amount),
                    BinOp::Rotl => ins.rotl(a, amount),
                    _ => ins.rotr(a, amount),
                }
            }
            BinOp::FAdd => self.builder.ins().fadd(a, b),
            BinOp::FSub => self.builder.ins().fsub(a, b),
            BinOp::FMul => self.builder.ins().fmul(a, b),
            BinOp::FDiv => self.builder.ins().fdiv(a, b),
            BinOp::Copysign => self.builder.ins().fcopysign(a, b),
            BinOp::FMin | BinOp::FMax => {
                let is_f64 = self.value_type(a) == types::F64;
                let helper = match (op, is_f64) {
                    (BinOp::FMin, false) => ops::wasmjet_f32_min as *const () as usize,
                    (BinOp::FMin, true) => ops::wasmjet_f64_min as *const () as usize,
                    (_, false) => ops::wasmjet_f32_max as *const () as usize,
                    (_, true) => ops::wasmjet_f64_max as *const () as usize,
                };
                self.call_float_helper(helper, &[a, b])
            }
        };
        self.push(result);
        Ok(())
    }

    /// Integer division and remainder. Division by zero traps, as does
    /// signed `MIN / -1`; signed `MIN % -1` is 0.
    fn divide(&mut self, op: BinOp, a: Value, b: Value) -> Value {
        let ty = self.value_type(a);
        let zero = self.iconst(ty, 0);
        self.trap_if_cmp(
            IntCC::Equal,
            b,
            zero,
            TrapReason::IntegerDivideByZeroOrOverflow,
        );
        match op {
            BinOp::DivU => self.builder.ins().udiv(a, b),
            BinOp::RemU => self.builder.ins().urem(a, b),
            BinOp::DivS => {
                let min = if ty == types::I32 {
                    i32::MIN as i64
                } else {
                    i64::MIN
                };
                let min = self.iconst(ty, min);
                let minus_one = self.iconst(ty, -1);
                let a_is_min = self.builder.ins().icmp(IntCC::Equal, a, min);
                let b_is_minus_one = self.builder.ins().icmp(IntCC::Equal, b, minus_one);
                let overflow = self.builder.ins().band(a_is_min, b_is_minus_one);
                self.trap_if(overflow, TrapReason::IntegerDivideByZeroOrOverflow);
                self.builder.ins().sdiv(a, b)
            }
            _ => {
                // Any x % -1 is 0; dividing by 1 instead avoids the
                // native overflow fault for MIN % -1.
                let minus_one = self.iconst(ty, -1);
                let one = self.iconst(ty, 1);
                let b_is_minus_one = self.builder.ins().icmp(IntCC::Equal, b, minus_one);
                let divisor = self.builder.ins().select(b_is_minus_one, one, b);
                self.builder.ins().srem(a, divisor)
            }
        }
    }

    fn call_float_helper(&mut self, helper: usize, args: &[Value]) -> Value {
        let ty = self.value_type(args[0]);
        let mut sig = Signature::new(self.builder.func.signature.call_conv);
        for _ in args {
            sig.params.push(AbiParam::new(ty));
        }
        sig.returns.push(AbiParam::new(ty));
        let sig = self.builder.import_signature(sig);
        let callee = self.address(helper);
        let call = self.builder.ins().call_indirect(sig, callee, args);
        self.builder.inst_results(call)[0]
    }

    pub(super) fn convert(&mut self, conversion: Conversion) -> Result<()> {
        let v = self.pop()?;
        let result = match conversion {
            Conversion::Wrap => self.builder.ins().ireduce(types::I32, v),
            Conversion::ExtendS(ty) => self.builder.ins().sextend(ty, v),
            Conversion::ExtendU => self.builder.ins().uextend(types::I64, v),
            Conversion::Trunc(ty, signed) => {
                self.check_trunc(v, ty, signed);
                self.fcvt_sat(ty, signed, v)
            }
            Conversion::TruncSat(ty, signed) => self.fcvt_sat(ty, signed, v),
            Conversion::FromInt(ty, true) => self.builder.ins().fcvt_from_sint(ty, v),
            Conversion::FromInt(ty, false) => self.builder.ins().fcvt_from_uint(ty, v),
            Conversion::Demote => self.builder.ins().fdemote(types::F32, v),
            Conversion::Promote => self.builder.ins().fpromote(types::F64, v),
            Conversion::Reinterpret(ty) => self.builder.ins().bitcast(ty, MemFlags::new(), v),
            Conversion::SignExtend(narrow) => {
                let ty = self.value_type(v);
                if narrow.bits() >= ty.bits() {
                    bail!("cannot sign-extend {narrow} within {ty}");
                }
                let low = self.builder.ins().ireduce(narrow, v);
                self.builder.ins().sextend(ty, low)
            }
        };
        self.push(result);
        Ok(())
    }

    fn fcvt_sat(&mut self, ty: Type, signed: bool, v: Value) -> Value {
        if signed {
            self.builder.ins().fcvt_to_sint_sat(ty, v)
        } else {
            self.builder.ins().fcvt_to_uint_sat(ty, v)
        }
    }

    /// Trap unless `v` converts exactly into `ty`: NaN is an invalid
    /// conversion, anything outside the exclusive bounds overflows.
    fn check_trunc(&mut self, v: Value, ty: Type, signed: bool) {
        let from_f64 = self.value_type(v) == types::F64;
        let is_nan = self.builder.ins().fcmp(FloatCC::Unordered, v, v);
        self.trap_if(is_nan, TrapReason::InvalidConversionToInteger);

        let (lower, upper) = ops::trunc_bounds(ty == types::I64, signed, from_f64);
        let (lower, upper) = if from_f64 {
            (
                self.builder.ins().f64const(lower),
                self.builder.ins().f64const(upper),
            )
        } else {
            (
                self.builder.ins().f32const(lower as f32),
                self.builder.ins().f32const(upper as f32),
            )
        };
        let too_low = self
            .builder
            .ins()
            .fcmp(FloatCC::LessThanOrEqual, v, lower);
        let too_high = self
            .builder
            .ins()
            .fcmp(FloatCC::GreaterThanOrEqual, v, upper);
        let out_of_range = self.builder.ins().bor(too_low, too_high);
        self.trap_if(out_of_range, TrapReason::IntegerDivideByZeroOrOverflow);
    }
}

fn float_helper_unary(op: UnOp, is_f64: bool) -> usize {
    match (op, is_f64) {
        (UnOp::Ceil, false) => ops::wasmjet_f32_ceil as *const () as usize,
        (UnOp::Floor, false) => ops::wasmjet_f32_floor as *const () as usize,
        (UnOp::Trunc, false) => ops::wasmjet_f32_trunc as *const () as usize,
        (UnOp::Nearest, false) => ops::wasmjet_f32_nearest as *const () as usize,
        (UnOp::Ceil, true) => ops::wasmjet_f64_ceil as *const () as usize,
        (UnOp::Floor, true) => ops::wasmjet_f64_floor as *const () as usize,
        (UnOp::Trunc, true) => ops::wasmjet_f64_trunc as *const () as usize,
        (_, true) => ops::wasmjet_f64_nearest as *const () as usize,
        (_, false) => ops::wasmjet_f32_nearest as *const () as usize,
    }
}
