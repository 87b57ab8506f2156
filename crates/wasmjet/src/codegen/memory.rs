//! Linear memory access: loads, stores, size/grow, bulk operations and
//! atomics.
//!
//! Addresses are computed as `base + zext(index) + offset` in 64 bits, so
//! the sum never wraps. Memories with guard-page elision rely on the 8 GiB
//! reservation to turn any out-of-range access into a fault; all others get
//! an explicit `end > current_length` check first.

use super::emitter::FunctionEmitter;
use super::MemoryEnv;
use anyhow::{bail, Result};
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{
    types, AbiParam, AtomicRmwOp, InstBuilder, MemFlags, Signature, Type, Value,
};
use wasmjet_runtime::{libcalls, MemoryDefinition, TableDefinition, TrapReason};
use wasmparser::{MemArg, Operator};

/// Shape of a plain load.
#[derive(Debug, Clone, Copy)]
enum Load {
    /// Full-width load of the given type.
    Full(Type),
    /// Narrow integer load: result type, access bytes, signed.
    Narrow(Type, u8, bool),
}

impl FunctionEmitter<'_, '_> {
    /// Translate `op` if it touches linear memory. Returns `false` for any
    /// other operator.
    pub(super) fn translate_memory_operator(&mut self, op: &Operator) -> Result<bool> {
        use Load::*;
        match *op {
            Operator::I32Load { memarg } => self.load(memarg, Full(types::I32))?,
            Operator::I64Load { memarg } => self.load(memarg, Full(types::I64))?,
            Operator::F32Load { memarg } => self.load(memarg, Full(types::F32))?,
            Operator::F64Load { memarg } => self.load(memarg, Full(types::F64))?,
            Operator::I32Load8S { memarg } => self.load(memarg, Narrow(types::I32, 1, true))?,
            Operator::I32Load8U { memarg } => self.load(memarg, Narrow(types::I32, 1, false))?,
            Operator::I32Load16S { memarg } => self.load(memarg, Narrow(types::I32, 2, true))?,
            Operator::I32Load16U { memarg } => self.load(memarg, Narrow(types::I32, 2, false))?,
            Operator::I64Load8S { memarg } => self.load(memarg, Narrow(types::I64, 1, true))?,
            Operator::I64Load8U { memarg } => self.load(memarg, Narrow(types::I64, 1, false))?,
            Operator::I64Load16S { memarg } => self.load(memarg, Narrow(types::I64, 2, true))?,
            Operator::I64Load16U { memarg } => self.load(memarg, Narrow(types::I64, 2, false))?,
            Operator::I64Load32S { memarg } => self.load(memarg, Narrow(types::I64, 4, true))?,
            Operator::I64Load32U { memarg } => self.load(memarg, Narrow(types::I64, 4, false))?,

            Operator::I32Store { memarg } | Operator::F32Store { memarg } => self.store(memarg, 4)?,
            Operator::I64Store { memarg } | Operator::F64Store { memarg } => self.store(memarg, 8)?,
            Operator::I32Store8 { memarg } | Operator::I64Store8 { memarg } => self.store(memarg, 1)?,
            Operator::I32Store16 { memarg } | Operator::I64Store16 { memarg } => {
                self.store(memarg, 2)?
            }
            Operator::I64Store32 { memarg } => self.store(memarg, 4)?,

            Operator::MemorySize { mem } => {
                let memory = self.memory(mem)?;
                let len = self.current_length(&memory);
                let pages = self.builder.ins().ushr_imm(len, 16);
                let pages = self.builder.ins().ireduce(types::I32, pages);
                self.push(pages);
            }
            Operator::MemoryGrow { mem } => {
                let memory = self.memory(mem)?;
                let delta = self.pop()?;
                let ptr = self.ptr;
                let handle = self.address(memory.memory as usize);
                let result = self.call_libcall(
                    libcalls::wasmjet_memory_grow as *const () as usize,
                    &[ptr, types::I32],
                    &[handle, delta],
                );
                self.push(result);
            }
            Operator::MemoryCopy { dst_mem, src_mem } => {
                if dst_mem != src_mem {
                    bail!("memory.copy between different memories is not supported");
                }
                let memory = self.memory(dst_mem)?;
                let len = self.pop()?;
                let src = self.pop()?;
                let dst = self.pop()?;
                let ptr = self.ptr;
                let handle = self.address(memory.memory as usize);
                let status = self.call_libcall(
                    libcalls::wasmjet_memory_copy as *const () as usize,
                    &[ptr, types::I32, types::I32, types::I32],
                    &[handle, dst, src, len],
                );
                self.trap_if_status(status);
            }
            Operator::MemoryFill { mem } => {
                let memory = self.memory(mem)?;
                let len = self.pop()?;
                let value = self.pop()?;
                let dst = self.pop()?;
                let ptr = self.ptr;
                let handle = self.address(memory.memory as usize);
                let status = self.call_libcall(
                    libcalls::wasmjet_memory_fill as *const () as usize,
                    &[ptr, types::I32, types::I32, types::I32],
                    &[handle, dst, value, len],
                );
                self.trap_if_status(status);
            }

            Operator::TableSize { table } => {
                let definition = *self
                    .env
                    .tables
                    .get(table as usize)
                    .ok_or_else(|| anyhow::anyhow!("table index {table} out of range"))?;
                let definition = self.address(definition as usize);
                let size = self.builder.ins().load(
                    types::I32,
                    MemFlags::trusted(),
                    definition,
                    TableDefinition::LENGTH_OFFSET,
                );
                self.push(size);
            }

            Operator::AtomicFence => {
                self.builder.ins().fence();
            }
            Operator::I32AtomicLoad { memarg } => self.atomic_load(memarg, types::I32, types::I32)?,
            Operator::I64AtomicLoad { memarg } => self.atomic_load(memarg, types::I64, types::I64)?,
            Operator::I32AtomicLoad8U { memarg } => self.atomic_load(memarg, types::I32, types::I8)?,
            Operator::I32AtomicLoad16U { memarg } => {
                self.atomic_load(memarg, types::I32, types::I16)?
            }
            Operator::I64AtomicLoad8U { memarg } => self.atomic_load(memarg, types::I64, types::I8)?,
            Operator::I64AtomicLoad16U { memarg } => {
                self.atomic_load(memarg, types::I64, types::I16)?
            }
            Operator::I64AtomicLoad32U { memarg } => {
                self.atomic_load(memarg, types::I64, types::I32)?
            }
            Operator::I32AtomicStore { memarg } | Operator::I64AtomicStore32 { memarg } => {
                self.atomic_store(memarg, types::I32)?
            }
            Operator::I64AtomicStore { memarg } => self.atomic_store(memarg, types::I64)?,
            Operator::I32AtomicStore8 { memarg } | Operator::I64AtomicStore8 { memarg } => {
                self.atomic_store(memarg, types::I8)?
            }
            Operator::I32AtomicStore16 { memarg } | Operator::I64AtomicStore16 { memarg } => {
                self.atomic_store(memarg, types::I16)?
            }

            ref op => {
                let Some((memarg, access, rmw)) = atomic_rmw(op) else {
                    return Ok(false);
                };
                match rmw {
                    Some(rmw) => self.atomic_rmw(memarg, access, rmw)?,
                    None => self.atomic_cmpxchg(memarg, access)?,
                }
            }
        }
        Ok(true)
    }

    fn memory(&self, index: u32) -> Result<MemoryEnv> {
        self.env
            .memories
            .get(index as usize)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("memory index {index} out of range"))
    }

    fn current_length(&mut self, memory: &MemoryEnv) -> Value {
        let ptr = self.ptr;
        let definition = self.address(memory.definition as usize);
        self.builder.ins().load(
            ptr,
            MemFlags::trusted(),
            definition,
            MemoryDefinition::LENGTH_OFFSET,
        )
    }

    /// Pop the index operand and return the native address of
    /// `index + offset`, after the bounds check the memory needs.
    fn effective_address(&mut self, memarg: MemArg, size: u32) -> Result<Value> {
        let memory = self.memory(memarg.memory)?;
        let index = self.pop()?;
        let ptr = self.ptr;
        let index = self.builder.ins().uextend(ptr, index);

        if !memory.elide_bounds_checks {
            let end = self
                .builder
                .ins()
                .iadd_imm(index, (memarg.offset + size as u64) as i64);
            let len = self.current_length(&memory);
            self.trap_if_cmp(
                IntCC::UnsignedGreaterThan,
                end,
                len,
                TrapReason::MemoryOutOfBounds,
            );
        }

        let base = self.address(memory.base as usize);
        let addr = self.builder.ins().iadd(base, index);
        Ok(if memarg.offset == 0 {
            addr
        } else {
            self.builder.ins().iadd_imm(addr, memarg.offset as i64)
        })
    }

    fn load(&mut self, memarg: MemArg, shape: Load) -> Result<()> {
        let flags = MemFlags::new();
        let value = match shape {
            Load::Full(ty) => {
                let addr = self.effective_address(memarg, ty.bytes())?;
                self.builder.ins().load(ty, flags, addr, 0)
            }
            Load::Narrow(ty, bytes, signed) => {
                let addr = self.effective_address(memarg, bytes as u32)?;
                let ins = self.builder.ins();
                match (bytes, signed) {
                    (1, true) => ins.sload8(ty, flags, addr, 0),
                    (1, false) => ins.uload8(ty, flags, addr, 0),
                    (2, true) => ins.sload16(ty, flags, addr, 0),
                    (2, false) => ins.uload16(ty, flags, addr, 0),
                    (_, true) => ins.sload32(flags, addr, 0),
                    (_, false) => ins.uload32(flags, addr, 0),
                }
            }
        };
        self.push(value);
        Ok(())
    }

    fn store(&mut self, memarg: MemArg, bytes: u32) -> Result<()> {
        let value = self.pop()?;
        let addr = self.effective_address(memarg, bytes)?;
        let flags = MemFlags::new();
        let full = self.builder.func.dfg.value_type(value).bytes() == bytes;
        let ins = self.builder.ins();
        match bytes {
            _ if full => ins.store(flags, value, addr, 0),
            1 => ins.istore8(flags, value, addr, 0),
            2 => ins.istore16(flags, value, addr, 0),
            _ => ins.istore32(flags, value, addr, 0),
        };
        Ok(())
    }

    /// Address of an atomic access, trapping unless it is naturally
    /// aligned.
    fn atomic_address(&mut self, memarg: MemArg, access: Type) -> Result<Value> {
        let addr = self.effective_address(memarg, access.bytes())?;
        if access.bytes() > 1 {
            let misaligned = self
                .builder
                .ins()
                .band_imm(addr, access.bytes() as i64 - 1);
            let zero = self.iconst(self.ptr, 0);
            self.trap_if_cmp(
                IntCC::NotEqual,
                misaligned,
                zero,
                TrapReason::MisalignedAtomic,
            );
        }
        Ok(addr)
    }

    fn atomic_load(&mut self, memarg: MemArg, ty: Type, access: Type) -> Result<()> {
        let addr = self.atomic_address(memarg, access)?;
        let value = self.builder.ins().atomic_load(access, MemFlags::new(), addr);
        let value = self.widen(value, access, ty);
        self.push(value);
        Ok(())
    }

    fn atomic_store(&mut self, memarg: MemArg, access: Type) -> Result<()> {
        let value = self.pop()?;
        let addr = self.atomic_address(memarg, access)?;
        let value = self.narrow(value, access);
        self.builder.ins().atomic_store(MemFlags::new(), value, addr);
        Ok(())
    }

    fn atomic_rmw(&mut self, memarg: MemArg, access: Type, op: AtomicRmwOp) -> Result<()> {
        let operand = self.pop()?;
        let ty = self.builder.func.dfg.value_type(operand);
        let addr = self.atomic_address(memarg, access)?;
        let operand = self.narrow(operand, access);
        let old = self
            .builder
            .ins()
            .atomic_rmw(access, MemFlags::new(), op, addr, operand);
        let old = self.widen(old, access, ty);
        self.push(old);
        Ok(())
    }

    fn atomic_cmpxchg(&mut self, memarg: MemArg, access: Type) -> Result<()> {
        let replacement = self.pop()?;
        let expected = self.pop()?;
        let ty = self.builder.func.dfg.value_type(expected);
        let addr = self.atomic_address(memarg, access)?;
        let expected = self.narrow(expected, access);
        let replacement = self.narrow(replacement, access);
        let old = self
            .builder
            .ins()
            .atomic_cas(MemFlags::new(), addr, expected, replacement);
        let old = self.widen(old, access, ty);
        self.push(old);
        Ok(())
    }

    fn narrow(&mut self, value: Value, access: Type) -> Value {
        if self.builder.func.dfg.value_type(value) == access {
            value
        } else {
            self.builder.ins().ireduce(access, value)
        }
    }

    fn widen(&mut self, value: Value, access: Type, ty: Type) -> Value {
        if access == ty {
            value
        } else {
            self.builder.ins().uextend(ty, value)
        }
    }

    /// Call a runtime function returning an `i32`.
    fn call_libcall(&mut self, addr: usize, params: &[Type], args: &[Value]) -> Value {
        let mut sig = Signature::new(self.builder.func.signature.call_conv);
        sig.params
            .extend(params.iter().map(|&ty| AbiParam::new(ty)));
        sig.returns.push(AbiParam::new(types::I32));
        let sig = self.builder.import_signature(sig);
        let callee = self.address(addr);
        let call = self.builder.ins().call_indirect(sig, callee, args);
        self.builder.inst_results(call)[0]
    }
}

/// Decode an atomic read-modify-write: memarg, access width and the
/// operation (`None` for compare-exchange).
fn atomic_rmw(op: &Operator) -> Option<(MemArg, Type, Option<AtomicRmwOp>)> {
    use AtomicRmwOp::*;
    let (memarg, access, rmw) = match *op {
        Operator::I32AtomicRmwAdd { memarg } => (memarg, types::I32, Some(Add)),
        Operator::I64AtomicRmwAdd { memarg } => (memarg, types::I64, Some(Add)),
        Operator::I32AtomicRmw8AddU { memarg } | Operator::I64AtomicRmw8AddU { memarg } => {
            (memarg, types::I8, Some(Add))
        }
        Operator::I32AtomicRmw16AddU { memarg } | Operator::I64AtomicRmw16AddU { memarg } => {
            (memarg, types::I16, Some(Add))
        }
        Operator::I64AtomicRmw32AddU { memarg } => (memarg, types::I32, Some(Add)),

        Operator::I32AtomicRmwSub { memarg } => (memarg, types::I32, Some(Sub)),
        Operator::I64AtomicRmwSub { memarg } => (memarg, types::I64, Some(Sub)),
        Operator::I32AtomicRmw8SubU { memarg } | Operator::I64AtomicRmw8SubU { memarg } => {
            (memarg, types::I8, Some(Sub))
        }
        Operator::I32AtomicRmw16SubU { memarg } | Operator::I64AtomicRmw16SubU { memarg } => {
            (memarg, types::I16, Some(Sub))
        }
        Operator::I64AtomicRmw32SubU { memarg } => (memarg, types::I32, Some(Sub)),

        Operator::I32AtomicRmwAnd { memarg } => (memarg, types::I32, Some(And)),
        Operator::I64AtomicRmwAnd { memarg } => (memarg, types::I64, Some(And)),
        Operator::I32AtomicRmw8AndU { memarg } | Operator::I64AtomicRmw8AndU { memarg } => {
            (memarg, types::I8, Some(And))
        }
        Operator::I32AtomicRmw16AndU { memarg } | Operator::I64AtomicRmw16AndU { memarg } => {
            (memarg, types::I16, Some(And))
        }
        Operator::I64AtomicRmw32AndU { memarg } => (memarg, types::I32, Some(And)),

        Operator::I32AtomicRmwOr { memarg } => (memarg, types::I32, Some(Or)),
        Operator::I64AtomicRmwOr { memarg } => (memarg, types::I64, Some(Or)),
        Operator::I32AtomicRmw8OrU { memarg } | Operator::I64AtomicRmw8OrU { memarg } => {
            (memarg, types::I8, Some(Or))
        }
        Operator::I32AtomicRmw16OrU { memarg } | Operator::I64AtomicRmw16OrU { memarg } => {
            (memarg, types::I16, Some(Or))
        }
        Operator::I64AtomicRmw32OrU { memarg } => (memarg, types::I32, Some(Or)),

        Operator::I32AtomicRmwXor { memarg } => (memarg, types::I32, Some(Xor)),
        Operator::I64AtomicRmwXor { memarg } => (memarg, types::I64, Some(Xor)),
        Operator::I32AtomicRmw8XorU { memarg } | Operator::I64AtomicRmw8XorU { memarg } => {
            (memarg, types::I8, Some(Xor))
        }
        Operator::I32AtomicRmw16XorU { memarg } | Operator::I64AtomicRmw16XorU { memarg } => {
            (memarg, types::I16, Some(Xor))
        }
        Operator::I64AtomicRmw32XorU { memarg } => (memarg, types::I32, Some(Xor)),

        Operator::I32AtomicRmwXchg { memarg } => (memarg, types::I32, Some(Xchg)),
        Operator::I64AtomicRmwXchg { memarg } => (memarg, types::I64, Some(Xchg)),
        Operator::I32AtomicRmw8XchgU { memarg } | Operator::I64AtomicRmw8XchgU { memarg } => {
            (memarg, types::I8, Some(Xchg))
        }
        Operator::I32AtomicRmw16XchgU { memarg } | Operator::I64AtomicRmw16XchgU { memarg } => {
            (memarg, types::I16, Some(Xchg))
        }
        Operator::I64AtomicRmw32XchgU { memarg } => (memarg, types::I32, Some(Xchg)),

        Operator::I32AtomicRmwCmpxchg { memarg } => (memarg, types::I32, None),
        Operator::I64AtomicRmwCmpxchg { memarg } => (memarg, types::I64, None),
        Operator::I32AtomicRmw8CmpxchgU { memarg } | Operator::I64AtomicRmw8CmpxchgU { memarg } => {
            (memarg, types::I8, None)
        }
        Operator::I32AtomicRmw16CmpxchgU { memarg }
        | Operator::I64AtomicRmw16CmpxchgU { memarg } => (memarg, types::I16, None),
        Operator::I64AtomicRmw32CmpxchgU { memarg } => (memarg, types::I32, None),

        _ => return None,
    };
    Some((memarg, access, rmw))
}
