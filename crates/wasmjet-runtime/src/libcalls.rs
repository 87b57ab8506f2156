//! `extern "C"` entry points called by generated code.
//!
//! Generated code reaches these through absolute addresses baked into the
//! instruction stream. Fallible libcalls return a trap code (0 = success)
//! instead of unwinding themselves, so their Rust frames are gone before the
//! generated code raises the trap through
//! [`wasmjet_raise_trap`](crate::platform::wasmjet_raise_trap).

use crate::platform::fatal;
use crate::{Memory, TrapReason, ValType, Value};
use std::panic::{self, AssertUnwindSafe};

pub use crate::platform::wasmjet_raise_trap;

/// `memory.grow`: previous size in pages, or -1.
///
/// # Safety
///
/// `memory` must point to a live [`Memory`].
pub unsafe extern "C" fn wasmjet_memory_grow(memory: *const Memory, delta: u32) -> i32 {
    (*memory).grow(delta)
}

/// `memory.copy`.
///
/// # Safety
///
/// `memory` must point to a live [`Memory`].
pub unsafe extern "C" fn wasmjet_memory_copy(
    memory: *const Memory,
    dst: u32,
    src: u32,
    len: u32,
) -> u32 {
    status((*memory).copy_within(dst as usize, src as usize, len as usize))
}

/// `memory.fill`. Only the low byte of `value` is used.
///
/// # Safety
///
/// `memory` must point to a live [`Memory`].
pub unsafe extern "C" fn wasmjet_memory_fill(
    memory: *const Memory,
    dst: u32,
    value: u32,
    len: u32,
) -> u32 {
    status((*memory).fill(dst as usize, value as u8, len as usize))
}

fn status(result: Result<(), TrapReason>) -> u32 {
    match result {
        Ok(()) => 0,
        Err(reason) => reason.code(),
    }
}

/// Closure type of a host function callable from guest code.
pub type HostFn = dyn Fn(&[Value]) -> Result<Vec<Value>, TrapReason> + Send + Sync;

/// Everything a host-call stub needs at run time. Its address is baked into
/// the stub, so it must outlive the compiled code.
pub struct HostContext {
    pub name: String,
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
    pub func: Box<HostFn>,
}

impl HostContext {
    /// Number of value slots the stub must provide.
    pub fn slot_count(&self) -> usize {
        self.params.len().max(self.results.len()).max(1)
    }
}

impl core::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostContext")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("results", &self.results)
            .finish_non_exhaustive()
    }
}

/// Call a host function. Arguments are read from `values`, results are
/// written back over them. Returns a trap code, 0 on success.
///
/// # Safety
///
/// `ctx` must point to a live [`HostContext`] and `values` to at least
/// [`HostContext::slot_count`] slots.
pub unsafe extern "C" fn wasmjet_host_call(ctx: *const HostContext, values: *mut u64) -> u32 {
    let ctx = &*ctx;
    let args: Vec<Value> = ctx
        .params
        .iter()
        .enumerate()
        .map(|(i, &ty)| Value::from_bits(ty, *values.add(i)))
        .collect();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| (ctx.func)(&args)));
    match outcome {
        Ok(Ok(results)) => {
            let well_typed = results.len() == ctx.results.len()
                && results.iter().zip(&ctx.results).all(|(v, &ty)| v.ty() == ty);
            if !well_typed {
                fatal("host function returned values that do not match its signature");
            }
            for (i, value) in results.into_iter().enumerate() {
                *values.add(i) = value.to_bits();
            }
            0
        }
        Ok(Err(reason)) => {
            tracing::trace!(host = %ctx.name, %reason, "host function trapped");
            reason.code()
        }
        Err(_) => fatal("host function panicked"),
    }
}
