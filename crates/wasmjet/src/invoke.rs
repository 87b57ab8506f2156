//! Host-to-guest calls.
//!
//! Arguments are checked against the signature, spilled into one 8-byte
//! slot each and handed to the signature's entry trampoline, which calls the
//! function with the native convention and writes the results back over the
//! same slots. The whole call runs under [`platform::catch_traps`].

use crate::error::InvokeError;
use crate::func::Func;
use wasmjet_runtime::{platform, Value};

/// Call `func` with `args`.
///
/// Argument count and types are checked first; a mismatch is reported as a
/// usage error without entering guest code. A trap or fault anywhere below
/// the call ends it and is returned as [`InvokeError::Trap`].
pub fn invoke(func: &Func, args: &[Value]) -> Result<Vec<Value>, InvokeError> {
    let ty = func.ty();
    if args.len() != ty.params().len() {
        return Err(InvokeError::ArityMismatch {
            expected: ty.params().len(),
            got: args.len(),
        });
    }
    for (index, (arg, &expected)) in args.iter().zip(ty.params()).enumerate() {
        if arg.ty() != expected {
            return Err(InvokeError::TypeMismatch {
                index,
                expected,
                got: arg.ty(),
            });
        }
    }

    let mut slots = vec![0u64; ty.params().len().max(ty.results().len()).max(1)];
    for (slot, arg) in slots.iter_mut().zip(args) {
        *slot = arg.to_bits();
    }

    let trampoline = func.trampoline();
    let code = func.code_ptr();
    let values = slots.as_mut_ptr();
    tracing::trace!(func = func.name(), "invoking");
    // SAFETY: the trampoline was compiled for `ty`, `values` holds enough
    // slots for both directions and the code is kept alive by `func`.
    platform::catch_traps(|| unsafe { trampoline(code, values) })?;

    Ok(ty
        .results()
        .iter()
        .zip(&slots)
        .map(|(&ty, &bits)| Value::from_bits(ty, bits))
        .collect())
}
