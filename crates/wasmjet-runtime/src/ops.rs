//! Wasm numeric semantics that generated code cannot express with a single
//! native instruction.
//!
//! ## Float min/max/rounding
//!
//! Wasm defines `min`/`max` with NaN propagation and `-0.0 < +0.0`, and
//! `nearest` as round-half-to-even. These are called from JIT code through
//! the `extern "C"` helpers below.
//!
//! ## Float-to-integer truncation
//!
//! Generated code compares the input against the exclusive bounds defined
//! here before converting: NaN traps `InvalidConversionToInteger`, anything
//! outside `(lower, upper)` traps `IntegerDivideByZeroOrOverflow`. Every bound
//! is exactly representable in both `f32` and `f64`.

use crate::TrapReason;

// ── Truncation bounds ─────────────────────────────────────────────────────────

/// Exclusive `(lower, upper)` bounds of a trapping float-to-int conversion.
pub type TruncBounds = (f64, f64);

pub const I32_TRUNC_F32_S: TruncBounds = (-2147483904.0, 2147483648.0);
pub const I32_TRUNC_F64_S: TruncBounds = (-2147483649.0, 2147483648.0);
pub const I32_TRUNC_U: TruncBounds = (-1.0, 4294967296.0);
pub const I64_TRUNC_F32_S: TruncBounds = (-9223373136366403584.0, 9223372036854775808.0);
pub const I64_TRUNC_F64_S: TruncBounds = (-9223372036854777856.0, 9223372036854775808.0);
pub const I64_TRUNC_U: TruncBounds = (-1.0, 18446744073709551616.0);

/// Pick the bounds for a conversion into a 32- or 64-bit integer.
pub fn trunc_bounds(to_i64: bool, signed: bool, from_f64: bool) -> TruncBounds {
    match (to_i64, signed, from_f64) {
        (false, true, false) => I32_TRUNC_F32_S,
        (false, true, true) => I32_TRUNC_F64_S,
        (false, false, _) => I32_TRUNC_U,
        (true, true, false) => I64_TRUNC_F32_S,
        (true, true, true) => I64_TRUNC_F64_S,
        (true, false, _) => I64_TRUNC_U,
    }
}

/// The trap a trapping truncation of `v` raises, if any.
pub fn check_trunc(v: f64, (lower, upper): TruncBounds) -> Result<(), TrapReason> {
    if v.is_nan() {
        return Err(TrapReason::InvalidConversionToInteger);
    }
    if v <= lower || v >= upper {
        return Err(TrapReason::IntegerDivideByZeroOrOverflow);
    }
    Ok(())
}

// ── Float helpers called from JIT code ───────────────────────────────────────

pub extern "C" fn wasmjet_f32_min(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        return f32::NAN;
    }
    if a == b {
        // Only differs for ±0: the sign bit wins.
        return f32::from_bits(a.to_bits() | b.to_bits());
    }
    if a < b {
        a
    } else {
        b
    }
}

pub extern "C" fn wasmjet_f32_max(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        return f32::NAN;
    }
    if a == b {
        return f32::from_bits(a.to_bits() & b.to_bits());
    }
    if a > b {
        a
    } else {
        b
    }
}

pub extern "C" fn wasmjet_f64_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    if a == b {
        return f64::from_bits(a.to_bits() | b.to_bits());
    }
    if a < b {
        a
    } else {
        b
    }
}

pub extern "C" fn wasmjet_f64_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    if a == b {
        return f64::from_bits(a.to_bits() & b.to_bits());
    }
    if a > b {
        a
    } else {
        b
    }
}

pub extern "C" fn wasmjet_f32_ceil(v: f32) -> f32 {
    v.ceil()
}

pub extern "C" fn wasmjet_f32_floor(v: f32) -> f32 {
    v.floor()
}

pub extern "C" fn wasmjet_f32_trunc(v: f32) -> f32 {
    v.trunc()
}

pub extern "C" fn wasmjet_f32_nearest(v: f32) -> f32 {
    v.round_ties_even()
}

pub extern "C" fn wasmjet_f64_ceil(v: f64) -> f64 {
    v.ceil()
}

pub extern "C" fn wasmjet_f64_floor(v: f64) -> f64 {
    v.floor()
}

pub extern "C" fn wasmjet_f64_trunc(v: f64) -> f64 {
    v.trunc()
}

pub extern "C" fn wasmjet_f64_nearest(v: f64) -> f64 {
    v.round_ties_even()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
