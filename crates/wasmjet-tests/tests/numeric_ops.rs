use anyhow::Result;
use wasmjet::{Instance, TrapReason, Value};
use wasmjet_tests::*;

const FLOAT_WAT: &str = r#"
(module
  (func (export "f32_add") (param f32 f32) (result f32) (f32.add (local.get 0) (local.get 1)))
  (func (export "f64_div") (param f64 f64) (result f64) (f64.div (local.get 0) (local.get 1)))
  (func (export "f64_min") (param f64 f64) (result f64) (f64.min (local.get 0) (local.get 1)))
  (func (export "f64_max") (param f64 f64) (result f64) (f64.max (local.get 0) (local.get 1)))
  (func (export "f64_nearest") (param f64) (result f64) (f64.nearest (local.get 0)))
  (func (export "f32_nearest") (param f32) (result f32) (f32.nearest (local.get 0)))
  (func (export "f64_sqrt") (param f64) (result f64) (f64.sqrt (local.get 0)))
  (func (export "f64_copysign") (param f64 f64) (result f64) (f64.copysign (local.get 0) (local.get 1)))
  (func (export "f64_eq") (param f64 f64) (result i32) (f64.eq (local.get 0) (local.get 1)))
  (func (export "f32_bits") (param f32) (result i32) (i32.reinterpret_f32 (local.get 0)))
  (func (export "f64_promote") (param f32) (result f64) (f64.promote_f32 (local.get 0)))
  (func (export "u64_to_f64") (param i64) (result f64) (f64.convert_i64_u (local.get 0)))
  (func (export "u32_to_f32") (param i32) (result f32) (f32.convert_i32_u (local.get 0)))

  (func (export "trunc_s") (param f64) (result i32) (i32.trunc_f64_s (local.get 0)))
  (func (export "trunc_u") (param f64) (result i32) (i32.trunc_f64_u (local.get 0)))
  (func (export "trunc_s64") (param f32) (result i64) (i64.trunc_f32_s (local.get 0)))
  (func (export "trunc_sat_s") (param f64) (result i32) (i32.trunc_sat_f64_s (local.get 0)))
  (func (export "trunc_sat_u") (param f64) (result i32) (i32.trunc_sat_f64_u (local.get 0)))
  (func (export "trunc_sat_u64") (param f64) (result i64) (i64.trunc_sat_f64_u (local.get 0)))
)
"#;

fn f64_call(instance: &Instance, name: &str, args: &[f64]) -> f64 {
    let args: Vec<Value> = args.iter().map(|&v| Value::F64(v)).collect();
    instance.invoke(name, &args).unwrap()[0].as_f64().unwrap()
}

#[test]
fn float_arithmetic() -> Result<()> {
    let instance = instantiate(FLOAT_WAT)?;
    assert_eq!(
        instance.invoke("f32_add", &[Value::F32(1.5), Value::F32(2.25)])?,
        [Value::F32(3.75)]
    );
    assert_eq!(f64_call(&instance, "f64_div", &[1.0, 0.0]), f64::INFINITY);
    assert!(f64_call(&instance, "f64_div", &[0.0, 0.0]).is_nan());
    assert_eq!(f64_call(&instance, "f64_sqrt", &[2.25]), 1.5);
    assert_eq!(f64_call(&instance, "f64_copysign", &[3.0, -0.0]), -3.0);
    assert_eq!(
        instance.invoke("f64_eq", &[Value::F64(f64::NAN), Value::F64(f64::NAN)])?,
        [Value::I32(0)]
    );
    Ok(())
}

#[test]
fn min_max_follow_wasm_rules() -> Result<()> {
    let instance = instantiate(FLOAT_WAT)?;
    assert!(f64_call(&instance, "f64_min", &[f64::NAN, 1.0]).is_nan());
    assert!(f64_call(&instance, "f64_max", &[1.0, f64::NAN]).is_nan());
    let min = f64_call(&instance, "f64_min", &[0.0, -0.0]);
    assert!(min == 0.0 && min.is_sign_negative());
    let max = f64_call(&instance, "f64_max", &[-0.0, 0.0]);
    assert!(max == 0.0 && max.is_sign_positive());
    Ok(())
}

#[test]
fn nearest_rounds_half_to_even() -> Result<()> {
    let instance = instantiate(FLOAT_WAT)?;
    assert_eq!(f64_call(&instance, "f64_nearest", &[2.5]), 2.0);
    assert_eq!(f64_call(&instance, "f64_nearest", &[3.5]), 4.0);
    assert_eq!(f64_call(&instance, "f64_nearest", &[-0.5]), -0.0);
    assert_eq!(
        instance.invoke("f32_nearest", &[Value::F32(0.5)])?,
        [Value::F32(0.0)]
    );
    Ok(())
}

#[test]
fn bit_patterns_pass_through() -> Result<()> {
    let instance = instantiate(FLOAT_WAT)?;
    assert_eq!(
        instance.invoke("f32_bits", &[Value::F32(-1.0)])?,
        [Value::I32(0xbf80_0000_u32 as i32)]
    );
    assert_eq!(
        instance.invoke("f64_promote", &[Value::F32(0.25)])?,
        [Value::F64(0.25)]
    );
    assert_eq!(
        instance.invoke("u64_to_f64", &[Value::I64(-1)])?,
        [Value::F64(18446744073709551615.0)]
    );
    assert_eq!(
        instance.invoke("u32_to_f32", &[Value::I32(-1)])?,
        [Value::F32(4294967296.0)]
    );
    Ok(())
}

#[test]
fn trapping_truncation() -> Result<()> {
    let instance = instantiate(FLOAT_WAT)?;
    assert_eq!(
        instance.invoke("trunc_s", &[Value::F64(-3.9)])?,
        [Value::I32(-3)]
    );
    assert_eq!(
        instance.invoke("trunc_u", &[Value::F64(4294967295.5)])?,
        [Value::I32(-1)]
    );
    assert_eq!(
        instance.invoke("trunc_s", &[Value::F64(-2147483648.9)])?,
        [Value::I32(i32::MIN)]
    );

    for value in [f64::NAN, 2147483648.0, -2147483649.0, f64::INFINITY] {
        let reason = trap_reason(instance.invoke("trunc_s", &[Value::F64(value)]));
        let expected = if value.is_nan() {
            TrapReason::InvalidConversionToInteger
        } else {
            TrapReason::IntegerDivideByZeroOrOverflow
        };
        assert_eq!(reason, expected, "trunc_s({value})");
    }
    assert_eq!(
        trap_reason(instance.invoke("trunc_u", &[Value::F64(-1.0)])),
        TrapReason::IntegerDivideByZeroOrOverflow
    );
    assert_eq!(
        trap_reason(instance.invoke("trunc_s64", &[Value::F32(f32::NAN)])),
        TrapReason::InvalidConversionToInteger
    );
    Ok(())
}

#[test]
fn saturating_truncation() -> Result<()> {
    let instance = instantiate(FLOAT_WAT)?;
    let cases = [
        ("trunc_sat_s", f64::NAN, Value::I32(0)),
        ("trunc_sat_s", 1e10, Value::I32(i32::MAX)),
        ("trunc_sat_s", -1e10, Value::I32(i32::MIN)),
        ("trunc_sat_u", -5.0, Value::I32(0)),
        ("trunc_sat_u", 1e10, Value::I32(-1)),
        ("trunc_sat_u64", f64::INFINITY, Value::I64(-1)),
        ("trunc_sat_u64", 42.7, Value::I64(42)),
    ];
    for (export, input, expected) in cases {
        assert_eq!(
            instance.invoke(export, &[Value::F64(input)])?,
            [expected],
            "{export}({input})"
        );
    }
    Ok(())
}
