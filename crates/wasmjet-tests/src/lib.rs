//! Shared helpers for the end-to-end tests and benchmarks.

use anyhow::Result;
use wasmjet::{
    Compartment, Engine, EngineConfig, Instance, InvokeError, Module, NullResolver, Resolver,
    TrapReason, Value,
};

/// Instantiate a text module with the default configuration and no imports.
pub fn instantiate(wat: &str) -> Result<Instance> {
    instantiate_with(EngineConfig::default(), wat, &NullResolver)
}

pub fn instantiate_with(config: EngineConfig, wat: &str, resolver: &dyn Resolver) -> Result<Instance> {
    let engine = Engine::new(config)?;
    let compartment = Compartment::new(&engine);
    let module = Module::from_binary(&wat::parse_str(wat)?)?;
    Ok(compartment.instantiate(&module, resolver)?)
}

/// Both memory configurations: guard-page elision and explicit checks.
pub fn both_memory_modes() -> [EngineConfig; 2] {
    [
        EngineConfig::default(),
        EngineConfig {
            guard_page_elision: false,
            ..EngineConfig::default()
        },
    ]
}

/// Call an export taking and returning `i32`s.
pub fn call_i32(instance: &Instance, name: &str, args: &[i32]) -> Result<i32, InvokeError> {
    let args: Vec<Value> = args.iter().map(|&v| Value::I32(v)).collect();
    let results = instance.invoke(name, &args)?;
    Ok(results.first().and_then(Value::as_i32).unwrap_or_default())
}

/// Call an export taking and returning `i64`s.
pub fn call_i64(instance: &Instance, name: &str, args: &[i64]) -> Result<i64, InvokeError> {
    let args: Vec<Value> = args.iter().map(|&v| Value::I64(v)).collect();
    let results = instance.invoke(name, &args)?;
    Ok(results.first().and_then(Value::as_i64).unwrap_or_default())
}

/// The trap reason of a failed call.
pub fn trap_reason<T: std::fmt::Debug>(result: Result<T, InvokeError>) -> TrapReason {
    match result {
        Err(InvokeError::Trap(trap)) => trap.reason,
        other => panic!("expected a trap, got {other:?}"),
    }
}

/// Iterative Fibonacci, exported as `fibo`.
pub const FIBO_WAT: &str = r#"
(module $fibo
  (func $fibo (export "fibo") (param $n i32) (result i32)
    (local $a i32) (local $b i32) (local $tmp i32) (local $i i32)
    (if (i32.le_s (local.get $n) (i32.const 1))
      (then (return (local.get $n))))
    (local.set $b (i32.const 1))
    (local.set $i (i32.const 2))
    (block $done
      (loop $next
        (br_if $done (i32.gt_s (local.get $i) (local.get $n)))
        (local.set $tmp (i32.add (local.get $a) (local.get $b)))
        (local.set $a (local.get $b))
        (local.set $b (local.get $tmp))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $next)))
    (local.get $b)))
"#;

/// Fill `n` words with an LCG sequence, bubble-sort them in linear memory
/// and return their wrapping sum. Exported as `fill_sort_sum`.
pub const FILL_SORT_SUM_WAT: &str = r#"
(module $sort
  (memory 1)
  (func (export "fill_sort_sum") (param $n i32) (param $seed i32) (result i32)
    (local $i i32) (local $j i32) (local $rng i32) (local $a i32) (local $b i32)
    (local $sum i32) (local $addr i32)
    (if (i32.le_s (local.get $n) (i32.const 0)) (then (return (i32.const 0))))
    (if (i32.gt_s (local.get $n) (i32.const 1024)) (then (local.set $n (i32.const 1024))))
    (local.set $rng (local.get $seed))
    (block $fill_done
      (loop $fill
        (br_if $fill_done (i32.ge_s (local.get $i) (local.get $n)))
        (local.set $rng
          (i32.add (i32.mul (local.get $rng) (i32.const 1103515245)) (i32.const 12345)))
        (i32.store (i32.shl (local.get $i) (i32.const 2)) (local.get $rng))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $fill)))
    (local.set $i (i32.const 0))
    (block $outer_done
      (loop $outer
        (br_if $outer_done (i32.ge_s (local.get $i) (local.get $n)))
        (local.set $j (i32.const 0))
        (block $inner_done
          (loop $inner
            (br_if $inner_done
              (i32.ge_s (local.get $j)
                (i32.sub (i32.sub (local.get $n) (i32.const 1)) (local.get $i))))
            (local.set $addr (i32.shl (local.get $j) (i32.const 2)))
            (local.set $a (i32.load (local.get $addr)))
            (local.set $b (i32.load offset=4 (local.get $addr)))
            (if (i32.gt_s (local.get $a) (local.get $b))
              (then
                (i32.store (local.get $addr) (local.get $b))
                (i32.store offset=4 (local.get $addr) (local.get $a))))
            (local.set $j (i32.add (local.get $j) (i32.const 1)))
            (br $inner)))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $outer)))
    (local.set $i (i32.const 0))
    (block $sum_done
      (loop $sum_loop
        (br_if $sum_done (i32.ge_s (local.get $i) (local.get $n)))
        (local.set $sum
          (i32.add (local.get $sum) (i32.load (i32.shl (local.get $i) (i32.const 2)))))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $sum_loop)))
    (local.get $sum)))
"#;

pub fn fibo_orig(n: i32) -> i32 {
    if n <= 1 {
        n
    } else {
        let mut a: i32 = 0;
        let mut b: i32 = 1;
        for _ in 2..=n {
            let tmp = a.wrapping_add(b);
            a = b;
            b = tmp;
        }
        b
    }
}

pub fn fill_sort_sum_orig(n: i32, seed: i32) -> i32 {
    if n <= 0 {
        return 0;
    }
    let n = n.min(1024) as usize;
    let mut buf = vec![0i32; n];
    let mut rng = seed;
    for item in buf.iter_mut() {
        rng = rng.wrapping_mul(1103515245).wrapping_add(12345);
        *item = rng;
    }
    for i in 0..n {
        for j in 0..(n - 1 - i) {
            if buf[j] > buf[j + 1] {
                buf.swap(j, j + 1);
            }
        }
    }
    buf.iter().fold(0i32, |sum, &v| sum.wrapping_add(v))
}
