use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use wasmjet::{EngineConfig, NullResolver, Value};
use wasmjet_tests::*;

fn fibo_20_jit_bench(c: &mut Criterion) {
    let instance = instantiate(FIBO_WAT).unwrap();
    let fibo = instance.func("fibo").unwrap();
    c.bench_function("fib 20 wasm jit", |b| {
        b.iter(|| fibo.call(black_box(&[Value::I32(20)])))
    });
}

fn fibo_20_orig_bench(c: &mut Criterion) {
    c.bench_function("fib 20 plain rust", |b| b.iter(|| fibo_orig(black_box(20))));
}

// ─── Memory-intensive benchmarks ─────────────────────────────────────────────

fn memsort_500_jit_bench(c: &mut Criterion) {
    let instance = instantiate(FILL_SORT_SUM_WAT).unwrap();
    let sort = instance.func("fill_sort_sum").unwrap();
    c.bench_function("memsort 500 wasm jit, guard pages", |b| {
        b.iter(|| sort.call(black_box(&[Value::I32(500), Value::I32(42)])))
    });
}

fn memsort_500_checked_bench(c: &mut Criterion) {
    let config = EngineConfig {
        guard_page_elision: false,
        ..EngineConfig::default()
    };
    let instance = instantiate_with(config, FILL_SORT_SUM_WAT, &NullResolver).unwrap();
    let sort = instance.func("fill_sort_sum").unwrap();
    c.bench_function("memsort 500 wasm jit, bounds checks", |b| {
        b.iter(|| sort.call(black_box(&[Value::I32(500), Value::I32(42)])))
    });
}

fn memsort_500_orig_bench(c: &mut Criterion) {
    c.bench_function("memsort 500 plain rust", |b| {
        b.iter(|| fill_sort_sum_orig(black_box(500), black_box(42)))
    });
}

// ─── Instantiation ───────────────────────────────────────────────────────────

fn instantiate_bench(c: &mut Criterion) {
    c.bench_function("instantiate memsort module", |b| {
        b.iter(|| instantiate(black_box(FILL_SORT_SUM_WAT)).unwrap())
    });
}

criterion_group!(
    benches,
    fibo_20_jit_bench,
    fibo_20_orig_bench,
    memsort_500_jit_bench,
    memsort_500_checked_bench,
    memsort_500_orig_bench,
    instantiate_bench
);
criterion_main!(benches);
