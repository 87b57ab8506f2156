use anyhow::Result;
use std::sync::Arc;
use wasmjet::{TrapReason, Value};
use wasmjet_tests::*;

const ATOMIC_WAT: &str = r#"
(module
  (memory (export "memory") 1 1 shared)
  (func (export "load") (param i32) (result i32) (i32.atomic.load (local.get 0)))
  (func (export "store") (param i32 i32) (i32.atomic.store (local.get 0) (local.get 1)))
  (func (export "add") (param i32 i32) (result i32)
    (i32.atomic.rmw.add (local.get 0) (local.get 1)))
  (func (export "xchg8") (param i32 i32) (result i32)
    (i32.atomic.rmw8.xchg_u (local.get 0) (local.get 1)))
  (func (export "cmpxchg") (param i32 i32 i32) (result i32)
    (i32.atomic.rmw.cmpxchg (local.get 0) (local.get 1) (local.get 2)))
  (func (export "add64") (param i32 i64) (result i64)
    (i64.atomic.rmw.add (local.get 0) (local.get 1)))
  (func (export "fence") (atomic.fence))
  (func (export "count") (param $addr i32) (param $n i32)
    (block $done
      (loop $next
        (br_if $done (i32.eqz (local.get $n)))
        (drop (i32.atomic.rmw.add (local.get $addr) (i32.const 1)))
        (local.set $n (i32.sub (local.get $n) (i32.const 1)))
        (br $next))))
)
"#;

#[test]
fn read_modify_write_returns_old_value() -> Result<()> {
    let instance = instantiate(ATOMIC_WAT)?;
    instance.invoke("store", &[Value::I32(8), Value::I32(40)])?;
    assert_eq!(call_i32(&instance, "add", &[8, 2])?, 40);
    assert_eq!(call_i32(&instance, "load", &[8])?, 42);

    instance.invoke("store", &[Value::I32(16), Value::I32(0x1234)])?;
    assert_eq!(call_i32(&instance, "xchg8", &[16, 0x1ff])?, 0x34);
    assert_eq!(call_i32(&instance, "load", &[16])?, 0x12ff);

    assert_eq!(
        instance.invoke("add64", &[Value::I32(24), Value::I64(1 << 40)])?,
        [Value::I64(0)]
    );
    assert_eq!(
        instance.invoke("add64", &[Value::I32(24), Value::I64(1)])?,
        [Value::I64(1 << 40)]
    );
    instance.invoke("fence", &[])?;
    Ok(())
}

#[test]
fn compare_exchange() -> Result<()> {
    let instance = instantiate(ATOMIC_WAT)?;
    instance.invoke("store", &[Value::I32(0), Value::I32(5)])?;
    assert_eq!(call_i32(&instance, "cmpxchg", &[0, 4, 9])?, 5);
    assert_eq!(call_i32(&instance, "load", &[0])?, 5);
    assert_eq!(call_i32(&instance, "cmpxchg", &[0, 5, 9])?, 5);
    assert_eq!(call_i32(&instance, "load", &[0])?, 9);
    Ok(())
}

#[test]
fn misaligned_access_traps() -> Result<()> {
    for config in both_memory_modes() {
        let instance = instantiate_with(config, ATOMIC_WAT, &wasmjet::NullResolver)?;
        assert_eq!(
            trap_reason(call_i32(&instance, "load", &[2])),
            TrapReason::MisalignedAtomic
        );
        assert_eq!(
            trap_reason(call_i32(&instance, "add", &[1, 1])),
            TrapReason::MisalignedAtomic
        );
        assert_eq!(
            trap_reason(instance.invoke("add64", &[Value::I32(4), Value::I64(1)])),
            TrapReason::MisalignedAtomic
        );
        // Byte accesses are always aligned.
        call_i32(&instance, "xchg8", &[3, 1])?;
        assert_eq!(
            trap_reason(call_i32(&instance, "load", &[65536])),
            TrapReason::MemoryOutOfBounds
        );
    }
    Ok(())
}

#[test]
fn concurrent_increments_are_not_lost() -> Result<()> {
    let instance = Arc::new(instantiate(ATOMIC_WAT)?);
    let threads: Vec<_> = (0..4)
        .map(|_| {
            let instance = Arc::clone(&instance);
            std::thread::spawn(move || instance.invoke("count", &[Value::I32(64), Value::I32(10_000)]))
        })
        .collect();
    for thread in threads {
        thread.join().unwrap()?;
    }
    assert_eq!(call_i32(&instance, "load", &[64])?, 40_000);
    Ok(())
}
