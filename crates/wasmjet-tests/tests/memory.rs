use anyhow::Result;
use wasmjet::{NullResolver, TrapReason, Value};
use wasmjet_runtime::PAGE_SIZE;
use wasmjet_tests::*;

const MEMORY_WAT: &str = r#"
(module
  (memory (export "memory") 1 4)
  (data (i32.const 16) "\2a\00\00\00hello")
  (func (export "load") (param i32) (result i32) (i32.load (local.get 0)))
  (func (export "load_offset") (param i32) (result i32) (i32.load offset=8 (local.get 0)))
  (func (export "load8_s") (param i32) (result i32) (i32.load8_s (local.get 0)))
  (func (export "load16_u") (param i32) (result i32) (i32.load16_u (local.get 0)))
  (func (export "store") (param i32 i32) (i32.store (local.get 0) (local.get 1)))
  (func (export "store64") (param i32 i64) (i64.store (local.get 0) (local.get 1)))
  (func (export "load64") (param i32) (result i64) (i64.load (local.get 0)))
  (func (export "size") (result i32) (memory.size))
  (func (export "grow") (param i32) (result i32) (memory.grow (local.get 0)))
  (func (export "fill") (param i32 i32 i32) (memory.fill (local.get 0) (local.get 1) (local.get 2)))
  (func (export "copy") (param i32 i32 i32) (memory.copy (local.get 0) (local.get 1) (local.get 2)))
)
"#;

#[test]
fn data_segments_are_visible() -> Result<()> {
    for config in both_memory_modes() {
        let instance = instantiate_with(config, MEMORY_WAT, &NullResolver)?;
        assert_eq!(call_i32(&instance, "load", &[16])?, 42);
        assert_eq!(call_i32(&instance, "load_offset", &[12])?, i32::from_le_bytes(*b"hell"));
        assert_eq!(call_i32(&instance, "load_offset", &[13])?, i32::from_le_bytes(*b"ello"));
        assert_eq!(call_i32(&instance, "load", &[0])?, 0);

        let memory = instance.memory("memory").unwrap();
        let mut buf = [0u8; 5];
        memory.read(20, &mut buf)?;
        assert_eq!(&buf, b"hello");
    }
    Ok(())
}

#[test]
fn narrow_accesses_extend() -> Result<()> {
    let instance = instantiate(MEMORY_WAT)?;
    instance.invoke("store", &[Value::I32(0), Value::I32(0x0001_80ff)])?;
    assert_eq!(call_i32(&instance, "load8_s", &[0])?, -1);
    assert_eq!(call_i32(&instance, "load16_u", &[0])?, 0x80ff);
    instance.invoke("store64", &[Value::I32(8), Value::I64(-2)])?;
    assert_eq!(instance.invoke("load64", &[Value::I32(8)])?, [Value::I64(-2)]);
    Ok(())
}

#[test]
fn accesses_at_the_boundary() -> Result<()> {
    let last = PAGE_SIZE as i32 - 4;
    for config in both_memory_modes() {
        let guarded = config.guard_page_elision;
        let instance = instantiate_with(config, MEMORY_WAT, &NullResolver)?;
        instance.invoke("store", &[Value::I32(last), Value::I32(7)])?;
        assert_eq!(call_i32(&instance, "load", &[last])?, 7);

        for address in [PAGE_SIZE as i32, last + 1, -1, i32::MIN] {
            assert_eq!(
                trap_reason(call_i32(&instance, "load", &[address])),
                TrapReason::MemoryOutOfBounds,
                "load at {address:#x}, guarded: {guarded}"
            );
        }
        assert_eq!(
            trap_reason(instance.invoke("store", &[Value::I32(PAGE_SIZE as i32), Value::I32(1)])),
            TrapReason::MemoryOutOfBounds
        );
        // The offset is added without wrapping.
        assert_eq!(
            trap_reason(call_i32(&instance, "load_offset", &[-4])),
            TrapReason::MemoryOutOfBounds
        );
    }
    Ok(())
}

#[test]
fn grow_extends_accessible_range() -> Result<()> {
    for config in both_memory_modes() {
        let instance = instantiate_with(config, MEMORY_WAT, &NullResolver)?;
        let next_page = PAGE_SIZE as i32;
        assert_eq!(call_i32(&instance, "size", &[])?, 1);
        assert_eq!(
            trap_reason(call_i32(&instance, "load", &[next_page])),
            TrapReason::MemoryOutOfBounds
        );

        assert_eq!(call_i32(&instance, "grow", &[1])?, 1);
        assert_eq!(call_i32(&instance, "size", &[])?, 2);
        assert_eq!(call_i32(&instance, "load", &[next_page])?, 0);
        instance.invoke("store", &[Value::I32(next_page), Value::I32(9)])?;
        assert_eq!(call_i32(&instance, "load", &[next_page])?, 9);

        assert_eq!(call_i32(&instance, "grow", &[0])?, 2);
        assert_eq!(call_i32(&instance, "grow", &[3])?, -1);
        assert_eq!(call_i32(&instance, "size", &[])?, 2);
        assert_eq!(call_i32(&instance, "grow", &[2])?, 2);
        assert_eq!(call_i32(&instance, "size", &[])?, 4);
        assert_eq!(instance.memory("memory").unwrap().size(), 4);
    }
    Ok(())
}

#[test]
fn bulk_fill_and_copy() -> Result<()> {
    let instance = instantiate(MEMORY_WAT)?;
    instance.invoke("fill", &[Value::I32(100), Value::I32(0xab), Value::I32(8)])?;
    assert_eq!(call_i32(&instance, "load", &[100])?, 0xabab_abab_u32 as i32);
    instance.invoke("copy", &[Value::I32(102), Value::I32(16), Value::I32(4)])?;
    assert_eq!(call_i32(&instance, "load", &[100])?, 0x002a_abab);

    assert_eq!(
        trap_reason(instance.invoke(
            "fill",
            &[Value::I32(PAGE_SIZE as i32 - 2), Value::I32(0), Value::I32(4)]
        )),
        TrapReason::MemoryOutOfBounds
    );
    assert_eq!(
        trap_reason(instance.invoke(
            "copy",
            &[Value::I32(0), Value::I32(PAGE_SIZE as i32), Value::I32(1)]
        )),
        TrapReason::MemoryOutOfBounds
    );
    // Zero-length operations at the end are allowed.
    instance.invoke("fill", &[Value::I32(PAGE_SIZE as i32), Value::I32(0), Value::I32(0)])?;
    Ok(())
}

#[test]
fn host_sees_guest_writes() -> Result<()> {
    let instance = instantiate(MEMORY_WAT)?;
    let memory = instance.memory("memory").unwrap();
    instance.invoke("store", &[Value::I32(64), Value::I32(-559038737)])?;
    assert_eq!(memory.load_i32(64)?, -559038737);
    memory.store_i32(68, 1234)?;
    assert_eq!(call_i32(&instance, "load", &[68])?, 1234);
    Ok(())
}
