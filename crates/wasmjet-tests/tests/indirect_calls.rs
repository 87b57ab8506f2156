use anyhow::Result;
use wasmjet::{InstanceResolver, TrapReason};
use wasmjet_tests::*;

const TABLE_WAT: &str = r#"
(module
  (type $binop (func (param i32 i32) (result i32)))
  (type $unop (func (param i32) (result i32)))
  (table (export "table") 5 funcref)
  (elem (i32.const 0) $add $sub $neg)
  (func $add (type $binop) (i32.add (local.get 0) (local.get 1)))
  (func $sub (type $binop) (i32.sub (local.get 0) (local.get 1)))
  (func $neg (type $unop) (i32.sub (i32.const 0) (local.get 0)))
  (func (export "apply") (param $slot i32) (param i32 i32) (result i32)
    (call_indirect (type $binop) (local.get 1) (local.get 2) (local.get $slot)))
  (func (export "size") (result i32) (table.size))
)
"#;

#[test]
fn dispatches_through_table() -> Result<()> {
    let instance = instantiate(TABLE_WAT)?;
    assert_eq!(call_i32(&instance, "apply", &[0, 5, 3])?, 8);
    assert_eq!(call_i32(&instance, "apply", &[1, 5, 3])?, 2);
    assert_eq!(call_i32(&instance, "size", &[])?, 5);
    Ok(())
}

#[test]
fn signature_mismatch_traps() -> Result<()> {
    let instance = instantiate(TABLE_WAT)?;
    assert_eq!(
        trap_reason(call_i32(&instance, "apply", &[2, 5, 3])),
        TrapReason::IndirectCallSignatureMismatch
    );
    Ok(())
}

#[test]
fn null_slot_traps() -> Result<()> {
    let instance = instantiate(TABLE_WAT)?;
    assert_eq!(
        trap_reason(call_i32(&instance, "apply", &[3, 0, 0])),
        TrapReason::UndefinedElement
    );
    Ok(())
}

#[test]
fn index_past_end_traps() -> Result<()> {
    let instance = instantiate(TABLE_WAT)?;
    for slot in [5, 1000, -1] {
        assert_eq!(
            trap_reason(call_i32(&instance, "apply", &[slot, 0, 0])),
            TrapReason::TableOutOfBounds,
            "slot {slot}"
        );
    }
    Ok(())
}

#[test]
fn types_match_structurally_across_modules() -> Result<()> {
    // A table filled by one module and called through by another: the
    // callee's type is declared separately in each, so only structural
    // identity makes the check pass.
    let provider = instantiate(
        r#"
        (module
          (table (export "table") 2 funcref)
          (elem (i32.const 1) $triple)
          (func $triple (param i32) (result i32) (i32.mul (local.get 0) (i32.const 3))))
        "#,
    )?;
    let mut resolver = InstanceResolver::new();
    resolver.register("provider", provider.clone());
    let consumer = provider.compartment().instantiate(
        &wasmjet::Module::from_text(
            r#"
            (module
              (type $other (func (param i64)))
              (type $unop (func (param i32) (result i32)))
              (import "provider" "table" (table 2 funcref))
              (func (export "call") (param i32 i32) (result i32)
                (call_indirect (type $unop) (local.get 1) (local.get 0))))
            "#,
        )?,
        &resolver,
    )?;
    assert_eq!(call_i32(&consumer, "call", &[1, 14])?, 42);
    assert_eq!(
        trap_reason(call_i32(&consumer, "call", &[0, 14])),
        TrapReason::UndefinedElement
    );
    Ok(())
}
