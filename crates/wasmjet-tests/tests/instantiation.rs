use anyhow::Result;
use wasmjet::{
    Compartment, Engine, EngineConfig, ExternKind, Func, FuncType, GlobalType, ImportErrorKind,
    InstanceResolver, InstantiationError, MapResolver, MemoryType, Module, NullResolver,
    TrapReason, ValType, Value,
};
use wasmjet_tests::*;

fn compartment() -> Result<Compartment> {
    Ok(Compartment::new(&Engine::new(EngineConfig::default())?))
}

#[test]
fn unresolved_imports_are_all_reported() -> Result<()> {
    let compartment = compartment()?;
    let module = Module::from_text(
        r#"(module
            (import "env" "log" (func (param i32)))
            (import "env" "memory" (memory 1))
            (import "env" "base" (global i32)))"#,
    )?;
    let err = compartment.instantiate(&module, &NullResolver).unwrap_err();
    let InstantiationError::Link(errors) = &err else {
        panic!("expected a link error, got {err:?}");
    };
    let names: Vec<_> = errors.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["log", "memory", "base"]);
    assert!(errors.iter().all(|e| e.kind == ImportErrorKind::Unresolved));

    let message = err.to_string();
    assert!(message.contains("import env.log: unresolved"), "{message}");
    assert!(message.contains("import env.base: unresolved"), "{message}");
    Ok(())
}

#[test]
fn import_kind_and_limits_are_checked() -> Result<()> {
    let compartment = compartment()?;
    let module = Module::from_text(
        r#"(module
            (import "env" "f" (memory 1))
            (import "env" "memory" (memory 2)))"#,
    )?;
    let small = compartment.create_memory(MemoryType {
        initial: 1,
        maximum: None,
        shared: false,
    })?;
    let func = Func::wrap_host(&compartment, FuncType::new([], []), |_| Ok(vec![]))?;
    let mut resolver = MapResolver::new();
    resolver.define("env", "f", func).define("env", "memory", small);

    match compartment.instantiate(&module, &resolver) {
        Err(InstantiationError::Link(errors)) => {
            assert_eq!(
                errors[0].kind,
                ImportErrorKind::KindMismatch {
                    expected: ExternKind::Memory,
                    found: ExternKind::Func,
                }
            );
            assert!(matches!(errors[1].kind, ImportErrorKind::TypeMismatch { .. }));
        }
        other => panic!("expected link errors, got {other:?}"),
    }
    Ok(())
}

#[test]
fn out_of_bounds_segment_writes_nothing() -> Result<()> {
    let compartment = compartment()?;
    let memory = compartment.create_memory(MemoryType {
        initial: 1,
        maximum: None,
        shared: false,
    })?;
    let mut resolver = MapResolver::new();
    resolver.define("env", "memory", memory.clone());
    let module = Module::from_text(
        r#"(module
            (import "env" "memory" (memory 1))
            (data (i32.const 0) "first")
            (data (i32.const 65534) "xyz"))"#,
    )?;

    match compartment.instantiate(&module, &resolver) {
        Err(InstantiationError::SegmentOutOfBounds {
            kind,
            segment,
            offset,
            len,
            size,
        }) => {
            assert_eq!(kind, ExternKind::Memory);
            assert_eq!((segment, offset, len, size), (1, 65534, 3, 65536));
        }
        other => panic!("expected a segment error, got {other:?}"),
    }
    assert_eq!(memory.load_u8(0)?, 0);
    Ok(())
}

#[test]
fn out_of_bounds_element_segment() -> Result<()> {
    let err = instantiate(
        r#"(module
            (table 2 funcref)
            (elem (i32.const 1) $f $f)
            (func $f))"#,
    )
    .unwrap_err();
    match err.downcast_ref::<InstantiationError>() {
        Some(InstantiationError::SegmentOutOfBounds { kind, .. }) => {
            assert_eq!(*kind, ExternKind::Table)
        }
        other => panic!("expected a segment error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn instances_do_not_share_state() -> Result<()> {
    let compartment = compartment()?;
    let module = Module::from_text(
        r#"(module
            (memory 1)
            (global $count (mut i32) (i32.const 0))
            (func (export "bump") (result i32)
              (global.set $count (i32.add (global.get $count) (i32.const 1)))
              (i32.store (i32.const 0) (global.get $count))
              (i32.load (i32.const 0))))"#,
    )?;
    let a = compartment.instantiate(&module, &NullResolver)?;
    let b = compartment.instantiate(&module, &NullResolver)?;
    assert_eq!(call_i32(&a, "bump", &[])?, 1);
    assert_eq!(call_i32(&a, "bump", &[])?, 2);
    assert_eq!(call_i32(&b, "bump", &[])?, 1);
    Ok(())
}

#[test]
fn start_function_runs_once() -> Result<()> {
    let instance = instantiate(
        r#"(module
            (global $g (export "g") (mut i32) (i32.const 1))
            (func $init (global.set $g (i32.mul (global.get $g) (i32.const 10))))
            (start $init))"#,
    )?;
    assert_eq!(instance.global("g").unwrap().get(), Value::I32(10));
    Ok(())
}

#[test]
fn trapping_start_function_fails_instantiation() -> Result<()> {
    let err = instantiate(r#"(module (func $boom (unreachable)) (start $boom))"#).unwrap_err();
    match err.downcast_ref::<InstantiationError>() {
        Some(InstantiationError::Start(trap)) => assert_eq!(trap.reason, TrapReason::Unreachable),
        other => panic!("expected a start trap, got {other:?}"),
    }
    Ok(())
}

#[test]
fn exports_flow_between_instances() -> Result<()> {
    let compartment = compartment()?;
    let lib = compartment.instantiate(
        &Module::from_text(
            r#"(module
                (memory (export "memory") 1)
                (global (export "counter") (mut i64) (i64.const 5))
                (func (export "double") (param i32) (result i32)
                  (i32.shl (local.get 0) (i32.const 1))))"#,
        )?,
        &NullResolver,
    )?;
    let mut resolver = InstanceResolver::new();
    resolver.register("lib", lib.clone());

    let app = compartment.instantiate(
        &Module::from_text(
            r#"(module
                (import "lib" "double" (func $double (param i32) (result i32)))
                (import "lib" "memory" (memory 1))
                (import "lib" "counter" (global $counter (mut i64)))
                (func (export "run") (param i32) (result i32)
                  (global.set $counter (i64.add (global.get $counter) (i64.const 1)))
                  (i32.store (i32.const 8) (call $double (local.get 0)))
                  (i32.load (i32.const 8))))"#,
        )?,
        &resolver,
    )?;

    assert_eq!(call_i32(&app, "run", &[21])?, 42);
    assert_eq!(lib.memory("memory").unwrap().load_i32(8)?, 42);
    assert_eq!(lib.global("counter").unwrap().get(), Value::I64(6));
    Ok(())
}

#[test]
fn host_globals_initialize_module_globals() -> Result<()> {
    let compartment = compartment()?;
    let base = compartment.create_global(
        GlobalType {
            content: ValType::I32,
            mutable: false,
        },
        Value::I32(1024),
    )?;
    let mut resolver = MapResolver::new();
    resolver.define("env", "base", base);
    let instance = compartment.instantiate(
        &Module::from_text(
            r#"(module
                (import "env" "base" (global $base i32))
                (memory 1)
                (global $top i32 (global.get $base))
                (data (global.get $base) "\07")
                (func (export "top") (result i32) (global.get $top))
                (func (export "first") (result i32) (i32.load8_u (global.get $base))))"#,
        )?,
        &resolver,
    )?;
    assert_eq!(call_i32(&instance, "top", &[])?, 1024);
    assert_eq!(call_i32(&instance, "first", &[])?, 7);
    Ok(())
}

#[test]
fn functions_cross_compartments() -> Result<()> {
    let engine = Engine::new(EngineConfig::default())?;
    let home = Compartment::new(&engine);
    let away = Compartment::new(&engine);

    let lib = home.instantiate(
        &Module::from_text(
            r#"(module
                (memory (export "memory") 1)
                (func (export "square") (param i32) (result i32)
                  (i32.mul (local.get 0) (local.get 0))))"#,
        )?,
        &NullResolver,
    )?;
    let mut resolver = InstanceResolver::new();
    resolver.register("lib", lib);

    let app = away.instantiate(
        &Module::from_text(
            r#"(module
                (import "lib" "square" (func $square (param i32) (result i32)))
                (func (export "run") (param i32) (result i32) (call $square (local.get 0))))"#,
        )?,
        &resolver,
    )?;
    assert_eq!(call_i32(&app, "run", &[12])?, 144);

    let err = away
        .instantiate(
            &Module::from_text(r#"(module (import "lib" "memory" (memory 1)))"#)?,
            &resolver,
        )
        .unwrap_err();
    match err {
        InstantiationError::Link(errors) => {
            assert_eq!(errors[0].kind, ImportErrorKind::ForeignCompartment)
        }
        other => panic!("expected a link error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn instances_outlive_their_compartment_handle() -> Result<()> {
    let instance = {
        let compartment = compartment()?;
        compartment.instantiate(&Module::from_text(FIBO_WAT)?, &NullResolver)?
    };
    assert_eq!(call_i32(&instance, "fibo", &[10])?, 55);
    Ok(())
}
