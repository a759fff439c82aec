//! Host functions called from scripts.

use anyhow::Context as _;
use ember_runtime::{
    Arity, EmberError, Engine, EngineConfig, Extension, HostCall, HostError, HostFunction,
    HostKey, HostValue, ParamType,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn double() -> HostFunction {
    HostFunction::new("double", Arity::Exact(1), |args| {
        let n = args[0]
            .as_i64()
            .ok_or_else(|| HostError::new("InvalidArgument", "double() needs an int"))?;
        Ok(HostValue::Int(n * 2))
    })
}

#[test]
fn test_register_and_call() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    engine.register(double()).unwrap();
    let ctx = engine.new_context().unwrap();
    let (value, _) = ctx.execute("return double(21);").unwrap();
    assert_eq!(value, HostValue::Int(42));
}

#[test]
fn test_arguments_arrive_structurally_equal() {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let engine = Engine::builder()
        .function(HostFunction::new("record", Arity::AtLeast(0), move |args| {
            sink.lock().extend(args.iter().cloned());
            Ok(HostValue::map([("ok", true)]))
        }))
        .start()
        .unwrap();
    let ctx = engine.new_context().unwrap();
    let (value, _) = ctx
        .execute("<?php $r = record(1, 'two', [3 => 'x', 'k' => null], 4.5); return $r['ok'];")
        .unwrap();
    assert_eq!(value, HostValue::Bool(true));
    assert_eq!(
        *seen.lock(),
        vec![
            HostValue::Int(1),
            HostValue::from("two"),
            HostValue::map([
                (HostKey::Int(3), HostValue::from("x")),
                (HostKey::from("k"), HostValue::Null),
            ]),
            HostValue::Float(4.5),
        ]
    );
}

#[test]
fn test_host_failure_is_catchable() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    engine.register(double()).unwrap();
    let ctx = engine.new_context().unwrap();
    let (value, _) = ctx
        .execute(
            "<?php
            try {
                double('abc');
            } catch (HostException $e) {
                return [get_class($e), $e->kind, $e->getMessage(), $e instanceof RuntimeException];
            }",
        )
        .unwrap();
    assert_eq!(
        value,
        HostValue::map([
            (0i64, HostValue::from("HostException")),
            (1i64, HostValue::from("InvalidArgument")),
            (2i64, HostValue::from("double() needs an int")),
            (3i64, HostValue::Bool(true)),
        ])
    );
}

#[test]
fn test_uncaught_host_failure_keeps_kind() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    engine
        .register(HostFunction::new("load_user", Arity::Exact(1), |args| {
            let id = args[0].as_i64().unwrap_or_default();
            let row: anyhow::Result<HostValue> = Err(anyhow::anyhow!("no row for id {id}"));
            Ok(row.context("user lookup failed")?)
        }))
        .unwrap();
    let ctx = engine.new_context().unwrap();
    let failure = ctx.execute("<?php return load_user(7);").unwrap_err();
    match failure.error {
        EmberError::ScriptError { kind, message, .. } => {
            assert_eq!(kind, HostError::DEFAULT_KIND);
            assert_eq!(message, "user lookup failed: no row for id 7");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_arity_and_types_checked_before_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let engine = Engine::start(EngineConfig::default()).unwrap();
    engine
        .register(
            HostFunction::new("scale", Arity::Range(1, 2), move |args| {
                counter.fetch_add(1, Ordering::SeqCst);
                let factor = args.get(1).and_then(HostValue::as_i64).unwrap_or(10);
                Ok(HostValue::Int(args[0].as_i64().unwrap_or(0) * factor))
            })
            .params([ParamType::Int, ParamType::Int.nullable()]),
        )
        .unwrap();
    let ctx = engine.new_context().unwrap();

    let (value, _) = ctx
        .execute(
            "<?php
            $out = [scale(2), scale(2, 3), scale(2, null)];
            try { scale(); } catch (ArgumentCountError $e) { $out[] = 'count'; }
            try { scale('x'); } catch (TypeError $e) { $out[] = $e->getMessage(); }
            return $out;",
        )
        .unwrap();
    assert_eq!(
        value,
        HostValue::map([
            (0i64, HostValue::Int(20)),
            (1i64, HostValue::Int(6)),
            (2i64, HostValue::Int(20)),
            (3i64, HostValue::from("count")),
            (
                4i64,
                HostValue::from("scale(): Argument #1 must be of type int, string given")
            ),
        ])
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Host-side calls are checked without entering the engine.
    let failure = ctx.call_function("scale", &[]).unwrap_err();
    assert!(matches!(
        failure.error,
        EmberError::ArgumentMismatch(ref m) if m == "scale() expects between 1 and 2 arguments, 0 given"
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_invoke_script_callable() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    engine
        .register(HostFunction::with_call(
            "apply_twice",
            Arity::Exact(2),
            |call: &mut HostCall<'_>, args: &[HostValue]| {
                let once = call.invoke(&args[0], &args[1..])?;
                call.invoke(&args[0], &[once])
            },
        ))
        .unwrap();
    let ctx = engine.new_context().unwrap();
    let (value, _) = ctx
        .execute(
            "<?php
            function inc($x) { return $x + 1; }
            return [apply_twice(fn($x) => $x * 3, 2), apply_twice('inc', 5)];",
        )
        .unwrap();
    assert_eq!(value, HostValue::map([(0i64, 18i64), (1i64, 7i64)]));
}

#[test]
fn test_script_exception_passes_through_host_frame() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    engine
        .register(HostFunction::with_call(
            "each",
            Arity::Exact(2),
            |call: &mut HostCall<'_>, args: &[HostValue]| {
                let items = args[0].as_map().cloned().unwrap_or_default();
                for item in items.values() {
                    call.invoke(&args[1], std::slice::from_ref(item))?;
                }
                Ok(HostValue::Null)
            },
        ))
        .unwrap();
    let ctx = engine.new_context().unwrap();
    let (value, _) = ctx
        .execute(
            "<?php
            class StopIteration extends Exception { public $at; }
            try {
                each([1, 2, 3], function ($n) {
                    if ($n === 2) { $e = new StopIteration('stop'); $e->at = $n; throw $e; }
                });
            } catch (StopIteration $e) {
                return get_class($e) . '@' . $e->at;
            }",
        )
        .unwrap();
    assert_eq!(value, HostValue::from("StopIteration@2"));
}

#[test]
fn test_reentrant_execute_is_busy() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    let ctx = engine.new_context().unwrap();
    let weak = ctx.weak();
    ctx.register_borrowed("reenter", Arity::Exact(0), move |_| {
        let ctx = weak
            .upgrade()
            .ok_or_else(|| HostError::msg("context gone"))?;
        let execute = match ctx.execute("<?php return 1;") {
            Err(failure) if matches!(failure.error, EmberError::ContextBusy) => "busy",
            _ => "entered",
        };
        let close = match ctx.close() {
            Err(EmberError::ContextBusy) => "busy",
            _ => "closed",
        };
        Ok(HostValue::from(format!("{execute}/{close}")))
    })
    .unwrap();

    let (value, _) = ctx.execute("<?php return reenter();").unwrap();
    assert_eq!(value, HostValue::from("busy/busy"));
    assert!(!ctx.is_closed());
}

#[test]
fn test_register_while_context_open() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    let ctx = engine.new_context().unwrap();
    assert!(ctx.call_function("double", &[HostValue::Int(1)]).is_err());

    engine.register(double()).unwrap();
    let (value, _) = ctx.call_function("double", &[HostValue::Int(4)]).unwrap();
    assert_eq!(value, HostValue::Int(8));

    let err = engine.register(double()).unwrap_err();
    assert!(matches!(err, EmberError::Registration(_)));
    let err = ctx
        .register(HostFunction::new("strlen", Arity::Exact(1), |_| Ok(HostValue::Int(0))))
        .unwrap_err();
    assert!(matches!(err, EmberError::Registration(_)));
}

#[test]
fn test_extension_functions_and_script() {
    let ext = Extension::new("text")
        .function(HostFunction::new("shout", Arity::Exact(1), |args| {
            Ok(HostValue::from(args[0].as_str().unwrap_or_default().to_uppercase()))
        }))
        .with_script(
            "<?php
            define('GREETING', 'hello');
            function greet($name) { return shout(GREETING . ' ' . $name); }",
        );
    let engine = Engine::builder().extension(ext).start().unwrap();

    for _ in 0..2 {
        let ctx = engine.new_context().unwrap();
        let (value, _) = ctx.execute("<?php return greet('ada');").unwrap();
        assert_eq!(value, HostValue::from("HELLO ADA"));
        ctx.close().unwrap();
    }
}

#[test]
fn test_duplicate_names_rejected_at_start() {
    let err = Engine::builder()
        .function(double())
        .extension(Extension::new("math").function(double()))
        .start()
        .unwrap_err();
    assert!(matches!(err, EmberError::Registration(_)));
}

#[test]
fn test_failing_extension_script_fails_context() {
    let ext = Extension::new("broken").with_script("<?php throw new LogicException('bad init');");
    let engine = Engine::builder().extension(ext).start().unwrap();
    let err = engine.new_context().unwrap_err();
    assert_eq!(err.kind(), Some("LogicException"));
    assert!(!engine.has_open_context());
}
