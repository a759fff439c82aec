//! Engine start/shutdown and the one-context rule.

use ember_runtime::{
    Arity, EmberError, Engine, EngineConfig, EngineState, HostCall, HostFunction, HostValue,
};

#[test]
fn test_second_context_rejected_until_close() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    let first = engine.new_context().unwrap();
    assert!(engine.has_open_context());

    let err = engine.new_context().unwrap_err();
    assert!(matches!(err, EmberError::ContextAlreadyOpen));

    first.close().unwrap();
    assert!(!engine.has_open_context());
    let second = engine.new_context().unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(engine.contexts_opened(), 2);
}

#[test]
fn test_shutdown_with_open_context() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    let ctx = engine.new_context().unwrap();

    let err = engine.shutdown().unwrap_err();
    assert!(matches!(err, EmberError::ContextStillOpen));
    assert!(engine.is_running());

    ctx.close().unwrap();
    engine.shutdown().unwrap();
    assert_eq!(engine.state(), EngineState::Shutdown);
    assert_eq!(Engine::thread_state(), EngineState::Shutdown);

    // Repeated shutdown is a no-op.
    engine.shutdown().unwrap();
}

#[test]
fn test_dropping_context_closes_it() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    {
        let ctx = engine.new_context().unwrap();
        ctx.execute("<?php $x = 1;").unwrap();
    }
    assert!(!engine.has_open_context());
    engine.shutdown().unwrap();
}

#[test]
fn test_one_engine_per_thread() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    assert_eq!(Engine::thread_state(), EngineState::Ready);

    let err = Engine::start(EngineConfig::default()).unwrap_err();
    assert!(matches!(err, EmberError::AlreadyRunning));

    // Other threads have their own slot.
    std::thread::spawn(|| {
        let engine = Engine::start(EngineConfig::default()).unwrap();
        engine.shutdown().unwrap();
    })
    .join()
    .unwrap();

    engine.shutdown().unwrap();
    let restarted = Engine::start(EngineConfig::default()).unwrap();
    assert!(restarted.is_running());
}

#[test]
fn test_calls_after_shutdown_fail() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    engine.shutdown().unwrap();

    assert!(matches!(engine.new_context(), Err(EmberError::EngineNotRunning)));
    let f = HostFunction::new("noop", Arity::Exact(0), |_| Ok(HostValue::Null));
    assert!(matches!(engine.register(f), Err(EmberError::EngineNotRunning)));
}

#[test]
fn test_invalid_config_rejected_at_start() {
    let err = Engine::start(EngineConfig::new().engine_binary_path("/no/such/libember.so"))
        .unwrap_err();
    assert!(matches!(err, EmberError::Config(_)));
    assert_ne!(Engine::thread_state(), EngineState::Ready);

    let err = Engine::start(EngineConfig::new().ini("precision", "many")).unwrap_err();
    assert!(matches!(err, EmberError::Config(_)));
}

#[test]
fn test_ini_overrides_apply() {
    let engine = Engine::start(
        EngineConfig::new()
            .ini("precision", "4")
            .ini("app.mode", "test"),
    )
    .unwrap();
    let ctx = engine.new_context().unwrap();
    let (value, diagnostics) = ctx
        .execute("<?php echo 1/3; return ini_get('app.mode');")
        .unwrap();
    assert_eq!(diagnostics.output, "0.3333");
    assert_eq!(value, HostValue::from("test"));
}

#[test]
fn test_engine_fault_terminates_engine() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    engine
        .register(HostFunction::with_call(
            "crash",
            Arity::Exact(0),
            |call: &mut HostCall<'_>, _args: &[HostValue]| {
                Err(call.fault("native runtime lost its heap"))
            },
        ))
        .unwrap();

    let ctx = engine.new_context().unwrap();
    let failure = ctx
        .execute("<?php try { crash(); } catch (Throwable $e) { return 'caught'; }")
        .unwrap_err();
    assert!(matches!(failure.error, EmberError::EngineFault(ref m) if m.contains("lost its heap")));

    assert!(ctx.is_closed());
    assert_eq!(engine.state(), EngineState::Shutdown);
    assert!(matches!(engine.new_context(), Err(EmberError::EngineNotRunning)));
    let err = ctx.execute("<?php return 1;").unwrap_err();
    assert!(matches!(err.error, EmberError::ContextClosed));

    // The slot is free again after a fault.
    let engine = Engine::start(EngineConfig::default()).unwrap();
    assert!(engine.is_running());
}

#[test]
fn test_register_class_applies_to_later_contexts() {
    #[derive(Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Point {
        x: i64,
        y: i64,
    }

    impl ember_runtime::EngineClass for Point {
        const CLASS: &'static str = "Point";
    }

    let engine = Engine::start(EngineConfig::default()).unwrap();
    engine.register_class::<Point>().unwrap();
    let ctx = engine.new_context().unwrap();

    let (value, _) = ctx
        .execute("<?php $p = new Point(); $p->x = 3; $p->y = 4; return $p;")
        .unwrap();
    let point: Point = point_of(&value);
    assert_eq!(point, Point { x: 3, y: 4 });

    let handle = ctx.instantiate(&Point { x: 1, y: 2 }).unwrap();
    ctx.bind_handle("p", &handle).unwrap();
    let (sum, _) = ctx.execute("<?php return get_class($p) . ':' . ($p->x + $p->y);").unwrap();
    assert_eq!(sum, HostValue::from("Point:3"));
    assert_eq!(ctx.extract_class::<Point>(&handle).unwrap(), Point { x: 1, y: 2 });

    fn point_of(value: &HostValue) -> Point {
        let object = value.as_object().unwrap();
        assert_eq!(object.class, "Point");
        Point {
            x: object.get("x").and_then(HostValue::as_i64).unwrap(),
            y: object.get("y").and_then(HostValue::as_i64).unwrap(),
        }
    }
}
