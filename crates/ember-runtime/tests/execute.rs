//! Script execution, conversion of results and diagnostics.

use ember_runtime::{
    CollectingSink, ConvertOptions, CyclePolicy, EmberError, Engine, EngineConfig, HostKey,
    HostObject, HostValue, MemorySourceProvider, WarningLevel,
};
use std::sync::Arc;

fn engine() -> Engine {
    Engine::start(EngineConfig::default()).unwrap()
}

#[test]
fn test_map_keeps_insertion_order() {
    let engine = engine();
    let ctx = engine.new_context().unwrap();
    let (value, _) = ctx.execute("<?php return ['a' => 1, 'b' => 2];").unwrap();
    assert_eq!(value, HostValue::map([("a", 1i64), ("b", 2i64)]));

    let keys: Vec<_> = value.as_map().unwrap().keys().cloned().collect();
    assert_eq!(keys, [HostKey::from("a"), HostKey::from("b")]);

    let (value, _) = ctx.execute("<?php return ['z' => 1, 10 => 2, 'a' => 3];").unwrap();
    let keys: Vec<_> = value.as_map().unwrap().keys().cloned().collect();
    assert_eq!(keys, [HostKey::from("z"), HostKey::Int(10), HostKey::from("a")]);
}

#[test]
fn test_scalar_results() {
    let engine = engine();
    let ctx = engine.new_context().unwrap();
    let cases = [
        ("<?php return null;", HostValue::Null),
        ("<?php return 1 < 2;", HostValue::Bool(true)),
        ("<?php return intdiv(7, 2);", HostValue::Int(3)),
        ("<?php return 1.5 * 2;", HostValue::Float(3.0)),
        ("<?php return 'a' . 'b';", HostValue::from("ab")),
        ("<?php $x = 5;", HostValue::Null),
    ];
    for (source, expected) in cases {
        let (value, _) = ctx.execute(source).unwrap();
        assert_eq!(value, expected, "{source}");
    }
}

#[test]
fn test_sequences_option() {
    let config = EngineConfig::new().convert_options(ConvertOptions::default().with_sequences(true));
    let engine = Engine::start(config).unwrap();
    let ctx = engine.new_context().unwrap();
    let (value, _) = ctx.execute("<?php return [10, 20, 30];").unwrap();
    assert_eq!(
        value,
        HostValue::List(vec![10i64.into(), 20i64.into(), 30i64.into()])
    );
}

#[test]
fn test_objects_convert_to_property_bags() {
    let engine = engine();
    let ctx = engine.new_context().unwrap();
    let (value, _) = ctx
        .execute(
            "<?php class User { public $name = 'ada'; public $tags = []; }
             $u = new User(); $u->tags[] = 'admin'; return $u;",
        )
        .unwrap();
    let expected = HostObject::new("User")
        .with("name", "ada")
        .with("tags", HostValue::map([(0i64, "admin")]));
    assert_eq!(value, HostValue::Object(expected));
}

#[test]
fn test_self_reference_terminates() {
    let engine = engine();
    let ctx = engine.new_context().unwrap();
    let source = "<?php $o = new stdClass(); $o->self = $o; return $o;";

    let (value, _) = ctx.execute(source).unwrap();
    let object = value.as_object().unwrap();
    assert_eq!(object.get("self"), Some(&HostValue::BackRef(0)));

    let handle = ctx.execute_handle(source).unwrap().0;
    let err = ctx.to_json(&handle).unwrap_err();
    assert!(matches!(
        err,
        EmberError::Core(ember_runtime::CoreError::CyclicValue(_))
    ));
    ctx.close().unwrap();

    engine.shutdown().unwrap();

    let config = EngineConfig::new()
        .convert_options(ConvertOptions::default().with_cycles(CyclePolicy::Reject));
    let engine = Engine::start(config).unwrap();
    let ctx = engine.new_context().unwrap();
    let failure = ctx.execute(source).unwrap_err();
    assert!(matches!(
        failure.error,
        EmberError::Core(ember_runtime::CoreError::CyclicValue(_))
    ));
}

#[test]
fn test_output_and_warnings_returned() {
    let engine = engine();
    let ctx = engine.new_context().unwrap();
    let (value, diagnostics) = ctx
        .execute(
            "<?php echo 'hello ';
             trigger_error('disk almost full', E_USER_WARNING);
             echo $missing ?? 'world';
             return strlen($undefined);",
        )
        .unwrap();
    assert_eq!(value, HostValue::Int(0));
    assert_eq!(diagnostics.output, "hello world");
    let messages: Vec<_> = diagnostics.messages().collect();
    assert_eq!(messages, ["disk almost full", "Undefined variable $undefined"]);
    assert_eq!(diagnostics.warnings[0].level, WarningLevel::UserWarning);
    assert_eq!(diagnostics.warnings[1].level, WarningLevel::Warning);

    // Buffers are per execution.
    let (_, diagnostics) = ctx.execute("<?php return 1;").unwrap();
    assert!(diagnostics.is_empty());
}

#[test]
fn test_sink_receives_diagnostics() {
    let sink = CollectingSink::new();
    let engine = Engine::builder().sink(sink.clone()).start().unwrap();
    let ctx = engine.new_context().unwrap();
    ctx.execute("<?php echo 'a';").unwrap();
    ctx.execute("<?php return 1;").unwrap();
    let _ = ctx.execute("<?php echo 'b'; throw new Exception('x');");

    let batches = sink.take();
    let output: Vec<_> = batches.iter().map(|(_, d)| d.output.as_str()).collect();
    assert_eq!(output, ["a", "b"]);
    assert!(batches.iter().all(|(id, _)| *id == ctx.id()));
}

#[test]
fn test_uncaught_exception_is_script_error() {
    let engine = engine();
    let ctx = engine.new_context().unwrap();
    let failure = ctx
        .execute_named(
            "<?php\nfunction check($n) {\n    throw new DomainException(\"bad $n\");\n}\ncheck(3);",
            "checks.php",
        )
        .unwrap_err();
    match failure.error {
        EmberError::ScriptError {
            message,
            kind,
            file,
            line,
            ..
        } => {
            assert_eq!(kind, "DomainException");
            assert_eq!(message, "bad 3");
            assert_eq!(file, "checks.php");
            assert_eq!(line, 3);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_parse_error() {
    let engine = engine();
    let ctx = engine.new_context().unwrap();
    let failure = ctx.execute("<?php return (1 + ;").unwrap_err();
    assert_eq!(failure.error.kind(), Some("ParseError"));
    assert!(ctx.execute("<?php return 1;").is_ok());
}

#[test]
fn test_deep_nesting_is_a_parse_error() {
    let engine = engine();
    let ctx = engine.new_context().unwrap();
    let source = format!("<?php return {}1{};", "(".repeat(200_000), ")".repeat(200_000));
    let failure = ctx.execute(&source).unwrap_err();
    assert_eq!(failure.error.kind(), Some("ParseError"));
    assert!(failure.error.to_string().contains("maximum nesting level"));
    let (value, _) = ctx.execute("<?php return ((1 + 2) * 3);").unwrap();
    assert_eq!(value, HostValue::Int(9));
}

#[test]
fn test_globals_round_trip() {
    let engine = engine();
    let ctx = engine.new_context().unwrap();
    ctx.bind_global("limit", 3i64).unwrap();
    ctx.bind_global(
        "$config",
        HostValue::map([("name", HostValue::from("svc")), ("port", HostValue::Int(8080))]),
    )
    .unwrap();

    let (value, _) = ctx
        .execute("<?php $limit++; return $config['name'] . ':' . $config['port'];")
        .unwrap();
    assert_eq!(value, HostValue::from("svc:8080"));
    assert_eq!(ctx.global("limit").unwrap(), Some(HostValue::Int(4)));
    assert_eq!(ctx.global("nope").unwrap(), None);

    assert!(ctx.unset_global("limit").unwrap());
    assert!(!ctx.unset_global("limit").unwrap());
    let (value, _) = ctx.execute("<?php return isset($limit);").unwrap();
    assert_eq!(value, HostValue::Bool(false));
}

#[test]
fn test_context_state_does_not_leak() {
    let engine = engine();
    let ctx = engine.new_context().unwrap();
    ctx.execute("<?php $shared = 1; function helper() { return 2; }").unwrap();
    let (value, _) = ctx.execute("<?php return $shared + helper();").unwrap();
    assert_eq!(value, HostValue::Int(3));
    ctx.close().unwrap();

    let ctx = engine.new_context().unwrap();
    let (value, _) = ctx
        .execute("<?php return [isset($shared), function_exists('helper')];")
        .unwrap();
    assert_eq!(value, HostValue::map([(0i64, false), (1i64, false)]));
}

#[test]
fn test_execute_file_from_include_paths() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("lib.php"),
        "<?php function area($w, $h) { return $w * $h; }",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("main.php"),
        "<?php require 'lib.php'; return area(6, 7);",
    )
    .unwrap();

    let engine = Engine::start(EngineConfig::new().include_path(dir.path())).unwrap();
    let ctx = engine.new_context().unwrap();
    let (value, _) = ctx.execute_file("main.php").unwrap();
    assert_eq!(value, HostValue::Int(42));

    let failure = ctx.execute_file("missing.php").unwrap_err();
    assert!(matches!(failure.error, EmberError::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound));

    let failure = ctx.execute("<?php require 'missing.php';").unwrap_err();
    assert!(failure.error.is_script_error());
}

#[test]
fn test_custom_source_provider() {
    let provider = MemorySourceProvider::new()
        .with_file("greet.php", "<?php return 'hi ' . $name;");
    let engine = Engine::builder()
        .source_provider(Arc::new(provider))
        .start()
        .unwrap();
    let ctx = engine.new_context().unwrap();
    ctx.bind_global("name", "bob").unwrap();
    let (value, _) = ctx.execute_file("greet.php").unwrap();
    assert_eq!(value, HostValue::from("hi bob"));
}

#[test]
fn test_step_limit() {
    let engine = Engine::start(EngineConfig::new().ini("max_execution_steps", "10000")).unwrap();
    let ctx = engine.new_context().unwrap();
    let failure = ctx.execute("<?php while (true) {}").unwrap_err();
    assert!(matches!(failure.error, EmberError::StepLimit(10000)));

    // The budget is per execution.
    let (value, _) = ctx.execute("<?php return 1 + 1;").unwrap();
    assert_eq!(value, HostValue::Int(2));
}

#[test]
fn test_interrupt_from_another_thread() {
    let engine = engine();
    let ctx = engine.new_context().unwrap();
    let interrupt = ctx.interrupt_handle();

    let canceller = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        interrupt.interrupt();
    });
    let failure = ctx.execute("<?php $i = 0; while (true) { $i++; }").unwrap_err();
    canceller.join().unwrap();
    assert!(matches!(failure.error, EmberError::Interrupted));

    // The request is consumed; the context keeps working.
    let (value, _) = ctx.execute("<?php return 'still here';").unwrap();
    assert_eq!(value, HostValue::from("still here"));
}

#[test]
fn test_call_script_function() {
    let engine = engine();
    let ctx = engine.new_context().unwrap();
    ctx.execute("<?php function add($a, $b = 10) { return $a + $b; }").unwrap();

    let (value, _) = ctx.call_function("add", &[HostValue::Int(1)]).unwrap();
    assert_eq!(value, HostValue::Int(11));

    let add = ctx.function("add").unwrap();
    let (value, _) = ctx.call(&add, &[HostValue::Int(2), HostValue::Int(3)]).unwrap();
    assert_eq!(value, HostValue::Int(5));

    let failure = ctx.call_function("subtract", &[]).unwrap_err();
    assert!(matches!(failure.error, EmberError::UnknownFunction(ref n) if n == "subtract"));
    assert!(matches!(ctx.function("subtract"), Err(EmberError::UnknownFunction(_))));
}

#[test]
fn test_closure_handles_are_callable() {
    let engine = engine();
    let ctx = engine.new_context().unwrap();
    let (closure, _) = ctx
        .execute_handle("<?php $factor = 3; return fn($x) => $x * $factor;")
        .unwrap();
    let (value, _) = ctx.call(&closure, &[HostValue::Int(5)]).unwrap();
    assert_eq!(value, HostValue::Int(15));
}
