//! Handle scoping, ownership and audited mutation.

use ember_runtime::{
    Arity, CoreError, EmberError, Engine, EngineConfig, HostKey, HostValue, Ownership,
    ValueHandle,
};
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn test_handles_go_stale_on_close() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    let ctx = engine.new_context().unwrap();
    let (handle, _) = ctx.execute_handle("<?php return ['a' => 1];").unwrap();
    assert_eq!(handle.ownership(), Ownership::EngineOwned);
    assert_eq!(handle.context_id(), Some(ctx.id()));
    assert_eq!(handle.len().unwrap(), 1);
    assert_eq!(ctx.live_handles(), 1);

    ctx.close().unwrap();
    assert!(handle.is_stale());
    assert_eq!(ctx.live_handles(), 0);
    assert!(matches!(handle.len(), Err(CoreError::StaleHandle { .. })));
    assert!(matches!(handle.to_host(), Err(CoreError::StaleHandle { .. })));
    assert!(matches!(
        ctx.to_host(&handle),
        Err(EmberError::Core(CoreError::StaleHandle { .. }))
    ));
    assert!(matches!(
        ctx.to_json(&handle),
        Err(EmberError::Core(CoreError::StaleHandle { .. }))
    ));
    assert!(matches!(
        ctx.array_push(&handle, &HostValue::Null),
        Err(EmberError::Core(CoreError::StaleHandle { .. }))
    ));
    // Operations that take no handle still report the closed context.
    let failure = ctx.execute("<?php return 1;").unwrap_err();
    assert!(matches!(failure.error, EmberError::ContextClosed));
}

#[test]
fn test_every_handle_kind_goes_stale() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    let ctx = engine.new_context().unwrap();
    let mut handles = Vec::new();
    for source in [
        "<?php return null;",
        "<?php return true;",
        "<?php return 1.5;",
        "<?php return 7;",
        "<?php return 'text';",
        "<?php return [1, 2];",
        "<?php return new stdClass;",
    ] {
        handles.push(ctx.execute_handle(source).unwrap().0);
    }
    handles.push(ctx.create_resource("socket", 5u32).unwrap());
    handles.push(ctx.function("strlen").unwrap());
    let object = handles[6].clone();
    let resource = handles[7].clone();
    let callable = handles[8].clone();
    assert_eq!(ctx.live_handles(), handles.len());

    ctx.close().unwrap();
    for handle in &handles {
        assert!(handle.is_stale(), "{handle:?}");
        assert!(
            matches!(handle.to_host(), Err(CoreError::StaleHandle { .. })),
            "{handle:?}"
        );
        assert!(
            matches!(
                ctx.to_host(handle),
                Err(EmberError::Core(CoreError::StaleHandle { .. }))
            ),
            "{handle:?}"
        );
    }
    assert!(matches!(
        ctx.with_resource(&resource, |n: &u32| *n),
        Err(EmberError::Core(CoreError::StaleHandle { .. }))
    ));
    assert!(matches!(
        ctx.set_property(&object, "x", &HostValue::Null),
        Err(EmberError::Core(CoreError::StaleHandle { .. }))
    ));
    let failure = ctx.call(&callable, &[HostValue::from("abc")]).unwrap_err();
    assert!(matches!(
        failure.error,
        EmberError::Core(CoreError::StaleHandle { .. })
    ));
    assert!(matches!(
        ctx.bind_handle("again", &object),
        Err(EmberError::Core(CoreError::StaleHandle { .. }))
    ));
}

#[test]
fn test_handle_from_other_context_is_foreign() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    let first = engine.new_context().unwrap();
    let (handle, _) = first.execute_handle("<?php return 1;").unwrap();
    first.close().unwrap();

    let second = engine.new_context().unwrap();
    let err = second.to_host(&handle).unwrap_err();
    match err {
        EmberError::Core(core) => {
            assert!(matches!(core, CoreError::ForeignHandle { .. }));
            assert!(core.is_handle_error());
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_host_handles_never_stale() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    let ctx = engine.new_context().unwrap();
    let handle = ValueHandle::host(HostValue::map([("k", "v")]));
    assert_eq!(handle.ownership(), Ownership::HostOwned);

    ctx.bind_handle("data", &handle).unwrap();
    let (value, _) = ctx.execute("<?php return $data['k'];").unwrap();
    assert_eq!(value, HostValue::from("v"));

    ctx.close().unwrap();
    assert!(!handle.is_stale());
    assert_eq!(handle.to_host().unwrap(), HostValue::map([("k", "v")]));
}

#[test]
fn test_borrowed_arguments_expire_after_callback() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    let ctx = engine.new_context().unwrap();
    let stash: Rc<RefCell<Vec<ValueHandle>>> = Rc::default();
    let kept = Rc::clone(&stash);
    ctx.register_borrowed("inspect", Arity::Exact(1), move |args| {
        let arg = &args[0];
        assert_eq!(arg.ownership(), Ownership::Borrowed);
        let name = arg.property("name")?.map(|h| h.to_host()).transpose()?;
        kept.borrow_mut().push(arg.clone());
        Ok(name.unwrap_or_default())
    })
    .unwrap();

    let (value, _) = ctx
        .execute("<?php $o = new stdClass(); $o->name = 'widget'; return inspect($o);")
        .unwrap();
    assert_eq!(value, HostValue::from("widget"));

    let stashed = stash.borrow();
    assert_eq!(stashed.len(), 1);
    assert!(stashed[0].is_stale());
    assert!(matches!(
        ctx.to_host(&stashed[0]),
        Err(EmberError::Core(CoreError::StaleHandle { .. }))
    ));
    // The context itself is unaffected.
    assert!(!ctx.is_closed());
}

#[test]
fn test_array_mutation_copies() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    let ctx = engine.new_context().unwrap();
    let (list, _) = ctx.execute_handle("<?php return [1, 2];").unwrap();

    let (pushed, key) = ctx.array_push(&list, &HostValue::Int(3)).unwrap();
    assert_eq!(key, HostKey::Int(2));
    let inserted = ctx
        .array_insert(&pushed, "total", &HostValue::Int(6))
        .unwrap();

    assert_eq!(
        ctx.to_host(&list).unwrap(),
        HostValue::map([(0i64, 1i64), (1i64, 2i64)])
    );
    assert_eq!(
        ctx.to_host(&inserted).unwrap(),
        HostValue::map([
            (HostKey::Int(0), HostValue::Int(1)),
            (HostKey::Int(1), HostValue::Int(2)),
            (HostKey::Int(2), HostValue::Int(3)),
            (HostKey::from("total"), HostValue::Int(6)),
        ])
    );

    // Numeric string keys normalize to integers.
    let renumbered = ctx.array_insert(&list, "7", &HostValue::Null).unwrap();
    assert_eq!(renumbered.keys().unwrap()[2], HostKey::Int(7));

    let (scalar, _) = ctx.execute_handle("<?php return 5;").unwrap();
    let err = ctx.array_push(&scalar, &HostValue::Null).unwrap_err();
    assert!(matches!(err, EmberError::Core(CoreError::Access(_))));
}

#[test]
fn test_property_writes_are_shared() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    let ctx = engine.new_context().unwrap();
    ctx.execute("<?php $cfg = new stdClass(); $cfg->debug = false;")
        .unwrap();
    let cfg = ctx.global_handle("cfg").unwrap().unwrap();

    ctx.set_property(&cfg, "debug", &HostValue::Bool(true)).unwrap();
    let (value, _) = ctx.execute("<?php return $cfg->debug;").unwrap();
    assert_eq!(value, HostValue::Bool(true));

    let (text, _) = ctx.execute_handle("<?php return 'plain';").unwrap();
    let err = ctx
        .set_property(&text, "x", &HostValue::Null)
        .unwrap_err();
    assert!(matches!(err, EmberError::Core(CoreError::Access(_))));
}

#[test]
fn test_resources_keep_their_payload() {
    struct Connection {
        dsn: String,
    }

    let engine = Engine::start(EngineConfig::default()).unwrap();
    let ctx = engine.new_context().unwrap();
    let conn = ctx
        .create_resource(
            "db connection",
            Connection {
                dsn: "sqlite::memory:".into(),
            },
        )
        .unwrap();
    ctx.bind_handle("conn", &conn).unwrap();

    let (value, _) = ctx
        .execute("<?php return [is_resource($conn), get_resource_type($conn)];")
        .unwrap();
    assert_eq!(
        value,
        HostValue::map([
            (0i64, HostValue::Bool(true)),
            (1i64, HostValue::from("db connection")),
        ])
    );

    let dsn = ctx.with_resource(&conn, |c: &Connection| c.dsn.clone()).unwrap();
    assert_eq!(dsn, "sqlite::memory:");

    let err = ctx.with_resource(&conn, |n: &u32| *n).unwrap_err();
    assert!(matches!(err, EmberError::Core(CoreError::TypeMismatch { .. })));

    // A resource snapshot round-trips to the same engine resource.
    let snapshot = ctx.to_host(&conn).unwrap();
    ctx.bind_global("again", snapshot).unwrap();
    let (same, _) = ctx.execute("<?php return $again === $conn;").unwrap();
    assert_eq!(same, HostValue::Bool(true));
}

#[test]
fn test_handle_navigation() {
    let engine = Engine::start(EngineConfig::default()).unwrap();
    let ctx = engine.new_context().unwrap();
    let (root, _) = ctx
        .execute_handle("<?php return ['items' => [10, 20], 'owner' => (object) ['id' => 9]];")
        .unwrap();

    assert_eq!(root.keys().unwrap(), [HostKey::from("items"), HostKey::from("owner")]);
    let items = root.get("items").unwrap().unwrap();
    assert_eq!(items.len().unwrap(), 2);
    assert_eq!(items.get(1i64).unwrap().unwrap().to_host().unwrap(), HostValue::Int(20));
    assert!(items.get(5i64).unwrap().is_none());

    let owner = root.get("owner").unwrap().unwrap();
    assert_eq!(owner.class_name().unwrap().as_deref(), Some("stdClass"));
    let id = owner.property("id").unwrap().unwrap();
    assert_eq!(ctx.extract::<i64>(&id).unwrap(), 9);
}
