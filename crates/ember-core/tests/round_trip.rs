//! Conversion laws across the engine boundary.

use ember_core::{ContextId, Converter, HandleArena, HostKey, HostValue, ValueHandle};
use ember_interp::{IniSettings, Request, Runtime};
use proptest::prelude::*;

fn round_trip(value: &HostValue) -> HostValue {
    let runtime = Runtime::startup(IniSettings::default(), None).unwrap();
    let mut request = Request::new(&runtime).unwrap();
    let context = ContextId::next();
    let converter = Converter::default();
    let engine = converter.to_engine(value, &mut request, context).unwrap();
    converter.to_host(&engine, context).unwrap()
}

fn scalar() -> impl Strategy<Value = HostValue> {
    prop_oneof![
        Just(HostValue::Null),
        any::<bool>().prop_map(HostValue::Bool),
        any::<i64>().prop_map(HostValue::Int),
        any::<f64>()
            .prop_filter("NaN never equals itself", |f| !f.is_nan())
            .prop_map(HostValue::Float),
        ".*".prop_map(HostValue::String),
    ]
}

fn key() -> impl Strategy<Value = HostKey> {
    prop_oneof![
        any::<i64>().prop_map(HostKey::Int),
        "[a-z0-9_]{0,8}".prop_map(HostKey::from),
    ]
}

proptest! {
    #[test]
    fn prop_scalars_round_trip(value in scalar()) {
        prop_assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn prop_mappings_keep_keys_and_order(
        entries in proptest::collection::vec((key(), scalar()), 0..16)
    ) {
        let value = HostValue::Map(entries.into_iter().collect());
        let back = round_trip(&value);
        let (Some(expected), Some(actual)) = (value.as_map(), back.as_map()) else {
            return Err(TestCaseError::fail("expected maps"));
        };
        prop_assert_eq!(
            expected.keys().collect::<Vec<_>>(),
            actual.keys().collect::<Vec<_>>()
        );
        prop_assert_eq!(
            expected.values().collect::<Vec<_>>(),
            actual.values().collect::<Vec<_>>()
        );
    }
}

#[test]
fn test_nested_structures_round_trip() {
    let value = HostValue::map([
        ("name", HostValue::from("ember")),
        (
            "tags",
            HostValue::map([(0i64, HostValue::from("a")), (5i64, HostValue::from("b"))]),
        ),
        ("ratio", HostValue::Float(0.25)),
        ("nothing", HostValue::Null),
    ]);
    assert_eq!(round_trip(&value), value);
}

#[test]
fn test_script_array_converts_in_order() {
    let runtime = Runtime::startup(IniSettings::default(), None).unwrap();
    let mut request = Request::new(&runtime).unwrap();
    let context = ContextId::next();
    let value = request.eval("<?php return ['b' => 2, 'a' => 1];", "t.php").unwrap();
    let host = Converter::default().to_host(&value, context).unwrap();
    let pairs: Vec<(HostKey, HostValue)> = host
        .as_map()
        .unwrap()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    assert_eq!(
        pairs,
        vec![
            (HostKey::from("b"), HostValue::Int(2)),
            (HostKey::from("a"), HostValue::Int(1)),
        ]
    );
}

#[test]
fn test_handles_outliving_their_arena() {
    let runtime = Runtime::startup(IniSettings::default(), None).unwrap();
    let mut request = Request::new(&runtime).unwrap();
    let arena = HandleArena::new(ContextId::next());
    let values = request
        .eval(
            "<?php $f = fn($x) => $x; return [null, true, 1, 1.5, 's', [1], new stdClass, $f];",
            "t.php",
        )
        .unwrap();
    let list = ValueHandle::engine(&arena, values).unwrap();
    let handles: Vec<ValueHandle> = (0..8i64)
        .map(|i| list.get(i).unwrap().unwrap())
        .collect();
    assert!(handles.iter().all(|h| !h.is_stale()));

    arena.close();
    request.shutdown();
    assert!(list.is_stale());
    for handle in &handles {
        assert!(handle.is_stale());
        assert!(handle.to_host().unwrap_err().is_handle_error());
    }
}
