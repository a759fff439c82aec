//! Bidirectional conversion between engine values and [`HostValue`].
//!
//! Both directions walk the value tree depth-first and keep the current
//! path of containers. A container that is already on the path is a cycle:
//! toward the host it becomes [`HostValue::BackRef`] or a `CyclicValue`
//! error depending on [`CyclePolicy`]; toward the engine a `BackRef` is
//! resolved against the path, rebuilding the cycle.
//!
//! Toward the host, shared containers that are not ancestors are converted
//! once per call and reused, so acyclic sharing costs no repeated walks.

use crate::arena::ContextId;
use crate::error::{CoreError, CoreResult};
use crate::host::{HostCallable, HostKey, HostObject, HostResource, HostValue, Origin};
use ember_interp::{AccessError, ArrayKey, Request, Zval};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::rc::Rc;

/// What to do when a conversion meets a container it is already inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePolicy {
    /// Emit [`HostValue::BackRef`] pointing at the ancestor.
    #[default]
    BackReference,
    /// Fail with `CyclicValue`. Used for tree-shaped outputs such as JSON.
    Reject,
}

/// Conversion options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertOptions {
    pub cycles: CyclePolicy,
    /// Convert arrays keyed `0..n` in order to [`HostValue::List`].
    pub sequences: bool,
    /// Maximum container nesting.
    pub max_depth: usize,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            cycles: CyclePolicy::BackReference,
            sequences: false,
            max_depth: 512,
        }
    }
}

impl ConvertOptions {
    /// Options for JSON output: cycles rejected, list arrays as sequences.
    pub fn json() -> Self {
        Self {
            cycles: CyclePolicy::Reject,
            sequences: true,
            ..Self::default()
        }
    }

    pub fn with_cycles(mut self, cycles: CyclePolicy) -> Self {
        self.cycles = cycles;
        self
    }

    pub fn with_sequences(mut self, sequences: bool) -> Self {
        self.sequences = sequences;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }
}

/// Converter bound to a set of options.
#[derive(Debug, Clone, Copy, Default)]
pub struct Converter {
    options: ConvertOptions,
}

impl Converter {
    pub fn new(options: ConvertOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> ConvertOptions {
        self.options
    }

    /// Engine value to host value. `context` is recorded as the origin of
    /// objects, resources and callables.
    pub fn to_host(&self, value: &Zval, context: ContextId) -> CoreResult<HostValue> {
        ToHost {
            options: self.options,
            context,
            path: Vec::new(),
            done: HashMap::new(),
            back_refs: 0,
        }
        .value(value)
    }

    /// Host value to engine value owned by `request`.
    pub fn to_engine(
        &self,
        value: &HostValue,
        request: &mut Request,
        context: ContextId,
    ) -> CoreResult<Zval> {
        ToEngine {
            options: self.options,
            context,
            request,
            path: Vec::new(),
        }
        .value(value)
    }
}

fn address<T>(rc: &Rc<T>) -> usize {
    Rc::as_ptr(rc) as usize
}

fn host_key(key: &ArrayKey) -> HostKey {
    match key {
        ArrayKey::Int(i) => HostKey::Int(*i),
        ArrayKey::Str(s) => HostKey::Str(s.to_string()),
    }
}

fn engine_key(key: &HostKey) -> ArrayKey {
    match key {
        HostKey::Int(i) => ArrayKey::Int(*i),
        HostKey::Str(s) => ArrayKey::from_str_key(s),
    }
}

struct ToHost {
    options: ConvertOptions,
    context: ContextId,
    path: Vec<usize>,
    /// Finished shared containers by address. Only results without
    /// back-references are kept, since those depend on the path.
    done: HashMap<usize, HostValue>,
    back_refs: usize,
}

impl ToHost {
    fn value(&mut self, value: &Zval) -> CoreResult<HostValue> {
        Ok(match value {
            Zval::Null => HostValue::Null,
            Zval::Bool(b) => HostValue::Bool(*b),
            Zval::Int(i) => HostValue::Int(*i),
            Zval::Float(f) => HostValue::Float(*f),
            Zval::Str(s) => HostValue::String(s.to_string()),
            Zval::Array(array) => {
                let shared = Rc::strong_count(array) > 1;
                let table = array.borrow();
                let is_list = self.options.sequences && table.is_list();
                self.container(address(array), shared, "array", |walk| {
                    if is_list {
                        let items = table
                            .values()
                            .map(|v| walk.value(v))
                            .collect::<CoreResult<Vec<_>>>()?;
                        return Ok(HostValue::List(items));
                    }
                    let mut map = crate::host::HostMap::with_capacity(table.len());
                    for (key, member) in table.iter() {
                        map.insert(host_key(key), walk.value(member)?);
                    }
                    Ok(HostValue::Map(map))
                })?
            }
            Zval::Object(obj) => {
                let shared = Rc::strong_count(obj) > 1;
                let object = obj.borrow();
                let describe = format!("object of class {}", object.class);
                self.container(address(obj), shared, &describe, |walk| {
                    let mut out = HostObject::new(object.class.to_string());
                    for (name, member) in &object.props {
                        out.properties.insert(name.to_string(), walk.value(member)?);
                    }
                    out.origin = Some(walk.origin(object.id));
                    Ok(HostValue::Object(out))
                })?
            }
            Zval::Resource(resource) => HostValue::Resource(HostResource {
                kind: resource.kind.to_string(),
                id: resource.id,
                origin: Some(self.origin(resource.id)),
            }),
            Zval::Callable(callable) => HostValue::Callable(HostCallable {
                name: callable.name(),
                origin: Some(self.origin(callable.id)),
            }),
        })
    }

    fn origin(&self, id: u32) -> Origin {
        Origin {
            context: self.context,
            id,
        }
    }

    fn container(
        &mut self,
        address: usize,
        shared: bool,
        describe: &str,
        build: impl FnOnce(&mut Self) -> CoreResult<HostValue>,
    ) -> CoreResult<HostValue> {
        if let Some(depth) = self.path.iter().position(|&a| a == address) {
            return match self.options.cycles {
                CyclePolicy::BackReference => {
                    self.back_refs += 1;
                    Ok(HostValue::BackRef(depth))
                }
                CyclePolicy::Reject => Err(CoreError::CyclicValue(describe.to_string())),
            };
        }
        if let Some(value) = self.done.get(&address) {
            return Ok(value.clone());
        }
        if self.path.len() >= self.options.max_depth {
            return Err(CoreError::DepthExceeded(self.options.max_depth));
        }
        let back_refs = self.back_refs;
        self.path.push(address);
        let result = build(self);
        self.path.pop();
        if let Ok(value) = &result {
            if shared && self.back_refs == back_refs {
                self.done.insert(address, value.clone());
            }
        }
        result
    }
}

struct ToEngine<'r> {
    options: ConvertOptions,
    context: ContextId,
    request: &'r mut Request,
    /// Containers under construction, root first.
    path: Vec<Zval>,
}

impl ToEngine<'_> {
    fn value(&mut self, value: &HostValue) -> CoreResult<Zval> {
        Ok(match value {
            HostValue::Null => Zval::Null,
            HostValue::Bool(b) => Zval::Bool(*b),
            HostValue::Int(i) => Zval::Int(*i),
            HostValue::Float(f) => Zval::Float(*f),
            HostValue::String(s) => Zval::string(s),
            HostValue::List(items) => {
                let array = self.request.new_array();
                self.container(array, |walk, array| {
                    for item in items {
                        let member = walk.value(item)?;
                        push(array, member)?;
                    }
                    Ok(())
                })?
            }
            HostValue::Map(map) => {
                let array = self.request.new_array();
                self.container(array, |walk, array| {
                    for (key, item) in map {
                        let member = walk.value(item)?;
                        if let Zval::Array(table) = array {
                            table.borrow_mut().insert(engine_key(key), member);
                        }
                    }
                    Ok(())
                })?
            }
            HostValue::Object(obj) => self.object(obj)?,
            HostValue::Resource(resource) => {
                let origin = resource.origin.ok_or_else(|| {
                    CoreError::type_mismatch("resource owned by an engine context", "detached resource")
                })?;
                self.resolve(origin, Request::lookup_resource)?
            }
            HostValue::Callable(callable) => match callable.origin {
                Some(origin) if origin.context == self.context => {
                    self.resolve(origin, Request::lookup_callable)?
                }
                _ => self.request.lookup_function(&callable.name).ok_or_else(|| {
                    CoreError::type_mismatch("callable", format!("unknown function {}", callable.name))
                })?,
            },
            HostValue::BackRef(depth) => self.path.get(*depth).cloned().ok_or_else(|| {
                CoreError::type_mismatch(
                    "back-reference to an enclosing container",
                    format!("depth {depth} with {} enclosing", self.path.len()),
                )
            })?,
        })
    }

    fn object(&mut self, obj: &HostObject) -> CoreResult<Zval> {
        if let Some(origin) = obj.origin.filter(|o| o.context == self.context) {
            if let Some(existing) = self.request.lookup_object(origin.id) {
                return Ok(existing);
            }
        }
        let object = self.request.new_object(&obj.class)?;
        self.container(object, |walk, object| {
            for (name, item) in &obj.properties {
                let member = walk.value(item)?;
                walk.request.set_property(object, name, member)?;
            }
            Ok(())
        })
    }

    fn resolve(
        &self,
        origin: Origin,
        lookup: fn(&Request, u32) -> Option<Zval>,
    ) -> CoreResult<Zval> {
        if origin.context != self.context {
            return Err(CoreError::ForeignHandle {
                expected: self.context,
                found: origin.context,
            });
        }
        lookup(&*self.request, origin.id).ok_or(CoreError::StaleHandle {
            context: origin.context,
        })
    }

    fn container(
        &mut self,
        value: Zval,
        fill: impl FnOnce(&mut Self, &Zval) -> CoreResult<()>,
    ) -> CoreResult<Zval> {
        if self.path.len() >= self.options.max_depth {
            return Err(CoreError::DepthExceeded(self.options.max_depth));
        }
        self.path.push(value.clone());
        let result = fill(self, &value);
        self.path.pop();
        result.map(|()| value)
    }
}

fn push(array: &Zval, member: Zval) -> CoreResult<()> {
    if let Zval::Array(table) = array {
        let mut table = table.borrow_mut();
        table
            .push(member)
            .map_err(|_| CoreError::Access(AccessError::NextIndexOccupied))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_interp::{IniSettings, Runtime};

    fn request() -> (Runtime, Request) {
        let runtime = Runtime::startup(IniSettings::default(), None).unwrap();
        let request = Request::new(&runtime).unwrap();
        (runtime, request)
    }

    #[test]
    fn test_map_order_survives_round_trip() {
        let (_runtime, mut request) = request();
        let context = ContextId::next();
        let converter = Converter::default();
        let value = HostValue::map([("b", 2i64), ("a", 1i64), ("10", 3i64)]);

        let engine = converter.to_engine(&value, &mut request, context).unwrap();
        let back = converter.to_host(&engine, context).unwrap();
        let keys: Vec<HostKey> = back.as_map().unwrap().keys().cloned().collect();
        assert_eq!(
            keys,
            vec![HostKey::from("b"), HostKey::from("a"), HostKey::Int(10)]
        );
        assert_eq!(back, value);
    }

    #[test]
    fn test_sequences_option() {
        let (_runtime, mut request) = request();
        let context = ContextId::next();
        let list = HostValue::list([1i64, 2, 3]);
        let engine = Converter::default()
            .to_engine(&list, &mut request, context)
            .unwrap();

        let as_map = Converter::default().to_host(&engine, context).unwrap();
        assert!(matches!(as_map, HostValue::Map(_)));
        let as_list = Converter::new(ConvertOptions::default().with_sequences(true))
            .to_host(&engine, context)
            .unwrap();
        assert_eq!(as_list, list);
    }

    #[test]
    fn test_self_referencing_array() {
        let (_runtime, mut request) = request();
        let context = ContextId::next();
        let array = request.new_array();
        if let Zval::Array(table) = &array {
            table.borrow_mut().insert(ArrayKey::from("name"), Zval::string("root"));
            table.borrow_mut().insert(ArrayKey::from("self"), array.clone());
        }

        let host = Converter::default().to_host(&array, context).unwrap();
        assert_eq!(host.get("self"), Some(&HostValue::BackRef(0)));

        let err = Converter::new(ConvertOptions::json())
            .to_host(&array, context)
            .unwrap_err();
        assert!(matches!(err, CoreError::CyclicValue(_)));

        // Rebuilding the cycle yields an array containing itself.
        let rebuilt = Converter::default().to_engine(&host, &mut request, context).unwrap();
        let Zval::Array(table) = &rebuilt else {
            panic!("expected array");
        };
        let inner = table.borrow().get(&ArrayKey::from("self")).cloned();
        assert!(matches!(inner, Some(Zval::Array(ref t)) if Rc::ptr_eq(t, table)));
        request.shutdown();
    }

    #[test]
    fn test_shared_containers_convert_once() {
        let (_runtime, mut request) = request();
        let context = ContextId::next();
        let value = request
            .eval("<?php $a = [1]; for ($i = 0; $i < 16; $i++) { $a = [$a, $a]; } return $a;", "t.php")
            .unwrap();
        let host = Converter::new(ConvertOptions::default().with_sequences(true))
            .to_host(&value, context)
            .unwrap();

        let mut node = &host;
        for _ in 0..16 {
            let HostValue::List(pair) = node else {
                panic!("expected a pair, got {node:?}");
            };
            assert_eq!(pair.len(), 2);
            assert_eq!(pair[0], pair[1]);
            node = &pair[1];
        }
        assert_eq!(node, &HostValue::list([1i64]));
    }

    #[test]
    fn test_shared_cycle_back_references_follow_the_path() {
        let (_runtime, mut request) = request();
        let context = ContextId::next();
        let value = request
            .eval(
                "<?php $o = new stdClass; $o->me = $o; return ['a' => $o, 'b' => ['c' => $o]];",
                "t.php",
            )
            .unwrap();
        let host = Converter::default().to_host(&value, context).unwrap();

        let a = host.get("a").unwrap().as_object().unwrap();
        assert_eq!(a.get("me"), Some(&HostValue::BackRef(1)));
        let c = host.get("b").unwrap().get("c").unwrap().as_object().unwrap();
        assert_eq!(c.get("me"), Some(&HostValue::BackRef(2)));
    }

    #[test]
    fn test_object_identity_within_context() {
        let (_runtime, mut request) = request();
        let context = ContextId::next();
        let object = request.eval("<?php $o = new stdClass; $o->x = 1; return $o;", "t.php").unwrap();
        let host = Converter::default().to_host(&object, context).unwrap();
        let HostValue::Object(obj) = &host else {
            panic!("expected object");
        };
        assert_eq!(obj.class, "stdClass");
        assert_eq!(obj.get("x"), Some(&HostValue::Int(1)));

        let same = Converter::default().to_engine(&host, &mut request, context).unwrap();
        assert!(matches!((&same, &object), (Zval::Object(a), Zval::Object(b)) if Rc::ptr_eq(a, b)));

        // Another context gets a structural copy.
        let other = Converter::default()
            .to_engine(&host, &mut request, ContextId::next())
            .unwrap();
        assert!(matches!((&other, &object), (Zval::Object(a), Zval::Object(b)) if !Rc::ptr_eq(a, b)));
    }

    #[test]
    fn test_depth_limit() {
        let (_runtime, mut request) = request();
        let context = ContextId::next();
        let mut nested = HostValue::Int(1);
        for _ in 0..5 {
            nested = HostValue::list([nested]);
        }
        let converter = Converter::new(ConvertOptions::default().with_max_depth(3));
        assert!(matches!(
            converter.to_engine(&nested, &mut request, context),
            Err(CoreError::DepthExceeded(3))
        ));
    }

    #[test]
    fn test_foreign_resource_is_rejected() {
        let (_runtime, mut request) = request();
        let resource = HostValue::Resource(HostResource {
            kind: "stream".into(),
            id: 1,
            origin: Some(Origin {
                context: ContextId::next(),
                id: 1,
            }),
        });
        let err = Converter::default()
            .to_engine(&resource, &mut request, ContextId::next())
            .unwrap_err();
        assert!(matches!(err, CoreError::ForeignHandle { .. }));
    }
}
