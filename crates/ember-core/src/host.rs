//! Host-side value model.
//!
//! [`HostValue`] is the fully host-owned mirror of an engine value. It holds
//! no engine references and is `Send`, so it can cross threads freely.
//! Objects, resources and callables remember their [`Origin`] so that
//! converting them back into the same context yields the original engine
//! value instead of a copy.

use crate::arena::ContextId;
use crate::error::{CoreError, CoreResult};
use ember_interp::canonical_int;
use indexmap::IndexMap;
use std::fmt;

/// Ordered mapping with engine key semantics.
pub type HostMap = IndexMap<HostKey, HostValue>;

/// Key of a [`HostValue::Map`].
///
/// Built from strings through `From`, canonical decimal integers become
/// [`HostKey::Int`], matching how the engine normalizes array keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostKey {
    Int(i64),
    Str(String),
}

impl HostKey {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Int(_) => None,
            Self::Str(s) => Some(s),
        }
    }
}

impl From<i64> for HostKey {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<&str> for HostKey {
    fn from(s: &str) -> Self {
        match canonical_int(s) {
            Some(i) => Self::Int(i),
            None => Self::Str(s.to_string()),
        }
    }
}

impl From<String> for HostKey {
    fn from(s: String) -> Self {
        match canonical_int(&s) {
            Some(i) => Self::Int(i),
            None => Self::Str(s),
        }
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

/// Where an engine object, resource or callable came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Origin {
    pub context: ContextId,
    /// Engine id within that context's store.
    pub id: u32,
}

/// Generic property bag for an engine object.
#[derive(Debug, Clone, Default)]
pub struct HostObject {
    pub class: String,
    pub properties: IndexMap<String, HostValue>,
    pub origin: Option<Origin>,
}

impl HostObject {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            properties: IndexMap::new(),
            origin: None,
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<HostValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&HostValue> {
        self.properties.get(name)
    }

    /// Forget the origin so the next conversion builds a fresh object.
    pub fn detach(mut self) -> Self {
        self.origin = None;
        self
    }
}

// Structural: class and properties, never origin.
impl PartialEq for HostObject {
    fn eq(&self, other: &Self) -> bool {
        self.class.eq_ignore_ascii_case(&other.class) && self.properties == other.properties
    }
}

/// Snapshot of an engine resource.
#[derive(Debug, Clone, PartialEq)]
pub struct HostResource {
    pub kind: String,
    pub id: u32,
    pub origin: Option<Origin>,
}

/// Snapshot of an engine callable.
#[derive(Debug, Clone)]
pub struct HostCallable {
    /// Function name, `Class::method` or `{closure}`.
    pub name: String,
    pub origin: Option<Origin>,
}

impl HostCallable {
    /// Reference to a named engine function, resolved on conversion.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin: None,
        }
    }
}

impl PartialEq for HostCallable {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
    }
}

/// A host-owned value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum HostValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Array whose keys are `0..n` in order, when sequence views are enabled.
    List(Vec<HostValue>),
    /// Ordered key/value array.
    Map(HostMap),
    Object(HostObject),
    Resource(HostResource),
    Callable(HostCallable),
    /// Reference to the container at this depth on the path from the root
    /// (0 is the root itself).
    BackRef(usize),
}

impl HostValue {
    /// Build a map from key/value pairs.
    pub fn map<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<HostKey>,
        V: Into<HostValue>,
    {
        Self::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Build a list from values.
    pub fn list<V: Into<HostValue>>(values: impl IntoIterator<Item = V>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Object(_) => "object",
            Self::Resource(_) => "resource",
            Self::Callable(_) => "callable",
            Self::BackRef(_) => "back-reference",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value as float; integers are widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[HostValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HostMap> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&HostObject> {
        match self {
            Self::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Element of a list or map, or property of an object.
    pub fn get(&self, key: impl Into<HostKey>) -> Option<&HostValue> {
        let key = key.into();
        match self {
            Self::List(items) => usize::try_from(key.as_int()?)
                .ok()
                .and_then(|i| items.get(i)),
            Self::Map(map) => map.get(&key),
            Self::Object(obj) => obj.get(&key.to_string()),
            _ => None,
        }
    }

    /// Number of elements in a list or map, properties of an object.
    pub fn len(&self) -> usize {
        match self {
            Self::List(items) => items.len(),
            Self::Map(map) => map.len(),
            Self::Object(obj) => obj.properties.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the map keys are exactly `0..n` in order.
    pub fn is_list_shaped(map: &HostMap) -> bool {
        map.keys()
            .enumerate()
            .all(|(i, key)| key.as_int() == i64::try_from(i).ok())
    }

    /// Convert to a JSON tree. Cycles, resources, callables and non-finite
    /// floats have no JSON form and are rejected.
    pub fn to_json(&self) -> CoreResult<serde_json::Value> {
        use serde_json::Value as Json;

        Ok(match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(i) => Json::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .ok_or_else(|| CoreError::overflow(f, "JSON number"))?,
            Self::String(s) => Json::String(s.clone()),
            Self::List(items) => Json::Array(
                items
                    .iter()
                    .map(HostValue::to_json)
                    .collect::<CoreResult<_>>()?,
            ),
            Self::Map(map) if Self::is_list_shaped(map) => Json::Array(
                map.values()
                    .map(HostValue::to_json)
                    .collect::<CoreResult<_>>()?,
            ),
            Self::Map(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    out.insert(key.to_string(), value.to_json()?);
                }
                Json::Object(out)
            }
            Self::Object(obj) => {
                let mut out = serde_json::Map::with_capacity(obj.properties.len());
                for (name, value) in &obj.properties {
                    out.insert(name.clone(), value.to_json()?);
                }
                Json::Object(out)
            }
            Self::Resource(_) | Self::Callable(_) => {
                return Err(CoreError::type_mismatch("JSON value", self.type_name()));
            }
            Self::BackRef(depth) => {
                return Err(CoreError::CyclicValue(format!(
                    "value at depth {}",
                    depth + 1
                )));
            }
        })
    }
}

impl From<serde_json::Value> for HostValue {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Self::String(s),
            Json::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Json::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (HostKey::from(k), Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for HostValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for HostValue {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for HostValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<HostValue>> for HostValue {
    fn from(items: Vec<HostValue>) -> Self {
        Self::List(items)
    }
}

impl From<HostMap> for HostValue {
    fn from(map: HostMap) -> Self {
        Self::Map(map)
    }
}

impl From<HostObject> for HostValue {
    fn from(obj: HostObject) -> Self {
        Self::Object(obj)
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_normalization() {
        assert_eq!(HostKey::from("12"), HostKey::Int(12));
        assert_eq!(HostKey::from("-3"), HostKey::Int(-3));
        assert_eq!(HostKey::from("012"), HostKey::Str("012".into()));
        assert_eq!(HostKey::from("1.5"), HostKey::Str("1.5".into()));
        assert_eq!(HostKey::from("x".to_string()).to_string(), "x");
    }

    #[test]
    fn test_object_equality_ignores_origin() {
        let a = HostObject::new("Point").with("x", 1i64);
        let mut b = HostObject::new("point").with("x", 1i64);
        b.origin = Some(Origin {
            context: ContextId::from_raw(9),
            id: 4,
        });
        assert_eq!(a, b);
        assert_eq!(b.detach().origin, None);
    }

    #[test]
    fn test_get_and_len() {
        let value = HostValue::map([("a", HostValue::list([1i64, 2])), ("b", "x".into())]);
        assert_eq!(value.len(), 2);
        assert_eq!(value.get("a").and_then(|a| a.get(1i64)), Some(&HostValue::Int(2)));
        assert_eq!(value.get("b").and_then(HostValue::as_str), Some("x"));
        assert!(value.get("missing").is_none());
    }

    #[test]
    fn test_json_conversion() {
        let value = HostValue::from(json!({"name": "ember", "tags": ["a", "b"], "n": 1.5, "0": null}));
        let map = value.as_map().unwrap();
        assert!(map.contains_key(&HostKey::Int(0)));
        assert_eq!(value.get("tags").unwrap().len(), 2);

        let back = value.to_json().unwrap();
        assert_eq!(back["name"], "ember");
        assert_eq!(back["tags"], json!(["a", "b"]));
        assert_eq!(back["n"], json!(1.5));

        let list_shaped = HostValue::map([(0i64, "a"), (1i64, "b")]);
        assert_eq!(list_shaped.to_json().unwrap(), json!(["a", "b"]));
    }

    #[test]
    fn test_json_rejects_cycles_and_nan() {
        let cyclic = HostValue::map([("self", HostValue::BackRef(0))]);
        assert!(matches!(cyclic.to_json(), Err(CoreError::CyclicValue(_))));
        assert!(matches!(
            HostValue::Float(f64::NAN).to_json(),
            Err(CoreError::NumericOverflow { .. })
        ));
    }
}
