//! Tagged, reference-counted engine values.
//!
//! `Zval` is the unit every engine operation works on. Scalars are stored
//! inline; strings, arrays, objects, resources and callables are shared
//! through `Rc`, so the strong count doubles as the engine reference count.
//!
//! Arrays have value semantics: writers call [`separate_array`] first, which
//! clones the backing table when it is shared (copy-on-write). Objects are
//! reference types identified by a request-unique id.

use crate::ast::FunctionDecl;
use indexmap::IndexMap;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Shared, mutable array storage.
pub type ArrayRef = Rc<RefCell<ZArray>>;

/// Shared, mutable object storage.
pub type ObjectRef = Rc<RefCell<ZObject>>;

/// An engine value.
#[derive(Clone, Default)]
pub enum Zval {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Array(ArrayRef),
    Object(ObjectRef),
    Resource(Rc<ZResource>),
    Callable(Rc<ZCallable>),
}

/// Runtime type tag of a [`Zval`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Null,
    Bool,
    Int,
    Float,
    String,
    Array,
    Object,
    Resource,
    Callable,
}

impl ValueType {
    /// Script-facing type name, as reported by `gettype()`-style messages.
    pub fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
            Self::Resource => "resource",
            Self::Callable => "Closure",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Zval {
    /// Create a string value.
    pub fn string(s: impl AsRef<str>) -> Self {
        Self::Str(Rc::from(s.as_ref()))
    }

    /// Wrap an array table.
    pub fn array(array: ZArray) -> Self {
        Self::Array(Rc::new(RefCell::new(array)))
    }

    /// Create an empty array.
    pub fn empty_array() -> Self {
        Self::array(ZArray::new())
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Null => ValueType::Null,
            Self::Bool(_) => ValueType::Bool,
            Self::Int(_) => ValueType::Int,
            Self::Float(_) => ValueType::Float,
            Self::Str(_) => ValueType::String,
            Self::Array(_) => ValueType::Array,
            Self::Object(_) => ValueType::Object,
            Self::Resource(_) => ValueType::Resource,
            Self::Callable(_) => ValueType::Callable,
        }
    }

    /// Type name used in error messages (class name for objects).
    pub fn type_name(&self) -> String {
        match self {
            Self::Object(obj) => obj.borrow().class.to_string(),
            other => other.value_type().name().to_string(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Truthiness as used by conditions and `(bool)` casts.
    pub fn to_bool(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !(s.is_empty() || &**s == "0"),
            Self::Array(arr) => !arr.borrow().is_empty(),
            Self::Object(_) | Self::Resource(_) | Self::Callable(_) => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayRef> {
        match self {
            Self::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// True for arrays and objects, the values that can nest.
    pub fn is_container(&self) -> bool {
        matches!(self, Self::Array(_) | Self::Object(_))
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Self::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Engine reference count of the shared payload, 0 for inline scalars.
    pub fn refcount(&self) -> usize {
        match self {
            Self::Null | Self::Bool(_) | Self::Int(_) | Self::Float(_) => 0,
            Self::Str(s) => Rc::strong_count(s),
            Self::Array(arr) => Rc::strong_count(arr),
            Self::Object(obj) => Rc::strong_count(obj),
            Self::Resource(res) => Rc::strong_count(res),
            Self::Callable(callable) => Rc::strong_count(callable),
        }
    }
}

// Debug stays shallow: arrays and objects may be cyclic.
impl fmt::Debug for Zval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Int(i) => write!(f, "Int({i})"),
            Self::Float(x) => write!(f, "Float({x})"),
            Self::Str(s) => write!(f, "Str({s:?})"),
            Self::Array(arr) => match arr.try_borrow() {
                Ok(arr) => write!(f, "Array(len={})", arr.len()),
                Err(_) => f.write_str("Array(<borrowed>)"),
            },
            Self::Object(obj) => match obj.try_borrow() {
                Ok(obj) => write!(f, "Object(#{} {})", obj.id, obj.class),
                Err(_) => f.write_str("Object(<borrowed>)"),
            },
            Self::Resource(res) => write!(f, "Resource(#{} {})", res.id, res.kind),
            Self::Callable(callable) => write!(f, "Callable(#{} {})", callable.id, callable.name()),
        }
    }
}

impl From<bool> for Zval {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Zval {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Zval {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Zval {
    fn from(s: &str) -> Self {
        Self::string(s)
    }
}

impl From<String> for Zval {
    fn from(s: String) -> Self {
        Self::Str(Rc::from(s))
    }
}

/// Array key after engine normalization.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ArrayKey {
    Int(i64),
    Str(Rc<str>),
}

impl ArrayKey {
    /// Normalize a string key: canonical decimal integers become integer keys.
    pub fn from_str_key(s: &str) -> Self {
        match canonical_int(s) {
            Some(i) => Self::Int(i),
            None => Self::Str(Rc::from(s)),
        }
    }

    pub fn to_zval(&self) -> Zval {
        match self {
            Self::Int(i) => Zval::Int(*i),
            Self::Str(s) => Zval::Str(s.clone()),
        }
    }
}

impl fmt::Display for ArrayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ArrayKey {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<&str> for ArrayKey {
    fn from(s: &str) -> Self {
        Self::from_str_key(s)
    }
}

/// Parse `s` as a canonical decimal integer ("0", "-12", never "012" or "+1").
pub fn canonical_int(s: &str) -> Option<i64> {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    if s == "-0" {
        return None;
    }
    s.parse().ok()
}

/// Ordered hash table backing engine arrays.
#[derive(Clone, Default)]
pub struct ZArray {
    entries: IndexMap<ArrayKey, Zval>,
    next_index: i64,
}

/// Appending failed because the next integer key would overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextIndexOccupied;

impl ZArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(capacity),
            next_index: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &ArrayKey) -> Option<&Zval> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &ArrayKey) -> Option<&mut Zval> {
        self.entries.get_mut(key)
    }

    /// Entry at insertion position `index`.
    pub fn get_index(&self, index: usize) -> Option<(&ArrayKey, &Zval)> {
        self.entries.get_index(index)
    }

    pub fn contains_key(&self, key: &ArrayKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or overwrite, keeping the position of an existing key.
    pub fn insert(&mut self, key: ArrayKey, value: Zval) {
        if let ArrayKey::Int(i) = key {
            if i >= self.next_index {
                self.next_index = i.saturating_add(1);
            }
        }
        self.entries.insert(key, value);
    }

    /// Append under the next free integer key.
    pub fn push(&mut self, value: Zval) -> Result<ArrayKey, NextIndexOccupied> {
        let key = ArrayKey::Int(self.next_index);
        if self.entries.contains_key(&key) {
            return Err(NextIndexOccupied);
        }
        self.insert(key.clone(), value);
        Ok(key)
    }

    /// Slot for `key`, created as null when missing.
    pub fn entry_or_null(&mut self, key: ArrayKey) -> &mut Zval {
        if let ArrayKey::Int(i) = key {
            if i >= self.next_index {
                self.next_index = i.saturating_add(1);
            }
        }
        self.entries.entry(key).or_insert(Zval::Null)
    }

    /// Remove `key`, preserving the order of the remaining entries.
    pub fn remove(&mut self, key: &ArrayKey) -> Option<Zval> {
        self.entries.shift_remove(key)
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, ArrayKey, Zval> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ArrayKey> {
        self.entries.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &Zval> {
        self.entries.values()
    }

    /// True when keys are exactly `0..len` in insertion order.
    pub fn is_list(&self) -> bool {
        self.entries
            .keys()
            .enumerate()
            .all(|(i, key)| matches!(key, ArrayKey::Int(k) if *k == i as i64))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn next_index(&self) -> i64 {
        self.next_index
    }
}

impl FromIterator<Zval> for ZArray {
    fn from_iter<T: IntoIterator<Item = Zval>>(iter: T) -> Self {
        let mut array = Self::new();
        for value in iter {
            // A fresh list cannot collide.
            let _ = array.push(value);
        }
        array
    }
}

impl FromIterator<(ArrayKey, Zval)> for ZArray {
    fn from_iter<T: IntoIterator<Item = (ArrayKey, Zval)>>(iter: T) -> Self {
        let mut array = Self::new();
        for (key, value) in iter {
            array.insert(key, value);
        }
        array
    }
}

/// Make the array in `slot` uniquely owned and return it.
///
/// Null slots are promoted to an empty array. Returns `None` when the slot
/// holds something other than an array or null.
pub fn separate_array(slot: &mut Zval) -> Option<ArrayRef> {
    match slot {
        Zval::Null => {
            *slot = Zval::empty_array();
        }
        Zval::Array(arr) if Rc::strong_count(arr) > 1 => {
            let copy = arr.borrow().clone();
            *slot = Zval::array(copy);
        }
        Zval::Array(_) => {}
        _ => return None,
    }
    slot.as_array().cloned()
}

/// An engine object.
pub struct ZObject {
    pub id: u32,
    pub class: Rc<str>,
    pub props: IndexMap<Rc<str>, Zval>,
}

impl ZObject {
    pub fn get(&self, name: &str) -> Option<&Zval> {
        self.props.get(name)
    }

    pub fn set(&mut self, name: &str, value: Zval) {
        match self.props.get_mut(name) {
            Some(slot) => *slot = value,
            None => {
                self.props.insert(Rc::from(name), value);
            }
        }
    }
}

impl Drop for ZArray {
    fn drop(&mut self) {
        if self.entries.values().any(Zval::is_container) {
            release_nested(self.entries.drain(..).map(|(_, value)| value).collect());
        }
    }
}

impl Drop for ZObject {
    fn drop(&mut self) {
        if self.props.values().any(Zval::is_container) {
            release_nested(self.props.drain(..).map(|(_, value)| value).collect());
        }
    }
}

/// Drop containers from a worklist instead of recursively, so values
/// nested arbitrarily deep unwind in constant stack.
fn release_nested(mut pending: Vec<Zval>) {
    while let Some(value) = pending.pop() {
        match value {
            Zval::Array(array) => {
                if let Ok(array) = Rc::try_unwrap(array) {
                    let mut array = array.into_inner();
                    pending.extend(array.entries.drain(..).map(|(_, value)| value));
                }
            }
            Zval::Object(object) => {
                if let Ok(object) = Rc::try_unwrap(object) {
                    let mut object = object.into_inner();
                    pending.extend(object.props.drain(..).map(|(_, value)| value));
                }
            }
            _ => {}
        }
    }
}

/// Opaque engine resource with an optional host payload.
pub struct ZResource {
    pub id: u32,
    pub kind: Rc<str>,
    payload: RefCell<Option<Box<dyn Any>>>,
}

impl ZResource {
    pub fn new(id: u32, kind: &str, payload: Option<Box<dyn Any>>) -> Self {
        Self {
            id,
            kind: Rc::from(kind),
            payload: RefCell::new(payload),
        }
    }

    /// Run `f` against the payload when it has type `T`.
    pub fn with_payload<T: Any, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let payload = self.payload.try_borrow().ok()?;
        payload.as_ref()?.downcast_ref::<T>().map(f)
    }

    /// Release the payload; the resource itself stays valid but empty.
    pub fn close(&self) -> bool {
        match self.payload.try_borrow_mut() {
            Ok(mut payload) => payload.take().is_some(),
            Err(_) => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.payload.try_borrow().map(|p| p.is_some()).unwrap_or(true)
    }
}

/// A callable engine value.
pub struct ZCallable {
    pub id: u32,
    pub kind: CallableKind,
}

pub enum CallableKind {
    /// Anonymous function or arrow function with its captured variables.
    Closure(Closure),
    /// Reference to a named function (user, built-in or host).
    Named(Rc<str>),
    /// Method bound to an object.
    Method { object: ObjectRef, method: Rc<str> },
}

pub struct Closure {
    pub decl: Rc<FunctionDecl>,
    pub captured: Vec<(Rc<str>, Zval)>,
    pub this: Option<ObjectRef>,
    pub scope: Option<Rc<str>>,
}

impl ZCallable {
    /// Display name: `{closure}`, the function name, or `Class::method`.
    pub fn name(&self) -> String {
        match &self.kind {
            CallableKind::Closure(_) => "{closure}".to_string(),
            CallableKind::Named(name) => name.to_string(),
            CallableKind::Method { object, method } => match object.try_borrow() {
                Ok(obj) => format!("{}::{}", obj.class, method),
                Err(_) => method.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deep_nesting_drops_without_recursion() {
        let mut value = Zval::empty_array();
        for _ in 0..200_000 {
            value = Zval::array([value].into_iter().collect());
        }
        drop(value);

        let mut next = Zval::Null;
        for id in 0..200_000 {
            let mut props = IndexMap::new();
            props.insert(Rc::from("next"), next);
            next = Zval::Object(Rc::new(RefCell::new(ZObject {
                id,
                class: Rc::from("Node"),
                props,
            })));
        }
        drop(next);
    }

    #[test]
    fn test_shared_children_survive_parent_drop() {
        let child = Zval::array([Zval::Int(1)].into_iter().collect());
        let parent = Zval::array([child.clone(), Zval::Int(2)].into_iter().collect());
        drop(parent);
        assert_eq!(child.refcount(), 1);
        assert_eq!(child.as_array().unwrap().borrow().len(), 1);
    }

    #[test]
    fn test_canonical_int_keys() {
        assert_eq!(canonical_int("0"), Some(0));
        assert_eq!(canonical_int("-12"), Some(-12));
        assert_eq!(canonical_int("012"), None);
        assert_eq!(canonical_int("+1"), None);
        assert_eq!(canonical_int("-0"), None);
        assert_eq!(canonical_int("1.5"), None);
        assert_eq!(canonical_int("99999999999999999999"), None);
        assert_eq!(ArrayKey::from("7"), ArrayKey::Int(7));
        assert_eq!(ArrayKey::from("a"), ArrayKey::Str(Rc::from("a")));
    }

    #[test]
    fn test_array_keeps_insertion_order() {
        let mut arr = ZArray::new();
        arr.insert(ArrayKey::from("b"), Zval::Int(2));
        arr.insert(ArrayKey::from("a"), Zval::Int(1));
        arr.insert(ArrayKey::Int(10), Zval::Int(3));
        arr.push(Zval::Int(4)).unwrap();

        let keys: Vec<String> = arr.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["b", "a", "10", "11"]);
        assert!(!arr.is_list());

        arr.remove(&ArrayKey::from("a"));
        let keys: Vec<String> = arr.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["b", "10", "11"]);
    }

    #[test]
    fn test_push_after_max_key_fails() {
        let mut arr = ZArray::new();
        arr.insert(ArrayKey::Int(i64::MAX), Zval::Null);
        assert_eq!(arr.push(Zval::Null), Err(NextIndexOccupied));
    }

    #[test]
    fn test_separate_array_copies_shared_table() {
        let original = Zval::array(ZArray::from_iter([Zval::Int(1)]));
        let mut copy = original.clone();
        assert_eq!(original.refcount(), 2);

        let arr = separate_array(&mut copy).unwrap();
        arr.borrow_mut().push(Zval::Int(2)).unwrap();

        assert_eq!(original.as_array().unwrap().borrow().len(), 1);
        assert_eq!(copy.as_array().unwrap().borrow().len(), 2);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Zval::string("0").to_bool());
        assert!(!Zval::string("").to_bool());
        assert!(Zval::string("0.0").to_bool());
        assert!(!Zval::empty_array().to_bool());
        assert!(Zval::Float(0.1).to_bool());
    }

    #[test]
    fn test_debug_is_shallow_for_cycles() {
        let arr = Zval::empty_array();
        arr.as_array()
            .unwrap()
            .borrow_mut()
            .push(arr.clone())
            .unwrap();
        assert_eq!(format!("{:?}", arr), "Array(len=1)");
        arr.as_array().unwrap().borrow_mut().clear();
    }
}
