//! Ownership-tagged references to engine or host values.
//!
//! A [`ValueHandle`] either points into the [`HandleArena`] of the context
//! that issued it (engine-owned or borrowed) or carries a host value
//! directly. Every access to an engine-backed handle checks the arena slot
//! first, so a handle used after its context closed, or after its borrow
//! scope ended, fails with `StaleHandle`.
//!
//! Handles are `!Send`: they are tied to the thread of their engine.
//!
//! ```compile_fail
//! use ember_core::ValueHandle;
//!
//! let handle = ValueHandle::host(42i64.into());
//! std::thread::spawn(move || {
//!     let _ = handle.tag(); // Error: ValueHandle is !Send
//! });
//! ```

use crate::arena::{ContextId, HandleArena, SlotKey};
use crate::convert::{ConvertOptions, Converter};
use crate::error::{CoreError, CoreResult};
use crate::host::{HostKey, HostValue};
use ember_interp::{ArrayKey, ValueType, Zval};
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

/// Which memory regime owns the value behind a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// Held by the issuing context until it closes.
    EngineOwned,
    /// Plain host data; never stale.
    HostOwned,
    /// Valid only while a callback runs.
    Borrowed,
}

#[derive(Clone)]
enum Repr {
    Engine {
        arena: Rc<HandleArena>,
        key: SlotKey,
        borrowed: bool,
    },
    Host(Rc<HostValue>),
}

/// An immutable, tagged reference to an engine or host value.
#[derive(Clone)]
pub struct ValueHandle {
    tag: ValueType,
    repr: Repr,
    /// Marker to make this type !Send + !Sync
    _not_send: PhantomData<*mut ()>,
}

impl ValueHandle {
    /// Store `value` in `arena` and return an engine-owned handle.
    pub fn engine(arena: &Rc<HandleArena>, value: Zval) -> CoreResult<Self> {
        let tag = value.value_type();
        let key = arena.insert(value)?;
        Ok(Self {
            tag,
            repr: Repr::Engine {
                arena: Rc::clone(arena),
                key,
                borrowed: false,
            },
            _not_send: PhantomData,
        })
    }

    /// Wrap a host value.
    pub fn host(value: HostValue) -> Self {
        Self {
            tag: host_tag(&value),
            repr: Repr::Host(Rc::new(value)),
            _not_send: PhantomData,
        }
    }

    pub fn tag(&self) -> ValueType {
        self.tag
    }

    pub fn ownership(&self) -> Ownership {
        match &self.repr {
            Repr::Engine { borrowed: true, .. } => Ownership::Borrowed,
            Repr::Engine { .. } => Ownership::EngineOwned,
            Repr::Host(_) => Ownership::HostOwned,
        }
    }

    /// Issuing context, for engine-backed handles.
    pub fn context_id(&self) -> Option<ContextId> {
        match &self.repr {
            Repr::Engine { arena, .. } => Some(arena.context_id()),
            Repr::Host(_) => None,
        }
    }

    /// True when the handle can no longer be dereferenced.
    pub fn is_stale(&self) -> bool {
        match &self.repr {
            Repr::Engine { arena, key, .. } => !arena.contains(*key),
            Repr::Host(_) => false,
        }
    }

    /// The engine value behind an engine-backed handle.
    ///
    /// Fails with `StaleHandle` once the slot is gone, `ForeignHandle` when
    /// `context` did not issue the handle, and `TypeMismatch` for host
    /// handles.
    pub fn engine_value(&self, context: ContextId) -> CoreResult<Zval> {
        match &self.repr {
            Repr::Engine { arena, key, .. } => {
                if arena.context_id() != context {
                    return Err(CoreError::ForeignHandle {
                        expected: context,
                        found: arena.context_id(),
                    });
                }
                arena.get(*key)
            }
            Repr::Host(_) => Err(CoreError::type_mismatch("engine value", "host value")),
        }
    }

    /// The host value behind a host-owned handle.
    pub fn host_value(&self) -> Option<&HostValue> {
        match &self.repr {
            Repr::Host(value) => Some(value),
            Repr::Engine { .. } => None,
        }
    }

    /// Convert with default options.
    pub fn to_host(&self) -> CoreResult<HostValue> {
        self.to_host_with(ConvertOptions::default())
    }

    pub fn to_host_with(&self, options: ConvertOptions) -> CoreResult<HostValue> {
        match &self.repr {
            Repr::Engine { arena, key, .. } => {
                let value = arena.get(*key)?;
                Converter::new(options).to_host(&value, arena.context_id())
            }
            Repr::Host(value) => Ok(HostValue::clone(value)),
        }
    }

    /// Number of array elements or object properties.
    pub fn len(&self) -> CoreResult<usize> {
        match &self.repr {
            Repr::Engine { arena, key, .. } => Ok(match arena.get(*key)? {
                Zval::Array(array) => array.borrow().len(),
                Zval::Object(obj) => obj.borrow().props.len(),
                _ => 0,
            }),
            Repr::Host(value) => Ok(value.len()),
        }
    }

    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Array keys in order, or property names of an object.
    pub fn keys(&self) -> CoreResult<Vec<HostKey>> {
        match &self.repr {
            Repr::Engine { arena, key, .. } => Ok(match arena.get(*key)? {
                Zval::Array(array) => array
                    .borrow()
                    .keys()
                    .map(|key| match key {
                        ArrayKey::Int(i) => HostKey::Int(*i),
                        ArrayKey::Str(s) => HostKey::Str(s.to_string()),
                    })
                    .collect(),
                Zval::Object(obj) => obj
                    .borrow()
                    .props
                    .keys()
                    .map(|name| HostKey::Str(name.to_string()))
                    .collect(),
                _ => Vec::new(),
            }),
            Repr::Host(value) => Ok(match &**value {
                HostValue::List(items) => (0..items.len() as i64).map(HostKey::Int).collect(),
                HostValue::Map(map) => map.keys().cloned().collect(),
                HostValue::Object(obj) => {
                    obj.properties.keys().map(|k| HostKey::Str(k.clone())).collect()
                }
                _ => Vec::new(),
            }),
        }
    }

    /// Array element as a new handle in the same arena.
    pub fn get(&self, key: impl Into<HostKey>) -> CoreResult<Option<ValueHandle>> {
        let key = key.into();
        match &self.repr {
            Repr::Engine { arena, key: slot, .. } => {
                let member = match arena.get(*slot)? {
                    Zval::Array(array) => {
                        let engine_key = match &key {
                            HostKey::Int(i) => ArrayKey::Int(*i),
                            HostKey::Str(s) => ArrayKey::from_str_key(s),
                        };
                        array.borrow().get(&engine_key).cloned()
                    }
                    other => {
                        return Err(CoreError::type_mismatch("array", other.type_name()));
                    }
                };
                member.map(|value| Self::engine(arena, value)).transpose()
            }
            Repr::Host(value) => Ok(value.get(key).cloned().map(Self::host)),
        }
    }

    /// Object property as a new handle in the same arena.
    pub fn property(&self, name: &str) -> CoreResult<Option<ValueHandle>> {
        match &self.repr {
            Repr::Engine { arena, key, .. } => {
                let member = match arena.get(*key)? {
                    Zval::Object(obj) => obj.borrow().get(name).cloned(),
                    other => {
                        return Err(CoreError::type_mismatch("object", other.type_name()));
                    }
                };
                member.map(|value| Self::engine(arena, value)).transpose()
            }
            Repr::Host(value) => match &**value {
                HostValue::Object(obj) => Ok(obj.get(name).cloned().map(Self::host)),
                other => Err(CoreError::type_mismatch("object", other.type_name())),
            },
        }
    }

    /// Class of an object handle.
    pub fn class_name(&self) -> CoreResult<Option<String>> {
        match &self.repr {
            Repr::Engine { arena, key, .. } => Ok(match arena.get(*key)? {
                Zval::Object(obj) => Some(obj.borrow().class.to_string()),
                Zval::Callable(_) => Some("Closure".to_string()),
                _ => None,
            }),
            Repr::Host(value) => Ok(value.as_object().map(|obj| obj.class.clone())),
        }
    }
}

impl From<HostValue> for ValueHandle {
    fn from(value: HostValue) -> Self {
        Self::host(value)
    }
}

impl fmt::Debug for ValueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("ValueHandle");
        out.field("tag", &self.tag)
            .field("ownership", &self.ownership());
        if let Some(context) = self.context_id() {
            out.field("context", &context).field("stale", &self.is_stale());
        }
        out.finish()
    }
}

fn host_tag(value: &HostValue) -> ValueType {
    match value {
        HostValue::Null => ValueType::Null,
        HostValue::Bool(_) => ValueType::Bool,
        HostValue::Int(_) => ValueType::Int,
        HostValue::Float(_) => ValueType::Float,
        HostValue::String(_) => ValueType::String,
        HostValue::List(_) | HostValue::Map(_) | HostValue::BackRef(_) => ValueType::Array,
        HostValue::Object(_) => ValueType::Object,
        HostValue::Resource(_) => ValueType::Resource,
        HostValue::Callable(_) => ValueType::Callable,
    }
}

/// Issues borrowed handles and releases them when dropped.
///
/// Used for arguments of handle-level callbacks: the handles are valid
/// while the callback runs and stale afterwards, even when the callback
/// stored clones of them.
pub struct BorrowScope {
    arena: Rc<HandleArena>,
    keys: RefCell<Vec<SlotKey>>,
}

impl BorrowScope {
    pub fn new(arena: &Rc<HandleArena>) -> Self {
        Self {
            arena: Rc::clone(arena),
            keys: RefCell::new(Vec::new()),
        }
    }

    /// Issue a borrowed handle for `value`.
    pub fn borrow(&self, value: Zval) -> CoreResult<ValueHandle> {
        let tag = value.value_type();
        let key = self.arena.insert(value)?;
        self.keys.borrow_mut().push(key);
        Ok(ValueHandle {
            tag,
            repr: Repr::Engine {
                arena: Rc::clone(&self.arena),
                key,
                borrowed: true,
            },
            _not_send: PhantomData,
        })
    }

    /// Number of handles issued so far.
    pub fn issued(&self) -> usize {
        self.keys.borrow().len()
    }
}

impl Drop for BorrowScope {
    fn drop(&mut self) {
        for key in self.keys.get_mut().drain(..) {
            self.arena.release(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostObject;
    use ember_interp::{IniSettings, Request, Runtime};

    fn arena() -> Rc<HandleArena> {
        HandleArena::new(ContextId::next())
    }

    #[test]
    fn test_engine_handle_accessors() {
        let runtime = Runtime::startup(IniSettings::default(), None).unwrap();
        let mut request = Request::new(&runtime).unwrap();
        let value = request
            .eval("<?php return ['a' => 1, 'b' => ['c' => 'x']];", "t.php")
            .unwrap();
        let arena = arena();
        let handle = ValueHandle::engine(&arena, value).unwrap();

        assert_eq!(handle.tag(), ValueType::Array);
        assert_eq!(handle.ownership(), Ownership::EngineOwned);
        assert_eq!(handle.len().unwrap(), 2);
        assert_eq!(handle.keys().unwrap(), vec![HostKey::from("a"), HostKey::from("b")]);

        let inner = handle.get("b").unwrap().unwrap();
        assert_eq!(inner.tag(), ValueType::Array);
        assert_eq!(inner.get("c").unwrap().unwrap().to_host().unwrap(), HostValue::from("x"));
        assert!(handle.get("missing").unwrap().is_none());
        assert!(matches!(
            handle.property("a"),
            Err(CoreError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_close_makes_every_handle_stale() {
        let runtime = Runtime::startup(IniSettings::default(), None).unwrap();
        let mut request = Request::new(&runtime).unwrap();
        let object = request.new_object("stdClass").unwrap();
        let resource = request.new_resource("stream", None);
        let callable = request.lookup_function("strlen").unwrap();

        let arena = arena();
        let values = [
            Zval::Null,
            Zval::Bool(true),
            Zval::Int(1),
            Zval::Float(0.5),
            Zval::string("s"),
            Zval::empty_array(),
            object,
            resource,
            callable,
        ];
        let handles: Vec<_> = values
            .into_iter()
            .map(|value| ValueHandle::engine(&arena, value).unwrap())
            .collect();
        arena.close();
        for handle in &handles {
            assert!(handle.is_stale());
            assert!(matches!(handle.to_host(), Err(CoreError::StaleHandle { .. })));
            assert!(matches!(handle.len(), Err(CoreError::StaleHandle { .. })));
        }
    }

    #[test]
    fn test_foreign_context_is_rejected() {
        let arena = arena();
        let handle = ValueHandle::engine(&arena, Zval::Int(1)).unwrap();
        let other = ContextId::next();
        assert!(matches!(
            handle.engine_value(other),
            Err(CoreError::ForeignHandle { .. })
        ));
        assert!(handle.engine_value(arena.context_id()).is_ok());
    }

    #[test]
    fn test_borrow_scope_releases_on_drop() {
        let arena = arena();
        let kept;
        {
            let scope = BorrowScope::new(&arena);
            let handle = scope.borrow(Zval::Int(7)).unwrap();
            assert_eq!(handle.ownership(), Ownership::Borrowed);
            assert_eq!(handle.to_host().unwrap(), HostValue::Int(7));
            kept = handle.clone();
            assert_eq!(scope.issued(), 1);
        }
        assert!(kept.is_stale());
        assert_eq!(arena.live(), 0);
    }

    #[test]
    fn test_host_handle() {
        let value = HostValue::Object(HostObject::new("Point").with("x", 3i64));
        let handle = ValueHandle::host(value.clone());
        assert_eq!(handle.ownership(), Ownership::HostOwned);
        assert_eq!(handle.tag(), ValueType::Object);
        assert!(!handle.is_stale());
        assert_eq!(handle.context_id(), None);
        assert_eq!(handle.class_name().unwrap().as_deref(), Some("Point"));
        assert_eq!(
            handle.property("x").unwrap().unwrap().to_host().unwrap(),
            HostValue::Int(3)
        );
        assert_eq!(handle.to_host().unwrap(), value);
    }
}
