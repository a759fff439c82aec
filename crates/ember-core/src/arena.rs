//! Context-scoped storage for engine values referenced by handles.
//!
//! Every engine-owned [`ValueHandle`](crate::ValueHandle) points at a slot in
//! the arena of the context that issued it. The slot holds one engine
//! reference; closing the arena drops all of them at once and bumps every
//! generation, so outstanding handles fail with `StaleHandle` instead of
//! reaching freed engine memory.

use crate::error::{CoreError, CoreResult};
use ember_interp::Zval;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Address of one arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    value: Option<Zval>,
}

#[derive(Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    closed: bool,
}

/// Slot storage shared by a context and the handles it issued.
pub struct HandleArena {
    context: ContextId,
    inner: RefCell<Slots>,
}

impl HandleArena {
    pub fn new(context: ContextId) -> Rc<Self> {
        Rc::new(Self {
            context,
            inner: RefCell::new(Slots::default()),
        })
    }

    pub fn context_id(&self) -> ContextId {
        self.context
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Number of occupied slots.
    pub fn live(&self) -> usize {
        self.inner.borrow().live
    }

    /// Store `value` and return its key. Fails once the arena is closed.
    pub fn insert(&self, value: Zval) -> CoreResult<SlotKey> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Err(self.stale());
        }
        inner.live += 1;
        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            slot.value = Some(value);
            return Ok(SlotKey {
                index,
                generation: slot.generation,
            });
        }
        let index = u32::try_from(inner.slots.len())
            .map_err(|_| CoreError::Engine("handle arena exhausted".into()))?;
        inner.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Ok(SlotKey {
            index,
            generation: 0,
        })
    }

    /// Clone the engine value stored at `key`.
    pub fn get(&self, key: SlotKey) -> CoreResult<Zval> {
        let inner = self.inner.borrow();
        inner
            .slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.clone())
            .ok_or_else(|| self.stale())
    }

    pub fn contains(&self, key: SlotKey) -> bool {
        self.get(key).is_ok()
    }

    /// Free one slot. Returns false when it was already free.
    pub fn release(&self, key: SlotKey) -> bool {
        let value = {
            let mut inner = self.inner.borrow_mut();
            let Some(slot) = inner.slots.get_mut(key.index as usize) else {
                return false;
            };
            if slot.generation != key.generation || slot.value.is_none() {
                return false;
            }
            slot.generation = slot.generation.wrapping_add(1);
            let value = slot.value.take();
            inner.live -= 1;
            inner.free.push(key.index);
            value
        };
        // Dropped outside the borrow.
        drop(value);
        true
    }

    /// Drop every stored value and refuse further inserts. Idempotent;
    /// returns the number of values released.
    pub fn close(&self) -> usize {
        let values: Vec<Zval> = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return 0;
            }
            inner.closed = true;
            inner.live = 0;
            inner.free.clear();
            inner
                .slots
                .iter_mut()
                .filter_map(|slot| {
                    slot.generation = slot.generation.wrapping_add(1);
                    slot.value.take()
                })
                .collect()
        };
        let released = values.len();
        drop(values);
        debug!(context = %self.context, released, "handle arena closed");
        released
    }

    fn stale(&self) -> CoreError {
        CoreError::StaleHandle {
            context: self.context,
        }
    }
}

impl fmt::Debug for HandleArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("HandleArena")
            .field("context", &self.context)
            .field("live", &inner.live)
            .field("closed", &inner.closed)
            .finish()
    }
}
