//! Value handles and host/engine conversion for Ember.
//!
//! This crate sits between the engine (`ember-interp`) and the host-facing
//! runtime. It owns the pieces that decide how engine values are referenced
//! and copied across the boundary:
//!
//! - [`ValueHandle`]: an ownership-tagged reference, engine-owned, borrowed
//!   or host-owned.
//! - [`HandleArena`]: per-context slot storage; closing it invalidates every
//!   handle at once.
//! - [`Converter`]: cycle-aware conversion between engine values and
//!   [`HostValue`].
//! - [`FromHost`] / [`IntoHost`] / [`EngineClass`]: typed extraction.
//!
//! # Example
//!
//! ```
//! use ember_core::{ContextId, Converter, HostValue};
//! use ember_interp::{IniSettings, Request, Runtime};
//!
//! let runtime = Runtime::startup(IniSettings::default(), None).unwrap();
//! let mut request = Request::new(&runtime).unwrap();
//! let context = ContextId::next();
//!
//! let value = request.eval("<?php return ['a' => 1, 'b' => 2];", "demo.php").unwrap();
//! let host = Converter::default().to_host(&value, context).unwrap();
//! assert_eq!(host, HostValue::map([("a", 1i64), ("b", 2i64)]));
//! ```
//!
//! # Thread Safety
//!
//! Handles and arenas are `!Send` and `!Sync`: they reference engine values
//! that belong to one thread. [`HostValue`] holds no engine references and
//! is `Send`.
//!
//! ```compile_fail
//! use ember_core::{ContextId, HandleArena};
//!
//! let arena = HandleArena::new(ContextId::next());
//! std::thread::spawn(move || {
//!     arena.close(); // Error: HandleArena is !Send
//! });
//! ```

mod arena;
mod convert;
mod error;
mod handle;
mod host;
pub mod typed;

pub use arena::{ContextId, HandleArena, SlotKey};
pub use convert::{ConvertOptions, Converter, CyclePolicy};
pub use error::{CoreError, CoreResult};
pub use handle::{BorrowScope, Ownership, ValueHandle};
pub use host::{HostCallable, HostKey, HostMap, HostObject, HostResource, HostValue, Origin};
pub use typed::{EngineClass, FromHost, IntoHost};

// Re-export the engine value type for callers working with raw handles
pub use ember_interp::{ValueType, Zval};

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}

    #[test]
    fn test_host_values_are_send() {
        assert_send::<HostValue>();
        assert_send::<CoreError>();
        assert_send::<ContextId>();
    }
}
