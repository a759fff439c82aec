//! ember-interp - the script engine behind Ember's native interface.
//!
//! A small PHP-flavoured interpreter with tagged, reference-counted values.
//! The binding layer talks to it through a fixed surface:
//!
//! - [`Runtime::startup`] / [`Runtime::shutdown`]: module lifecycle, ini
//!   settings, the built-in function table and the interrupt flag.
//! - [`Request`]: per-context state. Globals, function and class tables,
//!   object/resource/callable stores, output and warning buffers.
//! - [`Zval`]: the value representation every operation works on.
//!
//! # Example
//!
//! ```
//! use ember_interp::{IniSettings, Request, Runtime, Zval};
//!
//! let runtime = Runtime::startup(IniSettings::default(), None).unwrap();
//! let mut request = Request::new(&runtime).unwrap();
//! let value = request.eval("<?php echo 'hi'; return 6 * 7;", "demo.php").unwrap();
//! assert!(matches!(value, Zval::Int(42)));
//! assert_eq!(request.take_output(), "hi");
//! request.shutdown();
//! runtime.shutdown();
//! ```
//!
//! Values are `Rc`-based and therefore `!Send`: a runtime and its requests
//! live on one thread.

pub mod ast;
pub mod classes;
pub mod error;
pub mod loader;
pub mod ops;
pub mod request;
pub mod runtime;
pub mod value;

mod builtins;
mod calls;
mod interpreter;
mod lexer;
mod parser;

pub use classes::{ClassEntry, NativeClass, THROWABLE};
pub use error::{AccessError, EvalError, EvalResult, NativeFault, ParseError, ThrownError};
pub use loader::{
    IncludePathLoader, MemorySourceProvider, ScriptSource, SharedSourceProvider, SourceProvider,
};
pub use parser::parse;
pub use request::{NativeFunction, NativeHandler, Request, ShutdownReport, Warning, WarningLevel};
pub use runtime::{IniError, IniSettings, InterruptHandle, Runtime};
pub use value::{
    canonical_int, ArrayKey, ArrayRef, CallableKind, ObjectRef, ValueType, ZArray, ZCallable,
    ZObject, ZResource, Zval,
};
