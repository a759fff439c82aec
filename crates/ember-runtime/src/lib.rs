//! ember-runtime - embedding API for the Ember scripting engine.
//!
//! This crate wraps the engine in a lifecycle-safe host API: one [`Engine`]
//! per thread, one open [`ExecutionContext`] per engine, and host functions
//! scripts can call through the callback bridge.
//!
//! # Features
//!
//! - **Scoped handles**: every [`ValueHandle`] a context issues goes stale
//!   when the context closes, so no reference outlives the engine request
//! - **Conversion**: ordered maps, objects, resources and callables cross
//!   the boundary as [`HostValue`], cycles as back-references
//! - **Callbacks**: [`HostFunction`]s with arity and parameter checks; host
//!   failures surface in scripts as catchable `HostException`s
//! - **Diagnostics**: script output and warnings are returned with every
//!   execution and forwarded to a [`DiagnosticsSink`]
//! - **Worker pool**: dedicated engine threads behind a `Send + Sync` handle
//!
//! # Example
//!
//! ```
//! use ember_runtime::{Arity, Engine, EngineConfig, HostFunction, HostValue};
//!
//! let engine = Engine::start(EngineConfig::default()).unwrap();
//! engine
//!     .register(HostFunction::new("greet", Arity::Exact(1), |args| {
//!         let name = args[0].as_str().unwrap_or("stranger");
//!         Ok(HostValue::from(format!("Hello, {name}!")))
//!     }))
//!     .unwrap();
//!
//! let ctx = engine.new_context().unwrap();
//! ctx.bind_global("user", "Ada").unwrap();
//! let (value, _) = ctx.execute("<?php return greet($user);").unwrap();
//! assert_eq!(value, HostValue::from("Hello, Ada!"));
//!
//! ctx.close().unwrap();
//! engine.shutdown().unwrap();
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    WorkerPool (optional)                     │
//! │   ember-worker-0   ember-worker-1   ...   (one Engine each)  │
//! └─────────────────────────────────────────────────────────────┘
//!                           ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Engine                                    │
//! │  - thread slot, start/shutdown                               │
//! │  - registered functions, classes, extensions                 │
//! └─────────────────────────────────────────────────────────────┘
//!                           ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ExecutionContext                          │
//! │  - engine request (globals, functions, object store)         │
//! │  - handle arena, invalidated on close                        │
//! └─────────────────────────────────────────────────────────────┘
//!                           ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ValueHandle / HostValue                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Thread Safety
//!
//! [`Engine`], [`ExecutionContext`] and [`ValueHandle`] are `!Send`. Use a
//! [`WorkerPool`] when scripts must run on behalf of other threads; its
//! [`WorkerHandle`] is `Send + Sync` and exchanges only [`HostValue`]s.
//!
//! ```compile_fail
//! use ember_runtime::{Engine, EngineConfig};
//!
//! let engine = Engine::start(EngineConfig::default()).unwrap();
//! std::thread::spawn(move || {
//!     let _ = engine.new_context(); // Error: Engine is !Send
//! });
//! ```

pub mod bridge;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod worker;

pub use bridge::{Arity, Extension, HostCall, HostFunction, HostHandler, ParamType};
pub use config::EngineConfig;
pub use context::{ContextState, ExecResult, ExecutionContext, WeakContext};
pub use diagnostics::{CollectingSink, Diagnostics, DiagnosticsSink, SharedSink, TracingSink};
pub use engine::{Engine, EngineBuilder, EngineState};
pub use error::{EmberError, EmberResult, HOST_EXCEPTION, HostError, HostResult, ScriptFailure};
pub use worker::{PoolStats, PoolStatsSnapshot, WorkerHandle, WorkerPool, WorkerPoolBuilder};

// Re-export the value layer so hosts need a single dependency
pub use ember_core::{
    ContextId, ConvertOptions, CoreError, CyclePolicy, EngineClass, FromHost, HostCallable,
    HostKey, HostMap, HostObject, HostResource, HostValue, IntoHost, Ownership, ValueHandle,
};
pub use ember_interp::{
    IncludePathLoader, InterruptHandle, MemorySourceProvider, SharedSourceProvider,
    SourceProvider, Warning, WarningLevel,
};
