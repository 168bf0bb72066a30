//! scriptds JavaScript runtime
//!
//! This crate hosts a single script module inside a V8 isolate and exposes
//! the load / resolve / call / await sequence used by the datasource bridge.
//! It follows Deno's worker pattern: each runtime runs in its own OS thread
//! with its own isolate and a current-thread tokio runtime.
//!
//! # Architecture
//!
//! - [`ScriptEngine`] wraps the isolate; it is `!Send` and stays on its thread
//! - [`spawn_runtime`] starts a worker thread that owns one engine
//! - [`RuntimeHandle`] sends commands to the worker and awaits replies
//! - [`ipc`] is the frame codec shared with the `scriptds-host` process

mod command;
mod engine;
mod error;
mod handle;
pub mod ipc;
mod ops;
mod spawn;
mod worker;

pub use engine::{init_platform, strip_source_map, CallId, ScriptEngine};
pub use error::{EngineError, RuntimeError};
pub use handle::RuntimeHandle;
pub use ops::scriptds_runtime;
pub use spawn::spawn_runtime;
