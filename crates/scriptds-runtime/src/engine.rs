//! The V8 engine wrapper that hosts exactly one script module.
//!
//! `ScriptEngine` is `!Send`: it lives on the thread that created it, either a
//! runtime worker thread (in-process strategy) or the `scriptds-host` main
//! thread (subprocess strategy). Both drive it through the same four steps:
//! [`load`](ScriptEngine::load), [`resolve_entry`](ScriptEngine::resolve_entry),
//! [`call`](ScriptEngine::call) and [`await_result`](ScriptEngine::await_result).

use std::collections::HashMap;
use std::future::poll_fn;
use std::sync::Once;
use std::task::Poll;
use std::time::Duration;

use deno_core::v8;
use deno_core::JsRuntime;
use deno_core::PollEventLoopOptions;
use deno_core::RuntimeOptions;

use crate::error::EngineError;
use crate::ops::scriptds_runtime;

/// Ensure V8 platform is initialized exactly once.
static V8_INIT: Once = Once::new();

/// Mutex to serialize V8 isolate creation.
/// Creating multiple isolates concurrently can cause crashes in V8.
static ISOLATE_CREATE_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

/// Marker line bundlers append to point at a source map.
const SOURCE_MAP_DIRECTIVE: &str = "//# sourceMappingURL=";

/// Identifies one in-flight call inside an engine.
pub type CallId = u64;

/// Initialize the V8 platform. Call this before spawning any runtimes.
/// Safe to call multiple times - will only initialize once.
pub fn init_platform() {
    V8_INIT.call_once(|| {
        JsRuntime::init_platform(None, false);
    });
}

/// Remove a trailing source-map directive line from a bundled module body.
pub fn strip_source_map(body: &str) -> &str {
    let trimmed = body.trim_end();
    let (head, last) = match trimmed.rsplit_once('\n') {
        Some((head, last)) => (head, last),
        None => ("", trimmed),
    };
    if last.trim_start().starts_with(SOURCE_MAP_DIRECTIVE) {
        head
    } else {
        body
    }
}

/// One V8 isolate with the bridge shims installed and at most one module body.
pub struct ScriptEngine {
    name: String,
    // Globals must be released before the isolate that owns them.
    pending: HashMap<CallId, v8::Global<v8::Value>>,
    runtime: JsRuntime,
    load_attempted: bool,
    module_ready: bool,
    entry: Option<String>,
    next_call: CallId,
}

impl ScriptEngine {
    /// Create an isolate and evaluate the bootstrap shims.
    pub fn new(name: impl Into<String>) -> Self {
        init_platform();
        let name = name.into();

        let runtime = {
            let _lock = ISOLATE_CREATE_LOCK.lock();
            tracing::debug!("[engine:{}] Creating JsRuntime", name);
            JsRuntime::new(RuntimeOptions {
                extensions: vec![scriptds_runtime::init_ops_and_esm()],
                ..Default::default()
            })
        };

        Self {
            name,
            pending: HashMap::new(),
            runtime,
            load_attempted: false,
            module_ready: false,
            entry: None,
            next_call: 1,
        }
    }

    /// Handle that can interrupt running JavaScript from another thread.
    pub fn isolate_handle(&mut self) -> v8::IsolateHandle {
        self.runtime.v8_isolate().thread_safe_handle()
    }

    /// Whether a module body has been evaluated successfully.
    pub fn is_loaded(&self) -> bool {
        self.module_ready
    }

    /// Name of the resolved entry point, if any.
    pub fn entry(&self) -> Option<&str> {
        self.entry.as_deref()
    }

    /// Evaluate the module body. Only the first call ever evaluates anything;
    /// a second attempt fails with [`EngineError::AlreadyLoaded`].
    ///
    /// Work the module schedules at top level gets up to `settle` to finish;
    /// whatever is still running afterwards keeps running during later calls.
    pub async fn load(&mut self, body: &str, settle: Duration) -> Result<(), EngineError> {
        if self.load_attempted {
            return Err(EngineError::AlreadyLoaded);
        }
        self.load_attempted = true;

        let source = strip_source_map(body).to_string();
        tracing::debug!("[engine:{}] Evaluating module ({} bytes)", self.name, source.len());

        self.runtime
            .execute_script("<module>", source)
            .map_err(|e| EngineError::Evaluation(e.to_string()))?;

        match tokio::time::timeout(
            settle,
            self.runtime.run_event_loop(PollEventLoopOptions::default()),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(EngineError::Evaluation(e.to_string())),
            Err(_) => {
                tracing::debug!(
                    "[engine:{}] Module still has pending work after {:?}",
                    self.name,
                    settle
                );
            }
        }

        self.module_ready = true;
        Ok(())
    }

    /// Look up the entry function by name.
    pub fn resolve_entry(&mut self, name: &str) -> Result<(), EngineError> {
        if !self.module_ready {
            return Err(EngineError::NotLoaded);
        }
        if self.entry.as_deref() == Some(name) {
            return Ok(());
        }

        let script = format!(
            "globalThis.__scriptds.resolveEntry({})",
            serde_json::to_string(name)?
        );
        let value = self
            .runtime
            .execute_script("<resolve>", script)
            .map_err(|e| EngineError::Evaluation(e.to_string()))?;

        let found = {
            let scope = &mut self.runtime.handle_scope();
            let local = v8::Local::new(scope, value);
            local.is_true()
        };

        if !found {
            return Err(EngineError::EntryNotFound(name.to_string()));
        }
        tracing::debug!("[engine:{}] Resolved entry point '{}'", self.name, name);
        self.entry = Some(name.to_string());
        Ok(())
    }

    /// Invoke the resolved entry point with `request` as its only argument.
    ///
    /// The returned id is redeemed with [`await_result`](Self::await_result).
    pub fn call(&mut self, entry: &str, request: &str) -> Result<CallId, EngineError> {
        if self.entry.as_deref() != Some(entry) {
            return Err(EngineError::EntryNotFound(entry.to_string()));
        }

        let script = format!(
            "globalThis.__scriptds.invoke({}, {})",
            serde_json::to_string(entry)?,
            serde_json::to_string(request)?
        );
        let value = self
            .runtime
            .execute_script("<call>", script)
            .map_err(|e| EngineError::CallFailed(e.to_string()))?;

        let id = self.next_call;
        self.next_call += 1;
        self.pending.insert(id, value);
        Ok(id)
    }

    /// Drive the event loop until the call settles and return its text.
    pub async fn await_result(
        &mut self,
        id: CallId,
        timeout: Duration,
    ) -> Result<String, EngineError> {
        let value = self.pending.remove(&id).ok_or(EngineError::UnknownCall(id))?;

        if self.is_pending(&value) {
            let drained = tokio::time::timeout(
                timeout,
                poll_fn(|cx| {
                    let polled = self
                        .runtime
                        .poll_event_loop(cx, PollEventLoopOptions::default());
                    if !self.is_pending(&value) {
                        return Poll::Ready(Ok(()));
                    }
                    polled
                }),
            )
            .await;

            match drained {
                Err(_) => return Err(EngineError::Timeout(timeout.as_millis() as u64)),
                Ok(Err(e)) => return Err(EngineError::EventLoop(e.to_string())),
                Ok(Ok(())) => {}
            }
        }

        self.settle(&value)
    }

    fn is_pending(&mut self, value: &v8::Global<v8::Value>) -> bool {
        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, value);
        match v8::Local::<v8::Promise>::try_from(local) {
            Ok(promise) => matches!(promise.state(), v8::PromiseState::Pending),
            Err(_) => false,
        }
    }

    fn settle(&mut self, value: &v8::Global<v8::Value>) -> Result<String, EngineError> {
        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, value);

        let settled = match v8::Local::<v8::Promise>::try_from(local) {
            Ok(promise) => match promise.state() {
                v8::PromiseState::Fulfilled => promise.result(scope),
                v8::PromiseState::Rejected => {
                    let reason = promise.result(scope);
                    return Err(EngineError::Rejected(reason.to_rust_string_lossy(scope)));
                }
                v8::PromiseState::Pending => return Err(EngineError::Stalled),
            },
            Err(_) => local,
        };

        if settled.is_string() {
            Ok(settled.to_rust_string_lossy(scope))
        } else {
            let kind = settled.type_of(scope).to_rust_string_lossy(scope);
            Err(EngineError::NonStringResult(kind))
        }
    }
}
