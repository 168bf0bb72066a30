//! In-process environment: a runtime worker thread owned by this process.
//!
//! The worker's own deadline only covers waiting on the event loop. Script
//! that never yields is bounded here: when a reply does not arrive in time
//! the isolate is terminated and the environment reports itself dead.

use std::time::Duration;

use async_trait::async_trait;
use scriptds_runtime::{spawn_runtime, CallId, EngineError, RuntimeHandle};
use tracing::{debug, error, warn};

use super::Environment;
use crate::error::BridgeError;

/// Bound on `Resolve` replies, and extra time for `Load` beyond its settle.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra time the worker gets on top of a call's own deadline.
const REPLY_SLACK: Duration = Duration::from_millis(500);

pub struct InProcessEnvironment {
    name: String,
    handle: Option<RuntimeHandle>,
    next_call: CallId,
    /// Call started but not yet sent, so the whole call shares one deadline
    pending: Option<(CallId, String, String)>,
}

impl InProcessEnvironment {
    /// Spawn the worker thread and wait until its isolate is ready.
    pub async fn start(name: &str, startup_timeout: Duration) -> Result<Self, BridgeError> {
        let thread_name = format!("scriptds:{}", name);
        let spawn = tokio::task::spawn_blocking(move || spawn_runtime(thread_name));

        let handle = tokio::time::timeout(startup_timeout, spawn)
            .await
            .map_err(|_| {
                BridgeError::Lifecycle(format!(
                    "runtime did not start within {:?}",
                    startup_timeout
                ))
            })?
            .map_err(|e| BridgeError::Lifecycle(format!("runtime start task failed: {}", e)))??;

        debug!("In-process runtime for {} is ready", name);
        Ok(Self {
            name: name.to_string(),
            handle: Some(handle),
            next_call: 1,
            pending: None,
        })
    }

    fn handle(&self) -> Result<&RuntimeHandle, BridgeError> {
        self.handle
            .as_ref()
            .ok_or_else(|| BridgeError::Lifecycle("environment has been disposed".into()))
    }

    /// Interrupt whatever the isolate is running. The worker exits and the
    /// environment stops being alive.
    fn abort(&self, waited: Duration) {
        warn!(
            "Runtime for {} did not answer within {:?}, terminating it",
            self.name, waited
        );
        if let Some(handle) = &self.handle {
            handle.terminate();
        }
    }
}

#[async_trait]
impl Environment for InProcessEnvironment {
    async fn load(&mut self, body: &str, settle: Duration) -> Result<(), BridgeError> {
        let limit = settle.saturating_add(COMMAND_TIMEOUT);
        let loading = self.handle()?.load(body.to_string(), settle);
        match tokio::time::timeout(limit, loading).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                self.abort(limit);
                Err(BridgeError::Lifecycle(format!(
                    "module did not finish loading within {:?}",
                    limit
                )))
            }
        }
    }

    async fn resolve_entry(&mut self, name: &str) -> Result<(), BridgeError> {
        let resolving = self.handle()?.resolve_entry(name);
        match tokio::time::timeout(COMMAND_TIMEOUT, resolving).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                self.abort(COMMAND_TIMEOUT);
                Err(BridgeError::Timeout(COMMAND_TIMEOUT))
            }
        }
    }

    async fn call(&mut self, entry: &str, request: String) -> Result<CallId, BridgeError> {
        self.handle()?;
        let id = self.next_call;
        self.next_call += 1;
        self.pending = Some((id, entry.to_string(), request));
        Ok(id)
    }

    async fn await_result(
        &mut self,
        call: CallId,
        timeout: Duration,
    ) -> Result<String, BridgeError> {
        let (entry, request) = match self.pending.take() {
            Some((id, entry, request)) if id == call => (entry, request),
            other => {
                self.pending = other;
                return Err(EngineError::UnknownCall(call).into());
            }
        };

        let handle = self.handle()?;
        let running = async {
            let started = handle.call(&entry, request).await?;
            handle.await_result(started, timeout).await
        };
        match tokio::time::timeout(timeout.saturating_add(REPLY_SLACK), running).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                self.abort(timeout);
                Err(BridgeError::Timeout(timeout))
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_terminated())
    }

    async fn dispose(&mut self) -> Result<(), BridgeError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle.terminate();

        let joined = tokio::task::spawn_blocking(move || handle.join())
            .await
            .map_err(|e| BridgeError::Lifecycle(format!("join task failed: {}", e)))?;
        if let Err(e) = joined {
            error!("Runtime for {} did not shut down cleanly: {}", self.name, e);
            return Err(e.into());
        }
        debug!("In-process runtime for {} disposed", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_lifecycle() {
        let mut env = InProcessEnvironment::start("test", TIMEOUT).await.unwrap();
        assert!(env.is_alive());

        assert_ok!(env.load("function runQuery(r) { return r + '!'; }", TIMEOUT).await);
        assert_ok!(env.resolve_entry("runQuery").await);
        let call = env.call("runQuery", "hi".into()).await.unwrap();
        assert_eq!(env.await_result(call, TIMEOUT).await.unwrap(), "hi!");

        assert_ok!(env.dispose().await);
        assert!(!env.is_alive());
        assert_ok!(env.dispose().await);
        assert!(matches!(
            env.resolve_entry("runQuery").await,
            Err(BridgeError::Lifecycle(_))
        ));
    }

    #[tokio::test]
    async fn test_busy_call_is_terminated() {
        let mut env = InProcessEnvironment::start("busy", TIMEOUT).await.unwrap();
        env.load(
            r#"globalThis.runQuery = async (req) => {
                if (req === "spin-later") await null;
                while (true) {}
            };"#,
            TIMEOUT,
        )
        .await
        .unwrap();
        env.resolve_entry("runQuery").await.unwrap();

        let limit = Duration::from_millis(100);
        let call = env.call("runQuery", "spin".into()).await.unwrap();
        assert_eq!(
            env.await_result(call, limit).await,
            Err(BridgeError::Timeout(limit))
        );
        assert!(!env.is_alive());
        assert_ok!(env.dispose().await);

        let mut env = InProcessEnvironment::start("busy-async", TIMEOUT).await.unwrap();
        env.load("globalThis.runQuery = async () => { await null; while (true) {} };", TIMEOUT)
            .await
            .unwrap();
        env.resolve_entry("runQuery").await.unwrap();
        let call = env.call("runQuery", "spin-later".into()).await.unwrap();
        assert_eq!(
            env.await_result(call, limit).await,
            Err(BridgeError::Timeout(limit))
        );
        assert!(!env.is_alive());
        assert_ok!(env.dispose().await);
    }

    #[tokio::test]
    async fn test_unknown_call() {
        let mut env = InProcessEnvironment::start("unknown-call", TIMEOUT).await.unwrap();
        env.load("function runQuery() { return 'ok'; }", TIMEOUT).await.unwrap();
        env.resolve_entry("runQuery").await.unwrap();

        let first = env.call("runQuery", String::new()).await.unwrap();
        let second = env.call("runQuery", String::new()).await.unwrap();
        assert_eq!(
            env.await_result(first, TIMEOUT).await,
            Err(BridgeError::Invocation(EngineError::UnknownCall(first)))
        );
        assert_eq!(env.await_result(second, TIMEOUT).await.unwrap(), "ok");
        assert_ok!(env.dispose().await);
    }

    #[tokio::test]
    async fn test_dispose_before_load() {
        let mut env = InProcessEnvironment::start("never-loaded", TIMEOUT).await.unwrap();
        assert_ok!(env.dispose().await);
    }
}
