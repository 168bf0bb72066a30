//! Handle to a runtime running on its own worker thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use deno_core::v8;
use tokio::sync::{mpsc, oneshot, watch};

use crate::command::{Reply, RuntimeCommand};
use crate::engine::CallId;
use crate::error::RuntimeError;

/// Handle to a spawned script runtime.
///
/// Commands are processed one at a time by the worker, in the order they
/// were sent.
pub struct RuntimeHandle {
    /// Command sender
    pub(crate) cmd_tx: mpsc::Sender<RuntimeCommand>,
    /// Shutdown signal sender
    pub(crate) shutdown_tx: watch::Sender<bool>,
    /// Whether the runtime has terminated
    pub(crate) terminated: Arc<AtomicBool>,
    /// V8 isolate handle for forced termination
    pub(crate) isolate_handle: v8::IsolateHandle,
    /// Thread join handle
    pub(crate) thread_handle: parking_lot::Mutex<Option<thread::JoinHandle<Result<(), RuntimeError>>>>,
}

impl RuntimeHandle {
    /// Helper to send a command and wait for reply.
    async fn send_command<T, F>(&self, make_cmd: F) -> Result<T, RuntimeError>
    where
        F: FnOnce(Reply<T>) -> RuntimeCommand,
    {
        if self.is_terminated() {
            return Err(RuntimeError::Terminated);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make_cmd(reply_tx))
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;

        reply_rx
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?
            .map_err(RuntimeError::Engine)
    }

    /// Evaluate the module body inside the runtime.
    pub async fn load(&self, body: String, settle: Duration) -> Result<(), RuntimeError> {
        self.send_command(|reply| RuntimeCommand::Load { body, settle, reply })
            .await
    }

    /// Resolve the module's entry function.
    pub async fn resolve_entry(&self, name: &str) -> Result<(), RuntimeError> {
        let name = name.to_string();
        self.send_command(|reply| RuntimeCommand::ResolveEntry { name, reply })
            .await
    }

    /// Invoke the entry function; the result is collected with `await_result`.
    pub async fn call(&self, entry: &str, request: String) -> Result<CallId, RuntimeError> {
        let entry = entry.to_string();
        self.send_command(|reply| RuntimeCommand::Call {
            entry,
            request,
            reply,
        })
        .await
    }

    /// Wait for a call to settle and return its textual result.
    pub async fn await_result(
        &self,
        call: CallId,
        timeout: Duration,
    ) -> Result<String, RuntimeError> {
        self.send_command(|reply| RuntimeCommand::Await {
            call,
            timeout,
            reply,
        })
        .await
    }

    /// Terminate the runtime.
    ///
    /// This signals the worker thread to shut down and forcefully terminates
    /// V8 execution if it's stuck.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        self.isolate_handle.terminate_execution();
    }

    /// Check if the runtime has terminated, either on request or because the
    /// worker thread exited.
    pub fn is_terminated(&self) -> bool {
        if self.terminated.load(Ordering::SeqCst) {
            return true;
        }
        self.thread_handle
            .lock()
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }

    /// Wait for the runtime thread to finish.
    pub fn join(self) -> Result<(), RuntimeError> {
        let handle = self.thread_handle.lock().take();
        if let Some(handle) = handle {
            handle.join().map_err(|_| RuntimeError::ThreadPanic)??;
        }
        Ok(())
    }
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        self.terminate();
        // Wait for the thread to finish to ensure clean V8 shutdown
        if let Some(handle) = self.thread_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::spawn::spawn_runtime;
    use tokio_test::assert_ok;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_round_trip_through_worker() {
        let handle = spawn_runtime("test-worker".to_string()).unwrap();
        assert_ok!(
            handle
                .load("function runQuery(r) { return r.toUpperCase(); }".into(), TIMEOUT)
                .await
        );
        assert_ok!(handle.resolve_entry("runQuery").await);

        let call = handle.call("runQuery", "abc".into()).await.unwrap();
        assert_eq!(handle.await_result(call, TIMEOUT).await.unwrap(), "ABC");
    }

    #[tokio::test]
    async fn test_engine_errors_pass_through() {
        let handle = spawn_runtime("test-worker-errors".to_string()).unwrap();
        handle.load("const x = 1;".into(), TIMEOUT).await.unwrap();

        match handle.resolve_entry("runQuery").await {
            Err(RuntimeError::Engine(EngineError::EntryNotFound(name))) => {
                assert_eq!(name, "runQuery")
            }
            other => panic!("expected EntryNotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminate() {
        let handle = spawn_runtime("test-worker-terminate".to_string()).unwrap();
        assert!(!handle.is_terminated());

        handle.terminate();
        assert!(handle.is_terminated());
        assert!(matches!(
            handle.resolve_entry("runQuery").await,
            Err(RuntimeError::Terminated)
        ));
        assert_ok!(handle.join());
    }
}
