//! Worker thread implementation for the script runtime.
//!
//! This module contains the command loop that runs in a dedicated thread for
//! each runtime and owns the V8 isolate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use deno_core::v8;
use tokio::sync::{mpsc, watch};

use crate::command::RuntimeCommand;
use crate::engine::ScriptEngine;
use crate::error::RuntimeError;

/// The main worker loop that runs inside the spawned thread.
pub(crate) async fn run_worker(
    name: String,
    terminated: Arc<AtomicBool>,
    mut cmd_rx: mpsc::Receiver<RuntimeCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
    init_tx: std::sync::mpsc::SyncSender<Result<v8::IsolateHandle, String>>,
) -> Result<(), RuntimeError> {
    let mut engine = ScriptEngine::new(name.clone());

    // Shims are in place; hand the isolate handle to the host.
    let _ = init_tx.send(Ok(engine.isolate_handle()));

    loop {
        if *shutdown_rx.borrow() || terminated.load(Ordering::SeqCst) {
            tracing::debug!("[run_worker:{}] Shutdown signal received", name);
            break;
        }

        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!("[run_worker:{}] Received shutdown signal", name);
                    break;
                }
            }

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    tracing::debug!("[run_worker:{}] Command channel closed", name);
                    break;
                };

                match cmd {
                    RuntimeCommand::Load { body, settle, reply } => {
                        let result = engine.load(&body, settle).await;
                        let _ = reply.send(result);
                    }

                    RuntimeCommand::ResolveEntry { name: entry, reply } => {
                        let _ = reply.send(engine.resolve_entry(&entry));
                    }

                    RuntimeCommand::Call { entry, request, reply } => {
                        let _ = reply.send(engine.call(&entry, &request));
                    }

                    RuntimeCommand::Await { call, timeout, reply } => {
                        let result = engine.await_result(call, timeout).await;
                        let _ = reply.send(result);
                    }
                }
            }
        }
    }

    tracing::debug!("[run_worker:{}] Worker finished", name);
    Ok(())
}
