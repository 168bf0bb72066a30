//! Runtime spawn function.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use deno_core::v8;
use tokio::sync::{mpsc, watch};

use crate::engine::init_platform;
use crate::error::RuntimeError;
use crate::handle::RuntimeHandle;
use crate::worker::run_worker;

/// Spawn a runtime in its own OS thread.
///
/// Blocks until the worker has created its isolate and installed the shims,
/// so the returned handle is ready to accept a module body.
pub fn spawn_runtime(name: String) -> Result<RuntimeHandle, RuntimeError> {
    tracing::debug!("[spawn_runtime] Starting for {}", name);
    init_platform();

    let terminated = Arc::new(AtomicBool::new(false));
    let terminated_clone = terminated.clone();

    // Command channel
    let (cmd_tx, cmd_rx) = mpsc::channel(32);

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Channel to receive isolate handle from the worker thread
    let (init_tx, init_rx) = std::sync::mpsc::sync_channel::<Result<v8::IsolateHandle, String>>(1);

    let name_clone = name.clone();
    let thread_handle = thread::Builder::new()
        .name(name.clone())
        .spawn(move || -> Result<(), RuntimeError> {
            tracing::debug!("[spawn_runtime:{}] Thread started", name_clone);

            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = init_tx.send(Err(e.to_string()));
                    return Err(RuntimeError::SpawnFailed(e));
                }
            };

            let result = rt.block_on(run_worker(
                name_clone.clone(),
                terminated_clone,
                cmd_rx,
                shutdown_rx,
                init_tx,
            ));

            rt.shutdown_background();
            tracing::debug!("[spawn_runtime:{}] Thread exiting", name_clone);
            result
        })?;

    // Wait for initialization; a worker that panicked drops the sender.
    let isolate_handle = init_rx
        .recv()
        .map_err(|_| RuntimeError::StartFailed(format!("{} exited during startup", name)))?
        .map_err(RuntimeError::StartFailed)?;

    tracing::debug!("[spawn_runtime] {} is ready", name);

    Ok(RuntimeHandle {
        cmd_tx,
        shutdown_tx,
        terminated,
        isolate_handle,
        thread_handle: parking_lot::Mutex::new(Some(thread_handle)),
    })
}
