//! Process-isolated environment
//!
//! Spawns a `scriptds-host` subprocess that owns the V8 isolate, giving
//! OS-level fault isolation. The module body is written to a temporary file
//! the host reads on `Load`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use scriptds_runtime::ipc::{
    CallRequest, CallResponse, HostMessage, IpcReader, IpcWriter, LoadRequest, MessageType,
    ResolveRequest,
};
use scriptds_runtime::{CallId, EngineError};
use tempfile::NamedTempFile;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::Environment;
use crate::error::BridgeError;

const HOST_BINARY: &str = "scriptds-host";

/// Grace period for the host to exit after `Shutdown`.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Bound on replies to `Load` (beyond its settle time) and `Resolve`.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra time the parent waits on top of the host's own call deadline.
const REPLY_SLACK: Duration = Duration::from_millis(500);

/// Stand-in deadline for timeouts too large to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

pub struct SubprocessEnvironment {
    name: String,
    child: Option<Child>,
    /// Writer for sending messages to the host
    writer: Option<IpcWriter<ChildStdin>>,
    /// Messages read by the background reader task
    inbox: mpsc::Receiver<HostMessage>,
    reader_handle: Option<JoinHandle<()>>,
    module_file: Option<NamedTempFile>,
    next_call: CallId,
    /// Call started but not yet sent; the host needs its deadline too
    pending: Option<(CallId, String)>,
}

/// Instant `timeout` from now, saturating for huge timeouts.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

/// Path to the `scriptds-host` binary
fn host_binary_path(configured: Option<&Path>) -> PathBuf {
    if let Some(path) = configured {
        return path.to_path_buf();
    }
    // Try to find in same directory as current executable
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        let host_path = dir.join(HOST_BINARY);
        if host_path.exists() {
            return host_path;
        }
    }
    // Fall back to PATH
    PathBuf::from(HOST_BINARY)
}

impl SubprocessEnvironment {
    /// Spawn the host process and wait for its `Ready` frame.
    pub async fn start(
        name: &str,
        host_binary: Option<&Path>,
        startup_timeout: Duration,
    ) -> Result<Self, BridgeError> {
        let module_file = tempfile::Builder::new()
            .prefix("scriptds-")
            .suffix(".js")
            .tempfile()
            .map_err(|e| BridgeError::Lifecycle(format!("cannot create module file: {}", e)))?;

        let host_binary = host_binary_path(host_binary);
        info!(
            "Spawning script host: {} {}",
            host_binary.display(),
            module_file.path().display()
        );

        let mut child = Command::new(&host_binary)
            .arg(module_file.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Host logs go to our stderr
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BridgeError::Lifecycle(format!(
                    "failed to spawn {}: {}",
                    host_binary.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Lifecycle("failed to get host stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Lifecycle("failed to get host stdout".into()))?;

        let (tx, inbox) = mpsc::channel(16);
        let label = name.to_string();
        let reader_handle = tokio::spawn(async move {
            let mut reader = IpcReader::new(stdout);
            loop {
                match reader.recv().await {
                    Ok(Some(msg)) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("Script host for {} closed connection", label);
                        break;
                    }
                    Err(e) => {
                        error!("Error reading from script host for {}: {}", label, e);
                        break;
                    }
                }
            }
        });

        let mut env = Self {
            name: name.to_string(),
            child: Some(child),
            writer: Some(IpcWriter::new(stdin)),
            inbox,
            reader_handle: Some(reader_handle),
            module_file: Some(module_file),
            next_call: 1,
            pending: None,
        };

        match env.expect(MessageType::Ready, startup_timeout).await {
            Ok(_) => {
                debug!("Script host for {} is ready", name);
                Ok(env)
            }
            Err(e) => {
                let _ = env.dispose().await;
                Err(match e {
                    BridgeError::Timeout(_) => BridgeError::Lifecycle(format!(
                        "script host not ready within {:?}",
                        startup_timeout
                    )),
                    other => other,
                })
            }
        }
    }

    /// Temporary file holding the module body, until disposed.
    pub fn module_path(&self) -> Option<&Path> {
        self.module_file.as_ref().map(NamedTempFile::path)
    }

    async fn kill_host(&mut self) {
        if let Some(child) = self.child.as_mut() {
            warn!("Script host for {} stopped answering, killing it", self.name);
            if let Err(e) = child.kill().await {
                error!("Failed to kill script host for {}: {}", self.name, e);
            }
        }
    }

    async fn send(&mut self, msg: &HostMessage) -> Result<(), BridgeError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| BridgeError::Lifecycle("environment has been disposed".into()))?;
        writer
            .send(msg)
            .await
            .map_err(|e| BridgeError::Lifecycle(format!("IPC send error: {}", e)))
    }

    /// Next message from the host, bounded by `timeout`.
    async fn next(&mut self, timeout: Duration) -> Result<HostMessage, BridgeError> {
        match tokio::time::timeout(timeout, self.inbox.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(BridgeError::Lifecycle("script host exited".into())),
            Err(_) => Err(BridgeError::Timeout(timeout)),
        }
    }

    /// Wait for `expected`, turning an `Error` frame into its engine error.
    async fn expect(
        &mut self,
        expected: MessageType,
        timeout: Duration,
    ) -> Result<HostMessage, BridgeError> {
        let deadline = deadline_after(timeout);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let msg = self.next(remaining).await.map_err(|e| match e {
                BridgeError::Timeout(_) => BridgeError::Timeout(timeout),
                other => other,
            })?;

            match msg.msg_type {
                t if t == expected => return Ok(msg),
                MessageType::Error => return Err(engine_error(&msg).into()),
                MessageType::Result => {
                    // Answer to a call the parent already gave up on
                    debug!("Discarding stale result from script host");
                }
                other => {
                    return Err(BridgeError::Lifecycle(format!(
                        "expected {:?} from script host, got {:?}",
                        expected, other
                    )));
                }
            }
        }
    }
}

fn engine_error(msg: &HostMessage) -> EngineError {
    msg.parse_json::<EngineError>().unwrap_or_else(|e| {
        EngineError::Serialization(format!("malformed error frame: {}", e))
    })
}

#[async_trait]
impl Environment for SubprocessEnvironment {
    async fn load(&mut self, body: &str, settle: Duration) -> Result<(), BridgeError> {
        let file = self
            .module_file
            .as_mut()
            .ok_or_else(|| BridgeError::Lifecycle("environment has been disposed".into()))?;
        let body = scriptds_runtime::strip_source_map(body);
        file.as_file_mut()
            .write_all(body.as_bytes())
            .and_then(|_| file.as_file_mut().flush())
            .map_err(|e| BridgeError::Lifecycle(format!("cannot write module file: {}", e)))?;
        if let Some(path) = self.module_path() {
            debug!("Module for {} written to {}", self.name, path.display());
        }

        let msg = HostMessage::json(
            MessageType::Load,
            &LoadRequest {
                settle_ms: settle.as_millis() as u64,
            },
        )
        .map_err(EngineError::from)?;
        self.send(&msg).await?;
        self.expect(MessageType::Loaded, settle.saturating_add(COMMAND_TIMEOUT))
            .await?;
        Ok(())
    }

    async fn resolve_entry(&mut self, name: &str) -> Result<(), BridgeError> {
        let msg = HostMessage::json(
            MessageType::Resolve,
            &ResolveRequest {
                name: name.to_string(),
            },
        )
        .map_err(EngineError::from)?;
        self.send(&msg).await?;
        self.expect(MessageType::Resolved, COMMAND_TIMEOUT).await?;
        Ok(())
    }

    async fn call(&mut self, _entry: &str, request: String) -> Result<CallId, BridgeError> {
        let id = self.next_call;
        self.next_call += 1;
        self.pending = Some((id, request));
        Ok(id)
    }

    async fn await_result(
        &mut self,
        call: CallId,
        timeout: Duration,
    ) -> Result<String, BridgeError> {
        let request = match self.pending.take() {
            Some((id, request)) if id == call => request,
            other => {
                self.pending = other;
                return Err(EngineError::UnknownCall(call).into());
            }
        };

        let msg = HostMessage::json(
            MessageType::Call,
            &CallRequest {
                id: call,
                request,
                timeout_ms: timeout.as_millis() as u64,
            },
        )
        .map_err(EngineError::from)?;
        self.send(&msg).await?;

        let deadline = deadline_after(timeout.saturating_add(REPLY_SLACK));
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let msg = match self.next(remaining).await {
                Ok(msg) => msg,
                Err(BridgeError::Timeout(_)) => {
                    // The host missed its own deadline, so its isolate is stuck.
                    self.kill_host().await;
                    return Err(BridgeError::Timeout(timeout));
                }
                Err(e) => return Err(e),
            };

            match msg.msg_type {
                MessageType::Result => {
                    let response: CallResponse = msg.parse_json().map_err(|e| {
                        BridgeError::Lifecycle(format!("malformed result frame: {}", e))
                    })?;
                    if response.id != call {
                        debug!(
                            "Discarding stale result {} while waiting for {}",
                            response.id, call
                        );
                        continue;
                    }
                    return Ok(response.outcome?);
                }
                MessageType::Error => return Err(engine_error(&msg).into()),
                other => {
                    return Err(BridgeError::Lifecycle(format!(
                        "unexpected {:?} from script host",
                        other
                    )));
                }
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn dispose(&mut self) -> Result<(), BridgeError> {
        let mut failure = None;

        if self.writer.is_some() && self.is_alive() {
            let _ = self.send(&HostMessage::empty(MessageType::Shutdown)).await;
        }
        self.writer = None;

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!("Script host for {} exited with status: {}", self.name, status);
                }
                Ok(Err(e)) => {
                    error!("Error waiting for script host of {}: {}", self.name, e);
                    failure = Some(BridgeError::Lifecycle(e.to_string()));
                }
                Err(_) => {
                    warn!("Script host for {} did not exit in time, killing", self.name);
                    if let Err(e) = child.kill().await {
                        failure = Some(BridgeError::Lifecycle(format!("kill failed: {}", e)));
                    }
                }
            }
        }

        if let Some(handle) = self.reader_handle.take() {
            handle.abort();
        }

        if let Some(file) = self.module_file.take() {
            if let Err(e) = file.close() {
                error!("Cannot remove module file for {}: {}", self.name, e);
                failure.get_or_insert(BridgeError::Lifecycle(e.to_string()));
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
