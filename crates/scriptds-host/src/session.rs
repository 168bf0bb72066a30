//! Message loop between the parent datasource and the hosted module.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use scriptds_runtime::ipc::{
    CallRequest, CallResponse, HostMessage, IpcReader, IpcWriter, LoadRequest, MessageType,
    ResolveRequest,
};
use scriptds_runtime::{EngineError, ScriptEngine};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Serve commands until the parent sends `Shutdown` or closes the channel.
pub async fn serve<R, W>(
    engine: &mut ScriptEngine,
    module_path: &Path,
    reader: &mut IpcReader<R>,
    writer: &mut IpcWriter<W>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(msg) = reader.recv().await? else {
            info!("Parent closed connection");
            return Ok(());
        };

        match msg.msg_type {
            MessageType::Load => {
                let settle = msg
                    .parse_json::<LoadRequest>()
                    .map(|req| Duration::from_millis(req.settle_ms))
                    .unwrap_or_default();
                let result = load_module(engine, module_path, settle).await;
                reply(writer, result.map(|_| HostMessage::empty(MessageType::Loaded))).await?;
            }
            MessageType::Resolve => {
                let result = msg
                    .parse_json::<ResolveRequest>()
                    .map_err(EngineError::from)
                    .and_then(|req| engine.resolve_entry(&req.name))
                    .map(|_| HostMessage::empty(MessageType::Resolved));
                reply(writer, result).await?;
            }
            MessageType::Call => match msg.parse_json::<CallRequest>() {
                Ok(req) => {
                    let outcome = call(engine, &req).await;
                    writer
                        .send_json(MessageType::Result, &CallResponse { id: req.id, outcome })
                        .await?;
                }
                Err(e) => reply(writer, Err(EngineError::from(e))).await?,
            },
            MessageType::Shutdown => {
                info!("Received Shutdown");
                return Ok(());
            }
            other => {
                warn!("Unexpected message type from parent: {:?}", other);
            }
        }
    }
}

async fn load_module(
    engine: &mut ScriptEngine,
    module_path: &Path,
    settle: Duration,
) -> Result<(), EngineError> {
    let body = tokio::fs::read_to_string(module_path).await.map_err(|e| {
        EngineError::Evaluation(format!("cannot read {}: {}", module_path.display(), e))
    })?;
    engine.load(&body, settle).await?;
    debug!("Module loaded from {}", module_path.display());
    Ok(())
}

async fn call(engine: &mut ScriptEngine, req: &CallRequest) -> Result<String, EngineError> {
    let entry = engine.entry().ok_or(EngineError::NotLoaded)?.to_string();
    let id = engine.call(&entry, &req.request)?;
    engine
        .await_result(id, Duration::from_millis(req.timeout_ms))
        .await
}

async fn reply<W: AsyncWrite + Unpin>(
    writer: &mut IpcWriter<W>,
    result: Result<HostMessage, EngineError>,
) -> Result<()> {
    match result {
        Ok(msg) => writer.send(&msg).await?,
        Err(e) => writer.send_json(MessageType::Error, &e).await?,
    }
    Ok(())
}
