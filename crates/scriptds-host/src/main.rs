//! Out-of-process interpreter for scriptds.
//!
//! Usage: `scriptds-host <module.js>`. The datasource spawns this binary,
//! waits for the `Ready` frame, then drives the module over stdin/stdout.

mod session;

use std::env;
use std::io;
use std::path::PathBuf;

use anyhow::Result;
use scriptds_runtime::ipc::{HostMessage, IpcReader, IpcWriter, MessageType};
use scriptds_runtime::ScriptEngine;
use tracing::{error, info};

fn main() -> Result<()> {
    // Initialize tracing to stderr (stdout is for IPC)
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("scriptds=info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        error!("Usage: scriptds-host <module.js>");
        std::process::exit(1);
    }
    let module_path = PathBuf::from(&args[1]);
    info!("Hosting module: {}", module_path.display());

    scriptds_runtime::init_platform();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        let mut engine = ScriptEngine::new("scriptds-host");
        let mut reader = IpcReader::new(tokio::io::stdin());
        let mut writer = IpcWriter::new(tokio::io::stdout());

        // Shims are installed; the parent may start sending commands.
        writer.send(&HostMessage::empty(MessageType::Ready)).await?;

        session::serve(&mut engine, &module_path, &mut reader, &mut writer).await
    })?;

    info!("Host exiting");
    Ok(())
}
