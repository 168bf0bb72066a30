//! scriptds CLI
//!
//! Runs host queries and health checks against a script module outside the
//! query host, using a TOML file for the datasource settings.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use scriptds::config::load_settings_file;
use scriptds::host::{CheckHealthRequest, PluginContext, QueryDataRequest};
use scriptds::{load_plugin_settings, ConfigError, InstanceManager};

/// Script-module query datasource
#[derive(Parser, Debug)]
#[command(name = "scriptds")]
#[command(about = "Run queries through a JavaScript datasource module", long_about = None)]
struct Args {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one query request and print the typed response
    Query {
        /// Datasource settings (TOML)
        #[arg(short, long)]
        settings: PathBuf,

        /// Script module; defaults to `jsonData.path` from the settings
        #[arg(short, long)]
        module: Option<PathBuf>,

        /// Query request JSON; read from stdin when omitted
        #[arg(short, long)]
        request: Option<String>,
    },
    /// Check the datasource health
    Health {
        /// Datasource settings (TOML)
        #[arg(short, long)]
        settings: PathBuf,

        /// Script module; defaults to `jsonData.path` from the settings
        #[arg(short, long)]
        module: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    // V8 must be initialized before the tokio runtime starts any isolate.
    scriptds_runtime::init_platform();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(args.command))
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scriptds=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Query {
            settings,
            module,
            request,
        } => {
            let instance = load_settings_file(&settings)?;
            let module = read_module(&settings, module.as_deref(), &instance)?;
            let request = match request {
                Some(text) => text,
                None => {
                    let mut text = String::new();
                    std::io::stdin()
                        .read_to_string(&mut text)
                        .context("reading request from stdin")?;
                    text
                }
            };
            let mut request: QueryDataRequest =
                serde_json::from_str(&request).context("parsing query request")?;
            request.plugin_context = PluginContext {
                datasource_instance_settings: Some(instance.clone()),
                ..request.plugin_context
            };

            let manager = InstanceManager::new(module);
            let datasource = manager.get(&instance).await?;
            let outcome = datasource.query_data(&request).await;
            manager.dispose_all().await?;

            let response = outcome?;
            info!("Query answered {} RefIDs", response.len());
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Health { settings, module } => {
            let instance = load_settings_file(&settings)?;
            let module = read_module(&settings, module.as_deref(), &instance)?;

            let manager = InstanceManager::new(module);
            let datasource = manager.get(&instance).await?;
            let health = datasource
                .check_health(&CheckHealthRequest {
                    plugin_context: PluginContext {
                        datasource_instance_settings: Some(instance),
                        ..Default::default()
                    },
                })
                .await;
            manager.dispose_all().await?;

            println!("{}", serde_json::to_string_pretty(&health)?);
        }
    }
    Ok(())
}

/// Module body from `--module`, else from `jsonData.path` relative to the
/// settings file.
fn read_module(
    settings_path: &Path,
    module: Option<&Path>,
    instance: &scriptds::host::DataSourceInstanceSettings,
) -> Result<String> {
    let path = match module {
        Some(path) => path.to_path_buf(),
        None => {
            let configured = load_plugin_settings(instance)
                .map(|s| s.path)
                .unwrap_or_default();
            if configured.is_empty() {
                return Err(ConfigError::MissingModule.into());
            }
            let base = settings_path.parent().unwrap_or_else(|| Path::new("."));
            base.join(configured)
        }
    };
    std::fs::read_to_string(&path).with_context(|| format!("reading module {}", path.display()))
}
