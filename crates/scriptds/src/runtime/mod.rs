//! Script execution environments.
//!
//! An environment hosts exactly one script module for one datasource
//! instance. Two strategies exist behind the [`Environment`] trait:
//!
//! - [`InProcessEnvironment`]: a V8 isolate on a dedicated worker thread
//! - [`SubprocessEnvironment`]: a `scriptds-host` child process driven over
//!   its stdin/stdout

mod embedded;
mod process;
mod supervisor;

use std::time::Duration;

use async_trait::async_trait;
use scriptds_runtime::CallId;
use tracing::debug;

use crate::config::{RuntimeSettings, Strategy};
use crate::error::BridgeError;

pub use embedded::InProcessEnvironment;
pub use process::SubprocessEnvironment;
pub use supervisor::{RestartPolicy, Supervisor};

/// The capability set the invocation bridge needs from an environment.
///
/// Implementations are not safe for concurrent use; callers serialize access.
#[async_trait]
pub trait Environment: Send {
    /// Evaluate the module body. Allowed once per environment.
    async fn load(&mut self, body: &str, settle: Duration) -> Result<(), BridgeError>;

    /// Locate the entry function by name.
    async fn resolve_entry(&mut self, name: &str) -> Result<(), BridgeError>;

    /// Start a call of the entry function with one string argument.
    async fn call(&mut self, entry: &str, request: String) -> Result<CallId, BridgeError>;

    /// Wait for a started call to settle.
    async fn await_result(&mut self, call: CallId, timeout: Duration)
    -> Result<String, BridgeError>;

    /// Whether the underlying thread or process is still running.
    fn is_alive(&mut self) -> bool;

    /// Release every resource. Safe to call more than once.
    async fn dispose(&mut self) -> Result<(), BridgeError>;
}

/// Create a fully initialized environment of the configured strategy.
pub async fn create(
    name: &str,
    settings: &RuntimeSettings,
) -> Result<Box<dyn Environment>, BridgeError> {
    debug!("Creating {:?} environment for {}", settings.strategy, name);
    let env: Box<dyn Environment> = match settings.strategy {
        Strategy::InProcess => {
            Box::new(InProcessEnvironment::start(name, settings.startup_timeout()).await?)
        }
        Strategy::Subprocess => Box::new(
            SubprocessEnvironment::start(
                name,
                settings.host_binary.as_deref(),
                settings.startup_timeout(),
            )
            .await?,
        ),
    };
    Ok(env)
}
