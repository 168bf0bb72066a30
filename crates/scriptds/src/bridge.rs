//! The invocation bridge.
//!
//! Owns one environment per datasource instance and drives the
//! load → resolve → call → await sequence through it. One invocation runs at
//! a time; the async mutex is fair, so invocations finish in the order they
//! were submitted. A dead environment is re-created lazily under the
//! supervisor's restart policy.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeSettings;
use crate::error::BridgeError;
use crate::request::CanonicalRequest;
use crate::runtime::{self, Environment, RestartPolicy, Supervisor};

struct BridgeState {
    env: Option<Box<dyn Environment>>,
    /// Module evaluated and entry point resolved in `env`.
    ready: bool,
    supervisor: Supervisor,
    /// Set once the instance can never serve a query again.
    failure: Option<BridgeError>,
    disposed: bool,
}

pub struct Bridge {
    name: String,
    module: Arc<str>,
    settings: RuntimeSettings,
    state: Mutex<BridgeState>,
}

impl Bridge {
    /// Create the bridge together with its environment.
    pub async fn new(
        name: impl Into<String>,
        module: Arc<str>,
        settings: RuntimeSettings,
    ) -> Result<Self, BridgeError> {
        let name = name.into();
        let env = runtime::create(&name, &settings).await?;

        let mut supervisor = Supervisor::new(RestartPolicy::from(settings.restart.clone()));
        supervisor.on_start();

        Ok(Self {
            name,
            module,
            settings,
            state: Mutex::new(BridgeState {
                env: Some(env),
                ready: false,
                supervisor,
                failure: None,
                disposed: false,
            }),
        })
    }

    /// Run one request through the module and return its raw text result.
    ///
    /// `deadline` tightens the configured query timeout.
    pub async fn invoke(
        &self,
        request: &CanonicalRequest,
        deadline: Option<Duration>,
    ) -> Result<String, BridgeError> {
        let payload = request
            .to_json()
            .map_err(|e| BridgeError::Configuration(format!("cannot serialize request: {}", e)))?;
        let timeout = match deadline {
            Some(d) => d.min(self.settings.query_timeout()),
            None => self.settings.query_timeout(),
        };

        let mut state = self.state.lock().await;
        if let Some(failure) = &state.failure {
            return Err(failure.clone());
        }
        if state.disposed {
            return Err(BridgeError::Lifecycle("datasource has been disposed".into()));
        }

        self.ensure_environment(&mut state).await?;
        if !state.ready {
            self.prepare(&mut state).await?;
        }

        let result = match state.env.as_mut() {
            Some(env) => {
                let entry = &self.settings.entry_point;
                match env.call(entry, payload).await {
                    Ok(call) => env.await_result(call, timeout).await,
                    Err(e) => Err(e),
                }
            }
            None => Err(BridgeError::Lifecycle("no environment".into())),
        };

        if let Err(e @ BridgeError::Lifecycle(_)) = &result {
            warn!("Environment for {} failed during a call: {}", self.name, e);
            self.discard_environment(&mut state).await;
        }
        result
    }

    /// Permanent failure, if the instance has one.
    pub async fn failure(&self) -> Option<BridgeError> {
        self.state.lock().await.failure.clone()
    }

    /// Tear down the environment. Later invocations fail with a lifecycle
    /// error.
    pub async fn dispose(&self) -> Result<(), BridgeError> {
        let mut state = self.state.lock().await;
        state.disposed = true;
        state.ready = false;
        match state.env.take() {
            Some(mut env) => {
                let result = env.dispose().await;
                if let Err(e) = &result {
                    error!("Failed to dispose environment for {}: {}", self.name, e);
                }
                info!("Disposed environment for {}", self.name);
                result
            }
            None => Ok(()),
        }
    }

    /// Re-create the environment if it is missing or dead.
    async fn ensure_environment(&self, state: &mut BridgeState) -> Result<(), BridgeError> {
        let alive = state.env.as_mut().is_some_and(|env| env.is_alive());
        if alive {
            return Ok(());
        }
        if state.env.is_some() {
            warn!("Environment for {} is no longer running", self.name);
            self.discard_environment(state).await;
        }

        let Some(delay) = state.supervisor.on_crash() else {
            let failure = BridgeError::Lifecycle(format!(
                "environment for {} keeps failing, restart budget exhausted",
                self.name
            ));
            error!("{}", failure);
            state.failure = Some(failure.clone());
            return Err(failure);
        };

        info!(
            "Restarting environment for {} in {:?} (attempt {})",
            self.name,
            delay,
            state.supervisor.restart_count()
        );
        tokio::time::sleep(delay).await;

        state.env = Some(runtime::create(&self.name, &self.settings).await?);
        state.ready = false;
        state.supervisor.on_start();
        Ok(())
    }

    /// Load the module and resolve its entry point. Failures that no retry
    /// can fix are recorded as permanent.
    async fn prepare(&self, state: &mut BridgeState) -> Result<(), BridgeError> {
        let Some(env) = state.env.as_mut() else {
            return Err(BridgeError::Lifecycle("no environment".into()));
        };

        let loaded = match env.load(&self.module, self.settings.settle()).await {
            Ok(()) => env.resolve_entry(&self.settings.entry_point).await,
            Err(e) => Err(e),
        };

        match loaded {
            Ok(()) => {
                debug!(
                    "Module for {} loaded, entry point '{}' resolved",
                    self.name, self.settings.entry_point
                );
                state.ready = true;
                Ok(())
            }
            Err(e) => {
                match &e {
                    BridgeError::Lifecycle(_) => self.discard_environment(state).await,
                    e if e.is_fatal() => {
                        error!("Module for {} is unusable: {}", self.name, e);
                        state.failure = Some(e.clone());
                    }
                    _ => {}
                }
                Err(e)
            }
        }
    }

    async fn discard_environment(&self, state: &mut BridgeState) {
        state.ready = false;
        if let Some(mut env) = state.env.take() {
            if let Err(e) = env.dispose().await {
                debug!("Dispose of dead environment for {} failed: {}", self.name, e);
            }
        }
    }
}
