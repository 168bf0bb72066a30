//! Host adapter: the query and health entry points of one datasource
//! instance.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::config::{load_plugin_settings, PluginSettings};
use crate::decode::decode;
use crate::error::{BridgeError, ConfigError};
use crate::host::{
    CheckHealthRequest, CheckHealthResult, DataResponse, DataSourceIdentity,
    DataSourceInstanceSettings, QueryDataRequest, QueryDataResponse, Status,
};
use crate::request::{translate, RequestContext};

/// Entry for a RefID the module did not answer.
const UNANSWERED: &str = "no frame returned for this query";

pub struct Datasource {
    instance: DataSourceInstanceSettings,
    /// Options from `jsonData`, or why they could not be read.
    config: Result<PluginSettings, ConfigError>,
    bridge: Option<Bridge>,
}

impl Datasource {
    /// Build an instance and its environment.
    ///
    /// Unreadable settings do not fail construction: queries then answer
    /// with bad-request entries and the health check reports the problem.
    pub async fn new(
        instance: DataSourceInstanceSettings,
        module: Arc<str>,
    ) -> Result<Self, BridgeError> {
        let config = load_plugin_settings(&instance);
        let bridge = match &config {
            Ok(settings) => {
                let name = if instance.name.is_empty() {
                    instance.uid.clone()
                } else {
                    instance.name.clone()
                };
                Some(Bridge::new(name, module, settings.runtime.clone()).await?)
            }
            Err(e) => {
                warn!("Datasource {} has invalid settings: {}", instance.uid, e);
                None
            }
        };

        info!("Created datasource instance {}", instance.uid);
        Ok(Self {
            instance,
            config,
            bridge,
        })
    }

    pub fn settings(&self) -> &DataSourceInstanceSettings {
        &self.instance
    }

    /// Answer a batch of queries.
    ///
    /// Every RefID of the batch gets an entry. Only the first query is sent
    /// to the module. Instance-level failures return `Err`.
    pub async fn query_data(
        &self,
        req: &QueryDataRequest,
    ) -> Result<QueryDataResponse, BridgeError> {
        let mut response = QueryDataResponse::new();
        for query in &req.queries {
            response.insert(
                query.ref_id.clone(),
                DataResponse::error(UNANSWERED, Status::Internal),
            );
        }
        let Some(first) = req.queries.first() else {
            return Ok(response);
        };
        if req.queries.len() > 1 {
            debug!(
                "Only the first of {} queries is sent to the module",
                req.queries.len()
            );
        }

        let (settings, bridge) = match (&self.config, &self.bridge) {
            (Ok(settings), Some(bridge)) => (settings, bridge),
            (Err(e), _) => {
                fail_all(&mut response, &BridgeError::from(e.clone()));
                return Ok(response);
            }
            (Ok(_), None) => {
                return Err(BridgeError::Lifecycle("datasource has no environment".into()));
            }
        };

        let identity = req
            .plugin_context
            .datasource_instance_settings
            .as_ref()
            .map(DataSourceIdentity::from)
            .unwrap_or_else(|| DataSourceIdentity::from(&self.instance));
        let ctx = RequestContext {
            app: settings.runtime.app.clone(),
            request_id: uuid::Uuid::new_v4().to_string(),
            timezone: settings.runtime.timezone.clone(),
            default_interval_ms: settings.runtime.default_interval_ms,
        };
        let request = translate(first, &first.time_range, &identity, &ctx);
        debug!("Invoking module for request {}", request.request_id);

        let deadline = req.timeout_ms.map(Duration::from_millis);
        match bridge.invoke(&request, deadline).await {
            Ok(raw) => {
                response.responses.extend(decode(&raw).responses);
                Ok(response)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Query {} failed: {}", request.request_id, e);
                fail_all(&mut response, &e);
                Ok(response)
            }
        }
    }

    /// Report whether the datasource is usable.
    pub async fn check_health(&self, req: &CheckHealthRequest) -> CheckHealthResult {
        let instance = req
            .plugin_context
            .datasource_instance_settings
            .as_ref()
            .unwrap_or(&self.instance);

        let settings = match load_plugin_settings(instance) {
            Ok(settings) => settings,
            Err(e) => {
                debug!("Health check: {}", e);
                return CheckHealthResult::error("Unable to load settings");
            }
        };
        if settings.secrets.api_key.is_empty() {
            return CheckHealthResult::error("API key is missing");
        }

        if let Some(bridge) = &self.bridge {
            if let Some(failure) = bridge.failure().await {
                return CheckHealthResult::error(failure.to_string());
            }
        }
        CheckHealthResult::ok("Data source is working")
    }

    /// Release the environment. Later queries fail with a lifecycle error.
    pub async fn dispose(&self) -> Result<(), BridgeError> {
        info!("Disposing datasource instance {}", self.instance.uid);
        match &self.bridge {
            Some(bridge) => bridge.dispose().await,
            None => Ok(()),
        }
    }
}

fn fail_all(response: &mut QueryDataResponse, e: &BridgeError) {
    let status = e.status();
    for entry in response.responses.values_mut() {
        *entry = DataResponse::error(e.to_string(), status);
    }
}
