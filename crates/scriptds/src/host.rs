//! Types exchanged with the query-execution host.
//!
//! These mirror the host's plugin contract: a query request carries the
//! datasource instance settings and a batch of queries; the response maps
//! every query's RefID to its frames or an error.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::frame::Frame;

/// Settings of one configured datasource instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceInstanceSettings {
    pub uid: String,
    #[serde(rename = "type", default)]
    pub ds_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    /// Free-form plugin options.
    #[serde(default)]
    pub json_data: serde_json::Value,
    /// Secrets, already decrypted by the host.
    #[serde(default)]
    pub decrypted_secure_json_data: HashMap<String, String>,
    /// Last modification; a new value means the instance must be rebuilt.
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
}

/// Identity of the datasource a query targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceIdentity {
    #[serde(rename = "type")]
    pub ds_type: String,
    pub uid: String,
}

impl From<&DataSourceInstanceSettings> for DataSourceIdentity {
    fn from(settings: &DataSourceInstanceSettings) -> Self {
        Self {
            ds_type: settings.ds_type.clone(),
            uid: settings.uid.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginContext {
    #[serde(default)]
    pub org_id: i64,
    #[serde(default)]
    pub plugin_id: String,
    #[serde(default)]
    pub datasource_instance_settings: Option<DataSourceInstanceSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// One query of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQuery {
    pub ref_id: String,
    #[serde(default)]
    pub query_type: String,
    #[serde(default)]
    pub max_data_points: i64,
    /// Suggested sampling interval; zero means "use the configured default".
    #[serde(default)]
    pub interval_ms: u64,
    pub time_range: TimeRange,
    /// Query options as saved by the query editor.
    #[serde(default)]
    pub json: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDataRequest {
    #[serde(default)]
    pub plugin_context: PluginContext,
    #[serde(default)]
    pub queries: Vec<DataQuery>,
    /// Caller deadline; the tighter of this and the configured timeout wins.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Classification attached to a per-query error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    BadRequest,
    Internal,
    Timeout,
}

impl Status {
    /// HTTP-style code the host reports.
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Internal => 500,
            Status::Timeout => 504,
        }
    }
}

/// Result for a single RefID: frames, or an error with its status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataResponse {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub frames: Vec<Frame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: Status,
}

impl DataResponse {
    pub fn frames(frames: Vec<Frame>) -> Self {
        Self {
            frames,
            error: None,
            status: Status::Ok,
        }
    }

    pub fn error(message: impl Into<String>, status: Status) -> Self {
        Self {
            frames: Vec::new(),
            error: Some(message.into()),
            status,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Responses keyed by RefID.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryDataResponse {
    pub responses: BTreeMap<String, DataResponse>,
}

impl QueryDataResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ref_id: impl Into<String>, response: DataResponse) {
        self.responses.insert(ref_id.into(), response);
    }

    pub fn get(&self, ref_id: &str) -> Option<&DataResponse> {
        self.responses.get(ref_id)
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckHealthRequest {
    #[serde(default)]
    pub plugin_context: PluginContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckHealthResult {
    pub status: HealthStatus,
    pub message: String,
}

impl CheckHealthResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Ok,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Error,
            message: message.into(),
        }
    }
}
