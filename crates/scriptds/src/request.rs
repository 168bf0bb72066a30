//! Translation of host queries into the request record the script expects.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::host::{DataQuery, DataSourceIdentity, TimeRange};

/// Query options written by the query editor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct QueryModel {
    query_text: String,
    /// Usually a string; numbers are accepted too.
    constant: serde_json::Value,
}

/// Values of the request that do not come from the query itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub app: String,
    pub request_id: String,
    pub timezone: String,
    /// Used when the query carries no interval.
    pub default_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRange {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRange {
    pub from: String,
    pub to: String,
    pub raw: RawRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub constant: f64,
    pub datasource: DataSourceIdentity,
    pub query_text: String,
    pub ref_id: String,
}

/// The single argument handed to the module's entry function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalRequest {
    pub app: String,
    pub request_id: String,
    pub timezone: String,
    pub range: CanonicalRange,
    pub interval: String,
    pub interval_ms: u64,
    pub targets: Vec<Target>,
}

impl CanonicalRequest {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Build the canonical request for one host query.
///
/// Callers pass only the first query of a batch; later queries are not
/// merged into the request.
pub fn translate(
    query: &DataQuery,
    range: &TimeRange,
    identity: &DataSourceIdentity,
    ctx: &RequestContext,
) -> CanonicalRequest {
    let model: QueryModel = serde_json::from_value(query.json.clone()).unwrap_or_default();

    let from = format_time(&range.from);
    let to = format_time(&range.to);
    let interval_ms = if query.interval_ms > 0 {
        query.interval_ms
    } else {
        ctx.default_interval_ms
    };

    CanonicalRequest {
        app: ctx.app.clone(),
        request_id: ctx.request_id.clone(),
        timezone: ctx.timezone.clone(),
        range: CanonicalRange {
            raw: RawRange {
                from: from.clone(),
                to: to.clone(),
            },
            from,
            to,
        },
        interval: format_interval(interval_ms),
        interval_ms,
        targets: vec![Target {
            constant: parse_constant(&model.constant),
            datasource: identity.clone(),
            query_text: model.query_text,
            ref_id: query.ref_id.clone(),
        }],
    }
}

/// RFC 3339 with second precision and `Z` for UTC.
pub fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Render an interval the way dashboards show it, e.g. `30s`, `5m`, `1h`.
pub fn format_interval(ms: u64) -> String {
    const SECOND: u64 = 1_000;
    const MINUTE: u64 = 60 * SECOND;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;

    match ms {
        0 => "0ms".to_string(),
        ms if ms % DAY == 0 => format!("{}d", ms / DAY),
        ms if ms % HOUR == 0 => format!("{}h", ms / HOUR),
        ms if ms % MINUTE == 0 => format!("{}m", ms / MINUTE),
        ms if ms % SECOND == 0 => format!("{}s", ms / SECOND),
        ms => format!("{}ms", ms),
    }
}

/// Empty or malformed input yields `0`.
fn parse_constant(value: &serde_json::Value) -> f64 {
    match value {
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()).unwrap_or(0.0),
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}
