//! End-to-end queries through an in-process environment.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use scriptds::frame::FieldValues;
use scriptds::host::{
    DataQuery, DataSourceInstanceSettings, PluginContext, QueryDataRequest, Status, TimeRange,
};
use scriptds::host::DataSourceIdentity;
use scriptds::request::RequestContext;
use scriptds::{translate, BridgeError, Datasource, InstanceManager};
use tokio_test::assert_ok;

const TODOS: &str = include_str!("fixtures/todos.js");
const SCENARIO: &str = include_str!("fixtures/scenario.js");

fn settings(json_data: serde_json::Value) -> DataSourceInstanceSettings {
    DataSourceInstanceSettings {
        uid: "todos".into(),
        ds_type: "scriptds".into(),
        name: "Todos".into(),
        url: "https://example.invalid".into(),
        json_data,
        decrypted_secure_json_data: HashMap::from([("apiKey".to_string(), "k".to_string())]),
        ..Default::default()
    }
}

fn request(ref_ids: &[&str], query_text: &str, constant: &str) -> QueryDataRequest {
    QueryDataRequest {
        plugin_context: PluginContext {
            datasource_instance_settings: Some(settings(serde_json::Value::Null)),
            ..Default::default()
        },
        queries: ref_ids
            .iter()
            .map(|ref_id| DataQuery {
                ref_id: ref_id.to_string(),
                query_type: String::new(),
                max_data_points: 100,
                interval_ms: 0,
                time_range: TimeRange {
                    from: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                    to: Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap(),
                },
                json: serde_json::json!({"queryText": query_text, "constant": constant}),
            })
            .collect(),
        timeout_ms: None,
    }
}

#[tokio::test]
async fn test_scenario_select_one() {
    let ds = Datasource::new(settings(serde_json::Value::Null), Arc::from(SCENARIO))
        .await
        .unwrap();

    let response = ds.query_data(&request(&["A"], "select 1", "1")).await.unwrap();
    assert_eq!(response.len(), 1);

    let entry = response.get("A").unwrap();
    assert_eq!(entry.status, Status::Ok);
    let frame = &entry.frames[0];
    assert_eq!(frame.ref_id, "A");
    assert_eq!(frame.fields.len(), 2);
    assert_eq!(
        frame.fields[0].values,
        FieldValues::Time(vec![Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()])
    );
    assert_eq!(frame.fields[1].values, FieldValues::Number(vec![1.0]));
    assert_eq!(frame.fields[0].len(), frame.fields[1].len());

    assert_ok!(ds.dispose().await);
}

#[tokio::test]
async fn test_amd_plugin_module() {
    let ds = Datasource::new(settings(serde_json::Value::Null), Arc::from(TODOS))
        .await
        .unwrap();

    let response = ds.query_data(&request(&["A"], "todos", "")).await.unwrap();
    let frame = &response.get("A").unwrap().frames[0];
    assert_eq!(frame.len(), 3);
    assert_eq!(
        frame.field("completed").unwrap().values,
        FieldValues::Boolean(vec![false, true, false])
    );
    assert_eq!(
        frame.field("userId").unwrap().values,
        FieldValues::Number(vec![1.0, 1.0, 2.0])
    );

    assert_ok!(ds.dispose().await);
}

#[tokio::test]
async fn test_range_strings_survive_the_module() {
    let module = r#"
        globalThis.runQuery = (raw) => {
            const req = JSON.parse(raw);
            return JSON.stringify({ data: [{ refId: req.targets[0].refId, fields: [
                { name: "rawFrom", type: "string", values: [req.range.raw.from] },
                { name: "rawTo", type: "string", values: [req.range.raw.to] },
                { name: "from", type: "string", values: [req.range.from] },
            ] }] });
        };
    "#;
    let ds = Datasource::new(settings(serde_json::Value::Null), Arc::from(module))
        .await
        .unwrap();

    let mut req = request(&["A"], "", "");
    req.queries[0].time_range = TimeRange {
        from: Utc.timestamp_millis_opt(1_704_067_200_123).unwrap(),
        to: Utc.timestamp_millis_opt(1_704_070_800_999).unwrap(),
    };
    let query = &req.queries[0];
    let expected = translate(
        query,
        &query.time_range,
        &DataSourceIdentity {
            ds_type: "scriptds".into(),
            uid: "todos".into(),
        },
        &RequestContext {
            app: String::new(),
            request_id: String::new(),
            timezone: String::new(),
            default_interval_ms: 0,
        },
    );

    let response = ds.query_data(&req).await.unwrap();
    let frame = &response.get("A").unwrap().frames[0];
    assert_eq!(
        frame.fields[0].values,
        FieldValues::String(vec![expected.range.raw.from.clone()])
    );
    assert_eq!(
        frame.fields[1].values,
        FieldValues::String(vec![expected.range.raw.to.clone()])
    );
    assert_eq!(
        frame.fields[2].values,
        FieldValues::String(vec![expected.range.from.clone()])
    );
    assert_eq!(expected.range.raw.from, "2024-01-01T00:00:00Z");

    assert_ok!(ds.dispose().await);
}

#[tokio::test]
async fn test_custom_entry_point_and_timeout() {
    let module = r#"
        globalThis.handle = (raw) => new Promise((resolve) =>
            setTimeout(() => resolve(JSON.stringify({ data: [] })), 2000));
    "#;
    let ds = Datasource::new(
        settings(serde_json::json!({"runtime": {"entryPoint": "handle", "queryTimeoutMs": 50}})),
        Arc::from(module),
    )
    .await
    .unwrap();

    let response = ds.query_data(&request(&["A"], "", "")).await.unwrap();
    assert_eq!(response.get("A").unwrap().status, Status::Timeout);
    assert_ok!(ds.dispose().await);
}

#[tokio::test]
async fn test_broken_module_is_instance_failure() {
    let ds = Datasource::new(settings(serde_json::Value::Null), Arc::from("function ("))
        .await
        .unwrap();
    let err = ds.query_data(&request(&["A"], "", "")).await.unwrap_err();
    assert!(matches!(err, BridgeError::Invocation(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_manager_serves_concurrent_queries() {
    let manager = Arc::new(InstanceManager::new(SCENARIO));
    let instance = manager.get(&settings(serde_json::Value::Null)).await.unwrap();

    let tasks: Vec<_> = (0..5)
        .map(|i| {
            let instance = instance.clone();
            tokio::spawn(async move {
                let ref_id = format!("R{}", i);
                let response = instance
                    .query_data(&request(&[&ref_id], "q", &i.to_string()))
                    .await
                    .unwrap();
                (ref_id, response)
            })
        })
        .collect();

    for (i, task) in futures::future::join_all(tasks).await.into_iter().enumerate() {
        let (ref_id, response) = task.unwrap();
        let frame = &response.get(&ref_id).unwrap().frames[0];
        assert_eq!(frame.fields[1].values, FieldValues::Number(vec![i as f64]));
    }

    assert_ok!(manager.dispose_all().await);
}
