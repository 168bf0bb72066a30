//! Decoding of module output into typed frames.
//!
//! The module returns `{"data":[{"refId", "fields":[{"name","type","values"}]}]}`.
//! Failures are isolated: a broken frame becomes an error entry for its own
//! RefID and never affects the others. The decoder never fails as a whole.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::DecodeError;
use crate::frame::{Field, FieldValues, Frame};
use crate::host::{DataResponse, QueryDataResponse, Status};

/// Key of the synthetic entry produced when the result is not valid JSON.
pub const PARSE_FAILURE_REF_ID: &str = "A";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(default)]
    ref_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    fields: Option<Vec<RawField>>,
    #[serde(default)]
    length: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawField {
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    field_type: String,
    #[serde(default)]
    values: Option<Vec<Value>>,
}

/// Decode a module result into responses keyed by RefID.
///
/// Once a RefID has an error entry it keeps it; later frames for the same
/// RefID are ignored.
pub fn decode(raw: &str) -> QueryDataResponse {
    let mut response = QueryDataResponse::new();

    let frames = match parse_frames(raw) {
        Ok(frames) => frames,
        Err(reason) => {
            response.insert(
                PARSE_FAILURE_REF_ID,
                DataResponse::error(format!("json unmarshal: {}", reason), Status::BadRequest),
            );
            return response;
        }
    };

    for value in frames {
        let ref_id = value
            .get("refId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let decoded = serde_json::from_value::<RawFrame>(value)
            .map_err(|e| e.to_string())
            .and_then(|raw_frame| decode_frame(raw_frame).map_err(|e| e.to_string()));

        if response.get(&ref_id).is_some_and(DataResponse::is_error) {
            debug!("Ignoring frame for '{}' after an earlier failure", ref_id);
            continue;
        }
        match decoded {
            Ok(frame) => match response.responses.get_mut(&ref_id) {
                Some(existing) => existing.frames.push(frame),
                None => response.insert(ref_id, DataResponse::frames(vec![frame])),
            },
            Err(e) => {
                debug!("Frame '{}' failed to decode: {}", ref_id, e);
                response.insert(ref_id, DataResponse::error(e, Status::BadRequest));
            }
        }
    }

    response
}

/// Split the result into its frames; `null` data means no frames.
fn parse_frames(raw: &str) -> Result<Vec<Value>, String> {
    let parsed: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    let Value::Object(mut top) = parsed else {
        return Err("result is not a JSON object".into());
    };
    match top.remove("data") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(frames)) => Ok(frames),
        Some(_) => Err("\"data\" is not an array".into()),
    }
}

fn decode_frame(raw: RawFrame) -> Result<Frame, DecodeError> {
    let raw_fields = raw.fields.unwrap_or_default();
    let mut fields = Vec::with_capacity(raw_fields.len());
    for raw_field in raw_fields {
        if let Some(field) = decode_field(raw_field)? {
            fields.push(field);
        }
    }

    let expected = raw.length.or_else(|| fields.first().map(Field::len));
    if let Some(expected) = expected {
        if let Some(bad) = fields.iter().find(|f| f.len() != expected) {
            return Err(DecodeError::LengthMismatch {
                field: bad.name.clone(),
                expected,
                found: bad.len(),
            });
        }
    }

    Ok(Frame {
        name: raw.name.unwrap_or_else(|| raw.ref_id.clone()),
        ref_id: raw.ref_id,
        fields,
    })
}

/// `None` means the field has an unrecognized type and is dropped.
fn decode_field(raw: RawField) -> Result<Option<Field>, DecodeError> {
    let RawField {
        name,
        field_type,
        values,
    } = raw;
    let values = values.unwrap_or_default();

    let values = match field_type.as_str() {
        "time" => FieldValues::Time(decode_times(&name, &values)),
        "number" => FieldValues::Number(collect(&name, &values, "number", Value::as_f64)?),
        "string" => FieldValues::String(collect(&name, &values, "string", |v| {
            v.as_str().map(str::to_string)
        })?),
        "boolean" => FieldValues::Boolean(collect(&name, &values, "boolean", Value::as_bool)?),
        other => {
            warn!(field = %name, field_type = %other, "Dropping field with unrecognized type");
            return Ok(None);
        }
    };

    Ok(Some(Field::new(name, values)))
}

fn collect<T>(
    field: &str,
    values: &[Value],
    expected: &'static str,
    extract: impl Fn(&Value) -> Option<T>,
) -> Result<Vec<T>, DecodeError> {
    values
        .iter()
        .enumerate()
        .map(|(index, v)| {
            extract(v).ok_or_else(|| DecodeError::FieldType {
                field: field.to_string(),
                index,
                expected,
            })
        })
        .collect()
}

/// Unparseable or non-string entries become the Unix epoch.
fn decode_times(field: &str, values: &[Value]) -> Vec<DateTime<Utc>> {
    let mut lossy = 0usize;
    let times = values
        .iter()
        .map(|v| {
            v.as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|| {
                    lossy += 1;
                    DateTime::UNIX_EPOCH
                })
        })
        .collect();

    if lossy > 0 {
        warn!(field = %field, count = lossy, "Time values replaced with the epoch");
    }
    times
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SCENARIO: &str = r#"{"data":[{"refId":"A","fields":[
        {"name":"time","type":"time","values":["2024-01-01T00:00:00Z"]},
        {"name":"value","type":"number","values":[1]}
    ],"length":1}]}"#;

    fn frame(response: &QueryDataResponse, ref_id: &str) -> Frame {
        let entry = response.get(ref_id).unwrap();
        assert!(!entry.is_error(), "unexpected error: {:?}", entry.error);
        entry.frames[0].clone()
    }

    #[test]
    fn test_scenario_frame() {
        let response = decode(SCENARIO);
        assert_eq!(response.len(), 1);

        let frame = frame(&response, "A");
        assert_eq!(frame.name, "A");
        assert_eq!(frame.fields.len(), 2);
        assert_eq!(frame.len(), 1);
        assert_eq!(
            frame.fields[0].values,
            FieldValues::Time(vec![Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()])
        );
        assert_eq!(frame.fields[1].values, FieldValues::Number(vec![1.0]));
    }

    #[test]
    fn test_one_key_per_ref_id() {
        let response = decode(
            r#"{"data":[
                {"refId":"A","fields":[{"name":"s","type":"string","values":["x"]}]},
                {"refId":"B","fields":[{"name":"b","type":"boolean","values":[true]}]},
                {"refId":"C","fields":[]}
            ]}"#,
        );
        assert_eq!(response.len(), 3);
        assert_eq!(
            frame(&response, "B").fields[0].values,
            FieldValues::Boolean(vec![true])
        );
        assert!(frame(&response, "C").is_empty());
    }

    #[test]
    fn test_invalid_json_gives_single_bad_request() {
        let response = decode("{not json");
        assert_eq!(response.len(), 1);
        let entry = response.get(PARSE_FAILURE_REF_ID).unwrap();
        assert_eq!(entry.status, Status::BadRequest);
        assert!(entry.error.as_deref().unwrap().starts_with("json unmarshal"));
    }

    #[test]
    fn test_number_type_error_is_isolated() {
        let response = decode(
            r#"{"data":[
                {"refId":"A","fields":[{"name":"n","type":"number","values":[1,"two"]}]},
                {"refId":"B","fields":[{"name":"n","type":"number","values":[3]}]}
            ]}"#,
        );
        let a = response.get("A").unwrap();
        assert_eq!(a.status, Status::BadRequest);
        assert!(a.error.as_deref().unwrap().contains("value 1 is not a number"));

        assert_eq!(frame(&response, "B").fields[0].values, FieldValues::Number(vec![3.0]));
    }

    #[test]
    fn test_string_and_boolean_mismatch() {
        let response = decode(
            r#"{"data":[
                {"refId":"S","fields":[{"name":"s","type":"string","values":[1]}]},
                {"refId":"B","fields":[{"name":"b","type":"boolean","values":["yes"]}]}
            ]}"#,
        );
        assert!(response.get("S").unwrap().is_error());
        assert!(response.get("B").unwrap().is_error());
    }

    #[test]
    fn test_unequal_field_lengths() {
        let response = decode(
            r#"{"data":[{"refId":"A","fields":[
                {"name":"a","type":"number","values":[1,2]},
                {"name":"b","type":"number","values":[1]}
            ]}]}"#,
        );
        let entry = response.get("A").unwrap();
        assert_eq!(entry.status, Status::BadRequest);
        assert!(entry.error.as_deref().unwrap().contains("'b' has 1 values, expected 2"));

        let response = decode(
            r#"{"data":[{"refId":"A","length":3,"fields":[{"name":"a","type":"number","values":[1]}]}]}"#,
        );
        assert!(response.get("A").unwrap().is_error());
    }

    #[test]
    fn test_lossy_times() {
        let response = decode(
            r#"{"data":[{"refId":"A","fields":[
                {"name":"t","type":"time","values":["garbage", 1700000000000, "2024-01-01T02:00:00+02:00"]}
            ]}]}"#,
        );
        assert_eq!(
            frame(&response, "A").fields[0].values,
            FieldValues::Time(vec![
                DateTime::UNIX_EPOCH,
                DateTime::UNIX_EPOCH,
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            ])
        );
    }

    #[test]
    fn test_unknown_field_type_is_dropped() {
        let response = decode(
            r#"{"data":[{"refId":"A","fields":[
                {"name":"v","type":"number","values":[1]},
                {"name":"o","type":"other","values":[{"x":1}, null]}
            ]}]}"#,
        );
        let frame = frame(&response, "A");
        assert_eq!(frame.fields.len(), 1);
        assert_eq!(frame.fields[0].name, "v");
    }

    #[test]
    fn test_repeated_ref_id_collects_frames() {
        let response = decode(
            r#"{"data":[
                {"refId":"A","name":"first","fields":[]},
                {"refId":"A","name":"second","fields":[]}
            ]}"#,
        );
        let entry = response.get("A").unwrap();
        assert_eq!(entry.frames.len(), 2);
        assert_eq!(entry.frames[1].name, "second");
    }

    #[test]
    fn test_malformed_frame_leaves_others_intact() {
        let response = decode(
            r#"{"data":[
                {"refId":"B","fields":[{"name":"v","type":"number","values":[7]}]},
                {"refId":"C","fields":[{"name":"v","type":"number","values":"x"}]},
                {"refId":"D","fields":[{"name":"v","type":"number","values":null}]},
                {"refId":"E","fields":null}
            ]}"#,
        );
        assert_eq!(response.len(), 4);
        assert!(response.get(PARSE_FAILURE_REF_ID).is_none());
        assert_eq!(frame(&response, "B").fields[0].values, FieldValues::Number(vec![7.0]));

        let c = response.get("C").unwrap();
        assert_eq!(c.status, Status::BadRequest);

        assert_eq!(frame(&response, "D").fields[0].values, FieldValues::Number(vec![]));
        assert!(frame(&response, "E").fields.is_empty());
    }

    #[test]
    fn test_null_or_missing_data_is_empty() {
        assert!(decode(r#"{"data":null}"#).is_empty());
        assert!(decode(r#"{}"#).is_empty());

        for input in [r#"{"data":"x"}"#, "[]", "\"text\""] {
            let response = decode(input);
            assert_eq!(response.len(), 1);
            assert_eq!(response.get(PARSE_FAILURE_REF_ID).unwrap().status, Status::BadRequest);
        }
    }

    #[test]
    fn test_error_for_ref_id_is_kept() {
        let response = decode(
            r#"{"data":[
                {"refId":"A","fields":[{"name":"n","type":"number","values":["bad"]}]},
                {"refId":"A","fields":[{"name":"n","type":"number","values":[1]}]}
            ]}"#,
        );
        let entry = response.get("A").unwrap();
        assert!(entry.is_error());
        assert!(entry.frames.is_empty());
    }

    #[test]
    fn test_decode_is_idempotent() {
        for input in [SCENARIO, "{not json", r#"{"data":[]}"#, r#"{}"#] {
            assert_eq!(decode(input), decode(input));
        }
        assert!(decode(r#"{"data":[]}"#).is_empty());
    }
}
