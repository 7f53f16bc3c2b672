//! Conversion between plain JSON documents and the store's typed field encoding.

use chrono::DateTime;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

use crate::store::StoreError;

/// Encodes a serializable record into a `fields` map.
pub fn to_fields<T: Serialize>(record: &T) -> Result<Map<String, Value>, StoreError> {
    match serde_json::to_value(record)? {
        Value::Object(object) => Ok(encode_map(&object)),
        other => Err(StoreError::Decode(format!("expected an object, got {other}"))),
    }
}

/// Decodes a `fields` map into a record.
pub fn from_fields<T: DeserializeOwned>(fields: &Map<String, Value>) -> Result<T, StoreError> {
    let plain = decode_map(fields)?;
    Ok(serde_json::from_value(Value::Object(plain))?)
}

pub fn encode_map(object: &Map<String, Value>) -> Map<String, Value> {
    object
        .iter()
        .map(|(key, value)| (key.clone(), encode_value(value)))
        .collect()
}

pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(flag) => json!({ "booleanValue": flag }),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                json!({ "integerValue": int.to_string() })
            } else if let Some(uint) = number.as_u64() {
                json!({ "integerValue": uint.to_string() })
            } else {
                json!({ "doubleValue": number.as_f64().unwrap_or_default() })
            }
        }
        Value::String(text) => json!({ "stringValue": text }),
        Value::Array(items) => {
            let values: Vec<Value> = items.iter().map(encode_value).collect();
            json!({ "arrayValue": { "values": values } })
        }
        Value::Object(object) => json!({ "mapValue": { "fields": encode_map(object) } }),
    }
}

pub fn decode_map(fields: &Map<String, Value>) -> Result<Map<String, Value>, StoreError> {
    fields
        .iter()
        .map(|(key, value)| decode_value(value).map(|decoded| (key.clone(), decoded)))
        .collect()
}

pub fn decode_value(value: &Value) -> Result<Value, StoreError> {
    let Some(object) = value.as_object() else {
        return Err(StoreError::Decode(format!("typed value must be an object: {value}")));
    };
    let Some((kind, inner)) = object.iter().next() else {
        return Err(StoreError::Decode("empty typed value".to_string()));
    };
    match kind.as_str() {
        "nullValue" => Ok(Value::Null),
        "booleanValue" => Ok(Value::Bool(inner.as_bool().unwrap_or(false))),
        "integerValue" => {
            let parsed = match inner {
                Value::String(text) => text.parse::<i64>().ok(),
                Value::Number(number) => number.as_i64(),
                _ => None,
            };
            parsed
                .map(Value::from)
                .ok_or_else(|| StoreError::Decode(format!("bad integerValue {inner}")))
        }
        "doubleValue" => Ok(decode_double(inner)),
        "timestampValue" => {
            let text = inner.as_str().unwrap_or_default();
            DateTime::parse_from_rfc3339(text)
                .map(|timestamp| Value::from(timestamp.timestamp_millis()))
                .map_err(|error| StoreError::Decode(format!("bad timestampValue {inner}: {error}")))
        }
        "stringValue" | "referenceValue" | "bytesValue" => Ok(inner.clone()),
        "geoPointValue" => Ok(json!({
            "latitude": inner.get("latitude").cloned().unwrap_or(json!(0.0)),
            "longitude": inner.get("longitude").cloned().unwrap_or(json!(0.0)),
        })),
        "arrayValue" => {
            let values = inner
                .get("values")
                .and_then(Value::as_array)
                .map(|values| values.iter().map(decode_value).collect::<Result<Vec<_>, _>>())
                .transpose()?
                .unwrap_or_default();
            Ok(Value::Array(values))
        }
        "mapValue" => {
            let fields = inner
                .get("fields")
                .and_then(Value::as_object)
                .map(decode_map)
                .transpose()?
                .unwrap_or_default();
            Ok(Value::Object(fields))
        }
        other => Err(StoreError::Decode(format!("unknown value type {other}"))),
    }
}

/// Whole numbers written as doubles come back as integers.
fn decode_double(inner: &Value) -> Value {
    match inner.as_f64() {
        Some(number) if number.fract() == 0.0 && number.abs() < i64::MAX as f64 => Value::from(number as i64),
        _ => inner.clone(),
    }
}

/// Rejects ids that would address a different document once joined into a path.
pub fn check_document_id(id: &str) -> Result<&str, StoreError> {
    let reserved = id.len() > 4 && id.starts_with("__") && id.ends_with("__");
    if id.is_empty() || id == "." || id == ".." || id.contains('/') || reserved {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(id)
}

/// Last path segment of a full document name.
pub fn document_id(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageRecord, ThreadRecord};

    #[test]
    fn decodes_a_thread_document() {
        let fields = json!({
            "name": { "stringValue": "Rust" },
            "latestMessage": {
                "mapValue": {
                    "fields": {
                        "text": { "stringValue": "Location Send" },
                        "createdAt": { "integerValue": "1697000000000" }
                    }
                }
            }
        });
        let record: ThreadRecord = from_fields(fields.as_object().expect("object")).expect("decode");
        assert_eq!(record.name.as_deref(), Some("Rust"));
        let latest = record.latest_message.expect("latest");
        assert_eq!(latest.created_at, Some(1_697_000_000_000));
        assert_eq!(latest.text.as_deref(), Some("Location Send"));
    }

    #[test]
    fn encodes_integers_as_strings_and_skips_missing_fields() {
        let record = MessageRecord {
            text: Some("hi".to_string()),
            created_at: Some(12),
            system: Some(true),
            ..MessageRecord::default()
        };
        let fields = to_fields(&record).expect("encode");
        assert_eq!(fields["createdAt"], json!({ "integerValue": "12" }));
        assert_eq!(fields["text"], json!({ "stringValue": "hi" }));
        assert_eq!(fields["system"], json!({ "booleanValue": true }));
        assert!(!fields.contains_key("image"));
    }

    #[test]
    fn decodes_nested_arrays_and_geo_points() {
        let value = json!({
            "arrayValue": {
                "values": [
                    { "geoPointValue": { "latitude": 1.5, "longitude": -2.0 } },
                    { "nullValue": null },
                    { "doubleValue": 0.25 }
                ]
            }
        });
        let decoded = decode_value(&value).expect("decode");
        assert_eq!(
            decoded,
            json!([{ "latitude": 1.5, "longitude": -2.0 }, null, 0.25])
        );
        assert_eq!(decode_value(&json!({ "arrayValue": {} })).expect("empty"), json!([]));
    }

    #[test]
    fn whole_doubles_and_timestamps_decode_to_millis() {
        let fields = json!({
            "latestMessage": {
                "mapValue": {
                    "fields": {
                        "text": { "stringValue": "hi" },
                        "createdAt": { "doubleValue": 1697000000000.0 }
                    }
                }
            }
        });
        let record: ThreadRecord = from_fields(fields.as_object().expect("object")).expect("double");
        assert_eq!(record.latest_message.expect("latest").created_at, Some(1_697_000_000_000));

        let fields = json!({
            "text": { "stringValue": "hi" },
            "createdAt": { "timestampValue": "2023-10-11T00:00:00Z" }
        });
        let record: MessageRecord = from_fields(fields.as_object().expect("object")).expect("timestamp");
        assert_eq!(record.created_at, Some(1_696_982_400_000));

        let fields = json!({
            "createdAt": { "timestampValue": "2023-10-11T00:00:00.250+02:00" }
        });
        let record: MessageRecord = from_fields(fields.as_object().expect("object")).expect("offset");
        assert_eq!(record.created_at, Some(1_696_975_200_250));

        assert_eq!(decode_value(&json!({ "doubleValue": 0.25 })).expect("fraction"), json!(0.25));
        assert!(decode_value(&json!({ "timestampValue": "yesterday" })).is_err());
    }

    #[test]
    fn document_ids_must_be_single_segments() {
        assert_eq!(check_document_id("8Hq2fJ0cVx").expect("plain"), "8Hq2fJ0cVx");
        assert!(check_document_id("").is_err());
        assert!(check_document_id("..").is_err());
        assert!(check_document_id("t1/MESSAGES/m1").is_err());
        assert!(check_document_id("__name__").is_err());
    }

    #[test]
    fn rejects_unknown_types() {
        assert!(decode_value(&json!({ "mysteryValue": 1 })).is_err());
        assert!(decode_value(&json!("raw")).is_err());
    }

    #[test]
    fn document_id_is_last_segment() {
        assert_eq!(
            document_id("projects/p/databases/(default)/documents/THREADS/abc"),
            "abc"
        );
        assert_eq!(document_id("abc"), "abc");
    }
}
