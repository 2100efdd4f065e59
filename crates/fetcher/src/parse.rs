//! Response body → [`ResultSet`].
//!
//! Sources wrap their records differently: CARTO returns `{"rows": [...]}`,
//! GeoJSON endpoints return `{"features": [...]}`, some APIs return a bare
//! array. The first array found under a well-known key wins; failing that, an
//! object with exactly one array-valued field uses that field.

use digest_common::error::DigestError;
use digest_common::types::{Record, ResultSet};
use digest_common::value::Value;

/// Keys searched, in order, for the record list.
const RECORD_KEYS: &[&str] = &["rows", "features", "results", "data", "items", "records"];

/// Name given to a result set parsed from a top-level array.
const DEFAULT_NAME: &str = "rows";

/// Parse a raw response body.
pub fn parse_body(body: &[u8]) -> Result<ResultSet, DigestError> {
    let json: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| DigestError::Parse(format!("response is not valid JSON: {}", e)))?;
    result_set_from_json(json)
}

/// Extract the record list from an already-decoded JSON document.
pub fn result_set_from_json(json: serde_json::Value) -> Result<ResultSet, DigestError> {
    let (name, items) = match json {
        serde_json::Value::Array(items) => (DEFAULT_NAME.to_string(), items),
        serde_json::Value::Object(mut object) => {
            let key = RECORD_KEYS
                .iter()
                .find(|k| object.get(**k).is_some_and(|v| v.is_array()))
                .map(|k| k.to_string())
                .or_else(|| {
                    let mut arrays = object
                        .iter()
                        .filter(|(_, v)| v.is_array())
                        .map(|(k, _)| k.clone());
                    match (arrays.next(), arrays.next()) {
                        (Some(only), None) => Some(only),
                        _ => None,
                    }
                })
                .ok_or_else(|| {
                    DigestError::Parse(
                        "response object has no unambiguous record list".to_string(),
                    )
                })?;

            match object.remove(&key) {
                Some(serde_json::Value::Array(items)) => (key, items),
                _ => {
                    return Err(DigestError::Parse(format!(
                        "record list '{}' is not an array",
                        key
                    )));
                }
            }
        }
        other => {
            return Err(DigestError::Parse(format!(
                "expected a JSON object or array, got {}",
                json_kind(&other)
            )));
        }
    };

    let records = items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match Value::from(item) {
            Value::Mapping(map) => Ok(map),
            other => Err(DigestError::Parse(format!(
                "record {} in '{}' is not an object: {}",
                i, name, other
            ))),
        })
        .collect::<Result<Vec<Record>, _>>()?;

    Ok(ResultSet::new(name, records))
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_carto_response() {
        let body = json!({
            "rows": [
                {"cartodb_id": 1, "text_general_code": "Thefts", "location_block": null},
                {"cartodb_id": 2, "text_general_code": "Burglary Residential", "location_block": "5200 BLOCK BALTIMORE AVE"}
            ],
            "time": 0.012,
            "fields": {"cartodb_id": {"type": "number"}},
            "total_rows": 2
        });
        let rs = result_set_from_json(body).unwrap();
        assert_eq!(rs.name, "rows");
        assert_eq!(rs.len(), 2);
        assert_eq!(rs.records[0].get("location_block"), Some(&Value::Absent));
        assert_eq!(
            rs.records[1].get("text_general_code"),
            Some(&Value::from("Burglary Residential"))
        );
    }

    #[test]
    fn test_top_level_array() {
        let rs = parse_body(br#"[{"id": 1}, {"id": 2}]"#).unwrap();
        assert_eq!(rs.name, "rows");
        assert_eq!(rs.len(), 2);
    }

    #[test]
    fn test_single_unknown_array_field() {
        let rs = result_set_from_json(json!({"incidents": [{"id": 1}], "count": 1})).unwrap();
        assert_eq!(rs.name, "incidents");
        assert_eq!(rs.len(), 1);
    }

    #[test]
    fn test_well_known_key_wins_over_other_arrays() {
        let rs = result_set_from_json(json!({"warnings": [], "features": [{"id": 1}]})).unwrap();
        assert_eq!(rs.name, "features");
    }

    #[test]
    fn test_empty_rows_is_valid() {
        let rs = result_set_from_json(json!({"rows": []})).unwrap();
        assert!(rs.is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_body(b"<html>"), Err(DigestError::Parse(_))));
        assert!(matches!(
            result_set_from_json(json!("just a string")),
            Err(DigestError::Parse(_))
        ));
        assert!(matches!(
            result_set_from_json(json!({"a": [], "b": []})),
            Err(DigestError::Parse(_))
        ));
        assert!(matches!(
            result_set_from_json(json!({"rows": [1, 2]})),
            Err(DigestError::Parse(_))
        ));
        assert!(matches!(
            result_set_from_json(json!({"error": "relation does not exist"})),
            Err(DigestError::Parse(_))
        ));
    }
}
