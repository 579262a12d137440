// ABOUTME: OData payload shapes understood by the remote client
// ABOUTME: Extracts collection rows from v2 (`d.results`) and v4 (`value`) envelopes

use anyhow::{bail, Result};
use serde_json::Value;

use crate::mapper::Row;

pub const CSRF_HEADER: &str = "x-csrf-token";

/// Pull the entity rows out of a collection response body.
pub fn extract_rows(body: Value) -> Result<Vec<Row>> {
    let entries = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            if let Some(value) = map.remove("value") {
                into_array(value)?
            } else if let Some(d) = map.remove("d") {
                match d {
                    Value::Array(items) => items,
                    Value::Object(mut inner) => match inner.remove("results") {
                        Some(results) => into_array(results)?,
                        None => vec![Value::Object(inner)],
                    },
                    other => bail!("Unexpected OData 'd' payload: {}", other),
                }
            } else {
                bail!("OData response carries neither 'value' nor 'd'")
            }
        }
        other => bail!("Unexpected OData response body: {}", other),
    };

    entries
        .into_iter()
        .map(|entry| match entry {
            Value::Object(row) => Ok(row),
            other => bail!("OData entry is not an object: {}", other),
        })
        .collect()
}

fn into_array(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        other => bail!("Expected an array of entries, got {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_v4_value_array() {
        let rows = extract_rows(json!({"@odata.context": "x", "value": [{"a": 1}, {"a": 2}]})).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("a"), Some(&json!(2)));
    }

    #[test]
    fn test_v2_results() {
        let rows = extract_rows(json!({"d": {"results": [{"a": 1}], "__next": "..."}})).unwrap();
        assert_eq!(rows.len(), 1);
        let rows = extract_rows(json!({"d": [{"a": 1}, {"a": 3}]})).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_rejects_unknown_shapes() {
        assert!(extract_rows(json!({"items": []})).is_err());
        assert!(extract_rows(json!({"value": [1, 2]})).is_err());
    }
}
