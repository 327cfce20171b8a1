//! Binding protocol-supplied parameter maps to classifier order.
//!
//! Named markers (`:x`, `@x`) are looked up with the sigil stripped and
//! bound positionally in the classifier's first-seen order, which matches
//! the indexes SQLite assigned during prepare. A `$`-leading first marker
//! switches to the exact positional protocol: values come from keys
//! `$1..$n` and are bound by index.

use std::collections::HashMap;

use serde_json::Value;

use quill_cdc::SqlValue;
use quill_sql::Statement;

use crate::EngineError;

/// Resolves a request's parameter map into bind arguments.
pub fn ordered_params(
    stmt: &Statement,
    params: &HashMap<String, Value>,
) -> Result<Vec<SqlValue>, EngineError> {
    let markers = stmt.parameters();
    if markers.is_empty() {
        return Ok(Vec::new());
    }

    if markers[0].starts_with('$') {
        let mut args = Vec::with_capacity(markers.len());
        for i in 1..=markers.len() {
            let key = format!("${i}");
            let value = params
                .get(&key)
                .ok_or_else(|| EngineError::Parameter(format!("missing parameter {key}")))?;
            args.push(json_to_sql(value)?);
        }
        return Ok(args);
    }

    let mut args = Vec::with_capacity(markers.len());
    let mut anonymous = 0usize;
    for marker in markers {
        let value = if marker == "?" {
            anonymous += 1;
            params
                .get(&format!("?{anonymous}"))
                .or_else(|| params.get(&anonymous.to_string()))
        } else {
            let bare = marker.trim_start_matches(&[':', '@', '$', '?'][..]);
            params.get(bare).or_else(|| params.get(marker.as_str()))
        };
        let value = value
            .ok_or_else(|| EngineError::Parameter(format!("missing value for parameter {marker}")))?;
        args.push(json_to_sql(value)?);
    }
    Ok(args)
}

fn json_to_sql(value: &Value) -> Result<SqlValue, EngineError> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(b) => Ok(SqlValue::Integer(*b as i64)),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real))
            .ok_or_else(|| EngineError::Parameter(format!("unrepresentable number {n}"))),
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        // Structured JSON values pass through as their textual form.
        Value::Array(_) | Value::Object(_) => Ok(SqlValue::Text(value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_sql::Classifier;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn named_parameters_bind_with_sigil_stripped() {
        let stmt = Classifier::new()
            .classify("SELECT * FROM users WHERE id = :id AND name = :name")
            .unwrap();
        let args = ordered_params(&stmt, &params(&[("id", json!(1)), ("name", json!("a"))])).unwrap();
        assert_eq!(args, [SqlValue::Integer(1), SqlValue::Text("a".into())]);
    }

    #[test]
    fn duplicate_named_parameter_binds_once() {
        let stmt = Classifier::new()
            .classify("SELECT * FROM users WHERE id = :x OR parent = :x")
            .unwrap();
        let args = ordered_params(&stmt, &params(&[("x", json!(5))])).unwrap();
        assert_eq!(args, [SqlValue::Integer(5)]);
    }

    #[test]
    fn dollar_markers_use_the_positional_protocol() {
        let stmt = Classifier::new()
            .classify("SELECT * FROM users WHERE name = $2 AND id = $1")
            .unwrap();
        let args =
            ordered_params(&stmt, &params(&[("$1", json!(7)), ("$2", json!("a"))])).unwrap();
        // Bound by index: slot 1 gets $1, slot 2 gets $2.
        assert_eq!(args, [SqlValue::Integer(7), SqlValue::Text("a".into())]);
    }

    #[test]
    fn missing_parameters_are_an_error() {
        let stmt = Classifier::new()
            .classify("SELECT * FROM users WHERE id = :id")
            .unwrap();
        assert!(matches!(
            ordered_params(&stmt, &HashMap::new()),
            Err(EngineError::Parameter(_))
        ));
    }

    #[test]
    fn json_values_map_to_sqlite_storage_classes() {
        let stmt = Classifier::new()
            .classify("SELECT * FROM t WHERE a = :a AND b = :b AND c = :c AND d = :d")
            .unwrap();
        let args = ordered_params(
            &stmt,
            &params(&[
                ("a", json!(null)),
                ("b", json!(1.5)),
                ("c", json!(true)),
                ("d", json!({"k": 1})),
            ]),
        )
        .unwrap();
        assert_eq!(
            args,
            [
                SqlValue::Null,
                SqlValue::Real(1.5),
                SqlValue::Integer(1),
                SqlValue::Text("{\"k\":1}".into())
            ]
        );
    }
}
