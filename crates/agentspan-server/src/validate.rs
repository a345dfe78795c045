//! Field-level validation of incoming trace batches.
//!
//! The body is checked as raw JSON first so that every problem is reported at
//! once, with a path like `traces[3].eventTime`, instead of serde's first
//! error only.

use agentspan_core::TraceBatch;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

const REQUIRED_IDS: [&str; 3] = ["agent_id", "agent_alias_id", "session_id"];
const OPTIONAL_STRINGS: [&str; 4] = ["output_text", "user_id", "model_id", "trace_id"];
/// One week.
const MAX_DURATION_MS: f64 = 7.0 * 24.0 * 3600.0 * 1000.0;

/// Validates `body` and decodes it into a [`TraceBatch`].
pub fn validate_batch(mut body: Value) -> Result<TraceBatch, Vec<FieldError>> {
    let Some(obj) = body.as_object() else {
        return Err(vec![FieldError::new("body", "expected a JSON object")]);
    };

    let mut errors = Vec::new();

    for field in REQUIRED_IDS {
        match obj.get(field) {
            None | Some(Value::Null) => errors.push(FieldError::new(field, "is required")),
            Some(Value::String(s)) if s.trim().is_empty() => {
                errors.push(FieldError::new(field, "must not be empty"))
            }
            Some(Value::String(_)) => {}
            Some(_) => errors.push(FieldError::new(field, "must be a string")),
        }
    }

    match obj.get("input_text") {
        Some(Value::String(_)) => {}
        None | Some(Value::Null) => errors.push(FieldError::new("input_text", "is required")),
        Some(_) => errors.push(FieldError::new("input_text", "must be a string")),
    }

    for field in OPTIONAL_STRINGS {
        if !matches!(obj.get(field), None | Some(Value::Null | Value::String(_))) {
            errors.push(FieldError::new(field, "must be a string"));
        }
    }

    if !matches!(obj.get("streaming"), None | Some(Value::Null | Value::Bool(_))) {
        errors.push(FieldError::new("streaming", "must be a boolean"));
    }

    match obj.get("duration_ms") {
        None | Some(Value::Null) => {}
        Some(Value::Number(n)) if n.as_f64().is_some_and(|ms| ms > MAX_DURATION_MS) => errors.push(
            FieldError::new("duration_ms", format!("must not exceed {MAX_DURATION_MS}")),
        ),
        Some(Value::Number(n)) if n.as_f64().is_some_and(|ms| ms >= 0.0) => {}
        Some(_) => errors.push(FieldError::new(
            "duration_ms",
            "must be a non-negative number",
        )),
    }

    match obj.get("tags") {
        None | Some(Value::Null) => {}
        Some(Value::Array(tags)) => {
            for (i, tag) in tags.iter().enumerate() {
                if !tag.is_string() {
                    errors.push(FieldError::new(format!("tags[{i}]"), "must be a string"));
                }
            }
        }
        Some(_) => errors.push(FieldError::new("tags", "must be an array of strings")),
    }

    match obj.get("traces") {
        Some(Value::Array(traces)) => {
            for (i, event) in traces.iter().enumerate() {
                validate_event(i, event, &mut errors);
            }
        }
        None | Some(Value::Null) => errors.push(FieldError::new("traces", "is required")),
        Some(_) => errors.push(FieldError::new("traces", "must be an array")),
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    // Explicit nulls stand for "absent".
    if let Value::Object(obj) = &mut body {
        obj.retain(|_, v| !v.is_null());
    }
    serde_json::from_value(body).map_err(|e| vec![FieldError::new("body", e.to_string())])
}

fn validate_event(index: usize, event: &Value, errors: &mut Vec<FieldError>) {
    let Some(event) = event.as_object() else {
        errors.push(FieldError::new(
            format!("traces[{index}]"),
            "must be an object",
        ));
        return;
    };

    if !matches!(event.get("eventTime"), None | Some(Value::Null | Value::String(_))) {
        errors.push(FieldError::new(
            format!("traces[{index}].eventTime"),
            "must be a string",
        ));
    }

    if !matches!(event.get("trace"), None | Some(Value::Null | Value::Object(_))) {
        errors.push(FieldError::new(
            format!("traces[{index}].trace"),
            "must be an object",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid() -> Value {
        json!({
            "input_text": "hi",
            "agent_id": "AGENT1",
            "agent_alias_id": "ALIAS1",
            "session_id": "session-1",
            "tags": ["prod"],
            "traces": [
                {"eventTime": "2024-05-01T10:00:00Z", "trace": {"orchestrationTrace": {}}},
                {"trace": {"somethingNew": {}}}
            ]
        })
    }

    fn fields(errors: &[FieldError]) -> Vec<&str> {
        errors.iter().map(|e| e.field.as_str()).collect()
    }

    #[test]
    fn test_valid_batch_decodes() {
        let batch = validate_batch(valid()).unwrap();
        assert_eq!(batch.agent_id, "AGENT1");
        assert_eq!(batch.traces.len(), 2);
        assert!(batch.tags.contains("prod"));
    }

    #[test]
    fn test_reports_every_missing_field() {
        let errors = validate_batch(json!({"agent_id": "", "traces": "nope"})).unwrap_err();
        assert_eq!(
            fields(&errors),
            vec!["agent_id", "agent_alias_id", "session_id", "input_text", "traces"]
        );
        assert_eq!(errors[0].message, "must not be empty");
    }

    #[test]
    fn test_reports_malformed_trace_entries_by_index() {
        let mut body = valid();
        body["traces"] = json!([
            {"eventTime": "2024-05-01T10:00:00Z", "trace": {}},
            "not an object",
            {"eventTime": 17, "trace": []}
        ]);

        let errors = validate_batch(body).unwrap_err();
        assert_eq!(
            fields(&errors),
            vec!["traces[1]", "traces[2].eventTime", "traces[2].trace"]
        );
    }

    #[test]
    fn test_unparsable_event_time_is_accepted() {
        let mut body = valid();
        body["traces"] = json!([{"eventTime": "garbage", "trace": {"failureTrace": {}}}]);
        assert!(validate_batch(body).is_ok());
    }

    #[test]
    fn test_optional_field_types() {
        let mut body = valid();
        body["streaming"] = json!("yes");
        body["duration_ms"] = json!(-1);
        body["tags"] = json!(["ok", 3]);
        body["user_id"] = json!(42);

        let errors = validate_batch(body).unwrap_err();
        assert_eq!(
            fields(&errors),
            vec!["user_id", "streaming", "duration_ms", "tags[1]"]
        );
    }

    #[test]
    fn test_duration_is_bounded() {
        let mut body = valid();
        body["duration_ms"] = json!(1e300);
        let errors = validate_batch(body).unwrap_err();
        assert_eq!(fields(&errors), vec!["duration_ms"]);

        let mut body = valid();
        body["duration_ms"] = json!(MAX_DURATION_MS);
        assert_eq!(validate_batch(body).unwrap().duration_ms, Some(MAX_DURATION_MS));
    }

    #[test]
    fn test_null_optionals_are_absent() {
        let mut body = valid();
        body["tags"] = Value::Null;
        body["output_text"] = Value::Null;
        body["streaming"] = Value::Null;

        let batch = validate_batch(body).unwrap();
        assert!(batch.tags.is_empty());
        assert_eq!(batch.output_text, "");
        assert!(!batch.streaming);
    }

    #[test]
    fn test_non_object_body() {
        let errors = validate_batch(json!([1, 2])).unwrap_err();
        assert_eq!(fields(&errors), vec!["body"]);
    }
}
