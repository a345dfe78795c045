//! Incoming trace batch types.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Kind of a raw trace event.
///
/// Classification happens once, when the event is deserialized. Anything the
/// converter does not understand lands in [`TraceKind::Unknown`] together with
/// the key it arrived under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TraceKind {
    Orchestration,
    PreProcessing,
    PostProcessing,
    Guardrail,
    Failure,
    /// Unrecognized kind. Holds the raw key, or an empty string when the
    /// `trace` object did not carry exactly one key.
    Unknown(String),
}

impl TraceKind {
    /// Maps a wire key (`orchestrationTrace`, ...) to a kind.
    pub fn from_key(key: &str) -> Self {
        match key {
            "orchestrationTrace" => TraceKind::Orchestration,
            "preProcessingTrace" => TraceKind::PreProcessing,
            "postProcessingTrace" => TraceKind::PostProcessing,
            "guardrailTrace" => TraceKind::Guardrail,
            "failureTrace" => TraceKind::Failure,
            other => TraceKind::Unknown(other.to_string()),
        }
    }

    /// The wire key this kind is serialized under.
    pub fn key(&self) -> &str {
        match self {
            TraceKind::Orchestration => "orchestrationTrace",
            TraceKind::PreProcessing => "preProcessingTrace",
            TraceKind::PostProcessing => "postProcessingTrace",
            TraceKind::Guardrail => "guardrailTrace",
            TraceKind::Failure => "failureTrace",
            TraceKind::Unknown(key) => key,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TraceKind::Orchestration => "orchestration",
            TraceKind::PreProcessing => "pre_processing",
            TraceKind::PostProcessing => "post_processing",
            TraceKind::Guardrail => "guardrail",
            TraceKind::Failure => "failure",
            TraceKind::Unknown(_) => "unknown",
        }
    }
}

/// One raw element of an agent's trace array.
///
/// On the wire this is `{"eventTime": "...", "trace": {"<kind>Trace": {...}}}`.
/// The timestamp is kept verbatim; parsing it is the converter's job so that a
/// malformed value surfaces as a conversion failure on the job rather than a
/// rejected request.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub kind: TraceKind,
    pub payload: Value,
    pub event_time: Option<String>,
}

impl TraceEvent {
    pub fn new(kind: TraceKind, payload: Value, event_time: impl Into<String>) -> Self {
        Self {
            kind,
            payload,
            event_time: Some(event_time.into()),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawTraceEvent {
    #[serde(rename = "eventTime", default, skip_serializing_if = "Option::is_none")]
    event_time: Option<String>,
    #[serde(default)]
    trace: Option<Map<String, Value>>,
}

impl<'de> Deserialize<'de> for TraceEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawTraceEvent::deserialize(deserializer)?;
        let trace = raw.trace.unwrap_or_default();

        let (kind, payload) = if trace.len() == 1 {
            let (key, payload) = trace.into_iter().next().unwrap_or_default();
            (TraceKind::from_key(&key), payload)
        } else {
            (TraceKind::Unknown(String::new()), Value::Object(trace))
        };

        Ok(TraceEvent {
            kind,
            payload,
            event_time: raw.event_time,
        })
    }
}

impl Serialize for TraceEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let trace = match (&self.kind, &self.payload) {
            (TraceKind::Unknown(key), Value::Object(map)) if key.is_empty() => map.clone(),
            (kind, payload) => {
                let mut map = Map::new();
                map.insert(kind.key().to_string(), payload.clone());
                map
            }
        };

        RawTraceEvent {
            event_time: self.event_time.clone(),
            trace: Some(trace),
        }
        .serialize(serializer)
    }
}

/// Everything submitted for one agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceBatch {
    /// The prompt sent to the agent.
    pub input_text: String,
    /// The response the agent returned.
    #[serde(default)]
    pub output_text: String,
    pub agent_id: String,
    pub agent_alias_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Caller-measured duration of the whole invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    /// Caller-supplied trace identifier, recorded on the root span.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub streaming: bool,
    /// Raw events in submission order. Order is not trusted.
    #[serde(default)]
    pub traces: Vec<TraceEvent>,
}

impl TraceBatch {
    /// Creates a batch with no events and no optional metadata.
    pub fn new(
        agent_id: impl Into<String>,
        agent_alias_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            input_text: String::new(),
            output_text: String::new(),
            agent_id: agent_id.into(),
            agent_alias_id: agent_alias_id.into(),
            session_id: session_id.into(),
            user_id: None,
            model_id: None,
            tags: BTreeSet::new(),
            duration_ms: None,
            trace_id: None,
            streaming: false,
            traces: Vec::new(),
        }
    }

    pub fn with_io(mut self, input: impl Into<String>, output: impl Into<String>) -> Self {
        self.input_text = input.into();
        self.output_text = output.into();
        self
    }

    pub fn with_event(mut self, event: TraceEvent) -> Self {
        self.traces.push(event);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_classified_by_trace_key() {
        let event: TraceEvent = serde_json::from_value(json!({
            "eventTime": "2024-05-01T10:00:00Z",
            "agentId": "A1",
            "trace": {"guardrailTrace": {"action": "NONE"}}
        }))
        .unwrap();

        assert_eq!(event.kind, TraceKind::Guardrail);
        assert_eq!(event.payload, json!({"action": "NONE"}));
        assert_eq!(event.event_time.as_deref(), Some("2024-05-01T10:00:00Z"));
    }

    #[test]
    fn test_unrecognized_key_is_unknown() {
        let event: TraceEvent = serde_json::from_value(json!({
            "eventTime": "2024-05-01T10:00:00Z",
            "trace": {"routingClassifierTrace": {"x": 1}}
        }))
        .unwrap();

        assert_eq!(event.kind, TraceKind::Unknown("routingClassifierTrace".into()));
        assert_eq!(event.payload, json!({"x": 1}));
    }

    #[test]
    fn test_ambiguous_trace_object_keeps_whole_payload() {
        let value = json!({
            "eventTime": "2024-05-01T10:00:00Z",
            "trace": {"a": 1, "b": 2}
        });
        let event: TraceEvent = serde_json::from_value(value.clone()).unwrap();

        assert_eq!(event.kind, TraceKind::Unknown(String::new()));
        assert_eq!(event.payload, json!({"a": 1, "b": 2}));
        assert_eq!(serde_json::to_value(&event).unwrap(), value);
    }

    #[test]
    fn test_missing_trace_and_time() {
        let event: TraceEvent = serde_json::from_value(json!({})).unwrap();
        assert_eq!(event.kind, TraceKind::Unknown(String::new()));
        assert!(event.event_time.is_none());
    }

    #[test]
    fn test_batch_defaults() {
        let batch: TraceBatch = serde_json::from_value(json!({
            "input_text": "hi",
            "agent_id": "A1",
            "agent_alias_id": "AL1",
            "session_id": "s1",
            "tags": ["b", "a", "a"]
        }))
        .unwrap();

        assert_eq!(batch.output_text, "");
        assert!(batch.traces.is_empty());
        assert!(batch.user_id.is_none());
        assert_eq!(batch.tags.iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
