//! OTLP/JSON encoding of span trees.
//!
//! Mirrors the `ExportTraceServiceRequest` JSON mapping: camelCase field
//! names, hex-encoded ids, and 64-bit integers encoded as strings.

use agentspan_core::{AttributeValue, Span, SpanKind, SpanTree};
use serde::{Deserialize, Serialize};

use crate::key::ExportKey;

const SCOPE_NAME: &str = "agentspan";

/// OTLP span kinds.
const SPAN_KIND_INTERNAL: i32 = 1;
const SPAN_KIND_CLIENT: i32 = 3;

/// OTLP status codes.
const STATUS_UNSET: i32 = 0;
const STATUS_ERROR: i32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportTraceServiceRequest {
    pub resource_spans: Vec<ResourceSpans>,
}

impl ExportTraceServiceRequest {
    pub fn span_count(&self) -> usize {
        self.resource_spans
            .iter()
            .flat_map(|r| &r.scope_spans)
            .map(|s| s.spans.len())
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpans {
    pub resource: Resource,
    pub scope_spans: Vec<ScopeSpans>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeSpans {
    pub scope: InstrumentationScope,
    pub spans: Vec<OtlpSpan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentationScope {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtlpSpan {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub name: String,
    pub kind: i32,
    pub start_time_unix_nano: String,
    pub end_time_unix_nano: String,
    pub attributes: Vec<KeyValue>,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: AnyValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnyValue {
    StringValue(String),
    /// int64 travels as a decimal string in OTLP/JSON.
    IntValue(String),
    DoubleValue(f64),
    BoolValue(bool),
}

impl From<&AttributeValue> for AnyValue {
    fn from(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::Str(s) => AnyValue::StringValue(s.clone()),
            AttributeValue::Int(i) => AnyValue::IntValue(i.to_string()),
            AttributeValue::Float(f) => AnyValue::DoubleValue(*f),
            AttributeValue::Bool(b) => AnyValue::BoolValue(*b),
        }
    }
}

fn kv(key: &str, value: AnyValue) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value,
    }
}

/// Resource attributes attached to every export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub service_name: String,
    pub environment: String,
}

impl Default for ResourceInfo {
    fn default() -> Self {
        Self {
            service_name: "agentspan".to_string(),
            environment: "default".to_string(),
        }
    }
}

impl ResourceInfo {
    fn to_resource(&self) -> Resource {
        Resource {
            attributes: vec![
                kv("service.name", AnyValue::StringValue(self.service_name.clone())),
                kv(
                    "deployment.environment",
                    AnyValue::StringValue(self.environment.clone()),
                ),
            ],
        }
    }
}

/// Encodes one span of `tree` under the ids derived from `key`.
pub fn encode_span(key: &ExportKey, span: &Span) -> OtlpSpan {
    let mut attributes: Vec<KeyValue> = span
        .attributes
        .iter()
        .map(|(k, v)| kv(k, v.into()))
        .collect();
    attributes.push(kv(
        "agentspan.span.kind",
        AnyValue::StringValue(span.kind.as_str().to_string()),
    ));

    let status = if span.errored {
        Status {
            code: STATUS_ERROR,
            message: span
                .attr("error.message")
                .and_then(AttributeValue::as_str)
                .map(str::to_string),
        }
    } else {
        Status {
            code: STATUS_UNSET,
            message: None,
        }
    };

    OtlpSpan {
        trace_id: key.trace_id(),
        span_id: key.span_id(span.id),
        parent_span_id: span.parent.map(|p| key.span_id(p)),
        name: span.name.clone(),
        kind: match span.kind {
            SpanKind::LlmCall | SpanKind::Retrieval => SPAN_KIND_CLIENT,
            _ => SPAN_KIND_INTERNAL,
        },
        start_time_unix_nano: nanos(span.start_time),
        end_time_unix_nano: nanos(span.end_time),
        attributes,
        status,
    }
}

/// Splits `tree` into requests of at most `batch_size` spans each, in tree
/// order, so a parent is always sent no later than its children.
pub fn encode_batches(
    key: &ExportKey,
    tree: &SpanTree,
    resource: &ResourceInfo,
    batch_size: usize,
) -> Vec<ExportTraceServiceRequest> {
    tree.spans()
        .chunks(batch_size.max(1))
        .map(|chunk| ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                resource: resource.to_resource(),
                scope_spans: vec![ScopeSpans {
                    scope: InstrumentationScope {
                        name: SCOPE_NAME.to_string(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                    },
                    spans: chunk.iter().map(|s| encode_span(key, s)).collect(),
                }],
            }],
        })
        .collect()
}

fn nanos(t: chrono::DateTime<chrono::Utc>) -> String {
    t.timestamp_nanos_opt().unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentspan_core::{Attributes, SpanId};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn span(id: usize, parent: Option<usize>, kind: SpanKind, errored: bool) -> Span {
        let t = Utc.timestamp_opt(1_700_000_000, 500).unwrap();
        let mut attributes = Attributes::new();
        attributes.insert("gen_ai.usage.input_tokens".into(), 12i64.into());
        if errored {
            attributes.insert("error.message".into(), "boom".into());
        }
        Span {
            id: SpanId(id),
            parent: parent.map(SpanId),
            name: format!("span-{id}"),
            kind,
            start_time: t,
            end_time: t,
            attributes,
            errored,
        }
    }

    fn tree() -> SpanTree {
        SpanTree::new(vec![
            span(0, None, SpanKind::Root, true),
            span(1, Some(0), SpanKind::LlmCall, true),
            span(2, Some(1), SpanKind::Error, true),
            span(3, Some(0), SpanKind::Guardrail, false),
            span(4, Some(0), SpanKind::Unknown, false),
        ])
        .unwrap()
    }

    #[test]
    fn test_encode_span_json_shape() {
        let tree = tree();
        let key = ExportKey::derive("job-1", &tree);
        let encoded = encode_span(&key, tree.get(SpanId(1)).unwrap());
        let value = serde_json::to_value(&encoded).unwrap();

        assert_eq!(value["traceId"], json!(key.trace_id()));
        assert_eq!(value["parentSpanId"], json!(key.span_id(SpanId::ROOT)));
        assert_eq!(value["startTimeUnixNano"], json!("1700000000000000500"));
        assert_eq!(value["kind"], json!(SPAN_KIND_CLIENT));
        assert_eq!(value["status"], json!({"code": 2, "message": "boom"}));
        assert!(value["attributes"]
            .as_array()
            .unwrap()
            .contains(&json!({"key": "gen_ai.usage.input_tokens", "value": {"intValue": "12"}})));
    }

    #[test]
    fn test_root_has_no_parent() {
        let tree = tree();
        let key = ExportKey::derive("job-1", &tree);
        let root = serde_json::to_value(encode_span(&key, tree.root())).unwrap();
        assert!(root.get("parentSpanId").is_none());

        let healthy = serde_json::to_value(encode_span(&key, tree.get(SpanId(3)).unwrap())).unwrap();
        assert_eq!(healthy["status"], json!({"code": 0}));
    }

    #[test]
    fn test_batches_preserve_tree_order() {
        let tree = tree();
        let key = ExportKey::derive("job-1", &tree);
        let batches = encode_batches(&key, &tree, &ResourceInfo::default(), 2);

        assert_eq!(batches.len(), 3);
        assert_eq!(
            batches.iter().map(|b| b.span_count()).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
        let first = &batches[0].resource_spans[0].scope_spans[0].spans[0];
        assert_eq!(first.span_id, key.span_id(SpanId::ROOT));

        let resource = serde_json::to_value(&batches[0].resource_spans[0].resource).unwrap();
        assert_eq!(
            resource["attributes"][0],
            json!({"key": "service.name", "value": {"stringValue": "agentspan"}})
        );
    }
}
