//! Converted span tree types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Index of a span within its [`SpanTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpanId(pub usize);

impl SpanId {
    pub const ROOT: SpanId = SpanId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a span represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpanKind {
    /// Synthetic span covering the whole invocation.
    Root,
    LlmCall,
    PreProcessing,
    PostProcessing,
    Guardrail,
    Error,
    /// Action group or code interpreter call inside an orchestration step.
    Tool,
    /// Knowledge base lookup inside an orchestration step.
    Retrieval,
    /// Model rationale or final response inside an orchestration step.
    Reasoning,
    Unknown,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Root => "root",
            SpanKind::LlmCall => "llm-call",
            SpanKind::PreProcessing => "pre-processing",
            SpanKind::PostProcessing => "post-processing",
            SpanKind::Guardrail => "guardrail",
            SpanKind::Error => "error",
            SpanKind::Tool => "tool",
            SpanKind::Retrieval => "retrieval",
            SpanKind::Reasoning => "reasoning",
            SpanKind::Unknown => "unknown",
        }
    }
}

/// Scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Str(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Str(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

/// Attribute map. Ordered so serialization and hashing are deterministic.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// One node of a converted span tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub id: SpanId,
    /// Parent span. `None` only for the root.
    pub parent: Option<SpanId>,
    pub name: String,
    pub kind: SpanKind,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub attributes: Attributes,
    /// Set when this span or any descendant recorded a failure.
    pub errored: bool,
}

impl Span {
    pub fn attr(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }
}

/// Structural violations rejected by [`SpanTree::new`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("span tree is empty")]
    Empty,
    #[error("first span must be a parentless root")]
    BadRoot,
    #[error("span {index} carries id {id}")]
    IdMismatch { index: usize, id: SpanId },
    #[error("span {child} has no parent")]
    Orphan { child: SpanId },
    #[error("span {child} references parent {parent} that is not attached before it")]
    ForwardReference { child: SpanId, parent: SpanId },
    #[error("span {span} ends before it starts")]
    NegativeDuration { span: SpanId },
}

/// An immutable, acyclic span tree for one agent invocation.
///
/// Spans are stored in attachment order. A parent always precedes its
/// children, which is what makes the tree acyclic by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanTree {
    spans: Vec<Span>,
}

impl SpanTree {
    /// Validates and seals a list of spans.
    pub fn new(spans: Vec<Span>) -> Result<Self, TreeError> {
        let root = spans.first().ok_or(TreeError::Empty)?;
        if root.parent.is_some() || root.id != SpanId::ROOT {
            return Err(TreeError::BadRoot);
        }

        for (index, span) in spans.iter().enumerate() {
            if span.id.index() != index {
                return Err(TreeError::IdMismatch { index, id: span.id });
            }
            if span.end_time < span.start_time {
                return Err(TreeError::NegativeDuration { span: span.id });
            }
            if index == 0 {
                continue;
            }
            let parent = span.parent.ok_or(TreeError::Orphan { child: span.id })?;
            if parent.index() >= index {
                return Err(TreeError::ForwardReference {
                    child: span.id,
                    parent,
                });
            }
        }

        Ok(Self { spans })
    }

    pub fn root(&self) -> &Span {
        &self.spans[0]
    }

    pub fn get(&self, id: SpanId) -> Option<&Span> {
        self.spans.get(id.index())
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Direct children of `id`, in attachment order.
    pub fn children(&self, id: SpanId) -> impl Iterator<Item = &Span> + '_ {
        self.spans.iter().filter(move |s| s.parent == Some(id))
    }

    pub fn errored_count(&self) -> usize {
        self.spans.iter().filter(|s| s.errored).count()
    }

    /// Content hash of the whole tree, hex encoded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for span in &self.spans {
            // Serializing plain data with string keys cannot fail.
            let bytes = serde_json::to_vec(span).unwrap_or_default();
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(&bytes);
        }
        hex::encode(hasher.finalize())
    }

    pub fn summary(&self) -> SpanTreeSummary {
        let mut kinds = BTreeMap::new();
        let mut input_tokens = None;
        let mut output_tokens = None;

        for span in &self.spans {
            *kinds.entry(span.kind.as_str().to_string()).or_insert(0) += 1;
            if let Some(n) = span.attr("gen_ai.usage.input_tokens").and_then(|v| v.as_int()) {
                *input_tokens.get_or_insert(0) += n;
            }
            if let Some(n) = span.attr("gen_ai.usage.output_tokens").and_then(|v| v.as_int()) {
                *output_tokens.get_or_insert(0) += n;
            }
        }

        let root = self.root();
        SpanTreeSummary {
            root_name: root.name.clone(),
            span_count: self.spans.len(),
            errored: root.errored,
            error_span_count: self.errored_count(),
            kinds,
            input_tokens,
            output_tokens,
            start_time: root.start_time,
            end_time: root.end_time,
        }
    }
}

/// Compact description of a span tree, stored on successful jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanTreeSummary {
    pub root_name: String,
    pub span_count: usize,
    /// Whether the root carries the error flag.
    pub errored: bool,
    /// Number of spans carrying the error flag, root included.
    pub error_span_count: usize,
    /// Span counts keyed by kind.
    pub kinds: BTreeMap<String, usize>,
    /// Summed input tokens; absent when no span reported usage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<i64>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}
