//! Idempotent export identity.

use agentspan_core::{SpanId, SpanTree};
use chrono::SecondsFormat;
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable identity of one job's exported tree.
///
/// Derived from the job id and the root span's name and start time, so every
/// export of a job, redeliveries included, lands on the same trace id. Span
/// ids follow from the key and the span's position in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportKey {
    digest: [u8; 32],
}

impl ExportKey {
    pub fn derive(job_id: &str, tree: &SpanTree) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"agentspan/export/v1\0");
        let root = tree.root();
        hasher.update(job_id.as_bytes());
        hasher.update(b"\0");
        hasher.update(root.name.as_bytes());
        hasher.update(b"\0");
        hasher.update(
            root.start_time
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .as_bytes(),
        );
        Self {
            digest: hasher.finalize().into(),
        }
    }

    /// Hex form, sent as the idempotency key.
    pub fn as_hex(&self) -> String {
        hex::encode(self.digest)
    }

    /// 16-byte OTLP trace id, hex encoded.
    pub fn trace_id(&self) -> String {
        hex::encode(&self.digest[..16])
    }

    /// 8-byte OTLP span id for a span of the tree, hex encoded.
    pub fn span_id(&self, span: SpanId) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.digest);
        hasher.update((span.index() as u64).to_be_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }
}

impl fmt::Display for ExportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentspan_core::{Attributes, Span, SpanKind};
    use chrono::{TimeZone, Utc};

    fn span(id: usize, parent: Option<SpanId>, name: &str) -> Span {
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        Span {
            id: SpanId(id),
            parent,
            name: name.to_string(),
            kind: if parent.is_none() {
                SpanKind::Root
            } else {
                SpanKind::Guardrail
            },
            start_time: t,
            end_time: t,
            attributes: Attributes::new(),
            errored: false,
        }
    }

    fn tree(name: &str) -> SpanTree {
        SpanTree::new(vec![span(0, None, name)]).unwrap()
    }

    #[test]
    fn test_key_is_stable() {
        let a = ExportKey::derive("job-1", &tree("root"));
        let b = ExportKey::derive("job-1", &tree("root"));
        assert_eq!(a, b);
        assert_eq!(a.trace_id(), b.trace_id());
        assert_eq!(a.span_id(SpanId(3)), b.span_id(SpanId(3)));
        assert_eq!(a.as_hex().len(), 64);
        assert_eq!(a.trace_id().len(), 32);
        assert_eq!(a.span_id(SpanId::ROOT).len(), 16);
    }

    #[test]
    fn test_key_depends_on_job_and_tree() {
        let base = ExportKey::derive("job-1", &tree("root"));
        assert_ne!(base, ExportKey::derive("job-2", &tree("root")));
        assert_ne!(base, ExportKey::derive("job-1", &tree("other")));
        assert_ne!(base.span_id(SpanId(1)), base.span_id(SpanId(2)));
    }

    #[test]
    fn test_key_ignores_tree_shape_below_root() {
        let flat = SpanTree::new(vec![
            span(0, None, "root"),
            span(1, Some(SpanId::ROOT), "step"),
            span(2, Some(SpanId::ROOT), "guardrail"),
        ])
        .unwrap();
        let nested = SpanTree::new(vec![
            span(0, None, "root"),
            span(1, Some(SpanId::ROOT), "step"),
            span(2, Some(SpanId(1)), "guardrail"),
        ])
        .unwrap();

        let a = ExportKey::derive("job-1", &flat);
        let b = ExportKey::derive("job-1", &nested);
        assert_eq!(a, b);
        assert_eq!(a.trace_id(), b.trace_id());
    }
}
